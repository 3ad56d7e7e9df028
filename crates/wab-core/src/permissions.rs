use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::{domain::Jid, messaging::port::GroupDirectory};

/// Decides whether `sender` may run a command in `chat`.
#[async_trait]
pub trait PermissionPolicy: Send + Sync {
    async fn is_authorized(&self, sender: &Jid, chat: &Jid, require_admin: bool) -> bool;
}

/// Owners always pass. Admin-gated commands additionally admit group admins.
pub struct OwnerPolicy {
    owners: Vec<Jid>,
    directory: Option<Arc<dyn GroupDirectory>>,
}

impl OwnerPolicy {
    pub fn new(owners: Vec<Jid>, directory: Option<Arc<dyn GroupDirectory>>) -> Self {
        Self { owners, directory }
    }

    pub fn is_owner(&self, sender: &Jid) -> bool {
        self.owners.iter().any(|o| o.same_user(sender))
    }
}

#[async_trait]
impl PermissionPolicy for OwnerPolicy {
    async fn is_authorized(&self, sender: &Jid, chat: &Jid, require_admin: bool) -> bool {
        if self.is_owner(sender) {
            return true;
        }
        if !require_admin {
            return true;
        }
        if !chat.is_group() {
            return false;
        }
        let Some(directory) = self.directory.as_ref() else {
            return false;
        };

        match directory.group_admins(chat).await {
            Ok(admins) => admins.iter().any(|a| a.same_user(sender)),
            Err(e) => {
                warn!(chat = %chat, sender = %sender, "group admin lookup failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::Error, Result};

    struct FakeDirectory {
        admins: Vec<Jid>,
        fail: bool,
    }

    #[async_trait]
    impl GroupDirectory for FakeDirectory {
        async fn group_admins(&self, _group: &Jid) -> Result<Vec<Jid>> {
            if self.fail {
                return Err(Error::Transport("timed out".into()));
            }
            Ok(self.admins.clone())
        }
    }

    fn policy(fail: bool) -> OwnerPolicy {
        OwnerPolicy::new(
            vec![Jid::new("1555@s.whatsapp.net")],
            Some(Arc::new(FakeDirectory {
                admins: vec![Jid::new("1777@s.whatsapp.net")],
                fail,
            })),
        )
    }

    #[tokio::test]
    async fn owner_passes_everywhere_including_other_devices() {
        let p = policy(false);
        let owner_device = Jid::new("1555:7@s.whatsapp.net");
        assert!(p.is_authorized(&owner_device, &owner_device, true).await);
        assert!(
            p.is_authorized(&owner_device, &Jid::new("123-456@g.us"), true)
                .await
        );
    }

    #[tokio::test]
    async fn non_admin_commands_are_open() {
        let p = policy(false);
        let stranger = Jid::new("1999@s.whatsapp.net");
        assert!(p.is_authorized(&stranger, &stranger, false).await);
    }

    #[tokio::test]
    async fn group_admins_pass_only_in_groups() {
        let p = policy(false);
        let admin = Jid::new("1777@s.whatsapp.net");
        let stranger = Jid::new("1999@s.whatsapp.net");
        let group = Jid::new("123-456@g.us");

        assert!(p.is_authorized(&admin, &group, true).await);
        assert!(!p.is_authorized(&stranger, &group, true).await);
        // No group context in a direct chat.
        assert!(!p.is_authorized(&admin, &admin, true).await);
    }

    #[tokio::test]
    async fn lookup_failure_denies() {
        let p = policy(true);
        let admin = Jid::new("1777@s.whatsapp.net");
        assert!(!p.is_authorized(&admin, &Jid::new("123-456@g.us"), true).await);
    }
}
