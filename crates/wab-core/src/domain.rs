use std::fmt;

use serde::{Deserialize, Serialize};

const USER_SERVER: &str = "s.whatsapp.net";
const GROUP_SERVER: &str = "g.us";

/// Messaging address (JID), e.g. `15551234567@s.whatsapp.net` or `1203...@g.us`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(pub String);

impl Jid {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Build a user JID from a phone number; non-digits are stripped.
    ///
    /// Values that already contain a server part are kept as-is.
    pub fn from_phone(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.contains('@') {
            return Some(Self(raw.to_string()));
        }
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return None;
        }
        Some(Self(format!("{digits}@{USER_SERVER}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn server(&self) -> &str {
        self.0.split_once('@').map(|(_, s)| s).unwrap_or("")
    }

    pub fn is_group(&self) -> bool {
        self.server() == GROUP_SERVER
    }

    /// User part without the device suffix (`1555:12@s.whatsapp.net` -> `1555`).
    pub fn user(&self) -> &str {
        let local = self.0.split_once('@').map(|(u, _)| u).unwrap_or(&self.0);
        local.split_once(':').map(|(u, _)| u).unwrap_or(local)
    }

    /// Same account, ignoring device suffixes.
    pub fn same_user(&self, other: &Jid) -> bool {
        !self.user().is_empty() && self.user() == other.user()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Jid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Provider message id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_numbers_normalise_to_user_jids() {
        assert_eq!(
            Jid::from_phone("+1 (555) 123-4567"),
            Some(Jid::new("15551234567@s.whatsapp.net"))
        );
        assert_eq!(
            Jid::from_phone("1203630@g.us"),
            Some(Jid::new("1203630@g.us"))
        );
        assert_eq!(Jid::from_phone("n/a"), None);
    }

    #[test]
    fn device_suffix_is_ignored_when_comparing_users() {
        let a = Jid::new("15551234567:12@s.whatsapp.net");
        let b = Jid::new("15551234567@s.whatsapp.net");
        assert_eq!(a.user(), "15551234567");
        assert!(a.same_user(&b));
        assert!(!a.same_user(&Jid::new("1999@s.whatsapp.net")));
    }

    #[test]
    fn detects_groups() {
        assert!(Jid::new("1203630@g.us").is_group());
        assert!(!Jid::new("1555@s.whatsapp.net").is_group());
    }
}
