use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    credentials::Credentials,
    domain::Jid,
    messaging::types::{OutboundPayload, TransportEvent},
    Result,
};

/// Outbound half of the transport. The outbound queue is its only production caller.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, destination: &Jid, payload: &OutboundPayload) -> Result<()>;
}

/// Real-time transport to the messaging provider.
///
/// `connect` starts a new connection attempt and hands back its event stream.
/// Starting a new attempt supersedes (and closes) the previous one; dropping the
/// receiver is how the supervisor stops listening to a connection.
#[async_trait]
pub trait Transport: MessageSender {
    async fn connect(
        &self,
        credentials: Option<Credentials>,
    ) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Close the current connection, if any. Must not log the session out.
    async fn disconnect(&self);
}

/// Group metadata lookup used by the permission policy.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn group_admins(&self, group: &Jid) -> Result<Vec<Jid>>;
}
