use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex},
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use wab_core::{
    credentials::Credentials,
    domain::Jid,
    messaging::{
        port::{GroupDirectory, MessageSender, Transport},
        types::{CloseReason, OutboundPayload, TransportEvent},
    },
    Error, Result,
};

use crate::types::{classify_disconnect, GatewayMessage, SidecarMessage};

const EVENT_BUFFER: usize = 256;

type Pending = Arc<StdMutex<HashMap<String, oneshot::Sender<SidecarMessage>>>>;
type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug)]
pub struct SidecarConfig {
    /// `ws://` or `wss://` endpoint of the sidecar.
    pub url: String,
    /// Bound for the WebSocket handshake and for each request/reply exchange.
    pub request_timeout: Duration,
}

/// One live WebSocket to the sidecar.
struct Link {
    write_tx: mpsc::UnboundedSender<GatewayMessage>,
    pending: Pending,
}

/// [`Transport`] backed by a protocol sidecar reachable over WebSocket.
///
/// The sidecar owns the provider's wire protocol; this side only exchanges
/// JSON frames (see [`crate::types`]).
pub struct SidecarTransport {
    cfg: SidecarConfig,
    link: Mutex<Option<Link>>,
}

impl SidecarTransport {
    pub fn new(cfg: SidecarConfig) -> Self {
        Self {
            cfg,
            link: Mutex::new(None),
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(String) -> GatewayMessage,
    ) -> Result<SidecarMessage> {
        let (write_tx, pending) = {
            let link = self.link.lock().await;
            let link = link.as_ref().ok_or(Error::NotConnected)?;
            (link.write_tx.clone(), link.pending.clone())
        };

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&pending).insert(id.clone(), tx);

        if write_tx.send(build(id.clone())).is_err() {
            lock(&pending).remove(&id);
            return Err(Error::NotConnected);
        }

        match timeout(self.cfg.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Transport(
                "connection closed before the sidecar replied".to_string(),
            )),
            Err(_) => {
                lock(&pending).remove(&id);
                Err(Error::Transport(format!(
                    "sidecar did not reply within {}ms",
                    self.cfg.request_timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl MessageSender for SidecarTransport {
    async fn send(&self, destination: &Jid, payload: &OutboundPayload) -> Result<()> {
        let reply = self
            .request(|request_id| GatewayMessage::Send {
                request_id,
                to: destination.as_str().to_string(),
                payload: payload.clone(),
            })
            .await?;

        match reply {
            SidecarMessage::SendResult { success: true, .. } => Ok(()),
            SidecarMessage::SendResult { error, .. } => Err(Error::Transport(
                error.unwrap_or_else(|| "send rejected by sidecar".to_string()),
            )),
            other => Err(Error::Transport(format!("unexpected reply to send: {other:?}"))),
        }
    }
}

#[async_trait]
impl Transport for SidecarTransport {
    async fn connect(
        &self,
        credentials: Option<Credentials>,
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut link = self.link.lock().await;
        // Dropping the old writer makes its pump close that socket.
        if link.take().is_some() {
            debug!("replacing previous sidecar connection");
        }

        let handshake = timeout(self.cfg.request_timeout, connect_async(self.cfg.url.as_str()));
        let (socket, _response) = match handshake.await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                return Err(Error::Transport(format!(
                    "cannot reach sidecar at {}: {e}",
                    self.cfg.url
                )))
            }
            Err(_) => {
                return Err(Error::Transport(format!(
                    "sidecar handshake at {} timed out",
                    self.cfg.url
                )))
            }
        };
        info!(url = %self.cfg.url, resume = credentials.is_some(), "sidecar socket open");

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let pending: Pending = Arc::default();

        write_tx
            .send(GatewayMessage::Connect {
                creds: credentials.map(|c| c.0),
            })
            .map_err(|_| Error::NotConnected)?;

        tokio::spawn(pump(socket, write_rx, events_tx, pending.clone()));
        *link = Some(Link { write_tx, pending });
        Ok(events_rx)
    }

    async fn disconnect(&self) {
        let Some(link) = self.link.lock().await.take() else {
            return;
        };
        // Ends the session on the sidecar without logging the account out.
        let _ = link.write_tx.send(GatewayMessage::Disconnect);
        debug!("sidecar connection released");
    }
}

#[async_trait]
impl GroupDirectory for SidecarTransport {
    async fn group_admins(&self, group: &Jid) -> Result<Vec<Jid>> {
        let reply = self
            .request(|request_id| GatewayMessage::GroupAdmins {
                request_id,
                jid: group.as_str().to_string(),
            })
            .await?;

        match reply {
            SidecarMessage::GroupAdmins {
                error: Some(error), ..
            } => Err(Error::Transport(error)),
            SidecarMessage::GroupAdmins { admins, .. } => {
                Ok(admins.into_iter().map(Jid::new).collect())
            }
            other => Err(Error::Transport(format!(
                "unexpected reply to group lookup: {other:?}"
            ))),
        }
    }
}

/// Shuttle frames between one socket and the supervisor until either side goes away.
async fn pump(
    socket: Socket,
    mut write_rx: mpsc::UnboundedReceiver<GatewayMessage>,
    events: mpsc::Sender<TransportEvent>,
    pending: Pending,
) {
    let (mut sink, mut stream) = socket.split();

    let lost = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let msg = match serde_json::from_str::<SidecarMessage>(text.as_str()) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("ignoring malformed sidecar frame: {e}");
                            continue;
                        }
                    };
                    let Some(event) = translate(msg, &pending) else {
                        continue;
                    };
                    if events.send(event).await.is_err() {
                        // Supervisor stopped listening to this connection.
                        let _ = sink.send(Message::Close(None)).await;
                        break None;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        break Some(format!("websocket write failed: {e}"));
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    break Some("sidecar closed the connection".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(format!("websocket error: {e}")),
            },
            out = write_rx.recv() => match out {
                Some(msg) => {
                    let text = match serde_json::to_string(&msg) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("cannot encode sidecar frame: {e}");
                            continue;
                        }
                    };
                    let last = matches!(msg, GatewayMessage::Disconnect);
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        break Some(format!("websocket write failed: {e}"));
                    }
                    if last {
                        let _ = sink.send(Message::Close(None)).await;
                        break None;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break None;
                }
            },
        }
    };

    // Outstanding requests fail fast instead of waiting for their timeout.
    lock(&pending).clear();

    if let Some(reason) = lost {
        warn!("sidecar connection lost: {reason}");
        let _ = events
            .send(TransportEvent::Closed(CloseReason::Recoverable(reason)))
            .await;
    }
}

fn translate(msg: SidecarMessage, pending: &Pending) -> Option<TransportEvent> {
    if let Some(id) = msg.request_id().map(str::to_string) {
        match lock(pending).remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(msg);
            }
            None => debug!(request_id = %id, "reply for unknown or expired request"),
        }
        return None;
    }

    let event = match msg {
        SidecarMessage::Qr { qr } => TransportEvent::PairingCode(qr),
        SidecarMessage::Connected { jid, is_new_login } => {
            debug!(is_new_login, "sidecar reports connection open");
            TransportEvent::Opened {
                own_id: jid.map(Jid::new),
            }
        }
        SidecarMessage::Disconnected {
            status_code,
            reason,
        } => TransportEvent::Closed(classify_disconnect(status_code, reason.as_deref())),
        SidecarMessage::Credentials { creds } => {
            TransportEvent::CredentialsUpdated(Credentials(creds))
        }
        SidecarMessage::InboundMessage { message } => TransportEvent::Inbound(message),
        SidecarMessage::DecryptError { reason } => TransportEvent::Closed(
            CloseReason::SessionCorrupt(reason.unwrap_or_else(|| "decryption failed".to_string())),
        ),
        SidecarMessage::SendResult { .. } | SidecarMessage::GroupAdmins { .. } => return None,
    };
    Some(event)
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    type ServerSocket = WebSocketStream<TcpStream>;

    impl SidecarTransport {
        async fn is_connected(&self) -> bool {
            self.link
                .lock()
                .await
                .as_ref()
                .is_some_and(|l| !l.write_tx.is_closed())
        }
    }

    /// Start a one-connection fake sidecar running `script`.
    async fn fake_sidecar<F, Fut>(script: F) -> String
    where
        F: FnOnce(ServerSocket) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = accept_async(tcp).await.unwrap();
            script(ws).await;
        });
        format!("ws://{addr}")
    }

    async fn read_json(ws: &mut ServerSocket) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(t) => return serde_json::from_str(t.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    async fn write_json(ws: &mut ServerSocket, v: Value) {
        ws.send(Message::Text(v.to_string().into())).await.unwrap();
    }

    fn transport(url: String) -> SidecarTransport {
        SidecarTransport::new(SidecarConfig {
            url,
            request_timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn connect_forwards_credentials_and_translates_events() {
        let url = fake_sidecar(|mut ws| async move {
            let hello = read_json(&mut ws).await;
            assert_eq!(hello, json!({"type": "connect", "creds": {"me": "bot"}}));

            write_json(&mut ws, json!({"type": "qr", "qr": "2@pair"})).await;
            write_json(&mut ws, json!({"type": "connected", "jid": "1555:3@s.whatsapp.net"})).await;
            write_json(&mut ws, json!({"type": "credentials", "creds": {"me": "rotated"}})).await;
            write_json(
                &mut ws,
                json!({"type": "inbound_message", "message": {
                    "id": "M1",
                    "chat": "1999@s.whatsapp.net",
                    "sender": "1999@s.whatsapp.net",
                    "kind": "text",
                    "text": "!help"
                }}),
            )
            .await;
            write_json(&mut ws, json!({"type": "disconnected", "status_code": 401})).await;
        })
        .await;

        let t = transport(url);
        let mut rx = t
            .connect(Some(Credentials(json!({"me": "bot"}))))
            .await
            .unwrap();

        assert!(matches!(rx.recv().await, Some(TransportEvent::PairingCode(q)) if q == "2@pair"));
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Opened { own_id: Some(j) }) if j.user() == "1555"
        ));
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::CredentialsUpdated(c)) if c.0 == json!({"me": "rotated"})
        ));
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Inbound(m)) if m.text.as_deref() == Some("!help")
        ));
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Closed(CloseReason::LoggedOut))
        ));
    }

    #[tokio::test]
    async fn send_and_group_lookup_round_trip() {
        let url = fake_sidecar(|mut ws| async move {
            let _connect = read_json(&mut ws).await;

            let send = read_json(&mut ws).await;
            assert_eq!(send["payload"], json!({"type": "text", "text": "hi"}));
            write_json(
                &mut ws,
                json!({"type": "send_result", "request_id": send["request_id"], "success": true}),
            )
            .await;

            let send = read_json(&mut ws).await;
            write_json(
                &mut ws,
                json!({"type": "send_result", "request_id": send["request_id"],
                       "success": false, "error": "rate limited"}),
            )
            .await;

            let lookup = read_json(&mut ws).await;
            assert_eq!(lookup["jid"], "123-456@g.us");
            write_json(
                &mut ws,
                json!({"type": "group_admins", "request_id": lookup["request_id"],
                       "admins": ["1777@s.whatsapp.net"]}),
            )
            .await;

            // Keep the socket open until the client is done.
            let _ = ws.next().await;
        })
        .await;

        let t = transport(url);
        let _rx = t.connect(None).await.unwrap();
        let to = Jid::new("1555@s.whatsapp.net");

        t.send(&to, &OutboundPayload::text("hi")).await.unwrap();
        let err = t.send(&to, &OutboundPayload::text("again")).await.unwrap_err();
        assert!(err.to_string().contains("rate limited"));

        let admins = t.group_admins(&Jid::new("123-456@g.us")).await.unwrap();
        assert_eq!(admins, vec![Jid::new("1777@s.whatsapp.net")]);
    }

    #[tokio::test]
    async fn socket_loss_is_recoverable_and_fails_pending_requests() {
        let url = fake_sidecar(|mut ws| async move {
            let _connect = read_json(&mut ws).await;
            let _send = read_json(&mut ws).await;
            // Drop the socket without replying.
        })
        .await;

        let t = transport(url);
        let mut rx = t.connect(None).await.unwrap();
        let err = t
            .send(&Jid::new("1555@s.whatsapp.net"), &OutboundPayload::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));

        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Closed(CloseReason::Recoverable(_)))
        ));
    }

    #[tokio::test]
    async fn requests_without_connection_fail_fast() {
        let t = transport("ws://127.0.0.1:9".to_string());
        let err = t
            .send(&Jid::new("1555@s.whatsapp.net"), &OutboundPayload::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(!t.is_connected().await);

        // Nothing listens on the discard port.
        assert!(matches!(t.connect(None).await, Err(Error::Transport(_))));
    }

    #[test]
    fn decrypt_errors_are_session_corruption() {
        let pending: Pending = Arc::default();
        let ev = translate(
            SidecarMessage::DecryptError {
                reason: Some("Bad MAC".into()),
            },
            &pending,
        );
        assert!(matches!(
            ev,
            Some(TransportEvent::Closed(CloseReason::SessionCorrupt(_)))
        ));
    }
}
