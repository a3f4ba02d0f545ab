use std::sync::{Arc, Weak};

use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};
use uuid::Uuid;

use crate::{
    Envelope, TaskSupervisor, Waiter,
    client::ClientConfig,
    error::{Error, ErrorKind, Result},
    proxy::DtoProxy,
    registry::ProxyRegistry,
};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle, published through [`ClientSession::state_changes`].
/// Errors collapse back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Owns one WebSocket link to a remote server and everything multiplexed
/// over it: the outbound writer, the request correlator, and the proxy
/// identity registry.
///
/// Concurrent callers issue requests independently; one recv loop processes
/// inbound frames in arrival order and hands each to either the correlator
/// (responses) or the registry (push notifications). Callers suspend only on
/// their own correlation entry, never on the recv loop.
pub struct ClientSession {
    config: ClientConfig,
    outbound: mpsc::Sender<tungstenite::Message>,
    waiter: Waiter,
    registry: ProxyRegistry,
    state: watch::Sender<SessionState>,
    supervisor: TaskSupervisor,
}

impl ClientSession {
    /// Dials `url` (e.g. `ws://127.0.0.1:9000/MediaManager`) and spawns the
    /// session's send and recv loops.
    ///
    /// # Errors
    pub async fn connect(url: &str, config: ClientConfig) -> Result<Arc<Self>> {
        let (state, _) = watch::channel(SessionState::Connecting);

        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::new(ErrorKind::WebSocketConnectFailed, e.to_string()))?;
        let (send_stream, recv_stream) = stream.split();
        let (outbound, outbound_rx) = mpsc::channel(1024);

        let session = Arc::new(Self {
            config,
            outbound,
            waiter: Waiter::default(),
            registry: ProxyRegistry::default(),
            state,
            supervisor: TaskSupervisor::create(),
        });
        session.state.send_replace(SessionState::Open);

        let guard = session.supervisor.start_task();
        tokio::spawn(async move {
            tokio::select! {
                () = guard.stopped() => {}
                _ = Self::start_send_loop(send_stream, outbound_rx) => {}
            }
        });

        let guard = session.supervisor.start_task();
        tokio::spawn({
            // The loop holds the session weakly so dropping the last
            // application handle tears the session down.
            let weak = Arc::downgrade(&session);
            async move {
                tokio::select! {
                    () = guard.stopped() => {}
                    r = Self::start_recv_loop(recv_stream, weak.clone()) => {
                        if let Err(e) = r {
                            tracing::error!("recv loop failed: {e}");
                        }
                    }
                }
                if let Some(session) = weak.upgrade() {
                    session.connection_closed();
                }
            }
        });

        Ok(session)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Lifecycle signal for an external supervisor; reconnection is its
    /// concern, not the session's.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn registry(&self) -> &ProxyRegistry {
        &self.registry
    }

    /// The bootstrap exchange of a fresh connection: queries the server's
    /// top-level object (nil target id) and resolves it into a proxy like any
    /// other reference.
    ///
    /// # Errors
    pub async fn root_query(self: &Arc<Self>) -> Result<Arc<DtoProxy>> {
        let value = self.round_trip(Envelope::root_query()).await?.into_result()?;
        self.object_from_value(&value)
    }

    /// Turns a server-sent object reference (a state object carrying a
    /// `dtoGuid`) into its proxy, creating it on first sight and populating
    /// the existing one in place otherwise.
    ///
    /// # Errors
    pub fn object_from_value(self: &Arc<Self>, value: &serde_json::Value) -> Result<Arc<DtoProxy>> {
        let dto_guid: Uuid = value
            .get("dtoGuid")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::DeserializeFailed,
                    "object reference without dtoGuid".into(),
                )
            })?;
        let proxy = self.registry.resolve(dto_guid, self);
        proxy.apply_update(value);
        Ok(proxy)
    }

    /// Sends a request and waits for its correlated response, at most the
    /// configured round-trip timeout. A response arriving later finds no
    /// pending entry and is dropped with a warning.
    ///
    /// # Errors
    pub(crate) async fn round_trip(&self, envelope: Envelope) -> Result<Envelope> {
        let reply = self.waiter.register(envelope.message_guid);
        self.send(envelope).await?;
        match tokio::time::timeout(self.config.timeout, reply.recv()).await {
            Ok(result) => result,
            Err(_) => Err(Error::kind(ErrorKind::RequestTimeout)),
        }
    }

    /// Hands a frame to the single logical writer; frames from concurrent
    /// senders never interleave bytes.
    ///
    /// # Errors
    pub(crate) async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.state() != SessionState::Open {
            return Err(Error::kind(ErrorKind::ConnectionLost));
        }
        let frame = envelope.encode()?;
        self.outbound
            .send(tungstenite::Message::Text(frame.into()))
            .await
            .map_err(|e| Error::new(ErrorKind::WebSocketSendFailed, e.to_string()))
    }

    /// Graceful shutdown: stops both loops and fails whatever is pending.
    pub async fn close(&self) {
        self.state.send_replace(SessionState::Closing);
        let _ = self
            .outbound
            .send(tungstenite::Message::Close(None))
            .await;
        self.supervisor.stop();
        self.supervisor.all_stopped().await;
        self.connection_closed();
    }

    /// Socket gone, by close, error, or shutdown: pending calls fail
    /// immediately instead of timing out one by one.
    fn connection_closed(&self) {
        self.state.send_replace(SessionState::Disconnected);
        self.waiter.fail_all(ErrorKind::ConnectionLost);
    }

    fn route(self: &Arc<Self>, envelope: Envelope) {
        if envelope.is_notification() {
            if let Some(proxy) = self.registry.notify_targets_of(envelope.dto_guid) {
                proxy.handle_notification(&envelope);
            } else {
                tracing::debug!(
                    "notification for unreferenced object {}",
                    envelope.dto_guid
                );
            }
        } else {
            self.waiter.post(envelope.message_guid, envelope);
        }
    }

    async fn start_recv_loop(
        mut recv_stream: SplitStream<Stream>,
        weak: Weak<ClientSession>,
    ) -> Result<()> {
        while let Some(frame) = recv_stream.next().await {
            let frame =
                frame.map_err(|e| Error::new(ErrorKind::ConnectionLost, e.to_string()))?;
            match frame {
                tungstenite::Message::Text(text) => {
                    let Some(session) = weak.upgrade() else {
                        return Ok(());
                    };
                    match Envelope::decode(text.as_str()) {
                        Ok(envelope) => session.route(envelope),
                        // Malformed frames are discarded; the link stays up.
                        Err(e) => tracing::warn!("discarding malformed frame: {e}"),
                    }
                }
                tungstenite::Message::Close(_) => {
                    return Err(Error::kind(ErrorKind::WebSocketClosed));
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn start_send_loop(
        mut send_stream: SplitSink<Stream, tungstenite::Message>,
        mut outbound_rx: mpsc::Receiver<tungstenite::Message>,
    ) -> Result<()> {
        while let Some(frame) = outbound_rx.recv().await {
            send_stream
                .send(frame)
                .await
                .map_err(|e| Error::new(ErrorKind::WebSocketSendFailed, e.to_string()))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("state", &self.state())
            .field("proxies", &self.registry.len())
            .finish()
    }
}
