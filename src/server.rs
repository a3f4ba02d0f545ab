use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, tungstenite};
use uuid::Uuid;

use crate::{
    Envelope, MessageType, STATE_CHANGED_EVENT, TaskSupervisor,
    dto::{DtoRegistry, EventSink, RemoteObject},
    error::{Error, ErrorKind, Result},
};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Serves one object graph to remote clients over WebSocket connections.
///
/// Each accepted connection gets its own recv loop dispatching inbound
/// envelopes, in arrival order, against the exposed objects, and its own
/// outbound writer carrying responses and push notifications. The root
/// object answers the bootstrap `RootQuery`; everything else is reached
/// through the registry by identity.
pub struct RemoteServer {
    state: Arc<ServerState>,
    supervisor: TaskSupervisor,
}

struct ServerState {
    root: Arc<dyn RemoteObject>,
    registry: Arc<DtoRegistry>,
    session_seq: AtomicU64,
}

impl RemoteServer {
    /// Creates a server for the given object graph. The root is exposed in
    /// the registry alongside whatever the domain layer has exposed already.
    #[must_use]
    pub fn create(root: Arc<dyn RemoteObject>, registry: Arc<DtoRegistry>) -> Self {
        registry.expose(root.clone());
        Self {
            state: Arc::new(ServerState {
                root,
                registry,
                session_seq: AtomicU64::new(0),
            }),
            supervisor: TaskSupervisor::create(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DtoRegistry> {
        &self.state.registry
    }

    /// Binds `addr` (port 0 picks a free port) and starts accepting
    /// connections. Returns the bound address.
    ///
    /// # Errors
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;

        let state = self.state.clone();
        let accept_guard = self.supervisor.start_task();
        let handle = self.supervisor.handle();
        tokio::spawn(async move {
            tokio::select! {
                () = accept_guard.stopped() => {
                    tracing::info!("stop accept loop");
                }
                () = async {
                    tracing::info!("start listening: {listener_addr}");
                    while let Ok((stream, addr)) = listener.accept().await {
                        let state = state.clone();
                        let guard = handle.start_task();
                        tokio::spawn(async move {
                            tokio::select! {
                                () = guard.stopped() => {}
                                r = handle_connection(state, stream, addr) => {
                                    if let Err(e) = r {
                                        tracing::warn!("connection {addr} ended: {e}");
                                    }
                                }
                            }
                        });
                    }
                } => {}
            }
        });

        Ok(listener_addr)
    }

    /// Stops accepting and tears down live connections.
    pub fn stop(&self) {
        self.supervisor.stop();
    }

    /// Waits for the accept loop and every connection task to finish.
    pub async fn join(&self) {
        self.supervisor.all_stopped().await;
    }
}

async fn handle_connection(
    state: Arc<ServerState>,
    tcp_stream: TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    let stream = accept_async(MaybeTlsStream::Plain(tcp_stream))
        .await
        .map_err(|e| Error::new(ErrorKind::WebSocketAcceptFailed, e.to_string()))?;
    tracing::info!("accepted connection from {addr}");

    let session_id = state.session_seq.fetch_add(1, Ordering::AcqRel);
    let (send_stream, recv_stream) = stream.split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        if let Err(e) = start_send_loop(send_stream, outbound_rx).await {
            tracing::warn!("send loop for {addr} ended: {e}");
        }
    });

    let mut connection = Connection {
        state,
        session_id,
        outbound,
        subscriptions: Vec::new(),
    };
    let result = connection.run(recv_stream).await;
    connection.teardown();
    result
}

async fn start_send_loop(
    mut send_stream: SplitSink<Stream, tungstenite::Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
) -> Result<()> {
    while let Some(envelope) = outbound_rx.recv().await {
        let frame = envelope.encode()?;
        send_stream
            .send(tungstenite::Message::Text(frame.into()))
            .await
            .map_err(|e| Error::new(ErrorKind::WebSocketSendFailed, e.to_string()))?;
    }
    Ok(())
}

/// One client's view of the server: its outbound lane and the event
/// subscriptions it holds, torn down when the socket goes away.
struct Connection {
    state: Arc<ServerState>,
    session_id: u64,
    outbound: mpsc::UnboundedSender<Envelope>,
    // One entry per live event-add, so teardown rewinds exactly.
    subscriptions: Vec<(Uuid, String)>,
}

impl Connection {
    async fn run(&mut self, mut recv_stream: SplitStream<Stream>) -> Result<()> {
        while let Some(frame) = recv_stream.next().await {
            let frame =
                frame.map_err(|e| Error::new(ErrorKind::ConnectionLost, e.to_string()))?;
            match frame {
                tungstenite::Message::Text(text) => match Envelope::decode(text.as_str()) {
                    Ok(envelope) => self.dispatch(envelope),
                    // The offending frame is discarded; the link stays up.
                    Err(e) => tracing::warn!("discarding malformed frame from client: {e}"),
                },
                tungstenite::Message::Close(_) => return Ok(()),
                _ => {}
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, envelope: Envelope) {
        let result = self.handle(&envelope);
        let reply = match result {
            Ok(Some(value)) => envelope.reply(value),
            // Fire-and-forget kinds produce no response.
            Ok(None) => return,
            Err(e) => envelope.reply_err(e),
        };
        let _ = self.outbound.send(reply);
    }

    fn handle(&mut self, envelope: &Envelope) -> Result<Option<serde_json::Value>> {
        if envelope.message_type == MessageType::RootQuery {
            return self.state.root.full_state().map(Some);
        }
        if envelope.message_type == MessageType::EventNotification {
            // Notifications only ever flow server to client.
            tracing::warn!("ignoring client-sent notification for {}", envelope.dto_guid);
            return Ok(None);
        }

        let dto = self.state.registry.lookup(envelope.dto_guid)?;
        let member = envelope.member_name.as_str();
        match envelope.message_type {
            MessageType::Get => dto.get(member).map(Some),
            MessageType::Set => {
                let value = envelope.parameters.first().cloned().ok_or_else(|| {
                    Error::new(ErrorKind::InvalidArguments, format!("Set {member} without value"))
                })?;
                dto.set(member, value)?;
                Ok(Some(serde_json::Value::Null))
            }
            MessageType::Query => dto.call(member, &envelope.parameters).map(Some),
            MessageType::Invoke => {
                if let Err(e) = dto.call(member, &envelope.parameters) {
                    tracing::warn!("invoke of {member} on {} failed: {e}", envelope.dto_guid);
                }
                Ok(None)
            }
            MessageType::EventAdd => {
                dto.dto_core().subscribe(
                    member,
                    EventSink {
                        session_id: self.session_id,
                        tx: self.outbound.clone(),
                    },
                );
                self.subscriptions
                    .push((envelope.dto_guid, member.to_string()));
                let response = if member == STATE_CHANGED_EVENT {
                    // Subscription doubles as the initial sync.
                    dto.full_state()
                } else {
                    Ok(serde_json::Value::Null)
                };
                match response {
                    Ok(value) => Ok(Some(value)),
                    Err(e) => {
                        // A registration answered with an error is rolled
                        // back; the client will not consider it live.
                        dto.dto_core().unsubscribe(member, self.session_id);
                        self.subscriptions.pop();
                        Err(e)
                    }
                }
            }
            MessageType::EventRemove => {
                dto.dto_core().unsubscribe(member, self.session_id);
                if let Some(pos) = self
                    .subscriptions
                    .iter()
                    .position(|(guid, event)| *guid == envelope.dto_guid && event == member)
                {
                    self.subscriptions.remove(pos);
                }
                Ok(None)
            }
            // Handled before the registry lookup.
            MessageType::RootQuery | MessageType::EventNotification => Ok(None),
        }
    }

    /// Drops every subscription this connection held so counts fall back to
    /// zero and elision kicks in again.
    fn teardown(&mut self) {
        for (dto_guid, event) in self.subscriptions.drain(..) {
            if let Ok(dto) = self.state.registry.lookup(dto_guid) {
                dto.dto_core().unsubscribe(&event, self.session_id);
            }
        }
    }
}

impl std::fmt::Debug for RemoteServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteServer")
            .field("objects", &self.state.registry.len())
            .finish()
    }
}
