use std::{
    sync::{Arc, Mutex, OnceLock},
    time::{Duration, Instant},
};

use axum::{
    Router,
    extract::{
        WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::any,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::{net::TcpStream, select, sync::mpsc::UnboundedSender};
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::{
    PlayerId, ServiceError, ServiceResult,
    app::{AppState, LazyAppState},
    game::MatchCommand,
    protocol::{DisconnectReason, ServerMessage},
    util::OneOneDashMap,
};

pub type ClientId = Uuid;

pub enum ClientMessage {
    Text(String),
    Close,
}

fn new_client() -> ClientId {
    Uuid::new_v4()
}

/// The one thing the rest of the server needs from the transport: best
/// effort delivery to a player's live session, silently dropped when there
/// is none.
pub trait TransportService {
    fn try_player_send(&self, player: &PlayerId, msg: &ServerMessage);
}

#[derive(Clone)]
pub struct TransportServiceImpl {
    app_state: LazyAppState,
    client_senders: Arc<DashMap<ClientId, (UnboundedSender<String>, CancellationToken)>>,
    player_associations: Arc<OneOneDashMap<ClientId, PlayerId>>,
    /// Touched on every inbound frame; entries expire after the heartbeat
    /// timeout, which is how the cleanup task spots dead sessions.
    activity: moka::sync::Cache<ClientId, Instant>,
}

impl TransportServiceImpl {
    pub fn new(app_state: LazyAppState, heartbeat_timeout: Duration) -> Self {
        Self {
            app_state,
            client_senders: Arc::new(DashMap::new()),
            player_associations: Arc::new(OneOneDashMap::new()),
            activity: moka::sync::Cache::builder()
                .time_to_live(heartbeat_timeout)
                .build(),
        }
    }

    fn on_disconnect(&self, id: &ClientId) {
        self.client_senders.remove(id);
        self.activity.invalidate(id);
        if let Some(player) = self.player_associations.remove_by_key(id) {
            let app = self.app_state.unwrap();
            let _ = app.matchmaking_service.cancel(&player);
            if let Some(match_id) = app.match_service.active_match_of(&player) {
                let _ = app.match_service.submit(
                    &match_id,
                    MatchCommand::Disconnected {
                        player: player.clone(),
                    },
                );
            }
            info!("player {} disconnected (client {})", player, id);
        } else {
            debug!("client {} disconnected", id);
        }
    }

    async fn handle_client<M, S, E>(
        &self,
        socket: S,
        msg_factory: impl Fn(String) -> M + Send + 'static,
        msg_parser: impl Fn(M) -> Option<ClientMessage> + Send + 'static,
    ) where
        S: futures_util::Sink<M>
            + futures_util::Stream<Item = Result<M, E>>
            + Unpin
            + Send
            + 'static,
        M: Send + 'static,
        E: Send + 'static,
    {
        let (sender, receiver) = socket.split();
        let client_id = new_client();
        let cancellation_token = CancellationToken::new();

        let transport = self.clone();
        let token = cancellation_token.clone();
        let receive_task = tokio::spawn(async move {
            transport
                .handle_receive::<S, M, E>(client_id, receiver, token, msg_parser)
                .await;
        });

        let transport = self.clone();
        let token = cancellation_token.clone();
        let send_task = tokio::spawn(async move {
            transport
                .handle_send::<S, M>(client_id, sender, token, msg_factory)
                .await;
        });

        let _ = tokio::join!(receive_task, send_task);
        self.on_disconnect(&client_id);
    }

    async fn handle_send<S, M>(
        &self,
        id: ClientId,
        mut sender: impl SinkExt<M> + Unpin + Send + 'static,
        cancellation_token: CancellationToken,
        msg_factory: impl Fn(String) -> M + Send + 'static,
    ) where
        S: futures_util::Sink<M> + Unpin + Send + 'static,
        M: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        self.client_senders
            .insert(id, (tx, cancellation_token.clone()));
        self.activity.insert(id, Instant::now());
        debug!("client {} connected", id);

        while let Some(msg) = select! {
            msg = rx.recv() => msg,
            _ = cancellation_token.cancelled() => None,
        } {
            let msg = msg_factory(msg);
            if sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
        debug!("client {} send loop ended", id);
        cancellation_token.cancel();
    }

    async fn handle_receive<S, M, E>(
        &self,
        id: ClientId,
        mut receiver: impl StreamExt<Item = Result<M, E>> + Unpin + Send + 'static,
        cancellation_token: CancellationToken,
        msg_parser: impl Fn(M) -> Option<ClientMessage> + Send + 'static,
    ) where
        S: futures_util::Stream<Item = Result<M, E>> + Unpin + Send + 'static,
        M: Send + 'static,
        E: Send + 'static,
    {
        while let Some(Ok(msg)) = select! {
            msg = receiver.next() => msg,
            _ = cancellation_token.cancelled() => None,
        } {
            self.activity.insert(id, Instant::now());

            let msg = match msg_parser(msg) {
                Some(m) => m,
                None => {
                    debug!("client {} sent an unsupported frame", id);
                    continue;
                }
            };
            match msg {
                ClientMessage::Text(text) => {
                    crate::protocol::handle_client_message(
                        self.app_state.unwrap(),
                        self,
                        &id,
                        text,
                    );
                }
                ClientMessage::Close => break,
            }
        }
        debug!("client {} receive loop ended", id);
        cancellation_token.cancel();
    }

    pub fn send_to_client(&self, id: &ClientId, msg: &ServerMessage) {
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(e) => {
                error!("failed to encode message for client {}: {}", id, e);
                return;
            }
        };
        if let Some(sender) = self.client_senders.get(id) {
            if sender.0.send(text).is_err() {
                debug!("client {} sender is gone", id);
            }
        }
    }

    pub fn associate_player(&self, id: &ClientId, player: &PlayerId) -> ServiceResult<()> {
        if self.player_associations.contains_key(id) {
            return ServiceError::not_possible("this connection already said Hello");
        }
        if let Some(prev_client_id) = self.player_associations.get_by_value(player) {
            self.send_to_client(
                &prev_client_id,
                &ServerMessage::ConnectionClosed {
                    reason: DisconnectReason::NewSession,
                },
            );
            self.close_client(&prev_client_id);
            // clean up immediately rather than waiting for the tasks to wind down
            self.on_disconnect(&prev_client_id);
            info!(
                "displaced previous session of {} (client {})",
                player, prev_client_id
            );
        }
        if !self.player_associations.try_insert(*id, player.clone()) {
            return ServiceError::internal(format!(
                "failed to associate player {} with client {}",
                player, id
            ));
        }
        info!("player {} connected (client {})", player, id);
        Ok(())
    }

    pub fn get_associated_player(&self, id: &ClientId) -> Option<PlayerId> {
        self.player_associations.get_by_key(id)
    }

    fn get_associated_client(&self, player: &PlayerId) -> Option<ClientId> {
        self.player_associations.get_by_value(player)
    }

    pub fn close_client(&self, id: &ClientId) {
        let Some(entry) = self.client_senders.get(id) else {
            debug!("client {} already closed", id);
            return;
        };
        let token = entry.1.clone();
        drop(entry);
        token.cancel();
    }

    /// One pass over live sessions, closing those whose activity entry has
    /// expired, i.e. that sent nothing (not even a heartbeat) for the whole
    /// timeout.
    fn reap_inactive_clients(&self) {
        let stale: Vec<ClientId> = self
            .client_senders
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| self.activity.get(id).is_none())
            .collect();
        for id in stale {
            warn!("closing inactive client {}", id);
            self.send_to_client(
                &id,
                &ServerMessage::ConnectionClosed {
                    reason: DisconnectReason::Inactivity,
                },
            );
            self.close_client(&id);
            // clean up immediately rather than waiting for the tasks to wind down
            self.on_disconnect(&id);
        }
    }

    fn launch_client_cleanup_task(&self, cancel: CancellationToken) {
        let transport = self.clone();
        let interval = transport.app_state.unwrap().config.cleanup_interval;
        tokio::spawn(async move {
            loop {
                select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                transport.reap_inactive_clients();
            }
        });
    }

    pub async fn handle_client_websocket(&self, ws: WebSocket) {
        self.handle_client(
            ws,
            |s| Message::Text(s.into()),
            |m| match m {
                Message::Text(t) => Some(ClientMessage::Text(t.to_string())),
                Message::Close(_) => Some(ClientMessage::Close),
                _ => None,
            },
        )
        .await;
    }

    pub async fn handle_client_tcp(&self, tcp: TcpStream) {
        let framed = Framed::new(tcp, LinesCodec::new());
        self.handle_client(framed, |s| s.to_string(), |s| Some(ClientMessage::Text(s)))
            .await;
    }

    pub async fn run(self, app: AppState) {
        TRANSPORT_IMPL
            .set(Arc::new(self.clone()))
            .ok()
            .expect("transport already running");

        let router = Router::new()
            .route("/", any(ws_handler))
            .route("/ws", any(ws_handler))
            .layer(CorsLayer::permissive());

        let listener =
            tokio::net::TcpListener::bind(format!("127.0.0.1:{}", app.config.ws_port))
                .await
                .unwrap();

        let shutdown = app.shutdown.clone();
        let tcp_port = app.config.tcp_port;
        let token = shutdown.clone();
        tokio::spawn(async move {
            serve_tcp_server(tcp_port, token).await;
        });
        self.launch_client_cleanup_task(shutdown.clone());

        info!("websocket server listening on port {}", app.config.ws_port);
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .unwrap();
    }
}

impl TransportService for TransportServiceImpl {
    fn try_player_send(&self, player: &PlayerId, msg: &ServerMessage) {
        if let Some(id) = self.get_associated_client(player) {
            self.send_to_client(&id, msg);
        }
    }
}

static TRANSPORT_IMPL: OnceLock<Arc<TransportServiceImpl>> = OnceLock::new();

async fn ws_handler(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        TRANSPORT_IMPL
            .get()
            .unwrap()
            .handle_client_websocket(socket)
            .await;
    })
}

async fn serve_tcp_server(port: u16, cancel: CancellationToken) {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    info!("tcp server listening on port {}", port);
    loop {
        select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((socket, addr)) = accepted else {
                    continue;
                };
                debug!("new tcp connection from {}", addr);
                tokio::spawn(async move {
                    TRANSPORT_IMPL.get().unwrap().handle_client_tcp(socket).await;
                });
            }
        }
    }
}

/// Records every outbound message instead of delivering it.
#[derive(Clone, Default)]
pub struct MockTransportService {
    pub sent: Arc<Mutex<Vec<(PlayerId, ServerMessage)>>>,
}

impl MockTransportService {
    pub fn to(&self, player: &PlayerId) -> Vec<ServerMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == player)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<(PlayerId, ServerMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl TransportService for MockTransportService {
    fn try_player_send(&self, player: &PlayerId, msg: &ServerMessage) {
        self.sent.lock().unwrap().push((player.clone(), msg.clone()));
    }
}
