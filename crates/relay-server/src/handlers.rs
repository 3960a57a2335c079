//! HTTP and WebSocket handlers for the Relay server.
//!
//! The WebSocket endpoint hands each upgraded socket to a session. The
//! remaining routes are read-only views of hub state.

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use relay_core::{BackendState, Hub, SessionHandler};
use relay_protocol::MessageData;
use relay_transport::WebSocketConnection;
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::ConnectionMetricsGuard;

/// Messages listed by the debug endpoint.
const DEBUG_RECENT: usize = 5;

/// Shared server state.
pub struct AppState {
    /// The message hub.
    pub hub: Arc<Hub>,
    /// Session runner for upgraded sockets.
    pub sessions: SessionHandler,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(hub: Arc<Hub>, config: Config) -> Self {
        Self {
            sessions: SessionHandler::new(Arc::clone(&hub)),
            hub,
            config,
        }
    }
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.websocket_path.clone();

    let mut app = Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/messages", get(messages_handler))
        .route("/debug/messages", get(debug_messages_handler));

    if ws_path != "/" {
        app = app.route("/", get(root_handler));
    }

    app.with_state(state)
}

/// Serve until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    let ws_path = state.config.websocket_path.clone();
    let app = router(state);

    info!("Relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("Server error")?;

    Ok(())
}

/// WebSocket endpoint. Plain GETs on the same path get the status document.
async fn ws_handler(
    ws: Option<WebSocketUpgrade>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match ws {
        Some(ws) => ws
            .on_upgrade(move |socket| handle_websocket(socket, addr, state))
            .into_response(),
        None => root_handler().await.into_response(),
    }
}

/// Handle an upgraded WebSocket connection.
async fn handle_websocket(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    debug!(remote = %addr, "WebSocket connected");

    let connection = WebSocketConnection::new(socket, Some(addr));
    let summary = state.sessions.run(Box::new(connection)).await;

    debug!(
        connection = %summary.id,
        reason = ?summary.reason,
        "WebSocket disconnected"
    );
}

/// Service status.
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "relay",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.hub.snapshot();
    let healthy = status.store == BackendState::Connected && status.bus == BackendState::Connected;

    Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "store": status.store,
        "bus": status.bus,
        "active_connections": status.active_connections,
        "total_messages": state.hub.total_messages().await,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// The same list a new connection receives as history.
async fn messages_handler(State(state): State<Arc<AppState>>) -> Json<Vec<MessageData>> {
    Json(state.hub.history().await)
}

/// Store internals: total count and the newest records with their IDs.
async fn debug_messages_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let store = state.hub.store();
    if !store.is_available() {
        return Json(json!({ "error": "store unavailable" }));
    }

    let (total_count, latest) = match (store.count().await, store.latest(DEBUG_RECENT).await) {
        (Ok(count), Ok(latest)) => (count, latest),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Debug listing failed");
            return Json(json!({ "error": e.to_string() }));
        }
    };

    let recent: Vec<Value> = latest
        .into_iter()
        .map(|record| {
            let data = record.message.to_data();
            json!({
                "id": record.id.0,
                "username": data.username,
                "message": data.message,
                "timestamp": data.timestamp,
            })
        })
        .collect();

    Json(json!({
        "total_count": total_count,
        "recent_messages": recent,
        "backend": store.backend_name(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use relay_core::{
        BusFacade, ConnectionRegistry, FanoutBridge, HubSettings, MemoryBus, MemoryStore,
        MessageBus, StoreFacade,
    };
    use relay_protocol::{decode, Envelope};
    use std::time::Duration;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream};

    type Client = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.host = "127.0.0.1".to_string();
        config.port = 0;
        config
    }

    fn state_with(store: StoreFacade, bus: BusFacade) -> Arc<AppState> {
        let hub = Arc::new(Hub::new(
            Arc::new(ConnectionRegistry::new()),
            store,
            bus,
            HubSettings::default(),
        ));
        Arc::new(AppState::new(hub, test_config()))
    }

    async fn spawn_app(state: Arc<AppState>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, state, std::future::pending()));
        addr
    }

    /// An app joined to `bus`, with its fanout bridge running.
    async fn spawn_instance(bus: &Arc<MemoryBus>) -> (SocketAddr, Arc<AppState>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let facade = BusFacade::connected(Arc::clone(bus) as Arc<dyn MessageBus>, "chat");
        let feed = bus.subscribe("chat").await.unwrap();
        // Runs until the test runtime shuts down
        let _bridge = FanoutBridge::spawn(feed, Arc::clone(&registry), facade.status());

        let hub = Arc::new(Hub::new(
            registry,
            StoreFacade::connected(Arc::new(MemoryStore::new())),
            facade,
            HubSettings::default(),
        ));
        let state = Arc::new(AppState::new(hub, test_config()));
        (spawn_app(Arc::clone(&state)).await, state)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
        client
    }

    async fn next_envelope(client: &mut Client) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .unwrap();
        decode(&frame.into_text().unwrap()).unwrap()
    }

    async fn send_text(client: &mut Client, text: &str) {
        client.send(WsMessage::Text(text.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn test_websocket_history_then_live() {
        let state = state_with(
            StoreFacade::connected(Arc::new(MemoryStore::new())),
            BusFacade::degraded("chat"),
        );
        let addr = spawn_app(Arc::clone(&state)).await;

        let mut alice = connect(addr).await;
        assert_eq!(next_envelope(&mut alice).await, Envelope::history(vec![]));

        send_text(&mut alice, r#"{"username":"alice","text":"hi"}"#).await;
        let live = match next_envelope(&mut alice).await {
            Envelope::Message(data) => data,
            other => panic!("Expected message, got {:?}", other),
        };
        assert_eq!(live.username, "alice");
        assert_eq!(live.message, "hi");

        // A later connection sees it in history
        let mut bob = connect(addr).await;
        match next_envelope(&mut bob).await {
            Envelope::History(items) => assert_eq!(items, vec![live]),
            other => panic!("Expected history, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_socket_open() {
        let state = state_with(StoreFacade::degraded(), BusFacade::degraded("chat"));
        let addr = spawn_app(state).await;

        let mut client = connect(addr).await;
        next_envelope(&mut client).await;

        send_text(&mut client, r#"{"username":"alice"}"#).await;
        send_text(&mut client, r#"{"username":"alice","text":"after"}"#).await;

        match next_envelope(&mut client).await {
            Envelope::Message(data) => assert_eq!(data.message, "after"),
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_instances_share_messages_over_bus() {
        let bus = Arc::new(MemoryBus::new());
        let (first, _) = spawn_instance(&bus).await;
        let (second, _) = spawn_instance(&bus).await;

        let mut alice = connect(first).await;
        let mut bob = connect(second).await;
        next_envelope(&mut alice).await;
        next_envelope(&mut bob).await;

        send_text(&mut alice, r#"{"username":"alice","text":"across"}"#).await;

        for client in [&mut alice, &mut bob] {
            match next_envelope(client).await {
                Envelope::Message(data) => assert_eq!(data.message, "across"),
                other => panic!("Expected message, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let state = state_with(StoreFacade::degraded(), BusFacade::degraded("chat"));
        let addr = spawn_app(Arc::clone(&state)).await;

        let mut client = connect(addr).await;
        next_envelope(&mut client).await;
        assert_eq!(state.hub.snapshot().active_connections, 1);

        client.close(None).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while state.hub.snapshot().active_connections != 0 {
            assert!(tokio::time::Instant::now() < deadline, "connection never unregistered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_health_reports_backend_states() {
        let state = state_with(
            StoreFacade::connected(Arc::new(MemoryStore::new())),
            BusFacade::degraded("chat"),
        );

        let Json(health) = health_handler(State(state)).await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["store"], "connected");
        assert_eq!(health["bus"], "degraded");
        assert_eq!(health["active_connections"], 0);
        assert_eq!(health["total_messages"], 0);
    }

    #[tokio::test]
    async fn test_messages_and_debug_endpoints() {
        let state = state_with(
            StoreFacade::connected(Arc::new(MemoryStore::new())),
            BusFacade::degraded("chat"),
        );
        for i in 0..7 {
            state
                .hub
                .route(relay_protocol::InboundMessage::new("alice", format!("msg {}", i)))
                .await
                .unwrap();
        }

        let Json(messages) = messages_handler(State(Arc::clone(&state))).await;
        assert_eq!(messages.len(), 7);
        assert_eq!(messages[0].message, "msg 0");

        let Json(debug) = debug_messages_handler(State(state)).await;
        assert_eq!(debug["total_count"], 7);
        let recent = debug["recent_messages"].as_array().unwrap();
        assert_eq!(recent.len(), DEBUG_RECENT);
        assert_eq!(recent[0]["message"], "msg 6");
        assert!(recent[0]["id"].is_i64());
        assert_eq!(debug["backend"], "memory");
    }

    #[tokio::test]
    async fn test_debug_endpoint_with_degraded_store() {
        let state = state_with(StoreFacade::degraded(), BusFacade::degraded("chat"));
        let Json(debug) = debug_messages_handler(State(state)).await;
        assert!(debug.get("error").is_some());
    }

    #[tokio::test]
    async fn test_root_status() {
        let Json(status) = root_handler().await;
        assert_eq!(status["status"], "ok");
        assert_eq!(status["service"], "relay");
    }
}
