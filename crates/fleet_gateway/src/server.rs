use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::identity::Identity;
use crate::types::{AuditParams, CommandsParams, SubmitRequest, Submitted};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use fleet_core::{AuditPage, Command, CommandId, NewServer, Server, ServerId, ServerPatch};
use fleet_dispatch::{Dispatcher, Subscription, Topic};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

type ApiResult<T> = Result<T, ApiError>;

/// Shared state for the gateway routes.
#[derive(Clone)]
struct AppState {
    dispatcher: Dispatcher,
    /// Number of open WebSocket subscriptions.
    active_ws: Arc<AtomicUsize>,
}

/// Build the gateway's routes over `dispatcher`.
pub fn router(dispatcher: Dispatcher) -> Router {
    router_with(AppState {
        dispatcher,
        active_ws: Arc::new(AtomicUsize::new(0)),
    })
}

fn router_with(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/servers", post(register_server).get(list_servers))
        .route(
            "/servers/:id",
            get(get_server).patch(update_server).delete(delete_server),
        )
        .route("/servers/:id/commands/ws", get(server_ws))
        .route("/commands", post(submit_command).get(list_commands))
        .route("/commands/:id", get(get_command))
        .route("/commands/:id/cancel", post(cancel_command))
        .route("/commands/:id/terminate", post(terminate_command))
        .route("/audit", get(audit))
        .route("/ws", get(all_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The gateway HTTP + WebSocket server.
///
/// Serves the command and server API on top of a [`Dispatcher`] and streams
/// live command events over WebSocket.
pub struct GatewayServer {
    dispatcher: Dispatcher,
    active_ws: Arc<AtomicUsize>,
    host: String,
    port: u16,
}

impl GatewayServer {
    pub fn new(dispatcher: Dispatcher, host: &str, port: u16) -> Self {
        Self {
            dispatcher,
            active_ws: Arc::new(AtomicUsize::new(0)),
            host: host.to_string(),
            port,
        }
    }

    /// Number of open WebSocket subscriptions.
    pub fn active_connections(&self) -> Arc<AtomicUsize> {
        self.active_ws.clone()
    }

    /// Bind and serve in a background task until `shutdown` fires.
    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let app = router_with(AppState {
            dispatcher: self.dispatcher,
            active_ws: self.active_ws,
        });
        let addr = format!("{}:{}", self.host, self.port);

        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!("Gateway failed to bind {}: {}", addr, e);
                    return;
                }
            };
            tracing::info!("Gateway listening on {}", addr);
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!("Gateway server error: {}", e);
            }
        })
    }
}

// ============================================================================
// Route handlers
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

async fn register_server(
    State(state): State<AppState>,
    Identity(caller): Identity,
    ApiJson(new): ApiJson<NewServer>,
) -> ApiResult<(StatusCode, Json<Server>)> {
    let server = state.dispatcher.register_server(&caller, new).await?;
    Ok((StatusCode::CREATED, Json(server)))
}

async fn list_servers(
    State(state): State<AppState>,
    Identity(_): Identity,
) -> ApiResult<Json<Vec<Server>>> {
    Ok(Json(state.dispatcher.list_servers().await?))
}

async fn get_server(
    State(state): State<AppState>,
    Identity(_): Identity,
    ApiPath(id): ApiPath<ServerId>,
) -> ApiResult<Json<Server>> {
    Ok(Json(state.dispatcher.get_server(id).await?))
}

async fn update_server(
    State(state): State<AppState>,
    Identity(caller): Identity,
    ApiPath(id): ApiPath<ServerId>,
    ApiJson(patch): ApiJson<ServerPatch>,
) -> ApiResult<Json<Server>> {
    Ok(Json(state.dispatcher.update_server(&caller, id, patch).await?))
}

/// DELETE /servers/:id: only servers with nothing pending or running.
async fn delete_server(
    State(state): State<AppState>,
    Identity(caller): Identity,
    ApiPath(id): ApiPath<ServerId>,
) -> ApiResult<Json<Server>> {
    Ok(Json(state.dispatcher.delete_server(&caller, id).await?))
}

/// POST /commands: queue a command, answering as soon as it is pending.
async fn submit_command(
    State(state): State<AppState>,
    Identity(caller): Identity,
    ApiJson(req): ApiJson<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<Submitted>)> {
    let command = state
        .dispatcher
        .submit(&caller, req.server_id, &req.text, req.kind)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(Submitted {
            id: command.id,
            state: command.state,
        }),
    ))
}

async fn list_commands(
    State(state): State<AppState>,
    Identity(_): Identity,
    ApiQuery(params): ApiQuery<CommandsParams>,
) -> ApiResult<Json<Vec<Command>>> {
    let filter = params.into_filter()?;
    Ok(Json(state.dispatcher.list_commands(&filter).await?))
}

async fn get_command(
    State(state): State<AppState>,
    Identity(_): Identity,
    ApiPath(id): ApiPath<CommandId>,
) -> ApiResult<Json<Command>> {
    Ok(Json(state.dispatcher.get_command(id).await?))
}

async fn cancel_command(
    State(state): State<AppState>,
    Identity(caller): Identity,
    ApiPath(id): ApiPath<CommandId>,
) -> ApiResult<Json<Command>> {
    Ok(Json(state.dispatcher.cancel(&caller, id).await?))
}

/// POST /commands/:id/terminate: 202, the command ends asynchronously.
async fn terminate_command(
    State(state): State<AppState>,
    Identity(caller): Identity,
    ApiPath(id): ApiPath<CommandId>,
) -> ApiResult<(StatusCode, Json<Command>)> {
    let command = state.dispatcher.terminate(&caller, id).await?;
    Ok((StatusCode::ACCEPTED, Json(command)))
}

async fn audit(
    State(state): State<AppState>,
    Identity(_): Identity,
    ApiQuery(params): ApiQuery<AuditParams>,
) -> ApiResult<Json<AuditPage>> {
    let query = params.into_query()?;
    Ok(Json(state.dispatcher.audit(&query).await?))
}

// ============================================================================
// WebSocket
// ============================================================================

/// GET /servers/:id/commands/ws: live events for one server.
async fn server_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Identity(_): Identity,
    ApiPath(id): ApiPath<ServerId>,
) -> ApiResult<impl IntoResponse> {
    state.dispatcher.get_server(id).await?;
    let sub = state.dispatcher.subscribe(Topic::ServerCommands(id));
    Ok(ws.on_upgrade(move |socket| stream_events(socket, sub, state)))
}

/// GET /ws: live events for every server.
async fn all_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Identity(_): Identity,
) -> impl IntoResponse {
    let sub = state.dispatcher.subscribe(Topic::AllCommands);
    ws.on_upgrade(move |socket| stream_events(socket, sub, state))
}

/// Forward subscription events to the socket as JSON until either side
/// goes away. Inbound messages are ignored apart from close.
async fn stream_events(socket: WebSocket, mut sub: Subscription, state: AppState) {
    state.active_ws.fetch_add(1, Ordering::Relaxed);
    let topic = sub.topic();
    tracing::debug!("WebSocket subscribed to {}", topic);
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            event = sub.recv() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("Failed to encode event for {}: {}", topic, e);
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    if sub.missed() > 0 {
        tracing::info!("WebSocket on {} closed after missing {} events", topic, sub.missed());
    }
    state.active_ws.fetch_sub(1, Ordering::Relaxed);
}
