//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{MatchHandle, SessionInput};
use crate::http::middleware::verify_session_token;
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::{unix_millis, SIMULATION_TPS};
use crate::ws::protocol::{ClientMsg, ConnectionRole, ServerMsg};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Session token; its subject is the participant id and its role claim the connection role
    pub token: String,
    pub name: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(match_id): Path<Uuid>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // Verify the token before upgrading
    let claims = match verify_session_token(&query.token, &state.config.session_jwt_secret) {
        Ok(claims) => claims,
        Err(e) => {
            error!(match_id = %match_id, error = %e, "WebSocket auth failed");
            return e.into_response();
        }
    };

    let Some(handle) = state.match_registry.get(&match_id) else {
        warn!(match_id = %match_id, "WebSocket upgrade for unknown match");
        return (StatusCode::NOT_FOUND, "Match not found").into_response();
    };

    let participant_id = claims.sub;
    let role = claims.connection_role();
    let display_name = query
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("Participant_{}", &participant_id.to_string()[..8]));

    info!(
        match_id = %match_id,
        participant_id = %participant_id,
        role = ?role,
        "WebSocket upgrade for authenticated connection"
    );
    ws.on_upgrade(move |socket| handle_socket(socket, handle, participant_id, display_name, role))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    handle: MatchHandle,
    participant_id: Uuid,
    display_name: String,
    role: ConnectionRole,
) {
    info!(participant_id = %participant_id, "New WebSocket connection");

    let (mut ws_sink, ws_stream) = socket.split();

    // Subscribe before replaying so nothing published in between is missed
    let events_rx = handle.events_tx.subscribe();

    let welcome = ServerMsg::Welcome {
        participant_id,
        match_id: handle.id,
        server_time: unix_millis(),
        tick_rate: SIMULATION_TPS,
        tick: handle.current_tick(),
    };

    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(participant_id = %participant_id, error = %e, "Failed to send welcome");
        return;
    }

    // Late joiners rebuild the phase countdown from the latest announcement
    if let Some(phase) = handle.latest_phase() {
        if let Err(e) = send_msg(&mut ws_sink, &phase).await {
            error!(participant_id = %participant_id, error = %e, "Failed to replay phase");
            return;
        }
    }

    run_session(
        participant_id,
        display_name,
        role,
        ws_sink,
        ws_stream,
        handle.input_tx.clone(),
        events_rx,
    )
    .await;

    info!(participant_id = %participant_id, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    participant_id: Uuid,
    display_name: String,
    role: ConnectionRole,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    input_tx: mpsc::Sender<SessionInput>,
    mut events_rx: broadcast::Receiver<ServerMsg>,
) {
    let rate_limiter = match role {
        ConnectionRole::Participant => ConnectionRateLimiter::for_participant(),
        ConnectionRole::Engine => ConnectionRateLimiter::for_engine(),
    };

    // Spawn writer task: broadcast events -> WebSocket
    let writer_handle = tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(msg) => {
                    if !msg.is_for(participant_id) {
                        continue;
                    }
                    if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                        debug!(participant_id = %participant_id, error = %e, "WebSocket send failed");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        participant_id = %participant_id,
                        lagged_count = n,
                        "Client lagged, skipping {} messages", n
                    );
                    // Continue - don't disconnect for lag
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(participant_id = %participant_id, "Event channel closed");
                    break;
                }
            }
        }
    });

    // Reader loop: WebSocket -> match loop
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(participant_id = %participant_id, "Rate limited input message");
                    continue;
                }

                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(client_msg) => {
                        if client_msg.is_engine_report() && role != ConnectionRole::Engine {
                            warn!(participant_id = %participant_id, "Engine report from participant connection, ignoring");
                            continue;
                        }

                        let input = SessionInput {
                            participant_id,
                            display_name: display_name.clone(),
                            msg: client_msg,
                        };

                        if input_tx.send(input).await.is_err() {
                            debug!(participant_id = %participant_id, "Input channel closed");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(participant_id = %participant_id, error = %e, "Failed to parse client message");
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(participant_id = %participant_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(participant_id = %participant_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(participant_id = %participant_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // A dropped participant connection counts as leaving; the disconnect hook settles rewards
    if role == ConnectionRole::Participant {
        let _ = input_tx
            .send(SessionInput {
                participant_id,
                display_name,
                msg: ClientMsg::Leave,
            })
            .await;
    }

    // Abort writer task
    writer_handle.abort();
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
