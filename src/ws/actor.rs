//! Actor-per-connection: one reader loop, one writer task, one bounded
//! outbound queue per live WebSocket.
//!
//! The reader enforces the idle window — any client frame counts as a
//! heartbeat, and a connection that stays silent past the window is treated
//! as a disconnect. A disconnect cancels only this connection's pending
//! deliveries; events already sequenced in a room stay durable regardless.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::realtime::event::EventBody;
use crate::realtime::presence::PresenceShift;
use crate::realtime::registry::RegisterOutcome;
use crate::state::AppState;
use crate::ws::protocol::{self, ClientFrame, ServerFrame};

/// Normal close after a client-initiated shutdown or transport error.
const CLOSE_NORMAL: u16 = 1000;
/// Going-away close for connections dropped by the idle sweep.
const CLOSE_IDLE: u16 = 1001;

/// How long the writer gets to flush its queue after the reader stops.
const WRITER_DRAIN_WINDOW: Duration = Duration::from_secs(5);

/// Run the actor for an authenticated WebSocket connection.
pub async fn run_connection(socket: WebSocket, state: AppState, claims: Claims) {
    let connection_id = Uuid::now_v7().to_string();
    let user_id = claims.sub.clone();
    let idle_window = Duration::from_secs(state.realtime.idle_timeout_secs);

    let (ws_sender, mut ws_receiver) = socket.split();

    let (outcome, rx) = state
        .registry
        .register(&user_id, &connection_id, claims.is_admin);
    // The id was just generated, so this registration is always fresh.
    let Some(rx) = rx else {
        return;
    };
    let RegisterOutcome {
        handle: conn,
        shift: open_shift,
        ..
    } = outcome;

    // Subscribe to every room the user belongs to. The membership invariant
    // holds by construction: rooms_of only lists memberships.
    for room_id in state.memberships.rooms_of(&user_id) {
        state.registry.subscribe(&connection_id, &room_id);
    }

    announce_shift(&state, &claims, true, &open_shift).await;

    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        username = %claims.username,
        "WebSocket actor started"
    );

    // Writer task: owns the sink, drains the bounded queue.
    let close_code = Arc::new(AtomicU16::new(CLOSE_NORMAL));
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx, close_code.clone()));

    // Reader loop: parse frames, dispatch, enforce the idle window.
    loop {
        match timeout(idle_window, ws_receiver.next()).await {
            Err(_elapsed) => {
                tracing::info!(
                    connection_id = %connection_id,
                    user_id = %user_id,
                    "idle window elapsed, dropping connection"
                );
                close_code.store(CLOSE_IDLE, Ordering::Relaxed);
                conn.try_reply(ServerFrame::Error {
                    code: "idle_timeout".to_string(),
                    message: "no heartbeat within the idle window".to_string(),
                });
                break;
            }
            Ok(Some(Ok(msg))) => match msg {
                Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => {
                        protocol::handle_client_frame(&state, &conn, frame).await;
                    }
                    Err(e) => {
                        tracing::debug!(
                            connection_id = %connection_id,
                            error = %e,
                            "undecodable client frame"
                        );
                        conn.try_reply(ServerFrame::Error {
                            code: "validation_error".to_string(),
                            message: "undecodable frame".to_string(),
                        });
                    }
                },
                Message::Binary(_) => {
                    conn.try_reply(ServerFrame::Error {
                        code: "validation_error".to_string(),
                        message: "binary frames are not supported".to_string(),
                    });
                }
                // axum answers pings itself; reaching this arm already reset
                // the idle window, so there is nothing else to record.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(frame) => {
                    tracing::info!(
                        connection_id = %connection_id,
                        user_id = %user_id,
                        reason = ?frame,
                        "client initiated close"
                    );
                    break;
                }
            },
            Ok(Some(Err(e))) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    user_id = %user_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            Ok(None) => {
                tracing::info!(
                    connection_id = %connection_id,
                    user_id = %user_id,
                    "WebSocket stream ended"
                );
                break;
            }
        }
    }

    // Unregister drops the registry's handle; dropping ours then closes the
    // queue's sender side, so the writer drains whatever is already enqueued
    // (the idle notice included) before sending the close frame. Aborting
    // the writer here would lose those final frames.
    let shift = state
        .registry
        .unregister(&connection_id)
        .map(|(_, shift)| shift);
    drop(conn);
    let _ = timeout(WRITER_DRAIN_WINDOW, writer_handle).await;

    if let Some(shift) = shift {
        announce_shift(&state, &claims, false, &shift).await;
    }

    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        "WebSocket actor stopped"
    );
}

/// Publish the system-stream events a presence transition produces: the
/// user's online edge and, for admins, the new admin-online count.
async fn announce_shift(state: &AppState, claims: &Claims, online: bool, shift: &PresenceShift) {
    if shift.user_online.is_some() {
        let body = EventBody::PresenceChanged {
            user_id: claims.sub.clone(),
            username: claims.username.clone(),
            online,
        };
        if let Err(e) = state.router.publish_system(body).await {
            tracing::error!(error = %e, "failed to publish presence event");
        }
    }
    if let Some(count) = shift.admin_online {
        if let Err(e) = state
            .router
            .publish_system(EventBody::AdminOnline { online: count })
            .await
        {
            tracing::error!(error = %e, "failed to publish admin count event");
        }
    }
}

/// Writer task: drains the connection's bounded queue into the sink. The
/// queue only closes once every sender is gone, so frames enqueued before
/// the shutdown are always flushed first.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerFrame>,
    close_code: Arc<AtomicU16>,
) {
    while let Some(frame) = rx.recv().await {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode server frame");
                continue;
            }
        };
        if ws_sender.send(Message::Text(text.into())).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
    let close = match close_code.load(Ordering::Relaxed) {
        CLOSE_IDLE => Some(CloseFrame {
            code: CLOSE_IDLE,
            reason: "idle timeout".into(),
        }),
        _ => None,
    };
    let _ = ws_sender.send(Message::Close(close)).await;
}
