use axum::{middleware, Json, Router};
use std::sync::Arc;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::api::ApiResponse;
use crate::auth::accounts;
use crate::auth::middleware::JwtSecret;
use crate::auth::totp;
use crate::chat::history;
use crate::moderation::{actions, visibility};
use crate::rooms::{crud as room_crud, invites, lifecycle};
use crate::social::friends;
use crate::state::AppState;
use crate::tickets;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// GET /api/presence/admins — pull counterpart of the pushed `admin_count`
/// events. Both read the same counter, so they never disagree.
async fn admin_presence(
    axum::extract::State(state): axum::extract::State<AppState>,
    _claims: crate::auth::middleware::Claims,
) -> Json<ApiResponse<serde_json::Value>> {
    ApiResponse::ok(serde_json::json!({
        "online": state.presence.online_admin_count(),
    }))
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Rate limiting: 5 requests per minute per IP on auth endpoints.
    // Uses PeerIpKeyExtractor which reads from ConnectInfo<SocketAddr>.
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(PeerIpKeyExtractor)
            .per_second(12) // 1 token every 12 seconds = 5 per minute
            .burst_size(5)
            .finish()
            .expect("Failed to build governor config"),
    );
    let governor_limiter = governor_config.limiter().clone();

    // Spawn background task to clean up rate limiter state
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            governor_limiter.retain_recent();
        }
    });

    let auth_routes = Router::new()
        .route("/api/auth/register", axum::routing::post(accounts::register))
        .route("/api/auth/login", axum::routing::post(accounts::login))
        .route("/api/auth/refresh", axum::routing::post(accounts::refresh))
        .layer(GovernorLayer {
            config: governor_config,
        });

    // TOTP management requires an existing session.
    let totp_routes = Router::new()
        .route("/api/auth/totp/enroll", axum::routing::post(totp::totp_enroll))
        .route("/api/auth/totp/confirm", axum::routing::post(totp::totp_confirm));

    let room_routes = Router::new()
        .route("/api/rooms", axum::routing::get(room_crud::list_rooms))
        .route("/api/rooms", axum::routing::post(room_crud::create_room))
        .route("/api/rooms/{id}/join", axum::routing::post(room_crud::join_room))
        .route("/api/rooms/{id}/leave", axum::routing::post(room_crud::leave_room))
        .route("/api/rooms/{id}/members", axum::routing::get(room_crud::list_members))
        .route(
            "/api/rooms/{id}/members/{user_id}/level",
            axum::routing::put(room_crud::set_member_level),
        )
        .route("/api/rooms/{id}/presence", axum::routing::get(room_crud::room_presence))
        .route("/api/rooms/{id}/messages", axum::routing::get(history::room_history))
        .route(
            "/api/rooms/{id}/messages/{message_id}",
            axum::routing::delete(actions::delete_message),
        );

    let lifecycle_routes = Router::new()
        .route("/api/rooms/{id}/delete", axum::routing::post(lifecycle::request_deletion))
        .route(
            "/api/rooms/{id}/delete/approve",
            axum::routing::post(lifecycle::approve_deletion),
        )
        .route(
            "/api/rooms/{id}/delete/reject",
            axum::routing::post(lifecycle::reject_deletion),
        );

    let invite_routes = Router::new()
        .route("/api/rooms/{id}/invites", axum::routing::post(invites::create_invite))
        .route("/api/invites", axum::routing::get(invites::list_invites))
        .route("/api/invites/{id}/accept", axum::routing::post(invites::accept_invite))
        .route("/api/invites/{id}/decline", axum::routing::post(invites::decline_invite))
        .route("/api/invites/{id}", axum::routing::delete(invites::cancel_invite));

    let moderation_routes = Router::new()
        .route(
            "/api/rooms/{id}/ban/{user_id}",
            axum::routing::post(actions::ban_user),
        )
        .route(
            "/api/rooms/{id}/timeout/{user_id}",
            axum::routing::post(actions::timeout_user),
        )
        .route("/api/rooms/{id}/reports", axum::routing::post(actions::file_report))
        .route("/api/rooms/{id}/reports", axum::routing::get(actions::list_reports));

    let visibility_routes = Router::new()
        .route("/api/hidden", axum::routing::post(visibility::hide_item))
        .route("/api/hidden", axum::routing::delete(visibility::unhide_item))
        .route("/api/hidden", axum::routing::get(visibility::list_hidden))
        .route("/api/rooms/{id}/mute", axum::routing::post(visibility::mute_room))
        .route("/api/rooms/{id}/unmute", axum::routing::post(visibility::unmute_room))
        .route("/api/muted", axum::routing::get(visibility::list_muted));

    let friend_routes = Router::new()
        .route("/api/friends", axum::routing::get(friends::list_friends))
        .route("/api/friends/requests", axum::routing::post(friends::send_request))
        .route("/api/friends/requests", axum::routing::get(friends::list_requests))
        .route(
            "/api/friends/requests/{id}/accept",
            axum::routing::post(friends::accept_request),
        )
        .route(
            "/api/friends/requests/{id}/decline",
            axum::routing::post(friends::decline_request),
        )
        .route(
            "/api/friends/requests/{id}",
            axum::routing::delete(friends::cancel_request),
        );

    let ticket_routes = Router::new()
        .route("/api/tickets", axum::routing::post(tickets::create_ticket))
        .route("/api/tickets", axum::routing::get(tickets::list_tickets))
        .route("/api/tickets/{id}", axum::routing::put(tickets::respond_ticket));

    let presence_routes =
        Router::new().route("/api/presence/admins", axum::routing::get(admin_presence));

    // WebSocket endpoint (auth via query param, not JWT header)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(auth_routes)
        .merge(totp_routes)
        .merge(room_routes)
        .merge(lifecycle_routes)
        .merge(invite_routes)
        .merge(moderation_routes)
        .merge(visibility_routes)
        .merge(friend_routes)
        .merge(ticket_routes)
        .merge(presence_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
