pub mod admin;
pub mod media;

use axum::extract::State;
use axum::middleware;
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};

use crate::auth::{require_admin, require_user};
use crate::state::{AppState, HealthResponse};

/// Registers `/rest/<name>` and `/rest/<name>.view` for GET and POST.
fn rest_routes(router: Router<AppState>, name: &str, handler: MethodRouter<AppState>) -> Router<AppState> {
    router
        .route(&format!("/rest/{}", name), handler.clone())
        .route(&format!("/rest/{}.view", name), handler)
}

pub fn api_router(state: AppState) -> Router {
    let mut rest = Router::new();
    rest = rest_routes(rest, "stream", get(media::stream).post(media::stream));
    rest = rest_routes(rest, "download", get(media::download).post(media::download));
    rest = rest_routes(
        rest,
        "getCoverArt",
        get(media::cover_art).post(media::cover_art),
    );
    rest = rest_routes(rest, "getLyrics", get(media::lyrics).post(media::lyrics));
    let rest = rest.layer(middleware::from_fn_with_state(state.clone(), require_user));

    let admin = Router::new()
        .route("/admin/scan", post(admin::scan))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .merge(rest)
        .merge(admin)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        scanning: state.is_scanning(),
    })
}
