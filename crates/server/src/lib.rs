pub mod api;
pub mod auth;
pub mod config;
pub mod covers;
pub mod error;
pub mod pipeline;
pub mod range;
pub mod scan;
pub mod state;
pub mod transcode;

use axum::Router;
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    api::api_router(state)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
}
