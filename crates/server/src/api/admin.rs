use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::error::ApiError;
use crate::scan::start_scan;
use crate::state::AppState;

#[derive(Serialize)]
pub struct ScanStarted {
    pub status: &'static str,
}

pub async fn scan(State(state): State<AppState>) -> Result<(StatusCode, Json<ScanStarted>), ApiError> {
    start_scan(&state)?;
    Ok((StatusCode::ACCEPTED, Json(ScanStarted { status: "started" })))
}
