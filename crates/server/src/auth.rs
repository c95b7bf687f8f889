use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{Request, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use common::User;
use rand_core::OsRng;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug)]
pub enum AuthError {
    Hash(argon2::password_hash::Error),
    BadEncoding,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Hash(err) => write!(f, "password hash error: {}", err),
            AuthError::BadEncoding => write!(f, "password is not valid enc: hex"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<argon2::password_hash::Error> for AuthError {
    fn from(err: argon2::password_hash::Error) -> Self {
        AuthError::Hash(err)
    }
}

/// The user a request authenticated as.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user: User,
}

#[derive(Deserialize)]
struct Credentials {
    u: Option<String>,
    p: Option<String>,
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(err) => {
            warn!("Stored password hash is unreadable: {}", err);
            false
        }
    }
}

/// Accepts a clear password or `enc:` followed by the hex of its bytes.
pub fn decode_password(raw: &str) -> Result<String, AuthError> {
    let hex = match raw.strip_prefix("enc:") {
        Some(hex) => hex,
        None => return Ok(raw.to_string()),
    };
    if hex.len() % 2 != 0 {
        return Err(AuthError::BadEncoding);
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or(AuthError::BadEncoding)
        })
        .collect::<Result<Vec<u8>, AuthError>>()?;
    String::from_utf8(bytes).map_err(|_| AuthError::BadEncoding)
}

async fn authenticate(state: &AppState, uri: &Uri) -> Result<User, ApiError> {
    let Query(credentials) = Query::<Credentials>::try_from_uri(uri)
        .map_err(|err| ApiError::InvalidParameter(err.body_text()))?;
    let name = credentials
        .u
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::missing("u"))?;
    let raw = credentials.p.ok_or_else(|| ApiError::missing("p"))?;
    let password = decode_password(&raw).map_err(|_| ApiError::WrongCredentials)?;

    let catalog = state.catalog.clone();
    let user = tokio::task::spawn_blocking(move || {
        let user = catalog.user_by_name(&name)?;
        Ok::<Option<User>, ApiError>(
            user.filter(|user| verify_password(&password, &user.password_hash)),
        )
    })
    .await??;

    user.ok_or_else(|| {
        debug!("Rejected credentials");
        ApiError::WrongCredentials
    })
}

pub async fn require_user(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    match authenticate(&state, req.uri()).await {
        Ok(user) => {
            req.extensions_mut().insert(AuthContext { user });
            next.run(req).await
        }
        Err(err) => err.into_response(),
    }
}

pub async fn require_admin(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    match authenticate(&state, req.uri()).await {
        Ok(user) if user.admin => {
            req.extensions_mut().insert(AuthContext { user });
            next.run(req).await
        }
        Ok(user) => {
            warn!("User {} is not an admin", user.name);
            ApiError::NotAuthorized.into_response()
        }
        Err(err) => err.into_response(),
    }
}
