use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::extract::{Extension, Query, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::Response;
use axum::Json;
use common::{now_secs, Track};
use library::{find_lyrics, Catalog};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::AuthContext;
use crate::covers::DEFAULT_COVER_SIZE;
use crate::error::ApiError;
use crate::pipeline::{Pipeline, StreamEnd};
use crate::range::{insert_header, serve_file};
use crate::state::AppState;
use crate::transcode::{self, mime_for_format, StreamRequest};

const DURATION_HEADER: HeaderName = HeaderName::from_static("x-content-duration");

#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    pub id: Option<String>,
    #[serde(rename = "maxBitRate")]
    pub max_bit_rate: Option<String>,
    pub format: Option<String>,
    pub c: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IdParams {
    pub id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CoverParams {
    pub id: Option<String>,
    pub size: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LyricsParams {
    pub artist: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct LyricsBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LyricsResponse {
    pub status: &'static str,
    pub lyrics: LyricsBody,
}

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::missing(name))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// `0` and an absent value both mean unlimited.
fn parse_max_bitrate(value: Option<&str>) -> Result<Option<u32>, ApiError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u32>()
            .map(Some)
            .map_err(|_| ApiError::InvalidParameter("Invalid bitrate value".to_string())),
    }
}

async fn load_track(catalog: &Catalog, id: String) -> Result<Track, ApiError> {
    let catalog = catalog.clone();
    tokio::task::spawn_blocking(move || {
        catalog
            .get_track(&id)?
            .ok_or_else(|| ApiError::NotFound("Track".to_string()))
    })
    .await?
}

async fn probe_duration(track: &Track) -> f64 {
    let path = PathBuf::from(&track.path);
    let fallback = f64::from(track.duration);
    match tokio::task::spawn_blocking(move || metadata::probe_duration(&path)).await {
        Ok(Ok(duration)) => duration,
        Ok(Err(err)) => {
            debug!("Duration probe failed for {}: {}", track.path, err);
            fallback
        }
        Err(_) => fallback,
    }
}

fn record_play(catalog: Catalog, track_id: String, user_id: String) {
    tokio::task::spawn_blocking(move || {
        if let Err(err) = catalog.record_play(&track_id, &user_id, now_secs()) {
            warn!("Failed to record play of {}: {}", track_id, err);
        }
    });
}

pub async fn stream(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let id = required(params.id, "id")?;
    let request = StreamRequest {
        max_bitrate: parse_max_bitrate(params.max_bit_rate.as_deref())?,
        format: non_empty(params.format).map(|f| f.trim().to_lowercase()),
    };
    let client = non_empty(params.c);

    let catalog = state.catalog.clone();
    let user_id = auth.user.id.clone();
    let (track, prefs) = tokio::task::spawn_blocking(move || {
        let track = catalog
            .get_track(&id)?
            .ok_or_else(|| ApiError::NotFound("Track".to_string()))?;
        let prefs = match client {
            Some(client) => Some(catalog.client_preference_or_create(&user_id, &client)?.0),
            None => None,
        };
        Ok::<_, ApiError>((track, prefs))
    })
    .await??;

    let templates = state.config.read().transcoding.clone();
    let plan = transcode::plan(&track, &request, prefs.as_ref(), &templates)?;
    let duration = probe_duration(&track).await;

    let mut response = match plan.pipeline {
        None => {
            let response = serve_file(Path::new(&track.path), &plan.mime, &headers).await?;
            record_play(state.catalog.clone(), track.id.clone(), auth.user.id.clone());
            response
        }
        Some(spec) => {
            debug!(
                "Transcoding {} to {} at {}kbps",
                track.path, plan.format, plan.bitrate
            );
            let pipeline = Pipeline::spawn(&spec).await?;
            let catalog = state.catalog.clone();
            let track_id = track.id.clone();
            let user_id = auth.user.id.clone();
            let body = pipeline.into_body(move |report| {
                if report.end != StreamEnd::Failed {
                    record_play(catalog, track_id, user_id);
                }
            });
            let mut response = Response::new(body);
            insert_header(&mut response, header::CONTENT_TYPE, &plan.mime);
            response
        }
    };

    insert_header(&mut response, DURATION_HEADER, &duration.to_string());
    Ok(response)
}

pub async fn download(
    State(state): State<AppState>,
    Query(params): Query<IdParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let id = required(params.id, "id")?;
    let track = load_track(&state.catalog, id).await?;
    serve_file(
        Path::new(&track.path),
        &mime_for_format(&track.suffix()),
        &headers,
    )
    .await
}

pub async fn cover_art(
    State(state): State<AppState>,
    Query(params): Query<CoverParams>,
) -> Result<Response, ApiError> {
    let id = required(params.id, "id")?;
    let size = match non_empty(params.size) {
        None => DEFAULT_COVER_SIZE,
        Some(raw) => match raw.trim().parse::<u32>() {
            Ok(size) if size > 0 => size,
            _ => return Err(ApiError::InvalidParameter("Invalid size value".to_string())),
        },
    };

    let catalog = state.catalog.clone();
    let cache = state.cover_cache();
    let bytes = tokio::task::spawn_blocking(move || {
        let folder = catalog
            .get_folder(&id)?
            .ok_or_else(|| ApiError::NotFound("Folder".to_string()))?;
        let outcome = cache.cover(&catalog, &folder, size)?;
        Ok::<_, ApiError>(std::fs::read(&outcome.path)?)
    })
    .await??;

    let mime = metadata::guess_mime(&bytes).unwrap_or_else(|| "image/jpeg".to_string());
    let mut response = Response::new(Body::from(bytes));
    insert_header(&mut response, header::CONTENT_TYPE, &mime);
    Ok(response)
}

pub async fn lyrics(
    State(state): State<AppState>,
    Query(params): Query<LyricsParams>,
) -> Result<(StatusCode, Json<LyricsResponse>), ApiError> {
    let artist = required(params.artist, "artist")?;
    let title = required(params.title, "title")?;

    let catalog = state.catalog.clone();
    let found = tokio::task::spawn_blocking(move || find_lyrics(&catalog, &artist, &title)).await??;

    let lyrics = match found {
        Some(found) => LyricsBody {
            artist: Some(found.artist),
            title: Some(found.title),
            value: Some(found.text),
        },
        None => LyricsBody::default(),
    };
    Ok((
        StatusCode::OK,
        Json(LyricsResponse {
            status: "ok",
            lyrics,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use common::{folder_id, track_id, User};
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        state: AppState,
        auth: AuthContext,
    }

    fn fixture(transcoding: &[(&str, &str)]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog.redb")).unwrap();
        let user: User = catalog.create_user("alice", "unused", false).unwrap();
        let mut config = ServerConfig::default();
        config.cache_dir = dir.path().join("cache").to_string_lossy().to_string();
        config.transcoding = transcoding
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let state = AppState::new(catalog, dir.path().join("config.yaml"), config);
        Fixture {
            dir,
            state,
            auth: AuthContext { user },
        }
    }

    fn add_track(fx: &Fixture, name: &str, contents: &[u8], bitrate: u32) -> Track {
        let path = fx.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        let path = path.to_string_lossy().to_string();
        let track = Track {
            id: track_id(&path),
            path: path.clone(),
            folder_id: folder_id(&fx.dir.path().to_string_lossy()),
            album_id: "album".to_string(),
            disc: None,
            number: Some(1),
            title: "Song".to_string(),
            year: None,
            genre: None,
            artist: "Band".to_string(),
            bitrate,
            duration: 42,
            last_modification: 0,
            created: 0,
            play_count: 0,
            last_play: None,
        };
        let txn = fx.state.catalog.begin().unwrap();
        txn.put_track(&track).unwrap();
        txn.commit().unwrap();
        track
    }

    fn params(id: &str, max_bit_rate: Option<&str>, format: Option<&str>) -> StreamParams {
        StreamParams {
            id: Some(id.to_string()),
            max_bit_rate: max_bit_rate.map(str::to_string),
            format: format.map(str::to_string),
            c: None,
        }
    }

    async fn wait_for_play(catalog: &Catalog, id: &str) -> Track {
        for _ in 0..100 {
            let track = catalog.get_track(id).unwrap().unwrap();
            if track.play_count > 0 {
                return track;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("play was never recorded");
    }

    #[test]
    fn bitrate_parameter_validation() {
        assert_eq!(parse_max_bitrate(None).unwrap(), None);
        assert_eq!(parse_max_bitrate(Some("")).unwrap(), None);
        assert_eq!(parse_max_bitrate(Some("0")).unwrap(), Some(0));
        assert_eq!(parse_max_bitrate(Some("128")).unwrap(), Some(128));
        let err = parse_max_bitrate(Some("fast")).unwrap_err();
        assert_eq!(err.code(), 0);
        assert_eq!(err.message(), "Invalid bitrate value");
    }

    #[tokio::test]
    async fn raw_stream_sends_file_and_counts_play() {
        let fx = fixture(&[]);
        let track = add_track(&fx, "song.mp3", b"mp3 bytes", 128);

        let response = stream(
            State(fx.state.clone()),
            Extension(fx.auth.clone()),
            Query(params(&track.id, Some("320"), None)),
            HeaderMap::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(response.headers()[DURATION_HEADER], "42");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"mp3 bytes");

        let played = wait_for_play(&fx.state.catalog, &track.id).await;
        assert_eq!(played.play_count, 1);
        let user = fx.state.catalog.get_user(&fx.auth.user.id).unwrap().unwrap();
        assert_eq!(user.last_play_id.as_deref(), Some(track.id.as_str()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lossless_stream_runs_transcoder() {
        let fx = fixture(&[("transcoder_flac_ogg", "printf ogg-%outratek")]);
        let track = add_track(&fx, "song.flac", b"flac bytes", 900);

        let response = stream(
            State(fx.state.clone()),
            Extension(fx.auth.clone()),
            Query(params(&track.id, None, None)),
            HeaderMap::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/ogg");
        assert!(response.headers().get(header::ACCEPT_RANGES).is_none());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ogg-320k");

        let played = wait_for_play(&fx.state.catalog, &track.id).await;
        assert_eq!(played.play_count, 1);
    }

    #[tokio::test]
    async fn missing_transcoder_is_reported() {
        let fx = fixture(&[]);
        let track = add_track(&fx, "song.flac", b"flac bytes", 900);

        let err = stream(
            State(fx.state.clone()),
            Extension(fx.auth.clone()),
            Query(params(&track.id, None, None)),
            HeaderMap::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.message(), "No way to transcode from flac to ogg");
        let track = fx.state.catalog.get_track(&track.id).unwrap().unwrap();
        assert_eq!(track.play_count, 0);
    }

    #[tokio::test]
    async fn client_preferences_are_created_on_first_stream() {
        let fx = fixture(&[]);
        let track = add_track(&fx, "song.mp3", b"mp3", 128);
        let mut request = params(&track.id, None, None);
        request.c = Some("player".to_string());

        stream(
            State(fx.state.clone()),
            Extension(fx.auth.clone()),
            Query(request),
            HeaderMap::new(),
        )
        .await
        .unwrap();

        let pref = fx
            .state
            .catalog
            .client_preference(&fx.auth.user.id, "player")
            .unwrap();
        assert!(pref.is_some());
    }

    #[tokio::test]
    async fn vanished_file_is_not_found_and_not_counted() {
        let fx = fixture(&[]);
        let track = add_track(&fx, "song.mp3", b"mp3 bytes", 128);
        std::fs::remove_file(&track.path).unwrap();

        let err = stream(
            State(fx.state.clone()),
            Extension(fx.auth.clone()),
            Query(params(&track.id, None, None)),
            HeaderMap::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), 70);
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let track = fx.state.catalog.get_track(&track.id).unwrap().unwrap();
        assert_eq!(track.play_count, 0);
        assert_eq!(track.last_play, None);
        let user = fx.state.catalog.get_user(&fx.auth.user.id).unwrap().unwrap();
        assert_eq!(user.last_play_id, None);
    }

    #[tokio::test]
    async fn download_does_not_count_plays() {
        let fx = fixture(&[]);
        let track = add_track(&fx, "song.flac", b"flac bytes", 900);

        let response = download(
            State(fx.state.clone()),
            Query(IdParams {
                id: Some(track.id.clone()),
            }),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"flac bytes");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let track = fx.state.catalog.get_track(&track.id).unwrap().unwrap();
        assert_eq!(track.play_count, 0);
    }

    #[tokio::test]
    async fn unknown_track_is_not_found() {
        let fx = fixture(&[]);
        let err = download(
            State(fx.state.clone()),
            Query(IdParams {
                id: Some("nope".to_string()),
            }),
            HeaderMap::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), 70);
    }

    #[tokio::test]
    async fn lyrics_require_artist_and_title() {
        let fx = fixture(&[]);
        let err = lyrics(
            State(fx.state.clone()),
            Query(LyricsParams {
                artist: None,
                title: Some("Song".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), 10);
    }

    #[tokio::test]
    async fn lyrics_missing_is_an_empty_payload() {
        let fx = fixture(&[]);
        let (status, Json(body)) = lyrics(
            State(fx.state.clone()),
            Query(LyricsParams {
                artist: Some("Band".to_string()),
                title: Some("Nothing".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["lyrics"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn lyrics_come_from_sidecar_file() {
        let fx = fixture(&[]);
        let track = add_track(&fx, "song.mp3", b"mp3", 128);
        std::fs::write(Path::new(&track.path).with_extension("txt"), "la la la").unwrap();

        let (_, Json(body)) = lyrics(
            State(fx.state.clone()),
            Query(LyricsParams {
                artist: Some("band".to_string()),
                title: Some("SONG".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(body.lyrics.value.as_deref(), Some("la la la"));
        assert_eq!(body.lyrics.title.as_deref(), Some("Song"));
    }

    #[tokio::test]
    async fn cover_size_must_be_positive() {
        let fx = fixture(&[]);
        let err = cover_art(
            State(fx.state.clone()),
            Query(CoverParams {
                id: Some("folder".to_string()),
                size: Some("0".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
