use std::io::SeekFrom;
use std::path::Path;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::error::ApiError;

/// Inclusive byte span of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn content_length(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// Malformed or multi-range; the header is ignored.
    Invalid,
    /// Well formed but outside the file; answered with 416.
    Unsatisfiable,
}

/// Parses a single `bytes=` range against a file of `size` bytes. The end
/// is clamped to the last byte.
pub fn parse_range_header(value: &str, size: u64) -> Result<ByteRange, RangeError> {
    let spec = value
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::Invalid)?;
    if spec.contains(',') {
        return Err(RangeError::Invalid);
    }
    let (first, last) = spec.split_once('-').ok_or(RangeError::Invalid)?;
    let number = |text: &str| text.trim().parse::<u64>().map_err(|_| RangeError::Invalid);

    if first.trim().is_empty() {
        let suffix = number(last)?;
        if suffix == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        return Ok(ByteRange {
            start: size.saturating_sub(suffix),
            end: size - 1,
        });
    }

    let start = number(first)?;
    let end = if last.trim().is_empty() {
        None
    } else {
        Some(number(last)?)
    };
    if matches!(end, Some(end) if end < start) {
        return Err(RangeError::Invalid);
    }
    if start >= size {
        return Err(RangeError::Unsatisfiable);
    }
    let last_byte = size - 1;
    Ok(ByteRange {
        start,
        end: end.map_or(last_byte, |end| end.min(last_byte)),
    })
}

/// Streams a file, honouring a single `Range` header. An unparseable range
/// is ignored and the whole file is sent.
pub async fn serve_file(
    path: &Path,
    mime: &str,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound(format!("File {}", path.display())));
        }
        Err(err) => return Err(err.into()),
    };
    let size = file.metadata().await?.len();

    let range = request_headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(|value| parse_range_header(value, size));

    let mut response = match range {
        Some(Err(RangeError::Unsatisfiable)) => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            insert_header(&mut response, header::CONTENT_RANGE, &format!("bytes */{}", size));
            response
        }
        Some(Ok(ByteRange { start, end })) => {
            file.seek(SeekFrom::Start(start)).await?;
            let len = ByteRange { start, end }.content_length();
            let mut response = Response::new(Body::from_stream(ReaderStream::new(file.take(len))));
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            insert_header(
                &mut response,
                header::CONTENT_RANGE,
                &format!("bytes {}-{}/{}", start, end, size),
            );
            insert_header(&mut response, header::CONTENT_LENGTH, &len.to_string());
            response
        }
        Some(Err(RangeError::Invalid)) | None => {
            let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
            insert_header(&mut response, header::CONTENT_LENGTH, &size.to_string());
            response
        }
    };

    insert_header(&mut response, header::CONTENT_TYPE, mime);
    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    Ok(response)
}

pub fn insert_header(response: &mut Response, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_range_header, serve_file, ByteRange, RangeError};
    use axum::http::{header, HeaderMap, HeaderValue, StatusCode};

    fn range(value: &str, size: u64) -> Result<(u64, u64), RangeError> {
        parse_range_header(value, size).map(|ByteRange { start, end }| (start, end))
    }

    #[test]
    fn single_ranges() {
        assert_eq!(range("bytes=0-", 100), Ok((0, 99)));
        assert_eq!(range("bytes=10-19", 100), Ok((10, 19)));
        assert_eq!(range("bytes=90-200", 100), Ok((90, 99)));
        assert_eq!(range("bytes=-10", 100), Ok((90, 99)));
        assert_eq!(range("bytes=-500", 100), Ok((0, 99)));
    }

    #[test]
    fn malformed_ranges_are_invalid() {
        assert_eq!(range("bytes=0-1,2-3", 100), Err(RangeError::Invalid));
        assert_eq!(range("bytes=10-5", 100), Err(RangeError::Invalid));
        assert_eq!(range("items=0-5", 100), Err(RangeError::Invalid));
        assert_eq!(range("bytes=abc", 100), Err(RangeError::Invalid));
    }

    #[test]
    fn ranges_past_the_end_are_unsatisfiable() {
        assert_eq!(range("bytes=100-", 100), Err(RangeError::Unsatisfiable));
        assert_eq!(range("bytes=-0", 100), Err(RangeError::Unsatisfiable));
        assert_eq!(range("bytes=0-", 0), Err(RangeError::Unsatisfiable));
    }

    async fn served(range: Option<&str>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.mp3");
        std::fs::write(&path, b"0123456789").unwrap();
        let mut headers = HeaderMap::new();
        if let Some(range) = range {
            headers.insert(header::RANGE, HeaderValue::from_str(range).unwrap());
        }
        let response = serve_file(&path, "audio/mpeg", &headers).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body.to_vec())
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = serve_file(&dir.path().join("gone.mp3"), "audio/mpeg", &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn whole_file_without_range() {
        let (status, headers, body) = served(None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"0123456789");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(headers[header::CONTENT_TYPE], "audio/mpeg");
    }

    #[tokio::test]
    async fn partial_content_for_single_range() {
        let (status, headers, body) = served(Some("bytes=2-5")).await;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(body, b"2345");
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 2-5/10");
        assert_eq!(headers[header::CONTENT_LENGTH], "4");
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_416() {
        let (status, headers, body) = served(Some("bytes=50-")).await;
        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert!(body.is_empty());
        assert_eq!(headers[header::CONTENT_RANGE], "bytes */10");
    }
}
