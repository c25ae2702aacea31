//! Response capture: materializing the downstream handler's output before
//! any caching decision is made.
//!
//! The cached bytes must be identical to what the original caller receives,
//! so the body is fully buffered first and the forwarded response is rebuilt
//! from the same buffer.

use axum::body::{Body, to_bytes};
use axum::http::HeaderName;
use axum::http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, DATE, SET_COOKIE, TRANSFER_ENCODING,
};
use axum::response::Response;

use crate::store::StoredResponse;

// Connection-scoped and per-response headers that make no sense to replay.
// Content-type is stored separately on the record.
fn snapshot_excluded(name: &HeaderName) -> bool {
    *name == CONTENT_TYPE
        || *name == CONTENT_LENGTH
        || *name == TRANSFER_ENCODING
        || *name == CONNECTION
        || *name == SET_COOKIE
        || *name == DATE
}

/// Buffers `res` and returns it rebuilt from the buffer, together with the
/// payload to persist. `snapshot_headers` controls whether the filtered
/// header snapshot is taken.
pub(crate) async fn capture_response(
    res: Response,
    snapshot_headers: bool,
) -> Result<(Response, StoredResponse), axum::Error> {
    let (parts, body) = res.into_parts();
    let bytes = to_bytes(body, usize::MAX).await?;

    let content_type = parts.headers.get(CONTENT_TYPE).cloned();
    let headers = snapshot_headers.then(|| {
        parts
            .headers
            .iter()
            .filter(|(name, _)| !snapshot_excluded(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    });

    let stored = StoredResponse {
        status: parts.status,
        body: bytes.clone(),
        content_type,
        headers,
    };

    Ok((Response::from_parts(parts, Body::from(bytes)), stored))
}

/// Rebuilds a response from a stored payload, verbatim.
pub(crate) fn replay_response(stored: &StoredResponse) -> Response {
    let mut res = Response::new(Body::from(stored.body.clone()));
    *res.status_mut() = stored.status;

    if let Some(headers) = &stored.headers {
        for (name, value) in headers {
            res.headers_mut().insert(name.clone(), value.clone());
        }
    }
    if let Some(content_type) = &stored.content_type {
        res.headers_mut().insert(CONTENT_TYPE, content_type.clone());
    }

    res
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::*;

    fn handler_response() -> Response {
        Response::builder()
            .status(StatusCode::CREATED)
            .header("content-type", "application/json")
            .header("x-resource-id", "o1")
            .header("set-cookie", "session=abc")
            .body(Body::from(r#"{"id":"o1"}"#))
            .unwrap()
    }

    #[tokio::test]
    async fn forwarded_response_is_unchanged() {
        let (res, stored) = capture_response(handler_response(), false).await.unwrap();

        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(res.headers().get("set-cookie").unwrap(), "session=abc");
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, stored.body);
        assert_eq!(&body[..], br#"{"id":"o1"}"#);
    }

    #[tokio::test]
    async fn snapshot_filters_connection_scoped_headers() {
        let (_, stored) = capture_response(handler_response(), true).await.unwrap();

        let headers = stored.headers.unwrap();
        assert!(headers.iter().any(|(name, _)| name == "x-resource-id"));
        assert!(!headers.iter().any(|(name, _)| name == "set-cookie"));
        assert!(!headers.iter().any(|(name, _)| name == "content-type"));
    }

    #[tokio::test]
    async fn replay_reproduces_status_content_type_and_body() {
        let (_, stored) = capture_response(handler_response(), true).await.unwrap();
        let replayed = replay_response(&stored);

        assert_eq!(replayed.status(), StatusCode::CREATED);
        assert_eq!(
            replayed.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(replayed.headers().get("x-resource-id").unwrap(), "o1");
        assert!(replayed.headers().get("set-cookie").is_none());
        let body = to_bytes(replayed.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"id":"o1"}"#);
    }

    #[tokio::test]
    async fn empty_body_round_trips() {
        let res = Response::new(Body::empty());
        let (_, stored) = capture_response(res, false).await.unwrap();
        assert!(stored.body.is_empty());

        let replayed = replay_response(&stored);
        let body = to_bytes(replayed.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }
}
