//! Key resolution: extracting the client-supplied idempotency key and
//! fingerprinting the request body.
//!
//! The body digest is only ever used to detect a key being reused for a
//! different payload; it is never part of the key itself. Computing it
//! requires buffering the body, so the request is rebuilt around the buffered
//! bytes and stays fully replayable for the downstream handler.

use axum::body::{Body, to_bytes};
use axum::extract::Request;

use crate::config::IdempotencyOptions;

#[derive(Debug)]
pub(crate) struct ResolvedKey {
    pub key: String,
    pub request_body_hash: String,
}

/// Resolves the idempotency key for `req`, returning the request with its
/// body re-attached.
///
/// `Ok((req, None))` means the client supplied no key; the body is untouched
/// in that case. `Err` means the key was present but the body could not be
/// read, which leaves the request unusable downstream.
pub(crate) async fn resolve_key(
    req: Request,
    config: &IdempotencyOptions,
) -> Result<(Request, Option<ResolvedKey>), axum::Error> {
    let key = req
        .headers()
        .get(&config.key_header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_owned);

    let Some(key) = key else {
        return Ok((req, None));
    };

    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, usize::MAX).await?;
    let request_body_hash = blake3::hash(&bytes).to_hex().to_string();
    let req = Request::from_parts(parts, Body::from(bytes));

    Ok((
        req,
        Some(ResolvedKey {
            key,
            request_body_hash,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: Option<&str>, body: &'static str) -> Request {
        let mut builder = Request::builder().method("POST").uri("/orders");
        if let Some(key) = key {
            builder = builder.header("idempotency-key", key);
        }
        builder.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn missing_header_yields_no_key() {
        let config = IdempotencyOptions::default();
        let (_, resolved) = resolve_key(request(None, "body"), &config).await.unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn blank_header_yields_no_key() {
        let config = IdempotencyOptions::default();
        let (_, resolved) = resolve_key(request(Some("   "), "body"), &config)
            .await
            .unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn key_is_trimmed_and_body_stays_replayable() {
        let config = IdempotencyOptions::default();
        let (req, resolved) = resolve_key(request(Some(" order-42 "), r#"{"amount":10}"#), &config)
            .await
            .unwrap();

        let resolved = resolved.unwrap();
        assert_eq!(resolved.key, "order-42");

        let replayed = to_bytes(req.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&replayed[..], br#"{"amount":10}"#);
    }

    #[tokio::test]
    async fn hash_distinguishes_bodies_and_is_stable() {
        let config = IdempotencyOptions::default();

        let (_, a1) = resolve_key(request(Some("k"), r#"{"amount":10}"#), &config)
            .await
            .unwrap();
        let (_, a2) = resolve_key(request(Some("k"), r#"{"amount":10}"#), &config)
            .await
            .unwrap();
        let (_, b) = resolve_key(request(Some("k"), r#"{"amount":11}"#), &config)
            .await
            .unwrap();

        let (a1, a2, b) = (a1.unwrap(), a2.unwrap(), b.unwrap());
        assert_eq!(a1.request_body_hash, a2.request_body_hash);
        assert_ne!(a1.request_body_hash, b.request_body_hash);
    }

    #[tokio::test]
    async fn empty_body_hashes_consistently() {
        let config = IdempotencyOptions::default();
        let (_, first) = resolve_key(request(Some("k"), ""), &config).await.unwrap();
        let (_, second) = resolve_key(request(Some("k"), ""), &config).await.unwrap();
        assert_eq!(
            first.unwrap().request_body_hash,
            second.unwrap().request_body_hash
        );
    }
}
