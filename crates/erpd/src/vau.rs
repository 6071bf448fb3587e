//! VAU endpoint: `POST /VAU/<pseudonym>`
//!
//! The body is an outer VAU request. Anything that goes wrong before the
//! inner request is known is answered with a bare `400 transport error`, so
//! the caller learns nothing about why.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use erp_core::{ErpError, ErpResult};
use erp_vau::InnerTeeRequest;
use tracing::{debug, error, info, warn};

use crate::daemon::{AppState, Services};

/// Processes decrypted inner requests; the business layer plugs in here.
pub trait InnerRequestHandler: Send + Sync {
    fn handle(
        &self,
        request: &InnerTeeRequest,
        services: &Services,
    ) -> ErpResult<http::Response<Vec<u8>>>;
}

/// Answers every request with `501`.
pub struct NotImplementedHandler;

impl InnerRequestHandler for NotImplementedHandler {
    fn handle(
        &self,
        request: &InnerTeeRequest,
        _services: &Services,
    ) -> ErpResult<http::Response<Vec<u8>>> {
        info!(
            method = %request.request.method(),
            path = request.request.uri().path(),
            "no request processor configured"
        );
        let mut response = http::Response::new(Vec::new());
        *response.status_mut() = http::StatusCode::NOT_IMPLEMENTED;
        Ok(response)
    }
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/VAU/{*pseudonym}", post(vau_handler))
}

fn transport_error() -> Response {
    (StatusCode::BAD_REQUEST, "transport error").into_response()
}

async fn vau_handler(
    State(state): State<AppState>,
    Path(pseudonym): Path<String>,
    body: Bytes,
) -> Response {
    debug!(pseudonym = %pseudonym, size = body.len(), "VAU request");
    let worker = state.clone();
    let outcome = tokio::task::spawn_blocking(move || process(&worker, &body)).await;
    match outcome {
        Ok(Ok(encrypted)) => {
            state.metrics.record_vau("ok");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                encrypted,
            )
                .into_response()
        }
        Ok(Err(Failure::Transport(e))) => {
            state.metrics.record_vau("transport_error");
            warn!(code = e.code(), "VAU request rejected: {e}");
            transport_error()
        }
        Ok(Err(Failure::Internal(e))) => {
            state.metrics.record_vau("internal_error");
            error!(code = e.code(), "VAU request failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            state.metrics.record_vau("internal_error");
            error!("VAU worker failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

enum Failure {
    /// Before the response channel is established.
    Transport(ErpError),
    /// After decryption; no encrypted answer could be produced.
    Internal(ErpError),
}

fn process(state: &AppState, wire: &[u8]) -> Result<Vec<u8>, Failure> {
    let decrypted = state.protocol.decrypt(wire).map_err(Failure::Transport)?;
    let response = match state.handler.handle(&decrypted.inner, &state.services) {
        Ok(response) => response,
        Err(e) => {
            warn!(code = e.code(), "request processing failed: {e}");
            let mut response = http::Response::new(Vec::new());
            *response.status_mut() = match e {
                ErpError::NotFound(_) => http::StatusCode::NOT_FOUND,
                ErpError::MalformedInput(_) => http::StatusCode::BAD_REQUEST,
                ErpError::AuthenticationFailed(_) => http::StatusCode::UNAUTHORIZED,
                ErpError::HsmUnavailable(_) => http::StatusCode::SERVICE_UNAVAILABLE,
                _ => http::StatusCode::INTERNAL_SERVER_ERROR,
            };
            response
        }
    };
    state
        .protocol
        .encrypt(response, &decrypted.context)
        .map_err(Failure::Internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{build_state, router, tests::test_config};
    use axum::body::{to_bytes, Body};
    use erp_hsm::IdentifierKind;
    use erp_vau::{ClientTeeProtocol, Jwt};
    use serde_json::json;
    use std::sync::Arc;
    use tower::ServiceExt;

    /// Hashes the caller's `idNummer` and returns it hex encoded.
    struct HashingHandler;

    impl InnerRequestHandler for HashingHandler {
        fn handle(
            &self,
            request: &InnerTeeRequest,
            services: &Services,
        ) -> ErpResult<http::Response<Vec<u8>>> {
            let id = request
                .jwt
                .id_number()
                .ok_or_else(|| ErpError::MalformedInput("no idNummer".into()))?;
            let hashed = services
                .key_derivation
                .hash_identifier(IdentifierKind::classify(id), id)?;
            let body: String = hashed.hash.iter().map(|b| format!("{b:02x}")).collect();
            Ok(http::Response::new(body.into_bytes()))
        }
    }

    fn jwt(claims: serde_json::Value) -> Jwt {
        Jwt::compose(&json!({"alg": "BP256R1"}), &claims, b"sig").unwrap()
    }

    async fn post_vau(state: &AppState, body: Vec<u8>) -> (StatusCode, Vec<u8>) {
        let request = http::Request::post("/VAU/0a1b2c")
            .header("content-type", "application/octet-stream")
            .body(Body::from(body))
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn client(state: &AppState) -> ClientTeeProtocol {
        let key = state
            .pool
            .with_session(|s| s.get_ecies_public_key())
            .unwrap();
        ClientTeeProtocol::new(key)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_trip_through_the_handler() {
        let state = build_state(&test_config(), Arc::new(HashingHandler)).unwrap();
        let mut client = client(&state);
        let request = http::Request::get("/Task").body(Vec::new()).unwrap();
        let wire = client
            .create_request(&jwt(json!({"idNummer": "X123456789"})), request)
            .unwrap();

        let (status, body) = post_vau(&state, wire).await;
        assert_eq!(status, StatusCode::OK);
        let response = client.parse_response(&body).unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.body().len(), 64);

        let metrics = router(state.clone())
            .oneshot(http::Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let text = to_bytes(metrics.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&text).contains("outcome=\"ok\"} 1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handler_errors_are_encrypted() {
        let state = build_state(&test_config(), Arc::new(HashingHandler)).unwrap();
        let mut client = client(&state);
        let request = http::Request::get("/Task").body(Vec::new()).unwrap();
        let wire = client.create_request(&jwt(json!({})), request).unwrap();

        let (status, body) = post_vau(&state, wire).await;
        assert_eq!(status, StatusCode::OK);
        let response = client.parse_response(&body).unwrap();
        assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_garbage_is_a_generic_transport_error() {
        let state = build_state(&test_config(), Arc::new(NotImplementedHandler)).unwrap();
        for body in [Vec::new(), vec![1u8; 200]] {
            let (status, text) = post_vau(&state, body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(text, b"transport error");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_default_handler_answers_not_implemented() {
        let state = build_state(&test_config(), Arc::new(NotImplementedHandler)).unwrap();
        let mut client = client(&state);
        let request = http::Request::get("/metadata").body(Vec::new()).unwrap();
        let wire = client
            .create_request(&jwt(json!({"idNummer": "X123456789"})), request)
            .unwrap();
        let (status, body) = post_vau(&state, wire).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            client.parse_response(&body).unwrap().status(),
            http::StatusCode::NOT_IMPLEMENTED
        );
    }
}
