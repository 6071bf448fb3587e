//! Blob enrolment API
//!
//! ```text
//! POST|PUT /Enrolment/<TypeName>   store   201 | 409
//! DELETE   /Enrolment/<TypeName>   delete  204 | 404 | 409
//! GET      /Enrolment/<TypeName>   list metadata, never blob bytes
//! ```

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use erp_blob::BlobEntry;
use erp_core::{Blob, BlobType, ErpError, ErpResult};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::daemon::AppState;

/// `ErpError` rendered as `{ "code": ..., "description": ... }`.
pub struct ApiError(pub ErpError);

impl From<ErpError> for ApiError {
    fn from(e: ErpError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ErpError::NotFound(_) => StatusCode::NOT_FOUND,
            ErpError::Conflict(_) => StatusCode::CONFLICT,
            ErpError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            ErpError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            ErpError::HsmUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(code = self.0.code(), "enrolment request failed: {}", self.0);
        }
        let body = ErrorBody {
            code: self.0.code(),
            description: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreRequest {
    id: String,
    blob: String,
    #[serde(default)]
    generation: u64,
    expiry_date_time: Option<u64>,
    start_date_time: Option<u64>,
    end_date_time: Option<u64>,
    meta_ak_name: Option<String>,
    pcr_set: Option<Vec<u8>>,
    certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryMetadata {
    id: String,
    blob_id: u32,
    generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    expiry_date_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_date_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_date_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    release: Option<String>,
}

fn decode_b64(value: &str, field: &str) -> ErpResult<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| ErpError::MalformedInput(format!("{field} is not base64: {e}")))
}

fn from_unix(secs: Option<u64>) -> Option<SystemTime> {
    secs.map(|s| UNIX_EPOCH + Duration::from_secs(s))
}

fn to_unix(time: Option<SystemTime>) -> Option<u64> {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> ErpResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| ErpError::MalformedInput(format!("invalid request body: {e}")))
}

/// Type names may contain a slash (`Task/DerivationKey`).
fn blob_type(type_name: &str) -> ErpResult<BlobType> {
    let name = type_name.trim_start_matches('/');
    BlobType::from_admin_name(name)
        .ok_or_else(|| ErpError::NotFound(format!("unknown blob type {name:?}")))
}

impl StoreRequest {
    fn into_entry(self, blob_type: BlobType) -> ErpResult<BlobEntry> {
        let name = decode_b64(&self.id, "id")?;
        if name.is_empty() {
            return Err(ErpError::MalformedInput("id must not be empty".into()));
        }
        let data = decode_b64(&self.blob, "blob")?;
        let mut entry = BlobEntry::new(blob_type, name, Blob::new(data, self.generation))
            .with_validity(from_unix(self.start_date_time), from_unix(self.end_date_time));
        entry.expiry = from_unix(self.expiry_date_time);
        entry.meta_ak_name = self
            .meta_ak_name
            .as_deref()
            .map(|v| decode_b64(v, "metaAkName"))
            .transpose()?;
        entry.pcr_set = self.pcr_set;
        entry.certificate = self.certificate;
        Ok(entry)
    }
}

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/Enrolment/{*type_name}",
        post(store_handler)
            .put(store_handler)
            .delete(delete_handler)
            .get(list_handler),
    )
}

async fn store_handler(
    State(state): State<AppState>,
    Path(type_name): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let entry = parse_body::<StoreRequest>(&body)?.into_entry(blob_type(&type_name)?)?;
    let cache = state.blob_cache().clone();
    let id = tokio::task::spawn_blocking(move || cache.store_blob(entry))
        .await
        .map_err(|e| ErpError::Other(e.into()))??;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "blobId": id.0 }))))
}

async fn delete_handler(
    State(state): State<AppState>,
    Path(type_name): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let blob_type = blob_type(&type_name)?;
    let name = decode_b64(&parse_body::<DeleteRequest>(&body)?.id, "id")?;
    let cache = state.blob_cache().clone();
    tokio::task::spawn_blocking(move || cache.delete_blob(blob_type, &name))
        .await
        .map_err(|e| ErpError::Other(e.into()))??;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_handler(
    State(state): State<AppState>,
    Path(type_name): Path<String>,
) -> Result<Json<Vec<EntryMetadata>>, ApiError> {
    let blob_type = blob_type(&type_name)?;
    let cache = state.blob_cache().clone();
    let entries = tokio::task::spawn_blocking(move || cache.get_all_blobs_sorted_by_id())
        .await
        .map_err(|e| ErpError::Other(e.into()))??;
    let listed = entries
        .into_iter()
        .filter(|e| e.blob_type == blob_type)
        .map(|e| EntryMetadata {
            id: STANDARD.encode(&e.name),
            blob_id: e.id.0,
            generation: e.blob.generation,
            expiry_date_time: to_unix(e.expiry),
            start_date_time: to_unix(e.start),
            end_date_time: to_unix(e.end),
            release: e.release,
        })
        .collect();
    Ok(Json(listed))
}
