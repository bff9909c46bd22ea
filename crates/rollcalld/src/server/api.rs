use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{Local, NaiveDate};
use rollcall_core::MatchDecision;
use rollcall_gallery::{EnrollPolicy, EnrollReport, IdentitySummary, LoadReport};
use serde_json::{json, Value};

use super::error::{AppError, Result};
use super::types::*;
use super::AppState;
use crate::attendance::{AttendanceRecord, MarkOutcome};

/// Decode a base64 payload, accepting `data:image/...;base64,` prefixes.
pub(crate) fn decode_image(encoded: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    let payload = match encoded.split_once(',') {
        Some((header, data)) if header.starts_with("data:") => data,
        _ => encoded,
    };
    STANDARD.decode(payload.trim())
}

/// Recognize a webcam frame and mark the student present.
///
/// Every outcome, including malformed input, is a JSON body with
/// `success` and `message`.
pub async fn upload_image(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Json<UploadImageResponse> {
    let body = match body {
        Ok(body) => body,
        Err(e) => return Json(UploadImageResponse::failure(format!("Invalid request: {e}"))),
    };
    let request: UploadImageRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return Json(UploadImageResponse::failure(format!("Invalid request: {e}"))),
    };
    let image = match decode_image(&request.image) {
        Ok(image) => image,
        Err(e) => return Json(UploadImageResponse::failure(format!("Invalid image data: {e}"))),
    };

    let matched = match state.engine.process_frame(image).await {
        MatchDecision::Matched(m) => m,
        MatchDecision::NoMatch { reason } => {
            return Json(UploadImageResponse {
                reason: Some(reason),
                ..UploadImageResponse::failure(format!("Face not recognized: {}", reason.message()))
            });
        }
    };

    let recorder = Arc::clone(&state.attendance);
    let identity = matched.identity.clone();
    let marked = tokio::task::spawn_blocking(move || {
        recorder.mark_present(&identity, Local::now().naive_local())
    })
    .await;

    let (success, message) = match marked {
        Ok(Ok(MarkOutcome::Recorded)) => {
            (true, format!("{}'s attendance marked successfully!", matched.identity))
        }
        Ok(Ok(MarkOutcome::AlreadyMarked)) => {
            (false, format!("{}'s attendance already marked today.", matched.identity))
        }
        Ok(Err(e)) => {
            tracing::error!(identity = %matched.identity, error = %e, "failed to record attendance");
            (false, format!("Error recording attendance: {e}"))
        }
        Err(e) => (false, format!("Error recording attendance: {e}")),
    };

    Json(UploadImageResponse {
        success,
        message,
        identity: Some(matched.identity),
        confidence: Some(matched.confidence),
        reason: None,
    })
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let gallery = state.engine.gallery();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        metric: state.policy.metric.as_str(),
        threshold: state.policy.threshold,
        margin: state.policy.margin,
        identities: gallery.len(),
        generation: gallery.generation(),
    })
}

pub async fn list_identities(State(state): State<Arc<AppState>>) -> Json<Vec<IdentitySummary>> {
    Json(state.engine.gallery().identities())
}

/// Enroll reference photos. The body is parsed here so that a malformed
/// request still gets the JSON error shape.
pub async fn enroll_identity(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<EnrollReport>)> {
    let body = body.map_err(|e| AppError::new(e.status(), "invalid_request", e.body_text()))?;
    let request: EnrollRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request("invalid_request", format!("invalid enrollment request: {e}")))?;
    let images = request
        .images
        .iter()
        .enumerate()
        .map(|(index, encoded)| {
            decode_image(encoded).map_err(|e| {
                AppError::bad_request("undecodable_photo", format!("photo {index} is not valid base64: {e}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let policy = if request.append {
        EnrollPolicy::Append
    } else {
        EnrollPolicy::CreateNew
    };
    let report = state.engine.enroll(request.label, images, policy).await?;
    let status = if report.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)))
}

pub async fn remove_identity(
    State(state): State<Arc<AppState>>,
    Path(label): Path<String>,
) -> Result<Json<Value>> {
    let removed = state.engine.remove_identity(label.clone()).await?;
    Ok(Json(json!({
        "success": true,
        "identity": label,
        "removed": removed,
    })))
}

pub async fn refresh_gallery(State(state): State<Arc<AppState>>) -> Result<Json<LoadReport>> {
    Ok(Json(state.engine.refresh().await?))
}

pub async fn attendance_on(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AttendanceQuery>,
) -> Result<Json<Vec<AttendanceRecord>>> {
    let date = match query.date.as_deref() {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
            AppError::bad_request("invalid_date", format!("expected YYYY-MM-DD, got {raw:?}"))
        })?,
        None => Local::now().date_naive(),
    };
    let recorder = Arc::clone(&state.attendance);
    let records = tokio::task::spawn_blocking(move || recorder.records_on(date)).await??;
    Ok(Json(records))
}

pub async fn delete_attendance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    let recorder = Arc::clone(&state.attendance);
    if !tokio::task::spawn_blocking(move || recorder.delete_record(id)).await?? {
        return Err(AppError::new(
            StatusCode::NOT_FOUND,
            "unknown_record",
            format!("attendance record {id} not found"),
        ));
    }
    Ok(Json(json!({ "success": true, "id": id })))
}
