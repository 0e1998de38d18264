use std::{sync::Arc, time::Instant};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{error, warn};

use caf_sync_core::normalizer::{Normalizer, NormalizerError};
use caf_sync_core::types::ChangeNotification;
use caf_sync_storage::NewChangeEvent;

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::sync::SyncOutcome;
use crate::tap::{StageEvent, StageKind, StageMetadata, StagePayload};

pub const HEADER_MESSAGE_ID: &str = "X-Change-Event-Id";
pub const HEADER_TIMESTAMP: &str = "X-Change-Event-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Change-Event-Signature";

/// Maximum accepted clock skew between the delivery timestamp and now.
const MAX_SKEW_SECONDS: i64 = 600;

/// Receives one record-change delivery, verifies its authenticity, and runs
/// the synchronization pipeline inside the request. A store failure surfaces
/// as a 5xx so the delivery fails outright and can be redelivered.
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let message_id = get_required_header(&headers, HEADER_MESSAGE_ID)?;
    let timestamp_raw = get_required_header(&headers, HEADER_TIMESTAMP)?;
    let signature = get_required_header(&headers, HEADER_SIGNATURE)?;

    let timestamp = parse_timestamp(timestamp_raw).map_err(|err| {
        observe_ack("rejected", start);
        ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_timestamp", err)
    })?;

    let now = state.now();
    let skew = now.signed_duration_since(timestamp).num_seconds().abs();
    if skew > MAX_SKEW_SECONDS {
        warn!(
            stage = "ingress",
            %message_id,
            %timestamp_raw,
            now = %now.to_rfc3339(),
            skew_seconds = skew,
            "timestamp outside the allowed window"
        );
        observe_ack("rejected", start);
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "timestamp_out_of_range",
            "timestamp outside the allowed ±10 minute window",
        ));
    }

    let secret = state.webhook_secret();
    verify_signature(&secret, message_id, timestamp_raw, &body, signature).map_err(|err| {
        counter!("webhook_invalid_signature_total").increment(1);
        observe_ack("rejected", start);
        ProblemResponse::new(StatusCode::FORBIDDEN, "invalid_signature", err)
    })?;

    let body_string = String::from_utf8(body.to_vec()).map_err(|_| {
        observe_ack("rejected", start);
        ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_payload",
            "request body must be valid UTF-8",
        )
    })?;
    let json_value: Value = serde_json::from_str(&body_string).map_err(|err| {
        observe_ack("rejected", start);
        ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("failed to parse payload: {err}"),
        )
    })?;

    let normalize_started = Instant::now();
    let notification = match Normalizer::normalize(&json_value) {
        Ok(notification) => notification,
        Err(err) => {
            emit_normalizer_error(&state, &json_value, message_id, body.len() as u64, &err);
            observe_ack("rejected", start);
            return Err(ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "invalid_notification",
                err.to_string(),
            ));
        }
    };
    emit_normalizer_stage(
        &state,
        &json_value,
        &notification,
        message_id,
        body.len() as u64,
        normalize_started.elapsed().as_secs_f64() * 1000.0,
    );

    counter!(
        "change_ingress_total",
        "operation" => notification.operation.as_str().to_string()
    )
    .increment(1);

    let journal = NewChangeEvent {
        msg_id: message_id,
        entity: &notification.entity,
        operation: notification.operation.as_str(),
        payload_json: &body_string,
        event_at: timestamp,
        received_at: now,
    };

    let outcome = state
        .sync()
        .process(&journal, &notification)
        .await
        .map_err(|err| {
            error!(
                stage = "sync",
                %message_id,
                record_id = %notification.record_id,
                error = %err,
                "failed to process change notification"
            );
            observe_ack("error", start);
            ProblemResponse::store_error()
        })?;

    counter!("sync_outcomes_total", "outcome" => outcome.metric_kind()).increment(1);
    emit_ingress_event(IngressEventContext {
        state: &state,
        message_id,
        notification: &notification,
        outcome: &outcome,
        body_len: body.len() as u64,
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        received_at: now,
    });
    observe_ack("accepted", start);

    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .unwrap())
}

fn observe_ack(result: &'static str, start: Instant) {
    histogram!("webhook_ack_latency_seconds", "result" => result)
        .record(start.elapsed().as_secs_f64());
}

fn emit_normalizer_stage(
    state: &AppState,
    json_value: &Value,
    notification: &ChangeNotification,
    message_id: &str,
    body_len: u64,
    latency_ms: f64,
) {
    let event = StageEvent {
        ts: state.now(),
        stage: StageKind::Normalizer,
        record_id: Some(notification.record_id),
        meta: StageMetadata {
            msg_id: Some(message_id.to_string()),
            operation: Some(notification.operation.as_str().to_string()),
            size_bytes: Some(body_len),
            latency_ms: Some(latency_ms),
            ..StageMetadata::default()
        },
        r#in: StagePayload {
            redacted: true,
            payload: sanitize_payload(json_value),
            truncated: None,
        },
        out: StagePayload {
            redacted: true,
            payload: notification.redacted(),
            truncated: None,
        },
    };
    state.tap().publish(event);
}

fn emit_normalizer_error(
    state: &AppState,
    json_value: &Value,
    message_id: &str,
    body_len: u64,
    err: &NormalizerError,
) {
    error!(
        stage = "normalizer",
        %message_id,
        error = %err,
        "failed to normalize change payload"
    );

    let event = StageEvent {
        ts: state.now(),
        stage: StageKind::Normalizer,
        record_id: None,
        meta: StageMetadata {
            msg_id: Some(message_id.to_string()),
            size_bytes: Some(body_len),
            message: Some("normalization_failed".to_string()),
            ..StageMetadata::default()
        },
        r#in: StagePayload {
            redacted: true,
            payload: sanitize_payload(json_value),
            truncated: None,
        },
        out: StagePayload {
            redacted: true,
            payload: json!({ "error": err.to_string() }),
            truncated: None,
        },
    };
    state.tap().publish(event);
}

struct IngressEventContext<'a> {
    state: &'a AppState,
    message_id: &'a str,
    notification: &'a ChangeNotification,
    outcome: &'a SyncOutcome,
    body_len: u64,
    elapsed_ms: f64,
    received_at: DateTime<Utc>,
}

fn emit_ingress_event(ctx: IngressEventContext<'_>) {
    let event = StageEvent {
        ts: ctx.received_at,
        stage: StageKind::Ingress,
        record_id: Some(ctx.notification.record_id),
        meta: StageMetadata {
            msg_id: Some(ctx.message_id.to_string()),
            operation: Some(ctx.notification.operation.as_str().to_string()),
            size_bytes: Some(ctx.body_len),
            latency_ms: Some(ctx.elapsed_ms),
            ..StageMetadata::default()
        },
        r#in: StagePayload {
            redacted: true,
            payload: Value::Null,
            truncated: None,
        },
        out: StagePayload {
            redacted: false,
            payload: json!({
                "status": StatusCode::NO_CONTENT.as_u16(),
                "outcome": ctx.outcome.metric_kind(),
            }),
            truncated: None,
        },
    };
    ctx.state.tap().publish(event);
}

/// Extracts the fields safe to echo into the tap from a raw payload.
fn sanitize_payload(value: &Value) -> Value {
    let mut sanitized = serde_json::Map::new();
    if let Some(operation) = value.get("operation").and_then(Value::as_str) {
        sanitized.insert("operation".to_string(), Value::String(operation.to_string()));
    }
    if let Some(entity) = value.get("entity").and_then(Value::as_str) {
        sanitized.insert("entity".to_string(), Value::String(entity.to_string()));
    }
    if let Some(record_id) = value
        .get("record")
        .and_then(Value::as_object)
        .and_then(|record| record.get("id"))
    {
        sanitized.insert("record_id".to_string(), record_id.clone());
    }
    Value::Object(sanitized)
}

fn get_required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ProblemResponse> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "missing_header",
                format!("missing header {name}"),
            )
        })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| format!("invalid RFC3339 timestamp: {err}"))
}

fn verify_signature(
    secret: &Arc<[u8]>,
    message_id: &str,
    timestamp: &str,
    body: &[u8],
    provided: &str,
) -> Result<(), String> {
    let hex_part = provided
        .strip_prefix("sha256=")
        .ok_or_else(|| "signature must start with 'sha256='".to_string())?;
    let provided_bytes =
        hex::decode(hex_part).map_err(|_| "signature is not valid hex".to_string())?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| "failed to initialize signature verifier".to_string())?;
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_bytes: &[u8] = expected.as_ref();

    if expected_bytes.ct_eq(provided_bytes.as_slice()).into() {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}
