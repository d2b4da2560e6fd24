use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use json_patch::Patch;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{error, info, warn};

use crate::config::ResourceConfig;
use crate::engine::{MutationEngine, MutationError};
use crate::metrics::{PluginManagerMetrics, PolicyLabels, RequestLabels};

const JSON_MEDIA_TYPE: &str = "application/json";
const UNKNOWN_OPERATION: &str = "UNKNOWN";

pub struct AppState {
    pub engine: MutationEngine,
    pub resource: ResourceConfig,
    pub deny_on_decode_error: bool,
    pub metrics: Arc<PluginManagerMetrics>,
}

pub type SharedState = Arc<AppState>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Patched,
    Unchanged,
    Skipped,
    DecodeError,
    Denied,
    Error,
    Invalid,
    UnsupportedMediaType,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Patched => "patched",
            Outcome::Unchanged => "unchanged",
            Outcome::Skipped => "skipped",
            Outcome::DecodeError => "decode_error",
            Outcome::Denied => "denied",
            Outcome::Error => "error",
            Outcome::Invalid => "invalid",
            Outcome::UnsupportedMediaType => "unsupported_media_type",
        }
    }
}

pub async fn handle_mutate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();

    if !is_json(&headers) {
        warn!(
            content_type = ?headers.get(header::CONTENT_TYPE),
            "dropping admission request with unsupported content type"
        );
        finish(&state, UNKNOWN_OPERATION.to_string(), Outcome::UnsupportedMediaType, start);
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!("failed to deserialize AdmissionReview: {e}");
            finish(&state, UNKNOWN_OPERATION.to_string(), Outcome::Invalid, start);
            let resp = AdmissionResponse::invalid(format!("failed to deserialize request: {e}"));
            return review_to_json(resp.into_review()).into_response();
        }
    };

    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(r) => r,
        Err(e) => {
            warn!("AdmissionReview missing request field: {e}");
            finish(&state, UNKNOWN_OPERATION.to_string(), Outcome::Invalid, start);
            let resp = AdmissionResponse::invalid("missing request field in AdmissionReview");
            return review_to_json(resp.into_review()).into_response();
        }
    };

    let operation = format!("{:?}", req.operation).to_uppercase();
    let (response, outcome) = mutate_request(&state, &req).await;
    finish(&state, operation, outcome, start);

    review_to_json(response.into_review()).into_response()
}

async fn mutate_request(
    state: &AppState,
    req: &AdmissionRequest<DynamicObject>,
) -> (AdmissionResponse, Outcome) {
    let target = &req.resource;
    if target.group != state.resource.group || target.resource != state.resource.resource {
        warn!(
            uid = %req.uid,
            group = %target.group,
            resource = %target.resource,
            "admission request is not for the mutated resource"
        );
        return (approve(req, Patch(vec![])), Outcome::Skipped);
    }

    let Some(object) = &req.object else {
        warn!(uid = %req.uid, "admission request carries no object");
        return (approve(req, Patch(vec![])), Outcome::Skipped);
    };

    let object = match serde_json::to_value(object) {
        Ok(v) => v,
        Err(e) => return decode_failure(state, req, e.to_string()),
    };

    match state.engine.mutate(&target.version, &object).await {
        Ok(mutation) => {
            for policy in mutation.applied {
                state
                    .metrics
                    .policies_applied_total
                    .get_or_create(&PolicyLabels { policy })
                    .inc();
            }
            let outcome = if mutation.patch.0.is_empty() {
                Outcome::Unchanged
            } else {
                Outcome::Patched
            };
            info!(
                uid = %req.uid,
                name = %req.name,
                operations = mutation.patch.0.len(),
                skipped = ?mutation.skipped,
                "mutated resource"
            );
            (approve(req, mutation.patch), outcome)
        }
        Err(MutationError::UnsupportedVersion(version)) => {
            warn!(uid = %req.uid, version = %version, "no schema for resource version");
            (approve(req, Patch(vec![])), Outcome::Skipped)
        }
        Err(MutationError::Decode(e)) => decode_failure(state, req, e.to_string()),
        Err(e) => {
            error!(uid = %req.uid, "mutation failed, approving without changes: {e}");
            let mut resp = approve(req, Patch(vec![]));
            resp.warnings
                .get_or_insert_with(Vec::new)
                .push(format!("plugin-manager: {e}"));
            (resp, Outcome::Error)
        }
    }
}

fn decode_failure(
    state: &AppState,
    req: &AdmissionRequest<DynamicObject>,
    reason: String,
) -> (AdmissionResponse, Outcome) {
    let message = format!("failed to decode resource: {reason}");
    warn!(uid = %req.uid, "{message}");

    let denied = AdmissionResponse::from(req).deny(message.clone());
    if state.deny_on_decode_error {
        return (denied, Outcome::Denied);
    }

    // deny() is the only way to attach a status message; flip it back.
    let mut resp = denied;
    resp.allowed = true;
    resp.warnings = Some(vec![message]);
    (resp, Outcome::DecodeError)
}

/// Approves `req` with `patch`, sending an explicit empty array when there is
/// nothing to change.
fn approve(req: &AdmissionRequest<DynamicObject>, patch: Patch) -> AdmissionResponse {
    match AdmissionResponse::from(req).with_patch(patch) {
        Ok(resp) => resp,
        Err(e) => {
            error!(uid = %req.uid, "failed to serialize patch: {e}");
            let mut fallback = AdmissionResponse::from(req);
            fallback.warnings = Some(vec!["plugin-manager: failed to serialize patch".to_string()]);
            fallback
        }
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(JSON_MEDIA_TYPE))
}

fn review_to_json(review: AdmissionReview<DynamicObject>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(review).expect("AdmissionReview serialization is infallible"))
}

fn finish(state: &AppState, operation: String, outcome: Outcome, start: Instant) {
    state
        .metrics
        .admission_requests_total
        .get_or_create(&RequestLabels {
            operation,
            outcome: outcome.as_str(),
        })
        .inc();
    state
        .metrics
        .admission_request_duration_seconds
        .observe(start.elapsed().as_secs_f64());
}
