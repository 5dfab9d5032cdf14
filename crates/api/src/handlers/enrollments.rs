//! Enrollment handlers.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use registrar_domain::{
    CancelWaitlistBody, Decision, DenyCode, DomainError, DropEnrollmentBody,
    EnrollmentRequest, EnrollmentsResponse, SubmitEnrollmentBody,
};
use registrar_engine::{EngineError, InvariantReport};

use crate::AppState;
use crate::middleware::auth::{AdminActor, AuthActor};

/// Submit an enrollment request.
pub async fn submit_enrollment(
    State(state): State<Arc<AppState>>,
    AuthActor(actor): AuthActor,
    Json(body): Json<SubmitEnrollmentBody>,
) -> Result<Response, DomainError> {
    body.validate().map_err(DomainError::from_validation_errors)?;

    tracing::info!(
        actor_id = %actor.actor_id,
        request_id = %body.request_id,
        student_id = %body.student_id,
        section_id = %body.section_id,
        "enrollment submission received"
    );

    let request = EnrollmentRequest {
        request_id: body.request_id,
        student_id: body.student_id,
        section_id: body.section_id,
        submitted_at: Utc::now(),
    };
    let decision = state
        .engine
        .submit_enrollment(actor, request, None)
        .await
        .map_err(map_engine_error)?;

    decision_response(decision)
}

/// Drop an enrolled seat.
pub async fn drop_enrollment(
    State(state): State<Arc<AppState>>,
    AuthActor(actor): AuthActor,
    Json(body): Json<DropEnrollmentBody>,
) -> Result<Response, DomainError> {
    tracing::info!(
        actor_id = %actor.actor_id,
        enrollment_id = %body.enrollment_id,
        "drop requested"
    );

    let decision = state
        .engine
        .drop_enrollment(actor, body.enrollment_id, None)
        .await
        .map_err(map_engine_error)?;

    decision_response(decision)
}

/// Leave a section waitlist.
pub async fn cancel_waitlist(
    State(state): State<Arc<AppState>>,
    AuthActor(actor): AuthActor,
    Json(body): Json<CancelWaitlistBody>,
) -> Result<Response, DomainError> {
    body.validate().map_err(DomainError::from_validation_errors)?;

    let decision = state
        .engine
        .cancel_waitlist(actor, body.student_id, &body.section_id, None)
        .await
        .map_err(map_engine_error)?;

    decision_response(decision)
}

#[derive(Debug, serde::Deserialize)]
pub struct EnrollmentsQuery {
    pub student_id: Uuid,
}

/// Current enrollments plus recent history for one student.
pub async fn list_enrollments(
    State(state): State<Arc<AppState>>,
    AuthActor(actor): AuthActor,
    Query(query): Query<EnrollmentsQuery>,
) -> Result<Json<EnrollmentsResponse>, DomainError> {
    if !actor.may_act_for(query.student_id) {
        return Err(DomainError::Forbidden(
            "Students may only view their own enrollments".to_string(),
        ));
    }

    let aggregate = state
        .engine
        .student_enrollments(query.student_id)
        .await
        .map_err(map_engine_error)?;

    let cutoff = Utc::now() - state.engine.config().history_window;
    Ok(Json(EnrollmentsResponse::from_aggregate(&aggregate, cutoff)))
}

/// Admin-only invariant sweep.
pub async fn audit_report(
    State(state): State<Arc<AppState>>,
    _admin: AdminActor,
) -> Result<Json<InvariantReport>, DomainError> {
    let report = state
        .engine
        .audit_state()
        .await
        .map_err(map_engine_error)?;

    if !report.is_clean() {
        tracing::error!(
            violations = report.violations.len(),
            "audit report found invariant violations"
        );
    }

    Ok(Json(report))
}

/// Verdicts become 200s; denials 409s (transient ones 503); policy traces
/// ride along on both, never on auth failures.
fn decision_response(decision: Decision) -> Result<Response, DomainError> {
    match decision.into_response_parts() {
        Ok(ok) => Ok((StatusCode::OK, Json(ok)).into_response()),
        Err(denied) if denied.reason_code == DenyCode::Transient => {
            Err(DomainError::Transient(denied.message))
        }
        Err(denied) => Ok((StatusCode::CONFLICT, Json(denied)).into_response()),
    }
}

fn map_engine_error(e: EngineError) -> DomainError {
    match e {
        EngineError::Forbidden { .. } => DomainError::Forbidden(e.to_string()),
        EngineError::UnknownEnrollment(id) => {
            DomainError::NotFound(format!("enrollment {id}"))
        }
        EngineError::Store(_) | EngineError::Replay(_) | EngineError::Internal(_) => {
            tracing::error!(error = %e, "engine infrastructure failure");
            DomainError::Transient("the registrar is temporarily unavailable".to_string())
        }
    }
}
