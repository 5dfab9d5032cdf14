//! The enrollment coordinator: owns the request lifecycle.
//!
//! Concurrency contract: the section lock serializes admissions into one
//! section; the event store's `expected_version` check keeps the books
//! correct even if a stale lock is reclaimed out from under a holder. A
//! version conflict releases the lock, backs off, and retries a bounded
//! number of times.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use uuid::Uuid;

use registrar_domain::{
    Actor, AggregateError, AuditAction, Decision, DenyCode, EngineVerdict, EnrollmentRequest,
    EventEnvelope, EventPayload, PolicyCheck, PolicyEngine, PolicyEnv, PolicyInput, Section,
    SectionAggregate, StudentAggregate, StudentProfile, STUDENT_STREAM_PREFIX, section_stream,
    student_stream,
};
use registrar_storage::{AuditLog, EventStore, SnapshotStore, StorageError};

use crate::directory::{CampusDirectory, DirectoryError};
use crate::error::EngineError;
use crate::lock::LockManager;

const BACKOFF_BASE_MS: u64 = 10;
const BACKOFF_CAP_MS: u64 = 500;
/// Retries for an append that must land while the section lock is held.
const LOCKED_APPEND_ATTEMPTS: u32 = 3;

/// Actor recorded for engine-initiated events (promotions, reconciliation).
pub const SYSTEM_ACTOR: &str = "system:registrar";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub lock_wait_timeout: Duration,
    pub lock_hold_ttl: Duration,
    pub snapshot_interval: u64,
    pub max_retries: u32,
    pub credit_cap_default: u32,
    pub max_waitlist: u32,
    pub history_window: chrono::Duration,
    pub section_cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout: Duration::from_secs(5),
            lock_hold_ttl: Duration::from_secs(30),
            snapshot_interval: 100,
            max_retries: 3,
            credit_cap_default: 18,
            max_waitlist: 10,
            history_window: chrono::Duration::days(30),
            section_cache_ttl: Duration::from_secs(10),
        }
    }
}

struct CachedSection {
    fetched_at: Instant,
    section: Section,
}

/// What one locked attempt produced.
enum Attempt {
    Decided(Decision),
    /// Optimistic check lost; release, back off, retry.
    Conflict,
}

enum DropAttempt {
    Decided { decision: Decision, promote: bool },
    Conflict,
}

pub struct EnrollmentEngine {
    pub(crate) locks: LockManager,
    pub(crate) events: EventStore,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) audit: AuditLog,
    pub(crate) directory: Arc<dyn CampusDirectory>,
    policies: PolicyEngine,
    config: EngineConfig,
    section_cache: DashMap<String, CachedSection>,
}

impl EnrollmentEngine {
    pub fn new(
        events: EventStore,
        snapshots: SnapshotStore,
        audit: AuditLog,
        directory: Arc<dyn CampusDirectory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            locks: LockManager::new(),
            events,
            snapshots,
            audit,
            directory,
            policies: PolicyEngine::standard(),
            config,
            section_cache: DashMap::new(),
        }
    }

    pub fn from_pool(
        pool: sqlx::SqlitePool,
        directory: Arc<dyn CampusDirectory>,
        config: EngineConfig,
    ) -> Self {
        Self::new(
            EventStore::new(pool.clone()),
            SnapshotStore::new(pool.clone()),
            AuditLog::new(pool),
            directory,
            config,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Decide one enrollment request.
    pub async fn submit_enrollment(
        &self,
        actor: Actor,
        request: EnrollmentRequest,
        deadline: Option<Instant>,
    ) -> Result<Decision, EngineError> {
        if !actor.may_act_for(request.student_id) {
            return Err(EngineError::Forbidden {
                actor: actor.actor_id,
                student: request.student_id,
            });
        }

        if let Some(prior) = self.prior_decision(request.request_id).await? {
            tracing::info!(
                request_id = %request.request_id,
                student_id = %request.student_id,
                "returning prior decision for resubmitted request"
            );
            return Ok(prior);
        }

        let lock_name = section_stream(&request.section_id);
        let owner = Uuid::new_v4().to_string();

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                backoff(attempt).await;
            }

            let wait = match remaining_wait(deadline, self.config.lock_wait_timeout) {
                Some(wait) => wait,
                None => {
                    return Ok(Decision::denied(
                        DenyCode::Timeout,
                        "deadline expired before the section lock was acquired",
                    ));
                }
            };

            let granted = self
                .locks
                .acquire(&lock_name, &owner, self.config.lock_hold_ttl, wait)
                .await;
            if !granted.is_granted() {
                return Ok(Decision::denied(DenyCode::Busy, "section is busy"));
            }

            let outcome = self.submit_under_lock(&actor, &request).await;
            if let Err(e) = self.locks.release(&lock_name, &owner) {
                tracing::warn!(lock = %lock_name, error = %e, "lock release failed");
            }

            match outcome? {
                Attempt::Decided(decision) => return Ok(decision),
                Attempt::Conflict => {
                    tracing::debug!(
                        request_id = %request.request_id,
                        attempt,
                        "version conflict; retrying"
                    );
                }
            }
        }

        Ok(Decision::denied(
            DenyCode::Busy,
            "too many concurrent updates to this section",
        ))
    }

    async fn submit_under_lock(
        &self,
        actor: &Actor,
        request: &EnrollmentRequest,
    ) -> Result<Attempt, EngineError> {
        // A racing duplicate of this request may have been decided while we
        // waited for the lock.
        if let Some(prior) = self.prior_decision(request.request_id).await? {
            return Ok(Attempt::Decided(prior));
        }

        let section = match self.section_metadata(&request.section_id).await {
            Ok(section) => section,
            Err(denied) => return Ok(Attempt::Decided(denied)),
        };
        let profile = match self.student_profile(request.student_id).await {
            Ok(profile) => profile,
            Err(denied) => return Ok(Attempt::Decided(denied)),
        };

        let student = self.replay_student(request.student_id).await?;
        let section_state = self.replay_section(&request.section_id).await?;
        let before = student.summary();

        let env = self.policy_env();
        let input = PolicyInput {
            request,
            section: &section,
            profile: &profile,
            student: &student,
            section_state: &section_state,
            env: &env,
        };
        let (verdict, trace) = self.policies.evaluate(&input);

        let student_stream_id = student_stream(request.student_id);
        let section_stream_id = section_stream(&request.section_id);

        match verdict {
            EngineVerdict::Deny(code) => {
                let payload = EventPayload::RequestRejected {
                    student_id: request.student_id,
                    section_id: request.section_id.clone(),
                    reason: code,
                };
                let envelope = match self
                    .events
                    .append(&student_stream_id, student.version, request.request_id, &payload)
                    .await
                {
                    Ok(envelope) => envelope,
                    Err(e) if e.is_version_conflict() => return Ok(Attempt::Conflict),
                    Err(e) => return Err(e.into()),
                };

                let after = applied(&student, &envelope).summary();
                self.record_audit(
                    &actor.actor_id.to_string(),
                    AuditAction::Reject,
                    &request.section_id,
                    before,
                    after,
                    vec![envelope.event_id],
                )
                .await;
                self.snapshot_student(&student, &envelope);

                let message = deny_message(&trace, code);
                tracing::info!(
                    request_id = %request.request_id,
                    student_id = %request.student_id,
                    section_id = %request.section_id,
                    reason = %code,
                    "enrollment denied"
                );
                Ok(Attempt::Decided(
                    Decision::denied(code, message).with_trace(trace),
                ))
            }
            EngineVerdict::AdmitToWaitlist => {
                let position = section_state.waitlist.len() as u32 + 1;
                let payload = EventPayload::Waitlisted {
                    student_id: request.student_id,
                    section_id: request.section_id.clone(),
                    position,
                };

                let student_env = match self
                    .events
                    .append(&student_stream_id, student.version, request.request_id, &payload)
                    .await
                {
                    Ok(envelope) => envelope,
                    Err(e) if e.is_version_conflict() => return Ok(Attempt::Conflict),
                    Err(e) => return Err(e.into()),
                };

                let section_env = match self
                    .events
                    .append(
                        &section_stream_id,
                        section_state.version,
                        request.request_id,
                        &payload,
                    )
                    .await
                {
                    Ok(envelope) => envelope,
                    Err(e) if e.is_version_conflict() => {
                        // Undo the student-side membership before retrying:
                        // the aggregate must read as if this attempt never
                        // happened.
                        self.compensate_student(
                            &student_stream_id,
                            request.request_id,
                            EventPayload::WaitlistCancelled {
                                student_id: request.student_id,
                                section_id: request.section_id.clone(),
                            },
                        )
                        .await?;
                        return Ok(Attempt::Conflict);
                    }
                    Err(e) => return Err(e.into()),
                };

                let after = applied(&student, &student_env).summary();
                self.record_audit(
                    &actor.actor_id.to_string(),
                    AuditAction::Waitlist,
                    &request.section_id,
                    before,
                    after,
                    vec![student_env.event_id, section_env.event_id],
                )
                .await;
                self.snapshot_student(&student, &student_env);
                self.snapshot_section(&section_state, &section_env);

                tracing::info!(
                    request_id = %request.request_id,
                    student_id = %request.student_id,
                    section_id = %request.section_id,
                    position,
                    "admitted to waitlist"
                );
                Ok(Attempt::Decided(Decision::waitlisted(trace)))
            }
            EngineVerdict::Enroll => {
                let enrollment_id = Uuid::new_v4();
                let student_payload = EventPayload::Enrolled {
                    enrollment_id,
                    student_id: request.student_id,
                    section_id: request.section_id.clone(),
                    credits: section.credits,
                    schedule: section.schedule.clone(),
                };

                let student_env = match self
                    .events
                    .append(
                        &student_stream_id,
                        student.version,
                        request.request_id,
                        &student_payload,
                    )
                    .await
                {
                    Ok(envelope) => envelope,
                    Err(e) if e.is_version_conflict() => return Ok(Attempt::Conflict),
                    Err(e) => return Err(e.into()),
                };

                let section_payload = EventPayload::CapacityConsumed {
                    enrollment_id,
                    student_id: request.student_id,
                };
                let section_env = match self
                    .events
                    .append(
                        &section_stream_id,
                        section_state.version,
                        request.request_id,
                        &section_payload,
                    )
                    .await
                {
                    Ok(envelope) => envelope,
                    Err(e) if e.is_version_conflict() => {
                        self.compensate_student(
                            &student_stream_id,
                            request.request_id,
                            EventPayload::Dropped {
                                enrollment_id,
                                student_id: request.student_id,
                                section_id: request.section_id.clone(),
                            },
                        )
                        .await?;
                        return Ok(Attempt::Conflict);
                    }
                    Err(e) => return Err(e.into()),
                };

                let after = applied(&student, &student_env).summary();
                self.record_audit(
                    &actor.actor_id.to_string(),
                    AuditAction::Enroll,
                    &request.section_id,
                    before,
                    after,
                    vec![student_env.event_id, section_env.event_id],
                )
                .await;
                self.snapshot_student(&student, &student_env);
                self.snapshot_section(&section_state, &section_env);

                tracing::info!(
                    request_id = %request.request_id,
                    student_id = %request.student_id,
                    section_id = %request.section_id,
                    enrollment_id = %enrollment_id,
                    "enrolled"
                );
                Ok(Attempt::Decided(Decision::enrolled(enrollment_id, trace)))
            }
        }
    }

    /// Drop an enrolled seat, then promote from the waitlist if a seat
    /// freed up.
    pub async fn drop_enrollment(
        &self,
        actor: Actor,
        enrollment_id: Uuid,
        deadline: Option<Instant>,
    ) -> Result<Decision, EngineError> {
        let origin = self
            .events
            .find_enrollment_event(enrollment_id)
            .await?
            .ok_or(EngineError::UnknownEnrollment(enrollment_id))?;
        let (student_id, section_id) = match &origin.payload {
            EventPayload::Enrolled {
                student_id,
                section_id,
                ..
            }
            | EventPayload::Promoted {
                student_id,
                section_id,
                ..
            } => (*student_id, section_id.clone()),
            other => {
                return Err(EngineError::Internal(format!(
                    "enrollment {enrollment_id} resolved to a {} event",
                    other.kind()
                )));
            }
        };

        if !actor.may_act_for(student_id) {
            return Err(EngineError::Forbidden {
                actor: actor.actor_id,
                student: student_id,
            });
        }

        let section = match self.section_metadata(&section_id).await {
            Ok(section) => section,
            Err(denied) => return Ok(denied),
        };
        if let Some(add_drop_deadline) = section.add_drop_deadline
            && Utc::now() > add_drop_deadline
        {
            return Ok(Decision::denied(
                DenyCode::DeadlinePassed,
                format!("add/drop closed at {}", add_drop_deadline.to_rfc3339()),
            ));
        }

        let lock_name = section_stream(&section_id);
        let owner = Uuid::new_v4().to_string();
        let op_id = Uuid::new_v4();

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                backoff(attempt).await;
            }

            let wait = match remaining_wait(deadline, self.config.lock_wait_timeout) {
                Some(wait) => wait,
                None => {
                    return Ok(Decision::denied(
                        DenyCode::Timeout,
                        "deadline expired before the section lock was acquired",
                    ));
                }
            };

            let granted = self
                .locks
                .acquire(&lock_name, &owner, self.config.lock_hold_ttl, wait)
                .await;
            if !granted.is_granted() {
                return Ok(Decision::denied(DenyCode::Busy, "section is busy"));
            }

            let outcome = self
                .drop_under_lock(&actor, student_id, &section, enrollment_id, op_id)
                .await;

            let outcome = match outcome {
                Ok(DropAttempt::Decided { decision, promote }) => {
                    if promote {
                        // Promotion can outlive the original hold budget.
                        let _ = self
                            .locks
                            .extend(&lock_name, &owner, self.config.lock_hold_ttl);
                        if let Err(e) = self.promote_waiters(&section).await {
                            tracing::warn!(
                                section_id = %section.section_id,
                                error = %e,
                                "waitlist promotion failed; reconciler will retry"
                            );
                        }
                    }
                    Ok(Some(decision))
                }
                Ok(DropAttempt::Conflict) => Ok(None),
                Err(e) => Err(e),
            };

            if let Err(e) = self.locks.release(&lock_name, &owner) {
                tracing::warn!(lock = %lock_name, error = %e, "lock release failed");
            }

            if let Some(decision) = outcome? {
                return Ok(decision);
            }
        }

        Ok(Decision::denied(
            DenyCode::Busy,
            "too many concurrent updates to this section",
        ))
    }

    async fn drop_under_lock(
        &self,
        actor: &Actor,
        student_id: Uuid,
        section: &Section,
        enrollment_id: Uuid,
        op_id: Uuid,
    ) -> Result<DropAttempt, EngineError> {
        let student = self.replay_student(student_id).await?;
        if !student.active.contains_key(&enrollment_id) {
            // Already dropped (or compensated away): report the current
            // status without touching any stream.
            tracing::info!(
                student_id = %student_id,
                enrollment_id = %enrollment_id,
                status = ?student.status_of(enrollment_id),
                "drop is a no-op; enrollment is not active"
            );
            return Ok(DropAttempt::Decided {
                decision: Decision::dropped(enrollment_id),
                promote: false,
            });
        }

        let section_state = self.replay_section(&section.section_id).await?;
        let before = student.summary();
        let student_stream_id = student_stream(student_id);
        let section_stream_id = section_stream(&section.section_id);

        let student_env = match self
            .events
            .append(
                &student_stream_id,
                student.version,
                op_id,
                &EventPayload::Dropped {
                    enrollment_id,
                    student_id,
                    section_id: section.section_id.clone(),
                },
            )
            .await
        {
            Ok(envelope) => envelope,
            Err(e) if e.is_version_conflict() => return Ok(DropAttempt::Conflict),
            Err(e) => return Err(e.into()),
        };

        // The drop is committed. The seat release below is retried under the
        // lock, and a persistent failure is left to the reconciler; the drop
        // itself is never rolled back.
        let mut event_ids = vec![student_env.event_id];
        match self
            .append_section_locked(
                &section_stream_id,
                section_state.version,
                op_id,
                &EventPayload::CapacityReleased {
                    enrollment_id,
                    student_id,
                },
            )
            .await?
        {
            Some(envelope) => {
                self.snapshot_section(&section_state, &envelope);
                event_ids.push(envelope.event_id);
            }
            None => {
                tracing::warn!(
                    section_id = %section.section_id,
                    enrollment_id = %enrollment_id,
                    "seat release kept conflicting; reconciler will settle the count"
                );
            }
        }

        let after = applied(&student, &student_env).summary();
        self.record_audit(
            &actor.actor_id.to_string(),
            AuditAction::Drop,
            &section.section_id,
            before,
            after,
            event_ids,
        )
        .await;
        self.snapshot_student(&student, &student_env);

        tracing::info!(
            student_id = %student_id,
            section_id = %section.section_id,
            enrollment_id = %enrollment_id,
            "dropped"
        );
        Ok(DropAttempt::Decided {
            decision: Decision::dropped(enrollment_id),
            promote: true,
        })
    }

    /// Leave a waitlist without taking a seat.
    pub async fn cancel_waitlist(
        &self,
        actor: Actor,
        student_id: Uuid,
        section_id: &str,
        deadline: Option<Instant>,
    ) -> Result<Decision, EngineError> {
        if !actor.may_act_for(student_id) {
            return Err(EngineError::Forbidden {
                actor: actor.actor_id,
                student: student_id,
            });
        }

        let lock_name = section_stream(section_id);
        let owner = Uuid::new_v4().to_string();
        let op_id = Uuid::new_v4();

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                backoff(attempt).await;
            }

            let wait = match remaining_wait(deadline, self.config.lock_wait_timeout) {
                Some(wait) => wait,
                None => {
                    return Ok(Decision::denied(
                        DenyCode::Timeout,
                        "deadline expired before the section lock was acquired",
                    ));
                }
            };

            let granted = self
                .locks
                .acquire(&lock_name, &owner, self.config.lock_hold_ttl, wait)
                .await;
            if !granted.is_granted() {
                return Ok(Decision::denied(DenyCode::Busy, "section is busy"));
            }

            let outcome = self
                .cancel_under_lock(&actor, student_id, section_id, op_id)
                .await;
            if let Err(e) = self.locks.release(&lock_name, &owner) {
                tracing::warn!(lock = %lock_name, error = %e, "lock release failed");
            }

            match outcome? {
                Attempt::Decided(decision) => return Ok(decision),
                Attempt::Conflict => {}
            }
        }

        Ok(Decision::denied(
            DenyCode::Busy,
            "too many concurrent updates to this section",
        ))
    }

    async fn cancel_under_lock(
        &self,
        actor: &Actor,
        student_id: Uuid,
        section_id: &str,
        op_id: Uuid,
    ) -> Result<Attempt, EngineError> {
        let student = self.replay_student(student_id).await?;
        if !student.waitlisted.contains_key(section_id) {
            return Ok(Attempt::Decided(Decision::cancelled()));
        }

        let section_state = self.replay_section(section_id).await?;
        let before = student.summary();
        let payload = EventPayload::WaitlistCancelled {
            student_id,
            section_id: section_id.to_string(),
        };

        let student_env = match self
            .events
            .append(&student_stream(student_id), student.version, op_id, &payload)
            .await
        {
            Ok(envelope) => envelope,
            Err(e) if e.is_version_conflict() => return Ok(Attempt::Conflict),
            Err(e) => return Err(e.into()),
        };

        let mut event_ids = vec![student_env.event_id];
        if let Some(envelope) = self
            .append_section_locked(
                &section_stream(section_id),
                section_state.version,
                op_id,
                &payload,
            )
            .await?
        {
            event_ids.push(envelope.event_id);
        }

        let after = applied(&student, &student_env).summary();
        self.record_audit(
            &actor.actor_id.to_string(),
            AuditAction::Cancel,
            section_id,
            before,
            after,
            event_ids,
        )
        .await;

        tracing::info!(
            student_id = %student_id,
            section_id = %section_id,
            "left waitlist"
        );
        Ok(Attempt::Decided(Decision::cancelled()))
    }

    /// Current student view, rebuilt from the stream.
    pub async fn student_enrollments(
        &self,
        student_id: Uuid,
    ) -> Result<StudentAggregate, EngineError> {
        self.replay_student(student_id).await
    }

    /// Current section view, rebuilt from the stream.
    pub async fn section_state(
        &self,
        section_id: &str,
    ) -> Result<SectionAggregate, EngineError> {
        self.replay_section(section_id).await
    }

    /// Promote head waiters into free seats. Must be called while holding
    /// the section lock. Each promotion is evaluated as a fresh enrollment
    /// through the full policy set; a denied waiter is skipped and the next
    /// one considered.
    pub(crate) async fn promote_waiters(&self, section: &Section) -> Result<(), EngineError> {
        loop {
            let section_state = self.replay_section(&section.section_id).await?;
            if section_state.enrolled_count >= section.max_capacity {
                return Ok(());
            }
            let mut promoted = false;
            for candidate in section_state.waitlist.clone() {
                if self.try_promote(section, &section_state, candidate).await? {
                    promoted = true;
                    break;
                }
            }
            if !promoted {
                return Ok(());
            }
        }
    }

    async fn try_promote(
        &self,
        section: &Section,
        section_state: &SectionAggregate,
        student_id: Uuid,
    ) -> Result<bool, EngineError> {
        let profile = match self.directory.get_student_profile(student_id).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(
                    student_id = %student_id,
                    section_id = %section.section_id,
                    error = %e,
                    "cannot evaluate promotion; skipping waiter"
                );
                return Ok(false);
            }
        };
        let student = self.replay_student(student_id).await?;

        if let Some(existing) = student.enrollment_in(&section.section_id) {
            // The seat landed on the student stream but the section stream
            // missed its half (interrupted promotion). Re-append the section
            // side, which both counts the seat and consumes the waitlist
            // entry.
            let repaired = self
                .append_section_locked(
                    &section_stream(&section.section_id),
                    section_state.version,
                    Uuid::new_v4(),
                    &EventPayload::Promoted {
                        enrollment_id: existing.enrollment_id,
                        student_id,
                        section_id: section.section_id.clone(),
                        credits: existing.credits,
                        schedule: existing.schedule.clone(),
                    },
                )
                .await?;
            return Ok(repaired.is_some());
        }

        // Evaluate as a fresh enrollment with the waitlist membership
        // consumed, so the duplicate check judges only real double-bookings.
        let mut hypothetical = student.clone();
        hypothetical.waitlisted.remove(&section.section_id);

        let promotion_id = Uuid::new_v4();
        let request = EnrollmentRequest {
            request_id: promotion_id,
            student_id,
            section_id: section.section_id.clone(),
            submitted_at: Utc::now(),
        };
        let env = self.policy_env();
        let input = PolicyInput {
            request: &request,
            section,
            profile: &profile,
            student: &hypothetical,
            section_state,
            env: &env,
        };
        let (verdict, _trace) = self.policies.evaluate(&input);
        if verdict != EngineVerdict::Enroll {
            tracing::info!(
                student_id = %student_id,
                section_id = %section.section_id,
                "promotion denied by policy; considering the next waiter"
            );
            return Ok(false);
        }

        let enrollment_id = Uuid::new_v4();
        let payload = EventPayload::Promoted {
            enrollment_id,
            student_id,
            section_id: section.section_id.clone(),
            credits: section.credits,
            schedule: section.schedule.clone(),
        };

        let before = student.summary();
        let student_env = match self
            .events
            .append(
                &student_stream(student_id),
                student.version,
                promotion_id,
                &payload,
            )
            .await
        {
            Ok(envelope) => envelope,
            Err(e) if e.is_version_conflict() => {
                tracing::info!(
                    student_id = %student_id,
                    "promotion lost a student-stream race; reconciler will retry"
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let mut event_ids = vec![student_env.event_id];
        if let Some(envelope) = self
            .append_section_locked(
                &section_stream(&section.section_id),
                section_state.version,
                promotion_id,
                &payload,
            )
            .await?
        {
            self.snapshot_section(section_state, &envelope);
            event_ids.push(envelope.event_id);
        }

        let after = applied(&student, &student_env).summary();
        self.record_audit(
            SYSTEM_ACTOR,
            AuditAction::Promote,
            &section.section_id,
            before,
            after,
            event_ids,
        )
        .await;
        self.snapshot_student(&student, &student_env);

        tracing::info!(
            student_id = %student_id,
            section_id = %section.section_id,
            enrollment_id = %enrollment_id,
            "promoted from waitlist"
        );
        Ok(true)
    }

    /// Append to a section stream while holding its lock. Conflicts here mean
    /// a reclaimed stale lock wrote concurrently; the append is retried at
    /// the refreshed head. `None` means the retries were exhausted.
    async fn append_section_locked(
        &self,
        stream_id: &str,
        expected_version: u64,
        causation_id: Uuid,
        payload: &EventPayload,
    ) -> Result<Option<EventEnvelope>, EngineError> {
        let mut expected = expected_version;
        for _ in 0..LOCKED_APPEND_ATTEMPTS {
            match self
                .events
                .append(stream_id, expected, causation_id, payload)
                .await
            {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(StorageError::VersionConflict { current, .. }) => {
                    expected = current;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Append a compensating event to a student stream at its current head.
    /// The student stream has no lock of its own, so the head can move
    /// between read and append; that only costs another attempt.
    async fn compensate_student(
        &self,
        stream_id: &str,
        causation_id: Uuid,
        payload: EventPayload,
    ) -> Result<(), EngineError> {
        for _ in 0..LOCKED_APPEND_ATTEMPTS {
            let current = self.events.current_version(stream_id).await?;
            match self
                .events
                .append(stream_id, current, causation_id, &payload)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_version_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Internal(format!(
            "compensating append on {stream_id} kept conflicting"
        )))
    }

    async fn prior_decision(&self, request_id: Uuid) -> Result<Option<Decision>, EngineError> {
        let events = self.events.find_by_causation(request_id).await?;
        Ok(net_decision(&events))
    }

    async fn section_metadata(&self, section_id: &str) -> Result<Section, Decision> {
        if let Some(cached) = self.section_cache.get(section_id)
            && cached.fetched_at.elapsed() < self.config.section_cache_ttl
        {
            return Ok(cached.section.clone());
        }

        match self.directory.get_section(section_id).await {
            Ok(section) => {
                self.section_cache.insert(
                    section_id.to_string(),
                    CachedSection {
                        fetched_at: Instant::now(),
                        section: section.clone(),
                    },
                );
                Ok(section)
            }
            Err(DirectoryError::NotFound(_)) => Err(Decision::denied(
                DenyCode::UnknownSection,
                format!("section {section_id} is not in the catalog"),
            )),
            Err(DirectoryError::Unavailable(e)) => Err(Decision::denied(
                DenyCode::Transient,
                format!("section catalog unavailable: {e}"),
            )),
        }
    }

    async fn student_profile(&self, student_id: Uuid) -> Result<StudentProfile, Decision> {
        match self.directory.get_student_profile(student_id).await {
            Ok(profile) => Ok(profile),
            Err(DirectoryError::NotFound(_)) => Err(Decision::denied(
                DenyCode::UnknownStudent,
                format!("student {student_id} is not known to the registrar"),
            )),
            Err(DirectoryError::Unavailable(e)) => Err(Decision::denied(
                DenyCode::Transient,
                format!("student directory unavailable: {e}"),
            )),
        }
    }

    pub(crate) async fn replay_student(
        &self,
        student_id: Uuid,
    ) -> Result<StudentAggregate, EngineError> {
        let stream_id = student_stream(student_id);
        let snapshot = self.snapshots.latest(&stream_id).await?;
        let tail = self
            .events
            .load(&stream_id, snapshot.as_ref().map(|s| s.version))
            .await?;
        match StudentAggregate::replay(student_id, snapshot.as_ref(), &tail) {
            Ok(aggregate) => Ok(aggregate),
            Err(AggregateError::BadSnapshot { stream_id, source }) => {
                tracing::warn!(
                    stream = %stream_id,
                    error = %source,
                    "snapshot unreadable; replaying from the start"
                );
                let events = self.events.load(&stream_id, None).await?;
                Ok(StudentAggregate::replay(student_id, None, &events)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn replay_section(
        &self,
        section_id: &str,
    ) -> Result<SectionAggregate, EngineError> {
        let stream_id = section_stream(section_id);
        let snapshot = self.snapshots.latest(&stream_id).await?;
        let tail = self
            .events
            .load(&stream_id, snapshot.as_ref().map(|s| s.version))
            .await?;
        match SectionAggregate::replay(section_id, snapshot.as_ref(), &tail) {
            Ok(aggregate) => Ok(aggregate),
            Err(AggregateError::BadSnapshot { stream_id, source }) => {
                tracing::warn!(
                    stream = %stream_id,
                    error = %source,
                    "snapshot unreadable; replaying from the start"
                );
                let events = self.events.load(&stream_id, None).await?;
                Ok(SectionAggregate::replay(section_id, None, &events)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn policy_env(&self) -> PolicyEnv {
        PolicyEnv {
            now: Utc::now(),
            credit_cap_default: self.config.credit_cap_default,
            max_waitlist: self.config.max_waitlist,
        }
    }

    async fn record_audit(
        &self,
        actor_id: &str,
        action: AuditAction,
        resource: &str,
        before: serde_json::Value,
        after: serde_json::Value,
        event_ids: Vec<Uuid>,
    ) {
        if let Err(e) = self
            .audit
            .append(actor_id, action, resource, Some(before), Some(after), event_ids)
            .await
        {
            // The decision is already committed in the event streams; the
            // gap is loud but not fatal.
            tracing::error!(
                actor_id,
                action = action.as_str(),
                resource,
                error = %e,
                "audit append failed"
            );
        }
    }

    fn snapshot_student(&self, base: &StudentAggregate, latest: &EventEnvelope) {
        let updated = applied(base, latest);
        self.maybe_snapshot(&latest.stream_id, updated.version, serde_json::to_value(&updated));
    }

    fn snapshot_section(&self, base: &SectionAggregate, latest: &EventEnvelope) {
        let mut updated = base.clone();
        updated.apply(latest);
        self.maybe_snapshot(&latest.stream_id, updated.version, serde_json::to_value(&updated));
    }

    /// Write a snapshot off the request path when the stream crosses the
    /// configured interval. Snapshot failure never fails the request.
    fn maybe_snapshot(
        &self,
        stream_id: &str,
        version: u64,
        state: Result<serde_json::Value, serde_json::Error>,
    ) {
        if version == 0 || version % self.config.snapshot_interval != 0 {
            return;
        }
        let state = match state {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(stream = %stream_id, error = %e, "snapshot serialization failed");
                return;
            }
        };
        let snapshots = self.snapshots.clone();
        let stream_id = stream_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = snapshots.save(&stream_id, version, &state).await {
                tracing::warn!(stream = %stream_id, version, error = %e, "snapshot write failed");
            }
        });
    }
}

/// Net effect of the events a request produced on its student stream.
/// Compensated attempts cancel out; `None` means the request was never
/// decided and may run fresh.
fn net_decision(events: &[EventEnvelope]) -> Option<Decision> {
    let mut decision = None;
    for event in events
        .iter()
        .filter(|e| e.stream_id.starts_with(STUDENT_STREAM_PREFIX))
    {
        match &event.payload {
            EventPayload::Enrolled { enrollment_id, .. }
            | EventPayload::Promoted { enrollment_id, .. } => {
                decision = Some(Decision::enrolled(*enrollment_id, Vec::new()));
            }
            EventPayload::Dropped { .. } | EventPayload::WaitlistCancelled { .. } => {
                decision = None;
            }
            EventPayload::Waitlisted { .. } => {
                decision = Some(Decision::waitlisted(Vec::new()));
            }
            EventPayload::RequestRejected { reason, .. } => {
                decision = Some(Decision::denied(*reason, reason.as_str()));
            }
            EventPayload::CapacityConsumed { .. } | EventPayload::CapacityReleased { .. } => {}
        }
    }
    decision
}

fn applied(base: &StudentAggregate, event: &EventEnvelope) -> StudentAggregate {
    let mut updated = base.clone();
    updated.apply(event);
    updated
}

fn deny_message(trace: &[PolicyCheck], code: DenyCode) -> String {
    trace
        .iter()
        .find_map(|check| match &check.result {
            registrar_domain::PolicyResult::Deny {
                code: deny_code,
                message,
            } if *deny_code == code => Some(message.clone()),
            _ => None,
        })
        .unwrap_or_else(|| code.as_str().to_string())
}

fn remaining_wait(deadline: Option<Instant>, configured: Duration) -> Option<Duration> {
    match deadline {
        None => Some(configured),
        Some(deadline) => {
            let now = Instant::now();
            if deadline <= now {
                None
            } else {
                Some(configured.min(deadline - now))
            }
        }
    }
}

/// Exponential backoff with ±25% jitter, capped at half a second.
async fn backoff(attempt: u32) {
    let exp = BACKOFF_BASE_MS.saturating_mul(1 << attempt.min(6));
    let capped = exp.min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    let delay = Duration::from_millis((capped as f64 * jitter) as u64);
    tokio::time::sleep(delay).await;
}
