//! Invariant monitor and background reconciler.
//!
//! `audit_state` replays every stream from scratch and checks the global
//! invariants: no schedule overlap per student, per-section capacity, no
//! duplicate enrollment, gap-free stream versions, and audit-chain
//! integrity. Violations are reported with witnessing event ids and never
//! auto-repaired.
//!
//! The reconciler is the repair side for *incomplete protocols* (not
//! invariant violations): seats still counted for dropped enrollments, and
//! waitlists with free seats whose promotion was interrupted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use registrar_domain::{
    EventEnvelope, EventPayload, SECTION_STREAM_PREFIX, STUDENT_STREAM_PREFIX, SectionAggregate,
    StudentAggregate, any_overlap, section_id_of, section_stream, student_id_of, verify_chain,
};

use crate::coordinator::EnrollmentEngine;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantKind {
    ScheduleOverlap,
    CapacityExceeded,
    DuplicateEnrollment,
    VersionGap,
    AuditChain,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    pub invariant: InvariantKind,
    pub stream_id: String,
    pub detail: String,
    /// Event ids that witness the violation.
    pub witnesses: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct InvariantReport {
    pub checked_streams: usize,
    pub violations: Vec<InvariantViolation>,
}

impl InvariantReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

impl EnrollmentEngine {
    /// Full sweep over every stream plus the audit chain. Reads only; used
    /// by tests, the admin endpoint, and the background loop.
    pub async fn audit_state(&self) -> Result<InvariantReport, EngineError> {
        let mut violations = Vec::new();
        let mut checked = 0usize;

        for stream_id in self.events.list_streams(STUDENT_STREAM_PREFIX).await? {
            checked += 1;
            let events = self.events.load(&stream_id, None).await?;
            if let Some(violation) = version_gap(&stream_id, &events) {
                violations.push(violation);
                continue;
            }
            let Some(student_id) = student_id_of(&stream_id) else {
                continue;
            };
            match StudentAggregate::replay(student_id, None, &events) {
                Ok(aggregate) => {
                    violations.extend(overlap_violations(&stream_id, &aggregate, &events));
                    violations.extend(duplicate_violations(&stream_id, &aggregate, &events));
                }
                Err(e) => violations.push(InvariantViolation {
                    invariant: InvariantKind::VersionGap,
                    stream_id: stream_id.clone(),
                    detail: e.to_string(),
                    witnesses: Vec::new(),
                }),
            }
        }

        for stream_id in self.events.list_streams(SECTION_STREAM_PREFIX).await? {
            checked += 1;
            let events = self.events.load(&stream_id, None).await?;
            if let Some(violation) = version_gap(&stream_id, &events) {
                violations.push(violation);
                continue;
            }
            let Some(section_id) = section_id_of(&stream_id) else {
                continue;
            };
            let aggregate = match SectionAggregate::replay(section_id, None, &events) {
                Ok(aggregate) => aggregate,
                Err(e) => {
                    violations.push(InvariantViolation {
                        invariant: InvariantKind::VersionGap,
                        stream_id: stream_id.clone(),
                        detail: e.to_string(),
                        witnesses: Vec::new(),
                    });
                    continue;
                }
            };
            match self.directory.get_section(section_id).await {
                Ok(section) => {
                    if aggregate.enrolled_count > section.max_capacity {
                        violations.push(InvariantViolation {
                            invariant: InvariantKind::CapacityExceeded,
                            stream_id: stream_id.clone(),
                            detail: format!(
                                "{} seats in use, capacity is {}",
                                aggregate.enrolled_count, section.max_capacity
                            ),
                            witnesses: seat_witnesses(&events),
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        section_id,
                        error = %e,
                        "cannot verify capacity; section metadata unavailable"
                    );
                }
            }
        }

        let entries = self.audit.entries().await?;
        if let Err(chain_violation) = verify_chain(&entries) {
            violations.push(InvariantViolation {
                invariant: InvariantKind::AuditChain,
                stream_id: "audit".to_string(),
                detail: format!(
                    "entry {}: {}",
                    chain_violation.seq, chain_violation.detail
                ),
                witnesses: Vec::new(),
            });
        }

        for violation in &violations {
            tracing::error!(
                invariant = ?violation.invariant,
                stream = %violation.stream_id,
                witnesses = ?violation.witnesses,
                detail = %violation.detail,
                "invariant violation"
            );
        }

        Ok(InvariantReport {
            checked_streams: checked,
            violations,
        })
    }

    /// Settle incomplete protocols: release seats still counted for dropped
    /// enrollments and re-attempt pending waitlist promotions. Each section
    /// is handled under its own lock; busy sections are skipped until the
    /// next pass.
    pub async fn reconcile(&self) -> Result<(), EngineError> {
        for stream_id in self.events.list_streams(SECTION_STREAM_PREFIX).await? {
            let Some(section_id) = section_id_of(&stream_id).map(str::to_string) else {
                continue;
            };
            let section = match self.directory.get_section(&section_id).await {
                Ok(section) => section,
                Err(e) => {
                    tracing::debug!(section_id, error = %e, "skipping reconcile; no metadata");
                    continue;
                }
            };

            let lock_name = section_stream(&section_id);
            let owner = format!("reconciler:{}", Uuid::new_v4());
            let granted = self
                .locks
                .acquire(
                    &lock_name,
                    &owner,
                    self.config().lock_hold_ttl,
                    Duration::from_millis(250),
                )
                .await;
            if !granted.is_granted() {
                continue;
            }

            let result = self.reconcile_section(&section).await;
            if let Err(e) = self.locks.release(&lock_name, &owner) {
                tracing::warn!(lock = %lock_name, error = %e, "lock release failed");
            }
            if let Err(e) = result {
                tracing::warn!(section_id, error = %e, "reconcile pass failed");
            }
        }
        Ok(())
    }

    async fn reconcile_section(&self, section: &registrar_domain::Section) -> Result<(), EngineError> {
        let section_state = self.replay_section(&section.section_id).await?;

        // Seats whose enrollment is gone from the student stream.
        for (enrollment_id, student_id) in section_state.enrolled.clone() {
            let student = self.replay_student(student_id).await?;
            if !student.active.contains_key(&enrollment_id) {
                tracing::info!(
                    section_id = %section.section_id,
                    enrollment_id = %enrollment_id,
                    "releasing seat left behind by an interrupted drop"
                );
                self.append_seat_release(&section.section_id, enrollment_id, student_id)
                    .await?;
            }
        }

        self.promote_waiters(section).await
    }

    async fn append_seat_release(
        &self,
        section_id: &str,
        enrollment_id: Uuid,
        student_id: Uuid,
    ) -> Result<(), EngineError> {
        let stream_id = section_stream(section_id);
        let current = self.events.current_version(&stream_id).await?;
        match self
            .events
            .append(
                &stream_id,
                current,
                Uuid::new_v4(),
                &EventPayload::CapacityReleased {
                    enrollment_id,
                    student_id,
                },
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_version_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Periodic reconcile + invariant sweep.
    pub fn spawn_background(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let engine = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.reconcile().await {
                    tracing::warn!(error = %e, "background reconcile failed");
                }
                match engine.audit_state().await {
                    Ok(report) if !report.is_clean() => {
                        tracing::error!(
                            violations = report.violations.len(),
                            "invariant sweep found violations"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "invariant sweep failed"),
                }
            }
        })
    }
}

fn version_gap(stream_id: &str, events: &[EventEnvelope]) -> Option<InvariantViolation> {
    for (i, event) in events.iter().enumerate() {
        let expected = i as u64 + 1;
        if event.stream_version != expected {
            return Some(InvariantViolation {
                invariant: InvariantKind::VersionGap,
                stream_id: stream_id.to_string(),
                detail: format!(
                    "expected version {expected}, found {}",
                    event.stream_version
                ),
                witnesses: vec![event.event_id],
            });
        }
    }
    None
}

fn overlap_violations(
    stream_id: &str,
    aggregate: &StudentAggregate,
    events: &[EventEnvelope],
) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let active: Vec<_> = aggregate.active.values().collect();
    for (i, a) in active.iter().enumerate() {
        for b in active.iter().skip(i + 1) {
            if any_overlap(&a.schedule, &b.schedule) {
                violations.push(InvariantViolation {
                    invariant: InvariantKind::ScheduleOverlap,
                    stream_id: stream_id.to_string(),
                    detail: format!(
                        "{} and {} overlap in time",
                        a.section_id, b.section_id
                    ),
                    witnesses: enrollment_witnesses(events, &[a.enrollment_id, b.enrollment_id]),
                });
            }
        }
    }
    violations
}

fn duplicate_violations(
    stream_id: &str,
    aggregate: &StudentAggregate,
    events: &[EventEnvelope],
) -> Vec<InvariantViolation> {
    let mut by_section: HashMap<&str, Vec<Uuid>> = HashMap::new();
    for enrollment in aggregate.active.values() {
        by_section
            .entry(enrollment.section_id.as_str())
            .or_default()
            .push(enrollment.enrollment_id);
    }
    by_section
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(section_id, ids)| InvariantViolation {
            invariant: InvariantKind::DuplicateEnrollment,
            stream_id: stream_id.to_string(),
            detail: format!("{} active enrollments in {section_id}", ids.len()),
            witnesses: enrollment_witnesses(events, &ids),
        })
        .collect()
}

/// Event ids of the `Enrolled`/`Promoted` events that created the given
/// enrollments.
fn enrollment_witnesses(events: &[EventEnvelope], enrollment_ids: &[Uuid]) -> Vec<Uuid> {
    events
        .iter()
        .filter(|event| match &event.payload {
            EventPayload::Enrolled { enrollment_id, .. }
            | EventPayload::Promoted { enrollment_id, .. } => {
                enrollment_ids.contains(enrollment_id)
            }
            _ => false,
        })
        .map(|event| event.event_id)
        .collect()
}

fn seat_witnesses(events: &[EventEnvelope]) -> Vec<Uuid> {
    events
        .iter()
        .filter(|event| {
            matches!(
                event.payload,
                EventPayload::CapacityConsumed { .. } | EventPayload::Promoted { .. }
            )
        })
        .map(|event| event.event_id)
        .collect()
}
