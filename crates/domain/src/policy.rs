//! Admission policies and the policy engine.
//!
//! Each policy is a pure function of the request plus the replayed snapshots,
//! carried as a plain value: name, priority, short-circuit flag, and an
//! evaluation fn. The set is fixed at engine construction; evaluation order
//! is deterministic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::{SectionAggregate, StudentAggregate};
use crate::catalog::{Section, StudentProfile};
use crate::enrollment::{DenyCode, EnrollmentRequest};

/// Evaluation-time environment: the clock plus configured limits.
#[derive(Debug, Clone, Copy)]
pub struct PolicyEnv {
    pub now: DateTime<Utc>,
    pub credit_cap_default: u32,
    pub max_waitlist: u32,
}

/// Everything a policy may look at. Policies never perform I/O.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    pub request: &'a EnrollmentRequest,
    pub section: &'a Section,
    pub profile: &'a StudentProfile,
    pub student: &'a StudentAggregate,
    pub section_state: &'a SectionAggregate,
    pub env: &'a PolicyEnv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Caveat {
    Waitlist,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PolicyResult {
    Allow,
    AllowWithCaveat { caveat: Caveat },
    Deny { code: DenyCode, message: String },
}

impl PolicyResult {
    fn deny(code: DenyCode, message: impl Into<String>) -> Self {
        Self::Deny {
            code,
            message: message.into(),
        }
    }
}

/// One registered admission rule.
#[derive(Clone, Copy)]
pub struct Policy {
    pub name: &'static str,
    /// Lower runs first.
    pub priority: u32,
    /// When true, a deny from this policy stops evaluation immediately.
    pub short_circuit_on_deny: bool,
    pub eval: fn(&PolicyInput<'_>) -> PolicyResult,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("short_circuit_on_deny", &self.short_circuit_on_deny)
            .finish()
    }
}

/// One row of the evaluation trace attached to every decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyCheck {
    pub policy: String,
    pub priority: u32,
    #[serde(flatten)]
    pub result: PolicyResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineVerdict {
    Enroll,
    AdmitToWaitlist,
    Deny(DenyCode),
}

pub struct PolicyEngine {
    policies: Vec<Policy>,
}

impl PolicyEngine {
    /// The standard policy set.
    pub fn standard() -> Self {
        Self::with_policies(vec![
            PRIORITY_WINDOW,
            ADD_DROP_DEADLINE,
            DUPLICATE_ENROLLMENT,
            PREREQUISITE,
            ACADEMIC_STANDING,
            TIME_CONFLICT,
            CAPACITY,
            CREDIT_LIMIT,
        ])
    }

    /// Build from an explicit set; ordering is normalized to
    /// (priority, name) so evaluation is deterministic regardless of
    /// registration order.
    pub fn with_policies(mut policies: Vec<Policy>) -> Self {
        policies.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(b.name)));
        Self { policies }
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Evaluate all policies in priority order.
    ///
    /// A deny from a short-circuiting policy ends evaluation. Otherwise all
    /// results are gathered: any deny wins (the highest-priority denier sets
    /// the reason), then a waitlist caveat, then a clean admit.
    pub fn evaluate(&self, input: &PolicyInput<'_>) -> (EngineVerdict, Vec<PolicyCheck>) {
        let mut trace = Vec::with_capacity(self.policies.len());
        for policy in &self.policies {
            let result = (policy.eval)(input);
            let denied = match &result {
                PolicyResult::Deny { code, .. } => Some(*code),
                _ => None,
            };
            trace.push(PolicyCheck {
                policy: policy.name.to_string(),
                priority: policy.priority,
                result,
            });
            if let Some(code) = denied
                && policy.short_circuit_on_deny
            {
                return (EngineVerdict::Deny(code), trace);
            }
        }

        let first_deny = trace.iter().find_map(|check| match &check.result {
            PolicyResult::Deny { code, .. } => Some(*code),
            _ => None,
        });
        if let Some(code) = first_deny {
            return (EngineVerdict::Deny(code), trace);
        }

        let waitlist = trace.iter().any(|check| {
            matches!(
                check.result,
                PolicyResult::AllowWithCaveat {
                    caveat: Caveat::Waitlist
                }
            )
        });
        if waitlist {
            (EngineVerdict::AdmitToWaitlist, trace)
        } else {
            (EngineVerdict::Enroll, trace)
        }
    }
}

pub const PRIORITY_WINDOW: Policy = Policy {
    name: "priority_window",
    priority: 5,
    short_circuit_on_deny: true,
    eval: eval_priority_window,
};

fn eval_priority_window(input: &PolicyInput<'_>) -> PolicyResult {
    match input.profile.priority_window_open_at {
        Some(open_at) if input.env.now < open_at => PolicyResult::deny(
            DenyCode::WindowClosed,
            format!("enrollment window opens at {}", open_at.to_rfc3339()),
        ),
        _ => PolicyResult::Allow,
    }
}

pub const ADD_DROP_DEADLINE: Policy = Policy {
    name: "add_drop_deadline",
    priority: 7,
    short_circuit_on_deny: true,
    eval: eval_add_drop_deadline,
};

fn eval_add_drop_deadline(input: &PolicyInput<'_>) -> PolicyResult {
    match input.section.add_drop_deadline {
        // A submission at exactly the deadline is still accepted.
        Some(deadline) if input.env.now > deadline => PolicyResult::deny(
            DenyCode::DeadlinePassed,
            format!("add/drop closed at {}", deadline.to_rfc3339()),
        ),
        _ => PolicyResult::Allow,
    }
}

pub const DUPLICATE_ENROLLMENT: Policy = Policy {
    name: "duplicate_enrollment",
    priority: 8,
    short_circuit_on_deny: true,
    eval: eval_duplicate_enrollment,
};

fn eval_duplicate_enrollment(input: &PolicyInput<'_>) -> PolicyResult {
    let section_id = input.section.section_id.as_str();
    if input.student.enrollment_in(section_id).is_some() {
        return PolicyResult::deny(
            DenyCode::Duplicate,
            format!("already enrolled in {section_id}"),
        );
    }
    if input.student.waitlisted.contains_key(section_id) {
        return PolicyResult::deny(
            DenyCode::Duplicate,
            format!("already waitlisted for {section_id}"),
        );
    }
    PolicyResult::Allow
}

pub const PREREQUISITE: Policy = Policy {
    name: "prerequisite",
    priority: 10,
    short_circuit_on_deny: true,
    eval: eval_prerequisite,
};

fn eval_prerequisite(input: &PolicyInput<'_>) -> PolicyResult {
    let missing: Vec<&str> = input
        .section
        .prerequisites
        .iter()
        .filter(|course| !input.profile.completed_courses.contains(*course))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        PolicyResult::Allow
    } else {
        PolicyResult::deny(
            DenyCode::MissingPrereq,
            format!("missing prerequisites: {}", missing.join(", ")),
        )
    }
}

pub const ACADEMIC_STANDING: Policy = Policy {
    name: "academic_standing",
    priority: 20,
    short_circuit_on_deny: true,
    eval: eval_academic_standing,
};

fn eval_academic_standing(input: &PolicyInput<'_>) -> PolicyResult {
    if input.profile.standing < input.section.min_standing {
        PolicyResult::deny(
            DenyCode::PoorStanding,
            format!(
                "section requires {:?} standing or above",
                input.section.min_standing
            ),
        )
    } else {
        PolicyResult::Allow
    }
}

pub const TIME_CONFLICT: Policy = Policy {
    name: "time_conflict",
    priority: 30,
    short_circuit_on_deny: true,
    eval: eval_time_conflict,
};

fn eval_time_conflict(input: &PolicyInput<'_>) -> PolicyResult {
    match input.student.time_conflict_with(&input.section.schedule) {
        Some(enrollment) => PolicyResult::deny(
            DenyCode::TimeConflict,
            format!("meets at the same time as {}", enrollment.section_id),
        ),
        None => PolicyResult::Allow,
    }
}

pub const CAPACITY: Policy = Policy {
    name: "capacity",
    priority: 40,
    short_circuit_on_deny: false,
    eval: eval_capacity,
};

fn eval_capacity(input: &PolicyInput<'_>) -> PolicyResult {
    let state = input.section_state;
    if state.enrolled_count < input.section.max_capacity {
        PolicyResult::Allow
    } else if (state.waitlist.len() as u32) < input.env.max_waitlist {
        PolicyResult::AllowWithCaveat {
            caveat: Caveat::Waitlist,
        }
    } else {
        PolicyResult::deny(
            DenyCode::Full,
            format!(
                "section is full ({} seats) and the waitlist is full",
                input.section.max_capacity
            ),
        )
    }
}

pub const CREDIT_LIMIT: Policy = Policy {
    name: "credit_limit",
    priority: 50,
    short_circuit_on_deny: true,
    eval: eval_credit_limit,
};

fn eval_credit_limit(input: &PolicyInput<'_>) -> PolicyResult {
    let cap = input
        .profile
        .credit_cap
        .unwrap_or(input.env.credit_cap_default);
    let projected = input.student.credits_this_term + input.section.credits;
    if projected > cap {
        PolicyResult::deny(
            DenyCode::CreditLimit,
            format!("{projected} credits would exceed the cap of {cap}"),
        )
    } else {
        PolicyResult::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Standing;
    use crate::schedule::{DayOfWeek, TimeSlot};
    use chrono::Duration;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    struct Fixture {
        request: EnrollmentRequest,
        section: Section,
        profile: StudentProfile,
        student: StudentAggregate,
        section_state: SectionAggregate,
        env: PolicyEnv,
    }

    fn slot(start: u16, end: u16) -> TimeSlot {
        TimeSlot::new(DayOfWeek::Mon, start, end).unwrap()
    }

    fn fixture() -> Fixture {
        let student_id = Uuid::new_v4();
        let now = Utc::now();
        Fixture {
            request: EnrollmentRequest {
                request_id: Uuid::new_v4(),
                student_id,
                section_id: "CS101-A".to_string(),
                submitted_at: now,
            },
            section: Section {
                section_id: "CS101-A".to_string(),
                course_id: "CS101".to_string(),
                schedule: vec![slot(600, 690)],
                max_capacity: 30,
                instructor_id: "prof-1".to_string(),
                add_drop_deadline: Some(now + Duration::days(7)),
                semester: "2026-fall".to_string(),
                prerequisites: Default::default(),
                min_standing: Standing::Freshman,
                credits: 3,
            },
            profile: StudentProfile {
                student_id,
                completed_courses: Default::default(),
                gpa: 3.2,
                standing: Standing::Sophomore,
                priority_window_open_at: None,
                credit_cap: None,
            },
            student: StudentAggregate::new(student_id),
            section_state: SectionAggregate::new("CS101-A"),
            env: PolicyEnv {
                now,
                credit_cap_default: 18,
                max_waitlist: 2,
            },
        }
    }

    fn input(f: &Fixture) -> PolicyInput<'_> {
        PolicyInput {
            request: &f.request,
            section: &f.section,
            profile: &f.profile,
            student: &f.student,
            section_state: &f.section_state,
            env: &f.env,
        }
    }

    fn active(section_id: &str, credits: u32, schedule: Vec<TimeSlot>) -> ActiveEnrollmentSeed {
        ActiveEnrollmentSeed {
            section_id: section_id.to_string(),
            credits,
            schedule,
        }
    }

    struct ActiveEnrollmentSeed {
        section_id: String,
        credits: u32,
        schedule: Vec<TimeSlot>,
    }

    fn seed_active(f: &mut Fixture, seeds: Vec<ActiveEnrollmentSeed>) {
        let mut map = BTreeMap::new();
        for seed in seeds {
            let id = Uuid::new_v4();
            f.student.credits_this_term += seed.credits;
            map.insert(
                id,
                crate::aggregate::ActiveEnrollment {
                    enrollment_id: id,
                    section_id: seed.section_id,
                    credits: seed.credits,
                    schedule: seed.schedule,
                    enrolled_at: f.env.now,
                },
            );
        }
        f.student.active = map;
    }

    #[test]
    fn clean_request_enrolls() {
        let f = fixture();
        let (verdict, trace) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::Enroll);
        assert_eq!(trace.len(), 8);
        assert!(
            trace
                .iter()
                .all(|c| matches!(c.result, PolicyResult::Allow))
        );
    }

    #[test]
    fn trace_is_in_priority_order() {
        let f = fixture();
        let (_, trace) = PolicyEngine::standard().evaluate(&input(&f));
        let priorities: Vec<u32> = trace.iter().map(|c| c.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_unstable();
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn closed_priority_window_short_circuits() {
        let mut f = fixture();
        f.profile.priority_window_open_at = Some(f.env.now + Duration::hours(2));
        let (verdict, trace) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::Deny(DenyCode::WindowClosed));
        // Short-circuit: only the window policy ran.
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].policy, "priority_window");
    }

    #[test]
    fn submission_at_exact_deadline_is_accepted() {
        let mut f = fixture();
        f.section.add_drop_deadline = Some(f.env.now);
        let (verdict, _) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::Enroll);
    }

    #[test]
    fn submission_after_deadline_is_rejected() {
        let mut f = fixture();
        f.section.add_drop_deadline = Some(f.env.now - Duration::seconds(1));
        let (verdict, _) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::Deny(DenyCode::DeadlinePassed));
    }

    #[test]
    fn duplicate_active_enrollment_is_denied() {
        let mut f = fixture();
        seed_active(&mut f, vec![active("CS101-A", 3, vec![])]);
        let (verdict, _) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::Deny(DenyCode::Duplicate));
    }

    #[test]
    fn missing_prerequisite_is_denied() {
        let mut f = fixture();
        f.section.prerequisites = ["CS100".to_string()].into();
        let (verdict, _) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::Deny(DenyCode::MissingPrereq));

        f.profile.completed_courses = ["CS100".to_string()].into();
        let (verdict, _) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::Enroll);
    }

    #[test]
    fn insufficient_standing_is_denied() {
        let mut f = fixture();
        f.section.min_standing = Standing::Senior;
        let (verdict, _) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::Deny(DenyCode::PoorStanding));
    }

    #[test]
    fn overlapping_schedule_is_denied_but_adjacent_passes() {
        let mut f = fixture();
        // Existing class Mon 11:00-12:00; requested is Mon 10:00-11:30.
        seed_active(&mut f, vec![active("MATH200-B", 3, vec![slot(660, 720)])]);
        let (verdict, _) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::Deny(DenyCode::TimeConflict));

        // Back to back is fine: requested ends exactly when the class begins.
        f.section.schedule = vec![slot(600, 660)];
        let (verdict, _) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::Enroll);
    }

    #[test]
    fn full_section_with_waitlist_room_admits_to_waitlist() {
        let mut f = fixture();
        f.section.max_capacity = 0;
        let (verdict, trace) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::AdmitToWaitlist);
        // Capacity does not short-circuit, so every policy is in the trace.
        assert_eq!(trace.len(), 8);
    }

    #[test]
    fn full_section_and_full_waitlist_is_denied() {
        let mut f = fixture();
        f.section.max_capacity = 0;
        f.section_state.waitlist = vec![Uuid::new_v4(), Uuid::new_v4()];
        let (verdict, _) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::Deny(DenyCode::Full));
    }

    #[test]
    fn credit_cap_is_enforced_with_profile_override() {
        let mut f = fixture();
        seed_active(&mut f, vec![active("MATH200-B", 16, vec![])]);
        let (verdict, _) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::Deny(DenyCode::CreditLimit));

        f.profile.credit_cap = Some(21);
        let (verdict, _) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::Enroll);
    }

    #[test]
    fn capacity_deny_does_not_stop_a_later_short_circuit() {
        // Capacity denies without short-circuiting, so evaluation continues
        // and the credit-limit short-circuit still ends the run with its own
        // reason.
        let mut f = fixture();
        f.section.max_capacity = 0;
        f.section_state.waitlist = vec![Uuid::new_v4(), Uuid::new_v4()];
        seed_active(&mut f, vec![active("MATH200-B", 17, vec![])]);
        let (verdict, trace) = PolicyEngine::standard().evaluate(&input(&f));
        assert_eq!(verdict, EngineVerdict::Deny(DenyCode::CreditLimit));
        assert_eq!(trace.last().unwrap().policy, "credit_limit");
        assert!(
            trace
                .iter()
                .any(|c| c.policy == "capacity"
                    && matches!(c.result, PolicyResult::Deny { .. }))
        );
    }

    #[test]
    fn registration_order_does_not_change_evaluation_order() {
        let forward = PolicyEngine::with_policies(vec![PRIORITY_WINDOW, CAPACITY, TIME_CONFLICT]);
        let backward = PolicyEngine::with_policies(vec![TIME_CONFLICT, CAPACITY, PRIORITY_WINDOW]);
        let names_fwd: Vec<&str> = forward.policies().iter().map(|p| p.name).collect();
        let names_bwd: Vec<&str> = backward.policies().iter().map(|p| p.name).collect();
        assert_eq!(names_fwd, names_bwd);
    }
}
