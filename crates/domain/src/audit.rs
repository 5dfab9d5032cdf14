//! Hash-chained audit entries.
//!
//! Every decision produces exactly one entry. Entry `n` links to entry
//! `n - 1` through `previous_hash`; entry 0 links to a genesis hash of all
//! zeroes. `entry_hash` is the SHA-256 of the entry's own fields plus
//! `previous_hash`, so any edit to a recorded entry breaks the chain from
//! that point on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// `previous_hash` of the first entry.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Enroll,
    Drop,
    Waitlist,
    Promote,
    Reject,
    Cancel,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Enroll => "ENROLL",
            AuditAction::Drop => "DROP",
            AuditAction::Waitlist => "WAITLIST",
            AuditAction::Promote => "PROMOTE",
            AuditAction::Reject => "REJECT",
            AuditAction::Cancel => "CANCEL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub action: AuditAction,
    /// The section the decision was made against.
    pub resource: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub event_ids: Vec<Uuid>,
    pub previous_hash: String,
    pub entry_hash: String,
}

impl AuditEntry {
    /// Build the entry that follows `prev` in the chain.
    #[allow(clippy::too_many_arguments)]
    pub fn chained(
        prev: Option<(u64, &str)>,
        timestamp: DateTime<Utc>,
        actor_id: String,
        action: AuditAction,
        resource: String,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
        event_ids: Vec<Uuid>,
    ) -> Self {
        let (seq, previous_hash) = match prev {
            Some((prev_seq, prev_hash)) => (prev_seq + 1, prev_hash.to_string()),
            None => (0, GENESIS_HASH.to_string()),
        };
        let entry_hash = compute_entry_hash(
            seq,
            timestamp,
            &actor_id,
            action,
            &resource,
            before.as_ref(),
            after.as_ref(),
            &previous_hash,
        );
        Self {
            seq,
            timestamp,
            actor_id,
            action,
            resource,
            before,
            after,
            event_ids,
            previous_hash,
            entry_hash,
        }
    }

    /// Recompute this entry's hash from its fields.
    pub fn recomputed_hash(&self) -> String {
        compute_entry_hash(
            self.seq,
            self.timestamp,
            &self.actor_id,
            self.action,
            &self.resource,
            self.before.as_ref(),
            self.after.as_ref(),
            &self.previous_hash,
        )
    }
}

/// SHA-256 over the entry fields, each domain-separated so that field
/// boundaries cannot be shifted without changing the digest.
#[allow(clippy::too_many_arguments)]
pub fn compute_entry_hash(
    seq: u64,
    timestamp: DateTime<Utc>,
    actor_id: &str,
    action: AuditAction,
    resource: &str,
    before: Option<&serde_json::Value>,
    after: Option<&serde_json::Value>,
    previous_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seq.to_be_bytes());
    hasher.update([0x1f]);
    hasher.update(timestamp.to_rfc3339());
    hasher.update([0x1f]);
    hasher.update(actor_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(action.as_str().as_bytes());
    hasher.update([0x1f]);
    hasher.update(resource.as_bytes());
    hasher.update([0x1f]);
    hasher.update(json_or_null(before));
    hasher.update([0x1f]);
    hasher.update(json_or_null(after));
    hasher.update([0x1f]);
    hasher.update(previous_hash.as_bytes());
    to_hex(&hasher.finalize())
}

fn json_or_null(value: Option<&serde_json::Value>) -> Vec<u8> {
    match value {
        Some(v) => serde_json::to_vec(v).unwrap_or_else(|_| b"null".to_vec()),
        None => b"null".to_vec(),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainViolation {
    pub seq: u64,
    pub detail: String,
}

/// Verify linkage and hash integrity of a full chain, oldest first.
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), ChainViolation> {
    let mut expected_prev = GENESIS_HASH.to_string();
    for (i, entry) in entries.iter().enumerate() {
        if entry.seq != i as u64 {
            return Err(ChainViolation {
                seq: entry.seq,
                detail: format!("sequence gap: expected {i}, found {}", entry.seq),
            });
        }
        if entry.previous_hash != expected_prev {
            return Err(ChainViolation {
                seq: entry.seq,
                detail: "previous_hash does not match the prior entry".to_string(),
            });
        }
        if entry.recomputed_hash() != entry.entry_hash {
            return Err(ChainViolation {
                seq: entry.seq,
                detail: "entry_hash does not match the entry fields".to_string(),
            });
        }
        expected_prev = entry.entry_hash.clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(prev: Option<(u64, &str)>, action: AuditAction) -> AuditEntry {
        AuditEntry::chained(
            prev,
            Utc::now(),
            "actor-1".to_string(),
            action,
            "CS101-A".to_string(),
            Some(serde_json::json!({"active_enrollments": 0})),
            Some(serde_json::json!({"active_enrollments": 1})),
            vec![Uuid::new_v4()],
        )
    }

    #[test]
    fn genesis_entry_links_to_zero_hash() {
        let first = entry(None, AuditAction::Enroll);
        assert_eq!(first.seq, 0);
        assert_eq!(first.previous_hash, GENESIS_HASH);
        assert_eq!(first.entry_hash.len(), 64);
    }

    #[test]
    fn chain_of_three_verifies() {
        let a = entry(None, AuditAction::Enroll);
        let b = entry(Some((a.seq, &a.entry_hash)), AuditAction::Drop);
        let c = entry(Some((b.seq, &b.entry_hash)), AuditAction::Promote);
        assert!(verify_chain(&[a, b, c]).is_ok());
    }

    #[test]
    fn tampered_field_breaks_verification() {
        let a = entry(None, AuditAction::Enroll);
        let mut b = entry(Some((a.seq, &a.entry_hash)), AuditAction::Drop);
        b.actor_id = "someone-else".to_string();
        let violation = verify_chain(&[a, b]).unwrap_err();
        assert_eq!(violation.seq, 1);
    }

    #[test]
    fn broken_linkage_is_detected() {
        let a = entry(None, AuditAction::Enroll);
        let b = entry(Some((a.seq, GENESIS_HASH)), AuditAction::Drop);
        assert!(verify_chain(&[a, b]).is_err());
    }

    #[test]
    fn sequence_gap_is_detected() {
        let a = entry(None, AuditAction::Enroll);
        let mut b = entry(Some((a.seq, &a.entry_hash)), AuditAction::Drop);
        b.seq = 5;
        assert!(verify_chain(&[a, b]).is_err());
    }
}
