// Lifecycle Transition Rules
//
// Maps a review decision onto the (temporal layer, status, ttl) a memory
// moves to. Storage applies the result with a compare-and-set, so planning
// is pure and safe to repeat.

use crate::types::{Decision, Memory, MemoryStatus, ReviewLogEntry, TemporalLayer, Transition};
use chrono::{DateTime, Duration, Utc};

/// Reason recorded when a record is archived after exhausting its retries
pub fn fallback_reason(retries: u32) -> String {
    format!(
        "automatic fallback: archived after {} reviews without a valid decision",
        retries
    )
}

/// Plan the move `decision` implies for `memory` as of `now`
///
/// `extend_window` is the fresh ttl granted by an extend decision.
pub fn plan(
    memory: &Memory,
    decision: Decision,
    now: DateTime<Utc>,
    extend_window: Duration,
) -> Transition {
    let (to_layer, to_status, expires_at) = match decision {
        Decision::Promote => (TemporalLayer::Long, MemoryStatus::Active, None),
        Decision::Extend => (
            TemporalLayer::Short,
            MemoryStatus::Active,
            Some(now + extend_window),
        ),
        Decision::Archive => (TemporalLayer::Archive, MemoryStatus::Archived, None),
        Decision::Forget => (memory.temporal_layer, MemoryStatus::Deleted, memory.expires_at),
    };

    Transition {
        memory_id: memory.id,
        decision,
        from_layer: memory.temporal_layer,
        to_layer,
        to_status,
        expires_at,
    }
}

impl Transition {
    /// Audit entry describing this transition
    pub fn log_entry(
        &self,
        reason: impl Into<String>,
        reviewer: impl Into<String>,
        reviewed_at: DateTime<Utc>,
    ) -> ReviewLogEntry {
        ReviewLogEntry {
            memory_id: self.memory_id,
            decision: self.decision,
            old_layer: self.from_layer,
            new_layer: self.to_layer,
            reason: reason.into(),
            reviewer: reviewer.into(),
            reviewed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryDraft;

    fn working() -> Memory {
        Memory::from_draft(
            MemoryDraft::working("scratch note", Duration::hours(2)),
            Utc::now(),
        )
    }

    #[test]
    fn test_promote_clears_ttl() {
        let m = working();
        let t = plan(&m, Decision::Promote, Utc::now(), Duration::days(7));
        assert_eq!(t.to_layer, TemporalLayer::Long);
        assert_eq!(t.to_status, MemoryStatus::Active);
        assert!(t.expires_at.is_none());
        assert_eq!(t.from_layer, TemporalLayer::Working);
    }

    #[test]
    fn test_extend_resets_window() {
        let m = working();
        let now = Utc::now();
        let t = plan(&m, Decision::Extend, now, Duration::days(7));
        assert_eq!(t.to_layer, TemporalLayer::Short);
        assert_eq!(t.expires_at, Some(now + Duration::days(7)));
    }

    #[test]
    fn test_archive_and_forget() {
        let m = working();
        let archive = plan(&m, Decision::Archive, Utc::now(), Duration::days(7));
        assert_eq!(
            (archive.to_layer, archive.to_status),
            (TemporalLayer::Archive, MemoryStatus::Archived)
        );

        let forget = plan(&m, Decision::Forget, Utc::now(), Duration::days(7));
        assert_eq!(forget.to_layer, TemporalLayer::Working);
        assert_eq!(forget.to_status, MemoryStatus::Deleted);
    }

    #[test]
    fn test_log_entry_mirrors_transition() {
        let m = working();
        let now = Utc::now();
        let t = plan(&m, Decision::Archive, now, Duration::days(7));
        let entry = t.log_entry(fallback_reason(3), "sleep_cycle", now);
        assert_eq!(entry.old_layer, TemporalLayer::Working);
        assert_eq!(entry.new_layer, TemporalLayer::Archive);
        assert_eq!(entry.decision, Decision::Archive);
        assert!(entry.reason.contains("automatic fallback"));
    }
}
