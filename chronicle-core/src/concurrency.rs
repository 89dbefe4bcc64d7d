//! Optimistic concurrency control.
//!
//! Every append names the stream version the writer last observed. The store
//! compares it with the version it actually holds and rejects the write on a
//! mismatch, so a writer working from stale state can never silently
//! overwrite newer events. Resolving the conflict (reload, re-run the
//! command, retry) is left to the caller.

use thiserror::Error;

/// Error indicating a concurrency conflict during append.
///
/// Returned when another writer has appended to the stream since the caller
/// read it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(.stream_id, *.expected, *.actual))]
pub struct ConcurrencyConflict {
    /// Stream the append targeted.
    pub stream_id: String,
    /// The version the writer expected (0 means "new stream").
    pub expected: u64,
    /// The version actually persisted when the append was attempted.
    pub actual: u64,
}

/// Build a human-readable message for a [`ConcurrencyConflict`], including an
/// actionable hint for the caller.
fn format_conflict(stream_id: &str, expected: u64, actual: u64) -> String {
    if expected == 0 {
        format!(
            "concurrency conflict on `{stream_id}`: expected new stream, found version {actual} \
             (hint: another process created this aggregate; reload and retry)"
        )
    } else {
        format!(
            "concurrency conflict on `{stream_id}`: expected version {expected}, found {actual} \
             (hint: stream was modified; reload and retry)"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_expected_new_stream_mentions_hint() {
        let conflict = ConcurrencyConflict {
            stream_id: "counter:c1".to_string(),
            expected: 0,
            actual: 42,
        };
        let msg = conflict.to_string();
        assert!(msg.contains("expected new stream"));
        assert!(msg.contains("counter:c1"));
        assert!(msg.contains("reload and retry"));
    }

    #[test]
    fn conflict_expected_version_includes_versions() {
        let conflict = ConcurrencyConflict {
            stream_id: "counter:c1".to_string(),
            expected: 5,
            actual: 10,
        };
        let msg = conflict.to_string();
        assert!(msg.contains("expected version 5"));
        assert!(msg.contains("found 10"));
    }
}
