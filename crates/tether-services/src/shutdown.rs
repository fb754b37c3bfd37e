//! Shutdown drain — best-effort close of every live record.

use tether_core::{ConnectionState, Transport};

use crate::registry::{ConnectionKey, ConnectionRegistry};

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Closes handed to the transport.
    pub closed: usize,
    /// Closes the transport refused. Recorded on the record, not propagated.
    pub failed: usize,
}

/// Issue `close(code, reason)` for every Open record (and Connecting ones if
/// `include_connecting`). Failed and Closed records are left untouched. A
/// failing close never aborts the drain.
pub fn drain_open<K, T>(
    registry: &ConnectionRegistry<K>,
    transport: &T,
    code: u16,
    reason: &str,
    include_connecting: bool,
) -> DrainReport
where
    K: ConnectionKey,
    T: Transport + ?Sized,
{
    let qualifies = |state: ConnectionState| match state {
        ConnectionState::Open => true,
        ConnectionState::Connecting => include_connecting,
        ConnectionState::Failed | ConnectionState::Closed => false,
    };

    let mut candidates = Vec::new();
    registry.for_each(|id, snap| {
        if qualifies(snap.state) {
            candidates.push(id.clone());
        }
    });

    let mut report = DrainReport::default();
    for id in candidates {
        // The state may have moved since the snapshot; re-check under the lock.
        let outcome = registry.with_entry(&id, |record| {
            if !qualifies(record.state()) || record.close_requested() {
                return None;
            }
            let result = transport.close(record.handle(), code, reason);
            match &result {
                Ok(()) => record.mark_close_requested(),
                Err(e) => record.set_detail(format!("close during shutdown failed: {e}")),
            }
            Some(result)
        });

        match outcome.flatten() {
            Some(Ok(())) => report.closed += 1,
            Some(Err(e)) => {
                tracing::warn!(id = %id, code, error = %e, "close during shutdown failed");
                report.failed += 1;
            }
            None => {}
        }
    }

    tracing::debug!(closed = report.closed, failed = report.failed, "drain pass finished");
    report
}
