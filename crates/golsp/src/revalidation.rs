//
// revalidation.rs
//
// Debounced diagnostics scheduling and monotonic publish gating
//

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::Url;

/// Tracks pending diagnostics work per document
#[derive(Debug, Default)]
pub struct DiagnosticsScheduler {
    pending: RwLock<HashMap<Url, (u64, CancellationToken)>>,
    /// Source of sequence numbers; later schedules get larger numbers
    sequence: AtomicU64,
}

impl DiagnosticsScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule diagnostics for a document, cancelling any pending work for
    /// it. Returns the token for the new task and its sequence number.
    pub fn schedule(&self, uri: Url) -> (CancellationToken, u64) {
        let token = CancellationToken::new();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut pending = match self.pending.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((_, old)) = pending.insert(uri, (sequence, token.clone())) {
            old.cancel();
        }
        (token, sequence)
    }

    /// Mark the work numbered `sequence` complete, unless newer work has
    /// replaced it.
    pub fn complete(&self, uri: &Url, sequence: u64) {
        if let Ok(mut pending) = self.pending.write() {
            if pending.get(uri).is_some_and(|(s, _)| *s == sequence) {
                pending.remove(uri);
            }
        }
    }

    pub fn cancel(&self, uri: &Url) {
        if let Ok(mut pending) = self.pending.write() {
            if let Some((_, token)) = pending.remove(uri) {
                token.cancel();
            }
        }
    }

    pub fn cancel_all(&self) {
        if let Ok(mut pending) = self.pending.write() {
            for (_, (_, token)) in pending.drain() {
                token.cancel();
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().map(|p| p.len()).unwrap_or(0)
    }
}

/// Publish gate: per document, results computed for an older sequence
/// number never replace newer ones.
#[derive(Debug, Default)]
pub struct DiagnosticsGate {
    last_published: RwLock<HashMap<Url, u64>>,
}

impl DiagnosticsGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `sequence` for `uri` unless it is older than the last one.
    /// Returns whether the caller may publish.
    pub fn try_publish(&self, uri: &Url, sequence: u64) -> bool {
        let mut last = match self.last_published.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match last.get(uri) {
            Some(&previous) if sequence < previous => false,
            _ => {
                last.insert(uri.clone(), sequence);
                true
            }
        }
    }

    pub fn clear(&self, uri: &Url) {
        if let Ok(mut last) = self.last_published.write() {
            last.remove(uri);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(name: &str) -> Url {
        Url::parse(&format!("file:///w/{}", name)).unwrap()
    }

    #[test]
    fn test_schedule_supersedes_pending_work() {
        let scheduler = DiagnosticsScheduler::new();
        let (first, s1) = scheduler.schedule(uri("a.go"));
        let (second, s2) = scheduler.schedule(uri("a.go"));
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(s2 > s1);

        // Completing stale work leaves the newer entry pending
        scheduler.complete(&uri("a.go"), s1);
        assert_eq!(scheduler.pending_count(), 1);
        scheduler.complete(&uri("a.go"), s2);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_cancel_all() {
        let scheduler = DiagnosticsScheduler::new();
        let (a, _) = scheduler.schedule(uri("a.go"));
        let (b, _) = scheduler.schedule(uri("b.go"));
        scheduler.cancel_all();
        assert!(a.is_cancelled() && b.is_cancelled());
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_gate_is_monotonic() {
        let gate = DiagnosticsGate::new();
        let a = uri("a.go");
        assert!(gate.try_publish(&a, 5));
        assert!(!gate.try_publish(&a, 4));
        assert!(gate.try_publish(&a, 5));
        assert!(gate.try_publish(&a, 7));
        assert!(gate.try_publish(&uri("b.go"), 1));

        gate.clear(&a);
        assert!(gate.try_publish(&a, 1));
    }
}
