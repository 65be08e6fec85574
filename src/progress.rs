// src/progress.rs
// ---------------------------------------------------------------------------
// Cooperative cancellation token and rate-limited progress reporting, shared
// by every long-running operation (indexer, transforms, analyzer). Every
// read of the PGN stream, every engine subprocess read, and every progress
// callback is a suspension point at which cancellation is observed.
// ---------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config;
use crate::error::{Error, Result};

#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Observes the token at a suspension point, returning `Cancelled` if set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub phase: String,
    pub games_processed: u64,
    pub games_total: Option<u64>,
}

/// Wraps a user callback with the spec's rate limit: at most one call every
/// 100ms *and* every 200 games — whichever threshold is slower to clear
/// governs, so a burst of tiny fast games doesn't spam the sink and a single
/// slow game doesn't starve it either.
pub struct ProgressReporter<'a> {
    callback: Box<dyn FnMut(Progress) + 'a>,
    last_emit: Option<Instant>,
    last_count: u64,
    phase: String,
    total: Option<u64>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(phase: impl Into<String>, total: Option<u64>, callback: impl FnMut(Progress) + 'a) -> Self {
        Self {
            callback: Box::new(callback),
            last_emit: None,
            last_count: 0,
            phase: phase.into(),
            total,
        }
    }

    pub fn report(&mut self, games_processed: u64) {
        let now = Instant::now();
        let interval_ok = self
            .last_emit
            .map(|t| now.duration_since(t).as_millis() as u64 >= config::PROGRESS_MIN_INTERVAL_MS)
            .unwrap_or(true);
        let count_ok = games_processed.saturating_sub(self.last_count) >= config::PROGRESS_MIN_GAMES;

        if interval_ok && count_ok {
            (self.callback)(Progress {
                phase: self.phase.clone(),
                games_processed,
                games_total: self.total,
            });
            self.last_emit = Some(now);
            self.last_count = games_processed;
        }
    }

    /// Forces a final report regardless of rate limits, for use at the end
    /// of an operation so totals aren't silently swallowed.
    pub fn finish(&mut self, games_processed: u64) {
        (self.callback)(Progress {
            phase: self.phase.clone(),
            games_processed,
            games_total: self.total,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn cancellation_is_observed() {
        let tok = CancellationToken::new();
        assert!(tok.check().is_ok());
        tok.cancel();
        assert!(matches!(tok.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn progress_rate_limits_by_game_count() {
        let seen = RefCell::new(Vec::new());
        let mut reporter = ProgressReporter::new("indexing", Some(1000), |p| seen.borrow_mut().push(p.games_processed));
        for i in 0..1000u64 {
            reporter.report(i);
        }
        // Without sleeping, the 100ms gate never opens, so nothing should
        // have been emitted via the count-only path.
        assert!(seen.borrow().is_empty());
        reporter.finish(1000);
        assert_eq!(seen.borrow().last(), Some(&1000));
    }
}
