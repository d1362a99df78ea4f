//! RAM accounting
//!
//! One accounting handle per job, shared by all of the job's stages.
//! Stages charge bytes for their buffers and release them when the
//! buffers are emitted or dropped. A charge that would push usage past the
//! limit is refused and surfaces as `MemoryLimitExceeded`; nothing spills.
//!
//! Charges and releases are lock-free and may come from any thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::errors::{ExecResult, ExecutionError};
use crate::observability::{Event, Logger};

#[derive(Debug)]
struct RamInner {
    label: String,
    limit: u64,
    used: AtomicU64,
    peak: AtomicU64,
}

/// Shared byte-budget tracker
#[derive(Debug, Clone)]
pub struct RamAccountingContext {
    inner: Arc<RamInner>,
}

impl RamAccountingContext {
    /// Creates a tracker with the given byte limit
    pub fn new(label: impl Into<String>, limit: u64) -> Self {
        Self {
            inner: Arc::new(RamInner {
                label: label.into(),
                limit,
                used: AtomicU64::new(0),
                peak: AtomicU64::new(0),
            }),
        }
    }

    /// Tracker without a ceiling
    pub fn unlimited(label: impl Into<String>) -> Self {
        Self::new(label, u64::MAX)
    }

    /// Charges `bytes` against the budget.
    ///
    /// Either the full amount is reserved or nothing is.
    pub fn charge(&self, bytes: u64) -> ExecResult<()> {
        let mut current = self.inner.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.inner.limit {
                Logger::error(
                    Event::MemoryLimitExceeded.as_str(),
                    &[
                        ("label", self.inner.label.as_str()),
                        ("limit", self.inner.limit.to_string().as_str()),
                        ("requested", bytes.to_string().as_str()),
                        ("used", current.to_string().as_str()),
                    ],
                );
                return Err(ExecutionError::MemoryLimitExceeded {
                    label: self.inner.label.clone(),
                    requested: bytes,
                    used: current,
                    limit: self.inner.limit,
                });
            }
            match self.inner.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.inner.peak.fetch_max(next, Ordering::Relaxed);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns `bytes` to the budget. Over-release saturates at zero.
    pub fn release(&self, bytes: u64) {
        let _ = self
            .inner
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Bytes currently charged
    pub fn used(&self) -> u64 {
        self.inner.used.load(Ordering::Relaxed)
    }

    /// Highest usage observed
    pub fn peak(&self) -> u64 {
        self.inner.peak.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> u64 {
        self.inner.limit
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

/// Stage-local view of the shared tracker.
///
/// Remembers how much this stage charged so that `release_all` on finish
/// or failure returns exactly the stage's share.
#[derive(Debug)]
pub struct StageMemory {
    ram: RamAccountingContext,
    charged: u64,
}

impl StageMemory {
    pub fn new(ram: RamAccountingContext) -> Self {
        Self { ram, charged: 0 }
    }

    pub fn charge(&mut self, bytes: usize) -> ExecResult<()> {
        let bytes = bytes as u64;
        self.ram.charge(bytes)?;
        self.charged += bytes;
        Ok(())
    }

    pub fn release(&mut self, bytes: usize) {
        let bytes = (bytes as u64).min(self.charged);
        self.ram.release(bytes);
        self.charged -= bytes;
    }

    pub fn release_all(&mut self) {
        self.ram.release(self.charged);
        self.charged = 0;
    }

    pub fn charged(&self) -> u64 {
        self.charged
    }
}

impl Drop for StageMemory {
    fn drop(&mut self) {
        self.release_all();
    }
}
