//! Memory accounting and the shared memory-spec parser.
//!
//! Every resident allocation of L0 entries passes through a [`MemTracker`]
//! supplied by the surrounding engine. A consume request that would exceed
//! the tracker limit fails with `MemLimitExceeded` and the operation that
//! triggered it is reported to the caller unapplied.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{Error, Result};
use crate::failpoint;

/// Tracks resident bytes against an optional limit. A limit of -1 means
/// unlimited.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    limit: i64,
    consumed: AtomicI64,
}

impl MemTracker {
    pub fn new(label: impl Into<String>, limit: i64) -> Self {
        Self {
            label: label.into(),
            limit,
            consumed: AtomicI64::new(0),
        }
    }

    /// Unlimited tracker, used when the engine does not bound the index.
    pub fn unlimited(label: impl Into<String>) -> Self {
        Self::new(label, -1)
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn consumption(&self) -> i64 {
        self.consumed.load(Ordering::SeqCst)
    }

    /// Account `bytes`; fails without consuming when the limit would be
    /// exceeded.
    pub fn try_consume(&self, bytes: usize) -> Result<()> {
        if failpoint::triggered_for("try_consume_mem_failed", &self.label) {
            return Err(Error::MemLimitExceeded(format!(
                "tracker {} failed to consume {} bytes",
                self.label, bytes
            )));
        }
        let bytes = bytes as i64;
        if self.limit >= 0 {
            let prev = self.consumed.fetch_add(bytes, Ordering::SeqCst);
            if prev + bytes > self.limit {
                self.consumed.fetch_sub(bytes, Ordering::SeqCst);
                return Err(Error::MemLimitExceeded(format!(
                    "tracker {} over limit {}: consumed {}, requested {}",
                    self.label, self.limit, prev, bytes
                )));
            }
        } else {
            self.consumed.fetch_add(bytes, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn release(&self, bytes: usize) {
        self.consumed.fetch_sub(bytes as i64, Ordering::SeqCst);
    }

    /// True when consumption has reached the limit; drives the
    /// pressure-sensitive flush threshold.
    pub fn limit_exceeded(&self) -> bool {
        self.limit >= 0 && self.consumption() >= self.limit
    }
}

/// Parses a memory specification string into bytes.
///
/// Accepts `N`, `Nb`, `Nk`, `Nm`, `Ng`, `Nt` (case-insensitive) and `N%`
/// relative to `memory_limit`. `N` may be a float for the k/m/g/t units.
/// Empty input parses to 0.
pub fn parse_mem_spec(spec: &str, memory_limit: i64) -> Result<i64> {
    if spec.is_empty() {
        return Ok(0);
    }

    let mut is_percent = false;
    let mut multiplier: i64 = -1;
    let mut number_str = &spec[..spec.len() - 1];

    match spec.as_bytes()[spec.len() - 1] {
        b't' | b'T' => multiplier = 1024 * 1024 * 1024 * 1024,
        b'g' | b'G' => multiplier = 1024 * 1024 * 1024,
        b'm' | b'M' => multiplier = 1024 * 1024,
        b'k' | b'K' => multiplier = 1024,
        b'b' | b'B' => {}
        b'%' => is_percent = true,
        _ => number_str = spec,
    }

    if multiplier != -1 {
        let val: f64 = number_str
            .trim()
            .parse()
            .map_err(|_| crate::errinput!("parse mem spec: {spec}"))?;
        Ok((multiplier as f64 * val) as i64)
    } else {
        let val: i64 = number_str
            .trim()
            .parse()
            .map_err(|_| crate::errinput!("parse mem spec: {spec}"))?;
        if is_percent {
            Ok(((val as f64) / 100.0 * memory_limit as f64) as i64)
        } else {
            Ok(val)
        }
    }
}
