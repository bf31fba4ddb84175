//! The overhead governor: global and per-machine limits on how much
//! padding may be sent.
//!
//! Two counter pairs exist per process (padding cells sent, total cells
//! sent), plus one pair per machine runtime.  A padding send is permitted
//! while the padding count is below the burst allowance; beyond that, it
//! is permitted only while padding stays within the percentage cap of the
//! total.  When a send is suppressed, the timer still fires and the
//! cadence continues; only the cell (and its `PADDING_SENT` event) is
//! skipped.

use std::sync::{Arc, Mutex};

use tor_units::Percentage;

/// Default number of padding cells permitted before the global
/// percentage cap starts to apply.
pub const DEFAULT_ALLOWED_BURST: u32 = 5000;

/// Default global cap on padding as a percentage of all sent cells.
pub const DEFAULT_MAX_PERCENT: u32 = 1;

/// Limits applied by the overhead governor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OverheadLimits {
    /// Padding cells permitted before the percentage cap applies.
    allowed_burst: u32,
    /// Maximum padding as a percentage of total sent cells.
    max_percent: Percentage<u32>,
}

impl Default for OverheadLimits {
    fn default() -> Self {
        OverheadLimits {
            allowed_burst: DEFAULT_ALLOWED_BURST,
            max_percent: Percentage::new(DEFAULT_MAX_PERCENT),
        }
    }
}

impl OverheadLimits {
    /// Construct limits with the given burst allowance and percentage
    /// cap.
    pub fn new(allowed_burst: u32, max_percent: Percentage<u32>) -> Self {
        OverheadLimits {
            allowed_burst,
            max_percent,
        }
    }

    /// The burst allowance.
    pub fn allowed_burst(&self) -> u32 {
        self.allowed_burst
    }

    /// The percentage cap.
    pub fn max_percent(&self) -> Percentage<u32> {
        self.max_percent
    }
}

/// Decide whether one more padding cell may be sent, given the counters
/// as they stand before the send.
///
/// Below the burst allowance the percentage cap is ignored entirely.
pub(crate) fn padding_allowed(
    padding_sent: u64,
    total_sent: u64,
    allowed_burst: u32,
    max_percent: u32,
) -> bool {
    if padding_sent < u64::from(allowed_burst) {
        return true;
    }
    100 * padding_sent <= u64::from(max_percent) * total_sent
}

/// The process-global overhead counters.
///
/// Cheap to clone; all clones share one set of counters.  The host
/// creates one of these at startup, hands a clone to every circuit's
/// padding controller, and may [`reset`](PaddingAccounting::reset) it
/// when its statistics epoch rolls over.
#[derive(Clone, Debug)]
pub struct PaddingAccounting {
    /// The counters and limits, behind a lock.
    ///
    /// (All accesses are short and never overlap an await point.)
    inner: Arc<Mutex<Counters>>,
}

/// The counters themselves.
#[derive(Debug)]
struct Counters {
    /// Padding cells sent, process-wide.
    padding_sent: u64,
    /// All cells sent, process-wide.
    total_sent: u64,
    /// The global limits in force.
    limits: OverheadLimits,
}

impl Default for PaddingAccounting {
    fn default() -> Self {
        Self::new(OverheadLimits::default())
    }
}

impl PaddingAccounting {
    /// Construct a fresh set of counters with the given limits.
    pub fn new(limits: OverheadLimits) -> Self {
        PaddingAccounting {
            inner: Arc::new(Mutex::new(Counters {
                padding_sent: 0,
                total_sent: 0,
                limits,
            })),
        }
    }

    /// Record that a padding cell was sent.
    pub fn note_padding_sent(&self) {
        let mut c = self.inner.lock().expect("poisoned lock");
        c.padding_sent = c.padding_sent.saturating_add(1);
        c.total_sent = c.total_sent.saturating_add(1);
    }

    /// Record that a non-padding cell was sent.
    pub fn note_nonpadding_sent(&self) {
        let mut c = self.inner.lock().expect("poisoned lock");
        c.total_sent = c.total_sent.saturating_add(1);
    }

    /// Would one more padding cell stay within the global limits?
    pub fn padding_allowed(&self) -> bool {
        let c = self.inner.lock().expect("poisoned lock");
        padding_allowed(
            c.padding_sent,
            c.total_sent,
            c.limits.allowed_burst,
            c.limits.max_percent.as_percent(),
        )
    }

    /// The current (padding, total) counts.
    pub fn counts(&self) -> (u64, u64) {
        let c = self.inner.lock().expect("poisoned lock");
        (c.padding_sent, c.total_sent)
    }

    /// Reset both counters to zero.
    pub fn reset(&self) {
        let mut c = self.inner.lock().expect("poisoned lock");
        c.padding_sent = 0;
        c.total_sent = 0;
    }
}
