//! Per-circuit runtime state for one padding machine.
//!
//! A [`PadRuntime`] is the mutable half of a circuit slot: the current
//! state index, the worn-down histogram copy, the cell counters, the
//! pending timer instant, and the RTT estimate.  It implements the event
//! dispatch algorithm: counter update, then token removal, then
//! transition lookup, then state-entry actions, with internal events
//! (infinity, bins-empty, length-count) dispatched recursively under a
//! cascade bound.
//!
//! The runtime never touches a clock or a transport: the controller
//! passes `now` in, and harvests "emit a padding cell" decisions out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rand_core::RngCore;
use tracing::{trace, warn};

use crate::dist::DelayUsec;
use crate::event::PadEvent;
use crate::histogram::{HistSample, TokenBank, TokenRemoval};
use crate::machine::{PadMachineSpec, PadStateSpec, StateIx, Target, TimingSource};
use crate::overhead::{self, PaddingAccounting};

/// Saturating per-machine cell counters.
///
/// These only ever increase over the life of one runtime; they are
/// discarded with it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct MachineCounts {
    /// Padding cells this machine has sent.
    pub padding_sent: u32,
    /// Non-padding cells sent while this machine was active.
    pub nonpadding_sent: u32,
    /// Padding cells received from the peer's matching machine.
    pub padding_recv: u32,
    /// Non-padding cells received while this machine was active.
    pub nonpadding_recv: u32,
}

/// A one-shot estimate of the round-trip time to the target hop.
///
/// The first completed non-padding send/receive round trip fixes the
/// estimate; anything later is ignored, so the estimate can never move
/// backward.
#[derive(Copy, Clone, Debug, Default)]
struct RttEstimate {
    /// When the round trip we are timing began.
    pending_since: Option<Instant>,
    /// The fixed estimate, in microseconds.
    estimate_usec: Option<DelayUsec>,
}

impl RttEstimate {
    /// Note a non-padding cell sent at `now`.
    fn note_sent(&mut self, now: Instant) {
        if self.estimate_usec.is_none() && self.pending_since.is_none() {
            self.pending_since = Some(now);
        }
    }

    /// Note a non-padding cell received at `now`.
    fn note_received(&mut self, now: Instant) {
        if let Some(t0) = self.pending_since.take() {
            if self.estimate_usec.is_none() {
                self.estimate_usec = Some(usec_between(t0, now));
            }
        }
    }

    /// The estimate, or zero if no round trip has completed.
    fn usec(&self) -> DelayUsec {
        self.estimate_usec.unwrap_or(0)
    }
}

/// Microseconds from `earlier` to `later`, saturating.
fn usec_between(earlier: Instant, later: Instant) -> DelayUsec {
    DelayUsec::try_from(later.saturating_duration_since(earlier).as_micros())
        .unwrap_or(DelayUsec::MAX)
}

/// The mutable state of one padding machine on one circuit.
pub(crate) struct PadRuntime {
    /// The machine being run.
    spec: Arc<PadMachineSpec>,
    /// The current state index.
    cur: StateIx,
    /// Mutable histogram copy, present only while the current state uses
    /// token removal.
    tokens: Option<TokenBank>,
    /// Remaining per-visit padding budget; `None` is unlimited.
    remaining_len: Option<u64>,
    /// Per-machine cell counters.
    counts: MachineCounts,
    /// When the pending timer fires, if one is armed.
    scheduled_at: Option<Instant>,
    /// When the last cell event (in either direction) was observed.
    last_cell_at: Instant,
    /// Round-trip estimate for RTT-shifted states.
    rtt: RttEstimate,
    /// Set once the machine has reached the virtual ending state.
    reached_end: bool,
    /// Counts state entries, so callers can tell whether an event caused
    /// a transition.
    entries: u64,
}

impl PadRuntime {
    /// Install a machine on a circuit: create its runtime and enter
    /// state 0.
    pub(crate) fn install(
        spec: Arc<PadMachineSpec>,
        now: Instant,
        rng: &mut (dyn RngCore + Send),
    ) -> Self {
        let mut rt = PadRuntime {
            spec,
            cur: 0.into(),
            tokens: None,
            remaining_len: None,
            counts: MachineCounts::default(),
            scheduled_at: None,
            last_cell_at: now,
            rtt: RttEstimate::default(),
            reached_end: false,
            entries: 0,
        };
        rt.enter_state(0.into(), now, rng, 0);
        rt
    }

    /// The machine this runtime is executing.
    pub(crate) fn spec(&self) -> &Arc<PadMachineSpec> {
        &self.spec
    }

    /// The current state's specification.
    fn state(&self) -> &PadStateSpec {
        self.spec.state_spec(self.cur)
    }

    /// Whether the machine has reached its ending state.
    pub(crate) fn reached_end(&self) -> bool {
        self.reached_end
    }

    /// When the pending timer fires, if one is armed.
    pub(crate) fn scheduled_at(&self) -> Option<Instant> {
        self.scheduled_at
    }

    /// This machine's cell counters.
    pub(crate) fn counts(&self) -> MachineCounts {
        self.counts
    }

    /// Dispatch a cell event observed at `now`.
    ///
    /// The sequence within one event is fixed: counter update, then
    /// histogram token removal, then transition lookup, then state-entry
    /// actions.
    pub(crate) fn handle_cell_event(
        &mut self,
        ev: PadEvent,
        now: Instant,
        rng: &mut (dyn RngCore + Send),
    ) {
        debug_assert!(!ev.is_internal());
        match ev {
            PadEvent::NonPaddingSent => {
                self.counts.nonpadding_sent = self.counts.nonpadding_sent.saturating_add(1);
                self.rtt.note_sent(now);
            }
            PadEvent::NonPaddingRecv => {
                self.counts.nonpadding_recv = self.counts.nonpadding_recv.saturating_add(1);
                self.rtt.note_received(now);
            }
            PadEvent::PaddingSent => {
                self.counts.padding_sent = self.counts.padding_sent.saturating_add(1);
            }
            PadEvent::PaddingRecv => {
                self.counts.padding_recv = self.counts.padding_recv.saturating_add(1);
            }
            _ => {}
        }

        let interarrival = usec_between(self.last_cell_at, now);
        self.last_cell_at = now;

        if ev.is_send() && !self.reached_end {
            let spec = Arc::clone(&self.spec);
            let state = spec.state_spec(self.cur);
            let removal = state.removal();
            if removal != TokenRemoval::None {
                if let (TimingSource::Histogram(h), Some(bank)) =
                    (state.timing(), self.tokens.as_mut())
                {
                    h.remove_token(bank, interarrival, removal);
                }
            }
        }

        self.maybe_transition(ev, now, rng, 0);
    }

    /// Look up `ev` in the current state's table and transition if it
    /// names a different state.
    fn maybe_transition(
        &mut self,
        ev: PadEvent,
        now: Instant,
        rng: &mut (dyn RngCore + Send),
        depth: usize,
    ) {
        if self.reached_end {
            return;
        }
        match self.state().table().lookup(ev) {
            None => {}
            Some(Target::End) => self.enter_end(),
            Some(Target::State(ix)) if ix == self.cur => {
                // "No change": no re-entry, no fresh histogram, no timer.
            }
            Some(Target::State(ix)) => self.enter_state(ix, now, rng, depth),
        }
    }

    /// Enter the virtual ending state.
    fn enter_end(&mut self) {
        trace!(machine = %self.spec.name(), "padding machine reached its ending state");
        self.reached_end = true;
        self.entries += 1;
        self.tokens = None;
        if !self.spec.pads_on_shutdown() {
            self.scheduled_at = None;
        }
    }

    /// Enter state `ix`: refresh the histogram copy, sample the length
    /// budget, and schedule the first delay.
    fn enter_state(
        &mut self,
        ix: StateIx,
        now: Instant,
        rng: &mut (dyn RngCore + Send),
        depth: usize,
    ) {
        if depth > self.spec.states().len() + 1 {
            // An event cascade longer than the state count has to be a
            // specification loop; shut down rather than spin.
            warn!(
                machine = %self.spec.name(),
                "bug: padding event cascade exceeded bound; forcing shutdown"
            );
            self.enter_end();
            return;
        }
        self.cur = ix;
        self.entries += 1;
        self.scheduled_at = None;

        let spec = Arc::clone(&self.spec);
        let state = spec.state_spec(ix);
        self.tokens = match (state.removal(), state.timing()) {
            (TokenRemoval::None, _) => None,
            (_, TimingSource::Histogram(h)) => Some(h.fresh_tokens()),
            _ => None,
        };
        self.remaining_len = state.length().map(|ld| ld.sample(rng));
        if self.remaining_len == Some(0) {
            // The budget was exhausted before any padding could be sent.
            self.dispatch_internal(PadEvent::LengthCount, now, rng, depth + 1);
            return;
        }
        self.sample_and_schedule(now, rng, depth);
    }

    /// Raise a machine-internal event.
    fn dispatch_internal(
        &mut self,
        ev: PadEvent,
        now: Instant,
        rng: &mut (dyn RngCore + Send),
        depth: usize,
    ) {
        trace!(machine = %self.spec.name(), event = %ev, "internal padding event");
        self.maybe_transition(ev, now, rng, depth);
    }

    /// Sample a fresh delay from the current state and arm the timer.
    ///
    /// Sampling the infinity bin, or finding the histogram empty, raises
    /// the corresponding internal event instead of arming anything.
    fn sample_and_schedule(
        &mut self,
        now: Instant,
        rng: &mut (dyn RngCore + Send),
        depth: usize,
    ) {
        if self.reached_end {
            return;
        }
        let spec = Arc::clone(&self.spec);
        let state = spec.state_spec(self.cur);
        let rtt_shift = if state.uses_rtt() { self.rtt.usec() } else { 0 };
        match state.timing() {
            TimingSource::Dist(dist) => {
                let delay = dist.sample(&mut *rng, rtt_shift);
                self.arm(now, delay);
            }
            TimingSource::Histogram(h) => {
                let sample = match &self.tokens {
                    Some(bank) => h.sample(bank.counts(), &mut *rng),
                    None => h.sample(h.tokens(), &mut *rng),
                };
                match sample {
                    HistSample::Delay(d) => {
                        self.arm(now, d.saturating_add(rtt_shift));
                    }
                    HistSample::Infinity => {
                        self.scheduled_at = None;
                        self.dispatch_internal(PadEvent::Infinity, now, rng, depth + 1);
                    }
                    HistSample::BinsEmpty => {
                        self.scheduled_at = None;
                        self.dispatch_internal(PadEvent::BinsEmpty, now, rng, depth + 1);
                    }
                }
            }
        }
    }

    /// Arm the (single) timer for `delay` microseconds after `now`.
    ///
    /// A zero delay arms the timer at `now` itself: it fires on the next
    /// dispatcher pass, never synchronously.
    fn arm(&mut self, now: Instant, delay: DelayUsec) {
        self.scheduled_at = Some(now + Duration::from_micros(u64::from(delay)));
    }

    /// The timer fired: decide whether to emit a padding cell, raise
    /// `PADDING_SENT`, and keep the cadence going.
    ///
    /// Returns true if the caller should emit one padding cell to the
    /// target hop.
    pub(crate) fn timer_fired(
        &mut self,
        now: Instant,
        accounting: &PaddingAccounting,
        rng: &mut (dyn RngCore + Send),
    ) -> bool {
        self.scheduled_at = None;

        if self.reached_end {
            // Only reachable with pad_on_shutdown: the already-armed
            // timer fires one final cell, with no further events.
            if self.spec.pads_on_shutdown() && self.padding_allowed(accounting) {
                accounting.note_padding_sent();
                self.counts.padding_sent = self.counts.padding_sent.saturating_add(1);
                return true;
            }
            return false;
        }

        if !self.padding_allowed(accounting) {
            trace!(machine = %self.spec.name(), "padding suppressed by overhead cap");
            self.sample_and_schedule(now, rng, 0);
            return false;
        }

        accounting.note_padding_sent();
        if let Some(n) = self.remaining_len.as_mut() {
            *n = n.saturating_sub(1);
        }

        let gen = self.entries;
        self.handle_cell_event(PadEvent::PaddingSent, now, rng);
        if self.entries == gen && self.remaining_len == Some(0) {
            self.dispatch_internal(PadEvent::LengthCount, now, rng, 0);
        }
        // Keep the cadence going, unless something above moved us to a
        // new state (which scheduled for itself) or the budget ran dry.
        if self.entries == gen && !self.reached_end && self.remaining_len != Some(0) {
            self.sample_and_schedule(now, rng, 0);
        }
        true
    }

    /// Whether the governor (global and per-machine) permits one more
    /// padding cell right now.
    fn padding_allowed(&self, accounting: &PaddingAccounting) -> bool {
        if !accounting.padding_allowed() {
            return false;
        }
        let burst = self.spec.allowed_padding_count();
        if burst == 0 {
            return true;
        }
        let padding = u64::from(self.counts.padding_sent);
        let total = padding + u64::from(self.counts.nonpadding_sent);
        overhead::padding_allowed(
            padding,
            total,
            burst,
            self.spec.max_padding_percent().as_percent(),
        )
    }
}
