//! Async integration: a handle for reporting circuit events, and a
//! stream of padding actions for the circuit reactor to perform.
//!
//! The synchronous engine in [`crate::controller`] knows nothing about
//! tasks or clocks.  This module wraps it for use from a circuit
//! reactor: a [`PaddingHandle`] is used to tell the machines about
//! traffic and lifecycle events, and the [`PaddingActionStream`] is
//! polled (typically as one branch of the reactor's `select!`) to learn
//! when to actually send padding or negotiation messages.
//!
//! Both halves share one piece of locked state; the lock is only ever
//! held for short synchronous stretches, never across an await point.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use futures::stream::FusedStream;
use futures::{Future, Stream};
use tor_rtcompat::SleepProvider;

use crate::conditions::CircuitSnapshot;
use crate::controller::{CircPadControl, PaddingAction};
use crate::negotiate::{PaddingNegotiate, PaddingNegotiated};
use crate::HopNum;

/// The state shared between a [`PaddingHandle`] and its
/// [`PaddingActionStream`].
struct Shared<S: SleepProvider> {
    /// The clock and timer source.
    runtime: S,
    /// The synchronous per-circuit controller.
    control: CircPadControl,
    /// Actions produced but not yet yielded by the stream.
    pending: VecDeque<PaddingAction>,
    /// The stream's waker, if it is parked.
    ///
    /// Handle methods wake it after every call: there may be new actions
    /// to yield, or the next timer may have moved earlier.
    waker: Option<Waker>,
}

impl<S: SleepProvider> Shared<S> {
    /// Run `f` on the controller at the current mock-able time, queue
    /// whatever actions it produces, and wake the stream.
    fn with_control<F>(&mut self, f: F)
    where
        F: FnOnce(&mut CircPadControl, std::time::Instant) -> Vec<PaddingAction>,
    {
        let now = self.runtime.now();
        let actions = f(&mut self.control, now);
        self.pending.extend(actions);
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// A handle to the padding state of a single circuit.
///
/// Used to tell the padding machines about events they need to react
/// to.  Cheap to clone.
#[derive(Clone)]
pub struct PaddingHandle<S: SleepProvider> {
    /// The underlying shared state.
    shared: Arc<Mutex<Shared<S>>>,
}

/// Create the padding plumbing for one circuit.
///
/// Returns the event-reporting handle and the action stream.  The
/// stream should be polled from the circuit's reactor; it never
/// terminates.
pub fn new_circuit_padding<S: SleepProvider>(
    runtime: S,
    control: CircPadControl,
) -> (PaddingHandle<S>, PaddingActionStream<S>) {
    let shared = Arc::new(Mutex::new(Shared {
        runtime,
        control,
        pending: VecDeque::new(),
        waker: None,
    }));
    let handle = PaddingHandle {
        shared: Arc::clone(&shared),
    };
    let stream = PaddingActionStream {
        shared,
        sleep_future: None,
    };
    (handle, stream)
}

impl<S: SleepProvider> PaddingHandle<S> {
    /// Lock the shared state.
    fn lock(&self) -> std::sync::MutexGuard<'_, Shared<S>> {
        self.shared.lock().expect("poisoned lock")
    }

    /// A hop was added to the circuit.
    pub fn circ_hop_added(&self, circ: &CircuitSnapshot) {
        self.lock().with_control(|c, now| c.circ_hop_added(circ, now));
    }

    /// The circuit finished building.
    pub fn circ_built(&self, circ: &CircuitSnapshot) {
        self.lock().with_control(|c, now| c.circ_built(circ, now));
    }

    /// The circuit's purpose changed.
    pub fn circ_purpose_changed(&self, circ: &CircuitSnapshot) {
        self.lock()
            .with_control(|c, now| c.circ_purpose_changed(circ, now));
    }

    /// The circuit has used up its RELAY_EARLY budget.
    pub fn circ_relay_early_exhausted(&self, circ: &CircuitSnapshot) {
        self.lock()
            .with_control(|c, now| c.circ_relay_early_exhausted(circ, now));
    }

    /// One or more streams were attached to the circuit.
    pub fn circ_streams_attached(&self, circ: &CircuitSnapshot) {
        self.lock()
            .with_control(|c, now| c.circ_streams_attached(circ, now));
    }

    /// The circuit's last stream was detached.
    pub fn circ_streams_detached(&self, circ: &CircuitSnapshot) {
        self.lock()
            .with_control(|c, now| c.circ_streams_detached(circ, now));
    }

    /// The circuit is being closed.
    pub fn circ_closed(&self) {
        self.lock().with_control(|c, _now| {
            c.circ_closed();
            Vec::new()
        });
    }

    /// A non-padding cell was sent on the circuit.
    pub fn nonpadding_sent(&self) {
        self.lock().with_control(|c, now| c.nonpadding_sent(now));
    }

    /// A non-padding cell was received on the circuit.
    pub fn nonpadding_received(&self) {
        self.lock().with_control(|c, now| c.nonpadding_received(now));
    }

    /// A padding cell arrived from `hop`.
    ///
    /// Returns an error if the cell is a protocol violation (no machine
    /// is configured for that hop); the caller decides what to do with
    /// the circuit.
    pub fn padding_received(&self, hop: HopNum) -> crate::Result<()> {
        let mut result = Ok(());
        self.lock().with_control(|c, now| {
            match c.padding_received(hop, now) {
                Ok(actions) => actions,
                Err(e) => {
                    result = Err(e);
                    Vec::new()
                }
            }
        });
        result
    }

    /// A `PADDING_NEGOTIATE` request arrived (relay side).
    pub fn handle_negotiate(&self, msg: &PaddingNegotiate, circ: &CircuitSnapshot) {
        self.lock()
            .with_control(|c, now| c.handle_negotiate(msg, circ, now));
    }

    /// A `PADDING_NEGOTIATED` reply arrived (origin side).
    ///
    /// Returns an error if the peer rejected a machine we were already
    /// running optimistically.
    pub fn handle_negotiated(&self, msg: &PaddingNegotiated) -> crate::Result<()> {
        let mut result = Ok(());
        self.lock().with_control(|c, now| {
            result = c.handle_negotiated(msg, now);
            Vec::new()
        });
        result
    }

    /// Whether any active machine wants the circuit kept open.
    pub fn wants_circuit_kept_alive(&self) -> bool {
        self.lock().control.wants_circuit_kept_alive()
    }
}

/// A stream of [`PaddingAction`] telling the circuit reactor when to
/// send padding and negotiation messages.
pub struct PaddingActionStream<S: SleepProvider> {
    /// The underlying shared state.
    shared: Arc<Mutex<Shared<S>>>,
    /// The sleep future for the next scheduled wakeup, if any.
    ///
    /// Recreated whenever the wakeup time changes; allowed to be
    /// earlier than the true wakeup time, never later.
    sleep_future: Option<Pin<Box<S::SleepFuture>>>,
}

impl<S: SleepProvider> Stream for PaddingActionStream<S> {
    type Item = PaddingAction;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let (next_wakeup, now, runtime) = {
                let mut shared = self.shared.lock().expect("poisoned lock");

                if let Some(action) = shared.pending.pop_front() {
                    return Poll::Ready(Some(action));
                }

                // Fire anything that has become due.
                let now = shared.runtime.now();
                let fired = shared.control.timers_fired(now);
                shared.pending.extend(fired);
                if let Some(action) = shared.pending.pop_front() {
                    return Poll::Ready(Some(action));
                }

                // Nothing to do right now: park until a handle call or
                // the next timer.
                shared.waker = Some(cx.waker().clone());
                (shared.control.next_wakeup(), now, shared.runtime.clone())
                // The lock is dropped here.
            };

            match next_wakeup {
                None => return Poll::Pending,
                Some(t) => {
                    let sleep = runtime.sleep(t.saturating_duration_since(now));
                    self.sleep_future = Some(Box::pin(sleep));
                    match self
                        .sleep_future
                        .as_mut()
                        .expect("sleep future just stored")
                        .as_mut()
                        .poll(cx)
                    {
                        // Already expired: go round and fire it.
                        Poll::Ready(()) => continue,
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

impl<S: SleepProvider> FusedStream for PaddingActionStream<S> {
    fn is_terminated(&self) -> bool {
        // Never terminated: an idle circuit may gain machines later.
        false
    }
}
