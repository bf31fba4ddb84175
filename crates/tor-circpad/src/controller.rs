//! The activation controller: matches machines to circuits, installs and
//! tears down runtimes, and drives the negotiation handshake.
//!
//! One [`CircPadControl`] exists per circuit (per side).  The host calls
//! a lifecycle entry point whenever something about the circuit changes,
//! feeds in cell and negotiation events as they happen, and fires due
//! timers from its scheduling loop.  Every call returns the
//! [`PaddingAction`]s the host must perform; the controller itself never
//! touches the transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rand_core::RngCore;
use tracing::{info, trace, warn};

use crate::conditions::CircuitSnapshot;
use crate::config::PaddingConfig;
use crate::err::Error;
use crate::event::PadEvent;
use crate::machine::{MachineNum, PadMachineSpec, Side};
use crate::negotiate::{
    PadNegotiateCmd, PadResponse, PaddingNegotiate, PaddingNegotiated, PADDING_NEGOTIATE_VERSION,
};
use crate::overhead::PaddingAccounting;
use crate::registry::MachineRegistry;
use crate::runtime::{MachineCounts, PadRuntime};
use crate::HopNum;

/// How long after sending `STOP` the slot's spec reference is retained,
/// waiting for the peer's `NEGOTIATED`.
pub(crate) const NEGOTIATED_GRACE: Duration = Duration::from_secs(30);

/// The number of machine slots on each circuit.
const N_SLOTS: usize = 2;

/// Something the host must do on behalf of the padding framework.
///
/// Actions never delay anything: a padding cell is *inserted* into the
/// circuit's outbound queue, and negotiation messages are ordinary
/// control messages addressed to the named hop.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum PaddingAction {
    /// Send one padding (`DROP`) cell to the given hop.
    SendPadding {
        /// The hop the cell is addressed to.
        hop: HopNum,
    },
    /// Send a `PADDING_NEGOTIATE` message to the given hop.
    SendNegotiate {
        /// The hop the message is addressed to.
        hop: HopNum,
        /// The message body.
        msg: PaddingNegotiate,
    },
    /// Send a `PADDING_NEGOTIATED` reply back toward the origin.
    SendNegotiated {
        /// The hop the message is addressed to.  On the relay side this
        /// is always hop 0, meaning "back along the circuit".
        hop: HopNum,
        /// The message body.
        msg: PaddingNegotiated,
    },
}

/// One machine slot on a circuit.
///
/// The spec reference outlives the runtime during shutdown, so that
/// stray incoming padding cells remain attributable to a known machine
/// until the peer confirms the stop (or the grace period ends).
#[derive(Default)]
struct Slot {
    /// The installed machine, if any.
    spec: Option<Arc<PadMachineSpec>>,
    /// The running state, if the machine is active.
    runtime: Option<PadRuntime>,
    /// Set while we are waiting for `NEGOTIATED` after sending `STOP`.
    stop_deadline: Option<Instant>,
    /// The `machine_ctr` of the most recent install in this slot.
    ///
    /// Monotonically increasing; used to match `NEGOTIATED` responses to
    /// requests across rapid replacement.
    ctr: u32,
}

impl Slot {
    /// Whether a new machine may be installed here.
    ///
    /// A slot still waiting for `NEGOTIATED(STOP)` may be replaced: the
    /// counter bump makes the outstanding response unmatchable.
    fn installable(&self) -> bool {
        self.runtime.is_none()
    }

    /// Clear everything, leaving the slot empty.
    fn clear(&mut self) {
        self.spec = None;
        self.runtime = None;
        self.stop_deadline = None;
    }
}

/// The per-circuit padding controller.
pub struct CircPadControl {
    /// Which endpoint of the circuit we are.
    side: Side,
    /// The process-global machine catalog.
    registry: Arc<MachineRegistry>,
    /// The process-global overhead counters.
    accounting: PaddingAccounting,
    /// Developer overrides.
    config: Arc<PaddingConfig>,
    /// The random source used for all sampling on this circuit.
    rng: Box<dyn RngCore + Send>,
    /// The circuit's machine slots.
    slots: [Slot; N_SLOTS],
}

impl CircPadControl {
    /// Construct a controller for one circuit.
    ///
    /// `rng` is the random source for every delay and length sample on
    /// this circuit; tests pass a seeded generator.
    pub fn new(
        side: Side,
        registry: Arc<MachineRegistry>,
        accounting: PaddingAccounting,
        config: Arc<PaddingConfig>,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        CircPadControl {
            side,
            registry,
            accounting,
            config,
            rng,
            slots: Default::default(),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle entry points.

    /// A hop was added to the circuit.
    pub fn circ_hop_added(&mut self, circ: &CircuitSnapshot, now: Instant) -> Vec<PaddingAction> {
        self.lifecycle_event("hop_added", circ, now)
    }

    /// The circuit finished building.
    pub fn circ_built(&mut self, circ: &CircuitSnapshot, now: Instant) -> Vec<PaddingAction> {
        self.lifecycle_event("built", circ, now)
    }

    /// The circuit's purpose changed.
    pub fn circ_purpose_changed(
        &mut self,
        circ: &CircuitSnapshot,
        now: Instant,
    ) -> Vec<PaddingAction> {
        self.lifecycle_event("purpose_changed", circ, now)
    }

    /// The circuit has used up its RELAY_EARLY budget.
    pub fn circ_relay_early_exhausted(
        &mut self,
        circ: &CircuitSnapshot,
        now: Instant,
    ) -> Vec<PaddingAction> {
        self.lifecycle_event("relay_early_exhausted", circ, now)
    }

    /// One or more streams were attached to the circuit.
    pub fn circ_streams_attached(
        &mut self,
        circ: &CircuitSnapshot,
        now: Instant,
    ) -> Vec<PaddingAction> {
        self.lifecycle_event("streams_attached", circ, now)
    }

    /// The circuit's last stream was detached.
    pub fn circ_streams_detached(
        &mut self,
        circ: &CircuitSnapshot,
        now: Instant,
    ) -> Vec<PaddingAction> {
        self.lifecycle_event("streams_detached", circ, now)
    }

    /// The circuit is being closed: drop everything at once.
    ///
    /// No `STOP` is sent; the circuit is going away along with anything
    /// we might say on it.
    pub fn circ_closed(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
    }

    /// Re-evaluate every slot against the circuit, tearing down machines
    /// whose conditions fail and (on the origin side) filling empty
    /// slots from the registry.
    fn lifecycle_event(
        &mut self,
        event: &str,
        circ: &CircuitSnapshot,
        now: Instant,
    ) -> Vec<PaddingAction> {
        trace!(event, "padding lifecycle event");
        let mut actions = Vec::new();

        for i in 0..N_SLOTS {
            let still_wanted = match (&self.slots[i].spec, &self.slots[i].runtime) {
                (Some(spec), Some(_)) => {
                    self.config.padding_enabled && spec.conds().evaluate(circ)
                }
                _ => continue,
            };
            if !still_wanted {
                self.begin_shutdown(i, now, &mut actions);
            }
        }

        if self.side == Side::Origin && self.config.padding_enabled {
            for i in 0..N_SLOTS {
                if !self.slots[i].installable() {
                    continue;
                }
                if let Some(machine) = self.pick_machine(circ) {
                    self.install(i, machine, now, &mut actions);
                }
            }
        }

        self.reap(now, &mut actions);
        actions
    }

    /// Choose the first registry candidate (in reverse registration
    /// order) that matches the circuit and is not already running.
    fn pick_machine(&self, circ: &CircuitSnapshot) -> Option<Arc<PadMachineSpec>> {
        self.registry
            .candidates(Side::Origin)
            .find(|m| {
                !self.machine_is_active(m.number())
                    && m.conds().evaluate(circ)
                    && self.hop_supports(m, circ)
            })
            .cloned()
    }

    /// Whether a machine with this number is running in any slot.
    fn machine_is_active(&self, number: MachineNum) -> bool {
        self.slots.iter().any(|s| {
            s.runtime.is_some() && s.spec.as_ref().map(|m| m.number()) == Some(number)
        })
    }

    /// Whether the machine's target hop advertises the subprotocol
    /// support the machine requires.
    ///
    /// The restricted-middles override bypasses the check for listed
    /// relays; a machine that requires nothing always passes.
    fn hop_supports(&self, machine: &PadMachineSpec, circ: &CircuitSnapshot) -> bool {
        let Some(subver) = machine.padding_subver() else {
            return true;
        };
        let Some(hop) = circ.hop_info(machine.target_hop()) else {
            return false;
        };
        {
            use tor_linkspec::HasRelayIds;
            if hop
                .relay_ids()
                .identities()
                .any(|id| self.config.restricted_middles.contains(id))
            {
                return true;
            }
        }
        hop.supports_padding_subver(subver)
    }

    /// Install `machine` into slot `i` and dispatch `START`.
    ///
    /// Padding begins immediately; we do not wait for `NEGOTIATED`.
    fn install(
        &mut self,
        i: usize,
        machine: Arc<PadMachineSpec>,
        now: Instant,
        actions: &mut Vec<PaddingAction>,
    ) {
        let slot = &mut self.slots[i];
        slot.ctr = slot.ctr.wrapping_add(1);
        let msg = PaddingNegotiate::start(machine.wire_kind(), machine.number(), slot.ctr);
        info!(
            machine = %machine.name(),
            number = %machine.number(),
            ctr = slot.ctr,
            "installing padding machine"
        );
        slot.runtime = Some(PadRuntime::install(
            Arc::clone(&machine),
            now,
            &mut *self.rng,
        ));
        slot.stop_deadline = None;
        let hop = machine.target_hop();
        slot.spec = Some(machine);
        actions.push(PaddingAction::SendNegotiate { hop, msg });
    }

    /// Tear down the runtime in slot `i`, sending `STOP` and retaining
    /// the spec reference when the machine negotiates its end.
    fn begin_shutdown(&mut self, i: usize, now: Instant, actions: &mut Vec<PaddingAction>) {
        let side = self.side;
        let slot = &mut self.slots[i];
        let Some(spec) = slot.spec.as_ref() else {
            return;
        };
        info!(machine = %spec.name(), "shutting down padding machine");
        slot.runtime = None;
        if side == Side::Origin && spec.negotiates_end() {
            let msg = PaddingNegotiate::stop(spec.wire_kind(), spec.number(), slot.ctr);
            actions.push(PaddingAction::SendNegotiate {
                hop: spec.target_hop(),
                msg,
            });
            slot.stop_deadline = Some(now + NEGOTIATED_GRACE);
        } else {
            // Relay machines cannot initiate negotiation, and machines
            // with should_negotiate_end unset skip the handshake.
            slot.clear();
        }
    }

    /// Shut down any runtime that has reached its ending state and has
    /// no final fire pending.
    fn reap(&mut self, now: Instant, actions: &mut Vec<PaddingAction>) {
        for i in 0..N_SLOTS {
            let done = match &self.slots[i].runtime {
                Some(rt) => rt.reached_end() && rt.scheduled_at().is_none(),
                None => false,
            };
            if done {
                self.begin_shutdown(i, now, actions);
            }
        }
    }

    // ------------------------------------------------------------------
    // Cell events.

    /// A non-padding cell was sent on the circuit.
    pub fn nonpadding_sent(&mut self, now: Instant) -> Vec<PaddingAction> {
        self.accounting.note_nonpadding_sent();
        self.dispatch_cell(PadEvent::NonPaddingSent, now)
    }

    /// A non-padding cell was received on the circuit.
    pub fn nonpadding_received(&mut self, now: Instant) -> Vec<PaddingAction> {
        self.dispatch_cell(PadEvent::NonPaddingRecv, now)
    }

    /// A padding cell arrived from `hop`.
    ///
    /// Padding must come from a peer with a known machine: a cell on a
    /// slot with no spec reference is a protocol violation, which we
    /// log and report.  Whether to close the circuit is the host's
    /// policy; nothing here does so.
    pub fn padding_received(
        &mut self,
        hop: HopNum,
        now: Instant,
    ) -> crate::Result<Vec<PaddingAction>> {
        let Self { slots, rng, .. } = self;
        let slot = slots
            .iter_mut()
            .find(|s| s.spec.as_ref().map(|m| m.target_hop()) == Some(hop));
        match slot {
            None => {
                warn!(
                    hop = %hop.display(),
                    "padding cell received with no padding machine configured"
                );
                Err(Error::CircProto(format!(
                    "padding cell from hop {} with no padding machine",
                    hop.display()
                )))
            }
            Some(slot) => {
                if let Some(rt) = slot.runtime.as_mut() {
                    rt.handle_cell_event(PadEvent::PaddingRecv, now, &mut **rng);
                }
                // A spec with no runtime is a machine mid-shutdown; the
                // cell is attributable and needs no further action.
                let mut actions = Vec::new();
                self.reap(now, &mut actions);
                Ok(actions)
            }
        }
    }

    /// Deliver a cell event to every active runtime.
    fn dispatch_cell(&mut self, ev: PadEvent, now: Instant) -> Vec<PaddingAction> {
        let Self { slots, rng, .. } = self;
        for slot in slots.iter_mut() {
            if let Some(rt) = slot.runtime.as_mut() {
                rt.handle_cell_event(ev, now, &mut **rng);
            }
        }
        let mut actions = Vec::new();
        self.reap(now, &mut actions);
        actions
    }

    // ------------------------------------------------------------------
    // Negotiation.

    /// Handle a `PADDING_NEGOTIATE` request (relay side only).
    pub fn handle_negotiate(
        &mut self,
        msg: &PaddingNegotiate,
        circ: &CircuitSnapshot,
        now: Instant,
    ) -> Vec<PaddingAction> {
        if self.side != Side::Relay {
            warn!("PADDING_NEGOTIATE arrived at the origin side; dropping");
            return Vec::new();
        }
        let response = self.negotiate_response(msg, circ, now);
        let reply = PaddingNegotiated::reply_to(msg, response);
        let mut actions = vec![PaddingAction::SendNegotiated {
            hop: 0.into(),
            msg: reply,
        }];
        self.reap(now, &mut actions);
        actions
    }

    /// Decide how to answer a `PADDING_NEGOTIATE`, applying its effects.
    fn negotiate_response(
        &mut self,
        msg: &PaddingNegotiate,
        circ: &CircuitSnapshot,
        now: Instant,
    ) -> PadResponse {
        if msg.version() != PADDING_NEGOTIATE_VERSION {
            return PadResponse::ERR_UNSUPPORTED_VERSION;
        }
        match msg.command() {
            PadNegotiateCmd::START => self.negotiate_start(msg, circ, now),
            PadNegotiateCmd::STOP => self.negotiate_stop(msg.machine_number()),
            other => {
                warn!(command = %other, "unknown padding negotiation command");
                PadResponse::ERR_INTERNAL
            }
        }
    }

    /// Install the machine a `START` request names.
    fn negotiate_start(
        &mut self,
        msg: &PaddingNegotiate,
        circ: &CircuitSnapshot,
        now: Instant,
    ) -> PadResponse {
        let Some(machine) = self
            .registry
            .lookup(Side::Relay, msg.machine_number())
            .cloned()
        else {
            return PadResponse::ERR_UNKNOWN_MACHINE;
        };
        if !self.config.padding_enabled || !machine.conds().evaluate(circ) {
            return PadResponse::ERR_NOT_APPLICABLE;
        }
        if self.machine_is_active(machine.number()) {
            // Duplicate install; the origin should have stopped the old
            // instance first.
            return PadResponse::ERR_INTERNAL;
        }
        let Some(i) = (0..N_SLOTS).find(|i| self.slots[*i].installable()) else {
            return PadResponse::ERR_INTERNAL;
        };
        let slot = &mut self.slots[i];
        slot.ctr = msg.machine_ctr();
        info!(
            machine = %machine.name(),
            ctr = slot.ctr,
            "installing relay-side padding machine"
        );
        slot.runtime = Some(PadRuntime::install(
            Arc::clone(&machine),
            now,
            &mut *self.rng,
        ));
        slot.stop_deadline = None;
        slot.spec = Some(machine);
        PadResponse::SUCCESS
    }

    /// Tear down the machine a `STOP` request names.
    fn negotiate_stop(&mut self, number: MachineNum) -> PadResponse {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.spec.as_ref().map(|m| m.number()) == Some(number));
        match slot {
            Some(slot) => {
                slot.clear();
                PadResponse::SUCCESS
            }
            None => PadResponse::ERR_UNKNOWN_MACHINE,
        }
    }

    /// Handle a `PADDING_NEGOTIATED` reply (origin side only).
    ///
    /// Replies whose `(machine_number, machine_ctr)` match no slot are
    /// dropped silently: they answer a machine we have already
    /// replaced.  A rejection of an optimistic `START` tears the
    /// machine down and is reported as an error.
    pub fn handle_negotiated(&mut self, msg: &PaddingNegotiated, _now: Instant) -> crate::Result<()> {
        if self.side != Side::Origin {
            warn!("PADDING_NEGOTIATED arrived at the relay side; dropping");
            return Ok(());
        }
        let slot = self.slots.iter_mut().find(|s| {
            s.ctr == msg.machine_ctr()
                && s.spec.as_ref().map(|m| m.number()) == Some(msg.machine_number())
        });
        let Some(slot) = slot else {
            trace!(
                number = %msg.machine_number(),
                ctr = msg.machine_ctr(),
                "stale PADDING_NEGOTIATED; dropping"
            );
            return Ok(());
        };
        match msg.command() {
            PadNegotiateCmd::STOP => {
                // The peer confirmed the stop: release the spec
                // reference we were holding for attribution.
                slot.clear();
                Ok(())
            }
            PadNegotiateCmd::START if msg.response() == PadResponse::SUCCESS => {
                // Already padding optimistically; nothing to do.
                Ok(())
            }
            PadNegotiateCmd::START => {
                warn!(
                    number = %msg.machine_number(),
                    response = %msg.response(),
                    "peer rejected padding machine; tearing down"
                );
                slot.clear();
                Err(Error::NegotiationRejected {
                    machine: msg.machine_number(),
                    response: msg.response(),
                })
            }
            other => {
                warn!(command = %other, "unknown command in PADDING_NEGOTIATED");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers.

    /// The next instant at which [`timers_fired`](Self::timers_fired)
    /// needs to run, if any.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.slots
            .iter()
            .flat_map(|s| {
                s.runtime
                    .as_ref()
                    .and_then(|rt| rt.scheduled_at())
                    .into_iter()
                    .chain(s.stop_deadline)
            })
            .min()
    }

    /// Fire every timer that is due at `now`.
    pub fn timers_fired(&mut self, now: Instant) -> Vec<PaddingAction> {
        let mut actions = Vec::new();
        let Self {
            slots,
            rng,
            accounting,
            ..
        } = self;
        for slot in slots.iter_mut() {
            if slot.stop_deadline.is_some_and(|dl| dl <= now) {
                trace!("padding STOP grace period expired; releasing spec reference");
                slot.clear();
                continue;
            }
            let Some(rt) = slot.runtime.as_mut() else {
                continue;
            };
            if rt.scheduled_at().is_some_and(|t| t <= now)
                && rt.timer_fired(now, accounting, &mut **rng)
            {
                actions.push(PaddingAction::SendPadding {
                    hop: rt.spec().target_hop(),
                });
            }
        }
        self.reap(now, &mut actions);
        actions
    }

    // ------------------------------------------------------------------
    // Accessors.

    /// Whether any active machine wants the circuit kept open.
    pub fn wants_circuit_kept_alive(&self) -> bool {
        self.slots.iter().any(|s| {
            s.runtime.is_some()
                && s.spec
                    .as_ref()
                    .is_some_and(|m| m.keeps_circuit_alive())
        })
    }

    /// The numbers of the machines currently running.
    pub fn active_machines(&self) -> Vec<MachineNum> {
        self.slots
            .iter()
            .filter(|s| s.runtime.is_some())
            .filter_map(|s| s.spec.as_ref().map(|m| m.number()))
            .collect()
    }

    /// Whether any slot still holds a spec reference (active or awaiting
    /// the peer's `NEGOTIATED`).
    pub fn holds_spec(&self, number: MachineNum) -> bool {
        self.slots
            .iter()
            .any(|s| s.spec.as_ref().map(|m| m.number()) == Some(number))
    }

    /// The named machine's cell counters, if it is still running.
    pub fn machine_counts(&self, number: MachineNum) -> Option<MachineCounts> {
        self.slots
            .iter()
            .filter(|s| s.spec.as_ref().map(|m| m.number()) == Some(number))
            .find_map(|s| s.runtime.as_ref())
            .map(|rt| rt.counts())
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use crate::conditions::{CircPurpose, CircStateMask, HopSnapshot, PadConditions};
    use crate::dist::{DelayDist, IatDist};
    use crate::machine::PadStateSpec;
    use crate::negotiate::PadMachineKind;
    use tor_basic_utils::test_rng::testing_rng;

    fn rng() -> Box<dyn RngCore + Send> {
        Box::new(testing_rng())
    }

    fn steady_state(usec: f64) -> PadStateSpec {
        let dist = IatDist::new(DelayDist::uniform(usec, usec).unwrap(), 1_000_000, 0).unwrap();
        PadStateSpec::from_dist(dist)
    }

    fn streams_machine(number: u8, side: Side) -> PadMachineSpec {
        PadMachineSpec::new("streamer", number, side, 1.into())
            .conditions(
                PadConditions::always()
                    .min_hops(3)
                    .state_mask(CircStateMask::HAS_STREAMS),
            )
            .state(steady_state(1000.0))
    }

    fn registry(machines: Vec<PadMachineSpec>) -> Arc<MachineRegistry> {
        let mut reg = MachineRegistry::new();
        for m in machines {
            reg.register(m).unwrap();
        }
        Arc::new(reg)
    }

    fn controller(side: Side, reg: Arc<MachineRegistry>) -> CircPadControl {
        CircPadControl::new(
            side,
            reg,
            PaddingAccounting::default(),
            Arc::new(PaddingConfig::default()),
            rng(),
        )
    }

    fn three_hop_with_streams() -> CircuitSnapshot {
        CircuitSnapshot::new(CircPurpose::General)
            .hop(HopSnapshot::new())
            .hop(HopSnapshot::new())
            .hop(HopSnapshot::new())
            .opened()
            .streams(true)
    }

    /// Pull the `SendNegotiate` messages out of an action list.
    fn negotiate_msgs(actions: &[PaddingAction]) -> Vec<&PaddingNegotiate> {
        actions
            .iter()
            .filter_map(|a| match a {
                PaddingAction::SendNegotiate { msg, .. } => Some(msg),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn origin_installs_optimistically() {
        let mut ctl = controller(Side::Origin, registry(vec![streams_machine(3, Side::Origin)]));
        let now = Instant::now();

        // Conditions not met yet: no streams.
        let circ = three_hop_with_streams().streams(false);
        assert!(ctl.circ_built(&circ, now).is_empty());
        assert!(ctl.active_machines().is_empty());

        // Streams attach: START goes out, and padding is already
        // scheduled without waiting for the reply.
        let circ = three_hop_with_streams();
        let actions = ctl.circ_streams_attached(&circ, now);
        let msgs = negotiate_msgs(&actions);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].command(), PadNegotiateCmd::START);
        assert_eq!(msgs[0].machine_number(), 3.into());
        assert_eq!(ctl.active_machines(), vec![3.into()]);
        assert!(ctl.next_wakeup().is_some());
    }

    #[test]
    fn conditions_failure_stops_and_retains_spec() {
        let mut ctl = controller(Side::Origin, registry(vec![streams_machine(3, Side::Origin)]));
        let now = Instant::now();
        ctl.circ_streams_attached(&three_hop_with_streams(), now);

        // The stream detaches: STOP goes out; the runtime dies but the
        // spec reference stays for attribution.
        let circ = three_hop_with_streams().streams(false);
        let actions = ctl.circ_streams_detached(&circ, now);
        let msgs = negotiate_msgs(&actions);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].command(), PadNegotiateCmd::STOP);
        assert!(ctl.active_machines().is_empty());
        assert!(ctl.holds_spec(3.into()));

        // A stray padding cell during the grace period is attributable.
        assert!(ctl.padding_received(1.into(), now).unwrap().is_empty());

        // The peer confirms: the spec reference is released.
        let reply = PaddingNegotiated::reply_to(msgs[0], PadResponse::SUCCESS);
        ctl.handle_negotiated(&reply, now).unwrap();
        assert!(!ctl.holds_spec(3.into()));
    }

    #[test]
    fn stop_grace_period_expires() {
        let mut ctl = controller(Side::Origin, registry(vec![streams_machine(3, Side::Origin)]));
        let now = Instant::now();
        ctl.circ_streams_attached(&three_hop_with_streams(), now);
        ctl.circ_streams_detached(&three_hop_with_streams().streams(false), now);
        assert!(ctl.holds_spec(3.into()));

        // No NEGOTIATED ever arrives; the deadline is our wakeup.
        let deadline = ctl.next_wakeup().unwrap();
        assert_eq!(deadline, now + NEGOTIATED_GRACE);
        ctl.timers_fired(deadline);
        assert!(!ctl.holds_spec(3.into()));
    }

    #[test]
    fn rapid_replacement_drops_stale_reply() {
        let machine_a = streams_machine(3, Side::Origin);
        let machine_b = PadMachineSpec::new("other", 4_u8, Side::Origin, 1.into())
            .conditions(
                PadConditions::always()
                    .min_hops(3)
                    .state_mask(CircStateMask::NO_STREAMS),
            )
            .state(steady_state(1000.0));
        let mut ctl = controller(Side::Origin, registry(vec![machine_b, machine_a]));
        let now = Instant::now();

        // Machine 3 (later-registered) wins the slot first.
        let start_a = ctl.circ_streams_attached(&three_hop_with_streams(), now);
        let ctr_a = negotiate_msgs(&start_a)[0].machine_ctr();

        // Streams detach: STOP(3) and an immediate replacement START(4)
        // in the same pass.
        let actions = ctl.circ_streams_detached(&three_hop_with_streams().streams(false), now);
        let msgs = negotiate_msgs(&actions);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].command(), PadNegotiateCmd::STOP);
        assert_eq!(msgs[1].command(), PadNegotiateCmd::START);
        let ctr_b = msgs[1].machine_ctr();
        assert!(ctr_b > ctr_a);
        assert_eq!(ctl.active_machines(), vec![4.into()]);

        // The late NEGOTIATED(STOP) for machine 3 no longer matches
        // anything, and machine 4 is unaffected.
        let stale = PaddingNegotiated::reply_to(msgs[0], PadResponse::SUCCESS);
        ctl.handle_negotiated(&stale, now).unwrap();
        assert_eq!(ctl.active_machines(), vec![4.into()]);

        // The SUCCESS for machine 4 is likewise a no-op: we were already
        // padding.
        let ok = PaddingNegotiated::reply_to(msgs[1], PadResponse::SUCCESS);
        ctl.handle_negotiated(&ok, now).unwrap();
        assert_eq!(ctl.active_machines(), vec![4.into()]);
    }

    #[test]
    fn peer_rejection_tears_down() {
        let mut ctl = controller(Side::Origin, registry(vec![streams_machine(3, Side::Origin)]));
        let now = Instant::now();
        let start = ctl.circ_streams_attached(&three_hop_with_streams(), now);
        let start_msg = negotiate_msgs(&start)[0];

        let nack = PaddingNegotiated::reply_to(start_msg, PadResponse::ERR_NOT_APPLICABLE);
        let err = ctl.handle_negotiated(&nack, now).unwrap_err();
        assert!(matches!(err, Error::NegotiationRejected { .. }));
        assert!(ctl.active_machines().is_empty());
        assert!(!ctl.holds_spec(3.into()));
    }

    #[test]
    fn relay_side_negotiation() {
        let mut ctl = controller(Side::Relay, registry(vec![streams_machine(7, Side::Relay)]));
        let now = Instant::now();
        let circ = three_hop_with_streams();

        // Unknown machine.
        let req = PaddingNegotiate::start(PadMachineKind::RELAY, 9.into(), 1);
        let actions = ctl.handle_negotiate(&req, &circ, now);
        let PaddingAction::SendNegotiated { msg, .. } = &actions[0] else {
            panic!("no reply");
        };
        assert_eq!(msg.response(), PadResponse::ERR_UNKNOWN_MACHINE);

        // Unsupported version.
        let mut raw = Vec::new();
        PaddingNegotiate::start(PadMachineKind::RELAY, 7.into(), 1)
            .encode_onto(&mut raw)
            .unwrap();
        raw[0] = 9;
        let req = PaddingNegotiate::decode_from_reader(&mut tor_bytes::Reader::from_slice(&raw))
            .unwrap();
        let actions = ctl.handle_negotiate(&req, &circ, now);
        let PaddingAction::SendNegotiated { msg, .. } = &actions[0] else {
            panic!("no reply");
        };
        assert_eq!(msg.response(), PadResponse::ERR_UNSUPPORTED_VERSION);

        // Conditions not applicable.
        let req = PaddingNegotiate::start(PadMachineKind::RELAY, 7.into(), 1);
        let idle = three_hop_with_streams().streams(false);
        let actions = ctl.handle_negotiate(&req, &idle, now);
        let PaddingAction::SendNegotiated { msg, .. } = &actions[0] else {
            panic!("no reply");
        };
        assert_eq!(msg.response(), PadResponse::ERR_NOT_APPLICABLE);

        // A valid START installs and begins padding.
        let actions = ctl.handle_negotiate(&req, &circ, now);
        let PaddingAction::SendNegotiated { msg, .. } = &actions[0] else {
            panic!("no reply");
        };
        assert_eq!(msg.response(), PadResponse::SUCCESS);
        assert_eq!(ctl.active_machines(), vec![7.into()]);
        assert!(ctl.next_wakeup().is_some());

        // A duplicate START is an error.
        let actions = ctl.handle_negotiate(&req, &circ, now);
        let PaddingAction::SendNegotiated { msg, .. } = &actions[0] else {
            panic!("no reply");
        };
        assert_eq!(msg.response(), PadResponse::ERR_INTERNAL);

        // STOP tears it down.
        let req = PaddingNegotiate::stop(PadMachineKind::RELAY, 7.into(), 1);
        let actions = ctl.handle_negotiate(&req, &circ, now);
        let PaddingAction::SendNegotiated { msg, .. } = &actions[0] else {
            panic!("no reply");
        };
        assert_eq!(msg.response(), PadResponse::SUCCESS);
        assert!(ctl.active_machines().is_empty());
        assert!(!ctl.holds_spec(7.into()));
    }

    #[test]
    fn padding_without_machine_is_a_violation() {
        let mut ctl = controller(Side::Origin, registry(vec![]));
        // Reported, not fatal; the circuit-close decision is the host's.
        let err = ctl.padding_received(1.into(), Instant::now()).unwrap_err();
        assert!(matches!(err, Error::CircProto(_)));
    }

    #[test]
    fn support_check_gates_install() {
        let machine = PadMachineSpec::new("gated", 2_u8, Side::Origin, 1.into())
            .required_padding_subver(2)
            .state(steady_state(1000.0));
        let mut ctl = controller(Side::Origin, registry(vec![machine]));
        let now = Instant::now();

        // Target hop's descriptor is unknown: not applicable, no START.
        let circ = three_hop_with_streams();
        assert!(ctl.circ_built(&circ, now).is_empty());

        // Target hop advertises Padding=2: install.
        let circ = CircuitSnapshot::new(CircPurpose::General)
            .hop(HopSnapshot::new())
            .hop(HopSnapshot::new().protocols("Padding=2".parse().unwrap()))
            .hop(HopSnapshot::new())
            .opened();
        let actions = ctl.circ_built(&circ, now);
        assert_eq!(negotiate_msgs(&actions).len(), 1);
    }

    #[test]
    fn restricted_middle_bypasses_support_check() {
        use tor_linkspec::{RelayId, RelayIds};

        let id: RelayId = "$1234567890abcdef1234567890abcdef12345678"
            .parse()
            .unwrap();
        let mut cfg = PaddingConfig::default();
        cfg.restricted_middles.insert(id.clone());

        let RelayId::Rsa(rsa) = id else {
            panic!("expected an RSA identity");
        };
        let ids = RelayIds::builder()
            .rsa_identity(rsa)
            .build()
            .unwrap();

        let machine = PadMachineSpec::new("gated", 2_u8, Side::Origin, 1.into())
            .required_padding_subver(2)
            .state(steady_state(1000.0));
        let mut ctl = CircPadControl::new(
            Side::Origin,
            registry(vec![machine]),
            PaddingAccounting::default(),
            Arc::new(cfg),
            rng(),
        );

        // No advertised support, but the hop is in the restricted set.
        let circ = CircuitSnapshot::new(CircPurpose::General)
            .hop(HopSnapshot::new())
            .hop(HopSnapshot::new().ids(ids))
            .hop(HopSnapshot::new())
            .opened();
        let actions = ctl.circ_built(&circ, Instant::now());
        assert_eq!(negotiate_msgs(&actions).len(), 1);
    }

    #[test]
    fn disabled_padding_installs_nothing() {
        let cfg = PaddingConfig::builder()
            .padding_enabled(false)
            .build()
            .unwrap();
        let mut ctl = CircPadControl::new(
            Side::Origin,
            registry(vec![streams_machine(3, Side::Origin)]),
            PaddingAccounting::default(),
            Arc::new(cfg),
            rng(),
        );
        assert!(ctl
            .circ_streams_attached(&three_hop_with_streams(), Instant::now())
            .is_empty());
        assert!(ctl.active_machines().is_empty());
    }

    #[test]
    fn keep_circuit_alive_flag() {
        let machine = PadMachineSpec::new("keeper", 5_u8, Side::Origin, 1.into())
            .keep_circuit_alive()
            .state(steady_state(1000.0));
        let mut ctl = controller(Side::Origin, registry(vec![machine]));
        assert!(!ctl.wants_circuit_kept_alive());
        ctl.circ_built(&three_hop_with_streams(), Instant::now());
        assert!(ctl.wants_circuit_kept_alive());
        ctl.circ_closed();
        assert!(!ctl.wants_circuit_kept_alive());
    }

    #[test]
    fn negotiate_on_wrong_side_is_dropped() {
        let mut ctl = controller(Side::Origin, registry(vec![]));
        let req = PaddingNegotiate::start(PadMachineKind::RELAY, 1.into(), 1);
        let circ = three_hop_with_streams();
        assert!(ctl.handle_negotiate(&req, &circ, Instant::now()).is_empty());
    }
}
