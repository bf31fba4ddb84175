//! Padding machine specifications.
//!
//! A [`PadMachineSpec`] is an immutable, process-global description of a
//! padding state machine: an ordered set of states, each with a timing
//! source, an optional length budget, a token-removal strategy, and a
//! next-state table indexed by [`PadEvent`].  Machines are compiled-in
//! descriptions, registered at startup in a
//! [`MachineRegistry`](crate::MachineRegistry); nothing in this module is
//! loaded from configuration or from the network.

use tor_units::Percentage;

use crate::conditions::PadConditions;
use crate::dist::{IatDist, LengthDist};
use crate::err::SpecError;
use crate::event::PadEvent;
use crate::histogram::{HistogramSpec, TokenRemoval};
use crate::negotiate::PadMachineKind;
use crate::HopNum;

/// The 8-bit identifier that selects a machine specification from the
/// registry.
///
/// Machine numbers appear on the wire in `PADDING_NEGOTIATE` messages and
/// are advertised via the `Padding` subprotocol.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct MachineNum(u8);

impl From<u8> for MachineNum {
    fn from(v: u8) -> MachineNum {
        MachineNum(v)
    }
}

impl From<MachineNum> for u8 {
    fn from(v: MachineNum) -> u8 {
        v.0
    }
}

impl std::fmt::Display for MachineNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which endpoint of the circuit runs a machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Side {
    /// The originating endpoint (the client).
    Origin,
    /// The chosen relay hop.
    Relay,
}

/// An index of a state within its machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct StateIx(u8);

impl From<u8> for StateIx {
    fn from(v: u8) -> StateIx {
        StateIx(v)
    }
}

impl From<StateIx> for u8 {
    fn from(v: StateIx) -> u8 {
        v.0
    }
}

impl From<StateIx> for usize {
    fn from(v: StateIx) -> usize {
        usize::from(v.0)
    }
}

impl std::fmt::Display for StateIx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The target of a state transition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Target {
    /// Move to the given state.
    State(StateIx),
    /// Move to the virtual ending state, shutting the machine down.
    ///
    /// The ending state has no payload and no outgoing transitions;
    /// machine descriptions conventionally treat it as "one past the last
    /// state index".
    End,
}

/// A next-state table: for each event, an optional transition target.
///
/// An absent entry means "no change".  An entry naming the current state
/// is also "no change": it does not re-enter the state, refresh the
/// histogram copy, or arm a timer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NextStateTable {
    /// One optional target per event, indexed by `PadEvent::index()`.
    entries: [Option<Target>; PadEvent::N_EVENTS],
}

impl NextStateTable {
    /// Return a table with no transitions at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return this table with a transition added for `event`.
    pub fn on(mut self, event: PadEvent, target: Target) -> Self {
        self.entries[event.index()] = Some(target);
        self
    }

    /// Look up the target for `event`, if any.
    pub(crate) fn lookup(&self, event: PadEvent) -> Option<Target> {
        self.entries[event.index()]
    }

    /// Iterate over every configured target.
    fn targets(&self) -> impl Iterator<Item = Target> + '_ {
        self.entries.iter().flatten().copied()
    }
}

/// Where a state's inter-arrival delays come from.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum TimingSource {
    /// A parameterized distribution.
    Dist(IatDist),
    /// A token histogram.
    Histogram(HistogramSpec),
}

/// One state of a padding machine.
#[derive(Clone, Debug)]
pub struct PadStateSpec {
    /// Where this state's inter-arrival delays come from.
    timing: TimingSource,
    /// Distribution of the per-visit padding budget, if any.
    ///
    /// Unset means the state may pad without limit.
    length_dist: Option<LengthDist>,
    /// How tokens are removed from the histogram when cells are sent.
    token_removal: TokenRemoval,
    /// Where to go when each event fires.
    next_state: NextStateTable,
    /// Whether to add the runtime's RTT estimate to every sampled delay.
    use_rtt_estimate: bool,
}

impl PadStateSpec {
    /// Construct a state that samples delays from a parameterized
    /// distribution.
    pub fn from_dist(dist: IatDist) -> Self {
        PadStateSpec {
            timing: TimingSource::Dist(dist),
            length_dist: None,
            token_removal: TokenRemoval::None,
            next_state: NextStateTable::new(),
            use_rtt_estimate: false,
        }
    }

    /// Construct a state that samples delays from a token histogram.
    pub fn from_histogram(histogram: HistogramSpec) -> Self {
        PadStateSpec {
            timing: TimingSource::Histogram(histogram),
            length_dist: None,
            token_removal: TokenRemoval::None,
            next_state: NextStateTable::new(),
            use_rtt_estimate: false,
        }
    }

    /// Return this state with a per-visit length budget distribution.
    pub fn length_dist(mut self, dist: LengthDist) -> Self {
        self.length_dist = Some(dist);
        self
    }

    /// Return this state with the given token-removal strategy.
    pub fn token_removal(mut self, removal: TokenRemoval) -> Self {
        self.token_removal = removal;
        self
    }

    /// Return this state with a transition added for `event`.
    pub fn on(mut self, event: PadEvent, target: Target) -> Self {
        self.next_state = self.next_state.on(event, target);
        self
    }

    /// Return this state with RTT shifting enabled.
    pub fn use_rtt_estimate(mut self) -> Self {
        self.use_rtt_estimate = true;
        self
    }

    /// This state's timing source.
    pub(crate) fn timing(&self) -> &TimingSource {
        &self.timing
    }

    /// This state's length budget distribution, if any.
    pub(crate) fn length(&self) -> Option<&LengthDist> {
        self.length_dist.as_ref()
    }

    /// This state's token-removal strategy.
    pub(crate) fn removal(&self) -> TokenRemoval {
        self.token_removal
    }

    /// This state's next-state table.
    pub(crate) fn table(&self) -> &NextStateTable {
        &self.next_state
    }

    /// Whether this state adds the RTT estimate to sampled delays.
    pub(crate) fn uses_rtt(&self) -> bool {
        self.use_rtt_estimate
    }
}

/// An immutable padding machine specification.
#[derive(Clone, Debug)]
pub struct PadMachineSpec {
    /// Human-readable name, used only for logging.
    name: String,
    /// Stable identifier, unique per [`Side`].
    number: MachineNum,
    /// Which endpoint runs this machine.
    side: Side,
    /// The wire tag sent in negotiation messages.
    kind: PadMachineKind,
    /// The hop this machine exchanges padding with, counted from the
    /// originating endpoint.
    target_hop: HopNum,
    /// When this machine applies to a circuit.
    conditions: PadConditions,
    /// Whether teardown performs the `STOP`/`NEGOTIATED` handshake.
    should_negotiate_end: bool,
    /// Whether the host should keep the circuit open while this machine
    /// is active.
    keep_circuit_alive: bool,
    /// Whether a timer already armed when the ending state is reached may
    /// fire one final padding cell before teardown.
    pad_on_shutdown: bool,
    /// Padding cells this machine may send before its percentage cap
    /// starts to apply.  Zero disables the per-machine cap.
    allowed_padding_count: u32,
    /// Maximum fraction of this machine's own cells that may be padding.
    max_padding_percent: Percentage<u32>,
    /// The `Padding` subprotocol version the target hop must advertise,
    /// if any.
    required_padding_subver: Option<u8>,
    /// The machine's states, in index order.  State 0 is entered at
    /// install time.
    states: Vec<PadStateSpec>,
}

impl PadMachineSpec {
    /// Begin describing a machine.
    ///
    /// The machine starts out with no states and no conditions; states
    /// are added with [`state()`](Self::state), and the description is
    /// validated when it is registered.
    pub fn new<N: Into<MachineNum>>(
        name: &str,
        number: N,
        side: Side,
        target_hop: HopNum,
    ) -> Self {
        let kind = match side {
            Side::Origin => PadMachineKind::CIRC_SETUP_CLIENT,
            Side::Relay => PadMachineKind::RELAY,
        };
        PadMachineSpec {
            name: name.to_owned(),
            number: number.into(),
            side,
            kind,
            target_hop,
            conditions: PadConditions::default(),
            should_negotiate_end: true,
            keep_circuit_alive: false,
            pad_on_shutdown: false,
            allowed_padding_count: 0,
            max_padding_percent: Percentage::new(0),
            required_padding_subver: None,
            states: Vec::new(),
        }
    }

    /// Return this machine with another state appended.
    pub fn state(mut self, state: PadStateSpec) -> Self {
        self.states.push(state);
        self
    }

    /// Return this machine with the given activation conditions.
    pub fn conditions(mut self, conditions: PadConditions) -> Self {
        self.conditions = conditions;
        self
    }

    /// Return this machine with the `STOP` handshake disabled: teardown
    /// drops the runtime and the spec reference at once.
    pub fn no_negotiate_end(mut self) -> Self {
        self.should_negotiate_end = false;
        self
    }

    /// Return this machine with the keep-circuit-alive flag set.
    pub fn keep_circuit_alive(mut self) -> Self {
        self.keep_circuit_alive = true;
        self
    }

    /// Return this machine allowing an armed timer to fire one final
    /// padding cell after the ending state is reached.
    pub fn pad_on_shutdown(mut self) -> Self {
        self.pad_on_shutdown = true;
        self
    }

    /// Return this machine with a per-machine overhead cap.
    ///
    /// `allowed_count` padding cells may be sent freely; beyond that, the
    /// machine's padding must stay below `max_percent` of its total
    /// cells.
    pub fn overhead_cap(mut self, allowed_count: u32, max_percent: Percentage<u32>) -> Self {
        self.allowed_padding_count = allowed_count;
        self.max_padding_percent = max_percent;
        self
    }

    /// Return this machine requiring the target hop to advertise the
    /// given `Padding` subprotocol version.
    pub fn required_padding_subver(mut self, subver: u8) -> Self {
        self.required_padding_subver = Some(subver);
        self
    }

    /// Return this machine with an explicit wire kind tag.
    pub fn kind(mut self, kind: PadMachineKind) -> Self {
        self.kind = kind;
        self
    }

    /// Validate this machine description.
    ///
    /// Called by the registry; a failure here is fatal at startup.
    pub(crate) fn check(&self) -> Result<(), SpecError> {
        if self.states.is_empty() {
            return Err(SpecError::NoStates(self.number));
        }
        for (ix, state) in self.states.iter().enumerate() {
            for target in state.next_state.targets() {
                if let Target::State(t) = target {
                    if usize::from(t) >= self.states.len() {
                        return Err(SpecError::BadTransitionTarget {
                            machine: self.number,
                            state: ix,
                            target: usize::from(t),
                        });
                    }
                }
            }
            if state.token_removal != TokenRemoval::None
                && !matches!(state.timing, TimingSource::Histogram(_))
            {
                return Err(SpecError::BadHistogram(
                    "token removal on a distribution state",
                ));
            }
        }
        Ok(())
    }

    /// This machine's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This machine's number.
    pub fn number(&self) -> MachineNum {
        self.number
    }

    /// The side this machine runs on.
    pub fn side(&self) -> Side {
        self.side
    }

    /// The wire kind tag for negotiation messages.
    pub fn wire_kind(&self) -> PadMachineKind {
        self.kind
    }

    /// The hop this machine exchanges padding with.
    pub fn target_hop(&self) -> HopNum {
        self.target_hop
    }

    /// This machine's activation conditions.
    pub fn conds(&self) -> &PadConditions {
        &self.conditions
    }

    /// Whether teardown performs the `STOP` handshake.
    pub(crate) fn negotiates_end(&self) -> bool {
        self.should_negotiate_end
    }

    /// Whether the host should keep the circuit alive for this machine.
    pub(crate) fn keeps_circuit_alive(&self) -> bool {
        self.keep_circuit_alive
    }

    /// Whether an armed timer may fire once after the ending state.
    pub(crate) fn pads_on_shutdown(&self) -> bool {
        self.pad_on_shutdown
    }

    /// The per-machine burst allowance, or zero for none.
    pub(crate) fn allowed_padding_count(&self) -> u32 {
        self.allowed_padding_count
    }

    /// The per-machine percentage cap.
    pub(crate) fn max_padding_percent(&self) -> Percentage<u32> {
        self.max_padding_percent
    }

    /// The required `Padding` subprotocol version, if any.
    pub(crate) fn padding_subver(&self) -> Option<u8> {
        self.required_padding_subver
    }

    /// The machine's states.
    pub(crate) fn states(&self) -> &[PadStateSpec] {
        &self.states
    }

    /// Look up a state by index.
    ///
    /// # Panics
    ///
    /// Panics if `ix` is out of range; the registry has validated every
    /// reachable index.
    pub(crate) fn state_spec(&self, ix: StateIx) -> &PadStateSpec {
        &self.states[usize::from(ix)]
    }
}
