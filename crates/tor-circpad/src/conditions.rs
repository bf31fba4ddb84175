//! Conditions under which a padding machine applies to a circuit.
//!
//! The activation controller re-evaluates every machine's
//! [`PadConditions`] against a [`CircuitSnapshot`] on each circuit
//! lifecycle event.  Evaluation is cheap and purely a function of the
//! snapshot: the host builds the snapshot from whatever it knows about
//! the circuit, and the core never inspects the circuit directly.

use bitflags::bitflags;
use tor_linkspec::RelayIds;
use tor_protover::{ProtoKind, Protocols};

use crate::HopNum;

bitflags! {
    /// Mutually observable states a circuit can be in.
    ///
    /// A snapshot always carries exactly one of each complementary pair
    /// (`HAS_STREAMS`/`NO_STREAMS`, `HAS_RELAY_EARLY`/`NO_RELAY_EARLY`,
    /// `BUILDING`/`OPENED`).  A condition mask with several bits set
    /// matches a circuit in any of those states.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct CircStateMask: u32 {
        /// The circuit is still being constructed.
        const BUILDING = 1 << 0;
        /// The circuit is open end-to-end.
        const OPENED = 1 << 1;
        /// At least one stream is attached.
        const HAS_STREAMS = 1 << 2;
        /// No streams are attached.
        const NO_STREAMS = 1 << 3;
        /// The circuit can still send RELAY_EARLY cells.
        const HAS_RELAY_EARLY = 1 << 4;
        /// The circuit's RELAY_EARLY budget is exhausted.
        const NO_RELAY_EARLY = 1 << 5;
    }
}

bitflags! {
    /// A set of circuit purposes.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct CircPurposeMask: u32 {
        /// General-purpose client traffic.
        const GENERAL = 1 << 0;
        /// Directory fetches.
        const DIR_FETCH = 1 << 1;
        /// Client side of an onion-service introduction.
        const HS_CLIENT_INTRO = 1 << 2;
        /// Client side of an onion-service rendezvous.
        const HS_CLIENT_REND = 1 << 3;
        /// Service side of an onion-service introduction.
        const HS_SERVICE_INTRO = 1 << 4;
        /// Service side of an onion-service rendezvous.
        const HS_SERVICE_REND = 1 << 5;
        /// Self-test circuits.
        const TESTING = 1 << 6;
        /// Circuits built at a controller's request.
        const CONTROLLER = 1 << 7;
    }
}

impl Default for CircStateMask {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for CircPurposeMask {
    fn default() -> Self {
        Self::empty()
    }
}

/// The purpose of a single circuit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum CircPurpose {
    /// General-purpose client traffic.
    General,
    /// Directory fetches.
    DirFetch,
    /// Client side of an onion-service introduction.
    HsClientIntro,
    /// Client side of an onion-service rendezvous.
    HsClientRend,
    /// Service side of an onion-service introduction.
    HsServiceIntro,
    /// Service side of an onion-service rendezvous.
    HsServiceRend,
    /// Self-test circuits.
    Testing,
    /// Circuits built at a controller's request.
    Controller,
}

impl From<CircPurpose> for CircPurposeMask {
    fn from(p: CircPurpose) -> CircPurposeMask {
        match p {
            CircPurpose::General => CircPurposeMask::GENERAL,
            CircPurpose::DirFetch => CircPurposeMask::DIR_FETCH,
            CircPurpose::HsClientIntro => CircPurposeMask::HS_CLIENT_INTRO,
            CircPurpose::HsClientRend => CircPurposeMask::HS_CLIENT_REND,
            CircPurpose::HsServiceIntro => CircPurposeMask::HS_SERVICE_INTRO,
            CircPurpose::HsServiceRend => CircPurposeMask::HS_SERVICE_REND,
            CircPurpose::Testing => CircPurposeMask::TESTING,
            CircPurpose::Controller => CircPurposeMask::CONTROLLER,
        }
    }
}

/// The exit role of a circuit's final hop.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ExitRole {
    /// The final hop is not an exit.
    #[default]
    NotExit,
    /// The final hop allows at least the reduced exit policy.
    ReducedExit,
    /// The final hop is a full exit.
    Exit,
}

/// What the host knows about one hop of a circuit.
#[derive(Clone, Debug)]
pub struct HopSnapshot {
    /// The subprotocols the hop advertises, if its descriptor is known.
    protocols: Option<Protocols>,
    /// The hop's relay identities.
    ids: RelayIds,
}

impl Default for HopSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl HopSnapshot {
    /// Construct a hop snapshot with no known descriptor.
    pub fn new() -> Self {
        HopSnapshot {
            protocols: None,
            ids: RelayIds::empty(),
        }
    }

    /// Return this snapshot with the hop's advertised subprotocols.
    pub fn protocols(mut self, protocols: Protocols) -> Self {
        self.protocols = Some(protocols);
        self
    }

    /// Return this snapshot with the hop's relay identities.
    pub fn ids(mut self, ids: RelayIds) -> Self {
        self.ids = ids;
        self
    }

    /// Whether the hop advertises support for the given `Padding`
    /// subprotocol version.
    ///
    /// An unknown descriptor counts as unsupported.
    pub(crate) fn supports_padding_subver(&self, subver: u8) -> bool {
        self.protocols
            .as_ref()
            .map(|p| p.supports_known_subver(ProtoKind::Padding, subver))
            .unwrap_or(false)
    }

    /// The hop's relay identities.
    pub(crate) fn relay_ids(&self) -> &RelayIds {
        &self.ids
    }
}

/// An immutable snapshot of the circuit attributes that padding
/// conditions can observe.
#[derive(Clone, Debug)]
pub struct CircuitSnapshot {
    /// Whether the circuit is open end-to-end.
    opened: bool,
    /// Whether any stream is currently attached.
    has_streams: bool,
    /// Whether the circuit can still send RELAY_EARLY cells.
    has_relay_early: bool,
    /// The circuit's purpose.
    purpose: CircPurpose,
    /// Whether the circuit was built with vanguard restrictions.
    has_vanguards: bool,
    /// The exit role of the final hop.
    exit_role: ExitRole,
    /// Per-hop information, in hop order.
    hops: Vec<HopSnapshot>,
}

impl CircuitSnapshot {
    /// Construct a snapshot of a circuit with the given purpose.
    ///
    /// The snapshot starts out unopened, with no hops, no streams, and a
    /// full RELAY_EARLY budget.
    pub fn new(purpose: CircPurpose) -> Self {
        CircuitSnapshot {
            opened: false,
            has_streams: false,
            has_relay_early: true,
            purpose,
            has_vanguards: false,
            exit_role: ExitRole::NotExit,
            hops: Vec::new(),
        }
    }

    /// Return this snapshot with another hop appended.
    pub fn hop(mut self, hop: HopSnapshot) -> Self {
        self.hops.push(hop);
        self
    }

    /// Return this snapshot marked open end-to-end.
    pub fn opened(mut self) -> Self {
        self.opened = true;
        self
    }

    /// Return this snapshot with the has-streams flag set as given.
    pub fn streams(mut self, has_streams: bool) -> Self {
        self.has_streams = has_streams;
        self
    }

    /// Return this snapshot with the RELAY_EARLY budget marked exhausted.
    pub fn relay_early_exhausted(mut self) -> Self {
        self.has_relay_early = false;
        self
    }

    /// Return this snapshot marked as vanguard-restricted.
    pub fn vanguards(mut self) -> Self {
        self.has_vanguards = true;
        self
    }

    /// Return this snapshot with the given exit role.
    pub fn exit_role(mut self, role: ExitRole) -> Self {
        self.exit_role = role;
        self
    }

    /// The number of hops in the circuit.
    pub fn n_hops(&self) -> u8 {
        u8::try_from(self.hops.len()).unwrap_or(u8::MAX)
    }

    /// Look up a hop by index.
    pub(crate) fn hop_info(&self, hop: HopNum) -> Option<&HopSnapshot> {
        self.hops.get(usize::from(hop))
    }

    /// The state bits this snapshot currently satisfies.
    fn state_flags(&self) -> CircStateMask {
        let mut flags = CircStateMask::empty();
        flags |= if self.opened {
            CircStateMask::OPENED
        } else {
            CircStateMask::BUILDING
        };
        flags |= if self.has_streams {
            CircStateMask::HAS_STREAMS
        } else {
            CircStateMask::NO_STREAMS
        };
        flags |= if self.has_relay_early {
            CircStateMask::HAS_RELAY_EARLY
        } else {
            CircStateMask::NO_RELAY_EARLY
        };
        flags
    }
}

/// A machine's activation conditions.
///
/// [`evaluate`](PadConditions::evaluate) is the logical AND of every
/// specified predicate; empty masks leave their dimension unconstrained.
#[derive(Clone, Debug, Default)]
pub struct PadConditions {
    /// Lower bound on the circuit length.
    min_hops: u8,
    /// Circuit states this machine applies in.
    state_mask: CircStateMask,
    /// Circuit purposes this machine applies to.
    purpose_mask: CircPurposeMask,
    /// Whether the circuit must be vanguard-restricted.
    requires_vanguards: bool,
    /// Whether the final hop must be an exit.
    requires_exit: bool,
    /// Whether the final hop must allow at least the reduced exit
    /// policy.
    reduced_exit_policy: bool,
}

impl PadConditions {
    /// Construct conditions that match every circuit.
    pub fn always() -> Self {
        Self::default()
    }

    /// Return these conditions with a minimum circuit length.
    pub fn min_hops(mut self, min_hops: u8) -> Self {
        self.min_hops = min_hops;
        self
    }

    /// Return these conditions restricted to the given circuit states.
    pub fn state_mask(mut self, mask: CircStateMask) -> Self {
        self.state_mask = mask;
        self
    }

    /// Return these conditions restricted to the given purposes.
    pub fn purpose_mask(mut self, mask: CircPurposeMask) -> Self {
        self.purpose_mask = mask;
        self
    }

    /// Return these conditions requiring vanguard restrictions.
    pub fn requires_vanguards(mut self) -> Self {
        self.requires_vanguards = true;
        self
    }

    /// Return these conditions requiring the final hop to be an exit.
    pub fn requires_exit(mut self) -> Self {
        self.requires_exit = true;
        self
    }

    /// Return these conditions requiring at least a reduced exit policy
    /// at the final hop.
    pub fn reduced_exit_policy(mut self) -> Self {
        self.reduced_exit_policy = true;
        self
    }

    /// Evaluate these conditions against a circuit snapshot.
    pub fn evaluate(&self, circ: &CircuitSnapshot) -> bool {
        if circ.n_hops() < self.min_hops {
            return false;
        }
        if !self.state_mask.is_empty() && !self.state_mask.intersects(circ.state_flags()) {
            return false;
        }
        if !self.purpose_mask.is_empty()
            && !self.purpose_mask.contains(circ.purpose.into())
        {
            return false;
        }
        if self.requires_vanguards && !circ.has_vanguards {
            return false;
        }
        if self.requires_exit && circ.exit_role == ExitRole::NotExit {
            return false;
        }
        if self.reduced_exit_policy
            && !matches!(circ.exit_role, ExitRole::ReducedExit | ExitRole::Exit)
        {
            return false;
        }
        true
    }
}
