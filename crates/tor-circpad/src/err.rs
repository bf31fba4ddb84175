//! Define error types for the tor-circpad crate.

use thiserror::Error;
use tor_error::{ErrorKind, HasKind};

use crate::machine::MachineNum;
use crate::negotiate::PadResponse;

/// An error found while validating a padding machine specification.
///
/// These are detected when a machine is registered, before any circuit can
/// use it; encountering one is fatal at startup.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SpecError {
    /// A machine was declared with no states at all.
    #[error("Padding machine {0} has no states")]
    NoStates(MachineNum),

    /// A transition in a state's next-state table named a state index that
    /// the machine does not have.
    #[error("Transition target {target} out of range in machine {machine}, state {state}")]
    BadTransitionTarget {
        /// The machine containing the bad transition.
        machine: MachineNum,
        /// The state whose table contains the bad transition.
        state: usize,
        /// The out-of-range target index.
        target: usize,
    },

    /// A histogram was declared with a malformed shape.
    #[error("Malformed histogram: {0}")]
    BadHistogram(&'static str),

    /// A timing or length distribution had parameters outside its domain.
    #[error("Bad distribution parameters: {0}")]
    BadDistribution(&'static str),

    /// Two machines on the same side were registered with the same number.
    #[error("Duplicate padding machine number {0}")]
    DuplicateMachine(MachineNum),
}

impl HasKind for SpecError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::BadApiUsage
    }
}

/// An error encountered while running the padding framework on a circuit.
///
/// None of these is fatal to the process: the controller records the error,
/// shuts the affected runtime down, and moves on.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An error occurred in the tor_bytes crate while decoding a
    /// negotiation message.
    #[error("Error while parsing {parsed}")]
    BytesErr {
        /// The error that occurred.
        #[source]
        err: tor_bytes::Error,
        /// The thing that was being parsed.
        parsed: &'static str,
    },

    /// We encountered an error while encoding an outgoing message.
    ///
    /// This is likely to be a bug in somebody's code: either the code in
    /// this crate, or in the calling code that provided an unencodable
    /// message.
    #[error("Error while encoding message")]
    EncodeErr(#[from] tor_bytes::EncodeError),

    /// The peer rejected our request to start a padding machine.
    #[error("Padding negotiation for machine {machine} rejected: {response}")]
    NegotiationRejected {
        /// The machine we asked the peer to run.
        machine: MachineNum,
        /// The error code the peer sent back.
        response: PadResponse,
    },

    /// Protocol violation at the circuit level.
    ///
    /// The core logs these and leaves the decision whether to close the
    /// circuit to the caller.
    #[error("Circuit padding protocol violation: {0}")]
    CircProto(String),

    /// A machine specification was rejected at registration time.
    #[error("Invalid padding machine specification")]
    Spec(#[from] SpecError),

    /// There was a programming error somewhere in the code.
    #[error("Internal programming error")]
    Bug(#[from] tor_error::Bug),
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        use ErrorKind as EK;
        match self {
            E::BytesErr { .. } => EK::TorProtocolViolation,
            E::EncodeErr(..) => EK::BadApiUsage,
            E::NegotiationRejected { .. } => EK::TorProtocolViolation,
            E::CircProto(_) => EK::TorProtocolViolation,
            E::Spec(e) => e.kind(),
            E::Bug(e) => e.kind(),
        }
    }
}
