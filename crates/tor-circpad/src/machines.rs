//! Built-in padding machine descriptions.
//!
//! These are the compiled-in machines advertised through the `Padding=2`
//! subprotocol: they disguise the distinctive cell patterns of
//! onion-service circuit setup as ordinary general-purpose circuits.
//! A client-side and a relay-side machine are installed as a matching
//! pair on the middle hop of introduction and rendezvous circuits.
//!
//! Hosts that want these machines call [`register_default_machines`]
//! once at startup; nothing here is loaded from configuration.

use tor_units::Percentage;

use crate::conditions::{CircPurposeMask, CircStateMask, PadConditions};
use crate::dist::{DelayDist, IatDist, LengthDist};
use crate::err::SpecError;
use crate::event::PadEvent;
use crate::machine::{PadMachineSpec, PadStateSpec, Side, Target};
use crate::registry::MachineRegistry;
use crate::HopNum;

/// The machine number shared by the circuit-setup hiding machines.
///
/// Matches the `Padding` subprotocol version that advertises them.
pub const CIRC_SETUP_MACHINE_NUM: u8 = 2;

/// An introduction or rendezvous circuit never needs more padding than
/// this to blend in with general circuits.
const CIRC_SETUP_MAX_PADDING: u32 = 10;

/// The hop the circuit-setup machines pad with: the middle relay.
fn middle_hop() -> HopNum {
    1.into()
}

/// Inter-arrival distribution for the setup machines.
///
/// Short uniform delays: the cover traffic has to land while the
/// distinguishing setup exchange is still in flight.
fn setup_iat() -> Result<IatDist, SpecError> {
    IatDist::new(DelayDist::uniform(500.0, 10_000.0)?, 100_000, 0)
}

/// The single padding state shared by both sides: pad a sampled number
/// of cells at the setup cadence, then end.
fn setup_state(low: f64, high: f64) -> Result<PadStateSpec, SpecError> {
    Ok(PadStateSpec::from_dist(setup_iat()?)
        .length_dist(LengthDist::new(
            DelayDist::uniform(low, high)?,
            u64::from(CIRC_SETUP_MAX_PADDING),
        ))
        .on(PadEvent::LengthCount, Target::End)
        .use_rtt_estimate())
}

/// The client-side circuit-setup hiding machine.
///
/// Runs on opened introduction and rendezvous circuits, and pads them
/// up to the cell count of an ordinary general circuit.
pub fn client_circ_setup_machine() -> Result<PadMachineSpec, SpecError> {
    Ok(PadMachineSpec::new(
        "client-circ-setup",
        CIRC_SETUP_MACHINE_NUM,
        Side::Origin,
        middle_hop(),
    )
    .conditions(
        PadConditions::always()
            .min_hops(2)
            .state_mask(CircStateMask::OPENED)
            .purpose_mask(
                CircPurposeMask::HS_CLIENT_INTRO
                    | CircPurposeMask::HS_CLIENT_REND
                    | CircPurposeMask::HS_SERVICE_INTRO
                    | CircPurposeMask::HS_SERVICE_REND,
            ),
    )
    .required_padding_subver(CIRC_SETUP_MACHINE_NUM)
    .overhead_cap(CIRC_SETUP_MAX_PADDING, Percentage::new(50))
    .state(setup_state(4.0, 9.0)?))
}

/// The relay-side mate of [`client_circ_setup_machine`].
///
/// Installed by the middle relay in response to the client's
/// `NEGOTIATE`; pads toward the origin so the inbound cell count
/// matches too.
pub fn relay_circ_setup_machine() -> Result<PadMachineSpec, SpecError> {
    Ok(PadMachineSpec::new(
        "relay-circ-setup",
        CIRC_SETUP_MACHINE_NUM,
        Side::Relay,
        middle_hop(),
    )
    .conditions(PadConditions::always().state_mask(CircStateMask::OPENED))
    .overhead_cap(CIRC_SETUP_MAX_PADDING, Percentage::new(50))
    .state(setup_state(3.0, 7.0)?))
}

/// Register every built-in machine.
pub fn register_default_machines(registry: &mut MachineRegistry) -> Result<(), SpecError> {
    registry.register(client_circ_setup_machine()?)?;
    registry.register(relay_circ_setup_machine()?)?;
    Ok(())
}
