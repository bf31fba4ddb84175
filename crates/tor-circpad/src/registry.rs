//! The process-global catalog of padding machine specifications.

use std::sync::Arc;

use crate::err::SpecError;
use crate::machine::{MachineNum, PadMachineSpec, Side};

/// An immutable registry of padding machines.
///
/// Machines are registered once at startup and never change afterward.
/// Each side (origin, relay) has its own list; within a side, machine
/// numbers are unique.  When the activation controller looks for a
/// machine to install, it walks a side's list in *reverse* registration
/// order, so later-registered machines take precedence.
#[derive(Debug)]
pub struct MachineRegistry {
    /// Origin-side machines, in registration order.
    origin: Vec<Arc<PadMachineSpec>>,
    /// Relay-side machines, in registration order.
    relay: Vec<Arc<PadMachineSpec>>,
    /// Constant-time lookup: machine number to index in `origin`.
    origin_by_number: [Option<usize>; 256],
    /// Constant-time lookup: machine number to index in `relay`.
    relay_by_number: [Option<usize>; 256],
}

impl Default for MachineRegistry {
    fn default() -> Self {
        MachineRegistry {
            origin: Vec::new(),
            relay: Vec::new(),
            origin_by_number: [None; 256],
            relay_by_number: [None; 256],
        }
    }
}

impl MachineRegistry {
    /// Construct an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `machine` and append it to its side's list.
    ///
    /// Errors here are specification bugs and are fatal at startup.
    pub fn register(&mut self, machine: PadMachineSpec) -> Result<(), SpecError> {
        machine.check()?;
        let number = machine.number();
        let (list, index) = match machine.side() {
            Side::Origin => (&mut self.origin, &mut self.origin_by_number),
            Side::Relay => (&mut self.relay, &mut self.relay_by_number),
        };
        let slot = &mut index[usize::from(u8::from(number))];
        if slot.is_some() {
            return Err(SpecError::DuplicateMachine(number));
        }
        *slot = Some(list.len());
        list.push(Arc::new(machine));
        Ok(())
    }

    /// Look up a machine by side and number.
    pub fn lookup(&self, side: Side, number: MachineNum) -> Option<&Arc<PadMachineSpec>> {
        let (list, index) = match side {
            Side::Origin => (&self.origin, &self.origin_by_number),
            Side::Relay => (&self.relay, &self.relay_by_number),
        };
        index[usize::from(u8::from(number))].map(|i| &list[i])
    }

    /// Iterate over a side's machines in activation-precedence order
    /// (reverse registration order).
    pub fn candidates(&self, side: Side) -> impl Iterator<Item = &Arc<PadMachineSpec>> {
        let list = match side {
            Side::Origin => &self.origin,
            Side::Relay => &self.relay,
        };
        list.iter().rev()
    }

    /// The number of machines registered on a side.
    pub fn n_machines(&self, side: Side) -> usize {
        match side {
            Side::Origin => self.origin.len(),
            Side::Relay => self.relay.len(),
        }
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
    use crate::dist::{DelayDist, IatDist};
    use crate::machine::PadStateSpec;

    fn machine(name: &str, number: u8, side: Side) -> PadMachineSpec {
        let dist = IatDist::new(DelayDist::uniform(1000.0, 1000.0).unwrap(), 10_000, 0).unwrap();
        PadMachineSpec::new(name, number, side, 1.into()).state(PadStateSpec::from_dist(dist))
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = MachineRegistry::new();
        reg.register(machine("a", 1, Side::Origin)).unwrap();
        reg.register(machine("b", 2, Side::Origin)).unwrap();
        reg.register(machine("c", 1, Side::Relay)).unwrap();

        assert_eq!(reg.n_machines(Side::Origin), 2);
        assert_eq!(reg.n_machines(Side::Relay), 1);
        assert_eq!(reg.lookup(Side::Origin, 2.into()).unwrap().name(), "b");
        // The two sides' numbering spaces are independent.
        assert_eq!(reg.lookup(Side::Relay, 1.into()).unwrap().name(), "c");
        assert!(reg.lookup(Side::Relay, 2.into()).is_none());
    }

    #[test]
    fn duplicates_rejected() {
        let mut reg = MachineRegistry::new();
        reg.register(machine("a", 1, Side::Origin)).unwrap();
        assert!(matches!(
            reg.register(machine("a2", 1, Side::Origin)),
            Err(SpecError::DuplicateMachine(_))
        ));
    }

    #[test]
    fn reverse_precedence() {
        let mut reg = MachineRegistry::new();
        reg.register(machine("old", 1, Side::Origin)).unwrap();
        reg.register(machine("new", 2, Side::Origin)).unwrap();
        let names: Vec<_> = reg
            .candidates(Side::Origin)
            .map(|m| m.name().to_owned())
            .collect();
        assert_eq!(names, vec!["new", "old"]);
    }

    #[test]
    fn invalid_machine_rejected() {
        let mut reg = MachineRegistry::new();
        let empty = PadMachineSpec::new("empty", 9_u8, Side::Origin, 1.into());
        assert!(reg.register(empty).is_err());
        assert_eq!(reg.n_machines(Side::Origin), 0);
    }
}
