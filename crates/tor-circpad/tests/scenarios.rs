//! End-to-end scenarios for the circuit padding engine, driven through
//! the public controller API with explicit times and a seeded RNG.

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

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rand_core::RngCore;
use tor_basic_utils::test_rng::testing_rng;
use tor_units::Percentage;

use tor_circpad::negotiate::{PadNegotiateCmd, PadResponse, PaddingNegotiated};
use tor_circpad::{
    CircPadControl, CircPurpose, CircStateMask, CircuitSnapshot, DelayDist, HistogramSpec,
    HopSnapshot, IatDist, LengthDist, MachineRegistry, PadConditions, PadEvent, PadMachineSpec,
    PadStateSpec, PaddingAccounting, PaddingAction, PaddingConfig, OverheadLimits, Side, Target,
    TokenRemoval,
};

fn rng() -> Box<dyn RngCore + Send> {
    Box::new(testing_rng())
}

fn exact_usec(usec: f64) -> IatDist {
    IatDist::new(DelayDist::uniform(usec, usec).unwrap(), 1_000_000, 0).unwrap()
}

fn registry(machines: Vec<PadMachineSpec>) -> Arc<MachineRegistry> {
    let mut reg = MachineRegistry::new();
    for m in machines {
        reg.register(m).unwrap();
    }
    Arc::new(reg)
}

fn origin_controller(machines: Vec<PadMachineSpec>) -> CircPadControl {
    CircPadControl::new(
        Side::Origin,
        registry(machines),
        PaddingAccounting::default(),
        Arc::new(PaddingConfig::default()),
        rng(),
    )
}

fn three_hop() -> CircuitSnapshot {
    CircuitSnapshot::new(CircPurpose::General)
        .hop(HopSnapshot::new())
        .hop(HopSnapshot::new())
        .hop(HopSnapshot::new())
        .opened()
}

fn padding_cells(actions: &[PaddingAction]) -> usize {
    actions
        .iter()
        .filter(|a| matches!(a, PaddingAction::SendPadding { .. }))
        .count()
}

fn stops(actions: &[PaddingAction]) -> usize {
    actions
        .iter()
        .filter(|a| {
            matches!(a, PaddingAction::SendNegotiate { msg, .. }
                if msg.command() == PadNegotiateCmd::STOP)
        })
        .count()
}

/// S1: a two-state "ping" machine pads exactly once, 5 ms after install,
/// then shuts down.
#[test]
fn s1_single_cell_ping() {
    let machine = PadMachineSpec::new("ping", 1_u8, Side::Origin, 1.into())
        .state(PadStateSpec::from_dist(exact_usec(5000.0)).on(PadEvent::PaddingSent, Target::End));
    let mut ctl = origin_controller(vec![machine]);
    let t0 = Instant::now();

    let actions = ctl.circ_built(&three_hop(), t0);
    assert_eq!(padding_cells(&actions), 0);
    assert_eq!(ctl.active_machines(), vec![1.into()]);

    let t1 = ctl.next_wakeup().unwrap();
    assert_eq!(t1 - t0, Duration::from_micros(5000));

    let actions = ctl.timers_fired(t1);
    assert_eq!(padding_cells(&actions), 1);
    assert!(actions
        .iter()
        .any(|a| matches!(a, PaddingAction::SendPadding { hop } if *hop == 1.into())));
    // The machine reached END: its runtime is gone and STOP went out.
    assert_eq!(stops(&actions), 1);
    assert!(ctl.active_machines().is_empty());
}

/// S2: a three-cell burst at 1 ms intervals, ended by LENGTH_COUNT.
#[test]
fn s2_burst_of_three() {
    let machine = PadMachineSpec::new("burst", 1_u8, Side::Origin, 1.into()).state(
        PadStateSpec::from_dist(exact_usec(1000.0))
            .length_dist(LengthDist::new(DelayDist::uniform(3.0, 3.0).unwrap(), 100))
            .on(PadEvent::LengthCount, Target::End),
    );
    let mut ctl = origin_controller(vec![machine]);
    let t0 = Instant::now();
    ctl.circ_built(&three_hop(), t0);

    let mut emitted = 0;
    for i in 1..=3 {
        let t = ctl.next_wakeup().unwrap();
        assert_eq!(t - t0, Duration::from_micros(1000 * i));
        emitted += padding_cells(&ctl.timers_fired(t));
    }
    assert_eq!(emitted, 3);
    assert!(ctl.active_machines().is_empty());
    // The STOP handshake is still outstanding: the next wakeup is its
    // 30-second grace deadline.
    assert!(ctl.holds_spec(1.into()));
    assert_eq!(
        ctl.next_wakeup().unwrap() - t0,
        Duration::from_micros(3000) + Duration::from_secs(30)
    );
}

/// S3: exact token removal under mixed traffic; BINS_EMPTY ends the
/// machine after the tokens run out.
#[test]
fn s3_token_removal_with_traffic() {
    let histogram = HistogramSpec::from_edges(vec![0, 2000, 4000], vec![2, 2, 0]).unwrap();
    let machine = PadMachineSpec::new("tokens", 1_u8, Side::Origin, 1.into()).state(
        PadStateSpec::from_histogram(histogram)
            .token_removal(TokenRemoval::Exact)
            .on(PadEvent::BinsEmpty, Target::End),
    );
    let mut ctl = origin_controller(vec![machine]);
    let t0 = Instant::now();
    ctl.circ_built(&three_hop(), t0);

    // A non-padding send 500 usec in burns one bin-0 token.
    ctl.nonpadding_sent(t0 + Duration::from_micros(500));

    // The remaining three tokens pay for exactly three padding cells;
    // then the histogram is empty and the machine shuts down.
    let mut emitted = 0;
    let mut guard = 0;
    while let Some(t) = ctl.next_wakeup() {
        emitted += padding_cells(&ctl.timers_fired(t));
        guard += 1;
        assert!(guard < 10, "machine failed to exhaust its tokens");
    }
    assert_eq!(emitted, 3);
    assert!(ctl.active_machines().is_empty());
}

/// S4: a conditions failure mid-flight sends STOP, tears the runtime
/// down at once, and retains the spec reference until NEGOTIATED.
#[test]
fn s4_conditions_failure() {
    let machine = PadMachineSpec::new("streams", 1_u8, Side::Origin, 1.into())
        .conditions(
            PadConditions::always()
                .min_hops(3)
                .state_mask(CircStateMask::HAS_STREAMS),
        )
        .state(PadStateSpec::from_dist(exact_usec(1000.0)));
    let mut ctl = origin_controller(vec![machine]);
    let t0 = Instant::now();

    ctl.circ_streams_attached(&three_hop().streams(true), t0);
    assert_eq!(ctl.active_machines(), vec![1.into()]);

    let actions = ctl.circ_streams_detached(&three_hop().streams(false), t0);
    let stop = actions
        .iter()
        .find_map(|a| match a {
            PaddingAction::SendNegotiate { msg, .. }
                if msg.command() == PadNegotiateCmd::STOP =>
            {
                Some(msg.clone())
            }
            _ => None,
        })
        .expect("no STOP message");
    assert!(ctl.active_machines().is_empty());
    assert!(ctl.holds_spec(1.into()));

    let reply = PaddingNegotiated::reply_to(&stop, PadResponse::SUCCESS);
    ctl.handle_negotiated(&reply, t0).unwrap();
    assert!(!ctl.holds_spec(1.into()));
}

/// S5: rapid replacement; the stale NEGOTIATED for the old machine is
/// dropped on the counter mismatch and the new machine is unaffected.
#[test]
fn s5_rapid_replacement() {
    let machine_a = PadMachineSpec::new("a", 1_u8, Side::Origin, 1.into())
        .conditions(PadConditions::always().state_mask(CircStateMask::HAS_STREAMS))
        .state(PadStateSpec::from_dist(exact_usec(1000.0)));
    let machine_b = PadMachineSpec::new("b", 2_u8, Side::Origin, 1.into())
        .conditions(PadConditions::always().state_mask(CircStateMask::NO_STREAMS))
        .state(PadStateSpec::from_dist(exact_usec(1000.0)));
    let mut ctl = origin_controller(vec![machine_b, machine_a]);
    let t0 = Instant::now();

    ctl.circ_streams_attached(&three_hop().streams(true), t0);
    assert_eq!(ctl.active_machines(), vec![1.into()]);

    // One lifecycle event: STOP(a) and START(b) in the same pass.
    let actions = ctl.circ_streams_detached(&three_hop().streams(false), t0);
    let msgs: Vec<_> = actions
        .iter()
        .filter_map(|a| match a {
            PaddingAction::SendNegotiate { msg, .. } => Some(msg.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].command(), PadNegotiateCmd::STOP);
    assert_eq!(msgs[1].command(), PadNegotiateCmd::START);
    assert!(msgs[1].machine_ctr() > msgs[0].machine_ctr());

    // At most one runtime per slot, ever (P9).
    assert_eq!(ctl.active_machines(), vec![2.into()]);

    // The peer answers the old STOP: dropped on ctr mismatch.
    let stale = PaddingNegotiated::reply_to(&msgs[0], PadResponse::SUCCESS);
    ctl.handle_negotiated(&stale, t0).unwrap();
    assert_eq!(ctl.active_machines(), vec![2.into()]);

    // The peer answers the new START: ignored, we were already padding.
    let ok = PaddingNegotiated::reply_to(&msgs[1], PadResponse::SUCCESS);
    ctl.handle_negotiated(&ok, t0).unwrap();
    assert_eq!(ctl.active_machines(), vec![2.into()]);
    let t = ctl.next_wakeup().unwrap();
    assert_eq!(padding_cells(&ctl.timers_fired(t)), 1);
}

/// S6: the global overhead cap limits an aggressive machine to its
/// burst, then to the percentage of real traffic.
#[test]
fn s6_overhead_cap() {
    let accounting = PaddingAccounting::new(OverheadLimits::new(10, Percentage::new(5)));
    let config = PaddingConfig::builder()
        .override_allowed_burst(Some(10))
        .override_max_percent(Some(Percentage::new(5)))
        .build()
        .unwrap();
    let machine = PadMachineSpec::new("firehose", 1_u8, Side::Origin, 1.into())
        .state(PadStateSpec::from_dist(exact_usec(1.0)));
    let mut ctl = CircPadControl::new(
        Side::Origin,
        registry(vec![machine]),
        accounting.clone(),
        Arc::new(config),
        rng(),
    );
    let t0 = Instant::now();
    ctl.circ_built(&three_hop(), t0);

    // With no non-padding traffic, exactly the burst allowance escapes.
    let mut emitted = 0;
    for _ in 0..50 {
        let t = ctl.next_wakeup().unwrap();
        emitted += padding_cells(&ctl.timers_fired(t));
    }
    assert_eq!(emitted, 10);
    assert_eq!(accounting.counts(), (10, 10));

    // Two hundred real cells re-open the budget; padding resumes and
    // tracks the 5% cap.
    let mut now = ctl.next_wakeup().unwrap();
    for _ in 0..200 {
        ctl.nonpadding_sent(now);
    }
    for _ in 0..50 {
        now = ctl.next_wakeup().unwrap();
        let n = padding_cells(&ctl.timers_fired(now));
        emitted += n;
        let (p, t) = accounting.counts();
        if p >= 10 {
            // P5: beyond the burst, the ratio holds at every check.
            assert!(100 * p <= 5 * t + 100);
        }
    }
    assert!(emitted > 10);
}

/// A histogram whose only tokens are in the infinity bin never pads and
/// never raises BINS_EMPTY.
#[test]
fn boundary_all_infinity() {
    let histogram = HistogramSpec::from_edges(vec![0, 1000], vec![0, 4]).unwrap();
    let machine = PadMachineSpec::new("inf", 1_u8, Side::Origin, 1.into())
        .state(PadStateSpec::from_histogram(histogram).on(PadEvent::BinsEmpty, Target::End));
    let mut ctl = origin_controller(vec![machine]);
    ctl.circ_built(&three_hop(), Instant::now());

    // Installed, but idle: no timer, no shutdown.
    assert_eq!(ctl.active_machines(), vec![1.into()]);
    assert!(ctl.next_wakeup().is_none());
}

/// A zero-length budget raises LENGTH_COUNT on entry, before any
/// padding is emitted.
#[test]
fn boundary_zero_length_budget() {
    let machine = PadMachineSpec::new("zero", 1_u8, Side::Origin, 1.into()).state(
        PadStateSpec::from_dist(exact_usec(1000.0))
            .length_dist(LengthDist::new(DelayDist::uniform(0.0, 0.0).unwrap(), 10))
            .on(PadEvent::LengthCount, Target::End),
    );
    let accounting = PaddingAccounting::default();
    let mut ctl = CircPadControl::new(
        Side::Origin,
        registry(vec![machine]),
        accounting.clone(),
        Arc::new(PaddingConfig::default()),
        rng(),
    );
    let actions = ctl.circ_built(&three_hop(), Instant::now());
    assert_eq!(padding_cells(&actions), 0);
    // Installed and immediately ended: START then STOP, no padding.
    assert_eq!(stops(&actions), 1);
    assert_eq!(accounting.counts(), (0, 0));
}

/// P8: installing and immediately uninstalling a machine leaks nothing
/// into the process-global counters.
#[test]
fn p8_no_accounting_leak() {
    let accounting = PaddingAccounting::default();
    let machine = PadMachineSpec::new("brief", 1_u8, Side::Origin, 1.into())
        .conditions(PadConditions::always().state_mask(CircStateMask::HAS_STREAMS))
        .state(PadStateSpec::from_dist(exact_usec(5000.0)));
    let mut ctl = CircPadControl::new(
        Side::Origin,
        registry(vec![machine]),
        accounting.clone(),
        Arc::new(PaddingConfig::default()),
        rng(),
    );
    let t0 = Instant::now();
    ctl.circ_streams_attached(&three_hop().streams(true), t0);
    ctl.circ_streams_detached(&three_hop().streams(false), t0);
    // No cell was ever emitted in the window, so nothing was counted.
    assert_eq!(accounting.counts(), (0, 0));
}

/// Per-machine counters are visible while the machine runs, and only
/// ever increase (P4).
#[test]
fn counters_track_cells() {
    let machine = PadMachineSpec::new("counting", 1_u8, Side::Origin, 1.into())
        .state(PadStateSpec::from_dist(exact_usec(1000.0)));
    let mut ctl = origin_controller(vec![machine]);
    let t0 = Instant::now();
    ctl.circ_built(&three_hop(), t0);

    ctl.nonpadding_sent(t0);
    ctl.nonpadding_received(t0 + Duration::from_micros(200));
    ctl.padding_received(1.into(), t0 + Duration::from_micros(300))
        .unwrap();
    let t = ctl.next_wakeup().unwrap();
    ctl.timers_fired(t);

    let counts = ctl.machine_counts(1.into()).unwrap();
    assert_eq!(counts.nonpadding_sent, 1);
    assert_eq!(counts.nonpadding_recv, 1);
    assert_eq!(counts.padding_recv, 1);
    assert_eq!(counts.padding_sent, 1);
}

/// The built-in circuit-setup machines negotiate and pad a circuit from
/// both ends until their length budgets run out.
#[test]
fn builtin_machines_pad_both_ways() {
    use tor_circpad::machines;

    let mut origin_reg = MachineRegistry::new();
    machines::register_default_machines(&mut origin_reg).unwrap();
    let mut relay_reg = MachineRegistry::new();
    machines::register_default_machines(&mut relay_reg).unwrap();

    let mut origin = CircPadControl::new(
        Side::Origin,
        Arc::new(origin_reg),
        PaddingAccounting::default(),
        Arc::new(PaddingConfig::default()),
        rng(),
    );
    let mut relay = CircPadControl::new(
        Side::Relay,
        Arc::new(relay_reg),
        PaddingAccounting::default(),
        Arc::new(PaddingConfig::default()),
        rng(),
    );

    let t0 = Instant::now();
    let hs_circ = CircuitSnapshot::new(CircPurpose::HsClientRend)
        .hop(HopSnapshot::new())
        .hop(HopSnapshot::new().protocols("Padding=2".parse().unwrap()))
        .hop(HopSnapshot::new())
        .opened();

    // The origin installs optimistically and asks the middle hop to
    // start its mate.
    let actions = origin.circ_built(&hs_circ, t0);
    let start = actions
        .iter()
        .find_map(|a| match a {
            PaddingAction::SendNegotiate { msg, .. } => Some(msg.clone()),
            _ => None,
        })
        .expect("no START");
    assert_eq!(start.command(), PadNegotiateCmd::START);

    let replies = relay.handle_negotiate(&start, &hs_circ, t0);
    let reply = replies
        .iter()
        .find_map(|a| match a {
            PaddingAction::SendNegotiated { msg, .. } => Some(msg.clone()),
            _ => None,
        })
        .expect("no NEGOTIATED");
    assert_eq!(reply.response(), PadResponse::SUCCESS);
    origin.handle_negotiated(&reply, t0).unwrap();

    // Drive both engines until every budget is spent.  Each emitted
    // cell is delivered to the other side.
    let mut from_origin = 0;
    let mut from_relay = 0;
    for _ in 0..64 {
        let step = [origin.next_wakeup(), relay.next_wakeup()]
            .into_iter()
            .flatten()
            .min();
        let Some(now) = step else {
            break;
        };
        for a in origin.timers_fired(now) {
            if matches!(a, PaddingAction::SendPadding { .. }) {
                from_origin += 1;
                let _ = relay.padding_received(1.into(), now);
            }
        }
        for a in relay.timers_fired(now) {
            if matches!(a, PaddingAction::SendPadding { .. }) {
                from_relay += 1;
                let _ = origin.padding_received(1.into(), now);
            }
        }
    }

    // Both machines padded, and neither exceeded the setup budget.
    assert!((1..=10).contains(&from_origin));
    assert!((1..=10).contains(&from_relay));
    assert!(origin.active_machines().is_empty());
    assert!(relay.active_machines().is_empty());
}

/// The relay side of a full handshake: START installs, padding flows,
/// STOP tears down.
#[test]
fn relay_round_trip() {
    use tor_circpad::negotiate::{PadMachineKind, PaddingNegotiate};

    let machine = PadMachineSpec::new("relay-pad", 1_u8, Side::Relay, 1.into())
        .state(PadStateSpec::from_dist(exact_usec(2000.0)));
    let mut ctl = CircPadControl::new(
        Side::Relay,
        registry(vec![machine]),
        PaddingAccounting::default(),
        Arc::new(PaddingConfig::default()),
        rng(),
    );
    let t0 = Instant::now();
    let circ = three_hop();

    let req = PaddingNegotiate::start(PadMachineKind::RELAY, 1.into(), 1);
    let actions = ctl.handle_negotiate(&req, &circ, t0);
    assert!(matches!(
        &actions[0],
        PaddingAction::SendNegotiated { msg, .. } if msg.response() == PadResponse::SUCCESS
    ));

    let t = ctl.next_wakeup().unwrap();
    assert_eq!(t - t0, Duration::from_micros(2000));
    assert_eq!(padding_cells(&ctl.timers_fired(t)), 1);

    let req = PaddingNegotiate::stop(PadMachineKind::RELAY, 1.into(), 1);
    let actions = ctl.handle_negotiate(&req, &circ, t);
    assert!(matches!(
        &actions[0],
        PaddingAction::SendNegotiated { msg, .. } if msg.response() == PadResponse::SUCCESS
    ));
    assert!(ctl.active_machines().is_empty());
    assert!(ctl.next_wakeup().is_none());
}
