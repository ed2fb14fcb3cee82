//! Sequencer behavior against a simulated bus: pulse counts, restart,
//! release and failure isolation.

use fluidics_core::{
    ApplyOverrides, Branch, FluidicsError, PumpDefaults, SharedBus, StepBook, StepDescriptor,
    Sequencer,
};
use fluidics_hardware::{SimulatedBus, SimulatedSwitches};
use fluidics_traits::MonotonicClock;
use fluidics_traits::clock::test_clock::TestClock;
use std::time::{Duration, Instant};

fn book() -> StepBook {
    StepBook::new(vec![
        StepDescriptor::new("H2O->A")
            .with_pump(17, 6)
            .with_pulses(20)
            .with_period(0.5),
        StepDescriptor::new("long").with_pump(17, 4).with_pulses(1000).with_period(1.0),
        StepDescriptor::new("pair")
            .with_pump(17, 5)
            .with_pump(19, 4)
            .with_pulses(3),
        StepDescriptor::new("route")
            .with_valve(16, 7, Branch::B)
            .with_switch(21, true),
    ])
}

fn sequencer<C>(sim: &SimulatedBus, clock: C) -> Sequencer<C>
where
    C: fluidics_traits::Clock + Clone + Send + Sync + 'static,
{
    Sequencer::new(SharedBus::new(sim.clone()), book(), clock).with_timing(fluidics_core::BusTiming {
        settle: Duration::ZERO,
        write_settle: Duration::ZERO,
    })
}

/// Poll until the first write to `pin` shows up, so a run is known to be
/// pulsing before the next apply.
fn wait_for_first_pulse(sim: &SimulatedBus, address: u8, pin: u8) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while sim.pin_events(address, pin).is_empty() {
        assert!(Instant::now() < deadline, "no pulse on {address}/{pin}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn assert_strict_alternation(sim: &SimulatedBus, address: u8, pin: u8) -> usize {
    let ev = sim.pin_events(address, pin);
    assert_eq!(ev.len() % 2, 0, "{ev:?}");
    for pair in ev.chunks(2) {
        assert!(pair[0].high, "high/low never interleave across runs");
        assert!(!pair[1].high);
    }
    ev.iter().filter(|e| e.high).count()
}

#[test]
fn literal_step_pulses_pin_six_twenty_times() {
    let sim = SimulatedBus::with_motor_boards([16, 17]);
    let clock = TestClock::new();
    let seq = sequencer(&sim, clock.clone());

    let report = seq.apply_label("H2O->A", ApplyOverrides::default()).unwrap();
    let plan = report.plan.unwrap();
    assert_eq!(plan.pulses, 20);
    assert_eq!(plan.on, Duration::from_millis(50));
    assert_eq!(plan.off, Duration::from_millis(450));
    assert_eq!(report.pumps_started, 1);
    assert!(!report.restarted);

    seq.wait("H2O->A");
    assert!(!seq.is_running("H2O->A"));

    let ev = sim.pin_events(17, 6);
    assert_eq!(ev.len(), 40);
    assert_eq!(ev.iter().filter(|e| e.high).count(), 20);
    assert!(!ev.last().unwrap().high);
    assert_eq!(
        sim.writes().first(),
        Some(&(17, vec![0x95, 6, 1])),
        "first frame is a digital write high to pin 6"
    );
    assert_eq!(clock.elapsed(), Duration::from_millis(20 * 500));
}

#[test]
fn restart_stops_previous_run_before_new_pulses() {
    let sim = SimulatedBus::with_motor_boards([17]);
    let seq = sequencer(&sim, MonotonicClock::new());

    seq.apply_label("long", ApplyOverrides::default()).unwrap();
    wait_for_first_pulse(&sim, 17, 4);
    let report = seq
        .apply_label(
            "long",
            ApplyOverrides {
                pulses: Some(2),
                period_s: Some(0.2),
            },
        )
        .unwrap();
    assert!(report.restarted);
    assert!(report.preempted.is_empty());
    seq.wait("long");
    seq.shutdown();
    assert!(!seq.is_running("long"));

    // At least one pulse from the first run, then exactly two more.
    assert!(assert_strict_alternation(&sim, 17, 4) >= 3);
    assert_eq!(sim.level(17, 4), Some(false));
}

#[test]
fn step_sharing_a_pump_output_stops_the_other_label() {
    let sim = SimulatedBus::with_motor_boards([17]);
    let seq = sequencer(&sim, MonotonicClock::new());
    let share = StepDescriptor::new("share")
        .with_pump(17, 4)
        .with_pulses(2)
        .with_period(0.2);

    seq.apply_label("long", ApplyOverrides::default()).unwrap();
    wait_for_first_pulse(&sim, 17, 4);
    let report = seq.apply(&share, ApplyOverrides::default()).unwrap();
    assert_eq!(report.preempted, vec!["long".to_string()]);
    assert!(!report.restarted);
    assert!(!seq.is_running("long"));
    assert!(seq.is_running("share"));

    seq.wait("share");
    seq.shutdown();
    assert!(assert_strict_alternation(&sim, 17, 4) >= 3);
    assert_eq!(sim.level(17, 4), Some(false));
}

#[test]
fn steps_on_disjoint_outputs_run_side_by_side() {
    let sim = SimulatedBus::with_motor_boards([17, 19]);
    let seq = sequencer(&sim, MonotonicClock::new());

    seq.apply_label("long", ApplyOverrides::default()).unwrap();
    let report = seq
        .apply_label(
            "H2O->A",
            ApplyOverrides {
                pulses: Some(1),
                period_s: Some(0.2),
            },
        )
        .unwrap();
    assert!(report.preempted.is_empty());
    assert!(seq.is_running("long"));
    seq.wait("H2O->A");
    assert!(seq.is_running("long"));
    seq.shutdown();
    assert_eq!(sim.level(17, 4), Some(false));
    assert_eq!(sim.level(17, 6), Some(false));
}

#[test]
fn release_stops_and_deregisters() {
    let sim = SimulatedBus::with_motor_boards([17]);
    let seq = sequencer(&sim, MonotonicClock::new());
    seq.apply_label("long", ApplyOverrides::default()).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert!(seq.is_running("long"));
    let status = seq.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].label, "long");
    assert!(status[0].remaining() < 1000);

    assert!(seq.release("long"));
    assert!(!seq.is_running("long"));
    // Released trains are still joined on shutdown.
    seq.shutdown();
    assert_eq!(sim.level(17, 4), Some(false));
    let events = sim.pin_events(17, 4);
    assert!(events.last().is_some_and(|e| !e.high));
}

#[test]
fn release_of_idle_label_is_a_noop() {
    let sim = SimulatedBus::with_motor_boards([17]);
    let seq = sequencer(&sim, TestClock::new());
    assert!(!seq.release("never-started"));
    assert!(!seq.release("long"));
    assert!(sim.writes().is_empty());
}

#[test]
fn failing_pump_does_not_disturb_its_sibling() {
    // 19 is not on the bus.
    let sim = SimulatedBus::with_motor_boards([17]);
    let seq = sequencer(&sim, TestClock::new());
    let report = seq.apply_label("pair", ApplyOverrides::default()).unwrap();
    assert_eq!(report.pumps_started, 2);
    seq.wait("pair");
    assert!(!seq.is_running("pair"));
    assert_eq!(sim.pin_events(17, 5).len(), 6);

    // And the rest of the rig keeps working.
    seq.apply_label("H2O->A", ApplyOverrides::default()).unwrap();
    seq.wait("H2O->A");
    assert_eq!(sim.pin_events(17, 6).len(), 40);
}

#[test]
fn valves_and_switches_are_set_without_registering() {
    let sim = SimulatedBus::with_motor_boards([16, 17]);
    let switches = SimulatedSwitches::new();
    let seq = sequencer(&sim, TestClock::new()).with_switches(switches.clone());
    let report = seq.apply_label("route", ApplyOverrides::default()).unwrap();
    assert_eq!((report.valves_set, report.switches_set), (1, 1));
    assert_eq!(report.run_id, None);
    assert!(!seq.is_running("route"));
    assert_eq!(sim.level(16, 7), Some(true));
    assert_eq!(switches.level(21), Some(true));
}

#[test]
fn valve_failure_aborts_before_pumps_start() {
    let sim = SimulatedBus::with_motor_boards([17]);
    let seq = Sequencer::new(
        SharedBus::new(sim.clone()),
        StepBook::new(vec![
            StepDescriptor::new("x")
                .with_valve(30, 4, Branch::A)
                .with_pump(17, 5),
        ]),
        TestClock::new(),
    );
    let err = seq.apply_label("x", ApplyOverrides::default()).unwrap_err();
    assert!(matches!(err, FluidicsError::Command(_)));
    assert!(sim.pin_events(17, 5).is_empty());
}

#[test]
fn unknown_label_is_reported() {
    let sim = SimulatedBus::with_motor_boards([17]);
    let seq = sequencer(&sim, TestClock::new());
    match seq.apply_label("nope", ApplyOverrides::default()) {
        Err(FluidicsError::UnknownStep(l)) => assert_eq!(l, "nope"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn steps_without_pulse_hints_use_defaults() {
    let sim = SimulatedBus::with_motor_boards([17]);
    let seq = Sequencer::new(
        SharedBus::new(sim.clone()),
        StepBook::new(vec![StepDescriptor::new("plain").with_pump(17, 7)]),
        TestClock::new(),
    )
    .with_defaults(PumpDefaults {
        pulses: 4,
        period_s: 0.05,
        ..PumpDefaults::default()
    });
    let report = seq.apply_label("plain", ApplyOverrides::default()).unwrap();
    let plan = report.plan.unwrap();
    assert_eq!(plan.pulses, 4);
    // Period below the on phase: off floors at 150 ms.
    assert_eq!(plan.off, Duration::from_millis(150));
    seq.wait("plain");
    assert_eq!(sim.pin_events(17, 7).len(), 8);
}

#[test]
fn dropping_the_sequencer_leaves_outputs_low() {
    let sim = SimulatedBus::with_motor_boards([17]);
    {
        let seq = sequencer(&sim, MonotonicClock::new());
        seq.apply_label("long", ApplyOverrides::default()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(sim.level(17, 4), Some(false));
    let highs = sim.pin_events(17, 4).iter().filter(|e| e.high).count();
    assert_eq!(highs, 1);
}
