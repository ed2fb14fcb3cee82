//! Timed program schedule over a simulated 16-hour run.

use fluidics_core::{
    ApplyOverrides, Branch, FluidicsError, ProgramPlan, SharedBus, StepBook, StepDescriptor,
    StepRunner, Sequencer, TickOutcome, TimedProgram,
};
use fluidics_hardware::SimulatedBus;
use fluidics_traits::clock::test_clock::TestClock;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(u64, String)>>,
    clock: Option<TestClock>,
}

impl StepRunner for Recorder {
    fn run_step(&self, label: &str) -> Result<(), FluidicsError> {
        let t = self.clock.as_ref().map_or(0, |c| c.elapsed().as_secs());
        self.calls.lock().unwrap().push((t, label.to_string()));
        Ok(())
    }
}

#[test]
fn sixteen_hours_alternate_forward_and_reverse() {
    let clock = TestClock::new();
    let rec = Recorder {
        clock: Some(clock.clone()),
        ..Recorder::default()
    };
    let mut program = TimedProgram::new(ProgramPlan::default(), clock.clone());
    program.start();

    let mut finished_at = None;
    // One tick per simulated second up to 17 hours.
    for _ in 0..=(17 * 3600) {
        if program.tick(&rec) == TickOutcome::Finished {
            finished_at = Some(clock.elapsed().as_secs());
        }
        clock.advance(Duration::from_secs(1));
    }

    let calls = rec.calls.lock().unwrap();
    assert_eq!(calls.len(), 32);
    for (i, (t, label)) in calls.iter().enumerate() {
        let hour = (i / 2) as u64;
        if i % 2 == 0 {
            assert_eq!(*t, hour * 3600);
            assert_eq!(label, "A -> B");
        } else {
            assert_eq!(*t, hour * 3600 + 30 * 60);
            assert_eq!(label, "B -> A");
        }
    }
    // Stops at the top of hour 16 without applying anything there.
    assert_eq!(finished_at, Some(16 * 3600));
    assert!(!program.is_running());
    assert_eq!(program.state().branch, Branch::A);
}

#[test]
fn coarse_ticks_still_catch_each_boundary() {
    let clock = TestClock::new();
    let rec = Recorder::default();
    let mut program = TimedProgram::new(ProgramPlan::default(), clock.clone());
    program.start();
    // 20 s ticks: three ticks land inside each boundary minute.
    for _ in 0..(2 * 3600 / 20) {
        program.tick(&rec);
        clock.advance(Duration::from_secs(20));
    }
    let labels: Vec<String> = rec.calls.lock().unwrap().iter().map(|(_, l)| l.clone()).collect();
    assert_eq!(labels, ["A -> B", "B -> A", "A -> B", "B -> A"]);
}

#[test]
fn restarting_resets_branch_and_epoch() {
    let clock = TestClock::new();
    let rec = Recorder::default();
    let mut program = TimedProgram::new(ProgramPlan::default(), clock.clone());
    program.start();
    program.tick(&rec);
    clock.advance(Duration::from_secs(600));
    program.stop();
    assert_eq!(program.tick(&rec), TickOutcome::Idle);

    program.start();
    assert_eq!(program.state().branch, Branch::A);
    assert_eq!(program.elapsed_text().as_deref(), Some("00:00:00"));
    program.tick(&rec);
    assert_eq!(rec.calls.lock().unwrap().len(), 2);
}

#[test]
fn program_drives_valves_through_the_sequencer() {
    let sim = SimulatedBus::with_motor_boards([16]);
    let clock = TestClock::new();
    let seq = Sequencer::new(
        SharedBus::new(sim.clone()),
        StepBook::new(vec![
            StepDescriptor::new("A -> B").with_valve(16, 4, Branch::B),
            StepDescriptor::new("B -> A").with_valve(16, 4, Branch::A),
        ]),
        clock.clone(),
    );
    let mut program = TimedProgram::new(ProgramPlan::default(), clock.clone());
    program.start();

    program.tick(&seq);
    assert_eq!(sim.level(16, 4), Some(true));
    clock.advance(Duration::from_secs(30 * 60));
    program.tick(&seq);
    assert_eq!(sim.level(16, 4), Some(false));
    assert_eq!(sim.pin_events(16, 4).len(), 2);

    // A failing step is logged and the schedule carries on.
    sim.clear_log();
    let missing = Sequencer::new(SharedBus::new(SimulatedBus::new()), StepBook::default(), clock.clone());
    clock.advance(Duration::from_secs(30 * 60));
    assert!(matches!(program.tick(&missing), TickOutcome::Failed { .. }));
    assert!(program.is_running());
    assert!(missing.apply_label("A -> B", ApplyOverrides::default()).is_err());
}
