//! Subcommand handlers. Results go to stdout (text or one JSON object per
//! line); logs go to stderr.

use crate::cli::Commands;
use crate::rig::Rig;
use eyre::{WrapErr, bail, eyre};
use fluidics_config::Config;
use fluidics_core::conversions::resolve_output;
use fluidics_core::valve::set_valve;
use fluidics_core::{
    ApplyOverrides, ApplyReport, BoardInfo, Branch, ProgramPlan, ProgramRunner, StepBook,
    TimedProgram, board,
};
use fluidics_traits::MonotonicClock;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(20);
const PROGRESS_EVERY: Duration = Duration::from_secs(5);
const IDENTIFY_HOLD: Duration = Duration::from_millis(150);

fn emit(json: bool, value: &serde_json::Value, text: impl FnOnce() -> String) {
    if json {
        println!("{value}");
    } else {
        println!("{}", text());
    }
}

fn positive_secs(name: &str, secs: Option<f64>) -> eyre::Result<Option<Duration>> {
    match secs {
        None => Ok(None),
        Some(s) if s.is_finite() && s > 0.0 => Ok(Some(Duration::from_secs_f64(s))),
        Some(s) => bail!("{name} must be a positive number of seconds, got {s}"),
    }
}

pub fn run(cmd: &Commands, cfg: &Config, json: bool, interrupted: &Arc<AtomicBool>) -> eyre::Result<()> {
    match cmd {
        Commands::Steps => list_steps(cfg, json),
        Commands::Apply {
            label,
            pulses,
            period,
            release_after,
        } => apply(
            cfg,
            json,
            interrupted,
            label,
            ApplyOverrides {
                pulses: *pulses,
                period_s: *period,
            },
            positive_secs("--release-after", *release_after)?,
        ),
        Commands::Valve { letter, branch } => valve(cfg, json, letter, (*branch).into()),
        Commands::Program { max_secs } => {
            program(cfg, json, interrupted, positive_secs("--max-secs", *max_secs)?)
        }
        Commands::Info { address } => info(cfg, json, *address),
        Commands::InitBoard {
            address,
            new_address,
        } => init_board(cfg, json, *address, *new_address),
        Commands::Identify { address } => identify(cfg, json, *address),
        Commands::SelfCheck => self_check(cfg, json),
    }
}

fn list_steps(cfg: &Config, json: bool) -> eyre::Result<()> {
    let book = StepBook::try_from(cfg).wrap_err("build step table")?;
    for step in book.iter() {
        let value = json!({
            "label": step.label,
            "group": step.group,
            "pumps": step.pumps.len(),
            "valves": step.valves.len(),
            "switches": step.switches.len(),
            "pulses": step.pulse_count,
            "period_s": step.period_s,
        });
        emit(json, &value, || {
            let group = step.group.as_deref().unwrap_or("-");
            format!(
                "{:<24} {:<12} pumps={} valves={} switches={}",
                step.label,
                group,
                step.pumps.len(),
                step.valves.len(),
                step.switches.len()
            )
        });
    }
    Ok(())
}

fn report_json(report: &ApplyReport, released: bool, elapsed: Duration) -> serde_json::Value {
    json!({
        "label": report.label,
        "run_id": report.run_id,
        "valves": report.valves_set,
        "switches": report.switches_set,
        "pumps": report.pumps_started,
        "pulses": report.plan.map(|p| p.pulses),
        "on_ms": report.plan.map(|p| p.on.as_millis() as u64),
        "off_ms": report.plan.map(|p| p.off.as_millis() as u64),
        "restarted": report.restarted,
        "preempted": report.preempted,
        "released": released,
        "elapsed_ms": elapsed.as_millis() as u64,
    })
}

fn apply(
    cfg: &Config,
    json: bool,
    interrupted: &AtomicBool,
    label: &str,
    overrides: ApplyOverrides,
    release_after: Option<Duration>,
) -> eyre::Result<()> {
    if let Some(p) = overrides.period_s
        && !(p.is_finite() && p > 0.0)
    {
        bail!("--period must be a positive number of seconds, got {p}");
    }
    let seq = Rig::open(cfg)?.into_sequencer(cfg)?;
    let started = Instant::now();
    let report = seq.apply_label(label, overrides)?;

    let mut released = false;
    let mut last_progress = Instant::now();
    while seq.is_running(label) {
        let expired = release_after.is_some_and(|d| started.elapsed() >= d);
        if expired || interrupted.load(Ordering::Acquire) {
            released = seq.release(label);
            break;
        }
        if last_progress.elapsed() >= PROGRESS_EVERY {
            last_progress = Instant::now();
            for s in seq.status() {
                tracing::info!(label = %s.label, remaining = s.remaining(), "pumping");
            }
        }
        std::thread::sleep(POLL);
    }
    seq.shutdown();

    let value = report_json(&report, released, started.elapsed());
    emit(json, &value, || {
        let how = if released { "released" } else { "completed" };
        match report.plan {
            Some(plan) => format!(
                "{label}: {how} after {:.1}s ({} pump(s), {} pulses, on {} ms / off {} ms)",
                started.elapsed().as_secs_f64(),
                report.pumps_started,
                plan.pulses,
                plan.on.as_millis(),
                plan.off.as_millis()
            ),
            None => format!(
                "{label}: set {} valve(s) and {} switch(es)",
                report.valves_set, report.switches_set
            ),
        }
    });
    Ok(())
}

fn valve(cfg: &Config, json: bool, letter: &str, branch: Branch) -> eyre::Result<()> {
    let out = resolve_output(cfg, letter)?;
    let rig = Rig::open(cfg)?;
    set_valve(&rig.channel(out.address), out.pin, branch)?;
    let value = json!({
        "valve": letter,
        "address": out.address,
        "pin": out.pin,
        "branch": branch.to_string(),
    });
    emit(json, &value, || {
        format!("valve {letter} ({:#04x} pin {}) -> {branch}", out.address, out.pin)
    });
    Ok(())
}

fn program(
    cfg: &Config,
    json: bool,
    interrupted: &AtomicBool,
    max: Option<Duration>,
) -> eyre::Result<()> {
    let pcfg = cfg
        .program
        .as_ref()
        .ok_or_else(|| eyre!("config has no [program] section"))?;
    let seq = Arc::new(Rig::open(cfg)?.into_sequencer(cfg)?);
    let program = Arc::new(Mutex::new(TimedProgram::new(
        ProgramPlan::from(pcfg),
        MonotonicClock::new(),
    )));
    program
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .start();

    let started = Instant::now();
    let mut runner = ProgramRunner::spawn(
        Arc::clone(&program),
        Arc::clone(&seq),
        Duration::from_millis(pcfg.tick_ms),
    );
    let finished = loop {
        if runner.wait_finished(POLL) {
            break true;
        }
        if interrupted.load(Ordering::Acquire) || max.is_some_and(|d| started.elapsed() >= d) {
            break false;
        }
    };
    runner.shutdown();
    let elapsed = {
        let mut p = program.lock().unwrap_or_else(PoisonError::into_inner);
        let text = p.elapsed_text();
        p.stop();
        text
    };
    seq.shutdown();

    let state = if finished { "finished" } else { "stopped" };
    let value = json!({
        "program": state,
        "elapsed": elapsed,
        "elapsed_ms": started.elapsed().as_millis() as u64,
    });
    emit(json, &value, || match &elapsed {
        Some(e) => format!("program {state} at {e}"),
        None => format!("program {state}"),
    });
    Ok(())
}

fn info_json(info: &BoardInfo) -> serde_json::Value {
    json!({
        "address": info.address,
        "protocol": format!("{} {}", info.protocol_name, info.protocol_version),
        "device": info.device_name,
        "manufacturer": info.manufacturer,
        "hardware_version": info.hardware_version,
        "software_version": info.software_version,
        "url": info.url,
        "config": {
            "version": info.config.version(),
            "i2c_address": info.config.i2c_address,
            "uuid": info.config.uuid_hex(),
            "pin_modes": info.config.pin_modes,
            "pin_states": info.config.pin_states,
        },
    })
}

fn info(cfg: &Config, json: bool, address: u8) -> eyre::Result<()> {
    let rig = Rig::open(cfg)?;
    let info = board::read_info(&rig.channel(address))?;
    emit(json, &info_json(&info), || {
        format!(
            "address:      {:#04x}\nprotocol:     {} {}\ndevice:       {}\nmanufacturer: {}\nhardware:     {}\nsoftware:     {}\nurl:          {}\nconfig:       v{} addr {:#04x} uuid {}",
            info.address,
            info.protocol_name,
            info.protocol_version,
            info.device_name,
            info.manufacturer,
            info.hardware_version,
            info.software_version,
            info.url,
            info.config.version(),
            info.config.i2c_address,
            info.config.uuid_hex()
        )
    });
    Ok(())
}

fn init_board(cfg: &Config, json: bool, address: u8, new_address: Option<u8>) -> eyre::Result<()> {
    let rig = Rig::open(cfg)?;
    let record = board::initialize(
        &rig.channel(address),
        new_address,
        &MonotonicClock::new(),
        rig.timing.write_settle,
    )?;
    let value = json!({
        "address": address,
        "configured_address": record.i2c_address,
        "pin_modes": record.pin_modes,
        "pin_states": record.pin_states,
    });
    emit(json, &value, || {
        format!(
            "board {address:#04x} initialized (now at {:#04x})",
            record.i2c_address
        )
    });
    Ok(())
}

fn identify(cfg: &Config, json: bool, address: u8) -> eyre::Result<()> {
    let rig = Rig::open(cfg)?;
    board::identify(&rig.channel(address), &MonotonicClock::new(), IDENTIFY_HOLD)?;
    emit(json, &json!({ "identified": address }), || {
        format!("board {address:#04x} identified")
    });
    Ok(())
}

fn self_check(cfg: &Config, json: bool) -> eyre::Result<()> {
    let rig = Rig::open(cfg)?;
    let mut failed = 0usize;
    for address in cfg.bus_addresses() {
        let (ok, detail) = match rig.channel(address).device_name() {
            Ok(name) => (true, name),
            Err(e) => {
                failed += 1;
                tracing::error!(address, error = %e, "board did not answer");
                (false, e.to_string())
            }
        };
        let value = json!({ "address": address, "ok": ok, "detail": detail });
        emit(json, &value, || {
            format!("{address:#04x} {} {detail}", if ok { "ok  " } else { "FAIL" })
        });
    }
    if failed > 0 {
        bail!("self-check failed: {failed} board(s) did not answer");
    }
    Ok(())
}
