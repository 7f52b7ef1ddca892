//! Simulation runners: the built-in demo, file-driven runs and the
//! coordination benchmark.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::SimConfig;
use crate::dispatcher::Dispatcher;
use crate::error::SimError;
use crate::events::{EventCode, EventSink, MemorySink, TracingSink};
use crate::incident::{self, IncidentSource};
use crate::registry::UnitState;
use crate::transport::Address;
use crate::types::{FireEvent, Point, Severity, TaskId, UnitId};
use crate::unit::{Unit, UnitControl};
use crate::zones::{Zone, ZoneTable};

const DEMO_ZONES: &str = "\
Zone ID,Zone Start,Zone End
1,(0;0),(200;150)
2,(200;0),(400;150)
3,(0;150),(200;300)
";

const DEMO_INCIDENTS: &str = "\
Time,Zone ID,Event type,Severity,Fault
14:00:05,1,FIRE_DETECTED,Low,
14:00:10,2,FIRE_DETECTED,High,
14:00:15,3,DRONE_REQUEST,Moderate,
14:00:20,2,FIRE_DETECTED,High,NOZZLE_JAM
14:00:25,1,DRONE_REQUEST,Moderate,
";

const DEMO_UNITS: usize = 2;
const BENCH_ZONES: u64 = 4;

/// CPU user/system seconds consumed by this process so far.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    Some((seconds(usage.ru_utime), seconds(usage.ru_stime)))
}

#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub units: usize,
    /// Return faulted units to service automatically.
    pub recover_faults: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            units: DEMO_UNITS,
            recover_faults: true,
        }
    }
}

/// What happened during one simulation run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub units: usize,
    pub fires_total: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub faults: usize,
    pub refills: usize,
    pub agent_dropped: f64,
    pub distance: f64,
    pub completions_per_unit: BTreeMap<UnitId, usize>,
    /// Fires still queued when the dispatcher shut down.
    pub leftover: usize,
    pub elapsed: Duration,
}

impl RunReport {
    /// `key=value` lines under a title, stable for scripts.
    pub fn summary(&self, title: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{title}");
        let _ = writeln!(out, "units={} fires_total={}", self.units, self.fires_total);
        let _ = writeln!(out, "fires_confirmed={}", self.confirmed);
        let _ = writeln!(out, "fires_failed={}", self.failed);
        let _ = writeln!(out, "faults={}", self.faults);
        let _ = writeln!(out, "refills={}", self.refills);
        let _ = writeln!(out, "agent_dropped={:.0}", self.agent_dropped);
        let _ = writeln!(out, "distance_travelled={:.1}", self.distance);
        let _ = writeln!(out, "completions_per_unit={:?}", self.completions_per_unit);
        let _ = writeln!(out, "pending_left={}", self.leftover);
        let _ = writeln!(out, "elapsed_ms={}", self.elapsed.as_millis());
        out
    }

    pub fn throughput(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds > 0.0 {
            self.confirmed as f64 / seconds
        } else {
            0.0
        }
    }
}

fn recover_faulted(dispatcher: &Dispatcher, controls: &HashMap<UnitId, Address<UnitControl>>) {
    for summary in dispatcher.registry_snapshot() {
        if summary.state != UnitState::Faulted {
            continue;
        }
        if let Some(control) = controls.get(&summary.unit_id) {
            tracing::debug!(unit = summary.unit_id, "clearing fault");
            if let Err(err) = control.send(UnitControl::ClearFault) {
                tracing::warn!(unit = summary.unit_id, error = %err, "could not clear fault");
            }
        }
    }
}

/// Start a dispatcher and `options.units` units, report every fire and
/// wait until each is confirmed out or has failed.
pub fn simulate(
    config: &SimConfig,
    zones: Arc<ZoneTable>,
    fires: Vec<FireEvent>,
    options: &RunOptions,
) -> Result<RunReport, SimError> {
    if options.units == 0 {
        return Err(SimError::NoUnits);
    }
    let memory = Arc::new(MemorySink::new());
    let sink: Arc<dyn EventSink> = Arc::new((TracingSink, Arc::clone(&memory)));
    let dispatcher = Dispatcher::start(config, Arc::clone(&zones), Arc::clone(&sink))?;

    let mut controls = HashMap::new();
    let mut handles = Vec::with_capacity(options.units);
    for id in 1..=options.units as UnitId {
        let unit = Unit::new(
            id,
            config,
            Arc::clone(&zones),
            dispatcher.client(),
            Arc::clone(&sink),
        );
        controls.insert(id, unit.control_address());
        handles.push(unit.spawn()?);
    }

    let fires_total = fires.len();
    let start = Instant::now();
    let source = IncidentSource::new(dispatcher.client(), Arc::clone(&sink));
    let runner = thread::Builder::new()
        .name("incident-source".to_string())
        .spawn(move || source.run_all(fires))?;
    while !runner.is_finished() {
        if options.recover_faults {
            recover_faulted(&dispatcher, &controls);
        }
        thread::sleep(config.poll_interval());
    }
    let outcomes = runner
        .join()
        .map_err(|_| SimError::Panicked("incident-source"))?;
    let elapsed = start.elapsed();

    for handle in &handles {
        if let Err(err) = handle.shutdown() {
            tracing::debug!(unit = handle.id(), error = %err, "unit already stopped");
        }
    }
    for handle in handles {
        let id = handle.id();
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(
                unit = id,
                kind = err.as_label(),
                error = %err,
                "unit ended with error"
            ),
            Err(_) => tracing::error!(unit = id, "unit thread panicked"),
        }
    }
    let leftover = dispatcher.shutdown().len();

    let mut completions_per_unit: BTreeMap<UnitId, usize> =
        (1..=options.units as UnitId).map(|id| (id, 0)).collect();
    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(record) => *completions_per_unit.entry(record.unit_id).or_default() += 1,
            Err(_) => failed += 1,
        }
    }
    let report = RunReport {
        units: options.units,
        fires_total,
        confirmed: outcomes.len() - failed,
        failed,
        faults: memory.count(EventCode::UnitFaulted),
        refills: memory.count(EventCode::UnitRefilled),
        agent_dropped: memory.total(EventCode::AgentDropped),
        distance: memory.total(EventCode::UnitTravel),
        completions_per_unit,
        leftover,
        elapsed,
    };
    tracing::info!(
        confirmed = report.confirmed,
        failed = report.failed,
        faults = report.faults,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "run finished"
    );
    Ok(report)
}

fn demo_config() -> SimConfig {
    SimConfig {
        time_scale: 0.001,
        poll_interval_ms: 20,
        ..SimConfig::default()
    }
}

/// Built-in scenario: three zones, five fires (one with a unit fault),
/// two units.
pub fn run_demo() -> Result<RunReport, SimError> {
    let zones = Arc::new(ZoneTable::parse(DEMO_ZONES)?);
    let fires = incident::parse_incidents(DEMO_INCIDENTS)?;
    tracing::info!(zones = zones.len(), fires = fires.len(), "demo start");
    simulate(&demo_config(), zones, fires, &RunOptions::default())
}

/// Run the zone and incident files through a fresh fleet.
pub fn run_files(
    config: &SimConfig,
    zones_path: &Path,
    incidents_path: &Path,
    options: &RunOptions,
) -> Result<RunReport, SimError> {
    let zones = Arc::new(ZoneTable::load_from_file(zones_path)?);
    let fires = incident::load_incidents(incidents_path)?;
    tracing::info!(
        zones = zones.len(),
        fires = fires.len(),
        units = options.units,
        "loaded inputs"
    );
    simulate(config, zones, fires, options)
}

/// `count` fires spread over the bench zones; every `fault_every`-th one
/// (1-based) carries the fault marker. Zero disables faults.
fn bench_fires(count: usize, fault_every: usize) -> Vec<FireEvent> {
    const SEVERITIES: [Severity; 3] = [Severity::High, Severity::Moderate, Severity::Low];
    (0..count)
        .map(|index| {
            let id = index as TaskId + 1;
            let zone = index as u64 % BENCH_ZONES + 1;
            let fault = fault_every > 0 && (index + 1) % fault_every == 0;
            FireEvent::new(id, format!("bench-{id}"), zone, "FIRE_DETECTED", SEVERITIES[index % 3])
                .with_fault(fault)
        })
        .collect()
}

fn bench_zones() -> Result<ZoneTable, SimError> {
    let zones = (0..BENCH_ZONES).map(|index| {
        let x = index as f64 * 100.0;
        Zone::new(index + 1, Point::new(x, 0.0), Point::new(x + 100.0, 100.0))
    });
    Ok(ZoneTable::from_zones(zones)?)
}

/// Measure coordination overhead with travel time disabled and print one
/// CSV row (with header) on stdout.
pub fn run_benchmark(units: usize, incidents: usize, fault_every: usize) -> Result<RunReport, SimError> {
    let config = SimConfig {
        time_scale: 0.0,
        poll_interval_ms: 5,
        ..SimConfig::default()
    };
    let zones = Arc::new(bench_zones()?);
    let fires = bench_fires(incidents, fault_every);
    let options = RunOptions {
        units,
        recover_faults: true,
    };

    let cpu_start = cpu_times_seconds();
    let report = simulate(&config, zones, fires, &options)?;
    let (cpu_user, cpu_sys) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => (
            format!("{:.4}", user_end - user_start),
            format!("{:.4}", sys_end - sys_start),
        ),
        _ => ("NA".to_string(), "NA".to_string()),
    };

    println!(
        "units,incidents,fault_every,confirmed,failed,faults,elapsed_ms,throughput_fires_per_s,cpu_user_s,cpu_sys_s,pending_left"
    );
    println!(
        "{},{},{},{},{},{},{:.2},{:.2},{},{},{}",
        report.units,
        report.fires_total,
        fault_every,
        report.confirmed,
        report.failed,
        report.faults,
        report.elapsed.as_secs_f64() * 1000.0,
        report.throughput(),
        cpu_user,
        cpu_sys,
        report.leftover
    );
    if report.leftover > 0 {
        eprintln!("# warning,pending_left,{}", report.leftover);
    }
    Ok(report)
}
