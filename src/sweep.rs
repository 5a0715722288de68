use crate::autorange::{self, Outcome, RangeSearchConfig};
use crate::error::MeasureError;
use crate::instruments::{ApproachMode, LockinAmplifier, LockinChannel, LockinRangeChannel};
use crate::session::{InstrumentRole, SessionSet};
use crate::telemetry::{ChannelSample, MeasurementMode, TelemetryStore};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Hard cap on generated sweep points, matching the reference setup.
const MAX_SWEEP_POINTS: usize = 20_000;

/// The immutable plan for one run: which amplitudes to drive, at which
/// temperature setpoints, how long to dwell per point, and how often to
/// recalibrate the detectors.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub amplitude_points: Vec<f64>,
    /// Empty when temperature control is disabled.
    pub temperature_points: Vec<f64>,
    pub wait_per_point: Duration,
    /// Recalibration runs on the first point of every block of this many
    /// points.
    pub recalibration_period: usize,
}

impl SweepPlan {
    pub fn new(
        amplitude_points: Vec<f64>,
        temperature_points: Vec<f64>,
        wait_per_point: Duration,
        recalibration_period: usize,
    ) -> Result<Self, MeasureError> {
        if recalibration_period == 0 {
            return Err(MeasureError::InvalidSweep(
                "recalibration period must be at least 1".into(),
            ));
        }
        Ok(Self {
            amplitude_points,
            temperature_points,
            wait_per_point,
            recalibration_period,
        })
    }

    /// Evenly spaced amplitudes from `start` towards `stop` in steps of
    /// `step`. The step sign must point from start to stop.
    pub fn linear_amplitudes(start: f64, stop: f64, step: f64) -> Result<Vec<f64>, MeasureError> {
        if step == 0.0 {
            return Err(MeasureError::InvalidSweep("linear step cannot be 0".into()));
        }
        if step > 0.0 && start > stop {
            return Err(MeasureError::InvalidSweep(
                "linear step is positive but start > stop".into(),
            ));
        }
        if step < 0.0 && start < stop {
            return Err(MeasureError::InvalidSweep(
                "linear step is negative but start < stop".into(),
            ));
        }

        // Points are generated as start + i * step; the tolerance absorbs the
        // rounding of the multiply so the endpoint is never dropped.
        let tolerance = step.abs() * 1e-6;
        let mut points = Vec::new();
        loop {
            let value = start + points.len() as f64 * step;
            if (step > 0.0 && value > stop + tolerance)
                || (step < 0.0 && value < stop - tolerance)
            {
                break;
            }
            points.push(value);
            if points.len() >= MAX_SWEEP_POINTS {
                return Err(MeasureError::InvalidSweep(
                    "too many sweep points (linear)".into(),
                ));
            }
        }
        Ok(points)
    }

    /// Logarithmically spaced amplitudes, descending from `i_max` to `i_min`
    /// with the given points per decade.
    pub fn log_amplitudes(
        i_min: f64,
        i_max: f64,
        points_per_decade: usize,
    ) -> Result<Vec<f64>, MeasureError> {
        if i_min <= 0.0 || i_max <= 0.0 {
            return Err(MeasureError::InvalidSweep(
                "log sweep requires positive bounds".into(),
            ));
        }
        if i_min >= i_max {
            return Err(MeasureError::InvalidSweep(
                "log sweep requires i_min < i_max".into(),
            ));
        }
        if points_per_decade == 0 || points_per_decade > 200 {
            return Err(MeasureError::InvalidSweep(
                "points per decade should be between 1 and 200".into(),
            ));
        }

        let decades = i_max.log10() - i_min.log10();
        // Guard against log10 rounding pushing an integer count over the
        // edge; a span narrower than a point still gets both endpoints.
        let count = (((decades * points_per_decade as f64) - 1e-9).ceil() as usize).max(1) + 1;
        if count > MAX_SWEEP_POINTS {
            return Err(MeasureError::InvalidSweep(
                "too many sweep points (log)".into(),
            ));
        }
        let (top, bottom) = (i_max.log10(), i_min.log10());
        let points = (0..count)
            .map(|i| {
                let fraction = i as f64 / (count - 1) as f64;
                10f64.powf(top + (bottom - top) * fraction)
            })
            .collect();
        Ok(points)
    }
}

/// Runtime knobs the orchestrator reads once at run start. Replaces the
/// process-wide mutable state of older rigs with an explicit value passed
/// into the constructor.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub frequency_hz: f64,
    /// Probe current stamped on samples in DC-biased modes; samples carry 0
    /// whenever the active mode does not use DC bias.
    pub dc_bias_amps: f64,
    /// Wait between programming the sine output and enabling it.
    pub ramp_delay: Duration,
    pub temperature_rate_k_per_min: f64,
    /// Settle window after commanding a temperature setpoint.
    pub temperature_settle: Duration,
    /// Settle after toggling automatic gain control.
    pub gain_settle: Duration,
    /// Settle between the recalibration phases.
    pub recalibration_settle: Duration,
    /// Settle after a harmonic switch for the 1f read-out.
    pub harmonic_switch_settle: Duration,
    pub range_search: RangeSearchConfig,
    /// Attempt budget for the re-range pass at the end of recalibration.
    pub rerange_attempts: u32,
    /// Read the 1f harmonic voltage for the resistance derivation.
    pub read_1f_for_resistance: bool,
    /// Harmonic the longitudinal lock-in returns to after a 1f read.
    pub restore_harmonic: u8,
    /// Snapshot directory; `None` disables per-point persistence.
    pub save_directory: Option<PathBuf>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            frequency_hz: 17.777,
            dc_bias_amps: 0.0,
            ramp_delay: Duration::from_secs(5),
            temperature_rate_k_per_min: 1.0,
            temperature_settle: Duration::from_secs(100),
            gain_settle: Duration::from_secs(10),
            recalibration_settle: Duration::from_secs(60),
            harmonic_switch_settle: Duration::from_secs(1),
            range_search: RangeSearchConfig::default(),
            rerange_attempts: 22,
            read_1f_for_resistance: false,
            restore_harmonic: 2,
            save_directory: None,
        }
    }
}

/// Run lifecycle. `Completed`, `Aborted` and `Faulted` are terminal: a new
/// run needs a fresh orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Aborted,
    Faulted,
}

/// Events for a display loop, drained on its own thread. Redraw
/// notifications travel separately through the telemetry store's coalesced
/// channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEvent {
    Status { temperature: f64, amplitude: f64 },
    TemperaturePointDone,
    Finished(RunState),
}

/// Fire-and-forget sender towards the display loop.
pub struct DisplayLink {
    tx: Option<Sender<DisplayEvent>>,
}

impl DisplayLink {
    pub fn channel() -> (Self, Receiver<DisplayEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// A link with no display attached; every event is dropped.
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    fn send(&self, event: DisplayEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Handle to a sweep running on its worker thread.
pub struct RunHandle {
    stop: Arc<AtomicBool>,
    worker: JoinHandle<RunState>,
}

impl RunHandle {
    /// Cooperative stop. The flag is polled at the top of the amplitude
    /// loop only, so cancellation latency is bounded by the longest
    /// uninterruptible wait in the loop body (the per-point dwell).
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn join(self) -> RunState {
        self.worker.join().unwrap_or(RunState::Faulted)
    }
}

/// The worker-thread control loop driving nested temperature/amplitude
/// sweeps: settles the excitation per point, recalibrates the detectors at a
/// fixed cadence, appends samples to the telemetry store and persists
/// best-effort snapshots.
///
/// All instrument I/O happens sequentially on the thread calling [`start`];
/// the underlying buses are not safe for concurrent use.
///
/// [`start`]: SweepOrchestrator::start
pub struct SweepOrchestrator {
    plan: SweepPlan,
    ctx: RunContext,
    sessions: SessionSet,
    store: TelemetryStore,
    display: DisplayLink,
    stop: Arc<AtomicBool>,
    state: RunState,
}

impl SweepOrchestrator {
    pub fn new(
        plan: SweepPlan,
        ctx: RunContext,
        sessions: SessionSet,
        store: TelemetryStore,
        display: DisplayLink,
    ) -> Self {
        // The resistance derivation must follow the same option that makes
        // the loop record the 1f voltage in the first place.
        store.set_use_1f_for_resistance(ctx.read_1f_for_resistance);
        Self {
            plan,
            ctx,
            sessions,
            store,
            display,
            stop: Arc::new(AtomicBool::new(false)),
            state: RunState::Idle,
        }
    }

    /// Shared stop flag, e.g. for a Ctrl+C handler.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Run the sweep to a terminal state on the calling thread.
    ///
    /// Faults immediately when the mandatory excitation session is missing;
    /// every other per-point or per-channel failure is absorbed locally so a
    /// single bad reading never aborts a multi-hour sweep.
    pub fn start(&mut self) -> RunState {
        if self.state != RunState::Idle {
            return self.state;
        }
        if self.sessions.excitation.is_none() {
            warn!(
                "cannot start: {} session missing",
                InstrumentRole::Excitation
            );
            self.state = RunState::Faulted;
            self.display.send(DisplayEvent::Finished(self.state));
            return self.state;
        }

        self.state = RunState::Running;
        info!(
            "sweep started: {} amplitude points, {} temperature points, recalibration every {} points",
            self.plan.amplitude_points.len(),
            self.plan.temperature_points.len(),
            self.plan.recalibration_period
        );
        self.state = self.run_loop();
        info!("sweep finished: {:?}", self.state);
        self.display.send(DisplayEvent::Finished(self.state));
        self.state
    }

    /// Move the orchestrator onto a dedicated worker thread.
    pub fn spawn(mut self) -> Result<RunHandle, MeasureError> {
        let stop = self.stop.clone();
        let worker = thread::Builder::new()
            .name("sweep-worker".into())
            .spawn(move || self.start())?;
        Ok(RunHandle { stop, worker })
    }

    fn run_loop(&mut self) -> RunState {
        let mode = self.store.mode();
        // A single synthetic iteration when temperature control is disabled.
        let temperature_points: Vec<Option<f64>> = if self.plan.temperature_points.is_empty() {
            vec![None]
        } else {
            self.plan.temperature_points.iter().copied().map(Some).collect()
        };

        let mut aborted = false;
        for target in temperature_points {
            if let Some(target) = target {
                self.go_to_temperature(target);
            }
            // Temperature and field are sampled once per block boundary and
            // stamped on every sample of the block; the cryostat is never
            // queried inside the amplitude loop.
            let (temperature, field) = self.read_environment();

            let mut point_counter = 0usize;
            for index in 0..self.plan.amplitude_points.len() {
                if self.stop.load(Ordering::SeqCst) {
                    info!("stop requested; aborting sweep");
                    aborted = true;
                    break;
                }
                let amplitude = self.plan.amplitude_points[index];

                if let Err(e) = self.drive_excitation(amplitude) {
                    warn!("excitation drive failed at {amplitude:.3e} A: {e}");
                }
                sleep(self.plan.wait_per_point);

                if point_counter % self.plan.recalibration_period == 0 {
                    self.recalibrate();
                }

                let sample = self.acquire_sample(mode, amplitude, temperature, field);
                self.store.append(sample);
                self.display.send(DisplayEvent::Status {
                    temperature,
                    amplitude,
                });
                self.persist_snapshot();

                point_counter += 1;
                if point_counter == self.plan.recalibration_period {
                    point_counter = 0;
                }
            }

            // Leave the hardware safe no matter how the loop ended.
            self.disable_excitation();
            self.display.send(DisplayEvent::TemperaturePointDone);
            if aborted {
                break;
            }
        }

        if aborted {
            RunState::Aborted
        } else {
            RunState::Completed
        }
    }

    fn go_to_temperature(&mut self, target: f64) {
        let rate = self.ctx.temperature_rate_k_per_min;
        let settle = self.ctx.temperature_settle;
        match self.sessions.cryostat.as_deref_mut() {
            Some(cryostat) => {
                info!("setting temperature to {target} K at {rate} K/min");
                if let Err(e) = cryostat.set_temperature(target, rate, ApproachMode::NoOvershoot) {
                    warn!("temperature command failed: {e}");
                }
                sleep(settle);
            }
            None => warn!("temperature point {target} K requested but no cryostat session"),
        }
    }

    fn read_environment(&mut self) -> (f64, f64) {
        let Some(cryostat) = self.sessions.cryostat.as_deref_mut() else {
            return (f64::NAN, f64::NAN);
        };
        let temperature = match cryostat.read_temperature() {
            Ok((value, _status)) => value,
            Err(e) => {
                warn!("temperature read failed: {e}");
                f64::NAN
            }
        };
        let field = match cryostat.read_field() {
            Ok((value, _status)) => value,
            Err(e) => {
                warn!("field read failed: {e}");
                f64::NAN
            }
        };
        (temperature, field)
    }

    fn drive_excitation(&mut self, amplitude: f64) -> Result<(), MeasureError> {
        let ramp_delay = self.ctx.ramp_delay;
        let frequency = self.ctx.frequency_hz;
        let source = self
            .sessions
            .excitation
            .as_deref_mut()
            .ok_or(MeasureError::MissingSession(InstrumentRole::Excitation))?;
        source.set_output(amplitude, frequency)?;
        sleep(ramp_delay);
        source.enable_output()
    }

    fn disable_excitation(&mut self) {
        if let Some(source) = self.sessions.excitation.as_deref_mut()
            && let Err(e) = source.disable_output()
        {
            warn!("failed to disable excitation output: {e}");
        }
    }

    /// One recalibration cycle: automatic gain on, range both lock-ins,
    /// settle, one-shot gain escalation, settle, re-range with a smaller
    /// attempt budget. Per-channel failures keep the stale rung and the run
    /// continues.
    fn recalibrate(&mut self) {
        info!("recalibrating detector ranges and gains");
        let gain_settle = self.ctx.gain_settle;
        let recal_settle = self.ctx.recalibration_settle;
        let search = self.ctx.range_search;
        let rerange = RangeSearchConfig {
            max_attempts: self.ctx.rerange_attempts,
            ..search
        };

        if let Some(lockin) = self.sessions.longitudinal.as_deref_mut() {
            enable_auto_gain(lockin, InstrumentRole::Longitudinal);
            sleep(gain_settle);
        }
        if let Some(lockin) = self.sessions.transverse.as_deref_mut() {
            enable_auto_gain(lockin, InstrumentRole::Transverse);
            sleep(gain_settle);
        }

        if let Some(lockin) = self.sessions.longitudinal.as_deref_mut() {
            range_both_channels(lockin, InstrumentRole::Longitudinal, &search);
        }
        if let Some(lockin) = self.sessions.transverse.as_deref_mut() {
            range_both_channels(lockin, InstrumentRole::Transverse, &search);
        }
        sleep(recal_settle);

        if let Some(lockin) = self.sessions.longitudinal.as_deref_mut() {
            escalate_gain(lockin, InstrumentRole::Longitudinal);
        }
        if let Some(lockin) = self.sessions.transverse.as_deref_mut() {
            escalate_gain(lockin, InstrumentRole::Transverse);
        }
        sleep(recal_settle);

        if let Some(lockin) = self.sessions.longitudinal.as_deref_mut() {
            range_both_channels(lockin, InstrumentRole::Longitudinal, &rerange);
        }
        if let Some(lockin) = self.sessions.transverse.as_deref_mut() {
            range_both_channels(lockin, InstrumentRole::Transverse, &rerange);
        }
    }

    fn acquire_sample(
        &mut self,
        mode: MeasurementMode,
        amplitude: f64,
        temperature: f64,
        field: f64,
    ) -> ChannelSample {
        let v_longitudinal = self.read_voltage(InstrumentRole::Longitudinal);
        let v_transverse = self.read_voltage(InstrumentRole::Transverse);
        let v_longitudinal_1f = if self.ctx.read_1f_for_resistance {
            self.read_1f_voltage()
        } else {
            None
        };
        let dc_bias = if mode.uses_dc_bias() {
            self.ctx.dc_bias_amps
        } else {
            0.0
        };

        ChannelSample {
            ac_amplitude: amplitude,
            ac_amplitude_squared: amplitude * amplitude,
            dc_bias,
            temperature,
            field,
            v_longitudinal,
            v_transverse,
            v_longitudinal_1f,
        }
    }

    fn read_voltage(&mut self, role: InstrumentRole) -> f64 {
        let lockin = match role {
            InstrumentRole::Longitudinal => self.sessions.longitudinal.as_deref_mut(),
            InstrumentRole::Transverse => self.sessions.transverse.as_deref_mut(),
            _ => None,
        };
        let Some(lockin) = lockin else {
            warn!("no {role} session; recording NaN");
            return f64::NAN;
        };
        match lockin.read_magnitude(LockinChannel::One) {
            Ok(value) => value,
            Err(e) => {
                warn!("{role} read failed: {e}");
                f64::NAN
            }
        }
    }

    /// Briefly park the longitudinal lock-in on the 1st harmonic for the
    /// resistance read-out, then restore its configured harmonic. The
    /// restore is attempted even when the read fails.
    fn read_1f_voltage(&mut self) -> Option<f64> {
        let settle = self.ctx.harmonic_switch_settle;
        let restore = self.ctx.restore_harmonic;
        let lockin = self.sessions.longitudinal.as_deref_mut()?;

        if let Err(e) = lockin.set_harmonic(1) {
            warn!("1f harmonic switch failed: {e}");
            return None;
        }
        sleep(settle);
        let value = match lockin.read_magnitude(LockinChannel::One) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("1f read failed: {e}");
                None
            }
        };
        if let Err(e) = lockin.set_harmonic(restore) {
            warn!("failed to restore harmonic {restore}: {e}");
        }
        value
    }

    fn persist_snapshot(&self) {
        if let Some(directory) = &self.ctx.save_directory
            && let Err(e) = self.store.write_snapshot(directory)
        {
            warn!("snapshot persistence failed: {e}");
        }
    }
}

fn enable_auto_gain(lockin: &mut dyn LockinAmplifier, role: InstrumentRole) {
    if let Err(e) = lockin.set_auto_gain(true) {
        warn!("{role}: enabling automatic gain failed: {e}");
    }
}

fn escalate_gain(lockin: &mut dyn LockinAmplifier, role: InstrumentRole) {
    if let Err(e) = autorange::optimize_gain(lockin) {
        warn!("{role}: gain optimization failed: {e}");
    }
}

fn range_both_channels(
    lockin: &mut dyn LockinAmplifier,
    role: InstrumentRole,
    config: &RangeSearchConfig,
) {
    for channel in [LockinChannel::One, LockinChannel::Two] {
        let mut target = LockinRangeChannel::new(lockin, channel);
        match autorange::adjust(&mut target, config) {
            Ok(Outcome::Resolved) => {}
            Ok(Outcome::Unresolved) => {
                warn!("{role}: range search unresolved on {channel:?}; keeping current rung");
            }
            Err(e) => warn!("{role}: range search failed on {channel:?}: {e}"),
        }
    }
}

fn sleep(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}
