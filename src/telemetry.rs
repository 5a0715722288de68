use crate::error::MeasureError;
use chrono::{DateTime, Local, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which derived-quantity view of the accumulated data is active.
///
/// The mode decides which derived series are computed, which sessions get
/// provisioned and which harmonic pairing the lock-ins run. Switching mode
/// never discards samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementMode {
    /// Longitudinal 2f voltage against drive amplitude and its square.
    ElectroThermal,
    /// Thermometer resistance against temperature, from the DC-biased read-out.
    ResistanceVsTemperature,
    /// Longitudinal and transverse voltages against drive amplitude.
    Thermoelectric,
}

impl MeasurementMode {
    /// Thermometry modes drive a DC probe current through the thermometers;
    /// the thermoelectric measurement does not.
    pub fn uses_dc_bias(&self) -> bool {
        matches!(
            self,
            MeasurementMode::ElectroThermal | MeasurementMode::ResistanceVsTemperature
        )
    }
}

/// One measurement instant. Ordinal = position in the append-only record.
/// Failed channel reads are stored as NaN; `v_longitudinal_1f` is only
/// present when the 1f read-out option is active.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSample {
    pub ac_amplitude: f64,
    pub ac_amplitude_squared: f64,
    pub dc_bias: f64,
    pub temperature: f64,
    pub field: f64,
    pub v_longitudinal: f64,
    pub v_transverse: f64,
    pub v_longitudinal_1f: Option<f64>,
}

/// A named (x, y) sequence derived from the sample record.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedSeries {
    pub name: &'static str,
    pub points: Vec<(f64, f64)>,
}

/// Everything a snapshot persists besides the raw rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub mode: MeasurementMode,
    pub samples: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub rows: Vec<ChannelSample>,
}

struct TelemetryInner {
    samples: Vec<ChannelSample>,
    mode: MeasurementMode,
    use_1f_for_resistance: bool,
    started_at: DateTime<Utc>,
    redraw: Vec<Sender<()>>,
}

/// Append-only, per-channel record of samples plus derived-quantity views.
///
/// Appends happen on the worker thread only; clones share the record and may
/// read it concurrently from the UI thread. Each append raises one redraw
/// notification per subscriber, coalesced while the consumer lags.
#[derive(Clone)]
pub struct TelemetryStore {
    inner: Arc<RwLock<TelemetryInner>>,
}

impl TelemetryStore {
    pub fn new(mode: MeasurementMode) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TelemetryInner {
                samples: Vec::new(),
                mode,
                use_1f_for_resistance: false,
                started_at: Utc::now(),
                redraw: Vec::new(),
            })),
        }
    }

    /// Redraw notifications for a display loop. The channel holds at most
    /// one pending notification: bursts of appends coalesce into a single
    /// redraw, and the consumer always sees the latest store state.
    pub fn subscribe_redraw(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        self.inner.write().redraw.push(tx);
        rx
    }

    pub fn append(&self, sample: ChannelSample) {
        let mut inner = self.inner.write();
        inner.samples.push(sample);
        debug!(
            "appended sample {} (amplitude {:.3e} A)",
            inner.samples.len() - 1,
            sample.ac_amplitude
        );
        inner.redraw.retain(|tx| match tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Disconnected(())) => false,
        });
    }

    /// Switch the active view. Idempotent; never touches recorded samples.
    pub fn set_mode(&self, mode: MeasurementMode) {
        let mut inner = self.inner.write();
        if inner.mode == mode {
            return;
        }
        info!("switching view: {:?} -> {:?}", inner.mode, mode);
        inner.mode = mode;
    }

    pub fn mode(&self) -> MeasurementMode {
        self.inner.read().mode
    }

    /// Derive resistance from the 1f harmonic voltage instead of the primary
    /// longitudinal voltage.
    pub fn set_use_1f_for_resistance(&self, use_1f: bool) {
        self.inner.write().use_1f_for_resistance = use_1f;
    }

    pub fn len(&self) -> usize {
        self.inner.read().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomic copy of the sample record, safe to take from any thread.
    pub fn samples(&self) -> Vec<ChannelSample> {
        self.inner.read().samples.clone()
    }

    /// The derived (x, y) series for a mode, over all samples recorded so
    /// far regardless of which mode was active when they arrived.
    pub fn derived_series(&self, mode: MeasurementMode) -> Vec<DerivedSeries> {
        let inner = self.inner.read();
        let samples = &inner.samples;
        match mode {
            MeasurementMode::ElectroThermal => vec![
                DerivedSeries {
                    name: "v_long_vs_amplitude",
                    points: samples
                        .iter()
                        .map(|s| (s.ac_amplitude, s.v_longitudinal))
                        .collect(),
                },
                DerivedSeries {
                    name: "v_long_vs_amplitude_squared",
                    points: samples
                        .iter()
                        .map(|s| (s.ac_amplitude_squared, s.v_longitudinal))
                        .collect(),
                },
            ],
            MeasurementMode::ResistanceVsTemperature => vec![DerivedSeries {
                name: "resistance_vs_temperature",
                points: samples
                    .iter()
                    .map(|s| (s.temperature, resistance(s, inner.use_1f_for_resistance)))
                    .collect(),
            }],
            MeasurementMode::Thermoelectric => vec![
                DerivedSeries {
                    name: "v_long_vs_amplitude",
                    points: samples
                        .iter()
                        .map(|s| (s.ac_amplitude, s.v_longitudinal))
                        .collect(),
                },
                DerivedSeries {
                    name: "v_trans_vs_amplitude",
                    points: samples
                        .iter()
                        .map(|s| (s.ac_amplitude, s.v_transverse))
                        .collect(),
                },
            ],
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read();
        Snapshot {
            meta: SnapshotMeta {
                mode: inner.mode,
                samples: inner.samples.len(),
                started_at: inner.started_at,
            },
            rows: inner.samples.clone(),
        }
    }

    /// Persist the current snapshot as a tab-separated table in `directory`,
    /// one row per sample, plus a JSON metadata sidecar. The filename embeds
    /// the most recent temperature and the capture date so repeated runs at
    /// different temperatures do not collide; the file is rewritten whole on
    /// every call.
    pub fn write_snapshot(&self, directory: &Path) -> Result<PathBuf, MeasureError> {
        let snapshot = self.snapshot();

        let temperature_suffix = snapshot
            .rows
            .iter()
            .rev()
            .map(|s| s.temperature)
            .find(|t| t.is_finite())
            .map_or_else(|| "Unknown".to_string(), |t| format!("{t:.2}"));
        let date = Local::now().format("%Y-%m-%d");
        let filename = format!("measurement_data_{temperature_suffix}K_{date}.txt");
        let path = directory.join(filename);

        let mut table = String::from(
            "ordinal\tac_amplitude\tac_amplitude_squared\tdc_bias\ttemperature\tfield\tv_longitudinal\tv_transverse\tv_longitudinal_1f\n",
        );
        for (ordinal, row) in snapshot.rows.iter().enumerate() {
            let v_1f = row.v_longitudinal_1f.unwrap_or(f64::NAN);
            let _ = writeln!(
                table,
                "{}\t{:e}\t{:e}\t{:e}\t{}\t{}\t{:e}\t{:e}\t{:e}",
                ordinal,
                row.ac_amplitude,
                row.ac_amplitude_squared,
                row.dc_bias,
                row.temperature,
                row.field,
                row.v_longitudinal,
                row.v_transverse,
                v_1f,
            );
        }
        std::fs::write(&path, table)?;

        let meta_path = path.with_extension("meta.json");
        std::fs::write(&meta_path, serde_json::to_string_pretty(&snapshot.meta)?)?;

        debug!("snapshot written to {}", path.display());
        Ok(path)
    }
}

fn resistance(sample: &ChannelSample, use_1f: bool) -> f64 {
    let voltage = if use_1f {
        sample.v_longitudinal_1f.unwrap_or(sample.v_longitudinal)
    } else {
        sample.v_longitudinal
    };
    if sample.dc_bias != 0.0 {
        voltage / sample.dc_bias
    } else {
        f64::NAN
    }
}
