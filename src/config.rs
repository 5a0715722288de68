use crate::session::{CryostatAddress, HarmonicPlan, InstrumentAddresses};
use crate::sweep::{RunContext, SweepPlan};
use crate::telemetry::MeasurementMode;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::autorange::RangeSearchConfig;
use crate::error::MeasureError;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub instruments: InstrumentsConfig,
    pub measurement: MeasurementConfig,
    pub sweep: SweepConfig,
    pub calibration: CalibrationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InstrumentsConfig {
    pub longitudinal: String,
    pub transverse: String,
    pub excitation: String,
    pub bias_a: Option<String>,
    pub bias_b: Option<String>,
    pub cryostat_host: Option<String>,
    pub cryostat_port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MeasurementConfig {
    pub mode: MeasurementMode,
    pub frequency_hz: f64,
    pub dc_bias_amps: f64,
    pub harmonics: HarmonicPlan,
    pub read_1f_for_resistance: bool,
    pub save_directory: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AmplitudeSweepConfig {
    Linear { start: f64, stop: f64, step: f64 },
    Log {
        i_min: f64,
        i_max: f64,
        points_per_decade: usize,
    },
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SweepConfig {
    pub amplitudes: AmplitudeSweepConfig,
    pub temperature_points: Vec<f64>,
    pub wait_per_point_secs: f64,
    pub recalibration_period: usize,
    pub ramp_delay_secs: f64,
    pub temperature_rate_k_per_min: f64,
    pub temperature_settle_secs: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CalibrationConfig {
    pub low_ratio: f64,
    pub high_ratio: f64,
    pub range_attempts: u32,
    pub rerange_attempts: u32,
    pub range_settle_secs: f64,
    pub gain_settle_secs: f64,
    pub recalibration_settle_secs: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            instruments: InstrumentsConfig::default(),
            measurement: MeasurementConfig::default(),
            sweep: SweepConfig::default(),
            calibration: CalibrationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for InstrumentsConfig {
    fn default() -> Self {
        Self {
            longitudinal: "169.254.51.12".to_string(),
            transverse: "169.254.51.13".to_string(),
            excitation: "GPIB0::10::INSTR".to_string(),
            bias_a: None,
            bias_b: None,
            cryostat_host: None,
            cryostat_port: 7020,
        }
    }
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            mode: MeasurementMode::ElectroThermal,
            frequency_hz: 17.777,
            dc_bias_amps: 1e-6,
            harmonics: HarmonicPlan::default(),
            read_1f_for_resistance: false,
            save_directory: Some(PathBuf::from("./data")),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            amplitudes: AmplitudeSweepConfig::Linear {
                start: 3e-4,
                stop: 1e-4,
                step: -1e-4,
            },
            temperature_points: vec![],
            wait_per_point_secs: 70.0,
            recalibration_period: 10,
            ramp_delay_secs: 5.0,
            temperature_rate_k_per_min: 1.0,
            temperature_settle_secs: 100.0,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            low_ratio: 0.10,
            high_ratio: 0.90,
            range_attempts: 26,
            rerange_attempts: 22,
            range_settle_secs: 1.0,
            gain_settle_secs: 10.0,
            recalibration_settle_secs: 60.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn instrument_addresses(&self) -> InstrumentAddresses {
        InstrumentAddresses {
            longitudinal: self.instruments.longitudinal.clone(),
            transverse: self.instruments.transverse.clone(),
            excitation: self.instruments.excitation.clone(),
            bias_a: self.instruments.bias_a.clone(),
            bias_b: self.instruments.bias_b.clone(),
            cryostat: self.instruments.cryostat_host.clone().map(|host| {
                CryostatAddress {
                    host,
                    port: self.instruments.cryostat_port,
                }
            }),
        }
    }

    pub fn sweep_plan(&self) -> Result<SweepPlan, MeasureError> {
        let amplitudes = match self.sweep.amplitudes {
            AmplitudeSweepConfig::Linear { start, stop, step } => {
                SweepPlan::linear_amplitudes(start, stop, step)?
            }
            AmplitudeSweepConfig::Log {
                i_min,
                i_max,
                points_per_decade,
            } => SweepPlan::log_amplitudes(i_min, i_max, points_per_decade)?,
        };
        SweepPlan::new(
            amplitudes,
            self.sweep.temperature_points.clone(),
            Duration::from_secs_f64(self.sweep.wait_per_point_secs),
            self.sweep.recalibration_period,
        )
    }

    pub fn run_context(&self) -> RunContext {
        RunContext {
            frequency_hz: self.measurement.frequency_hz,
            dc_bias_amps: self.measurement.dc_bias_amps,
            ramp_delay: Duration::from_secs_f64(self.sweep.ramp_delay_secs),
            temperature_rate_k_per_min: self.sweep.temperature_rate_k_per_min,
            temperature_settle: Duration::from_secs_f64(self.sweep.temperature_settle_secs),
            gain_settle: Duration::from_secs_f64(self.calibration.gain_settle_secs),
            recalibration_settle: Duration::from_secs_f64(
                self.calibration.recalibration_settle_secs,
            ),
            harmonic_switch_settle: Duration::from_secs(1),
            range_search: RangeSearchConfig {
                low_ratio: self.calibration.low_ratio,
                high_ratio: self.calibration.high_ratio,
                max_attempts: self.calibration.range_attempts,
                settle: Duration::from_secs_f64(self.calibration.range_settle_secs),
            },
            rerange_attempts: self.calibration.rerange_attempts,
            read_1f_for_resistance: self.measurement.read_1f_for_resistance,
            restore_harmonic: self.measurement.harmonics.longitudinal,
            save_directory: self.measurement.save_directory.clone(),
        }
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        // Try common config file locations
        let possible_paths = ["config.toml", "sweep.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // Add environment variable overrides with prefix "NNE_SWEEP_"
    builder = builder.add_source(
        Environment::with_prefix("NNE_SWEEP")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize::<AppConfig>()
}

/// Load configuration with better error handling and defaults
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}
