//! Simulated instrument bench.
//!
//! Implements every session trait against a shared in-memory rig state, so
//! the full sweep loop can run without hardware. The simulated lock-ins
//! respond linearly to the driven excitation amplitude, which gives the
//! range search something real to chase.

use crate::error::MeasureError;
use crate::instruments::{
    ApproachMode, BiasSource, CryostatClient, ExcitationSource, LockinAmplifier, LockinChannel,
};
use crate::sensitivity::{self, SensitivityRung};
use crate::session::InstrumentFactory;
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared state of the simulated rig, observable from tests and the CLI.
#[derive(Debug)]
pub struct BenchState {
    pub drive_amplitude: f64,
    pub drive_frequency: f64,
    pub output_enabled: bool,
    pub temperature_k: f64,
    pub field_oe: f64,
    pub bias_amps: f64,
    pub bias_enabled: bool,
}

impl Default for BenchState {
    fn default() -> Self {
        Self {
            drive_amplitude: 0.0,
            drive_frequency: 0.0,
            output_enabled: false,
            temperature_k: 300.0,
            field_oe: 0.0,
            bias_amps: 0.0,
            bias_enabled: false,
        }
    }
}

/// Volts of longitudinal signal per ampere of drive. Chosen so the default
/// sweep amplitudes land a few rungs away from the initial one.
const LONGITUDINAL_RESPONSIVITY: f64 = 0.5;
/// The transverse signal is a small fraction of the longitudinal one.
const TRANSVERSE_FRACTION: f64 = 0.05;

struct SimulatedLockin {
    state: Arc<Mutex<BenchState>>,
    responsivity: f64,
    rungs: [SensitivityRung; 2],
    gain: u8,
    harmonic: u8,
}

impl SimulatedLockin {
    fn new(state: Arc<Mutex<BenchState>>, responsivity: f64) -> Result<Self, MeasureError> {
        let start = sensitivity::rung(18)?;
        Ok(Self {
            state,
            responsivity,
            rungs: [start, start],
            gain: 0,
            harmonic: 2,
        })
    }

    fn slot(channel: LockinChannel) -> usize {
        match channel {
            LockinChannel::One => 0,
            LockinChannel::Two => 1,
        }
    }
}

impl LockinAmplifier for SimulatedLockin {
    fn set_harmonic(&mut self, harmonic: u8) -> Result<(), MeasureError> {
        self.harmonic = harmonic;
        Ok(())
    }

    fn set_reference_phase(&mut self, _degrees: f64) -> Result<(), MeasureError> {
        Ok(())
    }

    fn read_magnitude(&mut self, channel: LockinChannel) -> Result<f64, MeasureError> {
        let state = self.state.lock();
        if !state.output_enabled {
            return Ok(0.0);
        }
        let base = state.drive_amplitude * self.responsivity;
        // Channel two sees the quadrature residual.
        let value = match channel {
            LockinChannel::One => base,
            LockinChannel::Two => base * 0.01,
        };
        // The 1f component is an order of magnitude above the 2f one.
        Ok(if self.harmonic == 1 { value * 10.0 } else { value })
    }

    fn current_rung(&mut self, channel: LockinChannel) -> Result<SensitivityRung, MeasureError> {
        Ok(self.rungs[Self::slot(channel)])
    }

    fn apply_rung(
        &mut self,
        channel: LockinChannel,
        rung: SensitivityRung,
    ) -> Result<(), MeasureError> {
        self.rungs[Self::slot(channel)] = rung;
        Ok(())
    }

    fn read_gain(&mut self) -> Result<u8, MeasureError> {
        Ok(self.gain)
    }

    fn set_gain(&mut self, gain: u8) -> Result<(), MeasureError> {
        self.gain = gain;
        Ok(())
    }

    fn set_auto_gain(&mut self, _enabled: bool) -> Result<(), MeasureError> {
        Ok(())
    }
}

struct SimulatedSource {
    state: Arc<Mutex<BenchState>>,
}

impl ExcitationSource for SimulatedSource {
    fn set_output(&mut self, amplitude: f64, frequency: f64) -> Result<(), MeasureError> {
        let mut state = self.state.lock();
        state.drive_amplitude = amplitude;
        state.drive_frequency = frequency;
        Ok(())
    }

    fn enable_output(&mut self) -> Result<(), MeasureError> {
        self.state.lock().output_enabled = true;
        Ok(())
    }

    fn disable_output(&mut self) -> Result<(), MeasureError> {
        self.state.lock().output_enabled = false;
        Ok(())
    }
}

struct SimulatedBias {
    state: Arc<Mutex<BenchState>>,
}

impl BiasSource for SimulatedBias {
    fn set_bias_current(&mut self, amps: f64) -> Result<(), MeasureError> {
        self.state.lock().bias_amps = amps;
        Ok(())
    }

    fn enable_output(&mut self) -> Result<(), MeasureError> {
        self.state.lock().bias_enabled = true;
        Ok(())
    }

    fn disable_output(&mut self) -> Result<(), MeasureError> {
        self.state.lock().bias_enabled = false;
        Ok(())
    }
}

struct SimulatedCryostat {
    state: Arc<Mutex<BenchState>>,
}

impl CryostatClient for SimulatedCryostat {
    fn set_temperature(
        &mut self,
        target_k: f64,
        _rate_k_per_min: f64,
        _mode: ApproachMode,
    ) -> Result<(), MeasureError> {
        // Settling is instantaneous on the bench.
        self.state.lock().temperature_k = target_k;
        Ok(())
    }

    fn read_temperature(&mut self) -> Result<(f64, String), MeasureError> {
        Ok((self.state.lock().temperature_k, "stable".into()))
    }

    fn read_field(&mut self) -> Result<(f64, String), MeasureError> {
        Ok((self.state.lock().field_oe, "holding".into()))
    }
}

/// Factory handing out simulated sessions that all share one rig state.
pub struct SimulatedFactory {
    state: Arc<Mutex<BenchState>>,
    lockins_opened: usize,
}

impl SimulatedFactory {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BenchState::default())),
            lockins_opened: 0,
        }
    }

    /// Handle onto the rig state for assertions and status output.
    pub fn state(&self) -> Arc<Mutex<BenchState>> {
        self.state.clone()
    }
}

impl Default for SimulatedFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentFactory for SimulatedFactory {
    fn open_lockin(&mut self, _address: &str) -> Result<Box<dyn LockinAmplifier>, MeasureError> {
        // First lock-in opened plays the longitudinal role.
        let responsivity = if self.lockins_opened == 0 {
            LONGITUDINAL_RESPONSIVITY
        } else {
            LONGITUDINAL_RESPONSIVITY * TRANSVERSE_FRACTION
        };
        self.lockins_opened += 1;
        Ok(Box::new(SimulatedLockin::new(
            self.state.clone(),
            responsivity,
        )?))
    }

    fn open_excitation(
        &mut self,
        _address: &str,
    ) -> Result<Box<dyn ExcitationSource>, MeasureError> {
        Ok(Box::new(SimulatedSource {
            state: self.state.clone(),
        }))
    }

    fn open_bias(&mut self, _address: &str) -> Result<Box<dyn BiasSource>, MeasureError> {
        Ok(Box::new(SimulatedBias {
            state: self.state.clone(),
        }))
    }

    fn open_cryostat(
        &mut self,
        _host: &str,
        _port: u16,
    ) -> Result<Box<dyn CryostatClient>, MeasureError> {
        Ok(Box::new(SimulatedCryostat {
            state: self.state.clone(),
        }))
    }
}
