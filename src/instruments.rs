use crate::autorange::RangeChannel;
use crate::error::MeasureError;
use crate::sensitivity::SensitivityRung;
use serde::{Deserialize, Serialize};

/// Which demodulator channel of a dual-channel lock-in to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockinChannel {
    One,
    Two,
}

/// A connected lock-in amplifier session.
///
/// Channel reads return the demodulated magnitude in volts. The communication
/// layer behind an implementation owns timeouts and bounded retries; a
/// surfaced `ReadFailure` means those retries are already exhausted.
pub trait LockinAmplifier: Send {
    /// Detection harmonic as a multiple of the reference frequency.
    fn set_harmonic(&mut self, harmonic: u8) -> Result<(), MeasureError>;
    fn set_reference_phase(&mut self, degrees: f64) -> Result<(), MeasureError>;
    fn read_magnitude(&mut self, channel: LockinChannel) -> Result<f64, MeasureError>;
    fn current_rung(&mut self, channel: LockinChannel) -> Result<SensitivityRung, MeasureError>;
    fn apply_rung(
        &mut self,
        channel: LockinChannel,
        rung: SensitivityRung,
    ) -> Result<(), MeasureError>;
    /// AC gain rung, 0..=11.
    fn read_gain(&mut self) -> Result<u8, MeasureError>;
    fn set_gain(&mut self, gain: u8) -> Result<(), MeasureError>;
    fn set_auto_gain(&mut self, enabled: bool) -> Result<(), MeasureError>;
}

/// Adapter exposing one demodulator channel of a lock-in as a `RangeChannel`
/// for the range search.
pub struct LockinRangeChannel<'a> {
    lockin: &'a mut dyn LockinAmplifier,
    channel: LockinChannel,
}

impl<'a> LockinRangeChannel<'a> {
    pub fn new(lockin: &'a mut dyn LockinAmplifier, channel: LockinChannel) -> Self {
        Self { lockin, channel }
    }
}

impl RangeChannel for LockinRangeChannel<'_> {
    fn read_magnitude(&mut self) -> Result<f64, MeasureError> {
        self.lockin.read_magnitude(self.channel)
    }

    fn current_rung(&mut self) -> Result<SensitivityRung, MeasureError> {
        self.lockin.current_rung(self.channel)
    }

    fn apply_rung(&mut self, rung: SensitivityRung) -> Result<(), MeasureError> {
        self.lockin.apply_rung(self.channel, rung)
    }
}

/// AC excitation current source driving the heater.
pub trait ExcitationSource: Send {
    /// Program a sine output; does not enable it.
    fn set_output(&mut self, amplitude: f64, frequency: f64) -> Result<(), MeasureError>;
    fn enable_output(&mut self) -> Result<(), MeasureError>;
    fn disable_output(&mut self) -> Result<(), MeasureError>;
}

/// DC current source biasing a thermometer element.
pub trait BiasSource: Send {
    fn set_bias_current(&mut self, amps: f64) -> Result<(), MeasureError>;
    fn enable_output(&mut self) -> Result<(), MeasureError>;
    fn disable_output(&mut self) -> Result<(), MeasureError>;
}

/// How the cryostat approaches a temperature setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproachMode {
    FastSettle,
    NoOvershoot,
}

/// Cryostat / temperature controller client. Only touched at
/// temperature-point boundaries, never inside the amplitude loop.
pub trait CryostatClient: Send {
    fn set_temperature(
        &mut self,
        target_k: f64,
        rate_k_per_min: f64,
        mode: ApproachMode,
    ) -> Result<(), MeasureError>;
    /// Temperature in kelvin plus the controller's status word.
    fn read_temperature(&mut self) -> Result<(f64, String), MeasureError>;
    /// Field in oersted plus the controller's status word.
    fn read_field(&mut self) -> Result<(f64, String), MeasureError>;
}
