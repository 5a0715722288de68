use crate::error::MeasureError;
use crate::instruments::{BiasSource, CryostatClient, ExcitationSource, LockinAmplifier};
use crate::telemetry::MeasurementMode;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical role of one instrument in the measurement setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentRole {
    /// Lock-in reading the longitudinal voltage.
    Longitudinal,
    /// Lock-in reading the transverse voltage.
    Transverse,
    /// AC excitation current source (heater).
    Excitation,
    /// DC bias source for thermometer 1.
    BiasA,
    /// DC bias source for thermometer 2.
    BiasB,
    /// Cryostat / temperature controller client.
    Cryostat,
}

impl fmt::Display for InstrumentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstrumentRole::Longitudinal => "longitudinal lock-in",
            InstrumentRole::Transverse => "transverse lock-in",
            InstrumentRole::Excitation => "excitation source",
            InstrumentRole::BiasA => "bias source A",
            InstrumentRole::BiasB => "bias source B",
            InstrumentRole::Cryostat => "cryostat",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryostatAddress {
    pub host: String,
    pub port: u16,
}

/// Resolved addresses for every instrument the run may need. Bias and
/// cryostat entries are optional; a missing entry simply leaves that role
/// unprovisioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentAddresses {
    pub longitudinal: String,
    pub transverse: String,
    pub excitation: String,
    pub bias_a: Option<String>,
    pub bias_b: Option<String>,
    pub cryostat: Option<CryostatAddress>,
}

/// Harmonic assignment applied to both lock-ins during provisioning.
///
/// The longitudinal lock-in stays on its configured harmonic in every mode;
/// the transverse one follows the mode (same harmonic for thermometry, a
/// higher one for the thermoelectric measurement).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarmonicPlan {
    pub longitudinal: u8,
    pub transverse_thermometry: u8,
    pub transverse_thermoelectric: u8,
    /// Reference-phase preset: 0 deg for odd harmonics, 90 deg for even.
    pub apply_phase_preset: bool,
}

impl Default for HarmonicPlan {
    fn default() -> Self {
        Self {
            longitudinal: 2,
            transverse_thermometry: 2,
            transverse_thermoelectric: 4,
            apply_phase_preset: true,
        }
    }
}

impl HarmonicPlan {
    pub fn transverse_for(&self, mode: MeasurementMode) -> u8 {
        match mode {
            MeasurementMode::ElectroThermal | MeasurementMode::ResistanceVsTemperature => {
                self.transverse_thermometry
            }
            MeasurementMode::Thermoelectric => self.transverse_thermoelectric,
        }
    }

    fn phase_for(harmonic: u8) -> f64 {
        if harmonic % 2 == 0 { 90.0 } else { 0.0 }
    }
}

/// Opens sessions per device family. Implementations wrap the concrete wire
/// protocols, which live outside this crate.
pub trait InstrumentFactory: Send {
    fn open_lockin(&mut self, address: &str) -> Result<Box<dyn LockinAmplifier>, MeasureError>;
    fn open_excitation(&mut self, address: &str)
    -> Result<Box<dyn ExcitationSource>, MeasureError>;
    fn open_bias(&mut self, address: &str) -> Result<Box<dyn BiasSource>, MeasureError>;
    fn open_cryostat(
        &mut self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn CryostatClient>, MeasureError>;
}

/// Live sessions, at most one per role. Missing entries are roles that were
/// never requested or whose open failed.
#[derive(Default)]
pub struct SessionSet {
    pub longitudinal: Option<Box<dyn LockinAmplifier>>,
    pub transverse: Option<Box<dyn LockinAmplifier>>,
    pub excitation: Option<Box<dyn ExcitationSource>>,
    pub bias_a: Option<Box<dyn BiasSource>>,
    pub bias_b: Option<Box<dyn BiasSource>>,
    pub cryostat: Option<Box<dyn CryostatClient>>,
}

impl SessionSet {
    pub fn has(&self, role: InstrumentRole) -> bool {
        match role {
            InstrumentRole::Longitudinal => self.longitudinal.is_some(),
            InstrumentRole::Transverse => self.transverse.is_some(),
            InstrumentRole::Excitation => self.excitation.is_some(),
            InstrumentRole::BiasA => self.bias_a.is_some(),
            InstrumentRole::BiasB => self.bias_b.is_some(),
            InstrumentRole::Cryostat => self.cryostat.is_some(),
        }
    }
}

/// Per-role outcome of one provisioning pass. Partial provisioning is a
/// valid terminal state: callers must check role availability before use.
#[derive(Default)]
pub struct ProvisionReport {
    pub failures: Vec<(InstrumentRole, MeasureError)>,
}

impl ProvisionReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, role: InstrumentRole) -> bool {
        self.failures.iter().any(|(r, _)| *r == role)
    }

    fn record(&mut self, role: InstrumentRole, error: MeasureError) {
        warn!("provisioning {role}: {error}");
        self.failures.push((role, error));
    }
}

/// Owns lazily-created instrument sessions. Re-provisioning an already open
/// role returns the cached session; sessions are never reopened and bias
/// sessions are never torn down mid-run, even when a later mode stops using
/// them.
pub struct SessionManager {
    factory: Box<dyn InstrumentFactory>,
    sessions: SessionSet,
}

impl SessionManager {
    pub fn new(factory: Box<dyn InstrumentFactory>) -> Self {
        Self {
            factory,
            sessions: SessionSet::default(),
        }
    }

    /// Open whatever `mode` requires and apply the harmonic assignment to
    /// both lock-ins. `bias_amps` is programmed onto the bias sources only
    /// in modes that use DC bias.
    pub fn provision(
        &mut self,
        mode: MeasurementMode,
        addresses: &InstrumentAddresses,
        harmonics: &HarmonicPlan,
        bias_amps: f64,
    ) -> ProvisionReport {
        let mut report = ProvisionReport::default();
        info!("provisioning sessions for {mode:?}");

        if self.sessions.longitudinal.is_none() {
            match self.factory.open_lockin(&addresses.longitudinal) {
                Ok(session) => self.sessions.longitudinal = Some(session),
                Err(e) => report.record(InstrumentRole::Longitudinal, e),
            }
        }
        if self.sessions.transverse.is_none() {
            match self.factory.open_lockin(&addresses.transverse) {
                Ok(session) => self.sessions.transverse = Some(session),
                Err(e) => report.record(InstrumentRole::Transverse, e),
            }
        }
        if self.sessions.excitation.is_none() {
            match self.factory.open_excitation(&addresses.excitation) {
                Ok(session) => self.sessions.excitation = Some(session),
                Err(e) => report.record(InstrumentRole::Excitation, e),
            }
        }

        if mode.uses_dc_bias() {
            if self.sessions.bias_a.is_none()
                && let Some(address) = &addresses.bias_a
            {
                match self.factory.open_bias(address) {
                    Ok(session) => self.sessions.bias_a = Some(session),
                    Err(e) => report.record(InstrumentRole::BiasA, e),
                }
            }
            if self.sessions.bias_b.is_none()
                && let Some(address) = &addresses.bias_b
            {
                match self.factory.open_bias(address) {
                    Ok(session) => self.sessions.bias_b = Some(session),
                    Err(e) => report.record(InstrumentRole::BiasB, e),
                }
            }
        }

        if self.sessions.cryostat.is_none()
            && let Some(address) = &addresses.cryostat
        {
            match self.factory.open_cryostat(&address.host, address.port) {
                Ok(session) => self.sessions.cryostat = Some(session),
                Err(e) => report.record(InstrumentRole::Cryostat, e),
            }
        }

        // Harmonics are keyed by mode, so they are re-applied on every pass
        // even for cached sessions.
        if let Some(lockin) = self.sessions.longitudinal.as_deref_mut()
            && let Err(e) =
                Self::apply_harmonic(lockin, harmonics.longitudinal, harmonics.apply_phase_preset)
        {
            report.record(InstrumentRole::Longitudinal, e);
        }
        let transverse_harmonic = harmonics.transverse_for(mode);
        if let Some(lockin) = self.sessions.transverse.as_deref_mut()
            && let Err(e) =
                Self::apply_harmonic(lockin, transverse_harmonic, harmonics.apply_phase_preset)
        {
            report.record(InstrumentRole::Transverse, e);
        }

        if mode.uses_dc_bias() {
            for (role, bias) in [
                (InstrumentRole::BiasA, self.sessions.bias_a.as_deref_mut()),
                (InstrumentRole::BiasB, self.sessions.bias_b.as_deref_mut()),
            ] {
                if let Some(bias) = bias
                    && let Err(e) = Self::configure_bias(bias, bias_amps)
                {
                    report.record(role, e);
                }
            }
        }

        report
    }

    fn apply_harmonic(
        lockin: &mut dyn LockinAmplifier,
        harmonic: u8,
        phase_preset: bool,
    ) -> Result<(), MeasureError> {
        lockin.set_harmonic(harmonic)?;
        if phase_preset {
            lockin.set_reference_phase(HarmonicPlan::phase_for(harmonic))?;
        }
        Ok(())
    }

    fn configure_bias(bias: &mut dyn BiasSource, amps: f64) -> Result<(), MeasureError> {
        bias.set_bias_current(amps)?;
        bias.enable_output()
    }

    pub fn sessions(&self) -> &SessionSet {
        &self.sessions
    }

    /// Hand the sessions to the orchestrator for the run.
    pub fn into_sessions(self) -> SessionSet {
        self.sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::LockinChannel;
    use crate::sensitivity::SensitivityRung;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct OpenCounts {
        lockin: AtomicUsize,
        excitation: AtomicUsize,
        bias: AtomicUsize,
        cryostat: AtomicUsize,
    }

    struct RecordingLockin {
        harmonics: Arc<parking_lot::Mutex<Vec<u8>>>,
        phases: Arc<parking_lot::Mutex<Vec<f64>>>,
    }

    impl LockinAmplifier for RecordingLockin {
        fn set_harmonic(&mut self, harmonic: u8) -> Result<(), MeasureError> {
            self.harmonics.lock().push(harmonic);
            Ok(())
        }
        fn set_reference_phase(&mut self, degrees: f64) -> Result<(), MeasureError> {
            self.phases.lock().push(degrees);
            Ok(())
        }
        fn read_magnitude(&mut self, _channel: LockinChannel) -> Result<f64, MeasureError> {
            Ok(0.0)
        }
        fn current_rung(&mut self, _channel: LockinChannel) -> Result<SensitivityRung, MeasureError> {
            crate::sensitivity::rung(18)
        }
        fn apply_rung(
            &mut self,
            _channel: LockinChannel,
            _rung: SensitivityRung,
        ) -> Result<(), MeasureError> {
            Ok(())
        }
        fn read_gain(&mut self) -> Result<u8, MeasureError> {
            Ok(0)
        }
        fn set_gain(&mut self, _gain: u8) -> Result<(), MeasureError> {
            Ok(())
        }
        fn set_auto_gain(&mut self, _enabled: bool) -> Result<(), MeasureError> {
            Ok(())
        }
    }

    struct NullSource;
    impl ExcitationSource for NullSource {
        fn set_output(&mut self, _amplitude: f64, _frequency: f64) -> Result<(), MeasureError> {
            Ok(())
        }
        fn enable_output(&mut self) -> Result<(), MeasureError> {
            Ok(())
        }
        fn disable_output(&mut self) -> Result<(), MeasureError> {
            Ok(())
        }
    }

    struct RecordingBias {
        programmed: Arc<parking_lot::Mutex<Vec<f64>>>,
        enabled: Arc<AtomicUsize>,
    }
    impl BiasSource for RecordingBias {
        fn set_bias_current(&mut self, amps: f64) -> Result<(), MeasureError> {
            self.programmed.lock().push(amps);
            Ok(())
        }
        fn enable_output(&mut self) -> Result<(), MeasureError> {
            self.enabled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn disable_output(&mut self) -> Result<(), MeasureError> {
            Ok(())
        }
    }

    struct CountingFactory {
        counts: Arc<OpenCounts>,
        fail_excitation: bool,
        harmonics: Arc<parking_lot::Mutex<Vec<u8>>>,
        phases: Arc<parking_lot::Mutex<Vec<f64>>>,
        bias_programmed: Arc<parking_lot::Mutex<Vec<f64>>>,
        bias_enabled: Arc<AtomicUsize>,
    }

    impl CountingFactory {
        fn new(fail_excitation: bool) -> Self {
            Self {
                counts: Arc::new(OpenCounts::default()),
                fail_excitation,
                harmonics: Arc::default(),
                phases: Arc::default(),
                bias_programmed: Arc::default(),
                bias_enabled: Arc::default(),
            }
        }
    }

    impl InstrumentFactory for CountingFactory {
        fn open_lockin(
            &mut self,
            _address: &str,
        ) -> Result<Box<dyn LockinAmplifier>, MeasureError> {
            self.counts.lockin.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RecordingLockin {
                harmonics: self.harmonics.clone(),
                phases: self.phases.clone(),
            }))
        }
        fn open_excitation(
            &mut self,
            _address: &str,
        ) -> Result<Box<dyn ExcitationSource>, MeasureError> {
            if self.fail_excitation {
                return Err(MeasureError::Connection {
                    role: InstrumentRole::Excitation,
                    reason: "no route to host".into(),
                });
            }
            self.counts.excitation.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullSource))
        }
        fn open_bias(&mut self, _address: &str) -> Result<Box<dyn BiasSource>, MeasureError> {
            self.counts.bias.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RecordingBias {
                programmed: self.bias_programmed.clone(),
                enabled: self.bias_enabled.clone(),
            }))
        }
        fn open_cryostat(
            &mut self,
            _host: &str,
            _port: u16,
        ) -> Result<Box<dyn CryostatClient>, MeasureError> {
            self.counts.cryostat.fetch_add(1, Ordering::SeqCst);
            Err(MeasureError::Connection {
                role: InstrumentRole::Cryostat,
                reason: "unused in these tests".into(),
            })
        }
    }

    fn addresses(with_bias: bool) -> InstrumentAddresses {
        InstrumentAddresses {
            longitudinal: "10.0.0.1".into(),
            transverse: "10.0.0.2".into(),
            excitation: "10.0.0.3".into(),
            bias_a: with_bias.then(|| "GPIB0::24::INSTR".into()),
            bias_b: with_bias.then(|| "GPIB0::25::INSTR".into()),
            cryostat: None,
        }
    }

    #[test]
    fn reprovisioning_reuses_cached_sessions() {
        let factory = CountingFactory::new(false);
        let counts = factory.counts.clone();
        let mut manager = SessionManager::new(Box::new(factory));

        let plan = HarmonicPlan::default();
        let report = manager.provision(
            MeasurementMode::ElectroThermal,
            &addresses(true),
            &plan,
            1e-6,
        );
        assert!(report.is_complete());
        let report = manager.provision(
            MeasurementMode::ElectroThermal,
            &addresses(true),
            &plan,
            1e-6,
        );
        assert!(report.is_complete());

        assert_eq!(counts.lockin.load(Ordering::SeqCst), 2);
        assert_eq!(counts.excitation.load(Ordering::SeqCst), 1);
        assert_eq!(counts.bias.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn thermoelectric_mode_skips_bias_and_uses_higher_harmonic() {
        let factory = CountingFactory::new(false);
        let counts = factory.counts.clone();
        let harmonics = factory.harmonics.clone();
        let mut manager = SessionManager::new(Box::new(factory));

        let report = manager.provision(
            MeasurementMode::Thermoelectric,
            &addresses(true),
            &HarmonicPlan::default(),
            1e-6,
        );
        assert!(report.is_complete());
        assert_eq!(counts.bias.load(Ordering::SeqCst), 0);
        assert!(!manager.sessions().has(InstrumentRole::BiasA));
        // Longitudinal stays on 2, transverse moves to 4.
        assert_eq!(*harmonics.lock(), vec![2, 4]);
    }

    #[test]
    fn thermometry_mode_configures_and_enables_bias() {
        let factory = CountingFactory::new(false);
        let programmed = factory.bias_programmed.clone();
        let enabled = factory.bias_enabled.clone();
        let mut manager = SessionManager::new(Box::new(factory));

        manager.provision(
            MeasurementMode::ResistanceVsTemperature,
            &addresses(true),
            &HarmonicPlan::default(),
            1e-6,
        );
        assert_eq!(*programmed.lock(), vec![1e-6, 1e-6]);
        assert_eq!(enabled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn phase_preset_follows_harmonic_parity() {
        let factory = CountingFactory::new(false);
        let phases = factory.phases.clone();
        let mut manager = SessionManager::new(Box::new(factory));

        let plan = HarmonicPlan {
            longitudinal: 1,
            transverse_thermoelectric: 4,
            ..Default::default()
        };
        manager.provision(
            MeasurementMode::Thermoelectric,
            &addresses(false),
            &plan,
            0.0,
        );
        assert_eq!(*phases.lock(), vec![0.0, 90.0]);
    }

    #[test]
    fn partial_provisioning_reports_the_failed_role() {
        let factory = CountingFactory::new(true);
        let mut manager = SessionManager::new(Box::new(factory));

        let report = manager.provision(
            MeasurementMode::ElectroThermal,
            &addresses(false),
            &HarmonicPlan::default(),
            0.0,
        );
        assert!(!report.is_complete());
        assert!(report.failed(InstrumentRole::Excitation));
        assert!(manager.sessions().has(InstrumentRole::Longitudinal));
        assert!(manager.sessions().has(InstrumentRole::Transverse));
        assert!(!manager.sessions().has(InstrumentRole::Excitation));
    }
}
