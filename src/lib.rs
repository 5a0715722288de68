pub mod autorange;
pub mod bench;
pub mod config;
pub mod error;
pub mod instruments;
pub mod sensitivity;
pub mod session;
pub mod sweep;
pub mod telemetry;

pub use autorange::{Outcome, RangeChannel, RangeSearchConfig, adjust, optimize_gain};
pub use bench::{BenchState, SimulatedFactory};
pub use crate::config::{AppConfig, load_config, load_config_or_default};
pub use error::MeasureError;
pub use instruments::{
    ApproachMode, BiasSource, CryostatClient, ExcitationSource, LockinAmplifier, LockinChannel,
    LockinRangeChannel,
};
pub use sensitivity::SensitivityRung;
pub use session::{
    CryostatAddress, HarmonicPlan, InstrumentAddresses, InstrumentFactory, InstrumentRole,
    ProvisionReport, SessionManager, SessionSet,
};
pub use sweep::{
    DisplayEvent, DisplayLink, RunContext, RunHandle, RunState, SweepOrchestrator, SweepPlan,
};
pub use telemetry::{ChannelSample, DerivedSeries, MeasurementMode, Snapshot, TelemetryStore};
