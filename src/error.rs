use crate::session::InstrumentRole;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeasureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection to {role} failed: {reason}")]
    Connection {
        role: InstrumentRole,
        reason: String,
    },
    #[error("read failure on {channel}: {reason}")]
    ReadFailure { channel: String, reason: String },
    #[error("invalid sensitivity rung: {0}")]
    InvalidRung(u8),
    #[error("invalid sweep: {0}")]
    InvalidSweep(String),
    #[error("missing session: {0}")]
    MissingSession(InstrumentRole),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
