//! Decode engine contract and backend selection.

use thiserror::Error;
use tracing::warn;

use crate::decode::frame::DecodedFrame;
use crate::decode::hardware::HardwareEngine;
use crate::decode::software::SoftwareEngine;
use crate::source::AccessUnit;
use crate::StreamConfig;

#[derive(Debug, Error)]
pub enum EngineError {
    /// No usable decoder on this platform/configuration. Construction
    /// failure, retried by the supervisor after backoff.
    #[error("decoder unavailable: {0}")]
    Unavailable(String),
    /// The pipeline reported an unrecoverable error, the session must
    /// be torn down and restarted.
    #[error("decode pipeline failed: {0}")]
    Pipeline(String),
    /// The current access unit was rejected. Dropped, not retried.
    #[error("access unit rejected: {0}")]
    BadAccessUnit(String),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::BadAccessUnit(_))
    }
}

/// Uniform contract over the hardware and software decoders. The
/// supervisor is written once against this trait and does not know
/// which variant is active.
pub trait DecodeEngine {
    /// Feed session configuration data (e.g. SPS/PPS payload) that
    /// arrived before any video data. Does not produce a frame.
    fn feed_config(&mut self, data: &[u8]) -> Result<(), EngineError>;

    /// Feed one access unit and drain the resulting zero-or-more
    /// decoded frames. The access unit is borrowed for the duration of
    /// the call only.
    fn feed(&mut self, au: &AccessUnit) -> Result<Vec<DecodedFrame>, EngineError>;

    /// Short human readable description for diagnostics ("HW"/"SW").
    fn kind(&self) -> &'static str;
}

pub type BoxedEngine = Box<dyn DecodeEngine + Send>;

/// Construct the decode engine for the given config: hardware unless
/// forced off, falling back to software when no accelerator exists.
pub fn create_engine(config: &StreamConfig) -> Result<BoxedEngine, EngineError> {
    if config.force_software_decode {
        return Ok(Box::new(SoftwareEngine::new(config)?));
    }
    match HardwareEngine::new(config) {
        Ok(engine) => Ok(Box::new(engine)),
        Err(e) => {
            warn!("no hardware decoder ({}), falling back to software", e);
            Ok(Box::new(SoftwareEngine::new(config)?))
        }
    }
}
