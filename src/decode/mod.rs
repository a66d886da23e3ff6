pub(crate) mod convert;
pub mod engine;
pub mod frame;
pub mod hardware;
pub mod software;
pub mod supervisor;

pub use engine::{BoxedEngine, DecodeEngine, EngineError};
pub use frame::{DecodedFrame, PixelLayout};
pub use supervisor::DecodeSupervisor;
