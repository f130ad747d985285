pub mod engine;
pub mod error;
pub mod models;

pub use engine::{detect_done, CardEngine};
pub use error::{CardError, Result};
pub use models::{Card, CardPhaseEntry, CardStatus, CoordinationStage};
