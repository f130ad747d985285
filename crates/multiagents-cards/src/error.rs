use thiserror::Error;

use crate::models::CardStatus;

#[derive(Debug, Error)]
pub enum CardError {
    #[error("card not found: {id}")]
    NotFound { id: String },

    /// The requested lifecycle operation is not valid from this status.
    #[error("cannot {operation} a card in {status} (expected {expected})")]
    InvalidTransition {
        operation: &'static str,
        status: CardStatus,
        expected: &'static str,
    },

    #[error("card has no field '{0}'")]
    UnknownField(String),
}

pub type Result<T> = std::result::Result<T, CardError>;
