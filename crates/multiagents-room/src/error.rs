use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoomError {
    /// The event consumer went away; the room cannot make progress.
    #[error("event subscriber disconnected")]
    SubscriberGone,
}

pub type Result<T> = std::result::Result<T, RoomError>;
