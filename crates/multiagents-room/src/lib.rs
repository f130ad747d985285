pub mod error;
pub mod events;
pub mod persistent;
pub mod prompts;
pub mod room;
pub mod rounds;
pub mod share;

pub use error::{Result, RoomError};
pub use events::ChatEvent;
pub use room::{ChatRoom, InboxItem, RoomOptions};
pub use share::{detect_pass, extract_shareable, PRIVATE_PLACEHOLDER};
