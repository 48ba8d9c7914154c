//! Bracket orders: entry plus stop-loss / take-profit with OCO enforcement

pub mod events;
pub mod group;
pub mod handle;
pub mod manager;
pub mod state_file;

pub use events::{PrivateEvent, TRACKED_CODES};
pub use group::{BracketGroup, BracketStage, GroupStore};
pub use handle::{BracketCommand, BracketHandle, DEFAULT_CAPACITY};
pub use manager::BracketManager;
pub use state_file::{StateFile, StateLock};
