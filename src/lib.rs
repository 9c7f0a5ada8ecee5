pub mod audit;
pub mod chunking;
pub mod config;
pub mod dedup;
pub mod detector;
pub mod error;
pub mod events;
pub mod messenger;
pub mod monitor;
pub mod notify;
pub mod performance;
pub mod protocol;
pub mod queue;
pub mod reassembly;
pub mod recovery;
pub mod target;
pub mod terminal;
pub mod types;

pub use error::RelayError;
pub use target::AgentTarget;
pub use types::{Metadata, Priority};
