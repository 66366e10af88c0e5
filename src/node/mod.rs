//! Jury node: per-request coordination and its runtime.
//!
//! - `store`: lifecycle records and TTL-based expiry
//! - `processor`: the EXEC/SIG/COMMIT state machine and election rounds
//! - `adapter`: cross-chain consultation answers
//! - `core`: key files and the node event loop

pub mod adapter;
pub mod core;
pub mod processor;
pub mod store;

pub use self::core::{load_or_generate_keypair, Node, NodeError};
pub use adapter::AdapterError;
pub use processor::{LocalAccount, Processor, ProcessorError};
pub use store::{RecordPhase, RecordSnapshot};
