//! Event transport between jury nodes.
//!
//! - `protocol`: wire events and their length-prefixed codec
//! - `hub`: in-process broadcast hub used by the demo and tests

pub mod hub;
pub mod protocol;

pub use hub::{start_hub, EventHandle, HubHandle};
pub use protocol::{
    decode_event, encode_event, AdapterEvent, ContractEvent, ContractEventKind, ElectionEvent,
    NetworkError, PeerId, ProtocolEvent,
};
