pub mod aggregate;
pub mod election;
