pub mod keys;
pub mod sortition;
pub mod vrf;
