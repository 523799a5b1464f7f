//! Identifiers and the binary packet format shared by all members

pub mod ids;
pub mod packet;
