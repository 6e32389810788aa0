//! Transport and data-movement building blocks.

pub mod communicator;
pub mod pack;
pub mod two_sided;
pub mod wire;
