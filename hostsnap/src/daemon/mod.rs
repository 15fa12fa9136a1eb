//! Process-level concerns of the hostsnap binary.

pub mod shutdown;
