//! Process-level helpers shared by the bridge binary.

pub mod bootstrap;
