//! Schemaguard Migration Library
//!
//! Script scaffolding and inspection used by the `schemaguard-migrate` CLI.

pub mod inspect;
pub mod scaffold;
