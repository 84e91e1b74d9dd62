//! Database access for qvet-engine
//!
//! Per-entity query modules over the shared SQLite pool. Schema lives in
//! `qvet_common::db::init`.

pub mod answers;
pub mod phases;
pub mod questions;
pub mod raw;
pub mod reviews;
pub mod scores;
pub mod settings;
