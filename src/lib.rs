//! Canonicalization and entity resolution for show metadata.
//!
//! Raw studio, network, genre and role strings resolve to canonical entities
//! through an [`AliasIndex`](data::aliases::AliasIndex); free-text credits are
//! parsed into structured entries; local records are matched against an
//! external catalog by a rate-limited [`BatchScheduler`](scheduler::BatchScheduler).

pub mod catalog;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod json;
pub mod logging;
pub mod report;
pub mod scheduler;
pub mod utils;
