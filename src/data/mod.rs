//! Domain model, the alias index, parsing, scoring and persistence.

pub mod aliases;
pub mod classifier;
pub mod credits;
pub mod matching;
pub mod models;
pub mod names;
pub mod pg;
pub mod seed;
pub mod store;
