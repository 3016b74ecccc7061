//! CLI command implementations.

mod run;
mod seed;

pub use run::{run, RunArgs};
pub use seed::{seed, SeedArgs};
