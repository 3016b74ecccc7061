//! docrelay - streaming raw-document ingestion worker.
//!
//! Drains an ordered, partitioned stream of raw-document records, runs each
//! record through a pluggable processing stage, and produces either a
//! downstream result or a dead-letter record. Offsets are committed only
//! after every job in a batch has reached a terminal state, giving
//! at-least-once delivery with no silent drops.
//!
//! The concurrent core lives in [`pipeline`]; everything else is ports and
//! adapters around it: [`source`] and [`spool`] for the partitioned log,
//! [`process`] for the downstream stage, [`sink`] for dead letters,
//! [`dedup`] for duplicate suppression, [`observe`] for metrics and
//! liveness, and [`trace`] for W3C trace continuity.

pub mod cli;
pub mod config;
pub mod dedup;
pub mod models;
pub mod observe;
pub mod pipeline;
pub mod process;
pub mod sink;
pub mod source;
pub mod spool;
pub mod trace;
