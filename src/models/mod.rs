//! Core data types carried through the pipeline.

mod job;
mod result;

pub use job::{
    Headers, Job, HEADER_COMMIT_SHA, HEADER_FILE_PATH, HEADER_REPOSITORY, HEADER_SOURCE_TYPE,
    HEADER_TRACEPARENT,
};
pub use result::{Ack, Dispatched, JobResult};
