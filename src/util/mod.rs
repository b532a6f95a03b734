//! Small helpers shared by the backends and the pipeline.

pub mod retention;
pub mod secret;
