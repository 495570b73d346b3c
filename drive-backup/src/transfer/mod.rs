//! Transfer helpers: upload progress and size formatting.

pub mod progress;
pub mod progress_stream;
