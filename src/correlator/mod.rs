//! Stream and batch correlators
//!
//! Module organization:
//! - `windows` - per-(rule, entity) sliding window state
//! - `stream` - event consumers evaluating threshold rules
//! - `batch` - scheduled meta-query execution over alert history

pub mod batch;
pub mod stream;
pub mod windows;

pub use batch::{run_batch_scheduler, BatchCorrelator};
pub use stream::{run_stream_worker, StreamCorrelator};
pub use windows::{EntityWindowTracker, Observation};
