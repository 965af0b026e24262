//! Task scheduling: priority queue, retry policy and the journal port

mod journal;
mod queue;
mod retry;

pub use journal::TaskJournal;
pub use queue::{QueueStats, Scheduler};
pub use retry::RetryPolicy;
