//! Background processing: handler dispatch and the worker pool

mod handler;
mod worker;

pub use handler::{HandlerRegistry, TaskContext, TaskHandler};
pub use worker::{Worker, WorkerPool};
