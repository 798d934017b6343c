pub mod context;
pub mod error;
pub mod handlers;
pub mod queue;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use context::JobContext;
pub use error::JobError;
pub use queue::{ChannelJobQueue, Job, JobQueue};
pub use worker::Worker;
