//! The job worker (spec §4.9): drains the queue and dispatches each job to
//! its handler. SIGINT or SIGTERM lets the in-flight job finish before the
//! loop exits; no new job is taken off the channel afterward.

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::context::JobContext;
use crate::handlers::{atlas, cleanup, deep_research, dream, ingest, summarize};
use crate::queue::Job;

/// SIGTERM is Unix-only in tokio; on other platforms we hand back a
/// signal that never fires so the `select!` in `run` still compiles.
#[cfg(unix)]
fn terminate_signal() -> tokio::signal::unix::Signal {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler")
}

#[cfg(not(unix))]
fn terminate_signal() -> NeverSignal {
    NeverSignal
}

#[cfg(not(unix))]
struct NeverSignal;

#[cfg(not(unix))]
impl NeverSignal {
    async fn recv(&mut self) -> Option<()> {
        std::future::pending().await
    }
}

pub struct Worker {
    receiver: mpsc::Receiver<Job>,
    ctx: JobContext,
}

impl Worker {
    pub fn new(receiver: mpsc::Receiver<Job>, ctx: JobContext) -> Self {
        Self { receiver, ctx }
    }

    pub async fn run(mut self) {
        info!("worker started");
        let mut sigterm = terminate_signal();
        loop {
            tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    info!("SIGINT received, draining in-flight work and stopping");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, draining in-flight work and stopping");
                    break;
                }
                job = self.receiver.recv() => {
                    match job {
                        Some(job) => self.dispatch(job).await,
                        None => break,
                    }
                }
            }
        }
        info!("worker stopped");
    }

    async fn dispatch(&self, job: Job) {
        let name = job.name();
        let now = chrono::Utc::now().timestamp();
        let result: anyhow::Result<()> = match job {
            Job::IngestConversation(payload) => {
                ingest::handle_ingest_conversation(&self.ctx, payload, now).await.map(|_| ()).map_err(Into::into)
            }
            Job::IngestDocument(payload) => {
                ingest::handle_ingest_document(&self.ctx, payload, now).await.map(|_| ()).map_err(Into::into)
            }
            Job::Summarize(payload) => {
                summarize::handle_summarize(&self.ctx, payload).await.map(|_| ()).map_err(Into::into)
            }
            Job::Dream(payload) => {
                dream::handle_dream(&self.ctx, payload, now).await.map(|_| ()).map_err(Into::into)
            }
            Job::DeepResearch(payload) => {
                deep_research::handle_deep_research(&self.ctx, payload).await.map(|_| ()).map_err(Into::into)
            }
            Job::CleanupGraph(payload) => {
                cleanup::handle_cleanup(&self.ctx, payload, now).await.map(|_| ()).map_err(Into::into)
            }
        };

        match result {
            Ok(()) => info!(job = name, "job completed"),
            Err(e) => error!(job = name, error = %e, "job failed"),
        }
    }
}

/// Runs the Atlas Processor for a user, ahead of anything riding the job
/// queue — this one is driven by a daily scheduler rather than an event.
pub async fn run_atlas_for_user(ctx: &JobContext, user: &epigraph_core::model::UserId) {
    let today = chrono::Utc::now().date_naive();
    let now = chrono::Utc::now().timestamp();
    if let Err(e) = atlas::process_atlas_job(ctx, user, today, now).await {
        warn!(error = %e, "atlas job failed");
    }
}
