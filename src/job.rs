//! Running one import action as a job with a guaranteed stop on teardown.
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{info, warn};

use crate::importer::{ImportError, Importer};
use crate::model::ImportStatus;
use crate::source::RowSource;

pub enum JobAction<'a> {
    Start(&'a mut dyn RowSource),
    Resume(&'a mut dyn RowSource),
    Undo,
}

impl JobAction<'_> {
    fn name(&self) -> &'static str {
        match self {
            JobAction::Start(_) => "start",
            JobAction::Resume(_) => "resume",
            JobAction::Undo => "undo",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The action ran to its end; carries the action's return value.
    Finished(bool),
    /// `shutdown` resolved before the action did.
    Interrupted,
}

/// Run `action` until it returns, fails, panics, or `shutdown` resolves.
///
/// Whatever happens, the import is passed through [`Importer::stop`] before
/// this returns, so a job never leaves an import it drove marked
/// `In Progress`. An import that was already `In Progress` when the job began
/// belongs to another driver and is left untouched. Panics are re-raised after
/// the stop has been recorded.
pub async fn drive<F>(
    importer: &mut Importer,
    action: JobAction<'_>,
    shutdown: F,
) -> Result<JobOutcome, ImportError>
where
    F: Future<Output = ()>,
{
    let name = action.name();
    let owned_elsewhere = importer.status() == Some(ImportStatus::InProgress);
    let outcome = {
        let run = AssertUnwindSafe(async {
            match action {
                JobAction::Start(source) => importer.start(source).await,
                JobAction::Resume(source) => importer.resume(source).await,
                JobAction::Undo => importer.undo().await,
            }
        })
        .catch_unwind();
        tokio::select! {
            res = run => Some(res),
            _ = shutdown => None,
        }
    };

    let stopped = if owned_elsewhere {
        Ok(false)
    } else {
        importer.stop().await
    };
    if let Err(err) = &stopped {
        warn!(?err, import_id = importer.id(), "failed to record stop");
    }

    match outcome {
        None => {
            info!(import_id = importer.id(), job = name, "job interrupted");
            stopped?;
            Ok(JobOutcome::Interrupted)
        }
        Some(Err(panic)) => std::panic::resume_unwind(panic),
        Some(Ok(result)) => Ok(JobOutcome::Finished(result?)),
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    tokio::select! {
        _ = wait_for_ctrl_c() => info!("received Ctrl-C, stopping job"),
        _ = wait_for_sigterm() => info!("received SIGTERM, stopping job"),
    }
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(?err, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(err) => {
            warn!(?err, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
