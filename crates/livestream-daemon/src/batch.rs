//! Batch health checks.
//!
//! The checker only books runs; the probing happens in a spawned worker that
//! reports each verdict to the core as a `CoreEvent::ProbeDone`. The core is
//! the one that writes statuses and calls [`BatchChecker::record`].

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use livestream_proto::protocol::CheckProgress;
use livestream_proto::store::RecordId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::CoreEvent;
use crate::probe::HealthProbe;

struct ActiveRun {
    id: u64,
    total: usize,
    completed: usize,
    token: CancellationToken,
}

impl ActiveRun {
    fn progress(&self) -> CheckProgress {
        CheckProgress {
            completed: self.completed,
            total: self.total,
        }
    }
}

pub struct BatchChecker {
    probe: Arc<HealthProbe>,
    concurrency: usize,
    run: Option<ActiveRun>,
    next_run: u64,
}

impl BatchChecker {
    pub fn new(probe: Arc<HealthProbe>, concurrency: usize) -> Self {
        Self {
            probe,
            concurrency: concurrency.max(1),
            run: None,
            next_run: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    pub fn progress(&self) -> Option<CheckProgress> {
        self.run.as_ref().map(ActiveRun::progress)
    }

    /// Start a run over `targets` in collection order. Returns `None` when a
    /// run is already active; the existing run is left alone.
    pub fn start(
        &mut self,
        targets: Vec<(RecordId, String)>,
        tx: mpsc::Sender<CoreEvent>,
    ) -> Option<CheckProgress> {
        if self.run.is_some() {
            return None;
        }
        self.next_run += 1;
        let run = ActiveRun {
            id: self.next_run,
            total: targets.len(),
            completed: 0,
            token: CancellationToken::new(),
        };
        info!("batch: run {} over {} streams", run.id, run.total);

        tokio::spawn(run_worker(
            run.id,
            targets,
            Arc::clone(&self.probe),
            self.concurrency,
            run.token.clone(),
            tx,
        ));

        let progress = run.progress();
        self.run = Some(run);
        Some(progress)
    }

    /// Stop launching probes for the active run. Returns false when idle.
    pub fn cancel(&mut self) -> bool {
        match &self.run {
            Some(run) => {
                info!("batch: cancelling run {}", run.id);
                run.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Count one delivered probe. `None` for results of a run that is no
    /// longer active.
    pub fn record(&mut self, run_id: u64) -> Option<CheckProgress> {
        let run = self.run.as_mut().filter(|r| r.id == run_id)?;
        run.completed += 1;
        Some(run.progress())
    }

    /// Close the run once its worker is done. Returns the final progress and
    /// whether it was cancelled.
    pub fn finish(&mut self, run_id: u64) -> Option<(CheckProgress, bool)> {
        if self.run.as_ref().map(|r| r.id) != Some(run_id) {
            return None;
        }
        let run = self.run.take()?;
        info!(
            "batch: run {} finished {}/{}{}",
            run.id,
            run.completed,
            run.total,
            if run.token.is_cancelled() { " (cancelled)" } else { "" }
        );
        Some((run.progress(), run.token.is_cancelled()))
    }

    /// Probe one record outside any run.
    pub fn check_one(&self, id: RecordId, url: String, tx: mpsc::Sender<CoreEvent>) {
        let probe = Arc::clone(&self.probe);
        tokio::spawn(async move {
            let alive = probe.probe(&url).await;
            let _ = tx
                .send(CoreEvent::ProbeDone {
                    run: None,
                    id,
                    alive,
                })
                .await;
        });
    }
}

async fn run_worker(
    run_id: u64,
    targets: Vec<(RecordId, String)>,
    probe: Arc<HealthProbe>,
    concurrency: usize,
    token: CancellationToken,
    tx: mpsc::Sender<CoreEvent>,
) {
    let results = stream::iter(targets)
        .map(|(id, url)| {
            let probe = Arc::clone(&probe);
            let token = token.clone();
            async move {
                if token.is_cancelled() {
                    return None;
                }
                Some((id, probe.probe(&url).await))
            }
        })
        .buffer_unordered(concurrency);
    tokio::pin!(results);

    while let Some(result) = results.next().await {
        let Some((id, alive)) = result else {
            continue;
        };
        let done = CoreEvent::ProbeDone {
            run: Some(run_id),
            id,
            alive,
        };
        if tx.send(done).await.is_err() {
            debug!("batch: core gone, abandoning run {}", run_id);
            return;
        }
    }
    let _ = tx.send(CoreEvent::CheckFinished { run: run_id }).await;
}
