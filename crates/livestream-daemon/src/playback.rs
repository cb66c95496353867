//! Playback sessions fenced by a generation counter.
//!
//! Every play or stop bumps `generation`. A start worker captures the value
//! it was spawned with and hands it back in its [`SessionReport`]; the core
//! only commits a report whose generation is still the live one. Anything
//! else is torn down without touching shared state.

use std::fmt;
use std::sync::Arc;

use livestream_proto::error::StreamError;
use livestream_proto::protocol::{Event, NoticeCategory, PlaybackPhase, StreamStatus};
use livestream_proto::store::{RecordId, StreamStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::CoreEvent;
use crate::engine::{start_session, teardown, EngineInstance, PlaybackEngine};

/// Result of one start worker.
pub struct SessionReport {
    pub generation: u64,
    pub id: RecordId,
    pub outcome: Result<Box<dyn EngineInstance>, String>,
}

impl fmt::Debug for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionReport")
            .field("generation", &self.generation)
            .field("id", &self.id)
            .field("ok", &self.outcome.is_ok())
            .finish()
    }
}

struct ActiveSession {
    id: RecordId,
    instance: Box<dyn EngineInstance>,
}

pub struct PlaybackManager {
    engine: Arc<dyn PlaybackEngine>,
    generation: u64,
    phase: PlaybackPhase,
    current: Option<ActiveSession>,
    /// Record whose start worker is still running under the live generation.
    pending: Option<RecordId>,
    /// Start workers, live or fenced. Each one either hands its instance to
    /// the core or releases it itself.
    starts: Vec<JoinHandle<()>>,
    teardowns: Vec<JoinHandle<()>>,
}

impl PlaybackManager {
    pub fn new(engine: Arc<dyn PlaybackEngine>) -> Self {
        Self {
            engine,
            generation: 0,
            phase: PlaybackPhase::Stopped,
            current: None,
            pending: None,
            starts: Vec::new(),
            teardowns: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    pub fn current_index(&self, store: &StreamStore) -> Option<usize> {
        self.current.as_ref().and_then(|s| store.index_of(s.id))
    }

    /// True when `id` is playing or being started.
    pub fn involves(&self, id: RecordId) -> bool {
        self.pending == Some(id) || self.current.as_ref().map(|s| s.id) == Some(id)
    }

    /// Start playing the record at `index`. Returns the events of the implicit
    /// stop; the outcome of the start itself arrives later as a
    /// `CoreEvent::SessionStarted`.
    pub fn play(
        &mut self,
        store: &mut StreamStore,
        index: Option<usize>,
        tx: &mpsc::Sender<CoreEvent>,
    ) -> Result<Vec<Event>, StreamError> {
        let index = index.ok_or(StreamError::NoSelection)?;
        let (id, url) = match (store.id_at(index), store.get(index)) {
            (Some(id), Some(record)) => (id, record.url.trim().to_string()),
            _ => {
                return Err(StreamError::IndexOutOfRange {
                    index,
                    len: store.len(),
                })
            }
        };
        if url.is_empty() {
            return Err(StreamError::EmptyUrl);
        }
        self.engine
            .check_available()
            .map_err(StreamError::EngineUnavailable)?;

        let events = self.stop(store, true, true);

        self.generation += 1;
        let generation = self.generation;
        self.pending = Some(id);
        self.phase = PlaybackPhase::Starting;
        info!("playback: starting {} (generation {})", url, generation);

        let engine = Arc::clone(&self.engine);
        let tx = tx.clone();
        self.starts.retain(|h| !h.is_finished());
        self.starts.push(tokio::spawn(async move {
            let outcome = start_session(engine.as_ref(), &url)
                .await
                .map_err(|e| format!("{:#}", e));
            let report = SessionReport {
                generation,
                id,
                outcome,
            };
            if let Err(mpsc::error::SendError(CoreEvent::SessionStarted(report))) =
                tx.send(CoreEvent::SessionStarted(report)).await
            {
                if let Ok(instance) = report.outcome {
                    teardown(instance).await;
                }
            }
        }));

        Ok(events)
    }

    /// Arbitrate a start worker's result.
    pub fn on_session_started(&mut self, store: &mut StreamStore, report: SessionReport) -> Vec<Event> {
        if report.generation != self.generation {
            match report.outcome {
                Ok(instance) => {
                    debug!(
                        "playback: discarding stale session (generation {} < {})",
                        report.generation, self.generation
                    );
                    self.spawn_teardown(instance);
                }
                Err(e) => debug!(
                    "playback: stale start failed (generation {}): {}",
                    report.generation, e
                ),
            }
            return Vec::new();
        }

        self.pending = None;
        match report.outcome {
            Ok(instance) => match store.set_status(report.id, Some(StreamStatus::Playing)) {
                Some(index) => {
                    self.current = Some(ActiveSession {
                        id: report.id,
                        instance,
                    });
                    self.phase = PlaybackPhase::Playing;
                    info!("playback: playing stream {}", index + 1);
                    vec![
                        Event::StatusChanged {
                            index,
                            status: Some(StreamStatus::Playing),
                        },
                        Event::PlaybackChanged {
                            current: Some(index),
                        },
                    ]
                }
                None => {
                    self.phase = PlaybackPhase::Stopped;
                    self.spawn_teardown(instance);
                    Vec::new()
                }
            },
            Err(e) => {
                self.phase = PlaybackPhase::Stopped;
                warn!("playback: start failed: {}", e);
                let err = StreamError::Playback(e);
                vec![Event::notice(NoticeCategory::PlaybackError, err.to_string())]
            }
        }
    }

    /// Stop the current session, if any. Teardown runs off the core loop.
    pub fn stop(
        &mut self,
        store: &mut StreamStore,
        update_status: bool,
        increment_generation: bool,
    ) -> Vec<Event> {
        if increment_generation {
            self.generation += 1;
            self.pending = None;
        }

        let mut events = Vec::new();
        if let Some(session) = self.current.take() {
            info!("playback: stopping (generation {})", self.generation);
            if update_status {
                if let Some(index) = store.set_status(session.id, Some(StreamStatus::Stopped)) {
                    events.push(Event::StatusChanged {
                        index,
                        status: Some(StreamStatus::Stopped),
                    });
                }
            }
            events.push(Event::PlaybackChanged { current: None });
            self.spawn_teardown(session.instance);
        }

        self.phase = if self.pending.is_some() {
            PlaybackPhase::Starting
        } else {
            PlaybackPhase::Stopped
        };
        events
    }

    /// Stop unconditionally and wait until every handle has been released.
    ///
    /// The mailbox must already be closed: start workers still running then
    /// fail to report and release their own instance, which is awaited here.
    pub async fn shutdown(&mut self) {
        self.generation += 1;
        self.pending = None;
        self.phase = PlaybackPhase::Stopped;
        if let Some(session) = self.current.take() {
            teardown(session.instance).await;
        }
        for handle in self.starts.drain(..) {
            let _ = handle.await;
        }
        for handle in self.teardowns.drain(..) {
            let _ = handle.await;
        }
        info!("playback: all sessions released");
    }

    /// Release a handle that reached the core after shutdown began.
    pub async fn discard(&mut self, report: SessionReport) {
        if let Ok(instance) = report.outcome {
            teardown(instance).await;
        }
    }

    fn spawn_teardown(&mut self, instance: Box<dyn EngineInstance>) {
        self.teardowns.retain(|h| !h.is_finished());
        self.teardowns.push(tokio::spawn(teardown(instance)));
    }
}
