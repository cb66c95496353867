/// StreamCore — single-owner event loop for all mutable state.
///
/// The core owns the record store, the playback manager and the batch
/// checker. Front ends send `CoreEvent::Request`s through a [`CoreHandle`];
/// probe and session workers report back on the same mailbox. Nothing else
/// ever mutates the store, so concurrent playback and batch checks cannot
/// race on it.
///
/// After every event the core publishes a fresh `CoreState` snapshot, and
/// every visible change is also broadcast as an `Event` for live listeners.
use std::path::PathBuf;
use std::sync::Arc;

use livestream_proto::config::CheckConfig;
use livestream_proto::error::StreamError;
use livestream_proto::protocol::{Command, CoreState, Event, NoticeCategory, Reply, StreamStatus};
use livestream_proto::record::{validate, validate_all};
use livestream_proto::sii::{self, WriteOptions};
use livestream_proto::state::{PersistentState, StateManager};
use livestream_proto::store::{RecordId, StreamStore};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::batch::BatchChecker;
use crate::engine::PlaybackEngine;
use crate::playback::{PlaybackManager, SessionReport};
use crate::probe::HealthProbe;

// ── CoreEvent ────────────────────────────────────────────────────────────────

/// All inputs into the core loop.
#[derive(Debug)]
pub enum CoreEvent {
    /// A command from a front end, answered exactly once on `reply`.
    Request {
        cmd: Command,
        reply: oneshot::Sender<Result<Reply, StreamError>>,
    },
    /// One probe verdict. `run` is `None` for a single-record check.
    ProbeDone {
        run: Option<u64>,
        id: RecordId,
        alive: bool,
    },
    /// A batch worker ran out of targets (or was cancelled).
    CheckFinished { run: u64 },
    /// A playback start worker finished, successfully or not.
    SessionStarted(SessionReport),
    Shutdown,
}

// ── CoreHandle ───────────────────────────────────────────────────────────────

/// Cheap, cloneable front-end side of the core.
#[derive(Clone)]
pub struct CoreHandle {
    tx: mpsc::Sender<CoreEvent>,
    state: Arc<StateManager>,
    events: broadcast::Sender<Event>,
}

impl CoreHandle {
    pub fn new(
        tx: mpsc::Sender<CoreEvent>,
        state: Arc<StateManager>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self { tx, state, events }
    }

    /// Send a command and wait for its answer. The snapshot already reflects
    /// the command by the time the answer arrives.
    pub async fn request(&self, cmd: Command) -> Result<Reply, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoreEvent::Request { cmd, reply })
            .await
            .map_err(|_| StreamError::ShuttingDown)?;
        rx.await.map_err(|_| StreamError::ShuttingDown)?
    }

    pub async fn snapshot(&self) -> CoreState {
        self.state.get_state().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(CoreEvent::Shutdown).await;
    }
}

// ── StreamCore ───────────────────────────────────────────────────────────────

pub struct StreamCore {
    store: StreamStore,
    /// File the collection was loaded from or last saved to.
    file_path: Option<PathBuf>,
    persistent: PersistentState,
    playback: PlaybackManager,
    checker: BatchChecker,
    state_manager: Arc<StateManager>,
    events: broadcast::Sender<Event>,
    /// Handed to workers so their results come back through the mailbox.
    tx: mpsc::Sender<CoreEvent>,
}

impl StreamCore {
    pub fn new(
        check: &CheckConfig,
        engine: Arc<dyn PlaybackEngine>,
        state_manager: Arc<StateManager>,
        events: broadcast::Sender<Event>,
        tx: mpsc::Sender<CoreEvent>,
    ) -> anyhow::Result<Self> {
        let probe = Arc::new(HealthProbe::new(check)?);
        let persistent = state_manager.load_persistent();
        Ok(Self {
            store: StreamStore::new(),
            file_path: None,
            persistent,
            playback: PlaybackManager::new(engine),
            checker: BatchChecker::new(probe, check.concurrency),
            state_manager,
            events,
            tx,
        })
    }

    /// Run the loop until `Shutdown`. The core keeps a sender of its own for
    /// workers, so the mailbox never closes underneath it.
    pub async fn run(mut self, mut rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        info!("core: starting event loop");

        if let Some(path) = self.persistent.last_file.clone() {
            match self.load(Some(path.clone())).await {
                Ok(_) => info!("core: restored {:?}", path),
                Err(e) => warn!("core: could not restore last file: {}", e),
            }
        }
        self.publish().await;

        while let Some(evt) = rx.recv().await {
            match evt {
                CoreEvent::Shutdown => {
                    info!("core: shutdown requested");
                    break;
                }
                CoreEvent::Request { cmd, reply } => {
                    let label = command_label(&cmd);
                    debug!("core: command {}", label);
                    let result = self.handle_command(cmd).await;
                    if let Err(e) = &result {
                        error!("core: {} failed: {}", label, e);
                        self.emit(Event::notice(e.category(), e.to_string()));
                    }
                    self.publish().await;
                    let _ = reply.send(result);
                }
                CoreEvent::ProbeDone { run, id, alive } => {
                    self.on_probe_done(run, id, alive);
                    self.publish().await;
                }
                CoreEvent::CheckFinished { run } => {
                    self.on_check_finished(run);
                    self.publish().await;
                }
                CoreEvent::SessionStarted(report) => {
                    let events = self.playback.on_session_started(&mut self.store, report);
                    self.emit_all(events);
                    self.publish().await;
                }
            }
        }

        self.shutdown(rx).await;
        Ok(())
    }

    async fn shutdown(&mut self, mut rx: mpsc::Receiver<CoreEvent>) {
        self.checker.cancel();
        // Start workers that have not reported yet release their own handle.
        rx.close();
        self.playback.shutdown().await;

        // Reports queued before the close still carry live handles.
        while let Some(evt) = rx.recv().await {
            match evt {
                CoreEvent::SessionStarted(report) => self.playback.discard(report).await,
                CoreEvent::Request { reply, .. } => {
                    let _ = reply.send(Err(StreamError::ShuttingDown));
                }
                _ => {}
            }
        }

        self.persist().await;
        self.publish().await;
        info!("core: stopped");
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> Result<Reply, StreamError> {
        match cmd {
            Command::Load { path } => self.load(path).await,
            Command::Save {
                path,
                overwrite,
                backup,
            } => self.save(path, WriteOptions { overwrite, backup }).await,

            Command::Add { record } => {
                let index = self.store.add(record)?;
                self.emit(Event::RecordsChanged {
                    count: self.store.len(),
                });
                Ok(Reply::Added { index })
            }

            Command::Update { index, record } => {
                let (id, old_url) = self
                    .store
                    .id_at(index)
                    .zip(self.store.get(index))
                    .map(|(id, r)| (id, r.url.clone()))
                    .ok_or(StreamError::IndexOutOfRange {
                        index,
                        len: self.store.len(),
                    })?;
                validate(&record)?;
                // The running session still plays the old URL.
                if old_url != record.url && self.playback.involves(id) {
                    let events = self.playback.stop(&mut self.store, false, true);
                    self.emit_all(events);
                }
                let before = self.store.status(index);
                self.store.update(index, record)?;
                let after = self.store.status(index);
                if before != after {
                    self.emit(Event::StatusChanged {
                        index,
                        status: after,
                    });
                }
                self.emit(Event::RecordsChanged {
                    count: self.store.len(),
                });
                Ok(Reply::Done)
            }

            Command::Delete { index } => {
                let id = self.store.id_at(index).ok_or(StreamError::IndexOutOfRange {
                    index,
                    len: self.store.len(),
                })?;
                if self.playback.involves(id) {
                    let events = self.playback.stop(&mut self.store, false, true);
                    self.emit_all(events);
                }
                let (_, record) = self.store.delete(index)?;
                info!("core: deleted {:?}", record.name);
                self.emit(Event::RecordsChanged {
                    count: self.store.len(),
                });
                if let Some(current) = self.playback.current_index(&self.store) {
                    self.emit(Event::PlaybackChanged {
                        current: Some(current),
                    });
                }
                Ok(Reply::Done)
            }

            Command::Play { index } => {
                let events = self.playback.play(&mut self.store, index, &self.tx)?;
                self.emit_all(events);
                Ok(Reply::Started)
            }

            Command::Stop => {
                let events = self.playback.stop(&mut self.store, true, true);
                self.emit_all(events);
                Ok(Reply::Done)
            }

            Command::Check { index } => {
                let index = index.ok_or(StreamError::NoSelection)?;
                let (id, record) = self
                    .store
                    .id_at(index)
                    .zip(self.store.get(index))
                    .ok_or(StreamError::IndexOutOfRange {
                        index,
                        len: self.store.len(),
                    })?;
                let url = record.url.trim().to_string();
                if url.is_empty() {
                    return Err(StreamError::EmptyUrl);
                }
                self.checker.check_one(id, url, self.tx.clone());
                Ok(Reply::Started)
            }

            Command::CheckAll => {
                if self.checker.is_running() {
                    return Ok(Reply::Ignored {
                        reason: "A check is already running.".to_string(),
                    });
                }
                if self.store.is_empty() {
                    return Err(StreamError::NoData("No streams to test."));
                }
                match self.checker.start(self.store.targets(), self.tx.clone()) {
                    Some(progress) => {
                        self.emit(Event::Progress {
                            completed: progress.completed,
                            total: progress.total,
                        });
                        Ok(Reply::Started)
                    }
                    None => Ok(Reply::Ignored {
                        reason: "A check is already running.".to_string(),
                    }),
                }
            }

            Command::CancelCheck => {
                if self.checker.cancel() {
                    Ok(Reply::Done)
                } else {
                    Ok(Reply::Ignored {
                        reason: "No check is running.".to_string(),
                    })
                }
            }
        }
    }

    /// Replace the collection with the contents of `path` (or the last file).
    /// The file is read completely before anything is touched.
    async fn load(&mut self, path: Option<PathBuf>) -> Result<Reply, StreamError> {
        let path = path
            .or_else(|| self.persistent.last_file.clone())
            .ok_or(StreamError::NoData("No file to load."))?;
        let records = sii::read_file(&path).await?;
        let path = absolute(path).await;

        self.checker.cancel();
        let events = self.playback.stop(&mut self.store, false, true);
        self.emit_all(events);

        let count = records.len();
        self.store.load(records);
        self.file_path = Some(path.clone());
        self.persistent.last_file = Some(path.clone());
        self.persist().await;

        info!("core: loaded {} streams from {:?}", count, path);
        self.emit(Event::RecordsChanged { count });
        self.emit(Event::notice(
            NoticeCategory::Info,
            format!("Loaded {} streams from {}", count, path.display()),
        ));
        Ok(Reply::Loaded { count, path })
    }

    async fn save(&mut self, path: Option<PathBuf>, opts: WriteOptions) -> Result<Reply, StreamError> {
        if self.store.is_empty() {
            return Err(StreamError::NoData("No streams to save."));
        }
        let path = path
            .or_else(|| self.file_path.clone())
            .ok_or(StreamError::NoData("No file to save to."))?;

        let records = self.store.to_vec();
        validate_all(&records).map_err(|(index, source)| StreamError::Validation {
            index: Some(index),
            source,
        })?;
        let backup = sii::write_file(&path, &records, opts).await?;
        let path = absolute(path).await;

        self.file_path = Some(path.clone());
        self.persistent.last_file = Some(path.clone());
        self.persist().await;

        self.emit(Event::notice(
            NoticeCategory::Saved,
            "Streams have been saved successfully.",
        ));
        Ok(Reply::Saved { path, backup })
    }

    // ── worker results ────────────────────────────────────────────────────────

    fn on_probe_done(&mut self, run: Option<u64>, id: RecordId, alive: bool) {
        let progress = match run {
            Some(run) => match self.checker.record(run) {
                Some(p) => Some(p),
                None => {
                    debug!("core: dropping result of finished run {}", run);
                    return;
                }
            },
            None => None,
        };

        let status = StreamStatus::from_probe(alive);
        match self.store.set_status(id, Some(status)) {
            Some(index) => {
                debug!("core: stream {}: {}", index + 1, status);
                self.emit(Event::StatusChanged {
                    index,
                    status: Some(status),
                });
                if run.is_none() {
                    let message = if alive {
                        "The stream is working!"
                    } else {
                        "The stream is not responding."
                    };
                    self.emit(Event::notice(NoticeCategory::CheckResult, message));
                }
            }
            None => debug!("core: probed record {:?} no longer exists", id),
        }

        if let Some(p) = progress {
            self.emit(Event::Progress {
                completed: p.completed,
                total: p.total,
            });
        }
    }

    fn on_check_finished(&mut self, run: u64) {
        if let Some((progress, cancelled)) = self.checker.finish(run) {
            self.emit(Event::CheckFinished {
                completed: progress.completed,
                total: progress.total,
                cancelled,
            });
            let message = if cancelled {
                "Testing cancelled"
            } else {
                "Testing complete"
            };
            self.emit(Event::notice(NoticeCategory::Info, message));
        }
    }

    // ── publishing ────────────────────────────────────────────────────────────

    fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: Vec<Event>) {
        for event in events {
            self.emit(event);
        }
    }

    async fn publish(&mut self) {
        let snapshot = CoreState {
            rev: 0,
            file_path: self.file_path.clone(),
            records: self.store.to_vec(),
            statuses: self.store.statuses(),
            current: self.playback.current_index(&self.store),
            playback: self.playback.phase(),
            check: self.checker.progress(),
        };
        self.state_manager.publish(snapshot).await;
    }

    async fn persist(&mut self) {
        if let Err(e) = self.state_manager.save_persistent(&self.persistent).await {
            warn!("core: could not save settings: {:#}", e);
        }
    }
}

fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Load { .. } => "load",
        Command::Save { .. } => "save",
        Command::Add { .. } => "add",
        Command::Update { .. } => "update",
        Command::Delete { .. } => "delete",
        Command::Play { .. } => "play",
        Command::Stop => "stop",
        Command::Check { .. } => "check",
        Command::CheckAll => "check-all",
        Command::CancelCheck => "cancel-check",
    }
}

/// Resolve `path` against the working directory so a remembered file can be
/// found again later. Falls back to the path as given.
async fn absolute(path: PathBuf) -> PathBuf {
    match tokio::fs::canonicalize(&path).await {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!("core: could not resolve {:?}: {}", path, e);
            path
        }
    }
}

/// Build a core around `engine` and run it on a background task.
pub fn spawn(
    check: &CheckConfig,
    engine: Arc<dyn PlaybackEngine>,
    state_manager: Arc<StateManager>,
    events: broadcast::Sender<Event>,
) -> anyhow::Result<(CoreHandle, tokio::task::JoinHandle<anyhow::Result<()>>)> {
    let (tx, rx) = mpsc::channel::<CoreEvent>(256);
    let core = StreamCore::new(
        check,
        engine,
        Arc::clone(&state_manager),
        events.clone(),
        tx.clone(),
    )?;
    let task = tokio::spawn(core.run(rx));
    Ok((CoreHandle::new(tx, state_manager, events), task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::testutil::{fast_check_config, StreamServer};
    use livestream_proto::protocol::PlaybackPhase;
    use livestream_proto::record::StreamRecord;
    use std::time::Duration;

    struct Harness {
        handle: CoreHandle,
        task: tokio::task::JoinHandle<anyhow::Result<()>>,
        engine: Arc<FakeEngine>,
        dir: tempfile::TempDir,
    }

    fn harness_with(engine: FakeEngine, check: CheckConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateManager::new(dir.path().join("state.json")));
        let (events, _) = broadcast::channel(256);
        let engine = Arc::new(engine);
        let (handle, task) = spawn(
            &check,
            Arc::clone(&engine) as Arc<dyn PlaybackEngine>,
            state,
            events,
        )
        .unwrap();
        Harness {
            handle,
            task,
            engine,
            dir,
        }
    }

    fn harness(engine: FakeEngine) -> Harness {
        harness_with(engine, fast_check_config())
    }

    fn record(url: impl Into<String>, name: &str) -> StreamRecord {
        StreamRecord::new(url, name, "Talk", "English", "128")
    }

    async fn add(h: &Harness, url: impl Into<String>, name: &str) {
        let reply = h
            .handle
            .request(Command::Add {
                record: record(url, name),
            })
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Added { .. }));
    }

    /// Wait for the first event matching `pred`, failing after five seconds.
    async fn wait_for(
        rx: &mut broadcast::Receiver<Event>,
        pred: impl Fn(&Event) -> bool,
    ) -> Event {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let evt = rx.recv().await.expect("event channel closed");
                if pred(&evt) {
                    return evt;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn batch_marks_each_stream_and_rejects_a_second_run() {
        let server = StreamServer::start().await;
        let h = harness(FakeEngine::instant());
        add(&h, server.url("/live"), "Working").await;
        add(&h, server.url("/stalled"), "Silent").await;
        add(&h, server.url("/missing"), "Gone").await;

        let mut events = h.handle.subscribe();
        assert_eq!(h.handle.request(Command::CheckAll).await.unwrap(), Reply::Started);
        assert!(matches!(
            h.handle.request(Command::CheckAll).await.unwrap(),
            Reply::Ignored { .. }
        ));
        assert!(h.handle.snapshot().await.check.is_some());

        let done = wait_for(&mut events, |e| matches!(e, Event::CheckFinished { .. })).await;
        assert!(matches!(
            done,
            Event::CheckFinished { completed: 3, total: 3, cancelled: false }
        ));

        let snap = h.handle.snapshot().await;
        assert_eq!(snap.statuses.get(&0), Some(&StreamStatus::Working));
        assert_eq!(snap.statuses.get(&1), Some(&StreamStatus::NotResponding));
        assert_eq!(snap.statuses.get(&2), Some(&StreamStatus::NotResponding));
        assert!(snap.check.is_none());
    }

    #[tokio::test]
    async fn cancelled_batch_reports_cancelled() {
        let server = StreamServer::start().await;
        let mut check = fast_check_config();
        check.concurrency = 1;
        let h = harness_with(FakeEngine::instant(), check);
        for i in 0..4 {
            add(&h, server.url("/stalled"), &format!("Silent {}", i)).await;
        }

        let mut events = h.handle.subscribe();
        h.handle.request(Command::CheckAll).await.unwrap();
        assert_eq!(h.handle.request(Command::CancelCheck).await.unwrap(), Reply::Done);

        match wait_for(&mut events, |e| matches!(e, Event::CheckFinished { .. })).await {
            Event::CheckFinished {
                completed,
                total,
                cancelled,
            } => {
                assert!(cancelled);
                assert_eq!(total, 4);
                assert!(completed < total);
            }
            _ => unreachable!(),
        }
        assert!(matches!(
            h.handle.request(Command::CancelCheck).await.unwrap(),
            Reply::Ignored { .. }
        ));
    }

    #[tokio::test]
    async fn empty_collection_has_nothing_to_test() {
        let h = harness(FakeEngine::instant());
        assert!(matches!(
            h.handle.request(Command::CheckAll).await,
            Err(StreamError::NoData(_))
        ));
    }

    #[tokio::test]
    async fn single_check_reports_result() {
        let server = StreamServer::start().await;
        let h = harness(FakeEngine::instant());
        add(&h, server.url("/missing"), "Gone").await;

        let mut events = h.handle.subscribe();
        assert_eq!(
            h.handle.request(Command::Check { index: Some(0) }).await.unwrap(),
            Reply::Started
        );
        let notice = wait_for(&mut events, |e| matches!(e, Event::Notice { .. })).await;
        assert!(matches!(
            notice,
            Event::Notice { category: NoticeCategory::CheckResult, ref message }
                if message == "The stream is not responding."
        ));
        assert_eq!(
            h.handle.snapshot().await.statuses.get(&0),
            Some(&StreamStatus::NotResponding)
        );
        assert!(matches!(
            h.handle.request(Command::Check { index: None }).await,
            Err(StreamError::NoSelection)
        ));
    }

    #[tokio::test]
    async fn stop_fences_a_slow_start() {
        let h = harness(FakeEngine::gated());
        add(&h, "http://a.example.com/live", "Alpha").await;

        assert_eq!(
            h.handle.request(Command::Play { index: Some(0) }).await.unwrap(),
            Reply::Started
        );
        assert_eq!(h.handle.snapshot().await.playback, PlaybackPhase::Starting);
        h.handle.request(Command::Stop).await.unwrap();

        h.engine.open_gate(1);
        assert!(h.engine.wait_released(1).await);

        let snap = h.handle.snapshot().await;
        assert_eq!(snap.current, None);
        assert!(snap.statuses.is_empty());
        assert_eq!(snap.playback, PlaybackPhase::Stopped);
    }

    #[tokio::test]
    async fn engine_unavailable_changes_nothing() {
        let h = harness(FakeEngine::unavailable());
        add(&h, "http://a.example.com/live", "Alpha").await;
        let before = h.handle.snapshot().await;

        assert!(matches!(
            h.handle.request(Command::Play { index: Some(0) }).await,
            Err(StreamError::EngineUnavailable(_))
        ));
        let after = h.handle.snapshot().await;
        assert_eq!(after.current, None);
        assert!(after.statuses.is_empty());
        assert_eq!(after.playback, PlaybackPhase::Stopped);
        assert_eq!(after.records, before.records);
        assert_eq!(h.engine.created(), 0);
    }

    #[tokio::test]
    async fn delete_remaps_the_playing_index() {
        let h = harness(FakeEngine::instant());
        add(&h, "http://a.example.com/live", "Alpha").await;
        add(&h, "http://b.example.com/live", "Bravo").await;
        add(&h, "http://c.example.com/live", "Charlie").await;

        let mut events = h.handle.subscribe();
        h.handle.request(Command::Play { index: Some(2) }).await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, Event::PlaybackChanged { current: Some(2) })
        })
        .await;

        h.handle.request(Command::Delete { index: 0 }).await.unwrap();
        let snap = h.handle.snapshot().await;
        assert_eq!(snap.current, Some(1));
        assert_eq!(snap.statuses.get(&1), Some(&StreamStatus::Playing));

        h.handle.request(Command::Delete { index: 1 }).await.unwrap();
        let snap = h.handle.snapshot().await;
        assert_eq!(snap.current, None);
        assert!(snap.statuses.is_empty());
        assert_eq!(snap.records.len(), 1);
        assert!(h.engine.wait_released(1).await);
    }

    #[tokio::test]
    async fn save_and_load_round_trip_with_backup() {
        let h = harness(FakeEngine::instant());
        let path = h.dir.path().join("live_streams.sii");
        let resolved = h.dir.path().canonicalize().unwrap().join("live_streams.sii");

        assert!(matches!(
            h.handle
                .request(Command::Save {
                    path: Some(path.clone()),
                    overwrite: false,
                    backup: false,
                })
                .await,
            Err(StreamError::NoData("No streams to save."))
        ));

        add(&h, "http://a.example.com/live", "Alpha").await;
        add(&h, "http://b.example.com/live", "Bravo").await;

        let saved = h
            .handle
            .request(Command::Save {
                path: Some(path.clone()),
                overwrite: false,
                backup: false,
            })
            .await
            .unwrap();
        assert_eq!(
            saved,
            Reply::Saved {
                path: resolved.clone(),
                backup: None
            }
        );

        assert!(matches!(
            h.handle
                .request(Command::Save {
                    path: None,
                    overwrite: false,
                    backup: false,
                })
                .await,
            Err(StreamError::FileExists(_))
        ));

        match h
            .handle
            .request(Command::Save {
                path: None,
                overwrite: true,
                backup: true,
            })
            .await
            .unwrap()
        {
            Reply::Saved {
                backup: Some(backup),
                ..
            } => assert!(backup.exists()),
            other => panic!("unexpected reply {:?}", other),
        }

        h.handle.request(Command::Delete { index: 0 }).await.unwrap();
        let loaded = h.handle.request(Command::Load { path: None }).await.unwrap();
        assert_eq!(
            loaded,
            Reply::Loaded {
                count: 2,
                path: resolved.clone()
            }
        );
        let snap = h.handle.snapshot().await;
        assert_eq!(snap.records[0].name, "Alpha");
        assert_eq!(snap.file_path.as_deref(), Some(resolved.as_path()));

        let settings = std::fs::read_to_string(h.dir.path().join("state.json")).unwrap();
        assert!(settings.contains("live_streams.sii"));
    }

    #[tokio::test]
    async fn save_names_the_first_invalid_stream() {
        let h = harness(FakeEngine::instant());
        let source = h.dir.path().join("broken.sii");
        let mut records = vec![
            record("http://a.example.com/live", "Alpha"),
            record("http://b.example.com/live", "Bravo"),
        ];
        records[1].bitrate = "fast".to_string();
        std::fs::write(&source, sii::serialize(&records)).unwrap();

        h.handle
            .request(Command::Load {
                path: Some(source.clone()),
            })
            .await
            .unwrap();
        let err = h
            .handle
            .request(Command::Save {
                path: Some(h.dir.path().join("out.sii")),
                overwrite: false,
                backup: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Error in stream 2: Bitrate must be a number.");
        assert!(!h.dir.path().join("out.sii").exists());
    }

    #[tokio::test]
    async fn missing_file_leaves_state_alone() {
        let h = harness(FakeEngine::instant());
        add(&h, "http://a.example.com/live", "Alpha").await;

        let err = h
            .handle
            .request(Command::Load {
                path: Some(h.dir.path().join("nope.sii")),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Persistence { .. }));
        assert_eq!(h.handle.snapshot().await.records.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_releases_the_playing_session() {
        let h = harness(FakeEngine::instant());
        add(&h, "http://a.example.com/live", "Alpha").await;

        let mut events = h.handle.subscribe();
        h.handle.request(Command::Play { index: Some(0) }).await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, Event::PlaybackChanged { current: Some(0) })
        })
        .await;

        h.handle.shutdown().await;
        h.task.await.unwrap().unwrap();
        assert_eq!(h.engine.released(), 1);
        assert!(matches!(
            h.handle.request(Command::Stop).await,
            Err(StreamError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn remembered_file_is_stored_resolved() {
        let h = harness(FakeEngine::instant());
        std::fs::create_dir(h.dir.path().join("sub")).unwrap();
        add(&h, "http://a.example.com/live", "Alpha").await;

        let roundabout = h.dir.path().join("sub").join("..").join("live_streams.sii");
        let resolved = h.dir.path().canonicalize().unwrap().join("live_streams.sii");
        match h
            .handle
            .request(Command::Save {
                path: Some(roundabout),
                overwrite: false,
                backup: false,
            })
            .await
            .unwrap()
        {
            Reply::Saved { path, .. } => assert_eq!(path, resolved),
            other => panic!("unexpected reply {:?}", other),
        }

        let state = StateManager::new(h.dir.path().join("state.json"));
        let settings = state.load_persistent();
        assert_eq!(settings.last_file.as_deref(), Some(resolved.as_path()));
        assert!(settings.last_file.unwrap().is_absolute());
    }

    #[tokio::test]
    async fn url_edit_of_the_playing_stream_stops_it() {
        let h = harness(FakeEngine::instant());
        add(&h, "http://a.example.com/live", "Alpha").await;

        let mut events = h.handle.subscribe();
        h.handle.request(Command::Play { index: Some(0) }).await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, Event::PlaybackChanged { current: Some(0) })
        })
        .await;

        // Same URL: the session and its label stay.
        h.handle
            .request(Command::Update {
                index: 0,
                record: record("http://a.example.com/live", "Alpha FM"),
            })
            .await
            .unwrap();
        let snap = h.handle.snapshot().await;
        assert_eq!(snap.current, Some(0));
        assert_eq!(snap.statuses.get(&0), Some(&StreamStatus::Playing));

        // An invalid edit is rejected before anything is stopped.
        assert!(matches!(
            h.handle
                .request(Command::Update {
                    index: 0,
                    record: record("not a url", "Alpha FM"),
                })
                .await,
            Err(StreamError::Validation { .. })
        ));
        assert_eq!(h.handle.snapshot().await.current, Some(0));

        h.handle
            .request(Command::Update {
                index: 0,
                record: record("http://a2.example.com/live", "Alpha FM"),
            })
            .await
            .unwrap();
        let snap = h.handle.snapshot().await;
        assert_eq!(snap.current, None);
        assert_eq!(snap.playback, PlaybackPhase::Stopped);
        assert!(snap.statuses.is_empty());
        assert_eq!(snap.records[0].url, "http://a2.example.com/live");
        assert!(h.engine.wait_released(1).await);
    }

    #[tokio::test]
    async fn shutdown_waits_for_a_start_in_flight() {
        let h = harness(FakeEngine::gated());
        add(&h, "http://a.example.com/live", "Alpha").await;

        h.handle.request(Command::Play { index: Some(0) }).await.unwrap();
        let engine = Arc::clone(&h.engine);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            engine.open_gate(1);
        });

        h.handle.shutdown().await;
        h.task.await.unwrap().unwrap();
        assert_eq!(h.engine.created(), 1);
        assert_eq!(h.engine.released(), 1);
    }
}
