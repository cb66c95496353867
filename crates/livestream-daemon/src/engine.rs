/// Playback engine abstraction.
///
/// The core never talks to a player directly: it asks a `PlaybackEngine` for
/// a fresh `EngineInstance` per session and drives it through
/// open → play → stop → release. `release` consumes the instance, so a handle
/// can only ever be released once.
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait PlaybackEngine: Send + Sync {
    /// `Err(reason)` when the engine cannot be loaded at all (binary missing).
    fn check_available(&self) -> Result<(), String>;

    async fn create_instance(&self) -> anyhow::Result<Box<dyn EngineInstance>>;
}

#[async_trait]
pub trait EngineInstance: Send {
    async fn open_media(&mut self, url: &str) -> anyhow::Result<()>;
    async fn play(&mut self) -> anyhow::Result<()>;
    async fn stop(&mut self) -> anyhow::Result<()>;
    async fn release(self: Box<Self>) -> anyhow::Result<()>;
}

/// Bring up one session: instance, media, play. On failure the partially
/// built instance is released before the error is returned.
pub async fn start_session(
    engine: &dyn PlaybackEngine,
    url: &str,
) -> anyhow::Result<Box<dyn EngineInstance>> {
    let mut instance = engine.create_instance().await?;
    let started = async {
        instance.open_media(url).await?;
        instance.play().await
    }
    .await;

    match started {
        Ok(()) => Ok(instance),
        Err(e) => {
            teardown(instance).await;
            Err(e)
        }
    }
}

/// Stop and release, swallowing engine errors.
pub async fn teardown(mut instance: Box<dyn EngineInstance>) {
    if let Err(e) = instance.stop().await {
        debug!("engine: stop during teardown failed: {:#}", e);
    }
    if let Err(e) = instance.release().await {
        debug!("engine: release failed: {:#}", e);
    }
}
