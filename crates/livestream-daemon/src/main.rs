mod batch;
mod core;
mod engine;
mod http;
mod mpv;
mod playback;
mod probe;
#[cfg(test)]
mod testutil;

use std::sync::Arc;

use livestream_proto::config::Config;
use livestream_proto::protocol::Event;
use livestream_proto::state::StateManager;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::engine::PlaybackEngine;

/// Forwards WARN and ERROR log lines to the event sink as `Event::Log`.
struct BroadcastLayer {
    sender: broadcast::Sender<Event>,
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        event.record(&mut MessageVisitor(&mut message));

        // Nobody listening is fine.
        let _ = self.sender.send(Event::Log { message });
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    // The event sink exists before logging so warnings reach clients too.
    let (events_tx, _) = broadcast::channel::<Event>(256);

    let log_path = config.daemon.log_file.clone();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false),
        )
        .with(BroadcastLayer {
            sender: events_tx.clone(),
        })
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,livestream_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);
    info!("Config loaded from: {:?}", Config::config_path());

    let engine = mpv::MpvEngine::new(&config.player);
    if let Err(reason) = engine.check_available() {
        warn!("Playback disabled until mpv is installed: {}", reason);
    }

    let state_manager = Arc::new(StateManager::new(config.daemon.state_file.clone()));
    let (core, core_task) = core::spawn(
        &config.check,
        Arc::new(engine),
        state_manager,
        events_tx,
    )?;

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            core.clone(),
        );
    }

    info!("Daemon initialised, running event loop");

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                core.shutdown().await;
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    core_task.await??;
    info!("Daemon exited cleanly");
    Ok(())
}
