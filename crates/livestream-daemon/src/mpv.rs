/// mpv-backed playback engine.
///
/// Every `EngineInstance` is its own `mpv --idle` child process with a
/// private JSON IPC endpoint, so a stale session can be torn down without
/// touching the one that replaced it.
///
/// ```text
///   MpvInstance
///         ├── child process   (mpv --idle --input-ipc-server=<socket>)
///         └── ipc_task        ← requests via mpsc, serialised → socket
///                             ← JSON lines from socket
///                                 ├── response (request_id) → oneshot reply
///                                 └── event                 → logged, dropped
/// ```
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use livestream_proto::config::PlayerConfig;
use livestream_proto::platform;

use crate::engine::{EngineInstance, PlaybackEngine};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

const IPC_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_WAIT_ATTEMPTS: usize = 50;
const SOCKET_WAIT_STEP: Duration = Duration::from_millis(100);

type Reply = oneshot::Sender<anyhow::Result<Value>>;

struct IpcRequest {
    req_id: u64,
    line: String,
    reply: Reply,
}

/// Cloneable sender side of one instance's IPC connection.
#[derive(Clone)]
struct MpvIpc {
    tx: mpsc::Sender<IpcRequest>,
}

impl MpvIpc {
    fn connect<S>(stream: S, label: String) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(ipc_task(stream, rx, label));
        Self { tx }
    }

    async fn command(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&json!({ "command": command, "request_id": req_id }))?;
        line.push('\n');

        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(IpcRequest {
                req_id,
                line,
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv ipc task gone"))?;

        tokio::time::timeout(IPC_REPLY_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }
}

/// Owns both halves of the connection and the table of outstanding requests.
async fn ipc_task<S>(stream: S, mut rx: mpsc::Receiver<IpcRequest>, label: String)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();
    let mut pending: HashMap<u64, Reply> = HashMap::new();

    let reason = loop {
        tokio::select! {
            req = rx.recv() => {
                let Some(req) = req else { break "handle dropped".to_string() };
                if let Err(e) = write_half.write_all(req.line.as_bytes()).await {
                    let _ = req.reply.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
                    break format!("write error: {}", e);
                }
                debug!("mpv[{}]: sent req={} {}", label, req.req_id, req.line.trim());
                pending.insert(req.req_id, req.reply);
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => route_line(&label, line.trim(), &mut pending),
                    Ok(None) => break "connection closed".to_string(),
                    Err(e) => break format!("read error: {}", e),
                }
            }
        }
    };

    debug!("mpv[{}]: ipc task exiting ({})", label, reason);
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(anyhow::anyhow!("mpv IPC {}", reason)));
    }
}

fn route_line(label: &str, line: &str, pending: &mut HashMap<u64, Reply>) {
    if line.is_empty() {
        return;
    }
    let val: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!("mpv[{}]: invalid json '{}': {}", label, line, e);
            return;
        }
    };

    let Some(req_id) = val.get("request_id").and_then(Value::as_u64) else {
        if val.get("event").and_then(Value::as_str) == Some("end-file")
            && val.get("reason").and_then(Value::as_str) == Some("error")
        {
            warn!("mpv[{}]: stream ended with error: {}", label, line);
        } else {
            debug!("mpv[{}]: event {}", label, line);
        }
        return;
    };

    match pending.remove(&req_id) {
        Some(reply) => {
            let result = match val.get("error").and_then(Value::as_str) {
                Some("success") => Ok(val),
                other => Err(anyhow::anyhow!(
                    "mpv error: {}",
                    other.unwrap_or("unknown error")
                )),
            };
            let _ = reply.send(result);
        }
        None => debug!("mpv[{}]: response for unknown req={}", label, req_id),
    }
}

// ── engine ────────────────────────────────────────────────────────────────────

pub struct MpvEngine {
    binary: Option<PathBuf>,
    volume: f32,
}

impl MpvEngine {
    pub fn new(config: &PlayerConfig) -> Self {
        Self {
            binary: config.mpv_binary.clone(),
            volume: config.volume,
        }
    }

    fn binary(&self) -> anyhow::Result<PathBuf> {
        platform::find_mpv_binary(self.binary.as_deref())
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))
    }
}

#[async_trait]
impl PlaybackEngine for MpvEngine {
    fn check_available(&self) -> Result<(), String> {
        self.binary().map(|_| ()).map_err(|e| e.to_string())
    }

    async fn create_instance(&self) -> anyhow::Result<Box<dyn EngineInstance>> {
        let binary = self.binary()?;
        let socket = platform::next_player_socket();
        info!("mpv: spawning instance on {}", socket);

        let mut child = tokio::process::Command::new(binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--quiet")
            .arg(format!("--input-ipc-server={}", socket))
            .arg(format!(
                "--volume={}",
                (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
            ))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let ipc = match connect_ipc(&socket).await {
            Ok(ipc) => ipc,
            Err(e) => {
                let _ = child.kill().await;
                remove_socket(&socket).await;
                return Err(e);
            }
        };

        Ok(Box::new(MpvInstance { child, ipc, socket }))
    }
}

#[cfg(unix)]
async fn connect_ipc(socket: &str) -> anyhow::Result<MpvIpc> {
    let path = std::path::Path::new(socket);
    for _ in 0..SOCKET_WAIT_ATTEMPTS {
        tokio::time::sleep(SOCKET_WAIT_STEP).await;
        if path.exists() {
            if let Ok(stream) = tokio::net::UnixStream::connect(path).await {
                debug!("mpv: connected to {}", socket);
                return Ok(MpvIpc::connect(stream, socket.to_string()));
            }
        }
    }
    anyhow::bail!("mpv IPC socket {} did not appear", socket)
}

#[cfg(windows)]
async fn connect_ipc(socket: &str) -> anyhow::Result<MpvIpc> {
    use tokio::net::windows::named_pipe::ClientOptions;
    for _ in 0..SOCKET_WAIT_ATTEMPTS {
        tokio::time::sleep(SOCKET_WAIT_STEP).await;
        if let Ok(pipe) = ClientOptions::new().open(socket) {
            debug!("mpv: connected to {}", socket);
            return Ok(MpvIpc::connect(pipe, socket.to_string()));
        }
    }
    anyhow::bail!("mpv named pipe {} did not appear", socket)
}

#[cfg(unix)]
async fn remove_socket(socket: &str) {
    let _ = tokio::fs::remove_file(socket).await;
}

#[cfg(windows)]
async fn remove_socket(_socket: &str) {}

struct MpvInstance {
    child: tokio::process::Child,
    ipc: MpvIpc,
    socket: String,
}

#[async_trait]
impl EngineInstance for MpvInstance {
    /// Loads paused so that `play` is the moment audio starts.
    async fn open_media(&mut self, url: &str) -> anyhow::Result<()> {
        self.ipc
            .command(json!(["set_property", "pause", true]))
            .await?;
        self.ipc.command(json!(["loadfile", url, "replace"])).await?;
        Ok(())
    }

    async fn play(&mut self) -> anyhow::Result<()> {
        self.ipc
            .command(json!(["set_property", "pause", false]))
            .await?;
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.ipc.command(json!(["stop"])).await?;
        Ok(())
    }

    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        let mut this = *self;
        if let Err(e) = this.ipc.command(json!(["quit"])).await {
            debug!("mpv[{}]: quit failed: {:#}", this.socket, e);
        }
        let killed = this.child.kill().await;
        remove_socket(&this.socket).await;
        info!("mpv: released instance {}", this.socket);
        killed.map_err(Into::into)
    }
}
