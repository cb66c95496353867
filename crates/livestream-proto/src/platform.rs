use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const APP_DIR: &str = "livestream";

/// Per-process counter so concurrent player instances never share an IPC endpoint.
static NEXT_PLAYER_SOCKET: AtomicU64 = AtomicU64::new(1);

pub fn data_dir() -> PathBuf {
    // ~/.local/share/livestream on every unix, including macOS
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

/// A fresh IPC endpoint name for one player instance.
#[cfg(unix)]
pub fn next_player_socket() -> String {
    let n = NEXT_PLAYER_SOCKET.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}/livestream-mpv-{}-{}.sock",
        std::env::temp_dir().display(),
        std::process::id(),
        n
    )
}

#[cfg(windows)]
pub fn next_player_socket() -> String {
    let n = NEXT_PLAYER_SOCKET.fetch_add(1, Ordering::Relaxed);
    format!(r"\\.\pipe\livestream-mpv-{}-{}", std::process::id(), n)
}

#[cfg(unix)]
fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

/// Locate the mpv binary used as the playback engine.
///
/// An explicit override wins when it exists; otherwise the directory of the
/// current executable is tried before `PATH`.
pub fn find_mpv_binary(override_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = override_path {
        return p.exists().then(|| p.to_path_buf());
    }

    let exe_name = mpv_binary_name();
    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(dir) = current_exe.parent() {
            let local_mpv = dir.join(exe_name);
            if local_mpv.exists() {
                return Some(local_mpv);
            }
        }
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(exe_name))
        .find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_sockets_are_unique() {
        let a = next_player_socket();
        let b = next_player_socket();
        assert_ne!(a, b);
        assert!(a.contains("livestream-mpv"));
    }

    #[test]
    fn missing_override_is_not_found() {
        let missing = Path::new("/definitely/not/here/mpv");
        assert!(find_mpv_binary(Some(missing)).is_none());
    }

    #[test]
    fn dirs_are_namespaced() {
        assert!(data_dir().ends_with(APP_DIR));
        assert!(config_dir().ends_with(APP_DIR));
    }
}
