use std::path::PathBuf;

const APP_DIR: &str = "doorcam";

/// IPC endpoint name for one decoder instance.  Each instance gets its own
/// socket so a decoder being disposed never races a fresh one.
#[cfg(unix)]
pub fn mpv_socket_name(instance: u64) -> String {
    format!(
        "{}/doorcam-mpv-{}-{}.sock",
        std::env::temp_dir().display(),
        std::process::id(),
        instance
    )
}

#[cfg(windows)]
pub fn mpv_socket_name(instance: u64) -> String {
    format!("doorcam-mpv-{}-{}", std::process::id(), instance)
}

#[cfg(unix)]
pub fn mpv_socket_arg(socket_name: &str) -> String {
    format!("--input-ipc-server={}", socket_name)
}

#[cfg(windows)]
pub fn mpv_socket_arg(socket_name: &str) -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", socket_name)
}

pub fn data_dir() -> PathBuf {
    // ~/.local/share/doorcam on unix, regardless of platform conventions
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

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| p.exists())
}

/// Find the mpv binary used to decode the door feed.
///
/// Searches in order:
/// 1. `DOORCAM_MPV` environment variable
/// 2. `configured` (from `[decoder] mpv_path`)
/// 3. Beside the current executable
/// 4. PATH
pub fn find_mpv_binary(configured: Option<&PathBuf>) -> Option<PathBuf> {
    if let Ok(p) = std::env::var("DOORCAM_MPV") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
        tracing::warn!("DOORCAM_MPV={} does not exist, ignoring", path.display());
    }

    if let Some(path) = configured {
        if path.exists() {
            return Some(path.clone());
        }
        tracing::warn!("configured mpv_path {} does not exist", path.display());
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

    find_on_path(exe_name)
}
