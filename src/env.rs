use std::env;
use std::path::PathBuf;

/// Returns the root directory used by the patcher for its own state and installs.
pub fn default_app_dir() -> PathBuf {
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".local").join("share")),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join("launchpatch")
}

pub fn launcher_dir() -> PathBuf {
    default_app_dir().join("launcher")
}

pub fn game_dir() -> PathBuf {
    default_app_dir().join("game")
}

/// Manifests and resume markers live here, apart from the content they describe.
pub fn state_dir() -> PathBuf {
    default_app_dir().join("state")
}

/// Platform tag used in remote game paths, e.g. `linux-amd64`.
pub fn platform_tag() -> String {
    let os = if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else {
        "linux"
    };

    let arch = if cfg!(target_arch = "x86_64") {
        "amd64"
    } else if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        env::consts::ARCH
    };

    format!("{os}-{arch}")
}
