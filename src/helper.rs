//! Discovery and invocation of the external click helper.
//! The helper is probed at fixed install locations first, then on the
//! executable search path, then by a direct version check. Absence is never
//! an error; clicking falls back to the virtual pointer.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use wait_timeout::ChildExt;

const HELPER_BINARY: &str = "AutoHotkey";
const HELPER_BINARY_V2: &str = "AutoHotkey2";
/// Click script handed to the helper together with the target coordinates.
const CLICK_SCRIPT: &str = "assets/click.ahk";
const INVOKE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Fixed installation paths probed before the search path. `{user}` expands
/// to the current user name.
const INSTALL_PATHS: &[&str] = &[
    r"C:\Program Files\AutoHotkey\AutoHotkey.exe",
    r"C:\Program Files (x86)\AutoHotkey\AutoHotkey.exe",
    r"C:\Users\{user}\AppData\Local\AutoHotkey\AutoHotkey.exe",
    r"C:\ProgramData\AutoHotkey\AutoHotkey.exe",
];

/// Locates the click helper: fixed install paths, then the search path,
/// then a direct version-check invocation.
pub fn find_click_helper() -> Option<PathBuf> {
    let user = std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_default();
    for install_path in INSTALL_PATHS {
        let path = PathBuf::from(install_path.replace("{user}", &user));
        if path.exists() {
            return Some(path);
        }
    }

    if let Some(path) = search_path(HELPER_BINARY) {
        return Some(path);
    }
    if let Some(path) = search_path(HELPER_BINARY_V2) {
        return Some(path);
    }

    // The OS may still resolve the bare name even when no PATH entry is
    // readable; a version probe settles it.
    let direct = PathBuf::from(exe_name(HELPER_BINARY));
    if probe_version(&direct) {
        return Some(direct);
    }
    None
}

/// Runs the helper's click script at the given screen position. The delay
/// is forwarded in milliseconds as the script's third positional argument.
pub fn click_at(helper: &Path, x: i32, y: i32, delay: Duration) -> Result<()> {
    let mut child = Command::new(helper)
        .arg(CLICK_SCRIPT)
        .arg(x.to_string())
        .arg(y.to_string())
        .arg(delay.as_millis().to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to invoke click helper {}", helper.display()))?;

    match child
        .wait_timeout(INVOKE_TIMEOUT)
        .context("failed to wait for click helper")?
    {
        Some(status) if status.success() => Ok(()),
        Some(status) => bail!("click helper exited with status {status}"),
        None => {
            child.kill().ok();
            child.wait().ok();
            bail!("click helper timed out after {INVOKE_TIMEOUT:?}");
        }
    }
}

/// Walks the executable search path for `name`.
pub(crate) fn search_path(name: &str) -> Option<PathBuf> {
    let exe = exe_name(name);
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(&exe))
        .find(|candidate| candidate.is_file())
}

/// Checks whether invoking `binary --version` succeeds within a short bound.
pub(crate) fn probe_version(binary: &Path) -> bool {
    let Ok(mut child) = Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    else {
        return false;
    };
    match child.wait_timeout(PROBE_TIMEOUT) {
        Ok(Some(status)) => status.success(),
        _ => {
            child.kill().ok();
            child.wait().ok();
            false
        }
    }
}

pub(crate) fn exe_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_never_panics() {
        // Result depends on the machine; only the probe ladder is exercised.
        let _ = find_click_helper();
    }

    #[test]
    fn probe_rejects_missing_binary() {
        assert!(!probe_version(Path::new("definitely-not-a-helper-2718")));
    }

    #[test]
    fn invoking_missing_helper_is_an_error() {
        let result = click_at(
            Path::new("definitely-not-a-helper-2718"),
            10,
            10,
            Duration::from_millis(1),
        );
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn search_path_finds_a_known_binary() {
        assert!(search_path("sh").is_some());
        assert!(search_path("definitely-not-a-helper-2718").is_none());
    }
}
