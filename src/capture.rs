//! Screen capture and capture-directory artifacts.
//! Uses `xcap` for cross-platform screenshots of the primary display. The
//! captures directory is rewritten wholesale each iteration; nothing in it
//! outlives a poll cycle.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use image::{RgbaImage, imageops};
use xcap::Monitor;

use crate::detect::Region;
use crate::filter::Capture;

/// Captures the full screenshot of the primary monitor.
/// Permissions note: on macOS, grant "Screen & System Audio Recording"
/// permission to the terminal in System Settings > Privacy & Security.
pub fn capture_screen() -> Result<RgbaImage> {
    let monitors = Monitor::all().context("Failed to enumerate monitors")?;
    let primary = monitors.first().context("No monitors found")?;

    let screenshot = primary.capture_image().context(
        "Failed to capture screen. On macOS, ensure the terminal has Screen Recording permission",
    )?;
    if screenshot.width() == 0 || screenshot.height() == 0 {
        bail!("Captured empty screenshot - possible permission issue or no display");
    }
    Ok(screenshot)
}

/// Fresh capture of a single region, clamped to the current screen bounds.
pub fn recapture_region(region: &Region) -> Result<RgbaImage> {
    let screen = capture_screen()?;
    let clamped = region
        .clamped_to(screen.width(), screen.height())
        .context("region lies outside the screen")?;
    Ok(imageops::crop_imm(&screen, clamped.x, clamped.y, clamped.width, clamped.height).to_image())
}

/// Clears the previous iteration's artifacts. A locked directory degrades to
/// per-file deletion; residual failures are warnings, not errors.
pub fn clear_captures_dir(dir: &Path) {
    if dir.exists() {
        if let Err(err) = fs::remove_dir_all(dir) {
            eprintln!("captures directory locked ({err}), clearing files individually...");
            if let Ok(entries) = fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_file() {
                        if let Err(err) = fs::remove_file(&path) {
                            eprintln!("warning: could not clear {}: {err}", path.display());
                        }
                    }
                }
            }
        }
    }
    if let Err(err) = fs::create_dir_all(dir) {
        eprintln!("warning: could not recreate captures directory: {err}");
    }
}

/// Persists captures as `capture_<index>.png`, zero-padded detection order.
pub fn save_captures(dir: &Path, captures: &[Capture]) -> Result<usize> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create captures directory {}", dir.display()))?;
    for capture in captures {
        let filename = dir.join(format!("capture_{:04}.png", capture.index));
        capture
            .image
            .save(&filename)
            .with_context(|| format!("Failed to save capture to {}", filename.display()))?;
    }
    Ok(captures.len())
}

/// Debug artifact written after an unresolved click, named by timestamp.
pub fn save_failure_snapshot(dir: &Path, region: &Region, image: &RgbaImage) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create captures directory {}", dir.display()))?;
    let name = format!(
        "failed_click_{}_{}x{}.png",
        chrono::Local::now().format("%Y%m%d_%H%M%S"),
        region.x,
        region.y
    );
    let path = dir.join(name);
    image
        .save(&path)
        .with_context(|| format!("Failed to save failure snapshot to {}", path.display()))?;
    Ok(path)
}
