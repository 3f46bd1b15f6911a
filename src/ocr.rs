//! Text recognition via an external `tesseract` process.
//! The crop is piped in as PNG and the recognized text read back from
//! stdout, bounded by a timeout so a wedged recognizer cannot stall the
//! poll loop. Recognition problems are recoverable; callers treat them as
//! "no text found".

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbaImage};
use wait_timeout::ChildExt;

use crate::helper;

const RECOGNIZER_BINARY: &str = "tesseract";
const RECOGNIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Extracts freeform text from a pixel crop.
pub trait TextReader {
    fn read_text(&self, image: &RgbaImage) -> Result<String>;
}

pub struct TesseractReader {
    binary: PathBuf,
}

impl TesseractReader {
    /// Finds the recognizer on the search path, falling back to a direct
    /// version probe. `None` means text recognition is unavailable.
    pub fn locate() -> Option<Self> {
        if let Some(binary) = helper::search_path(RECOGNIZER_BINARY) {
            return Some(Self { binary });
        }
        let direct = PathBuf::from(helper::exe_name(RECOGNIZER_BINARY));
        if helper::probe_version(&direct) {
            return Some(Self { binary: direct });
        }
        None
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl TextReader for TesseractReader {
    fn read_text(&self, image: &RgbaImage) -> Result<String> {
        let png = encode_png(image)?;

        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to start recognizer {}", self.binary.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&png)
                .context("failed to stream crop to recognizer")?;
        }

        match child
            .wait_timeout(RECOGNIZE_TIMEOUT)
            .context("failed to wait for recognizer")?
        {
            Some(status) if status.success() => {}
            Some(status) => bail!("recognizer exited with status {status}"),
            None => {
                child.kill().ok();
                child.wait().ok();
                bail!("recognizer timed out after {RECOGNIZE_TIMEOUT:?}");
            }
        }

        let output = child
            .wait_with_output()
            .context("failed to read recognizer output")?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer)
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgba8,
        )
        .context("failed to encode crop as PNG")?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_recognizer_binary_is_an_error() {
        let reader = TesseractReader {
            binary: PathBuf::from("definitely-not-a-recognizer-3141"),
        };
        let crop = RgbaImage::new(4, 4);
        assert!(reader.read_text(&crop).is_err());
    }

    #[test]
    fn encode_png_produces_a_png_header() {
        let crop = RgbaImage::new(8, 8);
        let bytes = encode_png(&crop).unwrap();
        assert_eq!(&bytes[..4], b"\x89PNG");
    }

    #[test]
    #[ignore = "requires tesseract installed"]
    fn recognizes_with_real_binary() {
        let reader = TesseractReader::locate().expect("tesseract not found");
        let crop = RgbaImage::from_pixel(120, 40, image::Rgba([255, 255, 255, 255]));
        // A blank crop recognizes as empty text; this exercises the
        // subprocess path end to end.
        let text = reader.read_text(&crop).unwrap();
        assert!(text.trim().is_empty());
    }
}
