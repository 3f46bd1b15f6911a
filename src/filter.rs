//! Size and text filtering of detected regions.
//! Only plausibly button-sized boxes reach the recognizer; the text gate
//! keeps boxes whose extracted text contains one of the configured phrases.

use image::{RgbaImage, imageops};

use crate::detect::Region;
use crate::ocr::TextReader;

// Plausible button dimensions, exclusive bounds. Boxes outside the window
// never incur recognition cost.
const MIN_WIDTH: u32 = 60;
const MAX_WIDTH: u32 = 200;
const MIN_HEIGHT: u32 = 20;
const MAX_HEIGHT: u32 = 50;

/// A region that passed every filter, with its pixel snapshot and the
/// position it held in the detector's output.
pub struct Capture {
    pub region: Region,
    pub image: RgbaImage,
    pub index: usize,
}

pub struct AffordanceFilter<'a> {
    reader: Option<&'a dyn TextReader>,
    phrases: Vec<String>,
    debug: bool,
}

impl<'a> AffordanceFilter<'a> {
    /// `reader: None` disables text recognition; the size gate then decides
    /// alone.
    pub fn new(reader: Option<&'a dyn TextReader>, phrases: &[String], debug: bool) -> Self {
        Self {
            reader,
            phrases: phrases.iter().map(|phrase| phrase.to_lowercase()).collect(),
            debug,
        }
    }

    /// Clamps each region to the image, applies the size gate, then the text
    /// gate. Output preserves the input index so captures stay correlated
    /// with their detection order.
    pub fn filter(&self, screen: &RgbaImage, regions: &[Region]) -> Vec<Capture> {
        let mut captures = Vec::new();
        for (index, region) in regions.iter().enumerate() {
            let Some(region) = region.clamped_to(screen.width(), screen.height()) else {
                continue;
            };
            if !size_gated(&region) {
                if self.debug {
                    println!(
                        "  [{index}] {}x{} outside size window, skipped",
                        region.width, region.height
                    );
                }
                continue;
            }
            let crop =
                imageops::crop_imm(screen, region.x, region.y, region.width, region.height)
                    .to_image();
            if self.contains_target_text(&crop) {
                if self.debug {
                    println!("  [{index}] size and text checks passed, will be stored");
                }
                captures.push(Capture { region, image: crop, index });
            } else if self.debug {
                println!("  [{index}] text check failed");
            }
        }
        captures
    }

    /// Text gate: the lower-cased recognizer output must contain one of the
    /// configured phrases. Recognizer failures count as "no text".
    pub fn contains_target_text(&self, crop: &RgbaImage) -> bool {
        let Some(reader) = self.reader else {
            return true;
        };
        match reader.read_text(crop) {
            Ok(text) => {
                let text = text.to_lowercase();
                let matched = self.phrases.iter().any(|phrase| text.contains(phrase));
                if self.debug {
                    println!("    extracted {:?}, matched: {matched}", text.trim());
                }
                matched
            }
            Err(err) => {
                if self.debug {
                    println!("    text recognition failed: {err:#}");
                }
                false
            }
        }
    }
}

fn size_gated(region: &Region) -> bool {
    region.width > MIN_WIDTH
        && region.width < MAX_WIDTH
        && region.height > MIN_HEIGHT
        && region.height < MAX_HEIGHT
}
