//! Color-based region detection.
//! Derives the reference color from a calibration image at startup, then
//! scans screenshots for connected patches of matching pixels and returns
//! their bounding boxes.

use std::path::{Path, PathBuf};

use image::{GrayImage, Luma, RgbaImage};
use imageproc::region_labelling::{Connectivity, connected_components};
use thiserror::Error;

/// Boxes at or below this edge length are treated as pixel noise.
const NOISE_FLOOR: u32 = 10;

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("reference image not found: {}", .0.display())]
    MissingReference(PathBuf),
    #[error("could not decode reference image: {}", .0.display())]
    InvalidReference(PathBuf),
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("screen image has no pixels")]
    InvalidImage,
}

/// Target color, averaged once from the reference image and fixed for the
/// process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceColor([u8; 3]);

impl ReferenceColor {
    /// Integer mean of every pixel, per RGB channel.
    pub fn from_image(image: &RgbaImage) -> Self {
        let count = u64::from(image.width()) * u64::from(image.height());
        if count == 0 {
            return Self([0; 3]);
        }
        let mut sums = [0u64; 3];
        for pixel in image.pixels() {
            for (sum, channel) in sums.iter_mut().zip(pixel.0) {
                *sum += u64::from(channel);
            }
        }
        Self(sums.map(|sum| (sum / count) as u8))
    }

    pub fn load(path: &Path) -> Result<Self, ReferenceError> {
        if !path.exists() {
            return Err(ReferenceError::MissingReference(path.to_path_buf()));
        }
        let image = image::open(path)
            .map_err(|_| ReferenceError::InvalidReference(path.to_path_buf()))?
            .to_rgba8();
        if image.width() == 0 || image.height() == 0 {
            return Err(ReferenceError::InvalidReference(path.to_path_buf()));
        }
        Ok(Self::from_image(&image))
    }

    pub fn channels(&self) -> [u8; 3] {
        self.0
    }
}

/// Axis-aligned bounding box in screen pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// Center point in screen coordinates.
    pub fn center(&self) -> (i32, i32) {
        ((self.x + self.width / 2) as i32, (self.y + self.height / 2) as i32)
    }

    /// Clamps the box to an image of the given dimensions. `None` when no
    /// part of the box lies inside the image.
    pub fn clamped_to(&self, image_width: u32, image_height: u32) -> Option<Region> {
        if self.x >= image_width || self.y >= image_height {
            return None;
        }
        let width = self.width.min(image_width - self.x);
        let height = self.height.min(image_height - self.y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(Region { x: self.x, y: self.y, width, height })
    }
}

/// Scans a screenshot for connected patches whose pixels all lie within
/// `tolerance` of the reference color on every channel. Boxes come back in
/// first-seen raster order, which downstream uses as the detection index.
pub fn detect(
    screen: &RgbaImage,
    reference: ReferenceColor,
    tolerance: u8,
) -> Result<Vec<Region>, DetectError> {
    if screen.width() == 0 || screen.height() == 0 {
        return Err(DetectError::InvalidImage);
    }

    let mask = inclusion_mask(screen, reference, tolerance);
    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    // Bounding box per component, indexed by label id (0 is background).
    let mut boxes: Vec<Option<(u32, u32, u32, u32)>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label.0[0] as usize;
        if label == 0 {
            continue;
        }
        if boxes.len() < label {
            boxes.resize(label, None);
        }
        match &mut boxes[label - 1] {
            Some((min_x, min_y, max_x, max_y)) => {
                *min_x = (*min_x).min(x);
                *min_y = (*min_y).min(y);
                *max_x = (*max_x).max(x);
                *max_y = (*max_y).max(y);
            }
            slot @ None => *slot = Some((x, y, x, y)),
        }
    }

    Ok(boxes
        .into_iter()
        .flatten()
        .map(|(min_x, min_y, max_x, max_y)| Region {
            x: min_x,
            y: min_y,
            width: max_x - min_x + 1,
            height: max_y - min_y + 1,
        })
        .filter(|region| region.width > NOISE_FLOOR && region.height > NOISE_FLOOR)
        .collect())
}

/// Per-pixel inclusion mask. The tolerance band saturates at the [0, 255]
/// channel boundaries.
fn inclusion_mask(screen: &RgbaImage, reference: ReferenceColor, tolerance: u8) -> GrayImage {
    let channels = reference.channels();
    let lower = channels.map(|c| c.saturating_sub(tolerance));
    let upper = channels.map(|c| c.saturating_add(tolerance));
    GrayImage::from_fn(screen.width(), screen.height(), |x, y| {
        let pixel = screen.get_pixel(x, y).0;
        let included = (0..3).all(|c| lower[c] <= pixel[c] && pixel[c] <= upper[c]);
        Luma([if included { 255 } else { 0 }])
    })
}
