//! # Image Handles
//!
//! Opaque, cheaply clonable image values passed through the filter chain.
//! Every freshly produced image gets a unique [`ImageId`]; clones share it,
//! which is what the output cache and region memo key on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

/// Identity of an image handle (shared by clones)
pub type ImageId = u64;

// ============================================================================
// Geometry
// ============================================================================

/// A point in image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle in image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Pixel extent of an image (origin is always 0,0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn center(&self) -> Point {
        Point::new(self.width as f32 / 2.0, self.height as f32 / 2.0)
    }

    /// Half the shorter side, used as the default radius for distance parameters
    pub fn radius(&self) -> f32 {
        self.width.min(self.height) as f32 / 2.0
    }

    pub fn rect(&self) -> Rect {
        Rect {
            x: 0.0,
            y: 0.0,
            width: self.width as f32,
            height: self.height as f32,
        }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height
    }
}

// ============================================================================
// Image
// ============================================================================

static IMAGE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque image handle backed by a shared RGBA raster
#[derive(Clone)]
pub struct Image {
    id: ImageId,
    pixels: Arc<RgbaImage>,
}

impl Image {
    /// Wrap a raster, assigning a new identity
    pub fn new(pixels: RgbaImage) -> Self {
        Self {
            id: IMAGE_COUNTER.fetch_add(1, Ordering::Relaxed),
            pixels: Arc::new(pixels),
        }
    }

    /// Image of the given size filled with one colour
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self::new(RgbaImage::from_pixel(width, height, Rgba(rgba)))
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.pixels.width(), self.pixels.height())
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// True when both handles refer to the same produced image
    pub fn same_handle(&self, other: &Image) -> bool {
        self.id == other.id
    }

    /// Produce a new image by mapping every pixel
    pub fn map_pixels(&self, mut f: impl FnMut(Rgba<u8>) -> Rgba<u8>) -> Image {
        let mut out = (*self.pixels).clone();
        for pixel in out.pixels_mut() {
            *pixel = f(*pixel);
        }
        Image::new(out)
    }
}

impl PartialEq for Image {
    /// Value equality: same handle, or identical pixels
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id || *self.pixels == *other.pixels
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let extent = self.extent();
        f.debug_struct("Image")
            .field("id", &self.id)
            .field("width", &extent.width)
            .field("height", &extent.height)
            .finish()
    }
}
