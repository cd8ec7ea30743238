//! # Region Composition
//!
//! CPU-side composition steps the engine owns itself: confining an
//! adjusted image to detected face regions, and dissolving a filtered
//! image into its input by an intensity.

use image::{GrayImage, Luma, Rgba, RgbaImage};

use crate::error::{FilterError, Result};
use crate::picture::{Extent, Image, Point};
use crate::regions::FeatureRegion;

const MASK_ON: u8 = 255;

/// Outcome of a masked composition
#[derive(Debug, Clone, PartialEq)]
pub enum Composition {
    /// Adjusted pixels inside the mask, base pixels elsewhere
    Masked(Image),
    /// No regions were supplied; carries the base image unchanged
    NoFeaturesFound(Image),
}

impl Composition {
    pub fn is_masked(&self) -> bool {
        matches!(self, Self::Masked(_))
    }

    pub fn into_image(self) -> Image {
        match self {
            Self::Masked(img) | Self::NoFeaturesFound(img) => img,
        }
    }

    pub fn into_result(self) -> Result<Image> {
        match self {
            Self::Masked(img) => Ok(img),
            Self::NoFeaturesFound(_) => Err(FilterError::NoFeaturesFound),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MaskedRegionComposer;

impl MaskedRegionComposer {
    pub fn new() -> Self {
        Self
    }

    /// Union every region polygon into one mask and select `adjusted`
    /// inside it, `base` outside
    pub fn compose(&self, adjusted: &Image, base: &Image, regions: &[FeatureRegion]) -> Composition {
        if regions.is_empty() {
            tracing::debug!("No feature regions, leaving image {} unchanged", base.id());
            return Composition::NoFeaturesFound(base.clone());
        }

        let mask = self.mask(base.extent(), regions);
        let base_px = base.pixels();
        let adjusted_px = adjusted.pixels();
        let adjusted_extent = adjusted.extent();

        let out = RgbaImage::from_fn(base_px.width(), base_px.height(), |x, y| {
            if mask.get_pixel(x, y).0[0] == MASK_ON && adjusted_extent.contains(x, y) {
                *adjusted_px.get_pixel(x, y)
            } else {
                *base_px.get_pixel(x, y)
            }
        });
        Composition::Masked(Image::new(out))
    }

    /// Compound mask (white = affected) over `extent`
    pub fn mask(&self, extent: Extent, regions: &[FeatureRegion]) -> GrayImage {
        let polygons: Vec<&Vec<Point>> = regions
            .iter()
            .flat_map(|r| r.polygons.iter())
            .filter(|p| p.len() >= 3)
            .collect();

        GrayImage::from_fn(extent.width, extent.height, |x, y| {
            let centre = Point::new(x as f32 + 0.5, y as f32 + 0.5);
            if polygons.iter().any(|poly| contains(poly, centre)) {
                Luma([MASK_ON])
            } else {
                Luma([0])
            }
        })
    }
}

/// Even-odd point-in-polygon test
fn contains(polygon: &[Point], p: Point) -> bool {
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (a, b) = (polygon[i], polygon[j]);
        if (a.y > p.y) != (b.y > p.y) && p.x < (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Per-pixel mix of `base` toward `overlay` by `t`. Images of different
/// extents cannot be mixed, so `overlay` is returned as is.
pub fn dissolve(base: &Image, overlay: &Image, t: f32) -> Image {
    if base.extent() != overlay.extent() {
        tracing::warn!(
            "Cannot dissolve {:?} into {:?}, using filtered image",
            overlay.extent(),
            base.extent()
        );
        return overlay.clone();
    }
    let t = t.clamp(0.0, 1.0);
    let base_px = base.pixels();
    let overlay_px = overlay.pixels();
    let out = RgbaImage::from_fn(base_px.width(), base_px.height(), |x, y| {
        let a = base_px.get_pixel(x, y).0;
        let b = overlay_px.get_pixel(x, y).0;
        let mut px = [0u8; 4];
        for c in 0..4 {
            let mixed = a[c] as f32 + (b[c] as f32 - a[c] as f32) * t;
            px[c] = mixed.round().clamp(0.0, 255.0) as u8;
        }
        Rgba(px)
    });
    Image::new(out)
}
