use std::num::NonZeroU32;

use image::{Rgba, RgbaImage};
use itertools::Itertools;
use ndarray::{ArrayD, ArrayView2, Axis, Ix2};

use crate::inference::DecoderOutput;

/// Overlay colour of selected pixels
pub const MASK_COLOR: Rgba<u8> = Rgba([0, 114, 189, 255]);

/// Run of selected pixels within one image row, as offsets into the flattened image
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PixelRange {
    start: u32,
    end: u32,
}

impl PixelRange {
    pub fn new(start: u32, length: NonZeroU32) -> Self {
        Self {
            start,
            end: start + length.get(),
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn length(&self) -> u32 {
        self.end - self.start
    }
}

/// First mask of the decoder's `[1, k, height, width]` output
pub fn first_mask(masks: &ArrayD<f32>) -> Option<ArrayView2<'_, f32>> {
    let mut view = masks.view();
    while view.ndim() > 2 {
        if view.len_of(Axis(0)) == 0 {
            return None;
        }
        view = view.index_axis_move(Axis(0), 0);
    }
    view.into_dimensionality::<Ix2>().ok()
}

/// Collects positive logits into row-wise pixel ranges
pub fn extract_pixel_ranges(iter: impl Iterator<Item = f32>, width: NonZeroU32) -> Vec<PixelRange> {
    let mut result = vec![];
    for (_, row) in &iter
        .enumerate()
        .filter_map(|(pos, item)| (item > 0.0).then_some(pos as u32))
        .chunk_by(|&x| x / width)
    {
        let mut current: Option<PixelRange> = None;
        for x in row {
            if let Some(range) = current.as_mut().filter(|r| r.end == x) {
                range.end += 1;
                continue;
            }
            result.extend(current.replace(PixelRange::new(x, NonZeroU32::MIN)));
        }
        result.extend(current);
    }
    result
}

pub fn overlay_image(mask: ArrayView2<'_, f32>) -> RgbaImage {
    let (height, width) = mask.dim();
    RgbaImage::from_fn(width as u32, height as u32, |x, y| {
        if mask[[y as usize, x as usize]] > 0.0 {
            MASK_COLOR
        } else {
            Rgba([0, 0, 0, 0])
        }
    })
}

impl DecoderOutput {
    pub fn mask(&self) -> Option<ArrayView2<'_, f32>> {
        first_mask(&self.masks)
    }

    pub fn pixel_ranges(&self) -> Vec<PixelRange> {
        let Some(mask) = self.mask() else {
            return Vec::new();
        };
        match NonZeroU32::new(mask.ncols() as u32) {
            Some(width) => extract_pixel_ranges(mask.iter().copied(), width),
            None => Vec::new(),
        }
    }

    pub fn overlay(&self) -> Option<RgbaImage> {
        self.mask().map(overlay_image)
    }
}
