use emath::{Pos2, Vec2};

/// Longest side of the decoder's working resolution
pub const SAM_LONG_SIDE: f32 = 1024.0;

/// Relation between an image's natural size and the model's working resolution.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Scale {
    pub width: f32,
    pub height: f32,
    pub sam_scale: f32,
}

impl Scale {
    pub fn to_model(&self, pos: Pos2) -> Pos2 {
        (pos.to_vec2() * self.sam_scale).to_pos2()
    }

    /// Image size after resizing to the working resolution
    pub fn resized_size(&self) -> [u32; 2] {
        let resized = Vec2::new(self.width, self.height) * self.sam_scale;
        [resized.x.round() as u32, resized.y.round() as u32]
    }

    pub fn natural_size(&self) -> [u32; 2] {
        [self.width as u32, self.height as u32]
    }
}

pub trait CoordinateScaler {
    /// Degenerate sizes must be rejected before calling this.
    fn compute_scale(&self, natural_width: f32, natural_height: f32) -> Scale;
}

/// Maps the longer image side onto `target_long_side`, preserving aspect ratio
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LongestSideScaler {
    pub target_long_side: f32,
}

impl LongestSideScaler {
    pub fn new(target_long_side: f32) -> Self {
        Self { target_long_side }
    }
}

impl Default for LongestSideScaler {
    fn default() -> Self {
        Self::new(SAM_LONG_SIDE)
    }
}

impl CoordinateScaler for LongestSideScaler {
    fn compute_scale(&self, natural_width: f32, natural_height: f32) -> Scale {
        Scale {
            width: natural_width,
            height: natural_height,
            sam_scale: self.target_long_side / natural_width.max(natural_height),
        }
    }
}
