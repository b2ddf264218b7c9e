use std::time::Duration;

use emath::{Pos2, Rect, Vec2};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerKind {
    Move,
    Down,
    Up,
}

/// Raw pointer event as delivered by the display layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerEvent {
    pub kind: PointerKind,
    /// Pointer position in screen coordinates
    pub client: Pos2,
    /// Screen rectangle the image is displayed in
    pub element_bounds: Rect,
    /// Width of the image in its own pixels
    pub natural_width: f32,
    /// Monotonic event time
    pub time: Duration,
}

impl PointerEvent {
    /// Event on an element which shows the image at its natural size
    pub fn at_natural_size(
        kind: PointerKind,
        pos: Pos2,
        natural_size: Vec2,
        time: Duration,
    ) -> Self {
        Self {
            kind,
            client: pos,
            element_bounds: Rect::from_min_size(Pos2::ZERO, natural_size),
            natural_width: natural_size.x,
            time,
        }
    }

    /// Position in natural image pixels
    pub fn image_pos(&self) -> Pos2 {
        let displayed_width = self.element_bounds.width();
        let image_scale = if displayed_width > 0.0 {
            self.natural_width / displayed_width
        } else {
            1.0
        };
        ((self.client - self.element_bounds.min) * image_scale).to_pos2()
    }
}
