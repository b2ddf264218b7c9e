use log::debug;
use ndarray::{Array1, Array2, Array3, ArrayViewD};

use crate::{
    continuity::{LowResMask, MaskContinuity, MaskContinuityTracker},
    Click, ClickType, ImageEmbedding, PromptSet, Scale,
};

/// Decoder label of a box's upper-left corner
pub const BOX_UPPER_LEFT_LABEL: f32 = 2.0;
/// Decoder label of a box's bottom-right corner
pub const BOX_BOTTOM_RIGHT_LABEL: f32 = 3.0;
/// Label of the synthetic anchor added when there is no box
pub const PADDING_LABEL: f32 = -1.0;

/// Input names of the SAM ONNX decoder
pub const INPUT_NAMES: [&str; 6] = [
    "image_embeddings",
    "point_coords",
    "point_labels",
    "mask_input",
    "has_mask_input",
    "orig_im_size",
];

/// Complete set of decoder inputs for one inference call.
#[derive(Debug, Clone)]
pub struct TensorBundle {
    pub image_embeddings: ImageEmbedding,
    /// `[1, m, 2]` in model coordinates
    pub point_coords: Array3<f32>,
    /// `[1, m]`
    pub point_labels: Array2<f32>,
    /// `[height, width]` in natural pixels
    pub orig_im_size: Array1<f32>,
    pub mask_input: LowResMask,
    /// `[1]`, 1.0 when `mask_input` carries the previous mask
    pub has_mask_input: Array1<f32>,
}

impl TensorBundle {
    /// Field by its decoder input name
    pub fn input(&self, name: &str) -> Option<ArrayViewD<'_, f32>> {
        match name {
            "image_embeddings" => Some(self.image_embeddings.view()),
            "point_coords" => Some(self.point_coords.view().into_dyn()),
            "point_labels" => Some(self.point_labels.view().into_dyn()),
            "mask_input" => Some(self.mask_input.view().into_dyn()),
            "has_mask_input" => Some(self.has_mask_input.view().into_dyn()),
            "orig_im_size" => Some(self.orig_im_size.view().into_dyn()),
            _ => None,
        }
    }

    pub fn has_mask_input(&self) -> bool {
        self.has_mask_input.iter().any(|v| *v > 0.0)
    }

    pub fn point_count(&self) -> usize {
        self.point_labels.len()
    }
}

/// Turns prompt records into decoder tensors.
pub trait PromptBuilder {
    /// `None` when there is nothing to run: no prompts, no scale or no embedding.
    fn build(
        &self,
        prompts: &PromptSet,
        scale: Option<&Scale>,
        embedding: Option<&ImageEmbedding>,
        prior_mask: Option<&LowResMask>,
    ) -> Option<TensorBundle>;
}

#[derive(Debug, Default, Clone)]
pub struct SamPromptBuilder<M = MaskContinuityTracker> {
    continuity: M,
}

impl<M: MaskContinuity> SamPromptBuilder<M> {
    pub fn new(continuity: M) -> Self {
        Self { continuity }
    }

    pub fn continuity(&self) -> &M {
        &self.continuity
    }
}

impl<M: MaskContinuity> PromptBuilder for SamPromptBuilder<M> {
    fn build(
        &self,
        prompts: &PromptSet,
        scale: Option<&Scale>,
        embedding: Option<&ImageEmbedding>,
        mut prior_mask: Option<&LowResMask>,
    ) -> Option<TensorBundle> {
        if prompts.is_empty() {
            return None;
        }
        let (scale, embedding) = (scale?, embedding?);
        if let Some(broken) = prompts
            .iter()
            .find(|c| c.click_type == ClickType::Box && !c.is_box())
        {
            debug!("Skip decoding, box record {broken:?} lacks a corner");
            return None;
        }

        let corners = prompts.box_click().and_then(Click::corners);
        let points = prompts.points();
        let entries = points.len() + if corners.is_some() { 2 } else { 1 };
        let mut coords = Vec::with_capacity(2 * entries);
        let mut labels = Vec::with_capacity(entries);

        if let Some([upper_left, bottom_right]) = corners {
            for (corner, label) in [
                (upper_left, BOX_UPPER_LEFT_LABEL),
                (bottom_right, BOX_BOTTOM_RIGHT_LABEL),
            ] {
                let corner = scale.to_model(corner);
                coords.extend([corner.x, corner.y]);
                labels.push(label);
            }
            // A box starts a new context, the point-only mask doesn't apply
            prior_mask = None;
        }

        for click in points {
            let pos = scale.to_model(click.pos());
            coords.extend([pos.x, pos.y]);
            labels.push(click.click_type.label());
        }

        // Without a box anchor the decoder expects a negative padding point
        if corners.is_none() {
            coords.extend([0.0, 0.0]);
            labels.push(PADDING_LABEL);
        }

        let point_coords = Array3::from_shape_vec((1, entries, 2), coords)
            .expect("Coordinates are collected for every entry");
        let point_labels = Array2::from_shape_vec((1, entries), labels)
            .expect("Labels are collected for every entry");
        let orig_im_size = ndarray::array![scale.height, scale.width];

        let (mask_input, has_mask) = self.continuity.resolve_mask_input(prior_mask, prompts);

        Some(TensorBundle {
            image_embeddings: embedding.clone(),
            point_coords,
            point_labels,
            orig_im_size,
            mask_input,
            has_mask_input: ndarray::array![if has_mask { 1.0 } else { 0.0 }],
        })
    }
}
