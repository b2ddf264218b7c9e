use log::warn;
use ndarray::{Array4, Ix4};

use crate::{ClickType, PromptSet};

/// Side length of the decoder's low resolution mask
pub const LOW_RES_MASK_SIZE: usize = 256;

/// `[1, 1, 256, 256]` mask logits as returned in `low_res_masks`
pub type LowResMask = Array4<f32>;

pub fn low_res_mask_shape() -> Ix4 {
    ndarray::Dim([1, 1, LOW_RES_MASK_SIZE, LOW_RES_MASK_SIZE])
}

pub fn empty_low_res_mask() -> LowResMask {
    Array4::zeros(low_res_mask_shape())
}

/// Decides whether the previous iteration's mask is fed back into the decoder.
pub trait MaskContinuity {
    /// Whether `prompts` starts a logically new segmentation
    fn is_first_prompt(&self, prompts: &PromptSet) -> bool;

    /// Mask tensor and `has_mask_input` flag for the next decoder call
    fn resolve_mask_input(
        &self,
        prior_mask: Option<&LowResMask>,
        prompts: &PromptSet,
    ) -> (LowResMask, bool);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MaskContinuityTracker;

impl MaskContinuity for MaskContinuityTracker {
    fn is_first_prompt(&self, prompts: &PromptSet) -> bool {
        match (prompts.box_click(), prompts.points()) {
            (Some(_), []) => true,
            (None, [single]) => single.click_type == ClickType::Point,
            _ => false,
        }
    }

    fn resolve_mask_input(
        &self,
        prior_mask: Option<&LowResMask>,
        prompts: &PromptSet,
    ) -> (LowResMask, bool) {
        let prior_mask = prior_mask.filter(|m| {
            let matches = m.raw_dim() == low_res_mask_shape();
            if !matches {
                warn!("Ignoring prior mask of shape {:?}", m.shape());
            }
            matches
        });
        match prior_mask {
            Some(mask) if !self.is_first_prompt(prompts) => (mask.clone(), true),
            _ => (empty_low_res_mask(), false),
        }
    }
}
