mod builder;
pub mod config;
pub mod continuity;
pub mod embedding;
pub mod inference;
pub mod interaction;
pub mod mask;
mod prompt;
pub mod scale;
mod segmenter;

pub use builder::*;
pub use config::Config;
pub use continuity::{MaskContinuity, MaskContinuityTracker};
pub use embedding::ImageEmbedding;
pub use inference::{DecoderOutput, InferenceEngine, InferenceError};
pub use interaction::{InteractionMode, InteractionStateMachine, PointerEvent, PointerKind};
pub use mask::PixelRange;
pub use prompt::*;
pub use scale::{CoordinateScaler, LongestSideScaler, Scale};
pub use segmenter::Segmenter;
