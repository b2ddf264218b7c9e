use std::{
    io::{self, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::scale::SAM_LONG_SIDE;

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// ONNX export of the prompt decoder
    pub model_path: PathBuf,
    /// `.npy` embedding of the image being segmented
    pub embedding_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub interaction: InteractionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: "sam/sam_onnx_quantized_example.onnx".into(),
            embedding_path: None,
            output_dir: "masks".into(),
            interaction: Default::default(),
        }
    }
}

impl Config {
    /// Reads a JSON config. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match std::fs::File::open(path) {
            Ok(f) => Ok(serde_json::from_reader(BufReader::new(f))?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct InteractionConfig {
    pub target_long_side: f32,
    /// Move events accumulated before a provisional box is decoded
    pub drag_threshold: u32,
    pub hover_throttle_ms: u64,
}

impl InteractionConfig {
    pub fn hover_window(&self) -> Duration {
        Duration::from_millis(self.hover_throttle_ms)
    }
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            target_long_side: SAM_LONG_SIDE,
            drag_threshold: 4,
            hover_throttle_ms: 15,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Io: {0}")]
    Io(#[from] io::Error),

    #[error("Json: {0}")]
    Json(#[from] serde_json::Error),
}
