use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};

use emath::{Pos2, Rect};
use log::{info, warn};
use ndarray::{ArrayD, IxDyn};
use sam_prompt::{
    config::ConfigError,
    embedding::{EmbeddingError, EMBEDDING_SHAPE},
    inference::{DecoderOutput, InferenceEngine, InferenceError, Ticket},
    Config, ImageEmbedding, InteractionMode, PointerEvent, PointerKind, Segmenter,
};

/// Recorded interaction with one image
#[derive(serde::Deserialize, Debug)]
struct Script {
    image: ImageSource,
    /// Width the image was shown at, natural size if missing
    #[serde(default)]
    display_width: Option<f32>,
    events: Vec<ScriptEvent>,
}

#[derive(serde::Deserialize, Debug)]
#[serde(untagged)]
enum ImageSource {
    Path { path: PathBuf },
    Size { width: f32, height: f32 },
}

#[derive(serde::Deserialize, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ScriptEvent {
    Pointer {
        kind: PointerKind,
        x: f32,
        y: f32,
        at_ms: u64,
    },
    Mode {
        mode: InteractionMode,
    },
    Reset,
    Tick {
        at_ms: u64,
    },
}

#[derive(Debug, thiserror::Error)]
enum ReplayError {
    #[error("Config: {0}")]
    Config(#[from] ConfigError),

    #[error("Script: {0}")]
    Script(#[from] serde_json::Error),

    #[error("Io: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image: {0}")]
    Image(#[from] image::ImageError),

    #[error("Embedding: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Inference: {0}")]
    Inference(#[from] InferenceError),
}

#[cfg(not(feature = "sam"))]
mod dry_run {
    use log::info;
    use ndarray::{ArrayD, IxDyn};
    use sam_prompt::{
        continuity::empty_low_res_mask,
        inference::{DecoderOutput, InferenceEngine, InferenceError},
        TensorBundle, INPUT_NAMES,
    };

    /// Logs what would be sent to the decoder and answers with empty masks
    pub struct DryRun;

    impl InferenceEngine for DryRun {
        fn run(&self, inputs: &TensorBundle) -> Result<DecoderOutput, InferenceError> {
            for name in INPUT_NAMES {
                if let Some(view) = inputs.input(name) {
                    info!("{name}: {:?}", view.shape());
                }
            }
            info!("point_coords: {:?}", inputs.point_coords.as_slice());
            info!("point_labels: {:?}", inputs.point_labels.as_slice());
            let [height, width] = [0, 1].map(|i| inputs.orig_im_size[i] as usize);
            Ok(DecoderOutput {
                masks: ArrayD::zeros(IxDyn(&[1, 1, height, width])),
                low_res_masks: empty_low_res_mask(),
            })
        }
    }
}

fn main() -> Result<(), ReplayError> {
    env_logger::init();

    let config = Config::load("config.json")?;
    info!("Run with config: {config:?}");
    let script_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "events.json".into());
    let script: Script = serde_json::from_reader(BufReader::new(File::open(&script_path)?))?;

    #[cfg(feature = "sam")]
    let engine = sam_prompt::inference::OrtDecoder::new(&config.model_path)?;
    #[cfg(not(feature = "sam"))]
    let engine = {
        info!("Built without ONNX Runtime, masks stay empty");
        dry_run::DryRun
    };

    replay(Segmenter::with_config(engine, &config.interaction), &config, script)
}

fn replay<E: InferenceEngine>(
    mut segmenter: Segmenter<E>,
    config: &Config,
    script: Script,
) -> Result<(), ReplayError> {
    let (width, height) = match &script.image {
        ImageSource::Path { path } => {
            let (w, h) = image::image_dimensions(path)?;
            (w as f32, h as f32)
        }
        ImageSource::Size { width, height } => (*width, *height),
    };
    segmenter.load_image(width, height, load_embedding(config.embedding_path.as_deref())?);

    let display_width = script.display_width.unwrap_or(width);
    let bounds = Rect::from_min_size(
        Pos2::ZERO,
        emath::vec2(display_width, display_width * height / width),
    );
    std::fs::create_dir_all(&config.output_dir)?;

    let mut shown: Option<Ticket> = None;
    for (idx, event) in script.events.into_iter().enumerate() {
        let started = match event {
            ScriptEvent::Pointer { kind, x, y, at_ms } => segmenter.handle_pointer(&PointerEvent {
                kind,
                client: Pos2::new(x, y),
                element_bounds: bounds,
                natural_width: width,
                time: Duration::from_millis(at_ms),
            }),
            ScriptEvent::Mode { mode } => {
                segmenter.set_mode(mode);
                None
            }
            ScriptEvent::Reset => {
                segmenter.reset();
                None
            }
            ScriptEvent::Tick { at_ms } => segmenter.tick(Duration::from_millis(at_ms)),
        };
        if started.is_none() {
            continue;
        }

        segmenter.wait_idle();
        let ticket = segmenter.latest_ticket();
        if ticket == shown {
            continue;
        }
        shown = ticket;
        if let Some(overlay) = segmenter.latest().and_then(DecoderOutput::overlay) {
            let path = config.output_dir.join(format!("mask_{idx:03}.png"));
            overlay.save(&path)?;
            info!("Wrote {path:?} for {ticket:?}");
        }
    }
    Ok(())
}

fn load_embedding(path: Option<&Path>) -> Result<ImageEmbedding, EmbeddingError> {
    match path {
        Some(path) => ImageEmbedding::load_npy(path),
        None => {
            warn!("No embedding_path configured, using an all-zero embedding");
            ImageEmbedding::new(ArrayD::zeros(IxDyn(&EMBEDDING_SHAPE)))
        }
    }
}
