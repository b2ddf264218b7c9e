use std::{
    io::{self, Read},
    path::Path,
    sync::Arc,
};

use base64::Engine;
use ndarray::{ArrayD, ArrayViewD, IxDyn};

/// Shape of the SAM ViT image embedding
pub const EMBEDDING_SHAPE: [usize; 4] = [1, 256, 64, 64];

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Precomputed image embedding, shared between the prompt builder and in-flight requests.
#[derive(Debug, Clone)]
pub struct ImageEmbedding(Arc<ArrayD<f32>>);

impl ImageEmbedding {
    pub fn new(data: ArrayD<f32>) -> Result<Self, EmbeddingError> {
        if data.shape() != EMBEDDING_SHAPE {
            return Err(EmbeddingError::Shape(data.shape().to_vec()));
        }
        Ok(Self(Arc::new(data)))
    }

    pub fn view(&self) -> ArrayViewD<'_, f32> {
        self.0.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    /// Little-endian f32 bytes, as the embedding service sends them
    pub fn from_f32_bytes(bytes: &[u8]) -> Result<Self, EmbeddingError> {
        let len: usize = EMBEDDING_SHAPE.iter().product();
        if bytes.len() != len * std::mem::size_of::<f32>() {
            return Err(EmbeddingError::Npy(format!(
                "Expected {} bytes, got {}",
                len * std::mem::size_of::<f32>(),
                bytes.len()
            )));
        }
        let mut data = vec![0f32; len];
        bytemuck::cast_slice_mut(&mut data).copy_from_slice(bytes);
        swap_to_native(&mut data);
        Self::from_vec(data)
    }

    /// Decodes the embedding service response: a JSON array whose first entry is
    /// the base64 encoded tensor.
    pub fn from_service_response(json: &str) -> Result<Self, EmbeddingError> {
        let arrays: Vec<String> = serde_json::from_str(json)?;
        let first = arrays
            .first()
            .ok_or_else(|| EmbeddingError::Npy("Empty embedding response".into()))?;
        let bytes = base64::engine::general_purpose::STANDARD.decode(first)?;
        Self::from_f32_bytes(&bytes)
    }

    pub fn load_npy(path: impl AsRef<Path>) -> Result<Self, EmbeddingError> {
        let f = std::fs::File::open(path)?;
        Self::read_npy(io::BufReader::new(f))
    }

    /// Reads a little-endian float32, C-ordered `.npy` stream
    pub fn read_npy(mut r: impl Read) -> Result<Self, EmbeddingError> {
        let mut preamble = [0u8; 8];
        r.read_exact(&mut preamble)?;
        if &preamble[..6] != NPY_MAGIC {
            return Err(EmbeddingError::Npy("Missing NUMPY magic".into()));
        }
        let header_len = match preamble[6] {
            1 => {
                let mut len = [0u8; 2];
                r.read_exact(&mut len)?;
                u16::from_le_bytes(len) as usize
            }
            2 | 3 => {
                let mut len = [0u8; 4];
                r.read_exact(&mut len)?;
                u32::from_le_bytes(len) as usize
            }
            v => return Err(EmbeddingError::Npy(format!("Unsupported version {v}"))),
        };
        let mut header = vec![0u8; header_len];
        r.read_exact(&mut header)?;
        let header = NpyHeader::parse(&String::from_utf8_lossy(&header))?;

        let len: usize = header.shape.iter().product();
        let mut data = vec![0f32; len];
        r.read_exact(bytemuck::cast_slice_mut(&mut data))?;
        swap_to_native(&mut data);
        let data = ArrayD::from_shape_vec(IxDyn(&header.shape), data)
            .map_err(|e| EmbeddingError::Npy(format!("{e}")))?;
        Self::new(data)
    }

    fn from_vec(data: Vec<f32>) -> Result<Self, EmbeddingError> {
        let data = ArrayD::from_shape_vec(IxDyn(&EMBEDDING_SHAPE), data)
            .map_err(|e| EmbeddingError::Npy(format!("{e}")))?;
        Self::new(data)
    }
}

/// Turns floats read as little-endian bytes into native ones
fn swap_to_native(data: &mut [f32]) {
    if cfg!(target_endian = "big") {
        data.iter_mut()
            .for_each(|v| *v = f32::from_bits(v.to_bits().swap_bytes()));
    }
}

#[derive(Debug, PartialEq)]
struct NpyHeader {
    shape: Vec<usize>,
}

impl NpyHeader {
    /// Parses the python dict literal, e.g.
    /// `{'descr': '<f4', 'fortran_order': False, 'shape': (1, 256, 64, 64), }`
    fn parse(header: &str) -> Result<Self, EmbeddingError> {
        let value_of = |key: &str| {
            let start = header
                .find(&format!("'{key}'"))
                .ok_or_else(|| EmbeddingError::Npy(format!("Missing '{key}' in header")))?;
            let rest = &header[start + key.len() + 2..];
            Ok::<_, EmbeddingError>(rest.trim_start().trim_start_matches(':').trim_start())
        };

        let descr = value_of("descr")?;
        if !(descr.starts_with("'<f4'") || descr.starts_with("'|f4'")) {
            return Err(EmbeddingError::Npy(format!(
                "Only little-endian float32 is supported, got {}",
                descr.split(',').next().unwrap_or(descr)
            )));
        }
        if value_of("fortran_order")?.starts_with("True") {
            return Err(EmbeddingError::Npy("Fortran order is not supported".into()));
        }
        let shape = value_of("shape")?;
        let end = shape
            .find(')')
            .ok_or_else(|| EmbeddingError::Npy("Unterminated shape".into()))?;
        let shape = shape[..end]
            .trim_start_matches('(')
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>()
                    .map_err(|e| EmbeddingError::Npy(format!("Invalid dimension '{s}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { shape })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Io: {0}")]
    Io(#[from] io::Error),

    #[error("Json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Npy: {0}")]
    Npy(String),

    #[error("Unexpected embedding shape {0:?}")]
    Shape(Vec<usize>),
}
