use std::{path::Path, sync::Arc};

use log::debug;
use ndarray::{ArrayD, Ix4};
use ort::{Environment, OrtError, Session, SessionBuilder, Value};

use super::{DecoderOutput, InferenceEngine, InferenceError};
use crate::TensorBundle;

/// SAM prompt decoder exported to ONNX, run with ONNX Runtime.
pub struct OrtDecoder {
    session: Session,
}

impl OrtDecoder {
    pub fn new(model_path: &Path) -> Result<Self, InferenceError> {
        let env = Arc::new(Environment::builder().with_name("SAM").build()?);
        let session = SessionBuilder::new(&env)?.with_model_from_file(model_path)?;
        debug!(
            "Loaded decoder {model_path:?}, inputs: {:?}",
            session.inputs.iter().map(|i| &i.name).collect::<Vec<_>>()
        );
        Ok(Self { session })
    }

    fn output_index(&self, name: &str) -> Result<usize, InferenceError> {
        self.session
            .outputs
            .iter()
            .position(|o| o.name == name)
            .ok_or_else(|| InferenceError::UnexpectedOutput(format!("No output named '{name}'")))
    }
}

impl InferenceEngine for OrtDecoder {
    fn run(&self, inputs: &TensorBundle) -> Result<DecoderOutput, InferenceError> {
        // Bound in the order the session declares its inputs
        let arrays = self
            .session
            .inputs
            .iter()
            .map(|input| {
                inputs
                    .input(&input.name)
                    .map(|view| view.as_standard_layout())
                    .ok_or_else(|| InferenceError::UnknownInput(input.name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let values = arrays
            .iter()
            .map(|array| Value::from_array(self.session.allocator(), array))
            .collect::<Result<Vec<_>, _>>()?;

        let outputs = self.session.run(values)?;
        let extract = |name: &str| -> Result<ArrayD<f32>, InferenceError> {
            let tensor = outputs
                .get(self.output_index(name)?)
                .ok_or_else(|| InferenceError::UnexpectedOutput(format!("Missing '{name}'")))?
                .try_extract::<f32>()
                .map_err(|e| {
                    InferenceError::UnexpectedOutput(format!("'{name}' of type f32: {e:?}"))
                })?;
            let owned = tensor.view().to_owned();
            Ok(owned)
        };

        let masks = extract("masks")?;
        let low_res_masks = extract("low_res_masks")?
            .into_dimensionality::<Ix4>()
            .map_err(|e| InferenceError::UnexpectedOutput(format!("low_res_masks: {e}")))?;
        debug!(
            "Decoded masks {:?}, low res {:?}",
            masks.shape(),
            low_res_masks.shape()
        );

        Ok(DecoderOutput {
            masks,
            low_res_masks,
        })
    }
}

impl From<OrtError> for InferenceError {
    fn from(value: OrtError) -> Self {
        match value {
            e @ OrtError::CreateIoBinding(_) | e @ OrtError::CreateAllocator(_) => {
                InferenceError::AllocationError(Arc::new(e))
            }
            e => InferenceError::Other(Arc::new(e)),
        }
    }
}
