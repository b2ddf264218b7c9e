use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use futures::{channel::oneshot, Future};
use log::debug;
use ndarray::ArrayD;

use crate::{continuity::LowResMask, TensorBundle};

#[cfg(feature = "sam")]
mod native_ort;

#[cfg(feature = "sam")]
pub use native_ort::OrtDecoder;

/// Black box running the SAM decoder on a complete set of inputs.
pub trait InferenceEngine: Send + Sync + 'static {
    fn run(&self, inputs: &TensorBundle) -> Result<DecoderOutput, InferenceError>;
}

impl<E: InferenceEngine> InferenceEngine for Arc<E> {
    fn run(&self, inputs: &TensorBundle) -> Result<DecoderOutput, InferenceError> {
        (**self).run(inputs)
    }
}

#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// Mask logits at natural image size, `[1, k, height, width]`
    pub masks: ArrayD<f32>,
    /// Mask logits at decoder resolution, fed back as `mask_input`
    pub low_res_masks: LowResMask,
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum InferenceError {
    #[error("Allocation: {0:?}")]
    AllocationError(Arc<dyn std::error::Error + Send + Sync>),

    #[error("Other: {0:?}")]
    Other(Arc<dyn std::error::Error + Send + Sync>),

    #[error("Decoder expects unknown input '{0}'")]
    UnknownInput(String),

    #[error("Unexpected network output: {0}")]
    UnexpectedOutput(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Live preview while hovering, never kept as prior mask
    Hover,
    /// Intermediate box while dragging
    Provisional,
    Commit,
}

impl RequestKind {
    pub fn updates_prior_mask(self) -> bool {
        !matches!(self, RequestKind::Hover)
    }
}

/// Identifies the prompt state a request was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub generation: u64,
    pub kind: RequestKind,
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub ticket: Ticket,
    pub bundle: TensorBundle,
}

#[derive(Debug)]
pub struct Completed {
    pub ticket: Ticket,
    pub result: Result<DecoderOutput, InferenceError>,
}

type Pending = (Ticket, oneshot::Receiver<Result<DecoderOutput, InferenceError>>);

/// Runs every request on its own worker thread and hands back finished ones.
///
/// Requests are never cancelled; callers decide what to do with outdated results.
pub struct InferenceRunner<E> {
    engine: Arc<E>,
    pending: Vec<Pending>,
}

impl<E: InferenceEngine> InferenceRunner<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine: Arc::new(engine),
            pending: Vec::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn submit(&mut self, request: InferenceRequest) {
        let (tx, rx) = oneshot::channel();
        let engine = self.engine.clone();
        let InferenceRequest { ticket, bundle } = request;
        debug!(
            "Submit {ticket:?} with {} points, has_mask_input={}",
            bundle.point_count(),
            bundle.has_mask_input()
        );
        std::thread::spawn(move || {
            // Receiver is gone when the runner was dropped
            let _ = tx.send(engine.run(&bundle));
        });
        self.pending.push((ticket, rx));
    }

    /// Finished requests, without blocking
    pub fn poll(&mut self) -> Vec<Completed> {
        let mut cx = Context::from_waker(Waker::noop());
        let mut done = Vec::new();
        self.pending.retain_mut(|(ticket, rx)| match Pin::new(rx).poll(&mut cx) {
            Poll::Ready(r) => {
                done.push(Completed {
                    ticket: *ticket,
                    result: flatten(r),
                });
                false
            }
            Poll::Pending => true,
        });
        done
    }

    /// Blocks until every in-flight request finished, in submission order
    pub fn wait_all(&mut self) -> Vec<Completed> {
        self.pending
            .drain(..)
            .map(|(ticket, rx)| Completed {
                ticket,
                result: flatten(futures::executor::block_on(rx)),
            })
            .collect()
    }
}

fn flatten(
    r: Result<Result<DecoderOutput, InferenceError>, oneshot::Canceled>,
) -> Result<DecoderOutput, InferenceError> {
    r.map_err(|e| InferenceError::Other(Arc::new(e)))
        .and_then(|a| a)
}
