use std::{sync::mpsc::Receiver, time::Duration};

use log::{debug, info};

use crate::{
    config::InteractionConfig,
    inference::{
        Completed, DecoderOutput, InferenceEngine, InferenceRequest, InferenceRunner, Ticket,
    },
    interaction::{InteractionMode, InteractionStateMachine, Notification, PointerEvent},
    CoordinateScaler, ImageEmbedding, LongestSideScaler, PromptBuilder, SamPromptBuilder, Scale,
};

/// Drives an [`InteractionStateMachine`] against a decoder and keeps the newest valid mask.
pub struct Segmenter<E, S = LongestSideScaler, B = SamPromptBuilder> {
    machine: InteractionStateMachine<S, B>,
    runner: InferenceRunner<E>,
    latest: Option<(Ticket, DecoderOutput)>,
}

impl<E: InferenceEngine> Segmenter<E> {
    pub fn with_config(engine: E, config: &InteractionConfig) -> Self {
        Self::new(
            InteractionStateMachine::new(
                LongestSideScaler::new(config.target_long_side),
                SamPromptBuilder::default(),
                config,
            ),
            engine,
        )
    }
}

impl<E: InferenceEngine, S: CoordinateScaler, B: PromptBuilder> Segmenter<E, S, B> {
    pub fn new(machine: InteractionStateMachine<S, B>, engine: E) -> Self {
        Self {
            machine,
            runner: InferenceRunner::new(engine),
            latest: None,
        }
    }

    pub fn machine(&self) -> &InteractionStateMachine<S, B> {
        &self.machine
    }

    pub fn engine(&self) -> &E {
        self.runner.engine()
    }

    pub fn in_flight(&self) -> usize {
        self.runner.in_flight()
    }

    pub fn subscribe(&mut self) -> Receiver<Notification> {
        self.machine.subscribe()
    }

    pub fn load_image(&mut self, width: f32, height: f32, embedding: ImageEmbedding) -> Scale {
        self.latest = None;
        self.machine.load_image(width, height, embedding)
    }

    pub fn set_mode(&mut self, mode: InteractionMode) {
        let generation = self.machine.state().generation();
        self.machine.set_mode(mode);
        if generation != self.machine.state().generation() {
            self.latest = None;
        }
    }

    pub fn reset(&mut self) {
        self.machine.reset();
        self.latest = None;
    }

    /// Returns the ticket of the request started for this event, if any
    pub fn handle_pointer(&mut self, event: &PointerEvent) -> Option<Ticket> {
        let request = self.machine.handle_pointer(event);
        self.submit(request)
    }

    pub fn tick(&mut self, now: Duration) -> Option<Ticket> {
        let request = self.machine.tick(now);
        self.submit(request)
    }

    /// Collects finished requests without blocking and returns the mask to display
    pub fn poll(&mut self) -> Option<&DecoderOutput> {
        let done = self.runner.poll();
        self.apply(done);
        self.latest()
    }

    /// Blocks until nothing is in flight anymore
    pub fn wait_idle(&mut self) -> Option<&DecoderOutput> {
        let done = self.runner.wait_all();
        self.apply(done);
        self.latest()
    }

    pub fn latest(&self) -> Option<&DecoderOutput> {
        self.latest.as_ref().map(|(_, output)| output)
    }

    pub fn latest_ticket(&self) -> Option<Ticket> {
        self.latest.as_ref().map(|(ticket, _)| *ticket)
    }

    fn submit(&mut self, request: Option<InferenceRequest>) -> Option<Ticket> {
        let request = request?;
        let ticket = request.ticket;
        self.runner.submit(request);
        Some(ticket)
    }

    fn apply(&mut self, done: Vec<Completed>) {
        for Completed { ticket, result } in done {
            match result {
                Ok(output) => {
                    if self.machine.apply_result(ticket, &output) {
                        info!("Show mask of {ticket:?}");
                        self.latest = Some((ticket, output));
                    }
                }
                Err(e) => self.machine.apply_failure(ticket, &e),
            }
        }
        if let Some((ticket, _)) = &self.latest {
            if ticket.generation != self.machine.state().generation() {
                debug!("Displayed mask of {ticket:?} is outdated");
            }
        }
    }
}
