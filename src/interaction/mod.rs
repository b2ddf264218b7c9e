use std::{
    sync::mpsc::{self, Receiver, Sender},
    time::Duration,
};

use emath::{Pos2, Vec2};
use log::{debug, info, warn};

use crate::{
    config::InteractionConfig,
    continuity::LowResMask,
    inference::{DecoderOutput, InferenceError, InferenceRequest, RequestKind, Ticket},
    BoxCorners, Click, CoordinateScaler, ImageEmbedding, LongestSideScaler, PointRange,
    PromptBuilder, PromptSet, SamPromptBuilder, Scale,
};

mod pointer;
mod throttle;

pub use pointer::*;
pub use throttle::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum InteractionMode {
    #[default]
    Point,
    Box,
}

/// Box drag in progress, between pointer-down and pointer-up
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragSession {
    pub origin: Pos2,
    pub current: Pos2,
    pub moves: u32,
}

/// Changes the display layer has to react to by dropping cached masks
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ModeChanged(InteractionMode),
    Reset,
    ImageLoaded(Scale),
}

/// Everything the interaction owns. Only changed through [`InteractionStateMachine`].
#[derive(Debug, Default)]
pub struct InteractionState {
    mode: InteractionMode,
    prompts: PromptSet,
    prior_mask: Option<LowResMask>,
    drag: Option<DragSession>,
    has_clicked: bool,
    generation: u64,
}

impl InteractionState {
    pub fn mode(&self) -> InteractionMode {
        self.mode
    }

    /// Committed prompts
    pub fn prompts(&self) -> &PromptSet {
        &self.prompts
    }

    pub fn prior_mask(&self) -> Option<&LowResMask> {
        self.prior_mask.as_ref()
    }

    pub fn drag(&self) -> Option<&DragSession> {
        self.drag.as_ref()
    }

    pub fn is_dragging(&self) -> bool {
        self.drag.is_some()
    }

    pub fn has_clicked(&self) -> bool {
        self.has_clicked
    }

    /// Bumped whenever the prompts a result would belong to change
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct ImageContext {
    scale: Scale,
    embedding: ImageEmbedding,
}

/// Translates pointer events into decoder requests.
///
/// Every call that changes the prompts returns the request to run for them, if the
/// image is ready. Results are fed back through [`Self::apply_result`].
pub struct InteractionStateMachine<S = LongestSideScaler, B = SamPromptBuilder> {
    scaler: S,
    builder: B,
    state: InteractionState,
    image: Option<ImageContext>,
    hover: Throttle<Click>,
    drag_threshold: u32,
    subscribers: Vec<Sender<Notification>>,
}

impl Default for InteractionStateMachine {
    fn default() -> Self {
        let config = InteractionConfig::default();
        Self::new(
            LongestSideScaler::new(config.target_long_side),
            SamPromptBuilder::default(),
            &config,
        )
    }
}

impl<S: CoordinateScaler, B: PromptBuilder> InteractionStateMachine<S, B> {
    pub fn new(scaler: S, builder: B, config: &InteractionConfig) -> Self {
        Self {
            scaler,
            builder,
            state: InteractionState::default(),
            image: None,
            hover: Throttle::new(config.hover_window()),
            drag_threshold: config.drag_threshold.max(1),
            subscribers: Vec::new(),
        }
    }

    pub fn state(&self) -> &InteractionState {
        &self.state
    }

    pub fn scale(&self) -> Option<&Scale> {
        self.image.as_ref().map(|i| &i.scale)
    }

    pub fn subscribe(&mut self) -> Receiver<Notification> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Starts over on a new image
    pub fn load_image(
        &mut self,
        natural_width: f32,
        natural_height: f32,
        embedding: ImageEmbedding,
    ) -> Scale {
        let scale = self.scaler.compute_scale(natural_width, natural_height);
        info!("Loaded image {natural_width}x{natural_height}, scale {}", scale.sam_scale);
        self.image = Some(ImageContext { scale, embedding });
        self.clear();
        self.notify(Notification::ImageLoaded(scale));
        scale
    }

    pub fn set_mode(&mut self, mode: InteractionMode) {
        if mode == self.state.mode {
            return;
        }
        debug!("Switch to {mode:?}");
        self.clear();
        self.state.mode = mode;
        self.notify(Notification::ModeChanged(mode));
    }

    pub fn reset(&mut self) {
        debug!("Reset");
        self.clear();
        self.notify(Notification::Reset);
    }

    pub fn handle_pointer(&mut self, event: &PointerEvent) -> Option<InferenceRequest> {
        let pos = event.image_pos();
        match (self.state.mode, event.kind) {
            (InteractionMode::Point, PointerKind::Move) if !self.state.has_clicked => {
                let click = self.hover.offer(event.time, Click::point(pos))?;
                self.hover_request(click)
            }
            (InteractionMode::Point, PointerKind::Up) => self.commit_point(pos),
            (InteractionMode::Box, PointerKind::Down) => {
                let drag = self.state.drag.get_or_insert(DragSession {
                    origin: pos,
                    current: pos,
                    moves: 0,
                });
                drag.moves = 0;
                None
            }
            (InteractionMode::Box, PointerKind::Move) => self.drag_to(pos),
            (InteractionMode::Box, PointerKind::Up) => self.finish_drag(pos),
            _ => None,
        }
    }

    /// Releases a hover preview held back by the throttle
    pub fn tick(&mut self, now: Duration) -> Option<InferenceRequest> {
        let click = self.hover.flush(now)?;
        if self.state.mode != InteractionMode::Point || self.state.has_clicked {
            return None;
        }
        self.hover_request(click)
    }

    /// Applies a decoder result. Returns `false` if the prompts it was built from are outdated.
    pub fn apply_result(&mut self, ticket: Ticket, output: &DecoderOutput) -> bool {
        if ticket.generation != self.state.generation {
            debug!(
                "Discard result of {ticket:?}, current generation is {}",
                self.state.generation
            );
            return false;
        }
        if ticket.kind.updates_prior_mask() {
            self.state.prior_mask = Some(output.low_res_masks.clone());
        }
        true
    }

    pub fn apply_failure(&mut self, ticket: Ticket, error: &InferenceError) {
        warn!("Inference for {ticket:?} failed: {error}");
    }

    fn commit_point(&mut self, pos: Pos2) -> Option<InferenceRequest> {
        let click = Click::point(pos);
        let prompts = if self.state.has_clicked {
            let mut prompts = self.state.prompts.clone();
            prompts.push(click);
            prompts
        } else {
            // First click replaces the hover preview
            PromptSet::single(click)
        };
        self.hover.clear();
        self.state.has_clicked = true;
        self.commit(prompts, RequestKind::Commit)
    }

    fn drag_to(&mut self, pos: Pos2) -> Option<InferenceRequest> {
        let drag = self.state.drag.as_mut()?;
        drag.current = pos;
        drag.moves += 1;
        if drag.moves < self.drag_threshold {
            return None;
        }
        drag.moves = 0;
        let corners = BoxCorners::new(drag.origin, drag.current);
        let prompts = self.boxed_prompts(corners, None);
        self.commit(prompts, RequestKind::Provisional)
    }

    fn finish_drag(&mut self, pos: Pos2) -> Option<InferenceRequest> {
        let drag = self.state.drag.take()?;
        if pos - drag.origin != Vec2::ZERO {
            let prompts = self.boxed_prompts(BoxCorners::new(drag.origin, pos), None);
            self.state.has_clicked = true;
            return self.commit(prompts, RequestKind::Commit);
        }

        // A plain click refines an existing box
        let Some([upper_left, bottom_right]) =
            self.state.prompts.box_click().and_then(Click::corners)
        else {
            debug!("Ignore click at {pos:?}, there is no box to refine");
            self.state.has_clicked = false;
            return None;
        };
        let prompts = self.boxed_prompts(
            BoxCorners::new(upper_left, bottom_right),
            Some(Click::point(pos)),
        );
        self.state.has_clicked = true;
        self.commit(prompts, RequestKind::Commit)
    }

    /// Current prompts plus `extra`, with a box grown to contain every point
    fn boxed_prompts(&self, mut corners: BoxCorners, extra: Option<Click>) -> PromptSet {
        if let Some(range) = PointRange::of(self.state.prompts.iter().chain(extra.as_ref())) {
            corners.expand_to(&range);
        }
        let mut prompts = self.state.prompts.clone();
        if let Some(extra) = extra {
            prompts.push(extra);
        }
        prompts.with_box(Click::boxed(corners))
    }

    fn commit(&mut self, prompts: PromptSet, kind: RequestKind) -> Option<InferenceRequest> {
        self.state.prompts = prompts;
        self.state.generation += 1;
        self.request(&self.state.prompts, kind)
    }

    fn hover_request(&mut self, click: Click) -> Option<InferenceRequest> {
        self.state.generation += 1;
        self.request(&PromptSet::single(click), RequestKind::Hover)
    }

    fn request(&self, prompts: &PromptSet, kind: RequestKind) -> Option<InferenceRequest> {
        let ticket = Ticket {
            generation: self.state.generation,
            kind,
        };
        let bundle = self.builder.build(
            prompts,
            self.image.as_ref().map(|i| &i.scale),
            self.image.as_ref().map(|i| &i.embedding),
            self.state.prior_mask.as_ref(),
        );
        if bundle.is_none() {
            debug!("Nothing to decode for {ticket:?}");
        }
        Some(InferenceRequest {
            ticket,
            bundle: bundle?,
        })
    }

    fn clear(&mut self) {
        self.state.prompts.clear();
        self.state.prior_mask = None;
        self.state.drag = None;
        self.state.has_clicked = false;
        self.state.generation += 1;
        self.hover.clear();
    }

    fn notify(&mut self, notification: Notification) {
        self.subscribers
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;
    use crate::{
        continuity::{low_res_mask_shape, MaskContinuity, MaskContinuityTracker},
        embedding::EMBEDDING_SHAPE,
        ClickType,
    };

    const WIDTH: f32 = 2048.;
    const HEIGHT: f32 = 1536.;

    fn machine() -> InteractionStateMachine {
        let mut machine = InteractionStateMachine::default();
        machine.load_image(
            WIDTH,
            HEIGHT,
            ImageEmbedding::new(ArrayD::zeros(IxDyn(&EMBEDDING_SHAPE))).unwrap(),
        );
        machine
    }

    fn event(kind: PointerKind, x: f32, y: f32, ms: u64) -> PointerEvent {
        PointerEvent::at_natural_size(
            kind,
            Pos2::new(x, y),
            emath::vec2(WIDTH, HEIGHT),
            Duration::from_millis(ms),
        )
    }

    fn output(value: f32) -> DecoderOutput {
        DecoderOutput {
            masks: ArrayD::zeros(IxDyn(&[1, 1, 4, 4])),
            low_res_masks: LowResMask::from_elem(low_res_mask_shape(), value),
        }
    }

    fn drag(
        machine: &mut InteractionStateMachine,
        from: Pos2,
        to: Pos2,
    ) -> Option<InferenceRequest> {
        machine.handle_pointer(&event(PointerKind::Down, from.x, from.y, 0));
        machine.handle_pointer(&event(PointerKind::Up, to.x, to.y, 1))
    }

    #[test]
    fn single_click_commits_one_point() {
        let mut machine = machine();
        let request = machine
            .handle_pointer(&event(PointerKind::Up, 100., 50., 0))
            .unwrap();

        let prompts = machine.state().prompts();
        assert_eq!(1, prompts.len());
        assert_eq!(ClickType::Point, prompts.as_slice()[0].click_type);
        assert!(MaskContinuityTracker.is_first_prompt(prompts));
        assert!(machine.state().has_clicked());
        assert_eq!(RequestKind::Commit, request.ticket.kind);
        assert_eq!(
            &[50., 25., 0., 0.],
            request.bundle.point_coords.as_slice().unwrap()
        );
    }

    #[test]
    fn hover_does_not_persist_and_is_throttled() {
        let mut machine = machine();
        let first = machine.handle_pointer(&event(PointerKind::Move, 10., 10., 0));
        assert_eq!(RequestKind::Hover, first.unwrap().ticket.kind);
        assert!(machine.state().prompts().is_empty());

        assert!(machine
            .handle_pointer(&event(PointerKind::Move, 12., 10., 5))
            .is_none());
        assert!(machine
            .handle_pointer(&event(PointerKind::Move, 14., 10., 10))
            .is_none());
        assert!(machine.tick(Duration::from_millis(12)).is_none());

        let trailing = machine.tick(Duration::from_millis(15)).unwrap();
        assert_eq!(
            &[7., 5., 0., 0.],
            trailing.bundle.point_coords.as_slice().unwrap()
        );
        assert!(machine.state().prompts().is_empty());
    }

    #[test]
    fn no_hover_after_first_click() {
        let mut machine = machine();
        machine.handle_pointer(&event(PointerKind::Up, 10., 10., 0));
        assert!(machine
            .handle_pointer(&event(PointerKind::Move, 50., 50., 100))
            .is_none());
        assert_eq!(1, machine.state().prompts().len());
    }

    #[test]
    fn later_clicks_append_and_reuse_prior_mask() {
        let mut machine = machine();
        let first = machine
            .handle_pointer(&event(PointerKind::Up, 10., 10., 0))
            .unwrap();
        assert!(machine.apply_result(first.ticket, &output(0.5)));

        let second = machine
            .handle_pointer(&event(PointerKind::Up, 20., 20., 50))
            .unwrap();
        assert_eq!(2, machine.state().prompts().len());
        assert!(second.bundle.has_mask_input());
        assert_eq!(0.5, second.bundle.mask_input[[0, 0, 0, 0]]);
        assert_eq!(
            &[1., 1., -1.],
            second.bundle.point_labels.as_slice().unwrap()
        );
    }

    #[test]
    fn stale_results_are_discarded() {
        let mut machine = machine();
        let hover = machine
            .handle_pointer(&event(PointerKind::Move, 10., 10., 0))
            .unwrap();
        let commit = machine
            .handle_pointer(&event(PointerKind::Up, 10., 10., 1))
            .unwrap();

        assert!(!machine.apply_result(hover.ticket, &output(0.1)));
        assert!(machine.state().prior_mask().is_none());
        assert!(machine.apply_result(commit.ticket, &output(0.2)));
        assert_eq!(0.2, machine.state().prior_mask().unwrap()[[0, 0, 1, 1]]);
    }

    #[test]
    fn hover_result_is_display_only() {
        let mut machine = machine();
        let hover = machine
            .handle_pointer(&event(PointerKind::Move, 10., 10., 0))
            .unwrap();
        assert!(machine.apply_result(hover.ticket, &output(0.1)));
        assert!(machine.state().prior_mask().is_none());
    }

    #[test]
    fn failed_inference_keeps_state() {
        let mut machine = machine();
        let first = machine
            .handle_pointer(&event(PointerKind::Up, 10., 10., 0))
            .unwrap();
        machine.apply_result(first.ticket, &output(0.5));
        let second = machine
            .handle_pointer(&event(PointerKind::Up, 20., 20., 1))
            .unwrap();

        machine.apply_failure(
            second.ticket,
            &InferenceError::UnexpectedOutput("Test".into()),
        );
        assert_eq!(2, machine.state().prompts().len());
        assert_eq!(0.5, machine.state().prior_mask().unwrap()[[0, 0, 0, 0]]);
    }

    #[test]
    fn drag_commits_normalized_box() {
        let mut machine = machine();
        machine.set_mode(InteractionMode::Box);
        let request = drag(&mut machine, Pos2::new(300., 40.), Pos2::new(100., 200.)).unwrap();

        let boxed = machine.state().prompts().box_click().copied().unwrap();
        assert_eq!(
            Some([Pos2::new(100., 40.), Pos2::new(300., 200.)]),
            boxed.corners()
        );
        assert_eq!(1, machine.state().prompts().len());
        assert!(!machine.state().is_dragging());
        assert!(machine.state().has_clicked());
        assert_eq!(&[2., 3.], request.bundle.point_labels.as_slice().unwrap());
    }

    #[test]
    fn provisional_box_every_threshold_moves() {
        let mut machine = machine();
        machine.set_mode(InteractionMode::Box);
        machine.handle_pointer(&event(PointerKind::Down, 0., 0., 0));

        let provisional = (1..=12)
            .filter_map(|i| {
                machine.handle_pointer(&event(PointerKind::Move, i as f32 * 10., i as f32 * 5., i))
            })
            .collect::<Vec<_>>();
        assert_eq!(3, provisional.len());
        assert!(provisional
            .iter()
            .all(|r| r.ticket.kind == RequestKind::Provisional));
        assert_eq!(
            Some([Pos2::ZERO, Pos2::new(120., 60.)]),
            machine.state().prompts().box_click().and_then(Click::corners)
        );
        assert_eq!(0, machine.state().drag().unwrap().moves);

        machine.handle_pointer(&event(PointerKind::Move, 125., 65., 13));
        assert_eq!(1, machine.state().drag().unwrap().moves);
    }

    #[test]
    fn bare_click_without_box_is_ignored() {
        let mut machine = machine();
        machine.set_mode(InteractionMode::Box);
        let generation = machine.state().generation();

        assert!(drag(&mut machine, Pos2::new(50., 50.), Pos2::new(50., 50.)).is_none());
        assert!(machine.state().prompts().is_empty());
        assert!(!machine.state().has_clicked());
        assert_eq!(generation, machine.state().generation());
    }

    #[test]
    fn click_inside_box_adds_refinement_point() {
        let mut machine = machine();
        machine.set_mode(InteractionMode::Box);
        drag(&mut machine, Pos2::new(10., 10.), Pos2::new(200., 150.));

        let request = drag(&mut machine, Pos2::new(50., 60.), Pos2::new(50., 60.)).unwrap();
        let prompts = machine.state().prompts();
        assert_eq!(2, prompts.len());
        assert_eq!(
            Some([Pos2::new(10., 10.), Pos2::new(200., 150.)]),
            prompts.box_click().and_then(Click::corners)
        );
        assert_eq!(&[Click::point(Pos2::new(50., 60.))], prompts.points());
        assert_eq!(&[2., 3., 1.], request.bundle.point_labels.as_slice().unwrap());
        assert!(!MaskContinuityTracker.is_first_prompt(prompts));
    }

    #[test]
    fn click_outside_box_grows_it() {
        let mut machine = machine();
        machine.set_mode(InteractionMode::Box);
        drag(&mut machine, Pos2::new(10., 10.), Pos2::new(200., 150.));
        drag(&mut machine, Pos2::new(250., 5.), Pos2::new(250., 5.));

        assert_eq!(
            Some([Pos2::new(10., 5.), Pos2::new(250., 150.)]),
            machine.state().prompts().box_click().and_then(Click::corners)
        );
    }

    #[test]
    fn new_box_contains_earlier_points() {
        let mut machine = machine();
        machine.set_mode(InteractionMode::Box);
        drag(&mut machine, Pos2::new(10., 10.), Pos2::new(200., 150.));
        drag(&mut machine, Pos2::new(180., 140.), Pos2::new(180., 140.));

        // Smaller box dragged from bottom-right to upper-left
        drag(&mut machine, Pos2::new(100., 100.), Pos2::new(50., 50.));
        let prompts = machine.state().prompts();
        assert_eq!(2, prompts.len());
        assert_eq!(
            Some([Pos2::new(50., 50.), Pos2::new(180., 140.)]),
            prompts.box_click().and_then(Click::corners)
        );
    }

    #[test]
    fn provisional_box_contains_earlier_points() {
        let mut machine = machine();
        machine.set_mode(InteractionMode::Box);
        drag(&mut machine, Pos2::new(10., 10.), Pos2::new(200., 150.));
        drag(&mut machine, Pos2::new(180., 140.), Pos2::new(180., 140.));

        machine.handle_pointer(&event(PointerKind::Down, 50., 50., 10));
        let provisional = (1..=4)
            .filter_map(|i| {
                let v = 50. + i as f32 * 10.;
                machine.handle_pointer(&event(PointerKind::Move, v, v, 10 + i))
            })
            .collect::<Vec<_>>();

        assert_eq!(1, provisional.len());
        assert_eq!(RequestKind::Provisional, provisional[0].ticket.kind);
        let prompts = machine.state().prompts();
        assert_eq!(
            Some([Pos2::new(50., 50.), Pos2::new(180., 140.)]),
            prompts.box_click().and_then(Click::corners)
        );
        assert_eq!(&[Click::point(Pos2::new(180., 140.))], prompts.points());
        assert!(machine.state().is_dragging());
    }

    #[test]
    fn mode_switch_ends_drag() {
        let mut machine = machine();
        let notifications = machine.subscribe();
        machine.set_mode(InteractionMode::Box);
        machine.handle_pointer(&event(PointerKind::Down, 10., 10., 0));
        assert!(machine.state().is_dragging());

        machine.set_mode(InteractionMode::Point);
        assert!(!machine.state().is_dragging());

        machine.set_mode(InteractionMode::Box);
        let generation = machine.state().generation();
        assert!(machine
            .handle_pointer(&event(PointerKind::Up, 40., 40., 1))
            .is_none());
        assert!(machine.state().prompts().is_empty());
        assert!(!machine.state().has_clicked());
        assert_eq!(generation, machine.state().generation());
        assert_eq!(
            vec![
                Notification::ModeChanged(InteractionMode::Box),
                Notification::ModeChanged(InteractionMode::Point),
                Notification::ModeChanged(InteractionMode::Box),
            ],
            notifications.try_iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn mode_switch_clears_everything() {
        let mut machine = machine();
        let notifications = machine.subscribe();
        let first = machine
            .handle_pointer(&event(PointerKind::Up, 10., 10., 0))
            .unwrap();
        machine.apply_result(first.ticket, &output(0.5));
        machine.handle_pointer(&event(PointerKind::Up, 20., 20., 1));

        machine.set_mode(InteractionMode::Box);
        assert!(machine.state().prompts().is_empty());
        assert!(machine.state().prior_mask().is_none());
        assert!(!machine.state().has_clicked());
        assert_eq!(
            Ok(Notification::ModeChanged(InteractionMode::Box)),
            notifications.try_recv()
        );

        machine.set_mode(InteractionMode::Point);
        let next = machine
            .handle_pointer(&event(PointerKind::Up, 30., 30., 2))
            .unwrap();
        assert!(MaskContinuityTracker.is_first_prompt(machine.state().prompts()));
        assert!(!next.bundle.has_mask_input());
    }

    #[test]
    fn switching_to_current_mode_keeps_prompts() {
        let mut machine = machine();
        machine.handle_pointer(&event(PointerKind::Up, 10., 10., 0));
        machine.set_mode(InteractionMode::Point);
        assert_eq!(1, machine.state().prompts().len());
    }

    #[test]
    fn reset_drops_drag_and_notifies() {
        let mut machine = machine();
        let notifications = machine.subscribe();
        machine.set_mode(InteractionMode::Box);
        machine.handle_pointer(&event(PointerKind::Down, 10., 10., 0));
        assert!(machine.state().is_dragging());

        machine.reset();
        assert!(!machine.state().is_dragging());
        assert!(machine
            .handle_pointer(&event(PointerKind::Up, 40., 40., 1))
            .is_none());
        assert_eq!(
            vec![
                Notification::ModeChanged(InteractionMode::Box),
                Notification::Reset
            ],
            notifications.try_iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn prompts_change_without_image_but_nothing_is_decoded() {
        let mut machine: InteractionStateMachine = InteractionStateMachine::default();
        assert!(machine
            .handle_pointer(&event(PointerKind::Up, 10., 10., 0))
            .is_none());
        assert_eq!(1, machine.state().prompts().len());
        assert!(machine.scale().is_none());
    }
}
