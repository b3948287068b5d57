//! Recording fakes for the host traits, used by the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Result, TuneError};
use crate::host::{
    AudioEngine, ContextState, ElementId, MediaElement, MediaEvent, MediaKind, PageHost,
    PlaybackSnapshot,
};

// ── Media element ───────────────────────────────────────────

struct ElementInner {
    id: ElementId,
    kind: MediaKind,
    playback: Cell<PlaybackSnapshot>,
    rate: Cell<f64>,
    preserves_pitch: Cell<bool>,
    tainted: Cell<bool>,
}

#[derive(Clone)]
pub struct FakeElement(Rc<ElementInner>);

impl std::fmt::Debug for FakeElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FakeElement({})", self.0.id.0)
    }
}

pub const PLAYING: PlaybackSnapshot = PlaybackSnapshot {
    paused: false,
    ended: false,
    current_time: 3.0,
    ready_state: 4,
};

pub const IDLE: PlaybackSnapshot = PlaybackSnapshot {
    paused: true,
    ended: false,
    current_time: 0.0,
    ready_state: 0,
};

impl FakeElement {
    pub fn new(id: u64, kind: MediaKind, playback: PlaybackSnapshot) -> Self {
        FakeElement(Rc::new(ElementInner {
            id: ElementId(id),
            kind,
            playback: Cell::new(playback),
            rate: Cell::new(1.0),
            preserves_pitch: Cell::new(true),
            tainted: Cell::new(false),
        }))
    }

    pub fn playing_video(id: u64) -> Self {
        FakeElement::new(id, MediaKind::Video, PLAYING)
    }

    pub fn idle_video(id: u64) -> Self {
        FakeElement::new(id, MediaKind::Video, IDLE)
    }

    /// Mark the element as cross-origin so source creation fails.
    pub fn taint(&self) {
        self.0.tainted.set(true);
    }

    pub fn set_playback(&self, playback: PlaybackSnapshot) {
        self.0.playback.set(playback);
    }
}

impl MediaElement for FakeElement {
    fn id(&self) -> ElementId {
        self.0.id
    }

    fn kind(&self) -> MediaKind {
        self.0.kind
    }

    fn playback(&self) -> PlaybackSnapshot {
        self.0.playback.get()
    }

    fn playback_rate(&self) -> f64 {
        self.0.rate.get()
    }

    fn set_playback_rate(&self, rate: f64) {
        self.0.rate.set(rate);
    }

    fn preserves_pitch(&self) -> bool {
        self.0.preserves_pitch.get()
    }

    fn set_preserves_pitch(&self, preserve: bool) {
        self.0.preserves_pitch.set(preserve);
    }
}

// ── Audio engine ────────────────────────────────────────────

/// Every graph operation the fake engine saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    CreateContext(u32),
    Resume(u32),
    LoadModule(u32, String),
    CreateProcessor(u32),
    CreateSource(ElementId),
    ConnectSource(ElementId, u32),
    SourceToOutput(ElementId),
    ProcessorToOutput(u32),
    DisconnectSource(ElementId),
    DisconnectProcessor(u32),
    SetParam(u32, String, f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeRoute {
    Processor(u32),
    Output,
}

#[derive(Debug, Clone)]
pub struct FakeSource {
    pub element: ElementId,
}

#[derive(Default)]
struct EngineInner {
    ops: RefCell<Vec<Op>>,
    next_id: Cell<u32>,
    contexts: RefCell<HashMap<u32, ContextState>>,
    routes: RefCell<HashMap<ElementId, FakeRoute>>,
    block_context: Cell<bool>,
    fail_module: Cell<bool>,
    fail_resume: Cell<bool>,
    start_suspended: Cell<bool>,
    yield_async: Cell<bool>,
}

#[derive(Clone, Default)]
pub struct FakeEngine(Rc<EngineInner>);

impl FakeEngine {
    pub fn new() -> Self {
        FakeEngine::default()
    }

    pub fn block_context(&self, block: bool) {
        self.0.block_context.set(block);
    }

    pub fn fail_module(&self, fail: bool) {
        self.0.fail_module.set(fail);
    }

    pub fn fail_resume(&self, fail: bool) {
        self.0.fail_resume.set(fail);
    }

    pub fn start_suspended(&self, suspended: bool) {
        self.0.start_suspended.set(suspended);
    }

    /// Make `resume` and `load_module` give up the loop once before
    /// completing, so concurrent callers actually interleave.
    pub fn yield_async(&self, yield_async: bool) {
        self.0.yield_async.set(yield_async);
    }

    /// Index of the first recorded op matching `pred`.
    pub fn position(&self, pred: impl Fn(&Op) -> bool) -> Option<usize> {
        self.0.ops.borrow().iter().position(|op| pred(op))
    }

    pub fn set_context_state(&self, ctx: u32, state: ContextState) {
        self.0.contexts.borrow_mut().insert(ctx, state);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.0.ops.borrow().clone()
    }

    pub fn clear_ops(&self) {
        self.0.ops.borrow_mut().clear();
    }

    pub fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.0.ops.borrow().iter().filter(|op| pred(op)).count()
    }

    pub fn route_of(&self, id: u64) -> Option<FakeRoute> {
        self.0.routes.borrow().get(&ElementId(id)).copied()
    }

    /// Values written to the pitch parameter, in order.
    pub fn pitch_writes(&self) -> Vec<f64> {
        self.0
            .ops
            .borrow()
            .iter()
            .filter_map(|op| match op {
                Op::SetParam(_, name, v) if name == "pitch" => Some(*v),
                _ => None,
            })
            .collect()
    }

    fn next_id(&self) -> u32 {
        let id = self.0.next_id.get() + 1;
        self.0.next_id.set(id);
        id
    }

    fn record(&self, op: Op) {
        self.0.ops.borrow_mut().push(op);
    }

    async fn pause(&self) {
        if self.0.yield_async.get() {
            tokio::task::yield_now().await;
        }
    }
}

impl AudioEngine for FakeEngine {
    type Element = FakeElement;
    type Context = u32;
    type Source = FakeSource;
    type Processor = u32;

    fn create_context(&self) -> Result<u32> {
        if self.0.block_context.get() {
            return Err(TuneError::ContextBlocked("no user activation".into()));
        }
        let id = self.next_id();
        let state = if self.0.start_suspended.get() {
            ContextState::Suspended
        } else {
            ContextState::Running
        };
        self.0.contexts.borrow_mut().insert(id, state);
        self.record(Op::CreateContext(id));
        Ok(id)
    }

    fn context_state(&self, ctx: &u32) -> ContextState {
        self.0
            .contexts
            .borrow()
            .get(ctx)
            .copied()
            .unwrap_or(ContextState::Closed)
    }

    fn current_time(&self, _ctx: &u32) -> f64 {
        1.25
    }

    async fn resume(&self, ctx: &u32) -> Result<()> {
        self.record(Op::Resume(*ctx));
        self.pause().await;
        if self.0.fail_resume.get() {
            return Err(TuneError::Resume("not allowed".into()));
        }
        self.0.contexts.borrow_mut().insert(*ctx, ContextState::Running);
        Ok(())
    }

    async fn load_module(&self, ctx: &u32, path: &str) -> Result<()> {
        self.record(Op::LoadModule(*ctx, path.to_string()));
        self.pause().await;
        if self.0.fail_module.get() {
            return Err(TuneError::ModuleLoad {
                path: path.to_string(),
                reason: "blocked by CSP".into(),
            });
        }
        Ok(())
    }

    fn create_processor(&self, _ctx: &u32, _name: &str) -> Result<u32> {
        let id = self.next_id();
        self.record(Op::CreateProcessor(id));
        Ok(id)
    }

    fn create_source(&self, _ctx: &u32, element: &FakeElement) -> Result<FakeSource> {
        if element.0.tainted.get() {
            return Err(TuneError::CrossOriginTaint(format!("element {}", element.id().0)));
        }
        self.record(Op::CreateSource(element.id()));
        Ok(FakeSource {
            element: element.id(),
        })
    }

    fn connect_source(&self, source: &FakeSource, processor: &u32) -> Result<()> {
        self.record(Op::ConnectSource(source.element, *processor));
        self.0
            .routes
            .borrow_mut()
            .insert(source.element, FakeRoute::Processor(*processor));
        Ok(())
    }

    fn connect_source_to_output(&self, _ctx: &u32, source: &FakeSource) -> Result<()> {
        self.record(Op::SourceToOutput(source.element));
        self.0.routes.borrow_mut().insert(source.element, FakeRoute::Output);
        Ok(())
    }

    fn connect_processor_to_output(&self, _ctx: &u32, processor: &u32) -> Result<()> {
        self.record(Op::ProcessorToOutput(*processor));
        Ok(())
    }

    fn disconnect_source(&self, source: &FakeSource) {
        self.record(Op::DisconnectSource(source.element));
        self.0.routes.borrow_mut().remove(&source.element);
    }

    fn disconnect_processor(&self, processor: &u32) {
        self.record(Op::DisconnectProcessor(*processor));
    }

    fn set_param(&self, processor: &u32, name: &str, value: f64, _at_time: f64) -> Result<()> {
        self.record(Op::SetParam(*processor, name.to_string(), value));
        Ok(())
    }
}

// ── Page ────────────────────────────────────────────────────

#[derive(Default)]
struct PageInner {
    elements: RefCell<Vec<FakeElement>>,
    observing: Cell<bool>,
    listeners: RefCell<HashMap<ElementId, Vec<MediaEvent>>>,
    listen_calls: Cell<usize>,
    media_checks: Cell<usize>,
}

#[derive(Clone, Default)]
pub struct FakePage(Rc<PageInner>);

impl FakePage {
    pub fn new() -> Self {
        FakePage::default()
    }

    pub fn with(elements: &[FakeElement]) -> Self {
        let page = FakePage::new();
        for el in elements {
            page.insert(el);
        }
        page
    }

    pub fn insert(&self, element: &FakeElement) {
        self.0.elements.borrow_mut().push(element.clone());
    }

    pub fn remove(&self, element: &FakeElement) {
        self.0
            .elements
            .borrow_mut()
            .retain(|e| e.id() != element.id());
    }

    pub fn is_observing(&self) -> bool {
        self.0.observing.get()
    }

    pub fn listeners_of(&self, id: u64) -> Option<Vec<MediaEvent>> {
        self.0.listeners.borrow().get(&ElementId(id)).cloned()
    }

    pub fn listen_calls(&self) -> usize {
        self.0.listen_calls.get()
    }

    /// How often the tracker asked whether the page has media.
    pub fn media_checks(&self) -> usize {
        self.0.media_checks.get()
    }
}

impl PageHost for FakePage {
    type Element = FakeElement;

    fn media_elements(&self) -> Vec<FakeElement> {
        self.0.elements.borrow().clone()
    }

    fn has_media(&self) -> bool {
        self.0.media_checks.set(self.0.media_checks.get() + 1);
        !self.0.elements.borrow().is_empty()
    }

    fn observe(&self) {
        self.0.observing.set(true);
    }

    fn stop_observing(&self) {
        self.0.observing.set(false);
    }

    fn listen(&self, element: &FakeElement, events: &[MediaEvent]) {
        self.0.listen_calls.set(self.0.listen_calls.get() + 1);
        self.0
            .listeners
            .borrow_mut()
            .insert(element.id(), events.to_vec());
    }

    fn unlisten(&self, element: &FakeElement) {
        self.0.listeners.borrow_mut().remove(&element.id());
    }
}
