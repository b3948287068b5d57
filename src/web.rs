//! Browser bindings — web-sys implementations of the host traits and the
//! `ContentEngine` the content script drives.
//!
//! The content script owns persistence: it reads the stored tuning state
//! once and passes it to `start`, then forwards every storage change to
//! `setState`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::rc::{Rc, Weak};

use js_sys::{Array, Map, Promise, Reflect};
use tracing::{Level, Metadata, warn};
use tracing_subscriber::fmt::MakeWriter;
use wasm_bindgen::JsCast;
use wasm_bindgen::closure::Closure;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::{JsFuture, future_to_promise, spawn_local};
use web_sys::{
    AddEventListenerOptions, AudioContext, AudioContextState, AudioParam, AudioWorkletNode,
    Document, Element, HtmlMediaElement, HtmlVideoElement, MediaElementAudioSourceNode,
    MutationObserver, MutationObserverInit, MutationRecord, Node, Url, VisibilityState,
};

use crate::config::EngineConfig;
use crate::error::{Result, TuneError};
use crate::host::{
    AudioEngine, ContextState, ElementId, MediaElement, MediaEvent, MediaKind, PageEvent,
    PageHost, PlaybackSnapshot,
};
use crate::service::Retuner;
use crate::state::TuningState;

fn js_error(e: &JsValue) -> String {
    if let Some(s) = e.as_string() {
        return s;
    }
    if let Some(err) = e.dyn_ref::<js_sys::Error>() {
        return String::from(err.message());
    }
    format!("{e:?}")
}

fn to_js(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&format!("{e}"))
}

// ── Media elements ──────────────────────────────────────────

const ID_PROPERTY: &str = "__retuneElementId";
const PRESERVE_PITCH_PROPS: [&str; 3] = ["preservesPitch", "webkitPreservesPitch", "mozPreservesPitch"];

thread_local! {
    static NEXT_ELEMENT_ID: Cell<u64> = const { Cell::new(1) };
}

/// Stable id stored on the element itself, so the same DOM node maps to
/// the same id whichever query or mutation record produced it.
fn element_id(element: &HtmlMediaElement) -> ElementId {
    let key = JsValue::from_str(ID_PROPERTY);
    if let Some(id) = Reflect::get(element, &key).ok().and_then(|v| v.as_f64()) {
        return ElementId(id as u64);
    }
    let id = NEXT_ELEMENT_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        id
    });
    if Reflect::set(element, &key, &JsValue::from_f64(id as f64)).is_err() {
        warn!(element = id, "could not tag media element");
    }
    ElementId(id)
}

#[derive(Debug, Clone)]
pub struct WebMedia {
    element: HtmlMediaElement,
    id: ElementId,
    kind: MediaKind,
}

impl WebMedia {
    pub fn from_element(element: HtmlMediaElement) -> Self {
        let kind = if element.is_instance_of::<HtmlVideoElement>() {
            MediaKind::Video
        } else {
            MediaKind::Audio
        };
        let id = element_id(&element);
        WebMedia { element, id, kind }
    }

    pub fn from_node(node: &Node) -> Option<Self> {
        node.dyn_ref::<HtmlMediaElement>()
            .cloned()
            .map(WebMedia::from_element)
    }

    pub fn element(&self) -> &HtmlMediaElement {
        &self.element
    }

    /// Media served from another origin without CORS opt-in feeds silence
    /// into an audio graph, so it is treated as unroutable.
    fn is_cross_origin(&self) -> bool {
        if self.element.cross_origin().is_some() {
            return false;
        }
        let src = self.element.current_src();
        if src.is_empty() || src.starts_with("blob:") || src.starts_with("data:") {
            return false;
        }
        let Some(page_origin) = web_sys::window().and_then(|w| w.location().origin().ok()) else {
            return false;
        };
        let media = Url::new(&src).ok().map(|url| url.origin());
        is_foreign(media.as_deref(), &page_origin)
    }
}

/// Origins are compared exactly: a shared prefix such as
/// `https://site.com.cdn.net` or another port is foreign. A source whose
/// origin cannot be read is treated as foreign, so it falls back to rate.
fn is_foreign(media_origin: Option<&str>, page_origin: &str) -> bool {
    media_origin.is_none_or(|origin| origin != page_origin)
}

impl MediaElement for WebMedia {
    fn id(&self) -> ElementId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn playback(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            paused: self.element.paused(),
            ended: self.element.ended(),
            current_time: self.element.current_time(),
            ready_state: self.element.ready_state(),
        }
    }

    fn playback_rate(&self) -> f64 {
        self.element.playback_rate()
    }

    fn set_playback_rate(&self, rate: f64) {
        self.element.set_playback_rate(rate);
    }

    fn preserves_pitch(&self) -> bool {
        PRESERVE_PITCH_PROPS
            .iter()
            .find_map(|prop| {
                Reflect::get(&self.element, &JsValue::from_str(prop))
                    .ok()
                    .and_then(|v| v.as_bool())
            })
            .unwrap_or(true)
    }

    fn set_preserves_pitch(&self, preserve: bool) {
        for prop in PRESERVE_PITCH_PROPS {
            let key = JsValue::from_str(prop);
            if Reflect::has(&self.element, &key).unwrap_or(false) {
                let _ = Reflect::set(&self.element, &key, &JsValue::from_bool(preserve));
            }
        }
    }
}

// ── Web Audio ───────────────────────────────────────────────

pub struct WebAudioEngine;

impl AudioEngine for WebAudioEngine {
    type Element = WebMedia;
    type Context = AudioContext;
    type Source = MediaElementAudioSourceNode;
    type Processor = AudioWorkletNode;

    fn create_context(&self) -> Result<AudioContext> {
        AudioContext::new().map_err(|e| TuneError::ContextBlocked(js_error(&e)))
    }

    fn context_state(&self, ctx: &AudioContext) -> ContextState {
        match ctx.state() {
            AudioContextState::Running => ContextState::Running,
            AudioContextState::Suspended => ContextState::Suspended,
            AudioContextState::Closed => ContextState::Closed,
            // "interrupted" is not in the binding's enum.
            _ => ContextState::Interrupted,
        }
    }

    fn current_time(&self, ctx: &AudioContext) -> f64 {
        ctx.current_time()
    }

    async fn resume(&self, ctx: &AudioContext) -> Result<()> {
        let promise = ctx.resume().map_err(|e| TuneError::Resume(js_error(&e)))?;
        JsFuture::from(promise)
            .await
            .map(|_| ())
            .map_err(|e| TuneError::Resume(js_error(&e)))
    }

    async fn load_module(&self, ctx: &AudioContext, path: &str) -> Result<()> {
        let module_err = |e: JsValue| TuneError::ModuleLoad {
            path: path.to_string(),
            reason: js_error(&e),
        };
        let worklet = ctx.audio_worklet().map_err(module_err)?;
        let promise = worklet.add_module(path).map_err(module_err)?;
        JsFuture::from(promise).await.map(|_| ()).map_err(module_err)
    }

    fn create_processor(&self, ctx: &AudioContext, name: &str) -> Result<AudioWorkletNode> {
        AudioWorkletNode::new(ctx, name).map_err(|e| TuneError::Graph(js_error(&e)))
    }

    fn create_source(
        &self,
        ctx: &AudioContext,
        element: &WebMedia,
    ) -> Result<MediaElementAudioSourceNode> {
        if element.is_cross_origin() {
            return Err(TuneError::CrossOriginTaint(element.element.current_src()));
        }
        ctx.create_media_element_source(&element.element)
            .map_err(|e| TuneError::CrossOriginTaint(js_error(&e)))
    }

    fn connect_source(
        &self,
        source: &MediaElementAudioSourceNode,
        processor: &AudioWorkletNode,
    ) -> Result<()> {
        source
            .connect_with_audio_node(processor)
            .map(|_| ())
            .map_err(|e| TuneError::Graph(js_error(&e)))
    }

    fn connect_source_to_output(
        &self,
        ctx: &AudioContext,
        source: &MediaElementAudioSourceNode,
    ) -> Result<()> {
        source
            .connect_with_audio_node(&ctx.destination())
            .map(|_| ())
            .map_err(|e| TuneError::Graph(js_error(&e)))
    }

    fn connect_processor_to_output(
        &self,
        ctx: &AudioContext,
        processor: &AudioWorkletNode,
    ) -> Result<()> {
        processor
            .connect_with_audio_node(&ctx.destination())
            .map(|_| ())
            .map_err(|e| TuneError::Graph(js_error(&e)))
    }

    fn disconnect_source(&self, source: &MediaElementAudioSourceNode) {
        // Throws when there is nothing to disconnect.
        let _ = source.disconnect();
    }

    fn disconnect_processor(&self, processor: &AudioWorkletNode) {
        let _ = processor.disconnect();
    }

    fn set_param(
        &self,
        processor: &AudioWorkletNode,
        name: &str,
        value: f64,
        at_time: f64,
    ) -> Result<()> {
        let params = processor
            .parameters()
            .map_err(|e| TuneError::Graph(js_error(&e)))?;
        let param: AudioParam = params
            .unchecked_ref::<Map>()
            .get(&JsValue::from_str(name))
            .dyn_into()
            .map_err(|_| TuneError::Graph(format!("processor has no '{name}' parameter")))?;
        param
            .set_value_at_time(value as f32, at_time)
            .map(|_| ())
            .map_err(|e| TuneError::Graph(js_error(&e)))
    }
}

// ── Page ────────────────────────────────────────────────────

type EventSink = Rc<dyn Fn(PageEvent<WebMedia>)>;
type ListenerClosure = Closure<dyn FnMut()>;

struct PageInner {
    document: Document,
    selector: String,
    sink: RefCell<Option<EventSink>>,
    observer: RefCell<Option<(MutationObserver, Closure<dyn FnMut(Array, MutationObserver)>)>>,
    listeners: RefCell<HashMap<ElementId, Vec<(MediaEvent, ListenerClosure)>>>,
    visibility: RefCell<Option<ListenerClosure>>,
}

impl PageInner {
    fn dispatch(&self, event: PageEvent<WebMedia>) {
        let sink = self.sink.borrow().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    /// Qualifying media at or below `node`.
    fn collect_media(&self, node: &Node, out: &mut Vec<WebMedia>) {
        if let Some(media) = WebMedia::from_node(node) {
            out.push(media);
            return;
        }
        if let Some(element) = node.dyn_ref::<Element>() {
            if let Ok(list) = element.query_selector_all(&self.selector) {
                for i in 0..list.length() {
                    if let Some(media) = list.item(i).as_ref().and_then(WebMedia::from_node) {
                        out.push(media);
                    }
                }
            }
        }
    }

    fn on_records(&self, records: Array) {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        for record in records.iter() {
            let record: MutationRecord = record.unchecked_into();
            let nodes = record.added_nodes();
            for i in 0..nodes.length() {
                // Skip nodes that were inserted and removed within one batch.
                if let Some(node) = nodes.item(i).filter(|n| n.is_connected()) {
                    self.collect_media(&node, &mut added);
                }
            }
            let nodes = record.removed_nodes();
            for i in 0..nodes.length() {
                // A moved node is reported as removed but is still attached.
                if let Some(node) = nodes.item(i).filter(|n| !n.is_connected()) {
                    self.collect_media(&node, &mut removed);
                }
            }
        }
        if !added.is_empty() || !removed.is_empty() {
            self.dispatch(PageEvent::Mutations { added, removed });
        }
    }
}

#[derive(Clone)]
pub struct WebPage {
    inner: Rc<PageInner>,
}

impl WebPage {
    pub fn new(document: Document, selector: &str) -> Self {
        WebPage {
            inner: Rc::new(PageInner {
                document,
                selector: selector.to_string(),
                sink: RefCell::new(None),
                observer: RefCell::new(None),
                listeners: RefCell::new(HashMap::new()),
                visibility: RefCell::new(None),
            }),
        }
    }

    pub fn set_sink(&self, sink: EventSink) {
        *self.inner.sink.borrow_mut() = Some(sink);
    }

    /// Report tab visibility changes for the lifetime of the page.
    pub fn watch_visibility(&self) {
        if self.inner.visibility.borrow().is_some() {
            return;
        }
        let weak: Weak<PageInner> = Rc::downgrade(&self.inner);
        let closure = Closure::<dyn FnMut()>::new(move || {
            if let Some(inner) = weak.upgrade() {
                let visible = inner.document.visibility_state() == VisibilityState::Visible;
                inner.dispatch(PageEvent::Visibility { visible });
            }
        });
        if let Err(e) = self
            .inner
            .document
            .add_event_listener_with_callback("visibilitychange", closure.as_ref().unchecked_ref())
        {
            warn!(error = %js_error(&e), "could not watch tab visibility");
            return;
        }
        *self.inner.visibility.borrow_mut() = Some(closure);
    }
}

impl PageHost for WebPage {
    type Element = WebMedia;

    fn media_elements(&self) -> Vec<WebMedia> {
        let mut out = Vec::new();
        if let Ok(list) = self.inner.document.query_selector_all(&self.inner.selector) {
            for i in 0..list.length() {
                if let Some(media) = list.item(i).as_ref().and_then(WebMedia::from_node) {
                    out.push(media);
                }
            }
        }
        out
    }

    fn observe(&self) {
        if self.inner.observer.borrow().is_some() {
            return;
        }
        let Some(root) = self.inner.document.document_element() else {
            warn!("document has no root element to observe");
            return;
        };
        let weak = Rc::downgrade(&self.inner);
        let callback = Closure::<dyn FnMut(Array, MutationObserver)>::new(
            move |records: Array, _observer: MutationObserver| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_records(records);
                }
            },
        );
        let observer = match MutationObserver::new(callback.as_ref().unchecked_ref()) {
            Ok(observer) => observer,
            Err(e) => {
                warn!(error = %js_error(&e), "could not create mutation observer");
                return;
            }
        };
        let init = MutationObserverInit::new();
        init.set_child_list(true);
        init.set_subtree(true);
        if let Err(e) = observer.observe_with_options(&root, &init) {
            warn!(error = %js_error(&e), "could not observe document");
            return;
        }
        *self.inner.observer.borrow_mut() = Some((observer, callback));
    }

    fn stop_observing(&self) {
        if let Some((observer, _callback)) = self.inner.observer.borrow_mut().take() {
            observer.disconnect();
        }
    }

    fn listen(&self, element: &WebMedia, events: &[MediaEvent]) {
        self.unlisten(element);
        let options = AddEventListenerOptions::new();
        options.set_once(true);

        let mut attached = Vec::with_capacity(events.len());
        for &event in events {
            let weak = Rc::downgrade(&self.inner);
            let target = element.clone();
            let closure = Closure::<dyn FnMut()>::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(PageEvent::Media {
                        element: target.clone(),
                        event,
                    });
                }
            });
            let added = element
                .element
                .add_event_listener_with_callback_and_add_event_listener_options(
                    event.dom_name(),
                    closure.as_ref().unchecked_ref(),
                    &options,
                );
            match added {
                Ok(()) => attached.push((event, closure)),
                Err(e) => warn!(element = element.id.0, event = event.dom_name(), error = %js_error(&e), "could not attach listener"),
            }
        }
        self.inner.listeners.borrow_mut().insert(element.id, attached);
    }

    fn unlisten(&self, element: &WebMedia) {
        let Some(attached) = self.inner.listeners.borrow_mut().remove(&element.id) else {
            return;
        };
        for (event, closure) in attached {
            let _ = element
                .element
                .remove_event_listener_with_callback(event.dom_name(), closure.as_ref().unchecked_ref());
        }
    }
}

// ── Logging ─────────────────────────────────────────────────

/// Writes one formatted event to the browser console when dropped.
pub struct ConsoleWriter {
    warn: bool,
    buf: Vec<u8>,
}

impl io::Write for ConsoleWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ConsoleWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.buf);
        let line = JsValue::from_str(line.trim_end());
        if self.warn {
            web_sys::console::warn_1(&line);
        } else {
            web_sys::console::log_1(&line);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleMakeWriter;

impl<'a> MakeWriter<'a> for ConsoleMakeWriter {
    type Writer = ConsoleWriter;

    fn make_writer(&'a self) -> ConsoleWriter {
        ConsoleWriter {
            warn: false,
            buf: Vec::new(),
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> ConsoleWriter {
        ConsoleWriter {
            warn: *meta.level() <= Level::WARN,
            buf: Vec::new(),
        }
    }
}

/// Route `tracing` output to the console. Later calls are ignored.
pub fn init_logging(level: &str) {
    let level: Level = level.parse().unwrap_or(Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .without_time()
        .with_ansi(false)
        .with_target(false)
        .with_writer(ConsoleMakeWriter)
        .try_init();
}

// ── Exported engine ─────────────────────────────────────────

type WebRetuner = Retuner<WebAudioEngine, WebPage>;

fn parse_state(state: JsValue) -> std::result::Result<TuningState, JsValue> {
    serde_wasm_bindgen::from_value(state).map_err(|e| to_js(TuneError::InvalidState(e.to_string())))
}

/// Content-script entry point: one instance per page.
#[wasm_bindgen]
pub struct ContentEngine {
    inner: Rc<WebRetuner>,
}

#[wasm_bindgen]
impl ContentEngine {
    /// `config` is an optional object with `EngineConfig` fields.
    #[wasm_bindgen(constructor)]
    pub fn new(config: JsValue) -> std::result::Result<ContentEngine, JsValue> {
        let config: EngineConfig = if config.is_undefined() || config.is_null() {
            EngineConfig::default()
        } else {
            serde_wasm_bindgen::from_value(config)
                .map_err(|e| to_js(TuneError::InvalidConfig(e.to_string())))?
        };
        config.validate().map_err(to_js)?;
        init_logging(&config.log_level);

        let document = web_sys::window()
            .and_then(|w| w.document())
            .ok_or_else(|| JsValue::from_str("no document available"))?;
        let page = WebPage::new(document, &config.media_selector);
        let inner = Rc::new(Retuner::new(WebAudioEngine, page.clone(), &config));

        let weak = Rc::downgrade(&inner);
        page.set_sink(Rc::new(move |event: PageEvent<WebMedia>| {
            let Some(retuner) = weak.upgrade() else {
                return;
            };
            spawn_local(async move { retuner.handle(event).await });
        }));
        page.watch_visibility();

        Ok(ContentEngine { inner })
    }

    /// Apply the persisted state read at startup.
    pub fn start(&self, state: JsValue) -> std::result::Result<Promise, JsValue> {
        let state = parse_state(state)?;
        let inner = self.inner.clone();
        Ok(future_to_promise(async move {
            inner.start(state).await;
            Ok(JsValue::UNDEFINED)
        }))
    }

    /// Apply a state change pushed from storage.
    #[wasm_bindgen(js_name = setState)]
    pub fn set_state(&self, state: JsValue) -> std::result::Result<Promise, JsValue> {
        let state = parse_state(state)?;
        let inner = self.inner.clone();
        Ok(future_to_promise(async move {
            inner.apply_state(state).await;
            Ok(JsValue::UNDEFINED)
        }))
    }

    pub fn status(&self) -> std::result::Result<JsValue, JsValue> {
        serde_wasm_bindgen::to_value(&self.inner.status()).map_err(to_js)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_match_is_exact() {
        let page = "https://site.com";
        assert!(!is_foreign(Some("https://site.com"), page));
        assert!(is_foreign(Some("https://site.com.cdn.net"), page));
        assert!(is_foreign(Some("https://site.com:8443"), page));
        assert!(is_foreign(Some("http://site.com"), page));
        assert!(is_foreign(None, page));
    }
}
