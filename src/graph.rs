//! Audio Graph Manager — owns the page's single audio context and the
//! single shared pitch-shift processor, and routes each media element
//! either through that processor or straight to the output.
//!
//! Everything bound to a context (processor, loaded module, per-element
//! sources) is dropped together when the context has to be rebuilt.
//! Methods take `&self` and never hold a `RefCell` borrow across an
//! `.await`, so several tuning attempts may interleave on one event loop.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use futures::lock::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Result, TuneError};
use crate::host::{AudioEngine, ContextState, ElementId, MediaElement};

/// Where an element's source node currently sends its audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    /// Through the shared pitch-shift processor.
    Processor,
    /// Directly to the output device, untouched.
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModuleState {
    Unloaded,
    Loaded,
    /// Loading failed; pitch shifting is off until a fresh context exists.
    Failed,
}

struct Binding<S> {
    source: S,
    route: Route,
}

pub struct AudioGraphManager<E: AudioEngine> {
    engine: E,
    worklet_path: String,
    processor_name: String,
    pitch_param: String,
    ctx: RefCell<Option<E::Context>>,
    /// Bumped every time a new context replaces the old one.
    epoch: Cell<u64>,
    /// Bumped by `reset_all`; in-flight connections started before a reset
    /// must not build anything after it.
    generation: Cell<u64>,
    module: Cell<ModuleState>,
    processor: RefCell<Option<E::Processor>>,
    /// Serialises module loading and processor creation.
    processor_lock: Mutex<()>,
    bindings: RefCell<HashMap<ElementId, Binding<E::Source>>>,
    last_pitch: Cell<Option<f64>>,
}

impl<E: AudioEngine> AudioGraphManager<E> {
    pub fn new(engine: E, config: &EngineConfig) -> Self {
        AudioGraphManager {
            engine,
            worklet_path: config.worklet_path.clone(),
            processor_name: config.processor_name.clone(),
            pitch_param: config.pitch_param.clone(),
            ctx: RefCell::new(None),
            epoch: Cell::new(0),
            generation: Cell::new(0),
            module: Cell::new(ModuleState::Unloaded),
            processor: RefCell::new(None),
            processor_lock: Mutex::new(()),
            bindings: RefCell::new(HashMap::new()),
            last_pitch: Cell::new(None),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Return the live context, building a new one if there is none or the
    /// engine reports the old one closed.
    pub fn ensure_context(&self) -> Result<E::Context> {
        let mut slot = self.ctx.borrow_mut();
        if let Some(ctx) = slot.as_ref() {
            if self.engine.context_state(ctx) != ContextState::Closed {
                return Ok(ctx.clone());
            }
            info!("audio context was closed, rebuilding the graph");
        }

        let ctx = self.engine.create_context()?;
        // Nodes and modules belong to the old context.
        self.processor.borrow_mut().take();
        self.bindings.borrow_mut().clear();
        self.module.set(ModuleState::Unloaded);
        self.last_pitch.set(None);
        self.epoch.set(self.epoch.get() + 1);
        debug!(epoch = self.epoch.get(), "audio context created");

        *slot = Some(ctx.clone());
        Ok(ctx)
    }

    /// Best-effort resume of a suspended or interrupted context. Failures
    /// are expected before the first user gesture and are not reported.
    pub async fn ensure_active_chain(&self) {
        let ctx = self.ctx.borrow().clone();
        let Some(ctx) = ctx else {
            return;
        };
        if !self.engine.context_state(&ctx).needs_resume() {
            return;
        }
        if let Err(e) = self.engine.resume(&ctx).await {
            debug!(error = %e, "audio context resume deferred");
        }
    }

    /// Shared processor, loading the worklet module at most once per context.
    pub async fn ensure_processor(&self) -> Result<E::Processor> {
        self.processor_since(self.generation.get()).await
    }

    /// Like [`ensure_processor`](Self::ensure_processor), but gives up
    /// without building anything once the graph has been reset past
    /// `generation`.
    async fn processor_since(&self, generation: u64) -> Result<E::Processor> {
        let _guard = self.processor_lock.lock().await;
        self.check_generation(generation)?;

        if let Some(processor) = self.processor.borrow().clone() {
            return Ok(processor);
        }

        let ctx = self.ensure_context()?;
        let epoch = self.epoch.get();

        match self.module.get() {
            ModuleState::Failed => {
                return Err(TuneError::ModuleLoad {
                    path: self.worklet_path.clone(),
                    reason: "unavailable until a new audio context".to_string(),
                });
            }
            ModuleState::Unloaded => {
                let loaded = self.engine.load_module(&ctx, &self.worklet_path).await;
                if self.epoch.get() != epoch {
                    return Err(TuneError::ContextClosed);
                }
                self.check_generation(generation)?;
                if let Err(e) = loaded {
                    warn!(path = %self.worklet_path, error = %e, "pitch shifting unavailable for this page");
                    self.module.set(ModuleState::Failed);
                    return Err(e);
                }
                self.module.set(ModuleState::Loaded);
                debug!(path = %self.worklet_path, "processing module loaded");
            }
            ModuleState::Loaded => {}
        }

        self.check_generation(generation)?;
        let processor = self.engine.create_processor(&ctx, &self.processor_name)?;
        if let Err(e) = self.engine.connect_processor_to_output(&ctx, &processor) {
            self.engine.disconnect_processor(&processor);
            return Err(e);
        }
        *self.processor.borrow_mut() = Some(processor.clone());
        self.last_pitch.set(None);
        Ok(processor)
    }

    fn check_generation(&self, generation: u64) -> Result<()> {
        if self.generation.get() == generation {
            Ok(())
        } else {
            Err(TuneError::Reset)
        }
    }

    /// Route `element` through the shared processor.
    ///
    /// Returns false on any failure; the caller falls back to rate mode.
    /// The failure is only logged as a warning when the page actually has
    /// media, to keep pages without media quiet.
    pub async fn connect(&self, element: &E::Element, page_has_media: bool) -> bool {
        match self.try_connect(element).await {
            Ok(()) => true,
            Err(TuneError::Reset) => {
                debug!(element = element.id().0, "connection abandoned after reset");
                false
            }
            Err(e) => {
                if page_has_media {
                    warn!(element = element.id().0, error = %e, "pitch routing unavailable, falling back to playback rate");
                } else {
                    debug!(element = element.id().0, error = %e, "pitch routing unavailable");
                }
                false
            }
        }
    }

    async fn try_connect(&self, element: &E::Element) -> Result<()> {
        let ctx = self.ensure_context()?;
        let epoch = self.epoch.get();
        let generation = self.generation.get();
        self.ensure_active_chain().await;
        if self.epoch.get() != epoch {
            return Err(TuneError::ContextClosed);
        }
        self.check_generation(generation)?;

        self.ensure_source(&ctx, element)?;
        let processor = self.processor_since(generation).await?;
        if self.epoch.get() != epoch {
            return Err(TuneError::ContextClosed);
        }
        self.check_generation(generation)?;

        let id = element.id();
        let mut bindings = self.bindings.borrow_mut();
        let Some(binding) = bindings.get_mut(&id) else {
            return Err(TuneError::Graph(format!("element {} lost its source", id.0)));
        };
        if binding.route == Route::Processor {
            return Ok(());
        }

        self.engine.disconnect_source(&binding.source);
        if let Err(e) = self.engine.connect_source(&binding.source, &processor) {
            if let Err(restore) = self.engine.connect_source_to_output(&ctx, &binding.source) {
                warn!(element = id.0, error = %restore, "could not restore native audio path");
            }
            binding.route = Route::Output;
            return Err(e);
        }
        binding.route = Route::Processor;
        debug!(element = id.0, "routed through pitch processor");
        Ok(())
    }

    /// Create the element's source node on first use. A fresh source is
    /// wired straight to the output so audio never goes silent.
    fn ensure_source(&self, ctx: &E::Context, element: &E::Element) -> Result<()> {
        let id = element.id();
        if self.bindings.borrow().contains_key(&id) {
            return Ok(());
        }
        let source = self.engine.create_source(ctx, element)?;
        self.engine.connect_source_to_output(ctx, &source)?;
        self.bindings.borrow_mut().insert(
            id,
            Binding {
                source,
                route: Route::Output,
            },
        );
        Ok(())
    }

    /// Send `element` straight to the output, bypassing the processor.
    /// No-op for elements that were never connected.
    pub fn disconnect(&self, element: &E::Element) {
        self.disconnect_id(element.id());
    }

    fn disconnect_id(&self, id: ElementId) {
        let ctx = self.ctx.borrow().clone();
        let Some(ctx) = ctx else {
            return;
        };
        let mut bindings = self.bindings.borrow_mut();
        let Some(binding) = bindings.get_mut(&id) else {
            return;
        };
        if binding.route == Route::Output {
            return;
        }
        self.engine.disconnect_source(&binding.source);
        if let Err(e) = self.engine.connect_source_to_output(&ctx, &binding.source) {
            warn!(element = id.0, error = %e, "could not restore native audio path");
        }
        binding.route = Route::Output;
        debug!(element = id.0, "routed to output");
    }

    /// Detach every element, drop the shared processor and require the
    /// module to be reloaded. The context itself is kept for reuse.
    /// Connections still in flight are abandoned.
    pub fn reset_all(&self) {
        self.generation.set(self.generation.get() + 1);
        let ids: Vec<ElementId> = self.bindings.borrow().keys().copied().collect();
        for id in ids {
            self.disconnect_id(id);
        }
        if let Some(processor) = self.processor.borrow_mut().take() {
            self.engine.disconnect_processor(&processor);
            debug!("shared processor released");
        }
        if self.module.get() == ModuleState::Loaded {
            self.module.set(ModuleState::Unloaded);
        }
        self.last_pitch.set(None);
    }

    /// Set the shared processor's pitch parameter. Repeating the current
    /// value is skipped.
    pub fn set_pitch(&self, value: f64) {
        let processor = self.processor.borrow().clone();
        let ctx = self.ctx.borrow().clone();
        let (Some(processor), Some(ctx)) = (processor, ctx) else {
            return;
        };
        if self.last_pitch.get() == Some(value) {
            return;
        }
        let at = self.engine.current_time(&ctx);
        match self
            .engine
            .set_param(&processor, &self.pitch_param, value, at)
        {
            Ok(()) => self.last_pitch.set(Some(value)),
            Err(e) => warn!(value, error = %e, "failed to set pitch"),
        }
    }

    pub fn route(&self, id: ElementId) -> Option<Route> {
        self.bindings.borrow().get(&id).map(|b| b.route)
    }

    /// Number of elements that own a source node in the current context.
    pub fn bound_count(&self) -> usize {
        self.bindings.borrow().len()
    }

    pub fn has_processor(&self) -> bool {
        self.processor.borrow().is_some()
    }

    /// False once the module failed to load in the current context.
    pub fn pitch_available(&self) -> bool {
        self.module.get() != ModuleState::Failed
    }

    pub fn current_pitch(&self) -> Option<f64> {
        self.last_pitch.get()
    }
}
