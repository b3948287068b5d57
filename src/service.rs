//! Retuner — one engine instance per page, wiring the tuning state, the
//! audio graph, the tuner and the page tracker together.

use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::frequency::DerivedFactors;
use crate::graph::AudioGraphManager;
use crate::host::{AudioEngine, PageEvent, PageHost};
use crate::state::{SharedState, TuningState};
use crate::tracker::PageTracker;
use crate::tuner::MediaTuner;

/// Snapshot of the engine for display in the popup.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub state: TuningState,
    pub factors: DerivedFactors,
    pub cents: f64,
    pub tracking: bool,
    pub registered_elements: usize,
    pub bound_elements: usize,
    pub rate_elements: usize,
    pub pitch_elements: usize,
    pub pitch_available: bool,
}

pub struct Retuner<E, P>
where
    E: AudioEngine,
    P: PageHost<Element = E::Element>,
{
    state: SharedState,
    graph: Rc<AudioGraphManager<E>>,
    tuner: Rc<MediaTuner<E>>,
    tracker: PageTracker<E, P>,
}

impl<E, P> Retuner<E, P>
where
    E: AudioEngine,
    P: PageHost<Element = E::Element>,
{
    pub fn new(engine: E, page: P, config: &EngineConfig) -> Self {
        let state = SharedState::default();
        let graph = Rc::new(AudioGraphManager::new(engine, config));
        let tuner = Rc::new(MediaTuner::new(graph.clone(), state.clone()));
        let tracker = PageTracker::new(page, graph.clone(), tuner.clone());
        Retuner {
            state,
            graph,
            tuner,
            tracker,
        }
    }

    /// Apply the persisted snapshot read at startup.
    pub async fn start(&self, initial: TuningState) {
        info!(
            enabled = initial.enabled,
            mode = %initial.mode,
            frequency = %initial.target_frequency,
            "retuner starting"
        );
        self.apply_state(initial).await;
    }

    /// Replace the tuning state and bring the page in line with it.
    pub async fn apply_state(&self, next: TuningState) {
        let previous = self.state.replace(next);
        debug!(?previous, ?next, "tuning state changed");

        if next.enabled {
            if self.tracker.is_active() {
                self.tracker.refresh().await;
            } else {
                self.tracker.activate().await;
            }
        } else {
            self.tracker.deactivate();
            self.graph.reset_all();
        }
    }

    pub async fn handle(&self, event: PageEvent<E::Element>) {
        match event {
            PageEvent::Mutations { added, removed } => {
                self.tracker.on_mutations(added, removed).await;
            }
            PageEvent::Media { element, event } => {
                self.tracker.on_media_event(&element, event).await;
            }
            PageEvent::Visibility { visible } => {
                self.tracker.on_visibility_change(visible).await;
            }
        }
    }

    pub fn state(&self) -> TuningState {
        self.state.snapshot()
    }

    pub fn graph(&self) -> &AudioGraphManager<E> {
        &self.graph
    }

    pub fn tuner(&self) -> &MediaTuner<E> {
        &self.tuner
    }

    pub fn tracker(&self) -> &PageTracker<E, P> {
        &self.tracker
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.state.snapshot();
        let factors = state.factors();
        let (rate_elements, pitch_elements) = self.tuner.counts();
        EngineStatus {
            state,
            factors,
            cents: factors.cents(),
            tracking: self.tracker.is_active(),
            registered_elements: self.tracker.registered_count(),
            bound_elements: self.graph.bound_count(),
            rate_elements,
            pitch_elements,
            pitch_available: self.graph.pitch_available(),
        }
    }
}
