//! Media Tuner — applies the current tuning to one media element, either
//! by playback rate or by routing through the shared pitch processor.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde::Serialize;
use tracing::debug;

use crate::frequency::{Mode, compute_factors};
use crate::graph::AudioGraphManager;
use crate::host::{AudioEngine, ElementId, MediaElement};
use crate::state::SharedState;

/// How an element is currently tuned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TuneMode {
    Untuned,
    Rate,
    Pitch,
}

pub struct MediaTuner<E: AudioEngine> {
    graph: Rc<AudioGraphManager<E>>,
    state: SharedState,
    modes: RefCell<HashMap<ElementId, TuneMode>>,
}

impl<E: AudioEngine> MediaTuner<E> {
    pub fn new(graph: Rc<AudioGraphManager<E>>, state: SharedState) -> Self {
        MediaTuner {
            graph,
            state,
            modes: RefCell::new(HashMap::new()),
        }
    }

    /// Bring `element` in line with the live tuning state.
    ///
    /// The state is re-read after the graph connection is awaited; if it
    /// changed meanwhile the decision is made again against the newer one.
    /// A pitch request whose connection fails degrades to rate mode for
    /// this attempt only.
    pub async fn tune(&self, element: &E::Element, page_has_media: bool) -> TuneMode {
        loop {
            let snapshot = self.state.snapshot();
            if !snapshot.enabled {
                self.untune(element);
                return TuneMode::Untuned;
            }

            let factors = snapshot.factors();
            match snapshot.mode {
                Mode::Rate => {
                    self.apply_rate(element, factors.current_playback_rate);
                    return TuneMode::Rate;
                }
                Mode::Pitch => {
                    let connected = self.graph.connect(element, page_has_media).await;
                    if self.state.snapshot() != snapshot {
                        debug!(element = element.id().0, "tuning state changed while connecting");
                        continue;
                    }
                    if connected {
                        self.apply_pitch(element, factors.current_pitch);
                        return TuneMode::Pitch;
                    }
                    let fallback = compute_factors(snapshot.target_frequency, Mode::Rate);
                    self.apply_rate(element, fallback.current_playback_rate);
                    return TuneMode::Rate;
                }
            }
        }
    }

    fn apply_rate(&self, element: &E::Element, rate: f64) {
        self.graph.disconnect(element);
        // Without this the browser time-stretches and the pitch never moves.
        element.set_preserves_pitch(false);
        element.set_playback_rate(rate);
        self.set_mode(element.id(), TuneMode::Rate);
        debug!(element = element.id().0, rate, "rate mode");
    }

    fn apply_pitch(&self, element: &E::Element, pitch: f64) {
        element.set_preserves_pitch(true);
        element.set_playback_rate(1.0);
        self.graph.set_pitch(pitch);
        self.set_mode(element.id(), TuneMode::Pitch);
        debug!(element = element.id().0, pitch, "pitch mode");
    }

    /// Return `element` to native playback and forget it.
    pub fn untune(&self, element: &E::Element) {
        self.graph.disconnect(element);
        element.set_playback_rate(1.0);
        element.set_preserves_pitch(true);
        self.modes.borrow_mut().remove(&element.id());
    }

    /// Drop pitch routing and bookkeeping for an element that left the
    /// page or finished, without touching its playback settings.
    pub fn release(&self, element: &E::Element) {
        self.graph.disconnect(element);
        self.modes.borrow_mut().remove(&element.id());
    }

    fn set_mode(&self, id: ElementId, mode: TuneMode) {
        self.modes.borrow_mut().insert(id, mode);
    }

    pub fn mode_of(&self, id: ElementId) -> TuneMode {
        self.modes
            .borrow()
            .get(&id)
            .copied()
            .unwrap_or(TuneMode::Untuned)
    }

    pub fn is_tuned(&self, id: ElementId) -> bool {
        self.modes.borrow().contains_key(&id)
    }

    /// Number of tuned elements in each mode, as `(rate, pitch)`.
    pub fn counts(&self) -> (usize, usize) {
        let modes = self.modes.borrow();
        let rate = modes.values().filter(|m| **m == TuneMode::Rate).count();
        let pitch = modes.values().filter(|m| **m == TuneMode::Pitch).count();
        (rate, pitch)
    }
}
