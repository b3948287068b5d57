//! Page Lifecycle Tracker — finds media elements as they come and go and
//! tunes them once they are actually playing.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use tracing::{debug, info};

use crate::graph::AudioGraphManager;
use crate::host::{AudioEngine, ElementId, MediaElement, MediaEvent, PageHost};
use crate::tuner::MediaTuner;

pub struct PageTracker<E, P>
where
    E: AudioEngine,
    P: PageHost<Element = E::Element>,
{
    page: P,
    graph: Rc<AudioGraphManager<E>>,
    tuner: Rc<MediaTuner<E>>,
    /// Elements with listeners attached.
    registrations: RefCell<HashSet<ElementId>>,
    active: Cell<bool>,
}

impl<E, P> PageTracker<E, P>
where
    E: AudioEngine,
    P: PageHost<Element = E::Element>,
{
    pub fn new(page: P, graph: Rc<AudioGraphManager<E>>, tuner: Rc<MediaTuner<E>>) -> Self {
        PageTracker {
            page,
            graph,
            tuner,
            registrations: RefCell::new(HashSet::new()),
            active: Cell::new(false),
        }
    }

    pub fn page(&self) -> &P {
        &self.page
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn is_registered(&self, id: ElementId) -> bool {
        self.registrations.borrow().contains(&id)
    }

    pub fn registered_count(&self) -> usize {
        self.registrations.borrow().len()
    }

    /// Start observing the page and pick up every media element already on it.
    pub async fn activate(&self) {
        if self.active.replace(true) {
            return;
        }
        self.page.observe();
        let elements = self.page.media_elements();
        info!(count = elements.len(), "tracking media elements");
        for element in elements {
            self.register(&element).await;
        }
    }

    /// Tune `element` now if it is playing, and attach listeners once.
    async fn register(&self, element: &E::Element) {
        if !self.active.get() {
            return;
        }
        let id = element.id();
        let playing = element.playback().is_playing();

        if self.registrations.borrow_mut().insert(id) {
            let mut events = Vec::with_capacity(3);
            if !playing {
                events.push(MediaEvent::Playing);
                events.push(MediaEvent::LoadedData);
            }
            if element.kind().has_definite_end() {
                events.push(MediaEvent::Ended);
            }
            if !events.is_empty() {
                self.page.listen(element, &events);
            }
            debug!(element = id.0, playing, "media element registered");
        }

        if playing {
            self.tuner.tune(element, self.page.has_media()).await;
        }
    }

    /// Drop routing, bookkeeping and listeners for an element.
    fn forget(&self, element: &E::Element) {
        let id = element.id();
        let registered = self.registrations.borrow_mut().remove(&id);
        if registered {
            self.page.unlisten(element);
        }
        if registered || self.tuner.is_tuned(id) {
            self.tuner.release(element);
            debug!(element = id.0, "media element released");
        }
    }

    pub async fn on_mutations(&self, added: Vec<E::Element>, removed: Vec<E::Element>) {
        if !self.active.get() {
            return;
        }
        for element in &removed {
            self.forget(element);
        }
        for element in &added {
            self.register(element).await;
        }
    }

    pub async fn on_media_event(&self, element: &E::Element, event: MediaEvent) {
        if !self.active.get() || !self.is_registered(element.id()) {
            return;
        }
        match event {
            MediaEvent::Playing | MediaEvent::LoadedData => {
                self.tuner.tune(element, self.page.has_media()).await;
            }
            MediaEvent::Ended => {
                self.forget(element);
                // Still on the page; a replay is a fresh start.
                self.register(element).await;
            }
        }
    }

    /// Browsers may suspend audio in hidden tabs; resume and re-apply on return.
    pub async fn on_visibility_change(&self, visible: bool) {
        if !visible || !self.active.get() || !self.page.has_media() {
            return;
        }
        self.graph.ensure_active_chain().await;
        self.refresh().await;
    }

    /// Re-apply the current state to every present element.
    pub async fn refresh(&self) {
        if !self.active.get() {
            return;
        }
        for element in self.page.media_elements() {
            if self.tuner.is_tuned(element.id()) {
                self.tuner.tune(&element, self.page.has_media()).await;
            } else {
                self.register(&element).await;
            }
        }
    }

    /// Stop observing and return every present element to native playback.
    pub fn deactivate(&self) {
        if !self.active.replace(false) {
            return;
        }
        self.page.stop_observing();
        for element in self.page.media_elements() {
            self.page.unlisten(&element);
            self.tuner.untune(&element);
        }
        self.registrations.borrow_mut().clear();
        info!("stopped tracking media elements");
    }
}
