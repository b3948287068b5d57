//! Host interfaces — the audio engine and page the retuner drives.
//!
//! The browser implementation lives in [`crate::web`]; tests use a
//! recording fake. Everything here is single-threaded: handles are cheap
//! clones of host objects and futures are not `Send`.

use serde::Serialize;

use crate::error::Result;

/// Identity of one media element for the lifetime of the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ElementId(pub u64);

/// Kind of media element, decided once when the element is discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Videos play to a definite end after which their routing is released.
    /// Audio elements are commonly reused by players for the next track.
    pub fn has_definite_end(self) -> bool {
        matches!(self, MediaKind::Video)
    }
}

/// HTMLMediaElement readyState at which current data is available.
pub const HAVE_CURRENT_DATA: u16 = 2;

/// Playback readiness as reported by the element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSnapshot {
    pub paused: bool,
    pub ended: bool,
    pub current_time: f64,
    pub ready_state: u16,
}

impl PlaybackSnapshot {
    /// Is the element audibly playing right now?
    pub fn is_playing(&self) -> bool {
        !self.paused && !self.ended && self.current_time > 0.0 && self.ready_state > HAVE_CURRENT_DATA
    }
}

/// Lifecycle events the tracker subscribes to on each element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaEvent {
    Playing,
    LoadedData,
    Ended,
}

impl MediaEvent {
    pub fn dom_name(self) -> &'static str {
        match self {
            MediaEvent::Playing => "playing",
            MediaEvent::LoadedData => "loadeddata",
            MediaEvent::Ended => "ended",
        }
    }
}

/// State of an audio context as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Running,
    Suspended,
    /// Safari pauses contexts on interruptions such as phone calls.
    Interrupted,
    Closed,
}

impl ContextState {
    pub fn needs_resume(self) -> bool {
        matches!(self, ContextState::Suspended | ContextState::Interrupted)
    }
}

/// A media element on the page.
pub trait MediaElement: Clone {
    fn id(&self) -> ElementId;
    fn kind(&self) -> MediaKind;
    fn playback(&self) -> PlaybackSnapshot;
    fn playback_rate(&self) -> f64;
    fn set_playback_rate(&self, rate: f64);
    fn preserves_pitch(&self) -> bool;
    /// Toggle every pitch-preservation flag the element supports.
    fn set_preserves_pitch(&self, preserve: bool);
}

/// Audio engine operations used by the graph manager only.
#[allow(async_fn_in_trait)]
pub trait AudioEngine {
    type Element: MediaElement;
    type Context: Clone;
    type Source: Clone;
    type Processor: Clone;

    /// Fails with [`crate::error::TuneError::ContextBlocked`] when the host
    /// refuses, e.g. before any user activation.
    fn create_context(&self) -> Result<Self::Context>;
    fn context_state(&self, ctx: &Self::Context) -> ContextState;
    fn current_time(&self, ctx: &Self::Context) -> f64;
    async fn resume(&self, ctx: &Self::Context) -> Result<()>;
    async fn load_module(&self, ctx: &Self::Context, path: &str) -> Result<()>;
    fn create_processor(&self, ctx: &Self::Context, name: &str) -> Result<Self::Processor>;
    /// Fails with [`crate::error::TuneError::CrossOriginTaint`] for tainted media.
    fn create_source(&self, ctx: &Self::Context, element: &Self::Element) -> Result<Self::Source>;
    fn connect_source(&self, source: &Self::Source, processor: &Self::Processor) -> Result<()>;
    fn connect_source_to_output(&self, ctx: &Self::Context, source: &Self::Source) -> Result<()>;
    fn connect_processor_to_output(&self, ctx: &Self::Context, processor: &Self::Processor) -> Result<()>;
    /// Detach a source from everything it feeds. Never fails.
    fn disconnect_source(&self, source: &Self::Source);
    fn disconnect_processor(&self, processor: &Self::Processor);
    fn set_param(&self, processor: &Self::Processor, name: &str, value: f64, at_time: f64) -> Result<()>;
}

/// DOM access used by the page tracker.
pub trait PageHost {
    type Element: MediaElement;

    /// Every qualifying media element currently in the document.
    fn media_elements(&self) -> Vec<Self::Element>;
    fn has_media(&self) -> bool {
        !self.media_elements().is_empty()
    }
    /// Start delivering subtree mutations as [`PageEvent::Mutations`].
    fn observe(&self);
    fn stop_observing(&self);
    /// Register one-shot listeners; fired events arrive as [`PageEvent::Media`].
    fn listen(&self, element: &Self::Element, events: &[MediaEvent]);
    fn unlisten(&self, element: &Self::Element);
}

/// Something that happened on the page, delivered by the host.
#[derive(Debug, Clone)]
pub enum PageEvent<E> {
    /// Qualifying media found in added/removed subtrees, flattened.
    Mutations { added: Vec<E>, removed: Vec<E> },
    Media { element: E, event: MediaEvent },
    Visibility { visible: bool },
}
