use thiserror::Error;

/// Errors raised while building or driving the retuning audio graph.
///
/// Host-engine failures are all recoverable: the graph manager and the
/// tuner catch them and fall back to playback-rate tuning. Only the
/// parse/validation variants are meant to reach a caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TuneError {
    /// The host refused to construct an audio context (no user activation yet).
    #[error("Audio context blocked: {0}")]
    ContextBlocked(String),

    /// Creating a source node for a cross-origin media element was rejected.
    #[error("Cross-origin media cannot be routed: {0}")]
    CrossOriginTaint(String),

    #[error("Failed to load processing module '{path}': {reason}")]
    ModuleLoad { path: String, reason: String },

    #[error("Failed to resume audio context: {0}")]
    Resume(String),

    #[error("Audio context is closed")]
    ContextClosed,

    /// The graph was reset while a connection was still being built.
    #[error("Audio graph was reset while connecting")]
    Reset,

    #[error("Audio graph error: {0}")]
    Graph(String),

    #[error("Unsupported frequency: {0} Hz")]
    InvalidFrequency(u32),

    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid tuning state: {0}")]
    InvalidState(String),
}

impl TuneError {
    /// Whether the failure came from the host audio engine and should be
    /// absorbed by degrading to rate mode instead of being surfaced.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TuneError::ContextBlocked(_)
                | TuneError::CrossOriginTaint(_)
                | TuneError::ModuleLoad { .. }
                | TuneError::Resume(_)
                | TuneError::ContextClosed
                | TuneError::Reset
                | TuneError::Graph(_)
        )
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, TuneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_failures_are_recoverable() {
        assert!(TuneError::ContextBlocked("no gesture".into()).is_recoverable());
        assert!(TuneError::CrossOriginTaint("cdn".into()).is_recoverable());
        assert!(TuneError::ContextClosed.is_recoverable());
        assert!(TuneError::Reset.is_recoverable());
        assert!(
            TuneError::ModuleLoad {
                path: "w.js".into(),
                reason: "404".into()
            }
            .is_recoverable()
        );
    }

    #[test]
    fn caller_errors_are_not_recoverable() {
        assert!(!TuneError::InvalidFrequency(441).is_recoverable());
        assert!(!TuneError::InvalidConfig("empty".into()).is_recoverable());
    }

    #[test]
    fn display_includes_context() {
        let e = TuneError::ModuleLoad {
            path: "soundtouch-worklet.js".into(),
            reason: "network".into(),
        };
        assert_eq!(
            e.to_string(),
            "Failed to load processing module 'soundtouch-worklet.js': network"
        );
    }
}
