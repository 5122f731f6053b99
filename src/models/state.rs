//! Download state machine.
//!
//! Transitions for one attempt:
//! - Idle -> Downloading (first attempt)
//! - Completed | Error -> Downloading (retry or another model)
//! - Downloading -> Downloading (progress)
//! - Downloading -> Verifying
//! - Verifying -> Completed
//! - Downloading | Verifying -> Error (failure or cancellation)
//! - Idle | Completed | Error -> Error (rejected before any byte moved)

use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::{broadcast, watch};

use crate::error::{ErrorKind, ModelError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DownloadState {
    Idle,
    Downloading {
        model_id: String,
        progress: f64,
        bytes_done: u64,
        bytes_total: u64,
    },
    Verifying {
        model_id: String,
    },
    Completed {
        model_id: String,
        path: PathBuf,
    },
    Error {
        model_id: String,
        kind: ErrorKind,
        message: String,
    },
}

impl DownloadState {
    pub fn error(model_id: &str, err: &ModelError) -> Self {
        DownloadState::Error {
            model_id: model_id.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed { .. } | DownloadState::Error { .. }
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DownloadState::Downloading { .. } | DownloadState::Verifying { .. }
        )
    }

    pub fn model_id(&self) -> Option<&str> {
        match self {
            DownloadState::Idle => None,
            DownloadState::Downloading { model_id, .. }
            | DownloadState::Verifying { model_id }
            | DownloadState::Completed { model_id, .. }
            | DownloadState::Error { model_id, .. } => Some(model_id),
        }
    }

    pub fn can_transition_to(&self, next: &DownloadState) -> bool {
        use DownloadState::*;
        match (self, next) {
            (Idle | Completed { .. } | Error { .. }, Downloading { .. } | Error { .. }) => true,
            (Downloading { model_id: a, .. }, Downloading { model_id: b, .. })
            | (Downloading { model_id: a, .. }, Verifying { model_id: b })
            | (Verifying { model_id: a }, Completed { model_id: b, .. })
            | (Downloading { model_id: a, .. }, Error { model_id: b, .. })
            | (Verifying { model_id: a }, Error { model_id: b, .. }) => a == b,
            _ => false,
        }
    }
}

const TRANSITION_BUFFER: usize = 256;

/// Owns the single live [`DownloadState`].
///
/// Observers either read a snapshot (`watch`) or follow every transition
/// (`broadcast`). Slow broadcast receivers may lag and skip progress updates;
/// the snapshot is always current.
pub struct DownloadStateHolder {
    snapshot: watch::Sender<DownloadState>,
    transitions: broadcast::Sender<DownloadState>,
}

impl Default for DownloadStateHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadStateHolder {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(DownloadState::Idle);
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            snapshot,
            transitions,
        }
    }

    pub fn current(&self) -> DownloadState {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadState> {
        self.snapshot.subscribe()
    }

    pub fn transitions(&self) -> broadcast::Receiver<DownloadState> {
        self.transitions.subscribe()
    }

    /// Apply `next` if it is a legal successor of the current state.
    pub fn transition(&self, next: DownloadState) -> bool {
        let mut applied = false;
        self.snapshot.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                *current = next.clone();
                applied = true;
            } else {
                log::warn!(
                    "[DownloadState] Ignoring invalid transition {:?} -> {:?}",
                    current,
                    next
                );
            }
            applied
        });
        if applied {
            // No receivers is fine
            let _ = self.transitions.send(next);
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downloading(id: &str, progress: f64) -> DownloadState {
        DownloadState::Downloading {
            model_id: id.to_string(),
            progress,
            bytes_done: 0,
            bytes_total: 0,
        }
    }

    #[test]
    fn test_valid_sequence() {
        let holder = DownloadStateHolder::new();
        assert_eq!(holder.current(), DownloadState::Idle);
        assert!(holder.transition(downloading("tiny", 0.0)));
        assert!(holder.transition(downloading("tiny", 0.5)));
        assert!(holder.transition(DownloadState::Verifying {
            model_id: "tiny".into()
        }));
        assert!(holder.transition(DownloadState::Completed {
            model_id: "tiny".into(),
            path: PathBuf::from("/m/tiny.bin"),
        }));
        assert!(holder.current().is_terminal());
        // Next attempt restarts directly
        assert!(holder.transition(downloading("base", 0.0)));
    }

    #[test]
    fn test_rejects_out_of_order_transitions() {
        let holder = DownloadStateHolder::new();
        assert!(!holder.transition(DownloadState::Verifying {
            model_id: "tiny".into()
        }));
        assert!(holder.transition(downloading("tiny", 0.1)));
        assert!(!holder.transition(DownloadState::Completed {
            model_id: "tiny".into(),
            path: PathBuf::from("/m/tiny.bin"),
        }));
        // A second model cannot start while one is active
        assert!(!holder.transition(downloading("base", 0.0)));
        assert!(!holder.transition(DownloadState::Idle));
    }

    #[test]
    fn test_cancel_from_verifying_is_error() {
        let holder = DownloadStateHolder::new();
        holder.transition(downloading("tiny", 1.0));
        holder.transition(DownloadState::Verifying {
            model_id: "tiny".into(),
        });
        assert!(holder.transition(DownloadState::error("tiny", &ModelError::Cancelled)));
        match holder.current() {
            DownloadState::Error { kind, .. } => assert_eq!(kind, ErrorKind::Cancelled),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_observers_see_transitions() {
        let holder = DownloadStateHolder::new();
        let mut rx = holder.transitions();
        let mut snapshot = holder.subscribe();

        holder.transition(downloading("tiny", 0.0));
        holder.transition(DownloadState::error(
            "tiny",
            &ModelError::Network("HTTP 404".into()),
        ));

        assert!(matches!(rx.recv().await.unwrap(), DownloadState::Downloading { .. }));
        assert!(matches!(rx.recv().await.unwrap(), DownloadState::Error { .. }));
        snapshot.changed().await.unwrap();
        assert!(snapshot.borrow().is_terminal());
    }

    #[test]
    fn test_state_serializes_with_tag() {
        let json = serde_json::to_value(downloading("tiny", 0.25)).unwrap();
        assert_eq!(json["state"], "downloading");
        assert_eq!(json["model_id"], "tiny");
    }
}
