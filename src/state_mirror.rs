//! Last-known daemon status, shared between the change detector (sole
//! writer) and any number of readers.

use std::sync::{Arc, RwLock};

use crate::protocol::StatusSnapshot;

#[derive(Clone, Default)]
pub struct StateMirror {
    inner: Arc<RwLock<Option<StatusSnapshot>>>,
}

impl StateMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the cached snapshot, `None` until the first status query.
    pub fn snapshot(&self) -> Option<StatusSnapshot> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_primed(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Swaps in `next` wholesale and returns the previous snapshot.
    pub fn replace(&self, next: StatusSnapshot) -> Option<StatusSnapshot> {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.replace(next)
    }
}

#[cfg(test)]
mod tests {
    use super::StateMirror;
    use crate::protocol::{PlaybackState, StatusSnapshot};

    #[test]
    fn test_replace_returns_previous_snapshot() {
        let mirror = StateMirror::new();
        assert!(!mirror.is_primed());

        let first = StatusSnapshot {
            track_id: Some(4),
            ..StatusSnapshot::default()
        };
        assert_eq!(mirror.replace(first.clone()), None);

        let second = StatusSnapshot {
            track_id: Some(5),
            state: PlaybackState::Playing,
            ..StatusSnapshot::default()
        };
        assert_eq!(mirror.replace(second.clone()), Some(first));
        assert_eq!(mirror.snapshot(), Some(second));
    }

    #[test]
    fn test_clones_share_the_same_snapshot() {
        let mirror = StateMirror::new();
        let reader = mirror.clone();
        mirror.replace(StatusSnapshot {
            shuffle: true,
            ..StatusSnapshot::default()
        });
        assert!(reader.is_primed());
        assert_eq!(reader.snapshot().map(|status| status.shuffle), Some(true));
    }
}
