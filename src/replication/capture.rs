//! Change capture: primary store mutations into the change log

use std::sync::Arc;

use crate::events::EventBus;
use crate::storage::{MutationObserver, ObservableStore, SubscriptionId};
use crate::types::Mutation;

use super::ReplicationMetadataStore;

/// Which mutations are recorded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapturePolicy {
    /// Record writes the driver applied from a peer. Off by default: two
    /// servers pulling from each other would otherwise echo changes forever.
    pub capture_replicated: bool,
}

impl CapturePolicy {
    pub fn capture_all() -> Self {
        Self {
            capture_replicated: true,
        }
    }

    pub fn should_capture(&self, mutation: &Mutation) -> bool {
        self.capture_replicated || !mutation.origin.is_replicated()
    }
}

/// Observer attached to the primary store for the server's lifetime
///
/// Runs synchronously inside each write. A failed append is reported on the
/// event bus and never fails the write itself.
pub struct ChangeCaptureLog {
    primary: Arc<dyn ObservableStore>,
    subscription: SubscriptionId,
    policy: CapturePolicy,
}

impl ChangeCaptureLog {
    pub fn attach(
        primary: Arc<dyn ObservableStore>,
        metadata: Arc<ReplicationMetadataStore>,
        events: EventBus,
        policy: CapturePolicy,
    ) -> Self {
        let observer: MutationObserver = Arc::new(move |mutation: &Mutation| {
            if !policy.should_capture(mutation) {
                tracing::trace!(key = %mutation.key, "skipping replicated mutation");
                return;
            }
            match metadata.append_change(mutation.change_type, &mutation.key) {
                Ok(record) => {
                    tracing::trace!(
                        timestamp = %record.timestamp,
                        kind = %record.change_type,
                        key = %record.key,
                        "captured change"
                    );
                }
                Err(e) => events.error("capture", &e),
            }
        });

        let subscription = primary.subscribe(observer);
        tracing::debug!(?policy, "change capture attached");

        Self {
            primary,
            subscription,
            policy,
        }
    }

    pub fn policy(&self) -> CapturePolicy {
        self.policy
    }

    /// Stop capturing; returns false if already detached
    pub fn detach(&self) -> bool {
        self.primary.unsubscribe(self.subscription)
    }
}
