// Presence Reconciliation
//
// Copies ephemeral presence changes into the durable profile document. The
// decision is a pure function over (change, current ephemeral value); the
// reconciler only adds the re-read and the merge write around it.

use chatpresence_core::document::Fields;
use chatpresence_core::{
    ChatPresenceError, DurableStatus, DurableStore, EphemeralStore, EpochMillis, PresenceChange,
    PresencePaths, PresenceRecord,
};
use std::sync::Arc;

/// Durable write produced by a reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWrite {
    /// Profile document path, e.g. `users/42`
    pub document: String,
    pub status: DurableStatus,
}

impl StatusWrite {
    /// `{status: {...}}`, the partial fields merged onto the profile
    pub fn fields(&self) -> Result<Fields, ChatPresenceError> {
        let mut fields = Fields::new();
        fields.insert(
            DurableStatus::FIELD.to_string(),
            serde_json::to_value(&self.status)?,
        );
        Ok(fields)
    }
}

/// Result of the pure reconciliation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Apply(StatusWrite),
    /// A newer value already superseded this event
    Stale {
        current: EpochMillis,
        event: EpochMillis,
    },
}

/// Decide what one change event does to the durable store.
///
/// `current` is the ephemeral value re-read after the event fired. The event is
/// dropped only when `current` is strictly newer; equal timestamps re-apply,
/// which keeps duplicate delivery harmless.
pub fn reconcile(
    change: &PresenceChange,
    current: Option<&PresenceRecord>,
    paths: &PresencePaths,
) -> Result<Reconciliation, ChatPresenceError> {
    PresencePaths::validate_user_id(&change.user_id)?;
    let event = change.after;

    if let Some(current) = current {
        if current.last_changed > event.last_changed {
            return Ok(Reconciliation::Stale {
                current: current.last_changed,
                event: event.last_changed,
            });
        }
    }

    let status = DurableStatus::from_record(&event)?;
    Ok(Reconciliation::Apply(StatusWrite {
        document: paths.user_document(&change.user_id),
        status,
    }))
}

/// Stateless change handler, shared across all users
pub struct PresenceReconciler {
    ephemeral: Arc<dyn EphemeralStore>,
    durable: Arc<dyn DurableStore>,
    paths: PresencePaths,
}

impl PresenceReconciler {
    pub fn new(
        ephemeral: Arc<dyn EphemeralStore>,
        durable: Arc<dyn DurableStore>,
        paths: PresencePaths,
    ) -> Self {
        Self {
            ephemeral,
            durable,
            paths,
        }
    }

    pub fn paths(&self) -> &PresencePaths {
        &self.paths
    }

    /// Handle one change event. An `Err` means the invocation failed and the
    /// caller decides whether to redeliver.
    pub async fn handle(&self, change: &PresenceChange) -> Result<Reconciliation, ChatPresenceError> {
        let key = self.paths.status_key(&change.user_id);
        let current = self.ephemeral.read(&key).await?;

        let decision = reconcile(change, current.as_ref(), &self.paths)?;
        match &decision {
            Reconciliation::Stale { current, event } => {
                tracing::debug!(
                    user_id = %change.user_id,
                    "Suppressed stale presence event ({} < {})",
                    event,
                    current
                );
            }
            Reconciliation::Apply(write) => {
                self.durable
                    .merge_write(&write.document, write.fields()?)
                    .await?;
                tracing::debug!(
                    user_id = %change.user_id,
                    "Durable presence set to {} at {}",
                    write.status.state,
                    write.status.last_changed
                );
            }
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chatpresence_core::{
        Document, DocumentSource, InMemoryDurableStore, InMemoryEphemeralStore, PresenceState,
        PresenceWrite,
    };

    fn change(user_id: &str, state: PresenceState, millis: i64) -> PresenceChange {
        PresenceChange {
            user_id: user_id.to_string(),
            before: None,
            after: PresenceRecord::new(state, millis),
        }
    }

    fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for (i, first) in items.iter().enumerate() {
            let mut rest = items.to_vec();
            rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, *first);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_stale_event_is_suppressed() {
        let paths = PresencePaths::default();
        let current = PresenceRecord::new(PresenceState::Online, 100);
        let result = reconcile(&change("42", PresenceState::Offline, 50), Some(&current), &paths);
        assert_eq!(
            result.unwrap(),
            Reconciliation::Stale {
                current: EpochMillis(100),
                event: EpochMillis(50),
            }
        );
    }

    #[test]
    fn test_equal_or_missing_current_applies() {
        let paths = PresencePaths::default();
        let current = PresenceRecord::new(PresenceState::Online, 100);

        let result = reconcile(&change("42", PresenceState::Online, 100), Some(&current), &paths);
        assert!(matches!(result, Ok(Reconciliation::Apply(_))));

        let result = reconcile(&change("42", PresenceState::Online, 100), None, &paths).unwrap();
        match result {
            Reconciliation::Apply(write) => {
                assert_eq!(write.document, "users/42");
                assert_eq!(write.status.state, PresenceState::Online);
                assert_eq!(write.status.last_changed.timestamp_millis(), 100);
            }
            other => panic!("expected apply, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_timestamp_is_an_error() {
        let paths = PresencePaths::default();
        let result = reconcile(&change("42", PresenceState::Online, i64::MAX), None, &paths);
        assert!(result.is_err());
    }

    #[test]
    fn test_convergence_under_any_delivery_order() {
        let paths = PresencePaths::default();
        let events = [
            change("42", PresenceState::Online, 10),
            change("42", PresenceState::Offline, 20),
            change("42", PresenceState::Online, 30),
            change("42", PresenceState::Offline, 40),
        ];
        // Every re-read observes the last write
        let latest = events[3].after;

        for order in permutations(&[0, 1, 2, 3]) {
            let mut durable: Option<DurableStatus> = None;
            for index in order.iter().copied() {
                if let Reconciliation::Apply(write) =
                    reconcile(&events[index], Some(&latest), &paths).unwrap()
                {
                    durable = Some(write.status);
                }
            }
            let durable = durable.expect("latest event always applies");
            assert_eq!(durable.state, PresenceState::Offline, "order {:?}", order);
            assert_eq!(durable.last_changed.timestamp_millis(), 40, "order {:?}", order);
        }
    }

    #[tokio::test]
    async fn test_handle_writes_status_and_keeps_profile() {
        let ephemeral = Arc::new(InMemoryEphemeralStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        let mut profile = Fields::new();
        profile.insert("displayName".to_string(), serde_json::json!("Ada"));
        durable.insert("users/42", profile).await.unwrap();

        ephemeral
            .apply("status/42", PresenceWrite::at(PresenceState::Online, 100))
            .await;
        let reconciler =
            PresenceReconciler::new(ephemeral.clone(), durable.clone(), PresencePaths::default());

        let outcome = reconciler
            .handle(&change("42", PresenceState::Online, 100))
            .await
            .unwrap();
        assert!(matches!(outcome, Reconciliation::Apply(_)));

        let doc = durable.document("users/42").await.unwrap();
        assert_eq!(doc.fields["displayName"], "Ada");
        let status = DurableStatus::from_fields(&doc.fields).unwrap();
        assert_eq!(status.state, PresenceState::Online);
        assert_eq!(status.last_changed.timestamp_millis(), 100);
    }

    #[tokio::test]
    async fn test_handle_stale_leaves_durable_untouched() {
        let ephemeral = Arc::new(InMemoryEphemeralStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        ephemeral
            .apply("status/42", PresenceWrite::at(PresenceState::Online, 100))
            .await;
        let reconciler =
            PresenceReconciler::new(ephemeral.clone(), durable.clone(), PresencePaths::default());

        reconciler
            .handle(&change("42", PresenceState::Online, 100))
            .await
            .unwrap();
        let before = durable.document("users/42").await;

        let outcome = reconciler
            .handle(&change("42", PresenceState::Offline, 50))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Reconciliation::Stale {
                current: EpochMillis(100),
                event: EpochMillis(50),
            }
        );
        assert_eq!(durable.document("users/42").await, before);
        assert_eq!(durable.write_count(), 1);
    }

    #[tokio::test]
    async fn test_handle_is_idempotent() {
        let ephemeral = Arc::new(InMemoryEphemeralStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        ephemeral
            .apply("status/42", PresenceWrite::at(PresenceState::Offline, 200))
            .await;
        let reconciler =
            PresenceReconciler::new(ephemeral.clone(), durable.clone(), PresencePaths::default());
        let event = change("42", PresenceState::Offline, 200);

        reconciler.handle(&event).await.unwrap();
        let once = durable.document("users/42").await;
        reconciler.handle(&event).await.unwrap();
        assert_eq!(durable.document("users/42").await, once);
    }

    struct RejectingDurable;

    #[async_trait]
    impl DocumentSource for RejectingDurable {
        async fn fetch(&self, _path: &str) -> Result<Option<Document>, ChatPresenceError> {
            Ok(None)
        }
    }

    #[async_trait]
    impl DurableStore for RejectingDurable {
        async fn merge_write(&self, _path: &str, _fields: Fields) -> Result<(), ChatPresenceError> {
            Err(ChatPresenceError::store_error("durable", "write rejected"))
        }
    }

    #[tokio::test]
    async fn test_handle_reports_durable_failure() {
        let ephemeral = Arc::new(InMemoryEphemeralStore::new());
        let reconciler = PresenceReconciler::new(
            ephemeral,
            Arc::new(RejectingDurable),
            PresencePaths::default(),
        );

        let err = reconciler
            .handle(&change("42", PresenceState::Online, 100))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
