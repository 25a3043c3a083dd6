//! Offline mutation replay and conflict resolution.
//!
//! The engine drains the durable queue against the remote API whenever
//! connectivity allows, strictly in creation order, and resolves conflicts
//! locally wherever a failure means the action is moot: a missing target was
//! already handled by the partner, a missing parent event takes every queued
//! action for that event down with it.

use std::collections::HashSet;
use std::sync::Arc;

use tandem_core::{ApiError, ApiResult, CalendarApi};
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::queue::{ActionPayload, OfflineAction, OfflineQueue};

/// Receives user-visible sync outcomes and cache-invalidation hints.
pub trait SyncNotifier: Send + Sync {
    /// An action exhausted its retries and was dropped.
    fn sync_failed(&self, action: &OfflineAction);

    /// A drain pass finished and the queue is empty.
    fn sync_complete(&self);

    /// Server state for this resource changed; cached lists are stale and
    /// should be refetched or merged.
    fn resource_updated(&self, resource_id: &str);
}

/// How a single queued action was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Applied remotely; removed from the queue.
    Applied,
    /// The target was already gone server-side; removed without error.
    AlreadyResolved,
    /// The parent resource is gone; this action and every sibling queued for
    /// the same resource were discarded. Count includes this action.
    CascadeDiscarded(usize),
    /// Rate limited; left queued without consuming a retry.
    Deferred,
    /// Transient failure; one retry consumed, left queued.
    Retrying,
    /// Retry budget exhausted; dropped and surfaced to the user.
    GaveUp,
}

/// Tally for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    /// Target-gone actions resolved silently.
    pub resolved: usize,
    /// Actions removed by parent-gone cascades.
    pub cascaded: usize,
    pub deferred: usize,
    pub retrying: usize,
    /// Actions dropped after exhausting retries.
    pub failed: usize,
    /// Actions skipped because an earlier action for the same resource is
    /// still queued (ordering guard).
    pub skipped: usize,
}

/// Replays queued offline actions against the remote service.
pub struct SyncEngine {
    api: Arc<dyn CalendarApi>,
    queue: Arc<OfflineQueue>,
    monitor: ConnectivityMonitor,
    notifier: Arc<dyn SyncNotifier>,
}

impl SyncEngine {
    pub fn new(
        api: Arc<dyn CalendarApi>,
        queue: Arc<OfflineQueue>,
        monitor: ConnectivityMonitor,
        notifier: Arc<dyn SyncNotifier>,
    ) -> Self {
        Self {
            api,
            queue,
            monitor,
            notifier,
        }
    }

    /// Persist a mutation, then attempt an immediate best-effort drain if
    /// the platform reports online. A failed immediate attempt leaves the
    /// action queued for the next connectivity-triggered drain; there is no
    /// independent retry timer while online.
    pub async fn submit(&self, action: OfflineAction) -> Result<()> {
        self.queue.enqueue(&action)?;
        if self.monitor.is_online() {
            if let Err(err) = self.drain().await {
                warn!(%err, "immediate drain failed; action stays queued");
            }
        }
        Ok(())
    }

    /// Replay one action and classify the outcome.
    pub async fn process_one(&self, action: &OfflineAction) -> Result<ActionOutcome> {
        match self.apply(action).await {
            Ok(()) => {
                self.queue.remove(&action.id)?;
                self.notifier.resource_updated(&action.resource_id);
                debug!(
                    id = %action.id,
                    kind = action.kind().as_str(),
                    "offline action applied"
                );
                Ok(ActionOutcome::Applied)
            }
            // The partner got there first; the intent is already satisfied.
            Err(ApiError::TargetMissing) => {
                self.queue.remove(&action.id)?;
                debug!(id = %action.id, "target already gone; action resolved");
                Ok(ActionOutcome::AlreadyResolved)
            }
            Err(ApiError::ParentMissing) => {
                let removed = self.queue.remove_for_resource(&action.resource_id)?;
                info!(
                    resource = %action.resource_id,
                    removed,
                    "parent event gone; cascade-discarded queued actions"
                );
                Ok(ActionOutcome::CascadeDiscarded(removed))
            }
            Err(err) if err.is_deferrable() => {
                debug!(id = %action.id, "rate limited; deferring to next drain");
                Ok(ActionOutcome::Deferred)
            }
            Err(err) => {
                let count = self.queue.bump(&action.id)?;
                if count >= action.max_retries {
                    self.queue.remove(&action.id)?;
                    warn!(
                        id = %action.id,
                        kind = action.kind().as_str(),
                        %err,
                        "offline action failed permanently"
                    );
                    self.notifier.sync_failed(action);
                    Ok(ActionOutcome::GaveUp)
                } else {
                    debug!(id = %action.id, retry = count, %err, "offline action failed; queued for retry");
                    Ok(ActionOutcome::Retrying)
                }
            }
        }
    }

    /// One full sequential pass over the queue in creation order.
    ///
    /// Per-resource ordering holds within the pass too: once an action for a
    /// resource stays queued (deferred or retrying), later actions for that
    /// resource are skipped so a delete can never overtake the create it
    /// targets. Emits one `sync_complete` notification when the pass leaves
    /// the queue empty.
    pub async fn drain(&self) -> Result<DrainReport> {
        let actions = self.queue.list()?;
        if actions.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut report = DrainReport::default();
        let mut stalled: HashSet<&str> = HashSet::new();
        let mut cascaded: HashSet<&str> = HashSet::new();

        for action in &actions {
            let resource = action.resource_id.as_str();
            if cascaded.contains(resource) {
                // Already removed by an earlier cascade in this pass.
                continue;
            }
            if stalled.contains(resource) {
                report.skipped += 1;
                continue;
            }
            match self.process_one(action).await? {
                ActionOutcome::Applied => report.applied += 1,
                ActionOutcome::AlreadyResolved => report.resolved += 1,
                ActionOutcome::CascadeDiscarded(n) => {
                    report.cascaded += n;
                    cascaded.insert(resource);
                }
                ActionOutcome::Deferred => {
                    report.deferred += 1;
                    stalled.insert(resource);
                }
                ActionOutcome::Retrying => {
                    report.retrying += 1;
                    stalled.insert(resource);
                }
                ActionOutcome::GaveUp => report.failed += 1,
            }
        }

        if self.queue.is_empty()? {
            info!(applied = report.applied, "sync drain complete; queue empty");
            self.notifier.sync_complete();
        }
        Ok(report)
    }

    /// Drive drains from connectivity transitions: once at startup as soon
    /// as the platform is online, then after every offline→online flip.
    pub async fn run(&self) {
        self.monitor.once_online().await;
        loop {
            if let Err(err) = self.drain().await {
                warn!(%err, "connectivity-triggered drain failed");
            }
            self.monitor.next_online_transition().await;
        }
    }

    async fn apply(&self, action: &OfflineAction) -> ApiResult<()> {
        let event_id = action.resource_id.as_str();
        match &action.payload {
            ActionPayload::SendMessage { message } => self
                .api
                .send_message(event_id, message)
                .await
                .map(|_created| ()),
            ActionPayload::DeleteMessage { message_id } => {
                self.api.delete_message(event_id, message_id).await
            }
            ActionPayload::CreateChecklistItem { item } => self
                .api
                .create_checklist_item(event_id, item)
                .await
                .map(|_created| ()),
            ActionPayload::UpdateChecklistItem { item_id, patch } => self
                .api
                .update_checklist_item(event_id, item_id, patch)
                .await
                .map(|_updated| ()),
            ActionPayload::DeleteChecklistItem { item_id } => {
                self.api.delete_checklist_item(event_id, item_id).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::connectivity;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tandem_core::{
        ChecklistItem, ChecklistItemPatch, EventMessage, NewChecklistItem, NewMessage,
    };

    /// API stub that fails calls whose key is scripted and records call
    /// order. Keys: message content, or message/item id.
    #[derive(Default)]
    struct ScriptedApi {
        fail: Mutex<HashMap<String, ApiError>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedApi {
        fn fail_with(&self, key: &str, err: ApiError) {
            self.fail.lock().insert(key.to_string(), err);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn outcome(&self, key: &str) -> ApiResult<()> {
            self.calls.lock().push(key.to_string());
            match self.fail.lock().get(key) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    fn dummy_message(event_id: &str, content: &str) -> EventMessage {
        EventMessage {
            id: "m-new".into(),
            event_id: event_id.into(),
            sender_id: "u1".into(),
            content: content.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn dummy_item(event_id: &str, title: &str) -> ChecklistItem {
        ChecklistItem {
            id: "i-new".into(),
            event_id: event_id.into(),
            title: title.into(),
            completed: false,
            completed_by: None,
            completed_at: None,
            assigned_to: None,
            created_by: "u1".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[async_trait]
    impl CalendarApi for ScriptedApi {
        async fn send_message(
            &self,
            event_id: &str,
            message: &NewMessage,
        ) -> ApiResult<EventMessage> {
            self.outcome(&message.content)?;
            Ok(dummy_message(event_id, &message.content))
        }

        async fn delete_message(&self, _event_id: &str, message_id: &str) -> ApiResult<()> {
            self.outcome(message_id)
        }

        async fn create_checklist_item(
            &self,
            event_id: &str,
            item: &NewChecklistItem,
        ) -> ApiResult<ChecklistItem> {
            self.outcome(&item.title)?;
            Ok(dummy_item(event_id, &item.title))
        }

        async fn update_checklist_item(
            &self,
            event_id: &str,
            item_id: &str,
            _patch: &ChecklistItemPatch,
        ) -> ApiResult<ChecklistItem> {
            self.outcome(item_id)?;
            Ok(dummy_item(event_id, item_id))
        }

        async fn delete_checklist_item(&self, _event_id: &str, item_id: &str) -> ApiResult<()> {
            self.outcome(item_id)
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        failures: Mutex<Vec<String>>,
        completes: AtomicUsize,
        updated: Mutex<Vec<String>>,
    }

    impl SyncNotifier for CountingNotifier {
        fn sync_failed(&self, action: &OfflineAction) {
            self.failures.lock().push(action.id.clone());
        }

        fn sync_complete(&self) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn resource_updated(&self, resource_id: &str) {
            self.updated.lock().push(resource_id.to_string());
        }
    }

    fn send_action(resource: &str, content: &str, secs: i64) -> OfflineAction {
        OfflineAction {
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            ..OfflineAction::new(
                resource,
                ActionPayload::SendMessage {
                    message: NewMessage {
                        content: content.into(),
                    },
                },
            )
        }
    }

    struct Harness {
        api: Arc<ScriptedApi>,
        queue: Arc<OfflineQueue>,
        notifier: Arc<CountingNotifier>,
        engine: SyncEngine,
        _handle: crate::connectivity::ConnectivityHandle,
    }

    fn harness(online: bool) -> Harness {
        let api = Arc::new(ScriptedApi::default());
        let queue = Arc::new(OfflineQueue::open_in_memory().unwrap());
        let notifier = Arc::new(CountingNotifier::default());
        let (handle, monitor) = connectivity(online);
        let engine = SyncEngine::new(
            Arc::clone(&api) as Arc<dyn CalendarApi>,
            Arc::clone(&queue),
            monitor,
            Arc::clone(&notifier) as Arc<dyn SyncNotifier>,
        );
        Harness {
            api,
            queue,
            notifier,
            engine,
            _handle: handle,
        }
    }

    #[tokio::test]
    async fn drain_applies_all_and_notifies_completion_once() {
        let h = harness(false);
        for (content, t) in [("one", 1), ("two", 2), ("three", 3)] {
            h.queue.enqueue(&send_action("e1", content, t)).unwrap();
        }

        let report = h.engine.drain().await.unwrap();

        assert_eq!(report.applied, 3);
        assert!(h.queue.is_empty().unwrap());
        assert_eq!(h.api.calls(), vec!["one", "two", "three"]);
        assert_eq!(h.notifier.completes.load(Ordering::SeqCst), 1);
        assert_eq!(h.notifier.updated.lock().len(), 3);
    }

    #[tokio::test]
    async fn target_gone_resolves_without_retry_or_error() {
        let h = harness(false);
        let action = OfflineAction::new(
            "e1",
            ActionPayload::DeleteMessage {
                message_id: "m9".into(),
            },
        );
        h.queue.enqueue(&action).unwrap();
        h.api.fail_with("m9", ApiError::TargetMissing);

        let outcome = h.engine.process_one(&action).await.unwrap();

        assert_eq!(outcome, ActionOutcome::AlreadyResolved);
        assert!(h.queue.is_empty().unwrap());
        assert!(h.notifier.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn parent_gone_cascades_across_the_resource() {
        let h = harness(false);
        let a = send_action("e1", "msg1", 1);
        let b = send_action("e1", "msg2", 2);
        h.queue.enqueue(&a).unwrap();
        h.queue.enqueue(&b).unwrap();
        h.api.fail_with("msg1", ApiError::ParentMissing);

        let report = h.engine.drain().await.unwrap();

        assert_eq!(report.cascaded, 2);
        assert!(h.queue.is_empty().unwrap());
        // msg2 must never have been attempted.
        assert_eq!(h.api.calls(), vec!["msg1"]);
        assert!(h.notifier.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_defers_without_consuming_retries() {
        let h = harness(false);
        let action = send_action("e1", "hello", 1);
        h.queue.enqueue(&action).unwrap();
        h.api.fail_with("hello", ApiError::RateLimited);

        let report = h.engine.drain().await.unwrap();

        assert_eq!(report.deferred, 1);
        let queued = h.queue.list().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].retry_count, 0);
        assert_eq!(h.notifier.completes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retry_exhaustion_drops_action_and_notifies_once() {
        let h = harness(false);
        let mut action = send_action("e1", "flaky", 1);
        action.max_retries = 2;
        h.queue.enqueue(&action).unwrap();
        h.api.fail_with("flaky", ApiError::Transient("500".into()));

        let first = h.engine.drain().await.unwrap();
        assert_eq!(first.retrying, 1);
        assert_eq!(h.queue.list().unwrap()[0].retry_count, 1);

        let second = h.engine.drain().await.unwrap();
        assert_eq!(second.failed, 1);
        assert!(h.queue.is_empty().unwrap());
        assert_eq!(*h.notifier.failures.lock(), vec![action.id.clone()]);
    }

    #[tokio::test]
    async fn stalled_resource_blocks_later_actions_for_it_only() {
        let h = harness(false);
        h.queue.enqueue(&send_action("e1", "first", 1)).unwrap();
        h.queue.enqueue(&send_action("e1", "second", 2)).unwrap();
        h.queue.enqueue(&send_action("e2", "other", 3)).unwrap();
        h.api.fail_with("first", ApiError::RateLimited);

        let report = h.engine.drain().await.unwrap();

        assert_eq!(report.deferred, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.applied, 1);
        // "second" must not run while "first" is still queued ahead of it.
        assert_eq!(h.api.calls(), vec!["first", "other"]);
        assert_eq!(h.queue.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn submit_while_online_drains_immediately() {
        let h = harness(true);
        h.engine
            .submit(send_action("e1", "instant", 1))
            .await
            .unwrap();

        assert!(h.queue.is_empty().unwrap());
        assert_eq!(h.api.calls(), vec!["instant"]);
    }

    #[tokio::test]
    async fn submit_while_offline_stays_queued() {
        let h = harness(false);
        h.engine
            .submit(send_action("e1", "later", 1))
            .await
            .unwrap();

        assert_eq!(h.queue.len().unwrap(), 1);
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_drain_is_silent() {
        let h = harness(false);
        let report = h.engine.drain().await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert_eq!(h.notifier.completes.load(Ordering::SeqCst), 0);
    }
}
