//! One-shot deletion watches on a single candidate
//!
//! The service delivers each watch at most once. Anything that is not a
//! deletion (data changes, for example) is dropped and the watch is armed
//! again explicitly; the callback only ever hears about deletions, or about
//! the watch being impossible to keep because the session is gone.

use crate::candidate::CandidateId;
use crate::config::RetryConfig;
use crate::error::{ElectionError, Result, ServiceError};
use crate::retry::with_retry;
use crate::service::{CoordinationService, WatchEventKind, WatchReceiver, Watcher};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// What a deletion watch reports to its callback
#[derive(Debug)]
pub enum WatchFired {
    /// The watched entry is gone
    Deleted(CandidateId),

    /// The watch could not be re-armed; the observing identity is lost
    Abandoned {
        target: CandidateId,
        error: ElectionError,
    },
}

impl WatchFired {
    pub fn target(&self) -> &CandidateId {
        match self {
            Self::Deleted(target) => target,
            Self::Abandoned { target, .. } => target,
        }
    }
}

/// An armed deletion watch.
///
/// Dropping or cancelling the subscription stops delivery and releases the
/// service-side watch slot.
#[derive(Debug)]
pub struct WatchSubscription {
    target: CandidateId,
    task: JoinHandle<()>,
}

impl WatchSubscription {
    pub fn target(&self) -> &CandidateId {
        &self.target
    }

    /// True once the watch has delivered or given up
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn cancel(self) {
        tracing::debug!("Cancelling deletion watch on {}", self.target);
        self.task.abort();
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Arms deletion watches against the coordination service
pub struct WatchManager {
    service: Arc<dyn CoordinationService>,
    retry: RetryConfig,
}

impl WatchManager {
    pub fn new(service: Arc<dyn CoordinationService>, retry: RetryConfig) -> Self {
        Self { service, retry }
    }

    /// Watch `target` for deletion.
    ///
    /// Returns `None` when the target no longer exists, in which case nothing
    /// is armed and the caller should re-read the candidate set. Otherwise
    /// `on_fire` runs at most once, on a background task.
    pub async fn watch_deletion<F>(
        &self,
        target: &CandidateId,
        on_fire: F,
    ) -> Result<Option<WatchSubscription>>
    where
        F: FnOnce(WatchFired) + Send + 'static,
    {
        let armed = with_retry(&self.retry, "exists", || {
            arm(self.service.as_ref(), target.path())
        })
        .await
        .map_err(|e| ElectionError::watch_delivery(target.path(), e))?;

        let Some(receiver) = armed else {
            tracing::debug!("Watch target {} is already gone", target);
            return Ok(None);
        };

        tracing::debug!("Armed deletion watch on {}", target);
        let task = tokio::spawn(deliver(
            self.service.clone(),
            self.retry.clone(),
            target.clone(),
            receiver,
            on_fire,
        ));

        Ok(Some(WatchSubscription {
            target: target.clone(),
            task,
        }))
    }
}

/// One attempt at registering a watch. `None` if the node does not exist.
async fn arm(
    service: &dyn CoordinationService,
    path: &str,
) -> std::result::Result<Option<WatchReceiver>, ServiceError> {
    let (watcher, receiver) = Watcher::new();
    let stat = service.exists(path, Some(watcher)).await?;
    Ok(stat.map(|_| receiver))
}

async fn deliver<F>(
    service: Arc<dyn CoordinationService>,
    retry: RetryConfig,
    target: CandidateId,
    receiver: WatchReceiver,
    on_fire: F,
) where
    F: FnOnce(WatchFired) + Send + 'static,
{
    let mut pending = receiver;

    loop {
        match pending.await {
            Ok(event) if event.kind == WatchEventKind::NodeDeleted => {
                tracing::debug!("Watched candidate {} was deleted", target);
                on_fire(WatchFired::Deleted(target));
                return;
            }
            Ok(event) => {
                tracing::debug!("Discarding {:?} event on {}", event.kind, target);
            }
            Err(_) => {
                tracing::warn!("Watch on {} was dropped without firing, re-arming", target);
            }
        }

        pending = loop {
            let rearmed = with_retry(&retry, "exists", || arm(service.as_ref(), target.path())).await;
            match rearmed {
                Ok(Some(next)) => break next,
                Ok(None) => {
                    tracing::debug!("Candidate {} vanished before the watch was re-armed", target);
                    on_fire(WatchFired::Deleted(target));
                    return;
                }
                Err(e) if e.is_transient() => {
                    let error = ElectionError::watch_delivery(target.path(), e);
                    tracing::warn!("{}, trying again", error);
                    tokio::time::sleep(retry.max_delay).await;
                }
                Err(e) => {
                    let error = ElectionError::watch_delivery(target.path(), e);
                    tracing::warn!("Giving up watch: {}", error);
                    on_fire(WatchFired::Abandoned { target, error });
                    return;
                }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::ElectionRoot;
    use crate::memory::{MemoryCoordinator, MemorySession};
    use crate::service::CreateMode;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_times: 2,
            jitter: false,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    async fn setup() -> (MemoryCoordinator, Arc<MemorySession>, CandidateId) {
        let coordinator = MemoryCoordinator::new();
        let owner = coordinator.connect().await;
        owner.create_node("/chroot", CreateMode::Persistent).await.unwrap();
        let path = owner
            .create_node("/chroot/candidate-", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let root = ElectionRoot::new("/chroot").unwrap();
        let target = CandidateId::from_path(&root, "candidate-", &path).unwrap();
        (coordinator, owner, target)
    }

    async fn wait_for_watches(coordinator: &MemoryCoordinator, path: &str, expected: usize) {
        for _ in 0..100 {
            if coordinator.watch_count(path).await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} watches on {}", expected, path);
    }

    #[tokio::test]
    async fn test_deletion_fires_callback_once() {
        let (coordinator, owner, target) = setup().await;
        let manager = WatchManager::new(coordinator.connect().await, fast_retry());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscription = manager
            .watch_deletion(&target, move |fired| {
                let _ = tx.send(fired);
            })
            .await
            .unwrap()
            .expect("target exists");
        assert_eq!(coordinator.watch_count(target.path()).await, 1);

        owner.delete(target.path()).await.unwrap();

        let fired = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(fired, WatchFired::Deleted(ref t) if *t == target));
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.unwrap().is_none());
        assert!(subscription.is_finished());
    }

    #[tokio::test]
    async fn test_non_deletion_events_are_discarded_and_rearmed() {
        let (coordinator, owner, target) = setup().await;
        let manager = WatchManager::new(coordinator.connect().await, fast_retry());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _subscription = manager
            .watch_deletion(&target, move |fired| {
                let _ = tx.send(fired);
            })
            .await
            .unwrap()
            .unwrap();

        assert!(coordinator.touch(target.path()).await);
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        wait_for_watches(&coordinator, target.path(), 1).await;

        owner.delete(target.path()).await.unwrap();
        let fired = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(fired, WatchFired::Deleted(_)));
    }

    #[tokio::test]
    async fn test_missing_target_arms_nothing() {
        let (coordinator, owner, target) = setup().await;
        owner.delete(target.path()).await.unwrap();

        let manager = WatchManager::new(coordinator.connect().await, fast_retry());
        let subscription = manager.watch_deletion(&target, |_| {}).await.unwrap();

        assert!(subscription.is_none());
        assert_eq!(coordinator.watch_count(target.path()).await, 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_watch_slot() {
        let (coordinator, _owner, target) = setup().await;
        let manager = WatchManager::new(coordinator.connect().await, fast_retry());

        let subscription = manager.watch_deletion(&target, |_| {}).await.unwrap().unwrap();
        assert_eq!(coordinator.watch_count(target.path()).await, 1);

        subscription.cancel();
        wait_for_watches(&coordinator, target.path(), 0).await;
    }

    #[tokio::test]
    async fn test_session_loss_abandons_watch() {
        let (coordinator, _owner, target) = setup().await;
        let watcher_session = coordinator.connect().await;
        let session_id = watcher_session.session_id();
        let manager = WatchManager::new(watcher_session, fast_retry());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _subscription = manager
            .watch_deletion(&target, move |fired| {
                let _ = tx.send(fired);
            })
            .await
            .unwrap()
            .unwrap();

        coordinator.expire_session(session_id).await;

        let fired = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        match fired {
            WatchFired::Abandoned { error, .. } => assert!(error.requires_new_session()),
            other => panic!("unexpected delivery: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_arm_failure_is_reported() {
        let (coordinator, _owner, target) = setup().await;
        let manager = WatchManager::new(coordinator.connect().await, fast_retry());

        coordinator.fail_next_calls(10).await;
        let err = manager.watch_deletion(&target, |_| {}).await.unwrap_err();
        assert!(matches!(err, ElectionError::WatchDelivery { .. }));
    }
}
