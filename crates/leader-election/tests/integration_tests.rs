//! Integration tests for several election participants sharing one service

use leader_election::{
    CandidateId, ElectionConfig, ElectionHandle, ElectionLoop, ElectionObserver,
    LeadershipState, MemoryConnector, MemoryCoordinator, RetryConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing_subscriber::fmt::try_init;

const ROOT: &str = "/services/election";

fn config() -> ElectionConfig {
    ElectionConfig::default()
        .with_root_path(ROOT)
        .with_retry(RetryConfig {
            max_times: 5,
            jitter: false,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
        })
}

fn start(coordinator: &MemoryCoordinator, config: ElectionConfig) -> ElectionHandle {
    ElectionLoop::new(Arc::new(MemoryConnector::new(coordinator.clone())), config)
        .start()
        .unwrap()
}

async fn settle<F>(handle: &ElectionHandle, predicate: F) -> LeadershipState
where
    F: FnMut(&LeadershipState) -> bool,
{
    let mut states = handle.subscribe();
    let state = timeout(Duration::from_secs(3), states.wait_for(predicate))
        .await
        .expect("election did not settle in time")
        .expect("election state channel closed");
    state.clone()
}

fn is_settled(state: &LeadershipState) -> bool {
    matches!(
        state,
        LeadershipState::Leader { .. } | LeadershipState::Watching { .. }
    )
}

/// Start candidates one at a time so their sequence order is the start order
async fn start_in_order(coordinator: &MemoryCoordinator, count: usize) -> Vec<ElectionHandle> {
    let mut handles = Vec::new();
    for _ in 0..count {
        let handle = start(coordinator, config());
        settle(&handle, is_settled).await;
        handles.push(handle);
    }
    handles
}

fn candidate(handle: &ElectionHandle) -> CandidateId {
    handle.candidate().expect("candidate is registered")
}

fn predecessor(state: &LeadershipState) -> Option<&CandidateId> {
    match state {
        LeadershipState::Watching { predecessor, .. } => Some(predecessor),
        _ => None,
    }
}

/// Counts state transitions
#[derive(Default)]
struct TransitionCounter {
    transitions: AtomicUsize,
}

impl ElectionObserver for TransitionCounter {
    fn on_state_change(&self, _previous: &LeadershipState, _current: &LeadershipState) {
        self.transitions.fetch_add(1, Ordering::SeqCst);
    }
}

/// Three candidates: the first leads and each follower watches the one before it
#[tokio::test]
async fn test_three_candidate_chain() {
    let _ = try_init();
    let coordinator = MemoryCoordinator::new();
    let handles = start_in_order(&coordinator, 3).await;

    assert!(handles[0].is_leader());
    assert_eq!(candidate(&handles[0]).sequence(), 0);
    assert_eq!(
        candidate(&handles[0]).path(),
        "/services/election/candidate-0000000000"
    );

    assert_eq!(predecessor(&handles[1].state()), Some(&candidate(&handles[0])));
    assert_eq!(predecessor(&handles[2].state()), Some(&candidate(&handles[1])));

    let watches = coordinator.watches().await;
    assert_eq!(watches.len(), 2);
    assert_eq!(watches.get(candidate(&handles[0]).path()), Some(&1));
    assert_eq!(watches.get(candidate(&handles[1]).path()), Some(&1));

    for handle in handles {
        handle.shutdown().await.unwrap();
    }
}

/// A crashed leader is replaced by its direct successor only
#[tokio::test]
async fn test_leader_crash_promotes_successor_only() {
    let _ = try_init();
    let coordinator = MemoryCoordinator::new();

    let leader = start(&coordinator, config().with_max_session_recoveries(0));
    settle(&leader, LeadershipState::is_leader).await;
    let successor = start(&coordinator, config());
    settle(&successor, is_settled).await;

    let counter = Arc::new(TransitionCounter::default());
    let third = ElectionLoop::new(Arc::new(MemoryConnector::new(coordinator.clone())), config())
        .with_observer(counter.clone())
        .start()
        .unwrap();
    let third_state = settle(&third, is_settled).await;
    let transitions_before = counter.transitions.load(Ordering::SeqCst);

    let crashed = candidate(&leader);
    let session = coordinator.owner_of(crashed.path()).await.unwrap();
    assert!(coordinator.expire_session(session).await);

    settle(&successor, LeadershipState::is_leader).await;
    settle(&leader, LeadershipState::is_terminated).await;
    assert!(leader.wait().await.is_err());

    // The third candidate was watching the successor and saw nothing
    sleep(Duration::from_millis(50)).await;
    assert_eq!(third.state(), third_state);
    assert_eq!(counter.transitions.load(Ordering::SeqCst), transitions_before);
    assert_eq!(coordinator.total_watch_count().await, 1);

    successor.shutdown().await.unwrap();
    third.shutdown().await.unwrap();
}

/// N candidates hold exactly N - 1 watches, one per watched entry
#[tokio::test]
async fn test_no_herd_effect() {
    let _ = try_init();
    let coordinator = MemoryCoordinator::new();
    let handles = start_in_order(&coordinator, 6).await;

    let watches = coordinator.watches().await;
    assert_eq!(coordinator.total_watch_count().await, 5);
    assert!(watches.values().all(|count| *count == 1));
    assert!(!watches.contains_key(candidate(&handles[5]).path()));

    for handle in handles {
        handle.shutdown().await.unwrap();
    }
}

/// Concurrent starts still yield a single leader holding the smallest sequence
#[tokio::test]
async fn test_concurrent_start_elects_minimum() {
    let _ = try_init();
    let coordinator = MemoryCoordinator::new();
    let handles: Vec<ElectionHandle> = (0..5).map(|_| start(&coordinator, config())).collect();

    let mut states = Vec::new();
    for handle in &handles {
        states.push(settle(handle, is_settled).await);
    }

    let leaders: Vec<&LeadershipState> = states.iter().filter(|s| s.is_leader()).collect();
    assert_eq!(leaders.len(), 1);

    let minimum = states
        .iter()
        .filter_map(LeadershipState::candidate)
        .map(CandidateId::sequence)
        .min()
        .unwrap();
    assert_eq!(leaders[0].candidate().unwrap().sequence(), minimum);
    assert_eq!(coordinator.total_watch_count().await, 4);

    for handle in handles {
        handle.shutdown().await.unwrap();
    }
}

/// Leaving from the middle of the chain re-links the follower behind it
#[tokio::test]
async fn test_middle_departure_relinks_chain() {
    let _ = try_init();
    let coordinator = MemoryCoordinator::new();
    let mut handles = start_in_order(&coordinator, 3).await;
    let first = candidate(&handles[0]);

    let middle = handles.remove(1);
    middle.shutdown().await.unwrap();

    let relinked = settle(&handles[1], |s| predecessor(s) == Some(&first)).await;
    assert_eq!(relinked.candidate(), Some(&candidate(&handles[1])));
    assert!(handles[0].is_leader());
    assert_eq!(coordinator.total_watch_count().await, 1);

    for handle in handles {
        handle.shutdown().await.unwrap();
    }
}

/// A participant whose session expires rejoins at the back of the line
#[tokio::test]
async fn test_expired_participant_rejoins_with_larger_sequence() {
    let _ = try_init();
    let coordinator = MemoryCoordinator::new();
    let handles = start_in_order(&coordinator, 3).await;
    let before = candidate(&handles[1]);
    let last = candidate(&handles[2]);

    let session = coordinator.owner_of(before.path()).await.unwrap();
    coordinator.expire_session(session).await;

    let rejoined = settle(&handles[1], |s| {
        predecessor(s).map(|p| p.path() == last.path()).unwrap_or(false)
    })
    .await;
    let after = rejoined.candidate().unwrap();
    assert!(after.sequence() > last.sequence());

    // The last candidate lost its predecessor and now watches the leader
    settle(&handles[2], |s| predecessor(s) == Some(&candidate(&handles[0]))).await;
    assert_eq!(coordinator.total_watch_count().await, 2);

    for handle in handles {
        handle.shutdown().await.unwrap();
    }
}

/// Shutting everything down leaves the root empty and no watches behind
#[tokio::test]
async fn test_shutdown_leaves_nothing_behind() {
    let _ = try_init();
    let coordinator = MemoryCoordinator::new();
    let handles = start_in_order(&coordinator, 4).await;

    for handle in handles.into_iter().rev() {
        handle.shutdown().await.unwrap();
    }

    assert!(coordinator.node_exists(ROOT).await);
    assert!(coordinator.children(ROOT).await.is_empty());
    assert_eq!(coordinator.total_watch_count().await, 0);
}

/// Transient connection failures are retried rather than surfaced
#[tokio::test]
async fn test_transient_failures_are_retried() {
    let _ = try_init();
    let coordinator = MemoryCoordinator::new();
    coordinator.fail_next_calls(3).await;

    let handle = start(&coordinator, config());
    let state = settle(&handle, LeadershipState::is_leader).await;
    assert_eq!(
        coordinator.children(ROOT).await,
        vec![state.candidate().unwrap().name().to_string()]
    );

    handle.shutdown().await.unwrap();
}
