//! Leader election demonstration
//!
//! Starts three candidates against an in-memory coordination service,
//! crashes the leader and shows the direct successor taking over while the
//! last candidate keeps watching the same entry.

use anyhow::Context;
use leader_election::{
    ElectionConfig, ElectionHandle, ElectionLoop, LeadershipState, MemoryConnector,
    MemoryCoordinator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("🚀 Starting Leader Election Demo");

    let coordinator = MemoryCoordinator::new();
    let config = ElectionConfig::default().with_root_path("/demo/election");

    // The first candidate will not reconnect, so expiring its session is a crash
    let mut candidates = Vec::new();
    for (index, recoveries) in [0, 3, 3].into_iter().enumerate() {
        let handle = ElectionLoop::new(
            Arc::new(MemoryConnector::new(coordinator.clone())),
            config.clone().with_max_session_recoveries(recoveries),
        )
        .start()?;
        let state = settle(&handle, |s| s.candidate().is_some()).await?;
        println!("   Candidate {}: {}", index + 1, state);
        candidates.push(handle);
    }

    println!("\n📊 Watches per entry:");
    for (path, count) in coordinator.watches().await {
        println!("   {} <- {} watcher(s)", path, count);
    }

    println!("\n💥 Crashing the leader...");
    let leader = candidates.remove(0);
    let path = leader.candidate().context("leader has no entry")?;
    let session = coordinator
        .owner_of(path.path())
        .await
        .context("leader entry has no owner")?;
    coordinator.expire_session(session).await;

    if let Err(e) = leader.wait().await {
        println!("   Old leader stopped: {}", e);
    }

    let state = settle(&candidates[0], LeadershipState::is_leader).await?;
    println!("   New leader: {}", state);
    println!("   Last candidate: {}", candidates[1].state());

    println!("\n🔄 Shutting down remaining candidates...");
    for handle in candidates {
        handle.shutdown().await?;
    }
    println!(
        "   Entries left under /demo/election: {}",
        coordinator.children("/demo/election").await.len()
    );

    println!("\n🏁 Demo completed successfully!");
    Ok(())
}

async fn settle<F>(handle: &ElectionHandle, predicate: F) -> anyhow::Result<LeadershipState>
where
    F: FnMut(&LeadershipState) -> bool,
{
    let mut states = handle.subscribe();
    let state = timeout(Duration::from_secs(5), states.wait_for(predicate))
        .await
        .context("election did not settle")??;
    Ok(state.clone())
}
