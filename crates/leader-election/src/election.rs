//! Election state machine
//!
//! One background task per participant drives the election:
//! register, resolve, then either lead or watch the immediate predecessor.
//! Watch deliveries only enqueue a signal for that task, so resolution always
//! runs serialized on the loop and never on a delivery path.

use crate::candidate::{CandidateId, ElectionRoot};
use crate::config::ElectionConfig;
use crate::error::{ElectionError, Result, ServiceError};
use crate::observer::{ElectionObserver, TracingObserver};
use crate::registrar::CandidateRegistrar;
use crate::resolver::{ElectionResolver, Resolution};
use crate::retry::with_retry;
use crate::service::{Connector, CoordinationService, SessionState};
use crate::watch::{WatchFired, WatchManager, WatchSubscription};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Where a participant currently stands in the election
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipState {
    /// Not yet registered with the coordination service
    Unregistered,

    /// Creating the root and our candidate entry
    Registering,

    /// Reading the candidate set to decide our role
    Resolving,

    /// We hold the smallest sequence number
    Leader { candidate: CandidateId },

    /// Following, with a deletion watch on the candidate just ahead of us
    Watching {
        candidate: CandidateId,
        predecessor: CandidateId,
    },

    /// The loop has exited and will not participate again
    Terminated,
}

impl LeadershipState {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader { .. })
    }

    /// Our registered entry, while leading or watching
    pub fn candidate(&self) -> Option<&CandidateId> {
        match self {
            Self::Leader { candidate } | Self::Watching { candidate, .. } => Some(candidate),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl fmt::Display for LeadershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unregistered => write!(f, "unregistered"),
            Self::Registering => write!(f, "registering"),
            Self::Resolving => write!(f, "resolving"),
            Self::Leader { candidate } => write!(f, "leader({})", candidate),
            Self::Watching {
                candidate,
                predecessor,
            } => write!(f, "watching({} -> {})", candidate, predecessor),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Configures and starts one election participant
pub struct ElectionLoop {
    connector: Arc<dyn Connector>,
    config: ElectionConfig,
    observer: Arc<dyn ElectionObserver>,
}

impl ElectionLoop {
    pub fn new(connector: Arc<dyn Connector>, config: ElectionConfig) -> Self {
        Self {
            connector,
            config,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Replace the default [`TracingObserver`]
    pub fn with_observer(mut self, observer: Arc<dyn ElectionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Validate the configuration and spawn the election task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<ElectionHandle> {
        self.config.validate()?;
        let root = self.config.root()?;

        let (state_tx, state_rx) = watch::channel(LeadershipState::Unregistered);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        tracing::info!(
            root = %root,
            endpoints = ?self.config.endpoints,
            "Starting election participant"
        );

        let runner = Runner {
            connector: self.connector,
            config: self.config,
            root,
            observer: self.observer,
            state_tx,
            stop_rx,
            signal_tx,
            signal_rx,
            epoch: 0,
            recoveries: 0,
        };

        Ok(ElectionHandle {
            state_rx,
            stop_tx,
            task: Some(tokio::spawn(runner.run())),
        })
    }
}

/// Handle to a running election.
///
/// Dropping the handle asks the loop to stop; the loop still removes its
/// entry and closes its session in the background.
pub struct ElectionHandle {
    state_rx: watch::Receiver<LeadershipState>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Result<()>>>,
}

impl ElectionHandle {
    pub fn state(&self) -> LeadershipState {
        self.state_rx.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state_rx.borrow().is_leader()
    }

    /// Our current candidate entry, if registered
    pub fn candidate(&self) -> Option<CandidateId> {
        self.state_rx.borrow().candidate().cloned()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state_rx.clone()
    }

    /// Leave the election: cancel the watch, delete our entry, close the session.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Election shutdown requested");
        self.stop_tx.send_replace(true);
        self.wait().await
    }

    /// Wait for the loop to exit on its own, returning the error that ended it
    pub async fn wait(mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        match task.await {
            Ok(result) => result,
            Err(e) => Err(ElectionError::terminated(format!("election task failed: {}", e))),
        }
    }
}

impl Drop for ElectionHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.stop_tx.send_replace(true);
        }
    }
}

/// Deletion signal tagged with the arm it belongs to
struct LoopSignal {
    epoch: u64,
    fired: WatchFired,
}

/// Components bound to one coordination session
struct SessionContext {
    service: Arc<dyn CoordinationService>,
    registrar: CandidateRegistrar,
    resolver: ElectionResolver,
    watches: WatchManager,
}

/// How a session's participation ended
enum Outcome {
    /// Shutdown requested; our entry still needs removing
    Stopped(Option<CandidateId>),

    /// The session is gone, a new one may be opened
    SessionLost(ElectionError),

    /// Unrecoverable error
    Failed(ElectionError, Option<CandidateId>),
}

/// Next step after resolving with a registered entry
enum Step {
    Reregister,
    Exit(Outcome),
}

enum Wake {
    Stop,
    SessionEnded(SessionState),
    Fired(WatchFired),
}

struct Runner {
    connector: Arc<dyn Connector>,
    config: ElectionConfig,
    root: ElectionRoot,
    observer: Arc<dyn ElectionObserver>,
    state_tx: watch::Sender<LeadershipState>,
    stop_rx: watch::Receiver<bool>,
    signal_tx: mpsc::UnboundedSender<LoopSignal>,
    signal_rx: mpsc::UnboundedReceiver<LoopSignal>,
    epoch: u64,
    recoveries: u32,
}

impl Runner {
    async fn run(mut self) -> Result<()> {
        let mut session = match self.connect().await {
            Ok(session) => session,
            Err(e) => return self.terminate(Err(e)),
        };

        loop {
            match self.participate(&session).await {
                Outcome::Stopped(candidate) => {
                    let result = self.leave(&session, candidate.as_ref()).await;
                    return self.terminate(result);
                }
                Outcome::Failed(error, candidate) => {
                    if let Err(e) = self.leave(&session, candidate.as_ref()).await {
                        tracing::debug!("Cleanup after failure also failed: {}", e);
                    }
                    return self.terminate(Err(error));
                }
                Outcome::SessionLost(error) => {
                    if self.recoveries >= self.config.max_session_recoveries {
                        return self.terminate(Err(error));
                    }
                    self.recoveries += 1;
                    self.observer.on_error(&error, false);
                    tracing::info!(
                        attempt = self.recoveries,
                        max = self.config.max_session_recoveries,
                        "Session {} lost, opening a new one",
                        session.service.session_id()
                    );

                    if let Err(e) = session.service.close().await {
                        tracing::debug!("Closing lost session: {}", e);
                    }
                    session = match self.connect().await {
                        Ok(session) => session,
                        Err(e) => return self.terminate(Err(e)),
                    };
                }
            }
        }
    }

    async fn connect(&self) -> Result<SessionContext> {
        let timeout = self.config.session_timeout;
        let service = with_retry(&self.config.retry, "connect", || self.connector.connect(timeout))
            .await
            .map_err(|e| ElectionError::registration(self.root.as_str(), e))?;

        tracing::debug!("Opened session {}", service.session_id());
        let prefix = self.config.candidate_prefix.as_str();
        let retry = &self.config.retry;

        Ok(SessionContext {
            registrar: CandidateRegistrar::new(service.clone(), prefix, retry.clone()),
            resolver: ElectionResolver::new(service.clone(), prefix, retry.clone()),
            watches: WatchManager::new(service.clone(), retry.clone()),
            service,
        })
    }

    /// Register and follow the election until this session can no longer take part
    async fn participate(&mut self, session: &SessionContext) -> Outcome {
        loop {
            if self.stop_requested() {
                return Outcome::Stopped(None);
            }

            self.transition(LeadershipState::Registering);
            let registered = match session.registrar.ensure_root(&self.root).await {
                Ok(()) => session.registrar.register(&self.root).await,
                Err(e) => Err(e),
            };
            let candidate = match registered {
                Ok(candidate) => candidate,
                Err(e) if e.requires_new_session() => return Outcome::SessionLost(e),
                Err(e) => return Outcome::Failed(e, None),
            };

            self.recoveries = 0;
            self.observer.on_registered(&candidate);

            match self.follow(session, &candidate).await {
                Step::Reregister => continue,
                Step::Exit(outcome) => return outcome,
            }
        }
    }

    /// Resolve our role and act on it until the entry is lost or we exit
    async fn follow(&mut self, session: &SessionContext, candidate: &CandidateId) -> Step {
        loop {
            if self.stop_requested() {
                return Step::Exit(Outcome::Stopped(Some(candidate.clone())));
            }

            self.transition(LeadershipState::Resolving);
            let resolution = match session.resolver.resolve(&self.root, candidate).await {
                Ok(resolution) => resolution,
                Err(e) => return self.recover(e, candidate),
            };

            let wake = match resolution {
                Resolution::Leader => {
                    self.transition(LeadershipState::Leader {
                        candidate: candidate.clone(),
                    });
                    self.wait(session, None).await
                }
                Resolution::Follower { predecessor } => {
                    let Some(subscription) = (match self.arm(session, &predecessor).await {
                        Ok(subscription) => subscription,
                        Err(e) if is_rearmable(&e) => {
                            if !self.back_off(&e).await {
                                return Step::Exit(Outcome::Stopped(Some(candidate.clone())));
                            }
                            continue;
                        }
                        Err(e) => return self.recover(e, candidate),
                    }) else {
                        // Predecessor left between listing and arming
                        continue;
                    };

                    self.observer.on_watch_armed(candidate, &predecessor);
                    self.transition(LeadershipState::Watching {
                        candidate: candidate.clone(),
                        predecessor,
                    });

                    let wake = self.wait(session, Some(self.epoch)).await;
                    subscription.cancel();
                    wake
                }
            };

            match wake {
                Wake::Stop => return Step::Exit(Outcome::Stopped(Some(candidate.clone()))),
                Wake::SessionEnded(state) => {
                    let error = ElectionError::session_lost(
                        session.service.session_id().to_string(),
                        match state {
                            SessionState::Closed => ServiceError::Closed,
                            _ => ServiceError::SessionExpired,
                        },
                    );
                    return Step::Exit(Outcome::SessionLost(error));
                }
                Wake::Fired(fired) => {
                    self.observer.on_watch_fired(candidate, &fired);
                    if let WatchFired::Abandoned { error, .. } = fired {
                        if !is_rearmable(&error) {
                            return self.recover(error, candidate);
                        }
                        if !self.back_off(&error).await {
                            return Step::Exit(Outcome::Stopped(Some(candidate.clone())));
                        }
                    }
                }
            }
        }
    }

    /// Arm a deletion watch whose delivery is tagged with a fresh epoch
    async fn arm(
        &mut self,
        session: &SessionContext,
        predecessor: &CandidateId,
    ) -> Result<Option<WatchSubscription>> {
        self.epoch += 1;
        let epoch = self.epoch;
        let signals = self.signal_tx.clone();

        session
            .watches
            .watch_deletion(predecessor, move |fired| {
                if signals.send(LoopSignal { epoch, fired }).is_err() {
                    tracing::debug!("Election loop is gone, dropping watch signal");
                }
            })
            .await
    }

    /// Report a recoverable watch failure and pause before resolving again.
    ///
    /// Returns false if shutdown was requested during the pause.
    async fn back_off(&mut self, error: &ElectionError) -> bool {
        self.observer.on_error(error, false);
        tracing::warn!("{}, resolving again", error);

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(self.config.retry.max_delay) => false,
            _ = self.stop_rx.changed() => true,
        };
        !interrupted && !self.stop_requested()
    }

    /// Classify an error raised while holding a registered entry
    fn recover(&self, error: ElectionError, candidate: &CandidateId) -> Step {
        if error.requires_new_session() {
            return Step::Exit(Outcome::SessionLost(error));
        }
        if error.invalidates_identity() {
            self.observer.on_error(&error, false);
            tracing::info!("Candidate {} lost its entry, registering again", candidate);
            return Step::Reregister;
        }
        Step::Exit(Outcome::Failed(error, Some(candidate.clone())))
    }

    /// Block until shutdown, session loss or, when `epoch` is set, a matching watch signal
    async fn wait(&mut self, session: &SessionContext, epoch: Option<u64>) -> Wake {
        let mut session_state = session.service.session_state();

        loop {
            let current = *session_state.borrow_and_update();
            if current.is_terminal() {
                return Wake::SessionEnded(current);
            }
            if self.stop_requested() {
                return Wake::Stop;
            }

            tokio::select! {
                changed = self.stop_rx.changed() => {
                    if changed.is_err() {
                        return Wake::Stop;
                    }
                }
                changed = session_state.changed() => {
                    if changed.is_err() {
                        return Wake::SessionEnded(SessionState::Expired);
                    }
                }
                Some(signal) = self.signal_rx.recv() => {
                    if Some(signal.epoch) == epoch {
                        return Wake::Fired(signal.fired);
                    }
                    tracing::debug!(
                        epoch = signal.epoch,
                        "Ignoring stale watch signal for {}",
                        signal.fired.target()
                    );
                }
            }
        }
    }

    /// Best-effort departure: delete our entry, then end the session
    async fn leave(&self, session: &SessionContext, candidate: Option<&CandidateId>) -> Result<()> {
        let mut result = Ok(());

        if let Some(candidate) = candidate {
            match session.registrar.deregister(candidate).await {
                Ok(()) => {}
                Err(e) if e.requires_new_session() => {
                    tracing::debug!("Session already gone, {} went with it", candidate);
                }
                Err(e) => result = Err(e),
            }
        }

        if let Err(e) = session.service.close().await {
            tracing::debug!("Closing session: {}", e);
        }
        result
    }

    fn terminate(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            self.observer.on_error(e, true);
        }
        self.transition(LeadershipState::Terminated);
        tracing::info!("Election participant stopped");
        result
    }

    fn transition(&self, next: LeadershipState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            self.observer.on_state_change(&previous, &next);
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }
}

/// Watch failures that leave the session usable are retried from resolution
fn is_rearmable(error: &ElectionError) -> bool {
    matches!(error, ElectionError::WatchDelivery { .. }) && !error.requires_new_session()
}
