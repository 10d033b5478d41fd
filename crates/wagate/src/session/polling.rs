//! Status polling for the connect flow.
//!
//! A cycle runs in its own task: check the status, react, sleep, repeat.
//! Ticks are strictly sequential, so at most one status request per session
//! is in flight. Each mode has its own attempt ceiling; obtaining a QR moves
//! the cycle from [`PollMode::AcquireQr`] to [`PollMode::MonitorPairing`] with
//! a fresh count.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wagate_protocol::{PairedIdentity, PollMode, SessionEvent, SessionStatus, TimeoutCondition};

use super::busy::{BusySlot, Occupant};
use super::events::EventSink;
use super::tracker::SessionTracker;
use crate::gateway::SessionGateway;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_ACQUIRE_MAX_ATTEMPTS: u32 = 50;
pub const DEFAULT_MONITOR_MAX_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    /// Delay between the end of one tick and the start of the next.
    pub tick_interval: Duration,
    pub acquire_max_attempts: u32,
    pub monitor_max_attempts: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            acquire_max_attempts: DEFAULT_ACQUIRE_MAX_ATTEMPTS,
            monitor_max_attempts: DEFAULT_MONITOR_MAX_ATTEMPTS,
        }
    }
}

impl PollingConfig {
    pub fn max_attempts(&self, mode: PollMode) -> u32 {
        match mode {
            PollMode::AcquireQr => self.acquire_max_attempts,
            PollMode::MonitorPairing => self.monitor_max_attempts,
        }
    }
}

// ============================================================================
// Tick decisions
// ============================================================================

/// What a tick does after observing a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Paired: report success and stop.
    Connected,
    /// Report failure and stop.
    Failed,
    /// Session not running; stop quietly until someone re-initiates.
    Halt,
    /// Try to obtain the pairing QR.
    FetchArtifact,
    /// Report progress and keep polling.
    Continue,
}

pub fn decide(status: SessionStatus, mode: PollMode) -> TickAction {
    match (status, mode) {
        (SessionStatus::Working, _) => TickAction::Connected,
        (SessionStatus::Failed, _) => TickAction::Failed,
        (SessionStatus::Stopped | SessionStatus::NotFound, _) => TickAction::Halt,
        (SessionStatus::ScanQrCode, PollMode::AcquireQr) => TickAction::FetchArtifact,
        (SessionStatus::ScanQrCode, PollMode::MonitorPairing) | (SessionStatus::Starting, _) => {
            TickAction::Continue
        }
    }
}

/// How a polling cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Connected(Option<PairedIdentity>),
    Failed,
    /// Stopped on `STOPPED` or `NOT_FOUND`.
    Halted(SessionStatus),
    TimedOut(TimeoutCondition),
    /// The gateway refused a status check in a way retrying cannot fix,
    /// such as a bad API key. Carries the HTTP status if there was one.
    Rejected(Option<u16>),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartResult {
    Started,
    /// Another cycle holds the session; nothing was spawned.
    AlreadyActive,
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Clone)]
struct CycleContext {
    gateway: Arc<dyn SessionGateway>,
    session: Arc<str>,
    tracker: SessionTracker,
    events: EventSink,
    config: PollingConfig,
}

struct RunningCycle {
    token: CancellationToken,
    done: Shared<BoxFuture<'static, Option<CycleOutcome>>>,
}

/// Runs at most one polling cycle at a time for one session.
pub struct PollingEngine {
    ctx: CycleContext,
    busy: BusySlot,
    current: Mutex<Option<RunningCycle>>,
}

impl PollingEngine {
    pub fn new(
        gateway: Arc<dyn SessionGateway>,
        session: &str,
        tracker: SessionTracker,
        events: EventSink,
        busy: BusySlot,
        config: PollingConfig,
    ) -> Self {
        Self {
            ctx: CycleContext {
                gateway,
                session: Arc::from(session),
                tracker,
                events,
                config,
            },
            busy,
            current: Mutex::new(None),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<RunningCycle>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn a cycle in `mode` unless one is already running.
    pub fn start(&self, mode: PollMode) -> StartResult {
        let guard = match self.busy.claim(Occupant::Polling) {
            Ok(guard) => guard,
            Err(occupant) => {
                debug!(
                    session = %self.ctx.session,
                    mode = ?mode,
                    occupant = ?occupant,
                    "Polling cycle already active, not starting another"
                );
                return StartResult::AlreadyActive;
            }
        };

        info!(session = %self.ctx.session, mode = ?mode, "Starting polling cycle");

        let token = guard.token().clone();
        let ctx = self.ctx.clone();
        let cycle_token = token.clone();
        let handle = tokio::spawn(async move {
            let outcome = ctx.run(mode, &cycle_token).await;
            drop(guard);
            outcome
        });

        *self.current() = Some(RunningCycle {
            token,
            done: handle.map(|joined| joined.ok()).boxed().shared(),
        });
        StartResult::Started
    }

    pub fn is_active(&self) -> bool {
        self.busy.occupant() == Some(Occupant::Polling)
    }

    /// Stop scheduling ticks. A request already in flight finishes but its
    /// result is discarded.
    pub fn cancel(&self) {
        if let Some(cycle) = self.current().as_ref() {
            cycle.token.cancel();
        }
    }

    /// Cancel and wait for the cycle task to finish, so nothing it does can
    /// land after this returns.
    pub async fn cancel_and_wait(&self) -> Option<CycleOutcome> {
        let cycle = self.current().take()?;
        cycle.token.cancel();
        cycle.done.await
    }

    /// Wait for the most recent cycle to end.
    pub async fn wait(&self) -> Option<CycleOutcome> {
        let done = self.current().as_ref().map(|cycle| cycle.done.clone())?;
        done.await
    }
}

impl CycleContext {
    async fn run(&self, mut mode: PollMode, token: &CancellationToken) -> CycleOutcome {
        let mut attempt: u32 = 0;
        let mut failures_in_row: u32 = 0;
        let mut last_status = None;
        let mut artifact_obtained = mode == PollMode::MonitorPairing;

        loop {
            if token.is_cancelled() {
                return self.cancelled();
            }

            attempt += 1;
            let max_attempts = self.config.max_attempts(mode);
            debug!(session = %self.session, mode = ?mode, attempt, max_attempts, "Polling tick");

            let result = self.gateway.get_status(&self.session).await;
            if token.is_cancelled() {
                return self.cancelled();
            }

            match result {
                Err(e) if !e.is_transient() => {
                    warn!(
                        session = %self.session,
                        attempt,
                        error = %e,
                        "Status check rejected, stopping polling"
                    );
                    self.events.error(e.user_message());
                    return CycleOutcome::Rejected(e.status());
                }
                Err(e) => {
                    failures_in_row += 1;
                    warn!(
                        session = %self.session,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Status check failed, retrying"
                    );
                    if failures_in_row == 1 {
                        self.events
                            .error(format!("{}, reconnecting...", e.user_message()));
                    }
                }
                Ok(info) => {
                    failures_in_row = 0;
                    last_status = Some(info.status);
                    self.tracker.set_status(info.status, info.me.clone());

                    match decide(info.status, mode) {
                        TickAction::Connected => {
                            info!(session = %self.session, "Session paired and working");
                            self.events.success("WhatsApp connected");
                            return CycleOutcome::Connected(info.me);
                        }
                        TickAction::Failed => {
                            warn!(session = %self.session, "Session failed, stopping polling");
                            self.events
                                .error("WhatsApp session failed, reset or reconnect to try again");
                            return CycleOutcome::Failed;
                        }
                        TickAction::Halt => {
                            info!(
                                session = %self.session,
                                status = %info.status,
                                "Session not running, stopping polling"
                            );
                            return CycleOutcome::Halted(info.status);
                        }
                        TickAction::FetchArtifact => {
                            let fetched = self.gateway.fetch_pairing_artifact(&self.session).await;
                            if token.is_cancelled() {
                                return self.cancelled();
                            }
                            match fetched {
                                Ok(Some(artifact)) => {
                                    if self.tracker.set_pairing_artifact(artifact) {
                                        info!(session = %self.session, "Pairing QR obtained");
                                        self.events.success("QR code ready, scan it with WhatsApp");
                                        mode = PollMode::MonitorPairing;
                                        attempt = 0;
                                        artifact_obtained = true;
                                    }
                                }
                                Ok(None) => {
                                    debug!(session = %self.session, attempt, "Pairing QR not available yet");
                                }
                                Err(e) => {
                                    warn!(
                                        session = %self.session,
                                        attempt,
                                        error = %e,
                                        "Failed to fetch pairing QR"
                                    );
                                }
                            }
                        }
                        TickAction::Continue => {
                            self.events.emit(SessionEvent::Progress {
                                mode,
                                attempt,
                                max_attempts,
                                status: info.status,
                            });
                        }
                    }
                }
            }

            if attempt >= self.config.max_attempts(mode) {
                return self.timed_out(TimeoutCondition {
                    mode,
                    attempts: attempt,
                    last_status,
                    artifact_obtained,
                });
            }

            tokio::select! {
                _ = token.cancelled() => return self.cancelled(),
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
        }
    }

    fn cancelled(&self) -> CycleOutcome {
        debug!(session = %self.session, "Polling cycle cancelled");
        CycleOutcome::Cancelled
    }

    fn timed_out(&self, condition: TimeoutCondition) -> CycleOutcome {
        if condition.is_error() {
            warn!(
                session = %self.session,
                attempts = condition.attempts,
                "Pairing QR never became available"
            );
            self.events
                .error("QR code did not become available, try connecting again");
        } else {
            info!(
                session = %self.session,
                attempts = condition.attempts,
                "Pairing QR not scanned in time, it stays valid"
            );
        }
        self.events.emit(SessionEvent::TimedOut {
            condition: condition.clone(),
        });
        CycleOutcome::TimedOut(condition)
    }
}
