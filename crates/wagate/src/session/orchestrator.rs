//! User-facing session intents.
//!
//! The orchestrator composes the gateway client, the tracker and the polling
//! engine. Intents are serialized; every intent that stops or replaces the
//! connect flow cancels the polling cycle and waits for it before touching
//! the gateway, so nothing a cancelled tick does lands after it returns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wagate_protocol::{PairingArtifact, PollMode, SessionEvent, SessionInfo, SessionStatus};

use super::busy::{BusyGuard, BusySlot, Occupant};
use super::events::EventSink;
use super::handle::SessionHandle;
use super::polling::{CycleOutcome, PollingConfig, PollingEngine, StartResult};
use super::tracker::{SessionTracker, StatusSnapshot};
use crate::gateway::{GatewayError, SessionGateway, SessionMetadata};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_AUTO_REFRESH_INTERVAL: Duration = Duration::from_secs(180);

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("deleting a session needs explicit confirmation")]
    ConfirmationRequired,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wait after creating, starting or restarting a session before the
    /// status is checked again.
    pub settle_delay: Duration,
    pub auto_refresh_interval: Duration,
    /// Attached to the session when it is created.
    pub metadata: SessionMetadata,
    pub polling: PollingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            auto_refresh_interval: DEFAULT_AUTO_REFRESH_INTERVAL,
            metadata: SessionMetadata::default(),
            polling: PollingConfig::default(),
        }
    }
}

/// What `connect` (or `restart`) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The session is already paired and working.
    AlreadyConnected,
    /// A polling cycle was started in this mode.
    Polling(PollMode),
    /// A polling cycle was already running; nothing new was started.
    AlreadyPolling,
}

// ============================================================================
// Status probe
// ============================================================================

/// Status check shared by intents and the auto-refresh task.
#[derive(Clone)]
struct StatusProbe {
    gateway: Arc<dyn SessionGateway>,
    session: Arc<str>,
    tracker: SessionTracker,
}

impl StatusProbe {
    async fn fetch(&self) -> Result<SessionInfo, GatewayError> {
        self.gateway.get_status(&self.session).await
    }

    fn apply(&self, info: &SessionInfo) {
        self.tracker.set_status(info.status, info.me.clone());
    }
}

struct AutoRefresh {
    token: CancellationToken,
    task: JoinHandle<()>,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Owns one tenant's session: its tracked state, its polling engine and its
/// optional background refresh.
pub struct SessionOrchestrator {
    handle: SessionHandle,
    probe: StatusProbe,
    events: EventSink,
    busy: BusySlot,
    engine: PollingEngine,
    config: OrchestratorConfig,
    intents: tokio::sync::Mutex<()>,
    auto_refresh: Mutex<Option<AutoRefresh>>,
}

impl SessionOrchestrator {
    pub fn new(
        handle: SessionHandle,
        gateway: Arc<dyn SessionGateway>,
        events: EventSink,
        config: OrchestratorConfig,
    ) -> Self {
        let tracker = SessionTracker::new();
        let busy = BusySlot::new();

        let status_events = events.clone();
        let artifact_events = events.clone();
        tracker.subscribe(
            move |snapshot| {
                status_events.emit(SessionEvent::StatusChanged {
                    status: snapshot.status,
                    identity: snapshot.identity.clone(),
                });
            },
            move |artifact| {
                artifact_events.emit(SessionEvent::ArtifactChanged {
                    artifact: artifact.cloned(),
                });
            },
        );

        let engine = PollingEngine::new(
            gateway.clone(),
            handle.name(),
            tracker.clone(),
            events.clone(),
            busy.clone(),
            config.polling,
        );

        Self {
            probe: StatusProbe {
                gateway,
                session: Arc::from(handle.name()),
                tracker,
            },
            handle,
            events,
            busy,
            engine,
            config,
            intents: tokio::sync::Mutex::new(()),
            auto_refresh: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &str {
        self.handle.name()
    }

    pub fn status(&self) -> SessionStatus {
        self.probe.tracker.status()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.probe.tracker.snapshot()
    }

    pub fn artifact(&self) -> Option<PairingArtifact> {
        self.probe.tracker.artifact()
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.probe.tracker
    }

    pub fn is_polling(&self) -> bool {
        self.engine.is_active()
    }

    /// Wait for the current polling cycle, if any, to end on its own.
    pub async fn wait_for_cycle(&self) -> Option<CycleOutcome> {
        self.engine.wait().await
    }

    // ------------------------------------------------------------------------
    // Intents
    // ------------------------------------------------------------------------

    /// Bring the session to a paired state, creating it if needed.
    ///
    /// Returns once polling has started; pairing completes in the background
    /// and is reported through the event stream.
    pub async fn connect(&self) -> Result<ConnectOutcome, SessionError> {
        let _intent = self.intents.lock().await;

        if self.engine.is_active() {
            debug!(session = %self.handle, "Connect requested while polling, ignoring");
            return Ok(ConnectOutcome::AlreadyPolling);
        }
        let Some(guard) = self.claim_intent() else {
            return Ok(ConnectOutcome::AlreadyPolling);
        };

        let info = self.check_status().await?;
        let mode = match info.status {
            SessionStatus::Working => {
                info!(session = %self.handle, "Session already connected");
                self.events.success("WhatsApp already connected");
                return Ok(ConnectOutcome::AlreadyConnected);
            }
            SessionStatus::ScanQrCode => self.scan_mode(),
            SessionStatus::Starting => PollMode::AcquireQr,
            SessionStatus::NotFound => {
                self.create_session().await?;
                if self.settle_and_recheck().await == Some(SessionStatus::Working) {
                    return Ok(self.connected());
                }
                PollMode::AcquireQr
            }
            SessionStatus::Stopped => {
                info!(session = %self.handle, "Starting stopped session");
                self.probe
                    .gateway
                    .start_session(self.session())
                    .await
                    .map_err(|e| self.report(e))?;
                if self.settle_and_recheck().await == Some(SessionStatus::Working) {
                    return Ok(self.connected());
                }
                PollMode::AcquireQr
            }
            SessionStatus::Failed => {
                info!(session = %self.handle, "Restarting failed session");
                self.probe
                    .gateway
                    .restart_session(self.session())
                    .await
                    .map_err(|e| self.report(e))?;
                if self.settle_and_recheck().await == Some(SessionStatus::Working) {
                    return Ok(self.connected());
                }
                PollMode::AcquireQr
            }
        };

        drop(guard);
        Ok(self.start_polling(mode))
    }

    /// Stop the session on the gateway and end any polling.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let _intent = self.intents.lock().await;
        self.engine.cancel_and_wait().await;
        let _guard = self.claim_intent();

        let result = self.probe.gateway.stop_session(self.session()).await;
        self.probe.tracker.clear_artifact();
        result.map_err(|e| self.report(e))?;

        self.probe.tracker.set_status(SessionStatus::Stopped, None);
        info!(session = %self.handle, "Session disconnected");
        self.events.success("WhatsApp disconnected");
        Ok(())
    }

    /// Delete the session on the gateway. Needs `confirmed`, since the paired
    /// device has to scan a new QR afterwards.
    pub async fn reset(&self, confirmed: bool) -> Result<(), SessionError> {
        if !confirmed {
            return Err(SessionError::ConfirmationRequired);
        }

        let _intent = self.intents.lock().await;
        self.engine.cancel_and_wait().await;
        let _guard = self.claim_intent();

        match self.probe.gateway.delete_session(self.session()).await {
            Ok(()) => {}
            Err(e) if e.status() == Some(404) => {
                debug!(session = %self.handle, "Session already gone on the gateway");
            }
            Err(e) => return Err(self.report(e)),
        }

        self.probe.tracker.reset();
        info!(session = %self.handle, "Session deleted");
        self.events.success("WhatsApp session deleted");
        Ok(())
    }

    /// Restart the session and poll for a new QR.
    pub async fn restart(&self) -> Result<ConnectOutcome, SessionError> {
        let _intent = self.intents.lock().await;
        self.engine.cancel_and_wait().await;
        let guard = self.claim_intent();

        self.probe
            .gateway
            .restart_session(self.session())
            .await
            .map_err(|e| self.report(e))?;
        self.probe.tracker.clear_artifact();
        info!(session = %self.handle, "Session restarting");
        self.events.success("WhatsApp session restarting");

        if self.settle_and_recheck().await == Some(SessionStatus::Working) {
            return Ok(self.connected());
        }

        drop(guard);
        Ok(self.start_polling(PollMode::AcquireQr))
    }

    /// One-shot status check. Ends any polling cycle and preempts a
    /// background refresh first.
    ///
    /// A session waiting for a scan gets a fresh cycle: it monitors the
    /// cached QR if there is one and acquires a new one otherwise.
    pub async fn refresh_status(&self) -> Result<StatusSnapshot, SessionError> {
        let _intent = self.intents.lock().await;
        self.engine.cancel_and_wait().await;
        let guard = self.claim_intent();

        let info = self.check_status().await?;
        drop(guard);
        if info.status == SessionStatus::ScanQrCode {
            let mode = self.scan_mode();
            debug!(session = %self.handle, mode = ?mode, "Session waiting for a scan, polling");
            self.start_polling(mode);
        }
        Ok(self.probe.tracker.snapshot())
    }

    // ------------------------------------------------------------------------
    // Auto-refresh
    // ------------------------------------------------------------------------

    /// Enable or disable the silent background status check.
    ///
    /// Ticks are skipped while anything else holds the session.
    pub fn set_auto_refresh(&self, enabled: bool) {
        let mut slot = self.auto_refresh();
        if let Some(previous) = slot.take() {
            previous.token.cancel();
        }
        if !enabled {
            debug!(session = %self.handle, "Auto-refresh disabled");
            return;
        }
        if self.config.auto_refresh_interval.is_zero() {
            warn!(session = %self.handle, "Auto-refresh interval is zero, leaving it disabled");
            return;
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(run_auto_refresh(
            self.probe.clone(),
            self.busy.clone(),
            self.config.auto_refresh_interval,
            token.clone(),
        ));
        *slot = Some(AutoRefresh { token, task });
    }

    pub fn auto_refresh_enabled(&self) -> bool {
        self.auto_refresh().is_some()
    }

    /// Stop polling and auto-refresh and wait for both to finish.
    pub async fn shutdown(&self) {
        let _intent = self.intents.lock().await;
        let refresh = self.auto_refresh().take();
        if let Some(refresh) = refresh {
            refresh.token.cancel();
            if let Err(e) = refresh.task.await {
                warn!(session = %self.handle, error = %e, "Auto-refresh task ended abnormally");
            }
        }
        self.engine.cancel_and_wait().await;
        debug!(session = %self.handle, "Session orchestrator shut down");
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn auto_refresh(&self) -> MutexGuard<'_, Option<AutoRefresh>> {
        self.auto_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the busy slot for an intent, preempting a background refresh.
    ///
    /// Intents are serialized and cancel polling first, so this only fails
    /// if a cycle was started behind the orchestrator's back.
    fn claim_intent(&self) -> Option<BusyGuard> {
        match self.busy.claim(Occupant::Intent) {
            Ok(guard) => Some(guard),
            Err(occupant) => {
                debug!(session = %self.handle, occupant = ?occupant, "Session busy");
                None
            }
        }
    }

    /// Polling mode for a session showing SCAN_QR_CODE.
    fn scan_mode(&self) -> PollMode {
        if self.probe.tracker.artifact().is_some() {
            PollMode::MonitorPairing
        } else {
            PollMode::AcquireQr
        }
    }

    fn start_polling(&self, mode: PollMode) -> ConnectOutcome {
        match self.engine.start(mode) {
            StartResult::Started => ConnectOutcome::Polling(mode),
            StartResult::AlreadyActive => ConnectOutcome::AlreadyPolling,
        }
    }

    fn connected(&self) -> ConnectOutcome {
        info!(session = %self.handle, "Session connected");
        self.events.success("WhatsApp connected");
        ConnectOutcome::AlreadyConnected
    }

    /// Non-silent status check: failures are reported to observers.
    async fn check_status(&self) -> Result<SessionInfo, SessionError> {
        let info = self.probe.fetch().await.map_err(|e| self.report(e))?;
        self.probe.apply(&info);
        Ok(info)
    }

    async fn create_session(&self) -> Result<(), SessionError> {
        self.probe.gateway.ping().await.map_err(|e| self.report(e))?;

        let created = self
            .probe
            .gateway
            .create_session(self.session(), &self.config.metadata)
            .await
            .map_err(|e| self.report(e))?;
        self.probe.apply(&created);

        info!(session = %self.handle, status = %created.status, "Session created");
        self.events.success("WhatsApp session created, waiting for QR code");
        Ok(())
    }

    /// Give the gateway time to act, then check the status once.
    ///
    /// A failed check is not fatal: polling starts anyway and retries.
    async fn settle_and_recheck(&self) -> Option<SessionStatus> {
        tokio::time::sleep(self.config.settle_delay).await;
        match self.probe.fetch().await {
            Ok(info) => {
                self.probe.apply(&info);
                Some(info.status)
            }
            Err(e) => {
                warn!(session = %self.handle, error = %e, "Status re-check failed, polling will retry");
                None
            }
        }
    }

    fn report(&self, error: GatewayError) -> SessionError {
        warn!(session = %self.handle, error = %error, "Gateway request failed");
        self.events.error(error.user_message());
        SessionError::Gateway(error)
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.engine.cancel();
        if let Some(refresh) = self.auto_refresh().take() {
            refresh.token.cancel();
        }
    }
}

/// Background drift detection: re-check the status every `interval` while
/// nothing else holds the session. Failures are only logged.
async fn run_auto_refresh(
    probe: StatusProbe,
    busy: BusySlot,
    interval: Duration,
    token: CancellationToken,
) {
    debug!(session = %probe.session, interval_secs = interval.as_secs(), "Auto-refresh started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the session was just checked.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(guard) = busy.try_claim_refresh() else {
                    debug!(session = %probe.session, "Session busy, skipping auto-refresh");
                    continue;
                };

                let result = probe.fetch().await;
                if token.is_cancelled() {
                    break;
                }
                match result {
                    Ok(info) => {
                        if guard.while_held(|| probe.apply(&info)).is_none() {
                            debug!(session = %probe.session, "Auto-refresh preempted, discarding result");
                        }
                    }
                    Err(e) => {
                        debug!(session = %probe.session, error = %e, "Auto-refresh status check failed");
                    }
                }
            }
        }
    }

    debug!(session = %probe.session, "Auto-refresh stopped");
}
