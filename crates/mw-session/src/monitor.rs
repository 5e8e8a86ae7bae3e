//! Idle-session tracking.
//!
//! The monitor runs as a task that owns the session clock. Activity and
//! resets arrive as commands, credential changes arrive from the
//! [`CredentialStore`](mw_auth::CredentialStore) watch channel, and two
//! intervals drive it: a fine one that republishes the countdown and a
//! coarse one that fires warnings, enforces expiry and starts proactive
//! refreshes.
//!
//! ```text
//! Inactive --login--> Active --threshold--> Warning --timeout--> Expired
//!                       ^                      |                    |
//!                       +------activity--------+                    |
//!                       +-------------------login-------------------+
//! ```

use std::time::Duration;

use mw_auth::{Credential, RefreshCoordinator};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::SessionConfig;

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Nobody is signed in
    Inactive,
    Active,
    /// The expiry warning has fired for the current window
    Warning,
    /// Expired and signed out, until the next login
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Time left before the session expires, zero unless active or warning
    pub remaining: Duration,
}

impl SessionStatus {
    fn inactive() -> Self {
        Self {
            state: SessionState::Inactive,
            remaining: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Warning { remaining: Duration },
    Expired,
}

#[derive(Debug)]
enum Command {
    Activity(Instant),
    Reset(Instant),
}

/// Handle to the running monitor task. Dropping it stops the task and its
/// timers.
#[derive(Debug)]
pub struct SessionMonitor {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    task: JoinHandle<()>,
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl SessionMonitor {
    /// Start monitoring. Must be called from within a tokio runtime.
    ///
    /// If the coordinator's store already holds a credential the session
    /// clock starts now.
    pub fn start(config: SessionConfig, coordinator: RefreshCoordinator) -> Self {
        let now = Instant::now();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::inactive());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let credentials = coordinator.store().subscribe();
        let mut actor = Actor {
            config,
            coordinator,
            clock: None,
            expired: false,
            last_accepted_activity: None,
            window_refresh_requested: false,
            token_refresh_for: None,
            status: status_tx,
            events: events.clone(),
            refreshes: JoinSet::new(),
        };
        if credentials.borrow().is_some() {
            actor.start_clock(now);
        }
        actor.publish(now);

        let task = tokio::spawn(actor.run(command_rx, credentials));

        Self {
            commands,
            status,
            events,
            task,
        }
    }

    /// Report user interaction. Bursts are throttled to one clock reset per
    /// `activity_throttle`.
    pub fn record_activity(&self) {
        let _ = self.commands.send(Command::Activity(Instant::now()));
    }

    /// Restart the session clock, e.g. right after a login
    pub fn reset(&self) {
        let _ = self.commands.send(Command::Reset(Instant::now()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Countdown feed, updated every display tick
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}

#[derive(Debug, Clone, Copy)]
struct SessionClock {
    last_activity_at: Instant,
    session_expires_at: Instant,
    warning_fired: bool,
}

struct Actor {
    config: SessionConfig,
    coordinator: RefreshCoordinator,
    clock: Option<SessionClock>,
    expired: bool,
    last_accepted_activity: Option<Instant>,
    /// A session-window refresh was started for the current window
    window_refresh_requested: bool,
    /// Access token a token-lifetime refresh was started for
    token_refresh_for: Option<String>,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    refreshes: JoinSet<()>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut credentials: watch::Receiver<Option<Credential>>,
    ) {
        let mut display = tokio::time::interval(self.config.display_tick());
        display.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut enforcement = tokio::time::interval(self.config.enforcement_tick());
        enforcement.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = display.tick() => self.publish(Instant::now()),
                _ = enforcement.tick() => self.enforce(Instant::now()).await,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        Command::Activity(at) => self.on_activity(at),
                        Command::Reset(at) => self.start_clock(at),
                    }
                    self.publish(Instant::now());
                }
                changed = credentials.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let credential = credentials.borrow_and_update().clone();
                    self.on_credential(credential.as_ref(), Instant::now());
                    self.publish(Instant::now());
                }
                Some(_) = self.refreshes.join_next(), if !self.refreshes.is_empty() => {}
            }
        }

        debug!("Session monitor stopped");
    }

    fn start_clock(&mut self, now: Instant) {
        self.clock = Some(SessionClock {
            last_activity_at: now,
            session_expires_at: now + self.config.session_timeout(),
            warning_fired: false,
        });
        self.expired = false;
        self.last_accepted_activity = None;
        self.window_refresh_requested = false;
        self.token_refresh_for = None;
        info!(timeout_secs = self.config.session_timeout_secs, "Session clock started");
    }

    fn on_activity(&mut self, at: Instant) {
        let Some(clock) = self.clock.as_mut() else {
            return;
        };

        if let Some(last) = self.last_accepted_activity
            && at.saturating_duration_since(last) < self.config.activity_throttle()
        {
            return;
        }

        self.last_accepted_activity = Some(at);
        clock.last_activity_at = at;
        clock.session_expires_at = at + self.config.session_timeout();
        clock.warning_fired = false;
        self.window_refresh_requested = false;
        debug!("Activity extended the session");
    }

    fn on_credential(&mut self, credential: Option<&Credential>, now: Instant) {
        match (credential, self.clock.is_some()) {
            (Some(_), false) => {
                debug!("Credential appeared, starting session");
                self.start_clock(now);
            }
            (None, true) => {
                info!("Signed out, stopping session clock");
                self.clock = None;
            }
            _ => {}
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn enforce(&mut self, now: Instant) {
        let Some(clock) = self.clock.as_mut() else {
            return;
        };

        if now >= clock.session_expires_at {
            self.clock = None;
            self.expired = true;
            warn!("Session expired, signing out");
            if let Err(e) = self.coordinator.store().clear().await {
                error!("Failed to clear credential on session expiry: {}", e);
            }
            let _ = self.events.send(SessionEvent::Expired);
            self.publish(now);
            return;
        }

        let remaining = clock.session_expires_at - now;
        if remaining <= self.config.warning_threshold() && !clock.warning_fired {
            clock.warning_fired = true;
            info!(remaining_secs = remaining.as_secs(), "Session about to expire");
            let _ = self.events.send(SessionEvent::Warning { remaining });
            self.publish(now);
        }

        self.maybe_refresh(remaining);
    }

    fn maybe_refresh(&mut self, session_remaining: Duration) {
        let threshold = self.config.refresh_threshold();
        if threshold.is_zero() {
            return;
        }
        let Some(credential) = self.coordinator.store().get() else {
            return;
        };

        let window_due = session_remaining <= threshold && !self.window_refresh_requested;
        let token_due = credential.remaining() <= threshold
            && self.token_refresh_for.as_deref() != Some(credential.access_token.as_str());
        if !window_due && !token_due {
            return;
        }

        if window_due {
            self.window_refresh_requested = true;
        }
        if token_due {
            self.token_refresh_for = Some(credential.access_token);
        }

        debug!(window_due, token_due, "Starting proactive refresh");
        let coordinator = self.coordinator.clone();
        self.refreshes.spawn(async move {
            match coordinator.refresh().await {
                Ok(_) => debug!("Proactive refresh succeeded"),
                Err(e) => warn!("Proactive refresh failed: {}", e),
            }
        });
    }

    fn publish(&self, now: Instant) {
        let status = match &self.clock {
            Some(clock) => SessionStatus {
                state: if clock.warning_fired {
                    SessionState::Warning
                } else {
                    SessionState::Active
                },
                remaining: clock.session_expires_at.saturating_duration_since(now),
            },
            None if self.expired => SessionStatus {
                state: SessionState::Expired,
                remaining: Duration::ZERO,
            },
            None => SessionStatus::inactive(),
        };
        self.status.send_replace(status);
    }
}
