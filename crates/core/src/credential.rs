//! Per-credential paint loop and its retry/backoff state machine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::model::{token_tail, CredentialStatus, PaintOutcome, Validation};
use crate::scheduler::{Assignment, Scheduler};

/// Shared view of a running loop: its identity, kill switch and last status.
pub struct LoopHandle {
    token: String,
    receiver: String,
    killed: watch::Sender<bool>,
    status: Mutex<CredentialStatus>,
}

impl LoopHandle {
    /// Handle for a loop that has not been killed.
    pub fn new(token: String, receiver: String, status: CredentialStatus) -> Self {
        let (killed, _) = watch::channel(false);
        Self {
            token,
            receiver,
            killed,
            status: Mutex::new(status),
        }
    }

    /// Credential secret.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Account the credential paints for.
    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    /// Last published status.
    pub fn status(&self) -> CredentialStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: CredentialStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Asks the loop to stop. Takes effect at the next iteration or wait.
    pub fn kill(&self) {
        self.killed.send_replace(true);
    }

    /// Whether [`LoopHandle::kill`] was called.
    pub fn is_killed(&self) -> bool {
        *self.killed.borrow()
    }

    async fn wait_killed(&self) {
        let mut rx = self.killed.subscribe();
        let _ = rx.wait_for(|killed| *killed).await;
    }
}

/// What the loop does after handling an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Sleep, then run another iteration.
    Wait(Duration),
    /// Stop the loop.
    Exit,
}

/// Result of feeding one outcome to [`LoopState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// New status to publish, only when it changed.
    pub status: Option<CredentialStatus>,
    /// What to do next.
    pub step: Step,
}

/// Counters driving the loop's waits and status changes.
#[derive(Debug, Clone)]
pub struct LoopState {
    /// Status as last published.
    pub status: CredentialStatus,
    /// Consecutive `Cooldowning` outcomes.
    pub busies: u32,
    /// Consecutive server-side or transport failures.
    pub errors: u32,
    /// Current spacing of idle validations.
    pub validate_every: Duration,
    /// Last validation or successful paint.
    pub last_validated: Instant,
}

impl LoopState {
    /// Fresh counters starting from `status`.
    pub fn new(status: CredentialStatus, now: Instant, config: &EngineConfig) -> Self {
        Self {
            status,
            busies: 0,
            errors: 0,
            validate_every: config.validate_interval(),
            last_validated: now,
        }
    }

    fn transition(&mut self, status: CredentialStatus, step: Step) -> Transition {
        let changed = self.status != status;
        self.status = status;
        Transition {
            status: changed.then_some(status),
            step,
        }
    }

    fn stay(&self, step: Step) -> Transition {
        Transition { status: None, step }
    }

    /// Applies one paint outcome.
    pub fn on_paint(&mut self, outcome: PaintOutcome, now: Instant, config: &EngineConfig) -> Transition {
        let cooldown = config.cooldown();
        match outcome {
            PaintOutcome::Success => {
                self.busies = 0;
                self.errors = 0;
                self.last_validated = now;
                self.validate_every = config.validate_interval();
                self.transition(CredentialStatus::Working, Step::Wait(cooldown))
            }
            PaintOutcome::NetworkError => {
                self.errors += 1;
                self.stay(Step::Wait(config.network_retry()))
            }
            PaintOutcome::ServerError | PaintOutcome::RateLimited => {
                self.errors += 1;
                let factor = self.errors.min(config.max_error_escalation.max(1));
                self.stay(Step::Wait(cooldown.saturating_mul(factor)))
            }
            PaintOutcome::BadRequest | PaintOutcome::NotStarted => self.stay(Step::Wait(cooldown)),
            PaintOutcome::Cooldowning => {
                self.busies += 1;
                if config.busy_give_up > 0 && self.busies >= config.busy_give_up {
                    return self.transition(CredentialStatus::Invalid, Step::Exit);
                }
                let wait = busy_backoff(self.busies, config);
                if self.busies >= config.busy_threshold {
                    self.transition(CredentialStatus::Busy, Step::Wait(wait))
                } else {
                    self.stay(Step::Wait(wait))
                }
            }
            PaintOutcome::InvalidToken => self.transition(CredentialStatus::Invalid, Step::Exit),
        }
    }

    /// Whether an idle loop should check its credential now.
    pub fn validation_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_validated) >= self.validate_every
    }

    /// Applies a validation result. `Err` backs the next check off.
    pub fn on_validation(
        &mut self,
        result: &anyhow::Result<Validation>,
        now: Instant,
        config: &EngineConfig,
    ) -> Transition {
        self.last_validated = now;
        match result {
            Ok(Validation::Valid) => {
                self.validate_every = config.validate_interval();
                self.busies = 0;
                self.transition(CredentialStatus::Working, Step::Wait(Duration::ZERO))
            }
            Ok(Validation::Invalid { .. }) => {
                self.transition(CredentialStatus::Invalid, Step::Exit)
            }
            Err(_) => {
                self.validate_every = self
                    .validate_every
                    .saturating_mul(2)
                    .min(config.validate_backoff_cap());
                self.stay(Step::Wait(Duration::ZERO))
            }
        }
    }
}

/// `min(base * 2^(busies-1), cap)`.
pub fn busy_backoff(busies: u32, config: &EngineConfig) -> Duration {
    let factor = 1u32
        .checked_shl(busies.saturating_sub(1))
        .unwrap_or(u32::MAX);
    config
        .busy_backoff_base()
        .saturating_mul(factor)
        .min(config.busy_backoff_cap())
}

fn jitter(upper: Duration) -> Duration {
    if upper.is_zero() {
        return upper;
    }
    rand::rng().random_range(Duration::ZERO..upper)
}

/// Clears the loop's registration however the loop ends.
struct ExitNotice {
    scheduler: Arc<Scheduler>,
    handle: Arc<LoopHandle>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        self.scheduler
            .credential_destroyed(self.handle.token(), self.handle.status());
    }
}

/// One write credential taking cells from the scheduler and painting them.
pub struct CredentialLoop {
    scheduler: Arc<Scheduler>,
    handle: Arc<LoopHandle>,
    config: EngineConfig,
    state: LoopState,
}

impl CredentialLoop {
    /// Loop for the credential behind `handle`.
    pub fn new(scheduler: Arc<Scheduler>, handle: Arc<LoopHandle>) -> Self {
        let config = scheduler.config().clone();
        let state = LoopState::new(handle.status(), Instant::now(), &config);
        Self {
            scheduler,
            handle,
            config,
            state,
        }
    }

    /// Runs the loop until it is killed or gives up.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let _notice = ExitNotice {
            scheduler: Arc::clone(&self.scheduler),
            handle: Arc::clone(&self.handle),
        };
        // Spread the first requests of many loops started together.
        self.pause(jitter(self.config.cooldown())).await;

        while !self.handle.is_killed() {
            match self.iterate().await {
                Step::Wait(wait) => self.pause(wait).await,
                Step::Exit => break,
            }
        }
    }

    async fn pause(&self, wait: Duration) {
        if wait.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.handle.wait_killed() => {}
        }
    }

    async fn iterate(&mut self) -> Step {
        let token = token_tail(self.handle.token());
        let board = Arc::clone(self.scheduler.board());
        if let Err(err) = board.initialize().await {
            debug!(token, error = %err, "board unavailable");
            return Step::Wait(self.config.board_retry());
        }

        let throttle = Arc::clone(self.scheduler.throttle());
        let Ok(slot) = throttle.acquire().await else {
            return Step::Exit;
        };

        let Some(assignment) = self.scheduler.select_target(self.handle.receiver()) else {
            throttle.release_early(slot);
            self.pause(jitter(self.config.cooldown())).await;
            if self.handle.is_killed() {
                return Step::Exit;
            }
            return self.validate_if_due().await;
        };

        let Assignment {
            target,
            task_id,
            reservation,
        } = assignment;
        debug!(token, receiver = %self.handle.receiver(), task = %task_id, pos = %target.pos, color = target.color, "painting");
        let outcome = self
            .scheduler
            .api()
            .paint(self.handle.token(), target, slot.route())
            .await;
        reservation.release_after(self.config.reservation_release());
        debug!(token, outcome = ?outcome, "paint finished");

        let transition = self.state.on_paint(outcome, Instant::now(), &self.config);
        self.apply(transition)
    }

    async fn validate_if_due(&mut self) -> Step {
        if !self.state.validation_due(Instant::now()) {
            return Step::Wait(Duration::ZERO);
        }
        let throttle = Arc::clone(self.scheduler.throttle());
        let Ok(slot) = throttle.acquire().await else {
            return Step::Exit;
        };
        let result = self
            .scheduler
            .api()
            .validate(self.handle.token(), slot.route())
            .await;
        match &result {
            Ok(Validation::Invalid { reason }) => {
                info!(token = token_tail(self.handle.token()), reason = %reason, "credential rejected")
            }
            Err(err) => warn!(token = token_tail(self.handle.token()), error = %err, "validation failed"),
            Ok(Validation::Valid) => {}
        }
        let transition = self.state.on_validation(&result, Instant::now(), &self.config);
        self.apply(transition)
    }

    fn apply(&self, transition: Transition) -> Step {
        if let Some(status) = transition.status {
            self.publish(status);
        }
        transition.step
    }

    fn publish(&self, status: CredentialStatus) {
        self.handle.set_status(status);
        info!(
            token = token_tail(self.handle.token()),
            receiver = %self.handle.receiver(),
            status = status.as_str(),
            "credential status changed"
        );
        let directory = Arc::clone(self.scheduler.credentials_dir());
        let token = self.handle.token().to_string();
        tokio::spawn(async move {
            if let Err(err) = directory.set_status(&token, status).await {
                warn!(token = token_tail(&token), error = %err, "status write-back failed");
            }
        });
    }
}
