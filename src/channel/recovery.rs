use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::state::ChannelState;
use crate::error::ConfigError;
use crate::sync::ShutdownSignal;
use crate::telemetry::BusMetric;

const SOURCE: &str = "channel::recovery";

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MULTIPLIER: f64 = 3.0;
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);
const DEFAULT_MAX_RECOVERY_TIME: Duration = Duration::from_secs(60);
const DEFAULT_JITTER: f64 = 0.2;

/// Which side of the channel is recovering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryRole {
    Producer,
    Consumer,
}

impl RecoveryRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::Consumer => "consumer",
        }
    }
}

/// Backoff schedule of channel recovery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecoverySettings {
    pub initial_backoff: Duration,
    /// Growth factor applied to each successive wait.
    pub multiplier: f64,
    pub max_backoff: Duration,
    /// Total time after which recovery gives up.
    pub max_recovery_time: Duration,
    /// Upper bound of the random extra wait, as a fraction of the wait.
    pub jitter: f64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            multiplier: DEFAULT_MULTIPLIER,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_recovery_time: DEFAULT_MAX_RECOVERY_TIME,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RecoverySettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let reason = if self.initial_backoff.is_zero() {
            Some("initial backoff must be positive")
        } else if self.max_backoff < self.initial_backoff {
            Some("max backoff must not be below the initial backoff")
        } else if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            Some("multiplier must be a finite number of at least 1")
        } else if !(0.0..=1.0).contains(&self.jitter) {
            Some("jitter must lie between 0 and 1")
        } else if self.max_recovery_time.is_zero() {
            Some("max recovery time must be positive")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ConfigError::InvalidRecovery { reason }),
            None => Ok(()),
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        scale(current, self.multiplier).min(self.max_backoff)
    }
}

/// `wait * factor`, saturating at [`Duration::MAX`].
fn scale(wait: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(wait.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("channel not recoverable after {attempts} attempts in {elapsed:?}: {last_error}")]
    NotRecoverable {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },
    #[error("channel recovery cancelled by shutdown")]
    Cancelled,
}

/// Reconnect-with-backoff loop shared by producers and consumers.
pub struct RecoveryProcessor {
    settings: RecoverySettings,
    state: Arc<ChannelState>,
    shutdown: Arc<ShutdownSignal>,
}

impl RecoveryProcessor {
    pub fn new(settings: RecoverySettings, state: Arc<ChannelState>, shutdown: Arc<ShutdownSignal>) -> Self {
        Self {
            settings,
            state,
            shutdown,
        }
    }

    pub fn settings(&self) -> &RecoverySettings {
        &self.settings
    }

    /// Run `cleanup` once, then retry `recover` until it succeeds or
    /// `max_recovery_time` has passed.
    ///
    /// Cleanup failures are logged and ignored. A final attempt is made at
    /// the deadline before giving up with [`RecoveryError::NotRecoverable`].
    /// Firing the shutdown signal ends the loop with
    /// [`RecoveryError::Cancelled`].
    pub fn recover<C, R, E>(&self, role: RecoveryRole, cleanup: C, recover: R) -> Result<(), RecoveryError>
    where
        C: FnOnce() -> Result<(), E>,
        R: FnMut() -> Result<(), E>,
        E: Display,
    {
        self.state.enter_recovery(role, self.settings.max_recovery_time);
        let result = self.run(role, cleanup, recover);
        self.state.leave_recovery(role);

        match &result {
            Ok(()) => {}
            Err(RecoveryError::NotRecoverable { attempts, elapsed, last_error }) => {
                self.state.mark_unrecoverable(role);
                counter!(BusMetric::RecoveryFailures.id(), "role" => role.as_str()).increment(1);
                error!(
                    target_module = SOURCE,
                    role = role.as_str(),
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    last_error = %last_error,
                    "Channel recovery gave up"
                );
            }
            Err(RecoveryError::Cancelled) => {
                self.state.record_interrupted();
                debug!(target_module = SOURCE, role = role.as_str(), "Channel recovery cancelled");
            }
        }
        result
    }

    fn run<C, R, E>(&self, role: RecoveryRole, cleanup: C, mut recover: R) -> Result<(), RecoveryError>
    where
        C: FnOnce() -> Result<(), E>,
        R: FnMut() -> Result<(), E>,
        E: Display,
    {
        if let Err(err) = cleanup() {
            warn!(
                target_module = SOURCE,
                role = role.as_str(),
                error = %err,
                "Channel cleanup before recovery failed"
            );
        }

        let started = Instant::now();
        // `None` when the recovery window is too long to represent.
        let deadline = started.checked_add(self.settings.max_recovery_time);
        let mut backoff = self.settings.initial_backoff;
        let mut attempts: u32 = 0;

        loop {
            if self.shutdown.is_triggered() {
                return Err(RecoveryError::Cancelled);
            }

            attempts += 1;
            counter!(BusMetric::RecoveryAttempts.id(), "role" => role.as_str()).increment(1);
            let last_error = match recover() {
                Ok(()) => {
                    info!(
                        target_module = SOURCE,
                        role = role.as_str(),
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Channel recovered"
                    );
                    return Ok(());
                }
                Err(err) => err.to_string(),
            };

            let now = Instant::now();
            let mut wait = self.jittered(backoff);
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Err(RecoveryError::NotRecoverable {
                        attempts,
                        elapsed: now - started,
                        last_error,
                    });
                }
                wait = wait.min(deadline - now);
            }
            debug!(
                target_module = SOURCE,
                role = role.as_str(),
                attempts,
                wait_ms = wait.as_millis() as u64,
                error = %last_error,
                "Channel recovery attempt failed, backing off"
            );
            if self.shutdown.wait_timeout(wait) {
                return Err(RecoveryError::Cancelled);
            }
            backoff = self.settings.next_backoff(backoff);
        }
    }

    fn jittered(&self, wait: Duration) -> Duration {
        if self.settings.jitter <= 0.0 {
            return wait;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.settings.jitter);
        scale(wait, 1.0 + extra)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn processor(settings: RecoverySettings) -> (RecoveryProcessor, Arc<ChannelState>, Arc<ShutdownSignal>) {
        let state = Arc::new(ChannelState::new());
        let shutdown = Arc::new(ShutdownSignal::new());
        let processor = RecoveryProcessor::new(settings, Arc::clone(&state), Arc::clone(&shutdown));
        (processor, state, shutdown)
    }

    fn fast_settings() -> RecoverySettings {
        RecoverySettings {
            initial_backoff: Duration::from_millis(5),
            multiplier: 3.0,
            max_backoff: Duration::from_millis(20),
            max_recovery_time: Duration::from_millis(120),
            jitter: 0.2,
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let (processor, state, _) = processor(fast_settings());
        let calls = Cell::new(0);

        let result = processor.recover(
            RecoveryRole::Producer,
            || Ok::<(), String>(()),
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 { Err("down".to_owned()) } else { Ok(()) }
            },
        );

        assert!(result.is_ok());
        assert_eq!(calls.get(), 3);
        assert_eq!(state.unrecoverable(RecoveryRole::Producer), 0);
        assert_eq!(state.in_recovery(RecoveryRole::Producer), 0);
    }

    #[test]
    fn gives_up_at_deadline_after_final_attempt() {
        let settings = fast_settings();
        let (processor, state, _) = processor(settings);
        let calls = Cell::new(0_u32);
        let started = Instant::now();

        let result = processor.recover(
            RecoveryRole::Consumer,
            || Err::<(), _>("cleanup failed"),
            || {
                calls.set(calls.get() + 1);
                Err("still down")
            },
        );
        let elapsed = started.elapsed();

        match result {
            Err(RecoveryError::NotRecoverable { attempts, .. }) => assert_eq!(attempts, calls.get()),
            other => panic!("expected NotRecoverable, got {other:?}"),
        }
        assert!(elapsed >= settings.max_recovery_time);
        assert!(elapsed < settings.max_recovery_time + Duration::from_millis(500));
        assert!(calls.get() >= 4);
        assert_eq!(state.unrecoverable(RecoveryRole::Consumer), 1);
    }

    #[test]
    fn shutdown_cancels_the_wait() {
        let settings = RecoverySettings {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5),
            max_recovery_time: Duration::from_secs(30),
            ..RecoverySettings::default()
        };
        let (processor, state, shutdown) = processor(settings);
        let trigger = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                shutdown.trigger();
            })
        };

        let started = Instant::now();
        let result = processor.recover(RecoveryRole::Producer, || Ok::<(), &str>(()), || Err("down"));
        trigger.join().expect("trigger thread");

        assert!(matches!(result, Err(RecoveryError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(state.snapshot().interrupted_workers, 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let settings = RecoverySettings {
            initial_backoff: Duration::from_millis(100),
            multiplier: 3.0,
            max_backoff: Duration::from_millis(500),
            ..RecoverySettings::default()
        };
        let second = settings.next_backoff(settings.initial_backoff);
        assert_eq!(second, Duration::from_millis(300));
        assert_eq!(settings.next_backoff(second), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let (processor, _, _) = processor(fast_settings());
        for _ in 0..100 {
            let wait = processor.jittered(Duration::from_millis(100));
            assert!(wait >= Duration::from_millis(100));
            assert!(wait <= Duration::from_millis(120));
        }
    }

    #[test]
    fn unbounded_recovery_window_does_not_overflow() {
        let settings = RecoverySettings {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_secs(u64::MAX),
            max_recovery_time: Duration::from_secs(u64::MAX),
            ..RecoverySettings::default()
        };
        assert!(settings.validate().is_ok());
        let (processor, state, shutdown) = processor(settings);
        let calls = Cell::new(0);

        let result = processor.recover(
            RecoveryRole::Producer,
            || Ok::<(), &str>(()),
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 2 { Err("down") } else { Ok(()) }
            },
        );
        assert!(result.is_ok());
        assert_eq!(state.unrecoverable(RecoveryRole::Producer), 0);

        shutdown.trigger();
        let result = processor.recover(RecoveryRole::Producer, || Ok::<(), &str>(()), || Err("down"));
        assert!(matches!(result, Err(RecoveryError::Cancelled)));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let settings = RecoverySettings {
            multiplier: 10.0,
            max_backoff: Duration::MAX,
            ..RecoverySettings::default()
        };
        assert_eq!(settings.next_backoff(Duration::MAX / 2), Duration::MAX);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let settings = RecoverySettings {
            multiplier: 0.5,
            ..RecoverySettings::default()
        };
        assert!(settings.validate().is_err());
        assert!(RecoverySettings::default().validate().is_ok());
    }
}
