use crate::pm::config::ServiceConfig;
use crate::pm::liveness::{ProcessHandle, RecordState};
use crate::pm::pidstore::PidRecord;
use crate::pm::service::Service;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::time::{Duration, Instant};

const COMPONENT: &str = "stop";
const KILL_SETTLE: Duration = Duration::from_millis(3000);
const KILL_SETTLE_STEP: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy)]
pub struct StopPlan {
    pub signal: Signal,
    pub grace_period: Duration,
    pub poll_interval: Duration,
}

impl StopPlan {
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self {
            signal: cfg.stop_signal,
            grace_period: cfg.grace_period,
            poll_interval: cfg.poll_interval,
        }
    }

    pub fn with_grace(mut self, grace: Option<Duration>) -> Self {
        if let Some(g) = grace {
            self.grace_period = g;
        }
        self
    }
}

#[derive(Debug, Clone)]
pub enum StopOutcome {
    /// Exited on its own within the grace period.
    Stopped { pid: i32, elapsed: Duration },
    /// Survived the grace period and was SIGKILLed.
    ForcedKill { pid: i32, elapsed: Duration },
    /// Nothing to stop. `stale` holds a record that was found and cleared.
    NotRunning { stale: Option<PidRecord> },
    /// Nothing to stop; the record file held no pid and was removed.
    DiscardedRecord { content: String },
}

enum Phase {
    CheckRecord,
    CleanupStaleRecord { record: PidRecord, reason: String },
    CleanupUnparsable(String),
    SignalGraceful(ProcessHandle),
    PollLoop {
        handle: ProcessHandle,
        signalled_at: Instant,
        deadline: Instant,
    },
    Forced {
        handle: ProcessHandle,
        signalled_at: Instant,
    },
    Done(StopOutcome),
}

/// Send `sig`; a process that is already gone is not an error.
fn deliver(handle: &ProcessHandle, sig: Signal) -> anyhow::Result<bool> {
    match handle.signal(sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(anyhow::anyhow!("send {sig} to pid {}: {e}", handle.pid())),
    }
}

fn wait_until_gone(handle: &ProcessHandle, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !handle.is_alive() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(KILL_SETTLE_STEP);
    }
}

/// Graceful stop with escalation to SIGKILL once `plan.grace_period` has passed.
///
/// The PID record is removed on every path that ends with no worker running.
pub fn stop(svc: &Service, plan: &StopPlan) -> anyhow::Result<StopOutcome> {
    let sink = &svc.sink;
    let mut phase = Phase::CheckRecord;
    loop {
        phase = match phase {
            Phase::CheckRecord => match svc.probe()? {
                RecordState::Absent => {
                    sink.info(COMPONENT, "attempt=stop outcome=not_running record=absent");
                    Phase::Done(StopOutcome::NotRunning { stale: None })
                }
                RecordState::Unparsable { content } => Phase::CleanupUnparsable(content),
                RecordState::Stale { record, reason } => Phase::CleanupStaleRecord { record, reason },
                RecordState::Live(handle) => Phase::SignalGraceful(handle),
            },

            Phase::CleanupUnparsable(content) => {
                svc.heal_unparsable(COMPONENT, &content)?;
                sink.info(COMPONENT, "attempt=stop outcome=not_running record=unparsable");
                Phase::Done(StopOutcome::DiscardedRecord { content })
            }

            Phase::CleanupStaleRecord { record, reason } => {
                svc.heal_stale(COMPONENT, &record, &reason)?;
                sink.info(
                    COMPONENT,
                    format!("attempt=stop outcome=not_running record=stale pid={}", record.pid),
                );
                Phase::Done(StopOutcome::NotRunning { stale: Some(record) })
            }

            Phase::SignalGraceful(handle) => {
                sink.info(
                    COMPONENT,
                    format!(
                        "attempt=signal pid={} sig={} grace_ms={}",
                        handle.pid(),
                        plan.signal,
                        plan.grace_period.as_millis()
                    ),
                );
                let signalled_at = Instant::now();
                if !deliver(&handle, plan.signal)? {
                    tracing::debug!(pid = handle.pid(), "worker exited before the graceful signal");
                }
                Phase::PollLoop {
                    handle,
                    signalled_at,
                    deadline: signalled_at + plan.grace_period,
                }
            }

            Phase::PollLoop {
                handle,
                signalled_at,
                deadline,
            } => {
                let now = Instant::now();
                if !handle.is_alive() {
                    svc.store.clear()?;
                    let elapsed = signalled_at.elapsed();
                    sink.info(
                        COMPONENT,
                        format!("outcome=grace_exit pid={} elapsed_ms={}", handle.pid(), elapsed.as_millis()),
                    );
                    Phase::Done(StopOutcome::Stopped {
                        pid: handle.pid(),
                        elapsed,
                    })
                } else if now >= deadline {
                    Phase::Forced { handle, signalled_at }
                } else {
                    std::thread::sleep(plan.poll_interval.min(deadline - now));
                    Phase::PollLoop {
                        handle,
                        signalled_at,
                        deadline,
                    }
                }
            }

            Phase::Forced { handle, signalled_at } => {
                let pid = handle.pid();
                sink.warn(
                    COMPONENT,
                    format!(
                        "outcome=grace_expired pid={pid} elapsed_ms={} decision=kill",
                        signalled_at.elapsed().as_millis()
                    ),
                );
                deliver(&handle, Signal::SIGKILL)?;
                if !wait_until_gone(&handle, KILL_SETTLE) {
                    sink.error(COMPONENT, format!("outcome=kill_failed pid={pid}"));
                    anyhow::bail!("{}: pid {pid} still running after SIGKILL", svc.name());
                }
                svc.store.clear()?;
                let elapsed = signalled_at.elapsed();
                sink.warn(
                    COMPONENT,
                    format!("outcome=forced_kill pid={pid} elapsed_ms={}", elapsed.as_millis()),
                );
                Phase::Done(StopOutcome::ForcedKill { pid, elapsed })
            }

            Phase::Done(outcome) => return Ok(outcome),
        };
    }
}
