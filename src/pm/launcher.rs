use crate::pm::error::SupervisorError;
use crate::pm::liveness::{self, RecordState};
use crate::pm::pidstore::PidRecord;
use crate::pm::service::Service;
use crate::pm::shutdown::{self, StopOutcome, StopPlan};
use chrono::Local;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const COMPONENT: &str = "launcher";

#[derive(Debug, Clone)]
pub struct Launched {
    pub pid: i32,
    pub log_path: PathBuf,
    /// Stale record that was cleared before launching, if any.
    pub healed: Option<PidRecord>,
}

/// Programs given as relative paths with a directory part are looked up under
/// `project_root`; bare names go through `PATH`.
fn resolve_program(project_root: &Path, program: &str) -> PathBuf {
    let p = Path::new(program);
    if p.is_relative() && program.contains('/') {
        project_root.join(p)
    } else {
        p.to_path_buf()
    }
}

fn build_command(svc: &Service, log: &std::fs::File) -> Result<Command, SupervisorError> {
    let cfg = &svc.cfg;
    let program = resolve_program(&cfg.project_root, &cfg.start_command[0]);
    let mut cmd = Command::new(program);
    cmd.args(&cfg.start_command[1..]);
    cmd.current_dir(&cfg.project_root);
    for v in &cfg.environment {
        cmd.env(&v.name, &v.value);
    }

    let out = log
        .try_clone()
        .map_err(|e| SupervisorError::launch(&cfg.name, "duplicate log handle for stdout", Some(e)))?;
    let err = log
        .try_clone()
        .map_err(|e| SupervisorError::launch(&cfg.name, "duplicate log handle for stderr", Some(e)))?;
    cmd.stdin(Stdio::null()).stdout(Stdio::from(out)).stderr(Stdio::from(err));

    // New session: no controlling terminal, own process group for group-wide signals.
    unsafe {
        cmd.pre_exec(|| {
            let _ = setsid();
            Ok(())
        });
    }
    Ok(cmd)
}

/// Launch the worker unless a live one is already recorded.
pub fn start(svc: &Service) -> Result<Launched, SupervisorError> {
    let cfg = &svc.cfg;

    let healed = match svc.probe()? {
        RecordState::Live(h) => {
            svc.sink
                .info(COMPONENT, format!("attempt=start outcome=already_running pid={}", h.pid()));
            return Err(SupervisorError::AlreadyRunning {
                service: cfg.name.clone(),
                pid: h.pid(),
            });
        }
        RecordState::Stale { record, reason } => {
            svc.heal_stale(COMPONENT, &record, &reason)?;
            Some(record)
        }
        RecordState::Unparsable { content } => {
            svc.heal_unparsable(COMPONENT, &content)?;
            None
        }
        RecordState::Absent => None,
    };

    if !cfg.project_root.is_dir() {
        return Err(SupervisorError::launch(
            &cfg.name,
            format!("project_root {} is not a directory", cfg.project_root.display()),
            None,
        ));
    }

    let (log_path, log) = svc.sink.open_append().map_err(|e| {
        SupervisorError::launch(&cfg.name, format!("open log sink: {e:#}"), None)
    })?;

    match svc.sink.sweep(cfg.log_retention_days, Local::now().date_naive()) {
        Ok(removed) if !removed.is_empty() => svc.sink.info(
            COMPONENT,
            format!("retention_sweep removed={} keep_days={}", removed.len(), cfg.log_retention_days),
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!("retention sweep failed: {e:#}"),
    }

    let mut cmd = build_command(svc, &log)?;
    let child = cmd.spawn().map_err(|e| {
        let reason = format!(
            "spawn argv={:?} cwd={} kind={:?} os_error={:?}",
            cfg.start_command,
            cfg.project_root.display(),
            e.kind(),
            e.raw_os_error()
        );
        SupervisorError::launch(&cfg.name, reason, Some(e))
    })?;
    let pid = child.id() as i32;
    // The worker outlives this process; its Child handle is never waited on.
    drop(child);

    let record = PidRecord {
        pid,
        start_ticks: liveness::start_ticks(pid),
        started_at: Some(Local::now().to_rfc3339()),
    };
    if let Err(e) = svc.store.write(&record) {
        // An untracked worker could never be stopped by us; take it down again.
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        let _ = nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
        return Err(SupervisorError::launch(
            &cfg.name,
            format!("persist pid record {}: {e:#}", svc.store.path().display()),
            None,
        ));
    }

    svc.sink.info(COMPONENT, format!("started with PID={pid}"));
    Ok(Launched { pid, log_path, healed })
}

/// Stop whatever is running (any outcome), then start.
pub fn restart(svc: &Service, plan: &StopPlan) -> Result<(Launched, StopOutcome), SupervisorError> {
    let stopped = shutdown::stop(svc, plan)?;
    let launched = start(svc)?;
    Ok((launched, stopped))
}
