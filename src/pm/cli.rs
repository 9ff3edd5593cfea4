use crate::pm::config::{self, parse_duration, Trigger, TriggerAction};
use crate::pm::error::SupervisorError;
use crate::pm::launcher;
use crate::pm::liveness::RecordState;
use crate::pm::schedule::{self, EntryMatcher, EntryTemplate, Installer, TableChange, TablePlan};
use crate::pm::service::Service;
use crate::pm::shutdown::{self, StopOutcome, StopPlan};
use crate::pm::{build_info, status, timer};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{BufRead as _, Write as _};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "pidmaster",
    version,
    long_version = build_info::LONG_VERSION,
    about = "Supervise one long-running worker: start, stop, status and scheduling"
)]
pub struct Args {
    /// Path to the service config YAML
    #[arg(short = 'c', long = "config", env = "PIDMASTER_CONFIG", default_value = "pidmaster.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Launch the worker unless it is already running
    Start,
    /// Stop the worker: graceful signal first, SIGKILL after the grace period
    Stop {
        /// Override the configured grace period, e.g. 30s or 1500ms
        #[arg(long = "grace", value_parser = parse_duration)]
        grace: Option<Duration>,
    },
    /// Stop (whatever the outcome) then start
    Restart,
    /// Show process state, recent log lines and upcoming triggers
    Status {
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Write the configured triggers into the host schedule table
    InstallSchedule {
        /// Do not ask for confirmation
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },
    /// Remove this service's entries from the host schedule table
    RemoveSchedule {
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },
    /// Delete log files older than the retention period
    PruneLogs,
    /// Run the configured triggers in the foreground (for hosts without cron)
    ScheduleLoop,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Cmd {
    fn label(&self) -> &'static str {
        match self {
            Cmd::Start => "start",
            Cmd::Stop { .. } => "stop",
            Cmd::Restart => "restart",
            Cmd::Status { .. } => "status",
            Cmd::InstallSchedule { .. } => "install-schedule",
            Cmd::RemoveSchedule { .. } => "remove-schedule",
            Cmd::PruneLogs => "prune-logs",
            Cmd::ScheduleLoop => "schedule-loop",
        }
    }
}

pub fn run() -> ExitCode {
    let args = Args::parse();
    let cfg = match config::load_service_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(2);
        }
    };
    let svc = Service::new(cfg);
    let label = args.cmd.label();
    match dispatch(&svc, args.cmd) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            if e.is_fatal() {
                svc.sink
                    .error("cli", format!("command={label} outcome=error err={e:#}"));
            }
            eprintln!("{}: {e:#}", svc.name());
            ExitCode::from(e.exit_code())
        }
    }
}

fn dispatch(svc: &Service, cmd: Cmd) -> Result<u8, SupervisorError> {
    let plan = StopPlan::from_config(&svc.cfg);
    match cmd {
        Cmd::Start => {
            let l = launcher::start(svc)?;
            if let Some(stale) = l.healed.as_ref() {
                println!("cleared stale PID record (PID {})", stale.pid);
            }
            println!("{} started with PID={} (log: {})", svc.name(), l.pid, l.log_path.display());
            Ok(0)
        }
        Cmd::Stop { grace } => {
            let outcome = shutdown::stop(svc, &plan.with_grace(grace))?;
            println!("{}", describe_stop(svc.name(), &outcome));
            Ok(stop_exit_code(&outcome))
        }
        Cmd::Restart => {
            let (l, stopped) = launcher::restart(svc, &plan)?;
            println!("{}", describe_stop(svc.name(), &stopped));
            println!("{} started with PID={} (log: {})", svc.name(), l.pid, l.log_path.display());
            Ok(0)
        }
        Cmd::Status { format } => {
            let report = status::collect(svc);
            match format {
                OutputFormat::Text => print!("{}", status::render_text(&report)),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&report).map_err(anyhow::Error::from)?
                ),
            }
            Ok(0)
        }
        Cmd::InstallSchedule { yes } => install_schedule(svc, yes),
        Cmd::RemoveSchedule { yes } => remove_schedule(svc, yes),
        Cmd::PruneLogs => {
            let removed = svc.sink.sweep(svc.cfg.log_retention_days, Local::now().date_naive())?;
            for p in &removed {
                println!("removed {}", p.display());
            }
            svc.sink.info(
                "prune",
                format!("removed={} keep_days={}", removed.len(), svc.cfg.log_retention_days),
            );
            Ok(0)
        }
        Cmd::ScheduleLoop => {
            timer::run_timer_loop(&svc.cfg.schedule.triggers, |t| fire_trigger(svc, &plan, t))?;
            Ok(0)
        }
    }
}

/// Stale records count as handled; finding no usable record at all is exit 1.
fn stop_exit_code(outcome: &StopOutcome) -> u8 {
    match outcome {
        StopOutcome::NotRunning { stale: None } | StopOutcome::DiscardedRecord { .. } => 1,
        StopOutcome::NotRunning { stale: Some(_) } | StopOutcome::Stopped { .. } | StopOutcome::ForcedKill { .. } => 0,
    }
}

fn describe_stop(name: &str, outcome: &StopOutcome) -> String {
    match outcome {
        StopOutcome::Stopped { pid, elapsed } => {
            format!("{name} stopped (PID {pid}, {} ms)", elapsed.as_millis())
        }
        StopOutcome::ForcedKill { pid, elapsed } => format!(
            "{name} did not exit within the grace period; killed (PID {pid}, {} ms)",
            elapsed.as_millis()
        ),
        StopOutcome::NotRunning { stale: Some(r) } => {
            format!("{name} not running (cleared stale record for PID {})", r.pid)
        }
        StopOutcome::NotRunning { stale: None } => format!("{name} not running (no PID record)"),
        StopOutcome::DiscardedRecord { content } => {
            format!("{name} not running (removed unparsable PID record {content:?})")
        }
    }
}

/// Run one timer trigger in-process. Returns the pid of a worker it launched.
fn fire_trigger(svc: &Service, plan: &StopPlan, t: &Trigger) -> Option<i32> {
    let res = match t.action {
        TriggerAction::Start => launcher::start(svc).map(|l| (Some(l.pid), format!("pid={}", l.pid))),
        TriggerAction::Stop => shutdown::stop(svc, plan)
            .map(|o| (None, describe_stop(svc.name(), &o)))
            .map_err(SupervisorError::from),
        TriggerAction::Restart => launcher::restart(svc, plan).map(|(l, _)| (Some(l.pid), format!("pid={}", l.pid))),
    };
    match res {
        Ok((launched, detail)) => {
            svc.sink
                .info("schedule", format!("trigger={} cron={:?} outcome=ok {detail}", t.action, t.cron));
            launched
        }
        Err(e) if !e.is_fatal() => {
            svc.sink
                .info("schedule", format!("trigger={} cron={:?} outcome=skipped reason={e}", t.action, t.cron));
            None
        }
        Err(e) => {
            svc.sink
                .error("schedule", format!("trigger={} cron={:?} outcome=error err={e:#}", t.action, t.cron));
            None
        }
    }
}

fn confirm(plan: &TablePlan, target: &str) -> bool {
    if !plan.removed.is_empty() {
        println!("entries to remove:");
        for l in &plan.removed {
            println!("  - {l}");
        }
    }
    if !plan.added.is_empty() {
        println!("entries to add:");
        for l in &plan.added {
            println!("  + {l}");
        }
    }
    print!("apply to {target}? [y/N] ");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(0) | Err(_) => false,
        Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
    }
}

fn install_schedule(svc: &Service, yes: bool) -> Result<u8, SupervisorError> {
    let cfg = &svc.cfg;
    let table = schedule::table_for(cfg);
    let target = table.describe();
    let entries = EntryTemplate::for_service(cfg)?.render_all(&cfg.schedule.triggers);
    if entries.is_empty() {
        tracing::warn!("no triggers configured; install will only remove existing entries");
    }
    let installer = Installer::new(&*table, EntryMatcher::for_service(cfg), &cfg.schedule.backup_dir);
    match installer.install_triggers(entries, |p| yes || confirm(p, &target))? {
        TableChange::Unchanged => println!("{target}: schedule for {} already up to date", cfg.name),
        TableChange::Applied { backup, removed, added } => {
            let backup = backup.map(|p| p.display().to_string()).unwrap_or_else(|| "-".to_string());
            svc.sink.info(
                "schedule",
                format!("attempt=install table={target} removed={removed} added={added} backup={backup}"),
            );
            println!("{target}: installed {added} entries, replaced {removed} (backup: {backup})");
        }
    }
    Ok(0)
}

fn remove_schedule(svc: &Service, yes: bool) -> Result<u8, SupervisorError> {
    let cfg = &svc.cfg;
    let table = schedule::table_for(cfg);
    let target = table.describe();
    let installer = Installer::new(&*table, EntryMatcher::for_service(cfg), &cfg.schedule.backup_dir);
    match installer.remove_matching(|p| yes || confirm(p, &target))? {
        TableChange::Unchanged => println!("{target}: no entries for {} to remove", cfg.schedule.tag),
        TableChange::Applied { backup, removed, .. } => {
            let backup = backup.map(|p| p.display().to_string()).unwrap_or_else(|| "-".to_string());
            svc.sink
                .info("schedule", format!("attempt=remove table={target} removed={removed} backup={backup}"));
            println!("{target}: removed {removed} entries (backup: {backup})");
        }
    }
    if let Some(note) = still_running_note(svc) {
        println!("{note}");
    }
    Ok(0)
}

/// Removing the schedule leaves a running worker alone; say so.
fn still_running_note(svc: &Service) -> Option<String> {
    let RecordState::Live(h) = svc.probe().ok()? else {
        return None;
    };
    let mut note = format!(
        "note: {} is still running (PID {}); it will no longer be stopped on schedule.",
        svc.name(),
        h.pid()
    );
    if let Some(cfg) = svc.cfg.source_file.as_deref() {
        note.push_str(&format!(" Run `pidmaster -c {} stop` to stop it now.", cfg.display()));
    }
    Some(note)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_commands() {
        let a = Args::try_parse_from(["pidmaster", "-c", "/etc/bot.yaml", "stop", "--grace", "30s"]).unwrap();
        assert_eq!(a.config, PathBuf::from("/etc/bot.yaml"));
        assert!(matches!(a.cmd, Cmd::Stop { grace: Some(g) } if g == Duration::from_secs(30)));

        let a = Args::try_parse_from(["pidmaster", "status", "--format", "json"]).unwrap();
        assert!(matches!(a.cmd, Cmd::Status { format: OutputFormat::Json }));

        let a = Args::try_parse_from(["pidmaster", "install-schedule", "--yes"]).unwrap();
        assert!(matches!(a.cmd, Cmd::InstallSchedule { yes: true }));

        assert!(Args::try_parse_from(["pidmaster", "stop", "--grace", "soon"]).is_err());
    }

    #[test]
    fn stop_descriptions() {
        let s = describe_stop("bot", &StopOutcome::NotRunning { stale: None });
        assert_eq!(s, "bot not running (no PID record)");
        let s = describe_stop(
            "bot",
            &StopOutcome::ForcedKill {
                pid: 9,
                elapsed: Duration::from_millis(1200),
            },
        );
        assert!(s.contains("killed (PID 9, 1200 ms)"));
    }

    #[test]
    fn stop_exit_codes() {
        assert_eq!(stop_exit_code(&StopOutcome::NotRunning { stale: None }), 1);
        assert_eq!(
            stop_exit_code(&StopOutcome::DiscardedRecord {
                content: "garbage".into()
            }),
            1
        );
        assert_eq!(
            stop_exit_code(&StopOutcome::NotRunning {
                stale: Some(crate::pm::pidstore::PidRecord::new(7))
            }),
            0
        );
        assert_eq!(
            stop_exit_code(&StopOutcome::Stopped {
                pid: 7,
                elapsed: Duration::from_millis(10)
            }),
            0
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn remove_schedule_mentions_a_live_worker() {
        let dir = tempfile::tempdir().unwrap();
        let raw = "service: {name: bot, start_command: [sleep, '30']}\n";
        let svc = Service::new(config::parse_service_config(raw, dir.path()).unwrap());
        assert_eq!(still_running_note(&svc), None);

        let me = std::process::id() as i32;
        svc.store.write(&crate::pm::pidstore::PidRecord::new(me)).unwrap();
        let note = still_running_note(&svc).unwrap();
        assert!(note.contains(&format!("still running (PID {me})")), "{note}");
    }
}
