use crate::pm::build_info;
use crate::pm::config::TriggerAction;
use crate::pm::liveness::{read_proc_stat, RecordState};
use crate::pm::schedule::{self, parse_cron, upcoming, EntryMatcher, Installer, SchedulerTable};
use crate::pm::service::Service;
use chrono::Local;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
pub struct ProcessMetrics {
    /// Average over the process lifetime.
    pub cpu_percent: Option<f64>,
    pub rss_bytes: Option<u64>,
    pub mem_percent: Option<f64>,
    pub uptime_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    Running { pid: i32, metrics: ProcessMetrics },
    NotRunning,
    Stale { pid: i32, reason: String },
    UnparsableRecord { content: String },
    /// The PID record could not be read at all.
    Unknown { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct UpcomingTrigger {
    pub action: Option<TriggerAction>,
    pub cron: String,
    pub at: Vec<String>,
}

/// Entries found in the host table for this service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScheduleView {
    Installed { table: String, upcoming: Vec<UpcomingTrigger> },
    NotInstalled { table: String },
    Unavailable { table: String, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub service: String,
    pub process: ProcessState,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub log_tail: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_tail_error: Option<String>,
    pub schedule: ScheduleView,
    pub build: String,
}

fn clock_ticks_per_second() -> Option<f64> {
    let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if v <= 0 {
        None
    } else {
        Some(v as f64)
    }
}

fn read_system_uptime_seconds() -> Option<f64> {
    let s = fs::read_to_string("/proc/uptime").ok()?;
    s.split_whitespace().next()?.parse::<f64>().ok()
}

/// `kB` value of a `Key:   123 kB` line, in bytes.
fn kb_field(text: &str, key: &str) -> Option<u64> {
    let line = text.lines().find(|l| l.starts_with(key))?;
    let kb: u64 = line[key.len()..].trim_start_matches(':').split_whitespace().next()?.parse().ok()?;
    Some(kb * 1024)
}

fn read_metrics(pid: i32) -> ProcessMetrics {
    let stat = read_proc_stat(pid);
    let hz = clock_ticks_per_second();
    let uptime_s = match (stat, hz, read_system_uptime_seconds()) {
        (Some(st), Some(hz), Some(sys)) => Some((sys - st.start_ticks as f64 / hz).max(0.0)),
        _ => None,
    };
    let cpu_percent = match (stat, hz, uptime_s) {
        (Some(st), Some(hz), Some(up)) if up > 0.0 => {
            Some(((st.utime_ticks + st.stime_ticks) as f64 / hz) / up * 100.0)
        }
        _ => None,
    };
    let rss_bytes = fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|s| kb_field(&s, "VmRSS"));
    let total = fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| kb_field(&s, "MemTotal"));
    let mem_percent = match (rss_bytes, total) {
        (Some(rss), Some(total)) if total > 0 => Some(rss as f64 / total as f64 * 100.0),
        _ => None,
    };
    ProcessMetrics {
        cpu_percent,
        rss_bytes,
        mem_percent,
        uptime_ms: uptime_s.map(|s| (s * 1000.0) as u64),
    }
}

fn process_state(svc: &Service) -> ProcessState {
    match svc.probe() {
        Ok(RecordState::Absent) => ProcessState::NotRunning,
        Ok(RecordState::Unparsable { content }) => ProcessState::UnparsableRecord { content },
        Ok(RecordState::Stale { record, reason }) => ProcessState::Stale {
            pid: record.pid,
            reason,
        },
        Ok(RecordState::Live(h)) => ProcessState::Running {
            pid: h.pid(),
            metrics: read_metrics(h.pid()),
        },
        Err(e) => ProcessState::Unknown {
            error: format!("{e:#}"),
        },
    }
}

fn schedule_view(svc: &Service, table: &dyn SchedulerTable) -> ScheduleView {
    let cfg = &svc.cfg;
    let name = table.describe();
    let installer = Installer::new(table, EntryMatcher::for_service(cfg), &cfg.schedule.backup_dir);
    let entries = match installer.installed_entries() {
        Ok(e) => e,
        Err(e) => {
            return ScheduleView::Unavailable {
                table: name,
                error: e.to_string(),
            }
        }
    };
    if entries.is_empty() {
        return ScheduleView::NotInstalled { table: name };
    }
    let now = Local::now();
    let triggers = entries
        .into_iter()
        .map(|e| UpcomingTrigger {
            at: parse_cron(&e.cron)
                .map(|s| upcoming(&s, &now, cfg.status_upcoming))
                .unwrap_or_default()
                .into_iter()
                .map(|dt| dt.to_rfc3339())
                .collect(),
            action: e.action,
            cron: e.cron,
        })
        .collect();
    ScheduleView::Installed {
        table: name,
        upcoming: triggers,
    }
}

/// Snapshot of the service against its configured schedule table.
pub fn collect(svc: &Service) -> StatusReport {
    let table = schedule::table_for(&svc.cfg);
    collect_from(svc, &*table)
}

/// Snapshot of the service. Reads only; never clears records or writes logs.
/// Sections that cannot be read are reported as unavailable.
pub fn collect_from(svc: &Service, table: &dyn SchedulerTable) -> StatusReport {
    let cfg = &svc.cfg;
    let (log_tail, log_tail_error) = match svc.sink.tail(cfg.status_log_lines) {
        Ok(lines) => (lines, None),
        Err(e) => (vec![], Some(format!("{e:#}"))),
    };
    StatusReport {
        service: cfg.name.clone(),
        process: process_state(svc),
        pid_file: cfg.pid_file.clone(),
        log_file: svc.sink.today(),
        log_tail,
        log_tail_error,
        schedule: schedule_view(svc, table),
        build: build_info::banner(),
    }
}

pub fn state_line(state: &ProcessState) -> String {
    match state {
        ProcessState::Running { pid, .. } => format!("running, PID {pid}"),
        ProcessState::NotRunning => "not running".to_string(),
        ProcessState::Stale { pid, .. } => format!("not running (stale record for PID {pid})"),
        ProcessState::UnparsableRecord { content } => format!("not running (unparsable PID record {content:?})"),
        ProcessState::Unknown { error } => format!("unknown ({error})"),
    }
}

fn human_bytes(b: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    if b as f64 >= 1024.0 * MIB {
        format!("{:.1} GiB", b as f64 / (1024.0 * MIB))
    } else {
        format!("{:.1} MiB", b as f64 / MIB)
    }
}

fn human_uptime(ms: u64) -> String {
    let s = ms / 1000;
    let (d, h, m) = (s / 86_400, (s % 86_400) / 3600, (s % 3600) / 60);
    if d > 0 {
        format!("{d}d{h:02}h{m:02}m")
    } else if h > 0 {
        format!("{h}h{m:02}m")
    } else {
        format!("{m}m{:02}s", s % 60)
    }
}

pub fn render_text(r: &StatusReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "service:  {}", r.service);
    let _ = writeln!(out, "state:    {}", state_line(&r.process));
    if let ProcessState::Running { metrics: m, .. } = &r.process {
        let mut parts = vec![];
        if let Some(c) = m.cpu_percent {
            parts.push(format!("cpu {c:.1}%"));
        }
        if let Some(b) = m.rss_bytes {
            parts.push(format!("rss {}", human_bytes(b)));
        }
        if let Some(p) = m.mem_percent {
            parts.push(format!("mem {p:.1}%"));
        }
        if let Some(u) = m.uptime_ms {
            parts.push(format!("up {}", human_uptime(u)));
        }
        if !parts.is_empty() {
            let _ = writeln!(out, "          {}", parts.join(", "));
        }
    }
    let _ = writeln!(out, "pid file: {}", r.pid_file.display());
    let _ = writeln!(out, "log file: {}", r.log_file.display());
    match &r.schedule {
        ScheduleView::Installed { table, upcoming } => {
            let _ = writeln!(out, "schedule: {table}");
            for u in upcoming {
                let action = u.action.map(TriggerAction::as_str).unwrap_or("?");
                let when = u.at.first().map(String::as_str).unwrap_or("-");
                let _ = writeln!(out, "  {action:<8} {:<16} next {when}", u.cron);
            }
        }
        ScheduleView::NotInstalled { table } => {
            let _ = writeln!(out, "schedule: not installed in {table}");
        }
        ScheduleView::Unavailable { table, error } => {
            let _ = writeln!(out, "schedule: {table} unavailable ({error})");
        }
    }
    match &r.log_tail_error {
        Some(e) => {
            let _ = writeln!(out, "recent log: unavailable ({e})");
        }
        None => {
            let _ = writeln!(out, "recent log ({} lines):", r.log_tail.len());
            for l in &r.log_tail {
                let _ = writeln!(out, "  {l}");
            }
        }
    }
    out
}
