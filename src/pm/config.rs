use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Service name; used in log file names, the schedule tag and log lines.
    pub name: String,
    /// Working directory of the worker.
    pub project_root: PathBuf,
    /// Command argv list.
    pub start_command: Vec<String>,
    /// Optional substring the worker's command line must contain for a PID
    /// record to be considered ours.
    pub identity_match: Option<String>,
    pub environment: Vec<EnvironmentVar>,

    pub pid_file: PathBuf,
    pub log_dir: PathBuf,
    pub log_retention_days: u32,

    pub stop_signal: Signal,
    pub grace_period: Duration,
    pub poll_interval: Duration,

    pub schedule: ScheduleConfig,

    pub status_log_lines: usize,
    pub status_upcoming: usize,

    /// Config file this definition was loaded from (absolute), if any.
    pub source_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Marker identifying this service's entries in the schedule table.
    pub tag: String,
    /// Extra substrings that also mark an entry as ours (entries installed by older tooling).
    pub legacy_match: Vec<String>,
    /// Use a plain file as the schedule table instead of the user's crontab.
    pub table_file: Option<PathBuf>,
    pub backup_dir: PathBuf,
    /// Executable written into schedule entries; defaults to the running binary.
    pub binary: Option<PathBuf>,
    pub environment: Vec<EnvironmentVar>,
    pub triggers: Vec<Trigger>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TriggerAction {
    Start,
    Stop,
    Restart,
}

impl TriggerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerAction::Start => "start",
            TriggerAction::Stop => "stop",
            TriggerAction::Restart => "restart",
        }
    }
}

impl std::fmt::Display for TriggerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Trigger {
    pub action: TriggerAction,
    /// Standard 5-field cron expression, e.g. "25 8 * * 1-5".
    pub cron: String,
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    service: ServiceSection,
    #[serde(default)]
    files: Option<FilesSection>,
    #[serde(default)]
    stop: Option<StopSection>,
    #[serde(default)]
    schedule: Option<ScheduleSection>,
    #[serde(default)]
    status: Option<StatusSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceSection {
    name: String,
    #[serde(default)]
    project_root: Option<PathBuf>,
    start_command: Vec<String>,
    #[serde(default)]
    identity_match: Option<String>,
    #[serde(default)]
    environment: Vec<EnvironmentVar>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilesSection {
    #[serde(default)]
    pid_file: Option<PathBuf>,
    #[serde(default)]
    log_dir: Option<PathBuf>,
    #[serde(default = "default_log_retention_days")]
    log_retention_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StopSection {
    #[serde(default)]
    signal: Option<String>,
    #[serde(default, deserialize_with = "deserialize_duration_opt")]
    grace_period: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration_opt")]
    poll_interval: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScheduleSection {
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    legacy_match: Vec<String>,
    #[serde(default)]
    table_file: Option<PathBuf>,
    #[serde(default)]
    backup_dir: Option<PathBuf>,
    #[serde(default)]
    binary: Option<PathBuf>,
    #[serde(default)]
    environment: Vec<EnvironmentVar>,
    #[serde(default)]
    triggers: Vec<Trigger>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StatusSection {
    #[serde(default = "default_status_log_lines")]
    log_lines: usize,
    #[serde(default = "default_status_upcoming")]
    upcoming: usize,
}

fn default_log_retention_days() -> u32 {
    30
}
fn default_grace_period() -> Duration {
    Duration::from_secs(10)
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_status_log_lines() -> usize {
    20
}
fn default_status_upcoming() -> usize {
    3
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    let Some(v) = v else { return Ok(None) };
    match v {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .map(|ms| Some(Duration::from_millis(ms)))
            .ok_or_else(|| D::Error::custom("duration must be a non-negative integer (ms) or a string like \"10s\"")),
        serde_yaml::Value::String(s) => parse_duration(&s).map(Some).map_err(D::Error::custom),
        _ => Err(D::Error::custom("duration must be an integer (ms) or a string like \"10s\"")),
    }
}

/// Parse `1500ms`, `10s`, `1.5m`, `2h`, or a bare integer (milliseconds).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(ms) = t.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    let idx = t
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map(|(i, _)| i)
        .unwrap_or(0);
    if idx == 0 {
        return Err(format!("invalid duration: {s:?}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s
        .parse()
        .map_err(|e| format!("invalid duration number {num_s:?}: {e}"))?;
    let mult_ms: f64 = match unit_s.trim().to_ascii_lowercase().as_str() {
        "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        _ => return Err(format!("unknown duration unit {unit_s:?} (use ms/s/m/h)")),
    };
    Ok(Duration::from_millis((num * mult_ms).round() as u64))
}

pub fn parse_signal(s: &str) -> anyhow::Result<Signal> {
    let raw = s.trim().to_uppercase();
    let name = raw.strip_prefix("SIG").unwrap_or(&raw);
    let sig = match name {
        "TERM" => Signal::SIGTERM,
        "INT" => Signal::SIGINT,
        "HUP" => Signal::SIGHUP,
        "QUIT" => Signal::SIGQUIT,
        "USR1" => Signal::SIGUSR1,
        "USR2" => Signal::SIGUSR2,
        _ => anyhow::bail!("unsupported stop signal: {s} (use TERM/INT/HUP/QUIT/USR1/USR2)"),
    };
    Ok(sig)
}

fn validate_service_name(name: &str) -> anyhow::Result<()> {
    anyhow::ensure!(!name.is_empty(), "service.name must not be empty");
    anyhow::ensure!(
        name.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'),
        "service.name {name:?} may only contain ASCII letters, digits, '-', '_' and '.'"
    );
    Ok(())
}

fn resolve(base: &Path, p: PathBuf) -> PathBuf {
    if p.is_relative() {
        base.join(p)
    } else {
        p
    }
}

/// Parse a service definition from YAML. Relative paths resolve against `base_dir`.
pub fn parse_service_config(raw: &str, base_dir: &Path) -> anyhow::Result<ServiceConfig> {
    let file: ConfigFile =
        serde_yaml::from_str(raw).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

    let name = file.service.name.trim().to_string();
    validate_service_name(&name)?;
    anyhow::ensure!(
        !file.service.start_command.is_empty(),
        "service.start_command must not be empty"
    );
    for v in file
        .service
        .environment
        .iter()
        .chain(file.schedule.iter().flat_map(|s| s.environment.iter()))
    {
        anyhow::ensure!(
            !v.name.is_empty() && !v.name.contains('=') && !v.name.contains('\0'),
            "invalid environment variable name {:?}",
            v.name
        );
    }

    let project_root = match file.service.project_root {
        Some(p) => resolve(base_dir, p),
        None => base_dir.to_path_buf(),
    };

    let files = file.files.unwrap_or(FilesSection {
        pid_file: None,
        log_dir: None,
        log_retention_days: default_log_retention_days(),
    });
    anyhow::ensure!(
        files.log_retention_days >= 1,
        "files.log_retention_days must be at least 1"
    );
    let pid_file = match files.pid_file {
        Some(p) => resolve(base_dir, p),
        None => project_root.join(format!("{name}.pid")),
    };
    let log_dir = match files.log_dir {
        Some(p) => resolve(base_dir, p),
        None => project_root.join("logs"),
    };

    let stop = file.stop.unwrap_or(StopSection {
        signal: None,
        grace_period: None,
        poll_interval: None,
    });
    let stop_signal = parse_signal(stop.signal.as_deref().unwrap_or("SIGTERM"))?;
    let grace_period = stop.grace_period.unwrap_or_else(default_grace_period);
    let poll_interval = stop.poll_interval.unwrap_or_else(default_poll_interval);
    anyhow::ensure!(!poll_interval.is_zero(), "stop.poll_interval must be greater than zero");

    let sched = file.schedule.unwrap_or(ScheduleSection {
        tag: None,
        legacy_match: vec![],
        table_file: None,
        backup_dir: None,
        binary: None,
        environment: vec![],
        triggers: vec![],
    });
    let tag = sched
        .tag
        .map(|t| t.trim().to_string())
        .unwrap_or_else(|| name.clone());
    anyhow::ensure!(
        !tag.is_empty() && !tag.chars().any(char::is_whitespace),
        "schedule.tag must be a non-empty token without whitespace"
    );
    for m in &sched.legacy_match {
        anyhow::ensure!(!m.trim().is_empty(), "schedule.legacy_match entries must not be empty");
    }
    for t in &sched.triggers {
        crate::pm::schedule::parse_cron(&t.cron)
            .map_err(|e| anyhow::anyhow!("schedule trigger {} {:?}: {e}", t.action, t.cron))?;
    }
    let backup_dir = match sched.backup_dir {
        Some(p) => resolve(base_dir, p),
        None => log_dir.join("cron_backups"),
    };

    let status = file.status.unwrap_or(StatusSection {
        log_lines: default_status_log_lines(),
        upcoming: default_status_upcoming(),
    });

    Ok(ServiceConfig {
        name,
        project_root,
        start_command: file.service.start_command,
        identity_match: file
            .service
            .identity_match
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        environment: file.service.environment,
        pid_file,
        log_dir,
        log_retention_days: files.log_retention_days,
        stop_signal,
        grace_period,
        poll_interval,
        schedule: ScheduleConfig {
            tag,
            legacy_match: sched.legacy_match,
            table_file: sched.table_file.map(|p| resolve(base_dir, p)),
            backup_dir,
            binary: sched.binary.map(|p| resolve(base_dir, p)),
            environment: sched.environment,
            triggers: sched.triggers,
        },
        status_log_lines: status.log_lines,
        status_upcoming: status.upcoming,
        source_file: None,
    })
}

pub fn load_service_config(config_path: &Path) -> anyhow::Result<ServiceConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    // Schedule entries embed this path, so it must survive a different cwd.
    let abs = std::fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_path_buf());
    let base = abs.parent().unwrap_or_else(|| Path::new("."));
    let mut cfg = parse_service_config(&raw, base)
        .map_err(|e| anyhow::anyhow!("{}: {e:#}", config_path.display()))?;
    cfg.source_file = Some(abs);
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
service:
  name: autostock
  start_command: ["python3", "main.py"]
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse_service_config(MINIMAL, Path::new("/srv/bot")).unwrap();
        assert_eq!(cfg.name, "autostock");
        assert_eq!(cfg.project_root, PathBuf::from("/srv/bot"));
        assert_eq!(cfg.pid_file, PathBuf::from("/srv/bot/autostock.pid"));
        assert_eq!(cfg.log_dir, PathBuf::from("/srv/bot/logs"));
        assert_eq!(cfg.log_retention_days, 30);
        assert_eq!(cfg.stop_signal, Signal::SIGTERM);
        assert_eq!(cfg.grace_period, Duration::from_secs(10));
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.schedule.tag, "autostock");
        assert!(cfg.schedule.triggers.is_empty());
        assert_eq!(cfg.status_log_lines, 20);
        assert_eq!(cfg.status_upcoming, 3);
    }

    #[test]
    fn full_config_overrides_and_resolves_paths() {
        let raw = r#"
service:
  name: autostock
  project_root: /opt/autostock
  start_command: ["python3", "main.py"]
  identity_match: " main.py "
  environment:
    - {name: TZ, value: Asia/Seoul}
files:
  pid_file: run/autostock.pid
  log_dir: /var/log/autostock
  log_retention_days: 7
stop:
  signal: INT
  grace_period: 1500ms
  poll_interval: 250
schedule:
  tag: chul
  legacy_match: ["main.py"]
  triggers:
    - {action: start, cron: "25 8 * * 1-5"}
    - {action: stop, cron: "5 10 * * 1-5"}
status:
  log_lines: 5
"#;
        let cfg = parse_service_config(raw, Path::new("/etc/pidmaster")).unwrap();
        assert_eq!(cfg.project_root, PathBuf::from("/opt/autostock"));
        assert_eq!(cfg.identity_match.as_deref(), Some("main.py"));
        assert_eq!(cfg.pid_file, PathBuf::from("/etc/pidmaster/run/autostock.pid"));
        assert_eq!(cfg.log_dir, PathBuf::from("/var/log/autostock"));
        assert_eq!(cfg.schedule.backup_dir, PathBuf::from("/var/log/autostock/cron_backups"));
        assert_eq!(cfg.log_retention_days, 7);
        assert_eq!(cfg.stop_signal, Signal::SIGINT);
        assert_eq!(cfg.grace_period, Duration::from_millis(1500));
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.schedule.tag, "chul");
        assert_eq!(cfg.schedule.triggers.len(), 2);
        assert_eq!(cfg.schedule.triggers[1].action, TriggerAction::Stop);
        assert_eq!(cfg.status_log_lines, 5);
        assert_eq!(cfg.status_upcoming, 3);
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        let unknown = format!("{MINIMAL}\nextra: 1\n");
        assert!(parse_service_config(&unknown, Path::new("/")).is_err());

        let bad_name = r#"
service:
  name: "auto stock"
  start_command: ["x"]
"#;
        assert!(parse_service_config(bad_name, Path::new("/")).is_err());

        let empty_cmd = r#"
service:
  name: bot
  start_command: []
"#;
        assert!(parse_service_config(empty_cmd, Path::new("/")).is_err());

        let bad_cron = r#"
service:
  name: bot
  start_command: ["x"]
schedule:
  triggers:
    - {action: start, cron: "not a cron"}
"#;
        assert!(parse_service_config(bad_cron, Path::new("/")).is_err());

        let zero_poll = r#"
service:
  name: bot
  start_command: ["x"]
stop:
  poll_interval: 0
"#;
        assert!(parse_service_config(zero_poll, Path::new("/")).is_err());
    }

    #[test]
    fn duration_forms() {
        assert_eq!(parse_duration("1500"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("1.5m"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert!(parse_duration("ten").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn signal_names() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("hup").unwrap(), Signal::SIGHUP);
        assert!(parse_signal("KILL").is_err());
    }
}
