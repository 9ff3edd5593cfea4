//! Time-triggered `start`/`stop`/`restart` entries in the host's periodic-task table.
//!
//! Entries belonging to a service carry a trailing `# pidmaster:<tag>` marker. Installing
//! replaces every marked entry (plus entries matching the configured legacy substrings)
//! with the configured set in a single table write, so re-running an install is a no-op.

use crate::pm::config::{ServiceConfig, Trigger, TriggerAction};
use crate::pm::error::SupervisorError;
use anyhow::Context as _;
use chrono::{DateTime, Local, TimeZone};
use cron::Schedule;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;

pub const MARKER_PREFIX: &str = "# pidmaster:";

// -------- cron expressions --------

const DOW_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn dow_number(s: &str) -> anyhow::Result<u32> {
    let n: u32 = s
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid day-of-week {s:?}"))?;
    anyhow::ensure!(n <= 7, "day-of-week {n} out of range 0-7");
    Ok(n % 7)
}

/// Rewrite a crontab day-of-week field (0-7, Sunday = 0 or 7) as day names.
///
/// The `cron` crate numbers days 1-7 from Sunday, so numeric fields cannot be
/// passed through. Fields that already use names are left alone.
fn translate_dow(field: &str) -> anyhow::Result<String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }
    let mut days = BTreeSet::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid step {s:?} in day-of-week {field:?}"))?;
                anyhow::ensure!(step > 0, "zero step in day-of-week {field:?}");
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo: u32 = a
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid day-of-week {a:?}"))?;
            let hi: u32 = b
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid day-of-week {b:?}"))?;
            anyhow::ensure!(lo <= hi && hi <= 7, "invalid day-of-week range {range:?}");
            (lo, hi)
        } else {
            let n = dow_number(range)?;
            // "5/2" means "from 5 through the end of the week, every 2nd day".
            if step > 1 {
                (n, 6)
            } else {
                (n, n)
            }
        };
        let mut d = lo;
        while d <= hi {
            days.insert(d % 7);
            d += step;
        }
    }
    anyhow::ensure!(!days.is_empty(), "empty day-of-week {field:?}");
    Ok(days
        .into_iter()
        .map(|d| DOW_NAMES[d as usize])
        .collect::<Vec<_>>()
        .join(","))
}

/// Turn a crontab-style expression into what the `cron` crate evaluates.
///
/// Five fields gain a leading seconds field of `0` and a translated day-of-week;
/// six or seven fields and `@daily`-style shorthands pass through unchanged.
pub fn normalize_cron_expr(expr: &str) -> anyhow::Result<String> {
    let t = expr.trim();
    if t.starts_with('@') {
        return Ok(t.to_string());
    }
    let parts: Vec<&str> = t.split_whitespace().collect();
    match parts.len() {
        5 => {
            let dow = translate_dow(parts[4])?;
            Ok(format!("0 {} {} {} {} {dow}", parts[0], parts[1], parts[2], parts[3]))
        }
        6 | 7 => Ok(parts.join(" ")),
        n => anyhow::bail!("expected 5 cron fields, got {n}"),
    }
}

pub fn parse_cron(expr: &str) -> anyhow::Result<Schedule> {
    let normalized = normalize_cron_expr(expr)?;
    Schedule::from_str(&normalized).map_err(|e| anyhow::anyhow!("invalid cron expression {expr:?}: {e}"))
}

/// The next `n` fire times strictly after `after`.
pub fn upcoming<Tz: TimeZone>(schedule: &Schedule, after: &DateTime<Tz>, n: usize) -> Vec<DateTime<Tz>> {
    schedule.after(after).take(n).collect()
}

// -------- tables --------

/// A host periodic-task table that can be read and replaced as a whole.
pub trait SchedulerTable {
    fn describe(&self) -> String;
    fn read_table(&self) -> Result<String, SupervisorError>;
    fn write_table(&self, content: &str) -> Result<(), SupervisorError>;
}

/// The invoking user's crontab, through the `crontab` binary.
#[derive(Debug, Clone)]
pub struct Crontab {
    program: PathBuf,
}

impl Default for Crontab {
    fn default() -> Self {
        Self {
            program: PathBuf::from("crontab"),
        }
    }
}

impl Crontab {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn unavailable(&self, what: &str, e: impl std::fmt::Display) -> SupervisorError {
        SupervisorError::SchedulerUnavailable(format!("{} {what}: {e}", self.program.display()))
    }
}

impl SchedulerTable for Crontab {
    fn describe(&self) -> String {
        "crontab".to_string()
    }

    fn read_table(&self) -> Result<String, SupervisorError> {
        let out = Command::new(&self.program)
            .arg("-l")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.unavailable("-l", e))?;
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.to_ascii_lowercase().contains("no crontab") {
            return Ok(String::new());
        }
        Err(self.unavailable("-l", format!("{} {}", out.status, stderr.trim())))
    }

    fn write_table(&self, content: &str) -> Result<(), SupervisorError> {
        let mut child = Command::new(&self.program)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.unavailable("-", e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(content.as_bytes())
                .map_err(|e| self.unavailable("- (stdin)", e))?;
        }
        let out = child.wait_with_output().map_err(|e| self.unavailable("-", e))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(self.unavailable("-", format!("{} {}", out.status, stderr.trim())));
        }
        Ok(())
    }
}

/// A plain file holding crontab-formatted lines.
#[derive(Debug, Clone)]
pub struct FileTable {
    path: PathBuf,
}

impl FileTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SchedulerTable for FileTable {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn read_table(&self) -> Result<String, SupervisorError> {
        match fs::read_to_string(&self.path) {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("read {}", self.path.display()))
                .into()),
        }
    }

    fn write_table(&self, content: &str) -> Result<(), SupervisorError> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = parent.join(format!(".schedule.tmp.{}", std::process::id()));
        let res = fs::create_dir_all(parent)
            .and_then(|_| fs::write(&tmp, content))
            .and_then(|_| fs::rename(&tmp, &self.path));
        if let Err(e) = res {
            let _ = fs::remove_file(&tmp);
            return Err(anyhow::Error::new(e)
                .context(format!("write {}", self.path.display()))
                .into());
        }
        Ok(())
    }
}

pub fn table_for(cfg: &ServiceConfig) -> Box<dyn SchedulerTable> {
    match cfg.schedule.table_file.as_ref() {
        Some(p) => Box::new(FileTable::new(p.clone())),
        None => Box::new(Crontab::default()),
    }
}

// -------- entries --------

/// Decides which table lines belong to a service.
#[derive(Debug, Clone)]
pub struct EntryMatcher {
    marker: String,
    legacy: Vec<String>,
}

impl EntryMatcher {
    pub fn new(tag: &str, legacy: &[String]) -> Self {
        Self {
            marker: format!("{MARKER_PREFIX}{tag}"),
            legacy: legacy.to_vec(),
        }
    }

    pub fn for_service(cfg: &ServiceConfig) -> Self {
        Self::new(&cfg.schedule.tag, &cfg.schedule.legacy_match)
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn is_ours(&self, line: &str) -> bool {
        let t = line.trim_end();
        if t.trim().is_empty() {
            return false;
        }
        t.ends_with(&self.marker) || self.legacy.iter().any(|m| t.contains(m.as_str()))
    }
}

fn quote(s: &str) -> String {
    // crontab turns an unescaped '%' into a newline.
    shell_escape::unix::escape(Cow::Borrowed(s)).replace('%', "\\%")
}

fn quote_path(p: &Path) -> String {
    quote(&p.to_string_lossy())
}

/// Everything needed to render this service's table lines.
#[derive(Debug, Clone)]
pub struct EntryTemplate {
    pub binary: PathBuf,
    pub config_file: PathBuf,
    pub project_root: PathBuf,
    pub cron_log: PathBuf,
    pub environment: Vec<(String, String)>,
    pub marker: String,
}

impl EntryTemplate {
    pub fn for_service(cfg: &ServiceConfig) -> anyhow::Result<Self> {
        let config_file = cfg
            .source_file
            .clone()
            .context("schedule entries need the service to be loaded from a config file")?;
        let binary = match cfg.schedule.binary.clone() {
            Some(b) => b,
            None => std::env::current_exe().context("resolve current executable")?,
        };
        Ok(Self {
            binary,
            config_file,
            project_root: cfg.project_root.clone(),
            cron_log: cfg.log_dir.join(format!("{}_cron.log", cfg.name)),
            environment: cfg
                .schedule
                .environment
                .iter()
                .map(|v| (v.name.clone(), v.value.clone()))
                .collect(),
            marker: EntryMatcher::for_service(cfg).marker,
        })
    }

    pub fn render(&self, trigger: &Trigger) -> String {
        let mut cmd = format!("cd {} &&", quote_path(&self.project_root));
        for (k, v) in &self.environment {
            cmd.push_str(&format!(" {k}={}", quote(v)));
        }
        cmd.push_str(&format!(
            " {} -c {} {} >> {} 2>&1",
            quote_path(&self.binary),
            quote_path(&self.config_file),
            trigger.action,
            quote_path(&self.cron_log)
        ));
        format!("{} {cmd} {}", trigger.cron.trim(), self.marker)
    }

    pub fn render_all(&self, triggers: &[Trigger]) -> Vec<String> {
        triggers.iter().map(|t| self.render(t)).collect()
    }
}

/// An installed table line split into its schedule and the action it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledEntry {
    pub cron: String,
    /// `None` for legacy lines that do not invoke a supervisor action.
    pub action: Option<TriggerAction>,
}

/// Split a crontab line. Comments, blanks and variable assignments yield `None`.
pub fn parse_entry(line: &str) -> Option<InstalledEntry> {
    let t = line.trim();
    if t.is_empty() || t.starts_with('#') {
        return None;
    }
    let tokens: Vec<&str> = t.split_whitespace().collect();
    let fields = if tokens[0].starts_with('@') { 1 } else { 5 };
    if tokens.len() <= fields || tokens[0].contains('=') {
        return None;
    }
    let action = tokens[fields..]
        .iter()
        .take_while(|tok| !tok.starts_with('#') && !tok.starts_with('>'))
        .find_map(|tok| match *tok {
            "start" => Some(TriggerAction::Start),
            "stop" => Some(TriggerAction::Stop),
            "restart" => Some(TriggerAction::Restart),
            _ => None,
        });
    Some(InstalledEntry {
        cron: tokens[..fields].join(" "),
        action,
    })
}

// -------- planning --------

/// Before/after view of one table replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePlan {
    pub current: String,
    pub next: String,
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

impl TablePlan {
    pub fn is_noop(&self) -> bool {
        self.current == self.next
    }
}

fn plan(current: &str, matcher: &EntryMatcher, added: Vec<String>) -> TablePlan {
    let mut kept: Vec<&str> = vec![];
    let mut removed = vec![];
    for line in current.lines() {
        if matcher.is_ours(line) {
            removed.push(line.to_string());
        } else {
            kept.push(line);
        }
    }
    while kept.last().is_some_and(|l| l.trim().is_empty()) {
        kept.pop();
    }
    let mut lines: Vec<&str> = kept;
    lines.extend(added.iter().map(String::as_str));
    let next = if lines.is_empty() {
        String::new()
    } else {
        format!("{}\n", lines.join("\n"))
    };
    TablePlan {
        current: current.to_string(),
        next,
        removed,
        added,
    }
}

pub fn plan_install(current: &str, matcher: &EntryMatcher, entries: Vec<String>) -> TablePlan {
    plan(current, matcher, entries)
}

pub fn plan_remove(current: &str, matcher: &EntryMatcher) -> TablePlan {
    plan(current, matcher, vec![])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Install,
    Remove,
}

impl BackupKind {
    fn prefix(self) -> &'static str {
        match self {
            BackupKind::Install => "cron_backup",
            BackupKind::Remove => "cron_backup_before_remove",
        }
    }
}

/// Copy the current table aside before replacing it. Empty tables are not backed up.
pub fn backup(current: &str, dir: &Path, kind: BackupKind, now: DateTime<Local>) -> anyhow::Result<Option<PathBuf>> {
    if current.trim().is_empty() {
        return Ok(None);
    }
    fs::create_dir_all(dir).with_context(|| format!("create_dir_all {}", dir.display()))?;
    let stamp = now.format("%Y%m%d_%H%M%S");
    let mut path = dir.join(format!("{}_{stamp}.txt", kind.prefix()));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{}_{stamp}_{n}.txt", kind.prefix()));
        n += 1;
    }
    fs::write(&path, current).with_context(|| format!("write {}", path.display()))?;
    Ok(Some(path))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableChange {
    Unchanged,
    Applied {
        backup: Option<PathBuf>,
        removed: usize,
        added: usize,
    },
}

/// Reads, plans and replaces one service's entries in a [`SchedulerTable`].
pub struct Installer<'a> {
    table: &'a dyn SchedulerTable,
    matcher: EntryMatcher,
    backup_dir: PathBuf,
}

impl<'a> Installer<'a> {
    pub fn new(table: &'a dyn SchedulerTable, matcher: EntryMatcher, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            table,
            matcher,
            backup_dir: backup_dir.into(),
        }
    }

    /// Lines currently installed for this service.
    pub fn list_triggers(&self) -> Result<Vec<String>, SupervisorError> {
        let current = self.table.read_table()?;
        Ok(current
            .lines()
            .filter(|l| self.matcher.is_ours(l))
            .map(str::to_string)
            .collect())
    }

    pub fn installed_entries(&self) -> Result<Vec<InstalledEntry>, SupervisorError> {
        Ok(self.list_triggers()?.iter().filter_map(|l| parse_entry(l)).collect())
    }

    /// Replace this service's entries with `entries`. `confirm` sees the plan
    /// before anything is written and may refuse it.
    pub fn install_triggers(
        &self,
        entries: Vec<String>,
        confirm: impl FnOnce(&TablePlan) -> bool,
    ) -> Result<TableChange, SupervisorError> {
        let current = self.table.read_table()?;
        let plan = plan_install(&current, &self.matcher, entries);
        self.apply(plan, BackupKind::Install, confirm)
    }

    pub fn remove_matching(&self, confirm: impl FnOnce(&TablePlan) -> bool) -> Result<TableChange, SupervisorError> {
        let current = self.table.read_table()?;
        let plan = plan_remove(&current, &self.matcher);
        self.apply(plan, BackupKind::Remove, confirm)
    }

    fn apply(
        &self,
        plan: TablePlan,
        kind: BackupKind,
        confirm: impl FnOnce(&TablePlan) -> bool,
    ) -> Result<TableChange, SupervisorError> {
        if plan.is_noop() {
            return Ok(TableChange::Unchanged);
        }
        if !confirm(&plan) {
            return Err(SupervisorError::Declined);
        }
        let backup = backup(&plan.current, &self.backup_dir, kind, Local::now())?;
        self.table.write_table(&plan.next)?;
        Ok(TableChange::Applied {
            backup,
            removed: plan.removed.len(),
            added: plan.added.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm::config::TriggerAction;
    use chrono::{Datelike, Timelike, Weekday};

    #[test]
    fn day_of_week_translation() {
        assert_eq!(translate_dow("*").unwrap(), "*");
        assert_eq!(translate_dow("1-5").unwrap(), "MON,TUE,WED,THU,FRI");
        assert_eq!(translate_dow("0").unwrap(), "SUN");
        assert_eq!(translate_dow("7").unwrap(), "SUN");
        assert_eq!(translate_dow("5-7").unwrap(), "SUN,FRI,SAT");
        assert_eq!(translate_dow("*/2").unwrap(), "SUN,TUE,THU,SAT");
        assert_eq!(translate_dow("1,3").unwrap(), "MON,WED");
        assert_eq!(translate_dow("Mon-Fri").unwrap(), "Mon-Fri");
        assert!(translate_dow("8").is_err());
        assert!(translate_dow("5-1").is_err());
    }

    #[test]
    fn normalizes_five_field_expressions() {
        assert_eq!(
            normalize_cron_expr("25 8 * * 1-5").unwrap(),
            "0 25 8 * * MON,TUE,WED,THU,FRI"
        );
        assert_eq!(normalize_cron_expr("0 0 9 * * *").unwrap(), "0 0 9 * * *");
        assert_eq!(normalize_cron_expr("@daily").unwrap(), "@daily");
        assert!(normalize_cron_expr("* * *").is_err());
        assert!(parse_cron("61 8 * * *").is_err());
    }

    #[test]
    fn weekday_triggers_fire_on_weekdays_only() {
        let s = parse_cron("25 8 * * 1-5").unwrap();
        // 2026-10-16 is a Friday.
        let fri = Local.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).single().unwrap();
        let next = upcoming(&s, &fri, 3);
        assert_eq!(next.len(), 3);
        assert_eq!(next[0].weekday(), Weekday::Mon);
        assert_eq!((next[0].hour(), next[0].minute()), (8, 25));
        assert_eq!(next[1].weekday(), Weekday::Tue);
        assert_eq!(next[2].weekday(), Weekday::Wed);
    }

    fn matcher() -> EntryMatcher {
        EntryMatcher::new("bot", &["main.py".to_string()])
    }

    #[test]
    fn matcher_uses_exact_marker_and_legacy_substrings() {
        let m = matcher();
        assert!(m.is_ours("25 8 * * 1-5 cd /x && pidmaster start # pidmaster:bot"));
        assert!(m.is_ours("28 8 * * 1-5 cd /x && python main.py >> trading.log 2>&1"));
        assert!(!m.is_ours("0 3 * * * backup.sh # pidmaster:bot2"));
        assert!(!m.is_ours("0 3 * * * backup.sh"));
        assert!(!m.is_ours(""));
    }

    fn template() -> EntryTemplate {
        EntryTemplate {
            binary: PathBuf::from("/usr/local/bin/pidmaster"),
            config_file: PathBuf::from("/srv/my bot/pidmaster.yaml"),
            project_root: PathBuf::from("/srv/my bot"),
            cron_log: PathBuf::from("/srv/my bot/logs/bot_cron.log"),
            environment: vec![("TZ".to_string(), "Asia/Seoul".to_string())],
            marker: matcher().marker().to_string(),
        }
    }

    #[test]
    fn renders_quoted_entries() {
        let t = Trigger {
            action: TriggerAction::Start,
            cron: "25 8 * * 1-5".to_string(),
        };
        let line = template().render(&t);
        assert_eq!(
            line,
            "25 8 * * 1-5 cd '/srv/my bot' && TZ=Asia/Seoul /usr/local/bin/pidmaster \
             -c '/srv/my bot/pidmaster.yaml' start >> '/srv/my bot/logs/bot_cron.log' 2>&1 # pidmaster:bot"
        );
        assert!(matcher().is_ours(&line));

        let mut pct = template();
        pct.environment = vec![("FMT".to_string(), "%Y".to_string())];
        let rendered = pct.render(&t);
        assert!(rendered.contains("\\%Y"), "{rendered}");
        assert!(!rendered.contains(" %Y"));
    }

    #[test]
    fn installed_lines_split_into_schedule_and_action() {
        let t = Trigger {
            action: TriggerAction::Stop,
            cron: "5 10 * * 1-5".to_string(),
        };
        let e = parse_entry(&template().render(&t)).unwrap();
        assert_eq!(e.cron, "5 10 * * 1-5");
        assert_eq!(e.action, Some(TriggerAction::Stop));

        let legacy = parse_entry("28 8 * * 1-5 cd /x && python main.py >> trading.log 2>&1").unwrap();
        assert_eq!(legacy.cron, "28 8 * * 1-5");
        assert_eq!(legacy.action, None);

        let daily = parse_entry("@daily /usr/bin/pidmaster -c /srv/p.yaml restart # pidmaster:bot").unwrap();
        assert_eq!(daily.cron, "@daily");
        assert_eq!(daily.action, Some(TriggerAction::Restart));

        assert_eq!(parse_entry("MAILTO=ops"), None);
        assert_eq!(parse_entry("# 0 3 * * * start"), None);
        assert_eq!(parse_entry("   "), None);
    }

    #[test]
    fn install_replaces_ours_and_keeps_the_rest_in_order() {
        let current = "MAILTO=ops\n\
                       28 8 * * 1-5 cd /x && python main.py >> trading.log 2>&1\n\
                       0 3 * * * backup.sh\n\
                       5 10 * * 1-5 old-stop # pidmaster:bot\n\
                       \n";
        let entries = vec!["25 8 * * 1-5 new-start # pidmaster:bot".to_string()];
        let p = plan_install(current, &matcher(), entries.clone());
        assert_eq!(p.removed.len(), 2);
        assert_eq!(
            p.next,
            "MAILTO=ops\n0 3 * * * backup.sh\n25 8 * * 1-5 new-start # pidmaster:bot\n"
        );
        assert!(!p.is_noop());

        let again = plan_install(&p.next, &matcher(), entries);
        assert!(again.is_noop());

        let removed = plan_remove(&p.next, &matcher());
        assert_eq!(removed.next, "MAILTO=ops\n0 3 * * * backup.sh\n");
        assert_eq!(plan_remove("", &matcher()).next, "");
    }

    #[test]
    fn installer_backs_up_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let table = FileTable::new(dir.path().join("crontab.txt"));
        table.write_table("0 3 * * * backup.sh\n").unwrap();
        let backups = dir.path().join("backups");
        let inst = Installer::new(&table, matcher(), &backups);
        let entries = vec![
            "25 8 * * 1-5 a # pidmaster:bot".to_string(),
            "5 10 * * 1-5 b # pidmaster:bot".to_string(),
        ];

        let first = inst.install_triggers(entries.clone(), |_| true).unwrap();
        let TableChange::Applied { backup, removed, added } = first else {
            panic!("expected applied");
        };
        assert_eq!((removed, added), (0, 2));
        let backup = backup.unwrap();
        assert!(backup.file_name().unwrap().to_string_lossy().starts_with("cron_backup_"));
        assert_eq!(fs::read_to_string(backup).unwrap(), "0 3 * * * backup.sh\n");

        let second = inst.install_triggers(entries, |_| panic!("no prompt for a no-op")).unwrap();
        assert_eq!(second, TableChange::Unchanged);
        assert_eq!(inst.list_triggers().unwrap().len(), 2);
        assert_eq!(inst.installed_entries().unwrap()[1].cron, "5 10 * * 1-5");

        let declined = inst.remove_matching(|p| {
            assert_eq!(p.removed.len(), 2);
            false
        });
        assert!(matches!(declined, Err(SupervisorError::Declined)));
        assert_eq!(inst.list_triggers().unwrap().len(), 2);

        inst.remove_matching(|_| true).unwrap();
        assert_eq!(table.read_table().unwrap(), "0 3 * * * backup.sh\n");
        let names: Vec<String> = fs::read_dir(&backups)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().any(|n| n.starts_with("cron_backup_before_remove_")));
    }

    #[test]
    fn missing_crontab_binary_is_unavailable() {
        let c = Crontab::with_program("/nonexistent/crontab");
        assert!(matches!(c.read_table(), Err(SupervisorError::SchedulerUnavailable(_))));
        assert!(matches!(c.write_table(""), Err(SupervisorError::SchedulerUnavailable(_))));
    }
}
