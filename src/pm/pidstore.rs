use anyhow::Context as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// What we know about the last-launched worker.
///
/// On disk the first line is the bare pid, so a file written by `echo $! > x.pid`
/// still reads back. Extra `key=value` lines carry the identity fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRecord {
    pub pid: i32,
    /// Process start time in clock ticks since boot (`/proc/<pid>/stat` field 22).
    pub start_ticks: Option<u64>,
    pub started_at: Option<String>,
}

impl PidRecord {
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            start_ticks: None,
            started_at: None,
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("{}\n", self.pid);
        if let Some(t) = self.start_ticks {
            out.push_str(&format!("start_ticks={t}\n"));
        }
        if let Some(s) = self.started_at.as_deref() {
            out.push_str(&format!("started_at={s}\n"));
        }
        out
    }

    /// Returns `None` for anything that is not a positive pid on the first line.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut lines = raw.lines().map(str::trim).filter(|l| !l.is_empty());
        let pid: i32 = lines.next()?.parse().ok()?;
        if pid <= 0 {
            return None;
        }
        let mut rec = PidRecord::new(pid);
        for line in lines {
            let Some((k, v)) = line.split_once('=') else { continue };
            match k.trim() {
                "start_ticks" => rec.start_ticks = v.trim().parse().ok(),
                "started_at" => rec.started_at = Some(v.trim().to_string()),
                _ => {}
            }
        }
        Some(rec)
    }
}

/// What the record file holds right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredRecord {
    Missing,
    /// The file exists but is not a record; carries its first line.
    Unparsable(String),
    Valid(PidRecord),
}

#[derive(Debug, Clone)]
pub struct PidStore {
    path: PathBuf,
}

impl PidStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the record atomically: write a sibling temp file, then rename over.
    pub fn write(&self, rec: &PidRecord) -> anyhow::Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).with_context(|| format!("create_dir_all {}", parent.display()))?;
        let file_name = self
            .path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "pid".to_string());
        let tmp = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));
        fs::write(&tmp, rec.render()).with_context(|| format!("write {}", tmp.display()))?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()));
        }
        Ok(())
    }

    pub fn load(&self) -> anyhow::Result<StoredRecord> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoredRecord::Missing),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };
        Ok(match PidRecord::parse(&raw) {
            Some(rec) => StoredRecord::Valid(rec),
            None => {
                tracing::debug!(path = %self.path.display(), "unparsable pid record");
                let first = raw.lines().next().unwrap_or_default().trim();
                StoredRecord::Unparsable(first.chars().take(64).collect())
            }
        })
    }

    /// The record, if the file holds one. Unparsable content reads as absent.
    pub fn read(&self) -> anyhow::Result<Option<PidRecord>> {
        Ok(match self.load()? {
            StoredRecord::Valid(rec) => Some(rec),
            StoredRecord::Missing | StoredRecord::Unparsable(_) => None,
        })
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", self.path.display())),
        }
    }
}
