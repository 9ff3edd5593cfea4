use crate::pm::config::ServiceConfig;
use crate::pm::liveness::{self, RecordState};
use crate::pm::logsink::LogSink;
use crate::pm::pidstore::{PidRecord, PidStore};

/// One supervised service: its definition plus the on-disk state it owns.
#[derive(Debug, Clone)]
pub struct Service {
    pub cfg: ServiceConfig,
    pub store: PidStore,
    pub sink: LogSink,
}

impl Service {
    pub fn new(cfg: ServiceConfig) -> Self {
        let store = PidStore::new(cfg.pid_file.clone());
        let sink = LogSink::new(cfg.log_dir.clone(), cfg.name.clone());
        Self { cfg, store, sink }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn probe(&self) -> anyhow::Result<RecordState> {
        liveness::probe(&self.store, self.cfg.identity_match.as_deref())
    }

    /// Drop a record that no longer names our worker.
    pub fn heal_stale(&self, component: &str, record: &PidRecord, reason: &str) -> anyhow::Result<()> {
        self.sink.info(
            component,
            format!("stale_record pid={} reason={reason} action=clear", record.pid),
        );
        self.store.clear()
    }

    /// Drop a record file that does not hold a pid at all.
    pub fn heal_unparsable(&self, component: &str, content: &str) -> anyhow::Result<()> {
        self.sink.info(
            component,
            format!("stale_record content={content:?} reason=unparsable action=clear"),
        );
        self.store.clear()
    }
}
