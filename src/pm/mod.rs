pub mod build_info;
pub mod cli;
pub mod config;
pub mod error;
pub mod launcher;
pub mod liveness;
pub mod logging;
pub mod logsink;
pub mod pidstore;
pub mod schedule;
pub mod service;
pub mod shutdown;
pub mod status;
pub mod timer;
