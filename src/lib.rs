//! pidmaster supervises exactly one long-running worker per config file.
//!
//! The worker is tracked through a PID record on disk, started detached from the
//! invoking session, stopped with a bounded grace period before SIGKILL, and
//! re-launched on a schedule through the host crontab (or the built-in timer).

pub mod pm;
