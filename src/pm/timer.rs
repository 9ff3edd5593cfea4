use crate::pm::config::Trigger;
use crate::pm::schedule::parse_cron;
use chrono::{DateTime, Local, TimeZone, Timelike};
use cron::Schedule;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::time::Duration;

/// True when `schedule` has an occurrence exactly on the minute containing `now`.
pub fn is_due<Tz: TimeZone>(schedule: &Schedule, now: &DateTime<Tz>) -> bool {
    let target = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or_else(|| now.clone());
    let prev = target.clone() - chrono::Duration::seconds(1);
    schedule.after(&prev).next().is_some_and(|dt| dt == target)
}

/// Triggers due at `now` that have not fired in this minute yet. Marks them fired.
pub fn take_due<'a>(
    triggers: &'a [(Trigger, Schedule)],
    now: &DateTime<Local>,
    last_fired: &mut HashMap<usize, i64>,
) -> Vec<&'a Trigger> {
    let minute_key = now.timestamp() / 60;
    let mut due = vec![];
    for (idx, (trigger, schedule)) in triggers.iter().enumerate() {
        if last_fired.get(&idx).copied() == Some(minute_key) {
            continue;
        }
        if is_due(schedule, now) {
            last_fired.insert(idx, minute_key);
            due.push(trigger);
        }
    }
    due
}

fn sleep_to_next_minute() {
    let now_ms = Local::now().timestamp_millis();
    let next_minute_ms = ((now_ms / 60_000) + 1) * 60_000;
    let sleep_ms = (next_minute_ms - now_ms).clamp(1, 60_000);
    std::thread::sleep(Duration::from_millis(sleep_ms as u64));
}

/// Collect the exit status of `pid` if it is our child and has exited.
/// Returns true once there is nothing left to wait for.
fn reap(pid: i32) -> bool {
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(status) => {
            tracing::debug!(pid, ?status, "reaped worker");
            true
        }
        Err(_) => true,
    }
}

/// Foreground timer for hosts without cron. Wakes at each minute boundary and
/// hands every due trigger to `fire`, which returns the pid of any worker it
/// launched. Exited workers are reaped on the following ticks. Does not return.
pub fn run_timer_loop(triggers: &[Trigger], mut fire: impl FnMut(&Trigger) -> Option<i32>) -> anyhow::Result<()> {
    anyhow::ensure!(!triggers.is_empty(), "no schedule triggers configured");
    let compiled = triggers
        .iter()
        .map(|t| parse_cron(&t.cron).map(|s| (t.clone(), s)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    tracing::info!(triggers = compiled.len(), "schedule loop running");

    let mut last_fired: HashMap<usize, i64> = HashMap::new();
    let mut children: Vec<i32> = vec![];
    loop {
        sleep_to_next_minute();
        let now = Local::now();
        for t in take_due(&compiled, &now, &mut last_fired) {
            tracing::info!(action = %t.action, cron = %t.cron, "trigger due");
            children.extend(fire(t));
        }
        children.retain(|&pid| !reap(pid));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm::config::TriggerAction;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        // 2026-10-19 is a Monday.
        Local.with_ymd_and_hms(2026, 10, 19, h, m, s).single().unwrap()
    }

    #[test]
    fn due_only_within_the_matching_minute() {
        let s = parse_cron("25 8 * * 1-5").unwrap();
        assert!(is_due(&s, &at(8, 25, 0)));
        assert!(is_due(&s, &at(8, 25, 42)));
        assert!(!is_due(&s, &at(8, 24, 59)));
        assert!(!is_due(&s, &at(8, 26, 0)));
    }

    #[test]
    fn never_fires_twice_in_one_minute() {
        let t = Trigger {
            action: TriggerAction::Start,
            cron: "25 8 * * *".to_string(),
        };
        let compiled = vec![(t.clone(), parse_cron(&t.cron).unwrap())];
        let mut fired = HashMap::new();
        assert_eq!(take_due(&compiled, &at(8, 25, 1), &mut fired).len(), 1);
        assert!(take_due(&compiled, &at(8, 25, 30), &mut fired).is_empty());
        assert!(take_due(&compiled, &at(8, 26, 0), &mut fired).is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn exited_children_are_reaped() {
        let child = std::process::Command::new("sleep").arg("0.05").spawn().unwrap();
        let pid = child.id() as i32;
        drop(child);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !reap(pid) {
            assert!(std::time::Instant::now() < deadline, "child {pid} never exited");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
        // Not our child any more: nothing to wait for.
        assert!(reap(pid));
    }
}
