// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Cron-driven schedules
//!
//! Every active schedule gets its own task that sleeps until the next fire
//! time. Tasks inside one run execute in order; a failing task ends that run.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::client::{NodeClient, PowerAction};
use super::store::{PanelStore, Schedule, Task, TaskAction};
use crate::error::{AxisError, Result};
use crate::protocol::ServerStatus;

const MIN_DELAY_SECS: u64 = 1;
const MAX_DELAY_SECS: u64 = 300;

/// Parse a 5-field crontab line, or the 6/7-field form with seconds
pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    let full = match fields {
        5 => format!("0 {}", expr.trim()),
        6 | 7 => expr.trim().to_string(),
        _ => return Err(AxisError::invalid(format!("Cron expression needs 5 fields, got {}", fields))),
    };
    cron::Schedule::from_str(&full).map_err(|e| AxisError::invalid(format!("Invalid cron expression: {}", e)))
}

pub fn next_fire(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    Ok(parse_cron(expr)?.after(&after).next())
}

/// Delay payloads outside 1..=300 seconds are clamped
pub fn delay_for(payload: &str) -> Duration {
    let secs = payload.trim().parse::<u64>().unwrap_or(MIN_DELAY_SECS);
    Duration::from_secs(secs.clamp(MIN_DELAY_SECS, MAX_DELAY_SECS))
}

pub fn validate_tasks(tasks: &[Task]) -> Result<()> {
    for (i, task) in tasks.iter().enumerate() {
        match task.action {
            TaskAction::Command if task.payload.trim().is_empty() => {
                return Err(AxisError::invalid(format!("Task {} has an empty command", i + 1)));
            }
            TaskAction::Power => {
                PowerAction::from_str(&task.payload)?;
            }
            _ => {}
        }
    }
    Ok(())
}

pub struct Scheduler {
    client: Arc<NodeClient>,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(client: Arc<NodeClient>) -> Self {
        Self { client, jobs: Mutex::new(HashMap::new()) }
    }

    fn store(&self) -> &PanelStore {
        self.client.store()
    }

    /// Arm every active schedule; called once at panel start
    pub fn start_all(self: &Arc<Self>) {
        let ids: Vec<String> = self.store().read(|d| {
            d.schedules.values().filter(|s| s.is_active).map(|s| s.id.clone()).collect()
        });
        info!("Scheduler arming {} schedule(s)", ids.len());
        for id in ids {
            self.arm(&id);
        }
    }

    /// (Re)start the timer for a schedule after it was created or edited
    pub fn arm(self: &Arc<Self>, schedule_id: &str) {
        self.disarm(schedule_id);
        let scheduler = self.clone();
        let id = schedule_id.to_string();
        let handle = tokio::spawn(async move { scheduler.timer(&id).await });
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).insert(schedule_id.to_string(), handle);
    }

    pub fn disarm(&self, schedule_id: &str) {
        if let Some(handle) = self.jobs.lock().unwrap_or_else(|e| e.into_inner()).remove(schedule_id) {
            handle.abort();
        }
    }

    fn set_next(&self, schedule_id: &str, next: Option<DateTime<Utc>>) {
        self.store().write_logged("schedule", |d| {
            if let Some(s) = d.schedules.get_mut(schedule_id) {
                s.next_run_at = next;
            }
            Ok(())
        });
    }

    async fn timer(&self, schedule_id: &str) {
        loop {
            let Ok(schedule) = self.store().schedule(schedule_id) else { break };
            if !schedule.is_active {
                break;
            }
            let next = match next_fire(&schedule.cron, Utc::now()) {
                Ok(Some(next)) => next,
                Ok(None) => {
                    info!("Schedule {} has no future fire times", schedule.name);
                    self.set_next(schedule_id, None);
                    break;
                }
                Err(e) => {
                    warn!("Schedule {} disabled: {}", schedule.name, e);
                    break;
                }
            };
            self.set_next(schedule_id, Some(next));
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            debug!("Schedule {} fires in {:?}", schedule.name, wait);
            tokio::time::sleep(wait).await;

            if !self.fire(schedule_id).await {
                break;
            }
        }
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).remove(schedule_id);
    }

    /// One scheduled fire. Returns false when the timer should stop.
    async fn fire(&self, schedule_id: &str) -> bool {
        let Ok(schedule) = self.store().schedule(schedule_id) else { return false };
        if !schedule.is_active {
            return false;
        }
        if schedule.only_when_online {
            match self.client.status(&schedule.server_id).await {
                Ok((ServerStatus::Running, _)) => {}
                Ok((status, _)) => {
                    debug!("Schedule {} skipped, server is {:?}", schedule.name, status);
                    return true;
                }
                Err(e) => {
                    warn!("Schedule {} skipped, status unavailable: {}", schedule.name, e);
                    return true;
                }
            }
        }
        self.execute(&schedule).await;
        true
    }

    /// Run now regardless of the cron timing or `only_when_online`
    pub fn run_now(self: &Arc<Self>, schedule_id: &str) -> Result<()> {
        let schedule = self.store().schedule(schedule_id)?;
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.execute(&schedule).await });
        Ok(())
    }

    async fn execute(&self, schedule: &Schedule) {
        info!("Running schedule {} ({} task(s)) for {}", schedule.name, schedule.tasks.len(), schedule.server_id);
        for (i, task) in schedule.tasks.iter().enumerate() {
            if let Err(e) = self.run_task(&schedule.server_id, task).await {
                error!("Schedule {} stopped at task {}: {}", schedule.name, i + 1, e);
                break;
            }
        }

        let now = Utc::now();
        let next = next_fire(&schedule.cron, now).ok().flatten();
        self.store().write_logged("schedule", |d| {
            if let Some(s) = d.schedules.get_mut(&schedule.id) {
                s.last_run_at = Some(now);
                s.next_run_at = next;
            }
            Ok(())
        });
    }

    async fn run_task(&self, server_id: &str, task: &Task) -> Result<()> {
        match task.action {
            TaskAction::Command => self.client.send_command(server_id, &task.payload).await,
            TaskAction::Power => self.client.power(server_id, task.payload.parse()?).await,
            TaskAction::Delay => {
                tokio::time::sleep(delay_for(&task.payload)).await;
                Ok(())
            }
            TaskAction::Backup => {
                let name = Some(task.payload.trim()).filter(|n| !n.is_empty());
                self.client.create_backup(server_id, name).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::store::tests::seeded;
    use chrono::TimeZone;

    fn schedule(id: &str, tasks: Vec<Task>) -> Schedule {
        Schedule {
            id: id.into(),
            server_id: "s1".into(),
            name: id.into(),
            cron: "*/5 * * * *".into(),
            tasks,
            is_active: true,
            only_when_online: false,
            last_run_at: None,
            next_run_at: None,
        }
    }

    fn scheduler() -> Arc<Scheduler> {
        let client = NodeClient::new(Arc::new(seeded()), false).unwrap();
        Arc::new(Scheduler::new(Arc::new(client)))
    }

    #[test]
    fn crontab_lines_gain_a_seconds_field() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 2, 30).unwrap();
        let next = next_fire("*/5 * * * *", at).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).unwrap());
        assert!(parse_cron("0 0 4 * * *").is_ok());
        assert!(parse_cron("* *").is_err());
        assert!(parse_cron("61 * * * *").is_err());
    }

    #[test]
    fn delays_are_clamped() {
        assert_eq!(delay_for("0"), Duration::from_secs(1));
        assert_eq!(delay_for("30"), Duration::from_secs(30));
        assert_eq!(delay_for("9000"), Duration::from_secs(300));
        assert_eq!(delay_for("soon"), Duration::from_secs(1));
    }

    #[test]
    fn task_payloads_are_checked() {
        let ok = vec![
            Task { action: TaskAction::Command, payload: "say backup soon".into() },
            Task { action: TaskAction::Power, payload: "restart".into() },
            Task { action: TaskAction::Backup, payload: String::new() },
        ];
        assert!(validate_tasks(&ok).is_ok());
        assert!(validate_tasks(&[Task { action: TaskAction::Power, payload: "reboot".into() }]).is_err());
        assert!(validate_tasks(&[Task { action: TaskAction::Command, payload: " ".into() }]).is_err());
    }

    #[tokio::test]
    async fn inactive_or_missing_schedules_stop_the_timer() {
        let s = scheduler();
        let mut off = schedule("off", vec![]);
        off.is_active = false;
        s.store().write(|d| {
            d.schedules.insert(off.id.clone(), off.clone());
            Ok(())
        }).unwrap();
        assert!(!s.fire("off").await);
        assert!(!s.fire("missing").await);
    }

    #[tokio::test]
    async fn a_run_stamps_last_and_next() {
        let s = scheduler();
        let empty = schedule("empty", vec![]);
        s.store().write(|d| {
            d.schedules.insert(empty.id.clone(), empty.clone());
            Ok(())
        }).unwrap();

        assert!(s.fire("empty").await);
        let after = s.store().schedule("empty").unwrap();
        assert!(after.last_run_at.is_some());
        assert!(after.next_run_at.unwrap() > after.last_run_at.unwrap());
    }
}
