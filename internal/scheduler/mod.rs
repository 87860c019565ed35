use crate::config::ConfigStore;
use crate::errors::{CoreError, CoreResult};
use crate::executor::Executor;
use crate::models::{Schedule, SimplePeriod, Task};
use chrono::{DateTime, Local, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Maps declarative schedules onto a recurring cron calendar and dispatches
/// due tasks to the executor. Missed fires while a task is still running are
/// dropped.
pub struct Scheduler {
    config: Arc<ConfigStore>,
    executor: Arc<Executor>,
    entries: Mutex<HashMap<Uuid, ScheduleEntry>>,
}

struct ScheduleEntry {
    schedule: cron::Schedule,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Scheduler {
    pub fn new(config: Arc<ConfigStore>, executor: Arc<Executor>) -> Arc<Self> {
        Arc::new(Self {
            config,
            executor,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Register every enabled, non-manual task.
    pub fn start(self: &Arc<Self>) {
        for task in self.config.list_tasks() {
            if task.enabled && !task.schedule.is_manual() {
                if let Err(err) = self.schedule_task(task.id) {
                    tracing::error!(task = %task.name, error = %err, "failed to schedule task");
                }
            }
        }
        tracing::info!("scheduler started");
    }

    /// Halt all dispatch loops. In-flight executions are unaffected.
    pub fn stop(&self) {
        let mut entries = self.entries.lock().expect("entries lock");
        for (_, entry) in entries.drain() {
            entry.cancel.cancel();
            entry.handle.abort();
        }
        tracing::info!("scheduler stopped");
    }

    /// (Re-)register a task. Disabled and manual tasks end up unscheduled;
    /// the operation is idempotent.
    pub fn schedule_task(self: &Arc<Self>, task_id: Uuid) -> CoreResult<()> {
        let task = self.config.get_task(task_id)?;
        self.unschedule_task(task_id);
        if !task.enabled || task.schedule.is_manual() {
            return Ok(());
        }
        self.register(&task)
    }

    pub fn unschedule_task(&self, task_id: Uuid) {
        let mut entries = self.entries.lock().expect("entries lock");
        if let Some(entry) = entries.remove(&task_id) {
            entry.cancel.cancel();
            entry.handle.abort();
            tracing::info!(task_id = %task_id, "unscheduled task");
        }
    }

    /// Next fire time for a scheduled task.
    pub fn get_next_run(&self, task_id: Uuid) -> CoreResult<DateTime<Utc>> {
        let entries = self.entries.lock().expect("entries lock");
        let entry = entries
            .get(&task_id)
            .ok_or_else(|| CoreError::NotFound("task not scheduled".to_string()))?;
        next_occurrence(&entry.schedule, Local::now())
            .map(|next| next.with_timezone(&Utc))
            .ok_or_else(|| CoreError::NotFound("task not scheduled".to_string()))
    }

    /// Drop every entry and re-register from the current configuration.
    pub fn reload_schedules(self: &Arc<Self>) -> CoreResult<()> {
        tracing::info!("reloading task schedules");
        self.stop();
        let mut failures = 0;
        for task in self.config.list_tasks() {
            if task.enabled && !task.schedule.is_manual() {
                if let Err(err) = self.register(&task) {
                    tracing::error!(task = %task.name, error = %err, "failed to schedule task");
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            return Err(CoreError::Execution(format!(
                "failed to schedule {failures} task(s)"
            )));
        }
        Ok(())
    }

    fn register(self: &Arc<Self>, task: &Task) -> CoreResult<()> {
        let expr = schedule_to_cron(&task.schedule)?;
        let schedule = parse_cron(&expr)?;

        if let Some(next) = next_occurrence(&schedule, Local::now()) {
            if let Err(err) = self.config.update_task_schedule(
                task.id,
                None,
                Some(next.with_timezone(&Utc)),
            ) {
                tracing::warn!(error = %err, "failed to update task next run");
            }
            tracing::info!(
                task = %task.name,
                expr = %expr,
                next_run = %next.to_rfc3339(),
                "scheduled task"
            );
        }

        let cancel = CancellationToken::new();
        let handle = self.spawn_dispatch_loop(task, schedule.clone(), cancel.clone());
        self.entries.lock().expect("entries lock").insert(
            task.id,
            ScheduleEntry {
                schedule,
                cancel,
                handle,
            },
        );
        Ok(())
    }

    fn spawn_dispatch_loop(
        self: &Arc<Self>,
        task: &Task,
        schedule: cron::Schedule,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let executor = self.executor.clone();
        let config = self.config.clone();
        let task_id = task.id;
        let task_name = task.name.clone();
        tokio::spawn(async move {
            loop {
                let now = Local::now();
                let Some(next) = next_occurrence(&schedule, now) else {
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                tracing::info!(task = %task_name, "executing scheduled task");
                match executor.execute(task_id).await {
                    Ok(_) => {}
                    Err(CoreError::TaskRunning) => {
                        tracing::warn!(task = %task_name, "task still running, fire dropped");
                    }
                    Err(err) => {
                        tracing::error!(task = %task_name, error = %err, "failed to execute task");
                    }
                }
                if let Some(upcoming) = next_occurrence(&schedule, Local::now()) {
                    if let Err(err) = config.update_task_schedule(
                        task_id,
                        None,
                        Some(upcoming.with_timezone(&Utc)),
                    ) {
                        tracing::warn!(error = %err, "failed to update task next run");
                    }
                }
            }
        })
    }
}

/// Translate a declared schedule to a five-field cron expression.
pub fn schedule_to_cron(schedule: &Schedule) -> CoreResult<String> {
    match schedule {
        Schedule::Simple { simple_type } => Ok(simple_period_to_cron(*simple_type).to_string()),
        Schedule::Cron { cron_expr } => {
            if cron_expr.is_empty() {
                return Err(CoreError::Validation("cron expression is empty".to_string()));
            }
            Ok(cron_expr.clone())
        }
        Schedule::Manual => Err(CoreError::Validation(
            "manual tasks cannot be scheduled".to_string(),
        )),
    }
}

fn simple_period_to_cron(period: SimplePeriod) -> &'static str {
    match period {
        SimplePeriod::Hourly => "0 * * * *",
        SimplePeriod::Daily => "0 2 * * *",
        SimplePeriod::Weekly => "0 2 * * 0",
        SimplePeriod::Monthly => "0 2 1 * *",
    }
}

/// The cron parser wants a seconds field and names weekdays from 1=Sunday;
/// standard five-field expressions gain a leading zero and their numeric
/// day-of-week tokens (0 or 7 = Sunday) become unambiguous names.
fn normalize_cron_expr(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return expr.to_string();
    }
    format!(
        "0 {} {}",
        fields[..4].join(" "),
        normalize_day_of_week(fields[4])
    )
}

fn normalize_day_of_week(field: &str) -> String {
    const NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
    let mut out = String::new();
    for ch in field.chars() {
        match ch.to_digit(10) {
            Some(digit) => out.push_str(NAMES[(digit as usize) % 7]),
            None => out.push(ch),
        }
    }
    out
}

fn parse_cron(expr: &str) -> CoreResult<cron::Schedule> {
    cron::Schedule::from_str(&normalize_cron_expr(expr))
        .map_err(|err| CoreError::Validation(format!("invalid schedule: {err}")))
}

fn next_occurrence(
    schedule: &cron::Schedule,
    after: DateTime<Local>,
) -> Option<DateTime<Local>> {
    schedule.after(&after).next()
}
