// Interval Task Scheduler
//
// The scheduler capability consumed by autonomous thinking: tasks are
// registered by id, bound to a handler, and run on a fixed interval with a
// per-run timeout until unregistered.

use crate::error::{Result, RuntimeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

/// Future returned by a task handler
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Handler invoked on every tick of a task
pub type TaskHandler = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Definition of a periodic task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub id: String,
    pub description: String,
    pub interval: Duration,
    /// Runs exceeding this are abandoned and recorded as timed out
    pub timeout: Duration,
    /// Fire once right after binding instead of waiting a full interval
    pub run_immediately: bool,
}

/// The scheduler capability
pub trait Scheduler: Send + Sync {
    /// Register a task definition; re-registering replaces the previous one
    fn register(&self, task: TaskDef) -> Result<()>;

    /// Attach the handler for a registered task and start running it
    fn bind_handler(&self, id: &str, handler: TaskHandler) -> Result<()>;

    /// Stop and forget a task
    fn unregister(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskStatus {
    Success,
    Failed,
    Timeout,
}

/// Record of the most recent execution of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub error_message: Option<String>,
}

struct TaskSlot {
    def: TaskDef,
    join: Option<JoinHandle<()>>,
    runs: u64,
    last_run: Option<TaskRun>,
}

type Slots = Arc<Mutex<HashMap<String, TaskSlot>>>;

/// Tokio-backed [`Scheduler`]
///
/// Runs of the same task never overlap: the next tick waits for the current
/// run to finish or time out.
#[derive(Clone, Default)]
pub struct IntervalScheduler {
    slots: Slots,
}

impl IntervalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of registered tasks
    pub fn task_ids(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = slots.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of completed runs of a task
    pub fn run_count(&self, id: &str) -> u64 {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(id).map(|slot| slot.runs).unwrap_or(0)
    }

    pub fn last_run(&self, id: &str) -> Option<TaskRun> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(id).and_then(|slot| slot.last_run.clone())
    }

    /// Stop every task
    pub fn shutdown(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for (id, _slot) in slots.drain() {
            tracing::debug!("Scheduler task {} stopped", id);
        }
    }

    async fn run_once(slots: &Slots, def: &TaskDef, handler: &TaskHandler) {
        let started_at = Utc::now();
        let (status, error_message) = match timeout(def.timeout, handler()).await {
            Ok(Ok(())) => {
                tracing::debug!("Task {} completed", def.id);
                (TaskStatus::Success, None)
            }
            Ok(Err(e)) => {
                tracing::warn!("Task {} failed: {}", def.id, e);
                (TaskStatus::Failed, Some(e.to_string()))
            }
            Err(_) => {
                tracing::warn!("Task {} timed out after {:?}", def.id, def.timeout);
                (
                    TaskStatus::Timeout,
                    Some(format!("Timeout after {:?}", def.timeout)),
                )
            }
        };

        let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(&def.id) {
            slot.runs += 1;
            slot.last_run = Some(TaskRun {
                task_id: def.id.clone(),
                started_at,
                completed_at: Utc::now(),
                status,
                error_message,
            });
        }
    }
}

impl Scheduler for IntervalScheduler {
    fn register(&self, task: TaskDef) -> Result<()> {
        if task.interval.is_zero() {
            return Err(RuntimeError::Scheduler(format!(
                "task {}: interval must be positive",
                task.id
            )));
        }

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // dropping a slot aborts its loop
        slots.remove(&task.id);
        tracing::debug!("Registered task {} every {:?}", task.id, task.interval);
        slots.insert(
            task.id.clone(),
            TaskSlot {
                def: task,
                join: None,
                runs: 0,
                last_run: None,
            },
        );
        Ok(())
    }

    fn bind_handler(&self, id: &str, handler: TaskHandler) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| RuntimeError::Scheduler("no tokio runtime available".to_string()))?;

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| RuntimeError::Scheduler(format!("task {} is not registered", id)))?;

        if let Some(previous) = slot.join.take() {
            previous.abort();
        }

        let def = slot.def.clone();
        let task_slots = Arc::clone(&self.slots);
        slot.join = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(def.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            interval.tick().await;
            if def.run_immediately {
                Self::run_once(&task_slots, &def, &handler).await;
            }
            loop {
                interval.tick().await;
                Self::run_once(&task_slots, &def, &handler).await;
            }
        }));
        Ok(())
    }

    fn unregister(&self, id: &str) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.remove(id) {
            Some(_slot) => {
                tracing::debug!("Unregistered task {}", id);
                Ok(())
            }
            None => Err(RuntimeError::Scheduler(format!(
                "task {} is not registered",
                id
            ))),
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn def(id: &str, interval_ms: u64) -> TaskDef {
        TaskDef {
            id: id.to_string(),
            description: "test task".to_string(),
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(50),
            run_immediately: true,
        }
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> TaskHandler {
        Arc::new(move || -> TaskFuture {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[test]
    fn test_register_rejects_zero_interval() {
        let scheduler = IntervalScheduler::new();
        assert!(scheduler.register(def("zero", 0)).is_err());
    }

    #[test]
    fn test_bind_unregistered_task_fails() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        let scheduler = IntervalScheduler::new();
        let result = scheduler.bind_handler("missing", counting_handler(Arc::default()));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_task_runs_and_unregisters() {
        let scheduler = IntervalScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(def("tick", 10)).unwrap();
        scheduler
            .bind_handler("tick", counting_handler(Arc::clone(&counter)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(counter.load(Ordering::SeqCst) >= 2);
        assert!(scheduler.run_count("tick") >= 2);

        scheduler.unregister("tick").unwrap();
        let after = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after);
        assert!(scheduler.task_ids().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_recorded() {
        let scheduler = IntervalScheduler::new();
        scheduler.register(def("slow", 1_000)).unwrap();
        scheduler
            .bind_handler(
                "slow",
                Arc::new(|| -> TaskFuture {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(())
                    })
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let run = scheduler.last_run("slow").unwrap();
        assert_eq!(run.status, TaskStatus::Timeout);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_failure_is_recorded() {
        let scheduler = IntervalScheduler::new();
        scheduler.register(def("fail", 1_000)).unwrap();
        scheduler
            .bind_handler(
                "fail",
                Arc::new(|| -> TaskFuture {
                    Box::pin(async { Err(RuntimeError::Llm("down".to_string())) })
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let run = scheduler.last_run("fail").unwrap();
        assert_eq!(run.status, TaskStatus::Failed);
        assert!(run.error_message.unwrap().contains("down"));
        scheduler.shutdown();
    }
}
