//! Process-backed task executor
//!
//! A task is an executable at `base_folder/task_folder/<task_id>`. It receives
//! the task data as one JSON argument and the task options in `GRID_TASK_OPTS`,
//! and reports its result as JSON on stdout.
//!
//! Triggers rotate over the configured instances. Each run is told its
//! instance in `GRID_TASK_INSTANCE` and that instance's port, offset from the
//! API port, in `GRID_TASK_PORT`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TaskExecutor;
use crate::config::{self, GridConfig};
use crate::error::{GridError, GridResult};
use crate::protocol::{TaskMeta, TriggerRequest};

/// Environment variable carrying the task options to the task process
pub const ENV_TASK_OPTS: &str = "GRID_TASK_OPTS";
/// Environment variable carrying the instance index of a run
pub const ENV_TASK_INSTANCE: &str = "GRID_TASK_INSTANCE";
/// Environment variable carrying the port of the run's instance
pub const ENV_TASK_PORT: &str = "GRID_TASK_PORT";

/// [`TaskExecutor`] that runs each trigger as a child process
#[derive(Debug)]
pub struct ProcessTaskExecutor {
    meta: Mutex<TaskMeta>,
    test_mode: bool,
    api_port: u16,
    next_instance: AtomicU32,
    /// Cancelled by `terminate`; running children are killed when it fires
    generation: Mutex<CancellationToken>,
}

impl ProcessTaskExecutor {
    pub fn new(config: &GridConfig) -> Self {
        let tasks = &config.tasks;
        Self {
            meta: Mutex::new(TaskMeta {
                instance_count: tasks.instances,
                json_conf: tasks.json_conf.clone(),
                task_folder: tasks.task_folder.clone(),
                env: tasks.env.clone(),
                base_folder: None,
            }),
            test_mode: config.test_mode,
            api_port: config.api_port,
            next_instance: AtomicU32::new(0),
            generation: Mutex::new(CancellationToken::new()),
        }
    }

    fn task_path(meta: &TaskMeta, task_id: &str) -> GridResult<PathBuf> {
        if task_id.is_empty()
            || task_id.contains(['/', '\\'])
            || task_id == "."
            || task_id == ".."
        {
            return Err(GridError::Task(format!("invalid task id {:?}", task_id)));
        }
        let base = meta
            .base_folder
            .as_ref()
            .ok_or_else(|| GridError::Task("task group not initialised".to_string()))?;
        Ok(base.join(&meta.task_folder).join(task_id))
    }

    /// Next instance in rotation and its port
    fn claim_instance(&self, instance_count: u32) -> GridResult<(u32, u16)> {
        let index = self.next_instance.fetch_add(1, Ordering::Relaxed) % instance_count.max(1);
        let port = config::task_port(self.api_port, index).ok_or_else(|| {
            GridError::Task(format!(
                "no port for instance {} above API port {}",
                index, self.api_port
            ))
        })?;
        Ok((index, port))
    }
}

#[async_trait]
impl TaskExecutor for ProcessTaskExecutor {
    fn set_task_meta(&self, meta: TaskMeta) {
        *self.meta.lock() = meta;
    }

    fn task_meta(&self) -> TaskMeta {
        self.meta.lock().clone()
    }

    async fn init_task_group(&self, meta: &TaskMeta) -> GridResult<()> {
        if let Some(conf) = &meta.json_conf {
            serde_json::from_str::<Value>(conf)
                .map_err(|e| GridError::Task(format!("invalid task configuration: {}", e)))?;
        }
        if self.test_mode {
            debug!(instances = meta.instance_count, "Test mode, skipping task folder check");
            return Ok(());
        }

        let base = meta
            .base_folder
            .as_ref()
            .ok_or_else(|| GridError::Task("no base folder for task group".to_string()))?;
        let folder = base.join(&meta.task_folder);
        match tokio::fs::metadata(&folder).await {
            Ok(m) if m.is_dir() => {
                info!(folder = %folder.display(), instances = meta.instance_count, "Task group ready");
                Ok(())
            }
            Ok(_) => Err(GridError::Task(format!("{} is not a folder", folder.display()))),
            Err(e) => Err(GridError::Task(format!("{}: {}", folder.display(), e))),
        }
    }

    async fn trigger_task(&self, request: TriggerRequest) -> GridResult<Value> {
        if self.test_mode {
            return Ok(json!({ "status": "ok", "task_id": request.task_id }));
        }

        let meta = self.task_meta();
        let program = Self::task_path(&meta, &request.task_id)?;
        let (instance, port) = self.claim_instance(meta.instance_count)?;
        let cancel = self.generation.lock().clone();

        debug!(task_id = %request.task_id, program = %program.display(), instance, port, "Running task");
        let child = Command::new(&program)
            .arg(request.task_data.to_string())
            .envs(&meta.env)
            .env(ENV_TASK_OPTS, request.task_opts.to_string())
            .env(ENV_TASK_INSTANCE, instance.to_string())
            .env(ENV_TASK_PORT, port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GridError::Task(format!("failed to start {}: {}", request.task_id, e)))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| GridError::Task(format!("{}: {}", request.task_id, e)))?,
            _ = cancel.cancelled() => {
                return Err(GridError::Task(format!("{} terminated", request.task_id)));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(task_id = %request.task_id, status = %output.status, "Task failed");
            return Err(GridError::Task(format!(
                "{} exited with {}: {}",
                request.task_id,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())))
    }

    async fn terminate(&self) {
        let previous = std::mem::replace(&mut *self.generation.lock(), CancellationToken::new());
        previous.cancel();
        info!("Terminated running tasks");
    }
}
