use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::{Result, StevedoreError};
use crate::model::TaskSpec;

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExit {
    pub exit_code: Option<i32>,
    pub message: String,
}

impl TaskExit {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A started task.
#[async_trait]
pub trait TaskHandle: Send {
    /// Wait for the task to exit.
    async fn wait(&mut self) -> TaskExit;
    async fn kill(&mut self);
}

/// Narrow interface to whatever actually runs workloads.
#[async_trait]
pub trait TaskDriver: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&self, alloc_id: Uuid, task: &TaskSpec) -> Result<Box<dyn TaskHandle>>;
}

/// Handle over a local child process.
pub struct ProcessHandle {
    child: Child,
    /// Extra cleanup run on kill, e.g. removing a container.
    on_kill: Option<Vec<String>>,
}

#[async_trait]
impl TaskHandle for ProcessHandle {
    async fn wait(&mut self) -> TaskExit {
        match self.child.wait().await {
            Ok(status) => TaskExit {
                exit_code: status.code(),
                message: match status.code() {
                    Some(code) => format!("exit code {}", code),
                    None => "terminated by signal".to_string(),
                },
            },
            Err(e) => TaskExit {
                exit_code: None,
                message: e.to_string(),
            },
        }
    }

    async fn kill(&mut self) {
        if let Some(cmd) = &self.on_kill {
            if let Some((program, args)) = cmd.split_first() {
                let _ = Command::new(program)
                    .args(args)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
            }
        }
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "Kill on exited task");
        }
    }
}

/// Runs the task command directly on the host.
#[derive(Debug, Default, Clone)]
pub struct ExecDriver;

#[async_trait]
impl TaskDriver for ExecDriver {
    fn name(&self) -> &'static str {
        "exec"
    }

    async fn start(&self, alloc_id: Uuid, task: &TaskSpec) -> Result<Box<dyn TaskHandle>> {
        tracing::info!(alloc_id = %alloc_id, command = %task.command, "Starting task");
        let child = Command::new(&task.command)
            .args(&task.args)
            .envs(&task.env)
            .env("STEVEDORE_ALLOC_ID", alloc_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(ProcessHandle {
            child,
            on_kill: None,
        }))
    }
}

/// Runs tasks in sandboxed Docker containers:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits from the task resources
#[derive(Debug, Clone)]
pub struct DockerDriver {
    config: SandboxConfig,
}

impl DockerDriver {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn container_name(alloc_id: Uuid) -> String {
        format!("stevedore-{}", alloc_id)
    }

    /// Arguments to `docker` for running `task`.
    pub fn run_args(&self, alloc_id: Uuid, task: &TaskSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            format!("--name={}", Self::container_name(alloc_id)),
        ];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if task.resources.memory_mb > 0 {
            args.push(format!("--memory={}m", task.resources.memory_mb));
        }
        if task.resources.cpu > 0 {
            args.push(format!("--cpus={:.2}", task.resources.cpu as f64 / 1000.0));
        }

        // Security: drop all capabilities, no new privileges
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        for (key, value) in &task.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(task.image.clone().unwrap_or_else(|| self.config.image.clone()));
        args.push(task.command.clone());
        args.extend(task.args.iter().cloned());
        args
    }
}

#[async_trait]
impl TaskDriver for DockerDriver {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn start(&self, alloc_id: Uuid, task: &TaskSpec) -> Result<Box<dyn TaskHandle>> {
        let args = self.run_args(alloc_id, task);
        let image = task.image.as_deref().unwrap_or(&self.config.image);
        tracing::info!(alloc_id = %alloc_id, image, command = %task.command, "Starting container");
        let child = Command::new("docker")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(ProcessHandle {
            child,
            on_kill: Some(vec![
                "docker".to_string(),
                "rm".to_string(),
                "-f".to_string(),
                Self::container_name(alloc_id),
            ]),
        }))
    }
}

/// Drivers available on this node, by name.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn TaskDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `exec` and `docker`.
    pub fn with_defaults(sandbox: SandboxConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ExecDriver));
        registry.register(Arc::new(DockerDriver::new(sandbox)));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn TaskDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn TaskDriver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| StevedoreError::Internal(format!("unknown task driver {:?}", name)))
    }
}
