//! Task action that runs a shell command

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use anvil_core::config::TaskConfig;
use anvil_tasks::fingerprint::sha256_hex;
use anvil_tasks::{ActionError, TaskAction, TaskContext};

/// Lines of stderr kept in a failure message
const STDERR_TAIL: usize = 20;

/// Runs `<shell> -c <command>` from the project root
#[derive(Debug, Clone)]
pub struct ShellAction {
    shell: String,
    command: String,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl ShellAction {
    pub fn new(shell: &str, task: &TaskConfig) -> Self {
        Self {
            shell: shell.to_string(),
            command: task.command.clone(),
            env: task.env.clone(),
            working_dir: task.working_dir.clone(),
        }
    }
}

#[async_trait]
impl TaskAction for ShellAction {
    async fn execute(&self, ctx: &TaskContext) -> Result<(), ActionError> {
        let cwd = match &self.working_dir {
            Some(dir) => ctx.resolve(dir),
            None => ctx.root_dir.clone(),
        };
        debug!(task = %ctx.id, command = %self.command, cwd = %cwd.display(), "running shell command");

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(&self.command)
            .current_dir(&cwd)
            .envs(&self.env)
            .env("ANVIL_TASK", ctx.id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ActionError::failed(format!("failed to spawn {}: {}", self.shell, e)))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            trace!(task = %ctx.id, "{}", line);
        }

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL)..].join("\n");
        Err(ActionError::Exit {
            code: output.status.code().unwrap_or(-1),
            stderr: tail,
        })
    }

    /// The command line, shell, environment and working directory identify the action
    fn implementation_hash(&self) -> String {
        let mut identity = format!("shell={}\0command={}\0", self.shell, self.command);
        for (key, value) in &self.env {
            identity.push_str(&format!("env:{}={}\0", key, value));
        }
        if let Some(dir) = &self.working_dir {
            identity.push_str(&format!("cwd={}\0", dir.display()));
        }
        sha256_hex(identity.as_bytes())
    }

    fn describe(&self) -> String {
        self.command.clone()
    }
}
