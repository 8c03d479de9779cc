//! Lifecycle scripts mapped in a node's `cloudify.interfaces.lifecycle`.

use crate::error::ProviderError;
use crate::runtime::blueprint::LifecycleOperation;
use crate::runtime::plan::{PlannedNode, ResolvedOperation};
use indexmap::IndexMap;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

const STDERR_TAIL_LINES: usize = 5;

/// One script execution, with everything exported to its environment.
#[derive(Debug, Clone, Copy)]
pub struct ScriptInvocation<'a> {
    pub deployment_id: &'a str,
    pub node: &'a PlannedNode,
    pub operation: LifecycleOperation,
    pub script: &'a ResolvedOperation,
    /// Resolved blueprint inputs.
    pub inputs: &'a IndexMap<String, Value>,
    pub resource_id: Option<&'a str>,
    pub base_dir: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptRunner;

impl ScriptRunner {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, invocation: &ScriptInvocation<'_>) -> Result<ScriptOutput, ProviderError> {
        let path = script_path(invocation.base_dir, &invocation.script.implementation);
        if !path.is_file() {
            return Err(ProviderError::fatal(
                "script_not_found",
                format!("script {} does not exist", path.display()),
            ));
        }
        // The child runs from `base_dir`, so a relative path would no longer resolve.
        let path = std::path::absolute(&path).unwrap_or(path);

        let mut cmd = command_for(&path);
        if let Some(dir) = invocation.base_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(environment(invocation));
        cmd.kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| {
            ProviderError::fatal("script_spawn", format!("failed to run {}: {}", path.display(), e))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        debug!(
            node = %invocation.node.name,
            operation = %invocation.operation,
            script = %path.display(),
            stdout = %stdout.trim_end(),
            stderr = %stderr.trim_end(),
            "Script finished"
        );

        let Some(code) = output.status.code() else {
            return Err(ProviderError::retryable(
                "script_signal",
                format!("{} terminated by signal", path.display()),
            ));
        };
        if code == 0 {
            return Ok(ScriptOutput {
                exit_code: code,
                stdout,
                stderr,
            });
        }

        let message = format!("{} exited with {}: {}", path.display(), code, tail(&stderr));
        let code_str = format!("exit_{}", code);
        match code {
            126 | 127 => Err(ProviderError::fatal(code_str, message)),
            _ => Err(ProviderError::retryable(code_str, message)),
        }
    }
}

fn script_path(base_dir: Option<&Path>, implementation: &str) -> PathBuf {
    let path = Path::new(implementation);
    match base_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

fn command_for(path: &Path) -> Command {
    let interpreter = match path.extension().and_then(|e| e.to_str()) {
        Some("sh") => Some("sh"),
        Some("bash") => Some("bash"),
        Some("py") => Some("python3"),
        _ => None,
    };
    match interpreter {
        Some(program) => {
            let mut cmd = Command::new(program);
            cmd.arg(path);
            cmd
        }
        None => Command::new(path),
    }
}

/// Variables exported to a lifecycle script.
pub fn environment(invocation: &ScriptInvocation<'_>) -> Vec<(String, String)> {
    let node = invocation.node;
    let mut env = vec![
        ("DEPLOYMENT_ID".to_string(), invocation.deployment_id.to_string()),
        ("NODE_NAME".to_string(), node.name.clone()),
        ("NODE_TYPE".to_string(), node.node_type.clone()),
        ("OPERATION".to_string(), invocation.operation.to_string()),
    ];
    if let Some(id) = invocation.resource_id {
        env.push(("RESOURCE_ID".to_string(), id.to_string()));
    }
    for (name, value) in invocation.inputs {
        env.push((format!("INPUT_{}", env_name(name)), env_value(value)));
    }
    for (name, value) in &node.properties {
        env.push((format!("PROPERTY_{}", env_name(name)), env_value(value)));
    }
    for (name, value) in &invocation.script.inputs {
        env.push((env_name(name), env_value(value)));
    }
    env
}

fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
