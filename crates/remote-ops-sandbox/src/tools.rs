//! Sandboxed tool execution.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Instant,
};

use command_group::AsyncCommandGroup;
use remote_ops_protocol::{
    Command, CommandResult, CommandStatus, ExecutionOutput, OutputStream, tool,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::{io::AsyncReadExt, sync::mpsc, task::JoinHandle};

use crate::paths::{normalize, resolve_within};
use crate::shell::get_shell_command;

/// Channel carrying streamed output events while a command runs.
pub type OutputSender = mpsc::UnboundedSender<ExecutionOutput>;

/// Executes one command at a time on behalf of the remote machine.
///
/// File access is confined to the project root and shell commands run rooted
/// in it. Each invocation is independent; the executor holds no cross-command
/// state.
pub struct ToolExecutor {
    project_root: PathBuf,
    output: Option<OutputSender>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteFileOutput {
    path: String,
    bytes_written: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadFileOutput {
    path: String,
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunCommandOutput {
    exit_code: Option<i32>,
    signal: Option<i32>,
    stdout: String,
    stderr: String,
    duration_ms: u64,
}

impl ToolExecutor {
    /// Create an executor scoped to `project_root`.
    ///
    /// A relative root is resolved against the current working directory.
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let root = project_root.into();
        let absolute = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&root))
                .unwrap_or(root)
        };
        Self {
            project_root: normalize(&absolute),
            output: None,
        }
    }

    /// Attach a channel that receives streamed output events.
    #[must_use]
    pub fn with_output(mut self, sender: OutputSender) -> Self {
        self.output = Some(sender);
        self
    }

    /// The confinement root.
    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Execute one command and report its outcome.
    ///
    /// Expected failures (bad parameters, traversal, non-zero exits,
    /// timeouts) come back as structured error results, never as `Err`.
    pub async fn execute(&self, command: &Command) -> CommandResult {
        match command.tool_name.as_str() {
            tool::WRITE_FILE => self.write_file(command).await,
            tool::READ_FILE => self.read_file(command).await,
            tool::RUN_COMMAND => self.run_command(command).await,
            other => {
                CommandResult::failure(&command.command_id, format!("unknown tool \"{other}\""))
            }
        }
    }

    async fn write_file(&self, command: &Command) -> CommandResult {
        let Some(path) = string_param(&command.parameters, "path") else {
            return CommandResult::failure(
                &command.command_id,
                "write-file requires a non-empty 'path' parameter",
            );
        };
        let content = command
            .parameters
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let target = match resolve_within(&self.project_root, &path) {
            Ok(target) => target,
            Err(err) => return CommandResult::failure(&command.command_id, err.to_string()),
        };

        if let Some(parent) = target.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                return CommandResult::failure(
                    &command.command_id,
                    format!("failed to create parent directories for \"{path}\": {err}"),
                );
            }
        }
        if let Err(err) = tokio::fs::write(&target, content.as_bytes()).await {
            return CommandResult::failure(
                &command.command_id,
                format!("failed to write \"{path}\": {err}"),
            );
        }

        success_payload(
            &command.command_id,
            &WriteFileOutput {
                path,
                bytes_written: content.len(),
            },
        )
    }

    async fn read_file(&self, command: &Command) -> CommandResult {
        let Some(path) = string_param(&command.parameters, "path") else {
            return CommandResult::failure(
                &command.command_id,
                "read-file requires a non-empty 'path' parameter",
            );
        };

        let target = match resolve_within(&self.project_root, &path) {
            Ok(target) => target,
            Err(err) => return CommandResult::failure(&command.command_id, err.to_string()),
        };

        match tokio::fs::read_to_string(&target).await {
            Ok(content) => success_payload(&command.command_id, &ReadFileOutput { path, content }),
            // Distinct from a traversal rejection: the path is inside the
            // root but missing or unreadable.
            Err(_) => CommandResult::failure(
                &command.command_id,
                format!("file \"{path}\" is not accessible for reading"),
            ),
        }
    }

    async fn run_command(&self, command: &Command) -> CommandResult {
        let Some(command_line) = string_param(&command.parameters, "command") else {
            return CommandResult::failure(
                &command.command_id,
                "run-command requires a non-empty 'command' parameter",
            );
        };
        let timeout_secs = seconds_param(&command.parameters, "timeoutSeconds");
        let env = env_param(&command.parameters);

        let (shell, shell_arg) = get_shell_command();
        let mut cmd = tokio::process::Command::new(shell);
        cmd.arg(shell_arg)
            .arg(&command_line)
            .current_dir(&self.project_root)
            .envs(env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        // Spawned as a process group so a timeout kill reaps the whole tree.
        let mut child = match cmd.group_spawn() {
            Ok(child) => child,
            Err(err) => {
                return CommandResult::failure(
                    &command.command_id,
                    format!("failed to spawn \"{command_line}\": {err}"),
                );
            }
        };

        let stdout_task = self.spawn_reader(
            child.inner().stdout.take(),
            &command.command_id,
            OutputStream::Stdout,
        );
        let stderr_task = self.spawn_reader(
            child.inner().stderr.take(),
            &command.command_id,
            OutputStream::Stderr,
        );

        let mut timed_out = false;
        let status = if let Some(secs) = timeout_secs {
            match tokio::time::timeout(std::time::Duration::from_secs_f64(secs), child.wait())
                .await
            {
                Ok(status) => status,
                Err(_) => {
                    timed_out = true;
                    self.emit(ExecutionOutput::info(
                        &command.command_id,
                        format!("command timed out after {secs}s"),
                    ));
                    if let Err(err) = child.start_kill() {
                        tracing::warn!("Failed to kill timed-out command: {err}");
                    }
                    child.wait().await
                }
            }
        } else {
            child.wait().await
        };

        let stdout = join_output(stdout_task).await;
        let stderr = join_output(stderr_task).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (exit_code, signal) = match &status {
            Ok(status) => (status.code(), exit_signal(status)),
            Err(_) => (None, None),
        };

        let error = if timed_out {
            // timeout_secs is always present on this branch
            let secs = timeout_secs.unwrap_or_default();
            Some(format!("command \"{command_line}\" timed out after {secs}s"))
        } else {
            match &status {
                Ok(status) if status.success() => None,
                Ok(status) => Some(if stderr.trim().is_empty() {
                    format!(
                        "command \"{command_line}\" failed with exit code {}",
                        status
                            .code()
                            .map_or_else(|| "unknown".to_string(), |code| code.to_string())
                    )
                } else {
                    stderr.trim().to_string()
                }),
                Err(err) => Some(format!("failed to wait for \"{command_line}\": {err}")),
            }
        };

        let payload = RunCommandOutput {
            exit_code,
            signal,
            stdout,
            stderr,
            duration_ms,
        };
        let result = match serde_json::to_value(&payload) {
            Ok(value) => Some(value),
            Err(err) => {
                return CommandResult::failure(&command.command_id, err.to_string());
            }
        };

        CommandResult {
            command_id: command.command_id.clone(),
            status: if error.is_none() {
                CommandStatus::Success
            } else {
                CommandStatus::Error
            },
            result,
            error,
        }
    }

    fn spawn_reader<R>(
        &self,
        reader: Option<R>,
        command_id: &str,
        stream: OutputStream,
    ) -> Option<JoinHandle<String>>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let mut reader = reader?;
        let command_id = command_id.to_string();
        let sink = self.output.clone();
        Some(tokio::spawn(async move {
            let mut accumulated = String::new();
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                        accumulated.push_str(&text);
                        if let Some(sink) = &sink {
                            let _ = sink.send(ExecutionOutput {
                                command_id: command_id.clone(),
                                stream,
                                data: text,
                            });
                        }
                    }
                }
            }
            accumulated
        }))
    }

    fn emit(&self, event: ExecutionOutput) {
        if let Some(sink) = &self.output {
            let _ = sink.send(event);
        }
    }
}

fn success_payload(command_id: &str, payload: &impl Serialize) -> CommandResult {
    match serde_json::to_value(payload) {
        Ok(value) => CommandResult::success(command_id, value),
        Err(err) => CommandResult::failure(command_id, err.to_string()),
    }
}

async fn join_output(task: Option<JoinHandle<String>>) -> String {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    }
}

fn string_param(parameters: &Map<String, Value>, key: &str) -> Option<String> {
    parameters
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn seconds_param(parameters: &Map<String, Value>, key: &str) -> Option<f64> {
    let seconds = match parameters.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }?;
    (seconds.is_finite() && seconds > 0.0).then_some(seconds)
}

fn env_param(parameters: &Map<String, Value>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Some(Value::Object(raw)) = parameters.get("env") {
        for (key, value) in raw {
            match value {
                Value::Null => {}
                Value::String(s) => {
                    env.insert(key.clone(), s.clone());
                }
                other => {
                    env.insert(key.clone(), other.to_string());
                }
            }
        }
    }
    env
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn command(tool_name: &str, parameters: Value) -> Command {
        let Value::Object(parameters) = parameters else {
            panic!("parameters must be an object")
        };
        Command::new("c1", tool_name, parameters)
    }

    #[tokio::test]
    async fn test_write_file_reports_bytes_written() {
        let dir = TempDir::new().unwrap();
        let executor = ToolExecutor::new(dir.path());

        let result = executor
            .execute(&command(
                tool::WRITE_FILE,
                json!({"path": "src/app.ts", "content": "hello"}),
            ))
            .await;

        assert!(result.is_success());
        let output = result.result.unwrap();
        assert_eq!(output["path"], "src/app.ts");
        assert_eq!(output["bytesWritten"], 5);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/app.ts")).unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn test_write_file_rejects_all_traversal_forms() {
        let dir = TempDir::new().unwrap();
        let executor = ToolExecutor::new(dir.path());

        for path in [
            "../outside.txt",
            "a/../../outside.txt",
            "/etc/passwd",
            "C:\\Windows\\system32\\drivers",
        ] {
            let result = executor
                .execute(&command(
                    tool::WRITE_FILE,
                    json!({"path": path, "content": "x"}),
                ))
                .await;

            assert_eq!(result.status, CommandStatus::Error, "accepted {path:?}");
            assert!(
                result
                    .error
                    .unwrap()
                    .contains("outside the project directory")
            );
        }
    }

    #[tokio::test]
    async fn test_write_file_accepts_absolute_path_inside_root() {
        let dir = TempDir::new().unwrap();
        let executor = ToolExecutor::new(dir.path());
        let inside = dir.path().join("notes.txt");

        let result = executor
            .execute(&command(
                tool::WRITE_FILE,
                json!({"path": inside.to_string_lossy(), "content": "ok"}),
            ))
            .await;

        assert!(result.is_success());
        assert_eq!(std::fs::read_to_string(inside).unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_write_file_requires_path() {
        let dir = TempDir::new().unwrap();
        let executor = ToolExecutor::new(dir.path());

        let result = executor
            .execute(&command(tool::WRITE_FILE, json!({"content": "x"})))
            .await;

        assert_eq!(result.status, CommandStatus::Error);
        assert!(result.error.unwrap().contains("path"));
    }

    #[tokio::test]
    async fn test_read_file_returns_content() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("greeting.txt"), "hello").unwrap();
        let executor = ToolExecutor::new(dir.path());

        let result = executor
            .execute(&command(tool::READ_FILE, json!({"path": "greeting.txt"})))
            .await;

        assert!(result.is_success());
        assert_eq!(result.result.unwrap()["content"], "hello");
    }

    #[tokio::test]
    async fn test_read_file_distinguishes_missing_from_traversal() {
        let dir = TempDir::new().unwrap();
        let executor = ToolExecutor::new(dir.path());

        let missing = executor
            .execute(&command(tool::READ_FILE, json!({"path": "nope.txt"})))
            .await;
        assert!(missing.error.unwrap().contains("not accessible"));

        let escaped = executor
            .execute(&command(tool::READ_FILE, json!({"path": "../nope.txt"})))
            .await;
        assert!(
            escaped
                .error
                .unwrap()
                .contains("outside the project directory")
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_error_result() {
        let dir = TempDir::new().unwrap();
        let executor = ToolExecutor::new(dir.path());

        let result = executor.execute(&command("deploy", json!({}))).await;

        assert_eq!(result.status, CommandStatus::Error);
        assert!(result.error.unwrap().contains("unknown tool"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_streams_and_succeeds() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = ToolExecutor::new(dir.path()).with_output(tx);

        let result = executor
            .execute(&command(
                tool::RUN_COMMAND,
                json!({"command": "printf out; printf err 1>&2"}),
            ))
            .await;

        assert!(result.is_success());
        let output = result.result.unwrap();
        assert_eq!(output["exitCode"], 0);
        assert_eq!(output["stdout"], "out");
        assert_eq!(output["stderr"], "err");

        drop(executor);
        let mut streams = Vec::new();
        while let Some(event) = rx.recv().await {
            streams.push(event.stream);
        }
        assert!(streams.contains(&OutputStream::Stdout));
        assert!(streams.contains(&OutputStream::Stderr));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_nonzero_exit_is_error() {
        let dir = TempDir::new().unwrap();
        let executor = ToolExecutor::new(dir.path());

        let result = executor
            .execute(&command(tool::RUN_COMMAND, json!({"command": "exit 3"})))
            .await;

        assert_eq!(result.status, CommandStatus::Error);
        assert_eq!(result.result.unwrap()["exitCode"], 3);
        assert!(result.error.unwrap().contains("exit code 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_timeout_keeps_partial_output() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = ToolExecutor::new(dir.path()).with_output(tx);

        let result = executor
            .execute(&command(
                tool::RUN_COMMAND,
                json!({"command": "echo started; sleep 5; echo finished", "timeoutSeconds": 1}),
            ))
            .await;

        assert_eq!(result.status, CommandStatus::Error);
        assert!(result.error.unwrap().contains("timed out"));
        let output = result.result.unwrap();
        assert_eq!(output["stdout"], "started\n");
        assert!(output["exitCode"].is_null());

        drop(executor);
        let mut saw_timeout_notice = false;
        while let Some(event) = rx.recv().await {
            if event.stream == OutputStream::Info && event.data.contains("timed out") {
                saw_timeout_notice = true;
            }
        }
        assert!(saw_timeout_notice);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_merges_env_overrides() {
        let dir = TempDir::new().unwrap();
        let executor = ToolExecutor::new(dir.path());

        let result = executor
            .execute(&command(
                tool::RUN_COMMAND,
                json!({"command": "printf \"$SANDBOX_TEST_VALUE\"", "env": {"SANDBOX_TEST_VALUE": "42"}}),
            ))
            .await;

        assert!(result.is_success());
        assert_eq!(result.result.unwrap()["stdout"], "42");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_requires_command() {
        let dir = TempDir::new().unwrap();
        let executor = ToolExecutor::new(dir.path());

        let result = executor
            .execute(&command(tool::RUN_COMMAND, json!({"command": ""})))
            .await;

        assert_eq!(result.status, CommandStatus::Error);
        assert!(result.error.unwrap().contains("'command' parameter"));
    }
}
