use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{ExecutionResult, Executor};

/// Runs prompts through the `claude` CLI in non-interactive mode.
pub struct ClaudeCodeExecutor {
    permissions: Vec<String>,
    append_system_prompt: Option<String>,
}

impl ClaudeCodeExecutor {
    pub fn new(permissions: Vec<String>, append_system_prompt: Option<String>) -> Self {
        Self {
            permissions,
            append_system_prompt,
        }
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];

        if let Some(prompt) = &self.append_system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.clone());
        }

        if self.permissions.is_empty() {
            args.push("--dangerously-skip-permissions".to_string());
        } else {
            args.push("--allowedTools".to_string());
            args.push(self.permissions.join(","));
        }

        args.push("-".to_string()); // read from stdin
        args
    }
}

/// Accumulates the parts of a stream-json transcript we keep.
#[derive(Debug, Default)]
struct StreamState {
    result_text: Option<String>,
    cost_usd: f64,
    num_turns: u64,
}

impl StreamState {
    fn consume_line(&mut self, line: &str) {
        let Ok(event) = serde_json::from_str::<serde_json::Value>(line) else {
            return;
        };
        match event.get("type").and_then(|v| v.as_str()).unwrap_or("unknown") {
            "system" => {
                tracing::debug!(source = "claude", "Session initialized");
            }
            "assistant" => {
                let blocks = event
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_array());
                for block in blocks.into_iter().flatten() {
                    if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                        let tool = block.get("name").and_then(|v| v.as_str()).unwrap_or("?");
                        tracing::debug!(source = "claude", tool, "Tool: {}", tool);
                    }
                }
            }
            "result" => {
                self.cost_usd = event
                    .get("total_cost_usd")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                self.num_turns = event.get("num_turns").and_then(|v| v.as_u64()).unwrap_or(0);
                self.result_text = event
                    .get("result")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                tracing::debug!(
                    source = "claude",
                    cost = format_args!("${:.4}", self.cost_usd),
                    turns = self.num_turns,
                    "Claude finished",
                );
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Executor for ClaudeCodeExecutor {
    async fn execute(
        &self,
        prompt: &str,
        working_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let args = self.build_args();

        let mut child = Command::new("claude")
            .args(&args)
            .current_dir(working_dir)
            .env_remove("CLAUDECODE")
            .env("CLAUDECODE", "")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn claude process")?;

        {
            let mut stdin = child.stdin.take().context("claude stdin not piped")?;
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                let _ = child.kill().await;
                return Err(e).context("failed to write prompt to stdin");
            }
        }

        let stderr = child.stderr.take().context("claude stderr not piped")?;
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    tracing::debug!(source = "claude-stderr", "{}", line);
                }
            }
        });

        let stdout = child.stdout.take().context("claude stdout not piped")?;
        let stdout_handle = tokio::spawn(async move {
            let mut state = StreamState::default();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    state.consume_line(&line);
                }
            }
            state
        });

        let status = tokio::select! {
            status = child.wait() => status.context("failed to wait on claude")?,
            _ = cancel.cancelled() => {
                tracing::warn!("claude process cancelled, killing");
                let _ = child.kill().await;
                stderr_handle.abort();
                stdout_handle.abort();
                anyhow::bail!("claude process cancelled");
            }
        };
        let _ = stderr_handle.await;
        let state = stdout_handle.await.unwrap_or_default();

        if !status.success() {
            anyhow::bail!("claude exited with {}", status);
        }

        Ok(ExecutionResult {
            text: state.result_text.unwrap_or_default(),
            cost_usd: state.cost_usd,
            num_turns: state.num_turns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_with_permissions() {
        let executor = ClaudeCodeExecutor::new(
            vec!["WebFetch".to_string(), "Read".to_string()],
            None,
        );
        let args = executor.build_args();
        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"--allowedTools".to_string()));
        assert!(args.contains(&"WebFetch,Read".to_string()));
        assert!(!args.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn test_build_args_no_permissions_uses_dangerous() {
        let executor = ClaudeCodeExecutor::new(vec![], None);
        let args = executor.build_args();
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!args.contains(&"--allowedTools".to_string()));
    }

    #[test]
    fn test_build_args_system_prompt_and_stdin() {
        let executor =
            ClaudeCodeExecutor::new(vec![], Some("You are a sales analyst.".to_string()));
        let args = executor.build_args();
        let idx = args
            .iter()
            .position(|a| a == "--append-system-prompt")
            .unwrap();
        assert_eq!(args[idx + 1], "You are a sales analyst.");
        assert_eq!(args.last().unwrap(), "-");
    }

    #[test]
    fn test_stream_state_captures_result() {
        let mut state = StreamState::default();
        state.consume_line(r#"{"type":"system","subtype":"init"}"#);
        state.consume_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"WebFetch"}]}}"#,
        );
        state.consume_line(
            r#"{"type":"result","result":"Hosting: AWS","total_cost_usd":0.0123,"num_turns":3}"#,
        );
        assert_eq!(state.result_text.as_deref(), Some("Hosting: AWS"));
        assert_eq!(state.num_turns, 3);
        assert!((state.cost_usd - 0.0123).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stream_state_ignores_garbage() {
        let mut state = StreamState::default();
        state.consume_line("not json");
        state.consume_line(r#"{"type":"result"}"#);
        assert!(state.result_text.is_none());
        assert_eq!(state.num_turns, 0);
    }
}
