//! 内置的管道可执行单元

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use scheduler_domain::runnable::{
    PipelineFailure, PipelineRunnable, RunContext, RunOutcome, RunParams, RunnableRegistry,
};

const STDERR_TAIL_LINES: usize = 50;
const PROGRESS_PREFIX: &str = "records_processed=";

/// 注册所有内置入口
pub fn builtin_runnables() -> RunnableRegistry {
    let mut registry = RunnableRegistry::new();
    registry.register("shell", Arc::new(ShellRunnable));
    registry
}

#[derive(Debug, Deserialize)]
struct ShellParams {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    working_dir: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// 运行 `params.extra.command` 指定的外部命令
///
/// 没有 `args` 时通过 `sh -c` 执行整条命令。标准输出中形如
/// `records_processed=N` 的行会作为进度上报，最后一次的值作为处理记录数。
/// 收到取消信号时终止子进程。
#[derive(Debug, Default)]
pub struct ShellRunnable;

impl ShellRunnable {
    fn build_command(shell: &ShellParams, params: &RunParams, ctx: &RunContext) -> Command {
        let mut cmd = if shell.args.is_empty() {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&shell.command);
            cmd
        } else {
            let mut cmd = Command::new(&shell.command);
            cmd.args(&shell.args);
            cmd
        };

        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &shell.working_dir {
            cmd.current_dir(dir);
        }

        cmd.env("PIPELINE_NAME", &ctx.pipeline_name)
            .env("PIPELINE_EXECUTION_ID", ctx.execution_id.to_string())
            .env("PIPELINE_RUN_ID", ctx.run_id.to_string())
            .env("PIPELINE_ATTEMPT", ctx.attempt_number.to_string())
            .env("PIPELINE_DRY_RUN", params.dry_run.to_string());
        if let Some(mode) = &params.mode {
            cmd.env("PIPELINE_MODE", mode);
        }
        if let Some(since) = params.since {
            cmd.env("PIPELINE_SINCE", since.to_rfc3339());
        }
        for (key, value) in &shell.env {
            cmd.env(key, value);
        }
        cmd
    }
}

fn parse_progress(line: &str) -> Option<i64> {
    line.trim()
        .strip_prefix(PROGRESS_PREFIX)
        .and_then(|value| value.trim().parse().ok())
}

#[async_trait]
impl PipelineRunnable for ShellRunnable {
    async fn run(
        &self,
        params: RunParams,
        mut ctx: RunContext,
    ) -> Result<RunOutcome, PipelineFailure> {
        let shell: ShellParams =
            serde_json::from_value(serde_json::Value::Object(params.extra.clone()))
                .map_err(|e| PipelineFailure::new(format!("解析shell参数失败: {e}")))?;

        info!(
            "执行shell管道 {}: {} {:?}",
            ctx.pipeline_name, shell.command, shell.args
        );
        let mut child = Self::build_command(&shell, &params, &ctx)
            .spawn()
            .map_err(|e| PipelineFailure::new(format!("启动命令失败: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineFailure::new("无法获取stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineFailure::new("无法获取stderr"))?;

        let stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stdout_open = true;
        let mut records = None;

        let status = loop {
            tokio::select! {
                line = stdout_lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if let Some(count) = parse_progress(&line) {
                            records = Some(count);
                            ctx.report_progress(count);
                        } else {
                            debug!("[{}] {}", ctx.pipeline_name, line);
                        }
                    }
                    _ => stdout_open = false,
                },
                status = child.wait() => break status?,
                _ = ctx.cancelled() => {
                    warn!("管道 {} 收到取消信号，终止子进程", ctx.pipeline_name);
                    if let Err(e) = child.kill().await {
                        warn!("终止子进程失败: {}", e);
                    }
                    return Err(PipelineFailure::new("命令已被取消"));
                }
            }
        };

        while let Ok(Some(line)) = stdout_lines.next_line().await {
            if let Some(count) = parse_progress(&line) {
                records = Some(count);
                ctx.report_progress(count);
            }
        }
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(RunOutcome {
                records_processed: records,
                ..Default::default()
            })
        } else {
            let failure = PipelineFailure::new(format!("命令执行失败，退出码: {:?}", status.code()));
            Err(if stderr_tail.is_empty() {
                failure
            } else {
                failure.with_traceback(stderr_tail)
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    use scheduler_domain::runnable::ProgressReporter;
    use tokio::sync::watch;
    use uuid::Uuid;

    fn params(command: &str) -> RunParams {
        let mut extra = serde_json::Map::new();
        extra.insert("command".to_string(), serde_json::json!(command));
        RunParams {
            extra,
            ..Default::default()
        }
    }

    fn context(cancel: watch::Receiver<bool>) -> RunContext {
        let (progress, _rx) = ProgressReporter::channel();
        RunContext::new(Uuid::new_v4(), Uuid::new_v4(), "shell-test", 2, cancel, progress)
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("records_processed=42"), Some(42));
        assert_eq!(parse_progress("  records_processed= 7 "), Some(7));
        assert_eq!(parse_progress("loaded 42 rows"), None);
    }

    #[tokio::test]
    async fn test_success_reports_records() {
        let (_tx, rx) = watch::channel(false);
        let outcome = ShellRunnable
            .run(
                params("echo starting; echo records_processed=$PIPELINE_ATTEMPT"),
                context(rx),
            )
            .await
            .unwrap();
        assert_eq!(outcome.records_processed, Some(2));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_with_stderr() {
        let (_tx, rx) = watch::channel(false);
        let failure = ShellRunnable
            .run(params("echo broken >&2; exit 3"), context(rx))
            .await
            .unwrap_err();
        assert!(failure.message.contains('3'));
        assert_eq!(failure.traceback.as_deref(), Some("broken"));
    }

    #[tokio::test]
    async fn test_missing_command_is_rejected() {
        let (_tx, rx) = watch::channel(false);
        let failure = ShellRunnable
            .run(RunParams::default(), context(rx))
            .await
            .unwrap_err();
        assert!(failure.message.contains("shell"));
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { ShellRunnable.run(params("sleep 30"), context(rx)).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_builtin_registry() {
        assert!(builtin_runnables().contains("shell"));
    }
}
