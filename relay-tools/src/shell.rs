use crate::error::{Result, ToolError};
use crate::safeguard::Safeguard;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

const OUTPUT_BYTES_MAX: usize = 10_000;
const CAPTURE_BYTES_MAX: usize = 64_000;
const COLLECTOR_GRACE: Duration = Duration::from_millis(500);
const CWD_MARKER: &str = "\n__CWD__:";
const NO_OUTPUT: &str = "(no output)";

#[derive(Debug, Clone)]
pub struct ShellPolicy {
    pub work_dir: PathBuf,
    pub timeout: Duration,
    /// Carry the shell's working directory from one command to the next.
    pub track_working_directory: bool,
    /// Leave commands that outlive this budget running detached instead of
    /// killing them. Only applies when shorter than `timeout`.
    pub background_after: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failed { exit_code: i32 },
    TimedOut,
    Backgrounded { pid: u32 },
}

#[derive(Debug, Clone)]
pub struct CommandRun {
    pub output: String,
    pub status: RunStatus,
}

impl CommandRun {
    /// Text recorded as the command's output in the conversation.
    pub fn render(&self) -> String {
        let mut rendered = match &self.status {
            RunStatus::Success => self.output.clone(),
            RunStatus::Failed { exit_code } => {
                format!("{}\nError: exit status: {exit_code}", self.output)
            }
            RunStatus::TimedOut => format!("{}\nError: command timed out", self.output),
            RunStatus::Backgrounded { pid } => {
                let so_far = if self.output.trim().is_empty() {
                    "(no output yet)"
                } else {
                    self.output.as_str()
                };
                format!("{so_far}\n[Process running in background, PID: {pid}]")
            }
        };
        if rendered.trim().is_empty() {
            rendered = NO_OUTPUT.to_string();
        }
        rendered
    }
}

/// Runs shell commands for a backend. Every command passes the safety gate
/// before a process is spawned.
pub struct ShellExecutor {
    policy: ShellPolicy,
    safeguard: Arc<Safeguard>,
    cwd: Mutex<PathBuf>,
}

impl ShellExecutor {
    pub fn new(policy: ShellPolicy, safeguard: Arc<Safeguard>) -> Self {
        let cwd = Mutex::new(policy.work_dir.clone());
        Self {
            policy,
            safeguard,
            cwd,
        }
    }

    pub fn current_dir(&self) -> PathBuf {
        match self.cwd.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => self.policy.work_dir.clone(),
        }
    }

    fn set_current_dir(&self, dir: PathBuf) {
        if let Ok(mut guard) = self.cwd.lock() {
            *guard = dir;
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(command = %command))]
    pub async fn run(&self, command: &str) -> Result<CommandRun> {
        self.safeguard.ensure_allowed(command)?;

        let cwd = self.current_dir();
        let script = if self.policy.track_working_directory {
            wrap_command_with_cwd_trailer(command, &cwd)
        } else {
            command.to_string()
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .current_dir(&self.policy.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to start command: {e}")))?;

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let mut collectors = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            collectors.push(spawn_output_collector(pipe, buffer.clone()));
        }
        if let Some(pipe) = child.stderr.take() {
            collectors.push(spawn_output_collector(pipe, buffer.clone()));
        }

        let detach = self
            .policy
            .background_after
            .filter(|budget| *budget < self.policy.timeout);
        let wait_budget = detach.unwrap_or(self.policy.timeout);
        let started = Instant::now();

        let status = match tokio::time::timeout(wait_budget, child.wait()).await {
            Ok(waited) => waited?,
            Err(_) => {
                if detach.is_some() {
                    let pid = child.id().unwrap_or_default();
                    tracing::info!(
                        pid,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "command still running; leaving it in the background"
                    );
                    tokio::spawn(async move {
                        let _ = child.wait().await;
                    });
                    let output = truncate_output(&read_output(&buffer));
                    return Ok(CommandRun {
                        output,
                        status: RunStatus::Backgrounded { pid },
                    });
                }

                tracing::warn!(
                    timeout_ms = self.policy.timeout.as_millis() as u64,
                    "command timed out; killing process"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill timed out command");
                }
                await_collectors(collectors).await;
                return Ok(CommandRun {
                    output: truncate_output(&read_output(&buffer)),
                    status: RunStatus::TimedOut,
                });
            }
        };
        await_collectors(collectors).await;

        let raw = read_output(&buffer);
        let output = if self.policy.track_working_directory {
            let (output, new_cwd) = extract_cwd(&raw, &cwd);
            if new_cwd != cwd {
                tracing::debug!(from = %cwd.display(), to = %new_cwd.display(), "working directory changed");
                self.set_current_dir(new_cwd);
            }
            output
        } else {
            raw
        };
        let output = truncate_output(&output);

        let status = if status.success() {
            RunStatus::Success
        } else {
            RunStatus::Failed {
                exit_code: status.code().unwrap_or(-1),
            }
        };
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            output_len = output.len(),
            status = ?status,
            "command finished"
        );
        Ok(CommandRun { output, status })
    }
}

fn wrap_command_with_cwd_trailer(command: &str, cwd: &Path) -> String {
    let quoted = sh_single_quote(&cwd.display().to_string());
    format!("cd {quoted} && {command}; echo; echo __CWD__:$(pwd)")
}

/// Splits the `__CWD__` trailer off raw output. Returns the clean output and
/// the directory the shell ended in.
fn extract_cwd(raw: &str, current: &Path) -> (String, PathBuf) {
    let Some(idx) = raw.rfind(CWD_MARKER) else {
        return (raw.to_string(), current.to_path_buf());
    };
    let trailer = raw[idx + CWD_MARKER.len()..].trim();
    let new_cwd = if trailer.is_empty() {
        current.to_path_buf()
    } else {
        PathBuf::from(trailer)
    };
    (raw[..idx].trim_end_matches('\n').to_string(), new_cwd)
}

fn truncate_output(output: &str) -> String {
    if output.len() <= OUTPUT_BYTES_MAX {
        return output.to_string();
    }
    let mut end = OUTPUT_BYTES_MAX;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (output truncated)", &output[..end])
}

fn sh_single_quote(raw: &str) -> String {
    let escaped = raw.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

fn spawn_output_collector<R>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => append_output(&buffer, &chunk[..n]),
            }
        }
    })
}

fn append_output(buffer: &Arc<Mutex<Vec<u8>>>, bytes: &[u8]) {
    if let Ok(mut guard) = buffer.lock() {
        let room = CAPTURE_BYTES_MAX.saturating_sub(guard.len());
        guard.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }
}

fn read_output(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
    match buffer.lock() {
        Ok(guard) => String::from_utf8_lossy(&guard).to_string(),
        Err(_) => String::new(),
    }
}

// Detached grandchildren can hold the pipes open; don't wait on them forever.
async fn await_collectors(collectors: Vec<JoinHandle<()>>) {
    for handle in collectors {
        let _ = tokio::time::timeout(COLLECTOR_GRACE, handle).await;
    }
}
