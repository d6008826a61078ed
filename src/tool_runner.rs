//! Deadline-bounded execution of external tools.
//!
//! `run_tool_safe` is the only place this crate spawns processes. It gives
//! every call the same treatment:
//!
//! - Process group isolation and registration in [`ChildRegistry`]
//! - stdout/stderr drained on reader threads so a chatty tool cannot block
//! - A hard deadline; on expiry the whole process group is killed and the
//!   call fails with `ZpbsError::Timeout`
//! - Dry-run refusal for tools that would change state

use crate::error::{Result, ZpbsError};
use crate::process_guard::{ChildRegistry, CommandProcessGroup, kill_process_group};
use crate::tool_args::ToolArgs;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How to run one tool invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    pub dry_run: bool,
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            stdin: None,
            dry_run: false,
        }
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Output from a tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` if terminated by a signal or skipped.
    pub exit_code: Option<i32>,
    pub success: bool,
    /// True when dry-run prevented the call.
    pub skipped: bool,
}

impl ToolOutput {
    fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            ..Self::default()
        }
    }

    /// Turn a non-zero exit into `ZpbsError::Command`.
    pub fn ensure_success(&self, program: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(ZpbsError::Command {
                program: program.to_string(),
                code: self.exit_code.unwrap_or(-1),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Execute a tool with typed arguments under a deadline.
///
/// A non-zero exit is returned as `Ok` with `success: false`; callers decide
/// whether that is an error. Spawn failures and timeouts are `Err`.
pub fn run_tool_safe<T: ToolArgs + ?Sized>(args: &T, opts: &RunOptions) -> Result<ToolOutput> {
    let program = args.program().to_string();

    if opts.dry_run && args.mutates() {
        info!("[dry-run] would run: {}", args.display());
        return Ok(ToolOutput::skipped());
    }

    let cli_args = args.to_cli_args();
    let env_vars = args.get_env_vars();
    let env_keys: Vec<&str> = env_vars.iter().map(|(k, _)| k.as_str()).collect();
    debug!(program = %program, args = ?cli_args, env = ?env_keys, timeout = ?opts.timeout, "running tool");

    let mut cmd = Command::new(&program);
    cmd.args(&cli_args)
        .envs(env_vars)
        .stdin(if opts.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    let mut child = cmd.spawn().map_err(|e| ZpbsError::Command {
        program: program.clone(),
        code: -1,
        stderr: format!("failed to start: {}", e),
    })?;
    let pid = child.id();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid);
    }

    let result = supervise(&mut child, &program, opts);

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }
    result
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> Option<JoinHandle<String>> {
    source.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default()
}

fn supervise(child: &mut Child, program: &str, opts: &RunOptions) -> Result<ToolOutput> {
    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let writer = match (child.stdin.take(), opts.stdin.clone()) {
        (Some(mut pipe), Some(input)) => Some(std::thread::spawn(move || {
            let _ = pipe.write_all(input.as_bytes());
        })),
        _ => None,
    };

    let deadline = Instant::now() + opts.timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!(program, timeout = ?opts.timeout, "deadline expired, killing process group");
            kill_process_group(child.id());
            let _ = child.kill();
            let _ = child.wait();
            collect(stdout);
            collect(stderr);
            return Err(ZpbsError::Timeout {
                command: program.to_string(),
                seconds: opts.timeout.as_secs(),
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    if let Some(handle) = writer {
        let _ = handle.join();
    }

    let output = ToolOutput {
        stdout: collect(stdout),
        stderr: collect(stderr),
        exit_code: status.code(),
        success: status.success(),
        skipped: false,
    };
    if !output.success {
        debug!(program, code = ?output.exit_code, stderr = %output.stderr.trim(), "tool exited non-zero");
    }
    Ok(output)
}
