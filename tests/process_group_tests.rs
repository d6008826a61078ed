//! Integration tests for child process supervision
//!
//! These tests verify that:
//! 1. A tool that outlives its deadline is killed together with its children
//! 2. Mutating tools are never spawned in dry-run mode
//! 3. Children started in their own process group can be signalled as a unit

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use zpbs::error::ZpbsError;
use zpbs::process_guard::CommandProcessGroup;
use zpbs::tool_args::ToolArgs;
use zpbs::tool_runner::{RunOptions, run_tool_safe};

/// Helper: Check if a process is alive (not dead or zombie)
fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid;

    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // 'Z' = zombie, 'X' = dead
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

/// Helper: Wait for a process to die with timeout
fn wait_for_process_death(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !is_process_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

/// `sh -c <script>` as a typed tool invocation.
struct Shell {
    script: String,
    mutates: bool,
}

impl ToolArgs for Shell {
    fn program(&self) -> &str {
        "sh"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-c".to_string(), self.script.clone()]
    }

    fn mutates(&self) -> bool {
        self.mutates
    }
}

// =============================================================================
// Deadlines
// =============================================================================

#[test]
fn test_timeout_kills_the_whole_process_group() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("grandchild.pid");

    let tool = Shell {
        script: format!("sleep 60 & echo $! > {}; wait", pid_file.display()),
        mutates: false,
    };

    let start = Instant::now();
    let result = run_tool_safe(&tool, &RunOptions::with_timeout(Duration::from_secs(1)));

    assert!(
        matches!(result, Err(ZpbsError::Timeout { .. })),
        "Expected timeout, got {:?}",
        result
    );
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "Runner should return shortly after the deadline"
    );

    let grandchild: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(
        wait_for_process_death(grandchild, Duration::from_secs(5)),
        "Background child {} should die with its group",
        grandchild
    );
}

#[test]
fn test_fast_tool_finishes_before_deadline() {
    let tool = Shell {
        script: "echo ready; echo warn >&2; exit 3".to_string(),
        mutates: false,
    };

    let output = run_tool_safe(&tool, &RunOptions::with_timeout(Duration::from_secs(10))).unwrap();
    assert_eq!(output.stdout.trim(), "ready");
    assert_eq!(output.stderr.trim(), "warn");
    assert_eq!(output.exit_code, Some(3));
    assert!(!output.success);
    assert!(output.ensure_success("sh").is_err());
}

#[test]
fn test_stdin_is_delivered() {
    let tool = Shell {
        script: "cat".to_string(),
        mutates: false,
    };
    let opts = RunOptions::with_timeout(Duration::from_secs(10)).stdin("summary body\n");

    let output = run_tool_safe(&tool, &opts).unwrap();
    assert_eq!(output.stdout, "summary body\n");
}

// =============================================================================
// Dry run
// =============================================================================

#[test]
fn test_dry_run_refuses_mutating_tools() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("touched");

    let tool = Shell {
        script: format!("touch {}", marker.display()),
        mutates: true,
    };
    let opts = RunOptions::with_timeout(Duration::from_secs(10)).dry_run(true);

    let output = run_tool_safe(&tool, &opts).unwrap();
    assert!(output.skipped);
    assert!(!marker.exists(), "Mutating tool must not run in dry-run mode");
}

#[test]
fn test_dry_run_still_runs_read_only_tools() {
    let tool = Shell {
        script: "echo listing".to_string(),
        mutates: false,
    };
    let opts = RunOptions::with_timeout(Duration::from_secs(10)).dry_run(true);

    let output = run_tool_safe(&tool, &opts).unwrap();
    assert!(!output.skipped);
    assert_eq!(output.stdout.trim(), "listing");
}

// =============================================================================
// Process groups
// =============================================================================

#[test]
fn test_spawn_and_kill_via_group() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let mut child = Command::new("sleep")
        .arg("1000")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .in_new_process_group()
        .spawn()
        .expect("Failed to spawn sleep");

    let pid = child.id();
    thread::sleep(Duration::from_millis(100));
    assert!(is_process_alive(pid), "Child should be running");

    // The child leads its own group, so -pid addresses the group
    kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL).expect("Failed to signal group");
    let _ = child.wait();

    assert!(!is_process_alive(pid), "Child should be dead after group kill");
}
