use std::io;
use serde::{Deserialize, Serialize};

#[cfg(not(unix))]
compile_error!("process liveness checks need kill(2); only unix targets are supported");

/// Identity of a lock holder. The start time tells a recycled pid apart from
/// the original owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub pid: u32,
    /// Process start time in clock ticks since boot (`/proc/<pid>/stat` field 22)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ticks: Option<u64>,
}

impl Owner {
    /// Identity of the calling process
    pub fn current() -> Self {
        let pid = std::process::id();
        Self {
            pid,
            start_ticks: process_start_ticks(pid),
        }
    }

    pub fn from_pid(pid: u32) -> Self {
        Self { pid, start_ticks: None }
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PID {}", self.pid)
    }
}

/// Answers "does this owner still exist"
///
/// The lock registry only depends on this trait, so a lease or heartbeat
/// scheme can replace OS process visibility without touching it.
pub trait LivenessProbe {
    fn is_alive(&self, owner: &Owner) -> bool;
}

/// Liveness via `kill(pid, 0)` and the process start time
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessProbe;

impl LivenessProbe for ProcessProbe {
    fn is_alive(&self, owner: &Owner) -> bool {
        if !is_pid_alive(owner.pid) {
            return false;
        }
        match (owner.start_ticks, process_start_ticks(owner.pid)) {
            (Some(recorded), Some(current)) => recorded == current,
            _ => true,
        }
    }
}

/// Check whether a given PID is alive.
///
/// Uses `kill(pid, 0)` which checks for process existence without sending a
/// signal. EPERM means the process exists under another user.
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs the permission and existence checks only.
    let result = unsafe { libc::kill(pid_i32, 0) };
    if result == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Start time of `pid` in clock ticks since boot; `None` when unavailable
pub fn process_start_ticks(pid: u32) -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        parse_start_ticks(&stat)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        None
    }
}

/// Field 22 of `/proc/<pid>/stat`. The command name (field 2) is wrapped in
/// parentheses and may itself contain spaces or parentheses, so fields are
/// counted from the last `)`.
fn parse_start_ticks(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    // after_comm starts at field 3 (state)
    after_comm.split_whitespace().nth(19)?.parse().ok()
}
