//! The manager framework (spec.md section 4.4): periodic discover/start/schedule loops
//! that keep the `ObjectTank` in sync with the host, plus the launcher allow-list filter
//! that keeps the agent from trying to manage processes supervised by something it
//! doesn't understand.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::clock::CancelToken;
use crate::object::ObjectId;
use crate::subprocess::SubprocessRunner;
use crate::tank::ObjectTank;

/// Built-in supervisor process names a master process is allowed to run under
/// (spec.md section 4.4, "launcher allow-list"; `agent.launchers` config key extends it).
pub const DEFAULT_LAUNCHERS: &[&str] = &["supervisord", "supervisorctl", "runsv", "supervise", "mysqld_safe"];

/// How a freshly discovered definition compares to what is already registered
/// (spec.md section 4.4: "New / Restarted / Reloaded / Gone").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// No existing object shares this definition hash.
    New,
    /// Same definition hash, but the backing pid changed -- the master process restarted.
    Restarted { old_pid: i32, new_pid: i32 },
    /// Same definition hash and pid, but the object's `need_restart` flag is set --
    /// typically a config reload changed something the object must re-derive.
    Reloaded,
    /// Nothing changed this cycle.
    Unchanged,
    /// A previously discovered definition hash is no longer present on the host.
    Gone,
}

/// Classifies a rediscovery against the previously known pid and restart flag
/// (spec.md section 4.4; mirrors `NginxManager._discover_objects`'s pid/need_restart checks).
pub fn classify(existing_pid: i32, existing_needs_restart: bool, new_pid: i32) -> DiscoveryEvent {
    if existing_needs_restart {
        DiscoveryEvent::Reloaded
    } else if existing_pid != new_pid {
        DiscoveryEvent::Restarted { old_pid: existing_pid, new_pid }
    } else {
        DiscoveryEvent::Unchanged
    }
}

/// Checks whether `ppid`'s command line contains one of `launchers`
/// (spec.md section 4.4: "skip handling if master process is managed by an unsupported
/// launcher, and/or the launcher is itself inside a container").
///
/// A ppid of 0 or 1 means the process is owned directly by the kernel or init, which is
/// always supported.
pub async fn launcher_allowed(
    ppid: i32,
    subprocess: &dyn SubprocessRunner,
    launchers: &[String],
    timeout: Duration,
) -> anyhow::Result<bool> {
    if ppid == 0 || ppid == 1 {
        return Ok(true);
    }

    let pid_arg = ppid.to_string();
    let result = subprocess
        .run("ps", &["o", "ppid,command", &pid_arg], timeout)
        .await?;

    // First line is the header; the second (if present) is "<launcher_ppid> <command>".
    let Some(line) = result.stdout_lines.get(1) else {
        return Ok(false);
    };
    let Some((launcher_ppid_str, parent_command)) = line.trim().split_once(char::is_whitespace) else {
        return Ok(false);
    };

    if !launchers.iter().any(|l| parent_command.contains(l.as_str())) {
        debug!(ppid, parent_command, "launcher not in allow-list");
        return Ok(false);
    }

    if let Ok(launcher_ppid) = launcher_ppid_str.trim().parse::<i32>() {
        if launcher_ppid != 0 && launcher_ppid != 1 {
            debug!(ppid, "launcher is itself inside a container, skipping");
            return Ok(false);
        }
    }

    Ok(true)
}

/// Merges built-in launchers with operator-configured additions, preserving order and
/// de-duplicating (spec.md section 4.4, `agent.launchers` config key).
pub fn effective_launchers(configured: &[String]) -> Vec<String> {
    let mut out: Vec<String> = DEFAULT_LAUNCHERS.iter().map(|s| s.to_string()).collect();
    for l in configured {
        if !out.contains(l) {
            out.push(l.clone());
        }
    }
    out
}

/// Common lifecycle for every manager: wait, bump the trace action id, run once
/// (spec.md section 4.4: "Run loop: wait, increment action id, call manager run method").
#[async_trait]
pub trait AbstractManager: Send + Sync {
    fn interval(&self) -> Duration;
    async fn run_once(&self, tank: &ObjectTank);

    async fn run(self: Arc<Self>, tank: Arc<ObjectTank>, cancel: CancelToken) {
        loop {
            if !cancel.sleep(self.interval()).await {
                break;
            }
            let _trace = crate::observability::TraceContext::next();
            self.run_once(&tank).await;
        }
    }
}

/// A single discovered host entity together with its parent, for `ObjectManager`'s
/// generic start step (spec.md section 4.4: "start all discovered objects and their
/// children").
pub struct StartObjects<'a> {
    pub tank: &'a ObjectTank,
    pub root_id: Option<ObjectId>,
}

impl<'a> StartObjects<'a> {
    /// Starts every object of the manager's own types, plus their already-registered
    /// children (`ObjectManager._start_objects`).
    pub fn start_all(&self, ids: &[ObjectId]) {
        for id in ids {
            if let Some(obj) = self.tank.find_one(*id) {
                obj.start();
                for child in self.tank.find_children(*id) {
                    child.start();
                }
            }
        }
    }
}
