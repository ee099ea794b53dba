//! CLI entry point: config load, PID-file single-instance guard, UUID persistence, and
//! the supervisor boot (SPEC_FULL.md C.1, C.2).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use amplify_agent::config::{build_snapshot, read_ini_file, ConfigSnapshot, ConfigTank};
use amplify_agent::errors::AgentError;
use amplify_agent::httpclient::ReqwestHttpClient;
use amplify_agent::manager::AbstractManager;
use amplify_agent::nginx_manager::NginxManager;
use amplify_agent::object::Intervals;
use amplify_agent::observability::init_logging_with_level;
use amplify_agent::probe::LinuxProcProbe;
use amplify_agent::subprocess::TokioSubprocessRunner;
use amplify_agent::supervisor::Supervisor;
use amplify_agent::system_manager::SystemManager;
use amplify_agent::tank::ObjectTank;
use amplify_agent::version::Version;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "amplify-agent", version)]
struct Cli {
    /// Path to the agent's INI-style configuration file.
    #[arg(long, default_value = "/etc/amplify-agent/agent.conf")]
    config: PathBuf,

    /// Run config validation and exit without starting the supervisor.
    #[arg(long)]
    config_test: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if init_logging_with_level(cli.verbose, cli.quiet).is_err() {
        eprintln!("failed to initialize logging");
    }

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("\x1b[31mfatal:\x1b[0m {e}");
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<(), AgentError> {
    let ini = read_ini_file(&cli.config).map_err(|e| AgentError::ConfigInvalid(e.to_string()))?;
    let env: BTreeMap<String, String> = std::env::vars().collect();
    let mut snapshot = build_snapshot(&ini, &env);
    restore_uuid(&mut snapshot);
    snapshot.validate()?;

    if cli.config_test {
        println!("configuration OK");
        return Ok(());
    }

    acquire_pid_file(&snapshot.daemon.pid)?;

    let config = ConfigTank::new(snapshot.clone());
    let tank = Arc::new(ObjectTank::new());
    let probe = Arc::new(LinuxProcProbe);
    let http = Arc::new(
        ReqwestHttpClient::new(snapshot.cloud.api_timeout, snapshot.cloud.verify_ssl_cert, Version::current())
            .map_err(|e| AgentError::ConfigInvalid(e.to_string()))?,
    );

    let root_uuid = snapshot.credentials.uuid.clone().unwrap_or_default();
    let intervals = Intervals {
        meta: snapshot.nginx_container.poll_intervals.meta,
        metrics: snapshot.nginx_container.poll_intervals.metrics,
        configs: snapshot.nginx_container.poll_intervals.configs,
        logs: snapshot.nginx_container.poll_intervals.logs,
        discover: snapshot.nginx_container.poll_intervals.discover,
    };

    let subprocess: Arc<dyn amplify_agent::subprocess::SubprocessRunner> = Arc::new(TokioSubprocessRunner);

    // Manager init order is [system, nginx, status, api] then extensions
    // (spec.md section 4.8). `status`/`api` have no separate manager struct: NginxManager
    // registers their endpoints as child objects of the Nginx object it discovers.
    let managers: Vec<(&'static str, Arc<dyn AbstractManager>)> = vec![
        ("system", Arc::new(SystemManager::new(probe.clone(), root_uuid.clone(), intervals, false))),
        (
            "nginx",
            Arc::new(NginxManager::new(probe.clone(), subprocess, http.clone(), config.clone(), root_uuid, intervals)),
        ),
    ];

    let pid_path = snapshot.daemon.pid.clone();
    let supervisor = Supervisor::new(tank, http, config, probe, managers)
        .with_uuid_sink(Arc::new(move |uuid: &str| {
            if let Err(e) = persist_uuid(&pid_path, uuid) {
                tracing::warn!(error = %e, "failed to persist cloud-assigned uuid");
            }
        }));
    supervisor.run().await?;
    Ok(())
}

/// Refuses to start if `pid_path` names a still-live process (SPEC_FULL.md C.1).
fn acquire_pid_file(pid_path: &Path) -> Result<(), AgentError> {
    if let Ok(existing) = std::fs::read_to_string(pid_path) {
        if let Ok(pid) = existing.trim().parse::<i32>() {
            if process_is_alive(pid) {
                return Err(AgentError::AlreadyRunning(pid_path.display().to_string()));
            }
        }
    }
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AgentError::LogFileUnwritable(pid_path.display().to_string(), e.to_string()))?;
    }
    std::fs::write(pid_path, std::process::id().to_string())
        .map_err(|e| AgentError::LogFileUnwritable(pid_path.display().to_string(), e.to_string()))
}

#[cfg(unix)]
fn process_is_alive(pid: i32) -> bool {
    // Signal 0 performs existence/permission checks without delivering anything.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: i32) -> bool {
    false
}

/// Reads the cloud-assigned UUID from a file next to the PID file, if present
/// (SPEC_FULL.md C.2).
fn restore_uuid(snapshot: &mut ConfigSnapshot) {
    if snapshot.credentials.uuid.is_some() {
        return;
    }
    let uuid_path = uuid_path_for(&snapshot.daemon.pid);
    if let Ok(uuid) = std::fs::read_to_string(&uuid_path) {
        let uuid = uuid.trim().to_string();
        if !uuid.is_empty() {
            snapshot.credentials.uuid = Some(uuid);
        }
    }
}

/// Persists a freshly assigned UUID so a restart reuses the same root identity
/// (SPEC_FULL.md C.2).
fn persist_uuid(pid_path: &Path, uuid: &str) -> std::io::Result<()> {
    std::fs::write(uuid_path_for(pid_path), uuid)
}

fn uuid_path_for(pid_path: &Path) -> PathBuf {
    pid_path.with_extension("uuid")
}
