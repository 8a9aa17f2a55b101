// =============================================================================
// External Producer Supervision
// =============================================================================
//
// The supervisor rescans the plugins directory on a fixed cadence and keeps
// one reader task per discovered producer executable (files ending in
// `.plugin`). A reader spawns the producer with a piped stdout, feeds every
// line through the protocol state machine, and reacts to faults:
//
//   protocol fault / DISABLE   terminate with SIGTERM, mark disabled,
//                              never respawn
//   exit without useful output mark unusable, never respawn
//   clean exit                 sleep update_every, respawn from scratch
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::ingest::line_protocol::{ProducerSession, ProtocolError};
use crate::rrd::registry::ChartRegistry;
use crate::stats::EngineStats;

pub const PLUGIN_SUFFIX: &str = ".plugin";

/// True for file names the supervisor treats as producers.
pub fn is_plugin_file(name: &str) -> bool {
    name.len() > PLUGIN_SUFFIX.len() && name.ends_with(PLUGIN_SUFFIX)
}

/// Producer display id from its file name (`apps.plugin` -> `plugin:apps`).
pub fn plugin_id(name: &str) -> String {
    format!("plugin:{}", name.trim_end_matches(PLUGIN_SUFFIX))
}

// =============================================================================
// Supervisor
// =============================================================================

struct PluginSlot {
    /// The reader task is alive (spawning, reading, or sleeping to respawn).
    running: Arc<AtomicBool>,
}

/// Scan the plugins directory forever, spawning a reader for every
/// executable that is not already supervised. Runs until the process exits.
pub async fn run_supervisor(registry: Arc<ChartRegistry>, stats: Arc<EngineStats>) {
    let config = registry.config().clone();
    let dir = config.plugins_directory.clone();
    let scan_every = config.plugins_check_every.max(1);
    let update_every = config.update_every;

    let mut slots: HashMap<String, PluginSlot> = HashMap::new();

    loop {
        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !is_plugin_file(&name) {
                        continue;
                    }

                    let alive = slots
                        .get(&name)
                        .map(|s| s.running.load(Ordering::Relaxed))
                        .unwrap_or(false);
                    if alive {
                        continue;
                    }

                    let running = Arc::new(AtomicBool::new(true));
                    slots.insert(
                        name.clone(),
                        PluginSlot {
                            running: running.clone(),
                        },
                    );

                    let path = entry.path();
                    let registry = registry.clone();
                    let stats = stats.clone();
                    info!(producer = %plugin_id(&name), path = %path.display(), "starting producer");
                    tokio::spawn(async move {
                        run_reader(registry, stats, path, update_every).await;
                        running.store(false, Ordering::Relaxed);
                    });
                }
            }
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "cannot scan plugins directory");
            }
        }

        tokio::time::sleep(Duration::from_secs(scan_every)).await;
    }
}

// =============================================================================
// Reader lifecycle
// =============================================================================

/// Outcome of one producer run, deciding the respawn policy.
enum RunOutcome {
    /// Clean exit with useful output: respawn after a delay.
    Respawn,
    /// Protocol fault, DISABLE, or useless output: stop supervising.
    Disable,
}

async fn run_reader(
    registry: Arc<ChartRegistry>,
    stats: Arc<EngineStats>,
    path: PathBuf,
    update_every: u32,
) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let id = plugin_id(&name);

    loop {
        match run_once(&registry, &stats, &path, &id, update_every).await {
            Ok(RunOutcome::Respawn) => {
                tokio::time::sleep(Duration::from_secs(update_every as u64)).await;
            }
            Ok(RunOutcome::Disable) => {
                info!(producer = %id, "producer disabled");
                return;
            }
            Err(e) => {
                error!(producer = %id, error = %e, "producer failed to run");
                return;
            }
        }
    }
}

async fn run_once(
    registry: &Arc<ChartRegistry>,
    stats: &Arc<EngineStats>,
    path: &Path,
    id: &str,
    update_every: u32,
) -> Result<RunOutcome> {
    let mut child = Command::new(path)
        .arg(update_every.to_string())
        .stdout(std::process::Stdio::piped())
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning producer {}", path.display()))?;

    let stdout = child
        .stdout
        .take()
        .context("producer has no stdout pipe")?;
    let mut lines = BufReader::new(stdout).lines();
    let mut session = ProducerSession::new(registry.clone(), id, update_every);
    let mut faulted = false;

    while let Ok(Some(line)) = lines.next_line().await {
        match session.handle_line(&line) {
            Ok(()) => {}
            Err(ProtocolError::Disabled) => {
                info!(producer = %id, "producer asked to be disabled");
                terminate(&mut child);
                faulted = true;
                break;
            }
            Err(e) => {
                error!(producer = %id, error = %e, "protocol fault, disabling producer");
                stats.count_producer_fault();
                terminate(&mut child);
                faulted = true;
                break;
            }
        }
    }

    let status = child.wait().await;
    match &status {
        Ok(code) => info!(producer = %id, status = %code, "producer exited"),
        Err(e) => warn!(producer = %id, error = %e, "failed to collect producer exit status"),
    }

    if faulted {
        return Ok(RunOutcome::Disable);
    }
    if !session.useful() {
        error!(producer = %id, "producer generated no useful output, marking unusable");
        return Ok(RunOutcome::Disable);
    }
    Ok(RunOutcome::Respawn)
}

/// Ask a child producer to terminate.
fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, error = %e, "failed to signal producer");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
