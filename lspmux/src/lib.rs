// Used by the lspmux binary.
use {humantime as _, seahorse as _, tracing_appender as _, tracing_subscriber as _};

#[macro_use]
extern crate tracing;

pub mod client;
pub mod daemon;
pub mod resolve;
pub mod store;

use std::path::PathBuf;

use anyhow::Context as _;
use lsp_mux::registry;

use crate::store::{DaemonDir, DaemonMeta, DaemonStatus};

#[derive(Debug)]
pub struct ConnectCfg {
    pub server: String,
    pub project_root: PathBuf,
}

/// Proxies the caller's standard streams onto the per-(server, project)
/// daemon socket, starting the daemon when none is listening.
pub async fn connect(cfg: ConnectCfg) -> anyhow::Result<()> {
    info!("Start connect action");
    debug!(?cfg);

    // Aliases collapse onto the canonical name so every spelling shares one
    // daemon.
    let spec = registry::find(&cfg.server)?;

    let stream = client::open_daemon_socket(spec.name, &cfg.project_root).await?;
    client::proxy_stdio(stream).await
}

/// Internal entry point invoked by `connect`.
pub async fn daemon(cfg: daemon::DaemonCfg) -> anyhow::Result<()> {
    info!("Start daemon action");
    debug!(?cfg);

    daemon::run_daemon(cfg).await
}

pub struct DaemonRow {
    pub meta: DaemonMeta,
    pub status: DaemonStatus,
    pub pid: Option<u32>,
}

/// Lists every recorded daemon with its probed status.
pub async fn ps() -> anyhow::Result<Vec<DaemonRow>> {
    let mut rows = Vec::new();
    for dir in store::list_dirs()? {
        let Ok(meta) = dir.read_meta() else {
            warn!(path = %dir.path().display(), "Skipping daemon directory without readable metadata");
            continue;
        };
        let status = store::probe(&dir).await;
        rows.push(DaemonRow {
            meta,
            status,
            pid: dir.read_pid(),
        });
    }
    Ok(rows)
}

#[derive(Debug)]
pub enum KillTarget {
    One { server: String, project_root: PathBuf },
    All,
}

pub struct KillOutcome {
    pub meta: DaemonMeta,
    pub killed: bool,
}

/// Terminates daemons via their recorded process identifier.
pub async fn kill(target: KillTarget) -> anyhow::Result<Vec<KillOutcome>> {
    debug!(?target);

    match target {
        KillTarget::One { server, project_root } => {
            let spec = registry::find(&server)?;
            let dir = DaemonDir::for_daemon(spec.name, &project_root)?;
            let meta = dir
                .read_meta()
                .context("no daemon recorded for this server and project")?;
            Ok(vec![kill_dir(&dir, meta)])
        }
        KillTarget::All => {
            let mut outcomes = Vec::new();
            for dir in store::list_dirs()? {
                let Ok(meta) = dir.read_meta() else { continue };
                outcomes.push(kill_dir(&dir, meta));
            }
            Ok(outcomes)
        }
    }
}

fn kill_dir(dir: &DaemonDir, meta: DaemonMeta) -> KillOutcome {
    let killed = dir.read_pid().map(store::kill_pid).unwrap_or(false);
    if killed {
        info!(server = meta.server, project_root = %meta.project_root.display(), "Killed daemon");
    }
    KillOutcome { meta, killed }
}

/// Removes directories for daemons whose process is dead and whose socket
/// does not accept connections.
pub async fn prune() -> anyhow::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for dir in store::list_dirs()? {
        if store::probe(&dir).await == DaemonStatus::Stale {
            info!(path = %dir.path().display(), "Pruning dead daemon directory");
            dir.remove()?;
            removed.push(dir.path().to_owned());
        }
    }
    Ok(removed)
}
