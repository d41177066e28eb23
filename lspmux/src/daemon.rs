//! Daemon entry point: spawns the language server child, binds the unix
//! socket, feeds accepted connections into the mux, and cleans the store
//! directory up on exit.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use lsp_mux::registry::{self, ServerSpec};
use lsp_mux::{Mux, MuxConfig, MuxHandle, ServerIo};
use tokio::net::UnixListener;

use crate::resolve;
use crate::store::{self, DaemonDir, DaemonMeta};

#[derive(Debug)]
pub struct DaemonCfg {
    pub server: String,
    pub project_root: PathBuf,
    /// Defaults to the socket inside the daemon's store directory.
    pub socket_path: Option<PathBuf>,
    pub idle_timeout: Option<Duration>,
}

pub async fn run_daemon(cfg: DaemonCfg) -> anyhow::Result<()> {
    let spec = registry::find(&cfg.server)?;

    let dir = DaemonDir::for_daemon(spec.name, &cfg.project_root)?;
    dir.create()?;
    let socket_path = cfg.socket_path.clone().unwrap_or_else(|| dir.socket_path());

    // Two editors may race to spawn the daemon; the loser backs off and its
    // `connect` finds the winner through the socket probe.
    if store::socket_accepts(&socket_path).await {
        anyhow::bail!("another daemon is already listening on `{}`", socket_path.display());
    }

    let child = spawn_server(spec, &cfg).await?;

    // A crashed predecessor may have left its socket behind.
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("couldn't bind `{}`", socket_path.display()))?;

    dir.write_pid(std::process::id())?;
    dir.write_meta(&DaemonMeta {
        server: spec.name.to_owned(),
        project_root: cfg.project_root.clone(),
        socket_path: socket_path.clone(),
        updated_at: store::unix_now(),
    })?;
    info!(socket = %socket_path.display(), "Daemon ready");

    let (mux, handle) = Mux::new(ServerIo::from_child(child)?, spec);
    let mux = match cfg.idle_timeout {
        Some(idle_timeout) => mux.with_config(MuxConfig {
            idle_timeout,
            ..Default::default()
        }),
        None => mux,
    };

    let acceptor = tokio::spawn(accept_loop(listener, handle));

    let result = mux.run().await;
    acceptor.abort();
    dir.clean_runtime_files();

    let exit = result?;
    info!(?exit, "Daemon shutting down");

    Ok(())
}

async fn spawn_server(spec: &'static ServerSpec, cfg: &DaemonCfg) -> anyhow::Result<tokio::process::Child> {
    let binary = resolve::resolve_binary(spec, &cfg.project_root).await?;
    info!(binary = %binary.display(), args = ?spec.args, "Spawning language server");

    tokio::process::Command::new(&binary)
        .args(spec.args)
        .current_dir(&cfg.project_root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn `{}`", binary.display()))
}

async fn accept_loop(listener: UnixListener, handle: MuxHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                if handle.attach(stream).await.is_err() {
                    // The mux is gone; stop accepting.
                    break;
                }
            }
            Err(error) => {
                error!(%error, "Couldn't accept next client");
                break;
            }
        }
    }
}
