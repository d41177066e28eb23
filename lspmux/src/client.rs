//! `connect` front end: proxies the caller's standard streams to the daemon
//! socket, spawning the daemon first when none is listening.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use tokio::io::AsyncWriteExt as _;
use tokio::net::UnixStream;

use crate::store::DaemonDir;

/// How long a freshly spawned daemon gets to bind its socket.
const SPAWN_PROBE_BUDGET: Duration = Duration::from_secs(10);
const SPAWN_PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// Connects to the daemon for `(server, project_root)`, spawning it on
/// demand.
pub async fn open_daemon_socket(server: &str, project_root: &Path) -> anyhow::Result<UnixStream> {
    let dir = DaemonDir::for_daemon(server, project_root)?;
    let socket_path = dir.socket_path();

    if let Ok(stream) = UnixStream::connect(&socket_path).await {
        debug!(socket = %socket_path.display(), "Daemon already listening");
        return Ok(stream);
    }

    spawn_daemon(server, project_root, &dir)?;

    let deadline = tokio::time::Instant::now() + SPAWN_PROBE_BUDGET;
    loop {
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(SPAWN_PROBE_INTERVAL).await;
            }
            Err(error) => {
                return Err(anyhow::Error::new(error)).with_context(|| {
                    format!("daemon socket `{}` did not come up", socket_path.display())
                });
            }
        }
    }
}

fn spawn_daemon(server: &str, project_root: &Path, dir: &DaemonDir) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("couldn't locate the current executable")?;

    info!(server, project_root = %project_root.display(), "Spawning daemon");

    let mut command = std::process::Command::new(exe);
    command
        .arg("daemon")
        .arg("--server")
        .arg(server)
        .arg("--projectRoot")
        .arg(project_root)
        .arg("--socket")
        .arg(dir.socket_path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // The daemon must outlive this editor session.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        command.process_group(0);
    }

    command.spawn().context("failed to spawn the daemon")?;
    Ok(())
}

/// Pipes stdin to the daemon and the daemon back to stdout, byte for byte;
/// the daemon does all the framing. Resolves when either side ends.
pub async fn proxy_stdio(stream: UnixStream) -> anyhow::Result<()> {
    let (mut from_daemon, mut to_daemon) = stream.into_split();
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    tokio::select! {
        result = tokio::io::copy(&mut stdin, &mut to_daemon) => {
            result.context("failed to forward editor input")?;
            // Editor is done; tell the daemon so it can drop this client.
            let _ = to_daemon.shutdown().await;
        }
        result = tokio::io::copy(&mut from_daemon, &mut stdout) => {
            result.context("failed to forward daemon output")?;
            let _ = stdout.flush().await;
        }
    }

    info!("Connection ended");
    Ok(())
}
