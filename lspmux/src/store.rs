//! On-disk daemon store.
//!
//! One directory per (server, project root) pair under the per-user cache
//! directory, keyed by a truncated SHA-256 of `project_root`, a NUL byte and
//! the server name. Each directory holds the daemon's unix socket, its pid
//! file, a JSON metadata record and the daemon log. The owning daemon is the
//! only writer; the management commands read or remove whole directories.

use core::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use sysinfo::{Pid, ProcessesToUpdate, System};

const SOCKET_FILE: &str = "lsp.sock";
const PID_FILE: &str = "pid";
const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "daemon.log";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonMeta {
    pub server: String,
    pub project_root: PathBuf,
    pub socket_path: PathBuf,
    /// Unix seconds.
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    /// The socket accepts connections.
    Listening,
    /// The recorded pid is alive but the socket does not accept.
    Running,
    /// The recorded pid is dead.
    Stale,
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonStatus::Listening => write!(f, "listening"),
            DaemonStatus::Running => write!(f, "running"),
            DaemonStatus::Stale => write!(f, "stale"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonDir {
    path: PathBuf,
}

impl DaemonDir {
    pub fn for_daemon(server: &str, project_root: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            path: store_root()?.join(digest(server, project_root)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn socket_path(&self) -> PathBuf {
        self.path.join(SOCKET_FILE)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.path.join(PID_FILE)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.path.join(META_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    pub fn create(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.path)
            .with_context(|| format!("couldn't create daemon directory `{}`", self.path.display()))
    }

    pub fn write_pid(&self, pid: u32) -> anyhow::Result<()> {
        fs::write(self.pid_path(), format!("{pid}\n")).context("couldn't write pid file")
    }

    pub fn read_pid(&self) -> Option<u32> {
        let contents = fs::read_to_string(self.pid_path()).ok()?;
        contents.trim().parse().ok()
    }

    pub fn write_meta(&self, meta: &DaemonMeta) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(meta).context("couldn't serialize daemon metadata")?;
        fs::write(self.meta_path(), json).context("couldn't write daemon metadata")
    }

    pub fn read_meta(&self) -> anyhow::Result<DaemonMeta> {
        let contents = fs::read(self.meta_path())
            .with_context(|| format!("couldn't read `{}`", self.meta_path().display()))?;
        serde_json::from_slice(&contents).context("couldn't parse daemon metadata")
    }

    /// Removes the whole directory, metadata and logs included.
    pub fn remove(&self) -> anyhow::Result<()> {
        fs::remove_dir_all(&self.path)
            .with_context(|| format!("couldn't remove `{}`", self.path.display()))
    }

    /// Removes the socket and pid file on clean daemon exit. Metadata and
    /// logs stay behind for `ps` and debugging.
    pub fn clean_runtime_files(&self) {
        let _ = fs::remove_file(self.socket_path());
        let _ = fs::remove_file(self.pid_path());
    }
}

pub fn store_root() -> anyhow::Result<PathBuf> {
    let dir = dirs_next::cache_dir().context("couldn't determine the cache directory")?;
    Ok(dir.join("lspmux"))
}

/// Every daemon directory currently present, half-written ones included.
pub fn list_dirs() -> anyhow::Result<Vec<DaemonDir>> {
    let root = store_root()?;

    let entries = match fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => {
            return Err(anyhow::Error::new(error))
                .with_context(|| format!("couldn't read `{}`", root.display()));
        }
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.context("couldn't read next store entry")?;
        if entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
            dirs.push(DaemonDir { path: entry.path() });
        }
    }
    Ok(dirs)
}

pub async fn probe(dir: &DaemonDir) -> DaemonStatus {
    if socket_accepts(&dir.socket_path()).await {
        return DaemonStatus::Listening;
    }
    match dir.read_pid() {
        Some(pid) if pid_alive(pid) => DaemonStatus::Running,
        _ => DaemonStatus::Stale,
    }
}

pub async fn socket_accepts(path: &Path) -> bool {
    tokio::net::UnixStream::connect(path).await.is_ok()
}

pub fn pid_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    sys.process(pid).is_some()
}

/// Terminates the process, preferring SIGTERM where supported.
pub fn kill_pid(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    match sys.process(pid) {
        Some(process) => process
            .kill_with(sysinfo::Signal::Term)
            .unwrap_or_else(|| process.kill()),
        None => false,
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn digest(server: &str, project_root: &Path) -> String {
    use core::fmt::Write as _;

    let mut hasher = Sha256::new();
    hasher.update(project_root.as_os_str().as_encoded_bytes());
    hasher.update([0u8]);
    hasher.update(server.as_bytes());

    // 16 hex chars of the digest are plenty; collisions would need the same
    // user to hold on the order of 2^32 daemon directories.
    let mut key = String::with_capacity(16);
    for byte in hasher.finalize().iter().take(8) {
        let _ = write!(key, "{byte:02x}");
    }
    key
}
