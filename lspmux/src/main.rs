#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use core::fmt;
use std::error::Error;
use std::future::Future;
use std::io::IsTerminal as _;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use anyhow::Context as _;
use lsp_mux::registry;
use lspmux::daemon::DaemonCfg;
use lspmux::{ConnectCfg, KillTarget};
use seahorse::{App, Command, Context, Flag, FlagType};
use tokio::runtime;

fn main() {
    let app = App::new(env!("CARGO_PKG_NAME"))
        .description(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .usage(generate_usage())
        .command(connect_command())
        .command(ps_command())
        .command(kill_command())
        .command(prune_command())
        .command(daemon_command());

    app.run(env::args().collect());
}

fn generate_usage() -> String {
    let servers = registry::all()
        .map(|spec| {
            if spec.aliases.is_empty() {
                format!("    {}", spec.name)
            } else {
                format!("    {} (aliases: {})", spec.name, spec.aliases.join(", "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "{command} [subcommand]\n\
        \n\
        \tExample: share one tsgo instance between editor windows\n\
        \n\
        \t  {command} connect tsgo --project /path/to/project\n\
        \n\
        \tFor detailed logs, use the `LSPMUX_LOG` environment variable:\n\
        \n\
        \t  LSPMUX_LOG=target[span{{field=value}}]=level\n\
        \n\
        Known servers:\n{servers}",
        command = env!("CARGO_PKG_NAME"),
    )
}

fn run<F: Future<Output = anyhow::Result<()>>>(f: F) -> anyhow::Result<()> {
    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("runtime build failed")?;

    match rt.block_on(async {
        tokio::select! {
            res = f => res,
            res = tokio::signal::ctrl_c() => res.context("ctrl-c event"),
        }
    }) {
        Ok(()) => info!("Terminated successfully"),
        Err(e) => {
            error!("{:#}", e);
            return Err(e);
        }
    }

    rt.shutdown_timeout(Duration::from_millis(100));

    Ok(())
}

/// Exit codes: 0 success, 2 usage error, 1 operational failure.
fn exit(res: anyhow::Result<()>) -> ! {
    match res {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{e:?}");
            let is_usage = e.downcast_ref::<UsageError>().is_some()
                || e.downcast_ref::<registry::UnknownServer>().is_some();
            std::process::exit(if is_usage { 2 } else { 1 });
        }
    }
}

#[derive(Debug)]
struct UsageError(String);

impl Error for UsageError {}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn usage_error(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(UsageError(message.into()))
}

// connect

const CONNECT_SUBCOMMAND: &str = "connect";

fn connect_command() -> Command {
    let usage = format!(
        r##"{command} {subcommand} <SERVER> [--project <PATH>]

Proxies this process' standard streams onto the shared daemon for
(<SERVER>, project), starting the daemon when none is listening. Point your
editor's LSP client at this command instead of the server binary.

Example: two editor windows, one tsgo

    {command} {subcommand} tsgo --project /path/to/project"##,
        command = env!("CARGO_PKG_NAME"),
        subcommand = CONNECT_SUBCOMMAND,
    );

    let cmd = Command::new(CONNECT_SUBCOMMAND)
        .description("Connect stdio to the shared daemon for a server")
        .alias("c")
        .usage(usage)
        .action(connect_action)
        .flag(Flag::new("project", FlagType::String).description("Project root (defaults to the working directory)"));

    apply_common_flags(cmd)
}

fn connect_action(c: &Context) {
    let res = ConnectArgs::parse(c).and_then(|args| {
        let _log_guard = setup_logger(&args.common.logging);
        run(lspmux::connect(args.cfg))
    });
    exit(res);
}

struct ConnectArgs {
    common: CommonArgs,
    cfg: ConnectCfg,
}

impl ConnectArgs {
    fn parse(c: &Context) -> anyhow::Result<Self> {
        let common = CommonArgs::parse(c, default_file_logging(CONNECT_SUBCOMMAND)?)?;

        let server = c
            .args
            .first()
            .ok_or_else(|| usage_error("<SERVER> is missing"))?
            .clone();
        let project_root = resolve_project_root(opt_string_flag(c, "project")?)?;

        Ok(Self {
            common,
            cfg: ConnectCfg { server, project_root },
        })
    }
}

// ps

const PS_SUBCOMMAND: &str = "ps";

fn ps_command() -> Command {
    let cmd = Command::new(PS_SUBCOMMAND)
        .description("List known daemons and their status")
        .usage(format!(
            "{command} {PS_SUBCOMMAND} [--json]\n\nStatus is one of `listening`, `running` and `stale`.",
            command = env!("CARGO_PKG_NAME"),
        ))
        .action(ps_action)
        .flag(Flag::new("json", FlagType::Bool).description("Print one JSON object per daemon"));

    apply_common_flags(cmd)
}

fn ps_action(c: &Context) {
    let res = CommonArgs::parse(c, Logging::Term).and_then(|common| {
        let json = c.bool_flag("json");
        let _log_guard = setup_logger(&common.logging);
        run(async move {
            let rows = lspmux::ps().await?;
            print_ps(&rows, json);
            Ok(())
        })
    });
    exit(res);
}

fn print_ps(rows: &[lspmux::DaemonRow], json: bool) {
    if json {
        for row in rows {
            println!(
                "{}",
                serde_json::json!({
                    "server": row.meta.server,
                    "projectRoot": row.meta.project_root,
                    "socketPath": row.meta.socket_path,
                    "updatedAt": row.meta.updated_at,
                    "pid": row.pid,
                    "status": row.status.to_string(),
                })
            );
        }
        return;
    }

    if rows.is_empty() {
        println!("no daemons");
        return;
    }

    println!("{:<12} {:<10} {:>8}  {}", "SERVER", "STATUS", "PID", "PROJECT");
    for row in rows {
        let pid = row.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".to_owned());
        println!(
            "{:<12} {:<10} {:>8}  {}",
            row.meta.server,
            row.status,
            pid,
            row.meta.project_root.display(),
        );
    }
}

// kill

const KILL_SUBCOMMAND: &str = "kill";

fn kill_command() -> Command {
    let usage = format!(
        r##"{command} {KILL_SUBCOMMAND} <SERVER> [--project <PATH>]
{command} {KILL_SUBCOMMAND} --all

Terminates daemons via their recorded process identifier."##,
        command = env!("CARGO_PKG_NAME"),
    );

    let cmd = Command::new(KILL_SUBCOMMAND)
        .description("Terminate daemons")
        .usage(usage)
        .action(kill_action)
        .flag(Flag::new("project", FlagType::String).description("Project root (defaults to the working directory)"))
        .flag(Flag::new("all", FlagType::Bool).description("Terminate every known daemon"));

    apply_common_flags(cmd)
}

fn kill_action(c: &Context) {
    let res = KillArgs::parse(c).and_then(|args| {
        let _log_guard = setup_logger(&args.common.logging);
        run(async move {
            let outcomes = lspmux::kill(args.target).await?;
            for outcome in &outcomes {
                if outcome.killed {
                    println!("killed {} ({})", outcome.meta.server, outcome.meta.project_root.display());
                } else {
                    println!(
                        "not running: {} ({})",
                        outcome.meta.server,
                        outcome.meta.project_root.display()
                    );
                }
            }
            Ok(())
        })
    });
    exit(res);
}

struct KillArgs {
    common: CommonArgs,
    target: KillTarget,
}

impl KillArgs {
    fn parse(c: &Context) -> anyhow::Result<Self> {
        let common = CommonArgs::parse(c, Logging::Term)?;

        let target = if c.bool_flag("all") {
            KillTarget::All
        } else {
            let server = c
                .args
                .first()
                .ok_or_else(|| usage_error("<SERVER> is missing (or pass --all)"))?
                .clone();
            let project_root = resolve_project_root(opt_string_flag(c, "project")?)?;
            KillTarget::One { server, project_root }
        };

        Ok(Self { common, target })
    }
}

// prune

const PRUNE_SUBCOMMAND: &str = "prune";

fn prune_command() -> Command {
    let cmd = Command::new(PRUNE_SUBCOMMAND)
        .description("Remove directories of daemons that are no longer alive")
        .usage(format!(
            "{command} {PRUNE_SUBCOMMAND}",
            command = env!("CARGO_PKG_NAME")
        ))
        .action(prune_action);

    apply_common_flags(cmd)
}

fn prune_action(c: &Context) {
    let res = CommonArgs::parse(c, Logging::Term).and_then(|common| {
        let _log_guard = setup_logger(&common.logging);
        run(async move {
            let removed = lspmux::prune().await?;
            for path in &removed {
                println!("removed {}", path.display());
            }
            println!("pruned {} daemon(s)", removed.len());
            Ok(())
        })
    });
    exit(res);
}

// daemon

const DAEMON_SUBCOMMAND: &str = "daemon";

fn daemon_command() -> Command {
    let usage = format!(
        r##"{command} {DAEMON_SUBCOMMAND} --server <NAME> --projectRoot <PATH> [--socket <PATH>] [--idle-timeout <DURATION>]

Internal entry point invoked by `{command} connect`. Spawns the language
server, binds the daemon socket and serves clients until the server exits or
the last client has been gone for the idle timeout."##,
        command = env!("CARGO_PKG_NAME"),
    );

    let cmd = Command::new(DAEMON_SUBCOMMAND)
        .description("Run the daemon (internal)")
        .usage(usage)
        .action(daemon_action)
        .flag(Flag::new("server", FlagType::String).description("Server name or alias"))
        .flag(Flag::new("projectRoot", FlagType::String).description("Project root the server runs in"))
        .flag(Flag::new("socket", FlagType::String).description("Socket path override"))
        .flag(Flag::new("idle-timeout", FlagType::String).description("Delay before shutdown once the last client left (default: 500ms)"));

    apply_common_flags(cmd)
}

fn daemon_action(c: &Context) {
    let res = DaemonArgs::parse(c).and_then(|args| {
        let _log_guard = setup_logger(&args.common.logging);
        run(lspmux::daemon(args.cfg))
    });
    exit(res);
}

struct DaemonArgs {
    common: CommonArgs,
    cfg: DaemonCfg,
}

impl DaemonArgs {
    fn parse(c: &Context) -> anyhow::Result<Self> {
        let server = opt_string_flag(c, "server")?.ok_or_else(|| usage_error("--server is missing"))?;
        let project_root =
            opt_string_flag(c, "projectRoot")?.ok_or_else(|| usage_error("--projectRoot is missing"))?;
        let project_root = resolve_project_root(Some(project_root))?;

        // The daemon logs into its own store directory by default.
        let spec = registry::find(&server)?;
        let dir = lspmux::store::DaemonDir::for_daemon(spec.name, &project_root)?;
        dir.create()?;
        let common = CommonArgs::parse(c, Logging::File { filepath: dir.log_path() })?;

        let socket_path = opt_string_flag(c, "socket")?.map(PathBuf::from);

        let idle_timeout = opt_string_flag(c, "idle-timeout")?
            .map(|timeout| {
                humantime::parse_duration(&timeout)
                    .map_err(|error| usage_error(format!("invalid --idle-timeout: {error}")))
            })
            .transpose()?;

        Ok(Self {
            common,
            cfg: DaemonCfg {
                server,
                project_root,
                socket_path,
                idle_timeout,
            },
        })
    }
}

// args parsing

fn apply_common_flags(cmd: Command) -> Command {
    cmd.flag(Flag::new("log-file", FlagType::String).description("Specify filepath for log file"))
        .flag(Flag::new("log-term", FlagType::Bool).description("Print logs to stderr instead of log file"))
}

#[derive(Debug, PartialEq)]
enum Logging {
    Term,
    File { filepath: PathBuf },
}

struct CommonArgs {
    logging: Logging,
}

impl CommonArgs {
    fn parse(c: &Context, default: Logging) -> anyhow::Result<Self> {
        let logging = if c.bool_flag("log-term") {
            Logging::Term
        } else if let Some(filepath) = opt_string_flag(c, "log-file")? {
            Logging::File {
                filepath: PathBuf::from(filepath),
            }
        } else {
            default
        };

        Ok(Self { logging })
    }
}

fn default_file_logging(action: &str) -> anyhow::Result<Logging> {
    let mut filepath = lspmux::store::store_root()?.join("logs");
    std::fs::create_dir_all(&filepath).context("couldn't create log folder")?;
    clean_old_log_files(&filepath);
    filepath.push(format!("{}_{}.log", action, lspmux::store::unix_now()));
    Ok(Logging::File { filepath })
}

/// Connect logs are one file per invocation; drop the ones nobody will read
/// anymore.
fn clean_old_log_files(folder: &std::path::Path) {
    const MAX_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 5); // 5 days

    let Ok(read_dir) = std::fs::read_dir(folder) else {
        return;
    };

    for entry in read_dir.flatten() {
        if entry.path().extension().and_then(|ext| ext.to_str()) != Some("log") {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .and_then(|modified| modified.elapsed().map_err(io::Error::other));

        if let Ok(age) = age {
            if age > MAX_AGE {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

fn resolve_project_root(flag: Option<String>) -> anyhow::Result<PathBuf> {
    let path = match flag {
        Some(path) => PathBuf::from(path),
        None => env::current_dir().context("couldn't determine the working directory")?,
    };

    std::fs::canonicalize(&path)
        .map_err(|error| usage_error(format!("bad project root `{}`: {error}", path.display())))
}

// logging

struct LoggerGuard {
    _worker_guard: tracing_appender::non_blocking::WorkerGuard,
}

fn setup_logger(logging: &Logging) -> LoggerGuard {
    use std::fs::OpenOptions;
    use std::panic;

    use tracing::metadata::LevelFilter;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let (layer, guard) = match logging {
        Logging::Term => {
            let (non_blocking, guard) = tracing_appender::non_blocking(io::stderr());
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(io::stderr().is_terminal());
            (layer, guard)
        }
        Logging::File { filepath } => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(filepath)
                .expect("create log file");

            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
            (layer, guard)
        }
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("LSPMUX_LOG")
        .from_env()
        .expect("invalid filtering directive from env");

    tracing_subscriber::registry().with(layer).with(env_filter).init();

    info!(version = env!("CARGO_PKG_VERSION"));

    panic::set_hook(Box::new(move |panic_info| {
        error!(%panic_info);
        eprintln!("{panic_info}");
    }));

    LoggerGuard { _worker_guard: guard }
}

#[expect(
    deprecated,
    reason = "seahorse uses description() for the human readable description"
)]
fn opt_string_flag(context: &Context, name: &str) -> anyhow::Result<Option<String>> {
    match context.string_flag(name) {
        Ok(value) => Ok(Some(value)),
        Err(seahorse::error::FlagError::NotFound) => Ok(None),
        Err(e) => Err(anyhow::Error::msg(e.description().to_owned()).context(format!("invalid '{name}'"))),
    }
}
