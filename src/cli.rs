use crate::config::daemon::{DaemonConfig, DEFAULT_SOCKET_PATH};
use crate::core::client::send_request;
use crate::core::protocol::ControlRequest;
use crate::core::registry::InstanceRegistry;
use crate::core::server::{ControlServer, Dispatcher};
use crate::kernel::namespace::NamespaceSpawner;
use crate::kernel::signal::{self, ShutdownSignals};
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CliMode {
    Daemon,
    Control,
}

impl CliMode {
    fn primary_binary(self) -> &'static str {
        match self {
            Self::Daemon => "kyntrixd",
            Self::Control => "kyntrixctl",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "kyntrixd", author, version, about = "Local sandbox orchestrator daemon", long_about = None)]
struct DaemonArgs {
    /// Control socket path (overrides the config file)
    socket: Option<PathBuf>,
    /// JSON config file
    #[arg(long, env = "KYNTRIXD_CONFIG")]
    config: Option<PathBuf>,
    /// Connection handler threads (1 = serve inline)
    #[arg(long)]
    workers: Option<usize>,
    /// Ingest endpoint handed to sandboxed programs
    #[arg(long, env = "KYNTRIX_INGEST_URL")]
    ingest_url: Option<String>,
    /// Directory holding <template>-rootfs images
    #[arg(long)]
    images_dir: Option<PathBuf>,
    /// Staging mount point used while switching root
    #[arg(long)]
    staging_dir: Option<PathBuf>,
}

impl DaemonArgs {
    /// File (or defaults), then command line, then validation.
    fn resolve(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load_from_file(path)?,
            None => DaemonConfig::default(),
        };

        if let Some(socket) = self.socket {
            config.socket_path = socket;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(url) = self.ingest_url {
            config.ingest_url = url;
        }
        if let Some(dir) = self.images_dir {
            config.images_dir = dir;
        }
        if let Some(dir) = self.staging_dir {
            config.staging_dir = dir;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Parser, Debug)]
#[command(name = "kyntrixctl", author, version, about = "Control a running kyntrixd", long_about = None)]
struct ControlArgs {
    /// Daemon control socket
    #[arg(long, env = "KYNTRIX_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    #[command(subcommand)]
    command: ControlCommands,
}

#[derive(Subcommand, Debug)]
enum ControlCommands {
    /// Launch a sandbox for a run
    Start {
        #[arg(long)]
        run_id: String,
        /// Container template (node or python)
        #[arg(long)]
        template: String,
        /// Host directory mounted at /workspace
        #[arg(long)]
        workspace: PathBuf,
        /// Entry script relative to /workspace
        #[arg(long)]
        entry: String,
    },
    /// Send SIGTERM to a run's sandbox and forget it
    Stop {
        #[arg(long)]
        run_id: String,
    },
}

impl ControlCommands {
    fn into_request(self) -> ControlRequest {
        match self {
            Self::Start {
                run_id,
                template,
                workspace,
                entry,
            } => ControlRequest::start(&run_id, &template, &workspace.to_string_lossy(), &entry),
            Self::Stop { run_id } => ControlRequest::stop(&run_id),
        }
    }
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

pub fn run(mode: CliMode) -> Result<()> {
    init_logging();

    match mode {
        CliMode::Daemon => run_daemon(DaemonArgs::parse()),
        CliMode::Control => run_control(ControlArgs::parse()),
    }
}

fn run_daemon(args: DaemonArgs) -> Result<()> {
    let config = args.resolve()?;
    let signals = ShutdownSignals::install()?;

    if !nix::unistd::geteuid().is_root() {
        warn!(
            "{} is not running as root; namespace creation and mounts will fail",
            CliMode::Daemon.primary_binary()
        );
    }

    let registry = InstanceRegistry::new(NamespaceSpawner::new(config.clone()));
    let server = ControlServer::bind(&config.socket_path)?;
    let dispatcher = Dispatcher::new(&registry);

    info!(
        "{} ready: socket={} images={} workers={}",
        CliMode::Daemon.primary_binary(),
        server.local_path().display(),
        config.images_dir.display(),
        config.workers
    );
    server.run(&dispatcher, config.workers, signal::should_continue);

    match signals.received() {
        Some(sig) => info!("shutting down on {}", sig),
        None => info!("shutting down"),
    }
    // Sandboxes outlive the daemon; their PIDs are only reported here.
    for instance in registry.snapshot() {
        warn!("run {} (pid {}) left running", instance.run_id, instance.pid);
    }
    Ok(())
}

fn run_control(args: ControlArgs) -> Result<()> {
    let request = args.command.into_request();
    let response = send_request(&args.socket, &request)?.ok_or_else(|| {
        anyhow::anyhow!(
            "{} closed the connection without replying",
            args.socket.display()
        )
    })?;

    println!("{}", serde_json::to_string(&response)?);
    if !response.ok {
        anyhow::bail!(
            "{} {} rejected by daemon",
            CliMode::Control.primary_binary(),
            request.action
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn positional_socket_overrides_default() {
        let args = DaemonArgs::try_parse_from(["kyntrixd", "/tmp/k.sock"]).unwrap();
        let config = args.resolve().unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/k.sock"));
        assert_eq!(config.workers, 1);
    }

    #[test]
    fn flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"socket_path":"/run/a.sock","workers":2,"batch_size":7}}"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let args = DaemonArgs::try_parse_from([
            "kyntrixd",
            "--config",
            path.as_str(),
            "--workers",
            "4",
            "--images-dir",
            "/srv/images",
        ])
        .unwrap();
        let config = args.resolve().unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/run/a.sock"));
        assert_eq!(config.workers, 4);
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.images_dir, PathBuf::from("/srv/images"));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let args = DaemonArgs::try_parse_from(["kyntrixd", "--workers", "0"]).unwrap();
        assert!(args.resolve().is_err());
    }

    #[test]
    fn ctl_start_builds_full_request() {
        let args = ControlArgs::try_parse_from([
            "kyntrixctl",
            "--socket",
            "/tmp/k.sock",
            "start",
            "--run-id",
            "r1",
            "--template",
            "python",
            "--workspace",
            "/srv/ws/r1",
            "--entry",
            "main.py",
        ])
        .unwrap();

        assert_eq!(args.socket, PathBuf::from("/tmp/k.sock"));
        assert_eq!(
            args.command.into_request(),
            ControlRequest::start("r1", "python", "/srv/ws/r1", "main.py")
        );
    }

    #[test]
    fn ctl_stop_requires_run_id() {
        assert!(ControlArgs::try_parse_from(["kyntrixctl", "stop"]).is_err());
        let args = ControlArgs::try_parse_from(["kyntrixctl", "stop", "--run-id", "r9"]).unwrap();
        assert_eq!(args.command.into_request(), ControlRequest::stop("r9"));
    }
}
