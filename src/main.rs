//! docket: files Redmine downloads into per-ticket, per-day folders.
//!
//! One process per user does the work. Launching `docket` again while it is
//! running forwards the command to that process instead.

mod control;
mod desktop;
mod error;
mod instance;

use crate::control::{DEFAULT_RECENT, Request};
use crate::desktop::Desktop;
use crate::error::{ErrorKind, Result};
use crate::instance::{Instance, Primary};
use clap::{ArgAction, Parser, Subcommand};
use directories::ProjectDirs;
use docket_config::{Loader, Settings};
use docket_library::Service;
use docket_redmine::{RedmineClient, ResolverHandle};
use exn::{OptionExt, ResultExt};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use time::UtcOffset;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Our own crates get the chattier level.
const CRATES: &[&str] = &["docket", "docket_config", "docket_extract", "docket_library", "docket_redmine", "docket_storage"];

#[derive(Debug, Parser)]
#[command(name = "docket", version, about)]
struct Cli {
    /// Scan right away and print the status.
    #[arg(long)]
    show: bool,
    /// Configuration file (TOML, YAML or JSON) instead of the default location.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Log more; repeat for even more. `RUST_LOG` takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum Command {
    /// Watch the downloads folder until interrupted (the default).
    Run,
    /// Organize whatever is in the downloads folder, once.
    Scan,
    /// Start watching.
    Start,
    /// Stop watching, keeping the running instance alive.
    Stop,
    /// Show what the running instance is doing.
    Status,
    /// Print the latest journal entries.
    Recent {
        #[arg(short = 'n', long, default_value_t = DEFAULT_RECENT)]
        n: usize,
    },
}

impl Command {
    /// What to ask an instance that is already running.
    fn request(self) -> Request {
        match self {
            Self::Run => Request::Show,
            Self::Scan => Request::Scan,
            Self::Start => Request::Start,
            Self::Stop => Request::Stop,
            Self::Status => Request::Status,
            Self::Recent { n } => Request::Recent(n),
        }
    }
}

fn init_tracing(verbose: u8) {
    let (others, ours) = match verbose {
        0 => ("warn", "info"),
        1 => ("info", "debug"),
        _ => ("debug", "trace"),
    };
    let mut directives = others.to_string();
    for krate in CRATES {
        directives.push_str(&format!(",{krate}={ours}"));
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    // Has to be read before the runtime starts any threads.
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("docket: could not start the async runtime: {err}");
            return ExitCode::FAILURE;
        },
    };
    match runtime.block_on(run(cli, offset)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = ?err, "docket failed");
            eprintln!("docket: {}", *err);
            ExitCode::from(err.exit_code())
        },
    }
}

async fn run(cli: Cli, offset: UtcOffset) -> Result<()> {
    let command = cli.command.unwrap_or(Command::Run);
    let data_dir = ProjectDirs::from("", "", "docket")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_raise(|| ErrorKind::Instance)?;

    let primary = match Instance::acquire(&data_dir)? {
        Instance::Secondary(secondary) => {
            let reply = secondary.send(command.request()).await?;
            print!("{reply}");
            return Ok(());
        },
        Instance::Primary(primary) => primary,
    };

    match command {
        Command::Run | Command::Start => {
            let service = build_service(cli.config.as_deref(), offset)?;
            run_primary(primary, service, cli.show).await
        },
        Command::Scan => {
            let service = build_service(cli.config.as_deref(), offset)?;
            let summary = service.trigger_scan().finished().await.ok_or_raise(|| ErrorKind::Runtime)?;
            print!("{}", control::format_summary(&summary));
            Ok(())
        },
        Command::Recent { n } => {
            let service = build_service(cli.config.as_deref(), offset)?;
            let records = service.recent_entries(n).await.or_raise(|| ErrorKind::Runtime)?;
            print!("{}", control::format_records(&records));
            Ok(())
        },
        Command::Status | Command::Stop => {
            println!("docket is not running");
            Ok(())
        },
    }
}

fn build_service(config: Option<&Path>, offset: UtcOffset) -> Result<Service> {
    let loader = match config {
        Some(path) => Loader::new().with_file(path),
        None => Loader::new(),
    };
    // One connection pool; the URL and key are re-read for every file.
    let http = RedmineClient::http_client().or_raise(|| ErrorKind::Runtime)?;
    let resolvers = move |settings: &Settings| -> ResolverHandle {
        Arc::new(RedmineClient::new(http.clone(), &settings.api_base_url, settings.api_token.expose()))
    };
    Service::new(Arc::new(loader), Arc::new(resolvers), Arc::new(Desktop), offset).or_raise(|| ErrorKind::Config)
}

/// Ctrl-C, or SIGTERM from a service manager.
struct ShutdownSignal {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    fn install() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .or_raise(|| ErrorKind::Runtime)?,
        })
    }

    #[cfg(unix)]
    async fn received(mut self) -> Result<()> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.or_raise(|| ErrorKind::Runtime),
            _ = self.terminate.recv() => {
                info!("terminated");
                Ok(())
            },
        }
    }

    #[cfg(not(unix))]
    async fn received(self) -> Result<()> {
        tokio::signal::ctrl_c().await.or_raise(|| ErrorKind::Runtime)
    }
}

/// Watches and serves the control channel until Ctrl-C or SIGTERM.
async fn run_primary(mut primary: Primary, service: Service, show: bool) -> Result<()> {
    service.start_watching().await.or_raise(|| ErrorKind::Config)?;
    let listener = primary.listen().await?;
    let shutdown = CancellationToken::new();
    let control = tokio::spawn(instance::serve(listener, service.clone(), shutdown.clone()));
    if show {
        print!("{}", control::execute(&service, Request::Show).await);
    }

    let signal = ShutdownSignal::install()?;
    info!("running; press Ctrl-C to stop");
    signal.received().await?;
    info!("shutting down");
    shutdown.cancel();
    let _ = control.await;
    service.shutdown().await;
    drop(primary);
    Ok(())
}
