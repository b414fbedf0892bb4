//! pledge - remote batch execution for configuration management.
//!
//! The client compiles a directory of `.cnf` promise sources and ships the
//! resulting tree over mutually-authenticated TLS to a server, which
//! evaluates it against its own host. Both roles pin their peers'
//! certificates in a local store.

mod client;
mod commands;
mod settings;
mod syslog;
mod watch;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// pledge - promise-based configuration management
#[derive(Parser, Debug)]
#[command(name = "pledge")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every subcommand; each also reads its `PLEDGE_*`
/// environment variant.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Bind/connect address (default: localhost for the client, 0.0.0.0
    /// for the server)
    #[arg(long, global = true, env = "PLEDGE_HOST")]
    pub host: Option<String>,

    /// Bind/connect port
    #[arg(long, global = true, env = "PLEDGE_PORT", default_value_t = 9954)]
    pub port: u16,

    /// Root promise name to evaluate
    #[arg(long, global = true, env = "PLEDGE_PROMISE", default_value = "done")]
    pub promise: String,

    /// Verbose output for non-change promises
    #[arg(long, short = 'v', global = true, env = "PLEDGE_VERBOSE")]
    pub verbose: bool,

    /// Debug log level
    #[arg(long, global = true, env = "PLEDGE_DEBUG")]
    pub debug: bool,

    /// Mirror logs to syslog
    #[arg(long, short = 's', global = true, env = "PLEDGE_SYSLOG")]
    pub syslog: bool,

    /// Path to the append-only run log (default: <workdir>/run.log)
    #[arg(long, short = 'r', global = true, env = "PLEDGE_RUNLOG")]
    pub runlog_path: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile promises and execute them on a remote server
    Client {
        #[command(subcommand)]
        command: ClientCommands,
    },

    /// Evaluate promise trees received from pinned clients
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ClientCommands {
    /// Compile the input folder, send the tree, await the result
    Run {
        /// Folder containing `.cnf` input files
        #[arg(long, short = 'i', env = "PLEDGE_INPUT_FOLDER")]
        input_folder: Option<PathBuf>,
    },

    /// Compile only; success means the sources compile
    Test {
        /// Folder containing `.cnf` input files
        #[arg(long, short = 'i', env = "PLEDGE_INPUT_FOLDER")]
        input_folder: Option<PathBuf>,
    },

    /// Recompile and send whenever the input folder changes
    Watch {
        /// Folder containing `.cnf` input files
        #[arg(long, short = 'i', env = "PLEDGE_INPUT_FOLDER")]
        input_folder: Option<PathBuf>,

        /// Minimum seconds between evaluations; retained for
        /// compatibility, the watcher itself is event-driven
        #[arg(long, short = 'n', env = "PLEDGE_INTERVAL", default_value_t = 300)]
        interval: u64,
    },

    /// Manage the pinned-servers certificate store
    Cert {
        #[command(subcommand)]
        command: CertCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ServerCommands {
    /// Start the server with live-upgrade support
    Run {
        /// Keep evaluation output local instead of streaming it to the
        /// client
        #[arg(long)]
        no_redirect: bool,
    },

    /// Manage the pinned-clients certificate store
    Cert {
        #[command(subcommand)]
        command: CertCommands,
    },
}

#[derive(Subcommand, Debug)]
enum CertCommands {
    /// Pin a peer certificate under an id
    Add {
        /// Peer id
        #[arg(long)]
        id: String,

        /// Path to the peer's PEM certificate
        #[arg(long)]
        path: PathBuf,
    },

    /// Remove a pinned peer certificate
    Rm {
        /// Peer id
        #[arg(long)]
        id: String,
    },
}

fn init_tracing(debug: bool, use_syslog: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let syslog_layer = use_syslog.then(|| {
        syslog::open();
        tracing_subscriber::fmt::layer()
            .with_writer(syslog::MakeSyslogWriter)
            .with_ansi(false)
            .without_time()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(syslog_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.debug, cli.global.syslog);

    // Single compiled crypto provider (ring); installing is idempotent.
    rustls::crypto::ring::default_provider().install_default().ok();

    match cli.command {
        Commands::Client { command } => match command {
            ClientCommands::Run { input_folder } => {
                commands::client::run(&cli.global, input_folder).await
            },
            ClientCommands::Test { input_folder } => {
                commands::client::test(&cli.global, input_folder)
            },
            ClientCommands::Watch {
                input_folder,
                interval: _,
            } => commands::client::watch(&cli.global, input_folder).await,
            ClientCommands::Cert { command } => match command {
                CertCommands::Add { id, path } => {
                    commands::cert::add(&cli.global, settings::Role::Client, &id, &path)
                },
                CertCommands::Rm { id } => {
                    commands::cert::remove(&cli.global, settings::Role::Client, &id)
                },
            },
        },
        Commands::Server { command } => match command {
            ServerCommands::Run { no_redirect } => {
                commands::server::run(&cli.global, no_redirect).await
            },
            ServerCommands::Cert { command } => match command {
                CertCommands::Add { id, path } => {
                    commands::cert::add(&cli.global, settings::Role::Server, &id, &path)
                },
                CertCommands::Rm { id } => {
                    commands::cert::remove(&cli.global, settings::Role::Server, &id)
                },
            },
        },
    }
}
