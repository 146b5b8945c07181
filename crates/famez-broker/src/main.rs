//! famez-server: the FAME-Z broker binary.
//!
//! Options reflect those of the QEMU "ivshmem-server".

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use famez_broker::{
    Broker, BrokerConfig, ServerError, SocketLock, StatusState, accept_loop, arm_doorbells, status,
};
use famez_mailbox::MailboxRegion;

#[derive(Parser, Debug)]
#[command(name = "famez-server")]
#[command(about = "FAME-Z broker: IVSHMSG rendezvous and fabric switch")]
struct Args {
    /// Name of the mailbox that exists in POSIX shared memory
    #[arg(long, short = 'M', default_value = "famez_mailbox")]
    mailbox: String,

    /// Absolute path to the UNIX domain socket (will be created)
    #[arg(long, short = 'S', default_value = "/tmp/famez_socket")]
    socketpath: PathBuf,

    /// Number of client mailslots to provision
    #[arg(long = "nClients", short = 'n', default_value_t = 2,
          value_parser = clap::value_parser!(u64).range(1..=62))]
    nclients: u64,

    /// Do NOT participate in eventfds/mailbox as another peer
    #[arg(long, short = 's')]
    silent: bool,

    /// Act as the fabric manager: answer Link RFC, randomize ids
    #[arg(long)]
    smart: bool,

    /// Preserve peer records and eventfds across disconnects (default)
    #[arg(long, overrides_with = "norecycle")]
    recycle: bool,

    /// Destroy peer records on disconnect
    #[arg(long, overrides_with = "recycle")]
    norecycle: bool,

    /// Specify multiple times to increase verbosity
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log to stdout instead of the logfile
    #[arg(long)]
    foreground: bool,

    /// Pathname of the logfile for daemon-style runs
    #[arg(long, short = 'L', default_value = "/tmp/famez_log")]
    logfile: PathBuf,

    /// Enable the read-only HTTP status endpoint on this TCP port
    #[arg(long)]
    port: Option<u16>,
}

fn main() {
    let args = Args::parse();
    let recycle = !args.norecycle;

    let cfg = match BrokerConfig::resolve(
        args.mailbox,
        args.socketpath,
        args.nclients,
        args.silent,
        args.smart,
        recycle,
        args.verbose,
        args.port,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("famez-server: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(args.foreground, &args.logfile, cfg.verbose);

    // The lock also guards against a stale socket file from a dead broker:
    // a pre-existing path is fatal, remove it by hand.
    let lock = match SocketLock::acquire(&cfg.socketpath) {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("famez-server: {}", e);
            std::process::exit(1);
        }
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create runtime");
    let local = tokio::task::LocalSet::new();
    let result = local.block_on(&rt, run(cfg));

    drop(lock);
    if let Err(e) = result {
        tracing::error!(error = %e, "broker terminated");
        std::process::exit(1);
    }
}

async fn run(cfg: BrokerConfig) -> Result<(), ServerError> {
    let mailbox = Arc::new(MailboxRegion::create(&cfg.mailbox, cfg.nclients, cfg.smart)?);
    let broker = Rc::new(Broker::new(cfg, mailbox)?);
    arm_doorbells(&broker)?;

    if let Some(port) = broker.cfg.port {
        let state = StatusState {
            mailbox: broker.mailbox.clone(),
        };
        tokio::task::spawn(async move {
            if let Err(e) = status::serve(state, port).await {
                tracing::error!(error = %e, "status endpoint died");
            }
        });
    }

    let listener = tokio::net::UnixListener::bind(&broker.cfg.socketpath)?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            &broker.cfg.socketpath,
            std::fs::Permissions::from_mode(0o666),
        )?;
    }
    tracing::info!("Listening on {}", broker.cfg.socketpath.display());

    tokio::select! {
        _ = accept_loop(broker.clone(), listener) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; shutting down");
        }
    }
    Ok(())
}

fn init_logging(foreground: bool, logfile: &Path, verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if foreground {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
        return;
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logfile)
    {
        Ok(file) => {
            eprintln!("Logging to {}", logfile.display());
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        Err(e) => {
            eprintln!(
                "famez-server: cannot open {}: {}; logging to stderr",
                logfile.display(),
                e
            );
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .init();
        }
    }
}
