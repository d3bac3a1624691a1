//! tunlink: share-link VPN client
//!
//! Converts proxy share-links into an engine config and runs a VPN session
//! through the proxy engine and the tunnel bridge.
//!
//! ```text
//! tunlink convert [--input FILE] [--print]   links -> config.json
//! tunlink show                               print config.json
//! tunlink run [--tun-fd N] [--ask-consent]   interactive session
//! ```

mod assets;
mod console;
mod iface;
mod settings;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tunlink_config::{convert, ConfigError, ConfigStore};
use tunlink_session::{
    Command, EngineClient, ProcessBridge, ProcessEngine, SessionEvent, SessionOrchestrator,
};

use crate::console::Input;
use crate::iface::PreopenedInterface;
use crate::settings::Settings;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "tunlink", version, about = "Share-link VPN client")]
struct Cli {
    /// Settings file (default: ./tunlink.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert share-links (one per line) into the engine config
    Convert {
        /// Read links from FILE instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Print the document instead of saving it
        #[arg(long)]
        print: bool,
    },

    /// Print the saved engine config
    Show,

    /// Run a VPN session
    Run {
        /// Open tunnel descriptor to relay
        #[arg(long)]
        tun_fd: Option<i32>,

        /// Ask for consent before using the tunnel
        #[arg(long)]
        ask_consent: bool,
    },
}

fn init_logging(verbose: bool) {
    let fallback = if verbose {
        "tunlink=debug,tunlink_session=debug,tunlink_config=debug"
    } else {
        "tunlink=info,tunlink_session=info,tunlink_config=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Convert { input, print } => run_convert(&settings, input, print),
        Commands::Show => run_show(&settings),
        Commands::Run {
            tun_fd,
            ask_consent,
        } => run_session(settings, tun_fd, ask_consent),
    }
}

fn run_convert(settings: &Settings, input: Option<PathBuf>, print: bool) -> Result<()> {
    let text = match input {
        Some(path) => fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read stdin")?;
            text
        }
    };

    let conversion = match convert(&text) {
        Ok(conversion) => conversion,
        Err(e) if e.is_notice() => {
            println!("{}", e);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!(
        "Parsed {} link(s), skipped {}",
        conversion.parsed, conversion.skipped
    );

    if print {
        println!("{}", conversion.document.to_pretty_json()?);
        return Ok(());
    }

    let store = ConfigStore::new(&settings.data_dir);
    match store.save(Some(&conversion.document)) {
        Ok(()) => println!("Config saved to {}", store.path().display()),
        Err(e) if e.is_notice() => println!("{}", e),
        Err(e) => return Err(e).context("Failed to save config"),
    }
    Ok(())
}

fn run_show(settings: &Settings) -> Result<()> {
    let store = ConfigStore::new(&settings.data_dir);
    match store.load_text() {
        Ok(text) => println!("{}", text),
        Err(ConfigError::NotFound(_)) => println!("Config file not found."),
        Err(e) => return Err(e).context("Failed to load config"),
    }
    Ok(())
}

fn run_session(settings: Settings, tun_fd: Option<i32>, ask_consent: bool) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tunlink-rt")
        .build()
        .context("Failed to start runtime")?;

    fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("Failed to create {}", settings.data_dir.display()))?;
    assets::ensure_assets(settings.assets_dir.as_deref(), &settings.data_dir);

    let store = Arc::new(ConfigStore::new(&settings.data_dir));
    match store.load() {
        Ok(_) => println!("Config loaded successfully."),
        Err(ConfigError::NotFound(_)) => println!("Config file not found."),
        Err(e) => println!("Failed to load config: {}", e),
    }

    let engine = Arc::new(ProcessEngine::new(
        &settings.engine_binary,
        runtime.handle().clone(),
    ));
    let client = EngineClient::new(engine, &settings.data_dir, store.path(), &settings.session);
    let interface = PreopenedInterface::new(
        tun_fd,
        ask_consent,
        settings.session.interface.session_name.clone(),
    );
    let bridge = Arc::new(ProcessBridge::new(&settings.bridge_binary));

    let (status_tx, status_rx) = crossbeam_channel::unbounded();
    let mut session = SessionOrchestrator::new(
        store,
        client,
        Box::new(interface),
        bridge,
        settings.session.clone(),
        runtime.handle().clone(),
        status_tx,
    );

    let (control_tx, control_rx) = crossbeam_channel::unbounded();
    let interrupt = control_tx.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            let _ = interrupt.send(Input::Quit);
        }
    });

    info!("tunlink session starting");
    session.handle(SessionEvent::User(Command::Start));
    console::run(&mut session, &status_rx, control_tx, &control_rx)?;

    info!("tunlink shutting down");
    Ok(())
}
