mod console;
mod conversations;

use anyhow::Context;
use clap::{Parser, Subcommand};
use convo::config::{self, resolve_base_url, resolve_verify_key};
use convo::transport::{MemoryTransport, MiraiTransport};
use convo::Dispatcher;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

#[derive(Parser)]
#[command(name = "convo")]
#[command(about = "Convo CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: CONVO_CONFIG_PATH or ~/.convo/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Connect to mirai-api-http and run the demo conversations ("echo", "survey") until Ctrl-C.
    Run {
        /// Config file path (default: CONVO_CONFIG_PATH or ~/.convo/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Drive the demo conversations from stdin, e.g. `friend 100 echo` or `group 9000 100 survey`.
    Console {
        /// Config file path (default: CONVO_CONFIG_PATH or ~/.convo/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("convo {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config }) => {
            if let Err(e) = run_bot(config).await {
                log::error!("run failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Console { config }) => {
            if let Err(e) = run_console(config).await {
                log::error!("console failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let dir = convo::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_bot(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    log::info!("loaded config from {}", path.display());

    let transport = Arc::new(
        MiraiTransport::new(
            resolve_base_url(&config),
            resolve_verify_key(&config),
            config.mirai.qq,
        )
        .with_polling(config.mirai.fetch_count, config.mirai.poll_interval()),
    );
    transport
        .connect()
        .await
        .context("connecting to mirai-api-http")?;

    let dispatcher = Arc::new(
        Dispatcher::new(transport.clone(), conversations::demo_factory)
            .with_idle_timeout(config.dispatcher.idle_timeout()),
    );
    let events = dispatcher.start().await?;
    let poll = transport.clone().start_polling();
    println!("convo running for qq {}; press Ctrl-C to stop", config.mirai.qq);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    log::info!("shutdown signal received, stopping transport");
    transport.stop();
    let aborted = dispatcher.registry().abort_all().await;
    log::info!("aborted {} running conversation(s)", aborted);
    if let Err(e) = poll.await {
        log::debug!("poll task ended abnormally: {}", e);
    }
    events.abort();
    transport
        .release()
        .await
        .context("releasing mirai session")?;
    Ok(())
}

async fn run_console(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let transport = Arc::new(MemoryTransport::new());
    let dispatcher = Arc::new(
        Dispatcher::new(transport.clone(), conversations::demo_factory)
            .with_idle_timeout(config.dispatcher.idle_timeout()),
    );
    let events = dispatcher.start().await?;

    let printer = tokio::spawn(console::forward_sent(transport.watch_sent(), |line| {
        println!("< {}", line)
    }));

    println!("{}", console::USAGE);
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        match console::parse_line(input) {
            Ok(event) => transport.push(event).await?,
            Err(e) => eprintln!("{}", e),
        }
    }

    dispatcher.registry().abort_all().await;
    events.abort();
    printer.abort();
    Ok(())
}
