//! bininja - console client for BiNinja download servers

use anyhow::{Context, Result};
use bininja::cli::Args;
use bininja::config::ClientConfig;
use bininja::console::{Console, Flow};
use bininja::controller::ConnectionController;
use bininja::endpoint::parse_endpoint;
use bininja::ui::{ConsoleUi, Ui};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "BININJA_LOG";

fn init_tracing(config: &ClientConfig, verbose: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        let fallback = if verbose { "debug" } else { "info" };
        let directive = config.log_filter.as_deref().unwrap_or(fallback);
        EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(fallback))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ClientConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.headless {
        config.headless = true;
    }
    if args.public_key.is_some() {
        config.public_key = args.public_key.clone();
    }
    if args.download_dir.is_some() {
        config.download_dir = args.download_dir.clone();
    }
    init_tracing(&config, args.verbose);

    let ui = Arc::new(ConsoleUi::new(config.headless, config.download_dir.clone()));
    let controller =
        ConnectionController::new(config.clone(), ui.clone()).context("start client")?;

    {
        let controller = controller.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
            controller.exit();
            // 128 + SIGINT
            std::process::exit(130);
        })
        .context("install Ctrl-C handler")?;
    }

    let console = Console::new(controller.clone(), ui.clone());
    let outcome = run(&args, &config, &controller, &console, &ui);
    controller.exit();
    outcome
}

fn run(
    args: &Args,
    config: &ClientConfig,
    controller: &Arc<ConnectionController>,
    console: &Console,
    ui: &ConsoleUi,
) -> Result<()> {
    if let Some(host) = &args.host {
        let ep = parse_endpoint(host, config.port)
            .with_context(|| format!("invalid server address '{}'", host))?;
        if let Err(e) = controller.connect(&ep.host, ep.port) {
            ui.show_error(&format!("Could not connect to {}: {}", ep, e));
            if args.command.is_some() || args.script.is_some() {
                return Err(e).context("connect");
            }
        }
    }

    let batch = if let Some(command) = &args.command {
        Some(console.enter(command)?)
    } else if let Some(script) = &args.script {
        Some(console.run_script(script)?)
    } else {
        None
    };

    match batch {
        Some(Flow::Exit) => Ok(()),
        Some(Flow::Continue) => {
            controller.wait_for_downloads().context("waiting for downloads")?;
            Ok(())
        }
        None if config.headless => {
            // Headless without commands: nothing to ask for, finish what is running
            controller.wait_for_downloads().context("waiting for downloads")?;
            Ok(())
        }
        None => console.run_interactive(),
    }
}
