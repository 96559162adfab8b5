use aquahub::console::{ConsoleCommand, ParseError, USAGE};
use aquahub::handlers::{EventSink, HubEvent, RouterStats};
use aquahub::{ConnectionManager, HubConfig};
use clap::Parser;
use color_eyre::Result;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Connects a server to device communities spread over several MQTT brokers
#[derive(Parser, Debug)]
#[command(name = "aquahub", version, about)]
struct Cli {
    /// Hub config file (defaults to <config dir>/aquahub/hub.toml)
    #[arg(short, long, env = "AQUAHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(cli.verbose)?;

    let path = match cli.config {
        Some(path) => path,
        None => HubConfig::default_path()?,
    };
    info!("Loading config from {}", path.display());
    let config = HubConfig::load(&path).await?;
    if config.brokers.is_empty() {
        warn!("No brokers configured in {}, starting without any", path.display());
    }

    let stats = Arc::new(RouterStats::default());
    let (sink, events) = EventSink::channel(config.event_capacity, stats);
    let event_task = tokio::spawn(log_events(events));

    let manager = ConnectionManager::start(&config, sink);

    tokio::select! {
        res = run_console(&manager) => {
            if let Err(e) = res {
                error!("Console failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    manager.stop().await;
    if let Err(e) = event_task.await {
        warn!("Event consumer ended abnormally: {}", e);
    }
    Ok(())
}

fn setup(verbose: u8) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env(verbose);
    Ok(())
}

fn setup_logging_env(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Consumes hub events until every sender is gone
async fn log_events(mut events: mpsc::Receiver<HubEvent>) {
    while let Some(event) = events.recv().await {
        info!("{}", event);
    }
    debug!("Event stream closed");
}

/// Reads stdin on a plain thread so a blocked read never holds up shutdown
fn spawn_stdin_reader() -> mpsc::Receiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Reads operator commands until `quit` or end of input
async fn run_console(manager: &ConnectionManager) -> Result<()> {
    let mut lines = spawn_stdin_reader();
    println!("{USAGE}");

    while let Some(line) = lines.recv().await {
        let line = line?;
        let command = match ConsoleCommand::parse(&line) {
            Ok(command) => command,
            Err(ParseError::Empty) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };

        let outcome = match command {
            ConsoleCommand::Listen(broker, device) => manager
                .listen(broker, device)
                .await
                .map(|added| format!("listen {device} on {broker}: {}", changed(added))),
            ConsoleCommand::Mute(broker, device) => manager
                .mute(broker, device)
                .await
                .map(|removed| format!("mute {device} on {broker}: {}", changed(removed))),
            ConsoleCommand::Action(broker, device, action) => manager
                .send_action(broker, device, &action)
                .await
                .map(|()| format!("action '{}' sent to {device}", action.actor)),
            ConsoleCommand::Set(broker, device, change) => manager
                .send_setting(broker, device, &change)
                .await
                .map(|()| format!("setting '{}' sent to {device}", change.setting)),
            ConsoleCommand::Greet(broker) => manager
                .greet(broker)
                .await
                .map(|()| format!("greeting sent on {broker}")),
            ConsoleCommand::Status => {
                print_status(manager);
                continue;
            }
            ConsoleCommand::Help => {
                println!("{USAGE}");
                continue;
            }
            ConsoleCommand::Quit => break,
        };

        match outcome {
            Ok(message) => println!("{message}"),
            Err(e) => println!("error: {e}"),
        }
    }
    Ok(())
}

fn changed(flag: bool) -> &'static str {
    if flag {
        "ok"
    } else {
        "unchanged"
    }
}

fn print_status(manager: &ConnectionManager) {
    for status in manager.statuses() {
        match serde_json::to_string(&status) {
            Ok(line) => println!("{line}"),
            Err(e) => println!("status unavailable: {e}"),
        }
    }
    match serde_json::to_string(&manager.router_stats()) {
        Ok(line) => println!("{line}"),
        Err(e) => println!("stats unavailable: {e}"),
    }
}
