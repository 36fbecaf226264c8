use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use synsweep::utils::{file_input, Logger};
use synsweep::{ScanCallbacks, ScanConfig, ScanProgress, ScanResult, ScanState, Scanner};
use tokio::sync::mpsc;

enum Event {
    Result(ScanResult),
    Progress(ScanProgress),
}

fn build_cli() -> Command {
    Command::new("synsweep")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Asynchronous TCP SYN sweep of one port across IPv4/IPv6 address lists")
        .arg(
            Arg::new("targets")
                .value_name("TARGETS")
                .help("File with one target record per line (IP, CIDR or range), or - for stdin")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("TCP port to probe")
                .required(true)
                .value_parser(clap::value_parser!(u16).range(1..)),
        )
        .arg(
            Arg::new("rate")
                .short('r')
                .long("rate")
                .value_name("PPS")
                .help("Maximum probes per second")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("window")
                .short('w')
                .long("window")
                .value_name("MS")
                .help("How long to wait for each reply, in milliseconds")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file (default: ~/.synsweep.toml)"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print one JSON object per event instead of text")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase log verbosity (repeatable)")
                .action(ArgAction::Count),
        )
}

fn load_config(matches: &clap::ArgMatches) -> Result<ScanConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => ScanConfig::from_toml_file(path)
            .with_context(|| format!("Invalid configuration in {}", path))?,
        None => ScanConfig::load_default_config(),
    };

    if let Some(&rate) = matches.get_one::<u64>("rate") {
        config = config.with_rate_limit(rate);
    }
    if let Some(&window) = matches.get_one::<u64>("window") {
        config = config.with_observation_window(window);
    }

    config.validate()?;
    Ok(config)
}

fn progress_bar(total: u64, hidden: bool) -> Result<ProgressBar> {
    if hidden {
        return Ok(ProgressBar::hidden());
    }

    let progress = ProgressBar::new(total);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, {eta})")?
            .progress_chars("#>-"),
    );
    Ok(progress)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    Logger::init(Logger::level_for(matches.get_count("verbose")));

    let config = load_config(&matches)?;
    let json = matches.get_flag("json");
    let port = *matches
        .get_one::<u16>("port")
        .context("--port is required")?;
    let source = matches
        .get_one::<String>("targets")
        .context("a target list is required")?;

    let text = file_input::read_targets(source)?;
    let scanner = Scanner::with_config(&text, config)
        .with_context(|| format!("No usable targets in {}", source))?;
    Logger::log_scan_start(source, scanner.total_count(), port);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let result_tx = tx.clone();
    let callbacks = ScanCallbacks::new(
        move |result| {
            let _ = result_tx.send(Event::Result(result));
        },
        move |progress| {
            let _ = tx.send(Event::Progress(progress));
        },
    );

    if let Err(e) = scanner.start_scan(port, callbacks) {
        if e.is_permission() {
            eprintln!(
                "{} {}",
                "Raw sockets need root or CAP_NET_RAW:".bright_red().bold(),
                e
            );
            eprintln!("   sudo setcap cap_net_raw+ep $(which synsweep)");
        }
        return Err(e.into());
    }

    let progress = progress_bar(scanner.total_count(), json)?;
    let outcome = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(Event::Progress(update)) => progress.set_position(update.current_count),
                Some(Event::Result(result)) if result.state == ScanState::Success => {
                    if json {
                        println!("{}", serde_json::to_string(&result)?);
                    } else if let Some(addr) = result.address {
                        progress.println(format!(
                            "{} {}",
                            "open".bright_green().bold(),
                            format!("{}:{}", addr, result.port).bright_cyan()
                        ));
                    }
                }
                Some(Event::Result(result)) => {
                    if json {
                        println!("{}", serde_json::to_string(&result)?);
                    }
                    break result.state;
                }
                None => break ScanState::Cancelled,
            },
            _ = tokio::signal::ctrl_c() => {
                progress.println("Cancelling, waiting for in-flight probes...".yellow().to_string());
                let _ = scanner.cancel_scan();
            }
        }
    };
    progress.finish_and_clear();

    if let Some(stats) = scanner.stats() {
        Logger::log_scan_complete(&stats);
        if !json {
            let label = match outcome {
                ScanState::Cancelled => "Cancelled".yellow().bold(),
                _ => "Completed".bright_green().bold(),
            };
            println!(
                "{} {} probes sent, {} open, {} closed, {} unanswered in {:.2}s",
                label,
                stats.packets_sent,
                stats.open.to_string().bright_green().bold(),
                stats.closed,
                stats.expired + stats.abandoned,
                stats.elapsed.as_secs_f64()
            );
        }
    }

    // Freeing blocks until the session has fully drained
    tokio::task::spawn_blocking(move || scanner.free()).await?;
    Ok(())
}
