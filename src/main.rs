//! Addonhost - Main entry point.
//!
//! Headless session runner: starts the configured addons around one game
//! session and tears them down when the game exits.
//!
//! Usage: addonhost [OPTIONS] [-- GAME_EXE [ARGS...]]
//!
//! Options:
//!   --config PATH     Use a specific configuration file
//!   --pid PID         Attach to a running game instead of starting one
//!   --print-config    Print the effective configuration and exit
//!   --version, -v     Show version

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use addonhost::addons::builtin::{Interpreters, OtpCallback, build_entries};
use addonhost::addons::{AddonManager, GameProcess, StartPhase, partition_entries};
use addonhost::config::Config;
use addonhost::logging;

/// Interval between game exit checks.
const GAME_POLL: Duration = Duration::from_millis(500);

/// Parsed command line.
#[derive(Debug, Default)]
struct CliArgs {
    config: Option<PathBuf>,
    pid: Option<u32>,
    game: Vec<String>,
    print_config: bool,
    version: bool,
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut cli = CliArgs::default();
    let mut iter = args.iter().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--version" | "-v" => cli.version = true,
            "--print-config" => cli.print_config = true,
            "--config" => {
                let path = iter.next().ok_or("--config needs a path")?;
                cli.config = Some(PathBuf::from(path));
            }
            "--pid" => {
                let pid = iter.next().ok_or("--pid needs a process id")?;
                cli.pid = Some(pid.parse().map_err(|_| format!("invalid pid: {}", pid))?);
            }
            "--" => {
                cli.game = iter.by_ref().cloned().collect();
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }

    if cli.pid.is_some() && !cli.game.is_empty() {
        return Err("--pid and a game executable are mutually exclusive".to_string());
    }
    Ok(cli)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("Usage: addonhost [--config PATH] [--pid PID | -- GAME_EXE ARGS...]");
            std::process::exit(2);
        }
    };

    if cli.version {
        println!("addonhost v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config_path = cli.config.unwrap_or_else(Config::default_config_path);
    let config = Config::load_or_default(&config_path)?;

    if cli.print_config {
        println!("config: {}", config.config_path.display());
        println!("{:#?}", config.settings);
        for spec in &config.addons {
            println!("{:?}", spec);
        }
        return Ok(());
    }

    let log_dir = logging::log_directory(&config.settings.data_dir);
    if let Err(e) = logging::init(&config.logging, &log_dir) {
        eprintln!("Could not initialize logging: {}", e);
    }
    tracing::info!("Configuration: {}", config.config_path.display());

    let interpreters = Arc::new(Interpreters::resolve());
    let on_otp: OtpCallback = Arc::new(|code: String| {
        tracing::info!("[OTP] Code received");
        println!("otp:{}", code);
    });

    let entries = build_entries(&config.addons, &interpreters, &on_otp);
    let (service_entries, rest) = partition_entries(entries, StartPhase::LauncherInitialized);
    let (session_entries, _) = partition_entries(rest, StartPhase::GameLaunched);

    let launcher = Arc::new(GameProcess::launcher());
    let mut services = AddonManager::new();
    let report = services.run_addons(&launcher, &config.settings, service_entries)?;
    if let Err(e) = report.into_result() {
        tracing::error!("[ADDONS] {}", e);
    }

    let game = match (cli.pid, cli.game.split_first()) {
        (Some(pid), _) => GameProcess::attach(pid),
        (None, Some((exe, game_args))) => GameProcess::spawn(&PathBuf::from(exe), game_args)?,
        (None, None) => {
            eprintln!("No game given; use --pid PID or -- GAME_EXE");
            services.stop_addons();
            std::process::exit(2);
        }
    };
    let game = Arc::new(game);
    tracing::info!("[ADDONS] Game pid {}", game.pid());

    let mut session = AddonManager::new();
    let report = session.run_addons(&game, &config.settings, session_entries)?;
    match report.into_result() {
        Ok(started) => tracing::info!("[ADDONS] Started: {}", started.join(", ")),
        Err(e) => tracing::error!("[ADDONS] {}", e),
    }

    game.wait_for_exit(GAME_POLL);
    tracing::info!("[ADDONS] Game exited");

    session.stop_addons();
    services.stop_addons();
    Ok(())
}
