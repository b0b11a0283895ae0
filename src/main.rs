use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use wakeguard::config;
use wakeguard::logging;
use wakeguard::opts::{self, Opt};
use wakeguard::registry::Registry;
use wakeguard::session::Session;

/// Prevent the machine from sleeping while this process runs, by supervising
/// a caffeinate subprocess that can never outlive it.
#[derive(Parser, Debug)]
#[command(name = "wakeguard", version, about)]
pub struct Cli {
    /// Prevent the display from sleeping
    #[arg(short = 'd', long)]
    display: bool,

    /// Prevent the system from idle sleeping
    #[arg(short = 'i', long)]
    idle: bool,

    /// Prevent the disk from idle sleeping
    #[arg(short = 'm', long)]
    disk: bool,

    /// Prevent system sleep entirely
    #[arg(short = 's', long)]
    system: bool,

    /// Assert that the user is active, keeping the display on
    #[arg(short = 'u', long)]
    user: bool,

    /// Hold assertions only while PID is alive
    #[arg(short = 'w', long, value_name = "PID")]
    watch_pid: Option<u32>,

    /// Hold assertions for a fixed number of seconds
    #[arg(short = 't', long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Config file path
    #[arg(short, long, default_value = "wakeguard.toml")]
    config: PathBuf,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Emit the run summary as a JSON line on completion
    #[arg(long)]
    json: bool,

    /// Extra logging (registry activity, subprocess lifecycle)
    #[arg(short, long)]
    verbose: bool,

    /// Suppress everything below warnings
    #[arg(short, long)]
    quiet: bool,
}

/// Options from command-line flags, in flag-declaration order.
fn collect_opts(cli: &Cli) -> Vec<Opt> {
    let mut collected = Vec::new();
    if cli.display {
        collected.push(Opt::Display);
    }
    if cli.idle {
        collected.push(Opt::Idle);
    }
    if cli.disk {
        collected.push(Opt::Disk);
    }
    if cli.system {
        collected.push(Opt::System);
    }
    if cli.user {
        collected.push(Opt::User);
    }
    if let Some(pid) = cli.watch_pid {
        collected.push(Opt::Process(pid));
    }
    if let Some(secs) = cli.timeout {
        collected.push(Opt::Timed(secs));
    }
    collected
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("wakeguard: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(cli.verbose, cli.quiet, &cfg.logging.filter);

    let mut selected = collect_opts(&cli);
    if selected.is_empty() {
        selected = match opts::parse_args(&cfg.session.default_opts) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!(error = %e, "invalid default_opts in config");
                return ExitCode::FAILURE;
            }
        };
    }
    if selected.is_empty() {
        // Same default as running caffeinate with no flags.
        selected.push(Opt::Idle);
    }

    if cli.dry_run {
        let args: Vec<String> = selected.iter().flat_map(|o| o.to_args()).collect();
        println!("wakeguard v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("Options: {:?}", selected);
        println!("Arguments: {}", args.join(" "));
        println!("Limit lifetime: {}", cfg.session.limit_lifetime);
        println!(
            "Intercept termination: {}",
            cfg.session.intercept_termination
        );
        return ExitCode::SUCCESS;
    }

    let registry = Registry::new();
    if let Err(e) = registry.trap_defaults() {
        tracing::error!(error = %e, "failed to install signal traps");
        return ExitCode::FAILURE;
    }

    let mut session = Session::new(selected)
        .limit_lifetime(cfg.session.limit_lifetime)
        .intercept_termination(cfg.session.intercept_termination)
        .capture_output(cfg.logging.capture_output)
        .with_registry(registry);
    let mut events = session.subscribe();

    if let Err(e) = session.start().await {
        tracing::error!(error = %e, "failed to start sleep-prevention session");
        return ExitCode::FAILURE;
    }

    // Runs until the subprocess ends on its own (timed expiry, watched
    // process exit) or a trapped signal stops it and exits the process.
    match events.recv().await {
        Ok(ended) => {
            if cli.json {
                match serde_json::to_string(&ended) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::error!(error = %e, "failed to serialize run summary"),
                }
            }
            match ended.exit_code {
                Some(0) => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            }
        }
        Err(_) => ExitCode::FAILURE,
    }
}
