use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, ArgGroup, Parser};
use dotenv::dotenv;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytevalve::config::Config;
use bytevalve::networking::{
    interface, DiscoveryRequester, DiscoveryResponder, TransferClient, TransferServer,
};
use bytevalve::TransferError;

#[derive(Parser)]
#[command(name = "bytevalve")]
#[command(about = "Encrypted file transfer and device discovery on the local network", long_about = None)]
#[command(version, disable_version_flag = true)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["info", "listen", "neighbor", "receive", "send", "whoami"])
))]
struct Cli {
    /// Display the hostname, IP address and broadcast address of INT
    #[arg(short = 'i', long, value_name = "INT")]
    info: Option<Option<String>>,

    /// Answer discovery queries from other devices until interrupted
    #[arg(short = 'l', long)]
    listen: bool,

    /// Find other devices on the network attached to INT
    #[arg(short = 'n', long, value_name = "INT")]
    neighbor: Option<Option<String>>,

    /// Receive one file (server mode), optionally written to OUT_PATH
    #[arg(short = 'r', long, value_name = "OUT_PATH")]
    receive: Option<Option<PathBuf>>,

    /// Send FILE_PATH to the receiver at DEST_IP
    #[arg(short = 's', long, num_args = 2, value_names = ["DEST_IP", "FILE_PATH"])]
    send: Option<Vec<String>>,

    /// Display the hostname
    #[arg(short = 'w', long)]
    whoami: bool,

    /// Display the program version
    #[arg(short = 'v', long, action = ArgAction::Version)]
    version: Option<bool>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    // Load .env file if it exists
    dotenv().ok();

    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::init_from_env(env_logger::Env::default().default_filter_or(default_filter));

    let config = Config::from_env();

    match run(cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<TransferError>() {
                Some(transfer_err) => eprintln!("{}", transfer_err),
                None => eprintln!("{:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, config: Config) -> Result<()> {
    if cli.whoami {
        println!("{}", interface::local_hostname());
        return Ok(());
    }
    if cli.listen {
        return listen(&config);
    }
    if let Some(requested) = cli.info {
        return show_info(&config, requested);
    }
    if let Some(requested) = cli.neighbor {
        return find_neighbors(&config, requested);
    }
    if let Some(output) = cli.receive {
        return receive(config, output.as_deref());
    }
    if let Some(args) = cli.send {
        if let [dest_ip, file_path] = args.as_slice() {
            return send(config, dest_ip, Path::new(file_path));
        }
        return Err(anyhow!("--send needs <DEST_IP> <FILE_PATH>"));
    }

    Err(anyhow!("an option is required"))
}

/// Pick the interface to use: the one requested, else the configured default
/// when it exists, else the best interface found on this machine
fn interface_name(config: &Config, requested: Option<String>) -> String {
    if let Some(name) = requested {
        return name;
    }

    if interface::resolve_interface_ip(&config.default_interface).is_ok() {
        return config.default_interface.clone();
    }

    match interface::get_best_interface() {
        Ok(best) => {
            warn!(
                "Interface {} not available, using {} instead",
                config.default_interface, best.name
            );
            best.name
        }
        Err(e) => {
            debug!("No fallback interface: {}", e);
            config.default_interface.clone()
        }
    }
}

fn show_info(config: &Config, requested: Option<String>) -> Result<()> {
    let name = interface_name(config, requested);

    let ip = interface::resolve_interface_ip(&name)?;
    let broadcast = interface::resolve_interface_broadcast(&name)?;

    println!("hostname\t: {}", interface::local_hostname());
    println!("interface\t: {}", name);
    println!("ip_address\t: {}", ip);
    println!("broadcast\t: {}", broadcast);
    Ok(())
}

fn listen(config: &Config) -> Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();

    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Release);
    })
    .context("failed to install Ctrl-C handler")?;

    let responder = DiscoveryResponder::bind(config)?;
    println!("Waiting for discovery queries (Press Ctrl+C to stop)...");

    let answered = responder.run(&cancel, |peer| {
        println!("Receive packets from {}", peer.ip());
    });

    info!("Answered {} discovery queries", answered);
    Ok(())
}

fn find_neighbors(config: &Config, requested: Option<String>) -> Result<()> {
    let name = interface_name(config, requested);
    let requester = DiscoveryRequester::new(config.clone());

    println!("Broadcasting discovery on {}...", name);
    let neighbors = requester.discover(&name, |neighbor| println!("{}", neighbor))?;

    if neighbors.is_empty() {
        println!("No other devices were found on this network");
    }
    Ok(())
}

fn receive(config: Config, output: Option<&Path>) -> Result<()> {
    let mut server = TransferServer::bind(config)?;
    println!("Waiting for connection...");

    let report = server.receive(output)?;
    println!("{} successfully received", report.file_name);
    Ok(())
}

fn send(config: Config, dest_ip: &str, file_path: &Path) -> Result<()> {
    let report = TransferClient::new(config).send_file(dest_ip, file_path)?;
    println!("{} successfully sent", report.file_name);
    Ok(())
}
