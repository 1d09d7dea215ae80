use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{ArgGroup, CommandFactory, Parser};

use fcntcp::{client, server, ImpairmentConfig};

#[derive(Debug, Parser)]
#[command(
    name = "fcntcp",
    about = "Reliable file transfer over UDP",
    override_usage = "fcntcp -{c,s} [OPTIONS] [SERVER_ADDRESS] <PORT>",
    group(ArgGroup::new("role").required(true).args(["client", "server"]))
)]
struct Args {
    /// Run as client
    #[arg(short, long)]
    client: bool,
    /// Run as server
    #[arg(short, long)]
    server: bool,
    /// File to send (client only)
    #[arg(short, long, value_name = "FILE")]
    file: Option<PathBuf>,
    /// Retransmission timeout in milliseconds
    #[arg(short, long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: u64,
    /// Print detailed diagnostics
    #[arg(short, long)]
    verbose: bool,
    /// Drop and delay packets to exercise retransmission
    #[arg(short, long)]
    debug: bool,
    /// [SERVER_ADDRESS] PORT
    #[arg(num_args = 1..=2, required = true, value_name = "ADDRESS")]
    endpoint: Vec<String>,
}

fn parse_port(port: &str) -> u16 {
    port.parse().unwrap_or_else(|_| {
        Args::command()
            .error(ErrorKind::ValueValidation, format!("invalid port '{}'", port))
            .exit()
    })
}

fn run_client(args: &Args) -> ExitCode {
    let [address, port] = args.endpoint.as_slice() else {
        Args::command()
            .error(
                ErrorKind::WrongNumberOfValues,
                "client mode requires a server address and a port",
            )
            .exit()
    };

    let Some(path) = &args.file else {
        Args::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "client mode requires --file <FILE>",
            )
            .exit()
    };

    let config = client::Config {
        timeout_ms: args.timeout,
        impairment: args.debug.then(ImpairmentConfig::sender),
        ..Default::default()
    };

    match client::send_file((address.as_str(), parse_port(port)), path, config) {
        Ok(summary) => {
            println!(
                "sent {} bytes in {} segments ({} timeouts, {} fast retransmits) in {:.3}s",
                summary.byte_count,
                summary.segments_sent,
                summary.retransmissions,
                summary.fast_retransmits,
                summary.elapsed.as_secs_f64()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("fcntcp: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run_server(args: &Args) -> ExitCode {
    let [port] = args.endpoint.as_slice() else {
        Args::command()
            .error(ErrorKind::WrongNumberOfValues, "server mode takes only a port")
            .exit()
    };

    let config = server::Config {
        timeout_ms: args.timeout,
        impairment: args.debug.then(ImpairmentConfig::receiver),
        ..Default::default()
    };

    let mut server = match server::Server::bind_with_config(("0.0.0.0", parse_port(port)), config)
    {
        Ok(server) => server,
        Err(err) => {
            eprintln!("fcntcp: {}", err);
            return ExitCode::FAILURE;
        }
    };

    loop {
        match server.wait_event() {
            server::Event::Connect(peer) => {
                tracing::debug!("serving {}", peer);
            }
            server::Event::Finish(transfer) => {
                println!("{}", transfer.digest);
            }
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if args.client {
        run_client(&args)
    } else {
        run_server(&args)
    }
}
