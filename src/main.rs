// src/main.rs — accountantd entrypoint
//
// Three subcommands: `serve` runs the control-socket daemon, `inspect`
// is a thin GET client against a running daemon, `simulate` drives the
// engine in-process against synthetic packets for local demoing without
// a socket at all.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};

use accountantd::clock::SystemClock;
use accountantd::config::EngineConfig;
use accountantd::{
    accountant::Packet, identity::CheckKind, identity::IdentityConfig, identity::Mode,
    wire, ControlServer, Coordinator,
};

const DEFAULT_CONFIG_PATH: &str = "/etc/accountantd/config.toml";

#[derive(Parser)]
#[command(
    name = "accountantd",
    version = "0.1.0",
    about = "accountantd — per-identity connected-time accounting engine",
    long_about = "accountantd accounts per-identity connected time for a packet-filter \
                  host, exposing a binary GET/SET control protocol over a unix socket."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Emit machine-readable JSON instead of plain text where supported.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control-socket daemon, accepting one connection at a time.
    Serve,
    /// Issue a single-IP GET against a running daemon and print the result.
    Inspect {
        /// Identity id to query.
        id: String,
        /// Specific IP (dotted quad) to look up; omit for the combined key.
        #[arg(long)]
        ip: Option<std::net::Ipv4Addr>,
    },
    /// Drive the engine in-process with synthetic packets; prints the
    /// resulting accumulator state. Useful for demoing quantization and
    /// reset behavior without standing up a socket.
    Simulate {
        /// Number of one-second synthetic packets to inject.
        #[arg(long, default_value_t = 60)]
        packets: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    let config = EngineConfig::load_or_default(&cli.config);
    accountantd::logging::init(&config.log_filter);

    match cli.command {
        Commands::Serve => run_serve(&config),
        Commands::Inspect { id, ip } => run_inspect(&config, &id, ip),
        Commands::Simulate { packets } => run_simulate(cli.json, packets),
    }
}

fn run_serve(config: &EngineConfig) {
    let clock = SystemClock::new(config.initial_tz_offset_minutes);
    let coordinator = Coordinator::new(config.initial_tz_offset_minutes);
    let server = ControlServer::new(&coordinator, &clock);

    let _ = std::fs::remove_file(&config.control_socket_path);
    let listener = match UnixListener::bind(&config.control_socket_path) {
        Ok(l) => l,
        Err(e) => {
            error!(path = %config.control_socket_path, error = %e, "failed to bind control socket");
            std::process::exit(1);
        }
    };
    info!(path = %config.control_socket_path, "accountantd listening");

    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => {
                if let Err(e) = server.serve_one(&mut stream) {
                    error!(error = %e, "control request failed");
                }
            }
            Err(e) => error!(error = %e, "accept failed"),
        }
    }
}

fn run_inspect(config: &EngineConfig, id: &str, ip: Option<std::net::Ipv4Addr>) {
    let mut stream = match UnixStream::connect(&config.control_socket_path) {
        Ok(s) => s,
        Err(e) => {
            error!(path = %config.control_socket_path, error = %e, "failed to connect to daemon");
            std::process::exit(1);
        }
    };

    let mut body = vec![0u8; wire::GetRequest::WIRE_LEN];
    let ip_value = ip.map(u32::from).unwrap_or(0);
    body[0..4].copy_from_slice(&ip_value.to_le_bytes());
    body[9..9 + id.len().min(49)].copy_from_slice(&id.as_bytes()[..id.len().min(49)]);

    let mut frame = Vec::with_capacity(6 + body.len());
    frame.extend_from_slice(&wire::OP_GET.to_le_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);

    if stream.write_all(&frame).is_err() {
        error!("failed to send GET request");
        std::process::exit(1);
    }

    let mut response = Vec::new();
    if stream.read_to_end(&mut response).is_err() || response.is_empty() {
        error!("no response from daemon");
        std::process::exit(1);
    }

    println!("error_code={} response_bytes={}", response[0], response.len());
}

fn run_simulate(as_json: bool, packets: u64) {
    let clock = accountantd::clock::testing::FakeClock::new(0, 0);
    let coordinator = Coordinator::new(0);
    let handle = coordinator
        .register_identity(
            IdentityConfig {
                id: "demo".into(),
                mode: Mode::Combined,
                check_kind: CheckKind::Monitor,
                local_subnet: 0,
                local_subnet_mask: 0,
                reset_policy: accountantd::epoch::ResetPolicy::FixedInterval {
                    period_seconds: 3600,
                    anchor_seconds: 0,
                },
                cutoff: 0,
                keep_history: false,
                history_capacity: 0,
            },
            &clock,
        )
        .expect("demo identity registration cannot fail");

    for t in 0..packets {
        clock.set_now(t);
        coordinator.on_match(
            handle,
            CheckKind::Monitor,
            Packet {
                src: u32::from(std::net::Ipv4Addr::new(10, 0, 0, 1)),
                dst: u32::from(std::net::Ipv4Addr::new(10, 0, 0, 2)),
            },
            &clock,
        );
    }

    let current = coordinator.with_store(|store| {
        store
            .lookup_by_name("demo")
            .and_then(|h| store.get(h))
            .map(|s| s.current)
            .unwrap_or(0)
    });

    if as_json {
        println!("{}", json!({ "packets": packets, "current": current }));
    } else {
        println!("[simulate] injected {packets} packets, current = {current}");
    }
}
