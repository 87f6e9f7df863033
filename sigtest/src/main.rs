//! Entry point for `sigtest`.
//!
//! Parses flags, sets up logging and Ctrl-C handling, and hands a validated
//! [`TestConfig`] to the [`Harness`].  All test logic lives in the library.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{CommandFactory, Parser};

use sigtest::config::{Role, TestConfig, TransportKind, DEFAULT_BUS_ADDRESS};
use sigtest::harness::Harness;
use sigtest::signal::MIN_PAYLOAD;

const EXAMPLES: &str = "\
Examples:
  host, waiting for one client:   sigtest -s -m 2 -r 10
  client:                         sigtest -m 2 -r 10";

/// Exchange sequence-numbered signals inside a session and count losses.
#[derive(Parser, Debug)]
#[command(author, version, about, after_help = EXAMPLES)]
struct Cli {
    /// Delay between signals in ms (0 sends back-to-back).
    #[arg(short = 'r', long = "rate", value_name = "MS", default_value_t = 0)]
    rate: u64,

    /// Signal TTL in seconds.
    #[arg(short = 't', long, value_name = "SECS", default_value_t = 30)]
    ttl: u32,

    /// Payload size in bytes (the ceiling with --random).
    #[arg(long, value_name = "BYTES", default_value_t = MIN_PAYLOAD)]
    payload: usize,

    /// Well-known name the host advertises.
    #[arg(short = 'n', long, default_value = "org.alljoyn.signaltest")]
    name: String,

    /// Prefix a client looks for.
    #[arg(short = 'f', long, default_value = "sigtest")]
    prefix: String,

    /// Randomize the payload size (two participants only).
    #[arg(long)]
    random: bool,

    /// Interleave infinite and fixed TTLs at random (two participants only).
    #[arg(long = "random-ttl")]
    random_ttl: bool,

    /// How long to keep sending, in ms.
    #[arg(long, value_name = "MS", default_value_t = 60_000)]
    sleep: u64,

    /// Participants in the session, this peer included.
    #[arg(short = 'm', long = "mem", value_name = "N", default_value_t = 0)]
    mem: u32,

    /// Host the session instead of joining one.
    #[arg(short = 's', long)]
    server: bool,

    /// Link carrying the session: tcp or udp.
    #[arg(long, default_value_t = TransportKind::Tcp)]
    transport: TransportKind,

    /// Session host address.
    #[arg(long = "bus-address", env = "BUS_ADDRESS", default_value = DEFAULT_BUS_ADDRESS)]
    bus_address: String,

    /// Extra per-signal timing output.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Mark sent signals as compressed.
    #[arg(short = 'x', long)]
    compress: bool,
}

impl Cli {
    fn test_config(&self) -> TestConfig {
        TestConfig {
            signal_delay: Duration::from_millis(self.rate),
            ttl_secs: self.ttl,
            payload_size: self.payload,
            well_known_name: self.name.clone(),
            prefix: self.prefix.clone(),
            randomize_payload: self.random,
            interleave_ttl: self.random_ttl,
            run_duration: Duration::from_millis(self.sleep),
            participants: self.mem,
            role: if self.server { Role::Host } else { Role::Client },
            transport: self.transport,
            debug: self.debug,
            compress: self.compress,
            ..TestConfig::default()
        }
    }
}

async fn resolve(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = addr.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("cannot resolve bus address {addr}"))?
        .next()
        .ok_or_else(|| anyhow!("bus address {addr} resolved to nothing"))
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = cli.test_config();
    config.validate()?;
    config.bus_address = resolve(&cli.bus_address).await?;

    let harness = Harness::new(config)?;

    let interrupt = harness.interrupt_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, stopping");
            interrupt.cancel();
        }
    });

    let outcome = harness.run().await?;
    log::info!(
        "{} signals sent, {} send failures",
        outcome.sent,
        outcome.send_failures
    );
    Ok(outcome.exit_code())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG still overrides the default level.
    let default_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            eprintln!();
            let _ = Cli::command().print_help();
            1
        }
    };
    std::process::exit(code);
}
