mod config;
mod engine;
mod inflight;
mod pool;
mod proto_utils;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ProxyConfig;
use crate::engine::Engine;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Simple but secure UDP-to-UDP DNS forwarder.\n\n\
             Queries are forwarded with randomized ID and source port, and \
             responses are strictly validated against blind spoofing attacks.",
    long_about = None
)]
struct Args {
    /// IPv4 address of the DNS server to forward queries to
    upstream_address: Option<String>,
    /// UDP port of the upstream DNS server [default: 53]
    upstream_port: Option<u16>,

    /// JSON config file; command line flags override its values
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Listen for DNS queries on this IPv4 address [default: 127.0.0.1]
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,
    /// Listen for DNS queries on this UDP port [default: 9000]
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Maximum seconds to wait for an upstream response; 0 disables
    /// query expiration [default: 15]
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,
    /// Maximum number of forwarded queries handled at the same time;
    /// 0 disables the limit, though the 16-bit query ID still caps it
    /// at 65536 [default: 250]
    #[arg(short = 'r', long = "max-requests")]
    max_requests: Option<u32>,
    /// Expire timed-out queries in batches no more often than this
    /// many seconds; 0 expires each exactly on time [default: 5]
    #[arg(short = 'T', long = "min-gc-time")]
    min_gc_time: Option<u64>,

    /// Maximum number of source ports to forward through; 0 opens a
    /// new port per query until the system runs out [default: 50]
    #[arg(short = 'n', long = "max-ports")]
    max_ports: Option<u32>,
    /// Close a source port after this many queries were forwarded
    /// through it; 0 reuses ports any number of times [default: 10]
    #[arg(short = 'N', long = "max-port-lifetime")]
    max_port_lifetime: Option<u32>,

    /// Seed the pseudo-random number generator to reproduce a previous
    /// run; 0 seeds from the current time.  The seed is printed with
    /// the debug logs
    #[arg(short = 'S', long = "seed")]
    seed: Option<u64>,
    /// Print debug logs, including the queried domains, and enable
    /// extra internal sanity checks
    #[arg(short = 'D', long = "debug")]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // A clean --help or --version is not a failure.
            let code = if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
            let _ = err.print();
            return code;
        }
    };

    let mut cfg = match args.config.as_deref().map(config::load_config).transpose() {
        Ok(cfg) => cfg.unwrap_or_default(),
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::FAILURE;
        }
    };
    apply_args(&mut cfg, args);

    init_tracing(cfg.debug);
    debug!(
        request_timeout = cfg.request_timeout,
        max_requests = cfg.max_requests,
        max_ports = cfg.max_ports,
        max_port_lifetime = cfg.max_port_lifetime,
        min_gc_time = cfg.min_gc_time,
        "configuration"
    );
    info!(
        upstream = %format!("{}:{}", cfg.upstream_address, cfg.upstream_port),
        "upstream server"
    );

    let mut engine = match Engine::bind(&cfg) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::FAILURE;
        }
    };

    engine.run().await;
    ExitCode::SUCCESS
}

/// Command line flags take precedence over the config file.
fn apply_args(cfg: &mut ProxyConfig, args: Args) {
    if let Some(upstream_address) = args.upstream_address {
        cfg.upstream_address = upstream_address;
    }
    if let Some(upstream_port) = args.upstream_port {
        cfg.upstream_port = upstream_port;
    }
    if let Some(listen) = args.listen {
        cfg.listen_address = listen;
    }
    if let Some(port) = args.port {
        cfg.listen_port = port;
    }
    if let Some(timeout) = args.timeout {
        cfg.request_timeout = timeout;
    }
    if let Some(max_requests) = args.max_requests {
        cfg.max_requests = max_requests;
    }
    if let Some(min_gc_time) = args.min_gc_time {
        cfg.min_gc_time = min_gc_time;
    }
    if let Some(max_ports) = args.max_ports {
        cfg.max_ports = max_ports;
    }
    if let Some(max_port_lifetime) = args.max_port_lifetime {
        cfg.max_port_lifetime = max_port_lifetime;
    }
    if let Some(seed) = args.seed {
        cfg.rng_seed = seed;
    }
    if args.debug {
        cfg.debug = true;
    }
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
