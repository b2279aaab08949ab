use clap::Parser;
use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::process;
use tracing_subscriber::EnvFilter;

use dns_portal::server::{Processed, Server, ServerError};
use dns_portal::settings::{DEFAULT_ERROR_RCODE, DEFAULT_TTL};
use dns_types::protocol::types::*;

use portald::metrics;
use portald::transport::UdpTransport;

/// Handle every datagram which is waiting, then return to the event
/// loop.
fn drain(server: &mut Server<UdpTransport>) {
    loop {
        match server.process_next_request() {
            Ok(Processed::Idle) => return,
            Ok(Processed::Handled(disposition)) => metrics::record(&disposition),
            Err(ServerError::Io(error)) => {
                metrics::DNS_TRANSPORT_ERRORS_TOTAL.inc();
                tracing::warn!(?error, "transport error");
                return;
            }
            Err(error) => {
                tracing::error!(%error, "could not process request");
                return;
            }
        }
    }
}

fn begin_logging() {
    let log_format = env::var("RUST_LOG_FORMAT").unwrap_or_default();
    let options: Vec<&str> = log_format.split(',').map(str::trim).collect();
    let ansi = !options.contains(&"no-ansi");
    let time = !options.contains(&"no-time");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let logger = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi);

    match (options.first().copied().unwrap_or("full"), time) {
        ("json", true) => logger.json().init(),
        ("json", false) => logger.json().without_time().init(),
        ("pretty", true) => logger.pretty().init(),
        ("pretty", false) => logger.pretty().without_time().init(),
        ("compact", true) => logger.compact().init(),
        ("compact", false) => logger.compact().without_time().init(),
        (_, true) => logger.init(),
        (_, false) => logger.without_time().init(),
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser)]
/// A DNS server for captive portals.
///
/// portald answers A queries for a single domain, or for every domain
/// if the domain is '*', with one IPv4 address: typically the address
/// of the portal's web server.
///
/// Queries for other names get an error reply or, if an upstream
/// nameserver is given, are forwarded to it.  Only a handful of
/// forwarded queries are tracked at once, and the oldest is forgotten
/// when that limit is reached.
///
/// It only speaks DNS over UDP on IPv4.  Logging is configured with
/// RUST_LOG and RUST_LOG_FORMAT (full, compact, pretty, or json,
/// optionally followed by ",no-time" and ",no-ansi").
struct Args {
    /// Interface to listen on
    #[clap(short, long, default_value_t = Ipv4Addr::UNSPECIFIED, env = "PORTALD_INTERFACE")]
    interface: Ipv4Addr,

    /// Port to listen on
    #[clap(short, long, default_value_t = DNS_PORT, env = "PORTALD_PORT")]
    port: u16,

    /// Domain to answer for ('www.' is implied), or '*' for every domain
    #[clap(short, long, default_value = "*", env = "PORTALD_DOMAIN")]
    domain: String,

    /// Address to answer with
    #[clap(short, long, default_value_t = Ipv4Addr::new(192, 168, 4, 1), env = "PORTALD_RESOLVED_IP")]
    resolved_ip: Ipv4Addr,

    /// TTL of answers, in seconds
    #[clap(short, long, default_value_t = DEFAULT_TTL, env = "PORTALD_TTL")]
    ttl: u32,

    /// Error code for other names when not forwarding, by name (eg,
    /// 'refused') or number
    #[clap(short, long, default_value_t = DEFAULT_ERROR_RCODE, env = "PORTALD_ERROR_RCODE")]
    error_rcode: Rcode,

    /// Nameserver to forward queries for other names to
    #[clap(short, long, env = "PORTALD_UPSTREAM")]
    upstream: Option<Ipv4Addr>,

    /// Address to serve Prometheus metrics on, at /metrics
    #[clap(short, long, env = "PORTALD_METRICS_ADDRESS")]
    metrics_address: Option<SocketAddr>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    begin_logging();

    if let Some(address) = args.metrics_address {
        tokio::spawn(async move {
            tracing::info!(%address, "serving metrics");
            if let Err(error) = metrics::serve_prometheus_endpoint_task(address).await {
                tracing::error!(%address, ?error, "could not serve metrics");
                process::exit(1);
            }
        });
    }

    let mut server = Server::new(UdpTransport::new(args.interface));
    server.set_ttl(args.ttl);
    server.set_error_reply_code(args.error_rcode);

    tracing::info!(interface = %args.interface, port = args.port, "binding");
    if let Err(error) = server.start(
        args.port,
        &args.domain,
        args.resolved_ip,
        args.upstream,
    ) {
        tracing::error!(%error, "could not start server");
        process::exit(1);
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            readable = server.transport().readable() => {
                if let Err(error) = readable {
                    tracing::error!(?error, "socket error");
                    process::exit(1);
                }
                drain(&mut server);
            }
            _ = &mut shutdown => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    server.stop();
}
