use axum::{http::StatusCode, routing};
use prometheus::{
    opts, register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec, TextEncoder,
};
use std::net::SocketAddr;

use dns_portal::dispatch::Disposition;
use dns_types::protocol::types::Rcode;

pub static DNS_REQUESTS_TOTAL: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_requests_total",
        "Total number of datagrams received, whether valid or invalid."
    ))
    .unwrap()
});

pub static DNS_RESPONSES_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec!(
            opts!(
                "dns_responses_total",
                "Total number of DNS responses synthesised (not relayed)."
            ),
            &["rcode"]
        )
        .unwrap()
    });

pub static DNS_FORWARDED_TOTAL: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_forwarded_total",
        "Total number of queries forwarded to the upstream nameserver."
    ))
    .unwrap()
});

pub static DNS_RELAYED_TOTAL: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_relayed_total",
        "Total number of upstream replies relayed back to clients."
    ))
    .unwrap()
});

pub static DNS_FORWARD_OVERFLOW_TOTAL: std::sync::LazyLock<IntCounter> =
    std::sync::LazyLock::new(|| {
        register_int_counter!(opts!(
            "dns_forward_overflow_total",
            "Number of forwarded queries which were evicted before their reply arrived."
        ))
        .unwrap()
    });

pub static DNS_DROPPED_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec!(
            opts!(
                "dns_dropped_total",
                "Total number of datagrams dropped without a reply."
            ),
            &["reason"]
        )
        .unwrap()
    });

pub static DNS_TRANSPORT_ERRORS_TOTAL: std::sync::LazyLock<IntCounter> =
    std::sync::LazyLock::new(|| {
        register_int_counter!(opts!(
            "dns_transport_errors_total",
            "Total number of socket errors while receiving or sending."
        ))
        .unwrap()
    });

/// Fold the outcome of one datagram into the counters.
pub fn record(disposition: &Disposition) {
    DNS_REQUESTS_TOTAL.inc();

    match disposition {
        Disposition::Answered => {
            DNS_RESPONSES_TOTAL
                .with_label_values(&[Rcode::NoError.to_string().as_str()])
                .inc();
        }
        Disposition::ErrorReply(rcode) => {
            DNS_RESPONSES_TOTAL
                .with_label_values(&[rcode.to_string().as_str()])
                .inc();
        }
        Disposition::Forwarded { recycled } => {
            DNS_FORWARDED_TOTAL.inc();
            if *recycled {
                DNS_FORWARD_OVERFLOW_TOTAL.inc();
            }
        }
        Disposition::Relayed => DNS_RELAYED_TOTAL.inc(),
        Disposition::Dropped(reason) => {
            DNS_DROPPED_TOTAL.with_label_values(&[reason.as_str()]).inc();
        }
    }
}

async fn get_metrics() -> (StatusCode, String) {
    match TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(metrics_str) => (StatusCode::OK, metrics_str),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

pub async fn serve_prometheus_endpoint_task(address: SocketAddr) -> std::io::Result<()> {
    let app = axum::Router::new().route("/metrics", routing::get(get_metrics));
    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
