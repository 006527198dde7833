//! Serves a directory over HTTPS and HTTP/3 on the same port.
//!
//! ```text
//! cargo run --example static_h3 -- ./public cert.pem key.pem
//! ```

use std::env;
use trellis_web::{
    limits::{QuicLimits, TlsConfig},
    Server,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = env::args().skip(1);
    let root = args.next().unwrap_or_else(|| "./public".into());
    let cert = args.next().unwrap_or_else(|| "cert.pem".into());
    let key = args.next().unwrap_or_else(|| "key.pem".into());

    let addr = "0.0.0.0:4433".parse().unwrap();
    let tls = TlsConfig::new(cert, key);

    Server::builder()
        .listen_tls(addr, tls.clone())
        .listen_quic(addr, tls)
        .get_static("/", root)
        .quic_limits(QuicLimits {
            debug: true,
            ..QuicLimits::default()
        })
        .build()
        .unwrap()
        .launch()
        .await
        .unwrap();
}
