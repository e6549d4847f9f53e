use std::net::SocketAddr;

use anyhow::Context;
use ecmwf_api::Credentials;
use ecmwf_daemon::{Daemon, DaemonConfig};

/// Background transfer daemon for the ECMWF data-retrieval API.
#[derive(argh::FromArgs)]
struct DaemonArgs {
    /// the <ip-address:port> to listen on.
    ///
    /// Default: `0.0.0.0:54500`. Env: `ECMWF_DAEMON_LISTEN_ADDR`.
    #[argh(option)]
    listen_addr: Option<SocketAddr>,

    /// skip TLS certificate validation for API calls and downloads.
    #[argh(switch)]
    disable_ssl_validation: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: DaemonArgs = argh::from_env();
    ecmwf_logger::init();

    let credentials = Credentials::discover()
        .context("Failed to discover API credentials")?;

    let mut config = DaemonConfig::new(credentials);
    let env_listen_addr = std::env::var("ECMWF_DAEMON_LISTEN_ADDR")
        .ok()
        .map(|addr| addr.parse().context("Invalid ECMWF_DAEMON_LISTEN_ADDR"))
        .transpose()?;
    if let Some(listen_addr) = args.listen_addr.or(env_listen_addr) {
        config.listen_addr = listen_addr;
    }
    config.disable_ssl_validation = args.disable_ssl_validation;

    let daemon = Daemon::spawn(config)?;
    daemon.run(true).await
}
