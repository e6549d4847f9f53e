//! The daemon supervisor: allocates the stores and queues, launches the
//! pools and the accept loop, and shepherds an orderly shutdown.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use anyhow::Context;
use ecmwf_api::Credentials;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::info;

use crate::{
    handler::ConnectionHandler, server, shutdown::StopSignal,
    store::TaskStore, worker::TransferWorker,
};

/// Port the daemon listens on by default.
pub const DEFAULT_PORT: u16 = 54500;

/// Capacity of the queue of accepted, not yet handled connections.
const CONNECTION_QUEUE_CAPACITY: usize = 25;
/// Capacity of the queue of submitted, not yet started transfers.
const TASK_QUEUE_CAPACITY: usize = 1000;
const CONNECTION_HANDLERS: usize = 8;
const TRANSFER_WORKERS: usize = 5;

/// Daemon configuration. [`DaemonConfig::new`] listens on
/// `0.0.0.0:54500` and only accepts commands from localhost.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub listen_addr: SocketAddr,
    /// Peers allowed to issue commands; anyone else is dropped before a
    /// single byte is read.
    pub allowed_peers: Vec<IpAddr>,
    /// API credentials handed to the transfer workers.
    pub credentials: Credentials,
    pub disable_ssl_validation: bool,
}

impl DaemonConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            listen_addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                DEFAULT_PORT,
            ),
            allowed_peers: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            credentials,
            disable_ssl_validation: false,
        }
    }
}

/// A running daemon: 8 connection handlers, 5 transfer workers, and the
/// accept loop, all wired together through bounded queues.
pub struct Daemon {
    local_addr: SocketAddr,
    stop: StopSignal,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Binds the listener and launches the pools.
    pub fn spawn(config: DaemonConfig) -> anyhow::Result<Self> {
        let listener = server::bind(config.listen_addr)
            .context("Failed to bind listening socket")?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read local address")?;
        info!("Listening on {local_addr}");

        let stop = StopSignal::new();
        let store = Arc::new(TaskStore::new());
        let (connection_tx, connection_rx) =
            mpsc::channel(CONNECTION_QUEUE_CAPACITY);
        let connection_rx = Arc::new(Mutex::new(connection_rx));
        let (task_tx, task_rx) = mpsc::channel(TASK_QUEUE_CAPACITY);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let allowed_peers = Arc::new(config.allowed_peers);

        let mut tasks =
            Vec::with_capacity(CONNECTION_HANDLERS + TRANSFER_WORKERS + 1);

        for _ in 0..CONNECTION_HANDLERS {
            let handler = ConnectionHandler {
                store: Arc::clone(&store),
                task_tx: task_tx.clone(),
                allowed_peers: Arc::clone(&allowed_peers),
                stop: stop.clone(),
            };
            tasks.push(tokio::spawn(handler.run(Arc::clone(&connection_rx))));
        }
        // The handlers hold the only task-queue senders: once the last
        // handler exits, the workers see the queue close, drain what is
        // left, and finish.
        drop(task_tx);

        for _ in 0..TRANSFER_WORKERS {
            let worker = TransferWorker {
                store: Arc::clone(&store),
                credentials: config.credentials.clone(),
                disable_ssl_validation: config.disable_ssl_validation,
            };
            tasks.push(tokio::spawn(worker.run(Arc::clone(&task_rx))));
        }

        tasks.push(tokio::spawn(server::accept_loop(
            listener,
            connection_tx,
            stop.clone(),
        )));

        Ok(Self {
            local_addr,
            stop,
            tasks,
        })
    }

    /// The address the daemon actually listens on. Differs from the
    /// configured one when port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle that stops the daemon when fired.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Runs until a stop is requested (by the `stop` command, by
    /// [`Daemon::stop_signal`], or by Ctrl-C when `ctrlc` is set), then
    /// waits for the pools to drain. Transfers that already started are
    /// finished, not interrupted.
    pub async fn run(self, ctrlc: bool) -> anyhow::Result<()> {
        if ctrlc {
            let stop = self.stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, shutting down");
                    stop.send();
                }
            });
        }

        self.stop.recv().await;
        for task in self.tasks {
            task.await.context("Daemon task panicked")?;
        }
        info!("Daemon stopped");
        Ok(())
    }
}
