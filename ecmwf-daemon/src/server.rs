//! The daemon's accept loop.

use std::net::SocketAddr;

use tokio::{
    net::{TcpListener, TcpSocket},
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{framed::FramedConnection, shutdown::StopSignal};

const LISTEN_BACKLOG: u32 = 1024;

/// Binds the daemon's listening socket with address reuse, so a restart
/// right after a stop does not hit `EADDRINUSE`.
pub(crate) fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Accepts connections until the stop signal fires, handing each one to
/// the connection queue. The queue sender is dropped on exit, which is
/// what lets the connection handlers drain the queue and finish.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    connection_tx: mpsc::Sender<FramedConnection>,
    stop: StopSignal,
) {
    loop {
        tokio::select! {
            biased;
            () = stop.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let connection =
                        FramedConnection::from_stream(stream, peer);
                    if connection_tx.send(connection).await.is_err() {
                        break;
                    }
                }
                Err(error) => warn!("Failed to accept connection: {error}"),
            },
        }
    }
    info!("Server loop stopped");
}
