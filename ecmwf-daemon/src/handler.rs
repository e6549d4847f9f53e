//! The connection-handler pool: command dispatch for the daemon channel.

use std::{net::IpAddr, sync::Arc};

use ecmwf_api::RequestParams;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::{
    error::HandlerError,
    framed::FramedConnection,
    protocol::{CancelTransfer, Envelope, Response, TransferAdded},
    shutdown::StopSignal,
    store::{TaskId, TaskStatus, TaskStore},
};

/// A queue receiver shared by all workers of one pool.
pub(crate) type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// Serves client connections from the connection queue: authorization
/// check, one framed request, one framed response, close.
pub(crate) struct ConnectionHandler {
    pub store: Arc<TaskStore>,
    pub task_tx: mpsc::Sender<TaskId>,
    pub allowed_peers: Arc<Vec<IpAddr>>,
    pub stop: StopSignal,
}

impl ConnectionHandler {
    pub async fn run(self, connections: SharedReceiver<FramedConnection>) {
        loop {
            let next = connections.lock().await.recv().await;
            // Queue closure is the stop signal.
            let Some(connection) = next else { break };
            self.handle_connection(connection).await;
        }
    }

    async fn handle_connection(&self, mut connection: FramedConnection) {
        let peer = connection.peer_addr().ip();
        if !self.allowed_peers.contains(&peer) {
            warn!("Unauthorized connection from {peer}");
            let _ = connection.close().await;
            return;
        }

        let message = match connection.receive().await {
            Ok(Some(message)) => message,
            // Closed without a full frame; nothing to answer.
            Ok(None) => return,
            Err(error) => {
                warn!("Error while receiving message: {error}");
                return;
            }
        };

        let response = match self.dispatch(&message).await {
            Ok(response) => response,
            Err(error) => {
                warn!("{error}");
                Response::error(error.to_string())
            }
        };
        let encoded = serde_json::to_string(&response)
            .expect("Responses always serialize");
        if let Err(error) = connection.send(&encoded).await {
            warn!("Failed to send response: {error}");
        }
        let _ = connection.close().await;
    }

    async fn dispatch(
        &self,
        message: &str,
    ) -> Result<Response, HandlerError> {
        let message: Value = serde_json::from_str(message)
            .map_err(|error| HandlerError::InvalidJson(error.to_string()))?;
        let envelope: Envelope = serde_json::from_value(message)
            .map_err(|_| HandlerError::InvalidEnvelope)?;

        match envelope.command.as_str() {
            "heartbeat" => Ok(Response::ok(json!({}))),
            "list_active_transfers" =>
                Ok(Response::ok(self.store.list_active())),
            "list_completed_transfers" =>
                Ok(Response::ok(self.store.list_completed())),
            "add_transfer" => self.add_transfer(envelope.data).await,
            "cancel_transfer" => {
                let CancelTransfer { task_id } =
                    serde_json::from_value(envelope.data)
                        .map_err(|_| HandlerError::InvalidParameters)?;
                self.store.cancel(&TaskId::from(task_id))?;
                Ok(Response::ok(json!({})))
            }
            "stop" => {
                info!("Stop command received");
                self.stop.send();
                Ok(Response::ok(json!({})))
            }
            other => Err(HandlerError::InvalidCommand(other.to_owned())),
        }
    }

    /// Registers a new queued task and hands its id to the transfer
    /// workers.
    async fn add_transfer(
        &self,
        data: Value,
    ) -> Result<Response, HandlerError> {
        let params: RequestParams = serde_json::from_value(data)
            .map_err(|_| HandlerError::InvalidParameters)?;
        let task_id = self.store.add(params);
        if self.task_tx.send(task_id.clone()).await.is_err() {
            // The workers are already gone (daemon shutting down).
            self.store.finish(&task_id, TaskStatus::Failed);
            return Err(HandlerError::AddFailed);
        }
        info!("Transfer {task_id} added");
        Ok(Response::ok(TransferAdded {
            task_id: task_id.to_string(),
        }))
    }
}
