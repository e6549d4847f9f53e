//! The transfer-worker pool: drives queued tasks through the API client.

use std::sync::Arc;

use ecmwf_api::{ApiError, Client, ClientOptions, Credentials, RequestParams};
use tracing::{error, info};

use crate::{
    handler::SharedReceiver,
    store::{TaskId, TaskStatus, TaskStore},
};

/// Consumes task ids from the task queue, runs each transfer, and
/// migrates the record to the completed store with its final status.
pub(crate) struct TransferWorker {
    pub store: Arc<TaskStore>,
    pub credentials: Credentials,
    pub disable_ssl_validation: bool,
}

impl TransferWorker {
    pub async fn run(self, tasks: SharedReceiver<TaskId>) {
        loop {
            let next = tasks.lock().await.recv().await;
            // Queue closure is the stop signal; everything still queued
            // at that point has already been drained to us.
            let Some(task_id) = next else { break };

            // Cancelled-while-queued tasks are no longer claimable.
            let Some(task_data) = self.store.claim(&task_id) else {
                continue;
            };

            info!("Starting transfer {task_id}");
            let status = match self.transfer(task_data).await {
                Ok(()) => TaskStatus::Completed,
                Err(error) => {
                    error!("Transfer {task_id} failed: {error}");
                    TaskStatus::Failed
                }
            };
            self.store.finish(&task_id, status);
            info!("Transfer {task_id} {status}");
        }
    }

    async fn transfer(
        &self,
        task_data: RequestParams,
    ) -> Result<(), ApiError> {
        let options = ClientOptions {
            disable_ssl_validation: self.disable_ssl_validation,
            ..ClientOptions::default()
        };
        let client =
            Client::with_options(self.credentials.clone(), options);
        client.retrieve(vec![task_data]).await
    }
}
