//! The daemon's stop signal.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// A clonable one-shot stop signal: any holder can fire it, every holder
/// can await it, and firing more than once is harmless.
///
/// Built on the fact that acquiring from a closed [`Semaphore`] fails
/// immediately: closing the semaphore is the signal, and holders that
/// subscribe after the fact still observe it.
#[derive(Clone, Debug)]
pub struct StopSignal {
    inner: Arc<Semaphore>,
}

impl StopSignal {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
        }
    }

    /// Fires the signal. All pending and future [`recv`](Self::recv)
    /// calls complete.
    pub fn send(&self) {
        self.inner.close();
    }

    /// Waits for the signal. Returns immediately if it already fired.
    pub async fn recv(&self) {
        // The semaphore never holds a permit, so acquiring can only end
        // with the close error.
        self.inner
            .acquire()
            .await
            .map(|_| ())
            .expect_err("Stop semaphore has no permits to acquire");
    }

    /// Whether the signal has fired, without waiting.
    pub fn is_stopped(&self) -> bool {
        self.inner.is_closed()
    }
}
