//! Wire sender abstraction
//!
//! The concrete transport is provided by the host process. The contract the
//! upload paths depend on: `send_buffer` always invokes its callback,
//! success or failure, otherwise the forwarder would wait forever.

use thiserror::Error;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("Sender is not configured")]
    NotConfigured,
    #[error("Wrong input data")]
    WrongInputData,
    #[error("Payload type not supported")]
    TypeNotSupported,
    #[error("No connection to the cloud")]
    NoConnection,
    #[error("Quota reached")]
    QuotaReached,
    #[error("Transmission error")]
    TransmissionError,
}

/// Completion callback of one `send_buffer` call.
pub type OnSendCallback = Box<dyn FnOnce(Result<(), ConnectivityError>) + Send>;

pub trait Sender: Send + Sync {
    /// Largest payload the transport accepts in one send.
    fn get_max_send_size(&self) -> usize;

    /// Hand one payload to the transport. The callback fires exactly once.
    fn send_buffer(&self, topic: &str, data: &[u8], on_done: OnSendCallback);
}

/// Sender that confirms every payload without transmitting it. Used for
/// dry-run operation and as the default until a transport is wired in.
pub struct NoopSender {
    max_send_size: usize,
}

impl NoopSender {
    pub fn new(max_send_size: usize) -> Self {
        Self { max_send_size }
    }
}

impl Sender for NoopSender {
    fn get_max_send_size(&self) -> usize {
        self.max_send_size
    }

    fn send_buffer(&self, topic: &str, data: &[u8], on_done: OnSendCallback) {
        tracing::debug!(topic, len = data.len(), "Discarding payload (dry run)");
        on_done(Ok(()));
    }
}
