use metrics::counter;
use rekon_core::{ErrorClass, ObjectKey, RemoteError};
use tracing::error;

/// Failure of a single reconcile pass.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Logic(#[from] anyhow::Error),
    #[error("reconcile panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Remote(e) => e.class(),
            ReconcileError::Logic(_) | ReconcileError::Panicked(_) => ErrorClass::PermanentLogic,
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, ReconcileError::Remote(e) if e.is_not_found()) }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("controller {0} cancelled before its cache synced")]
    SyncAborted(String),
}

/// Process-wide destination for keys the controller gave up on.
pub trait ErrorSink: Send + Sync + 'static {
    fn report(&self, controller: &str, key: &ObjectKey, error: &ReconcileError);
}

/// Logs the final error and counts it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, controller: &str, key: &ObjectKey, error: &ReconcileError) {
        error!(controller, key = %key, class = ?error.class(), error = %error, "dropping key out of the queue");
        counter!("controller_give_ups_total", 1u64, "controller" => controller.to_string());
    }
}
