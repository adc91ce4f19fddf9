use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::Operation;
use crate::error::SdkError;
use crate::module::{ModuleContext, ModuleResult};

// At most `workers` module calls run at a time across all requests.
#[derive(Clone)]
pub struct ModuleExecutor {
    permits: Arc<Semaphore>,
    grace: Duration,
}

impl ModuleExecutor {
    pub fn new(workers: usize, grace: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            grace,
        }
    }

    pub async fn run<T, F>(
        &self,
        operation: Operation,
        cancel: &CancellationToken,
        job: F,
    ) -> Result<T, SdkError>
    where
        F: FnOnce(&ModuleContext) -> ModuleResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(SdkError::Cancelled(format!("{operation} cancelled before module call")));
            }
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| SdkError::Server("module pool closed".to_string()))?
            }
        };

        debug!(%operation, "module call start");
        let context = ModuleContext::new(cancel.clone());
        // The permit lives as long as the call itself, even if the request gives up on it.
        let mut handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job(&context)
        });

        let joined = tokio::select! {
            biased;
            joined = &mut handle => joined,
            _ = cancel.cancelled() => {
                return match tokio::time::timeout(self.grace, &mut handle).await {
                    Ok(_) => Err(SdkError::Cancelled(format!("{operation} cancelled during module call"))),
                    Err(_) => {
                        warn!(%operation, grace = ?self.grace, "module call ignored cancellation");
                        Err(SdkError::ModuleExecution(format!(
                            "{operation} did not stop within grace period"
                        )))
                    }
                };
            }
        };
        if cancel.is_cancelled() && matches!(joined, Ok(Err(_))) {
            return Err(SdkError::Cancelled(format!("{operation} stopped on cancellation")));
        }
        flatten(operation, joined)
    }
}

fn flatten<T>(operation: Operation, joined: Result<ModuleResult<T>, JoinError>) -> Result<T, SdkError> {
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(SdkError::ModuleExecution(format!("{operation}: {err}"))),
        Err(err) if err.is_panic() => Err(SdkError::ModuleExecution(format!(
            "{operation} panicked: {}",
            panic_message(err.into_panic())
        ))),
        Err(err) => Err(SdkError::ModuleExecution(format!("{operation}: {err}"))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
