use std::time::Duration;

use tokio::task::JoinHandle;

/// Join handles of the polling loops a component spawned in `start`.
#[derive(Default)]
pub(crate) struct BackgroundTasks {
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub(crate) async fn push(&self, handle: JoinHandle<()>) {
        self.handles.lock().await.push(handle);
    }

    /// Await every task, giving each at most `timeout`. Panics inside a task
    /// are logged, never propagated.
    pub(crate) async fn join_all(&self, timeout: Duration) {
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        let total = handles.len();
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    if join_error.is_panic() {
                        let payload = join_error.into_panic();
                        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                            (*s).to_string()
                        } else if let Some(s) = payload.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "unknown panic".to_string()
                        };
                        tracing::error!(
                            task_index = i,
                            task_count = total,
                            panic_message = %msg,
                            "background task panicked during shutdown"
                        );
                    } else {
                        tracing::warn!(
                            task_index = i,
                            task_count = total,
                            error = %join_error,
                            "background task failed during shutdown"
                        );
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        task_index = i,
                        task_count = total,
                        timeout_ms = timeout.as_millis() as u64,
                        "background task did not finish before shutdown timeout"
                    );
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }
}
