use crate::core::{Result, RunnerError};
use futures::future::BoxFuture;
use std::sync::Mutex;
use tracing::debug;

enum Task {
    Sync(std::thread::JoinHandle<Result<()>>),
    Async(tokio::task::JoinHandle<Result<()>>),
}

fn join_blocking(task: Task) -> Result<()> {
    match task {
        Task::Sync(handle) => handle
            .join()
            .map_err(|_| RunnerError::ThreadPanicked("background thread panicked".to_string()))?,
        Task::Async(handle) => futures::executor::block_on(handle)
            .map_err(|err| RunnerError::ThreadPanicked(err.to_string()))?,
    }
}

async fn join_async(task: Task) -> Result<()> {
    match task {
        Task::Sync(handle) => tokio::task::spawn_blocking(move || handle.join())
            .await
            .map_err(|err| RunnerError::ThreadPanicked(err.to_string()))?
            .map_err(|_| RunnerError::ThreadPanicked("background thread panicked".to_string()))?,
        Task::Async(handle) => handle
            .await
            .map_err(|err| RunnerError::ThreadPanicked(err.to_string()))?,
    }
}

/// Named background worker. Jobs run one after another in submission order;
/// the first failure is kept and re-raised by `wait`.
pub struct ThreadEntity {
    id: String,
    tail: Mutex<Option<Task>>,
}

impl ThreadEntity {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            tail: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a job on a dedicated OS thread.
    pub fn run_blocking(&self, job: Box<dyn FnOnce() -> Result<()> + Send>) -> Result<()> {
        let mut tail = self.tail.lock()?;
        let previous = tail.take();
        let handle = std::thread::Builder::new()
            .name(format!("unified-{}", self.id))
            .spawn(move || {
                if let Some(previous) = previous {
                    join_blocking(previous)?;
                }
                job()
            })
            .map_err(|err| RunnerError::InvalidState(format!("cannot spawn thread: {}", err)))?;
        *tail = Some(Task::Sync(handle));
        debug!(thread = %self.id, "Queued blocking job");
        Ok(())
    }

    /// Queue a job on the current tokio runtime.
    pub fn run_async(&self, job: BoxFuture<'static, Result<()>>) -> Result<()> {
        let mut tail = self.tail.lock()?;
        let previous = tail.take();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                join_async(previous).await?;
            }
            job.await
        });
        *tail = Some(Task::Async(handle));
        debug!(thread = %self.id, "Queued async job");
        Ok(())
    }

    /// Wait for every queued job; returns the first error one of them raised.
    pub fn wait(&self) -> Result<()> {
        let task = self.tail.lock()?.take();
        match task {
            Some(task) => join_blocking(task),
            None => Ok(()),
        }
    }

    pub async fn wait_async(&self) -> Result<()> {
        let task = self.tail.lock()?.take();
        match task {
            Some(task) => join_async(task).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jobs_run_in_order_and_errors_surface_on_wait() {
        let thread = ThreadEntity::new("t1");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            thread
                .run_blocking(Box::new(move || {
                    order.lock().unwrap().push(i);
                    Ok(())
                }))
                .unwrap();
        }
        thread.wait().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

        let ran = Arc::new(AtomicUsize::new(0));
        thread
            .run_blocking(Box::new(|| Err(RunnerError::assertion("boom"))))
            .unwrap();
        let after = ran.clone();
        thread
            .run_blocking(Box::new(move || {
                after.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        assert!(thread.wait().unwrap_err().is_assertion());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_jobs() {
        let thread = ThreadEntity::new("t2");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let counter = counter.clone();
            thread
                .run_async(Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .unwrap();
        }
        thread.wait_async().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(thread.wait_async().await.is_ok());
    }
}
