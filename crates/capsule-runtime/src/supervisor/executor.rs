//! Bounded async execution
//!
//! Supervision blocks its thread for the life of a task, so each one runs
//! on tokio's blocking pool. A semaphore bounds how many run at once;
//! further submissions wait for a permit.

use super::{EngineError, Supervisor};
use crate::loader::CodeBundle;
use crate::params::{Entry, ExecutionParams};
use crate::result::TaskResult;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct Executor {
    supervisor: Arc<Supervisor>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Executor {
    pub fn new(supervisor: Arc<Supervisor>, max_concurrent: usize) -> Self {
        Self {
            supervisor,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Permits not currently held by a running task
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run a task once a permit is free
    pub async fn submit(
        &self,
        bundle: Arc<CodeBundle>,
        entry: Entry,
        params: ExecutionParams,
    ) -> Result<TaskResult, EngineError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::ExecutorClosed)?;

        tracing::debug!(bundle = bundle.name(), entry = %entry, "submitting task");
        let supervisor = self.supervisor.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            supervisor.run(&bundle, entry, params)
        })
        .await
        .map_err(|e| EngineError::Join(e.to_string()))?
    }

    /// Refuse new submissions; running tasks are unaffected
    pub fn close(&self) {
        self.semaphore.close();
    }
}
