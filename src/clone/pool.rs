//! Clone task pool
//!
//! Each clone request runs as one blocking task; a semaphore bounds how
//! many run at once.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::{CloneContext, CloneRequest, EngineCloneTask};
use crate::error::{Error, Result};
use crate::tablet::TabletInfo;

/// Runs clone requests on the blocking pool
pub struct CloneTaskPool {
    context: Arc<CloneContext>,
    permits: Arc<Semaphore>,
}

impl CloneTaskPool {
    pub fn new(context: Arc<CloneContext>, max_concurrent: usize) -> Self {
        Self {
            context,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Clone tasks that may start right now
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Queue one clone request; the handle yields the reported tablet infos
    pub fn submit(&self, request: CloneRequest) -> JoinHandle<Result<Vec<TabletInfo>>> {
        let context = Arc::clone(&self.context);
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| Error::ShuttingDown)?;
            let tablet_id = request.tablet_id;
            let joined = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let mut tablet_infos = Vec::new();
                EngineCloneTask::new(context, request).execute(&mut tablet_infos)?;
                Ok(tablet_infos)
            })
            .await;
            joined.unwrap_or_else(|e| {
                Err(Error::Internal(format!(
                    "clone task of tablet {} panicked: {}",
                    tablet_id, e
                )))
            })
        })
    }

    /// Stop admitting new clone tasks
    pub fn close(&self) {
        self.permits.close();
    }
}
