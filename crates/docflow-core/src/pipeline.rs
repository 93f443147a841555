//! Wiring of the shared resources every component works against.

use std::sync::Arc;

use crate::blob::BlobStore;
use crate::dispatcher::Dispatcher;
use crate::intake::Intake;
use crate::primitives::Primitives;
use crate::queue::JobQueue;
use crate::retrieval::QueryEngine;
use crate::review::Reviews;
use crate::settings::Settings;
use crate::store::Store;
use crate::worker::Worker;

/// Store, queue, object store, primitives, and settings. Cheap to clone;
/// every field is reference counted.
#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub blobs: Arc<dyn BlobStore>,
    pub primitives: Primitives,
    pub settings: Arc<Settings>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        blobs: Arc<dyn BlobStore>,
        primitives: Primitives,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            queue,
            blobs,
            primitives,
            settings: Arc::new(settings),
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.clone())
    }

    pub fn intake(&self) -> Intake {
        Intake::new(self.clone())
    }

    pub fn worker(&self, worker_id: impl Into<String>) -> Worker {
        Worker::new(self.clone(), worker_id)
    }

    pub fn query_engine(&self) -> QueryEngine {
        QueryEngine::new(self.clone())
    }

    pub fn reviews(&self) -> Reviews {
        Reviews::new(self.clone())
    }
}
