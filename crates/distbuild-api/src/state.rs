//! Application state.

use std::sync::Arc;

use distbuild_config::{SigningConfig, SystemConfig};
use distbuild_core::artifact::ArtifactStore;
use distbuild_db::{
    ErrataRepo, MemoryStore, PgErrataRepo, PgProductRepo, PgTaskStore, ProductRepo, TaskStore,
};
use distbuild_scheduler::{
    AssignmentCoordinator, BackgroundJob, BackgroundQueue, BackgroundWorker, BuildService,
    CompletionHandler, ErrataReleaser, ErrataService, HttpArtifactStore, LeaseSweeper,
    MemoryArtifactStore, MemoryPubSub, PgNotifyPubSub, ProductAssembler, ProductService, PubSub,
    SignRequester, SignResponder, SignTaskService,
};
use sqlx::PgPool;
use tokio::sync::{mpsc, watch};

/// Storage and messaging backends the services run on.
pub struct Backends {
    pub tasks: Arc<dyn TaskStore>,
    pub errata: Arc<dyn ErrataRepo>,
    pub products: Arc<dyn ProductRepo>,
    pub pubsub: Arc<dyn PubSub>,
    pub artifacts: Arc<dyn ArtifactStore>,
}

impl Backends {
    /// Everything in process memory.
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            tasks: store.clone(),
            errata: store.clone(),
            products: store,
            pubsub: Arc::new(MemoryPubSub::new()),
            artifacts: Arc::new(MemoryArtifactStore::new()),
        }
    }

    /// PostgreSQL for storage and LISTEN/NOTIFY for the sign channel.
    pub fn postgres(pool: PgPool, config: &SystemConfig) -> Self {
        Self {
            tasks: Arc::new(PgTaskStore::new(pool.clone())),
            errata: Arc::new(PgErrataRepo::new(pool.clone())),
            products: Arc::new(PgProductRepo::new(pool.clone())),
            pubsub: Arc::new(PgNotifyPubSub::new(
                pool,
                config.signing.max_payload_bytes,
            )),
            artifacts: artifact_store(config),
        }
    }
}

fn artifact_store(config: &SystemConfig) -> Arc<dyn ArtifactStore> {
    match &config.artifacts.url {
        Some(url) => Arc::new(HttpArtifactStore::new(url.clone())),
        None => Arc::new(MemoryArtifactStore::new()),
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<AssignmentCoordinator>,
    pub completion: Arc<CompletionHandler>,
    pub builds: Arc<BuildService>,
    pub sign_tasks: Arc<SignTaskService>,
    pub products: Arc<ProductService>,
    pub errata: Arc<ErrataService>,
    pub requester: Arc<SignRequester>,
    pub pubsub: Arc<dyn PubSub>,
    pub signing: SigningConfig,
    pub shutdown: watch::Receiver<bool>,
}

/// Long-running jobs that go with an [`AppState`].
pub struct Workers {
    pub background: BackgroundWorker,
    pub jobs: mpsc::Receiver<BackgroundJob>,
    pub sweeper: LeaseSweeper,
}

impl AppState {
    pub fn new(
        backends: Backends,
        config: &SystemConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, Workers) {
        let scheduler = config.scheduler.clone();
        let (queue, jobs) = BackgroundQueue::new(scheduler.background_queue_depth);

        let completion = Arc::new(CompletionHandler::new(
            backends.tasks.clone(),
            scheduler.clone(),
        ));
        let releaser = Arc::new(ErrataReleaser::new(
            backends.errata.clone(),
            backends.artifacts.clone(),
        ));

        let state = Self {
            coordinator: Arc::new(AssignmentCoordinator::new(
                backends.tasks.clone(),
                scheduler.clone(),
            )),
            completion: completion.clone(),
            builds: Arc::new(BuildService::new(backends.tasks.clone())),
            sign_tasks: Arc::new(SignTaskService::new(
                backends.tasks.clone(),
                completion.clone(),
                queue.clone(),
            )),
            products: Arc::new(ProductService::new(
                backends.products.clone(),
                backends.tasks.clone(),
                queue.clone(),
            )),
            errata: Arc::new(ErrataService::new(backends.errata.clone(), queue)),
            requester: Arc::new(SignRequester::new(
                backends.pubsub.clone(),
                config.signing.clone(),
            )),
            pubsub: backends.pubsub,
            signing: config.signing.clone(),
            shutdown,
        };

        let workers = Workers {
            background: BackgroundWorker::new(
                completion,
                releaser,
                Arc::new(ProductAssembler::new(backends.products)),
            ),
            jobs,
            sweeper: LeaseSweeper::new(backends.tasks, scheduler.sweep_interval),
        };
        (state, workers)
    }

    /// A responder serving the shared sign channel.
    pub fn responder(&self) -> SignResponder {
        SignResponder::new(self.pubsub.clone(), self.signing.clone())
    }
}
