//! Node assembly: wires the store, the peer service, the thread engine and
//! the background loops together, and owns their lifetime.

use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use strand_net::{serve_listener, Dialer, PointerRouting, Service};
use strand_shared::protocol::MessageType;
use strand_shared::{Keypair, PeerId};
use strand_store::{ContentStore, Database};

use crate::cafe::{CafeClient, CafeHost, CafeRequestQueue};
use crate::config::NodeConfig;
use crate::error::{CafeError, ThreadError};
use crate::fetch::{ContentFetcher, ContentHandler};
use crate::outbox::{OfflineAckHandler, Outbox};
use crate::republisher::PointerRepublisher;
use crate::retriever::MessageRetriever;
use crate::thread::{DefaultMergePolicy, MergePolicy, ThreadContext};
use crate::threads::{Threads, ThreadsHandler};
use crate::updates::{UpdateBus, DEFAULT_UPDATE_CAPACITY};

/// Everything a node needs from outside: who it is, where it keeps state,
/// and how it reaches the network.
pub struct NodeCollaborators {
    pub identity: Arc<Keypair>,
    pub db: Arc<Database>,
    pub content: Arc<dyn ContentStore>,
    pub routing: Arc<dyn PointerRouting>,
    pub dialer: Arc<dyn Dialer>,
}

pub struct Node {
    config: NodeConfig,
    identity: Arc<Keypair>,
    db: Arc<Database>,
    content: Arc<dyn ContentStore>,
    service: Arc<Service>,
    threads: Arc<Threads>,
    outbox: Arc<Outbox>,
    cafe_queue: Arc<CafeRequestQueue>,
    cafe_host: Option<Arc<CafeHost>>,
    retriever: Arc<MessageRetriever>,
    republisher: Arc<PointerRepublisher>,
    updates: Arc<UpdateBus>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Assemble a node and register its message handlers. Nothing runs in
    /// the background until [`Node::start`].
    pub fn build(config: NodeConfig, collab: NodeCollaborators) -> Result<Self, ThreadError> {
        Self::build_with_policy(config, collab, Arc::new(DefaultMergePolicy))
    }

    pub fn build_with_policy(
        config: NodeConfig,
        collab: NodeCollaborators,
        merge_policy: Arc<dyn MergePolicy>,
    ) -> Result<Self, ThreadError> {
        let NodeCollaborators {
            identity,
            db,
            content,
            routing,
            dialer,
        } = collab;

        let service = Arc::new(Service::new(identity.clone(), dialer));
        let fetcher = Arc::new(ContentFetcher::new(content.clone(), service.clone()));
        let outbox = Arc::new(Outbox::new(
            db.clone(),
            content.clone(),
            service.clone(),
            routing.clone(),
            config.advertised_addr(),
        ));

        let cafe_client = Arc::new(CafeClient::new(identity.clone(), db.clone(), content.clone(), service.clone()));
        let cafe_queue = Arc::new(CafeRequestQueue::new(db.clone(), cafe_client));
        let updates = Arc::new(UpdateBus::new(DEFAULT_UPDATE_CAPACITY));

        let ctx = Arc::new(ThreadContext {
            identity: identity.clone(),
            db: db.clone(),
            content: content.clone(),
            fetcher: fetcher.clone(),
            outbox: outbox.clone(),
            cafe_queue: cafe_queue.clone(),
            updates: updates.clone(),
            merge_policy,
            username: config.username.clone(),
        });
        let threads = Arc::new(Threads::load(ctx)?);

        let retriever = Arc::new(MessageRetriever::new(
            identity.clone(),
            db.clone(),
            fetcher,
            service.clone(),
            routing.clone(),
        ));
        let republisher = Arc::new(PointerRepublisher::new(db.clone(), content.clone(), routing));

        service.register_all(&MessageType::THREAD_BLOCKS, Arc::new(ThreadsHandler(threads.clone())));
        service.register(MessageType::ContentRequest, Arc::new(ContentHandler::new(content.clone())));
        service.register(
            MessageType::OfflineAck,
            Arc::new(OfflineAckHandler::new(db.clone(), content.clone())),
        );

        let cafe_host = if config.cafe_host {
            let host = Arc::new(CafeHost::new(
                identity.clone(),
                db.clone(),
                content.clone(),
                config.cafe_session_ttl,
            ));
            service.register_all(&CafeHost::MESSAGE_TYPES, host.clone());
            info!("Cafe hosting enabled");
            Some(host)
        } else {
            None
        };

        Ok(Self {
            config,
            identity,
            db,
            content,
            service,
            threads,
            outbox,
            cafe_queue,
            cafe_host,
            retriever,
            republisher,
            updates,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the background loops, and the service listener when one is given.
    pub fn start(&self, listener: Option<TcpListener>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(listener) = listener {
            tasks.push(tokio::spawn(serve_listener(
                listener,
                self.service.clone(),
                self.cancel.child_token(),
            )));
        }

        tasks.push(tokio::spawn(
            self.cafe_queue
                .clone()
                .run(self.config.cafe_flush_interval, self.cancel.child_token()),
        ));
        tasks.push(tokio::spawn(
            self.retriever
                .clone()
                .run(self.config.retrieve_interval, self.cancel.child_token()),
        ));
        tasks.push(tokio::spawn(
            self.republisher
                .clone()
                .run(self.config.republish_interval, self.cancel.child_token()),
        ));

        info!(peer = %self.peer_id().short(), loops = tasks.len(), "Node started");
    }

    /// Stop every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Node stopped");
    }

    /// Register with every cafe named in the configuration. A cafe that
    /// cannot be reached is logged and retried on the next start.
    pub async fn register_configured_cafes(&self) -> usize {
        let mut registered = 0;
        for cafe in &self.config.cafes {
            match self.register_cafe(cafe).await {
                Ok(()) => registered += 1,
                Err(e) => warn!(cafe = %cafe.short(), error = %e, "Cafe registration failed"),
            }
        }
        registered
    }

    pub async fn register_cafe(&self, cafe: &PeerId) -> Result<(), CafeError> {
        let session = self.cafe_client().register(cafe).await?;
        info!(cafe = %cafe.short(), expires = %session.expiry, "Registered with cafe");
        Ok(())
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn content(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn threads(&self) -> &Arc<Threads> {
        &self.threads
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn cafe_queue(&self) -> &Arc<CafeRequestQueue> {
        &self.cafe_queue
    }

    pub fn cafe_client(&self) -> &Arc<CafeClient> {
        self.cafe_queue.client()
    }

    pub fn cafe_host(&self) -> Option<&Arc<CafeHost>> {
        self.cafe_host.as_ref()
    }

    pub fn retriever(&self) -> &Arc<MessageRetriever> {
        &self.retriever
    }

    pub fn republisher(&self) -> &Arc<PointerRepublisher> {
        &self.republisher
    }

    pub fn updates(&self) -> &Arc<UpdateBus> {
        &self.updates
    }
}
