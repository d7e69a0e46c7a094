//! Durable outbound cafe work.
//!
//! Every thread mutation writes one request row per cafe session. Draining
//! reads a page at a time, groups it by cafe and then by request type, and
//! works each cafe concurrently. Acknowledged rows are deleted; a failed
//! cafe keeps its rows for the next tick. One drain runs at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use strand_shared::constants::CAFE_QUEUE_PAGE_SIZE;
use strand_shared::{ContentId, PeerId, ThreadId};
use strand_store::cafe_requests::new_cafe_request;
use strand_store::models::{CafeRequest, CafeRequestType};
use strand_store::{Database, StoreError};

use super::CafeClient;
use crate::error::CafeError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    /// Rows acknowledged by their cafe.
    pub stored: usize,
    /// Rows dropped because their cafe session or thread is gone.
    pub dropped: usize,
}

pub struct CafeRequestQueue {
    db: Arc<Database>,
    client: Arc<CafeClient>,
    drain: Mutex<()>,
}

#[derive(Default)]
struct CafeOutcome {
    stored: Vec<Uuid>,
    dropped: Vec<Uuid>,
    error: Option<CafeError>,
}

impl CafeRequestQueue {
    pub fn new(db: Arc<Database>, client: Arc<CafeClient>) -> Self {
        Self {
            db,
            client,
            drain: Mutex::new(()),
        }
    }

    pub fn client(&self) -> &Arc<CafeClient> {
        &self.client
    }

    /// Queue `target_id` for every cafe we hold a session with and start a
    /// drain if none is running. Returns the number of rows written.
    pub async fn put(self: &Arc<Self>, target_id: &str, request_type: CafeRequestType) -> Result<usize, StoreError> {
        let sessions = self.db.list_cafe_sessions()?;
        for session in &sessions {
            self.db
                .insert_cafe_request(&new_cafe_request(target_id, session.cafe_id, request_type))?;
        }
        if !sessions.is_empty() {
            self.kick();
        }
        Ok(sessions.len())
    }

    fn kick(self: &Arc<Self>) {
        let queue = self.clone();
        tokio::spawn(async move {
            let Ok(_guard) = queue.drain.try_lock() else {
                return;
            };
            if let Err(e) = queue.drain_pages().await {
                debug!(error = %e, "Cafe queue drain stopped");
            }
        });
    }

    /// Drain the queue until it is empty or a cafe fails.
    pub async fn flush(&self) -> Result<FlushStats, CafeError> {
        let _guard = self.drain.lock().await;
        self.drain_pages().await
    }

    /// Flush every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // Rows of an interrupted drain stay queued and are resent.
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = self.flush() => result,
                    };
                    match result {
                        Ok(stats) if stats.stored + stats.dropped > 0 => {
                            info!(stored = stats.stored, dropped = stats.dropped, "Cafe queue flushed")
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Cafe queue flush failed"),
                    }
                }
            }
        }
        debug!("Cafe queue loop stopped");
    }

    async fn drain_pages(&self) -> Result<FlushStats, CafeError> {
        let mut stats = FlushStats::default();
        let mut offset: Option<Uuid> = None;
        loop {
            let page = self.db.list_cafe_requests(offset.as_ref(), CAFE_QUEUE_PAGE_SIZE)?;
            let Some(last) = page.last() else {
                return Ok(stats);
            };
            offset = Some(last.id);

            let mut by_cafe: HashMap<PeerId, Vec<CafeRequest>> = HashMap::new();
            for request in page {
                by_cafe.entry(request.cafe_id).or_default().push(request);
            }

            let mut tasks = JoinSet::new();
            for (cafe, requests) in by_cafe {
                let client = self.client.clone();
                let db = self.db.clone();
                tasks.spawn(async move { process_cafe(client, db, cafe, requests).await });
            }

            let mut handled = Vec::new();
            let mut first_error = None;
            while let Some(joined) = tasks.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(error = %e, "Cafe task panicked");
                        continue;
                    }
                };
                stats.stored += outcome.stored.len();
                stats.dropped += outcome.dropped.len();
                handled.extend(outcome.stored);
                handled.extend(outcome.dropped);
                if first_error.is_none() {
                    first_error = outcome.error;
                }
            }
            self.db.delete_cafe_requests(&handled)?;

            if let Some(e) = first_error {
                return Err(e);
            }
        }
    }
}

async fn process_cafe(
    client: Arc<CafeClient>,
    db: Arc<Database>,
    cafe: PeerId,
    requests: Vec<CafeRequest>,
) -> CafeOutcome {
    let mut outcome = CafeOutcome::default();

    match db.get_cafe_session(&cafe) {
        Ok(_) => {}
        Err(StoreError::NotFound) => {
            debug!(cafe = %cafe.short(), count = requests.len(), "Dropping requests for a cafe without a session");
            outcome.dropped = requests.iter().map(|r| r.id).collect();
            return outcome;
        }
        Err(e) => {
            outcome.error = Some(e.into());
            return outcome;
        }
    }

    let mut blocks = Vec::new();
    let mut stores = Vec::new();
    let mut unstores = Vec::new();
    for request in requests {
        match request.request_type {
            CafeRequestType::StoreBlock => blocks.push(request),
            CafeRequestType::StoreThread => stores.push(request),
            CafeRequestType::UnstoreThread => unstores.push(request),
        }
    }

    if !blocks.is_empty() {
        let mut ids: Vec<ContentId> = Vec::new();
        for request in &blocks {
            let id = ContentId::new(request.target_id.clone());
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        match client.store(&cafe, &ids).await {
            Ok(_) => outcome.stored.extend(blocks.iter().map(|r| r.id)),
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        }
    }

    for (target, ids) in by_target(stores) {
        let record = match ThreadId::from_hex(&target).map(|id| db.get_thread(&id)) {
            Ok(Ok(record)) => record,
            Ok(Err(StoreError::NotFound)) | Err(_) => {
                outcome.dropped.extend(ids);
                continue;
            }
            Ok(Err(e)) => {
                outcome.error = Some(e.into());
                return outcome;
            }
        };
        match client.store_thread(&cafe, &record).await {
            Ok(()) => outcome.stored.extend(ids),
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        }
    }

    // Runs after stores so a snapshot written earlier in the page is removed.
    for (target, ids) in by_target(unstores) {
        let Ok(id) = ThreadId::from_hex(&target) else {
            outcome.dropped.extend(ids);
            continue;
        };
        match client.unstore_thread(&cafe, &id).await {
            Ok(()) => outcome.stored.extend(ids),
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        }
    }
    outcome
}

/// Request ids grouped by target, in first-seen order.
fn by_target(requests: Vec<CafeRequest>) -> Vec<(String, Vec<Uuid>)> {
    let mut groups: Vec<(String, Vec<Uuid>)> = Vec::new();
    for request in requests {
        match groups.iter_mut().find(|(target, _)| *target == request.target_id) {
            Some((_, ids)) => ids.push(request.id),
            None => groups.push((request.target_id, vec![request.id])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use strand_net::MemoryNetwork;
    use strand_shared::Keypair;
    use strand_store::models::CafeSession;
    use strand_store::threads::new_thread_record;
    use strand_store::{ContentStore, MemoryContentStore};

    use crate::cafe::CafeHost;

    struct Cafe {
        id: PeerId,
        content: Arc<MemoryContentStore>,
        host: Arc<CafeHost>,
        _service: Arc<strand_net::Service>,
    }

    fn spawn_cafe(network: &Arc<MemoryNetwork>) -> Cafe {
        let identity = Arc::new(Keypair::generate());
        let service = network.add_node(identity.clone());
        let content = Arc::new(MemoryContentStore::new());
        let host = Arc::new(CafeHost::new(
            identity,
            Arc::new(Database::open_in_memory().unwrap()),
            content.clone(),
            Duration::from_secs(3600),
        ));
        service.register_all(&CafeHost::MESSAGE_TYPES, host.clone());
        Cafe {
            id: service.peer_id(),
            content,
            host,
            _service: service,
        }
    }

    struct Client {
        queue: Arc<CafeRequestQueue>,
        db: Arc<Database>,
        content: Arc<MemoryContentStore>,
        peer: PeerId,
        _service: Arc<strand_net::Service>,
    }

    fn spawn_client(network: &Arc<MemoryNetwork>) -> Client {
        let identity = Arc::new(Keypair::generate());
        let service = network.add_node(identity.clone());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let content = Arc::new(MemoryContentStore::new());
        let client = Arc::new(CafeClient::new(identity, db.clone(), content.clone(), service.clone()));
        Client {
            queue: Arc::new(CafeRequestQueue::new(db.clone(), client)),
            db,
            content,
            peer: service.peer_id(),
            _service: service,
        }
    }

    #[tokio::test]
    async fn test_one_row_per_session_and_all_acknowledged() {
        let network = MemoryNetwork::new();
        let cafes: Vec<Cafe> = (0..3).map(|_| spawn_cafe(&network)).collect();
        let client = spawn_client(&network);
        for cafe in &cafes {
            client.queue.client().register(&cafe.id).await.unwrap();
        }

        let block = client.content.put(b"block bytes").await.unwrap();
        let _guard = client.queue.drain.lock().await;
        let written = client
            .queue
            .put(block.as_str(), CafeRequestType::StoreBlock)
            .await
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(client.db.count_cafe_requests().unwrap(), 3);
        drop(_guard);

        let stats = client.queue.flush().await.unwrap();
        assert_eq!(stats, FlushStats { stored: 3, dropped: 0 });
        assert_eq!(client.db.count_cafe_requests().unwrap(), 0);
        for cafe in &cafes {
            assert!(cafe.content.has(&block).await.unwrap());
            assert!(cafe.content.is_pinned(&block));
        }
    }

    #[tokio::test]
    async fn test_unreachable_cafe_keeps_its_rows() {
        let network = MemoryNetwork::new();
        let up = spawn_cafe(&network);
        let down = spawn_cafe(&network);
        let client = spawn_client(&network);
        client.queue.client().register(&up.id).await.unwrap();
        client.queue.client().register(&down.id).await.unwrap();
        network.set_online(&down.id, false);

        let block = client.content.put(b"payload").await.unwrap();
        {
            let _guard = client.queue.drain.lock().await;
            client
                .queue
                .put(block.as_str(), CafeRequestType::StoreBlock)
                .await
                .unwrap();
        }

        assert!(client.queue.flush().await.is_err());
        assert!(up.content.has(&block).await.unwrap());
        assert_eq!(client.db.count_cafe_requests().unwrap(), 1);

        network.set_online(&down.id, true);
        client.queue.flush().await.unwrap();
        assert_eq!(client.db.count_cafe_requests().unwrap(), 0);
        assert!(down.content.has(&block).await.unwrap());
    }

    #[tokio::test]
    async fn test_thread_snapshot_is_sealed_to_owner() {
        let network = MemoryNetwork::new();
        let cafe = spawn_cafe(&network);
        let client = spawn_client(&network);
        client.queue.client().register(&cafe.id).await.unwrap();

        let key = Keypair::generate();
        let record = new_thread_record(key.thread_id(), "garden", *key.secret_bytes());
        client.db.insert_thread(&record).unwrap();
        {
            let _guard = client.queue.drain.lock().await;
            let target = record.id.to_hex();
            client.queue.put(&target, CafeRequestType::StoreThread).await.unwrap();
            client.queue.put(&target, CafeRequestType::StoreThread).await.unwrap();
        }

        let stats = client.queue.flush().await.unwrap();
        assert_eq!(stats.stored, 2);

        let stored = cafe.host.client_threads(&client.peer).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, record.id);
        assert_ne!(stored[0].secret_cipher, record.secret.to_vec());
    }

    #[tokio::test]
    async fn test_requests_without_session_are_dropped() {
        let network = MemoryNetwork::new();
        let client = spawn_client(&network);
        let gone = PeerId([4; 32]);
        client
            .db
            .upsert_cafe_session(&CafeSession {
                cafe_id: gone,
                access: "a".into(),
                refresh: "r".into(),
                expiry: Utc::now(),
            })
            .unwrap();
        {
            let _guard = client.queue.drain.lock().await;
            client.queue.put("object", CafeRequestType::StoreBlock).await.unwrap();
        }
        client.db.delete_cafe_session(&gone).unwrap();

        let stats = client.queue.flush().await.unwrap();
        assert_eq!(stats, FlushStats { stored: 0, dropped: 1 });
        assert_eq!(client.db.count_cafe_requests().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unstore_runs_after_store_in_same_drain() {
        let network = MemoryNetwork::new();
        let cafe = spawn_cafe(&network);
        let client = spawn_client(&network);
        client.queue.client().register(&cafe.id).await.unwrap();

        let key = Keypair::generate();
        let record = new_thread_record(key.thread_id(), "gone", *key.secret_bytes());
        client.db.insert_thread(&record).unwrap();
        {
            let _guard = client.queue.drain.lock().await;
            let target = record.id.to_hex();
            client.queue.put(&target, CafeRequestType::StoreThread).await.unwrap();
            client.queue.put(&target, CafeRequestType::UnstoreThread).await.unwrap();
        }

        let stats = client.queue.flush().await.unwrap();
        assert_eq!(stats, FlushStats { stored: 2, dropped: 0 });
        assert!(cafe.host.client_threads(&client.peer).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_walks_every_page() {
        let network = MemoryNetwork::new();
        let cafe = spawn_cafe(&network);
        let client = spawn_client(&network);
        client.queue.client().register(&cafe.id).await.unwrap();

        let total = CAFE_QUEUE_PAGE_SIZE as usize * 2 + 3;
        let mut blocks = Vec::new();
        {
            let _guard = client.queue.drain.lock().await;
            for i in 0..total {
                let id = client.content.put(format!("object {i}").as_bytes()).await.unwrap();
                client.queue.put(id.as_str(), CafeRequestType::StoreBlock).await.unwrap();
                blocks.push(id);
            }
        }
        assert_eq!(client.db.count_cafe_requests().unwrap(), total as u64);

        let stats = client.queue.flush().await.unwrap();
        assert_eq!(stats.stored, total);
        assert_eq!(client.db.count_cafe_requests().unwrap(), 0);
        for id in &blocks {
            assert!(cafe.content.has(id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_flush_waits_for_running_drain() {
        let network = MemoryNetwork::new();
        let cafe = spawn_cafe(&network);
        let client = spawn_client(&network);
        client.queue.client().register(&cafe.id).await.unwrap();

        let guard = client.queue.drain.lock().await;
        let block = client.content.put(b"waiting").await.unwrap();
        client.queue.put(block.as_str(), CafeRequestType::StoreBlock).await.unwrap();

        let queue = client.queue.clone();
        let flush = tokio::spawn(async move { queue.flush().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!flush.is_finished());
        assert_eq!(client.db.count_cafe_requests().unwrap(), 1);

        drop(guard);
        let stats = flush.await.unwrap().unwrap();
        assert_eq!(stats.stored, 1);
        assert!(cafe.content.has(&block).await.unwrap());
    }
}
