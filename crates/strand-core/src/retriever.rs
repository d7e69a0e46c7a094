//! Pulls messages other peers left for us while we were unreachable.
//!
//! Each pass looks up the pointers under our pointer key, downloads and
//! opens the sealed envelopes they reference, acknowledges them to the
//! provider, and feeds them through the same dispatch path as live traffic.
//! Messages that arrive ahead of their dependencies are deferred and
//! replayed in priority order at the end of the pass.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strand_net::{PointerRouting, RoutingError, Service};
use strand_shared::constants::{DHT_TIMEOUT, POINTER_EXPIRY, RETRIEVE_IN_FLIGHT};
use strand_shared::pointer::{pointer_key, Pointer};
use strand_shared::protocol::{Envelope, Message, MessageType, OfflineAck};
use strand_shared::{ContentId, Keypair, ProtocolError};
use strand_store::Database;

use crate::error::RetrieveError;
use crate::fetch::ContentFetcher;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetrieveStats {
    /// Pointers downloaded this pass.
    pub downloaded: usize,
    pub delivered: usize,
    pub deferred: usize,
    /// Deferred messages that went through on replay.
    pub replayed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Deferred,
    Skipped,
}

pub struct MessageRetriever {
    identity: Arc<Keypair>,
    db: Arc<Database>,
    fetcher: Arc<ContentFetcher>,
    service: Arc<Service>,
    routing: Arc<dyn PointerRouting>,
    downloads: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<ContentId>>>,
    /// Pointers sharing our key that are sealed to someone else.
    foreign: Mutex<HashSet<ContentId>>,
    /// Bounds the whole pointer lookup, not just its start.
    lookup_timeout: Duration,
}

/// A pointer payload being downloaded. Dropping the claim, including when
/// its task is aborted, frees the payload for a later pass.
struct Claim {
    in_flight: Arc<Mutex<HashSet<ContentId>>>,
    cid: ContentId,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.cid);
    }
}

impl MessageRetriever {
    pub fn new(
        identity: Arc<Keypair>,
        db: Arc<Database>,
        fetcher: Arc<ContentFetcher>,
        service: Arc<Service>,
        routing: Arc<dyn PointerRouting>,
    ) -> Self {
        Self {
            identity,
            db,
            fetcher,
            service,
            routing,
            downloads: Arc::new(Semaphore::new(RETRIEVE_IN_FLIGHT)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            foreign: Mutex::new(HashSet::new()),
            lookup_timeout: DHT_TIMEOUT,
        }
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// One retrieval pass.
    pub async fn retrieve(self: &Arc<Self>) -> Result<RetrieveStats, RetrieveError> {
        let key = pointer_key(&self.identity.peer_id());
        let deadline = tokio::time::Instant::now() + self.lookup_timeout;
        let mut found = tokio::time::timeout_at(deadline, self.routing.find_pointers(&key))
            .await
            .map_err(|_| RoutingError::Timeout)??;

        let mut stats = RetrieveStats::default();
        let mut tasks = JoinSet::new();
        loop {
            let pointer = match tokio::time::timeout_at(deadline, found.recv()).await {
                Ok(Some(pointer)) => pointer,
                Ok(None) => break,
                Err(_) => {
                    debug!("Pointer lookup still open at its deadline, working with what arrived");
                    break;
                }
            };
            let claim = match self.claim(&pointer) {
                Ok(Some(claim)) => claim,
                Ok(None) => continue,
                Err(e) => {
                    warn!(pointer = %pointer.id, error = %e, "Skipping pointer");
                    continue;
                }
            };
            let retriever = self.clone();
            tasks.spawn(async move {
                let _claim = claim;
                let _permit = retriever.downloads.clone().acquire_owned().await;
                retriever.download(pointer).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => {
                    if outcome != Outcome::Skipped {
                        stats.downloaded += 1;
                    }
                    match outcome {
                        Outcome::Delivered => stats.delivered += 1,
                        Outcome::Deferred => stats.deferred += 1,
                        Outcome::Skipped => {}
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "Offline message download failed"),
                Err(e) => warn!(error = %e, "Download task panicked"),
            }
        }

        stats.replayed = self.process_deferred().await?;

        let cutoff = Utc::now() - chrono::Duration::seconds(POINTER_EXPIRY.as_secs() as i64);
        let purged = self.db.delete_offline_markers_before(cutoff)?;
        if purged > 0 {
            debug!(purged, "Purged old delivery markers");
        }
        Ok(stats)
    }

    /// Retrieve every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // Dropping an unfinished pass aborts its downloads.
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = self.retrieve() => result,
                    };
                    match result {
                        Ok(stats) if stats.downloaded + stats.replayed > 0 => info!(
                            downloaded = stats.downloaded,
                            delivered = stats.delivered,
                            deferred = stats.deferred,
                            replayed = stats.replayed,
                            "Retrieved offline messages"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Offline message retrieval failed"),
                    }
                }
            }
        }
        debug!("Retriever loop stopped");
    }

    /// Claim `pointer` for download unless it is not ours, already handled,
    /// or being downloaded.
    fn claim(&self, pointer: &Pointer) -> Result<Option<Claim>, RetrieveError> {
        let local = self.identity.peer_id();
        if pointer.cancel_id.is_some_and(|id| id != local) || pointer.provider == local {
            return Ok(None);
        }
        if self.foreign_lock().contains(&pointer.cid) || self.db.has_offline_message(&pointer.cid)? {
            return Ok(None);
        }
        if !self.in_flight_lock().insert(pointer.cid.clone()) {
            return Ok(None);
        }
        Ok(Some(Claim {
            in_flight: self.in_flight.clone(),
            cid: pointer.cid.clone(),
        }))
    }

    async fn download(&self, pointer: Pointer) -> Result<Outcome, RetrieveError> {
        if let Some(addr) = &pointer.provider_addr {
            self.service.dialer().learn_address(&pointer.provider, addr);
        }
        let sealed = match self.fetcher.fetch(&pointer.cid, &[pointer.provider]).await {
            Ok(sealed) => sealed,
            Err(e) => {
                debug!(pointer = %pointer.id, provider = %pointer.provider.short(), error = %e, "Pointer payload unavailable");
                return Ok(Outcome::Skipped);
            }
        };

        let Ok(plain) = self.identity.open(&sealed) else {
            debug!(pointer = %pointer.id, "Pointer is sealed to another peer");
            self.foreign_lock().insert(pointer.cid.clone());
            return Ok(Outcome::Skipped);
        };
        let envelope = match decode_envelope(&plain) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(pointer = %pointer.id, error = %e, "Discarding malformed offline message");
                self.db.mark_offline_delivered(&pointer.cid)?;
                return Ok(Outcome::Skipped);
            }
        };

        self.db.touch_contact(&envelope.sender())?;
        if envelope.message.msg_type != MessageType::OfflineAck {
            self.acknowledge(&pointer).await;
        }
        self.deliver(&pointer.cid, envelope, &plain).await
    }

    async fn acknowledge(&self, pointer: &Pointer) {
        let ack = OfflineAck {
            pointer_id: pointer.id.clone(),
        };
        let result = match Message::encode(MessageType::OfflineAck, &ack) {
            Ok(message) => match self.service.seal(message) {
                Ok(envelope) => self.service.send_message(&pointer.provider, &envelope).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            debug!(pointer = %pointer.id, provider = %pointer.provider.short(), error = %e, "Failed to acknowledge pointer");
        }
    }

    async fn deliver(&self, addr: &ContentId, envelope: Envelope, raw: &[u8]) -> Result<Outcome, RetrieveError> {
        let from = envelope.sender();
        let msg_type = envelope.message.msg_type;
        match self.service.dispatch(from, envelope).await {
            Ok(_) => {
                self.db.mark_offline_delivered(addr)?;
                Ok(Outcome::Delivered)
            }
            Err(e) if e.is_permanent() => {
                warn!(peer = %from.short(), msg_type = ?msg_type, error = %e, "Offline message rejected");
                self.db.mark_offline_delivered(addr)?;
                Ok(Outcome::Delivered)
            }
            Err(e) => {
                debug!(peer = %from.short(), msg_type = ?msg_type, error = %e, "Deferring offline message");
                self.db.defer_offline_message(addr, raw)?;
                Ok(Outcome::Deferred)
            }
        }
    }

    /// Replay deferred messages: thread blocks first (oldest block first),
    /// then the other kinds by [`MessageType::replay_rank`]. Passes repeat
    /// while they make progress. Returns the number cleared.
    pub async fn process_deferred(&self) -> Result<usize, RetrieveError> {
        let mut cleared = 0;
        loop {
            let mut queue: Vec<(u8, DateTime<Utc>, ContentId, Envelope)> = Vec::new();
            for message in self.db.list_deferred_messages()? {
                let Some(raw) = message.envelope else { continue };
                match decode_envelope(&raw) {
                    Ok(envelope) => {
                        let rank = envelope.message.msg_type.replay_rank();
                        let date = envelope
                            .thread_block()
                            .map(|(_, block)| block.header.date)
                            .unwrap_or(message.date);
                        queue.push((rank, date, message.addr, envelope));
                    }
                    Err(e) => {
                        warn!(addr = %message.addr.short(), error = %e, "Dropping undecodable deferred message");
                        self.db.mark_offline_delivered(&message.addr)?;
                    }
                }
            }
            queue.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

            let mut progress = 0;
            for (_, _, addr, envelope) in queue {
                let from = envelope.sender();
                match self.service.dispatch(from, envelope).await {
                    Ok(_) => {
                        self.db.mark_offline_delivered(&addr)?;
                        progress += 1;
                    }
                    Err(e) if e.is_permanent() => {
                        warn!(addr = %addr.short(), error = %e, "Deferred message rejected");
                        self.db.mark_offline_delivered(&addr)?;
                        progress += 1;
                    }
                    Err(e) => debug!(addr = %addr.short(), error = %e, "Deferred message still blocked"),
                }
            }
            cleared += progress;
            if progress == 0 {
                return Ok(cleared);
            }
        }
    }

    fn in_flight_lock(&self) -> std::sync::MutexGuard<'_, HashSet<ContentId>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn foreign_lock(&self) -> std::sync::MutexGuard<'_, HashSet<ContentId>> {
        self.foreign.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn decode_envelope(raw: &[u8]) -> Result<Envelope, ProtocolError> {
    let envelope = Envelope::from_bytes(raw)?;
    envelope.verify()?;
    Ok(envelope)
}
