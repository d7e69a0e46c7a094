//! Content-addressed object storage.
//!
//! Objects are addressed by the BLAKE3 digest of their bytes. Two
//! implementations ship with the crate: [`FsContentStore`] keeps objects as
//! files under a repo directory, [`MemoryContentStore`] keeps them in a map
//! and is cheap to share between in-process nodes.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, info};

use strand_shared::{ContentId, Keypair, PeerId};

use crate::error::ContentError;

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data` and return its address. Storing the same bytes twice
    /// returns the same id.
    async fn put(&self, data: &[u8]) -> Result<ContentId, ContentError>;

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, ContentError>;

    async fn has(&self, id: &ContentId) -> Result<bool, ContentError>;

    /// Keep `id` around. Objects here have no links, so `recursive` only
    /// matters to stores that model DAGs.
    async fn pin(&self, id: &ContentId, recursive: bool) -> Result<(), ContentError>;

    /// Release `id`; the object may be dropped.
    async fn unpin(&self, id: &ContentId) -> Result<(), ContentError>;

    /// Point the name of `key`'s peer at `id` for `ttl`.
    async fn publish(&self, key: &Keypair, id: &ContentId, ttl: Duration) -> Result<(), ContentError>;

    /// Resolve the latest unexpired name record of `peer`.
    async fn resolve(&self, peer: &PeerId) -> Result<ContentId, ContentError>;
}

fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Objects live in `<base>/objects/<id>`, pins in `<base>/pins/<id>`, name
/// records in `<base>/names/<peer>`.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    base_path: PathBuf,
}

impl FsContentStore {
    pub async fn new(base_path: PathBuf) -> Result<Self, ContentError> {
        for sub in ["objects", "pins", "names"] {
            fs::create_dir_all(base_path.join(sub)).await?;
        }

        info!(path = %base_path.display(), "content store initialized");
        Ok(Self { base_path })
    }

    /// Only lower-case hex ids are accepted, which also keeps every path
    /// inside the store directory.
    fn object_path(&self, dir: &str, id: &ContentId) -> Result<PathBuf, ContentError> {
        let valid = !id.0.is_empty() && id.0.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(ContentError::InvalidId(id.0.clone()));
        }
        Ok(self.base_path.join(dir).join(&id.0))
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn put(&self, data: &[u8]) -> Result<ContentId, ContentError> {
        if data.is_empty() {
            return Err(ContentError::Empty);
        }
        let id = ContentId::for_bytes(data);
        let path = self.object_path("objects", &id)?;
        if !path.exists() {
            fs::write(&path, data).await?;
            debug!(id = %id, size = data.len(), "stored object");
        }
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, ContentError> {
        let path = self.object_path("objects", id)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ContentError::NotFound(id.0.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn has(&self, id: &ContentId) -> Result<bool, ContentError> {
        Ok(self.object_path("objects", id)?.exists())
    }

    async fn pin(&self, id: &ContentId, _recursive: bool) -> Result<(), ContentError> {
        if !self.has(id).await? {
            return Err(ContentError::NotFound(id.0.clone()));
        }
        fs::write(self.object_path("pins", id)?, b"").await?;
        Ok(())
    }

    async fn unpin(&self, id: &ContentId) -> Result<(), ContentError> {
        for dir in ["pins", "objects"] {
            match fs::remove_file(self.object_path(dir, id)?).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(id = %id, "unpinned object");
        Ok(())
    }

    async fn publish(&self, key: &Keypair, id: &ContentId, ttl: Duration) -> Result<(), ContentError> {
        let record = format!("{}\n{}", id.0, expiry_after(ttl).to_rfc3339());
        fs::write(self.base_path.join("names").join(key.peer_id().to_hex()), record).await?;
        Ok(())
    }

    async fn resolve(&self, peer: &PeerId) -> Result<ContentId, ContentError> {
        let path = self.base_path.join("names").join(peer.to_hex());
        let record = match fs::read_to_string(&path).await {
            Ok(record) => record,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContentError::NotPublished(peer.to_hex()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut lines = record.lines();
        let id = lines.next().unwrap_or_default();
        let expiry = lines
            .next()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        match expiry {
            Some(expiry) if expiry > Utc::now() && !id.is_empty() => Ok(ContentId::new(id)),
            _ => Err(ContentError::NotPublished(peer.to_hex())),
        }
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    objects: HashMap<ContentId, Vec<u8>>,
    pins: HashSet<ContentId>,
    names: HashMap<PeerId, (ContentId, DateTime<Utc>)>,
}

/// In-process store; wrap in an `Arc` to share it between nodes.
#[derive(Default)]
pub struct MemoryContentStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_pinned(&self, id: &ContentId) -> bool {
        self.lock().pins.contains(id)
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop an object regardless of pins, simulating content that is no
    /// longer reachable on the network.
    pub fn forget(&self, id: &ContentId) {
        let mut inner = self.lock();
        inner.objects.remove(id);
        inner.pins.remove(id);
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, data: &[u8]) -> Result<ContentId, ContentError> {
        if data.is_empty() {
            return Err(ContentError::Empty);
        }
        let id = ContentId::for_bytes(data);
        self.lock().objects.entry(id.clone()).or_insert_with(|| data.to_vec());
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, ContentError> {
        self.lock()
            .objects
            .get(id)
            .cloned()
            .ok_or_else(|| ContentError::NotFound(id.0.clone()))
    }

    async fn has(&self, id: &ContentId) -> Result<bool, ContentError> {
        Ok(self.lock().objects.contains_key(id))
    }

    async fn pin(&self, id: &ContentId, _recursive: bool) -> Result<(), ContentError> {
        let mut inner = self.lock();
        if !inner.objects.contains_key(id) {
            return Err(ContentError::NotFound(id.0.clone()));
        }
        inner.pins.insert(id.clone());
        Ok(())
    }

    async fn unpin(&self, id: &ContentId) -> Result<(), ContentError> {
        self.lock().pins.remove(id);
        Ok(())
    }

    async fn publish(&self, key: &Keypair, id: &ContentId, ttl: Duration) -> Result<(), ContentError> {
        self.lock()
            .names
            .insert(key.peer_id(), (id.clone(), expiry_after(ttl)));
        Ok(())
    }

    async fn resolve(&self, peer: &PeerId) -> Result<ContentId, ContentError> {
        match self.lock().names.get(peer) {
            Some((id, expiry)) if *expiry > Utc::now() => Ok(id.clone()),
            _ => Err(ContentError::NotPublished(peer.to_hex())),
        }
    }
}
