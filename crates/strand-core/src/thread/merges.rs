//! Head selection when a block arrives that does not descend from our head.

use std::collections::{HashSet, VecDeque};

use chrono::Duration;
use tracing::{debug, info};

use strand_shared::protocol::{BlockContent, BlockType};
use strand_shared::ContentId;
use strand_store::models::BlockRecord;
use strand_store::{Database, StoreError};

use super::Thread;
use crate::error::ThreadError;

/// Upper bound on blocks visited by a single ancestry walk.
const ANCESTRY_WALK_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadDecision {
    /// The new block descends from our head: move head to it.
    FastForward,
    /// Our head already contains the new block.
    Keep,
    /// Concurrent histories: author a MERGE over both.
    Merge,
}

/// Chooses what happens to a thread's head when `tip` is applied.
pub trait MergePolicy: Send + Sync {
    fn decide(&self, db: &Database, head: &ContentId, tip: &BlockRecord) -> Result<HeadDecision, StoreError>;
}

/// Fast-forward over direct and indirect descendants, keep over ancestors,
/// merge everything else. A MERGE head whose parents all lie under the tip
/// is superseded by the tip, so two peers that merged the same fork
/// converge on the next block either of them writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMergePolicy;

impl MergePolicy for DefaultMergePolicy {
    fn decide(&self, db: &Database, head: &ContentId, tip: &BlockRecord) -> Result<HeadDecision, StoreError> {
        if tip.id == *head {
            return Ok(HeadDecision::Keep);
        }
        if tip.parents.contains(head) || !db.has_block(head)? {
            return Ok(HeadDecision::FastForward);
        }
        if is_ancestor(db, head, &tip.id)? {
            return Ok(HeadDecision::FastForward);
        }
        if is_ancestor(db, &tip.id, head)? {
            return Ok(HeadDecision::Keep);
        }
        if superseded_merge(db, head, &tip.id)? {
            return Ok(HeadDecision::FastForward);
        }
        Ok(HeadDecision::Merge)
    }
}

fn superseded_merge(db: &Database, head: &ContentId, tip: &ContentId) -> Result<bool, StoreError> {
    let record = db.get_block(head)?;
    if record.block_type != BlockType::Merge {
        return Ok(false);
    }
    for parent in &record.parents {
        if !is_ancestor(db, parent, tip)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Whether `ancestor` is reachable from `descendant` through indexed parent
/// links. Blocks dated before `ancestor` are not expanded, and the walk gives
/// up (answering false) after [`ANCESTRY_WALK_LIMIT`] blocks.
pub fn is_ancestor(db: &Database, ancestor: &ContentId, descendant: &ContentId) -> Result<bool, StoreError> {
    let floor = match db.get_block(ancestor) {
        Ok(block) => block.date,
        Err(StoreError::NotFound) => return Ok(false),
        Err(e) => return Err(e),
    };

    let mut queue = VecDeque::from([descendant.clone()]);
    let mut seen = HashSet::new();
    while let Some(id) = queue.pop_front() {
        if seen.len() >= ANCESTRY_WALK_LIMIT {
            break;
        }
        if !seen.insert(id.clone()) {
            continue;
        }
        let block = match db.get_block(&id) {
            Ok(block) => block,
            Err(StoreError::NotFound) => continue,
            Err(e) => return Err(e),
        };
        for parent in block.parents {
            if parent == *ancestor {
                return Ok(true);
            }
            if !parent.is_empty() && block.date >= floor {
                queue.push_back(parent);
            }
        }
    }
    Ok(false)
}

impl Thread {
    /// Move the head for a newly applied block, merging when the policy
    /// asks for it. Caller holds the thread lock.
    pub(crate) async fn update_head(&self, tip: &ContentId) -> Result<ContentId, ThreadError> {
        let Some(head) = self.head()? else {
            self.set_head(tip)?;
            return Ok(tip.clone());
        };
        let record = self.ctx.db.get_block(tip)?;

        match self.ctx.merge_policy.decide(&self.ctx.db, &head, &record)? {
            HeadDecision::FastForward => {
                self.set_head(tip)?;
                Ok(tip.clone())
            }
            HeadDecision::Keep => {
                debug!(thread = %self.id.short(), head = %head.short(), block = %tip.short(), "Head already contains block");
                Ok(head)
            }
            HeadDecision::Merge => self.merge_locked(&head, &record).await,
        }
    }

    /// Author a MERGE over our head and `tip`. The merge is not posted;
    /// peers receive it as a parent of our next block.
    async fn merge_locked(&self, head: &ContentId, tip: &BlockRecord) -> Result<ContentId, ThreadError> {
        let head_date = self.ctx.db.get_block(head)?.date;
        let mut parents = vec![head.clone(), tip.id.clone()];
        parents.sort();
        let date = head_date.max(tip.date) + Duration::milliseconds(1);

        let header = self.header_with(parents, date)?;
        let committed = self.commit(header, BlockContent::Merge).await?;
        self.index(&committed.id, &committed.block)?;
        self.set_head(&committed.id)?;
        self.backup(&committed.id).await;
        self.notify(&committed.id, &committed.block);

        info!(thread = %self.id.short(), merge = %committed.id.short(), "Merged concurrent heads");
        Ok(committed.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use strand_shared::{PeerId, ThreadId};
    use strand_store::threads::new_thread_record;

    const THREAD: ThreadId = ThreadId([1; 32]);

    /// Blocks reference their thread row, so it has to exist first.
    fn thread_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.insert_thread(&new_thread_record(THREAD, "merges", [0; 32])).unwrap();
        db
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn block(db: &Database, id: &str, parents: &[&str], secs: i64) -> BlockRecord {
        insert(db, id, parents, secs, BlockType::Data)
    }

    fn insert(db: &Database, id: &str, parents: &[&str], secs: i64, block_type: BlockType) -> BlockRecord {
        let record = BlockRecord {
            id: ContentId::new(id),
            thread_id: THREAD,
            author_id: PeerId([2; 32]),
            block_type,
            date: at(secs),
            parents: parents.iter().map(|p| ContentId::new(*p)).collect(),
            target: None,
            key_cipher: None,
            body_cipher: None,
            author_name_cipher: None,
        };
        db.insert_block(&record).unwrap();
        record
    }

    #[test]
    fn test_ancestry_walk() {
        let db = thread_db();
        block(&db, "a", &[], 0);
        block(&db, "b", &["a"], 1);
        block(&db, "c", &["b"], 2);
        block(&db, "x", &["a"], 1);

        let (a, c, x) = (ContentId::new("a"), ContentId::new("c"), ContentId::new("x"));
        assert!(is_ancestor(&db, &a, &c).unwrap());
        assert!(!is_ancestor(&db, &c, &a).unwrap());
        assert!(!is_ancestor(&db, &x, &c).unwrap());
        assert!(!is_ancestor(&db, &ContentId::new("nope"), &c).unwrap());
    }

    #[test]
    fn test_default_policy_decisions() {
        let db = thread_db();
        block(&db, "a", &[], 0);
        let b = block(&db, "b", &["a"], 1);
        let c = block(&db, "c", &["b"], 2);
        let x = block(&db, "x", &["a"], 1);
        let policy = DefaultMergePolicy;

        // direct child
        assert_eq!(policy.decide(&db, &ContentId::new("a"), &b).unwrap(), HeadDecision::FastForward);
        // indirect descendant
        assert_eq!(policy.decide(&db, &ContentId::new("a"), &c).unwrap(), HeadDecision::FastForward);
        // stale block already under head
        assert_eq!(policy.decide(&db, &ContentId::new("c"), &b).unwrap(), HeadDecision::Keep);
        // fork
        assert_eq!(policy.decide(&db, &ContentId::new("c"), &x).unwrap(), HeadDecision::Merge);
        // head not indexed locally
        assert_eq!(policy.decide(&db, &ContentId::new("ghost"), &x).unwrap(), HeadDecision::FastForward);
    }

    #[test]
    fn test_twin_merges_converge() {
        let db = thread_db();
        block(&db, "a", &[], 0);
        block(&db, "x", &["a"], 1);
        block(&db, "y", &["a"], 1);
        // each side merged the fork on its own
        insert(&db, "ours", &["x", "y"], 2, BlockType::Merge);
        insert(&db, "theirs", &["x", "y"], 2, BlockType::Merge);
        let z = block(&db, "z", &["theirs"], 3);
        let policy = DefaultMergePolicy;

        assert_eq!(policy.decide(&db, &ContentId::new("ours"), &z).unwrap(), HeadDecision::FastForward);

        // a plain head is never dropped this way
        let w = block(&db, "w", &["x"], 2);
        assert_eq!(policy.decide(&db, &ContentId::new("y"), &w).unwrap(), HeadDecision::Merge);
    }
}
