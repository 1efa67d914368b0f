//! Leader election.
//!
//! Classic sequential-ephemeral recipe: every candidate creates a node under
//! the cluster lock path; the lowest sequence leads. Higher candidates set an
//! exists-watch on their immediate predecessor and are promoted only by the
//! watch callback, never on a timer, so there is no thundering herd on the
//! lock path. The candidate node is ephemeral: losing the session releases
//! the lock and promotes the next pod in line.

use crate::coord::{sequence_of, ClusterPaths, Session};
use crate::error::{AgentError, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One pod's participation in its cluster election.
pub struct Election {
    session: Arc<dyn Session>,
    paths: ClusterPaths,
    candidate: Option<String>,
}

impl Election {
    pub fn new(session: Arc<dyn Session>, paths: ClusterPaths) -> Self {
        Self {
            session,
            paths,
            candidate: None,
        }
    }

    /// Resolve once this pod holds the lock. Re-entrant within one session:
    /// an existing candidate node is reused after a transient suspension.
    pub async fn acquire(&mut self) -> Result<()> {
        let my_seq = self.enroll().await?;

        loop {
            let names = self.session.children(&self.paths.lock(), None).await?;
            let mut seqs: Vec<u64> = names.iter().filter_map(|n| sequence_of(n)).collect();
            seqs.sort_unstable();

            if seqs.first() == Some(&my_seq) {
                info!(seq = my_seq, "lock acquired, now leading");
                return Ok(());
            }

            let Some(predecessor) = seqs.iter().filter(|&&s| s < my_seq).max().copied() else {
                // Our own node is missing from the listing; the session must
                // have expired underneath us.
                return Err(AgentError::SessionLost);
            };

            let predecessor_path = format!("{}{:010}", self.paths.lock_stem(), predecessor);
            let (tx, mut rx) = mpsc::unbounded_channel();
            if !self.session.exists(&predecessor_path, Some(tx)).await? {
                // Predecessor vanished between the listing and the watch.
                continue;
            }

            debug!(
                seq = my_seq,
                predecessor, "waiting on predecessor"
            );
            if rx.recv().await.is_none() {
                return Err(AgentError::SessionLost);
            }
        }
    }

    /// Create the candidate node once per session.
    async fn enroll(&mut self) -> Result<u64> {
        if let Some(path) = &self.candidate {
            if self.session.exists(path, None).await? {
                return sequence_of(path)
                    .ok_or_else(|| AgentError::Internal(format!("bad candidate path {}", path)));
            }
            self.candidate = None;
        }

        let path = self
            .session
            .create_ephemeral_sequential(&self.paths.lock_stem(), b"")
            .await?;
        let seq = sequence_of(&path)
            .ok_or_else(|| AgentError::Internal(format!("bad candidate path {}", path)))?;
        debug!(path = path.as_str(), "enrolled in election");
        self.candidate = Some(path);
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{MemoryStore, Store};
    use crate::types::ClusterKey;
    use std::time::Duration;

    fn paths() -> ClusterPaths {
        ClusterPaths::new(&ClusterKey::new("marathon", "demo"))
    }

    #[tokio::test]
    async fn test_single_candidate_wins_immediately() {
        let store = MemoryStore::new();
        let session = store.connect(Duration::from_secs(5)).await.unwrap();
        let mut election = Election::new(session, paths());
        election.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_successor_promoted_on_leader_expiry() {
        let store = MemoryStore::new();
        let a = store.connect(Duration::from_secs(5)).await.unwrap();
        let b = store.connect(Duration::from_secs(5)).await.unwrap();

        let mut first = Election::new(Arc::clone(&a), paths());
        first.acquire().await.unwrap();

        let mut second = Election::new(b, paths());
        let pending = tokio::spawn(async move { second.acquire().await });

        // The follower must still be blocked on its predecessor watch.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        store.expire(a.id());
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_promotion_skips_intermediate_expiry() {
        let store = MemoryStore::new();
        let a = store.connect(Duration::from_secs(5)).await.unwrap();
        let b = store.connect(Duration::from_secs(5)).await.unwrap();
        let c = store.connect(Duration::from_secs(5)).await.unwrap();

        let mut first = Election::new(Arc::clone(&a), paths());
        first.acquire().await.unwrap();

        let mut second = Election::new(Arc::clone(&b), paths());
        let second_pending = tokio::spawn(async move { second.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut third = Election::new(c, paths());
        let third_pending = tokio::spawn(async move { third.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Middle candidate drops out first, then the leader: the last
        // candidate must end up leading without ever polling.
        store.expire(b.id());
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.expire(a.id());

        third_pending.await.unwrap().unwrap();
        assert!(second_pending.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_enroll_is_idempotent_within_a_session() {
        let store = MemoryStore::new();
        let session = store.connect(Duration::from_secs(5)).await.unwrap();

        let mut election = Election::new(Arc::clone(&session), paths());
        election.acquire().await.unwrap();
        election.acquire().await.unwrap();

        let names = session
            .children("/ochopod/clusters/marathon.demo/lock", None)
            .await
            .unwrap();
        assert_eq!(names.len(), 1);
    }
}
