//! Status service
//!
//! Cache-backed status repository: lookups by every alias, relation
//! population, transactional writes, and reply/boost graph traversal.
//!
//! Cached statuses are always barebones; population happens on the
//! caller's copy.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;

use crate::data::{
    CacheKey, Caches, Database, EntityCache, Identified, Relation, Status, StatusColumn, Thread,
    lookup,
};
use crate::error::{AppError, PopulateError, Result};
use crate::queue::{StatusAction, WorkQueue};

/// How much of a status to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retrieval {
    /// Hydrate every relation
    Full,
    /// Row only; relations stay as IDs
    Barebones,
}

/// Status service
pub struct StatusService {
    db: Arc<Database>,
    caches: Arc<Caches>,
    queue: WorkQueue,
}

impl StatusService {
    /// Create new status service
    pub fn new(db: Arc<Database>, caches: Arc<Caches>, queue: WorkQueue) -> Self {
        Self { db, caches, queue }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub async fn get_by_id(&self, id: &str, mode: Retrieval) -> Result<Status> {
        self.get_status(CacheKey::new(lookup::ID, [id]), mode, || {
            self.db.get_status(id)
        })
        .await
    }

    pub async fn get_by_uri(&self, uri: &str, mode: Retrieval) -> Result<Status> {
        self.get_status(CacheKey::new(lookup::URI, [uri]), mode, || {
            self.db.get_status_by_uri(uri)
        })
        .await
    }

    pub async fn get_by_url(&self, url: &str, mode: Retrieval) -> Result<Status> {
        self.get_status(CacheKey::new(lookup::URL, [url]), mode, || {
            self.db.get_status_by_url(url)
        })
        .await
    }

    pub async fn get_by_poll_id(&self, poll_id: &str, mode: Retrieval) -> Result<Status> {
        self.get_status(CacheKey::new(lookup::POLL_ID, [poll_id]), mode, || {
            self.db.get_status_by_poll_id(poll_id)
        })
        .await
    }

    /// Newest boost of `boost_of_id` by `account_id`
    pub async fn get_boost(
        &self,
        boost_of_id: &str,
        account_id: &str,
        mode: Retrieval,
    ) -> Result<Status> {
        self.get_status(
            CacheKey::new(lookup::BOOST, [boost_of_id, account_id]),
            mode,
            || self.db.get_status_boost(boost_of_id, account_id),
        )
        .await
    }

    /// Fetch each ID, skipping ones that fail.
    ///
    /// Statuses that loaded but only partially populated are kept.
    pub async fn get_many(&self, ids: &[String], mode: Retrieval) -> Vec<Status> {
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_by_id(id, mode).await {
                Ok(status) => statuses.push(status),
                Err(AppError::Partial { status, source }) => {
                    tracing::warn!(status_id = %id, error = %source, "Status partially populated");
                    statuses.push(*status);
                }
                Err(error) => {
                    tracing::warn!(status_id = %id, %error, "Skipping status that failed to load");
                }
            }
        }
        statuses
    }

    async fn get_status<F, Fut>(&self, key: CacheKey, mode: Retrieval, query: F) -> Result<Status>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Status>>,
    {
        let mut status = self.caches.status.load(key, query).await?;

        if mode == Retrieval::Barebones {
            return Ok(status);
        }

        if let Err(source) = self.populate(&mut status).await {
            return Err(AppError::Partial {
                status: Box::new(status),
                source,
            });
        }

        Ok(status)
    }

    /// Cached barebones lookup used for nested relations.
    async fn get_barebones(&self, id: &str) -> Result<Arc<Status>> {
        let status = self
            .caches
            .status
            .load(CacheKey::new(lookup::ID, [id]), || self.db.get_status(id))
            .await?;
        Ok(Arc::new(status))
    }

    // =========================================================================
    // Population
    // =========================================================================

    /// Hydrate every relation that is missing or points at the wrong ID.
    ///
    /// Lookups are independent: every failure is recorded and the rest
    /// still run. Parent and boost are fetched barebones.
    pub async fn populate(&self, status: &mut Status) -> std::result::Result<(), PopulateError> {
        let mut errors = PopulateError::new();

        if let Some(id) = stale(
            Some(&status.account_id),
            status.account.as_ref().map(Identified::id),
        ) {
            match self.db.get_account(&id).await {
                Ok(account) => status.account = Some(account),
                Err(error) => errors.push(format!("error populating status author: {error}")),
            }
        }

        if let Some(id) = stale(
            status.in_reply_to_id.as_ref(),
            status.in_reply_to.as_deref().map(Identified::id),
        ) {
            match self.get_barebones(&id).await {
                Ok(parent) => status.in_reply_to = Some(parent),
                Err(error) => errors.push(format!("error populating status parent: {error}")),
            }
        }

        if let Some(id) = stale(
            status.in_reply_to_account_id.as_ref(),
            status.in_reply_to_account.as_ref().map(Identified::id),
        ) {
            match self.db.get_account(&id).await {
                Ok(account) => status.in_reply_to_account = Some(account),
                Err(error) => {
                    errors.push(format!("error populating status parent author: {error}"))
                }
            }
        }

        if let Some(id) = stale(
            status.boost_of_id.as_ref(),
            status.boost_of.as_deref().map(Identified::id),
        ) {
            match self.get_barebones(&id).await {
                Ok(target) => status.boost_of = Some(target),
                Err(error) => errors.push(format!("error populating status boost: {error}")),
            }
        }

        if let Some(id) = stale(
            status.boost_of_account_id.as_ref(),
            status.boost_of_account.as_ref().map(Identified::id),
        ) {
            match self.db.get_account(&id).await {
                Ok(account) => status.boost_of_account = Some(account),
                Err(error) => {
                    errors.push(format!("error populating status boost author: {error}"))
                }
            }
        }

        if let Some(id) = stale(status.poll_id.as_ref(), status.poll.as_ref().map(Identified::id)) {
            match self.db.get_poll(&id).await {
                Ok(poll) => status.poll = Some(poll),
                Err(error) => errors.push(format!("error populating status poll: {error}")),
            }
        }

        let db = &self.db;
        hydrate(&mut status.attachments, "attachments", &mut errors, |ids| async move {
            db.get_attachments(&ids).await
        })
        .await;
        hydrate(&mut status.tags, "tags", &mut errors, |ids| async move {
            db.get_tags(&ids).await
        })
        .await;
        hydrate(&mut status.mentions, "mentions", &mut errors, |ids| async move {
            db.get_mentions(&ids).await
        })
        .await;
        hydrate(&mut status.emojis, "emojis", &mut errors, |ids| async move {
            db.get_emojis(&ids).await
        })
        .await;

        if let Some(id) = stale(
            status.created_with_application_id.as_ref(),
            status.created_with_application.as_ref().map(Identified::id),
        ) {
            match self.db.get_application(&id).await {
                Ok(application) => status.created_with_application = Some(application),
                Err(error) => {
                    errors.push(format!("error populating status application: {error}"))
                }
            }
        }

        errors.into_result()
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Insert a new status.
    ///
    /// A status with neither a thread nor a parent starts a new thread,
    /// written in the same transaction.
    pub async fn put(&self, status: &mut Status) -> Result<()> {
        let new_thread = match (&status.thread_id, &status.in_reply_to_id) {
            (None, None) => {
                let thread = Thread::new();
                status.thread_id = Some(thread.id.clone());
                Some(thread)
            }
            (None, Some(parent_id)) => {
                // TODO: decide whether replies should join their parent's thread.
                tracing::debug!(
                    status_id = %status.id,
                    parent_id = %parent_id,
                    "Reply stored without a thread"
                );
                None
            }
            _ => None,
        };

        let snapshot: &Status = status;
        self.caches
            .status
            .store(snapshot.barebones(), || {
                self.db.put_status(snapshot, new_thread.as_ref())
            })
            .await?;

        tracing::debug!(status_id = %status.id, "Status created");
        self.queue.publish(StatusAction::Create, status.clone());
        Ok(())
    }

    /// Write `columns` of an existing status (all columns when empty).
    ///
    /// `updated_at` is always refreshed.
    pub async fn update(&self, status: &mut Status, columns: &[StatusColumn]) -> Result<()> {
        status.updated_at = Utc::now();

        let snapshot: &Status = status;
        self.caches
            .status
            .store(snapshot.barebones(), || self.db.update_status(snapshot, columns))
            .await?;

        tracing::debug!(status_id = %status.id, ?columns, "Status updated");
        self.queue.publish(StatusAction::Update, status.clone());
        Ok(())
    }

    /// Delete a status and its join rows.
    ///
    /// The cached entry is invalidated on return whether or not the delete
    /// succeeded. Deleting an unknown ID is a no-op.
    pub async fn delete(&self, id: &str) -> Result<()> {
        // Load first so the invalidation below has an entry (and its reply
        // and boost lists) to evict.
        let existing = match self.get_by_id(id, Retrieval::Barebones).await {
            Ok(status) => Some(status),
            Err(error) if error.is_not_found() => None,
            Err(error) => {
                tracing::warn!(status_id = %id, %error, "Failed to load status before delete");
                None
            }
        };

        let _invalidate = InvalidateOnDrop {
            cache: &self.caches.status,
            key: CacheKey::new(lookup::ID, [id]),
        };

        self.db.delete_status(id).await?;

        tracing::debug!(status_id = %id, found = existing.is_some(), "Status deleted");
        if let Some(status) = existing {
            self.queue.publish(StatusAction::Delete, status);
        }
        Ok(())
    }

    // =========================================================================
    // Traversal
    // =========================================================================

    /// Parent chain of `status`, nearest parent first.
    ///
    /// Fails if any parent is missing. The chain must be acyclic.
    pub async fn ancestors(&self, status: &Status, mode: Retrieval) -> Result<Vec<Status>> {
        let mut parents = Vec::new();
        let mut next = status.in_reply_to_id.clone();

        while let Some(id) = next {
            let parent = accept_partial(self.get_by_id(&id, mode).await)?;
            next = parent.in_reply_to_id.clone();
            parents.push(parent);
        }

        Ok(parents)
    }

    /// Every reply below `id`, depth first: each reply is followed by its
    /// whole subtree.
    pub async fn descendants(&self, id: &str, mode: Retrieval) -> Result<Vec<Status>> {
        let mut descendants = Vec::new();
        let mut pending: Vec<String> = self.reply_ids(id).await?.into_iter().rev().collect();

        while let Some(id) = pending.pop() {
            let reply = accept_partial(self.get_by_id(&id, mode).await)?;
            pending.extend(self.reply_ids(&reply.id).await?.into_iter().rev());
            descendants.push(reply);
        }

        Ok(descendants)
    }

    /// Direct replies to `id`, newest first
    pub async fn replies(&self, id: &str, mode: Retrieval) -> Result<Vec<Status>> {
        let ids = self.reply_ids(id).await?;
        Ok(self.get_many(&ids, mode).await)
    }

    pub async fn count_replies(&self, id: &str) -> Result<usize> {
        Ok(self.reply_ids(id).await?.len())
    }

    /// Boosts of `id`, newest first
    pub async fn boosts(&self, id: &str, mode: Retrieval) -> Result<Vec<Status>> {
        let ids = self.boost_ids(id).await?;
        Ok(self.get_many(&ids, mode).await)
    }

    pub async fn count_boosts(&self, id: &str) -> Result<usize> {
        Ok(self.boost_ids(id).await?.len())
    }

    pub async fn is_boosted_by(&self, status_id: &str, account_id: &str) -> Result<bool> {
        match self
            .get_boost(status_id, account_id, Retrieval::Barebones)
            .await
        {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Statuses carrying the custom emoji `emoji_id`, newest first
    pub async fn statuses_using_emoji(
        &self,
        emoji_id: &str,
        mode: Retrieval,
    ) -> Result<Vec<Status>> {
        let ids = self.db.get_status_ids_using_emoji(emoji_id).await?;
        Ok(self.get_many(&ids, mode).await)
    }

    async fn reply_ids(&self, id: &str) -> Result<Vec<String>> {
        self.caches
            .in_reply_to_ids
            .load(id, || self.db.get_status_reply_ids(id))
            .await
    }

    async fn boost_ids(&self, id: &str) -> Result<Vec<String>> {
        self.caches
            .boost_of_ids
            .load(id, || self.db.get_status_boost_ids(id))
            .await
    }
}

/// `wanted` if the hydrated value is absent or carries another ID.
fn stale(wanted: Option<&String>, current: Option<&str>) -> Option<String> {
    let wanted = wanted?;
    (current != Some(wanted.as_str())).then(|| wanted.clone())
}

async fn hydrate<T, F, Fut>(
    relation: &mut Relation<T>,
    name: &str,
    errors: &mut PopulateError,
    fetch: F,
) where
    T: Identified + Clone,
    F: FnOnce(Vec<String>) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    if relation.is_populated() {
        return;
    }

    match fetch(relation.ids()).await {
        Ok(items) => {
            if let Err(missing) = relation.hydrate(items) {
                errors.push(format!(
                    "error populating status {name}: missing {}",
                    missing.join(", ")
                ));
            }
        }
        Err(error) => errors.push(format!("error populating status {name}: {error}")),
    }
}

/// Traversal keeps statuses whose own relations failed to populate.
fn accept_partial(result: Result<Status>) -> Result<Status> {
    match result {
        Err(AppError::Partial { status, source }) => {
            tracing::warn!(status_id = %status.id, error = %source, "Status partially populated");
            Ok(*status)
        }
        other => other,
    }
}

struct InvalidateOnDrop<'a> {
    cache: &'a EntityCache<Status>,
    key: CacheKey,
}

impl Drop for InvalidateOnDrop<'_> {
    fn drop(&mut self) {
        self.cache.invalidate(&self.key);
    }
}
