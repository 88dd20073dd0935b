//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.
//!
//! Entities reference each other by ID. Hydrated relations are filled in
//! by the status repository and are never written back to the database.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
///
/// ULIDs sort by creation time, so ordering by ID is ordering by age.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything addressable by a string ID.
pub trait Identified {
    fn id(&self) -> &str;
}

macro_rules! identified {
    ($($ty:ty),* $(,)?) => {
        $(impl Identified for $ty {
            fn id(&self) -> &str {
                &self.id
            }
        })*
    };
}

// =============================================================================
// Relations
// =============================================================================

/// An ID-list relation of a status.
///
/// `Hydrated` holds the objects themselves (each carrying its own ID), so
/// a hydrated relation always has exactly as many objects as IDs.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Relation<T> {
    /// No related IDs
    #[default]
    Unset,
    /// IDs known, objects not fetched
    Ids(Vec<String>),
    /// Objects fetched, in ID order
    Hydrated(Vec<T>),
}

impl<T: Identified + Clone> Relation<T> {
    /// Build an ids-only relation (empty lists are `Unset`).
    pub fn from_ids(ids: Vec<String>) -> Self {
        if ids.is_empty() {
            Self::Unset
        } else {
            Self::Ids(ids)
        }
    }

    /// Related IDs, in order.
    pub fn ids(&self) -> Vec<String> {
        match self {
            Self::Unset => Vec::new(),
            Self::Ids(ids) => ids.clone(),
            Self::Hydrated(items) => items.iter().map(|item| item.id().to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Unset => 0,
            Self::Ids(ids) => ids.len(),
            Self::Hydrated(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether there is nothing left to fetch.
    pub fn is_populated(&self) -> bool {
        !matches!(self, Self::Ids(_))
    }

    /// Hydrated objects; empty unless populated.
    pub fn items(&self) -> &[T] {
        match self {
            Self::Hydrated(items) => items,
            _ => &[],
        }
    }

    /// Drop hydrated objects, keeping the IDs.
    pub fn to_ids_only(&self) -> Self {
        Self::from_ids(self.ids())
    }

    /// Attach fetched objects.
    ///
    /// Objects are reordered to match the ID list. If any ID has no
    /// matching object the relation stays ids-only and the missing IDs
    /// are returned.
    pub fn hydrate(&mut self, items: Vec<T>) -> Result<(), Vec<String>> {
        let ids = self.ids();
        if ids.is_empty() {
            *self = Self::Unset;
            return Ok(());
        }

        let by_id: HashMap<&str, &T> = items.iter().map(|item| (item.id(), item)).collect();
        let mut ordered = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in &ids {
            match by_id.get(id.as_str()) {
                Some(item) => ordered.push((*item).clone()),
                None => missing.push(id.clone()),
            }
        }

        if !missing.is_empty() {
            *self = Self::Ids(ids);
            return Err(missing);
        }

        *self = Self::Hydrated(ordered);
        Ok(())
    }
}

// =============================================================================
// Collaborator entities
// =============================================================================

/// Status author
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: String,
    pub username: String,
    /// Empty for local accounts
    pub domain: Option<String>,
    /// ActivityPub actor URI
    pub uri: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Client application a status was created with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub website: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Poll attached to a status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Poll {
    pub id: String,
    pub status_id: String,
    pub options: Json<Vec<String>>,
    pub multiple: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Media file attached to a status
///
/// Uploaded before the status exists (`status_id` is null until then).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MediaAttachment {
    pub id: String,
    pub status_id: Option<String>,
    pub account_id: String,
    pub url: String,
    /// MIME type (e.g., "image/webp")
    pub content_type: String,
    /// Alt text description
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Hashtag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Custom emoji
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Emoji {
    pub id: String,
    pub shortcode: String,
    /// Empty for local emoji
    pub domain: Option<String>,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

/// Mention of an account inside a status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Mention {
    pub id: String,
    pub status_id: String,
    pub origin_account_id: String,
    pub target_account_id: String,
    pub created_at: DateTime<Utc>,
}

/// Conversation grouping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Thread {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    /// Allocate a new thread
    pub fn new() -> Self {
        Self {
            id: EntityId::new().0,
            created_at: Utc::now(),
        }
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

identified!(Account, Application, Poll, MediaAttachment, Tag, Emoji, Mention, Thread);

// =============================================================================
// Status
// =============================================================================

/// A post/toot
///
/// The `*_id` fields are the persisted references. The hydrated fields
/// (`account`, `in_reply_to`, `boost_of`, ...) are filled by population and
/// skipped when the status is written.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// ActivityPub URI (globally unique)
    pub uri: String,
    /// Web URL, if different from the URI
    pub url: Option<String>,
    /// HTML content
    pub content: String,
    /// Content warning text
    pub content_warning: Option<String>,
    /// Visibility: public, unlisted, private, direct
    pub visibility: String,
    /// Language code (ISO 639-1)
    pub language: Option<String>,
    pub sensitive: bool,
    /// true if authored on this instance
    pub local: bool,
    pub account_id: String,
    pub account_uri: String,
    pub in_reply_to_id: Option<String>,
    pub in_reply_to_uri: Option<String>,
    pub in_reply_to_account_id: Option<String>,
    pub boost_of_id: Option<String>,
    pub boost_of_account_id: Option<String>,
    pub thread_id: Option<String>,
    pub poll_id: Option<String>,
    pub created_with_application_id: Option<String>,

    pub attachments: Relation<MediaAttachment>,
    pub tags: Relation<Tag>,
    pub mentions: Relation<Mention>,
    pub emojis: Relation<Emoji>,

    pub account: Option<Account>,
    pub in_reply_to: Option<Arc<Status>>,
    pub in_reply_to_account: Option<Account>,
    pub boost_of: Option<Arc<Status>>,
    pub boost_of_account: Option<Account>,
    pub poll: Option<Poll>,
    pub created_with_application: Option<Application>,
}

identified!(Status);

impl Status {
    /// New local status authored by `account`.
    ///
    /// The caller assigns the ID; everything optional starts empty.
    pub fn new(id: impl Into<String>, account: &Account, content: impl Into<String>) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            uri: format!("{}/statuses/{}", account.uri.trim_end_matches('/'), id),
            id,
            created_at: now,
            updated_at: now,
            url: None,
            content: content.into(),
            content_warning: None,
            visibility: "public".to_string(),
            language: None,
            sensitive: false,
            local: account.domain.is_none(),
            account_id: account.id.clone(),
            account_uri: account.uri.clone(),
            in_reply_to_id: None,
            in_reply_to_uri: None,
            in_reply_to_account_id: None,
            boost_of_id: None,
            boost_of_account_id: None,
            thread_id: None,
            poll_id: None,
            created_with_application_id: None,
            attachments: Relation::Unset,
            tags: Relation::Unset,
            mentions: Relation::Unset,
            emojis: Relation::Unset,
            account: None,
            in_reply_to: None,
            in_reply_to_account: None,
            boost_of: None,
            boost_of_account: None,
            poll: None,
            created_with_application: None,
        }
    }

    /// Mark this status as a reply to `parent`.
    pub fn reply_to(mut self, parent: &Status) -> Self {
        self.in_reply_to_id = Some(parent.id.clone());
        self.in_reply_to_uri = Some(parent.uri.clone());
        self.in_reply_to_account_id = Some(parent.account_id.clone());
        self
    }

    /// Mark this status as a boost of `target`.
    pub fn boost_of(mut self, target: &Status) -> Self {
        self.boost_of_id = Some(target.id.clone());
        self.boost_of_account_id = Some(target.account_id.clone());
        self
    }

    /// Copy without any hydrated relations.
    pub fn barebones(&self) -> Status {
        Status {
            attachments: self.attachments.to_ids_only(),
            tags: self.tags.to_ids_only(),
            mentions: self.mentions.to_ids_only(),
            emojis: self.emojis.to_ids_only(),
            account: None,
            in_reply_to: None,
            in_reply_to_account: None,
            boost_of: None,
            boost_of_account: None,
            poll: None,
            created_with_application: None,
            ..self.clone()
        }
    }
}

/// Row shape of the `statuses` table
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct StatusRow {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub uri: String,
    pub url: Option<String>,
    pub content: String,
    pub content_warning: Option<String>,
    pub visibility: String,
    pub language: Option<String>,
    pub sensitive: bool,
    pub local: bool,
    pub account_id: String,
    pub account_uri: String,
    pub in_reply_to_id: Option<String>,
    pub in_reply_to_uri: Option<String>,
    pub in_reply_to_account_id: Option<String>,
    pub boost_of_id: Option<String>,
    pub boost_of_account_id: Option<String>,
    pub thread_id: Option<String>,
    pub poll_id: Option<String>,
    pub created_with_application_id: Option<String>,
    pub attachment_ids: Json<Vec<String>>,
    pub tag_ids: Json<Vec<String>>,
    pub mention_ids: Json<Vec<String>>,
    pub emoji_ids: Json<Vec<String>>,
}

impl From<StatusRow> for Status {
    fn from(row: StatusRow) -> Self {
        Self {
            id: row.id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            uri: row.uri,
            url: row.url,
            content: row.content,
            content_warning: row.content_warning,
            visibility: row.visibility,
            language: row.language,
            sensitive: row.sensitive,
            local: row.local,
            account_id: row.account_id,
            account_uri: row.account_uri,
            in_reply_to_id: row.in_reply_to_id,
            in_reply_to_uri: row.in_reply_to_uri,
            in_reply_to_account_id: row.in_reply_to_account_id,
            boost_of_id: row.boost_of_id,
            boost_of_account_id: row.boost_of_account_id,
            thread_id: row.thread_id,
            poll_id: row.poll_id,
            created_with_application_id: row.created_with_application_id,
            attachments: Relation::from_ids(row.attachment_ids.0),
            tags: Relation::from_ids(row.tag_ids.0),
            mentions: Relation::from_ids(row.mention_ids.0),
            emojis: Relation::from_ids(row.emoji_ids.0),
            account: None,
            in_reply_to: None,
            in_reply_to_account: None,
            boost_of: None,
            boost_of_account: None,
            poll: None,
            created_with_application: None,
        }
    }
}

/// Column groups for a partial status update.
///
/// `updated_at` is always written and has no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusColumn {
    Uri,
    Url,
    Content,
    ContentWarning,
    Visibility,
    Language,
    Sensitive,
    /// `in_reply_to_id`, `in_reply_to_uri`, `in_reply_to_account_id`
    InReplyTo,
    /// `boost_of_id`, `boost_of_account_id`
    BoostOf,
    ThreadId,
    PollId,
    CreatedWithApplicationId,
    AttachmentIds,
    TagIds,
    MentionIds,
    EmojiIds,
}

impl StatusColumn {
    pub const ALL: [StatusColumn; 16] = [
        Self::Uri,
        Self::Url,
        Self::Content,
        Self::ContentWarning,
        Self::Visibility,
        Self::Language,
        Self::Sensitive,
        Self::InReplyTo,
        Self::BoostOf,
        Self::ThreadId,
        Self::PollId,
        Self::CreatedWithApplicationId,
        Self::AttachmentIds,
        Self::TagIds,
        Self::MentionIds,
        Self::EmojiIds,
    ];
}
