//! SQLite database operations
//!
//! All database access goes through this module.
//! Multi-table writes run in one transaction; dropping an uncommitted
//! transaction rolls it back.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;
use crate::metrics::DB_QUERIES_TOTAL;

fn observe_query(operation: &'static str, table: &'static str) {
    DB_QUERIES_TOTAL.with_label_values(&[operation, table]).inc();
}

/// Treat a unique-constraint conflict as success.
fn ignore_already_exists(result: Result<(), AppError>) -> Result<(), AppError> {
    match result {
        Err(AppError::AlreadyExists) => Ok(()),
        other => other,
    }
}

/// Database connection pool wrapper
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;
        Self::migrate(&pool).await?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Private in-memory database.
    ///
    /// Limited to one connection, since every SQLite memory connection is
    /// its own database.
    pub async fn connect_in_memory() -> Result<Self, AppError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), AppError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })
    }

    // =========================================================================
    // Status reads
    // =========================================================================

    async fn get_status_by_column(
        &self,
        column: &'static str,
        value: &str,
    ) -> Result<Status, AppError> {
        observe_query("select", "statuses");
        let query = format!("SELECT * FROM statuses WHERE {column} = ? LIMIT 1");
        let row = sqlx::query_as::<_, StatusRow>(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Status::from).ok_or(AppError::NotFound)
    }

    /// Get status by ID
    pub async fn get_status(&self, id: &str) -> Result<Status, AppError> {
        self.get_status_by_column("id", id).await
    }

    /// Get status by ActivityPub URI
    pub async fn get_status_by_uri(&self, uri: &str) -> Result<Status, AppError> {
        self.get_status_by_column("uri", uri).await
    }

    /// Get status by web URL
    pub async fn get_status_by_url(&self, url: &str) -> Result<Status, AppError> {
        self.get_status_by_column("url", url).await
    }

    /// Get the status a poll belongs to
    pub async fn get_status_by_poll_id(&self, poll_id: &str) -> Result<Status, AppError> {
        self.get_status_by_column("poll_id", poll_id).await
    }

    /// Newest boost of `boost_of_id` by `account_id`.
    ///
    /// An account may boost the same status more than once; IDs sort by
    /// creation time, so the highest one wins.
    pub async fn get_status_boost(
        &self,
        boost_of_id: &str,
        account_id: &str,
    ) -> Result<Status, AppError> {
        observe_query("select", "statuses");
        let row = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT * FROM statuses
            WHERE boost_of_id = ? AND account_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(boost_of_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Status::from).ok_or(AppError::NotFound)
    }

    /// IDs of direct replies to `status_id`, newest first
    pub async fn get_status_reply_ids(&self, status_id: &str) -> Result<Vec<String>, AppError> {
        observe_query("select", "statuses");
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM statuses WHERE in_reply_to_id = ? ORDER BY id DESC",
        )
        .bind(status_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// IDs of boosts of `status_id`, newest first
    pub async fn get_status_boost_ids(&self, status_id: &str) -> Result<Vec<String>, AppError> {
        observe_query("select", "statuses");
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM statuses WHERE boost_of_id = ? ORDER BY id DESC",
        )
        .bind(status_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// IDs of statuses joined to `emoji_id`, newest first
    pub async fn get_status_ids_using_emoji(
        &self,
        emoji_id: &str,
    ) -> Result<Vec<String>, AppError> {
        observe_query("select", "status_to_emojis");
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT status_id FROM status_to_emojis WHERE emoji_id = ? ORDER BY status_id DESC",
        )
        .bind(emoji_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Tag IDs joined to `status_id`
    pub async fn get_status_tag_ids(&self, status_id: &str) -> Result<Vec<String>, AppError> {
        observe_query("select", "status_to_tags");
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT tag_id FROM status_to_tags WHERE status_id = ? ORDER BY tag_id",
        )
        .bind(status_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Emoji IDs joined to `status_id`
    pub async fn get_status_emoji_ids(&self, status_id: &str) -> Result<Vec<String>, AppError> {
        observe_query("select", "status_to_emojis");
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT emoji_id FROM status_to_emojis WHERE status_id = ? ORDER BY emoji_id",
        )
        .bind(status_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Status IDs joined to `thread_id`, oldest first
    pub async fn get_thread_status_ids(&self, thread_id: &str) -> Result<Vec<String>, AppError> {
        observe_query("select", "thread_to_statuses");
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT status_id FROM thread_to_statuses WHERE thread_id = ? ORDER BY status_id",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    // =========================================================================
    // Status writes
    // =========================================================================

    /// Insert a status with its join rows in one transaction.
    ///
    /// `new_thread` is inserted first when the status starts a thread.
    pub async fn put_status(
        &self,
        status: &Status,
        new_thread: Option<&Thread>,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        if let Some(thread) = new_thread {
            observe_query("insert", "threads");
            sqlx::query("INSERT INTO threads (id, created_at) VALUES (?, ?)")
                .bind(&thread.id)
                .bind(thread.created_at)
                .execute(&mut *tx)
                .await?;
        }

        write_status_joins(&mut *tx, status).await?;

        observe_query("insert", "statuses");
        sqlx::query(
            r#"
            INSERT INTO statuses (
                id, created_at, updated_at, uri, url, content, content_warning,
                visibility, language, sensitive, local, account_id, account_uri,
                in_reply_to_id, in_reply_to_uri, in_reply_to_account_id,
                boost_of_id, boost_of_account_id, thread_id, poll_id,
                created_with_application_id,
                attachment_ids, tag_ids, mention_ids, emoji_ids
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&status.id)
        .bind(status.created_at)
        .bind(status.updated_at)
        .bind(&status.uri)
        .bind(&status.url)
        .bind(&status.content)
        .bind(&status.content_warning)
        .bind(&status.visibility)
        .bind(&status.language)
        .bind(status.sensitive)
        .bind(status.local)
        .bind(&status.account_id)
        .bind(&status.account_uri)
        .bind(&status.in_reply_to_id)
        .bind(&status.in_reply_to_uri)
        .bind(&status.in_reply_to_account_id)
        .bind(&status.boost_of_id)
        .bind(&status.boost_of_account_id)
        .bind(&status.thread_id)
        .bind(&status.poll_id)
        .bind(&status.created_with_application_id)
        .bind(Json(status.attachments.ids()))
        .bind(Json(status.tags.ids()))
        .bind(Json(status.mentions.ids()))
        .bind(Json(status.emojis.ids()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Update the given columns of a status, plus `updated_at`.
    ///
    /// An empty `columns` slice updates every column. Join rows for the
    /// status's current tags, emojis, attachments and thread are written in
    /// the same transaction.
    ///
    /// # Errors
    /// `NotFound` if no row has the status's ID
    pub async fn update_status(
        &self,
        status: &Status,
        columns: &[StatusColumn],
    ) -> Result<(), AppError> {
        let columns: &[StatusColumn] = if columns.is_empty() {
            &StatusColumn::ALL
        } else {
            columns
        };

        let mut tx = self.pool.begin().await?;

        write_status_joins(&mut *tx, status).await?;

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE statuses SET updated_at = ");
        query.push_bind(status.updated_at);

        let mut written = Vec::with_capacity(columns.len());
        for column in columns {
            if written.contains(column) {
                continue;
            }
            written.push(*column);
            push_status_column(&mut query, status, *column);
        }

        query.push(" WHERE id = ").push_bind(&status.id);

        observe_query("update", "statuses");
        let result = query.build().execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete a status and every join row referencing it.
    ///
    /// Deleting an ID that does not exist is a no-op.
    pub async fn delete_status(&self, id: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        for (table, query) in [
            ("status_to_tags", "DELETE FROM status_to_tags WHERE status_id = ?"),
            ("status_to_emojis", "DELETE FROM status_to_emojis WHERE status_id = ?"),
            ("thread_to_statuses", "DELETE FROM thread_to_statuses WHERE status_id = ?"),
            ("statuses", "DELETE FROM statuses WHERE id = ?"),
        ] {
            observe_query("delete", table);
            sqlx::query(query).bind(id).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Collaborators
    // =========================================================================

    /// Get account by ID
    pub async fn get_account(&self, id: &str) -> Result<Account, AppError> {
        observe_query("select", "accounts");
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn insert_account(&self, account: &Account) -> Result<(), AppError> {
        observe_query("insert", "accounts");
        sqlx::query(
            r#"
            INSERT INTO accounts (id, username, domain, uri, display_name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.username)
        .bind(&account.domain)
        .bind(&account.uri)
        .bind(&account.display_name)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get application by ID
    pub async fn get_application(&self, id: &str) -> Result<Application, AppError> {
        observe_query("select", "applications");
        sqlx::query_as::<_, Application>("SELECT * FROM applications WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn insert_application(&self, application: &Application) -> Result<(), AppError> {
        observe_query("insert", "applications");
        sqlx::query("INSERT INTO applications (id, name, website, created_at) VALUES (?, ?, ?, ?)")
            .bind(&application.id)
            .bind(&application.name)
            .bind(&application.website)
            .bind(application.created_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Get poll by ID
    pub async fn get_poll(&self, id: &str) -> Result<Poll, AppError> {
        observe_query("select", "polls");
        sqlx::query_as::<_, Poll>("SELECT * FROM polls WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn insert_poll(&self, poll: &Poll) -> Result<(), AppError> {
        observe_query("insert", "polls");
        sqlx::query(
            r#"
            INSERT INTO polls (id, status_id, options, multiple, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&poll.id)
        .bind(&poll.status_id)
        .bind(&poll.options)
        .bind(poll.multiple)
        .bind(poll.expires_at)
        .bind(poll.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Attachments with the given IDs, in no particular order
    pub async fn get_attachments(&self, ids: &[String]) -> Result<Vec<MediaAttachment>, AppError> {
        self.get_by_ids("media_attachments", ids).await
    }

    pub async fn get_attachment(&self, id: &str) -> Result<MediaAttachment, AppError> {
        observe_query("select", "media_attachments");
        sqlx::query_as::<_, MediaAttachment>("SELECT * FROM media_attachments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn insert_attachment(&self, attachment: &MediaAttachment) -> Result<(), AppError> {
        observe_query("insert", "media_attachments");
        sqlx::query(
            r#"
            INSERT INTO media_attachments (
                id, status_id, account_id, url, content_type, description, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&attachment.id)
        .bind(&attachment.status_id)
        .bind(&attachment.account_id)
        .bind(&attachment.url)
        .bind(&attachment.content_type)
        .bind(&attachment.description)
        .bind(attachment.created_at)
        .bind(attachment.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Tags with the given IDs, in no particular order
    pub async fn get_tags(&self, ids: &[String]) -> Result<Vec<Tag>, AppError> {
        self.get_by_ids("tags", ids).await
    }

    pub async fn insert_tag(&self, tag: &Tag) -> Result<(), AppError> {
        observe_query("insert", "tags");
        sqlx::query("INSERT INTO tags (id, name, created_at) VALUES (?, ?, ?)")
            .bind(&tag.id)
            .bind(&tag.name)
            .bind(tag.created_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Mentions with the given IDs, in no particular order
    pub async fn get_mentions(&self, ids: &[String]) -> Result<Vec<Mention>, AppError> {
        self.get_by_ids("mentions", ids).await
    }

    pub async fn insert_mention(&self, mention: &Mention) -> Result<(), AppError> {
        observe_query("insert", "mentions");
        sqlx::query(
            r#"
            INSERT INTO mentions (id, status_id, origin_account_id, target_account_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&mention.id)
        .bind(&mention.status_id)
        .bind(&mention.origin_account_id)
        .bind(&mention.target_account_id)
        .bind(mention.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Emojis with the given IDs, in no particular order
    pub async fn get_emojis(&self, ids: &[String]) -> Result<Vec<Emoji>, AppError> {
        self.get_by_ids("emojis", ids).await
    }

    pub async fn insert_emoji(&self, emoji: &Emoji) -> Result<(), AppError> {
        observe_query("insert", "emojis");
        sqlx::query(
            "INSERT INTO emojis (id, shortcode, domain, image_url, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&emoji.id)
        .bind(&emoji.shortcode)
        .bind(&emoji.domain)
        .bind(&emoji.image_url)
        .bind(emoji.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_by_ids<T>(&self, table: &'static str, ids: &[String]) -> Result<Vec<T>, AppError>
    where
        T: for<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> + Send + Unpin,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        observe_query("select", table);
        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT * FROM {table} WHERE id IN ("));
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows = query.build_query_as::<T>().fetch_all(&self.pool).await?;
        Ok(rows)
    }
}

/// Join rows and attachment re-pointing shared by insert and update.
async fn write_status_joins(conn: &mut SqliteConnection, status: &Status) -> Result<(), AppError> {
    for emoji_id in status.emojis.ids() {
        observe_query("insert", "status_to_emojis");
        ignore_already_exists(
            sqlx::query(
                "INSERT INTO status_to_emojis (status_id, emoji_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(&status.id)
            .bind(&emoji_id)
            .execute(&mut *conn)
            .await
            .map(|_| ())
            .map_err(AppError::from),
        )?;
    }

    for tag_id in status.tags.ids() {
        observe_query("insert", "status_to_tags");
        ignore_already_exists(
            sqlx::query(
                "INSERT INTO status_to_tags (status_id, tag_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(&status.id)
            .bind(&tag_id)
            .execute(&mut *conn)
            .await
            .map(|_| ())
            .map_err(AppError::from),
        )?;
    }

    // Attachments are uploaded before their status exists.
    for attachment_id in status.attachments.ids() {
        observe_query("update", "media_attachments");
        sqlx::query("UPDATE media_attachments SET status_id = ?, updated_at = ? WHERE id = ?")
            .bind(&status.id)
            .bind(status.updated_at)
            .bind(&attachment_id)
            .execute(&mut *conn)
            .await?;
    }

    if let Some(thread_id) = &status.thread_id {
        observe_query("insert", "thread_to_statuses");
        ignore_already_exists(
            sqlx::query(
                "INSERT INTO thread_to_statuses (thread_id, status_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(thread_id)
            .bind(&status.id)
            .execute(&mut *conn)
            .await
            .map(|_| ())
            .map_err(AppError::from),
        )?;
    }

    Ok(())
}

fn push_status_column<'a>(
    query: &mut QueryBuilder<'a, Sqlite>,
    status: &'a Status,
    column: StatusColumn,
) {
    match column {
        StatusColumn::Uri => {
            query.push(", uri = ").push_bind(&status.uri);
        }
        StatusColumn::Url => {
            query.push(", url = ").push_bind(&status.url);
        }
        StatusColumn::Content => {
            query.push(", content = ").push_bind(&status.content);
        }
        StatusColumn::ContentWarning => {
            query
                .push(", content_warning = ")
                .push_bind(&status.content_warning);
        }
        StatusColumn::Visibility => {
            query.push(", visibility = ").push_bind(&status.visibility);
        }
        StatusColumn::Language => {
            query.push(", language = ").push_bind(&status.language);
        }
        StatusColumn::Sensitive => {
            query.push(", sensitive = ").push_bind(status.sensitive);
        }
        StatusColumn::InReplyTo => {
            query
                .push(", in_reply_to_id = ")
                .push_bind(&status.in_reply_to_id)
                .push(", in_reply_to_uri = ")
                .push_bind(&status.in_reply_to_uri)
                .push(", in_reply_to_account_id = ")
                .push_bind(&status.in_reply_to_account_id);
        }
        StatusColumn::BoostOf => {
            query
                .push(", boost_of_id = ")
                .push_bind(&status.boost_of_id)
                .push(", boost_of_account_id = ")
                .push_bind(&status.boost_of_account_id);
        }
        StatusColumn::ThreadId => {
            query.push(", thread_id = ").push_bind(&status.thread_id);
        }
        StatusColumn::PollId => {
            query.push(", poll_id = ").push_bind(&status.poll_id);
        }
        StatusColumn::CreatedWithApplicationId => {
            query
                .push(", created_with_application_id = ")
                .push_bind(&status.created_with_application_id);
        }
        StatusColumn::AttachmentIds => {
            query
                .push(", attachment_ids = ")
                .push_bind(Json(status.attachments.ids()));
        }
        StatusColumn::TagIds => {
            query.push(", tag_ids = ").push_bind(Json(status.tags.ids()));
        }
        StatusColumn::MentionIds => {
            query
                .push(", mention_ids = ")
                .push_bind(Json(status.mentions.ids()));
        }
        StatusColumn::EmojiIds => {
            query.push(", emoji_ids = ").push_bind(Json(status.emojis.ids()));
        }
    }
}
