//! Integration tests for the status store (lookups, writes, traversal)

mod common;

use chrono::Utc;
use common::{TestStore, ids};
use sqlx::types::Json;
use tootvault::data::{CacheKey, Emoji, Poll, Relation, Status, StatusColumn, Tag, lookup};
use tootvault::error::AppError;
use tootvault::queue::StatusAction;
use tootvault::service::Retrieval;

#[tokio::test]
async fn test_reply_scenario_with_deleted_parent() {
    let store = TestStore::new().await;
    let statuses = &store.state.statuses;
    let account = store.create_test_account("01ACC").await;

    let a = store.post("01A", &account).await;
    assert_eq!(statuses.count_replies("01A").await.unwrap(), 0);

    let b = store.reply("01B", &account, &a).await;

    let ancestors = statuses.ancestors(&b, Retrieval::Barebones).await.unwrap();
    assert_eq!(ids(&ancestors), vec!["01A"]);

    // The cached reply list was dropped when B was stored
    let descendants = statuses
        .descendants("01A", Retrieval::Barebones)
        .await
        .unwrap();
    assert_eq!(ids(&descendants), vec!["01B"]);

    statuses.delete("01A").await.unwrap();

    let b = statuses.get_by_id("01B", Retrieval::Barebones).await.unwrap();
    assert_eq!(b.in_reply_to_id.as_deref(), Some("01A"));

    let error = statuses
        .ancestors(&b, Retrieval::Barebones)
        .await
        .unwrap_err();
    assert!(error.is_not_found());
}

#[tokio::test]
async fn test_ancestors_nearest_first() {
    let store = TestStore::new().await;
    let account = store.create_test_account("01ACC").await;

    let a = store.post("01A", &account).await;
    let b = store.reply("01B", &account, &a).await;
    let c = store.reply("01C", &account, &b).await;

    let ancestors = store
        .state
        .statuses
        .ancestors(&c, Retrieval::Full)
        .await
        .unwrap();
    assert_eq!(ids(&ancestors), vec!["01B", "01A"]);
    assert!(store.state.statuses.ancestors(&a, Retrieval::Full).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_descendants_depth_first() {
    let store = TestStore::new().await;
    let statuses = &store.state.statuses;
    let account = store.create_test_account("01ACC").await;

    let a = store.post("01A", &account).await;
    let b = store.reply("01B", &account, &a).await;
    store.reply("01C", &account, &a).await;
    store.reply("01D", &account, &b).await;

    // Direct replies are newest first; each is followed by its subtree
    let replies = statuses.replies("01A", Retrieval::Barebones).await.unwrap();
    assert_eq!(ids(&replies), vec!["01C", "01B"]);

    let descendants = statuses
        .descendants("01A", Retrieval::Barebones)
        .await
        .unwrap();
    assert_eq!(ids(&descendants), vec!["01C", "01B", "01D"]);
    assert!(statuses.descendants("01D", Retrieval::Barebones).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_newest_boost_wins_after_cached_lookup() {
    let store = TestStore::new().await;
    let statuses = &store.state.statuses;
    let author = store.create_test_account("01AUTHOR").await;
    let booster = store.create_test_account("01BOOSTER").await;

    let original = store.post("01S", &author).await;
    assert!(!statuses.is_boosted_by("01S", "01BOOSTER").await.unwrap());

    store.boost("01T1", &booster, &original).await;
    let first = statuses
        .get_boost("01S", "01BOOSTER", Retrieval::Barebones)
        .await
        .unwrap();
    assert_eq!(first.id, "01T1");

    // The boost alias now points at T1 in cache; storing T2 must drop it
    store.boost("01T2", &booster, &original).await;
    let newest = statuses
        .get_boost("01S", "01BOOSTER", Retrieval::Barebones)
        .await
        .unwrap();
    assert_eq!(newest.id, "01T2");

    assert!(statuses.is_boosted_by("01S", "01BOOSTER").await.unwrap());
    assert!(!statuses.is_boosted_by("01S", "01AUTHOR").await.unwrap());
    assert_eq!(statuses.count_boosts("01S").await.unwrap(), 2);

    let boosts = statuses.boosts("01S", Retrieval::Barebones).await.unwrap();
    assert_eq!(ids(&boosts), vec!["01T2", "01T1"]);
}

#[tokio::test]
async fn test_lookup_aliases_share_one_entry() {
    let store = TestStore::new().await;
    let statuses = &store.state.statuses;
    let account = store.create_test_account("01ACC").await;

    let mut status = Status::new("01A", &account, "<p>hello</p>");
    status.url = Some("https://test.example.com/@user/01A".to_string());
    status.poll_id = Some("01POLL".to_string());
    statuses.put(&mut status).await.unwrap();

    let by_uri = statuses
        .get_by_uri(&status.uri, Retrieval::Barebones)
        .await
        .unwrap();
    let by_url = statuses
        .get_by_url("https://test.example.com/@user/01A", Retrieval::Barebones)
        .await
        .unwrap();
    let by_poll = statuses
        .get_by_poll_id("01POLL", Retrieval::Barebones)
        .await
        .unwrap();

    assert_eq!(by_uri.id, "01A");
    assert_eq!(by_url.id, "01A");
    assert_eq!(by_poll.id, "01A");
    assert_eq!(store.state.caches.status.len(), 1);
    assert!(
        store
            .state
            .caches
            .status
            .get(&CacheKey::new(lookup::ID, ["01A"]))
            .is_some()
    );
}

#[tokio::test]
async fn test_full_retrieval_hydrates_relations() {
    let store = TestStore::new().await;
    let statuses = &store.state.statuses;
    let account = store.create_test_account("01ACC").await;
    let other = store.create_test_account("01OTHER").await;

    for id in ["01T1", "01T2"] {
        store
            .state
            .db
            .insert_tag(&Tag {
                id: id.to_string(),
                name: format!("tag{id}"),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let parent = store.post("01A", &other).await;
    let mut reply = Status::new("01B", &account, "<p>tagged reply</p>").reply_to(&parent);
    reply.tags = Relation::from_ids(vec!["01T2".to_string(), "01T1".to_string()]);
    statuses.put(&mut reply).await.unwrap();

    let full = statuses.get_by_id("01B", Retrieval::Full).await.unwrap();
    assert_eq!(full.account.as_ref().map(|a| a.id.as_str()), Some("01ACC"));
    assert_eq!(full.in_reply_to.as_ref().map(|s| s.id.as_str()), Some("01A"));
    assert_eq!(
        full.in_reply_to_account.as_ref().map(|a| a.id.as_str()),
        Some("01OTHER")
    );
    assert!(full.tags.is_populated());
    assert_eq!(full.tags.items()[0].name, "tag01T2");

    // The parent itself was fetched barebones
    assert!(full.in_reply_to.as_ref().unwrap().account.is_none());

    // The cache keeps only the barebones copy
    let cached = statuses.get_by_id("01B", Retrieval::Barebones).await.unwrap();
    assert!(cached.account.is_none());
    assert!(!cached.tags.is_populated());
}

#[tokio::test]
async fn test_population_errors_accumulate() {
    let store = TestStore::new().await;
    let statuses = &store.state.statuses;
    let real = store.create_test_account("01ACC").await;

    // Author row never inserted
    let mut ghost = real.clone();
    ghost.id = "01GHOST".to_string();
    ghost.uri = "https://test.example.com/users/ghost".to_string();

    let mut status = Status::new("01A", &ghost, "<p>broken</p>");
    status.poll_id = Some("01MISSINGPOLL".to_string());
    status.tags = Relation::from_ids(vec!["01MISSINGTAG".to_string()]);
    statuses.put(&mut status).await.unwrap();

    let error = statuses
        .get_by_id("01A", Retrieval::Full)
        .await
        .unwrap_err();
    let (status, source) = match error {
        AppError::Partial { status, source } => (status, source),
        other => panic!("expected a partially populated status, got {other:?}"),
    };
    assert_eq!(source.len(), 3);
    assert!(source.to_string().contains("author"));
    assert!(source.to_string().contains("poll"));
    assert!(source.to_string().contains("01MISSINGTAG"));
    assert_eq!(status.id, "01A");
    assert!(status.account.is_none());

    // Batch fetches keep partial statuses and skip missing ones
    let many = statuses
        .get_many(&["01A".to_string(), "01MISSING".to_string()], Retrieval::Full)
        .await;
    assert_eq!(ids(&many), vec!["01A"]);
}

#[tokio::test]
async fn test_update_writes_named_columns_and_refreshes_timestamp() {
    let store = TestStore::new().await;
    let statuses = &store.state.statuses;
    let account = store.create_test_account("01ACC").await;

    let mut status = store.post("01A", &account).await;
    let created_at = status.updated_at;

    status.content = "<p>edited</p>".to_string();
    status.language = Some("en".to_string());
    statuses
        .update(&mut status, &[StatusColumn::Content])
        .await
        .unwrap();
    assert!(status.updated_at >= created_at);

    let stored = store.state.db.get_status("01A").await.unwrap();
    assert_eq!(stored.content, "<p>edited</p>");
    assert_eq!(stored.language, None);

    let cached = statuses.get_by_id("01A", Retrieval::Barebones).await.unwrap();
    assert_eq!(cached.content, "<p>edited</p>");
}

#[tokio::test]
async fn test_update_unknown_status_fails_without_caching() {
    let store = TestStore::new().await;
    let statuses = &store.state.statuses;
    let account = store.create_test_account("01ACC").await;

    let mut status = Status::new("01NEVER", &account, "<p>never stored</p>");
    let error = statuses.update(&mut status, &[]).await.unwrap_err();

    assert!(error.is_not_found());
    assert!(store.state.caches.status.is_empty());
}

#[tokio::test]
async fn test_put_assigns_threads_to_top_level_statuses_only() {
    let store = TestStore::new().await;
    let account = store.create_test_account("01ACC").await;

    let a = store.post("01A", &account).await;
    let thread_id = a.thread_id.clone().expect("top-level status starts a thread");
    assert_eq!(
        store.state.db.get_thread_status_ids(&thread_id).await.unwrap(),
        vec!["01A"]
    );

    let b = store.reply("01B", &account, &a).await;
    assert_eq!(b.thread_id, None);
}

#[tokio::test]
async fn test_delete_invalidates_cache_and_is_idempotent() {
    let store = TestStore::new().await;
    let statuses = &store.state.statuses;
    let account = store.create_test_account("01ACC").await;

    store.post("01A", &account).await;
    statuses.get_by_id("01A", Retrieval::Barebones).await.unwrap();

    statuses.delete("01A").await.unwrap();
    assert!(
        store
            .state
            .caches
            .status
            .get(&CacheKey::new(lookup::ID, ["01A"]))
            .is_none()
    );
    assert!(
        statuses
            .get_by_id("01A", Retrieval::Barebones)
            .await
            .unwrap_err()
            .is_not_found()
    );

    statuses.delete("01A").await.unwrap();
    statuses.delete("01NEVER").await.unwrap();
}

#[tokio::test]
async fn test_failed_delete_still_invalidates_cache() {
    let store = TestStore::new().await;
    let statuses = &store.state.statuses;
    let caches = &store.state.caches;
    let account = store.create_test_account("01ACC").await;

    let a = store.post("01A", &account).await;
    store.reply("01B", &account, &a).await;
    statuses.get_by_id("01B", Retrieval::Barebones).await.unwrap();
    assert_eq!(statuses.count_replies("01A").await.unwrap(), 1);
    assert!(caches.in_reply_to_ids.get("01A").is_some());

    // Second statement of the delete transaction now fails.
    sqlx::query("DROP TABLE status_to_emojis")
        .execute(store.state.db.pool())
        .await
        .unwrap();

    let error = statuses.delete("01B").await.unwrap_err();
    assert!(matches!(error, AppError::Database(_)));

    assert!(
        caches
            .status
            .get(&CacheKey::new(lookup::ID, ["01B"]))
            .is_none()
    );
    assert!(caches.in_reply_to_ids.get("01A").is_none());

    // The transaction rolled back, so the row reloads.
    let reloaded = statuses.get_by_id("01B", Retrieval::Barebones).await.unwrap();
    assert_eq!(reloaded.in_reply_to_id.as_deref(), Some("01A"));
    assert_eq!(statuses.count_replies("01A").await.unwrap(), 1);
}

#[tokio::test]
async fn test_mutations_publish_events() {
    let mut store = TestStore::new().await;
    let account = store.create_test_account("01ACC").await;

    let mut status = store.post("01A", &account).await;
    store
        .state
        .statuses
        .update(&mut status, &[StatusColumn::Sensitive])
        .await
        .unwrap();
    store.state.statuses.delete("01A").await.unwrap();
    store.state.statuses.delete("01NEVER").await.unwrap();

    let events = store.drain_events();
    let actions: Vec<StatusAction> = events.iter().map(|event| event.action).collect();
    assert_eq!(
        actions,
        vec![StatusAction::Create, StatusAction::Update, StatusAction::Delete]
    );
    assert!(events.iter().all(|event| event.status.id == "01A"));
}

#[tokio::test]
async fn test_statuses_using_emoji() {
    let store = TestStore::new().await;
    let account = store.create_test_account("01ACC").await;

    store
        .state
        .db
        .insert_emoji(&Emoji {
            id: "01E".to_string(),
            shortcode: "blobcat".to_string(),
            domain: None,
            image_url: "https://test.example.com/emoji/blobcat.png".to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    for id in ["01A", "01B"] {
        let mut status = Status::new(id, &account, "<p>:blobcat:</p>");
        status.emojis = Relation::from_ids(vec!["01E".to_string()]);
        store.state.statuses.put(&mut status).await.unwrap();
    }
    store.post("01C", &account).await;

    let using = store
        .state
        .statuses
        .statuses_using_emoji("01E", Retrieval::Full)
        .await
        .unwrap();
    assert_eq!(ids(&using), vec!["01B", "01A"]);
    assert_eq!(using[0].emojis.items()[0].shortcode, "blobcat");
}

#[tokio::test]
async fn test_poll_is_hydrated() {
    let store = TestStore::new().await;
    let account = store.create_test_account("01ACC").await;

    store
        .state
        .db
        .insert_poll(&Poll {
            id: "01P".to_string(),
            status_id: "01A".to_string(),
            options: Json(vec!["yes".to_string(), "no".to_string()]),
            multiple: false,
            expires_at: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let mut status = Status::new("01A", &account, "<p>vote</p>");
    status.poll_id = Some("01P".to_string());
    store.state.statuses.put(&mut status).await.unwrap();

    let full = store
        .state
        .statuses
        .get_by_poll_id("01P", Retrieval::Full)
        .await
        .unwrap();
    assert_eq!(full.poll.map(|poll| poll.options.0.len()), Some(2));
}

#[tokio::test]
async fn test_concurrent_reads_and_writes_settle() {
    let store = TestStore::new().await;
    let statuses = &store.state.statuses;
    let account = store.create_test_account("01ACC").await;
    let root = store.post("01ROOT", &account).await;

    let tasks = (0..16).map(|i| {
        let account = &account;
        let root = &root;
        async move {
            let mut reply =
                Status::new(format!("01R{i:02}"), account, "<p>reply</p>").reply_to(root);
            statuses.put(&mut reply).await?;
            statuses.get_by_id("01ROOT", Retrieval::Full).await?;
            statuses.count_replies("01ROOT").await
        }
    });

    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    assert_eq!(statuses.count_replies("01ROOT").await.unwrap(), 16);
    assert_eq!(
        statuses.descendants("01ROOT", Retrieval::Barebones).await.unwrap().len(),
        16
    );
}
