//! Database tests

use super::*;
use chrono::Utc;
use sqlx::types::Json;
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

fn test_account(id: &str) -> Account {
    Account {
        id: id.to_string(),
        username: format!("user{id}"),
        domain: None,
        uri: format!("https://example.com/users/user{id}"),
        display_name: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn test_tag(id: &str) -> Tag {
    Tag {
        id: id.to_string(),
        name: format!("tag{id}"),
        created_at: Utc::now(),
    }
}

fn test_emoji(id: &str) -> Emoji {
    Emoji {
        id: id.to_string(),
        shortcode: format!("emoji{id}"),
        domain: None,
        image_url: format!("https://example.com/emoji/{id}.png"),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
    // Connection successful if we get here without panicking
}

#[tokio::test]
async fn test_status_lookups_by_each_column() {
    let db = Database::connect_in_memory().await.unwrap();
    let account = test_account("01ACC");
    db.insert_account(&account).await.unwrap();

    let mut status = Status::new("01A", &account, "<p>Hello, world!</p>");
    status.url = Some("https://example.com/@user/01A".to_string());
    status.poll_id = Some("01POLL".to_string());
    status.tags = Relation::from_ids(vec!["01T".to_string()]);
    db.put_status(&status, None).await.unwrap();

    let by_id = db.get_status("01A").await.unwrap();
    assert_eq!(by_id.content, "<p>Hello, world!</p>");
    assert_eq!(by_id.tags.ids(), vec!["01T".to_string()]);
    assert!(!by_id.tags.is_populated());

    let by_uri = db.get_status_by_uri(&status.uri).await.unwrap();
    assert_eq!(by_uri.id, "01A");
    let by_url = db
        .get_status_by_url("https://example.com/@user/01A")
        .await
        .unwrap();
    assert_eq!(by_url.id, "01A");
    let by_poll = db.get_status_by_poll_id("01POLL").await.unwrap();
    assert_eq!(by_poll.id, "01A");

    assert!(db.get_status("missing").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_join_rows_are_idempotent() {
    let db = Database::connect_in_memory().await.unwrap();
    let account = test_account("01ACC");
    db.insert_tag(&test_tag("01T")).await.unwrap();
    db.insert_emoji(&test_emoji("01E")).await.unwrap();

    let mut status = Status::new("01A", &account, "tagged");
    status.tags = Relation::from_ids(vec!["01T".to_string()]);
    status.emojis = Relation::from_ids(vec!["01E".to_string()]);
    db.put_status(&status, None).await.unwrap();

    // Rewriting the same join rows, as a racing writer would, is not an error
    db.update_status(&status, &[]).await.unwrap();
    db.update_status(&status, &[StatusColumn::TagIds]).await.unwrap();

    assert_eq!(db.get_status_tag_ids("01A").await.unwrap(), vec!["01T"]);
    assert_eq!(db.get_status_emoji_ids("01A").await.unwrap(), vec!["01E"]);
    assert_eq!(
        db.get_status_ids_using_emoji("01E").await.unwrap(),
        vec!["01A"]
    );
}

#[tokio::test]
async fn test_put_status_joins_new_thread() {
    let db = Database::connect_in_memory().await.unwrap();
    let account = test_account("01ACC");

    let thread = Thread::new();
    let mut status = Status::new("01A", &account, "root");
    status.thread_id = Some(thread.id.clone());
    db.put_status(&status, Some(&thread)).await.unwrap();

    assert_eq!(
        db.get_thread_status_ids(&thread.id).await.unwrap(),
        vec!["01A"]
    );
}

#[tokio::test]
async fn test_failed_put_rolls_back_every_row() {
    let db = Database::connect_in_memory().await.unwrap();
    let account = test_account("01ACC");

    let original = Status::new("01A", &account, "first");
    db.put_status(&original, None).await.unwrap();

    // Same ID again: the status insert fails after the join rows were written
    let thread = Thread::new();
    let mut duplicate = Status::new("01A", &account, "second");
    duplicate.thread_id = Some(thread.id.clone());
    duplicate.tags = Relation::from_ids(vec!["01T".to_string()]);

    let error = db.put_status(&duplicate, Some(&thread)).await.unwrap_err();
    assert!(error.is_already_exists());

    assert!(db.get_status_tag_ids("01A").await.unwrap().is_empty());
    assert!(db.get_thread_status_ids(&thread.id).await.unwrap().is_empty());
    assert_eq!(db.get_status("01A").await.unwrap().content, "first");
}

#[tokio::test]
async fn test_put_status_repoints_attachments() {
    let db = Database::connect_in_memory().await.unwrap();
    let account = test_account("01ACC");

    let attachment = MediaAttachment {
        id: "01M".to_string(),
        status_id: None,
        account_id: account.id.clone(),
        url: "https://example.com/media/01M.webp".to_string(),
        content_type: "image/webp".to_string(),
        description: Some("a cat".to_string()),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    db.insert_attachment(&attachment).await.unwrap();

    let mut status = Status::new("01A", &account, "with media");
    status.attachments = Relation::from_ids(vec!["01M".to_string()]);
    db.put_status(&status, None).await.unwrap();

    let attachment = db.get_attachment("01M").await.unwrap();
    assert_eq!(attachment.status_id.as_deref(), Some("01A"));
}

#[tokio::test]
async fn test_update_status_writes_only_named_columns() {
    let db = Database::connect_in_memory().await.unwrap();
    let account = test_account("01ACC");

    let mut status = Status::new("01A", &account, "before");
    db.put_status(&status, None).await.unwrap();

    status.content = "after".to_string();
    status.language = Some("en".to_string());
    status.updated_at = Utc::now() + chrono::Duration::seconds(5);
    db.update_status(&status, &[StatusColumn::Content])
        .await
        .unwrap();

    let stored = db.get_status("01A").await.unwrap();
    assert_eq!(stored.content, "after");
    assert_eq!(stored.language, None);
    assert_eq!(stored.updated_at.timestamp(), status.updated_at.timestamp());
}

#[tokio::test]
async fn test_update_missing_status_is_not_found() {
    let db = Database::connect_in_memory().await.unwrap();
    let status = Status::new("01A", &test_account("01ACC"), "never stored");

    let error = db.update_status(&status, &[]).await.unwrap_err();
    assert!(error.is_not_found());
}

#[tokio::test]
async fn test_delete_status_removes_join_rows() {
    let db = Database::connect_in_memory().await.unwrap();
    let account = test_account("01ACC");

    let thread = Thread::new();
    let mut status = Status::new("01A", &account, "doomed");
    status.thread_id = Some(thread.id.clone());
    status.tags = Relation::from_ids(vec!["01T".to_string()]);
    status.emojis = Relation::from_ids(vec!["01E".to_string()]);
    db.put_status(&status, Some(&thread)).await.unwrap();

    db.delete_status("01A").await.unwrap();

    assert!(db.get_status("01A").await.unwrap_err().is_not_found());
    assert!(db.get_status_tag_ids("01A").await.unwrap().is_empty());
    assert!(db.get_status_emoji_ids("01A").await.unwrap().is_empty());
    assert!(db.get_thread_status_ids(&thread.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_missing_status_is_noop() {
    let db = Database::connect_in_memory().await.unwrap();

    db.delete_status("missing").await.unwrap();
    db.delete_status("missing").await.unwrap();
}

#[tokio::test]
async fn test_newest_boost_wins() {
    let db = Database::connect_in_memory().await.unwrap();
    let author = test_account("01AUTHOR");
    let booster = test_account("01BOOSTER");

    let original = Status::new("01S", &author, "boost me");
    db.put_status(&original, None).await.unwrap();

    let first = Status::new("01T1", &booster, "").boost_of(&original);
    let second = Status::new("01T2", &booster, "").boost_of(&original);
    db.put_status(&first, None).await.unwrap();
    db.put_status(&second, None).await.unwrap();

    let boost = db.get_status_boost("01S", "01BOOSTER").await.unwrap();
    assert_eq!(boost.id, "01T2");
    assert_eq!(
        db.get_status_boost_ids("01S").await.unwrap(),
        vec!["01T2", "01T1"]
    );
    assert!(
        db.get_status_boost("01S", "01AUTHOR")
            .await
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn test_reply_ids_newest_first() {
    let db = Database::connect_in_memory().await.unwrap();
    let account = test_account("01ACC");

    let parent = Status::new("01A", &account, "parent");
    db.put_status(&parent, None).await.unwrap();
    for id in ["01B", "01C"] {
        let reply = Status::new(id, &account, "reply").reply_to(&parent);
        db.put_status(&reply, None).await.unwrap();
    }

    assert_eq!(
        db.get_status_reply_ids("01A").await.unwrap(),
        vec!["01C", "01B"]
    );
    assert!(db.get_status_reply_ids("01C").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_collaborator_lookups() {
    let db = Database::connect_in_memory().await.unwrap();

    let account = test_account("01ACC");
    db.insert_account(&account).await.unwrap();
    let stored = db.get_account("01ACC").await.unwrap();
    assert_eq!(stored.username, account.username);
    assert_eq!(stored.uri, account.uri);
    assert!(db.insert_account(&account).await.unwrap_err().is_already_exists());

    let poll = Poll {
        id: "01P".to_string(),
        status_id: "01A".to_string(),
        options: Json(vec!["yes".to_string(), "no".to_string()]),
        multiple: false,
        expires_at: None,
        created_at: Utc::now(),
    };
    db.insert_poll(&poll).await.unwrap();
    assert_eq!(db.get_poll("01P").await.unwrap().options.0, vec!["yes", "no"]);

    let application = Application {
        id: "01APP".to_string(),
        name: "Tusky".to_string(),
        website: None,
        created_at: Utc::now(),
    };
    db.insert_application(&application).await.unwrap();
    assert_eq!(db.get_application("01APP").await.unwrap().name, "Tusky");

    for id in ["01T1", "01T2"] {
        db.insert_tag(&test_tag(id)).await.unwrap();
    }
    let tags = db
        .get_tags(&["01T2".to_string(), "01T1".to_string(), "missing".to_string()])
        .await
        .unwrap();
    assert_eq!(tags.len(), 2);
    assert!(db.get_tags(&[]).await.unwrap().is_empty());

    let mention = Mention {
        id: "01MEN".to_string(),
        status_id: "01A".to_string(),
        origin_account_id: "01ACC".to_string(),
        target_account_id: "01OTHER".to_string(),
        created_at: Utc::now(),
    };
    db.insert_mention(&mention).await.unwrap();
    let mentions = db.get_mentions(&["01MEN".to_string()]).await.unwrap();
    assert_eq!(mentions.len(), 1);
    assert_eq!(mentions[0].target_account_id, "01OTHER");

    assert!(db.get_poll("missing").await.unwrap_err().is_not_found());
}
