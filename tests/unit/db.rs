use chrono::Utc;
use flowcast::db::{self, db_kind_from_url, rewrite_sql, Counter, DbKind};
use flowcast::types::{Campaign, CampaignStatus, Contact, MessageStatus, MessageType};
use serde_json::{json, Map};
use sqlx::AnyPool;
use std::borrow::Cow;
use tempfile::TempDir;

async fn store(dir: &TempDir) -> (AnyPool, DbKind) {
    sqlx::any::install_default_drivers();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("store.sqlite").to_string_lossy());
    let pool = AnyPool::connect(&url).await.unwrap();
    let kind = db_kind_from_url(&url);
    db::init_db(&pool, kind).await.unwrap();
    (pool, kind)
}

fn campaign(total: i64) -> Campaign {
    Campaign {
        id: "camp-1".to_string(),
        tenant_id: "tenant-1".to_string(),
        name: "Launch".to_string(),
        target_categories: vec![],
        sender_accounts: vec![],
        message_type: MessageType::Text,
        content: json!({"text": "hi"}),
        min_delay: 0,
        max_delay: 0,
        start_immediately: false,
        scheduled_for: None,
        status: CampaignStatus::Pending,
        total_contacts: total,
        sent_count: 0,
        failed_count: 0,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

fn contact(id: &str) -> Contact {
    Contact {
        id: id.to_string(),
        tenant_id: "tenant-1".to_string(),
        phone: format!("55119000{id}"),
        name: None,
        email: None,
        categories: vec![],
        fields: Map::new(),
    }
}

#[test]
fn test_store_kind_follows_url_scheme() {
    for (url, kind) in [
        ("sqlite://flowcast.db", DbKind::Sqlite),
        ("sqlite::memory:", DbKind::Sqlite),
        ("POSTGRES://db/flowcast", DbKind::Postgres),
        ("postgresql://db/flowcast", DbKind::Postgres),
        ("mysql://db/flowcast", DbKind::Sqlite),
    ] {
        assert_eq!(db_kind_from_url(url), kind, "{url}");
    }
}

#[test]
fn test_sqlite_statements_are_not_copied() {
    let sql = "UPDATE campaigns SET status = ? WHERE id = ? AND status = ?";
    assert!(matches!(rewrite_sql(sql, DbKind::Sqlite), Cow::Borrowed(_)));
}

#[test]
fn test_postgres_placeholders_numbered_past_nine() {
    let columns = vec!["?"; 16].join(", ");
    let sql = format!("INSERT INTO contact_sessions VALUES ({columns})");
    let rewritten = rewrite_sql(&sql, DbKind::Postgres);
    assert!(!rewritten.contains('?'));
    assert!(rewritten.contains("$9, $10"));
    assert!(rewritten.ends_with("$16)"));
}

#[tokio::test]
async fn test_claim_only_moves_pending_rows() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = store(&dir).await;
    let message = db::new_campaign_message("camp-1", &contact("01"), Utc::now());
    db::insert_campaign_with_messages(&pool, kind, &campaign(1), &[message.clone()])
        .await
        .unwrap();

    assert!(!db::claim_campaign_message(&pool, kind, "missing").await.unwrap());
    assert!(!db::release_campaign_message(&pool, kind, &message.id).await.unwrap());
    assert!(db::claim_campaign_message(&pool, kind, &message.id).await.unwrap());
    assert!(!db::claim_campaign_message(&pool, kind, &message.id).await.unwrap());
    assert!(db::release_campaign_message(&pool, kind, &message.id).await.unwrap());

    let stored = db::get_campaign_message(&pool, kind, &message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Pending);
}

#[tokio::test]
async fn test_counters_stop_at_total() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = store(&dir).await;
    db::insert_campaign_with_messages(&pool, kind, &campaign(0), &[]).await.unwrap();

    assert!(!db::increment_campaign_counter(&pool, kind, "camp-1", Counter::Sent).await.unwrap());
    assert!(!db::increment_campaign_counter(&pool, kind, "camp-1", Counter::Failed).await.unwrap());
    assert!(!db::increment_campaign_counter(&pool, kind, "missing", Counter::Sent).await.unwrap());

    let stored = db::get_campaign(&pool, kind, "camp-1").await.unwrap().unwrap();
    assert_eq!((stored.sent_count, stored.failed_count), (0, 0));
}
