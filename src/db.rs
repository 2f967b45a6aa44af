use crate::business_hours::BusinessHoursConfig;
use crate::session::{normalize_phone, ContactSession, VisitedNode};
use crate::types::{
    Campaign, CampaignMessage, CampaignStatus, Contact, InteractiveCampaign, InteractiveStatus,
    MessageStatus, SenderAccount, SessionStatus,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use std::borrow::Cow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

fn i64_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn datetime_to_i64(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

// The Any driver cannot decode NULL into `Option<T>` on SQLite. Nullable
// columns are selected as COALESCE(col, '') or COALESCE(ts, -1) and mapped
// back here.
const NULL_MILLIS: i64 = -1;

fn opt_text(row: &AnyRow, column: &str) -> Result<Option<String>> {
    let value: String = row.try_get(column)?;
    Ok(Some(value).filter(|v| !v.is_empty()))
}

fn opt_datetime(row: &AnyRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let value: i64 = row.try_get(column)?;
    Ok((value != NULL_MILLIS).then(|| i64_to_datetime(value)))
}

fn json_column<T: serde::de::DeserializeOwned + Default>(row: &AnyRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    Ok(serde_json::from_str(&raw).unwrap_or_default())
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn status_placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS contacts (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            phone TEXT NOT NULL,
            name TEXT,
            email TEXT,
            categories TEXT NOT NULL,
            fields TEXT NOT NULL,
            created_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_contacts_phone ON contacts(phone)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_contacts_tenant ON contacts(tenant_id)"#,
        r#"CREATE TABLE IF NOT EXISTS sender_accounts (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_sender_accounts_name ON sender_accounts(tenant_id, name)"#,
        r#"CREATE TABLE IF NOT EXISTS campaigns (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            target_categories TEXT NOT NULL,
            sender_accounts TEXT NOT NULL,
            message_type TEXT NOT NULL,
            content TEXT NOT NULL,
            min_delay BIGINT NOT NULL,
            max_delay BIGINT NOT NULL,
            start_immediately BIGINT NOT NULL,
            scheduled_for BIGINT,
            status TEXT NOT NULL,
            total_contacts BIGINT NOT NULL,
            sent_count BIGINT NOT NULL,
            failed_count BIGINT NOT NULL,
            created_at BIGINT NOT NULL,
            started_at BIGINT,
            completed_at BIGINT,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns(status)"#,
        r#"CREATE TABLE IF NOT EXISTS campaign_messages (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL,
            contact_id TEXT NOT NULL,
            phone TEXT NOT NULL,
            contact_name TEXT,
            status TEXT NOT NULL,
            sender_account TEXT,
            variation TEXT,
            error TEXT,
            provider_message_id TEXT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            sent_at BIGINT
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_campaign_messages_queue ON campaign_messages(campaign_id, status, created_at)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_campaign_messages_contact ON campaign_messages(campaign_id, contact_id, status)"#,
        r#"CREATE TABLE IF NOT EXISTS business_hours (
            campaign_id TEXT PRIMARY KEY,
            config TEXT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS interactive_campaigns (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            graph TEXT NOT NULL,
            status TEXT NOT NULL,
            sender_account_id TEXT,
            scheduled_at BIGINT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS contact_sessions (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL,
            contact_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            phone TEXT NOT NULL,
            sender_account TEXT,
            chat_id TEXT,
            current_node_id TEXT,
            variables TEXT NOT NULL,
            last_message TEXT,
            last_message_at BIGINT,
            status TEXT NOT NULL,
            visited TEXT NOT NULL,
            wake_at BIGINT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_campaign_contact ON contact_sessions(campaign_id, contact_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_sessions_phone ON contact_sessions(phone, status)"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// contacts and sender accounts

pub async fn insert_contact(pool: &AnyPool, kind: DbKind, contact: &Contact) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO contacts (id, tenant_id, phone, name, email, categories, fields, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&contact.id)
        .bind(&contact.tenant_id)
        .bind(normalize_phone(&contact.phone))
        .bind(contact.name.as_deref())
        .bind(contact.email.as_deref())
        .bind(to_json(&contact.categories))
        .bind(to_json(&contact.fields))
        .bind(datetime_to_i64(Utc::now()))
        .execute(pool)
        .await?;
    Ok(())
}

fn row_to_contact(row: &AnyRow) -> Result<Contact> {
    Ok(Contact {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        phone: row.try_get("phone")?,
        name: opt_text(row, "name")?,
        email: opt_text(row, "email")?,
        categories: json_column(row, "categories")?,
        fields: json_column(row, "fields")?,
    })
}

const CONTACT_COLUMNS: &str =
    "id, tenant_id, phone, COALESCE(name, '') AS name, COALESCE(email, '') AS email, categories, fields";

pub async fn get_contact(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<Contact>> {
    let base = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?");
    let sql = rewrite_sql(&base, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(row_to_contact).transpose()
}

pub async fn find_contacts_by_phone(pool: &AnyPool, kind: DbKind, phone: &str) -> Result<Vec<Contact>> {
    let base = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE phone = ? ORDER BY created_at ASC");
    let sql = rewrite_sql(&base, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(normalize_phone(phone))
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_contact).collect()
}

/// Tenant contacts tagged with any of `categories`; every contact of the
/// tenant when `categories` is empty.
pub async fn list_contacts_in_categories(
    pool: &AnyPool,
    kind: DbKind,
    tenant_id: &str,
    categories: &[String],
) -> Result<Vec<Contact>> {
    let base = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE tenant_id = ? ORDER BY created_at ASC, id ASC");
    let sql = rewrite_sql(&base, kind);
    let rows = sqlx::query(sql.as_ref()).bind(tenant_id).fetch_all(pool).await?;

    let mut result = Vec::new();
    for row in rows {
        let contact = row_to_contact(&row)?;
        if categories.is_empty() || contact.categories.iter().any(|c| categories.contains(c)) {
            result.push(contact);
        }
    }
    Ok(result)
}

pub async fn upsert_sender_account(pool: &AnyPool, kind: DbKind, account: &SenderAccount) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO sender_accounts (id, tenant_id, name, status, updated_at)
           VALUES (?, ?, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
               name=excluded.name,
               status=excluded.status,
               updated_at=excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&account.id)
        .bind(&account.tenant_id)
        .bind(&account.name)
        .bind(&account.status)
        .bind(datetime_to_i64(Utc::now()))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_sender_accounts(pool: &AnyPool, kind: DbKind, tenant_id: &str) -> Result<Vec<SenderAccount>> {
    let sql = rewrite_sql(
        "SELECT id, tenant_id, name, status FROM sender_accounts WHERE tenant_id = ? ORDER BY name ASC",
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).bind(tenant_id).fetch_all(pool).await?;
    let mut result = Vec::new();
    for row in rows {
        result.push(SenderAccount {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
        });
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// bulk campaigns

const CAMPAIGN_COLUMNS: &str = "id, tenant_id, name, target_categories, sender_accounts, message_type, content, \
    min_delay, max_delay, start_immediately, COALESCE(scheduled_for, -1) AS scheduled_for, status, total_contacts, \
    sent_count, failed_count, created_at, COALESCE(started_at, -1) AS started_at, \
    COALESCE(completed_at, -1) AS completed_at";

fn row_to_campaign(row: &AnyRow) -> Result<Campaign> {
    let message_type: String = row.try_get("message_type")?;
    let status: String = row.try_get("status")?;
    let content: String = row.try_get("content")?;
    let min_delay: i64 = row.try_get("min_delay")?;
    let max_delay: i64 = row.try_get("max_delay")?;
    let start_immediately: i64 = row.try_get("start_immediately")?;
    let created_at: i64 = row.try_get("created_at")?;
    Ok(Campaign {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        target_categories: json_column(row, "target_categories")?,
        sender_accounts: json_column(row, "sender_accounts")?,
        message_type: message_type.parse()?,
        content: serde_json::from_str(&content).unwrap_or(Value::Null),
        min_delay: min_delay.max(0) as u64,
        max_delay: max_delay.max(0) as u64,
        start_immediately: start_immediately != 0,
        scheduled_for: opt_datetime(row, "scheduled_for")?,
        status: status.parse()?,
        total_contacts: row.try_get("total_contacts")?,
        sent_count: row.try_get("sent_count")?,
        failed_count: row.try_get("failed_count")?,
        created_at: i64_to_datetime(created_at),
        started_at: opt_datetime(row, "started_at")?,
        completed_at: opt_datetime(row, "completed_at")?,
    })
}

/// Persists a campaign and its whole message queue atomically.
pub async fn insert_campaign_with_messages(
    pool: &AnyPool,
    kind: DbKind,
    campaign: &Campaign,
    messages: &[CampaignMessage],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let sql = rewrite_sql(
        r#"INSERT INTO campaigns (
            id, tenant_id, name, target_categories, sender_accounts, message_type, content,
            min_delay, max_delay, start_immediately, scheduled_for, status, total_contacts,
            sent_count, failed_count, created_at, started_at, completed_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&campaign.id)
        .bind(&campaign.tenant_id)
        .bind(&campaign.name)
        .bind(to_json(&campaign.target_categories))
        .bind(to_json(&campaign.sender_accounts))
        .bind(campaign.message_type.as_str())
        .bind(campaign.content.to_string())
        .bind(i64::try_from(campaign.min_delay).unwrap_or(i64::MAX))
        .bind(i64::try_from(campaign.max_delay).unwrap_or(i64::MAX))
        .bind(i64::from(campaign.start_immediately))
        .bind(campaign.scheduled_for.map(datetime_to_i64))
        .bind(campaign.status.as_str())
        .bind(campaign.total_contacts)
        .bind(campaign.sent_count)
        .bind(campaign.failed_count)
        .bind(datetime_to_i64(campaign.created_at))
        .bind(campaign.started_at.map(datetime_to_i64))
        .bind(campaign.completed_at.map(datetime_to_i64))
        .bind(datetime_to_i64(campaign.created_at))
        .execute(&mut *tx)
        .await?;

    let sql = rewrite_sql(
        r#"INSERT INTO campaign_messages (
            id, campaign_id, contact_id, phone, contact_name, status, sender_account, variation,
            error, provider_message_id, created_at, updated_at, sent_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    for message in messages {
        sqlx::query(sql.as_ref())
            .bind(&message.id)
            .bind(&message.campaign_id)
            .bind(&message.contact_id)
            .bind(&message.phone)
            .bind(message.contact_name.as_deref())
            .bind(message.status.as_str())
            .bind(message.sender_account.as_deref())
            .bind(message.variation.as_ref().map(|v| v.to_string()))
            .bind(message.error.as_deref())
            .bind(message.provider_message_id.as_deref())
            .bind(datetime_to_i64(message.created_at))
            .bind(datetime_to_i64(message.updated_at))
            .bind(message.sent_at.map(datetime_to_i64))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn get_campaign(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<Campaign>> {
    let base = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?");
    let sql = rewrite_sql(&base, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(row_to_campaign).transpose()
}

pub async fn list_campaigns_by_status(pool: &AnyPool, kind: DbKind, status: CampaignStatus) -> Result<Vec<Campaign>> {
    let base = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE status = ? ORDER BY created_at ASC");
    let sql = rewrite_sql(&base, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(status.as_str())
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_campaign).collect()
}

pub async fn delete_campaign(pool: &AnyPool, kind: DbKind, id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    for stmt in [
        "DELETE FROM campaign_messages WHERE campaign_id = ?",
        "DELETE FROM business_hours WHERE campaign_id = ?",
        "DELETE FROM campaigns WHERE id = ?",
    ] {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).bind(id).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Compare-and-set on campaign status. Returns false when the row was not in `from`.
pub async fn transition_campaign(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    from: CampaignStatus,
    to: CampaignStatus,
) -> Result<bool> {
    if !from.can_transition_to(to) {
        return Err(anyhow!("campaign cannot move from {} to {}", from, to));
    }
    let now = datetime_to_i64(Utc::now());
    let sql = rewrite_sql(
        r#"UPDATE campaigns SET
               status = ?,
               started_at = CASE WHEN ? = 'RUNNING' AND started_at IS NULL THEN ? ELSE started_at END,
               completed_at = CASE WHEN ? IN ('COMPLETED', 'FAILED') THEN ? ELSE completed_at END,
               updated_at = ?
           WHERE id = ? AND status = ?"#,
        kind,
    );
    let done = sqlx::query(sql.as_ref())
        .bind(to.as_str())
        .bind(to.as_str())
        .bind(now)
        .bind(to.as_str())
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(from.as_str())
        .execute(pool)
        .await?;
    Ok(done.rows_affected() == 1)
}

/// Marks a PENDING campaign for pickup on the next tick.
pub async fn request_immediate_start(pool: &AnyPool, kind: DbKind, id: &str) -> Result<bool> {
    let sql = rewrite_sql(
        "UPDATE campaigns SET start_immediately = 1, updated_at = ? WHERE id = ? AND status = 'PENDING'",
        kind,
    );
    let done = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(done.rows_affected() == 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Sent,
    Failed,
}

/// Bumps one outcome counter, never past `total_contacts`.
pub async fn increment_campaign_counter(pool: &AnyPool, kind: DbKind, id: &str, counter: Counter) -> Result<bool> {
    let stmt = match counter {
        Counter::Sent => {
            "UPDATE campaigns SET sent_count = sent_count + 1, updated_at = ? \
             WHERE id = ? AND sent_count + failed_count < total_contacts"
        }
        Counter::Failed => {
            "UPDATE campaigns SET failed_count = failed_count + 1, updated_at = ? \
             WHERE id = ? AND sent_count + failed_count < total_contacts"
        }
    };
    let sql = rewrite_sql(stmt, kind);
    let done = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(done.rows_affected() == 1)
}

pub async fn upsert_business_hours(
    pool: &AnyPool,
    kind: DbKind,
    campaign_id: &str,
    config: &BusinessHoursConfig,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO business_hours (campaign_id, config, updated_at) VALUES (?, ?, ?)
           ON CONFLICT(campaign_id) DO UPDATE SET config=excluded.config, updated_at=excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(campaign_id)
        .bind(to_json(config))
        .bind(datetime_to_i64(Utc::now()))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_business_hours(pool: &AnyPool, kind: DbKind, campaign_id: &str) -> Result<Option<BusinessHoursConfig>> {
    let sql = rewrite_sql("SELECT config FROM business_hours WHERE campaign_id = ?", kind);
    let row = sqlx::query(sql.as_ref())
        .bind(campaign_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => {
            let raw: String = row.try_get("config")?;
            Ok(Some(serde_json::from_str(&raw)?))
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// campaign message queue

const MESSAGE_COLUMNS: &str = "id, campaign_id, contact_id, phone, COALESCE(contact_name, '') AS contact_name, \
    status, COALESCE(sender_account, '') AS sender_account, COALESCE(variation, '') AS variation, \
    COALESCE(error, '') AS error, COALESCE(provider_message_id, '') AS provider_message_id, \
    created_at, updated_at, COALESCE(sent_at, -1) AS sent_at";

fn row_to_message(row: &AnyRow) -> Result<CampaignMessage> {
    let status: String = row.try_get("status")?;
    let variation = opt_text(row, "variation")?;
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    Ok(CampaignMessage {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        contact_id: row.try_get("contact_id")?,
        phone: row.try_get("phone")?,
        contact_name: opt_text(row, "contact_name")?,
        status: status.parse()?,
        sender_account: opt_text(row, "sender_account")?,
        variation: variation.and_then(|v| serde_json::from_str(&v).ok()),
        error: opt_text(row, "error")?,
        provider_message_id: opt_text(row, "provider_message_id")?,
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
        sent_at: opt_datetime(row, "sent_at")?,
    })
}

pub fn new_campaign_message(campaign_id: &str, contact: &Contact, now: DateTime<Utc>) -> CampaignMessage {
    CampaignMessage {
        id: Uuid::new_v4().to_string(),
        campaign_id: campaign_id.to_string(),
        contact_id: contact.id.clone(),
        phone: normalize_phone(&contact.phone),
        contact_name: contact.name.clone(),
        status: MessageStatus::Pending,
        sender_account: None,
        variation: None,
        error: None,
        provider_message_id: None,
        created_at: now,
        updated_at: now,
        sent_at: None,
    }
}

/// Oldest PENDING message of a campaign.
pub async fn next_pending_message(pool: &AnyPool, kind: DbKind, campaign_id: &str) -> Result<Option<CampaignMessage>> {
    let base = format!(
        "SELECT {MESSAGE_COLUMNS} FROM campaign_messages \
         WHERE campaign_id = ? AND status = 'PENDING' ORDER BY created_at ASC, id ASC LIMIT 1"
    );
    let sql = rewrite_sql(&base, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(campaign_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_message).transpose()
}

pub async fn get_campaign_message(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<CampaignMessage>> {
    let base = format!("SELECT {MESSAGE_COLUMNS} FROM campaign_messages WHERE id = ?");
    let sql = rewrite_sql(&base, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(row_to_message).transpose()
}

pub async fn list_campaign_messages(
    pool: &AnyPool,
    kind: DbKind,
    campaign_id: &str,
    status: Option<MessageStatus>,
) -> Result<Vec<CampaignMessage>> {
    let rows = match status {
        Some(status) => {
            let base = format!(
                "SELECT {MESSAGE_COLUMNS} FROM campaign_messages \
                 WHERE campaign_id = ? AND status = ? ORDER BY created_at ASC, id ASC"
            );
            let sql = rewrite_sql(&base, kind);
            sqlx::query(sql.as_ref())
                .bind(campaign_id)
                .bind(status.as_str())
                .fetch_all(pool)
                .await?
        }
        None => {
            let base = format!(
                "SELECT {MESSAGE_COLUMNS} FROM campaign_messages WHERE campaign_id = ? ORDER BY created_at ASC, id ASC"
            );
            let sql = rewrite_sql(&base, kind);
            sqlx::query(sql.as_ref()).bind(campaign_id).fetch_all(pool).await?
        }
    };
    rows.iter().map(row_to_message).collect()
}

pub async fn count_messages_by_status(
    pool: &AnyPool,
    kind: DbKind,
    campaign_id: &str,
    statuses: &[MessageStatus],
) -> Result<i64> {
    if statuses.is_empty() {
        return Ok(0);
    }
    let base = format!(
        "SELECT COUNT(1) AS total FROM campaign_messages WHERE campaign_id = ? AND status IN ({})",
        status_placeholders(statuses.len())
    );
    let sql = rewrite_sql(&base, kind);
    let mut query = sqlx::query(sql.as_ref()).bind(campaign_id);
    for status in statuses {
        query = query.bind(status.as_str());
    }
    let row = query.fetch_one(pool).await?;
    Ok(row.try_get("total")?)
}

/// PENDING -> PROCESSING. Only one caller can win for a given message.
pub async fn claim_campaign_message(pool: &AnyPool, kind: DbKind, id: &str) -> Result<bool> {
    let sql = rewrite_sql(
        "UPDATE campaign_messages SET status = 'PROCESSING', updated_at = ? WHERE id = ? AND status = 'PENDING'",
        kind,
    );
    let done = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(done.rows_affected() == 1)
}

/// PROCESSING -> PENDING for a message whose campaign stopped mid-send.
pub async fn release_campaign_message(pool: &AnyPool, kind: DbKind, id: &str) -> Result<bool> {
    let sql = rewrite_sql(
        "UPDATE campaign_messages SET status = 'PENDING', updated_at = ? WHERE id = ? AND status = 'PROCESSING'",
        kind,
    );
    let done = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(done.rows_affected() == 1)
}

/// Startup recovery: nothing can be mid-send in a fresh process.
pub async fn release_stale_processing(pool: &AnyPool, kind: DbKind) -> Result<u64> {
    let sql = rewrite_sql(
        "UPDATE campaign_messages SET status = 'PENDING', updated_at = ? WHERE status = 'PROCESSING'",
        kind,
    );
    let done = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(Utc::now()))
        .execute(pool)
        .await?;
    Ok(done.rows_affected())
}

pub async fn mark_message_sent(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    sender_account: &str,
    variation: &Value,
    provider_message_id: Option<&str>,
) -> Result<bool> {
    let now = datetime_to_i64(Utc::now());
    let sql = rewrite_sql(
        r#"UPDATE campaign_messages SET
               status = 'SENT', sender_account = ?, variation = ?, provider_message_id = ?,
               error = NULL, sent_at = ?, updated_at = ?
           WHERE id = ? AND status = 'PROCESSING'"#,
        kind,
    );
    let done = sqlx::query(sql.as_ref())
        .bind(sender_account)
        .bind(variation.to_string())
        .bind(provider_message_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(done.rows_affected() == 1)
}

pub async fn mark_message_failed(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    error: &str,
    sender_account: Option<&str>,
    variation: Option<&Value>,
) -> Result<bool> {
    let sql = rewrite_sql(
        r#"UPDATE campaign_messages SET
               status = 'FAILED', error = ?,
               sender_account = COALESCE(?, sender_account),
               variation = COALESCE(?, variation),
               updated_at = ?
           WHERE id = ? AND status IN ('PENDING', 'PROCESSING')"#,
        kind,
    );
    let done = sqlx::query(sql.as_ref())
        .bind(error)
        .bind(sender_account)
        .bind(variation.map(|v| v.to_string()))
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(done.rows_affected() == 1)
}

/// True when another message of the same campaign already reached this contact.
pub async fn contact_already_sent(
    pool: &AnyPool,
    kind: DbKind,
    campaign_id: &str,
    contact_id: &str,
    excluding_message_id: &str,
) -> Result<bool> {
    let sql = rewrite_sql(
        "SELECT 1 FROM campaign_messages WHERE campaign_id = ? AND contact_id = ? AND status = 'SENT' AND id <> ? LIMIT 1",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(campaign_id)
        .bind(contact_id)
        .bind(excluding_message_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

// ---------------------------------------------------------------------------
// interactive campaigns

const INTERACTIVE_COLUMNS: &str = "id, tenant_id, name, graph, status, \
    COALESCE(sender_account_id, '') AS sender_account_id, COALESCE(scheduled_at, -1) AS scheduled_at, \
    created_at, updated_at";

fn row_to_interactive(row: &AnyRow) -> Result<InteractiveCampaign> {
    let graph: String = row.try_get("graph")?;
    let status: String = row.try_get("status")?;
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    Ok(InteractiveCampaign {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        graph: serde_json::from_str(&graph)?,
        status: status.parse()?,
        sender_account_id: opt_text(row, "sender_account_id")?,
        scheduled_at: opt_datetime(row, "scheduled_at")?,
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
    })
}

pub async fn insert_interactive_campaign(pool: &AnyPool, kind: DbKind, campaign: &InteractiveCampaign) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO interactive_campaigns (
            id, tenant_id, name, graph, status, sender_account_id, scheduled_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&campaign.id)
        .bind(&campaign.tenant_id)
        .bind(&campaign.name)
        .bind(to_json(&campaign.graph))
        .bind(campaign.status.as_str())
        .bind(campaign.sender_account_id.as_deref())
        .bind(campaign.scheduled_at.map(datetime_to_i64))
        .bind(datetime_to_i64(campaign.created_at))
        .bind(datetime_to_i64(campaign.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_interactive_campaign(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<InteractiveCampaign>> {
    let base = format!("SELECT {INTERACTIVE_COLUMNS} FROM interactive_campaigns WHERE id = ?");
    let sql = rewrite_sql(&base, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(row_to_interactive).transpose()
}

pub async fn list_interactive_by_status(
    pool: &AnyPool,
    kind: DbKind,
    status: InteractiveStatus,
) -> Result<Vec<InteractiveCampaign>> {
    let base = format!(
        "SELECT {INTERACTIVE_COLUMNS} FROM interactive_campaigns WHERE status = ? ORDER BY created_at ASC"
    );
    let sql = rewrite_sql(&base, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(status.as_str())
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_interactive).collect()
}

pub async fn transition_interactive(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    from: InteractiveStatus,
    to: InteractiveStatus,
) -> Result<bool> {
    if !from.can_transition_to(to) {
        return Err(anyhow!("interactive campaign cannot move from {} to {}", from, to));
    }
    let sql = rewrite_sql(
        "UPDATE interactive_campaigns SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        kind,
    );
    let done = sqlx::query(sql.as_ref())
        .bind(to.as_str())
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .bind(from.as_str())
        .execute(pool)
        .await?;
    Ok(done.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// contact sessions

const SESSION_COLUMNS: &str = "id, campaign_id, contact_id, tenant_id, phone, \
    COALESCE(sender_account, '') AS sender_account, COALESCE(chat_id, '') AS chat_id, \
    COALESCE(current_node_id, '') AS current_node_id, variables, COALESCE(last_message, '') AS last_message, \
    COALESCE(last_message_at, -1) AS last_message_at, status, visited, COALESCE(wake_at, -1) AS wake_at, \
    created_at, updated_at";

fn row_to_session(row: &AnyRow) -> Result<ContactSession> {
    let status: String = row.try_get("status")?;
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    let visited: Vec<VisitedNode> = json_column(row, "visited")?;
    Ok(ContactSession {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        contact_id: row.try_get("contact_id")?,
        tenant_id: row.try_get("tenant_id")?,
        phone: row.try_get("phone")?,
        sender_account: opt_text(row, "sender_account")?,
        chat_id: opt_text(row, "chat_id")?,
        current_node_id: opt_text(row, "current_node_id")?,
        variables: json_column(row, "variables")?,
        last_message: opt_text(row, "last_message")?,
        last_message_at: opt_datetime(row, "last_message_at")?,
        status: status.parse::<SessionStatus>()?,
        visited,
        wake_at: opt_datetime(row, "wake_at")?,
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
    })
}

/// Inserts the session unless the contact already has one for this campaign.
/// Returns the stored row and whether this call created it.
pub async fn upsert_contact_session(
    pool: &AnyPool,
    kind: DbKind,
    session: &ContactSession,
) -> Result<(ContactSession, bool)> {
    let sql = rewrite_sql(
        r#"INSERT INTO contact_sessions (
            id, campaign_id, contact_id, tenant_id, phone, sender_account, chat_id, current_node_id,
            variables, last_message, last_message_at, status, visited, wake_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(campaign_id, contact_id) DO NOTHING"#,
        kind,
    );
    let done = sqlx::query(sql.as_ref())
        .bind(&session.id)
        .bind(&session.campaign_id)
        .bind(&session.contact_id)
        .bind(&session.tenant_id)
        .bind(normalize_phone(&session.phone))
        .bind(session.sender_account.as_deref())
        .bind(session.chat_id.as_deref())
        .bind(session.current_node_id.as_deref())
        .bind(to_json(&session.variables))
        .bind(session.last_message.as_deref())
        .bind(session.last_message_at.map(datetime_to_i64))
        .bind(session.status.as_str())
        .bind(to_json(&session.visited))
        .bind(session.wake_at.map(datetime_to_i64))
        .bind(datetime_to_i64(session.created_at))
        .bind(datetime_to_i64(session.updated_at))
        .execute(pool)
        .await?;
    let created = done.rows_affected() == 1;

    let stored = find_session_for_contact(pool, kind, &session.campaign_id, &session.contact_id)
        .await?
        .ok_or_else(|| anyhow!("session for contact {} vanished after insert", session.contact_id))?;
    Ok((stored, created))
}

/// Writes back a session loaded while ACTIVE. Returns false when the stored
/// row already left ACTIVE (expired or finished elsewhere) and was kept.
pub async fn save_contact_session(pool: &AnyPool, kind: DbKind, session: &ContactSession) -> Result<bool> {
    let sql = rewrite_sql(
        r#"UPDATE contact_sessions SET
               sender_account = ?, chat_id = ?, current_node_id = ?, variables = ?,
               last_message = ?, last_message_at = ?, status = ?, visited = ?, wake_at = ?, updated_at = ?
           WHERE id = ? AND status = 'ACTIVE'"#,
        kind,
    );
    let done = sqlx::query(sql.as_ref())
        .bind(session.sender_account.as_deref())
        .bind(session.chat_id.as_deref())
        .bind(session.current_node_id.as_deref())
        .bind(to_json(&session.variables))
        .bind(session.last_message.as_deref())
        .bind(session.last_message_at.map(datetime_to_i64))
        .bind(session.status.as_str())
        .bind(to_json(&session.visited))
        .bind(session.wake_at.map(datetime_to_i64))
        .bind(datetime_to_i64(session.updated_at))
        .bind(&session.id)
        .execute(pool)
        .await?;
    Ok(done.rows_affected() == 1)
}

pub async fn get_contact_session(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<ContactSession>> {
    let base = format!("SELECT {SESSION_COLUMNS} FROM contact_sessions WHERE id = ?");
    let sql = rewrite_sql(&base, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(row_to_session).transpose()
}

pub async fn find_session_for_contact(
    pool: &AnyPool,
    kind: DbKind,
    campaign_id: &str,
    contact_id: &str,
) -> Result<Option<ContactSession>> {
    let base = format!("SELECT {SESSION_COLUMNS} FROM contact_sessions WHERE campaign_id = ? AND contact_id = ?");
    let sql = rewrite_sql(&base, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(campaign_id)
        .bind(contact_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_session).transpose()
}

/// ACTIVE sessions for a phone number, most recently touched first.
pub async fn find_active_sessions_by_phone(pool: &AnyPool, kind: DbKind, phone: &str) -> Result<Vec<ContactSession>> {
    let base = format!(
        "SELECT {SESSION_COLUMNS} FROM contact_sessions WHERE phone = ? AND status = 'ACTIVE' ORDER BY updated_at DESC"
    );
    let sql = rewrite_sql(&base, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(normalize_phone(phone))
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_session).collect()
}

pub async fn list_sessions_for_campaign(pool: &AnyPool, kind: DbKind, campaign_id: &str) -> Result<Vec<ContactSession>> {
    let base = format!(
        "SELECT {SESSION_COLUMNS} FROM contact_sessions WHERE campaign_id = ? ORDER BY created_at ASC, id ASC"
    );
    let sql = rewrite_sql(&base, kind);
    let rows = sqlx::query(sql.as_ref()).bind(campaign_id).fetch_all(pool).await?;
    rows.iter().map(row_to_session).collect()
}

/// ACTIVE sessions parked on a delay node, optionally scoped to one campaign.
pub async fn list_sessions_awaiting_wake(
    pool: &AnyPool,
    kind: DbKind,
    campaign_id: Option<&str>,
) -> Result<Vec<ContactSession>> {
    let rows = match campaign_id {
        Some(campaign_id) => {
            let base = format!(
                "SELECT {SESSION_COLUMNS} FROM contact_sessions \
                 WHERE status = 'ACTIVE' AND wake_at IS NOT NULL AND campaign_id = ? ORDER BY wake_at ASC"
            );
            let sql = rewrite_sql(&base, kind);
            sqlx::query(sql.as_ref()).bind(campaign_id).fetch_all(pool).await?
        }
        None => {
            let base = format!(
                "SELECT {SESSION_COLUMNS} FROM contact_sessions \
                 WHERE status = 'ACTIVE' AND wake_at IS NOT NULL ORDER BY wake_at ASC"
            );
            let sql = rewrite_sql(&base, kind);
            sqlx::query(sql.as_ref()).fetch_all(pool).await?
        }
    };
    rows.iter().map(row_to_session).collect()
}

/// ACTIVE sessions untouched since `cutoff` that are not waiting on a timer.
pub async fn list_idle_sessions(pool: &AnyPool, kind: DbKind, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
    let sql = rewrite_sql(
        "SELECT id FROM contact_sessions WHERE status = 'ACTIVE' AND wake_at IS NULL AND updated_at < ? \
         ORDER BY updated_at ASC",
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(cutoff))
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| row.try_get("id").map_err(Into::into))
        .collect()
}

/// Moves one session to EXPIRED if it is still ACTIVE and idle since `cutoff`.
pub async fn expire_session(pool: &AnyPool, kind: DbKind, id: &str, cutoff: DateTime<Utc>) -> Result<bool> {
    let sql = rewrite_sql(
        "UPDATE contact_sessions SET status = 'EXPIRED', updated_at = ? \
         WHERE id = ? AND status = 'ACTIVE' AND wake_at IS NULL AND updated_at < ?",
        kind,
    );
    let done = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .bind(datetime_to_i64(cutoff))
        .execute(pool)
        .await?;
    Ok(done.rows_affected() == 1)
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreCounts {
    pub campaigns: i64,
    pub pending_messages: i64,
    pub interactive_campaigns: i64,
    pub active_sessions: i64,
}

pub async fn store_counts(pool: &AnyPool, kind: DbKind) -> Result<StoreCounts> {
    async fn scalar(pool: &AnyPool, kind: DbKind, stmt: &str) -> Result<i64> {
        let sql = rewrite_sql(stmt, kind);
        let row = sqlx::query(sql.as_ref()).fetch_one(pool).await?;
        Ok(row.try_get("total")?)
    }
    Ok(StoreCounts {
        campaigns: scalar(pool, kind, "SELECT COUNT(1) AS total FROM campaigns").await?,
        pending_messages: scalar(
            pool,
            kind,
            "SELECT COUNT(1) AS total FROM campaign_messages WHERE status = 'PENDING'",
        )
        .await?,
        interactive_campaigns: scalar(pool, kind, "SELECT COUNT(1) AS total FROM interactive_campaigns").await?,
        active_sessions: scalar(
            pool,
            kind,
            "SELECT COUNT(1) AS total FROM contact_sessions WHERE status = 'ACTIVE'",
        )
        .await?,
    })
}

/// Parks a DRAFT or SCHEDULED interactive campaign until `at`.
pub async fn schedule_interactive(pool: &AnyPool, kind: DbKind, id: &str, at: DateTime<Utc>) -> Result<bool> {
    let sql = rewrite_sql(
        "UPDATE interactive_campaigns SET status = 'SCHEDULED', scheduled_at = ?, updated_at = ? \
         WHERE id = ? AND status IN ('DRAFT', 'SCHEDULED')",
        kind,
    );
    let done = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(at))
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(done.rows_affected() == 1)
}
