use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skillswap_core::{
    Changeset, CommitReceipt, CreditAccount, CreditTransaction, Exchange, GuardedUpdate,
    LedgerPosting, MarketError, MarketResult, MarketStore, Message, MessageDraft, Notification,
    OfferingFilter, ProposalKey, RequestFilter, SkillCategory, SkillOffering, SkillRequest, Status,
    Swap, UserId,
};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row, postgres::PgRow};
use tracing::{debug, warn};
use uuid::Uuid;

const OFFERING_COLUMNS: &str = "id, owner_id, category_id, title, description, experience_level, \
     teaching_method, location, is_active, created_at, updated_at";
const REQUEST_COLUMNS: &str = "id, owner_id, category_id, title, description, current_level, \
     desired_level, preferred_method, availability, is_active, created_at, updated_at";
const SWAP_COLUMNS: &str = "id, teacher_id, learner_id, offering_id, request_id, status, \
     scheduled_times, teacher_rating, learner_rating, teacher_feedback, learner_feedback, \
     is_credit_based, created_at, updated_at, completed_at";
const EXCHANGE_COLUMNS: &str = "id, user1_id, user2_id, swap1_id, swap2_id, status, created_by, \
     is_credit_based, credit_amount, created_at, updated_at";
const TRANSACTION_COLUMNS: &str =
    "id, user_id, amount, description, related_id, balance_after, sequence, created_at";
const NOTIFICATION_COLUMNS: &str =
    "id, user_id, type, title, message, related_id, related_type, is_read, created_at";

/// Postgres-backed store. Each `commit` runs in one transaction; the partial
/// unique indexes on `swaps` keep proposal keys unique across processes.
#[derive(Clone)]
pub struct PgMarketStore {
    pool: PgPool,
}

impl PgMarketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MarketStore for PgMarketStore {
    async fn list_categories(&self) -> MarketResult<Vec<SkillCategory>> {
        let rows = sqlx::query("SELECT id, name FROM skill_categories ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .context("failed to list categories")?;
        Ok(rows
            .iter()
            .map(category_from_row)
            .collect::<Result<Vec<_>>>()?)
    }

    async fn find_category(&self, id: Uuid) -> MarketResult<Option<SkillCategory>> {
        let row = sqlx::query("SELECT id, name FROM skill_categories WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load category")?;
        Ok(row.as_ref().map(category_from_row).transpose()?)
    }

    async fn save_offering(&self, offering: &SkillOffering) -> MarketResult<()> {
        sqlx::query(
            r#"
            INSERT INTO skill_offerings (
                id, owner_id, category_id, title, description, experience_level,
                teaching_method, location, is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                category_id = EXCLUDED.category_id,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                experience_level = EXCLUDED.experience_level,
                teaching_method = EXCLUDED.teaching_method,
                location = EXCLUDED.location,
                is_active = EXCLUDED.is_active,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(offering.id)
        .bind(offering.owner_id)
        .bind(offering.category_id)
        .bind(&offering.title)
        .bind(&offering.description)
        .bind(offering.experience_level.as_str())
        .bind(offering.teaching_method.as_str())
        .bind(offering.location.as_deref())
        .bind(offering.is_active)
        .bind(offering.created_at)
        .bind(offering.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to save offering")?;
        Ok(())
    }

    async fn find_offering(&self, id: Uuid) -> MarketResult<Option<SkillOffering>> {
        let row = sqlx::query(&format!(
            "SELECT {OFFERING_COLUMNS} FROM skill_offerings WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load offering")?;
        Ok(row.as_ref().map(offering_from_row).transpose()?)
    }

    async fn delete_offering(&self, id: Uuid) -> MarketResult<()> {
        delete_listing(&self.pool, "skill_offerings", "offering", id).await
    }

    async fn list_offerings(&self, filter: &OfferingFilter) -> MarketResult<Vec<SkillOffering>> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {OFFERING_COLUMNS} FROM skill_offerings WHERE TRUE"
        ));
        if !filter.include_inactive {
            query.push(" AND is_active");
        }
        if let Some(owner_id) = filter.owner_id {
            query.push(" AND owner_id = ").push_bind(owner_id);
        }
        if let Some(excluded) = filter.exclude_owner {
            query.push(" AND owner_id <> ").push_bind(excluded);
        }
        if !filter.categories.is_empty() {
            query
                .push(" AND category_id = ANY(")
                .push_bind(filter.categories.clone())
                .push(")");
        }
        if let Some(level) = filter.experience_level {
            query
                .push(" AND experience_level = ")
                .push_bind(level.as_str());
        }
        if let Some(method) = filter.teaching_method {
            query
                .push(" AND teaching_method = ")
                .push_bind(method.as_str());
        }
        if let Some(location) = filter.location.as_deref() {
            query
                .push(" AND location ILIKE ")
                .push_bind(like_pattern(location));
        }
        push_text_query(&mut query, filter.text_query.as_deref());
        query.push(" ORDER BY created_at DESC, id");

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to list offerings")?;
        Ok(rows
            .iter()
            .map(offering_from_row)
            .collect::<Result<Vec<_>>>()?)
    }

    async fn save_request(&self, request: &SkillRequest) -> MarketResult<()> {
        sqlx::query(
            r#"
            INSERT INTO skill_requests (
                id, owner_id, category_id, title, description, current_level,
                desired_level, preferred_method, availability, is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                category_id = EXCLUDED.category_id,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                current_level = EXCLUDED.current_level,
                desired_level = EXCLUDED.desired_level,
                preferred_method = EXCLUDED.preferred_method,
                availability = EXCLUDED.availability,
                is_active = EXCLUDED.is_active,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(request.id)
        .bind(request.owner_id)
        .bind(request.category_id)
        .bind(&request.title)
        .bind(&request.description)
        .bind(request.current_level.as_str())
        .bind(request.desired_level.as_str())
        .bind(request.preferred_method.as_str())
        .bind(request.availability.as_deref())
        .bind(request.is_active)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to save request")?;
        Ok(())
    }

    async fn find_request(&self, id: Uuid) -> MarketResult<Option<SkillRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM skill_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load request")?;
        Ok(row.as_ref().map(request_from_row).transpose()?)
    }

    async fn delete_request(&self, id: Uuid) -> MarketResult<()> {
        delete_listing(&self.pool, "skill_requests", "request", id).await
    }

    async fn list_requests(&self, filter: &RequestFilter) -> MarketResult<Vec<SkillRequest>> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {REQUEST_COLUMNS} FROM skill_requests WHERE TRUE"
        ));
        if !filter.include_inactive {
            query.push(" AND is_active");
        }
        if let Some(owner_id) = filter.owner_id {
            query.push(" AND owner_id = ").push_bind(owner_id);
        }
        if let Some(excluded) = filter.exclude_owner {
            query.push(" AND owner_id <> ").push_bind(excluded);
        }
        if !filter.categories.is_empty() {
            query
                .push(" AND category_id = ANY(")
                .push_bind(filter.categories.clone())
                .push(")");
        }
        push_text_query(&mut query, filter.text_query.as_deref());
        query.push(" ORDER BY created_at DESC, id");

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to list requests")?;
        Ok(rows
            .iter()
            .map(request_from_row)
            .collect::<Result<Vec<_>>>()?)
    }

    async fn open_account(
        &self,
        user_id: UserId,
        opening_balance: i64,
    ) -> MarketResult<CreditAccount> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("failed to open transaction")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO user_credits (user_id, balance, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(opening_balance)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to open credit account")?;

        if inserted.rows_affected() == 1 {
            sqlx::query(
                r#"
                INSERT INTO credit_transactions (
                    id, user_id, amount, description, related_id, balance_after, created_at
                )
                VALUES ($1, $2, $3, 'Welcome credits', NULL, $3, $4)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(opening_balance)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("failed to record opening balance")?;
            debug!(%user_id, opening_balance, "credit account opened");
        }

        let account = load_account(&mut tx, user_id, false)
            .await?
            .ok_or_else(|| anyhow!("credit account {user_id} missing after open"))?;
        tx.commit().await.context("failed to commit credit account")?;
        Ok(account)
    }

    async fn find_account(&self, user_id: UserId) -> MarketResult<Option<CreditAccount>> {
        let mut connection = self
            .pool
            .acquire()
            .await
            .context("failed to acquire connection")?;
        load_account(&mut connection, user_id, false).await
    }

    async fn transactions(&self, user_id: UserId) -> MarketResult<Vec<CreditTransaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
             WHERE user_id = $1 ORDER BY sequence"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load credit transactions")?;
        Ok(rows
            .iter()
            .map(transaction_from_row)
            .collect::<Result<Vec<_>>>()?)
    }

    async fn find_swap(&self, id: Uuid) -> MarketResult<Option<Swap>> {
        let row = sqlx::query(&format!("SELECT {SWAP_COLUMNS} FROM swaps WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load swap")?;
        Ok(row.as_ref().map(swap_from_row).transpose()?)
    }

    async fn swaps_for_user(&self, user_id: UserId) -> MarketResult<Vec<Swap>> {
        let rows = sqlx::query(&format!(
            "SELECT {SWAP_COLUMNS} FROM swaps WHERE teacher_id = $1 OR learner_id = $1 \
             ORDER BY created_at DESC, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list swaps")?;
        Ok(rows.iter().map(swap_from_row).collect::<Result<Vec<_>>>()?)
    }

    async fn find_exchange(&self, id: Uuid) -> MarketResult<Option<Exchange>> {
        let row = sqlx::query(&format!(
            "SELECT {EXCHANGE_COLUMNS} FROM exchanges WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load exchange")?;
        Ok(row.as_ref().map(exchange_from_row).transpose()?)
    }

    async fn exchange_for_swap(&self, swap_id: Uuid) -> MarketResult<Option<Exchange>> {
        let row = sqlx::query(&format!(
            "SELECT {EXCHANGE_COLUMNS} FROM exchanges WHERE swap1_id = $1 OR swap2_id = $1 LIMIT 1"
        ))
        .bind(swap_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load exchange for swap")?;
        Ok(row.as_ref().map(exchange_from_row).transpose()?)
    }

    async fn exchanges_for_user(&self, user_id: UserId) -> MarketResult<Vec<Exchange>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXCHANGE_COLUMNS} FROM exchanges WHERE user1_id = $1 OR user2_id = $1 \
             ORDER BY created_at DESC, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list exchanges")?;
        Ok(rows
            .iter()
            .map(exchange_from_row)
            .collect::<Result<Vec<_>>>()?)
    }

    async fn commit(&self, changeset: Changeset) -> MarketResult<CommitReceipt> {
        let Changeset {
            new_swaps,
            swap_updates,
            new_exchange,
            exchange_update,
            mut postings,
            notifications,
            messages,
        } = changeset;
        let now = Utc::now();
        let mut receipt = CommitReceipt::default();
        let mut tx = self.pool.begin().await.context("failed to open transaction")?;

        for swap in &new_swaps {
            insert_swap(&mut tx, swap).await?;
        }
        for update in &swap_updates {
            update_swap(&mut tx, update).await?;
        }
        if let Some(exchange) = &new_exchange {
            insert_exchange(&mut tx, exchange).await?;
        }
        if let Some(update) = &exchange_update {
            update_exchange(&mut tx, update).await?;
        }

        // Lock accounts in a stable order; the sort keeps each user's postings in sequence.
        postings.sort_by_key(|posting| posting.user_id);
        for posting in &postings {
            let transaction = apply_posting(&mut tx, posting, now).await?;
            receipt.transactions.push(transaction);
        }

        for notification in &notifications {
            insert_notification(&mut tx, notification).await?;
        }
        for draft in messages {
            receipt.messages.push(insert_message(&mut tx, draft).await?);
        }

        tx.commit().await.context("failed to commit changeset")?;
        Ok(receipt)
    }

    async fn notifications_for(
        &self,
        user_id: UserId,
        unread_only: bool,
    ) -> MarketResult<Vec<Notification>> {
        let rows = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE user_id = $1 AND (NOT $2 OR NOT is_read) \
             ORDER BY created_at DESC, id"
        ))
        .bind(user_id)
        .bind(unread_only)
        .fetch_all(&self.pool)
        .await
        .context("failed to list notifications")?;
        Ok(rows
            .iter()
            .map(notification_from_row)
            .collect::<Result<Vec<_>>>()?)
    }

    async fn mark_notification_read(&self, user_id: UserId, id: Uuid) -> MarketResult<()> {
        let updated =
            sqlx::query("UPDATE notifications SET is_read = TRUE WHERE id = $1 AND user_id = $2")
                .bind(id)
                .bind(user_id)
                .execute(&self.pool)
                .await
                .context("failed to mark notification read")?;
        if updated.rows_affected() == 0 {
            return Err(MarketError::not_found("notification", id));
        }
        Ok(())
    }

    async fn mark_all_notifications_read(&self, user_id: UserId) -> MarketResult<u64> {
        let updated = sqlx::query(
            "UPDATE notifications SET is_read = TRUE WHERE user_id = $1 AND NOT is_read",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to mark notifications read")?;
        Ok(updated.rows_affected())
    }

    async fn messages(&self, exchange_id: Uuid) -> MarketResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, exchange_id, sender_id, content, sequence, created_at
            FROM messages
            WHERE exchange_id = $1
            ORDER BY sequence
            "#,
        )
        .bind(exchange_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list messages")?;
        Ok(rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?)
    }
}

fn active_statuses() -> Vec<String> {
    Status::ACTIVE
        .iter()
        .map(|status| status.as_str().to_string())
        .collect()
}

/// Case-insensitive substring pattern with LIKE metacharacters escaped.
fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn push_text_query(query: &mut QueryBuilder<'_, Postgres>, text_query: Option<&str>) {
    let Some(text) = text_query.filter(|text| !text.trim().is_empty()) else {
        return;
    };
    let pattern = like_pattern(text);
    query
        .push(" AND (title ILIKE ")
        .push_bind(pattern.clone())
        .push(" OR description ILIKE ")
        .push_bind(pattern)
        .push(")");
}

async fn delete_listing(
    pool: &PgPool,
    table: &'static str,
    entity: &'static str,
    id: Uuid,
) -> MarketResult<()> {
    let mut tx = pool.begin().await.context("failed to open transaction")?;

    let locked = sqlx::query(&format!("SELECT id FROM {table} WHERE id = $1 FOR UPDATE"))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("failed to lock {entity}"))?;
    if locked.is_none() {
        return Err(MarketError::not_found(entity, id));
    }

    let referenced: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM swaps
            WHERE (offering_id = $1 OR request_id = $1) AND status = ANY($2)
        )
        "#,
    )
    .bind(id)
    .bind(active_statuses())
    .fetch_one(&mut *tx)
    .await
    .with_context(|| format!("failed to check swaps referencing {entity}"))?;
    if referenced {
        return Err(MarketError::HasActiveExchanges { entity, id });
    }

    sqlx::query(&format!("DELETE FROM {table} WHERE id = $1"))
        .bind(id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to delete {entity}"))?;
    tx.commit()
        .await
        .with_context(|| format!("failed to commit {entity} deletion"))?;
    Ok(())
}

async fn load_account(
    connection: &mut PgConnection,
    user_id: UserId,
    for_update: bool,
) -> MarketResult<Option<CreditAccount>> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let row = sqlx::query(&format!(
        "SELECT user_id, balance, updated_at FROM user_credits WHERE user_id = $1{lock}"
    ))
    .bind(user_id)
    .fetch_optional(&mut *connection)
    .await
    .context("failed to load credit account")?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(CreditAccount {
        user_id: row.try_get("user_id").context("user_id")?,
        balance: row.try_get("balance").context("balance")?,
        updated_at: row.try_get("updated_at").context("updated_at")?,
    }))
}

/// A conflict on the proposal-key indexes surfaces as `DuplicateProposal`
/// naming the swap that holds the key.
async fn insert_swap(connection: &mut PgConnection, swap: &Swap) -> MarketResult<()> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO swaps (
            id, teacher_id, learner_id, offering_id, request_id, status, scheduled_times,
            teacher_rating, learner_rating, teacher_feedback, learner_feedback,
            is_credit_based, created_at, updated_at, completed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(swap.id)
    .bind(swap.teacher_id)
    .bind(swap.learner_id)
    .bind(swap.offering_id)
    .bind(swap.request_id)
    .bind(swap.status.as_str())
    .bind(&swap.scheduled_times)
    .bind(swap.teacher_rating.map(i16::from))
    .bind(swap.learner_rating.map(i16::from))
    .bind(swap.teacher_feedback.as_deref())
    .bind(swap.learner_feedback.as_deref())
    .bind(swap.is_credit_based)
    .bind(swap.created_at)
    .bind(swap.updated_at)
    .bind(swap.completed_at)
    .execute(&mut *connection)
    .await
    .context("failed to insert swap")?;

    if inserted.rows_affected() == 1 {
        return Ok(());
    }

    let existing: Option<Uuid> = match swap.proposal_key() {
        Some(ProposalKey::ForRequest {
            offering_id,
            request_id,
        }) => sqlx::query_scalar(
            "SELECT id FROM swaps WHERE offering_id = $1 AND request_id = $2 AND status = ANY($3)",
        )
        .bind(offering_id)
        .bind(request_id)
        .bind(active_statuses())
        .fetch_optional(&mut *connection)
        .await
        .context("failed to look up conflicting swap")?,
        Some(ProposalKey::Direct {
            offering_id,
            learner_id,
        }) => sqlx::query_scalar(
            "SELECT id FROM swaps WHERE offering_id = $1 AND request_id IS NULL \
             AND learner_id = $2 AND status = ANY($3)",
        )
        .bind(offering_id)
        .bind(learner_id)
        .bind(active_statuses())
        .fetch_optional(&mut *connection)
        .await
        .context("failed to look up conflicting swap")?,
        None => None,
    };

    match existing {
        Some(existing_swap_id) => {
            warn!(swap_id = %swap.id, %existing_swap_id, "duplicate swap proposal");
            Err(MarketError::DuplicateProposal { existing_swap_id })
        }
        None => Err(anyhow!("swap {} already exists", swap.id).into()),
    }
}

async fn update_swap(
    connection: &mut PgConnection,
    update: &GuardedUpdate<Swap>,
) -> MarketResult<()> {
    let swap = &update.row;
    let updated = sqlx::query(
        r#"
        UPDATE swaps
        SET status = $3, scheduled_times = $4, teacher_rating = $5, learner_rating = $6,
            teacher_feedback = $7, learner_feedback = $8, updated_at = $9, completed_at = $10
        WHERE id = $1 AND status = $2 AND ($11::timestamptz IS NULL OR updated_at = $11)
        "#,
    )
    .bind(swap.id)
    .bind(update.expected.as_str())
    .bind(swap.status.as_str())
    .bind(&swap.scheduled_times)
    .bind(swap.teacher_rating.map(i16::from))
    .bind(swap.learner_rating.map(i16::from))
    .bind(swap.teacher_feedback.as_deref())
    .bind(swap.learner_feedback.as_deref())
    .bind(swap.updated_at)
    .bind(swap.completed_at)
    .bind(update.revision)
    .execute(&mut *connection)
    .await
    .context("failed to update swap")?;

    if updated.rows_affected() == 0 {
        return Err(stale_row(
            connection,
            "swaps",
            "swap",
            swap.id,
            update.expected,
            swap.status,
        )
        .await);
    }
    Ok(())
}

async fn insert_exchange(connection: &mut PgConnection, exchange: &Exchange) -> MarketResult<()> {
    sqlx::query(
        r#"
        INSERT INTO exchanges (
            id, user1_id, user2_id, swap1_id, swap2_id, status, created_by,
            is_credit_based, credit_amount, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(exchange.id)
    .bind(exchange.user1_id)
    .bind(exchange.user2_id)
    .bind(exchange.swap1_id)
    .bind(exchange.swap2_id)
    .bind(exchange.status.as_str())
    .bind(exchange.created_by)
    .bind(exchange.is_credit_based)
    .bind(exchange.credit_amount)
    .bind(exchange.created_at)
    .bind(exchange.updated_at)
    .execute(&mut *connection)
    .await
    .context("failed to insert exchange")?;
    Ok(())
}

async fn update_exchange(
    connection: &mut PgConnection,
    update: &GuardedUpdate<Exchange>,
) -> MarketResult<()> {
    let exchange = &update.row;
    let updated = sqlx::query(
        "UPDATE exchanges SET status = $3, updated_at = $4 WHERE id = $1 AND status = $2",
    )
    .bind(exchange.id)
    .bind(update.expected.as_str())
    .bind(exchange.status.as_str())
    .bind(exchange.updated_at)
    .execute(&mut *connection)
    .await
    .context("failed to update exchange")?;

    if updated.rows_affected() == 0 {
        return Err(stale_row(
            connection,
            "exchanges",
            "exchange",
            exchange.id,
            update.expected,
            exchange.status,
        )
        .await);
    }
    Ok(())
}

/// Explains why a guarded update matched no row. A row still in the
/// expected status was rewritten since it was read.
async fn stale_row(
    connection: &mut PgConnection,
    table: &'static str,
    entity: &'static str,
    id: Uuid,
    expected: Status,
    requested: Status,
) -> MarketError {
    let current: Result<Option<String>> =
        sqlx::query_scalar(&format!("SELECT status FROM {table} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *connection)
            .await
            .with_context(|| format!("failed to reload {entity}"));
    match current {
        Ok(Some(status)) => match status.parse::<Status>() {
            Ok(from) if from == expected => MarketError::Conflict { entity, id },
            Ok(from) => MarketError::InvalidTransition {
                from,
                to: requested,
            },
            Err(err) => err,
        },
        Ok(None) => MarketError::not_found(entity, id),
        Err(err) => err.into(),
    }
}

async fn apply_posting(
    connection: &mut PgConnection,
    posting: &LedgerPosting,
    now: DateTime<Utc>,
) -> MarketResult<CreditTransaction> {
    let account = load_account(connection, posting.user_id, true)
        .await?
        .ok_or_else(|| MarketError::not_found("credit account", posting.user_id))?;
    let balance_after = posting.apply_to(account.balance)?;

    sqlx::query("UPDATE user_credits SET balance = $2, updated_at = $3 WHERE user_id = $1")
        .bind(posting.user_id)
        .bind(balance_after)
        .bind(now)
        .execute(&mut *connection)
        .await
        .context("failed to update credit balance")?;

    let id = Uuid::new_v4();
    let sequence: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO credit_transactions (
            id, user_id, amount, description, related_id, balance_after, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING sequence
        "#,
    )
    .bind(id)
    .bind(posting.user_id)
    .bind(posting.amount)
    .bind(&posting.description)
    .bind(posting.related_id)
    .bind(balance_after)
    .bind(now)
    .fetch_one(&mut *connection)
    .await
    .context("failed to record credit transaction")?;

    Ok(CreditTransaction {
        id,
        user_id: posting.user_id,
        amount: posting.amount,
        description: posting.description.clone(),
        related_id: posting.related_id,
        balance_after,
        sequence,
        created_at: now,
    })
}

async fn insert_notification(
    connection: &mut PgConnection,
    notification: &Notification,
) -> MarketResult<()> {
    sqlx::query(
        r#"
        INSERT INTO notifications (
            id, user_id, type, title, message, related_id, related_type, is_read, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(notification.id)
    .bind(notification.user_id)
    .bind(notification.kind.as_str())
    .bind(&notification.title)
    .bind(&notification.message)
    .bind(notification.related_id)
    .bind(notification.related_type.map(|related| related.as_str()))
    .bind(notification.is_read)
    .bind(notification.created_at)
    .execute(&mut *connection)
    .await
    .context("failed to insert notification")?;
    Ok(())
}

async fn insert_message(
    connection: &mut PgConnection,
    draft: MessageDraft,
) -> MarketResult<Message> {
    let sequence: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO messages (id, exchange_id, sender_id, content, created_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING sequence
        "#,
    )
    .bind(draft.id)
    .bind(draft.exchange_id)
    .bind(draft.sender_id)
    .bind(&draft.content)
    .bind(draft.created_at)
    .fetch_one(&mut *connection)
    .await
    .context("failed to insert message")?;

    Ok(Message {
        id: draft.id,
        exchange_id: draft.exchange_id,
        sender_id: draft.sender_id,
        content: draft.content,
        sequence,
        created_at: draft.created_at,
    })
}

fn text_column<T>(row: &PgRow, column: &str) -> Result<T>
where
    T: FromStr<Err = MarketError>,
{
    let raw: String = row
        .try_get(column)
        .with_context(|| format!("missing column {column}"))?;
    raw.parse()
        .map_err(|err| anyhow!("column {column} holds {raw:?}: {err}"))
}

fn optional_text_column<T>(row: &PgRow, column: &str) -> Result<Option<T>>
where
    T: FromStr<Err = MarketError>,
{
    let raw: Option<String> = row
        .try_get(column)
        .with_context(|| format!("missing column {column}"))?;
    raw.map(|value| {
        value
            .parse()
            .map_err(|err| anyhow!("column {column} holds {value:?}: {err}"))
    })
    .transpose()
}

fn rating_column(row: &PgRow, column: &str) -> Result<Option<u8>> {
    let raw: Option<i16> = row
        .try_get(column)
        .with_context(|| format!("missing column {column}"))?;
    raw.map(|value| {
        u8::try_from(value).with_context(|| format!("{column} out of range: {value}"))
    })
    .transpose()
}

fn category_from_row(row: &PgRow) -> Result<SkillCategory> {
    Ok(SkillCategory {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
    })
}

fn offering_from_row(row: &PgRow) -> Result<SkillOffering> {
    Ok(SkillOffering {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        category_id: row.try_get("category_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        experience_level: text_column(row, "experience_level")?,
        teaching_method: text_column(row, "teaching_method")?,
        location: row.try_get("location")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn request_from_row(row: &PgRow) -> Result<SkillRequest> {
    Ok(SkillRequest {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        category_id: row.try_get("category_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        current_level: text_column(row, "current_level")?,
        desired_level: text_column(row, "desired_level")?,
        preferred_method: text_column(row, "preferred_method")?,
        availability: row.try_get("availability")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<CreditTransaction> {
    Ok(CreditTransaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        description: row.try_get("description")?,
        related_id: row.try_get("related_id")?,
        balance_after: row.try_get("balance_after")?,
        sequence: row.try_get("sequence")?,
        created_at: row.try_get("created_at")?,
    })
}

fn swap_from_row(row: &PgRow) -> Result<Swap> {
    Ok(Swap {
        id: row.try_get("id")?,
        teacher_id: row.try_get("teacher_id")?,
        learner_id: row.try_get("learner_id")?,
        offering_id: row.try_get("offering_id")?,
        request_id: row.try_get("request_id")?,
        status: text_column(row, "status")?,
        scheduled_times: row.try_get("scheduled_times")?,
        teacher_rating: rating_column(row, "teacher_rating")?,
        learner_rating: rating_column(row, "learner_rating")?,
        teacher_feedback: row.try_get("teacher_feedback")?,
        learner_feedback: row.try_get("learner_feedback")?,
        is_credit_based: row.try_get("is_credit_based")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn exchange_from_row(row: &PgRow) -> Result<Exchange> {
    Ok(Exchange {
        id: row.try_get("id")?,
        user1_id: row.try_get("user1_id")?,
        user2_id: row.try_get("user2_id")?,
        swap1_id: row.try_get("swap1_id")?,
        swap2_id: row.try_get("swap2_id")?,
        status: text_column(row, "status")?,
        created_by: row.try_get("created_by")?,
        is_credit_based: row.try_get("is_credit_based")?,
        credit_amount: row.try_get("credit_amount")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn notification_from_row(row: &PgRow) -> Result<Notification> {
    Ok(Notification {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: text_column(row, "type")?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        related_id: row.try_get("related_id")?,
        related_type: optional_text_column(row, "related_type")?,
        is_read: row.try_get("is_read")?,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        exchange_id: row.try_get("exchange_id")?,
        sender_id: row.try_get("sender_id")?,
        content: row.try_get("content")?,
        sequence: row.try_get("sequence")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern(" 50%_off "), "%50\\%\\_off%");
        assert_eq!(like_pattern("a\\b"), "%a\\\\b%");
    }

    #[test]
    fn active_statuses_match_storage_text() {
        assert_eq!(
            active_statuses(),
            vec!["pending".to_string(), "accepted".to_string(), "in_progress".to_string()]
        );
    }
}
