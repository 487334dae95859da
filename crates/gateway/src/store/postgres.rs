use anyhow::{anyhow, Context};
use carechat_common::types::{
    ChatMessage, Conversation, ConversationId, MessageId, Role, UserId, UserSummary,
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{ensure_valid_pair, StoreError};

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    display_name: String,
    role: String,
}

impl TryFrom<UserRow> for UserSummary {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let role = Role::from_db_value(&row.role)
            .ok_or_else(|| anyhow!("user {} has unknown role '{}'", row.id, row.role))?;
        Ok(Self { id: row.id, username: row.username, display_name: row.display_name, role })
    }
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: i64,
    patient_id: i64,
    provider_id: i64,
    created_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Self {
            id: row.id,
            patient_id: row.patient_id,
            provider_id: row.provider_id,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    conversation_id: i64,
    content: String,
    created_at: DateTime<Utc>,
    is_read: bool,
    sender_id: i64,
    sender_username: String,
    sender_display_name: String,
    sender_role: String,
}

impl TryFrom<MessageRow> for ChatMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let sender = UserSummary::try_from(UserRow {
            id: row.sender_id,
            username: row.sender_username,
            display_name: row.sender_display_name,
            role: row.sender_role,
        })?;

        Ok(Self {
            id: row.id,
            conversation: row.conversation_id,
            sender,
            content: row.content,
            timestamp: row.created_at,
            is_read: row.is_read,
        })
    }
}

pub(super) async fn user_pg(pool: &PgPool, user_id: UserId) -> Result<Option<UserSummary>, StoreError> {
    let row = sqlx::query_as::<_, UserRow>(
        r#"
        SELECT id, username, display_name, role
        FROM users
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("failed to load user")?;

    row.map(UserSummary::try_from).transpose()
}

pub(super) async fn conversation_pg(
    pool: &PgPool,
    conversation_id: ConversationId,
) -> Result<Option<Conversation>, StoreError> {
    let row = sqlx::query_as::<_, ConversationRow>(
        r#"
        SELECT id, patient_id, provider_id, created_at
        FROM conversations
        WHERE id = $1
        "#,
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await
    .context("failed to load conversation")?;

    Ok(row.map(Conversation::from))
}

pub(super) async fn get_or_create_conversation_pg(
    pool: &PgPool,
    patient_id: UserId,
    provider_id: UserId,
) -> Result<Conversation, StoreError> {
    let patient = user_pg(pool, patient_id).await?.ok_or(StoreError::UserNotFound(patient_id))?;
    let provider =
        user_pg(pool, provider_id).await?.ok_or(StoreError::UserNotFound(provider_id))?;
    ensure_valid_pair(&patient, &provider)?;

    // The no-op update makes RETURNING yield the existing row on conflict.
    let row = sqlx::query_as::<_, ConversationRow>(
        r#"
        INSERT INTO conversations (patient_id, provider_id)
        VALUES ($1, $2)
        ON CONFLICT (patient_id, provider_id)
        DO UPDATE SET patient_id = EXCLUDED.patient_id
        RETURNING id, patient_id, provider_id, created_at
        "#,
    )
    .bind(patient_id)
    .bind(provider_id)
    .fetch_one(pool)
    .await
    .context("failed to get or create conversation")?;

    Ok(row.into())
}

pub(super) async fn appointment_counterparts_pg(
    pool: &PgPool,
    user_id: UserId,
    role: Role,
) -> Result<Vec<UserId>, StoreError> {
    let query = match role {
        Role::Patient => {
            r#"
            SELECT DISTINCT provider_id
            FROM appointments
            WHERE patient_id = $1
            ORDER BY provider_id
            "#
        }
        Role::Doctor | Role::Counselor => {
            r#"
            SELECT DISTINCT patient_id
            FROM appointments
            WHERE provider_id = $1
            ORDER BY patient_id
            "#
        }
        Role::Admin => return Ok(Vec::new()),
    };

    let ids = sqlx::query_scalar::<_, i64>(query)
        .bind(user_id)
        .fetch_all(pool)
        .await
        .context("failed to list appointment counterparts")?;

    Ok(ids)
}

pub(super) async fn conversations_for_pg(
    pool: &PgPool,
    user_id: UserId,
) -> Result<Vec<Conversation>, StoreError> {
    let rows = sqlx::query_as::<_, ConversationRow>(
        r#"
        SELECT id, patient_id, provider_id, created_at
        FROM conversations
        WHERE patient_id = $1 OR provider_id = $1
        ORDER BY id
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list conversations for user")?;

    Ok(rows.into_iter().map(Conversation::from).collect())
}

pub(super) async fn last_message_pg(
    pool: &PgPool,
    conversation_id: ConversationId,
) -> Result<Option<ChatMessage>, StoreError> {
    let row = sqlx::query_as::<_, MessageRow>(
        r#"
        SELECT
            m.id,
            m.conversation_id,
            m.content,
            m.created_at,
            m.is_read,
            u.id AS sender_id,
            u.username AS sender_username,
            u.display_name AS sender_display_name,
            u.role AS sender_role
        FROM messages AS m
        INNER JOIN users AS u ON u.id = m.sender_id
        WHERE m.conversation_id = $1
        ORDER BY m.created_at DESC, m.id DESC
        LIMIT 1
        "#,
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await
    .context("failed to load last message")?;

    row.map(ChatMessage::try_from).transpose()
}

pub(super) async fn unread_count_pg(
    pool: &PgPool,
    conversation_id: ConversationId,
    reader_id: UserId,
) -> Result<i64, StoreError> {
    let count = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*)
        FROM messages
        WHERE conversation_id = $1
          AND sender_id <> $2
          AND is_read = FALSE
        "#,
    )
    .bind(conversation_id)
    .bind(reader_id)
    .fetch_one(pool)
    .await
    .context("failed to count unread messages")?;

    Ok(count)
}

pub(super) async fn append_pg(
    pool: &PgPool,
    conversation_id: ConversationId,
    sender_id: UserId,
    content: &str,
) -> Result<ChatMessage, StoreError> {
    append_in_tx(pool, conversation_id, sender_id, content, false).await
}

pub(super) async fn mark_read_and_append_pg(
    pool: &PgPool,
    conversation_id: ConversationId,
    sender_id: UserId,
    content: &str,
) -> Result<ChatMessage, StoreError> {
    append_in_tx(pool, conversation_id, sender_id, content, true).await
}

/// Any early return drops `tx`, which rolls back the read marks too.
async fn append_in_tx(
    pool: &PgPool,
    conversation_id: ConversationId,
    sender_id: UserId,
    content: &str,
    mark_read: bool,
) -> Result<ChatMessage, StoreError> {
    let mut tx = pool.begin().await.context("failed to begin append transaction")?;

    // Row lock serializes appends per conversation so timestamps stay strictly increasing.
    let conversation = sqlx::query_as::<_, ConversationRow>(
        r#"
        SELECT id, patient_id, provider_id, created_at
        FROM conversations
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(conversation_id)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to lock conversation")?
    .map(Conversation::from)
    .ok_or(StoreError::ConversationNotFound(conversation_id))?;

    if !conversation.has_participant(sender_id) {
        return Err(StoreError::NotParticipant { user_id: sender_id, conversation_id });
    }

    if mark_read {
        sqlx::query(
            r#"
            UPDATE messages
            SET is_read = TRUE
            WHERE conversation_id = $1
              AND sender_id <> $2
              AND is_read = FALSE
            "#,
        )
        .bind(conversation_id)
        .bind(sender_id)
        .execute(&mut *tx)
        .await
        .context("failed to mark messages read")?;
    }

    let row = sqlx::query_as::<_, MessageRow>(
        r#"
        WITH inserted AS (
            INSERT INTO messages (conversation_id, sender_id, content, created_at)
            VALUES (
                $1,
                $2,
                $3,
                GREATEST(
                    clock_timestamp(),
                    (
                        SELECT MAX(created_at) + INTERVAL '1 microsecond'
                        FROM messages
                        WHERE conversation_id = $1
                    )
                )
            )
            RETURNING id, conversation_id, sender_id, content, created_at, is_read
        )
        SELECT
            i.id,
            i.conversation_id,
            i.content,
            i.created_at,
            i.is_read,
            u.id AS sender_id,
            u.username AS sender_username,
            u.display_name AS sender_display_name,
            u.role AS sender_role
        FROM inserted AS i
        INNER JOIN users AS u ON u.id = i.sender_id
        "#,
    )
    .bind(conversation_id)
    .bind(sender_id)
    .bind(content)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert message")?;

    tx.commit().await.context("failed to commit append transaction")?;

    ChatMessage::try_from(row)
}

pub(super) async fn mark_read_except_pg(
    pool: &PgPool,
    conversation_id: ConversationId,
    reader_id: UserId,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE messages
        SET is_read = TRUE
        WHERE conversation_id = $1
          AND sender_id <> $2
          AND is_read = FALSE
        "#,
    )
    .bind(conversation_id)
    .bind(reader_id)
    .execute(pool)
    .await
    .context("failed to mark messages read")?;

    Ok(result.rows_affected())
}

pub(super) async fn message_pg(
    pool: &PgPool,
    message_id: MessageId,
) -> Result<Option<ChatMessage>, StoreError> {
    let row = sqlx::query_as::<_, MessageRow>(
        r#"
        SELECT
            m.id,
            m.conversation_id,
            m.content,
            m.created_at,
            m.is_read,
            u.id AS sender_id,
            u.username AS sender_username,
            u.display_name AS sender_display_name,
            u.role AS sender_role
        FROM messages AS m
        INNER JOIN users AS u ON u.id = m.sender_id
        WHERE m.id = $1
        "#,
    )
    .bind(message_id)
    .fetch_optional(pool)
    .await
    .context("failed to load message")?;

    row.map(ChatMessage::try_from).transpose()
}

pub(super) async fn delete_pg(pool: &PgPool, message_id: MessageId) -> Result<ConversationId, StoreError> {
    sqlx::query_scalar::<_, i64>(
        r#"
        DELETE FROM messages
        WHERE id = $1
        RETURNING conversation_id
        "#,
    )
    .bind(message_id)
    .fetch_optional(pool)
    .await
    .context("failed to delete message")?
    .ok_or(StoreError::MessageNotFound(message_id))
}

pub(super) async fn history_pg(
    pool: &PgPool,
    conversation_id: ConversationId,
) -> Result<Vec<ChatMessage>, StoreError> {
    let rows = sqlx::query_as::<_, MessageRow>(
        r#"
        SELECT
            m.id,
            m.conversation_id,
            m.content,
            m.created_at,
            m.is_read,
            u.id AS sender_id,
            u.username AS sender_username,
            u.display_name AS sender_display_name,
            u.role AS sender_role
        FROM messages AS m
        INNER JOIN users AS u ON u.id = m.sender_id
        WHERE m.conversation_id = $1
        ORDER BY m.created_at ASC, m.id ASC
        "#,
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await
    .context("failed to load conversation history")?;

    rows.into_iter().map(ChatMessage::try_from).collect()
}
