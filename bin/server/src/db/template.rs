//! Postgres-backed message template storage.

use async_trait::async_trait;
use cadence_core::TemplateId;
use cadence_workflow::messaging::{
    MessageChannel, MessageTemplate, TemplateStore, TemplateStoreError,
};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

/// Row type for template queries.
#[derive(FromRow)]
struct TemplateRow {
    id: String,
    name: String,
    channel: String,
    subject: Option<String>,
    body: String,
}

impl TemplateRow {
    fn try_into_record(self) -> Result<MessageTemplate, TemplateStoreError> {
        let id = TemplateId::from_str(&self.id).map_err(|e| {
            TemplateStoreError::new(format!("invalid template id '{}': {}", self.id, e))
        })?;
        let channel = match self.channel.as_str() {
            "sms" => MessageChannel::Sms,
            "email" => MessageChannel::Email,
            other => {
                return Err(TemplateStoreError::new(format!(
                    "invalid channel '{}' on template '{}'",
                    other, self.id
                )));
            }
        };

        Ok(MessageTemplate {
            id,
            name: self.name,
            channel,
            subject: self.subject,
            body: self.body,
        })
    }
}

/// Repository for message template operations.
pub struct PgTemplateStore {
    pool: PgPool,
}

impl PgTemplateStore {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateStore for PgTemplateStore {
    async fn get(&self, id: &TemplateId) -> Result<Option<MessageTemplate>, TemplateStoreError> {
        let row: Option<TemplateRow> = sqlx::query_as(
            r#"
            SELECT id, name, channel, subject, body
            FROM message_templates
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TemplateStoreError::new(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(r.try_into_record()?)),
            None => Ok(None),
        }
    }
}
