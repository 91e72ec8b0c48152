//! Postgres-backed contact storage.

use async_trait::async_trait;
use cadence_core::ContactId;
use cadence_workflow::contact::{Contact, ContactStore, ContactStoreError};
use serde_json::{Map, Value as JsonValue};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

/// Row type for contact queries.
#[derive(FromRow)]
struct ContactRow {
    id: String,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    status: String,
    do_not_contact: bool,
    tags: JsonValue,
    custom_fields: JsonValue,
}

impl ContactRow {
    fn try_into_record(self) -> Result<Contact, ContactStoreError> {
        let id = ContactId::from_str(&self.id).map_err(|e| {
            ContactStoreError::new(format!("invalid contact id '{}': {}", self.id, e))
        })?;
        let tags: Vec<String> = serde_json::from_value(self.tags).unwrap_or_default();
        let custom_fields: Map<String, JsonValue> =
            serde_json::from_value(self.custom_fields).unwrap_or_default();

        Ok(Contact {
            id,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            phone: self.phone,
            status: self.status,
            do_not_contact: self.do_not_contact,
            tags,
            custom_fields,
        })
    }
}

/// Repository for contact operations.
pub struct PgContactStore {
    pool: PgPool,
}

impl PgContactStore {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_error(error: sqlx::Error) -> ContactStoreError {
    ContactStoreError::new(error.to_string())
}

#[async_trait]
impl ContactStore for PgContactStore {
    async fn get(&self, id: &ContactId) -> Result<Option<Contact>, ContactStoreError> {
        let row: Option<ContactRow> = sqlx::query_as(
            r#"
            SELECT id, first_name, last_name, email, phone, status, do_not_contact,
                   tags, custom_fields
            FROM contacts
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(r) => Ok(Some(r.try_into_record()?)),
            None => Ok(None),
        }
    }

    async fn update_status(&self, id: &ContactId, status: &str) -> Result<(), ContactStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE contacts
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(status)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(ContactStoreError::new(format!("contact '{id}' not found")));
        }
        Ok(())
    }
}
