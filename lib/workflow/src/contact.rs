//! Contact records and the contact storage seam.

use async_trait::async_trait;
use cadence_core::ContactId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// A person that can be enrolled in workflows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    /// Pipeline status, e.g. `new`, `lead`, `customer`.
    #[serde(default = "default_status")]
    pub status: String,
    /// When set, message sends to this contact are refused.
    #[serde(default)]
    pub do_not_contact: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form fields set by imports and integrations.
    #[serde(default)]
    pub custom_fields: Map<String, JsonValue>,
}

fn default_status() -> String {
    "new".to_string()
}

impl Contact {
    /// Creates an empty contact with a fresh ID.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: ContactId::new(),
            first_name: None,
            last_name: None,
            email: None,
            phone: None,
            status: default_status(),
            do_not_contact: false,
            tags: Vec::new(),
            custom_fields: Map::new(),
        }
    }

    /// Looks up a core field by name, as used in condition paths and
    /// template placeholders.
    #[must_use]
    pub fn core_field(&self, name: &str) -> Option<JsonValue> {
        match name {
            "first_name" => self.first_name.clone().map(JsonValue::String),
            "last_name" => self.last_name.clone().map(JsonValue::String),
            "email" => self.email.clone().map(JsonValue::String),
            "phone" => self.phone.clone().map(JsonValue::String),
            "status" => Some(JsonValue::String(self.status.clone())),
            "do_not_contact" => Some(JsonValue::Bool(self.do_not_contact)),
            "tags" => Some(JsonValue::Array(
                self.tags.iter().cloned().map(JsonValue::String).collect(),
            )),
            _ => None,
        }
    }
}

impl Default for Contact {
    fn default() -> Self {
        Self::new()
    }
}

/// Error from the contact storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactStoreError {
    pub message: String,
}

impl ContactStoreError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ContactStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "contact store error: {}", self.message)
    }
}

impl std::error::Error for ContactStoreError {}

/// Storage seam for contact lookups and status updates.
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Fetches a contact by ID.
    async fn get(&self, id: &ContactId) -> Result<Option<Contact>, ContactStoreError>;

    /// Sets the contact's pipeline status.
    async fn update_status(&self, id: &ContactId, status: &str) -> Result<(), ContactStoreError>;
}

/// In-memory contact store for tests and demos.
pub struct MemoryContacts {
    contacts: std::sync::Mutex<std::collections::HashMap<ContactId, Contact>>,
}

impl MemoryContacts {
    #[must_use]
    pub fn new() -> Self {
        Self {
            contacts: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Adds a contact, replacing any existing record with the same ID.
    pub fn insert(&self, contact: Contact) {
        self.lock().insert(contact.id, contact);
    }

    /// Returns the current status of a contact, if present.
    #[must_use]
    pub fn status_of(&self, id: &ContactId) -> Option<String> {
        self.lock().get(id).map(|c| c.status.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, std::collections::HashMap<ContactId, Contact>> {
        self.contacts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for MemoryContacts {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContactStore for MemoryContacts {
    async fn get(&self, id: &ContactId) -> Result<Option<Contact>, ContactStoreError> {
        Ok(self.lock().get(id).cloned())
    }

    async fn update_status(&self, id: &ContactId, status: &str) -> Result<(), ContactStoreError> {
        match self.lock().get_mut(id) {
            Some(contact) => {
                contact.status = status.to_string();
                Ok(())
            }
            None => Err(ContactStoreError::new(format!("contact {id} not found"))),
        }
    }
}
