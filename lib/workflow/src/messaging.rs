//! Outbound messaging: templates, the transport seam, and the
//! processors behind send_sms and send_email nodes.

use crate::condition::render_template;
use crate::node::NodeData;
use crate::processor::{NodeProcessor, ProcessError, ProcessorContext, ProcessorResult};
use async_trait::async_trait;
use cadence_core::{ContactId, MessageId, SenderIdentityId, TemplateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Outbound message channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageChannel {
    Sms,
    Email,
}

impl MessageChannel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reusable message template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: TemplateId,
    pub name: String,
    pub channel: MessageChannel,
    /// Subject line. Only meaningful for email templates.
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
}

/// A rendered message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub contact_id: ContactId,
    pub channel: MessageChannel,
    /// Destination phone number or email address.
    pub to: String,
    pub from_identity: Option<SenderIdentityId>,
    pub subject: Option<String>,
    pub body: String,
}

/// Receipt returned by the transport on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: MessageId,
    pub sent_at: DateTime<Utc>,
}

/// Errors from the message transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendError {
    message: String,
    retryable: bool,
}

impl SendError {
    /// A failure worth retrying: provider outages, rate limits.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure retrying cannot fix: rejected recipient, bad payload.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for SendError {}

/// Errors from template lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateStoreError {
    message: String,
}

impl TemplateStoreError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for TemplateStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "template store error: {}", self.message)
    }
}

impl std::error::Error for TemplateStoreError {}

/// Delivers rendered messages to the outside world.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<SentMessage, SendError>;
}

/// Looks up message templates.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get(&self, id: &TemplateId) -> Result<Option<MessageTemplate>, TemplateStoreError>;
}

/// Processor for send_sms and send_email nodes.
///
/// The two node types share configuration and behavior; the channel
/// decides which template kind is accepted and which contact field is
/// the destination.
pub struct SendMessageProcessor {
    channel: MessageChannel,
    templates: Arc<dyn TemplateStore>,
    sender: Arc<dyn MessageSender>,
}

impl SendMessageProcessor {
    /// Creates the processor behind send_sms nodes.
    #[must_use]
    pub fn sms(templates: Arc<dyn TemplateStore>, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            channel: MessageChannel::Sms,
            templates,
            sender,
        }
    }

    /// Creates the processor behind send_email nodes.
    #[must_use]
    pub fn email(templates: Arc<dyn TemplateStore>, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            channel: MessageChannel::Email,
            templates,
            sender,
        }
    }
}

#[async_trait]
impl NodeProcessor for SendMessageProcessor {
    async fn process(
        &self,
        node: &crate::node::Node,
        ctx: &ProcessorContext<'_>,
    ) -> Result<ProcessorResult, ProcessError> {
        let config = match (&node.data, self.channel) {
            (NodeData::SendSms(config), MessageChannel::Sms) => config,
            (NodeData::SendEmail(config), MessageChannel::Email) => config,
            _ => {
                return Err(ProcessError::Fatal {
                    message: format!("node '{}' is not a send_{} node", node.id, self.channel),
                });
            }
        };

        let template = self
            .templates
            .get(&config.template_id)
            .await
            .map_err(|e| ProcessError::Transient {
                message: e.to_string(),
            })?
            .ok_or_else(|| ProcessError::Fatal {
                message: format!("template '{}' not found", config.template_id),
            })?;
        if template.channel != self.channel {
            return Err(ProcessError::Fatal {
                message: format!(
                    "template '{}' targets {}, but node '{}' sends {}",
                    template.id, template.channel, node.id, self.channel
                ),
            });
        }

        let to = match self.channel {
            MessageChannel::Sms => ctx.contact.phone.clone(),
            MessageChannel::Email => ctx.contact.email.clone(),
        };
        let Some(to) = to.filter(|v| !v.is_empty()) else {
            return Err(ProcessError::Fatal {
                message: format!(
                    "contact '{}' has no {} destination",
                    ctx.contact.id, self.channel
                ),
            });
        };

        let body = render_template(&template.body, ctx.contact, &ctx.execution.data);
        let subject = template
            .subject
            .as_deref()
            .map(|s| render_template(s, ctx.contact, &ctx.execution.data));

        let sent = self
            .sender
            .send(OutboundMessage {
                contact_id: ctx.contact.id,
                channel: self.channel,
                to,
                from_identity: config.from_identity,
                subject,
                body,
            })
            .await
            .map_err(|e| {
                if e.is_retryable() {
                    ProcessError::Transient {
                        message: e.to_string(),
                    }
                } else {
                    ProcessError::Fatal {
                        message: e.to_string(),
                    }
                }
            })?;

        let mut data = ctx.execution.data.clone();
        data.record_sent_message(sent.message_id);

        let result = match ctx.workflow.graph.successor(&node.id) {
            Some(next) => ProcessorResult::advance(next.id.clone()),
            None => ProcessorResult::complete(),
        };
        Ok(result.with_data(data).with_output(json!({
            "message_id": sent.message_id,
            "channel": self.channel,
        })))
    }
}

/// In-memory template store.
#[derive(Debug, Default)]
pub struct MemoryTemplates {
    templates: Mutex<HashMap<TemplateId, MessageTemplate>>,
}

impl MemoryTemplates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a template, replacing any existing one with the same ID.
    pub fn insert(&self, template: MessageTemplate) {
        self.lock().insert(template.id, template);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TemplateId, MessageTemplate>> {
        self.templates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TemplateStore for MemoryTemplates {
    async fn get(&self, id: &TemplateId) -> Result<Option<MessageTemplate>, TemplateStoreError> {
        Ok(self.lock().get(id).cloned())
    }
}

/// Transport double that records every send attempt.
#[derive(Debug, Default)]
pub struct RecordingSender {
    failure: Option<SendError>,
    calls: Mutex<Vec<OutboundMessage>>,
}

impl RecordingSender {
    /// A transport where every send succeeds.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::default()
    }

    /// A transport where every send fails.
    #[must_use]
    pub fn failing(retryable: bool) -> Self {
        let failure = if retryable {
            SendError::retryable("transport unavailable")
        } else {
            SendError::permanent("recipient rejected")
        };
        Self {
            failure: Some(failure),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every message handed to the transport, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<OutboundMessage> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OutboundMessage>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, message: OutboundMessage) -> Result<SentMessage, SendError> {
        self.lock().push(message);
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(SentMessage {
                message_id: MessageId::new(),
                sent_at: Utc::now(),
            }),
        }
    }
}
