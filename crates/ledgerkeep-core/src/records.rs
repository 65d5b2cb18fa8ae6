//! Ledger record types.
//!
//! [`Interaction`] is chained per user partition and ordered by `created_at`.
//! [`AuditEvent`] is chained system-wide and ordered by `sequence_number`.
//! Both are immutable once appended; the chain fields live in
//! [`ChainLink`](crate::ledger::ChainLink) next to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::canonical::{CanonicalFields, FieldValue};
use crate::ledger::ChainRecord;
use crate::partition::{IdentityFields, PartitionKey};

// ============================================================================
// Interactions
// ============================================================================

/// A retrieved chunk that informed a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkReference {
    pub chunk_id: String,
    pub document_id: Uuid,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    pub text_snippet: String,
    pub relevance_score: f64,
}

impl ChunkReference {
    /// Same shape as the serde form, built without a fallible serializer.
    fn canonical_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("chunk_id".into(), self.chunk_id.as_str().into());
        map.insert("document_id".into(), self.document_id.to_string().into());
        map.insert("filename".into(), self.filename.as_str().into());
        if let Some(page) = self.page_number {
            map.insert("page_number".into(), page.into());
        }
        map.insert("text_snippet".into(), self.text_snippet.as_str().into());
        map.insert("relevance_score".into(), self.relevance_score.into());
        Value::Object(map)
    }
}

/// Link from a span of the response back to its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: Uuid,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    pub quote: String,
    /// Character offset in the response where the citation applies.
    pub position_in_response: usize,
}

/// Write-once record of one question/answer exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: Uuid,
    pub space_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,

    pub query: String,
    pub query_language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_intent: Option<String>,

    pub response: String,
    pub response_language: String,

    #[serde(default)]
    pub chunks_used: Vec<ChunkReference>,
    #[serde(default)]
    pub citations: Vec<Citation>,

    pub model_name: String,
    pub model_version: String,
    pub temperature: f64,
    pub max_tokens: u32,

    #[serde(with = "crate::time::micros")]
    pub created_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub token_count_input: u64,
    pub token_count_output: u64,

    #[serde(default)]
    pub safety_flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Interaction {
    /// New interaction stamped with a fresh id and the current time.
    pub fn new(
        space_id: Uuid,
        tenant_id: Uuid,
        user_id: Uuid,
        query: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            space_id,
            tenant_id,
            user_id,
            query: query.into(),
            query_language: "en".to_string(),
            query_intent: None,
            response: response.into(),
            response_language: "en".to_string(),
            chunks_used: Vec::new(),
            citations: Vec::new(),
            model_name: String::new(),
            model_version: String::new(),
            temperature: 0.7,
            max_tokens: 1000,
            created_at: crate::time::now(),
            latency_ms: 0,
            token_count_input: 0,
            token_count_output: 0,
            safety_flags: Vec::new(),
            quality_score: None,
            metadata: Map::new(),
        }
    }

    pub fn with_model(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.model_name = name.into();
        self.model_version = version.into();
        self
    }

    /// The partition this interaction belongs to.
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::composite(self.space_id, self.tenant_id, self.user_id)
    }

    pub fn identity(&self) -> IdentityFields {
        IdentityFields::from_ids(self.space_id, self.tenant_id, self.user_id)
    }
}

impl ChainRecord for Interaction {
    const ORDER_FIELD: &'static str = "created_at";

    fn storage_id(&self) -> String {
        self.id.to_string()
    }

    fn position_label(&self) -> String {
        format!("interaction {}", self.id)
    }

    fn ordering_value(&self) -> FieldValue {
        self.created_at.into()
    }

    fn canonical_fields(&self, version: u32) -> Option<CanonicalFields> {
        match version {
            1 => Some(
                CanonicalFields::new()
                    .with("id", self.id)
                    .with("space_id", self.space_id)
                    .with("tenant_id", self.tenant_id)
                    .with("user_id", self.user_id)
                    .with("query", self.query.as_str())
                    .with("response", self.response.as_str())
                    .with("model_name", self.model_name.as_str())
                    .with("model_version", self.model_version.as_str())
                    .with(
                        "chunks_used",
                        Value::Array(
                            self.chunks_used
                                .iter()
                                .map(ChunkReference::canonical_value)
                                .collect(),
                        ),
                    ),
            ),
            _ => None,
        }
    }
}

// ============================================================================
// Audit events
// ============================================================================

/// System-level audit event, chained in global sequence order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Assigned by the audit ledger at append time; 0 until then.
    #[serde(default)]
    pub sequence_number: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,

    /// e.g. `document.uploaded`, `query.executed`.
    pub event_type: String,
    /// e.g. `data`, `security`, `compliance`.
    pub event_category: String,
    #[serde(default)]
    pub event_data: Value,

    #[serde(with = "crate::time::micros")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: impl Into<String>,
        event_category: impl Into<String>,
        event_data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence_number: 0,
            space_id: None,
            tenant_id: None,
            user_id: None,
            event_type: event_type.into(),
            event_category: event_category.into(),
            event_data,
            timestamp: crate::time::now(),
            source_ip: None,
            user_agent: None,
        }
    }

    /// Attach the scope that triggered the event.
    pub fn with_scope(
        mut self,
        space_id: Option<Uuid>,
        tenant_id: Option<Uuid>,
        user_id: Option<Uuid>,
    ) -> Self {
        self.space_id = space_id;
        self.tenant_id = tenant_id;
        self.user_id = user_id;
        self
    }

    pub fn with_client(mut self, source_ip: Option<String>, user_agent: Option<String>) -> Self {
        self.source_ip = source_ip;
        self.user_agent = user_agent;
        self
    }
}

impl ChainRecord for AuditEvent {
    const ORDER_FIELD: &'static str = "sequence_number";

    // One item per sequence number: a reused number fails as a conflict.
    fn storage_id(&self) -> String {
        self.sequence_number.to_string()
    }

    fn position_label(&self) -> String {
        format!("sequence {}", self.sequence_number)
    }

    fn ordering_value(&self) -> FieldValue {
        self.sequence_number.into()
    }

    fn canonical_fields(&self, version: u32) -> Option<CanonicalFields> {
        match version {
            1 => Some(
                CanonicalFields::new()
                    .with("id", self.id)
                    .with("event_type", self.event_type.as_str())
                    .with("event_category", self.event_category.as_str())
                    .with("event_data", self.event_data.clone())
                    .with("timestamp", self.timestamp)
                    .with("space_id", self.space_id)
                    .with("tenant_id", self.tenant_id)
                    .with("user_id", self.user_id),
            ),
            _ => None,
        }
    }

    fn check_successor(&self, previous: Option<&Self>) -> Result<(), String> {
        let expected = previous.map_or(1, |p| p.sequence_number.saturating_add(1));
        match previous {
            _ if self.sequence_number == expected => Ok(()),
            None => Err(format!(
                "first entry must carry sequence 1, found {}",
                self.sequence_number
            )),
            Some(p) if p.sequence_number == self.sequence_number => {
                Err(format!("duplicate sequence {}", self.sequence_number))
            }
            Some(_) => Err(format!(
                "expected sequence {expected}, found {}",
                self.sequence_number
            )),
        }
    }
}

/// Lightweight projection of an audit event for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub id: Uuid,
    pub sequence_number: u64,
    pub event_type: String,
    pub event_category: String,
    #[serde(with = "crate::time::micros")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

impl From<&AuditEvent> for AuditSummary {
    fn from(event: &AuditEvent) -> Self {
        Self {
            id: event.id,
            sequence_number: event.sequence_number,
            event_type: event.event_type.clone(),
            event_category: event.event_category.clone(),
            timestamp: event.timestamp,
            space_id: event.space_id,
            tenant_id: event.tenant_id,
            user_id: event.user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::GENESIS_HASH;
    use crate::ledger::{ChainEntry, compute_hash};
    use serde_json::json;

    fn interaction() -> Interaction {
        Interaction::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "What are the eligibility requirements?",
            "You must have contributed for...",
        )
        .with_model("gpt-4o-mini", "2024-07-18")
    }

    #[test]
    fn test_entry_survives_json_round_trip() {
        let mut record = interaction();
        record.chunks_used.push(ChunkReference {
            chunk_id: "doc-123:0".into(),
            document_id: Uuid::new_v4(),
            filename: "policy.pdf".into(),
            page_number: Some(5),
            text_snippet: "Eligibility requires...".into(),
            relevance_score: 0.1 + 0.2,
        });
        let hash = compute_hash(&record, 1, GENESIS_HASH).unwrap();
        let entry = ChainEntry {
            record,
            link: crate::ledger::ChainLink {
                content_hash: hash.clone(),
                previous_hash: GENESIS_HASH.into(),
                hash_version: 1,
            },
        };

        let text = serde_json::to_string(&entry).unwrap();
        let back: ChainEntry<Interaction> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, entry);
        assert_eq!(back.recompute_hash().unwrap(), hash);
    }

    #[test]
    fn test_chunk_canonical_value_matches_serde_form() {
        let mut chunk = ChunkReference {
            chunk_id: "doc-123:0".into(),
            document_id: Uuid::new_v4(),
            filename: "policy.pdf".into(),
            page_number: Some(5),
            text_snippet: "Eligibility requires...".into(),
            relevance_score: 0.1 + 0.2,
        };
        assert_eq!(chunk.canonical_value(), serde_json::to_value(&chunk).unwrap());
        chunk.page_number = None;
        assert_eq!(chunk.canonical_value(), serde_json::to_value(&chunk).unwrap());

        let mut record = interaction();
        let empty = compute_hash(&record, 1, GENESIS_HASH);
        record.chunks_used.push(chunk);
        assert_ne!(compute_hash(&record, 1, GENESIS_HASH), empty);
    }

    #[test]
    fn test_unhashed_fields_do_not_change_hash() {
        let record = interaction();
        let mut annotated = record.clone();
        annotated.quality_score = Some(0.9);
        annotated.safety_flags.push("pii_removed".into());
        assert_eq!(
            compute_hash(&record, 1, GENESIS_HASH),
            compute_hash(&annotated, 1, GENESIS_HASH)
        );

        let mut edited = record.clone();
        edited.response.push('!');
        assert_ne!(
            compute_hash(&record, 1, GENESIS_HASH),
            compute_hash(&edited, 1, GENESIS_HASH)
        );
    }

    #[test]
    fn test_missing_hash_version_defaults_to_one() {
        let mut body = serde_json::to_value(ChainEntry {
            record: AuditEvent::new("user.login", "security", json!({})),
            link: crate::ledger::ChainLink {
                content_hash: "x".into(),
                previous_hash: GENESIS_HASH.into(),
                hash_version: 1,
            },
        })
        .unwrap();
        body.as_object_mut().unwrap().remove("hash_version");
        let entry: ChainEntry<AuditEvent> = serde_json::from_value(body).unwrap();
        assert_eq!(entry.link.hash_version, 1);
    }

    #[test]
    fn test_audit_successor_rules() {
        let mut first = AuditEvent::new("a", "data", json!({}));
        first.sequence_number = 1;
        let mut second = first.clone();
        second.sequence_number = 2;
        let mut skip = first.clone();
        skip.sequence_number = 4;

        assert!(first.check_successor(None).is_ok());
        assert!(second.check_successor(Some(&first)).is_ok());
        assert!(second.check_successor(None).unwrap_err().contains("sequence 1"));
        assert!(first.check_successor(Some(&first)).unwrap_err().contains("duplicate"));
        assert!(skip.check_successor(Some(&second)).unwrap_err().contains("expected sequence 3"));
    }

    #[test]
    fn test_summary_projection() {
        let space = Uuid::new_v4();
        let event = AuditEvent::new("document.uploaded", "data", json!({"filename": "a.pdf"}))
            .with_scope(Some(space), None, None);
        let summary = AuditSummary::from(&event);
        assert_eq!(summary.space_id, Some(space));
        assert_eq!(summary.event_type, "document.uploaded");
    }
}
