//! # Partition key routing
//!
//! Every record lives in an isolated partition addressed by a composite key of
//! scope identifiers. Tenants never share a partition, so a point lookup can
//! never return another tenant's data.
//!
//! ## Policies
//!
//! Each container declares exactly one [`PartitionPolicy`]. A key whose arity
//! or field order does not match the policy is rejected, never coerced:
//!
//! ```text
//! composite        /space_id /tenant_id /user_id
//! legacy_single    /tenant_id
//! sequence_number  /sequence_number
//! item_id          /id
//! ```
//!
//! ## Scoped queries
//!
//! [`scoped_query_key`] returns a point key only when every scope field is
//! known. With fewer fields it returns [`ScopedQuery::CrossPartitionRequired`]
//! and the caller has to opt in to the fan-out explicitly. The router never
//! downgrades a point lookup into a scan on its own.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::store::QueryScope;

pub const SPACE_ID: &str = "space_id";
pub const TENANT_ID: &str = "tenant_id";
pub const USER_ID: &str = "user_id";

const COMPOSITE_PATHS: &[&str] = &[SPACE_ID, TENANT_ID, USER_ID];
const LEGACY_PATHS: &[&str] = &[TENANT_ID];
const SEQUENCE_PATHS: &[&str] = &["sequence_number"];
const ITEM_ID_PATHS: &[&str] = &["id"];

// ============================================================================
// Policies
// ============================================================================

/// Partitioning policy declared by a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionPolicy {
    /// Hierarchical key: space, tenant, user.
    Composite,
    /// Pre-migration scheme keyed by tenant only.
    LegacySingle,
    /// One partition per global sequence number (audit ledger).
    SequenceNumber,
    /// One partition per item id (singleton records such as counters).
    ItemId,
}

impl PartitionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionPolicy::Composite => "composite",
            PartitionPolicy::LegacySingle => "legacy_single",
            PartitionPolicy::SequenceNumber => "sequence_number",
            PartitionPolicy::ItemId => "item_id",
        }
    }

    /// Ordered field paths making up a key under this policy.
    pub fn paths(&self) -> &'static [&'static str] {
        match self {
            PartitionPolicy::Composite => COMPOSITE_PATHS,
            PartitionPolicy::LegacySingle => LEGACY_PATHS,
            PartitionPolicy::SequenceNumber => SEQUENCE_PATHS,
            PartitionPolicy::ItemId => ITEM_ID_PATHS,
        }
    }

    pub fn arity(&self) -> usize {
        self.paths().len()
    }

    /// Check that `key` has exactly the arity this policy requires.
    pub fn validate_key(&self, key: &PartitionKey) -> Result<(), ValidationError> {
        if key.len() != self.arity() {
            return Err(ValidationError::KeyArity {
                policy: self.as_str(),
                expected: self.arity(),
                actual: key.len(),
                paths: self
                    .paths()
                    .iter()
                    .map(|p| format!("/{p}"))
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        Ok(())
    }
}

impl fmt::Display for PartitionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "composite" => Ok(PartitionPolicy::Composite),
            "legacy_single" => Ok(PartitionPolicy::LegacySingle),
            "sequence_number" => Ok(PartitionPolicy::SequenceNumber),
            "item_id" => Ok(PartitionPolicy::ItemId),
            other => Err(format!("unknown partition policy '{other}'")),
        }
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Ordered tuple of one to three scope identifiers.
///
/// Construction does not know the target container, so arity is checked
/// against the container's policy by the store on every call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(Vec<String>);

impl PartitionKey {
    pub fn composite(space_id: Uuid, tenant_id: Uuid, user_id: Uuid) -> Self {
        Self(vec![
            space_id.to_string(),
            tenant_id.to_string(),
            user_id.to_string(),
        ])
    }

    pub fn single(value: impl Into<String>) -> Self {
        Self(vec![value.into()])
    }

    /// Key for a sequence-partitioned container.
    pub fn sequence(sequence_number: u64) -> Self {
        Self::single(sequence_number.to_string())
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Injective string form used as a storage column.
    pub fn encode(&self) -> String {
        serde_json::Value::from(self.0.clone()).to_string()
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        serde_json::from_str(encoded).ok().map(Self)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

// ============================================================================
// Identity fields
// ============================================================================

/// Scope identifiers supplied by a producer, possibly incomplete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl IdentityFields {
    pub fn new(space_id: Option<&str>, tenant_id: Option<&str>, user_id: Option<&str>) -> Self {
        Self {
            space_id: space_id.map(str::to_string),
            tenant_id: tenant_id.map(str::to_string),
            user_id: user_id.map(str::to_string),
        }
    }

    pub fn from_ids(space_id: Uuid, tenant_id: Uuid, user_id: Uuid) -> Self {
        Self {
            space_id: Some(space_id.to_string()),
            tenant_id: Some(tenant_id.to_string()),
            user_id: Some(user_id.to_string()),
        }
    }

    /// Pull identity fields out of a stored JSON record.
    ///
    /// `null` counts as missing. Non-string scalars are stringified so that
    /// they fail identifier validation with a useful message instead of
    /// silently disappearing.
    pub fn from_json(record: &serde_json::Value) -> Self {
        let field = |name: &str| match record.get(name) {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        };
        Self {
            space_id: field(SPACE_ID),
            tenant_id: field(TENANT_ID),
            user_id: field(USER_ID),
        }
    }

    /// Parse all three scope ids, naming every missing or invalid one.
    pub fn parse_composite(&self) -> Result<(Uuid, Uuid, Uuid), ValidationError> {
        match parse_fields(self, COMPOSITE_PATHS)?.as_slice() {
            &[space_id, tenant_id, user_id] => Ok((space_id, tenant_id, user_id)),
            _ => Err(ValidationError::NotDerivable(PartitionPolicy::Composite.as_str())),
        }
    }

    fn get(&self, name: &str) -> Option<&str> {
        let value = match name {
            SPACE_ID => self.space_id.as_deref(),
            TENANT_ID => self.tenant_id.as_deref(),
            USER_ID => self.user_id.as_deref(),
            _ => None,
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

/// Parse a UUID-shaped identifier.
pub fn parse_identifier(raw: &str) -> Result<Uuid, String> {
    Uuid::parse_str(raw.trim()).map_err(|e| format!("not a valid UUID: {e}"))
}

/// Parse the given fields, collecting every missing and invalid one.
fn parse_fields(
    fields: &IdentityFields,
    required: &[&'static str],
) -> Result<Vec<Uuid>, ValidationError> {
    let mut missing = Vec::new();
    let mut invalid = Vec::new();
    let mut parsed = Vec::with_capacity(required.len());

    for &name in required {
        match fields.get(name) {
            None => missing.push(name),
            Some(raw) => match parse_identifier(raw) {
                Ok(id) => parsed.push(id),
                Err(reason) => invalid.push((name, reason)),
            },
        }
    }

    if missing.is_empty() && invalid.is_empty() {
        Ok(parsed)
    } else {
        Err(ValidationError::Fields { missing, invalid })
    }
}

/// Derive the partition key for `fields` under `policy`.
///
/// `Composite` requires all of space, tenant and user; `LegacySingle` only
/// tenant. Missing fields are never defaulted: the error names every one.
pub fn derive_key(
    fields: &IdentityFields,
    policy: PartitionPolicy,
) -> Result<PartitionKey, ValidationError> {
    match policy {
        PartitionPolicy::Composite | PartitionPolicy::LegacySingle => {
            let ids = parse_fields(fields, policy.paths())?;
            Ok(PartitionKey(ids.iter().map(Uuid::to_string).collect()))
        }
        other => Err(ValidationError::NotDerivable(other.as_str())),
    }
}

// ============================================================================
// Scoped queries
// ============================================================================

/// Outcome of routing a query with a partially known scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopedQuery {
    /// Every scope field known: single-partition lookup.
    Point(PartitionKey),
    /// Some scope fields unknown: only a cross-partition scan can answer.
    CrossPartitionRequired {
        /// Validated known fields, usable as equality filters.
        known: Vec<(&'static str, String)>,
        /// Scope fields the caller did not supply.
        unknown: Vec<&'static str>,
    },
}

impl ScopedQuery {
    pub fn is_point(&self) -> bool {
        matches!(self, ScopedQuery::Point(_))
    }

    /// Equality filters implied by the known fields.
    pub fn filters(&self) -> Vec<(&'static str, String)> {
        match self {
            ScopedQuery::Point(key) => COMPOSITE_PATHS
                .iter()
                .copied()
                .zip(key.components().iter().cloned())
                .collect(),
            ScopedQuery::CrossPartitionRequired { known, .. } => known.clone(),
        }
    }

    /// Accept a fan-out if one is needed.
    pub fn allow_cross_partition(&self) -> QueryScope {
        match self {
            ScopedQuery::Point(key) => QueryScope::Partition(key.clone()),
            ScopedQuery::CrossPartitionRequired { .. } => QueryScope::CrossPartition,
        }
    }

    /// Insist on a single-partition lookup.
    pub fn require_point(&self) -> Result<QueryScope, ValidationError> {
        match self {
            ScopedQuery::Point(key) => Ok(QueryScope::Partition(key.clone())),
            ScopedQuery::CrossPartitionRequired { unknown, .. } => Err(ValidationError::Fields {
                missing: unknown.clone(),
                invalid: Vec::new(),
            }),
        }
    }
}

/// Route a query given whichever scope fields the caller knows.
///
/// Fields that are present must be valid identifiers; absent ones make the
/// query cross-partition.
pub fn scoped_query_key(known: &IdentityFields) -> Result<ScopedQuery, ValidationError> {
    let mut invalid = Vec::new();
    let mut present = Vec::new();
    let mut unknown = Vec::new();

    for &name in COMPOSITE_PATHS {
        match known.get(name) {
            None => unknown.push(name),
            Some(raw) => match parse_identifier(raw) {
                Ok(id) => present.push((name, id.to_string())),
                Err(reason) => invalid.push((name, reason)),
            },
        }
    }

    if !invalid.is_empty() {
        return Err(ValidationError::Fields {
            missing: Vec::new(),
            invalid,
        });
    }

    if unknown.is_empty() {
        Ok(ScopedQuery::Point(PartitionKey(
            present.into_iter().map(|(_, v)| v).collect(),
        )))
    } else {
        Ok(ScopedQuery::CrossPartitionRequired {
            known: present,
            unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPACE: &str = "123e4567-e89b-12d3-a456-426614174001";
    const TENANT: &str = "123e4567-e89b-12d3-a456-426614174002";
    const USER: &str = "123e4567-e89b-12d3-a456-426614174003";

    #[test]
    fn test_derive_composite_key() {
        let fields = IdentityFields::new(Some(SPACE), Some(TENANT), Some(USER));
        let key = derive_key(&fields, PartitionPolicy::Composite).unwrap();
        assert_eq!(key.components(), &[SPACE, TENANT, USER]);
        PartitionPolicy::Composite.validate_key(&key).unwrap();
    }

    #[test]
    fn test_derive_composite_missing_user() {
        let fields = IdentityFields::new(Some(SPACE), Some(TENANT), None);
        let err = derive_key(&fields, PartitionPolicy::Composite).unwrap_err();
        assert_eq!(err.field_names(), vec![USER_ID]);
        assert!(err.to_string().contains("user"));
    }

    #[test]
    fn test_parse_composite_ids() {
        let fields = IdentityFields::new(Some(SPACE), Some(TENANT), Some(USER));
        let (space, tenant, user) = fields.parse_composite().unwrap();
        assert_eq!(user.to_string(), USER);
        assert_eq!(
            PartitionKey::composite(space, tenant, user),
            derive_key(&fields, PartitionPolicy::Composite).unwrap()
        );

        let err = IdentityFields::new(Some(SPACE), None, Some("bob"))
            .parse_composite()
            .unwrap_err();
        assert_eq!(err.field_names(), vec![TENANT_ID, USER_ID]);
    }

    #[test]
    fn test_derive_composite_names_every_problem() {
        let fields = IdentityFields::new(None, Some("not-a-uuid"), Some("  "));
        let err = derive_key(&fields, PartitionPolicy::Composite).unwrap_err();
        match err {
            ValidationError::Fields { missing, invalid } => {
                assert_eq!(missing, vec![SPACE_ID, USER_ID]);
                assert_eq!(invalid.len(), 1);
                assert_eq!(invalid[0].0, TENANT_ID);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_derive_legacy_requires_only_tenant() {
        let fields = IdentityFields::new(None, Some(TENANT), None);
        let key = derive_key(&fields, PartitionPolicy::LegacySingle).unwrap();
        assert_eq!(key.components(), &[TENANT]);

        let err = derive_key(&IdentityFields::default(), PartitionPolicy::LegacySingle)
            .unwrap_err();
        assert_eq!(err.field_names(), vec![TENANT_ID]);
    }

    #[test]
    fn test_derive_normalizes_uuid_case() {
        let upper = SPACE.to_uppercase();
        let fields = IdentityFields::new(Some(&upper), Some(TENANT), Some(USER));
        let key = derive_key(&fields, PartitionPolicy::Composite).unwrap();
        assert_eq!(key.components()[0], SPACE);
    }

    #[test]
    fn test_non_identity_policy_not_derivable() {
        let fields = IdentityFields::new(Some(SPACE), Some(TENANT), Some(USER));
        assert!(matches!(
            derive_key(&fields, PartitionPolicy::SequenceNumber),
            Err(ValidationError::NotDerivable("sequence_number"))
        ));
    }

    #[test]
    fn test_arity_mismatch_is_rejected() {
        let key = PartitionKey::single(TENANT);
        let err = PartitionPolicy::Composite.validate_key(&key).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::KeyArity {
                expected: 3,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_scoped_query_point_when_all_known() {
        let fields = IdentityFields::new(Some(SPACE), Some(TENANT), Some(USER));
        let routed = scoped_query_key(&fields).unwrap();
        assert!(routed.is_point());
        assert!(matches!(
            routed.require_point().unwrap(),
            QueryScope::Partition(_)
        ));
    }

    #[test]
    fn test_scoped_query_signals_cross_partition() {
        let fields = IdentityFields::new(Some(SPACE), None, None);
        let routed = scoped_query_key(&fields).unwrap();
        assert!(!routed.is_point());
        assert_eq!(routed.filters(), vec![(SPACE_ID, SPACE.to_string())]);

        // Point-only callers get a validation error naming the gaps
        let err = routed.require_point().unwrap_err();
        assert_eq!(err.field_names(), vec![TENANT_ID, USER_ID]);

        // Explicit opt-in yields a cross-partition scope
        assert_eq!(routed.allow_cross_partition(), QueryScope::CrossPartition);
    }

    #[test]
    fn test_scoped_query_rejects_invalid_known_field() {
        let fields = IdentityFields::new(Some("bogus"), None, None);
        assert!(scoped_query_key(&fields).is_err());
    }

    #[test]
    fn test_identity_from_json() {
        let record = serde_json::json!({
            "space_id": SPACE,
            "tenant_id": null,
            "user_id": 42,
        });
        let fields = IdentityFields::from_json(&record);
        assert_eq!(fields.space_id.as_deref(), Some(SPACE));
        assert_eq!(fields.tenant_id, None);
        assert_eq!(fields.user_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_key_encoding_is_injective() {
        let a = PartitionKey(vec!["a/b".into(), "c".into()]);
        let b = PartitionKey(vec!["a".into(), "b/c".into()]);
        assert_ne!(a.encode(), b.encode());
        assert_eq!(a.encode(), r#"["a/b","c"]"#);
        assert_eq!(PartitionKey::decode(&a.encode()), Some(a));
    }

    #[test]
    fn test_policy_round_trips_through_str() {
        for policy in [
            PartitionPolicy::Composite,
            PartitionPolicy::LegacySingle,
            PartitionPolicy::SequenceNumber,
            PartitionPolicy::ItemId,
        ] {
            assert_eq!(policy.as_str().parse::<PartitionPolicy>(), Ok(policy));
        }
    }
}
