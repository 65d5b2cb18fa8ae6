use std::path::PathBuf;

use ledgerkeep_core::IdentityFields;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

/// JSON-mode input, read from stdin. One command per invocation.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct JsonInput {
    /// The command to execute
    pub command: JsonCommand,
    /// Home directory override
    #[serde(default)]
    pub home: Option<PathBuf>,
}

/// Scope identifiers as supplied by the caller. Validated by the core.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct Scope {
    #[serde(default)]
    pub space_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Scope {
    pub fn identity(&self) -> IdentityFields {
        IdentityFields::new(
            self.space_id.as_deref(),
            self.tenant_id.as_deref(),
            self.user_id.as_deref(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Audit,
    Interactions,
}

fn default_sample_size() -> usize {
    100
}

fn default_page() -> usize {
    50
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JsonCommand {
    /// Migrate one batch of legacy records
    Migrate {
        #[serde(default)]
        batch_size: Option<usize>,
        #[serde(default)]
        skip: usize,
        #[serde(default)]
        dry_run: bool,
        #[serde(default)]
        force: bool,
    },
    /// Compare a sample of source records with their migrated copies
    VerifyMigration {
        #[serde(default = "default_sample_size")]
        sample_size: usize,
    },
    /// Walk a hash chain. `interactions` needs the full scope
    VerifyChain {
        ledger: LedgerKind,
        #[serde(flatten)]
        scope: Scope,
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Append an audit event to the global chain
    RecordAudit {
        event_type: String,
        event_category: String,
        #[serde(default = "empty_object")]
        event_data: Value,
        #[serde(flatten)]
        scope: Scope,
        #[serde(default)]
        source_ip: Option<String>,
        #[serde(default)]
        user_agent: Option<String>,
    },
    /// Append an interaction to its user's chain
    RecordInteraction {
        #[serde(flatten)]
        scope: Scope,
        query: String,
        response: String,
        #[serde(default)]
        model_name: Option<String>,
        #[serde(default)]
        model_version: Option<String>,
    },
    /// Audit summaries, newest first
    ListAudit {
        #[serde(default)]
        space_id: Option<String>,
        #[serde(default)]
        event_type: Option<String>,
        #[serde(default)]
        event_category: Option<String>,
        #[serde(default)]
        skip: usize,
        #[serde(default = "default_page")]
        limit: usize,
    },
    /// Interactions in a space, newest first. A partial scope needs
    /// `allow_cross_partition`
    ListInteractions {
        #[serde(flatten)]
        scope: Scope,
        #[serde(default)]
        allow_cross_partition: bool,
        #[serde(default)]
        skip: usize,
        #[serde(default = "default_page")]
        limit: usize,
    },
    /// Check (or with `init`, create) the container layout
    Containers {
        #[serde(default)]
        init: bool,
    },
    ShowVersion,
}
