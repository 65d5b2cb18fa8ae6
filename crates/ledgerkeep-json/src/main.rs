use std::io::{self, Read};

use ledgerkeep_core::ledger::audit::ArchiveStatus;
use ledgerkeep_core::partition::parse_identifier;
use ledgerkeep_core::{
    AuditEvent, AuditFilter, Interaction, LedgerError, Ledgerkeep, LoadOptions, MigrationRequest,
    PartitionPolicy, ValidationError, derive_key, scoped_query_key,
};
use serde_json::json;
use uuid::Uuid;

use crate::input::{JsonCommand, JsonInput, LedgerKind, Scope};
use crate::output::{Failure, emit, emit_done};

mod input;
mod output;

type ScopeIds = (Option<Uuid>, Option<Uuid>, Option<Uuid>);

/// Parse whichever scope ids were supplied. Absent ids stay `None`.
fn optional_scope(scope: &Scope) -> Result<ScopeIds, LedgerError> {
    let mut invalid = Vec::new();
    let mut parse = |field: &'static str, raw: &Option<String>| match raw.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => match parse_identifier(raw) {
            Ok(id) => Some(id),
            Err(reason) => {
                invalid.push((field, reason));
                None
            }
        },
    };
    let ids = (
        parse("space_id", &scope.space_id),
        parse("tenant_id", &scope.tenant_id),
        parse("user_id", &scope.user_id),
    );
    if invalid.is_empty() {
        Ok(ids)
    } else {
        Err(ValidationError::Fields {
            missing: Vec::new(),
            invalid,
        }
        .into())
    }
}

async fn dispatch(command: JsonCommand, lk: &Ledgerkeep) -> Result<(), Failure> {
    match command {
        JsonCommand::Migrate {
            batch_size,
            skip,
            dry_run,
            force,
        } => {
            let batch_size = batch_size
                .unwrap_or_else(|| lk.config().migration.batch_size())
                .max(1);
            let coordinator = lk.migration();
            coordinator.prepare_target().await?;
            let stats = coordinator
                .migrate_batch(
                    MigrationRequest::new(batch_size, skip)
                        .dry_run(dry_run)
                        .force(force),
                )
                .await?;
            emit("migration_stats", &stats)
        }
        JsonCommand::VerifyMigration { sample_size } => {
            let result = lk.migration().verify_migration(sample_size).await?;
            emit("migration_verification", &result)
        }
        JsonCommand::VerifyChain {
            ledger,
            scope,
            limit,
        } => {
            let result = match ledger {
                LedgerKind::Audit => {
                    let limit = limit.unwrap_or_else(|| lk.config().audit.verify_limit());
                    lk.audit().verify(limit).await?
                }
                LedgerKind::Interactions => {
                    let key = derive_key(&scope.identity(), PartitionPolicy::Composite)
                        .map_err(LedgerError::from)?;
                    let limit = limit.unwrap_or_else(|| lk.config().interactions.verify_limit());
                    lk.interactions().verify(&key, limit).await?
                }
            };
            emit("chain_verification", &result)
        }
        JsonCommand::RecordAudit {
            event_type,
            event_category,
            event_data,
            scope,
            source_ip,
            user_agent,
        } => {
            let (space_id, tenant_id, user_id) = optional_scope(&scope)?;
            let event = AuditEvent::new(event_type, event_category, event_data)
                .with_scope(space_id, tenant_id, user_id)
                .with_client(source_ip, user_agent);
            let recorded = lk.audit().record(event).await?;
            let (archive, detail) = match &recorded.archive {
                ArchiveStatus::Disabled => ("disabled", None),
                ArchiveStatus::Written(path) => ("written", Some(path.display().to_string())),
                ArchiveStatus::Failed(e) => ("failed", Some(e.clone())),
            };
            emit(
                "audit_recorded",
                &json!({
                    "id": recorded.entry.record.id,
                    "sequence_number": recorded.entry.record.sequence_number,
                    "content_hash": recorded.entry.link.content_hash,
                    "previous_hash": recorded.entry.link.previous_hash,
                    "archive": archive,
                    "archive_detail": detail,
                }),
            )
        }
        JsonCommand::RecordInteraction {
            scope,
            query,
            response,
            model_name,
            model_version,
        } => {
            let (space_id, tenant_id, user_id) = scope
                .identity()
                .parse_composite()
                .map_err(LedgerError::from)?;
            let interaction = Interaction::new(space_id, tenant_id, user_id, query, response)
                .with_model(model_name.unwrap_or_default(), model_version.unwrap_or_default());
            let entry = lk.interactions().record(interaction).await?;
            emit(
                "interaction_recorded",
                &json!({
                    "id": entry.record.id,
                    "created_at": ledgerkeep_core::time::format(&entry.record.created_at),
                    "content_hash": entry.link.content_hash,
                    "previous_hash": entry.link.previous_hash,
                }),
            )
        }
        JsonCommand::ListAudit {
            space_id,
            event_type,
            event_category,
            skip,
            limit,
        } => {
            let (space_id, _, _) = optional_scope(&Scope {
                space_id,
                ..Scope::default()
            })?;
            let filter = AuditFilter {
                space_id,
                event_type,
                event_category,
            };
            for summary in lk.audit().list(&filter, skip, limit).await? {
                emit("audit_summary", &summary)?;
            }
            Ok(())
        }
        JsonCommand::ListInteractions {
            scope,
            allow_cross_partition,
            skip,
            limit,
        } => {
            let route = scoped_query_key(&scope.identity()).map_err(LedgerError::from)?;
            let entries = lk
                .interactions()
                .list_in_space(&route, allow_cross_partition, skip, limit)
                .await?;
            for entry in &entries {
                emit("interaction", entry)?;
            }
            Ok(())
        }
        JsonCommand::Containers { init } => {
            let reports = if init {
                lk.init_layout().await?
            } else {
                lk.verify_layout().await?
            };
            for report in &reports {
                emit("container", report)?;
            }
            Ok(())
        }
        JsonCommand::ShowVersion => show_version(),
    }
}

fn show_version() -> Result<(), Failure> {
    emit(
        "result",
        &json!({"content": format!("ledgerkeep-json {}", env!("CARGO_PKG_VERSION"))}),
    )
}

async fn run() -> Result<(), Failure> {
    let mut json_str = String::new();
    io::stdin().read_to_string(&mut json_str)?;

    let json_input: JsonInput = serde_json::from_str(&json_str).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Invalid JSON input: {}", e),
        )
    })?;

    // Answered without touching the home directory
    if matches!(json_input.command, JsonCommand::ShowVersion) {
        return show_version();
    }

    let lk = Ledgerkeep::load_with_options(LoadOptions {
        home: json_input.home,
    })?;
    log::debug!("home: {}", lk.home().display());
    dispatch(json_input.command, &lk).await
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    // --json-schema: print input schema and exit
    if args.iter().any(|a| a == "--json-schema") {
        let schema = schemars::schema_for!(input::JsonInput);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    if args.iter().any(|a| a == "--version") {
        println!("ledgerkeep-json {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // stdout carries JSONL only; logs go to stderr
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let result = run().await;
    emit_done(&result);
    if result.is_err() {
        std::process::exit(1);
    }
    Ok(())
}
