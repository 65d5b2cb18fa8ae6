//! Command execution and human-readable output.
//!
//! Every command returns `Ok(true)` on success and `Ok(false)` when it ran
//! but found a problem (failed records, broken chain, bad layout), so that
//! `main` can exit non-zero without treating the report as an error.

use std::io::{self, ErrorKind};

use ledgerkeep_core::ledger::audit::ArchiveStatus;
use ledgerkeep_core::{
    AuditEvent, ChainVerification, ContainerStatus, IdentityFields, Interaction, LedgerError,
    Ledgerkeep, MigrationRequest, PartitionPolicy, derive_key,
};

use crate::cli::{AppendCommand, CliCommand, LedgerKind, MigrateArgs, ScopeArgs};

pub async fn execute(command: &CliCommand, lk: &Ledgerkeep) -> io::Result<bool> {
    match command {
        CliCommand::Migrate(args) => migrate(args, lk).await,
        CliCommand::VerifyMigration { sample_size } => verify_migration(*sample_size, lk).await,
        CliCommand::VerifyChain {
            ledger,
            scope,
            limit,
        } => verify_chain(*ledger, scope, *limit, lk).await,
        CliCommand::Append(append) => self::append(append, lk).await,
        CliCommand::Containers { init } => containers(*init, lk).await,
    }
}

async fn migrate(args: &MigrateArgs, lk: &Ledgerkeep) -> io::Result<bool> {
    let batch_size = args
        .batch_size
        .unwrap_or_else(|| lk.config().migration.batch_size())
        .max(1);
    let coordinator = lk.migration();
    coordinator.prepare_target().await?;
    let stats = coordinator
        .migrate_batch(
            MigrationRequest::new(batch_size, args.skip)
                .dry_run(args.dry_run)
                .force(args.force),
        )
        .await?;
    println!("{stats}");
    if stats.total == batch_size {
        println!("Next batch: --skip {}", args.skip + stats.total);
    }
    Ok(stats.is_success())
}

async fn verify_migration(sample_size: usize, lk: &Ledgerkeep) -> io::Result<bool> {
    let result = lk.migration().verify_migration(sample_size).await?;
    println!("Sampled: {}", result.sampled);
    println!("Verified: {}", result.verified);
    println!("Errors: {}", result.errors);
    for issue in &result.issues {
        println!("  - {}: {}", issue.record_id, issue.problem);
    }
    if result.errors > result.issues.len() {
        println!("  ... and {} more errors", result.errors - result.issues.len());
    }
    Ok(result.is_success())
}

fn scope_fields(scope: &ScopeArgs) -> IdentityFields {
    IdentityFields {
        space_id: scope.space.map(|id| id.to_string()),
        tenant_id: scope.tenant.map(|id| id.to_string()),
        user_id: scope.user.map(|id| id.to_string()),
    }
}

async fn verify_chain(
    ledger: LedgerKind,
    scope: &ScopeArgs,
    limit: Option<usize>,
    lk: &Ledgerkeep,
) -> io::Result<bool> {
    let result = match ledger {
        LedgerKind::Audit => {
            let limit = limit.unwrap_or_else(|| lk.config().audit.verify_limit());
            lk.audit().verify(limit).await?
        }
        LedgerKind::Interactions => {
            let key = derive_key(&scope_fields(scope), PartitionPolicy::Composite)
                .map_err(LedgerError::from)?;
            let limit = limit.unwrap_or_else(|| lk.config().interactions.verify_limit());
            lk.interactions().verify(&key, limit).await?
        }
    };
    print_verification(&result);
    Ok(result.is_valid)
}

fn print_verification(result: &ChainVerification) {
    if result.is_valid {
        println!("Chain valid: {} entries checked", result.count_checked);
    } else {
        println!(
            "Chain INVALID after {} valid entries",
            result.count_checked
        );
        println!("{}", result.message);
    }
}

async fn append(command: &AppendCommand, lk: &Ledgerkeep) -> io::Result<bool> {
    match command {
        AppendCommand::Audit {
            event_type,
            category,
            data,
            scope,
        } => {
            let data = serde_json::from_str(data).map_err(|e| {
                io::Error::new(ErrorKind::InvalidInput, format!("--data is not valid JSON: {e}"))
            })?;
            let event = AuditEvent::new(event_type.as_str(), category.as_str(), data)
                .with_scope(scope.space, scope.tenant, scope.user);
            let recorded = lk.audit().record(event).await?;
            println!(
                "Recorded audit event #{} ({})",
                recorded.entry.record.sequence_number, recorded.entry.link.content_hash
            );
            match &recorded.archive {
                ArchiveStatus::Written(path) => println!("Archived to {}", path.display()),
                ArchiveStatus::Failed(e) => eprintln!("[WARN] archive copy failed: {e}"),
                ArchiveStatus::Disabled => {}
            }
            Ok(true)
        }
        AppendCommand::Interaction {
            space,
            tenant,
            user,
            query,
            response,
            model,
            model_version,
        } => {
            let interaction = Interaction::new(*space, *tenant, *user, query.as_str(), response.as_str())
                .with_model(
                    model.clone().unwrap_or_default(),
                    model_version.clone().unwrap_or_default(),
                );
            let entry = lk.interactions().record(interaction).await?;
            println!(
                "Recorded interaction {} ({})",
                entry.record.id, entry.link.content_hash
            );
            Ok(true)
        }
    }
}

async fn containers(init: bool, lk: &Ledgerkeep) -> io::Result<bool> {
    let reports = if init {
        lk.init_layout().await?
    } else {
        lk.verify_layout().await?
    };
    let width = reports.iter().map(|r| r.name.len()).max().unwrap_or(0);
    for report in &reports {
        let status = match &report.status {
            ContainerStatus::Ok => "ok".to_string(),
            ContainerStatus::Missing => "MISSING".to_string(),
            ContainerStatus::Mismatch { actual } => format!("MISMATCH (declared {actual})"),
        };
        println!(
            "{:<width$}  {:<15}  {status}",
            report.name,
            report.expected.as_str()
        );
    }
    Ok(reports.iter().all(|r| r.status.is_ok()))
}
