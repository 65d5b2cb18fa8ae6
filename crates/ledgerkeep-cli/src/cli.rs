//! CLI argument parsing with clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use uuid::Uuid;

/// ledgerkeep - tamper-evident ledgers and partition-key migration
#[derive(Parser, Debug)]
#[command(name = "ledgerkeep", version, about = "Tamper-evident ledgers and partition-key migration")]
pub struct Cli {
    /// Home directory (overrides LEDGERKEEP_HOME and ~/.ledgerkeep)
    #[arg(long, global = true, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum CliCommand {
    /// Migrate one batch of legacy records to composite keys
    Migrate(MigrateArgs),

    /// Compare a sample of source records with their migrated copies
    VerifyMigration {
        /// Number of source records to check, from the start
        #[arg(long, default_value_t = 100)]
        sample_size: usize,
    },

    /// Walk a hash chain and report the first broken entry
    VerifyChain {
        #[arg(value_enum)]
        ledger: LedgerKind,
        #[command(flatten)]
        scope: ScopeArgs,
        /// Entries to check (defaults to the configured verify limit)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Append an entry to a ledger
    #[command(subcommand)]
    Append(AppendCommand),

    /// Check the container layout
    Containers {
        /// Create any missing containers first
        #[arg(long)]
        init: bool,
    },
}

#[derive(Args, Debug, PartialEq)]
pub struct MigrateArgs {
    /// Records per batch (defaults to the configured batch size)
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Records to skip from the start of the source
    #[arg(long, default_value_t = 0)]
    pub skip: usize,
    /// Report what would happen without writing
    #[arg(long)]
    pub dry_run: bool,
    /// Overwrite records that were already migrated
    #[arg(long)]
    pub force: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    /// Global audit ledger
    Audit,
    /// Per-user interaction ledger (needs --space, --tenant and --user)
    Interactions,
}

#[derive(Args, Debug, Default, PartialEq)]
pub struct ScopeArgs {
    #[arg(long)]
    pub space: Option<Uuid>,
    #[arg(long)]
    pub tenant: Option<Uuid>,
    #[arg(long)]
    pub user: Option<Uuid>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum AppendCommand {
    /// Record an audit event
    Audit {
        #[arg(long = "type")]
        event_type: String,
        #[arg(long)]
        category: String,
        /// Event payload as JSON
        #[arg(long, default_value = "{}")]
        data: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Record an AI interaction
    Interaction {
        #[arg(long)]
        space: Uuid,
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        query: String,
        #[arg(long)]
        response: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        model_version: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ledgerkeep").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_migrate_flags() {
        let cli = parse(&["migrate", "--batch-size", "50", "--skip", "100", "--dry-run"]);
        assert_eq!(
            cli.command,
            CliCommand::Migrate(MigrateArgs {
                batch_size: Some(50),
                skip: 100,
                dry_run: true,
                force: false,
            })
        );
    }

    #[test]
    fn test_global_home_after_subcommand() {
        let cli = parse(&["containers", "--init", "--home", "/tmp/lk"]);
        assert_eq!(cli.home, Some(PathBuf::from("/tmp/lk")));
        assert_eq!(cli.command, CliCommand::Containers { init: true });
    }

    #[test]
    fn test_verify_chain_scope() {
        let space = Uuid::new_v4();
        let cli = parse(&[
            "verify-chain",
            "interactions",
            "--space",
            &space.to_string(),
            "--limit",
            "5",
        ]);
        match cli.command {
            CliCommand::VerifyChain {
                ledger,
                scope,
                limit,
            } => {
                assert_eq!(ledger, LedgerKind::Interactions);
                assert_eq!(scope.space, Some(space));
                assert_eq!(scope.user, None);
                assert_eq!(limit, Some(5));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_invalid_uuid_is_rejected() {
        let result = Cli::try_parse_from(["ledgerkeep", "verify-chain", "interactions", "--user", "bob"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_append_audit_defaults() {
        let cli = parse(&["append", "audit", "--type", "login", "--category", "auth"]);
        assert_eq!(
            cli.command,
            CliCommand::Append(AppendCommand::Audit {
                event_type: "login".into(),
                category: "auth".into(),
                data: "{}".into(),
                scope: ScopeArgs::default(),
            })
        );
    }
}
