//! Operator CLI for Tessera tenants.
//!
//! Usage:
//!   tenantctl bootstrap             - Create the registry and apply global migrations
//!   tenantctl provision [--id ID]   - Provision a tenant (new id when omitted)
//!   tenantctl deprovision <ID>      - Drop a tenant's schema
//!   tenantctl purge <ID>            - Delete the record of a dropped tenant
//!   tenantctl list [--state STATE]  - List tenants
//!   tenantctl status <ID>           - Show a tenant's migration status
//!   tenantctl migrate [--id ID]     - Apply new tenant migrations

use std::path::Path;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use sea_orm_migration::MigratorTrait;
use tessera_core::tenancy::{MigrationSet, TenantLifecycleCoordinator, TenantState};
use tessera_core::TenancyOptions;
use tessera_db::PgBackend;
use tessera_db::migration::Migrator;
use tessera_shared::{AppConfig, TenantId};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tenantctl")]
#[command(version)]
#[command(about = "Provision, migrate and drop tenant schemas")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the tenant registry and apply global migrations
    Bootstrap,

    /// Provision a tenant
    Provision {
        /// Tenant id; a new one is generated when omitted
        #[arg(long)]
        id: Option<TenantId>,
    },

    /// Drop a tenant's schema and mark it dropped
    Deprovision {
        /// Tenant id
        id: TenantId,
    },

    /// Delete the registry record of a dropped tenant
    Purge {
        /// Tenant id
        id: TenantId,
    },

    /// List tenants
    #[command(alias = "ls")]
    List {
        /// Only tenants in this state
        #[arg(long, value_parser = parse_state)]
        state: Option<TenantState>,
    },

    /// Show applied and pending migrations of a tenant
    Status {
        /// Tenant id
        id: TenantId,
    },

    /// Apply new tenant migrations
    Migrate {
        /// Only this tenant; every active tenant when omitted
        #[arg(long)]
        id: Option<TenantId>,
    },
}

fn parse_state(s: &str) -> Result<TenantState, String> {
    TenantState::parse(s).ok_or_else(|| format!("unknown tenant state: {s}"))
}

fn load_set(dir: &Path) -> anyhow::Result<MigrationSet> {
    if !dir.exists() {
        return Ok(MigrationSet::empty());
    }
    MigrationSet::load_dir(dir).with_context(|| format!("loading migrations from {}", dir.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera=info,tenantctl=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load().context("loading configuration")?;

    let backend = PgBackend::connect(&config)
        .await
        .context("connecting to database")?;
    let db = backend.connection().clone();
    info!("Connected to database");

    let tenant_set = load_set(&config.tenancy.tenant_migrations_dir)?;
    let options = TenancyOptions::from(&config.tenancy);
    let coordinator = TenantLifecycleCoordinator::new(backend, tenant_set, options.lock_policy);

    match cli.command {
        Commands::Bootstrap => {
            Migrator::up(&db, None).await?;
            let global = load_set(&config.tenancy.global_migrations_dir)?;
            let applied = coordinator.bootstrap_global(&global).await?;
            println!("registry ready; applied global versions {:?}", applied.versions());
        }
        Commands::Provision { id } => {
            let tenant_id = id.unwrap_or_default();
            let record = coordinator.provision(tenant_id).await?;
            println!("{}\t{}\t{}", record.tenant_id, record.schema_name, record.state);
        }
        Commands::Deprovision { id } => {
            coordinator.deprovision(id).await?;
            println!("{id}\tdropped");
        }
        Commands::Purge { id } => {
            if coordinator.purge(id).await? {
                println!("{id}\tpurged");
            } else {
                println!("{id}\tnot found");
            }
        }
        Commands::List { state } => {
            for record in coordinator.list(state).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.tenant_id,
                    record.schema_name,
                    record.state,
                    record.updated_at.to_rfc3339()
                );
            }
        }
        Commands::Status { id } => {
            let status = coordinator.migration_status(id).await?;
            for row in &status.applied {
                println!("{:>6}\tapplied\t{}", row.version, row.applied_at.to_rfc3339());
            }
            for version in &status.pending {
                println!("{version:>6}\tpending");
            }
        }
        Commands::Migrate { id: Some(id) } => {
            let applied = coordinator.migrate_tenant(id).await?;
            println!("{id}\tapplied {:?}", applied.versions());
        }
        Commands::Migrate { id: None } => {
            let report = coordinator.migrate_all().await?;
            for (tenant_id, applied) in &report.migrated {
                println!("{tenant_id}\tapplied {:?}", applied.versions());
            }
            for (tenant_id, error) in &report.failed {
                eprintln!("{tenant_id}\tfailed: {error}");
            }
            if !report.is_success() {
                bail!("{} tenant(s) failed to migrate", report.failed.len());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_list_state() {
        let cli = Cli::try_parse_from(["tenantctl", "list", "--state", "active"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::List {
                state: Some(TenantState::Active)
            }
        ));
        assert!(Cli::try_parse_from(["tenantctl", "list", "--state", "archived"]).is_err());
    }

    #[test]
    fn test_missing_migration_dir_is_empty_set() {
        let set = load_set(Path::new("/nonexistent/tessera/migrations")).unwrap();
        assert!(set.is_empty());
    }
}
