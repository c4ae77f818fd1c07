use clap::Parser;
use docvault::{jobs, seed, settings, storage, web};
use miette::{IntoDiagnostic, Result};
use sea_orm_migration::MigratorTrait;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "docvault",
    version,
    about = "Multi-tenant document vault for accounting firms"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// JSON file of firms and users to sync before serving
    #[arg(long)]
    seed: Option<String>,

    /// Apply pending database migrations on start-up
    #[arg(long)]
    migrate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;
    if cli.migrate {
        migration::Migrator::up(&db, None).await.into_diagnostic()?;
        tracing::info!("Database migrations applied");
    }

    if let Some(path) = &cli.seed {
        seed::seed_from_file(&db, path).await?;
    }

    tokio::fs::create_dir_all(&settings.storage.root_dir)
        .await
        .into_diagnostic()?;

    // keep the scheduler alive for the lifetime of the server
    let _scheduler = jobs::init_scheduler(db.clone(), settings.rate_limit.clone()).await?;

    web::serve(settings, db).await?;
    Ok(())
}
