//! The billing worker binary: parses its configuration, stands up a
//! `BillDatabase` backend, runs migrations, and serves the HTTP API
//! backed by an in-process [`host::LocalHost`].

use std::net::SocketAddr;
use std::sync::Arc;

use activities::RetryPolicy;
use anyhow::{Context, Result};
use api::auth::DummyTokenVerifier;
use api::http::{self, AppState};
use clap::Parser;
use db::{BillDatabase, MemBillDatabase, PgBillDatabase};
use domain::UuidBillIdGenerator;
use host::LocalHost;

/// The billing workflow worker.
#[derive(Parser, Debug)]
#[command(name = "billing-worker", about = "Serves the billing HTTP API and hosts its workflows")]
struct Args {
    /// Namespaces the task queue name as `<environment>-billing`.
    #[arg(long, env = "BILLING_ENVIRONMENT", default_value = "dev")]
    environment: String,

    /// Task queue name; defaults to `<environment>-billing`.
    #[arg(long, env = "BILLING_TASK_QUEUE")]
    task_queue: Option<String>,

    /// Address the HTTP server binds to.
    #[arg(long, env = "BILLING_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    /// Postgres connection string. Ignored when `--in-memory` is set.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Use an in-process, non-persistent database instead of Postgres.
    #[arg(long, env = "BILLING_IN_MEMORY", default_value_t = false)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let task_queue = args
        .task_queue
        .clone()
        .unwrap_or_else(|| format!("{}-billing", args.environment));
    tracing::info!(task_queue, http_addr = %args.http_addr, in_memory = args.in_memory, "starting billing worker");

    let db: Arc<dyn BillDatabase> = if args.in_memory {
        Arc::new(MemBillDatabase::new())
    } else {
        let database_url = args
            .database_url
            .context("--database-url (or DATABASE_URL) is required unless --in-memory is set")?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&database_url)
            .await
            .context("connecting to postgres")?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("running migrations")?;
        Arc::new(PgBillDatabase::new(pool))
    };

    let host: Arc<dyn host::Host> = Arc::new(LocalHost::new(Arc::clone(&db), RetryPolicy::default()));
    let app_state = AppState {
        host,
        db,
        id_generator: Arc::new(UuidBillIdGenerator),
        token_verifier: Arc::new(DummyTokenVerifier::new()),
    };

    let router = http::router(app_state);
    let listener = tokio::net::TcpListener::bind(args.http_addr)
        .await
        .with_context(|| format!("binding {}", args.http_addr))?;
    axum::serve(listener, router)
        .await
        .context("serving http")?;

    Ok(())
}
