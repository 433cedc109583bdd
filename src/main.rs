use clap::{Parser, Subcommand};
use kuze::{
    config::{AppConfig, SecretBackend},
    db::{self, DbPool},
    jobs,
    notify::{NotifyHooks, WebhookNotifier},
    secrets::{MemorySecretStore, SealedSecretStore, SecretGetter, SecretSetter},
    web, TokenServer,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kuze")]
#[command(about = "One-time secret entry and redemption service", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP surface and run the prune loop (default)
    Serve,
    /// Mint a one-time web-form link for a human
    IssueHuman {
        #[arg(long)]
        secret_ref: String,
        #[arg(long = "type")]
        secret_type: Option<String>,
    },
    /// Mint a short-lived redemption URL bound to an agent
    IssueAgent {
        #[arg(long)]
        agent_id: String,
        #[arg(long)]
        secret_ref: String,
        #[arg(long = "type")]
        secret_type: Option<String>,
        #[arg(long)]
        purpose: Option<String>,
    },
    /// Run one prune pass and exit
    Prune,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let config = AppConfig::init()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::IssueHuman {
            secret_ref,
            secret_type,
        } => {
            let (server, _) = build_server(config, connect(config).await?).await?;
            let resp = server
                .issue_human(&secret_ref, secret_type.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
            Ok(())
        }
        Commands::IssueAgent {
            agent_id,
            secret_ref,
            secret_type,
            purpose,
        } => {
            let (server, _) = build_server(config, connect(config).await?).await?;
            let resp = server
                .issue_agent(
                    &agent_id,
                    &secret_ref,
                    secret_type.as_deref(),
                    purpose.as_deref(),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
            Ok(())
        }
        Commands::Prune => {
            let (server, notifier) = build_server(config, connect(config).await?).await?;
            let deleted = server.prune_expired_with_notify().await?;
            println!("pruned {} token(s)", deleted);
            if let Some(notifier) = notifier {
                notifier.flush().await;
            }
            Ok(())
        }
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kuze=info,tower_http=info".into());
    let json = std::env::var("KUZE_LOG_FORMAT").is_ok_and(|v| v == "json");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn connect(config: &AppConfig) -> anyhow::Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_secs))
        .connect(&config.database.url)
        .await?;
    info!("Database connected: {}", config.database.url);

    db::init_db(&pool).await?;
    Ok(pool)
}

/// Wire the token server to the configured secret backend and notifier.
async fn build_server(
    config: &AppConfig,
    pool: DbPool,
) -> anyhow::Result<(TokenServer, Option<Arc<WebhookNotifier>>)> {
    let (setter, getter): (Arc<dyn SecretSetter>, Arc<dyn SecretGetter>) =
        match config.secrets.backend {
            SecretBackend::Memory => {
                warn!("Using in-memory secret store; secrets are lost on restart");
                let store = Arc::new(MemorySecretStore::new());
                (
                    store.clone() as Arc<dyn SecretSetter>,
                    store as Arc<dyn SecretGetter>,
                )
            }
            SecretBackend::Sealed => {
                let key = config
                    .secrets
                    .master_key
                    .as_deref()
                    .ok_or_else(|| {
                        anyhow::anyhow!("secrets.master_key is required for the sealed backend")
                    })?;
                let store = Arc::new(SealedSecretStore::connect(pool.clone(), key).await?);
                (
                    store.clone() as Arc<dyn SecretSetter>,
                    store as Arc<dyn SecretGetter>,
                )
            }
        };

    let notifier = match &config.notify.webhook_url {
        Some(url) if !url.is_empty() => {
            info!("Chat webhook notifications enabled");
            Some(Arc::new(WebhookNotifier::new(
                url.clone(),
                Duration::from_secs(config.notify.timeout_secs),
            )?))
        }
        _ => None,
    };
    let hooks = match &notifier {
        Some(notifier) => notifier.clone().hooks(),
        None => NotifyHooks::new(),
    };

    let server = TokenServer::new(pool, &config.server.base_url)
        .with_ttl(config.server.ttl())
        .with_secret_setter(setter)
        .with_secret_getter(getter)
        .with_hooks(hooks);
    Ok((server, notifier))
}

async fn serve(config: &'static AppConfig) -> anyhow::Result<()> {
    info!("Starting Kuze v{}", env!("CARGO_PKG_VERSION"));

    let pool = connect(config).await?;
    let (server, notifier) = build_server(config, pool).await?;
    let server = Arc::new(server);
    info!(
        "Token server ready: base_url={}, ttl={}s",
        server.base_url(),
        server.ttl().as_secs()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let prune_handle = jobs::prune::spawn(
        server.clone(),
        config.prune_interval(),
        shutdown_rx.clone(),
    );

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        }
        let _ = shutdown_tx.send(true);
    });

    // Issuance routes either share the public listener or get their own.
    let app = match config.server.admin_bind_addr() {
        Some(admin_addr) => {
            let admin_listener = TcpListener::bind(&admin_addr).await?;
            info!("Admin issuance server listening on http://{}", admin_addr);
            let admin_app = web::with_tracing(web::admin_router(server.clone()));
            let admin_shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = axum::serve(admin_listener, admin_app)
                    .with_graceful_shutdown(wait_for_shutdown(admin_shutdown))
                    .await
                {
                    error!("Admin server error: {}", e);
                }
            });
            web::with_tracing(web::public_router(server.clone()))
        }
        None => web::create_router(server.clone()),
    };

    let web_addr = config.server.bind_addr();
    let listener = TcpListener::bind(&web_addr).await?;
    info!("Web server listening on http://{}", web_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await?;

    if let Err(e) = prune_handle.await {
        error!("Prune loop panicked: {}", e);
    }
    if let Some(notifier) = notifier {
        notifier.flush().await;
    }
    info!("Kuze shut down gracefully");
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
