//! Service entry point: `serve` runs the REST API and worker pool;
//! `api-key` subcommands give operators key management without going
//! through the HTTP surface.
//!
//! Exit codes: 0 success, 1 validation failure, 2 infrastructure
//! unavailable.

mod error;
mod middleware;
mod routes;
mod state;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use binsight_core::auth::ApiKeyStore;
use binsight_core::config::{LogFormat, Settings};
use binsight_core::kv::KvClient;
use binsight_core::model::{Permission, Tier};

#[derive(Parser)]
#[command(
    name = "binsight-server",
    about = "Binary decompilation and natural-language translation service"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the REST service and worker pool (default).
    Serve,
    /// Manage operator API keys directly against the kv store.
    ApiKey {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Issue a new API key. The raw key is printed once.
    Create {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "basic")]
        tier: String,
        /// Comma-separated permissions (read, write, admin).
        #[arg(long, value_delimiter = ',', default_value = "read")]
        permissions: Vec<String>,
        #[arg(long)]
        expires_days: Option<u32>,
    },
    /// List a user's keys.
    List {
        #[arg(long)]
        user: String,
    },
    /// Revoke a key by id.
    Revoke {
        #[arg(long)]
        user: String,
        #[arg(long)]
        key_id: String,
    },
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.server.log_level.clone()));
    match settings.server.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };
    init_tracing(&settings);

    let code = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(settings).await,
        Command::ApiKey { action } => run_key_command(settings, action).await,
    };
    std::process::exit(code);
}

async fn run_server(settings: Settings) -> i32 {
    let bind = (settings.server.host.clone(), settings.server.port);

    let app = match state::build_app(settings).await {
        Ok(app) => app,
        Err(err) => {
            tracing::error!(error = %err, "startup failed");
            return 2;
        }
    };

    let workers = app.pipeline.spawn_workers();
    tracing::info!(count = workers.len(), "worker pool started");

    let listener = match tokio::net::TcpListener::bind(bind.clone()).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(host = %bind.0, port = bind.1, error = %err, "bind failed");
            return 1;
        }
    };
    tracing::info!(host = %bind.0, port = bind.1, "listening");

    let shutdown = app.pipeline.shutdown_token();
    let router = routes::router(app);
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await;

    shutdown.cancel();
    for worker in workers {
        worker.abort();
    }

    match served {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(error = %err, "server error");
            1
        }
    }
}

async fn run_key_command(settings: Settings, action: KeyAction) -> i32 {
    let kv = match KvClient::connect(&settings.kv.url).await {
        Ok(kv) => kv,
        Err(err) => {
            eprintln!("kv store unavailable: {err}");
            return 2;
        }
    };
    let store = ApiKeyStore::new(
        kv,
        settings.security.api_key_secret.clone(),
        settings.security.api_key_prefix.clone(),
        settings.security.api_key_expiry_days,
    );

    match action {
        KeyAction::Create {
            user,
            tier,
            permissions,
            expires_days,
        } => {
            let tier = match Tier::try_from(tier.as_str()) {
                Ok(tier) => tier,
                Err(err) => {
                    eprintln!("{err}");
                    return 1;
                }
            };
            let permissions = match permissions
                .iter()
                .map(|raw| Permission::try_from(raw.as_str()))
                .collect::<Result<Vec<_>, _>>()
            {
                Ok(permissions) => permissions,
                Err(err) => {
                    eprintln!("{err}");
                    return 1;
                }
            };

            match store.create(&user, tier, permissions, expires_days).await {
                Ok(issued) => {
                    let out = json!({
                        "api_key": issued.api_key,
                        "key_id": issued.record.key_id,
                        "user_id": issued.record.user_id,
                        "tier": issued.record.tier,
                        "expires_at": issued.record.expires_at,
                    });
                    println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
                    0
                }
                Err(err) => {
                    eprintln!("key creation failed: {err}");
                    2
                }
            }
        }
        KeyAction::List { user } => match store.list_for_user(&user).await {
            Ok(keys) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&keys).unwrap_or_default()
                );
                0
            }
            Err(err) => {
                eprintln!("listing failed: {err}");
                2
            }
        },
        KeyAction::Revoke { user, key_id } => match store.revoke(&user, &key_id).await {
            Ok(true) => {
                println!("revoked {key_id}");
                0
            }
            Ok(false) => {
                eprintln!("no key {key_id} for user {user}");
                1
            }
            Err(err) => {
                eprintln!("revocation failed: {err}");
                2
            }
        },
    }
}
