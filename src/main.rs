//! Team data store administration binary.
//!
//! Opens one session from the environment and runs a single command.
//! Logs go to stderr; command output goes to stdout.
//!
//! Coverage is excluded because the binary only wires configuration to
//! library calls that are tested on their own.

// Enable the coverage attribute when running with nightly for llvm-cov exclusions
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use team_store::config::Config;
use team_store::error::AppError;
use team_store::storage::TeamStore;

const USAGE: &str = "usage: team-store <bootstrap|tables|users|active|reconcile>";

#[cfg_attr(coverage_nightly, coverage(off))]
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("LOG_LEVEL")
                .unwrap_or_else(|_| "info".to_string())
                .parse()
                .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let Some(command) = std::env::args().nth(1) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    if let Err(e) = run(&command).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn run(command: &str) -> Result<(), AppError> {
    let config = Config::from_env()?;
    tracing::info!(
        "Configuration loaded: database={}, user={}",
        config.database_path,
        config.user
    );

    let store = TeamStore::open(&config).await?;
    let result = dispatch(&store, command).await;
    store.quit().await?;
    result
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn dispatch(store: &TeamStore, command: &str) -> Result<(), AppError> {
    match command {
        // Opening as root already ran the idempotent bootstrap.
        "bootstrap" => {
            store.bootstrap().await?;
            println!("catalog ready at {}", store.connection().database_path().display());
        }
        "tables" => {
            let inited = store.get_inited_table_list().await?;
            for name in store.get_table_list().await? {
                let state = if inited.contains(&name) { "initialized" } else { "empty" };
                println!("{name}\t{state}");
            }
        }
        "users" => {
            for name in store.get_user_list(None).await? {
                if let Some(user) = store.get_user(&name).await? {
                    println!("{}\t{}\t{}", user.name, user.role.as_str(), user.access.as_str());
                }
            }
        }
        "active" => {
            for user in store.get_active_user_list(None).await? {
                println!("{}\t{}", user.name, user.host);
            }
        }
        "reconcile" => {
            for (name, diff) in store.reconcile_all_grants().await? {
                println!(
                    "{name}\t+{}\t-{}",
                    diff.granted.len(),
                    diff.revoked.len()
                );
            }
        }
        other => {
            eprintln!("unknown command: {other}\n{USAGE}");
            std::process::exit(2);
        }
    }
    Ok(())
}
