use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ratewise_client::{ApiClient, CooldownState, RequestConfig, SqliteStorage};
use ratewise_core::Config;
use tokio_util::sync::CancellationToken;

const USAGE: &str = "Usage: ratewise [status | clear | get <path> | watch]";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize core
    ratewise_core::init()?;

    let (config, _validation) = Config::load_validated()?;

    let storage = SqliteStorage::open(&config.cooldown.storage_path)
        .with_context(|| format!("Failed to open {}", config.cooldown.storage_path))?;
    let client = ApiClient::from_config(&config, Arc::new(storage.clone()))?;

    tracing::info!("Ratewise started against {}", client.base_url());

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str).unwrap_or("status") {
        "status" => print_status(&client),
        "clear" => {
            client.clear_cooldown();
            println!("Cooldown cleared");
        }
        "get" => {
            let path = args.get(1).context(USAGE)?;
            let response = client
                .perform_request::<serde_json::Value>(
                    reqwest::Method::GET,
                    path,
                    None,
                    RequestConfig::new(),
                )
                .await;
            match response {
                Ok(body) => println!("{}", serde_json::to_string_pretty(&body)?),
                Err(e) => {
                    tracing::error!("Request failed: {}", e);
                    println!("{}", e.user_message());
                }
            }
        }
        "watch" => watch(&client, &storage, &config).await?,
        other => anyhow::bail!("Unknown command {}. {}", other, USAGE),
    }

    Ok(())
}

fn print_status(client: &ApiClient) {
    match client.cooldown().read() {
        Some(record) => println!(
            "Cooling down: {}s remaining (until {})",
            client.remaining_cooldown_seconds(),
            record.expires_at.to_rfc3339()
        ),
        None => println!("No active cooldown"),
    }
}

/// Follow the shared cooldown until Ctrl-C.
async fn watch(client: &ApiClient, storage: &SqliteStorage, config: &Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let watcher = storage.spawn_watcher(
        Duration::from_millis(config.cooldown.poll_interval_ms),
        cancel.clone(),
    );
    let (sync, task) = client.start_sync(cancel.clone());
    let mut state = sync.watch();

    print_status(client);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                match current {
                    CooldownState::Idle => println!("Cooldown ended"),
                    CooldownState::Cooling { retry_after_seconds, .. } => println!(
                        "Cooling down for {}s ({}s remaining)",
                        retry_after_seconds,
                        sync.remaining_seconds()
                    ),
                }
            }
        }
    }

    // Graceful shutdown
    cancel.cancel();
    let _ = tokio::join!(watcher, task);
    Ok(())
}
