use anyhow::Context;
use chrono::Utc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use change_intake::config::EngineConfig;
use change_intake::store::{ItemStatus, JsonlRecordStore, RecordStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Console logging, plus a daily-rolling file when INTAKE_LOG_DIR is set
    let (file_layer, _guard) = match std::env::var("INTAKE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "change-intake.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let config = EngineConfig::from_env().context("Invalid INTAKE_* configuration")?;

    eprintln!("📋 change-intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Store: {}", config.store_path.display());
    eprintln!("   Stale after: {}h\n", config.stale_hours);

    let (store, load) = JsonlRecordStore::open(&config.store_path)
        .await
        .with_context(|| format!("Failed to open store at {}", config.store_path.display()))?;

    if load.lines_quarantined > 0 {
        eprintln!(
            "⚠️  {} corrupted line(s) moved to {}",
            load.lines_quarantined,
            load.quarantine_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
    }

    let items = store.all().await.context("Failed to read items")?;
    println!("Items: {}", items.len());
    for status in ItemStatus::ALL {
        let count = items.iter().filter(|i| i.status == status).count();
        if count > 0 {
            println!("  {:<24} {count}", status.as_str());
        }
    }

    let stale = store
        .find_stale(config.stale_after())
        .await
        .context("Failed to query stale items")?;
    if stale.is_empty() {
        println!("\nNo stale items.");
    } else {
        println!("\nStale items ({}):", stale.len());
        let now = Utc::now();
        for item in &stale {
            let idle_hours = (now - item.timestamp).num_hours();
            println!(
                "  {}  {:<24} idle {idle_hours}h  {}",
                item.item_id,
                item.status.as_str(),
                item.subject
            );
        }
    }

    Ok(())
}
