use std::path::Path;

use anyhow::{Context, Result};
use pgstep::{load_script, MigrateConfig, PgDatabase, ScriptSteps};
use tracing::{info, warn};

pub async fn run(script: &Path, config: MigrateConfig) -> Result<()> {
    let steps = load_script(script).with_context(|| format!("Failed to parse {}", script.display()))?;
    let mut source = ScriptSteps::new(steps);
    info!("Loaded {} step(s) from {}", source.len(), script.display());

    let db = PgDatabase::connect(&config.connection()?).await?;

    // Ctrl-C stops the current step on the server and drops the lock
    let cancel = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let result = db
        .run_migrations_until(&config.ledger_table, &mut source, cancel)
        .await;
    db.close().await;
    let report = result.context("Migration failed")?;

    if report.resume_index as usize > source.len() + 1 {
        warn!(
            "Ledger {} is at step {} but the script only has {} step(s)",
            config.ledger_table,
            report.resume_index - 1,
            source.len()
        );
    }

    if report.applied.is_empty() {
        println!("Nothing to apply, {} is up to date", config.ledger_table);
        return Ok(());
    }
    for step in &report.applied {
        println!("applied {:>4}  {}.{}", step.index, step.name, step.sequence_no);
    }
    println!(
        "Applied {} step(s) in {}ms",
        report.applied_count(),
        report.elapsed.as_millis()
    );
    Ok(())
}
