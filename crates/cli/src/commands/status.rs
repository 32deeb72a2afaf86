use std::fmt::Write;

use anyhow::Result;
use pgstep::{LedgerRecord, MigrateConfig, PgDatabase};

pub async fn run(config: MigrateConfig, json: bool) -> Result<()> {
    let db = PgDatabase::connect(&config.connection()?).await?;
    let records = db.applied_steps(&config.ledger_table).await;
    db.close().await;
    let records = records?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print!("{}", render_records(&config.ledger_table, &records));
    }
    Ok(())
}

fn render_records(table: &str, records: &[LedgerRecord]) -> String {
    let mut out = String::new();
    if records.is_empty() {
        let _ = writeln!(out, "No steps recorded in {}", table);
        return out;
    }

    let _ = writeln!(out, "{:>6}  {:<32} {:>8}  executed at", "id", "name", "sequence");
    for record in records {
        let _ = writeln!(
            out,
            "{:>6}  {:<32} {:>8}  {}",
            record.id,
            record.name,
            record.sequence,
            record.executed_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    let next = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
    let _ = writeln!(out, "{} step(s) applied, next step is {}", records.len(), next);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_render_empty_ledger() {
        assert_eq!(render_records("migrations", &[]), "No steps recorded in migrations\n");
    }

    #[test]
    fn test_render_records() {
        let records = vec![LedgerRecord {
            id: 1,
            name: "v1".to_string(),
            sequence: 1,
            executed_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        }];
        let text = render_records("migrations", &records);

        assert!(text.contains("2024-05-01 12:30:00"));
        assert!(text.ends_with("1 step(s) applied, next step is 2\n"));
    }
}
