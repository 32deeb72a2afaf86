use std::fmt::Write;
use std::path::Path;

use anyhow::{Context, Result};
use pgstep::{load_script, MigrationStep};
use serde::Serialize;

#[derive(Serialize)]
struct StepOutput<'a> {
    index: usize,
    name: &'a str,
    sequence_no: u32,
    sql: &'a str,
}

pub fn run(script: &Path, json: bool) -> Result<()> {
    let steps = load_script(script).with_context(|| format!("Failed to parse {}", script.display()))?;

    if json {
        println!("{}", render_json(&steps)?);
    } else {
        print!("{}", render_text(&steps));
    }
    Ok(())
}

fn render_json(steps: &[MigrationStep]) -> Result<String> {
    let output: Vec<_> = steps
        .iter()
        .enumerate()
        .map(|(i, step)| StepOutput {
            index: i + 1,
            name: &step.name,
            sequence_no: step.sequence_no,
            sql: &step.sql,
        })
        .collect();
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Steps grouped under their block headers, one per line
fn render_text(steps: &[MigrationStep]) -> String {
    let mut out = String::new();
    let mut block: Option<&str> = None;

    for (i, step) in steps.iter().enumerate() {
        if block != Some(step.name.as_str()) {
            let _ = writeln!(out, "# {}", step.name);
            block = Some(&step.name);
        }
        let _ = writeln!(out, "{:>4}  {}.{}  {}", i + 1, step.name, step.sequence_no, step.sql);
    }
    let _ = writeln!(out, "{} step(s)", steps.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps() -> Vec<MigrationStep> {
        vec![
            MigrationStep::new("v1", 1, "CREATE TABLE a (id int);"),
            MigrationStep::new("v1", 2, "CREATE TABLE b (id int);"),
            MigrationStep::new("v2", 1, "DROP TABLE a;"),
        ]
    }

    #[test]
    fn test_render_text_groups_blocks() {
        let text = render_text(&steps());

        assert_eq!(
            text,
            "# v1\n   1  v1.1  CREATE TABLE a (id int);\n   2  v1.2  CREATE TABLE b (id int);\n\
             # v2\n   3  v2.1  DROP TABLE a;\n3 step(s)\n"
        );
    }

    #[test]
    fn test_render_json() {
        let json: serde_json::Value = serde_json::from_str(&render_json(&steps()).unwrap()).unwrap();

        assert_eq!(json[2]["index"], 3);
        assert_eq!(json[2]["name"], "v2");
        assert_eq!(json[1]["sequence_no"], 2);
    }

    #[test]
    fn test_run_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.sql");
        std::fs::write(&path, "SELECT 1;").unwrap();

        let err = run(&path, false).unwrap_err();
        assert!(format!("{:#}", err).contains("outside a block"));
    }
}
