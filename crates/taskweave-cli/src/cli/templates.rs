//! `templates`: list the bundled workflows or print one.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use crate::templates::{TEMPLATES, find};

pub fn handle_templates(name: Option<&str>, output: Option<&Path>, json: bool) -> Result<()> {
    let Some(name) = name else {
        return list(json);
    };
    let Some(template) = find(name) else {
        let known: Vec<&str> = TEMPLATES.iter().map(|t| t.name).collect();
        bail!("Unknown template '{name}'. Available: {}", known.join(", "));
    };

    match output {
        Some(path) => {
            std::fs::write(path, template.yaml)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            if !json {
                println!(
                    "  {} Wrote '{}' to {}",
                    style("✓").green().bold(),
                    template.name,
                    path.display()
                );
            }
        }
        None if json => {
            let workflow = template.workflow()?;
            println!("{}", serde_json::to_string_pretty(&workflow)?);
        }
        None => print!("{}", template.yaml),
    }
    Ok(())
}

fn list(json: bool) -> Result<()> {
    let mut rows = Vec::with_capacity(TEMPLATES.len());
    for template in TEMPLATES {
        let workflow = template
            .workflow()
            .with_context(|| format!("Bundled template '{}' is invalid", template.name))?;
        rows.push(workflow);
    }

    if json {
        let out: Vec<_> = rows
            .iter()
            .map(|w| {
                serde_json::json!({
                    "name": w.id,
                    "title": w.name,
                    "description": w.description,
                    "tasks": w.tasks.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Template").fg(Color::Cyan),
            Cell::new("Tasks"),
            Cell::new("Description"),
        ]);
    for workflow in &rows {
        table.add_row(vec![
            Cell::new(&workflow.id),
            Cell::new(workflow.tasks.len()),
            Cell::new(workflow.description.as_deref().unwrap_or("").trim()),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskweave_core::workflow::definition::load_workflow_file;

    #[test]
    fn written_template_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.yaml");
        handle_templates(Some("price-monitoring"), Some(path.as_path()), true).unwrap();

        let workflow = load_workflow_file(&path).unwrap();
        assert_eq!(workflow.id, "price-monitoring");
        assert_eq!(workflow.tasks[0].on_error.as_deref(), Some("report_outage"));
    }

    #[test]
    fn unknown_template_lists_available() {
        let err = handle_templates(Some("ghost"), None, false).unwrap_err();
        assert!(err.to_string().contains("form-filling"));
    }
}
