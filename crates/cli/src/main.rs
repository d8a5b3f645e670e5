//! # gridcalc-cli
//!
//! Command-line driver for the gridcalc formula engine.

mod sheet;

use anyhow::{Context, Result};
use clap::Parser;
use gridcalc_formulas::{EngineConfig, FormulaEngine};
use serde::Serialize;
use sheet::{CellInput, SheetFile};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// gridcalc - evaluate a sheet of formulas
#[derive(Parser)]
#[command(name = "gridcalc")]
#[command(author, version, about = "Spreadsheet formula engine", long_about = None)]
struct Cli {
    /// Sheet file (.yaml, .yml or .json)
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Engine configuration file, overrides the sheet's `config` section
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Edit a cell after loading (CELL=INPUT)
    #[arg(short = 'D', long = "set", value_name = "CELL=INPUT")]
    edits: Vec<String>,

    /// Output format (json, csv, table)
    #[arg(short = 'f', long = "format", default_value = "table")]
    format: OutputFormat,

    /// Print the dependency graph instead of cell values
    #[arg(long)]
    graph: bool,

    /// Print engine statistics after the cell values
    #[arg(long)]
    stats: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Output format for results.
#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    /// JSON output
    Json,
    /// CSV output
    Csv,
    /// Aligned table output (default)
    #[default]
    Table,
}

/// One row of cell output.
#[derive(Debug, Serialize)]
struct CellRow {
    cell: String,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    formula: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }

    let sheet = SheetFile::load(&cli.file)?;
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => sheet.config.clone().unwrap_or_default(),
    };
    let engine = sheet::build_engine(&sheet, config)?;

    for edit in &cli.edits {
        let (cell, input) = edit.split_once('=').with_context(|| {
            format!("Invalid edit format: '{edit}'. Expected CELL=INPUT format")
        })?;
        sheet::apply_input(&engine, cell.trim(), &CellInput::Text(input.to_string()))?;
    }

    if cli.graph {
        println!("{}", serde_json::to_string_pretty(&engine.export_graph())?);
        return Ok(());
    }

    let rows = collect_rows(&engine)?;
    print!("{}", render(&rows, cli.format)?);

    if cli.stats {
        println!("{}", serde_json::to_string_pretty(&engine.statistics())?);
    }
    Ok(())
}

/// Every stored cell in row-major order.
fn collect_rows(engine: &FormulaEngine) -> Result<Vec<CellRow>> {
    let storage = engine.storage();
    let Some(range) = storage.used_range() else {
        return Ok(Vec::new());
    };
    let cells = storage
        .cells_in_range(&range)
        .context("Failed to read cells")?;
    Ok(cells
        .into_iter()
        .map(|(coord, cell)| CellRow {
            cell: coord.to_a1(),
            value: cell.value().to_string(),
            formula: cell.formula().map(str::to_string),
        })
        .collect())
}

fn render(rows: &[CellRow], format: OutputFormat) -> Result<String> {
    let mut out = String::new();
    match format {
        OutputFormat::Json => {
            out.push_str(&serde_json::to_string_pretty(rows)?);
            out.push('\n');
        }
        OutputFormat::Csv => {
            out.push_str("cell,value,formula\n");
            for row in rows {
                writeln!(
                    out,
                    "{},{},{}",
                    row.cell,
                    csv_field(&row.value),
                    csv_field(row.formula.as_deref().unwrap_or(""))
                )?;
            }
        }
        OutputFormat::Table => {
            let cell_width = rows.iter().map(|r| r.cell.len()).max().unwrap_or(0).max(4);
            let value_width = rows.iter().map(|r| r.value.len()).max().unwrap_or(0).max(5);
            writeln!(out, "{:<cell_width$}  {:<value_width$}  FORMULA", "CELL", "VALUE")?;
            for row in rows {
                let line = format!(
                    "{:<cell_width$}  {:<value_width$}  {}",
                    row.cell,
                    row.value,
                    row.formula.as_deref().unwrap_or("")
                );
                writeln!(out, "{}", line.trim_end())?;
            }
        }
    }
    Ok(out)
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}
