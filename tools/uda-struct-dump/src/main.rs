// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! uda-struct-dump - Decode UDA structure transfers
//!
//! Reads a side-channel file (plain XDR: type list then carrier data) or a
//! record-marked capture of a full transfer, and prints the type registry,
//! the allocation ledger and the reconstructed structure tree.

use anyhow::Context;
use clap::Parser;
use colored::*;
use serde_json::{json, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uda_structs::envelope::decode_file_at;
use uda_structs::print::{ledger_table, tree_outline, write_type};
use uda_structs::{
    receive_structures, NodeId, ProtocolConfig, RecordReader, StructTree, StructuredResponse,
    XdrDecoder,
};

/// Decode UDA structure transfers
#[derive(Parser, Debug)]
#[command(name = "uda-struct-dump")]
#[command(version = "0.1.0")]
#[command(about = "Decode and print UDA structure transfers")]
struct Args {
    /// Side-channel file, or a record capture with --capture
    #[arg()]
    file: PathBuf,

    /// Output format: pretty, json
    #[arg(short, long, default_value = "pretty")]
    format: OutputFormat,

    /// Input is a record-marked capture starting with the package type
    #[arg(long)]
    capture: bool,

    /// Print the type registry
    #[arg(long)]
    types: bool,

    /// Print the allocation ledger
    #[arg(long)]
    ledger: bool,

    /// Print the structure tree
    #[arg(long)]
    tree: bool,

    /// Protocol version the data was written with
    #[arg(long)]
    protocol_version: Option<i32>,

    /// Maximum nesting depth accepted while decoding
    #[arg(long)]
    max_depth: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Clone, Debug)]
enum OutputFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "p" => Ok(OutputFormat::Pretty),
            "json" | "j" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

/// Sections to print; none selected means all of them.
struct Sections {
    types: bool,
    ledger: bool,
    tree: bool,
}

impl Sections {
    fn from_args(args: &Args) -> Self {
        let all = !(args.types || args.ledger || args.tree);
        Self {
            types: all || args.types,
            ledger: all || args.ledger,
            tree: all || args.tree,
        }
    }
}

fn main() {
    let args = Args::parse();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&args) {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let mut config = ProtocolConfig::from_env().context("reading UDA_* environment")?;
    if let Some(version) = args.protocol_version {
        config.protocol_version = version;
    }
    if let Some(depth) = args.max_depth {
        config.max_recursive_depth = depth;
    }
    config.validate()?;

    let response = if args.capture {
        let file = File::open(&args.file)
            .with_context(|| format!("opening {}", args.file.display()))?;
        let mut dec = XdrDecoder::new(RecordReader::new(BufReader::new(file)));
        receive_structures(&mut dec, &config)
    } else {
        decode_file_at(&args.file, &config)
    }
    .with_context(|| format!("decoding {}", args.file.display()))?;
    tracing::info!(
        "decoded {} nodes from {}",
        response.tree().node_count(),
        args.file.display()
    );

    let sections = Sections::from_args(args);
    match args.format {
        OutputFormat::Pretty => print_pretty(&response, &sections)?,
        OutputFormat::Json => print_json(&response, &sections)?,
    }
    Ok(())
}

fn print_pretty(response: &StructuredResponse, sections: &Sections) -> anyhow::Result<()> {
    println!();
    println!(
        "{} {} x {}",
        "=== Structures ===".bold(),
        response.count()?.to_string().yellow(),
        response.element_type()?.cyan()
    );

    if sections.types {
        println!();
        println!("{}", "--- Types ---".dimmed());
        for udt in response.registry().iter() {
            let mut block = String::new();
            write_type(&mut block, udt);
            let mut lines = block.lines();
            if let Some(title) = lines.next() {
                println!("{}", title.green());
            }
            for line in lines {
                println!("{}", line);
            }
            println!();
        }
    }

    if sections.ledger {
        println!("{}", "--- Allocations ---".dimmed());
        print!("{}", ledger_table(response.ledger()));
        println!();
    }

    if sections.tree {
        println!("{}", "--- Tree ---".dimmed());
        print!("{}", tree_outline(response.tree(), response.root()));
        println!();
    }
    Ok(())
}

fn print_json(response: &StructuredResponse, sections: &Sections) -> anyhow::Result<()> {
    let mut out = serde_json::Map::new();
    out.insert("count".into(), json!(response.count()?));
    out.insert("type".into(), json!(response.element_type()?));
    if sections.types {
        let types: Vec<_> = response.registry().iter().map(|u| u.as_ref()).collect();
        out.insert("types".into(), serde_json::to_value(types)?);
    }
    if sections.ledger {
        let records: Vec<_> = response.ledger().iter().collect();
        out.insert("ledger".into(), serde_json::to_value(records)?);
    }
    if sections.tree {
        out.insert("tree".into(), tree_json(response.tree(), response.root()));
    }
    println!("{}", serde_json::to_string_pretty(&Value::Object(out))?);
    Ok(())
}

fn tree_json(tree: &StructTree, id: NodeId) -> Value {
    let node = tree.node(id);
    json!({
        "name": node.name,
        "type": node.type_name(),
        "data": node.data.to_string(),
        "children": tree
            .children(id)
            .iter()
            .map(|&c| tree_json(tree, c))
            .collect::<Vec<_>>(),
    })
}
