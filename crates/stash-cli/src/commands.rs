use std::sync::Arc;

use colored::Colorize;
use serde_json::json;

use stash_node::{HandleAllocator, NodeSave, StorageNode};
use stash_registry::StashConfig;

use crate::cli::*;
use crate::sim::{self, SimOptions, SimSummary};

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => StashConfig::load(path)?,
        None => StashConfig::default(),
    };
    match cli.command {
        Command::Simulate(args) => cmd_simulate(&config, args, &cli.format),
        Command::Inspect(args) => cmd_inspect(&config, args, &cli.format),
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn cmd_simulate(
    config: &StashConfig,
    args: SimulateArgs,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    if let Some(dir) = &args.save_dir {
        std::fs::create_dir_all(dir)?;
    }
    let opts = SimOptions {
        regions: args.regions,
        nodes_per_region: args.nodes_per_region,
        ticks: args.ticks,
        workers: args.workers,
        seed: args.seed,
        save_dir: args.save_dir,
    };
    let summary = sim::run(config, &opts)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary_json(&summary))?)
        }
        OutputFormat::Text => print_summary(&summary),
    }

    if !summary.conserved() {
        anyhow::bail!("material was created or destroyed during the run");
    }
    Ok(())
}

fn print_summary(s: &SimSummary) {
    println!(
        "Simulated {} ticks across {} nodes",
        s.ticks.to_string().bold(),
        s.nodes.to_string().bold()
    );
    println!(
        "  Withdrawals: {} ({} unsupplied)",
        s.withdrawals.to_string().cyan(),
        s.unsupplied
    );
    println!(
        "  Tasks: {} completed, {} cancelled, {} hauls, {} abandoned",
        s.completed.to_string().green(),
        s.cancelled.to_string().yellow(),
        s.hauled,
        s.abandoned.to_string().dimmed()
    );
    println!(
        "  Buffer: {} materialized, {} demoted, {} background scans",
        s.materialized, s.demoted, s.dispatched
    );
    if let Some(stats) = &s.scheduler {
        println!(
            "  Scheduler: {} workers, {} jobs run, {} panicked, {} rejected",
            stats.workers, stats.executed, stats.panicked, stats.rejected
        );
    }

    println!();
    println!(
        "  {:<12} {:>10} {:>10} {:>10} {:>10}",
        "material".bold(),
        "deposited",
        "consumed",
        "stored",
        "buffered"
    );
    for (material, t) in &s.tallies {
        let mark = if t.balanced() { "✓".green() } else { "✗".red().bold() };
        println!(
            "{} {:<12} {:>10} {:>10} {:>10} {:>10}",
            mark,
            material.as_str(),
            t.deposited,
            t.consumed,
            t.stored,
            t.buffered
        );
    }
    println!();
    if s.conserved() {
        println!("{} Every unit accounted for.", "✓".green().bold());
    } else {
        println!("{} Conservation violated.", "✗".red().bold());
    }
    for path in &s.saved {
        println!("  saved {}", path.display().to_string().blue());
    }
}

fn summary_json(s: &SimSummary) -> serde_json::Value {
    let tallies: serde_json::Map<String, serde_json::Value> = s
        .tallies
        .iter()
        .map(|(material, t)| {
            (
                material.to_string(),
                json!({
                    "deposited": t.deposited,
                    "consumed": t.consumed,
                    "stored": t.stored,
                    "buffered": t.buffered,
                    "balanced": t.balanced(),
                }),
            )
        })
        .collect();
    json!({
        "ticks": s.ticks,
        "nodes": s.nodes,
        "withdrawals": s.withdrawals,
        "unsupplied": s.unsupplied,
        "completed": s.completed,
        "cancelled": s.cancelled,
        "hauled": s.hauled,
        "abandoned": s.abandoned,
        "materialized": s.materialized,
        "demoted": s.demoted,
        "dispatched": s.dispatched,
        "scheduler": s.scheduler.as_ref().map(|st| json!({
            "workers": st.workers,
            "executed": st.executed,
            "panicked": st.panicked,
            "rejected": st.rejected,
        })),
        "conserved": s.conserved(),
        "tallies": tallies,
        "saved": s.saved.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
    })
}

fn cmd_inspect(
    config: &StashConfig,
    args: InspectArgs,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let save = NodeSave::read_from(&args.path)?;
    if let OutputFormat::Json = format {
        println!("{}", save.to_json()?);
        return Ok(());
    }

    let (node, report) = StorageNode::restore(
        save,
        config.node.clone(),
        Arc::new(config.materials.clone()),
        HandleAllocator::new(),
    );
    println!(
        "Node {} ({})",
        node.name().bold(),
        node.id().to_string().cyan()
    );
    let ledger = node.ledger();
    println!(
        "  Records: {}/{}  Units: {}",
        ledger.record_count(),
        ledger.capacity(),
        ledger.total_units().to_string().bold()
    );
    for (module, capacity) in ledger.expansions() {
        println!("  Expansion {} +{}", module.yellow(), capacity);
    }
    for record in ledger.records() {
        let durability = if record.durability() > 0.0 {
            format!(" (durability {:.1})", record.durability())
        } else {
            String::new()
        };
        println!("    {:>8}  {}{}", record.quantity(), record.key(), durability.dimmed());
    }
    if report.is_clean() {
        println!("{} Save is consistent.", "✓".green().bold());
    } else {
        for recovery in &report.recoveries {
            println!("  {} {:?}", "recovered:".yellow(), recovery);
        }
    }
    Ok(())
}
