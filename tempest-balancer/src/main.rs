//! Tempest Balancer Simulator
//!
//! Drives the engine against a cluster snapshot loaded from JSON. Every
//! cycle's placements and relocations are applied to the in-memory snapshot
//! and recoveries complete before the next cycle, until the engine reports
//! BALANCED, ON_HOLD or NO_OP or the cycle cap is reached.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tempest_balancer::{
    AwarenessDecider, BalanceCoordinator, BalanceDecision, BalancerConfig, ConstraintChain,
    CycleOutcome, DiskThresholdDecider, FilterDecider, ThrottleDecider,
};
use tempest_core::ClusterSnapshot;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tempest-balancer")]
#[command(about = "Run the Tempest balancing engine against a cluster snapshot")]
struct Cli {
    /// Cluster snapshot (JSON)
    #[arg(long)]
    snapshot: PathBuf,

    /// Balancer configuration (TOML); TEMPEST_* variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum number of cycles
    #[arg(long, default_value = "100")]
    cycles: usize,

    /// Pause between cycles in milliseconds
    #[arg(long, default_value = "0")]
    interval_ms: u64,

    /// Seed for tie-breaking (overrides the configuration)
    #[arg(long)]
    seed: Option<u64>,

    /// Never place copies on these node ids
    #[arg(long = "exclude-node")]
    exclude_nodes: Vec<String>,

    /// Spread copies of a shard across values of this node attribute
    #[arg(long)]
    awareness: Option<String>,

    /// Disk high watermark (0.0 - 1.0)
    #[arg(long)]
    disk_watermark: Option<f64>,

    /// Maximum concurrent incoming relocations per node
    #[arg(long)]
    max_incoming: Option<usize>,

    /// Write the final snapshot here
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print outcomes and the final report as JSON
    #[arg(long, default_value = "false")]
    json: bool,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<BalancerConfig> {
        let mut config = match &self.config {
            Some(path) => BalancerConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?
                .with_env_overrides()?,
            None => BalancerConfig::from_env()?,
        };

        if let Some(seed) = self.seed {
            config.random_seed = Some(seed);
        }
        Ok(config)
    }

    fn constraint_chain(&self) -> anyhow::Result<ConstraintChain> {
        let mut chain = ConstraintChain::with_defaults();

        if !self.exclude_nodes.is_empty() {
            let excluded: Vec<&str> = self.exclude_nodes.iter().map(String::as_str).collect();
            chain.push(FilterDecider::new().exclude("_id", &excluded)?);
        }
        if let Some(attribute) = &self.awareness {
            chain.push(AwarenessDecider::new(attribute.clone()));
        }
        if let Some(watermark) = self.disk_watermark {
            chain.push(DiskThresholdDecider::new(watermark)?);
        }
        if let Some(max_incoming) = self.max_incoming {
            chain.push(ThrottleDecider::new(max_incoming));
        }

        Ok(chain)
    }
}

struct Simulator {
    engine: BalanceCoordinator,
    snapshot: ClusterSnapshot,
    cycles: usize,
    interval: Duration,
    json: bool,
}

impl Simulator {
    async fn run(&mut self) -> anyhow::Result<()> {
        info!(
            nodes = self.snapshot.nodes.len(),
            shards = self.snapshot.shards.len(),
            cycles = self.cycles,
            "Simulation started"
        );

        for cycle in 1..=self.cycles {
            let outcome = self.engine.allocate(&self.snapshot);
            self.print_outcome(cycle, &outcome)?;

            match outcome.decision {
                BalanceDecision::Balancing => self.apply(&outcome)?,
                BalanceDecision::Balanced | BalanceDecision::NoOp => break,
                BalanceDecision::OnHold => {
                    if self.snapshot.settle() == 0 {
                        warn!("No progress possible, stopping");
                        break;
                    }
                    continue;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }

            let settled = self.snapshot.settle();
            info!(cycle, settled, "Recoveries completed");
        }

        self.print_report()?;
        info!("Simulation finished");
        Ok(())
    }

    fn apply(&mut self, outcome: &CycleOutcome) -> anyhow::Result<()> {
        for assignment in &outcome.assignments {
            self.snapshot
                .start_shard(&assignment.shard_id, assignment.primary, &assignment.node)?;
        }
        for mv in &outcome.moves {
            self.snapshot
                .relocate_shard(&mv.shard_id, mv.primary, &mv.from, &mv.to)?;
        }
        Ok(())
    }

    fn print_outcome(&self, cycle: usize, outcome: &CycleOutcome) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(outcome)?);
            return Ok(());
        }

        println!(
            "cycle {}: {} ({} placements, {} moves, score {:.6})",
            cycle,
            outcome.decision,
            outcome.assignments.len(),
            outcome.moves.len(),
            outcome.score
        );
        for assignment in &outcome.assignments {
            let kind = if assignment.primary { "p" } else { "r" };
            println!("  place {}[{}] on {}", assignment.shard_id, kind, assignment.node);
        }
        for mv in &outcome.moves {
            println!("  move {} (delta {:.6}, risk {:?})", mv, mv.score_delta, mv.risk);
        }
        Ok(())
    }

    fn print_report(&self) -> anyhow::Result<()> {
        let report = self.engine.report(&self.snapshot.indices);
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!("status: {}", report.status);
        println!("balance score: {:.6}", report.balance_score);
        println!("last attempt: {}", report.last_rebalance_attempt);
        println!("last change: {}", report.last_balance_change);
        println!("last optimal: {}", report.last_optimal_found);
        println!("retained batches: {}", report.retained_batches);
        for (group, indices) in &report.group_mapping {
            println!("group {}: {}", group, indices.join(", "));
        }
        if !report.young_indexes.is_empty() {
            let young: Vec<&str> = report.young_indexes.iter().map(String::as_str).collect();
            println!("young indexes: {}", young.join(", "));
        }
        for (host, groups) in &report.node_group_scores {
            for (label, score) in groups {
                println!("  {} {}: {:.6}", host, label, score);
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    let chain = cli.constraint_chain()?;

    info!(
        snapshot = %cli.snapshot.display(),
        concurrent_rebalance = config.concurrent_rebalance,
        search_depth = config.search_depth,
        seed = ?config.random_seed,
        "Starting Tempest balancer"
    );

    let snapshot = ClusterSnapshot::load(&cli.snapshot)
        .with_context(|| format!("Failed to load {}", cli.snapshot.display()))?;

    let mut simulator = Simulator {
        engine: BalanceCoordinator::new(config, chain)?,
        snapshot,
        cycles: cli.cycles,
        interval: Duration::from_millis(cli.interval_ms),
        json: cli.json,
    };
    simulator.run().await?;

    if let Some(path) = &cli.output {
        std::fs::write(path, simulator.snapshot.to_json()?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Final snapshot written");
    }

    Ok(())
}
