//! stepbbo: run a black-box optimization one step per invocation.
//!
//! ## Usage
//!
//! ```bash
//! # Bootstrap a run and open step 0
//! stepbbo init runs/reach --setup crates/sb-cli/demos/distance_to_point.json
//!
//! # ... the executor writes cost_vars.txt into every rollout directory ...
//!
//! # Close the open step and open the next one
//! stepbbo advance runs/reach
//!
//! # Learning curve so far
//! stepbbo status runs/reach
//! ```
//!
//! The run root may also be given through `STEPBBO_RUN_ROOT`.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sb_optimizer::{AdvanceOutcome, RunSetup, RunStatus, StepController};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stepbbo")]
#[command(about = "Resumable black-box optimization driven by an external rollout executor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstrap a new run and open its first step
    Init {
        run_root: PathBuf,

        /// Run setup JSON (task, updater, initial distribution, batch size, seed)
        #[arg(long)]
        setup: PathBuf,

        /// Discard the steps of an existing run at this root
        #[arg(long)]
        force: bool,
    },
    /// Close the pending step and open the next one
    Advance {
        run_root: Option<PathBuf>,

        /// Re-close this step instead of the highest open one
        #[arg(long)]
        step: Option<usize>,
    },
    /// Show the progress of a run
    Status {
        run_root: Option<PathBuf>,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Produce cost_vars in-process for tasks that can simulate their rollouts
    Simulate { run_root: Option<PathBuf> },
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Init {
            run_root,
            setup,
            force,
        } => {
            let setup = RunSetup::from_json_file(&setup)?;
            let controller = StepController::new(&run_root);
            if controller.store().read_manifest()?.is_some() {
                if !force {
                    bail!(
                        "{} already holds a run; pass --force to start over",
                        run_root.display()
                    );
                }
                warn!("Discarding the existing steps of {}", run_root.display());
                controller.store().remove_steps()?;
            }
            let outcome = controller
                .advance(&setup, None)
                .with_context(|| format!("failed to initialize {}", run_root.display()))?;
            report(&outcome);
        }
        Command::Advance { run_root, step } => {
            let run_root = resolve_root(run_root)?;
            let outcome = StepController::new(&run_root)
                .resume(step)
                .with_context(|| format!("failed to advance {}", run_root.display()))?;
            report(&outcome);
        }
        Command::Status { run_root, json } => {
            let run_root = resolve_root(run_root)?;
            let status = StepController::new(&run_root).status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Command::Simulate { run_root } => {
            let run_root = resolve_root(run_root)?;
            let simulated = StepController::new(&run_root).simulate_pending()?;
            println!("Simulated {} rollouts", simulated.len());
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("STEPBBO_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_root(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match arg {
        Some(root) => Ok(root),
        None => std::env::var("STEPBBO_RUN_ROOT")
            .map(PathBuf::from)
            .context("no run root given and STEPBBO_RUN_ROOT is not set"),
    }
}

fn report(outcome: &AdvanceOutcome) {
    if let Some(closed) = &outcome.closed {
        println!(
            "Closed step {}: evaluation cost {}",
            closed.step, closed.eval_cost.total
        );
    }
    println!("Samples for step {} written to {}", outcome.step, outcome.samples_path.display());
    println!("{} rollouts required", outcome.rollouts_required);
}

fn print_status(status: &RunStatus) {
    println!("Run: {}", status.root.display());
    println!("Samples per update: {}", status.n_samples_per_update);
    println!("{:>6}  {:>8}  {:>14}  {:>14}  pending", "step", "state", "eval cost", "max eigenvalue");
    for step in &status.steps {
        let state = if step.closed { "closed" } else { "open" };
        let eval_cost = step.eval_cost.map_or("-".to_string(), |c| format!("{c:.6}"));
        let eigen = step.max_eigenvalue.map_or("-".to_string(), |e| format!("{e:.6}"));
        println!(
            "{:>6}  {:>8}  {:>14}  {:>14}  {}",
            step.step,
            state,
            eval_cost,
            eigen,
            step.pending_rollouts.len()
        );
    }
}
