// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Parses arguments with `clap`, resolves them into a Config,
// and hands the run to Layer 2. Nothing here computes.
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, RunArgs};

use crate::application::run_use_case::RunUseCase;
use crate::domain::config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "cvap-monitor",
    version = "0.1.0",
    about = "Train and evaluate contrastive image/audio models."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args) => run_with(&args, |_| {}),
            Commands::Eval(args)  => run_with(&args, |cfg| cfg.eval = true),
            Commands::Norms(args) => run_with(&args, |cfg| cfg.running.audio.eval_norms = true),
        }
    }
}

fn run_with(args: &RunArgs, mode: impl FnOnce(&mut Config)) -> Result<()> {
    let mut cfg = args.resolve()?;
    mode(&mut cfg);
    tracing::info!("Run '{}' over '{}'", cfg.model_name, cfg.running.data_root);

    let summary = RunUseCase::new(cfg, args.device.into()).execute()?;
    if let Some(norms) = &summary.norms {
        println!("MEAN: {:?}\nSTD:  {:?}", norms.mean, norms.std);
    } else if let Some(report) = &summary.last_report {
        println!("{report}");
    }
    if summary.total_step > 0 {
        println!(
            "Done: {} steps, {} samples, mean loss {:.4}, {} checkpoint(s).",
            summary.total_step,
            summary.total_inst,
            summary.mean_loss,
            summary.checkpoints.len()
        );
    }
    Ok(())
}
