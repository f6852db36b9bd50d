use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use ctrain_common::CertifiedTrainingConfig;
use ctrain_core::{EpsScheduler, SchedulePhase};
use ctrain_train::{LrScheduler, StepContext, StepOutcome, Trainer, TrainingCheckpoint};

#[derive(Parser, Debug)]
#[command(name = "ctrain", about = "Epsilon schedules and training dry runs for certified training")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default training config.
    InitConfig(InitConfigArgs),
    /// Print the per-epoch epsilon, coefficient and learning-rate schedule.
    Schedule(ScheduleArgs),
    /// Run the training driver with a no-op step, writing checkpoints.
    Simulate(SimulateArgs),
    /// Show the latest checkpoint in a directory and where training resumes.
    Inspect(InspectArgs),
}

// ── Init config ────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "config.json")]
    output: PathBuf,
    /// Overwrite an existing file.
    #[arg(long)]
    force: bool,
}

// ── Schedule ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct ScheduleArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Length of the training loader.
    #[arg(long)]
    batches_per_epoch: usize,
    /// Emit CSV instead of an aligned table.
    #[arg(long)]
    csv: bool,
}

// ── Simulate / Inspect ─────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct SimulateArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[arg(long)]
    batches_per_epoch: usize,
    /// Overrides `output_dir` from the config.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Continue from the latest checkpoint in the output directory.
    #[arg(long)]
    resume: bool,
    /// Stop after this many completed epochs instead of `num_epochs`.
    #[arg(long)]
    end_epoch: Option<usize>,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    #[arg(long, default_value = "results")]
    checkpoint_dir: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::InitConfig(args) => cmd_init_config(args),
        Command::Schedule(args) => cmd_schedule(args),
        Command::Simulate(args) => cmd_simulate(args),
        Command::Inspect(args) => cmd_inspect(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        anyhow::bail!(
            "{} already exists (pass --force to overwrite)",
            args.output.display()
        );
    }
    let config = CertifiedTrainingConfig::default();
    config.save(&args.output)?;
    tracing::info!(path = %args.output.display(), "Wrote default config");
    Ok(())
}

/// One line of `ctrain schedule`: values in effect at the first batch of `epoch`.
#[derive(Debug, Clone, PartialEq)]
struct ScheduleRow {
    epoch: usize,
    step: usize,
    eps: f64,
    kappa: f64,
    beta: f64,
    lr: f64,
    phase: SchedulePhase,
}

fn schedule_rows(
    config: &CertifiedTrainingConfig,
    batches_per_epoch: usize,
) -> Result<Vec<ScheduleRow>> {
    config.validate()?;
    let eps = EpsScheduler::from_config(config, batches_per_epoch)?;
    let lr = LrScheduler::new(config.lr, &config.lr_decay, batches_per_epoch)?;

    Ok((0..config.num_epochs)
        .map(|epoch| {
            let step = epoch * batches_per_epoch;
            ScheduleRow {
                epoch,
                step,
                eps: eps.eps_at_step(step),
                kappa: eps.kappa_at_step(step),
                beta: eps.beta_at_step(step),
                lr: lr.lr_at_step(step),
                phase: eps.phase_at_step(step),
            }
        })
        .collect())
}

fn cmd_schedule(args: ScheduleArgs) -> Result<()> {
    let config = CertifiedTrainingConfig::load(&args.config)?;
    let rows = schedule_rows(&config, args.batches_per_epoch)?;

    if args.csv {
        println!("epoch,step,eps,kappa,beta,lr,phase");
        for r in &rows {
            println!(
                "{},{},{},{},{},{},{}",
                r.epoch + 1,
                r.step,
                r.eps,
                r.kappa,
                r.beta,
                r.lr,
                r.phase
            );
        }
        return Ok(());
    }

    println!(
        "{:>6} {:>8} {:>10} {:>7} {:>7} {:>10}  phase",
        "epoch", "step", "eps", "kappa", "beta", "lr"
    );
    for r in &rows {
        println!(
            "{:>6} {:>8} {:>10.6} {:>7.3} {:>7.3} {:>10.2e}  {}",
            r.epoch + 1,
            r.step,
            r.eps,
            r.kappa,
            r.beta,
            r.lr,
            r.phase
        );
    }
    if config.dataset.normalised {
        let scheduler = EpsScheduler::from_config(&config, args.batches_per_epoch)?;
        println!("\nPer-channel target eps: {:?}", scheduler.max_eps_per_channel());
    }
    Ok(())
}

fn cmd_simulate(args: SimulateArgs) -> Result<()> {
    let mut config = CertifiedTrainingConfig::load(&args.config)?;
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }

    let mut trainer = if args.resume {
        tracing::info!(dir = %config.output_dir.display(), "Resuming simulation");
        Trainer::resume(&config.output_dir, args.batches_per_epoch)?
    } else {
        Trainer::new(config, args.batches_per_epoch)?
    };

    let end_epoch = args
        .end_epoch
        .unwrap_or(trainer.config.num_epochs)
        .min(trainer.config.num_epochs);
    let remaining = end_epoch.saturating_sub(trainer.epoch()) * args.batches_per_epoch;

    let pb = ProgressBar::new(remaining as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} batches {msg}")?
            .progress_chars("=>-"),
    );

    let mut step = |ctx: &StepContext<'_>| -> Result<StepOutcome> {
        pb.set_message(format!("epoch {} eps {:.5}", ctx.epoch + 1, ctx.eps));
        pb.inc(1);
        Ok(StepOutcome::clean(0.0, 0.0))
    };
    let summary = trainer.fit(&mut step, Some(end_epoch))?;
    pb.finish_with_message("done");

    println!("\n=== Simulation Complete ===");
    println!("Epochs: {} -> {}", summary.start_epoch, summary.end_epoch);
    if summary.stopped_early {
        println!("Stopped early at the multi-fidelity epsilon threshold");
    }
    println!("Final eps: {:.6}", trainer.eps_scheduler().current_eps());
    println!("Checkpoints written: {}", summary.checkpoints.len());
    if let Some(last) = summary.checkpoints.last() {
        println!("Latest: {}", last.display());
    }
    Ok(())
}

fn cmd_inspect(args: InspectArgs) -> Result<()> {
    let path = TrainingCheckpoint::latest(&args.checkpoint_dir)?;
    let checkpoint = TrainingCheckpoint::load(&path)?;
    let trainer = Trainer::from_checkpoint(&checkpoint, checkpoint.scheduler.batches_per_epoch)?;
    let eps = trainer.eps_scheduler();
    let weights = TrainingCheckpoint::weights_path(&args.checkpoint_dir, checkpoint.epoch);

    println!("Checkpoint: {}", path.display());
    println!("Completed epochs: {}/{}", checkpoint.epoch, checkpoint.config.num_epochs);
    println!("Running loss: {:.4}", checkpoint.running_loss);
    println!(
        "Scheduler: step {} ({} batches/epoch)",
        checkpoint.scheduler.step, checkpoint.scheduler.batches_per_epoch
    );
    println!(
        "Resumes at: eps {:.6} of {:.6} ({}), kappa {:.3}, beta {:.3}, lr {:.2e}",
        eps.current_eps(),
        eps.max_eps(),
        eps.phase(),
        eps.kappa(),
        eps.beta(),
        trainer.lr_scheduler().lr_at_step(eps.step())
    );
    println!(
        "Parameters: {}",
        if weights.exists() {
            weights.display().to_string()
        } else {
            "not saved".to_string()
        }
    );
    println!("\nConfig:\n{}", serde_json::to_string_pretty(&checkpoint.config)?);
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
