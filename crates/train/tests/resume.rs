//! Integration tests for checkpoint → resume.
//!
//! A run interrupted after a checkpoint and resumed from disk must hand every
//! remaining batch exactly the schedule values an uninterrupted run would.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use ctrain_common::{CertifiedTrainingConfig, EpsScheduleConfig, ScheduleUnit};
use ctrain_train::{ResumeError, StepContext, StepOutcome, Trainer, TrainingCheckpoint};
use tempfile::TempDir;

const BATCHES_PER_EPOCH: usize = 5;

fn make_config(dir: &Path) -> CertifiedTrainingConfig {
    CertifiedTrainingConfig {
        num_epochs: 12,
        eps: 8.0 / 255.0,
        train_eps_factor: 1.1,
        eps_schedule: EpsScheduleConfig {
            warm_up: 1,
            ramp_up: 8,
            ..Default::default()
        },
        lr_decay: ctrain_common::LrDecayConfig {
            milestones: vec![6, 10],
            factor: 0.2,
            unit: ScheduleUnit::Epoch,
        },
        output_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

fn noop(_: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
    Ok(StepOutcome::clean(0.0, 0.0))
}

type Seen = Vec<(usize, f64, f64, f64, f64)>;

fn record(seen: &mut Seen) -> impl FnMut(&StepContext<'_>) -> anyhow::Result<StepOutcome> + '_ {
    move |ctx: &StepContext<'_>| -> anyhow::Result<StepOutcome> {
        seen.push((ctx.global_step, ctx.eps, ctx.kappa, ctx.beta, ctx.lr));
        Ok(StepOutcome::clean(ctx.eps, 0.0))
    }
}

/// Uninterrupted run vs. a run stopped after epoch 4 and resumed from disk.
#[test]
fn test_resumed_run_matches_uninterrupted() {
    let full_dir = TempDir::new().unwrap();
    let mut full = Seen::new();
    Trainer::new(make_config(full_dir.path()), BATCHES_PER_EPOCH)
        .unwrap()
        .fit(&mut record(&mut full), None)
        .unwrap();

    let split_dir = TempDir::new().unwrap();
    let mut split = Seen::new();
    let first = Trainer::new(make_config(split_dir.path()), BATCHES_PER_EPOCH)
        .unwrap()
        .fit(&mut record(&mut split), Some(4))
        .unwrap();
    assert_eq!(first.end_epoch, 4);

    let mut resumed = Trainer::resume(split_dir.path(), BATCHES_PER_EPOCH).unwrap();
    assert_eq!(resumed.epoch(), 4);
    let second = resumed.fit(&mut record(&mut split), None).unwrap();
    assert_eq!(second.start_epoch, 4);
    assert_eq!(second.end_epoch, 12);

    assert_eq!(full.len(), 12 * BATCHES_PER_EPOCH);
    assert_eq!(split, full);
}

/// Resuming must never restart the ramp from zero.
#[test]
fn test_resume_does_not_restart_ramp() {
    let dir = TempDir::new().unwrap();
    let config = make_config(dir.path());
    let mut seen = Seen::new();
    Trainer::new(config.clone(), BATCHES_PER_EPOCH)
        .unwrap()
        .fit(&mut record(&mut seen), Some(6))
        .unwrap();
    let eps_before = seen.last().unwrap().1;

    let trainer = Trainer::resume(dir.path(), BATCHES_PER_EPOCH).unwrap();
    let eps_after = trainer.eps_scheduler().current_eps();
    assert!(eps_after > 0.0);
    assert!(eps_after >= eps_before);

    let checkpoint = TrainingCheckpoint::load_latest(dir.path()).unwrap();
    assert_eq!(checkpoint.epoch, 6);
    assert_eq!(checkpoint.eps, eps_after);
    assert_eq!(checkpoint.config, config);
}

/// `starting_at` positions the clock like a checkpoint would.
#[test]
fn test_starting_at_matches_checkpoint_resume() {
    let dir = TempDir::new().unwrap();
    let config = make_config(dir.path());
    Trainer::new(config.clone(), BATCHES_PER_EPOCH)
        .unwrap()
        .fit(&mut noop, Some(3))
        .unwrap();

    let from_disk = Trainer::resume(dir.path(), BATCHES_PER_EPOCH).unwrap();
    let manual = Trainer::starting_at(config, BATCHES_PER_EPOCH, 3).unwrap();
    assert_eq!(
        from_disk.eps_scheduler().current_eps(),
        manual.eps_scheduler().current_eps()
    );
    assert_eq!(from_disk.eps_scheduler().step(), manual.eps_scheduler().step());
}

#[test]
fn test_resume_errors_are_surfaced() {
    let dir = TempDir::new().unwrap();
    let err = Trainer::resume(dir.path(), BATCHES_PER_EPOCH).err().unwrap();
    assert!(matches!(
        err.downcast_ref::<ResumeError>(),
        Some(ResumeError::NoCheckpoints(_))
    ));

    std::fs::write(dir.path().join("checkpoint-3.json"), "not json").unwrap();
    let err = Trainer::resume(dir.path(), BATCHES_PER_EPOCH).err().unwrap();
    assert!(matches!(
        err.downcast_ref::<ResumeError>(),
        Some(ResumeError::Corrupted { .. })
    ));
}

#[test]
fn test_resume_with_different_loader_length_fails() {
    let dir = TempDir::new().unwrap();
    Trainer::new(make_config(dir.path()), BATCHES_PER_EPOCH)
        .unwrap()
        .fit(&mut noop, Some(2))
        .unwrap();
    assert!(Trainer::resume(dir.path(), BATCHES_PER_EPOCH + 1).is_err());
}

/// Parameters saved with a checkpoint come back on resume.
#[test]
fn test_weights_restored_on_resume() {
    let dir = TempDir::new().unwrap();
    let device = Device::Cpu;

    let varmap = VarMap::new();
    let w = {
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        vb.get_with_hints((3,), "layer.weight", Init::Const(0.0)).unwrap()
    };
    let mut trainer = Trainer::new(make_config(dir.path()), BATCHES_PER_EPOCH)
        .unwrap()
        .with_varmap(varmap.clone());

    // "Optimiser": set each weight to the current epsilon.
    let mut step = |ctx: &StepContext<'_>| -> anyhow::Result<StepOutcome> {
        let data = varmap.data().lock().unwrap();
        let new = Tensor::full(ctx.eps as f32, (3,), &device)?;
        data["layer.weight"].set(&new)?;
        Ok(StepOutcome::clean(0.0, 0.0))
    };
    trainer.fit(&mut step, Some(3)).unwrap();
    let trained = w.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(trained[0] > 0.0);

    let fresh = VarMap::new();
    {
        let vb = VarBuilder::from_varmap(&fresh, DType::F32, &device);
        vb.get_with_hints((3,), "layer.weight", Init::Const(0.0)).unwrap();
    }
    let mut resumed = Trainer::resume(dir.path(), BATCHES_PER_EPOCH)
        .unwrap()
        .with_varmap(fresh);
    assert!(resumed.restore_weights(dir.path()).unwrap());

    let restored = {
        let data = resumed.varmap().unwrap().data().lock().unwrap();
        data["layer.weight"]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
    };
    assert_eq!(restored, trained);
}

/// A resumed run writes to the directory it was resumed from, even after the
/// checkpoints were moved.
#[test]
fn test_resume_writes_to_resume_dir() {
    let root = TempDir::new().unwrap();
    let old_dir = root.path().join("a");
    let new_dir = root.path().join("b");
    Trainer::new(make_config(&old_dir), BATCHES_PER_EPOCH)
        .unwrap()
        .fit(&mut noop, Some(2))
        .unwrap();
    std::fs::rename(&old_dir, &new_dir).unwrap();

    let mut resumed = Trainer::resume(&new_dir, BATCHES_PER_EPOCH).unwrap();
    assert_eq!(resumed.config.output_dir, new_dir);
    let summary = resumed.fit(&mut noop, Some(3)).unwrap();
    assert_eq!(summary.checkpoints, vec![new_dir.join("checkpoint-3.json")]);
    assert!(!old_dir.exists());

    let again = Trainer::resume(&new_dir, BATCHES_PER_EPOCH).unwrap();
    assert_eq!(again.epoch(), 3);
}
