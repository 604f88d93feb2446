// ============================================================
// Layer 5 — Monitor (Training / Evaluation Loop)
// ============================================================
// The state machine that drives a run:
//
//   Init ─┬─ eval_norms ──────────────────────────→ Done
//         └─ BuildModel → BuildOptimizer → TrainEpochs* → Done
//
// One training step:
//
//   pipeline.batch (collate, tensors)
//     → LARS adjustment, or warmup (never both)
//     → fresh autodiff leaves, forward, scaled backward
//     → executor.synchronize   (the cross-rank barrier)
//     → scaler.step / scaler.update
//     → per-batch scheduler step once warmup is over
//     → counters, then [log] [evaluate] [checkpoint]
//
// Logging is rank 0 only. Evaluation runs its forward passes
// on every rank, but only rank 0 reports and writes
// checkpoints. A scheduler restart or the end of warmup
// forces an evaluation. With `eval_loss_ceiling` set, the
// evaluation pass is skipped while the step loss is at or
// above it; the checkpoint is still written.
//
// Reference: Burn Book §5 (Training)

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::tensor::{backend::AutodiffBackend, ElementConversion};

use crate::data::batcher::{Batch, BatchPipeline};
use crate::data::loader::{DataSplits, MemorySource};
use crate::domain::config::Config;
use crate::domain::run_state::{PhaseTimer, RunState};
use crate::domain::traits::{DataSource, Echo};
use crate::infra::checkpoint::{Checkpoint, CheckpointManager};
use crate::infra::metrics::AverageMeter;
use crate::ml::executor::Executor;
use crate::ml::model::{ForwardArgs, Model};
use crate::ml::optim::{build_optimizer, Optimizer};
use crate::ml::scaler::GradScaler;
use crate::ml::scheduler::{build_scheduler, lars_adjust, ScheduleEvent, Scheduler, Warmup, WarmupEvent};

/// Builds the model once the monitor knows it needs one.
pub type ModelBuilder<'a, B> = Box<dyn FnOnce(&Config, Echo) -> Result<Box<dyn Model<B>>> + 'a>;

/// Per-channel audio statistics from an `eval_norms` pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioNorms {
    pub mean: Vec<f64>,
    pub std:  Vec<f64>,
}

/// What `learn` hands back to the application layer.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total_step:  usize,
    pub total_inst:  usize,
    /// Mean step loss over the whole run
    pub mean_loss:   f64,
    /// Written by this rank; empty on every rank but zero
    pub checkpoints: Vec<PathBuf>,
    /// Latest evaluation report, rank zero only
    pub last_report: Option<String>,
    /// Set only by an `eval_norms` run
    pub norms:       Option<AudioNorms>,
}

#[derive(Debug, Clone, Copy)]
enum Split {
    Main,
    Eval,
}

pub struct Monitor<B: AutodiffBackend> {
    /// Fixed after `new`, which may only clamp the peep rate
    cfg:         Config,
    echo:        Echo,
    executor:    Box<dyn Executor<B::InnerBackend>>,
    pipeline:    BatchPipeline<B>,
    dataloader:  Box<dyn DataSource>,
    /// Present only when the eval split exists on disk
    evalloader:  Option<Box<dyn DataSource>>,
    gold_file:   PathBuf,
    /// `None` in `eval_norms` mode
    model:       Option<Box<dyn Model<B>>>,
    optimizer:   Option<Optimizer<B::InnerBackend>>,
    /// `None` under LARS
    scheduler:   Option<Scheduler>,
    warmup:      Option<Warmup>,
    scaler:      GradScaler,
    checkpoints: CheckpointManager,
    state:       RunState,
    /// Checkpoints written by this monitor, in order
    saved:       Vec<PathBuf>,
    last_report: Option<String>,
}

impl<B: AutodiffBackend> Monitor<B> {
    pub fn new(
        mut cfg:     Config,
        echo:        Echo,
        device:      B::Device,
        executor:    Box<dyn Executor<B::InnerBackend>>,
        splits:      DataSplits,
        build_model: ModelBuilder<'_, B>,
    ) -> Result<Self> {
        cfg.validate()?;

        // ── Data ──────────────────────────────────────────────────────────────
        let DataSplits { main_name, main, eval, gold_file } = splits;
        let nstep = main.len();
        if nstep < cfg.running.peep_rate {
            cfg.running.peep_rate = nstep.max(1);
        }
        echo.say(format!(
            "Instantiate main dataloader from `{main_name}': total {nstep} ({}) batches.",
            cfg.running.peep_rate
        ));
        if let Some(eval) = &eval {
            echo.say(format!(
                "Will do evaluation every {} steps on {} batches.",
                cfg.running.save_rate,
                eval.len()
            ));
        }

        let pipeline    = BatchPipeline::new(device, cfg.running.resolution);
        let checkpoints = CheckpointManager::for_run(&cfg);
        let scaler      = GradScaler::new(cfg.running.amp);

        let mut monitor = Self {
            echo:        echo.clone(),
            executor,
            pipeline,
            dataloader:  main,
            evalloader:  eval,
            gold_file,
            model:       None,
            optimizer:   None,
            scheduler:   None,
            warmup:      None,
            scaler,
            checkpoints,
            state:       RunState::new(),
            saved:       Vec::new(),
            last_report: None,
            cfg,
        };
        if monitor.cfg.running.audio.eval_norms {
            return Ok(monitor);
        }

        // ── Model ─────────────────────────────────────────────────────────────
        let mut model = build_model(&monitor.cfg, echo)?;
        let tunable   = model.build().context("Failed to build the model")?;
        model.set_training(!monitor.cfg.eval);
        let training = model.is_training();
        if training {
            model.params_mut().select_tunable(&tunable)?;
        }
        monitor
            .executor
            .broadcast(model.params_mut())
            .context("Failed to broadcast the initial weights")?;
        monitor.model = Some(model);
        if training {
            monitor.build_optimizer()?;
            monitor.warn_existing_checkpoints()?;
        }
        Ok(monitor)
    }

    fn warn_existing_checkpoints(&self) -> Result<()> {
        if !self.executor.is_primary() {
            return Ok(());
        }
        let steps = self.checkpoints.saved_steps()?;
        if let Some(last) = steps.last() {
            tracing::warn!(
                "{} checkpoint(s) up to step {last} from an earlier run will be overwritten",
                steps.len()
            );
        }
        Ok(())
    }

    fn build_optimizer(&mut self) -> Result<()> {
        let Self { cfg, echo, model, optimizer, scheduler, warmup, .. } = self;
        let model  = model.as_ref().context("optimizer requested before the model")?;
        let params = model.params();
        echo.say(format!(
            "# param {:.2}M # tunable {:.2}M.",
            params.numel(false) as f64 / 1e6,
            params.numel(true) as f64 / 1e6,
        ));

        let ocfg  = &cfg.optimizer;
        let optim = build_optimizer(params, ocfg)?;
        if !optim.is_lars() {
            *scheduler = Some(build_scheduler(&ocfg.scheduler, optim.groups())?);
            if ocfg.warmup {
                *warmup = Some(Warmup::new(ocfg.warmup_steps));
            }
        }
        tracing::debug!("Optimizer {} over {} groups", optim.rule().name(), optim.groups().len());
        *optimizer = Some(optim);

        if cfg.verbose {
            echo.say("Gradienting The Following Parameters:");
            for (name, p) in params.iter().filter(|(_, p)| p.requires_grad) {
                echo.say(format!("{name} {:?}", p.shape));
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn model(&self) -> Option<&dyn Model<B>> {
        self.model.as_deref()
    }

    pub fn optimizer(&self) -> Option<&Optimizer<B::InnerBackend>> {
        self.optimizer.as_ref()
    }

    /// Run to completion: audio statistics, one evaluation pass, or
    /// every configured training epoch.
    pub fn learn(&mut self) -> Result<RunSummary> {
        if self.cfg.running.audio.eval_norms {
            let norms = self.eval_norms()?;
            return Ok(RunSummary { norms: Some(norms), ..RunSummary::default() });
        }

        let training = self.model.as_ref().map(|m| m.is_training()).unwrap_or(false);
        if !training {
            let primary = self.executor.is_primary();
            if primary {
                self.echo.say("Evaluating started...");
            }
            let samples = self.cfg.running.eval_samples;
            let report  = self.infer(Split::Main, samples, 0)?;
            if primary && !report.is_empty() {
                self.echo.say(&report);
                self.last_report = Some(report);
            }
            return Ok(self.summary());
        }

        self.echo.say("Training started...");
        self.state = RunState::new();
        for iepoch in 0..self.cfg.optimizer.epochs {
            self.state.epoch = iepoch;
            self.dataloader.set_epoch(iepoch);
            self.epoch()?;
        }
        Ok(self.summary())
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            total_step:  self.state.total_step,
            total_inst:  self.state.total_inst,
            mean_loss:   self.state.mean_loss(),
            checkpoints: self.saved.clone(),
            last_report: self.last_report.clone(),
            norms:       None,
        }
    }

    // ── Epoch ─────────────────────────────────────────────────────────────────
    fn epoch(&mut self) -> Result<()> {
        let loader = std::mem::replace(&mut self.dataloader, Box::new(MemorySource::new(Vec::new())));
        let result = self.run_epoch(loader.as_ref());
        self.dataloader = loader;
        result
    }

    fn run_epoch(&mut self, loader: &dyn DataSource) -> Result<()> {
        let iepoch     = self.state.epoch;
        let mut timer  = PhaseTimer::new();
        let mut losses = AverageMeter::new();
        let nbatch     = loader.len();
        let world      = self.executor.world_size();
        let primary    = self.executor.is_primary();

        for (ibatch, raw) in loader.batches().enumerate() {
            let step  = iepoch * nbatch + ibatch;
            let batch = self.pipeline.batch(raw?)?;
            timer.mark("data");

            let (loss, force_eval) = self.train_step(step, nbatch, &batch)?;
            timer.mark("model");

            self.state.advance(loss, batch.len() * world);
            losses.update(loss, 1);

            let total_step = self.state.total_step;
            if primary && (force_eval || total_step % self.cfg.running.peep_rate == 0) {
                self.log_progress();
            }
            let rcfg = &self.cfg.running;
            if force_eval
                || total_step % rcfg.save_rate == 0
                || (rcfg.save_epoch && nbatch > 0 && total_step % nbatch == 0)
            {
                self.evaluate_and_save(loss)?;
            }
            timer.mark("report");
        }

        let batch_sch = self.cfg.optimizer.batch_sch;
        if let (Some(scheduler), Some(optimizer)) = (self.scheduler.as_mut(), self.optimizer.as_mut()) {
            if !batch_sch {
                scheduler.step(optimizer.groups_mut(), Some(losses.avg()));
            }
        }
        if primary {
            self.echo.say(format!(
                "Mean loss of epoch {iepoch}: {:.3} over {} steps",
                losses.avg(),
                losses.count
            ));
            self.echo.say(format!(
                "Time (s): {}; # step {} # sample {}",
                timer.summary(),
                self.state.total_step,
                self.state.total_inst
            ));
        }
        Ok(())
    }

    /// One optimizer step; returns the unscaled loss and whether an
    /// evaluation is due regardless of cadence.
    fn train_step(
        &mut self,
        step:   usize,
        nbatch: usize,
        batch:  &Batch<B>,
    ) -> Result<(f64, bool)> {
        let Self { cfg, echo, executor, model, optimizer, scheduler, warmup, scaler, state, .. } = self;
        let model     = model.as_mut().context("training without a model")?;
        let optimizer = optimizer.as_mut().context("training without an optimizer")?;
        let ocfg      = &cfg.optimizer;
        let mut force_eval = false;

        // ── Learning rate ─────────────────────────────────────────────────────
        if optimizer.is_lars() {
            lars_adjust(ocfg, cfg.running.batch_size, nbatch, step, optimizer.groups_mut());
        }
        let warming = match warmup.as_ref() {
            Some(w) if w.is_active(state.total_step) => {
                match w.apply(state.total_step, optimizer.groups_mut()) {
                    WarmupEvent::Adjusted(lrs) => echo.say(format!("warmup lr: {}", fmt_lrs(&lrs))),
                    WarmupEvent::Completed(lrs) => {
                        echo.say(format!("warmup lr: {}", fmt_lrs(&lrs)));
                        force_eval = true;
                    }
                    WarmupEvent::Idle => {}
                }
                true
            }
            _ => false,
        };

        // ── Forward / backward ────────────────────────────────────────────────
        let leaves = model.params().leaves::<B>(true);
        let args   = ForwardArgs { device_ids: executor.device_ids(), names: None };
        let loss   = model
            .forward(&leaves, batch, args)?
            .context("model returned no loss in training mode")?;
        let loss_value = loss.clone().into_scalar().elem::<f64>();
        let mut grads  = leaves.gradients(&scaler.scale_loss(loss).backward());

        executor.synchronize(model.params(), &mut grads)?;
        scaler.step(optimizer, model.params_mut(), &mut grads, ocfg.max_norm)?;
        scaler.update();

        // ── Per-batch schedule ────────────────────────────────────────────────
        if let Some(scheduler) = scheduler.as_mut() {
            if ocfg.batch_sch && !warming
                && scheduler.step(optimizer.groups_mut(), Some(loss_value)) == ScheduleEvent::Restart
            {
                force_eval = true;
            }
        }
        Ok((loss_value, force_eval))
    }

    fn log_progress(&self) {
        let iepoch = self.state.epoch;
        let lrs  = self.optimizer.as_ref().map(|o| o.learning_rates()).unwrap_or_default();
        let lr_w = lrs.first().copied().unwrap_or(0.0);
        let lr_b = lrs.get(1).copied().unwrap_or(0.0);
        self.echo.say(format!(
            "epoch {iepoch:>4} step {}\tlr_w {lr_w:.2e} lr_b {lr_b:.2e} loss {:.3} {:.2} samples/s",
            self.state.total_step,
            self.state.mean_loss(),
            self.state.throughput(),
        ));
    }

    // ── Evaluation and checkpoints ────────────────────────────────────────────
    fn evaluate_and_save(&mut self, loss: f64) -> Result<()> {
        let iepoch = self.state.epoch;
        let below  = self.cfg.running.eval_loss_ceiling.map_or(true, |ceiling| loss < ceiling);
        if !below && self.executor.is_primary() {
            self.echo.say(format!("Skip evaluation: loss {loss:.3} is not below the ceiling"));
        }
        let mut report = String::new();
        if self.evalloader.is_some() && below {
            self.set_training(false);
            let samples = self.cfg.running.eval_samples;
            let result  = self.infer(Split::Eval, samples, iepoch);
            self.set_training(true);
            report = result?;
        }
        if !report.is_empty() {
            self.echo.say(&report);
            self.last_report = Some(report);
        }
        if self.executor.is_primary() {
            self.save()?;
        }
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        if let Some(model) = self.model.as_mut() {
            model.set_training(training);
        }
    }

    fn infer(&mut self, split: Split, samples: Option<usize>, iepoch: usize) -> Result<String> {
        let Self { echo, executor, pipeline, dataloader, evalloader, model, gold_file, .. } = self;
        let loader = match split {
            Split::Main => dataloader,
            Split::Eval => evalloader.as_mut().context("no evaluation split")?,
        };
        let model = model.as_mut().context("evaluation without a model")?;
        if executor.is_distributed() {
            loader.set_epoch(iepoch);
        }
        let world   = executor.world_size();
        let primary = executor.is_primary();
        let peep    = (loader.len() / 10).max(10);
        let limit   = samples.unwrap_or(usize::MAX);
        let start   = Instant::now();

        let mut nsample = 0usize;
        let mut losses  = AverageMeter::new();
        for (ibatch, raw) in loader.batches().enumerate() {
            if nsample >= limit {
                break;
            }
            let batch  = pipeline.batch(raw?)?;
            let leaves = model.params().leaves::<B>(false);
            let args   = ForwardArgs { device_ids: executor.device_ids(), names: Some(batch.ids.as_slice()) };
            let loss   = model.forward(&leaves, &batch, args)?;
            nsample += batch.len() * world;
            losses.update(loss.map_or(0.0, |l| l.into_scalar().elem::<f64>()), 1);
            if primary && (ibatch + 1) % peep == 0 {
                echo.say(format!(
                    "step {ibatch}\tloss {:.8} {:.2} samples/s",
                    losses.avg(),
                    nsample as f64 / start.elapsed().as_secs_f64().max(1e-9),
                ));
            }
        }
        if !primary {
            return Ok(String::new());
        }
        echo.say(format!(
            "# sample {nsample}; {:.2} samples/s",
            nsample as f64 / start.elapsed().as_secs_f64().max(1e-9)
        ));
        model.report(gold_file)
    }

    fn save(&mut self) -> Result<()> {
        let model = self.model.as_ref().context("nothing to save")?;
        let step  = self.state.total_step;
        self.echo.say(format!(
            "Saving the checkpoint to {}",
            self.checkpoints.path_for(step).display()
        ));
        let heads = model.export_heads(&model.checkpoint_heads())?;
        let path  = self.checkpoints.save(&Checkpoint::new(step, &self.cfg, heads)?)?;
        self.saved.push(path);
        Ok(())
    }

    // ── Audio statistics ──────────────────────────────────────────────────────
    fn eval_norms(&mut self) -> Result<AudioNorms> {
        self.echo.say("Evaluate mean and std...");
        let mut means: Vec<Vec<f64>> = Vec::new();
        let mut sqs:   Vec<Vec<f64>> = Vec::new();
        for (step, raw) in self.dataloader.batches().enumerate() {
            let audios = self.pipeline.batch(raw?)?.audios;
            let [b, c, _, _] = audios.dims();
            let mean    = audios.clone().mean_dim(3).mean_dim(2).reshape([b, c]);
            let mean_sq = audios.powf_scalar(2.0).mean_dim(3).mean_dim(2).reshape([b, c]);
            for (tensor, out) in [(mean, &mut means), (mean_sq, &mut sqs)] {
                let values = tensor
                    .into_data()
                    .to_vec::<f32>()
                    .map_err(|e| anyhow::anyhow!("cannot read audio statistics: {e:?}"))?;
                out.extend(values.chunks(c).map(|row| row.iter().map(|&v| v as f64).collect()));
            }
            self.echo.say(format!("step {step}"));
        }

        let channel_mean = |rows: &[Vec<f64>]| -> Vec<f64> {
            let Some(first) = rows.first() else { return Vec::new() };
            (0..first.len())
                .map(|k| rows.iter().map(|r| r[k]).sum::<f64>() / rows.len() as f64)
                .collect()
        };
        let mean = channel_mean(&means);
        let sos  = channel_mean(&sqs);
        let std  = mean
            .iter()
            .zip(sos.iter())
            .map(|(m, s)| (s - m * m).max(0.0).sqrt())
            .collect();
        let norms = AudioNorms { mean, std };
        self.echo.say(format!("MEAN: {:?} STD: {:?}", norms.mean, norms.std));
        Ok(norms)
    }
}

fn fmt_lrs(lrs: &[f64]) -> String {
    lrs.iter().map(|lr| format!("{lr:.2e}")).collect::<Vec<_>>().join(" ")
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::NamedSpec;
    use crate::domain::sample::{PairSample, RawArray};
    use crate::domain::traits::testing::recording_echo;
    use crate::ml::dual_encoder::DualEncoder;
    use crate::ml::executor::LocalExecutor;
    use crate::ml::params::{GradientSet, ParamStore};
    use burn::backend::{Autodiff, NdArray};
    use std::sync::{Arc, Mutex};

    type Inner = NdArray<f32>;
    type TestBackend = Autodiff<Inner>;

    fn tiny_config(root: &std::path::Path) -> Config {
        let mut cfg = Config::default();
        cfg.alias_root                 = root.display().to_string();
        cfg.model_name                 = "cvap-small".into();
        cfg.model.embed_dim            = 4;
        cfg.model.image.input_dim      = 3;
        cfg.model.audio.num_mel_bins   = 2;
        cfg.model.loss.num_labels      = 2;
        cfg.running.batch_size         = 2;
        cfg.optimizer.epochs           = 1;
        cfg.optimizer.optimizer        = NamedSpec::new("SGD", serde_json::json!({ "lr": 0.01 }));
        cfg
    }

    /// Two samples, `a<seed>` and `b<seed>`.
    fn raw_batch(seed: usize) -> Vec<PairSample> {
        ["a", "b"]
            .into_iter()
            .enumerate()
            .map(|(k, prefix)| {
                let off = seed + k * 3;
                PairSample {
                    id:    format!("{prefix}{seed}"),
                    image: RawArray::new(vec![3], (0..3).map(|i| ((i + off) % 7) as f32 / 7.0).collect()).unwrap(),
                    audio: RawArray::new(vec![2, 3], (0..6).map(|i| ((i * 3 + off) % 5) as f32 / 5.0).collect()).unwrap(),
                }
            })
            .collect()
    }

    fn splits(nbatch: usize, eval: Option<usize>, gold_file: PathBuf) -> DataSplits {
        DataSplits {
            main_name: "train".into(),
            main:      Box::new(MemorySource::new((0..nbatch).map(raw_batch).collect())),
            eval:      eval.map(|n| Box::new(MemorySource::new((0..n).map(raw_batch).collect())) as Box<dyn DataSource>),
            gold_file,
        }
    }

    fn builder<'a>() -> ModelBuilder<'a, TestBackend> {
        Box::new(|cfg: &Config, echo: Echo| {
            Ok(Box::new(DualEncoder::<TestBackend>::new(cfg, echo, &Default::default())?) as Box<dyn Model<TestBackend>>)
        })
    }

    fn monitor(
        cfg:      Config,
        echo:     Echo,
        executor: Box<dyn Executor<Inner>>,
        splits:   DataSplits,
    ) -> Monitor<TestBackend> {
        Monitor::new(cfg, echo, Default::default(), executor, splits, builder()).unwrap()
    }

    fn epoch_lines(lines: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        lines.lock().unwrap().iter().filter(|l| l.starts_with("epoch")).cloned().collect()
    }

    #[test]
    fn test_end_to_end_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = tiny_config(dir.path());
        cfg.running.peep_rate = 5;
        cfg.running.save_rate = 10;

        let (echo, lines) = recording_echo();
        let mut m = monitor(cfg, echo, Box::new(LocalExecutor::new(1)), splits(10, None, dir.path().join("train.csv")));
        let summary = m.learn().unwrap();

        assert_eq!(summary.total_step, 10);
        assert_eq!(summary.total_inst, 20);
        assert_eq!(epoch_lines(&lines).len(), 2);
        assert_eq!(summary.checkpoints.len(), 1);
        assert!(summary.checkpoints[0].ends_with("cvap-small/00000010.ckpt"));
        assert!(summary.mean_loss.is_finite());
    }

    #[test]
    fn test_log_iff_step_divides_peep_rate() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = tiny_config(dir.path());
        cfg.running.peep_rate = 4;
        cfg.running.save_rate = 1000;
        cfg.optimizer.epochs  = 2;

        let (echo, lines) = recording_echo();
        let mut m = monitor(cfg, echo, Box::new(LocalExecutor::new(1)), splits(6, None, dir.path().join("x.csv")));
        m.learn().unwrap();

        let steps: Vec<usize> = epoch_lines(&lines)
            .iter()
            .map(|l| l.split_whitespace().nth(3).unwrap().parse().unwrap())
            .collect();
        assert_eq!(steps, vec![4, 8, 12]);
        assert!(lines.lock().unwrap().iter().any(|l| l.starts_with("Time (s): ")));
    }

    #[test]
    fn test_peep_rate_clamped_to_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_config(dir.path());
        let (echo, lines) = recording_echo();
        let m = monitor(cfg, echo, Box::new(LocalExecutor::new(1)), splits(3, None, dir.path().join("x.csv")));
        assert_eq!(m.config().running.peep_rate, 3);
        assert!(lines.lock().unwrap()[0].contains("total 3 (3) batches"));
    }

    struct Secondary;

    impl Executor<Inner> for Secondary {
        fn rank(&self) -> usize { 1 }
        fn world_size(&self) -> usize { 2 }
        fn device_ids(&self) -> &[usize] { &[1] }
        fn broadcast(&self, _: &mut ParamStore<Inner>) -> Result<()> { Ok(()) }
        fn synchronize(&self, _: &ParamStore<Inner>, _: &mut GradientSet<Inner>) -> Result<()> { Ok(()) }
    }

    #[test]
    fn test_secondary_rank_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = tiny_config(dir.path());
        cfg.rank = 1;
        cfg.world_size = 2;
        cfg.running.peep_rate = 1;
        cfg.running.save_rate = 2;

        let (echo, lines) = recording_echo();
        let mut m = monitor(cfg, echo, Box::new(Secondary), splits(4, None, dir.path().join("x.csv")));
        let summary = m.learn().unwrap();

        assert_eq!(summary.total_step, 4);
        // every step counts both ranks' samples
        assert_eq!(summary.total_inst, 16);
        assert!(epoch_lines(&lines).is_empty());
        assert!(summary.checkpoints.is_empty());
    }

    #[test]
    fn test_parameters_frozen_after_setup() {
        let dir = tempfile::tempdir().unwrap();
        let (echo, lines) = recording_echo();
        let m = monitor(tiny_config(dir.path()), echo, Box::new(LocalExecutor::new(1)), splits(2, None, dir.path().join("x.csv")));
        let trainable = m.model().unwrap().params().trainable_names();
        assert_eq!(trainable, vec!["audio_head.bias", "audio_head.weight", "loss_head.logit_scale"]);
        assert!(lines.lock().unwrap().iter().any(|l| l.starts_with("# param ")));
    }

    #[test]
    fn test_warmup_completion_forces_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let gold = dir.path().join("eval.csv");
        std::fs::write(&gold, "id,labels\na0,0\nb0,1\na1,1\nb1,0\n").unwrap();

        let mut cfg = tiny_config(dir.path());
        cfg.optimizer.warmup       = true;
        cfg.optimizer.warmup_steps = 3;
        cfg.running.peep_rate      = 100;
        cfg.running.save_rate      = 100;

        let (echo, lines) = recording_echo();
        let mut m = monitor(cfg, echo, Box::new(LocalExecutor::new(1)), splits(6, Some(2), gold));
        let summary = m.learn().unwrap();

        // warmup completes while total_step is 3, i.e. on the fourth step
        assert_eq!(summary.checkpoints.len(), 1);
        assert!(summary.checkpoints[0].ends_with("00000004.ckpt"));
        assert!(summary.last_report.unwrap().starts_with("Mac-AP"));
        // the forced line at step 4, then the regular one at 6
        assert_eq!(epoch_lines(&lines).len(), 2);
        let lr = m.optimizer().unwrap().learning_rates();
        assert!((lr[0] - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_restart_forces_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = tiny_config(dir.path());
        cfg.optimizer.batch_sch = true;
        cfg.optimizer.scheduler = NamedSpec::new("CosineAnnealingWarmRestarts", serde_json::json!({ "T_0": 3 }));
        cfg.running.save_rate   = 100;

        let (echo, _lines) = recording_echo();
        let mut m = monitor(cfg, echo, Box::new(LocalExecutor::new(1)), splits(7, None, dir.path().join("x.csv")));
        let summary = m.learn().unwrap();
        let steps: Vec<String> = summary
            .checkpoints
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(steps, vec!["00000003.ckpt", "00000006.ckpt"]);
    }

    #[test]
    fn test_eval_mode_reports_once() {
        let dir = tempfile::tempdir().unwrap();
        let gold = dir.path().join("eval.csv");
        std::fs::write(&gold, "id,labels\na0,0\nb0,1\na1,0;1\nb1,\n").unwrap();

        // a checkpoint from a training run to evaluate
        let mut train_cfg = tiny_config(dir.path());
        train_cfg.running.save_rate = 2;
        let (echo, _) = recording_echo();
        let saved = monitor(train_cfg.clone(), echo, Box::new(LocalExecutor::new(1)), splits(2, None, gold.clone()))
            .learn()
            .unwrap()
            .checkpoints;

        let mut cfg = train_cfg;
        cfg.eval       = true;
        cfg.model_file = Some(saved[0].display().to_string());
        let (echo, lines) = recording_echo();
        let mut m = monitor(cfg, echo, Box::new(LocalExecutor::new(1)), splits(2, None, gold));
        let summary = m.learn().unwrap();

        assert_eq!(summary.total_step, 0);
        let report = summary.last_report.unwrap();
        assert!(report.ends_with("@ 4"));
        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|l| l == "Evaluating started..."));
        assert!(lines.iter().any(|l| l.starts_with("# sample 4;")));
    }

    #[test]
    fn test_eval_norms_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = tiny_config(dir.path());
        cfg.running.audio.eval_norms = true;

        let sample = |id: &str, audio: Vec<f32>| PairSample {
            id:    id.to_string(),
            image: RawArray::zeros(vec![3]),
            audio: RawArray::new(vec![1, 2], audio).unwrap(),
        };
        let batch  = vec![sample("x", vec![1.0, 3.0]), sample("y", vec![2.0, 2.0])];
        let splits = DataSplits {
            main_name: "train".into(),
            main:      Box::new(MemorySource::new(vec![batch])),
            eval:      None,
            gold_file: dir.path().join("x.csv"),
        };
        let (echo, lines) = recording_echo();
        let mut m = monitor(cfg, echo, Box::new(LocalExecutor::new(1)), splits);
        assert!(m.model().is_none());

        let norms = m.learn().unwrap().norms.unwrap();
        assert_eq!(norms.mean, vec![2.0]);
        // E[x^2] = (5 + 4) / 2, E[x]^2 = 4
        assert!((norms.std[0] - 0.5f64.sqrt()).abs() < 1e-6);
        assert!(lines.lock().unwrap().iter().any(|l| l.starts_with("MEAN: ")));
    }

    #[test]
    fn test_unknown_optimizer_fails_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = tiny_config(dir.path());
        cfg.optimizer.optimizer = NamedSpec::new("Adafactor", serde_json::json!({}));
        let (echo, _) = recording_echo();
        let result = Monitor::<TestBackend>::new(
            cfg, echo, Default::default(), Box::new(LocalExecutor::new(1)),
            splits(2, None, dir.path().join("x.csv")), builder(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_epoch_loss_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = tiny_config(dir.path());
        cfg.optimizer.epochs = 2;
        let (echo, lines) = recording_echo();
        let mut m = monitor(cfg, echo, Box::new(LocalExecutor::new(1)), splits(3, None, dir.path().join("x.csv")));
        m.learn().unwrap();

        let lines = lines.lock().unwrap();
        let epochs: Vec<&String> = lines.iter().filter(|l| l.starts_with("Mean loss of epoch")).collect();
        assert_eq!(epochs.len(), 2);
        assert!(epochs[1].starts_with("Mean loss of epoch 1: "));
        assert!(epochs[1].ends_with("over 3 steps"));
    }

    #[test]
    fn test_loss_ceiling_skips_evaluation_but_saves() {
        let dir = tempfile::tempdir().unwrap();
        let gold = dir.path().join("eval.csv");
        std::fs::write(&gold, "id,labels\na0,0\nb0,1\n").unwrap();

        let mut cfg = tiny_config(dir.path());
        cfg.running.save_rate         = 2;
        cfg.running.eval_loss_ceiling = Some(1e-12);
        let (echo, lines) = recording_echo();
        let mut m = monitor(cfg, echo, Box::new(LocalExecutor::new(1)), splits(2, Some(1), gold));
        let summary = m.learn().unwrap();

        assert!(summary.last_report.is_none());
        assert_eq!(summary.checkpoints.len(), 1);
        assert!(lines.lock().unwrap().iter().any(|l| l.starts_with("Skip evaluation: loss ")));
    }

    #[test]
    fn test_secondary_rank_eval_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let gold = dir.path().join("eval.csv");
        std::fs::write(&gold, "id,labels\na0,0\nb0,1\n").unwrap();

        let mut train_cfg = tiny_config(dir.path());
        train_cfg.running.save_rate = 1;
        let (echo, _) = recording_echo();
        let saved = monitor(train_cfg.clone(), echo, Box::new(LocalExecutor::new(1)), splits(1, None, gold.clone()))
            .learn()
            .unwrap()
            .checkpoints;

        let mut cfg = train_cfg;
        cfg.eval       = true;
        cfg.rank       = 1;
        cfg.world_size = 2;
        cfg.model_file = Some(saved[0].display().to_string());
        let (echo, lines) = recording_echo();
        let mut m = monitor(cfg, echo, Box::new(Secondary), splits(1, None, gold));
        let summary = m.learn().unwrap();

        assert!(summary.last_report.is_none());
        let lines = lines.lock().unwrap();
        assert!(!lines.iter().any(|l| l == "Evaluating started..." || l.is_empty()));
    }
}
