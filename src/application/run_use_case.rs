// ============================================================
// Layer 2 — RunUseCase
// ============================================================
// Orchestrates one run end to end:
//
//   Step 1: Validate the configuration      (Layer 3 - domain)
//   Step 2: Pick the backend and device     (Layer 5 - ml)
//   Step 3: Save the resolved configuration (Layer 6 - infra)
//   Step 4: Spawn one worker per rank; each builds its own
//           dataloaders, model and monitor, then calls learn()
//
// A world of one runs on the calling thread with a local
// executor. Larger worlds run one thread per rank, joined by an
// in-process collective. A rank that fails aborts the group so
// its peers stop at their next reduction.
//
// Reference: Burn Book §5 (Training)

use std::fs;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use burn::backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu};
use burn::tensor::backend::AutodiffBackend;

use crate::data::loader::build_dataloaders;
use crate::domain::config::Config;
use crate::domain::traits::Echo;
use crate::ml::dual_encoder::DualEncoder;
use crate::ml::executor::{
    Collective, DistributedExecutor, Executor, GroupAborted, InProcessGroup, LocalExecutor,
};
use crate::ml::model::Model;
use crate::ml::monitor::{ModelBuilder, Monitor, RunSummary};

type GpuBackend = Autodiff<Wgpu>;
type CpuBackend = Autodiff<NdArray<f32>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceKind {
    Cpu,
    #[default]
    Gpu,
}

pub struct RunUseCase {
    config: Config,
    device: DeviceKind,
}

impl RunUseCase {
    pub fn new(config: Config, device: DeviceKind) -> Self {
        Self { config, device }
    }

    /// Run every rank to completion and return rank zero's summary.
    pub fn execute(&self) -> Result<RunSummary> {
        let cfg = &self.config;
        cfg.validate()?;
        if !cfg.eval && !cfg.running.audio.eval_norms {
            save_config(cfg)?;
        }
        match self.device {
            DeviceKind::Gpu => {
                let device = WgpuDevice::default();
                tracing::info!("Using WGPU device: {:?}", device);
                run_world::<GpuBackend>(cfg, device)
            }
            DeviceKind::Cpu => {
                tracing::info!("Using the CPU backend");
                run_world::<CpuBackend>(cfg, NdArrayDevice::Cpu)
            }
        }
    }
}

fn save_config(cfg: &Config) -> Result<()> {
    let dir = cfg.run_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Cannot create run directory '{}'", dir.display()))?;
    let path = dir.join("config.json");
    fs::write(&path, cfg.to_json()?)
        .with_context(|| format!("Cannot write '{}'", path.display()))?;
    tracing::info!("Config saved to '{}'", path.display());
    Ok(())
}

fn run_world<B: AutodiffBackend>(cfg: &Config, device: B::Device) -> Result<RunSummary> {
    let world = cfg.world_size;
    if world == 1 {
        return run_rank::<B>(cfg.clone(), device, Box::new(LocalExecutor::new(cfg.num_gpus)));
    }

    let group = InProcessGroup::new(world);
    let outcomes: Vec<Result<RunSummary>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..world)
            .map(|rank| {
                let mut cfg = cfg.clone();
                cfg.rank = rank;
                let device = device.clone();
                let collective: Arc<dyn Collective> = group.clone();
                s.spawn(move || -> Result<RunSummary> {
                    let guard = AbortOnExit::new(Arc::clone(&collective));
                    let executor = DistributedExecutor::new(rank, collective)?;
                    let summary = run_rank::<B>(cfg, device, Box::new(executor))?;
                    guard.disarm();
                    Ok(summary)
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, h)| h.join().unwrap_or_else(|_| Err(anyhow!("rank {rank} panicked"))))
            .collect()
    });

    // Report the rank that failed first, not the ones it released.
    let mut summaries = Vec::with_capacity(world);
    let mut released = None;
    for (rank, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(summary) => summaries.push(summary),
            Err(e) if e.is::<GroupAborted>() => {
                released.get_or_insert(e.context(format!("rank {rank} stopped")));
            }
            Err(e) => return Err(e.context(format!("rank {rank} failed"))),
        }
    }
    if let Some(e) = released {
        return Err(e);
    }
    if summaries.is_empty() {
        bail!("no rank finished");
    }
    Ok(summaries.swap_remove(0))
}

/// Aborts the collective when a rank leaves its worker early, by error or panic.
struct AbortOnExit {
    collective: Option<Arc<dyn Collective>>,
}

impl AbortOnExit {
    fn new(collective: Arc<dyn Collective>) -> Self {
        Self { collective: Some(collective) }
    }

    fn disarm(mut self) {
        self.collective = None;
    }
}

impl Drop for AbortOnExit {
    fn drop(&mut self) {
        if let Some(collective) = self.collective.take() {
            collective.abort();
        }
    }
}

fn run_rank<B: AutodiffBackend>(
    cfg:      Config,
    device:   B::Device,
    executor: Box<dyn Executor<B::InnerBackend>>,
) -> Result<RunSummary> {
    let echo   = Echo::tracing(cfg.rank);
    let splits = build_dataloaders(&cfg)?;

    let model_device = device.clone();
    let build: ModelBuilder<'_, B> = Box::new(move |cfg: &Config, echo: Echo| {
        let model = DualEncoder::<B>::new(cfg, echo, &model_device)?;
        Ok(Box::new(model) as Box<dyn Model<B>>)
    });

    let mut monitor = Monitor::<B>::new(cfg, echo, device, executor, splits, build)?;
    monitor.learn()
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    fn write_split(dir: &Path, name: &str, n: usize) {
        let mut f = fs::File::create(dir.join(format!("{name}.jsonl"))).unwrap();
        for i in 0..n {
            let image: Vec<f32> = (0..3).map(|k| ((i + k) % 4) as f32 / 4.0).collect();
            let audio: Vec<f32> = (0..6).map(|k| ((i * 2 + k) % 5) as f32 / 5.0).collect();
            writeln!(
                f,
                r#"{{"id":"s{i}","image":{{"shape":[3],"values":{image:?}}},"audio":{{"shape":[2,3],"values":{audio:?}}}}}"#
            )
            .unwrap();
        }
    }

    fn config(root: &Path) -> Config {
        let mut cfg = Config::default();
        cfg.alias_root                 = root.join("runs").display().to_string();
        cfg.running.data_root          = root.display().to_string();
        cfg.running.batch_size         = 2;
        cfg.running.save_rate          = 4;
        cfg.optimizer.epochs           = 1;
        cfg.model.embed_dim            = 4;
        cfg.model.image.input_dim      = 3;
        cfg.model.audio.num_mel_bins   = 2;
        cfg.model.loss.num_labels      = 2;
        cfg
    }

    #[test]
    fn test_single_rank_run_saves_config_and_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", 8);
        let cfg = config(dir.path());

        let summary = RunUseCase::new(cfg.clone(), DeviceKind::Cpu).execute().unwrap();
        assert_eq!(summary.total_step, 4);
        assert_eq!(summary.checkpoints.len(), 1);
        assert!(cfg.run_dir().join("config.json").is_file());
    }

    #[test]
    fn test_two_ranks_split_the_data() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", 8);
        let mut cfg = config(dir.path());
        cfg.world_size = 2;
        cfg.running.save_rate = 2;

        let summary = RunUseCase::new(cfg, DeviceKind::Cpu).execute().unwrap();
        // each rank sees half the samples, in batches of two
        assert_eq!(summary.total_step, 2);
        assert_eq!(summary.total_inst, 8);
        assert_eq!(summary.checkpoints.len(), 1);
    }

    #[test]
    fn test_failing_rank_stops_its_peers() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", 16);
        write_split(dir.path(), "eval", 4);
        // label 9 is outside the two labels, so rank 0's first report fails
        fs::write(dir.path().join("eval.csv"), "id,labels\ns0,9\n").unwrap();
        let mut cfg = config(dir.path());
        cfg.world_size = 2;
        cfg.running.save_rate = 2;

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(RunUseCase::new(cfg, DeviceKind::Cpu).execute());
        });
        let outcome = rx
            .recv_timeout(std::time::Duration::from_secs(60))
            .expect("ranks did not stop after rank 0 failed");
        let err = outcome.unwrap_err();
        assert!(!err.is::<GroupAborted>(), "root cause hidden: {err:#}");
        assert!(format!("{err:#}").contains("outside 2 labels"), "{err:#}");
    }

    #[test]
    fn test_invalid_config_is_rejected_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.running.batch_size = 0;
        assert!(RunUseCase::new(cfg, DeviceKind::Cpu).execute().is_err());
    }
}
