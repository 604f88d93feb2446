// ============================================================
// Layer 5 — Dual Encoder
// ============================================================
// A small image/audio contrastive model that satisfies the
// model contract end to end:
//
//   image_head  GAP over (H, W), or pre-computed features
//               → linear → embedding          (frozen)
//   audio_head  mean over time of (B, 1, F, T)
//               → linear → embedding          (tunable)
//   loss_head   logit_scale                   (tunable)
//               label_embedding (L, E)        (frozen)
//
// Training:   symmetric InfoNCE between the L2-normalised
//             image and audio embeddings of a batch.
// Evaluation: rank 0 scores every clip against every label,
//             sigmoid(exp(logit_scale) * cos(audio, label)),
//             and keeps the scores until `report`.
//
// Heads are initialised and checkpointed as Burn modules
// (see `heads`); the forward pass reads the flat store.
//
// Reference: Radford et al. (2021) CLIP
//            van den Oord et al. (2018) InfoNCE

use std::marker::PhantomData;
use std::path::Path;

use anyhow::{bail, Result};
use burn::{
    nn::loss::CrossEntropyLossConfig,
    tensor::{
        activation::sigmoid,
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
};

use crate::data::batcher::{Batch, Primary};
use crate::domain::config::Config;
use crate::domain::traits::Echo;
use crate::infra::checkpoint::{Checkpoint, CheckpointError, HeadRecord};
use crate::infra::gold::GoldLabels;
use crate::infra::metrics::MultiLabelMetrics;
use crate::ml::heads::{self, HeadsConfig, LossHead, ProjectionHead, StoredHead, Write};
use crate::ml::model::{ForwardArgs, Model};
use crate::ml::params::{Leaves, ParamStore, TunableSet};

const IMAGE_HEAD: &str = "image_head";
const AUDIO_HEAD: &str = "audio_head";
const LOSS_HEAD:  &str = "loss_head";

pub struct DualEncoder<B: AutodiffBackend> {
    cfg:      Config,
    echo:     Echo,
    store:    ParamStore<B::InnerBackend>,
    training: bool,
    scores:   Vec<f32>,
    ids:      Vec<String>,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> DualEncoder<B> {
    /// Fresh weights from Burn's initializers, seeded with `cfg.seed`.
    pub fn new(cfg: &Config, echo: Echo, device: &<B::InnerBackend as Backend>::Device) -> Result<Self> {
        let m = &cfg.model;
        let heads = HeadsConfig::new(m.image.input_dim, m.audio.num_mel_bins, m.embed_dim, m.loss.num_labels)
            .with_init_logit_scale(m.loss.init_logit_scale);

        <B::InnerBackend as Backend>::seed(cfg.seed);
        let mut store = ParamStore::new(device.clone());
        heads.init_image::<B::InnerBackend>(device).write(IMAGE_HEAD, &mut store, Write::Register)?;
        heads.init_audio::<B::InnerBackend>(device).write(AUDIO_HEAD, &mut store, Write::Register)?;
        heads.init_loss::<B::InnerBackend>(device).write(LOSS_HEAD, &mut store, Write::Register)?;

        Ok(Self {
            cfg: cfg.clone(),
            echo,
            store,
            training: !cfg.eval,
            scores:   Vec::new(),
            ids:      Vec::new(),
            _backend: PhantomData,
        })
    }

    fn embed_images(&self, leaves: &Leaves<B>, images: &Primary<B>) -> Result<Tensor<B, 2>> {
        let expected = self.cfg.model.image.input_dim;
        let x = match images {
            Primary::Pixels(t) => {
                let [b, c, _, _] = t.dims();
                if c != expected {
                    bail!("image head expects {expected} channels, got {c}");
                }
                t.clone().mean_dim(3).mean_dim(2).reshape([b, c])
            }
            Primary::Features(t) => {
                let [_, d] = t.dims();
                if d != expected {
                    bail!("image head expects {expected} features, got {d}");
                }
                t.clone()
            }
        };
        Ok(linear(x, leaves.get(&format!("{IMAGE_HEAD}.weight"))?, leaves.get(&format!("{IMAGE_HEAD}.bias"))?))
    }

    fn embed_audios(&self, leaves: &Leaves<B>, audios: &Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let [b, _, f, _] = audios.dims();
        if f != self.cfg.model.audio.num_mel_bins {
            bail!("audio head expects {} mel bins, got {f}", self.cfg.model.audio.num_mel_bins);
        }
        let x = audios.clone().mean_dim(3).reshape([b, f]);
        Ok(linear(x, leaves.get(&format!("{AUDIO_HEAD}.weight"))?, leaves.get(&format!("{AUDIO_HEAD}.bias"))?))
    }

    fn contrastive_loss(&self, images: Tensor<B, 2>, audios: Tensor<B, 2>, scale: Tensor<B, 1>) -> Tensor<B, 1> {
        let [n, _] = images.dims();
        let device = images.device();
        let logits = normalize(images)
            .matmul(normalize(audios).transpose())
            .mul(scale.exp().reshape([1, 1]).expand([n, n]));
        let targets = Tensor::<B, 1, Int>::arange(0..n as i64, &device);
        let ce = CrossEntropyLossConfig::new().init(&device);
        let l_image = ce.forward(logits.clone(), targets.clone());
        let l_audio = ce.forward(logits.transpose(), targets);
        (l_image + l_audio).div_scalar(2.0)
    }

    fn accumulate(&mut self, leaves: &Leaves<B>, audios: Tensor<B, 2>, names: &[String]) -> Result<()> {
        let [n, _] = audios.dims();
        let labels: Tensor<B, 2> = leaves.get(&format!("{LOSS_HEAD}.label_embedding"))?;
        let scale:  Tensor<B, 1> = leaves.get(&format!("{LOSS_HEAD}.logit_scale"))?;
        let nlabel = labels.dims()[0];
        let cos    = normalize(audios).matmul(normalize(labels).transpose());
        let probs  = sigmoid(cos.mul(scale.exp().reshape([1, 1]).expand([n, nlabel])));
        let values = probs
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("cannot read scores: {e:?}"))?;
        if names.len() != n {
            bail!("{} names for a batch of {n}", names.len());
        }
        self.scores.extend(values);
        self.ids.extend_from_slice(names);
        Ok(())
    }
}

fn linear<B: AutodiffBackend>(x: Tensor<B, 2>, weight: Tensor<B, 2>, bias: Tensor<B, 1>) -> Tensor<B, 2> {
    let [n, _] = x.dims();
    let [e]    = bias.dims();
    x.matmul(weight) + bias.unsqueeze::<2>().expand([n, e])
}

fn normalize<B: AutodiffBackend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, e] = x.dims();
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).add_scalar(1e-12).sqrt();
    x.div(norm.expand([n, e]))
}

impl<B: AutodiffBackend> Model<B> for DualEncoder<B> {
    fn build(&mut self) -> Result<TunableSet> {
        if let Some(path) = self.cfg.model.pretrained.clone() {
            let ckpt  = Checkpoint::load(&path)?;
            let heads: Vec<&str> = [IMAGE_HEAD, LOSS_HEAD]
                .into_iter()
                .filter(|h| ckpt.head(h).is_ok())
                .collect();
            if heads.is_empty() {
                bail!("pretrained checkpoint '{path}' holds neither {IMAGE_HEAD} nor {LOSS_HEAD}");
            }
            self.import_heads(&ckpt.heads, Some(&heads))?;
            self.echo.say(format!("Initialized {} from '{path}'.", heads.join(" and ")));
        }

        if self.cfg.eval {
            if let Some(path) = self.cfg.model_file.clone() {
                let ckpt = Checkpoint::load(&path)?;
                let run  = ckpt.config()?;
                if run.model.loss.num_labels != self.cfg.model.loss.num_labels {
                    bail!(
                        "'{path}' was trained with {} labels, this run expects {}",
                        run.model.loss.num_labels,
                        self.cfg.model.loss.num_labels
                    );
                }
                self.import_heads(&ckpt.heads, None)?;
                self.echo.say(format!("Loaded model from '{path}' (run '{}', step {}).", run.model_name, ckpt.step));
            }
            return Ok(TunableSet::new());
        }

        Ok([
            format!("{AUDIO_HEAD}.weight"),
            format!("{AUDIO_HEAD}.bias"),
            format!("{LOSS_HEAD}.logit_scale"),
        ]
        .into_iter()
        .collect())
    }

    fn params(&self) -> &ParamStore<B::InnerBackend> {
        &self.store
    }

    fn params_mut(&mut self) -> &mut ParamStore<B::InnerBackend> {
        &mut self.store
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn forward(
        &mut self,
        leaves: &Leaves<B>,
        batch:  &Batch<B>,
        args:   ForwardArgs<'_>,
    ) -> Result<Option<Tensor<B, 1>>> {
        let audios = self.embed_audios(leaves, &batch.audios)?;
        if self.training {
            let images = self.embed_images(leaves, &batch.images)?;
            let scale  = leaves.get(&format!("{LOSS_HEAD}.logit_scale"))?;
            return Ok(Some(self.contrastive_loss(images, audios, scale)));
        }
        if self.cfg.rank == 0 {
            let names = args.names.unwrap_or(&batch.ids);
            self.accumulate(leaves, audios, names)?;
        }
        Ok(None)
    }

    fn report(&mut self, gold_file: &Path) -> Result<String> {
        let ids    = std::mem::take(&mut self.ids);
        let scores = std::mem::take(&mut self.scores);
        if ids.is_empty() {
            tracing::warn!("Nothing to report: no predictions were accumulated");
            return Ok(String::new());
        }
        let nlabel = self.cfg.model.loss.num_labels;
        let gold   = GoldLabels::load(gold_file, nlabel)?;

        let mut labels = Vec::with_capacity(scores.len());
        let mut missing = 0usize;
        for id in &ids {
            match gold.multi_hot(id) {
                Some(row) => labels.extend(row),
                None => {
                    missing += 1;
                    labels.extend(std::iter::repeat(0.0).take(nlabel));
                }
            }
        }
        if missing > 0 {
            tracing::warn!("{missing} of {} evaluated ids are not in '{}'", ids.len(), gold_file.display());
        }

        let mut metrics = MultiLabelMetrics::new();
        metrics.accumulate(&scores, &labels, nlabel)?;
        Ok(metrics.report()?.to_string())
    }

    fn checkpoint_heads(&self) -> Vec<&'static str> {
        vec![AUDIO_HEAD, LOSS_HEAD]
    }

    fn export_head(&self, head: &str) -> Result<HeadRecord> {
        match head {
            IMAGE_HEAD | AUDIO_HEAD => heads::encode::<_, ProjectionHead<_>>(head, &self.store),
            LOSS_HEAD => heads::encode::<_, LossHead<_>>(head, &self.store),
            other => Err(CheckpointError::UnknownHead(other.to_string()).into()),
        }
    }

    fn import_head(&mut self, head: &str, record: &HeadRecord) -> Result<(), CheckpointError> {
        match head {
            IMAGE_HEAD | AUDIO_HEAD => heads::decode::<_, ProjectionHead<_>>(head, record, &mut self.store),
            LOSS_HEAD => heads::decode::<_, LossHead<_>>(head, record, &mut self.store),
            other => Err(CheckpointError::UnknownHead(other.to_string())),
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::batcher::BatchPipeline;
    use crate::domain::sample::{RawArray, RawBatch};
    use crate::infra::checkpoint::CheckpointManager;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::ElementConversion;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_config() -> Config {
        let mut cfg = Config::default();
        cfg.model.embed_dim          = 4;
        cfg.model.image.input_dim    = 3;
        cfg.model.audio.num_mel_bins = 2;
        cfg.model.loss.num_labels    = 2;
        cfg
    }

    fn batch(n: usize) -> Batch<TestBackend> {
        let images: Vec<f32> = (0..n * 3).map(|i| (i % 7) as f32 / 7.0).collect();
        let audios: Vec<f32> = (0..n * 2 * 3).map(|i| (i % 5) as f32 / 5.0).collect();
        let raw = RawBatch {
            images: RawArray::new(vec![n, 3], images).unwrap(),
            audios: RawArray::new(vec![n, 2, 3], audios).unwrap(),
            ids:    (0..n).map(|i| format!("clip{i}")).collect(),
        };
        BatchPipeline::new(Default::default(), 8).make_batch(raw).unwrap()
    }

    fn args() -> ForwardArgs<'static> {
        ForwardArgs { device_ids: &[0], names: None }
    }

    #[test]
    fn test_training_loss_reaches_tunable_heads_only() {
        let cfg = tiny_config();
        let mut model = DualEncoder::<TestBackend>::new(&cfg, Echo::new(|_| {}), &Default::default()).unwrap();
        let tunable = model.build().unwrap();
        model.params_mut().select_tunable(&tunable).unwrap();

        let leaves = model.params().leaves::<TestBackend>(true);
        let loss = model.forward(&leaves, &batch(4), args()).unwrap().unwrap();
        assert!(loss.clone().into_scalar().elem::<f64>().is_finite());

        let grads = leaves.gradients(&loss.backward());
        for name in grads.grads.keys() {
            assert!(tunable.contains(name), "{name} should be frozen");
        }
        assert!(grads.get("audio_head.weight").is_some());
    }

    #[test]
    fn test_eval_accumulates_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let gold = dir.path().join("eval.csv");
        std::fs::write(&gold, "id,labels\nclip0,0\nclip1,1\nclip2,0;1\n").unwrap();

        let cfg = Config { eval: true, ..tiny_config() };
        let mut model = DualEncoder::<TestBackend>::new(&cfg, Echo::new(|_| {}), &Default::default()).unwrap();
        assert!(model.build().unwrap().is_empty());
        assert!(!model.is_training());

        let leaves = model.params().leaves::<TestBackend>(false);
        let b = batch(4);
        let out = model.forward(&leaves, &b, ForwardArgs { device_ids: &[0], names: Some(&b.ids) }).unwrap();
        assert!(out.is_none());

        let report = model.report(&gold).unwrap();
        assert!(report.starts_with("Mac-AP = "));
        assert!(report.ends_with("@ 4"));
        // buffers were drained
        assert_eq!(model.report(&gold).unwrap(), "");
    }

    #[test]
    fn test_partial_restore_of_heads() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_config();
        let src = DualEncoder::<TestBackend>::new(&Config { seed: 7, ..cfg.clone() }, Echo::new(|_| {}), &Default::default()).unwrap();
        let heads = src.export_heads(&src.checkpoint_heads()).unwrap();
        let mut mgr = CheckpointManager::new(dir.path());
        let path = mgr.save(&Checkpoint::new(3, &cfg, heads).unwrap()).unwrap();

        let mut dst = DualEncoder::<TestBackend>::new(&cfg, Echo::new(|_| {}), &Default::default()).unwrap();
        let image_before = dst.params().to_vec("image_head.weight").unwrap();
        let ckpt = Checkpoint::load(&path).unwrap();
        dst.import_heads(&ckpt.heads, Some(&["audio_head"])).unwrap();

        assert_eq!(dst.params().to_vec("audio_head.weight").unwrap(), src.params().to_vec("audio_head.weight").unwrap());
        assert_ne!(dst.params().to_vec("loss_head.label_embedding").unwrap(), src.params().to_vec("loss_head.label_embedding").unwrap());
        assert_eq!(dst.params().to_vec("image_head.weight").unwrap(), image_before);
        assert!(dst.import_heads(&ckpt.heads, Some(&["image_head"])).is_err());
    }

    #[test]
    fn test_heads_follow_config() {
        let cfg = tiny_config();
        let a = DualEncoder::<TestBackend>::new(&cfg, Echo::new(|_| {}), &Default::default()).unwrap();
        assert_eq!(a.params().iter().count(), 6);
        assert_eq!(a.params().get("audio_head.weight").unwrap().shape, vec![2, 4]);
        assert_eq!(
            a.params().to_vec("loss_head.logit_scale").unwrap(),
            vec![cfg.model.loss.init_logit_scale]
        );
        // unknown heads are rejected by name
        assert!(matches!(
            a.export_head("text_head").unwrap_err().downcast_ref::<CheckpointError>(),
            Some(CheckpointError::UnknownHead(_))
        ));
    }
}
