//! Deterministic stand-in trainer.
//!
//! Scores are a fixed function of the configuration plus noise seeded from
//! its fingerprint, so the same configuration always yields the same metrics.
//! Used by the `winnow-search` binary for dry runs and by the controller
//! tests.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use wn_optimizer::{estimate, InputShape};
use wn_types::{ArchConfig, MetricValue, Metrics, Stage};

use crate::trainer::{Trainer, TrainerError, TrainerResult};

#[derive(Debug)]
pub struct SurrogateTrainer {
    name: String,
    epochs: usize,
    noise: f64,
    max_params: Option<u64>,
    fatal_after: Option<usize>,
    calls: AtomicUsize,
}

impl Default for SurrogateTrainer {
    fn default() -> Self {
        Self::new()
    }
}

impl SurrogateTrainer {
    pub fn new() -> Self {
        Self {
            name: "surrogate".to_string(),
            epochs: 10,
            noise: 0.02,
            max_params: None,
            fatal_after: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs.max(1);
        self
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise.abs();
        self
    }

    /// Report configs above this parameter count as out of memory.
    pub fn with_memory_limit(mut self, max_params: u64) -> Self {
        self.max_params = Some(max_params);
        self
    }

    /// Fail fatally on every call after the first `n`.
    pub fn with_fatal_after(mut self, n: usize) -> Self {
        self.fatal_after = Some(n);
        self
    }

    /// Number of `train` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Lower is better. Roughly in `[0.3, 0.9]`.
    fn quality(&self, config: &ArchConfig) -> f64 {
        let blocks: f64 = config.blocks().map(|(_, stage)| stage_penalty(stage)).sum();
        let heads: f64 = config
            .slots
            .iter()
            .filter(|(slot, _)| slot.is_head())
            .map(|(_, stage)| stage_penalty(stage))
            .sum();
        let depth = config.blocks().count() as f64;

        let mut rng = ChaCha8Rng::seed_from_u64(fnv1a(config.fingerprint().as_bytes()));
        let noise = if self.noise > 0.0 {
            rng.gen_range(-self.noise..self.noise)
        } else {
            0.0
        };
        (0.55 + blocks + heads - 0.03 * depth.min(4.0) + noise).clamp(0.05, 1.5)
    }

    fn metrics(&self, quality: f64) -> Metrics {
        // per-epoch curves that settle on the final value
        let curve = |last: f64, start: f64| -> MetricValue {
            let n = self.epochs;
            MetricValue::Series(
                (0..n)
                    .map(|e| {
                        let t = (e + 1) as f64 / n as f64;
                        start + (last - start) * t
                    })
                    .collect(),
            )
        };
        let er = (0.8 * quality).min(1.0);
        let f1 = (1.0 - 0.9 * quality).max(0.0);
        let der = 60.0 * quality;
        let derf = (1.0 - 0.7 * quality).max(0.0);

        let mut metrics = Metrics::new();
        metrics.insert("val_error_rate".into(), curve(er, 1.0));
        metrics.insert("val_f1score".into(), curve(f1, 0.0));
        metrics.insert("val_der".into(), curve(der, 90.0));
        metrics.insert("val_derf".into(), curve(derf, 0.0));
        let seld = (er + (1.0 - f1) + der / 180.0 + (1.0 - derf)) / 4.0;
        metrics.insert("val_seld_score".into(), MetricValue::Scalar(seld));
        metrics.insert("val_loss".into(), curve(quality, 2.0 * quality + 1.0));
        metrics
    }
}

#[async_trait]
impl Trainer for SurrogateTrainer {
    async fn train(&self, config: &ArchConfig, input: &InputShape) -> TrainerResult<Metrics> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fatal_after.is_some_and(|n| call >= n) {
            return Err(TrainerError::Fatal(format!("surrogate stopped after {} calls", call)));
        }

        let complexity = estimate(config, input)
            .ok_or_else(|| TrainerError::Unbuildable("feature map collapsed".to_string()))?;
        if let Some(limit) = self.max_params {
            if complexity.params > limit {
                return Err(TrainerError::Unbuildable(format!(
                    "resource exhausted: {} parameters over limit {}",
                    complexity.params, limit
                )));
            }
        }

        let quality = self.quality(config);
        debug!(quality, params = complexity.params, "Surrogate evaluated config");
        Ok(self.metrics(quality))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Fixed per-stage preferences the narrowing engine should discover.
fn stage_penalty(stage: &Stage) -> f64 {
    match stage {
        Stage::Mother(m) => {
            let kernel = [m.kernel_size0, m.kernel_size1, m.kernel_size2]
                .into_iter()
                .filter(|k| *k > 0)
                .map(|k| if k == 3 { 0.0 } else { 0.03 })
                .sum::<f64>();
            kernel + if m.filters1 == 0 { 0.06 } else { 0.0 }
        }
        Stage::Dprnn(d) => 0.04 + if d.bidirectional { 0.0 } else { 0.03 },
        Stage::BiGru(g) => 0.02 + if g.units < 64 { 0.03 } else { 0.0 },
        Stage::Transformer(t) => 0.05 + 0.01 * (t.ff_multiplier - 2.0).abs(),
        Stage::SimpleDense(d) => 0.12 + d.dropout_rate * 0.05,
        Stage::Conformer(c) => 0.0 + if c.pos_encoding.is_none() { 0.02 } else { 0.0 },
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}
