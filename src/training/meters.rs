//! Training meters and logged statistics

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

use crate::nas::ArchitectureConfig;

/// Named scalar statistics passed to a metrics sink
pub type Stats = BTreeMap<String, f64>;

/// Output of one train or validation step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepStats {
    /// Loss per sample, base 2
    pub loss: f64,
    pub nll_loss: Option<f64>,
    /// Number of samples (or tokens) the loss was averaged over
    pub sample_size: usize,
    /// Extra named values averaged alongside the loss
    #[serde(default)]
    pub extra: BTreeMap<String, f64>,
}

impl StepStats {
    pub fn new(loss: f64, sample_size: usize) -> Self {
        Self {
            loss,
            nll_loss: None,
            sample_size,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_nll_loss(mut self, nll_loss: f64) -> Self {
        self.nll_loss = Some(nll_loss);
        self
    }

    pub fn with_extra(mut self, name: impl Into<String>, value: f64) -> Self {
        self.extra.insert(name.into(), value);
        self
    }
}

/// Weighted running average
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    sum: f64,
    count: f64,
    last: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, weight: f64) {
        self.last = value;
        self.sum += value * weight;
        self.count += weight;
    }

    pub fn avg(&self) -> f64 {
        if self.count > 0.0 {
            self.sum / self.count
        } else {
            0.0
        }
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Accumulated wall time across start/stop pairs
#[derive(Debug, Clone, Default)]
pub struct StopwatchMeter {
    started: Option<Instant>,
    total_secs: f64,
}

impl StopwatchMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.total_secs += started.elapsed().as_secs_f64();
        }
    }

    /// Total seconds, including a running interval
    pub fn elapsed_secs(&self) -> f64 {
        self.total_secs + self.started.map_or(0.0, |s| s.elapsed().as_secs_f64())
    }
}

/// Per-epoch (or per-validation) averages of step outputs
#[derive(Debug, Clone, Default)]
pub struct MeterSet {
    meters: BTreeMap<String, AverageMeter>,
}

impl MeterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one step into the averages, weighting losses by sample size
    pub fn add_step(&mut self, step: &StepStats) {
        let weight = step.sample_size.max(1) as f64;
        self.update("loss", step.loss, weight);
        if let Some(nll) = step.nll_loss {
            self.update("nll_loss", nll, weight);
        }
        for (name, value) in &step.extra {
            self.update(name, *value, 1.0);
        }
    }

    pub fn update(&mut self, name: &str, value: f64, weight: f64) {
        self.meters.entry(name.to_string()).or_default().update(value, weight);
    }

    pub fn avg(&self, name: &str) -> Option<f64> {
        self.meters.get(name).map(AverageMeter::avg)
    }

    /// Averages of every meter, plus perplexity derived from the nll loss (or loss)
    pub fn stats(&self) -> Stats {
        let mut stats: Stats = self
            .meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.avg()))
            .collect();
        if let Some(base) = self.avg("nll_loss").or_else(|| self.avg("loss")) {
            stats.insert("ppl".to_string(), 2f64.powf(base));
        }
        stats
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }

    pub fn reset(&mut self) {
        self.meters.clear();
    }
}

/// Architecture summary logged with every training step
pub fn arch_stats(config: &ArchitectureConfig) -> Stats {
    let mut stats = Stats::new();
    for (region, rc) in config.regions() {
        stats.insert(format!("{}_embed_dim", region), rc.embed_dim as f64);
        stats.insert(format!("{}_layer_num", region), rc.layer_num as f64);
        stats.insert(format!("{}_ffn_embed_dim_avg", region), rc.mean_ffn_embed_dim());
        stats.insert(format!("{}_self_attention_heads_avg", region), rc.mean_attention_heads());
    }
    stats
}
