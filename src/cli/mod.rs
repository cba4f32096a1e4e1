//! Kolosal Supernet CLI Module
//!
//! Command-line tooling for inspecting a search space, sampling architectures,
//! building candidate pools and profiling sub-network sizes.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::elastic::SuperNet;
use crate::nas::{ArchitectureConfig, ArchitectureSampler, CandidatePool, TaskKind};
use crate::training::SupernetConfig;

// ─── Styling helpers ───────────────────────────────────────────────────────────

fn dim(s: &str) -> ColoredString   { s.truecolor(100, 100, 100) }
fn accent(s: &str) -> ColoredString { s.truecolor(120, 170, 255) }
fn muted(s: &str) -> ColoredString  { s.truecolor(140, 140, 140) }
fn ok(s: &str) -> ColoredString     { s.truecolor(100, 210, 120) }

fn kv(key: &str, val: &str) {
    println!("  {:<14} {}", muted(key), val.white());
}

fn step_ok(msg: &str) {
    println!("  {} {}", ok("✓"), msg);
}

fn step_run(msg: &str) {
    print!("  {} {}... ", accent("›"), msg);
}

fn step_done(detail: &str) {
    println!("{} {}", ok("done"), dim(detail));
}

fn section(title: &str) {
    println!();
    println!("  {}", title.white().bold());
    println!("  {}", dim(&"─".repeat(56)));
}

fn format_count(n: u128) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

// ─── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "kolosal-supernet")]
#[command(author = "KolosalAI")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Elastic supernet training and architecture search tooling")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Summarize the search space of a run configuration
    Space {
        /// Run configuration (JSON); defaults to the WMT translation space
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Sample architectures deterministically from consecutive seeds
    Sample {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// First seed (the update counter during training)
        #[arg(short, long, default_value = "0")]
        seed: u64,

        /// Number of architectures
        #[arg(short = 'n', long, default_value = "1")]
        count: u64,
    },

    /// Build the candidate pool used for ranking
    Pool {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Pool size (overrides the configuration)
        #[arg(long)]
        size: Option<usize>,

        /// Pool seed (overrides the configuration)
        #[arg(long)]
        seed: Option<u64>,

        /// Output JSON file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Count parameters and MACs of sub-networks
    Params {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Architecture file (JSON); defaults to the smallest and largest of the space
        #[arg(short, long)]
        arch: Option<PathBuf>,

        /// Width of one attention head
        #[arg(long, default_value = "64")]
        head_dim: usize,

        /// Stem kernel size of convolutional backbones
        #[arg(long, default_value = "3")]
        kernel_size: usize,
    },
}

/// Load and validate a run configuration, or the default one
pub fn load_config(path: Option<&Path>) -> anyhow::Result<SupernetConfig> {
    let config = match path {
        Some(path) => SupernetConfig::from_json_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => SupernetConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Supernet matching the task of `config`
pub fn build_supernet(config: &SupernetConfig, head_dim: usize, kernel_size: usize) -> anyhow::Result<SuperNet> {
    let net = match &config.task {
        TaskKind::Classification { .. } => {
            let channels = config.task.dummy_input().channels().unwrap_or(3);
            SuperNet::conv_backbone(&config.search_space, channels, kernel_size, config.seed)?
        }
        _ => SuperNet::transformer(&config.search_space, head_dim, config.seed)?,
    };
    Ok(net)
}

// ─── Space ─────────────────────────────────────────────────────────────────────

pub fn cmd_space(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let space = &config.search_space;
    let task = &config.task;

    section("Search Space");
    kv("Task", task.name());
    kv("Regions", &task.regions().iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", "));
    kv("Architectures", &format_count(space.cardinality(task)?));
    kv("Ranked", if config.ranks_candidates() { "yes" } else { "no" });

    for &region in task.regions() {
        let rs = space.region(region)?;
        section(&format!("{} choices", region));
        kv("embed_dim", &format!("{:?}", rs.embed_dim));
        kv("layer_num", &format!("{:?}", rs.layer_num));
        kv("ffn_embed_dim", &format!("{:?}", rs.ffn_embed_dim));
        kv("attention", &format!("{:?}", rs.attention_heads));
        if !rs.cross_attention_heads.is_empty() {
            kv("cross_attn", &format!("{:?}", rs.cross_attention_heads));
        }
        if !rs.arbitrary_ende_attn.is_empty() {
            kv("ende_attn", &format!("{:?}", rs.arbitrary_ende_attn));
        }
    }

    println!();
    Ok(())
}

// ─── Sample ────────────────────────────────────────────────────────────────────

pub fn cmd_sample(config_path: Option<&Path>, seed: u64, count: u64) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let sampler = ArchitectureSampler::new(config.search_space.clone(), config.task.clone())?;

    section("Sampled Architectures");
    for s in seed..seed.saturating_add(count) {
        let arch = sampler.sample_with_seed(s)?;
        println!("  {} {}", muted(&format!("seed {:>6}", s)), arch);
    }
    println!();
    Ok(())
}

// ─── Pool ──────────────────────────────────────────────────────────────────────

pub fn cmd_pool(
    config_path: Option<&Path>,
    size: Option<usize>,
    seed: Option<u64>,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let sampler = ArchitectureSampler::new(config.search_space.clone(), config.task.clone())?;
    let size = size.unwrap_or(config.candidate_pool_size);
    let seed = seed.unwrap_or(config.seed);
    let attempts = config.max_pool_attempts.unwrap_or_else(|| size.saturating_mul(50));

    section("Candidate Pool");
    step_run(&format!("Sampling {} distinct architectures", size));
    let start = Instant::now();
    let pool = CandidatePool::seeded(&sampler, size, attempts, seed)?;
    step_done(&format!("{:.2}s", start.elapsed().as_secs_f64()));

    match output {
        Some(path) => {
            std::fs::write(path, serde_json::to_string_pretty(&pool)?)
                .with_context(|| format!("failed to write {}", path.display()))?;
            step_ok(&format!("Wrote pool to {}", path.display()));
        }
        None => {
            for (i, arch) in pool.iter().enumerate() {
                println!("  {} {}", muted(&format!("{:>4}", i)), arch);
            }
        }
    }
    println!();
    Ok(())
}

// ─── Params ────────────────────────────────────────────────────────────────────

pub fn cmd_params(
    config_path: Option<&Path>,
    arch_path: Option<&Path>,
    head_dim: usize,
    kernel_size: usize,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let space = &config.search_space;
    let task = &config.task;

    let archs: Vec<(String, ArchitectureConfig)> = match arch_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let arch: ArchitectureConfig = serde_json::from_str(&text)?;
            space.validate_config(task, &arch)?;
            vec![(path.display().to_string(), arch)]
        }
        None => vec![
            ("smallest".to_string(), space.smallest(task)?),
            ("largest".to_string(), space.largest(task)?),
        ],
    };

    let mut net = build_supernet(&config, head_dim, kernel_size)?;
    let input = task.dummy_input();

    section("Supernet");
    kv("Layers", &net.len().to_string());
    kv("Parameters", &format_count(net.total_param_num() as u128));

    for (name, arch) in &archs {
        let params = net.sampled_param_count(arch)?;
        let macs = net.profile_macs(arch, &input)?;
        let active = net.active_len();

        section(&format!("Sub-network: {}", name));
        kv("Active layers", &active.to_string());
        kv("Parameters", &format_count(params as u128));
        kv("MACs", &format_count(macs as u128));
    }

    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1000), "1,000");
        assert_eq!(format_count(1234567), "1,234,567");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["kolosal-supernet", "sample", "--seed", "5", "-n", "3"]).unwrap();
        match cli.command {
            Commands::Sample { seed, count, config } => {
                assert_eq!(seed, 5);
                assert_eq!(count, 3);
                assert!(config.is_none());
            }
            _ => panic!("expected sample"),
        }
    }

    #[test]
    fn test_build_supernet_per_task() {
        use crate::nas::{Region, RegionSpace, SearchSpace};

        let translation = SupernetConfig::new(
            TaskKind::translation_iwslt(),
            SearchSpace::new()
                .with_region(Region::Encoder, RegionSpace::new(vec![8], vec![1], vec![16], vec![2]))
                .with_region(Region::Decoder, RegionSpace::new(vec![8], vec![1], vec![16], vec![2])),
        );
        let net = build_supernet(&translation, 4, 3).unwrap();
        assert!(net.layer_names().any(|n| n.starts_with("encoder.")));

        let classification = SupernetConfig::new(
            TaskKind::Classification { num_classes: 10 },
            SearchSpace::new().with_region(Region::Backbone, RegionSpace::new(vec![8], vec![2], vec![16], vec![1])),
        );
        let net = build_supernet(&classification, 4, 3).unwrap();
        assert_eq!(net.layer_names().next(), Some("backbone.stem"));
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config(Some(Path::new("/nonexistent/config.json"))).is_err());
    }
}
