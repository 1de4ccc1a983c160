#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::{Autodiff, WebGpu};
use burn::config::Config;
use clap::{Parser, ValueEnum};
use env_logger::Env;
use stargan_burn::attack::TargetSignal;
use stargan_burn::data::{ImageSource, LoaderConfig, Split};
use stargan_burn::evaluation::{EvalAttack, EvaluationConfig, Evaluator};
use stargan_burn::labels::{DatasetMode, LabelKind};
use stargan_burn::training::RunDirs;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Translate the held-out set into every target domain.
    Translate,
    /// Measure distortion without perturbing the inputs.
    Clean,
    /// Per-sample attack on the generator output, or on `--layer` when given.
    Pgd,
    WrongClass,
    JointClass,
    IterativeClass,
    Universal,
    /// Per-sample attack against every generator layer in turn.
    FeatureSweep,
}

#[derive(Parser, Debug)]
#[command(about = "Evaluate a trained StarGAN generator with Burn")]
struct Args {
    #[arg(long)]
    run_dir: PathBuf,
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[arg(long)]
    image_dir: PathBuf,
    #[arg(long)]
    attr_path: Option<PathBuf>,
    #[arg(long, default_value_t = 178)]
    crop_size: u32,
    #[arg(long)]
    test_iters: Option<usize>,
    #[arg(long, value_enum, default_value_t = Mode::Pgd)]
    mode: Mode,
    #[arg(long)]
    layer: Option<usize>,
}

type Backend = WebGpu<f32, i32>;
type AutodiffBackend = Autodiff<Backend>;

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let mut config = EvaluationConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if args.test_iters.is_some() {
        config.test_iters = args.test_iters;
    }

    let device = burn::backend::wgpu::WgpuDevice::default();
    let loader = LoaderConfig::new(config.model.image_size as u32)
        .with_batch_size(1)
        .with_crop_size(args.crop_size)
        .with_augment(false);
    let mut source = match config.mode {
        DatasetMode::Single(LabelKind::Categorical) => {
            ImageSource::<AutodiffBackend>::class_folders(&args.image_dir, loader, &device)
                .with_context(|| format!("failed to scan class folders in {}", args.image_dir.display()))?
        }
        DatasetMode::Single(LabelKind::Binary) | DatasetMode::Joint => {
            let attr_path = args
                .attr_path
                .as_deref()
                .context("--attr-path is required for attribute-list datasets")?;
            ImageSource::<AutodiffBackend>::attribute_list(
                &args.image_dir,
                attr_path,
                &config.selected_attrs,
                Split::Test,
                loader,
                &device,
            )
            .with_context(|| format!("failed to read attributes from {}", attr_path.display()))?
        }
    };

    let evaluator = Evaluator::<AutodiffBackend>::from_checkpoint(config, RunDirs::under(&args.run_dir), device)
        .context("failed to restore the generator")?;

    let attack = match args.mode {
        Mode::Translate => {
            let written = evaluator.translate(&mut source)?;
            log::info!("translated {written} batches");
            return Ok(());
        }
        Mode::FeatureSweep => {
            for (signal, report) in evaluator.feature_sweep(&mut source)? {
                println!("{signal}: {report}");
            }
            return Ok(());
        }
        Mode::Clean => EvalAttack::Disabled,
        Mode::Pgd => EvalAttack::Pgd {
            signal: args.layer.map(TargetSignal::Layer).unwrap_or_default(),
        },
        Mode::WrongClass => EvalAttack::WrongClass,
        Mode::JointClass => EvalAttack::JointClass,
        Mode::IterativeClass => EvalAttack::IterativeClass,
        Mode::Universal => EvalAttack::Universal,
    };
    let report = evaluator.evaluate(&mut source, attack)?;
    println!("{report}");
    Ok(())
}
