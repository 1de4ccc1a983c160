#![recursion_limit = "256"]
use anyhow::{Context, Result, bail};
use burn::backend::wgpu::graphics::AutoGraphicsApi;
use burn::backend::wgpu::{RuntimeOptions, init_setup};
use burn::backend::{Autodiff, WebGpu};
use burn::config::Config;
use clap::Parser;
use env_logger::Env;
use stargan_burn::data::{ImageSource, LoaderConfig, Split};
use stargan_burn::labels::{DatasetMode, LabelKind};
use stargan_burn::model::ModelConfig;
use stargan_burn::training::{RunDirs, Solver, TrainingConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Train StarGAN with Burn")]
struct Args {
    /// Run directory holding `logs`, `samples`, `models` and `results`.
    #[arg(long)]
    run_dir: PathBuf,
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Images of the attribute-list dataset, or class folders in categorical mode.
    #[arg(long)]
    image_dir: PathBuf,
    #[arg(long)]
    attr_path: Option<PathBuf>,
    /// Class folders of the second dataset in joint mode.
    #[arg(long)]
    second_image_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 178)]
    crop_size: u32,
    #[arg(long, default_value_t = 256)]
    second_crop_size: u32,
    #[arg(long)]
    resume_iters: Option<usize>,
}

type Backend = WebGpu<f32, i32>;
type AutodiffBackend = Autodiff<Backend>;

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let mut config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if args.resume_iters.is_some() {
        config.resume_iters = args.resume_iters;
    }

    let device = burn::backend::wgpu::WgpuDevice::default();
    let setup = init_setup::<AutoGraphicsApi>(&device, RuntimeOptions::default());
    let max_storage_buffer_binding_size = setup.device.limits().max_storage_buffer_binding_size as u64;
    let condition_dim = config.label_encoder()?.condition_dim();
    adjust_batch_size_for_wgpu(&mut config, condition_dim, max_storage_buffer_binding_size)?;

    let loader = |crop_size: u32| {
        LoaderConfig::new(config.model.image_size as u32)
            .with_batch_size(config.batch_size)
            .with_crop_size(crop_size)
            .with_seed(config.seed)
    };
    let dirs = RunDirs::under(&args.run_dir);

    match config.mode {
        DatasetMode::Single(LabelKind::Binary) => {
            let attr_path = args
                .attr_path
                .as_deref()
                .context("--attr-path is required for attribute-list datasets")?;
            let mut source = ImageSource::<AutodiffBackend>::attribute_list(
                &args.image_dir,
                attr_path,
                &config.selected_attrs,
                Split::Train,
                loader(args.crop_size),
                &device,
            )
            .with_context(|| format!("failed to read attributes from {}", attr_path.display()))?;
            let mut solver = Solver::<AutodiffBackend>::new(config, dirs, device)?;
            solver.train(&mut source)?;
        }
        DatasetMode::Single(LabelKind::Categorical) => {
            let mut source =
                ImageSource::<AutodiffBackend>::class_folders(&args.image_dir, loader(args.crop_size), &device)
                    .with_context(|| format!("failed to scan class folders in {}", args.image_dir.display()))?;
            let mut solver = Solver::<AutodiffBackend>::new(config, dirs, device)?;
            solver.train(&mut source)?;
        }
        DatasetMode::Joint => {
            let (Some(attr_path), Some(second_dir)) = (args.attr_path.as_deref(), args.second_image_dir.as_deref())
            else {
                bail!("joint mode needs --attr-path and --second-image-dir");
            };
            let mut first = ImageSource::<AutodiffBackend>::attribute_list(
                &args.image_dir,
                attr_path,
                &config.selected_attrs,
                Split::Train,
                loader(args.crop_size),
                &device,
            )
            .with_context(|| format!("failed to read attributes from {}", attr_path.display()))?;
            let mut second =
                ImageSource::<AutodiffBackend>::class_folders(second_dir, loader(args.second_crop_size), &device)
                    .with_context(|| format!("failed to scan class folders in {}", second_dir.display()))?;
            let mut solver = Solver::<AutodiffBackend>::new(config, dirs, device)?;
            solver.train_multi(&mut first, &mut second)?;
        }
    }
    Ok(())
}

fn adjust_batch_size_for_wgpu(
    config: &mut TrainingConfig,
    condition_dim: usize,
    max_storage_buffer_binding_size: u64,
) -> Result<()> {
    let elem_bytes = std::mem::size_of::<f32>() as u64;
    let per_sample_bytes = estimate_max_conv_workspace_elems(&config.model, condition_dim).saturating_mul(elem_bytes);
    if per_sample_bytes == 0 {
        return Ok(());
    }

    let safe_limit = max_storage_buffer_binding_size.saturating_sub(1);
    let max_batch = (safe_limit / per_sample_bytes) as usize;
    if max_batch == 0 {
        bail!(
            "WGPU max storage buffer size ({max_storage_buffer_binding_size} bytes) is too small for a single sample (estimated {per_sample_bytes} bytes). Reduce image_size or model dims."
        );
    }

    if config.batch_size > max_batch {
        log::warn!(
            "wgpu max storage buffer size {max_storage_buffer_binding_size} bytes; estimated max conv workspace per sample {per_sample_bytes} bytes. lowering batch_size from {} to {max_batch}.",
            config.batch_size
        );
        config.batch_size = max_batch;
    }

    Ok(())
}

/// Largest im2col workspace, in elements, over the generator and discriminator convolutions.
fn estimate_max_conv_workspace_elems(model: &ModelConfig, condition_dim: usize) -> u64 {
    let size = model.image_size as u64;
    let channels = model.image_channels as u64;
    let g_dim = model.g_conv_dim as u64;
    let d_dim = model.d_conv_dim as u64;
    let mut max_elems = 0u64;
    let mut track = |in_channels: u64, out_size: u64, kernel: u64| {
        max_elems = max_elems.max(in_channels * out_size * out_size * kernel * kernel);
    };

    // Generator: 7x7 stem on image plus condition maps, two strided downsamples,
    // residual blocks at a quarter resolution, two transposed upsamples, 7x7 head.
    track(channels + condition_dim as u64, size, 7);
    for step in 0..2u32 {
        track(g_dim << step, conv_out(size >> step, 4, 2, 1), 4);
    }
    if model.g_repeat_num > 0 {
        track(g_dim * 4, size / 4, 3);
    }
    for step in 0..2u32 {
        // col2im workspace is sized by the output channels at the input resolution.
        track((g_dim * 4) >> (step + 1), (size / 4) << step, 4);
    }
    track(g_dim, size, 7);

    // Discriminator: strided 4x4 convolutions halving the resolution each time.
    let mut disc_size = size;
    let mut disc_in_channels = channels;
    for layer in 0..model.d_repeat_num as u32 {
        disc_size = conv_out(disc_size, 4, 2, 1);
        track(disc_in_channels, disc_size, 4);
        disc_in_channels = d_dim << layer;
    }

    max_elems
}

fn conv_out(input: u64, kernel: u64, stride: u64, padding: u64) -> u64 {
    (input + 2 * padding - (kernel - 1) - 1) / stride + 1
}
