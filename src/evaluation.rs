use crate::attack::{ConditionedTarget, PgdAttack, PgdConfig, Perturbed, TargetSignal, UniversalPerturbation};
use crate::checkpoint::CheckpointStore;
use crate::data::{Batch, DataSource};
use crate::error::{Result, StarganError};
use crate::labels::{DatasetMode, LabelEncoder};
use crate::model::{Generator, ModelConfig, Translation, Translator};
use crate::training::RunDirs;
use crate::utils::save_columns;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Evaluation configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct EvaluationConfig {
    pub model: ModelConfig,
    pub mode: DatasetMode,
    pub selected_attrs: Vec<String>,
    /// Checkpoint to evaluate; the latest saved one when unset.
    pub test_iters: Option<usize>,
    #[config(default = 50)]
    pub max_batches: usize,
    /// Per-image MSE above which a translation counts as distorted.
    #[config(default = 0.05)]
    pub distortion_threshold: f64,
    /// Random start, since a clean reference has zero loss gradient at the clean input.
    #[config(default = "PgdConfig::new().with_random_init(true)")]
    pub attack: PgdConfig,
    #[config(default = true)]
    pub save_images: bool,
}

impl EvaluationConfig {
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.attack.validate()?;
        if !(self.distortion_threshold.is_finite() && self.distortion_threshold >= 0.0) {
            return Err(StarganError::config(format!(
                "distortion threshold must be non-negative, got {}",
                self.distortion_threshold
            )));
        }
        Ok(())
    }
}

/// How held-out inputs are perturbed before translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalAttack {
    Disabled,
    /// Fresh per-sample attack for every target label.
    Pgd { signal: TargetSignal },
    /// One perturbation crafted against the first target label, reused for all of them.
    WrongClass,
    /// One perturbation whose loss sums over every target label.
    JointClass,
    /// One perturbation stepping through the target labels in turn.
    IterativeClass,
    /// One shared perturbation accumulated over the held-out batches.
    Universal,
}

/// Mean distortion between clean and attacked translations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DistortionReport {
    pub samples: usize,
    pub l1: f64,
    pub l2: f64,
    pub l0: f64,
    pub linf: f64,
    pub distorted_fraction: f64,
}

impl fmt::Display for DistortionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} images. L1 error: {:.5}. L2 error: {:.5}. prop_dist: {:.5}. L0 error: {:.5}. L_inf error: {:.5}.",
            self.samples, self.l1, self.l2, self.distorted_fraction, self.l0, self.linf
        )
    }
}

/// Running per-image distortion sums.
#[derive(Clone, Debug)]
pub struct DistortionMetrics {
    threshold: f64,
    samples: usize,
    distorted: usize,
    l1: f64,
    l2: f64,
    l0: f64,
    linf: f64,
}

impl DistortionMetrics {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            samples: 0,
            distorted: 0,
            l1: 0.0,
            l2: 0.0,
            l0: 0.0,
            linf: 0.0,
        }
    }

    /// Add one row per image: mean abs, MSE, nonzero count and max abs of the difference.
    pub fn accumulate<B: Backend>(&mut self, clean: Tensor<B, 4>, attacked: Tensor<B, 4>) -> Result<()> {
        if clean.dims() != attacked.dims() {
            return Err(StarganError::shape(format!(
                "clean output {:?} does not match attacked output {:?}",
                clean.dims(),
                attacked.dims()
            )));
        }
        let [batch, channels, height, width] = clean.dims();
        let diff = attacked
            .sub(clean)
            .reshape([batch, channels * height * width])
            .abs();

        let l1 = diff.clone().mean_dim(1).into_data().to_vec::<f32>()?;
        let l2 = diff.clone().powi_scalar(2).mean_dim(1).into_data().to_vec::<f32>()?;
        let l0 = diff
            .clone()
            .not_equal_elem(0.0)
            .float()
            .sum_dim(1)
            .into_data()
            .to_vec::<f32>()?;
        let linf = diff.max_dim(1).into_data().to_vec::<f32>()?;

        for idx in 0..batch {
            self.samples += 1;
            self.l1 += f64::from(l1[idx]);
            self.l2 += f64::from(l2[idx]);
            self.l0 += f64::from(l0[idx]);
            self.linf += f64::from(linf[idx]);
            if f64::from(l2[idx]) > self.threshold {
                self.distorted += 1;
            }
        }
        Ok(())
    }

    pub fn report(&self) -> DistortionReport {
        if self.samples == 0 {
            return DistortionReport::default();
        }
        let n = self.samples as f64;
        DistortionReport {
            samples: self.samples,
            l1: self.l1 / n,
            l2: self.l2 / n,
            l0: self.l0 / n,
            linf: self.linf / n,
            distorted_fraction: self.distorted as f64 / n,
        }
    }
}

/// Held-out translation, attack and distortion measurement with a frozen generator.
pub struct Evaluator<B: AutodiffBackend> {
    config: EvaluationConfig,
    encoder: LabelEncoder,
    generator: Generator<B>,
    dirs: RunDirs,
    device: B::Device,
}

impl<B: AutodiffBackend> Evaluator<B> {
    /// Evaluator around a freshly initialized generator.
    pub fn new(config: EvaluationConfig, dirs: RunDirs, device: B::Device) -> Result<Self> {
        config.validate()?;
        let encoder = LabelEncoder::new(
            config.mode,
            config.model.c_dim,
            config.model.c2_dim,
            config.selected_attrs.clone(),
        )?;
        let generator = config
            .model
            .init_generator::<B>(encoder.condition_dim(), &device)
            .no_grad();
        std::fs::create_dir_all(&dirs.result_dir)?;
        Ok(Self {
            config,
            encoder,
            generator,
            dirs,
            device,
        })
    }

    /// Evaluator around the generator saved at `test_iters`, or the latest checkpoint.
    pub fn from_checkpoint(config: EvaluationConfig, dirs: RunDirs, device: B::Device) -> Result<Self> {
        let store = CheckpointStore::new(&dirs.model_dir);
        let iteration = match config.test_iters {
            Some(iteration) => iteration,
            None => store
                .latest_iteration()?
                .ok_or_else(|| StarganError::MissingCheckpoint(dirs.model_dir.clone()))?,
        };
        let mut evaluator = Self::new(config, dirs, device)?;
        log::info!("loading the trained generator from step {iteration}...");
        evaluator.generator = store
            .load_module(evaluator.generator.clone(), iteration, "G", &evaluator.device)?
            .no_grad();
        Ok(evaluator)
    }

    pub fn with_generator(mut self, generator: Generator<B>) -> Self {
        self.generator = generator.no_grad();
        self
    }

    /// Translate every held-out batch into every target domain and write the grids.
    pub fn translate<S: DataSource<B> + ?Sized>(&self, source: &mut S) -> Result<usize> {
        source.restart();
        let mut written = 0;
        while let Some(batch) = source.next_batch()? {
            let x_real = batch.images.detach();
            let mut columns = vec![x_real.clone()];
            for condition in self.encoder.target_sweep(&batch.labels, &self.device)? {
                columns.push(self.translate_clean(x_real.clone(), condition).image);
            }
            written += 1;
            let path = self.dirs.result_dir.join(format!("{written}-images.jpg"));
            save_columns(columns, &path)?;
            log::info!("saved real and fake images into {}...", path.display());
        }
        Ok(written)
    }

    /// Attack at most `max_batches` held-out batches and measure the translation distortion.
    pub fn evaluate<S: DataSource<B> + ?Sized>(&self, source: &mut S, attack: EvalAttack) -> Result<DistortionReport> {
        if attack == EvalAttack::Universal {
            return self.evaluate_universal(source);
        }
        let report = self.run(source, attack, self.config.save_images)?;
        log::info!("{report}");
        Ok(report)
    }

    /// Per-sample output attack against every generator layer, then against the output.
    pub fn feature_sweep<S: DataSource<B> + ?Sized>(
        &self,
        source: &mut S,
    ) -> Result<Vec<(TargetSignal, DistortionReport)>> {
        let signals = (0..self.generator.feature_count())
            .map(TargetSignal::Layer)
            .chain(std::iter::once(TargetSignal::Output));
        let mut reports = Vec::new();
        for signal in signals {
            let report = self.run(source, EvalAttack::Pgd { signal }, false)?;
            log::info!("{signal}: {report}");
            reports.push((signal, report));
        }
        Ok(reports)
    }

    /// Accumulate one shared perturbation over the held-out batches, then measure with it frozen.
    pub fn evaluate_universal<S: DataSource<B> + ?Sized>(&self, source: &mut S) -> Result<DistortionReport> {
        let attack = self.config.attack.init(TargetSignal::Output);
        let mut session: Option<UniversalPerturbation<B>> = None;

        source.restart();
        for _ in 0..self.config.max_batches {
            let Some(batch) = source.next_batch()? else {
                break;
            };
            let x_real = batch.images.detach();
            let [_, channels, height, width] = x_real.dims();
            let session =
                session.get_or_insert_with(|| attack.universal_session(channels, height, width, &self.device));
            for condition in self.encoder.target_sweep(&batch.labels, &self.device)? {
                let reference = self.translate_clean(x_real.clone(), condition.clone()).image;
                attack.perturb_universal(&self.generator, x_real.clone(), condition, reference, session)?;
            }
        }
        let session = session.ok_or(StarganError::EmptyDataSource)?;

        let mut metrics = DistortionMetrics::new(self.config.distortion_threshold);
        source.restart();
        for index in 0..self.config.max_batches {
            let Some(batch) = source.next_batch()? else {
                break;
            };
            let x_real = batch.images.detach();
            let adversarial = session.apply(x_real.clone())?;
            let mut columns = vec![x_real.clone(), adversarial.clone()];
            for condition in self.encoder.target_sweep(&batch.labels, &self.device)? {
                let clean = self.translate_clean(x_real.clone(), condition.clone()).image;
                let attacked = self.translate_clean(adversarial.clone(), condition).image;
                metrics.accumulate(clean, attacked.clone())?;
                columns.push(attacked);
            }
            self.save_batch(columns, index, self.config.save_images)?;
        }

        let report = metrics.report();
        log::info!("{report}");
        Ok(report)
    }

    fn run<S: DataSource<B> + ?Sized>(&self, source: &mut S, attack: EvalAttack, save: bool) -> Result<DistortionReport> {
        let signal = match attack {
            EvalAttack::Pgd { signal } => signal,
            _ => TargetSignal::Output,
        };
        let pgd = self.config.attack.init(signal);
        let mut metrics = DistortionMetrics::new(self.config.distortion_threshold);

        source.restart();
        for index in 0..self.config.max_batches {
            let Some(batch) = source.next_batch()? else {
                break;
            };
            let columns = self.evaluate_batch(&pgd, batch, attack, &mut metrics)?;
            self.save_batch(columns, index, save)?;
        }
        Ok(metrics.report())
    }

    fn evaluate_batch(
        &self,
        pgd: &PgdAttack,
        batch: Batch<B>,
        attack: EvalAttack,
        metrics: &mut DistortionMetrics,
    ) -> Result<Vec<Tensor<B, 4>>> {
        let x_real = batch.images.detach();
        let conditions = self.encoder.target_sweep(&batch.labels, &self.device)?;
        let clean: Vec<Translation<B>> = conditions
            .iter()
            .map(|condition| self.translate_clean(x_real.clone(), condition.clone()))
            .collect();

        let shared = self.shared_perturbation(pgd, &x_real, &conditions, &clean, attack)?;
        let mut columns = vec![x_real.clone()];
        for (condition, clean) in conditions.into_iter().zip(clean) {
            let adversarial = match (&shared, attack) {
                (Some(shared), _) => shared.adversarial.clone(),
                (None, EvalAttack::Pgd { signal }) => {
                    let reference = signal.select(clean.clone())?;
                    pgd.perturb(&self.generator, x_real.clone(), condition.clone(), reference)?
                        .adversarial
                }
                (None, _) => x_real.clone(),
            };
            let attacked = self.translate_clean(adversarial.clone(), condition).image;
            metrics.accumulate(clean.image, attacked.clone())?;
            columns.push(adversarial);
            columns.push(attacked);
        }
        Ok(columns)
    }

    /// Perturbation shared by every target label of a batch, for the class-conditional attacks.
    fn shared_perturbation(
        &self,
        pgd: &PgdAttack,
        x_real: &Tensor<B, 4>,
        conditions: &[Tensor<B, 2>],
        clean: &[Translation<B>],
        attack: EvalAttack,
    ) -> Result<Option<Perturbed<B>>> {
        let targets = || -> Vec<ConditionedTarget<B>> {
            conditions
                .iter()
                .zip(clean)
                .map(|(condition, clean)| ConditionedTarget::new(condition.clone(), clean.image.clone()))
                .collect()
        };
        let perturbed = match attack {
            EvalAttack::WrongClass => {
                let (Some(condition), Some(clean)) = (conditions.first(), clean.first()) else {
                    return Ok(None);
                };
                pgd.perturb(&self.generator, x_real.clone(), condition.clone(), clean.image.clone())?
            }
            EvalAttack::JointClass => pgd.perturb_joint(&self.generator, x_real.clone(), &targets())?,
            EvalAttack::IterativeClass => pgd.perturb_iterative(&self.generator, x_real.clone(), &targets())?,
            EvalAttack::Disabled | EvalAttack::Pgd { .. } | EvalAttack::Universal => return Ok(None),
        };
        Ok(Some(perturbed))
    }

    fn translate_clean(&self, images: Tensor<B, 4>, condition: Tensor<B, 2>) -> Translation<B> {
        let translation = self.generator.translate(images, condition);
        Translation {
            image: translation.image.detach(),
            features: translation.features.into_iter().map(Tensor::detach).collect(),
        }
    }

    fn save_batch(&self, columns: Vec<Tensor<B, 4>>, index: usize, save: bool) -> Result<()> {
        if !save {
            return Ok(());
        }
        let path = self.dirs.result_dir.join(format!("{}-images.jpg", index + 1));
        save_columns(columns, &path)?;
        log::info!("saved real and fake images into {}...", path.display());
        Ok(())
    }
}
