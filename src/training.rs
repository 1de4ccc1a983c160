use crate::attack::{PgdAttack, PgdConfig, TargetSignal};
use crate::checkpoint::{CheckpointStore, TrainingState};
use crate::data::{next_or_restart, Batch, DataSource};
use crate::error::{Result, StarganError};
use crate::labels::{DatasetMode, DatasetSlot, EncodedLabels, LabelEncoder};
use crate::loss::{
    classification_loss, critic_fake_loss, critic_real_loss, generator_adversarial_loss,
    gradient_penalty, interpolate, random_alpha, reconstruction_loss,
};
use crate::model::{Discriminator, Generator, ModelConfig, Translator};
use crate::telemetry::{JsonlTelemetry, NoTelemetry, TelemetrySink};
use crate::utils::save_columns;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::lr_scheduler::LrScheduler;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::Record;
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Which optimization steps see adversarially perturbed inputs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdversarialTraining {
    #[default]
    Disabled,
    GeneratorOnly,
    Both,
}

/// Image the training-time attack pushes the generator output away from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttackReference {
    #[default]
    Black,
    CleanOutput,
}

/// Training configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub mode: DatasetMode,
    /// Binary attributes of the first dataset, in label order.
    pub selected_attrs: Vec<String>,
    #[config(default = 1.0)]
    pub lambda_cls: f64,
    #[config(default = 10.0)]
    pub lambda_rec: f64,
    #[config(default = 10.0)]
    pub lambda_gp: f64,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 200000)]
    pub num_iters: usize,
    /// Iterations at the end of the run over which learning rates decay to zero.
    #[config(default = 100000)]
    pub num_iters_decay: usize,
    #[config(default = 1e-4)]
    pub g_lr: f64,
    #[config(default = 1e-4)]
    pub d_lr: f64,
    /// Discriminator updates per generator update.
    #[config(default = 5)]
    pub n_critic: usize,
    #[config(default = 0.5)]
    pub beta1: f64,
    #[config(default = 0.999)]
    pub beta2: f64,
    pub resume_iters: Option<usize>,
    #[config(default = 10)]
    pub log_step: usize,
    #[config(default = 1000)]
    pub sample_step: usize,
    #[config(default = 10000)]
    pub model_save_step: usize,
    #[config(default = 1000)]
    pub lr_update_step: usize,
    #[config(default = true)]
    pub use_telemetry: bool,
    #[config(default = "AdversarialTraining::Disabled")]
    pub adversarial: AdversarialTraining,
    #[config(default = "PgdConfig::new()")]
    pub attack: PgdConfig,
    #[config(default = "AttackReference::Black")]
    pub attack_reference: AttackReference,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.attack.validate()?;
        if self.n_critic == 0 {
            return Err(StarganError::config("n_critic must be positive"));
        }
        if self.batch_size == 0 || self.num_iters == 0 {
            return Err(StarganError::config("batch_size and num_iters must be positive"));
        }
        if self.num_iters_decay > self.num_iters {
            return Err(StarganError::config(format!(
                "decay window {} is longer than the run of {} iterations",
                self.num_iters_decay, self.num_iters
            )));
        }
        if let Some(resume) = self.resume_iters {
            if resume > self.num_iters {
                return Err(StarganError::config(format!(
                    "cannot resume at {resume}, past the last iteration {}",
                    self.num_iters
                )));
            }
        }
        if self.adversarial != AdversarialTraining::Disabled
            && self.attack_reference == AttackReference::CleanOutput
            && !self.attack.random_init
        {
            // Zero start against the clean output has zero loss gradient.
            return Err(StarganError::config(
                "attacks against the clean output need attack.random_init",
            ));
        }
        if self.mode == DatasetMode::Joint && self.model.c2_dim == 0 {
            return Err(StarganError::config("joint mode needs a positive c2_dim"));
        }
        Ok(())
    }

    pub fn label_encoder(&self) -> Result<LabelEncoder> {
        LabelEncoder::new(
            self.mode,
            self.model.c_dim,
            self.model.c2_dim,
            self.selected_attrs.clone(),
        )
    }
}

/// Output directories of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDirs {
    pub log_dir: PathBuf,
    pub sample_dir: PathBuf,
    pub model_dir: PathBuf,
    pub result_dir: PathBuf,
}

impl RunDirs {
    /// `logs`, `samples`, `models` and `results` below one root.
    pub fn under(root: &Path) -> Self {
        Self {
            log_dir: root.join("logs"),
            sample_dir: root.join("samples"),
            model_dir: root.join("models"),
            result_dir: root.join("results"),
        }
    }

    pub fn create(&self) -> Result<()> {
        for dir in [&self.log_dir, &self.sample_dir, &self.model_dir, &self.result_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Named scalar losses of one training step, in insertion order.
#[derive(Clone, Debug, Default)]
pub struct LossLog {
    entries: Vec<(&'static str, f64)>,
}

impl LossLog {
    pub fn push(&mut self, tag: &'static str, value: f64) {
        self.entries.push((tag, value));
    }

    pub fn get(&self, tag: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(name, _)| *name == tag)
            .map(|(_, value)| *value)
    }

    pub fn entries(&self) -> &[(&'static str, f64)] {
        &self.entries
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.entries
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .count()
    }

    pub fn ensure_finite(&self, iteration: usize) -> Result<()> {
        match self.entries.iter().find(|(_, value)| !value.is_finite()) {
            Some((tag, value)) => Err(StarganError::NumericDivergence {
                tag: tag.to_string(),
                iteration,
                value: *value,
            }),
            None => Ok(()),
        }
    }

    /// `, tag: value` pairs with four decimals.
    pub fn format_pairs(&self) -> String {
        self.entries
            .iter()
            .map(|(tag, value)| format!(", {tag}: {value:.4}"))
            .collect()
    }
}

/// `H:MM:SS`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Learning rate decreasing linearly to zero over the last `decay_iters` iterations.
#[derive(Clone, Debug)]
pub struct LinearDecay {
    lr: f64,
    decrement: f64,
    decay_start: usize,
    update_step: usize,
    iteration: usize,
}

#[derive(Record, Clone)]
pub struct LinearDecayRecord {
    lr: f64,
    iteration: usize,
}

impl LinearDecay {
    pub fn new(initial_lr: f64, num_iters: usize, decay_iters: usize, update_step: usize) -> Self {
        let decrement = if decay_iters == 0 {
            0.0
        } else {
            initial_lr * update_step as f64 / decay_iters as f64
        };
        Self {
            lr: initial_lr,
            decrement,
            decay_start: num_iters.saturating_sub(decay_iters),
            update_step,
            iteration: 0,
        }
    }

    /// Rate after `iteration` completed iterations.
    pub fn resumed_at(mut self, iteration: usize) -> Self {
        for _ in 0..iteration {
            self.step();
        }
        self
    }

    pub fn current(&self) -> f64 {
        self.lr
    }
}

impl LrScheduler for LinearDecay {
    type Record<B: Backend> = LinearDecayRecord;

    fn step(&mut self) -> f64 {
        self.iteration += 1;
        if self.update_step > 0
            && self.decrement > 0.0
            && self.iteration % self.update_step == 0
            && self.iteration > self.decay_start
        {
            self.lr = (self.lr - self.decrement).max(0.0);
        }
        self.lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        LinearDecayRecord {
            lr: self.lr,
            iteration: self.iteration,
        }
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.lr = record.lr;
        self.iteration = record.iteration;
        self
    }
}

type GeneratorOptimRecord<B> =
    <OptimizerAdaptor<Adam, Generator<B>, B> as Optimizer<Generator<B>, B>>::Record;
type DiscriminatorOptimRecord<B> =
    <OptimizerAdaptor<Adam, Discriminator<B>, B> as Optimizer<Discriminator<B>, B>>::Record;

/// Separate Adam states for the generator and the discriminator.
#[derive(Clone)]
pub struct GanOptimizer<B: AutodiffBackend> {
    generator: OptimizerAdaptor<Adam, Generator<B>, B>,
    discriminator: OptimizerAdaptor<Adam, Discriminator<B>, B>,
}

impl<B: AutodiffBackend> GanOptimizer<B> {
    pub fn new(beta1: f64, beta2: f64) -> Self {
        let adam = AdamConfig::new()
            .with_beta_1(beta1 as f32)
            .with_beta_2(beta2 as f32);
        Self {
            generator: adam.init::<B, Generator<B>>(),
            discriminator: adam.init::<B, Discriminator<B>>(),
        }
    }

    fn save(&self, store: &CheckpointStore, iteration: usize) -> Result<()> {
        store.save_record::<B, _>(self.generator.to_record(), iteration, "G-optim")?;
        store.save_record::<B, _>(self.discriminator.to_record(), iteration, "D-optim")
    }

    fn load(mut self, store: &CheckpointStore, iteration: usize, device: &B::Device) -> Result<Self> {
        let generator: GeneratorOptimRecord<B> = store.load_record::<B, _>(iteration, "G-optim", device)?;
        let discriminator: DiscriminatorOptimRecord<B> =
            store.load_record::<B, _>(iteration, "D-optim", device)?;
        self.generator = self.generator.load_record(generator);
        self.discriminator = self.discriminator.load_record(discriminator);
        Ok(self)
    }
}

/// Fixed debug batch translated into every target domain at each sample step.
struct DebugSamples<B: Backend> {
    images: Tensor<B, 4>,
    targets: Vec<Tensor<B, 2>>,
}

/// Alternating discriminator/generator trainer.
pub struct Solver<B: AutodiffBackend> {
    config: TrainingConfig,
    encoder: LabelEncoder,
    generator: Generator<B>,
    discriminator: Discriminator<B>,
    optimizer: GanOptimizer<B>,
    g_schedule: LinearDecay,
    d_schedule: LinearDecay,
    attack: PgdAttack,
    dirs: RunDirs,
    store: CheckpointStore,
    telemetry: Box<dyn TelemetrySink>,
    rng: StdRng,
    device: B::Device,
    start_iteration: usize,
    attacks_run: usize,
}

impl<B: AutodiffBackend> Solver<B> {
    pub fn new(config: TrainingConfig, dirs: RunDirs, device: B::Device) -> Result<Self> {
        config.validate()?;
        let encoder = config.label_encoder()?;
        dirs.create()?;
        config.save(dirs.model_dir.join("config.json"))?;

        B::seed(&device, config.seed);
        let generator = config
            .model
            .init_generator::<B>(encoder.condition_dim(), &device);
        let discriminator = config
            .model
            .init_discriminator::<B>(encoder.class_dim(), &device);
        log::info!("generator: {} parameters", generator.num_params());
        log::info!("discriminator: {} parameters", discriminator.num_params());

        let telemetry: Box<dyn TelemetrySink> = if config.use_telemetry {
            Box::new(JsonlTelemetry::create(&dirs.log_dir)?)
        } else {
            Box::new(NoTelemetry)
        };

        let mut solver = Self {
            optimizer: GanOptimizer::new(config.beta1, config.beta2),
            g_schedule: LinearDecay::new(
                config.g_lr,
                config.num_iters,
                config.num_iters_decay,
                config.lr_update_step,
            ),
            d_schedule: LinearDecay::new(
                config.d_lr,
                config.num_iters,
                config.num_iters_decay,
                config.lr_update_step,
            ),
            attack: config.attack.init(TargetSignal::Output),
            store: CheckpointStore::new(&dirs.model_dir),
            rng: StdRng::seed_from_u64(config.seed),
            start_iteration: 0,
            attacks_run: 0,
            config,
            encoder,
            generator,
            discriminator,
            dirs,
            telemetry,
            device,
        };
        if let Some(iteration) = solver.config.resume_iters {
            solver.restore(iteration)?;
        }
        Ok(solver)
    }

    pub fn with_telemetry(mut self, telemetry: Box<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn generator(&self) -> &Generator<B> {
        &self.generator
    }

    pub fn discriminator(&self) -> &Discriminator<B> {
        &self.discriminator
    }

    pub fn learning_rates(&self) -> (f64, f64) {
        (self.g_schedule.current(), self.d_schedule.current())
    }

    pub fn start_iteration(&self) -> usize {
        self.start_iteration
    }

    /// PGD invocations since the solver was built.
    pub fn attacks_run(&self) -> usize {
        self.attacks_run
    }

    /// Load networks, optimizer states and learning rates saved at `iteration`.
    fn restore(&mut self, iteration: usize) -> Result<()> {
        log::info!("loading the trained models from step {iteration}...");
        self.generator = self
            .store
            .load_module(self.generator.clone(), iteration, "G", &self.device)?;
        self.discriminator = self
            .store
            .load_module(self.discriminator.clone(), iteration, "D", &self.device)?;

        if self.store.contains::<B>(iteration, "G-optim") && self.store.contains::<B>(iteration, "D-optim") {
            self.optimizer = self.optimizer.clone().load(&self.store, iteration, &self.device)?;
        } else {
            log::warn!("no optimizer state for step {iteration}, starting Adam from scratch");
        }

        self.g_schedule = self.g_schedule.clone().resumed_at(iteration);
        self.d_schedule = self.d_schedule.clone().resumed_at(iteration);
        if let Some(state) = self.store.read_state()?.filter(|state| state.iteration == iteration) {
            self.g_schedule = self.g_schedule.clone().load_record::<B>(LinearDecayRecord {
                lr: state.g_lr,
                iteration,
            });
            self.d_schedule = self.d_schedule.clone().load_record::<B>(LinearDecayRecord {
                lr: state.d_lr,
                iteration,
            });
        }
        self.start_iteration = iteration;
        Ok(())
    }

    /// Train on a single dataset.
    pub fn train<S: DataSource<B> + ?Sized>(&mut self, source: &mut S) -> Result<()> {
        if self.encoder.mode() == DatasetMode::Joint {
            return Err(StarganError::config("joint mode trains with two data sources"));
        }
        let fixed = next_or_restart(source)?;
        let samples = self.debug_samples(&fixed)?;

        log::info!("start training...");
        let started = Instant::now();
        for iteration in self.start_iteration..self.config.num_iters {
            let batch = next_or_restart(source)?;
            let log = self.train_step(iteration, batch, DatasetSlot::First)?;
            self.after_step(iteration, &[(None, log)], started, &samples)?;
        }
        self.telemetry.flush()
    }

    /// Train on two datasets at once: each iteration updates on A, then on B.
    pub fn train_multi<SA, SB>(&mut self, first: &mut SA, second: &mut SB) -> Result<()>
    where
        SA: DataSource<B> + ?Sized,
        SB: DataSource<B> + ?Sized,
    {
        if self.encoder.mode() != DatasetMode::Joint {
            return Err(StarganError::config("two-source training needs joint mode"));
        }
        let fixed = next_or_restart(first)?;
        let samples = self.debug_samples(&fixed)?;

        log::info!("start training...");
        let started = Instant::now();
        for iteration in self.start_iteration..self.config.num_iters {
            let first_log = self.train_step(iteration, next_or_restart(first)?, DatasetSlot::First)?;
            let second_log = self.train_step(iteration, next_or_restart(second)?, DatasetSlot::Second)?;
            self.after_step(
                iteration,
                &[
                    (Some(DatasetSlot::First), first_log),
                    (Some(DatasetSlot::Second), second_log),
                ],
                started,
                &samples,
            )?;
        }
        self.telemetry.flush()
    }

    /// One discriminator update and, every `n_critic` iterations, one generator update.
    pub fn train_step(&mut self, iteration: usize, batch: Batch<B>, slot: DatasetSlot) -> Result<LossLog> {
        let device = self.device.clone();
        let x_real = batch.images.to_device(&device).detach();
        let target_labels = batch.labels.shuffled(&mut self.rng);
        let origin = self.encoder.encode::<B>(&batch.labels, slot, &device)?;
        let target = self.encoder.encode::<B>(&target_labels, slot, &device)?;

        // The D step does not touch the generator, so its attacked input stays valid for the G step.
        let perturbed = match self.config.adversarial {
            AdversarialTraining::Both => Some(self.perturb(x_real.clone(), target.condition.clone())?),
            AdversarialTraining::Disabled | AdversarialTraining::GeneratorOnly => None,
        };

        let mut log = LossLog::default();
        let d_input = perturbed.clone().unwrap_or_else(|| x_real.clone());
        self.discriminator_step(d_input, &origin, &target, slot, &mut log)?;

        if (iteration + 1) % self.config.n_critic == 0 {
            let g_input = match perturbed {
                Some(perturbed) => perturbed,
                None if self.config.adversarial == AdversarialTraining::GeneratorOnly => {
                    self.perturb(x_real.clone(), target.condition.clone())?
                }
                None => x_real.clone(),
            };
            self.generator_step(x_real, g_input, &origin, &target, slot, &mut log)?;
        }
        Ok(log)
    }

    fn discriminator_step(
        &mut self,
        x_real: Tensor<B, 4>,
        origin: &EncodedLabels<B>,
        target: &EncodedLabels<B>,
        slot: DatasetSlot,
        log: &mut LossLog,
    ) -> Result<()> {
        let mut x_fake = self
            .generator
            .forward(x_real.clone(), target.condition.clone())
            .image
            .detach();
        if self.config.adversarial == AdversarialTraining::Both {
            x_fake = self.perturb(x_fake, origin.condition.clone())?;
        }

        let discriminator = &self.discriminator;
        let (scores, logits) = discriminator.forward(x_real.clone());
        let loss_real = critic_real_loss(scores);
        let loss_cls = classification_loss(self.slot_logits(logits, slot), origin.target.clone());

        let (scores, _) = discriminator.forward(x_fake.clone());
        let loss_fake = critic_fake_loss(scores);

        let x_hat = interpolate(x_real.clone(), x_fake, random_alpha(x_real.dims()[0], &self.device))?;
        let loss_gp = gradient_penalty(|x| discriminator.forward(x).0, x_hat)?;

        let loss = loss_real
            .clone()
            .add(loss_fake.clone())
            .add(loss_cls.clone().mul_scalar(self.config.lambda_cls))
            .add(loss_gp.clone().mul_scalar(self.config.lambda_gp));
        let grads = GradientsParams::from_grads(loss.backward(), discriminator);
        self.discriminator = self.optimizer.discriminator.step(
            self.d_schedule.current(),
            self.discriminator.clone(),
            grads,
        );

        log.push("D/loss_real", scalar(loss_real));
        log.push("D/loss_fake", scalar(loss_fake));
        log.push("D/loss_cls", scalar(loss_cls));
        log.push("D/loss_gp", scalar(loss_gp));
        Ok(())
    }

    fn generator_step(
        &mut self,
        x_real: Tensor<B, 4>,
        x_input: Tensor<B, 4>,
        origin: &EncodedLabels<B>,
        target: &EncodedLabels<B>,
        slot: DatasetSlot,
        log: &mut LossLog,
    ) -> Result<()> {
        let x_fake = self
            .generator
            .forward(x_input, target.condition.clone())
            .image;
        let (scores, logits) = self.discriminator.forward(x_fake.clone());
        let loss_fake = generator_adversarial_loss(scores);
        let loss_cls = classification_loss(self.slot_logits(logits, slot), target.target.clone());

        let reconstruct_from = match self.config.adversarial {
            AdversarialTraining::Disabled => x_fake,
            _ => {
                let adversarial = self.perturb(x_fake.clone(), origin.condition.clone())?;
                let delta = adversarial.sub(x_fake.clone().detach());
                x_fake.add(delta)
            }
        };
        let x_reconst = self
            .generator
            .forward(reconstruct_from, origin.condition.clone())
            .image;
        let loss_rec = reconstruction_loss(x_real, x_reconst);

        let loss = loss_fake
            .clone()
            .add(loss_rec.clone().mul_scalar(self.config.lambda_rec))
            .add(loss_cls.clone().mul_scalar(self.config.lambda_cls));
        let grads = GradientsParams::from_grads(loss.backward(), &self.generator);
        self.generator = self.optimizer.generator.step(
            self.g_schedule.current(),
            self.generator.clone(),
            grads,
        );

        log.push("G/loss_fake", scalar(loss_fake));
        log.push("G/loss_rec", scalar(loss_rec));
        log.push("G/loss_cls", scalar(loss_cls));
        Ok(())
    }

    /// Attack a frozen copy of the generator and return the detached adversarial input.
    fn perturb(&mut self, images: Tensor<B, 4>, condition: Tensor<B, 2>) -> Result<Tensor<B, 4>> {
        self.attacks_run += 1;
        let frozen = self.generator.clone().no_grad();
        let images = images.detach();
        let reference = match self.config.attack_reference {
            AttackReference::Black => images.zeros_like(),
            AttackReference::CleanOutput => frozen
                .translate(images.clone(), condition.clone())
                .image
                .detach(),
        };
        Ok(self
            .attack
            .perturb(&frozen, images, condition, reference)?
            .adversarial)
    }

    /// Classifier columns belonging to the active dataset.
    fn slot_logits(&self, logits: Tensor<B, 2>, slot: DatasetSlot) -> Tensor<B, 2> {
        let [batch, classes] = logits.dims();
        let range = self.encoder.logit_range(slot);
        if range.start == 0 && range.end == classes {
            return logits;
        }
        logits.slice([0..batch, range])
    }

    fn debug_samples(&self, fixed: &Batch<B>) -> Result<DebugSamples<B>> {
        Ok(DebugSamples {
            images: fixed.images.clone().detach(),
            targets: self.encoder.target_sweep(&fixed.labels, &self.device)?,
        })
    }

    fn after_step(
        &mut self,
        iteration: usize,
        logs: &[(Option<DatasetSlot>, LossLog)],
        started: Instant,
        samples: &DebugSamples<B>,
    ) -> Result<()> {
        let step = iteration + 1;
        for (_, log) in logs {
            log.ensure_finite(step)?;
        }

        if self.config.log_step > 0 && step % self.config.log_step == 0 {
            let elapsed = format_elapsed(started.elapsed());
            for (slot, log) in logs {
                let dataset = slot
                    .map(|slot| format!(", Dataset [{}]", slot.name()))
                    .unwrap_or_default();
                log::info!(
                    "Elapsed [{elapsed}], Iteration [{step}/{}]{dataset}{}",
                    self.config.num_iters,
                    log.format_pairs()
                );
                for (tag, value) in log.entries() {
                    let tag = match slot {
                        Some(slot) => format!("{}/{tag}", slot.name()),
                        None => tag.to_string(),
                    };
                    self.telemetry.record_scalar(&tag, *value, step)?;
                }
            }
        }

        let (g_prev, d_prev) = self.learning_rates();
        let g_lr = self.g_schedule.step();
        let d_lr = self.d_schedule.step();
        if g_lr != g_prev || d_lr != d_prev {
            log::info!("decayed learning rates, g_lr: {g_lr}, d_lr: {d_lr}.");
        }

        if self.config.sample_step > 0 && step % self.config.sample_step == 0 {
            let path = self.dirs.sample_dir.join(format!("{step}-images.jpg"));
            self.save_samples(samples, &path)?;
            log::info!("saved real and fake images into {}...", path.display());
        }

        if self.config.model_save_step > 0 && step % self.config.model_save_step == 0 {
            self.save_checkpoint(step)?;
            log::info!("saved model checkpoints into {}...", self.store.dir().display());
        }

        Ok(())
    }

    fn save_samples(&self, samples: &DebugSamples<B>, path: &Path) -> Result<()> {
        let generator = self.generator.valid();
        let images = samples.images.clone().inner();
        let mut columns = Vec::with_capacity(samples.targets.len() + 1);
        columns.push(images.clone());
        for condition in &samples.targets {
            columns.push(generator.forward(images.clone(), condition.clone().inner()).image);
        }
        save_columns(columns, path)
    }

    pub fn save_checkpoint(&self, iteration: usize) -> Result<()> {
        self.store.save_module(&self.generator, iteration, "G")?;
        self.store.save_module(&self.discriminator, iteration, "D")?;
        self.optimizer.save(&self.store, iteration)?;
        self.store.write_state(&TrainingState {
            iteration,
            g_lr: self.g_schedule.current(),
            d_lr: self.d_schedule.current(),
        })
    }
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemorySource;
    use crate::labels::{LabelKind, RawLabels};
    use crate::telemetry::read_scalars;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = Autodiff<NdArray<f32>>;
    type Device = <TestBackend as Backend>::Device;

    fn attrs() -> Vec<String> {
        ["Black_Hair", "Blond_Hair", "Brown_Hair", "Male", "Young"]
            .map(String::from)
            .to_vec()
    }

    fn tiny_model(c_dim: usize, c2_dim: usize) -> ModelConfig {
        ModelConfig::new(8, c_dim)
            .with_c2_dim(c2_dim)
            .with_g_conv_dim(2)
            .with_d_conv_dim(2)
            .with_g_repeat_num(1)
            .with_d_repeat_num(2)
    }

    fn config() -> TrainingConfig {
        TrainingConfig::new(tiny_model(5, 0), DatasetMode::Single(LabelKind::Binary), attrs())
            .with_batch_size(4)
            .with_num_iters(2)
            .with_num_iters_decay(1)
            .with_n_critic(1)
            .with_log_step(1)
            .with_sample_step(0)
            .with_model_save_step(0)
            .with_lr_update_step(1)
            .with_use_telemetry(false)
            .with_attack(PgdConfig::new().with_steps(1))
    }

    fn images(device: &Device) -> Tensor<TestBackend, 4> {
        Tensor::random([4, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), device)
    }

    fn binary_batch(device: &Device) -> Batch<TestBackend> {
        let values = vec![
            1.0, 0.0, 0.0, 1.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, 1.0, //
            0.0, 0.0, 1.0, 1.0, 1.0, //
            1.0, 0.0, 0.0, 0.0, 0.0,
        ];
        Batch {
            images: images(device),
            labels: RawLabels::Binary { values, width: 5 },
        }
    }

    fn categorical_batch(device: &Device) -> Batch<TestBackend> {
        Batch {
            images: images(device),
            labels: RawLabels::Categorical(vec![0, 1, 2, 0]),
        }
    }

    #[test]
    fn single_dataset_step_logs_discriminator_and_generator_losses() {
        let device = Device::default();
        let dir = tempfile::tempdir().unwrap();
        let mut solver = Solver::<TestBackend>::new(config(), RunDirs::under(dir.path()), device.clone()).unwrap();

        let log = solver
            .train_step(0, binary_batch(&device), DatasetSlot::First)
            .unwrap();
        assert_eq!(log.count_prefix("D/"), 4);
        assert_eq!(log.count_prefix("G/"), 3);
        assert!(log.get("D/loss_gp").unwrap() >= 0.0);
        log.ensure_finite(1).unwrap();
    }

    #[test]
    fn generator_updates_wait_for_n_critic() {
        let device = Device::default();
        let dir = tempfile::tempdir().unwrap();
        let config = config().with_n_critic(2);
        let mut solver = Solver::<TestBackend>::new(config, RunDirs::under(dir.path()), device.clone()).unwrap();

        let first = solver
            .train_step(0, binary_batch(&device), DatasetSlot::First)
            .unwrap();
        let second = solver
            .train_step(1, binary_batch(&device), DatasetSlot::First)
            .unwrap();
        assert_eq!(first.count_prefix("G/"), 0);
        assert_eq!(second.count_prefix("G/"), 3);
    }

    #[test]
    fn adversarial_training_variants_update_both_networks() {
        let device = Device::default();
        for (adversarial, reference) in [
            (AdversarialTraining::GeneratorOnly, AttackReference::Black),
            (AdversarialTraining::Both, AttackReference::CleanOutput),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let config = config()
                .with_adversarial(adversarial)
                .with_attack_reference(reference)
                .with_attack(PgdConfig::new().with_steps(1).with_random_init(true));
            let mut solver =
                Solver::<TestBackend>::new(config, RunDirs::under(dir.path()), device.clone()).unwrap();
            let log = solver
                .train_step(0, binary_batch(&device), DatasetSlot::First)
                .unwrap();
            assert_eq!(log.entries().len(), 7);
            log.ensure_finite(1).unwrap();
        }
    }

    #[test]
    fn attacks_run_only_where_their_input_is_used() {
        let device = Device::default();
        for (adversarial, after_critic_only, after_generator) in [
            (AdversarialTraining::Disabled, 0, 0),
            // Input for the G step plus the reconstruction input.
            (AdversarialTraining::GeneratorOnly, 0, 2),
            // Shared input and the D fake every step, reconstruction on G steps.
            (AdversarialTraining::Both, 2, 5),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let config = config().with_n_critic(2).with_adversarial(adversarial);
            let mut solver =
                Solver::<TestBackend>::new(config, RunDirs::under(dir.path()), device.clone()).unwrap();

            solver
                .train_step(0, binary_batch(&device), DatasetSlot::First)
                .unwrap();
            assert_eq!(solver.attacks_run(), after_critic_only, "{adversarial:?}");
            solver
                .train_step(1, binary_batch(&device), DatasetSlot::First)
                .unwrap();
            assert_eq!(solver.attacks_run(), after_generator, "{adversarial:?}");
        }
    }

    #[test]
    fn training_attacks_move_the_input() {
        let device = Device::default();
        for (reference, random_init) in [
            (AttackReference::Black, false),
            (AttackReference::CleanOutput, true),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let config = config()
                .with_adversarial(AdversarialTraining::GeneratorOnly)
                .with_attack_reference(reference)
                .with_attack(PgdConfig::new().with_steps(2).with_random_init(random_init));
            let mut solver =
                Solver::<TestBackend>::new(config, RunDirs::under(dir.path()), device.clone()).unwrap();
            let batch = binary_batch(&device);
            let condition = solver
                .encoder
                .encode::<TestBackend>(&batch.labels, DatasetSlot::First, &device)
                .unwrap()
                .condition;

            let x_real = batch.images.detach();
            let adversarial = solver.perturb(x_real.clone(), condition).unwrap();
            let moved = adversarial
                .sub(x_real)
                .abs()
                .max()
                .into_scalar()
                .elem::<f32>();
            assert!(moved > 0.0 && moved <= 0.05 + 1e-6, "{reference:?} moved {moved}");
        }
    }

    #[test]
    fn clean_output_attacks_need_a_random_start() {
        let config = config()
            .with_adversarial(AdversarialTraining::Both)
            .with_attack_reference(AttackReference::CleanOutput);
        assert!(matches!(config.validate(), Err(StarganError::Configuration(_))));
        config
            .with_attack(PgdConfig::new().with_random_init(true))
            .validate()
            .unwrap();
    }

    fn snapshot(
        solver: &Solver<TestBackend>,
        images: Tensor<TestBackend, 4>,
        condition: Tensor<TestBackend, 2>,
    ) -> (Vec<f32>, Vec<f32>) {
        let translated = solver
            .generator()
            .valid()
            .forward(images.clone().inner(), condition.inner())
            .image;
        let (_, logits) = solver.discriminator().valid().forward(images.inner());
        (
            translated.into_data().to_vec::<f32>().unwrap(),
            logits.into_data().to_vec::<f32>().unwrap(),
        )
    }

    #[test]
    fn each_step_updates_only_its_own_network() {
        let device = Device::default();
        let dir = tempfile::tempdir().unwrap();
        let config = config().with_g_lr(0.01).with_d_lr(0.01);
        let mut solver = Solver::<TestBackend>::new(config, RunDirs::under(dir.path()), device.clone()).unwrap();
        let batch = binary_batch(&device);
        let origin = solver
            .encoder
            .encode::<TestBackend>(&batch.labels, DatasetSlot::First, &device)
            .unwrap();
        let target = solver
            .encoder
            .encode::<TestBackend>(&batch.labels.permuted(&[1, 2, 3, 0]), DatasetSlot::First, &device)
            .unwrap();
        let x_real = batch.images.detach();
        let mut log = LossLog::default();

        let (g_before, d_before) = snapshot(&solver, x_real.clone(), origin.condition.clone());
        solver
            .discriminator_step(x_real.clone(), &origin, &target, DatasetSlot::First, &mut log)
            .unwrap();
        let (g_after_d, d_after_d) = snapshot(&solver, x_real.clone(), origin.condition.clone());
        assert_eq!(g_before, g_after_d);
        assert_ne!(d_before, d_after_d);

        solver
            .generator_step(x_real.clone(), x_real.clone(), &origin, &target, DatasetSlot::First, &mut log)
            .unwrap();
        let (g_after_g, d_after_g) = snapshot(&solver, x_real, origin.condition);
        assert_eq!(d_after_d, d_after_g);
        assert_ne!(g_after_d, g_after_g);
    }

    #[test]
    fn training_loop_wraps_checkpoints_and_resumes() {
        let device = Device::default();
        let dir = tempfile::tempdir().unwrap();
        let dirs = RunDirs::under(dir.path());
        let config = config()
            .with_num_iters(3)
            .with_num_iters_decay(2)
            .with_sample_step(3)
            .with_model_save_step(3)
            .with_g_lr(0.01)
            .with_d_lr(0.01)
            .with_use_telemetry(true);
        let mut source = MemorySource::new(vec![binary_batch(&device)]);

        let mut solver = Solver::<TestBackend>::new(config.clone(), dirs.clone(), device.clone()).unwrap();
        solver.train(&mut source).unwrap();
        let (g_lr, d_lr) = solver.learning_rates();
        assert!(g_lr.abs() < 1e-12 && d_lr.abs() < 1e-12);

        assert!(dirs.model_dir.join("3-G.mpk").is_file());
        assert!(dirs.model_dir.join("3-D.mpk").is_file());
        assert!(dirs.sample_dir.join("3-images.jpg").is_file());
        let records = read_scalars(&dirs.log_dir.join(JsonlTelemetry::FILE_NAME)).unwrap();
        assert_eq!(records.len(), 3 * 7);
        assert_eq!(records.iter().filter(|r| r.tag.starts_with("D/")).count(), 3 * 4);
        assert_eq!(records.iter().filter(|r| r.tag.starts_with("G/")).count(), 3 * 3);
        assert!(records.iter().any(|r| r.tag == "G/loss_rec" && r.step == 3));
        assert!(records.iter().all(|r| (1..=3).contains(&r.step) && r.value.is_finite()));
        let state = CheckpointStore::new(&dirs.model_dir).read_state().unwrap().unwrap();
        assert_eq!(state.iteration, 3);
        assert!(state.g_lr.abs() < 1e-12);

        let resumed = Solver::<TestBackend>::new(config.with_resume_iters(Some(3)), dirs, device.clone()).unwrap();
        assert_eq!(resumed.start_iteration(), 3);
        assert!(resumed.learning_rates().0.abs() < 1e-12);

        // Checkpoints are stored in half precision.
        let inputs = images(&device);
        let (_, expected) = solver.discriminator().valid().forward(inputs.clone().inner());
        let (_, actual) = resumed.discriminator().valid().forward(inputs.inner());
        let expected = expected.into_data().to_vec::<f32>().unwrap();
        let actual = actual.into_data().to_vec::<f32>().unwrap();
        for (a, b) in expected.iter().zip(&actual) {
            assert!((a - b).abs() < 2e-2, "{a} vs {b}");
        }
    }

    #[test]
    fn resuming_without_checkpoint_fails() {
        let device = Device::default();
        let dir = tempfile::tempdir().unwrap();
        let config = config().with_resume_iters(Some(2));
        let result = Solver::<TestBackend>::new(config, RunDirs::under(dir.path()), device);
        assert!(matches!(result, Err(StarganError::MissingCheckpoint(_))));
    }

    #[test]
    fn joint_mode_trains_on_both_datasets() {
        let device = Device::default();
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig::new(tiny_model(5, 3), DatasetMode::Joint, attrs())
            .with_num_iters(1)
            .with_num_iters_decay(0)
            .with_n_critic(1)
            .with_log_step(1)
            .with_sample_step(1)
            .with_model_save_step(0)
            .with_use_telemetry(false);
        let dirs = RunDirs::under(dir.path());
        let mut solver = Solver::<TestBackend>::new(config, dirs.clone(), device.clone()).unwrap();

        let mut first = MemorySource::new(vec![binary_batch(&device)]);
        let mut second = MemorySource::new(vec![categorical_batch(&device)]);
        assert!(matches!(
            solver.train(&mut first),
            Err(StarganError::Configuration(_))
        ));
        solver.train_multi(&mut first, &mut second).unwrap();
        assert!(dirs.sample_dir.join("1-images.jpg").is_file());

        let log = solver
            .train_step(0, categorical_batch(&device), DatasetSlot::Second)
            .unwrap();
        assert_eq!(log.entries().len(), 7);
    }

    #[test]
    fn learning_rate_decays_linearly_to_zero() {
        let mut schedule = LinearDecay::new(1e-4, 10, 4, 2);
        let rates: Vec<f64> = (0..10).map(|_| schedule.step()).collect();
        assert_eq!(rates[6], 1e-4);
        assert!((rates[7] - 5e-5).abs() < 1e-12);
        assert!((rates[8] - 5e-5).abs() < 1e-12);
        assert!(rates[9].abs() < 1e-12);
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        assert!(matches!(
            config().with_n_critic(0).validate(),
            Err(StarganError::Configuration(_))
        ));
        assert!(matches!(
            config().with_num_iters_decay(5).validate(),
            Err(StarganError::Configuration(_))
        ));
        let mut config = config();
        config.selected_attrs = vec!["Male".to_string()];
        assert!(matches!(config.label_encoder(), Err(StarganError::Configuration(_))));
    }

    #[test]
    fn non_finite_losses_are_fatal() {
        let mut log = LossLog::default();
        log.push("D/loss_real", 0.5);
        log.push("D/loss_gp", f64::NAN);
        match log.ensure_finite(7) {
            Err(StarganError::NumericDivergence { tag, iteration, .. }) => {
                assert_eq!(tag, "D/loss_gp");
                assert_eq!(iteration, 7);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(log.format_pairs(), ", D/loss_real: 0.5000, D/loss_gp: NaN");
    }

    #[test]
    fn elapsed_time_is_formatted_as_hours_minutes_seconds() {
        assert_eq!(format_elapsed(Duration::from_secs(3723)), "1:02:03");
        assert_eq!(format_elapsed(Duration::from_secs(59)), "0:00:59");
    }
}
