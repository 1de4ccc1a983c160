use crate::error::{Result, StarganError};
use crate::model::{Translation, Translator};
use burn::nn::loss::{MseLoss, Reduction};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;
use serde::{Deserialize, Serialize};

/// Projected gradient-sign attack hyperparameters.
#[derive(Config, Debug)]
pub struct PgdConfig {
    /// L-infinity budget of the perturbation.
    #[config(default = 0.05)]
    pub epsilon: f64,
    #[config(default = 10)]
    pub steps: usize,
    #[config(default = 0.01)]
    pub step_size: f64,
    /// Start from a uniform draw in `[-epsilon, epsilon]` instead of zero.
    #[config(default = false)]
    pub random_init: bool,
}

impl PgdConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.epsilon.is_finite() && self.epsilon >= 0.0) {
            return Err(StarganError::config(format!(
                "attack epsilon must be finite and non-negative, got {}",
                self.epsilon
            )));
        }
        if !(self.step_size.is_finite() && self.step_size >= 0.0) {
            return Err(StarganError::config(format!(
                "attack step size must be finite and non-negative, got {}",
                self.step_size
            )));
        }
        Ok(())
    }

    pub fn init(&self, signal: TargetSignal) -> PgdAttack {
        PgdAttack {
            config: self.clone(),
            signal,
        }
    }
}

/// Which generator signal the attack pushes away from its reference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetSignal {
    #[default]
    Output,
    /// Feature map after the given generator block.
    Layer(usize),
}

impl TargetSignal {
    /// Pick this signal out of a generator pass.
    pub fn select<B: Backend>(self, translation: Translation<B>) -> Result<Tensor<B, 4>> {
        match self {
            TargetSignal::Output => Ok(translation.image),
            TargetSignal::Layer(idx) => {
                let available = translation.features.len();
                translation.features.into_iter().nth(idx).ok_or_else(|| {
                    StarganError::config(format!(
                        "feature layer {idx} out of range, generator exposes {available}"
                    ))
                })
            }
        }
    }
}

impl std::fmt::Display for TargetSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetSignal::Output => write!(f, "output"),
            TargetSignal::Layer(idx) => write!(f, "layer {idx}"),
        }
    }
}

/// A target condition, the reference its signal is compared against, and its loss weight.
#[derive(Clone, Debug)]
pub struct ConditionedTarget<B: Backend> {
    pub condition: Tensor<B, 2>,
    pub reference: Tensor<B, 4>,
    pub weight: f64,
}

impl<B: Backend> ConditionedTarget<B> {
    pub fn new(condition: Tensor<B, 2>, reference: Tensor<B, 4>) -> Self {
        Self {
            condition,
            reference,
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Adversarial input and the perturbation that produced it, both detached.
#[derive(Clone, Debug)]
pub struct Perturbed<B: Backend> {
    pub adversarial: Tensor<B, 4>,
    pub perturbation: Tensor<B, 4>,
}

/// One input-agnostic perturbation shared across batches.
#[derive(Clone, Debug)]
pub struct UniversalPerturbation<B: Backend> {
    delta: Tensor<B, 4>,
}

impl<B: Backend> UniversalPerturbation<B> {
    /// Zero perturbation shaped `[1, channels, height, width]`.
    pub fn new(channels: usize, height: usize, width: usize, device: &B::Device) -> Self {
        Self {
            delta: Tensor::zeros([1, channels, height, width], device),
        }
    }

    /// Uniform draw in `[-epsilon, epsilon]` shaped `[1, channels, height, width]`.
    pub fn random(channels: usize, height: usize, width: usize, epsilon: f64, device: &B::Device) -> Self {
        if epsilon <= 0.0 {
            return Self::new(channels, height, width, device);
        }
        Self {
            delta: Tensor::random(
                [1, channels, height, width],
                Distribution::Uniform(-epsilon, epsilon),
                device,
            ),
        }
    }

    pub fn perturbation(&self) -> Tensor<B, 4> {
        self.delta.clone()
    }

    /// Add the shared perturbation to every image and clip to the valid pixel range.
    pub fn apply(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        self.check_shape(images.dims(), "images")?;
        let device = images.device();
        Ok(images
            .add(self.delta.clone().to_device(&device))
            .clamp(-1.0, 1.0))
    }

    /// Ascend along the sign of the batch-summed gradient, then project onto the budget.
    pub fn apply_gradient(&mut self, grad: Tensor<B, 4>, epsilon: f64, step_size: f64) -> Result<()> {
        self.check_shape(grad.dims(), "gradient")?;
        let step = grad.sum_dim(0).sign().mul_scalar(step_size);
        self.delta = self.delta.clone().add(step).clamp(-epsilon, epsilon);
        Ok(())
    }

    fn check_shape(&self, dims: [usize; 4], what: &str) -> Result<()> {
        let delta = self.delta.dims();
        if dims[1..] != delta[1..] {
            return Err(StarganError::shape(format!(
                "universal perturbation {delta:?} does not fit {what} {dims:?}"
            )));
        }
        Ok(())
    }
}

/// Iterative gradient-sign attack against a frozen translator.
#[derive(Clone, Debug)]
pub struct PgdAttack {
    config: PgdConfig,
    signal: TargetSignal,
}

impl PgdAttack {
    pub fn config(&self) -> &PgdConfig {
        &self.config
    }

    pub fn signal(&self) -> TargetSignal {
        self.signal
    }

    /// Per-sample attack for a single target condition.
    pub fn perturb<B, T>(
        &self,
        translator: &T,
        images: Tensor<B, 4>,
        condition: Tensor<B, 2>,
        reference: Tensor<B, 4>,
    ) -> Result<Perturbed<B>>
    where
        B: AutodiffBackend,
        T: Translator<B>,
    {
        self.perturb_joint(translator, images, &[ConditionedTarget::new(condition, reference)])
    }

    /// Per-sample attack whose loss is the weighted sum over every target condition.
    pub fn perturb_joint<B, T>(
        &self,
        translator: &T,
        images: Tensor<B, 4>,
        targets: &[ConditionedTarget<B>],
    ) -> Result<Perturbed<B>>
    where
        B: AutodiffBackend,
        T: Translator<B>,
    {
        self.check_targets(translator, &images, targets)?;
        let clean = images.detach();
        let mut state = self.initial(&clean);
        for _ in 0..self.config.steps {
            let grad = self.input_gradient(translator, state.adversarial.clone(), targets)?;
            state = self.step(&clean, state.perturbation, grad);
        }
        Ok(state)
    }

    /// Per-sample attack taking one projected step per target condition in each iteration.
    pub fn perturb_iterative<B, T>(
        &self,
        translator: &T,
        images: Tensor<B, 4>,
        targets: &[ConditionedTarget<B>],
    ) -> Result<Perturbed<B>>
    where
        B: AutodiffBackend,
        T: Translator<B>,
    {
        self.check_targets(translator, &images, targets)?;
        let clean = images.detach();
        let mut state = self.initial(&clean);
        for _ in 0..self.config.steps {
            for target in targets {
                let grad = self.input_gradient(
                    translator,
                    state.adversarial.clone(),
                    std::slice::from_ref(target),
                )?;
                state = self.step(&clean, state.perturbation, grad);
            }
        }
        Ok(state)
    }

    /// Fresh universal session honoring `random_init`.
    pub fn universal_session<B: Backend>(
        &self,
        channels: usize,
        height: usize,
        width: usize,
        device: &B::Device,
    ) -> UniversalPerturbation<B> {
        if self.config.random_init {
            UniversalPerturbation::random(channels, height, width, self.config.epsilon, device)
        } else {
            UniversalPerturbation::new(channels, height, width, device)
        }
    }

    /// Update the shared perturbation against this batch and return the batch's adversarial input.
    pub fn perturb_universal<B, T>(
        &self,
        translator: &T,
        images: Tensor<B, 4>,
        condition: Tensor<B, 2>,
        reference: Tensor<B, 4>,
        session: &mut UniversalPerturbation<B>,
    ) -> Result<Perturbed<B>>
    where
        B: AutodiffBackend,
        T: Translator<B>,
    {
        let targets = [ConditionedTarget::new(condition, reference)];
        self.check_targets(translator, &images, &targets)?;
        let clean = images.detach();
        for _ in 0..self.config.steps {
            let grad = self.input_gradient(translator, session.apply(clean.clone())?, &targets)?;
            session.apply_gradient(grad, self.config.epsilon, self.config.step_size)?;
        }
        let adversarial = session.apply(clean.clone())?;
        Ok(Perturbed {
            perturbation: adversarial.clone().sub(clean),
            adversarial,
        })
    }

    fn check_targets<B, T>(&self, translator: &T, images: &Tensor<B, 4>, targets: &[ConditionedTarget<B>]) -> Result<()>
    where
        B: AutodiffBackend,
        T: Translator<B>,
    {
        if let TargetSignal::Layer(idx) = self.signal {
            let available = translator.feature_count();
            if idx >= available {
                return Err(StarganError::config(format!(
                    "feature layer {idx} out of range, generator exposes {available}"
                )));
            }
        }
        if targets.is_empty() {
            return Err(StarganError::config("attack needs at least one target condition"));
        }
        let dims = images.dims();
        for target in targets {
            let [rows, _] = target.condition.dims();
            if rows != dims[0] {
                return Err(StarganError::shape(format!(
                    "condition has {rows} rows for a batch of {}",
                    dims[0]
                )));
            }
            if self.signal == TargetSignal::Output && target.reference.dims() != dims {
                return Err(StarganError::shape(format!(
                    "reference {:?} does not match input {dims:?}",
                    target.reference.dims()
                )));
            }
        }
        Ok(())
    }

    fn initial<B: Backend>(&self, clean: &Tensor<B, 4>) -> Perturbed<B> {
        let epsilon = self.config.epsilon;
        let delta = if self.config.random_init && epsilon > 0.0 {
            Tensor::random(clean.dims(), Distribution::Uniform(-epsilon, epsilon), &clean.device())
        } else {
            clean.zeros_like()
        };
        self.project(clean, delta)
    }

    fn step<B: Backend>(&self, clean: &Tensor<B, 4>, delta: Tensor<B, 4>, grad: Tensor<B, 4>) -> Perturbed<B> {
        self.project(clean, delta.add(grad.sign().mul_scalar(self.config.step_size)))
    }

    /// Clip the perturbation to the budget and the perturbed image to `[-1, 1]`.
    fn project<B: Backend>(&self, clean: &Tensor<B, 4>, delta: Tensor<B, 4>) -> Perturbed<B> {
        let epsilon = self.config.epsilon;
        let adversarial = clean.clone().add(delta.clamp(-epsilon, epsilon)).clamp(-1.0, 1.0);
        let perturbation = adversarial.clone().sub(clean.clone()).clamp(-epsilon, epsilon);
        Perturbed {
            adversarial,
            perturbation,
        }
    }

    fn input_gradient<B, T>(
        &self,
        translator: &T,
        input: Tensor<B, 4>,
        targets: &[ConditionedTarget<B>],
    ) -> Result<Tensor<B, 4>>
    where
        B: AutodiffBackend,
        T: Translator<B>,
    {
        let input = input.detach().require_grad();
        let mut total: Option<Tensor<B, 1>> = None;
        for target in targets {
            let signal = self
                .signal
                .select(translator.translate(input.clone(), target.condition.clone()))?;
            if signal.dims() != target.reference.dims() {
                return Err(StarganError::shape(format!(
                    "reference {:?} does not match {} signal {:?}",
                    target.reference.dims(),
                    self.signal,
                    signal.dims()
                )));
            }
            let loss = MseLoss::new()
                .forward(signal, target.reference.clone(), Reduction::Mean)
                .mul_scalar(target.weight);
            total = Some(match total {
                Some(acc) => acc.add(loss),
                None => loss,
            });
        }
        let total = total.ok_or_else(|| StarganError::config("attack needs at least one target condition"))?;
        let grads = total.backward();
        Ok(input
            .grad(&grads)
            .map(Tensor::<B, 4>::from_inner)
            .unwrap_or_else(|| input.zeros_like()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Generator, ModelConfig};
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn generator(device: &<TestBackend as Backend>::Device) -> Generator<TestBackend> {
        ModelConfig::new(8, 3)
            .with_g_conv_dim(4)
            .with_g_repeat_num(1)
            .init_generator::<TestBackend>(3, device)
            .no_grad()
    }

    fn images(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        Tensor::random([2, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), device)
    }

    fn condition(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 2> {
        Tensor::ones([2, 3], device)
    }

    fn max_abs(tensor: Tensor<TestBackend, 4>) -> f32 {
        tensor.abs().max().into_scalar().elem::<f32>()
    }

    #[test]
    fn perturbation_stays_within_budget() {
        let device = Default::default();
        let generator = generator(&device);
        let images = images(&device);
        // Step sizes above, near and far below the budget.
        for (epsilon, step_size) in [(0.03, 0.02), (0.01, 0.05), (0.1, 0.001), (0.5, 0.2)] {
            for random_init in [false, true] {
                let attack = PgdConfig::new()
                    .with_epsilon(epsilon)
                    .with_steps(4)
                    .with_step_size(step_size)
                    .with_random_init(random_init)
                    .init(TargetSignal::Output);

                let perturbed = attack
                    .perturb(&generator, images.clone(), condition(&device), images.zeros_like())
                    .unwrap();
                let bound = epsilon as f32 + 1e-6;
                assert!(max_abs(perturbed.perturbation.clone()) <= bound);
                assert!(max_abs(perturbed.adversarial.clone()) <= 1.0);
                let drift = max_abs(perturbed.adversarial.sub(images.clone()));
                assert!(drift <= bound, "drift was {drift} for eps {epsilon}, step {step_size}");
            }
        }
    }

    #[test]
    fn zero_budget_is_identity() {
        let device = Default::default();
        let generator = generator(&device);
        let images = images(&device);
        let attack = PgdConfig::new().with_epsilon(0.0).with_steps(5).init(TargetSignal::Output);

        let perturbed = attack
            .perturb(&generator, images.clone(), condition(&device), images.zeros_like())
            .unwrap();
        assert_eq!(max_abs(perturbed.perturbation), 0.0);
        assert_eq!(max_abs(perturbed.adversarial.sub(images)), 0.0);
    }

    #[test]
    fn zero_gradient_leaves_universal_perturbation_unchanged() {
        let device = Default::default();
        let mut session = UniversalPerturbation::<TestBackend>::new(3, 8, 8, &device);
        session
            .apply_gradient(Tensor::ones([2, 3, 8, 8], &device), 0.05, 0.01)
            .unwrap();
        let before = session.perturbation().into_data();

        for _ in 0..2 {
            session
                .apply_gradient(Tensor::zeros([4, 3, 8, 8], &device), 0.05, 0.01)
                .unwrap();
        }
        session.perturbation().into_data().assert_eq(&before, true);
    }

    #[test]
    fn random_universal_session_starts_inside_the_budget() {
        let device = Default::default();
        let attack = PgdConfig::new()
            .with_epsilon(0.05)
            .with_random_init(true)
            .init(TargetSignal::Output);
        let session = attack.universal_session::<TestBackend>(3, 8, 8, &device);
        let delta = max_abs(session.perturbation());
        assert!(delta > 0.0 && delta <= 0.05 + 1e-6, "start was {delta}");

        let zero = PgdConfig::new().init(TargetSignal::Output);
        let session = zero.universal_session::<TestBackend>(3, 8, 8, &device);
        assert_eq!(max_abs(session.perturbation()), 0.0);
    }

    #[test]
    fn universal_gradient_must_match_image_shape() {
        let device = Default::default();
        let mut session = UniversalPerturbation::<TestBackend>::new(3, 8, 8, &device);
        let result = session.apply_gradient(Tensor::ones([2, 3, 4, 4], &device), 0.05, 0.01);
        assert!(matches!(result, Err(StarganError::ShapeMismatch(_))));
    }

    #[test]
    fn universal_session_accumulates_across_batches() {
        let device = Default::default();
        let generator = generator(&device);
        let attack = PgdConfig::new().with_steps(2).init(TargetSignal::Output);
        let mut session = UniversalPerturbation::new(3, 8, 8, &device);

        for _ in 0..2 {
            let batch = images(&device);
            let perturbed = attack
                .perturb_universal(&generator, batch.clone(), condition(&device), batch.zeros_like(), &mut session)
                .unwrap();
            assert_eq!(perturbed.adversarial.dims(), [2, 3, 8, 8]);
        }
        assert_eq!(session.perturbation().dims(), [1, 3, 8, 8]);
        assert!(max_abs(session.perturbation()) <= 0.05 + 1e-6);
    }

    #[test]
    fn layer_index_out_of_range_is_a_configuration_error() {
        let device = Default::default();
        let generator = generator(&device);
        let images = images(&device);
        let attack = PgdConfig::new().init(TargetSignal::Layer(99));
        let result = attack.perturb(&generator, images.clone(), condition(&device), images.zeros_like());
        assert!(matches!(result, Err(StarganError::Configuration(_))));
    }

    #[test]
    fn feature_attack_checks_reference_shape() {
        let device = Default::default();
        let generator = generator(&device);
        let images = images(&device);
        let attack = PgdConfig::new().with_steps(1).init(TargetSignal::Layer(0));
        let result = attack.perturb(&generator, images.clone(), condition(&device), images.zeros_like());
        assert!(matches!(result, Err(StarganError::ShapeMismatch(_))));

        let reference = Tensor::zeros([2, 4, 8, 8], &device);
        assert!(attack.perturb(&generator, images, condition(&device), reference).is_ok());
    }

    #[test]
    fn condition_rows_must_match_batch() {
        let device = Default::default();
        let generator = generator(&device);
        let images = images(&device);
        let attack = PgdConfig::new().init(TargetSignal::Output);
        let result = attack.perturb(&generator, images.clone(), Tensor::ones([3, 3], &device), images.zeros_like());
        assert!(matches!(result, Err(StarganError::ShapeMismatch(_))));
    }

    #[test]
    fn multi_condition_attacks_respect_budget() {
        let device = Default::default();
        let generator = generator(&device);
        let images = images(&device);
        let attack = PgdConfig::new().with_steps(2).with_epsilon(0.02).init(TargetSignal::Output);
        let targets = vec![
            ConditionedTarget::new(condition(&device), images.zeros_like()),
            ConditionedTarget::new(condition(&device).neg(), images.zeros_like()).with_weight(0.5),
        ];

        let joint = attack.perturb_joint(&generator, images.clone(), &targets).unwrap();
        let iterative = attack.perturb_iterative(&generator, images, &targets).unwrap();
        assert!(max_abs(joint.perturbation) <= 0.02 + 1e-6);
        assert!(max_abs(iterative.perturbation) <= 0.02 + 1e-6);
    }
}
