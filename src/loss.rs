use crate::error::{Result, StarganError};
use crate::labels::ClassTarget;
use burn::nn::loss::{BinaryCrossEntropyLossConfig, CrossEntropyLossConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;

/// Step used by the finite-difference surrogate of the gradient penalty.
const PENALTY_PROBE_STEP: f64 = 1e-2;

/// Critic loss on real images: `-mean(score)`.
pub fn critic_real_loss<B: Backend>(scores: Tensor<B, 4>) -> Tensor<B, 1> {
    scores.mean().neg()
}

/// Critic loss on generated images: `mean(score)`.
pub fn critic_fake_loss<B: Backend>(scores: Tensor<B, 4>) -> Tensor<B, 1> {
    scores.mean()
}

/// Generator adversarial loss, trying to fool the critic: `-mean(score)`.
pub fn generator_adversarial_loss<B: Backend>(scores: Tensor<B, 4>) -> Tensor<B, 1> {
    scores.mean().neg()
}

/// Binary: summed BCE-with-logits over attributes divided by the batch size.
/// Categorical: mean cross-entropy.
pub fn classification_loss<B: Backend>(logits: Tensor<B, 2>, target: ClassTarget<B>) -> Tensor<B, 1> {
    let device = logits.device();
    match target {
        ClassTarget::Binary(target) => {
            let num_attrs = logits.dims()[1];
            BinaryCrossEntropyLossConfig::new()
                .with_logits(true)
                .init(&device)
                .forward(logits, target)
                .mul_scalar(num_attrs as f64)
        }
        ClassTarget::Categorical(target) => CrossEntropyLossConfig::new()
            .init(&device)
            .forward(logits, target),
    }
}

/// Cycle-consistency loss: mean absolute difference.
pub fn reconstruction_loss<B: Backend>(original: Tensor<B, 4>, reconstructed: Tensor<B, 4>) -> Tensor<B, 1> {
    original.sub(reconstructed).abs().mean()
}

/// Per-sample mixing coefficients drawn uniformly from `[0, 1]`, shaped `[N, 1, 1, 1]`.
pub fn random_alpha<B: Backend>(batch_size: usize, device: &B::Device) -> Tensor<B, 4> {
    Tensor::random([batch_size, 1, 1, 1], Distribution::Uniform(0.0, 1.0), device)
}

/// `alpha * real + (1 - alpha) * fake`, with both inputs detached.
pub fn interpolate<B: Backend>(
    real: Tensor<B, 4>,
    fake: Tensor<B, 4>,
    alpha: Tensor<B, 4>,
) -> Result<Tensor<B, 4>> {
    if real.dims() != fake.dims() {
        return Err(StarganError::shape(format!(
            "cannot interpolate {:?} with {:?}",
            real.dims(),
            fake.dims()
        )));
    }
    let one_minus = alpha.clone().neg().add_scalar(1.0);
    Ok(real.detach().mul(alpha).add(fake.detach().mul(one_minus)))
}

/// Sum every non-batch element of a critic output into one value per sample.
fn per_sample_sum<B: Backend, const D: usize>(output: Tensor<B, D>) -> Tensor<B, 1> {
    let batch_size = output.dims()[0];
    let per_sample = output.shape().num_elements() / batch_size;
    output
        .reshape([batch_size, per_sample])
        .sum_dim(1)
        .reshape([batch_size])
}

/// WGAN-GP penalty `mean((||d sum(y) / dx||_2 - 1)^2)` evaluated at `x_hat`.
///
/// The returned value is exact. Its gradient with respect to the critic weights
/// comes from a finite difference of the critic along the normalized input
/// gradient, which only needs first-order autodiff.
pub fn gradient_penalty<B, F, const D: usize>(critic: F, x_hat: Tensor<B, 4>) -> Result<Tensor<B, 1>>
where
    B: AutodiffBackend,
    F: Fn(Tensor<B, 4>) -> Tensor<B, D>,
{
    let [batch_size, channels, height, width] = x_hat.dims();
    let x_hat = x_hat.detach();

    let x_input = x_hat.clone().require_grad();
    let grads = per_sample_sum(critic(x_input.clone())).sum().backward();
    let input_grad = x_input
        .grad(&grads)
        .map(Tensor::<B, 4>::from_inner)
        .unwrap_or_else(|| x_hat.zeros_like());

    let flat = input_grad.reshape([batch_size, channels * height * width]);
    let norm = flat.clone().square().sum_dim(1).sqrt();
    let exact = norm.clone().sub_scalar(1.0).square().mean().detach();

    let direction = flat
        .div(norm.clamp_min(1e-12))
        .reshape([batch_size, channels, height, width]);
    let base = per_sample_sum(critic(x_hat.clone()));
    let shifted = per_sample_sum(critic(x_hat.add(direction.mul_scalar(PENALTY_PROBE_STEP))));
    let directional = shifted.sub(base).div_scalar(PENALTY_PROBE_STEP);
    let surrogate = directional.sub_scalar(1.0).square().mean();

    Ok(surrogate.clone().sub(surrogate.detach()).add(exact))
}
