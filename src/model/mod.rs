pub mod discriminator;
pub mod generator;
pub mod layers;

use crate::error::{Result, StarganError};
use burn::prelude::*;

pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use generator::{Generator, GeneratorConfig};

/// Hyperparameters for the generator and discriminator.
#[derive(Config, Debug)]
pub struct ModelConfig {
    pub image_size: usize,
    /// Domain labels of the first (or only) dataset.
    pub c_dim: usize,
    /// Domain labels of the second dataset in joint mode.
    #[config(default = 0)]
    pub c2_dim: usize,
    #[config(default = 64)]
    pub g_conv_dim: usize,
    #[config(default = 64)]
    pub d_conv_dim: usize,
    #[config(default = 6)]
    pub g_repeat_num: usize,
    #[config(default = 6)]
    pub d_repeat_num: usize,
    #[config(default = 3)]
    pub image_channels: usize,
}

/// Generator output: the translated image and the activation after every block.
#[derive(Clone, Debug)]
pub struct Translation<B: Backend> {
    pub image: Tensor<B, 4>,
    pub features: Vec<Tensor<B, 4>>,
}

/// Conditional image-to-image network attacked and trained by the orchestrators.
pub trait Translator<B: Backend> {
    fn translate(&self, images: Tensor<B, 4>, condition: Tensor<B, 2>) -> Translation<B>;

    /// Number of intermediate feature maps returned by `translate`.
    fn feature_count(&self) -> usize;
}

/// Critic returning (realism score map, per-domain classification logits).
pub trait Critic<B: Backend> {
    fn critique(&self, images: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 2>);
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 || self.c_dim == 0 {
            return Err(StarganError::config("image_size and c_dim must be positive"));
        }
        if self.g_conv_dim == 0 || self.d_conv_dim == 0 || self.d_repeat_num == 0 {
            return Err(StarganError::config(
                "conv dims and d_repeat_num must be positive",
            ));
        }
        let downscale = 1usize << self.d_repeat_num;
        if self.image_size % downscale != 0 || self.image_size % 4 != 0 {
            return Err(StarganError::config(format!(
                "image_size {} must be divisible by 4 and by 2^d_repeat_num = {downscale}",
                self.image_size
            )));
        }
        Ok(())
    }

    /// Feature maps exposed by the generator: stem, two down-sampling blocks,
    /// residual blocks, two up-sampling blocks.
    pub fn feature_layers(&self) -> usize {
        3 + self.g_repeat_num + 2
    }

    pub fn generator_config(&self, condition_dim: usize) -> GeneratorConfig {
        GeneratorConfig::new(self.g_conv_dim, condition_dim, self.g_repeat_num)
            .with_image_channels(self.image_channels)
    }

    pub fn discriminator_config(&self, class_dim: usize) -> DiscriminatorConfig {
        DiscriminatorConfig::new(self.image_size, self.d_conv_dim, class_dim, self.d_repeat_num)
            .with_image_channels(self.image_channels)
    }

    pub fn init_generator<B: Backend>(&self, condition_dim: usize, device: &B::Device) -> Generator<B> {
        self.generator_config(condition_dim).init(device)
    }

    pub fn init_discriminator<B: Backend>(&self, class_dim: usize, device: &B::Device) -> Discriminator<B> {
        self.discriminator_config(class_dim).init(device)
    }
}
