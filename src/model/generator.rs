use crate::model::layers::{conv, ConvBlock, ResidualBlock, UpBlock};
use crate::model::{Translation, Translator};
use burn::nn::conv::Conv2d;
use burn::prelude::*;

/// Configuration for the conditional encoder/residual/decoder generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub conv_dim: usize,
    /// Width of the condition vector replicated over the image plane.
    pub condition_dim: usize,
    pub repeat_num: usize,
    #[config(default = 3)]
    pub image_channels: usize,
}

/// Generator that concatenates the spatially replicated condition to the image.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    stem: ConvBlock<B>,
    down: Vec<ConvBlock<B>>,
    residual: Vec<ResidualBlock<B>>,
    up: Vec<UpBlock<B>>,
    head: Conv2d<B>,
}

impl GeneratorConfig {
    /// Initialize generator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let stem = ConvBlock::new(
            self.image_channels + self.condition_dim,
            self.conv_dim,
            7,
            1,
            3,
            device,
        );

        let mut channels = self.conv_dim;
        let mut down = Vec::with_capacity(2);
        for _ in 0..2 {
            down.push(ConvBlock::new(channels, channels * 2, 4, 2, 1, device));
            channels *= 2;
        }

        let residual = (0..self.repeat_num)
            .map(|_| ResidualBlock::new(channels, device))
            .collect();

        let mut up = Vec::with_capacity(2);
        for _ in 0..2 {
            up.push(UpBlock::new(channels, channels / 2, device));
            channels /= 2;
        }

        let head = conv(channels, self.image_channels, 7, 1, 3, device);

        Generator {
            stem,
            down,
            residual,
            up,
            head,
        }
    }
}

impl<B: Backend> Generator<B> {
    /// Forward pass returning the translated image and every block's activation.
    pub fn forward(&self, images: Tensor<B, 4>, condition: Tensor<B, 2>) -> Translation<B> {
        let [batch, _, height, width] = images.dims();
        let [_, condition_dim] = condition.dims();
        let condition = condition
            .reshape([batch, condition_dim, 1, 1])
            .repeat(&[1, 1, height, width]);

        let mut features = Vec::with_capacity(self.feature_count());
        let mut x = self.stem.forward(Tensor::cat(vec![images, condition], 1));
        features.push(x.clone());
        for block in &self.down {
            x = block.forward(x);
            features.push(x.clone());
        }
        for block in &self.residual {
            x = block.forward(x);
            features.push(x.clone());
        }
        for block in &self.up {
            x = block.forward(x);
            features.push(x.clone());
        }

        Translation {
            image: self.head.forward(x).tanh(),
            features,
        }
    }
}

impl<B: Backend> Translator<B> for Generator<B> {
    fn translate(&self, images: Tensor<B, 4>, condition: Tensor<B, 2>) -> Translation<B> {
        self.forward(images, condition)
    }

    fn feature_count(&self) -> usize {
        1 + self.down.len() + self.residual.len() + self.up.len()
    }
}
