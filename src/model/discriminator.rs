use crate::model::layers::conv;
use crate::model::Critic;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Configuration for the PatchGAN critic with an auxiliary domain classifier.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub image_size: usize,
    pub conv_dim: usize,
    /// Number of classification logits.
    pub class_dim: usize,
    pub repeat_num: usize,
    #[config(default = 3)]
    pub image_channels: usize,
}

/// Discriminator with a realism score map and a domain classification head.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    convs: Vec<Conv2d<B>>,
    score: Conv2d<B>,
    classifier: Conv2d<B>,
}

impl DiscriminatorConfig {
    /// Initialize the discriminator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let mut convs = Vec::with_capacity(self.repeat_num);
        let mut channels = self.conv_dim;
        convs.push(biased_conv(self.image_channels, channels, 4, 2, 1, device));
        for _ in 1..self.repeat_num {
            convs.push(biased_conv(channels, channels * 2, 4, 2, 1, device));
            channels *= 2;
        }

        let kernel = self.image_size >> self.repeat_num;
        let score = conv(channels, 1, 3, 1, 1, device);
        let classifier = conv(channels, self.class_dim, kernel, 1, 0, device);

        Discriminator {
            convs,
            score,
            classifier,
        }
    }
}

impl<B: Backend> Discriminator<B> {
    /// Forward pass returning (score_map, class_logits).
    pub fn forward(&self, images: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 2>) {
        let mut x = images;
        for conv in &self.convs {
            x = leaky_relu(conv.forward(x), 0.01);
        }

        let scores = self.score.forward(x.clone());
        let logits = self.classifier.forward(x);
        let [batch, classes, _, _] = logits.dims();
        (scores, logits.reshape([batch, classes]))
    }
}

impl<B: Backend> Critic<B> for Discriminator<B> {
    fn critique(&self, images: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 2>) {
        self.forward(images)
    }
}

fn biased_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .init(device)
}
