//! CNN backbone for image tensors
//!
//! Four convolutional blocks with global average pooling form the feature
//! extractor; a two-layer head with dropout is the classifier.

use burn::{
    config::Config,
    module::{Module, ModuleVisitor},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use super::OpenSetNet;

/// Configuration for the CNN backbone
#[derive(Config, Debug)]
pub struct CnnNetConfig {
    /// Number of known classes
    pub num_classes: usize,

    /// Number of input channels
    #[config(default = "3")]
    pub in_channels: usize,

    /// Base number of convolutional filters; the feature dimension is `8 * base_filters`
    #[config(default = "16")]
    pub base_filters: usize,

    /// Width of the hidden classifier layer
    #[config(default = "128")]
    pub hidden_units: usize,

    /// Dropout rate for regularization
    #[config(default = "0.3")]
    pub dropout_rate: f64,
}

impl CnnNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CnnNet<B> {
        let base = self.base_filters;

        let conv1 = ConvBlock::new(self.in_channels, base, 3, true, device);
        let conv2 = ConvBlock::new(base, base * 2, 3, true, device);
        let conv3 = ConvBlock::new(base * 2, base * 4, 3, true, device);
        let conv4 = ConvBlock::new(base * 4, base * 8, 3, false, device);

        CnnNet {
            conv1,
            conv2,
            conv3,
            conv4,
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(base * 8, self.hidden_units).init(device),
            dropout: DropoutConfig::new(self.dropout_rate).init(),
            fc2: LinearConfig::new(self.hidden_units, self.num_classes).init(device),
            feature_dim: base * 8,
            num_classes: self.num_classes,
        }
    }
}

/// Conv2d, BatchNorm, ReLU and an optional 2x2 max pool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
    pub pool: Option<MaxPool2d>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        with_pool: bool,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        let pool = if with_pool {
            Some(MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init())
        } else {
            None
        };

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);

        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }
}

/// Convolutional open-set classifier
#[derive(Module, Debug)]
pub struct CnnNet<B: Backend> {
    pub conv1: ConvBlock<B>,
    pub conv2: ConvBlock<B>,
    pub conv3: ConvBlock<B>,
    pub conv4: ConvBlock<B>,
    pub global_pool: AdaptiveAvgPool2d,
    pub fc1: Linear<B>,
    pub dropout: Dropout,
    pub fc2: Linear<B>,
    feature_dim: usize,
    num_classes: usize,
}

impl<B: Backend> OpenSetNet<B> for CnnNet<B> {
    fn feature(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(input);
        let x = self.conv2.forward(x);
        let x = self.conv3.forward(x);
        let x = self.conv4.forward(x);

        // [B, C, H, W] -> [B, C, 1, 1] -> [B, C]
        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        x.reshape([batch_size, channels])
    }

    fn classifier(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.fc1.forward(features);
        let x = Relu::new().forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn visit_norm_layers<V: ModuleVisitor<B>>(&self, visitor: &mut V) {
        for block in [&self.conv1, &self.conv2, &self.conv3, &self.conv4] {
            block.bn.visit(visitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_feature_and_logit_shapes() {
        let device = Default::default();
        let model = CnnNetConfig::new(5)
            .with_base_filters(4)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);
        let features = model.feature(input.clone());
        assert_eq!(features.dims(), [2, 32]);
        assert_eq!(model.feature_dim(), 32);

        let logits = model.forward(input);
        assert_eq!(logits.dims(), [2, 5]);
        assert_eq!(model.num_classes(), 5);
    }
}
