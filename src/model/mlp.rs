//! MLP backbone for pre-extracted feature vectors
//!
//! Inputs keep the `[N, C, H, W]` batch layout (typically `[N, D, 1, 1]`) and
//! are flattened before the first layer.

use burn::{
    config::Config,
    module::{Module, ModuleVisitor},
    nn::{Dropout, DropoutConfig, Linear, LinearConfig, Relu},
    tensor::{backend::Backend, Tensor},
};

use super::OpenSetNet;

/// Configuration for the MLP backbone
#[derive(Config, Debug)]
pub struct MlpNetConfig {
    /// Flattened input size
    pub input_dim: usize,
    /// Number of known classes
    pub num_classes: usize,
    /// Feature dimension
    #[config(default = "32")]
    pub feature_dim: usize,
    #[config(default = "0.0")]
    pub dropout_rate: f64,
}

impl MlpNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MlpNet<B> {
        MlpNet {
            fc_in: LinearConfig::new(self.input_dim, self.feature_dim).init(device),
            fc_feat: LinearConfig::new(self.feature_dim, self.feature_dim).init(device),
            dropout: DropoutConfig::new(self.dropout_rate).init(),
            head: LinearConfig::new(self.feature_dim, self.num_classes).init(device),
            feature_dim: self.feature_dim,
            num_classes: self.num_classes,
        }
    }
}

/// Two-layer feature extractor with a linear classifier head.
///
/// There are no normalization layers, so far-away inputs stay far away in
/// feature space, which the reachability calibration relies on.
#[derive(Module, Debug)]
pub struct MlpNet<B: Backend> {
    pub fc_in: Linear<B>,
    pub fc_feat: Linear<B>,
    pub dropout: Dropout,
    pub head: Linear<B>,
    feature_dim: usize,
    num_classes: usize,
}

impl<B: Backend> OpenSetNet<B> for MlpNet<B> {
    fn feature(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, c, h, w] = input.dims();
        let x = input.reshape([batch_size, c * h * w]);
        let x = self.fc_in.forward(x);
        let x = Relu::new().forward(x);
        self.fc_feat.forward(x)
    }

    fn classifier(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = Relu::new().forward(features);
        let x = self.dropout.forward(x);
        self.head.forward(x)
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn visit_norm_layers<V: ModuleVisitor<B>>(&self, _visitor: &mut V) {}
}
