//! Classifier seam and a minimal reference model.
//!
//! The orchestrator and evaluator only see `EcgClassifier`; real
//! architectures plug in behind it. `LinearEcgHead` is the smallest
//! implementation that exercises the whole pipeline.

use burn::module::{Ignored, Module};
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Multi-label ECG classifier over `(batch, leads, siglen)` windows.
pub trait EcgClassifier<B: Backend>: Module<B> {
    /// Raw logits, `(batch, n_classes)`.
    fn forward(&self, signals: Tensor<B, 3>) -> Tensor<B, 2>;

    /// Ordered class vocabulary the output columns correspond to.
    fn classes(&self) -> &[String];

    /// Sigmoid scores plus 0.5-thresholded binary decisions.
    fn inference(&self, signals: Tensor<B, 3>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let scores = sigmoid(self.forward(signals));
        let binary = scores.clone().greater_equal_elem(0.5).float();
        (scores, binary)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearEcgHeadConfig {
    pub leads: usize,
    pub classes: Vec<String>,
}

/// Per-lead mean pooling into a single linear layer.
#[derive(Module, Debug)]
pub struct LinearEcgHead<B: Backend> {
    lin: Linear<B>,
    classes: Ignored<Vec<String>>,
}

impl<B: Backend> LinearEcgHead<B> {
    pub fn new(config: &LinearEcgHeadConfig, device: &B::Device) -> Self {
        Self {
            lin: LinearConfig::new(config.leads, config.classes.len()).init(device),
            classes: Ignored(config.classes.clone()),
        }
    }
}

impl<B: Backend> EcgClassifier<B> for LinearEcgHead<B> {
    fn forward(&self, signals: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch, leads, _] = signals.dims();
        let pooled = signals.mean_dim(2).reshape([batch, leads]);
        self.lin.forward(pooled)
    }

    fn classes(&self) -> &[String] {
        &self.classes.0
    }
}
