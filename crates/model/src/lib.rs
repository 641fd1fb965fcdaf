pub mod config;
pub mod densenet;
pub mod init;
pub mod wide_resnet;

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

pub use config::NetArch;
pub use densenet::DenseNet;
pub use init::WeightInit;
pub use wide_resnet::WideResNet;

/// Seam between the orchestration layer and the concrete architectures.
///
/// `forward_t` maps an image batch `[N, 3, H, W]` to logits `[N, num_classes]`.
/// With `train = true` dropout is active and batch-norm statistics are
/// updated; with `train = false` both are frozen.
pub trait ImageClassifier {
    fn forward_t(&self, images: &Tensor, train: bool) -> Result<Tensor>;
}

/// Instantiates the architecture described by `arch`, registering its
/// parameters under `vb`. The initialization rule is resolved per layer kind
/// at construction time.
pub fn get_model(
    arch: &NetArch,
    weight_init: WeightInit,
    vb: VarBuilder,
) -> Result<Box<dyn ImageClassifier>> {
    arch.validate().map_err(candle_core::Error::Msg)?;
    match arch {
        NetArch::DenseNet(cfg) => Ok(Box::new(DenseNet::new(cfg, weight_init, vb)?)),
        NetArch::WideResNet(cfg) => Ok(Box::new(WideResNet::new(cfg, weight_init, vb)?)),
    }
}
