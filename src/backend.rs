//! Backend selection
//!
//! `cuda` builds train on `burn_cuda::Cuda`; every other build (and every
//! test) runs on `burn_ndarray::NdArray`.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
pub type DefaultBackend = burn_ndarray::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray"), not(feature = "cpu")))]
compile_error!("Enable one of the `ndarray`, `cpu` or `cuda` features");

/// Autodiff backend used by every trainer
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Device of the training backend (the first GPU for `cuda`)
pub fn default_device() -> <TrainingBackend as Backend>::Device {
    Default::default()
}

/// Human-readable backend name for banners and logs
pub fn backend_name() -> &'static str {
    if cfg!(feature = "cuda") {
        "CUDA (GPU)"
    } else {
        "NdArray (CPU)"
    }
}
