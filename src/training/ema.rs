//! EMA teacher
//!
//! A non-autodiff shadow of the student whose tensors follow
//! `ema = d * ema + (1 - d) * student` after every optimizer step. The update
//! also applies decoupled weight decay `student *= 1 - lr * weight_decay` to
//! every student tensor outside the normalization layers.
//!
//! Teacher and student tensors are paired by module traversal order, which is
//! stable for a given architecture even after a record load replaces param ids.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::Path;

use burn::module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, info};

use crate::model::{load_weights, save_weights, OpenSetNet};
use crate::utils::error::{OpenSetError, Result};

/// Flattened float tensors of a module, in traversal order
struct TensorCollector<B: Backend> {
    tensors: Vec<(Vec<usize>, Tensor<B, 1>)>,
}

impl<B: Backend> ModuleVisitor<B> for TensorCollector<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let dims = tensor.dims().to_vec();
        let numel: usize = dims.iter().product();
        self.tensors.push((dims, tensor.clone().reshape([numel])));
    }
}

/// Shapes of a module's float tensors, in traversal order
struct ShapeCollector {
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for ShapeCollector {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.shapes.push(tensor.dims().to_vec());
    }
}

/// Param ids reachable through a visitor, used for the normalization layers
struct IdCollector {
    ids: HashSet<ParamId>,
}

impl<B: Backend> ModuleVisitor<B> for IdCollector {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        self.ids.insert(id);
    }
}

/// Blends student tensors into the teacher
struct EmaBlend<B: Backend> {
    student: Vec<(Vec<usize>, Tensor<B, 1>)>,
    decay: f64,
    cursor: usize,
    error: Option<OpenSetError>,
}

impl<B: Backend> ModuleMapper<B> for EmaBlend<B> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let index = self.cursor;
        self.cursor += 1;
        if self.error.is_some() {
            return tensor;
        }

        let dims = tensor.dims();
        match self.student.get(index) {
            Some((shape, flat)) if shape.as_slice() == dims.as_slice() => {
                let student = flat.clone().reshape(dims);
                tensor.mul_scalar(self.decay) + student.mul_scalar(1.0 - self.decay)
            }
            Some((shape, _)) => {
                self.error = Some(OpenSetError::shape(
                    format!("EMA tensor {}", index),
                    dims.to_vec(),
                    shape.clone(),
                ));
                tensor
            }
            None => {
                self.error = Some(OpenSetError::shape(
                    "EMA tensor count",
                    vec![self.student.len()],
                    vec![index + 1],
                ));
                tensor
            }
        }
    }
}

/// Multiplies every tensor outside `excluded` by `factor`, keeping gradient tracking
struct DecoupledDecay {
    excluded: HashSet<ParamId>,
    factor: f64,
}

impl<B: AutodiffBackend> ModuleMapper<B> for DecoupledDecay {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        if self.excluded.contains(&id) {
            return tensor;
        }
        let require_grad = tensor.is_require_grad();
        let decayed = Tensor::<B, D>::from_inner(tensor.inner().mul_scalar(self.factor));
        if require_grad {
            decayed.require_grad()
        } else {
            decayed
        }
    }
}

fn shapes<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<usize>> {
    let mut collector = ShapeCollector { shapes: Vec::new() };
    module.visit(&mut collector);
    collector.shapes
}

/// Exponential moving average of a student network
pub struct EmaTeacher<B: AutodiffBackend, M: AutodiffModule<B>> {
    model: M::InnerModule,
    decay: f64,
    weight_decay: f64,
    updates: usize,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> EmaTeacher<B, M> {
    /// The teacher network, for evaluation and inference
    pub fn model(&self) -> &M::InnerModule {
        &self.model
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn updates(&self) -> usize {
        self.updates
    }
}

impl<B, M> EmaTeacher<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + OpenSetNet<B>,
    M::InnerModule: OpenSetNet<B::InnerBackend>,
{
    /// Start from a copy of the student. `weight_decay` is the effective
    /// per-step factor, `learning_rate * weight_decay`.
    pub fn new(student: &M, decay: f64, weight_decay: f64) -> Self {
        info!(
            "Creating EMA teacher (decay {}, decoupled weight decay {:e})",
            decay, weight_decay
        );
        Self {
            model: student.valid(),
            decay,
            weight_decay,
            updates: 0,
            _backend: PhantomData,
        }
    }

    /// Blend the student into the teacher, then return the weight-decayed student
    pub fn update(&mut self, student: M) -> Result<M> {
        let mut collector = TensorCollector {
            tensors: Vec::new(),
        };
        student.valid().visit(&mut collector);
        let expected = collector.tensors.len();

        let mut blend = EmaBlend {
            student: collector.tensors,
            decay: self.decay,
            cursor: 0,
            error: None,
        };
        let model = self.model.clone().map(&mut blend);
        if let Some(err) = blend.error {
            return Err(err);
        }
        if blend.cursor != expected {
            return Err(OpenSetError::shape(
                "EMA tensor count",
                vec![expected],
                vec![blend.cursor],
            ));
        }
        self.model = model;
        self.updates += 1;

        if self.weight_decay == 0.0 {
            return Ok(student);
        }
        let mut norm = IdCollector {
            ids: HashSet::new(),
        };
        student.visit_norm_layers(&mut norm);
        let mut decay = DecoupledDecay {
            excluded: norm.ids,
            factor: 1.0 - self.weight_decay,
        };
        Ok(student.map(&mut decay))
    }

    /// Write the teacher as `<path stem>.mpk`
    pub fn save(&self, path: &Path) -> Result<()> {
        debug!("Saving EMA teacher after {} updates", self.updates);
        save_weights(&self.model, path)
    }

    /// Replace the teacher with a saved record, failing on any tensor shape mismatch
    pub fn load(&mut self, path: &Path, device: &<B::InnerBackend as Backend>::Device) -> Result<()> {
        let expected = shapes(&self.model);
        let loaded = load_weights(self.model.clone(), path, device)?;
        let found = shapes(&loaded);

        if expected.len() != found.len() {
            return Err(OpenSetError::shape(
                "EMA checkpoint tensor count",
                vec![expected.len()],
                vec![found.len()],
            ));
        }
        if let Some((e, f)) = expected.iter().zip(&found).find(|(e, f)| e != f) {
            return Err(OpenSetError::shape("EMA checkpoint", e.clone(), f.clone()));
        }

        self.model = loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CnnNet, CnnNetConfig, MlpNet, MlpNetConfig};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    fn flat<B: Backend, M: Module<B>>(module: &M) -> Vec<f32> {
        let mut collector = TensorCollector::<B> {
            tensors: Vec::new(),
        };
        module.visit(&mut collector);
        collector
            .tensors
            .into_iter()
            .flat_map(|(_, t)| t.into_data().convert::<f32>().to_vec::<f32>().unwrap())
            .collect()
    }

    fn mlp() -> MlpNet<TestBackend> {
        MlpNetConfig::new(4, 3)
            .with_feature_dim(5)
            .init::<TestBackend>(&Default::default())
    }

    #[test]
    fn test_decay_one_keeps_teacher() {
        let mut ema = EmaTeacher::new(&mlp(), 1.0, 0.0);
        let before = flat(ema.model());

        ema.update(mlp()).unwrap();
        ema.update(mlp()).unwrap();
        assert_eq!(flat(ema.model()), before);
        assert_eq!(ema.updates(), 2);
    }

    #[test]
    fn test_decay_zero_copies_student() {
        let mut ema = EmaTeacher::new(&mlp(), 0.0, 0.0);
        let student = mlp();
        let target = flat(&student.valid());

        ema.update(student).unwrap();
        let teacher = flat(ema.model());
        assert!(teacher.iter().zip(&target).all(|(a, b)| (a - b).abs() < 1e-6));
    }

    #[test]
    fn test_weight_decay_skips_norm_layers() {
        let device = Default::default();
        let student: CnnNet<TestBackend> = CnnNetConfig::new(3).with_base_filters(2).init(&device);
        let conv_before = flat(&student.conv1.conv.valid());
        let bn_before = flat(&student.conv1.bn.valid());
        let head_before = flat(&student.fc2.valid());

        let mut ema = EmaTeacher::new(&student, 0.5, 0.5);
        let student = ema.update(student).unwrap();

        let conv_after = flat(&student.conv1.conv.valid());
        assert!(conv_after
            .iter()
            .zip(&conv_before)
            .all(|(a, b)| (a - 0.5 * b).abs() < 1e-6));
        let head_after = flat(&student.fc2.valid());
        assert!(head_after
            .iter()
            .zip(&head_before)
            .all(|(a, b)| (a - 0.5 * b).abs() < 1e-6));
        assert_eq!(flat(&student.conv1.bn.valid()), bn_before);
    }

    #[test]
    fn test_decayed_student_still_trains() {
        let mut ema = EmaTeacher::new(&mlp(), 0.9, 0.1);
        let student = ema.update(mlp()).unwrap();
        let mut grads = Vec::new();
        struct RequireGrad<'a>(&'a mut Vec<bool>);
        impl<B: AutodiffBackend> ModuleVisitor<B> for RequireGrad<'_> {
            fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
                self.0.push(tensor.is_require_grad());
            }
        }
        student.visit(&mut RequireGrad(&mut grads));
        assert_eq!(grads.len(), 6);
        assert!(grads.iter().all(|&g| g));
    }

    #[test]
    fn test_checkpoint_round_trip_and_mismatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("model_ema");
        let device = Default::default();

        let mut ema = EmaTeacher::new(&mlp(), 0.5, 0.0);
        ema.update(mlp()).unwrap();
        ema.save(&path).unwrap();
        let saved = flat(ema.model());

        let mut restored = EmaTeacher::new(&mlp(), 0.5, 0.0);
        restored.load(&path, &device).unwrap();
        assert_eq!(flat(restored.model()), saved);

        let wider: MlpNet<TestBackend> = MlpNetConfig::new(4, 3).with_feature_dim(7).init(&device);
        let mut mismatched = EmaTeacher::new(&wider, 0.5, 0.0);
        assert!(mismatched.load(&path, &device).is_err());
    }
}
