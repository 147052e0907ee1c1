//! Centroid calibration ("reachability")
//!
//! Per-class mean features are computed once from labeled data with a frozen
//! feature extractor. Logits are then multiplied by `scale / d_min`, where
//! `d_min` is the distance from the example's feature vector to the nearest
//! centroid, so examples far from every known class end up with a flat softmax.

use std::path::Path;

use burn::prelude::*;
use tracing::{debug, info};

use crate::dataset::{BatchLoader, LabeledBatch, SampleItem};
use crate::model::OpenSetNet;
use crate::utils::artifacts;
use crate::utils::error::{OpenSetError, Result};
use crate::utils::{host_f32, host_i64};

/// Row-major `(num_classes, feature_dim)` table of class mean features
#[derive(Debug, Clone, PartialEq)]
pub struct CentroidTable {
    num_classes: usize,
    feature_dim: usize,
    data: Vec<f32>,
}

impl CentroidTable {
    pub fn from_rows(num_classes: usize, feature_dim: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != num_classes * feature_dim {
            return Err(OpenSetError::shape(
                "centroid table",
                vec![num_classes, feature_dim],
                vec![data.len()],
            ));
        }
        Ok(Self {
            num_classes,
            feature_dim,
            data,
        })
    }

    /// Mean feature per class over one pass of `loader`.
    ///
    /// Examples labeled -1 are skipped. Classes without examples keep a zero row.
    pub fn compute<B: Backend, M: OpenSetNet<B>>(
        model: &M,
        loader: &mut BatchLoader<SampleItem, LabeledBatch<B>>,
    ) -> Result<Self> {
        let num_classes = model.num_classes();
        let feature_dim = model.feature_dim();
        let mut sums = vec![0.0f64; num_classes * feature_dim];
        let mut counts = vec![0usize; num_classes];

        for batch in loader.iter() {
            let features = model.feature(batch.images);
            let [n, width] = features.dims();
            if width != feature_dim {
                return Err(OpenSetError::shape(
                    "centroid features",
                    vec![n, feature_dim],
                    vec![n, width],
                ));
            }
            let features = host_f32(features, "features")?;
            let labels = host_i64(batch.targets, "labels")?;

            for (row, &label) in features.chunks(feature_dim).zip(&labels) {
                if label < 0 {
                    continue;
                }
                let class = label as usize;
                if class >= num_classes {
                    return Err(OpenSetError::LabelOutOfRange { label, num_classes });
                }
                counts[class] += 1;
                let acc = &mut sums[class * feature_dim..(class + 1) * feature_dim];
                acc.iter_mut().zip(row).for_each(|(a, &v)| *a += v as f64);
            }
        }

        let mut data = vec![0.0f32; num_classes * feature_dim];
        for (class, &count) in counts.iter().enumerate() {
            if count == 0 {
                debug!("Class {} has no labeled examples; centroid stays zero", class);
                continue;
            }
            for d in 0..feature_dim {
                data[class * feature_dim + d] = (sums[class * feature_dim + d] / count as f64) as f32;
            }
        }

        info!(
            "Computed {} centroids of width {} from {} examples",
            num_classes,
            feature_dim,
            counts.iter().sum::<usize>()
        );
        Self::from_rows(num_classes, feature_dim, data)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        info!("Saving centroids to {:?}", path);
        artifacts::write_f32(path, &self.data)
    }

    pub fn load(path: &Path, num_classes: usize, feature_dim: usize) -> Result<Self> {
        let data = artifacts::read_f32(path, num_classes * feature_dim)?;
        Self::from_rows(num_classes, feature_dim, data)
    }

    /// Reuse a persisted table when present, otherwise compute and persist one
    pub fn load_or_compute<B: Backend, M: OpenSetNet<B>>(
        path: &Path,
        model: &M,
        loader: &mut BatchLoader<SampleItem, LabeledBatch<B>>,
    ) -> Result<Self> {
        if path.exists() {
            info!("Loading centroids from {:?}", path);
            return Self::load(path, model.num_classes(), model.feature_dim());
        }
        let table = Self::compute(model, loader)?;
        table.save(path)?;
        Ok(table)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn row(&self, class: usize) -> &[f32] {
        &self.data[class * self.feature_dim..(class + 1) * self.feature_dim]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        Tensor::from_floats(
            TensorData::new(self.data.clone(), [self.num_classes, self.feature_dim]),
            device,
        )
    }

    /// Host-side nearest-centroid distance of each feature row
    pub fn min_distances(&self, features: &[f32]) -> Vec<f32> {
        features
            .chunks(self.feature_dim)
            .map(|f| {
                (0..self.num_classes)
                    .map(|k| {
                        self.row(k)
                            .iter()
                            .zip(f)
                            .map(|(c, x)| (x - c) * (x - c))
                            .sum::<f32>()
                            .sqrt()
                    })
                    .fold(f32::INFINITY, f32::min)
            })
            .collect()
    }
}

/// Distance from each feature row `[N, D]` to its nearest centroid `[K, D]`, as `[N, 1]`
pub fn min_centroid_distance<B: Backend>(features: Tensor<B, 2>, centroids: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, d] = features.dims();
    let [k, _] = centroids.dims();

    let f = features.unsqueeze_dim::<3>(1).expand([n, k, d]);
    let c = centroids.unsqueeze_dim::<3>(0).expand([n, k, d]);
    let dist = (f - c).powf_scalar(2.0).sum_dim(2).reshape([n, k]).sqrt();
    dist.min_dim(1)
}

/// Scale each logit row by `scale / d_min`, with `d_min` clamped to `f32::EPSILON`
pub fn rescale<B: Backend>(
    logits: Tensor<B, 2>,
    features: Tensor<B, 2>,
    centroids: Tensor<B, 2>,
    scale: f32,
) -> Tensor<B, 2> {
    let d_min = min_centroid_distance(features, centroids).clamp_min(f32::EPSILON);
    logits * d_min.recip().mul_scalar(scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{InMemoryDataset, LabeledBatcher};
    use crate::model::{MlpNet, MlpNetConfig};
    use burn::module::Param;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    /// MLP whose feature extractor is the identity on 3-d inputs
    fn identity_features(device: &<TestBackend as Backend>::Device) -> MlpNet<TestBackend> {
        let mut model = MlpNetConfig::new(3, 3)
            .with_feature_dim(3)
            .init::<TestBackend>(device);
        let eye = Tensor::<TestBackend, 2>::eye(3, device);
        let zeros = Tensor::<TestBackend, 1>::zeros([3], device);
        model.fc_in.weight = Param::from_tensor(eye.clone());
        model.fc_in.bias = Some(Param::from_tensor(zeros.clone()));
        model.fc_feat.weight = Param::from_tensor(eye);
        model.fc_feat.bias = Some(Param::from_tensor(zeros));
        model
    }

    #[test]
    fn test_one_hot_features_give_identity() {
        let device = Default::default();
        let model = identity_features(&device);
        let items = vec![
            SampleItem::new(vec![1.0, 0.0, 0.0], 0),
            SampleItem::new(vec![0.0, 1.0, 0.0], 1),
            SampleItem::new(vec![0.0, 0.0, 1.0], 2),
            SampleItem::new(vec![9.0, 9.0, 9.0], -1),
        ];
        let dataset = InMemoryDataset::new(items, [3, 1, 1]).unwrap();
        let mut loader = BatchLoader::new(dataset, LabeledBatcher::<TestBackend>::new(device, [3, 1, 1]), 2);

        let table = CentroidTable::compute(&model, &mut loader).unwrap();
        assert_eq!(
            table.as_slice(),
            &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
        );
    }

    #[test]
    fn test_label_out_of_range_rejected() {
        let device = Default::default();
        let model = identity_features(&device);
        let items = vec![SampleItem::new(vec![1.0, 0.0, 0.0], 5)];
        let dataset = InMemoryDataset::new(items, [3, 1, 1]).unwrap();
        let mut loader = BatchLoader::new(dataset, LabeledBatcher::<TestBackend>::new(device, [3, 1, 1]), 2);
        assert!(matches!(
            CentroidTable::compute(&model, &mut loader),
            Err(OpenSetError::LabelOutOfRange { label: 5, .. })
        ));
    }

    #[test]
    fn test_example_on_centroid_gets_max_scale() {
        let device = Default::default();
        let centroids = Tensor::<TestBackend, 2>::eye(3, &device);
        let features = Tensor::<TestBackend, 2>::from_floats(
            [[0.0, 1.0, 0.0], [0.0, 3.0, 0.0]],
            &device,
        );
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.0, 1.0, 0.0], [0.0, 1.0, 0.0]], &device);

        let scaled: Vec<f32> = rescale(logits, features, centroids, 1.0)
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(scaled[1], 1.0 / f32::EPSILON);
        assert!((scaled[4] - 0.5).abs() < 1e-6);
        assert!(scaled[1] > scaled[4]);
    }

    #[test]
    fn test_tensor_and_host_distances_agree() {
        let device = Default::default();
        let table = CentroidTable::from_rows(2, 2, vec![0.0, 0.0, 3.0, 4.0]).unwrap();
        let features = vec![3.0, 0.0, 3.0, 5.0];
        let host = table.min_distances(&features);

        let tensor: Vec<f32> = min_centroid_distance(
            Tensor::<TestBackend, 2>::from_floats(TensorData::new(features, [2, 2]), &device),
            table.to_tensor::<TestBackend>(&device),
        )
        .into_data()
        .to_vec()
        .unwrap();

        assert_eq!(host, vec![3.0, 1.0]);
        assert!(host.iter().zip(&tensor).all(|(a, b)| (a - b).abs() < 1e-5));
    }

    #[test]
    fn test_persisted_table_is_reused() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("model_centroids.bin");
        let table = CentroidTable::from_rows(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        table.save(&path).unwrap();

        let device = Default::default();
        let model = MlpNetConfig::new(3, 2)
            .with_feature_dim(2)
            .init::<TestBackend>(&device);
        let empty = InMemoryDataset::new(vec![], [3, 1, 1]).unwrap();
        let mut loader = BatchLoader::new(empty, LabeledBatcher::<TestBackend>::new(device, [3, 1, 1]), 2);

        let loaded = CentroidTable::load_or_compute(&path, &model, &mut loader).unwrap();
        assert_eq!(loaded, table);

        assert!(CentroidTable::load(&path, 3, 2).is_err());
    }
}
