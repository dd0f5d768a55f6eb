//! Encoder with a projection head and a linear classifier

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    config::ModelConfig,
    error::{ContrastError, ContrastResult},
    nn::layers::{Backbone, BackboneKind, Linear, LinearGrads},
    tensor::{l2_normalize_backward, l2_normalize_rows, Shape, Tensor},
};

/// Projected features before and after L2 normalization
#[derive(Debug, Clone)]
pub struct Projection {
    pub raw: Tensor<2>,
    /// Unit-norm rows, the queries and keys of the contrastive loss
    pub normalized: Tensor<2>,
    pub norms: Vec<f32>,
}

/// Flat gradient of every trainable parameter, in [`ContrastModel::parameters_mut`] order
#[derive(Debug, Clone, PartialEq)]
pub struct ModelGradients(Vec<f32>);

impl ModelGradients {
    pub fn new(projection: &LinearGrads, classifier: &LinearGrads) -> Self {
        let mut values = Vec::new();
        for part in projection.parameter_slices().into_iter().chain(classifier.parameter_slices()) {
            values.extend_from_slice(part);
        }
        Self(values)
    }

    pub fn from_vec(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn all_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    pub fn l2_norm(&self) -> f32 {
        self.0.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: [usize; 2],
    pub data: Vec<f32>,
}

impl NamedTensor {
    fn new(name: &str, tensor: &Tensor<2>) -> Self {
        Self {
            name: name.to_string(),
            shape: [tensor.rows(), tensor.cols()],
            data: tensor.to_vec(),
        }
    }

    fn bias(name: &str, bias: &[f32]) -> Self {
        Self {
            name: name.to_string(),
            shape: [1, bias.len()],
            data: bias.to_vec(),
        }
    }

    fn to_tensor(&self) -> ContrastResult<Tensor<2>> {
        Tensor::from_vec(self.data.clone(), Shape::new(self.shape))
    }
}

/// Serializable snapshot of a [`ContrastModel`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    pub backbone: BackboneKind,
    pub input_dim: usize,
    pub norm_feats: bool,
    pub tensors: Vec<NamedTensor>,
}

impl ModelWeights {
    fn take(&self, name: &str) -> ContrastResult<&NamedTensor> {
        self.tensors
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ContrastError::SerializationError(format!("missing tensor '{}'", name)))
    }

    fn linear(&self, prefix: &str) -> ContrastResult<Linear> {
        let weight = self.take(&format!("{}.weight", prefix))?.to_tensor()?;
        let bias = self.take(&format!("{}.bias", prefix))?.data.clone();
        Linear::from_parts(weight, bias)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContrastModel {
    backbone: Backbone,
    projection: Linear,
    classifier: Linear,
    norm_feats: bool,
}

impl ContrastModel {
    pub fn new<R: Rng + ?Sized>(
        config: &ModelConfig,
        input_dim: usize,
        num_classes: usize,
        rng: &mut R,
    ) -> Self {
        let backbone = Backbone::new(config.backbone, input_dim, config.feature_dim, rng);
        let features = backbone.output_dim();
        Self {
            projection: Linear::new(features, config.projection_dim, rng),
            classifier: Linear::new(features, num_classes, rng),
            backbone,
            norm_feats: config.norm_feats,
        }
    }

    pub fn backbone(&self) -> &Backbone {
        &self.backbone
    }

    pub fn projection_head(&self) -> &Linear {
        &self.projection
    }

    pub fn classifier(&self) -> &Linear {
        &self.classifier
    }

    pub fn num_classes(&self) -> usize {
        self.classifier.out_features()
    }

    pub fn input_dim(&self) -> usize {
        self.backbone.input_dim()
    }

    /// Backbone features, L2-normalized when `norm_feats` is set. Always detached.
    pub fn features(&self, inputs: &Tensor<2>) -> ContrastResult<Tensor<2>> {
        let features = self.backbone.forward(inputs)?;
        if self.norm_feats {
            Ok(l2_normalize_rows(&features).0.detach())
        } else {
            Ok(features)
        }
    }

    pub fn project(&self, features: &Tensor<2>) -> ContrastResult<Projection> {
        let raw = self.projection.forward(features)?.with_grad(true);
        let (normalized, norms) = l2_normalize_rows(&raw);
        Ok(Projection { raw, normalized, norms })
    }

    /// Classifier logits. The classifier never sends gradient into the features.
    pub fn classify(&self, features: &Tensor<2>) -> ContrastResult<Tensor<2>> {
        self.classifier.forward(&features.detach())
    }

    /// Backpropagate dL/d(normalized projection) into the projection head
    pub fn projection_backward(
        &self,
        features: &Tensor<2>,
        projection: &Projection,
        grad_normalized: &Tensor<2>,
    ) -> ContrastResult<LinearGrads> {
        let grad_raw = l2_normalize_backward(&projection.normalized, &projection.norms, grad_normalized)?;
        self.projection.backward(features, &grad_raw)
    }

    pub fn classifier_backward(
        &self,
        features: &Tensor<2>,
        grad_logits: &Tensor<2>,
    ) -> ContrastResult<LinearGrads> {
        self.classifier.backward(features, grad_logits)
    }

    /// Trainable parameters: projection weight and bias, then classifier weight and bias
    pub fn parameters_mut(&mut self) -> [&mut [f32]; 4] {
        let [pw, pb] = self.projection.parameters_mut();
        let [cw, cb] = self.classifier.parameters_mut();
        [pw, pb, cw, cb]
    }

    pub fn num_parameters(&self) -> usize {
        self.projection.num_parameters() + self.classifier.num_parameters()
    }

    /// Sum of squares of the trainable parameters
    pub fn l2_penalty(&self) -> f32 {
        [&self.projection, &self.classifier]
            .iter()
            .flat_map(|l| l.weight().as_slice().iter().chain(l.bias()))
            .map(|v| v * v)
            .sum()
    }

    pub fn to_weights(&self) -> ModelWeights {
        let mut tensors = Vec::new();
        if let Backbone::RandomProjection(linear) = &self.backbone {
            tensors.push(NamedTensor::new("backbone.weight", linear.weight()));
            tensors.push(NamedTensor::bias("backbone.bias", linear.bias()));
        }
        for (prefix, linear) in [("projection", &self.projection), ("classifier", &self.classifier)] {
            tensors.push(NamedTensor::new(&format!("{}.weight", prefix), linear.weight()));
            tensors.push(NamedTensor::bias(&format!("{}.bias", prefix), linear.bias()));
        }
        ModelWeights {
            backbone: self.backbone.kind(),
            input_dim: self.backbone.input_dim(),
            norm_feats: self.norm_feats,
            tensors,
        }
    }

    pub fn from_weights(weights: &ModelWeights) -> ContrastResult<Self> {
        let backbone = match weights.backbone {
            BackboneKind::Identity => Backbone::Identity { dim: weights.input_dim },
            BackboneKind::RandomProjection => Backbone::RandomProjection(weights.linear("backbone")?),
        };
        let projection = weights.linear("projection")?;
        let classifier = weights.linear("classifier")?;

        if backbone.input_dim() != weights.input_dim
            || projection.in_features() != backbone.output_dim()
            || classifier.in_features() != backbone.output_dim()
        {
            return Err(ContrastError::SerializationError(format!(
                "inconsistent layer widths: backbone {}->{}, projection in {}, classifier in {}",
                backbone.input_dim(),
                backbone.output_dim(),
                projection.in_features(),
                classifier.in_features()
            )));
        }

        Ok(Self {
            backbone,
            projection,
            classifier,
            norm_feats: weights.norm_feats,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn model(backbone: BackboneKind) -> ContrastModel {
        let config = ModelConfig {
            backbone,
            feature_dim: 6,
            projection_dim: 4,
            norm_feats: true,
        };
        ContrastModel::new(&config, 3, 5, &mut StdRng::seed_from_u64(9))
    }

    #[test]
    fn test_projection_is_unit_norm() {
        let model = model(BackboneKind::RandomProjection);
        let inputs = Tensor::from_rows(&[vec![1.0, 0.5, -0.2], vec![0.3, 0.3, 0.3]]).unwrap();
        let features = model.features(&inputs).unwrap();
        let projection = model.project(&features).unwrap();

        for row in projection.normalized.row_iter() {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
        assert!(projection.normalized.requires_grad());
        assert_eq!(model.classify(&features).unwrap().shape().as_slice(), &[2, 5]);
    }

    #[test]
    fn test_parameter_layout_matches_gradients() {
        let mut model = model(BackboneKind::Identity);
        let inputs = Tensor::from_rows(&[vec![1.0, 0.0, 0.0]]).unwrap();
        let features = model.features(&inputs).unwrap();
        let projection = model.project(&features).unwrap();

        let grad_proj = model
            .projection_backward(&features, &projection, &Tensor::zeros(Shape::new([1, 4])))
            .unwrap();
        let grad_cls = model
            .classifier_backward(&features, &Tensor::zeros(Shape::new([1, 5])))
            .unwrap();
        let grads = ModelGradients::new(&grad_proj, &grad_cls);

        let total: usize = model.parameters_mut().iter().map(|p| p.len()).sum();
        assert_eq!(grads.len(), total);
        assert_eq!(total, model.num_parameters());
    }

    #[test]
    fn test_weights_round_trip() {
        for kind in [BackboneKind::Identity, BackboneKind::RandomProjection] {
            let model = model(kind);
            let bytes = bincode::serialize(&model.to_weights()).unwrap();
            let weights: ModelWeights = bincode::deserialize(&bytes).unwrap();
            assert_eq!(ContrastModel::from_weights(&weights).unwrap(), model);
        }
    }

    #[test]
    fn test_missing_tensor_is_reported() {
        let mut weights = model(BackboneKind::Identity).to_weights();
        weights.tensors.retain(|t| t.name != "classifier.bias");
        assert!(matches!(
            ContrastModel::from_weights(&weights),
            Err(ContrastError::SerializationError(_))
        ));
    }
}
