use crate::error::{Result, StarganError};
use burn::prelude::*;
use burn::tensor::TensorData;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Attributes that form a mutually exclusive group: exactly one may be active.
pub const HAIR_COLOR_ATTRS: [&str; 4] = ["Black_Hair", "Blond_Hair", "Brown_Hair", "Gray_Hair"];

/// How a dataset encodes its domain labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelKind {
    /// Independent 0/1 attributes per sample (CelebA style).
    Binary,
    /// A single class index per sample (RaFD style).
    Categorical,
}

/// Training/evaluation mode, resolved once when the encoder is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetMode {
    Single(LabelKind),
    /// Binary dataset A (`c_dim`) trained jointly with categorical dataset B (`c2_dim`).
    Joint,
}

/// Which dataset a batch belongs to in joint mode. Single mode always uses `First`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatasetSlot {
    First,
    Second,
}

impl DatasetSlot {
    pub fn index(self) -> i64 {
        match self {
            DatasetSlot::First => 0,
            DatasetSlot::Second => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DatasetSlot::First => "A",
            DatasetSlot::Second => "B",
        }
    }
}

/// Labels exactly as a data source produced them, kept on the host.
#[derive(Clone, Debug, PartialEq)]
pub enum RawLabels {
    /// Row-major `[N, width]` matrix of 0/1 values.
    Binary { values: Vec<f32>, width: usize },
    Categorical(Vec<i64>),
}

impl RawLabels {
    pub fn len(&self) -> usize {
        match self {
            RawLabels::Binary { values, width } => {
                if *width == 0 {
                    0
                } else {
                    values.len() / width
                }
            }
            RawLabels::Categorical(classes) => classes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> LabelKind {
        match self {
            RawLabels::Binary { .. } => LabelKind::Binary,
            RawLabels::Categorical(_) => LabelKind::Categorical,
        }
    }

    /// Reorder rows so that row `i` of the result is row `order[i]` of `self`.
    pub fn permuted(&self, order: &[usize]) -> Self {
        match self {
            RawLabels::Binary { values, width } => {
                let mut out = Vec::with_capacity(values.len());
                for &row in order {
                    out.extend_from_slice(&values[row * width..(row + 1) * width]);
                }
                RawLabels::Binary {
                    values: out,
                    width: *width,
                }
            }
            RawLabels::Categorical(classes) => {
                RawLabels::Categorical(order.iter().map(|&row| classes[row]).collect())
            }
        }
    }

    /// Random permutation of the batch's own labels.
    pub fn shuffled(&self, rng: &mut impl Rng) -> Self {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        self.permuted(&order)
    }
}

/// Classification target matching the discriminator's logit block.
#[derive(Clone, Debug)]
pub enum ClassTarget<B: Backend> {
    Binary(Tensor<B, 2, Int>),
    Categorical(Tensor<B, 1, Int>),
}

/// Generator conditioning plus the matching classification target for one batch.
#[derive(Clone, Debug)]
pub struct EncodedLabels<B: Backend> {
    pub condition: Tensor<B, 2>,
    pub target: ClassTarget<B>,
}

/// Convert label indices to one-hot rows.
pub fn label_to_onehot<B: Backend>(
    labels: &[i64],
    dim: usize,
    device: &B::Device,
) -> Result<Tensor<B, 2>> {
    let mut values = vec![0.0f32; labels.len() * dim];
    for (row, &label) in labels.iter().enumerate() {
        if label < 0 || label as usize >= dim {
            return Err(StarganError::config(format!(
                "label {label} out of range for one-hot dimension {dim}"
            )));
        }
        values[row * dim + label as usize] = 1.0;
    }
    Ok(Tensor::from_data(
        TensorData::new(values, [labels.len(), dim]),
        device,
    ))
}

/// Indices of the selected attributes that belong to the exclusive hair-colour group.
pub fn exclusive_group(attr_names: &[String]) -> Vec<usize> {
    attr_names
        .iter()
        .enumerate()
        .filter(|(_, name)| HAIR_COLOR_ATTRS.contains(&name.as_str()))
        .map(|(idx, _)| idx)
        .collect()
}

/// Build one target label matrix per domain index.
///
/// Binary labels: the exclusive group gets a single active member, every other
/// attribute is negated. Categorical labels: the origin values are ignored and each
/// output is the one-hot of its index for every row.
pub fn create_target_labels<B: Backend>(
    origin: &RawLabels,
    dim: usize,
    kind: LabelKind,
    attr_names: &[String],
    device: &B::Device,
) -> Result<Vec<Tensor<B, 2>>> {
    let batch_size = origin.len();
    match kind {
        LabelKind::Binary => {
            let RawLabels::Binary { values, width } = origin else {
                return Err(StarganError::shape(
                    "binary target labels need binary origin labels",
                ));
            };
            if *width != dim {
                return Err(StarganError::shape(format!(
                    "origin labels have {width} attributes, expected {dim}"
                )));
            }
            let group = exclusive_group(attr_names);
            let mut targets = Vec::with_capacity(dim);
            for idx in 0..dim {
                let mut target = values.clone();
                for row in target.chunks_mut(dim) {
                    if group.contains(&idx) {
                        for &member in &group {
                            row[member] = if member == idx { 1.0 } else { 0.0 };
                        }
                    } else {
                        row[idx] = if row[idx] == 0.0 { 1.0 } else { 0.0 };
                    }
                }
                targets.push(Tensor::from_data(
                    TensorData::new(target, [batch_size, dim]),
                    device,
                ));
            }
            Ok(targets)
        }
        LabelKind::Categorical => (0..dim)
            .map(|idx| label_to_onehot(&vec![idx as i64; batch_size], dim, device))
            .collect(),
    }
}

/// Concatenate `[A block, B block, mask]` with the inactive block zero-filled.
pub fn compose_joint<B: Backend>(
    block: Tensor<B, 2>,
    slot: DatasetSlot,
    c_dim: usize,
    c2_dim: usize,
) -> Result<Tensor<B, 2>> {
    let [batch_size, width] = block.dims();
    let device = block.device();
    let expected = match slot {
        DatasetSlot::First => c_dim,
        DatasetSlot::Second => c2_dim,
    };
    if width != expected {
        return Err(StarganError::shape(format!(
            "dataset {} block has width {width}, expected {expected}",
            slot.name()
        )));
    }
    let mask = label_to_onehot::<B>(&vec![slot.index(); batch_size], 2, &device)?;
    let parts = match slot {
        DatasetSlot::First => vec![block, Tensor::zeros([batch_size, c2_dim], &device), mask],
        DatasetSlot::Second => vec![Tensor::zeros([batch_size, c_dim], &device), block, mask],
    };
    Ok(Tensor::cat(parts, 1))
}

/// Turns raw labels into conditioning vectors for the configured dataset mode.
#[derive(Clone, Debug)]
pub struct LabelEncoder {
    mode: DatasetMode,
    c_dim: usize,
    c2_dim: usize,
    attr_names: Vec<String>,
}

impl LabelEncoder {
    pub fn new(
        mode: DatasetMode,
        c_dim: usize,
        c2_dim: usize,
        attr_names: Vec<String>,
    ) -> Result<Self> {
        if c_dim == 0 {
            return Err(StarganError::config("c_dim must be positive"));
        }
        if mode == DatasetMode::Joint && c2_dim == 0 {
            return Err(StarganError::config("joint mode needs a positive c2_dim"));
        }
        let binary_first = matches!(
            mode,
            DatasetMode::Single(LabelKind::Binary) | DatasetMode::Joint
        );
        if binary_first && attr_names.len() != c_dim {
            return Err(StarganError::config(format!(
                "{} selected attributes for c_dim {c_dim}",
                attr_names.len()
            )));
        }
        Ok(Self {
            mode,
            c_dim,
            c2_dim,
            attr_names,
        })
    }

    pub fn mode(&self) -> DatasetMode {
        self.mode
    }

    /// Width of the generator's condition input.
    pub fn condition_dim(&self) -> usize {
        match self.mode {
            DatasetMode::Single(_) => self.c_dim,
            DatasetMode::Joint => self.c_dim + self.c2_dim + 2,
        }
    }

    /// Width of the discriminator's classification head.
    pub fn class_dim(&self) -> usize {
        match self.mode {
            DatasetMode::Single(_) => self.c_dim,
            DatasetMode::Joint => self.c_dim + self.c2_dim,
        }
    }

    /// Label kind and block width for a dataset slot.
    pub fn slot_layout(&self, slot: DatasetSlot) -> (LabelKind, usize) {
        match (self.mode, slot) {
            (DatasetMode::Single(kind), _) => (kind, self.c_dim),
            (DatasetMode::Joint, DatasetSlot::First) => (LabelKind::Binary, self.c_dim),
            (DatasetMode::Joint, DatasetSlot::Second) => (LabelKind::Categorical, self.c2_dim),
        }
    }

    /// Columns of the discriminator logits that belong to a dataset slot.
    pub fn logit_range(&self, slot: DatasetSlot) -> Range<usize> {
        match (self.mode, slot) {
            (DatasetMode::Joint, DatasetSlot::Second) => self.c_dim..self.c_dim + self.c2_dim,
            _ => 0..self.c_dim,
        }
    }

    /// Encode a batch's labels into a condition vector and classification target.
    pub fn encode<B: Backend>(
        &self,
        labels: &RawLabels,
        slot: DatasetSlot,
        device: &B::Device,
    ) -> Result<EncodedLabels<B>> {
        let (kind, dim) = self.slot_layout(slot);
        let (block, target) = match (kind, labels) {
            (LabelKind::Binary, RawLabels::Binary { values, width }) => {
                if *width != dim {
                    return Err(StarganError::shape(format!(
                        "batch has {width} attributes, expected {dim}"
                    )));
                }
                let batch_size = labels.len();
                let block = Tensor::<B, 2>::from_data(
                    TensorData::new(values.clone(), [batch_size, dim]),
                    device,
                );
                let ints: Vec<i64> = values.iter().map(|&v| i64::from(v != 0.0)).collect();
                let target = Tensor::<B, 2, Int>::from_data(
                    TensorData::new(ints, [batch_size, dim]),
                    device,
                );
                (block, ClassTarget::Binary(target))
            }
            (LabelKind::Categorical, RawLabels::Categorical(classes)) => {
                let block = label_to_onehot::<B>(classes, dim, device)?;
                let target = Tensor::<B, 1, Int>::from_data(
                    TensorData::new(classes.clone(), [classes.len()]),
                    device,
                );
                (block, ClassTarget::Categorical(target))
            }
            (expected, found) => {
                return Err(StarganError::shape(format!(
                    "dataset {} expects {expected:?} labels, got {:?}",
                    slot.name(),
                    found.kind()
                )));
            }
        };
        let condition = self.compose(block, slot)?;
        Ok(EncodedLabels { condition, target })
    }

    /// Wrap a dataset block into the full condition vector for the current mode.
    pub fn compose<B: Backend>(&self, block: Tensor<B, 2>, slot: DatasetSlot) -> Result<Tensor<B, 2>> {
        match self.mode {
            DatasetMode::Single(_) => Ok(block),
            DatasetMode::Joint => compose_joint(block, slot, self.c_dim, self.c2_dim),
        }
    }

    /// Every target condition used for sample grids and evaluation sweeps.
    ///
    /// Joint mode expects dataset A labels and appends the categorical sweep of
    /// dataset B after the binary sweep.
    pub fn target_sweep<B: Backend>(
        &self,
        labels: &RawLabels,
        device: &B::Device,
    ) -> Result<Vec<Tensor<B, 2>>> {
        match self.mode {
            DatasetMode::Single(kind) => {
                create_target_labels(labels, self.c_dim, kind, &self.attr_names, device)
            }
            DatasetMode::Joint => {
                let mut sweep = Vec::with_capacity(self.c_dim + self.c2_dim);
                for block in create_target_labels::<B>(
                    labels,
                    self.c_dim,
                    LabelKind::Binary,
                    &self.attr_names,
                    device,
                )? {
                    sweep.push(self.compose(block, DatasetSlot::First)?);
                }
                for block in create_target_labels::<B>(
                    labels,
                    self.c2_dim,
                    LabelKind::Categorical,
                    &self.attr_names,
                    device,
                )? {
                    sweep.push(self.compose(block, DatasetSlot::Second)?);
                }
                Ok(sweep)
            }
        }
    }
}
