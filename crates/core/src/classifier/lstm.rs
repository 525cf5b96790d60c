use super::{
    Classifier, ClassifierConfig, ClassifierError, EpochStats, LabeledSet, Result, TrainingReport,
};
use crate::normalize::PaddedTensor;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{
    linear, linear_no_bias, loss, ops, AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder,
    VarMap,
};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tracing::{debug, info};

const LOG_TARGET: &str = "speech_emotion::classifier";

/// Two stacked masked LSTMs, a ReLU dense layer with dropout, and a softmax head.
///
/// Padded timesteps are skipped using each sample's recorded length: the
/// recurrent state is carried through unchanged, so padding never reaches
/// the output.
pub struct LstmClassifier {
    config: ClassifierConfig,
    device: Device,
    trained: Option<Trained>,
}

struct Trained {
    _varmap: VarMap,
    network: Network,
    num_classes: usize,
    width: usize,
}

impl LstmClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device: Device::Cpu,
            trained: None,
        })
    }

    fn run_epoch(
        &self,
        network: &Network,
        optimizer: &mut AdamW,
        train: LabeledSet<'_>,
        order: &[usize],
    ) -> Result<(f32, f32)> {
        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        for batch in order.chunks(self.config.batch_size) {
            let (xs, mask) = batch_inputs(train.inputs, batch, &self.device)?;
            let targets: Vec<u32> = batch.iter().map(|&i| train.labels[i]).collect();
            let ys = Tensor::new(targets.as_slice(), &self.device)?;

            let logits = network.forward(&xs, &mask, true)?;
            let batch_loss = loss::cross_entropy(&logits, &ys)?;
            optimizer.backward_step(&batch_loss)?;

            loss_sum += f64::from(batch_loss.to_scalar::<f32>()?) * batch.len() as f64;
            let predicted = logits.argmax(D::Minus1)?.to_vec1::<u32>()?;
            correct += predicted
                .iter()
                .zip(&targets)
                .filter(|(p, t)| p == t)
                .count();
        }
        let n = order.len() as f64;
        Ok(((loss_sum / n) as f32, (correct as f64 / n) as f32))
    }

    fn probabilities(&self, network: &Network, inputs: &PaddedTensor) -> Result<Array2<f32>> {
        let n = inputs.num_samples();
        let mut rows: Vec<Vec<f32>> = Vec::with_capacity(n);
        let all: Vec<usize> = (0..n).collect();
        for batch in all.chunks(self.config.batch_size) {
            let (xs, mask) = batch_inputs(inputs, batch, &self.device)?;
            let logits = network.forward(&xs, &mask, false)?;
            let probs = ops::softmax(&logits, D::Minus1)?;
            rows.extend(probs.to_vec2::<f32>()?);
        }
        let classes = rows.first().map_or(0, Vec::len);
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        Array2::from_shape_vec((n, classes), flat)
            .map_err(|e| ClassifierError::Shape(e.to_string()))
    }
}

impl Classifier for LstmClassifier {
    fn fit(
        &mut self,
        train: LabeledSet<'_>,
        validation: Option<LabeledSet<'_>>,
        num_classes: usize,
    ) -> Result<TrainingReport> {
        if num_classes == 0 {
            return Err(ClassifierError::NoClasses);
        }
        if train.is_empty() {
            return Err(ClassifierError::EmptyTrainingSet);
        }
        train.check(num_classes)?;
        let width = train.inputs.width();
        if let Some(val) = validation {
            val.check(num_classes)?;
            if val.inputs.width() != width {
                return Err(ClassifierError::Shape(format!(
                    "validation width {} differs from training width {width}",
                    val.inputs.width()
                )));
            }
        }
        let validation = validation.filter(|v| !v.is_empty());

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let network = Network::new(width, num_classes, &self.config, vb)?;
        seeded_init(&varmap, self.config.seed, &self.device)?;
        let mut optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: self.config.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        info!(
            target: LOG_TARGET,
            samples = train.len(),
            validation = validation.map_or(0, |v| v.len()),
            classes = num_classes,
            width,
            "training classifier"
        );

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut order: Vec<usize> = (0..train.len()).collect();
        let mut stopper = EarlyStopping::new(self.config.early_stopping_patience);
        let mut plateau = PlateauDecay::new(&self.config);
        let mut report = TrainingReport::default();
        let mut best_weights = snapshot(&varmap)?;

        for epoch in 1..=self.config.max_epochs {
            order.shuffle(&mut rng);
            let (loss, accuracy) = self.run_epoch(&network, &mut optimizer, train, &order)?;

            let (val_loss, val_accuracy) = match validation {
                Some(val) => {
                    let probs = self.probabilities(&network, val.inputs)?;
                    let eval = super::Evaluation::from_probabilities(probs.view(), val.labels)?;
                    (Some(eval.loss), Some(eval.accuracy))
                }
                None => (None, None),
            };
            let monitored = val_loss.unwrap_or(loss);

            report.epochs.push(EpochStats {
                epoch,
                loss,
                accuracy,
                val_loss,
                val_accuracy,
                learning_rate: optimizer.learning_rate(),
            });
            debug!(
                target: LOG_TARGET,
                epoch,
                loss,
                accuracy,
                val_loss = ?val_loss,
                val_accuracy = ?val_accuracy,
                lr = optimizer.learning_rate(),
                "epoch done"
            );

            if stopper.observe(epoch, monitored) {
                best_weights = snapshot(&varmap)?;
            }
            if let Some(lr) = plateau.observe(monitored, optimizer.learning_rate()) {
                info!(target: LOG_TARGET, epoch, lr, "reducing learning rate");
                optimizer.set_learning_rate(lr);
            }
            if stopper.should_stop() {
                info!(
                    target: LOG_TARGET,
                    epoch,
                    best_epoch = stopper.best_epoch,
                    "early stopping"
                );
                report.stopped_early = true;
                break;
            }
        }

        restore(&varmap, &best_weights)?;
        report.best_epoch = stopper.best_epoch;
        report.best_monitored_loss = stopper.best;

        self.trained = Some(Trained {
            _varmap: varmap,
            network,
            num_classes,
            width,
        });
        Ok(report)
    }

    fn predict(&self, inputs: &PaddedTensor) -> Result<Array2<f32>> {
        let trained = self.trained.as_ref().ok_or(ClassifierError::NotFitted)?;
        if inputs.width() != trained.width {
            return Err(ClassifierError::Shape(format!(
                "expected feature width {}, got {}",
                trained.width,
                inputs.width()
            )));
        }
        if inputs.num_samples() == 0 {
            return Ok(Array2::zeros((0, trained.num_classes)));
        }
        self.probabilities(&trained.network, inputs)
    }
}

/// Keeps the lowest monitored loss and counts epochs without improvement.
struct EarlyStopping {
    patience: usize,
    best: f32,
    best_epoch: usize,
    wait: usize,
}

impl EarlyStopping {
    fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f32::INFINITY,
            best_epoch: 0,
            wait: 0,
        }
    }

    /// Returns true when `value` is a new best.
    fn observe(&mut self, epoch: usize, value: f32) -> bool {
        if value < self.best {
            self.best = value;
            self.best_epoch = epoch;
            self.wait = 0;
            true
        } else {
            self.wait += 1;
            false
        }
    }

    fn should_stop(&self) -> bool {
        self.wait >= self.patience
    }
}

/// Multiplies the learning rate by `factor` after `patience` epochs without
/// improvement, never going below `min_lr`.
struct PlateauDecay {
    patience: usize,
    factor: f64,
    min_lr: f64,
    min_delta: f32,
    best: f32,
    wait: usize,
}

impl PlateauDecay {
    fn new(config: &ClassifierConfig) -> Self {
        Self {
            patience: config.lr_plateau_patience,
            factor: config.lr_factor,
            min_lr: config.min_learning_rate,
            min_delta: 1e-4,
            best: f32::INFINITY,
            wait: 0,
        }
    }

    fn observe(&mut self, value: f32, current_lr: f64) -> Option<f64> {
        if value < self.best - self.min_delta {
            self.best = value;
            self.wait = 0;
            return None;
        }
        self.wait += 1;
        if self.wait < self.patience || current_lr <= self.min_lr {
            return None;
        }
        self.wait = 0;
        Some((current_lr * self.factor).max(self.min_lr))
    }
}

struct LstmLayer {
    input: Linear,
    recurrent: Linear,
    units: usize,
}

impl LstmLayer {
    fn new(in_dim: usize, units: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            input: linear(in_dim, 4 * units, vb.pp("input"))?,
            recurrent: linear_no_bias(units, 4 * units, vb.pp("recurrent"))?,
            units,
        })
    }

    /// `xs` is `(batch, steps, in_dim)`, `mask` is `(batch, steps)` with 1.0
    /// on real steps. Returns every hidden state and the final one.
    fn forward(&self, xs: &Tensor, mask: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let (batch, steps, _) = xs.dims3()?;
        let mut h = Tensor::zeros((batch, self.units), DType::F32, xs.device())?;
        let mut c = h.clone();
        let projected = self.input.forward(xs)?;
        let mut outputs = Vec::with_capacity(steps);

        for t in 0..steps {
            let x_t = projected.narrow(1, t, 1)?.squeeze(1)?;
            let gates = (x_t + self.recurrent.forward(&h)?)?;
            let gates = gates.chunk(4, 1)?;
            let i = ops::sigmoid(&gates[0])?;
            let f = ops::sigmoid(&gates[1])?;
            let g = gates[2].tanh()?;
            let o = ops::sigmoid(&gates[3])?;

            let c_next = ((f * &c)? + (i * g)?)?;
            let h_next = (o * c_next.tanh()?)?;

            let keep_new = mask.narrow(1, t, 1)?;
            let keep_old = keep_new.affine(-1.0, 1.0)?;
            c = (keep_new.broadcast_mul(&c_next)? + keep_old.broadcast_mul(&c)?)?;
            h = (keep_new.broadcast_mul(&h_next)? + keep_old.broadcast_mul(&h)?)?;
            outputs.push(h.unsqueeze(1)?);
        }

        let sequence = Tensor::cat(&outputs, 1)?;
        Ok((sequence, h))
    }
}

struct Network {
    first: LstmLayer,
    second: LstmLayer,
    dense: Linear,
    head: Linear,
    dropout: f32,
}

impl Network {
    fn new(
        width: usize,
        num_classes: usize,
        config: &ClassifierConfig,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            first: LstmLayer::new(width, config.first_units, vb.pp("lstm1"))?,
            second: LstmLayer::new(config.first_units, config.second_units, vb.pp("lstm2"))?,
            dense: linear(config.second_units, config.dense_units, vb.pp("dense"))?,
            head: linear(config.dense_units, num_classes, vb.pp("head"))?,
            dropout: config.dropout,
        })
    }

    /// Returns logits of shape `(batch, classes)`.
    fn forward(&self, xs: &Tensor, mask: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let (sequence, _) = self.first.forward(xs, mask)?;
        let (_, last) = self.second.forward(&sequence, mask)?;
        let hidden = self.dense.forward(&last)?.relu()?;
        let hidden = if train && self.dropout > 0.0 {
            ops::dropout(&hidden, self.dropout)?
        } else {
            hidden
        };
        self.head.forward(&hidden)
    }
}

/// Gathers `rows` of `inputs` into a `(batch, steps, width)` tensor and the
/// matching step mask.
fn batch_inputs(
    inputs: &PaddedTensor,
    rows: &[usize],
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let steps = inputs.max_len();
    let width = inputs.width();
    let values = inputs.values();
    let lengths = inputs.lengths();

    let mut data = Vec::with_capacity(rows.len() * steps * width);
    let mut mask = Vec::with_capacity(rows.len() * steps);
    for &row in rows {
        data.extend(values.index_axis(Axis(0), row).iter().copied());
        let len = lengths[row];
        mask.extend((0..steps).map(|t| if t < len { 1.0f32 } else { 0.0 }));
    }
    let xs = Tensor::from_vec(data, (rows.len(), steps, width), device)?;
    let mask = Tensor::from_vec(mask, (rows.len(), steps), device)?;
    Ok((xs, mask))
}

/// Redraws every parameter from `seed`: Glorot-uniform weights, zero biases
/// and a forget-gate bias of one on the LSTM input projections.
fn seeded_init(varmap: &VarMap, seed: u64, device: &Device) -> Result<()> {
    let vars = varmap.data().lock().map_err(|_| ClassifierError::Poisoned)?;
    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();

    let mut rng = StdRng::seed_from_u64(seed);
    for name in names {
        let var = &vars[name];
        let dims = var.dims().to_vec();
        let values: Vec<f32> = match dims.as_slice() {
            &[fan_out, fan_in] => {
                let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
                (0..fan_out * fan_in)
                    .map(|_| rng.random_range(-limit..=limit))
                    .collect()
            }
            &[len] if name.ends_with("input.bias") => {
                let units = len / 4;
                (0..len)
                    .map(|i| if (units..2 * units).contains(&i) { 1.0 } else { 0.0 })
                    .collect()
            }
            _ => vec![0.0; var.elem_count()],
        };
        var.set(&Tensor::from_vec(values, dims, device)?)?;
    }
    Ok(())
}

fn snapshot(varmap: &VarMap) -> Result<HashMap<String, Tensor>> {
    let vars = varmap.data().lock().map_err(|_| ClassifierError::Poisoned)?;
    vars.iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
        .collect()
}

fn restore(varmap: &VarMap, weights: &HashMap<String, Tensor>) -> Result<()> {
    let vars = varmap.data().lock().map_err(|_| ClassifierError::Poisoned)?;
    for (name, var) in vars.iter() {
        if let Some(saved) = weights.get(name) {
            var.set(saved)?;
        }
    }
    Ok(())
}
