use crate::config::DEFAULT_SEED;
use crate::dataset::{Dataset, Label};
use crate::error::{CnnError, Result};
use crate::network::{Network, OutputLayerStats, binary_cross_entropy};
use ndarray_rand::rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    /// Stop after this many consecutive epochs without improvement. `None`
    /// always runs every epoch.
    pub patience: Option<usize>,
    /// How far the mean loss must drop below the best so far to count as an
    /// improvement.
    pub min_delta: f64,
    pub shuffle: bool,
    /// Seed for the per-epoch sample order.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            epochs: 10,
            learning_rate: 0.01,
            patience: None,
            min_delta: 1e-4,
            shuffle: true,
            seed: DEFAULT_SEED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f64,
    /// Fraction of samples classified correctly, each judged just before the
    /// network trained on it.
    pub accuracy: f64,
    pub output: OutputLayerStats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub epochs: Vec<EpochStats>,
    pub stopped_early: bool,
}

impl TrainingReport {
    pub fn last(&self) -> Option<&EpochStats> {
        self.epochs.last()
    }
}

/// Loss and accuracy of a network over a dataset, without training.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
}

impl Network {
    // Trains the network by single-sample gradient descent. Each epoch the sample order is
    // shuffled with the seeded generator, every sample is first classified (for the accuracy
    // figure) and then trained on, and the epoch's mean loss and accuracy are logged together with
    // the output layer's bias and mean weight. With a patience set, training stops once the mean
    // loss has failed to beat the best so far by `min_delta` for that many epochs in a row.
    pub fn train(&mut self, dataset: &Dataset, config: &TrainingConfig) -> Result<TrainingReport> {
        if dataset.is_empty() {
            return Err(CnnError::NoSamples);
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        let mut report = TrainingReport {
            epochs: Vec::with_capacity(config.epochs),
            stopped_early: false,
        };
        let mut best_loss = f64::INFINITY;
        let mut stale_epochs = 0;

        for epoch in 0..config.epochs {
            if config.shuffle {
                order.shuffle(&mut rng);
            }

            let mut total_loss = 0.0;
            let mut correct = 0;
            for &index in &order {
                let sample = &dataset.samples[index];
                if Label::from_probability(self.forward(&sample.image)?) == sample.label {
                    correct += 1;
                }
                total_loss +=
                    self.backward_and_update(&sample.image, sample.label, config.learning_rate)?;
            }

            let stats = EpochStats {
                epoch,
                loss: total_loss / dataset.len() as f64,
                accuracy: correct as f64 / dataset.len() as f64,
                output: self.output_layer_stats(),
            };
            info!(
                epoch = epoch + 1,
                loss = stats.loss,
                accuracy = stats.accuracy,
                dense2_bias = stats.output.bias,
                dense2_mean_weight = stats.output.mean_weight,
                "finished epoch"
            );
            report.epochs.push(stats);

            if stats.loss < best_loss - config.min_delta {
                best_loss = stats.loss;
                stale_epochs = 0;
            } else {
                stale_epochs += 1;
            }
            if config.patience.is_some_and(|patience| stale_epochs >= patience) {
                info!(epoch = epoch + 1, "stopping early, loss stopped improving");
                report.stopped_early = true;
                break;
            }
        }

        Ok(report)
    }

    // Runs the network over every sample without training and reports the mean loss and the
    // fraction of samples classified correctly.
    pub fn evaluate(&self, dataset: &Dataset) -> Result<Evaluation> {
        if dataset.is_empty() {
            return Err(CnnError::NoSamples);
        }

        let mut total_loss = 0.0;
        let mut correct = 0;
        for sample in &dataset.samples {
            let probability = self.forward(&sample.image)?;
            total_loss += binary_cross_entropy(probability, sample.label);
            if Label::from_probability(probability) == sample.label {
                correct += 1;
            }
        }

        Ok(Evaluation {
            loss: total_loss / dataset.len() as f64,
            accuracy: correct as f64 / dataset.len() as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;

    fn network() -> Network {
        Network::new(&NetworkConfig::new(8, 8, 2, 3, 2).with_hidden_size(8).with_seed(3)).unwrap()
    }

    #[test]
    fn runs_every_epoch_without_patience() {
        let mut network = network();
        let dataset = Dataset::synthetic(8, 8, 6);
        let config = TrainingConfig {
            epochs: 3,
            ..TrainingConfig::default()
        };
        let report = network.train(&dataset, &config).unwrap();
        assert_eq!(report.epochs.len(), 3);
        assert!(!report.stopped_early);
        for (i, stats) in report.epochs.iter().enumerate() {
            assert_eq!(stats.epoch, i);
            assert!(stats.loss.is_finite() && stats.loss >= 0.0);
            assert!((0.0..=1.0).contains(&stats.accuracy));
        }
        assert_eq!(report.last().unwrap().output, network.output_layer_stats());
    }

    #[test]
    fn stops_when_loss_plateaus() {
        let mut network = network();
        let dataset = Dataset::synthetic(8, 8, 4);
        let config = TrainingConfig {
            epochs: 10,
            patience: Some(1),
            min_delta: 1e9,
            ..TrainingConfig::default()
        };
        let report = network.train(&dataset, &config).unwrap();
        assert_eq!(report.epochs.len(), 2);
        assert!(report.stopped_early);
    }

    #[test]
    fn same_seed_trains_identically() {
        let dataset = Dataset::synthetic(8, 8, 6);
        let config = TrainingConfig {
            epochs: 2,
            ..TrainingConfig::default()
        };
        let (mut a, mut b) = (network(), network());
        assert_eq!(a.train(&dataset, &config).unwrap(), b.train(&dataset, &config).unwrap());
        assert_eq!(a.parameters(), b.parameters());
    }

    #[test]
    fn empty_dataset_is_rejected() {
        let mut network = network();
        let empty = Dataset::default();
        assert!(matches!(
            network.train(&empty, &TrainingConfig::default()),
            Err(CnnError::NoSamples)
        ));
        assert!(matches!(network.evaluate(&empty), Err(CnnError::NoSamples)));
    }

    #[test]
    fn evaluation_does_not_train() {
        let network = network();
        let before = network.parameters().clone();
        let evaluation = network.evaluate(&Dataset::synthetic(8, 8, 4)).unwrap();
        assert_eq!(network.parameters(), &before);
        assert!(evaluation.loss > 0.0);
    }
}
