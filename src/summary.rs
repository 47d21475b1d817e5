use crate::config::Dimensions;
use crate::network::Network;
use std::fmt;

const BIAS_PAIRS_SHOWN: usize = 4;

/// A printable snapshot of the architecture and a sample of the parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSummary {
    pub dimensions: Dimensions,
    pub kernels1: Vec<f64>,
    pub kernels2: Vec<f64>,
    /// `(bias1[f], bias2[f])` for the first few filters.
    pub biases: Vec<(f64, f64)>,
    pub dense1_bias: f64,
    pub dense1_weights: Vec<f64>,
}

impl Network {
    /// Samples the first `kernel_show` values of each kernel stack and the
    /// first `dense_show` hidden-layer weights, capped at what exists.
    pub fn summary(&self, kernel_show: usize, dense_show: usize) -> ModelSummary {
        let dims = self.dimensions();
        let params = self.parameters();
        let dense_show = dense_show.min(dims.flattened());

        ModelSummary {
            dimensions: *dims,
            kernels1: params.kernels1.iter().take(kernel_show).copied().collect(),
            kernels2: params.kernels2.iter().take(kernel_show).copied().collect(),
            biases: params
                .bias1
                .iter()
                .zip(&params.bias2)
                .take(BIAS_PAIRS_SHOWN)
                .map(|(&b1, &b2)| (b1, b2))
                .collect(),
            dense1_bias: params.dense1_bias[0],
            dense1_weights: params.dense1_weights.iter().take(dense_show).copied().collect(),
        }
    }
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.dimensions;
        writeln!(f, "Model summary:")?;
        writeln!(
            f,
            " in: {} x {}, filters={}, ksize={}, pool={}, hidden={}",
            d.input_width, d.input_height, d.filters, d.kernel_size, d.pool_size, d.hidden_size
        )?;

        writeln!(f, " first {} kernel1 values:", self.kernels1.len())?;
        for (i, value) in self.kernels1.iter().enumerate() {
            writeln!(f, "  k1[{i}]={value:.6}")?;
        }
        writeln!(f, " first {} kernel2 values:", self.kernels2.len())?;
        for (i, value) in self.kernels2.iter().enumerate() {
            writeln!(f, "  k2[{i}]={value:.6}")?;
        }

        writeln!(f, " bias1/bias2 sample:")?;
        for (i, (b1, b2)) in self.biases.iter().enumerate() {
            writeln!(f, "  b1[{i}]={b1:.6} b2[{i}]={b2:.6}")?;
        }

        writeln!(f, " dense_b={:.6}", self.dense1_bias)?;
        writeln!(f, " first {} dense weights:", self.dense1_weights.len())?;
        for (i, value) in self.dense1_weights.iter().enumerate() {
            writeln!(f, "  dw[{i}]={value:.6}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::NetworkConfig;
    use crate::network::Network;

    #[test]
    fn caps_samples_at_available_values() {
        let network = Network::new(&NetworkConfig::new(6, 6, 2, 2, 2).with_hidden_size(3)).unwrap();
        // 2 filters of 2x2 kernels, flattened pooled size 2 * 2 * 2.
        let summary = network.summary(100, 100);
        assert_eq!(summary.kernels1.len(), 8);
        assert_eq!(summary.kernels2.len(), 8);
        assert_eq!(summary.biases, vec![(0.0, 0.0); 2]);
        assert_eq!(summary.dense1_weights.len(), 8);
        assert_eq!(summary.kernels1[3], network.parameters().kernels1[[0, 1, 1]]);
    }

    #[test]
    fn renders_every_sampled_value() {
        let network = Network::new(&NetworkConfig::new(16, 16, 4, 3, 2)).unwrap();
        let text = network.summary(3, 2).to_string();
        assert!(text.starts_with(
            "Model summary:\n in: 16 x 16, filters=4, ksize=3, pool=2, hidden=32\n"
        ));
        assert!(text.contains(" first 3 kernel1 values:\n"));
        assert!(text.contains("  k2[2]="));
        assert!(!text.contains("  k1[3]="));
        assert!(text.contains("  b1[3]=0.000000 b2[3]=0.000000\n"));
        assert!(text.contains(" dense_b=0.000000\n"));
        assert!(text.contains("  dw[1]="));
        assert!(!text.contains("  dw[2]="));
    }
}
