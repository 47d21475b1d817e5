use crate::error::{CnnError, Result};

/// Width of the fully-connected hidden layer unless overridden.
pub const DEFAULT_HIDDEN_SIZE: usize = 32;
pub const DEFAULT_L2: f64 = 1e-4;
pub const DEFAULT_SEED: u64 = 123_456;

/// Knobs read by the engine on every training call. They belong to one network
/// and may be swapped between calls with [`crate::Network::set_tunables`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tunables {
    /// L2 coefficient added to every gradient as `l2 * w` before clipping.
    pub l2: f64,
    /// Emit hidden-layer activations as debug events on each forward pass.
    pub debug: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            l2: DEFAULT_L2,
            debug: false,
        }
    }
}

/// Everything needed to build a [`crate::Network`].
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    pub input_width: usize,
    pub input_height: usize,
    pub filters: usize,
    pub kernel_size: usize,
    pub pool_size: usize,
    pub hidden_size: usize,
    /// Seed for the weight initializer. Equal seeds give bit-identical networks.
    pub seed: u64,
    pub tunables: Tunables,
}

impl NetworkConfig {
    pub fn new(
        input_width: usize,
        input_height: usize,
        filters: usize,
        kernel_size: usize,
        pool_size: usize,
    ) -> NetworkConfig {
        NetworkConfig {
            input_width,
            input_height,
            filters,
            kernel_size,
            pool_size,
            hidden_size: DEFAULT_HIDDEN_SIZE,
            seed: DEFAULT_SEED,
            tunables: Tunables::default(),
        }
    }

    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    /// Validates the architecture and derives every spatial size from it.
    pub fn dimensions(&self) -> Result<Dimensions> {
        let positive = [
            ("input width", self.input_width),
            ("input height", self.input_height),
            ("filter count", self.filters),
            ("kernel size", self.kernel_size),
            ("pool size", self.pool_size),
            ("hidden size", self.hidden_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(CnnError::InvalidConfig(format!("{name} must be positive")));
        }

        // Two valid convolutions shrink each side by 2 * (k - 1).
        let k = self.kernel_size;
        let conv = |size: usize| size.checked_sub(k - 1).filter(|&out| out > 0);
        let (out1_w, out1_h) = match (conv(self.input_width), conv(self.input_height)) {
            (Some(w), Some(h)) => (w, h),
            _ => {
                return Err(CnnError::InvalidConfig(format!(
                    "kernel size {k} does not fit a {}x{} input",
                    self.input_width, self.input_height
                )));
            }
        };
        let (out2_w, out2_h) = match (conv(out1_w), conv(out1_h)) {
            (Some(w), Some(h)) => (w, h),
            _ => {
                return Err(CnnError::InvalidConfig(format!(
                    "kernel size {k} leaves no output after the second convolution of a {}x{} \
                     input",
                    self.input_width, self.input_height
                )));
            }
        };

        let pooled_w = out2_w / self.pool_size;
        let pooled_h = out2_h / self.pool_size;
        if pooled_w == 0 || pooled_h == 0 {
            return Err(CnnError::InvalidConfig(format!(
                "pool size {} is larger than the {out2_w}x{out2_h} convolution output",
                self.pool_size
            )));
        }

        Ok(Dimensions {
            input_width: self.input_width,
            input_height: self.input_height,
            filters: self.filters,
            kernel_size: k,
            pool_size: self.pool_size,
            hidden_size: self.hidden_size,
            out1_width: out1_w,
            out1_height: out1_h,
            out2_width: out2_w,
            out2_height: out2_h,
            pooled_width: pooled_w,
            pooled_height: pooled_h,
        })
    }
}

/// Sizes derived from a validated [`NetworkConfig`]. Fixed for a network's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub input_width: usize,
    pub input_height: usize,
    pub filters: usize,
    pub kernel_size: usize,
    pub pool_size: usize,
    pub hidden_size: usize,
    pub out1_width: usize,
    pub out1_height: usize,
    pub out2_width: usize,
    pub out2_height: usize,
    pub pooled_width: usize,
    pub pooled_height: usize,
}

impl Dimensions {
    /// Length of the flattened, pooled conv2 activations fed to the hidden layer.
    pub fn flattened(&self) -> usize {
        self.filters * self.pooled_width * self.pooled_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_sizes_for_default_architecture() {
        let dims = NetworkConfig::new(16, 16, 4, 3, 2).dimensions().unwrap();
        assert_eq!((dims.out1_width, dims.out1_height), (14, 14));
        assert_eq!((dims.out2_width, dims.out2_height), (12, 12));
        assert_eq!((dims.pooled_width, dims.pooled_height), (6, 6));
        assert_eq!(dims.flattened(), 144);
    }

    #[test]
    fn pooling_truncates_remainder() {
        let dims = NetworkConfig::new(15, 13, 2, 3, 2).dimensions().unwrap();
        assert_eq!((dims.out2_width, dims.out2_height), (11, 9));
        assert_eq!((dims.pooled_width, dims.pooled_height), (5, 4));
    }

    #[test]
    fn rejects_degenerate_architectures() {
        assert!(NetworkConfig::new(16, 16, 0, 3, 2).dimensions().is_err());
        assert!(NetworkConfig::new(4, 4, 1, 3, 1).dimensions().is_err());
        assert!(NetworkConfig::new(4, 4, 1, 2, 3).dimensions().is_err());
        assert!(
            NetworkConfig::new(16, 16, 4, 3, 2)
                .with_hidden_size(0)
                .dimensions()
                .is_err()
        );
    }
}
