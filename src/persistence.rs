//! The model file: four little-endian `i32` header fields (input width, input
//! height, filter count, kernel size) followed by every parameter as a
//! little-endian `f32`, in [`NetworkParameters`] field order. There is no magic
//! number, version or checksum; the header is the only compatibility check.

use crate::config::Dimensions;
use crate::error::{CnnError, Result};
use crate::network::{Network, NetworkParameters};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};
use tracing::info;

const HEADER_LEN: usize = 4 * size_of::<i32>();
const VALUE_LEN: usize = size_of::<f32>();

impl Network {
    /// Writes the parameters to `path`, replacing any existing file.
    ///
    /// Values are narrowed to `f32` on the way out.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let header = header(self.dimensions())?;

        let mut writer = BufWriter::new(File::create(path)?);
        for field in header {
            writer.write_all(&field.to_le_bytes())?;
        }
        for value in self.parameters().values() {
            writer.write_all(&(value as f32).to_le_bytes())?;
        }
        writer.flush()?;

        info!(path = %path.display(), "saved model");
        Ok(())
    }

    /// Replaces the parameters with those stored in `path`.
    ///
    /// The file must have been saved by a network with the same input size,
    /// filter count and kernel size, and must contain exactly the parameters
    /// this network holds. On any error the network is left unchanged.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let params = decode(&bytes, self.dimensions())?;
        *self.parameters_mut() = params;

        info!(path = %path.display(), "loaded model");
        Ok(())
    }
}

fn header(dims: &Dimensions) -> Result<[i32; 4]> {
    let field = |value: usize| i32::try_from(value).map_err(|_| CnnError::DimensionOverflow(value));
    Ok([
        field(dims.input_width)?,
        field(dims.input_height)?,
        field(dims.filters)?,
        field(dims.kernel_size)?,
    ])
}

// Name and scalar count of each stored array, in file order.
fn sections(dims: &Dimensions) -> [(&'static str, usize); 8] {
    let kernel = dims.filters * dims.kernel_size * dims.kernel_size;
    [
        ("kernels1", kernel),
        ("bias1", dims.filters),
        ("kernels2", kernel),
        ("bias2", dims.filters),
        ("dense1_weights", dims.hidden_size * dims.flattened()),
        ("dense1_bias", dims.hidden_size),
        ("dense2_weights", dims.hidden_size),
        ("dense2_bias", 1),
    ]
}

fn decode(bytes: &[u8], dims: &Dimensions) -> Result<NetworkParameters> {
    let (header_bytes, body) = bytes
        .split_at_checked(HEADER_LEN)
        .ok_or(CnnError::Truncated { section: "header" })?;

    let expected = header(dims)?;
    let mut found = [0i32; 4];
    for (field, chunk) in found.iter_mut().zip(header_bytes.chunks_exact(4)) {
        *field = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    if found != expected {
        return Err(CnnError::HeaderMismatch { expected, found });
    }

    let available = body.len() / VALUE_LEN;
    let mut end = 0;
    for (section, count) in sections(dims) {
        end += count;
        if available < end {
            return Err(CnnError::Truncated { section });
        }
    }
    let trailing = body.len() - end * VALUE_LEN;
    if trailing > 0 {
        return Err(CnnError::TrailingBytes(trailing));
    }

    let mut params = NetworkParameters::zeros(dims);
    let values = body
        .chunks_exact(VALUE_LEN)
        .map(|chunk| f64::from(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])));
    for (slot, value) in params.values_mut().zip(values) {
        *slot = value;
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;

    fn dims() -> Dimensions {
        NetworkConfig::new(6, 6, 2, 2, 2).with_hidden_size(3).dimensions().unwrap()
    }

    fn encoded(dims: &Dimensions, header: [i32; 4]) -> Vec<u8> {
        let count: usize = sections(dims).iter().map(|(_, count)| count).sum();
        let mut bytes: Vec<u8> = header.iter().flat_map(|field| field.to_le_bytes()).collect();
        bytes.extend((0..count).flat_map(|i| (i as f32 * 0.5).to_le_bytes()));
        bytes
    }

    #[test]
    fn sections_cover_every_parameter() {
        let dims = dims();
        let count: usize = sections(&dims).iter().map(|(_, count)| count).sum();
        assert_eq!(count, NetworkParameters::zeros(&dims).count());
    }

    #[test]
    fn decodes_values_in_field_order() {
        let dims = dims();
        let params = decode(&encoded(&dims, [6, 6, 2, 2]), &dims).unwrap();
        assert_eq!(params.kernels1[[0, 0, 0]], 0.0);
        assert_eq!(params.kernels1[[1, 1, 1]], 3.5);
        assert_eq!(params.bias1[0], 4.0);
        assert_eq!(params.kernels2[[0, 0, 0]], 5.0);
        // 8 + 2 + 8 + 2 values precede dense1_weights.
        assert_eq!(params.dense1_weights[[0, 0]], 10.0);
        assert_eq!(params.dense2_bias, (params.count() - 1) as f64 * 0.5);
    }

    #[test]
    fn rejects_header_mismatch() {
        let dims = dims();
        let err = decode(&encoded(&dims, [6, 6, 3, 2]), &dims).unwrap_err();
        assert!(matches!(
            err,
            CnnError::HeaderMismatch {
                found: [6, 6, 3, 2],
                ..
            }
        ));
    }

    #[test]
    fn reports_the_truncated_section() {
        let dims = dims();
        let bytes = encoded(&dims, [6, 6, 2, 2]);
        assert!(matches!(
            decode(&bytes[..HEADER_LEN + 9 * VALUE_LEN], &dims),
            Err(CnnError::Truncated { section: "bias1" })
        ));
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1], &dims),
            Err(CnnError::Truncated { section: "dense2_bias" })
        ));
        assert!(matches!(
            decode(&bytes[..10], &dims),
            Err(CnnError::Truncated { section: "header" })
        ));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let dims = dims();
        let mut bytes = encoded(&dims, [6, 6, 2, 2]);
        bytes.extend([0, 0, 0, 0, 0]);
        assert!(matches!(decode(&bytes, &dims), Err(CnnError::TrailingBytes(5))));
    }
}
