use crate::dataset::Label;
use crate::error::{CnnError, Result};
use flate2::read::GzDecoder;
use itertools::Itertools;
use ndarray::{Array2, ArrayView2};
use std::{fs::File, io::Read, path::Path};

/// A single-channel image stored as a `[row, column]` array of floats.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pixels: Array2<f64>,
}

impl Image {
    /// A black image.
    pub fn new(width: usize, height: usize) -> Image {
        Image {
            pixels: Array2::zeros((height, width)),
        }
    }

    pub fn from_pixels(pixels: Array2<f64>) -> Image {
        Image { pixels }
    }

    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }

    pub fn pixels(&self) -> ArrayView2<'_, f64> {
        self.pixels.view()
    }

    /// Generates the toy pattern for a label: a bright disc with a soft rim for
    /// cats, diagonal stripes three pixels wide for dogs. Values are in [0, 1].
    pub fn synthetic(width: usize, height: usize, label: Label) -> Image {
        let cx = width as f64 / 2.0;
        let cy = height as f64 / 2.0;
        let radius = width.min(height) as f64 * 0.28;

        let pixels = Array2::from_shape_fn((height, width), |(y, x)| match label {
            Label::Cat => {
                let d = (x as f64 - cx).hypot(y as f64 - cy);
                if d > radius - 1.5 && d < radius + 1.5 {
                    0.6
                } else if d < radius {
                    1.0
                } else {
                    0.0
                }
            }
            Label::Dog => ((x + y) / 3 % 2) as f64,
        });
        Image { pixels }
    }

    /// Loads a PGM file (binary P5 or ASCII P2, optionally gzip-compressed when
    /// the name ends in `.gz`), resizes it to `width x height` with
    /// nearest-neighbour sampling and standardizes it.
    pub fn load(path: impl AsRef<Path>, width: usize, height: usize) -> Result<Image> {
        let path = path.as_ref();
        let bytes = read_bytes(path)?;
        let image = decode_pgm(&bytes).map_err(|reason| CnnError::Image {
            path: path.to_path_buf(),
            reason,
        })?;

        let mut image = if image.width() == width && image.height() == height {
            image
        } else {
            image.resize_nearest(width, height)
        };
        image.standardize();
        Ok(image)
    }

    pub fn resize_nearest(&self, width: usize, height: usize) -> Image {
        let (src_height, src_width) = self.pixels.dim();
        let pixels = Array2::from_shape_fn((height, width), |(y, x)| {
            self.pixels[[y * src_height / height, x * src_width / width]]
        });
        Image { pixels }
    }

    /// Shifts and scales the pixels to zero mean and (nearly) unit variance.
    pub fn standardize(&mut self) {
        let n = self.pixels.len();
        if n == 0 {
            return;
        }
        let mean = self.pixels.sum() / n as f64;
        let mean_square = self.pixels.iter().map(|v| v * v).sum::<f64>() / n as f64;
        let std = (mean_square - mean * mean + 1e-6).sqrt();
        self.pixels.mapv_inplace(|v| (v - mean) / std);
    }
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    if path.extension().is_some_and(|ext| ext == "gz") {
        GzDecoder::new(file).read_to_end(&mut bytes)?;
    } else {
        file.read_to_end(&mut bytes)?;
    }
    Ok(bytes)
}

// Walks the whitespace-separated PGM header, skipping `#` comments.
struct HeaderCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> HeaderCursor<'a> {
    fn token(&mut self) -> Option<&'a str> {
        loop {
            match *self.bytes.get(self.pos)? {
                b if b.is_ascii_whitespace() => self.pos += 1,
                b'#' => {
                    while self.bytes.get(self.pos).is_some_and(|&b| b != b'\n') {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        let start = self.pos;
        while self.bytes.get(self.pos).is_some_and(|b| !b.is_ascii_whitespace()) {
            self.pos += 1;
        }
        std::str::from_utf8(&self.bytes[start..self.pos]).ok()
    }

    fn number(&mut self, field: &str) -> std::result::Result<usize, String> {
        self.token()
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| format!("missing or malformed {field}"))
    }
}

fn decode_pgm(bytes: &[u8]) -> std::result::Result<Image, String> {
    let mut header = HeaderCursor { bytes, pos: 0 };
    let binary = match header.token() {
        Some("P5") => true,
        Some("P2") => false,
        other => return Err(format!("unsupported magic {other:?}, expected P5 or P2")),
    };
    let width = header.number("width")?;
    let height = header.number("height")?;
    let max_value = header.number("maximum value")?;
    if width == 0 || height == 0 || max_value == 0 {
        return Err(format!("degenerate header {width}x{height} max {max_value}"));
    }

    let count = width
        .checked_mul(height)
        .ok_or_else(|| format!("{width}x{height} image is too large"))?;
    let scale = max_value as f64;
    let values: Vec<f64> = if binary {
        // Exactly one whitespace byte separates the header from the raster.
        let raster = bytes.get(header.pos + 1..).unwrap_or_default();
        let sample_len = if max_value < 256 { 1 } else { 2 };
        if count.checked_mul(sample_len).is_none_or(|needed| raster.len() < needed) {
            return Err(format!(
                "raster holds {} bytes, {width}x{height} needs {sample_len} per pixel",
                raster.len()
            ));
        }
        if sample_len == 1 {
            raster.iter().take(count).map(|&b| f64::from(b) / scale).collect()
        } else {
            raster
                .chunks_exact(2)
                .take(count)
                .map(|pair| f64::from(u16::from_be_bytes([pair[0], pair[1]])) / scale)
                .collect()
        }
    } else {
        // Every ASCII sample takes at least one byte, so a header claiming more
        // pixels than the file has bytes cannot be honest. Within that bound a
        // short raster reads as black.
        let remaining = bytes.len() - header.pos;
        if count > remaining {
            return Err(format!(
                "{width}x{height} image cannot fit in {remaining} bytes of samples"
            ));
        }
        std::iter::from_fn(|| header.token())
            .map(|token| token.parse::<u32>().map_or(0.0, |v| f64::from(v) / scale))
            .pad_using(count, |_| 0.0)
            .take(count)
            .collect()
    };

    Array2::from_shape_vec((height, width), values)
        .map(Image::from_pixels)
        .map_err(|err| err.to_string())
}
