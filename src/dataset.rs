use crate::error::{CnnError, Result};
use crate::image::Image;
use itertools::Itertools;
use std::{fs, io, path::Path};
use tracing::{debug, info};

/// The binary class of a sample. The discriminant is the training target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Dog = 0,
    Cat = 1,
}

impl Label {
    pub fn target(self) -> f64 {
        f64::from(self as u8)
    }

    /// The class a probability votes for, with `p > 0.5` meaning cat.
    pub fn from_probability(probability: f64) -> Label {
        if probability > 0.5 { Label::Cat } else { Label::Dog }
    }

    // Files are labelled by name: anything mentioning "cat" is a cat.
    fn from_file_name(name: &str) -> Label {
        if name.to_lowercase().contains("cat") {
            Label::Cat
        } else {
            Label::Dog
        }
    }
}

/// A single image and its correct label.
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: Image,
    pub label: Label,
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub samples: Vec<Sample>,
}

impl Dataset {
    /// `size` synthetic samples, the first half cats and the rest dogs.
    pub fn synthetic(width: usize, height: usize, size: usize) -> Dataset {
        let mut dataset = Dataset::default();
        dataset.pad_with_synthetic(width, height, size);
        dataset
    }

    // Builds a dataset from a directory of PGM images or from a single image. A directory
    // contributes up to `size` of its non-hidden files, visited in name order; files that fail to
    // decode are skipped, and at least one must load. A single file becomes one dog sample. Either
    // way the dataset is then padded with synthetic samples up to `size`. Asking for no samples
    // at all gives an empty dataset without touching the path.
    pub fn from_path(
        path: impl AsRef<Path>,
        width: usize,
        height: usize,
        size: usize,
    ) -> Result<Dataset> {
        let path = path.as_ref();
        let mut dataset = Dataset::default();
        if size == 0 {
            return Ok(dataset);
        }

        if path.is_dir() {
            let entries = fs::read_dir(path)?
                .map(|entry| entry.map(|entry| entry.path()))
                .collect::<io::Result<Vec<_>>>()?;

            for file in entries.into_iter().sorted() {
                if dataset.len() == size {
                    break;
                }
                let Some(name) = file.file_name().and_then(|name| name.to_str()) else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                match Image::load(&file, width, height) {
                    Ok(image) => dataset.samples.push(Sample {
                        image,
                        label: Label::from_file_name(name),
                    }),
                    Err(err) => debug!(path = %file.display(), %err, "skipping unreadable image"),
                }
            }

            if dataset.is_empty() {
                return Err(CnnError::EmptyDataset(path.to_path_buf()));
            }
            info!(loaded = dataset.len(), "loaded images from {}", path.display());
        } else {
            let image = Image::load(path, width, height)?;
            dataset.samples.push(Sample {
                image,
                label: Label::Dog,
            });
        }

        dataset.pad_with_synthetic(width, height, size);
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    // Index `i` of the padded dataset is a cat iff it falls in the first half.
    fn pad_with_synthetic(&mut self, width: usize, height: usize, size: usize) {
        for i in self.len()..size {
            let label = if i < size / 2 { Label::Cat } else { Label::Dog };
            self.samples.push(Sample {
                image: Image::synthetic(width, height, label),
                label,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(dataset: &Dataset) -> Vec<Label> {
        dataset.samples.iter().map(|sample| sample.label).collect()
    }

    #[test]
    fn synthetic_dataset_is_half_cats() {
        let dataset = Dataset::synthetic(8, 8, 4);
        assert_eq!(labels(&dataset), vec![Label::Cat, Label::Cat, Label::Dog, Label::Dog]);
        assert_eq!(dataset.samples[0].image, Image::synthetic(8, 8, Label::Cat));
    }

    #[test]
    fn directory_scan_labels_by_name_and_pads() {
        let dir = tempfile::tempdir().unwrap();
        let pgm = b"P2 2 2 1\n0 1 1 0\n";
        fs::write(dir.path().join("Cat1.pgm"), pgm).unwrap();
        fs::write(dir.path().join("dog2.pgm"), pgm).unwrap();
        fs::write(dir.path().join(".hidden_cat.pgm"), pgm).unwrap();
        fs::write(dir.path().join("notes.txt"), b"not an image").unwrap();

        let dataset = Dataset::from_path(dir.path(), 4, 4, 6).unwrap();
        assert_eq!(
            labels(&dataset),
            vec![Label::Cat, Label::Dog, Label::Cat, Label::Dog, Label::Dog, Label::Dog]
        );
        assert_eq!(dataset.samples[0].image.width(), 4);
        assert_eq!(dataset.samples[2].image, Image::synthetic(4, 4, Label::Cat));
    }

    #[test]
    fn directory_without_images_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("readme.md"), b"# nothing here").unwrap();
        let err = Dataset::from_path(dir.path(), 4, 4, 10).unwrap_err();
        assert!(matches!(err, CnnError::EmptyDataset(_)));
    }

    #[test]
    fn single_file_is_one_dog_then_synthetic() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cat.pgm");
        fs::write(&file, b"P2 2 2 1\n1 0 0 1\n").unwrap();
        let dataset = Dataset::from_path(&file, 4, 4, 4).unwrap();
        assert_eq!(labels(&dataset), vec![Label::Dog, Label::Cat, Label::Dog, Label::Dog]);
    }

    #[test]
    fn zero_size_is_an_empty_dataset() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cat.pgm"), b"P2 2 2 1\n1 0 0 1\n").unwrap();
        let dataset = Dataset::from_path(dir.path(), 4, 4, 0).unwrap();
        assert!(dataset.is_empty());
    }

    #[test]
    fn probability_threshold_is_strict() {
        assert_eq!(Label::from_probability(0.5), Label::Dog);
        assert_eq!(Label::from_probability(0.51), Label::Cat);
        assert_eq!(Label::Cat.target(), 1.0);
    }
}
