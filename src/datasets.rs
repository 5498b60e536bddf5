//! Loads image classification datasets into memory
//!
//! MNIST and Fashion-MNIST are read from IDX files (plain or gzipped) in a local
//! directory. A small synthetic dataset of the same geometry is generated for
//! offline runs.

use std::{
    fmt::{self, Display},
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use flate2::read::GzDecoder;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::dataloader::{DataLoaderError, ImageDataset};

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("'{path}' has magic number {got:#010x}, expected {expected:#010x}")]
    BadMagic {
        path: PathBuf,
        expected: u32,
        got: u32,
    },
    #[error("'{path}' is truncated: expected {expected} bytes, found {got}")]
    Truncated {
        path: PathBuf,
        expected: usize,
        got: usize,
    },
    #[error("'{path}' declares dimensions {dims:?} too large to address")]
    BadHeader { path: PathBuf, dims: Vec<usize> },
    #[error("{images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },
    #[error(transparent)]
    DataLoader(#[from] DataLoaderError),
}

/// Toggles between dataset types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Mnist,
    FashionMnist,
    Synthetic,
}

impl Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Mnist => write!(f, "mnist"),
            Dataset::FashionMnist => write!(f, "fashion-mnist"),
            Dataset::Synthetic => write!(f, "synthetic"),
        }
    }
}

impl Dataset {
    /// Where the IDX files are looked up when no directory is given
    pub fn default_dir(&self) -> PathBuf {
        match self {
            Dataset::Mnist => PathBuf::from("data/mnist"),
            Dataset::FashionMnist => PathBuf::from("data/fashion_mnist"),
            Dataset::Synthetic => PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn file_prefix(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "t10k",
        }
    }

    fn synthetic_len(&self) -> usize {
        match self {
            Split::Train => 2048,
            Split::Test => 512,
        }
    }
}

/// Loads the train and test splits
pub fn get_datasets(
    dataset: Dataset,
    data_dir: &Path,
) -> Result<(ImageDataset, ImageDataset), DatasetError> {
    let train = load_split(dataset, data_dir, Split::Train)?;
    let test = load_split(dataset, data_dir, Split::Test)?;
    log::info!(
        "Loaded {}: {} train / {} test images of shape {:?}",
        dataset,
        train.len(),
        test.len(),
        train.image_shape()
    );
    Ok((train, test))
}

/// Loads one split with pixels scaled to `[0, 1]`
pub fn load_split(
    dataset: Dataset,
    data_dir: &Path,
    split: Split,
) -> Result<ImageDataset, DatasetError> {
    match dataset {
        Dataset::Mnist | Dataset::FashionMnist => {
            let prefix = split.file_prefix();
            let images_path = data_dir.join(format!("{prefix}-images-idx3-ubyte"));
            let labels_path = data_dir.join(format!("{prefix}-labels-idx1-ubyte"));
            let (rows, cols, pixels) = parse_idx_images(&read_idx_file(&images_path)?, &images_path)?;
            let labels = parse_idx_labels(&read_idx_file(&labels_path)?, &labels_path)?;
            let n_images = pixels.len() / (rows * cols).max(1);
            if n_images != labels.len() {
                return Err(DatasetError::CountMismatch {
                    images: n_images,
                    labels: labels.len(),
                });
            }
            let images = pixels.iter().map(|&p| p as f32 / 255.0).collect();
            Ok(ImageDataset::new(images, labels, [rows, cols, 1], 10)?)
        }
        Dataset::Synthetic => {
            let seed = match split {
                Split::Train => 0,
                Split::Test => 1,
            };
            Ok(synthetic(split.synthetic_len(), seed)?)
        }
    }
}

/// Reads `path`, falling back to `path.gz` decompressed on the fly
fn read_idx_file(path: &Path) -> Result<Vec<u8>, DatasetError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| DatasetError::Io { path, source }
    };
    let mut bytes = vec![];
    if path.exists() {
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(io_err(path))?;
    } else {
        let gz_path = PathBuf::from(format!("{}.gz", path.display()));
        let file = File::open(&gz_path).map_err(io_err(&gz_path))?;
        GzDecoder::new(file)
            .read_to_end(&mut bytes)
            .map_err(io_err(&gz_path))?;
    }
    Ok(bytes)
}

fn read_be_u32(bytes: &[u8], index: usize, path: &Path) -> Result<u32, DatasetError> {
    let start = index * 4;
    let word = bytes
        .get(start..start + 4)
        .ok_or_else(|| DatasetError::Truncated {
            path: path.to_path_buf(),
            expected: start + 4,
            got: bytes.len(),
        })?;
    Ok(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

fn check_magic(bytes: &[u8], expected: u32, path: &Path) -> Result<(), DatasetError> {
    let got = read_be_u32(bytes, 0, path)?;
    if got != expected {
        return Err(DatasetError::BadMagic {
            path: path.to_path_buf(),
            expected,
            got,
        });
    }
    Ok(())
}

fn payload<'a>(
    bytes: &'a [u8],
    header_len: usize,
    len: usize,
    path: &Path,
) -> Result<&'a [u8], DatasetError> {
    let end = header_len
        .checked_add(len)
        .ok_or_else(|| DatasetError::BadHeader {
            path: path.to_path_buf(),
            dims: vec![len],
        })?;
    bytes
        .get(header_len..end)
        .ok_or_else(|| DatasetError::Truncated {
            path: path.to_path_buf(),
            expected: end,
            got: bytes.len(),
        })
}

/// Parses an IDX3 image file: magic, count, rows, cols, then one byte per pixel
pub fn parse_idx_images(bytes: &[u8], path: &Path) -> Result<(usize, usize, Vec<u8>), DatasetError> {
    check_magic(bytes, IMAGES_MAGIC, path)?;
    let count = read_be_u32(bytes, 1, path)? as usize;
    let rows = read_be_u32(bytes, 2, path)? as usize;
    let cols = read_be_u32(bytes, 3, path)? as usize;
    let len = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .ok_or_else(|| DatasetError::BadHeader {
            path: path.to_path_buf(),
            dims: vec![count, rows, cols],
        })?;
    let pixels = payload(bytes, 16, len, path)?;
    Ok((rows, cols, pixels.to_vec()))
}

/// Parses an IDX1 label file: magic, count, then one byte per label
pub fn parse_idx_labels(bytes: &[u8], path: &Path) -> Result<Vec<u8>, DatasetError> {
    check_magic(bytes, LABELS_MAGIC, path)?;
    let count = read_be_u32(bytes, 1, path)? as usize;
    Ok(payload(bytes, 8, count, path)?.to_vec())
}

/// Generates `n` noisy 28x28 single channel images, class `k` shows a bright
/// 6x6 square at its own cell of a 4x3 grid
pub fn synthetic(n: usize, seed: u64) -> Result<ImageDataset, DataLoaderError> {
    const SIDE: usize = 28;
    const SQUARE: usize = 6;
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let mut images = Vec::with_capacity(n * SIDE * SIDE);
    let mut labels = Vec::with_capacity(n);

    for _ in 0..n {
        let label = rng.random_range(0..10u8);
        let (top, left) = (1 + (label as usize / 4) * 9, 1 + (label as usize % 4) * 7);
        for row in 0..SIDE {
            for col in 0..SIDE {
                let inside = (top..top + SQUARE).contains(&row) && (left..left + SQUARE).contains(&col);
                let noise = rng.random_range(0.0..0.2f32);
                images.push(if inside { 1.0 - noise } else { noise });
            }
        }
        labels.push(label);
    }

    ImageDataset::new(images, labels, [SIDE, SIDE, 1], 10)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{Compression, write::GzEncoder};

    use super::*;

    fn idx_images(count: u32, rows: u32, cols: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = vec![];
        for word in [IMAGES_MAGIC, count, rows, cols] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes.extend_from_slice(pixels);
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = vec![];
        bytes.extend_from_slice(&LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cnn-rs-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_parse_idx() {
        let path = Path::new("images");
        let (rows, cols, pixels) =
            parse_idx_images(&idx_images(2, 2, 2, &[0, 1, 2, 3, 4, 5, 6, 7]), path).unwrap();
        assert_eq!((rows, cols), (2, 2));
        assert_eq!(pixels, vec![0, 1, 2, 3, 4, 5, 6, 7]);

        let labels = parse_idx_labels(&idx_labels(&[3, 1]), Path::new("labels")).unwrap();
        assert_eq!(labels, vec![3, 1]);
    }

    #[test]
    fn test_parse_idx_errors() {
        let path = Path::new("images");
        assert!(matches!(
            parse_idx_images(&idx_labels(&[1]), path),
            Err(DatasetError::BadMagic {
                expected: IMAGES_MAGIC,
                got: LABELS_MAGIC,
                ..
            })
        ));
        assert!(matches!(
            parse_idx_images(&idx_images(2, 2, 2, &[0; 7]), path),
            Err(DatasetError::Truncated {
                expected: 24,
                got: 23,
                ..
            })
        ));
        assert!(matches!(
            parse_idx_labels(&[0, 0], path),
            Err(DatasetError::Truncated { .. })
        ));
    }

    #[test]
    fn test_parse_idx_oversized_header() {
        let path = Path::new("images");
        let max = u32::MAX as usize;
        match parse_idx_images(&idx_images(u32::MAX, u32::MAX, u32::MAX, &[]), path) {
            Err(DatasetError::BadHeader { dims, .. }) => assert_eq!(dims, vec![max, max, max]),
            other => panic!("expected a header error, got {other:?}"),
        }

        // a size that fits but exceeds the bytes on disk is a truncation
        assert!(matches!(
            parse_idx_images(&idx_images(1, 1 << 16, 1 << 15, &[]), path),
            Err(DatasetError::Truncated { got: 16, .. })
        ));
    }

    #[test]
    fn test_load_split_plain_and_gzip() {
        let dir = temp_dir("idx");
        std::fs::write(
            dir.join("train-images-idx3-ubyte"),
            idx_images(2, 1, 2, &[0, 255, 51, 102]),
        )
        .unwrap();
        let mut gz = GzEncoder::new(
            File::create(dir.join("train-labels-idx1-ubyte.gz")).unwrap(),
            Compression::default(),
        );
        gz.write_all(&idx_labels(&[7, 2])).unwrap();
        gz.finish().unwrap();

        let ds = load_split(Dataset::Mnist, &dir, Split::Train).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.image_shape(), [1, 2, 1]);
        assert_eq!(ds.labels(), &[7, 2]);
        let batch = ds.batch(&[0, 1]);
        assert_eq!(batch.images.data(), &[0.0, 1.0, 0.2, 0.4]);

        // the test split is missing entirely
        assert!(matches!(
            load_split(Dataset::Mnist, &dir, Split::Test),
            Err(DatasetError::Io { .. })
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_split_count_mismatch() {
        let dir = temp_dir("mismatch");
        std::fs::write(dir.join("t10k-images-idx3-ubyte"), idx_images(1, 1, 1, &[9])).unwrap();
        std::fs::write(dir.join("t10k-labels-idx1-ubyte"), idx_labels(&[1, 2])).unwrap();
        assert!(matches!(
            load_split(Dataset::FashionMnist, &dir, Split::Test),
            Err(DatasetError::CountMismatch {
                images: 1,
                labels: 2
            })
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_synthetic() {
        let ds = synthetic(64, 3).unwrap();
        assert_eq!(ds.len(), 64);
        assert_eq!(ds.image_shape(), [28, 28, 1]);
        assert!(ds.labels().iter().all(|&l| l < 10));
        assert_eq!(ds, synthetic(64, 3).unwrap());

        // the brightest pixels of an image sit inside its class square
        let batch = ds.batch(&[0]);
        let label = ds.labels()[0] as usize;
        let (top, left) = (1 + (label / 4) * 9, 1 + (label % 4) * 7);
        assert!(batch.images.data()[(top + 2) * 28 + left + 2] > 0.8);
        assert!(batch.images.data()[0] < 0.2);
    }
}
