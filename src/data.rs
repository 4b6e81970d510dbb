//! CIFAR-10 data supply.
//!
//! Handles downloading and caching the upstream binary archive, parsing the
//! record format (1 label byte followed by 3,072 CHW pixel bytes), per-image
//! augmentation for the training split, per-channel normalization, and a
//! batched [`DataLoader`] with optional worker-thread prefetching.
//!
//! The loader preserves consumption order regardless of worker count:
//! workers claim batch indices from a shared counter and park finished
//! batches in a sequence-keyed buffer, and the consumer drains that buffer
//! in index order. Prefetching is a throughput optimization with no
//! observable ordering effect.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use candle_core::{Device, Tensor};
use flate2::read::GzDecoder;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::{Result, TrainError};
use crate::model::NUM_CLASSES;

/// Per-channel means of the CIFAR-10 training split.
pub const CIFAR_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
/// Per-channel standard deviations of the CIFAR-10 training split.
pub const CIFAR_STD: [f32; 3] = [0.2023, 0.1994, 0.2010];

/// Image side length in pixels.
pub const IMAGE_SIDE: usize = 32;
/// Color channels per image.
pub const IMAGE_CHANNELS: usize = 3;
/// Pixel bytes per image.
pub const IMAGE_BYTES: usize = IMAGE_CHANNELS * IMAGE_SIDE * IMAGE_SIDE;
/// Bytes per record in the binary format (label + pixels).
const RECORD_BYTES: usize = 1 + IMAGE_BYTES;

/// Zero-padding applied on each side before the random crop.
const CROP_PADDING: usize = 4;

const ARCHIVE_URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";
const BATCHES_DIR: &str = "cifar-10-batches-bin";
const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILE: &str = "test_batch.bin";

/// An in-memory CIFAR-10 split: raw pixel bytes plus integer labels.
pub struct CifarDataset {
    images: Vec<u8>,
    labels: Vec<u8>,
}

impl CifarDataset {
    /// Build a dataset from raw CHW pixel bytes and labels.
    ///
    /// # Errors
    ///
    /// Returns a `Data` error when the buffer lengths disagree or a label
    /// is out of range.
    pub fn from_raw(images: Vec<u8>, labels: Vec<u8>) -> Result<Self> {
        if images.len() != labels.len() * IMAGE_BYTES {
            return Err(TrainError::Data(format!(
                "pixel buffer holds {} bytes for {} labels",
                images.len(),
                labels.len()
            )));
        }
        if let Some(bad) = labels.iter().find(|&&l| l as usize >= NUM_CLASSES) {
            return Err(TrainError::Data(format!("label {bad} out of range")));
        }
        Ok(Self { images, labels })
    }

    /// Parse one or more files in the CIFAR-10 binary record format.
    fn from_bin_files(paths: &[PathBuf]) -> Result<Self> {
        let mut images = Vec::new();
        let mut labels = Vec::new();
        for path in paths {
            let bytes = std::fs::read(path).map_err(|e| {
                TrainError::Data(format!("failed to read {}: {e}", path.display()))
            })?;
            if bytes.is_empty() || bytes.len() % RECORD_BYTES != 0 {
                return Err(TrainError::Data(format!(
                    "{} is not a multiple of the {RECORD_BYTES}-byte record size",
                    path.display()
                )));
            }
            for record in bytes.chunks_exact(RECORD_BYTES) {
                labels.push(record[0]);
                images.extend_from_slice(&record[1..]);
            }
        }
        Self::from_raw(images, labels)
    }

    /// Number of examples in the split.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the split is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn image(&self, idx: usize) -> &[u8] {
        &self.images[idx * IMAGE_BYTES..(idx + 1) * IMAGE_BYTES]
    }

    fn label(&self, idx: usize) -> u8 {
        self.labels[idx]
    }
}

/// Both CIFAR-10 splits, downloaded and parsed.
pub struct CifarData {
    /// Training split, 50,000 examples.
    pub train: Arc<CifarDataset>,
    /// Validation split, 10,000 examples.
    pub val: Arc<CifarDataset>,
}

impl CifarData {
    /// Load both splits from `root`, downloading the archive first if the
    /// binary files are not already cached there.
    ///
    /// # Errors
    ///
    /// Returns a `Data` or download error when the cache directory is
    /// unwritable, the download fails, or the files are malformed. Nothing
    /// is retried.
    pub fn load(root: &Path) -> Result<Self> {
        let dir = ensure_dataset(root)?;
        let train_paths: Vec<PathBuf> = TRAIN_FILES.iter().map(|f| dir.join(f)).collect();
        let train = CifarDataset::from_bin_files(&train_paths)?;
        let val = CifarDataset::from_bin_files(&[dir.join(TEST_FILE)])?;
        tracing::info!(
            "loaded CIFAR-10: {} train / {} val examples",
            train.len(),
            val.len()
        );
        Ok(Self {
            train: Arc::new(train),
            val: Arc::new(val),
        })
    }
}

fn dataset_complete(dir: &Path) -> bool {
    TRAIN_FILES.iter().all(|f| dir.join(f).exists()) && dir.join(TEST_FILE).exists()
}

fn ensure_dataset(root: &Path) -> Result<PathBuf> {
    let dir = root.join(BATCHES_DIR);
    if dataset_complete(&dir) {
        return Ok(dir);
    }

    std::fs::create_dir_all(root).map_err(|e| {
        TrainError::Data(format!(
            "cannot create data directory {}: {e}",
            root.display()
        ))
    })?;

    tracing::info!("downloading CIFAR-10 from {ARCHIVE_URL}");
    let response = reqwest::blocking::get(ARCHIVE_URL)?.error_for_status()?;
    let bytes = response.bytes()?;
    tracing::info!("unpacking {} bytes into {}", bytes.len(), root.display());
    let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_ref()));
    archive.unpack(root)?;

    if !dataset_complete(&dir) {
        return Err(TrainError::Data(format!(
            "archive did not produce the expected files under {}",
            dir.display()
        )));
    }
    Ok(dir)
}

/// Apply the training augmentation: 4-pixel zero-padded random crop, then a
/// coin-flip horizontal flip. Out-of-range source coordinates read as zero,
/// matching a crop from the zero-padded canvas.
fn augment_image(src: &[u8], rng: &mut StdRng) -> Vec<u8> {
    let side = IMAGE_SIDE as isize;
    let pad = CROP_PADDING as isize;
    let oy = rng.gen_range(0..=2 * CROP_PADDING) as isize;
    let ox = rng.gen_range(0..=2 * CROP_PADDING) as isize;
    let flip = rng.gen_bool(0.5);

    let mut out = vec![0u8; src.len()];
    let plane = IMAGE_SIDE * IMAGE_SIDE;
    for c in 0..IMAGE_CHANNELS {
        let src_plane = &src[c * plane..(c + 1) * plane];
        let out_plane = &mut out[c * plane..(c + 1) * plane];
        for y in 0..side {
            let sy = y + oy - pad;
            if !(0..side).contains(&sy) {
                continue;
            }
            for x in 0..side {
                let cx = if flip { side - 1 - x } else { x };
                let sx = cx + ox - pad;
                if !(0..side).contains(&sx) {
                    continue;
                }
                out_plane[(y * side + x) as usize] = src_plane[(sy * side + sx) as usize];
            }
        }
    }
    out
}

/// Scale pixels to `[0, 1]` and normalize by the fixed per-channel stats.
fn normalize_into(image: &[u8], out: &mut Vec<f32>) {
    let plane = IMAGE_SIDE * IMAGE_SIDE;
    for (c, channel) in image.chunks_exact(plane).enumerate() {
        let mean = CIFAR_MEAN[c];
        let std = CIFAR_STD[c];
        for &p in channel {
            out.push((f32::from(p) / 255.0 - mean) / std);
        }
    }
}

/// One batch of normalized images and integer labels.
pub struct Batch {
    /// `(n, 3, 32, 32)` f32 tensor.
    pub images: Tensor,
    /// `(n,)` u32 tensor.
    pub labels: Tensor,
}

impl Batch {
    /// Number of examples in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loader behavior for one pass over a split.
#[derive(Clone)]
pub struct LoaderOptions {
    /// Examples per batch; the final batch may be smaller.
    pub batch_size: usize,
    /// Worker threads. 0 prepares batches inline on the consumer.
    pub num_workers: usize,
    /// Apply the training augmentation per image.
    pub augment: bool,
    /// Shuffle the traversal order with this seed; `None` keeps dataset
    /// order (validation).
    pub shuffle_seed: Option<u64>,
    /// Device batches are created on.
    pub device: Device,
}

/// Batches prefetched per worker before production pauses.
const PREFETCH_FACTOR: usize = 2;

struct LoaderState {
    dataset: Arc<CifarDataset>,
    order: Vec<usize>,
    opts: LoaderOptions,
    num_batches: usize,
    rng_seed: u64,
    next_job: AtomicUsize,
    buffer: Mutex<BTreeMap<usize, Result<Batch>>>,
    stop: AtomicBool,
}

/// Finite iterator of batches over one split, one full traversal.
///
/// Rebuilt every epoch: the training loader reshuffles and re-randomizes
/// augmentation on each construction.
pub struct DataLoader {
    state: Arc<LoaderState>,
    next_out: usize,
    workers: Vec<JoinHandle<()>>,
}

impl DataLoader {
    /// Create a loader over `dataset` with the given options.
    #[must_use]
    pub fn new(dataset: Arc<CifarDataset>, opts: LoaderOptions) -> Self {
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        let rng_seed = opts.shuffle_seed.unwrap_or(0);
        if let Some(seed) = opts.shuffle_seed {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        let num_batches = dataset.len().div_ceil(opts.batch_size);
        let num_workers = opts.num_workers;

        let state = Arc::new(LoaderState {
            dataset,
            order,
            opts,
            num_batches,
            rng_seed,
            next_job: AtomicUsize::new(0),
            buffer: Mutex::new(BTreeMap::new()),
            stop: AtomicBool::new(false),
        });

        let workers = (0..num_workers)
            .map(|_| {
                let state = Arc::clone(&state);
                thread::spawn(move || worker_loop(&state))
            })
            .collect();

        Self {
            state,
            next_out: 0,
            workers,
        }
    }

    /// Number of batches this loader will yield.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.state.num_batches
    }
}

fn worker_loop(state: &LoaderState) {
    let capacity = state.opts.num_workers.max(1) * PREFETCH_FACTOR;
    loop {
        if state.stop.load(Ordering::Relaxed) {
            break;
        }
        if state.buffer.lock().unwrap().len() >= capacity {
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        let job = state.next_job.fetch_add(1, Ordering::Relaxed);
        if job >= state.num_batches {
            break;
        }
        let batch = make_batch(state, job);
        state.buffer.lock().unwrap().insert(job, batch);
    }
}

fn make_batch(state: &LoaderState, job: usize) -> Result<Batch> {
    let start = job * state.opts.batch_size;
    let end = (start + state.opts.batch_size).min(state.order.len());
    let count = end - start;

    // One rng per batch so augmentation is reproducible regardless of which
    // worker ends up preparing it.
    let mut rng = StdRng::seed_from_u64(state.rng_seed.wrapping_add(job as u64));

    let mut pixels = Vec::with_capacity(count * IMAGE_BYTES);
    let mut labels = Vec::with_capacity(count);
    for &idx in &state.order[start..end] {
        let raw = state.dataset.image(idx);
        if state.opts.augment {
            normalize_into(&augment_image(raw, &mut rng), &mut pixels);
        } else {
            normalize_into(raw, &mut pixels);
        }
        labels.push(u32::from(state.dataset.label(idx)));
    }

    let images = Tensor::from_vec(
        pixels,
        (count, IMAGE_CHANNELS, IMAGE_SIDE, IMAGE_SIDE),
        &state.opts.device,
    )?;
    let labels = Tensor::from_vec(labels, count, &state.opts.device)?;
    Ok(Batch { images, labels })
}

impl Iterator for DataLoader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_out >= self.state.num_batches {
            return None;
        }
        let job = self.next_out;
        self.next_out += 1;

        if self.workers.is_empty() {
            return Some(make_batch(&self.state, job));
        }
        loop {
            if let Some(batch) = self.state.buffer.lock().unwrap().remove(&job) {
                return Some(batch);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for DataLoader {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::Relaxed);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
