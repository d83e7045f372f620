//! Model persistence.
//!
//! An archive is a single file:
//!
//! ```text
//! magic (8 bytes) | header length (u64 LE) | JSON ArchiveHeader | parameter record
//! ```
//!
//! The header carries everything needed to rebuild the network (the
//! architecture, labels and normalization), the record carries the
//! parameters in burn's binary format. Archives are written to a temporary
//! file next to the destination and moved into place, so a failed save never
//! leaves a partial file behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use chrono::{DateTime, Utc};
use classifier_core::{ImageDimensions, NormalizationPolicy, PersistenceError};
use classifier_dataset::PixelScaler;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

use crate::architecture::ArchitectureSpec;
use crate::trainer::{TrainedModel, TrainingHistory};

const MAGIC: &[u8; 8] = b"IMGCLS01";
const PREFIX_LEN: usize = MAGIC.len() + 8;

/// Current archive format version
pub const FORMAT_VERSION: u32 = 1;

type ParamRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// Metadata stored in front of the parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub format_version: u32,
    pub architecture: ArchitectureSpec,
    pub labels: Vec<String>,
    pub input: ImageDimensions,
    pub normalization: NormalizationPolicy,
    pub scaler: PixelScaler,
    pub created_at: DateTime<Utc>,
    pub history: TrainingHistory,
}

/// Saves and loads [`TrainedModel`] archives
pub struct ModelStore;

impl ModelStore {
    /// Writes `trained` to `destination`.
    ///
    /// Fails with [`PersistenceError::DestinationExists`] when the file exists
    /// and `overwrite_existing` is false; the existing file is left untouched.
    pub fn save<B: Backend>(
        trained: &TrainedModel<B>,
        destination: &Path,
        overwrite_existing: bool,
    ) -> Result<ArchiveHeader, PersistenceError> {
        if !overwrite_existing && destination.exists() {
            return Err(PersistenceError::DestinationExists(destination.to_path_buf()));
        }

        let header = ArchiveHeader {
            format_version: FORMAT_VERSION,
            architecture: trained.spec().clone(),
            labels: trained.labels().to_vec(),
            input: trained.input(),
            normalization: trained.normalization(),
            scaler: trained.scaler(),
            created_at: Utc::now(),
            history: trained.history().clone(),
        };
        let header_bytes = serde_json::to_vec(&header)?;

        let recorder = ParamRecorder::default();
        let params = <ParamRecorder as Recorder<B>>::record(
            &recorder,
            trained.model().clone().into_record(),
            (),
        )
        .map_err(|e| PersistenceError::Record(e.to_string()))?;

        let directory = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&directory).map_err(io_error(&directory))?;

        let mut file = NamedTempFile::new_in(&directory).map_err(io_error(&directory))?;
        write_archive(file.as_file_mut(), &header_bytes, &params).map_err(io_error(destination))?;

        if overwrite_existing {
            file.persist(destination)
                .map_err(|e| io_error(destination)(e.error))?;
        } else {
            file.persist_noclobber(destination).map_err(|e| {
                if e.error.kind() == io::ErrorKind::AlreadyExists {
                    PersistenceError::DestinationExists(destination.to_path_buf())
                } else {
                    io_error(destination)(e.error)
                }
            })?;
        }

        info!(
            "Saved model ({} labels, {} parameter bytes) to {:?}",
            header.labels.len(),
            params.len(),
            destination
        );
        Ok(header)
    }

    /// Reads only the archive header.
    pub fn read_header(path: &Path) -> Result<ArchiveHeader, PersistenceError> {
        let bytes = fs::read(path).map_err(io_error(path))?;
        let (header, _) = split_archive(path, &bytes)?;
        Ok(header)
    }

    /// Rebuilds the model described by the archive's header and loads its parameters.
    pub fn load<B: Backend>(
        path: &Path,
        device: &B::Device,
    ) -> Result<TrainedModel<B>, PersistenceError> {
        let bytes = fs::read(path).map_err(io_error(path))?;
        let (header, params) = split_archive(path, &bytes)?;

        let format_error = |message: String| PersistenceError::Format {
            path: path.to_path_buf(),
            message,
        };
        let spec = &header.architecture;
        spec.validate(header.input, header.labels.len())
            .map_err(|e| format_error(e.to_string()))?;

        // Every parameter is overwritten by the record; the seed only fixes the shapes
        let mut rng = ChaCha8Rng::seed_from_u64(spec.init_seed());
        let model = spec
            .init::<B, _>(device, &mut rng)
            .map_err(|e| format_error(e.to_string()))?;

        let recorder = ParamRecorder::default();
        let record = <ParamRecorder as Recorder<B>>::load(&recorder, params.to_vec(), device)
            .map_err(|e| PersistenceError::Record(e.to_string()))?;
        let model = model.load_record(record);

        info!("Loaded model with {} labels from {:?}", header.labels.len(), path);
        Ok(TrainedModel::new(
            model,
            header.architecture,
            header.labels,
            header.normalization,
            header.scaler,
            header.history,
            device.clone(),
        ))
    }
}

fn write_archive(file: &mut fs::File, header: &[u8], params: &[u8]) -> io::Result<()> {
    file.write_all(MAGIC)?;
    file.write_all(&(header.len() as u64).to_le_bytes())?;
    file.write_all(header)?;
    file.write_all(params)?;
    file.flush()?;
    file.sync_all()
}

fn split_archive<'a>(path: &Path, bytes: &'a [u8]) -> Result<(ArchiveHeader, &'a [u8]), PersistenceError> {
    let malformed = |message: &str| PersistenceError::Format {
        path: path.to_path_buf(),
        message: message.to_string(),
    };

    if bytes.len() < PREFIX_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(malformed("missing archive magic"));
    }
    let mut length = [0u8; 8];
    length.copy_from_slice(&bytes[MAGIC.len()..PREFIX_LEN]);
    let header_len = usize::try_from(u64::from_le_bytes(length))
        .map_err(|_| malformed("header length overflows"))?;
    let header_end = PREFIX_LEN
        .checked_add(header_len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| malformed("truncated header"))?;

    let header: ArchiveHeader = serde_json::from_slice(&bytes[PREFIX_LEN..header_end])
        .map_err(|e| malformed(&format!("invalid header: {e}")))?;
    if header.format_version != FORMAT_VERSION {
        return Err(malformed(&format!(
            "unsupported format version {}",
            header.format_version
        )));
    }

    Ok((header, &bytes[header_end..]))
}

fn io_error(path: &Path) -> impl Fn(io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::LrnParams;
    use burn::tensor::{Distribution, Tensor};
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn trained(seed: u64) -> TrainedModel<TestBackend> {
        let device = Default::default();
        let spec = ArchitectureSpec::builder()
            .input(ImageDimensions::new(8, 8, 3))
            .convolution(4, 3, 1, 1)
            .local_response_norm(LrnParams::default())
            .max_pool(2, 2, 0)
            .dense(6)
            .output(3)
            .build()
            .unwrap();
        let model = spec
            .init::<TestBackend, _>(&device, &mut ChaCha8Rng::seed_from_u64(seed))
            .unwrap();
        TrainedModel::new(
            model,
            spec,
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            NormalizationPolicy::FitOnce,
            PixelScaler::full_range(),
            TrainingHistory {
                iterations: 42,
                ..TrainingHistory::default()
            },
            device,
        )
    }

    #[test]
    fn test_round_trip_predicts_identically() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cnntrainedmodel.bin");
        // Initialised with a seed other than the architecture's, so only the record can restore it
        let original = trained(11);
        ModelStore::save(&original, &path, false).unwrap();

        let device = Default::default();
        let loaded = ModelStore::load::<TestBackend>(&path, &device).unwrap();

        let images = Tensor::<TestBackend, 4>::random([6, 3, 8, 8], Distribution::Default, &device);
        let expected: Vec<f32> = original
            .model()
            .forward(images.clone())
            .into_data()
            .iter::<f32>()
            .collect();
        let actual: Vec<f32> = loaded.model().forward(images).into_data().iter::<f32>().collect();

        assert_eq!(expected, actual);
        assert_eq!(loaded.labels(), original.labels());
        assert_eq!(loaded.spec(), original.spec());
        assert_eq!(loaded.history().iterations, 42);
        assert_eq!(loaded.normalization(), NormalizationPolicy::FitOnce);
    }

    #[test]
    fn test_existing_destination_is_untouched() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.bin");
        fs::write(&path, b"precious").unwrap();

        let result = ModelStore::save(&trained(1), &path, false);
        assert!(matches!(result, Err(PersistenceError::DestinationExists(_))));
        assert_eq!(fs::read(&path).unwrap(), b"precious");
        // No temporary files left behind
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_overwrite_replaces_existing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.bin");
        fs::write(&path, b"old").unwrap();

        ModelStore::save(&trained(1), &path, true).unwrap();
        let header = ModelStore::read_header(&path).unwrap();
        assert_eq!(header.format_version, FORMAT_VERSION);
        assert_eq!(header.labels.len(), 3);
    }

    #[test]
    fn test_creates_missing_directories() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("dir").join("model.bin");
        ModelStore::save(&trained(2), &path, false).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn test_rejects_foreign_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.bin");
        fs::write(&path, b"this is not a model archive").unwrap();

        let result = ModelStore::load::<TestBackend>(&path, &Default::default());
        assert!(matches!(result, Err(PersistenceError::Format { .. })));
    }

    #[test]
    fn test_rejects_tampered_architecture() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.bin");
        ModelStore::save(&trained(3), &path, false).unwrap();

        // Same length, so the header still parses
        let mut bytes = fs::read(&path).unwrap();
        let (from, to) = (b"\"n\":5", b"\"n\":4");
        let at = bytes
            .windows(from.len())
            .position(|window| window == from)
            .unwrap();
        bytes[at..at + to.len()].copy_from_slice(to);
        fs::write(&path, &bytes).unwrap();

        assert!(ModelStore::read_header(&path).is_ok());
        let result = ModelStore::load::<TestBackend>(&path, &Default::default());
        assert!(matches!(result, Err(PersistenceError::Format { .. })));
    }

    #[test]
    fn test_missing_file() {
        let temp = TempDir::new().unwrap();
        let result = ModelStore::read_header(&temp.path().join("absent.bin"));
        assert!(matches!(result, Err(PersistenceError::Io { .. })));
    }
}
