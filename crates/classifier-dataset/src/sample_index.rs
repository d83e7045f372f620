//! Directory scanning: one class per immediate subdirectory of the root.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use classifier_core::{ConfigurationError, DatasetError, LabeledSample, Result};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Ordered collection of labeled samples discovered under a root directory.
#[derive(Debug, Clone)]
pub struct SampleIndex {
    root: PathBuf,
    labels: Vec<String>,
    samples: Vec<LabeledSample>,
}

impl SampleIndex {
    /// Scans `root` and labels every allowed file by its parent directory.
    ///
    /// Classes are sorted by name and files within a class by path, so the
    /// order only depends on the filesystem contents.
    pub fn scan<S: AsRef<str>>(root: &Path, allowed_extensions: &[S]) -> Result<Self> {
        if !root.is_dir() {
            return Err(ConfigurationError::MissingPath(root.to_path_buf()).into());
        }

        let allowed: Vec<String> = allowed_extensions
            .iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
            .collect();

        let mut class_dirs: Vec<PathBuf> = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| walk_error(root, e))?;
            if entry.file_type().is_dir() {
                class_dirs.push(entry.into_path());
            }
        }
        class_dirs.sort();

        if class_dirs.is_empty() {
            return Err(DatasetError::EmptyDataset(root.to_path_buf()).into());
        }

        let mut labels = Vec::with_capacity(class_dirs.len());
        let mut samples = Vec::new();

        for (class_id, class_dir) in class_dirs.iter().enumerate() {
            let label = class_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let mut files = Vec::new();
            for entry in WalkDir::new(class_dir).min_depth(1).max_depth(1) {
                let entry = entry.map_err(|e| walk_error(class_dir, e))?;
                if entry.file_type().is_file() && has_allowed_extension(entry.path(), &allowed) {
                    files.push(entry.into_path());
                }
            }
            files.sort();

            if files.is_empty() {
                return Err(DatasetError::NoSamples {
                    class: label,
                    path: class_dir.clone(),
                }
                .into());
            }

            debug!("Class {} '{}': {} images", class_id, label, files.len());
            samples.extend(
                files
                    .into_iter()
                    .map(|path| LabeledSample::new(path, label.clone(), class_id)),
            );
            labels.push(label);
        }

        info!(
            "Indexed {} samples in {} classes under {:?}",
            samples.len(),
            labels.len(),
            root
        );

        Ok(Self {
            root: root.to_path_buf(),
            labels,
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Class names, indexed by class id
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Number of classes; this is the classifier's output width
    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    pub fn samples(&self) -> &[LabeledSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples grouped by label, in label order.
    pub fn by_class(&self) -> BTreeMap<&str, Vec<&LabeledSample>> {
        let mut groups: BTreeMap<&str, Vec<&LabeledSample>> = BTreeMap::new();
        for sample in &self.samples {
            groups.entry(sample.label.as_str()).or_default().push(sample);
        }
        groups
    }

    pub fn class_counts(&self) -> Vec<(String, usize)> {
        self.by_class()
            .into_iter()
            .map(|(label, samples)| (label.to_string(), samples.len()))
            .collect()
    }

    pub fn stats(&self) -> IndexStats {
        let counts = self.class_counts();
        IndexStats {
            total_samples: self.samples.len(),
            min_class_size: counts.iter().map(|(_, c)| *c).min().unwrap_or(0),
            max_class_size: counts.iter().map(|(_, c)| *c).max().unwrap_or(0),
            class_counts: counts,
        }
    }
}

fn has_allowed_extension(path: &Path, allowed: &[String]) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            allowed.iter().any(|a| *a == ext)
        })
        .unwrap_or(false)
}

fn walk_error(path: &Path, err: walkdir::Error) -> DatasetError {
    let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| path.to_path_buf());
    let source = err
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop"));
    DatasetError::Io { path, source }
}

/// Per-class sample counts
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub total_samples: usize,
    pub class_counts: Vec<(String, usize)>,
    pub min_class_size: usize,
    pub max_class_size: usize,
}

impl IndexStats {
    /// Ratio between the largest and smallest class.
    pub fn imbalance_ratio(&self) -> f64 {
        if self.min_class_size == 0 {
            return f64::INFINITY;
        }
        self.max_class_size as f64 / self.min_class_size as f64
    }
}

impl fmt::Display for IndexStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sample Index:")?;
        writeln!(f, "  Total samples: {}", self.total_samples)?;
        writeln!(f, "  Classes: {}", self.class_counts.len())?;
        writeln!(f, "  Imbalance ratio: {:.2}", self.imbalance_ratio())?;
        for (label, count) in &self.class_counts {
            writeln!(f, "    {:<24} {:>6}", label, count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classifier_core::{Error, DEFAULT_EXTENSIONS};
    use std::fs;
    use tempfile::TempDir;

    fn create_test_image(path: &Path) {
        let img = image::ImageBuffer::from_fn(10, 10, |_, _| image::Rgb([255u8, 0u8, 0u8]));
        img.save(path).unwrap();
    }

    fn create_class(root: &Path, name: &str, count: usize) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            create_test_image(&dir.join(format!("img_{i:03}.png")));
        }
    }

    #[test]
    fn test_scan_two_classes() {
        let temp = TempDir::new().unwrap();
        create_class(temp.path(), "dog", 3);
        create_class(temp.path(), "cat", 5);
        fs::write(temp.path().join("cat").join("notes.txt"), "ignore me").unwrap();

        let index = SampleIndex::scan(temp.path(), DEFAULT_EXTENSIONS).unwrap();
        assert_eq!(index.num_labels(), 2);
        assert_eq!(index.labels(), &["cat".to_string(), "dog".to_string()]);
        assert_eq!(index.len(), 8);
        assert!(index
            .samples()
            .iter()
            .all(|s| index.labels()[s.class_id] == s.label));
        assert_eq!(
            index.class_counts(),
            vec![("cat".to_string(), 5), ("dog".to_string(), 3)]
        );
    }

    #[test]
    fn test_scan_is_deterministic() {
        let temp = TempDir::new().unwrap();
        create_class(temp.path(), "a", 4);
        create_class(temp.path(), "b", 4);

        let first = SampleIndex::scan(temp.path(), DEFAULT_EXTENSIONS).unwrap();
        let second = SampleIndex::scan(temp.path(), DEFAULT_EXTENSIONS).unwrap();
        assert_eq!(first.samples(), second.samples());
    }

    #[test]
    fn test_extension_matching_is_case_insensitive() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("cat");
        fs::create_dir_all(&dir).unwrap();
        create_test_image(&dir.join("upper.png"));
        fs::rename(dir.join("upper.png"), dir.join("upper.PNG")).unwrap();

        let index = SampleIndex::scan(temp.path(), &["png"]).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_empty_root() {
        let temp = TempDir::new().unwrap();
        let result = SampleIndex::scan(temp.path(), DEFAULT_EXTENSIONS);
        assert!(matches!(
            result,
            Err(Error::Dataset(DatasetError::EmptyDataset(_)))
        ));
    }

    #[test]
    fn test_class_without_samples() {
        let temp = TempDir::new().unwrap();
        create_class(temp.path(), "cat", 2);
        fs::create_dir_all(temp.path().join("dog")).unwrap();
        fs::write(temp.path().join("dog").join("readme.md"), "no images").unwrap();

        let result = SampleIndex::scan(temp.path(), DEFAULT_EXTENSIONS);
        match result {
            Err(Error::Dataset(DatasetError::NoSamples { class, .. })) => assert_eq!(class, "dog"),
            other => panic!("expected NoSamples, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_root() {
        let temp = TempDir::new().unwrap();
        let result = SampleIndex::scan(&temp.path().join("missing"), DEFAULT_EXTENSIONS);
        assert!(matches!(
            result,
            Err(Error::Configuration(ConfigurationError::MissingPath(_)))
        ));
    }

    #[test]
    fn test_stats() {
        let temp = TempDir::new().unwrap();
        create_class(temp.path(), "cat", 6);
        create_class(temp.path(), "dog", 2);

        let stats = SampleIndex::scan(temp.path(), DEFAULT_EXTENSIONS)
            .unwrap()
            .stats();
        assert_eq!(stats.total_samples, 8);
        assert!((stats.imbalance_ratio() - 3.0).abs() < 1e-9);
        assert!(stats.to_string().contains("cat"));
    }
}
