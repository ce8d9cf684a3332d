use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::accession::SampleId;
use crate::error::SeqstageError;

/// On-disk layout of one seqstage project: per-sample resource directories
/// and the auto-generated job tree.
#[derive(Debug, Clone)]
pub struct Project {
    root: Utf8PathBuf,
}

impl Project {
    pub fn new() -> Result<Self, SeqstageError> {
        let cwd = std::env::current_dir().map_err(|err| SeqstageError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(cwd)
            .map_err(|_| SeqstageError::Filesystem("invalid project path".to_string()))?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn config_path(&self) -> Utf8PathBuf {
        self.root.join("seqstage.json")
    }

    pub fn templates_dir(&self) -> Utf8PathBuf {
        self.root.join("templates")
    }

    pub fn resources_dir(&self) -> Utf8PathBuf {
        self.root.join("resources")
    }

    pub fn sample_dir(&self, sample_id: &SampleId) -> Utf8PathBuf {
        self.resources_dir().join(sample_id.as_str())
    }

    pub fn sample_raw_dir(&self, sample_id: &SampleId) -> Utf8PathBuf {
        self.sample_dir(sample_id).join("raw")
    }

    pub fn sample_fastq_dir(&self, sample_id: &SampleId) -> Utf8PathBuf {
        self.sample_raw_dir(sample_id).join("fastqs")
    }

    pub fn jobs_root(&self) -> Utf8PathBuf {
        self.root.join("jobs").join("auto")
    }

    pub fn job_dir(&self, stage: &str, timestamp: &str) -> Utf8PathBuf {
        self.jobs_root().join(stage).join(timestamp)
    }

    pub fn ensure_sample_dirs(&self, sample_id: &SampleId) -> Result<(), SeqstageError> {
        ensure_dir(&self.sample_fastq_dir(sample_id))
    }

    /// A sample counts as dumped once its fastqs directory has content.
    pub fn is_dumped(&self, sample_id: &SampleId) -> bool {
        let dir = self.sample_fastq_dir(sample_id);
        fs::read_dir(dir.as_std_path())
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }
}

pub fn ensure_dir(path: &Utf8Path) -> Result<(), SeqstageError> {
    fs::create_dir_all(path.as_std_path()).map_err(|err| SeqstageError::Filesystem(err.to_string()))
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SeqstageError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(tmp_path.as_std_path(), content)
        .map_err(|err| SeqstageError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| SeqstageError::Filesystem(err.to_string()))
}
