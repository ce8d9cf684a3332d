use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::accession::StudyId;
use crate::dispatch::JobBackend;
use crate::error::SeqstageError;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub studies: Vec<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub nthread: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub studies: Vec<StudyId>,
    pub backend: JobBackend,
    pub nthread: usize,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SeqstageError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("seqstage.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(SeqstageError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SeqstageError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SeqstageError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SeqstageError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let studies = config
            .studies
            .iter()
            .map(|entry| entry.parse())
            .collect::<Result<Vec<_>, SeqstageError>>()?;

        let backend = match config.backend.as_deref() {
            Some(value) => value.parse()?,
            None => JobBackend::Immediate,
        };

        Ok(ResolvedConfig {
            schema_version,
            studies,
            backend,
            nthread: config.nthread.unwrap_or(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn resolve_defaults() {
        let config = Config {
            schema_version: None,
            studies: vec!["GSE102902".to_string()],
            backend: None,
            nthread: None,
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.studies.len(), 1);
        assert_eq!(resolved.backend, JobBackend::Immediate);
        assert_eq!(resolved.nthread, 1);
    }

    #[test]
    fn resolve_cluster_backend() {
        let config = Config {
            schema_version: Some(1),
            studies: Vec::new(),
            backend: Some("pbs@cosmos".to_string()),
            nthread: Some(8),
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(
            resolved.backend,
            JobBackend::ClusterQueue {
                server: "cosmos".to_string()
            }
        );
        assert_eq!(resolved.nthread, 8);
    }

    #[test]
    fn reject_invalid_study_id() {
        let config = Config {
            schema_version: None,
            studies: vec!["SRR1".to_string()],
            backend: None,
            nthread: None,
        };
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, SeqstageError::KindMismatch { .. });
    }
}
