use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::accession::{AccessionKind, RunId, SampleId, StudyId};
use crate::error::SeqstageError;

/// A record persisted in the per-kind accession table. The column set is fixed
/// by `SCHEMA`; rows that do not match it are rejected by the store.
pub trait TableRecord: Clone {
    const KIND: AccessionKind;
    const SCHEMA: &'static [&'static str];

    fn accession_id(&self) -> &str;
    fn to_row(&self) -> Vec<String>;
    fn from_row(row: &[String]) -> Result<Self, SeqstageError>;
}

fn check_width(kind: AccessionKind, schema: &[&str], row: &[String]) -> Result<(), SeqstageError> {
    if row.len() != schema.len() {
        return Err(SeqstageError::SchemaMismatch {
            kind,
            message: format!("expected {} columns, found {}", schema.len(), row.len()),
        });
    }
    Ok(())
}

fn join_ids<T: fmt::Display>(ids: &[T]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn split_ids<T: FromStr<Err = SeqstageError>>(cell: &str) -> Result<Vec<T>, SeqstageError> {
    if cell.is_empty() {
        return Ok(Vec::new());
    }
    cell.split(',').map(|part| part.trim().parse()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub accession_id: StudyId,
    pub title: String,
    pub summary: String,
    pub child_sample_ids: Vec<SampleId>,
}

impl TableRecord for StudyRecord {
    const KIND: AccessionKind = AccessionKind::Study;
    const SCHEMA: &'static [&'static str] =
        &["accession_id", "title", "summary", "child_sample_ids"];

    fn accession_id(&self) -> &str {
        self.accession_id.as_str()
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.accession_id.to_string(),
            self.title.clone(),
            self.summary.clone(),
            join_ids(&self.child_sample_ids),
        ]
    }

    fn from_row(row: &[String]) -> Result<Self, SeqstageError> {
        check_width(Self::KIND, Self::SCHEMA, row)?;
        Ok(Self {
            accession_id: row[0].parse()?,
            title: row[1].clone(),
            summary: row[2].clone(),
            child_sample_ids: split_ids(&row[3])?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub accession_id: SampleId,
    pub title: String,
    pub species: String,
    pub raw_link: String,
    pub parent_study_id: StudyId,
    pub child_run_ids: Vec<RunId>,
}

impl TableRecord for SampleRecord {
    const KIND: AccessionKind = AccessionKind::Sample;
    const SCHEMA: &'static [&'static str] = &[
        "accession_id",
        "title",
        "species",
        "raw_link",
        "parent_study_id",
        "child_run_ids",
    ];

    fn accession_id(&self) -> &str {
        self.accession_id.as_str()
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.accession_id.to_string(),
            self.title.clone(),
            self.species.clone(),
            self.raw_link.clone(),
            self.parent_study_id.to_string(),
            join_ids(&self.child_run_ids),
        ]
    }

    fn from_row(row: &[String]) -> Result<Self, SeqstageError> {
        check_width(Self::KIND, Self::SCHEMA, row)?;
        Ok(Self {
            accession_id: row[0].parse()?,
            title: row[1].clone(),
            species: row[2].clone(),
            raw_link: row[3].clone(),
            parent_study_id: row[4].parse()?,
            child_run_ids: split_ids(&row[5])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunFileType {
    Fastq,
    Bam,
}

impl fmt::Display for RunFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFileType::Fastq => write!(f, "fastq"),
            RunFileType::Bam => write!(f, "bam"),
        }
    }
}

impl FromStr for RunFileType {
    type Err = SeqstageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "fastq" => Ok(RunFileType::Fastq),
            "bam" => Ok(RunFileType::Bam),
            other => Err(SeqstageError::SchemaMismatch {
                kind: AccessionKind::Run,
                message: format!("unknown file type: {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadType {
    R1,
    R2,
    I1,
    I2,
}

impl ReadType {
    /// 1-based index used in the raw `<run>_<n>.fastq.gz` dump file names.
    pub fn raw_index(self) -> usize {
        match self {
            ReadType::R1 => 1,
            ReadType::R2 => 2,
            ReadType::I1 => 3,
            ReadType::I2 => 4,
        }
    }
}

impl fmt::Display for ReadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadType::R1 => write!(f, "R1"),
            ReadType::R2 => write!(f, "R2"),
            ReadType::I1 => write!(f, "I1"),
            ReadType::I2 => write!(f, "I2"),
        }
    }
}

impl FromStr for ReadType {
    type Err = SeqstageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "R1" => Ok(ReadType::R1),
            "R2" => Ok(ReadType::R2),
            "I1" => Ok(ReadType::I1),
            "I2" => Ok(ReadType::I2),
            other => Err(SeqstageError::SchemaMismatch {
                kind: AccessionKind::Run,
                message: format!("unknown read type: {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSegment {
    pub lane: String,
    pub read: ReadType,
}

impl fmt::Display for RunSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lane, self.read)
    }
}

impl FromStr for RunSegment {
    type Err = SeqstageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (lane, read) = value
            .split_once(':')
            .ok_or_else(|| SeqstageError::SchemaMismatch {
                kind: AccessionKind::Run,
                message: format!("malformed segment: {value}"),
            })?;
        Ok(Self {
            lane: lane.to_string(),
            read: read.parse()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub accession_id: RunId,
    pub parent_sample_id: SampleId,
    pub file_type: RunFileType,
    pub location: String,
    pub segments: Vec<RunSegment>,
}

impl TableRecord for RunRecord {
    const KIND: AccessionKind = AccessionKind::Run;
    const SCHEMA: &'static [&'static str] = &[
        "accession_id",
        "parent_sample_id",
        "file_type",
        "location",
        "segments",
    ];

    fn accession_id(&self) -> &str {
        self.accession_id.as_str()
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.accession_id.to_string(),
            self.parent_sample_id.to_string(),
            self.file_type.to_string(),
            self.location.clone(),
            join_ids(&self.segments),
        ]
    }

    fn from_row(row: &[String]) -> Result<Self, SeqstageError> {
        check_width(Self::KIND, Self::SCHEMA, row)?;
        Ok(Self {
            accession_id: row[0].parse()?,
            parent_sample_id: row[1].parse()?,
            file_type: row[2].parse()?,
            location: row[3].clone(),
            segments: split_ids(&row[4])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn sample_record() -> SampleRecord {
        SampleRecord {
            accession_id: "GSM2629388".parse().unwrap(),
            title: "cortex nuclei".to_string(),
            species: "Mus musculus".to_string(),
            raw_link: "ftp://ftp.ncbi.nlm.nih.gov/geo/samples".to_string(),
            parent_study_id: "GSE102902".parse().unwrap(),
            child_run_ids: vec!["SRR5799777".parse().unwrap(), "SRR5799778".parse().unwrap()],
        }
    }

    #[test]
    fn sample_row_round_trip() {
        let record = sample_record();
        let row = record.to_row();
        assert_eq!(row.len(), SampleRecord::SCHEMA.len());
        assert_eq!(row[5], "SRR5799777,SRR5799778");
        let parsed = SampleRecord::from_row(&row).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn run_row_round_trip() {
        let record = RunRecord {
            accession_id: "SRR5799777".parse().unwrap(),
            parent_sample_id: "GSM2629388".parse().unwrap(),
            file_type: RunFileType::Fastq,
            location: "https://sra-download.ncbi.nlm.nih.gov/SRR5799777".to_string(),
            segments: vec![
                RunSegment {
                    lane: "L001".to_string(),
                    read: ReadType::R1,
                },
                RunSegment {
                    lane: "L001".to_string(),
                    read: ReadType::R2,
                },
            ],
        };
        let row = record.to_row();
        assert_eq!(row[4], "L001:R1,L001:R2");
        assert_eq!(RunRecord::from_row(&row).unwrap(), record);
    }

    #[test]
    fn short_row_is_schema_mismatch() {
        let row = vec!["GSE102902".to_string(), "title".to_string()];
        let err = StudyRecord::from_row(&row).unwrap_err();
        assert_matches!(
            err,
            SeqstageError::SchemaMismatch {
                kind: AccessionKind::Study,
                ..
            }
        );
    }

    #[test]
    fn empty_child_list_round_trips() {
        let record = StudyRecord {
            accession_id: "GSE102902".parse().unwrap(),
            title: String::new(),
            summary: String::new(),
            child_sample_ids: Vec::new(),
        };
        let parsed = StudyRecord::from_row(&record.to_row()).unwrap();
        assert!(parsed.child_sample_ids.is_empty());
    }
}
