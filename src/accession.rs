use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SeqstageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessionKind {
    Study,
    Sample,
    Run,
}

impl AccessionKind {
    pub fn prefix(self) -> &'static str {
        match self {
            AccessionKind::Study => "GSE",
            AccessionKind::Sample => "GSM",
            AccessionKind::Run => "SRR",
        }
    }

    pub fn table_name(self) -> &'static str {
        match self {
            AccessionKind::Study => "studies",
            AccessionKind::Sample => "samples",
            AccessionKind::Run => "runs",
        }
    }

    pub fn from_id(id: &str) -> Result<Self, SeqstageError> {
        let trimmed = id.trim();
        for kind in [
            AccessionKind::Study,
            AccessionKind::Sample,
            AccessionKind::Run,
        ] {
            if trimmed.starts_with(kind.prefix()) {
                return Ok(kind);
            }
        }
        Err(SeqstageError::InvalidAccession(id.to_string()))
    }
}

impl fmt::Display for AccessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessionKind::Study => write!(f, "study"),
            AccessionKind::Sample => write!(f, "sample"),
            AccessionKind::Run => write!(f, "run"),
        }
    }
}

fn accession_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(GSE|GSM|SRR)[A-Za-z0-9]+$").unwrap())
}

fn normalized_id(value: &str, expected: AccessionKind) -> Result<String, SeqstageError> {
    let normalized = value.trim().to_string();
    if !accession_regex().is_match(&normalized) {
        return Err(SeqstageError::InvalidAccession(value.to_string()));
    }
    if !normalized.starts_with(expected.prefix()) {
        return Err(SeqstageError::KindMismatch {
            id: normalized,
            expected,
        });
    }
    Ok(normalized)
}

macro_rules! accession_id {
    ($name:ident, $kind:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = SeqstageError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ok(Self(normalized_id(value, $kind)?))
            }
        }
    };
}

accession_id!(StudyId, AccessionKind::Study);
accession_id!(SampleId, AccessionKind::Sample);
accession_id!(RunId, AccessionKind::Run);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accession {
    Study(StudyId),
    Sample(SampleId),
    Run(RunId),
}

impl Accession {
    pub fn kind(&self) -> AccessionKind {
        match self {
            Accession::Study(_) => AccessionKind::Study,
            Accession::Sample(_) => AccessionKind::Sample,
            Accession::Run(_) => AccessionKind::Run,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Accession::Study(id) => id.as_str(),
            Accession::Sample(id) => id.as_str(),
            Accession::Run(id) => id.as_str(),
        }
    }
}

impl fmt::Display for Accession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl FromStr for Accession {
    type Err = SeqstageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match AccessionKind::from_id(value)? {
            AccessionKind::Study => Ok(Accession::Study(value.parse()?)),
            AccessionKind::Sample => Ok(Accession::Sample(value.parse()?)),
            AccessionKind::Run => Ok(Accession::Run(value.parse()?)),
        }
    }
}
