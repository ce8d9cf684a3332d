use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::accession::AccessionKind;
use crate::fetcher::FetchError;

#[derive(Debug, Error, Diagnostic)]
pub enum SeqstageError {
    #[error("invalid accession id: {0}")]
    InvalidAccession(String),

    #[error("expected a {expected} accession, got: {id}")]
    KindMismatch { id: String, expected: AccessionKind },

    #[error("failed to resolve {id}")]
    Resolution {
        id: String,
        #[source]
        cause: FetchError,
    },

    #[error("{kind} table schema mismatch: {message}")]
    SchemaMismatch {
        kind: AccessionKind,
        message: String,
    },

    #[error("conflicting record for {kind} {id}: already stored with different content")]
    DuplicateKey { kind: AccessionKind, id: String },

    #[error("no cached record for {kind} {id}")]
    NotFound { kind: AccessionKind, id: String },

    #[error("no work items to dispatch")]
    EmptyWork,

    #[error("cluster queue backend requires a server name")]
    MissingServerName,

    #[error("slot count must be at least 1")]
    InvalidSlotCount,

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("unknown job backend: {0}")]
    UnknownBackend(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("missing config file seqstage.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {}", .0.display())]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("job submission failed: {0}")]
    Submit(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
