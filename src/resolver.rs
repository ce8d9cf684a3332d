use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::debug;

use crate::accession::{Accession, RunId, SampleId, StudyId};
use crate::error::SeqstageError;
use crate::fetcher::{MetadataFetcher, RawFields};
use crate::record::{RunRecord, SampleRecord, StudyRecord, TableRecord};
use crate::store::AccessionStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    pub fail_fast: bool,
}

#[derive(Debug)]
pub struct ChildFailure {
    pub id: String,
    pub error: SeqstageError,
}

/// Result of walking a Study down to its Runs. Children that failed to
/// resolve are reported in `failures` instead of aborting the whole tree,
/// unless fail-fast was requested.
#[derive(Debug)]
pub struct TreeResolution {
    pub study: StudyRecord,
    pub samples: Vec<SampleRecord>,
    pub runs: Vec<RunRecord>,
    pub failures: Vec<ChildFailure>,
}

#[derive(Debug, Clone)]
pub enum ResolvedAccession {
    Study(StudyRecord),
    Sample(SampleRecord),
    Run(RunRecord),
}

/// Cache-or-fetch resolution against the accession store. Resolution of one
/// id is single-flight: concurrent callers for the same id share one
/// underlying fetch. Fetches are never retried here.
pub struct AccessionResolver<F: MetadataFetcher> {
    store: Arc<AccessionStore>,
    fetcher: F,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<F: MetadataFetcher> AccessionResolver<F> {
    pub fn new(store: Arc<AccessionStore>, fetcher: F) -> Self {
        Self {
            store,
            fetcher,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &AccessionStore {
        &self.store
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn resolve(&self, accession: &Accession) -> Result<ResolvedAccession, SeqstageError> {
        match accession {
            Accession::Study(id) => Ok(ResolvedAccession::Study(self.resolve_study(id)?)),
            Accession::Sample(id) => Ok(ResolvedAccession::Sample(self.resolve_sample(id)?)),
            Accession::Run(id) => Ok(ResolvedAccession::Run(self.resolve_run(id, None)?)),
        }
    }

    pub fn resolve_study(&self, id: &StudyId) -> Result<StudyRecord, SeqstageError> {
        self.resolve_with(id.as_str(), |raw| normalize_study(id, raw))
    }

    pub fn resolve_sample(&self, id: &SampleId) -> Result<SampleRecord, SeqstageError> {
        self.resolve_with(id.as_str(), |raw| normalize_sample(id, raw))
    }

    pub fn resolve_run(
        &self,
        id: &RunId,
        parent: Option<&SampleId>,
    ) -> Result<RunRecord, SeqstageError> {
        self.resolve_with(id.as_str(), |raw| normalize_run(id, parent, raw))
    }

    /// Resolves the whole Study → Sample → Run tree in parent-record order.
    /// Sibling children resolve on their own threads; output order follows
    /// the order of ids in the parent record, not completion order.
    pub fn resolve_tree(
        &self,
        study_id: &StudyId,
        options: ResolveOptions,
    ) -> Result<TreeResolution, SeqstageError> {
        let study = self.resolve_study(study_id)?;
        let mut samples = Vec::new();
        let mut runs = Vec::new();
        let mut failures = Vec::new();

        let sample_results: Vec<(SampleId, Result<SampleRecord, SeqstageError>)> =
            thread::scope(|scope| {
                let handles: Vec<_> = study
                    .child_sample_ids
                    .iter()
                    .cloned()
                    .map(|sid| {
                        let thread_id = sid.clone();
                        (sid, scope.spawn(move || self.resolve_sample(&thread_id)))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(sid, handle)| (sid, join_worker(handle)))
                    .collect()
            });

        for (sid, result) in sample_results {
            match result {
                Ok(sample) => samples.push(sample),
                Err(error) if options.fail_fast => return Err(error),
                Err(error) => failures.push(ChildFailure {
                    id: sid.to_string(),
                    error,
                }),
            }
        }

        for sample in &samples {
            let parent = sample.accession_id.clone();
            let run_results: Vec<(RunId, Result<RunRecord, SeqstageError>)> =
                thread::scope(|scope| {
                    let handles: Vec<_> = sample
                        .child_run_ids
                        .iter()
                        .cloned()
                        .map(|rid| {
                            let thread_id = rid.clone();
                            let parent = &parent;
                            (
                                rid,
                                scope.spawn(move || self.resolve_run(&thread_id, Some(parent))),
                            )
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|(rid, handle)| (rid, join_worker(handle)))
                        .collect()
                });

            for (rid, result) in run_results {
                match result {
                    Ok(run) => runs.push(run),
                    Err(error) if options.fail_fast => return Err(error),
                    Err(error) => failures.push(ChildFailure {
                        id: rid.to_string(),
                        error,
                    }),
                }
            }
        }

        Ok(TreeResolution {
            study,
            samples,
            runs,
            failures,
        })
    }

    fn resolve_with<R, N>(&self, id: &str, normalize: N) -> Result<R, SeqstageError>
    where
        R: TableRecord,
        N: FnOnce(&RawFields) -> Result<R, SeqstageError>,
    {
        if self.store.exists::<R>(id)? {
            return self.store.get::<R>(id);
        }
        let lock = self.id_lock(id)?;
        let _guard = lock
            .lock()
            .map_err(|_| SeqstageError::Filesystem(format!("resolution lock poisoned: {id}")))?;
        // A concurrent caller may have committed while we waited for the lock.
        if self.store.exists::<R>(id)? {
            debug!(id, "reusing record resolved by a concurrent caller");
            return self.store.get::<R>(id);
        }
        let raw = self
            .fetcher
            .fetch(R::KIND, id)
            .map_err(|cause| SeqstageError::Resolution {
                id: id.to_string(),
                cause,
            })?;
        let record = normalize(&raw)?;
        self.store.put(&record)?;
        Ok(record)
    }

    fn id_lock(&self, id: &str) -> Result<Arc<Mutex<()>>, SeqstageError> {
        let mut guard = self
            .inflight
            .lock()
            .map_err(|_| SeqstageError::Filesystem("resolver inflight map poisoned".to_string()))?;
        Ok(guard.entry(id.to_string()).or_default().clone())
    }
}

fn join_worker<T>(handle: thread::ScopedJoinHandle<'_, Result<T, SeqstageError>>) -> Result<T, SeqstageError> {
    handle.join().unwrap_or_else(|_| {
        Err(SeqstageError::Filesystem(
            "resolver worker thread panicked".to_string(),
        ))
    })
}

fn field(raw: &RawFields, name: &str) -> String {
    raw.get(name).cloned().unwrap_or_default()
}

fn parse_id_list<T: FromStr<Err = SeqstageError>>(cell: &str) -> Result<Vec<T>, SeqstageError> {
    if cell.is_empty() {
        return Ok(Vec::new());
    }
    cell.split(',').map(|part| part.trim().parse()).collect()
}

fn normalize_study(id: &StudyId, raw: &RawFields) -> Result<StudyRecord, SeqstageError> {
    Ok(StudyRecord {
        accession_id: id.clone(),
        title: field(raw, "title"),
        summary: field(raw, "summary"),
        child_sample_ids: parse_id_list(&field(raw, "child_sample_ids"))?,
    })
}

fn normalize_sample(id: &SampleId, raw: &RawFields) -> Result<SampleRecord, SeqstageError> {
    Ok(SampleRecord {
        accession_id: id.clone(),
        title: field(raw, "title"),
        species: field(raw, "species"),
        raw_link: field(raw, "raw_link"),
        parent_study_id: field(raw, "parent_study_id").parse()?,
        child_run_ids: parse_id_list(&field(raw, "child_run_ids"))?,
    })
}

fn normalize_run(
    id: &RunId,
    parent: Option<&SampleId>,
    raw: &RawFields,
) -> Result<RunRecord, SeqstageError> {
    let parent_sample_id = match raw.get("parent_sample_id") {
        Some(value) if !value.is_empty() => value.parse()?,
        _ => parent
            .cloned()
            .ok_or_else(|| SeqstageError::InvalidAccession(format!("{id}: unknown parent sample")))?,
    };
    let file_type_cell = field(raw, "file_type");
    let file_type = if file_type_cell.is_empty() {
        "fastq".parse()?
    } else {
        file_type_cell.parse()?
    };
    let segments_cell = field(raw, "segments");
    let segments = if segments_cell.is_empty() {
        Vec::new()
    } else {
        segments_cell
            .split(',')
            .map(|part| part.trim().parse())
            .collect::<Result<Vec<_>, _>>()?
    };
    Ok(RunRecord {
        accession_id: id.clone(),
        parent_sample_id,
        file_type,
        location: field(raw, "location"),
        segments,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::accession::AccessionKind;
    use crate::fetcher::FetchError;

    struct MapFetcher {
        fields: HashMap<String, RawFields>,
        calls: Mutex<Vec<String>>,
    }

    impl MapFetcher {
        fn new(entries: Vec<(&str, Vec<(&str, &str)>)>) -> Self {
            let fields = entries
                .into_iter()
                .map(|(id, pairs)| {
                    let raw = pairs
                        .into_iter()
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect();
                    (id.to_string(), raw)
                })
                .collect();
            Self {
                fields,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self, id: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|seen| *seen == id)
                .count()
        }
    }

    impl MetadataFetcher for MapFetcher {
        fn fetch(&self, _kind: AccessionKind, id: &str) -> Result<RawFields, FetchError> {
            self.calls.lock().unwrap().push(id.to_string());
            self.fields
                .get(id)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(id.to_string()))
        }
    }

    fn temp_resolver(
        temp: &tempfile::TempDir,
        fetcher: MapFetcher,
    ) -> AccessionResolver<MapFetcher> {
        let root = Utf8PathBuf::from_path_buf(temp.path().join("db")).unwrap();
        AccessionResolver::new(Arc::new(AccessionStore::new_with_root(root)), fetcher)
    }

    #[test]
    fn second_resolve_uses_cache() {
        let temp = tempfile::tempdir().unwrap();
        let fetcher = MapFetcher::new(vec![(
            "GSM1",
            vec![("title", "rep1"), ("parent_study_id", "GSE1")],
        )]);
        let resolver = temp_resolver(&temp, fetcher);

        let id: SampleId = "GSM1".parse().unwrap();
        let first = resolver.resolve_sample(&id).unwrap();
        let second = resolver.resolve_sample(&id).unwrap();
        assert_eq!(first, second);
        assert_eq!(resolver.fetcher.call_count("GSM1"), 1);
    }

    #[test]
    fn fetch_failure_is_resolution_error() {
        let temp = tempfile::tempdir().unwrap();
        let resolver = temp_resolver(&temp, MapFetcher::new(Vec::new()));
        let id: SampleId = "GSM404".parse().unwrap();
        let err = resolver.resolve_sample(&id).unwrap_err();
        assert_matches!(err, SeqstageError::Resolution { .. });
    }

    #[test]
    fn tree_reports_failed_children() {
        let temp = tempfile::tempdir().unwrap();
        let fetcher = MapFetcher::new(vec![
            ("GSE1", vec![("title", "study"), ("child_sample_ids", "GSM1,GSM2")]),
            (
                "GSM1",
                vec![("parent_study_id", "GSE1"), ("child_run_ids", "SRR1")],
            ),
            ("SRR1", vec![("file_type", "fastq"), ("segments", "L001:R1")]),
        ]);
        let resolver = temp_resolver(&temp, fetcher);

        let tree = resolver
            .resolve_tree(&"GSE1".parse().unwrap(), ResolveOptions::default())
            .unwrap();
        assert_eq!(tree.samples.len(), 1);
        assert_eq!(tree.runs.len(), 1);
        assert_eq!(tree.failures.len(), 1);
        assert_eq!(tree.failures[0].id, "GSM2");
    }

    #[test]
    fn tree_fail_fast_aborts() {
        let temp = tempfile::tempdir().unwrap();
        let fetcher = MapFetcher::new(vec![(
            "GSE1",
            vec![("child_sample_ids", "GSM1")],
        )]);
        let resolver = temp_resolver(&temp, fetcher);
        let err = resolver
            .resolve_tree(&"GSE1".parse().unwrap(), ResolveOptions { fail_fast: true })
            .unwrap_err();
        assert_matches!(err, SeqstageError::Resolution { .. });
    }

    #[test]
    fn run_without_parent_anywhere_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let fetcher = MapFetcher::new(vec![("SRR9", vec![("file_type", "fastq")])]);
        let resolver = temp_resolver(&temp, fetcher);
        let err = resolver
            .resolve_run(&"SRR9".parse().unwrap(), None)
            .unwrap_err();
        assert_matches!(err, SeqstageError::InvalidAccession(_));
    }
}
