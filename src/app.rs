use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::accession::{Accession, SampleId};
use crate::dispatch::{DispatchOptions, DispatchReport, JobBackend, JobDispatcher, ScriptRunner};
use crate::error::SeqstageError;
use crate::fetcher::MetadataFetcher;
use crate::partition::WorkItem;
use crate::project::Project;
use crate::record::{RunFileType, RunRecord, SampleRecord, StudyRecord, TableRecord};
use crate::resolver::{AccessionResolver, ResolveOptions};
use crate::store::AccessionStore;
use crate::template::TemplateEngine;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct AddResult {
    pub items: Vec<AddedItem>,
    pub failures: Vec<FailureEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddedItem {
    pub kind: String,
    pub id: String,
    pub samples: usize,
    pub runs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureEntry {
    pub id: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DumpOptions {
    pub backend: JobBackend,
    pub nthread: usize,
    pub samples: Option<Vec<SampleId>>,
    pub norun: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DumpResult {
    pub report: DispatchReport,
    pub skipped: Vec<String>,
    pub work_items: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub id: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub studies: Vec<ListEntry>,
    pub samples: Vec<ListEntry>,
    pub runs: Vec<ListEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub kind: String,
    pub id: String,
    pub fields: Vec<FieldEntry>,
}

pub const DUMP_STAGE: &str = "0_dump";

pub struct App<F: MetadataFetcher, R: ScriptRunner> {
    project: Project,
    store: Arc<AccessionStore>,
    resolver: AccessionResolver<F>,
    dispatcher: JobDispatcher<R>,
}

impl<F: MetadataFetcher, R: ScriptRunner> App<F, R> {
    pub fn new(project: Project, store: Arc<AccessionStore>, fetcher: F, runner: R) -> Self {
        let resolver = AccessionResolver::new(store.clone(), fetcher);
        let templates = TemplateEngine::with_root(project.templates_dir());
        let dispatcher = JobDispatcher::new(project.clone(), templates, runner);
        Self {
            project,
            store,
            resolver,
            dispatcher,
        }
    }

    pub fn add(
        &self,
        accessions: &[Accession],
        options: ResolveOptions,
        sink: &dyn ProgressSink,
    ) -> Result<AddResult, SeqstageError> {
        let mut items = Vec::new();
        let mut failures = Vec::new();
        for accession in accessions {
            sink.event(ProgressEvent {
                message: format!("phase=Resolve; {accession}"),
                elapsed: None,
            });
            match accession {
                Accession::Study(id) => match self.resolver.resolve_tree(id, options) {
                    Ok(tree) => {
                        for failure in tree.failures {
                            failures.push(FailureEntry {
                                id: failure.id,
                                message: failure.error.to_string(),
                            });
                        }
                        items.push(AddedItem {
                            kind: accession.kind().to_string(),
                            id: accession.id().to_string(),
                            samples: tree.samples.len(),
                            runs: tree.runs.len(),
                        });
                    }
                    Err(error) => failures.push(FailureEntry {
                        id: accession.id().to_string(),
                        message: error.to_string(),
                    }),
                },
                other => match self.resolver.resolve(other) {
                    Ok(_) => items.push(AddedItem {
                        kind: other.kind().to_string(),
                        id: other.id().to_string(),
                        samples: 0,
                        runs: 0,
                    }),
                    Err(error) => failures.push(FailureEntry {
                        id: other.id().to_string(),
                        message: error.to_string(),
                    }),
                },
            }
        }
        Ok(AddResult { items, failures })
    }

    /// Builds the per-run download work list for every target sample and
    /// dispatches it through the configured backend.
    pub fn dump(
        &self,
        options: &DumpOptions,
        sink: &dyn ProgressSink,
    ) -> Result<DumpResult, SeqstageError> {
        sink.event(ProgressEvent {
            message: "phase=Resolve; collecting target samples".to_string(),
            elapsed: None,
        });
        let samples: Vec<SampleRecord> = match &options.samples {
            Some(ids) => ids
                .iter()
                .map(|id| self.store.get::<SampleRecord>(id.as_str()))
                .collect::<Result<_, _>>()?,
            None => self.target_samples()?,
        };

        let mut skipped = Vec::new();
        let mut work_items = Vec::new();
        for sample in &samples {
            if self.project.is_dumped(&sample.accession_id) {
                warn!(sample = %sample.accession_id, "sample already dumped; skipping");
                skipped.push(sample.accession_id.to_string());
                continue;
            }
            self.project.ensure_sample_dirs(&sample.accession_id)?;
            for (index, run_id) in sample.child_run_ids.iter().enumerate() {
                let run = self
                    .resolver
                    .resolve_run(run_id, Some(&sample.accession_id))?;
                work_items.push(build_work_item(&self.project, sample, &run, index));
            }
        }

        let report = self.dispatcher.dispatch(
            DUMP_STAGE,
            &work_items,
            &options.backend,
            options.nthread,
            DispatchOptions {
                require_work: false,
                norun: options.norun,
            },
            sink,
        )?;

        Ok(DumpResult {
            report,
            skipped,
            work_items: work_items.len(),
        })
    }

    /// Children resolve concurrently, so sample table order follows thread
    /// completion. Dump order instead follows the parent study records, with
    /// orphan samples (added directly) appended in table order.
    fn target_samples(&self) -> Result<Vec<SampleRecord>, SeqstageError> {
        let mut ordered = Vec::new();
        let mut seen = HashSet::new();
        for study in self.store.all::<StudyRecord>()? {
            for sample_id in &study.child_sample_ids {
                if self.store.exists::<SampleRecord>(sample_id.as_str())?
                    && seen.insert(sample_id.clone())
                {
                    ordered.push(self.store.get::<SampleRecord>(sample_id.as_str())?);
                }
            }
        }
        for sample in self.store.all::<SampleRecord>()? {
            if seen.insert(sample.accession_id.clone()) {
                ordered.push(sample);
            }
        }
        Ok(ordered)
    }

    pub fn list(&self, sink: &dyn ProgressSink) -> Result<ListResult, SeqstageError> {
        sink.event(ProgressEvent {
            message: "phase=Store; scanning accession tables".to_string(),
            elapsed: None,
        });
        let studies = self
            .store
            .all::<StudyRecord>()?
            .into_iter()
            .map(|record| ListEntry {
                id: record.accession_id.to_string(),
                detail: record.title,
            })
            .collect();
        let samples = self
            .store
            .all::<SampleRecord>()?
            .into_iter()
            .map(|record| ListEntry {
                id: record.accession_id.to_string(),
                detail: record.title,
            })
            .collect();
        let runs = self
            .store
            .all::<RunRecord>()?
            .into_iter()
            .map(|record| ListEntry {
                id: record.accession_id.to_string(),
                detail: format!("{} {}", record.parent_sample_id, record.file_type),
            })
            .collect();
        Ok(ListResult {
            studies,
            samples,
            runs,
        })
    }

    pub fn info(
        &self,
        accession: &Accession,
        sink: &dyn ProgressSink,
    ) -> Result<InfoResult, SeqstageError> {
        sink.event(ProgressEvent {
            message: format!("phase=Store; looking up {accession}"),
            elapsed: None,
        });
        let fields = match accession {
            Accession::Study(id) => record_fields::<StudyRecord>(&self.store, id.as_str())?,
            Accession::Sample(id) => record_fields::<SampleRecord>(&self.store, id.as_str())?,
            Accession::Run(id) => record_fields::<RunRecord>(&self.store, id.as_str())?,
        };
        Ok(InfoResult {
            kind: accession.kind().to_string(),
            id: accession.id().to_string(),
            fields,
        })
    }
}

fn record_fields<R: TableRecord>(
    store: &AccessionStore,
    id: &str,
) -> Result<Vec<FieldEntry>, SeqstageError> {
    let record = store.get::<R>(id)?;
    Ok(R::SCHEMA
        .iter()
        .zip(record.to_row())
        .map(|(name, value)| FieldEntry {
            name: (*name).to_string(),
            value,
        })
        .collect())
}

/// Mirrors the raw dump layout: fastq runs prefetch + fasterq-dump into the
/// sample's raw directory and rename each read file into fastqs/ with the
/// `<sample>_S<k>_<lane>_<read>` convention; bam runs are a plain wget.
fn build_work_item(
    project: &Project,
    sample: &SampleRecord,
    run: &RunRecord,
    index: usize,
) -> WorkItem {
    let raw_dir = project.sample_raw_dir(&sample.accession_id);
    let command = match run.file_type {
        RunFileType::Fastq => {
            let mut command = format!(
                "cd {raw_dir} && prefetch {run} && fasterq-dump {run} --split-files && gzip -f {run}_*.fastq",
                run = run.accession_id
            );
            for segment in &run.segments {
                command.push_str(&format!(
                    " && mv {run}_{n}.fastq.gz fastqs/{sample}_S{tag}_{lane}_{read}.fastq.gz",
                    run = run.accession_id,
                    n = segment.read.raw_index(),
                    sample = sample.accession_id,
                    tag = index + 1,
                    lane = segment.lane,
                    read = segment.read,
                ));
            }
            command
        }
        RunFileType::Bam => format!(
            "cd {raw_dir} && wget {location} -O {run}.bam",
            location = run.location,
            run = run.accession_id
        ),
    };
    WorkItem {
        run_id: run.accession_id.clone(),
        command,
    }
}
