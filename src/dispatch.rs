use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::process::{Command, Stdio};
use std::str::FromStr;

use camino::Utf8Path;
use serde::Serialize;
use tracing::warn;

use crate::app::{ProgressEvent, ProgressSink};
use crate::error::SeqstageError;
use crate::partition::{self, ClampedSlotCount, WorkItem};
use crate::project::{self, Project};
use crate::template::{PBS_HEADER_TEMPLATE, TemplateEngine};

/// Execution strategy for dispatched slots, parsed once at the boundary from
/// the `bash` / `nohup` / `pbs@<server>` command-line forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobBackend {
    Immediate,
    Detached,
    ClusterQueue { server: String },
}

impl JobBackend {
    pub fn validate(&self) -> Result<(), SeqstageError> {
        if let JobBackend::ClusterQueue { server } = self {
            if server.trim().is_empty() {
                return Err(SeqstageError::MissingServerName);
            }
        }
        Ok(())
    }
}

impl fmt::Display for JobBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobBackend::Immediate => write!(f, "bash"),
            JobBackend::Detached => write!(f, "nohup"),
            JobBackend::ClusterQueue { server } => write!(f, "pbs@{server}"),
        }
    }
}

impl FromStr for JobBackend {
    type Err = SeqstageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("bash") {
            return Ok(JobBackend::Immediate);
        }
        if trimmed.eq_ignore_ascii_case("nohup") {
            return Ok(JobBackend::Detached);
        }
        if let Some((head, server)) = trimmed.split_once('@') {
            if head.eq_ignore_ascii_case("pbs") {
                let server = server.trim();
                if server.is_empty() {
                    return Err(SeqstageError::MissingServerName);
                }
                return Ok(JobBackend::ClusterQueue {
                    server: server.to_string(),
                });
            }
        } else if trimmed.eq_ignore_ascii_case("pbs") {
            return Err(SeqstageError::MissingServerName);
        }
        Err(SeqstageError::UnknownBackend(value.to_string()))
    }
}

/// Launches one rendered slot script. Split out so dispatch semantics can be
/// tested without spawning real processes.
pub trait ScriptRunner: Send + Sync {
    /// Runs the script to completion on the calling thread.
    fn run_blocking(&self, script: &Utf8Path) -> Result<(), SeqstageError>;
    /// Launches the script in the background; exit status is not observable.
    fn spawn_detached(&self, script: &Utf8Path, log: &Utf8Path) -> Result<(), SeqstageError>;
    /// Submits the script to the batch queue; only the submission outcome is
    /// observable.
    fn submit_queue(&self, script: &Utf8Path) -> Result<(), SeqstageError>;
}

pub struct SystemScriptRunner;

impl ScriptRunner for SystemScriptRunner {
    fn run_blocking(&self, script: &Utf8Path) -> Result<(), SeqstageError> {
        let status = Command::new("bash")
            .arg(script.as_std_path())
            .status()
            .map_err(|err| SeqstageError::Submit(err.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(SeqstageError::Submit(format!(
                "bash exited with {status} for {script}"
            )))
        }
    }

    fn spawn_detached(&self, script: &Utf8Path, log: &Utf8Path) -> Result<(), SeqstageError> {
        let stdout = File::create(log.as_std_path())
            .map_err(|err| SeqstageError::Filesystem(err.to_string()))?;
        let stderr = stdout
            .try_clone()
            .map_err(|err| SeqstageError::Filesystem(err.to_string()))?;
        Command::new("nohup")
            .arg("bash")
            .arg(script.as_std_path())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|err| SeqstageError::Submit(err.to_string()))?;
        Ok(())
    }

    fn submit_queue(&self, script: &Utf8Path) -> Result<(), SeqstageError> {
        let output = Command::new("qsub")
            .arg(script.as_std_path())
            .output()
            .map_err(|err| SeqstageError::Submit(err.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("qsub rejected {script}")
        } else {
            stderr
        };
        Err(SeqstageError::Submit(message))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    /// Fail with EmptyWork instead of returning an empty report.
    pub require_work: bool,
    /// Render and persist scripts but skip submission.
    pub norun: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Done,
    Rendered,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotOutcome {
    pub slot: usize,
    pub script: String,
    pub status: SlotStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub job_dir: Option<String>,
    pub slot_outcomes: Vec<SlotOutcome>,
    pub clamped: Option<ClampedSlotCount>,
}

impl DispatchReport {
    pub fn failed_slots(&self) -> usize {
        self.slot_outcomes
            .iter()
            .filter(|outcome| outcome.status == SlotStatus::Failed)
            .count()
    }
}

/// Drives partition → render → submit for one batch of work items. A failed
/// slot submission never blocks sibling slots; the report carries the rollup.
pub struct JobDispatcher<R: ScriptRunner> {
    project: Project,
    templates: TemplateEngine,
    runner: R,
}

impl<R: ScriptRunner> JobDispatcher<R> {
    pub fn new(project: Project, templates: TemplateEngine, runner: R) -> Self {
        Self {
            project,
            templates,
            runner,
        }
    }

    pub fn dispatch(
        &self,
        stage: &str,
        items: &[WorkItem],
        backend: &JobBackend,
        parallelism: usize,
        options: DispatchOptions,
        sink: &dyn ProgressSink,
    ) -> Result<DispatchReport, SeqstageError> {
        // Backend problems abort before anything is rendered or submitted.
        backend.validate()?;

        if items.is_empty() {
            if options.require_work {
                return Err(SeqstageError::EmptyWork);
            }
            return Ok(DispatchReport {
                job_dir: None,
                slot_outcomes: Vec::new(),
                clamped: None,
            });
        }

        let effective = match backend {
            JobBackend::Immediate if parallelism > 1 => {
                warn!(
                    requested = parallelism,
                    "immediate backend runs a single slot; forcing parallelism to 1"
                );
                1
            }
            _ if parallelism == 0 => {
                warn!("parallelism 0 treated as 1");
                1
            }
            _ => parallelism,
        };

        sink.event(ProgressEvent {
            message: format!(
                "phase=Partitioning; {} work items across {effective} slots",
                items.len()
            ),
            elapsed: None,
        });
        let plan = partition::partition(items, effective)?;
        if let Some(clamped) = plan.clamped {
            warn!(
                requested = clamped.requested,
                effective = clamped.effective,
                "more slots requested than work items; clamping"
            );
        }

        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
        let job_dir = self.project.job_dir(stage, &timestamp);
        let log_dir = job_dir.join("logs");
        project::ensure_dir(&log_dir)?;

        let mut scripts = Vec::with_capacity(plan.slots.len());
        for slot in &plan.slots {
            sink.event(ProgressEvent {
                message: format!("phase=Rendering; slot {}", slot.index),
                elapsed: None,
            });
            let script_path = job_dir.join(format!("cluster{}.sh", slot.index));
            let log_path = log_dir.join(format!("cluster{}.log", slot.index));
            let header = match backend {
                JobBackend::ClusterQueue { server } => {
                    let mut params = BTreeMap::new();
                    params.insert("cluster".to_string(), server.clone());
                    params.insert(
                        "jobname".to_string(),
                        format!("{stage}_cluster{}", slot.index),
                    );
                    params.insert("nthread".to_string(), "1".to_string());
                    params.insert("log".to_string(), log_path.to_string());
                    self.templates.render(PBS_HEADER_TEMPLATE, &params)?
                }
                JobBackend::Immediate | JobBackend::Detached => String::new(),
            };
            let commands: Vec<&str> = slot
                .items
                .iter()
                .map(|item| item.command.as_str())
                .collect();
            let mut text = header;
            text.push_str(&commands.join("\n"));
            text.push('\n');
            project::write_bytes_atomic(&script_path, text.as_bytes())?;
            scripts.push((slot.index, script_path, log_path));
        }

        let mut slot_outcomes = Vec::with_capacity(scripts.len());
        for (index, script, log) in scripts {
            if options.norun {
                slot_outcomes.push(SlotOutcome {
                    slot: index,
                    script: script.to_string(),
                    status: SlotStatus::Rendered,
                    message: None,
                });
                continue;
            }
            sink.event(ProgressEvent {
                message: format!("phase=Submitting; slot {index} via {backend}"),
                elapsed: None,
            });
            let result = match backend {
                JobBackend::Immediate => self.runner.run_blocking(&script),
                JobBackend::Detached => self.runner.spawn_detached(&script, &log),
                JobBackend::ClusterQueue { .. } => self.runner.submit_queue(&script),
            };
            let outcome = match result {
                Ok(()) => SlotOutcome {
                    slot: index,
                    script: script.to_string(),
                    status: SlotStatus::Done,
                    message: None,
                },
                Err(err) => {
                    warn!(slot = index, error = %err, "slot submission failed");
                    SlotOutcome {
                        slot: index,
                        script: script.to_string(),
                        status: SlotStatus::Failed,
                        message: Some(err.to_string()),
                    }
                }
            };
            slot_outcomes.push(outcome);
        }

        Ok(DispatchReport {
            job_dir: Some(job_dir.to_string()),
            slot_outcomes,
            clamped: plan.clamped,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_backends() {
        assert_eq!("bash".parse::<JobBackend>().unwrap(), JobBackend::Immediate);
        assert_eq!(
            "nohup".parse::<JobBackend>().unwrap(),
            JobBackend::Detached
        );
        assert_eq!(
            "PBS@cosmos".parse::<JobBackend>().unwrap(),
            JobBackend::ClusterQueue {
                server: "cosmos".to_string()
            }
        );
    }

    #[test]
    fn pbs_without_server_is_rejected() {
        assert_matches!(
            "pbs".parse::<JobBackend>(),
            Err(SeqstageError::MissingServerName)
        );
        assert_matches!(
            "pbs@".parse::<JobBackend>(),
            Err(SeqstageError::MissingServerName)
        );
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert_matches!(
            "slurm".parse::<JobBackend>(),
            Err(SeqstageError::UnknownBackend(_))
        );
    }

    #[test]
    fn backend_round_trips_through_display() {
        for text in ["bash", "nohup", "pbs@cosmos"] {
            let backend: JobBackend = text.parse().unwrap();
            assert_eq!(backend.to_string(), text);
        }
    }
}
