use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use seqstage::accession::Accession;
use seqstage::app::{App, DumpOptions, ProgressSink};
use seqstage::config::ConfigLoader;
use seqstage::dispatch::{JobBackend, SystemScriptRunner};
use seqstage::error::SeqstageError;
use seqstage::fetcher::GeoSoftFetcher;
use seqstage::output::{JsonOutput, OutputMode, StderrProgress};
use seqstage::project::Project;
use seqstage::registry::{CommandParams, CommandRegistry};
use seqstage::resolver::ResolveOptions;
use seqstage::store::AccessionStore;

#[derive(Parser)]
#[command(name = "seqstage")]
#[command(about = "Resolve sequencing-dataset accessions and stage their downloads across execution backends")]
#[command(version, author)]
struct Cli {
    /// Project root; defaults to the current directory.
    #[arg(long, global = true)]
    project: Option<String>,

    /// Accession table directory; defaults to ~/.cache/seqstage/db.
    #[arg(long, global = true)]
    db: Option<String>,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Resolve accessions into the local store (studies are walked down to runs)")]
    Add(AddArgs),
    #[command(about = "Partition pending run downloads and dispatch them")]
    Dump(DumpArgs),
    #[command(about = "List cached accessions")]
    List,
    #[command(about = "Show one cached record")]
    Info(InfoArgs),
}

#[derive(Args)]
struct AddArgs {
    accessions: Vec<String>,

    #[arg(long)]
    fail_fast: bool,
}

#[derive(Args)]
struct DumpArgs {
    /// Job backend: bash, nohup, or pbs@<server>.
    #[arg(long)]
    job: Option<String>,

    #[arg(long)]
    nthread: Option<usize>,

    /// Restrict the dump to these sample ids (comma separated).
    #[arg(long)]
    sample: Option<String>,

    /// Render job scripts without submitting them.
    #[arg(long)]
    norun: bool,
}

#[derive(Args)]
struct InfoArgs {
    accession: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<SeqstageError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SeqstageError) -> u8 {
    match error {
        SeqstageError::NotFound { .. } | SeqstageError::MissingConfig => 2,
        SeqstageError::Resolution { .. } | SeqstageError::Submit(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let project = match &cli.project {
        Some(root) => Project::new_with_root(Utf8PathBuf::from(root)),
        None => Project::new().into_diagnostic()?,
    };
    let store = match &cli.db {
        Some(root) => AccessionStore::new_with_root(Utf8PathBuf::from(root)),
        None => AccessionStore::new().into_diagnostic()?,
    };
    let fetcher = GeoSoftFetcher::new().into_diagnostic()?;
    let app = Arc::new(App::new(
        project.clone(),
        Arc::new(store),
        fetcher,
        SystemScriptRunner,
    ));

    let registry = build_registry(app, output_mode);
    let (name, params) = command_params(&cli.command);
    registry.dispatch(name, &params).into_diagnostic()?;
    Ok(())
}

fn command_params(command: &Commands) -> (&'static str, CommandParams) {
    let mut params = CommandParams::new();
    match command {
        Commands::Add(args) => {
            params.insert("accessions".to_string(), args.accessions.join(","));
            if args.fail_fast {
                params.insert("fail_fast".to_string(), "true".to_string());
            }
            ("add", params)
        }
        Commands::Dump(args) => {
            if let Some(job) = &args.job {
                params.insert("job".to_string(), job.clone());
            }
            if let Some(nthread) = args.nthread {
                params.insert("nthread".to_string(), nthread.to_string());
            }
            if let Some(sample) = &args.sample {
                params.insert("sample".to_string(), sample.clone());
            }
            if args.norun {
                params.insert("norun".to_string(), "true".to_string());
            }
            ("dump", params)
        }
        Commands::List => ("list", params),
        Commands::Info(args) => {
            params.insert("accession".to_string(), args.accession.clone());
            ("info", params)
        }
    }
}

type CliApp = App<GeoSoftFetcher, SystemScriptRunner>;

fn build_registry(app: Arc<CliApp>, output_mode: OutputMode) -> CommandRegistry {
    let mut registry = CommandRegistry::new();

    {
        let app = app.clone();
        registry.register("add", move |params| {
            let accessions = params
                .get("accessions")
                .map(String::as_str)
                .unwrap_or_default()
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(|part| part.parse::<Accession>())
                .collect::<Result<Vec<_>, _>>()?;
            let options = ResolveOptions {
                fail_fast: params.contains_key("fail_fast"),
            };
            let result = app.add(&accessions, options, sink(output_mode))?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_add(&result)
                    .map_err(|err| SeqstageError::Filesystem(err.to_string()))?,
                OutputMode::Text => print_add_summary(&result),
            }
            Ok(())
        });
    }

    {
        let app = app.clone();
        registry.register("dump", move |params| {
            let config = ConfigLoader::resolve(None).ok();
            let backend = match params.get("job") {
                Some(value) => value.parse::<JobBackend>()?,
                None => config
                    .as_ref()
                    .map(|resolved| resolved.backend.clone())
                    .unwrap_or(JobBackend::Immediate),
            };
            let nthread = match params.get("nthread") {
                Some(value) => value.parse::<usize>().map_err(|_| {
                    SeqstageError::ConfigParse(format!("nthread must be an integer, got {value}"))
                })?,
                None => config.as_ref().map(|resolved| resolved.nthread).unwrap_or(1),
            };
            let samples = params
                .get("sample")
                .map(|value| {
                    value
                        .split(',')
                        .filter(|part| !part.trim().is_empty())
                        .map(|part| part.parse())
                        .collect::<Result<Vec<_>, _>>()
                })
                .transpose()?;
            let options = DumpOptions {
                backend,
                nthread,
                samples,
                norun: params.contains_key("norun"),
            };
            let result = app.dump(&options, sink(output_mode))?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_dump(&result)
                    .map_err(|err| SeqstageError::Filesystem(err.to_string()))?,
                OutputMode::Text => print_dump_summary(&result),
            }
            Ok(())
        });
    }

    {
        let app = app.clone();
        registry.register("list", move |_params| {
            let result = app.list(sink(output_mode))?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_list(&result)
                    .map_err(|err| SeqstageError::Filesystem(err.to_string()))?,
                OutputMode::Text => print_list_summary(&result),
            }
            Ok(())
        });
    }

    {
        let app = app.clone();
        registry.register("info", move |params| {
            let accession = params
                .get("accession")
                .map(String::as_str)
                .unwrap_or_default()
                .parse::<Accession>()?;
            let result = app.info(&accession, sink(output_mode))?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_info(&result)
                    .map_err(|err| SeqstageError::Filesystem(err.to_string()))?,
                OutputMode::Text => print_info_summary(&result),
            }
            Ok(())
        });
    }

    registry
}

fn sink(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Text => &StderrProgress,
    }
}

fn print_add_summary(result: &seqstage::app::AddResult) {
    for item in &result.items {
        if item.samples > 0 || item.runs > 0 {
            println!(
                "added {} {} ({} samples, {} runs)",
                item.kind, item.id, item.samples, item.runs
            );
        } else {
            println!("added {} {}", item.kind, item.id);
        }
    }
    for failure in &result.failures {
        println!("failed {}: {}", failure.id, failure.message);
    }
}

fn print_dump_summary(result: &seqstage::app::DumpResult) {
    println!("work items: {}", result.work_items);
    for skipped in &result.skipped {
        println!("skipped {skipped} (already dumped)");
    }
    if let Some(job_dir) = &result.report.job_dir {
        println!("job dir: {job_dir}");
    }
    for outcome in &result.report.slot_outcomes {
        match &outcome.message {
            Some(message) => println!("slot {}: {:?} ({message})", outcome.slot, outcome.status),
            None => println!("slot {}: {:?}", outcome.slot, outcome.status),
        }
    }
}

fn print_list_summary(result: &seqstage::app::ListResult) {
    for entry in &result.studies {
        println!("study  {}  {}", entry.id, entry.detail);
    }
    for entry in &result.samples {
        println!("sample {}  {}", entry.id, entry.detail);
    }
    for entry in &result.runs {
        println!("run    {}  {}", entry.id, entry.detail);
    }
}

fn print_info_summary(result: &seqstage::app::InfoResult) {
    println!("{} {}", result.kind, result.id);
    for field in &result.fields {
        println!("  {} = {}", field.name, field.value);
    }
}
