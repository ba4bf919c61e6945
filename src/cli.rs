// Copyright 2025 Fernando Borretti
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs::create_dir_all;
use std::fs::read_to_string;
use std::fs::write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use cardsmith_core::orchestrator::Pipeline;
use cardsmith_core::orchestrator::RunOutcome;
use cardsmith_core::registry::CardFormat;
use cardsmith_core::store::RunStore;
use cardsmith_core::types::document::Document;
use cardsmith_core::types::run::PipelineRun;
use cardsmith_core::types::run::RunId;
use cardsmith_core::validate::ValidationReport;
use cardsmith_core::validate::Validator;
use cardsmith_core::validate::first_failure;
use clap::Parser;
use clap::Subcommand;

use crate::config::Config;
use crate::db::SqliteRunStore;
use crate::error::ErrorReport;
use crate::error::Fallible;
use crate::error::fail;
use crate::generator::CommandGenerator;

type CliPipeline = Pipeline<CommandGenerator, SqliteRunStore>;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file. By default, `cardsmith.toml` in the current directory is used if it exists.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Turn a document into flashcard exports.
    Run {
        /// Path to the document, read as UTF-8 text.
        file: String,
        /// Card format for modules without a configured format.
        #[arg(long)]
        format: Option<CardFormat>,
        /// Directory to write the exports to. Default is the current directory.
        #[arg(long)]
        output: Option<String>,
    },
    /// Continue a failed or interrupted run from its first incomplete stage,
    /// with the configuration it was started with.
    Resume {
        run_id: String,
        /// Directory to write the exports to. Default is the current directory.
        #[arg(long)]
        output: Option<String>,
    },
    /// Cancel a run. A running run stops at the next stage boundary.
    Cancel { run_id: String },
    /// Print the state of a run.
    Status { run_id: String },
    /// Delete a run and everything stored for it.
    Delete {
        run_id: String,
        /// Delete the run even if it may still be executing.
        #[arg(long)]
        force: bool,
    },
    /// List all runs.
    List,
    /// Write the exports of a completed run.
    Export {
        run_id: String,
        /// Directory to write the exports to. Default is the current directory.
        #[arg(long)]
        output: Option<String>,
    },
    /// Validate an existing export file (levels 1 to 5).
    Check {
        /// Path to the export file.
        file: String,
        /// Format of the file. By default, it is read from the header lines.
        #[arg(long)]
        format: Option<CardFormat>,
    },
}

pub async fn entrypoint() -> Fallible<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    match cli.command {
        Command::Run {
            file,
            format,
            output,
        } => {
            if let Some(format) = format {
                config.pipeline.default_format = format;
            }
            let document = read_document(&file)?;
            let pipeline = open_pipeline(config)?;
            let run_id = pipeline.start(&document)?;
            println!("Started run {run_id}.");
            finish(&pipeline, &run_id, output).await
        }
        Command::Resume { run_id, output } => {
            let pipeline = open_pipeline(config)?;
            let run_id = RunId::new(run_id);
            finish(&pipeline, &run_id, output).await
        }
        Command::Cancel { run_id } => {
            let pipeline = open_pipeline(config)?;
            let run = pipeline.cancel(&RunId::new(run_id))?;
            print_status(&run);
            Ok(())
        }
        Command::Status { run_id } => {
            let pipeline = open_pipeline(config)?;
            print_status(&pipeline.status(&RunId::new(run_id))?);
            Ok(())
        }
        Command::Delete { run_id, force } => {
            let pipeline = open_pipeline(config)?;
            let run = pipeline.delete(&RunId::new(run_id), force)?;
            println!("Deleted run {} ({}).", run.run_id, run.state);
            Ok(())
        }
        Command::List => {
            let store = SqliteRunStore::open(&config.store.path)?;
            for run in store.list_runs()? {
                println!(
                    "{}  {:<10}  {}  {}",
                    run.run_id,
                    run.state.to_string(),
                    run.updated_at,
                    run.document_id
                );
            }
            Ok(())
        }
        Command::Export { run_id, output } => {
            let pipeline = open_pipeline(config)?;
            let run_id = RunId::new(run_id);
            match pipeline.outcome(&run_id)? {
                Some(outcome) => write_artifacts(&outcome, output),
                None => fail(format!("run {run_id} has not completed.")),
            }
        }
        Command::Check { file, format } => check_file(&file, format),
    }
}

fn open_pipeline(config: Config) -> Fallible<Arc<CliPipeline>> {
    let store = SqliteRunStore::open(&config.store.path)?;
    let generator = CommandGenerator::new(&config.generator);
    let pipeline = Pipeline::new(Arc::new(generator), Arc::new(store), config.pipeline)?;
    Ok(Arc::new(pipeline))
}

fn read_document(file: &str) -> Fallible<Document> {
    let path = Path::new(file);
    if !path.exists() {
        return fail(format!("document {file} does not exist."));
    }
    let id = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    Ok(Document::new(id, read_to_string(path)?))
}

/// Drive the run to the end. Ctrl-C requests cancellation, which takes
/// effect once the stage in flight finishes.
async fn finish(
    pipeline: &Arc<CliPipeline>,
    run_id: &RunId,
    output: Option<String>,
) -> Fallible<()> {
    let watcher = {
        let pipeline = Arc::clone(pipeline);
        let run_id = run_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted: run {run_id} stops after the current stage.");
                if let Err(e) = pipeline.cancel(&run_id) {
                    log::error!("Failed to cancel run {run_id}: {e}");
                }
            }
        })
    };
    let result = pipeline.resume(run_id).await;
    watcher.abort();
    match result {
        Ok(outcome) => {
            for warning in &outcome.warnings {
                println!("warning: {warning}");
            }
            print_reports(&outcome.reports);
            write_artifacts(&outcome, output)
        }
        Err(e) => {
            if let Ok(run) = pipeline.status(run_id) {
                print_status(&run);
            }
            Err(e.into())
        }
    }
}

fn write_artifacts(outcome: &RunOutcome, output: Option<String>) -> Fallible<()> {
    let directory = PathBuf::from(output.unwrap_or_else(|| ".".to_string()));
    create_dir_all(&directory)?;
    if outcome.artifacts.is_empty() {
        println!("Run {} produced no cards.", outcome.run.run_id);
    }
    for artifact in &outcome.artifacts {
        let path = directory.join(artifact.file_name(&outcome.run.document_id));
        write(&path, &artifact.text)?;
        println!(
            "Wrote {} {} cards to {}.",
            artifact.cards,
            artifact.format,
            path.display()
        );
    }
    Ok(())
}

fn print_status(run: &PipelineRun) {
    println!(
        "Run {} (document {}): {} at version {}.",
        run.run_id, run.document_id, run.state, run.version
    );
    for record in &run.stages {
        println!(
            "  {:<11} {:<10} attempts: {}",
            record.stage.to_string(),
            record.status.to_string(),
            record.attempts
        );
    }
    if run.cancel_requested && !run.is_terminal() {
        println!("Cancellation requested.");
    }
    if let Some(failure) = &run.failure {
        let stage = failure
            .stage
            .map_or("before any stage".to_string(), |stage| format!("at stage {stage}"));
        let module = failure
            .module
            .map_or(String::new(), |module| format!(" (module {module})"));
        println!("Failed {stage}{module}: {}", failure.reason);
    }
    for warning in &run.warnings {
        println!("warning: {warning}");
    }
    print_reports(&run.reports);
}

fn print_reports(reports: &[ValidationReport]) {
    for report in reports {
        let verdict = if report.passed { "passed" } else { "FAILED" };
        println!(
            "{} export, level {} ({}): {verdict}",
            report.format,
            report.level,
            report.name()
        );
        for violation in &report.violations {
            println!("    {violation}");
        }
    }
}

fn check_file(file: &str, format: Option<CardFormat>) -> Fallible<()> {
    let text = read_to_string(file)?;
    let format = format.unwrap_or_else(|| sniff_format(&text));
    let validator = Validator::new()?;
    let reports = validator.check_file(format, &text);
    print_reports(&reports);
    match first_failure(&reports) {
        Some(error) => Err(ErrorReport::from(error)),
        None => Ok(()),
    }
}

/// Cloze exports declare their note type in the header.
fn sniff_format(text: &str) -> CardFormat {
    let cloze = text
        .lines()
        .take_while(|line| line.starts_with('#'))
        .any(|line| line == "#notetype:Cloze");
    if cloze {
        CardFormat::Cloze
    } else {
        CardFormat::Basic
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_sniff_format() {
        assert_eq!(
            sniff_format("#separator:;\n#html:true\n#notetype:Cloze\n{{c1::a}} b\n"),
            CardFormat::Cloze
        );
        assert_eq!(sniff_format("#separator:;\n#html:true\nQ;A\n"), CardFormat::Basic);
    }

    #[test]
    fn test_check_file() -> Fallible<()> {
        let dir = tempdir()?;
        let good = dir.path().join("good.txt");
        write(&good, "#separator:;\n#html:true\nQ;\"a; b\"\n")?;
        check_file(&good.to_string_lossy(), None)?;
        let bad = dir.path().join("bad.txt");
        write(&bad, "#separator:;\n#html:true\nQ;A;B\n")?;
        let err = check_file(&bad.to_string_lossy(), None).err();
        assert!(err.is_some_and(|e| e.to_string().contains("validation level 2 failed")));
        Ok(())
    }

    #[test]
    fn test_delete_takes_force_flag() -> Fallible<()> {
        let cli = Cli::try_parse_from(["cardsmith", "delete", "run-1", "--force"])
            .map_err(|e| ErrorReport::new(e.to_string()))?;
        assert!(matches!(
            cli.command,
            Command::Delete { ref run_id, force: true } if run_id == "run-1"
        ));
        let cli = Cli::try_parse_from(["cardsmith", "delete", "run-1"])
            .map_err(|e| ErrorReport::new(e.to_string()))?;
        assert!(matches!(cli.command, Command::Delete { force: false, .. }));
        Ok(())
    }

    #[test]
    fn test_document_id_is_file_stem() -> Fallible<()> {
        let dir = tempdir()?;
        let path = dir.path().join("moore-machines.md");
        write(&path, "A Moore machine is a finite-state machine.")?;
        let document = read_document(&path.to_string_lossy())?;
        assert_eq!(document.id(), "moore-machines");
        assert!(read_document("/no/such/file.md").is_err());
        Ok(())
    }
}
