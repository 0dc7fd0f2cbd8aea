//! Administrative command line for the feedback and retrain lifecycle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use refeed::lifecycle::{FeedbackSubmission, Lifecycle};
use refeed::store::{Correctness, LabelRef, Page};
use refeed::training::{JobState, RetrainReport};

const RETRAIN_WAIT: Duration = Duration::from_secs(60 * 60);
const CANCEL_WAIT: Duration = Duration::from_secs(30);

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    Labels,
    AddLabel(String),
    DeleteLabel { id: i64, cascade: bool },
    Submit {
        image: PathBuf,
        label: String,
        correctness: Correctness,
    },
    Feedback(Page),
    Predict(PathBuf),
    Retrain,
    Stats,
}

#[derive(Debug)]
struct Options {
    data_dir: Option<PathBuf>,
    command: Command,
}

fn run() -> Result<(), String> {
    let Some(options) = parse_args(std::env::args().skip(1).collect())? else {
        return Ok(());
    };
    if let Err(err) = refeed::logging::init() {
        eprintln!("Logging disabled: {err}");
    }
    let mut config = refeed::config::load_or_default().map_err(|err| err.to_string())?;
    if let Some(dir) = options.data_dir {
        config.data_dir = Some(dir);
    }
    let fallback = refeed::app_dirs::app_root_dir().map_err(|err| err.to_string())?;
    let lifecycle = Lifecycle::open(&config, &fallback).map_err(|err| err.to_string())?;
    execute(&lifecycle, options.command).map_err(|err| err.to_string())
}

fn execute(lifecycle: &Lifecycle, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Labels => {
            for summary in lifecycle.list_labels()? {
                println!(
                    "{:>5}  {:<24} {} samples",
                    summary.label.id, summary.label.name, summary.sample_count
                );
            }
        }
        Command::AddLabel(name) => {
            let label = lifecycle.create_label(&name)?;
            println!("Created label {} ({})", label.name, label.id);
        }
        Command::DeleteLabel { id, cascade } => {
            let deletion = lifecycle.delete_label(&LabelRef::Id(id), cascade)?;
            println!(
                "Deleted label {} ({} samples, {} files removed)",
                deletion.label.name, deletion.samples_removed, deletion.files_removed
            );
        }
        Command::Submit {
            image,
            label,
            correctness,
        } => {
            let bytes = read_image(&image)?;
            let submission = match correctness {
                Correctness::Correct => FeedbackSubmission {
                    image: &bytes,
                    correctness,
                    predicted_label: Some(label),
                    corrected_label: None,
                },
                _ => FeedbackSubmission {
                    image: &bytes,
                    correctness,
                    predicted_label: None,
                    corrected_label: Some(LabelRef::Name(label)),
                },
            };
            let sample = lifecycle.submit_feedback(submission)?;
            println!(
                "Stored sample {} at {} (token {})",
                sample.id,
                sample.image_path.display(),
                sample.token
            );
        }
        Command::Feedback(page) => {
            let page_result = lifecycle.list_feedback(page, None)?;
            for sample in &page_result.items {
                println!(
                    "{:>6}  {:<16} {:<10} {}",
                    sample.id,
                    sample.label.name,
                    format!("{:?}", sample.correctness).to_lowercase(),
                    sample.image_path.display()
                );
            }
            println!(
                "Showing {} of {} samples",
                page_result.items.len(),
                page_result.total
            );
        }
        Command::Predict(image) => {
            let bytes = read_image(&image)?;
            let outcome = lifecycle.predict(&bytes, None)?;
            println!(
                "{} ({:.1}%) model {}",
                outcome.prediction.label,
                outcome.prediction.confidence * 100.0,
                outcome.prediction.model_id
            );
        }
        Command::Retrain => {
            let report = retrain_to_completion(lifecycle)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stats => {
            let stats = lifecycle.system_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

/// Run a retrain and block until it ends.
///
/// The job thread dies with this process, so returning early would drop it
/// before promotion.
fn retrain_to_completion(
    lifecycle: &Lifecycle,
) -> Result<RetrainReport, Box<dyn std::error::Error>> {
    let id = lifecycle.trigger_retrain()?;
    tracing::info!("Waiting for retrain job {id}");
    let mut status = lifecycle.wait_for_retrain(&id, RETRAIN_WAIT)?;
    if matches!(status.state, JobState::Running) {
        lifecycle.cancel_retrain(&id);
        status = lifecycle.wait_for_retrain(&id, CANCEL_WAIT)?;
    }
    match status.state {
        JobState::Succeeded { report } => Ok(report),
        JobState::Failed { reason } => Err(format!("Retrain job {id} failed: {reason}").into()),
        JobState::Running => {
            Err(format!("Retrain job {id} did not stop after cancellation").into())
        }
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>, String> {
    std::fs::read(path).map_err(|err| format!("Failed to read {}: {err}", path.display()))
}

fn parse_args(args: Vec<String>) -> Result<Option<Options>, String> {
    if args.is_empty() || args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        return Ok(None);
    }
    let mut data_dir = None;
    let mut positional = Vec::new();
    let mut flags = Vec::new();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--data-dir" => {
                let value = it
                    .next()
                    .ok_or_else(|| "Missing value for --data-dir".to_string())?;
                data_dir = Some(PathBuf::from(value));
            }
            "--label" | "--offset" | "--limit" => {
                let value = it
                    .next()
                    .ok_or_else(|| format!("Missing value for {arg}"))?;
                flags.push((arg, Some(value)));
            }
            _ if arg.starts_with("--") => flags.push((arg, None)),
            _ => positional.push(arg),
        }
    }
    let command = parse_command(&positional, &flags)?;
    Ok(Some(Options { data_dir, command }))
}

fn parse_command(
    positional: &[String],
    flags: &[(String, Option<String>)],
) -> Result<Command, String> {
    let flag = |name: &str| flags.iter().any(|(key, _)| key == name);
    let value = |name: &str| {
        flags
            .iter()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| value.clone())
    };
    let (name, rest) = positional
        .split_first()
        .ok_or_else(|| "Missing command".to_string())?;
    let command = match (name.as_str(), rest) {
        ("labels", []) => Command::Labels,
        ("add-label", [label]) => Command::AddLabel(label.clone()),
        ("delete-label", [id]) => Command::DeleteLabel {
            id: id
                .parse()
                .map_err(|_| format!("Invalid label id: {id}"))?,
            cascade: flag("--cascade"),
        },
        ("submit", [image]) => {
            let label = value("--label").ok_or_else(|| "submit requires --label".to_string())?;
            let correctness = match (flag("--correct"), flag("--incorrect")) {
                (true, true) => return Err("Use only one of --correct and --incorrect".into()),
                (true, false) => Correctness::Correct,
                (false, true) => Correctness::Incorrect,
                (false, false) => Correctness::Unknown,
            };
            Command::Submit {
                image: PathBuf::from(image),
                label,
                correctness,
            }
        }
        ("feedback", []) => {
            let mut page = Page::default();
            if let Some(offset) = value("--offset") {
                page.offset = parse_count("--offset", &offset)?;
            }
            if let Some(limit) = value("--limit") {
                page.limit = parse_count("--limit", &limit)?;
            }
            Command::Feedback(page)
        }
        ("predict", [image]) => Command::Predict(PathBuf::from(image)),
        ("retrain", []) => Command::Retrain,
        ("stats", []) => Command::Stats,
        _ => return Err(format!("Unknown command or arguments: {}", positional.join(" "))),
    };
    Ok(command)
}

fn parse_count(name: &str, value: &str) -> Result<u64, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid value for {name}: {value}"))
}

fn print_help() {
    println!("Usage: refeed [--data-dir <path>] <command>");
    println!();
    println!("Commands:");
    println!("  labels                                   List labels with sample counts");
    println!("  add-label <name>                         Create a label");
    println!("  delete-label <id> [--cascade]            Delete a label (and its samples)");
    println!("  submit <image> --label <name> [--correct|--incorrect]");
    println!("                                           Store a feedback sample");
    println!("  feedback [--offset N] [--limit N]        List feedback, newest first");
    println!("  predict <image>                          Classify an image");
    println!("  retrain                                  Retrain and promote; waits for the job");
    println!("  stats                                    Show model and storage stats");
}
