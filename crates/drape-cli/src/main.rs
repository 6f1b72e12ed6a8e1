use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drape_contracts::assets::ImageAsset;
use drape_contracts::description::DescriptionDocument;
use drape_engine::{
    build_generation_instruction, build_simplified_instruction, error_chain_text, ConfigError,
    InputError, PipelineEngine, RefinementConfig,
};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "drape-rs", version, about = "Reference-guided outfit transfer pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Extract a structured outfit description from a reference image.
    Extract(ExtractArgs),
    /// Transfer the outfit from a reference image onto a target person.
    Transfer(TransferArgs),
    /// Render the generation instruction for a saved description, offline.
    PromptPreview(PromptPreviewArgs),
}

#[derive(Debug, Parser)]
struct ExtractArgs {
    /// Reference image showing the outfit.
    #[arg(long)]
    source: PathBuf,
    /// Run directory; receives description.json and events.jsonl.
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    analysis_model: Option<String>,
}

#[derive(Debug, Parser)]
struct TransferArgs {
    /// Reference image showing the outfit.
    #[arg(long)]
    reference: PathBuf,
    /// Photo of the person to dress.
    #[arg(long)]
    target: PathBuf,
    /// Previously extracted description.json; extracted fresh when omitted.
    #[arg(long)]
    description: Option<PathBuf>,
    /// Run directory; receives the artifact, outcome.json, and events.jsonl.
    #[arg(long)]
    out: PathBuf,
    /// Free-form instructions layered on top of the description.
    #[arg(long)]
    instructions: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    analysis_model: Option<String>,
    /// Generation backend identifier; repeat to set the fallback order.
    #[arg(long = "generation-model")]
    generation_models: Vec<String>,
    #[arg(long, default_value_t = 2)]
    max_rounds: u32,
    #[arg(long, default_value_t = 80)]
    accept_threshold: i64,
    #[arg(long, default_value_t = 8)]
    top_k_fixes: usize,
}

#[derive(Debug, Parser)]
struct PromptPreviewArgs {
    /// Saved description.json to render.
    #[arg(long)]
    description: PathBuf,
    #[arg(long)]
    instructions: Option<String>,
    /// Render the reduced fallback instruction instead of the full one.
    #[arg(long)]
    simplified: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!(
                "{}",
                json!({
                    "error": err.to_string(),
                    "details": error_chain_text(&err, 2048),
                })
            );
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Extract(args) => run_extract(args),
        Command::Transfer(args) => run_transfer(args),
        Command::PromptPreview(args) => run_prompt_preview(args),
    }
}

/// 2 for bad caller input, 3 for missing configuration, 1 otherwise.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<InputError>().is_some() {
        return 2;
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return 3;
    }
    1
}

fn run_extract(args: ExtractArgs) -> Result<i32> {
    let source = load_image(&args.source)?;
    let engine = PipelineEngine::new(&args.out, args.events, args.analysis_model, None)?;
    let description = engine.extract(&source)?;
    println!("{}", description.to_string_pretty());
    Ok(0)
}

fn run_transfer(args: TransferArgs) -> Result<i32> {
    let reference = load_image(&args.reference)?;
    let target = load_image(&args.target)?;
    let backends = if args.generation_models.is_empty() {
        None
    } else {
        Some(args.generation_models)
    };
    let engine = PipelineEngine::new(&args.out, args.events, args.analysis_model, backends)?;

    let description = match args.description {
        Some(path) => load_description(&path)?,
        None => engine.extract(&reference)?,
    };
    let config = RefinementConfig {
        max_rounds: args.max_rounds,
        accept_threshold: args.accept_threshold,
        top_k_fixes: args.top_k_fixes,
    };
    let result = engine.transfer(
        &reference,
        &target,
        &description,
        args.instructions.as_deref(),
        config,
    )?;

    println!(
        "{}",
        json!({
            "run_id": engine.run_id(),
            "outcome": result.outcome.as_str(),
            "best_score": result.best_score,
            "correction_rounds": result.correction_rounds.len(),
            "outcome_path": engine.run_dir().join("outcome.json").to_string_lossy(),
        })
    );
    // A run that never produced an image still wrote outcome.json; surface
    // the failure through the exit code.
    Ok(if result.best_image.is_some() { 0 } else { 1 })
}

fn run_prompt_preview(args: PromptPreviewArgs) -> Result<i32> {
    let description = load_description(&args.description)?;
    let instruction = if args.simplified {
        build_simplified_instruction(&description)
    } else {
        build_generation_instruction(&description, args.instructions.as_deref())
    };
    println!("{instruction}");
    Ok(0)
}

fn load_image(path: &Path) -> Result<ImageAsset> {
    ImageAsset::from_path(path)
        .with_context(|| InputError(format!("failed to read image {}", path.display())))
}

fn load_description(path: &Path) -> Result<DescriptionDocument> {
    let raw = fs::read_to_string(path)
        .with_context(|| InputError(format!("failed to read description {}", path.display())))?;
    DescriptionDocument::parse(&raw)
        .with_context(|| InputError(format!("unparsable description {}", path.display())))
}
