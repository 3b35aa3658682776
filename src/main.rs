use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::Parser;

use glossworks::config::resolve_service;
use glossworks::document::Document;
use glossworks::pipeline::{
    init_default_config, range_is_valid, AnnotationPipeline, BatchSelection, PipelineConfig,
    SharedDocument,
};
use glossworks::progress::ConsoleProgress;
use glossworks::service::HttpAnnotationClient;
use glossworks::splitter::{batch_bounds, find_split_points, BatchBounds};
use glossworks::stats;
use glossworks::tokenizer::{tokenize, tokenize_into, Token};

#[derive(Parser, Debug)]
#[command(name = "glossworks")]
#[command(about = "Batched word annotation via an LLM service, with a resumable word database", long_about = None)]
struct Args {
    /// Generate default config + prompt files, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write config/prompt files (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite existing config/prompt files when used with --init-config
    #[arg(long)]
    force: bool,

    /// Input text file (fresh run / --initialize-only)
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Output/progress JSON document (default: resume file, else <input>.gloss.json)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Saved document to resume from / operate on
    #[arg(short, long, value_name = "FILE")]
    resume_from: Option<PathBuf>,

    /// Config file path (default: search for glossworks.toml upwards)
    #[arg(long, value_name = "TOML")]
    config: Option<PathBuf>,

    /// Tokenize, create pending entries, compute stats, save. No network.
    #[arg(long)]
    initialize_only: bool,

    /// Report per-batch processed/unprocessed status and exit
    #[arg(long)]
    check_status: bool,

    /// Re-annotate a word range, e.g. 42-55
    #[arg(long, value_name = "START-END")]
    reprocess_range: Option<String>,

    /// Reset one batch back to pending
    #[arg(long, value_name = "N")]
    clear_batch: Option<usize>,

    /// Reset a word range back to pending, e.g. 42-55
    #[arg(long, value_name = "START-END")]
    clear_range: Option<String>,

    /// Process unprocessed batches only up to this batch number
    #[arg(short = 'u', long, value_name = "N")]
    up_to_batch: Option<usize>,

    /// Process specific batch numbers (comma-separated, e.g. 3,7,12)
    #[arg(long, value_name = "CSV")]
    process_batches: Option<String>,

    /// Target words per batch (overrides config)
    #[arg(short, long, value_name = "N")]
    batch_size: Option<u32>,

    /// Max concurrent service calls (overrides config)
    #[arg(short, long, value_name = "N")]
    concurrency: Option<usize>,

    /// Service model name (overrides config)
    #[arg(long)]
    model: Option<String>,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Clone, Debug, PartialEq)]
enum RunMode {
    Fresh,
    Initialize,
    Resume,
    CheckStatus,
    Reprocess(u32, u32),
    ClearBatch(usize),
    ClearRange(u32, u32),
}

fn parse_word_range(raw: &str) -> anyhow::Result<(u32, u32)> {
    let (a, b) = raw
        .split_once('-')
        .ok_or_else(|| anyhow!("invalid range {raw:?}: use START-END, e.g. 42-55"))?;
    let start: u32 = a.trim().parse().context("range start")?;
    let end: u32 = b.trim().parse().context("range end")?;
    Ok((start, end))
}

fn determine_mode(args: &Args) -> anyhow::Result<RunMode> {
    let exclusive = [
        args.initialize_only,
        args.check_status,
        args.reprocess_range.is_some(),
        args.clear_batch.is_some(),
        args.clear_range.is_some(),
    ];
    if exclusive.iter().filter(|b| **b).count() > 1 {
        return Err(anyhow!(
            "--initialize-only, --check-status, --reprocess-range, --clear-batch and --clear-range are mutually exclusive"
        ));
    }
    let limited = args.up_to_batch.is_some() || args.process_batches.is_some();
    if limited && exclusive.iter().any(|b| *b) {
        return Err(anyhow!(
            "--up-to-batch/--process-batches only apply to fresh or resumed runs"
        ));
    }
    if args.up_to_batch.is_some() && args.process_batches.is_some() {
        return Err(anyhow!(
            "--up-to-batch and --process-batches cannot be used together"
        ));
    }

    if args.initialize_only {
        return Ok(RunMode::Initialize);
    }
    if args.check_status {
        return Ok(RunMode::CheckStatus);
    }
    if let Some(raw) = &args.reprocess_range {
        let (start, end) = parse_word_range(raw)?;
        return Ok(RunMode::Reprocess(start, end));
    }
    if let Some(n) = args.clear_batch {
        return Ok(RunMode::ClearBatch(n));
    }
    if let Some(raw) = &args.clear_range {
        let (start, end) = parse_word_range(raw)?;
        return Ok(RunMode::ClearRange(start, end));
    }
    if args.resume_from.is_some() {
        return Ok(RunMode::Resume);
    }
    Ok(RunMode::Fresh)
}

fn batch_selection(args: &Args) -> anyhow::Result<BatchSelection> {
    if let Some(limit) = args.up_to_batch {
        return Ok(BatchSelection::UpTo(limit));
    }
    if let Some(csv) = &args.process_batches {
        let mut set = BTreeSet::new();
        for part in csv.split(',') {
            let n: usize = part
                .trim()
                .parse()
                .with_context(|| format!("invalid batch number {:?} in --process-batches", part))?;
            set.insert(n);
        }
        return Ok(BatchSelection::Explicit(set));
    }
    Ok(BatchSelection::All)
}

struct Prepared {
    doc: Document,
    tokens: Vec<Token>,
    total_words: u32,
    batches: Vec<BatchBounds>,
}

fn prepare(args: &Args, mode: &RunMode, pipeline_cfg: &PipelineConfig) -> anyhow::Result<Prepared> {
    let mut doc;
    let tokens;
    let total_words;
    match mode {
        RunMode::Fresh | RunMode::Initialize => {
            let input = args
                .input
                .as_ref()
                .ok_or_else(|| anyhow!("missing -i/--input for a fresh run"))?;
            let text = std::fs::read_to_string(input)
                .with_context(|| format!("read input: {}", input.display()))?;
            doc = Document::from_text(&text);
            let (t, n) = tokenize_into(&text, &mut doc.word_database);
            tokens = t;
            total_words = n;
            stats::recalculate(&mut doc.word_database);
        }
        _ => {
            let resume = args
                .resume_from
                .as_ref()
                .ok_or_else(|| anyhow!("this mode needs -r/--resume-from"))?;
            doc = Document::load(resume)?;
            let (t, n) = tokenize(&doc.input_text);
            tokens = t;
            total_words = n;
        }
    }
    if total_words == 0 {
        return Err(anyhow!("no words found in the input text"));
    }
    let points = find_split_points(&tokens, total_words, pipeline_cfg.split);
    let batches = batch_bounds(&tokens, &points);
    Ok(Prepared {
        doc,
        tokens,
        total_words,
        batches,
    })
}

fn output_path(args: &Args) -> PathBuf {
    if let Some(out) = &args.output {
        return out.clone();
    }
    if let Some(resume) = &args.resume_from {
        return resume.clone();
    }
    match &args.input {
        Some(input) => {
            let stem = input
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("output");
            input.with_file_name(format!("{stem}.gloss.json"))
        }
        None => PathBuf::from("glossworks.json"),
    }
}

fn processed_flags(shared: &SharedDocument, batches: &[BatchBounds]) -> Vec<bool> {
    batches
        .iter()
        .map(|b| shared.is_batch_annotated(&b.word_keys))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let progress = ConsoleProgress::new(!args.quiet);

    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let mode = determine_mode(&args)?;
    let workdir = args
        .input
        .as_deref()
        .or(args.resume_from.as_deref())
        .and_then(Path::parent)
        .map(|p| p.to_path_buf())
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));

    let (pipeline_cfg, app_cfg, _cfg_path) = PipelineConfig::from_config_and_args(
        &workdir,
        args.config.clone(),
        args.batch_size,
        args.concurrency,
    )
    .context("build config")?;

    let prepared = prepare(&args, &mode, &pipeline_cfg)?;
    let output = output_path(&args);
    let total_batches = prepared.batches.len();
    progress.info(format!(
        "{} words, {} batches (target {} words/batch)",
        prepared.total_words, total_batches, pipeline_cfg.split.target_words_per_batch
    ));

    let shared = SharedDocument::new(prepared.doc);

    match &mode {
        RunMode::Initialize => {
            progress.info("initialize only: no service calls");
        }
        RunMode::CheckStatus => {
            let flags = processed_flags(&shared, &prepared.batches);
            let mut processed = 0usize;
            for (bounds, done) in prepared.batches.iter().zip(&flags) {
                let mark = if *done { "ok " } else { "..." };
                println!(
                    "{mark} batch {:>3}  words {:>5}-{:<5}  {}",
                    bounds.index, bounds.start_word_key, bounds.end_word_key, bounds.segment_id
                );
                if *done {
                    processed += 1;
                }
            }
            println!(
                "{processed} processed, {} unprocessed of {total_batches} batches",
                total_batches - processed
            );
            return Ok(());
        }
        RunMode::ClearBatch(n) => {
            let bounds = prepared
                .batches
                .iter()
                .find(|b| b.index == *n)
                .ok_or_else(|| anyhow!("batch {n} does not exist (max batch: {total_batches})"))?;
            let outcome = shared.with_mut(|doc| doc.clear_batch(bounds));
            progress.info(format!(
                "cleared batch {n}: {} words reset, {} segments touched, {} idioms removed",
                outcome.words_cleared, outcome.segments_cleared, outcome.idioms_removed
            ));
        }
        RunMode::ClearRange(start, end) => {
            if !range_is_valid(prepared.total_words, *start, *end) {
                return Err(anyhow!(
                    "invalid word range {start}-{end} (document has {} words)",
                    prepared.total_words
                ));
            }
            let outcome = shared.with_mut(|doc| doc.clear_range(*start, *end));
            progress.info(format!(
                "cleared words {start}-{end}: {} reset, {} idioms removed",
                outcome.words_cleared, outcome.idioms_removed
            ));
        }
        RunMode::Reprocess(start, end) => {
            if !range_is_valid(prepared.total_words, *start, *end) {
                return Err(anyhow!(
                    "invalid word range {start}-{end} (document has {} words)",
                    prepared.total_words
                ));
            }
            let service = resolve_service(&app_cfg, args.model.clone())?;
            let client = HttpAnnotationClient::new(&service)?;
            let pipeline = AnnotationPipeline::new(pipeline_cfg.clone(), client, progress)?;
            pipeline
                .reprocess_range(
                    &shared,
                    &prepared.tokens,
                    prepared.total_words,
                    *start,
                    *end,
                )
                .await?;
        }
        RunMode::Fresh | RunMode::Resume => {
            let selection = batch_selection(&args)?;
            let service = resolve_service(&app_cfg, args.model.clone())?;
            let client = HttpAnnotationClient::new(&service)?;
            let pipeline = AnnotationPipeline::new(pipeline_cfg.clone(), client, progress)?;
            let report = pipeline
                .run(
                    &shared,
                    &prepared.tokens,
                    &prepared.batches,
                    &selection,
                    Some(output.as_path()),
                )
                .await?;
            eprintln!(
                "run finished: {} succeeded, {} failed, {} skipped",
                report.succeeded, report.failed, report.skipped
            );
        }
    }

    // Stats are derived state; refresh them before every save.
    shared.recalculate_stats();
    let doc = shared.snapshot();
    doc.save(&output)?;
    eprintln!("Saved document: {}", output.display());
    Ok(())
}
