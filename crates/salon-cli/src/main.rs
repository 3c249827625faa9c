use std::collections::BTreeMap;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};
use salon_contracts::chat::{parse_intent, SESSION_HELP_COMMANDS};
use salon_contracts::events::EventWriter;
use salon_contracts::runs::summary::{write_summary, SessionSummary};
use salon_contracts::styles::{
    HairColor, Haircut, Look, StyleOption, StyleSelection, StyleUpdate, STYLE_CATALOG_VERSION,
};
use salon_engine::{
    mime_for_path, EngineConfig, PipelineStage, ProviderKind, SalonEngine, SessionPipeline,
    SessionSnapshot, UploadStatus,
};
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(name = "salon", version, about = "Salon photo restyle pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive session driven by slash commands.
    Session(SessionArgs),
    /// Upload one photo, seat it in the salon, apply one style and save the result.
    Run(RunArgs),
    /// One-shot generation from a prompt and image URLs.
    Generate(GenerateArgs),
    /// Verify the generation provider is configured.
    Check(CheckArgs),
    /// List the style catalog.
    Styles,
}

#[derive(Debug, Args)]
struct EngineArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    /// `replicate` or `dryrun`; defaults to SALON_PROVIDER or token detection.
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
}

#[derive(Debug, Parser)]
struct SessionArgs {
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long)]
    image: PathBuf,
    #[arg(long, value_parser = parse_haircut)]
    haircut: Haircut,
    #[arg(long, value_parser = parse_color)]
    color: HairColor,
    #[arg(long, value_parser = parse_look)]
    look: Option<Look>,
    /// Where to save the restyled image (default `<out>/restyled.png`).
    #[arg(long)]
    save: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long)]
    prompt: String,
    #[arg(long = "image-url")]
    image_urls: Vec<String>,
}

#[derive(Debug, Parser)]
struct CheckArgs {
    #[command(flatten)]
    engine: EngineArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("salon error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Session(args) => {
            run_session(args)?;
            Ok(0)
        }
        Command::Run(args) => run_styling_run(args),
        Command::Generate(args) => run_generate(args),
        Command::Check(args) => run_check(args),
        Command::Styles => {
            print_style_catalog();
            Ok(0)
        }
    }
}

fn open_engine(args: &EngineArgs) -> Result<SalonEngine> {
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let mut config = EngineConfig::from_env(&args.out)?;
    if let Some(provider) = args.provider.as_deref() {
        config = config.with_provider(provider.parse::<ProviderKind>()?);
    }
    if let Some(model) = args.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        config.replicate.model = model.to_string();
    }
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let session_id = format!("session-{}", compact_timestamp());
    Ok(SalonEngine::new(config, EventWriter::new(events_path, session_id))?)
}

fn run_session(args: SessionArgs) -> Result<()> {
    let engine = open_engine(&args.engine)?;
    let pipeline = engine.pipeline();
    let started_at = now_utc_iso();

    let stdin = io::stdin();
    let mut line = String::new();

    println!(
        "Salon session started ({}). Type /help for commands.",
        engine.service().generator().provider_name()
    );

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => continue,
            "help" => {
                println!("Commands: {}", SESSION_HELP_COMMANDS.join(" "));
            }
            "upload" => {
                let paths = value_as_string_list(intent.command_args.get("paths"));
                if paths.is_empty() {
                    println!("/upload requires one or more paths");
                    continue;
                }
                for path in paths {
                    upload_path(&pipeline, Path::new(&path));
                }
            }
            "set_haircut" | "set_color" | "set_look" => {
                let value =
                    value_as_non_empty_string(intent.command_args.get("value")).unwrap_or_default();
                match style_update_for_command(&intent.action, &value) {
                    Ok(update) => apply_style_update(&pipeline, update),
                    Err(message) => println!("{message}"),
                }
            }
            "style" => apply_style_update(&pipeline, style_update_from_words(&intent.style_update)),
            "restyle" => match pipeline.trigger_restyle() {
                Ok(ticket) => println!(
                    "Restyling ({}) ... use /wait or /status",
                    describe_selection(&ticket.selection)
                ),
                Err(err) => println!("Restyle not started: {err}"),
            },
            "retry_base" => match pipeline.retry_base_transform() {
                Ok(Some(asset)) => println!("Retrying salon seating from {asset}"),
                Ok(None) => println!("No stored upload to retry; /upload a photo first"),
                Err(err) => println!("Retry not started: {err}"),
            },
            "reset" => {
                pipeline.reset();
                println!("Session reset. Upload a photo to start again.");
            }
            "status" => print_status(&pipeline.snapshot()),
            "wait" => {
                pipeline.wait_idle();
                print_status(&pipeline.snapshot());
            }
            "save" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("/save requires a path");
                    continue;
                };
                pipeline.wait_idle();
                match pipeline.download_displayed(Path::new(&path)) {
                    Ok(image) => println!("Saved {} to {path}", image.storage_id()),
                    Err(err) => println!("Save failed: {err}"),
                }
            }
            "styles" => print_style_catalog(),
            "quit" => break,
            _ => println!("Unknown command. Type /help for commands."),
        }
    }

    pipeline.wait_idle();
    let summary_path = args.engine.out.join("summary.json");
    finish_session(&engine, &pipeline, &started_at, &summary_path)?;
    println!("Summary written to {}", summary_path.display());
    Ok(())
}

fn run_styling_run(args: RunArgs) -> Result<i32> {
    let engine = open_engine(&args.engine)?;
    let pipeline = engine.pipeline();
    let started_at = now_utc_iso();
    let summary_path = args.engine.out.join("summary.json");

    let bytes = fs::read(&args.image)
        .with_context(|| format!("failed to read {}", args.image.display()))?;
    let handle = pipeline.submit_file(bytes, content_type_for(&args.image));
    if let UploadStatus::Failed(message) = handle.wait() {
        finish_session(&engine, &pipeline, &started_at, &summary_path)?;
        bail!("upload failed: {message}");
    }
    pipeline.wait_idle();
    if pipeline.stage() != PipelineStage::Styling {
        finish_session(&engine, &pipeline, &started_at, &summary_path)?;
        bail!("salon seating failed: {}", last_error_text(&pipeline.snapshot()));
    }
    println!("Seated in the salon chair.");

    pipeline.set_style_selection(StyleUpdate {
        haircut: Some(args.haircut),
        color: Some(args.color),
        look: Some(args.look),
    })?;
    let ticket = pipeline.trigger_restyle()?;
    println!("Restyling ({}) ...", describe_selection(&ticket.selection));
    pipeline.wait_idle();

    let snapshot = pipeline.snapshot();
    if snapshot.latest.is_none() {
        finish_session(&engine, &pipeline, &started_at, &summary_path)?;
        bail!("restyle failed: {}", last_error_text(&snapshot));
    }
    let save_path = args
        .save
        .clone()
        .unwrap_or_else(|| args.engine.out.join("restyled.png"));
    let image = pipeline.download_displayed(&save_path)?;
    println!("Result: {}", image.result_url());
    println!("Saved {} to {}", image.storage_id(), save_path.display());

    finish_session(&engine, &pipeline, &started_at, &summary_path)?;
    Ok(0)
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let engine = open_engine(&args.engine)?;
    let image = engine.generate_direct(&args.prompt, args.image_urls.clone())?;
    println!("Result: {}", image.result_url());
    println!("Stored as {}", image.storage_id());
    Ok(0)
}

fn run_check(args: CheckArgs) -> Result<i32> {
    let engine = open_engine(&args.engine)?;
    match engine.check_provider() {
        Ok(message) => {
            println!("{message}");
            Ok(0)
        }
        Err(err) => {
            eprintln!("Provider check failed: {err}");
            Ok(1)
        }
    }
}

fn upload_path(pipeline: &SessionPipeline, path: &Path) {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            println!("Upload failed for {}: {err}", path.display());
            return;
        }
    };
    let handle = pipeline.submit_file(bytes, content_type_for(path));
    println!("Uploading {} as {}", path.display(), handle.id());
}

fn apply_style_update(pipeline: &SessionPipeline, update: StyleUpdate) {
    match pipeline.set_style_selection(update) {
        Ok(selection) => println!("Style: {}", describe_selection(&selection)),
        Err(err) => println!("Style not changed: {err}"),
    }
}

fn finish_session(
    engine: &SalonEngine,
    pipeline: &SessionPipeline,
    started_at: &str,
    summary_path: &Path,
) -> Result<()> {
    let snapshot = pipeline.snapshot();
    let summary = build_summary(engine.events().session_id(), started_at, &snapshot);
    let mut extra = Map::new();
    extra.insert("stage".to_string(), json!(snapshot.stage.as_str()));
    extra.insert(
        "provider".to_string(),
        json!(engine.service().generator().provider_name()),
    );
    extra.insert(
        "events_path".to_string(),
        json!(engine
            .events()
            .path()
            .map(|path| path.to_string_lossy().to_string())),
    );
    write_summary(summary_path, &summary, Some(&extra))
}

fn build_summary(session_id: &str, started_at: &str, snapshot: &SessionSnapshot) -> SessionSummary {
    SessionSummary {
        session_id: session_id.to_string(),
        started_at: started_at.to_string(),
        finished_at: now_utc_iso(),
        uploads_stored: snapshot.uploads_stored,
        uploads_failed: snapshot.uploads_failed,
        restyles_completed: snapshot.restyles_completed,
        base_storage_id: snapshot
            .base
            .as_ref()
            .map(|image| image.storage_id().to_string()),
        displayed_url: snapshot
            .displayed
            .as_ref()
            .map(|image| image.result_url().to_string()),
    }
}

fn style_update_for_command(action: &str, value: &str) -> Result<StyleUpdate, String> {
    match action {
        "set_haircut" => Haircut::parse(value)
            .map(StyleUpdate::haircut)
            .ok_or_else(|| unknown_option("haircut", value, Haircut::options())),
        "set_color" => HairColor::parse(value)
            .map(StyleUpdate::color)
            .ok_or_else(|| unknown_option("color", value, HairColor::options())),
        "set_look" => {
            if matches!(value, "none" | "off" | "clear") {
                return Ok(StyleUpdate::look(None));
            }
            Look::parse(value)
                .map(|look| StyleUpdate::look(Some(look)))
                .ok_or_else(|| unknown_option("look", value, Look::options()))
        }
        other => Err(format!("not a style command: {other}")),
    }
}

fn unknown_option(category: &str, value: &str, options: &[StyleOption]) -> String {
    let values: Vec<&str> = options.iter().map(|option| option.value).collect();
    if value.is_empty() {
        return format!("/{category} requires one of: {}", values.join(", "));
    }
    format!("Unknown {category} '{value}'. Options: {}", values.join(", "))
}

fn style_update_from_words(words: &BTreeMap<String, Value>) -> StyleUpdate {
    let text = |key: &str| words.get(key).and_then(Value::as_str).unwrap_or_default();
    StyleUpdate {
        haircut: Haircut::parse(text("haircut")),
        color: HairColor::parse(text("color")),
        look: Look::parse(text("look")).map(Some),
    }
}

fn describe_selection(selection: &StyleSelection) -> String {
    let mut parts = vec![selection.haircut.label(), selection.color.label()];
    if let Some(look) = selection.look {
        parts.push(look.label());
    }
    parts.join(" + ")
}

fn print_status(snapshot: &SessionSnapshot) {
    println!("Stage: {}", snapshot.stage);
    for asset in &snapshot.assets {
        match &asset.status {
            UploadStatus::Stored(id) => println!("  {} stored as {id}", asset.id),
            other => println!("  {} {}", asset.id, other.as_str()),
        }
    }
    if let Some(base) = &snapshot.base {
        println!("Base: {} ({})", base.result_url(), base.storage_id());
    }
    if let Some(displayed) = &snapshot.displayed {
        println!("Displayed: {}", displayed.result_url());
    }
    println!("Style: {}", describe_selection(&snapshot.selection));
    if let Some(failure) = &snapshot.last_error {
        println!("Last error ({}, {}): {}", failure.stage, failure.kind, failure.message);
    }
}

fn print_style_catalog() {
    println!("Style catalog v{STYLE_CATALOG_VERSION}");
    for (title, options) in [
        ("Haircuts", Haircut::options()),
        ("Colors", HairColor::options()),
        ("Looks", Look::options()),
    ] {
        println!("{title}:");
        for option in options {
            println!("  {:<10} {} - {}", option.value, option.label, option.description);
        }
    }
}

fn last_error_text(snapshot: &SessionSnapshot) -> String {
    snapshot
        .last_error
        .as_ref()
        .map(|failure| failure.message.clone())
        .unwrap_or_else(|| "no result".to_string())
}

fn content_type_for(path: &Path) -> &'static str {
    mime_for_path(path).unwrap_or("application/octet-stream")
}

fn compact_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn value_as_string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    let raw = value
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

fn parse_haircut(raw: &str) -> Result<Haircut, String> {
    Haircut::parse(raw).ok_or_else(|| unknown_option("haircut", raw, Haircut::options()))
}

fn parse_color(raw: &str) -> Result<HairColor, String> {
    HairColor::parse(raw).ok_or_else(|| unknown_option("color", raw, HairColor::options()))
}

fn parse_look(raw: &str) -> Result<Look, String> {
    Look::parse(raw).ok_or_else(|| unknown_option("look", raw, Look::options()))
}
