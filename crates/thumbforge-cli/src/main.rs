use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use thumbforge_contracts::config::Settings;
use thumbforge_contracts::events::EventWriter;
use thumbforge_contracts::index::Index;
use thumbforge_engine::{
    default_output_path, DryrunEmbedder, Embedder, GenerationRequest, JinaClipEmbedder,
    OpenAiVision, Orchestrator, SearchResult, ThumbnailAnalyzer, ThumbnailLibrary,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "thumbforge",
    version,
    about = "Find reference thumbnails by topic and generate new ones"
)]
struct Cli {
    /// Directory of reference thumbnails; subfolders are categories.
    #[arg(long, global = true, default_value = "thumbnails")]
    library: PathBuf,
    /// Index snapshot file; defaults to `thumbnail_index.json` inside the library.
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,
    /// Append JSONL events to this file.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = EmbedderKind::Jina)]
    embedder: EmbedderKind,
    /// Extra `.env` file to read credentials from.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmbedderKind {
    Jina,
    Dryrun,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Rebuild the similarity index from the library directory.
    Index,
    Search(SearchArgs),
    Categories,
    Import(ImportArgs),
    Analyze(AnalyzeArgs),
    Generate(GenerateArgs),
    /// Interactive search, pick, analyze and generate flow.
    Wizard(WizardArgs),
}

#[derive(Debug, Parser)]
struct SearchArgs {
    #[arg(long)]
    topic: String,
    #[arg(long)]
    pov: Option<String>,
    #[arg(short, long, default_value_t = 5)]
    k: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct ImportArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,
    #[arg(long)]
    category: Option<String>,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    thumbnail: PathBuf,
    #[arg(long)]
    topic: String,
    #[arg(long)]
    pov: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    reference: Option<PathBuf>,
    #[arg(long)]
    provider: Option<String>,
}

#[derive(Debug, Parser)]
struct WizardArgs {
    #[arg(long)]
    topic: Option<String>,
    #[arg(long)]
    pov: Option<String>,
    #[arg(short, long, default_value_t = 5)]
    k: usize,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    out: Option<PathBuf>,
}

const DEFAULT_OUTPUT_DIR: &str = "generated";

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("thumbforge error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let settings = load_settings(cli.env_file.as_deref());
    let events = event_writer(cli.events.as_deref());

    match &cli.command {
        Command::Index => {
            let library = open_library(&cli, &settings, &events)?;
            let index = library.build()?;
            println!(
                "Indexed {} thumbnails in {} ({} categories) -> {}",
                index.len(),
                library.root().display(),
                index.categories().len(),
                library.snapshot_path().display()
            );
        }
        Command::Search(args) => {
            let library = open_library(&cli, &settings, &events)?;
            let index = load_index(&library)?;
            let results = library.query(&index, &args.topic, args.pov.as_deref(), args.k)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print!("{}", render_results(&results));
            }
        }
        Command::Categories => {
            let library = open_library(&cli, &settings, &events)?;
            let index = load_index(&library)?;
            print!("{}", render_categories(&index));
        }
        Command::Import(args) => {
            let library = open_library(&cli, &settings, &events)?;
            let report = library.import(&args.files, args.category.as_deref())?;
            for path in &report.imported {
                println!("imported {}", path.display());
            }
            for (path, reason) in &report.rejected {
                println!("skipped {}: {reason}", path.display());
            }
            println!("Index now holds {} thumbnails.", report.index.len());
            if report.imported.is_empty() {
                return Ok(1);
            }
        }
        Command::Analyze(args) => {
            let analyzer = thumbnail_analyzer(&settings, &events)
                .context("thumbnail analysis needs OPENAI_API_KEY")?;
            let analysis = analyzer.analyze(&args.thumbnail, &args.topic, args.pov.as_deref())?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&analysis)?);
            } else {
                print!("{}", analysis.render());
            }
        }
        Command::Generate(args) => {
            let orchestrator = Orchestrator::new(&settings, events.clone());
            let mut request = GenerationRequest::new(
                args.prompt.clone(),
                args.out
                    .clone()
                    .unwrap_or_else(|| default_output_path(Path::new(DEFAULT_OUTPUT_DIR))),
            );
            request.reference = args.reference.clone();
            request.provider = args.provider.clone();
            let outcome = orchestrator.generate(&request)?;
            println!("{}", render_outcome(&outcome));
        }
        Command::Wizard(args) => {
            let library = open_library(&cli, &settings, &events)?;
            let analyzer = thumbnail_analyzer(&settings, &events).ok();
            let orchestrator = Orchestrator::new(&settings, events.clone());
            let stdin = io::stdin();
            let stdout = io::stdout();
            run_wizard(
                args,
                &WizardDeps {
                    library: &library,
                    analyzer: analyzer.as_ref(),
                    orchestrator: &orchestrator,
                },
                &mut stdin.lock(),
                &mut stdout.lock(),
            )?;
        }
    }
    Ok(0)
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = if verbose > 0 {
        EnvFilter::new(default_level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .with(filter)
        .try_init();
}

fn load_settings(env_file: Option<&Path>) -> Settings {
    let settings = Settings::from_env();
    match env_file {
        Some(path) => settings.with_dotenv(path),
        None => settings,
    }
}

fn event_writer(path: Option<&Path>) -> EventWriter {
    match path {
        Some(path) => EventWriter::new(path, format!("thumbforge-{}", uuid::Uuid::new_v4().simple())),
        None => EventWriter::disabled(),
    }
}

fn open_library(
    cli: &Cli,
    settings: &Settings,
    events: &EventWriter,
) -> Result<ThumbnailLibrary<Box<dyn Embedder>>> {
    let embedder: Box<dyn Embedder> = match cli.embedder {
        EmbedderKind::Dryrun => Box::new(DryrunEmbedder::default()),
        EmbedderKind::Jina => {
            let embedder = JinaClipEmbedder::from_settings(settings);
            if !embedder.is_configured() {
                bail!("JINA_API_KEY not set (use --embedder dryrun for offline runs)");
            }
            Box::new(embedder)
        }
    };
    let mut library = ThumbnailLibrary::new(&cli.library, embedder).with_events(events.clone());
    if let Some(snapshot) = cli.snapshot.as_ref() {
        library = library.with_snapshot_path(snapshot);
    }
    Ok(library)
}

/// Snapshot when it matches the active embedder, otherwise a fresh build.
fn load_index(library: &ThumbnailLibrary<Box<dyn Embedder>>) -> Result<Index> {
    let index = library.load_or_create()?;
    let model = library.embedder().model();
    if !index.is_empty() && index.embedding_model() == Some(model) {
        return Ok(index);
    }
    if !index.is_empty() {
        tracing::info!(
            snapshot_model = index.embedding_model().unwrap_or("unknown"),
            model,
            "snapshot built with another embedder; rebuilding"
        );
    }
    Ok(library.build()?)
}

fn thumbnail_analyzer(settings: &Settings, events: &EventWriter) -> Result<ThumbnailAnalyzer> {
    let vision = OpenAiVision::from_settings(settings);
    if !vision.is_configured() {
        bail!("OPENAI_API_KEY not set");
    }
    Ok(ThumbnailAnalyzer::new(Arc::new(vision)).with_events(events.clone()))
}

fn render_results(results: &[SearchResult]) -> String {
    let mut out = String::new();
    for row in results {
        out.push_str(&format!(
            "{:>2}. {:.4}  {}  [{}]\n",
            row.rank,
            row.score,
            row.path.display(),
            row.category.as_deref().unwrap_or("uncategorized")
        ));
    }
    out
}

fn render_categories(index: &Index) -> String {
    let mut out = String::new();
    for category in index.categories() {
        out.push_str(&format!(
            "{category} ({})\n",
            index.entries_in(Some(&category)).len()
        ));
    }
    let loose = index.entries_in(None).len();
    if loose > 0 {
        out.push_str(&format!("uncategorized ({loose})\n"));
    }
    out
}

fn render_outcome(outcome: &thumbforge_engine::GenerationOutcome) -> String {
    let mut line = format!(
        "Saved {} via {} after {} attempt{}",
        outcome.path.display(),
        outcome.candidate,
        outcome.attempts,
        if outcome.attempts == 1 { "" } else { "s" }
    );
    if let Some(receipt) = outcome.receipt_path.as_ref() {
        line.push_str(&format!(" (receipt {})", receipt.display()));
    }
    line
}

struct WizardDeps<'a> {
    library: &'a ThumbnailLibrary<Box<dyn Embedder>>,
    analyzer: Option<&'a ThumbnailAnalyzer>,
    orchestrator: &'a Orchestrator,
}

fn ask<R: BufRead, W: Write>(input: &mut R, output: &mut W, question: &str) -> Result<String> {
    write!(output, "{question}")?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        bail!("input closed");
    }
    Ok(line.trim().to_string())
}

fn run_wizard<R: BufRead, W: Write>(
    args: &WizardArgs,
    deps: &WizardDeps<'_>,
    input: &mut R,
    output: &mut W,
) -> Result<()> {
    let (topic, pov) = match args.topic.as_deref().map(str::trim).filter(|topic| !topic.is_empty()) {
        Some(topic) => (topic.to_string(), args.pov.clone()),
        None => {
            let topic = ask(input, output, "Video topic: ")?;
            if topic.is_empty() {
                bail!("a topic is required");
            }
            let pov = ask(input, output, "Point of view (optional): ")?;
            (topic, Some(pov).filter(|pov| !pov.is_empty()))
        }
    };

    let index = load_index(deps.library)?;
    let results = deps.library.query(&index, &topic, pov.as_deref(), args.k)?;
    writeln!(output, "\nClosest reference thumbnails:")?;
    write!(output, "{}", render_results(&results))?;

    let reference = loop {
        let answer = ask(
            input,
            output,
            &format!("Pick a reference [1-{}, 0 for none]: ", results.len()),
        )?;
        match answer.parse::<usize>() {
            Ok(0) => break None,
            Ok(choice) if choice <= results.len() => break Some(results[choice - 1].path.clone()),
            _ => writeln!(output, "Enter a number between 0 and {}.", results.len())?,
        }
    };

    let mut prompt = String::new();
    if let Some(reference) = reference.as_ref() {
        match deps.analyzer {
            Some(analyzer) => match analyzer.analyze(reference, &topic, pov.as_deref()) {
                Ok(analysis) => {
                    write!(output, "\n{}", analysis.render())?;
                    prompt = analysis.generation_prompt;
                }
                Err(err) => writeln!(output, "Analysis failed ({err}); describe the thumbnail instead.")?,
            },
            None => writeln!(output, "Vision analysis unavailable (OPENAI_API_KEY not set).")?,
        }
    }
    if prompt.is_empty() {
        prompt = ask(input, output, "Describe the thumbnail to generate: ")?;
        if prompt.is_empty() {
            bail!("a prompt is required");
        }
    } else {
        let replacement = ask(input, output, "Press enter to use this prompt, or type a new one: ")?;
        if !replacement.is_empty() {
            prompt = replacement;
        }
    }

    let mut request = GenerationRequest::new(
        prompt,
        args.out
            .clone()
            .unwrap_or_else(|| default_output_path(Path::new(DEFAULT_OUTPUT_DIR))),
    );
    request.reference = reference;
    request.provider = args.provider.clone();
    writeln!(output, "Generating...")?;
    let outcome = deps.orchestrator.generate(&request)?;
    writeln!(output, "{}", render_outcome(&outcome))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{Rgb, RgbImage};

    use super::*;

    fn seed_library(root: &Path) -> Result<()> {
        std::fs::create_dir_all(root.join("Tech"))?;
        RgbImage::from_pixel(8, 8, Rgb([200, 10, 10])).save(root.join("Tech").join("a.png"))?;
        RgbImage::from_pixel(8, 8, Rgb([10, 200, 10])).save(root.join("Tech").join("b.png"))?;
        RgbImage::from_pixel(8, 8, Rgb([10, 10, 200])).save(root.join("c.png"))?;
        Ok(())
    }

    #[test]
    fn global_flags_parse_after_subcommand() -> Result<()> {
        let cli = Cli::try_parse_from([
            "thumbforge",
            "search",
            "--topic",
            "AI",
            "-k",
            "2",
            "--embedder",
            "dryrun",
            "--library",
            "/tmp/lib",
            "-vv",
        ])?;
        assert_eq!(cli.embedder, EmbedderKind::Dryrun);
        assert_eq!(cli.library, PathBuf::from("/tmp/lib"));
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.topic, "AI");
                assert_eq!(args.k, 2);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn snapshot_flag_moves_the_index_file() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().join("library");
        seed_library(&root)?;
        let snapshot = temp.path().join("cache").join("index.json");
        let library_arg = root.to_string_lossy().to_string();
        let snapshot_arg = snapshot.to_string_lossy().to_string();
        let cli = Cli::try_parse_from([
            "thumbforge",
            "index",
            "--embedder",
            "dryrun",
            "--library",
            library_arg.as_str(),
            "--snapshot",
            snapshot_arg.as_str(),
        ])?;
        let settings = Settings::isolated(Vec::<(String, String)>::new());
        let library = open_library(&cli, &settings, &EventWriter::disabled())?;
        assert_eq!(library.snapshot_path(), snapshot.as_path());

        let index = library.build()?;
        assert_eq!(index.len(), 3);
        assert!(snapshot.is_file());
        assert!(!root.join("thumbnail_index.json").exists());
        Ok(())
    }

    #[test]
    fn import_requires_files() {
        assert!(Cli::try_parse_from(["thumbforge", "import", "--category", "Tech"]).is_err());
    }

    #[test]
    fn categories_list_counts_and_loose_files() -> Result<()> {
        let temp = tempfile::tempdir()?;
        seed_library(temp.path())?;
        let library = ThumbnailLibrary::new(
            temp.path(),
            Box::new(DryrunEmbedder::default()) as Box<dyn Embedder>,
        );
        let index = load_index(&library)?;
        assert_eq!(render_categories(&index), "Tech (2)\nuncategorized (1)\n");
        Ok(())
    }

    #[test]
    fn wizard_runs_offline_end_to_end() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().join("library");
        seed_library(&root)?;
        let library = ThumbnailLibrary::new(
            &root,
            Box::new(DryrunEmbedder::default()) as Box<dyn Embedder>,
        );
        let orchestrator = Orchestrator::new(
            &Settings::isolated(Vec::<(String, String)>::new()),
            EventWriter::disabled(),
        );
        let output_path = temp.path().join("out").join("thumb.png");
        let args = WizardArgs {
            topic: None,
            pov: None,
            k: 2,
            provider: Some("dryrun".to_string()),
            out: Some(output_path.clone()),
        };

        let mut input = Cursor::new("AI tools\n\n9\n1\nA robot reviewing laptops\n");
        let mut output = Vec::new();
        run_wizard(
            &args,
            &WizardDeps {
                library: &library,
                analyzer: None,
                orchestrator: &orchestrator,
            },
            &mut input,
            &mut output,
        )?;

        let transcript = String::from_utf8(output)?;
        assert!(transcript.contains("Closest reference thumbnails:"));
        assert!(transcript.contains("Enter a number between 0 and 2."));
        assert!(transcript.contains("Vision analysis unavailable"));
        assert!(transcript.contains("Saved "));
        assert!(output_path.is_file());
        Ok(())
    }

    #[test]
    fn wizard_stops_when_input_closes() -> Result<()> {
        let temp = tempfile::tempdir()?;
        seed_library(temp.path())?;
        let library = ThumbnailLibrary::new(
            temp.path(),
            Box::new(DryrunEmbedder::default()) as Box<dyn Embedder>,
        );
        let orchestrator = Orchestrator::new(
            &Settings::isolated(Vec::<(String, String)>::new()),
            EventWriter::disabled(),
        );
        let args = WizardArgs {
            topic: Some("AI".to_string()),
            pov: None,
            k: 3,
            provider: Some("dryrun".to_string()),
            out: Some(temp.path().join("never.png")),
        };
        let err = run_wizard(
            &args,
            &WizardDeps {
                library: &library,
                analyzer: None,
                orchestrator: &orchestrator,
            },
            &mut Cursor::new(""),
            &mut Vec::new(),
        )
        .err()
        .map(|err| err.to_string())
        .unwrap_or_default();
        assert_eq!(err, "input closed");
        Ok(())
    }
}
