#![deny(warnings)]

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use speech_emotion_core::augment::AugmentConfig;
use speech_emotion_core::classifier::{ClassifierConfig, LstmClassifier, DEFAULT_MAX_EPOCHS};
use speech_emotion_core::config::{
    resolve_corpus_dir, resolve_model_path, resolve_threads, resolve_yamnet_output, AppConfig,
    Env, SplitConfig, StdEnv, YamnetConfig,
};
use speech_emotion_core::dataset::{DEFAULT_SPLIT_SEED, DEFAULT_TEST_FRACTION};
use speech_emotion_core::embedding::EmbeddingModel;
use speech_emotion_core::pipeline::{
    FittedPipeline, PipelineConfig, PipelineError, Prediction, TrainingPipeline, TrainingSummary,
};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const PROMPT: &str = "Enter the path to your audio file: ";

#[derive(Parser, Debug)]
#[command(name = "speech-emotion")]
#[command(about = "Train a speech emotion classifier on YAMNet embeddings and classify audio files")]
struct Args {
    /// Corpus root; file names carry the emotion code in field 3.
    #[arg(long)]
    corpus: Option<PathBuf>,

    /// YAMNet ONNX export.
    #[arg(long)]
    yamnet_model: Option<PathBuf>,

    #[arg(long)]
    yamnet_output: Option<String>,

    #[arg(long)]
    threads: Option<usize>,

    /// Classify FILE after training. Repeatable.
    #[arg(long, value_name = "FILE")]
    predict: Vec<PathBuf>,

    /// Prompt for files to classify after training.
    #[arg(long)]
    interactive: bool,

    #[arg(long)]
    no_augment: bool,

    #[arg(long, default_value_t = DEFAULT_MAX_EPOCHS)]
    epochs: usize,

    #[arg(long, default_value_t = DEFAULT_TEST_FRACTION)]
    test_fraction: f64,

    #[arg(long, default_value_t = DEFAULT_SPLIT_SEED)]
    seed: u64,

    /// Print the run summary and predictions as JSON.
    #[arg(long)]
    json: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Serialize)]
struct RunReport<'a> {
    summary: &'a TrainingSummary,
    predictions: Vec<PredictionOutcome>,
}

#[derive(Serialize)]
struct PredictionOutcome {
    path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    prediction: Option<Prediction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let json = args.json;
    let interactive = args.interactive;
    let env = StdEnv;
    let cfg = build_config(args, &env)?;

    tracing::info!(
        corpus = %cfg.corpus.as_path().display(),
        model = %cfg.yamnet.model.as_path().display(),
        augment = cfg.augment.enabled,
        max_epochs = cfg.classifier.max_epochs,
        "config loaded"
    );

    let model = load_model(&cfg.yamnet)?;
    let classifier = LstmClassifier::new(cfg.classifier.clone())?;
    let pipeline = TrainingPipeline::new(model, classifier, PipelineConfig::from_app(&cfg));
    let (fitted, summary) = pipeline
        .run(cfg.corpus.as_path())
        .context("training failed")?;

    let predictions: Vec<PredictionOutcome> = cfg
        .predict
        .iter()
        .map(|path| match fitted.predict_file(path) {
            Ok(p) => PredictionOutcome {
                path: path.clone(),
                prediction: Some(p),
                error: None,
            },
            Err(e) => PredictionOutcome {
                path: path.clone(),
                prediction: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if json {
        let report = RunReport {
            summary: &summary,
            predictions,
        };
        serde_json::to_writer_pretty(&mut out, &report).context("failed to write JSON report")?;
        writeln!(out)?;
    } else {
        print_summary(&mut out, &summary, &fitted)?;
        for outcome in &predictions {
            writeln!(out, "{}", outcome.path.display())?;
            match (&outcome.prediction, &outcome.error) {
                (Some(p), _) => print_prediction(&mut out, p)?,
                (None, Some(e)) => writeln!(out, "Error occurred: {e}")?,
                (None, None) => {}
            }
        }
    }

    if interactive {
        let stdin = std::io::stdin();
        run_prompt(stdin.lock(), &mut out, |path| fitted.predict_file(path))?;
    }

    Ok(())
}

#[cfg(feature = "onnx")]
fn load_model(cfg: &YamnetConfig) -> anyhow::Result<impl EmbeddingModel> {
    speech_emotion_core::embedding::YamnetEmbedder::with_output_name(
        cfg.model.as_path(),
        cfg.threads.get(),
        &cfg.output_name,
    )
    .context("failed to load YAMNet")
}

#[cfg(not(feature = "onnx"))]
fn load_model(_cfg: &YamnetConfig) -> anyhow::Result<Box<dyn EmbeddingModel>> {
    anyhow::bail!("built without the `onnx` feature; no embedding backend available")
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid --log-level: {level}"))?,
        )
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn build_config(args: Args, env: &impl Env) -> anyhow::Result<AppConfig> {
    let corpus = resolve_corpus_dir(args.corpus, env)?;
    let yamnet = YamnetConfig {
        model: resolve_model_path(args.yamnet_model, env)?,
        threads: resolve_threads(args.threads, env)?,
        output_name: resolve_yamnet_output(args.yamnet_output, env),
    };

    let base = if args.no_augment {
        AugmentConfig::disabled()
    } else {
        AugmentConfig::default()
    };
    let augment = AugmentConfig {
        seed: args.seed,
        ..base
    };
    let classifier = ClassifierConfig {
        max_epochs: args.epochs,
        seed: args.seed,
        ..Default::default()
    };

    let cfg = AppConfig {
        corpus,
        yamnet,
        augment,
        split: SplitConfig::new(args.test_fraction, args.seed)?,
        classifier,
        predict: args.predict,
    };
    cfg.validate()?;
    Ok(cfg)
}

fn print_summary<M, C>(
    out: &mut impl Write,
    summary: &TrainingSummary,
    fitted: &FittedPipeline<M, C>,
) -> std::io::Result<()>
where
    M: EmbeddingModel,
    C: speech_emotion_core::classifier::Classifier,
{
    writeln!(
        out,
        "Dataset: {} rows from {} files ({} skipped), padded to {} frames",
        summary.build.rows,
        summary.build.files_processed,
        summary.build.files_skipped(),
        summary.max_len
    )?;
    writeln!(
        out,
        "Trained {} epochs (best epoch {}{})",
        summary.training.epochs.len(),
        summary.training.best_epoch,
        if summary.training.stopped_early {
            ", stopped early"
        } else {
            ""
        }
    )?;
    match &summary.evaluation {
        Some(eval) => {
            writeln!(out, "Test Loss: {:.4}", eval.loss)?;
            writeln!(out, "Test Accuracy: {:.2}%", eval.accuracy * 100.0)?;
            writeln!(out, "Confusion matrix (rows = true, columns = predicted):")?;
            write!(out, "{}", eval.confusion.render(&fitted.codec().class_names()))?;
        }
        None => writeln!(out, "No rows held out for evaluation")?,
    }
    Ok(())
}

fn print_prediction(out: &mut impl Write, prediction: &Prediction) -> std::io::Result<()> {
    writeln!(out, "Predicted Emotion: {}", prediction.emotion)?;
    writeln!(
        out,
        "Prediction Accuracy: {:.2}%",
        prediction.confidence_percent
    )
}

/// Reads one path per line until EOF or an empty line. Failed predictions
/// are reported and the prompt continues.
fn run_prompt<R, W, F>(mut input: R, out: &mut W, mut predict: F) -> anyhow::Result<()>
where
    R: BufRead,
    W: Write,
    F: FnMut(&Path) -> Result<Prediction, PipelineError>,
{
    let mut line = String::new();
    loop {
        write!(out, "{PROMPT}")?;
        out.flush()?;

        line.clear();
        if input.read_line(&mut line).context("failed to read input")? == 0 {
            writeln!(out)?;
            return Ok(());
        }
        let path = line.trim();
        if path.is_empty() {
            return Ok(());
        }

        match predict(Path::new(path)) {
            Ok(prediction) => print_prediction(out, &prediction)?,
            Err(e) => writeln!(out, "Error occurred: {e}")?,
        }
    }
}
