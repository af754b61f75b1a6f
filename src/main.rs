//! edge-lora command-line front end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use candle_core::Tensor;
use clap::{Parser, Subcommand};
use edge_lora::{
    dataset::list_images, factory, format_parameter_count, session, AdaptiveClassifier,
    Assessment, BaseModel, DeviceContext, DomainAdapter, EdgeConfig, ImageFolder, LogFormat,
    LoraConfig, PerformanceMonitor, UncertaintyGate,
};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report the compute backend that would be selected
    Hardware {
        /// auto, cuda, mps/metal or cpu
        #[arg(long, default_value = "auto")]
        device: String,
    },
    /// Build the model described by a config and write a freshly initialized adapter checkpoint
    Init {
        /// Experiment config (yaml, toml or json)
        #[arg(long)]
        config: PathBuf,
    },
    /// Measure cyclic switch+inference latency
    Benchmark {
        /// Built-in backbone id or model directory
        #[arg(long, default_value = "edgenet-small")]
        model: String,
        #[arg(long, default_value = "auto")]
        device: String,
        /// Adapters to create and cycle through
        #[arg(long, value_delimiter = ',', default_value = "sunny,rainy,night")]
        adapters: Vec<String>,
        #[arg(long, default_value_t = 100)]
        iterations: usize,
        #[arg(long, default_value = "results/logs")]
        log_dir: PathBuf,
    },
    /// Evaluate a labelled image folder and write a session report
    Evaluate {
        /// Experiment config (yaml, toml or json)
        #[arg(long)]
        config: PathBuf,
        /// Directory of class subdirectories
        #[arg(long)]
        data_dir: PathBuf,
        /// Adapter checkpoint to activate; base-only when omitted
        #[arg(long)]
        adapter_dir: Option<PathBuf>,
        /// Registry name for the loaded adapter
        #[arg(long, default_value = "expert")]
        name: String,
        /// Override the configured log layout
        #[arg(long, value_parser = parse_format)]
        format: Option<LogFormat>,
    },
    /// Mean entropy of the base model per folder, flagging domain shift
    Baseline {
        #[arg(long, default_value = "edgenet-small")]
        model: String,
        #[arg(long, default_value = "auto")]
        device: String,
        #[arg(long, default_value_t = edge_lora::uncertainty::DEFAULT_ENTROPY_THRESHOLD)]
        threshold: f32,
        /// Unlabelled image folders
        #[arg(required = true)]
        folders: Vec<PathBuf>,
    },
}

fn parse_format(s: &str) -> Result<LogFormat, String> {
    match s.to_ascii_lowercase().as_str() {
        "basic" => Ok(LogFormat::Basic),
        "strict" => Ok(LogFormat::Strict),
        other => Err(format!("unknown log format '{other}' (expected basic or strict)")),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(cli.log_level.parse().unwrap_or(Level::INFO).into())
                .from_env_lossy(),
        )
        .with_target(false)
        .init();

    match cli.command {
        Command::Hardware { device } => hardware(&device),
        Command::Init { config } => init(&config),
        Command::Benchmark {
            model,
            device,
            adapters,
            iterations,
            log_dir,
        } => benchmark(&model, &device, &adapters, iterations, log_dir),
        Command::Evaluate {
            config,
            data_dir,
            adapter_dir,
            name,
            format,
        } => evaluate(&config, &data_dir, adapter_dir.as_deref(), &name, format),
        Command::Baseline {
            model,
            device,
            threshold,
            folders,
        } => baseline(&model, &device, threshold, &folders),
    }
}

fn hardware(device: &str) -> anyhow::Result<()> {
    let ctx = DeviceContext::from_name(device)?;
    println!("edge-lora {}", env!("CARGO_PKG_VERSION"));
    println!("Backend: {}", ctx.backend());
    if ctx.backend() == edge_lora::Backend::Cpu {
        println!("No GPU selected; inference runs on CPU.");
    }
    Ok(())
}

fn init(config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = EdgeConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let ctx = DeviceContext::from_name(&config.training.device)?;
    let (base, lora) = factory::build(&config, &ctx)?;
    let adapter = DomainAdapter::new(&base, lora)?;

    println!(
        "trainable params: {} || all params: {} || trainable%: {:.4}",
        format_parameter_count(adapter.num_parameters()),
        format_parameter_count(base.num_parameters() + adapter.num_parameters()),
        percentage(adapter.num_parameters(), base.num_parameters())
    );

    let dir = config.adapter_dir();
    edge_lora::save_adapter(&adapter, &dir)?;
    info!(path = %dir.display(), "adapter checkpoint written");
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn percentage(part: usize, base: usize) -> f64 {
    let total = (part + base) as f64;
    if total == 0.0 {
        0.0
    } else {
        100.0 * part as f64 / total
    }
}

fn benchmark(
    model: &str,
    device: &str,
    adapters: &[String],
    iterations: usize,
    log_dir: PathBuf,
) -> anyhow::Result<()> {
    let ctx = DeviceContext::from_name(device)?;
    let base = BaseModel::load(model, &ctx, None)?;
    let side = base.preprocessor().image_size as usize;
    let mut classifier = AdaptiveClassifier::new(Arc::new(base));

    let config = LoraConfig::default();
    for name in adapters {
        classifier.add_adapter(name, &config, false)?;
    }
    info!(adapters = ?classifier.adapter_names(), "experts resident");

    let pixels = Tensor::randn(0f32, 1f32, (1, 3, side, side), ctx.device())?;
    let names: Vec<&str> = adapters.iter().map(String::as_str).collect();
    let mut monitor =
        PerformanceMonitor::for_device("switching_benchmark", log_dir, LogFormat::Basic, &ctx);
    let report =
        session::benchmark_switching(&mut classifier, &names, iterations, &pixels, &mut monitor)?;

    println!("Total time: {:.4}s", report.total.as_secs_f64());
    println!("Average switch+inference latency: {:.2} ms", report.avg_latency_ms);
    println!("Projected max FPS: {:.1}", report.projected_fps);
    if report.real_time {
        println!("Real-time capable (>30 FPS)");
    } else {
        println!("Latency above the 33 ms frame budget");
    }
    monitor.save_report()?;
    Ok(())
}

fn evaluate(
    config_path: &std::path::Path,
    data_dir: &std::path::Path,
    adapter_dir: Option<&std::path::Path>,
    name: &str,
    format: Option<LogFormat>,
) -> anyhow::Result<()> {
    let config = EdgeConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let ctx = DeviceContext::from_name(&config.training.device)?;
    let (base, _) = factory::build(&config, &ctx)?;
    let mut classifier = AdaptiveClassifier::new(Arc::new(base));

    if let Some(dir) = adapter_dir {
        classifier.load_adapter(dir, name, false)?;
        classifier.switch_adapter(name)?;
    }
    classifier.warm_up()?;

    let folder = ImageFolder::scan(data_dir)
        .with_context(|| format!("scanning {}", data_dir.display()))?;
    let mut monitor = PerformanceMonitor::for_device(
        config.experiment_name(),
        &config.monitor.log_dir,
        format.unwrap_or(config.monitor.format),
        &ctx,
    );
    let summary = session::evaluate_folder(&classifier, &folder, &mut monitor)?;
    let report = monitor.report();
    let paths = monitor.save_report()?;

    println!("--- REPORT: {} ---", report.experiment);
    println!("Frames:        {} ({} skipped)", summary.evaluated, summary.skipped);
    println!("AVG latency:   {:.2} ms", report.mean_latency_ms);
    if let Some(accuracy) = report.accuracy {
        println!("Accuracy:      {:.1}%", accuracy * 100.0);
    }
    if let Some(balanced) = report.balanced_accuracy {
        println!("Balanced acc.: {:.1}%", balanced * 100.0);
    }
    if let Some(mcc) = report.mcc {
        println!("MCC:           {mcc:.4}");
    }
    if let Some(log_loss) = report.log_loss {
        println!("Log-loss:      {log_loss:.4}");
    }
    println!("AVG entropy:   {:.4}", report.mean_entropy);
    println!("Log saved to:  {}", paths.log.display());
    Ok(())
}

fn baseline(
    model: &str,
    device: &str,
    threshold: f32,
    folders: &[PathBuf],
) -> anyhow::Result<()> {
    let ctx = DeviceContext::from_name(device)?;
    let base = BaseModel::load(model, &ctx, None)?;
    let classifier = AdaptiveClassifier::new(Arc::new(base));
    let gate = UncertaintyGate::new(threshold);

    for folder in folders {
        println!("--- {} ---", folder.display());
        if !folder.is_dir() {
            println!("Folder not found, skipping");
            continue;
        }
        let images = list_images(folder)?;
        match session::mean_entropy(&classifier, &images, &gate)? {
            None => println!("No images found."),
            Some(summary) => {
                println!("Processed {} images.", summary.images);
                println!("Average entropy: {:.4}", summary.mean_entropy);
                match summary.assessment {
                    Assessment::Confident => println!("Verdict: confident"),
                    Assessment::Confused => println!("Verdict: confused (domain shift)"),
                }
            }
        }
    }
    Ok(())
}
