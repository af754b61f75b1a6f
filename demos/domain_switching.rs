//! Domain switching example.
//!
//! This example demonstrates:
//! - Registering one expert per weather domain on a shared backbone
//! - Switching experts per frame while a monitor records latency and entropy
//! - Flagging confused frames with the uncertainty gate

use std::sync::Arc;

use anyhow::Result;
use candle_core::{Device, Tensor};
use edge_lora::{
    AdapterVariant, AdaptiveClassifier, BaseModel, DeviceContext, LogFormat, LoraConfig,
    LoraInitialization, PerformanceMonitor, UncertaintyGate,
};

fn main() -> Result<()> {
    println!("=== Domain Switching Example ===\n");

    let ctx = DeviceContext::cpu();
    let base = BaseModel::load("edgenet-tiny", &ctx, None)?;
    println!("Backbone: {} ({} params)", base.model_id(), base.num_parameters());
    let mut classifier = AdaptiveClassifier::new(Arc::new(base));

    // Nonzero B so each expert visibly moves the output
    for (name, variant) in [
        ("sunny", AdapterVariant::Standard),
        ("rain", AdapterVariant::WeightDecomposed),
        ("night", AdapterVariant::Standard),
    ] {
        let config = LoraConfig {
            r: 4,
            alpha: 8.0,
            variant,
            target_modules: vec!["fc".into(), "classifier".into()],
            init_lora_weights: LoraInitialization::Gaussian,
            ..Default::default()
        };
        classifier.add_adapter(name, &config, false)?;
    }
    println!("Experts resident: {:?}\n", classifier.adapter_names());

    let temp_dir = tempfile::TempDir::new()?;
    let mut monitor =
        PerformanceMonitor::new("domain_switching", temp_dir.path(), LogFormat::Strict);
    let gate = UncertaintyGate::default();
    let frame = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu)?;

    classifier.warm_up()?;
    for (i, domain) in ["sunny", "rain", "night"].iter().cycle().take(9).enumerate() {
        classifier.switch_adapter(domain)?;
        monitor.start_frame();
        let result = classifier.predict_tensor(&frame)?;
        let record = monitor.end_frame(Some(i % 3), &result)?;
        println!(
            "frame {i}: {result} | {:.3} ms | {:?}",
            record.latency_ms,
            gate.assess(result.entropy)
        );
    }

    let report = monitor.report();
    println!("\n=== Summary ===");
    println!("Frames: {}", report.frames);
    println!("Mean latency: {:.3} ms", report.mean_latency_ms);
    println!("Mean entropy: {:.4}", report.mean_entropy);
    let paths = monitor.save_report()?;
    println!("Log written to {}", paths.log.display());

    Ok(())
}
