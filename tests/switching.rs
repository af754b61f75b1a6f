//! End-to-end adapter switching, inference and monitoring.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use candle_core::{DType, Device, Tensor};
use edge_lora::monitor::NullMemory;
use edge_lora::{
    AdapterVariant, AdaptiveClassifier, BaseModel, DeviceContext, EdgeError, InferenceResult,
    LogFormat, LoraConfig, LoraInitialization, PerformanceMonitor, SaveLoad, SessionReport,
};
use tempfile::TempDir;

fn classifier() -> anyhow::Result<AdaptiveClassifier> {
    let base = BaseModel::load("edgenet-tiny", &DeviceContext::cpu(), None)?;
    Ok(AdaptiveClassifier::new(Arc::new(base)))
}

fn expert(variant: AdapterVariant) -> LoraConfig {
    LoraConfig {
        r: 4,
        alpha: 8.0,
        variant,
        target_modules: vec!["fc".into(), "classifier".into()],
        init_lora_weights: LoraInitialization::Gaussian,
        ..Default::default()
    }
}

fn dummy_input() -> anyhow::Result<Tensor> {
    Ok(Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu)?)
}

fn snapshot(
    classifier: &AdaptiveClassifier,
    name: &str,
) -> anyhow::Result<HashMap<String, Vec<f32>>> {
    let adapter = classifier.registry().get_adapter(name)?;
    let mut out = HashMap::new();
    for (key, tensor) in adapter.state_dict()? {
        out.insert(key, tensor.flatten_all()?.to_vec1::<f32>()?);
    }
    Ok(out)
}

fn base_weights(classifier: &AdaptiveClassifier) -> anyhow::Result<Vec<Vec<f32>>> {
    let base = classifier.base();
    let mut out = Vec::new();
    for name in base.layer_names() {
        if let Some(layer) = base.layer(name) {
            out.push(layer.weight().flatten_all()?.to_vec1::<f32>()?);
        }
    }
    Ok(out)
}

#[test]
fn empty_registry_predicts_base_only() -> anyhow::Result<()> {
    let classifier = classifier()?;
    let image = image::DynamicImage::new_rgb8(48, 48);
    let result = classifier.predict(&image)?;
    assert_eq!(result.adapter, None);
    assert_eq!(result.adapter_label(), "none");
    Ok(())
}

#[test]
fn cyclic_switching_records_every_frame() -> anyhow::Result<()> {
    let mut classifier = classifier()?;
    let names = ["sunny", "rain", "night"];
    for name in names {
        classifier.add_adapter(name, &expert(AdapterVariant::Standard), false)?;
    }
    let input = dummy_input()?;
    let logs = TempDir::new()?;
    let mut monitor = PerformanceMonitor::new("cycle", logs.path(), LogFormat::Basic)
        .with_memory_probe(NullMemory);

    let mut expected = Vec::new();
    for name in names.iter().cycle().take(100) {
        classifier.switch_adapter(name)?;
        monitor.start_frame();
        let result = classifier.predict_tensor(&input)?;
        monitor.end_frame(None, &result)?;
        expected.push(*name);
    }

    let records = monitor.records();
    assert_eq!(records.len(), 100);
    for (record, name) in records.iter().zip(&expected) {
        assert!(record.latency_ms >= 0.0);
        assert_eq!(record.adapter, *name);
    }
    Ok(())
}

#[test]
fn switching_never_mutates_adapters_or_base() -> anyhow::Result<()> {
    let mut classifier = classifier()?;
    classifier.add_adapter("a", &expert(AdapterVariant::Standard), false)?;
    classifier.add_adapter("b", &expert(AdapterVariant::WeightDecomposed), false)?;
    let a_before = snapshot(&classifier, "a")?;
    let b_before = snapshot(&classifier, "b")?;
    let base_before = base_weights(&classifier)?;

    let input = dummy_input()?;
    for name in ["a", "b", "a"] {
        classifier.switch_adapter(name)?;
        classifier.predict_tensor(&input)?;
    }

    assert_eq!(snapshot(&classifier, "a")?, a_before);
    assert_eq!(snapshot(&classifier, "b")?, b_before);
    assert_eq!(base_weights(&classifier)?, base_before);
    Ok(())
}

#[test]
fn same_adapter_gives_same_output_after_round_trip() -> anyhow::Result<()> {
    let mut classifier = classifier()?;
    classifier.add_adapter("a", &expert(AdapterVariant::Standard), false)?;
    classifier.add_adapter("b", &expert(AdapterVariant::Standard), false)?;
    let input = dummy_input()?;

    classifier.switch_adapter("a")?;
    let first = classifier.predict_tensor(&input)?;
    classifier.switch_adapter("b")?;
    let other = classifier.predict_tensor(&input)?;
    classifier.switch_adapter("a")?;
    let again = classifier.predict_tensor(&input)?;

    assert_eq!(first.probabilities, again.probabilities);
    assert_ne!(first.probabilities, other.probabilities);
    Ok(())
}

#[test]
fn accuracy_matches_report() -> anyhow::Result<()> {
    let logs = TempDir::new()?;
    let mut monitor = PerformanceMonitor::new("accuracy", logs.path(), LogFormat::Strict)
        .with_memory_probe(NullMemory);
    for (truth, prediction) in [(0, 0), (1, 1), (0, 1)] {
        let mut probs = vec![0.25f32; 2];
        probs[prediction] = 0.75;
        let result = InferenceResult::from_probabilities(probs, None);
        monitor.start_frame();
        monitor.end_frame(Some(truth), &result)?;
    }
    let accuracy = monitor.report().accuracy.unwrap_or_default();
    assert!((accuracy - 2.0 / 3.0).abs() < 1e-12);
    Ok(())
}

#[test]
fn report_is_pure() -> anyhow::Result<()> {
    let mut classifier = classifier()?;
    classifier.add_adapter("rain", &expert(AdapterVariant::Standard), false)?;
    classifier.switch_adapter("rain")?;
    let input = dummy_input()?;
    let logs = TempDir::new()?;
    let mut monitor = PerformanceMonitor::new("pure", logs.path(), LogFormat::Strict)
        .with_memory_probe(NullMemory);
    for truth in [0, 3, 7, 3] {
        monitor.start_frame();
        let result = classifier.predict_tensor(&input)?;
        monitor.end_frame(Some(truth), &result)?;
    }

    let before = monitor.report();
    assert_eq!(before, monitor.report());

    let paths = monitor.save_report()?;
    assert_eq!(monitor.records().len(), 4);
    assert_eq!(monitor.report(), before);

    let summary = paths
        .summary
        .ok_or_else(|| anyhow::anyhow!("strict report has a summary"))?;
    let saved: SessionReport = serde_json::from_str(&fs::read_to_string(summary)?)?;
    assert_eq!(saved.frames, before.frames);
    assert_eq!(saved.labelled_frames, before.labelled_frames);
    assert_eq!(saved.confusion, before.confusion);
    assert_eq!(saved.per_class.len(), before.per_class.len());
    Ok(())
}

#[test]
fn duplicate_add_is_rejected() -> anyhow::Result<()> {
    let mut classifier = classifier()?;
    let config = expert(AdapterVariant::Standard);
    classifier.add_adapter("sunny", &config, false)?;
    let second = classifier.add_adapter("sunny", &config, false);

    assert!(matches!(second, Err(EdgeError::AdapterAlreadyExists { .. })));
    assert_eq!(classifier.adapter_names(), vec!["sunny"]);
    Ok(())
}

#[test]
fn unknown_switch_leaves_active_adapter() -> anyhow::Result<()> {
    let mut classifier = classifier()?;
    classifier.add_adapter("night", &expert(AdapterVariant::Standard), false)?;
    classifier.switch_adapter("night")?;

    assert!(matches!(
        classifier.switch_adapter("snow"),
        Err(EdgeError::AdapterNotFound { .. })
    ));
    assert_eq!(classifier.active_adapter_name(), Some("night"));

    let zeros = Tensor::zeros((1, 3, 32, 32), DType::F32, &Device::Cpu)?;
    assert_eq!(classifier.predict_tensor(&zeros)?.adapter_label(), "night");
    Ok(())
}

#[test]
fn end_frame_without_start_fails() -> anyhow::Result<()> {
    let logs = TempDir::new()?;
    let mut monitor = PerformanceMonitor::new("misuse", logs.path(), LogFormat::Basic);
    let result = InferenceResult::from_probabilities(vec![1.0], None);
    assert!(matches!(
        monitor.end_frame(None, &result),
        Err(EdgeError::FrameNotStarted)
    ));
    Ok(())
}

#[test]
fn checkpoint_survives_reload_into_registry() -> anyhow::Result<()> {
    let mut classifier = classifier()?;
    classifier.add_adapter("fog", &expert(AdapterVariant::WeightDecomposed), false)?;
    let dir = TempDir::new()?;
    let checkpoint = dir.path().join(edge_lora::ADAPTER_DIR_NAME);
    classifier.save_adapter("fog", &checkpoint)?;

    classifier.load_adapter(&checkpoint, "fog_copy", false)?;
    assert_eq!(snapshot(&classifier, "fog")?, snapshot(&classifier, "fog_copy")?);
    assert!(classifier.load_adapter(&checkpoint, "fog", false).is_err());
    Ok(())
}

fn median_switch_time(adapters: usize) -> anyhow::Result<Duration> {
    let mut classifier = classifier()?;
    let config = expert(AdapterVariant::Standard);
    let names: Vec<String> = (0..adapters).map(|i| format!("domain_{i}")).collect();
    for name in &names {
        classifier.add_adapter(name, &config, false)?;
    }

    let mut samples = Vec::with_capacity(2000);
    for name in names.iter().cycle().take(2000) {
        let start = Instant::now();
        classifier.switch_adapter(name)?;
        samples.push(start.elapsed());
    }
    samples.sort_unstable();
    Ok(samples[samples.len() / 2])
}

#[test]
fn switch_cost_is_flat_in_registry_size() -> anyhow::Result<()> {
    let small = median_switch_time(2)?;
    let large = median_switch_time(50)?;
    // coarse bound; timer resolution dominates at this scale
    let limit = small * 20 + Duration::from_micros(50);
    assert!(large <= limit, "2 adapters: {small:?}, 50 adapters: {large:?}");
    Ok(())
}
