//! Adapter switching cost against registry size.

#![allow(missing_docs)]

use std::sync::Arc;

use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use edge_lora::{AdaptiveClassifier, BaseModel, DeviceContext, LoraConfig};

fn classifier_with(adapters: usize) -> edge_lora::Result<AdaptiveClassifier> {
    let base = BaseModel::load("edgenet-tiny", &DeviceContext::cpu(), None)?;
    let mut classifier = AdaptiveClassifier::new(Arc::new(base));
    let config = LoraConfig {
        r: 4,
        alpha: 8.0,
        ..Default::default()
    };
    for i in 0..adapters {
        classifier.add_adapter(&format!("domain_{i}"), &config, false)?;
    }
    Ok(classifier)
}

fn bench_switch(c: &mut Criterion) {
    let mut group = c.benchmark_group("switch_adapter");
    for size in [2usize, 50] {
        let mut classifier = classifier_with(size).expect("build classifier");
        let names: Vec<String> = (0..size).map(|i| format!("domain_{i}")).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &names, |b, names| {
            let mut i = 0;
            b.iter(|| {
                let name = &names[i % names.len()];
                i += 1;
                classifier.switch_adapter(black_box(name)).expect("registered");
            });
        });
    }
    group.finish();
}

fn bench_switch_and_predict(c: &mut Criterion) {
    let mut group = c.benchmark_group("switch_and_predict");
    let input = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu).expect("input");
    for size in [2usize, 50] {
        let mut classifier = classifier_with(size).expect("build classifier");
        classifier.warm_up().expect("warm up");
        let names: Vec<String> = (0..size).map(|i| format!("domain_{i}")).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &names, |b, names| {
            let mut i = 0;
            b.iter(|| {
                let name = &names[i % names.len()];
                i += 1;
                classifier.switch_adapter(name).expect("registered");
                classifier.predict_tensor(black_box(&input)).expect("predict")
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_switch, bench_switch_and_predict);
criterion_main!(benches);
