// Copyright 2025 Cowboy AI, LLC.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use eventbridge::event::{Envelope, Event};
use eventbridge::rule::pattern::{MatchRegistry, Matcher};
use eventbridge::rule::transform::Transformer;
use eventbridge::rule::{Target, TargetForm, TargetId, TargetParam};
use serde_json::Value;

fn envelope_with_data(data: &str) -> Envelope {
    Envelope::new(
        Event {
            id: 1,
            source: "orders-service".into(),
            ty: "order.created".into(),
            subject: String::new(),
            time: Utc::now(),
            datacontenttype: "application/json".into(),
            data: data.to_string(),
        },
        "Default",
    )
}

fn compile_pattern(spec: &str) -> Matcher {
    let registry = MatchRegistry::with_builtins();
    let value: Value = serde_json::from_str(spec).unwrap();
    Matcher::compile(&value, &registry).unwrap()
}

fn benchmark_flat_field_match(c: &mut Criterion) {
    let matcher = compile_pattern(r#"{"data":{"status":["active","pending"]}}"#);
    let env = envelope_with_data(r#"{"status":"active"}"#);

    c.bench_function("pattern_flat_field_match", |b| {
        b.iter(|| matcher.matches(black_box(&env)).unwrap())
    });
}

fn benchmark_nested_and_or_match(c: &mut Criterion) {
    let matcher = compile_pattern(
        r#"{
            "data": {
                "region": ["us-east-1", "us-west-2"],
                "count": [{"numeric": [">", 0, "<=", 100]}],
                "tags": [{"anything-but": {"prefix": "internal-"}}]
            },
            "source": ["orders-service"]
        }"#,
    );
    let env = envelope_with_data(r#"{"region":"us-east-1","count":42,"tags":"external-high-priority"}"#);

    c.bench_function("pattern_nested_and_or_match", |b| {
        b.iter(|| matcher.matches(black_box(&env)).unwrap())
    });
}

fn benchmark_cidr_match(c: &mut Criterion) {
    let matcher = compile_pattern(r#"{"data":{"source_ip":[{"cidr":"10.0.0.0/8"}]}}"#);
    let env = envelope_with_data(r#"{"source_ip":"10.42.17.3"}"#);

    c.bench_function("pattern_cidr_match", |b| {
        b.iter(|| matcher.matches(black_box(&env)).unwrap())
    });
}

fn benchmark_pattern_compile(c: &mut Criterion) {
    let spec: Value = serde_json::from_str(
        r#"{
            "data": {
                "region": ["us-east-1", "us-west-2", "eu-west-1"],
                "count": [{"numeric": [">", 0, "<=", 100]}],
                "tags": [{"anything-but": {"prefix": "internal-"}}],
                "source_ip": [{"cidr": "10.0.0.0/8"}]
            }
        }"#,
    )
    .unwrap();

    c.bench_function("pattern_compile", |b| {
        b.iter(|| {
            let registry = MatchRegistry::with_builtins();
            Matcher::compile(black_box(&spec), &registry).unwrap()
        })
    });
}

fn benchmark_transform_by_param_count(c: &mut Criterion) {
    let env = envelope_with_data(r#"{"region":"us-east-1","count":42,"name":"widget-7"}"#);

    let mut group = c.benchmark_group("transform_by_param_count");
    for param_count in [0usize, 1, 4, 16].iter() {
        let params: Vec<TargetParam> = (0..*param_count)
            .map(|i| TargetParam {
                key: format!("field_{i}"),
                form: TargetForm::Jsonpath,
                value: "$.data.region".into(),
                template: None,
            })
            .collect();
        let target = Target {
            id: TargetId(1),
            ty: "HTTPDispatcher".into(),
            params,
            retry_strategy: None,
        };
        let transformer = Transformer::compile(&target).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(param_count), &transformer, |b, transformer| {
            b.iter(|| transformer.transform(black_box(&env)).unwrap())
        });
    }
    group.finish();
}

fn benchmark_template_transform(c: &mut Criterion) {
    let target = Target {
        id: TargetId(1),
        ty: "HTTPDispatcher".into(),
        params: vec![TargetParam {
            key: "message".into(),
            form: TargetForm::Template,
            value: r#"{"region":"$.data.region","name":"$.data.name"}"#.into(),
            template: Some(r#""order ${name} placed in ${region}""#.into()),
        }],
        retry_strategy: None,
    };
    let transformer = Transformer::compile(&target).unwrap();
    let env = envelope_with_data(r#"{"region":"us-east-1","name":"widget-7"}"#);

    c.bench_function("transform_template_render", |b| {
        b.iter(|| transformer.transform(black_box(&env)).unwrap())
    });
}

criterion_group!(
    benches,
    benchmark_flat_field_match,
    benchmark_nested_and_or_match,
    benchmark_cidr_match,
    benchmark_pattern_compile,
    benchmark_transform_by_param_count,
    benchmark_template_transform,
);

criterion_main!(benches);
