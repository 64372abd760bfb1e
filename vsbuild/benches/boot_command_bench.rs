//! Benchmarks for boot command rendering and key planning.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vsbuild::bootcommand::{batches, parse, render, BootVars, MAX_KEYS_PER_BATCH};

const UBUNTU: &str = "<esc><wait><esc><wait><f6><wait><esc><wait>\
    <bs><bs><bs><bs><bs> autoinstall ds=nocloud-net;s=http://{{ .HTTPIP }}:{{ .HTTPPort }}/ \
    hostname={{ .Name }} --- <leftCtrlOn>x<leftCtrlOff><wait5><enter>";

fn vars() -> BootVars {
    BootVars {
        http_ip: Some("10.0.0.1".into()),
        http_port: Some(8080),
        name: "ubuntu".into(),
    }
}

fn boot_command_benchmark(c: &mut Criterion) {
    let vars = vars();
    let rendered = render(UBUNTU, &vars).expect("template renders");
    let actions = parse(&rendered).expect("command parses");

    c.bench_function("render", |b| b.iter(|| render(black_box(UBUNTU), &vars)));
    c.bench_function("parse", |b| b.iter(|| parse(black_box(&rendered))));
    c.bench_function("batches", |b| {
        b.iter(|| batches(black_box(&actions), MAX_KEYS_PER_BATCH))
    });
}

criterion_group!(benches, boot_command_benchmark);
criterion_main!(benches);
