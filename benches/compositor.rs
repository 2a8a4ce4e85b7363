use car_whitebg::{
    backends::ScriptedBackend,
    compositor::{apply_border_fallback, Compositor},
    config::RemovalConfig,
    processor::WhiteBackgroundProcessor,
    services::ImageIOService,
    types::Mask,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::{Rgba, RgbaImage};
use std::sync::Arc;
use tokio::runtime::Runtime;

const SIZES: [(u32, u32); 3] = [(640, 480), (1920, 1080), (4000, 3000)];

fn photo(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
    })
}

/// Ellipse covering the middle of the frame
fn subject_mask(width: u32, height: u32) -> Mask {
    let (cx, cy) = (f64::from(width) / 2.0, f64::from(height) / 2.0);
    let image = image::GrayImage::from_fn(width, height, |x, y| {
        let dx = (f64::from(x) - cx) / cx;
        let dy = (f64::from(y) - cy) / cy;
        image::Luma([if dx * dx + dy * dy < 0.5 { 255 } else { 0 }])
    });
    Mask::from_luma(image)
}

fn bench_mask_application(c: &mut Criterion) {
    let compositor = Compositor::default();
    let mut group = c.benchmark_group("mask_application");
    group.sample_size(20);

    for (width, height) in SIZES {
        let image = photo(width, height);
        let full_mask = subject_mask(width, height);
        let model_mask = subject_mask(128, 128);

        group.bench_function(format!("{width}x{height}_full_resolution"), |b| {
            b.iter(|| compositor.composite(black_box(&image), Some(black_box(&full_mask))));
        });
        group.bench_function(format!("{width}x{height}_resampled_128"), |b| {
            b.iter(|| compositor.composite(black_box(&image), Some(black_box(&model_mask))));
        });
    }
    group.finish();
}

fn bench_border_fallback(c: &mut Criterion) {
    let mut group = c.benchmark_group("border_fallback");
    group.sample_size(20);

    for (width, height) in SIZES {
        let image = photo(width, height);
        group.bench_function(format!("{width}x{height}"), |b| {
            b.iter(|| apply_border_fallback(black_box(&image), black_box(0.1)));
        });
    }
    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let processor = WhiteBackgroundProcessor::with_backend(
        RemovalConfig::default(),
        Arc::new(ScriptedBackend::uniform("car", 128, 128, 255)),
    )
    .expect("processor");
    let upload = ImageIOService::encode_png(&photo(1920, 1080)).expect("png");

    let mut group = c.benchmark_group("pipeline");
    group.sample_size(10);
    group.bench_function("decode_composite_encode_1920x1080", |b| {
        b.iter(|| rt.block_on(processor.process_bytes(black_box(&upload))));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_mask_application,
    bench_border_fallback,
    bench_pipeline
);
criterion_main!(benches);
