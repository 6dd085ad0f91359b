use criterion::{black_box, criterion_group, criterion_main, Criterion};
use iq_slurper::{
    complex::{Iq, RawFormat, SampleBlock},
    f_engine::{clamp_fft_size, EngineOptions, SpectralEngine},
    range::DbRange,
    waterfall::{palette_index, Palette, Waterfall, DEFAULT_LINES, DEFAULT_STEPS},
};
use rand::prelude::*;

const SIZE: usize = 512;
const BUFFERS: usize = 12;

fn benchmark(c: &mut Criterion) {
    let mut rng = rand::thread_rng();

    let mut raw = vec![0u8; SIZE * BUFFERS * RawFormat::PcmS16.bytes_per_sample()];
    rng.fill(&mut raw[..]);
    let samples: Vec<Iq> = (0..SIZE * BUFFERS)
        .map(|_| Iq::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
        .collect();

    let range = DbRange::new(-130.0, -20.0).unwrap();
    let mut engine = SpectralEngine::new(
        clamp_fft_size(SIZE, 1280),
        EngineOptions {
            buffers: BUFFERS,
            ..Default::default()
        },
        range,
    );
    let spectrum = engine.process(SampleBlock::new(0, samples.clone()));
    let mut waterfall = Waterfall::new(SIZE, DEFAULT_LINES, DEFAULT_STEPS, range, Palette::Classic);

    c.bench_function("pcm unpacking", |b| {
        let mut out = Vec::with_capacity(SIZE * BUFFERS);
        b.iter(|| {
            out.clear();
            RawFormat::PcmS16.unpack(black_box(&raw), &mut out)
        })
    });

    c.bench_function("spectrum", |b| {
        b.iter(|| engine.process(black_box(SampleBlock::new(0, samples.clone()))))
    });

    c.bench_function("waterfall accumulate", |b| {
        b.iter(|| {
            waterfall.accumulate(black_box(&spectrum), 4);
        })
    });

    c.bench_function("palette index", |b| {
        b.iter(|| {
            spectrum
                .bins
                .iter()
                .map(|&db| palette_index(black_box(db), &range, DEFAULT_STEPS) as u32)
                .sum::<u32>()
        })
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
