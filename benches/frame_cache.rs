//! Benchmarks for the frame caches
//!
//! The render loop pulls one visual and one animation frame per tick, so both
//! lookups and versioned appends need to stay well under a frame budget.

use avatar_sync::FrameStore;
use avatar_sync::cache::{FrameCache, StreamKind};
use avatar_sync::types::{BodyFrame, DecodedImage, FaceFrame, FrameRecord, VisualFrame};
use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;

const FRAMES: u32 = 1_000;

fn body(body_id: u32, start: u32, len: u32) -> FrameRecord<BodyFrame> {
    FrameRecord::new(
        start,
        start + len,
        BodyFrame {
            body_id,
            name: Arc::from("talk01"),
            local_start: 0,
            local_end: len - 1,
            offset: Arc::from(Vec::new()),
            state: None,
        },
    )
}

fn visual(index: u32) -> FrameRecord<VisualFrame> {
    FrameRecord::single(
        index,
        VisualFrame {
            image: DecodedImage::new(1, 1, vec![0u8; 4]),
            clip: Arc::from("talk01"),
            body_id: 1,
            local_index: index % 25,
            offset: Arc::from(Vec::new()),
        },
    )
}

/// A store holding `FRAMES` frames of every stream.
fn filled_store() -> FrameStore {
    let store = FrameStore::new();
    store.append_body((0..FRAMES / 25).map(|i| body(1, i * 25, 25)).collect());
    store.append_face((0..FRAMES).map(|i| FrameRecord::single(i, FaceFrame::default())).collect());
    for index in 0..FRAMES {
        store.insert_visual(visual(index));
    }
    store
}

fn bench_versioned_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("body_append");
    group.throughput(Throughput::Elements(u64::from(FRAMES / 25)));

    group.bench_function("fresh", |b| {
        b.iter_batched(
            || FrameCache::<BodyFrame>::new(StreamKind::Body),
            |mut cache| {
                let outcome = cache.append_batch((0..FRAMES / 25).map(|i| body(1, i * 25, 25)));
                black_box(outcome)
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("supersede", |b| {
        b.iter_batched(
            || {
                let mut cache = FrameCache::<BodyFrame>::new(StreamKind::Body);
                cache.append_batch((0..FRAMES / 25).map(|i| body(1, i * 25, 25)));
                cache
            },
            |mut cache| {
                let outcome = cache.append_batch((0..FRAMES / 25).map(|i| body(2, i * 25, 25)));
                black_box(outcome)
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_render_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_loop");
    group.throughput(Throughput::Elements(u64::from(FRAMES)));

    group.bench_function("visual_and_animation", |b| {
        b.iter_batched(
            filled_store,
            |store| {
                for index in 0..FRAMES {
                    black_box(store.next_visual_frame(index));
                    black_box(store.next_animation_frame(index));
                }
            },
            BatchSize::LargeInput,
        )
    });

    group.bench_function("body_lookup", |b| {
        let store = filled_store();
        let mut index = 0;
        b.iter(|| {
            index = (index + 7) % FRAMES;
            black_box(store.body_at(index))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_versioned_append, bench_render_loop);
criterion_main!(benches);
