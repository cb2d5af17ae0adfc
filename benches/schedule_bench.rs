use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use hwenc_sched::loopback::LoopbackBackend;
use hwenc_sched::{
    CapabilityFlags, EncodeError, EncodeScheduler, EncoderCapabilities, InputFrame,
    ReceiveStatus, SchedulerConfig, SurfaceHandle,
};

fn run_schedule(
    config: &SchedulerConfig,
    caps: &EncoderCapabilities,
    frames: u64,
) -> Result<usize, EncodeError> {
    let mut scheduler =
        EncodeScheduler::new(config.clone(), caps.clone(), Box::new(LoopbackBackend::new()))?;
    let mut packets = 0usize;
    for i in 0..frames {
        let frame = InputFrame::new(SurfaceHandle(i), i as i64 * 3_000, 3_000);
        loop {
            match scheduler.send_frame(frame.clone()) {
                Ok(()) => break,
                Err(err) if err.is_backpressure() => {
                    if let ReceiveStatus::Packet(_) = scheduler.receive_packet()? {
                        packets += 1;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        while let ReceiveStatus::Packet(_) = scheduler.receive_packet()? {
            packets += 1;
        }
    }
    packets += scheduler.drain()?.len();
    scheduler.close()?;
    Ok(packets)
}

fn schedule_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule_loopback");
    group.sample_size(30);
    group.measurement_time(Duration::from_secs(5));
    group.warm_up_time(Duration::from_secs(1));

    let frames = 600u64;
    let caps = EncoderCapabilities {
        flags: CapabilityFlags::B_PICTURES
            | CapabilityFlags::B_PICTURE_REFERENCES
            | CapabilityFlags::ASYNC_ENCODE,
        max_refs_l0: 2,
        max_refs_l1: 1,
        ..EncoderCapabilities::default()
    };

    for (label, max_b_frames, b_depth) in [("p_only", 0, 1), ("b2", 2, 1), ("pyramid7", 7, 3)] {
        for async_depth in [1usize, 4, 16] {
            let config = SchedulerConfig {
                gop_size: 120,
                max_b_frames,
                b_depth,
                async_depth,
                report_metrics: Some(false),
                ..SchedulerConfig::default()
            };
            group.throughput(Throughput::Elements(frames));
            group.bench_with_input(
                BenchmarkId::new(label, format!("async_{async_depth}")),
                &config,
                |b, config| {
                    b.iter(|| {
                        run_schedule(config, &caps, frames)
                            .expect("scheduling should succeed in benchmark");
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, schedule_benchmark);
criterion_main!(benches);
