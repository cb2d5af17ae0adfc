use std::collections::HashMap;

use hwenc_sched::loopback::{LoopbackBackend, LoopbackPrivate, LoopbackProbe, LoopbackState};
use hwenc_sched::{
    CapabilityFlags, EncodeScheduler, EncoderCapabilities, InputFrame, MAX_DPB_SIZE,
    MAX_PICTURE_REFERENCES, Packet, PictureType, ReceiveStatus, SchedulerConfig, SurfaceHandle,
};
use rstest::rstest;

const B_ASYNC: CapabilityFlags = CapabilityFlags::B_PICTURES.union(CapabilityFlags::ASYNC_ENCODE);

struct Run {
    packets: Vec<Packet>,
    state: LoopbackState,
    live_after_drain: usize,
}

fn caps(flags: CapabilityFlags) -> EncoderCapabilities {
    EncoderCapabilities {
        flags,
        max_refs_l0: 2,
        max_refs_l1: 1,
        ..EncoderCapabilities::default()
    }
}

fn encode(
    config: SchedulerConfig,
    flags: CapabilityFlags,
    frames: i64,
    forced_idr: &[i64],
) -> Run {
    encode_with(config, caps(flags), frames, forced_idr)
}

fn encode_with(
    config: SchedulerConfig,
    caps: EncoderCapabilities,
    frames: i64,
    forced_idr: &[i64],
) -> Run {
    let backend = LoopbackBackend::new();
    let probe: LoopbackProbe = backend.probe();
    let mut sched: EncodeScheduler<LoopbackPrivate> =
        EncodeScheduler::new(config, caps, Box::new(backend))
            .expect("scheduler should accept config");

    let mut packets = Vec::new();
    for i in 0..frames {
        let mut frame = InputFrame::new(SurfaceHandle(i as u64), 1_000 + i * 33, 33);
        frame.force_idr = forced_idr.contains(&i);
        frame.opaque = Some(i as u64);
        loop {
            match sched.send_frame(frame.clone()) {
                Ok(()) => break,
                Err(err) if err.is_backpressure() => match sched.receive_packet() {
                    Ok(ReceiveStatus::Packet(packet)) => packets.push(packet),
                    other => panic!("backpressure without progress: {other:?}"),
                },
                Err(err) => panic!("send_frame failed: {err}"),
            }
        }
        while let ReceiveStatus::Packet(packet) = sched.receive_packet().expect("receive") {
            packets.push(packet);
        }
    }
    packets.extend(sched.drain().expect("drain"));
    let live_after_drain = sched.live_pictures();
    sched.close().expect("close");

    Run {
        packets,
        state: probe.snapshot(),
        live_after_drain,
    }
}

fn config(gop_size: u32, max_b_frames: u32, b_depth: u32, async_depth: usize) -> SchedulerConfig {
    SchedulerConfig {
        gop_size,
        max_b_frames,
        b_depth,
        async_depth,
        report_metrics: Some(false),
        ..SchedulerConfig::default()
    }
}

fn types_by_display(run: &Run) -> Vec<PictureType> {
    let mut packets = run.packets.iter().collect::<Vec<_>>();
    packets.sort_by_key(|p| p.display_order);
    packets.iter().map(|p| p.picture_type).collect()
}

#[rstest]
#[case::p_only(config(8, 0, 1, 2), B_ASYNC, 30)]
#[case::one_level_b(config(16, 2, 1, 4), B_ASYNC, 40)]
#[case::b_pyramid(config(30, 3, 2, 2), B_ASYNC | CapabilityFlags::B_PICTURE_REFERENCES, 45)]
#[case::deep_pyramid(config(32, 7, 3, 8), B_ASYNC | CapabilityFlags::B_PICTURE_REFERENCES, 64)]
#[case::sync_pyramid(config(12, 3, 3, 1), CapabilityFlags::B_PICTURES | CapabilityFlags::B_PICTURE_REFERENCES, 50)]
#[case::multi_past(config(10, 2, 1, 3), B_ASYNC | CapabilityFlags::MULTI_PAST_REFERENCES, 33)]
#[case::open_gop(SchedulerConfig { idr_interval: 3, ..config(8, 2, 1, 2) }, B_ASYNC | CapabilityFlags::NON_IDR_KEY_PICTURES, 40)]
#[case::intra_only(config(1, 2, 1, 2), B_ASYNC, 12)]
#[case::p_per_i_with_b(SchedulerConfig { p_per_i: Some(1), ..config(100, 2, 1, 2) }, B_ASYNC, 24)]
fn reference_graph_invariants_hold(
    #[case] config: SchedulerConfig,
    #[case] flags: CapabilityFlags,
    #[case] frames: i64,
) {
    let async_depth = config.async_depth;
    let run = encode(config, flags, frames, &[13]);
    let state = &run.state;

    assert!(state.violations.is_empty(), "{:?}", state.violations);
    assert_eq!(run.packets.len() as i64, frames);

    let mut encode_orders = run.packets.iter().map(|p| p.encode_order).collect::<Vec<_>>();
    encode_orders.sort_unstable();
    assert_eq!(encode_orders, (0..frames).collect::<Vec<_>>());

    let encode_of = state
        .issues
        .iter()
        .map(|r| (r.display_order, r.encode_order))
        .collect::<HashMap<_, _>>();
    let is_reference = state
        .issues
        .iter()
        .map(|r| (r.display_order, r.is_reference))
        .collect::<HashMap<_, _>>();

    for record in &state.issues {
        assert!(record.past.len() <= MAX_PICTURE_REFERENCES);
        assert!(record.future.len() <= MAX_PICTURE_REFERENCES);
        assert!(record.dpb.len() <= MAX_DPB_SIZE);
        for target in record.past.iter().chain(&record.future) {
            assert!(
                encode_of[target] < record.encode_order,
                "picture {} issued before its reference {target}",
                record.display_order
            );
        }
        for slot in &record.dpb {
            if *slot != record.display_order {
                assert!(is_reference[slot], "non-reference {slot} resident in dpb");
            }
        }
        if let Some(prev) = record.prev {
            assert!(record.past.contains(&prev) || record.dpb.contains(&prev));
        } else {
            assert_eq!(record.picture_type, PictureType::Idr);
        }
        if record.picture_type == PictureType::Idr {
            assert!(record.past.is_empty() && record.future.is_empty());
            assert_eq!(record.dpb, vec![record.display_order]);
        }
    }

    // References never reach back past the most recent IDR in encode order.
    let mut by_encode = state.issues.iter().collect::<Vec<_>>();
    by_encode.sort_by_key(|r| r.encode_order);
    let mut last_idr = 0;
    for record in by_encode {
        if record.picture_type == PictureType::Idr {
            last_idr = record.encode_order;
            continue;
        }
        for target in record.past.iter().chain(&record.future) {
            assert!(
                encode_of[target] >= last_idr,
                "picture {} references {target} across an IDR",
                record.display_order
            );
        }
    }

    assert!(state.peak_in_flight <= async_depth);
    assert_eq!(state.in_flight, 0);
    assert_eq!(state.allocated, frames as u64);
    assert_eq!(state.freed, frames as u64);
    assert_eq!(run.live_after_drain, 0);

    let types = types_by_display(&run);
    assert_eq!(types[13], PictureType::Idr);
}

#[rstest]
#[case::p_only(config(8, 0, 1, 2), B_ASYNC)]
#[case::one_level_b(config(16, 2, 1, 4), B_ASYNC)]
#[case::b_pyramid(config(30, 3, 2, 3), B_ASYNC | CapabilityFlags::B_PICTURE_REFERENCES)]
#[case::deep_pyramid(config(32, 7, 3, 2), B_ASYNC | CapabilityFlags::B_PICTURE_REFERENCES)]
fn dts_is_monotonic_and_never_after_pts(
    #[case] config: SchedulerConfig,
    #[case] flags: CapabilityFlags,
) {
    let run = encode(config, flags, 50, &[]);
    for pair in run.packets.windows(2) {
        assert!(pair[0].dts <= pair[1].dts, "{} then {}", pair[0], pair[1]);
        assert!(pair[0].encode_order < pair[1].encode_order);
    }
    for packet in &run.packets {
        assert!(packet.dts <= packet.pts, "{packet}");
        assert_eq!(packet.opaque, Some(packet.display_order as u64));
    }
}

#[test]
fn no_delay_backend_gets_pts_as_dts() {
    let run = encode(
        config(16, 2, 1, 2),
        B_ASYNC | CapabilityFlags::TIMESTAMP_NO_DELAY,
        20,
        &[],
    );
    assert!(run.packets.iter().all(|p| p.dts == p.pts));
}

#[test]
fn b_depth_zero_codes_every_non_key_picture_as_p() {
    let run = encode(
        config(10, 3, 0, 2),
        B_ASYNC | CapabilityFlags::B_PICTURE_REFERENCES,
        25,
        &[],
    );
    for ty in types_by_display(&run) {
        assert!(ty.is_key() || ty == PictureType::P, "unexpected {ty}");
    }
    let display = run.packets.iter().map(|p| p.display_order).collect::<Vec<_>>();
    assert_eq!(display, (0..25).collect::<Vec<_>>());
}

#[rstest]
#[case::p_only(0)]
#[case::with_b(2)]
fn idr_interval_places_idr_every_second_gop(#[case] max_b_frames: u32) {
    let config = SchedulerConfig {
        idr_interval: 2,
        ..config(8, max_b_frames, 1, 2)
    };
    let run = encode(
        config,
        B_ASYNC | CapabilityFlags::NON_IDR_KEY_PICTURES,
        20,
        &[],
    );
    let types = types_by_display(&run);
    let idr = types
        .iter()
        .enumerate()
        .filter(|(_, ty)| **ty == PictureType::Idr)
        .map(|(pos, _)| pos)
        .collect::<Vec<_>>();
    assert_eq!(idr, vec![0, 16]);
    assert_eq!(types[8], PictureType::I);
    let keyframes = run
        .packets
        .iter()
        .filter(|p| p.is_keyframe)
        .map(|p| p.display_order)
        .collect::<Vec<_>>();
    assert_eq!(keyframes, vec![0, 16]);
}

#[test]
fn open_gop_cadence_with_b_pictures() {
    use PictureType::{B, I, Idr, P};
    let config = SchedulerConfig {
        idr_interval: 2,
        ..config(8, 2, 1, 2)
    };
    let run = encode(
        config,
        B_ASYNC | CapabilityFlags::NON_IDR_KEY_PICTURES,
        20,
        &[],
    );
    assert_eq!(
        types_by_display(&run),
        vec![Idr, B, B, P, B, B, P, B, I, B, B, P, B, B, P, P, Idr, B, B, P]
    );
}

#[test]
fn forced_idr_promotes_preceding_picture() {
    let run = encode(config(60, 3, 1, 2), B_ASYNC, 12, &[6]);
    let types = types_by_display(&run);
    assert_eq!(types[6], PictureType::Idr);
    assert_eq!(types[5], PictureType::P);
    assert_eq!(types[4], PictureType::P);
    assert!(types[1..4].iter().all(|ty| *ty == PictureType::B));
}

#[rstest]
#[case::single_l0(1, 1)]
#[case::two_l0(2, 2)]
fn multi_past_references_follow_l0_limit(#[case] max_refs_l0: u32, #[case] expected: usize) {
    let caps = EncoderCapabilities {
        flags: CapabilityFlags::ASYNC_ENCODE | CapabilityFlags::MULTI_PAST_REFERENCES,
        max_refs_l0,
        max_refs_l1: 1,
        ..EncoderCapabilities::default()
    };
    let run = encode_with(config(16, 0, 1, 2), caps, 8, &[]);
    assert!(run.state.violations.is_empty(), "{:?}", run.state.violations);
    for record in &run.state.issues {
        assert!(record.past.len() <= max_refs_l0 as usize);
        if record.display_order >= 2 {
            assert_eq!(record.past.len(), expected, "picture {}", record.display_order);
            assert!(record.past.contains(&(record.display_order - 1)));
        }
    }
}
