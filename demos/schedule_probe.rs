use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use hwenc_sched::loopback::{FaultPlan, LoopbackBackend};
use hwenc_sched::{
    CapabilityFlags, EncodeScheduler, EncoderCapabilities, InputFrame, Packet, PictureType,
    ReceiveStatus, SchedulerConfig, SurfaceHandle,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Print the picture types and encode order hwenc-sched produces for a cadence")]
struct Args {
    #[arg(long, default_value_t = 48)]
    frame_count: u64,
    #[arg(long, default_value_t = 30)]
    fps: i64,
    #[arg(long, default_value_t = 16)]
    gop_size: u32,
    #[arg(long, default_value_t = 3)]
    max_b_frames: u32,
    #[arg(long, default_value_t = 2)]
    b_depth: u32,
    #[arg(long, default_value_t = 0)]
    idr_interval: u32,
    #[arg(long, default_value_t = 2)]
    async_depth: usize,
    #[arg(long, default_value_t = false)]
    closed_gop: bool,
    #[arg(long)]
    p_per_i: Option<u32>,

    /// Backend cannot keep B pictures as references.
    #[arg(long, default_value_t = false)]
    no_b_references: bool,
    #[arg(long, default_value_t = false)]
    non_idr_keys: bool,
    #[arg(long, default_value_t = false)]
    multi_past_refs: bool,
    /// Issue and collect every picture in one step.
    #[arg(long, default_value_t = false)]
    sync: bool,
    /// Comma-separated display positions to force to IDR.
    #[arg(long, value_delimiter = ',')]
    force_idr: Vec<u64>,
    #[arg(long)]
    report_metrics: Option<bool>,
}

#[derive(Default)]
struct ProbeSummary {
    packets: usize,
    bytes: usize,
    backpressure: usize,
    receive_ms: Vec<f64>,
}

impl ProbeSummary {
    fn record(&mut self, packet: &Packet) {
        self.packets += 1;
        self.bytes += packet.data.len();
    }

    fn print(&self) {
        println!(
            "packets={}, bytes={}, backpressure={}, receive_mean_ms={:.4}, receive_p95_ms={:.4}",
            self.packets,
            self.bytes,
            self.backpressure,
            mean(&self.receive_ms),
            percentile(&self.receive_ms, 0.95)
        );
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let config = SchedulerConfig {
        gop_size: args.gop_size,
        max_b_frames: args.max_b_frames,
        p_per_i: args.p_per_i,
        idr_interval: args.idr_interval,
        b_depth: args.b_depth,
        async_depth: args.async_depth,
        closed_gop: args.closed_gop,
        report_metrics: args.report_metrics,
    };
    let caps = capabilities(&args);
    let mut scheduler = EncodeScheduler::new(
        config,
        caps,
        Box::new(LoopbackBackend::with_faults(FaultPlan::default())),
    )
    .context("scheduler rejected the configuration")?;
    println!("{}", scheduler.gop_structure());

    let step = 90_000 / args.fps.max(1);
    let mut summary = ProbeSummary::default();
    let mut packets = Vec::new();
    for index in 0..args.frame_count {
        let mut frame = InputFrame::new(SurfaceHandle(index), index as i64 * step, step);
        frame.force_idr = args.force_idr.contains(&index);
        loop {
            match scheduler.send_frame(frame.clone()) {
                Ok(()) => break,
                Err(err) if err.is_backpressure() => {
                    summary.backpressure += 1;
                    receive_ready(&mut scheduler, &mut summary, &mut packets)?;
                }
                Err(err) => return Err(err).context("send_frame failed"),
            }
        }
        receive_ready(&mut scheduler, &mut summary, &mut packets)?;
    }

    for packet in scheduler.drain().context("drain failed")? {
        summary.record(&packet);
        packets.push(packet);
    }
    scheduler.close().context("close failed")?;

    println!("encode  display  type  pts       dts");
    for packet in &packets {
        println!(
            "{:>6}  {:>7}  {:<4}  {:<8}  {}",
            packet.encode_order, packet.display_order, packet.picture_type, packet.pts, packet.dts
        );
    }
    println!("display order: {}", display_cadence(&packets));
    summary.print();
    Ok(())
}

fn receive_ready(
    scheduler: &mut EncodeScheduler<hwenc_sched::loopback::LoopbackPrivate>,
    summary: &mut ProbeSummary,
    packets: &mut Vec<Packet>,
) -> Result<()> {
    loop {
        let started = Instant::now();
        let status = scheduler.receive_packet()?;
        summary
            .receive_ms
            .push(started.elapsed().as_secs_f64() * 1_000.0);
        match status {
            ReceiveStatus::Packet(packet) => {
                summary.record(&packet);
                packets.push(packet);
            }
            ReceiveStatus::NeedMoreInput | ReceiveStatus::EndOfStream => return Ok(()),
        }
    }
}

fn capabilities(args: &Args) -> EncoderCapabilities {
    let mut flags = CapabilityFlags::B_PICTURES;
    if !args.no_b_references {
        flags |= CapabilityFlags::B_PICTURE_REFERENCES;
    }
    if args.non_idr_keys {
        flags |= CapabilityFlags::NON_IDR_KEY_PICTURES;
    }
    if args.multi_past_refs {
        flags |= CapabilityFlags::MULTI_PAST_REFERENCES;
    }
    if !args.sync {
        flags |= CapabilityFlags::ASYNC_ENCODE;
    }
    EncoderCapabilities {
        flags,
        max_refs_l0: 2,
        max_refs_l1: 1,
        ..EncoderCapabilities::default()
    }
}

fn display_cadence(packets: &[Packet]) -> String {
    let mut by_display = packets.iter().filter(|p| !p.is_tail).collect::<Vec<_>>();
    by_display.sort_by_key(|p| p.display_order);
    by_display
        .iter()
        .map(|p| match p.picture_type {
            PictureType::Idr => "K",
            PictureType::I => "I",
            PictureType::P => "P",
            PictureType::B => "b",
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx]
}
