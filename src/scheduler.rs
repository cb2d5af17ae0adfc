use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, error, info, trace, warn};

use crate::config::{EncoderCapabilities, GopStructure, SchedulerConfig};
use crate::dpb::ReferenceManager;
use crate::gop::{GopTracker, Pick, PickState};
use crate::picture::{Picture, PictureArena, PictureId, PictureInfo, PictureView};
use crate::pipeline::{EncodeFifo, QueueStats, StageTiming};
use crate::timestamp::DtsEstimator;
use crate::{
    CapabilityFlags, EncodeError, HardwareOps, HwOp, InputFrame, Packet, PictureType,
    ReceiveStatus,
};

enum Progress {
    Output(PictureId),
    NeedMoreInput,
    Finished,
}

/// Decides picture types and encode order for a hardware encoder, keeps the
/// reference graph consistent and turns completed pictures into packets.
///
/// Frames go in through [`send_frame`](Self::send_frame) in display order;
/// packets come out of [`receive_packet`](Self::receive_packet) in encode
/// order. The scheduler is single-threaded; wrap it in
/// [`EncodeWorker`](crate::EncodeWorker) to drive it from another thread.
pub struct EncodeScheduler<P> {
    config: SchedulerConfig,
    caps: EncoderCapabilities,
    ops: Box<dyn HardwareOps<Private = P> + Send>,

    arena: PictureArena<P>,
    /// Live pictures in display order.
    window: VecDeque<PictureId>,
    refs: ReferenceManager,
    gop: GopTracker,
    fifo: EncodeFifo,
    dts: DtsEstimator,
    tails: VecDeque<Packet>,

    input_order: i64,
    next_encode_order: i64,
    output_order: i64,
    pictures_done: i64,
    pending_limit: usize,
    async_encode: bool,

    end_of_stream: bool,
    finished: bool,
    crop_warned: bool,
    roi_warned: bool,

    metrics: bool,
    metrics_reported: bool,
    timing: StageTiming,
}

impl<P> EncodeScheduler<P> {
    pub fn new(
        config: SchedulerConfig,
        caps: EncoderCapabilities,
        ops: Box<dyn HardwareOps<Private = P> + Send>,
    ) -> Result<Self, EncodeError> {
        config.validate()?;
        let gop = GopStructure::resolve(&config, &caps)?;
        let async_encode = caps.flags.contains(CapabilityFlags::ASYNC_ENCODE);
        let fifo_depth = if async_encode { config.async_depth } else { 1 };
        let dts = DtsEstimator::new(
            gop.output_delay(),
            gop.decode_delay(),
            config.async_depth,
            caps.flags.contains(CapabilityFlags::TIMESTAMP_NO_DELAY),
        )?;
        let pending_limit = 2 * gop.output_delay() + fifo_depth;
        let refs = ReferenceManager::new(caps.max_refs_l0);
        let metrics = config.metrics_enabled();

        info!(
            config = %config,
            gop = %gop,
            async_encode,
            pending_limit,
            ring_len = dts.ring_len(),
            "encode scheduler ready"
        );

        Ok(Self {
            config,
            caps,
            ops,
            arena: PictureArena::new(),
            window: VecDeque::new(),
            refs,
            gop: GopTracker::new(gop),
            fifo: EncodeFifo::new(fifo_depth),
            dts,
            tails: VecDeque::new(),
            input_order: 0,
            next_encode_order: 0,
            output_order: -1,
            pictures_done: 0,
            pending_limit,
            async_encode,
            end_of_stream: false,
            finished: false,
            crop_warned: false,
            roi_warned: false,
            metrics,
            metrics_reported: false,
            timing: StageTiming::default(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn gop_structure(&self) -> &GopStructure {
        self.gop.structure()
    }

    /// Accepts the next frame in display order.
    ///
    /// Fails with [`EncodeError::TemporaryBackpressure`] while too many frames
    /// are waiting for output; drain packets and retry.
    pub fn send_frame(&mut self, frame: InputFrame) -> Result<(), EncodeError> {
        if self.end_of_stream {
            return Err(EncodeError::InvalidInput(
                "frame submitted after end of stream".to_string(),
            ));
        }
        let pending = self.pending_pictures();
        if pending >= self.pending_limit {
            return Err(EncodeError::TemporaryBackpressure(format!(
                "{pending} pictures awaiting output (limit {})",
                self.pending_limit
            )));
        }
        self.check_frame(&frame);

        let started = Instant::now();
        let allocation = self.ops.alloc(&frame).inspect_err(|err| {
            error!(op = %HwOp::Alloc, display_order = self.input_order, %err, "hardware operation failed");
        })?;
        self.timing.alloc += started.elapsed();

        let display_order = self.input_order;
        let id = self.arena.insert(
            display_order,
            frame.surface,
            allocation.recon_surface,
            allocation.private,
        );
        {
            let pic = self.arena.pic_mut(id)?;
            pic.force_idr = display_order == 0 || frame.force_idr;
            pic.pts = frame.pts;
            pic.duration = frame.duration;
            pic.opaque = frame.opaque;
        }
        self.dts.record_input(display_order, frame.pts);
        self.window.push_back(id);
        self.input_order += 1;
        self.timing.pictures += 1;
        trace!(picture = %id, display_order, pts = frame.pts, "frame accepted");
        Ok(())
    }

    /// Marks the end of input. Later frames are rejected.
    pub fn send_eos(&mut self) -> Result<(), EncodeError> {
        if self.end_of_stream {
            return Ok(());
        }
        self.end_of_stream = true;
        self.dts.finish_input(self.input_order);
        debug!(frames = self.input_order, "end of stream");
        Ok(())
    }

    pub fn receive_packet(&mut self) -> Result<ReceiveStatus, EncodeError> {
        loop {
            if let Some(tail) = self.take_ready_tail()? {
                return Ok(ReceiveStatus::Packet(tail));
            }
            if self.window.is_empty() {
                if !self.end_of_stream {
                    return Ok(ReceiveStatus::NeedMoreInput);
                }
                self.finish()?;
                if self.tails.is_empty() {
                    return Ok(ReceiveStatus::EndOfStream);
                }
                continue;
            }

            let progress = if self.async_encode {
                self.advance_async()?
            } else {
                self.advance_sync()?
            };
            let id = match progress {
                Progress::Output(id) => id,
                Progress::NeedMoreInput => return Ok(ReceiveStatus::NeedMoreInput),
                Progress::Finished => {
                    self.finish()?;
                    continue;
                }
            };

            let packet = self.complete(id)?;
            if self.end_of_stream && packet.data.is_empty() {
                debug!(display_order = packet.display_order, "dropping empty packet after end of stream");
                continue;
            }
            return Ok(ReceiveStatus::Packet(packet));
        }
    }

    /// Ends the stream and collects every remaining packet.
    pub fn drain(&mut self) -> Result<Vec<Packet>, EncodeError> {
        self.send_eos()?;
        let mut packets = Vec::new();
        loop {
            match self.receive_packet()? {
                ReceiveStatus::Packet(packet) => packets.push(packet),
                ReceiveStatus::EndOfStream => return Ok(packets),
                ReceiveStatus::NeedMoreInput => {
                    return Err(EncodeError::InvariantViolation(
                        "scheduler requested input after end of stream".to_string(),
                    ));
                }
            }
        }
    }

    /// Frees every picture still held, whatever its state.
    pub fn close(mut self) -> Result<(), EncodeError> {
        let result = self.release_all();
        self.report_metrics();
        result
    }

    pub fn picture_info(&self, id: PictureId) -> Option<PictureInfo> {
        self.arena.get(id).map(Picture::info)
    }

    /// Snapshots of the live pictures in display order.
    pub fn window_info(&self) -> Vec<PictureInfo> {
        self.window
            .iter()
            .filter_map(|id| self.arena.get(*id))
            .map(Picture::info)
            .collect()
    }

    pub fn live_pictures(&self) -> usize {
        self.arena.len()
    }

    pub fn in_flight(&self) -> usize {
        self.fifo.len()
    }

    pub fn fifo_stats(&self) -> QueueStats {
        self.fifo.stats()
    }

    pub fn pending_limit(&self) -> usize {
        self.pending_limit
    }

    pub fn output_order(&self) -> i64 {
        self.output_order
    }

    pub fn timing(&self) -> StageTiming {
        self.timing
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn pending_pictures(&self) -> usize {
        usize::try_from(self.input_order - self.pictures_done).unwrap_or(0)
    }

    fn check_frame(&mut self, frame: &InputFrame) {
        if !frame.crop.is_empty() && !self.crop_warned {
            warn!(crop = ?frame.crop, "cropping is not supported and will be ignored");
            self.crop_warned = true;
        }
        if !frame.roi.is_empty() && !self.caps.roi_supported && !self.roi_warned {
            warn!(regions = frame.roi.len(), "regions of interest are not supported and will be ignored");
            self.roi_warned = true;
        }
    }

    fn pick(&mut self) -> Result<Pick, EncodeError> {
        let state = PickState {
            input_order: self.input_order,
            decode_delay: self.gop.structure().decode_delay() as i64,
            end_of_stream: self.end_of_stream,
            multi_past_references: self
                .caps
                .flags
                .contains(CapabilityFlags::MULTI_PAST_REFERENCES),
        };
        self.gop
            .pick_next(&mut self.arena, &self.window, &mut self.refs, state)
    }

    fn advance_sync(&mut self) -> Result<Progress, EncodeError> {
        match self.pick()? {
            Pick::Picture(id) => {
                self.issue(id)?;
                Ok(Progress::Output(id))
            }
            idle => self.idle(idle),
        }
    }

    fn advance_async(&mut self) -> Result<Progress, EncodeError> {
        let mut last = Pick::Wait;
        while self.fifo.can_write() {
            last = self.pick()?;
            let Pick::Picture(id) = last else {
                break;
            };
            self.issue(id)?;
            self.fifo.push(id)?;
        }
        if self.fifo.is_empty() {
            return self.idle(last);
        }
        if self.fifo.can_write() && !self.end_of_stream {
            return Ok(Progress::NeedMoreInput);
        }
        let id = self.fifo.pop().ok_or_else(|| {
            EncodeError::InvariantViolation("encode fifo emptied while reading".to_string())
        })?;
        Ok(Progress::Output(id))
    }

    fn idle(&self, pick: Pick) -> Result<Progress, EncodeError> {
        match pick {
            Pick::Finished => Ok(Progress::Finished),
            _ if self.end_of_stream => Err(EncodeError::InvariantViolation(
                "no picture can make progress after end of stream".to_string(),
            )),
            _ => Ok(Progress::NeedMoreInput),
        }
    }

    fn issue(&mut self, id: PictureId) -> Result<(), EncodeError> {
        let encode_order = self.next_encode_order;
        self.next_encode_order += 1;
        self.arena.pic_mut(id)?.encode_order = Some(encode_order);

        let mut private = self.take_private(id, HwOp::Issue)?;
        let started = Instant::now();
        let result =
            PictureView::new(&self.arena, id).and_then(|view| self.ops.issue(&view, &mut private));
        self.timing.issue += started.elapsed();
        self.restore_private(id, private);

        match result {
            Ok(()) => {
                let pic = self.arena.pic_mut(id)?;
                pic.encode_issued = true;
                debug!(
                    picture = %id,
                    display_order = pic.display_order,
                    encode_order,
                    picture_type = ?pic.pic_type,
                    "picture issued"
                );
                Ok(())
            }
            Err(err) => {
                error!(op = %HwOp::Issue, picture = %id, encode_order, %err, "hardware operation failed");
                self.abandon(id)?;
                Err(err)
            }
        }
    }

    /// Retires a picture the backend could not handle so it no longer holds a slot.
    fn abandon(&mut self, id: PictureId) -> Result<(), EncodeError> {
        let pic = self.arena.pic_mut(id)?;
        pic.encode_issued = true;
        pic.encode_complete = true;
        self.pictures_done += 1;
        self.retire(false)
    }

    fn complete(&mut self, id: PictureId) -> Result<Packet, EncodeError> {
        let mut private = self.take_private(id, HwOp::Output)?;
        let started = Instant::now();
        let result =
            PictureView::new(&self.arena, id).and_then(|view| self.ops.output(&view, &mut private));
        self.timing.output += started.elapsed();
        self.restore_private(id, private);

        let pic = self.arena.pic_mut(id)?;
        pic.encode_complete = true;
        let encode_order = pic.encode_order.unwrap_or(self.output_order + 1);
        let picture_type = pic.pic_type;
        let (pts, duration, opaque, display_order) =
            (pic.pts, pic.duration, pic.opaque, pic.display_order);
        self.output_order = encode_order;
        self.pictures_done += 1;

        let retired = self.retire(false);
        let output = match result {
            Ok(output) => output,
            Err(err) => {
                error!(op = %HwOp::Output, picture = %id, encode_order, %err, "hardware operation failed");
                retired?;
                return Err(err);
            }
        };
        retired?;

        let picture_type = picture_type.ok_or_else(|| {
            EncodeError::InvariantViolation(format!("{id} completed without a picture type"))
        })?;
        let packet = Packet {
            data: output.data,
            pts,
            dts: self.dts.dts(encode_order, pts),
            duration,
            is_keyframe: picture_type == PictureType::Idr,
            picture_type,
            display_order,
            encode_order,
            opaque,
            is_tail: false,
        };
        if let Some(tail) = output.tail {
            self.tails.push_back(Packet {
                data: tail,
                dts: pts,
                is_keyframe: false,
                is_tail: true,
                ..packet.clone()
            });
        }
        self.timing.packets += 1;
        trace!(%packet, "packet ready");
        Ok(packet)
    }

    /// A tail goes out once no pending B picture displays before it.
    fn take_ready_tail(&mut self) -> Result<Option<Packet>, EncodeError> {
        let Some(tail) = self.tails.front() else {
            return Ok(None);
        };
        for &id in &self.window {
            let pic = self.arena.pic(id)?;
            if pic.is_b() && !pic.encode_complete && pic.pts < tail.pts {
                return Ok(None);
            }
        }
        Ok(self.tails.pop_front())
    }

    fn take_private(&mut self, id: PictureId, op: HwOp) -> Result<P, EncodeError> {
        self.arena.pic_mut(id)?.private.take().ok_or_else(|| {
            EncodeError::InvariantViolation(format!("{id} has no backend state for {op}"))
        })
    }

    fn restore_private(&mut self, id: PictureId, private: P) {
        if let Some(pic) = self.arena.get_mut(id) {
            pic.private = Some(private);
        }
    }

    fn retire(&mut self, final_pass: bool) -> Result<(), EncodeError> {
        let freed = self
            .refs
            .retire(&mut self.arena, &mut self.window, final_pass)?;
        let mut first_err = None;
        for pic in freed {
            if let Err(err) = self.free_picture(pic) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn free_picture(&mut self, pic: Picture<P>) -> Result<(), EncodeError> {
        let Some(private) = pic.private else {
            return Ok(());
        };
        let started = Instant::now();
        let result = self.ops.free(private);
        self.timing.free += started.elapsed();
        result.inspect_err(|err| {
            error!(op = %HwOp::Free, picture = %pic.id, %err, "hardware operation failed");
        })
    }

    fn finish(&mut self) -> Result<(), EncodeError> {
        if self.finished {
            return Ok(());
        }
        self.refs.release_next_prev(&mut self.arena)?;
        self.retire(true)?;
        if !self.window.is_empty() {
            return Err(EncodeError::InvariantViolation(format!(
                "{} pictures still referenced after end of stream",
                self.window.len()
            )));
        }
        self.finished = true;
        debug!(
            frames = self.input_order,
            packets = self.timing.packets,
            "stream fully drained"
        );
        self.report_metrics();
        Ok(())
    }

    fn release_all(&mut self) -> Result<(), EncodeError> {
        let outstanding = self.fifo.drain().count();
        if outstanding > 0 {
            warn!(outstanding, "discarding issued pictures that were never output");
        }
        if !self.arena.is_empty() {
            warn!(pictures = self.arena.len(), "freeing pictures still held by the scheduler");
        }
        self.window.clear();
        self.tails.clear();
        let mut first_err = None;
        for id in self.arena.ids() {
            if let Some(pic) = self.arena.remove(id) {
                if let Err(err) = self.free_picture(pic) {
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn report_metrics(&mut self) {
        if !self.metrics || self.metrics_reported {
            return;
        }
        self.metrics_reported = true;
        let ms = |d: std::time::Duration| d.as_secs_f64() * 1_000.0;
        info!(
            pictures = self.timing.pictures,
            packets = self.timing.packets,
            alloc_ms = ms(self.timing.alloc),
            issue_ms = ms(self.timing.issue),
            output_ms = ms(self.timing.output),
            free_ms = ms(self.timing.free),
            total_ms = ms(self.timing.total()),
            fifo_peak = self.fifo.stats().peak_depth,
            "encode scheduler metrics"
        );
    }
}

impl<P> Drop for EncodeScheduler<P> {
    fn drop(&mut self) {
        if !self.arena.is_empty() {
            let _ = self.release_all();
        }
    }
}
