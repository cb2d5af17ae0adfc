//! In-memory backend that records what the scheduler asks of it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::picture::{Picture, PictureView};
use crate::{
    Allocation, EncodeError, EncodedOutput, HardwareOps, InputFrame, MAX_DPB_SIZE, PictureType,
    SurfaceHandle,
};

/// Failures and payload quirks to inject, keyed by call index or display order.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Zero-based `alloc` call that reports out of memory.
    pub fail_alloc_at: Option<u64>,
    pub fail_issue_display: Option<i64>,
    pub fail_output_display: Option<i64>,
    pub empty_output_display: Vec<i64>,
    pub tail_display: Vec<i64>,
}

#[derive(Debug)]
pub struct LoopbackPrivate {
    pub frame_index: u64,
    pub surface: SurfaceHandle,
    issued: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRecord {
    pub display_order: i64,
    pub encode_order: i64,
    pub picture_type: PictureType,
    pub b_depth: u32,
    pub is_reference: bool,
    pub past: Vec<i64>,
    pub future: Vec<i64>,
    pub dpb: Vec<i64>,
    pub prev: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct LoopbackState {
    pub allocated: u64,
    pub freed: u64,
    pub issued: u64,
    pub outputs: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub issues: Vec<IssueRecord>,
    /// Contract breaches seen from the scheduler side.
    pub violations: Vec<String>,
}

/// Shared read access to a [`LoopbackBackend`]'s state after it has been boxed.
#[derive(Debug, Clone)]
pub struct LoopbackProbe(Arc<Mutex<LoopbackState>>);

impl LoopbackProbe {
    pub fn snapshot(&self) -> LoopbackState {
        lock(&self.0).clone()
    }
}

#[derive(Debug, Default)]
pub struct LoopbackBackend {
    state: Arc<Mutex<LoopbackState>>,
    faults: FaultPlan,
    alloc_calls: u64,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: FaultPlan) -> Self {
        Self {
            faults,
            ..Self::default()
        }
    }

    pub fn probe(&self) -> LoopbackProbe {
        LoopbackProbe(Arc::clone(&self.state))
    }
}

fn lock(state: &Mutex<LoopbackState>) -> MutexGuard<'_, LoopbackState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn display_orders<'a, P: 'a>(pics: impl Iterator<Item = &'a Picture<P>>) -> Vec<i64> {
    pics.map(Picture::display_order).collect()
}

impl HardwareOps for LoopbackBackend {
    type Private = LoopbackPrivate;

    fn alloc(&mut self, frame: &InputFrame) -> Result<Allocation<LoopbackPrivate>, EncodeError> {
        let call = self.alloc_calls;
        self.alloc_calls += 1;
        if self.faults.fail_alloc_at == Some(call) {
            return Err(EncodeError::OutOfMemory(format!(
                "loopback alloc {call} refused"
            )));
        }
        lock(&self.state).allocated += 1;
        Ok(Allocation {
            private: LoopbackPrivate {
                frame_index: call,
                surface: frame.surface,
                issued: false,
            },
            recon_surface: Some(SurfaceHandle(u64::MAX - call)),
        })
    }

    fn issue(
        &mut self,
        picture: &PictureView<'_, LoopbackPrivate>,
        private: &mut LoopbackPrivate,
    ) -> Result<(), EncodeError> {
        let pic = picture.picture();
        if self.faults.fail_issue_display == Some(pic.display_order()) {
            return Err(EncodeError::Backend(format!(
                "loopback issue of picture {} failed",
                pic.display_order()
            )));
        }

        let mut state = lock(&self.state);
        for target in picture.past_refs().chain(picture.future_refs()) {
            if !target.is_issued() {
                state.violations.push(format!(
                    "picture {} references unissued picture {}",
                    pic.display_order(),
                    target.display_order()
                ));
            }
        }
        if pic.dpb().len() > MAX_DPB_SIZE {
            state
                .violations
                .push(format!("picture {} dpb overflow", pic.display_order()));
        }
        if pic.prev().is_some() && picture.prev().is_none() {
            state
                .violations
                .push(format!("picture {} prev is dangling", pic.display_order()));
        }

        state.issues.push(IssueRecord {
            display_order: pic.display_order(),
            encode_order: picture.encode_order(),
            picture_type: picture.picture_type(),
            b_depth: pic.b_depth(),
            is_reference: pic.is_reference(),
            past: display_orders(picture.past_refs()),
            future: display_orders(picture.future_refs()),
            dpb: display_orders(picture.dpb()),
            prev: picture.prev().map(Picture::display_order),
        });
        state.issued += 1;
        state.in_flight += 1;
        state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
        private.issued = true;
        trace!(
            display_order = pic.display_order(),
            encode_order = picture.encode_order(),
            "loopback issue"
        );
        Ok(())
    }

    fn output(
        &mut self,
        picture: &PictureView<'_, LoopbackPrivate>,
        private: &mut LoopbackPrivate,
    ) -> Result<EncodedOutput, EncodeError> {
        let display_order = picture.picture().display_order();
        let mut state = lock(&self.state);
        if !private.issued {
            state
                .violations
                .push(format!("picture {display_order} output before issue"));
            return Err(EncodeError::InvalidInput(format!(
                "picture {display_order} was never issued"
            )));
        }
        state.in_flight = state.in_flight.saturating_sub(1);
        state.outputs += 1;
        drop(state);

        if self.faults.fail_output_display == Some(display_order) {
            return Err(EncodeError::DeviceLost(format!(
                "loopback output of picture {display_order} failed"
            )));
        }
        let data = if self.faults.empty_output_display.contains(&display_order) {
            Vec::new()
        } else {
            format!("{}:{display_order}", picture.picture_type()).into_bytes()
        };
        let tail = self
            .faults
            .tail_display
            .contains(&display_order)
            .then(|| format!("tail:{display_order}").into_bytes());
        Ok(EncodedOutput { data, tail })
    }

    fn free(&mut self, private: LoopbackPrivate) -> Result<(), EncodeError> {
        trace!(frame_index = private.frame_index, surface = %private.surface, "loopback free");
        lock(&self.state).freed += 1;
        Ok(())
    }
}
