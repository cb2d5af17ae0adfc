//! Picture type decisions and hierarchical B-picture layout.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::config::GopStructure;
use crate::dpb::{Link, ReferenceManager};
use crate::picture::{LIST_FUTURE, LIST_PAST, PictureArena, PictureId};
use crate::{EncodeError, PictureType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pick {
    Picture(PictureId),
    /// Nothing can be chosen until more input arrives or in-flight work completes.
    Wait,
    /// Every picture in the window has completed.
    Finished,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PickState {
    pub input_order: i64,
    pub decode_delay: i64,
    pub end_of_stream: bool,
    pub multi_past_references: bool,
}

/// Cadence counters driving the IDR/I/P decisions.
#[derive(Debug, Clone)]
pub(crate) struct GopTracker {
    gop: GopStructure,
    idr_counter: u32,
    gop_counter: u32,
    p_counter: u32,
}

impl GopTracker {
    pub fn new(gop: GopStructure) -> Self {
        Self {
            gop,
            idr_counter: 0,
            gop_counter: 0,
            p_counter: 0,
        }
    }

    pub fn structure(&self) -> &GopStructure {
        &self.gop
    }

    pub fn pick_next<P>(
        &mut self,
        arena: &mut PictureArena<P>,
        window: &VecDeque<PictureId>,
        refs: &mut ReferenceManager,
        state: PickState,
    ) -> Result<Pick, EncodeError> {
        if let Some(id) = self.ready_b_picture(arena, window)? {
            return Ok(Pick::Picture(id));
        }

        let closed_gop_end =
            u32::from(self.gop.closed_gop || self.idr_counter == self.gop.gop_per_idr);
        // A key picture forced by the P count must not have B pictures in front
        // of it when it closes the GOP.
        let key_by_p_count = closed_gop_end == 1
            && self.gop.p_per_i.is_some_and(|limit| self.p_counter >= limit);
        let mut start: Option<usize> = None;
        let mut b_counter = 0u32;
        let mut chosen = None;
        for (idx, &id) in window.iter().enumerate() {
            let pic = arena.pic(id)?;
            if pic.encode_issued {
                start = Some(idx);
                continue;
            }
            // Only the top-layer picture of a mini-GOP may be forced to IDR.
            if pic.force_idr
                || key_by_p_count
                || b_counter == self.gop.b_per_p
                || self.gop_counter + b_counter + closed_gop_end >= self.gop.gop_size
            {
                chosen = Some(idx);
                break;
            }
            if let Some(&next) = window.get(idx + 1) {
                if arena.pic(next)?.force_idr {
                    chosen = Some(idx);
                    break;
                }
            }
            b_counter += 1;
        }

        if chosen.is_none() && state.end_of_stream {
            let Some(&last) = window.back() else {
                return Ok(Pick::Finished);
            };
            let last = arena.pic(last)?;
            if last.encode_complete {
                return Ok(Pick::Finished);
            }
            if last.encode_issued {
                return Ok(Pick::Wait);
            }
            // The stream ended inside a mini-GOP; promote its last picture.
            b_counter = b_counter.saturating_sub(1);
            chosen = Some(window.len() - 1);
        }

        let Some(pic_idx) = chosen else {
            trace!(b_counter, "waiting for more input to close the mini-GOP");
            return Ok(Pick::Wait);
        };

        if state.input_order <= state.decode_delay && !state.end_of_stream {
            trace!(
                input_order = state.input_order,
                decode_delay = state.decode_delay,
                "waiting for the decode delay to fill"
            );
            return Ok(Pick::Wait);
        }

        let pic_id = window[pic_idx];
        let pic_type = self.decide_type(arena.pic(pic_id)?.force_idr, b_counter);
        {
            let pic = arena.pic_mut(pic_id)?;
            pic.pic_type = Some(pic_type);
            pic.is_reference = true;
        }
        refs.add_ref(arena, pic_id, pic_id, Link::DPB)?;

        let start_id = start.map(|idx| window[idx]);
        if pic_type != PictureType::Idr {
            let link = Link {
                reference: pic_type == PictureType::P,
                dpb: b_counter > 0,
                prev: false,
            };
            if state.multi_past_references {
                let candidates = refs.next_prev().collect::<Vec<_>>();
                for candidate in candidates {
                    refs.add_ref(arena, pic_id, candidate, link)?;
                }
            } else if let Some(start_id) = start_id {
                refs.add_ref(arena, pic_id, start_id, link)?;
            } else if link.reference || link.dpb {
                return Err(EncodeError::InvariantViolation(format!(
                    "{pic_type} {pic_id} has no issued picture to predict from"
                )));
            }
            let prev = refs.last_prev().ok_or_else(|| {
                EncodeError::InvariantViolation(format!("{pic_type} {pic_id} has no previous reference"))
            })?;
            refs.add_ref(arena, pic_id, prev, Link::PREV)?;
        }

        let last_reference = if b_counter > 0 {
            let start_idx = start.ok_or_else(|| {
                EncodeError::InvariantViolation(format!(
                    "{b_counter} B pictures before {pic_id} without a leading anchor"
                ))
            })?;
            self.set_b_pictures(arena, window, refs, start_idx, pic_idx, pic_id, 1)?
        } else {
            pic_id
        };
        refs.add_next_prev(arena, last_reference)?;

        debug!(
            picture = %pic_id,
            display_order = arena.pic(pic_id)?.display_order,
            picture_type = %pic_type,
            b_pictures = b_counter,
            "selected top-layer picture"
        );
        Ok(Pick::Picture(pic_id))
    }

    /// The first unissued B picture whose references have all been issued.
    fn ready_b_picture<P>(
        &self,
        arena: &PictureArena<P>,
        window: &VecDeque<PictureId>,
    ) -> Result<Option<PictureId>, EncodeError> {
        'window: for &id in window {
            let pic = arena.pic(id)?;
            if pic.encode_issued || !pic.is_b() {
                continue;
            }
            for target in pic.refs[LIST_PAST].iter().chain(pic.refs[LIST_FUTURE].iter()) {
                if !arena.pic(target)?.encode_issued {
                    continue 'window;
                }
            }
            trace!(picture = %id, display_order = pic.display_order, "picking queued B picture");
            return Ok(Some(id));
        }
        Ok(None)
    }

    fn decide_type(&mut self, force_idr: bool, b_counter: u32) -> PictureType {
        let p_limit_reached = self.gop.p_per_i.is_some_and(|limit| self.p_counter >= limit);
        if force_idr {
            self.idr_counter = 1;
            self.gop_counter = 1;
            self.p_counter = 0;
            PictureType::Idr
        } else if self.gop_counter + b_counter >= self.gop.gop_size || p_limit_reached {
            let pic_type = if self.idr_counter == self.gop.gop_per_idr {
                self.idr_counter = 1;
                PictureType::Idr
            } else {
                self.idr_counter += 1;
                PictureType::I
            };
            self.gop_counter = 1;
            self.p_counter = 0;
            pic_type
        } else {
            self.gop_counter += 1 + b_counter;
            self.p_counter += 1;
            PictureType::P
        }
    }

    /// Lays out the B pictures strictly between `start_idx` and `end_idx`,
    /// returning the last reference picture in encode order.
    #[allow(clippy::too_many_arguments)]
    fn set_b_pictures<P>(
        &self,
        arena: &mut PictureArena<P>,
        window: &VecDeque<PictureId>,
        refs: &ReferenceManager,
        start_idx: usize,
        end_idx: usize,
        prev: PictureId,
        depth: u32,
    ) -> Result<PictureId, EncodeError> {
        let start = window[start_idx];
        let end = window[end_idx];
        let len = end_idx - start_idx - 1;

        if depth == self.gop.max_b_depth || len == 1 {
            for &pic_id in window.range(start_idx + 1..end_idx) {
                {
                    let pic = arena.pic_mut(pic_id)?;
                    pic.pic_type = Some(PictureType::B);
                    pic.b_depth = depth;
                }
                link_b_picture(arena, refs, pic_id, start, end, prev)?;
            }
            return Ok(prev);
        }

        let mut offset = 1;
        while 2 * offset < len {
            offset += 1;
        }
        let mid_idx = start_idx + offset;
        let mid = window[mid_idx];
        {
            let pic = arena.pic_mut(mid)?;
            pic.pic_type = Some(PictureType::B);
            pic.b_depth = depth;
            pic.is_reference = true;
        }
        refs.add_ref(arena, mid, mid, Link::DPB)?;
        link_b_picture(arena, refs, mid, start, end, prev)?;
        trace!(picture = %mid, depth, "referenced B picture");

        let next = if offset > 1 {
            self.set_b_pictures(arena, window, refs, start_idx, mid_idx, mid, depth + 1)?
        } else {
            mid
        };
        self.set_b_pictures(arena, window, refs, mid_idx, end_idx, next, depth + 1)
    }
}

fn link_b_picture<P>(
    arena: &mut PictureArena<P>,
    refs: &ReferenceManager,
    pic: PictureId,
    start: PictureId,
    end: PictureId,
    prev: PictureId,
) -> Result<(), EncodeError> {
    refs.add_ref(arena, pic, start, Link::REFERENCE_DPB)?;
    refs.add_ref(arena, pic, end, Link::REFERENCE_DPB)?;
    refs.add_ref(arena, pic, prev, Link::PREV)?;
    // Keep the future anchors of `end` resident as well.
    let mut cursor = arena.pic(end)?.refs[LIST_FUTURE].first();
    while let Some(target) = cursor {
        refs.add_ref(arena, pic, target, Link::DPB)?;
        cursor = arena.pic(target)?.refs[LIST_FUTURE].first();
    }
    Ok(())
}
