//! Reference graph bookkeeping.
//!
//! Every relationship a picture forms to another one (reference list entry,
//! DPB snapshot slot, `prev` link) adds one to both of the target's counters.
//! The direct counter is released when the holder is complete and no longer
//! the newest picture in the window; the indirect counter is released once the
//! holder itself has no direct users left. A picture is freed only when it is
//! complete and its indirect counter is zero.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::picture::{
    LEVEL_DIRECT, LEVEL_INDIRECT, LIST_FUTURE, LIST_PAST, Picture, PictureArena, PictureId,
    RefList,
};
use crate::{EncodeError, MAX_PICTURE_REFERENCES, PictureType};

/// Which relationships `add_ref` forms between a picture and its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Link {
    pub reference: bool,
    pub dpb: bool,
    pub prev: bool,
}

impl Link {
    pub const DPB: Self = Self {
        reference: false,
        dpb: true,
        prev: false,
    };
    pub const REFERENCE_DPB: Self = Self {
        reference: true,
        dpb: true,
        prev: false,
    };
    pub const PREV: Self = Self {
        reference: false,
        dpb: false,
        prev: true,
    };

    fn is_empty(self) -> bool {
        !(self.reference || self.dpb || self.prev)
    }
}

#[derive(Debug)]
pub(crate) struct ReferenceManager {
    /// Reference pictures the next top-layer picture links as `prev`, oldest first in encode order.
    next_prev: RefList,
    /// Bounded by the backend's L0 list size.
    max_next_prev: usize,
}

impl ReferenceManager {
    pub fn new(max_refs_l0: u32) -> Self {
        Self {
            next_prev: RefList::new(),
            max_next_prev: (max_refs_l0 as usize).clamp(1, MAX_PICTURE_REFERENCES),
        }
    }

    pub fn last_prev(&self) -> Option<PictureId> {
        self.next_prev.iter().last()
    }

    pub fn next_prev(&self) -> impl Iterator<Item = PictureId> + '_ {
        self.next_prev.iter()
    }

    pub fn add_ref<P>(
        &self,
        arena: &mut PictureArena<P>,
        pic_id: PictureId,
        target_id: PictureId,
        link: Link,
    ) -> Result<(), EncodeError> {
        if link.is_empty() {
            return Ok(());
        }
        let target_display = arena.pic(target_id)?.display_order;
        let mut formed = 0;
        let mut evicted = None;
        {
            let pic = arena.pic_mut(pic_id)?;
            if link.reference {
                if pic_id == target_id {
                    return Err(EncodeError::InvariantViolation(format!(
                        "{pic_id} cannot reference itself"
                    )));
                }
                let list = if target_display < pic.display_order {
                    LIST_PAST
                } else {
                    LIST_FUTURE
                };
                pic.refs[list].push(target_id).map_err(|err| {
                    EncodeError::InvariantViolation(format!("{pic_id} reference list {list}: {err}"))
                })?;
                formed += 1;
            }

            if link.prev {
                if pic.prev.is_some() {
                    return Err(EncodeError::InvariantViolation(format!(
                        "{pic_id} already has a previous reference"
                    )));
                }
                pic.prev = Some(target_id);
                formed += 1;
            }

            // `prev` has to stay reachable through the lists; fall back to the DPB.
            let keep_prev_resident = link.prev
                && !pic.refs[LIST_PAST].contains(&target_id)
                && !pic.refs[LIST_FUTURE].contains(&target_id);
            if (link.dpb || keep_prev_resident) && !pic.dpb.contains(&target_id) {
                if pic.dpb.is_full() {
                    evicted = Some(pic.dpb.remove(0));
                }
                pic.dpb.push(target_id).map_err(|err| {
                    EncodeError::InvariantViolation(format!("{pic_id} dpb: {err}"))
                })?;
                formed += 1;
            }
        }

        let target = arena.pic_mut(target_id)?;
        target.ref_count[LEVEL_DIRECT] += formed;
        target.ref_count[LEVEL_INDIRECT] += formed;

        if let Some(evicted) = evicted {
            debug!(picture = %pic_id, %evicted, "dpb full, evicting oldest entry");
            release(arena, evicted, LEVEL_DIRECT)?;
            release(arena, evicted, LEVEL_INDIRECT)?;
        }
        Ok(())
    }

    /// Records `pic` as the newest `prev` candidate. An IDR drops every older candidate.
    pub fn add_next_prev<P>(
        &mut self,
        arena: &mut PictureArena<P>,
        pic_id: PictureId,
    ) -> Result<(), EncodeError> {
        if arena.pic(pic_id)?.pic_type == Some(PictureType::Idr) {
            self.release_next_prev(arena)?;
        } else if self.next_prev.len() >= self.max_next_prev {
            let oldest = self.next_prev.remove(0);
            release(arena, oldest, LEVEL_DIRECT)?;
        }
        self.next_prev.push(pic_id).map_err(|err| {
            EncodeError::InvariantViolation(format!("next-prev candidates: {err}"))
        })?;
        arena.pic_mut(pic_id)?.ref_count[LEVEL_DIRECT] += 1;
        Ok(())
    }

    pub fn release_next_prev<P>(&mut self, arena: &mut PictureArena<P>) -> Result<(), EncodeError> {
        for id in self.next_prev.iter() {
            release(arena, id, LEVEL_DIRECT)?;
        }
        self.next_prev.clear();
        Ok(())
    }

    /// Releases counters held by completed pictures and removes every picture
    /// that nothing needs any more. With `final_pass` the newest picture in the
    /// window gives up its direct relationships too.
    pub fn retire<P>(
        &self,
        arena: &mut PictureArena<P>,
        window: &mut VecDeque<PictureId>,
        final_pass: bool,
    ) -> Result<Vec<Picture<P>>, EncodeError> {
        let last = window.len().saturating_sub(1);
        for (idx, &id) in window.iter().enumerate() {
            if arena.pic(id)?.encode_complete && (idx < last || final_pass) {
                remove_refs(arena, id, LEVEL_DIRECT)?;
            }
        }

        for &id in window.iter() {
            let pic = arena.pic(id)?;
            if pic.encode_complete && pic.ref_count[LEVEL_DIRECT] == 0 {
                remove_refs(arena, id, LEVEL_INDIRECT)?;
            }
        }

        let mut doomed = Vec::new();
        for &id in window.iter() {
            let pic = arena.pic(id)?;
            if pic.encode_complete && pic.ref_count[LEVEL_INDIRECT] == 0 {
                if !(pic.ref_removed[LEVEL_DIRECT] && pic.ref_removed[LEVEL_INDIRECT]) {
                    return Err(EncodeError::InvariantViolation(format!(
                        "{id} unreferenced before releasing its own references"
                    )));
                }
                doomed.push(id);
            }
        }

        window.retain(|id| !doomed.contains(id));
        let mut freed = Vec::with_capacity(doomed.len());
        for id in doomed {
            let pic = arena.remove(id).ok_or_else(|| {
                EncodeError::InvariantViolation(format!("{id} vanished during retirement"))
            })?;
            trace!(picture = %id, display_order = pic.display_order, "retiring picture");
            freed.push(pic);
        }
        Ok(freed)
    }
}

fn release<P>(arena: &mut PictureArena<P>, id: PictureId, level: usize) -> Result<(), EncodeError> {
    let pic = arena.pic_mut(id)?;
    pic.ref_count[level] = pic.ref_count[level].checked_sub(1).ok_or_else(|| {
        EncodeError::InvariantViolation(format!("{id} reference count {level} underflow"))
    })?;
    Ok(())
}

fn remove_refs<P>(arena: &mut PictureArena<P>, id: PictureId, level: usize) -> Result<(), EncodeError> {
    let pic = arena.pic(id)?;
    if pic.ref_removed[level] {
        return Ok(());
    }
    if pic.prev.is_none() && pic.pic_type != Some(PictureType::Idr) {
        return Err(EncodeError::InvariantViolation(format!(
            "non-IDR {id} has no previous reference"
        )));
    }
    let targets = pic
        .refs[LIST_PAST]
        .iter()
        .chain(pic.refs[LIST_FUTURE].iter())
        .chain(pic.dpb.iter())
        .chain(pic.prev)
        .collect::<Vec<_>>();

    for target in targets {
        release(arena, target, level)?;
    }
    arena.pic_mut(id)?.ref_removed[level] = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MAX_DPB_SIZE, SurfaceHandle};

    fn picture(arena: &mut PictureArena<()>, display_order: i64, ty: PictureType) -> PictureId {
        let id = arena.insert(display_order, SurfaceHandle(display_order as u64), None, ());
        let pic = arena.get_mut(id).unwrap();
        pic.pic_type = Some(ty);
        pic.is_reference = ty != PictureType::B;
        id
    }

    #[test]
    fn references_land_in_lists_by_display_order() {
        let mut arena = PictureArena::new();
        let refs = ReferenceManager::new(2);
        let past = picture(&mut arena, 0, PictureType::Idr);
        let future = picture(&mut arena, 2, PictureType::P);
        let b = picture(&mut arena, 1, PictureType::B);

        refs.add_ref(&mut arena, b, past, Link::REFERENCE_DPB).unwrap();
        refs.add_ref(&mut arena, b, future, Link::REFERENCE_DPB).unwrap();
        refs.add_ref(&mut arena, b, future, Link::PREV).unwrap();

        let pic = arena.get(b).unwrap();
        assert_eq!(pic.refs(LIST_PAST), &[past]);
        assert_eq!(pic.refs(LIST_FUTURE), &[future]);
        assert_eq!(pic.dpb(), &[past, future]);
        assert_eq!(pic.prev(), Some(future));
        assert_eq!(arena.get(past).unwrap().ref_count(), [2, 2]);
        assert_eq!(arena.get(future).unwrap().ref_count(), [3, 3]);
    }

    #[test]
    fn prev_outside_reference_lists_is_kept_in_dpb() {
        let mut arena = PictureArena::new();
        let refs = ReferenceManager::new(2);
        let anchor = picture(&mut arena, 0, PictureType::Idr);
        let i = picture(&mut arena, 1, PictureType::I);

        refs.add_ref(&mut arena, i, anchor, Link::PREV).unwrap();
        let pic = arena.get(i).unwrap();
        assert_eq!(pic.dpb(), &[anchor]);
        assert_eq!(arena.get(anchor).unwrap().ref_count(), [2, 2]);
    }

    #[test]
    fn self_reference_is_rejected() {
        let mut arena = PictureArena::new();
        let refs = ReferenceManager::new(2);
        let p = picture(&mut arena, 0, PictureType::P);
        assert!(matches!(
            refs.add_ref(&mut arena, p, p, Link::REFERENCE_DPB),
            Err(EncodeError::InvariantViolation(_))
        ));
    }

    #[test]
    fn full_dpb_evicts_oldest_and_releases_it() {
        let mut arena = PictureArena::new();
        let refs = ReferenceManager::new(2);
        let holder = picture(&mut arena, 100, PictureType::P);
        let targets = (0..=MAX_DPB_SIZE as i64)
            .map(|order| picture(&mut arena, order, PictureType::P))
            .collect::<Vec<_>>();

        for &target in &targets {
            refs.add_ref(&mut arena, holder, target, Link::DPB).unwrap();
        }
        let pic = arena.get(holder).unwrap();
        assert_eq!(pic.dpb().len(), MAX_DPB_SIZE);
        assert!(!pic.dpb().contains(&targets[0]));
        assert_eq!(arena.get(targets[0]).unwrap().ref_count(), [0, 0]);
        assert_eq!(arena.get(targets[1]).unwrap().ref_count(), [1, 1]);
    }

    #[test]
    fn idr_resets_next_prev_candidates() {
        let mut arena = PictureArena::new();
        let mut refs = ReferenceManager::new(2);
        let a = picture(&mut arena, 0, PictureType::P);
        let b = picture(&mut arena, 1, PictureType::P);
        let c = picture(&mut arena, 2, PictureType::P);
        let idr = picture(&mut arena, 3, PictureType::Idr);

        refs.add_next_prev(&mut arena, a).unwrap();
        refs.add_next_prev(&mut arena, b).unwrap();
        refs.add_next_prev(&mut arena, c).unwrap();
        assert_eq!(refs.next_prev().collect::<Vec<_>>(), vec![b, c]);
        assert_eq!(arena.get(a).unwrap().ref_count()[LEVEL_DIRECT], 0);

        refs.add_next_prev(&mut arena, idr).unwrap();
        assert_eq!(refs.next_prev().collect::<Vec<_>>(), vec![idr]);
        assert_eq!(arena.get(b).unwrap().ref_count()[LEVEL_DIRECT], 0);
        assert_eq!(arena.get(c).unwrap().ref_count()[LEVEL_DIRECT], 0);
        assert_eq!(refs.last_prev(), Some(idr));
    }

    #[test]
    fn retire_frees_only_unreferenced_complete_pictures() {
        let mut arena = PictureArena::new();
        let mut refs = ReferenceManager::new(2);
        let idr = picture(&mut arena, 0, PictureType::Idr);
        let p = picture(&mut arena, 1, PictureType::P);
        refs.add_ref(&mut arena, idr, idr, Link::DPB).unwrap();
        refs.add_ref(&mut arena, p, p, Link::DPB).unwrap();
        refs.add_ref(&mut arena, p, idr, Link::REFERENCE_DPB).unwrap();
        refs.add_ref(&mut arena, p, idr, Link::PREV).unwrap();
        refs.add_next_prev(&mut arena, idr).unwrap();
        refs.add_next_prev(&mut arena, p).unwrap();

        let mut window = VecDeque::from([idr, p]);
        arena.get_mut(idr).unwrap().encode_complete = true;
        let freed = refs.retire(&mut arena, &mut window, false).unwrap();
        assert!(freed.is_empty());

        arena.get_mut(p).unwrap().encode_complete = true;
        let freed = refs.retire(&mut arena, &mut window, false).unwrap();
        assert!(freed.is_empty());
        assert_eq!(window.len(), 2);

        refs.release_next_prev(&mut arena).unwrap();
        let freed = refs.retire(&mut arena, &mut window, true).unwrap();
        let mut orders = freed.iter().map(Picture::display_order).collect::<Vec<_>>();
        orders.sort_unstable();
        assert_eq!(orders, vec![0, 1]);
        assert!(window.is_empty());
        assert!(arena.is_empty());
        for pic in &freed {
            assert_eq!(pic.ref_count(), [0, 0]);
        }
    }

    #[test]
    fn next_prev_candidates_follow_l0_limit() {
        let mut arena = PictureArena::new();
        let mut refs = ReferenceManager::new(1);
        let idr = picture(&mut arena, 0, PictureType::Idr);
        let p1 = picture(&mut arena, 1, PictureType::P);
        let p2 = picture(&mut arena, 2, PictureType::P);

        refs.add_next_prev(&mut arena, idr).unwrap();
        refs.add_next_prev(&mut arena, p1).unwrap();
        assert_eq!(refs.next_prev().collect::<Vec<_>>(), vec![p1]);
        assert_eq!(arena.get(idr).unwrap().ref_count()[LEVEL_DIRECT], 0);

        refs.add_next_prev(&mut arena, p2).unwrap();
        assert_eq!(refs.next_prev().collect::<Vec<_>>(), vec![p2]);
        assert_eq!(arena.get(p1).unwrap().ref_count()[LEVEL_DIRECT], 0);
        assert_eq!(arena.get(p2).unwrap().ref_count()[LEVEL_DIRECT], 1);

        let unbounded = ReferenceManager::new(8);
        assert_eq!(unbounded.max_next_prev, MAX_PICTURE_REFERENCES);
    }
}
