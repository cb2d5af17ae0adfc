use std::{fmt, fmt::Display};

use slab::Slab;
use smallvec::SmallVec;

use crate::{
    EncodeError, MAX_DPB_SIZE, MAX_PICTURE_REFERENCES, MAX_REFERENCE_LIST_NUM, PictureType,
    SurfaceHandle,
};

/// Stable handle to a picture in the arena.
///
/// The serial number makes a handle to a freed slot fail lookup instead of
/// aliasing whatever picture reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PictureId {
    key: usize,
    serial: u64,
}

impl Display for PictureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pic#{}", self.serial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError {
    pub capacity: usize,
}

impl Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bounded list capacity {} exceeded", self.capacity)
    }
}

/// A list that never grows past `N` entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedList<T, const N: usize> {
    items: SmallVec<[T; N]>,
}

impl<T, const N: usize> Default for BoundedList<T, N> {
    fn default() -> Self {
        Self {
            items: SmallVec::new(),
        }
    }
}

impl<T: Copy + PartialEq, const N: usize> BoundedList<T, N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: T) -> Result<(), CapacityError> {
        if self.items.len() >= N {
            return Err(CapacityError { capacity: N });
        }
        self.items.push(value);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> T {
        self.items.remove(index)
    }

    pub fn first(&self) -> Option<T> {
        self.items.first().copied()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == N
    }

    pub fn contains(&self, value: &T) -> bool {
        self.items.contains(value)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.items.iter().copied()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }
}

pub type RefList = BoundedList<PictureId, MAX_PICTURE_REFERENCES>;
pub type DpbList = BoundedList<PictureId, MAX_DPB_SIZE>;

/// Reference list index for pictures displayed before the current one.
pub const LIST_PAST: usize = 0;
/// Reference list index for pictures displayed after the current one.
pub const LIST_FUTURE: usize = 1;

/// Counter slot for relationships held by pictures that are still pending.
pub const LEVEL_DIRECT: usize = 0;
/// Counter slot for relationships kept alive through completed pictures.
pub const LEVEL_INDIRECT: usize = 1;

#[derive(Debug)]
pub struct Picture<P> {
    pub(crate) id: PictureId,
    pub(crate) display_order: i64,
    pub(crate) encode_order: Option<i64>,
    pub(crate) pts: i64,
    pub(crate) duration: i64,
    pub(crate) force_idr: bool,
    pub(crate) opaque: Option<u64>,

    pub(crate) pic_type: Option<PictureType>,
    pub(crate) b_depth: u32,
    pub(crate) is_reference: bool,

    pub(crate) input_surface: SurfaceHandle,
    pub(crate) recon_surface: Option<SurfaceHandle>,
    /// Taken out while the backend holds `&mut` access during issue/output.
    pub(crate) private: Option<P>,

    pub(crate) encode_issued: bool,
    pub(crate) encode_complete: bool,

    /// DPB contents after this picture is decoded; includes itself only if it is a reference.
    pub(crate) dpb: DpbList,
    pub(crate) refs: [RefList; MAX_REFERENCE_LIST_NUM],
    /// Previous reference picture in encode order; also present in `refs` or `dpb`.
    pub(crate) prev: Option<PictureId>,
    pub(crate) ref_count: [u32; 2],
    pub(crate) ref_removed: [bool; 2],
}

impl<P> Picture<P> {
    pub fn id(&self) -> PictureId {
        self.id
    }

    pub fn display_order(&self) -> i64 {
        self.display_order
    }

    pub fn encode_order(&self) -> Option<i64> {
        self.encode_order
    }

    pub fn pts(&self) -> i64 {
        self.pts
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn picture_type(&self) -> Option<PictureType> {
        self.pic_type
    }

    pub fn b_depth(&self) -> u32 {
        self.b_depth
    }

    pub fn is_reference(&self) -> bool {
        self.is_reference
    }

    pub fn input_surface(&self) -> SurfaceHandle {
        self.input_surface
    }

    pub fn recon_surface(&self) -> Option<SurfaceHandle> {
        self.recon_surface
    }

    pub fn private(&self) -> Option<&P> {
        self.private.as_ref()
    }

    pub fn refs(&self, list: usize) -> &[PictureId] {
        self.refs[list].as_slice()
    }

    pub fn dpb(&self) -> &[PictureId] {
        self.dpb.as_slice()
    }

    pub fn prev(&self) -> Option<PictureId> {
        self.prev
    }

    pub fn is_issued(&self) -> bool {
        self.encode_issued
    }

    pub fn is_complete(&self) -> bool {
        self.encode_complete
    }

    pub fn ref_count(&self) -> [u32; 2] {
        self.ref_count
    }

    pub(crate) fn is_b(&self) -> bool {
        self.pic_type == Some(PictureType::B)
    }

    pub(crate) fn info(&self) -> PictureInfo {
        PictureInfo {
            id: self.id,
            display_order: self.display_order,
            encode_order: self.encode_order,
            pts: self.pts,
            picture_type: self.pic_type,
            b_depth: self.b_depth,
            is_reference: self.is_reference,
            issued: self.encode_issued,
            complete: self.encode_complete,
            refs: [self.refs[0].as_slice().to_vec(), self.refs[1].as_slice().to_vec()],
            dpb: self.dpb.as_slice().to_vec(),
            prev: self.prev,
            ref_count: self.ref_count,
        }
    }
}

/// Owned snapshot of a picture's scheduling state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PictureInfo {
    pub id: PictureId,
    pub display_order: i64,
    pub encode_order: Option<i64>,
    pub pts: i64,
    pub picture_type: Option<PictureType>,
    pub b_depth: u32,
    pub is_reference: bool,
    pub issued: bool,
    pub complete: bool,
    pub refs: [Vec<PictureId>; 2],
    pub dpb: Vec<PictureId>,
    pub prev: Option<PictureId>,
    pub ref_count: [u32; 2],
}

#[derive(Debug)]
pub struct PictureArena<P> {
    slots: Slab<Picture<P>>,
    next_serial: u64,
}

impl<P> Default for PictureArena<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> PictureArena<P> {
    pub fn new() -> Self {
        Self {
            slots: Slab::with_capacity(MAX_DPB_SIZE * 2),
            next_serial: 0,
        }
    }

    pub(crate) fn insert(
        &mut self,
        display_order: i64,
        surface: SurfaceHandle,
        recon_surface: Option<SurfaceHandle>,
        private: P,
    ) -> PictureId {
        let serial = self.next_serial;
        self.next_serial += 1;
        let entry = self.slots.vacant_entry();
        let id = PictureId {
            key: entry.key(),
            serial,
        };
        entry.insert(Picture {
            id,
            display_order,
            encode_order: None,
            pts: 0,
            duration: 0,
            force_idr: false,
            opaque: None,
            pic_type: None,
            b_depth: 0,
            is_reference: false,
            input_surface: surface,
            recon_surface,
            private: Some(private),
            encode_issued: false,
            encode_complete: false,
            dpb: DpbList::new(),
            refs: [RefList::new(), RefList::new()],
            prev: None,
            ref_count: [0; 2],
            ref_removed: [false; 2],
        });
        id
    }

    pub(crate) fn remove(&mut self, id: PictureId) -> Option<Picture<P>> {
        self.get(id)?;
        Some(self.slots.remove(id.key))
    }

    pub fn get(&self, id: PictureId) -> Option<&Picture<P>> {
        self.slots.get(id.key).filter(|pic| pic.id.serial == id.serial)
    }

    pub(crate) fn get_mut(&mut self, id: PictureId) -> Option<&mut Picture<P>> {
        self.slots
            .get_mut(id.key)
            .filter(|pic| pic.id.serial == id.serial)
    }

    pub(crate) fn pic(&self, id: PictureId) -> Result<&Picture<P>, EncodeError> {
        self.get(id).ok_or_else(|| dangling(id))
    }

    pub(crate) fn pic_mut(&mut self, id: PictureId) -> Result<&mut Picture<P>, EncodeError> {
        self.get_mut(id).ok_or_else(|| dangling(id))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn ids(&self) -> Vec<PictureId> {
        self.slots.iter().map(|(_, pic)| pic.id).collect()
    }
}

fn dangling(id: PictureId) -> EncodeError {
    EncodeError::InvariantViolation(format!("{id} is not live in the picture arena"))
}

/// Read-only view of one picture and the graph it belongs to, handed to backends.
pub struct PictureView<'a, P> {
    arena: &'a PictureArena<P>,
    picture: &'a Picture<P>,
}

impl<'a, P> PictureView<'a, P> {
    pub(crate) fn new(arena: &'a PictureArena<P>, id: PictureId) -> Result<Self, EncodeError> {
        Ok(Self {
            arena,
            picture: arena.pic(id)?,
        })
    }

    pub fn picture(&self) -> &'a Picture<P> {
        self.picture
    }

    /// Coding type; always assigned before a picture reaches the backend.
    pub fn picture_type(&self) -> PictureType {
        self.picture.pic_type.unwrap_or(PictureType::P)
    }

    pub fn encode_order(&self) -> i64 {
        self.picture.encode_order.unwrap_or(-1)
    }

    /// Resolves a handle from this picture's lists. The picture being issued
    /// reports no private data while the backend holds it.
    pub fn lookup(&self, id: PictureId) -> Option<&'a Picture<P>> {
        self.arena.get(id)
    }

    pub fn past_refs(&self) -> impl Iterator<Item = &'a Picture<P>> + '_ {
        self.resolve(self.picture.refs(0))
    }

    pub fn future_refs(&self) -> impl Iterator<Item = &'a Picture<P>> + '_ {
        self.resolve(self.picture.refs(1))
    }

    pub fn dpb(&self) -> impl Iterator<Item = &'a Picture<P>> + '_ {
        self.resolve(self.picture.dpb())
    }

    pub fn prev(&self) -> Option<&'a Picture<P>> {
        self.picture.prev.and_then(|id| self.arena.get(id))
    }

    fn resolve<'s>(&'s self, ids: &'a [PictureId]) -> impl Iterator<Item = &'a Picture<P>> + 's {
        ids.iter().filter_map(|id| self.arena.get(*id))
    }
}
