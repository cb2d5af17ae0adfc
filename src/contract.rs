use std::ops::{BitOr, BitOrAssign};
use std::{fmt, fmt::Display};

use crate::picture::PictureView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PictureType {
    Idr,
    I,
    P,
    B,
}

impl PictureType {
    pub fn is_key(self) -> bool {
        matches!(self, Self::Idr | Self::I)
    }
}

impl Display for PictureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idr => f.write_str("IDR"),
            Self::I => f.write_str("I"),
            Self::P => f.write_str("P"),
            Self::B => f.write_str("B"),
        }
    }
}

/// Backend capability bits reported alongside the hardware operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CapabilityFlags(u32);

impl CapabilityFlags {
    pub const NONE: Self = Self(0);
    pub const INTRA_ONLY: Self = Self(1 << 2);
    pub const B_PICTURES: Self = Self(1 << 3);
    pub const B_PICTURE_REFERENCES: Self = Self(1 << 4);
    /// Key pictures do not necessarily empty the DPB.
    pub const NON_IDR_KEY_PICTURES: Self = Self(1 << 5);
    /// Top-layer P pictures may reference every next-previous candidate.
    pub const MULTI_PAST_REFERENCES: Self = Self(1 << 16);
    /// Output packets carry DTS equal to PTS.
    pub const TIMESTAMP_NO_DELAY: Self = Self(1 << 17);
    /// Issue and output may be separated; enables the async FIFO.
    pub const ASYNC_ENCODE: Self = Self(1 << 18);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for CapabilityFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for CapabilityFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Non-owning handle to an image surface owned by a frame-context collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);

impl Display for SurfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRect {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

impl CropRect {
    pub fn is_empty(&self) -> bool {
        self.top == 0 && self.bottom == 0 && self.left == 0 && self.right == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionOfInterest {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
    pub qoffset: i32,
}

#[derive(Debug, Clone)]
pub struct InputFrame {
    pub surface: SurfaceHandle,
    pub pts: i64,
    pub duration: i64,
    pub force_idr: bool,
    pub crop: CropRect,
    pub roi: Vec<RegionOfInterest>,
    pub opaque: Option<u64>,
}

impl InputFrame {
    #[must_use]
    pub fn new(surface: SurfaceHandle, pts: i64, duration: i64) -> Self {
        Self {
            surface,
            pts,
            duration,
            force_idr: false,
            crop: CropRect::default(),
            roi: Vec::new(),
            opaque: None,
        }
    }
}

/// What `HardwareOps::alloc` hands back for a newly accepted frame.
#[derive(Debug)]
pub struct Allocation<P> {
    pub private: P,
    pub recon_surface: Option<SurfaceHandle>,
}

/// Coded payload produced by `HardwareOps::output`.
#[derive(Debug, Clone, Default)]
pub struct EncodedOutput {
    pub data: Vec<u8>,
    /// Payload that must be emitted after every earlier-displayed B picture.
    pub tail: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub is_keyframe: bool,
    pub picture_type: PictureType,
    pub display_order: i64,
    pub encode_order: i64,
    pub opaque: Option<u64>,
    pub is_tail: bool,
}

impl Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet(type={}, pts={}, dts={}, size={}, display_order={}, encode_order={})",
            self.picture_type,
            self.pts,
            self.dts,
            self.data.len(),
            self.display_order,
            self.encode_order
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveStatus {
    Packet(Packet),
    NeedMoreInput,
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwOp {
    Alloc,
    Issue,
    Output,
    Free,
}

impl Display for HwOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc => f.write_str("alloc"),
            Self::Issue => f.write_str("issue"),
            Self::Output => f.write_str("output"),
            Self::Free => f.write_str("free"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("temporary backpressure: {0}")]
    TemporaryBackpressure(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl EncodeError {
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::TemporaryBackpressure(_))
    }
}

/// The four operations every hardware backend supplies to the scheduler.
///
/// `Private` is the backend's per-picture state. It is created by `alloc`
/// and handed back to `free` by value exactly once.
pub trait HardwareOps {
    type Private;

    fn alloc(&mut self, frame: &InputFrame) -> Result<Allocation<Self::Private>, EncodeError>;

    fn issue(
        &mut self,
        picture: &PictureView<'_, Self::Private>,
        private: &mut Self::Private,
    ) -> Result<(), EncodeError>;

    /// Only called after `issue` succeeded for the same picture.
    fn output(
        &mut self,
        picture: &PictureView<'_, Self::Private>,
        private: &mut Self::Private,
    ) -> Result<EncodedOutput, EncodeError>;

    fn free(&mut self, private: Self::Private) -> Result<(), EncodeError>;
}
