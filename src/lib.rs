mod config;
mod contract;
mod dpb;
mod gop;
pub mod loopback;
mod picture;
mod pipeline;
mod scheduler;
mod timestamp;
mod worker;

pub use config::{EncoderCapabilities, GopStructure, SchedulerConfig};
pub use contract::{
    Allocation, CapabilityFlags, CropRect, EncodeError, EncodedOutput, HardwareOps, HwOp,
    InputFrame, Packet, PictureType, ReceiveStatus, RegionOfInterest, SurfaceHandle,
};
pub use picture::{
    BoundedList, CapacityError, LIST_FUTURE, LIST_PAST, Picture, PictureId, PictureInfo,
    PictureView,
};
pub use pipeline::{
    BoundedQueueRx, BoundedQueueTx, EncodeFifo, QueueRecvError, QueueSendError, QueueStats,
    StageTiming, bounded_queue,
};
pub use scheduler::EncodeScheduler;
pub use timestamp::{DtsEstimator, TimestampRing};
pub use worker::{EncodeWorker, WorkerEvent};

/// Pictures a DPB snapshot may hold.
pub const MAX_DPB_SIZE: usize = 16;
/// Entries per reference list.
pub const MAX_PICTURE_REFERENCES: usize = 2;
pub const MAX_REFERENCE_LIST_NUM: usize = 2;
pub const MAX_REORDER_DELAY: usize = 16;
pub const MAX_ASYNC_DEPTH: usize = 64;
pub const TIMESTAMP_RING_CAPACITY: usize = MAX_REORDER_DELAY * 3 + MAX_ASYNC_DEPTH;
