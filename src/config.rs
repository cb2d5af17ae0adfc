use std::{fmt, fmt::Display};

use tracing::{debug, warn};

use crate::{CapabilityFlags, EncodeError, MAX_ASYNC_DEPTH, MAX_REORDER_DELAY};

const METRICS_ENV: &str = "HWENC_SCHED_METRICS";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub gop_size: u32,
    pub max_b_frames: u32,
    /// Top-layer P pictures per GOP before a new key picture; `None` is unbounded.
    pub p_per_i: Option<u32>,
    /// GOPs per IDR period when the backend allows non-IDR key pictures.
    pub idr_interval: u32,
    /// Desired maximum B-picture reference depth; zero disables B pictures.
    pub b_depth: u32,
    pub async_depth: usize,
    pub closed_gop: bool,
    pub report_metrics: Option<bool>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            gop_size: 120,
            max_b_frames: 0,
            p_per_i: None,
            idr_interval: 0,
            b_depth: 1,
            async_depth: 2,
            closed_gop: false,
            report_metrics: None,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.async_depth == 0 || self.async_depth > MAX_ASYNC_DEPTH {
            return Err(EncodeError::UnsupportedConfig(format!(
                "async_depth must be in 1..={MAX_ASYNC_DEPTH}, got {}",
                self.async_depth
            )));
        }
        if self.max_b_frames as usize > MAX_REORDER_DELAY {
            return Err(EncodeError::UnsupportedConfig(format!(
                "max_b_frames must be at most {MAX_REORDER_DELAY}, got {}",
                self.max_b_frames
            )));
        }
        Ok(())
    }

    pub(crate) fn metrics_enabled(&self) -> bool {
        self.report_metrics.unwrap_or_else(|| {
            std::env::var(METRICS_ENV)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        })
    }
}

impl Display for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SchedulerConfig(gop_size={}, max_b_frames={}, idr_interval={}, b_depth={}, async_depth={}, closed_gop={})",
            self.gop_size,
            self.max_b_frames,
            self.idr_interval,
            self.b_depth,
            self.async_depth,
            self.closed_gop
        )
    }
}

#[derive(Debug, Clone)]
pub struct EncoderCapabilities {
    pub flags: CapabilityFlags,
    pub max_refs_l0: u32,
    pub max_refs_l1: u32,
    /// The backend only predicts from past pictures (low-delay B or P only).
    pub prediction_pre_only: bool,
    pub roi_supported: bool,
}

impl Default for EncoderCapabilities {
    fn default() -> Self {
        Self {
            flags: CapabilityFlags::B_PICTURES | CapabilityFlags::ASYNC_ENCODE,
            max_refs_l0: 1,
            max_refs_l1: 1,
            prediction_pre_only: false,
            roi_supported: false,
        }
    }
}

/// Cadence parameters derived from the user config and what the backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopStructure {
    pub gop_size: u32,
    pub closed_gop: bool,
    pub gop_per_idr: u32,
    /// P pictures allowed per GOP before a new key picture; `None` is unbounded.
    pub p_per_i: Option<u32>,
    pub max_b_depth: u32,
    pub b_per_p: u32,
    /// B pictures were requested but the backend or config ruled them out.
    pub b_pictures_clamped: bool,
}

impl GopStructure {
    pub fn resolve(
        config: &SchedulerConfig,
        caps: &EncoderCapabilities,
    ) -> Result<Self, EncodeError> {
        let mut gop = Self {
            gop_size: 1,
            closed_gop: true,
            gop_per_idr: 1,
            p_per_i: None,
            max_b_depth: 0,
            b_per_p: 0,
            b_pictures_clamped: false,
        };

        if caps.flags.contains(CapabilityFlags::INTRA_ONLY) || config.gop_size <= 1 {
            debug!("using intra pictures only");
        } else if caps.max_refs_l0 < 1 {
            return Err(EncodeError::UnsupportedConfig(
                "backend does not support any reference pictures".to_string(),
            ));
        } else if !caps.flags.contains(CapabilityFlags::B_PICTURES)
            || caps.max_refs_l1 < 1
            || config.max_b_frames < 1
            || caps.prediction_pre_only
            || config.b_depth == 0
        {
            debug!(
                refs_l0 = caps.max_refs_l0,
                refs_l1 = caps.max_refs_l1,
                "using intra and P pictures"
            );
            gop.gop_size = config.gop_size;
            gop.p_per_i = config.p_per_i;
            gop.b_pictures_clamped = config.max_b_frames > 0;
        } else {
            debug!(
                refs_l0 = caps.max_refs_l0,
                refs_l1 = caps.max_refs_l1,
                "using intra, P and B pictures"
            );
            gop.gop_size = config.gop_size;
            gop.p_per_i = config.p_per_i;
            gop.b_per_p = config.max_b_frames;
            gop.max_b_depth = if caps.flags.contains(CapabilityFlags::B_PICTURE_REFERENCES) {
                config.b_depth.min(gop.b_per_p.ilog2() + 1)
            } else {
                1
            };
        }

        if caps.flags.contains(CapabilityFlags::NON_IDR_KEY_PICTURES) {
            gop.closed_gop = config.closed_gop;
            gop.gop_per_idr = config.idr_interval.max(1);
        }

        if gop.b_pictures_clamped {
            warn!(
                max_b_frames = config.max_b_frames,
                b_depth = config.b_depth,
                "B-pictures requested but not usable; B-depth forced to 0"
            );
        }
        Ok(gop)
    }

    /// Pictures by which output trails input.
    pub fn output_delay(&self) -> usize {
        self.b_per_p as usize
    }

    /// Pictures a decoder buffers before it can emit in display order.
    pub fn decode_delay(&self) -> usize {
        self.max_b_depth as usize
    }
}

impl Display for GopStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GopStructure(gop_size={}, closed_gop={}, gop_per_idr={}, b_per_p={}, max_b_depth={})",
            self.gop_size, self.closed_gop, self.gop_per_idr, self.b_per_p, self.max_b_depth
        )
    }
}
