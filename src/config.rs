//! Encoder configuration: the closed option set from spec section 6, plus
//! the profile/level table used to validate it.

use crate::error::{EncError, Result};
use serde::{Deserialize, Serialize};

/// Only Baseline is implemented; kept as an enum (rather than a constant)
/// because `Initialize` must reject anything else with a dedicated error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Profile {
    Baseline,
}

/// Level as `idc * 10`, e.g. level 1.1 is `Level(11)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level(pub u16);

impl Level {
    pub const L1: Level = Level(10);
    pub const L1B: Level = Level(9);
    pub const L1_1: Level = Level(11);
    pub const L1_2: Level = Level(12);
    pub const L1_3: Level = Level(13);
    pub const L2: Level = Level(20);
    pub const L2_1: Level = Level(21);
    pub const L2_2: Level = Level(22);
    pub const L3: Level = Level(30);
    pub const L3_1: Level = Level(31);

    /// `MaxVmvR`: the maximum vertical motion vector magnitude, in
    /// quarter-pel units, from Annex A Table A-1. The horizontal cap is a
    /// flat 2047 for every level (spec section 4.3).
    pub fn max_v_mv_r(self) -> Option<i32> {
        match self.0 {
            9 | 10 => Some(64),
            11 => Some(128),
            12 | 13 | 20 => Some(256),
            21 | 22 | 30 | 31 => Some(512),
            _ => None,
        }
    }

    /// Max macroblocks/sec and max frame size in MBs, used for a coarse
    /// level-fit check; not a full Annex A table, just enough to catch
    /// obviously-wrong combinations.
    pub fn max_frame_size_mbs(self) -> Option<u32> {
        match self.0 {
            9 | 10 => Some(99),
            11 => Some(396),
            12 | 13 | 20 => Some(396),
            21 => Some(792),
            22 | 30 => Some(1620),
            31 => Some(3600),
            _ => None,
        }
    }

    /// `level_idc` as it appears in the SPS. Level 1b shares level_idc 11
    /// with level 1.1 and is disambiguated by `constraint_set3_flag`.
    pub fn idc(self) -> u8 {
        if self.0 == Self::L1B.0 {
            11
        } else {
            self.0 as u8
        }
    }

    pub fn is_level_1b(self) -> bool {
        self.0 == Self::L1B.0
    }
}

/// Picture order count derivation mode (spec section 4.9).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PocType {
    Mode0 { log2_max_poc_lsb_minus4: u8 },
    Mode1 {
        delta_always_zero: bool,
        offset_for_non_ref_pic: i32,
        offset_for_top_to_bottom: i32,
        offsets_for_ref_frame: Vec<i32>,
    },
    Mode2,
}

/// Whether SPS/PPS are emitted once up front or re-sent inline at each IDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamSetMode {
    OutOfBand,
    Inline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    /// Frames per 1000 seconds, matching the original's `frame_rate` unit.
    pub frame_rate_1000: u32,
    pub bitrate: u32,
    pub cpb_size: u32,
    pub init_cpb_removal_delay: u32,
    pub rate_control_enabled: bool,
    /// 0 means auto-pick from bits-per-pixel thresholds.
    pub init_qp: u8,
    /// -1 = infinite (single IDR), 0 = all-I, N = every N frames.
    pub idr_period: i32,
    pub intra_mb_refresh: u32,
    pub num_ref_frame: u8,
    pub num_slice_group: u8,
    pub poc_type: PocType,
    pub param_set_mode: ParamSetMode,
    pub use_overrun_buffer: bool,
    pub disable_deblocking_idc: u8,
    pub alpha_offset: i8,
    pub beta_offset: i8,
    pub constrained_intra_pred: bool,
    pub auto_scd: bool,
    pub profile: Profile,
    pub level: Level,
}

impl EncoderConfig {
    /// Mirrors the validation `Initialize` must perform before anything is
    /// allocated (spec section 4.1). Each failure returns the dedicated
    /// error kind named in section 7, never a generic `Fail`.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.width % 16 != 0 || self.height % 16 != 0 {
            return Err(EncError::LevelFail);
        }
        if self.level.max_v_mv_r().is_none() {
            return Err(EncError::LevelNotSupported);
        }
        if let Some(max_mbs) = self.level.max_frame_size_mbs() {
            let mbs = (self.width / 16) * (self.height / 16);
            if mbs > max_mbs {
                return Err(EncError::LevelFail);
            }
        }
        if self.num_ref_frame > 16 {
            return Err(EncError::InvalidNumRef);
        }
        if self.num_ref_frame != 1 {
            // Baseline core in this crate only ever keeps one short-term
            // reference; a host asking for more is asking for a tool we
            // do not implement, not an out-of-range value.
            return Err(EncError::ToolsNotSupported);
        }
        if self.num_slice_group != 1 {
            return Err(EncError::InvalidNumSliceGroup);
        }
        if self.frame_rate_1000 == 0 {
            return Err(EncError::InvalidFrameRate);
        }
        if (self.width * 8) > u16::MAX as u32 {
            return Err(EncError::LevelFail);
        }
        if self.init_qp > 51 {
            return Err(EncError::InitQpFail);
        }
        if !(-31..=31).contains(&(self.alpha_offset as i32 * 2)) {
            return Err(EncError::InvalidAlphaOffset);
        }
        if !(-31..=31).contains(&(self.beta_offset as i32 * 2)) {
            return Err(EncError::InvalidBetaOffset);
        }
        if self.disable_deblocking_idc > 2 {
            return Err(EncError::InvalidDeblockIdc);
        }
        if let PocType::Mode0 {
            log2_max_poc_lsb_minus4,
        } = self.poc_type
        {
            if log2_max_poc_lsb_minus4 > 12 {
                return Err(EncError::InvalidPocLsb);
            }
        }
        Ok(())
    }

    pub fn mb_width(&self) -> u32 {
        self.width / 16
    }

    pub fn mb_height(&self) -> u32 {
        self.height / 16
    }

    pub fn pic_size_in_mbs(&self) -> u32 {
        self.mb_width() * self.mb_height()
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 176,
            height: 144,
            frame_rate_1000: 15000,
            bitrate: 64000,
            cpb_size: 32000,
            init_cpb_removal_delay: 0,
            rate_control_enabled: true,
            init_qp: 28,
            idr_period: 10,
            intra_mb_refresh: 0,
            num_ref_frame: 1,
            num_slice_group: 1,
            poc_type: PocType::Mode0 {
                log2_max_poc_lsb_minus4: 2,
            },
            param_set_mode: ParamSetMode::OutOfBand,
            use_overrun_buffer: true,
            disable_deblocking_idc: 0,
            alpha_offset: 0,
            beta_offset: 0,
            constrained_intra_pred: false,
            auto_scd: true,
            profile: Profile::Baseline,
            level: Level::L1_1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_multiple_of_16() {
        let mut cfg = EncoderConfig::default();
        cfg.width = 177;
        assert_eq!(cfg.validate(), Err(EncError::LevelFail));
    }

    #[test]
    fn rejects_multiple_ref_frames() {
        let mut cfg = EncoderConfig::default();
        cfg.num_ref_frame = 2;
        assert_eq!(cfg.validate(), Err(EncError::ToolsNotSupported));
    }

    #[test]
    fn accepts_minimum_frame() {
        let mut cfg = EncoderConfig::default();
        cfg.width = 16;
        cfg.height = 16;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = EncoderConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EncoderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.width, back.width);
        assert_eq!(cfg.bitrate, back.bitrate);
    }
}
