//! Error and status types returned by the encoder's public operations.
//!
//! `Error` covers every failure kind enumerated in the encoder's validation
//! and runtime contract; `EncodeStatus` covers the non-error, status-like
//! results (`Ok`, `PictureReady`, `NewIdr`, `SkippedPicture`) that the
//! orchestrator's state machine also needs to surface to the caller.

use thiserror::Error;

/// Every fatal or retryable condition the encoder can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncError {
    #[error("encoder handle is not initialized")]
    Uninitialized,
    #[error("encoder handle is already initialized")]
    AlreadyInitialized,
    #[error("operation not legal in the current state")]
    WrongState,
    #[error("requested tool or option is not supported by this core")]
    NotSupported,
    #[error("allocation callback failed")]
    MemoryFail,
    #[error("level is not recognized")]
    LevelNotSupported,
    #[error("frame dimensions or bit rate exceed the selected level's limits")]
    LevelFail,
    #[error("profile is not supported by this core (Baseline only)")]
    ProfileNotSupported,
    #[error("a requested coding tool is outside the Baseline closed option set")]
    ToolsNotSupported,
    #[error("slice-group configuration outside FMO type 0")]
    InvalidFmoType,
    #[error("num_ref_frame outside 0..=16, or not 1 for this core")]
    InvalidNumRef,
    #[error("pic_order_cnt_lsb related field out of range")]
    InvalidPocLsb,
    #[error("num_slice_group must be 1")]
    InvalidNumSliceGroup,
    #[error("frame_rate is zero or otherwise invalid")]
    InvalidFrameRate,
    #[error("deblocking alpha_offset out of range")]
    InvalidAlphaOffset,
    #[error("deblocking beta_offset out of range")]
    InvalidBetaOffset,
    #[error("disable_db_idc out of range")]
    InvalidDeblockIdc,
    #[error("slice_group_change_rate invalid")]
    InvalidChangeRate,
    #[error("initial QP out of 0..=51 or incompatible with bitrate")]
    InitQpFail,
    #[error("initial QS out of 0..=51")]
    InitQsFail,
    #[error("chroma_qp_index_offset out of -12..=12")]
    ChromaQpFail,
    #[error("weighted bi-prediction is not supported by this core")]
    WeightedBipredFail,
    #[error("bitstream writer could not be initialized")]
    BitstreamInitFail,
    #[error("destination buffer is full and no overrun buffer is configured")]
    BitstreamBufferFull,
    #[error("SPS could not be formed from the given parameters")]
    SpsFail,
    #[error("PPS could not be formed from the given parameters")]
    PpsFail,
    #[error("picture order count computation failed")]
    PocFail,
    #[error("two consecutive non-reference frames under poc_type=2")]
    ConsecutiveNonref,
    #[error("slice contains zero macroblocks")]
    SliceEmpty,
    #[error("more than 3 trailing ones reported for a residual block")]
    TrailingOnesFail,
    #[error("unspecified internal failure")]
    Fail,
}

/// Non-error, status-like outcomes of a successful call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStatus {
    /// One NAL unit was written; more NALs remain for this picture (or none).
    Ok,
    /// The just-written NAL completed the current picture.
    PictureReady,
    /// `SetInput` detected (or was instructed to force) a new IDR; the
    /// caller must request SPS/PPS again before the next slice in
    /// out-of-band mode.
    NewIdr,
    /// Rate control declined to admit/encode this picture.
    SkippedPicture,
}

pub type Result<T> = std::result::Result<T, EncError>;
