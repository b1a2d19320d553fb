//! Software H.264/AVC Baseline profile video encoder.

pub mod bitreader;
pub mod bitwriter;
pub mod callbacks;
pub mod cavlc;
pub mod config;
pub mod deblock;
pub mod dpb;
pub mod eg;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod header;
pub mod intra;
pub mod macroblock;
pub mod motion_comp;
pub mod motion_est;
pub mod nal;
pub mod poc;
pub mod pps;
pub mod ratecontrol;
pub mod slice;
pub mod slice_encoder;
pub mod sps;
pub mod transform;

pub use callbacks::{EncoderCallbacks, InProcessPool};
pub use config::{EncoderConfig, Level, PocType, Profile};
pub use encoder::Encoder;
pub use error::{EncError, EncodeStatus, Result};
pub use frame::{InputFrame, Picture};
pub use nal::NalUnitType;
pub use pps::Pps;
pub use sps::Sps;
