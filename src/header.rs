//! Ties `Sps`/`Pps`/`SliceHeader` encoding into complete NAL units, the
//! thin layer the original's `header.cpp` occupies between the
//! parameter-set/slice-header structs and the per-frame encode loop.

use crate::config::{EncoderConfig, ParamSetMode};
use crate::error::Result;
use crate::nal::{wrap_rbsp, NalUnitType};
use crate::pps::Pps;
use crate::slice::{SliceHeader, SliceType};
use crate::sps::Sps;
use crate::bitwriter::BitWriter;

/// Builds the SPS and PPS from the encoder configuration. Called once at
/// `Initialize` time; re-encoded into NAL units either up front or before
/// every IDR, depending on `ParamSetMode`.
pub fn build_param_sets(cfg: &EncoderConfig) -> (Sps, Pps) {
    let sps = Sps::from_config(cfg);
    let pps = Pps::from_config(cfg);
    (sps, pps)
}

/// Encodes one parameter set's RBSP and wraps it in Annex-B start-code +
/// emulation-prevented EBSP.
pub fn encode_sps_nal(sps: &Sps) -> Result<Vec<u8>> {
    let mut w = BitWriter::new(None);
    sps.encode(&mut w)?;
    w.rbsp_trailing_bits()?;
    Ok(wrap_rbsp(4, 3, NalUnitType::Sps, &w.into_bytes()))
}

pub fn encode_pps_nal(pps: &Pps) -> Result<Vec<u8>> {
    let mut w = BitWriter::new(None);
    pps.encode(&mut w)?;
    w.rbsp_trailing_bits()?;
    Ok(wrap_rbsp(4, 3, NalUnitType::Pps, &w.into_bytes()))
}

/// Whether parameter sets must be (re-)emitted before this picture, per
/// the configured `ParamSetMode`. `OutOfBand` delivers them once, out of
/// the NAL stream, at session setup; `Inline` repeats them before every
/// IDR so the stream is self-describing after a random access point.
pub fn should_emit_param_sets(cfg: &EncoderConfig, is_idr: bool, is_first_picture: bool) -> bool {
    match cfg.param_set_mode {
        ParamSetMode::OutOfBand => false,
        ParamSetMode::Inline => is_idr || is_first_picture,
    }
}

/// Builds the slice header for one picture; the caller supplies
/// `pic_order_cnt_lsb` from `PocState` and `qp` from the rate controller.
#[allow(clippy::too_many_arguments)]
pub fn build_slice_header(is_idr: bool, slice_type: SliceType, pps: &Pps, frame_num: u32, idr_pic_id: u32, pic_order_cnt_lsb: u32, qp: u8, cfg: &EncoderConfig) -> SliceHeader {
    SliceHeader::new(
        is_idr,
        slice_type,
        pps.pic_parameter_set_id,
        frame_num,
        idr_pic_id,
        pic_order_cnt_lsb,
        qp,
        pps.pic_init_qp_minus26 as i32 + 26,
        cfg.disable_deblocking_idc,
        cfg.alpha_offset,
        cfg.beta_offset,
    )
}

/// Encodes a complete slice NAL: start code, NAL header, slice header,
/// `slice_data()` (already written into `w` by the caller before this is
/// invoked), and RBSP trailing bits.
pub fn finish_slice_nal(mut w: BitWriter, is_idr: bool, ref_idc: u8) -> Result<Vec<u8>> {
    w.rbsp_trailing_bits()?;
    let nal_type = if is_idr { NalUnitType::IdrSlice } else { NalUnitType::NonIdrSlice };
    Ok(wrap_rbsp(4, ref_idc, nal_type, &w.into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_param_sets_matches_config_dimensions() {
        let cfg = EncoderConfig::default();
        let (sps, _pps) = build_param_sets(&cfg);
        assert_eq!(sps.pic_width_in_mbs_minus1 as u32 + 1, cfg.mb_width());
    }

    #[test]
    fn param_set_mode_inline_emits_on_every_idr_and_first_picture() {
        let mut cfg = EncoderConfig::default();
        cfg.param_set_mode = ParamSetMode::Inline;
        assert!(should_emit_param_sets(&cfg, true, false));
        assert!(should_emit_param_sets(&cfg, false, true));
        assert!(!should_emit_param_sets(&cfg, false, false));
    }

    #[test]
    fn param_set_mode_out_of_band_never_emits_inline() {
        let mut cfg = EncoderConfig::default();
        cfg.param_set_mode = ParamSetMode::OutOfBand;
        assert!(!should_emit_param_sets(&cfg, true, true));
    }
}
