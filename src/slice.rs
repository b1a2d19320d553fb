//! Slice header: parsing (for completeness/testing) and encoding
//! (`EncodeSliceHeader` in the original's `header.cpp`). Baseline profile
//! only ever emits P and I slices; the B/SP/SI variants exist in
//! `SliceType` because the numbering in subclause 7.4.3 is mod-5, not
//! because this core produces them.

use crate::bitreader::BitReader;
use crate::bitwriter::BitWriter;
use crate::eg::{read_se, read_ue, write_se, write_ue};
use crate::nal::NalUnitType;
use crate::pps::Pps;
use crate::sps::Sps;
use crate::error::{EncError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn from_value(value: u32) -> Option<Self> {
        match value % 5 {
            0 => Some(SliceType::P),
            1 => Some(SliceType::B),
            2 => Some(SliceType::I),
            3 => Some(SliceType::Sp),
            4 => Some(SliceType::Si),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,
    pub colour_plane_id: u8,
    pub frame_num: u32,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u32,
    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u32,
    pub num_ref_idx_l1_active_minus1: u32,

    /// Always false: this core never reorders the (single) reference list.
    pub ref_pic_list_reordering_flag_l0: bool,
    /// IDR-only marking bits; always written false/false since there is
    /// nothing to suppress from output and no long-term references.
    pub no_output_of_prior_pics_flag: bool,
    pub long_term_reference_flag: bool,
    /// Non-IDR reference-picture marking; always false (no MMCO commands —
    /// the single short-term reference is replaced implicitly every frame).
    pub adaptive_ref_pic_marking_mode_flag: bool,

    pub slice_qp_delta: i32,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,
}

impl SliceHeader {
    /// Builds a slice header for one coded picture. `qp` is the slice-level
    /// QP chosen by rate control; `frame_num`/`poc_lsb`/`idr_pic_id` come
    /// from the session's frame_num/POC bookkeeping.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        is_idr: bool,
        slice_type: SliceType,
        pic_parameter_set_id: u8,
        frame_num: u32,
        idr_pic_id: u32,
        pic_order_cnt_lsb: u32,
        qp: u8,
        pic_init_qp: i32,
        disable_deblocking_filter_idc: u8,
        slice_alpha_c0_offset_div2: i8,
        slice_beta_offset_div2: i8,
    ) -> Self {
        SliceHeader {
            first_mb_in_slice: 0,
            slice_type,
            pic_parameter_set_id,
            colour_plane_id: 0,
            frame_num,
            field_pic_flag: false,
            bottom_field_flag: false,
            idr_pic_id: if is_idr { idr_pic_id } else { 0 },
            pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom: 0,
            delta_pic_order_cnt: [0, 0],
            redundant_pic_cnt: 0,
            direct_spatial_mv_pred_flag: false,
            num_ref_idx_active_override_flag: false,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            ref_pic_list_reordering_flag_l0: false,
            no_output_of_prior_pics_flag: false,
            long_term_reference_flag: false,
            adaptive_ref_pic_marking_mode_flag: false,
            slice_qp_delta: qp as i32 - pic_init_qp,
            disable_deblocking_filter_idc,
            slice_alpha_c0_offset_div2,
            slice_beta_offset_div2,
        }
    }

    /// Writes `slice_header()` (subclause 7.3.3) for a non-field, single
    /// reference-list, CAVLC-only Baseline slice. Caller writes
    /// `slice_data()` immediately after and then `rbsp_trailing_bits()`.
    pub fn encode(&self, w: &mut BitWriter, nal_type: NalUnitType, sps: &Sps, pps: &Pps) -> Result<()> {
        write_ue(w, self.first_mb_in_slice)?;
        write_ue(w, self.slice_type as u32)?;
        write_ue(w, self.pic_parameter_set_id as u32)?;

        if sps.separate_colour_plane_flag {
            w.write_bits(2, self.colour_plane_id as u32)?;
        }

        let frame_num_bits = sps.log2_max_frame_num_minus4 + 4;
        w.write_bits(frame_num_bits as u32, self.frame_num)?;

        if !sps.frame_mbs_only_flag {
            w.write_flag(self.field_pic_flag)?;
            if self.field_pic_flag {
                w.write_flag(self.bottom_field_flag)?;
            }
        }

        let is_idr = nal_type == NalUnitType::IdrSlice;
        if is_idr {
            write_ue(w, self.idr_pic_id)?;
        }

        if sps.pic_order_cnt_type == 0 {
            let bits = sps.log2_max_pic_order_cnt_lsb_minus4 + 4;
            w.write_bits(bits as u32, self.pic_order_cnt_lsb)?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !self.field_pic_flag {
                write_se(w, self.delta_pic_order_cnt_bottom)?;
            }
        } else if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            write_se(w, self.delta_pic_order_cnt[0])?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !self.field_pic_flag {
                write_se(w, self.delta_pic_order_cnt[1])?;
            }
        }

        if pps.redundant_pic_cnt_present_flag {
            write_ue(w, self.redundant_pic_cnt)?;
        }

        if self.slice_type == SliceType::B {
            w.write_flag(self.direct_spatial_mv_pred_flag)?;
        }

        if matches!(self.slice_type, SliceType::P | SliceType::Sp | SliceType::B) {
            w.write_flag(self.num_ref_idx_active_override_flag)?;
            if self.num_ref_idx_active_override_flag {
                write_ue(w, self.num_ref_idx_l0_active_minus1)?;
                if self.slice_type == SliceType::B {
                    write_ue(w, self.num_ref_idx_l1_active_minus1)?;
                }
            }
        }

        if matches!(self.slice_type, SliceType::P | SliceType::Sp | SliceType::B) {
            w.write_flag(self.ref_pic_list_reordering_flag_l0)?;
        }
        if self.slice_type == SliceType::B {
            w.write_flag(false)?;
        }

        if is_idr {
            w.write_flag(self.no_output_of_prior_pics_flag)?;
            w.write_flag(self.long_term_reference_flag)?;
        } else {
            w.write_flag(self.adaptive_ref_pic_marking_mode_flag)?;
        }

        if pps.entropy_coding_mode_flag && self.slice_type != SliceType::I && self.slice_type != SliceType::Si {
            write_ue(w, 0)?;
        }

        write_se(w, self.slice_qp_delta)?;

        if self.slice_type == SliceType::Sp || self.slice_type == SliceType::Si {
            if self.slice_type == SliceType::Sp {
                w.write_flag(false)?;
            }
            write_se(w, 0)?;
        }

        if pps.deblocking_filter_control_present_flag {
            write_ue(w, self.disable_deblocking_filter_idc as u32)?;
            if self.disable_deblocking_filter_idc != 1 {
                write_se(w, self.slice_alpha_c0_offset_div2 as i32)?;
                write_se(w, self.slice_beta_offset_div2 as i32)?;
            }
        }

        if pps.num_slice_groups_minus1 > 0 && (3..=5).contains(&pps.slice_group_map_type) {
            // Not reachable: this core always configures num_slice_groups_minus1 = 0.
        }

        Ok(())
    }

    pub fn parse(
        rbsp: &[u8],
        nal_type: NalUnitType,
        sps: &Sps,
        pps: &Pps,
    ) -> Result<Self> {
        let mut reader = BitReader::new(rbsp);

        let first_mb_in_slice = read_ue(&mut reader)?;

        let slice_type_value = read_ue(&mut reader)?;
        let slice_type = SliceType::from_value(slice_type_value).ok_or(EncError::Fail)?;

        let pic_parameter_set_id = read_ue(&mut reader)?;
        if pic_parameter_set_id > 255 {
            return Err(EncError::Fail);
        }

        let mut colour_plane_id = 0;
        if sps.separate_colour_plane_flag {
            colour_plane_id = reader.read_bits(2)? as u8;
        }

        let frame_num_bits = sps.log2_max_frame_num_minus4 + 4;
        let frame_num = reader.read_bits(frame_num_bits as u32)?;

        let mut field_pic_flag = false;
        let mut bottom_field_flag = false;

        if !sps.frame_mbs_only_flag {
            field_pic_flag = reader.read_flag()?;
            if field_pic_flag {
                bottom_field_flag = reader.read_flag()?;
            }
        }

        let is_idr = nal_type == NalUnitType::IdrSlice;
        let mut idr_pic_id = 0;
        if is_idr {
            idr_pic_id = read_ue(&mut reader)?;
        }

        let mut pic_order_cnt_lsb = 0;
        let mut delta_pic_order_cnt_bottom = 0;
        let mut delta_pic_order_cnt = [0, 0];

        if sps.pic_order_cnt_type == 0 {
            let pic_order_cnt_lsb_bits = sps.log2_max_pic_order_cnt_lsb_minus4 + 4;
            pic_order_cnt_lsb = reader.read_bits(pic_order_cnt_lsb_bits as u32)?;

            if pps.bottom_field_pic_order_in_frame_present_flag && !field_pic_flag {
                delta_pic_order_cnt_bottom = read_se(&mut reader)?;
            }
        } else if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            delta_pic_order_cnt[0] = read_se(&mut reader)?;

            if pps.bottom_field_pic_order_in_frame_present_flag && !field_pic_flag {
                delta_pic_order_cnt[1] = read_se(&mut reader)?;
            }
        }

        let mut redundant_pic_cnt = 0;
        if pps.redundant_pic_cnt_present_flag {
            redundant_pic_cnt = read_ue(&mut reader)?;
        }

        let mut direct_spatial_mv_pred_flag = false;
        if slice_type == SliceType::B {
            direct_spatial_mv_pred_flag = reader.read_flag()?;
        }

        let mut num_ref_idx_active_override_flag = false;
        let mut num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1 as u32;
        let mut num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1 as u32;

        if matches!(slice_type, SliceType::P | SliceType::Sp | SliceType::B) {
            num_ref_idx_active_override_flag = reader.read_flag()?;

            if num_ref_idx_active_override_flag {
                num_ref_idx_l0_active_minus1 = read_ue(&mut reader)?;

                if slice_type == SliceType::B {
                    num_ref_idx_l1_active_minus1 = read_ue(&mut reader)?;
                }
            }
        }

        let mut ref_pic_list_reordering_flag_l0 = false;
        if matches!(slice_type, SliceType::P | SliceType::Sp | SliceType::B) {
            ref_pic_list_reordering_flag_l0 = reader.read_flag()?;
            if ref_pic_list_reordering_flag_l0 {
                loop {
                    let idc = read_ue(&mut reader)?;
                    if idc == 3 {
                        break;
                    }
                    let _val = read_ue(&mut reader)?;
                }
            }
        }
        if slice_type == SliceType::B {
            let flag_l1 = reader.read_flag()?;
            if flag_l1 {
                loop {
                    let idc = read_ue(&mut reader)?;
                    if idc == 3 {
                        break;
                    }
                    let _val = read_ue(&mut reader)?;
                }
            }
        }

        let mut no_output_of_prior_pics_flag = false;
        let mut long_term_reference_flag = false;
        let mut adaptive_ref_pic_marking_mode_flag = false;
        if is_idr {
            no_output_of_prior_pics_flag = reader.read_flag()?;
            long_term_reference_flag = reader.read_flag()?;
        } else {
            adaptive_ref_pic_marking_mode_flag = reader.read_flag()?;
            if adaptive_ref_pic_marking_mode_flag {
                loop {
                    let op = read_ue(&mut reader)?;
                    if op == 0 {
                        break;
                    }
                    match op {
                        1 | 3 => {
                            let _ = read_ue(&mut reader)?;
                            if op == 3 {
                                let _ = read_ue(&mut reader)?;
                            }
                        }
                        2 => {
                            let _ = read_ue(&mut reader)?;
                        }
                        4 => {
                            let _ = read_ue(&mut reader)?;
                        }
                        6 => {
                            let _ = read_ue(&mut reader)?;
                        }
                        _ => {}
                    }
                }
            }
        }

        if pps.entropy_coding_mode_flag && slice_type != SliceType::I && slice_type != SliceType::Si {
            let _cabac_init_idc = read_ue(&mut reader)?;
        }

        let slice_qp_delta = read_se(&mut reader)?;

        if slice_type == SliceType::Sp || slice_type == SliceType::Si {
            if slice_type == SliceType::Sp {
                let _sp_for_switch_flag = reader.read_flag()?;
            }
            let _slice_qs_delta = read_se(&mut reader)?;
        }

        let mut disable_deblocking_filter_idc = 0;
        let mut slice_alpha_c0_offset_div2 = 0;
        let mut slice_beta_offset_div2 = 0;
        if pps.deblocking_filter_control_present_flag {
            disable_deblocking_filter_idc = read_ue(&mut reader)? as u8;
            if disable_deblocking_filter_idc != 1 {
                slice_alpha_c0_offset_div2 = read_se(&mut reader)? as i8;
                slice_beta_offset_div2 = read_se(&mut reader)? as i8;
            }
        }

        Ok(SliceHeader {
            first_mb_in_slice,
            slice_type,
            pic_parameter_set_id: pic_parameter_set_id as u8,
            colour_plane_id,
            frame_num,
            field_pic_flag,
            bottom_field_flag,
            idr_pic_id,
            pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom,
            delta_pic_order_cnt,
            redundant_pic_cnt,
            direct_spatial_mv_pred_flag,
            num_ref_idx_active_override_flag,
            num_ref_idx_l0_active_minus1,
            num_ref_idx_l1_active_minus1,
            ref_pic_list_reordering_flag_l0,
            no_output_of_prior_pics_flag,
            long_term_reference_flag,
            adaptive_ref_pic_marking_mode_flag,
            slice_qp_delta,
            disable_deblocking_filter_idc,
            slice_alpha_c0_offset_div2,
            slice_beta_offset_div2,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PictureId {
    pub frame_num: u32,
    pub pic_parameter_set_id: u8,
    pub idr_pic_id: Option<u32>,
    pub pic_order_cnt_lsb: Option<u32>,
    pub delta_pic_order_cnt: Option<[i32; 2]>,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
}

impl PictureId {
    pub fn from_slice_header(header: &SliceHeader, nal_type: NalUnitType, sps: &Sps) -> Self {
        let idr_pic_id = if nal_type == NalUnitType::IdrSlice {
            Some(header.idr_pic_id)
        } else {
            None
        };

        let pic_order_cnt_lsb = if sps.pic_order_cnt_type == 0 {
            Some(header.pic_order_cnt_lsb)
        } else {
            None
        };

        let delta_pic_order_cnt = if sps.pic_order_cnt_type == 1 {
            Some(header.delta_pic_order_cnt)
        } else {
            None
        };

        PictureId {
            frame_num: header.frame_num,
            pic_parameter_set_id: header.pic_parameter_set_id,
            idr_pic_id,
            pic_order_cnt_lsb,
            delta_pic_order_cnt,
            field_pic_flag: header.field_pic_flag,
            bottom_field_flag: header.bottom_field_flag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConfig;

    #[test]
    fn test_slice_type_conversion() {
        assert_eq!(SliceType::from_value(0), Some(SliceType::P));
        assert_eq!(SliceType::from_value(1), Some(SliceType::B));
        assert_eq!(SliceType::from_value(2), Some(SliceType::I));
        assert_eq!(SliceType::from_value(5), Some(SliceType::P));
        assert_eq!(SliceType::from_value(7), Some(SliceType::I));
    }

    #[test]
    fn idr_slice_header_encode_then_parse_round_trips() {
        let cfg = EncoderConfig::default();
        let sps = Sps::from_config(&cfg);
        let pps = Pps::from_config(&cfg);
        let pic_init_qp = pps.pic_init_qp_minus26 as i32 + 26;

        let header = SliceHeader::new(
            true,
            SliceType::I,
            0,
            0,
            0,
            0,
            cfg.init_qp,
            pic_init_qp,
            0,
            0,
            0,
        );

        let mut w = BitWriter::new(None);
        header.encode(&mut w, NalUnitType::IdrSlice, &sps, &pps).unwrap();
        w.rbsp_trailing_bits().unwrap();
        let bytes = w.into_bytes();

        let parsed = SliceHeader::parse(&bytes, NalUnitType::IdrSlice, &sps, &pps).unwrap();
        assert_eq!(parsed.slice_type, SliceType::I);
        assert_eq!(parsed.frame_num, 0);
        assert_eq!(parsed.slice_qp_delta, 0);
    }

    #[test]
    fn p_slice_header_encode_then_parse_round_trips() {
        let cfg = EncoderConfig::default();
        let sps = Sps::from_config(&cfg);
        let pps = Pps::from_config(&cfg);
        let pic_init_qp = pps.pic_init_qp_minus26 as i32 + 26;

        let header = SliceHeader::new(
            false,
            SliceType::P,
            0,
            1,
            0,
            4,
            cfg.init_qp + 2,
            pic_init_qp,
            0,
            0,
            0,
        );

        let mut w = BitWriter::new(None);
        header.encode(&mut w, NalUnitType::NonIdrSlice, &sps, &pps).unwrap();
        w.rbsp_trailing_bits().unwrap();
        let bytes = w.into_bytes();

        let parsed = SliceHeader::parse(&bytes, NalUnitType::NonIdrSlice, &sps, &pps).unwrap();
        assert_eq!(parsed.slice_type, SliceType::P);
        assert_eq!(parsed.frame_num, 1);
        assert_eq!(parsed.slice_qp_delta, 2);
        assert!(!parsed.adaptive_ref_pic_marking_mode_flag);
    }
}
