//! Picture Order Count derivation for modes 0, 1 and 2 (spec section 4.9),
//! plus the `frame_num` bookkeeping that rides alongside it in the slice
//! header.

use crate::config::PocType;
use crate::error::{EncError, Result};

#[derive(Debug, Clone)]
pub struct PocState {
    poc_type: PocType,
    max_frame_num: u32,
    frame_num: u32,
    prev_frame_num: u32,
    prev_frame_num_offset: i64,
    prev_poc_msb: i64,
    prev_poc_lsb: i64,
    /// Mode-2 specific: tracks whether the previous coded picture was a
    /// non-reference frame, since two in a row is an error under mode 2.
    prev_was_nonref: bool,
}

impl PocState {
    pub fn new(poc_type: PocType, log2_max_frame_num: u8) -> Self {
        PocState {
            poc_type,
            max_frame_num: 1 << (log2_max_frame_num as u32),
            frame_num: 0,
            prev_frame_num: 0,
            prev_frame_num_offset: 0,
            prev_poc_msb: 0,
            prev_poc_lsb: 0,
            prev_was_nonref: false,
        }
    }

    pub fn reset_on_idr(&mut self) {
        self.frame_num = 0;
        self.prev_frame_num = 0;
        self.prev_frame_num_offset = 0;
        self.prev_poc_msb = 0;
        self.prev_poc_lsb = 0;
        self.prev_was_nonref = false;
    }

    pub fn frame_num(&self) -> u32 {
        self.frame_num
    }

    /// Advances `frame_num` for the next picture; called once per coded,
    /// non-IDR frame after its slice header has been built.
    pub fn advance_frame_num(&mut self) {
        self.prev_frame_num = self.frame_num;
        self.frame_num = (self.frame_num + 1) % self.max_frame_num;
    }

    /// Derives `(pic_order_cnt_lsb_to_encode, computed_poc)` for the
    /// current picture. `is_idr` resets internal state first. `is_ref`
    /// matters only for mode 2's consecutive-nonref check.
    pub fn derive(&mut self, is_idr: bool, is_ref: bool) -> Result<(u32, i32)> {
        if is_idr {
            self.reset_on_idr();
        }
        let result = match self.poc_type {
            PocType::Mode0 {
                log2_max_poc_lsb_minus4,
            } => self.derive_mode0(is_idr, log2_max_poc_lsb_minus4),
            PocType::Mode1 {
                delta_always_zero,
                offset_for_non_ref_pic,
                offset_for_top_to_bottom,
                ref offsets_for_ref_frame,
            } => {
                let poc = derive_mode1(
                    self.frame_num,
                    self.max_frame_num,
                    &mut self.prev_frame_num_offset,
                    self.prev_frame_num,
                    is_idr,
                    is_ref,
                    delta_always_zero,
                    offset_for_non_ref_pic,
                    offset_for_top_to_bottom,
                    offsets_for_ref_frame,
                );
                Ok((0, poc))
            }
            PocType::Mode2 => {
                if !is_ref && self.prev_was_nonref {
                    return Err(EncError::ConsecutiveNonref);
                }
                self.prev_was_nonref = !is_ref;
                let poc = derive_mode2(self.frame_num, self.max_frame_num, &mut self.prev_frame_num_offset, self.prev_frame_num, is_idr);
                Ok((0, poc))
            }
        }?;
        Ok(result)
    }

    fn derive_mode0(&mut self, is_idr: bool, log2_max_poc_lsb_minus4: u8) -> Result<(u32, i32)> {
        let max_poc_lsb = 1i64 << (log2_max_poc_lsb_minus4 as u32 + 4);
        let poc_lsb = if is_idr { 0 } else { (self.prev_poc_lsb + 2) % max_poc_lsb };

        let poc_msb = if !is_idr && poc_lsb < self.prev_poc_lsb && (self.prev_poc_lsb - poc_lsb) >= max_poc_lsb / 2 {
            self.prev_poc_msb + max_poc_lsb
        } else if !is_idr && poc_lsb > self.prev_poc_lsb && (poc_lsb - self.prev_poc_lsb) > max_poc_lsb / 2 {
            self.prev_poc_msb - max_poc_lsb
        } else {
            self.prev_poc_msb
        };

        self.prev_poc_msb = poc_msb;
        self.prev_poc_lsb = poc_lsb;
        let poc = poc_msb + poc_lsb;
        Ok((poc_lsb as u32, poc as i32))
    }
}

#[allow(clippy::too_many_arguments)]
fn derive_mode1(
    frame_num: u32,
    max_frame_num: u32,
    prev_frame_num_offset: &mut i64,
    prev_frame_num: u32,
    is_idr: bool,
    is_ref: bool,
    delta_always_zero: bool,
    offset_for_non_ref_pic: i32,
    offset_for_top_to_bottom: i32,
    offsets_for_ref_frame: &[i32],
) -> i32 {
    if is_idr {
        *prev_frame_num_offset = 0;
    }
    let frame_num_offset = if is_idr {
        0
    } else if prev_frame_num > frame_num {
        *prev_frame_num_offset + max_frame_num as i64
    } else {
        *prev_frame_num_offset
    };
    *prev_frame_num_offset = frame_num_offset;

    let num_ref_frames_in_cycle = offsets_for_ref_frame.len().max(1) as i64;
    let abs_frame_num = if num_ref_frames_in_cycle != 0 {
        frame_num_offset + frame_num as i64
    } else {
        0
    };
    let abs_frame_num = if !is_ref && abs_frame_num > 0 { abs_frame_num - 1 } else { abs_frame_num };

    let mut expected_delta_per_poc_cycle = 0i64;
    for &o in offsets_for_ref_frame {
        expected_delta_per_poc_cycle += o as i64;
    }

    let mut expected_poc = 0i64;
    if abs_frame_num > 0 {
        let poc_cycle_cnt = (abs_frame_num - 1) / num_ref_frames_in_cycle;
        let frame_num_in_poc_cycle = (abs_frame_num - 1) % num_ref_frames_in_cycle;
        expected_poc = poc_cycle_cnt * expected_delta_per_poc_cycle;
        for i in 0..=frame_num_in_poc_cycle {
            if let Some(&o) = offsets_for_ref_frame.get(i as usize) {
                expected_poc += o as i64;
            }
        }
    }
    if !is_ref {
        expected_poc += offset_for_non_ref_pic as i64;
    }

    let top_field_order_cnt = expected_poc + if delta_always_zero { 0 } else { offset_for_top_to_bottom as i64 };
    top_field_order_cnt as i32
}

fn derive_mode2(frame_num: u32, max_frame_num: u32, prev_frame_num_offset: &mut i64, prev_frame_num: u32, is_idr: bool) -> i32 {
    if is_idr {
        *prev_frame_num_offset = 0;
        return 0;
    }
    let frame_num_offset = if prev_frame_num > frame_num {
        *prev_frame_num_offset + max_frame_num as i64
    } else {
        *prev_frame_num_offset
    };
    *prev_frame_num_offset = frame_num_offset;
    2 * (frame_num_offset + frame_num as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode0_idr_resets_to_zero() {
        let mut s = PocState::new(PocType::Mode0 { log2_max_poc_lsb_minus4: 2 }, 4);
        let (lsb, poc) = s.derive(true, true).unwrap();
        assert_eq!(lsb, 0);
        assert_eq!(poc, 0);
    }

    #[test]
    fn mode0_increments_by_two_per_reference_frame() {
        let mut s = PocState::new(PocType::Mode0 { log2_max_poc_lsb_minus4: 2 }, 4);
        s.derive(true, true).unwrap();
        s.advance_frame_num();
        let (_, poc1) = s.derive(false, true).unwrap();
        s.advance_frame_num();
        let (_, poc2) = s.derive(false, true).unwrap();
        assert_eq!(poc1, 2);
        assert_eq!(poc2, 4);
    }

    #[test]
    fn mode2_tracks_frame_num_directly() {
        let mut s = PocState::new(PocType::Mode2, 4);
        s.derive(true, true).unwrap();
        s.advance_frame_num();
        let (_, poc) = s.derive(false, true).unwrap();
        assert_eq!(poc, 2);
    }

    #[test]
    fn mode2_rejects_two_consecutive_nonref_frames() {
        let mut s = PocState::new(PocType::Mode2, 4);
        s.derive(true, false).unwrap();
        s.advance_frame_num();
        assert_eq!(s.derive(false, false), Err(EncError::ConsecutiveNonref));
    }

    #[test]
    fn frame_num_wraps_at_max() {
        let mut s = PocState::new(PocType::Mode2, 2);
        s.derive(true, true).unwrap();
        for _ in 0..4 {
            s.advance_frame_num();
        }
        assert_eq!(s.frame_num(), 0);
    }
}
