//! CAVLC entropy coding: `coeff_token`, level, `total_zeros`, `run_before`
//! and the coded-block-pattern codeNum mapping (Tables 9-4 through 9-10).
//! The tables themselves are transcribed bit-for-bit from the original's
//! `vlc_encode.cpp`/`residual.cpp`; only the calling convention has
//! changed (writes go through `BitWriter`, levels/runs are passed as
//! slices instead of member arrays of the macroblock encoder object).

use crate::bitwriter::BitWriter;
use crate::eg::write_ue;
use crate::error::Result;

/// Table 9-4: `codeNum` for `coded_block_pattern`, indexed `[CBP][0]` for
/// intra-4x4 macroblocks and `[CBP][1]` for every other mb_type.
pub const MAP_CBP_TO_CODE: [[u8; 2]; 48] = [
    [3, 0], [29, 2], [30, 3], [17, 7], [31, 4], [18, 8], [37, 17], [8, 13], [32, 5], [38, 18], [19, 9], [9, 14],
    [20, 10], [10, 15], [11, 16], [2, 11], [16, 1], [33, 32], [34, 33], [21, 36], [35, 34], [22, 37], [39, 44], [4, 40],
    [36, 35], [40, 45], [23, 38], [5, 41], [24, 39], [6, 42], [7, 43], [1, 19], [41, 6], [42, 24], [43, 25], [25, 20],
    [44, 26], [26, 21], [46, 46], [12, 28], [45, 27], [47, 47], [27, 22], [13, 29], [28, 23], [14, 30], [15, 31], [0, 12],
];

pub fn write_cbp(w: &mut BitWriter, cbp: u8, is_intra4x4: bool) -> Result<()> {
    let code = MAP_CBP_TO_CODE[cbp as usize][if is_intra4x4 { 0 } else { 1 }];
    write_ue(w, code as u32)
}

/// Table 9-5: `coeff_token`, selected by the nC bucket (`nC<2`, `2<=nC<4`,
/// `4<=nC<8`); `[trailing_ones][total_coeff] = (len, code)`.
const COEFF_TOKEN: [[[(u8, u16); 17]; 4]; 3] = [
    [
        [(1, 1), (6, 5), (8, 7), (9, 7), (10, 7), (11, 7), (13, 15), (13, 11), (13, 8), (14, 15), (14, 11), (15, 15), (15, 11), (16, 15), (16, 11), (16, 7), (16, 4)],
        [(0, 0), (2, 1), (6, 4), (8, 6), (9, 6), (10, 6), (11, 6), (13, 14), (13, 10), (14, 14), (14, 10), (15, 14), (15, 10), (15, 1), (16, 14), (16, 10), (16, 6)],
        [(0, 0), (0, 0), (3, 1), (7, 5), (8, 5), (9, 5), (10, 5), (11, 5), (13, 13), (13, 9), (14, 13), (14, 9), (15, 13), (15, 9), (16, 13), (16, 9), (16, 5)],
        [(0, 0), (0, 0), (0, 0), (5, 3), (6, 3), (7, 4), (8, 4), (9, 4), (10, 4), (11, 4), (13, 12), (14, 12), (14, 8), (15, 12), (15, 8), (16, 12), (16, 8)],
    ],
    [
        [(2, 3), (6, 11), (6, 7), (7, 7), (8, 7), (8, 4), (9, 7), (11, 15), (11, 11), (12, 15), (12, 11), (12, 8), (13, 15), (13, 11), (13, 7), (14, 9), (14, 7)],
        [(0, 0), (2, 2), (5, 7), (6, 10), (6, 6), (7, 6), (8, 6), (9, 6), (11, 14), (11, 10), (12, 14), (12, 10), (13, 14), (13, 10), (14, 11), (14, 8), (14, 6)],
        [(0, 0), (0, 0), (3, 3), (6, 9), (6, 5), (7, 5), (8, 5), (9, 5), (11, 13), (11, 9), (12, 13), (12, 9), (13, 13), (13, 9), (13, 6), (14, 10), (14, 5)],
        [(0, 0), (0, 0), (0, 0), (4, 5), (4, 4), (5, 6), (6, 8), (6, 4), (7, 4), (9, 4), (11, 12), (11, 8), (12, 12), (13, 12), (13, 8), (13, 1), (14, 4)],
    ],
    [
        [(4, 15), (6, 15), (6, 11), (6, 8), (7, 15), (7, 11), (7, 9), (7, 8), (8, 15), (8, 11), (9, 15), (9, 11), (9, 8), (10, 13), (10, 9), (10, 5), (10, 1)],
        [(0, 0), (4, 14), (5, 15), (5, 12), (5, 10), (5, 8), (6, 14), (6, 10), (7, 14), (8, 14), (8, 10), (9, 14), (9, 10), (9, 7), (10, 12), (10, 8), (10, 4)],
        [(0, 0), (0, 0), (4, 13), (5, 14), (5, 11), (5, 9), (6, 13), (6, 9), (7, 13), (7, 10), (8, 13), (8, 9), (9, 13), (9, 9), (10, 11), (10, 7), (10, 3)],
        [(0, 0), (0, 0), (0, 0), (4, 12), (4, 11), (4, 10), (4, 9), (4, 8), (5, 13), (6, 12), (7, 12), (8, 12), (8, 8), (9, 12), (10, 10), (10, 6), (10, 2)],
    ],
];

/// Table 9-5, chroma DC variant; `[trailing_ones][total_coeff] = (len, code)`.
const COEFF_TOKEN_CHROMA_DC: [[(u8, u16); 5]; 4] = [
    [(2, 1), (6, 7), (6, 4), (6, 3), (6, 2)],
    [(0, 0), (1, 1), (6, 6), (7, 3), (8, 3)],
    [(0, 0), (0, 0), (3, 1), (7, 2), (8, 2)],
    [(0, 0), (0, 0), (0, 0), (6, 5), (7, 0)],
];

pub fn write_coeff_token(w: &mut BitWriter, trailing_ones: usize, total_coeff: usize, nc: i32) -> Result<()> {
    let (len, code) = if nc >= 8 {
        let c = if total_coeff > 0 {
            (((total_coeff - 1) as u32) << 2) | trailing_ones as u32
        } else {
            3
        };
        (6u8, c as u16)
    } else {
        let vlcnum = if nc < 2 { 0 } else if nc < 4 { 1 } else { 2 };
        COEFF_TOKEN[vlcnum][trailing_ones][total_coeff]
    };
    w.write_bits(len as u32, code as u32)
}

pub fn write_coeff_token_chroma_dc(w: &mut BitWriter, trailing_ones: usize, total_coeff: usize) -> Result<()> {
    let (len, code) = COEFF_TOKEN_CHROMA_DC[trailing_ones][total_coeff];
    w.write_bits(len as u32, code as u32)
}

/// Tables 9-7/9-8: `total_zeros` for 4x4 blocks, `[total_coeff - 1][total_zeros]`.
const LEN_TOTAL_ZEROS: [&[u8]; 15] = [
    &[1, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 9],
    &[3, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 6, 6, 6, 6],
    &[4, 3, 3, 3, 4, 4, 3, 3, 4, 5, 5, 6, 5, 6],
    &[5, 3, 4, 4, 3, 3, 3, 4, 3, 4, 5, 5, 5],
    &[4, 4, 4, 3, 3, 3, 3, 3, 4, 5, 4, 5],
    &[6, 5, 3, 3, 3, 3, 3, 3, 4, 3, 6],
    &[6, 5, 3, 3, 3, 2, 3, 4, 3, 6],
    &[6, 4, 5, 3, 2, 2, 3, 3, 6],
    &[6, 6, 4, 2, 2, 3, 2, 5],
    &[5, 5, 3, 2, 2, 2, 4],
    &[4, 4, 3, 3, 1, 3],
    &[4, 4, 2, 1, 3],
    &[3, 3, 1, 2],
    &[2, 2, 1],
    &[1, 1],
];

const COD_TOTAL_ZEROS: [&[u8]; 15] = [
    &[1, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 1],
    &[7, 6, 5, 4, 3, 5, 4, 3, 2, 3, 2, 3, 2, 1, 0],
    &[5, 7, 6, 5, 4, 3, 4, 3, 2, 3, 2, 1, 1, 0],
    &[3, 7, 5, 4, 6, 5, 4, 3, 3, 2, 2, 1, 0],
    &[5, 4, 3, 7, 6, 5, 4, 3, 2, 1, 1, 0],
    &[1, 1, 7, 6, 5, 4, 3, 2, 1, 1, 0],
    &[1, 1, 5, 4, 3, 3, 2, 1, 1, 0],
    &[1, 1, 1, 3, 3, 2, 2, 1, 0],
    &[1, 0, 1, 3, 2, 1, 1, 1],
    &[1, 0, 1, 3, 2, 1, 1],
    &[0, 1, 1, 2, 1, 3],
    &[0, 1, 1, 1, 1],
    &[0, 1, 1, 1],
    &[0, 1, 1],
    &[0, 1],
];

pub fn write_total_zeros(w: &mut BitWriter, total_zeros: usize, total_coeff: usize) -> Result<()> {
    let len = LEN_TOTAL_ZEROS[total_coeff - 1][total_zeros];
    let code = COD_TOTAL_ZEROS[total_coeff - 1][total_zeros];
    w.write_bits(len as u32, code as u32)
}

/// Table 9-9: chroma DC `total_zeros`, `[total_coeff - 1][total_zeros]`.
const LEN_TOTAL_ZEROS_CHROMA_DC: [[u8; 4]; 3] = [[1, 2, 3, 3], [1, 2, 2, 0], [1, 1, 0, 0]];
const COD_TOTAL_ZEROS_CHROMA_DC: [[u8; 4]; 3] = [[1, 1, 1, 0], [1, 1, 0, 0], [1, 0, 0, 0]];

pub fn write_total_zeros_chroma_dc(w: &mut BitWriter, total_zeros: usize, total_coeff: usize) -> Result<()> {
    let len = LEN_TOTAL_ZEROS_CHROMA_DC[total_coeff - 1][total_zeros];
    let code = COD_TOTAL_ZEROS_CHROMA_DC[total_coeff - 1][total_zeros];
    w.write_bits(len as u32, code as u32)
}

/// Table 9-10: `run_before`, `[min(zeros_left, 7) - 1][run_before]`.
const LEN_RUN_BEFORE: [&[u8]; 7] = [
    &[1, 1],
    &[1, 2, 2],
    &[2, 2, 2, 2],
    &[2, 2, 2, 3, 3],
    &[2, 2, 3, 3, 3, 3],
    &[2, 3, 3, 3, 3, 3, 3],
    &[3, 3, 3, 3, 3, 3, 3, 4, 5, 6, 7, 8, 9, 10, 11],
];
const COD_RUN_BEFORE: [&[u8]; 7] = [
    &[1, 0],
    &[1, 1, 0],
    &[3, 2, 1, 0],
    &[3, 2, 1, 1, 0],
    &[3, 2, 3, 2, 1, 0],
    &[3, 0, 1, 3, 2, 5, 4],
    &[7, 6, 5, 4, 3, 2, 1, 1, 1, 1, 1, 1, 1, 1, 1],
];

pub fn write_run_before(w: &mut BitWriter, run_before: usize, zeros_left: usize) -> Result<()> {
    let idx = zeros_left.min(7) - 1;
    let len = LEN_RUN_BEFORE[idx][run_before];
    let code = COD_RUN_BEFORE[idx][run_before];
    w.write_bits(len as u32, code as u32)
}

/// One already-scanned 4x4 (or 2x2/4-coefficient chroma DC) residual block:
/// `levels[0..total_coeff]` and `runs[0..total_coeff]` in reverse zig-zag
/// order (highest-frequency nonzero coefficient first), the layout the
/// original's `level[]`/`run[]` per-block arrays use.
#[derive(Debug, Clone, Default)]
pub struct ScannedBlock {
    pub levels: Vec<i32>,
    pub runs: Vec<i32>,
    pub total_coeff: usize,
}

impl ScannedBlock {
    fn trailing_ones_and_zeros_left(&self) -> (usize, usize) {
        let mut trailing_ones = 0;
        let mut zeros_left = 0;
        let mut nc_trailing = true;
        for i in (0..self.total_coeff).rev() {
            zeros_left += self.runs[i] as usize;
            if nc_trailing && (self.levels[i] == 1 || self.levels[i] == -1) {
                trailing_ones += 1;
            } else {
                nc_trailing = false;
            }
        }
        (trailing_ones.min(3), zeros_left)
    }
}

const INC_VLC: [i32; 7] = [0, 3, 6, 12, 24, 48, 32768];

fn write_level(w: &mut BitWriter, value: i32, vlcnum: i32) -> Result<()> {
    let sign = if value < 0 { 1u32 } else { 0 };
    let value = value.unsigned_abs() as i64;

    if vlcnum == 0 {
        if value < 8 {
            w.write_bits((value * 2 + sign as i64 - 1) as u32, 1)
        } else if value < 16 {
            w.write_bits(14 + 1 + 4, (1u32 << 4) | (((value - 8) as u32) << 1) | sign)
        } else {
            w.write_bits(14 + 2 + 12, (1u32 << 12) | (((value - 16) as u32) << 1) | sign)
        }
    } else {
        let shift = vlcnum - 1;
        let escape = (15i64 << shift) + 1;
        let num_prefix = (value - 1) >> shift;
        let sufmask = !(u32::MAX << shift);
        let suffix = ((value - 1) & (sufmask as i64)) as u32;
        if value < escape {
            w.write_bits((num_prefix as u32) + vlcnum as u32 + 1, (1u32 << (shift + 1)) | (suffix << 1) | sign)
        } else {
            w.write_bits(28, (1u32 << 12) | (((value - escape) as u32) << 1) | sign)
        }
    }
}

/// Which `coeff_token`/`total_zeros` table family a block uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Luma (or I16 AC/DC) 4x4 block; `nc` is the predicted neighbor context.
    Luma4x4 { nc: i32 },
    /// Chroma AC 4x4 block; `nc` is the chroma neighbor context.
    ChromaAc4x4 { nc: i32 },
    /// Chroma DC 2x2 block (4:2:0 only, as this core always runs).
    ChromaDc,
}

/// Writes `residual_block_cavlc()` for one block, mirroring
/// `enc_residual_block`: coeff_token, trailing-ones signs, levels (VLC0/1/2
/// with the standard's escalation and escape rule), total_zeros, then
/// run_before for every nonzero but the last.
pub fn write_residual_block(w: &mut BitWriter, block: &ScannedBlock, max_num_coeff: usize, kind: BlockKind) -> Result<()> {
    let (trailing_ones, mut zeros_left) = block.trailing_ones_and_zeros_left();
    let total_coeff = block.total_coeff;

    match kind {
        BlockKind::Luma4x4 { nc } | BlockKind::ChromaAc4x4 { nc } => {
            write_coeff_token(w, trailing_ones, total_coeff, nc)?;
        }
        BlockKind::ChromaDc => {
            write_coeff_token_chroma_dc(w, trailing_ones, total_coeff)?;
        }
    }

    if total_coeff == 0 {
        return Ok(());
    }

    if trailing_ones > 0 {
        let mut sign_bits: u32 = 0;
        for i in (total_coeff - trailing_ones..total_coeff).rev() {
            sign_bits <<= 1;
            sign_bits |= (block.levels[i] < 0) as u32;
        }
        w.write_bits(trailing_ones as u32, sign_bits)?;
    }

    let mut level_two_or_higher = !(total_coeff > 3 && trailing_ones == 3);
    let mut vlcnum = if total_coeff > 10 && trailing_ones < 3 { 1 } else { 0 };

    for i in (0..total_coeff - trailing_ones).rev() {
        let mut value = block.levels[i];
        let absvalue = value.unsigned_abs() as i32;
        if level_two_or_higher {
            value += if value > 0 { -1 } else { 1 };
            level_two_or_higher = false;
        }
        write_level(w, value, vlcnum)?;

        if absvalue > INC_VLC[vlcnum as usize] {
            vlcnum += 1;
        }
        if i == total_coeff - trailing_ones - 1 && absvalue > 3 {
            vlcnum = 2;
        }
    }

    if total_coeff < max_num_coeff {
        match kind {
            BlockKind::ChromaDc => write_total_zeros_chroma_dc(w, zeros_left, total_coeff)?,
            _ => write_total_zeros(w, zeros_left, total_coeff)?,
        }
    } else {
        zeros_left = 0;
    }

    for i in (1..total_coeff).rev() {
        if zeros_left > 0 {
            write_run_before(w, block.runs[i] as usize, zeros_left)?;
        }
        zeros_left -= block.runs[i] as usize;
    }

    Ok(())
}

/// Predicts the `nC` context from the left/top 4x4 neighbors' nonzero
/// counts (spec section 4.7): unavailable on both sides -> 0; one side
/// available -> that side's count; both available -> `(left+top+1)>>1`.
pub fn predict_nc(left: Option<u8>, top: Option<u8>) -> i32 {
    match (left, top) {
        (None, None) => 0,
        (Some(l), None) => l as i32,
        (None, Some(t)) => t as i32,
        (Some(l), Some(t)) => ((l as i32) + (t as i32) + 1) >> 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_block_writes_only_coeff_token() {
        let block = ScannedBlock::default();
        let mut w = BitWriter::new(None);
        write_residual_block(&mut w, &block, 16, BlockKind::Luma4x4 { nc: 0 }).unwrap();
        w.rbsp_trailing_bits().unwrap();
        // coeff_token(0,0) with nC<2 is (1,1): a single set bit.
        assert_eq!(w.as_bytes()[0] >> 7, 1);
    }

    #[test]
    fn single_trailing_one_block_round_trips_length() {
        let block = ScannedBlock {
            levels: vec![1],
            runs: vec![0],
            total_coeff: 1,
        };
        let mut w = BitWriter::new(None);
        write_residual_block(&mut w, &block, 16, BlockKind::Luma4x4 { nc: 0 }).unwrap();
        // coeff_token(1,1,nC<2) = (6,5) then 1 sign bit = 7 bits total.
        assert_eq!(w.bit_position(), 7);
    }

    #[test]
    fn predict_nc_matches_availability_rules() {
        assert_eq!(predict_nc(None, None), 0);
        assert_eq!(predict_nc(Some(4), None), 4);
        assert_eq!(predict_nc(None, Some(2)), 2);
        assert_eq!(predict_nc(Some(3), Some(2)), 3);
    }

    #[test]
    fn cbp_mapping_matches_table_for_full_cbp() {
        assert_eq!(MAP_CBP_TO_CODE[47], [15, 31]);
        assert_eq!(MAP_CBP_TO_CODE[0], [3, 0]);
    }
}
