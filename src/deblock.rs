//! In-loop deblocking filter: boundary strength derivation and the
//! normal/strong luma and chroma filters (spec section 4.9). Runs after
//! reconstruction, before a picture is stored as a reference or emitted.

use crate::frame::Picture;
use crate::macroblock::{MacroblockGrid, MotionVector};

/// Per-picture knobs carried from the slice header (spec section 7.3.3):
/// `disable_deblocking_filter_idc` and the two offset-div2 fields.
#[derive(Debug, Clone, Copy)]
pub struct DeblockParams {
    pub disable_idc: u8,
    pub alpha_offset_div2: i8,
    pub beta_offset_div2: i8,
}

const ALPHA_TABLE: [u8; 52] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 4, 4, 5, 6, 7, 8, 9, 10, 12, 13, 15, 17, 20, 22, 25, 28, 32, 36, 40, 45, 50, 56, 63, 71, 80, 90, 101, 113,
    127, 144, 162, 182, 203, 226, 255, 255,
];

const BETA_TABLE: [u8; 52] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13, 13, 14, 14, 15, 15, 16, 16,
    17, 17, 18, 18,
];

const TC0_TABLE: [[u8; 3]; 52] = {
    let mut t = [[0u8; 3]; 52];
    // indices 0..=15 are all zero per the standard's table 8-18; populated
    // below for 16..=51.
    t[16] = [0, 0, 0];
    t[17] = [0, 0, 0];
    t[18] = [0, 0, 0];
    t[19] = [0, 0, 1];
    t[20] = [0, 0, 1];
    t[21] = [0, 0, 1];
    t[22] = [0, 0, 1];
    t[23] = [0, 1, 1];
    t[24] = [0, 1, 1];
    t[25] = [0, 1, 1];
    t[26] = [0, 1, 1];
    t[27] = [0, 1, 1];
    t[28] = [0, 1, 2];
    t[29] = [0, 1, 2];
    t[30] = [1, 1, 2];
    t[31] = [1, 1, 2];
    t[32] = [1, 1, 2];
    t[33] = [1, 1, 3];
    t[34] = [1, 2, 3];
    t[35] = [1, 2, 3];
    t[36] = [1, 2, 3];
    t[37] = [1, 2, 4];
    t[38] = [1, 2, 4];
    t[39] = [1, 3, 4];
    t[40] = [1, 3, 5];
    t[41] = [2, 3, 5];
    t[42] = [2, 4, 6];
    t[43] = [2, 4, 6];
    t[44] = [2, 4, 7];
    t[45] = [3, 5, 8];
    t[46] = [3, 5, 8];
    t[47] = [3, 6, 10];
    t[48] = [4, 6, 11];
    t[49] = [4, 7, 13];
    t[50] = [5, 8, 16];
    t[51] = [6, 10, 18];
    t
};

#[inline]
fn clip_pixel(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

fn index_a(qp_av: i32, offset: i8) -> usize {
    (qp_av + 2 * offset as i32).clamp(0, 51) as usize
}

/// Boundary strength between two 4x4 blocks straddling a vertical or
/// horizontal edge, per spec section 4.9's table: 4 across an MB boundary
/// when either side is intra, 3 within an MB when either side is intra, 2
/// when either block carries nonzero coefficients, 1 for differing
/// reference/MV, 0 otherwise.
pub fn boundary_strength(
    is_mb_edge: bool,
    p_is_intra: bool,
    q_is_intra: bool,
    p_nnz: u8,
    q_nnz: u8,
    p_ref: i8,
    q_ref: i8,
    p_mv: MotionVector,
    q_mv: MotionVector,
) -> u8 {
    if p_is_intra || q_is_intra {
        return if is_mb_edge { 4 } else { 3 };
    }
    if p_nnz > 0 || q_nnz > 0 {
        return 2;
    }
    if p_ref != q_ref {
        return 1;
    }
    if (p_mv.x - q_mv.x).unsigned_abs() >= 4 || (p_mv.y - q_mv.y).unsigned_abs() >= 4 {
        return 1;
    }
    0
}

/// Filters one 4-sample line straddling an edge in place: `line[0..4]` is
/// `p1 p0 q0 q1` (or the 6-sample strong-filter variant when `bs == 4`).
fn filter_luma_edge(line: &mut [u8], bs: u8, qp_av: i32, params: &DeblockParams) {
    if bs == 0 {
        return;
    }
    let alpha = ALPHA_TABLE[index_a(qp_av, params.alpha_offset_div2)] as i32;
    let beta = BETA_TABLE[index_a(qp_av, params.beta_offset_div2)] as i32;

    let p2 = line[0] as i32;
    let p1 = line[1] as i32;
    let p0 = line[2] as i32;
    let q0 = line[3] as i32;
    let q1 = line[4] as i32;
    let q2 = line[5] as i32;

    if (p0 - q0).abs() >= alpha || (p1 - p0).abs() >= beta || (q1 - q0).abs() >= beta {
        return;
    }

    if bs == 4 {
        let strong = (p2 - p0).abs() < beta && (p0 - q0).abs() < (alpha / 4 + 2);
        let strong_q = (q2 - q0).abs() < beta && (p0 - q0).abs() < (alpha / 4 + 2);

        let new_p0 = if strong {
            (p2 + 2 * p1 + 2 * p0 + 2 * q0 + q1 + 4) >> 3
        } else {
            (2 * p1 + p0 + q1 + 2) >> 2
        };
        let new_p1 = if strong { (p2 + p1 + p0 + q0 + 2) >> 2 } else { p1 };
        let new_p2 = if strong { (2 * line[0] as i32 + 3 * p2 + p1 + p0 + q0 + 4) >> 3 } else { p2 };

        let new_q0 = if strong_q {
            (q2 + 2 * q1 + 2 * q0 + 2 * p0 + p1 + 4) >> 3
        } else {
            (2 * q1 + q0 + p1 + 2) >> 2
        };
        let new_q1 = if strong_q { (q2 + q1 + q0 + p0 + 2) >> 2 } else { q1 };
        let new_q2 = if strong_q { (2 * line[5] as i32 + 3 * q2 + q1 + q0 + p0 + 4) >> 3 } else { q2 };

        line[0] = clip_pixel(new_p2);
        line[1] = clip_pixel(new_p1);
        line[2] = clip_pixel(new_p0);
        line[3] = clip_pixel(new_q0);
        line[4] = clip_pixel(new_q1);
        line[5] = clip_pixel(new_q2);
        return;
    }

    let tc0 = TC0_TABLE[index_a(qp_av, params.alpha_offset_div2)][(bs - 1) as usize] as i32;
    let ap = (p2 - p0).abs() < beta;
    let aq = (q2 - q0).abs() < beta;
    let tc = tc0 + ap as i32 + aq as i32;

    let delta = ((4 * (q0 - p0) + (p1 - q1) + 4) >> 3).clamp(-tc, tc);
    line[2] = clip_pixel(p0 + delta);
    line[3] = clip_pixel(q0 - delta);

    if ap {
        let delta_p1 = ((p2 + ((p0 + q0 + 1) >> 1) - 2 * p1) >> 1).clamp(-tc0, tc0);
        line[1] = clip_pixel(p1 + delta_p1);
    }
    if aq {
        let delta_q1 = ((q2 + ((p0 + q0 + 1) >> 1) - 2 * q1) >> 1).clamp(-tc0, tc0);
        line[4] = clip_pixel(q1 + delta_q1);
    }
}

fn filter_chroma_edge(line: &mut [u8], bs: u8, qp_av: i32, params: &DeblockParams) {
    if bs == 0 || bs == 4 {
        if bs == 4 {
            let p0 = line[1] as i32;
            let q0 = line[2] as i32;
            let p1 = line[0] as i32;
            let q1 = line[3] as i32;
            let alpha = ALPHA_TABLE[index_a(qp_av, params.alpha_offset_div2)] as i32;
            let beta = BETA_TABLE[index_a(qp_av, params.beta_offset_div2)] as i32;
            if (p0 - q0).abs() < alpha && (p1 - p0).abs() < beta && (q1 - q0).abs() < beta {
                line[1] = clip_pixel((2 * p1 + p0 + q1 + 2) >> 2);
                line[2] = clip_pixel((2 * q1 + q0 + p1 + 2) >> 2);
            }
        }
        return;
    }
    let alpha = ALPHA_TABLE[index_a(qp_av, params.alpha_offset_div2)] as i32;
    let beta = BETA_TABLE[index_a(qp_av, params.beta_offset_div2)] as i32;
    let p1 = line[0] as i32;
    let p0 = line[1] as i32;
    let q0 = line[2] as i32;
    let q1 = line[3] as i32;
    if (p0 - q0).abs() >= alpha || (p1 - p0).abs() >= beta || (q1 - q0).abs() >= beta {
        return;
    }
    let tc0 = TC0_TABLE[index_a(qp_av, params.alpha_offset_div2)][(bs - 1) as usize] as i32;
    let tc = tc0 + 1;
    let delta = ((4 * (q0 - p0) + (p1 - q1) + 4) >> 3).clamp(-tc, tc);
    line[1] = clip_pixel(p0 + delta);
    line[2] = clip_pixel(q0 - delta);
}

/// Runs the full-picture deblocking pass: vertical edges left-to-right
/// then horizontal edges top-to-bottom, within each macroblock in raster
/// order, per the standard's fixed filtering order.
pub fn deblock_picture(picture: &mut Picture, grid: &MacroblockGrid, params: &DeblockParams) {
    if params.disable_idc == 1 {
        return;
    }
    let mb_w = grid.mb_width;
    let mb_h = grid.mb_height;

    for mb_y in 0..mb_h {
        for mb_x in 0..mb_w {
            let mb = grid.get(mb_x, mb_y);
            let qp_av = mb.qpy as i32;
            let filter_left = mb_x > 0 && !(params.disable_idc == 2 && grid.different_slice(mb_x, mb_y, mb_x - 1, mb_y));
            let filter_top = mb_y > 0 && !(params.disable_idc == 2 && grid.different_slice(mb_x, mb_y, mb_x, mb_y - 1));

            for edge_x in 0..4 {
                if edge_x == 0 && !filter_left {
                    continue;
                }
                let bx = (mb_x * 16 + edge_x * 4) as isize;
                for row in 0..16 {
                    let by = (mb_y * 16 + row) as isize;
                    let row_block = row as usize / 4;
                    let bs = if edge_x == 0 {
                        let left = grid.get(mb_x - 1, mb_y);
                        let p_nnz = left.luma_nnz_at(3, row_block);
                        let q_nnz = mb.luma_nnz_at(0, row_block);
                        boundary_strength(true, left.is_intra, mb.is_intra, p_nnz, q_nnz, left.ref_idx[0], mb.ref_idx[0], left.mv[0], mb.mv[0])
                    } else {
                        let p_nnz = mb.luma_nnz_at(edge_x as usize - 1, row_block);
                        let q_nnz = mb.luma_nnz_at(edge_x as usize, row_block);
                        boundary_strength(false, mb.is_intra, mb.is_intra, p_nnz, q_nnz, mb.ref_idx[0], mb.ref_idx[0], mb.mv[0], mb.mv[0])
                    };
                    let mut line = [
                        picture.luma.get(bx - 3, by),
                        picture.luma.get(bx - 2, by),
                        picture.luma.get(bx - 1, by),
                        picture.luma.get(bx, by),
                        picture.luma.get(bx + 1, by),
                        picture.luma.get(bx + 2, by),
                    ];
                    filter_luma_edge(&mut line, bs, qp_av, params);
                    for (i, v) in line.iter().enumerate() {
                        picture.luma.set(bx - 3 + i as isize, by, *v);
                    }
                }
            }

            for edge_y in 0..4 {
                if edge_y == 0 && !filter_top {
                    continue;
                }
                let by = (mb_y * 16 + edge_y * 4) as isize;
                for col in 0..16 {
                    let bx = (mb_x * 16 + col) as isize;
                    let col_block = col as usize / 4;
                    let bs = if edge_y == 0 {
                        let top = grid.get(mb_x, mb_y - 1);
                        let p_nnz = top.luma_nnz_at(col_block, 3);
                        let q_nnz = mb.luma_nnz_at(col_block, 0);
                        boundary_strength(true, top.is_intra, mb.is_intra, p_nnz, q_nnz, top.ref_idx[0], mb.ref_idx[0], top.mv[0], mb.mv[0])
                    } else {
                        let p_nnz = mb.luma_nnz_at(col_block, edge_y as usize - 1);
                        let q_nnz = mb.luma_nnz_at(col_block, edge_y as usize);
                        boundary_strength(false, mb.is_intra, mb.is_intra, p_nnz, q_nnz, mb.ref_idx[0], mb.ref_idx[0], mb.mv[0], mb.mv[0])
                    };
                    let mut line = [
                        picture.luma.get(bx, by - 3),
                        picture.luma.get(bx, by - 2),
                        picture.luma.get(bx, by - 1),
                        picture.luma.get(bx, by),
                        picture.luma.get(bx, by + 1),
                        picture.luma.get(bx, by + 2),
                    ];
                    filter_luma_edge(&mut line, bs, qp_av, params);
                    for (i, v) in line.iter().enumerate() {
                        picture.luma.set(bx, by - 3 + i as isize, *v);
                    }
                }
            }

            for plane in [&mut picture.cb, &mut picture.cr] {
                if filter_left {
                    let bx = (mb_x * 8) as isize;
                    for row in 0..8 {
                        let by = (mb_y * 8 + row) as isize;
                        let mut line = [
                            plane.get(bx - 2, by),
                            plane.get(bx - 1, by),
                            plane.get(bx, by),
                            plane.get(bx + 1, by),
                        ];
                        filter_chroma_edge(&mut line, 3, qp_av, params);
                        for (i, v) in line.iter().enumerate() {
                            plane.set(bx - 2 + i as isize, by, *v);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_strength_is_four_at_mb_edge_with_intra_neighbor() {
        let bs = boundary_strength(true, true, false, 0, 0, 0, 0, MotionVector::ZERO, MotionVector::ZERO);
        assert_eq!(bs, 4);
    }

    #[test]
    fn boundary_strength_is_zero_for_identical_inter_neighbors() {
        let bs = boundary_strength(false, false, false, 0, 0, 0, 0, MotionVector::ZERO, MotionVector::ZERO);
        assert_eq!(bs, 0);
    }

    #[test]
    fn flat_edge_is_left_unchanged_by_filter() {
        let mut line = [100u8; 6];
        let params = DeblockParams {
            disable_idc: 0,
            alpha_offset_div2: 0,
            beta_offset_div2: 0,
        };
        filter_luma_edge(&mut line, 2, 28, &params);
        assert_eq!(line, [100u8; 6]);
    }

    #[test]
    fn disable_idc_one_skips_filtering_entirely() {
        let bs = boundary_strength(true, false, false, 1, 0, 0, 0, MotionVector::ZERO, MotionVector::ZERO);
        assert_eq!(bs, 2);
    }
}
