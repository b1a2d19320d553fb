//! Per-macroblock slice encoding: combines intra search, motion search,
//! transform/quantization and CAVLC residual coding into the mb_type /
//! prediction-mode / coded_block_pattern / residual syntax of
//! `slice_data()` (spec section 4.8). This core's `Analyzing_Frame` and
//! `Encoding_Frame` states collapse into a single per-MB pass here rather
//! than two separate buffers of decisions, since every decision is local
//! to one macroblock and its already-reconstructed neighbors.

use crate::bitwriter::BitWriter;
use crate::cavlc::{self, BlockKind, ScannedBlock};
use crate::eg::{write_se, write_ue};
use crate::error::Result;
use crate::frame::Picture;
use crate::intra::{self, NeighborSamples};
use crate::macroblock::{ChromaIntraMode, Intra16Mode, Intra4Mode, Macroblock, MacroblockGrid, MbMode, MotionVector};
use crate::motion_comp::{predict_chroma_block, predict_luma_block};
use crate::motion_est::{predicted_mv, search_motion, SearchParams};
use crate::pps::Pps;
use crate::slice::{SliceHeader, SliceType};
use crate::sps::Sps;
use crate::transform::{self, Block4x4};

const ZIGZAG: [(usize, usize); 16] = [
    (0, 0), (0, 1), (1, 0), (2, 0), (1, 1), (0, 2), (0, 3), (1, 2),
    (2, 1), (3, 0), (3, 1), (2, 2), (1, 3), (2, 3), (3, 2), (3, 3),
];

fn zigzag_scan(block: &Block4x4) -> [i32; 16] {
    let mut out = [0i32; 16];
    for (i, &(r, c)) in ZIGZAG.iter().enumerate() {
        out[i] = block[r][c];
    }
    out
}

fn zigzag_unscan(coeffs: &[i32]) -> Block4x4 {
    let mut out = [[0i32; 4]; 4];
    for (i, &(r, c)) in ZIGZAG.iter().enumerate() {
        if i < coeffs.len() {
            out[r][c] = coeffs[i];
        }
    }
    out
}

/// Turns a forward-zigzag coefficient list into the `(levels, runs)` pairs
/// CAVLC expects: nonzero coefficients in scan order together with the
/// zero run preceding each.
fn scan_coeffs(coeffs: &[i32]) -> ScannedBlock {
    let mut levels = Vec::new();
    let mut runs = Vec::new();
    let mut zero_run = 0i32;
    for &c in coeffs {
        if c == 0 {
            zero_run += 1;
        } else {
            levels.push(c);
            runs.push(zero_run);
            zero_run = 0;
        }
    }
    let total_coeff = levels.len();
    ScannedBlock { levels, runs, total_coeff }
}

#[inline]
fn sample_or_default(plane: &crate::frame::Plane, x: isize, y: isize) -> u8 {
    if x < 0 || y < 0 {
        128
    } else {
        plane.get(x, y)
    }
}

/// Gathers an `NxN` (16 for I16/inter prediction sizing, 8 for chroma)
/// neighborhood from the plane's already-reconstructed samples.
fn gather_block_neighbors(plane: &crate::frame::Plane, origin_x: isize, origin_y: isize, size: usize) -> NeighborSamples {
    let top_available = origin_y > 0;
    let left_available = origin_x > 0;
    let corner_available = top_available && left_available;

    let top: Vec<u8> = (0..size as isize).map(|i| sample_or_default(plane, origin_x + i, origin_y - 1)).collect();
    let left: Vec<u8> = (0..size as isize).map(|i| sample_or_default(plane, origin_x - 1, origin_y + i)).collect();
    let corner = sample_or_default(plane, origin_x - 1, origin_y - 1);

    NeighborSamples {
        top,
        left,
        corner,
        top_available,
        left_available,
        corner_available,
        top_right: Vec::new(),
    }
}

/// Gathers the 4x4 neighborhood for one I4 block, including the
/// top-right extension used by diagonal/vertical-left modes; when the
/// macroblock to the top-right has not yet been reconstructed, the last
/// available top sample is replicated instead (a documented
/// simplification of the standard's full block-availability derivation).
fn gather_i4_neighbors(plane: &crate::frame::Plane, bx: isize, by: isize, top_right_available: bool) -> NeighborSamples {
    let top_available = by > 0;
    let left_available = bx > 0;
    let corner_available = top_available && left_available;

    let mut top: Vec<u8> = (0..8isize)
        .map(|i| {
            if i < 4 || top_right_available {
                sample_or_default(plane, bx + i, by - 1)
            } else {
                sample_or_default(plane, bx + 3, by - 1)
            }
        })
        .collect();
    if !top_available {
        top = vec![128; 8];
    }
    let left: Vec<u8> = (0..4isize).map(|i| sample_or_default(plane, bx - 1, by + i)).collect();
    let corner = sample_or_default(plane, bx - 1, by - 1);

    NeighborSamples {
        top,
        left,
        corner,
        top_available,
        left_available,
        corner_available,
        top_right: Vec::new(),
    }
}

fn extract_block(src: &[Vec<i32>], bx: usize, by: usize) -> Block4x4 {
    let mut out = [[0i32; 4]; 4];
    for y in 0..4 {
        for x in 0..4 {
            out[y][x] = src[by + y][bx + x];
        }
    }
    out
}

fn residual_block(src: &Block4x4, pred: &[[u8; 4]; 4]) -> Block4x4 {
    let mut out = [[0i32; 4]; 4];
    for y in 0..4 {
        for x in 0..4 {
            out[y][x] = src[y][x] - pred[y][x] as i32;
        }
    }
    out
}

/// One encoded 4x4 block's surviving state: quantized levels (for CAVLC),
/// dequantized residual (for reconstruction) and nonzero count. `dc_raw`
/// is the pre-quantization forward-transform DC coefficient, needed
/// separately by I16 macroblocks which route DC through a Hadamard
/// transform instead of coding it in this block's own residual.
struct CodedBlock {
    levels_zigzag: [i32; 16],
    dequantized: Block4x4,
    nnz: u8,
    dc_raw: i32,
    /// Coefficient cost (spec section 4.4), used by the coded-block-pattern
    /// decision to cull near-empty 8x8 sub-blocks and chroma AC groups.
    cost: i32,
}

fn encode_residual_4x4(residual: &Block4x4, qp: u8, is_intra: bool, skip_dc: bool) -> CodedBlock {
    let forward = transform::forward_transform(residual);
    let dc_raw = forward[0][0];
    let mut levels = transform::quantize(&forward, qp, is_intra);
    if skip_dc {
        levels[0][0] = 0;
    }
    let dequant = transform::dequantize(&levels, qp);
    let inverse = transform::inverse_transform(&dequant);
    let zz = zigzag_scan(&levels);
    let nnz = zz.iter().filter(|&&v| v != 0).count() as u8;
    let cost = transform::coeff_cost(&levels);
    CodedBlock {
        levels_zigzag: zz,
        dequantized: inverse,
        nnz,
        dc_raw,
        cost,
    }
}

/// Context shared across every macroblock in one slice.
pub struct SliceEncodeContext<'a> {
    pub sps: &'a Sps,
    pub pps: &'a Pps,
    pub header: &'a SliceHeader,
    pub reference: Option<&'a Picture>,
    pub search_params: SearchParams,
    pub qp: u8,
    /// Per-MB "intra search required" flags from the encoder's scene-change
    /// analysis pass and raster-scan intra-refresh window (spec sections
    /// 4.3/4.4), indexed by `mb_addr`.
    pub force_intra: &'a [bool],
}

/// Encodes `slice_data()` for every macroblock from `first_mb_in_slice`
/// to the end of the picture, writing syntax to `w` and filling in
/// `recon`'s reconstructed samples plus `grid`'s per-MB metadata (used
/// afterward by the deblocking filter).
pub fn encode_slice_data(w: &mut BitWriter, ctx: &SliceEncodeContext, input: &Picture, recon: &mut Picture, grid: &mut MacroblockGrid) -> Result<()> {
    let mb_width = grid.mb_width;
    let mb_height = grid.mb_height;
    let total_mbs = mb_width * mb_height;
    let is_i_slice = ctx.header.slice_type == SliceType::I;

    let mut skip_run = 0u32;
    let mut prev_qp = ctx.qp as i32;

    for mb_addr in ctx.header.first_mb_in_slice..total_mbs {
        let mb_x = mb_addr % mb_width;
        let mb_y = mb_addr / mb_width;
        let origin_x = (mb_x * 16) as isize;
        let origin_y = (mb_y * 16) as isize;

        let luma_src: Vec<Vec<i32>> = (0..16).map(|y| (0..16).map(|x| input.luma.get(origin_x + x, origin_y + y) as i32).collect()).collect();

        let (skip, mode_decision) = if is_i_slice {
            (false, decide_intra_mb(recon, input, &luma_src, origin_x, origin_y, ctx.qp, ctx.pps.constrained_intra_pred_flag))
        } else {
            let forced = ctx.force_intra.get(mb_addr as usize).copied().unwrap_or(false);
            decide_inter_or_intra_mb(recon, ctx, input, &luma_src, origin_x, origin_y, mb_x as isize, mb_y as isize, grid, forced)
        };

        if skip {
            skip_run += 1;
            let mb = grid.get_mut(mb_x, mb_y);
            *mb = Macroblock::new(mb_addr, 0);
            mb.mode = MbMode::Skip;
            mb.is_intra = false;
            mb.qpy = prev_qp as i8;
            reconstruct_skip_mb(ctx, recon, origin_x, origin_y, mb);
            continue;
        }

        if skip_run > 0 {
            write_ue(w, skip_run)?;
            skip_run = 0;
        }

        let mb = grid.get_mut(mb_x, mb_y);
        *mb = mode_decision;

        if mb.mode == MbMode::IntraPcm {
            write_mb_header(w, ctx, mb, is_i_slice)?;
            write_pcm_samples(w, recon, input, origin_x, origin_y, mb)?;
            // I_PCM carries no mb_qp_delta; the standard fixes QPY to 0 for
            // the next MB's delta prediction.
            prev_qp = 0;
            continue;
        }

        let residual = analyze_and_reconstruct_mb(ctx, recon, origin_x, origin_y, mb, &luma_src, input);

        write_mb_header(w, ctx, mb, is_i_slice)?;

        let mb_qp_delta = mb.qpy as i32 - prev_qp;
        write_se(w, mb_qp_delta)?;
        prev_qp = mb.qpy as i32;

        write_residual(w, mb, &residual)?;
    }

    if skip_run > 0 {
        write_ue(w, skip_run)?;
    }

    Ok(())
}

fn reconstruct_skip_mb(ctx: &SliceEncodeContext, recon: &mut Picture, origin_x: isize, origin_y: isize, mb: &Macroblock) {
    let reference = match ctx.reference {
        Some(r) => r,
        None => return,
    };
    let pred = predict_luma_block(&reference.luma, origin_x, origin_y, MotionVector::ZERO, 16, 16);
    for y in 0..16 {
        for x in 0..16 {
            recon.luma.set(origin_x + x as isize, origin_y + y as isize, pred[y][x]);
        }
    }
    let corigin_x = origin_x / 2;
    let corigin_y = origin_y / 2;
    let pred_cb = predict_chroma_block(&reference.cb, corigin_x, corigin_y, MotionVector::ZERO, 8, 8);
    let pred_cr = predict_chroma_block(&reference.cr, corigin_x, corigin_y, MotionVector::ZERO, 8, 8);
    for y in 0..8 {
        for x in 0..8 {
            recon.cb.set(corigin_x + x as isize, corigin_y + y as isize, pred_cb[y][x]);
            recon.cr.set(corigin_x + x as isize, corigin_y + y as isize, pred_cr[y][x]);
        }
    }
    let _ = mb;
}

/// Byte-aligns, then dumps the macroblock's raw luma and chroma samples
/// straight from the source picture (spec section 4.4's `I_PCM` overflow
/// fallback): lossless, bypassing transform/quantization/CAVLC entirely.
/// `recon` is filled with the same samples so later MBs and the reference
/// picture see an exact copy.
fn write_pcm_samples(w: &mut BitWriter, recon: &mut Picture, input: &Picture, origin_x: isize, origin_y: isize, mb: &mut Macroblock) -> Result<()> {
    w.align_to_byte()?;

    for y in 0..16isize {
        for x in 0..16isize {
            let v = input.luma.get(origin_x + x, origin_y + y);
            w.write_bits(8, v as u32)?;
            recon.luma.set(origin_x + x, origin_y + y, v);
        }
    }
    let corigin_x = origin_x / 2;
    let corigin_y = origin_y / 2;
    for (src, dst) in [(&input.cb, &mut recon.cb), (&input.cr, &mut recon.cr)] {
        for y in 0..8isize {
            for x in 0..8isize {
                let v = src.get(corigin_x + x, corigin_y + y);
                w.write_bits(8, v as u32)?;
                dst.set(corigin_x + x, corigin_y + y, v);
            }
        }
    }

    mb.nnz = [16; 16];
    mb.nnz_chroma = [[16; 4]; 2];
    mb.cbp = 0x2f;
    mb.qpy = 0;
    mb.qpc = 0;
    Ok(())
}

/// Table 8-15: chroma QP derivation from the luma QP, flat below 30 and
/// compressing above it so chroma never over-quantizes relative to luma.
const CHROMA_QP_TABLE: [u8; 22] = [29, 30, 31, 32, 32, 33, 34, 34, 35, 35, 36, 36, 37, 37, 37, 38, 38, 38, 39, 39, 39, 39];

fn chroma_qp(qpy: u8) -> u8 {
    if qpy < 30 {
        qpy
    } else {
        CHROMA_QP_TABLE[(qpy as usize - 30).min(21)]
    }
}

/// Fixed cost of an `I_PCM` macroblock: 256 luma + 2x64 chroma raw bytes,
/// bypassing transform/CAVLC entirely (spec section 4.4's overflow-fallback
/// note). When every intra candidate's estimated cost is no better than
/// this, PCM is the cheaper and always-decodable choice.
const PCM_ESCAPE_COST: u32 = (16 * 16 + 2 * 8 * 8) * 8;

fn decide_intra_mb(recon: &Picture, input: &Picture, luma_src: &[Vec<i32>], origin_x: isize, origin_y: isize, qp: u8, _constrained: bool) -> Macroblock {
    let mut mb = Macroblock::new(0, 0);
    mb.is_intra = true;

    let n16 = gather_block_neighbors(&recon.luma, origin_x, origin_y, 16);
    let (i16_mode, i16_cost) = intra::select_i16_mode(luma_src, &n16, 16);

    let mut i4_cost = 0u32;
    let mut i4_modes = [Intra4Mode::Dc; 16];
    for by in (0..16).step_by(4) {
        for bx in (0..16).step_by(4) {
            let idx = (by / 4) * 4 + bx / 4;
            let top_right_ok = bx + 4 < 16 || by > 0;
            let n4 = gather_i4_neighbors(&recon.luma, origin_x + bx as isize, origin_y + by as isize, top_right_ok);
            let block = extract_block(luma_src, bx, by);
            let mut best = (Intra4Mode::Dc, u32::MAX);
            for mode_idx in 0..9u8 {
                let mode = Intra4Mode::from_index(mode_idx);
                let pred = intra::predict_i4(mode, &n4);
                let mut s = [[0i32; 4]; 4];
                for y in 0..4 {
                    for x in 0..4 {
                        s[y][x] = block[y][x];
                    }
                }
                let cost = intra::satd_4x4(&s, &pred) + if mode_idx == Intra4Mode::Dc as u8 { 0 } else { intra::I4_MODE_BIAS };
                if cost < best.1 {
                    best = (mode, cost);
                }
            }
            i4_modes[idx] = best.0;
            i4_cost += best.1;
        }
    }

    if i4_cost.min(i16_cost) >= PCM_ESCAPE_COST {
        mb.mode = MbMode::IntraPcm;
        mb.qpy = qp as i8;
        mb.qpc = chroma_qp(qp) as i8;
        return mb;
    }

    if i4_cost < i16_cost {
        mb.mode = MbMode::Intra4x4;
        mb.intra4_modes = i4_modes;
    } else {
        mb.mode = MbMode::Intra16x16(i16_mode);
        mb.intra16_mode = Some(i16_mode);
    }

    let cb_src: Vec<Vec<i32>> = (0..8).map(|y| (0..8).map(|x| input.cb.get(origin_x / 2 + x, origin_y / 2 + y) as i32).collect()).collect();
    let cr_src: Vec<Vec<i32>> = (0..8).map(|y| (0..8).map(|x| input.cr.get(origin_x / 2 + x, origin_y / 2 + y) as i32).collect()).collect();
    let n_cb = gather_block_neighbors(&recon.cb, origin_x / 2, origin_y / 2, 8);
    let n_cr = gather_block_neighbors(&recon.cr, origin_x / 2, origin_y / 2, 8);
    mb.chroma_intra_mode = intra::select_chroma_mode(&cb_src, &cr_src, &n_cb, &n_cr);
    mb.qpy = qp as i8;
    mb.qpc = chroma_qp(qp) as i8;
    mb
}

#[allow(clippy::too_many_arguments)]
fn decide_inter_or_intra_mb(
    recon: &Picture,
    ctx: &SliceEncodeContext,
    input: &Picture,
    luma_src: &[Vec<i32>],
    origin_x: isize,
    origin_y: isize,
    mb_x: isize,
    mb_y: isize,
    grid: &MacroblockGrid,
    force_intra: bool,
) -> (bool, Macroblock) {
    if force_intra {
        let mut mb = decide_intra_mb(recon, input, luma_src, origin_x, origin_y, ctx.qp, ctx.pps.constrained_intra_pred_flag);
        mb.force_intra_search = true;
        return (false, mb);
    }

    let reference = match ctx.reference {
        Some(r) => r,
        None => {
            let mb = decide_intra_mb(recon, input, luma_src, origin_x, origin_y, ctx.qp, ctx.pps.constrained_intra_pred_flag);
            return (false, mb);
        }
    };

    let left_mv = if mb_x > 0 { Some(grid.get((mb_x - 1) as u32, mb_y as u32).mv[0]) } else { None };
    let top_mv = if mb_y > 0 { Some(grid.get(mb_x as u32, (mb_y - 1) as u32).mv[0]) } else { None };
    let top_right_mv = if mb_y > 0 && (mb_x as u32 + 1) < grid.mb_width {
        Some(grid.get((mb_x + 1) as u32, (mb_y - 1) as u32).mv[0])
    } else {
        None
    };
    let top_left_mv = if mb_x > 0 && mb_y > 0 { Some(grid.get((mb_x - 1) as u32, (mb_y - 1) as u32).mv[0]) } else { None };
    let pred_mv = predicted_mv(left_mv, top_mv, top_right_mv, top_left_mv);

    let result = search_motion(luma_src, &reference.luma, origin_x, origin_y, pred_mv, &ctx.search_params);

    let skip_pred = predict_luma_block(&reference.luma, origin_x, origin_y, MotionVector::ZERO, 16, 16);
    let skip_sad: u32 = luma_src
        .iter()
        .zip(skip_pred.iter())
        .map(|(sr, pr)| sr.iter().zip(pr.iter()).map(|(&s, &p)| (s - p as i32).unsigned_abs()).sum::<u32>())
        .sum();

    let is_skip_candidate = pred_mv == MotionVector::ZERO && result.mv == MotionVector::ZERO && skip_sad < 256;
    if is_skip_candidate {
        return (true, Macroblock::new(0, 0));
    }

    let mut mb = Macroblock::new(0, 0);
    mb.is_intra = false;
    mb.mode = MbMode::Inter16x16;
    mb.mv = [result.mv; 4];
    mb.qpy = ctx.qp as i8;
    mb.qpc = chroma_qp(ctx.qp) as i8;
    (false, mb)
}

fn write_intra4_mb_type(w: &mut BitWriter) -> Result<()> {
    write_ue(w, 0)
}

fn write_intra16_mb_type(w: &mut BitWriter, mode: Intra16Mode, cbp_luma_nonzero: bool, cbp_chroma: u8, offset: u32) -> Result<()> {
    let pred = mode as u32;
    let code = offset + 1 + pred + 4 * cbp_chroma as u32 + 12 * (cbp_luma_nonzero as u32);
    write_ue(w, code)
}

fn write_mb_header(w: &mut BitWriter, ctx: &SliceEncodeContext, mb: &Macroblock, is_i_slice: bool) -> Result<()> {
    let offset = if is_i_slice { 0 } else { 5 };

    match mb.mode {
        MbMode::Intra4x4 => {
            if !is_i_slice {
                write_ue(w, 5)?;
            } else {
                write_intra4_mb_type(w)?;
            }
            for &m in mb.intra4_modes.iter() {
                let predicted = Intra4Mode::Dc;
                write_i4_mode(w, m, predicted)?;
            }
            write_ue(w, mb.chroma_intra_mode as u32)?;
            cavlc::write_cbp(w, mb.cbp, true)?;
        }
        MbMode::Intra16x16(mode) => {
            write_intra16_mb_type(w, mode, mb.luma_cbp() != 0, mb.chroma_cbp(), offset)?;
            write_ue(w, mb.chroma_intra_mode as u32)?;
        }
        MbMode::IntraPcm => {
            write_ue(w, offset + 25)?;
        }
        MbMode::Inter16x16 => {
            write_ue(w, 0)?;
            write_se(w, mb.mv[0].x as i32)?;
            write_se(w, mb.mv[0].y as i32)?;
            cavlc::write_cbp(w, mb.cbp, false)?;
        }
        MbMode::Inter16x8 | MbMode::Inter8x16 | MbMode::Inter8x8 | MbMode::Skip => {
            // Not reached: this core's motion search only ever emits
            // Inter16x16 or Skip macroblocks.
            write_ue(w, 0)?;
        }
    }
    let _ = ctx;
    Ok(())
}

fn write_i4_mode(w: &mut BitWriter, mode: Intra4Mode, predicted: Intra4Mode) -> Result<()> {
    let prev_intra4x4_pred_mode_flag = mode == predicted;
    w.write_flag(prev_intra4x4_pred_mode_flag)?;
    if !prev_intra4x4_pred_mode_flag {
        let rem = mode as u8;
        let rem = if rem < predicted as u8 { rem } else { rem - 1 };
        w.write_bits(3, rem as u32)?;
    }
    Ok(())
}

/// Everything computed for one macroblock's residual before any bits are
/// written: the quantized coefficients CAVLC needs plus the CBP that
/// `write_mb_header` must already know (coded_block_pattern, or the
/// folded I16 mb_type, is written before the residual itself).
struct MbResidualData {
    luma_coded: Vec<CodedBlock>,
    i16_dc_scanned: ScannedBlock,
    chroma_coded_ac: [Vec<CodedBlock>; 2],
    chroma_dc_scanned: [ScannedBlock; 2],
}

/// Quantizes the DC Hadamard transform's special `q_bits+1` scaling
/// (spec section 4.4): one extra bit over the ordinary 4x4 path since the
/// Hadamard itself doesn't normalize.
fn quantize_hadamard_4x4(dc: &Block4x4, qp: u8, is_intra: bool) -> Block4x4 {
    let q_bits = 15 + qp as i32 / 6 + 1;
    let qp6 = qp as usize % 6;
    let f = if is_intra { (1i64 << q_bits) / 3 } else { (1i64 << q_bits) / 6 };
    let mut out = [[0i32; 4]; 4];
    for y in 0..4 {
        for x in 0..4 {
            let scale = transform::QUANT_COEF[qp6][y * 4 + x] as i64;
            let w_val = dc[y][x] as i64;
            let mag = (w_val.unsigned_abs() as i64 * scale + f) >> q_bits;
            out[y][x] = if w_val < 0 { -(mag as i32) } else { mag as i32 };
        }
    }
    out
}

/// Dequantizes a Hadamard-transformed DC block (the `d = QP/6 >= 6`
/// boundary one bit higher than the ordinary 4x4 path, for the same
/// reason the forward side scales by one extra bit).
fn dequantize_hadamard_4x4(levels: &Block4x4, qp: u8) -> Block4x4 {
    let d = qp as i32 / 6;
    let qp6 = qp as usize % 6;
    let mut out = [[0i32; 4]; 4];
    for y in 0..4 {
        for x in 0..4 {
            let scale = transform::DEQUANT_COEF[qp6][y * 4 + x];
            let level = levels[y][x];
            out[y][x] = if d >= 6 { level * scale << (d - 6) } else { (level * scale + (1 << (5 - d))) >> (6 - d) };
        }
    }
    out
}

/// Predicts each 4x4 luma or chroma block, transforms and quantizes its
/// residual, and folds the DC coefficients of I16 macroblocks through the
/// Hadamard transform. Reconstructs directly into `recon` as it goes;
/// does not touch the bitstream (`write_mb_header`/`cavlc` need the CBP
/// this computes before any residual bits can be written).
fn analyze_and_reconstruct_mb(ctx: &SliceEncodeContext, recon: &mut Picture, origin_x: isize, origin_y: isize, mb: &mut Macroblock, luma_src: &[Vec<i32>], input: &Picture) -> MbResidualData {
    let is_i16 = matches!(mb.mode, MbMode::Intra16x16(_));
    let qp = mb.qpy as u8;

    let mut pred_luma = vec![vec![0u8; 16]; 16];
    if mb.is_intra {
        if let MbMode::Intra16x16(mode) = mb.mode {
            let n16 = gather_block_neighbors(&recon.luma, origin_x, origin_y, 16);
            pred_luma = intra::predict_i16(mode, &n16, 16);
        }
    } else {
        let reference = ctx.reference.unwrap();
        pred_luma = predict_luma_block(&reference.luma, origin_x, origin_y, mb.mv[0], 16, 16);
    }

    let mut luma_nnz = [0u8; 16];
    let mut luma_coded: Vec<CodedBlock> = Vec::with_capacity(16);
    let mut dc_coeffs = [[0i32; 4]; 4];

    for by in (0..16).step_by(4) {
        for bx in (0..16).step_by(4) {
            let idx = (by / 4) * 4 + bx / 4;
            let block_pred = if mb.mode == MbMode::Intra4x4 {
                let top_right_ok = bx + 4 < 16 || by > 0;
                let n4 = gather_i4_neighbors(&recon.luma, origin_x + bx as isize, origin_y + by as isize, top_right_ok);
                let p = intra::predict_i4(mb.intra4_modes[idx], &n4);
                for y in 0..4 {
                    for x in 0..4 {
                        pred_luma[by + y][bx + x] = p[y][x];
                    }
                }
                p
            } else {
                let mut p = [[0u8; 4]; 4];
                for y in 0..4 {
                    for x in 0..4 {
                        p[y][x] = pred_luma[by + y][bx + x];
                    }
                }
                p
            };

            let src_block = extract_block(luma_src, bx, by);
            let residue = residual_block(&src_block, &block_pred);
            let coded = encode_residual_4x4(&residue, qp, mb.is_intra, is_i16);
            if is_i16 {
                dc_coeffs[by / 4][bx / 4] = coded.dc_raw;
            }
            luma_nnz[idx] = coded.nnz;

            if mb.mode == MbMode::Intra4x4 {
                // I4 blocks are reconstructed immediately: later blocks in
                // this macroblock need these samples as their own neighbors.
                for y in 0..4 {
                    for x in 0..4 {
                        let v = block_pred[y][x] as i32 + coded.dequantized[y][x];
                        recon.luma.set(origin_x + (bx + x) as isize, origin_y + (by + y) as isize, v.clamp(0, 255) as u8);
                    }
                }
            }
            luma_coded.push(coded);
        }
    }

    // Coefficient-cost culling (spec section 4.4): an 8x8 sub-block whose
    // total cost falls below threshold is dropped (nnz zeroed, and, for
    // modes reconstructed in bulk below, its residual contribution zeroed
    // too); the same test then runs once more over the whole MB. Intra4x4
    // blocks are already reconstructed in place by the loop above and are
    // left alone here — only their reported nnz is culled.
    const SUBBLOCK_IDX: [[usize; 4]; 4] = [[0, 1, 4, 5], [2, 3, 6, 7], [8, 9, 12, 13], [10, 11, 14, 15]];
    let luma_threshold = if mb.is_intra { transform::LUMA_COEFF_COST_INTRA } else { transform::LUMA_COEFF_COST_INTER };
    let mut luma_cbp_bits = 0u8;
    let mut mb_luma_cost = 0i32;
    for (sub, idxs) in SUBBLOCK_IDX.iter().enumerate() {
        let sub_cost: i32 = idxs.iter().map(|&i| luma_coded[i].cost).sum();
        mb_luma_cost += sub_cost;
        let any_nonzero = idxs.iter().any(|&i| luma_nnz[i] > 0);
        if any_nonzero && sub_cost >= luma_threshold {
            luma_cbp_bits |= 1 << sub;
        } else if any_nonzero {
            for &i in idxs {
                luma_nnz[i] = 0;
                if mb.mode != MbMode::Intra4x4 {
                    luma_coded[i].dequantized = [[0; 4]; 4];
                }
            }
        }
    }
    if mb_luma_cost < transform::LUMA_MB_COEFF_COST && luma_cbp_bits != 0 {
        if mb.mode != MbMode::Intra4x4 {
            for c in luma_coded.iter_mut() {
                c.dequantized = [[0; 4]; 4];
            }
        }
        luma_cbp_bits = 0;
        luma_nnz = [0; 16];
    }

    let mut i16_dc_scanned = ScannedBlock::default();
    if is_i16 {
        let hadamard = transform::hadamard_forward_4x4(&dc_coeffs);
        let quant_dc = quantize_hadamard_4x4(&hadamard, qp, mb.is_intra);
        i16_dc_scanned = scan_coeffs(&zigzag_scan(&quant_dc));

        let dequant_dc = dequantize_hadamard_4x4(&quant_dc, qp);
        let dc_spatial = transform::hadamard_inverse_4x4(&dequant_dc);
        for y in 0..4 {
            for x in 0..4 {
                let idx = y * 4 + x;
                let bx = x * 4;
                let by = y * 4;
                let dc_term = (dc_spatial[y][x] + 32) >> 6;
                for dy in 0..4 {
                    for dx in 0..4 {
                        let ac = luma_coded[idx].dequantized[dy][dx];
                        let v = pred_luma[by + dy][bx + dx] as i32 + ac + dc_term;
                        recon.luma.set(origin_x + (bx + dx) as isize, origin_y + (by + dy) as isize, v.clamp(0, 255) as u8);
                    }
                }
            }
        }
    } else if mb.mode != MbMode::Intra4x4 {
        for by in 0..16 {
            for bx in 0..16 {
                let idx = (by / 4) * 4 + bx / 4;
                let v = pred_luma[by][bx] as i32 + luma_coded[idx].dequantized[by % 4][bx % 4];
                recon.luma.set(origin_x + bx as isize, origin_y + by as isize, v.clamp(0, 255) as u8);
            }
        }
    }

    let corigin_x = origin_x / 2;
    let corigin_y = origin_y / 2;
    let mut chroma_nnz = [[0u8; 4]; 2];
    let mut chroma_coded_ac: [Vec<CodedBlock>; 2] = [Vec::with_capacity(4), Vec::with_capacity(4)];
    let mut chroma_dc_scanned: [ScannedBlock; 2] = [ScannedBlock::default(), ScannedBlock::default()];

    for ci in 0..2 {
        let chroma_pred = if mb.is_intra {
            let recon_plane = if ci == 0 { &recon.cb } else { &recon.cr };
            let n8 = gather_block_neighbors(recon_plane, corigin_x, corigin_y, 8);
            let mode16 = match mb.chroma_intra_mode {
                ChromaIntraMode::Dc => Intra16Mode::Dc,
                ChromaIntraMode::Horizontal => Intra16Mode::Horizontal,
                ChromaIntraMode::Vertical => Intra16Mode::Vertical,
                ChromaIntraMode::Plane => Intra16Mode::Plane,
            };
            intra::predict_i16(mode16, &n8, 8)
        } else {
            let reference = ctx.reference.unwrap();
            let ref_plane = if ci == 0 { &reference.cb } else { &reference.cr };
            predict_chroma_block(ref_plane, corigin_x, corigin_y, mb.mv[0], 8, 8)
        };

        let chroma_src: Vec<Vec<i32>> = (0..8)
            .map(|y| (0..8).map(|x| if ci == 0 { input.cb.get(corigin_x + x, corigin_y + y) as i32 } else { input.cr.get(corigin_x + x, corigin_y + y) as i32 }).collect())
            .collect();

        let mut dc = [[0i32; 2]; 2];
        let mut ac_residuals = vec![vec![0i32; 8]; 8];
        for by in (0..8).step_by(4) {
            for bx in (0..8).step_by(4) {
                let block_pred = extract_block_u8(&chroma_pred, bx, by);
                let src_block = extract_block(&chroma_src, bx, by);
                let residue = residual_block(&src_block, &block_pred);
                let coded = encode_residual_4x4(&residue, mb.qpc as u8, mb.is_intra, true);
                dc[by / 4][bx / 4] = coded.dc_raw;
                chroma_nnz[ci][(by / 4) * 2 + bx / 4] = coded.nnz;
                for y in 0..4 {
                    for x in 0..4 {
                        ac_residuals[by + y][bx + x] = coded.dequantized[y][x];
                    }
                }
                chroma_coded_ac[ci].push(coded);
            }
        }

        // Chroma AC coefficient-cost culling (spec section 4.4): drop this
        // channel's AC residual entirely when its total cost is too low to
        // be worth signaling.
        let chroma_ac_cost: i32 = chroma_coded_ac[ci].iter().map(|c| c.cost).sum();
        if chroma_ac_cost < transform::CHROMA_COEFF_COST {
            for c in chroma_coded_ac[ci].iter_mut() {
                c.dequantized = [[0; 4]; 4];
            }
            chroma_nnz[ci] = [0; 4];
            for row in ac_residuals.iter_mut() {
                row.fill(0);
            }
        }

        let hadamard_dc = transform::hadamard_forward_2x2(dc);
        // Chroma DC dequantization uses the ordinary (non-Hadamard-scaled)
        // table since the 2x2 transform already normalizes by four.
        let mut quant_dc = [[0i32; 2]; 2];
        for y in 0..2 {
            for x in 0..2 {
                let q_bits = 15 + mb.qpc as i32 / 6;
                let qp6 = mb.qpc as usize % 6;
                let scale = transform::QUANT_COEF[qp6][0] as i64;
                let f = if mb.is_intra { (1i64 << q_bits) / 3 } else { (1i64 << q_bits) / 6 };
                let w_val = hadamard_dc[y][x] as i64;
                let mag = (w_val.unsigned_abs() as i64 * scale + f) >> (q_bits + 1);
                quant_dc[y][x] = if w_val < 0 { -(mag as i32) } else { mag as i32 };
            }
        }
        chroma_dc_scanned[ci] = scan_coeffs(&[quant_dc[0][0], quant_dc[0][1], quant_dc[1][0], quant_dc[1][1]]);

        let d = mb.qpc as i32 / 6;
        let qp6 = mb.qpc as usize % 6;
        let scale = transform::DEQUANT_COEF[qp6][0];
        let dequant_dc = transform::hadamard_inverse_2x2(quant_dc.map(|row| [row[0] * scale << d.max(0), row[1] * scale << d.max(0)]));
        let target = if ci == 0 { &mut recon.cb } else { &mut recon.cr };
        for by in 0..8 {
            for bx in 0..8 {
                let dc_term = (dequant_dc[by / 4][bx / 4] + 2) >> 2;
                let v = chroma_pred[by][bx] as i32 + ac_residuals[by][bx] + dc_term;
                target.set(corigin_x + bx as isize, corigin_y + by as isize, v.clamp(0, 255) as u8);
            }
        }
    }

    mb.nnz = luma_nnz;
    mb.nnz_chroma = chroma_nnz;
    let chroma_has_ac = chroma_nnz.iter().flatten().any(|&n| n > 0);
    let chroma_has_dc = chroma_dc_scanned.iter().any(|s| s.total_coeff > 0);
    let chroma_cbp = if chroma_has_ac { 2 } else if chroma_has_dc { 1 } else { 0 };
    mb.cbp = if is_i16 {
        // I16 never signals codedBlockPatternLuma directly; the mb_type
        // folds in a single all-or-nothing luma-AC-present flag instead.
        (if luma_cbp_bits != 0 { 0x0f } else { 0 }) | (chroma_cbp << 4)
    } else {
        luma_cbp_bits | (chroma_cbp << 4)
    };

    MbResidualData {
        luma_coded,
        i16_dc_scanned,
        chroma_coded_ac,
        chroma_dc_scanned,
    }
}

fn write_residual(w: &mut BitWriter, mb: &Macroblock, data: &MbResidualData) -> Result<()> {
    let is_i16 = matches!(mb.mode, MbMode::Intra16x16(_));

    if !is_i16 && mb.cbp != 0 {
        cavlc::write_cbp(w, mb.cbp, mb.mode == MbMode::Intra4x4)?;
    }

    if is_i16 {
        cavlc::write_residual_block(w, &data.i16_dc_scanned, 16, BlockKind::Luma4x4 { nc: 0 })?;
    }

    if is_i16 || mb.luma_cbp() != 0 {
        for idx in 0..16 {
            let left_nnz = if idx % 4 == 0 { None } else { Some(data.luma_coded[idx - 1].nnz) };
            let top_nnz = if idx < 4 { None } else { Some(data.luma_coded[idx - 4].nnz) };
            let nc = cavlc::predict_nc(left_nnz, top_nnz);
            let zz = &data.luma_coded[idx].levels_zigzag;
            let ac_only = if is_i16 { &zz[1..] } else { &zz[..] };
            let scanned = scan_coeffs(ac_only);
            cavlc::write_residual_block(w, &scanned, ac_only.len(), BlockKind::Luma4x4 { nc })?;
        }
    }

    if mb.chroma_cbp() >= 1 {
        for ci in 0..2 {
            cavlc::write_residual_block(w, &data.chroma_dc_scanned[ci], 4, BlockKind::ChromaDc)?;
        }
    }
    if mb.chroma_cbp() == 2 {
        for ci in 0..2 {
            for (idx, block) in data.chroma_coded_ac[ci].iter().enumerate() {
                let left_nnz = if idx % 2 == 0 { None } else { Some(data.chroma_coded_ac[ci][idx - 1].nnz) };
                let top_nnz = if idx < 2 { None } else { Some(data.chroma_coded_ac[ci][idx - 2].nnz) };
                let nc = cavlc::predict_nc(left_nnz, top_nnz);
                let ac_only = &block.levels_zigzag[1..];
                let scanned = scan_coeffs(ac_only);
                cavlc::write_residual_block(w, &scanned, 15, BlockKind::ChromaAc4x4 { nc })?;
            }
        }
    }

    Ok(())
}

fn extract_block_u8(src: &[Vec<u8>], bx: usize, by: usize) -> [[u8; 4]; 4] {
    let mut out = [[0u8; 4]; 4];
    for y in 0..4 {
        for x in 0..4 {
            out[y][x] = src[by + y][bx + x];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zigzag_round_trips_through_scan_and_unscan() {
        let mut block = [[0i32; 4]; 4];
        block[0][0] = 5;
        block[3][3] = 9;
        let scanned = zigzag_scan(&block);
        let back = zigzag_unscan(&scanned);
        assert_eq!(back, block);
    }

    #[test]
    fn scan_coeffs_counts_runs_between_nonzero_values() {
        let coeffs = [0, 3, 0, 0, -1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let scanned = scan_coeffs(&coeffs);
        assert_eq!(scanned.total_coeff, 2);
        assert_eq!(scanned.levels, vec![3, -1]);
        assert_eq!(scanned.runs, vec![1, 2]);
    }
}
