//! Motion estimation: predicted-MV derivation, an integer-pel diamond
//! search followed by half- and quarter-pel refinement, Lagrangian cost,
//! and the Average Boundary Error test used to arbitrate intra vs. inter
//! and to flag scene changes (spec section 4.3).

use crate::frame::Plane;
use crate::intra::satd_4x4;
use crate::macroblock::MotionVector;
use crate::motion_comp::predict_luma_block;

/// Search-range and cost-model knobs threaded down from `EncoderConfig`
/// and the rate controller's current QP (spec section 4.3's lambda note).
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    pub search_range: i32,
    pub lambda_motion: u32,
    pub max_v_mv_r: Option<i32>,
}

/// Median predictor of the left/top/top-right neighbors' motion vectors,
/// substituting the top-left neighbor when top-right is unavailable, and
/// falling back to whichever single neighbor is available (spec section
/// 4.3, mirroring the standard's `MVpred` derivation for 16x16 partitions).
pub fn predicted_mv(left: Option<MotionVector>, top: Option<MotionVector>, top_right: Option<MotionVector>, top_left: Option<MotionVector>) -> MotionVector {
    let tr = top_right.or(top_left);
    match (left, top, tr) {
        (Some(l), Some(t), Some(r)) => MotionVector {
            x: median3(l.x, t.x, r.x),
            y: median3(l.y, t.y, r.y),
        },
        (Some(l), None, None) => l,
        (None, Some(t), None) => t,
        (None, None, Some(r)) => r,
        (Some(l), Some(t), None) => MotionVector {
            x: median3(l.x, t.x, 0),
            y: median3(l.y, t.y, 0),
        },
        _ => MotionVector::ZERO,
    }
}

fn median3(a: i16, b: i16, c: i16) -> i16 {
    a.max(b).min(a.min(b).max(c))
}

fn sad_block(src: &[Vec<i32>], pred: &[Vec<u8>]) -> u32 {
    let mut sum = 0u32;
    for (sr, pr) in src.iter().zip(pred.iter()) {
        for (&s, &p) in sr.iter().zip(pr.iter()) {
            sum += (s - p as i32).unsigned_abs();
        }
    }
    sum
}

fn satd_block(src: &[Vec<i32>], pred: &[Vec<u8>], size: usize) -> u32 {
    let mut cost = 0;
    for by in (0..size).step_by(4) {
        for bx in (0..size).step_by(4) {
            let mut s = [[0i32; 4]; 4];
            let mut p = [[0u8; 4]; 4];
            for y in 0..4 {
                for x in 0..4 {
                    s[y][x] = src[by + y][bx + x];
                    p[y][x] = pred[by + y][bx + x];
                }
            }
            cost += satd_4x4(&s, &p);
        }
    }
    cost
}

fn clamp_mv(mv: MotionVector, params: &SearchParams) -> MotionVector {
    let vmax = params.max_v_mv_r.unwrap_or(2047);
    MotionVector {
        x: mv.x.clamp(-2047, 2047),
        y: mv.y.clamp(-vmax as i16, vmax as i16),
    }
}

/// Result of a 16x16 motion search: the best motion vector, its
/// Lagrangian cost, and the SAD at that vector (used by the rate
/// controller's RD history).
#[derive(Debug, Clone, Copy)]
pub struct MotionSearchResult {
    pub mv: MotionVector,
    pub cost: u32,
    pub sad: u32,
}

/// Full-pel diamond search around the predicted MV, then half- and
/// quarter-pel refinement by SATD, on a 16x16 luma block.
pub fn search_motion(src: &[Vec<i32>], reference: &Plane, mb_x: isize, mb_y: isize, pred_mv: MotionVector, params: &SearchParams) -> MotionSearchResult {
    let origin = MotionVector::ZERO;
    let mut best_mv = origin;
    let mut best_cost = u32::MAX;
    let mut best_sad = 0u32;

    let mut eval = |mv: MotionVector, best_mv: &mut MotionVector, best_cost: &mut u32, best_sad: &mut u32| {
        let mv = clamp_mv(mv, params);
        let pred = predict_luma_block(reference, mb_x, mb_y, MotionVector { x: mv.x * 4, y: mv.y * 4 }, 16, 16);
        let sad = sad_block(src, &pred);
        let bits = mv.sad_bits_cost(pred_mv);
        let cost = sad + params.lambda_motion * bits;
        if cost < *best_cost {
            *best_cost = cost;
            *best_mv = mv;
            *best_sad = sad;
        }
    };

    eval(origin, &mut best_mv, &mut best_cost, &mut best_sad);
    eval(
        MotionVector {
            x: (pred_mv.x / 4),
            y: (pred_mv.y / 4),
        },
        &mut best_mv,
        &mut best_cost,
        &mut best_sad,
    );

    const DIAMOND: [(i16, i16); 4] = [(0, -1), (0, 1), (-1, 0), (1, 0)];
    let mut step = 4i16;
    while step >= 1 {
        loop {
            let center = best_mv;
            let mut improved = false;
            for (dx, dy) in DIAMOND {
                let range = params.search_range as i16;
                let candidate = MotionVector {
                    x: (center.x + dx * step).clamp(-range, range),
                    y: (center.y + dy * step).clamp(-range, range),
                };
                let cost_before = best_cost;
                eval(candidate, &mut best_mv, &mut best_cost, &mut best_sad);
                if best_cost < cost_before {
                    improved = true;
                }
            }
            if !improved {
                break;
            }
        }
        step /= 2;
    }

    // Quarter-pel refinement in the 3x3 neighborhood of the best full-pel
    // vector, using SATD rather than SAD per spec section 4.3's sub-pel
    // metric note.
    let full_pel = MotionVector { x: best_mv.x * 4, y: best_mv.y * 4 };
    let mut best_qpel_mv = full_pel;
    let mut best_qpel_cost = u32::MAX;
    for dy in -3..=3 {
        for dx in -3..=3 {
            let candidate = MotionVector {
                x: full_pel.x + dx,
                y: full_pel.y + dy,
            };
            let candidate = clamp_mv(
                MotionVector {
                    x: candidate.x,
                    y: candidate.y,
                },
                &SearchParams {
                    search_range: params.search_range * 4,
                    ..*params
                },
            );
            let pred = predict_luma_block(reference, mb_x, mb_y, candidate, 16, 16);
            let satd = satd_block(src, &pred, 16);
            let bits = candidate.sad_bits_cost(pred_mv);
            let cost = satd + params.lambda_motion * bits;
            if cost < best_qpel_cost {
                best_qpel_cost = cost;
                best_qpel_mv = candidate;
            }
        }
    }

    MotionSearchResult {
        mv: best_qpel_mv,
        cost: best_qpel_cost,
        sad: best_sad,
    }
}

/// Average Boundary Error: mean absolute difference between the
/// macroblock's predicted boundary samples and the corresponding
/// already-reconstructed neighbor samples, used both to decide intra vs.
/// inter for a macroblock and, averaged over a frame, to flag a scene
/// change (spec section 4.3).
pub fn average_boundary_error(pred_top: &[u8], actual_top: &[u8], pred_left: &[u8], actual_left: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut count = 0u32;
    for (&p, &a) in pred_top.iter().zip(actual_top.iter()) {
        sum += (p as i32 - a as i32).unsigned_abs();
        count += 1;
    }
    for (&p, &a) in pred_left.iter().zip(actual_left.iter()) {
        sum += (p as i32 - a as i32).unsigned_abs();
        count += 1;
    }
    if count == 0 {
        0
    } else {
        sum / count
    }
}

/// Scene-change heuristic: true when the frame-average ABE exceeds a
/// fixed multiple of the previous frame's average, matching the
/// conservative threshold this core uses instead of a learned model.
pub fn is_scene_change(current_avg_abe: u32, previous_avg_abe: u32) -> bool {
    previous_avg_abe > 0 && current_avg_abe > previous_avg_abe.saturating_mul(2)
}

/// Cheap zero-motion analysis pass over every macroblock of a frame (spec
/// section 4.3): estimates each MB's inter cost against the collocated
/// reference block and its Average Boundary Error against that same
/// prediction. Returns a per-MB flag for "intra search required" (the
/// `ABE*0.8 < inter_cost/384` test) and the frame's average ABE, for the
/// caller to compare against the previous frame's average via
/// `is_scene_change`.
pub fn analyze_frame_abe(mb_width: u32, mb_height: u32, input: &Plane, reference: &Plane) -> (Vec<bool>, u32) {
    let total_mbs = (mb_width * mb_height) as usize;
    let mut force_intra = vec![false; total_mbs];
    let mut total_abe: u64 = 0;

    for mb_y in 0..mb_height {
        for mb_x in 0..mb_width {
            let ox = (mb_x * 16) as isize;
            let oy = (mb_y * 16) as isize;

            let mut inter_cost = 0u32;
            for y in 0..16isize {
                for x in 0..16isize {
                    inter_cost += (input.get(ox + x, oy + y) as i32 - reference.get(ox + x, oy + y) as i32).unsigned_abs();
                }
            }

            let top_actual: Vec<u8> = (0..16isize).map(|i| input.get(ox + i, oy)).collect();
            let top_pred: Vec<u8> = (0..16isize).map(|i| reference.get(ox + i, oy)).collect();
            let left_actual: Vec<u8> = (0..16isize).map(|i| input.get(ox, oy + i)).collect();
            let left_pred: Vec<u8> = (0..16isize).map(|i| reference.get(ox, oy + i)).collect();
            let abe = average_boundary_error(&top_pred, &top_actual, &left_pred, &left_actual);
            total_abe += abe as u64;

            if (abe as f64) * 0.8 < (inter_cost as f64) / 384.0 {
                force_intra[(mb_y * mb_width + mb_x) as usize] = true;
            }
        }
    }

    let avg_abe = if total_mbs == 0 { 0 } else { (total_abe / total_mbs as u64) as u32 };
    (force_intra, avg_abe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicted_mv_is_median_of_three_neighbors() {
        let l = MotionVector { x: 0, y: 0 };
        let t = MotionVector { x: 4, y: 4 };
        let r = MotionVector { x: 8, y: 8 };
        let pred = predicted_mv(Some(l), Some(t), Some(r), None);
        assert_eq!(pred, MotionVector { x: 4, y: 4 });
    }

    #[test]
    fn predicted_mv_falls_back_to_single_neighbor() {
        let l = MotionVector { x: 3, y: -2 };
        let pred = predicted_mv(Some(l), None, None, None);
        assert_eq!(pred, l);
    }

    #[test]
    fn zero_mv_on_identical_planes_has_zero_sad() {
        let mut plane = Plane::new(32, 32, 16);
        for y in 0..32isize {
            for x in 0..32isize {
                plane.set(x, y, ((x + y) % 255) as u8);
            }
        }
        plane.extend_borders();
        let src: Vec<Vec<i32>> = (0..16)
            .map(|y| (0..16).map(|x| plane.get(x, y) as i32).collect())
            .collect();
        let params = SearchParams {
            search_range: 16,
            lambda_motion: 1,
            max_v_mv_r: Some(512),
        };
        let result = search_motion(&src, &plane, 0, 0, MotionVector::ZERO, &params);
        assert_eq!(result.mv, MotionVector::ZERO);
        assert_eq!(result.sad, 0);
    }

    #[test]
    fn scene_change_detects_large_abe_jump() {
        assert!(is_scene_change(100, 20));
        assert!(!is_scene_change(30, 20));
    }
}
