//! One-pass rate control (spec section 4.2): modTime-driven frame
//! admission, a moving bit-budget (`TMN_TH`/`TMN_W`) with a closest-MAD
//! history lookup feeding a quadratic/linear Qstep estimate, and a
//! post-encode CPB-fullness check that can throttle upcoming frames or
//! roll back the one just encoded.

use std::collections::VecDeque;

use crate::config::EncoderConfig;

/// Floor on MAD so rate-distortion ratios never divide by zero.
const MAD_MIN: f64 = 1.0;

/// One entry of the RD history ring: what a past frame at a given QP
/// actually cost, used to estimate the next frame's Qstep by proximity in
/// complexity (MAD) rather than by frame recency.
#[derive(Debug, Clone, Copy)]
struct RdSample {
    qp: u8,
    bits: u32,
    mad: f64,
}

const QSTEP_TABLE: [f64; 6] = [0.625, 0.6875, 0.8125, 0.875, 1.0, 1.125];

fn qp_to_qstep(qp: u8) -> f64 {
    let qp = qp as i32;
    QSTEP_TABLE[(qp % 6) as usize] * 2f64.powi(qp / 6)
}

fn qstep_to_qp(mut qstep: f64) -> u8 {
    if qstep < QSTEP_TABLE[0] {
        return 0;
    }
    if qstep > qp_to_qstep(51) {
        return 51;
    }
    let mut q_per = 0;
    while qstep > QSTEP_TABLE[5] {
        qstep /= 2.0;
        q_per += 1;
    }
    let q_rem = if qstep <= (QSTEP_TABLE[0] + QSTEP_TABLE[1]) / 2.0 {
        0
    } else if qstep <= (QSTEP_TABLE[1] + QSTEP_TABLE[2]) / 2.0 {
        1
    } else if qstep <= (QSTEP_TABLE[2] + QSTEP_TABLE[3]) / 2.0 {
        2
    } else if qstep <= (QSTEP_TABLE[3] + QSTEP_TABLE[4]) / 2.0 {
        3
    } else if qstep <= (QSTEP_TABLE[4] + QSTEP_TABLE[5]) / 2.0 {
        4
    } else {
        5
    };
    (q_per * 6 + q_rem) as u8
}

#[derive(Debug, Clone)]
pub struct RateController {
    enabled: bool,
    frame_rate: f64,
    bits_per_frame: f64,
    cpb_bits: f64,
    low_bound: f64,
    vbv_fullness: f64,
    tmn_th: f64,
    tmn_w: f64,
    qp: u8,
    first_frame: bool,
    mod_time_ref_ms: i64,
    prev_proc_frame_num: i64,
    /// > 0: this many upcoming frames must be rejected to drain the CPB;
    /// == -1: the frame just encoded overran and was rolled back.
    skip_next_frame: i32,
    history: VecDeque<RdSample>,
    frame_range: usize,
    last_mad: f64,
    sum_qp: f64,
    sum_mad: f64,
    encoded_frames: u32,
}

impl RateController {
    pub fn new(cfg: &EncoderConfig) -> Self {
        let frame_rate = (cfg.frame_rate_1000 as f64 / 1000.0).max(1.0);
        let bits_per_frame = cfg.bitrate as f64 / frame_rate;
        let cpb_bits = (cfg.cpb_size as f64 * 8.0).max(1.0);
        let low_bound = -cpb_bits / 2.0;
        // HRD startup contract (spec section 4.2): initial fullness is one
        // third of the CPB, expressed on the [-Bs/2, Bs/2] virtual scale.
        let vbv_fullness = cpb_bits / 3.0 - cpb_bits / 2.0;
        let frame_range = (frame_rate.round() as usize).clamp(5, 30);

        let init_qp = if cfg.init_qp == 0 { auto_initial_qp(cfg) } else { cfg.init_qp };

        RateController {
            enabled: cfg.rate_control_enabled,
            frame_rate,
            bits_per_frame,
            cpb_bits,
            low_bound,
            vbv_fullness,
            tmn_th: bits_per_frame,
            tmn_w: 0.0,
            qp: init_qp,
            first_frame: true,
            mod_time_ref_ms: 0,
            prev_proc_frame_num: -1,
            skip_next_frame: 0,
            history: VecDeque::with_capacity(frame_range),
            frame_range,
            last_mad: MAD_MIN,
            sum_qp: 0.0,
            sum_mad: 0.0,
            encoded_frames: 0,
        }
    }

    pub fn current_qp(&self) -> u8 {
        self.qp
    }

    /// Frame admission (spec section 4.2, step 1): derives a target frame
    /// number from `timestamp_us` relative to the session's reference
    /// time, rejecting late arrivals and frames that would violate the
    /// skip count the CPB check imposed on the previous frame. Always
    /// admits the very first frame and (when rate control is disabled)
    /// every frame.
    pub fn admit_frame(&mut self, timestamp_us: i64) -> bool {
        if !self.enabled {
            return true;
        }

        let mod_time_ms = timestamp_us / 1000;

        if self.first_frame {
            self.mod_time_ref_ms = mod_time_ms;
            self.prev_proc_frame_num = 0;
            return true;
        }

        let target_frame_num = (((mod_time_ms - self.mod_time_ref_ms) as f64 * self.frame_rate / 1000.0).round()) as i64;

        if target_frame_num <= self.prev_proc_frame_num {
            log::trace!("rate control: rejecting late frame (target {target_frame_num} <= prev {})", self.prev_proc_frame_num);
            return false;
        }

        let frame_inc = target_frame_num - self.prev_proc_frame_num;
        if frame_inc < self.skip_next_frame as i64 + 1 {
            log::trace!("rate control: skipping frame to hold target bit rate ({frame_inc} < {}+1)", self.skip_next_frame);
            return false;
        }

        let drained = frame_inc - self.skip_next_frame as i64;
        if drained > 1 {
            self.vbv_fullness -= self.bits_per_frame * (drained - 1) as f64;
            self.vbv_fullness = self.vbv_fullness.max(self.low_bound);
        }

        self.prev_proc_frame_num = target_frame_num;
        self.skip_next_frame = 0;
        true
    }

    /// Picks this frame's QP (spec section 4.2, step 2): target bits
    /// `T = TMN_TH - TMN_W`, the closest-MAD sample from recent history
    /// gives `prev_Qstep`/`prev_actual_bits`, and the Qstep estimate
    /// blends a quadratic and linear (or, outside `[0.5, 2]`, cube-root)
    /// term before being converted back to a clipped QP.
    pub fn select_qp(&mut self, is_intra: bool) -> u8 {
        let _ = is_intra;
        if !self.enabled || self.encoded_frames == 0 {
            return self.qp;
        }

        let target = self.tmn_th - self.tmn_w;
        if target <= 0.0 {
            self.qp = 51;
            return self.qp;
        }

        let curr_mad = self.last_mad.max(MAD_MIN);
        let curr_rd = target / curr_mad;

        if let Some(sample) = self.closest_mad_sample(curr_mad) {
            if sample.mad > 0.001 {
                let prev_qstep = qp_to_qstep(sample.qp);
                let prev_rd = sample.bits as f64 / sample.mad;
                let ratio = prev_rd / curr_rd;
                let qstep = if ratio > 0.5 && ratio < 2.0 {
                    prev_qstep * (ratio.sqrt() + ratio) / 2.0
                } else {
                    prev_qstep * (ratio.sqrt() + ratio.cbrt()) / 2.0
                };
                self.qp = qstep_to_qp(qstep).clamp(0, 51);
            }
        }

        // Active bit-resource protection: once recent QP/complexity has
        // tracked comfortably under the running average, relax the target
        // a little so the saved bits carry forward to later frames.
        if self.encoded_frames > 0 {
            let avg_qp = self.sum_qp / self.encoded_frames as f64;
            let avg_mad = self.sum_mad / self.encoded_frames as f64;
            if self.qp as f64 <= avg_qp * 1.1 || curr_mad <= avg_mad * 1.1 {
                self.tmn_th -= self.bits_per_frame * 0.1;
            }
        }

        self.qp
    }

    fn closest_mad_sample(&self, curr_mad: f64) -> Option<RdSample> {
        self.history
            .iter()
            .min_by(|a, b| (a.mad - curr_mad).abs().partial_cmp(&(b.mad - curr_mad).abs()).unwrap())
            .copied()
    }

    /// Updates the CPB/history state after a frame has actually been
    /// encoded, then applies the post-encode skip/rollback decision (spec
    /// section 4.2): past 50% of the CPB, this frame's contribution is
    /// unwound and it is reported back to the caller as skipped; past 95%,
    /// future admissions are throttled until the buffer drains. Returns
    /// `true` when the caller should treat this picture as skipped rather
    /// than ready.
    pub fn update_after_frame(&mut self, qp: u8, bits_produced: u32, mad: f64) -> bool {
        self.first_frame = false;
        if !self.enabled {
            self.qp = qp;
            return false;
        }

        let mad = mad.max(MAD_MIN);
        let bits = bits_produced as f64;

        self.history.push_back(RdSample { qp, bits: bits_produced, mad });
        if self.history.len() > self.frame_range {
            self.history.pop_front();
        }

        self.tmn_w += bits - self.tmn_th;
        self.vbv_fullness += bits - self.bits_per_frame;
        self.sum_qp += qp as f64;
        self.sum_mad += mad;
        self.encoded_frames += 1;
        self.last_mad = mad;
        self.qp = qp;
        self.skip_next_frame = 0;

        if self.vbv_fullness > self.cpb_bits / 2.0 {
            self.tmn_w -= bits - self.tmn_th;
            self.vbv_fullness -= bits;
            self.sum_qp -= qp as f64;
            self.sum_mad -= mad;
            self.encoded_frames -= 1;
            self.history.pop_back();
            self.skip_next_frame = -1;
            log::warn!("rate control: CPB past 50% threshold, rolling back and reporting this frame skipped");
            return true;
        }

        let soft_bound = self.cpb_bits / 2.0 * 0.95;
        if self.vbv_fullness > soft_bound {
            self.skip_next_frame = 1;
            self.vbv_fullness -= self.bits_per_frame;
            while self.vbv_fullness > soft_bound {
                self.skip_next_frame += 1;
                self.vbv_fullness -= self.bits_per_frame;
            }
            log::debug!("rate control: CPB past 95% threshold, throttling next {} frame(s)", self.skip_next_frame);
        }

        false
    }
}

/// Picks a starting QP from a coarse bits-per-pixel table when the host
/// leaves `init_qp` at zero (spec section 4.2).
fn auto_initial_qp(cfg: &EncoderConfig) -> u8 {
    let frame_rate = (cfg.frame_rate_1000 as f64 / 1000.0).max(1.0);
    let bpp = cfg.bitrate as f64 / (frame_rate * cfg.pic_size_in_mbs() as f64 * 256.0);
    let (l1, l2, l3) = if cfg.width == 176 {
        (0.1, 0.3, 0.6)
    } else if cfg.width == 352 {
        (0.2, 0.6, 1.2)
    } else {
        (0.6, 1.4, 2.4)
    };
    if bpp <= l1 {
        35
    } else if bpp <= l2 {
        25
    } else if bpp <= l3 {
        20
    } else {
        15
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConfig;

    #[test]
    fn disabled_rate_control_always_admits() {
        let mut cfg = EncoderConfig::default();
        cfg.rate_control_enabled = false;
        let mut rc = RateController::new(&cfg);
        assert!(rc.admit_frame(0));
        assert!(rc.admit_frame(33_000));
    }

    #[test]
    fn first_frame_is_always_admitted() {
        let mut cfg = EncoderConfig::default();
        cfg.rate_control_enabled = true;
        let mut rc = RateController::new(&cfg);
        assert!(rc.admit_frame(123_456));
    }

    #[test]
    fn late_frame_is_rejected() {
        let mut cfg = EncoderConfig::default();
        cfg.rate_control_enabled = true;
        let mut rc = RateController::new(&cfg);
        assert!(rc.admit_frame(0));
        assert!(rc.admit_frame(100_000));
        // A timestamp before the already-processed frame's slot is late.
        assert!(!rc.admit_frame(1_000));
    }

    #[test]
    fn select_qp_stays_in_range_after_history() {
        let mut cfg = EncoderConfig::default();
        cfg.rate_control_enabled = true;
        let mut rc = RateController::new(&cfg);
        rc.admit_frame(0);
        rc.update_after_frame(28, 4000, 10.0);
        rc.admit_frame(33_000);
        let qp = rc.select_qp(false);
        assert!(qp <= 51);
    }

    #[test]
    fn qp_to_qstep_and_back_round_trips_approximately() {
        let qstep = qp_to_qstep(28);
        let qp = qstep_to_qp(qstep);
        assert_eq!(qp, 28);
    }

    #[test]
    fn grossly_oversized_frame_overruns_and_is_rolled_back() {
        let mut cfg = EncoderConfig::default();
        cfg.rate_control_enabled = true;
        cfg.bitrate = 1;
        cfg.cpb_size = 1;
        let mut rc = RateController::new(&cfg);
        rc.admit_frame(0);
        let skipped = rc.update_after_frame(30, 100_000, 10.0);
        assert!(skipped);
    }
}
