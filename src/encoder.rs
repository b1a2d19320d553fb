//! Top-level orchestrator: the public operations (`initialize`,
//! `set_input`, `encode_nal`, `get_recon`, `cleanup`) and the state machine
//! that drives one frame through analyze -> slice-encode -> deblock ->
//! DPB-store (spec section 4.1), wiring together every other module in
//! this crate.
//!
//! The analysis pass (motion estimation over every MB) and the slice
//! encoding pass are kept as two separately named spec states
//! (`AnalyzingFrame`/`EncodingFrame`) but are implemented as a single
//! combined per-MB pass inside `slice_encoder::encode_slice_data`, since
//! this core only ever emits one slice per picture: there is no benefit to
//! splitting "decide every MB's mode" from "write every MB's bits" across
//! two orchestrator states when both run to completion inside one
//! `EncodeNAL(Encoding_Frame)` call.

use crate::callbacks::EncoderCallbacks;
use crate::config::{EncoderConfig, ParamSetMode};
use crate::deblock::{deblock_picture, DeblockParams};
use crate::dpb::Dpb;
use crate::error::{EncError, EncodeStatus, Result};
use crate::frame::{InputFrame, Picture};
use crate::header;
use crate::macroblock::MacroblockGrid;
use crate::motion_est::{self, SearchParams};
use crate::nal::NalUnitType;
use crate::poc::PocState;
use crate::pps::Pps;
use crate::ratecontrol::RateController;
use crate::slice::SliceType;
use crate::slice_encoder::{encode_slice_data, SliceEncodeContext};
use crate::sps::Sps;
use crate::bitwriter::BitWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    EncodingSps,
    EncodingPps,
    AnalyzingFrame,
    EncodingFrame,
    WaitingForBuffer,
}

/// The admitted, not-yet-fully-coded picture: built at `SetInput`, consumed
/// across one or more `EncodeNAL` calls, torn down once its last slice's
/// `PictureReady` fires.
struct PendingFrame {
    input: Picture,
    recon: Picture,
    is_idr: bool,
    slice_type: SliceType,
    frame_num: u32,
    poc_lsb: u32,
    qp: u8,
    /// Per-MB "intra search required" flags from the scene-change analysis
    /// pass (spec section 4.3), overlaid with the raster-scan intra-refresh
    /// window at `EncodeNAL` time.
    force_intra: Vec<bool>,
}

/// One encoding session. Generic over the host callback implementation;
/// `Encoder<InProcessPool>` is the common case of a caller with no external
/// buffer pool.
pub struct Encoder<C: EncoderCallbacks = crate::callbacks::InProcessPool> {
    cfg: EncoderConfig,
    state: State,
    sps: Sps,
    pps: Pps,
    poc: PocState,
    dpb: Dpb,
    rate: RateController,
    callbacks: C,
    idr_pic_id: u32,
    frames_since_idr: i32,
    first_picture: bool,
    intra_refresh_cursor: u32,
    /// Frame-average Average Boundary Error of the previously admitted
    /// frame, compared against each new frame's average by
    /// `motion_est::is_scene_change` to drive I/IDR promotion.
    prev_avg_abe: u32,
    pending: Option<PendingFrame>,
    grid: Option<MacroblockGrid>,
}

impl<C: EncoderCallbacks> Encoder<C> {
    /// Validates `cfg` against spec section 4.1's rule set, allocates the
    /// DPB pool through `callbacks`, builds the session's SPS/PPS, and
    /// enters `EncodingSps` (`ParamSetMode::Inline`) or `AnalyzingFrame`
    /// (`ParamSetMode::OutOfBand`, where the host fetches `sps_nal`/
    /// `pps_nal` directly instead of through `encode_nal`).
    pub fn initialize(cfg: EncoderConfig, mut callbacks: C) -> Result<Self> {
        cfg.validate()?;
        if !callbacks.dpb_alloc(cfg.pic_size_in_mbs(), cfg.num_ref_frame as u32) {
            return Err(EncError::MemoryFail);
        }

        let (sps, pps) = header::build_param_sets(&cfg);
        let log2_max_frame_num = sps.log2_max_frame_num_minus4 as u8 + 4;
        let poc = PocState::new(cfg.poc_type.clone(), log2_max_frame_num);
        let rate = RateController::new(&cfg);
        let dpb = Dpb::new(&cfg);

        let state = match cfg.param_set_mode {
            ParamSetMode::Inline => State::EncodingSps,
            ParamSetMode::OutOfBand => State::AnalyzingFrame,
        };

        log::debug!("encoder initialized: {}x{}, {:?}", cfg.width, cfg.height, cfg.param_set_mode);

        Ok(Encoder {
            cfg,
            state,
            sps,
            pps,
            poc,
            dpb,
            rate,
            callbacks,
            idr_pic_id: 0,
            frames_since_idr: 0,
            first_picture: true,
            intra_refresh_cursor: 0,
            prev_avg_abe: 0,
            pending: None,
            grid: None,
        })
    }

    /// Fetches the SPS NAL directly, for `ParamSetMode::OutOfBand` hosts
    /// that deliver parameter sets through a channel other than the NAL
    /// stream (spec section 4.1's "out-of-band" branch).
    pub fn sps_nal(&self) -> Result<Vec<u8>> {
        header::encode_sps_nal(&self.sps)
    }

    pub fn pps_nal(&self) -> Result<Vec<u8>> {
        header::encode_pps_nal(&self.pps)
    }

    /// Admits one input frame (spec section 4.1's `SetInput`): rate
    /// control may decline it (`SkippedPicture`), otherwise frame_num/POC
    /// are assigned, IDR periodicity is decided, and the picture is
    /// prepared for `EncodeNAL`.
    pub fn set_input(&mut self, frame: InputFrame) -> Result<EncodeStatus> {
        if !matches!(self.state, State::AnalyzingFrame | State::WaitingForBuffer) {
            return Err(EncError::WrongState);
        }

        if !self.rate.admit_frame(frame.timestamp_us) {
            log::trace!("rate control declined frame {}", frame.disp_order);
            return Ok(EncodeStatus::SkippedPicture);
        }

        if !self.callbacks.bind_output(0) {
            self.state = State::WaitingForBuffer;
            log::trace!("no recon buffer available, waiting");
            return Ok(EncodeStatus::SkippedPicture);
        }

        let mut input_pic = Picture::new(&self.cfg);
        input_pic.copy_from_input(&frame.luma, frame.luma_pitch, &frame.cb, &frame.cr, frame.chroma_pitch);
        input_pic.disp_order = frame.disp_order;
        input_pic.id = frame.id;
        input_pic.extend_borders();

        let is_periodic_idr = self.cfg.idr_period >= 0 && self.frames_since_idr >= self.cfg.idr_period;

        // Scene-change analysis (spec section 4.3): a cheap zero-motion ABE
        // pass over every MB against the current reference picture, both to
        // flag individual MBs that can't beat intra coding and to promote
        // the whole frame to an I/IDR slice when the frame-average ABE
        // jumps relative to the previous frame's.
        let mut force_intra = vec![false; self.cfg.pic_size_in_mbs() as usize];
        let mut scene_change = false;
        if !self.first_picture && !is_periodic_idr {
            if let Some(reference) = self.dpb.reference() {
                let (flags, avg_abe) = motion_est::analyze_frame_abe(self.cfg.mb_width(), self.cfg.mb_height(), &input_pic.luma, &reference.luma);
                scene_change = motion_est::is_scene_change(avg_abe, self.prev_avg_abe);
                self.prev_avg_abe = avg_abe;
                force_intra = flags;
            }
        }

        let is_idr = self.first_picture || is_periodic_idr || scene_change;
        let is_ref = true;

        let (poc_lsb, poc) = self.poc.derive(is_idr, is_ref)?;
        let qp = self.rate.select_qp(is_idr);

        log::debug!(
            "admitted frame disp_order={} is_idr={} scene_change={} qp={} poc={}",
            frame.disp_order, is_idr, scene_change, qp, poc
        );

        input_pic.is_reference = is_ref;

        let recon_pic = Picture::new(&self.cfg);

        if is_idr {
            self.dpb.reset();
            self.idr_pic_id = (self.idr_pic_id + 1) % 65536;
            self.frames_since_idr = 0;
            self.prev_avg_abe = 0;
        } else {
            self.frames_since_idr += 1;
        }

        let slice_type = if is_idr { SliceType::I } else { SliceType::P };
        let frame_num = self.poc.frame_num();

        self.pending = Some(PendingFrame {
            input: input_pic,
            recon: recon_pic,
            is_idr,
            slice_type,
            frame_num,
            poc_lsb,
            qp,
            force_intra,
        });
        self.grid = Some(MacroblockGrid::new(self.cfg.mb_width(), self.cfg.mb_height()));

        let emit_inline = matches!(self.cfg.param_set_mode, ParamSetMode::Inline) && header::should_emit_param_sets(&self.cfg, is_idr, self.first_picture);

        self.first_picture = false;
        self.state = if emit_inline { State::EncodingSps } else { State::EncodingFrame };

        if is_idr {
            Ok(EncodeStatus::NewIdr)
        } else {
            Ok(EncodeStatus::Ok)
        }
    }

    /// Writes one NAL unit (spec section 4.1's `EncodeNAL`): one SPS, one
    /// PPS, or the current picture's one slice, dispatched on state.
    pub fn encode_nal(&mut self) -> Result<(Vec<u8>, EncodeStatus)> {
        match self.state {
            State::EncodingSps => {
                let nal = header::encode_sps_nal(&self.sps)?;
                self.state = State::EncodingPps;
                Ok((nal, EncodeStatus::Ok))
            }
            State::EncodingPps => {
                let nal = header::encode_pps_nal(&self.pps)?;
                self.state = State::EncodingFrame;
                Ok((nal, EncodeStatus::Ok))
            }
            State::EncodingFrame => self.encode_slice_nal(),
            State::AnalyzingFrame | State::WaitingForBuffer => Err(EncError::WrongState),
        }
    }

    fn encode_slice_nal(&mut self) -> Result<(Vec<u8>, EncodeStatus)> {
        let (is_idr, slice_type, frame_num, poc_lsb, qp, mut force_intra) = {
            let pending = self.pending.as_ref().ok_or(EncError::WrongState)?;
            (pending.is_idr, pending.slice_type, pending.frame_num, pending.poc_lsb, pending.qp, pending.force_intra.clone())
        };

        // Raster-scan intra refresh (spec section 4.4): overlay this
        // frame's forced-intra window from the cursor the previous frame
        // left behind, independent of the scene-change flags above.
        if self.cfg.intra_mb_refresh > 0 {
            let total = self.cfg.pic_size_in_mbs();
            for i in 0..self.cfg.intra_mb_refresh {
                let addr = (self.intra_refresh_cursor + i) % total.max(1);
                if let Some(slot) = force_intra.get_mut(addr as usize) {
                    *slot = true;
                }
            }
        }

        let slice_header = header::build_slice_header(is_idr, slice_type, &self.pps, frame_num, self.idr_pic_id, poc_lsb, qp, &self.cfg);

        let cap = if self.cfg.use_overrun_buffer { None } else { Some(self.cfg.pic_size_in_mbs() as usize * 256) };
        let mut w = BitWriter::new(cap);
        let nal_type = if is_idr { NalUnitType::IdrSlice } else { NalUnitType::NonIdrSlice };
        slice_header.encode(&mut w, nal_type, &self.sps, &self.pps)?;

        let search_params = SearchParams {
            search_range: 16,
            lambda_motion: lambda_motion_from_qp(qp),
            max_v_mv_r: self.cfg.level.max_v_mv_r(),
        };

        let pending = self.pending.as_mut().ok_or(EncError::WrongState)?;
        let grid = self.grid.as_mut().ok_or(EncError::WrongState)?;

        let ctx = SliceEncodeContext {
            sps: &self.sps,
            pps: &self.pps,
            header: &slice_header,
            reference: self.dpb.reference(),
            search_params,
            qp,
            force_intra: &force_intra,
        };

        if let Err(e) = encode_slice_data(&mut w, &ctx, &pending.input, &mut pending.recon, grid) {
            log::warn!("slice encode failed: {e}");
            return Err(e);
        }

        let mad = mean_abs_diff(&pending.input, &pending.recon);
        let ref_idc = 1u8;
        let nal = header::finish_slice_nal(w, is_idr, ref_idc)?;

        let deblock_params = DeblockParams {
            disable_idc: self.cfg.disable_deblocking_idc,
            alpha_offset_div2: self.cfg.alpha_offset,
            beta_offset_div2: self.cfg.beta_offset,
        };
        deblock_picture(&mut pending.recon, grid, &deblock_params);
        pending.recon.extend_borders();

        let bits_produced = (nal.len() as u32) * 8;
        let rolled_back = self.rate.update_after_frame(qp, bits_produced, mad);
        log::debug!("picture ready: {} bits, mad={:.2}, rolled_back={}", bits_produced, mad, rolled_back);

        let finished = self.pending.take().expect("pending frame checked above");
        self.dpb.store(finished.recon);
        self.poc.advance_frame_num();
        self.grid = None;
        self.state = State::AnalyzingFrame;
        self.advance_intra_refresh_cursor();

        let status = if rolled_back { EncodeStatus::SkippedPicture } else { EncodeStatus::PictureReady };
        Ok((nal, status))
    }

    fn advance_intra_refresh_cursor(&mut self) {
        if self.cfg.intra_mb_refresh == 0 {
            return;
        }
        self.intra_refresh_cursor = (self.intra_refresh_cursor + self.cfg.intra_mb_refresh) % self.cfg.pic_size_in_mbs().max(1);
    }

    /// The most recently deblocked, stored reconstructed picture, once
    /// `encode_nal` has returned `PictureReady`.
    pub fn get_recon(&self) -> Option<&Picture> {
        self.dpb.reference()
    }

    /// The host is done with the current recon buffer; lets
    /// `WaitingForBuffer` progress back to `AnalyzingFrame`.
    pub fn release_recon(&mut self) {
        self.callbacks.unbind_output(0);
        if self.state == State::WaitingForBuffer {
            self.state = State::AnalyzingFrame;
        }
    }

    /// Releases every allocated buffer in LIFO order and consumes the
    /// handle (spec section 4.1's `Cleanup`); Rust's ownership model makes
    /// the "zeroes the handle" half of the contract automatic.
    pub fn cleanup(mut self) {
        self.callbacks.unbind_output(0);
        self.callbacks.free(0);
    }
}

/// `LambdaMotionSAD`, the de facto reference-software formula for the
/// Lagrangian multiplier `search_motion` weights prediction-delta bits
/// against: `sqrt(0.85 * 2^((QP-12)/3))`.
fn lambda_motion_from_qp(qp: u8) -> u32 {
    let lambda = (0.85_f64 * 2f64.powf((qp as f64 - 12.0) / 3.0)).sqrt();
    lambda.round().max(1.0) as u32
}

/// Mean absolute luma difference between the source and its (pre-deblock)
/// reconstruction, the rate controller's MAD complexity term.
fn mean_abs_diff(input: &Picture, recon: &Picture) -> f64 {
    let w = input.luma.width;
    let h = input.luma.height;
    if w == 0 || h == 0 {
        return 0.0;
    }
    let mut total: u64 = 0;
    for y in 0..h as isize {
        for x in 0..w as isize {
            total += (input.luma.get(x, y) as i32 - recon.luma.get(x, y) as i32).unsigned_abs() as u64;
        }
    }
    total as f64 / (w * h) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::InProcessPool;

    fn solid_frame(cfg: &EncoderConfig, luma_val: u8, chroma_val: u8, disp_order: u32) -> InputFrame {
        let luma = vec![luma_val; cfg.width as usize * cfg.height as usize];
        let chroma = vec![chroma_val; (cfg.width as usize / 2) * (cfg.height as usize / 2)];
        InputFrame {
            luma,
            cb: chroma.clone(),
            cr: chroma,
            luma_pitch: cfg.width as usize,
            chroma_pitch: cfg.width as usize / 2,
            timestamp_us: disp_order as i64 * 1_000_000,
            disp_order,
            id: disp_order,
            is_reference: true,
        }
    }

    #[test]
    fn first_frame_emits_sps_then_pps_then_idr_slice() {
        let mut cfg = EncoderConfig::default();
        cfg.width = 32;
        cfg.height = 16;
        cfg.param_set_mode = ParamSetMode::Inline;
        let mut enc = Encoder::initialize(cfg.clone(), InProcessPool).unwrap();

        let status = enc.set_input(solid_frame(&cfg, 128, 128, 0)).unwrap();
        assert_eq!(status, EncodeStatus::NewIdr);

        let (sps_nal, status) = enc.encode_nal().unwrap();
        assert_eq!(status, EncodeStatus::Ok);
        assert_eq!(sps_nal[4] & 0x1f, NalUnitType::Sps.as_u8());

        let (pps_nal, status) = enc.encode_nal().unwrap();
        assert_eq!(status, EncodeStatus::Ok);
        assert_eq!(pps_nal[4] & 0x1f, NalUnitType::Pps.as_u8());

        let (slice_nal, status) = enc.encode_nal().unwrap();
        assert_eq!(status, EncodeStatus::PictureReady);
        assert_eq!(slice_nal[4] & 0x1f, NalUnitType::IdrSlice.as_u8());
        assert!(enc.get_recon().is_some());
    }

    #[test]
    fn out_of_band_mode_skips_inline_param_sets() {
        let mut cfg = EncoderConfig::default();
        cfg.width = 32;
        cfg.height = 16;
        cfg.param_set_mode = ParamSetMode::OutOfBand;
        let mut enc = Encoder::initialize(cfg.clone(), InProcessPool).unwrap();

        enc.set_input(solid_frame(&cfg, 128, 128, 0)).unwrap();
        let (slice_nal, status) = enc.encode_nal().unwrap();
        assert_eq!(status, EncodeStatus::PictureReady);
        assert_eq!(slice_nal[4] & 0x1f, NalUnitType::IdrSlice.as_u8());
    }

    #[test]
    fn encode_nal_before_set_input_is_wrong_state() {
        let mut cfg = EncoderConfig::default();
        cfg.width = 32;
        cfg.height = 16;
        let mut enc = Encoder::initialize(cfg, InProcessPool).unwrap();
        assert_eq!(enc.encode_nal().unwrap_err(), EncError::WrongState);
    }

    #[test]
    fn second_admitted_frame_is_a_p_slice() {
        let mut cfg = EncoderConfig::default();
        cfg.width = 32;
        cfg.height = 16;
        cfg.idr_period = 100;
        let mut enc = Encoder::initialize(cfg.clone(), InProcessPool).unwrap();

        enc.set_input(solid_frame(&cfg, 128, 128, 0)).unwrap();
        while enc.encode_nal().unwrap().1 != EncodeStatus::PictureReady {}

        let status = enc.set_input(solid_frame(&cfg, 130, 128, 1)).unwrap();
        assert_eq!(status, EncodeStatus::Ok);
        let (slice_nal, status) = enc.encode_nal().unwrap();
        assert_eq!(status, EncodeStatus::PictureReady);
        assert_eq!(slice_nal[4] & 0x1f, NalUnitType::NonIdrSlice.as_u8());
    }
}
