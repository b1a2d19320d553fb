// tests/proptests.rs
#![allow(clippy::needless_return)]

use avc_baseline_enc::callbacks::InProcessPool;
use avc_baseline_enc::encoder::Encoder;
use avc_baseline_enc::eg::{read_se, read_ue, write_se, write_ue};
use avc_baseline_enc::bitreader::BitReader;
use avc_baseline_enc::bitwriter::BitWriter;
use avc_baseline_enc::{EncodeStatus, EncoderConfig, InputFrame};
use proptest::prelude::*;

fn tiny_config(width: u32, height: u32) -> EncoderConfig {
    let mut cfg = EncoderConfig::default();
    cfg.width = width;
    cfg.height = height;
    cfg.idr_period = -1;
    cfg.rate_control_enabled = false;
    cfg
}

fn frame_of(cfg: &EncoderConfig, luma: u8, disp_order: u32) -> InputFrame {
    InputFrame {
        luma: vec![luma; cfg.width as usize * cfg.height as usize],
        cb: vec![128; (cfg.width as usize / 2) * (cfg.height as usize / 2)],
        cr: vec![128; (cfg.width as usize / 2) * (cfg.height as usize / 2)],
        luma_pitch: cfg.width as usize,
        chroma_pitch: cfg.width as usize / 2,
        timestamp_us: 0,
        disp_order,
        id: disp_order,
        is_reference: true,
    }
}

fn drain_one_picture(enc: &mut Encoder<InProcessPool>) -> usize {
    let mut total_bytes = 0;
    loop {
        let (nal, status) = enc.encode_nal().unwrap();
        total_bytes += nal.len();
        if status == EncodeStatus::PictureReady {
            break;
        }
    }
    total_bytes
}

proptest! {
    /// Exp-Golomb unsigned codeNum round-trips for any value a 21-bit field
    /// could realistically carry (motion vectors, levels, QP deltas).
    #[test]
    fn ue_round_trips(v in 0u32..=1_000_000) {
        let mut w = BitWriter::new(None);
        write_ue(&mut w, v).unwrap();
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        let back = read_ue(&mut r).unwrap();
        prop_assert_eq!(v, back);
    }

    #[test]
    fn se_round_trips(v in -500_000i32..=500_000) {
        let mut w = BitWriter::new(None);
        write_se(&mut w, v).unwrap();
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        let back = read_se(&mut r).unwrap();
        prop_assert_eq!(v, back);
    }

    /// Every admitted frame (any solid luma level) yields exactly one
    /// `PictureReady` with a nonzero byte count: a slice is never empty.
    #[test]
    fn any_solid_frame_yields_a_nonempty_slice(luma in 0u8..=255) {
        let cfg = tiny_config(32, 32);
        let mut enc = Encoder::initialize(cfg.clone(), InProcessPool).unwrap();
        enc.set_input(frame_of(&cfg, luma, 0)).unwrap();
        let bytes = drain_one_picture(&mut enc);
        prop_assert!(bytes > 0);
    }

    /// Scene-change inputs (frame 1 offset from frame 0 by an arbitrary
    /// delta) never panic and still complete a picture.
    #[test]
    fn scene_change_deltas_never_panic(delta in -100i16..=100) {
        let cfg = tiny_config(32, 32);
        let mut enc = Encoder::initialize(cfg.clone(), InProcessPool).unwrap();
        enc.set_input(frame_of(&cfg, 128, 0)).unwrap();
        drain_one_picture(&mut enc);

        let second_luma = (128i16 + delta).clamp(0, 255) as u8;
        enc.set_input(frame_of(&cfg, second_luma, 1)).unwrap();
        let bytes = drain_one_picture(&mut enc);
        prop_assert!(bytes > 0);
    }
}
