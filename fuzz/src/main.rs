use afl::*;

use avc_baseline_enc::callbacks::InProcessPool;
use avc_baseline_enc::encoder::Encoder;
use avc_baseline_enc::{EncodeStatus, EncoderConfig, InputFrame};

/// Feeds fuzzer bytes as two macroblock-aligned planar frames and drives
/// the encoder's public operations end to end, making sure nothing panics
/// regardless of how adversarial the pixel content is.
fn main() {
    fuzz!(|data: &[u8]| {
        if data.len() < 2 {
            return;
        }

        let mb_w = 1 + (data[0] % 4) as u32;
        let mb_h = 1 + (data[1] % 4) as u32;
        let mut cfg = EncoderConfig::default();
        cfg.width = mb_w * 16;
        cfg.height = mb_h * 16;
        cfg.idr_period = 2;

        let mut enc = match Encoder::initialize(cfg.clone(), InProcessPool) {
            Ok(enc) => enc,
            Err(_) => return,
        };

        let luma_len = cfg.width as usize * cfg.height as usize;
        let chroma_len = (cfg.width as usize / 2) * (cfg.height as usize / 2);
        let rest = &data[2..];

        for (i, chunk_start) in (0..rest.len().max(1)).step_by((luma_len + 2 * chroma_len).max(1)).take(2).enumerate() {
            let take_byte = |offset: usize| -> u8 { rest.get(chunk_start + offset).copied().unwrap_or(0) };

            let luma: Vec<u8> = (0..luma_len).map(take_byte).collect();
            let cb: Vec<u8> = (0..chroma_len).map(|o| take_byte(luma_len + o)).collect();
            let cr: Vec<u8> = (0..chroma_len).map(|o| take_byte(luma_len + chroma_len + o)).collect();

            let frame = InputFrame {
                luma,
                cb,
                cr,
                luma_pitch: cfg.width as usize,
                chroma_pitch: cfg.width as usize / 2,
                timestamp_us: i as i64 * 33_000,
                disp_order: i as u32,
                id: i as u32,
                is_reference: true,
            };

            let status = match enc.set_input(frame) {
                Ok(s) => s,
                Err(_) => return,
            };
            if status == EncodeStatus::SkippedPicture {
                continue;
            }

            loop {
                match enc.encode_nal() {
                    Ok((_, EncodeStatus::PictureReady)) => break,
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
        }
    })
}
