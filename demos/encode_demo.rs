//! Encodes a short synthetic sequence (a solid frame, then a few frames of
//! horizontal scrolling bars) to an Annex-B bytestream on stdout, printing
//! a one-line progress report per NAL to stderr.
//!
//! Run with: `cargo run --example encode_demo > out.264`

use std::io::{self, Write};

use avc_baseline_enc::callbacks::InProcessPool;
use avc_baseline_enc::encoder::Encoder;
use avc_baseline_enc::{EncodeStatus, EncoderConfig, InputFrame};

const WIDTH: u32 = 176;
const HEIGHT: u32 = 144;
const FRAME_COUNT: u32 = 15;

fn synthetic_frame(disp_order: u32) -> InputFrame {
    let w = WIDTH as usize;
    let h = HEIGHT as usize;
    let mut luma = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let phase = (x + disp_order as usize * 4) % w;
            luma[y * w + x] = if phase < w / 2 { 90 } else { 180 };
        }
    }
    let chroma = vec![128u8; (w / 2) * (h / 2)];

    InputFrame {
        luma,
        cb: chroma.clone(),
        cr: chroma,
        luma_pitch: w,
        chroma_pitch: w / 2,
        timestamp_us: disp_order as i64 * 33_367,
        disp_order,
        id: disp_order,
        is_reference: true,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut cfg = EncoderConfig::default();
    cfg.width = WIDTH;
    cfg.height = HEIGHT;
    cfg.bitrate = 256_000;
    cfg.frame_rate_1000 = 30_000;
    cfg.idr_period = 10;

    let mut enc = Encoder::initialize(cfg, InProcessPool)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for disp_order in 0..FRAME_COUNT {
        let status = enc.set_input(synthetic_frame(disp_order))?;
        if status == EncodeStatus::SkippedPicture {
            eprintln!("frame {disp_order}: skipped by rate control");
            continue;
        }

        loop {
            let (nal, status) = enc.encode_nal()?;
            out.write_all(&nal)?;
            eprintln!("frame {disp_order}: wrote {} bytes, status {:?}", nal.len(), status);
            if status == EncodeStatus::PictureReady {
                break;
            }
        }
    }

    Ok(())
}
