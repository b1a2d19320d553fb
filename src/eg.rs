//! Exp-Golomb codeNum coding: `ue(v)`, `se(v)`, `te(v)`, `me(v)` per subclause
//! 9.1. Reads go through `BitReader` (used only when parsing a caller-supplied
//! external SPS/PPS); writes go straight to a `BitWriter`, the way the
//! original's `ue_v`/`se_v`/`te_v` (`vlc_encode.cpp`) take the bitstream
//! object directly instead of building an intermediate bit vector.

use crate::bitreader::BitReader;
use crate::bitwriter::BitWriter;
use crate::error::{EncError, Result};

pub fn read_ue(reader: &mut BitReader) -> Result<u32> {
    let mut leading_zeros = 0;

    while !reader.read_bit()? {
        leading_zeros += 1;
        if leading_zeros > 31 {
            return Err(EncError::Fail);
        }
    }

    if leading_zeros == 0 {
        return Ok(0);
    }

    let code_value = reader.read_bits(leading_zeros)?;
    Ok((1 << leading_zeros) - 1 + code_value)
}

pub fn read_se(reader: &mut BitReader) -> Result<i32> {
    let code_num = read_ue(reader)?;
    se_from_code_num(code_num)
}

pub fn se_from_code_num(code_num: u32) -> Result<i32> {
    if code_num == 0 {
        Ok(0)
    } else if code_num & 1 == 1 {
        Ok(((code_num + 1) >> 1) as i32)
    } else {
        Ok(-((code_num >> 1) as i32))
    }
}

pub fn read_me(reader: &mut BitReader, chroma_format_idc: u8) -> Result<u32> {
    match chroma_format_idc {
        1 | 2 => {
            let code_num = read_ue(reader)?;
            if code_num > 2 {
                return Err(EncError::Fail);
            }
            Ok(code_num)
        }
        _ => read_ue(reader),
    }
}

pub fn read_te(reader: &mut BitReader, max_value: u32) -> Result<u32> {
    if max_value == 0 {
        return Ok(0);
    }

    if max_value == 1 {
        let bit = reader.read_bit()?;
        return Ok(1 - bit as u32);
    }

    read_ue(reader)
}

/// `ue(v)`: writes `codeNum` directly, same leading-zero-prefix construction
/// as `SetEGBitstring` in the original (computed here via `leading_zeros()`
/// rather than a `while` search loop, but bit-for-bit identical output).
pub fn write_ue(w: &mut BitWriter, value: u32) -> Result<()> {
    let code_num = value + 1;
    let num_bits = 32 - code_num.leading_zeros();
    w.write_bits(num_bits - 1, 0)?;
    w.write_bits(num_bits, code_num)
}

/// `se(v)`: maps a signed value to `codeNum` per Table 9-3 then emits it as
/// `ue(v)`, mirroring `se_v`.
pub fn write_se(w: &mut BitWriter, value: i32) -> Result<()> {
    let code_num = if value <= 0 {
        (-value as u32) * 2
    } else {
        (value as u32) * 2 - 1
    };
    write_ue(w, code_num)
}

/// `te(v)`: a single inverted bit when `range == 1`, otherwise `ue(v)`.
pub fn write_te(w: &mut BitWriter, value: u32, range: u32) -> Result<()> {
    if range > 1 {
        write_ue(w, value)
    } else {
        w.write_bit(value == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_ue() {
        let data = vec![0b10100000];
        let mut reader = BitReader::new(&data);
        assert_eq!(read_ue(&mut reader).unwrap(), 0);

        let data = vec![0b01010000];
        let mut reader = BitReader::new(&data);
        assert_eq!(read_ue(&mut reader).unwrap(), 1);

        let data = vec![0b00101100];
        let mut reader = BitReader::new(&data);
        assert_eq!(read_ue(&mut reader).unwrap(), 4);
    }

    #[test]
    fn write_then_read_round_trips() {
        for value in [0u32, 1, 2, 3, 4, 13, 255, 1000] {
            let mut w = BitWriter::new(None);
            write_ue(&mut w, value).unwrap();
            w.rbsp_trailing_bits().unwrap();
            let bytes = w.into_bytes();
            let mut r = BitReader::new(&bytes);
            assert_eq!(read_ue(&mut r).unwrap(), value);
        }
    }

    #[test]
    fn write_se_then_read_round_trips() {
        for value in [0i32, 1, -1, 2, -2, 25, -26] {
            let mut w = BitWriter::new(None);
            write_se(&mut w, value).unwrap();
            w.rbsp_trailing_bits().unwrap();
            let bytes = w.into_bytes();
            let mut r = BitReader::new(&bytes);
            assert_eq!(read_se(&mut r).unwrap(), value);
        }
    }

    #[test]
    fn write_ue_matches_known_codes() {
        let mut w = BitWriter::new(None);
        write_ue(&mut w, 0).unwrap();
        write_ue(&mut w, 1).unwrap();
        write_ue(&mut w, 2).unwrap();
        w.rbsp_trailing_bits().unwrap();
        // ue(0)=1, ue(1)=010, ue(2)=011 -> bits: 1 010 011 1(stop)
        assert_eq!(w.as_bytes(), &[0b10100111]);
    }
}
