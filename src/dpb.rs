//! Decoded picture buffer: this core keeps exactly one short-term
//! reference picture (`num_ref_frame` is validated to 1 at `Initialize`
//! time, spec section 4.1), so the DPB's job reduces to holding that one
//! padded reference and swapping it in once the current picture's
//! reconstruction is deblocked.

use crate::config::EncoderConfig;
use crate::frame::Picture;

#[derive(Debug)]
pub struct Dpb {
    reference: Option<Picture>,
}

impl Dpb {
    pub fn new(_cfg: &EncoderConfig) -> Self {
        Dpb { reference: None }
    }

    pub fn reference(&self) -> Option<&Picture> {
        self.reference.as_ref()
    }

    /// Replaces the single reference slot; called after a picture's
    /// deblocked reconstruction has had its borders extended, if the
    /// picture is itself a reference (`is_reference` from `InputFrame`, or
    /// always true for IDR).
    pub fn store(&mut self, picture: Picture) {
        self.reference = Some(picture);
    }

    /// An IDR picture discards any prior reference before it is itself
    /// stored as the new one.
    pub fn reset(&mut self) {
        self.reference = None;
    }

    pub fn is_empty(&self) -> bool {
        self.reference.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let cfg = EncoderConfig::default();
        let dpb = Dpb::new(&cfg);
        assert!(dpb.is_empty());
    }

    #[test]
    fn store_then_reset_clears_reference() {
        let cfg = EncoderConfig::default();
        let mut dpb = Dpb::new(&cfg);
        dpb.store(Picture::new(&cfg));
        assert!(!dpb.is_empty());
        dpb.reset();
        assert!(dpb.is_empty());
    }
}
