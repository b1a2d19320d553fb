//! Host callback interface (spec section 6): the boundary between the
//! encoder and the application embedding it. The original's `alloc`/`free`
//! pair existed because `avcenc_lib.c` had no allocator of its own; this
//! core allocates per-picture scratch (level/run arrays, predicted blocks)
//! with the ordinary Rust allocator instead, per the redesign note in spec
//! section 9, so `alloc`/`free` here are reduced to a permission check the
//! host can use to cap memory use rather than a raw-pointer handoff.
//!
//! `dpb_alloc`/`bind_output`/`unbind_output` keep their original role:
//! letting the host pool reconstructed-picture buffers instead of the
//! encoder allocating them outright. The DPB itself (`dpb::Dpb`) still
//! models the single reference as an owned `Picture`, not a pointer into
//! the host's pool, per the same redesign note; these callbacks are
//! consulted only as an admission gate before a new recon buffer is bound.

pub trait EncoderCallbacks {
    /// Requests `size` bytes of session-scoped scratch. Returns false to
    /// make `Initialize`/`SetInput` fail with `MemoryFail`.
    fn alloc(&mut self, size: usize) -> bool;

    /// Releases a prior `alloc` of `size` bytes. Called in LIFO order at
    /// `Cleanup`, mirroring the original's allocation-callback contract.
    fn free(&mut self, size: usize);

    /// Called once at `Initialize` to size the DPB's reconstructed-picture
    /// pool. `num_buffers` is always 1 for this core (`num_ref_frame=1`
    /// plus the picture currently being reconstructed).
    fn dpb_alloc(&mut self, size_in_mbs: u32, num_buffers: u32) -> bool;

    /// Admission gate consulted before binding a new recon buffer at
    /// `SetInput`. False sends the encoder to `WaitingForBuffer` until the
    /// host calls `unbind_output` to free one up.
    fn bind_output(&mut self, index: u32) -> bool;

    /// The host signals it is done with the recon picture at `index`
    /// (obtained through `Encoder::get_recon`), returning it to the pool.
    fn unbind_output(&mut self, index: u32);
}

/// The default pool for a caller that doesn't need external buffer
/// ownership: every `alloc`/`bind_output` call succeeds unconditionally.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessPool;

impl EncoderCallbacks for InProcessPool {
    fn alloc(&mut self, _size: usize) -> bool {
        true
    }

    fn free(&mut self, _size: usize) {}

    fn dpb_alloc(&mut self, _size_in_mbs: u32, _num_buffers: u32) -> bool {
        true
    }

    fn bind_output(&mut self, _index: u32) -> bool {
        true
    }

    fn unbind_output(&mut self, _index: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_process_pool_always_admits() {
        let mut pool = InProcessPool;
        assert!(pool.alloc(4096));
        assert!(pool.dpb_alloc(99, 1));
        assert!(pool.bind_output(0));
        pool.unbind_output(0);
        pool.free(4096);
    }
}
