//! Scoped signal masking for the calling thread.

use std::marker::PhantomData;

use nix::sys::signal::{SigSet, SigmaskHow, pthread_sigmask};

/// Replaces the calling thread's blocked-signal mask for the lifetime of
/// the value.
///
/// Construction atomically installs the given set as the thread's mask and
/// remembers the prior mask; dropping the value restores it. The data
/// viewer wraps its truncate+serialize+write sequence in a masker so that a
/// terminal SIGINT cannot land between the truncate call and the last byte
/// written, which would leave the backing file unparseable.
///
/// A failed sigmask syscall is a panic: a transaction that cannot control
/// signal delivery must not proceed to the write.
pub struct SignalMasker {
    prior_mask: SigSet,
    // The mask is thread state; the guard must not leave its thread.
    _not_send: PhantomData<*const ()>,
}

impl SignalMasker {
    /// Block exactly the signals in `set` until the returned value is dropped.
    pub fn block(set: &SigSet) -> Self {
        let mut prior_mask = SigSet::empty();
        if let Err(errno) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(set), Some(&mut prior_mask))
        {
            panic!("pthread_sigmask(SIG_SETMASK) failed: {errno}");
        }
        SignalMasker {
            prior_mask,
            _not_send: PhantomData,
        }
    }

    /// Block every maskable signal.
    pub fn block_all() -> Self {
        Self::block(&SigSet::all())
    }
}

impl Drop for SignalMasker {
    fn drop(&mut self) {
        if let Err(errno) =
            pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.prior_mask), None)
        {
            panic!("pthread_sigmask(SIG_SETMASK) restore failed: {errno}");
        }
    }
}
