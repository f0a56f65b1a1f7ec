//! Signal masking and process-wide interrupt dispatch.
//!
//! Two cooperating pieces:
//! - [`SignalMasker`]: scoped replacement of the calling thread's blocked
//!   signal mask, used to keep the backing-file write atomic with respect
//!   to INT/HUP/TERM.
//! - the interrupt listener: a process-global LIFO of callbacks run on a
//!   dedicated worker thread when INT/HUP/TERM arrives, so long-running
//!   mutations can clean up deterministically instead of dying mid-write.

mod listener;
mod mask;

pub use listener::{InterruptListenerHandle, LISTENED_SIGNALS, push_interrupt_listener};
pub use mask::SignalMasker;
