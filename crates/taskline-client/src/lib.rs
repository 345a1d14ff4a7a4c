//! Producer side of taskline: submit invocations, then poll or wait on
//! their execution records.

pub mod blocking;
mod handle;
mod producer;
mod waiter;

pub use blocking::BlockingProducer;
pub use handle::AsyncResult;
pub use producer::{Producer, SubmitOptions};
pub use waiter::ResultWaiter;

pub use taskline_core::{Result, TaskError};
