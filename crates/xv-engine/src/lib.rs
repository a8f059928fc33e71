//! xv-engine: the work pipeline
//!
//! A [`Tap`] produces [`WorkUnit`]s on a bounded queue; the [`Engine`] runs a
//! fixed pool of workers that pull units, drive the cipher codec and invoke
//! the unit's completion callback. Back-pressure on the queue is the flow
//! control between producers and workers.

mod engine;
mod stream;
mod tap;
mod task;
mod work_unit;

pub use engine::Engine;
pub use tap::Tap;
pub use task::Task;
pub use work_unit::{Callback, WorkUnit};
