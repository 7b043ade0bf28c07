//! The fields of the counter demo.
use pmem_region::{Field, Layout, LayoutError, Persistent, Transient};

pub const COUNTER_INIT: i32 = 23;
pub const SCRATCH_INIT: i32 = 42;

pub struct Counters {
    /// Counts invocations, survives restarts.
    pub counter: Field<i32, Persistent>,
    /// Declared right next to `counter` but outside the region, reset on every start.
    pub scratch: Field<i32, Transient>,
}

pub fn declare() -> Result<(Layout, Counters), LayoutError> {
    let mut builder = Layout::builder();
    let counter = builder.persistent("counter", COUNTER_INIT);
    let scratch = builder.transient("scratch", SCRATCH_INIT);
    Ok((builder.finish()?, Counters { counter, scratch }))
}
