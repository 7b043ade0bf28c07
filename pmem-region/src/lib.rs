//! A span of process memory whose backing storage is a regular file.
//!
//! The fields of a [`Layout`] are either [`Persistent`], stored inside a page-aligned [`Region`],
//! or [`Transient`], stored in ordinary memory. A [`Store`] reserves the region at startup and is
//! then bound to a file. From that moment on every write to a persistent field is a write to the
//! file, and the next process binding the same file observes it.
//!
//! ```no_run
//! use pmem_region::{Layout, Store};
//!
//! let mut layout = Layout::builder();
//! let runs = layout.persistent::<u32>("runs", 0);
//! let mut store = Store::new(layout.finish()?)?;
//! store.bind("runs.persistent")?;
//!
//! let before = store.update(&runs, |n| n + 1);
//! println!("previously ran {before} times");
//! # Ok::<_, Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Not a database
//!
//! There is no synchronization with the drive beyond what the page cache does on its own, and no
//! recovery from _system crashes_. [`Store::flush`] forces the pages out but does not order
//! writes. Similarly, nothing coordinates processes that bind the same file at the same time;
//! their writes race.
//!
//! The file holds the raw bytes of the region, in native byte order, with no header. Its size
//! snaps to the region size on every bind. Changing the layout between builds thus reinterprets
//! or truncates whatever was persisted before.
#![cfg(unix)]
mod bind;
mod layout;
mod mmap;
mod region;
mod store;

pub mod maps;

extern crate alloc;

pub use bind::BindError;
pub use layout::{
    Declared, Field, Layout, LayoutBuilder, LayoutError, Persistent, Placement, Transient,
    MAX_FIELD_ALIGN,
};
pub use mmap::{MapError, Mapper, VTable};
pub use region::{region_len, Region, Report};
pub use store::Store;
