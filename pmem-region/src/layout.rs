//! Declares the fields that live inside and next to a region.
//!
//! A field is addressed by its byte offset and its type. The offsets of persistent fields are
//! assigned in declaration order and aligned to the field type, exactly like the members of a
//! `#[repr(C)]` struct, so the backing file holds the fields at the same offsets as memory does.
use alloc::{string::String, vec::Vec};
use core::marker::PhantomData;
use core::ops::Range;

use bytemuck::Pod;

/// The largest alignment a field may request. No supported platform has smaller pages.
pub const MAX_FIELD_ALIGN: usize = 4096;

/// Marker for fields stored inside the region. Their values survive a restart once bound.
pub enum Persistent {}

/// Marker for fields stored outside the region. They are reset on every start.
pub enum Transient {}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Persistent {}
    impl Sealed for super::Transient {}
}

/// Where the storage of a field lives, see [`Persistent`] and [`Transient`].
pub trait Placement: sealed::Sealed {
    const PERSISTENT: bool;
}

impl Placement for Persistent {
    const PERSISTENT: bool = true;
}

impl Placement for Transient {
    const PERSISTENT: bool = false;
}

/// A typed handle to a declared field.
///
/// The handle is only an offset; the value is accessed through the `Store` created from the same
/// layout.
pub struct Field<T, P> {
    offset: usize,
    _marker: PhantomData<(fn() -> T, P)>,
}

/// Information about one declared field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Declared {
    pub name: String,
    pub offset: usize,
    pub len: usize,
    pub align: usize,
    pub persistent: bool,
}

/// The complete set of fields and their initial values.
#[derive(Clone, Debug, Default)]
pub struct Layout {
    fields: Vec<Declared>,
    persistent: Vec<u8>,
    transient: Vec<u8>,
}

#[derive(Default)]
pub struct LayoutBuilder {
    layout: Layout,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayoutError {
    /// Two fields were declared with the same name.
    DuplicateName(String),
    /// A field type requires an alignment above [`MAX_FIELD_ALIGN`].
    Overaligned { name: String, align: usize },
}

impl<T: Pod, P: Placement> Field<T, P> {
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The bytes covered by this field, relative to the start of its area.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + core::mem::size_of::<T>()
    }

    /// Decode the field from raw bytes laid out like its area, e.g. the contents of a backing
    /// file.
    ///
    /// Returns `None` if `bytes` is too short to contain the field.
    pub fn read_from(&self, bytes: &[u8]) -> Option<T> {
        bytes.get(self.range()).map(bytemuck::pod_read_unaligned)
    }

    pub(crate) fn write_to(&self, bytes: &mut [u8], value: T) {
        bytes[self.range()].copy_from_slice(bytemuck::bytes_of(&value));
    }
}

impl<T, P> Clone for Field<T, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, P> Copy for Field<T, P> {}

impl<T, P> core::fmt::Debug for Field<T, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Field").field("offset", &self.offset).finish()
    }
}

impl Layout {
    pub fn builder() -> LayoutBuilder {
        LayoutBuilder::default()
    }

    /// Number of bytes used by persistent fields, before rounding to pages.
    pub fn persistent_len(&self) -> usize {
        self.persistent.len()
    }

    /// Size of the region holding the persistent fields, and of its backing file.
    pub fn region_len(&self, page_size: usize) -> Option<usize> {
        crate::region::region_len(self.persistent_len(), page_size)
    }

    pub fn transient_len(&self) -> usize {
        self.transient.len()
    }

    /// The initial image of the region's declared bytes.
    pub fn persistent_init(&self) -> &[u8] {
        &self.persistent
    }

    pub fn transient_init(&self) -> &[u8] {
        &self.transient
    }

    pub fn declared(&self) -> &[Declared] {
        &self.fields
    }

    pub fn find(&self, name: &str) -> Option<&Declared> {
        self.fields.iter().find(|f| f.name == name)
    }
}

impl LayoutBuilder {
    /// Declare a field inside the region.
    pub fn persistent<T: Pod>(&mut self, name: &str, init: T) -> Field<T, Persistent> {
        self.declare(name, init)
    }

    /// Declare a field outside the region.
    pub fn transient<T: Pod>(&mut self, name: &str, init: T) -> Field<T, Transient> {
        self.declare(name, init)
    }

    pub fn finish(self) -> Result<Layout, LayoutError> {
        let fields = &self.layout.fields;

        for (idx, field) in fields.iter().enumerate() {
            if fields[..idx].iter().any(|f| f.name == field.name) {
                return Err(LayoutError::DuplicateName(field.name.clone()));
            }

            if field.align > MAX_FIELD_ALIGN {
                return Err(LayoutError::Overaligned {
                    name: field.name.clone(),
                    align: field.align,
                });
            }
        }

        Ok(self.layout)
    }

    fn declare<T: Pod, P: Placement>(&mut self, name: &str, init: T) -> Field<T, P> {
        let align = core::mem::align_of::<T>();
        let len = core::mem::size_of::<T>();

        let area = if P::PERSISTENT {
            &mut self.layout.persistent
        } else {
            &mut self.layout.transient
        };

        // Pad to the alignment of the type, then append the initial value.
        let offset = area.len().next_multiple_of(align);
        area.resize(offset, 0);
        area.extend_from_slice(bytemuck::bytes_of(&init));

        self.layout.fields.push(Declared {
            name: name.into(),
            offset,
            len,
            align,
            persistent: P::PERSISTENT,
        });

        Field {
            offset,
            _marker: PhantomData,
        }
    }
}

impl core::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LayoutError::DuplicateName(name) => write!(f, "field `{name}` declared twice"),
            LayoutError::Overaligned { name, align } => {
                write!(f, "field `{name}` requires alignment {align}, at most {MAX_FIELD_ALIGN} is supported")
            }
        }
    }
}

impl std::error::Error for LayoutError {}

#[test]
fn offsets_follow_repr_c() {
    let mut builder = Layout::builder();
    let a = builder.persistent::<u8>("a", 1);
    let b = builder.persistent::<u32>("b", 2);
    let c = builder.persistent::<u16>("c", 3);
    let t = builder.transient::<u64>("t", 4);
    let layout = builder.finish().unwrap();

    assert_eq!(a.offset(), 0);
    assert_eq!(b.offset(), 4);
    assert_eq!(c.offset(), 8);
    assert_eq!(t.offset(), 0);
    assert_eq!(layout.persistent_len(), 10);
    assert_eq!(layout.transient_len(), 8);

    let init = layout.persistent_init();
    assert_eq!(a.read_from(init), Some(1));
    assert_eq!(b.read_from(init), Some(2));
    assert_eq!(c.read_from(init), Some(3));
    assert_eq!(t.read_from(layout.transient_init()), Some(4));
}

#[test]
fn region_len_covers_persistent_fields() {
    let page = 4096;

    let empty = Layout::builder().finish().unwrap();
    assert_eq!(empty.region_len(page), Some(page));

    let mut builder = Layout::builder();
    builder.persistent::<[u8; 4096]>("block", [0; 4096]);
    builder.persistent::<u8>("tail", 0);
    builder.transient::<[u8; 8192]>("scratch", [0; 8192]);
    let layout = builder.finish().unwrap();
    assert_eq!(layout.region_len(page), Some(2 * page));
}

#[test]
fn read_from_short_buffer() {
    let mut builder = Layout::builder();
    let _pad = builder.persistent::<u64>("pad", 0);
    let field = builder.persistent::<u32>("late", 7);
    let layout = builder.finish().unwrap();

    assert_eq!(field.read_from(&layout.persistent_init()[..10]), None);
    assert_eq!(layout.find("late").map(|f| f.offset), Some(8));
    assert!(layout.find("missing").is_none());
}

#[test]
fn duplicate_names_are_rejected() {
    let mut builder = Layout::builder();
    builder.persistent::<u32>("x", 0);
    builder.transient::<u32>("x", 0);
    assert_eq!(
        builder.finish().unwrap_err(),
        LayoutError::DuplicateName("x".into())
    );
}

#[test]
fn overaligned_fields_are_rejected() {
    #[derive(Clone, Copy)]
    #[repr(C, align(8192))]
    struct Huge([u8; 8192]);

    unsafe impl bytemuck::Zeroable for Huge {}
    unsafe impl Pod for Huge {}

    let mut builder = Layout::builder();
    builder.persistent("huge", Huge([0; 8192]));
    assert_eq!(
        builder.finish().unwrap_err(),
        LayoutError::Overaligned { name: "huge".into(), align: 8192 }
    );
}
