use alloc::{boxed::Box, vec};
use std::path::Path;

use bytemuck::Pod;

use crate::layout::{Field, Layout, Placement};
use crate::{BindError, MapError, Mapper, Region, MAX_FIELD_ALIGN};

/// The process-owned handle to all declared fields.
///
/// Create one at startup, bind it, then pass it to whatever needs persisted state. Persistent
/// fields live in the [`Region`], transient fields in a heap buffer outside of it. Both areas start
/// at an address aligned to [`MAX_FIELD_ALIGN`], so every field sits at an address aligned to its
/// type.
///
/// Accessing a field with a handle from a different layout panics if the field is out of bounds
/// and reads unrelated bytes otherwise.
pub struct Store {
    region: Region,
    transient: Box<[Chunk]>,
    layout: Layout,
}

/// Unit of the transient area.
#[derive(Clone, Copy)]
#[repr(C, align(4096))]
struct Chunk([u8; MAX_FIELD_ALIGN]);

const _: () = assert!(core::mem::align_of::<Chunk>() == MAX_FIELD_ALIGN);

// Safety: a byte array without padding, any bit pattern is valid.
unsafe impl bytemuck::Zeroable for Chunk {}
unsafe impl Pod for Chunk {}

impl Store {
    pub fn new(layout: Layout) -> Result<Self, MapError> {
        Self::with_mapper(layout, &Mapper::new())
    }

    /// Reserve the region and write the initial values of all fields.
    pub fn with_mapper(layout: Layout, mapper: &Mapper) -> Result<Self, MapError> {
        let mut region = Region::reserve(layout.persistent_len(), mapper)?;
        let init = layout.persistent_init();
        region.bytes_mut()[..init.len()].copy_from_slice(init);

        let init = layout.transient_init();
        let chunks = init.len().div_ceil(MAX_FIELD_ALIGN);
        let mut transient = vec![Chunk([0; MAX_FIELD_ALIGN]); chunks].into_boxed_slice();
        bytemuck::cast_slice_mut::<Chunk, u8>(&mut transient)[..init.len()].copy_from_slice(init);

        Ok(Store {
            region,
            transient,
            layout,
        })
    }

    /// Back the persistent fields with the file at `path`, see [`Region::bind`].
    pub fn bind(&mut self, path: impl AsRef<Path>) -> Result<(), BindError> {
        self.region.bind(path)
    }

    pub fn get<T: Pod, P: Placement>(&self, field: &Field<T, P>) -> T {
        bytemuck::pod_read_unaligned(&self.area::<P>()[field.range()])
    }

    pub fn set<T: Pod, P: Placement>(&mut self, field: &Field<T, P>, value: T) {
        field.write_to(self.area_mut::<P>(), value)
    }

    /// Replace the value with `f(value)`, returning the previous value.
    pub fn update<T: Pod, P: Placement>(&mut self, field: &Field<T, P>, f: impl FnOnce(T) -> T) -> T {
        let old = self.get(field);
        self.set(field, f(old));
        old
    }

    /// The address of the field's storage. Only meant for diagnostics.
    pub fn address_of<T: Pod, P: Placement>(&self, field: &Field<T, P>) -> usize {
        self.area::<P>().as_ptr() as usize + field.offset()
    }

    pub fn flush(&self) -> Result<(), MapError> {
        self.region.flush()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn area<P: Placement>(&self) -> &[u8] {
        if P::PERSISTENT {
            self.region.bytes()
        } else {
            &bytemuck::cast_slice::<Chunk, u8>(&self.transient)[..self.layout.transient_len()]
        }
    }

    fn area_mut<P: Placement>(&mut self) -> &mut [u8] {
        if P::PERSISTENT {
            self.region.bytes_mut()
        } else {
            let len = self.layout.transient_len();
            &mut bytemuck::cast_slice_mut::<Chunk, u8>(&mut self.transient)[..len]
        }
    }
}

#[test]
fn fields_start_at_initial_values() {
    let mut builder = Layout::builder();
    let counter = builder.persistent::<i32>("counter", 23);
    let scratch = builder.transient::<i32>("scratch", 42);
    let mut store = Store::new(builder.finish().unwrap()).unwrap();

    assert_eq!(store.get(&counter), 23);
    assert_eq!(store.get(&scratch), 42);

    assert_eq!(store.update(&counter, |v| v + 1), 23);
    store.set(&scratch, 7);
    assert_eq!(store.get(&counter), 24);
    assert_eq!(store.get(&scratch), 7);
}

#[test]
fn placement_decides_region_membership() {
    let mut builder = Layout::builder();
    let inside = builder.persistent::<u64>("inside", 0);
    let outside = builder.transient::<u64>("outside", 0);
    let store = Store::new(builder.finish().unwrap()).unwrap();

    assert!(store.region().contains(store.address_of(&inside)));
    assert!(!store.region().contains(store.address_of(&outside)));
    assert_eq!(store.address_of(&inside), store.region().start());
}

#[test]
fn fields_are_aligned_in_both_areas() {
    let mut builder = Layout::builder();
    let flag = builder.persistent::<u8>("flag", 1);
    let wide = builder.persistent::<u64>("wide", 2);
    let t_flag = builder.transient::<u8>("t_flag", 3);
    let t_wide = builder.transient::<u64>("t_wide", 4);
    let t_int = builder.transient::<i32>("t_int", 5);
    let store = Store::new(builder.finish().unwrap()).unwrap();

    assert_eq!(store.address_of(&flag) % MAX_FIELD_ALIGN, 0);
    assert_eq!(store.address_of(&t_flag) % MAX_FIELD_ALIGN, 0);
    assert_eq!(store.address_of(&wide) % core::mem::align_of::<u64>(), 0);
    assert_eq!(store.address_of(&t_wide) % core::mem::align_of::<u64>(), 0);
    assert_eq!(store.address_of(&t_int) % core::mem::align_of::<i32>(), 0);

    assert_eq!(store.get(&t_wide), 4);
    assert_eq!(store.get(&t_int), 5);
}

#[test]
fn empty_transient_area() {
    let mut builder = Layout::builder();
    let counter = builder.persistent::<i32>("counter", 23);
    let mut store = Store::new(builder.finish().unwrap()).unwrap();

    assert_eq!(store.layout().transient_len(), 0);
    assert_eq!(store.update(&counter, |v| v + 1), 23);
}
