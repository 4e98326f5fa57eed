use std::sync::atomic::{AtomicUsize, Ordering};

/// An atomic wrapper with an underlying atomic storage and conversion to
/// a type T.
///
/// `Acquire` ordering is used for load and `AcqRel` ordering is used for swap.
#[derive(Debug, Default)]
pub(crate) struct Atomic<S, T>(S::Type, std::marker::PhantomData<T>)
where
    S: AtomicType,
    T: From<S> + Into<S>;
/// Marker type to associate primitive with their atomic versions
pub(crate) trait AtomicType {
    type Type;
}
impl AtomicType for u8 {
    type Type = std::sync::atomic::AtomicU8;
}
impl<T: From<u8> + Into<u8>> Atomic<u8, T> {
    pub const fn new_u8(value: u8) -> Self {
        Self(std::sync::atomic::AtomicU8::new(value), std::marker::PhantomData)
    }
    pub fn get(&self) -> T {
        self.0.load(Ordering::Acquire).into()
    }
    /// Set the value, returning the previous one
    pub fn swap(&self, value: T) -> T {
        self.0.swap(value.into(), Ordering::AcqRel).into()
    }
}

/// Process-wide id source for tasks, streams, cells and jobs
pub(crate) fn next_atomic_usize() -> usize {
    static ID: AtomicUsize = AtomicUsize::new(1);
    ID.fetch_add(1, Ordering::SeqCst)
}
