use core::ops::{Deref, DerefMut};

/// Pads and aligns `T` to the size of a cache line to avoid false sharing.
///
/// x86_64 prefetches cache-line pairs and big aarch64 cores use 128-byte
/// lines, so both get 128; everything else this workspace could plausibly
/// run on uses 64.
#[cfg_attr(any(target_arch = "x86_64", target_arch = "aarch64"), repr(align(128)))]
#[cfg_attr(not(any(target_arch = "x86_64", target_arch = "aarch64")), repr(align(64)))]
#[derive(Debug, Default)]
pub struct CachePadded<T>(pub T);

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T> From<T> for CachePadded<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupies_a_full_line() {
        assert!(align_of::<CachePadded<u32>>() >= 64);
        assert_eq!(size_of::<CachePadded<u32>>(), align_of::<CachePadded<u32>>());
    }
}
