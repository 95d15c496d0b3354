use std::hash::{ BuildHasherDefault, Hasher };

const FNV_OFFSET_BASIS: u64 = 0xCBF29CE484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// 64-bit FNV-1a. Registry keys are usually short names, where this beats
/// SipHash comfortably and HashDoS isn't a concern.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a(u64);

pub type FnvBuildHasher = BuildHasherDefault<Fnv1a>;

impl Fnv1a {
    pub fn hash_bytes(bytes: &[u8]) -> u64 {
        let mut fnv1a = Self::default();
        fnv1a.write(bytes);
        fnv1a.finish()
    }
}

impl Default for Fnv1a {
    fn default() -> Self { Self(FNV_OFFSET_BASIS) }
}

impl Hasher for Fnv1a {
    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 = (self.0 ^ *b as u64).wrapping_mul(FNV_PRIME)
        }
    }
    fn finish(&self) -> u64 { self.0 }
}
