//! Small utilities shared by the engine crates

pub mod fnv1a;
pub use fnv1a::fnv1a_hash;
pub use fnv1a::Fnv1aHashExt;

pub mod math;

mod pool;
pub use pool::*;

pub type AnyResult<T = (), E = anyhow::Error> = anyhow::Result<T, E>;

/// Shorthand for `Ok(())`, cause it looks ugly
pub const fn ok<E>() -> Result<(), E> {
    Ok(())
}

/// Aligns the value up. Alignment doesn't have to be a power of two.
///
/// ```
/// use strafe_utils::align;
/// assert_eq!(16, align(10, 8));
/// ```
pub const fn align(n: u64, a: u64) -> u64 {
    (n + a - 1) / a * a
}

/// Packs a float slice into native-endian bytes, for streaming into GPU
/// buffers.
pub fn pack_floats(buffer: &[f32]) -> Vec<u8> {
    let mut result = Vec::with_capacity(buffer.len() * std::mem::size_of::<f32>());
    for &value in buffer {
        result.extend_from_slice(&value.to_ne_bytes());
    }
    result
}
