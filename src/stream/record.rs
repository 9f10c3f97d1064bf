//! Fixed-size record codecs.
//!
//! Items cross the block boundary as bytes through an explicit codec
//! instead of pointer casts, so a record type controls its own layout and
//! nothing ever borrows into a stream's resident block.

/// A fixed-size record. `SIZE` bytes on disk, little-endian for the
/// provided integer impls. `SIZE` must be nonzero and no larger than the
/// stream's block size.
pub trait Record: Sized + 'static {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Encode into `buf`, which is exactly `SIZE` bytes.
    fn store(&self, buf: &mut [u8]);

    /// Decode from `buf`, which is exactly `SIZE` bytes.
    fn load(buf: &[u8]) -> Self;
}

macro_rules! int_record {
    ($($t:ty),*) => {$(
        impl Record for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn store(&self, buf: &mut [u8]) {
                buf.copy_from_slice(&self.to_le_bytes());
            }

            fn load(buf: &[u8]) -> Self {
                <$t>::from_le_bytes(buf.try_into().expect("record size mismatch"))
            }
        }
    )*};
}

int_record!(u8, u16, u32, u64, i8, i16, i32, i64);

impl<R: Record + Copy, const N: usize> Record for [R; N] {
    const SIZE: usize = R::SIZE * N;

    fn store(&self, buf: &mut [u8]) {
        for (i, item) in self.iter().enumerate() {
            item.store(&mut buf[i * R::SIZE..(i + 1) * R::SIZE]);
        }
    }

    fn load(buf: &[u8]) -> Self {
        std::array::from_fn(|i| R::load(&buf[i * R::SIZE..(i + 1) * R::SIZE]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_round_trip_little_endian() {
        let mut buf = [0u8; 8];
        0x0102_0304_0506_0708u64.store(&mut buf);
        assert_eq!(buf, [8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(u64::load(&buf), 0x0102_0304_0506_0708);

        let mut buf = [0u8; 4];
        (-5i32).store(&mut buf);
        assert_eq!(i32::load(&buf), -5);
    }

    #[test]
    fn arrays_concatenate_elements() {
        // A three-byte record; deliberately does not divide typical block sizes.
        let rgb: [u8; 3] = [10, 20, 30];
        assert_eq!(<[u8; 3]>::SIZE, 3);
        let mut buf = [0u8; 3];
        rgb.store(&mut buf);
        assert_eq!(<[u8; 3]>::load(&buf), rgb);
    }
}
