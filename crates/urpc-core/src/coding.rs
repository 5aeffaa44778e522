//! Fixed-width little-endian integer coding used by frame headers.

/// Width of every length field in a frame header.
pub const FIXED32_LEN: usize = 4;

#[inline]
pub fn encode_fixed32(value: u32) -> [u8; FIXED32_LEN] {
    value.to_le_bytes()
}

/// Decode the first four bytes of `src`; `None` if fewer are available.
#[inline]
pub fn decode_fixed32(src: &[u8]) -> Option<u32> {
    let bytes: [u8; FIXED32_LEN] = src.get(..FIXED32_LEN)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_layout() {
        assert_eq!(encode_fixed32(0x0403_0201), [1, 2, 3, 4]);
        assert_eq!(decode_fixed32(&[1, 2, 3, 4, 0xff]), Some(0x0403_0201));
    }

    #[test]
    fn test_short_input() {
        assert_eq!(decode_fixed32(&[1, 2, 3]), None);
    }
}
