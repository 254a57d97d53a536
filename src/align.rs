//! Address, size and alignment arithmetic shared by every allocator. Nothing
//! in here has state, and nothing in here dereferences memory except
//! [`zero_memory`].

use core::ptr;

/// Returns `true` if `n` is a power of two. Zero is not.
#[inline]
pub const fn is_power_of_two(n: usize) -> bool {
    n.is_power_of_two()
}

/// Rounds `address` up to the next multiple of `alignment`.
///
/// # Examples
///
/// ```rust
/// use regionalloc::align;
///
/// assert_eq!(align::align_up(13, 8), 16);
/// assert_eq!(align::align_up(16, 8), 16);
/// assert_eq!(align::align_up(0x4_0007, 32), 0x4_0020);
/// ```
///
/// # Panics
///
/// If `alignment` is not a power of two. That's a contract violation, the
/// caller is asking for something that has no meaning.
#[inline]
pub fn align_up(address: usize, alignment: usize) -> usize {
    assert!(
        is_power_of_two(alignment),
        "alignment {alignment} isn't a power of 2"
    );
    let mask = alignment - 1;
    (address + mask) & !mask
}

/// Returns `true` if `value` is a multiple of `alignment`.
#[inline]
pub fn is_aligned(value: usize, alignment: usize) -> bool {
    assert!(
        is_power_of_two(alignment),
        "alignment {alignment} isn't a power of 2"
    );
    value & (alignment - 1) == 0
}

/// Same as [`is_aligned`] for pointers.
#[inline]
pub fn is_ptr_aligned<T>(pointer: *const T, alignment: usize) -> bool {
    is_aligned(ptr_to_address(pointer), alignment)
}

/// Computes how many bytes have to be skipped starting at `address` so that
/// the resulting address is aligned to `alignment` **and** there are at least
/// `header_size` bytes right before it where an allocation header fits:
///
/// ```text
///  address                                  address + padding
///     |                                             |
///     v                                             v
///     +--------------------+------------------------+---------------------+
///     | unused (alignment) | header (header_size)   |   aligned content   |
///     +--------------------+------------------------+---------------------+
///     <------------------ padding ----------------->
/// ```
///
/// If the naturally aligned gap is too small for the header, the padding
/// grows by whole multiples of `alignment` until the header fits, so the
/// result stays aligned.
///
/// # Examples
///
/// ```rust
/// use regionalloc::align::compute_padding;
///
/// // Already aligned, but the header needs 16 bytes in front.
/// assert_eq!(compute_padding(0x1000, 16, 16), 16);
/// // 8 bytes to alignment, header needs 16: skip one more alignment step.
/// assert_eq!(compute_padding(0x1008, 16, 16), 24);
/// // No header at all degenerates to plain alignment.
/// assert_eq!(compute_padding(0x1001, 8, 0), 7);
/// ```
pub fn compute_padding(address: usize, alignment: usize, header_size: usize) -> usize {
    assert!(
        is_power_of_two(alignment),
        "alignment {alignment} isn't a power of 2"
    );

    let remainder = address & (alignment - 1);
    let mut padding = if remainder != 0 {
        alignment - remainder
    } else {
        0
    };

    if padding < header_size {
        let missing = header_size - padding;
        padding += alignment * missing.div_ceil(alignment);
    }

    padding
}

/// Address of `pointer` as an integer.
#[inline]
pub fn ptr_to_address<T>(pointer: *const T) -> usize {
    pointer as usize
}

/// Inverse of [`ptr_to_address`].
#[inline]
pub fn address_to_ptr(address: usize) -> *mut u8 {
    address as *mut u8
}

/// Writes `length` zero bytes starting at `pointer`.
///
/// # Safety
///
/// `pointer` must be valid for writes of `length` bytes.
#[inline]
pub unsafe fn zero_memory(pointer: *mut u8, length: usize) {
    unsafe { ptr::write_bytes(pointer, 0, length) };
}

/// `n` kibibytes in bytes.
#[inline]
pub const fn kib(n: usize) -> usize {
    n * 1024
}

/// `n` mebibytes in bytes.
#[inline]
pub const fn mib(n: usize) -> usize {
    n * 1024 * 1024
}

/// `n` gibibytes in bytes.
#[inline]
pub const fn gib(n: usize) -> usize {
    n * 1024 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_of_two() {
        for shift in 0..usize::BITS {
            assert!(is_power_of_two(1 << shift));
        }

        for n in [0, 3, 5, 6, 7, 12, 100, usize::MAX] {
            assert!(!is_power_of_two(n));
        }
    }

    #[test]
    fn test_align_up() {
        let word = core::mem::size_of::<usize>();

        let mut alignments = std::vec::Vec::new();

        for i in 0..10 {
            // On 64 bit machine: (1..=8), (9..=16), (17..=24) and so on.
            let sizes = (word * i + 1)..=(word * (i + 1));
            // Matching the sizes above, this would be: 8, 16, 24 and so on.
            let expected = word * (i + 1);
            alignments.push((sizes, expected));
        }

        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(expected, align_up(size, word));
            }
        }

        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(0x4_0007, 32), 0x4_0020);
    }

    #[test]
    #[should_panic(expected = "isn't a power of 2")]
    fn align_up_rejects_bad_alignment() {
        align_up(64, 12);
    }

    #[test]
    fn aligned_checks() {
        assert!(is_aligned(64, 16));
        assert!(!is_aligned(72, 16));
        assert!(is_ptr_aligned(0x1000 as *const u8, 4096));
        assert!(!is_ptr_aligned(0x1001 as *const u8, 2));
    }

    #[test]
    fn padding_reserves_header_space() {
        let header = 16;

        // Aligned address, 16 byte alignment: need a full step for the header.
        assert_eq!(compute_padding(0x1000, 16, header), 16);
        // Alignment smaller than the header: two steps of 8.
        assert_eq!(compute_padding(0x1000, 8, header), 16);
        // 4 bytes until alignment, 12 more for the header rounds to one step.
        assert_eq!(compute_padding(0x100c, 16, header), 20);
        // Large alignment already leaves enough room.
        assert_eq!(compute_padding(0x1010, 64, header), 48);

        for address in 0x2000..0x2100 {
            for alignment in [8, 16, 32, 64, 128] {
                let padding = compute_padding(address, alignment, header);
                assert!(padding >= header);
                assert!(is_aligned(address + padding, alignment));
                assert!(padding < header + alignment);
            }
        }
    }

    #[test]
    fn padding_without_header_is_plain_alignment() {
        for address in 0..256 {
            assert_eq!(address + compute_padding(address, 32, 0), align_up(address, 32));
        }
    }

    #[test]
    fn size_units() {
        assert_eq!(kib(4), 4096);
        assert_eq!(mib(1), 1 << 20);
        assert_eq!(gib(1), 1 << 30);
    }
}
