//! Page checksums.

/// Computes the checksum of a page image, skipping the 4-byte checksum field
/// at `checksum_offset`.
///
/// # Example
///
/// ```rust
/// use bracket_storage::page::compute_page_checksum;
///
/// let mut page = vec![7u8; 512];
/// let sum = compute_page_checksum(&page, 14);
/// page[14..18].copy_from_slice(&[1, 2, 3, 4]);
/// assert_eq!(compute_page_checksum(&page, 14), sum);
/// ```
pub fn compute_page_checksum(page: &[u8], checksum_offset: usize) -> u32 {
    debug_assert!(checksum_offset + 4 <= page.len());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[..checksum_offset]);
    hasher.update(&page[checksum_offset + 4..]);
    hasher.finalize()
}

/// Reads the stored checksum and compares it with the computed one.
///
/// Returns `Err((stored, computed))` on mismatch.
pub fn verify_page_checksum(page: &[u8], checksum_offset: usize) -> Result<(), (u32, u32)> {
    let at = checksum_offset;
    let stored = u32::from_be_bytes([page[at], page[at + 1], page[at + 2], page[at + 3]]);
    let computed = compute_page_checksum(page, checksum_offset);
    if stored == computed {
        Ok(())
    } else {
        Err((stored, computed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_detects_flip() {
        let mut page = vec![0u8; 256];
        page[100] = 42;
        let sum = compute_page_checksum(&page, 14);
        page[14..18].copy_from_slice(&sum.to_be_bytes());
        assert!(verify_page_checksum(&page, 14).is_ok());

        page[200] ^= 1;
        let (stored, computed) = verify_page_checksum(&page, 14).unwrap_err();
        assert_eq!(stored, sum);
        assert_ne!(computed, sum);
    }
}
