//! On-disk page layout for the buffer pool.
//!
//! A page is a fixed-size, self-describing region of a buffer file:
//!
//! ```text
//! [ Header (8 B) | user content | Footer (4 B) ]
//! ```
//!
//! The header carries a 1-byte "calculated" flag (whether the footer's
//! 32-bit CRC was computed for this page) plus padding, followed by a
//! 16-bit CRC over those first 6 bytes so header corruption is itself
//! detectable. The footer is a 32-bit CRC over every byte of the page
//! except the footer itself.
//!
//! This crate knows nothing about pools, files, or fix/unfix — it only
//! understands the byte layout. `buffer::page` is the caller that decides
//! *when* to compute or verify a checksum.

#[cfg(test)]
mod tests;

use common::{DbError, DbResult};
use std::path::Path;

/// Bytes occupied by the page header (flag + padding + CRC-16).
pub const HEADER_SIZE: usize = 8;
/// Bytes occupied by the page footer (CRC-32).
pub const FOOTER_SIZE: usize = 4;
/// Overhead subtracted from `page_size` to get the usable content size.
pub const OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

/// Smallest page size this implementation will ever hand out. Real storage
/// engines query the OS page size at startup; we assume the common 4 KiB
/// page the whole retrieval pack assumes (see DESIGN.md for the tradeoff).
pub const MIN_PAGE_SIZE: usize = 4096;

/// Default upper bound on page size (`Buffer_PageSizeMax`'s default).
pub const DEFAULT_PAGE_SIZE_MAX: usize = 64 * 1024;

const CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_IBM_SDLC);

/// Round `requested` up to the smallest power of two that is at least
/// `MIN_PAGE_SIZE` and at least `requested`, then clamp to `max`.
///
/// Mirrors `Buffer::Page::correctSize`: callers ask for an approximate
/// size and get back whatever the engine can actually allocate.
pub fn round_page_size(requested: usize, max: usize) -> usize {
    let mut size = MIN_PAGE_SIZE;
    while size < requested && size < max {
        size *= 2;
    }
    size.min(max.max(MIN_PAGE_SIZE))
}

/// Usable content size for a page of `page_size` bytes.
pub fn content_size(page_size: usize) -> usize {
    page_size.saturating_sub(OVERHEAD)
}

/// A single fixed-size, CRC-protected page buffer.
///
/// `Page` owns its bytes; it does not know which file or offset it was
/// read from or will be written to. Buffer descriptors in `buffer::page`
/// attach that context.
#[derive(Debug, Clone)]
pub struct Page {
    data: Vec<u8>,
    page_size: usize,
}

impl Page {
    /// Allocate a new zero-content page of `page_size` bytes with a fresh
    /// header (calculated flag unset, header CRC valid, footer CRC not
    /// yet computed).
    pub fn new(page_size: usize) -> DbResult<Self> {
        if page_size <= OVERHEAD {
            return Err(DbError::BadArgument(format!(
                "page size {page_size} too small to hold header and footer"
            )));
        }
        let mut page = Self {
            data: vec![0u8; page_size],
            page_size,
        };
        page.set_calculated(false);
        Ok(page)
    }

    /// Wrap a buffer of raw bytes already read from disk. The caller is
    /// responsible for calling [`Page::verify`] before trusting the
    /// content.
    pub fn from_raw(data: Vec<u8>) -> DbResult<Self> {
        if data.len() <= OVERHEAD {
            return Err(DbError::BadArgument(format!(
                "page buffer of {} bytes too small to hold header and footer",
                data.len()
            )));
        }
        let page_size = data.len();
        Ok(Self { data, page_size })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn content_size(&self) -> usize {
        content_size(self.page_size)
    }

    /// The full page buffer, header and footer included. Used for
    /// single-call scatter/vector I/O.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The user-writable content region, excluding header and footer.
    pub fn content(&self) -> &[u8] {
        &self.data[HEADER_SIZE..self.page_size - FOOTER_SIZE]
    }

    pub fn content_mut(&mut self) -> &mut [u8] {
        let end = self.page_size - FOOTER_SIZE;
        &mut self.data[HEADER_SIZE..end]
    }

    /// Whether the footer's 32-bit CRC has been computed for the content
    /// currently in the page (the header's `calculated` flag).
    pub fn is_calculated(&self) -> bool {
        self.data[0] != 0
    }

    fn set_calculated(&mut self, calculated: bool) {
        self.data[0] = calculated as u8;
        self.write_header_crc();
    }

    fn write_header_crc(&mut self) {
        let crc = CRC16.checksum(&self.data[0..6]);
        self.data[6..8].copy_from_slice(&crc.to_le_bytes());
    }

    /// Verify the header's own CRC-16. This detects corruption of the
    /// header independent of whether the footer's CRC-32 is checked.
    pub fn verify_header(&self) -> bool {
        let stored = u16::from_le_bytes([self.data[6], self.data[7]]);
        CRC16.checksum(&self.data[0..6]) == stored
    }

    /// Compute and store the footer's CRC-32 over the whole page except
    /// the footer, and set the header's `calculated` flag. Called before
    /// every flush write.
    pub fn seal(&mut self) {
        self.set_calculated(true);
        let end = self.page_size - FOOTER_SIZE;
        let crc = crc32fast::hash(&self.data[..end]);
        self.data[end..].copy_from_slice(&crc.to_le_bytes());
    }

    fn footer_crc_matches(&self) -> bool {
        let end = self.page_size - FOOTER_SIZE;
        let stored = u32::from_le_bytes([
            self.data[end],
            self.data[end + 1],
            self.data[end + 2],
            self.data[end + 3],
        ]);
        crc32fast::hash(&self.data[..end]) == stored
    }

    /// Verify that the page is internally consistent: the header CRC must
    /// match, and if the header says the footer was calculated, the
    /// footer CRC must match too (unless `check_footer` is false, which
    /// lets a caller skip the full-page CRC-32 when `CalculateCheckSum =
    /// None`, or when the owning file opted out under `Specified`).
    pub fn verify(&self, check_footer: bool, offset: u64, path: &Path) -> DbResult<()> {
        if !self.verify_header() {
            return Err(DbError::BadDataPage {
                offset,
                path: path.to_path_buf(),
            });
        }
        if check_footer && self.is_calculated() && !self.footer_crc_matches() {
            return Err(DbError::BadDataPage {
                offset,
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Zero the content region (used when (re)initializing a page that
    /// was fixed with `Allocate`).
    pub fn zero_content(&mut self) {
        let end = self.page_size - FOOTER_SIZE;
        self.data[HEADER_SIZE..end].fill(0);
    }
}
