use super::*;

#[test]
fn new_page_has_valid_header_and_uncalculated_footer() {
    let page = Page::new(MIN_PAGE_SIZE).unwrap();
    assert!(page.verify_header());
    assert!(!page.is_calculated());
    assert_eq!(page.content().len(), content_size(MIN_PAGE_SIZE));
}

#[test]
fn content_round_trips_through_seal_and_verify() {
    let mut page = Page::new(MIN_PAGE_SIZE).unwrap();
    page.content_mut()[0..5].copy_from_slice(b"hello");
    page.seal();

    assert!(page.is_calculated());
    let raw = page.as_bytes().to_vec();

    let reloaded = Page::from_raw(raw).unwrap();
    reloaded
        .verify(true, 0, Path::new("/tmp/f"))
        .expect("sealed page must verify");
    assert_eq!(&reloaded.content()[0..5], b"hello");
}

#[test]
fn corrupt_content_byte_fails_footer_verification() {
    let mut page = Page::new(MIN_PAGE_SIZE).unwrap();
    page.content_mut()[10] = 0xAB;
    page.seal();

    let mut raw = page.as_bytes().to_vec();
    raw[HEADER_SIZE + 10] ^= 0xFF;
    let corrupted = Page::from_raw(raw).unwrap();

    let err = corrupted
        .verify(true, 4096, Path::new("/data/t0"))
        .unwrap_err();
    match err {
        DbError::BadDataPage { offset, path } => {
            assert_eq!(offset, 4096);
            assert_eq!(path, Path::new("/data/t0"));
        }
        other => panic!("expected BadDataPage, got {other:?}"),
    }
}

#[test]
fn corrupt_header_byte_fails_verification_even_without_footer_check() {
    let mut page = Page::new(MIN_PAGE_SIZE).unwrap();
    page.seal();

    let mut raw = page.as_bytes().to_vec();
    raw[1] ^= 0xFF;
    let corrupted = Page::from_raw(raw).unwrap();

    assert!(corrupted.verify(false, 0, Path::new("/data/t0")).is_err());
}

#[test]
fn verify_skips_footer_check_when_disabled() {
    let mut page = Page::new(MIN_PAGE_SIZE).unwrap();
    page.seal();

    let mut raw = page.as_bytes().to_vec();
    let end = MIN_PAGE_SIZE - FOOTER_SIZE;
    raw[end] ^= 0xFF;
    let corrupted = Page::from_raw(raw).unwrap();

    assert!(corrupted.verify(false, 0, Path::new("/data/t0")).is_ok());
    assert!(corrupted.verify(true, 0, Path::new("/data/t0")).is_err());
}

#[test]
fn uncalculated_page_skips_footer_check_regardless_of_flag() {
    let page = Page::new(MIN_PAGE_SIZE).unwrap();
    page.verify(true, 0, Path::new("/data/t0"))
        .expect("an unsealed page has no footer to validate");
}

#[test]
fn zero_content_clears_payload_but_keeps_header_valid() {
    let mut page = Page::new(MIN_PAGE_SIZE).unwrap();
    page.content_mut().fill(0x42);
    page.zero_content();

    assert!(page.content().iter().all(|&b| b == 0));
    assert!(page.verify_header());
}

#[test]
fn page_too_small_for_overhead_is_rejected() {
    let err = Page::new(OVERHEAD).unwrap_err();
    assert!(matches!(err, DbError::BadArgument(_)));
}

#[test]
fn round_page_size_picks_smallest_power_of_two_at_least_min() {
    assert_eq!(round_page_size(100, DEFAULT_PAGE_SIZE_MAX), MIN_PAGE_SIZE);
    assert_eq!(round_page_size(4096, DEFAULT_PAGE_SIZE_MAX), 4096);
    assert_eq!(round_page_size(4097, DEFAULT_PAGE_SIZE_MAX), 8192);
    assert_eq!(round_page_size(20_000, DEFAULT_PAGE_SIZE_MAX), 32768);
}

#[test]
fn round_page_size_clamps_to_max() {
    assert_eq!(round_page_size(1_000_000, DEFAULT_PAGE_SIZE_MAX), DEFAULT_PAGE_SIZE_MAX);
}
