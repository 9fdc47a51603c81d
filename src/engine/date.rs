use std::cell::RefCell;
use std::time::{Duration, Instant, SystemTime};

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

/// Appends the cached `Date:` value (without the header name) to `dst`.
///
/// Each engine thread formats the date at most once per second; every
/// response written in that window reuses the same bytes.
pub(crate) fn extend(dst: &mut Vec<u8>) {
    CACHED.with(|cache| {
        dst.extend_from_slice(cache.borrow_mut().buffer());
    })
}

struct CachedDate {
    bytes: [u8; DATE_VALUE_LENGTH],
    next_update: Option<Instant>,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new()));

impl CachedDate {
    fn new() -> Self {
        CachedDate {
            bytes: [0; DATE_VALUE_LENGTH],
            next_update: None,
        }
    }

    fn buffer(&mut self) -> &[u8] {
        let now = Instant::now();
        let stale = match self.next_update {
            Some(at) => now >= at,
            None => true,
        };
        if stale {
            self.update();
            self.next_update = Some(now + Duration::from_secs(1));
        }
        &self.bytes[..]
    }

    fn update(&mut self) {
        let formatted = httpdate::fmt_http_date(SystemTime::now());
        debug_assert_eq!(formatted.len(), DATE_VALUE_LENGTH);
        self.bytes.copy_from_slice(formatted.as_bytes());
    }
}
