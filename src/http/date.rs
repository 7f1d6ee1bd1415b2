use std::cell::RefCell;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

struct CachedDate {
    second: u64,
    value: Bytes,
}

thread_local! {
    static CACHE: RefCell<Option<CachedDate>> = const { RefCell::new(None) };
}

/// Current time as an RFC 9110 date, formatted at most once per second
/// per thread.
pub fn http_date() -> Bytes {
    let now = SystemTime::now();
    let second = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        match cache.as_ref() {
            Some(cached) if cached.second == second => cached.value.clone(),
            _ => {
                let value = Bytes::from(httpdate::fmt_http_date(now));
                *cache = Some(CachedDate {
                    second,
                    value: value.clone(),
                });
                value
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_imf_fixdate() {
        let date = http_date();
        assert_eq!(date.len(), 29);
        assert!(date.ends_with(b" GMT"));
        assert!(httpdate::parse_http_date(std::str::from_utf8(&date).unwrap()).is_ok());
    }
}
