//! Host page-size and huge-page-size detection.
//!
//! The base page size is a `sysconf` query, cached once per process like the
//! teacher's `map::page_size`. The huge page size is read from sysfs, the
//! same way user-space code discovers transparent-huge-page sizing on
//! Linux; unlike the base page size, huge pages may simply be unsupported,
//! so the query returns `Option`.

use std::io::ErrorKind;
use std::str::FromStr;

const HPAGE_PMD_SIZE_PATH: &str = "/sys/kernel/mm/transparent_hugepage/hpage_pmd_size";

fn query_page_size() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(ret > 0, "sysconf(_SC_PAGESIZE) failed");
    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = query_page_size();
}

/// Returns the host's base page size. Constant for the process lifetime.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Returns the number of base pages in a huge page, if the host advertises
/// transparent huge page support.
pub fn huge_page_size() -> std::io::Result<Option<usize>> {
    let contents = match std::fs::read(HPAGE_PMD_SIZE_PATH) {
        Ok(v) => v,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let text = std::str::from_utf8(&contents).map_err(|e| {
        std::io::Error::new(
            ErrorKind::InvalidData,
            format!("{} is not valid utf8: {}", HPAGE_PMD_SIZE_PATH, e),
        )
    })?;

    let size = usize::from_str(text.trim()).map_err(|e| {
        std::io::Error::new(
            ErrorKind::InvalidData,
            format!("{} contents {:?} aren't a usize: {}", HPAGE_PMD_SIZE_PATH, text, e),
        )
    })?;

    Ok(Some(size))
}

/// Number of base pages per huge page, falling back to a conservative
/// default (2MiB / 4KiB = 512) when the host doesn't report one. Chunks
/// marked huge always use this value, so allocations stay self-consistent
/// even without real transparent-huge-page support (e.g. in CI containers).
pub fn pages_per_huge_page() -> usize {
    match huge_page_size() {
        Ok(Some(huge)) => (huge / page_size()).max(1),
        _ => 512,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let p = page_size();
        assert_ne!(p, 0);
        assert_eq!(p & (p - 1), 0);
    }

    #[test]
    fn test_pages_per_huge_page_sane() {
        assert!(pages_per_huge_page() >= 1);
    }
}
