//! Host machine facts used for sizing pools and reporting.

use log::warn;

/// Logical processors currently online.
pub fn num_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        warn!("sysconf(_SC_NPROCESSORS_ONLN) failed; assuming 1");
        return 1;
    }
    n as usize
}

/// Physical memory in bytes, or 0 when the platform hides it.
pub fn physical_memory() -> u64 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
        if pages < 0 || page_size < 0 {
            return 0;
        }
        pages as u64 * page_size as u64
    }
    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    {
        let mut size: u64 = 0;
        let mut len = std::mem::size_of::<u64>();
        let name = std::ffi::CString::new("hw.memsize").unwrap();
        let r = unsafe {
            libc::sysctlbyname(
                name.as_ptr(),
                &mut size as *mut u64 as *mut libc::c_void,
                &mut len,
                std::ptr::null_mut(),
                0,
            )
        };
        if r != 0 {
            return 0;
        }
        size
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "freebsd"
    )))]
    {
        0
    }
}

/// Resident set size of this process in bytes, or 0 when unavailable.
pub fn resident_memory() -> u64 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
            return 0;
        };
        let rss_pages: u64 = statm
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
        if page_size < 0 {
            return 0;
        }
        rss_pages * page_size as u64
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        0
    }
}
