//! Queries about the calling polling context.

use crate::api::SocketId;

/// NUMA node of the CPU the calling thread is running on, if the platform
/// reports one.
#[cfg(target_os = "linux")]
pub fn socket_id() -> Option<SocketId> {
    let mut cpu: libc::c_uint = 0;
    let mut node: libc::c_uint = 0;
    // SAFETY: `getcpu` only writes through the two pointers, both valid
    // for the duration of the call; the cache argument may be null.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_getcpu,
            &mut cpu as *mut libc::c_uint,
            &mut node as *mut libc::c_uint,
            std::ptr::null_mut::<libc::c_void>(),
        )
    };
    if ret < 0 { None } else { Some(node) }
}

#[cfg(not(target_os = "linux"))]
pub fn socket_id() -> Option<SocketId> {
    None
}

/// Parses a sysfs `numa_node` attribute, where `-1` means no affinity.
pub(crate) fn parse_numa_node(raw: &str) -> Option<SocketId> {
    raw.trim().parse::<i64>().ok().and_then(|n| SocketId::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numa_node() {
        assert_eq!(parse_numa_node("0\n"), Some(0));
        assert_eq!(parse_numa_node("3"), Some(3));
        assert_eq!(parse_numa_node("-1\n"), None);
        assert_eq!(parse_numa_node("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_socket_id_is_reported() {
        assert!(socket_id().is_some());
    }
}
