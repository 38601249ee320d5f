//! Socket-local memory.
//!
//! [`SocketBuffer`] owns a fixed-length, page-aligned allocation whose pages
//! are bound to one NUMA node. Binding is strict: if the kernel cannot place
//! the pages on the requested node the allocation fails, it never lands on
//! another node.
//!
//! On hosts that expose a single node (or no node information at all)
//! there is nothing to bind and the buffer is an ordinary aligned allocation.
//! On multi-node hosts a refused or filtered `mbind` is an allocation error.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fs;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use tracing::debug;

use crate::error::{BenchError, Result};

const PAGE_SIZE: usize = 4096;
const NODE_ROOT: &str = "/sys/devices/system/node";

/// A fixed-length buffer allocated on one socket.
///
/// Never resized. The memory is released when the buffer is dropped.
pub struct SocketBuffer<T: Copy> {
    ptr: NonNull<T>,
    len: usize,
    socket: usize,
    layout: Option<Layout>,
}

// SAFETY: the buffer uniquely owns its allocation, like a `Box<[T]>`.
unsafe impl<T: Copy + Send> Send for SocketBuffer<T> {}
unsafe impl<T: Copy + Sync> Sync for SocketBuffer<T> {}

impl<T: Copy> SocketBuffer<T> {
    /// Allocates `len` elements on `socket`, each initialised to `fill`.
    pub fn new(len: usize, socket: usize, fill: T) -> Result<Self> {
        let elem_bytes = size_of::<T>();
        let requested = len.saturating_mul(elem_bytes);
        let alloc_err = || BenchError::Alloc {
            bytes: requested,
            socket,
        };

        if len == 0 || elem_bytes == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len,
                socket,
                layout: None,
            });
        }

        let layout = Layout::array::<T>(len)
            .and_then(|l| l.align_to(PAGE_SIZE.max(align_of::<T>())))
            .map_err(|_| alloc_err())?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc(layout) } as *mut T;
        let Some(ptr) = NonNull::new(raw) else {
            return Err(alloc_err());
        };

        if let Err(e) = bind_to_node(node_count(), ptr.as_ptr() as *mut u8, layout.size(), socket) {
            // SAFETY: allocated above with the same layout.
            unsafe { alloc::dealloc(ptr.as_ptr() as *mut u8, layout) };
            debug!(socket, bytes = requested, error = %e, "mbind refused");
            return Err(alloc_err());
        }

        // First touch happens after binding so the pages fault in on `socket`.
        for i in 0..len {
            // SAFETY: i < len and the allocation holds `len` elements.
            unsafe { ptr.as_ptr().add(i).write(fill) };
        }

        Ok(Self {
            ptr,
            len,
            socket,
            layout: Some(layout),
        })
    }

    pub fn socket(&self) -> usize {
        self.socket
    }
}

impl<T: Copy> Deref for SocketBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: every element was initialised in `new`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy> DerefMut for SocketBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy> Drop for SocketBuffer<T> {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: allocated in `new` with this layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, layout) };
        }
    }
}

impl<T: Copy + std::fmt::Debug> std::fmt::Debug for SocketBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketBuffer")
            .field("len", &self.len)
            .field("socket", &self.socket)
            .finish()
    }
}

/// Binds `addr..addr+bytes` to `node` on a host with `nodes` nodes.
#[cfg(target_os = "linux")]
fn bind_to_node(nodes: usize, addr: *mut u8, bytes: usize, node: usize) -> std::io::Result<()> {
    const MPOL_BIND: libc::c_long = 2;
    const MPOL_MF_STRICT: libc::c_ulong = 1 << 0;
    const MPOL_MF_MOVE: libc::c_ulong = 1 << 1;
    const MASK_BITS: usize = 1024;
    const WORD_BITS: usize = libc::c_ulong::BITS as usize;

    if nodes <= 1 {
        return Ok(());
    }
    if node >= MASK_BITS {
        return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
    }

    let mut mask = [0 as libc::c_ulong; MASK_BITS / WORD_BITS];
    mask[node / WORD_BITS] |= 1 << (node % WORD_BITS);

    // SAFETY: addr..addr+bytes is a live page-aligned allocation we own, and
    // `mask` outlives the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr as *mut libc::c_void,
            bytes as libc::c_ulong,
            MPOL_BIND,
            mask.as_ptr(),
            (MASK_BITS + 1) as libc::c_ulong,
            MPOL_MF_STRICT | MPOL_MF_MOVE,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_to_node(_nodes: usize, _addr: *mut u8, _bytes: usize, _node: usize) -> std::io::Result<()> {
    Ok(())
}

/// Number of NUMA nodes the kernel exposes, at least one.
pub fn node_count() -> usize {
    node_cpu_lists().len().max(1)
}

/// Maps every CPU listed under the node directory to its node.
///
/// CPUs the kernel does not list are absent.
pub fn cpu_to_node() -> HashMap<usize, usize> {
    let mut map = HashMap::new();
    for (node, cpus) in node_cpu_lists() {
        for cpu in cpus {
            map.insert(cpu, node);
        }
    }
    map
}

fn node_cpu_lists() -> Vec<(usize, Vec<usize>)> {
    let Ok(entries) = fs::read_dir(NODE_ROOT) else {
        return Vec::new();
    };
    let mut nodes = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(id) = name
            .to_str()
            .and_then(|n| n.strip_prefix("node"))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        let Ok(list) = fs::read_to_string(entry.path().join("cpulist")) else {
            continue;
        };
        match parse_cpu_list(list.trim()) {
            Ok(cpus) => nodes.push((id, cpus)),
            Err(e) => debug!(node = id, error = %e, "skipping unreadable node"),
        }
    }
    nodes.sort_unstable_by_key(|(id, _)| *id);
    nodes
}

/// Parses a kernel-style CPU list such as `0-3,8,10-11`.
///
/// An empty string is an empty list (memory-only nodes).
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>> {
    let bad = || BenchError::CpuList(list.to_owned());
    let mut cpus = Vec::new();
    if list.is_empty() {
        return Ok(cpus);
    }
    for part in list.split(',') {
        let part = part.trim();
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().map_err(|_| bad())?;
                let hi: usize = hi.trim().parse().map_err(|_| bad())?;
                if lo > hi {
                    return Err(bad());
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().map_err(|_| bad())?),
        }
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;

    #[test]
    fn buffer_is_filled_and_sized() {
        let buf = SocketBuffer::new(1000, 0, Key::new(1, 2)).unwrap();
        assert_eq!(buf.len(), 1000);
        assert_eq!(buf.socket(), 0);
        assert!(buf.iter().all(|k| *k == Key::new(1, 2)));
        assert_eq!(buf.as_ptr() as usize % PAGE_SIZE, 0);
    }

    #[test]
    fn buffer_is_writable() {
        let mut buf = SocketBuffer::new(16, 0, 0u64).unwrap();
        for (i, v) in buf.iter_mut().enumerate() {
            *v = i as u64;
        }
        assert_eq!(buf[15], 15);
    }

    #[test]
    fn empty_buffer() {
        let buf = SocketBuffer::new(0, 0, Key::ZERO).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn impossible_allocation_names_size_and_socket() {
        let err = SocketBuffer::new(usize::MAX / 8, 3, Key::ZERO).unwrap_err();
        match err {
            BenchError::Alloc { bytes, socket } => {
                assert_eq!(socket, 3);
                assert_eq!(bytes, usize::MAX);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn cpu_lists() {
        assert_eq!(parse_cpu_list("0-3,8,10-11").unwrap(), vec![0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(parse_cpu_list("5").unwrap(), vec![5]);
        assert!(parse_cpu_list("").unwrap().is_empty());
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("a-b").is_err());
        assert!(parse_cpu_list("1,,2").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn refused_bind_is_an_error_with_several_nodes() {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        let page = unsafe { alloc::alloc(layout) };
        assert!(!page.is_null());

        // Single node: nothing to bind.
        assert!(bind_to_node(1, page, PAGE_SIZE, 1023).is_ok());
        // Node 1023 does not exist, and filtered syscalls fail too.
        assert!(bind_to_node(2, page, PAGE_SIZE, 1023).is_err());
        // Beyond the node mask.
        assert!(bind_to_node(2, page, PAGE_SIZE, 4096).is_err());

        unsafe { alloc::dealloc(page, layout) };
    }

    #[test]
    fn at_least_one_node() {
        assert!(node_count() >= 1);
    }
}
