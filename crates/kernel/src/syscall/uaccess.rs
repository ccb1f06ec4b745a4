// User-memory access.
//
// All transfers go through explicit page-table translation against the
// owning thread's root, page by page, so a handler can run on any kernel
// thread regardless of the active address space.

use crate::config::PAGE_SIZE;
use crate::error::{Errno, Result};
use crate::mem::paging::translate_byte;
use crate::mem::PhysAddr;
use alloc::string::String;
use alloc::vec::Vec;

fn chunk(va: u64, remaining: usize) -> usize {
    let in_page = PAGE_SIZE - (va as usize & (PAGE_SIZE - 1));
    in_page.min(remaining)
}

pub fn copy_from_user(root: PhysAddr, va: u64, len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut va = va;
    let mut remaining = len;
    while remaining > 0 {
        let n = chunk(va, remaining);
        let ptr = translate_byte(root, va).ok_or(Errno::EFAULT)?;
        out.extend_from_slice(unsafe { core::slice::from_raw_parts(ptr, n) });
        va += n as u64;
        remaining -= n;
    }
    Ok(out)
}

pub fn copy_to_user(root: PhysAddr, va: u64, bytes: &[u8]) -> Result<()> {
    let mut va = va;
    let mut offset = 0;
    while offset < bytes.len() {
        let n = chunk(va, bytes.len() - offset);
        let ptr = translate_byte(root, va).ok_or(Errno::EFAULT)?;
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr().add(offset), ptr, n);
        }
        va += n as u64;
        offset += n;
    }
    Ok(())
}

/// Read a NUL-terminated string, refusing anything longer than `max`.
pub fn read_user_str(root: PhysAddr, va: u64, max: usize) -> Result<String> {
    let mut out = Vec::new();
    let mut va = va;
    loop {
        let n = chunk(va, max + 1 - out.len());
        if n == 0 {
            return Err(Errno::EINVAL);
        }
        let ptr = translate_byte(root, va).ok_or(Errno::EFAULT)?;
        let bytes = unsafe { core::slice::from_raw_parts(ptr, n) };
        if let Some(nul) = bytes.iter().position(|&b| b == 0) {
            out.extend_from_slice(&bytes[..nul]);
            return String::from_utf8(out).map_err(|_| Errno::EINVAL);
        }
        out.extend_from_slice(bytes);
        if out.len() > max {
            return Err(Errno::EINVAL);
        }
        va += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::paging::{new_root, vmm_allocate, VmmFlags};

    fn setup_root_with_page(va: u64) -> PhysAddr {
        crate::mem::ensure_test_init();
        let root = new_root().unwrap();
        assert_ne!(
            vmm_allocate(root, va, va + 2 * PAGE_SIZE as u64, 2, VmmFlags::USER | VmmFlags::WRITE),
            0
        );
        root
    }

    #[test]
    fn round_trip_across_page_boundary() {
        let va = 0x7000;
        let root = setup_root_with_page(va);
        let data: Vec<u8> = (0..PAGE_SIZE + 100).map(|i| (i % 251) as u8).collect();
        let start = va + (PAGE_SIZE - 50) as u64;

        copy_to_user(root, start, &data[..PAGE_SIZE + 50]).unwrap();
        let back = copy_from_user(root, start, PAGE_SIZE + 50).unwrap();
        assert_eq!(back, data[..PAGE_SIZE + 50]);
    }

    #[test]
    fn unmapped_address_faults() {
        crate::mem::ensure_test_init();
        let root = new_root().unwrap();
        assert_eq!(copy_from_user(root, 0x9000, 8).unwrap_err(), Errno::EFAULT);
        assert_eq!(copy_to_user(root, 0x9000, b"x").unwrap_err(), Errno::EFAULT);
    }

    #[test]
    fn user_string_reads_until_nul() {
        let va = 0xA000;
        let root = setup_root_with_page(va);
        copy_to_user(root, va, b"/tmp/x\0trailing").unwrap();
        assert_eq!(read_user_str(root, va, 64).unwrap(), "/tmp/x");
    }

    #[test]
    fn user_string_respects_max() {
        let va = 0xC000;
        let root = setup_root_with_page(va);
        copy_to_user(root, va, b"abcdefgh\0").unwrap();
        assert_eq!(read_user_str(root, va, 4).unwrap_err(), Errno::EINVAL);
    }
}
