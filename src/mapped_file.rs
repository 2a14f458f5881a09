use anyhow::*;
use libc::c_void;
use more_asserts::*;
use std::fs::OpenOptions;
use std::ops::Index;
use std::os::fd::AsRawFd;
use std::path::Path;

/// Interpret offsets of a memory mapped cache image as references to
/// arbitrary types, and write back into it. Regular files and block
/// devices both work; block device length comes from BLKGETSIZE64.

pub struct MappedFile {
    pointer: *mut c_void,
    len: usize,
    mapping_size: usize,
    writable: bool,
}

// Shared mutation goes through write_at() only, and callers serialise
// writes to any given region (bucket ownership / node locks).
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    pub fn open(file: &Path, writable: bool) -> Result<MappedFile> {
        let f = OpenOptions::new().read(true).write(writable).open(file)?;
        let md = f.metadata()?;
        let len = if md.is_file() {
            md.len() as usize
        } else {
            //assume block device
            let mut len64 = 0_u64;
            let len_ref = &mut len64 as *mut u64;
            let ret = unsafe { ioctls::blkgetsize64(f.as_raw_fd(), len_ref) };
            assert_eq!(0, ret);
            len64 as usize
        };
        let ps = sysconf::page::pagesize();
        let mapping_size = ((len + ps - 1) / ps) * ps;
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        let flags = if writable {
            libc::MAP_SHARED
        } else {
            libc::MAP_PRIVATE
        };
        let p = unsafe {
            libc::mmap(0 as *mut c_void, len, prot, flags, f.as_raw_fd(), 0)
        };
        if libc::MAP_FAILED == p {
            return Err(anyhow!(
                "Failed to map file: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(MappedFile {
            pointer: p,
            len,
            mapping_size,
            writable,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a reference to T. T should be a primitive type or
    /// (probably) #[repr(C)]
    /// panics if the index is out of bounds.
    pub fn at<T>(&self, offset: usize) -> &T {
        if self.len - std::mem::size_of::<T>() < offset {
            panic!("access beyond end of file");
        }
        unsafe { &*((self.pointer as usize + offset) as *mut c_void as *const T) }
    }

    /// Returns a slice of u8s representing part of the mapped file
    pub fn slice(&self, offset: usize, length: usize) -> &[u8] {
        assert_le!(offset + length, self.len);
        unsafe {
            std::slice::from_raw_parts(
                &*((self.pointer as usize + offset) as *mut c_void as *const u8),
                length,
            )
        }
    }

    /// Copy `data` into the mapping at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        assert!(self.writable);
        assert_le!(offset + data.len(), self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.pointer as usize + offset) as *mut u8,
                data.len(),
            );
        }
    }

    /// msync the whole mapping; durability point for everything written
    /// through write_at so far.
    pub fn sync(&self) -> Result<()> {
        let ret = unsafe {
            libc::msync(self.pointer, self.mapping_size, libc::MS_SYNC)
        };
        if ret != 0 {
            return Err(anyhow!(
                "msync failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            let ret = libc::munmap(self.pointer, self.mapping_size);
            assert_eq!(ret, 0);
        }
    }
}

impl Index<usize> for MappedFile {
    type Output = u8;

    fn index(&self, idx: usize) -> &Self::Output {
        if self.len <= idx {
            panic!("access beyond end of file");
        }
        unsafe { &*((self.pointer as usize + idx) as *mut c_void as *const u8) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_index() -> Result<()> {
        let mf = MappedFile::open(Path::new("Cargo.toml"), false)?;
        assert_eq!(mf[0], b'[');
        assert_eq!(mf[1], b'p');
        assert_eq!(mf[2], b'a');
        assert_eq!(mf[3], b'c');
        assert_eq!(mf[4], b'k');
        assert_eq!(mf[0], b'[');
        Ok(())
    }

    #[test]
    fn file_at() -> Result<()> {
        let mf = MappedFile::open(Path::new("Cargo.toml"), false)?;
        assert_eq!(*mf.at::<u8>(0), b'[');
        assert_eq!(*mf.at::<u8>(1), b'p');
        Ok(())
    }

    #[test]
    fn write_then_read_back() -> Result<()> {
        let tmp = tempfile::NamedTempFile::new()?;
        tmp.as_file().set_len(8192)?;
        let mf = MappedFile::open(tmp.path(), true)?;
        mf.write_at(4096, &[1, 2, 3, 4]);
        mf.sync()?;
        assert_eq!(mf.slice(4096, 4), &[1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "access beyond end of file")]
    fn file_index_panic() {
        let mf = MappedFile::open(Path::new("Cargo.toml"), false).unwrap();
        mf[mf.len()];
    }
}
