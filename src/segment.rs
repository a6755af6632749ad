/*
 * The segment is a single POSIX shared memory object that every process maps.
 * Objects inside it are found by name through a small directory in the
 * header, and carved out of the rest of the mapping with a bump allocator.
 * Nothing is ever freed: records are reused in place and the whole object
 * goes away only through Segment::reset.
 *
 * Since pointers are meaningless across address spaces, handles to named
 * objects hold the mapping and an offset instead of a reference.
 */
use crate::constants::{
    LAYOUT_VERSION, MAX_NAMED_OBJECTS, MAX_OBJECT_NAME, OBJECT_ALIGN, SEGMENT_HEADER_SIZE,
    SEGMENT_MAGIC,
};
use crate::error::{Error, Result};
use crate::signal::RawMutex;
use crate::utils::{compute_crc32, type_fingerprint};
use log::{debug, info, warn};
use serde::Serialize;
use std::ffi::CString;
use std::marker::PhantomData;
use std::ops::Deref;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Marker for types that can be placed in the segment.
///
/// # Safety
///
/// Implementors must be plain data without pointers or heap ownership, must
/// be valid when every byte is zero (a freshly allocated object is all
/// zeroes) and must only be mutated through atomics or while holding a
/// segment mutex.
pub unsafe trait SharedObject: Send + Sync + 'static {
    /// Name stored with every named object of this type. It must stay the
    /// same across builds and differ between types with different layouts.
    fn type_tag() -> String
    where
        Self: Sized;
}

unsafe impl SharedObject for AtomicU32 {
    fn type_tag() -> String {
        return "atomic_u32".to_string();
    }
}

unsafe impl SharedObject for AtomicU64 {
    fn type_tag() -> String {
        return "atomic_u64".to_string();
    }
}

#[repr(C)]
struct SegmentHeader {
    magic: AtomicU64,
    layout: u32,
    entry_count: u32,
    total_size: u64,
    next_free: u64,
    alloc_lock: RawMutex,
}

#[repr(C)]
struct DirectoryEntry {
    name: [u8; MAX_OBJECT_NAME],
    offset: u64,
    size: u64,
    len: u64,
    fingerprint: u32,
    _pad: u32,
}

impl DirectoryEntry {
    fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(MAX_OBJECT_NAME);
        return &self.name[..end];
    }
}

fn align_up(pos: usize, align: usize) -> usize {
    return (pos + align - 1) / align * align;
}

fn data_start() -> usize {
    return align_up(
        SEGMENT_HEADER_SIZE + MAX_NAMED_OBJECTS * std::mem::size_of::<DirectoryEntry>(),
        OBJECT_ALIGN,
    );
}

fn layout_fingerprint() -> u32 {
    let mut data = Vec::new();
    data.extend_from_slice(&LAYOUT_VERSION.to_ne_bytes());
    data.extend_from_slice(&(std::mem::size_of::<SegmentHeader>() as u64).to_ne_bytes());
    data.extend_from_slice(&(std::mem::size_of::<DirectoryEntry>() as u64).to_ne_bytes());
    data.extend_from_slice(&(MAX_NAMED_OBJECTS as u64).to_ne_bytes());
    return compute_crc32(&data);
}

/// Shared memory names must look like "/name" with no further slashes.
pub fn normalize_name(name: &str) -> Result<String> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() || bare.len() > 254 || bare.contains('/') || bare.contains('\0') {
        return Err(Error::InvalidName(name.to_string()));
    }
    return Ok(format!("/{}", bare));
}

fn c_name(name: &str) -> Result<CString> {
    return CString::new(name).map_err(|_| Error::InvalidName(name.to_string()));
}

// exclusive flock on the shm descriptor, held while sizing and formatting
struct InitLock {
    fd: RawFd,
}

impl InitLock {
    fn acquire(fd: RawFd) -> std::io::Result<InitLock> {
        // SAFETY: fd is an open descriptor owned by the caller, who keeps it
        // open for longer than the lock.
        if unsafe { libc::flock(fd, libc::LOCK_EX) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        return Ok(InitLock { fd });
    }
}

impl Drop for InitLock {
    fn drop(&mut self) {
        // SAFETY: see acquire.
        unsafe {
            libc::flock(self.fd, libc::LOCK_UN);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentStatus {
    pub name: String,
    pub size: usize,
    pub free: usize,
    pub objects: usize,
}

pub struct Segment {
    name: String,
    // keeps the shm object open for as long as it is mapped
    _fd: OwnedFd,
    addr: *mut u8,
    n_bytes: usize,
}

// The mapping is shared memory, every mutable access goes through atomics or
// a segment mutex.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Opens the named segment, creating and formatting it if this is the
    /// first process to get here. An existing segment keeps its size and its
    /// contents, `n_bytes` only applies when creating.
    pub fn open_or_create(name: &str, n_bytes: usize) -> Result<Arc<Segment>> {
        let name = normalize_name(name)?;
        let min_size = data_start() + OBJECT_ALIGN;
        if n_bytes < min_size {
            return Err(Error::segment_unavailable(
                &name,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} bytes is below the minimum of {}", n_bytes, min_size),
                ),
            ));
        }

        let path = c_name(&name)?;
        // SAFETY: path is a valid NUL terminated string.
        let raw_fd = unsafe {
            libc::shm_open(
                path.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o660 as libc::mode_t,
            )
        };
        if raw_fd < 0 {
            return Err(Error::segment_unavailable(
                &name,
                std::io::Error::last_os_error(),
            ));
        }
        // SAFETY: shm_open just handed us this descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        let init_lock =
            InitLock::acquire(fd.as_raw_fd()).map_err(|e| Error::segment_unavailable(&name, e))?;

        // SAFETY: stat is plain data, fstat fills it in.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } < 0 {
            return Err(Error::segment_unavailable(
                &name,
                std::io::Error::last_os_error(),
            ));
        }

        let mut size = stat.st_size as usize;
        if size == 0 {
            // SAFETY: fd is open for writing.
            if unsafe { libc::ftruncate(fd.as_raw_fd(), n_bytes as libc::off_t) } < 0 {
                return Err(Error::segment_unavailable(
                    &name,
                    std::io::Error::last_os_error(),
                ));
            }
            size = n_bytes;
        } else if size != n_bytes {
            info!(
                "attaching to existing segment {} of {} bytes (asked for {})",
                name, size, n_bytes
            );
        }
        if size < min_size {
            return Err(Error::segment_unavailable(
                &name,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("existing object is only {} bytes", size),
                ),
            ));
        }

        // SAFETY: mapping a regular shm descriptor of `size` bytes.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::segment_unavailable(
                &name,
                std::io::Error::last_os_error(),
            ));
        }

        let segment = Segment {
            name,
            _fd: fd,
            addr: addr as *mut u8,
            n_bytes: size,
        };
        let formatted = segment.format_or_check();
        drop(init_lock);
        formatted?;
        return Ok(Arc::new(segment));
    }

    /// Removes the backing object. Processes that still have it mapped keep
    /// using the unlinked object, new openers get a fresh one. Returns false
    /// if there was nothing to remove.
    pub fn reset(name: &str) -> Result<bool> {
        let name = normalize_name(name)?;
        let path = c_name(&name)?;
        // SAFETY: path is a valid NUL terminated string.
        if unsafe { libc::shm_unlink(path.as_ptr()) } < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::NotFound {
                debug!("reset of {}: nothing to remove", name);
                return Ok(false);
            }
            return Err(Error::Io(err));
        }
        info!("removed shared memory segment {}", name);
        return Ok(true);
    }

    pub fn exists(name: &str) -> Result<bool> {
        let name = normalize_name(name)?;
        let path = c_name(&name)?;
        // SAFETY: path is a valid NUL terminated string.
        let raw_fd = unsafe { libc::shm_open(path.as_ptr(), libc::O_RDONLY, 0) };
        if raw_fd < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::NotFound {
                return Ok(false);
            }
            return Err(Error::Io(err));
        }
        // SAFETY: closes the descriptor shm_open just returned.
        drop(unsafe { OwnedFd::from_raw_fd(raw_fd) });
        return Ok(true);
    }

    pub fn name(&self) -> &str {
        return &self.name;
    }

    pub fn len(&self) -> usize {
        return self.n_bytes;
    }

    fn header(&self) -> *mut SegmentHeader {
        return self.addr as *mut SegmentHeader;
    }

    fn entry(&self, index: usize) -> *mut DirectoryEntry {
        debug_assert!(index < MAX_NAMED_OBJECTS);
        // SAFETY: the directory lies inside the mapping, checked at open.
        return unsafe {
            self.addr
                .add(SEGMENT_HEADER_SIZE + index * std::mem::size_of::<DirectoryEntry>())
                as *mut DirectoryEntry
        };
    }

    fn format_or_check(&self) -> Result<()> {
        let header = self.header();
        let expected = layout_fingerprint();
        // SAFETY: the header lies inside the mapping and we hold the flock.
        unsafe {
            if (*header).magic.load(Ordering::Acquire) != SEGMENT_MAGIC {
                info!(
                    "formatting shared memory segment {} ({} bytes)",
                    self.name, self.n_bytes
                );
                (*header).layout = expected;
                (*header).entry_count = 0;
                (*header).total_size = self.n_bytes as u64;
                (*header).next_free = data_start() as u64;
                (*header).magic.store(SEGMENT_MAGIC, Ordering::Release);
                return Ok(());
            }

            let found = (*header).layout;
            if found != expected {
                return Err(Error::LayoutMismatch { expected, found });
            }
            debug!(
                "attached to segment {} with {} named objects",
                self.name,
                (*header).entry_count
            );
        }
        return Ok(());
    }

    // Returns (offset, element count) of the named object, allocating it on
    // first use.
    fn find_or_allocate<T: SharedObject>(&self, name: &str, len: usize) -> Result<(usize, usize)> {
        if name.is_empty() || name.len() >= MAX_OBJECT_NAME || name.contains('\0') {
            return Err(Error::InvalidName(name.to_string()));
        }
        let fingerprint = type_fingerprint::<T>();
        let header = self.header();

        // SAFETY: header and directory lie inside the mapping, and both are
        // only touched under the allocation lock from here on.
        unsafe {
            let _guard = (*header).alloc_lock.lock();
            let count = ((*header).entry_count as usize).min(MAX_NAMED_OBJECTS);
            for i in 0..count {
                let entry = &*self.entry(i);
                if entry.name_bytes() != name.as_bytes() {
                    continue;
                }
                if entry.fingerprint != fingerprint {
                    return Err(Error::TypeMismatch {
                        name: name.to_string(),
                        expected: fingerprint,
                        found: entry.fingerprint,
                    });
                }
                if entry.len as usize != len {
                    warn!(
                        "{} already exists with {} elements, ignoring requested {}",
                        name, entry.len, len
                    );
                }
                return Ok((entry.offset as usize, entry.len as usize));
            }

            if count >= MAX_NAMED_OBJECTS {
                return Err(Error::DirectoryFull {
                    name: name.to_string(),
                });
            }

            let align = OBJECT_ALIGN.max(std::mem::align_of::<T>());
            let offset = align_up((*header).next_free as usize, align);
            let requested = std::mem::size_of::<T>().saturating_mul(len);
            let available = self.n_bytes.saturating_sub(offset);
            if requested > available {
                return Err(Error::OutOfSegmentMemory {
                    name: name.to_string(),
                    requested,
                    available,
                });
            }

            let entry = &mut *self.entry(count);
            entry.name = [0; MAX_OBJECT_NAME];
            entry.name[..name.len()].copy_from_slice(name.as_bytes());
            entry.offset = offset as u64;
            entry.size = requested as u64;
            entry.len = len as u64;
            entry.fingerprint = fingerprint;
            (*header).next_free = (offset + requested) as u64;
            (*header).entry_count = (count + 1) as u32;

            debug!(
                "allocated {} in {}: {} x {} bytes at {}",
                name,
                self.name,
                len,
                std::mem::size_of::<T>(),
                offset
            );
            return Ok((offset, len));
        }
    }

    /// Finds the named object, constructing it (all zeroes) on first access
    /// from any process.
    pub fn find_or_construct<T: SharedObject>(self: &Arc<Self>, name: &str) -> Result<Shared<T>> {
        let (offset, _) = self.find_or_allocate::<T>(name, 1)?;
        return Ok(Shared {
            segment: self.clone(),
            offset,
            _marker: PhantomData,
        });
    }

    /// Like find_or_construct for a fixed length array. The length recorded
    /// by whichever process created the array wins.
    pub fn find_or_construct_array<T: SharedObject>(
        self: &Arc<Self>,
        name: &str,
        len: usize,
    ) -> Result<SharedArray<T>> {
        let (offset, len) = self.find_or_allocate::<T>(name, len)?;
        return Ok(SharedArray {
            segment: self.clone(),
            offset,
            len,
            _marker: PhantomData,
        });
    }

    pub fn status(&self) -> SegmentStatus {
        let header = self.header();
        // SAFETY: read under the allocation lock.
        let (used, objects) = unsafe {
            let _guard = (*header).alloc_lock.lock();
            ((*header).next_free as usize, (*header).entry_count as usize)
        };
        return SegmentStatus {
            name: self.name.clone(),
            size: self.n_bytes,
            free: self.n_bytes.saturating_sub(used),
            objects,
        };
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: addr/n_bytes come from the successful mmap in open_or_create.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.n_bytes);
        }
    }
}

/// Handle to a named object. Keeps the mapping alive.
pub struct Shared<T: SharedObject> {
    segment: Arc<Segment>,
    offset: usize,
    _marker: PhantomData<T>,
}

impl<T: SharedObject> Shared<T> {
    pub fn segment(&self) -> &Arc<Segment> {
        return &self.segment;
    }
}

impl<T: SharedObject> Clone for Shared<T> {
    fn clone(&self) -> Self {
        return Shared {
            segment: self.segment.clone(),
            offset: self.offset,
            _marker: PhantomData,
        };
    }
}

impl<T: SharedObject> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: offset was handed out by the allocator for a T, aligned,
        // inside the mapping, and the mapping lives as long as self.segment.
        return unsafe { &*(self.segment.addr.add(self.offset) as *const T) };
    }
}

/// Handle to a named array of objects.
pub struct SharedArray<T: SharedObject> {
    segment: Arc<Segment>,
    offset: usize,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: SharedObject> SharedArray<T> {
    pub fn segment(&self) -> &Arc<Segment> {
        return &self.segment;
    }
}

impl<T: SharedObject> Clone for SharedArray<T> {
    fn clone(&self) -> Self {
        return SharedArray {
            segment: self.segment.clone(),
            offset: self.offset,
            len: self.len,
            _marker: PhantomData,
        };
    }
}

impl<T: SharedObject> Deref for SharedArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: see Shared::deref, the allocation holds len elements.
        return unsafe {
            std::slice::from_raw_parts(self.segment.addr.add(self.offset) as *const T, self.len)
        };
    }
}
