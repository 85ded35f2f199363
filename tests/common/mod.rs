//! Shared fakes for mapper integration tests.
//!
//! The real collaborators are kernel services; memfd-backed stand-ins are
//! enough to exercise the registration and cache-maintenance protocol, the
//! same way DMA-BUF code is tested against memfd. Every fake records the
//! calls it receives so tests can assert on protocol order and absence.

#![allow(dead_code)]

use bufmap::backend::{
    ControlDevice, DeviceBufferAllocator, DeviceClient, PhysRange, SecureMemoryService, SsmHandle,
    SyncDirection, SyncOp, SyncRange,
};
use bufmap::{BackendServices, BufferDescriptor, BufferFlags, PixelFormat, Result, SecureId};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

pub fn memfd(len: u64) -> OwnedFd {
    let fd = rustix::fs::memfd_create("bufmap-fake", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
    rustix::fs::ftruncate(&fd, len).unwrap();
    fd
}

/// Map a whole fd for probing what a mapper wrote through its own mapping.
pub fn probe_mapping(fd: BorrowedFd<'_>, len: usize) -> Vec<u8> {
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ,
            MapFlags::SHARED,
            fd,
            0,
        )
        .unwrap()
    };
    let data = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len).to_vec() };
    unsafe { rustix::mm::munmap(ptr, len).unwrap() };
    data
}

// ============================================================================
// Secure shared-memory service fake
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecureCall {
    Open,
    CreateHandle(u32),
    MappedPointer(u64),
    ReleaseMappedPointer(u64),
    ReleaseReference(u64),
    Sync {
        handle: u64,
        op: SyncOp,
        range: Option<SyncRange>,
    },
}

struct Segment {
    _fd: OwnedFd,
    base: usize,
    len: usize,
}

impl Segment {
    fn new(len: usize) -> Self {
        let fd = memfd(len as u64);
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .unwrap()
        };
        Self {
            _fd: fd,
            base: ptr as usize,
            len,
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.base as *mut _, self.len);
        }
    }
}

#[derive(Default)]
struct SecureInner {
    next_handle: u64,
    segments: HashMap<u32, Segment>,
    handles: HashMap<u64, u32>,
}

/// In-process stand-in for the secure shared-memory service.
pub struct FakeSecureService {
    inner: Mutex<SecureInner>,
    calls: Mutex<Vec<SecureCall>>,
    fail_mapping: AtomicBool,
    fail_sync: AtomicBool,
}

impl FakeSecureService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SecureInner::default()),
            calls: Mutex::new(Vec::new()),
            fail_mapping: AtomicBool::new(false),
            fail_sync: AtomicBool::new(false),
        })
    }

    /// Back a secure id with a fresh shared segment.
    pub fn add_buffer(&self, id: SecureId, len: usize) {
        self.inner
            .lock()
            .unwrap()
            .segments
            .insert(id.0, Segment::new(len));
    }

    pub fn set_fail_mapping(&self, fail: bool) {
        self.fail_mapping.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<SecureCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl SecureMemoryService for FakeSecureService {
    fn open(&self) -> Result<()> {
        self.calls.lock().unwrap().push(SecureCall::Open);
        Ok(())
    }

    fn create_handle(&self, id: SecureId) -> Option<SsmHandle> {
        self.calls
            .lock()
            .unwrap()
            .push(SecureCall::CreateHandle(id.0));
        let mut inner = self.inner.lock().unwrap();
        if !inner.segments.contains_key(&id.0) {
            return None;
        }
        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.handles.insert(handle, id.0);
        Some(SsmHandle(handle))
    }

    fn mapped_pointer(&self, handle: SsmHandle) -> Option<NonNull<u8>> {
        self.calls
            .lock()
            .unwrap()
            .push(SecureCall::MappedPointer(handle.0));
        if self.fail_mapping.load(Ordering::Relaxed) {
            return None;
        }
        let inner = self.inner.lock().unwrap();
        let id = inner.handles.get(&handle.0)?;
        let segment = inner.segments.get(id)?;
        NonNull::new(segment.base as *mut u8)
    }

    fn release_mapped_pointer(&self, handle: SsmHandle) {
        self.calls
            .lock()
            .unwrap()
            .push(SecureCall::ReleaseMappedPointer(handle.0));
    }

    fn release_reference(&self, handle: SsmHandle) {
        self.calls
            .lock()
            .unwrap()
            .push(SecureCall::ReleaseReference(handle.0));
        self.inner.lock().unwrap().handles.remove(&handle.0);
    }

    fn sync(&self, handle: SsmHandle, op: SyncOp, range: Option<SyncRange>) -> Result<()> {
        self.calls.lock().unwrap().push(SecureCall::Sync {
            handle: handle.0,
            op,
            range,
        });
        if self.fail_sync.load(Ordering::Relaxed) {
            return Err(bufmap::Error::Backend("injected sync failure".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Device-buffer allocator fake
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    CreateClient(u64),
    DestroyClient(u64),
    Sync {
        client: u64,
        fd: RawFd,
        direction: SyncDirection,
        len: usize,
        offset: usize,
    },
}

/// In-process stand-in for the device-buffer allocator.
pub struct FakeDeviceAllocator {
    next_client: AtomicU64,
    calls: Mutex<Vec<DeviceCall>>,
}

impl FakeDeviceAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_client: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl DeviceBufferAllocator for FakeDeviceAllocator {
    fn create_client(&self) -> Result<DeviceClient> {
        let client = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        self.calls
            .lock()
            .unwrap()
            .push(DeviceCall::CreateClient(client));
        Ok(DeviceClient(client))
    }

    fn destroy_client(&self, client: DeviceClient) {
        self.calls
            .lock()
            .unwrap()
            .push(DeviceCall::DestroyClient(client.0));
    }

    fn sync(
        &self,
        client: DeviceClient,
        fd: RawFd,
        direction: SyncDirection,
        len: usize,
        offset: usize,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(DeviceCall::Sync {
            client: client.0,
            fd,
            direction,
            len,
            offset,
        });
        Ok(())
    }
}

// ============================================================================
// Control device fake
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCall {
    Open,
    SetCacheable(bool),
    Clean(PhysRange),
    Flush(PhysRange),
}

/// In-process stand-in for the cache-control char device, backed by a
/// memfd so window mmaps through its fd actually work.
pub struct FakeControlDevice {
    backing_len: u64,
    fd: OnceLock<OwnedFd>,
    calls: Mutex<Vec<ControlCall>>,
}

impl FakeControlDevice {
    pub fn new(backing_len: u64) -> Arc<Self> {
        Arc::new(Self {
            backing_len,
            fd: OnceLock::new(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Number of clean/flush maintenance ioctls seen.
    pub fn maintenance_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| matches!(call, ControlCall::Clean(_) | ControlCall::Flush(_)))
            .count()
    }

    pub fn backing_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.get().map(|fd| fd.as_fd())
    }
}

impl ControlDevice for FakeControlDevice {
    fn open(&self) -> Result<()> {
        self.calls.lock().unwrap().push(ControlCall::Open);
        if self.fd.get().is_none() {
            let _ = self.fd.set(memfd(self.backing_len));
        }
        Ok(())
    }

    fn set_cacheable(&self, cacheable: bool) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(ControlCall::SetCacheable(cacheable));
        Ok(())
    }

    fn cache_clean(&self, range: PhysRange) -> Result<()> {
        self.calls.lock().unwrap().push(ControlCall::Clean(range));
        Ok(())
    }

    fn cache_flush(&self, range: PhysRange) -> Result<()> {
        self.calls.lock().unwrap().push(ControlCall::Flush(range));
        Ok(())
    }

    fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.get().map(|fd| fd.as_fd())
    }
}

// ============================================================================
// Fixture bundle
// ============================================================================

/// Every fake plus the services bundle wired from them.
pub struct Fixture {
    pub secure: Arc<FakeSecureService>,
    pub device: Arc<FakeDeviceAllocator>,
    pub control: Arc<FakeControlDevice>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            secure: FakeSecureService::new(),
            device: FakeDeviceAllocator::new(),
            control: FakeControlDevice::new(1024 * 1024),
        }
    }

    pub fn services(&self) -> BackendServices {
        BackendServices {
            secure: self.secure.clone(),
            device: self.device.clone(),
            control: self.control.clone(),
        }
    }

    pub fn total_backend_calls(&self) -> usize {
        self.secure.call_count() + self.device.call_count() + self.control.call_count()
    }
}

/// Secure-shared descriptor backed by a segment in the fake service.
pub fn ssm_descriptor(fixture: &Fixture, id: u32, stride_px: u32, height: u32) -> BufferDescriptor {
    let size = (stride_px * 4) as usize * height as usize;
    fixture.secure.add_buffer(SecureId(id), size);
    let mut desc = BufferDescriptor::new(
        PixelFormat::Rgba8888,
        stride_px,
        stride_px,
        size,
        BufferFlags::SECURE_SHARED,
    );
    desc.secure_id = SecureId(id);
    desc
}
