//! Buffer registration, lock/unlock and the per-process state table.
//!
//! One [`Mapper`] exists per process. Registration turns a descriptor
//! received over IPC into a locally valid mapping; lock hands out CPU
//! pointers and records access intent; unlock performs the cache
//! maintenance the owning backend needs; unregistration tears the local
//! mapping down. Lock state is per-process bookkeeping only — processes
//! sharing a buffer coordinate access among themselves.
//!
//! # Locking
//!
//! A single map lock serializes every backend side effect of registration
//! and unregistration, including the lazy one-time opens of the secure
//! service and the control device. Lock and unlock never take it: they
//! read the state table under a short read lock and mutate only atomics
//! and the region map, which has its own narrower lock.

use crate::backend::{
    Backend, ControlDevice, DeviceBufferAllocator, DeviceClient, PhysRange, SecureMemoryService,
    SsmHandle, SyncDirection, SyncOp, SyncRange,
};
use crate::descriptor::{BufferDescriptor, BufferFlags, BufferKey};
use crate::error::{Error, Result};
use crate::map::{self, MappedRange};
use crate::region::{Rect, RegionMap};
use bitflags::bitflags;
use rustix::fd::BorrowedFd;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

bitflags! {
    /// Caller intent for a lock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Usage: u32 {
        /// CPU reads through the returned pointer.
        const SW_READ = 1 << 0;
        /// CPU writes through the returned pointer.
        const SW_WRITE = 1 << 1;
        /// Planar/YUV addressing: one pointer per plane.
        const YUV_ADDR = 1 << 2;
        /// Hardware-only consumer; no CPU pointer is produced.
        const HW_ONLY = 1 << 8;
    }
}

const LOCK_READ: u8 = 1 << 0;
const LOCK_WRITE: u8 = 1 << 1;

/// Pointer(s) granted by a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockedAddr {
    /// Single CPU-visible payload pointer.
    Single(NonNull<u8>),
    /// Y, U and V plane pointers for planar layouts.
    Planes([NonNull<u8>; 3]),
    /// Hardware-only usage; no CPU pointer was produced.
    Inaccessible,
}

/// Outcome of the cache maintenance performed by [`Mapper::unlock`].
///
/// Maintenance failures never fail the unlock — a caller unable to unlock
/// would be stuck — but the swallowing is observable here instead of
/// silent: every failed flush degrades the outcome and is logged.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every required flush or invalidate completed.
    Complete,
    /// At least one maintenance operation failed and was skipped.
    Degraded,
}

impl SyncOutcome {
    /// True when some maintenance operation was skipped.
    pub fn is_degraded(self) -> bool {
        matches!(self, SyncOutcome::Degraded)
    }
}

/// Mapper construction options.
#[derive(Debug, Clone)]
pub struct MapperConfig {
    /// Track last-locked rectangles and restrict flushes to them.
    pub partial_flush: bool,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self { partial_flush: true }
    }
}

/// The backend collaborators a mapper drives.
pub struct BackendServices {
    /// Secure shared-memory service (secure-id referenced buffers).
    pub secure: Arc<dyn SecureMemoryService>,
    /// Device-buffer allocator (fd referenced buffers).
    pub device: Arc<dyn DeviceBufferAllocator>,
    /// Cache-control device (physically contiguous buffers).
    pub control: Arc<dyn ControlDevice>,
}

/// Per-process state of one registered buffer.
struct Registration {
    backend: Backend,
    base: NonNull<u8>,
    mapping: Option<MappedRange>,
    ssm_handle: Option<SsmHandle>,
    device_client: Option<DeviceClient>,
    lock_state: AtomicU8,
    last_writer: AtomicU8,
}

// SAFETY: base aliases the mapping (or the service-held pointer), both
// valid until unregistration, which the mapper serializes.
unsafe impl Send for Registration {}
unsafe impl Sync for Registration {}

impl Registration {
    fn new(backend: Backend, base: NonNull<u8>) -> Self {
        Self {
            backend,
            base,
            mapping: None,
            ssm_handle: None,
            device_client: None,
            lock_state: AtomicU8::new(0),
            last_writer: AtomicU8::new(0),
        }
    }
}

/// Lazy-open state of the process-wide backend handles, guarded by the
/// map lock.
#[derive(Default)]
struct BackendState {
    ssm_open: bool,
    control_open: bool,
}

/// Per-process buffer registration and mapping context.
///
/// Explicitly constructed and explicitly dropped by the host process; all
/// formerly process-global state (lazily opened service handles, the
/// region list) lives here. Dropping the mapper does not unregister
/// buffers — the host unregisters what it registered.
pub struct Mapper {
    config: MapperConfig,
    services: BackendServices,
    map_lock: Mutex<BackendState>,
    registrations: RwLock<HashMap<BufferKey, Registration>>,
    regions: RegionMap,
}

impl Mapper {
    /// Create a mapper over the given backend services.
    pub fn new(config: MapperConfig, services: BackendServices) -> Self {
        Self {
            config,
            services,
            map_lock: Mutex::new(BackendState::default()),
            registrations: RwLock::new(HashMap::new()),
            regions: RegionMap::default(),
        }
    }

    /// Register a buffer in this process: resolve its backend, create the
    /// local mapping and initialize lock bookkeeping.
    ///
    /// Framebuffer buffers are a no-op success — their memory is owned and
    /// mapped by the display path. Registering a buffer this process
    /// already registered leaves the existing mapping authoritative.
    pub fn register(&self, desc: &BufferDescriptor) -> Result<()> {
        desc.validate()?;

        let backend = Backend::resolve(desc.flags);
        debug!(?backend, flags = desc.flags.bits(), "register");

        if backend == Backend::Unsupported {
            return Err(Error::UnsupportedBackend(desc.flags.bits()));
        }

        if self.config.partial_flush
            && desc
                .flags
                .intersects(BufferFlags::SECURE_SHARED | BufferFlags::FRAMEBUFFER)
        {
            self.regions.insert(desc.secure_id, desc.stride_bytes());
        }

        if backend == Backend::Framebuffer {
            return Ok(());
        }

        let key = desc.key();
        let mut state = self.map_lock.lock().unwrap();

        if self.registrations.read().unwrap().contains_key(&key) {
            debug!(?key, "already registered in this process");
            return Ok(());
        }

        let registration = match backend {
            Backend::SecureShared => self.register_secure(desc, &mut state)?,
            Backend::DeviceBuffer => self.register_device_buffer(desc)?,
            Backend::DirectWindow | Backend::DirectFd => {
                self.register_direct(desc, backend, &mut state)?
            }
            Backend::Framebuffer | Backend::Unsupported => unreachable!(),
        };

        self.registrations.write().unwrap().insert(key, registration);
        Ok(())
    }

    fn register_secure(
        &self,
        desc: &BufferDescriptor,
        state: &mut BackendState,
    ) -> Result<Registration> {
        if !state.ssm_open {
            self.services
                .secure
                .open()
                .map_err(|e| Error::Backend(format!("secure service open: {e}")))?;
            state.ssm_open = true;
        }

        let handle = self
            .services
            .secure
            .create_handle(desc.secure_id)
            .ok_or_else(|| {
                Error::Backend(format!("no handle for secure id {}", desc.secure_id.0))
            })?;

        let Some(base) = self.services.secure.mapped_pointer(handle) else {
            // Roll back the half-acquired reference.
            self.services.secure.release_reference(handle);
            return Err(Error::Backend("secure mapping unavailable".into()));
        };

        let mut registration = Registration::new(Backend::SecureShared, base);
        registration.ssm_handle = Some(handle);

        // Combined secure + device-buffer allocations also need an
        // allocator client for the sync issued at unlock.
        if desc.flags.contains(BufferFlags::DEVICE_BUFFER) {
            match self.services.device.create_client() {
                Ok(client) => registration.device_client = Some(client),
                Err(err) => {
                    self.services.secure.release_mapped_pointer(handle);
                    self.services.secure.release_reference(handle);
                    return Err(Error::Backend(format!("allocator client: {err}")));
                }
            }
        }

        Ok(registration)
    }

    fn register_device_buffer(&self, desc: &BufferDescriptor) -> Result<Registration> {
        let client = self
            .services
            .device
            .create_client()
            .map_err(|e| Error::Backend(format!("allocator client: {e}")))?;

        // SAFETY: the transport keeps the descriptor's fd open for as long
        // as the descriptor is alive in this process.
        let fd = unsafe { BorrowedFd::borrow_raw(desc.fd) };
        let mapping = match map::map_device_buffer(fd, desc.size, desc.offset) {
            Ok(mapping) => mapping,
            Err(err) => {
                self.services.device.destroy_client(client);
                return Err(err);
            }
        };

        let mut registration = Registration::new(Backend::DeviceBuffer, mapping.base);
        registration.mapping = Some(mapping);
        registration.device_client = Some(client);
        Ok(registration)
    }

    fn register_direct(
        &self,
        desc: &BufferDescriptor,
        backend: Backend,
        state: &mut BackendState,
    ) -> Result<Registration> {
        if !state.control_open {
            self.services
                .control
                .open()
                .map_err(|e| Error::Backend(format!("control device open: {e}")))?;
            state.control_open = true;
        }

        let cacheable = !desc.flags.contains(BufferFlags::NON_CACHEABLE);
        if let Err(err) = self.services.control.set_cacheable(cacheable) {
            warn!(%err, cacheable, "failed to set mapping cacheability");
        }

        let mapping = if backend == Backend::DirectWindow {
            let ctl_fd = self
                .services
                .control
                .fd()
                .ok_or_else(|| Error::Backend("control device exposes no fd".into()))?;
            map::map_direct_window(ctl_fd, desc.window_kib, desc.paddr, desc.offset)?
        } else {
            // SAFETY: as in register_device_buffer.
            let fd = unsafe { BorrowedFd::borrow_raw(desc.fd) };
            map::map_direct_fd(fd, desc.size, desc.offset)?
        };

        let mut registration = Registration::new(backend, mapping.base);
        registration.mapping = Some(mapping);
        Ok(registration)
    }

    /// Unregister a buffer, tearing down whatever this process mapped.
    ///
    /// Unregistering a buffer that was never registered here is a success
    /// with no backend calls: the boundary is process scope, and this
    /// process has nothing to tear down. An outstanding lock is permitted
    /// but logged — lock discipline is the caller's responsibility.
    pub fn unregister(&self, desc: &BufferDescriptor) -> Result<()> {
        desc.validate()?;

        if self.config.partial_flush
            && desc
                .flags
                .intersects(BufferFlags::SECURE_SHARED | BufferFlags::FRAMEBUFFER)
        {
            self.regions.remove(desc.secure_id);
        }

        let Some(mut registration) = self.registrations.write().unwrap().remove(&desc.key())
        else {
            return Ok(());
        };

        let lock_state = registration.lock_state.load(Ordering::Acquire);
        if lock_state != 0 {
            warn!(lock_state, "unregistering a buffer that is still locked");
        }

        let _state = self.map_lock.lock().unwrap();
        match registration.backend {
            Backend::SecureShared => {
                if let Some(handle) = registration.ssm_handle.take() {
                    // Mapped pointer first, then the reference.
                    self.services.secure.release_mapped_pointer(handle);
                    self.services.secure.release_reference(handle);
                }
                if let Some(client) = registration.device_client.take() {
                    self.services.device.destroy_client(client);
                }
            }
            _ => {
                if let Some(mapping) = registration.mapping.take() {
                    map::unmap(mapping);
                }
                if let Some(client) = registration.device_client.take() {
                    self.services.device.destroy_client(client);
                }
            }
        }

        Ok(())
    }

    /// Grant CPU-visible pointer(s) to a registered buffer and record the
    /// caller's access intent.
    ///
    /// Pure bookkeeping and pointer arithmetic: never blocks, never
    /// touches the backend beyond reading the stored base. Empty usage
    /// defaults to CPU access.
    pub fn lock(&self, desc: &BufferDescriptor, usage: Usage, rect: Rect) -> Result<LockedAddr> {
        desc.validate()?;

        let table = self.registrations.read().unwrap();
        let registration = table.get(&desc.key()).ok_or(Error::NotRegistered)?;

        let write = usage.contains(Usage::SW_WRITE);
        if registration.backend == Backend::SecureShared {
            if self.config.partial_flush {
                self.regions.update(desc.secure_id, rect, write);
            }
            registration
                .last_writer
                .store(u8::from(write), Ordering::Release);
        }

        let cpu_access = usage.intersects(Usage::SW_READ | Usage::SW_WRITE) || usage.is_empty();
        let mut bits = 0;
        if cpu_access {
            bits |= LOCK_READ;
        }
        if write {
            bits |= LOCK_WRITE;
        }
        registration.lock_state.fetch_or(bits, Ordering::AcqRel);

        if usage.contains(Usage::YUV_ADDR) {
            let base = registration.base.as_ptr();
            let [u, v] = desc.plane_offsets;
            // SAFETY: plane offsets lie inside the mapped payload.
            let planes = unsafe {
                [
                    registration.base,
                    NonNull::new_unchecked(base.add(u)),
                    NonNull::new_unchecked(base.add(u + v)),
                ]
            };
            Ok(LockedAddr::Planes(planes))
        } else if cpu_access {
            Ok(LockedAddr::Single(registration.base))
        } else {
            Ok(LockedAddr::Inaccessible)
        }
    }

    /// Release a lock and perform the cache maintenance the owning backend
    /// requires so device-visible memory and CPU caches agree.
    ///
    /// Once past validation this call always succeeds; individual flush
    /// failures are logged and reported through the returned
    /// [`SyncOutcome`].
    pub fn unlock(&self, desc: &BufferDescriptor) -> Result<SyncOutcome> {
        desc.validate()?;

        let table = self.registrations.read().unwrap();
        let registration = table.get(&desc.key()).ok_or(Error::NotRegistered)?;

        registration.lock_state.store(0, Ordering::Release);

        // Uncached mappings need no maintenance by construction.
        if desc.flags.contains(BufferFlags::NON_CACHEABLE) {
            return Ok(SyncOutcome::Complete);
        }

        let mut degraded = false;
        match registration.backend {
            Backend::SecureShared => {
                if let Some(handle) = registration.ssm_handle {
                    degraded = self.sync_secure(desc, handle, registration.device_client);
                }
            }
            Backend::DeviceBuffer => {
                if let Some(client) = registration.device_client {
                    degraded = self.sync_device(desc, client);
                }
            }
            Backend::DirectWindow => {
                let range = PhysRange {
                    start: desc.paddr,
                    length: desc.size as u64,
                };
                // HDMI-class consumers write the buffer, so the lines must
                // also be invalidated; plain ioctl windows only need the
                // CPU's dirty lines written back.
                let result = if desc.flags.contains(BufferFlags::HDMI) {
                    self.services.control.cache_flush(range)
                } else {
                    self.services.control.cache_clean(range)
                };
                if let Err(err) = result {
                    warn!(%err, "physical cache maintenance failed");
                    degraded = true;
                }
            }
            Backend::DirectFd | Backend::Framebuffer | Backend::Unsupported => {}
        }

        Ok(if degraded {
            SyncOutcome::Degraded
        } else {
            SyncOutcome::Complete
        })
    }

    fn sync_secure(
        &self,
        desc: &BufferDescriptor,
        handle: SsmHandle,
        client: Option<DeviceClient>,
    ) -> bool {
        let mut degraded = false;

        if desc.flags.contains(BufferFlags::DEVICE_BUFFER) {
            let op = if desc.flags.contains(BufferFlags::HDMI) {
                SyncOp::CleanAndInvalidate
            } else {
                SyncOp::Clean
            };
            let range = self.partial_range(desc).unwrap_or(SyncRange {
                offset: 0,
                len: desc.size,
            });
            if let Err(err) = self.services.secure.sync(handle, op, Some(range)) {
                warn!(%err, "secure sync failed");
                degraded = true;
            }
            if let Some(client) = client {
                if let Err(err) = self.services.device.sync(
                    client,
                    desc.fd,
                    SyncDirection::DeviceToCpu,
                    desc.size,
                    desc.offset,
                ) {
                    warn!(%err, "device-buffer sync failed");
                    degraded = true;
                }
            }
        } else {
            // Region-restricted clean when a rectangle was recorded,
            // otherwise the service flushes the whole mapping.
            let range = self.partial_range(desc);
            if let Err(err) = self.services.secure.sync(handle, SyncOp::Clean, range) {
                warn!(%err, "secure sync failed");
                degraded = true;
            }
        }

        degraded
    }

    fn sync_device(&self, desc: &BufferDescriptor, client: DeviceClient) -> bool {
        if let Err(err) = self.services.device.sync(
            client,
            desc.fd,
            SyncDirection::DeviceToCpu,
            desc.size,
            desc.offset,
        ) {
            warn!(%err, "device-buffer sync failed");
            return true;
        }
        false
    }

    fn partial_range(&self, desc: &BufferDescriptor) -> Option<SyncRange> {
        if !self.config.partial_flush {
            return None;
        }
        let record = self.regions.get(desc.secure_id)?;
        if !record.locked || record.stride_bytes == 0 {
            // No rectangle recorded yet, or a planar format with no fixed
            // stride; flush everything.
            return None;
        }
        let (offset, len) = record.flush_span();
        Some(SyncRange { offset, len })
    }

    /// Physical addresses of the three planes: base, base + U offset,
    /// base + U + V offsets.
    pub fn physical_addresses(&self, desc: &BufferDescriptor) -> Result<[u64; 3]> {
        desc.validate()?;
        let [u, v] = desc.plane_offsets;
        Ok([
            desc.paddr,
            desc.paddr + u as u64,
            desc.paddr + (u + v) as u64,
        ])
    }

    /// Whether this process currently holds a registration for the buffer.
    pub fn is_registered(&self, desc: &BufferDescriptor) -> bool {
        self.registrations.read().unwrap().contains_key(&desc.key())
    }

    /// Last rectangle recorded for a buffer under the partial-flush
    /// extension, if the buffer is tracked.
    pub fn tracked_rect(&self, desc: &BufferDescriptor) -> Option<Rect> {
        self.regions.get(desc.secure_id).map(|record| record.rect)
    }
}
