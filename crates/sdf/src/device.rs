//! The offload accelerator: a dedicated worker pool plus a ledger of
//! device-resident buffers.
//!
//! Buffers are plain words in host memory, but they are owned like device
//! memory: every `DeviceBuffer` is counted by the ledger from allocation
//! until it is released (explicitly or by drop), so a job abandoned on any
//! exit path cannot leak without it showing up in [`DeviceMemory::live_buffers`].

use bytemuck::Pod;
use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Errors surfaced by the accelerator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("readback of buffer '{label}' failed: device lost")]
    ReadbackFailed { label: &'static str },
    #[error("buffer '{label}' cannot be viewed as {type_name}")]
    Layout {
        label: &'static str,
        type_name: &'static str,
    },
    #[error("failed to build worker pool: {0}")]
    Pool(String),
    #[error("device job panicked: {0}")]
    JobPanicked(String),
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[derive(Debug, Default)]
struct Ledger {
    next_id: AtomicU64,
    live_buffers: AtomicUsize,
    live_bytes: AtomicUsize,
}

/// A buffer of device memory. Released when dropped.
#[derive(Debug)]
pub struct DeviceBuffer {
    id: u64,
    label: &'static str,
    words: Vec<u32>,
    ledger: Arc<Ledger>,
}

impl DeviceBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn size_bytes(&self) -> usize {
        self.words.len() * std::mem::size_of::<u32>()
    }

    /// Typed view of the buffer contents.
    pub fn view<T: Pod>(&self) -> Result<&[T], DeviceError> {
        bytemuck::try_cast_slice(&self.words).map_err(|_| self.layout_error::<T>())
    }

    /// Mutable typed view, used by kernels writing their output.
    pub fn view_mut<T: Pod>(&mut self) -> Result<&mut [T], DeviceError> {
        let label = self.label;
        bytemuck::try_cast_slice_mut(&mut self.words).map_err(|_| DeviceError::Layout {
            label,
            type_name: std::any::type_name::<T>(),
        })
    }

    /// Give the memory back to the device now rather than at end of scope.
    pub fn release(self) {}

    fn layout_error<T>(&self) -> DeviceError {
        DeviceError::Layout {
            label: self.label,
            type_name: std::any::type_name::<T>(),
        }
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.ledger.live_buffers.fetch_sub(1, Ordering::AcqRel);
        self.ledger
            .live_bytes
            .fetch_sub(self.size_bytes(), Ordering::AcqRel);
        tracing::trace!(id = self.id, label = self.label, "device buffer released");
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    ledger: Arc<Ledger>,
    placeholder: Mutex<Option<Arc<DeviceBuffer>>>,
    failing_readbacks: AtomicUsize,
}

/// Allocation and readback half of the device. Cheap to clone into jobs.
#[derive(Debug, Clone, Default)]
pub struct DeviceMemory {
    inner: Arc<MemoryInner>,
}

impl DeviceMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed buffer able to hold `len` values of `T`.
    pub fn create_buffer<T: Pod>(&self, label: &'static str, len: usize) -> DeviceBuffer {
        let bytes = len * std::mem::size_of::<T>();
        let words = bytes.div_ceil(std::mem::size_of::<u32>());
        let ledger = Arc::clone(&self.inner.ledger);
        let id = ledger.next_id.fetch_add(1, Ordering::Relaxed);
        ledger.live_buffers.fetch_add(1, Ordering::AcqRel);
        ledger
            .live_bytes
            .fetch_add(words * std::mem::size_of::<u32>(), Ordering::AcqRel);
        DeviceBuffer {
            id,
            label,
            words: vec![0; words],
            ledger,
        }
    }

    /// Allocate a buffer and fill it with `data`.
    pub fn upload<T: Pod>(
        &self,
        label: &'static str,
        data: &[T],
    ) -> Result<DeviceBuffer, DeviceError> {
        let mut buffer = self.create_buffer::<T>(label, data.len());
        buffer.view_mut::<T>()?.copy_from_slice(data);
        Ok(buffer)
    }

    /// Copy a buffer back to the host.
    pub fn read_back<T: Pod>(&self, buffer: &DeviceBuffer) -> Result<Vec<T>, DeviceError> {
        let failing = self
            .inner
            .failing_readbacks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(DeviceError::ReadbackFailed {
                label: buffer.label,
            });
        }
        Ok(buffer.view::<T>()?.to_vec())
    }

    /// Shared one-element buffer bound where a kernel expects a buffer that
    /// has no content (e.g. a chunk without edits). Created on first use and
    /// kept until [`DeviceMemory::teardown`].
    pub fn placeholder(&self) -> Arc<DeviceBuffer> {
        let mut slot = self
            .inner
            .placeholder
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slot.get_or_insert_with(|| Arc::new(self.create_buffer::<f32>("placeholder", 1))))
    }

    /// Drop the placeholder. In-flight jobs still holding it keep it alive
    /// until they finish.
    pub fn teardown(&self) {
        let taken = self
            .inner
            .placeholder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if taken.is_some() {
            tracing::debug!("placeholder buffer torn down");
        }
    }

    /// Make the next `n` readbacks fail as if the device were lost.
    pub fn fail_next_readbacks(&self, n: usize) {
        self.inner.failing_readbacks.store(n, Ordering::Release);
    }

    pub fn live_buffers(&self) -> usize {
        self.inner.ledger.live_buffers.load(Ordering::Acquire)
    }

    pub fn live_bytes(&self) -> usize {
        self.inner.ledger.live_bytes.load(Ordering::Acquire)
    }
}

/// Worker pool plus memory. Jobs run on the pool and never on the caller's thread.
#[derive(Debug, Clone)]
pub struct Device {
    pool: Arc<rayon::ThreadPool>,
    memory: DeviceMemory,
}

impl Device {
    pub fn new(threads: usize) -> Result<Self, DeviceError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("voxstream-device-{i}"))
            .panic_handler(|payload| {
                tracing::error!(reason = %panic_message(&*payload), "uncaught panic in device job");
            })
            .build()
            .map_err(|e| DeviceError::Pool(e.to_string()))?;
        Ok(Self {
            pool: Arc::new(pool),
            memory: DeviceMemory::new(),
        })
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    /// See [`DeviceMemory::teardown`].
    pub fn teardown(&self) {
        self.memory.teardown();
    }

    /// See [`DeviceMemory::fail_next_readbacks`].
    pub fn fail_next_readbacks(&self, n: usize) {
        self.memory.fail_next_readbacks(n);
    }

    /// Queue a job. Returns immediately. Jobs that report a result should
    /// catch their own panics; anything uncaught is logged and dropped.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(job);
    }

    /// Run `op` inside the pool and wait for it.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}
