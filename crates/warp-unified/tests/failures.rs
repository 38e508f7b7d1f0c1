//! Failure atomicity under injected backend faults
//!
//! A failed allocation or transfer must leave the memory state and the dirty
//! ranges exactly as they were, so the same call can be retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use warp_unified::{
    AcceleratorBackend, BackendType, CpuBackend, CpuBuffer, DeviceInfo, DirtyRange, Error, Kernel,
    MemoryState, ReadKernel, Result, TransformKernel, UnifiedVec, algorithms,
};

/// CPU backend that fails selected operations on demand
#[derive(Default)]
struct FlakyBackend {
    inner: CpuBackend,
    fail_allocate: AtomicBool,
    fail_upload: AtomicBool,
    fail_download: AtomicBool,
}

impl FlakyBackend {
    fn fail(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }
}

impl AcceleratorBackend for FlakyBackend {
    type Buffer = CpuBuffer;
    type Completion = <CpuBackend as AcceleratorBackend>::Completion;

    fn device_name(&self) -> &str {
        "flaky"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Cpu
    }

    fn device_info(&self) -> &DeviceInfo {
        self.inner.device_info()
    }

    fn free_memory(&self) -> Result<usize> {
        self.inner.free_memory()
    }

    fn allocate(&self, bytes: usize) -> Result<CpuBuffer> {
        if Self::fail(&self.fail_allocate) {
            return Err(Error::device_out_of_memory(bytes, 0));
        }
        self.inner.allocate(bytes)
    }

    fn copy_host_to_device(
        &self,
        buffer: &mut CpuBuffer,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        if Self::fail(&self.fail_upload) {
            return Err(Error::Transfer("injected upload failure".into()));
        }
        self.inner.copy_host_to_device(buffer, offset, data)
    }

    fn copy_device_to_host(&self, buffer: &CpuBuffer, out: &mut [u8]) -> Result<()> {
        if Self::fail(&self.fail_download) {
            return Err(Error::DeviceLost("injected download failure".into()));
        }
        self.inner.copy_device_to_host(buffer, out)
    }

    fn copy_device_to_device(
        &self,
        src: &CpuBuffer,
        dst: &mut CpuBuffer,
        bytes: usize,
    ) -> Result<()> {
        self.inner.copy_device_to_device(src, dst, bytes)
    }

    fn execute(&self, buffer: &mut CpuBuffer, kernel: &dyn Kernel) -> Result<Self::Completion> {
        self.inner.execute(buffer, kernel)
    }

    fn execute_read(
        &self,
        buffer: &CpuBuffer,
        kernel: &dyn ReadKernel,
    ) -> Result<Self::Completion> {
        self.inner.execute_read(buffer, kernel)
    }

    fn execute_transform(
        &self,
        src: &CpuBuffer,
        dst: &mut CpuBuffer,
        kernel: &dyn TransformKernel,
    ) -> Result<Self::Completion> {
        self.inner.execute_transform(src, dst, kernel)
    }

    fn wait(&self, completion: Self::Completion) -> Result<()> {
        self.inner.wait(completion)
    }

    fn synchronize(&self) -> Result<()> {
        self.inner.synchronize()
    }
}

fn flaky_vec(items: &[u32]) -> (Arc<FlakyBackend>, UnifiedVec<u32, FlakyBackend>) {
    let backend = Arc::new(FlakyBackend::default());
    let mut vec = UnifiedVec::with_backend(Arc::clone(&backend)).unwrap();
    vec.extend_from_slice(items).unwrap();
    (backend, vec)
}

#[test]
fn test_failed_upload_keeps_dirty_ranges() {
    let (backend, vec) = flaky_vec(&[1, 2, 3]);
    let before = vec.engine().dirty_ranges();

    backend.fail_upload.store(true, Ordering::SeqCst);
    let err = vec.prefetch_to_device().unwrap_err();
    assert!(matches!(err, Error::Transfer(_)));
    assert!(err.is_recoverable());
    assert_eq!(vec.engine().state(), MemoryState::HostDirty);
    assert_eq!(vec.engine().dirty_ranges(), before);

    backend.fail_upload.store(false, Ordering::SeqCst);
    vec.prefetch_to_device().unwrap();
    assert_eq!(vec.engine().state(), MemoryState::Clean);
    assert_eq!(algorithms::reduce(&vec, 0, |a, b| a + b).unwrap(), 6);
}

#[test]
fn test_failed_allocation_is_retryable() {
    let (backend, vec) = flaky_vec(&[4, 5]);

    backend.fail_allocate.store(true, Ordering::SeqCst);
    assert!(matches!(
        vec.engine().sync_to_device(),
        Err(Error::DeviceOutOfMemory { .. })
    ));
    assert!(!vec.engine().is_allocated());
    assert_eq!(vec.engine().dirty_ranges(), vec![DirtyRange::new(0, 2).unwrap()]);

    backend.fail_allocate.store(false, Ordering::SeqCst);
    vec.engine().sync_to_device().unwrap();
    assert!(vec.engine().is_allocated());
}

#[test]
fn test_failed_growth_changes_nothing() {
    let (backend, mut vec) = flaky_vec(&[1, 2]);
    vec.prefetch_to_device().unwrap();
    vec.set(0, 10).unwrap();
    let epoch = vec.engine().epoch();

    backend.fail_allocate.store(true, Ordering::SeqCst);
    assert!(vec.push_back(3).is_err());
    assert_eq!(vec.len(), 2);
    assert_eq!(vec.capacity(), 2);
    assert_eq!(vec.engine().epoch(), epoch);
    assert_eq!(vec.engine().state(), MemoryState::HostDirty);

    backend.fail_allocate.store(false, Ordering::SeqCst);
    vec.push_back(3).unwrap();
    assert_eq!(vec.to_vec().unwrap(), vec![10, 2, 3]);
}

#[test]
fn test_failed_download_stays_device_dirty() {
    let (backend, mut vec) = flaky_vec(&[1, 2, 3]);
    algorithms::fill(&mut vec, 9).unwrap();

    backend.fail_download.store(true, Ordering::SeqCst);
    assert!(matches!(vec.get(0), Err(Error::DeviceLost(_))));
    assert!(vec.set(1, 0).is_err());
    assert_eq!(vec.engine().state(), MemoryState::DeviceDirty);

    backend.fail_download.store(false, Ordering::SeqCst);
    assert_eq!(vec.to_vec().unwrap(), vec![9, 9, 9]);
}

#[test]
fn test_drop_with_failing_download_does_not_panic() {
    let (backend, mut vec) = flaky_vec(&[1]);
    algorithms::fill(&mut vec, 2).unwrap();
    backend.fail_download.store(true, Ordering::SeqCst);
    drop(vec);
}

#[test]
fn test_failed_transform_upload_is_retryable() {
    let (_, input) = flaky_vec(&[1, 2, 3]);
    let (backend, mut output) = flaky_vec(&[7]);
    output.prefetch_to_device().unwrap();

    backend.fail_upload.store(true, Ordering::SeqCst);
    let err = algorithms::transform(&input, &mut output, |v| v + 1).unwrap_err();
    assert!(matches!(err, Error::Transfer(_)));
    assert_eq!(output.engine().state(), MemoryState::HostDirty);
    assert_eq!(output.to_vec().unwrap(), vec![7, 0, 0]);

    backend.fail_upload.store(false, Ordering::SeqCst);
    algorithms::transform(&input, &mut output, |v| v + 1).unwrap();
    assert_eq!(output.engine().state(), MemoryState::DeviceDirty);
    assert_eq!(output.to_vec().unwrap(), vec![2, 3, 4]);
}
