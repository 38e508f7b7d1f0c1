//! Accelerator algorithms over unified containers
//!
//! Every algorithm except sorting runs on the accelerator copy and follows
//! the same protocol:
//!
//! 1. `sync_to_device` so pending host writes reach the device
//! 2. take the accelerator handle (allocating it if needed)
//! 3. `execute` the kernel and `wait` for it
//! 4. `mark_device_dirty` (writing algorithms only)
//!
//! Host reads afterwards pull the results back lazily. [`transform`] runs
//! the protocol on two containers at once: the input is only read, the
//! output ends up device-dirty. Sorting runs on the host copy and leaves the
//! sorted range host-dirty.
//!
//! Kernels reinterpret the raw device bytes as `[T]`. A backend whose buffers
//! are not aligned for `T` fails the call with [`Error::Unsupported`].
//! Ranges of at least [`UnifiedConfig::parallel_threshold`] elements are
//! processed with rayon.
//!
//! [`UnifiedConfig::parallel_threshold`]: crate::config::UnifiedConfig::parallel_threshold

use std::marker::PhantomData;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytemuck::Pod;
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use crate::backend::{AcceleratorBackend, Kernel, ReadKernel, TransformKernel};
use crate::vector::UnifiedVec;
use crate::{Error, Result};

fn not_elements(err: bytemuck::PodCastError) -> Error {
    Error::Unsupported(format!("device buffer cannot be viewed as elements: {err}"))
}

fn typed<T: Pod>(memory: &[u8]) -> Result<&[T]> {
    bytemuck::try_cast_slice(memory).map_err(not_elements)
}

fn typed_mut<T: Pod>(memory: &mut [u8]) -> Result<&mut [T]> {
    bytemuck::try_cast_slice_mut(memory).map_err(not_elements)
}

fn window<T>(elements: &[T], range: &Range<usize>) -> Result<()> {
    if range.start > range.end || range.end > elements.len() {
        return Err(Error::invalid_range(range.start, range.end, elements.len()));
    }
    Ok(())
}

fn check_range<T, B>(vec: &UnifiedVec<T, B>, range: &Range<usize>) -> Result<()>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    if range.start > range.end || range.end > vec.len() {
        return Err(Error::invalid_range(range.start, range.end, vec.len()));
    }
    Ok(())
}

/// Run a writing kernel through the full protocol
fn launch<T, B>(vec: &UnifiedVec<T, B>, kernel: &dyn Kernel) -> Result<()>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    let engine = vec.engine();
    engine.sync_to_device()?;
    {
        let mut buffer = engine.accelerator_handle_mut()?;
        let backend = engine.backend();
        let completion = backend.execute(&mut buffer, kernel)?;
        backend.wait(completion)?;
    }
    engine.mark_device_dirty()?;
    debug!(kernel = kernel.name(), "kernel wrote accelerator buffer");
    Ok(())
}

/// Run a reading kernel; the state is left as the sync made it
fn launch_read<T, B>(vec: &UnifiedVec<T, B>, kernel: &dyn ReadKernel) -> Result<()>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    let engine = vec.engine();
    engine.sync_to_device()?;
    let buffer = engine.accelerator_handle()?;
    let backend = engine.backend();
    let completion = backend.execute_read(&buffer, kernel)?;
    backend.wait(completion)
}

struct ForEach<'f, T, F> {
    range: Range<usize>,
    parallel: bool,
    op: &'f F,
    _element: PhantomData<fn(&mut T)>,
}

impl<T, F> Kernel for ForEach<'_, T, F>
where
    T: Pod + Send + Sync,
    F: Fn(&mut T) + Send + Sync,
{
    fn name(&self) -> &str {
        "for_each"
    }

    fn run(&self, memory: &mut [u8]) -> Result<()> {
        let elements = typed_mut::<T>(memory)?;
        window(elements, &self.range)?;
        let slice = &mut elements[self.range.clone()];
        if self.parallel {
            slice.par_iter_mut().for_each(self.op);
        } else {
            slice.iter_mut().for_each(self.op);
        }
        Ok(())
    }
}

struct Transform<'f, T, U, F> {
    input: Range<usize>,
    output: usize,
    parallel: bool,
    op: &'f F,
    _elements: PhantomData<fn(T) -> U>,
}

impl<T, U, F> TransformKernel for Transform<'_, T, U, F>
where
    T: Pod + Send + Sync,
    U: Pod + Send + Sync,
    F: Fn(T) -> U + Send + Sync,
{
    fn name(&self) -> &str {
        "transform"
    }

    fn run(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let inputs = typed::<T>(src)?;
        window(inputs, &self.input)?;
        let outputs = typed_mut::<U>(dst)?;
        let target = self.output..self.output + self.input.len();
        window(outputs, &target)?;

        let src = &inputs[self.input.clone()];
        let dst = &mut outputs[target];
        let op = self.op;
        if self.parallel {
            dst.par_iter_mut()
                .zip(src.par_iter())
                .for_each(|(slot, value)| *slot = op(*value));
        } else {
            for (slot, value) in dst.iter_mut().zip(src) {
                *slot = op(*value);
            }
        }
        Ok(())
    }
}

struct Reduce<'f, T, F> {
    range: Range<usize>,
    parallel: bool,
    init: T,
    op: &'f F,
    result: Mutex<Option<T>>,
}

impl<T, F> ReadKernel for Reduce<'_, T, F>
where
    T: Pod + Send + Sync,
    F: Fn(T, T) -> T + Send + Sync,
{
    fn name(&self) -> &str {
        "reduce"
    }

    fn run(&self, memory: &[u8]) -> Result<()> {
        let elements = typed::<T>(memory)?;
        window(elements, &self.range)?;
        let slice = &elements[self.range.clone()];
        let op = self.op;
        let value = if self.parallel {
            match slice.par_iter().copied().reduce_with(op) {
                Some(partial) => op(self.init, partial),
                None => self.init,
            }
        } else {
            slice.iter().copied().fold(self.init, op)
        };
        *self.result.lock() = Some(value);
        Ok(())
    }
}

struct Count<'f, T, P> {
    range: Range<usize>,
    parallel: bool,
    predicate: &'f P,
    result: AtomicUsize,
    _element: PhantomData<fn(&T)>,
}

impl<T, P> ReadKernel for Count<'_, T, P>
where
    T: Pod + Send + Sync,
    P: Fn(&T) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        "count"
    }

    fn run(&self, memory: &[u8]) -> Result<()> {
        let elements = typed::<T>(memory)?;
        window(elements, &self.range)?;
        let slice = &elements[self.range.clone()];
        let predicate = self.predicate;
        let count = if self.parallel {
            slice.par_iter().filter(|v| predicate(v)).count()
        } else {
            slice.iter().filter(|v| predicate(v)).count()
        };
        self.result.store(count, Ordering::Release);
        Ok(())
    }
}

/// Apply `op` to every element on the accelerator
pub fn for_each<T, B, F>(vec: &mut UnifiedVec<T, B>, op: F) -> Result<()>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
    F: Fn(&mut T) + Send + Sync,
{
    let len = vec.len();
    for_each_range(vec, 0..len, op)
}

/// Apply `op` to the elements in `range` on the accelerator
pub fn for_each_range<T, B, F>(
    vec: &mut UnifiedVec<T, B>,
    range: Range<usize>,
    op: F,
) -> Result<()>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
    F: Fn(&mut T) + Send + Sync,
{
    check_range(vec, &range)?;
    if range.is_empty() {
        return Ok(());
    }

    let kernel = ForEach {
        parallel: range.len() >= vec.config().parallel_threshold,
        range,
        op: &op,
        _element: PhantomData,
    };
    launch(vec, &kernel)
}

/// Set every element to `value` on the accelerator
pub fn fill<T, B>(vec: &mut UnifiedVec<T, B>, value: T) -> Result<()>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    for_each(vec, move |slot| *slot = value)
}

/// Set the elements in `range` to `value` on the accelerator
pub fn fill_range<T, B>(vec: &mut UnifiedVec<T, B>, range: Range<usize>, value: T) -> Result<()>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
{
    for_each_range(vec, range, move |slot| *slot = value)
}

/// Fold every element into `init` with `op` on the accelerator
///
/// Large containers are reduced in parallel, so `op` should be associative.
pub fn reduce<T, B, F>(vec: &UnifiedVec<T, B>, init: T, op: F) -> Result<T>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
    F: Fn(T, T) -> T + Send + Sync,
{
    reduce_range(vec, 0..vec.len(), init, op)
}

/// Fold the elements in `range` into `init` with `op` on the accelerator
pub fn reduce_range<T, B, F>(
    vec: &UnifiedVec<T, B>,
    range: Range<usize>,
    init: T,
    op: F,
) -> Result<T>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
    F: Fn(T, T) -> T + Send + Sync,
{
    check_range(vec, &range)?;
    if range.is_empty() {
        return Ok(init);
    }

    let kernel = Reduce {
        parallel: range.len() >= vec.config().parallel_threshold,
        range,
        init,
        op: &op,
        result: Mutex::new(None),
    };
    launch_read(vec, &kernel)?;
    kernel
        .result
        .into_inner()
        .ok_or_else(|| Error::Execution("reduce kernel produced no result".to_string()))
}

/// Count elements matching `predicate` on the accelerator
pub fn count<T, B, P>(vec: &UnifiedVec<T, B>, predicate: P) -> Result<usize>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
    P: Fn(&T) -> bool + Send + Sync,
{
    count_range(vec, 0..vec.len(), predicate)
}

/// Count elements in `range` matching `predicate` on the accelerator
pub fn count_range<T, B, P>(
    vec: &UnifiedVec<T, B>,
    range: Range<usize>,
    predicate: P,
) -> Result<usize>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
    P: Fn(&T) -> bool + Send + Sync,
{
    check_range(vec, &range)?;
    if range.is_empty() {
        return Ok(0);
    }

    let kernel = Count {
        parallel: range.len() >= vec.config().parallel_threshold,
        range,
        predicate: &predicate,
        result: AtomicUsize::new(0),
        _element: PhantomData,
    };
    launch_read(vec, &kernel)?;
    Ok(kernel.result.load(Ordering::Acquire))
}

/// Write `op(x)` for every element of `input` into `output` on the accelerator
///
/// `output` grows to at least `input.len()` elements; anything past that is
/// left alone. Both containers should live on the same backend.
pub fn transform<T, U, B, F>(
    input: &UnifiedVec<T, B>,
    output: &mut UnifiedVec<U, B>,
    op: F,
) -> Result<()>
where
    T: Pod + Send + Sync,
    U: Pod + Send + Sync,
    B: AcceleratorBackend,
    F: Fn(T) -> U + Send + Sync,
{
    transform_range(input, 0..input.len(), output, 0, op).map(drop)
}

/// Write `op(x)` for the elements of `input` in `range` into `output`,
/// starting at `output_start`
///
/// `output_start` may be at most `output.len()`; the output grows when the
/// written span runs past its end. The input is synchronized to its device
/// copy and only read; the output's device copy is written and marked
/// device-dirty. Returns the output position one past the last write.
pub fn transform_range<T, U, B, F>(
    input: &UnifiedVec<T, B>,
    range: Range<usize>,
    output: &mut UnifiedVec<U, B>,
    output_start: usize,
    op: F,
) -> Result<usize>
where
    T: Pod + Send + Sync,
    U: Pod + Send + Sync,
    B: AcceleratorBackend,
    F: Fn(T) -> U + Send + Sync,
{
    check_range(input, &range)?;
    if output_start > output.len() {
        return Err(Error::out_of_bounds(output_start, output.len()));
    }
    let output_end = output_start
        .checked_add(range.len())
        .ok_or_else(|| Error::host_out_of_memory::<U>(usize::MAX))?;
    if range.is_empty() {
        return Ok(output_start);
    }
    if output.len() < output_end {
        output.resize(output_end, U::zeroed())?;
    }

    let kernel = Transform {
        parallel: range.len() >= output.config().parallel_threshold,
        input: range,
        output: output_start,
        op: &op,
        _elements: PhantomData,
    };

    input.engine().sync_to_device()?;
    let engine = output.engine();
    engine.sync_to_device()?;
    {
        let src = input.engine().accelerator_handle()?;
        let mut dst = engine.accelerator_handle_mut()?;
        let backend = engine.backend();
        let completion = backend.execute_transform(&src, &mut dst, &kernel)?;
        backend.wait(completion)?;
    }
    engine.mark_device_dirty()?;
    debug!(kernel = kernel.name(), output_start, output_end, "kernel wrote output buffer");
    Ok(output_end)
}

/// Sort every element in ascending order
pub fn sort<T, B>(vec: &mut UnifiedVec<T, B>) -> Result<()>
where
    T: Pod + Send + Sync + Ord,
    B: AcceleratorBackend,
{
    let len = vec.len();
    sort_range(vec, 0..len)
}

/// Sort the elements in `range` in ascending order
pub fn sort_range<T, B>(vec: &mut UnifiedVec<T, B>, range: Range<usize>) -> Result<()>
where
    T: Pod + Send + Sync + Ord,
    B: AcceleratorBackend,
{
    sort_range_by(vec, range, T::cmp)
}

/// Sort the elements in `range` with `compare`
///
/// Sorting runs on the host copy: device writes are pulled back first and
/// exactly `range` is marked host-dirty afterwards. The sort is unstable.
pub fn sort_range_by<T, B, F>(
    vec: &mut UnifiedVec<T, B>,
    range: Range<usize>,
    compare: F,
) -> Result<()>
where
    T: Pod + Send + Sync,
    B: AcceleratorBackend,
    F: Fn(&T, &T) -> std::cmp::Ordering + Send + Sync,
{
    check_range(vec, &range)?;
    if range.len() < 2 {
        return Ok(());
    }

    let parallel = range.len() >= vec.config().parallel_threshold;
    let Range { start, end } = range;
    vec.engine().write_host(start, end, |region| {
        if parallel {
            region.par_sort_unstable_by(&compare);
        } else {
            region.sort_unstable_by(&compare);
        }
    })?;
    debug!(start, end, parallel, "sorted host range");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::MemoryState;
    use crate::backends::cpu::CpuBackend;
    use crate::config::UnifiedConfig;

    #[test]
    fn test_for_each_marks_device_dirty() {
        let mut vec = UnifiedVec::<i32>::from_slice(&[1, 2, 3]).unwrap();
        for_each(&mut vec, |v| *v *= 10).unwrap();

        assert_eq!(vec.engine().state(), MemoryState::DeviceDirty);
        assert_eq!(vec.engine().host_data()[..3], [1, 2, 3]);
        assert_eq!(vec.to_vec().unwrap(), vec![10, 20, 30]);
        assert!(vec.engine().is_clean());
    }

    #[test]
    fn test_for_each_range_leaves_rest_alone() {
        let mut vec = UnifiedVec::<u32>::from_slice(&[1, 1, 1, 1]).unwrap();
        for_each_range(&mut vec, 1..3, |v| *v += 1).unwrap();
        assert_eq!(vec.to_vec().unwrap(), vec![1, 2, 2, 1]);

        assert!(matches!(
            for_each_range(&mut vec, 2..9, |v| *v += 1),
            Err(Error::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_fill() {
        let mut vec = UnifiedVec::<u16>::with_len(5).unwrap();
        fill(&mut vec, 3).unwrap();
        fill_range(&mut vec, 0..2, 9).unwrap();
        assert_eq!(vec.to_vec().unwrap(), vec![9, 9, 3, 3, 3]);
    }

    #[test]
    fn test_reduce_and_count_leave_state_clean() {
        let backend = Arc::new(CpuBackend::new());
        let mut vec = UnifiedVec::<u64>::with_backend(Arc::clone(&backend)).unwrap();
        vec.try_extend(1..=10).unwrap();

        assert_eq!(reduce(&vec, 0, |a, b| a + b).unwrap(), 55);
        assert_eq!(reduce_range(&vec, 0..3, 100, |a, b| a + b).unwrap(), 106);
        assert_eq!(count(&vec, |v| v % 2 == 0).unwrap(), 5);
        assert_eq!(count_range(&vec, 5..5, |_| true).unwrap(), 0);
        assert!(vec.engine().is_clean());
        assert_eq!(backend.stats().kernels, 3);
    }

    #[test]
    fn test_parallel_path_matches_sequential() {
        let config = UnifiedConfig::default().with_parallel_threshold(16);
        let mut vec = UnifiedVec::<u32>::with_config(Arc::new(CpuBackend::new()), config).unwrap();
        vec.try_extend(0..1000).unwrap();

        for_each(&mut vec, |v| *v += 1).unwrap();
        assert_eq!(reduce(&vec, 0, |a, b| a + b).unwrap(), 500_500);
        assert_eq!(count(&vec, |v| *v > 500).unwrap(), 500);
    }

    #[test]
    fn test_host_write_after_kernel_sees_device_data() {
        let mut vec = UnifiedVec::<i32>::from_slice(&[1, 2, 3]).unwrap();
        fill(&mut vec, 7).unwrap();

        vec.set(1, 0).unwrap();
        assert!(vec.engine().is_host_dirty());
        assert_eq!(vec.to_vec().unwrap(), vec![7, 0, 7]);
        assert_eq!(reduce(&vec, 0, |a, b| a + b).unwrap(), 14);
    }

    #[test]
    fn test_empty_container_launches_nothing() {
        let backend = Arc::new(CpuBackend::new());
        let mut vec = UnifiedVec::<u8>::with_backend(Arc::clone(&backend)).unwrap();
        fill(&mut vec, 1).unwrap();
        assert_eq!(reduce(&vec, 4, |a, b| a + b).unwrap(), 4);
        assert_eq!(backend.stats().kernels, 0);
        assert!(!vec.engine().is_allocated());
    }

    #[test]
    fn test_transform_grows_output_and_marks_it_device_dirty() {
        let backend = Arc::new(CpuBackend::new());
        let mut input = UnifiedVec::<u32>::with_backend(Arc::clone(&backend)).unwrap();
        input.extend_from_slice(&[1, 2, 3]).unwrap();
        let mut output = UnifiedVec::<u64>::with_backend(Arc::clone(&backend)).unwrap();

        transform(&input, &mut output, |v| u64::from(v) * 10).unwrap();

        assert_eq!(output.len(), 3);
        assert_eq!(output.engine().state(), MemoryState::DeviceDirty);
        assert_eq!(output.engine().host_data()[..3], [0, 0, 0]);
        assert!(input.engine().is_clean());
        assert_eq!(backend.stats().kernels, 1);

        assert_eq!(output.to_vec().unwrap(), vec![10, 20, 30]);
        assert_eq!(input.to_vec().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_transform_range_writes_at_offset() {
        let input = UnifiedVec::<i32>::from_slice(&[1, 2, 3, 4, 5]).unwrap();
        let mut output = UnifiedVec::<i32>::from_slice(&[9, 9, 9, 9]).unwrap();

        let end = transform_range(&input, 1..3, &mut output, 3, |v| v + 100).unwrap();
        assert_eq!(end, 5);
        assert_eq!(output.to_vec().unwrap(), vec![9, 9, 9, 102, 103]);

        let end = transform_range(&input, 0..2, &mut output, 0, |v| -v).unwrap();
        assert_eq!(end, 2);
        assert_eq!(output.len(), 5);
        assert_eq!(output.to_vec().unwrap(), vec![-1, -2, 9, 102, 103]);
    }

    #[test]
    fn test_transform_rejects_bad_positions() {
        let input = UnifiedVec::<u8>::from_slice(&[1, 2]).unwrap();
        let mut output = UnifiedVec::<u8>::from_slice(&[0]).unwrap();

        assert!(matches!(
            transform_range(&input, 0..1, &mut output, 2, |v| v),
            Err(Error::IndexOutOfBounds { index: 2, len: 1 })
        ));
        assert!(matches!(
            transform_range(&input, 1..4, &mut output, 0, |v| v),
            Err(Error::InvalidRange { .. })
        ));
        assert_eq!(transform_range(&input, 1..1, &mut output, 1, |v| v).unwrap(), 1);
        assert_eq!(output.len(), 1);
        assert!(!output.engine().is_allocated());
    }

    #[test]
    fn test_transform_reads_device_authoritative_input() {
        let mut input = UnifiedVec::<u32>::from_slice(&[1, 2, 3]).unwrap();
        fill(&mut input, 4).unwrap();
        let mut output = UnifiedVec::<u32>::new().unwrap();

        transform(&input, &mut output, |v| v * v).unwrap();
        assert_eq!(input.engine().state(), MemoryState::DeviceDirty);
        assert_eq!(output.to_vec().unwrap(), vec![16, 16, 16]);
    }

    #[test]
    fn test_transform_parallel_path() {
        let config = UnifiedConfig::default().with_parallel_threshold(16);
        let backend = Arc::new(CpuBackend::new());
        let mut input = UnifiedVec::<u32>::with_backend(Arc::clone(&backend)).unwrap();
        input.try_extend(0..1000).unwrap();
        let mut output = UnifiedVec::<u32>::with_config(backend, config).unwrap();

        transform(&input, &mut output, |v| v * 2).unwrap();
        assert_eq!(reduce(&output, 0, |a, b| a + b).unwrap(), 999_000);
    }

    #[test]
    fn test_sort_range_marks_only_sorted_region() {
        let mut vec = UnifiedVec::<i32>::from_slice(&[5, 2, 8, 1, 9]).unwrap();
        vec.prefetch_to_device().unwrap();

        sort_range(&mut vec, 1..4).unwrap();
        assert_eq!(vec.to_vec().unwrap(), vec![5, 1, 2, 8, 9]);
        assert_eq!(vec.engine().state(), MemoryState::HostDirty);
        let ranges = vec.engine().dirty_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].as_range(), 1..4);

        vec.prefetch_to_device().unwrap();
        sort_range(&mut vec, 2..3).unwrap();
        assert!(vec.engine().is_clean());
        assert!(matches!(
            sort_range(&mut vec, 3..6),
            Err(Error::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_sort_pulls_device_writes_first() {
        let mut vec = UnifiedVec::<u32>::from_slice(&[3, 1, 2]).unwrap();
        for_each(&mut vec, |v| *v = 10 - *v).unwrap();

        sort(&mut vec).unwrap();
        assert!(vec.engine().is_host_dirty());
        assert_eq!(vec.to_vec().unwrap(), vec![7, 8, 9]);
    }

    #[test]
    fn test_sort_range_by_descending_floats() {
        let config = UnifiedConfig::default().with_parallel_threshold(4);
        let mut vec = UnifiedVec::<f32>::with_config(Arc::new(CpuBackend::new()), config).unwrap();
        vec.extend_from_slice(&[0.5, -1.0, 3.25, 2.0, 0.0]).unwrap();

        sort_range_by(&mut vec, 0..5, |a, b| b.total_cmp(a)).unwrap();
        assert_eq!(vec.to_vec().unwrap(), vec![3.25, 2.0, 0.5, 0.0, -1.0]);
    }
}
