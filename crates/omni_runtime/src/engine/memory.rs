use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use thiserror::Error;
use wasmtime::SharedMemory;

use super::store::WASM_PAGE_SIZE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("out of bounds memory access: {len} bytes at {ptr:#x}")]
    OutOfBounds { ptr: u32, len: usize },
    #[error("unterminated string at {0:#x}")]
    Unterminated(u32),
    #[error("misaligned atomic access at {0:#x}")]
    Misaligned(u32),
    #[error("invalid length {len} at {ptr:#x}")]
    InvalidLength { ptr: u32, len: i32 },
    #[error("failed to grow memory to {0} bytes")]
    GrowFailed(usize),
}

/// Accessor over the guest's shared linear memory.
///
/// Cloning is cheap; every clone views the same buffer. All byte accesses go
/// through relaxed atomics since guest threads may be writing concurrently.
/// Guest pointers are taken as `i32` and reinterpreted as unsigned offsets.
#[derive(Clone)]
pub struct LinearMemory {
    memory: SharedMemory,
}

impl LinearMemory {
    pub fn new(memory: SharedMemory) -> Self {
        Self { memory }
    }

    pub fn shared_memory(&self) -> &SharedMemory {
        &self.memory
    }

    /// Current size in bytes.
    pub fn size(&self) -> usize {
        self.memory.data_size()
    }

    fn cells(&self, ptr: u32, len: usize) -> Result<&[UnsafeCell<u8>], MemoryError> {
        let data = self.memory.data();
        let start = ptr as usize;
        start
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .map(|end| &data[start..end])
            .ok_or(MemoryError::OutOfBounds { ptr, len })
    }

    fn load(cell: &UnsafeCell<u8>) -> u8 {
        // SAFETY: the cell lives in wasmtime's shared memory, which stays mapped
        // for as long as `self.memory` is alive, and u8 has no alignment needs.
        unsafe { AtomicU8::from_ptr(cell.get()) }.load(Ordering::Relaxed)
    }

    fn store(cell: &UnsafeCell<u8>, value: u8) {
        // SAFETY: see `load`.
        unsafe { AtomicU8::from_ptr(cell.get()) }.store(value, Ordering::Relaxed)
    }

    fn atomic_i32(&self, ptr: u32) -> Result<&AtomicI32, MemoryError> {
        if ptr % 4 != 0 {
            return Err(MemoryError::Misaligned(ptr));
        }
        let cells = self.cells(ptr, 4)?;
        // SAFETY: in bounds, 4-byte aligned relative to the memory base (which is
        // page aligned), and only ever accessed atomically from the host.
        Ok(unsafe { AtomicI32::from_ptr(cells[0].get().cast::<i32>()) })
    }

    pub fn read_bytes(&self, ptr: i32, len: usize) -> Result<Vec<u8>, MemoryError> {
        Ok(self.cells(ptr as u32, len)?.iter().map(Self::load).collect())
    }

    pub fn write_bytes(&self, ptr: i32, bytes: &[u8]) -> Result<(), MemoryError> {
        let cells = self.cells(ptr as u32, bytes.len())?;
        for (cell, byte) in cells.iter().zip(bytes) {
            Self::store(cell, *byte);
        }
        Ok(())
    }

    /// Read a NUL-terminated string. Invalid UTF-8 is replaced, not rejected.
    ///
    /// The scan is unbounded: a missing terminator runs to the end of memory
    /// and is reported as [`MemoryError::Unterminated`].
    pub fn read_cstring(&self, ptr: i32) -> Result<String, MemoryError> {
        let start = ptr as u32;
        let tail = self
            .memory
            .data()
            .get(start as usize..)
            .ok_or(MemoryError::OutOfBounds { ptr: start, len: 1 })?;
        let mut bytes = Vec::new();
        for cell in tail {
            match Self::load(cell) {
                0 => return Ok(String::from_utf8_lossy(&bytes).into_owned()),
                byte => bytes.push(byte),
            }
        }
        Err(MemoryError::Unterminated(start))
    }

    /// Little-endian `i32` at any alignment.
    pub fn read_i32(&self, ptr: i32) -> Result<i32, MemoryError> {
        let mut bytes = [0u8; 4];
        for (byte, cell) in bytes.iter_mut().zip(self.cells(ptr as u32, 4)?) {
            *byte = Self::load(cell);
        }
        Ok(i32::from_le_bytes(bytes))
    }

    pub fn write_i32(&self, ptr: i32, value: i32) -> Result<(), MemoryError> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    pub fn read_i32_slice(&self, ptr: i32, count: usize) -> Result<Vec<i32>, MemoryError> {
        let len = count
            .checked_mul(4)
            .ok_or(MemoryError::OutOfBounds { ptr: ptr as u32, len: usize::MAX })?;
        let bytes = self.read_bytes(ptr, len)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|w| i32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect())
    }

    /// Unpack an argument array: length at +0, capacity at +4 (ignored),
    /// data pointer at +8 pointing to `length` contiguous `i32`s.
    pub fn read_argument_array(&self, ptr: i32) -> Result<Vec<i32>, MemoryError> {
        let len = self.read_i32(ptr)?;
        let Ok(count) = usize::try_from(len) else {
            return Err(MemoryError::InvalidLength { ptr: ptr as u32, len });
        };
        let data = self.read_i32(ptr.wrapping_add(8))?;
        self.read_i32_slice(data, count)
    }

    pub fn read_i32_atomic(&self, ptr: i32) -> Result<i32, MemoryError> {
        Ok(i32::from_le(self.atomic_i32(ptr as u32)?.load(Ordering::SeqCst)))
    }

    /// Atomic fetch-and-add. Returns the value before the addition.
    pub fn add_i32_atomic(&self, ptr: i32, delta: i32) -> Result<i32, MemoryError> {
        let atomic = self.atomic_i32(ptr as u32)?;
        let previous = atomic
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                Some(i32::from_le(raw).wrapping_add(delta).to_le())
            })
            .unwrap_or_else(|raw| raw);
        Ok(i32::from_le(previous))
    }

    /// Atomically store `new` if the slot still holds `current`.
    pub fn compare_exchange_i32(&self, ptr: i32, current: i32, new: i32) -> Result<bool, MemoryError> {
        let atomic = self.atomic_i32(ptr as u32)?;
        Ok(atomic
            .compare_exchange(current.to_le(), new.to_le(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    /// Grow until at least `len` bytes are addressable.
    pub fn grow_to(&self, len: usize) -> Result<(), MemoryError> {
        while self.size() < len {
            let missing = len - self.size();
            let pages = missing.div_ceil(WASM_PAGE_SIZE) as u64;
            self.memory
                .grow(pages)
                .map_err(|_| MemoryError::GrowFailed(len))?;
        }
        Ok(())
    }
}
