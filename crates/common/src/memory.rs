use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian};

use crate::{ExecutionError, MachineError};

/// Flat, byte addressable store. Every accessor is bounds checked before
/// touching the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    bytes: Vec<u8>,
}

impl Memory {
    pub fn new(size: u32) -> Result<Self, MachineError> {
        if size == 0 {
            return Err(MachineError::ZeroMemorySize);
        }
        let size = size as usize;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| MachineError::AllocationFailed(size))?;
        bytes.resize(size, 0);
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.bytes.len() as u32
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn read_u8(&self, address: u32) -> Result<u8, ExecutionError> {
        let range = self.range(address, 1)?;
        Ok(self.bytes[range.start])
    }

    pub fn read_i8(&self, address: u32) -> Result<i8, ExecutionError> {
        Ok(self.read_u8(address)? as i8)
    }

    pub fn read_le32(&self, address: u32) -> Result<u32, ExecutionError> {
        let range = self.range(address, 4)?;
        Ok(LittleEndian::read_u32(&self.bytes[range]))
    }

    pub fn write_u8(&mut self, address: u32, value: u8) -> Result<(), ExecutionError> {
        let range = self.range(address, 1)?;
        self.bytes[range.start] = value;
        Ok(())
    }

    pub fn write_le32(&mut self, address: u32, value: u32) -> Result<(), ExecutionError> {
        let range = self.range(address, 4)?;
        LittleEndian::write_u32(&mut self.bytes[range], value);
        Ok(())
    }

    /// Copies `data` to `address`. Nothing is written unless the whole slice fits.
    pub fn load(&mut self, address: u32, data: &[u8]) -> Result<(), ExecutionError> {
        if data.is_empty() {
            return Ok(());
        }
        let width = u32::try_from(data.len()).map_err(|_| self.first_invalid(address))?;
        let range = self.range(address, width)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn range(&self, address: u32, width: u32) -> Result<Range<usize>, ExecutionError> {
        let start = address as usize;
        match start.checked_add(width as usize) {
            Some(end) if end <= self.bytes.len() => Ok(start..end),
            _ => Err(self.first_invalid(address)),
        }
    }

    fn first_invalid(&self, address: u32) -> ExecutionError {
        ExecutionError::InvalidMemoryLocation(address.max(self.capacity()))
    }
}
