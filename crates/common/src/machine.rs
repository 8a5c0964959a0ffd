use std::fmt;

use crate::{ExecutionError, MachineError, Memory, Register, REGISTER_COUNT};

pub const DEFAULT_MEMORY_SIZE: u32 = 1024 * 1024;
/// Boot sectors are traditionally loaded at 0x7C00.
pub const DEFAULT_STACK_POINTER: u32 = 0x7C00;
/// Bytes copied from a program image by the loader.
pub const DEFAULT_LOAD_LIMIT: usize = 0x200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    pub memory_size: u32,
    pub entrypoint: u32,
    pub stack_pointer: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            entrypoint: 0,
            stack_pointer: DEFAULT_STACK_POINTER,
        }
    }
}

/// EFLAGS word. Bits without an instruction using them are plain storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(pub u32);

impl Flags {
    pub const CARRY: u32 = 1 << 0;
    pub const ZERO: u32 = 1 << 6;
    pub const SIGN: u32 = 1 << 7;
    pub const INTERRUPT: u32 = 1 << 9;
    pub const OVERFLOW: u32 = 1 << 11;
    pub const IOPL: u32 = 0b11 << 12;

    #[must_use]
    pub const fn contains(self, mask: u32) -> bool {
        self.0 & mask == mask
    }

    pub fn set(&mut self, mask: u32, value: bool) {
        if value {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }

    #[must_use]
    pub const fn io_privilege_level(self) -> u32 {
        (self.0 & Self::IOPL) >> 12
    }
}

#[derive(Debug, Clone)]
pub struct Machine {
    registers: [u32; REGISTER_COUNT],
    flags: Flags,
    memory: Memory,
    instruction_pointer: u32,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        let memory = Memory::new(config.memory_size)?;
        let mut registers = [0; REGISTER_COUNT];
        registers[Register::ESP.index()] = config.stack_pointer;

        tracing::debug!(
            memory_size = config.memory_size,
            eip = config.entrypoint,
            esp = config.stack_pointer,
            "created machine"
        );

        Ok(Self {
            registers,
            flags: Flags::default(),
            memory,
            instruction_pointer: config.entrypoint,
        })
    }

    /// Copies at most `limit` bytes of `program` to `address`, returning the
    /// number of bytes loaded.
    pub fn load(
        &mut self,
        address: u32,
        program: &[u8],
        limit: usize,
    ) -> Result<usize, ExecutionError> {
        let len = program.len().min(limit);
        self.memory.load(address, &program[..len])?;
        Ok(len)
    }

    #[must_use]
    pub fn register(&self, reg: Register) -> u32 {
        self.registers[reg.index()]
    }

    pub fn set_register(&mut self, reg: Register, value: u32) {
        self.registers[reg.index()] = value;
    }

    #[must_use]
    pub fn registers(&self) -> &[u32; REGISTER_COUNT] {
        &self.registers
    }

    #[must_use]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn flags_mut(&mut self) -> &mut Flags {
        &mut self.flags
    }

    #[must_use]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    #[must_use]
    pub fn instruction_pointer(&self) -> u32 {
        self.instruction_pointer
    }

    pub fn set_instruction_pointer(&mut self, address: u32) {
        self.instruction_pointer = address;
    }

    /// Moves past an instruction of `length` bytes.
    pub fn advance(&mut self, length: u32) {
        self.instruction_pointer = self.instruction_pointer.wrapping_add(length);
    }

    /// Relative branch: the displacement counts from the end of the
    /// `length`-byte instruction.
    pub fn jump_relative(&mut self, length: u32, displacement: i32) {
        self.instruction_pointer = self
            .instruction_pointer
            .wrapping_add(length)
            .wrapping_add_signed(displacement);
    }

    fn fetch_address(&self, offset: u32) -> Result<u32, ExecutionError> {
        self.instruction_pointer
            .checked_add(offset)
            .ok_or(ExecutionError::InvalidMemoryLocation(u32::MAX))
    }

    pub fn fetch8(&self, offset: u32) -> Result<u8, ExecutionError> {
        self.memory.read_u8(self.fetch_address(offset)?)
    }

    pub fn fetch_i8(&self, offset: u32) -> Result<i8, ExecutionError> {
        self.memory.read_i8(self.fetch_address(offset)?)
    }

    pub fn fetch32(&self, offset: u32) -> Result<u32, ExecutionError> {
        let mut value = 0;
        for i in 0..4 {
            value |= u32::from(self.fetch8(offset + i)?) << (i * 8);
        }
        Ok(value)
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for reg in Register::ALL {
            writeln!(f, "{reg} = {:08x}", self.register(reg))?;
        }
        write!(f, "EIP = {:08x}", self.instruction_pointer)
    }
}
