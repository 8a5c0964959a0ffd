use std::{collections::HashMap, fmt};

use once_cell::sync::Lazy;
use strum::{Display, EnumIter};
use thiserror::Error;

mod dispatch;
mod emulator;
pub mod instructions;
mod machine;
mod memory;

pub use dispatch::{DispatchTable, Handler};
pub use emulator::{Emulator, NullTracer, Tracer};
pub use machine::{
    Flags, Machine, MachineConfig, DEFAULT_LOAD_LIMIT, DEFAULT_MEMORY_SIZE, DEFAULT_STACK_POINTER,
};
pub use memory::Memory;

/// Faults raised while decoding or executing an instruction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Trying to access invalid memory location (@{:#02x}/@{})", .0, .0)]
    InvalidMemoryLocation(u32),
    #[error("Not implemented: {:#04x} at (@{:#02x}/@{})", .0, .1, .1)]
    UnimplementedOpcode(u8, u32),
}

/// Failures while building a [`Machine`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    #[error("Memory size must be greater than zero")]
    ZeroMemorySize,
    #[error("Unable to allocate {0} bytes of memory")]
    AllocationFailed(usize),
}

pub const REGISTER_COUNT: usize = 8;

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Display, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash, EnumIter)]
#[repr(u8)]
pub enum Register {
    EAX = 0,
    ECX = 1,
    EDX = 2,
    EBX = 3,
    ESP = 4,
    EBP = 5,
    ESI = 6,
    EDI = 7,
}

impl Register {
    pub const ALL: [Register; REGISTER_COUNT] = [
        Register::EAX,
        Register::ECX,
        Register::EDX,
        Register::EBX,
        Register::ESP,
        Register::EBP,
        Register::ESI,
        Register::EDI,
    ];

    /// Register encoded in the low three bits of an opcode.
    #[must_use]
    pub const fn from_low_bits(value: u8) -> Self {
        Self::ALL[(value & 0x07) as usize]
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|reg| reg.to_string().eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Run,
    RunFor(usize),
}

/// Terminal state of the execution loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// A handler left the instruction pointer at 0.
    Normal,
    UnimplementedOpcode {
        opcode: u8,
        instruction_pointer: u32,
    },
    OutOfBounds {
        address: u32,
    },
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Halt::Normal => write!(f, "end of program"),
            Halt::UnimplementedOpcode {
                opcode,
                instruction_pointer,
            } => write!(
                f,
                "Not Implemented: {opcode:#04x} at (@{instruction_pointer:#010x})"
            ),
            Halt::OutOfBounds { address } => {
                write!(f, "out of bounds access at (@{address:#010x})")
            }
        }
    }
}

impl From<ExecutionError> for Halt {
    fn from(value: ExecutionError) -> Self {
        match value {
            ExecutionError::InvalidMemoryLocation(address) => Halt::OutOfBounds { address },
            ExecutionError::UnimplementedOpcode(opcode, instruction_pointer) => {
                Halt::UnimplementedOpcode {
                    opcode,
                    instruction_pointer,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Halted(Halt),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub instructions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionReport {
    /// `None` when a `RunFor` budget ran out first.
    pub halt: Option<Halt>,
    pub stats: ExecutionStats,
}

/// How the operand bytes following an opcode are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Implied,
    /// Register in the low three bits of the opcode, no operands.
    RegisterInOpcode,
    /// Register in the opcode, followed by a 32-bit immediate.
    RegisterImm32,
    Rel8,
    Rel32,
    /// `mov eax, [moffs32]`
    LoadAccumulator,
    /// `mov [moffs32], eax`
    StoreAccumulator,
}

impl Encoding {
    /// Total encoded length including the opcode byte.
    #[must_use]
    pub const fn length(self) -> u32 {
        match self {
            Encoding::Implied | Encoding::RegisterInOpcode => 1,
            Encoding::Rel8 => 2,
            Encoding::RegisterImm32
            | Encoding::Rel32
            | Encoding::LoadAccumulator
            | Encoding::StoreAccumulator => 5,
        }
    }

    #[must_use]
    pub const fn opcode_count(self) -> u8 {
        match self {
            Encoding::RegisterInOpcode | Encoding::RegisterImm32 => REGISTER_COUNT as u8,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstructionPattern {
    pub opcode: u8,
    pub encoding: Encoding,
    pub mnemonic: &'static str,
}

impl InstructionPattern {
    const fn new(opcode: u8, encoding: Encoding, mnemonic: &'static str) -> Self {
        Self {
            opcode,
            encoding,
            mnemonic,
        }
    }

    pub fn opcodes(&self) -> impl Iterator<Item = u8> {
        let base = self.opcode;
        (0..self.encoding.opcode_count()).map(move |i| base + i)
    }
}

static PATTERNS: &[InstructionPattern] = &[
    InstructionPattern::new(instructions::INC_R32, Encoding::RegisterInOpcode, "inc"),
    InstructionPattern::new(instructions::DEC_R32, Encoding::RegisterInOpcode, "dec"),
    InstructionPattern::new(instructions::JZ_REL8, Encoding::Rel8, "jz"),
    InstructionPattern::new(instructions::JNZ_REL8, Encoding::Rel8, "jnz"),
    InstructionPattern::new(instructions::NOP, Encoding::Implied, "nop"),
    InstructionPattern::new(instructions::MOV_EAX_MOFFS32, Encoding::LoadAccumulator, "mov"),
    InstructionPattern::new(instructions::MOV_MOFFS32_EAX, Encoding::StoreAccumulator, "mov"),
    InstructionPattern::new(instructions::MOV_R32_IMM32, Encoding::RegisterImm32, "mov"),
    InstructionPattern::new(instructions::JMP_REL32, Encoding::Rel32, "jmp"),
    InstructionPattern::new(instructions::JMP_REL8, Encoding::Rel8, "jmp"),
];

pub static INSTRUCTION_PATTERNS: Lazy<HashMap<u8, &'static InstructionPattern>> =
    Lazy::new(|| {
        let mut map = HashMap::new();
        for pattern in PATTERNS {
            for opcode in pattern.opcodes() {
                map.insert(opcode, pattern);
            }
        }
        map
    });

pub fn get_pattern(opcode: u8) -> Option<&'static InstructionPattern> {
    INSTRUCTION_PATTERNS.get(&opcode).copied()
}

pub fn get_pattern_by_mnemonic(
    mnemonic: &str,
    encoding: Encoding,
) -> Option<&'static InstructionPattern> {
    PATTERNS
        .iter()
        .find(|pattern| pattern.mnemonic == mnemonic && pattern.encoding == encoding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_register_order() {
        let names: Vec<String> = Register::iter().map(|r| r.to_string()).collect();
        assert_eq!(
            names,
            ["EAX", "ECX", "EDX", "EBX", "ESP", "EBP", "ESI", "EDI"]
        );
        for (index, reg) in Register::iter().enumerate() {
            assert_eq!(reg.index(), index);
            assert_eq!(Register::ALL[index], reg);
        }
    }

    #[test]
    fn test_register_from_name() {
        assert_eq!(Register::from_name("ecx"), Some(Register::ECX));
        assert_eq!(Register::from_name("EDI"), Some(Register::EDI));
        assert_eq!(Register::from_name("r1"), None);
    }

    #[test]
    fn test_all_covered() {
        let table = DispatchTable::standard();
        for opcode in table.opcodes() {
            assert!(
                get_pattern(opcode).is_some(),
                "Pattern not implemented for opcode: {opcode:#04x}"
            );
        }
        for &opcode in INSTRUCTION_PATTERNS.keys() {
            assert!(
                table.lookup(opcode).is_some(),
                "Handler not registered for opcode: {opcode:#04x}"
            );
        }
    }

    #[test]
    fn test_pattern_lookup() {
        let pattern = get_pattern(0xBB).unwrap();
        assert_eq!(pattern.mnemonic, "mov");
        assert_eq!(pattern.opcode, 0xB8);
        assert_eq!(pattern.encoding.length(), 5);

        let pattern = get_pattern_by_mnemonic("jmp", Encoding::Rel8).unwrap();
        assert_eq!(pattern.opcode, 0xEB);
        assert!(get_pattern(0x00).is_none());
    }

    #[test]
    fn test_halt_from_error() {
        assert_eq!(
            Halt::from(ExecutionError::InvalidMemoryLocation(16)),
            Halt::OutOfBounds { address: 16 }
        );
        assert_eq!(
            Halt::from(ExecutionError::UnimplementedOpcode(0xFF, 3)),
            Halt::UnimplementedOpcode {
                opcode: 0xFF,
                instruction_pointer: 3
            }
        );
    }
}
