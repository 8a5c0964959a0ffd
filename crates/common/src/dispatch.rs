use std::fmt;

use crate::{instructions, ExecutionError, Machine};

/// Executes one instruction whose opcode sits at the current instruction
/// pointer. Handlers decode their own operands and leave the instruction
/// pointer at the next instruction (or the branch target).
pub type Handler = fn(&mut Machine) -> Result<(), ExecutionError>;

/// 256 slots indexed by opcode byte. Built once, then only read.
#[derive(Clone)]
pub struct DispatchTable {
    handlers: [Option<Handler>; 256],
}

impl DispatchTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: [None; 256],
        }
    }

    /// Table with every instruction the emulator implements.
    #[must_use]
    pub fn standard() -> Self {
        let mut table = Self::new();
        instructions::register_all(&mut table);
        table
    }

    pub fn register(&mut self, opcode: u8, handler: Handler) {
        self.handlers[opcode as usize] = Some(handler);
    }

    /// Installs `handler` for `base..base + count`, stopping after 0xFF.
    pub fn register_range(&mut self, base: u8, count: u8, handler: Handler) {
        for i in 0..count {
            let Some(opcode) = base.checked_add(i) else {
                break;
            };
            self.register(opcode, handler);
        }
    }

    #[must_use]
    pub fn lookup(&self, opcode: u8) -> Option<Handler> {
        self.handlers[opcode as usize]
    }

    pub fn opcodes(&self) -> impl Iterator<Item = u8> + '_ {
        self.handlers
            .iter()
            .enumerate()
            .filter(|(_, handler)| handler.is_some())
            .map(|(opcode, _)| opcode as u8)
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.opcodes().map(|opcode| format!("{opcode:#04x}")))
            .finish()
    }
}
