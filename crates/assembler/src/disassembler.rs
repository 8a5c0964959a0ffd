use byteorder::{ByteOrder, LittleEndian};
use px86_common::{get_pattern, Encoding, Register};
use std::fmt::Write;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DisassemblerError {
    #[error("Invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),
    #[error("Unexpected end of code")]
    UnexpectedEnd,
}

fn register_name(opcode: u8, base: u8) -> String {
    Register::from_low_bits(opcode - base)
        .to_string()
        .to_lowercase()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Disassembler;

impl Disassembler {
    pub fn new() -> Self {
        Self
    }

    /// Decodes the instruction at the start of `code`, which is loaded at
    /// `address`. Returns the text and the encoded length.
    pub fn disassemble_instruction(
        &self,
        code: &[u8],
        address: u32,
    ) -> Result<(String, usize), DisassemblerError> {
        let &opcode = code.first().ok_or(DisassemblerError::UnexpectedEnd)?;
        let pattern = get_pattern(opcode).ok_or(DisassemblerError::InvalidOpcode(opcode))?;
        let length = pattern.encoding.length() as usize;
        if code.len() < length {
            return Err(DisassemblerError::UnexpectedEnd);
        }

        let mnemonic = pattern.mnemonic;
        let end = address.wrapping_add(length as u32);
        let text = match pattern.encoding {
            Encoding::Implied => mnemonic.to_string(),
            Encoding::RegisterInOpcode => {
                format!("{mnemonic} {}", register_name(opcode, pattern.opcode))
            }
            Encoding::RegisterImm32 => format!(
                "{mnemonic} {}, {:#x}",
                register_name(opcode, pattern.opcode),
                LittleEndian::read_u32(&code[1..5])
            ),
            Encoding::LoadAccumulator => {
                format!("{mnemonic} eax, [{:#x}]", LittleEndian::read_u32(&code[1..5]))
            }
            Encoding::StoreAccumulator => {
                format!("{mnemonic} [{:#x}], eax", LittleEndian::read_u32(&code[1..5]))
            }
            Encoding::Rel8 => {
                let target = end.wrapping_add_signed(i32::from(code[1] as i8));
                format!("{mnemonic} short {target:#x}")
            }
            Encoding::Rel32 => {
                let target = end.wrapping_add(LittleEndian::read_u32(&code[1..5]));
                format!("{mnemonic} {target:#x}")
            }
        };

        Ok((text, length))
    }

    /// Listing of a whole image. Bytes that do not decode are emitted as `db`.
    pub fn disassemble_program(&self, code: &[u8], origin: u32) -> String {
        let mut result = String::new();
        let mut offset = 0;

        while offset < code.len() {
            let address = origin.wrapping_add(offset as u32);
            let (text, size) = match self.disassemble_instruction(&code[offset..], address) {
                Ok(decoded) => decoded,
                Err(_) => (format!("db {:#04x}", code[offset]), 1),
            };
            let bytes = code[offset..offset + size]
                .iter()
                .map(|b| format!("{b:02X}"))
                .collect::<Vec<_>>()
                .join(" ");
            _ = writeln!(result, "{address:08x}:  {bytes:<15} {text}");
            offset += size;
        }

        result
    }
}
