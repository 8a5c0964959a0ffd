use byteorder::{ByteOrder, LittleEndian};
use px86_common::{get_pattern_by_mnemonic, Encoding, InstructionPattern, Register};
use std::collections::HashMap;
use thiserror::Error;

mod disassembler;

pub use disassembler::{Disassembler, DisassemblerError};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AssemblerError {
    #[error("Unknown instruction: {0}")]
    UnknownInstruction(String),
    #[error("Wrong number of operands for {mnemonic}: expected {expected}, got {got}")]
    WrongOperandCount {
        mnemonic: String,
        expected: usize,
        got: usize,
    },
    #[error("Invalid register name: {0}")]
    InvalidRegister(String),
    #[error("Invalid immediate value: {0}")]
    InvalidImmediate(String),
    #[error("Invalid memory operand: {0}")]
    InvalidAddress(String),
    #[error("Invalid label: {0}")]
    InvalidLabel(String),
    #[error("Undefined label: {0}")]
    UndefinedLabel(String),
    #[error("Duplicate label: {0}")]
    DuplicateLabel(String),
    #[error("Jump target {target:#x} is out of range for a short jump at {address:#x}")]
    DisplacementOutOfRange { address: u32, target: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Address(u32),
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedOperand {
    Register(Register),
    Immediate(u32),
    Memory(u32),
    Target(Target),
}

/// Two pass assembler producing a raw memory image.
#[derive(Debug, Default)]
pub struct Assembler {
    labels: HashMap<String, u32>,
    origin: u32,
}

fn parse_number(value: &str) -> Option<u32> {
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16).ok()
    } else if value.starts_with('-') {
        value.parse::<i32>().ok().map(|v| v as u32)
    } else {
        value.parse::<u32>().ok()
    }
}

/// Parses a decimal or `0x` prefixed hexadecimal command line value.
pub fn parse_unsigned<T: TryFrom<u64>>(value: &str) -> Result<T, String> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    }
    .map_err(|e| format!("invalid number '{value}': {e}"))?;
    T::try_from(parsed).map_err(|_| format!("number '{value}' is out of range"))
}

fn push_u32(code: &mut Vec<u8>, value: u32) {
    let mut buf = [0; 4];
    LittleEndian::write_u32(&mut buf, value);
    code.extend_from_slice(&buf);
}

fn is_memory(operand: &str) -> bool {
    operand.starts_with('[')
}

fn short_target(operand: &str) -> Option<&str> {
    let (keyword, rest) = operand.split_once(char::is_whitespace)?;
    keyword
        .eq_ignore_ascii_case("short")
        .then_some(rest.trim())
}

fn strip_comment(line: &str) -> &str {
    match line.split_once(';') {
        Some((code, _)) => code.trim(),
        None => line.trim(),
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assembles as if the image is loaded at `origin`.
    pub fn with_origin(origin: u32) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    pub fn labels(&self) -> &HashMap<String, u32> {
        &self.labels
    }

    pub fn parse_register(reg: &str) -> Result<Register, AssemblerError> {
        Register::from_name(reg).ok_or_else(|| AssemblerError::InvalidRegister(reg.to_string()))
    }

    fn parse_immediate(operand: &str) -> Result<u32, AssemblerError> {
        parse_number(operand).ok_or_else(|| AssemblerError::InvalidImmediate(operand.to_string()))
    }

    fn parse_memory(operand: &str) -> Result<u32, AssemblerError> {
        operand
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|inner| parse_number(inner.trim()))
            .ok_or_else(|| AssemblerError::InvalidAddress(operand.to_string()))
    }

    fn parse_target(operand: &str) -> Result<Target, AssemblerError> {
        if let Some(address) = parse_number(operand) {
            return Ok(Target::Address(address));
        }
        let valid = operand
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && operand.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(Target::Label(operand.to_string()))
        } else {
            Err(AssemblerError::InvalidLabel(operand.to_string()))
        }
    }

    fn parse_operand(
        operand: &str,
        encoding: Encoding,
        index: usize,
    ) -> Result<ParsedOperand, AssemblerError> {
        match (encoding, index) {
            (Encoding::Rel8, _) => {
                let target = short_target(operand).unwrap_or(operand);
                Ok(ParsedOperand::Target(Self::parse_target(target)?))
            }
            (Encoding::Rel32, _) => Ok(ParsedOperand::Target(Self::parse_target(operand)?)),
            (Encoding::RegisterImm32, 1) => {
                Ok(ParsedOperand::Immediate(Self::parse_immediate(operand)?))
            }
            (Encoding::LoadAccumulator, 1) | (Encoding::StoreAccumulator, 0) => {
                Ok(ParsedOperand::Memory(Self::parse_memory(operand)?))
            }
            _ => Ok(ParsedOperand::Register(Self::parse_register(operand)?)),
        }
    }

    /// Picks the encoding from the mnemonic and the shape of its operands.
    fn select_pattern(
        mnemonic: &str,
        operands: &[&str],
    ) -> Result<&'static InstructionPattern, AssemblerError> {
        let expected = match mnemonic {
            "nop" => 0,
            "inc" | "dec" | "jmp" | "jz" | "jnz" => 1,
            "mov" => 2,
            _ => return Err(AssemblerError::UnknownInstruction(mnemonic.to_string())),
        };
        if operands.len() != expected {
            return Err(AssemblerError::WrongOperandCount {
                mnemonic: mnemonic.to_string(),
                expected,
                got: operands.len(),
            });
        }

        let encoding = match mnemonic {
            "nop" => Encoding::Implied,
            "inc" | "dec" => Encoding::RegisterInOpcode,
            "jz" | "jnz" => Encoding::Rel8,
            "jmp" if short_target(operands[0]).is_some() => Encoding::Rel8,
            "jmp" => Encoding::Rel32,
            _ => match (is_memory(operands[0]), is_memory(operands[1])) {
                (false, true) => Encoding::LoadAccumulator,
                (true, false) => Encoding::StoreAccumulator,
                (false, false) => Encoding::RegisterImm32,
                (true, true) => {
                    return Err(AssemblerError::InvalidRegister(operands[1].to_string()))
                }
            },
        };

        get_pattern_by_mnemonic(mnemonic, encoding)
            .ok_or_else(|| AssemblerError::UnknownInstruction(mnemonic.to_string()))
    }

    fn split_line(line: &str) -> Option<(String, Vec<&str>)> {
        let line = strip_comment(line);
        if line.is_empty() || line.ends_with(':') {
            return None;
        }
        let (mnemonic, rest) = match line.split_once(char::is_whitespace) {
            Some((mnemonic, rest)) => (mnemonic, rest.trim()),
            None => (line, ""),
        };
        let operands = if rest.is_empty() {
            vec![]
        } else {
            rest.split(',').map(str::trim).collect()
        };
        Some((mnemonic.to_ascii_lowercase(), operands))
    }

    fn resolve(&self, target: Target) -> Result<u32, AssemblerError> {
        match target {
            Target::Address(address) => Ok(address),
            Target::Label(label) => self
                .labels
                .get(&label)
                .copied()
                .ok_or(AssemblerError::UndefinedLabel(label)),
        }
    }

    fn expect_accumulator(operand: &ParsedOperand, text: &str) -> Result<(), AssemblerError> {
        match operand {
            ParsedOperand::Register(Register::EAX) => Ok(()),
            _ => Err(AssemblerError::InvalidRegister(text.to_string())),
        }
    }

    fn expect_register(operand: &ParsedOperand, text: &str) -> Result<Register, AssemblerError> {
        match operand {
            ParsedOperand::Register(reg) => Ok(*reg),
            _ => Err(AssemblerError::InvalidRegister(text.to_string())),
        }
    }

    /// Encodes one line for the given load address. Labels must already be known.
    pub fn assemble_line(&self, line: &str, address: u32) -> Result<Vec<u8>, AssemblerError> {
        let Some((mnemonic, operands)) = Self::split_line(line) else {
            return Ok(vec![]);
        };
        let pattern = Self::select_pattern(&mnemonic, &operands)?;
        let parsed = operands
            .iter()
            .enumerate()
            .map(|(index, operand)| Self::parse_operand(operand, pattern.encoding, index))
            .collect::<Result<Vec<_>, _>>()?;

        let mut result = vec![pattern.opcode];
        let end = address.wrapping_add(pattern.encoding.length());

        match pattern.encoding {
            Encoding::Implied => {}
            Encoding::RegisterInOpcode => {
                let reg = Self::expect_register(&parsed[0], operands[0])?;
                result[0] += reg as u8;
            }
            Encoding::RegisterImm32 => {
                let reg = Self::expect_register(&parsed[0], operands[0])?;
                let ParsedOperand::Immediate(value) = parsed[1] else {
                    return Err(AssemblerError::InvalidImmediate(operands[1].to_string()));
                };
                result[0] += reg as u8;
                push_u32(&mut result, value);
            }
            Encoding::LoadAccumulator => {
                Self::expect_accumulator(&parsed[0], operands[0])?;
                let ParsedOperand::Memory(offset) = parsed[1] else {
                    return Err(AssemblerError::InvalidAddress(operands[1].to_string()));
                };
                push_u32(&mut result, offset);
            }
            Encoding::StoreAccumulator => {
                Self::expect_accumulator(&parsed[1], operands[1])?;
                let ParsedOperand::Memory(offset) = parsed[0] else {
                    return Err(AssemblerError::InvalidAddress(operands[0].to_string()));
                };
                push_u32(&mut result, offset);
            }
            Encoding::Rel8 | Encoding::Rel32 => {
                let ParsedOperand::Target(target) = parsed[0].clone() else {
                    return Err(AssemblerError::InvalidLabel(operands[0].to_string()));
                };
                let target = self.resolve(target)?;
                let displacement = target.wrapping_sub(end) as i32;
                if pattern.encoding == Encoding::Rel8 {
                    let short = i8::try_from(displacement)
                        .map_err(|_| AssemblerError::DisplacementOutOfRange { address, target })?;
                    result.push(short as u8);
                } else {
                    push_u32(&mut result, displacement as u32);
                }
            }
        }

        Ok(result)
    }

    pub fn assemble_program(&mut self, program: &str) -> Result<Vec<u8>, AssemblerError> {
        self.labels.clear();

        // First pass: collect labels
        let mut address = self.origin;
        for line in program.lines() {
            let line = strip_comment(line);
            if let Some(label) = line.strip_suffix(':') {
                let label = label.trim();
                if !matches!(Self::parse_target(label)?, Target::Label(_)) {
                    return Err(AssemblerError::InvalidLabel(label.to_string()));
                }
                if self.labels.insert(label.to_string(), address).is_some() {
                    return Err(AssemblerError::DuplicateLabel(label.to_string()));
                }
            } else if let Some((mnemonic, operands)) = Self::split_line(line) {
                let pattern = Self::select_pattern(&mnemonic, &operands)?;
                address = address.wrapping_add(pattern.encoding.length());
            }
        }

        // Second pass: generate code
        let mut address = self.origin;
        let mut image = Vec::new();
        for line in program.lines() {
            let mut code = self.assemble_line(line, address)?;
            address = address.wrapping_add(code.len() as u32);
            image.append(&mut code);
        }

        Ok(image)
    }
}
