//! Instruction handlers.
//!
//! Straight-line instructions fetch their operands at fixed offsets from the
//! opcode and then advance by their full encoded length. Branches compute the
//! target from the end of the instruction and assign it directly.

use crate::{DispatchTable, ExecutionError, Flags, Machine, Register, REGISTER_COUNT};

pub const INC_R32: u8 = 0x40;
pub const DEC_R32: u8 = 0x48;
pub const JZ_REL8: u8 = 0x74;
pub const JNZ_REL8: u8 = 0x75;
pub const NOP: u8 = 0x90;
pub const MOV_EAX_MOFFS32: u8 = 0xA1;
pub const MOV_MOFFS32_EAX: u8 = 0xA3;
pub const MOV_R32_IMM32: u8 = 0xB8;
pub const JMP_REL32: u8 = 0xE9;
pub const JMP_REL8: u8 = 0xEB;

pub fn register_all(table: &mut DispatchTable) {
    table.register_range(INC_R32, REGISTER_COUNT as u8, inc_r32);
    table.register_range(DEC_R32, REGISTER_COUNT as u8, dec_r32);
    table.register(JZ_REL8, jz_rel8);
    table.register(JNZ_REL8, jnz_rel8);
    table.register(NOP, nop);
    table.register(MOV_EAX_MOFFS32, mov_eax_moffs32);
    table.register(MOV_MOFFS32_EAX, mov_moffs32_eax);
    table.register_range(MOV_R32_IMM32, REGISTER_COUNT as u8, mov_r32_imm32);
    table.register(JMP_REL32, jmp_rel32);
    table.register(JMP_REL8, short_jump);
}

fn register_operand(machine: &Machine, base: u8) -> Result<Register, ExecutionError> {
    Ok(Register::from_low_bits(machine.fetch8(0)?.wrapping_sub(base)))
}

fn nop(machine: &mut Machine) -> Result<(), ExecutionError> {
    machine.advance(1);
    Ok(())
}

fn mov_r32_imm32(machine: &mut Machine) -> Result<(), ExecutionError> {
    let reg = register_operand(machine, MOV_R32_IMM32)?;
    let value = machine.fetch32(1)?;
    machine.set_register(reg, value);
    machine.advance(5);
    Ok(())
}

fn mov_eax_moffs32(machine: &mut Machine) -> Result<(), ExecutionError> {
    let address = machine.fetch32(1)?;
    let value = machine.memory().read_le32(address)?;
    machine.set_register(Register::EAX, value);
    machine.advance(5);
    Ok(())
}

fn mov_moffs32_eax(machine: &mut Machine) -> Result<(), ExecutionError> {
    let address = machine.fetch32(1)?;
    let value = machine.register(Register::EAX);
    machine.memory_mut().write_le32(address, value)?;
    machine.advance(5);
    Ok(())
}

/// ZF, SF and OF as set by INC/DEC. CF is left alone.
fn update_flags_inc_dec(flags: &mut Flags, result: u32, overflow: bool) {
    flags.set(Flags::ZERO, result == 0);
    flags.set(Flags::SIGN, (result as i32) < 0);
    flags.set(Flags::OVERFLOW, overflow);
}

fn inc_r32(machine: &mut Machine) -> Result<(), ExecutionError> {
    let reg = register_operand(machine, INC_R32)?;
    let value = machine.register(reg);
    let result = value.wrapping_add(1);
    machine.set_register(reg, result);
    update_flags_inc_dec(machine.flags_mut(), result, value == i32::MAX as u32);
    machine.advance(1);
    Ok(())
}

fn dec_r32(machine: &mut Machine) -> Result<(), ExecutionError> {
    let reg = register_operand(machine, DEC_R32)?;
    let value = machine.register(reg);
    let result = value.wrapping_sub(1);
    machine.set_register(reg, result);
    update_flags_inc_dec(machine.flags_mut(), result, value == i32::MIN as u32);
    machine.advance(1);
    Ok(())
}

fn short_jump(machine: &mut Machine) -> Result<(), ExecutionError> {
    let diff = machine.fetch_i8(1)?;
    machine.jump_relative(2, i32::from(diff));
    Ok(())
}

fn jmp_rel32(machine: &mut Machine) -> Result<(), ExecutionError> {
    let diff = machine.fetch32(1)? as i32;
    machine.jump_relative(5, diff);
    Ok(())
}

fn jump_short_if(machine: &mut Machine, condition: bool) -> Result<(), ExecutionError> {
    let diff = machine.fetch_i8(1)?;
    if condition {
        machine.jump_relative(2, i32::from(diff));
    } else {
        machine.advance(2);
    }
    Ok(())
}

fn jz_rel8(machine: &mut Machine) -> Result<(), ExecutionError> {
    let zero = machine.flags().contains(Flags::ZERO);
    jump_short_if(machine, zero)
}

fn jnz_rel8(machine: &mut Machine) -> Result<(), ExecutionError> {
    let zero = machine.flags().contains(Flags::ZERO);
    jump_short_if(machine, !zero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{get_pattern, MachineConfig};

    fn machine_at(program: &[u8], eip: u32) -> Machine {
        let mut machine = Machine::new(MachineConfig {
            memory_size: 256,
            entrypoint: eip,
            ..Default::default()
        })
        .unwrap();
        machine.load(0, program, usize::MAX).unwrap();
        machine
    }

    fn execute(machine: &mut Machine) -> Result<(), ExecutionError> {
        let opcode = machine.fetch8(0)?;
        let handler = DispatchTable::standard()
            .lookup(opcode)
            .ok_or(ExecutionError::UnimplementedOpcode(opcode, machine.instruction_pointer()))?;
        handler(machine)
    }

    #[test]
    fn test_mov_each_register() {
        for reg in Register::ALL {
            let mut machine = machine_at(&[0xB8 + reg as u8, 0x78, 0x56, 0x34, 0x12], 0);
            execute(&mut machine).unwrap();
            assert_eq!(machine.register(reg), 0x1234_5678, "{reg}");
            assert_eq!(machine.instruction_pointer(), 5);
        }
    }

    #[test]
    fn test_short_jump_backwards() {
        let mut program = vec![0; 32];
        program[20] = 0xEB;
        program[21] = 0xF6; // -10
        let mut machine = machine_at(&program, 20);
        execute(&mut machine).unwrap();
        assert_eq!(machine.instruction_pointer(), 12);
    }

    #[test]
    fn test_near_jump() {
        let mut machine = machine_at(&[0xE9, 0x10, 0x00, 0x00, 0x00], 0);
        execute(&mut machine).unwrap();
        assert_eq!(machine.instruction_pointer(), 0x15);

        let mut program = vec![0; 0x40];
        program[0x30..0x35].copy_from_slice(&[0xE9, 0xCB, 0xFF, 0xFF, 0xFF]); // -0x35
        let mut machine = machine_at(&program, 0x30);
        execute(&mut machine).unwrap();
        assert_eq!(machine.instruction_pointer(), 0);
    }

    #[test]
    fn test_load_store_accumulator() {
        let program = [
            0xA3, 0x80, 0x00, 0x00, 0x00, // mov [0x80], eax
            0xA1, 0x84, 0x00, 0x00, 0x00, // mov eax, [0x84]
        ];
        let mut machine = machine_at(&program, 0);
        machine.set_register(Register::EAX, 0xCAFE_BABE);
        machine.memory_mut().write_le32(0x84, 7).unwrap();

        execute(&mut machine).unwrap();
        assert_eq!(machine.memory().read_le32(0x80).unwrap(), 0xCAFE_BABE);
        assert_eq!(&machine.memory().as_slice()[0x80..0x84], &[0xBE, 0xBA, 0xFE, 0xCA]);

        execute(&mut machine).unwrap();
        assert_eq!(machine.register(Register::EAX), 7);
        assert_eq!(machine.instruction_pointer(), 10);
    }

    #[test]
    fn test_store_out_of_bounds_leaves_state() {
        let mut machine = machine_at(&[0xA3, 0xFE, 0x00, 0x00, 0x00], 0);
        assert_eq!(
            execute(&mut machine),
            Err(ExecutionError::InvalidMemoryLocation(0x100))
        );
        assert_eq!(machine.instruction_pointer(), 0);
    }

    #[test]
    fn test_inc_dec_flags() {
        let mut machine = machine_at(&[0x41, 0x49, 0x49], 0);
        machine.set_register(Register::ECX, u32::MAX);
        machine.flags_mut().set(Flags::CARRY, true);

        execute(&mut machine).unwrap();
        assert_eq!(machine.register(Register::ECX), 0);
        assert!(machine.flags().contains(Flags::ZERO));
        assert!(machine.flags().contains(Flags::CARRY));

        execute(&mut machine).unwrap();
        assert_eq!(machine.register(Register::ECX), u32::MAX);
        assert!(!machine.flags().contains(Flags::ZERO));
        assert!(machine.flags().contains(Flags::SIGN));
        assert!(!machine.flags().contains(Flags::OVERFLOW));

        machine.set_register(Register::ECX, 0x8000_0000);
        execute(&mut machine).unwrap();
        assert_eq!(machine.register(Register::ECX), 0x7FFF_FFFF);
        assert!(machine.flags().contains(Flags::OVERFLOW));
        assert!(!machine.flags().contains(Flags::SIGN));
        assert_eq!(machine.instruction_pointer(), 3);
    }

    #[test]
    fn test_conditional_jumps() {
        let mut machine = machine_at(&[0x74, 0x10, 0x75, 0x10], 0);
        execute(&mut machine).unwrap();
        assert_eq!(machine.instruction_pointer(), 2);
        execute(&mut machine).unwrap();
        assert_eq!(machine.instruction_pointer(), 0x14);

        let mut machine = machine_at(&[0x74, 0x10], 0);
        machine.flags_mut().set(Flags::ZERO, true);
        execute(&mut machine).unwrap();
        assert_eq!(machine.instruction_pointer(), 0x12);
    }

    #[test]
    fn test_straight_line_lengths_match_patterns() {
        let mut memory = [0u8; 8];
        for opcode in [NOP, INC_R32 + 2, DEC_R32 + 5, MOV_R32_IMM32 + 3, MOV_EAX_MOFFS32] {
            memory[0] = opcode;
            let mut machine = machine_at(&memory, 0);
            execute(&mut machine).unwrap();
            let pattern = get_pattern(opcode).unwrap();
            assert_eq!(
                machine.instruction_pointer(),
                pattern.encoding.length(),
                "{opcode:#04x}"
            );
        }
    }
}
