use std::sync::Arc;

use crate::{DispatchTable, ExecutionReport, ExecutionStats, Halt, Machine, RunMode, Step};

/// Observer invoked once for every instruction about to execute.
pub trait Tracer {
    fn on_instruction(&mut self, instruction_pointer: u32, opcode: u8, machine: &Machine);
}

#[derive(Debug, Default)]
pub struct NullTracer;

impl Tracer for NullTracer {
    fn on_instruction(&mut self, _instruction_pointer: u32, _opcode: u8, _machine: &Machine) {}
}

/// Drives a [`Machine`] through the fetch/decode/execute loop.
///
/// Once halted the emulator stays halted; build a new machine to run again.
#[derive(Debug)]
pub struct Emulator<T: Tracer = NullTracer> {
    machine: Machine,
    dispatch: Arc<DispatchTable>,
    tracer: T,
    halt: Option<Halt>,
    stats: ExecutionStats,
}

impl Emulator<NullTracer> {
    pub fn new(machine: Machine) -> Self {
        Self::with_tracer(machine, NullTracer)
    }
}

impl<T: Tracer> Emulator<T> {
    pub fn with_tracer(machine: Machine, tracer: T) -> Self {
        Self::with_dispatch(machine, Arc::new(DispatchTable::standard()), tracer)
    }

    /// Uses a shared, already populated table.
    pub fn with_dispatch(machine: Machine, dispatch: Arc<DispatchTable>, tracer: T) -> Self {
        Self {
            machine,
            dispatch,
            tracer,
            halt: None,
            stats: ExecutionStats::default(),
        }
    }

    #[must_use]
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Mutable access for loading a program before the first step.
    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub fn into_machine(self) -> Machine {
        self.machine
    }

    #[must_use]
    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    #[must_use]
    pub fn halted(&self) -> Option<Halt> {
        self.halt
    }

    #[must_use]
    pub fn stats(&self) -> ExecutionStats {
        self.stats
    }

    pub fn execute(&mut self, run_mode: RunMode) -> ExecutionReport {
        let budget = match run_mode {
            RunMode::Run => None,
            RunMode::RunFor(steps) => Some(steps),
        };

        let mut executed = 0;
        while budget.map_or(true, |budget| executed < budget) {
            match self.step() {
                Step::Continue => executed += 1,
                Step::Halted(_) => break,
            }
        }

        ExecutionReport {
            halt: self.halt,
            stats: self.stats,
        }
    }

    pub fn step(&mut self) -> Step {
        if let Some(halt) = self.halt {
            return Step::Halted(halt);
        }

        let eip = self.machine.instruction_pointer();
        if eip >= self.machine.memory().capacity() {
            return self.stop(Halt::OutOfBounds { address: eip });
        }

        let opcode = match self.machine.fetch8(0) {
            Ok(opcode) => opcode,
            Err(err) => return self.stop(err.into()),
        };

        let Some(handler) = self.dispatch.lookup(opcode) else {
            return self.stop(Halt::UnimplementedOpcode {
                opcode,
                instruction_pointer: eip,
            });
        };

        tracing::trace!(eip, opcode, "execute");
        self.tracer.on_instruction(eip, opcode, &self.machine);

        if let Err(err) = handler(&mut self.machine) {
            return self.stop(err.into());
        }
        self.stats.instructions += 1;

        if self.machine.instruction_pointer() == 0 {
            return self.stop(Halt::Normal);
        }
        Step::Continue
    }

    fn stop(&mut self, halt: Halt) -> Step {
        tracing::debug!(
            %halt,
            eip = self.machine.instruction_pointer(),
            instructions = self.stats.instructions,
            "machine halted"
        );
        self.halt = Some(halt);
        Step::Halted(halt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MachineConfig, Register};

    fn run_program(program: &[u8], memory_size: u32) -> Emulator {
        let machine = Machine::new(MachineConfig {
            memory_size,
            ..Default::default()
        })
        .unwrap();
        let mut emulator = Emulator::new(machine);
        emulator
            .machine_mut()
            .load(0, program, usize::MAX)
            .unwrap();
        emulator.execute(RunMode::Run);
        emulator
    }

    #[test]
    fn test_unimplemented_opcode() {
        let emulator = run_program(&[0x90, 0x90, 0xF4], 64);
        assert_eq!(
            emulator.halted(),
            Some(Halt::UnimplementedOpcode {
                opcode: 0xF4,
                instruction_pointer: 2
            })
        );
        assert_eq!(emulator.stats().instructions, 2);
        assert_eq!(emulator.machine().instruction_pointer(), 2);
    }

    #[test]
    fn test_zeroed_memory_is_unimplemented() {
        let emulator = run_program(&[], 16);
        assert_eq!(
            emulator.halted(),
            Some(Halt::UnimplementedOpcode {
                opcode: 0x00,
                instruction_pointer: 0
            })
        );
        assert_eq!(emulator.stats().instructions, 0);
    }

    #[test]
    fn test_normal_halt_on_zero() {
        // mov eax, 42 ; jmp short 0
        let emulator = run_program(&[0xB8, 42, 0, 0, 0, 0xEB, 0xF9], 64);
        assert_eq!(emulator.halted(), Some(Halt::Normal));
        assert_eq!(emulator.machine().register(Register::EAX), 42);
        assert_eq!(emulator.stats().instructions, 2);
    }

    #[test]
    fn test_out_of_bounds_entrypoint() {
        let machine = Machine::new(MachineConfig {
            memory_size: 16,
            entrypoint: 16,
            ..Default::default()
        })
        .unwrap();
        let mut emulator = Emulator::new(machine);
        let report = emulator.execute(RunMode::Run);
        assert_eq!(report.halt, Some(Halt::OutOfBounds { address: 16 }));
        assert_eq!(report.stats.instructions, 0);
    }

    #[test]
    fn test_jump_past_end() {
        // jmp short +0x7f from 0 lands at 0x81 in a 0x40 byte memory
        let emulator = run_program(&[0xEB, 0x7F], 0x40);
        assert_eq!(emulator.halted(), Some(Halt::OutOfBounds { address: 0x81 }));
        assert_eq!(emulator.stats().instructions, 1);
    }

    #[test]
    fn test_jump_before_start_wraps() {
        let mut program = vec![0x90; 4];
        program.extend([0xEB, 0x80]); // from 4: 4 + 2 - 128
        let emulator = run_program(&program, 0x40);
        assert_eq!(
            emulator.halted(),
            Some(Halt::OutOfBounds {
                address: 6u32.wrapping_sub(128)
            })
        );
    }

    #[test]
    fn test_truncated_operand() {
        // mov eax, imm32 with only two immediate bytes left in memory
        let mut program = vec![0x90; 13];
        program.extend([0xB8, 0x01, 0x02]);
        let emulator = run_program(&program, 16);
        assert_eq!(emulator.halted(), Some(Halt::OutOfBounds { address: 16 }));
        assert_eq!(emulator.machine().register(Register::EAX), 0);
        assert_eq!(emulator.machine().instruction_pointer(), 13);
    }

    #[test]
    fn test_run_for_budget() {
        // jmp short to itself + 2: never halts
        let machine = Machine::new(MachineConfig {
            memory_size: 16,
            entrypoint: 4,
            ..Default::default()
        })
        .unwrap();
        let mut emulator = Emulator::new(machine);
        emulator.machine_mut().load(4, &[0xEB, 0xFE], 2).unwrap();

        let report = emulator.execute(RunMode::RunFor(10));
        assert_eq!(report.halt, None);
        assert_eq!(report.stats.instructions, 10);
        assert_eq!(emulator.machine().instruction_pointer(), 4);

        let report = emulator.execute(RunMode::RunFor(0));
        assert_eq!(report.stats.instructions, 10);
    }

    #[test]
    fn test_no_resume_after_halt() {
        let mut emulator = run_program(&[0x90], 4);
        let halt = emulator.halted().unwrap();
        assert_eq!(emulator.step(), Step::Halted(halt));
        let report = emulator.execute(RunMode::Run);
        assert_eq!(report.halt, Some(halt));
        assert_eq!(report.stats.instructions, 1);
    }

    #[test]
    fn test_shared_dispatch_table() {
        let dispatch = Arc::new(DispatchTable::standard());
        let mut emulators: Vec<_> = (0..2u8)
            .map(|i| {
                let mut machine = Machine::new(MachineConfig {
                    memory_size: 32,
                    ..Default::default()
                })
                .unwrap();
                machine.load(0, &[0xB8, i, 0, 0, 0], 5).unwrap();
                Emulator::with_dispatch(machine, Arc::clone(&dispatch), NullTracer)
            })
            .collect();

        for (i, emulator) in emulators.iter_mut().enumerate() {
            emulator.execute(RunMode::Run);
            assert_eq!(emulator.machine().register(Register::EAX), i as u32);
        }
    }

    #[test]
    fn test_empty_dispatch_table() {
        let machine = Machine::new(MachineConfig {
            memory_size: 8,
            ..Default::default()
        })
        .unwrap();
        let dispatch = Arc::new(DispatchTable::new());
        let mut emulator = Emulator::with_dispatch(machine, dispatch, NullTracer);
        emulator.machine_mut().load(0, &[0x90], 1).unwrap();
        assert_eq!(
            emulator.execute(RunMode::Run).halt,
            Some(Halt::UnimplementedOpcode {
                opcode: 0x90,
                instruction_pointer: 0
            })
        );
    }
}
