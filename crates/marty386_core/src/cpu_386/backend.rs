/*
    Marty386
    x86 instruction emulation core

    Copyright 2025 The Marty386 Authors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    ---------------------------------------------------------------------------

    cpu_386::backend.rs

    CpuBackend selects an execution tier and steps a CpuContext through it.

    The backend owns the recompiler's block cache and the instruction trace
    sink. A step runs one instruction in the interpreter tiers, or one block
    in the recompiler.

*/

use cfg_if::cfg_if;

use crate::{
    coreconfig::CoreConfig,
    cpu_386::{
        context::{CodeQueue, ContextQueue, CpuContext},
        decode::decode,
        fast,
        instruction::Instruction,
        interpreter,
        recompiler::Recompiler,
    },
    cpu_common::*,
    tracelogger::TraceLogger,
};

pub struct CpuBackend {
    backend: BackendType,
    rep_mode: RepMode,
    trace_mode: TraceMode,
    trace_logger: TraceLogger,
    recompiler: Recompiler,
    instruction_count: u64,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::with_backend(BackendType::default(), RepMode::default())
    }
}

impl CpuBackend {
    pub fn new(config: &impl CoreConfig) -> Self {
        let trace_mode = config.get_cpu_trace_mode().unwrap_or_default();
        let trace_logger = match (config.get_cpu_trace_on(), trace_mode) {
            (true, TraceMode::Instruction) => match config.get_cpu_trace_file() {
                Some(path) => TraceLogger::from_filename(path),
                None => TraceLogger::Console,
            },
            _ => TraceLogger::None,
        };

        log::debug!(
            "CpuBackend: {} backend, {:?} rep mode, tracing {}",
            config.get_cpu_backend(),
            config.get_cpu_rep_mode(),
            if trace_logger.is_some() { "on" } else { "off" }
        );

        Self {
            backend: config.get_cpu_backend(),
            rep_mode: config.get_cpu_rep_mode(),
            trace_mode,
            trace_logger,
            recompiler: Recompiler::new(config.get_max_block_instructions()),
            instruction_count: 0,
        }
    }

    pub fn with_backend(backend: BackendType, rep_mode: RepMode) -> Self {
        Self {
            backend,
            rep_mode,
            trace_mode: TraceMode::None,
            trace_logger: TraceLogger::None,
            recompiler: Recompiler::default(),
            instruction_count: 0,
        }
    }

    pub fn backend_type(&self) -> BackendType {
        self.backend
    }

    pub fn set_backend_type(&mut self, backend: BackendType) {
        if backend != self.backend {
            self.recompiler.flush();
        }
        self.backend = backend;
    }

    pub fn rep_mode(&self) -> RepMode {
        self.rep_mode
    }

    pub fn recompiler(&self) -> &Recompiler {
        &self.recompiler
    }

    pub fn recompiler_mut(&mut self) -> &mut Recompiler {
        &mut self.recompiler
    }

    /// Number of steps that completed without an abort.
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    pub fn set_trace_logger(&mut self, logger: TraceLogger) {
        self.trace_logger.flush();
        self.trace_mode = match logger.is_some() {
            true => TraceMode::Instruction,
            false => TraceMode::None,
        };
        self.trace_logger = logger;
    }

    pub fn trace_logger_mut(&mut self) -> &mut TraceLogger {
        &mut self.trace_logger
    }

    pub fn flush_trace(&mut self) {
        self.trace_logger.flush();
    }

    /// Decode the instruction at CS:`offset` without executing it or moving EIP.
    pub fn disassemble<C: CpuContext + ?Sized>(cpu: &mut C, offset: u32) -> Result<Instruction, CpuError> {
        let regs = cpu.registers();
        let operand_size = regs.code_operand_size();
        let address_size = regs.code_address_size();
        let mut queue = CodeQueue::new(cpu, offset);
        match decode(&mut queue, address_size, operand_size) {
            Ok(mut instr) => {
                instr.address = offset;
                Ok(instr)
            }
            Err(source) => Err(CpuError::InstructionDecodeError { address: offset, source }),
        }
    }

    /// Run one instruction, or one block when the recompiler is selected.
    ///
    /// Faults delivered through the context are reported as Ok(Aborted). A fault the context
    /// could not deliver leaves it halted, and is returned as Err.
    pub fn step<C: CpuContext + ?Sized>(&mut self, cpu: &mut C) -> Result<ExecutionResult, CpuError> {
        if cpu.halted() {
            if !cpu.has_external_interrupt() {
                return Err(CpuError::CpuHaltedError(cpu.registers().eip));
            }
            cpu.set_halted(false);
        }

        cfg_if! {
            if #[cfg(feature = "cpu_trace")] {
                if self.trace_mode == TraceMode::Instruction {
                    self.trace_instruction(cpu);
                }
            }
        }

        let single_step = cpu.registers().get_flag(Flag::Trap);
        let result = match self.backend {
            BackendType::Interpreter => Self::step_interpreter(cpu, self.rep_mode),
            BackendType::FastInterpreter => Self::step_fast(cpu, self.rep_mode),
            BackendType::Recompiler => self.step_recompiler(cpu)?,
        };

        let result = match result {
            Ok(result) => {
                self.instruction_count += 1;
                if single_step && matches!(result, ExecutionResult::Okay | ExecutionResult::OkayRep) {
                    Err(Self::single_step_trap(cpu))
                }
                else {
                    Ok(result)
                }
            }
            Err(abort) => Err(abort),
        };

        match result {
            Ok(result) => Ok(result),
            Err(abort) if cpu.halted() => {
                log::error!("CpuBackend: unrecoverable exception {}, cpu halted", abort);
                Err(CpuError::ExceptionError(abort))
            }
            Err(abort) => Ok(ExecutionResult::Aborted(abort)),
        }
    }

    /// Step until HLT, an abort, or `limit` steps have run. Returns the number of steps taken.
    pub fn run<C: CpuContext + ?Sized>(&mut self, cpu: &mut C, limit: u64) -> Result<(u64, ExecutionResult), CpuError> {
        let mut last = ExecutionResult::Okay;
        for count in 0..limit {
            last = self.step(cpu)?;
            if matches!(last, ExecutionResult::Halt | ExecutionResult::Aborted(_)) {
                return Ok((count + 1, last));
            }
        }
        Ok((limit, last))
    }

    /// Deliver #DB after an instruction that started with TF set. The trap returns to the
    /// next instruction, so the fault address is moved up to EIP first.
    fn single_step_trap<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuAbort {
        let regs = cpu.registers_mut();
        regs.current_eip = regs.eip;
        // DR6.BS
        regs.dr[6] |= 1 << 14;
        cpu.raise_exception(Interrupt::Debug, 0)
    }

    fn step_interpreter<C: CpuContext + ?Sized>(cpu: &mut C, rep_mode: RepMode) -> CpuResult<ExecutionResult> {
        let regs = cpu.registers_mut();
        let address = regs.eip;
        regs.current_eip = address;
        let operand_size = regs.code_operand_size();
        let address_size = regs.code_address_size();

        let decoded = {
            let mut queue = ContextQueue::new(cpu);
            let decoded = decode(&mut queue, address_size, operand_size);
            if let Some(abort) = queue.take_abort() {
                return Err(abort);
            }
            decoded
        };

        match decoded {
            Ok(mut instr) => {
                instr.address = address;
                let result = interpreter::execute_instruction(cpu, &instr, rep_mode)?;
                cpu.add_cycles(1);
                Ok(result)
            }
            Err(e) => {
                log::debug!("CpuBackend: decode failed at {:08X}: {}", address, e);
                cpu.registers_mut().eip = address;
                Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0))
            }
        }
    }

    fn step_fast<C: CpuContext + ?Sized>(cpu: &mut C, rep_mode: RepMode) -> CpuResult<ExecutionResult> {
        let result = fast::execute_instruction(cpu, rep_mode)?;
        cpu.add_cycles(1);
        Ok(result)
    }

    /// Blocks are skipped while single-stepping, since the trap has to fire after each
    /// instruction. A block that fails to compile runs through the fast path instead.
    fn step_recompiler<C: CpuContext + ?Sized>(
        &mut self,
        cpu: &mut C,
    ) -> Result<CpuResult<ExecutionResult>, CpuError> {
        if cpu.registers().get_flag(Flag::Trap) {
            return Ok(Self::step_interpreter(cpu, self.rep_mode));
        }
        match self.recompiler.run(cpu, self.rep_mode) {
            Ok(result) => Ok(Ok(result)),
            Err(CpuError::ExceptionError(abort)) => Ok(Err(abort)),
            Err(CpuError::RecompilerError(e)) => {
                log::trace!("CpuBackend: recompiler declined block: {}", e);
                Ok(Self::step_fast(cpu, self.rep_mode))
            }
            Err(e) => Err(e),
        }
    }

    #[cfg(feature = "cpu_trace")]
    fn trace_instruction<C: CpuContext + ?Sized>(&mut self, cpu: &mut C) {
        let regs = cpu.registers();
        let cs = regs.selector(Segment::CS);
        let eip = regs.eip;
        let line = match Self::disassemble(cpu, eip) {
            Ok(instr) => format!("{:04X}:{:08X} {}", cs, eip, instr),
            Err(e) => format!("{:04X}:{:08X} ??? ({})", cs, eip, e),
        };
        self.trace_logger.println(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        coreconfig::CpuConfig,
        cpu_386::{flat::FLAT_REAL_CODE_OFFSET, opcodes::Operation, FlatCpu},
    };

    const PROGRAM: [u8; 11] = [
        0xB8, 0x34, 0x12, // mov ax, 1234h
        0xBB, 0x01, 0x00, // mov bx, 1
        0x01, 0xD8, // add ax, bx
        0x43, // inc bx
        0x90, // nop
        0xF4, // hlt
    ];

    fn run_program(backend: BackendType) -> (FlatCpu, u64) {
        let mut cpu = FlatCpu::real_mode(&PROGRAM);
        let mut backend = CpuBackend::with_backend(backend, RepMode::Batch);
        let (steps, last) = backend.run(&mut cpu, 100).unwrap();
        assert_eq!(last, ExecutionResult::Halt);
        (cpu, steps)
    }

    #[test]
    fn test_backends_agree() {
        let (interp, steps) = run_program(BackendType::Interpreter);
        assert_eq!(steps, 6);
        for backend in [BackendType::FastInterpreter, BackendType::Recompiler] {
            let (cpu, _) = run_program(backend);
            assert_eq!(cpu.regs.get16(Register16::AX), 0x1235);
            assert_eq!(cpu.regs.get16(Register16::BX), 2);
            assert_eq!(cpu.regs.eip, interp.regs.eip);
            assert_eq!(cpu.regs.eflags(), interp.regs.eflags());
            assert!(cpu.halted);
        }
    }

    #[test]
    fn test_recompiler_single_block() {
        let (cpu, steps) = run_program(BackendType::Recompiler);
        assert_eq!(steps, 1);
        assert_eq!(cpu.regs.eip, FLAT_REAL_CODE_OFFSET + PROGRAM.len() as u32);
    }

    #[test]
    fn test_halted_step_is_an_error() {
        let (mut cpu, _) = run_program(BackendType::FastInterpreter);
        let mut backend = CpuBackend::default();
        assert!(matches!(backend.step(&mut cpu), Err(CpuError::CpuHaltedError(_))));

        // A pending interrupt wakes the cpu
        cpu.interrupt_pending = true;
        cpu.regs.set_flag(Flag::Interrupt);
        cpu.load(FLAT_REAL_CODE_OFFSET + PROGRAM.len() as u32, &[0x90]);
        assert_eq!(backend.step(&mut cpu).unwrap(), ExecutionResult::Okay);
        assert!(!cpu.halted);
    }

    #[test]
    fn test_invalid_opcode_is_delivered() {
        for backend in [BackendType::Interpreter, BackendType::FastInterpreter, BackendType::Recompiler] {
            let mut cpu = FlatCpu::real_mode(&[0x0F, 0xFF]);
            cpu.set_interrupt_vector(6, 0, 0x200);
            let mut backend = CpuBackend::with_backend(backend, RepMode::Batch);
            let result = backend.step(&mut cpu).unwrap();
            assert_eq!(
                result,
                ExecutionResult::Aborted(CpuAbort::Exception(Interrupt::InvalidOpcode, 0))
            );
            assert_eq!(cpu.regs.eip, 0x200);
            assert_eq!(cpu.read_physical_u16(0x7FFA), 0x100);
            assert_eq!(backend.instruction_count(), 0);
        }
    }

    #[test]
    fn test_trap_flag_bypasses_recompiler() {
        let mut cpu = FlatCpu::real_mode(&PROGRAM);
        cpu.set_interrupt_vector(1, 0, 0x200);
        cpu.load(0x200, &[0xF4]);
        cpu.regs.set_flag(Flag::Trap);
        let mut backend = CpuBackend::with_backend(BackendType::Recompiler, RepMode::Batch);
        let result = backend.step(&mut cpu).unwrap();
        assert_eq!(result, ExecutionResult::Aborted(CpuAbort::Exception(Interrupt::Debug, 0)));
        assert_eq!(backend.recompiler().block_count(), 0);
        assert_eq!(cpu.regs.get16(Register16::AX), 0x1234);
        assert_eq!(cpu.regs.get16(Register16::BX), 0);
        // The trap returns to the instruction after the traced one
        assert_eq!(cpu.read_physical_u16(0x7FFA), 0x103);
        assert_eq!(cpu.regs.eip, 0x200);
        assert!(!cpu.regs.get_flag(Flag::Trap));
    }

    #[cfg(feature = "cpu_trace")]
    #[test]
    fn test_trace_lines() {
        let mut cpu = FlatCpu::real_mode(&PROGRAM);
        let mut backend = CpuBackend::with_backend(BackendType::Interpreter, RepMode::Batch);
        backend.set_trace_logger(TraceLogger::buffer());
        backend.step(&mut cpu).unwrap();
        backend.step(&mut cpu).unwrap();
        let lines = backend.trace_logger_mut().take_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000:00000100 "));
        assert!(lines[1].starts_with("0000:00000103 "));
    }

    #[test]
    fn test_disassemble() {
        let mut cpu = FlatCpu::real_mode(&PROGRAM);
        let instr = CpuBackend::disassemble(&mut cpu, 0x106).unwrap();
        assert_eq!(instr.operation, Operation::Add);
        assert_eq!(instr.length, 2);
        assert_eq!(cpu.regs.eip, 0x100);

        let mut cpu = FlatCpu::real_mode(&[0x0F, 0xFF]);
        assert!(matches!(
            CpuBackend::disassemble(&mut cpu, 0x100),
            Err(CpuError::InstructionDecodeError { address: 0x100, .. })
        ));
    }

    #[test]
    fn test_new_from_config() {
        let config = CpuConfig::from_toml("[cpu]\nbackend = \"Recompiler\"\nrep_mode = \"Single\"\nmax_block_instructions = 2\n")
            .unwrap();
        let mut backend = CpuBackend::new(&config);
        assert_eq!(backend.backend_type(), BackendType::Recompiler);
        assert_eq!(backend.rep_mode(), RepMode::Single);

        let mut cpu = FlatCpu::real_mode(&PROGRAM);
        backend.step(&mut cpu).unwrap();
        assert_eq!(cpu.regs.eip, 0x106);
        assert_eq!(backend.recompiler().stats().blocks_compiled, 1);
    }
}
