//! The step loop that drives a program to completion
//!
//! Deterministic instructions just advance the program counter. A
//! two-outcome instruction is resolved from the prerecorded branch
//! schedule when one is active; otherwise the cycle search runs on the
//! fall-through future, and the jump is taken only when that future
//! provably halts.

use crate::context::ExecutionContext;
use crate::memory::MemoryError;
use crate::program::{CycleSchedule, Program, Step};

pub struct Emulator<C: ExecutionContext> {
    pub prog: Program,
    pub ctx: C,
    schedule: Option<CycleSchedule>,
}

impl<C: ExecutionContext> Emulator<C> {
    pub fn new(prog: Program, ctx: C) -> Emulator<C> {
        Emulator {
            prog,
            ctx,
            schedule: None,
        }
    }

    /// Execute one instruction; `false` once the program has halted
    pub fn step(&mut self) -> Result<bool, MemoryError> {
        match self.prog.exec(&mut self.ctx)? {
            Step::Next(pc) => self.prog.pc = pc,
            Step::Branch { cont, jump } => {
                if let Some(schedule) = self.schedule.as_mut() {
                    let do_jump = schedule.head().do_jump;
                    if !schedule.advance() {
                        self.schedule = None;
                    }
                    self.prog.pc = if do_jump { jump } else { cont };
                } else {
                    self.schedule = self.prog.find_cycle(cont, self.ctx.virtualize());
                    self.prog.pc = if self.schedule.is_some() { cont } else { jump };
                }
            }
            Step::Halt => {
                debug_assert!(self.schedule.is_none());
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn run(&mut self) -> Result<(), MemoryError> {
        while self.step()? {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::VirtualContext;
    use crate::memory::MemoryFormat;
    use crate::parser::Parser;
    use crate::program::{CodeTable, Instr, Operand};

    /// Records outputs, flags and sleeps so tests can observe a run
    struct RecorderContext {
        total_time: u64,
        vctx: VirtualContext,
        flags: Vec<String>,
        bytes: Vec<u8>,
        time_slept: u64,
    }

    impl RecorderContext {
        fn new() -> RecorderContext {
            RecorderContext {
                total_time: 0,
                vctx: VirtualContext::default(),
                flags: Vec::new(),
                bytes: Vec::new(),
                time_slept: 0,
            }
        }
    }

    impl ExecutionContext for RecorderContext {
        fn before_exec(&mut self, _prog: &Program) {
            self.total_time += 1;
        }

        fn output(&mut self, word: &[u8]) {
            self.bytes.extend(&word[..1]);
        }

        fn sleep(&mut self, millis: u64) {
            self.time_slept += millis;
        }

        fn on_flag(&mut self, _prog: &Program, flag: &str) {
            self.flags.push(flag.to_string());
        }

        fn virtualize(&mut self) -> &mut VirtualContext {
            &mut self.vctx
        }

        fn total_time(&self) -> u64 {
            self.total_time
        }
    }

    fn make_emulator(src: &str, args: &[&str]) -> Emulator<RecorderContext> {
        let mut parser = Parser::new(args.iter().map(|a| a.to_string()).collect());
        let lines: Vec<Vec<u8>> = src.lines().map(|l| l.as_bytes().to_vec()).collect();
        parser.parse_lines(&lines, "<test>").unwrap();
        Emulator::new(parser.get_program(false).unwrap(), RecorderContext::new())
    }

    /// Step until a new flag shows up, then hand back the output bytes
    fn run_to_flag(emulator: &mut Emulator<RecorderContext>, expected_flag: &str) -> Vec<u8> {
        let initial_flags = emulator.ctx.flags.len();
        for _ in 0..100_000 {
            if emulator.ctx.flags.len() != initial_flags {
                assert_eq!(emulator.ctx.flags[initial_flags], expected_flag);
                return emulator.ctx.bytes.clone();
            }
            assert!(emulator.step().unwrap(), "program halted");
        }
        panic!("max cycles exceeded");
    }

    #[test]
    fn test_count() {
        let mut emulator = make_emulator(
            "%argv <count>\n\
             %section state\n\
             counter: .arg count word\n\
             %section code\n\
             loop:\n\
                 yield [counter]\n\
                 sub [counter], [counter], 1\n\
             j loop\n\
             hge [counter], 0\n\
             \n\
             flag done\n\
             tnt: j tnt\n\
             halt\n",
            &["3"],
        );

        assert_eq!(run_to_flag(&mut emulator, "done"), vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_jump_taken_when_fall_through_halts() {
        // The fall-through after the jump halts immediately, so the
        // jump must be taken
        let mut emulator = make_emulator(
            "j skip\n\
             halt\n\
             skip:\n\
             flag win\n\
             loop: j loop\n",
            &[],
        );
        run_to_flag(&mut emulator, "win");
    }

    #[test]
    fn test_self_loop_runs_indefinitely() {
        let mut emulator = make_emulator("loop: j loop\n", &[]);
        for _ in 0..64 {
            assert!(emulator.step().unwrap());
        }
        // Falling through would halt, so the jump is re-decided every
        // time around: one speculative instruction per real one
        assert_eq!(emulator.ctx.vctx.total_time(), emulator.ctx.total_time());
    }

    #[test]
    fn test_straight_line_program_halts() {
        let mut emulator = make_emulator(
            "yield 1\n\
             yield 2\n\
             halt\n",
            &[],
        );
        emulator.run().unwrap();
        assert_eq!(emulator.ctx.bytes, vec![1, 2]);
        // No branches, no speculation
        assert_eq!(emulator.ctx.vctx.total_time(), 0);
    }

    #[test]
    fn test_sleep_is_recorded() {
        let mut emulator = make_emulator("sleep 25\nhalt\n", &[]);
        emulator.run().unwrap();
        assert_eq!(emulator.ctx.time_slept, 25);
    }

    #[test]
    fn test_out_of_bounds_is_fatal_to_the_run() {
        let prog = Program::new(
            MemoryFormat::default(),
            CodeTable::new(vec![Instr::Mov {
                dst: 0,
                src: Operand::Im(1),
            }]),
            vec![],
            vec![],
        );
        let mut emulator = Emulator::new(prog, RecorderContext::new());
        assert!(emulator.run().is_err());
    }

    #[test]
    fn test_conditional_halt_ends_the_run() {
        let mut emulator = make_emulator(
            "yield 9\n\
             heq 1, 1\n\
             yield 10\n\
             halt\n",
            &[],
        );
        emulator.run().unwrap();
        assert_eq!(emulator.ctx.bytes, vec![9]);
    }
}
