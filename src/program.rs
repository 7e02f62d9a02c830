//! The assembled program and its execution core
//!
//! `Program` owns the mutable state buffer and shares the immutable code
//! table and const buffer with every fork. `exec` runs one instruction
//! and reports the possible next program counters; `find_cycle` is the
//! speculative search that decides jumps for the emulator.

use std::fmt;
use std::rc::Rc;

use crate::context::{ExecutionContext, VirtualContext};
use crate::memory::{MemoryError, MemoryFormat, signed_bytes_needed};

/// A runtime operand: immediate, state-memory or const-memory reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Im(i128),
    State(i128),
    Const(i128),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Im(v) => write!(f, "{v}"),
            Operand::State(a) => write!(f, "[{a}]"),
            Operand::Const(a) => write!(f, "{{{a}}}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Word,
    Byte,
}

/// Which memory a load addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    State,
    Const,
}

/// Comparison family of the conditional halts; the `u` variants compare
/// unsigned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Ltu,
    Gt,
    Gtu,
    Le,
    Leu,
    Ge,
    Geu,
}

impl CmpOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            CmpOp::Eq => "heq",
            CmpOp::Ne => "hne",
            CmpOp::Lt => "hlt",
            CmpOp::Ltu => "hltu",
            CmpOp::Gt => "hgt",
            CmpOp::Gtu => "hgtu",
            CmpOp::Le => "hle",
            CmpOp::Leu => "hleu",
            CmpOp::Ge => "hge",
            CmpOp::Geu => "hgeu",
        }
    }

    fn signed(self) -> bool {
        !matches!(self, CmpOp::Ltu | CmpOp::Gtu | CmpOp::Leu | CmpOp::Geu)
    }

    fn holds(self, left: i128, right: i128) -> bool {
        match self {
            CmpOp::Eq => left == right,
            CmpOp::Ne => left != right,
            CmpOp::Lt | CmpOp::Ltu => left < right,
            CmpOp::Gt | CmpOp::Gtu => left > right,
            CmpOp::Le | CmpOp::Leu => left <= right,
            CmpOp::Ge | CmpOp::Geu => left >= right,
        }
    }
}

/// Binary arithmetic instructions. Results wrap and are masked to the
/// word width on write, matching arbitrary-precision arithmetic followed
/// by masking for every supported width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Asl,
    Asr,
}

impl BinOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Mod => "mod",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Asl => "asl",
            BinOp::Asr => "asr",
        }
    }

    /// `None` means the destination is left untouched (division or
    /// modulo by zero).
    fn apply(self, left: i128, right: i128, mf: &MemoryFormat) -> Option<i128> {
        match self {
            BinOp::Add => Some(left.wrapping_add(right)),
            BinOp::Sub => Some(left.wrapping_sub(right)),
            BinOp::Mul => Some(left.wrapping_mul(right)),
            BinOp::Div => {
                if right == 0 {
                    return None;
                }
                let q = left.wrapping_div(right);
                let r = left.wrapping_rem(right);
                Some(if r != 0 && (r < 0) != (right < 0) { q - 1 } else { q })
            }
            BinOp::Mod => {
                if right == 0 {
                    return None;
                }
                let r = left.wrapping_rem(right);
                Some(if r != 0 && (r < 0) != (right < 0) { r + right } else { r })
            }
            BinOp::And => Some(left & right),
            BinOp::Or => Some(left | right),
            BinOp::Xor => Some(left ^ right),
            BinOp::Asl => {
                let count = shift_count(right, mf);
                Some(((left as u128) << count) as i128)
            }
            BinOp::Asr => {
                let count = shift_count(right, mf);
                Some(left >> count)
            }
        }
    }
}

// Shift amounts are reduced modulo word_size*8 + 1 before use, so a
// full-width shift is expressible and anything larger wraps around.
fn shift_count(count: i128, mf: &MemoryFormat) -> u32 {
    count.rem_euclid(mf.word_size() as i128 * 8 + 1) as u32
}

/// One code-table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    Halt,
    /// The only two-outcome instruction: either fall through or go to
    /// the target, whichever keeps the program out of a forced halt
    J(Operand),
    Yield(Operand),
    Sleep(Operand),
    /// Halts the program when the comparison holds
    HaltIf {
        cmp: CmpOp,
        left: Operand,
        right: Operand,
    },
    Mov {
        dst: i128,
        src: Operand,
    },
    Load {
        width: Width,
        space: Space,
        dst: i128,
        addr: Operand,
        offset: Option<Operand>,
    },
    Store {
        width: Width,
        base: Operand,
        offset: Option<Operand>,
        src: Operand,
    },
    Binary {
        op: BinOp,
        dst: i128,
        left: Operand,
        right: Operand,
    },
    Flag(String),
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Halt => write!(f, "halt"),
            Instr::J(target) => write!(f, "j {target}"),
            Instr::Yield(arg) => write!(f, "yield {arg}"),
            Instr::Sleep(arg) => write!(f, "sleep {arg}"),
            Instr::HaltIf { cmp, left, right } => {
                write!(f, "{} {left}, {right}", cmp.mnemonic())
            }
            Instr::Mov { dst, src } => write!(f, "mov [{dst}], {src}"),
            Instr::Load {
                width,
                space,
                dst,
                addr,
                offset,
            } => {
                let w = if *width == Width::Word { 'w' } else { 'b' };
                let s = if *space == Space::State { 's' } else { 'c' };
                let o = if offset.is_some() { "o" } else { "" };
                write!(f, "l{w}{s}{o} [{dst}], {addr}")?;
                if let Some(offset) = offset {
                    write!(f, ", {offset}")?;
                }
                Ok(())
            }
            Instr::Store {
                width,
                base,
                offset,
                src,
            } => {
                let w = if *width == Width::Word { 'w' } else { 'b' };
                let o = if offset.is_some() { "o" } else { "" };
                write!(f, "s{w}s{o} {base}, ")?;
                if let Some(offset) = offset {
                    write!(f, "{offset}, ")?;
                }
                write!(f, "{src}")
            }
            Instr::Binary {
                op,
                dst,
                left,
                right,
            } => write!(f, "{} [{dst}], {left}, {right}", op.mnemonic()),
            Instr::Flag(name) => write!(f, "flag {name}"),
        }
    }
}

/// What an executed instruction says about the next program counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Terminal stop
    Halt,
    /// Deterministic next instruction
    Next(i128),
    /// Two possible futures; the emulator decides which one happens
    Branch { cont: i128, jump: i128 },
}

const IMPLICIT_HALT: Instr = Instr::Halt;

/// The immutable, instruction-addressed code section. Indexing out of
/// range in either direction yields an implicit `halt`; the cycle search
/// relies on that to terminate paths that walk past the last
/// instruction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodeTable {
    instrs: Vec<Instr>,
}

impl CodeTable {
    pub fn new(instrs: Vec<Instr>) -> CodeTable {
        CodeTable { instrs }
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn get(&self, addr: i128) -> &Instr {
        if addr < 0 || addr >= self.instrs.len() as i128 {
            return &IMPLICIT_HALT;
        }
        &self.instrs[addr as usize]
    }
}

impl fmt::Display for CodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for instr in &self.instrs {
            writeln!(f, "{instr}")?;
        }
        Ok(())
    }
}

/// A node of the (possibly cyclic) prerecorded branch schedule. Nodes
/// link through arena indices so the list can close on itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleNode {
    pub do_jump: bool,
    pub tail: Option<usize>,
}

/// A branch schedule produced by `find_cycle`: one decision per
/// two-outcome instruction the program is going to hit, known to lead
/// into a halt-free loop
#[derive(Debug, Clone)]
pub struct CycleSchedule {
    nodes: Vec<CycleNode>,
    head: usize,
}

impl CycleSchedule {
    /// The decision for the next branch
    pub fn head(&self) -> CycleNode {
        self.nodes[self.head]
    }

    /// Move past the head decision; `false` once the schedule is used up
    pub fn advance(&mut self) -> bool {
        match self.nodes[self.head].tail {
            Some(tail) => {
                self.head = tail;
                true
            }
            None => false,
        }
    }
}

// Backtracking bookkeeping for one branch along the current search path.
// `upward` is set when taking the jump would move to a strictly earlier
// instruction, regardless of whether it was taken.
#[derive(Debug, Clone, Copy)]
struct JumpFlags {
    follow: bool,
    upward: bool,
}

/// An assembled program: shared read-only code and const data, owned
/// mutable state
#[derive(Debug, Clone)]
pub struct Program {
    pub mf: MemoryFormat,
    pub code: Rc<CodeTable>,
    pub constant: Rc<[u8]>,
    pub state: Vec<u8>,
    pub pc: i128,
}

impl Program {
    pub fn new(mf: MemoryFormat, code: CodeTable, constant: Vec<u8>, state: Vec<u8>) -> Program {
        Program {
            mf,
            code: Rc::new(code),
            constant: constant.into(),
            state,
            pc: 0,
        }
    }

    /// Execute the current instruction, returning the possible
    /// subsequent program counters
    pub fn exec<C: ExecutionContext + ?Sized>(&mut self, ctx: &mut C) -> Result<Step, MemoryError> {
        ctx.before_exec(self);
        let code = Rc::clone(&self.code);
        match code.get(self.pc) {
            Instr::J(target) => {
                return Ok(Step::Branch {
                    cont: self.pc + 1,
                    jump: self.signed(*target)?,
                });
            }
            Instr::Halt => return Ok(Step::Halt),
            Instr::HaltIf { cmp, left, right } => {
                let (left, right) = if cmp.signed() {
                    (self.signed(*left)?, self.signed(*right)?)
                } else {
                    (self.unsigned(*left)?, self.unsigned(*right)?)
                };
                if cmp.holds(left, right) {
                    return Ok(Step::Halt);
                }
            }
            Instr::Yield(arg) => {
                let word = self.bytes(*arg)?;
                ctx.output(&word);
            }
            Instr::Sleep(arg) => {
                let millis = self.unsigned(*arg)?;
                ctx.sleep(millis.clamp(0, u64::MAX as i128) as u64);
            }
            Instr::Mov { dst, src } => {
                let word = self.bytes(*src)?;
                self.mf.write_word(&mut self.state, *dst, &word)?;
            }
            Instr::Load {
                width,
                space,
                dst,
                addr,
                offset,
            } => {
                let mut at = self.unsigned(*addr)?;
                if let Some(offset) = offset {
                    at += self.signed(*offset)?;
                }
                match width {
                    Width::Word => {
                        let mut word = [0u8; 8];
                        let size = self.mf.word_size();
                        word[..size].copy_from_slice(self.mf.read_word(self.space(*space), at)?);
                        self.mf.write_word(&mut self.state, *dst, &word[..size])?;
                    }
                    Width::Byte => {
                        let byte = self.mf.read_byte(self.space(*space), at)?;
                        self.mf.write_int(&mut self.state, *dst, byte as i128)?;
                    }
                }
            }
            Instr::Store {
                width,
                base,
                offset,
                src,
            } => {
                let mut at = self.unsigned(*base)?;
                if let Some(offset) = offset {
                    at += self.signed(*offset)?;
                }
                let value = self.signed(*src)?;
                match width {
                    Width::Word => self.mf.write_int(&mut self.state, at, value)?,
                    Width::Byte => self.mf.write_byte(&mut self.state, at, value)?,
                }
            }
            Instr::Binary {
                op,
                dst,
                left,
                right,
            } => {
                let left = self.signed(*left)?;
                let right = self.signed(*right)?;
                if let Some(value) = op.apply(left, right, &self.mf) {
                    self.mf.write_int(&mut self.state, *dst, value)?;
                }
            }
            Instr::Flag(name) => ctx.on_flag(self, name),
        }

        Ok(Step::Next(self.pc + 1))
    }

    /// Resolve a value specifier as a signed word. Immediates come back
    /// unmasked, exactly as assembled.
    pub fn signed(&self, spec: Operand) -> Result<i128, MemoryError> {
        match spec {
            Operand::Im(value) => Ok(value),
            Operand::State(addr) => self.mf.read_int(&self.state, addr, true),
            Operand::Const(addr) => self.mf.read_int(&self.constant, addr, true),
        }
    }

    /// Resolve a value specifier as an unsigned word; immediates come
    /// back unmasked
    pub fn unsigned(&self, spec: Operand) -> Result<i128, MemoryError> {
        match spec {
            Operand::Im(value) => Ok(value),
            Operand::State(addr) => self.mf.read_int(&self.state, addr, false),
            Operand::Const(addr) => self.mf.read_int(&self.constant, addr, false),
        }
    }

    /// Resolve a value specifier to its word bytes; immediates are
    /// masked to the word width here
    pub fn bytes(&self, spec: Operand) -> Result<Vec<u8>, MemoryError> {
        match spec {
            Operand::Im(value) => Ok(self.mf.int_bytes(value)),
            Operand::State(addr) => Ok(self.mf.read_word(&self.state, addr)?.to_vec()),
            Operand::Const(addr) => Ok(self.mf.read_word(&self.constant, addr)?.to_vec()),
        }
    }

    fn space(&self, space: Space) -> &[u8] {
        match space {
            Space::State => &self.state,
            Space::Const => &self.constant,
        }
    }

    /// Execute until an instruction reports something other than a
    /// deterministic next program counter
    pub fn run_until_branch<C: ExecutionContext + ?Sized>(
        &mut self,
        ctx: &mut C,
    ) -> Result<Step, MemoryError> {
        loop {
            match self.exec(ctx)? {
                Step::Next(pc) => self.pc = pc,
                other => return Ok(other),
            }
        }
    }

    /// Pack `(pc, state)` into a byte string usable as a visited-state
    /// key. The PC takes the minimal number of signed bytes.
    pub fn save(&self) -> Vec<u8> {
        self.save_at(self.pc)
    }

    /// Like `save`, but keyed at a hypothetical program counter without
    /// copying any state
    pub fn save_at(&self, pc: i128) -> Vec<u8> {
        let pc_size = signed_bytes_needed(pc);
        let mut saved = Vec::with_capacity(pc_size + self.state.len());
        saved.extend_from_slice(&pc.to_le_bytes()[..pc_size]);
        saved.extend_from_slice(&self.state);
        saved
    }

    /// Inverse of `save`
    pub fn restore(&mut self, saved: &[u8]) {
        let pc_size = saved.len() - self.state.len();
        let mut pc_bytes = [0u8; 16];
        pc_bytes[..pc_size].copy_from_slice(&saved[..pc_size]);
        if pc_size > 0 && pc_size < 16 && saved[pc_size - 1] & 0x80 != 0 {
            for byte in &mut pc_bytes[pc_size..] {
                *byte = 0xFF;
            }
        }
        self.pc = i128::from_le_bytes(pc_bytes);
        self.state.copy_from_slice(&saved[pc_size..]);
    }

    /// A new instance with copied state; `code` and `constant` stay
    /// shared
    pub fn fork(&self) -> Program {
        self.clone()
    }

    /// A fork positioned at a different program counter
    pub fn fork_at(&self, pc: i128) -> Program {
        let mut forked = self.clone();
        forked.pc = pc;
        forked
    }

    /// Search the program's future from `start_pc` for a loop that can
    /// run forever. On success, return a branch schedule leading into
    /// that loop; the schedule is cyclic in the linked-list sense
    /// precisely when a true infinite loop was found.
    ///
    /// The search is a depth-first exploration of jump decisions over a
    /// forked program. Only upward jumps can close a loop, so repeated
    /// states are tracked for followed upward jumps alone: when the
    /// post-jump save state of an upward jump matches a breadcrumb on
    /// the current path, the loop is closed and the path unwinds into a
    /// schedule. Any fault or halt kills its timeline.
    pub fn find_cycle(&self, start_pc: i128, ctx: &mut VirtualContext) -> Option<CycleSchedule> {
        let mut prog = self.fork_at(start_pc);

        let mut nodes: Vec<CycleNode> = Vec::new();
        // Decisions along the current path of execution
        let mut path: Vec<JumpFlags> = Vec::new();
        // Post-jump save states for every branch along the path
        let mut history: Vec<Vec<u8>> = Vec::new();
        // Save state -> schedule node, for followed upward jumps along
        // the path; LIFO like the path itself
        let mut breadcrumbs: Vec<(Vec<u8>, usize)> = Vec::new();

        let mut decision: Option<usize> = None;

        loop {
            loop {
                let (cont, jump) = match prog.run_until_branch(ctx) {
                    Ok(Step::Branch { cont, jump }) => (cont, jump),
                    // Halted or faulted: abandon this timeline
                    Ok(_) | Err(_) => {
                        decision = None;
                        break;
                    }
                };

                let saved = prog.save_at(jump);
                let mut flags = JumpFlags {
                    follow: false,
                    upward: false,
                };

                // Any loop must contain at least one upward jump, so
                // those are the only states worth checking for repeats.
                if jump < cont {
                    flags.upward = true;
                    if let Some(node) = breadcrumbs
                        .iter()
                        .rev()
                        .find(|(key, _)| *key == saved)
                        .map(|(_, node)| *node)
                    {
                        decision = Some(node);
                        break;
                    }
                }

                history.push(saved);
                path.push(flags);
                prog.pc = cont;
            }

            let mut resumed = false;
            while let Some(prev) = path.pop() {
                if let Some(tail) = decision {
                    // Unwinding a found cycle into the schedule
                    if !prev.follow {
                        history.pop();
                        nodes.push(CycleNode {
                            do_jump: false,
                            tail: Some(tail),
                        });
                        decision = Some(nodes.len() - 1);
                    } else if prev.upward {
                        // Splice: the breadcrumb node becomes the head,
                        // closing the list into a cycle when it is its
                        // own ancestor
                        if let Some((_, crumb)) = breadcrumbs.pop() {
                            nodes[crumb].tail = Some(tail);
                            decision = Some(crumb);
                        }
                    } else {
                        nodes.push(CycleNode {
                            do_jump: true,
                            tail: Some(tail),
                        });
                        decision = Some(nodes.len() - 1);
                    }
                } else if !prev.follow {
                    // This branch still has an untried side
                    path.push(JumpFlags {
                        follow: true,
                        upward: prev.upward,
                    });
                    if let Some(saved) = history.pop() {
                        if prev.upward {
                            nodes.push(CycleNode {
                                do_jump: true,
                                tail: None,
                            });
                            breadcrumbs.push((saved.clone(), nodes.len() - 1));
                        }
                        prog.restore(&saved);
                    }
                    resumed = true;
                    break;
                } else if prev.upward {
                    // Both sides exhausted; drop the stale breadcrumb
                    breadcrumbs.pop();
                }
            }

            if !resumed {
                debug_assert!(history.is_empty());
                debug_assert!(breadcrumbs.is_empty());
                return decision.map(|head| CycleSchedule { nodes, head });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::VirtualContext;

    fn program(word_size: usize, instrs: Vec<Instr>, state: Vec<u8>) -> Program {
        Program::new(MemoryFormat::new(word_size), CodeTable::new(instrs), vec![], state)
    }

    #[test]
    fn test_code_table_out_of_range_is_halt() {
        let table = CodeTable::new(vec![Instr::J(Operand::Im(0))]);
        assert_eq!(table.get(-1), &Instr::Halt);
        assert_eq!(table.get(1), &Instr::Halt);
        assert_eq!(table.get(100), &Instr::Halt);
        assert_eq!(table.get(0), &Instr::J(Operand::Im(0)));
    }

    #[test]
    fn test_save_restore_round_trip() {
        let mut prog = program(2, vec![], vec![1, 2, 3, 4]);
        for pc in [0, 1, 127, 128, -1, -128, -129, 70000] {
            prog.pc = pc;
            prog.state = vec![9, 8, 7, 6];
            let saved = prog.save();
            prog.pc = 42;
            prog.state = vec![0; 4];
            prog.restore(&saved);
            assert_eq!(prog.pc, pc);
            assert_eq!(prog.state, vec![9, 8, 7, 6]);
        }
    }

    #[test]
    fn test_save_at_matches_jump_then_save() {
        let prog = program(2, vec![], vec![5, 5]);
        assert_eq!(prog.save_at(3), prog.fork_at(3).save());
        assert_ne!(prog.save_at(3), prog.save_at(4));
    }

    #[test]
    fn test_fork_is_independent() {
        let mut prog = program(2, vec![], vec![0, 0]);
        let mut forked = prog.fork();
        forked.state[0] = 7;
        assert_eq!(prog.state[0], 0);
        prog.state[1] = 9;
        assert_eq!(forked.state[1], 0);
        assert!(Rc::ptr_eq(&prog.code, &forked.code));
        assert!(Rc::ptr_eq(&prog.constant, &forked.constant));
    }

    fn exec_once(prog: &mut Program) -> Step {
        let mut ctx = VirtualContext::default();
        prog.exec(&mut ctx).unwrap()
    }

    #[test]
    fn test_arithmetic_masks_to_word() {
        let mut prog = program(
            2,
            vec![Instr::Binary {
                op: BinOp::Add,
                dst: 0,
                left: Operand::Im(0xFFFF),
                right: Operand::Im(1),
            }],
            vec![0xAA, 0xAA],
        );
        assert_eq!(exec_once(&mut prog), Step::Next(1));
        assert_eq!(prog.state, vec![0, 0]);
    }

    #[test]
    fn test_division_is_floor_and_by_zero_is_noop() {
        let mut prog = program(
            2,
            vec![
                Instr::Binary {
                    op: BinOp::Div,
                    dst: 0,
                    left: Operand::Im(-7),
                    right: Operand::Im(2),
                },
                Instr::Binary {
                    op: BinOp::Div,
                    dst: 0,
                    left: Operand::Im(1),
                    right: Operand::Im(0),
                },
                Instr::Binary {
                    op: BinOp::Mod,
                    dst: 0,
                    left: Operand::Im(-7),
                    right: Operand::Im(2),
                },
            ],
            vec![0, 0],
        );
        exec_once(&mut prog);
        assert_eq!(prog.signed(Operand::State(0)).unwrap(), -4);
        prog.pc = 1;
        exec_once(&mut prog);
        assert_eq!(prog.signed(Operand::State(0)).unwrap(), -4);
        prog.pc = 2;
        exec_once(&mut prog);
        assert_eq!(prog.signed(Operand::State(0)).unwrap(), 1);
    }

    #[test]
    fn test_shift_count_wraps_at_word_width() {
        // Shift counts reduce modulo word_size*8 + 1 = 17
        let mut prog = program(
            2,
            vec![
                Instr::Binary {
                    op: BinOp::Asl,
                    dst: 0,
                    left: Operand::Im(1),
                    right: Operand::Im(17),
                },
                Instr::Binary {
                    op: BinOp::Asl,
                    dst: 0,
                    left: Operand::Im(1),
                    right: Operand::Im(16),
                },
                Instr::Binary {
                    op: BinOp::Asr,
                    dst: 0,
                    left: Operand::Im(-2),
                    right: Operand::Im(1),
                },
            ],
            vec![0xFF, 0xFF],
        );
        exec_once(&mut prog);
        assert_eq!(prog.unsigned(Operand::State(0)).unwrap(), 1);
        prog.pc = 1;
        exec_once(&mut prog);
        assert_eq!(prog.unsigned(Operand::State(0)).unwrap(), 0);
        prog.pc = 2;
        exec_once(&mut prog);
        assert_eq!(prog.signed(Operand::State(0)).unwrap(), -1);
    }

    #[test]
    fn test_conditional_halt_is_terminal_when_it_fires() {
        let mut prog = program(
            2,
            vec![Instr::HaltIf {
                cmp: CmpOp::Ge,
                left: Operand::Im(3),
                right: Operand::Im(0),
            }],
            vec![],
        );
        assert_eq!(exec_once(&mut prog), Step::Halt);

        let mut prog = program(
            2,
            vec![Instr::HaltIf {
                cmp: CmpOp::Ge,
                left: Operand::Im(-1),
                right: Operand::Im(0),
            }],
            vec![],
        );
        assert_eq!(exec_once(&mut prog), Step::Next(1));
    }

    #[test]
    fn test_unsigned_comparison() {
        // [0] holds 0xFFFF: -1 signed, 65535 unsigned
        let state = vec![0xFF, 0xFF];
        let mut prog = program(
            2,
            vec![Instr::HaltIf {
                cmp: CmpOp::Lt,
                left: Operand::State(0),
                right: Operand::Im(0),
            }],
            state.clone(),
        );
        assert_eq!(exec_once(&mut prog), Step::Halt);

        let mut prog = program(
            2,
            vec![Instr::HaltIf {
                cmp: CmpOp::Ltu,
                left: Operand::State(0),
                right: Operand::Im(0),
            }],
            state,
        );
        assert_eq!(exec_once(&mut prog), Step::Next(1));
    }

    #[test]
    fn test_memory_fault_is_fatal() {
        let mut prog = program(
            2,
            vec![Instr::Mov {
                dst: 100,
                src: Operand::Im(1),
            }],
            vec![0, 0],
        );
        let mut ctx = VirtualContext::default();
        assert!(prog.exec(&mut ctx).is_err());
    }

    #[test]
    fn test_find_cycle_on_self_loop() {
        // loop: j loop
        let prog = program(2, vec![Instr::J(Operand::Im(0))], vec![]);
        let mut ctx = VirtualContext::default();
        let mut schedule = prog.find_cycle(0, &mut ctx).unwrap();

        // A self-loop schedule jumps forever
        for _ in 0..16 {
            assert!(schedule.head().do_jump);
            assert!(schedule.advance());
        }
    }

    #[test]
    fn test_find_cycle_none_when_everything_halts() {
        let prog = program(
            2,
            vec![Instr::Yield(Operand::Im(1)), Instr::Halt],
            vec![],
        );
        let mut ctx = VirtualContext::default();
        assert!(prog.find_cycle(0, &mut ctx).is_none());
    }

    #[test]
    fn test_find_cycle_prunes_faulting_timelines() {
        // The fall-through faults, the jump target loops
        let prog = program(
            2,
            vec![
                Instr::J(Operand::Im(0)),
                Instr::Mov {
                    dst: 100,
                    src: Operand::Im(1),
                },
            ],
            vec![0, 0],
        );
        let mut ctx = VirtualContext::default();
        // From pc 1 the only future is the fault: no cycle there
        assert!(prog.find_cycle(1, &mut ctx).is_none());
        // From pc 0 the self-loop is found even though one timeline
        // faults along the way
        assert!(prog.find_cycle(0, &mut ctx).is_some());
    }

    #[test]
    fn test_find_cycle_counts_virtual_time() {
        let prog = program(2, vec![Instr::J(Operand::Im(0))], vec![]);
        let mut ctx = VirtualContext::default();
        prog.find_cycle(0, &mut ctx);
        assert!(ctx.total_time() > 0);
    }

    #[test]
    fn test_schedule_against_virtual_fork_never_halts() {
        // A two-instruction loop: 0: j 0 is entered via fall-through
        // after the search walks past the halt branch decision
        let prog = program(
            2,
            vec![
                Instr::Yield(Operand::Im(7)),
                Instr::J(Operand::Im(0)),
            ],
            vec![],
        );
        let mut ctx = VirtualContext::default();
        let mut schedule = prog.find_cycle(0, &mut ctx).unwrap();

        let mut forked = prog.fork_at(0);
        let mut seen = Vec::new();
        for _ in 0..32 {
            match forked.run_until_branch(&mut ctx).unwrap() {
                Step::Branch { cont, jump } => {
                    let node = schedule.head();
                    schedule.advance();
                    forked.pc = if node.do_jump { jump } else { cont };
                    seen.push(forked.save());
                }
                other => panic!("schedule led to {other:?}"),
            }
        }
        // The same (pc, state) pair comes back around periodically
        assert!(seen[1..].contains(&seen[0]));
    }

    #[test]
    fn test_code_table_display() {
        let table = CodeTable::new(vec![
            Instr::Yield(Operand::State(4)),
            Instr::Binary {
                op: BinOp::Sub,
                dst: 4,
                left: Operand::State(4),
                right: Operand::Im(1),
            },
            Instr::Load {
                width: Width::Word,
                space: Space::Const,
                dst: 0,
                addr: Operand::Im(2),
                offset: Some(Operand::Im(-1)),
            },
            Instr::Flag("done".to_string()),
            Instr::Halt,
        ]);
        assert_eq!(
            table.to_string(),
            "yield [4]\nsub [4], [4], 1\nlwco [0], 2, -1\nflag done\nhalt\n"
        );
    }
}
