//! Output and flag sinks driven by the emulator
//!
//! Contexts come in two kinds. Real contexts print yielded words and
//! flag reports; the virtual context swallows everything but still
//! counts cycles, which is what makes it safe to hand to the
//! speculative search. Every real context carries a virtual twin so the
//! pair can report emulator efficiency (real cycles against everything
//! spent including speculation).

use std::fmt;
use std::io::{self, Write as _};
use std::thread;
use std::time::Duration;

use crate::program::Program;

pub trait ExecutionContext {
    /// Called exactly once right before any instruction is executed,
    /// speculative execution included
    fn before_exec(&mut self, prog: &Program);

    /// Receive the word bytes of a `yield`
    fn output(&mut self, word: &[u8]);

    /// Elapse wall time; a no-op on virtual contexts
    fn sleep(&mut self, millis: u64);

    /// Receive a `flag` signal
    fn on_flag(&mut self, prog: &Program, flag: &str);

    /// The companion side-effect-free context used for speculation
    fn virtualize(&mut self) -> &mut VirtualContext;

    /// Executed instructions so far
    fn total_time(&self) -> u64;
}

impl<C: ExecutionContext + ?Sized> ExecutionContext for Box<C> {
    fn before_exec(&mut self, prog: &Program) {
        (**self).before_exec(prog)
    }

    fn output(&mut self, word: &[u8]) {
        (**self).output(word)
    }

    fn sleep(&mut self, millis: u64) {
        (**self).sleep(millis)
    }

    fn on_flag(&mut self, prog: &Program, flag: &str) {
        (**self).on_flag(prog, flag)
    }

    fn virtualize(&mut self) -> &mut VirtualContext {
        (**self).virtualize()
    }

    fn total_time(&self) -> u64 {
        (**self).total_time()
    }
}

/// Counts cycles and nothing else; `virtualize` returns itself
#[derive(Debug, Default)]
pub struct VirtualContext {
    total_time: u64,
}

impl ExecutionContext for VirtualContext {
    fn before_exec(&mut self, _prog: &Program) {
        self.total_time += 1;
    }

    fn output(&mut self, _word: &[u8]) {}

    fn sleep(&mut self, _millis: u64) {}

    fn on_flag(&mut self, _prog: &Program, _flag: &str) {}

    fn virtualize(&mut self) -> &mut VirtualContext {
        self
    }

    fn total_time(&self) -> u64 {
        self.total_time
    }
}

/// The behavior all real contexts share: cycle counting, a virtual
/// twin, sleeping, and flag reporting on stderr
#[derive(Debug, Default)]
struct RealCore {
    total_time: u64,
    vctx: VirtualContext,
    last_progress: Option<u64>,
}

impl RealCore {
    fn tick(&mut self) {
        self.total_time += 1;
    }

    fn sleep(&self, millis: u64) {
        thread::sleep(Duration::from_millis(millis));
    }

    fn on_flag(&mut self, prog: &Program, flag: &str) {
        eprintln!("Reached {flag} flag");
        match flag {
            "done" | "error" | "win" | "lose" => {
                eprintln!("    CPU time: {} clock cycles", self.total_time);
                let emulation_time = self.vctx.total_time() + self.total_time;
                let efficiency = self.total_time as f64 / emulation_time as f64;
                eprintln!("    Emulator efficiency: {:.2}%", efficiency * 100.0);
            }
            "progress" => {
                let mut message = format!("    CPU time: {} clock cycles", self.total_time);
                if let Some(last) = self.last_progress {
                    message += &format!(" ({} since last progress)", self.total_time - last);
                }
                self.last_progress = Some(self.total_time);
                eprintln!("{message}");
            }
            "debug" => {
                eprintln!("    PC: {}", prog.pc);
                eprintln!("    State: {}", state_hex(&prog.state, prog.mf.word_size()));
            }
            _ => {}
        }
    }
}

fn state_hex(state: &[u8], word_size: usize) -> String {
    state
        .chunks(word_size)
        .map(|word| word.iter().map(|b| format!("{b:02x}")).collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Prints each yielded word as a decoded integer, one per line
#[derive(Debug)]
pub struct IntOutputContext {
    core: RealCore,
    signed: bool,
}

impl IntOutputContext {
    pub fn new(signed: bool) -> IntOutputContext {
        IntOutputContext {
            core: RealCore::default(),
            signed,
        }
    }
}

impl ExecutionContext for IntOutputContext {
    fn before_exec(&mut self, _prog: &Program) {
        self.core.tick();
    }

    fn output(&mut self, word: &[u8]) {
        println!("{}", crate::memory::int_from_le_bytes(word, self.signed));
    }

    fn sleep(&mut self, millis: u64) {
        self.core.sleep(millis);
    }

    fn on_flag(&mut self, prog: &Program, flag: &str) {
        self.core.on_flag(prog, flag);
    }

    fn virtualize(&mut self) -> &mut VirtualContext {
        &mut self.core.vctx
    }

    fn total_time(&self) -> u64 {
        self.core.total_time
    }
}

/// Writes the low byte of each yielded word straight to stdout
#[derive(Debug)]
pub struct ByteOutputContext {
    core: RealCore,
    last_byte: u8,
}

impl ByteOutputContext {
    pub fn new() -> ByteOutputContext {
        ByteOutputContext {
            core: RealCore::default(),
            last_byte: b'\n',
        }
    }
}

impl Default for ByteOutputContext {
    fn default() -> ByteOutputContext {
        ByteOutputContext::new()
    }
}

impl ExecutionContext for ByteOutputContext {
    fn before_exec(&mut self, _prog: &Program) {
        self.core.tick();
    }

    fn output(&mut self, word: &[u8]) {
        let low_byte = word.first().copied().unwrap_or(0);
        let mut stdout = io::stdout();
        stdout.write_all(&[low_byte]).ok();
        if low_byte == b'\n' {
            stdout.flush().ok();
        }
        self.last_byte = low_byte;
    }

    fn sleep(&mut self, millis: u64) {
        self.core.sleep(millis);
    }

    fn on_flag(&mut self, prog: &Program, flag: &str) {
        // Flag reports must not glue to buffered program output
        if self.last_byte != b'\n' {
            io::stdout().flush().ok();
            eprintln!();
            self.last_byte = b'\n';
        }
        self.core.on_flag(prog, flag);
    }

    fn virtualize(&mut self) -> &mut VirtualContext {
        &mut self.core.vctx
    }

    fn total_time(&self) -> u64 {
        self.core.total_time
    }
}

/// The output context registry selected by `%format output`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Byte,
    Signed,
    Unsigned,
}

/// Valid names for `%format output`, in the order error messages list
/// them
pub const OUTPUT_NAMES: &[&str] = &["byte", "signed", "unsigned"];

impl OutputKind {
    pub fn from_name(name: &str) -> Option<OutputKind> {
        match name {
            "byte" => Some(OutputKind::Byte),
            "signed" => Some(OutputKind::Signed),
            "unsigned" => Some(OutputKind::Unsigned),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OutputKind::Byte => "byte",
            OutputKind::Signed => "signed",
            OutputKind::Unsigned => "unsigned",
        }
    }

    pub fn context(self) -> Box<dyn ExecutionContext> {
        match self {
            OutputKind::Byte => Box::new(ByteOutputContext::new()),
            OutputKind::Signed => Box::new(IntOutputContext::new(true)),
            OutputKind::Unsigned => Box::new(IntOutputContext::new(false)),
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_context_counts_and_virtualizes_to_itself() {
        let prog = Program::new(
            crate::memory::MemoryFormat::default(),
            crate::program::CodeTable::default(),
            vec![],
            vec![],
        );
        let mut ctx = VirtualContext::default();
        ctx.before_exec(&prog);
        ctx.before_exec(&prog);
        ctx.output(&[1, 2]);
        ctx.sleep(10_000);
        assert_eq!(ctx.total_time(), 2);
        assert_eq!(ctx.virtualize().total_time(), 2);
    }

    #[test]
    fn test_output_kind_registry() {
        assert_eq!(OutputKind::from_name("byte"), Some(OutputKind::Byte));
        assert_eq!(OutputKind::from_name("signed"), Some(OutputKind::Signed));
        assert_eq!(OutputKind::from_name("unsigned"), Some(OutputKind::Unsigned));
        assert_eq!(OutputKind::from_name("BYTE"), None);
        assert_eq!(OutputKind::from_name("bytes"), None);
        assert_eq!(OutputKind::Unsigned.to_string(), "unsigned");
    }

    #[test]
    fn test_state_hex_groups_by_word() {
        assert_eq!(state_hex(&[0xAB, 0x01, 0x00, 0xFF], 2), "ab01 00ff");
        assert_eq!(state_hex(&[0xAB], 2), "ab");
    }
}
