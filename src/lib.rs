//! An assembler and emulator for the Sphinx virtual machine, featuring:
//! - a line-based assembler with lazily resolved labels
//! - a word-oriented bytecode program model
//! - an emulator whose jumps are decided by speculatively searching the
//!   program's future for cycles

pub mod context;
pub mod directives;
pub mod emulator;
pub mod errors;
pub mod expressions;
pub mod memory;
pub mod parser;
pub mod program;
