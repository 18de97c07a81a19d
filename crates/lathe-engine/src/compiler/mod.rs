//! Bytecode compilation: instruction set, encoder and the generator.

pub mod codegen;
mod instructions;

pub use codegen::{GenError, Generator};
pub use instructions::{
    BuiltinUnary, BytecodeError, DecodedInst, Opcode, Operand, VmBinOp, WIDE_IMM, add_bin_op,
    add_const_misc, add_double, add_get_parent, add_imm, add_inst, add_inst_imm, add_unary_op,
    assemble, decode, disassemble, listing, read_imm, read_imm_at,
};

use crate::diag::Warning;
use crate::vm::Value;

/// One compiled function, module body or children block.
#[derive(Debug, Clone, Default)]
pub struct FunctionEntry {
    /// Linearised bytecode.
    pub code: Vec<u8>,
    /// Number of parameters; also the first locals of the frame.
    pub parameters: u32,
    /// True for module-shaped entries (module declarations, children
    /// blocks, unit init entries).
    pub is_module: bool,
}

/// A complete generated program: the VM's function table plus the global
/// slot table.
#[derive(Debug, Default)]
pub struct Program {
    /// Indexed function table; ids in bytecode point here.
    pub functions: Vec<FunctionEntry>,
    /// Initial global slot values (undef, except interned strings).
    pub globals: Vec<Value>,
    /// Human-readable name per global slot, for listings.
    pub global_names: Vec<String>,
    /// Id of the root unit's entry function.
    pub entry: usize,
    /// Non-fatal diagnostics recorded during generation.
    pub warnings: Vec<Warning>,
}

impl Program {
    /// Renders a labelled listing of every function, for `--disasm` and
    /// tests.
    pub fn listing(&self) -> Result<String, BytecodeError> {
        use std::fmt::Write;

        let mut out = String::new();
        for (id, function) in self.functions.iter().enumerate() {
            let kind = if function.is_module { "module" } else { "function" };
            let entry = if id == self.entry { "  (entry)" } else { "" };
            let _ = writeln!(
                out,
                "{kind} #{id} params={}{entry}",
                function.parameters
            );
            out.push_str(&listing(&function.code)?);
            out.push('\n');
        }
        if !self.globals.is_empty() {
            out.push_str("globals:\n");
            for (slot, name) in self.global_names.iter().enumerate() {
                let _ = writeln!(out, "  [{slot}] {name} = {}", self.globals[slot]);
            }
        }
        Ok(out)
    }
}
