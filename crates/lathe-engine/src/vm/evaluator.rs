//! The stack-machine evaluator.
//!
//! One central dispatch loop over the byte stream. The logical top of the
//! operand stack lives in a register so single-operand instructions never
//! touch the stack vector; a push only happens when a second value is
//! needed, and a pop promotes the stack's top back into the register.
//!
//! Malformed bytecode (truncated immediates, bad function ids, underflow,
//! jumps outside the function) is an internal defect and raises a fatal
//! error; type mismatches in user arithmetic yield `Undef` instead.

use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use super::value::{RangeValue, Value};
use crate::compiler::{
    BuiltinUnary, FunctionEntry, Opcode, Program, VmBinOp, read_imm, read_imm_at,
};

/// A fatal evaluation failure.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    /// Malformed bytecode; an engine defect, not a user error.
    #[error("invalid bytecode: {0}")]
    InvalidBytecode(String),
    /// The supervisor requested termination via the stop flag.
    #[error("evaluator stopped")]
    Stopped,
    /// Echo output could not be written.
    #[error("echo output failed: {0}")]
    Io(String),
}

fn invalid(message: impl Into<String>) -> EvalError {
    EvalError::InvalidBytecode(message.into())
}

/// The bytecode interpreter for one generated program.
pub struct Evaluator<'p> {
    functions: &'p [FunctionEntry],
    globals: Vec<Value>,
    stop: Arc<AtomicBool>,
}

impl<'p> Evaluator<'p> {
    /// Creates an evaluator over `program`, seeding the global slots from
    /// its initial values.
    pub fn new(program: &'p Program) -> Self {
        Self {
            functions: &program.functions,
            globals: program.globals.clone(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle a supervising thread may set to request cooperative
    /// termination; checked once per instruction.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// The current global slot values.
    pub fn globals(&self) -> &[Value] {
        &self.globals
    }

    /// Runs function `id`, writing echo output to `out`, and returns the
    /// value of the outermost `Ret`.
    pub fn eval(&mut self, id: usize, out: &mut dyn Write) -> Result<Value, EvalError> {
        let mut function = self
            .functions
            .get(id)
            .ok_or_else(|| invalid(format!("no function #{id}")))?;
        let mut stack: Vec<Value> = Vec::new();
        let mut sp_stack: Vec<usize> = vec![0];
        let mut return_stack: Vec<usize> = vec![id];
        let mut pc_stack: Vec<usize> = vec![0];
        let mut pc: usize = 0;
        let mut top = Value::Undef;
        let mut notop = true;

        macro_rules! save_top {
            () => {
                if notop {
                    notop = false;
                } else {
                    stack.push(std::mem::replace(&mut top, Value::Undef));
                }
            };
        }
        macro_rules! cur_sp {
            () => {
                *sp_stack
                    .last()
                    .ok_or_else(|| invalid("call stack underflow"))?
            };
        }
        // Strict pop: the current frame must still hold a value below the
        // logical top.
        macro_rules! pop_second {
            () => {{
                if stack.len() <= cur_sp!() {
                    return Err(invalid("operand stack underflow"));
                }
                stack.pop().unwrap_or(Value::Undef)
            }};
        }
        // Lenient promote: refill the top register from the frame, or mark
        // the frame's operand stack empty.
        macro_rules! promote_top {
            () => {
                if stack.len() > cur_sp!() {
                    top = stack.pop().unwrap_or(Value::Undef);
                } else {
                    top = Value::Undef;
                    notop = true;
                }
            };
        }

        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(EvalError::Stopped);
            }
            let code = &function.code;
            let byte = *code.get(pc).ok_or_else(|| invalid("pc out of range"))?;
            let opcode = Opcode::try_from(byte).map_err(|e| invalid(e.to_string()))?;

            match opcode {
                Opcode::GetI => {
                    let (imm, len) = read_imm(code, pc).map_err(|e| invalid(e.to_string()))?;
                    save_top!();
                    let index = frame_index(&sp_stack, &stack, imm)?;
                    top = stack[index].clone();
                    pc += len;
                }
                Opcode::SetI => {
                    let (imm, len) = read_imm(code, pc).map_err(|e| invalid(e.to_string()))?;
                    let index = frame_index(&sp_stack, &stack, imm)?;
                    stack[index] = std::mem::replace(&mut top, Value::Undef);
                    promote_top!();
                    pc += len;
                }
                Opcode::AddI => {
                    let (imm, len) = read_imm(code, pc).map_err(|e| invalid(e.to_string()))?;
                    match &mut top {
                        Value::Number(n) => *n += f64::from(imm),
                        _ => return Err(invalid("AddI on a non-number")),
                    }
                    pc += len;
                }
                Opcode::JumpI => {
                    let (imm, _) = read_imm(code, pc).map_err(|e| invalid(e.to_string()))?;
                    pc = jump_target(code, pc, imm)?;
                }
                Opcode::JumpFalseI => {
                    let (imm, len) = read_imm(code, pc).map_err(|e| invalid(e.to_string()))?;
                    let target = jump_target(code, pc, imm)?;
                    let Value::Boolean(cond) = top else {
                        return Err(invalid("conditional jump on a non-boolean"));
                    };
                    promote_top!();
                    pc = if cond { pc + len } else { target };
                }
                Opcode::Iter => {
                    let (imm, len) = read_imm(code, pc).map_err(|e| invalid(e.to_string()))?;
                    let target = jump_target(code, pc, imm)?;
                    let Value::Number(index) = top else {
                        return Err(invalid("Iter index is not a number"));
                    };
                    let index = index + 1.0;
                    top = Value::Number(index);
                    let element = match stack.last() {
                        Some(Value::Vector(elems)) => {
                            if index >= 0.0 && (index as usize) < elems.len() {
                                Some(elems[index as usize].clone())
                            } else {
                                None
                            }
                        }
                        Some(Value::Range(range)) => {
                            let value = index * range.step + range.begin;
                            if value > range.end || (range.step == 0.0 && index > 0.0) {
                                None
                            } else {
                                Some(Value::Number(value))
                            }
                        }
                        Some(_) => return Err(invalid("Iter on a non-iterable")),
                        None => return Err(invalid("operand stack underflow")),
                    };
                    match element {
                        Some(value) => {
                            save_top!();
                            top = value;
                            pc = target;
                        }
                        None => {
                            drop(pop_second!());
                            promote_top!();
                            pc += len;
                        }
                    }
                }
                Opcode::Pop => {
                    if notop {
                        return Err(invalid("pop from an empty stack"));
                    }
                    drop(std::mem::replace(&mut top, Value::Undef));
                    promote_top!();
                    pc += 1;
                }
                Opcode::Dup => {
                    if notop {
                        notop = false;
                    } else {
                        stack.push(top.clone());
                    }
                    pc += 1;
                }
                Opcode::BuiltinUnaryOp => {
                    let byte = *code
                        .get(pc + 1)
                        .ok_or_else(|| invalid("truncated builtin"))?;
                    let op = BuiltinUnary::try_from(byte).map_err(|e| invalid(e.to_string()))?;
                    top = handle_unary(std::mem::replace(&mut top, Value::Undef), op);
                    pc += 2;
                }
                Opcode::BinaryOp => {
                    let byte = *code
                        .get(pc + 1)
                        .ok_or_else(|| invalid("truncated binary op"))?;
                    let op = VmBinOp::try_from(byte).map_err(|e| invalid(e.to_string()))?;
                    let lhs = pop_second!();
                    top = handle_binary(lhs, std::mem::replace(&mut top, Value::Undef), op);
                    pc += 2;
                }
                Opcode::ConstNum => {
                    let bytes = code
                        .get(pc + 1..pc + 9)
                        .ok_or_else(|| invalid("truncated ConstNum"))?;
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(bytes);
                    save_top!();
                    top = Value::Number(f64::from_ne_bytes(raw));
                    pc += 9;
                }
                Opcode::ConstMisc => {
                    let byte = *code
                        .get(pc + 1)
                        .ok_or_else(|| invalid("truncated ConstMisc"))?;
                    save_top!();
                    top = match byte {
                        0 => Value::Boolean(false),
                        1 => Value::Boolean(true),
                        _ => Value::Undef,
                    };
                    pc += 2;
                }
                Opcode::GetGlobalI => {
                    let (imm, len) = read_imm(code, pc).map_err(|e| invalid(e.to_string()))?;
                    save_top!();
                    top = self
                        .globals
                        .get(usize::try_from(imm).map_err(|_| invalid("bad global index"))?)
                        .ok_or_else(|| invalid("global index out of range"))?
                        .clone();
                    pc += len;
                }
                Opcode::SetGlobalI => {
                    let (imm, len) = read_imm(code, pc).map_err(|e| invalid(e.to_string()))?;
                    let slot = usize::try_from(imm).map_err(|_| invalid("bad global index"))?;
                    if slot >= self.globals.len() {
                        return Err(invalid("global index out of range"));
                    }
                    self.globals[slot] = std::mem::replace(&mut top, Value::Undef);
                    promote_top!();
                    pc += len;
                }
                Opcode::CallI => {
                    let (imm, len) = read_imm(code, pc).map_err(|e| invalid(e.to_string()))?;
                    let callee_id =
                        usize::try_from(imm).map_err(|_| invalid("bad function id"))?;
                    let callee = self
                        .functions
                        .get(callee_id)
                        .ok_or_else(|| invalid("function id out of range"))?;
                    save_top!();
                    let sp = stack
                        .len()
                        .checked_sub(callee.parameters as usize)
                        .ok_or_else(|| invalid("missing call arguments"))?;
                    pc_stack.push(pc + len);
                    return_stack.push(callee_id);
                    sp_stack.push(sp);
                    function = callee;
                    pc = 0;
                    notop = true;
                }
                Opcode::TailCallI => {
                    let (imm, _) = read_imm(code, pc).map_err(|e| invalid(e.to_string()))?;
                    let callee_id =
                        usize::try_from(imm).map_err(|_| invalid("bad function id"))?;
                    let callee = self
                        .functions
                        .get(callee_id)
                        .ok_or_else(|| invalid("function id out of range"))?;
                    save_top!();
                    let sp = *sp_stack
                        .last()
                        .ok_or_else(|| invalid("call stack underflow"))?;
                    let stack_end = stack
                        .len()
                        .checked_sub(callee.parameters as usize)
                        .ok_or_else(|| invalid("missing call arguments"))?;
                    if stack_end < sp {
                        return Err(invalid("tail call below frame base"));
                    }
                    // Drop the old frame and slide the arguments down.
                    stack.drain(sp..stack_end);
                    if let Some(current) = return_stack.last_mut() {
                        *current = callee_id;
                    }
                    function = callee;
                    pc = 0;
                    notop = true;
                }
                Opcode::Ret => {
                    if notop {
                        return Err(invalid("return without a value"));
                    }
                    return_stack.pop();
                    let sp = sp_stack
                        .pop()
                        .ok_or_else(|| invalid("call stack underflow"))?;
                    stack.truncate(sp);
                    if pc_stack.len() == 1 {
                        return Ok(top);
                    }
                    let caller = *return_stack
                        .last()
                        .ok_or_else(|| invalid("call stack underflow"))?;
                    function = self
                        .functions
                        .get(caller)
                        .ok_or_else(|| invalid("function id out of range"))?;
                    pc = pc_stack
                        .pop()
                        .ok_or_else(|| invalid("call stack underflow"))?;
                }
                Opcode::MakeRange => {
                    // Push order is step, start, end; pops run in reverse.
                    let start = pop_second!();
                    let step = pop_second!();
                    let end = std::mem::replace(&mut top, Value::Undef);
                    top = match (start, step, end) {
                        (Value::Number(begin), Value::Number(step), Value::Number(end)) => {
                            Value::Range(Rc::new(RangeValue { begin, step, end }))
                        }
                        _ => Value::Undef,
                    };
                    pc += 1;
                }
                Opcode::MakeList => {
                    save_top!();
                    top = Value::empty_vector();
                    pc += 1;
                }
                Opcode::Echo => {
                    writeln!(out, "{top}").map_err(|e| EvalError::Io(e.to_string()))?;
                    pc += 1;
                }
                Opcode::GetParentI => {
                    let depth = *code
                        .get(pc + 1)
                        .ok_or_else(|| invalid("truncated GetParentI"))?;
                    let (slot, operand_len, _) =
                        read_imm_at(code, pc + 2).map_err(|e| invalid(e.to_string()))?;
                    let frame = sp_stack
                        .len()
                        .checked_sub(1 + depth as usize)
                        .ok_or_else(|| invalid("parent frame out of range"))?;
                    let base = sp_stack[frame];
                    let index = checked_slot(base, slot, stack.len())?;
                    save_top!();
                    top = stack[index].clone();
                    pc += 2 + operand_len;
                }
            }
        }
    }
}

/// Resolves a frame-relative slot against the current frame base.
fn frame_index(sp_stack: &[usize], stack: &[Value], imm: i32) -> Result<usize, EvalError> {
    let sp = *sp_stack
        .last()
        .ok_or_else(|| invalid("call stack underflow"))?;
    checked_slot(sp, imm, stack.len())
}

fn checked_slot(base: usize, slot: i32, len: usize) -> Result<usize, EvalError> {
    let index = base as i64 + i64::from(slot);
    if index < 0 || index >= len as i64 {
        return Err(invalid(format!("slot {slot} outside the frame")));
    }
    Ok(index as usize)
}

/// Validates a relative jump and returns the absolute target.
fn jump_target(code: &[u8], pc: usize, imm: i32) -> Result<usize, EvalError> {
    let target = pc as i64 + i64::from(imm);
    if target < 0 || target >= code.len() as i64 {
        return Err(invalid("jump outside the function"));
    }
    Ok(target as usize)
}

/// Applies a builtin unary operation. Type mismatches yield `Undef`.
fn handle_unary(value: Value, op: BuiltinUnary) -> Value {
    match op {
        BuiltinUnary::Not => {
            return match value {
                Value::Boolean(b) => Value::Boolean(!b),
                _ => Value::Undef,
            };
        }
        BuiltinUnary::Len => {
            return match value {
                Value::Vector(elems) => Value::Number(elems.len() as f64),
                _ => Value::Undef,
            };
        }
        BuiltinUnary::Norm => {
            return match value {
                Value::Vector(elems) => {
                    let mut sum = 0.0;
                    for elem in elems.iter() {
                        match elem {
                            Value::Number(n) => sum += n * n,
                            _ => return Value::Undef,
                        }
                    }
                    Value::Number(sum.sqrt())
                }
                _ => Value::Undef,
            };
        }
        _ => {}
    }

    let Value::Number(n) = value else {
        return Value::Undef;
    };
    let result = match op {
        BuiltinUnary::Neg => -n,
        BuiltinUnary::Sin => n.sin(),
        BuiltinUnary::Cos => n.cos(),
        BuiltinUnary::Tan => n.tan(),
        BuiltinUnary::Asin => n.asin(),
        BuiltinUnary::Acos => n.acos(),
        BuiltinUnary::Atan => n.atan(),
        BuiltinUnary::Abs => n.abs(),
        BuiltinUnary::Ceil => n.ceil(),
        BuiltinUnary::Floor => n.floor(),
        BuiltinUnary::Ln => n.ln(),
        BuiltinUnary::Log => n.log10(),
        BuiltinUnary::Round => n.round(),
        BuiltinUnary::Sign => {
            if n == 0.0 {
                0.0
            } else if n > 0.0 {
                1.0
            } else {
                -1.0
            }
        }
        BuiltinUnary::Sqrt => n.sqrt(),
        // Handled above.
        BuiltinUnary::Not | BuiltinUnary::Len | BuiltinUnary::Norm => return Value::Undef,
    };
    Value::Number(result)
}

/// Applies a binary operation. Type mismatches yield `Undef`, never an
/// error; division and modulo by zero yield NaN.
fn handle_binary(lhs: Value, rhs: Value, op: VmBinOp) -> Value {
    match op {
        VmBinOp::Add | VmBinOp::Sub | VmBinOp::Mul | VmBinOp::Div | VmBinOp::Mod
        | VmBinOp::Exp => {
            let (Value::Number(l), Value::Number(r)) = (lhs, rhs) else {
                return Value::Undef;
            };
            let result = match op {
                VmBinOp::Add => l + r,
                VmBinOp::Sub => l - r,
                VmBinOp::Mul => l * r,
                VmBinOp::Div => {
                    if r.abs() == 0.0 {
                        f64::NAN
                    } else {
                        l / r
                    }
                }
                VmBinOp::Mod => {
                    if r.abs() == 0.0 {
                        f64::NAN
                    } else {
                        l % r
                    }
                }
                _ => l.powf(r),
            };
            Value::Number(result)
        }
        VmBinOp::Lt | VmBinOp::Le | VmBinOp::Gt | VmBinOp::Ge => {
            let (Value::Number(l), Value::Number(r)) = (lhs, rhs) else {
                return Value::Undef;
            };
            let result = match op {
                VmBinOp::Lt => l < r,
                VmBinOp::Le => l <= r,
                VmBinOp::Gt => l > r,
                _ => l >= r,
            };
            Value::Boolean(result)
        }
        VmBinOp::Eq => Value::Boolean(lhs == rhs),
        VmBinOp::Ne => Value::Boolean(lhs != rhs),
        VmBinOp::And | VmBinOp::Or => {
            let (Value::Boolean(l), Value::Boolean(r)) = (lhs, rhs) else {
                return Value::Undef;
            };
            Value::Boolean(if op == VmBinOp::And { l && r } else { l || r })
        }
        VmBinOp::Append => lhs.append(rhs),
        VmBinOp::Concat => lhs.concat(rhs),
        VmBinOp::Index => lhs.index(rhs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{
        add_bin_op, add_const_misc, add_double, add_inst, add_inst_imm, add_unary_op,
    };

    fn program_of(functions: Vec<FunctionEntry>) -> Program {
        Program {
            functions,
            globals: Vec::new(),
            global_names: Vec::new(),
            entry: 0,
            warnings: Vec::new(),
        }
    }

    fn entry(code: Vec<u8>, parameters: u32) -> FunctionEntry {
        FunctionEntry {
            code,
            parameters,
            is_module: false,
        }
    }

    fn eval_entry(program: &Program) -> (Value, String) {
        let mut out = Vec::new();
        let mut evaluator = Evaluator::new(program);
        let value = evaluator.eval(program.entry, &mut out).unwrap();
        (value, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_arithmetic_and_ret() {
        let mut code = Vec::new();
        add_double(&mut code, 2.0);
        add_double(&mut code, 3.0);
        add_bin_op(&mut code, VmBinOp::Add);
        add_inst(&mut code, Opcode::Ret);
        let program = program_of(vec![entry(code, 0)]);
        let (value, _) = eval_entry(&program);
        assert_eq!(value, Value::Number(5.0));
    }

    #[test]
    fn test_division_by_zero_yields_nan() {
        let mut code = Vec::new();
        add_double(&mut code, 1.0);
        add_double(&mut code, 0.0);
        add_bin_op(&mut code, VmBinOp::Div);
        add_inst(&mut code, Opcode::Echo);
        add_inst(&mut code, Opcode::Ret);
        let program = program_of(vec![entry(code, 0)]);
        let (value, output) = eval_entry(&program);
        assert!(matches!(value, Value::Number(n) if n.is_nan()));
        assert_eq!(output, "nan\n");
    }

    #[test]
    fn test_type_mismatch_yields_undef() {
        let mut code = Vec::new();
        add_const_misc(&mut code, 1);
        add_double(&mut code, 3.0);
        add_bin_op(&mut code, VmBinOp::Add);
        add_inst(&mut code, Opcode::Ret);
        let program = program_of(vec![entry(code, 0)]);
        let (value, _) = eval_entry(&program);
        assert_eq!(value, Value::Undef);
    }

    #[test]
    fn test_comparison_on_non_numbers_yields_undef() {
        let mut code = Vec::new();
        add_const_misc(&mut code, 2);
        add_double(&mut code, 3.0);
        add_bin_op(&mut code, VmBinOp::Lt);
        add_inst(&mut code, Opcode::Ret);
        let program = program_of(vec![entry(code, 0)]);
        let (value, _) = eval_entry(&program);
        assert_eq!(value, Value::Undef);
    }

    #[test]
    fn test_call_and_frame_discipline() {
        // add1(x) = x + 1
        let mut add1 = Vec::new();
        add_inst_imm(&mut add1, Opcode::GetI, 0);
        add_double(&mut add1, 1.0);
        add_bin_op(&mut add1, VmBinOp::Add);
        add_inst(&mut add1, Opcode::Ret);

        // entry: 41 + add1(0.5) ... checks caller stack is intact
        let mut code = Vec::new();
        add_double(&mut code, 41.0);
        add_double(&mut code, 0.5);
        add_inst_imm(&mut code, Opcode::CallI, 1);
        add_bin_op(&mut code, VmBinOp::Add);
        add_inst(&mut code, Opcode::Ret);

        let program = program_of(vec![entry(code, 0), entry(add1, 1)]);
        let (value, _) = eval_entry(&program);
        assert_eq!(value, Value::Number(42.5));
    }

    #[test]
    fn test_tail_recursion_does_not_grow_stacks() {
        // f(a, b) = a <= 0 ? b : f(a - 1, b + 2)
        let mut f = Vec::new();
        add_inst_imm(&mut f, Opcode::GetI, 0);
        add_double(&mut f, 0.0);
        add_bin_op(&mut f, VmBinOp::Le);
        // on false, jump over the `Ret b` arm: GetI(2) + Ret(1) = skip 3
        // bytes after this 2-byte instruction
        add_inst_imm(&mut f, Opcode::JumpFalseI, 5);
        add_inst_imm(&mut f, Opcode::GetI, 1);
        add_inst(&mut f, Opcode::Ret);
        add_inst_imm(&mut f, Opcode::GetI, 0);
        add_inst_imm(&mut f, Opcode::AddI, -1);
        add_inst_imm(&mut f, Opcode::GetI, 1);
        add_inst_imm(&mut f, Opcode::AddI, 2);
        add_inst_imm(&mut f, Opcode::TailCallI, 1);

        let mut code = Vec::new();
        add_double(&mut code, 100000.0);
        add_double(&mut code, 0.0);
        add_inst_imm(&mut code, Opcode::CallI, 1);
        add_inst(&mut code, Opcode::Ret);

        let program = program_of(vec![entry(code, 0), entry(f, 2)]);
        let (value, _) = eval_entry(&program);
        assert_eq!(value, Value::Number(200000.0));
    }

    #[test]
    fn test_builtin_unary() {
        let mut code = Vec::new();
        add_double(&mut code, 16.0);
        add_unary_op(&mut code, BuiltinUnary::Sqrt);
        add_inst(&mut code, Opcode::Ret);
        let program = program_of(vec![entry(code, 0)]);
        let (value, _) = eval_entry(&program);
        assert_eq!(value, Value::Number(4.0));
    }

    #[test]
    fn test_echo_prints_one_value_per_line() {
        let mut code = Vec::new();
        add_double(&mut code, 7.0);
        add_inst(&mut code, Opcode::Echo);
        add_inst(&mut code, Opcode::Pop);
        add_const_misc(&mut code, 2);
        add_inst(&mut code, Opcode::Echo);
        add_inst(&mut code, Opcode::Ret);
        let program = program_of(vec![entry(code, 0)]);
        let (_, output) = eval_entry(&program);
        assert_eq!(output, "7\nundef\n");
    }

    #[test]
    fn test_make_range_and_iter() {
        // for (i = [0 : 2 : 6]) echo(i);
        let mut code = Vec::new();
        add_double(&mut code, 2.0); // step
        add_double(&mut code, 0.0); // start
        add_double(&mut code, 6.0); // end
        add_inst(&mut code, Opcode::MakeRange);
        add_double(&mut code, -1.0); // index
        let head = code.len();
        add_inst_imm(&mut code, Opcode::Iter, 4); // -> body at head+4
        add_inst_imm(&mut code, Opcode::JumpI, 6); // at head+2, -> done at head+8
        assert_eq!(code.len(), head + 4);
        add_inst(&mut code, Opcode::Echo);
        add_inst(&mut code, Opcode::Pop);
        add_inst_imm(&mut code, Opcode::JumpI, -6); // at head+6, back to head
        assert_eq!(code.len(), head + 8);
        // done:
        add_const_misc(&mut code, 2);
        add_inst(&mut code, Opcode::Ret);
        let program = program_of(vec![entry(code, 0)]);
        let (_, output) = eval_entry(&program);
        assert_eq!(output, "0\n2\n4\n6\n");
    }

    #[test]
    fn test_zero_step_range_yields_start_once() {
        let mut code = Vec::new();
        add_double(&mut code, 0.0); // step
        add_double(&mut code, 5.0); // start
        add_double(&mut code, 9.0); // end
        add_inst(&mut code, Opcode::MakeRange);
        add_double(&mut code, -1.0);
        let head = code.len();
        add_inst_imm(&mut code, Opcode::Iter, 4);
        add_inst_imm(&mut code, Opcode::JumpI, 6);
        add_inst(&mut code, Opcode::Echo);
        add_inst(&mut code, Opcode::Pop);
        add_inst_imm(&mut code, Opcode::JumpI, -6);
        add_const_misc(&mut code, 2);
        add_inst(&mut code, Opcode::Ret);
        let program = program_of(vec![entry(code, 0)]);
        let (_, output) = eval_entry(&program);
        assert_eq!(output, "5\n");
    }

    #[test]
    fn test_vector_iteration() {
        // iterate [10, 20]: MakeList/Append to build, then Iter
        let mut code = Vec::new();
        add_inst(&mut code, Opcode::MakeList);
        add_double(&mut code, 10.0);
        add_bin_op(&mut code, VmBinOp::Append);
        add_double(&mut code, 20.0);
        add_bin_op(&mut code, VmBinOp::Append);
        add_double(&mut code, -1.0);
        let head = code.len();
        add_inst_imm(&mut code, Opcode::Iter, 4);
        add_inst_imm(&mut code, Opcode::JumpI, 6);
        add_inst(&mut code, Opcode::Echo);
        add_inst(&mut code, Opcode::Pop);
        add_inst_imm(&mut code, Opcode::JumpI, -6);
        add_const_misc(&mut code, 2);
        add_inst(&mut code, Opcode::Ret);
        let program = program_of(vec![entry(code, 0)]);
        let (_, output) = eval_entry(&program);
        assert_eq!(output, "10\n20\n");
    }

    #[test]
    fn test_globals_read_write() {
        let mut code = Vec::new();
        add_double(&mut code, 9.0);
        add_inst(&mut code, Opcode::Dup);
        add_inst_imm(&mut code, Opcode::SetGlobalI, 0);
        add_inst_imm(&mut code, Opcode::GetGlobalI, 0);
        add_bin_op(&mut code, VmBinOp::Mul);
        add_inst(&mut code, Opcode::Ret);
        let mut program = program_of(vec![entry(code, 0)]);
        program.globals.push(Value::Undef);
        program.global_names.push("g".to_string());
        let (value, _) = eval_entry(&program);
        assert_eq!(value, Value::Number(81.0));
    }

    #[test]
    fn test_refcount_conservation_for_globals() {
        let shared = Value::vector(vec![Value::Number(1.0)]);
        let mut code = Vec::new();
        add_inst_imm(&mut code, Opcode::GetGlobalI, 0);
        add_inst(&mut code, Opcode::Pop);
        add_const_misc(&mut code, 2);
        add_inst(&mut code, Opcode::Ret);
        let mut program = program_of(vec![entry(code, 0)]);
        program.globals.push(shared);
        program.global_names.push("v".to_string());

        let mut out = Vec::new();
        let mut evaluator = Evaluator::new(&program);
        evaluator.eval(0, &mut out).unwrap();
        let Value::Vector(rc) = &evaluator.globals()[0] else {
            panic!("global lost its vector");
        };
        // The evaluator's copy is the only live reference besides the
        // program's seed value.
        assert_eq!(Rc::strong_count(rc), 2);
    }

    #[test]
    fn test_invalid_bytecode_is_fatal() {
        let program = program_of(vec![entry(vec![0xEE], 0)]);
        let mut out = Vec::new();
        let mut evaluator = Evaluator::new(&program);
        assert!(matches!(
            evaluator.eval(0, &mut out),
            Err(EvalError::InvalidBytecode(_))
        ));

        // Truncated immediate.
        let program = program_of(vec![entry(vec![Opcode::GetI as u8], 0)]);
        let mut evaluator = Evaluator::new(&program);
        assert!(matches!(
            evaluator.eval(0, &mut out),
            Err(EvalError::InvalidBytecode(_))
        ));

        // Jump outside the function.
        let mut code = Vec::new();
        add_inst_imm(&mut code, Opcode::JumpI, 100);
        let program = program_of(vec![entry(code, 0)]);
        let mut evaluator = Evaluator::new(&program);
        assert!(matches!(
            evaluator.eval(0, &mut out),
            Err(EvalError::InvalidBytecode(_))
        ));
    }

    #[test]
    fn test_stop_flag_halts_evaluation() {
        // An infinite loop: JumpI back to itself.
        let mut code = Vec::new();
        add_inst_imm(&mut code, Opcode::JumpI, 0);
        let program = program_of(vec![entry(code, 0)]);
        let mut evaluator = Evaluator::new(&program);
        evaluator.stop_handle().store(true, Ordering::Relaxed);
        let mut out = Vec::new();
        assert!(matches!(
            evaluator.eval(0, &mut out),
            Err(EvalError::Stopped)
        ));
    }
}
