//! Generator tests: bytecode shape and end-to-end behaviour of the
//! compiled output.

use super::*;
use crate::compiler::{Opcode, assemble, disassemble};
use crate::frontend::{Frontend, MemorySources};
use crate::transform::ConstEvaluator;
use crate::vm::Evaluator;

fn generate_from(files: &[(&str, &str)], root_name: &str) -> Result<Program, GenError> {
    let mut sources = MemorySources::new();
    let mut root = 0;
    for (name, text) in files {
        let handle = sources.add(*name, *text);
        if *name == root_name {
            root = handle;
        }
    }
    let mut frontend = Frontend::new(sources);
    frontend.parse(root).expect("parse failed");
    ConstEvaluator::transform_units(frontend.units_mut());
    Generator::generate(frontend.units(), root)
}

fn generate(source: &str) -> Program {
    generate_from(&[("root", source)], "root").expect("generation failed")
}

fn run(program: &Program) -> String {
    let mut out = Vec::new();
    let mut evaluator = Evaluator::new(program);
    evaluator
        .eval(program.entry, &mut out)
        .expect("evaluation failed");
    String::from_utf8(out).expect("echo output was not UTF-8")
}

fn run_source(source: &str) -> String {
    run(&generate(source))
}

fn opcodes(function: &FunctionEntry) -> Vec<Opcode> {
    disassemble(&function.code)
        .expect("disassembly failed")
        .into_iter()
        .map(|(_, inst)| inst.opcode)
        .collect()
}

#[test]
fn test_constant_folded_echo() {
    assert_eq!(run_source("echo(1 + 2 * 3);"), "7\n");
}

#[test]
fn test_folded_conditional_has_no_jump() {
    let program = generate("echo(1 == 1 ? 10 : 20);");
    let entry_ops = opcodes(&program.functions[program.entry]);
    assert!(!entry_ops.contains(&Opcode::JumpFalseI));
    assert_eq!(run(&program), "10\n");
}

#[test]
fn test_runtime_conditional_uses_jump() {
    let program = generate("v = [1]; echo(v[0] == 1 ? 10 : 20);");
    let entry_ops = opcodes(&program.functions[program.entry]);
    assert!(entry_ops.contains(&Opcode::JumpFalseI));
    assert_eq!(run(&program), "10\n");
}

#[test]
fn test_division_by_zero_echoes_nan() {
    assert_eq!(run_source("echo(1 / 0);"), "nan\n");
}

#[test]
fn test_tail_recursive_function() {
    let program =
        generate("function f(a, b) = a <= 0 ? b : f(a - 1, b + 2);\necho(f(100000, 0));");
    // The function is compiled first, so it is entry #0.
    let f_ops = opcodes(&program.functions[0]);
    assert!(f_ops.contains(&Opcode::TailCallI));
    assert!(!f_ops.contains(&Opcode::CallI));
    assert_eq!(run(&program), "200000\n");
}

#[test]
fn test_non_tail_call_uses_call() {
    let program = generate("function g(x) = x + 1;\nfunction h(x) = g(x) * 2;\necho(h(3));");
    let h_ops = opcodes(&program.functions[1]);
    assert!(h_ops.contains(&Opcode::CallI));
    assert_eq!(run(&program), "8\n");
}

#[test]
fn test_undefined_variable_warns_and_pushes_undef() {
    let program = generate("echo(x);");
    assert!(
        program
            .warnings
            .iter()
            .any(|w| w.message == "undefined variable")
    );
    assert_eq!(run(&program), "undef\n");
}

#[test]
fn test_string_literals_are_interned() {
    let program = generate("echo(\"hi\"); echo(\"hi\"); echo(\"ho\");");
    let strings = program
        .globals
        .iter()
        .filter(|g| matches!(g, crate::vm::Value::Str(_)))
        .count();
    assert_eq!(strings, 2);
    assert_eq!(run(&program), "hi\nhi\nho\n");
}

#[test]
fn test_file_scope_assignment_uses_globals() {
    let program = generate("x = 2; echo(x + 1);");
    let entry_ops = opcodes(&program.functions[program.entry]);
    assert!(entry_ops.contains(&Opcode::SetGlobalI));
    assert_eq!(run(&program), "3\n");
}

#[test]
fn test_config_variable_shared_across_units() {
    let program = generate_from(
        &[
            ("root", "use<lib>\n$fn = 12;\necho(f());"),
            ("lib", "function f() = $fn;"),
        ],
        "root",
    )
    .expect("generation failed");
    assert_eq!(run(&program), "12\n");
}

#[test]
fn test_include_splices_into_unit_scope() {
    let program = generate_from(
        &[("root", "include<lib>\necho(y);"), ("lib", "y = 5;")],
        "root",
    )
    .expect("generation failed");
    assert_eq!(run(&program), "5\n");
}

#[test]
fn test_used_unit_initialised_before_root() {
    let program = generate_from(
        &[
            ("root", "use<lib>\necho(table());"),
            ("lib", "size = 4;\nfunction table() = size;"),
        ],
        "root",
    )
    .expect("generation failed");
    assert_eq!(run(&program), "4\n");
}

#[test]
fn test_unknown_function_is_fatal() {
    let err = generate_from(&[("root", "echo(mystery(1));")], "root").unwrap_err();
    assert!(err.message.contains("unknown function"));
}

#[test]
fn test_unknown_module_is_fatal() {
    let err = generate_from(&[("root", "mystery(1);")], "root").unwrap_err();
    assert!(err.message.contains("unknown module"));
}

#[test]
fn test_lambda_is_rejected() {
    let err = generate_from(&[("root", "v = function (x) x;")], "root").unwrap_err();
    assert!(err.message.contains("lambda not supported"));
}

#[test]
fn test_builtin_unary_call() {
    assert_eq!(run_source("echo(sqrt(16));"), "4\n");
    assert_eq!(run_source("echo(floor(2.7));"), "2\n");
    assert_eq!(run_source("v = [3, 4]; echo(norm(v)); echo(len(v));"), "5\n2\n");
}

#[test]
fn test_for_loop_over_range() {
    let program = generate("for (i = [0 : 2 : 6]) echo(i);");
    let entry_ops = opcodes(&program.functions[program.entry]);
    assert!(entry_ops.contains(&Opcode::Iter));
    assert_eq!(run(&program), "0\n2\n4\n6\n");
}

#[test]
fn test_for_loop_over_vector_with_locals() {
    assert_eq!(
        run_source("v = [1, 2]; for (i = v) { d = i * 10; echo(d); }"),
        "10\n20\n"
    );
}

#[test]
fn test_nested_for_bindings() {
    assert_eq!(
        run_source("for (i = [0:1], j = [0:1]) echo(i * 2 + j);"),
        "0\n1\n2\n3\n"
    );
}

#[test]
fn test_intersection_for_lowered_like_for() {
    assert_eq!(run_source("intersection_for (i = [1 : 2]) echo(i);"), "1\n2\n");
}

#[test]
fn test_list_comprehension() {
    assert_eq!(
        run_source("v = [for (i = [1 : 3]) i * 2]; echo(v);"),
        "[2, 4, 6]\n"
    );
}

#[test]
fn test_list_comprehension_multiple_generators() {
    assert_eq!(
        run_source("v = [for (i = [1 : 2]) i, i * 10]; echo(v);"),
        "[1, 10, 2, 20]\n"
    );
}

#[test]
fn test_c_style_comprehension() {
    assert_eq!(
        run_source("v = [for (i = 0; i < 3; i = i + 1) i]; echo(v);"),
        "[0, 1, 2]\n"
    );
}

#[test]
fn test_list_literal_and_splat() {
    assert_eq!(run_source("v = [1, each [2, 3]]; echo(v);"), "[1, 2, 3]\n");
}

#[test]
fn test_indexing() {
    assert_eq!(run_source("v = [5, 6]; echo(v[1]); echo(v[9]);"), "6\nundef\n");
}

#[test]
fn test_let_expression() {
    assert_eq!(run_source("w = [0]; echo(let (a = w[0], b = 2) a + b);"), "2\n");
}

#[test]
fn test_range_default_step() {
    assert_eq!(run_source("echo([1 : 3]);"), "[1 : 1 : 3]\n");
}

#[test]
fn test_module_call_with_defaults_and_named_args() {
    let source = "module m(a, b = 10) { echo(a + b); }\nm(1);\nm(1, b = 2);\nm(b = 3, a = 4);";
    assert_eq!(run_source(source), "11\n3\n7\n");
}

#[test]
fn test_module_missing_argument_is_undef() {
    assert_eq!(run_source("module m(a) { echo(a); }\nm();"), "undef\n");
}

#[test]
fn test_children_block_reads_enclosing_frame() {
    let source = "module helper(q) { echo(q); }\n\
                  module outer(a) { helper(1) { echo(a); } }\n\
                  outer(7);";
    let program = generate(source);
    // The children block is compiled as its own trailing module entry and
    // reaches `a` through the parent frame.
    let child = program
        .functions
        .last()
        .expect("child entry missing");
    assert!(opcodes(child).contains(&Opcode::GetParentI));
    assert_eq!(run(&program), "1\n7\n");
}

#[test]
fn test_children_call_warns() {
    let program = generate("module m() { children(); }\nm();");
    assert!(
        program
            .warnings
            .iter()
            .any(|w| w.message.contains("children() not supported"))
    );
}

#[test]
fn test_disable_modifier_skips_subtree() {
    assert_eq!(run_source("*echo(1);\n#echo(2);\n%echo(3);\n!echo(4);"), "2\n3\n4\n");
}

#[test]
fn test_if_module_with_runtime_condition() {
    let source = "v = [1];\nif (v[0] == 1) { echo(10); } else { echo(20); }";
    assert_eq!(run_source(source), "10\n");
}

#[test]
fn test_if_module_with_folded_condition() {
    let program = generate("if (1 == 2) { echo(1); } else { echo(2); }");
    let entry_ops = opcodes(&program.functions[program.entry]);
    assert!(!entry_ops.contains(&Opcode::JumpFalseI));
    assert_eq!(run(&program), "2\n");
}

#[test]
fn test_duplicate_assignment_keeps_later_value() {
    assert_eq!(run_source("a = 1;\na = 2;\necho(a);"), "2\n");
}

#[test]
fn test_generated_bytecode_round_trips() {
    let source = "function fib(n) = n < 2 ? n : fib(n - 1) + fib(n - 2);\n\
                  module m(a) { for (i = [0 : a]) echo(i); }\n\
                  v = [for (i = [0 : 3]) fib(i)];\n\
                  echo(v);\n\
                  m(1);";
    let program = generate(source);
    for function in &program.functions {
        let insts = disassemble(&function.code).expect("disassembly failed");
        assert_eq!(assemble(&insts), function.code);
    }
    assert_eq!(run(&program), "[0, 1, 1, 2]\n0\n1\n");
}

#[test]
fn test_listing_renders_every_function() {
    let program = generate("function id(x) = x;\necho(id(3));");
    let text = program.listing().expect("listing failed");
    assert!(text.contains("function #0"));
    assert!(text.contains("(entry)"));
    assert!(text.contains("Ret"));
}
