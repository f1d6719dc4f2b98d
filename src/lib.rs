//! Whole-program compiler core for the BUG smart-contract language
//! (spec.md §0 OVERVIEW): AST → type check (C2) → SSA IR (C4) →
//! optimizer (C5) → EVM bytecode (C6).
//!
//! There is no parser in this crate (spec.md's grammar is out of scope);
//! [`compile`] takes an already-built [`ast::Program`] and drives it
//! through the remaining stages, the way `seqc`'s `compile_to_ir_with_config`
//! drives a parsed program through type checking and codegen.

pub mod ast;
pub mod codegen;
pub mod config;
pub mod diagnostics;
pub mod ir;
pub mod ir_gen;
pub mod optimizer;
pub mod typechecker;
pub mod types;

pub use codegen::{CodeGenError, Instruction as EvmInstruction};
pub use config::{CompilerOptions, OptimizerLevel};
pub use diagnostics::{CompileError, DiagnosticBag};
pub use ir::Module;
pub use optimizer::{OptimizationReport, PassStats, TransformationRecord};
pub use types::Types;

/// The assembled bytecode for both deployment-time and steady-state code
/// paths (spec.md §6 `bytecode.{runtime,create,runtimeInstructions,
/// createInstructions}`).
#[derive(Debug, Clone)]
pub struct Bytecode {
    pub runtime: Vec<u8>,
    pub create: Vec<u8>,
    pub runtime_instructions: Vec<EvmInstruction>,
    pub create_instructions: Vec<EvmInstruction>,
}

/// Everything [`compile`] hands back on success: the bytecode, every
/// intermediate artifact a caller might want to inspect, and the full
/// diagnostic bag (spec.md §6 external interface contract).
pub struct CompileOutput {
    pub bytecode: Bytecode,
    pub types: Types,
    pub ir: Module,
    pub optimized_ir: Module,
    pub transformations: Vec<TransformationRecord>,
    pub optimization_stats: Vec<PassStats>,
    pub messages: DiagnosticBag,
}

/// Runs the full pipeline over an already-parsed program (spec.md §6).
///
/// Type-check and IR-generation diagnostics accumulate together; compilation
/// aborts with [`CompileError::Diagnostics`] as soon as either stage has
/// recorded an Error-severity diagnostic, before the optimizer or codegen
/// ever see the (possibly inconsistent) IR. A codegen failure is fatal and
/// reported separately via [`CompileError::Codegen`] (spec.md §4.4.3), since
/// it reflects a compiler-internal invariant violation rather than a
/// reportable source-level mistake.
pub fn compile(program: &ast::Program, options: &CompilerOptions) -> Result<CompileOutput, CompileError> {
    let span = tracing::info_span!("compile");
    let _enter = span.enter();

    let check_result = typechecker::TypeChecker::new().check_program(program);
    let mut messages = check_result.diagnostics;

    let (module, ir_diagnostics) = ir_gen::generate(program, &check_result.types);
    messages.extend(ir_diagnostics);

    if messages.has_errors() {
        tracing::warn!(errors = messages.errors.len(), "compilation aborted before codegen");
        return Err(CompileError::Diagnostics(messages));
    }

    let mut optimized = module.clone();
    let report = optimizer::optimize(&mut optimized, options.optimizer_level);

    let codegen_output = codegen::generate(&optimized, options)?;

    tracing::info!(
        transformations = report.transformations.len(),
        runtime_bytes = codegen_output.runtime.len(),
        create_bytes = codegen_output.create.len(),
        "compile finished"
    );

    Ok(CompileOutput {
        bytecode: Bytecode {
            runtime: codegen_output.runtime,
            create: codegen_output.create,
            runtime_instructions: codegen_output.runtime_instructions,
            create_instructions: codegen_output.create_instructions,
        },
        types: check_result.types,
        ir: module,
        optimized_ir: optimized,
        transformations: report.transformations,
        optimization_stats: report.stats,
        messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;

    fn empty_program() -> Program {
        let mut ids = IdGen::new();
        Program { id: ids.next(), name: "Empty".into(), declarations: vec![], create: None, body: None }
    }

    #[test]
    fn empty_program_compiles_to_memory_pointer_init_then_stop() {
        let program = empty_program();
        let output = compile(&program, &CompilerOptions::default()).expect("compiles");
        assert!(!output.messages.has_errors());
        assert!(output.bytecode.runtime_instructions.iter().any(|i| i.mnemonic() == "MStore"));
        assert_eq!(output.bytecode.runtime_instructions.last().unwrap().mnemonic(), "Stop");
    }

    #[test]
    fn diagnostics_errors_abort_before_codegen() {
        let mut ids = IdGen::new();
        let program_id = ids.next();
        let body_id = ids.next();
        let expr_id = ids.next();
        let stmt_id = ids.next();
        let program = Program {
            id: program_id,
            name: "Broken".into(),
            declarations: vec![],
            create: None,
            body: Some(Block {
                id: body_id,
                kind: BlockKind::Statements,
                items: vec![BlockItem::Stmt(Statement::Express(ExpressStmt {
                    id: stmt_id,
                    expr: Expression::Identifier(IdentifierExpr { id: expr_id, name: "undeclared".into(), span: None }),
                    span: None,
                }))],
                span: None,
            }),
        };
        let err = compile(&program, &CompilerOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::Diagnostics(_)));
    }
}
