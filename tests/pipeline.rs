//! End-to-end pipeline scenarios: hand-built `ast::Program` fixtures driven
//! all the way through `compile()` (type check → IR → optimize → codegen),
//! mirroring spec.md §8's seed test cases.

use bugc::ast::*;
use bugc::ir;
use bugc::{compile, CompilerOptions};

fn uint256(ids: &mut IdGen) -> TypeExpr {
    TypeExpr::Elementary { id: ids.next(), kind: ElementaryKind::Uint, bits: Some(256) }
}

fn number(ids: &mut IdGen, value: &str) -> Expression {
    Expression::Literal(LiteralExpr { id: ids.next(), kind: LiteralKind::Number, value: value.into(), unit: None, span: None })
}

fn ident(ids: &mut IdGen, name: &str) -> Expression {
    Expression::Identifier(IdentifierExpr { id: ids.next(), name: name.into(), span: None })
}

fn binop(ids: &mut IdGen, operator: &str, lhs: Expression, rhs: Expression) -> Expression {
    Expression::Operator(OperatorExpr { id: ids.next(), operator: operator.into(), operands: vec![lhs, rhs], span: None })
}

// 1. `name Empty; storage {} code {}` - halts immediately, storage untouched.
#[test]
fn empty_program_halts_immediately() {
    let mut ids = IdGen::new();
    let program = Program { id: ids.next(), name: "Empty".into(), declarations: vec![], create: None, body: None };
    let output = compile(&program, &CompilerOptions::default()).expect("compiles");
    assert!(!output.messages.has_errors());
    let instrs = &output.bytecode.runtime_instructions;
    assert!(
        instrs.iter().any(|i| i.mnemonic() == "MStore"),
        "first runtime action initializes the free-memory pointer (spec.md §4.4 sub-pass 2)"
    );
    assert_eq!(instrs.last().unwrap().mnemonic(), "Stop", "no main function lowers straight to STOP after that");
}

// 2. `name Counter; storage { [0] count: uint256; } code { count = count + 1; }`
#[test]
fn counter_increments_storage_slot_zero() {
    let mut ids = IdGen::new();
    let storage_ty = uint256(&mut ids);
    let program = Program {
        id: ids.next(),
        name: "Counter".into(),
        declarations: vec![Declaration::Storage(StorageDecl {
            id: ids.next(),
            name: "count".into(),
            declared_type: storage_ty,
            slot: 0,
            span: None,
        })],
        create: None,
        body: Some(Block {
            id: ids.next(),
            kind: BlockKind::Statements,
            items: vec![BlockItem::Stmt(Statement::Assign(AssignStmt {
                id: ids.next(),
                target: ident(&mut ids, "count"),
                value: binop(&mut ids, "+", ident(&mut ids, "count"), number(&mut ids, "1")),
                span: None,
            }))],
            span: None,
        }),
    };

    let output = compile(&program, &CompilerOptions::default()).expect("compiles");
    assert!(!output.messages.has_errors(), "{:?}", output.messages.errors);

    let main = output.ir.main.as_ref().expect("body lowers to main");
    let block = &main.blocks[0];
    let reads = block.instructions.iter().filter(|i| matches!(i, ir::Instruction::Read { .. })).count();
    let writes = block.instructions.iter().filter(|i| matches!(i, ir::Instruction::Write { .. })).count();
    let adds = block
        .instructions
        .iter()
        .filter(|i| matches!(i, ir::Instruction::Binary { op: ir::BinOp::Add, .. }))
        .count();
    assert_eq!(reads, 1);
    assert_eq!(writes, 1);
    assert_eq!(adds, 1);

    let instrs = &output.bytecode.runtime_instructions;
    assert_eq!(instrs.iter().filter(|i| i.mnemonic() == "SLoad").count(), 1);
    assert_eq!(instrs.iter().filter(|i| i.mnemonic() == "SStore").count(), 1);
}

// 3. `name Gate; storage { [0] owner: address; } code { if (msg.sender != owner) { return; } }`
#[test]
fn gate_branches_to_a_bare_return_when_caller_is_not_owner() {
    let mut ids = IdGen::new();
    let owner_ty = TypeExpr::Elementary { id: ids.next(), kind: ElementaryKind::Address, bits: Some(160) };
    let program = Program {
        id: ids.next(),
        name: "Gate".into(),
        declarations: vec![Declaration::Storage(StorageDecl {
            id: ids.next(),
            name: "owner".into(),
            declared_type: owner_ty,
            slot: 0,
            span: None,
        })],
        create: None,
        body: Some(Block {
            id: ids.next(),
            kind: BlockKind::Statements,
            items: vec![BlockItem::Stmt(Statement::ControlFlow(ControlFlowStmt {
                id: ids.next(),
                kind: ControlFlowKind::If {
                    condition: Expression::Operator(OperatorExpr {
                        id: ids.next(),
                        operator: "!=".into(),
                        operands: vec![
                            Expression::Special(SpecialExpr { id: ids.next(), kind: SpecialKind::MsgSender, span: None }),
                            ident(&mut ids, "owner"),
                        ],
                        span: None,
                    }),
                    then_branch: Block {
                        id: ids.next(),
                        kind: BlockKind::Statements,
                        items: vec![BlockItem::Stmt(Statement::ControlFlow(ControlFlowStmt {
                            id: ids.next(),
                            kind: ControlFlowKind::Return { value: None, span: None },
                        }))],
                        span: None,
                    },
                    else_branch: None,
                    span: None,
                },
            }))],
            span: None,
        }),
    };

    let output = compile(&program, &CompilerOptions::default()).expect("compiles");
    assert!(!output.messages.has_errors(), "{:?}", output.messages.errors);

    let main = output.ir.main.as_ref().expect("body lowers to main");
    assert_eq!(main.blocks.len(), 3, "entry, then, merge");
    assert!(matches!(main.blocks[1].terminator, ir::Terminator::Return { value: None }));

    let instrs = &output.bytecode.runtime_instructions;
    let jumpi_idx = instrs.iter().position(|i| i.mnemonic() == "JumpI").expect("branch emits a JUMPI");
    let caller_idx = instrs.iter().position(|i| i.mnemonic() == "Caller").expect("reads msg.sender via CALLER");
    let sload_idx = instrs.iter().position(|i| i.mnemonic() == "SLoad").expect("reads owner via SLOAD");
    assert!(caller_idx < jumpi_idx, "CALLER must be evaluated before the branch it feeds");
    assert!(sload_idx < jumpi_idx, "SLOAD must be evaluated before the branch it feeds");
}

// 4. `name Map; storage { [0] balances: mapping<address, uint256>; }
//     code { balances[msg.sender] = balances[msg.sender] + msg.value; }`
#[test]
fn map_cse_collapses_duplicate_mapping_slot_computations() {
    let mut ids = IdGen::new();
    let key_ty = TypeExpr::Elementary { id: ids.next(), kind: ElementaryKind::Address, bits: Some(160) };
    let value_ty = uint256(&mut ids);
    let mapping_ty = TypeExpr::Complex { id: ids.next(), kind: Box::new(ComplexKind::Mapping { key: key_ty, value: value_ty }) };

    let balances_index = |ids: &mut IdGen| {
        Expression::Access(AccessExpr {
            id: ids.next(),
            base: Box::new(ident(ids, "balances")),
            kind: AccessKind::Index {
                index: Box::new(Expression::Special(SpecialExpr { id: ids.next(), kind: SpecialKind::MsgSender, span: None })),
            },
            span: None,
        })
    };

    let program = Program {
        id: ids.next(),
        name: "Map".into(),
        declarations: vec![Declaration::Storage(StorageDecl {
            id: ids.next(),
            name: "balances".into(),
            declared_type: mapping_ty,
            slot: 0,
            span: None,
        })],
        create: None,
        body: Some(Block {
            id: ids.next(),
            kind: BlockKind::Statements,
            items: vec![BlockItem::Stmt(Statement::Assign(AssignStmt {
                id: ids.next(),
                target: balances_index(&mut ids),
                value: Expression::Operator(OperatorExpr {
                    id: ids.next(),
                    operator: "+".into(),
                    operands: vec![
                        balances_index(&mut ids),
                        Expression::Special(SpecialExpr { id: ids.next(), kind: SpecialKind::MsgValue, span: None }),
                    ],
                    span: None,
                }),
                span: None,
            }))],
            span: None,
        }),
    };

    let output = compile(&program, &CompilerOptions::default()).expect("compiles");
    assert!(!output.messages.has_errors(), "{:?}", output.messages.errors);

    let is_mapping_slot = |i: &&ir::Instruction| {
        matches!(i, ir::Instruction::ComputeSlot { computation: ir::SlotComputation::Mapping { .. }, .. })
    };
    let pre_count = output.ir.main.as_ref().unwrap().blocks[0].instructions.iter().filter(is_mapping_slot).count();
    assert_eq!(pre_count, 2, "the source reads `balances[msg.sender]` twice, before CSE");

    let post_count = output.optimized_ir.main.as_ref().unwrap().blocks[0].instructions.iter().filter(is_mapping_slot).count();
    assert_eq!(post_count, 1, "CSE collapses the two identical compute_slot{{mapping}} instructions");

    let sha3_count = output.bytecode.runtime_instructions.iter().filter(|i| i.mnemonic() == "Sha3").count();
    assert_eq!(sha3_count, 1, "exactly one KECCAK256 survives into the assembled runtime bytecode");
}

// 5. `let x: bytes = 0x1234; let y = x[1];` - a local dynamic-bytes literal
//    indexes into its length-prefixed buffer and reports the right length.
#[test]
fn local_bytes_literal_indexes_and_measures_through_its_buffer() {
    let mut ids = IdGen::new();
    let bytes_ty = TypeExpr::Elementary { id: ids.next(), kind: ElementaryKind::Bytes, bits: None };
    let out_ty = uint256(&mut ids);
    let program = Program {
        id: ids.next(),
        name: "Slice".into(),
        declarations: vec![Declaration::Storage(StorageDecl {
            id: ids.next(),
            name: "out".into(),
            declared_type: out_ty,
            slot: 0,
            span: None,
        })],
        create: None,
        body: Some(Block {
            id: ids.next(),
            kind: BlockKind::Statements,
            items: vec![
                BlockItem::Stmt(Statement::Declare(DeclareStmt {
                    id: ids.next(),
                    name: "x".into(),
                    declared_type: Some(bytes_ty),
                    initializer: Some(Expression::Literal(LiteralExpr {
                        id: ids.next(),
                        kind: LiteralKind::Hex,
                        value: "0x1234".into(),
                        unit: None,
                        span: None,
                    })),
                    span: None,
                })),
                BlockItem::Stmt(Statement::Declare(DeclareStmt {
                    id: ids.next(),
                    name: "y".into(),
                    declared_type: None,
                    initializer: Some(Expression::Access(AccessExpr {
                        id: ids.next(),
                        base: Box::new(ident(&mut ids, "x")),
                        kind: AccessKind::Index { index: Box::new(number(&mut ids, "1")) },
                        span: None,
                    })),
                    span: None,
                })),
                BlockItem::Stmt(Statement::Assign(AssignStmt {
                    id: ids.next(),
                    target: ident(&mut ids, "out"),
                    value: ident(&mut ids, "y"),
                    span: None,
                })),
            ],
            span: None,
        }),
    };

    let output = compile(&program, &CompilerOptions::default()).expect("compiles");
    assert!(!output.messages.has_errors(), "{:?}", output.messages.errors);

    let main = output.ir.main.as_ref().expect("body lowers to main");
    let block = &main.blocks[0];
    assert!(
        block.instructions.iter().any(|i| matches!(i, ir::Instruction::Allocate { .. })),
        "the `x` literal allocates a length-prefixed buffer rather than landing as a bare const"
    );
    assert!(
        block.instructions.iter().any(|i| matches!(i, ir::Instruction::Binary { op: ir::BinOp::Byte, .. })),
        "indexing `x[1]` extracts a single byte out of its packed buffer word via BYTE"
    );

    let instrs = &output.bytecode.runtime_instructions;
    assert!(instrs.iter().any(|i| i.mnemonic() == "Byte"), "BYTE opcode reaches the assembled bytecode");
    assert!(instrs.iter().any(|i| i.mnemonic() == "SStore"), "`out = y` still stores the extracted byte");
}

// 6. A dynamic `bytes` storage field's `.length` is a single storage read
//    (the generator's length-prefixed-buffer model is also load-bearing for
//    local literal buffers; see scenario 5 above and DESIGN.md).
#[test]
fn dynamic_bytes_length_is_a_single_storage_read() {
    let mut ids = IdGen::new();
    let bytes_ty = TypeExpr::Elementary { id: ids.next(), kind: ElementaryKind::Bytes, bits: None };
    let out_ty = uint256(&mut ids);
    let n_ty = uint256(&mut ids);
    let program = Program {
        id: ids.next(),
        name: "Data".into(),
        declarations: vec![
            Declaration::Storage(StorageDecl { id: ids.next(), name: "data".into(), declared_type: bytes_ty, slot: 0, span: None }),
            Declaration::Storage(StorageDecl { id: ids.next(), name: "out".into(), declared_type: out_ty, slot: 1, span: None }),
        ],
        create: None,
        body: Some(Block {
            id: ids.next(),
            kind: BlockKind::Statements,
            items: vec![
                BlockItem::Stmt(Statement::Declare(DeclareStmt {
                    id: ids.next(),
                    name: "n".into(),
                    declared_type: Some(n_ty),
                    initializer: Some(Expression::Access(AccessExpr {
                        id: ids.next(),
                        base: Box::new(ident(&mut ids, "data")),
                        kind: AccessKind::Member { name: "length".into() },
                        span: None,
                    })),
                    span: None,
                })),
                BlockItem::Stmt(Statement::Assign(AssignStmt {
                    id: ids.next(),
                    target: ident(&mut ids, "out"),
                    value: ident(&mut ids, "n"),
                    span: None,
                })),
            ],
            span: None,
        }),
    };

    let output = compile(&program, &CompilerOptions::default()).expect("compiles");
    assert!(!output.messages.has_errors(), "{:?}", output.messages.errors);

    let main = output.ir.main.as_ref().unwrap();
    let reads = main.blocks[0]
        .instructions
        .iter()
        .filter(|i| matches!(i, ir::Instruction::Read { location: ir::Location::Storage, .. }))
        .count();
    assert_eq!(reads, 1, "`.length` on a storage-backed dynamic bytes field is a single storage read");

    let instrs = &output.bytecode.runtime_instructions;
    assert!(instrs.iter().any(|i| i.mnemonic() == "SLoad"));
    assert!(instrs.iter().any(|i| i.mnemonic() == "SStore"));
}

// 7. `for (let i = 0; i < 3; i = i + 1) { count = count + 1; }` - distinct
//    header/body/update/exit blocks with a phi for `i` at the header.
#[test]
fn for_loop_builds_a_header_phi_and_distinct_loop_blocks() {
    let mut ids = IdGen::new();
    let count_ty = uint256(&mut ids);
    let i_ty = uint256(&mut ids);

    let init = Statement::Declare(DeclareStmt {
        id: ids.next(),
        name: "i".into(),
        declared_type: Some(i_ty),
        initializer: Some(number(&mut ids, "0")),
        span: None,
    });
    let condition = binop(&mut ids, "<", ident(&mut ids, "i"), number(&mut ids, "3"));
    let update = Statement::Assign(AssignStmt {
        id: ids.next(),
        target: ident(&mut ids, "i"),
        value: binop(&mut ids, "+", ident(&mut ids, "i"), number(&mut ids, "1")),
        span: None,
    });
    let body = Block {
        id: ids.next(),
        kind: BlockKind::Statements,
        items: vec![BlockItem::Stmt(Statement::Assign(AssignStmt {
            id: ids.next(),
            target: ident(&mut ids, "count"),
            value: binop(&mut ids, "+", ident(&mut ids, "count"), number(&mut ids, "1")),
            span: None,
        }))],
        span: None,
    };

    let program = Program {
        id: ids.next(),
        name: "Loop".into(),
        declarations: vec![Declaration::Storage(StorageDecl {
            id: ids.next(),
            name: "count".into(),
            declared_type: count_ty,
            slot: 0,
            span: None,
        })],
        create: None,
        body: Some(Block {
            id: ids.next(),
            kind: BlockKind::Statements,
            items: vec![BlockItem::Stmt(Statement::ControlFlow(ControlFlowStmt {
                id: ids.next(),
                kind: ControlFlowKind::For {
                    init: Some(Box::new(init)),
                    condition: Some(condition),
                    update: Some(Box::new(update)),
                    body,
                    span: None,
                },
            }))],
            span: None,
        }),
    };

    let output = compile(&program, &CompilerOptions::default()).expect("compiles");
    assert!(!output.messages.has_errors(), "{:?}", output.messages.errors);

    let main = output.ir.main.as_ref().unwrap();
    assert_eq!(main.blocks.len(), 5, "entry, for_header, for_body, for_update, for_exit");
    let header = &main.blocks[1];
    assert_eq!(header.phis.len(), 1, "only `i` is both assigned in the loop and live coming in");
    assert_eq!(header.phis[0].sources.len(), 2, "one source from the preheader, one from the latch");

    // `count` is read/added/written exactly once statically - the loop body
    // is not unrolled, even though it runs three times at runtime.
    let body_block = &main.blocks[2];
    assert_eq!(body_block.instructions.iter().filter(|i| matches!(i, ir::Instruction::Read { .. })).count(), 1);
    assert_eq!(body_block.instructions.iter().filter(|i| matches!(i, ir::Instruction::Write { .. })).count(), 1);

    // Exercises `resolve_labels` against a real forward branch and a real
    // backward jump (the loop's back edge) in the same function.
    assert!(!output.bytecode.runtime.is_empty());
}
