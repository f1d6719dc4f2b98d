//! IR generator (spec.md §4.2, component C4): lowers a type-checked
//! `Program` to SSA `ir::Module`.
//!
//! The generator tracks, per function, a single flat binding map from
//! source name to its current SSA `Value` — "pseudo-SSA": assignment
//! rebinds a name to a fresh value without mutating anything already
//! emitted (spec.md §9 design note: fresh temps per assignment, scope map
//! tracks the current version). Merge points (`if`/`for`/`while`) insert
//! phi nodes as they are built rather than in a wholly separate walk
//! afterwards — deferring merge decisions would leave no way to tell
//! later statements, lowered immediately afterward in the same pass,
//! which value a name resolves to. This still satisfies spec.md §4.2.4's
//! invariants (no duplicate phi destinations, exactly one source per
//! predecessor); see DESIGN.md for the write-up of this deviation from a
//! textually separate pass.

use crate::ast;
use crate::ast::{AccessKind, ControlFlowKind, Expression, Statement};
use crate::diagnostics::{codes, Diagnostic, DiagnosticBag};
use crate::ir::*;
use crate::types::{self, StructType, Type, Types};
use std::collections::{HashMap, HashSet};

struct StorageInfo {
    slot: i64,
    ty: Type,
}

struct LoopContext {
    continue_target: BlockId,
    break_target: BlockId,
}

/// Per-function mutable generation state (spec.md §4.2 "State").
struct FunctionState {
    blocks: Vec<Block>,
    current: BlockId,
    next_value: u32,
    next_block: u32,
    scope: HashMap<String, (Value, Type)>,
    loops: Vec<LoopContext>,
}

impl FunctionState {
    fn new() -> Self {
        FunctionState {
            blocks: vec![Block::new(BlockId(0))],
            current: BlockId(0),
            next_value: 0,
            next_block: 1,
            scope: HashMap::new(),
            loops: Vec::new(),
        }
    }

    fn fresh_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    fn fresh_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        self.blocks.push(Block::new(id));
        id
    }

    fn block_mut(&mut self, id: BlockId) -> &mut Block {
        self.blocks.iter_mut().find(|b| b.id == id).expect("block exists")
    }

    fn current_mut(&mut self) -> &mut Block {
        let id = self.current;
        self.block_mut(id)
    }

    fn emit(&mut self, instr: Instruction) -> Option<ValueId> {
        let dest = instr.dest();
        self.current_mut().instructions.push(instr);
        dest
    }

    fn set_terminator(&mut self, term: Terminator) {
        self.current_mut().terminator = term;
    }

    fn terminator_is_unset(&self) -> bool {
        matches!(
            self.blocks.iter().find(|b| b.id == self.current).unwrap().terminator,
            Terminator::Unreachable
        )
    }

    fn switch_to(&mut self, id: BlockId) {
        self.current = id;
    }

    fn define(&mut self, name: &str, value: Value, ty: Type) {
        self.scope.insert(name.to_string(), (value, ty));
    }

    fn lookup(&self, name: &str) -> Option<&(Value, Type)> {
        self.scope.get(name)
    }

    fn finalize(self, name: String, parameters: Vec<Parameter>, return_type: Option<Type>, entry: BlockId) -> Function {
        let mut func = Function { name, parameters, return_type, entry, blocks: self.blocks };
        func.recompute_predecessors();
        func
    }
}

fn const_value_for_literal(kind: ast::LiteralKind, value: &str) -> ConstValue {
    match kind {
        ast::LiteralKind::Number => match value.parse::<u64>() {
            Ok(v) => ConstValue::Uint(v),
            Err(_) => ConstValue::BigUint(value.to_string()),
        },
        ast::LiteralKind::Boolean => ConstValue::Bool(value == "true"),
        ast::LiteralKind::String => ConstValue::String(value.to_string()),
        ast::LiteralKind::Address => ConstValue::Address(value.to_string()),
        ast::LiteralKind::Hex => {
            let digits = value.trim_start_matches("0x");
            let padded = if digits.len() % 2 == 1 {
                format!("0{digits}")
            } else {
                digits.to_string()
            };
            let bytes = (0..padded.len())
                .step_by(2)
                .filter_map(|i| u8::from_str_radix(&padded[i..i + 2], 16).ok())
                .collect();
            ConstValue::Bytes(bytes)
        }
    }
}

fn needs_length_prefixed_buffer(ty: &Type) -> bool {
    matches!(ty, Type::Bytes(None) | Type::String)
}

/// The raw bytes a literal expression would materialize, for callers that
/// need to pack them into a buffer themselves rather than push them as a
/// bare stack constant.
fn literal_buffer_payload(expr: &Expression) -> Option<Vec<u8>> {
    match expr {
        Expression::Literal(lit) => match const_value_for_literal(lit.kind, &lit.value) {
            ConstValue::Bytes(b) => Some(b),
            ConstValue::String(s) => Some(s.into_bytes()),
            _ => None,
        },
        _ => None,
    }
}

fn zero_const(ty: &Type) -> ConstValue {
    match ty {
        Type::Bool => ConstValue::Bool(false),
        Type::Address => ConstValue::Address("0x0000000000000000000000000000000000000000".into()),
        Type::Bytes(_) => ConstValue::Bytes(Vec::new()),
        Type::String => ConstValue::String(String::new()),
        _ => ConstValue::Uint(0),
    }
}

fn binop_for_operator(op: &str) -> Option<BinOp> {
    Some(match op {
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        "/" => BinOp::Div,
        "%" => BinOp::Mod,
        "<" => BinOp::Lt,
        ">" => BinOp::Gt,
        "<=" => BinOp::Le,
        ">=" => BinOp::Ge,
        "==" => BinOp::Eq,
        "!=" => BinOp::Ne,
        "&&" => BinOp::And,
        "||" => BinOp::Or,
        _ => return None,
    })
}

/// Collect every name directly assigned (by `Declare` or identifier
/// `Assign`) within a block, recursing into nested control flow. Used to
/// decide which names need a loop-header phi (spec.md §4.2.4, scenario 6).
fn collect_assigned_names(block: &ast::Block, out: &mut HashSet<String>) {
    for item in &block.items {
        if let ast::BlockItem::Stmt(stmt) = item {
            collect_assigned_names_stmt(stmt, out);
        }
    }
}

fn collect_assigned_names_stmt(stmt: &Statement, out: &mut HashSet<String>) {
    match stmt {
        Statement::Declare(d) => {
            out.insert(d.name.clone());
        }
        Statement::Assign(a) => {
            if let Expression::Identifier(id) = &a.target {
                out.insert(id.name.clone());
            }
        }
        Statement::ControlFlow(cf) => match &cf.kind {
            ControlFlowKind::If { then_branch, else_branch, .. } => {
                collect_assigned_names(then_branch, out);
                if let Some(e) = else_branch {
                    collect_assigned_names(e, out);
                }
            }
            ControlFlowKind::For { body, update, .. } => {
                collect_assigned_names(body, out);
                if let Some(u) = update {
                    collect_assigned_names_stmt(u, out);
                }
            }
            ControlFlowKind::While { body, .. } => collect_assigned_names(body, out),
            _ => {}
        },
        Statement::Express(_) => {}
    }
}

pub struct IrGenerator<'a> {
    types: &'a Types,
    storage: HashMap<String, StorageInfo>,
    structs: HashMap<String, StructType>,
    diagnostics: DiagnosticBag,
}

/// Lowers a type-checked program to SSA IR (spec.md §4.2 contract).
pub fn generate(program: &ast::Program, types: &Types) -> (Module, DiagnosticBag) {
    let mut gen = IrGenerator::new(program, types);

    let mut module = Module::new(program.name.clone());
    let mut storage: Vec<StorageSlot> = gen
        .storage
        .iter()
        .map(|(name, info)| StorageSlot { name: name.clone(), ty: info.ty.clone(), slot: info.slot })
        .collect();
    storage.sort_by_key(|s| s.slot);
    module.storage = storage;

    let mut functions = Vec::new();
    for decl in &program.declarations {
        if let ast::Declaration::Function(f) = decl {
            functions.push(gen.lower_function(
                f.name.clone(),
                &f.parameters,
                f.return_type.as_ref(),
                &f.body,
            ));
        }
    }
    functions.sort_by(|a, b| a.name.cmp(&b.name));
    module.functions = functions;

    if let Some(create) = &program.create {
        module.create = Some(gen.lower_function("create".into(), &[], None, create));
    }
    if let Some(body) = &program.body {
        module.main = Some(gen.lower_function("main".into(), &[], None, body));
    }

    (module, gen.diagnostics)
}

impl<'a> IrGenerator<'a> {
    fn new(program: &ast::Program, types: &'a Types) -> Self {
        let structs = types::collect_struct_types(program);
        let mut storage = HashMap::new();
        for decl in &program.declarations {
            if let ast::Declaration::Storage(s) = decl {
                let ty = types::resolve_type_expr(&s.declared_type, &structs);
                storage.insert(s.name.clone(), StorageInfo { slot: s.slot, ty });
            }
        }
        IrGenerator { types, storage, structs, diagnostics: DiagnosticBag::new() }
    }

    fn lower_function(
        &mut self,
        name: String,
        parameters: &[ast::Parameter],
        return_type: Option<&ast::TypeExpr>,
        body: &ast::Block,
    ) -> Function {
        let span = tracing::debug_span!("ir_gen", function = %name);
        let _enter = span.enter();

        let mut fs = FunctionState::new();
        let entry = fs.current;
        let mut params = Vec::new();
        for p in parameters {
            let ty = types::resolve_type_expr(&p.declared_type, &self.structs);
            let value_id = fs.fresh_value();
            fs.define(&p.name, Value::Temp(value_id), ty.clone());
            params.push(Parameter { name: p.name.clone(), value: value_id, ty });
        }

        self.lower_block(&mut fs, body);
        if fs.terminator_is_unset() {
            fs.set_terminator(Terminator::Return { value: None });
        }

        let return_ty = return_type.map(|t| types::resolve_type_expr(t, &self.structs));
        let func = fs.finalize(name, params, return_ty, entry);
        tracing::debug!(blocks = func.blocks.len(), "function lowered");
        func
    }

    fn lower_block(&mut self, fs: &mut FunctionState, block: &ast::Block) {
        for item in &block.items {
            if let ast::BlockItem::Stmt(stmt) = item {
                self.lower_statement(fs, stmt);
            }
        }
    }

    fn lower_statement(&mut self, fs: &mut FunctionState, stmt: &Statement) {
        match stmt {
            Statement::Declare(d) => self.lower_declare(fs, d),
            Statement::Assign(a) => self.lower_assign(fs, a),
            Statement::ControlFlow(cf) => self.lower_control_flow(fs, cf),
            Statement::Express(e) => {
                self.lower_expr(fs, &e.expr);
            }
        }
    }

    fn lower_declare(&mut self, fs: &mut FunctionState, d: &ast::DeclareStmt) {
        let declared_ty = d.declared_type.as_ref().map(|t| types::resolve_type_expr(t, &self.structs));
        let (value, ty) = match &d.initializer {
            Some(init) => {
                let ty = declared_ty.unwrap_or_else(|| self.types.get(init.id()).cloned().unwrap_or(Type::Failure));
                let value = if needs_length_prefixed_buffer(&ty) {
                    match literal_buffer_payload(init) {
                        Some(payload) => self.allocate_length_prefixed_buffer(fs, &payload),
                        None => self.lower_expr(fs, init),
                    }
                } else {
                    self.lower_expr(fs, init)
                };
                (value, ty)
            }
            None => {
                let ty = declared_ty.unwrap_or(Type::Failure);
                let dest = fs.fresh_value();
                fs.emit(Instruction::Const { dest, ty: ty.clone(), value: zero_const(&ty) });
                (Value::Temp(dest), ty)
            }
        };
        fs.define(&d.name, value, ty);
    }

    /// Materializes a dynamic `bytes`/`string` literal as a length-prefixed
    /// memory buffer: a header word holding the byte length, followed by
    /// the payload packed 32 bytes per word — the same layout
    /// `lower_length`/`emit_slice` already assume a `bytes`/`string` pointer
    /// addresses (spec.md §4.2.1 Declare bullet).
    fn allocate_length_prefixed_buffer(&mut self, fs: &mut FunctionState, payload: &[u8]) -> Value {
        let word_count = payload.len().div_ceil(32);
        let total_size = 32 + word_count * 32;
        let ptr = fs.fresh_value();
        fs.emit(Instruction::Allocate {
            dest: ptr,
            ty: Type::Bytes(None),
            location: Location::Memory,
            size: Value::Const(ConstValue::Uint(total_size as u64)),
        });
        fs.emit(Instruction::Write {
            location: Location::Memory,
            slot: None,
            offset: Some(Value::Temp(ptr)),
            length: None,
            value: Value::Const(ConstValue::Uint(payload.len() as u64)),
        });
        for i in 0..word_count {
            let start = i * 32;
            let end = (start + 32).min(payload.len());
            let mut word = vec![0u8; 32];
            word[..end - start].copy_from_slice(&payload[start..end]);
            let offset_dest = fs.fresh_value();
            fs.emit(Instruction::ComputeOffset {
                dest: offset_dest,
                base: Value::Temp(ptr),
                offset: Value::Const(ConstValue::Uint((32 + start) as u64)),
            });
            fs.emit(Instruction::Write {
                location: Location::Memory,
                slot: None,
                offset: Some(Value::Temp(offset_dest)),
                length: None,
                value: Value::Const(ConstValue::Bytes(word)),
            });
        }
        Value::Temp(ptr)
    }

    fn lower_assign(&mut self, fs: &mut FunctionState, a: &ast::AssignStmt) {
        let value = self.lower_expr(fs, &a.value);
        match &a.target {
            Expression::Identifier(id) => {
                if fs.lookup(&id.name).is_some() {
                    let ty = self.types.get(a.value.id()).cloned().unwrap_or(Type::Failure);
                    fs.define(&id.name, value, ty);
                } else if let Some(info) = self.storage.get(&id.name) {
                    let slot = Value::Const(ConstValue::Uint(info.slot as u64));
                    fs.emit(Instruction::Write {
                        location: Location::Storage,
                        slot: Some(slot),
                        offset: None,
                        length: None,
                        value,
                    });
                } else {
                    self.diagnostics.push(Diagnostic::error(
                        codes::MISSING_TYPE_INFO,
                        format!("assignment target '{}' has no known binding", id.name),
                        id.span,
                    ));
                }
            }
            Expression::Access(access) => {
                if let Some((slot_value, _ty)) = self.try_storage_chain(fs, &a.target) {
                    fs.emit(Instruction::Write {
                        location: Location::Storage,
                        slot: Some(slot_value),
                        offset: None,
                        length: None,
                        value,
                    });
                } else {
                    let base_value = self.lower_expr(fs, &access.base);
                    let raw_offset = self.memory_offset_for_access(fs, access);
                    let ptr_dest = fs.fresh_value();
                    fs.emit(Instruction::ComputeOffset { dest: ptr_dest, base: base_value, offset: raw_offset });
                    fs.emit(Instruction::Write {
                        location: Location::Memory,
                        slot: None,
                        offset: Some(Value::Temp(ptr_dest)),
                        length: None,
                        value,
                    });
                }
            }
            _ => {
                self.diagnostics.push(Diagnostic::error(
                    codes::INVALID_LVALUE,
                    "assignment target is not an identifier or access expression",
                    a.target.span(),
                ));
            }
        }
    }

    /// Computes a byte offset for a non-storage `Access` (a struct field or
    /// array index on an already-materialized memory value).
    fn memory_offset_for_access(&mut self, fs: &mut FunctionState, access: &ast::AccessExpr) -> Value {
        match &access.kind {
            AccessKind::Member { name } => {
                let base_ty = self.types.get(access.base.id()).cloned().unwrap_or(Type::Failure);
                let field_offset = match &base_ty {
                    Type::Struct(s) => s.field(name).map(|f| f.byte_offset).unwrap_or(0),
                    _ => 0,
                };
                Value::Const(ConstValue::Uint(field_offset as u64))
            }
            AccessKind::Index { index } => {
                let index_value = self.lower_expr(fs, index);
                let scale = fs.fresh_value();
                fs.emit(Instruction::Const { dest: scale, ty: Type::Uint(256), value: ConstValue::Uint(32) });
                let dest = fs.fresh_value();
                fs.emit(Instruction::Binary {
                    dest,
                    ty: Type::Uint(256),
                    op: BinOp::Mul,
                    lhs: index_value,
                    rhs: Value::Temp(scale),
                });
                Value::Temp(dest)
            }
            AccessKind::Slice { .. } => Value::Const(ConstValue::Uint(0)),
        }
    }

    fn lower_control_flow(&mut self, fs: &mut FunctionState, cf: &ast::ControlFlowStmt) {
        match &cf.kind {
            ControlFlowKind::If { condition, then_branch, else_branch, .. } => {
                self.lower_if(fs, condition, then_branch, else_branch.as_ref());
            }
            ControlFlowKind::For { init, condition, update, body, .. } => {
                self.lower_for(fs, init.as_deref(), condition.as_ref(), update.as_deref(), body);
            }
            ControlFlowKind::While { condition, body, .. } => {
                self.lower_for(fs, None, Some(condition), None, body);
            }
            ControlFlowKind::Return { value, .. } => {
                let v = value.as_ref().map(|expr| self.lower_expr(fs, expr));
                fs.set_terminator(Terminator::Return { value: v });
            }
            ControlFlowKind::Break { span } => match fs.loops.last() {
                Some(loop_ctx) => fs.set_terminator(Terminator::Jump { target: loop_ctx.break_target }),
                None => {
                    self.diagnostics.push(Diagnostic::error(codes::BREAK_OUTSIDE_LOOP, "break outside loop", *span));
                    fs.set_terminator(Terminator::Return { value: None });
                }
            },
            ControlFlowKind::Continue { span } => match fs.loops.last() {
                Some(loop_ctx) => fs.set_terminator(Terminator::Jump { target: loop_ctx.continue_target }),
                None => {
                    self.diagnostics.push(Diagnostic::error(
                        codes::CONTINUE_OUTSIDE_LOOP,
                        "continue outside loop",
                        *span,
                    ));
                    fs.set_terminator(Terminator::Return { value: None });
                }
            },
        }
    }

    fn lower_if(
        &mut self,
        fs: &mut FunctionState,
        condition: &Expression,
        then_branch: &ast::Block,
        else_branch: Option<&ast::Block>,
    ) {
        let cond_value = self.lower_expr(fs, condition);
        let then_block = fs.fresh_block();
        let else_block = else_branch.map(|_| fs.fresh_block());
        let merge_block = fs.fresh_block();

        fs.set_terminator(Terminator::Branch {
            condition: cond_value,
            then_block,
            else_block: else_block.unwrap_or(merge_block),
        });

        let pre_scope = fs.scope.clone();

        fs.switch_to(then_block);
        self.lower_block(fs, then_branch);
        if fs.terminator_is_unset() {
            fs.set_terminator(Terminator::Jump { target: merge_block });
        }
        let then_end_block = fs.current;
        let then_scope = fs.scope.clone();

        let (else_end_block, else_scope) = if let Some(else_branch) = else_branch {
            fs.switch_to(else_block.unwrap());
            fs.scope = pre_scope.clone();
            self.lower_block(fs, else_branch);
            if fs.terminator_is_unset() {
                fs.set_terminator(Terminator::Jump { target: merge_block });
            }
            (fs.current, fs.scope.clone())
        } else {
            (fs.current, pre_scope.clone())
        };
        let pre_if_block = if else_block.is_some() { None } else { Some(fs.current) };
        let _ = pre_if_block;

        fs.switch_to(merge_block);
        fs.scope = pre_scope.clone();

        let mut names: HashSet<&String> = then_scope.keys().collect();
        names.extend(else_scope.keys());
        for name in names {
            let then_entry = then_scope.get(name).cloned();
            let else_entry = else_scope.get(name).cloned();
            match (then_entry, else_entry) {
                (Some((tv, ty)), Some((ev, _))) if tv == ev => {
                    fs.define(name, tv, ty);
                }
                (Some((tv, ty)), Some((ev, _))) => {
                    let dest = fs.fresh_value();
                    fs.block_mut(merge_block).phis.push(Phi {
                        dest,
                        ty: ty.clone(),
                        sources: vec![(then_end_block, tv), (else_end_block, ev)],
                    });
                    fs.define(name, Value::Temp(dest), ty);
                }
                (Some((tv, ty)), None) => fs.define(name, tv, ty),
                (None, Some((ev, ty))) => fs.define(name, ev, ty),
                (None, None) => {}
            }
        }
    }

    fn lower_for(
        &mut self,
        fs: &mut FunctionState,
        init: Option<&Statement>,
        condition: Option<&Expression>,
        update: Option<&Statement>,
        body: &ast::Block,
    ) {
        if let Some(init) = init {
            self.lower_statement(fs, init);
        }
        let preheader_block = fs.current;
        let preheader_scope = fs.scope.clone();

        let header = fs.fresh_block();
        let body_block = fs.fresh_block();
        let update_block = if update.is_some() { Some(fs.fresh_block()) } else { None };
        let exit_block = fs.fresh_block();

        fs.set_terminator(Terminator::Jump { target: header });
        fs.switch_to(header);

        let mut assigned = HashSet::new();
        collect_assigned_names(body, &mut assigned);
        if let Some(u) = update {
            collect_assigned_names_stmt(u, &mut assigned);
        }

        let mut phi_dests: HashMap<String, ValueId> = HashMap::new();
        for name in &assigned {
            if let Some((value, ty)) = preheader_scope.get(name).cloned() {
                let dest = fs.fresh_value();
                fs.block_mut(header).phis.push(Phi {
                    dest,
                    ty: ty.clone(),
                    sources: vec![(preheader_block, value)],
                });
                fs.define(name, Value::Temp(dest), ty);
                phi_dests.insert(name.clone(), dest);
            }
        }

        let cond_value = match condition {
            Some(c) => self.lower_expr(fs, c),
            None => {
                let dest = fs.fresh_value();
                fs.emit(Instruction::Const { dest, ty: Type::Bool, value: ConstValue::Bool(true) });
                Value::Temp(dest)
            }
        };
        fs.set_terminator(Terminator::Branch { condition: cond_value, then_block: body_block, else_block: exit_block });

        fs.switch_to(body_block);
        fs.loops.push(LoopContext {
            continue_target: update_block.unwrap_or(header),
            break_target: exit_block,
        });
        self.lower_block(fs, body);
        fs.loops.pop();
        if fs.terminator_is_unset() {
            fs.set_terminator(Terminator::Jump { target: update_block.unwrap_or(header) });
        }
        let latch_block_from_body = fs.current;
        let body_end_scope = fs.scope.clone();

        let latch_block = if let Some(update_block) = update_block {
            fs.switch_to(update_block);
            fs.scope = body_end_scope.clone();
            if let Some(u) = update {
                self.lower_statement(fs, u);
            }
            if fs.terminator_is_unset() {
                fs.set_terminator(Terminator::Jump { target: header });
            }
            fs.current
        } else {
            latch_block_from_body
        };
        let latch_scope = fs.scope.clone();

        for (name, dest) in &phi_dests {
            if let Some((value, _ty)) = latch_scope.get(name) {
                fs.block_mut(header)
                    .phis
                    .iter_mut()
                    .find(|p| p.dest == *dest)
                    .expect("phi just inserted")
                    .sources
                    .push((latch_block, value.clone()));
            }
        }

        fs.switch_to(exit_block);
        fs.scope = preheader_scope;
        for (name, dest) in &phi_dests {
            if let Some((_, ty)) = fs.lookup(name).cloned() {
                fs.define(name, Value::Temp(*dest), ty);
            }
        }
    }

    fn lower_expr(&mut self, fs: &mut FunctionState, expr: &Expression) -> Value {
        match expr {
            Expression::Identifier(id) => self.lower_identifier(fs, id),
            Expression::Literal(lit) => self.lower_literal(fs, lit),
            Expression::Operator(op) => self.lower_operator(fs, op),
            Expression::Access(access) => self.lower_access(fs, expr, access),
            Expression::Call(call) => self.lower_call(fs, expr, call),
            Expression::Cast(cast) => self.lower_cast(fs, expr, cast),
            Expression::Special(special) => self.lower_special(fs, expr, special),
        }
    }

    fn lower_identifier(&mut self, fs: &mut FunctionState, id: &ast::IdentifierExpr) -> Value {
        if let Some((value, _ty)) = fs.lookup(&id.name) {
            return value.clone();
        }
        if let Some(info) = self.storage.get(&id.name) {
            let dest = fs.fresh_value();
            let ty = info.ty.clone();
            let slot = Value::Const(ConstValue::Uint(info.slot as u64));
            fs.emit(Instruction::Read { dest, ty, location: Location::Storage, slot: Some(slot), offset: None, length: None });
            return Value::Temp(dest);
        }
        self.diagnostics.push(Diagnostic::error(
            codes::UNKNOWN_TYPE,
            format!("no IR binding for '{}'", id.name),
            id.span,
        ));
        Value::Const(ConstValue::Uint(0))
    }

    fn lower_literal(&mut self, fs: &mut FunctionState, lit: &ast::LiteralExpr) -> Value {
        let ty = self.types.get(lit.id).cloned().unwrap_or(Type::Failure);
        let value = const_value_for_literal(lit.kind, &lit.value);
        let dest = fs.fresh_value();
        fs.emit(Instruction::Const { dest, ty, value });
        Value::Temp(dest)
    }

    fn lower_operator(&mut self, fs: &mut FunctionState, op: &ast::OperatorExpr) -> Value {
        let ty = self.types.get(op.id).cloned().unwrap_or(Type::Failure);
        if op.operands.len() == 1 {
            let operand = self.lower_expr(fs, &op.operands[0]);
            let unop = match op.operator.as_str() {
                "!" => UnOp::Not,
                "-" | "neg" => UnOp::Neg,
                _ => UnOp::Not,
            };
            let dest = fs.fresh_value();
            fs.emit(Instruction::Unary { dest, ty, op: unop, operand });
            return Value::Temp(dest);
        }
        let lhs = self.lower_expr(fs, &op.operands[0]);
        let rhs = self.lower_expr(fs, &op.operands[1]);
        let binop = binop_for_operator(&op.operator).unwrap_or(BinOp::Add);
        let dest = fs.fresh_value();
        fs.emit(Instruction::Binary { dest, ty, op: binop, lhs, rhs });
        Value::Temp(dest)
    }

    fn try_storage_chain(&mut self, fs: &mut FunctionState, expr: &Expression) -> Option<(Value, Type)> {
        match expr {
            Expression::Identifier(id) if fs.lookup(&id.name).is_none() => {
                self.storage.get(&id.name).map(|info| (Value::Const(ConstValue::Uint(info.slot as u64)), info.ty.clone()))
            }
            Expression::Access(a) => {
                if matches!(&a.kind, AccessKind::Member { name } if name == "length") {
                    return None;
                }
                let (base_value, base_ty) = self.try_storage_chain(fs, &a.base)?;
                match &a.kind {
                    AccessKind::Member { name } => {
                        let Type::Struct(s) = &base_ty else { return None };
                        let field = s.field(name)?.clone();
                        let dest = fs.fresh_value();
                        fs.emit(Instruction::ComputeSlot {
                            dest,
                            computation: SlotComputation::Field { base: base_value, field_offset: field.byte_offset },
                        });
                        Some((Value::Temp(dest), field.ty))
                    }
                    AccessKind::Index { index } => match &base_ty {
                        Type::Mapping { value, .. } => {
                            let key_value = self.lower_expr(fs, index);
                            let dest = fs.fresh_value();
                            fs.emit(Instruction::ComputeSlot {
                                dest,
                                computation: SlotComputation::Mapping { base: base_value, key: key_value },
                            });
                            Some((Value::Temp(dest), (**value).clone()))
                        }
                        Type::Array { element, .. } => {
                            let base_dest = fs.fresh_value();
                            fs.emit(Instruction::ComputeSlot {
                                dest: base_dest,
                                computation: SlotComputation::Array { base: base_value },
                            });
                            let index_value = self.lower_expr(fs, index);
                            let slot_dest = fs.fresh_value();
                            fs.emit(Instruction::Binary {
                                dest: slot_dest,
                                ty: Type::Uint(256),
                                op: BinOp::Add,
                                lhs: Value::Temp(base_dest),
                                rhs: index_value,
                            });
                            Some((Value::Temp(slot_dest), (**element).clone()))
                        }
                        _ => None,
                    },
                    AccessKind::Slice { .. } => None,
                }
            }
            _ => None,
        }
    }

    fn lower_access(&mut self, fs: &mut FunctionState, expr: &Expression, a: &ast::AccessExpr) -> Value {
        if let AccessKind::Member { name } = &a.kind {
            if name == "length" {
                return self.lower_length(fs, expr, &a.base);
            }
        }
        if let Some((slot_value, field_ty)) = self.try_storage_chain(fs, expr) {
            let dest = fs.fresh_value();
            fs.emit(Instruction::Read {
                dest,
                ty: field_ty,
                location: Location::Storage,
                slot: Some(slot_value),
                offset: None,
                length: None,
            });
            return Value::Temp(dest);
        }
        let result_ty = self.types.get(expr.id()).cloned().unwrap_or(Type::Failure);
        let base_ty = self.types.get(a.base.id()).cloned().unwrap_or(Type::Failure);
        match &a.kind {
            AccessKind::Slice { start, end } => {
                let base_value = self.lower_expr(fs, &a.base);
                let start_value = self.lower_expr(fs, start);
                let end_value = self.lower_expr(fs, end);
                let dest = fs.fresh_value();
                fs.emit(Instruction::Slice { dest, operand: base_value, start: start_value, end: end_value });
                Value::Temp(dest)
            }
            AccessKind::Index { index } if needs_length_prefixed_buffer(&base_ty) => {
                self.lower_dynamic_bytes_index(fs, index, a, result_ty)
            }
            _ => {
                let base_value = self.lower_expr(fs, &a.base);
                let offset = self.memory_offset_for_access(fs, a);
                let ptr_dest = fs.fresh_value();
                fs.emit(Instruction::ComputeOffset { dest: ptr_dest, base: base_value, offset });
                let dest = fs.fresh_value();
                fs.emit(Instruction::Read {
                    dest,
                    ty: result_ty,
                    location: Location::Memory,
                    slot: None,
                    offset: Some(Value::Temp(ptr_dest)),
                    length: None,
                });
                Value::Temp(dest)
            }
        }
    }

    /// Indexes a single byte out of a length-prefixed dynamic `bytes`
    /// buffer: the payload is packed 32 real bytes per word starting at
    /// `base + 32` (the same layout `allocate_length_prefixed_buffer` and
    /// `emit_slice` use), so the target byte lives in word `index / 32` at
    /// in-word position `index % 32`, extracted with the EVM's native
    /// `BYTE` opcode rather than a shift/mask the IR has no ops for.
    fn lower_dynamic_bytes_index(&mut self, fs: &mut FunctionState, index: &Expression, a: &ast::AccessExpr, result_ty: Type) -> Value {
        let base_value = self.lower_expr(fs, &a.base);
        let index_value = self.lower_expr(fs, index);
        let word_index = fs.fresh_value();
        fs.emit(Instruction::Binary {
            dest: word_index,
            ty: Type::Uint(256),
            op: BinOp::Div,
            lhs: index_value.clone(),
            rhs: Value::Const(ConstValue::Uint(32)),
        });
        let word_byte_offset = fs.fresh_value();
        fs.emit(Instruction::Binary {
            dest: word_byte_offset,
            ty: Type::Uint(256),
            op: BinOp::Mul,
            lhs: Value::Temp(word_index),
            rhs: Value::Const(ConstValue::Uint(32)),
        });
        let total_offset = fs.fresh_value();
        fs.emit(Instruction::Binary {
            dest: total_offset,
            ty: Type::Uint(256),
            op: BinOp::Add,
            lhs: Value::Temp(word_byte_offset),
            rhs: Value::Const(ConstValue::Uint(32)),
        });
        let ptr_dest = fs.fresh_value();
        fs.emit(Instruction::ComputeOffset { dest: ptr_dest, base: base_value, offset: Value::Temp(total_offset) });
        let word_dest = fs.fresh_value();
        fs.emit(Instruction::Read {
            dest: word_dest,
            ty: Type::Bytes(Some(32)),
            location: Location::Memory,
            slot: None,
            offset: Some(Value::Temp(ptr_dest)),
            length: None,
        });
        let byte_in_word = fs.fresh_value();
        fs.emit(Instruction::Binary {
            dest: byte_in_word,
            ty: Type::Uint(256),
            op: BinOp::Mod,
            lhs: index_value,
            rhs: Value::Const(ConstValue::Uint(32)),
        });
        let dest = fs.fresh_value();
        fs.emit(Instruction::Binary { dest, ty: result_ty, op: BinOp::Byte, lhs: Value::Temp(byte_in_word), rhs: Value::Temp(word_dest) });
        Value::Temp(dest)
    }

    fn lower_length(&mut self, fs: &mut FunctionState, expr: &Expression, base: &Expression) -> Value {
        let ty = self.types.get(expr.id()).cloned().unwrap_or(Type::Failure);
        if let Some((slot_value, _)) = self.try_storage_chain(fs, base) {
            let dest = fs.fresh_value();
            fs.emit(Instruction::Read {
                dest,
                ty,
                location: Location::Storage,
                slot: Some(slot_value),
                offset: None,
                length: None,
            });
            return Value::Temp(dest);
        }
        let base_value = self.lower_expr(fs, base);
        let dest = fs.fresh_value();
        fs.emit(Instruction::Length { dest, operand: base_value });
        Value::Temp(dest)
    }

    fn lower_call(&mut self, fs: &mut FunctionState, expr: &Expression, call: &ast::CallExpr) -> Value {
        let ty = self.types.get(expr.id()).cloned().unwrap_or(Type::Failure);
        if call.callee == "keccak256" {
            let operand = self.lower_expr(fs, &call.arguments[0]);
            let dest = fs.fresh_value();
            fs.emit(Instruction::Hash { dest, operand });
            return Value::Temp(dest);
        }
        let arguments: Vec<Value> = call.arguments.iter().map(|a| self.lower_expr(fs, a)).collect();
        let dest = fs.fresh_value();
        fs.emit(Instruction::Call {
            dest: Some(dest),
            ty: Some(ty),
            callee: call.callee.clone(),
            arguments,
        });
        Value::Temp(dest)
    }

    fn lower_cast(&mut self, fs: &mut FunctionState, expr: &Expression, cast: &ast::CastExpr) -> Value {
        let ty = self.types.get(expr.id()).cloned().unwrap_or(Type::Failure);
        let operand = self.lower_expr(fs, &cast.operand);
        let dest = fs.fresh_value();
        fs.emit(Instruction::Cast { dest, ty, operand });
        Value::Temp(dest)
    }

    fn lower_special(&mut self, fs: &mut FunctionState, expr: &Expression, special: &ast::SpecialExpr) -> Value {
        let ty = self.types.get(expr.id()).cloned().unwrap_or(Type::Failure);
        let kind = match special.kind {
            ast::SpecialKind::MsgSender => EnvKind::MsgSender,
            ast::SpecialKind::MsgValue => EnvKind::MsgValue,
            ast::SpecialKind::MsgData => EnvKind::MsgData,
            ast::SpecialKind::BlockTimestamp => EnvKind::BlockTimestamp,
            ast::SpecialKind::BlockNumber => EnvKind::BlockNumber,
        };
        let dest = fs.fresh_value();
        fs.emit(Instruction::Env { dest, ty, kind });
        Value::Temp(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;
    use crate::diagnostics::SourceSpan;
    use crate::typechecker::TypeChecker;

    fn counter_program() -> Program {
        let mut ids = IdGen::new();
        let storage_ty = TypeExpr::Elementary { id: ids.next(), kind: ElementaryKind::Uint, bits: Some(256) };
        let count_ident = |ids: &mut IdGen| {
            Expression::Identifier(IdentifierExpr { id: ids.next(), name: "count".into(), span: None })
        };
        let one = Expression::Literal(LiteralExpr {
            id: ids.next(),
            kind: LiteralKind::Number,
            value: "1".into(),
            unit: None,
            span: None,
        });
        Program {
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
                    target: count_ident(&mut ids),
                    value: Expression::Operator(OperatorExpr {
                        id: ids.next(),
                        operator: "+".into(),
                        operands: vec![count_ident(&mut ids), one],
                        span: None,
                    }),
                    span: None,
                }))],
                span: None,
            }),
        }
    }

    #[test]
    fn counter_body_reads_adds_and_writes_one_storage_slot() {
        let program = counter_program();
        let result = TypeChecker::new().check_program(&program);
        assert!(!result.diagnostics.has_errors());

        let (module, diags) = generate(&program, &result.types);
        assert!(!diags.has_errors());
        let main = module.main.expect("body lowers to main");
        let block = &main.blocks[0];
        let reads = block.instructions.iter().filter(|i| matches!(i, Instruction::Read { .. })).count();
        let writes = block.instructions.iter().filter(|i| matches!(i, Instruction::Write { .. })).count();
        let adds = block
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Binary { op: BinOp::Add, .. }))
            .count();
        assert_eq!(reads, 1);
        assert_eq!(writes, 1);
        assert_eq!(adds, 1);
    }

    #[test]
    fn if_without_else_phis_the_merge_block() {
        let mut ids = IdGen::new();
        let storage_ty = TypeExpr::Elementary { id: ids.next(), kind: ElementaryKind::Address, bits: Some(160) };
        let program = Program {
            id: ids.next(),
            name: "Gate".into(),
            declarations: vec![Declaration::Storage(StorageDecl {
                id: ids.next(),
                name: "owner".into(),
                declared_type: storage_ty,
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
                                Expression::Special(SpecialExpr {
                                    id: ids.next(),
                                    kind: SpecialKind::MsgSender,
                                    span: None,
                                }),
                                Expression::Identifier(IdentifierExpr {
                                    id: ids.next(),
                                    name: "owner".into(),
                                    span: None,
                                }),
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
                        span: Some(SourceSpan::new(0, 1)),
                    },
                }))],
                span: None,
            }),
        };
        let result = TypeChecker::new().check_program(&program);
        assert!(!result.diagnostics.has_errors(), "{:?}", result.diagnostics.errors);
        let (module, diags) = generate(&program, &result.types);
        assert!(!diags.has_errors());
        let main = module.main.unwrap();
        assert_eq!(main.blocks.len(), 3, "entry, then, merge");
        let then_block = &main.blocks[1];
        assert!(matches!(then_block.terminator, Terminator::Return { value: None }));
    }
}
