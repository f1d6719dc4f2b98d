//! Type checker (spec.md §4.1, component C2).
//!
//! A single visitor walks the program in lexical order, assigning a
//! [`Type`] to every expression node and recording it in a [`Types`] table
//! keyed by [`Id`]. Error recovery synthesizes [`Type::Failure`] so checking
//! always reaches the end of the file and reports everything it can in one
//! pass, the way `seqc`'s own checker keeps walking after a bad word call
//! instead of aborting.

use crate::ast::*;
use crate::diagnostics::{codes, Diagnostic, DiagnosticBag};
use crate::types::{self, StructField, StructType, Type, Types};
use std::collections::HashMap;

/// Nested, nameable scopes: frame 0 is the module frame (storage names);
/// each pushed frame is a block or function scope. Lookup walks innermost
/// to outermost, matching spec.md §4.1's "scoped symbol table (nested
/// immutable maps, one frame per block and function, plus a module frame)".
struct SymbolTable {
    frames: Vec<HashMap<String, Type>>,
}

impl SymbolTable {
    fn new() -> Self {
        SymbolTable {
            frames: vec![HashMap::new()],
        }
    }

    fn push(&mut self) {
        self.frames.push(HashMap::new());
    }

    fn pop(&mut self) {
        self.frames.pop();
        debug_assert!(!self.frames.is_empty(), "module frame must never be popped");
    }

    fn define(&mut self, name: &str, ty: Type) {
        self.frames
            .last_mut()
            .expect("at least one frame")
            .insert(name.to_string(), ty);
    }

    fn lookup(&self, name: &str) -> Option<&Type> {
        self.frames.iter().rev().find_map(|f| f.get(name))
    }
}

#[derive(Clone)]
struct FunctionSig {
    parameters: Vec<Type>,
    return_type: Option<Type>,
}

/// Output of [`TypeChecker::check_program`].
pub struct CheckResult {
    pub types: Types,
    pub diagnostics: DiagnosticBag,
}

pub struct TypeChecker {
    scopes: SymbolTable,
    structs: HashMap<String, StructType>,
    functions: HashMap<String, FunctionSig>,
    types: Types,
    diagnostics: DiagnosticBag,
    current_return_type: Option<Type>,
}

impl Default for TypeChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeChecker {
    pub fn new() -> Self {
        TypeChecker {
            scopes: SymbolTable::new(),
            structs: HashMap::new(),
            functions: HashMap::new(),
            types: Types::new(),
            diagnostics: DiagnosticBag::new(),
            current_return_type: None,
        }
    }

    /// Contract: input `Program`, output `Types` + diagnostics. Failure iff
    /// any Error-severity diagnostic was produced (spec.md §4.1 contract).
    pub fn check_program(mut self, program: &Program) -> CheckResult {
        let span = tracing::info_span!("typecheck", program = %program.name);
        let _enter = span.enter();

        self.register_structs(program);
        self.register_storage(program);
        self.register_functions(program);

        for decl in &program.declarations {
            if let Declaration::Function(f) = decl {
                self.check_function(f);
            }
        }

        if let Some(create) = &program.create {
            self.current_return_type = None;
            self.scopes.push();
            self.check_block(create);
            self.scopes.pop();
        }

        if let Some(body) = &program.body {
            self.current_return_type = None;
            self.scopes.push();
            self.check_block(body);
            self.scopes.pop();
        }

        tracing::debug!(
            errors = self.diagnostics.errors.len(),
            warnings = self.diagnostics.warnings.len(),
            "typecheck complete"
        );

        CheckResult {
            types: self.types,
            diagnostics: self.diagnostics,
        }
    }

    fn register_structs(&mut self, program: &Program) {
        for decl in &program.declarations {
            if let Declaration::Struct(s) = decl {
                let mut fields = Vec::new();
                let mut offset = 0u32;
                for field in &s.fields {
                    let ty = types::resolve_type_expr(&field.declared_type, &self.structs);
                    fields.push(StructField {
                        name: field.name.clone(),
                        ty,
                        byte_offset: offset,
                    });
                    offset += 32;
                }
                self.structs.insert(
                    s.name.clone(),
                    StructType {
                        name: s.name.clone(),
                        fields,
                    },
                );
            }
        }
    }

    fn register_storage(&mut self, program: &Program) {
        for decl in &program.declarations {
            if let Declaration::Storage(s) = decl {
                let ty = types::resolve_type_expr(&s.declared_type, &self.structs);
                self.scopes.define(&s.name, ty);
            }
        }
    }

    fn register_functions(&mut self, program: &Program) {
        for decl in &program.declarations {
            if let Declaration::Function(f) = decl {
                let parameters = f
                    .parameters
                    .iter()
                    .map(|p| types::resolve_type_expr(&p.declared_type, &self.structs))
                    .collect();
                let return_type = f.return_type.as_ref().map(|t| types::resolve_type_expr(t, &self.structs));
                self.functions
                    .insert(f.name.clone(), FunctionSig { parameters, return_type });
            }
        }
    }

    fn check_function(&mut self, f: &FunctionDecl) {
        self.scopes.push();
        let sig = self.functions.get(&f.name).cloned();
        if let Some(sig) = &sig {
            for (param, ty) in f.parameters.iter().zip(&sig.parameters) {
                self.scopes.define(&param.name, ty.clone());
            }
            self.current_return_type = sig.return_type.clone();
        }
        self.check_block(&f.body);
        self.scopes.pop();
    }

    fn check_block(&mut self, block: &Block) {
        for item in &block.items {
            match item {
                BlockItem::Stmt(s) => self.check_statement(s),
                BlockItem::Decl(_) => {
                    // Nested declarations inside a block (e.g. struct defs)
                    // were already registered at the module level.
                }
            }
        }
    }

    fn check_statement(&mut self, stmt: &Statement) {
        match stmt {
            Statement::Declare(d) => self.check_declare(d),
            Statement::Assign(a) => self.check_assign(a),
            Statement::ControlFlow(cf) => self.check_control_flow(cf),
            Statement::Express(e) => {
                self.check_expr(&e.expr);
            }
        }
    }

    fn check_declare(&mut self, d: &DeclareStmt) {
        let init_ty = d.initializer.as_ref().map(|e| self.check_expr(e));
        let declared = d.declared_type.as_ref().map(|t| types::resolve_type_expr(t, &self.structs));
        let ty = match (declared, init_ty) {
            (Some(declared), Some(init_ty)) => {
                let is_literal = matches!(d.initializer, Some(Expression::Literal(_)));
                if !declared.is_assignable_from(&init_ty, is_literal) {
                    self.error_type_mismatch(d.span, &declared, &init_ty);
                }
                declared
            }
            (Some(declared), None) => declared,
            (None, Some(init_ty)) => init_ty,
            (None, None) => Type::Failure,
        };
        self.scopes.define(&d.name, ty);
    }

    fn check_assign(&mut self, a: &AssignStmt) {
        let value_ty = self.check_expr(&a.value);
        let target_ty = self.check_expr(&a.target);
        let is_literal = matches!(a.value, Expression::Literal(_));
        if !matches!(target_ty, Type::Failure)
            && !target_ty.is_assignable_from(&value_ty, is_literal)
        {
            self.error_type_mismatch(a.span, &target_ty, &value_ty);
        }
    }

    fn check_control_flow(&mut self, cf: &ControlFlowStmt) {
        match &cf.kind {
            ControlFlowKind::If { condition, then_branch, else_branch, span } => {
                let cond_ty = self.check_expr(condition);
                if cond_ty != Type::Bool && cond_ty != Type::Failure {
                    self.error_type_mismatch(*span, &Type::Bool, &cond_ty);
                }
                self.scopes.push();
                self.check_block(then_branch);
                self.scopes.pop();
                if let Some(else_branch) = else_branch {
                    self.scopes.push();
                    self.check_block(else_branch);
                    self.scopes.pop();
                }
            }
            ControlFlowKind::For { init, condition, update, body, span } => {
                self.scopes.push();
                if let Some(init) = init {
                    self.check_statement(init);
                }
                if let Some(condition) = condition {
                    let cond_ty = self.check_expr(condition);
                    if cond_ty != Type::Bool && cond_ty != Type::Failure {
                        self.error_type_mismatch(*span, &Type::Bool, &cond_ty);
                    }
                }
                self.scopes.push();
                self.check_block(body);
                self.scopes.pop();
                if let Some(update) = update {
                    self.check_statement(update);
                }
                self.scopes.pop();
            }
            ControlFlowKind::While { condition, body, span } => {
                let cond_ty = self.check_expr(condition);
                if cond_ty != Type::Bool && cond_ty != Type::Failure {
                    self.error_type_mismatch(*span, &Type::Bool, &cond_ty);
                }
                self.scopes.push();
                self.check_block(body);
                self.scopes.pop();
            }
            ControlFlowKind::Return { value, span } => {
                let value_ty = value.as_ref().map(|v| self.check_expr(v));
                match (&self.current_return_type, value_ty) {
                    (Some(expected), Some(actual)) => {
                        let is_literal = matches!(value, Some(Expression::Literal(_)));
                        if !expected.is_assignable_from(&actual, is_literal) {
                            let expected = expected.clone();
                            self.error_type_mismatch(*span, &expected, &actual);
                        }
                    }
                    (Some(expected), None) => {
                        let expected = expected.clone();
                        self.error_type_mismatch(*span, &expected, &Type::Failure);
                    }
                    (None, Some(actual)) => {
                        self.error_type_mismatch(*span, &Type::Failure, &actual);
                    }
                    (None, None) => {}
                }
            }
            // Legality of break/continue outside a loop is enforced by the
            // IR generator (spec.md §4.2.1), which is the stage that tracks
            // the active loop-context stack.
            ControlFlowKind::Break { .. } | ControlFlowKind::Continue { .. } => {}
        }
    }

    fn check_expr(&mut self, expr: &Expression) -> Type {
        let ty = match expr {
            Expression::Identifier(e) => self.check_identifier(e),
            Expression::Literal(e) => self.check_literal(e),
            Expression::Operator(e) => self.check_operator(e),
            Expression::Access(e) => self.check_access(e),
            Expression::Call(e) => self.check_call(e),
            Expression::Cast(e) => self.check_cast(e),
            Expression::Special(e) => self.check_special(e),
        };
        self.types.insert(expr.id(), ty.clone());
        ty
    }

    fn check_identifier(&mut self, e: &IdentifierExpr) -> Type {
        match self.scopes.lookup(&e.name) {
            Some(ty) => ty.clone(),
            None => {
                self.diagnostics.push(Diagnostic::error(
                    codes::UNDEFINED_VARIABLE,
                    format!("undefined variable '{}'", e.name),
                    e.span,
                ));
                Type::Failure
            }
        }
    }

    fn check_literal(&mut self, e: &LiteralExpr) -> Type {
        match e.kind {
            LiteralKind::Number => Type::Uint(256),
            LiteralKind::Boolean => Type::Bool,
            LiteralKind::String => Type::String,
            LiteralKind::Address => Type::Address,
            LiteralKind::Hex => {
                let digits = e.value.trim_start_matches("0x").len();
                let n = digits.div_ceil(2);
                if n <= 32 {
                    Type::Bytes(Some(n as u16))
                } else {
                    Type::Bytes(None)
                }
            }
        }
    }

    fn check_operator(&mut self, e: &OperatorExpr) -> Type {
        let operand_types: Vec<Type> = e.operands.iter().map(|op| self.check_expr(op)).collect();
        match e.operator.as_str() {
            "+" | "-" | "*" | "/" | "%" => {
                if operand_types.len() != 2 {
                    return self.error_invalid_operation(e.span, &e.operator);
                }
                self.numeric_common_type(e.span, &operand_types[0], &operand_types[1])
            }
            "neg" if operand_types.len() == 1 => {
                if !operand_types[0].is_integer() && operand_types[0] != Type::Failure {
                    self.error_invalid_operand(e.span, &operand_types[0]);
                    return Type::Failure;
                }
                operand_types[0].clone()
            }
            "<" | ">" | "<=" | ">=" => {
                if operand_types.len() != 2 {
                    return self.error_invalid_operation(e.span, &e.operator);
                }
                let common = self.numeric_common_type(e.span, &operand_types[0], &operand_types[1]);
                if common == Type::Failure {
                    Type::Failure
                } else {
                    Type::Bool
                }
            }
            "==" | "!=" => {
                if operand_types.len() != 2 {
                    return self.error_invalid_operation(e.span, &e.operator);
                }
                let (a, b) = (&operand_types[0], &operand_types[1]);
                let ok = a.is_assignable_from(b, false) || b.is_assignable_from(a, false);
                if !ok && *a != Type::Failure && *b != Type::Failure {
                    self.error_type_mismatch(e.span, a, b);
                }
                Type::Bool
            }
            "&&" | "||" => {
                for t in &operand_types {
                    if *t != Type::Bool && *t != Type::Failure {
                        self.error_invalid_operand(e.span, t);
                    }
                }
                Type::Bool
            }
            "!" => {
                if operand_types.len() == 1 {
                    if operand_types[0] != Type::Bool && operand_types[0] != Type::Failure {
                        self.error_invalid_operand(e.span, &operand_types[0]);
                    }
                    Type::Bool
                } else {
                    self.error_invalid_operation(e.span, &e.operator)
                }
            }
            other => self.error_invalid_operation(e.span, other),
        }
    }

    fn numeric_common_type(&mut self, span: Option<crate::diagnostics::SourceSpan>, a: &Type, b: &Type) -> Type {
        if *a == Type::Failure || *b == Type::Failure {
            return Type::Failure;
        }
        if !a.is_integer() || !b.is_integer() {
            self.error_invalid_operand(span, if a.is_integer() { b } else { a });
            return Type::Failure;
        }
        if a.is_signed_integer() != b.is_signed_integer() {
            self.error_type_mismatch(span, a, b);
            return Type::Failure;
        }
        let bits = a.integer_bits().unwrap().max(b.integer_bits().unwrap());
        if a.is_signed_integer() {
            Type::Int(bits)
        } else {
            Type::Uint(bits)
        }
    }

    fn check_access(&mut self, e: &AccessExpr) -> Type {
        let base_ty = self.check_expr(&e.base);
        if base_ty == Type::Failure {
            return Type::Failure;
        }
        match &e.kind {
            AccessKind::Member { name } if name == "length" => {
                if matches!(base_ty, Type::Array { .. }) || base_ty.is_dynamic_bytes_like() {
                    Type::Uint(256)
                } else {
                    self.error_not_indexable(e.span, &base_ty)
                }
            }
            AccessKind::Member { name } => match &base_ty {
                Type::Struct(s) => match s.field(name) {
                    Some(f) => f.ty.clone(),
                    None => {
                        self.diagnostics.push(Diagnostic::error(
                            codes::NO_SUCH_FIELD,
                            format!("struct '{}' has no field '{}'", s.name, name),
                            e.span,
                        ));
                        Type::Failure
                    }
                },
                _ => self.error_not_indexable(e.span, &base_ty),
            },
            AccessKind::Index { index } => {
                let index_ty = self.check_expr(index);
                match &base_ty {
                    Type::Array { element, .. } => {
                        if !index_ty.is_integer() && index_ty != Type::Failure {
                            self.error_invalid_index_type(e.span, &index_ty);
                        }
                        (**element).clone()
                    }
                    Type::Mapping { key, value } => {
                        if !key.is_assignable_from(&index_ty, false) && index_ty != Type::Failure {
                            self.error_invalid_index_type(e.span, &index_ty);
                        }
                        (**value).clone()
                    }
                    Type::Bytes(_) => {
                        if !index_ty.is_integer() && index_ty != Type::Failure {
                            self.error_invalid_index_type(e.span, &index_ty);
                        }
                        Type::Uint(8)
                    }
                    _ => self.error_not_indexable(e.span, &base_ty),
                }
            }
            AccessKind::Slice { start, end } => {
                let start_ty = self.check_expr(start);
                let end_ty = self.check_expr(end);
                if !matches!(base_ty, Type::Bytes(_)) {
                    return self.error_not_indexable(e.span, &base_ty);
                }
                if !start_ty.is_integer() && start_ty != Type::Failure {
                    self.error_invalid_index_type(e.span, &start_ty);
                }
                if !end_ty.is_integer() && end_ty != Type::Failure {
                    self.error_invalid_index_type(e.span, &end_ty);
                }
                Type::Bytes(None)
            }
        }
    }

    fn check_call(&mut self, e: &CallExpr) -> Type {
        let arg_types: Vec<Type> = e.arguments.iter().map(|a| self.check_expr(a)).collect();
        if e.callee == "keccak256" {
            if arg_types.len() != 1 {
                self.diagnostics.push(Diagnostic::error(
                    codes::INVALID_ARGUMENT_COUNT,
                    format!("keccak256 expects 1 argument, got {}", arg_types.len()),
                    e.span,
                ));
                return Type::Failure;
            }
            let arg = &arg_types[0];
            if !matches!(arg, Type::Bytes(_) | Type::String) && *arg != Type::Failure {
                self.error_invalid_operand(e.span, arg);
            }
            return Type::Bytes(Some(32));
        }

        let Some(sig) = self.functions.get(&e.callee).cloned() else {
            self.diagnostics.push(Diagnostic::error(
                codes::UNDEFINED_VARIABLE,
                format!("call to undefined function '{}'", e.callee),
                e.span,
            ));
            return Type::Failure;
        };
        if sig.parameters.len() != arg_types.len() {
            self.diagnostics.push(Diagnostic::error(
                codes::INVALID_ARGUMENT_COUNT,
                format!(
                    "'{}' expects {} argument(s), got {}",
                    e.callee,
                    sig.parameters.len(),
                    arg_types.len()
                ),
                e.span,
            ));
            return sig.return_type.unwrap_or(Type::Failure);
        }
        for (param, (arg, arg_expr)) in sig
            .parameters
            .iter()
            .zip(arg_types.iter().zip(e.arguments.iter()))
        {
            let is_literal = matches!(arg_expr, Expression::Literal(_));
            if !param.is_assignable_from(arg, is_literal) && *arg != Type::Failure {
                self.error_type_mismatch(e.span, param, arg);
            }
        }
        sig.return_type.unwrap_or(Type::Failure)
    }

    fn check_cast(&mut self, e: &CastExpr) -> Type {
        let operand_ty = self.check_expr(&e.operand);
        let target_ty = types::resolve_type_expr(&e.target_type, &self.structs);
        if operand_ty == Type::Failure {
            return target_ty;
        }
        let allowed = match (&operand_ty, &target_ty) {
            (a, b) if a.is_integer() && b.is_integer() => true,
            (a, Type::Address) if a.is_integer() => true,
            (Type::Address, b) if b.is_integer() => true,
            (Type::Bytes(_), Type::Bytes(_)) => true,
            (Type::Bytes(_), Type::Address) | (Type::Address, Type::Bytes(_)) => true,
            (Type::Bytes(_), b) if b.is_integer() => true,
            (a, Type::Bytes(_)) if a.is_integer() => true,
            (Type::String, Type::Bytes(_)) | (Type::Bytes(_), Type::String) => true,
            _ => false,
        };
        if !allowed {
            self.diagnostics.push(Diagnostic::error(
                codes::INVALID_TYPE_CAST,
                format!("cannot cast {operand_ty} to {target_ty}"),
                e.span,
            ));
        }
        target_ty
    }

    fn check_special(&mut self, e: &SpecialExpr) -> Type {
        match e.kind {
            SpecialKind::MsgSender => Type::Address,
            SpecialKind::MsgValue | SpecialKind::BlockTimestamp | SpecialKind::BlockNumber => {
                Type::Uint(256)
            }
            SpecialKind::MsgData => Type::Bytes(None),
        }
    }

    fn error_type_mismatch(
        &mut self,
        span: Option<crate::diagnostics::SourceSpan>,
        expected: &Type,
        actual: &Type,
    ) {
        self.diagnostics.push(
            Diagnostic::error(
                codes::TYPE_MISMATCH,
                format!("expected {expected}, found {actual}"),
                span,
            )
            .with_types(expected.to_string(), actual.to_string()),
        );
    }

    fn error_invalid_operand(&mut self, span: Option<crate::diagnostics::SourceSpan>, actual: &Type) {
        self.diagnostics.push(Diagnostic::error(
            codes::INVALID_OPERAND,
            format!("invalid operand type {actual}"),
            span,
        ));
    }

    fn error_invalid_operation(&mut self, span: Option<crate::diagnostics::SourceSpan>, op: &str) -> Type {
        self.diagnostics.push(Diagnostic::error(
            codes::INVALID_OPERATION,
            format!("invalid operation '{op}'"),
            span,
        ));
        Type::Failure
    }

    fn error_not_indexable(&mut self, span: Option<crate::diagnostics::SourceSpan>, ty: &Type) -> Type {
        self.diagnostics.push(Diagnostic::error(
            codes::NOT_INDEXABLE,
            format!("type {ty} is not indexable"),
            span,
        ));
        Type::Failure
    }

    fn error_invalid_index_type(&mut self, span: Option<crate::diagnostics::SourceSpan>, ty: &Type) {
        self.diagnostics.push(Diagnostic::error(
            codes::INVALID_INDEX_TYPE,
            format!("invalid index type {ty}"),
            span,
        ));
    }
}
