//! Semantic type lattice and the `Types` table (spec.md §3 "Type lattice",
//! §4.1 contract).
//!
//! This is deliberately a separate algebra from [`crate::ast::TypeExpr`]
//! (the syntactic type as written in source): the type checker resolves
//! every `TypeExpr` and every expression into one of these before handing
//! the program to the IR generator.

use crate::ast;
use crate::ast::Id;
use std::collections::HashMap;
use std::fmt;

/// One field of a struct type, with its byte offset already computed
/// (spec.md §3 "Storage layout": `base + (fieldByteOffset/32)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructField {
    pub name: String,
    pub ty: Type,
    pub byte_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<StructField>,
}

impl StructType {
    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// The semantic type lattice. Elementary types carry their bit widths;
/// `Failure` is the distinguished type synthesized by the checker for
/// error recovery so later expressions can keep being checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Uint(u16),
    Int(u16),
    Address,
    Bool,
    /// `Some(n)` is a fixed-size `bytesN` (n in 1..=32); `None` is dynamic
    /// `bytes`.
    Bytes(Option<u16>),
    String,
    Fixed(u16),
    Ufixed(u16),
    Array {
        element: Box<Type>,
        size: Option<u64>,
    },
    Mapping {
        key: Box<Type>,
        value: Box<Type>,
    },
    Struct(Box<StructType>),
    Function {
        parameters: Vec<Type>,
        return_type: Option<Box<Type>>,
    },
    /// Placeholder synthesized after a type error so that checking can
    /// continue producing as many diagnostics as possible in one pass.
    Failure,
}

impl Type {
    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Uint(_) | Type::Int(_))
    }

    pub fn is_signed_integer(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    pub fn integer_bits(&self) -> Option<u16> {
        match self {
            Type::Uint(b) | Type::Int(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_dynamic_bytes_like(&self) -> bool {
        matches!(self, Type::Bytes(None) | Type::String)
    }

    pub fn is_indexable(&self) -> bool {
        matches!(
            self,
            Type::Array { .. } | Type::Mapping { .. } | Type::Bytes(_)
        )
    }

    /// Two types are assignable iff equal, or `src` is an unconstrained
    /// literal that fits `dst`'s domain, or both are integers where `dst`'s
    /// width dominates `src`'s and signedness matches (spec.md §3).
    pub fn is_assignable_from(&self, src: &Type, src_is_literal: bool) -> bool {
        let dst = self;
        if dst == src {
            return true;
        }
        if src_is_literal {
            match (dst, src) {
                (Type::Uint(_) | Type::Int(_), Type::Uint(_)) => return true,
                (Type::Address, Type::Uint(_)) => return true,
                (Type::Bytes(_), Type::Bytes(_)) => return true,
                _ => {}
            }
        }
        match (dst, src) {
            (Type::Uint(db), Type::Uint(sb)) => db >= sb,
            (Type::Int(db), Type::Int(sb)) => db >= sb,
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Uint(b) => write!(f, "uint{b}"),
            Type::Int(b) => write!(f, "int{b}"),
            Type::Address => write!(f, "address"),
            Type::Bool => write!(f, "bool"),
            Type::Bytes(Some(n)) => write!(f, "bytes{n}"),
            Type::Bytes(None) => write!(f, "bytes"),
            Type::String => write!(f, "string"),
            Type::Fixed(b) => write!(f, "fixed{b}"),
            Type::Ufixed(b) => write!(f, "ufixed{b}"),
            Type::Array { element, size: Some(n) } => write!(f, "{element}[{n}]"),
            Type::Array { element, size: None } => write!(f, "{element}[]"),
            Type::Mapping { key, value } => write!(f, "mapping<{key}, {value}>"),
            Type::Struct(s) => write!(f, "{}", s.name),
            Type::Function { parameters, return_type } => {
                let params: Vec<_> = parameters.iter().map(|p| p.to_string()).collect();
                match return_type {
                    Some(r) => write!(f, "function({}) -> {r}", params.join(", ")),
                    None => write!(f, "function({})", params.join(", ")),
                }
            }
            Type::Failure => write!(f, "<error>"),
        }
    }
}

/// The `Types` map: every expression node's resolved [`Type`], keyed by its
/// stable [`Id`] (spec.md §4.1 contract).
#[derive(Debug, Clone, Default)]
pub struct Types {
    table: HashMap<Id, Type>,
}

impl Types {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: Id, ty: Type) {
        self.table.insert(id, ty);
    }

    pub fn get(&self, id: Id) -> Option<&Type> {
        self.table.get(&id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Id, &Type)> {
        self.table.iter()
    }
}

/// Resolves every struct declaration's field types up front, in source
/// order. Struct definitions may not forward-reference a struct declared
/// later in the same program (spec.md's grammar gives no forward-decl
/// mechanism for structs, matching the worked examples).
pub fn collect_struct_types(program: &ast::Program) -> HashMap<String, StructType> {
    let mut structs = HashMap::new();
    for decl in &program.declarations {
        if let ast::Declaration::Struct(s) = decl {
            let mut offset = 0u32;
            let fields = s
                .fields
                .iter()
                .map(|f| {
                    let ty = resolve_type_expr(&f.declared_type, &structs);
                    let field = StructField { name: f.name.clone(), ty, byte_offset: offset };
                    offset += 32;
                    field
                })
                .collect();
            structs.insert(s.name.clone(), StructType { name: s.name.clone(), fields });
        }
    }
    structs
}

/// Resolves a syntactic [`ast::TypeExpr`] to the semantic [`Type`] lattice,
/// shared by the type checker (C2) and the IR generator (C4) so both
/// stages agree on struct layout and elementary bit widths.
pub fn resolve_type_expr(te: &ast::TypeExpr, structs: &HashMap<String, StructType>) -> Type {
    match te {
        ast::TypeExpr::Elementary { kind, bits, .. } => match kind {
            ast::ElementaryKind::Uint => Type::Uint(bits.unwrap_or(256)),
            ast::ElementaryKind::Int => Type::Int(bits.unwrap_or(256)),
            ast::ElementaryKind::Address => Type::Address,
            ast::ElementaryKind::Bool => Type::Bool,
            ast::ElementaryKind::Bytes => Type::Bytes(*bits),
            ast::ElementaryKind::String => Type::String,
            ast::ElementaryKind::Fixed => Type::Fixed(bits.unwrap_or(128)),
            ast::ElementaryKind::Ufixed => Type::Ufixed(bits.unwrap_or(128)),
        },
        ast::TypeExpr::Complex { kind, .. } => match kind.as_ref() {
            ast::ComplexKind::Array { element, size } => Type::Array {
                element: Box::new(resolve_type_expr(element, structs)),
                size: *size,
            },
            ast::ComplexKind::Mapping { key, value } => Type::Mapping {
                key: Box::new(resolve_type_expr(key, structs)),
                value: Box::new(resolve_type_expr(value, structs)),
            },
            ast::ComplexKind::Struct { name } | ast::ComplexKind::Alias { name } => structs
                .get(name)
                .map(|s| Type::Struct(Box::new(s.clone())))
                .unwrap_or(Type::Failure),
            ast::ComplexKind::Function { parameters, return_type } => Type::Function {
                parameters: parameters.iter().map(|p| resolve_type_expr(p, structs)).collect(),
                return_type: return_type.as_ref().map(|r| Box::new(resolve_type_expr(r, structs))),
            },
            ast::ComplexKind::Tuple(_) | ast::ComplexKind::Contract { .. } | ast::ComplexKind::Enum { .. } => {
                Type::Failure
            }
        },
        ast::TypeExpr::Reference { name, .. } => structs
            .get(name)
            .map(|s| Type::Struct(Box::new(s.clone())))
            .unwrap_or(Type::Failure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_types_are_assignable() {
        assert!(Type::Uint(256).is_assignable_from(&Type::Uint(256), false));
    }

    #[test]
    fn literal_uint_widens_freely() {
        assert!(Type::Uint(8).is_assignable_from(&Type::Uint(256), true));
        assert!(Type::Address.is_assignable_from(&Type::Uint(160), true));
    }

    #[test]
    fn non_literal_widths_must_dominate_and_match_signedness() {
        assert!(Type::Uint(256).is_assignable_from(&Type::Uint(8), false));
        assert!(!Type::Uint(8).is_assignable_from(&Type::Uint(256), false));
        assert!(!Type::Int(256).is_assignable_from(&Type::Uint(256), false));
    }

    #[test]
    fn types_table_round_trips_by_id() {
        let mut table = Types::new();
        table.insert(Id(0), Type::Bool);
        assert_eq!(table.get(Id(0)), Some(&Type::Bool));
        assert_eq!(table.get(Id(1)), None);
    }
}
