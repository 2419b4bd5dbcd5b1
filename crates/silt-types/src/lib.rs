//! Struct type table and type resolution for the SILT IL.
//!
//! The table is built in two passes: names first, member validation second,
//! so mutually referential structs (a list node pointing at its own type)
//! need no declaration order. After the build the table is immutable and is
//! handed to every per-function pass as a plain shared reference; all queries
//! are pure.
//!
//! Declaration shape errors abort compilation of the whole program (every
//! function depends on the shared table). Member resolution also runs per
//! function through [`resolve_function`], so a bad member access aborts only
//! the function containing it.

use std::collections::{BTreeMap, BTreeSet};

use silt_diag::{Category, Diagnostic, SourceLocation};
use silt_il::{Code, Function, Instruction, RESERVED_TYPE_NAMES, Span, StructDef, Type};

/// Errors in struct declarations and member resolution.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("struct name `{name}` collides with a reserved or already declared type")]
    DuplicateName { name: String, span: Span },
    #[error("struct `{strct}` declares member `{member}` more than once")]
    DuplicateMember {
        strct: String,
        member: String,
        span: Span,
    },
    #[error("member `{member}` of struct `{strct}` has undeclarable type `{ty}`")]
    UnknownMemberType {
        strct: String,
        member: String,
        ty: Type,
        span: Span,
    },
    #[error("struct `{strct}` has no member `{member}`")]
    NoSuchMember {
        strct: String,
        member: String,
        span: Span,
    },
    #[error("type `{ty}` names struct `{name}`, which is never declared")]
    UnknownStruct { name: String, ty: Type, span: Span },
    #[error("`{var}` in function `{function}` has type `{ty}`, not a pointer to a struct")]
    NotAStructPointer {
        function: String,
        var: String,
        ty: Type,
        span: Span,
    },
    #[error("variable `{var}` in function `{function}` is never defined")]
    UndefinedVariable {
        function: String,
        var: String,
        span: Span,
    },
    #[error("variable `{var}` in function `{function}` is defined with conflicting types")]
    VariableTypeConflict {
        function: String,
        var: String,
        span: Span,
    },
}

impl ShapeError {
    pub fn span(&self) -> Span {
        match self {
            ShapeError::DuplicateName { span, .. }
            | ShapeError::DuplicateMember { span, .. }
            | ShapeError::UnknownMemberType { span, .. }
            | ShapeError::NoSuchMember { span, .. }
            | ShapeError::UnknownStruct { span, .. }
            | ShapeError::NotAStructPointer { span, .. }
            | ShapeError::UndefinedVariable { span, .. }
            | ShapeError::VariableTypeConflict { span, .. } => *span,
        }
    }

    pub fn category(&self) -> Category {
        match self {
            ShapeError::DuplicateName { .. } => Category::DuplicateName,
            ShapeError::DuplicateMember { .. } => Category::DuplicateMember,
            ShapeError::UnknownMemberType { .. } => Category::UnknownMemberType,
            ShapeError::NoSuchMember { .. } => Category::NoSuchMember,
            ShapeError::UnknownStruct { .. } => Category::MalformedProgram,
            ShapeError::NotAStructPointer { .. } => Category::TypeMismatch,
            ShapeError::UndefinedVariable { .. } => Category::UndefinedVariable,
            ShapeError::VariableTypeConflict { .. } => Category::MalformedProgram,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let diag = Diagnostic::error(self.category(), self.to_string()).at(location(self.span()));
        match self {
            ShapeError::DuplicateName { .. } => {
                diag.with_help("`int`, `bool`, and `ptr` are reserved; struct names must be unique")
            }
            ShapeError::UnknownMemberType { ty: Type::Named(_), .. } => {
                diag.with_help("struct-valued members are not supported; use `ptr<...>`")
            }
            _ => diag,
        }
    }
}

pub fn location(span: Span) -> SourceLocation {
    SourceLocation {
        file_id: span.file.0,
        start: span.start,
        end: span.end,
    }
}

// ---------------------------------------------------------------------------
// Struct table
// ---------------------------------------------------------------------------

/// A struct's definition plus its computed layout.
///
/// Layout has no padding: the byte offset of member *i* is the sum of the
/// sizes of members `0..i`, and `size` is the total. Scalar sizes are 8
/// bytes for `int` and pointers, 1 byte for `bool`.
#[derive(Debug, Clone, PartialEq)]
pub struct StructLayout {
    pub def: StructDef,
    offsets: Vec<u32>,
    pub size: u32,
}

impl StructLayout {
    pub fn member_offset(&self, index: usize) -> Option<u32> {
        self.offsets.get(index).copied()
    }
}

/// The struct type table: name to ordered member list with layout.
///
/// Read-only after [`StructTable::build`]; safe to share across parallel
/// per-function conversion and lowering work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructTable {
    structs: BTreeMap<String, StructLayout>,
}

/// Size in bytes of a scalar (non-struct) value of type `ty`.
pub fn scalar_size(ty: &Type) -> u32 {
    match ty {
        Type::Int => 8,
        Type::Bool => 1,
        // Named types never appear as member or variable types directly;
        // a bare Named reaching here is a pointer-sized address anyway.
        Type::Ptr(_) | Type::Named(_) => 8,
    }
}

impl StructTable {
    /// Build the table from all declarations at once.
    ///
    /// Pass one registers every name (rejecting reserved names and
    /// collisions); pass two validates member shapes against the complete
    /// name set, which is what makes forward and mutual references legal.
    pub fn build(defs: &[StructDef]) -> Result<Self, ShapeError> {
        let mut declared: BTreeSet<&str> = BTreeSet::new();
        for def in defs {
            if RESERVED_TYPE_NAMES.contains(&def.name.as_str()) || !declared.insert(&def.name) {
                return Err(ShapeError::DuplicateName {
                    name: def.name.clone(),
                    span: def.span,
                });
            }
        }

        let mut structs = BTreeMap::new();
        for def in defs {
            let mut seen: BTreeSet<&str> = BTreeSet::new();
            let mut offsets = Vec::with_capacity(def.members.len());
            let mut size = 0u32;
            for member in &def.members {
                if !seen.insert(&member.name) {
                    return Err(ShapeError::DuplicateMember {
                        strct: def.name.clone(),
                        member: member.name.clone(),
                        span: def.span,
                    });
                }
                if !valid_member_type(&member.ty, &declared) {
                    return Err(ShapeError::UnknownMemberType {
                        strct: def.name.clone(),
                        member: member.name.clone(),
                        ty: member.ty.clone(),
                        span: def.span,
                    });
                }
                offsets.push(size);
                size += scalar_size(&member.ty);
            }
            structs.insert(
                def.name.clone(),
                StructLayout {
                    def: def.clone(),
                    offsets,
                    size,
                },
            );
        }

        Ok(Self { structs })
    }

    pub fn get(&self, name: &str) -> Option<&StructLayout> {
        self.structs.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.structs.is_empty()
    }

    /// Resolve a member to its zero-based declaration index and type.
    ///
    /// Deterministic: the same `(struct, member)` pair always yields the
    /// same result. `use_span` locates the access for error reporting.
    pub fn resolve_member(
        &self,
        strct: &str,
        member: &str,
        use_span: Span,
    ) -> Result<(usize, Type), ShapeError> {
        let layout = self.structs.get(strct).ok_or_else(|| ShapeError::UnknownStruct {
            name: strct.to_string(),
            ty: Type::Named(strct.to_string()),
            span: use_span,
        })?;
        layout
            .def
            .members
            .iter()
            .position(|m| m.name == member)
            .map(|index| (index, layout.def.members[index].ty.clone()))
            .ok_or_else(|| ShapeError::NoSuchMember {
                strct: strct.to_string(),
                member: member.to_string(),
                span: use_span,
            })
    }

    /// Byte offset of the `index`-th member of `strct`.
    pub fn byte_offset(&self, strct: &str, index: usize) -> Option<u32> {
        self.structs.get(strct)?.member_offset(index)
    }

    /// Total byte size of a struct: sum of member sizes in declaration order.
    pub fn byte_size(&self, strct: &str) -> Option<u32> {
        self.structs.get(strct).map(|layout| layout.size)
    }

    /// Element size for allocation and pointer arithmetic through a pointer
    /// of type `ptr_ty`.
    pub fn element_size(&self, ptr_ty: &Type) -> Option<u32> {
        match ptr_ty.pointee()? {
            Type::Named(name) => self.byte_size(name),
            other => Some(scalar_size(other)),
        }
    }
}

fn valid_member_type(ty: &Type, declared: &BTreeSet<&str>) -> bool {
    match ty {
        Type::Int | Type::Bool => true,
        Type::Ptr(inner) => valid_pointee(inner, declared),
        // Nested struct-by-value members are not supported.
        Type::Named(_) => false,
    }
}

fn valid_pointee(ty: &Type, declared: &BTreeSet<&str>) -> bool {
    match ty {
        Type::Int | Type::Bool => true,
        Type::Named(name) => declared.contains(name.as_str()),
        Type::Ptr(inner) => valid_pointee(inner, declared),
    }
}

// ---------------------------------------------------------------------------
// Per-function type resolution
// ---------------------------------------------------------------------------

/// Variable typing environment for one function body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeEnv {
    vars: BTreeMap<String, Type>,
}

impl TypeEnv {
    pub fn get(&self, var: &str) -> Option<&Type> {
        self.vars.get(var)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Type)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Type-resolve one function body against the struct table.
///
/// Collects the declared type of every variable (parameters plus instruction
/// destinations), rejects conflicting redeclarations, verifies every value
/// operand is defined somewhere in the function, and resolves every `getmbr`
/// through the table so missing members surface here, before SSA conversion.
/// Dominance of definitions over uses is the SSA converter's job, not ours.
pub fn resolve_function(function: &Function, table: &StructTable) -> Result<TypeEnv, ShapeError> {
    let mut vars: BTreeMap<String, Type> = BTreeMap::new();

    for param in &function.params {
        validate_value_type(function, &param.ty, table, function.span)?;
        if let Some(existing) = vars.insert(param.name.clone(), param.ty.clone())
            && existing != param.ty
        {
            return Err(ShapeError::VariableTypeConflict {
                function: function.name.clone(),
                var: param.name.clone(),
                span: function.span,
            });
        }
    }

    for code in &function.body {
        let Code::Instr(instr) = code else { continue };
        let (Some(dest), Some(ty)) = (instr.dest(), instr.declared_ty()) else {
            continue;
        };
        validate_value_type(function, &ty, table, instr.span())?;
        if let Some(existing) = vars.insert(dest.to_string(), ty.clone())
            && existing != ty
        {
            return Err(ShapeError::VariableTypeConflict {
                function: function.name.clone(),
                var: dest.to_string(),
                span: instr.span(),
            });
        }
    }

    for code in &function.body {
        let Code::Instr(instr) = code else { continue };
        for operand in instr.value_operands() {
            if !vars.contains_key(operand) {
                return Err(ShapeError::UndefinedVariable {
                    function: function.name.clone(),
                    var: operand.to_string(),
                    span: instr.span(),
                });
            }
        }
        if let Instruction::GetMbr {
            base, member, span, ..
        } = instr
        {
            let base_ty = &vars[base.as_str()];
            let Some(strct) = base_ty.pointee_struct() else {
                return Err(ShapeError::NotAStructPointer {
                    function: function.name.clone(),
                    var: base.clone(),
                    ty: base_ty.clone(),
                    span: *span,
                });
            };
            table.resolve_member(strct, member, *span)?;
        }
    }

    Ok(TypeEnv { vars })
}

fn validate_value_type(
    function: &Function,
    ty: &Type,
    table: &StructTable,
    span: Span,
) -> Result<(), ShapeError> {
    match ty {
        Type::Int | Type::Bool => Ok(()),
        Type::Ptr(inner) => match inner.as_ref() {
            Type::Named(name) if table.get(name).is_none() => Err(ShapeError::UnknownStruct {
                name: name.clone(),
                ty: ty.clone(),
                span,
            }),
            Type::Named(_) => Ok(()),
            other => validate_value_type(function, other, table, span),
        },
        // A bare struct value has no representation; only pointers to
        // structs exist.
        Type::Named(name) => Err(ShapeError::UnknownStruct {
            name: name.clone(),
            ty: ty.clone(),
            span,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_il::{Literal, Member, Param};

    fn strukt(name: &str, members: &[(&str, Type)]) -> StructDef {
        StructDef {
            name: name.to_string(),
            members: members
                .iter()
                .map(|(name, ty)| Member {
                    name: name.to_string(),
                    ty: ty.clone(),
                })
                .collect(),
            span: Span::synthetic(),
        }
    }

    fn point() -> StructDef {
        strukt("point", &[("x", Type::Int), ("y", Type::Int)])
    }

    #[test]
    fn member_index_is_declaration_position() {
        let table = StructTable::build(&[point()]).unwrap();
        let (x_index, x_ty) = table
            .resolve_member("point", "x", Span::synthetic())
            .unwrap();
        let (y_index, y_ty) = table
            .resolve_member("point", "y", Span::synthetic())
            .unwrap();
        assert_eq!((x_index, x_ty), (0, Type::Int));
        assert_eq!((y_index, y_ty), (1, Type::Int));

        // Same pair, same answer.
        let again = table
            .resolve_member("point", "y", Span::synthetic())
            .unwrap();
        assert_eq!(again, (1, Type::Int));
    }

    #[test]
    fn layout_is_cumulative_and_unpadded() {
        let table = StructTable::build(&[strukt(
            "node",
            &[
                ("flag", Type::Bool),
                ("value", Type::Int),
                ("next", Type::ptr_to(Type::Named("node".to_string()))),
            ],
        )])
        .unwrap();
        assert_eq!(table.byte_offset("node", 0), Some(0));
        assert_eq!(table.byte_offset("node", 1), Some(1));
        assert_eq!(table.byte_offset("node", 2), Some(9));
        assert_eq!(table.byte_size("node"), Some(17));
    }

    #[test]
    fn reserved_name_is_duplicate_name() {
        let err = StructTable::build(&[strukt("int", &[("x", Type::Int)])]).unwrap_err();
        assert!(matches!(err, ShapeError::DuplicateName { ref name, .. } if name == "int"));
        assert_eq!(err.category(), Category::DuplicateName);
    }

    #[test]
    fn colliding_struct_names_rejected() {
        let err = StructTable::build(&[point(), point()]).unwrap_err();
        assert!(matches!(err, ShapeError::DuplicateName { ref name, .. } if name == "point"));
    }

    #[test]
    fn duplicate_member_rejected() {
        let err =
            StructTable::build(&[strukt("pair", &[("a", Type::Int), ("a", Type::Bool)])])
                .unwrap_err();
        assert!(matches!(err, ShapeError::DuplicateMember { ref member, .. } if member == "a"));
    }

    #[test]
    fn unknown_pointee_rejected_after_all_declarations() {
        let err = StructTable::build(&[strukt(
            "node",
            &[("next", Type::ptr_to(Type::Named("ghost".to_string())))],
        )])
        .unwrap_err();
        assert!(matches!(err, ShapeError::UnknownMemberType { .. }));
    }

    #[test]
    fn struct_valued_member_rejected() {
        let err = StructTable::build(&[
            point(),
            strukt("line", &[("from", Type::Named("point".to_string()))]),
        ])
        .unwrap_err();
        assert!(
            matches!(err, ShapeError::UnknownMemberType { ref member, .. } if member == "from")
        );
    }

    #[test]
    fn mutually_referential_structs_build() {
        let table = StructTable::build(&[
            strukt("even", &[("next", Type::ptr_to(Type::Named("odd".to_string())))]),
            strukt("odd", &[("next", Type::ptr_to(Type::Named("even".to_string())))]),
        ])
        .unwrap();
        assert_eq!(
            table.resolve_member("even", "next", Span::synthetic()).unwrap().1,
            Type::ptr_to(Type::Named("odd".to_string()))
        );
    }

    #[test]
    fn missing_member_is_no_such_member() {
        let table = StructTable::build(&[point()]).unwrap();
        let err = table
            .resolve_member("point", "z", Span::synthetic())
            .unwrap_err();
        assert!(matches!(err, ShapeError::NoSuchMember { ref member, .. } if member == "z"));
        assert_eq!(err.category(), Category::NoSuchMember);
    }

    #[test]
    fn element_size_consults_struct_layout() {
        let table = StructTable::build(&[point()]).unwrap();
        let ptr_point = Type::ptr_to(Type::Named("point".to_string()));
        assert_eq!(table.element_size(&ptr_point), Some(16));
        assert_eq!(table.element_size(&Type::ptr_to(Type::Int)), Some(8));
        assert_eq!(table.element_size(&Type::ptr_to(Type::Bool)), Some(1));
        assert_eq!(table.element_size(&Type::Int), None);
    }

    fn code(instr: Instruction) -> Code {
        Code::Instr(instr)
    }

    fn getmbr_fn(body_member: &str) -> Function {
        Function {
            name: "probe".to_string(),
            params: vec![Param {
                name: "p".to_string(),
                ty: Type::ptr_to(Type::Named("point".to_string())),
            }],
            ret: None,
            body: vec![
                code(Instruction::GetMbr {
                    dest: "addr".to_string(),
                    ty: Type::ptr_to(Type::Int),
                    base: "p".to_string(),
                    member: body_member.to_string(),
                    span: Span::synthetic(),
                }),
                code(Instruction::Ret {
                    value: None,
                    span: Span::synthetic(),
                }),
            ],
            span: Span::synthetic(),
        }
    }

    #[test]
    fn resolve_function_types_getmbr() {
        let table = StructTable::build(&[point()]).unwrap();
        let env = resolve_function(&getmbr_fn("x"), &table).unwrap();
        assert_eq!(env.get("addr"), Some(&Type::ptr_to(Type::Int)));
        assert_eq!(
            env.get("p"),
            Some(&Type::ptr_to(Type::Named("point".to_string())))
        );
    }

    #[test]
    fn resolve_function_reports_missing_member() {
        let table = StructTable::build(&[point()]).unwrap();
        let err = resolve_function(&getmbr_fn("z"), &table).unwrap_err();
        assert!(matches!(err, ShapeError::NoSuchMember { ref member, .. } if member == "z"));
    }

    #[test]
    fn getmbr_through_non_struct_pointer_rejected() {
        let table = StructTable::build(&[point()]).unwrap();
        let function = Function {
            name: "probe".to_string(),
            params: vec![Param {
                name: "n".to_string(),
                ty: Type::Int,
            }],
            ret: None,
            body: vec![code(Instruction::GetMbr {
                dest: "addr".to_string(),
                ty: Type::ptr_to(Type::Int),
                base: "n".to_string(),
                member: "x".to_string(),
                span: Span::synthetic(),
            })],
            span: Span::synthetic(),
        };
        let err = resolve_function(&function, &table).unwrap_err();
        assert!(matches!(err, ShapeError::NotAStructPointer { ref var, .. } if var == "n"));
        assert_eq!(err.category(), Category::TypeMismatch);
    }

    #[test]
    fn undefined_operand_rejected() {
        let table = StructTable::default();
        let function = Function {
            name: "probe".to_string(),
            params: vec![],
            ret: Some(Type::Int),
            body: vec![code(Instruction::Ret {
                value: Some("ghost".to_string()),
                span: Span::synthetic(),
            })],
            span: Span::synthetic(),
        };
        let err = resolve_function(&function, &table).unwrap_err();
        assert!(matches!(err, ShapeError::UndefinedVariable { ref var, .. } if var == "ghost"));
    }

    #[test]
    fn conflicting_redefinition_rejected() {
        let table = StructTable::default();
        let function = Function {
            name: "probe".to_string(),
            params: vec![],
            ret: None,
            body: vec![
                code(Instruction::Const {
                    dest: "v".to_string(),
                    ty: Type::Int,
                    value: Literal::Int(1),
                    span: Span::synthetic(),
                }),
                code(Instruction::Const {
                    dest: "v".to_string(),
                    ty: Type::Bool,
                    value: Literal::Bool(true),
                    span: Span::synthetic(),
                }),
            ],
            span: Span::synthetic(),
        };
        let err = resolve_function(&function, &table).unwrap_err();
        assert!(matches!(err, ShapeError::VariableTypeConflict { ref var, .. } if var == "v"));
    }
}
