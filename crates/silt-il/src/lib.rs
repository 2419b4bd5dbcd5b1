//! Data model for the SILT intermediate language.
//!
//! This crate defines the program unit handed over by the external parser:
//! struct declarations plus functions whose bodies are flat instruction
//! streams (labels open blocks, implicit fallthrough is permitted on input).
//! Every node carries a [`Span`] for source location tracking; the serde
//! derives are the wire contract with the parser, which delivers programs as
//! JSON.
//!
//! Two operand kinds exist and the distinction is structural: value operands
//! are variable names subject to SSA renaming, while member names, labels,
//! and function names are static identifiers attached to the opcode. The
//! single renaming dispatch point is [`Instruction::value_operands_mut`],
//! which never yields a member name or a label.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifies a source file in the compilation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u32);

/// A byte offset range within a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub file: FileId,
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(file: FileId, start: u32, end: u32) -> Self {
        Self { file, start, end }
    }

    /// A synthetic span for compiler-generated nodes.
    pub fn synthetic() -> Self {
        Self {
            file: FileId(u32::MAX),
            start: 0,
            end: 0,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.file == FileId(u32::MAX)
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Reserved type names that struct declarations may not shadow.
pub const RESERVED_TYPE_NAMES: [&str; 3] = ["int", "bool", "ptr"];

/// A type expression.
///
/// `Named` refers to a declared struct and is only legal as a pointee;
/// struct-valued members and variables are not representable semantics
/// (the struct table rejects them).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Int,
    Bool,
    Ptr(Box<Type>),
    Named(String),
}

impl Type {
    pub fn ptr_to(pointee: Type) -> Self {
        Type::Ptr(Box::new(pointee))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr(_))
    }

    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Ptr(inner) => Some(inner),
            _ => None,
        }
    }

    /// The struct name behind a `ptr<name>` type, if that is what this is.
    pub fn pointee_struct(&self) -> Option<&str> {
        match self {
            Type::Ptr(inner) => match inner.as_ref() {
                Type::Named(name) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Bool => write!(f, "bool"),
            Type::Ptr(inner) => write!(f, "ptr<{inner}>"),
            Type::Named(name) => write!(f, "{name}"),
        }
    }
}

// The wire form is either a bare type name ("int", "bool", a struct name) or
// a single-key map {"ptr": <type>}.
impl Serialize for Type {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Type::Int => serializer.serialize_str("int"),
            Type::Bool => serializer.serialize_str("bool"),
            Type::Named(name) => serializer.serialize_str(name),
            Type::Ptr(inner) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("ptr", inner)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Type {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TypeVisitor;

        impl<'de> Visitor<'de> for TypeVisitor {
            type Value = Type;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a type name or {\"ptr\": <type>}")
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<Type, E> {
                Ok(match value {
                    "int" => Type::Int,
                    "bool" => Type::Bool,
                    other => Type::Named(other.to_string()),
                })
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Type, A::Error> {
                let Some(key) = map.next_key::<String>()? else {
                    return Err(serde::de::Error::custom("empty type object"));
                };
                if key != "ptr" {
                    return Err(serde::de::Error::custom(format!(
                        "unknown type constructor `{key}`"
                    )));
                }
                let pointee = map.next_value::<Type>()?;
                if map.next_key::<String>()?.is_some() {
                    return Err(serde::de::Error::custom("type object has extra keys"));
                }
                Ok(Type::ptr_to(pointee))
            }
        }

        deserializer.deserialize_any(TypeVisitor)
    }
}

// ---------------------------------------------------------------------------
// Literals and operators
// ---------------------------------------------------------------------------

/// A literal value. Literals only ever appear in `const` instructions; every
/// other operand position holds a variable name.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Int(i64),
    Bool(bool),
    /// The typed null pointer sentinel; serialized as JSON `null`.
    Nullptr,
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Bool(v) => write!(f, "{v}"),
            Literal::Nullptr => write!(f, "nullptr"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    /// Comparisons produce `bool` from `int` operands.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge
        )
    }

    /// Logical connectives take and produce `bool`.
    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Eq => "eq",
            BinaryOp::Lt => "lt",
            BinaryOp::Gt => "gt",
            BinaryOp::Le => "le",
            BinaryOp::Ge => "ge",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnaryOp {
    Not,
}

impl UnaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            UnaryOp::Not => "not",
        }
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// One struct member: a name and a type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
}

/// A struct declaration: a name and an ordered member list.
///
/// Created once at program load, immutable thereafter. Member order is
/// layout order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    #[serde(rename = "mbrs")]
    pub members: Vec<Member>,
    #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
    pub span: Span,
}

/// A function parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
}

/// A function definition: a flat instruction stream with labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<Type>,
    pub body: Vec<Code>,
    #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
    pub span: Span,
}

/// The program unit: struct declarations and function definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub structs: Vec<StructDef>,
    pub functions: Vec<Function>,
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

/// One element of a function body: a label or an instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Code {
    Instr(Instruction),
    Label {
        label: String,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
}

/// One argument of a phi node: the value to select when control arrives from
/// the named predecessor block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhiArg {
    pub label: String,
    pub var: String,
}

/// An IL instruction.
///
/// `member` on `getmbr`, all labels, and `func` on `call` are structural
/// identifiers; everything returned by [`Instruction::value_operands_mut`]
/// is a value operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Instruction {
    /// Materialize a literal. The IL forbids inlining literals anywhere else.
    Const {
        dest: String,
        #[serde(rename = "type")]
        ty: Type,
        value: Literal,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    Binary {
        dest: String,
        #[serde(rename = "type")]
        ty: Type,
        kind: BinaryOp,
        lhs: String,
        rhs: String,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    Unary {
        dest: String,
        #[serde(rename = "type")]
        ty: Type,
        kind: UnaryOp,
        arg: String,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    /// Copy a value.
    Id {
        dest: String,
        #[serde(rename = "type")]
        ty: Type,
        arg: String,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    Call {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        ty: Option<Type>,
        func: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    Print {
        args: Vec<String>,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    /// Heap-allocate `count` elements of the pointee type of `type`.
    /// Returns a raw pointer; the storage is uninitialized.
    Alloc {
        dest: String,
        #[serde(rename = "type")]
        ty: Type,
        count: String,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    Free {
        arg: String,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    Load {
        dest: String,
        #[serde(rename = "type")]
        ty: Type,
        ptr: String,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    Store {
        ptr: String,
        src: String,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    /// Element-scaled pointer arithmetic.
    PtrAdd {
        dest: String,
        #[serde(rename = "type")]
        ty: Type,
        ptr: String,
        offset: String,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    /// Compute the address of a named member. `member` is a structural
    /// identifier, never a variable: SSA renaming must copy it through
    /// unchanged.
    #[serde(rename = "getmbr")]
    GetMbr {
        dest: String,
        #[serde(rename = "type")]
        ty: Type,
        base: String,
        member: String,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    /// Boolean test against the null pointer sentinel.
    #[serde(rename = "isnull")]
    IsNull {
        dest: String,
        arg: String,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    /// SSA merge point. Produced by SSA conversion; accepted on input so an
    /// already-converted program round-trips.
    Phi {
        dest: String,
        #[serde(rename = "type")]
        ty: Type,
        args: Vec<PhiArg>,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    Jmp {
        target: String,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    Br {
        cond: String,
        then_target: String,
        else_target: String,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
    Ret {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default = "Span::synthetic", skip_serializing_if = "Span::is_synthetic")]
        span: Span,
    },
}

impl Instruction {
    pub fn dest(&self) -> Option<&str> {
        match self {
            Instruction::Const { dest, .. }
            | Instruction::Binary { dest, .. }
            | Instruction::Unary { dest, .. }
            | Instruction::Id { dest, .. }
            | Instruction::Alloc { dest, .. }
            | Instruction::Load { dest, .. }
            | Instruction::PtrAdd { dest, .. }
            | Instruction::GetMbr { dest, .. }
            | Instruction::IsNull { dest, .. }
            | Instruction::Phi { dest, .. } => Some(dest),
            Instruction::Call { dest, .. } => dest.as_deref(),
            _ => None,
        }
    }

    pub fn dest_mut(&mut self) -> Option<&mut String> {
        match self {
            Instruction::Const { dest, .. }
            | Instruction::Binary { dest, .. }
            | Instruction::Unary { dest, .. }
            | Instruction::Id { dest, .. }
            | Instruction::Alloc { dest, .. }
            | Instruction::Load { dest, .. }
            | Instruction::PtrAdd { dest, .. }
            | Instruction::GetMbr { dest, .. }
            | Instruction::IsNull { dest, .. }
            | Instruction::Phi { dest, .. } => Some(dest),
            Instruction::Call { dest, .. } => dest.as_mut(),
            _ => None,
        }
    }

    /// The type this instruction declares for its destination, when the
    /// instruction spells one. `isnull` destinations are always `bool`.
    pub fn declared_ty(&self) -> Option<Type> {
        match self {
            Instruction::Const { ty, .. }
            | Instruction::Binary { ty, .. }
            | Instruction::Unary { ty, .. }
            | Instruction::Id { ty, .. }
            | Instruction::Alloc { ty, .. }
            | Instruction::Load { ty, .. }
            | Instruction::PtrAdd { ty, .. }
            | Instruction::GetMbr { ty, .. }
            | Instruction::Phi { ty, .. } => Some(ty.clone()),
            Instruction::Call { ty, .. } => ty.clone(),
            Instruction::IsNull { .. } => Some(Type::Bool),
            _ => None,
        }
    }

    /// Value operands, in order. This is the only surface SSA renaming
    /// rewrites: member names, labels, and function names are not here, and
    /// phi arguments are rewritten per predecessor by the converter itself.
    pub fn value_operands_mut(&mut self) -> Vec<&mut String> {
        match self {
            Instruction::Const { .. }
            | Instruction::Phi { .. }
            | Instruction::Jmp { .. } => Vec::new(),
            Instruction::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Instruction::Unary { arg, .. }
            | Instruction::Id { arg, .. }
            | Instruction::Free { arg, .. }
            | Instruction::IsNull { arg, .. } => vec![arg],
            Instruction::Call { args, .. } | Instruction::Print { args, .. } => {
                args.iter_mut().collect()
            }
            Instruction::Alloc { count, .. } => vec![count],
            Instruction::Load { ptr, .. } => vec![ptr],
            Instruction::Store { ptr, src, .. } => vec![ptr, src],
            Instruction::PtrAdd { ptr, offset, .. } => vec![ptr, offset],
            Instruction::GetMbr { base, .. } => vec![base],
            Instruction::Br { cond, .. } => vec![cond],
            Instruction::Ret { value, .. } => value.as_mut().into_iter().collect(),
        }
    }

    pub fn value_operands(&self) -> Vec<&str> {
        match self {
            Instruction::Const { .. }
            | Instruction::Phi { .. }
            | Instruction::Jmp { .. } => Vec::new(),
            Instruction::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Instruction::Unary { arg, .. }
            | Instruction::Id { arg, .. }
            | Instruction::Free { arg, .. }
            | Instruction::IsNull { arg, .. } => vec![arg],
            Instruction::Call { args, .. } | Instruction::Print { args, .. } => {
                args.iter().map(String::as_str).collect()
            }
            Instruction::Alloc { count, .. } => vec![count],
            Instruction::Load { ptr, .. } => vec![ptr],
            Instruction::Store { ptr, src, .. } => vec![ptr, src],
            Instruction::PtrAdd { ptr, offset, .. } => vec![ptr, offset],
            Instruction::GetMbr { base, .. } => vec![base],
            Instruction::Br { cond, .. } => vec![cond],
            Instruction::Ret { value, .. } => value.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Jmp { .. } | Instruction::Br { .. } | Instruction::Ret { .. }
        )
    }

    pub fn span(&self) -> Span {
        match self {
            Instruction::Const { span, .. }
            | Instruction::Binary { span, .. }
            | Instruction::Unary { span, .. }
            | Instruction::Id { span, .. }
            | Instruction::Call { span, .. }
            | Instruction::Print { span, .. }
            | Instruction::Alloc { span, .. }
            | Instruction::Free { span, .. }
            | Instruction::Load { span, .. }
            | Instruction::Store { span, .. }
            | Instruction::PtrAdd { span, .. }
            | Instruction::GetMbr { span, .. }
            | Instruction::IsNull { span, .. }
            | Instruction::Phi { span, .. }
            | Instruction::Jmp { span, .. }
            | Instruction::Br { span, .. }
            | Instruction::Ret { span, .. } => *span,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Const {
                dest, ty, value, ..
            } => write!(f, "{dest}: {ty} = const {value}"),
            Instruction::Binary {
                dest,
                ty,
                kind,
                lhs,
                rhs,
                ..
            } => write!(f, "{dest}: {ty} = {} {lhs} {rhs}", kind.as_str()),
            Instruction::Unary {
                dest, ty, kind, arg, ..
            } => write!(f, "{dest}: {ty} = {} {arg}", kind.as_str()),
            Instruction::Id { dest, ty, arg, .. } => write!(f, "{dest}: {ty} = id {arg}"),
            Instruction::Call {
                dest,
                ty,
                func,
                args,
                ..
            } => {
                if let (Some(dest), Some(ty)) = (dest, ty) {
                    write!(f, "{dest}: {ty} = call @{func}")?;
                } else {
                    write!(f, "call @{func}")?;
                }
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
            Instruction::Print { args, .. } => {
                write!(f, "print")?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
            Instruction::Alloc {
                dest, ty, count, ..
            } => write!(f, "{dest}: {ty} = alloc {count}"),
            Instruction::Free { arg, .. } => write!(f, "free {arg}"),
            Instruction::Load { dest, ty, ptr, .. } => write!(f, "{dest}: {ty} = load {ptr}"),
            Instruction::Store { ptr, src, .. } => write!(f, "store {ptr} {src}"),
            Instruction::PtrAdd {
                dest,
                ty,
                ptr,
                offset,
                ..
            } => write!(f, "{dest}: {ty} = ptradd {ptr} {offset}"),
            Instruction::GetMbr {
                dest,
                ty,
                base,
                member,
                ..
            } => write!(f, "{dest}: {ty} = getmbr {base} {member}"),
            Instruction::IsNull { dest, arg, .. } => write!(f, "{dest}: bool = isnull {arg}"),
            Instruction::Phi { dest, ty, args, .. } => {
                write!(f, "{dest}: {ty} = phi")?;
                for arg in args {
                    write!(f, " .{} {}", arg.label, arg.var)?;
                }
                Ok(())
            }
            Instruction::Jmp { target, .. } => write!(f, "jmp .{target}"),
            Instruction::Br {
                cond,
                then_target,
                else_target,
                ..
            } => write!(f, "br {cond} .{then_target} .{else_target}"),
            Instruction::Ret { value, .. } => match value {
                Some(value) => write!(f, "ret {value}"),
                None => write!(f, "ret"),
            },
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Label { label, .. } => write!(f, ".{label}:"),
            Code::Instr(instr) => write!(f, "  {instr}"),
        }
    }
}
