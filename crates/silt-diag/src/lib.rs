//! Error reporting and diagnostics for SILT.
//!
//! This crate provides structured diagnostics with source location tracking.
//! Diagnostics are created by the pipeline crates (`silt-types`, `silt-ssa`,
//! `silt-codegen`) and rendered here for display. Every failure path in the
//! pipeline maps to a distinct [`Category`] with a stable code, so callers can
//! match on kinds without parsing messages.

use std::fmt;

// ---------------------------------------------------------------------------
// Diagnostic severity and categories
// ---------------------------------------------------------------------------

/// How severe a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Broad category for diagnostics. Used for filtering and grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Struct name collides with another struct or a reserved type name.
    DuplicateName,
    /// Two members of one struct share a name.
    DuplicateMember,
    /// A member's pointee struct is never declared.
    UnknownMemberType,
    /// Member access names a member the struct does not have.
    NoSuchMember,
    /// A basic block is not reachable from the function entry.
    UnreachableBlock,
    /// A value is read with no dominating definition.
    UndefinedVariable,
    /// A stored or loaded value disagrees with the pointer's pointee type.
    TypeMismatch,
    /// The requested target triple is not supported by the backend.
    UnsupportedTarget,
    /// The program unit violates a structural rule of the IL.
    MalformedProgram,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::DuplicateName,
        Category::DuplicateMember,
        Category::UnknownMemberType,
        Category::NoSuchMember,
        Category::UnreachableBlock,
        Category::UndefinedVariable,
        Category::TypeMismatch,
        Category::UnsupportedTarget,
        Category::MalformedProgram,
    ];

    pub fn all() -> &'static [Category] {
        &Self::ALL
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::DuplicateName => "duplicate_name",
            Category::DuplicateMember => "duplicate_member",
            Category::UnknownMemberType => "unknown_member_type",
            Category::NoSuchMember => "no_such_member",
            Category::UnreachableBlock => "unreachable_block",
            Category::UndefinedVariable => "undefined_variable",
            Category::TypeMismatch => "type_mismatch",
            Category::UnsupportedTarget => "unsupported_target",
            Category::MalformedProgram => "malformed_program",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Category::DuplicateName => "E0001",
            Category::DuplicateMember => "E0002",
            Category::UnknownMemberType => "E0003",
            Category::NoSuchMember => "E0004",
            Category::UnreachableBlock => "E0005",
            Category::UndefinedVariable => "E0006",
            Category::TypeMismatch => "E0007",
            Category::UnsupportedTarget => "E0008",
            Category::MalformedProgram => "E0009",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Category::DuplicateName => {
                "A struct name collides with another struct or a reserved type name."
            }
            Category::DuplicateMember => "A struct declares the same member name twice.",
            Category::UnknownMemberType => {
                "A struct member points at a type that is never declared."
            }
            Category::NoSuchMember => "A member access names a member the struct does not have.",
            Category::UnreachableBlock => {
                "A basic block cannot be reached from the function entry."
            }
            Category::UndefinedVariable => "A value is read with no dominating definition.",
            Category::TypeMismatch => {
                "A value's type disagrees with what its use site requires."
            }
            Category::UnsupportedTarget => "The backend cannot compile for the requested target.",
            Category::MalformedProgram => "The program unit violates a structural rule of the IL.",
        }
    }

    pub fn example_fix(self) -> &'static str {
        match self {
            Category::DuplicateName => "Rename the struct; `int`, `bool`, and `ptr` are reserved.",
            Category::DuplicateMember => "Remove or rename the duplicated member.",
            Category::UnknownMemberType => {
                "Declare the pointee struct, or point at a primitive type."
            }
            Category::NoSuchMember => "Use a member from the struct's declaration.",
            Category::UnreachableBlock => "Delete the block or add a branch that reaches it.",
            Category::UndefinedVariable => "Define the variable on every path before reading it.",
            Category::TypeMismatch => "Adjust the value or the pointer type so they agree.",
            Category::UnsupportedTarget => "Compile for the host target.",
            Category::MalformedProgram => "Fix the reported structural rule in the input program.",
        }
    }
}

// ---------------------------------------------------------------------------
// Source locations (independent of silt-il's Span)
// ---------------------------------------------------------------------------

/// A source location for diagnostics.
///
/// Uses byte offsets. Callers convert from `silt-il` spans to this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub file_id: u32,
    pub start: u32,
    pub end: u32,
}

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

/// A structured diagnostic message.
///
/// Every diagnostic carries a kind, a location when one is known, and a
/// human-readable message, which is the whole contract with the external
/// caller: no interactive interface exists.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    /// Stable diagnostic code (e.g. E0001).
    pub code: Option<String>,
    pub severity: Severity,
    pub category: Category,
    /// Primary message: what went wrong.
    pub message: String,
    /// Where it went wrong.
    pub location: Option<SourceLocation>,
    /// Additional labeled spans (e.g., "the struct was declared here").
    pub labels: Vec<DiagLabel>,
    /// Suggested fix, if any.
    pub help: Option<String>,
}

/// A labeled source span within a diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagLabel {
    pub location: SourceLocation,
    pub message: String,
}

impl Diagnostic {
    pub fn error(category: Category, message: impl Into<String>) -> Self {
        Self {
            code: Some(category.code().to_string()),
            severity: Severity::Error,
            category,
            message: message.into(),
            location: None,
            labels: Vec::new(),
            help: None,
        }
    }

    pub fn warning(category: Category, message: impl Into<String>) -> Self {
        Self {
            code: Some(category.code().to_string()),
            severity: Severity::Warning,
            category,
            message: message.into(),
            location: None,
            labels: Vec::new(),
            help: None,
        }
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_label(mut self, location: SourceLocation, message: impl Into<String>) -> Self {
        self.labels.push(DiagLabel {
            location,
            message: message.into(),
        });
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        if let Some(code) = &self.code {
            write!(f, "{prefix}[{code}]: {}", self.message)?;
        } else {
            write!(f, "{prefix}: {}", self.message)?;
        }
        if let Some(help) = &self.help {
            write!(f, "\n  help: {help}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error type for crates that produce diagnostics
// ---------------------------------------------------------------------------

/// Error type wrapping one or more diagnostics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", .0.first().map(|d| d.to_string()).unwrap_or_default())]
pub struct DiagnosticError(pub Vec<Diagnostic>);

impl DiagnosticError {
    pub fn single(diag: Diagnostic) -> Self {
        Self(vec![diag])
    }

    pub fn multiple(diags: Vec<Diagnostic>) -> Self {
        Self(diags)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_builder() {
        let loc = SourceLocation {
            file_id: 0,
            start: 10,
            end: 20,
        };
        let diag = Diagnostic::error(Category::NoSuchMember, "struct `point` has no member `z`")
            .at(loc)
            .with_help("members are `x` and `y`");

        assert_eq!(diag.severity, Severity::Error);
        assert_eq!(diag.code.as_deref(), Some("E0004"));
        assert_eq!(diag.category, Category::NoSuchMember);
        assert!(diag.message.contains("no member `z`"));
        assert!(diag.help.unwrap().contains("`x` and `y`"));
    }

    #[test]
    fn diagnostic_display() {
        let diag = Diagnostic::error(Category::DuplicateName, "struct `int` is reserved");
        let s = format!("{diag}");
        assert!(s.starts_with("error[E0001]: struct `int` is reserved"));
    }

    #[test]
    fn warnings_are_not_errors() {
        let diag = Diagnostic::warning(Category::UnreachableBlock, "block `dead` is unreachable");
        assert!(!diag.is_error());
        assert!(format!("{diag}").starts_with("warning[E0005]"));
    }

    #[test]
    fn category_metadata_is_stable_and_unique() {
        let mut codes = std::collections::BTreeSet::new();
        for cat in Category::all() {
            assert!(!cat.as_str().is_empty());
            assert!(!cat.description().is_empty());
            assert!(!cat.example_fix().is_empty());
            assert!(
                codes.insert(cat.code()),
                "duplicate diagnostic code detected: {}",
                cat.code()
            );
        }
    }
}
