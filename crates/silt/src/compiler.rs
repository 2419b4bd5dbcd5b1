//! The compilation pipeline: JSON program in, diagnostics and artifacts out.
//!
//! Error scoping follows the shape of the errors. Declaration shape errors
//! poison every function that could mention the declaration, so a failed
//! struct table aborts the whole program before any SSA or lowering work.
//! Per-function failures (member resolution, undefined variables, lowering)
//! exclude only the offending function; its siblings continue through the
//! pipeline so one bad function does not hide diagnostics in the others.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use silt_codegen::{
    Backend, BackendArtifact, BackendConfig, CodegenMode, CraneliftBackend, execute_main_jit,
};
use silt_diag::{Category, Diagnostic, DiagnosticError, Severity};
use silt_il::Program;
use silt_ssa::{SsaProgram, SsaStats, convert_function};
use silt_types::{StructTable, resolve_function};

/// The result of checking a program: everything the backend needs, plus the
/// diagnostics and the functions that did not survive.
#[derive(Debug)]
pub struct CheckedProgram {
    pub table: StructTable,
    pub ssa: SsaProgram,
    pub diagnostics: Vec<Diagnostic>,
    pub failed_functions: Vec<String>,
    pub stats: Vec<(String, SsaStats)>,
}

impl CheckedProgram {
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|diag| matches!(diag.severity, Severity::Error))
    }
}

pub fn load_program(path: &Path) -> Result<Program, String> {
    let source = fs::read_to_string(path)
        .map_err(|err| format!("failed to read `{}`: {err}", path.display()))?;
    parse_program(&source)
}

pub fn parse_program(source: &str) -> Result<Program, String> {
    serde_json::from_str(source).map_err(|err| format!("malformed program JSON: {err}"))
}

/// Build the struct table, resolve and convert every function.
///
/// `Err` means the whole program is unusable (shape errors, duplicate
/// function names) and carries the structured diagnostics. Per-function
/// problems land in `diagnostics` and `failed_functions` instead.
pub fn check_program(program: &Program) -> Result<CheckedProgram, DiagnosticError> {
    let table = StructTable::build(&program.structs)
        .map_err(|error| DiagnosticError::single(error.to_diagnostic()))?;

    let mut seen = std::collections::BTreeSet::new();
    for function in &program.functions {
        if !seen.insert(function.name.as_str()) {
            let diag = Diagnostic::error(
                Category::MalformedProgram,
                format!("function `{}` is defined more than once", function.name),
            );
            return Err(DiagnosticError::single(diag));
        }
    }

    let mut diagnostics = Vec::new();
    let mut failed_functions = Vec::new();
    let mut stats = Vec::new();
    let mut functions = Vec::new();

    for function in &program.functions {
        if let Err(error) = resolve_function(function, &table) {
            log::debug!("check: `{}` failed type resolution: {error}", function.name);
            diagnostics.push(error.to_diagnostic());
            failed_functions.push(function.name.clone());
            continue;
        }
        match convert_function(function) {
            Ok(conversion) => {
                diagnostics.extend(conversion.warnings);
                stats.push((function.name.clone(), conversion.stats));
                functions.push(conversion.function);
            }
            Err(error) => {
                log::debug!("check: `{}` failed SSA conversion: {error}", function.name);
                diagnostics.push(error.to_diagnostic());
                failed_functions.push(function.name.clone());
            }
        }
    }

    Ok(CheckedProgram {
        table,
        ssa: SsaProgram { functions },
        diagnostics,
        failed_functions,
        stats,
    })
}

/// Compile to an object file. Backend per-function failures merge into the
/// checked program's diagnostics on the returned artifact.
pub fn compile_aot(checked: &CheckedProgram) -> Result<BackendArtifact, String> {
    let config = BackendConfig {
        mode: CodegenMode::Aot,
        ..BackendConfig::default()
    };
    CraneliftBackend
        .compile_program(&checked.ssa, &checked.table, &config)
        .map_err(|err| format!("codegen failed: {err}"))
}

/// JIT-compile and execute `main`, returning its exit code.
pub fn run_main(checked: &CheckedProgram) -> Result<i64, String> {
    if checked.failed_functions.iter().any(|name| name == "main") {
        return Err("`main` did not survive checking; not executing".to_string());
    }
    execute_main_jit(&checked.ssa, &checked.table, &BackendConfig::default())
        .map_err(|err| format!("execution failed: {err}"))
}

/// Textual dump of the SSA form of every surviving function.
pub fn dump_ssa(checked: &CheckedProgram) -> String {
    let mut out = String::new();
    for function in &checked.ssa.functions {
        let _ = writeln!(out, "{function}");
    }
    out
}
