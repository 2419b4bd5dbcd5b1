use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use silt::compiler;
use silt_diag::Diagnostic;

fn main() {
    env_logger::init();
    if let Err(message) = run() {
        eprintln!("{message}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args = std::env::args().collect::<Vec<_>>();
    let command = parse_cli(&args)?;

    match command {
        Command::Run { input } => {
            let checked = check_file(&input)?;
            emit_diagnostics(&checked.diagnostics);
            let exit_code = compiler::run_main(&checked)?;
            if exit_code != 0 {
                std::process::exit(exit_code as i32);
            }
            Ok(())
        }
        Command::Build { input, output } => {
            let output = output.unwrap_or_else(|| default_build_output_path(&input));
            let checked = check_file(&input)?;
            emit_diagnostics(&checked.diagnostics);
            let artifact = compiler::compile_aot(&checked)?;
            emit_diagnostics(&artifact.diagnostics);
            if !checked.failed_functions.is_empty() || !artifact.failed_functions.is_empty() {
                return Err("build failed: some functions did not compile".to_string());
            }
            if artifact.object.is_empty() {
                return Err("AOT backend produced no object bytes".to_string());
            }
            if let Some(parent) = output.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)
                    .map_err(|err| format!("failed to create output directory: {err}"))?;
            }
            if output.extension().and_then(|ext| ext.to_str()) == Some("o") {
                fs::write(&output, &artifact.object)
                    .map_err(|err| format!("failed to write `{}`: {err}", output.display()))?;
                println!(
                    "built object `{}` ({} bytes)",
                    output.display(),
                    artifact.object.len()
                );
            } else {
                link_object_bytes(&artifact.object, &output)?;
                println!("built executable `{}`", output.display());
            }
            Ok(())
        }
        Command::Check { input, dump_ssa } => {
            let checked = check_file(&input)?;
            emit_diagnostics(&checked.diagnostics);
            if dump_ssa {
                print!("{}", compiler::dump_ssa(&checked));
            }
            if checked.has_errors() {
                return Err(format!(
                    "check failed: {} function(s) rejected",
                    checked.failed_functions.len()
                ));
            }
            Ok(())
        }
    }
}

fn check_file(input: &Path) -> Result<compiler::CheckedProgram, String> {
    let program = compiler::load_program(input)?;
    compiler::check_program(&program).map_err(|error| error.to_string())
}

fn emit_diagnostics(diags: &[Diagnostic]) {
    for diag in diags {
        eprintln!("{diag}");
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run { input: PathBuf },
    Build { input: PathBuf, output: Option<PathBuf> },
    Check { input: PathBuf, dump_ssa: bool },
}

fn parse_cli(args: &[String]) -> Result<Command, String> {
    if args.len() < 3 {
        return Err(usage());
    }

    match args[1].as_str() {
        "run" => Ok(Command::Run {
            input: PathBuf::from(&args[2]),
        }),
        "check" => {
            let input = PathBuf::from(&args[2]);
            let mut dump_ssa = false;
            for arg in &args[3..] {
                match arg.as_str() {
                    "--dump-ssa" => dump_ssa = true,
                    unknown => {
                        return Err(format!("unknown argument `{unknown}`\n{}", usage()));
                    }
                }
            }
            Ok(Command::Check { input, dump_ssa })
        }
        "build" => {
            let input = PathBuf::from(&args[2]);
            let mut output = None;

            let mut idx = 3;
            while idx < args.len() {
                match args[idx].as_str() {
                    "-o" | "--output" => {
                        if idx + 1 >= args.len() {
                            return Err("missing value for --output".to_string());
                        }
                        output = Some(PathBuf::from(&args[idx + 1]));
                        idx += 2;
                    }
                    unknown => {
                        return Err(format!("unknown argument `{unknown}`\n{}", usage()));
                    }
                }
            }

            Ok(Command::Build { input, output })
        }
        _ => Err(usage()),
    }
}

fn usage() -> String {
    "usage:\n  silt run <program.json>\n  silt build <program.json> [-o output|output.o]\n  silt check <program.json> [--dump-ssa]"
        .to_string()
}

fn default_build_output_path(input: &Path) -> PathBuf {
    input.with_extension("")
}

/// The print runtime the backend imports. Compiled alongside the object so
/// linked executables resolve the `__silt_print_*` symbols.
const RUNTIME_C: &str = r#"#include <stdio.h>
#include <stdint.h>

void __silt_print_int(int64_t value) { printf("%lld\n", (long long)value); }
void __silt_print_bool(int8_t value) { printf(value ? "true\n" : "false\n"); }
void __silt_print_ptr(void *value) { printf("%p\n", value); }
"#;

fn link_object_bytes(object: &[u8], output: &Path) -> Result<(), String> {
    let pid = std::process::id();
    let temp_object = std::env::temp_dir().join(format!("silt-build-{pid}.o"));
    let temp_runtime = std::env::temp_dir().join(format!("silt-rt-{pid}.c"));
    fs::write(&temp_object, object).map_err(|err| {
        format!(
            "failed to write temporary object `{}`: {err}",
            temp_object.display()
        )
    })?;
    fs::write(&temp_runtime, RUNTIME_C).map_err(|err| {
        format!(
            "failed to write runtime stub `{}`: {err}",
            temp_runtime.display()
        )
    })?;

    let status = ProcessCommand::new("cc")
        .arg(&temp_object)
        .arg(&temp_runtime)
        .arg("-o")
        .arg(output)
        .status()
        .map_err(|err| format!("failed to invoke linker `cc`: {err}"))?;

    let _ = fs::remove_file(&temp_object);
    let _ = fs::remove_file(&temp_runtime);

    if !status.success() {
        return Err(format!(
            "linker failed for `{}` (exit status: {status})",
            output.display()
        ));
    }

    Ok(())
}
