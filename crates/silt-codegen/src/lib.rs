//! Backend interface and Cranelift implementor for SSA-form SILT programs.
//!
//! The API is backend-neutral: backends consume an SSA program plus the
//! struct table and a target config, and return a code artifact, pass stats,
//! and diagnostics. Failures split two ways: anything module-wide (ISA
//! construction, object emission) is an `Err`, while a lowering failure
//! inside one function excludes that function from the artifact and lets
//! its siblings compile.
//!
//! Member accesses lower to static byte offsets (`iadd_imm`); no member
//! lookup survives to runtime. Heap allocation calls an imported `malloc`
//! sized from the struct table, and `print` calls the `__silt_print_*`
//! runtime symbols registered on the JIT builder.

use std::collections::BTreeMap;
use std::sync::Arc;

use cranelift::prelude::{
    AbiParam, Configurable, FunctionBuilder, FunctionBuilderContext, InstBuilder, Value, types,
};
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{MemFlags, Type as ClifType};
use cranelift_codegen::{isa, settings};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};
use silt_diag::{Category, Diagnostic, SourceLocation};
use silt_il::{BinaryOp, Instruction, Literal, Span, Type, UnaryOp};
use silt_ssa::{SsaFunction, SsaProgram, Terminator};
use silt_types::StructTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub target_triple: String,
    pub opt_level: OptimizationLevel,
    pub mode: CodegenMode,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            target_triple: "host".to_string(),
            opt_level: OptimizationLevel::Default,
            mode: CodegenMode::Jit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationLevel {
    None,
    Default,
    Aggressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodegenMode {
    Jit,
    Aot,
}

/// The output of a backend run. `object` is empty in JIT mode, which emits
/// executable memory instead of an object payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendArtifact {
    pub object: Vec<u8>,
    pub stats: PassStats,
    pub diagnostics: Vec<Diagnostic>,
    pub failed_functions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PassStats {
    pub per_function: Vec<FunctionPassStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionPassStats {
    pub function: String,
    pub block_count: usize,
    pub phi_count: usize,
    pub alloc_count: usize,
    pub call_count: usize,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum CodegenError {
    #[error("target triple `{target}` is not supported by this backend")]
    UnsupportedTarget { target: String },
    #[error("unsupported type `{ty}` in Cranelift lowering of `{function}`")]
    UnsupportedType {
        function: String,
        ty: String,
        span: Span,
    },
    #[error("type mismatch in `{function}`: {detail}")]
    TypeMismatch {
        function: String,
        detail: String,
        span: Span,
    },
    #[error("member access failed in `{function}`: {detail}")]
    Member {
        function: String,
        detail: String,
        span: Span,
    },
    #[error("unknown function `{name}` called from `{function}`")]
    UnknownCallee {
        function: String,
        name: String,
        span: Span,
    },
    #[error("unknown function `{function}`")]
    UnknownFunction { function: String },
    #[error("invalid value `{var}` referenced in `{function}`")]
    InvalidValue {
        function: String,
        var: String,
        span: Span,
    },
    #[error("malformed function `{function}`: {detail}")]
    MalformedFunction { function: String, detail: String },
    #[error("entrypoint shape not supported: {detail}")]
    UnsupportedEntrypoint { detail: String },
    #[error("Cranelift module error: {detail}")]
    Module { detail: String },
    #[error("Cranelift object emission failed: {detail}")]
    ObjectEmit { detail: String },
}

impl CodegenError {
    pub fn category(&self) -> Category {
        match self {
            CodegenError::UnsupportedTarget { .. } => Category::UnsupportedTarget,
            CodegenError::UnsupportedType { .. } | CodegenError::TypeMismatch { .. } => {
                Category::TypeMismatch
            }
            CodegenError::Member { .. } => Category::NoSuchMember,
            CodegenError::InvalidValue { .. } => Category::UndefinedVariable,
            _ => Category::MalformedProgram,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let diag = Diagnostic::error(self.category(), self.to_string());
        match self.span() {
            Some(span) => diag.at(SourceLocation {
                file_id: span.file.0,
                start: span.start,
                end: span.end,
            }),
            None => diag,
        }
    }

    fn span(&self) -> Option<Span> {
        match self {
            CodegenError::UnsupportedType { span, .. }
            | CodegenError::TypeMismatch { span, .. }
            | CodegenError::Member { span, .. }
            | CodegenError::UnknownCallee { span, .. }
            | CodegenError::InvalidValue { span, .. } => Some(*span),
            _ => None,
        }
    }
}

pub trait Backend {
    fn name(&self) -> &'static str;

    fn compile_program(
        &self,
        program: &SsaProgram,
        table: &StructTable,
        config: &BackendConfig,
    ) -> Result<BackendArtifact, CodegenError>;
}

#[derive(Debug, Default)]
pub struct CraneliftBackend;

impl Backend for CraneliftBackend {
    fn name(&self) -> &'static str {
        "cranelift"
    }

    fn compile_program(
        &self,
        program: &SsaProgram,
        table: &StructTable,
        config: &BackendConfig,
    ) -> Result<BackendArtifact, CodegenError> {
        let isa = build_isa(config)?;
        match config.mode {
            CodegenMode::Jit => {
                let mut builder =
                    JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
                register_jit_runtime_symbols(&mut builder);
                let mut jit_module = JITModule::new(builder);
                let outcome = compile_into_module(&mut jit_module, program, table)?;
                if outcome.failures.is_empty() {
                    jit_module
                        .finalize_definitions()
                        .map_err(|detail| CodegenError::Module {
                            detail: detail.to_string(),
                        })?;
                }
                Ok(outcome.into_artifact(Vec::new()))
            }
            CodegenMode::Aot => {
                let builder =
                    ObjectBuilder::new(isa, "silt", cranelift_module::default_libcall_names())
                        .map_err(|detail| CodegenError::Module {
                            detail: detail.to_string(),
                        })?;
                let mut object_module = ObjectModule::new(builder);
                let outcome = compile_into_module(&mut object_module, program, table)?;
                let product = object_module.finish();
                let object = product.emit().map_err(|detail| CodegenError::ObjectEmit {
                    detail: detail.to_string(),
                })?;
                Ok(outcome.into_artifact(object))
            }
        }
    }
}

fn build_isa(config: &BackendConfig) -> Result<Arc<dyn isa::TargetIsa>, CodegenError> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", opt_level_setting(config.opt_level))
        .map_err(|detail| CodegenError::Module {
            detail: detail.to_string(),
        })?;
    if matches!(config.mode, CodegenMode::Aot) {
        flag_builder
            .set("is_pic", "true")
            .map_err(|detail| CodegenError::Module {
                detail: detail.to_string(),
            })?;
        flag_builder
            .set("use_colocated_libcalls", "false")
            .map_err(|detail| CodegenError::Module {
                detail: detail.to_string(),
            })?;
    }

    if config.target_triple == "host" {
        let isa_builder = cranelift_native::builder().map_err(|detail| CodegenError::Module {
            detail: format!("host ISA not supported: {detail}"),
        })?;
        return isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|detail| CodegenError::Module {
                detail: detail.to_string(),
            });
    }

    Err(CodegenError::UnsupportedTarget {
        target: config.target_triple.clone(),
    })
}

fn opt_level_setting(level: OptimizationLevel) -> &'static str {
    match level {
        OptimizationLevel::None => "none",
        OptimizationLevel::Default => "speed",
        OptimizationLevel::Aggressive => "speed_and_size",
    }
}

// ---------------------------------------------------------------------------
// Runtime symbols
// ---------------------------------------------------------------------------

unsafe extern "C" fn silt_print_int(value: i64) {
    println!("{value}");
}

unsafe extern "C" fn silt_print_bool(value: i8) {
    println!("{}", value != 0);
}

unsafe extern "C" fn silt_print_ptr(value: usize) {
    println!("{value:#x}");
}

fn register_jit_runtime_symbols(builder: &mut JITBuilder) {
    builder.symbol("__silt_print_int", silt_print_int as *const u8);
    builder.symbol("__silt_print_bool", silt_print_bool as *const u8);
    builder.symbol("__silt_print_ptr", silt_print_ptr as *const u8);
}

// ---------------------------------------------------------------------------
// Module compilation
// ---------------------------------------------------------------------------

struct ModuleOutcome {
    func_ids: BTreeMap<String, FuncId>,
    stats: PassStats,
    failures: Vec<(String, CodegenError)>,
}

impl ModuleOutcome {
    fn into_artifact(self, object: Vec<u8>) -> BackendArtifact {
        BackendArtifact {
            object,
            stats: self.stats,
            diagnostics: self
                .failures
                .iter()
                .map(|(_, error)| error.to_diagnostic())
                .collect(),
            failed_functions: self.failures.into_iter().map(|(name, _)| name).collect(),
        }
    }
}

/// Imported runtime entry points, declared on demand.
struct RuntimeIds {
    malloc: Option<FuncId>,
    free: Option<FuncId>,
    print_int: Option<FuncId>,
    print_bool: Option<FuncId>,
    print_ptr: Option<FuncId>,
}

fn compile_into_module<M: Module>(
    module: &mut M,
    program: &SsaProgram,
    table: &StructTable,
) -> Result<ModuleOutcome, CodegenError> {
    let mut func_ids: BTreeMap<String, FuncId> = BTreeMap::new();
    let mut signatures: BTreeMap<String, cranelift_codegen::ir::Signature> = BTreeMap::new();
    let mut failures: Vec<(String, CodegenError)> = Vec::new();
    let mut stats = PassStats::default();

    for function in &program.functions {
        let signature = match build_signature(module, function) {
            Ok(signature) => signature,
            Err(error) => {
                log::warn!("codegen: skipping `{}`: {error}", function.name);
                failures.push((function.name.clone(), error));
                continue;
            }
        };
        let linkage = if function.name == "main" {
            Linkage::Export
        } else {
            Linkage::Local
        };
        let func_id = module
            .declare_function(&function.name, linkage, &signature)
            .map_err(|detail| CodegenError::Module {
                detail: detail.to_string(),
            })?;
        func_ids.insert(function.name.clone(), func_id);
        signatures.insert(function.name.clone(), signature);
    }

    let mut runtime = declare_runtime(module, program)?;

    for function in &program.functions {
        let Some(&func_id) = func_ids.get(&function.name) else {
            continue;
        };
        // A failed lowering bails out mid-build and leaves the frontend
        // context dirty, so each function gets its own.
        let mut builder_context = FunctionBuilderContext::new();
        let mut context = module.make_context();
        context.func.signature = signatures
            .get(&function.name)
            .cloned()
            .ok_or_else(|| CodegenError::UnknownFunction {
                function: function.name.clone(),
            })?;

        let lowered = lower_function(
            module,
            &mut context,
            &mut builder_context,
            function,
            table,
            &func_ids,
            &mut runtime,
        );
        match lowered {
            Ok(function_stats) => {
                let defined = module
                    .define_function(func_id, &mut context)
                    .map_err(|detail| CodegenError::Module {
                        detail: format!("{detail:?}"),
                    });
                match defined {
                    Ok(_) => stats.per_function.push(function_stats),
                    Err(error) => {
                        log::warn!("codegen: `{}` failed to define: {error}", function.name);
                        failures.push((function.name.clone(), error));
                    }
                }
            }
            Err(error) => {
                log::warn!("codegen: `{}` failed to lower: {error}", function.name);
                failures.push((function.name.clone(), error));
            }
        }
        module.clear_context(&mut context);
    }

    Ok(ModuleOutcome {
        func_ids,
        stats,
        failures,
    })
}

fn declare_runtime<M: Module>(
    module: &mut M,
    program: &SsaProgram,
) -> Result<RuntimeIds, CodegenError> {
    let any = |pred: fn(&Instruction) -> bool| {
        program
            .functions
            .iter()
            .any(|f| f.blocks.iter().any(|b| b.instructions.iter().any(pred)))
    };
    let ptr_ty = module.target_config().pointer_type();

    let declare_import = |module: &mut M,
                          name: &str,
                          params: &[ClifType],
                          returns: &[ClifType]|
     -> Result<FuncId, CodegenError> {
        let mut signature = module.make_signature();
        for &param in params {
            signature.params.push(AbiParam::new(param));
        }
        for &ret in returns {
            signature.returns.push(AbiParam::new(ret));
        }
        module
            .declare_function(name, Linkage::Import, &signature)
            .map_err(|detail| CodegenError::Module {
                detail: detail.to_string(),
            })
    };

    let malloc = if any(|inst| matches!(inst, Instruction::Alloc { .. })) {
        Some(declare_import(module, "malloc", &[ptr_ty], &[ptr_ty])?)
    } else {
        None
    };
    let free = if any(|inst| matches!(inst, Instruction::Free { .. })) {
        Some(declare_import(module, "free", &[ptr_ty], &[])?)
    } else {
        None
    };
    let (print_int, print_bool, print_ptr) =
        if any(|inst| matches!(inst, Instruction::Print { .. })) {
            (
                Some(declare_import(module, "__silt_print_int", &[types::I64], &[])?),
                Some(declare_import(module, "__silt_print_bool", &[types::I8], &[])?),
                Some(declare_import(module, "__silt_print_ptr", &[ptr_ty], &[])?),
            )
        } else {
            (None, None, None)
        };

    Ok(RuntimeIds {
        malloc,
        free,
        print_int,
        print_bool,
        print_ptr,
    })
}

fn build_signature<M: Module>(
    module: &M,
    function: &SsaFunction,
) -> Result<cranelift_codegen::ir::Signature, CodegenError> {
    let mut signature = module.make_signature();
    let ptr_ty = module.target_config().pointer_type();
    for param in &function.params {
        let ty = clif_type(&param.ty, ptr_ty).ok_or_else(|| CodegenError::UnsupportedType {
            function: function.name.clone(),
            ty: param.ty.to_string(),
            span: Span::synthetic(),
        })?;
        signature.params.push(AbiParam::new(ty));
    }
    if let Some(ret) = &function.ret {
        let ty = clif_type(ret, ptr_ty).ok_or_else(|| CodegenError::UnsupportedType {
            function: function.name.clone(),
            ty: ret.to_string(),
            span: Span::synthetic(),
        })?;
        signature.returns.push(AbiParam::new(ty));
    }
    Ok(signature)
}

/// Cranelift type for an IL type. Bare struct types have no value
/// representation; only pointers to them do.
fn clif_type(ty: &Type, ptr_ty: ClifType) -> Option<ClifType> {
    match ty {
        Type::Int => Some(types::I64),
        Type::Bool => Some(types::I8),
        Type::Ptr(_) => Some(ptr_ty),
        Type::Named(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Function lowering
// ---------------------------------------------------------------------------

struct LowerCtx<'a> {
    function: &'a SsaFunction,
    table: &'a StructTable,
    func_ids: &'a BTreeMap<String, FuncId>,
    runtime: &'a RuntimeIds,
    ptr_ty: ClifType,
    /// IL types per SSA name, for offsets, store checks, and printing.
    tys: BTreeMap<String, Type>,
    values: BTreeMap<String, Value>,
    stats: FunctionPassStats,
}

impl<'a> LowerCtx<'a> {
    fn value(&self, var: &str, span: Span) -> Result<Value, CodegenError> {
        self.values
            .get(var)
            .copied()
            .ok_or_else(|| CodegenError::InvalidValue {
                function: self.function.name.clone(),
                var: var.to_string(),
                span,
            })
    }

    fn ty(&self, var: &str, span: Span) -> Result<&Type, CodegenError> {
        self.tys.get(var).ok_or_else(|| CodegenError::InvalidValue {
            function: self.function.name.clone(),
            var: var.to_string(),
            span,
        })
    }

    fn type_mismatch(&self, detail: String, span: Span) -> CodegenError {
        CodegenError::TypeMismatch {
            function: self.function.name.clone(),
            detail,
            span,
        }
    }
}

fn lower_function<M: Module>(
    module: &mut M,
    context: &mut cranelift_codegen::Context,
    builder_context: &mut FunctionBuilderContext,
    function: &SsaFunction,
    table: &StructTable,
    func_ids: &BTreeMap<String, FuncId>,
    runtime: &mut RuntimeIds,
) -> Result<FunctionPassStats, CodegenError> {
    let ptr_ty = module.target_config().pointer_type();
    let mut ctx = LowerCtx {
        function,
        table,
        func_ids,
        runtime,
        ptr_ty,
        tys: BTreeMap::new(),
        values: BTreeMap::new(),
        stats: FunctionPassStats {
            function: function.name.clone(),
            block_count: function.blocks.len(),
            ..FunctionPassStats::default()
        },
    };

    // Collect IL types up front so forward-referenced jump arguments and
    // store checks can consult them.
    for param in &function.params {
        ctx.tys.insert(param.name.clone(), param.ty.clone());
    }
    for block in &function.blocks {
        for phi in &block.phis {
            ctx.tys.insert(phi.dest.clone(), phi.ty.clone());
        }
        for instr in &block.instructions {
            if let (Some(dest), Some(ty)) = (instr.dest(), instr.declared_ty()) {
                ctx.tys.insert(dest.to_string(), ty);
            }
        }
    }

    if function
        .blocks
        .first()
        .is_some_and(|entry| !entry.phis.is_empty())
    {
        return Err(CodegenError::MalformedFunction {
            function: function.name.clone(),
            detail: "entry block carries phi nodes".to_string(),
        });
    }

    let mut builder = FunctionBuilder::new(&mut context.func, builder_context);
    let mut block_map: BTreeMap<&str, cranelift_codegen::ir::Block> = BTreeMap::new();
    for block in &function.blocks {
        block_map.insert(block.label.as_str(), builder.create_block());
    }

    let entry_block = function
        .blocks
        .first()
        .and_then(|block| block_map.get(block.label.as_str()).copied())
        .ok_or_else(|| CodegenError::MalformedFunction {
            function: function.name.clone(),
            detail: "function has no blocks".to_string(),
        })?;
    builder.append_block_params_for_function_params(entry_block);

    // Phi nodes become block parameters; branches pass the matching values.
    for (index, block) in function.blocks.iter().enumerate() {
        if index == 0 {
            continue;
        }
        let clif_block = block_map[block.label.as_str()];
        for phi in &block.phis {
            let ty =
                clif_type(&phi.ty, ptr_ty).ok_or_else(|| CodegenError::UnsupportedType {
                    function: function.name.clone(),
                    ty: phi.ty.to_string(),
                    span: block.span,
                })?;
            builder.append_block_param(clif_block, ty);
            ctx.stats.phi_count += 1;
        }
    }

    // Blocks arrive in reverse postorder, so every value is materialized
    // before any dominated use reads it from the map.
    for (index, block) in function.blocks.iter().enumerate() {
        let clif_block = block_map[block.label.as_str()];
        builder.switch_to_block(clif_block);
        if index == 0 {
            let params: Vec<Value> = builder.block_params(clif_block).to_vec();
            for (param, value) in function.params.iter().zip(params) {
                ctx.values.insert(param.name.clone(), value);
            }
        } else {
            let params: Vec<Value> = builder.block_params(clif_block).to_vec();
            for (phi, value) in block.phis.iter().zip(params) {
                ctx.values.insert(phi.dest.clone(), value);
            }
        }

        for instr in &block.instructions {
            lower_instruction(module, &mut builder, instr, &mut ctx)?;
        }
        lower_terminator(&mut builder, block, function, &block_map, &ctx)?;
    }

    builder.seal_all_blocks();
    builder.finalize();
    Ok(ctx.stats)
}

fn lower_instruction<M: Module>(
    module: &mut M,
    builder: &mut FunctionBuilder,
    instr: &Instruction,
    ctx: &mut LowerCtx,
) -> Result<(), CodegenError> {
    match instr {
        Instruction::Const {
            dest, ty, value, span, ..
        } => {
            let result = match value {
                Literal::Int(v) => builder.ins().iconst(types::I64, *v),
                Literal::Bool(v) => builder.ins().iconst(types::I8, i64::from(*v)),
                Literal::Nullptr => {
                    if !ty.is_pointer() {
                        return Err(ctx.type_mismatch(
                            format!("nullptr constant declared with non-pointer type `{ty}`"),
                            *span,
                        ));
                    }
                    builder.ins().iconst(ctx.ptr_ty, 0)
                }
            };
            ctx.values.insert(dest.clone(), result);
        }
        Instruction::Binary {
            dest,
            kind,
            lhs,
            rhs,
            span,
            ..
        } => {
            let lhs = ctx.value(lhs, *span)?;
            let rhs = ctx.value(rhs, *span)?;
            let result = match kind {
                BinaryOp::Add => builder.ins().iadd(lhs, rhs),
                BinaryOp::Sub => builder.ins().isub(lhs, rhs),
                BinaryOp::Mul => builder.ins().imul(lhs, rhs),
                // Signed division: traps on divide by zero and on
                // i64::MIN / -1, matching native machine semantics.
                BinaryOp::Div => builder.ins().sdiv(lhs, rhs),
                BinaryOp::Eq => builder.ins().icmp(IntCC::Equal, lhs, rhs),
                BinaryOp::Lt => builder.ins().icmp(IntCC::SignedLessThan, lhs, rhs),
                BinaryOp::Gt => builder.ins().icmp(IntCC::SignedGreaterThan, lhs, rhs),
                BinaryOp::Le => builder.ins().icmp(IntCC::SignedLessThanOrEqual, lhs, rhs),
                BinaryOp::Ge => builder.ins().icmp(IntCC::SignedGreaterThanOrEqual, lhs, rhs),
                BinaryOp::And => builder.ins().band(lhs, rhs),
                BinaryOp::Or => builder.ins().bor(lhs, rhs),
            };
            ctx.values.insert(dest.clone(), result);
        }
        Instruction::Unary {
            dest, kind, arg, span, ..
        } => {
            let arg = ctx.value(arg, *span)?;
            let result = match kind {
                UnaryOp::Not => builder.ins().bxor_imm(arg, 1),
            };
            ctx.values.insert(dest.clone(), result);
        }
        Instruction::Id { dest, arg, span, .. } => {
            let value = ctx.value(arg, *span)?;
            ctx.values.insert(dest.clone(), value);
        }
        Instruction::Call {
            dest,
            func,
            args,
            span,
            ..
        } => {
            let func_id =
                *ctx.func_ids
                    .get(func)
                    .ok_or_else(|| CodegenError::UnknownCallee {
                        function: ctx.function.name.clone(),
                        name: func.clone(),
                        span: *span,
                    })?;
            let func_ref = module.declare_func_in_func(func_id, builder.func);
            let mut lowered_args = Vec::with_capacity(args.len());
            for arg in args {
                lowered_args.push(ctx.value(arg, *span)?);
            }
            let call = builder.ins().call(func_ref, &lowered_args);
            if let Some(dest) = dest {
                let results = builder.inst_results(call);
                let value = results.first().copied().ok_or_else(|| {
                    ctx.type_mismatch(format!("call to `{func}` returns no value"), *span)
                })?;
                ctx.values.insert(dest.clone(), value);
            }
            ctx.stats.call_count += 1;
        }
        Instruction::Print { args, span } => {
            for arg in args {
                let value = ctx.value(arg, *span)?;
                let printer = match ctx.ty(arg, *span)? {
                    Type::Int => ctx.runtime.print_int,
                    Type::Bool => ctx.runtime.print_bool,
                    Type::Ptr(_) => ctx.runtime.print_ptr,
                    Type::Named(name) => {
                        return Err(ctx.type_mismatch(
                            format!("cannot print bare struct value of type `{name}`"),
                            *span,
                        ));
                    }
                };
                let printer = printer.ok_or_else(|| CodegenError::MalformedFunction {
                    function: ctx.function.name.clone(),
                    detail: "print runtime symbol not declared".to_string(),
                })?;
                let print_ref = module.declare_func_in_func(printer, builder.func);
                builder.ins().call(print_ref, &[value]);
            }
        }
        Instruction::Alloc {
            dest,
            ty,
            count,
            span,
            ..
        } => {
            let element_size = ctx.table.element_size(ty).ok_or_else(|| {
                ctx.type_mismatch(format!("cannot size allocation of type `{ty}`"), *span)
            })?;
            let malloc = ctx.runtime.malloc.ok_or_else(|| CodegenError::MalformedFunction {
                function: ctx.function.name.clone(),
                detail: "malloc not declared".to_string(),
            })?;
            let count = ctx.value(count, *span)?;
            let bytes = builder.ins().imul_imm(count, i64::from(element_size));
            let malloc_ref = module.declare_func_in_func(malloc, builder.func);
            let call = builder.ins().call(malloc_ref, &[bytes]);
            let raw_ptr = builder.inst_results(call)[0];
            ctx.values.insert(dest.clone(), raw_ptr);
            ctx.stats.alloc_count += 1;
        }
        Instruction::Free { arg, span } => {
            let free = ctx.runtime.free.ok_or_else(|| CodegenError::MalformedFunction {
                function: ctx.function.name.clone(),
                detail: "free not declared".to_string(),
            })?;
            let value = ctx.value(arg, *span)?;
            let free_ref = module.declare_func_in_func(free, builder.func);
            builder.ins().call(free_ref, &[value]);
        }
        Instruction::Load { dest, ty, ptr, span } => {
            let value_ty =
                clif_type(ty, ctx.ptr_ty).ok_or_else(|| CodegenError::UnsupportedType {
                    function: ctx.function.name.clone(),
                    ty: ty.to_string(),
                    span: *span,
                })?;
            let ptr = ctx.value(ptr, *span)?;
            let result = builder.ins().load(value_ty, MemFlags::new(), ptr, 0);
            ctx.values.insert(dest.clone(), result);
        }
        Instruction::Store { ptr, src, span } => {
            let ptr_il_ty = ctx.ty(ptr, *span)?.clone();
            let pointee = ptr_il_ty.pointee().cloned().ok_or_else(|| {
                ctx.type_mismatch(
                    format!("store through non-pointer `{ptr}` of type `{ptr_il_ty}`"),
                    *span,
                )
            })?;
            let src_ty = ctx.ty(src, *span)?.clone();
            // Stores are never coerced: the value type must be exactly the
            // pointee type.
            if src_ty != pointee {
                return Err(ctx.type_mismatch(
                    format!(
                        "store of `{src}` of type `{src_ty}` through pointer to `{pointee}`"
                    ),
                    *span,
                ));
            }
            let ptr = ctx.value(ptr, *span)?;
            let value = ctx.value(src, *span)?;
            builder.ins().store(MemFlags::new(), value, ptr, 0);
        }
        Instruction::PtrAdd {
            dest,
            ptr,
            offset,
            span,
            ..
        } => {
            let ptr_il_ty = ctx.ty(ptr, *span)?.clone();
            let element_size = ctx.table.element_size(&ptr_il_ty).ok_or_else(|| {
                ctx.type_mismatch(
                    format!("cannot size elements behind `{ptr}` of type `{ptr_il_ty}`"),
                    *span,
                )
            })?;
            let ptr = ctx.value(ptr, *span)?;
            let offset = ctx.value(offset, *span)?;
            let scaled = builder.ins().imul_imm(offset, i64::from(element_size));
            let result = builder.ins().iadd(ptr, scaled);
            ctx.values.insert(dest.clone(), result);
        }
        Instruction::GetMbr {
            dest,
            base,
            member,
            span,
            ..
        } => {
            let base_ty = ctx.ty(base, *span)?.clone();
            let strct = base_ty.pointee_struct().ok_or_else(|| {
                ctx.type_mismatch(
                    format!("member access through `{base}` of type `{base_ty}`"),
                    *span,
                )
            })?;
            let (index, _) = ctx
                .table
                .resolve_member(strct, member, *span)
                .map_err(|error| CodegenError::Member {
                    function: ctx.function.name.clone(),
                    detail: error.to_string(),
                    span: *span,
                })?;
            let offset = ctx.table.byte_offset(strct, index).ok_or_else(|| {
                CodegenError::Member {
                    function: ctx.function.name.clone(),
                    detail: format!("no layout for `{strct}.{member}`"),
                    span: *span,
                }
            })?;
            // Static byte offset; member layout never reaches runtime.
            let base = ctx.value(base, *span)?;
            let result = builder.ins().iadd_imm(base, i64::from(offset));
            ctx.values.insert(dest.clone(), result);
        }
        Instruction::IsNull { dest, arg, span } => {
            let value = ctx.value(arg, *span)?;
            let result = builder.ins().icmp_imm(IntCC::Equal, value, 0);
            ctx.values.insert(dest.clone(), result);
        }
        Instruction::Phi { span, .. } => {
            return Err(ctx.type_mismatch(
                "phi outside block header after SSA conversion".to_string(),
                *span,
            ));
        }
        Instruction::Jmp { .. } | Instruction::Br { .. } | Instruction::Ret { .. } => {
            return Err(CodegenError::MalformedFunction {
                function: ctx.function.name.clone(),
                detail: "terminator in instruction position".to_string(),
            });
        }
    }
    Ok(())
}

fn lower_terminator(
    builder: &mut FunctionBuilder,
    block: &silt_ssa::SsaBlock,
    function: &SsaFunction,
    block_map: &BTreeMap<&str, cranelift_codegen::ir::Block>,
    ctx: &LowerCtx,
) -> Result<(), CodegenError> {
    let jump_args = |target: &str, span: Span| -> Result<Vec<Value>, CodegenError> {
        let target_block = function
            .blocks
            .iter()
            .find(|b| b.label == target)
            .ok_or_else(|| CodegenError::MalformedFunction {
                function: function.name.clone(),
                detail: format!("jump to unknown block `{target}`"),
            })?;
        let mut args = Vec::with_capacity(target_block.phis.len());
        for phi in &target_block.phis {
            let arg = phi
                .args
                .iter()
                .find(|arg| arg.label == block.label)
                .ok_or_else(|| CodegenError::MalformedFunction {
                    function: function.name.clone(),
                    detail: format!(
                        "phi `{}` in `{target}` has no argument for predecessor `{}`",
                        phi.dest, block.label
                    ),
                })?;
            args.push(ctx.value(&arg.var, span)?);
        }
        Ok(args)
    };

    match &block.terminator {
        Terminator::Jmp { target, span } => {
            let args = jump_args(target, *span)?;
            let target_block =
                *block_map
                    .get(target.as_str())
                    .ok_or_else(|| CodegenError::MalformedFunction {
                        function: function.name.clone(),
                        detail: format!("jump to unknown block `{target}`"),
                    })?;
            builder.ins().jump(target_block, &args);
        }
        Terminator::Br {
            cond,
            then_target,
            else_target,
            span,
        } => {
            let cond = ctx.value(cond, *span)?;
            let then_args = jump_args(then_target, *span)?;
            let else_args = jump_args(else_target, *span)?;
            let then_block = *block_map.get(then_target.as_str()).ok_or_else(|| {
                CodegenError::MalformedFunction {
                    function: function.name.clone(),
                    detail: format!("branch to unknown block `{then_target}`"),
                }
            })?;
            let else_block = *block_map.get(else_target.as_str()).ok_or_else(|| {
                CodegenError::MalformedFunction {
                    function: function.name.clone(),
                    detail: format!("branch to unknown block `{else_target}`"),
                }
            })?;
            builder
                .ins()
                .brif(cond, then_block, &then_args, else_block, &else_args);
        }
        Terminator::Ret { value, span } => match value {
            Some(value) => {
                let value = ctx.value(value, *span)?;
                builder.ins().return_(&[value]);
            }
            None => {
                builder.ins().return_(&[]);
            }
        },
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// JIT execution
// ---------------------------------------------------------------------------

/// Compile the program in a JIT module and run its `main`.
///
/// `main` must take no parameters and return `int` (or nothing, which maps
/// to exit code 0). Any function that failed to lower is an error here: the
/// program is about to execute, so partial modules are not acceptable.
pub fn execute_main_jit(
    program: &SsaProgram,
    table: &StructTable,
    config: &BackendConfig,
) -> Result<i64, CodegenError> {
    let main = program
        .functions
        .iter()
        .find(|function| function.name == "main")
        .ok_or_else(|| CodegenError::UnknownFunction {
            function: "main".to_string(),
        })?;
    if !main.params.is_empty() {
        return Err(CodegenError::UnsupportedEntrypoint {
            detail: "JIT entrypoint requires zero-argument `main`".to_string(),
        });
    }
    if !matches!(main.ret, None | Some(Type::Int)) {
        return Err(CodegenError::UnsupportedEntrypoint {
            detail: format!(
                "JIT entrypoint only supports `main` returning int (got `{}`)",
                main.ret.as_ref().map(ToString::to_string).unwrap_or_default()
            ),
        });
    }

    let isa = build_isa(config)?;
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    register_jit_runtime_symbols(&mut builder);
    let mut jit_module = JITModule::new(builder);
    let outcome = compile_into_module(&mut jit_module, program, table)?;
    if let Some((_, error)) = outcome.failures.into_iter().next() {
        return Err(error);
    }
    jit_module
        .finalize_definitions()
        .map_err(|detail| CodegenError::Module {
            detail: detail.to_string(),
        })?;

    let main_id = *outcome
        .func_ids
        .get("main")
        .ok_or_else(|| CodegenError::UnknownFunction {
            function: "main".to_string(),
        })?;
    let entrypoint = jit_module.get_finalized_function(main_id);

    // SAFETY: the `main` signature is validated above before transmuting.
    let exit_code = unsafe {
        match main.ret {
            Some(Type::Int) => {
                let main_fn = std::mem::transmute::<*const u8, extern "C" fn() -> i64>(entrypoint);
                main_fn()
            }
            _ => {
                let main_fn = std::mem::transmute::<*const u8, extern "C" fn()>(entrypoint);
                main_fn();
                0
            }
        }
    };
    Ok(exit_code)
}
