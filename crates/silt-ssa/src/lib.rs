//! SSA conversion for the SILT IL.
//!
//! [`convert_function`] rewrites one function's flat instruction stream into
//! SSA form: blocks with exactly one explicit terminator each, phi nodes at
//! merge points, and every value operand renamed to its dominating
//! definition. Two rules make the pass struct-aware:
//!
//! - the `member` operand of `getmbr` is a structural identifier, recognized
//!   by opcode and copied through untouched — it is never looked up in the
//!   renaming environment and never gets a phi node;
//! - every block must end in an explicit control transfer before dominance
//!   analysis runs, so implicit fallthrough is rewritten into an
//!   unconditional jump as a normalization pre-pass.
//!
//! Renaming keeps the original name for the first definition of each
//! variable and mints fresh `name.N` versions only for later definitions,
//! so converting an already-SSA function is a no-op.
//!
//! Unreachable blocks are reported as warnings and dropped; a value read
//! with no dominating definition is fatal for the function.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use silt_diag::{Category, Diagnostic, SourceLocation};
use silt_il::{Code, Function, Instruction, Param, PhiArg, Span, Type};

#[cfg(test)]
mod prop_tests;

/// Errors fatal to the conversion of one function.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SsaError {
    #[error("variable `{var}` in function `{function}` is read with no dominating definition")]
    UndefinedVariableUse {
        function: String,
        var: String,
        span: Span,
    },
    #[error("function `{function}` jumps to unknown label `{label}`")]
    UnknownLabel {
        function: String,
        label: String,
        span: Span,
    },
}

impl SsaError {
    pub fn span(&self) -> Span {
        match self {
            SsaError::UndefinedVariableUse { span, .. } | SsaError::UnknownLabel { span, .. } => {
                *span
            }
        }
    }

    pub fn category(&self) -> Category {
        match self {
            SsaError::UndefinedVariableUse { .. } => Category::UndefinedVariable,
            SsaError::UnknownLabel { .. } => Category::MalformedProgram,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(self.category(), self.to_string()).at(location(self.span()))
    }
}

fn location(span: Span) -> SourceLocation {
    SourceLocation {
        file_id: span.file.0,
        start: span.start,
        end: span.end,
    }
}

// ---------------------------------------------------------------------------
// SSA form
// ---------------------------------------------------------------------------

/// A program with every surviving function in SSA form.
#[derive(Debug, Clone, PartialEq)]
pub struct SsaProgram {
    pub functions: Vec<SsaFunction>,
}

/// One function in SSA form. Blocks are in reverse postorder; the first
/// block is the entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SsaFunction {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Option<Type>,
    pub blocks: Vec<SsaBlock>,
}

/// A basic block: phis, then ordinary instructions, then exactly one
/// terminator. No implicit fallthrough exists after conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct SsaBlock {
    pub label: String,
    pub phis: Vec<PhiNode>,
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
    pub span: Span,
}

/// An SSA merge point. Arguments are sorted by predecessor label.
#[derive(Debug, Clone, PartialEq)]
pub struct PhiNode {
    pub dest: String,
    pub ty: Type,
    pub args: Vec<PhiArg>,
}

/// Explicit block terminators. Every exit path is one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Jmp {
        target: String,
        span: Span,
    },
    Br {
        cond: String,
        then_target: String,
        else_target: String,
        span: Span,
    },
    Ret {
        value: Option<String>,
        span: Span,
    },
}

impl Terminator {
    pub fn successors(&self) -> Vec<&str> {
        match self {
            Terminator::Jmp { target, .. } => vec![target],
            Terminator::Br {
                then_target,
                else_target,
                ..
            } => vec![then_target, else_target],
            Terminator::Ret { .. } => Vec::new(),
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Terminator::Jmp { span, .. }
            | Terminator::Br { span, .. }
            | Terminator::Ret { span, .. } => *span,
        }
    }

    fn to_instruction(&self) -> Instruction {
        match self {
            Terminator::Jmp { target, span } => Instruction::Jmp {
                target: target.clone(),
                span: *span,
            },
            Terminator::Br {
                cond,
                then_target,
                else_target,
                span,
            } => Instruction::Br {
                cond: cond.clone(),
                then_target: then_target.clone(),
                else_target: else_target.clone(),
                span: *span,
            },
            Terminator::Ret { value, span } => Instruction::Ret {
                value: value.clone(),
                span: *span,
            },
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_instruction())
    }
}

impl SsaFunction {
    /// Flatten back to the IL form: labels, phi instructions, terminators.
    /// Converting the result again is a no-op.
    pub fn to_function(&self) -> Function {
        let mut body = Vec::new();
        for block in &self.blocks {
            body.push(Code::Label {
                label: block.label.clone(),
                span: block.span,
            });
            for phi in &block.phis {
                body.push(Code::Instr(Instruction::Phi {
                    dest: phi.dest.clone(),
                    ty: phi.ty.clone(),
                    args: phi.args.clone(),
                    span: Span::synthetic(),
                }));
            }
            for instr in &block.instructions {
                body.push(Code::Instr(instr.clone()));
            }
            body.push(Code::Instr(block.terminator.to_instruction()));
        }
        Function {
            name: self.name.clone(),
            params: self.params.clone(),
            ret: self.ret.clone(),
            body,
            span: Span::synthetic(),
        }
    }
}

impl fmt::Display for SsaFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.name)?;
        if !self.params.is_empty() {
            write!(f, "(")?;
            for (i, param) in self.params.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", param.name, param.ty)?;
            }
            write!(f, ")")?;
        }
        if let Some(ret) = &self.ret {
            write!(f, ": {ret}")?;
        }
        writeln!(f, " {{")?;
        for block in &self.blocks {
            writeln!(f, ".{}:", block.label)?;
            for phi in &block.phis {
                write!(f, "  {}: {} = phi", phi.dest, phi.ty)?;
                for arg in &phi.args {
                    write!(f, " .{} {}", arg.label, arg.var)?;
                }
                writeln!(f)?;
            }
            for instr in &block.instructions {
                writeln!(f, "  {instr}")?;
            }
            writeln!(f, "  {}", block.terminator)?;
        }
        write!(f, "}}")
    }
}

/// Counters describing what conversion did to one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SsaStats {
    /// Fallthrough blocks that received an explicit jump, plus trailing
    /// blocks that received a `ret`.
    pub inserted_terminators: usize,
    pub inserted_phis: usize,
    /// Definitions that received a fresh `name.N` version.
    pub renamed_definitions: usize,
    pub dropped_blocks: usize,
}

/// The result of converting one function.
#[derive(Debug, Clone, PartialEq)]
pub struct SsaConversion {
    pub function: SsaFunction,
    pub warnings: Vec<Diagnostic>,
    pub stats: SsaStats,
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

/// Convert one function to SSA form.
pub fn convert_function(function: &Function) -> Result<SsaConversion, SsaError> {
    Converter::new(function)?.run()
}

struct RawBlock {
    label: String,
    span: Span,
    phis: Vec<PhiBuild>,
    instrs: Vec<Instruction>,
    term: Option<Terminator>,
}

struct PhiBuild {
    dest: String,
    ty: Type,
    /// The variable this phi merges. For phis present in the input this is
    /// the destination itself; for inserted phis it is the original name.
    var: String,
    /// Arguments as given in the input, keyed by predecessor label.
    given_args: BTreeMap<String, String>,
    /// Arguments after renaming, keyed by predecessor label.
    renamed_args: BTreeMap<String, String>,
    preexisting: bool,
}

struct Converter<'f> {
    function: &'f Function,
    blocks: Vec<RawBlock>,
    preds: Vec<Vec<usize>>,
    succs: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    stats: SsaStats,
    warnings: Vec<Diagnostic>,
    // Renaming state.
    stacks: HashMap<String, Vec<String>>,
    counters: HashMap<String, u32>,
    first_def_done: HashSet<String>,
    used_names: HashSet<String>,
}

impl<'f> Converter<'f> {
    fn new(function: &'f Function) -> Result<Self, SsaError> {
        Ok(Self {
            function,
            blocks: form_blocks(function),
            preds: Vec::new(),
            succs: Vec::new(),
            children: Vec::new(),
            stats: SsaStats::default(),
            warnings: Vec::new(),
            stacks: HashMap::new(),
            counters: HashMap::new(),
            first_def_done: HashSet::new(),
            used_names: HashSet::new(),
        })
    }

    fn run(mut self) -> Result<SsaConversion, SsaError> {
        self.shield_entry();
        self.normalize_terminators();
        self.build_cfg()?;
        self.drop_unreachable();
        self.build_cfg()?;

        let rpo = self.reverse_postorder();
        let idom = self.dominators(&rpo);
        let frontiers = self.dominance_frontiers(&idom);
        self.children = dominator_children(&idom);

        let live_in = self.liveness();
        self.place_phis(&frontiers, &live_in);
        self.rename()?;

        log::debug!(
            "ssa: function `{}`: {} blocks, {} terminators inserted, {} phis, {} renames",
            self.function.name,
            self.blocks.len(),
            self.stats.inserted_terminators,
            self.stats.inserted_phis,
            self.stats.renamed_definitions
        );

        Ok(self.finish(&rpo))
    }

    // -- normalization ------------------------------------------------------

    /// The entry block must not be a jump target: phi arguments are keyed by
    /// predecessor label and the function-entry edge has none. When anything
    /// targets the first block's label, front a fresh block that jumps to it.
    fn shield_entry(&mut self) {
        let entry_label = self.blocks[0].label.clone();
        let targeted = self.blocks.iter().any(|block| {
            block
                .term
                .as_ref()
                .is_some_and(|term| term.successors().contains(&entry_label.as_str()))
        });
        if !targeted {
            return;
        }
        let used: HashSet<&str> = self.blocks.iter().map(|b| b.label.as_str()).collect();
        let mut generated = 0usize;
        let label = loop {
            let candidate = format!("b{generated}");
            generated += 1;
            if !used.contains(candidate.as_str()) {
                break candidate;
            }
        };
        let span = self.blocks[0].span;
        self.blocks.insert(
            0,
            RawBlock {
                label,
                span,
                phis: Vec::new(),
                instrs: Vec::new(),
                term: Some(Terminator::Jmp {
                    target: entry_label,
                    span,
                }),
            },
        );
        self.stats.inserted_terminators += 1;
    }

    /// Insert an explicit terminator wherever a block ends without one.
    ///
    /// Runs before any dominance work: merge-point computation assumes an
    /// explicit control-flow graph. A fallthrough block jumps to the
    /// lexically next block; a trailing block returns.
    fn normalize_terminators(&mut self) {
        for index in 0..self.blocks.len() {
            if self.blocks[index].term.is_some() {
                continue;
            }
            let span = self.blocks[index].span;
            let term = match self.blocks.get(index + 1) {
                Some(next) => Terminator::Jmp {
                    target: next.label.clone(),
                    span,
                },
                None => Terminator::Ret { value: None, span },
            };
            self.blocks[index].term = Some(term);
            self.stats.inserted_terminators += 1;
        }
    }

    // -- control-flow graph -------------------------------------------------

    fn build_cfg(&mut self) -> Result<(), SsaError> {
        let labels: HashMap<&str, usize> = self
            .blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (block.label.as_str(), index))
            .collect();
        let mut succs = vec![Vec::new(); self.blocks.len()];
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for (index, block) in self.blocks.iter().enumerate() {
            let term = block.term.as_ref().expect("terminators are normalized");
            for target in term.successors() {
                let target_index =
                    *labels.get(target).ok_or_else(|| SsaError::UnknownLabel {
                        function: self.function.name.clone(),
                        label: target.to_string(),
                        span: term.span(),
                    })?;
                succs[index].push(target_index);
                preds[target_index].push(index);
            }
        }
        self.succs = succs;
        self.preds = preds;
        Ok(())
    }

    fn drop_unreachable(&mut self) {
        let mut reachable = vec![false; self.blocks.len()];
        let mut stack = vec![0usize];
        while let Some(block) = stack.pop() {
            if std::mem::replace(&mut reachable[block], true) {
                continue;
            }
            stack.extend(self.succs[block].iter().copied());
        }
        if reachable.iter().all(|r| *r) {
            return;
        }

        for (index, block) in self.blocks.iter().enumerate() {
            if !reachable[index] {
                let message = format!(
                    "block `{}` in function `{}` is unreachable and was dropped",
                    block.label, self.function.name
                );
                log::warn!("{message}");
                self.warnings.push(
                    Diagnostic::warning(Category::UnreachableBlock, message)
                        .at(location(block.span)),
                );
                self.stats.dropped_blocks += 1;
            }
        }

        let mut keep = reachable.iter();
        self.blocks.retain(|_| *keep.next().expect("one flag per block"));
        // Phi arguments from dropped predecessors disappear with the labels:
        // renamed_args is rebuilt from live predecessors only.
    }

    // -- dominance ----------------------------------------------------------

    fn reverse_postorder(&self) -> Vec<usize> {
        let mut postorder = Vec::with_capacity(self.blocks.len());
        let mut visited = vec![false; self.blocks.len()];
        // Iterative DFS; the second stack entry marks exit.
        let mut stack = vec![(0usize, false)];
        while let Some((block, exiting)) = stack.pop() {
            if exiting {
                postorder.push(block);
                continue;
            }
            if std::mem::replace(&mut visited[block], true) {
                continue;
            }
            stack.push((block, true));
            // Pushing in terminator order makes the reversed postorder list
            // the then-target before the else-target.
            for &succ in &self.succs[block] {
                if !visited[succ] {
                    stack.push((succ, false));
                }
            }
        }
        postorder.reverse();
        postorder
    }

    /// Immediate dominators via the Cooper–Harvey–Kennedy iteration.
    fn dominators(&self, rpo: &[usize]) -> Vec<usize> {
        let mut rpo_position = vec![usize::MAX; self.blocks.len()];
        for (position, &block) in rpo.iter().enumerate() {
            rpo_position[block] = position;
        }

        let mut idom = vec![usize::MAX; self.blocks.len()];
        idom[0] = 0;
        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom = usize::MAX;
                for &pred in &self.preds[block] {
                    if idom[pred] == usize::MAX {
                        continue;
                    }
                    new_idom = if new_idom == usize::MAX {
                        pred
                    } else {
                        intersect(&idom, &rpo_position, new_idom, pred)
                    };
                }
                if new_idom != usize::MAX && idom[block] != new_idom {
                    idom[block] = new_idom;
                    changed = true;
                }
            }
        }
        idom
    }

    fn dominance_frontiers(&self, idom: &[usize]) -> Vec<BTreeSet<usize>> {
        let mut frontiers = vec![BTreeSet::new(); self.blocks.len()];
        for block in 0..self.blocks.len() {
            if self.preds[block].len() < 2 {
                continue;
            }
            for &pred in &self.preds[block] {
                let mut runner = pred;
                while runner != idom[block] {
                    frontiers[runner].insert(block);
                    runner = idom[runner];
                }
            }
        }
        frontiers
    }

    // -- liveness (for pruned phi placement) --------------------------------

    /// Live-in sets per block. Phi arguments count as uses at the end of the
    /// matching predecessor; phi destinations are definitions at block entry.
    fn liveness(&self) -> Vec<HashSet<String>> {
        let block_count = self.blocks.len();
        let mut upward_exposed = vec![HashSet::new(); block_count];
        let mut defs = vec![HashSet::new(); block_count];
        for (index, block) in self.blocks.iter().enumerate() {
            let mut local_defs: HashSet<&str> = HashSet::new();
            for phi in &block.phis {
                local_defs.insert(&phi.dest);
            }
            for instr in &block.instrs {
                for operand in instr.value_operands() {
                    if !local_defs.contains(operand) {
                        upward_exposed[index].insert(operand.to_string());
                    }
                }
                if let Some(dest) = instr.dest() {
                    local_defs.insert(dest);
                }
            }
            let term = block.term.as_ref().expect("terminators are normalized");
            for operand in term_reads(term) {
                if !local_defs.contains(operand) {
                    upward_exposed[index].insert(operand.to_string());
                }
            }
            defs[index] = local_defs.into_iter().map(str::to_string).collect();
        }

        let mut live_in: Vec<HashSet<String>> = vec![HashSet::new(); block_count];
        let mut changed = true;
        while changed {
            changed = false;
            for index in (0..block_count).rev() {
                let mut live_out: HashSet<String> = HashSet::new();
                for &succ in &self.succs[index] {
                    live_out.extend(live_in[succ].iter().cloned());
                    let pred_label = &self.blocks[index].label;
                    for phi in &self.blocks[succ].phis {
                        if let Some(arg) = phi.given_args.get(pred_label) {
                            live_out.insert(arg.clone());
                        }
                    }
                }
                let mut new_live_in = upward_exposed[index].clone();
                for var in live_out {
                    if !defs[index].contains(&var) {
                        new_live_in.insert(var);
                    }
                }
                if new_live_in != live_in[index] {
                    live_in[index] = new_live_in;
                    changed = true;
                }
            }
        }
        live_in
    }

    // -- phi placement ------------------------------------------------------

    /// Iterated-dominance-frontier phi placement, pruned by liveness.
    /// A variable with a single defining block needs no phi, which is what
    /// makes conversion of an already-SSA function a no-op.
    fn place_phis(&mut self, frontiers: &[BTreeSet<usize>], live_in: &[HashSet<String>]) {
        let mut def_blocks: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
        let mut def_types: BTreeMap<String, Type> = BTreeMap::new();
        for param in &self.function.params {
            def_blocks.entry(param.name.clone()).or_default().insert(0);
            def_types.entry(param.name.clone()).or_insert_with(|| param.ty.clone());
        }
        for (index, block) in self.blocks.iter().enumerate() {
            for phi in &block.phis {
                def_blocks.entry(phi.dest.clone()).or_default().insert(index);
                def_types.entry(phi.dest.clone()).or_insert_with(|| phi.ty.clone());
            }
            for instr in &block.instrs {
                if let (Some(dest), Some(ty)) = (instr.dest(), instr.declared_ty()) {
                    def_blocks.entry(dest.to_string()).or_default().insert(index);
                    def_types.entry(dest.to_string()).or_insert(ty);
                }
            }
        }

        for (var, blocks_with_def) in &def_blocks {
            if blocks_with_def.len() < 2 {
                continue;
            }
            let ty = def_types[var].clone();
            let mut placed: BTreeSet<usize> = BTreeSet::new();
            let mut worklist: Vec<usize> = blocks_with_def.iter().copied().collect();
            while let Some(block) = worklist.pop() {
                for &frontier_block in &frontiers[block] {
                    if placed.contains(&frontier_block) || !live_in[frontier_block].contains(var)
                    {
                        continue;
                    }
                    if self.blocks[frontier_block]
                        .phis
                        .iter()
                        .any(|phi| phi.preexisting && phi.var == *var)
                    {
                        // The input already merges this variable here.
                        placed.insert(frontier_block);
                        continue;
                    }
                    self.blocks[frontier_block].phis.push(PhiBuild {
                        dest: var.clone(),
                        ty: ty.clone(),
                        var: var.clone(),
                        given_args: BTreeMap::new(),
                        renamed_args: BTreeMap::new(),
                        preexisting: false,
                    });
                    self.stats.inserted_phis += 1;
                    placed.insert(frontier_block);
                    if !blocks_with_def.contains(&frontier_block) {
                        worklist.push(frontier_block);
                    }
                }
            }
        }
    }

    // -- renaming -----------------------------------------------------------

    fn rename(&mut self) -> Result<(), SsaError> {
        // Seed the fresh-name pool with every name the function mentions.
        for param in &self.function.params {
            self.used_names.insert(param.name.clone());
        }
        for block in &self.blocks {
            for phi in &block.phis {
                self.used_names.insert(phi.dest.clone());
            }
            for instr in &block.instrs {
                if let Some(dest) = instr.dest() {
                    self.used_names.insert(dest.to_string());
                }
            }
        }

        // Parameters are definitions at function entry.
        let params: Vec<String> = self.function.params.iter().map(|p| p.name.clone()).collect();
        for param in &params {
            self.define(param);
        }

        self.rename_block(0)
    }

    fn define(&mut self, base: &str) -> String {
        let name = if self.first_def_done.insert(base.to_string()) {
            base.to_string()
        } else {
            loop {
                let counter = self.counters.entry(base.to_string()).or_insert(0);
                *counter += 1;
                let candidate = format!("{base}.{counter}");
                if !self.used_names.contains(&candidate) {
                    break candidate;
                }
            }
        };
        if name != base {
            self.stats.renamed_definitions += 1;
        }
        self.used_names.insert(name.clone());
        self.stacks.entry(base.to_string()).or_default().push(name.clone());
        name
    }

    fn lookup(&self, base: &str) -> Option<String> {
        self.stacks.get(base).and_then(|stack| stack.last().cloned())
    }

    fn undefined(&self, var: &str, span: Span) -> SsaError {
        SsaError::UndefinedVariableUse {
            function: self.function.name.clone(),
            var: var.to_string(),
            span,
        }
    }

    fn rename_block(&mut self, index: usize) -> Result<(), SsaError> {
        let mut pushed: Vec<String> = Vec::new();

        // Phi destinations are definitions at block entry.
        let mut phis = std::mem::take(&mut self.blocks[index].phis);
        for phi in &mut phis {
            let base = phi.dest.clone();
            phi.dest = self.define(&base);
            pushed.push(base);
        }
        self.blocks[index].phis = phis;

        let mut instrs = std::mem::take(&mut self.blocks[index].instrs);
        let result = self.rename_body(&mut instrs, &mut pushed);
        self.blocks[index].instrs = instrs;
        result?;

        let mut term = self.blocks[index].term.take().expect("terminators are normalized");
        let result = self.rename_terminator(&mut term);
        self.blocks[index].term = Some(term);
        result?;

        self.rename_successor_phis(index)?;

        let children = self.children[index].clone();
        for child in children {
            self.rename_block(child)?;
        }

        for base in pushed.iter().rev() {
            if let Some(stack) = self.stacks.get_mut(base) {
                stack.pop();
            }
        }
        Ok(())
    }

    fn rename_body(
        &mut self,
        instrs: &mut [Instruction],
        pushed: &mut Vec<String>,
    ) -> Result<(), SsaError> {
        for instr in instrs.iter_mut() {
            let span = instr.span();
            // Value operands only: `getmbr` exposes its base pointer here but
            // never its member name, and labels are not operands at all.
            for operand in instr.value_operands_mut() {
                match self.stacks.get(operand.as_str()).and_then(|s| s.last()) {
                    Some(version) => *operand = version.clone(),
                    None => {
                        return Err(SsaError::UndefinedVariableUse {
                            function: self.function.name.clone(),
                            var: operand.clone(),
                            span,
                        });
                    }
                }
            }
            if let Some(dest) = instr.dest() {
                let base = dest.to_string();
                let version = self.define(&base);
                if let Some(dest) = instr.dest_mut() {
                    *dest = version;
                }
                pushed.push(base);
            }
        }
        Ok(())
    }

    fn rename_terminator(&mut self, term: &mut Terminator) -> Result<(), SsaError> {
        match term {
            Terminator::Jmp { .. } => Ok(()),
            Terminator::Br { cond, span, .. } => {
                let span = *span;
                match self.lookup(cond) {
                    Some(version) => {
                        *cond = version;
                        Ok(())
                    }
                    None => Err(self.undefined(cond, span)),
                }
            }
            Terminator::Ret { value, span } => {
                let span = *span;
                if let Some(value) = value {
                    match self.lookup(value) {
                        Some(version) => *value = version,
                        None => return Err(self.undefined(value, span)),
                    }
                }
                Ok(())
            }
        }
    }

    /// Fill in the phi arguments of every successor for the edge from
    /// `index`, using this block's end-of-block environment.
    fn rename_successor_phis(&mut self, index: usize) -> Result<(), SsaError> {
        let label = self.blocks[index].label.clone();
        let span = self.blocks[index].span;
        let succs = self.succs[index].clone();
        for succ in succs {
            let mut phis = std::mem::take(&mut self.blocks[succ].phis);
            let mut failure = None;
            for phi in &mut phis {
                let source = if phi.preexisting {
                    match phi.given_args.get(&label) {
                        Some(arg) => arg.clone(),
                        None => {
                            // A phi with no argument for a live predecessor
                            // reads an undefined value along that path.
                            failure = Some(self.undefined(&phi.dest, span));
                            break;
                        }
                    }
                } else {
                    phi.var.clone()
                };
                match self.lookup(&source) {
                    Some(version) => {
                        phi.renamed_args.insert(label.clone(), version);
                    }
                    None => {
                        failure = Some(self.undefined(&source, span));
                        break;
                    }
                }
            }
            self.blocks[succ].phis = phis;
            if let Some(error) = failure {
                return Err(error);
            }
        }
        Ok(())
    }

    // -- output -------------------------------------------------------------

    fn finish(mut self, rpo: &[usize]) -> SsaConversion {
        let mut ordered = Vec::with_capacity(rpo.len());
        for &index in rpo {
            let block = std::mem::replace(
                &mut self.blocks[index],
                RawBlock {
                    label: String::new(),
                    span: Span::synthetic(),
                    phis: Vec::new(),
                    instrs: Vec::new(),
                    term: None,
                },
            );
            let phis = block
                .phis
                .into_iter()
                .map(|phi| PhiNode {
                    dest: phi.dest,
                    ty: phi.ty,
                    // BTreeMap iteration gives a stable label order.
                    args: phi
                        .renamed_args
                        .into_iter()
                        .map(|(label, var)| PhiArg { label, var })
                        .collect(),
                })
                .collect();
            ordered.push(SsaBlock {
                label: block.label,
                phis,
                instructions: block.instrs,
                terminator: block.term.expect("terminators are normalized"),
                span: block.span,
            });
        }

        SsaConversion {
            function: SsaFunction {
                name: self.function.name.clone(),
                params: self.function.params.clone(),
                ret: self.function.ret.clone(),
                blocks: ordered,
            },
            warnings: self.warnings,
            stats: self.stats,
        }
    }
}

fn term_reads(term: &Terminator) -> Vec<&str> {
    match term {
        Terminator::Jmp { .. } => Vec::new(),
        Terminator::Br { cond, .. } => vec![cond],
        Terminator::Ret { value, .. } => value.iter().map(String::as_str).collect(),
    }
}

fn intersect(idom: &[usize], rpo_position: &[usize], a: usize, b: usize) -> usize {
    let mut finger_a = a;
    let mut finger_b = b;
    while finger_a != finger_b {
        while rpo_position[finger_a] > rpo_position[finger_b] {
            finger_a = idom[finger_a];
        }
        while rpo_position[finger_b] > rpo_position[finger_a] {
            finger_b = idom[finger_b];
        }
    }
    finger_a
}

fn dominator_children(idom: &[usize]) -> Vec<Vec<usize>> {
    let mut children = vec![Vec::new(); idom.len()];
    for (block, &dominator) in idom.iter().enumerate() {
        if block != 0 && dominator != usize::MAX {
            children[dominator].push(block);
        }
    }
    children
}

/// Split a flat instruction stream into raw blocks. Labels open blocks;
/// unlabeled block starts (the function entry, or code following a
/// terminator) get generated labels that never collide with user labels.
fn form_blocks(function: &Function) -> Vec<RawBlock> {
    let used_labels: HashSet<&str> = function
        .body
        .iter()
        .filter_map(|code| match code {
            Code::Label { label, .. } => Some(label.as_str()),
            Code::Instr(_) => None,
        })
        .collect();
    let mut generated = 0usize;
    let mut fresh_label = || loop {
        let candidate = format!("b{generated}");
        generated += 1;
        if !used_labels.contains(candidate.as_str()) {
            break candidate;
        }
    };

    let mut blocks: Vec<RawBlock> = Vec::new();
    let mut current: Option<RawBlock> = None;
    for code in &function.body {
        match code {
            Code::Label { label, span } => {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
                current = Some(RawBlock {
                    label: label.clone(),
                    span: *span,
                    phis: Vec::new(),
                    instrs: Vec::new(),
                    term: None,
                });
            }
            Code::Instr(instr) => {
                let block = current.get_or_insert_with(|| RawBlock {
                    label: fresh_label(),
                    span: instr.span(),
                    phis: Vec::new(),
                    instrs: Vec::new(),
                    term: None,
                });
                match instr {
                    Instruction::Phi {
                        dest, ty, args, ..
                    } => {
                        block.phis.push(PhiBuild {
                            dest: dest.clone(),
                            ty: ty.clone(),
                            var: dest.clone(),
                            given_args: args
                                .iter()
                                .map(|arg| (arg.label.clone(), arg.var.clone()))
                                .collect(),
                            renamed_args: BTreeMap::new(),
                            preexisting: true,
                        });
                    }
                    Instruction::Jmp { target, span } => {
                        block.term = Some(Terminator::Jmp {
                            target: target.clone(),
                            span: *span,
                        });
                        blocks.push(current.take().expect("block is open"));
                    }
                    Instruction::Br {
                        cond,
                        then_target,
                        else_target,
                        span,
                    } => {
                        block.term = Some(Terminator::Br {
                            cond: cond.clone(),
                            then_target: then_target.clone(),
                            else_target: else_target.clone(),
                            span: *span,
                        });
                        blocks.push(current.take().expect("block is open"));
                    }
                    Instruction::Ret { value, span } => {
                        block.term = Some(Terminator::Ret {
                            value: value.clone(),
                            span: *span,
                        });
                        blocks.push(current.take().expect("block is open"));
                    }
                    other => block.instrs.push(other.clone()),
                }
            }
        }
    }
    if let Some(block) = current.take() {
        blocks.push(block);
    }
    if blocks.is_empty() {
        blocks.push(RawBlock {
            label: fresh_label(),
            span: function.span,
            phis: Vec::new(),
            instrs: Vec::new(),
            term: None,
        });
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_il::Literal;

    fn span() -> Span {
        Span::synthetic()
    }

    fn iconst(dest: &str, value: i64) -> Code {
        Code::Instr(Instruction::Const {
            dest: dest.to_string(),
            ty: Type::Int,
            value: Literal::Int(value),
            span: span(),
        })
    }

    fn bconst(dest: &str, value: bool) -> Code {
        Code::Instr(Instruction::Const {
            dest: dest.to_string(),
            ty: Type::Bool,
            value: Literal::Bool(value),
            span: span(),
        })
    }

    fn label(name: &str) -> Code {
        Code::Label {
            label: name.to_string(),
            span: span(),
        }
    }

    fn jmp(target: &str) -> Code {
        Code::Instr(Instruction::Jmp {
            target: target.to_string(),
            span: span(),
        })
    }

    fn br(cond: &str, then_target: &str, else_target: &str) -> Code {
        Code::Instr(Instruction::Br {
            cond: cond.to_string(),
            then_target: then_target.to_string(),
            else_target: else_target.to_string(),
            span: span(),
        })
    }

    fn ret(value: Option<&str>) -> Code {
        Code::Instr(Instruction::Ret {
            value: value.map(str::to_string),
            span: span(),
        })
    }

    fn getmbr(dest: &str, base: &str, member: &str) -> Code {
        Code::Instr(Instruction::GetMbr {
            dest: dest.to_string(),
            ty: Type::ptr_to(Type::Int),
            base: base.to_string(),
            member: member.to_string(),
            span: span(),
        })
    }

    fn function(name: &str, body: Vec<Code>) -> Function {
        Function {
            name: name.to_string(),
            params: vec![],
            ret: None,
            body,
            span: span(),
        }
    }

    fn ptr_param(name: &str, strct: &str) -> Param {
        Param {
            name: name.to_string(),
            ty: Type::ptr_to(Type::Named(strct.to_string())),
        }
    }

    #[test]
    fn fallthrough_becomes_explicit_jump() {
        let f = function(
            "f",
            vec![iconst("a", 1), label("next"), iconst("b", 2), ret(None)],
        );
        let out = convert_function(&f).unwrap();
        assert_eq!(out.stats.inserted_terminators, 1);
        assert_eq!(out.function.blocks.len(), 2);
        assert!(matches!(
            &out.function.blocks[0].terminator,
            Terminator::Jmp { target, .. } if target == "next"
        ));
    }

    #[test]
    fn trailing_block_gets_ret() {
        let f = function("f", vec![iconst("a", 1)]);
        let out = convert_function(&f).unwrap();
        assert_eq!(out.stats.inserted_terminators, 1);
        assert!(matches!(
            &out.function.blocks[0].terminator,
            Terminator::Ret { value: None, .. }
        ));
    }

    #[test]
    fn explicit_terminators_are_kept() {
        let f = function("f", vec![iconst("a", 1), ret(Some("a"))]);
        let out = convert_function(&f).unwrap();
        assert_eq!(out.stats.inserted_terminators, 0);
        assert!(matches!(
            &out.function.blocks[0].terminator,
            Terminator::Ret { value: Some(v), .. } if v == "a"
        ));
    }

    /// A diamond that assigns `p` on both sides: the merge block needs a phi
    /// for `p`, the `getmbr` base must be renamed to the phi destination,
    /// and the member name must come through byte-for-byte.
    fn diamond_with_getmbr() -> Function {
        Function {
            name: "f".to_string(),
            params: vec![ptr_param("p", "point"), ptr_param("q", "point")],
            ret: Some(Type::Int),
            body: vec![
                bconst("c", true),
                br("c", "then", "else"),
                label("then"),
                Code::Instr(Instruction::Id {
                    dest: "p".to_string(),
                    ty: Type::ptr_to(Type::Named("point".to_string())),
                    arg: "q".to_string(),
                    span: span(),
                }),
                jmp("merge"),
                label("else"),
                Code::Instr(Instruction::Id {
                    dest: "p".to_string(),
                    ty: Type::ptr_to(Type::Named("point".to_string())),
                    arg: "p".to_string(),
                    span: span(),
                }),
                jmp("merge"),
                label("merge"),
                getmbr("addr", "p", "x"),
                Code::Instr(Instruction::Load {
                    dest: "v".to_string(),
                    ty: Type::Int,
                    ptr: "addr".to_string(),
                    span: span(),
                }),
                ret(Some("v")),
            ],
            span: span(),
        }
    }

    #[test]
    fn member_names_survive_renaming() {
        let out = convert_function(&diamond_with_getmbr()).unwrap();
        let merge = out
            .function
            .blocks
            .iter()
            .find(|b| b.label == "merge")
            .unwrap();
        assert_eq!(merge.phis.len(), 1, "p needs a merge phi");
        let phi = &merge.phis[0];
        assert_eq!(phi.args.len(), 2);

        let Instruction::GetMbr { base, member, .. } = &merge.instructions[0] else {
            panic!("expected getmbr, got {}", merge.instructions[0]);
        };
        assert_eq!(member, "x", "member operand must be untouched");
        assert_eq!(base, &phi.dest, "base operand renamed to the merge phi");
        assert!(out.stats.inserted_phis >= 1);
    }

    #[test]
    fn conversion_is_idempotent() {
        let first = convert_function(&diamond_with_getmbr()).unwrap();
        let flattened = first.function.to_function();
        let second = convert_function(&flattened).unwrap();
        assert_eq!(second.function, first.function);
        assert_eq!(second.stats.inserted_terminators, 0);
        assert_eq!(second.stats.inserted_phis, 0);
        assert_eq!(second.stats.renamed_definitions, 0);
    }

    #[test]
    fn loop_counter_gets_header_phi() {
        let f = function(
            "count",
            vec![
                iconst("i", 0),
                iconst("one", 1),
                iconst("limit", 3),
                label("head"),
                Code::Instr(Instruction::Binary {
                    dest: "done".to_string(),
                    ty: Type::Bool,
                    kind: silt_il::BinaryOp::Ge,
                    lhs: "i".to_string(),
                    rhs: "limit".to_string(),
                    span: span(),
                }),
                br("done", "exit", "body"),
                label("body"),
                Code::Instr(Instruction::Binary {
                    dest: "i".to_string(),
                    ty: Type::Int,
                    kind: silt_il::BinaryOp::Add,
                    lhs: "i".to_string(),
                    rhs: "one".to_string(),
                    span: span(),
                }),
                jmp("head"),
                label("exit"),
                ret(Some("i")),
            ],
        );
        let out = convert_function(&f).unwrap();
        let head = out.function.blocks.iter().find(|b| b.label == "head").unwrap();
        assert_eq!(head.phis.len(), 1);
        let phi = &head.phis[0];
        assert_eq!(phi.ty, Type::Int);
        assert_eq!(phi.args.len(), 2);
        // One argument per predecessor: the entry and the back edge carry
        // different versions of `i`.
        let versions: BTreeSet<&str> = phi.args.iter().map(|a| a.var.as_str()).collect();
        assert_eq!(versions.len(), 2);
    }

    #[test]
    fn targeted_entry_block_gets_a_preheader() {
        let f = Function {
            name: "double_until".to_string(),
            params: vec![
                Param {
                    name: "i".to_string(),
                    ty: Type::Int,
                },
                Param {
                    name: "c".to_string(),
                    ty: Type::Bool,
                },
            ],
            ret: Some(Type::Int),
            body: vec![
                label("top"),
                Code::Instr(Instruction::Binary {
                    dest: "i".to_string(),
                    ty: Type::Int,
                    kind: silt_il::BinaryOp::Add,
                    lhs: "i".to_string(),
                    rhs: "i".to_string(),
                    span: span(),
                }),
                br("c", "top", "exit"),
                label("exit"),
                ret(Some("i")),
            ],
            span: span(),
        };
        let out = convert_function(&f).unwrap();
        assert_eq!(out.function.blocks[0].label, "b0");
        assert!(out.function.blocks[0].phis.is_empty());
        assert!(matches!(
            &out.function.blocks[0].terminator,
            Terminator::Jmp { target, .. } if target == "top"
        ));
        let top = out.function.blocks.iter().find(|b| b.label == "top").unwrap();
        assert_eq!(top.phis.len(), 1);
        assert_eq!(top.phis[0].args.len(), 2);

        let again = convert_function(&out.function.to_function()).unwrap();
        assert_eq!(again.function, out.function);
        assert_eq!(again.stats.inserted_terminators, 0);
    }

    #[test]
    fn unreachable_block_is_warned_and_dropped() {
        let f = function(
            "f",
            vec![
                iconst("a", 1),
                ret(Some("a")),
                label("dead"),
                iconst("b", 2),
                ret(Some("b")),
            ],
        );
        let out = convert_function(&f).unwrap();
        assert_eq!(out.stats.dropped_blocks, 1);
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].category, Category::UnreachableBlock);
        assert!(out.function.blocks.iter().all(|b| b.label != "dead"));
    }

    #[test]
    fn undefined_variable_is_fatal() {
        let f = function("f", vec![ret(Some("ghost"))]);
        let err = convert_function(&f).unwrap_err();
        assert!(matches!(
            err,
            SsaError::UndefinedVariableUse { ref var, .. } if var == "ghost"
        ));
    }

    #[test]
    fn variable_defined_on_one_path_only_is_fatal_at_merge_use() {
        let f = function(
            "f",
            vec![
                bconst("c", true),
                br("c", "then", "merge"),
                label("then"),
                iconst("v", 1),
                jmp("merge"),
                label("merge"),
                ret(Some("v")),
            ],
        );
        let err = convert_function(&f).unwrap_err();
        assert!(matches!(err, SsaError::UndefinedVariableUse { ref var, .. } if var == "v"));
    }

    #[test]
    fn jump_to_unknown_label_is_reported() {
        let f = function("f", vec![jmp("nowhere")]);
        let err = convert_function(&f).unwrap_err();
        assert!(matches!(err, SsaError::UnknownLabel { ref label, .. } if label == "nowhere"));
    }

    #[test]
    fn straight_line_reassignment_gets_versions() {
        let f = function(
            "f",
            vec![iconst("x", 1), iconst("x", 2), ret(Some("x"))],
        );
        let out = convert_function(&f).unwrap();
        let block = &out.function.blocks[0];
        assert_eq!(block.instructions[0].dest(), Some("x"));
        assert_eq!(block.instructions[1].dest(), Some("x.1"));
        assert!(matches!(
            &block.terminator,
            Terminator::Ret { value: Some(v), .. } if v == "x.1"
        ));
        assert_eq!(out.stats.renamed_definitions, 1);
        assert_eq!(out.stats.inserted_phis, 0);
    }

    #[test]
    fn blocks_are_emitted_in_reverse_postorder() {
        let f = function(
            "f",
            vec![
                bconst("c", true),
                br("c", "left", "right"),
                label("right"),
                ret(None),
                label("left"),
                ret(None),
            ],
        );
        let out = convert_function(&f).unwrap();
        let labels: Vec<&str> = out.function.blocks.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels[0], "b0");
        // Successor order: then before else.
        assert_eq!(labels[1], "left");
        assert_eq!(labels[2], "right");
    }

    #[test]
    fn display_lists_blocks_and_phis() {
        let out = convert_function(&diamond_with_getmbr()).unwrap();
        let text = out.function.to_string();
        assert!(text.contains(".merge:"));
        assert!(text.contains("= phi"));
        assert!(text.contains("getmbr"));
    }
}
