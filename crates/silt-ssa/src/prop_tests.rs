//! Property tests for SSA conversion using proptest.
//!
//! These tests stress invariants that must hold for ANY control-flow shape,
//! not just hand-picked examples. Key properties:
//!
//! 1. Conversion succeeds when every variable is defined at entry
//! 2. Every terminator target names an output block, and every output
//!    block is reachable from the entry
//! 3. `getmbr` member operands come through renaming byte-for-byte
//! 4. Conversion is idempotent: converting the flattened output again
//!    changes nothing

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;
use silt_il::{BinaryOp, Code, Function, Instruction, Literal, Param, Span, Type};

use crate::convert_function;

// ---------------------------------------------------------------------------
// Strategies for generating control-flow graphs
// ---------------------------------------------------------------------------

const VAR_POOL: &[&str] = &["a", "b", "c", "d"];
const MEMBER_POOL: &[&str] = &["next", "value", "flag"];

#[derive(Debug, Clone)]
enum GenInstr {
    Const { dest: &'static str, value: i64 },
    Add { dest: &'static str, lhs: &'static str, rhs: &'static str },
    GetMbr { dest: &'static str, member: &'static str },
}

#[derive(Debug, Clone)]
enum GenTerm {
    Jmp { target: usize },
    Br { then_target: usize, else_target: usize },
    Ret { value: Option<&'static str> },
    Fallthrough,
}

#[derive(Debug, Clone)]
struct GenBlock {
    instrs: Vec<GenInstr>,
    term: GenTerm,
}

fn arb_var() -> impl Strategy<Value = &'static str> {
    prop::sample::select(VAR_POOL)
}

fn arb_instr() -> impl Strategy<Value = GenInstr> {
    prop_oneof![
        (arb_var(), -10i64..=10).prop_map(|(dest, value)| GenInstr::Const { dest, value }),
        (arb_var(), arb_var(), arb_var())
            .prop_map(|(dest, lhs, rhs)| GenInstr::Add { dest, lhs, rhs }),
        (arb_var(), prop::sample::select(MEMBER_POOL))
            .prop_map(|(dest, member)| GenInstr::GetMbr { dest, member }),
    ]
}

/// Generate one block. Targets index into the labeled blocks `L1..=Ln`.
fn arb_block(labeled_count: usize) -> BoxedStrategy<GenBlock> {
    let instrs = prop::collection::vec(arb_instr(), 0..=4);
    let term = prop_oneof![
        2 => (1..=labeled_count).prop_map(|target| GenTerm::Jmp { target }),
        2 => (1..=labeled_count, 1..=labeled_count)
            .prop_map(|(then_target, else_target)| GenTerm::Br { then_target, else_target }),
        2 => prop::option::of(arb_var()).prop_map(|value| GenTerm::Ret { value }),
        1 => Just(GenTerm::Fallthrough),
    ];
    (instrs, term)
        .prop_map(|(instrs, term)| GenBlock { instrs, term })
        .boxed()
}

/// Generate an entry block plus `1..=4` labeled blocks, with every jump
/// target in range. Variables are all defined at entry, so conversion
/// must succeed regardless of the control-flow shape.
fn arb_blocks() -> BoxedStrategy<Vec<GenBlock>> {
    (1usize..=4)
        .prop_flat_map(|labeled_count| {
            prop::collection::vec(arb_block(labeled_count), labeled_count + 1)
        })
        .boxed()
}

fn block_label(index: usize) -> String {
    format!("L{index}")
}

/// Build an IL function from a generated shape. The entry block starts by
/// defining every pool variable and the branch condition, and `p` is a
/// struct-pointer parameter so `getmbr` always has a defined base.
fn build_function(blocks: &[GenBlock]) -> Function {
    let span = Span::synthetic();
    let mut body = Vec::new();
    for (index, block) in blocks.iter().enumerate() {
        if index > 0 {
            body.push(Code::Label {
                label: block_label(index),
                span,
            });
        } else {
            for var in VAR_POOL {
                body.push(Code::Instr(Instruction::Const {
                    dest: var.to_string(),
                    ty: Type::Int,
                    value: Literal::Int(0),
                    span,
                }));
            }
            body.push(Code::Instr(Instruction::Const {
                dest: "cnd".to_string(),
                ty: Type::Bool,
                value: Literal::Bool(true),
                span,
            }));
        }
        for instr in &block.instrs {
            body.push(Code::Instr(match instr {
                GenInstr::Const { dest, value } => Instruction::Const {
                    dest: dest.to_string(),
                    ty: Type::Int,
                    value: Literal::Int(*value),
                    span,
                },
                GenInstr::Add { dest, lhs, rhs } => Instruction::Binary {
                    dest: dest.to_string(),
                    ty: Type::Int,
                    kind: BinaryOp::Add,
                    lhs: lhs.to_string(),
                    rhs: rhs.to_string(),
                    span,
                },
                GenInstr::GetMbr { dest, member } => Instruction::GetMbr {
                    dest: dest.to_string(),
                    ty: Type::ptr_to(Type::Int),
                    base: "p".to_string(),
                    member: member.to_string(),
                    span,
                },
            }));
        }
        match &block.term {
            GenTerm::Jmp { target } => body.push(Code::Instr(Instruction::Jmp {
                target: block_label(*target),
                span,
            })),
            GenTerm::Br {
                then_target,
                else_target,
            } => body.push(Code::Instr(Instruction::Br {
                cond: "cnd".to_string(),
                then_target: block_label(*then_target),
                else_target: block_label(*else_target),
                span,
            })),
            GenTerm::Ret { value } => body.push(Code::Instr(Instruction::Ret {
                value: value.map(str::to_string),
                span,
            })),
            GenTerm::Fallthrough => {}
        }
    }
    Function {
        name: "gen".to_string(),
        params: vec![Param {
            name: "p".to_string(),
            ty: Type::ptr_to(Type::Named("node".to_string())),
        }],
        ret: None,
        body,
        span,
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    /// With every variable defined at the entry, conversion succeeds for
    /// any control-flow shape, every terminator target resolves to an
    /// output block, and every output block is reachable from the entry.
    #[test]
    fn targets_resolve_and_blocks_are_reachable(blocks in arb_blocks()) {
        let out = convert_function(&build_function(&blocks)).unwrap();
        let labels: HashMap<&str, usize> = out
            .function
            .blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (block.label.as_str(), index))
            .collect();
        prop_assert_eq!(labels.len(), out.function.blocks.len());

        let mut reachable = HashSet::new();
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            if !reachable.insert(index) {
                continue;
            }
            for target in out.function.blocks[index].terminator.successors() {
                let target_index = labels.get(target);
                prop_assert!(target_index.is_some(), "dangling target {}", target);
                stack.push(*target_index.unwrap());
            }
        }
        prop_assert_eq!(reachable.len(), out.function.blocks.len());
    }
}

proptest! {
    /// `getmbr` member operands are structural identifiers: for every
    /// surviving block, the member sequence is the one the input had, and
    /// the base pointer never picks up a version suffix because `p` is
    /// only ever defined once.
    #[test]
    fn member_operands_are_never_renamed(blocks in arb_blocks()) {
        let out = convert_function(&build_function(&blocks)).unwrap();
        for block in &out.function.blocks {
            let input_members: Vec<&str> = match block.label.strip_prefix('L') {
                Some(digits) => {
                    let index: usize = digits.parse().unwrap();
                    blocks[index]
                        .instrs
                        .iter()
                        .filter_map(|instr| match instr {
                            GenInstr::GetMbr { member, .. } => Some(*member),
                            _ => None,
                        })
                        .collect()
                }
                // The entry block keeps a generated label.
                None => blocks[0]
                    .instrs
                    .iter()
                    .filter_map(|instr| match instr {
                        GenInstr::GetMbr { member, .. } => Some(*member),
                        _ => None,
                    })
                    .collect(),
            };
            let output: Vec<(&str, &str)> = block
                .instructions
                .iter()
                .filter_map(|instr| match instr {
                    Instruction::GetMbr { base, member, .. } => {
                        Some((base.as_str(), member.as_str()))
                    }
                    _ => None,
                })
                .collect();
            let members: Vec<&str> = output.iter().map(|(_, member)| *member).collect();
            prop_assert_eq!(members, input_members);
            for (base, _) in output {
                prop_assert_eq!(base, "p");
            }
        }
    }
}

proptest! {
    /// Converting the flattened output a second time is a no-op: same
    /// function, no inserted terminators or phis, no renames.
    #[test]
    fn conversion_is_idempotent(blocks in arb_blocks()) {
        let first = convert_function(&build_function(&blocks)).unwrap();
        let second = convert_function(&first.function.to_function()).unwrap();
        prop_assert_eq!(&second.function, &first.function);
        prop_assert_eq!(second.stats.inserted_terminators, 0);
        prop_assert_eq!(second.stats.inserted_phis, 0);
        prop_assert_eq!(second.stats.renamed_definitions, 0);
        prop_assert_eq!(second.stats.dropped_blocks, 0);
    }
}

proptest! {
    /// A read of a name never defined anywhere fails with an undefined
    /// variable error rather than a panic, whatever the surrounding shape.
    #[test]
    fn unknown_reads_fail_cleanly(blocks in arb_blocks()) {
        let mut function = build_function(&blocks);
        function.body.insert(
            VAR_POOL.len() + 1,
            Code::Instr(Instruction::Ret {
                value: Some("never_defined".to_string()),
                span: Span::synthetic(),
            }),
        );
        let result = convert_function(&function);
        let undefined_use = matches!(
            result,
            Err(crate::SsaError::UndefinedVariableUse { ref var, .. })
                if var == "never_defined"
        );
        prop_assert!(undefined_use, "expected an undefined-variable error, got {:?}", result);
    }
}
