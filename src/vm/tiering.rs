//! Execution tiering.
//!
//! Every template starts interpreted. Once its execution count passes the
//! threshold, its program is specialized into a [`FastPath`] whose operands
//! are resolved up front: constants are inlined, filter names are bound to
//! function pointers, and context variables are looked up once per render
//! instead of once per access.

use super::interpreter::{constant, scope_with_locals, text, Interpreter, TemplateResolver};
use super::machine::{malformed, Machine};
use crate::compiler::ast::CmpOp;
use crate::compiler::codegen::{BytecodeProgram, Instruction};
use crate::compiler::filters::{self, FilterFn};
use crate::error::RenderError;
use crate::types::{Addr, SlotIdx};
use crate::value::{RenderContext, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Upper bound on output preallocated for a vectorizable loop.
const MAX_RESERVE_BYTES: usize = 4 * 1024 * 1024;

/// Bytes to preallocate for `count` iterations of a `body_len` instruction body.
fn reserve_hint(count: usize, body_len: usize) -> usize {
    count
        .saturating_mul(body_len)
        .saturating_mul(8)
        .min(MAX_RESERVE_BYTES)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Interpreted,
    Specialized,
}

/// One operation of a specialized program. Addresses match the source
/// program one to one, so jump targets carry over unchanged.
enum FastOp {
    Const(Value),
    Var(SlotIdx),
    Attr(String),
    LoadShared(u32),
    StoreShared(u32),
    Concat(u32),
    Filter { f: FilterFn, argc: usize },
    Chain(Vec<(FilterFn, Vec<Value>)>),
    Compare(CmpOp),
    Not,
    JumpIfFalse(Addr),
    Jump(Addr),
    Range(i64, i64),
    ForStart { slot: SlotIdx, exit: Addr, vectorizable: bool },
    ForNext { slot: SlotIdx, body: Addr },
    ForEnd,
    Emit,
    EmitRaw,
    Include(String),
    CallMacro { entry: Addr, params: Vec<SlotIdx>, argc: usize },
    CallImport { template: String, name: String, argc: usize },
    Stop,
}

/// Specialized form of one program.
pub struct FastPath {
    ops: Vec<FastOp>,
    slots: Vec<String>,
    shared_count: u32,
    shapes: BTreeSet<u64>,
}

fn resolve_filter(name: &str) -> Result<FilterFn, RenderError> {
    filters::lookup(name).ok_or_else(|| RenderError::UnknownFilter(name.to_string()))
}

impl FastPath {
    pub fn specialize(program: &BytecodeProgram) -> Result<Self, RenderError> {
        let vectorizable: HashSet<Addr> = program.hints.vectorizable_loops.iter().copied().collect();
        let mut ops = Vec::with_capacity(program.instructions.len());
        for (pc, inst) in program.instructions.iter().enumerate() {
            let op = match inst {
                Instruction::LoadConst(idx) => FastOp::Const(constant(program, *idx, pc)?.clone()),
                Instruction::LoadVar(slot) => FastOp::Var(*slot),
                Instruction::GetAttr(idx) => FastOp::Attr(text(program, *idx, pc)?.to_string()),
                Instruction::LoadShared(s) => FastOp::LoadShared(*s),
                Instruction::StoreShared(s) => FastOp::StoreShared(*s),
                Instruction::Concat(n) => FastOp::Concat(*n),
                Instruction::ApplyFilter { name, argc } => FastOp::Filter {
                    f: resolve_filter(text(program, *name, pc)?)?,
                    argc: *argc as usize,
                },
                Instruction::ApplyFilterChain(idx) => {
                    let chain = program
                        .filter_chains
                        .get(*idx as usize)
                        .ok_or_else(|| malformed(pc, format!("filter chain {idx} out of bounds")))?;
                    let mut steps = Vec::with_capacity(chain.len());
                    for op in chain {
                        let args = op
                            .args
                            .iter()
                            .map(|a| constant(program, *a, pc).cloned())
                            .collect::<Result<Vec<_>, _>>()?;
                        steps.push((resolve_filter(&op.name)?, args));
                    }
                    FastOp::Chain(steps)
                }
                Instruction::Compare(op) => FastOp::Compare(*op),
                Instruction::Not => FastOp::Not,
                Instruction::JumpIfFalse(t) => FastOp::JumpIfFalse(*t),
                Instruction::Jump(t) => FastOp::Jump(*t),
                Instruction::BuildRange { start, end } => FastOp::Range(*start, *end),
                Instruction::ForStart { slot, exit } => FastOp::ForStart {
                    slot: *slot,
                    exit: *exit,
                    vectorizable: vectorizable.contains(&(pc as Addr)),
                },
                Instruction::ForNext { slot, body } => FastOp::ForNext {
                    slot: *slot,
                    body: *body,
                },
                Instruction::ForEnd => FastOp::ForEnd,
                Instruction::Emit => FastOp::Emit,
                Instruction::EmitRaw => FastOp::EmitRaw,
                Instruction::RenderInclude(idx) => FastOp::Include(text(program, *idx, pc)?.to_string()),
                Instruction::CallMacro { index, argc } => {
                    let entry = program
                        .macros
                        .get(*index as usize)
                        .ok_or_else(|| malformed(pc, format!("macro {index} out of bounds")))?;
                    FastOp::CallMacro {
                        entry: entry.entry,
                        params: entry.params.clone(),
                        argc: *argc as usize,
                    }
                }
                Instruction::CallImport {
                    template,
                    name,
                    argc,
                } => FastOp::CallImport {
                    template: text(program, *template, pc)?.to_string(),
                    name: text(program, *name, pc)?.to_string(),
                    argc: *argc as usize,
                },
                Instruction::Return | Instruction::Halt => FastOp::Stop,
            };
            ops.push(op);
        }
        Ok(Self {
            ops,
            slots: program.slots.clone(),
            shared_count: program.shared_count,
            shapes: program.hints.shapes.iter().map(|(_, id)| *id).collect(),
        })
    }

    /// Distinct recurring structures this program was specialized for.
    pub fn shape_count(&self) -> usize {
        self.shapes.len()
    }

    pub fn render(
        &self,
        interpreter: &Interpreter,
        context: &RenderContext,
        resolver: &dyn TemplateResolver,
    ) -> Result<String, RenderError> {
        let resolved: Vec<Value> = self
            .slots
            .iter()
            .map(|name| context.get(name).cloned().unwrap_or(Value::Null))
            .collect();
        let mut m = Machine::new(self.slots.len(), self.shared_count);
        self.run(0, &mut m, &resolved, interpreter, context, resolver, 0)?;
        Ok(m.out)
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &self,
        entry: usize,
        m: &mut Machine,
        resolved: &[Value],
        interpreter: &Interpreter,
        ctx: &RenderContext,
        resolver: &dyn TemplateResolver,
        depth: usize,
    ) -> Result<(), RenderError> {
        let mut pc = entry;
        loop {
            let op = self.ops.get(pc).ok_or(RenderError::PcOutOfBounds {
                pc,
                len: self.ops.len(),
            })?;
            let mut next = pc + 1;
            match op {
                FastOp::Const(v) => m.push(v.clone()),
                FastOp::Var(slot) => {
                    let value = match m.local(*slot) {
                        Some(v) => v.clone(),
                        None => resolved.get(*slot as usize).cloned().unwrap_or(Value::Null),
                    };
                    m.push(value);
                }
                FastOp::Attr(name) => {
                    let v = m.pop(pc)?;
                    m.push(v.attr(name));
                }
                FastOp::LoadShared(s) => {
                    let v = m.load_shared(*s, pc)?;
                    m.push(v);
                }
                FastOp::StoreShared(s) => m.store_shared(*s, pc)?,
                FastOp::Concat(n) => m.concat(*n, pc)?,
                FastOp::Filter { f, argc } => {
                    let args = m.pop_n(*argc, pc)?;
                    let input = m.pop(pc)?;
                    m.push((*f)(&input, &args));
                }
                FastOp::Chain(steps) => {
                    let mut value = m.pop(pc)?;
                    for (f, args) in steps {
                        value = (*f)(&value, args.as_slice());
                    }
                    m.push(value);
                }
                FastOp::Compare(op) => m.compare(*op, pc)?,
                FastOp::Not => m.not(pc)?,
                FastOp::JumpIfFalse(t) => {
                    if let Some(t) = m.jump_if_false(*t, pc)? {
                        next = t;
                    }
                }
                FastOp::Jump(t) => next = *t as usize,
                FastOp::Range(start, end) => {
                    m.push(Value::List((*start..*end).map(Value::Int).collect()));
                }
                FastOp::ForStart {
                    slot,
                    exit,
                    vectorizable,
                } => {
                    let (count, target) = m.for_start(*slot, *exit, pc)?;
                    if *vectorizable {
                        // Straight-line body: output grows by about the same amount per item.
                        let body_len = (*exit as usize).saturating_sub(pc);
                        m.out.reserve(reserve_hint(count, body_len));
                    }
                    next = target;
                }
                FastOp::ForNext { slot, body } => next = m.for_next(*slot, *body, pc)?,
                FastOp::ForEnd => m.for_end(pc)?,
                FastOp::Emit => m.emit(pc)?,
                FastOp::EmitRaw => m.emit_raw(pc)?,
                FastOp::Include(target) => {
                    let scope = scope_with_locals(&self.slots, m, ctx);
                    let rendered = interpreter.include(target, &scope, resolver, depth)?;
                    m.out.push_str(&rendered);
                }
                FastOp::CallMacro {
                    entry,
                    params,
                    argc,
                } => {
                    interpreter.check_depth(depth)?;
                    let args = m.pop_n(*argc, pc)?;
                    let mut frame = Machine::new(self.slots.len(), self.shared_count);
                    frame.bind_params(params, args);
                    self.run(
                        *entry as usize,
                        &mut frame,
                        resolved,
                        interpreter,
                        ctx,
                        resolver,
                        depth + 1,
                    )?;
                    m.out.push_str(&frame.out);
                }
                FastOp::CallImport {
                    template,
                    name,
                    argc,
                } => {
                    let args = m.pop_n(*argc, pc)?;
                    let rendered = interpreter.call_import(template, name, args, ctx, resolver, depth)?;
                    m.out.push_str(&rendered);
                }
                FastOp::Stop => return Ok(()),
            }
            pc = next;
        }
    }
}

/// Result of one tiered execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub output: String,
    pub tier: Tier,
    /// This execution crossed the threshold and built the fast path.
    pub promoted: bool,
}

#[derive(Default)]
struct Counter {
    executions: u64,
    fast: Option<Arc<FastPath>>,
}

/// Counts executions per template identity and promotes hot programs.
pub struct TieringCompiler {
    threshold: u64,
    interpreter: Interpreter,
    counters: Mutex<HashMap<String, Counter>>,
}

impl TieringCompiler {
    pub fn new(threshold: u64, max_include_depth: usize) -> Self {
        Self {
            threshold,
            interpreter: Interpreter::new(max_include_depth),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    fn counters(&self) -> MutexGuard<'_, HashMap<String, Counter>> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `program` under `identity`, choosing the tier by execution count.
    /// The identity must change whenever the program does.
    pub fn execute(
        &self,
        identity: &str,
        program: &BytecodeProgram,
        context: &RenderContext,
        resolver: &dyn TemplateResolver,
    ) -> Result<Execution, RenderError> {
        let (fast, promoted) = {
            let mut counters = self.counters();
            let counter = counters.entry(identity.to_string()).or_default();
            counter.executions += 1;
            let mut promoted = false;
            if counter.fast.is_none() && counter.executions > self.threshold {
                match FastPath::specialize(program) {
                    Ok(fast) => {
                        info!(
                            template = %identity,
                            executions = counter.executions,
                            shapes = fast.shape_count(),
                            "Promoted template to specialized tier"
                        );
                        counter.fast = Some(Arc::new(fast));
                        promoted = true;
                    }
                    Err(e) => {
                        warn!(template = %identity, error = %e, "Specialization failed; staying interpreted");
                    }
                }
            }
            (counter.fast.clone(), promoted)
        };

        match fast {
            Some(fast) => Ok(Execution {
                output: fast.render(&self.interpreter, context, resolver)?,
                tier: Tier::Specialized,
                promoted,
            }),
            None => Ok(Execution {
                output: self.interpreter.render(program, context, resolver)?,
                tier: Tier::Interpreted,
                promoted: false,
            }),
        }
    }

    pub fn executions(&self, identity: &str) -> u64 {
        self.counters().get(identity).map_or(0, |c| c.executions)
    }

    pub fn tier(&self, identity: &str) -> Tier {
        match self.counters().get(identity) {
            Some(Counter { fast: Some(_), .. }) => Tier::Specialized,
            _ => Tier::Interpreted,
        }
    }

    /// Forget the counter and fast path for `identity`.
    pub fn invalidate(&self, identity: &str) -> bool {
        self.counters().remove(identity).is_some()
    }
}
