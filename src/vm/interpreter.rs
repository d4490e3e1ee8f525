//! Stack-machine interpreter for [`BytecodeProgram`]s.

use super::machine::{malformed, Machine};
use crate::compiler::codegen::{BytecodeProgram, Instruction};
use crate::compiler::filters;
use crate::error::RenderError;
use crate::types::{ConstIdx, SlotIdx};
use crate::value::{RenderContext, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Supplies programs for `include` and imported macro calls at render time.
pub trait TemplateResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Option<Arc<BytecodeProgram>>;
}

impl TemplateResolver for HashMap<String, Arc<BytecodeProgram>> {
    fn resolve(&self, path: &str) -> Option<Arc<BytecodeProgram>> {
        self.get(path).cloned()
    }
}

/// Resolver for templates that reference nothing.
pub struct NoTemplates;

impl TemplateResolver for NoTemplates {
    fn resolve(&self, _path: &str) -> Option<Arc<BytecodeProgram>> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct Interpreter {
    max_depth: usize,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self { max_depth: 16 }
    }
}

impl Interpreter {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn render(
        &self,
        program: &BytecodeProgram,
        context: &RenderContext,
        resolver: &dyn TemplateResolver,
    ) -> Result<String, RenderError> {
        let mut m = Machine::new(program.slots.len(), program.shared_count);
        self.run(program, 0, &mut m, context, resolver, 0)?;
        Ok(m.out)
    }

    fn run(
        &self,
        program: &BytecodeProgram,
        entry: usize,
        m: &mut Machine,
        ctx: &RenderContext,
        resolver: &dyn TemplateResolver,
        depth: usize,
    ) -> Result<(), RenderError> {
        let code = &program.instructions;
        let mut pc = entry;
        loop {
            let inst = code.get(pc).ok_or(RenderError::PcOutOfBounds {
                pc,
                len: code.len(),
            })?;
            let mut next = pc + 1;
            match inst {
                Instruction::LoadConst(idx) => m.push(constant(program, *idx, pc)?.clone()),
                Instruction::LoadVar(slot) => {
                    let value = match m.local(*slot) {
                        Some(v) => v.clone(),
                        None => context_var(program, ctx, *slot, pc)?,
                    };
                    m.push(value);
                }
                Instruction::GetAttr(idx) => {
                    let name = text(program, *idx, pc)?;
                    let v = m.pop(pc)?;
                    m.push(v.attr(name));
                }
                Instruction::LoadShared(slot) => {
                    let v = m.load_shared(*slot, pc)?;
                    m.push(v);
                }
                Instruction::StoreShared(slot) => m.store_shared(*slot, pc)?,
                Instruction::Concat(n) => m.concat(*n, pc)?,
                Instruction::ApplyFilter { name, argc } => {
                    let name = text(program, *name, pc)?;
                    let args = m.pop_n(*argc as usize, pc)?;
                    let input = m.pop(pc)?;
                    let out = filters::apply(name, &input, &args)
                        .ok_or_else(|| RenderError::UnknownFilter(name.to_string()))?;
                    m.push(out);
                }
                Instruction::ApplyFilterChain(idx) => {
                    let chain = program
                        .filter_chains
                        .get(*idx as usize)
                        .ok_or_else(|| malformed(pc, format!("filter chain {idx} out of bounds")))?;
                    let mut value = m.pop(pc)?;
                    for op in chain {
                        let args = op
                            .args
                            .iter()
                            .map(|a| constant(program, *a, pc).cloned())
                            .collect::<Result<Vec<_>, _>>()?;
                        value = filters::apply(&op.name, &value, &args)
                            .ok_or_else(|| RenderError::UnknownFilter(op.name.clone()))?;
                    }
                    m.push(value);
                }
                Instruction::Compare(op) => m.compare(*op, pc)?,
                Instruction::Not => m.not(pc)?,
                Instruction::JumpIfFalse(target) => {
                    if let Some(t) = m.jump_if_false(*target, pc)? {
                        next = t;
                    }
                }
                Instruction::Jump(target) => next = *target as usize,
                Instruction::BuildRange { start, end } => {
                    m.push(Value::List((*start..*end).map(Value::Int).collect()));
                }
                Instruction::ForStart { slot, exit } => next = m.for_start(*slot, *exit, pc)?.1,
                Instruction::ForNext { slot, body } => next = m.for_next(*slot, *body, pc)?,
                Instruction::ForEnd => m.for_end(pc)?,
                Instruction::Emit => m.emit(pc)?,
                Instruction::EmitRaw => m.emit_raw(pc)?,
                Instruction::RenderInclude(idx) => {
                    let target = text(program, *idx, pc)?;
                    let scope = scope_with_locals(&program.slots, m, ctx);
                    let rendered = self.include(target, &scope, resolver, depth)?;
                    m.out.push_str(&rendered);
                }
                Instruction::CallMacro { index, argc } => {
                    let entry = program
                        .macros
                        .get(*index as usize)
                        .ok_or_else(|| malformed(pc, format!("macro {index} out of bounds")))?;
                    let args = m.pop_n(*argc as usize, pc)?;
                    let rendered = self.call(
                        program,
                        entry.entry as usize,
                        &entry.params,
                        args,
                        ctx,
                        resolver,
                        depth,
                    )?;
                    m.out.push_str(&rendered);
                }
                Instruction::CallImport {
                    template,
                    name,
                    argc,
                } => {
                    let template = text(program, *template, pc)?;
                    let name = text(program, *name, pc)?;
                    let args = m.pop_n(*argc as usize, pc)?;
                    let rendered = self.call_import(template, name, args, ctx, resolver, depth)?;
                    m.out.push_str(&rendered);
                }
                Instruction::Return | Instruction::Halt => return Ok(()),
            }
            pc = next;
        }
    }

    /// Render another template as a nested activation.
    pub(crate) fn include(
        &self,
        target: &str,
        ctx: &RenderContext,
        resolver: &dyn TemplateResolver,
        depth: usize,
    ) -> Result<String, RenderError> {
        self.check_depth(depth)?;
        let program = resolver
            .resolve(target)
            .ok_or_else(|| RenderError::MissingTemplate(target.to_string()))?;
        trace!(target = %target, depth = depth + 1, "Rendering include");
        let mut m = Machine::new(program.slots.len(), program.shared_count);
        self.run(&program, 0, &mut m, ctx, resolver, depth + 1)?;
        Ok(m.out)
    }

    /// Run a macro body of `program` with fresh locals.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn call(
        &self,
        program: &BytecodeProgram,
        entry: usize,
        params: &[SlotIdx],
        args: Vec<Value>,
        ctx: &RenderContext,
        resolver: &dyn TemplateResolver,
        depth: usize,
    ) -> Result<String, RenderError> {
        self.check_depth(depth)?;
        let mut m = Machine::new(program.slots.len(), program.shared_count);
        m.bind_params(params, args);
        self.run(program, entry, &mut m, ctx, resolver, depth + 1)?;
        Ok(m.out)
    }

    pub(crate) fn call_import(
        &self,
        template: &str,
        name: &str,
        args: Vec<Value>,
        ctx: &RenderContext,
        resolver: &dyn TemplateResolver,
        depth: usize,
    ) -> Result<String, RenderError> {
        let program = resolver
            .resolve(template)
            .ok_or_else(|| RenderError::MissingTemplate(template.to_string()))?;
        let entry = program
            .macro_named(name)
            .ok_or_else(|| RenderError::UnknownMacro {
                template: template.to_string(),
                name: name.to_string(),
            })?;
        self.call(
            &program,
            entry.entry as usize,
            &entry.params,
            args,
            ctx,
            resolver,
            depth,
        )
    }

    pub(crate) fn check_depth(&self, depth: usize) -> Result<(), RenderError> {
        if depth + 1 > self.max_depth {
            return Err(RenderError::IncludeDepthExceeded { depth: depth + 1 });
        }
        Ok(())
    }
}

pub(crate) fn constant(program: &BytecodeProgram, idx: ConstIdx, pc: usize) -> Result<&Value, RenderError> {
    program
        .constants
        .get(idx as usize)
        .ok_or_else(|| malformed(pc, format!("constant {idx} out of bounds")))
}

pub(crate) fn text(program: &BytecodeProgram, idx: ConstIdx, pc: usize) -> Result<&str, RenderError> {
    match constant(program, idx, pc)? {
        Value::Str(s) => Ok(s),
        other => Err(malformed(pc, format!("constant {idx} is not a string: {other:?}"))),
    }
}

fn context_var(
    program: &BytecodeProgram,
    ctx: &RenderContext,
    slot: SlotIdx,
    pc: usize,
) -> Result<Value, RenderError> {
    let name = program
        .slots
        .get(slot as usize)
        .ok_or_else(|| malformed(pc, format!("slot {slot} out of bounds")))?;
    Ok(ctx.get(name).cloned().unwrap_or(Value::Null))
}

/// Included templates see the includer's context plus its bound locals.
pub(crate) fn scope_with_locals(slots: &[String], m: &Machine, ctx: &RenderContext) -> RenderContext {
    let mut locals = m
        .bound_locals()
        .filter_map(|(slot, v)| slots.get(slot).map(|name| (name.clone(), v.clone())))
        .peekable();
    if locals.peek().is_none() {
        return ctx.clone();
    }
    ctx.overlay(locals)
}
