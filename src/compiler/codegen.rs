//! Bytecode generation.
//!
//! Lowers an optimized AST depth-first into a flat stack-machine program.
//! Constants and variable names are pooled and referenced by index, so a
//! program carries no pointers and two compilations of the same tree are
//! byte-identical.

use super::ast::*;
use super::filters;
use crate::error::CompileError;
use crate::hash::ContentHash;
use crate::types::{Addr, ConstIdx, SlotIdx};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    LoadConst(ConstIdx),
    /// Push a loop/macro local if bound, else the context variable, else null.
    LoadVar(SlotIdx),
    /// Replace the top of stack with its attribute named by a string constant.
    GetAttr(ConstIdx),
    LoadShared(u32),
    StoreShared(u32),
    /// Pop `n` values and push their `~` concatenation.
    Concat(u32),
    /// Pop `argc` arguments then the input, push the filter result.
    ApplyFilter { name: ConstIdx, argc: u32 },
    ApplyFilterChain(u32),
    Compare(CmpOp),
    Not,
    JumpIfFalse(Addr),
    Jump(Addr),
    BuildRange { start: i64, end: i64 },
    /// Pop an iterable. Empty: jump to `exit`; else bind the first item.
    ForStart { slot: SlotIdx, exit: Addr },
    /// Bind the next item and jump to `body`, or fall through when exhausted.
    ForNext { slot: SlotIdx, body: Addr },
    ForEnd,
    /// Pop and write, escaping unless the value is marked safe.
    Emit,
    EmitRaw,
    RenderInclude(ConstIdx),
    CallMacro { index: u32, argc: u32 },
    CallImport {
        template: ConstIdx,
        name: ConstIdx,
        argc: u32,
    },
    Return,
    Halt,
}

impl Instruction {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::LoadConst(_) => "LOAD_CONST",
            Instruction::LoadVar(_) => "LOAD_VAR",
            Instruction::GetAttr(_) => "GET_ATTR",
            Instruction::LoadShared(_) => "LOAD_SHARED",
            Instruction::StoreShared(_) => "STORE_SHARED",
            Instruction::Concat(_) => "CONCAT",
            Instruction::ApplyFilter { .. } => "APPLY_FILTER",
            Instruction::ApplyFilterChain(_) => "APPLY_FILTER_CHAIN",
            Instruction::Compare(_) => "COMPARE",
            Instruction::Not => "NOT",
            Instruction::JumpIfFalse(_) => "JUMP_IF_FALSE",
            Instruction::Jump(_) => "JUMP",
            Instruction::BuildRange { .. } => "BUILD_RANGE",
            Instruction::ForStart { .. } => "FOR_START",
            Instruction::ForNext { .. } => "FOR_NEXT",
            Instruction::ForEnd => "FOR_END",
            Instruction::Emit => "EMIT",
            Instruction::EmitRaw => "EMIT_RAW",
            Instruction::RenderInclude(_) => "RENDER_INCLUDE",
            Instruction::CallMacro { .. } => "CALL_MACRO",
            Instruction::CallImport { .. } => "CALL_IMPORT",
            Instruction::Return => "RETURN",
            Instruction::Halt => "HALT",
        }
    }
}

/// One step of a pre-resolved filter chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterOp {
    pub name: String,
    pub args: Vec<ConstIdx>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MacroEntry {
    pub name: String,
    pub params: Vec<SlotIdx>,
    pub entry: Addr,
}

/// Optimizer annotations carried into the program for the fast path.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramHints {
    /// `ForStart` addresses of loops tagged hot.
    pub hot_loops: Vec<Addr>,
    /// `ForStart` addresses of loops whose body is array-shaped.
    pub vectorizable_loops: Vec<Addr>,
    /// Start address and shape id of specialized recurring structures.
    pub shapes: Vec<(Addr, u64)>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BytecodeProgram {
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Value>,
    pub slots: Vec<String>,
    pub filter_chains: Vec<Vec<FilterOp>>,
    pub macros: Vec<MacroEntry>,
    pub shared_count: u32,
    pub hints: ProgramHints,
}

impl BytecodeProgram {
    /// Check every constant, slot, chain, macro and jump index is in bounds.
    pub fn verify(&self) -> Result<(), String> {
        let len = self.instructions.len();
        let constant = |idx: ConstIdx, pc: usize| -> Result<(), String> {
            if (idx as usize) < self.constants.len() {
                Ok(())
            } else {
                Err(format!("pc {pc}: constant {idx} out of bounds"))
            }
        };
        let string_constant = |idx: ConstIdx, pc: usize| -> Result<(), String> {
            constant(idx, pc)?;
            match &self.constants[idx as usize] {
                Value::Str(_) => Ok(()),
                other => Err(format!("pc {pc}: constant {idx} is not a string: {other:?}")),
            }
        };
        let slot = |idx: SlotIdx, pc: usize| -> Result<(), String> {
            if (idx as usize) < self.slots.len() {
                Ok(())
            } else {
                Err(format!("pc {pc}: slot {idx} out of bounds"))
            }
        };
        let addr = |target: Addr, pc: usize| -> Result<(), String> {
            if (target as usize) < len {
                Ok(())
            } else {
                Err(format!("pc {pc}: jump target {target} out of bounds"))
            }
        };

        if !matches!(self.instructions.last(), Some(Instruction::Halt | Instruction::Return)) {
            return Err("program does not end with a terminator".to_string());
        }

        for (pc, inst) in self.instructions.iter().enumerate() {
            match inst {
                Instruction::LoadConst(idx) => constant(*idx, pc)?,
                Instruction::GetAttr(idx) | Instruction::RenderInclude(idx) => {
                    string_constant(*idx, pc)?
                }
                Instruction::LoadVar(idx) => slot(*idx, pc)?,
                Instruction::LoadShared(idx) | Instruction::StoreShared(idx) => {
                    if *idx >= self.shared_count {
                        return Err(format!("pc {pc}: shared slot {idx} out of bounds"));
                    }
                }
                Instruction::ApplyFilter { name, .. } => {
                    string_constant(*name, pc)?;
                    if let Value::Str(name) = &self.constants[*name as usize] {
                        if !filters::is_known(name) {
                            return Err(format!("pc {pc}: unknown filter '{name}'"));
                        }
                    }
                }
                Instruction::ApplyFilterChain(idx) => {
                    let chain = self
                        .filter_chains
                        .get(*idx as usize)
                        .ok_or_else(|| format!("pc {pc}: filter chain {idx} out of bounds"))?;
                    for op in chain {
                        if !filters::is_known(&op.name) {
                            return Err(format!("pc {pc}: unknown filter '{}'", op.name));
                        }
                        for arg in &op.args {
                            constant(*arg, pc)?;
                        }
                    }
                }
                Instruction::JumpIfFalse(target) | Instruction::Jump(target) => addr(*target, pc)?,
                Instruction::ForStart { slot: s, exit } => {
                    slot(*s, pc)?;
                    addr(*exit, pc)?;
                }
                Instruction::ForNext { slot: s, body } => {
                    slot(*s, pc)?;
                    addr(*body, pc)?;
                }
                Instruction::CallMacro { index, argc } => {
                    let entry = self
                        .macros
                        .get(*index as usize)
                        .ok_or_else(|| format!("pc {pc}: macro {index} out of bounds"))?;
                    if entry.params.len() < *argc as usize {
                        return Err(format!(
                            "pc {pc}: macro '{}' takes {} arguments, got {argc}",
                            entry.name,
                            entry.params.len()
                        ));
                    }
                }
                Instruction::CallImport { template, name, .. } => {
                    string_constant(*template, pc)?;
                    string_constant(*name, pc)?;
                }
                Instruction::Concat(_)
                | Instruction::Compare(_)
                | Instruction::Not
                | Instruction::BuildRange { .. }
                | Instruction::ForEnd
                | Instruction::Emit
                | Instruction::EmitRaw
                | Instruction::Return
                | Instruction::Halt => {}
            }
        }

        for entry in &self.macros {
            addr(entry.entry, 0).map_err(|_| format!("macro '{}' entry out of bounds", entry.name))?;
            for param in &entry.params {
                slot(*param, 0)?;
            }
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON encoding.
    pub fn fingerprint(&self) -> ContentHash {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        ContentHash::of(&encoded)
    }

    pub fn macro_named(&self, name: &str) -> Option<&MacroEntry> {
        self.macros.iter().find(|m| m.name == name)
    }

    /// Templates this program loads at render time.
    pub fn referenced_templates(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .instructions
            .iter()
            .filter_map(|inst| match inst {
                Instruction::RenderInclude(idx) | Instruction::CallImport { template: idx, .. } => {
                    match self.constants.get(*idx as usize) {
                        Some(Value::Str(path)) => Some(path.clone()),
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn count(&self, pred: impl Fn(&Instruction) -> bool) -> usize {
        self.instructions.iter().filter(|i| pred(i)).count()
    }

    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (pc, inst) in self.instructions.iter().enumerate() {
            if let Some(m) = self.macros.iter().find(|m| m.entry as usize == pc) {
                let _ = writeln!(out, "{}:", m.name);
            }
            let operand = match inst {
                Instruction::LoadConst(idx) => format!("{idx} ; {:?}", self.constants[*idx as usize]),
                Instruction::LoadVar(idx) => format!("{idx} ; {}", self.slots[*idx as usize]),
                Instruction::GetAttr(idx) | Instruction::RenderInclude(idx) => {
                    format!("{idx} ; {}", self.constants[*idx as usize].to_text())
                }
                Instruction::LoadShared(idx) | Instruction::StoreShared(idx) => idx.to_string(),
                Instruction::Concat(n) => n.to_string(),
                Instruction::ApplyFilter { name, argc } => {
                    format!("{} argc={argc}", self.constants[*name as usize].to_text())
                }
                Instruction::ApplyFilterChain(idx) => {
                    let names: Vec<&str> = self.filter_chains[*idx as usize]
                        .iter()
                        .map(|op| op.name.as_str())
                        .collect();
                    format!("{idx} ; {}", names.join(" | "))
                }
                Instruction::Compare(op) => format!("{op:?}"),
                Instruction::JumpIfFalse(t) | Instruction::Jump(t) => format!("-> {t}"),
                Instruction::BuildRange { start, end } => format!("{start}..{end}"),
                Instruction::ForStart { slot, exit } => {
                    format!("{} exit -> {exit}", self.slots[*slot as usize])
                }
                Instruction::ForNext { slot, body } => {
                    format!("{} body -> {body}", self.slots[*slot as usize])
                }
                Instruction::CallMacro { index, argc } => {
                    format!("{} argc={argc}", self.macros[*index as usize].name)
                }
                Instruction::CallImport {
                    template,
                    name,
                    argc,
                } => format!(
                    "{}::{} argc={argc}",
                    self.constants[*template as usize].to_text(),
                    self.constants[*name as usize].to_text()
                ),
                _ => String::new(),
            };
            let _ = writeln!(out, "{pc:>5}  {:<20}{operand}", inst.mnemonic());
        }
        out
    }
}

/// Value of a compile-time global, `Null` when undefined.
pub(crate) fn global_value(globals: &BTreeMap<String, serde_json::Value>, path: &VarPath) -> Value {
    let root = globals
        .get(&path.root)
        .map(Value::from_json)
        .unwrap_or(Value::Null);
    path.attrs.iter().fold(root, |v, attr| v.attr(attr))
}

/// Lower `ast` into a verified program.
pub fn generate(
    path: &str,
    ast: &Ast,
    globals: &BTreeMap<String, serde_json::Value>,
) -> Result<BytecodeProgram, CompileError> {
    let mut gen = Codegen {
        path,
        ast,
        globals,
        program: BytecodeProgram {
            shared_count: ast.shared.len() as u32,
            ..Default::default()
        },
        const_index: HashMap::new(),
        slot_index: HashMap::new(),
        macro_index: HashMap::new(),
        macro_bodies: Vec::new(),
        imports: HashMap::new(),
        in_macro: false,
    };
    gen.declare_macros_and_imports();

    for (slot, shared) in ast.shared.iter().enumerate() {
        gen.expr(&shared.expr);
        gen.filters(&shared.filters, false)?;
        gen.emit(Instruction::StoreShared(slot as u32));
    }
    gen.sequence(&ast.root)?;
    gen.emit(Instruction::Halt);

    gen.in_macro = true;
    for (index, body) in std::mem::take(&mut gen.macro_bodies).into_iter().enumerate() {
        gen.program.macros[index].entry = gen.here();
        gen.sequence(&body)?;
        gen.emit(Instruction::Return);
    }

    let program = gen.program;
    program
        .verify()
        .map_err(|message| CompileError::InvalidProgram {
            path: path.to_string(),
            message,
        })?;
    tracing::debug!(
        template = %path,
        instructions = program.instructions.len(),
        constants = program.constants.len(),
        slots = program.slots.len(),
        "Generated bytecode"
    );
    Ok(program)
}

struct Codegen<'a> {
    path: &'a str,
    ast: &'a Ast,
    globals: &'a BTreeMap<String, serde_json::Value>,
    program: BytecodeProgram,
    const_index: HashMap<String, ConstIdx>,
    slot_index: HashMap<String, SlotIdx>,
    macro_index: HashMap<String, u32>,
    macro_bodies: Vec<Vec<NodeId>>,
    imports: HashMap<String, String>,
    in_macro: bool,
}

impl Codegen<'_> {
    fn here(&self) -> Addr {
        self.program.instructions.len() as Addr
    }

    fn emit(&mut self, inst: Instruction) -> usize {
        self.program.instructions.push(inst);
        self.program.instructions.len() - 1
    }

    fn patch(&mut self, at: usize, target: Addr) {
        match &mut self.program.instructions[at] {
            Instruction::Jump(t) | Instruction::JumpIfFalse(t) => *t = target,
            Instruction::ForStart { exit, .. } => *exit = target,
            _ => {}
        }
    }

    fn constant(&mut self, value: Value) -> ConstIdx {
        let key = format!("{value:?}");
        if let Some(idx) = self.const_index.get(&key) {
            return *idx;
        }
        let idx = self.program.constants.len() as ConstIdx;
        self.program.constants.push(value);
        self.const_index.insert(key, idx);
        idx
    }

    fn string(&mut self, s: &str) -> ConstIdx {
        self.constant(Value::Str(s.to_string()))
    }

    fn slot(&mut self, name: &str) -> SlotIdx {
        if let Some(idx) = self.slot_index.get(name) {
            return *idx;
        }
        let idx = self.program.slots.len() as SlotIdx;
        self.program.slots.push(name.to_string());
        self.slot_index.insert(name.to_string(), idx);
        idx
    }

    /// Macros are callable from anywhere in the template, so they are
    /// indexed before any code is emitted. A later definition replaces an
    /// earlier one of the same name.
    fn declare_macros_and_imports(&mut self) {
        let ast = self.ast;
        for id in ast.preorder() {
            match &ast.node(id).kind {
                NodeKind::Macro { name, params, body } => {
                    let params = params.iter().map(|p| self.slot(p)).collect();
                    let entry = MacroEntry {
                        name: name.clone(),
                        params,
                        entry: 0,
                    };
                    match self.macro_index.get(name) {
                        Some(&index) => {
                            self.program.macros[index as usize] = entry;
                            self.macro_bodies[index as usize] = body.clone();
                        }
                        None => {
                            self.macro_index
                                .insert(name.clone(), self.program.macros.len() as u32);
                            self.program.macros.push(entry);
                            self.macro_bodies.push(body.clone());
                        }
                    }
                }
                NodeKind::Import { target, alias } => {
                    self.imports.insert(alias.clone(), target.clone());
                }
                _ => {}
            }
        }
    }

    fn sequence(&mut self, seq: &[NodeId]) -> Result<(), CompileError> {
        for &id in seq {
            self.node(id)?;
        }
        Ok(())
    }

    fn node(&mut self, id: NodeId) -> Result<(), CompileError> {
        let ast = self.ast;
        let node = ast.node(id);
        let shape_start = self.here();

        match &node.kind {
            NodeKind::Literal { text } => {
                if !text.is_empty() {
                    let idx = self.string(text);
                    self.emit(Instruction::LoadConst(idx));
                    self.emit(Instruction::EmitRaw);
                }
            }
            NodeKind::VariableRef { path } => {
                self.var(path);
                self.emit(Instruction::Emit);
            }
            NodeKind::FilterApplication { expr, filters } => {
                self.expr(expr);
                self.filters(filters, node.tags.hot)?;
                self.emit(Instruction::Emit);
            }
            NodeKind::Shared { slot } => {
                self.emit(Instruction::LoadShared(*slot));
                self.emit(Instruction::Emit);
            }
            NodeKind::Conditional {
                branches,
                otherwise,
            } => {
                let mut exits = Vec::new();
                for branch in branches {
                    self.condition(&branch.condition);
                    let skip = self.emit(Instruction::JumpIfFalse(0));
                    self.sequence(&branch.body)?;
                    exits.push(self.emit(Instruction::Jump(0)));
                    let next = self.here();
                    self.patch(skip, next);
                }
                self.sequence(otherwise)?;
                let end = self.here();
                for at in exits {
                    self.patch(at, end);
                }
            }
            NodeKind::Loop {
                binding,
                iterable,
                body,
            } => {
                match iterable {
                    Iterable::Var(path) => self.var(path),
                    Iterable::Range { start, end } => {
                        self.emit(Instruction::BuildRange {
                            start: *start,
                            end: *end,
                        });
                    }
                }
                let slot = self.slot(binding);
                let start = self.emit(Instruction::ForStart { slot, exit: 0 });
                if node.tags.hot {
                    self.program.hints.hot_loops.push(start as Addr);
                }
                if node.tags.vectorizable {
                    self.program.hints.vectorizable_loops.push(start as Addr);
                }
                let body_addr = self.here();
                self.sequence(body)?;
                self.emit(Instruction::ForNext {
                    slot,
                    body: body_addr,
                });
                self.emit(Instruction::ForEnd);
                let exit = self.here();
                self.patch(start, exit);
            }
            NodeKind::Include { target } => {
                let idx = self.string(target);
                self.emit(Instruction::RenderInclude(idx));
            }
            NodeKind::Call {
                namespace,
                name,
                args,
            } => {
                let argc = args.len() as u32;
                match namespace {
                    None => {
                        let index = *self.macro_index.get(name).ok_or_else(|| {
                            CompileError::UnknownMacro {
                                path: self.path.to_string(),
                                name: name.clone(),
                                span: node.span,
                            }
                        })?;
                        let params = self.program.macros[index as usize].params.len();
                        if args.len() > params {
                            return Err(CompileError::PassFailed {
                                path: self.path.to_string(),
                                pass: "codegen",
                                message: format!(
                                    "macro '{name}' takes {params} arguments, {} given",
                                    args.len()
                                ),
                            });
                        }
                        for arg in args {
                            self.expr(arg);
                        }
                        self.emit(Instruction::CallMacro { index, argc });
                    }
                    Some(alias) => {
                        let target = self.imports.get(alias).cloned().ok_or_else(|| {
                            CompileError::UnknownMacro {
                                path: self.path.to_string(),
                                name: format!("{alias}.{name}"),
                                span: node.span,
                            }
                        })?;
                        for arg in args {
                            self.expr(arg);
                        }
                        let template = self.string(&target);
                        let name = self.string(name);
                        self.emit(Instruction::CallImport {
                            template,
                            name,
                            argc,
                        });
                    }
                }
            }
            NodeKind::Block { body, .. } => self.sequence(body)?,
            NodeKind::Stop => {
                if self.in_macro {
                    self.emit(Instruction::Return);
                } else {
                    self.emit(Instruction::Halt);
                }
            }
            NodeKind::Macro { .. } | NodeKind::Import { .. } => {}
        }

        if let Some(shape) = node.tags.shape {
            self.program.hints.shapes.push((shape_start, shape));
        }
        Ok(())
    }

    fn var(&mut self, path: &VarPath) {
        if path.is_private() {
            let value = global_value(self.globals, path);
            let idx = self.constant(value);
            self.emit(Instruction::LoadConst(idx));
            return;
        }
        let slot = self.slot(&path.root);
        self.emit(Instruction::LoadVar(slot));
        for attr in &path.attrs {
            let idx = self.string(attr);
            self.emit(Instruction::GetAttr(idx));
        }
    }

    fn expr(&mut self, expr: &Expr) {
        for atom in &expr.atoms {
            match atom {
                Atom::Lit(lit) => {
                    let idx = self.constant(lit.to_value());
                    self.emit(Instruction::LoadConst(idx));
                }
                Atom::Var(path) => self.var(path),
            }
        }
        if expr.atoms.len() > 1 {
            self.emit(Instruction::Concat(expr.atoms.len() as u32));
        }
    }

    fn condition(&mut self, cond: &Condition) {
        self.expr(&cond.lhs);
        if let Some((op, rhs)) = &cond.cmp {
            self.expr(rhs);
            self.emit(Instruction::Compare(*op));
        }
        if cond.negate {
            self.emit(Instruction::Not);
        }
    }

    /// Hot chains of two or more filters are lowered to one chain dispatch.
    fn filters(&mut self, filters: &[FilterCall], hot: bool) -> Result<(), CompileError> {
        for f in filters {
            if !filters::is_known(&f.name) {
                return Err(CompileError::UnknownFilter {
                    path: self.path.to_string(),
                    name: f.name.clone(),
                    span: f.span,
                });
            }
        }

        if hot && filters.len() > 1 {
            let chain = filters
                .iter()
                .map(|f| FilterOp {
                    name: f.name.clone(),
                    args: f.args.iter().map(|a| self.constant(a.to_value())).collect(),
                })
                .collect();
            let idx = self.program.filter_chains.len() as u32;
            self.program.filter_chains.push(chain);
            self.emit(Instruction::ApplyFilterChain(idx));
            return Ok(());
        }

        for f in filters {
            for arg in &f.args {
                let idx = self.constant(arg.to_value());
                self.emit(Instruction::LoadConst(idx));
            }
            let name = self.string(&f.name);
            self.emit(Instruction::ApplyFilter {
                name,
                argc: f.args.len() as u32,
            });
        }
        Ok(())
    }
}
