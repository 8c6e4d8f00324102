use std::collections::{BTreeMap, BTreeSet};

use crate::expression::ast::{BinaryOp, Expr, Lit, UnaryOp};
use crate::expression::bytecode::{
    BuiltinId, BytecodeProgram, ConstVal, DefinitionId, InputField, Op,
};
use crate::expression::error::ExprError;
use crate::expression::parser::parse_expr;

/// Why a module expression or definition table could not be compiled.
#[derive(Debug, thiserror::Error)]
#[error("cannot compile expression: {message}")]
pub struct ExprCompileError {
    pub message: String,
}

impl ExprCompileError {
    fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

/// Names visible to module expressions.
///
/// Constants are folded at compile time; `frameIndex` and `frameCount` are read per frame.
#[derive(Debug, Clone, Default)]
pub(crate) struct Scope {
    constants: BTreeMap<String, f64>,
    definitions: BTreeMap<String, DefinitionId>,
}

impl Scope {
    pub(crate) fn with_frame_size(width: u32, height: u32) -> Self {
        let mut constants = BTreeMap::new();
        constants.insert("PI".to_owned(), std::f64::consts::PI);
        constants.insert("TAU".to_owned(), std::f64::consts::TAU);
        constants.insert("width".to_owned(), f64::from(width));
        constants.insert("height".to_owned(), f64::from(height));
        Self {
            constants,
            definitions: BTreeMap::new(),
        }
    }

    fn is_reserved(&self, name: &str) -> bool {
        self.constants.contains_key(name)
            || input_field(name).is_some()
            || BuiltinId::lookup(name).is_some()
    }
}

fn input_field(name: &str) -> Option<InputField> {
    match name {
        "frameIndex" => Some(InputField::FrameIndex),
        "frameCount" => Some(InputField::FrameCount),
        _ => None,
    }
}

pub(crate) fn compile_expression(
    src: &str,
    scope: &Scope,
) -> Result<BytecodeProgram, ExprCompileError> {
    let located = |e: ExprError| ExprCompileError::new(e.describe(src));
    let ast = parse_expr(src).map_err(located)?;
    let mut program = BytecodeProgram::new();
    lower(&ast, scope, &mut program).map_err(located)?;
    Ok(program)
}

fn lower(expr: &Expr, scope: &Scope, out: &mut BytecodeProgram) -> Result<(), ExprError> {
    match expr {
        Expr::Lit(Lit::F64(v)) => {
            let idx = out.push_const(ConstVal::F64(*v));
            out.ops.push(Op::PushConst(idx));
        }
        Expr::Lit(Lit::Bool(v)) => {
            let idx = out.push_const(ConstVal::Bool(*v));
            out.ops.push(Op::PushConst(idx));
        }
        Expr::Ident { name, offset } => {
            if let Some(field) = input_field(name) {
                out.ops.push(Op::LoadInput(field));
            } else if let Some(v) = scope.constants.get(name) {
                let idx = out.push_const(ConstVal::F64(*v));
                out.ops.push(Op::PushConst(idx));
            } else if let Some(id) = scope.definitions.get(name) {
                out.ops.push(Op::LoadDefinition(*id));
            } else {
                return Err(ExprError::new(
                    *offset,
                    format!("unknown identifier '{name}'"),
                ));
            }
        }
        Expr::Unary { op, expr } => {
            lower(expr, scope, out)?;
            out.ops.push(match op {
                UnaryOp::Neg => Op::Neg,
                UnaryOp::Not => Op::Not,
            });
        }
        Expr::Binary { op, left, right } => {
            lower(left, scope, out)?;
            lower(right, scope, out)?;
            out.ops.push(match op {
                BinaryOp::Add => Op::Add,
                BinaryOp::Sub => Op::Sub,
                BinaryOp::Mul => Op::Mul,
                BinaryOp::Div => Op::Div,
                BinaryOp::Mod => Op::Mod,
                BinaryOp::Eq => Op::Eq,
                BinaryOp::Ne => Op::Ne,
                BinaryOp::Lt => Op::Lt,
                BinaryOp::Le => Op::Le,
                BinaryOp::Gt => Op::Gt,
                BinaryOp::Ge => Op::Ge,
                BinaryOp::And => Op::And,
                BinaryOp::Or => Op::Or,
            });
        }
        Expr::Conditional {
            cond,
            then,
            otherwise,
        } => {
            lower(cond, scope, out)?;
            lower(then, scope, out)?;
            lower(otherwise, scope, out)?;
            out.ops.push(Op::Select);
        }
        Expr::Call { func, offset, args } => {
            let Some(id) = BuiltinId::lookup(func) else {
                return Err(ExprError::new(*offset, format!("unknown function '{func}'")));
            };
            if args.len() != usize::from(id.arity()) {
                return Err(ExprError::new(
                    *offset,
                    format!(
                        "{func} expects {} argument(s), got {}",
                        id.arity(),
                        args.len()
                    ),
                ));
            }
            for arg in args {
                lower(arg, scope, out)?;
            }
            out.ops.push(Op::CallBuiltin {
                id,
                argc: id.arity(),
            });
        }
    }
    Ok(())
}

/// Compiled named definitions in evaluation order.
#[derive(Debug, Clone)]
pub(crate) struct DefinitionTable {
    pub(crate) names: Vec<String>,
    pub(crate) programs: Vec<BytecodeProgram>,
    /// Dependencies always precede their dependents.
    pub(crate) eval_order: Vec<DefinitionId>,
}

impl DefinitionTable {
    pub(crate) fn len(&self) -> usize {
        self.programs.len()
    }
}

/// Compile every definition and order them so each one is evaluated after the definitions it
/// references. Returns the extended scope that element expressions compile against.
pub(crate) fn compile_definitions(
    sources: &BTreeMap<String, String>,
    base: &Scope,
) -> Result<(DefinitionTable, Scope), ExprCompileError> {
    let mut scope = base.clone();
    let mut names = Vec::with_capacity(sources.len());
    for (i, name) in sources.keys().enumerate() {
        if !is_identifier(name) {
            return Err(ExprCompileError::new(format!(
                "definition name '{name}' is not a valid identifier"
            )));
        }
        if base.is_reserved(name) {
            return Err(ExprCompileError::new(format!(
                "definition '{name}' shadows a built-in name"
            )));
        }
        scope
            .definitions
            .insert(name.clone(), DefinitionId(i as u32));
        names.push(name.clone());
    }

    let mut programs = Vec::with_capacity(sources.len());
    for (name, src) in sources {
        let program = compile_expression(src, &scope)
            .map_err(|e| ExprCompileError::new(format!("definition '{name}': {}", e.message)))?;
        programs.push(program);
    }

    let n = programs.len();
    let mut indeg = vec![0u32; n];
    let mut outs: Vec<Vec<u32>> = vec![Vec::new(); n];
    for (i, program) in programs.iter().enumerate() {
        let deps: BTreeSet<DefinitionId> = program.referenced_definitions().collect();
        for dep in deps {
            outs[dep.0 as usize].push(i as u32);
            indeg[i] += 1;
        }
    }

    // Kahn topo with deterministic tie-break on definition id.
    let mut ready: BTreeSet<u32> = (0..n as u32).filter(|&i| indeg[i as usize] == 0).collect();
    let mut eval_order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_first() {
        eval_order.push(DefinitionId(i));
        for &j in &outs[i as usize] {
            let dj = &mut indeg[j as usize];
            *dj = dj.saturating_sub(1);
            if *dj == 0 {
                ready.insert(j);
            }
        }
    }

    if eval_order.len() != n {
        let cycle = find_cycle(&outs);
        let path = cycle
            .iter()
            .map(|&i| names[i as usize].as_str())
            .collect::<Vec<_>>()
            .join(" -> ");
        return Err(ExprCompileError::new(format!(
            "definition dependency cycle detected: {path}"
        )));
    }

    Ok((
        DefinitionTable {
            names,
            programs,
            eval_order,
        },
        scope,
    ))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name != "true"
        && name != "false"
}

fn find_cycle(outs: &[Vec<u32>]) -> Vec<u32> {
    let n = outs.len();
    let mut state = vec![0u8; n]; // 0=unvisited,1=visiting,2=done
    let mut stack: Vec<u32> = Vec::new();

    fn dfs(v: u32, outs: &[Vec<u32>], state: &mut [u8], stack: &mut Vec<u32>) -> Option<Vec<u32>> {
        state[v as usize] = 1;
        stack.push(v);
        for &to in &outs[v as usize] {
            match state[to as usize] {
                0 => {
                    if let Some(c) = dfs(to, outs, state, stack) {
                        return Some(c);
                    }
                }
                1 => {
                    let pos = stack.iter().position(|&x| x == to).unwrap_or(0);
                    let mut cycle = stack[pos..].to_vec();
                    cycle.push(to);
                    return Some(cycle);
                }
                _ => {}
            }
        }
        stack.pop();
        state[v as usize] = 2;
        None
    }

    for i in 0..n {
        if state[i] == 0
            && let Some(c) = dfs(i as u32, outs, &mut state, &mut stack)
        {
            return c;
        }
    }
    Vec::new()
}
