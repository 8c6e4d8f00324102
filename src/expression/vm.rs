use crate::expression::bytecode::{BuiltinId, BytecodeProgram, ConstVal, DefinitionId, InputField, Op};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueSlot {
    F64(f64),
    Bool(bool),
}

#[derive(Debug, Clone)]
pub struct VmError {
    pub message: String,
}

impl VmError {
    pub(crate) fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vm error: {}", self.message)
    }
}

impl std::error::Error for VmError {}

pub(crate) fn eval_program(
    p: &BytecodeProgram,
    stack: &mut Vec<ValueSlot>,
    mut load_input: impl FnMut(InputField) -> ValueSlot,
    mut load_definition: impl FnMut(DefinitionId) -> Result<ValueSlot, VmError>,
) -> Result<ValueSlot, VmError> {
    stack.clear();

    for &op in &p.ops {
        match op {
            Op::PushConst(idx) => {
                let c = p
                    .consts
                    .get(idx.0 as usize)
                    .ok_or_else(|| VmError::new("const idx out of range"))?;
                stack.push(match *c {
                    ConstVal::F64(v) => ValueSlot::F64(v),
                    ConstVal::Bool(v) => ValueSlot::Bool(v),
                });
            }
            Op::LoadInput(field) => stack.push(load_input(field)),
            Op::LoadDefinition(id) => stack.push(load_definition(id)?),

            Op::Neg => {
                let v = pop_f64(stack)?;
                stack.push(ValueSlot::F64(-v));
            }
            Op::Not => {
                let v = pop_bool(stack)?;
                stack.push(ValueSlot::Bool(!v));
            }
            Op::Add => bin_f64(stack, |a, b| a + b)?,
            Op::Sub => bin_f64(stack, |a, b| a - b)?,
            Op::Mul => bin_f64(stack, |a, b| a * b)?,
            Op::Div => bin_f64(stack, |a, b| a / b)?,
            Op::Mod => bin_f64(stack, |a, b| a % b)?,

            Op::Eq => bin_eq(stack, true)?,
            Op::Ne => bin_eq(stack, false)?,
            Op::Lt => bin_cmp(stack, |a, b| a < b)?,
            Op::Le => bin_cmp(stack, |a, b| a <= b)?,
            Op::Gt => bin_cmp(stack, |a, b| a > b)?,
            Op::Ge => bin_cmp(stack, |a, b| a >= b)?,

            Op::And => {
                let b = pop_bool(stack)?;
                let a = pop_bool(stack)?;
                stack.push(ValueSlot::Bool(a && b));
            }
            Op::Or => {
                let b = pop_bool(stack)?;
                let a = pop_bool(stack)?;
                stack.push(ValueSlot::Bool(a || b));
            }
            Op::Select => {
                let otherwise = pop(stack)?;
                let then = pop(stack)?;
                let cond = pop_bool(stack)?;
                stack.push(if cond { then } else { otherwise });
            }

            Op::CallBuiltin { id, argc } => call_builtin(stack, id, argc)?,
        }
    }

    match (stack.pop(), stack.is_empty()) {
        (Some(v), true) => Ok(v),
        (popped, _) => Err(VmError::new(format!(
            "stack has {} values at end of program",
            stack.len() + usize::from(popped.is_some())
        ))),
    }
}

impl ValueSlot {
    pub fn as_bool(self) -> Result<bool, VmError> {
        match self {
            Self::Bool(v) => Ok(v),
            other => Err(VmError::new(format!("expected bool, got {other:?}"))),
        }
    }

    pub fn as_f64(self) -> Result<f64, VmError> {
        match self {
            Self::F64(v) => Ok(v),
            other => Err(VmError::new(format!("expected numeric, got {other:?}"))),
        }
    }
}

fn pop(stack: &mut Vec<ValueSlot>) -> Result<ValueSlot, VmError> {
    stack.pop().ok_or_else(|| VmError::new("stack underflow"))
}

fn pop_f64(stack: &mut Vec<ValueSlot>) -> Result<f64, VmError> {
    pop(stack)?.as_f64()
}

fn pop_bool(stack: &mut Vec<ValueSlot>) -> Result<bool, VmError> {
    pop(stack)?.as_bool()
}

fn bin_f64(stack: &mut Vec<ValueSlot>, f: impl FnOnce(f64, f64) -> f64) -> Result<(), VmError> {
    let b = pop_f64(stack)?;
    let a = pop_f64(stack)?;
    stack.push(ValueSlot::F64(f(a, b)));
    Ok(())
}

fn bin_cmp(stack: &mut Vec<ValueSlot>, f: impl FnOnce(f64, f64) -> bool) -> Result<(), VmError> {
    let b = pop_f64(stack)?;
    let a = pop_f64(stack)?;
    stack.push(ValueSlot::Bool(f(a, b)));
    Ok(())
}

fn bin_eq(stack: &mut Vec<ValueSlot>, is_eq: bool) -> Result<(), VmError> {
    let b = pop(stack)?;
    let a = pop(stack)?;

    let res = match (a, b) {
        (ValueSlot::Bool(a), ValueSlot::Bool(b)) => a == b,
        (a, b) => a.as_f64()? == b.as_f64()?,
    };

    stack.push(ValueSlot::Bool(if is_eq { res } else { !res }));
    Ok(())
}

fn call_builtin(stack: &mut Vec<ValueSlot>, id: BuiltinId, argc: u8) -> Result<(), VmError> {
    if argc != id.arity() {
        return Err(VmError::new(format!(
            "{id:?} expects {} args, got {argc}",
            id.arity()
        )));
    }
    if stack.len() < usize::from(argc) {
        return Err(VmError::new("stack underflow in builtin call"));
    }

    let out = match id {
        BuiltinId::Abs => pop_f64(stack)?.abs(),
        BuiltinId::Sin => pop_f64(stack)?.sin(),
        BuiltinId::Cos => pop_f64(stack)?.cos(),
        BuiltinId::Tan => pop_f64(stack)?.tan(),
        BuiltinId::Sqrt => pop_f64(stack)?.sqrt(),
        BuiltinId::Floor => pop_f64(stack)?.floor(),
        BuiltinId::Ceil => pop_f64(stack)?.ceil(),
        BuiltinId::Round => pop_f64(stack)?.round(),
        BuiltinId::Min => {
            let b = pop_f64(stack)?;
            let a = pop_f64(stack)?;
            a.min(b)
        }
        BuiltinId::Max => {
            let b = pop_f64(stack)?;
            let a = pop_f64(stack)?;
            a.max(b)
        }
        BuiltinId::Pow => {
            let b = pop_f64(stack)?;
            let a = pop_f64(stack)?;
            a.powf(b)
        }
        BuiltinId::Clamp => {
            let hi = pop_f64(stack)?;
            let lo = pop_f64(stack)?;
            let x = pop_f64(stack)?;
            if lo.is_nan() || hi.is_nan() || lo > hi {
                return Err(VmError::new(format!("clamp bounds out of order: {lo} > {hi}")));
            }
            x.clamp(lo, hi)
        }
        BuiltinId::Lerp => {
            let t = pop_f64(stack)?;
            let b = pop_f64(stack)?;
            let a = pop_f64(stack)?;
            a + (b - a) * t
        }
    };
    stack.push(ValueSlot::F64(out));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::compile::{Scope, compile_expression};

    fn eval(src: &str, frame_index: u64, frame_count: u64) -> Result<ValueSlot, VmError> {
        let scope = Scope::with_frame_size(100, 100);
        let program = compile_expression(src, &scope).unwrap();
        let mut stack = Vec::new();
        eval_program(
            &program,
            &mut stack,
            |field| match field {
                InputField::FrameIndex => ValueSlot::F64(frame_index as f64),
                InputField::FrameCount => ValueSlot::F64(frame_count as f64),
            },
            |_| Err(VmError::new("no definitions")),
        )
    }

    #[test]
    fn evaluates_orbit_coordinates() {
        let cx = eval("15 * cos(TAU * frameIndex / frameCount) + 50", 0, 10).unwrap();
        let cy = eval("15 * sin(TAU * frameIndex / frameCount) + 50", 0, 10).unwrap();
        assert_eq!(cx, ValueSlot::F64(65.0));
        assert_eq!(cy, ValueSlot::F64(50.0));
    }

    #[test]
    fn conditionals_select_branches() {
        assert_eq!(
            eval("frameIndex < 5 ? 1 : 2", 3, 10).unwrap(),
            ValueSlot::F64(1.0)
        );
        assert_eq!(
            eval("frameIndex < 5 ? 1 : 2", 7, 10).unwrap(),
            ValueSlot::F64(2.0)
        );
    }

    #[test]
    fn type_mismatches_are_errors() {
        assert!(eval("true + 1", 0, 1).is_err());
        assert!(eval("1 ? 2 : 3", 0, 1).is_err());
        assert!(eval("!frameIndex", 0, 1).is_err());
    }

    #[test]
    fn clamp_rejects_inverted_bounds() {
        assert!(eval("clamp(1, 5, 0)", 0, 1).is_err());
        assert_eq!(eval("clamp(9, 0, 5)", 0, 1).unwrap(), ValueSlot::F64(5.0));
    }
}
