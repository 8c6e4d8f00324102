#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConstIdx(pub(crate) u32);

/// Index into a module's definition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct DefinitionId(pub(crate) u32);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConstVal {
    F64(f64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BuiltinId {
    Min,
    Max,
    Clamp,
    Abs,
    Sin,
    Cos,
    Tan,
    Sqrt,
    Pow,
    Floor,
    Ceil,
    Round,
    Lerp,
}

impl BuiltinId {
    pub(crate) fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "min" => Self::Min,
            "max" => Self::Max,
            "clamp" => Self::Clamp,
            "abs" => Self::Abs,
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "sqrt" => Self::Sqrt,
            "pow" => Self::Pow,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "round" => Self::Round,
            "lerp" => Self::Lerp,
            _ => return None,
        })
    }

    pub(crate) fn arity(self) -> u8 {
        match self {
            Self::Abs
            | Self::Sin
            | Self::Cos
            | Self::Tan
            | Self::Sqrt
            | Self::Floor
            | Self::Ceil
            | Self::Round => 1,
            Self::Min | Self::Max | Self::Pow => 2,
            Self::Clamp | Self::Lerp => 3,
        }
    }
}

/// Per-frame inputs every expression can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputField {
    FrameIndex,
    FrameCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    PushConst(ConstIdx),
    LoadInput(InputField),
    LoadDefinition(DefinitionId),

    Neg,
    Not,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    /// Pops `otherwise`, `then`, `cond` and pushes the selected branch.
    Select,

    CallBuiltin { id: BuiltinId, argc: u8 },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BytecodeProgram {
    pub(crate) ops: Vec<Op>,
    pub(crate) consts: Vec<ConstVal>,
}

impl BytecodeProgram {
    pub(crate) fn new() -> Self {
        Self {
            ops: Vec::new(),
            consts: Vec::new(),
        }
    }

    pub(crate) fn push_const(&mut self, c: ConstVal) -> ConstIdx {
        let idx = ConstIdx(self.consts.len() as u32);
        self.consts.push(c);
        idx
    }

    pub(crate) fn referenced_definitions(&self) -> impl Iterator<Item = DefinitionId> + '_ {
        self.ops.iter().filter_map(|op| match op {
            Op::LoadDefinition(id) => Some(*id),
            _ => None,
        })
    }
}
