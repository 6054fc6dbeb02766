use std::fmt;

use serde::{Deserialize, Serialize};

/// Storage type of a state variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NumericType {
    Int,
    Float,
    Double,
}

impl NumericType {
    pub fn promote(self, other: NumericType) -> NumericType {
        self.max(other)
    }

    /// Whether a value of type `value` may be stored into a variable of this type.
    pub fn accepts(self, value: NumericType) -> bool {
        match self {
            NumericType::Int => value == NumericType::Int,
            NumericType::Float | NumericType::Double => true,
        }
    }

    pub fn cast(self, value: f64) -> f64 {
        match self {
            NumericType::Int => value.trunc(),
            NumericType::Float => value as f32 as f64,
            NumericType::Double => value,
        }
    }
}

impl Default for NumericType {
    fn default() -> Self {
        NumericType::Double
    }
}

impl fmt::Display for NumericType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericType::Int => write!(f, "int"),
            NumericType::Float => write!(f, "float"),
            NumericType::Double => write!(f, "double"),
        }
    }
}

/// Static type of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Bool,
    Num(NumericType),
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => write!(f, "bool"),
            Type::Num(numeric_type) => numeric_type.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Local,
    Pre,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarRef {
    pub scope: Scope,
    pub name: String,
}

impl VarRef {
    pub fn local(name: &str) -> Self {
        Self {
            scope: Scope::Local,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Scope::Local => write!(f, "{}", self.name),
            Scope::Pre => write!(f, "pre.{}", self.name),
            Scope::Post => write!(f, "post.{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Exp,
    Log,
    Sqrt,
    Abs,
    Sin,
    Cos,
    Tanh,
    Floor,
    Min,
    Max,
    Pow,
    Select,
}

impl Func {
    pub fn from_name(name: &str) -> Option<Func> {
        let func = match name {
            "exp" => Func::Exp,
            "log" => Func::Log,
            "sqrt" => Func::Sqrt,
            "abs" => Func::Abs,
            "sin" => Func::Sin,
            "cos" => Func::Cos,
            "tanh" => Func::Tanh,
            "floor" => Func::Floor,
            "min" => Func::Min,
            "max" => Func::Max,
            "pow" => Func::Pow,
            "select" => Func::Select,
            _ => return None,
        };
        Some(func)
    }

    pub fn name(self) -> &'static str {
        match self {
            Func::Exp => "exp",
            Func::Log => "log",
            Func::Sqrt => "sqrt",
            Func::Abs => "abs",
            Func::Sin => "sin",
            Func::Cos => "cos",
            Func::Tanh => "tanh",
            Func::Floor => "floor",
            Func::Min => "min",
            Func::Max => "max",
            Func::Pow => "pow",
            Func::Select => "select",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Func::Min | Func::Max | Func::Pow => 2,
            Func::Select => 3,
            _ => 1,
        }
    }

    pub fn apply1(self, x: f64) -> f64 {
        match self {
            Func::Exp => x.exp(),
            Func::Log => x.ln(),
            Func::Sqrt => x.sqrt(),
            Func::Abs => x.abs(),
            Func::Sin => x.sin(),
            Func::Cos => x.cos(),
            Func::Tanh => x.tanh(),
            Func::Floor => x.floor(),
            _ => f64::NAN,
        }
    }

    pub fn apply2(self, x: f64, y: f64) -> f64 {
        match self {
            Func::Min => x.min(y),
            Func::Max => x.max(y),
            Func::Pow => x.powf(y),
            _ => f64::NAN,
        }
    }
}

/// Expression tree built once from equation text.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number { value: f64, integral: bool },
    Var(VarRef),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        func: Func,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn visit_vars<'a>(&'a self, visitor: &mut impl FnMut(&'a VarRef)) {
        match self {
            Expr::Number { .. } => {}
            Expr::Var(var) => visitor(var),
            Expr::Unary { operand, .. } => operand.visit_vars(visitor),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.visit_vars(visitor);
                rhs.visit_vars(visitor);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.visit_vars(visitor);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `x' = expr`, integrated with the neuron type's fixed-step integrator.
    Derivative { var: String, expr: Expr },
    Assign {
        var: String,
        op: AssignOp,
        expr: Expr,
    },
}

impl Statement {
    pub fn var(&self) -> &str {
        match self {
            Statement::Derivative { var, .. } | Statement::Assign { var, .. } => var,
        }
    }
}
