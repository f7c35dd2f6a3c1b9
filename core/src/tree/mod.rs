//! Expression trees.
//!
//! A program is a [`LambdaExpr`] whose body is an [`Expr`]. Statements are
//! expressions of type `void`; control flow is expressed with blocks, labels
//! and gotos, loops, switches and try regions. Every node knows its static
//! type, and extension nodes reduce to core nodes before lowering.

mod builder;
mod variable;

pub use variable::{LabelTarget, Variable};

use crate::types::{Class, Method, Signature, Type};
use crate::values::Value;
use crate::vm::CallSite;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    /// Short-circuit `&&`.
    AndAlso,
    /// Short-circuit `||`.
    OrElse,
    And,
    Or,
    ExclusiveOr,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
    OnesComplement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GotoKind {
    Goto,
    Return,
    Break,
    Continue,
}

/// Node kind, as reported by [`Expr::kind`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Constant,
    Default,
    Parameter,
    Binary(BinaryOp),
    Unary(UnaryOp),
    Assign,
    Block,
    Conditional,
    Loop,
    Goto,
    Label,
    Switch,
    Try,
    Throw,
    Lambda,
    Invoke,
    Call,
    New,
    Field,
    NewArray,
    NewArrayBounds,
    Index,
    ArrayLength,
    TypeIs,
    TypeAs,
    Convert,
    Dynamic,
    DebugInfo,
    Extension,
}

#[derive(Clone)]
pub enum Expr {
    Constant { value: Value, ty: Type },
    Default(Type),
    Parameter(Variable),
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Unary { op: UnaryOp, operand: Box<Expr> },
    /// Target is a parameter, a field access or an array index.
    Assign { target: Box<Expr>, value: Box<Expr> },
    Block(Box<BlockExpr>),
    Conditional { test: Box<Expr>, if_true: Box<Expr>, if_false: Box<Expr>, ty: Type },
    Loop(Arc<LoopExpr>),
    Goto { kind: GotoKind, target: LabelTarget, value: Option<Box<Expr>>, ty: Type },
    Label { target: LabelTarget, default: Option<Box<Expr>> },
    Switch(Box<SwitchExpr>),
    Try(Box<TryExpr>),
    /// `value: None` rethrows the exception being handled.
    Throw { value: Option<Box<Expr>>, ty: Type },
    Lambda(Arc<LambdaExpr>),
    Invoke { callee: Box<Expr>, args: Vec<Expr> },
    Call { method: Arc<Method>, instance: Option<Box<Expr>>, args: Vec<Expr> },
    New { class: Arc<Class>, args: Vec<Expr> },
    Field { target: Box<Expr>, class: Arc<Class>, index: usize },
    NewArray { element: Type, items: Vec<Expr> },
    NewArrayBounds { element: Type, length: Box<Expr> },
    Index { array: Box<Expr>, index: Box<Expr> },
    ArrayLength(Box<Expr>),
    TypeIs { operand: Box<Expr>, ty: Type },
    TypeAs { operand: Box<Expr>, ty: Type },
    /// Numeric conversion, or a checked reference cast.
    Convert { operand: Box<Expr>, ty: Type },
    Dynamic { site: Arc<CallSite>, args: Vec<Expr>, ty: Type },
    DebugInfo(DebugInfoExpr),
    Extension(Arc<dyn ExtensionNode>),
}

#[derive(Clone, Debug)]
pub struct BlockExpr {
    pub variables: Vec<Variable>,
    pub expressions: Vec<Expr>,
    pub ty: Type,
}

#[derive(Clone, Debug)]
pub struct LoopExpr {
    pub body: Expr,
    pub break_label: Option<LabelTarget>,
    pub continue_label: Option<LabelTarget>,
}

impl LoopExpr {
    pub fn ty(&self) -> Type {
        self.break_label.as_ref().map(|l| l.ty().clone()).unwrap_or(Type::Void)
    }
}

#[derive(Clone, Debug)]
pub struct SwitchCase {
    /// Constant test values. Int, bool or string.
    pub tests: Vec<Expr>,
    pub body: Expr,
}

#[derive(Clone, Debug)]
pub struct SwitchExpr {
    pub value: Expr,
    pub cases: Vec<SwitchCase>,
    pub default: Option<Expr>,
    pub ty: Type,
}

#[derive(Clone, Debug)]
pub struct CatchBlock {
    /// Exception class caught; its subclasses match too.
    pub class: Type,
    pub variable: Option<Variable>,
    pub filter: Option<Expr>,
    pub body: Expr,
}

#[derive(Clone, Debug)]
pub struct TryExpr {
    pub body: Expr,
    pub handlers: Vec<CatchBlock>,
    pub finally: Option<Expr>,
    /// Runs only when the body faults; the fault keeps propagating.
    pub fault: Option<Expr>,
    pub ty: Type,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DebugInfoExpr {
    pub file: Option<Arc<str>>,
    pub start_line: u32,
    pub end_line: u32,
    /// Clears the sequence point instead of setting it.
    pub clear: bool,
}

#[derive(Clone, Debug)]
pub struct LambdaExpr {
    pub name: Arc<str>,
    pub params: Vec<Variable>,
    pub body: Expr,
    pub ret: Type,
}

impl LambdaExpr {
    /// Lambda returning the type of its body.
    pub fn new(name: &str, params: Vec<Variable>, body: Expr) -> Arc<Self> {
        let ret = body.ty();
        Arc::new(Self { name: name.into(), params, body, ret })
    }

    pub fn with_return(name: &str, params: Vec<Variable>, ret: Type, body: Expr) -> Arc<Self> {
        Arc::new(Self { name: name.into(), params, body, ret })
    }

    pub fn signature(&self) -> Signature {
        Signature::new(self.params.iter().map(|p| p.ty().clone()).collect(), self.ret.clone())
    }

    pub fn has_by_ref_params(&self) -> bool {
        self.params.iter().any(Variable::is_by_ref)
    }
}

/// A node outside the core set. Lowering reduces it first.
pub trait ExtensionNode: Send + Sync {
    fn ty(&self) -> Type;

    fn can_reduce(&self) -> bool {
        true
    }

    fn reduce(&self) -> Option<Expr>;
}

impl Expr {
    pub fn kind(&self) -> NodeKind {
        match self {
            Expr::Constant { .. } => NodeKind::Constant,
            Expr::Default(_) => NodeKind::Default,
            Expr::Parameter(_) => NodeKind::Parameter,
            Expr::Binary { op, .. } => NodeKind::Binary(*op),
            Expr::Unary { op, .. } => NodeKind::Unary(*op),
            Expr::Assign { .. } => NodeKind::Assign,
            Expr::Block(_) => NodeKind::Block,
            Expr::Conditional { .. } => NodeKind::Conditional,
            Expr::Loop(_) => NodeKind::Loop,
            Expr::Goto { .. } => NodeKind::Goto,
            Expr::Label { .. } => NodeKind::Label,
            Expr::Switch(_) => NodeKind::Switch,
            Expr::Try(_) => NodeKind::Try,
            Expr::Throw { .. } => NodeKind::Throw,
            Expr::Lambda(_) => NodeKind::Lambda,
            Expr::Invoke { .. } => NodeKind::Invoke,
            Expr::Call { .. } => NodeKind::Call,
            Expr::New { .. } => NodeKind::New,
            Expr::Field { .. } => NodeKind::Field,
            Expr::NewArray { .. } => NodeKind::NewArray,
            Expr::NewArrayBounds { .. } => NodeKind::NewArrayBounds,
            Expr::Index { .. } => NodeKind::Index,
            Expr::ArrayLength(_) => NodeKind::ArrayLength,
            Expr::TypeIs { .. } => NodeKind::TypeIs,
            Expr::TypeAs { .. } => NodeKind::TypeAs,
            Expr::Convert { .. } => NodeKind::Convert,
            Expr::Dynamic { .. } => NodeKind::Dynamic,
            Expr::DebugInfo(_) => NodeKind::DebugInfo,
            Expr::Extension(_) => NodeKind::Extension,
        }
    }

    /// Static type of the node.
    pub fn ty(&self) -> Type {
        match self {
            Expr::Constant { ty, .. } => ty.clone(),
            Expr::Default(ty) => ty.clone(),
            Expr::Parameter(v) => v.ty().clone(),
            Expr::Binary { op, left, .. } => match op {
                op if op.is_comparison() => Type::Bool,
                BinaryOp::AndAlso | BinaryOp::OrElse => Type::Bool,
                _ => left.ty(),
            },
            Expr::Unary { operand, .. } => operand.ty(),
            Expr::Assign { target, .. } => target.ty(),
            Expr::Block(block) => block.ty.clone(),
            Expr::Conditional { ty, .. } => ty.clone(),
            Expr::Loop(looped) => looped.ty(),
            Expr::Goto { ty, .. } => ty.clone(),
            Expr::Label { target, .. } => target.ty().clone(),
            Expr::Switch(switch) => switch.ty.clone(),
            Expr::Try(try_expr) => try_expr.ty.clone(),
            Expr::Throw { ty, .. } => ty.clone(),
            Expr::Lambda(lambda) => Type::Function(Arc::new(lambda.signature())),
            Expr::Invoke { callee, .. } => match callee.ty() {
                Type::Function(sig) => sig.ret.clone(),
                _ => Type::Any,
            },
            Expr::Call { method, .. } => method.ret().clone(),
            Expr::New { class, .. } => Type::Object(Arc::clone(class)),
            Expr::Field { class, index, .. } => {
                class.fields().get(*index).map(|f| f.ty.clone()).unwrap_or(Type::Any)
            }
            Expr::NewArray { element, .. } | Expr::NewArrayBounds { element, .. } => {
                Type::array(element.clone())
            }
            Expr::Index { array, .. } => array.ty().element().cloned().unwrap_or(Type::Any),
            Expr::ArrayLength(_) => Type::Int,
            Expr::TypeIs { .. } => Type::Bool,
            Expr::TypeAs { ty, .. } | Expr::Convert { ty, .. } => ty.clone(),
            Expr::Dynamic { ty, .. } => ty.clone(),
            Expr::DebugInfo(_) => Type::Void,
            Expr::Extension(node) => node.ty(),
        }
    }

    /// Direct children in evaluation order. Lambda bodies are not children
    /// of the lambda node: they belong to a different activation.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Constant { .. }
            | Expr::Default(_)
            | Expr::Parameter(_)
            | Expr::Lambda(_)
            | Expr::DebugInfo(_)
            | Expr::Extension(_) => Vec::new(),
            Expr::Binary { left, right, .. } => vec![&**left, &**right],
            Expr::Unary { operand, .. }
            | Expr::TypeIs { operand, .. }
            | Expr::TypeAs { operand, .. }
            | Expr::Convert { operand, .. } => vec![&**operand],
            Expr::Assign { target, value } => vec![&**target, &**value],
            Expr::Block(block) => block.expressions.iter().collect(),
            Expr::Conditional { test, if_true, if_false, .. } => vec![&**test, &**if_true, &**if_false],
            Expr::Loop(looped) => vec![&looped.body],
            Expr::Goto { value, .. } => value.iter().map(|v| &**v).collect(),
            Expr::Label { default, .. } => default.iter().map(|v| &**v).collect(),
            Expr::Switch(switch) => {
                let mut children = vec![&switch.value];
                for case in &switch.cases {
                    children.extend(case.tests.iter());
                    children.push(&case.body);
                }
                children.extend(switch.default.iter());
                children
            }
            Expr::Try(try_expr) => {
                let mut children = vec![&try_expr.body];
                for handler in &try_expr.handlers {
                    children.extend(handler.filter.iter());
                    children.push(&handler.body);
                }
                children.extend(try_expr.finally.iter());
                children.extend(try_expr.fault.iter());
                children
            }
            Expr::Throw { value, .. } => value.iter().map(|v| &**v).collect(),
            Expr::Invoke { callee, args } => {
                let mut children = vec![&**callee];
                children.extend(args.iter());
                children
            }
            Expr::Call { instance, args, .. } => {
                let mut children: Vec<&Expr> = instance.iter().map(|i| &**i).collect();
                children.extend(args.iter());
                children
            }
            Expr::New { args, .. } | Expr::Dynamic { args, .. } => args.iter().collect(),
            Expr::Field { target, .. } => vec![&**target],
            Expr::NewArray { items, .. } => items.iter().collect(),
            Expr::NewArrayBounds { length, .. } => vec![&**length],
            Expr::Index { array, index } => vec![&**array, &**index],
            Expr::ArrayLength(array) => vec![&**array],
        }
    }

    /// Reduces an extension node one step. Core nodes reduce to `None`.
    pub fn reduce(&self) -> Option<Expr> {
        match self {
            Expr::Extension(node) if node.can_reduce() => node.reduce(),
            _ => None,
        }
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant { value, .. } => write!(f, "{:?}", value),
            Expr::Default(ty) => write!(f, "default({})", ty),
            Expr::Parameter(v) => write!(f, "{:?}", v),
            Expr::Lambda(lambda) => write!(f, "lambda {}/{}", lambda.name, lambda.params.len()),
            Expr::Goto { kind, target, .. } => write!(f, "{:?} {:?}", kind, target),
            Expr::Label { target, .. } => write!(f, "label {:?}", target),
            other => {
                write!(f, "{:?}(", other.kind())?;
                for (i, child) in other.children().into_iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", child)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_comparison_is_bool() {
        let x = Variable::new("x", Type::Int);
        let expr = Expr::greater_than(Expr::param(&x), Expr::int(0));
        assert_eq!(expr.ty(), Type::Bool);
        assert_eq!(expr.kind(), NodeKind::Binary(BinaryOp::GreaterThan));
        assert_eq!(expr.children().len(), 2);
    }

    #[test]
    fn test_lambda_signature() {
        let x = Variable::new("x", Type::Int);
        let lambda = LambdaExpr::new("inc", vec![x.clone()], Expr::add(Expr::param(&x), Expr::int(1)));
        assert_eq!(lambda.signature(), Signature::new(vec![Type::Int], Type::Int));
    }

    struct Twice(Expr);

    impl ExtensionNode for Twice {
        fn ty(&self) -> Type {
            self.0.ty()
        }

        fn reduce(&self) -> Option<Expr> {
            Some(Expr::add(self.0.clone(), self.0.clone()))
        }
    }

    #[test]
    fn test_extension_reduces() {
        let ext = Expr::Extension(Arc::new(Twice(Expr::int(4))));
        assert_eq!(ext.ty(), Type::Int);
        let reduced = ext.reduce();
        assert!(matches!(reduced, Some(Expr::Binary { op: BinaryOp::Add, .. })));
    }

    #[test]
    fn test_debug_format() {
        let expr = Expr::add(Expr::int(1), Expr::int(2));
        assert_eq!(format!("{:?}", expr), "Binary(Add)(1, 2)");
    }
}
