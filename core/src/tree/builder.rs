//! Convenience constructors for tree nodes.

use super::*;

impl Expr {
    // === Leaves ===

    pub fn constant(value: Value, ty: Type) -> Expr {
        Expr::Constant { value, ty }
    }

    pub fn int(i: i64) -> Expr {
        Expr::Constant { value: Value::Int(i), ty: Type::Int }
    }

    pub fn float(f: f64) -> Expr {
        Expr::Constant { value: Value::Float(f), ty: Type::Float }
    }

    pub fn bool(b: bool) -> Expr {
        Expr::Constant { value: Value::Bool(b), ty: Type::Bool }
    }

    pub fn str(s: &str) -> Expr {
        Expr::Constant { value: Value::str(s), ty: Type::Str }
    }

    pub fn null(ty: Type) -> Expr {
        Expr::Constant { value: Value::Null, ty }
    }

    pub fn default(ty: Type) -> Expr {
        Expr::Default(ty)
    }

    pub fn empty() -> Expr {
        Expr::Default(Type::Void)
    }

    pub fn param(variable: &Variable) -> Expr {
        Expr::Parameter(variable.clone())
    }

    // === Operators ===

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn add(left: Expr, right: Expr) -> Expr {
        Self::binary(BinaryOp::Add, left, right)
    }

    pub fn subtract(left: Expr, right: Expr) -> Expr {
        Self::binary(BinaryOp::Subtract, left, right)
    }

    pub fn multiply(left: Expr, right: Expr) -> Expr {
        Self::binary(BinaryOp::Multiply, left, right)
    }

    pub fn divide(left: Expr, right: Expr) -> Expr {
        Self::binary(BinaryOp::Divide, left, right)
    }

    pub fn modulo(left: Expr, right: Expr) -> Expr {
        Self::binary(BinaryOp::Modulo, left, right)
    }

    pub fn equal(left: Expr, right: Expr) -> Expr {
        Self::binary(BinaryOp::Equal, left, right)
    }

    pub fn not_equal(left: Expr, right: Expr) -> Expr {
        Self::binary(BinaryOp::NotEqual, left, right)
    }

    pub fn less_than(left: Expr, right: Expr) -> Expr {
        Self::binary(BinaryOp::LessThan, left, right)
    }

    pub fn less_than_or_equal(left: Expr, right: Expr) -> Expr {
        Self::binary(BinaryOp::LessThanOrEqual, left, right)
    }

    pub fn greater_than(left: Expr, right: Expr) -> Expr {
        Self::binary(BinaryOp::GreaterThan, left, right)
    }

    pub fn greater_than_or_equal(left: Expr, right: Expr) -> Expr {
        Self::binary(BinaryOp::GreaterThanOrEqual, left, right)
    }

    pub fn and_also(left: Expr, right: Expr) -> Expr {
        Self::binary(BinaryOp::AndAlso, left, right)
    }

    pub fn or_else(left: Expr, right: Expr) -> Expr {
        Self::binary(BinaryOp::OrElse, left, right)
    }

    pub fn negate(operand: Expr) -> Expr {
        Expr::Unary { op: UnaryOp::Negate, operand: Box::new(operand) }
    }

    pub fn not(operand: Expr) -> Expr {
        Expr::Unary { op: UnaryOp::Not, operand: Box::new(operand) }
    }

    pub fn assign(target: Expr, value: Expr) -> Expr {
        Expr::Assign { target: Box::new(target), value: Box::new(value) }
    }

    // === Statements ===

    /// Block typed after its last expression.
    pub fn block(variables: Vec<Variable>, expressions: Vec<Expr>) -> Expr {
        let ty = expressions.last().map(Expr::ty).unwrap_or(Type::Void);
        Expr::Block(Box::new(BlockExpr { variables, expressions, ty }))
    }

    /// Block whose value is discarded.
    pub fn void_block(variables: Vec<Variable>, expressions: Vec<Expr>) -> Expr {
        Expr::Block(Box::new(BlockExpr { variables, expressions, ty: Type::Void }))
    }

    pub fn condition(test: Expr, if_true: Expr, if_false: Expr) -> Expr {
        let ty = if_true.ty();
        Expr::Conditional { test: Box::new(test), if_true: Box::new(if_true), if_false: Box::new(if_false), ty }
    }

    pub fn if_then(test: Expr, if_true: Expr) -> Expr {
        Self::if_then_else(test, if_true, Expr::empty())
    }

    pub fn if_then_else(test: Expr, if_true: Expr, if_false: Expr) -> Expr {
        Expr::Conditional {
            test: Box::new(test),
            if_true: Box::new(if_true),
            if_false: Box::new(if_false),
            ty: Type::Void,
        }
    }

    pub fn loop_(body: Expr, break_label: Option<LabelTarget>, continue_label: Option<LabelTarget>) -> Expr {
        Expr::Loop(Arc::new(LoopExpr { body, break_label, continue_label }))
    }

    pub fn goto(target: &LabelTarget) -> Expr {
        Self::make_goto(GotoKind::Goto, target, None)
    }

    pub fn goto_with(target: &LabelTarget, value: Expr) -> Expr {
        Self::make_goto(GotoKind::Goto, target, Some(value))
    }

    pub fn return_(target: &LabelTarget, value: Option<Expr>) -> Expr {
        Self::make_goto(GotoKind::Return, target, value)
    }

    pub fn break_(target: &LabelTarget, value: Option<Expr>) -> Expr {
        Self::make_goto(GotoKind::Break, target, value)
    }

    pub fn continue_(target: &LabelTarget) -> Expr {
        Self::make_goto(GotoKind::Continue, target, None)
    }

    pub fn make_goto(kind: GotoKind, target: &LabelTarget, value: Option<Expr>) -> Expr {
        Expr::Goto { kind, target: target.clone(), value: value.map(Box::new), ty: Type::Void }
    }

    pub fn label(target: &LabelTarget, default: Option<Expr>) -> Expr {
        Expr::Label { target: target.clone(), default: default.map(Box::new) }
    }

    pub fn switch(value: Expr, cases: Vec<SwitchCase>, default: Option<Expr>, ty: Type) -> Expr {
        Expr::Switch(Box::new(SwitchExpr { value, cases, default, ty }))
    }

    pub fn throw(value: Expr) -> Expr {
        Expr::Throw { value: Some(Box::new(value)), ty: Type::Void }
    }

    pub fn rethrow() -> Expr {
        Expr::Throw { value: None, ty: Type::Void }
    }

    pub fn try_catch(body: Expr, handlers: Vec<CatchBlock>) -> Expr {
        let ty = body.ty();
        Expr::Try(Box::new(TryExpr { body, handlers, finally: None, fault: None, ty }))
    }

    pub fn try_finally(body: Expr, finally: Expr) -> Expr {
        let ty = body.ty();
        Expr::Try(Box::new(TryExpr { body, handlers: Vec::new(), finally: Some(finally), fault: None, ty }))
    }

    pub fn try_catch_finally(body: Expr, handlers: Vec<CatchBlock>, finally: Expr) -> Expr {
        let ty = body.ty();
        Expr::Try(Box::new(TryExpr { body, handlers, finally: Some(finally), fault: None, ty }))
    }

    pub fn try_fault(body: Expr, fault: Expr) -> Expr {
        let ty = body.ty();
        Expr::Try(Box::new(TryExpr { body, handlers: Vec::new(), finally: None, fault: Some(fault), ty }))
    }

    // === Calls and data ===

    pub fn lambda(lambda: &Arc<LambdaExpr>) -> Expr {
        Expr::Lambda(Arc::clone(lambda))
    }

    pub fn invoke(callee: Expr, args: Vec<Expr>) -> Expr {
        Expr::Invoke { callee: Box::new(callee), args }
    }

    pub fn call(method: &Arc<Method>, instance: Option<Expr>, args: Vec<Expr>) -> Expr {
        Expr::Call { method: Arc::clone(method), instance: instance.map(Box::new), args }
    }

    pub fn new_object(class: &Arc<Class>, args: Vec<Expr>) -> Expr {
        Expr::New { class: Arc::clone(class), args }
    }

    /// Field access by name. Unknown names resolve to an out-of-range index
    /// and fail at lowering.
    pub fn field(target: Expr, class: &Arc<Class>, name: &str) -> Expr {
        let index = class.field_index(name).unwrap_or(usize::MAX);
        Expr::Field { target: Box::new(target), class: Arc::clone(class), index }
    }

    pub fn new_array(element: Type, items: Vec<Expr>) -> Expr {
        Expr::NewArray { element, items }
    }

    pub fn new_array_bounds(element: Type, length: Expr) -> Expr {
        Expr::NewArrayBounds { element, length: Box::new(length) }
    }

    pub fn index(array: Expr, index: Expr) -> Expr {
        Expr::Index { array: Box::new(array), index: Box::new(index) }
    }

    pub fn array_length(array: Expr) -> Expr {
        Expr::ArrayLength(Box::new(array))
    }

    pub fn type_is(operand: Expr, ty: Type) -> Expr {
        Expr::TypeIs { operand: Box::new(operand), ty }
    }

    pub fn type_as(operand: Expr, ty: Type) -> Expr {
        Expr::TypeAs { operand: Box::new(operand), ty }
    }

    pub fn convert(operand: Expr, ty: Type) -> Expr {
        Expr::Convert { operand: Box::new(operand), ty }
    }

    pub fn dynamic(site: &Arc<CallSite>, args: Vec<Expr>, ty: Type) -> Expr {
        Expr::Dynamic { site: Arc::clone(site), args, ty }
    }

    pub fn debug_info(file: Option<&str>, start_line: u32, end_line: u32) -> Expr {
        Expr::DebugInfo(DebugInfoExpr { file: file.map(Into::into), start_line, end_line, clear: false })
    }

    pub fn clear_debug_info() -> Expr {
        Expr::DebugInfo(DebugInfoExpr { file: None, start_line: 0, end_line: 0, clear: true })
    }

    /// Sets the static type of a goto, throw or conditional node. Other
    /// nodes are returned unchanged.
    pub fn typed(self, ty: Type) -> Expr {
        match self {
            Expr::Goto { kind, target, value, .. } => Expr::Goto { kind, target, value, ty },
            Expr::Throw { value, .. } => Expr::Throw { value, ty },
            Expr::Conditional { test, if_true, if_false, .. } => {
                Expr::Conditional { test, if_true, if_false, ty }
            }
            other => other,
        }
    }
}

impl CatchBlock {
    pub fn new(class: Type, variable: Option<Variable>, body: Expr) -> Self {
        Self { class, variable, filter: None, body }
    }

    /// Catch-all for the root exception class.
    pub fn catch_all(variable: Option<Variable>, body: Expr) -> Self {
        Self::new(Type::exception(), variable, body)
    }

    pub fn with_filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl SwitchCase {
    pub fn new(tests: Vec<Expr>, body: Expr) -> Self {
        Self { tests, body }
    }
}
