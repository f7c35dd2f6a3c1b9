//! Variable capture analysis.

use crate::tree::{Expr, LambdaExpr, Variable};
use hashbrown::HashSet;

/// Variables `lambda` uses but does not define, in order of first use.
pub(super) fn free_variables(lambda: &LambdaExpr) -> Vec<Variable> {
    let mut defined: HashSet<Variable> = lambda.params.iter().cloned().collect();
    collect_definitions(&lambda.body, &mut defined);
    let mut used = Vec::new();
    let mut seen = HashSet::new();
    collect_uses(&lambda.body, &mut used, &mut seen);
    used.retain(|v| !defined.contains(v));
    used
}

/// Variables used by lambdas nested directly or indirectly in `body`.
/// Definitions of these must live in cells.
pub(super) fn captured_variables(body: &Expr) -> HashSet<Variable> {
    let mut captured = HashSet::new();
    visit(body, &mut |expr| {
        if let Expr::Lambda(lambda) = expr {
            captured.extend(free_variables(lambda));
        }
    });
    captured
}

fn collect_definitions(expr: &Expr, defined: &mut HashSet<Variable>) {
    visit(expr, &mut |node| match node {
        Expr::Block(block) => defined.extend(block.variables.iter().cloned()),
        Expr::Try(try_expr) => {
            defined.extend(try_expr.handlers.iter().filter_map(|h| h.variable.clone()));
        }
        _ => {}
    });
}

fn collect_uses(expr: &Expr, used: &mut Vec<Variable>, seen: &mut HashSet<Variable>) {
    visit(expr, &mut |node| {
        let found = match node {
            Expr::Parameter(variable) => vec![variable.clone()],
            Expr::Lambda(lambda) => free_variables(lambda),
            _ => Vec::new(),
        };
        for variable in found {
            if seen.insert(variable.clone()) {
                used.push(variable);
            }
        }
    });
}

/// Pre-order walk that does not enter lambda bodies.
fn visit(expr: &Expr, f: &mut impl FnMut(&Expr)) {
    f(expr);
    for child in expr.children() {
        visit(child, &mut *f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    #[test]
    fn test_free_variables_skip_own_definitions() {
        let x = Variable::new("x", Type::Int);
        let y = Variable::new("y", Type::Int);
        let local = Variable::new("local", Type::Int);
        let body = Expr::block(
            vec![local.clone()],
            vec![
                Expr::assign(Expr::param(&local), Expr::param(&y)),
                Expr::add(Expr::param(&local), Expr::param(&x)),
            ],
        );
        let lambda = LambdaExpr::new("f", vec![x.clone()], body);
        assert_eq!(free_variables(&lambda), vec![y]);
    }

    #[test]
    fn test_nested_lambda_captures_propagate() {
        let outer = Variable::new("outer", Type::Int);
        let inner = LambdaExpr::new("inner", vec![], Expr::param(&outer));
        let middle = LambdaExpr::new("middle", vec![], Expr::invoke(Expr::lambda(&inner), vec![]));
        assert_eq!(free_variables(&middle), vec![outer.clone()]);

        let body = Expr::block(vec![outer.clone()], vec![Expr::lambda(&middle)]);
        assert!(captured_variables(&body).contains(&outer));
    }
}
