//! A pretty-printer for the AST, used only to exercise the parser's
//! round-trip property (`parse ∘ pretty_print` must reproduce the same
//! tree, up to source locations). Not part of the compiler pipeline itself.

use super::ast::*;

pub fn pretty_print(program: &Program) -> String {
    let mut out = String::new();
    for procedure in &program.procedures {
        pp_procedure(procedure, &mut out);
        out.push(' ');
    }
    out.push_str("PROGRAM IS ");
    pp_context(&program.main, &mut out);
    out
}

fn pp_procedure(procedure: &Procedure, out: &mut String) {
    out.push_str("PROCEDURE ");
    out.push_str(&procedure.name);
    out.push('(');
    for (i, arg) in procedure.args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        if arg.is_array {
            out.push_str("T ");
        }
        out.push_str(&arg.name);
    }
    out.push_str(") IS ");
    pp_context(&procedure.context, out);
}

fn pp_context(context: &Context, out: &mut String) {
    for (i, decl) in context.declarations.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&decl.name);
        if let Some(size) = decl.array_size {
            out.push('[');
            out.push_str(&size.to_string());
            out.push(']');
        }
    }
    out.push_str(" IN ");
    for command in &context.commands {
        pp_command(command, out);
        out.push(' ');
    }
    out.push_str("END");
}

fn pp_command(command: &Command, out: &mut String) {
    match command {
        Command::Assign { target, expr } => {
            pp_identifier(target, out);
            out.push_str(" := ");
            pp_expr(expr, out);
            out.push(';');
        }
        Command::Read(id) => {
            out.push_str("READ ");
            pp_identifier(id, out);
            out.push(';');
        }
        Command::Write(value) => {
            out.push_str("WRITE ");
            pp_value(value, out);
            out.push(';');
        }
        Command::If { cond, then_branch, else_branch } => {
            out.push_str("IF ");
            pp_condition(cond, out);
            out.push_str(" THEN ");
            for c in then_branch {
                pp_command(c, out);
                out.push(' ');
            }
            if let Some(else_branch) = else_branch {
                out.push_str("ELSE ");
                for c in else_branch {
                    pp_command(c, out);
                    out.push(' ');
                }
            }
            out.push_str("ENDIF");
        }
        Command::While { cond, body } => {
            out.push_str("WHILE ");
            pp_condition(cond, out);
            out.push_str(" DO ");
            for c in body {
                pp_command(c, out);
                out.push(' ');
            }
            out.push_str("ENDWHILE");
        }
        Command::Repeat { body, cond } => {
            out.push_str("REPEAT ");
            for c in body {
                pp_command(c, out);
                out.push(' ');
            }
            out.push_str("UNTIL ");
            pp_condition(cond, out);
            out.push(';');
        }
        Command::Call { name, args, .. } => {
            out.push_str(name);
            out.push('(');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                pp_identifier(arg, out);
            }
            out.push_str(");");
        }
        Command::InlinedProcedure(commands) => {
            for c in commands {
                pp_command(c, out);
                out.push(' ');
            }
        }
    }
}

fn pp_identifier(id: &Identifier, out: &mut String) {
    out.push_str(&id.name);
    if let Some(index) = &id.index {
        out.push('[');
        match index {
            Index::Literal(n) => out.push_str(&n.to_string()),
            Index::Variable(name) => out.push_str(name),
        }
        out.push(']');
    }
}

fn pp_value(value: &Value, out: &mut String) {
    match value {
        Value::Num(n) => out.push_str(&n.to_string()),
        Value::Id(id) => pp_identifier(id, out),
    }
}

fn pp_expr(expr: &Expr, out: &mut String) {
    match expr {
        Expr::Value(v) => pp_value(v, out),
        Expr::Binary(b) => {
            pp_value(&b.lhs, out);
            out.push(' ');
            out.push_str(&b.op.to_string());
            out.push(' ');
            pp_value(&b.rhs, out);
        }
    }
}

fn pp_condition(cond: &Condition, out: &mut String) {
    pp_value(&cond.lhs, out);
    out.push(' ');
    out.push_str(match cond.op {
        RelOp::Eq => "=",
        RelOp::Ne => "!=",
        RelOp::Lt => "<",
        RelOp::Le => "<=",
        RelOp::Gt => ">",
        RelOp::Ge => ">=",
    });
    out.push(' ');
    pp_value(&cond.rhs, out);
}

/// Structural equality ignoring every `Loc`, since pretty-printed source
/// never reproduces the original program's exact line/column layout.
pub fn shape_eq(a: &Program, b: &Program) -> bool {
    a.procedures.len() == b.procedures.len()
        && a.procedures.iter().zip(&b.procedures).all(|(x, y)| procedure_eq(x, y))
        && context_eq(&a.main, &b.main)
}

fn procedure_eq(a: &Procedure, b: &Procedure) -> bool {
    a.name == b.name
        && a.args.len() == b.args.len()
        && a.args.iter().zip(&b.args).all(|(x, y)| x.name == y.name && x.is_array == y.is_array)
        && context_eq(&a.context, &b.context)
}

fn context_eq(a: &Context, b: &Context) -> bool {
    a.declarations.len() == b.declarations.len()
        && a.declarations
            .iter()
            .zip(&b.declarations)
            .all(|(x, y)| x.name == y.name && x.array_size == y.array_size)
        && commands_eq(&a.commands, &b.commands)
}

fn commands_eq(a: &[Command], b: &[Command]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| command_eq(x, y))
}

fn command_eq(a: &Command, b: &Command) -> bool {
    match (a, b) {
        (Command::Assign { target: t1, expr: e1 }, Command::Assign { target: t2, expr: e2 }) => {
            identifier_eq(t1, t2) && expr_eq(e1, e2)
        }
        (Command::Read(x), Command::Read(y)) => identifier_eq(x, y),
        (Command::Write(x), Command::Write(y)) => value_eq(x, y),
        (
            Command::If { cond: c1, then_branch: t1, else_branch: e1 },
            Command::If { cond: c2, then_branch: t2, else_branch: e2 },
        ) => {
            condition_eq(c1, c2)
                && commands_eq(t1, t2)
                && match (e1, e2) {
                    (None, None) => true,
                    (Some(x), Some(y)) => commands_eq(x, y),
                    _ => false,
                }
        }
        (Command::While { cond: c1, body: b1 }, Command::While { cond: c2, body: b2 }) => {
            condition_eq(c1, c2) && commands_eq(b1, b2)
        }
        (Command::Repeat { body: b1, cond: c1 }, Command::Repeat { body: b2, cond: c2 }) => {
            commands_eq(b1, b2) && condition_eq(c1, c2)
        }
        (Command::Call { name: n1, args: a1, .. }, Command::Call { name: n2, args: a2, .. }) => {
            n1 == n2 && a1.len() == a2.len() && a1.iter().zip(a2).all(|(x, y)| identifier_eq(x, y))
        }
        (Command::InlinedProcedure(x), Command::InlinedProcedure(y)) => commands_eq(x, y),
        _ => false,
    }
}

fn identifier_eq(a: &Identifier, b: &Identifier) -> bool {
    a.name == b.name
        && match (&a.index, &b.index) {
            (None, None) => true,
            (Some(Index::Literal(x)), Some(Index::Literal(y))) => x == y,
            (Some(Index::Variable(x)), Some(Index::Variable(y))) => x == y,
            _ => false,
        }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Id(x), Value::Id(y)) => identifier_eq(x, y),
        _ => false,
    }
}

fn expr_eq(a: &Expr, b: &Expr) -> bool {
    match (a, b) {
        (Expr::Value(x), Expr::Value(y)) => value_eq(x, y),
        (Expr::Binary(x), Expr::Binary(y)) => x.op == y.op && value_eq(&x.lhs, &y.lhs) && value_eq(&x.rhs, &y.rhs),
        _ => false,
    }
}

fn condition_eq(a: &Condition, b: &Condition) -> bool {
    a.op == b.op && value_eq(&a.lhs, &b.lhs) && value_eq(&a.rhs, &b.rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;

    fn roundtrip(src: &str) {
        let ast = parse(src).expect("parses");
        let printed = pretty_print(&ast);
        let reparsed = parse(&printed).unwrap_or_else(|e| panic!("pretty-printed source failed to parse: {e}\n{printed}"));
        assert!(shape_eq(&ast, &reparsed), "round trip changed AST shape:\n{printed}");
    }

    #[test]
    fn roundtrips_minimal_main() {
        roundtrip("PROGRAM IS IN END");
    }

    #[test]
    fn roundtrips_declarations_and_arithmetic() {
        roundtrip("PROGRAM IS a, b[10] IN a := 1 + 2; b[0] := a - 3; WRITE b[0]; END");
    }

    #[test]
    fn roundtrips_control_flow() {
        let src = "PROGRAM IS a, b IN \
            IF a < b THEN WRITE a; ELSE WRITE b; ENDIF \
            WHILE a != b DO a := a + 1; ENDWHILE \
            REPEAT a := a - 1; UNTIL a = 0; \
            END";
        roundtrip(src);
    }

    #[test]
    fn roundtrips_procedures_and_calls() {
        let src = "PROCEDURE inc(x) IS IN x := x + 1; END \
                   PROCEDURE copy(T a, T b) IS IN b[0] := a[0]; END \
                   PROGRAM IS n IN inc(n); READ n; END";
        roundtrip(src);
    }
}
