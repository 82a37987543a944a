use std::collections::HashMap;

use crate::ast::{Ast, AttrDef, Expr, ExprId, VarBinding};
use crate::diagnostics::Diagnostic;
use crate::symbols::{Symbol, SymbolTable};

/// Names bound by the evaluator's initial environment. References to
/// these resolve past every lexical scope, so they never produce an
/// "undefined variable" report here.
const GLOBALS: &[&str] = &[
    "builtins",
    "true",
    "false",
    "null",
    "import",
    "derivation",
    "derivationStrict",
    "abort",
    "throw",
    "map",
    "toString",
    "baseNameOf",
    "dirOf",
    "removeAttrs",
    "isNull",
    "fetchTarball",
    "fetchGit",
    "placeholder",
    "scopedImport",
];

struct Frame {
    is_with: bool,
    slots: HashMap<Symbol, usize>,
}

impl Frame {
    fn with_scope() -> Self {
        Frame {
            is_with: true,
            slots: HashMap::new(),
        }
    }

    fn from_attrs(attrs: &[AttrDef]) -> Self {
        let mut slots = HashMap::new();
        for (index, attr) in attrs.iter().enumerate() {
            slots.entry(attr.name).or_insert(index);
        }
        Frame {
            is_with: false,
            slots,
        }
    }
}

/// Walks the tree reconstructing the static environment chain and stamps
/// every `Var` with its displacement, `FromWith`, or `Unbound`. Levels
/// count binding environments only; `with` scopes are dynamic and do not
/// contribute to a displacement.
pub fn bind_variables(ast: &mut Ast, symbols: &mut SymbolTable) -> Vec<Diagnostic> {
    let mut globals = HashMap::new();
    for (index, name) in GLOBALS.iter().enumerate() {
        globals.insert(symbols.intern(name), index);
    }

    let mut binder = Binder {
        assignments: Vec::new(),
        diagnostics: Vec::new(),
    };
    let mut stack = vec![Frame {
        is_with: false,
        slots: globals,
    }];
    binder.visit(ast, ast.root, &mut stack, symbols);

    let Binder {
        assignments,
        diagnostics,
    } = binder;
    for (id, binding) in assignments {
        if let Expr::Var { binding: slot, .. } = ast.node_mut(id) {
            *slot = binding;
        }
    }
    diagnostics
}

struct Binder {
    assignments: Vec<(ExprId, VarBinding)>,
    diagnostics: Vec<Diagnostic>,
}

impl Binder {
    fn visit(&mut self, ast: &Ast, id: ExprId, stack: &mut Vec<Frame>, symbols: &SymbolTable) {
        match ast.node(id) {
            Expr::Var { name, .. } => {
                let binding = lookup(stack, *name);
                if binding == VarBinding::Unbound {
                    self.diagnostics.push(Diagnostic::new(
                        "E0200",
                        format!("undefined variable '{}'", symbols.resolve(*name)),
                        ast.span(id),
                    ));
                }
                self.assignments.push((id, binding));
            }
            Expr::AttrSet {
                recursive: true,
                attrs,
                dynamic,
                ..
            } => {
                for dyn_attr in dynamic {
                    self.visit(ast, dyn_attr.name, stack, symbols);
                }
                for attr in attrs {
                    if attr.inherited {
                        self.visit(ast, attr.value, stack, symbols);
                    }
                }
                stack.push(Frame::from_attrs(attrs));
                for attr in attrs {
                    if !attr.inherited {
                        self.visit(ast, attr.value, stack, symbols);
                    }
                }
                for dyn_attr in dynamic {
                    self.visit(ast, dyn_attr.value, stack, symbols);
                }
                stack.pop();
            }
            Expr::Let { attrs, body, .. } => {
                for attr in attrs {
                    if attr.inherited {
                        self.visit(ast, attr.value, stack, symbols);
                    }
                }
                stack.push(Frame::from_attrs(attrs));
                for attr in attrs {
                    if !attr.inherited {
                        self.visit(ast, attr.value, stack, symbols);
                    }
                }
                self.visit(ast, *body, stack, symbols);
                stack.pop();
            }
            Expr::Lambda {
                arg, formals, body, ..
            } => {
                let mut slots = HashMap::new();
                let mut next = 0;
                if let Some((name, _)) = arg {
                    slots.insert(*name, next);
                    next += 1;
                }
                if let Some(formals) = formals {
                    for formal in &formals.formals {
                        slots.entry(formal.name).or_insert(next);
                        next += 1;
                    }
                }
                stack.push(Frame {
                    is_with: false,
                    slots,
                });
                if let Some(formals) = formals {
                    for formal in &formals.formals {
                        if let Some(default) = formal.default {
                            self.visit(ast, default, stack, symbols);
                        }
                    }
                }
                self.visit(ast, *body, stack, symbols);
                stack.pop();
            }
            Expr::With { scope, body, .. } => {
                self.visit(ast, *scope, stack, symbols);
                stack.push(Frame::with_scope());
                self.visit(ast, *body, stack, symbols);
                stack.pop();
            }
            _ => {
                let mut children = Vec::new();
                ast.for_each_child(id, |child| children.push(child));
                for child in children {
                    self.visit(ast, child, stack, symbols);
                }
            }
        }
    }
}

fn lookup(stack: &[Frame], name: Symbol) -> VarBinding {
    let mut level = 0;
    let mut saw_with = false;
    for frame in stack.iter().rev() {
        if frame.is_with {
            saw_with = true;
            continue;
        }
        if let Some(&index) = frame.slots.get(&name) {
            return VarBinding::Static { level, index };
        }
        level += 1;
    }
    if saw_with {
        VarBinding::FromWith
    } else {
        VarBinding::Unbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn bind(src: &str) -> (Ast, SymbolTable, Vec<Diagnostic>) {
        let parse = parse(src);
        let mut ast = parse.ast;
        let mut symbols = parse.symbols;
        let diagnostics = bind_variables(&mut ast, &mut symbols);
        (ast, symbols, diagnostics)
    }

    fn var_bindings(ast: &Ast, symbols: &SymbolTable, name: &str) -> Vec<VarBinding> {
        let mut out = Vec::new();
        let mut collect = |id: ExprId| {
            if let Expr::Var {
                name: sym, binding, ..
            } = ast.node(id)
            {
                if symbols.resolve(*sym) == name {
                    out.push(*binding);
                }
            }
        };
        ast.walk(ast.root, &mut collect, &mut |_| {});
        out
    }

    #[test]
    fn let_binding_resolves_statically() {
        let (ast, symbols, diagnostics) = bind("let x = 1; in x");
        assert!(diagnostics.is_empty());
        assert_eq!(
            var_bindings(&ast, &symbols, "x"),
            vec![VarBinding::Static { level: 0, index: 0 }]
        );
    }

    #[test]
    fn non_recursive_set_does_not_bind() {
        let (ast, symbols, diagnostics) = bind("{ a = 1; b = a; }");
        assert_eq!(var_bindings(&ast, &symbols, "a"), vec![VarBinding::Unbound]);
        assert!(diagnostics.iter().any(|d| d.message.contains("'a'")));
    }

    #[test]
    fn recursive_set_binds_values() {
        let (ast, symbols, diagnostics) = bind("rec { a = 1; b = a; }");
        assert!(diagnostics.is_empty());
        assert_eq!(
            var_bindings(&ast, &symbols, "a"),
            vec![VarBinding::Static { level: 0, index: 0 }]
        );
    }

    #[test]
    fn with_scope_marks_from_with() {
        let (ast, symbols, _) = bind("s: with s; hello");
        assert_eq!(
            var_bindings(&ast, &symbols, "hello"),
            vec![VarBinding::FromWith]
        );
    }

    #[test]
    fn static_binding_wins_over_with_and_skips_its_level() {
        let (ast, symbols, diagnostics) = bind("s: let x = 1; in with s; x");
        assert!(diagnostics.is_empty());
        assert_eq!(
            var_bindings(&ast, &symbols, "x"),
            vec![VarBinding::Static { level: 0, index: 0 }]
        );
    }

    #[test]
    fn lambda_at_pattern_occupies_slot_zero() {
        let (ast, symbols, _) = bind("args@{ a, b }: args");
        assert_eq!(
            var_bindings(&ast, &symbols, "args"),
            vec![VarBinding::Static { level: 0, index: 0 }]
        );
        let (ast, symbols, _) = bind("args@{ a, b }: b");
        assert_eq!(
            var_bindings(&ast, &symbols, "b"),
            vec![VarBinding::Static { level: 0, index: 2 }]
        );
    }

    #[test]
    fn formal_defaults_see_sibling_formals() {
        let (ast, symbols, diagnostics) = bind("{ a, b ? a }: b");
        assert!(diagnostics.is_empty());
        assert_eq!(
            var_bindings(&ast, &symbols, "a"),
            vec![VarBinding::Static { level: 0, index: 0 }]
        );
    }

    #[test]
    fn globals_are_never_undefined() {
        let (_, _, diagnostics) = bind("if true then null else builtins.nixVersion");
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn inherited_value_binds_in_enclosing_scope() {
        let (ast, symbols, diagnostics) = bind("let a = 1; in rec { inherit a; }");
        assert!(diagnostics.is_empty());
        // The synthesized variable for `inherit a` must reach the outer
        // let, not the rec set it syntactically sits in.
        assert_eq!(
            var_bindings(&ast, &symbols, "a"),
            vec![VarBinding::Static { level: 0, index: 0 }]
        );
    }
}
