use std::collections::HashSet;
use std::fmt;

use crate::ast::{Ast, Expr, ExprId, PosIdx, VarBinding};
use crate::symbols::Symbol;

/// Child to parent lookup over one tree. Built once per published AST
/// and shared read-only between request handlers.
#[derive(Debug)]
pub struct ParentMap {
    parents: Vec<Option<ExprId>>,
}

impl ParentMap {
    pub fn build(ast: &Ast) -> Self {
        let mut parents = vec![None; ast.len()];
        let mut stack = vec![ast.root];
        while let Some(id) = stack.pop() {
            ast.for_each_child(id, |child| {
                parents[child.index()] = Some(id);
                stack.push(child);
            });
        }
        ParentMap { parents }
    }

    pub fn parent(&self, id: ExprId) -> Option<ExprId> {
        self.parents[id.index()]
    }
}

/// Tagged failures of the static lookups. None of these cross the API
/// surface as panics; callers downgrade them to neutral replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    /// The queried node is not a variable reference.
    NotADefinition,
    /// The displacement walked past the root without finding its env.
    Unbound,
    /// The addressed ancestor does not create an environment.
    NotEnvCreating,
    /// No binding occurrence exists for the requested slot.
    NotFound,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResolveError::NotADefinition => "not a definition reference",
            ResolveError::Unbound => "variable is unbound",
            ResolveError::NotEnvCreating => "ancestor does not create an environment",
            ResolveError::NotFound => "no binding found",
        };
        f.write_str(text)
    }
}

/// Statically locate the binding occurrence of a variable reference.
///
/// Walks parent pointers from the variable, dropping one displacement
/// level at every ancestor that creates the environment its chain runs
/// through. `with` scopes are dynamic and never consume a level.
pub fn definition_of(
    ast: &Ast,
    parents: &ParentMap,
    var: ExprId,
) -> Result<PosIdx, ResolveError> {
    let Expr::Var { binding, .. } = ast.node(var) else {
        return Err(ResolveError::NotADefinition);
    };
    let (mut level, index) = match binding {
        VarBinding::Static { level, index } => (*level, *index),
        VarBinding::Unbound => return Err(ResolveError::Unbound),
        VarBinding::FromWith | VarBinding::Unresolved => return Err(ResolveError::NotFound),
    };

    let mut child = var;
    loop {
        let Some(parent) = parents.parent(child) else {
            return Err(ResolveError::Unbound);
        };
        if is_env_created(ast, parent, child) && !matches!(ast.node(parent), Expr::With { .. }) {
            if level == 0 {
                return displacement_of(ast, parent, index);
            }
            level -= 1;
        }
        child = parent;
    }
}

/// Position of the `index`-th slot of an env-creating node.
pub fn displacement_of(ast: &Ast, id: ExprId, index: usize) -> Result<PosIdx, ResolveError> {
    match ast.node(id) {
        Expr::AttrSet {
            recursive: true,
            attrs,
            ..
        } => attrs
            .get(index)
            .map(|attr| attr.name_pos)
            .ok_or(ResolveError::NotFound),
        Expr::AttrSet { .. } => Err(ResolveError::NotEnvCreating),
        Expr::Let { attrs, pos, .. } => {
            if index < attrs.len() {
                return Ok(attrs[index].name_pos);
            }
            // The body sentinel addresses the construct itself.
            if index == attrs.len() {
                return Ok(*pos);
            }
            Err(ResolveError::NotFound)
        }
        Expr::Lambda { arg, formals, .. } => {
            let formal_index = match arg {
                Some((_, arg_pos)) => {
                    if index == 0 {
                        return Ok(*arg_pos);
                    }
                    index - 1
                }
                None => index,
            };
            formals
                .as_ref()
                .and_then(|f| f.formals.get(formal_index))
                .map(|formal| formal.pos)
                .ok_or(ResolveError::NotFound)
        }
        _ => Err(ResolveError::NotEnvCreating),
    }
}

/// Whether `parent` creates the environment `child` lexically lives in.
pub fn is_env_created(ast: &Ast, parent: ExprId, child: ExprId) -> bool {
    match ast.node(parent) {
        Expr::AttrSet {
            recursive: true,
            attrs,
            dynamic,
            ..
        } => {
            attrs
                .iter()
                .any(|attr| !attr.inherited && attr.value == child)
                || dynamic.iter().any(|dyn_attr| dyn_attr.value == child)
        }
        Expr::AttrSet { .. } => false,
        Expr::Let { attrs, body, .. } => {
            *body == child
                || attrs
                    .iter()
                    .any(|attr| !attr.inherited && attr.value == child)
        }
        Expr::Lambda { formals, body, .. } => {
            *body == child
                || formals.as_ref().is_some_and(|f| {
                    f.formals.iter().any(|formal| formal.default == Some(child))
                })
        }
        Expr::With { body, .. } => *body == child,
        _ => false,
    }
}

/// Statically visible identifiers at `expr`, innermost scope first.
/// Seeds completion; `with` scopes contribute nothing statically.
pub fn collect_symbols(ast: &Ast, parents: &ParentMap, expr: ExprId) -> Vec<Symbol> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |out: &mut Vec<Symbol>, seen: &mut HashSet<Symbol>, sym: Symbol| {
        if seen.insert(sym) {
            out.push(sym);
        }
    };

    let mut child = expr;
    while let Some(parent) = parents.parent(child) {
        if is_env_created(ast, parent, child) {
            match ast.node(parent) {
                Expr::AttrSet { attrs, .. } | Expr::Let { attrs, .. } => {
                    for attr in attrs {
                        push(&mut out, &mut seen, attr.name);
                    }
                }
                Expr::Lambda { arg, formals, .. } => {
                    if let Some((name, _)) = arg {
                        push(&mut out, &mut seen, *name);
                    }
                    if let Some(formals) = formals {
                        for formal in &formals.formals {
                            push(&mut out, &mut seen, formal.name);
                        }
                    }
                }
                _ => {}
            }
        }
        child = parent;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::VarBinding;
    use crate::binder::bind_variables;
    use crate::diagnostics::Position;
    use crate::parser::parse;
    use crate::symbols::SymbolTable;

    fn setup(src: &str) -> (Ast, SymbolTable, ParentMap) {
        let parsed = parse(src);
        let mut ast = parsed.ast;
        let mut symbols = parsed.symbols;
        bind_variables(&mut ast, &mut symbols);
        let parents = ParentMap::build(&ast);
        (ast, symbols, parents)
    }

    /// The `occurrence`-th (0-based) variable named `name`, in pre-order.
    fn var(ast: &Ast, symbols: &SymbolTable, name: &str, occurrence: usize) -> ExprId {
        let mut found = Vec::new();
        let mut collect = |id: ExprId| {
            if let Expr::Var { name: sym, .. } = ast.node(id) {
                if symbols.resolve(*sym) == name {
                    found.push(id);
                }
            }
        };
        ast.walk(ast.root, &mut collect, &mut |_| {});
        found[occurrence]
    }

    fn def_start(ast: &Ast, parents: &ParentMap, id: ExprId) -> Position {
        let pos = definition_of(ast, parents, id).expect("definition resolves");
        ast.positions.span(pos).start
    }

    #[test]
    fn let_body_variable_points_at_binding() {
        let (ast, symbols, parents) = setup("let x = 1; in x");
        let use_site = var(&ast, &symbols, "x", 0);
        assert_eq!(
            def_start(&ast, &parents, use_site),
            Position { line: 1, column: 5 }
        );
    }

    #[test]
    fn non_recursive_attrset_reports_unbound() {
        let (ast, symbols, parents) = setup("{ a = 1; b = a; }");
        let use_site = var(&ast, &symbols, "a", 0);
        assert_eq!(
            definition_of(&ast, &parents, use_site),
            Err(ResolveError::Unbound)
        );
    }

    #[test]
    fn recursive_attrset_resolves_to_name() {
        let (ast, symbols, parents) = setup("rec { a = 1; b = a; }");
        let use_site = var(&ast, &symbols, "a", 0);
        assert_eq!(
            def_start(&ast, &parents, use_site),
            Position { line: 1, column: 7 }
        );
    }

    #[test]
    fn formal_parameter_resolves_to_formal() {
        let (ast, symbols, parents) = setup("{ pkgs }: pkgs.hello");
        let use_site = var(&ast, &symbols, "pkgs", 0);
        assert_eq!(
            def_start(&ast, &parents, use_site),
            Position { line: 1, column: 3 }
        );
    }

    #[test]
    fn from_with_variables_are_not_statically_resolvable() {
        let (ast, symbols, parents) = setup("s: with s; hello");
        let use_site = var(&ast, &symbols, "hello", 0);
        assert_eq!(
            definition_of(&ast, &parents, use_site),
            Err(ResolveError::NotFound)
        );
    }

    #[test]
    fn with_scope_does_not_consume_a_level() {
        let (ast, symbols, parents) = setup("s: let x = 1; in with s; x + x");
        for occurrence in 0..2 {
            let use_site = var(&ast, &symbols, "x", occurrence);
            assert_eq!(
                def_start(&ast, &parents, use_site),
                Position {
                    line: 1,
                    column: 8
                }
            );
        }
    }

    #[test]
    fn shadowing_resolves_to_innermost_binding() {
        let (ast, symbols, parents) = setup("let x = 1; in (x: x) x");
        // Inside the lambda the parameter shadows the let binding.
        let inner = var(&ast, &symbols, "x", 0);
        assert_eq!(
            def_start(&ast, &parents, inner),
            Position {
                line: 1,
                column: 16
            }
        );
        // The application argument still sees the let binding.
        let outer = var(&ast, &symbols, "x", 1);
        assert_eq!(
            def_start(&ast, &parents, outer),
            Position { line: 1, column: 5 }
        );
    }

    #[test]
    fn at_pattern_and_formals_resolve() {
        let (ast, symbols, parents) = setup("args@{ a, b ? a }: args");
        let whole = var(&ast, &symbols, "args", 0);
        assert_eq!(
            def_start(&ast, &parents, whole),
            Position { line: 1, column: 1 }
        );
        let default_use = var(&ast, &symbols, "a", 0);
        assert_eq!(
            def_start(&ast, &parents, default_use),
            Position { line: 1, column: 8 }
        );
    }

    #[test]
    fn builtin_reference_walks_off_the_root() {
        let (ast, symbols, parents) = setup("let x = 1; in x + true");
        let use_site = var(&ast, &symbols, "true", 0);
        assert_eq!(
            definition_of(&ast, &parents, use_site),
            Err(ResolveError::Unbound)
        );
    }

    #[test]
    fn definition_on_non_variable_is_rejected() {
        let (ast, _, parents) = setup("let x = 1; in x");
        assert_eq!(
            definition_of(&ast, &parents, ast.root),
            Err(ResolveError::NotADefinition)
        );
    }

    #[test]
    fn displacement_of_rejects_non_env_nodes() {
        let (ast, _, parents) = setup("{ a = 1; }");
        let _ = parents;
        assert_eq!(
            displacement_of(&ast, ast.root, 0),
            Err(ResolveError::NotEnvCreating)
        );
    }

    #[test]
    fn let_sentinel_addresses_the_construct() {
        let (ast, _, _) = setup("let a = 1; b = 2; in a");
        let Expr::Let { attrs, pos, .. } = ast.node(ast.root) else {
            panic!("root is a let");
        };
        assert_eq!(displacement_of(&ast, ast.root, attrs.len()), Ok(*pos));
        assert_eq!(
            displacement_of(&ast, ast.root, attrs.len() + 1),
            Err(ResolveError::NotFound)
        );
    }

    #[test]
    fn parent_map_is_total_and_acyclic() {
        let src = r#"
            { pkgs ? import <nixpkgs> { } }:
            let
              inherit (pkgs) lib;
              version = "1.2";
              paths = [ ./a.nix ./b.nix ];
            in rec {
              name = "demo-${version}";
              deps = with pkgs; [ hello ];
              meta = if lib != null then { inherit name; } else { };
            }
        "#;
        let (ast, _, parents) = setup(src);

        let mut reachable = Vec::new();
        let mut collect = |id: ExprId| reachable.push(id);
        ast.walk(ast.root, &mut collect, &mut |_| {});

        for id in &reachable {
            if *id == ast.root {
                assert_eq!(parents.parent(*id), None);
                continue;
            }
            let mut cursor = *id;
            let mut steps = 0;
            while let Some(parent) = parents.parent(cursor) {
                cursor = parent;
                steps += 1;
                assert!(steps <= ast.len(), "parent chain must terminate");
            }
            assert_eq!(cursor, ast.root, "every chain ends at the root");
        }
    }

    #[test]
    fn binding_region_encloses_the_use_site() {
        let sources = [
            "let x = 1; in x",
            "rec { a = 1; b = a; }",
            "{ pkgs }: pkgs.hello",
            "let f = { a ? 0 }: a; in f { }",
        ];
        for src in sources {
            let (ast, _, parents) = setup(src);
            let mut vars = Vec::new();
            let mut collect = |id: ExprId| {
                if matches!(
                    ast.node(id),
                    Expr::Var {
                        binding: VarBinding::Static { .. },
                        ..
                    }
                ) {
                    vars.push(id);
                }
            };
            ast.walk(ast.root, &mut collect, &mut |_| {});
            for id in vars {
                let Ok(def) = definition_of(&ast, &parents, id) else {
                    continue;
                };
                // Find the env-creating ancestor owning the binding and
                // check its region encloses the variable.
                let mut cursor = id;
                let mut region = None;
                while let Some(parent) = parents.parent(cursor) {
                    let owns = match ast.node(parent) {
                        Expr::Let { attrs, .. } | Expr::AttrSet { attrs, .. } => {
                            attrs.iter().any(|a| a.name_pos == def)
                        }
                        Expr::Lambda { arg, formals, .. } => {
                            arg.map(|(_, p)| p == def).unwrap_or(false)
                                || formals.as_ref().is_some_and(|f| {
                                    f.formals.iter().any(|formal| formal.pos == def)
                                })
                        }
                        _ => false,
                    };
                    if owns {
                        region = Some(ast.span(parent));
                        break;
                    }
                    cursor = parent;
                }
                let region = region.expect("binding owner found");
                assert!(region.encloses(ast.span(id)), "scope region contains use");
            }
        }
    }

    #[test]
    fn collect_symbols_sees_every_enclosing_scope() {
        let (ast, symbols, parents) = setup("let a = 1; b = 2; in c: c + a");
        let use_site = var(&ast, &symbols, "a", 0);
        let visible: Vec<&str> = collect_symbols(&ast, &parents, use_site)
            .into_iter()
            .map(|sym| symbols.resolve(sym))
            .collect();
        assert!(visible.contains(&"a"));
        assert!(visible.contains(&"b"));
        assert!(visible.contains(&"c"));
        // Innermost scope first.
        assert_eq!(visible[0], "c");
    }
}
