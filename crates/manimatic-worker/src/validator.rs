//! Static validation of untrusted animation scripts.
//!
//! Generated scripts are Python and run inside an external renderer, so they
//! must be screened before any subprocess is spawned. A regex filter is not
//! enough: string literals and comments produce both false positives and
//! false negatives. The validator parses the script into a syntax tree and
//! walks it, enforcing:
//!
//! - an import allowlist (`import X` / `from X import …`)
//! - a blocklist of dangerous builtin calls (`eval`, `exec`, `open`, …)
//! - a blocklist of introspection attributes (`__class__`, `__globals__`, …)
//! - a set of protected names that must not be rebound
//!
//! Every rejection carries the line and column from the parse tree and a
//! short human-readable reason.

use std::collections::HashSet;
use std::fmt;

use rustpython_parser::ast::{self, ExprKind, StmtKind};
use rustpython_parser::parser;

/// Policy sets consulted during the tree walk.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Modules that may be imported.
    pub allowed_imports: HashSet<String>,
    /// Builtins that must not be called directly.
    pub blocked_builtins: HashSet<String>,
    /// Attributes that must not be accessed.
    pub blocked_attrs: HashSet<String>,
    /// Names that must not be assigned to.
    pub protected_names: HashSet<String>,
}

fn name_set(names: &[&str]) -> HashSet<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            allowed_imports: name_set(&[
                "manim", "numpy", "math", "typing", "abc", "enum", "colour",
            ]),
            blocked_builtins: name_set(&[
                "eval",
                "exec",
                "open",
                "__import__",
                "getattr",
                "setattr",
            ]),
            blocked_attrs: name_set(&[
                "__dict__",
                "__class__",
                "__bases__",
                "__globals__",
                "__builtins__",
                "__subclasses__",
                "__getattribute__",
                "__setattr__",
            ]),
            protected_names: name_set(&["open", "__import__", "eval", "exec"]),
        }
    }
}

/// A script rejected by the validator, with its source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// 1-based source line of the offending node.
    pub line: usize,
    /// Source column of the offending node.
    pub column: usize,
    /// Human-readable reason for the rejection.
    pub message: String,
}

impl ValidationError {
    fn at(location: ast::Location, message: String) -> Self {
        Self {
            line: location.row(),
            column: location.column(),
            message,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "at line {}, column {}: {}",
            self.line, self.column, self.message
        )
    }
}

impl std::error::Error for ValidationError {}

/// AST-based script validator.
#[derive(Debug, Clone, Default)]
pub struct ScriptValidator {
    config: ValidatorConfig,
}

impl ScriptValidator {
    /// Creates a validator with the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a validator with an explicit policy.
    #[must_use]
    pub fn with_config(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Validates a script, returning the first violation found.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the script fails to parse or touches
    /// any blocked construct.
    pub fn validate(&self, script: &str) -> Result<(), ValidationError> {
        let program = parser::parse_program(script, "<script>").map_err(|e| {
            ValidationError::at(e.location, format!("failed to parse Python script: {e}"))
        })?;

        for stmt in &program {
            self.visit_stmt(stmt)?;
        }
        Ok(())
    }

    fn visit_body(&self, body: &[ast::Stmt]) -> Result<(), ValidationError> {
        for stmt in body {
            self.visit_stmt(stmt)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn visit_stmt(&self, stmt: &ast::Stmt) -> Result<(), ValidationError> {
        let location = stmt.location;
        match &stmt.node {
            StmtKind::Import { names } => {
                for alias in names {
                    self.check_import(&alias.node.name, location)?;
                }
            }
            StmtKind::ImportFrom { module, .. } => {
                let module = module.as_deref().unwrap_or("");
                self.check_import_from(module, location)?;
            }
            StmtKind::Assign { targets, value, .. } => {
                for target in targets {
                    if let ExprKind::Name { id, .. } = &target.node {
                        if self.config.protected_names.contains(id.as_str()) {
                            return Err(ValidationError::at(
                                location,
                                format!("assignment to protected name '{id}' is not allowed"),
                            ));
                        }
                    }
                    self.visit_expr(target)?;
                }
                self.visit_expr(value)?;
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.visit_expr(target)?;
                self.visit_expr(value)?;
            }
            StmtKind::AnnAssign {
                target,
                annotation,
                value,
                ..
            } => {
                self.visit_expr(target)?;
                self.visit_expr(annotation)?;
                if let Some(value) = value {
                    self.visit_expr(value)?;
                }
            }
            StmtKind::FunctionDef {
                body,
                decorator_list,
                ..
            }
            | StmtKind::AsyncFunctionDef {
                body,
                decorator_list,
                ..
            } => {
                for decorator in decorator_list {
                    self.visit_expr(decorator)?;
                }
                self.visit_body(body)?;
            }
            StmtKind::ClassDef {
                bases,
                keywords,
                body,
                decorator_list,
                ..
            } => {
                for base in bases {
                    self.visit_expr(base)?;
                }
                for keyword in keywords {
                    self.visit_expr(&keyword.node.value)?;
                }
                for decorator in decorator_list {
                    self.visit_expr(decorator)?;
                }
                self.visit_body(body)?;
            }
            StmtKind::Return { value } => {
                if let Some(value) = value {
                    self.visit_expr(value)?;
                }
            }
            StmtKind::Delete { targets } => {
                for target in targets {
                    self.visit_expr(target)?;
                }
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
                ..
            }
            | StmtKind::AsyncFor {
                target,
                iter,
                body,
                orelse,
                ..
            } => {
                self.visit_expr(target)?;
                self.visit_expr(iter)?;
                self.visit_body(body)?;
                self.visit_body(orelse)?;
            }
            StmtKind::While { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_body(body)?;
                self.visit_body(orelse)?;
            }
            StmtKind::If { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_body(body)?;
                self.visit_body(orelse)?;
            }
            StmtKind::With { items, body, .. } | StmtKind::AsyncWith { items, body, .. } => {
                for item in items {
                    self.visit_expr(&item.context_expr)?;
                    if let Some(vars) = &item.optional_vars {
                        self.visit_expr(vars)?;
                    }
                }
                self.visit_body(body)?;
            }
            StmtKind::Raise { exc, cause } => {
                if let Some(exc) = exc {
                    self.visit_expr(exc)?;
                }
                if let Some(cause) = cause {
                    self.visit_expr(cause)?;
                }
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                self.visit_body(body)?;
                for handler in handlers {
                    let ast::ExcepthandlerKind::ExceptHandler { type_, body, .. } = &handler.node;
                    if let Some(type_) = type_ {
                        self.visit_expr(type_)?;
                    }
                    self.visit_body(body)?;
                }
                self.visit_body(orelse)?;
                self.visit_body(finalbody)?;
            }
            StmtKind::Assert { test, msg } => {
                self.visit_expr(test)?;
                if let Some(msg) = msg {
                    self.visit_expr(msg)?;
                }
            }
            StmtKind::Expr { value } => {
                self.visit_expr(value)?;
            }
            _ => {}
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn visit_expr(&self, expr: &ast::Expr) -> Result<(), ValidationError> {
        let location = expr.location;
        match &expr.node {
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                if let ExprKind::Name { id, .. } = &func.node {
                    if self.config.blocked_builtins.contains(id.as_str()) {
                        return Err(ValidationError::at(
                            location,
                            format!("call to '{id}' is not allowed"),
                        ));
                    }
                }
                self.visit_expr(func)?;
                for arg in args {
                    self.visit_expr(arg)?;
                }
                for keyword in keywords {
                    self.visit_expr(&keyword.node.value)?;
                }
            }
            ExprKind::Attribute { value, attr, .. } => {
                if self.config.blocked_attrs.contains(attr.as_str()) {
                    return Err(ValidationError::at(
                        location,
                        format!("access to attribute '{attr}' is not allowed"),
                    ));
                }
                self.visit_expr(value)?;
            }
            ExprKind::BoolOp { values, .. } => {
                for value in values {
                    self.visit_expr(value)?;
                }
            }
            ExprKind::NamedExpr { target, value } => {
                self.visit_expr(target)?;
                self.visit_expr(value)?;
            }
            ExprKind::BinOp { left, right, .. } => {
                self.visit_expr(left)?;
                self.visit_expr(right)?;
            }
            ExprKind::UnaryOp { operand, .. } => {
                self.visit_expr(operand)?;
            }
            ExprKind::Lambda { body, .. } => {
                self.visit_expr(body)?;
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_expr(body)?;
                self.visit_expr(orelse)?;
            }
            ExprKind::Dict { values, .. } => {
                for value in values {
                    self.visit_expr(value)?;
                }
            }
            ExprKind::Set { elts }
            | ExprKind::List { elts, .. }
            | ExprKind::Tuple { elts, .. } => {
                for elt in elts {
                    self.visit_expr(elt)?;
                }
            }
            ExprKind::ListComp { elt, generators }
            | ExprKind::SetComp { elt, generators }
            | ExprKind::GeneratorExp { elt, generators } => {
                self.visit_expr(elt)?;
                self.visit_comprehensions(generators)?;
            }
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => {
                self.visit_expr(key)?;
                self.visit_expr(value)?;
                self.visit_comprehensions(generators)?;
            }
            ExprKind::Await { value }
            | ExprKind::YieldFrom { value }
            | ExprKind::Starred { value, .. } => {
                self.visit_expr(value)?;
            }
            ExprKind::Yield { value } => {
                if let Some(value) = value {
                    self.visit_expr(value)?;
                }
            }
            ExprKind::Compare {
                left, comparators, ..
            } => {
                self.visit_expr(left)?;
                for comparator in comparators {
                    self.visit_expr(comparator)?;
                }
            }
            ExprKind::Subscript { value, slice, .. } => {
                self.visit_expr(value)?;
                self.visit_expr(slice)?;
            }
            ExprKind::Slice { lower, upper, step } => {
                for bound in [lower, upper, step].into_iter().flatten() {
                    self.visit_expr(bound)?;
                }
            }
            ExprKind::JoinedStr { values } => {
                for value in values {
                    self.visit_expr(value)?;
                }
            }
            ExprKind::FormattedValue { value, .. } => {
                self.visit_expr(value)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn visit_comprehensions(
        &self,
        generators: &[ast::Comprehension],
    ) -> Result<(), ValidationError> {
        for generator in generators {
            self.visit_expr(&generator.target)?;
            self.visit_expr(&generator.iter)?;
            for if_clause in &generator.ifs {
                self.visit_expr(if_clause)?;
            }
        }
        Ok(())
    }

    fn check_import(
        &self,
        name: &str,
        location: ast::Location,
    ) -> Result<(), ValidationError> {
        let root = name.split('.').next().unwrap_or(name);
        if self.config.allowed_imports.contains(root) {
            Ok(())
        } else {
            Err(ValidationError::at(
                location,
                format!("import of '{name}' is not allowed"),
            ))
        }
    }

    fn check_import_from(
        &self,
        module: &str,
        location: ast::Location,
    ) -> Result<(), ValidationError> {
        let root = module.split('.').next().unwrap_or(module);
        if self.config.allowed_imports.contains(root) {
            Ok(())
        } else {
            Err(ValidationError::at(
                location,
                format!("import from '{module}' is not allowed"),
            ))
        }
    }
}
