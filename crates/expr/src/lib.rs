// SPDX-License-Identifier: Apache-2.0

//! Attribute expression engine.
//!
//! Configuration values (attribute mappings, constraints, query variables)
//! are template strings in one of three shapes:
//!
//! 1. *Literal*: no template marker; used verbatim. In a mapping this is the
//!    name of a remote attribute.
//! 2. *Single expression*: exactly one `{{ ... }}` with nothing around it.
//!    Evaluates to a native value (int, float, bool, list, map, string, ...).
//! 3. *Mixed template*: several expressions and/or surrounding raw text.
//!    Renders to a string which is then narrowed to the native value it
//!    spells, when it spells one.
//!
//! Classification happens at compile time together with free-variable
//! extraction, so that the set of remote attributes a mapping reads can be
//! derived before anything is fetched. Statements (`{% ... %}`) are never
//! allowed: mappings and constraints are expressions, not programs.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;

mod error;
mod native;
mod template;

pub use error::Error;
pub use template::{CompileOpts, ExprKind, Expression};

use native::{coerce_native, narrow_value};
use template::{Classified, classify, reject_statement};

/// Named values a template is rendered against.
pub type EvalContext = serde_json::Map<String, Value>;

/// A configuration value whose strings have been compiled to expressions.
///
/// Query `vars` blocks are arbitrarily nested maps and lists; every string
/// in them may be a template. Non-string scalars pass through untouched.
#[derive(Debug, Clone)]
pub enum TplValue {
    /// A compiled string value.
    Tpl(Expression),
    /// A map whose values are compiled recursively.
    Map(IndexMap<String, TplValue>),
    /// A list whose items are compiled recursively.
    List(Vec<TplValue>),
    /// A non-string scalar, kept as-is.
    Raw(Value),
}

/// The expression engine: template environment plus filter registry.
///
/// The environment is configured once at startup and immutable afterwards;
/// reloading a datamodel builds a fresh engine.
#[derive(Debug)]
pub struct Engine {
    env: Environment<'static>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates an engine with strict undefined-variable handling.
    #[must_use]
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }

    /// Mutable access to the underlying environment, used at startup to
    /// register additional filters before the engine is put to work.
    pub fn environment_mut(&mut self) -> &mut Environment<'static> {
        &mut self.env
    }

    /// Compiles a source string into an [`Expression`].
    ///
    /// `context` prefixes every error message with the configuration path the
    /// value comes from.
    pub fn compile(
        &self,
        source: &str,
        context: &str,
        opts: CompileOpts,
    ) -> Result<Expression, Error> {
        match classify(source) {
            Classified::Empty => Err(Error::BadMapping {
                context: context.to_string(),
            }),
            Classified::Statement => Err(reject_statement(source, context, opts)),
            Classified::Literal => {
                let mut vars = BTreeSet::new();
                let _ = vars.insert(source.to_string());
                Ok(Expression::new(
                    ExprKind::Literal,
                    source.to_string(),
                    vars,
                ))
            }
            Classified::Single { inner } => {
                let vars = self.parse_vars(source, context)?;
                self.check_var_count(source, context, opts, &vars)?;
                // Validate the expression itself, not just the template.
                let scratch = Environment::new();
                let _ = scratch.compile_expression(inner).map_err(|e| Error::Syntax {
                    context: context.to_string(),
                    template: source.to_string(),
                    details: e.to_string(),
                })?;
                Ok(Expression::new(
                    ExprKind::Expression,
                    source.to_string(),
                    vars,
                ))
            }
            Classified::Mixed => {
                if opts.one_template {
                    return Err(Error::MixedTemplate {
                        context: context.to_string(),
                        template: source.to_string(),
                    });
                }
                let vars = self.parse_vars(source, context)?;
                self.check_var_count(source, context, opts, &vars)?;
                Ok(Expression::new(
                    ExprKind::Template,
                    source.to_string(),
                    vars,
                ))
            }
        }
    }

    /// Recursively compiles every string in a JSON-shaped configuration
    /// value.
    ///
    /// Variables referenced anywhere in the tree are accumulated into
    /// `flat_vars`, minus the names in `exclude` (the reserved context
    /// names, which are provided by the engine rather than read from rows).
    pub fn compile_value(
        &self,
        value: &Value,
        context: &str,
        opts: CompileOpts,
        flat_vars: &mut BTreeSet<String>,
        exclude: &BTreeSet<String>,
    ) -> Result<TplValue, Error> {
        match value {
            Value::String(s) => {
                let expr = self.compile(s, context, opts)?;
                flat_vars.extend(
                    expr.variables()
                        .iter()
                        .filter(|v| !exclude.contains(*v))
                        .cloned(),
                );
                Ok(TplValue::Tpl(expr))
            }
            Value::Object(map) => {
                let mut out = IndexMap::with_capacity(map.len());
                for (k, v) in map {
                    let _ = out.insert(
                        k.clone(),
                        self.compile_value(v, context, opts, flat_vars, exclude)?,
                    );
                }
                Ok(TplValue::Map(out))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for v in items {
                    out.push(self.compile_value(v, context, opts, flat_vars, exclude)?);
                }
                Ok(TplValue::List(out))
            }
            other => Ok(TplValue::Raw(other.clone())),
        }
    }

    /// Evaluates an expression against a context, returning a native value.
    ///
    /// Literals evaluate to themselves. Single expressions evaluate natively;
    /// string results are narrowed. Mixed templates render to a string and
    /// are narrowed the same way.
    pub fn eval(&self, expr: &Expression, context: &EvalContext) -> Result<Value, Error> {
        let ctx = minijinja::value::Value::from_serialize(context);
        match expr.kind() {
            ExprKind::Literal => Ok(Value::String(expr.source().to_string())),
            ExprKind::Expression => {
                let compiled = self
                    .env
                    .compile_expression_owned(expr.inner().to_string())
                    .map_err(|e| self.render_error(expr, e))?;
                let result = compiled.eval(ctx).map_err(|e| self.render_error(expr, e))?;
                if result.is_undefined() {
                    return Err(Error::UndefinedVar {
                        context: String::new(),
                        template: expr.source().to_string(),
                        details: "expression evaluated to undefined".to_string(),
                    });
                }
                let value = serde_json::to_value(&result).map_err(|e| Error::Render {
                    context: String::new(),
                    template: expr.source().to_string(),
                    details: e.to_string(),
                })?;
                Ok(narrow_value(value))
            }
            ExprKind::Template => {
                let rendered = self
                    .env
                    .render_str(expr.source(), ctx)
                    .map_err(|e| self.render_error(expr, e))?;
                Ok(coerce_native(&rendered))
            }
        }
    }

    /// Renders an expression to a string (queries, display templates).
    pub fn render_string(&self, expr: &Expression, context: &EvalContext) -> Result<String, Error> {
        match expr.kind() {
            ExprKind::Literal => Ok(expr.source().to_string()),
            _ => match self.eval(expr, context)? {
                Value::String(s) => Ok(s),
                other => Ok(other.to_string()),
            },
        }
    }

    /// Renders a compiled configuration value back into a JSON-shaped value.
    pub fn render_value(&self, value: &TplValue, context: &EvalContext) -> Result<Value, Error> {
        match value {
            TplValue::Tpl(expr) => self.eval(expr, context),
            TplValue::Map(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    let _ = out.insert(k.clone(), self.render_value(v, context)?);
                }
                Ok(Value::Object(out))
            }
            TplValue::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for v in items {
                    out.push(self.render_value(v, context)?);
                }
                Ok(Value::Array(out))
            }
            TplValue::Raw(v) => Ok(v.clone()),
        }
    }

    /// Evaluates a boolean constraint expression.
    ///
    /// The result is interpreted the way conditionals interpret values:
    /// `false`, `null`, `0`, empty strings and empty collections are falsy.
    pub fn eval_bool(&self, expr: &Expression, context: &EvalContext) -> Result<bool, Error> {
        Ok(truthy(&self.eval(expr, context)?))
    }

    fn parse_vars(&self, source: &str, context: &str) -> Result<BTreeSet<String>, Error> {
        // A scratch environment is enough for parsing: filters are resolved
        // at render time, not parse time.
        let scratch = Environment::new();
        let tpl = scratch
            .template_from_str(source)
            .map_err(|e| Error::Syntax {
                context: context.to_string(),
                template: source.to_string(),
                details: e.to_string(),
            })?;
        Ok(tpl.undeclared_variables(false).into_iter().collect())
    }

    fn check_var_count(
        &self,
        source: &str,
        context: &str,
        opts: CompileOpts,
        vars: &BTreeSet<String>,
    ) -> Result<(), Error> {
        if opts.one_var && vars.len() > 1 {
            return Err(Error::TooManyVars {
                context: context.to_string(),
                template: source.to_string(),
                count: vars.len(),
            });
        }
        Ok(())
    }

    fn render_error(&self, expr: &Expression, e: minijinja::Error) -> Error {
        if e.kind() == minijinja::ErrorKind::UndefinedError {
            Error::UndefinedVar {
                context: String::new(),
                template: expr.source().to_string(),
                details: e.to_string(),
            }
        } else {
            Error::Render {
                context: String::new(),
                template: expr.source().to_string(),
                details: e.to_string(),
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, Value)]) -> EvalContext {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn compile(engine: &Engine, source: &str) -> Expression {
        engine
            .compile(source, "test", CompileOpts::default())
            .unwrap()
    }

    #[test]
    fn native_type_conversion() {
        let engine = Engine::new();
        let cases: Vec<(&str, Value)> = vec![
            ("{{ 'azerty' }}", json!("azerty")),
            ("{{ 1234 }}", json!(1234)),
            ("{{ 1234.5678 }}", json!(1234.5678)),
            // A complex-number literal must stay a string.
            ("{{ '1595014243J' }}", json!("1595014243J")),
            ("{{ [1, 2] }}", json!([1, 2])),
            ("{{ {'a': 1, 'b': 'x'} }}", json!({"a": 1, "b": "x"})),
            ("{{ true }}", json!(true)),
        ];
        for (source, expected) in cases {
            let expr = compile(&engine, source);
            let got = engine.eval(&expr, &EvalContext::new()).unwrap();
            assert_eq!(got, expected, "source {source:?}");
        }
    }

    #[test]
    fn literal_passthrough() {
        let engine = Engine::new();
        let expr = compile(&engine, "login");
        assert_eq!(expr.kind(), ExprKind::Literal);
        assert_eq!(expr.as_literal(), Some("login"));
        assert_eq!(
            expr.variables().iter().collect::<Vec<_>>(),
            vec!["login"]
        );
        // A literal renders to itself regardless of context.
        let got = engine.eval(&expr, &ctx(&[("login", json!("x"))])).unwrap();
        assert_eq!(got, json!("login"));
    }

    #[test]
    fn flat_vars_accumulation() {
        let engine = Engine::new();
        let vars = json!({
            "1": "{{ VAR1 }}",
            "2": "{{ VAR2 | lower }}",
            "3+4": "{{ VAR3 ~ '+' ~ VAR4 }}",
        });
        let mut flat = BTreeSet::new();
        let _ = engine
            .compile_value(
                &vars,
                "test",
                CompileOpts::default(),
                &mut flat,
                &BTreeSet::new(),
            )
            .unwrap();
        let expected: BTreeSet<String> = ["VAR1", "VAR2", "VAR3", "VAR4"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(flat, expected);
    }

    #[test]
    fn excluded_vars_are_not_collected() {
        let engine = Engine::new();
        let mut flat = BTreeSet::new();
        let exclude: BTreeSet<String> = ["ITEM_CACHED_VALUES".to_string()].into_iter().collect();
        let _ = engine
            .compile_value(
                &json!("{{ ITEM_CACHED_VALUES.login | default(login) }}"),
                "test",
                CompileOpts::default(),
                &mut flat,
                &exclude,
            )
            .unwrap();
        assert_eq!(flat.iter().collect::<Vec<_>>(), vec!["login"]);
    }

    #[test]
    fn too_many_vars_rejected() {
        let engine = Engine::new();
        let err = engine
            .compile(
                "{{ VAR3 ~ '+' ~ VAR4 }}",
                "test",
                CompileOpts {
                    one_template: false,
                    one_var: true,
                },
            )
            .unwrap_err();
        match err {
            Error::TooManyVars { count, .. } => assert_eq!(count, 2),
            other => panic!("expected TooManyVars, got {other:?}"),
        }
    }

    #[test]
    fn render_query_vars() {
        let engine = Engine::new();
        let vars = json!({
            "1": "{{ VAR1 }}",
            "2": "{{ VAR2 | lower }}",
            "3+4": "{{ VAR3 ~ '+' ~ VAR4 }}",
            "[5, 6]": "{{ [VAR5, VAR6] }}",
            "[7, 8]": ["{{ VAR7 }}", "{{ VAR8 }}"],
            "none": null,
        });
        let mut flat = BTreeSet::new();
        let compiled = engine
            .compile_value(
                &vars,
                "test",
                CompileOpts::default(),
                &mut flat,
                &BTreeSet::new(),
            )
            .unwrap();
        let context = ctx(&[
            ("VAR1", json!("VaLuE_1")),
            ("VAR2", json!("VaLuE_2")),
            ("VAR3", json!("VaLuE_3")),
            ("VAR4", json!("VaLuE_4")),
            ("VAR5", json!("VaLuE_5")),
            ("VAR6", json!("VaLuE_6")),
            ("VAR7", json!("VaLuE_7")),
            ("VAR8", json!("VaLuE_8")),
        ]);
        let rendered = engine.render_value(&compiled, &context).unwrap();
        assert_eq!(
            rendered,
            json!({
                "1": "VaLuE_1",
                "2": "value_2",
                "3+4": "VaLuE_3+VaLuE_4",
                "[5, 6]": ["VaLuE_5", "VaLuE_6"],
                "[7, 8]": ["VaLuE_7", "VaLuE_8"],
                "none": null,
            })
        );
    }

    #[test]
    fn statements_are_rejected() {
        let engine = Engine::new();
        let err = engine
            .compile(
                "{% for c in VAR1 %}{{ c }}{% endfor %}",
                "test",
                CompileOpts::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotAnExpression { .. }), "{err:?}");
    }

    #[test]
    fn empty_values_are_rejected() {
        let engine = Engine::new();
        for source in ["", "{# comment #}"] {
            let err = engine
                .compile(source, "test", CompileOpts::default())
                .unwrap_err();
            assert!(matches!(err, Error::BadMapping { .. }), "{source:?}");
        }
    }

    #[test]
    fn mixed_template_rejected_in_mappings() {
        let engine = Engine::new();
        let err = engine
            .compile(
                "{{ VAR1 | upper }} Hello {{ VAR2 }}",
                "test",
                CompileOpts {
                    one_template: true,
                    one_var: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::MixedTemplate { .. }), "{err:?}");

        // A template glued to raw text is just as ambiguous.
        let err = engine
            .compile(
                "{{ CN | lower }} is the CN",
                "test",
                CompileOpts {
                    one_template: true,
                    one_var: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::MixedTemplate { .. }), "{err:?}");
    }

    #[test]
    fn mixed_template_renders_outside_mappings() {
        let engine = Engine::new();
        let expr = compile(&engine, "{{ VAR1 | upper }} Hello {{ VAR2 }}");
        assert_eq!(expr.kind(), ExprKind::Template);
        let got = engine
            .eval(
                &expr,
                &ctx(&[("VAR1", json!("VaLuE_1")), ("VAR2", json!("VaLuE_2"))]),
            )
            .unwrap();
        assert_eq!(got, json!("VALUE_1 Hello VaLuE_2"));
    }

    #[test]
    fn undefined_variable_is_reported() {
        let engine = Engine::new();
        let expr = compile(&engine, "{{ MISSING }}");
        let err = engine.eval(&expr, &EvalContext::new()).unwrap_err();
        assert!(err.is_undefined(), "{err:?}");
    }

    #[test]
    fn single_var_identity() {
        let engine = Engine::new();
        let expr = compile(&engine, "{{ V }}");
        for value in [json!(42), json!("text"), json!([1, 2]), json!(true)] {
            let got = engine.eval(&expr, &ctx(&[("V", value.clone())])).unwrap();
            assert_eq!(got, value);
        }
    }
}
