use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value};

use crate::error::ExpressionError;
use crate::scope::Scope;

/// Resolves `{{ ... }}` expressions embedded in node configuration.
///
/// Resolution is pure: it only reads the [`Scope`] it is given.
pub struct ExpressionResolver {
  env: Environment<'static>,
}

impl Default for ExpressionResolver {
  fn default() -> Self {
    Self::new()
  }
}

impl ExpressionResolver {
  pub fn new() -> Self {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    Self { env }
  }

  /// Resolve every expression in `config` against `scope`.
  ///
  /// # Arguments
  /// * `node_id` - The ID of the node being resolved (for error messages)
  /// * `config` - The node's raw configuration
  /// * `scope` - Upstream outputs, variables and metadata
  pub fn resolve(
    &self,
    node_id: &str,
    config: &serde_json::Value,
    scope: &Scope,
  ) -> Result<serde_json::Value, ExpressionError> {
    let ctx = Value::from_serialize(scope);
    let mut path = String::new();
    self.resolve_value(node_id, config, &mut path, &ctx)
  }

  fn resolve_value(
    &self,
    node_id: &str,
    value: &serde_json::Value,
    path: &mut String,
    ctx: &Value,
  ) -> Result<serde_json::Value, ExpressionError> {
    match value {
      serde_json::Value::String(s) => self.resolve_string(node_id, s, path, ctx),
      serde_json::Value::Array(items) => {
        let mut resolved = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
          let len = path.len();
          path.push('/');
          path.push_str(&i.to_string());
          resolved.push(self.resolve_value(node_id, item, path, ctx)?);
          path.truncate(len);
        }
        Ok(serde_json::Value::Array(resolved))
      }
      serde_json::Value::Object(map) => {
        let mut resolved = serde_json::Map::with_capacity(map.len());
        for (key, item) in map {
          let len = path.len();
          path.push('/');
          path.push_str(&escape_pointer_token(key));
          resolved.insert(key.clone(), self.resolve_value(node_id, item, path, ctx)?);
          path.truncate(len);
        }
        Ok(serde_json::Value::Object(resolved))
      }
      other => Ok(other.clone()),
    }
  }

  fn resolve_string(
    &self,
    node_id: &str,
    template: &str,
    path: &str,
    ctx: &Value,
  ) -> Result<serde_json::Value, ExpressionError> {
    if !template.contains("{{") {
      return Ok(serde_json::Value::String(template.to_string()));
    }

    match single_expression(template) {
      Some(expr) => self.eval_expression(node_id, expr, path, ctx),
      None => self
        .env
        .render_str(template, ctx.clone())
        .map(serde_json::Value::String)
        .map_err(|e| map_error(node_id, path, template, e)),
    }
  }

  /// Evaluate a lone expression, keeping the JSON type of its result.
  fn eval_expression(
    &self,
    node_id: &str,
    expr: &str,
    path: &str,
    ctx: &Value,
  ) -> Result<serde_json::Value, ExpressionError> {
    let compiled = self
      .env
      .compile_expression(expr)
      .map_err(|e| map_error(node_id, path, expr, e))?;
    let value = compiled
      .eval(ctx.clone())
      .map_err(|e| map_error(node_id, path, expr, e))?;

    if value.is_undefined() {
      return Err(ExpressionError::UnresolvedReference {
        node_id: node_id.to_string(),
        path: path.to_string(),
        expression: expr.to_string(),
      });
    }

    serde_json::to_value(&value).map_err(|e| ExpressionError::InvalidExpression {
      node_id: node_id.to_string(),
      path: path.to_string(),
      message: format!("result is not representable as JSON: {}", e),
    })
  }
}

/// If `template` is exactly one `{{ ... }}` block, return its inner expression.
fn single_expression(template: &str) -> Option<&str> {
  let inner = template
    .trim()
    .strip_prefix("{{")?
    .strip_suffix("}}")?;
  if inner.contains("{{") || inner.contains("}}") {
    return None;
  }
  let inner = inner.strip_prefix('-').unwrap_or(inner);
  let inner = inner.strip_suffix('-').unwrap_or(inner);
  let inner = inner.trim();
  (!inner.is_empty()).then_some(inner)
}

fn escape_pointer_token(token: &str) -> String {
  token.replace('~', "~0").replace('/', "~1")
}

fn map_error(node_id: &str, path: &str, expression: &str, err: minijinja::Error) -> ExpressionError {
  match err.kind() {
    ErrorKind::UndefinedError => ExpressionError::UnresolvedReference {
      node_id: node_id.to_string(),
      path: path.to_string(),
      expression: expression.to_string(),
    },
    _ => ExpressionError::InvalidExpression {
      node_id: node_id.to_string(),
      path: path.to_string(),
      message: err.to_string(),
    },
  }
}
