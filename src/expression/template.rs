use super::{ExpressionResolver, ResolutionContext};
use crate::errors::ExpressionError;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static EXPRESSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<\+([^>]+)>").expect("expression pattern is a valid static regex")
});

/// Default resolver for `<+path>` templates.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateResolver;

impl TemplateResolver {
    pub fn new() -> Self {
        Self
    }

    fn lookup(&self, ctx: &ResolutionContext, expression: &str) -> Result<Value, ExpressionError> {
        let expression = expression.trim();
        let unresolved = |reason: &str| ExpressionError::Unresolved {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };
        let parts: Vec<&str> = expression.split('.').collect();

        match parts.as_slice() {
            ["setup", key] => ctx
                .setup_value(key)
                .map(|v| Value::String(v.to_string()))
                .ok_or_else(|| unresolved("no such setup value")),
            ["plan", "executionId"] => Ok(Value::String(ctx.plan_execution_id.clone())),
            ["self", "attempt"] => Ok(Value::from(ctx.attempt)),
            ["node", node_id, "status"] => ctx
                .node(node_id)
                .map(|n| Value::String(n.status.to_string()))
                .ok_or_else(|| unresolved("node has not run")),
            ["node", node_id, "outcome", name, path @ ..] => {
                let node = ctx.node(node_id).ok_or_else(|| unresolved("node has not run"))?;
                let mut value = node
                    .outcomes
                    .iter()
                    .rev()
                    .find(|o| o.name == *name)
                    .map(|o| &o.value)
                    .ok_or_else(|| unresolved("no such outcome"))?;
                for segment in path {
                    value = match value {
                        Value::Object(map) => map.get(*segment),
                        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                        _ => None,
                    }
                    .ok_or_else(|| unresolved("no such field in outcome"))?;
                }
                Ok(value.clone())
            }
            _ => Err(ExpressionError::Unknown {
                expression: expression.to_string(),
            }),
        }
    }

    fn resolve_str(&self, ctx: &ResolutionContext, input: &str) -> Result<Value, ExpressionError> {
        let matches: Vec<_> = EXPRESSION_REGEX.captures_iter(input).collect();
        if matches.is_empty() {
            return Ok(Value::String(input.to_string()));
        }

        if let [only] = matches.as_slice() {
            let span = only.get(0).map(|m| (m.start(), m.end()));
            if span == Some((0, input.len())) {
                return self.lookup(ctx, &only[1]);
            }
        }

        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in &matches {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&input[last..whole.start()]);
            match self.lookup(ctx, &caps[1])? {
                Value::String(s) => out.push_str(&s),
                other => out.push_str(&other.to_string()),
            }
            last = whole.end();
        }
        out.push_str(&input[last..]);
        Ok(Value::String(out))
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(quote).and_then(|r| r.strip_suffix(quote)) {
            return inner;
        }
    }
    s
}

impl ExpressionResolver for TemplateResolver {
    fn resolve(&self, ctx: &ResolutionContext, value: &Value) -> Result<Value, ExpressionError> {
        match value {
            Value::String(s) => self.resolve_str(ctx, s),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(ctx, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve(ctx, v)?)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    fn evaluate_condition(
        &self,
        ctx: &ResolutionContext,
        condition: &str,
    ) -> Result<bool, ExpressionError> {
        let text = match self.resolve_str(ctx, condition)? {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let text = text.trim();

        if let Some((lhs, rhs)) = text.split_once("==") {
            return Ok(unquote(lhs) == unquote(rhs));
        }
        if let Some((lhs, rhs)) = text.split_once("!=") {
            return Ok(unquote(lhs) != unquote(rhs));
        }
        match text.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" | "" | "0" | "null" => Ok(false),
            _ => Err(ExpressionError::InvalidCondition {
                condition: condition.to_string(),
            }),
        }
    }
}
