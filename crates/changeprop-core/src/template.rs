use crate::error::{Error, Result};
use crate::http::HttpRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Roots a placeholder may refer to: the triggering event and the
/// bindings captured while matching it.
const ROOTS: [&str; 2] = ["message", "match"];

/// Request template as written in rule configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTemplateSpec {
    #[serde(default = "default_method")]
    pub method: String,
    pub uri: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "get".to_string()
}

#[derive(Debug, Clone)]
enum Piece {
    Literal(String),
    Placeholder(Vec<String>),
}

/// A string with `{{path}}` placeholders, split into pieces once.
#[derive(Debug, Clone)]
pub struct TemplateString {
    pieces: Vec<Piece>,
}

impl TemplateString {
    pub fn parse(source: &str) -> Result<Self> {
        let mut pieces = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                pieces.push(Piece::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| Error::Template(format!("unterminated placeholder in '{source}'")))?;
            let path: Vec<String> = after[..end]
                .trim()
                .split('.')
                .map(|s| s.trim().to_string())
                .collect();
            if path.iter().any(String::is_empty) || !ROOTS.contains(&path[0].as_str()) {
                return Err(Error::Template(format!(
                    "invalid placeholder '{}' in '{source}'",
                    after[..end].trim()
                )));
            }
            pieces.push(Piece::Placeholder(path));
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            pieces.push(Piece::Literal(rest.to_string()));
        }

        Ok(Self { pieces })
    }

    pub fn render(&self, ctx: &Value) -> Result<String> {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Literal(s) => out.push_str(s),
                Piece::Placeholder(path) => match lookup(ctx, path)? {
                    Value::String(s) => out.push_str(s),
                    Value::Null => {}
                    other => out.push_str(&other.to_string()),
                },
            }
        }
        Ok(out)
    }

    /// Like `render`, but a lone placeholder keeps the JSON type of the
    /// bound value.
    pub fn render_value(&self, ctx: &Value) -> Result<Value> {
        match self.pieces.as_slice() {
            [Piece::Placeholder(path)] => Ok(lookup(ctx, path)?.clone()),
            _ => self.render(ctx).map(Value::String),
        }
    }
}

fn lookup<'a>(ctx: &'a Value, path: &[String]) -> Result<&'a Value> {
    let mut current = ctx;
    for segment in path {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| {
            Error::Template(format!("unresolved placeholder '{}'", path.join(".")))
        })?;
    }
    Ok(current)
}

#[derive(Debug, Clone)]
enum TemplateValue {
    String(TemplateString),
    Array(Vec<TemplateValue>),
    Object(Vec<(String, TemplateValue)>),
    Literal(Value),
}

impl TemplateValue {
    fn compile(value: &Value) -> Result<Self> {
        Ok(match value {
            Value::String(s) => TemplateValue::String(TemplateString::parse(s)?),
            Value::Array(items) => TemplateValue::Array(
                items.iter().map(TemplateValue::compile).collect::<Result<_>>()?,
            ),
            Value::Object(map) => TemplateValue::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), TemplateValue::compile(v)?)))
                    .collect::<Result<_>>()?,
            ),
            other => TemplateValue::Literal(other.clone()),
        })
    }

    fn render(&self, ctx: &Value) -> Result<Value> {
        Ok(match self {
            TemplateValue::String(t) => t.render_value(ctx)?,
            TemplateValue::Array(items) => Value::Array(
                items.iter().map(|i| i.render(ctx)).collect::<Result<_>>()?,
            ),
            TemplateValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.render(ctx)?)))
                    .collect::<Result<_>>()?,
            ),
            TemplateValue::Literal(v) => v.clone(),
        })
    }
}

/// A compiled request template. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    method: String,
    uri: TemplateString,
    headers: Vec<(String, TemplateString)>,
    query: Vec<(String, TemplateString)>,
    body: Option<TemplateValue>,
}

impl RequestTemplate {
    pub fn compile(spec: &RequestTemplateSpec) -> Result<Self> {
        let compile_map = |map: &BTreeMap<String, String>| {
            map.iter()
                .map(|(k, v)| Ok((k.clone(), TemplateString::parse(v)?)))
                .collect::<Result<Vec<_>>>()
        };
        Ok(Self {
            method: spec.method.to_uppercase(),
            uri: TemplateString::parse(&spec.uri)?,
            headers: compile_map(&spec.headers)?,
            query: compile_map(&spec.query)?,
            body: spec.body.as_ref().map(TemplateValue::compile).transpose()?,
        })
    }

    /// Expands the template against `{ message, match }`.
    pub fn expand(&self, ctx: &Value) -> Result<HttpRequest> {
        let mut request = HttpRequest::new(&self.method, &self.uri.render(ctx)?);
        for (name, value) in &self.headers {
            request.set_header(name, value.render(ctx)?);
        }
        for (name, value) in &self.query {
            request.query.insert(name.clone(), value.render(ctx)?);
        }
        request.body = self.body.as_ref().map(|b| b.render(ctx)).transpose()?;
        Ok(request)
    }
}
