//! Rules: what to match and which requests to issue for a match.
//!
//! The executors only see the [`Rule`] trait. [`ConfigRule`] is the
//! implementation built from a [`RuleSpec`] found in configuration or in a
//! dynamic registration message.

use crate::error::{Error, Result};
use crate::http::HttpError;
use crate::template::{RequestTemplate, RequestTemplateSpec};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

pub trait Rule: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Logical topic the rule consumes, without datacenter prefix.
    fn topic(&self) -> &str;

    /// Per-rule override of the executor worker count.
    fn concurrency(&self) -> Option<usize>;

    fn retry_policy(&self) -> RetryPolicy;

    /// Index of the first matching option, `None` when nothing matches.
    fn test(&self, event: &Value) -> Result<Option<usize>>;

    /// Bindings captured while matching `event` against `option`.
    fn expand(&self, option: usize, event: &Value) -> Result<Value>;

    /// Request templates of `option`, in execution order.
    fn exec(&self, option: usize) -> &[RequestTemplate];

    fn should_retry(&self, error: &HttpError) -> bool;

    fn should_ignore_error(&self, error: &HttpError) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub retry_limit: i64,
    pub retry_delay: Duration,
    pub retry_factor: f64,
}

impl RetryPolicy {
    /// `retry_delay * retry_factor ^ (retry_limit - retries_left)`.
    pub fn delay_for(&self, retries_left: i64) -> Duration {
        let attempt = (self.retry_limit - retries_left).max(0);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.retry_delay.as_millis() as f64 * self.retry_factor.powi(exponent);
        if millis.is_finite() && millis >= 0.0 {
            Duration::from_millis(millis as u64)
        } else {
            Duration::MAX
        }
    }
}

/// A single value or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item),
            OneOrMany::Many(items) => items,
        }
    }
}

/// `{ status = ["5xx", 429] }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusFilter {
    #[serde(default)]
    pub status: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseSpec {
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_spec: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_not: Option<Value>,
    pub exec: OneOrMany<RequestTemplateSpec>,
}

/// Rule configuration. Two specs are the same rule iff they are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: i64,
    /// Milliseconds before the first retry.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default = "default_retry_factor")]
    pub retry_factor: f64,
    #[serde(default = "default_retry_on")]
    pub retry_on: StatusFilter,
    #[serde(default = "default_ignore")]
    pub ignore: StatusFilter,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_spec: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_not: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<OneOrMany<RequestTemplateSpec>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cases: Vec<CaseSpec>,
}

fn default_retry_limit() -> i64 {
    2
}
fn default_retry_delay() -> u64 {
    500
}
fn default_retry_factor() -> f64 {
    6.0
}
fn default_retry_on() -> StatusFilter {
    StatusFilter {
        status: vec![Value::String("5xx".to_string())],
    }
}
fn default_ignore() -> StatusFilter {
    StatusFilter {
        status: vec![Value::from(412)],
    }
}

impl RuleSpec {
    /// A rule without anything to execute is never subscribed.
    pub fn is_noop(&self) -> bool {
        self.cases.is_empty() && self.exec.as_ref().map_or(true, |e| e.as_slice().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusPattern {
    Exact(u16),
    Class(u16),
}

impl StatusPattern {
    fn parse(rule: &str, value: &Value) -> Result<Self> {
        let invalid = || Error::invalid_rule(rule, format!("invalid status pattern {value}"));
        match value {
            Value::Number(n) => n
                .as_u64()
                .and_then(|n| u16::try_from(n).ok())
                .map(StatusPattern::Exact)
                .ok_or_else(invalid),
            Value::String(s) => {
                let s = s.trim().to_ascii_lowercase();
                if let Some(class) = s.strip_suffix("xx") {
                    class.parse().map(StatusPattern::Class).map_err(|_| invalid())
                } else {
                    s.parse().map(StatusPattern::Exact).map_err(|_| invalid())
                }
            }
            _ => Err(invalid()),
        }
    }

    fn matches(&self, status: u16) -> bool {
        match self {
            StatusPattern::Exact(code) => *code == status,
            StatusPattern::Class(class) => status / 100 == *class,
        }
    }
}

/// Compiled match predicate.
#[derive(Debug, Clone)]
enum Matcher {
    Object(Vec<(String, Matcher)>),
    Regex(Regex),
    Exact(Value),
}

impl Matcher {
    fn compile(rule: &str, pattern: &Value) -> Result<Self> {
        Ok(match pattern {
            Value::Object(fields) => Matcher::Object(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Matcher::compile(rule, v)?)))
                    .collect::<Result<_>>()?,
            ),
            Value::String(s) if s.len() > 2 && s.starts_with('/') && s.ends_with('/') => {
                let regex = Regex::new(&s[1..s.len() - 1])
                    .map_err(|e| Error::invalid_rule(rule, format!("bad regex {s}: {e}")))?;
                Matcher::Regex(regex)
            }
            other => Matcher::Exact(other.clone()),
        })
    }

    /// Named regex groups land in `bindings`, nested under the field path.
    fn matches(&self, value: Option<&Value>, bindings: &mut Map<String, Value>) -> bool {
        match self {
            Matcher::Object(fields) => {
                let Some(Value::Object(obj)) = value else {
                    return false;
                };
                fields.iter().all(|(key, matcher)| {
                    let mut nested = match bindings.get(key) {
                        Some(Value::Object(existing)) => existing.clone(),
                        _ => Map::new(),
                    };
                    let ok = matcher.matches(obj.get(key), &mut nested);
                    if ok && !nested.is_empty() {
                        bindings.insert(key.clone(), Value::Object(nested));
                    }
                    ok
                })
            }
            Matcher::Regex(regex) => match value {
                Some(Value::String(s)) => capture(regex, s, bindings),
                Some(Value::Array(items)) => items.iter().any(|item| match item {
                    Value::String(s) => capture(regex, s, bindings),
                    _ => false,
                }),
                _ => false,
            },
            Matcher::Exact(expected) => match value {
                Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
                Some(actual) => actual == expected,
                None => false,
            },
        }
    }
}

fn capture(regex: &Regex, haystack: &str, bindings: &mut Map<String, Value>) -> bool {
    let Some(caps) = regex.captures(haystack) else {
        return false;
    };
    for name in regex.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            bindings.insert(name.to_string(), Value::String(m.as_str().to_string()));
        }
    }
    true
}

#[derive(Debug, Clone)]
struct RuleOption {
    matcher: Option<Matcher>,
    not_matcher: Option<Matcher>,
    exec: Vec<RequestTemplate>,
}

impl RuleOption {
    fn compile(
        rule: &str,
        match_spec: Option<&Value>,
        match_not: Option<&Value>,
        exec: &[RequestTemplateSpec],
    ) -> Result<Self> {
        let exec = exec
            .iter()
            .map(|t| {
                RequestTemplate::compile(t).map_err(|e| Error::invalid_rule(rule, e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            matcher: match_spec.map(|m| Matcher::compile(rule, m)).transpose()?,
            not_matcher: match_not.map(|m| Matcher::compile(rule, m)).transpose()?,
            exec,
        })
    }

    fn evaluate(&self, event: &Value) -> Option<Map<String, Value>> {
        let mut bindings = Map::new();
        if let Some(matcher) = &self.matcher {
            if !matcher.matches(Some(event), &mut bindings) {
                return None;
            }
        }
        if let Some(not_matcher) = &self.not_matcher {
            if not_matcher.matches(Some(event), &mut Map::new()) {
                return None;
            }
        }
        Some(bindings)
    }
}

/// A rule compiled from its `RuleSpec`: regexes and templates are built once here.
#[derive(Debug, Clone)]
pub struct ConfigRule {
    name: String,
    spec: RuleSpec,
    options: Vec<RuleOption>,
    retry_on: Vec<StatusPattern>,
    ignore: Vec<StatusPattern>,
}

impl ConfigRule {
    pub fn new(name: &str, spec: RuleSpec) -> Result<Self> {
        if spec.topic.trim().is_empty() {
            return Err(Error::invalid_rule(name, "topic must not be empty"));
        }
        if spec.retry_factor < 0.0 || !spec.retry_factor.is_finite() {
            return Err(Error::invalid_rule(name, "retry_factor must be a positive number"));
        }
        if spec.concurrency == Some(0) {
            return Err(Error::invalid_rule(name, "concurrency must be at least 1"));
        }
        if spec.exec.is_some() && !spec.cases.is_empty() {
            return Err(Error::invalid_rule(name, "use either exec or cases, not both"));
        }

        let options = if spec.cases.is_empty() {
            let exec = spec.exec.as_ref().map(OneOrMany::as_slice).unwrap_or_default();
            vec![RuleOption::compile(
                name,
                spec.match_spec.as_ref(),
                spec.match_not.as_ref(),
                exec,
            )?]
        } else {
            spec.cases
                .iter()
                .map(|case| {
                    RuleOption::compile(
                        name,
                        case.match_spec.as_ref(),
                        case.match_not.as_ref(),
                        case.exec.as_slice(),
                    )
                })
                .collect::<Result<_>>()?
        };

        let patterns = |filter: &StatusFilter| {
            filter
                .status
                .iter()
                .map(|v| StatusPattern::parse(name, v))
                .collect::<Result<Vec<_>>>()
        };

        Ok(Self {
            name: name.to_string(),
            retry_on: patterns(&spec.retry_on)?,
            ignore: patterns(&spec.ignore)?,
            spec,
            options,
        })
    }

    pub fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    pub fn is_noop(&self) -> bool {
        self.spec.is_noop()
    }
}

impl Rule for ConfigRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn topic(&self) -> &str {
        &self.spec.topic
    }

    fn concurrency(&self) -> Option<usize> {
        self.spec.concurrency
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_limit: self.spec.retry_limit,
            retry_delay: Duration::from_millis(self.spec.retry_delay),
            retry_factor: self.spec.retry_factor,
        }
    }

    fn test(&self, event: &Value) -> Result<Option<usize>> {
        Ok(self
            .options
            .iter()
            .position(|option| option.evaluate(event).is_some()))
    }

    fn expand(&self, option: usize, event: &Value) -> Result<Value> {
        let rule_option = self.options.get(option).ok_or_else(|| {
            Error::invalid_rule(&self.name, format!("no option with index {option}"))
        })?;
        rule_option
            .evaluate(event)
            .map(Value::Object)
            .ok_or_else(|| {
                Error::invalid_rule(&self.name, format!("option {option} does not match event"))
            })
    }

    fn exec(&self, option: usize) -> &[RequestTemplate] {
        self.options
            .get(option)
            .map(|o| o.exec.as_slice())
            .unwrap_or_default()
    }

    fn should_retry(&self, error: &HttpError) -> bool {
        self.retry_on.iter().any(|p| p.matches(error.status))
    }

    fn should_ignore_error(&self, error: &HttpError) -> bool {
        self.ignore.iter().any(|p| p.matches(error.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use serde_json::json;

    fn spec(value: Value) -> RuleSpec {
        serde_json::from_value(value).unwrap()
    }

    fn http_error(status: u16) -> HttpError {
        HttpError::from_response(HttpResponse::new(status))
    }

    #[test]
    fn test_spec_defaults() {
        let s = spec(json!({
            "topic": "simple_test_rule",
            "exec": { "uri": "http://mock.com/" }
        }));
        assert_eq!(s.retry_limit, 2);
        assert_eq!(s.retry_delay, 500);
        assert_eq!(s.retry_factor, 6.0);
        assert!(!s.is_noop());

        let rule = ConfigRule::new("simple", s).unwrap();
        assert!(rule.should_retry(&http_error(500)));
        assert!(rule.should_retry(&http_error(503)));
        assert!(!rule.should_retry(&http_error(404)));
        assert!(rule.should_ignore_error(&http_error(412)));
        assert!(!rule.should_ignore_error(&http_error(500)));
    }

    #[test]
    fn test_noop_rule() {
        let s = spec(json!({ "topic": "t", "match": { "meta": { "uri": "x" } } }));
        assert!(s.is_noop());
        assert!(ConfigRule::new("noop", s).unwrap().is_noop());
    }

    #[test]
    fn test_match_with_regex_bindings() {
        let rule = ConfigRule::new(
            "summary",
            spec(json!({
                "topic": "resource_change",
                "match": {
                    "meta": { "uri": "/^https:\\/\\/[^\\/]+\\/api\\/rest_v1\\/page\\/html\\/(?<title>[^\\/]+)$/" },
                    "tags": "restbase"
                },
                "exec": { "method": "get", "uri": "https://{{message.meta.domain}}/api/rest_v1/page/summary/{{match.meta.uri.title}}" }
            })),
        )
        .unwrap();

        let event = json!({
            "meta": {
                "topic": "resource_change",
                "uri": "https://en.wikipedia.org/api/rest_v1/page/html/Main_Page",
                "domain": "en.wikipedia.org"
            },
            "tags": ["restbase"]
        });
        assert_eq!(rule.test(&event).unwrap(), Some(0));
        let bindings = rule.expand(0, &event).unwrap();
        assert_eq!(bindings, json!({ "meta": { "uri": { "title": "Main_Page" } } }));

        let ctx = json!({ "message": event, "match": bindings });
        let request = rule.exec(0)[0].expand(&ctx).unwrap();
        assert_eq!(
            request.uri,
            "https://en.wikipedia.org/api/rest_v1/page/summary/Main_Page"
        );

        let revision = json!({
            "meta": {
                "topic": "resource_change",
                "uri": "https://en.wikipedia.org/api/rest_v1/page/html/Main_Page/12345",
                "domain": "en.wikipedia.org"
            },
            "tags": ["restbase"]
        });
        assert_eq!(rule.test(&revision).unwrap(), None);

        let wrong_tag = json!({
            "meta": { "topic": "resource_change", "uri": "https://en.wikipedia.org/api/rest_v1/page/html/Main_Page" },
            "tags": ["purge"]
        });
        assert_eq!(rule.test(&wrong_tag).unwrap(), None);
    }

    #[test]
    fn test_match_not_excludes() {
        let rule = ConfigRule::new(
            "r",
            spec(json!({
                "topic": "t",
                "match": { "meta": { "domain": "/wikipedia.org$/" } },
                "match_not": { "meta": { "domain": "test.wikipedia.org" } },
                "exec": { "uri": "http://mock.com/" }
            })),
        )
        .unwrap();
        assert_eq!(
            rule.test(&json!({ "meta": { "domain": "en.wikipedia.org" } })).unwrap(),
            Some(0)
        );
        assert_eq!(
            rule.test(&json!({ "meta": { "domain": "test.wikipedia.org" } })).unwrap(),
            None
        );
    }

    #[test]
    fn test_cases_pick_first_matching_option() {
        let rule = ConfigRule::new(
            "cases",
            spec(json!({
                "topic": "t",
                "cases": [
                    { "match": { "kind": "a" }, "exec": { "uri": "http://a/" } },
                    { "match": { "kind": "/^b/" }, "exec": [ { "uri": "http://b1/" }, { "uri": "http://b2/" } ] }
                ]
            })),
        )
        .unwrap();
        assert_eq!(rule.test(&json!({ "kind": "a" })).unwrap(), Some(0));
        assert_eq!(rule.test(&json!({ "kind": "bee" })).unwrap(), Some(1));
        assert_eq!(rule.test(&json!({ "kind": "c" })).unwrap(), None);
        assert_eq!(rule.exec(1).len(), 2);
        assert!(rule.exec(7).is_empty());
    }

    #[test]
    fn test_invalid_specs_rejected() {
        assert!(ConfigRule::new("r", spec(json!({ "topic": "", "exec": { "uri": "u" } }))).is_err());
        assert!(ConfigRule::new(
            "r",
            spec(json!({ "topic": "t", "match": { "a": "/(/" }, "exec": { "uri": "u" } }))
        )
        .is_err());
        assert!(ConfigRule::new(
            "r",
            spec(json!({ "topic": "t", "retry_on": { "status": ["boom"] }, "exec": { "uri": "u" } }))
        )
        .is_err());
        assert!(ConfigRule::new(
            "r",
            spec(json!({ "topic": "t", "exec": { "uri": "{{nope.x}}" } }))
        )
        .is_err());
    }

    #[test]
    fn test_retry_delay_grows_geometrically() {
        let policy = RetryPolicy {
            retry_limit: 3,
            retry_delay: Duration::from_millis(100),
            retry_factor: 2.0,
        };
        assert_eq!(policy.delay_for(3), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(400));
        // A budget larger than the limit never shrinks the delay below the base.
        assert_eq!(policy.delay_for(5), Duration::from_millis(100));
    }

    #[test]
    fn test_structural_equality() {
        let a = spec(json!({ "topic": "t", "exec": { "uri": "http://a/" } }));
        let b = spec(json!({ "topic": "t", "exec": { "uri": "http://a/" } }));
        let c = spec(json!({ "topic": "t", "exec": { "uri": "http://c/" } }));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
