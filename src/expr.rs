//! Property expressions.
//!
//! A resource property is an [`Expr`]: a JSON-like value tree that may also
//! contain references to other resources (or to document variables, which the
//! graph builder substitutes away).
//!
//! # Reference syntax
//!
//! Three spellings are accepted when an expression is deserialized:
//!
//! - `{"Ref": "Bucket"}` refers to the provider-assigned id of `Bucket`
//! - `{"Fn::GetAtt": ["Bucket", "Arn"]}` (or `"Bucket.Arn"`) refers to an output attribute
//! - `"arn:${Bucket.Arn}/*"` interpolates references into a string; `$${` is a literal `${`
//!
//! A string that consists of exactly one placeholder becomes a plain
//! [`Expr::Ref`], so the referenced value keeps its JSON type.
//!
//! ```
//! use hemmer_engine::expr::{Expr, Reference};
//! use serde_json::json;
//!
//! let expr = Expr::from_json(json!({"Fn::GetAtt": ["Bucket", "Arn"]})).unwrap();
//! assert_eq!(expr, Expr::Ref(Reference::attribute("Bucket", "Arn")));
//! ```

use std::fmt;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Serialize;
use serde_json::{Map, Number, Value};

/// A pointer from a property to another resource (or variable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Reference {
    /// Identifier of the referenced resource or variable.
    pub target: String,
    /// Output attribute; `None` means the provider-assigned id.
    pub attribute: Option<String>,
}

impl Reference {
    /// Reference the external id of `target`.
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attribute: None,
        }
    }

    /// Reference output attribute `attribute` of `target`.
    pub fn attribute(target: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attribute: Some(attribute.into()),
        }
    }

    /// Parse `target` or `target.attribute`.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        match input.split_once('.') {
            Some((target, attribute)) if !target.is_empty() && !attribute.is_empty() => {
                Some(Self::attribute(target, attribute))
            },
            Some(_) => None,
            None if input.is_empty() => None,
            None => Some(Self::to(input)),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attribute {
            Some(attribute) => write!(f, "{}.{}", self.target, attribute),
            None => write!(f, "{}", self.target),
        }
    }
}

/// One piece of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text.
    Text(String),
    /// A reference rendered as text once resolved.
    Ref(Reference),
}

/// A property value that may contain references.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// JSON null.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number.
    Number(Number),
    /// A plain string.
    String(String),
    /// An ordered sequence.
    List(Vec<Expr>),
    /// A mapping in declaration order. Duplicate keys are kept so that
    /// validation can reject them.
    Map(Vec<(String, Expr)>),
    /// A reference whose resolved value replaces this node.
    Ref(Reference),
    /// A string with embedded references.
    Interpolate(Vec<Segment>),
}

impl Expr {
    /// Wrap a JSON value without interpreting reference syntax.
    pub fn literal(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::literal).collect()),
            Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::literal(v))).collect())
            },
        }
    }

    /// Convert a JSON value, interpreting `Ref`, `Fn::GetAtt`, `Fn::Sub` and
    /// `${...}` placeholders.
    pub fn from_json(value: Value) -> Result<Self, String> {
        Self::deserialize(value).map_err(|e| e.to_string())
    }

    /// A reference to the external id of `target`.
    pub fn reference(target: impl Into<String>) -> Self {
        Self::Ref(Reference::to(target))
    }

    /// A reference to an output attribute of `target`.
    pub fn get_attr(target: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::Ref(Reference::attribute(target, attribute))
    }

    /// All references in this expression, in traversal order.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Ref(r) => out.push(r),
            Self::Interpolate(segments) => {
                for segment in segments {
                    if let Segment::Ref(r) = segment {
                        out.push(r);
                    }
                }
            },
            Self::List(items) => items.iter().for_each(|i| i.collect_references(out)),
            Self::Map(entries) => entries.iter().for_each(|(_, v)| v.collect_references(out)),
            _ => {},
        }
    }

    /// Whether the expression is free of references.
    pub fn is_literal(&self) -> bool {
        self.references().is_empty()
    }

    /// Dotted path of the first repeated mapping key, if any.
    pub fn find_duplicate_key(&self, path: &str) -> Option<String> {
        match self {
            Self::Map(entries) => {
                let mut seen = std::collections::HashSet::new();
                for (key, value) in entries {
                    let key_path = join_path(path, key);
                    if !seen.insert(key.as_str()) {
                        return Some(key_path);
                    }
                    if let Some(dup) = value.find_duplicate_key(&key_path) {
                        return Some(dup);
                    }
                }
                None
            },
            Self::List(items) => items
                .iter()
                .enumerate()
                .find_map(|(i, item)| item.find_duplicate_key(&join_path(path, &i.to_string()))),
            _ => None,
        }
    }

    /// Rewrite every reference through `f`.
    ///
    /// Inside an interpolated string a replacement must be a literal or another
    /// reference; literals are rendered to text.
    pub fn map_references<E, F>(self, f: &mut F) -> Result<Expr, E>
    where
        F: FnMut(Reference) -> Result<Expr, E>,
    {
        Ok(match self {
            Self::Ref(r) => f(r)?,
            Self::Interpolate(segments) => {
                let mut out = Vec::with_capacity(segments.len());
                for segment in segments {
                    match segment {
                        Segment::Text(text) => out.push(Segment::Text(text)),
                        Segment::Ref(r) => match f(r)? {
                            Self::Ref(r) => out.push(Segment::Ref(r)),
                            other => match other.literal_value() {
                                Some(value) => out.push(Segment::Text(render_text(&value))),
                                None => out.push(Segment::Text(String::new())),
                            },
                        },
                    }
                }
                collapse_segments(out)
            },
            Self::List(items) => Self::List(
                items
                    .into_iter()
                    .map(|i| i.map_references(f))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| v.map_references(f).map(|v| (k, v)))
                    .collect::<Result<_, _>>()?,
            ),
            other => other,
        })
    }

    /// The JSON value of a reference-free expression.
    pub fn literal_value(&self) -> Option<Value> {
        let mut lookup = |_: &Reference| Err(());
        self.resolve(&mut lookup).ok()
    }

    /// Produce a JSON value, asking `lookup` for each reference.
    pub fn resolve<E, F>(&self, lookup: &mut F) -> Result<Value, E>
    where
        F: FnMut(&Reference) -> Result<Value, E>,
    {
        Ok(match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(
                items
                    .iter()
                    .map(|i| i.resolve(lookup))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.resolve(lookup)?);
                }
                Value::Object(map)
            },
            Self::Ref(r) => lookup(r)?,
            Self::Interpolate(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Ref(r) => out.push_str(&render_text(&lookup(r)?)),
                    }
                }
                Value::String(out)
            },
        })
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Self::literal(value)
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Resolve a property list into a JSON object.
pub fn resolve_properties<E, F>(properties: &[(String, Expr)], lookup: &mut F) -> Result<Value, E>
where
    F: FnMut(&Reference) -> Result<Value, E>,
{
    let mut map = Map::new();
    for (name, expr) in properties {
        map.insert(name.clone(), expr.resolve(lookup)?);
    }
    Ok(Value::Object(map))
}

/// Parse a string that may contain `${...}` placeholders.
pub fn parse_template(input: &str) -> Result<Expr, String> {
    if !input.contains("${") {
        return Ok(Expr::String(input.to_string()));
    }

    let mut segments = Vec::new();
    let mut text = String::new();
    let mut rest = input;

    while let Some(pos) = rest.find("${") {
        if pos > 0 && rest.as_bytes()[pos - 1] == b'$' {
            text.push_str(&rest[..pos - 1]);
            text.push_str("${");
            rest = &rest[pos + 2..];
            continue;
        }
        text.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in '{}'", input))?;
        let reference = Reference::parse(&after[..end])
            .ok_or_else(|| format!("invalid placeholder '${{{}}}'", &after[..end]))?;
        if !text.is_empty() {
            segments.push(Segment::Text(std::mem::take(&mut text)));
        }
        segments.push(Segment::Ref(reference));
        rest = &after[end + 1..];
    }
    text.push_str(rest);
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }

    Ok(collapse_segments(segments))
}

fn collapse_segments(segments: Vec<Segment>) -> Expr {
    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for segment in segments {
        match (merged.last_mut(), segment) {
            (Some(Segment::Text(prev)), Segment::Text(text)) => prev.push_str(&text),
            (_, segment) => merged.push(segment),
        }
    }

    match merged.as_slice() {
        [] => Expr::String(String::new()),
        [Segment::Text(text)] => Expr::String(text.clone()),
        [Segment::Ref(r)] => Expr::Ref(r.clone()),
        _ => Expr::Interpolate(merged),
    }
}

/// Text form of a value inside an interpolated string.
pub(crate) fn render_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", base, name)
    }
}

fn interpret_map(mut entries: Vec<(String, Expr)>) -> Result<Expr, String> {
    if entries.len() != 1 || !matches!(entries[0].0.as_str(), "Ref" | "Fn::GetAtt" | "Fn::Sub") {
        return Ok(Expr::Map(entries));
    }
    let (key, value) = entries.remove(0);
    match (key.as_str(), value) {
        ("Ref", Expr::String(target)) => Ok(Expr::reference(target)),
        ("Ref", _) => Err("Ref expects a resource identifier".to_string()),
        ("Fn::GetAtt", Expr::String(path)) => Reference::parse(&path)
            .filter(|r| r.attribute.is_some())
            .map(Expr::Ref)
            .ok_or_else(|| format!("Fn::GetAtt expects 'id.attribute', got '{}'", path)),
        ("Fn::GetAtt", Expr::List(items)) => match items.as_slice() {
            [Expr::String(target), Expr::String(attribute)] => {
                Ok(Expr::get_attr(target.clone(), attribute.clone()))
            },
            _ => Err("Fn::GetAtt expects [id, attribute]".to_string()),
        },
        ("Fn::GetAtt", _) => Err("Fn::GetAtt expects [id, attribute]".to_string()),
        (_, value @ (Expr::String(_) | Expr::Ref(_) | Expr::Interpolate(_))) => Ok(value),
        _ => Err("Fn::Sub expects a string".to_string()),
    }
}

struct ExprVisitor;

impl<'de> Visitor<'de> for ExprVisitor {
    type Value = Expr;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Expr, E> {
        Ok(Expr::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Expr, E> {
        Ok(Expr::Number(v.into()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Expr, E> {
        Ok(Expr::Number(v.into()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Expr, E> {
        Number::from_f64(v)
            .map(Expr::Number)
            .ok_or_else(|| E::custom("non-finite number"))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Expr, E> {
        parse_template(v).map_err(E::custom)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Expr, E> {
        Ok(Expr::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Expr, E> {
        Ok(Expr::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Expr, D::Error> {
        Expr::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Expr, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element::<Expr>()? {
            items.push(item);
        }
        Ok(Expr::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Expr, A::Error> {
        let mut entries = Vec::new();
        while let Some((key, value)) = access.next_entry::<String, Expr>()? {
            entries.push((key, value));
        }
        interpret_map(entries).map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ExprVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reference_parse() {
        assert_eq!(Reference::parse("Bucket"), Some(Reference::to("Bucket")));
        assert_eq!(
            Reference::parse(" Bucket.Arn "),
            Some(Reference::attribute("Bucket", "Arn"))
        );
        assert_eq!(Reference::parse(""), None);
        assert_eq!(Reference::parse(".Arn"), None);
        assert_eq!(Reference::parse("Bucket."), None);
    }

    #[test]
    fn test_parse_template() {
        assert_eq!(parse_template("plain").unwrap(), Expr::String("plain".into()));
        assert_eq!(
            parse_template("${Bucket}").unwrap(),
            Expr::Ref(Reference::to("Bucket"))
        );
        assert_eq!(
            parse_template("arn:${Bucket.Arn}/*").unwrap(),
            Expr::Interpolate(vec![
                Segment::Text("arn:".into()),
                Segment::Ref(Reference::attribute("Bucket", "Arn")),
                Segment::Text("/*".into()),
            ])
        );
        assert_eq!(
            parse_template("cost: $${literal}").unwrap(),
            Expr::String("cost: ${literal}".into())
        );
        assert!(parse_template("broken ${Bucket").is_err());
        assert!(parse_template("empty ${}").is_err());
    }

    #[test]
    fn test_from_json_intrinsics() {
        let expr = Expr::from_json(json!({"Ref": "Role"})).unwrap();
        assert_eq!(expr, Expr::reference("Role"));

        let expr = Expr::from_json(json!({"Fn::GetAtt": "Role.Arn"})).unwrap();
        assert_eq!(expr, Expr::get_attr("Role", "Arn"));

        let expr = Expr::from_json(json!({"Fn::Sub": "${Api}.execute-api"})).unwrap();
        assert_eq!(expr.references(), vec![&Reference::to("Api")]);

        assert!(Expr::from_json(json!({"Fn::GetAtt": 3})).is_err());
        assert!(Expr::from_json(json!({"Ref": ["a"]})).is_err());

        // A two-key map is just a map, even if one key is "Ref".
        let expr = Expr::from_json(json!({"Ref": "x", "Other": 1})).unwrap();
        assert!(matches!(expr, Expr::Map(_)));
    }

    #[test]
    fn test_deserialize_keeps_duplicate_keys() {
        let input = r#"{"DefaultCacheBehavior": {"a": 1}, "DefaultCacheBehavior": {"b": 2}}"#;
        let expr: Expr = serde_json::from_str(input).unwrap();
        match &expr {
            Expr::Map(entries) => assert_eq!(entries.len(), 2),
            other => panic!("expected map, got {:?}", other),
        }
        assert_eq!(
            expr.find_duplicate_key("DistributionConfig"),
            Some("DistributionConfig.DefaultCacheBehavior".to_string())
        );
    }

    #[test]
    fn test_resolve() {
        let expr = Expr::from_json(json!({
            "name": "site",
            "origin": "${Bucket.DomainName}",
            "policy": "arn:${Bucket.Arn}/*",
            "port": 443,
            "tags": ["a", {"Ref": "Bucket"}]
        }))
        .unwrap();

        let mut lookup = |r: &Reference| -> Result<Value, String> {
            match (r.target.as_str(), r.attribute.as_deref()) {
                ("Bucket", None) => Ok(json!("bucket-1")),
                ("Bucket", Some("DomainName")) => Ok(json!("bucket-1.s3.amazonaws.com")),
                ("Bucket", Some("Arn")) => Ok(json!("arn:aws:s3:::bucket-1")),
                _ => Err(format!("unknown {}", r)),
            }
        };

        let value = expr.resolve(&mut lookup).unwrap();
        assert_eq!(
            value,
            json!({
                "name": "site",
                "origin": "bucket-1.s3.amazonaws.com",
                "policy": "arn:arn:aws:s3:::bucket-1/*",
                "port": 443,
                "tags": ["a", "bucket-1"]
            })
        );
    }

    #[test]
    fn test_map_references_renders_literals_into_text() {
        let expr = parse_template("${env}-${Bucket}").unwrap();
        let rewritten = expr
            .map_references(&mut |r: Reference| -> Result<Expr, ()> {
                if r.target == "env" {
                    Ok(Expr::String("prod".into()))
                } else {
                    Ok(Expr::Ref(r))
                }
            })
            .unwrap();
        assert_eq!(
            rewritten,
            Expr::Interpolate(vec![
                Segment::Text("prod-".into()),
                Segment::Ref(Reference::to("Bucket")),
            ])
        );

        let all_literal = parse_template("${env}-x")
            .unwrap()
            .map_references(&mut |_| -> Result<Expr, ()> { Ok(Expr::literal(json!(3))) })
            .unwrap();
        assert_eq!(all_literal, Expr::String("3-x".into()));
    }

    #[test]
    fn test_literal_value() {
        let expr = Expr::literal(json!({"a": [1, true, null]}));
        assert!(expr.is_literal());
        assert_eq!(expr.literal_value(), Some(json!({"a": [1, true, null]})));
        assert_eq!(Expr::reference("x").literal_value(), None);
    }
}
