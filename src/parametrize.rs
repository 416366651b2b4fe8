//! Parameter bundles and canonical-name rendering.
//!
//! A session may stack several parametrize layers; the layers compose by
//! Cartesian product in declaration order, and each resulting bundle renders
//! into the parenthesized tail of the instance's canonical name. Rendered
//! names can be parsed back so that selection can compare argument bundles
//! without being sensitive to quoting.

use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;

/// A single parameter value. Config values map onto these three shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(s) => write!(f, "'{s}'"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// An argument bundle, insertion-ordered.
pub type CallSpec = IndexMap<String, ParamValue>;

/// One expanded parameter combination: the call spec plus an optional custom
/// id and any tags contributed by the parameter values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamBundle {
    pub spec: CallSpec,
    pub id: Option<String>,
    pub tags: Vec<String>,
}

impl ParamBundle {
    pub fn is_empty(&self) -> bool {
        self.spec.is_empty() && self.id.is_none()
    }

    /// The display form used both for name tails and for stacked-id joining.
    pub fn display(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => render_args(&self.spec),
        }
    }

    fn merge(&self, later: &ParamBundle) -> ParamBundle {
        let mut spec = self.spec.clone();
        for (key, value) in &later.spec {
            spec.insert(key.clone(), value.clone());
        }
        let id = if self.id.is_none() && later.id.is_none() {
            None
        } else if self.spec.is_empty() && self.id.is_none() {
            later.id.clone()
        } else {
            Some(format!("{}, {}", self.display(), later.display()))
        };
        let mut tags = self.tags.clone();
        tags.extend(later.tags.iter().cloned());
        ParamBundle { spec, id, tags }
    }
}

/// One parametrize layer: the bundles produced by a single declaration.
#[derive(Debug, Clone, Default)]
pub struct ParamLayer {
    pub bundles: Vec<ParamBundle>,
}

/// Compose stacked layers by Cartesian product, declaration order preserved.
///
/// Returns `None` when some layer is empty, which the caller turns into a
/// skipping placeholder instance.
pub fn combine_layers(layers: &[ParamLayer]) -> Option<Vec<ParamBundle>> {
    if layers.is_empty() {
        return Some(vec![ParamBundle::default()]);
    }
    let mut combined = vec![ParamBundle::default()];
    for layer in layers {
        if layer.bundles.is_empty() {
            return None;
        }
        let mut next = Vec::with_capacity(combined.len() * layer.bundles.len());
        for bundle in &layer.bundles {
            for prior in &combined {
                next.push(prior.merge(bundle));
            }
        }
        combined = next;
    }
    Some(combined)
}

fn render_args(spec: &CallSpec) -> String {
    spec.iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render the canonical instance name: `base`, `base-3.12`,
/// `base(d='1')`, or `base-3.12(old)` for a custom id.
pub fn render_name(base: &str, python: Option<&str>, bundle: &ParamBundle) -> String {
    let mut name = base.to_string();
    if let Some(python) = python {
        name.push('-');
        name.push_str(python);
    }
    if !bundle.is_empty() {
        name.push('(');
        name.push_str(&bundle.display());
        name.push(')');
    }
    name
}

/// The parsed tail of a canonical name.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedArgs {
    /// `base(key='value', ...)` — compared as an unordered bundle.
    Spec(BTreeMap<String, ParamValue>),
    /// `base(some id)` — compared literally.
    Id(String),
}

/// Split a canonical name into its head and parsed argument tail.
pub fn parse_name(name: &str) -> (&str, Option<ParsedArgs>) {
    let Some(open) = name.find('(') else {
        return (name, None);
    };
    if !name.ends_with(')') {
        return (name, None);
    }
    let head = &name[..open];
    let tail = &name[open + 1..name.len() - 1];
    match parse_args(tail) {
        Some(spec) => (head, Some(ParsedArgs::Spec(spec))),
        None => (head, Some(ParsedArgs::Id(tail.to_string()))),
    }
}

/// Parse `key='value', key2=2` into a bundle; `None` when the tail is not a
/// key-value list (then it is a custom id).
fn parse_args(tail: &str) -> Option<BTreeMap<String, ParamValue>> {
    let mut spec = BTreeMap::new();
    for part in split_top_level(tail) {
        let (key, raw) = part.split_once('=')?;
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return None;
        }
        spec.insert(key.to_string(), parse_value(raw.trim())?);
    }
    if spec.is_empty() {
        None
    } else {
        Some(spec)
    }
}

fn parse_value(raw: &str) -> Option<ParamValue> {
    if raw.len() >= 2 {
        let bytes = raw.as_bytes();
        if (bytes[0] == b'\'' && bytes[raw.len() - 1] == b'\'')
            || (bytes[0] == b'"' && bytes[raw.len() - 1] == b'"')
        {
            return Some(ParamValue::Str(raw[1..raw.len() - 1].to_string()));
        }
    }
    match raw {
        "true" | "True" => return Some(ParamValue::Bool(true)),
        "false" | "False" => return Some(ParamValue::Bool(false)),
        _ => {}
    }
    raw.parse::<i64>().ok().map(ParamValue::Int)
}

fn split_top_level(tail: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quote: Option<char> = None;
    for (idx, ch) in tail.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                ',' => {
                    parts.push(tail[start..idx].trim());
                    start = idx + 1;
                }
                _ => {}
            },
        }
    }
    let last = tail[start..].trim();
    if !last.is_empty() {
        parts.push(last);
    }
    parts
}

/// Argument-bundle name equality: heads must match exactly; parenthesized
/// tails compare as parsed bundles, so quoting differences do not matter.
pub fn names_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (head_a, args_a) = parse_name(a);
    let (head_b, args_b) = parse_name(b);
    head_a == head_b && args_a.is_some() && args_a == args_b
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn bundle(pairs: &[(&str, ParamValue)]) -> ParamBundle {
        ParamBundle {
            spec: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            id: None,
            tags: Vec::new(),
        }
    }

    #[test]
    fn renders_python_suffix_and_args() {
        let b = bundle(&[("django", ParamValue::Str("2.0".into()))]);
        assert_eq!(render_name("lint", Some("3.12"), &b), "lint-3.12(django='2.0')");
        assert_eq!(render_name("lint", None, &ParamBundle::default()), "lint");
    }

    #[test]
    fn custom_id_replaces_rendered_args() {
        let mut b = bundle(&[("d", ParamValue::Str("1".into()))]);
        b.id = Some("old".into());
        assert_eq!(render_name("tests", None, &b), "tests(old)");
    }

    #[test]
    fn stacked_layers_compose_in_declaration_order() {
        let first = ParamLayer {
            bundles: vec![
                bundle(&[("a", ParamValue::Int(1))]),
                bundle(&[("a", ParamValue::Int(2))]),
            ],
        };
        let second = ParamLayer {
            bundles: vec![
                bundle(&[("b", ParamValue::Str("x".into()))]),
                bundle(&[("b", ParamValue::Str("y".into()))]),
            ],
        };
        let combined = combine_layers(&[first, second]).unwrap();
        let names: Vec<String> = combined
            .iter()
            .map(|b| render_name("t", None, b))
            .collect();
        assert_eq!(
            names,
            vec![
                "t(a=1, b='x')",
                "t(a=2, b='x')",
                "t(a=1, b='y')",
                "t(a=2, b='y')",
            ]
        );
    }

    #[test]
    fn stacked_ids_join_in_declaration_order() {
        let first = ParamLayer {
            bundles: vec![ParamBundle {
                spec: bundle(&[("a", ParamValue::Int(1))]).spec,
                id: Some("one".into()),
                tags: Vec::new(),
            }],
        };
        let second = ParamLayer {
            bundles: vec![ParamBundle {
                spec: bundle(&[("b", ParamValue::Int(2))]).spec,
                id: Some("two".into()),
                tags: Vec::new(),
            }],
        };
        let combined = combine_layers(&[first, second]).unwrap();
        assert_eq!(combined[0].display(), "one, two");
    }

    #[test]
    fn empty_layer_yields_no_bundles() {
        assert!(combine_layers(&[ParamLayer::default()]).is_none());
    }

    #[test]
    fn parses_rendered_name_back() {
        let (head, args) = parse_name("tests-3.12(django='2.0', count=3)");
        assert_eq!(head, "tests-3.12");
        let ParsedArgs::Spec(spec) = args.unwrap() else {
            panic!("expected a parsed spec");
        };
        assert_eq!(spec["django"], ParamValue::Str("2.0".into()));
        assert_eq!(spec["count"], ParamValue::Int(3));
    }

    #[test]
    fn quoting_is_irrelevant_for_equality() {
        assert!(names_match("tests(x='1')", "tests(x=\"1\")"));
        assert!(!names_match("tests(x='1')", "tests(x='2')"));
        assert!(!names_match("tests(x='1')", "other(x='1')"));
    }

    #[test]
    fn id_tails_compare_literally() {
        assert!(names_match("tests(old)", "tests(old)"));
        assert!(!names_match("tests(old)", "tests(new)"));
    }
}
