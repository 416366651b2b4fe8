//! Session declarations and the registration API.
//!
//! Declarations are collected during configuration evaluation into an
//! evaluation-scoped registry, then snapshotted. The builder mirrors the
//! decorator surface of the configuration file: one call per attribute,
//! stacked parametrize layers recorded in declaration order, and a body
//! supplied last.

use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::options::ReuseMode;
use crate::parametrize::ParamLayer;
use crate::sessions::SessionBody;

/// The interpreter axis of a declaration.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Interpreters {
    /// No interpreter given: run with the current (outer) interpreter.
    #[default]
    Current,
    /// `python = false` / `"none"`: no backend at all, run on the host.
    Disabled,
    /// A single interpreter spec; does not suffix the session name.
    Single(String),
    /// An ordered list; each entry produces a `-<python>` suffixed copy.
    List(Vec<String>),
}

/// Immutable session declaration captured from the configuration.
#[derive(Clone)]
pub struct SessionDecl {
    pub name: String,
    pub python: Interpreters,
    pub reuse: Option<ReuseMode>,
    /// Backend preference chain; empty means "use the configured default".
    pub backend: Vec<String>,
    /// Opaque extra arguments handed to the backend's create command.
    pub venv_params: Vec<String>,
    pub tags: Vec<String>,
    pub default_selected: bool,
    /// Session-name templates; `{python}` is substituted at expansion time.
    pub requires: Vec<String>,
    pub description: Option<String>,
    pub parametrize: Vec<ParamLayer>,
    pub body: Arc<dyn SessionBody>,
}

impl std::fmt::Debug for SessionDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDecl")
            .field("name", &self.name)
            .field("python", &self.python)
            .field("tags", &self.tags)
            .field("default_selected", &self.default_selected)
            .field("requires", &self.requires)
            .finish_non_exhaustive()
    }
}

impl SessionDecl {
    /// A parametrize layer may target the literal parameter `python`, in
    /// which case its values become the interpreter axis. Combining that
    /// with a declared interpreter list is rejected.
    pub fn validate(&self) -> Result<()> {
        let parametrizes_python = self
            .parametrize
            .iter()
            .flat_map(|layer| layer.bundles.iter())
            .any(|bundle| bundle.spec.contains_key("python"));
        if parametrizes_python && !matches!(self.python, Interpreters::Current) {
            return Err(Error::InvalidSession(format!(
                "session {} parametrizes 'python' and also declares interpreters",
                self.name
            )));
        }
        Ok(())
    }

    /// First line of the description, as shown in listings.
    pub fn short_description(&self) -> Option<&str> {
        self.description
            .as_deref()
            .and_then(|d| d.lines().next())
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }
}

/// Evaluation-scoped collection of declarations, in declaration order.
#[derive(Debug, Default)]
pub struct Registry {
    decls: Vec<SessionDecl>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Start a declaration. The builder registers on `body(..)`.
    pub fn session(&mut self, name: &str) -> SessionBuilder<'_> {
        SessionBuilder {
            registry: self,
            name: name.to_string(),
            python: Interpreters::Current,
            reuse: None,
            backend: Vec::new(),
            venv_params: Vec::new(),
            tags: Vec::new(),
            default_selected: true,
            requires: Vec::new(),
            description: None,
            parametrize: Vec::new(),
        }
    }

    pub fn register(&mut self, decl: SessionDecl) -> Result<()> {
        decl.validate()?;
        if self.decls.iter().any(|d| d.name == decl.name) {
            // Duplicate declaration names warn for now; this becomes a hard
            // error after the deprecation window.
            tracing::warn!("session {} is declared more than once", decl.name);
        }
        self.decls.push(decl);
        Ok(())
    }

    /// Snapshot the registered declarations and clear the registry.
    pub fn snapshot(&mut self) -> Vec<SessionDecl> {
        std::mem::take(&mut self.decls)
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }
}

pub struct SessionBuilder<'r> {
    registry: &'r mut Registry,
    name: String,
    python: Interpreters,
    reuse: Option<ReuseMode>,
    backend: Vec<String>,
    venv_params: Vec<String>,
    tags: Vec<String>,
    default_selected: bool,
    requires: Vec<String>,
    description: Option<String>,
    parametrize: Vec<ParamLayer>,
}

impl SessionBuilder<'_> {
    pub fn python(mut self, python: Interpreters) -> Self {
        self.python = python;
        self
    }

    pub fn reuse(mut self, mode: ReuseMode) -> Self {
        self.reuse = Some(mode);
        self
    }

    pub fn backend<I, S>(mut self, chain: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backend = chain.into_iter().map(Into::into).collect();
        self
    }

    pub fn venv_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.venv_params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn default_selected(mut self, default: bool) -> Self {
        self.default_selected = default;
        self
    }

    pub fn requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Stack one parametrize layer. Layers compose in call order.
    pub fn parametrize(mut self, layer: ParamLayer) -> Self {
        self.parametrize.push(layer);
        self
    }

    /// Supply the session function and register the declaration.
    pub fn body(self, body: Arc<dyn SessionBody>) -> Result<()> {
        let decl = SessionDecl {
            name: self.name,
            python: self.python,
            reuse: self.reuse,
            backend: self.backend,
            venv_params: self.venv_params,
            tags: self.tags,
            default_selected: self.default_selected,
            requires: self.requires,
            description: self.description,
            parametrize: self.parametrize,
            body,
        };
        self.registry.register(decl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parametrize::{ParamBundle, ParamValue};
    use crate::sessions::noop_body;

    fn python_layer() -> ParamLayer {
        let mut spec = indexmap::IndexMap::new();
        spec.insert("python".to_string(), ParamValue::Str("3.12".into()));
        ParamLayer {
            bundles: vec![ParamBundle {
                spec,
                id: None,
                tags: Vec::new(),
            }],
        }
    }

    #[test]
    fn registers_in_declaration_order() {
        let mut registry = Registry::new();
        registry.session("b").body(noop_body()).unwrap();
        registry.session("a").body(noop_body()).unwrap();
        let decls = registry.snapshot();
        let names: Vec<&str> = decls.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn python_parametrize_conflicts_with_interpreter_list() {
        let mut registry = Registry::new();
        let result = registry
            .session("t")
            .python(Interpreters::List(vec!["3.12".into()]))
            .parametrize(python_layer())
            .body(noop_body());
        assert!(matches!(result, Err(Error::InvalidSession(_))));
    }

    #[test]
    fn python_parametrize_alone_is_accepted() {
        let mut registry = Registry::new();
        registry
            .session("t")
            .parametrize(python_layer())
            .body(noop_body())
            .unwrap();
        assert_eq!(registry.snapshot().len(), 1);
    }
}
