//! The session manifest: expansion of declarations into runnable instances,
//! selection filters, and the ordered, mutable execution queue with
//! notify/requires edges.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::errors::{Error, Result};
use crate::keywords::KeywordExpr;
use crate::options::Options;
use crate::parametrize::{combine_layers, names_match, render_name, CallSpec, ParamValue};
use crate::registry::{Interpreters, SessionDecl};

/// One fully expanded, runnable unit.
#[derive(Debug)]
pub struct SessionInstance {
    /// Canonical name, e.g. `tests-3.12(django='2.0')`.
    pub name: String,
    /// The declaring session's name.
    pub base: String,
    /// Concrete interpreter spec, when one applies.
    pub python: Option<String>,
    /// True for sessions that run on the host without any environment.
    pub no_backend: bool,
    pub call_spec: CallSpec,
    pub tags: Vec<String>,
    pub decl: Arc<SessionDecl>,
    /// Interpreters that were declared but ignored because the backend is
    /// `none`; reported when the session actually runs.
    pub ignored_pythons: Vec<String>,
    /// Set when an empty parametrize set produced this placeholder; the
    /// session skips itself with this reason.
    pub placeholder_skip: Option<String>,
}

impl SessionInstance {
    /// Selector matching: the canonical name (quote-insensitive), the base
    /// name (which selects every expansion), or `base-python`.
    pub fn matches_pattern(&self, pattern: &str) -> bool {
        if names_match(&self.name, pattern) || pattern == self.base {
            return true;
        }
        if let Some(python) = &self.python {
            if pattern == format!("{}-{}", self.base, python) {
                return true;
            }
        }
        false
    }

    /// The keyword set `-k` expressions are evaluated against.
    pub fn keywords(&self) -> Vec<&str> {
        let mut keywords = vec![self.name.as_str(), self.base.as_str()];
        keywords.extend(self.tags.iter().map(String::as_str));
        keywords
    }

    pub fn description(&self) -> Option<&str> {
        self.decl.short_description()
    }
}

fn value_to_string(value: &ParamValue) -> String {
    match value {
        ParamValue::Str(s) => s.clone(),
        ParamValue::Int(i) => i.to_string(),
        ParamValue::Bool(b) => b.to_string(),
    }
}

/// Whether the session's effective backend is `none`, which disables the
/// interpreter axis.
fn backend_is_none(decl: &SessionDecl, options: &Options) -> bool {
    if let Some(forced) = &options.force_backend {
        return forced == "none";
    }
    if decl.backend.len() == 1 {
        return decl.backend[0] == "none";
    }
    decl.backend.is_empty() && options.default_backend.as_deref() == Some("none")
}

struct Axis {
    pythons: Vec<Option<String>>,
    suffix: bool,
    no_backend: bool,
    ignored: Vec<String>,
}

fn interpreter_axis(decl: &SessionDecl, options: &Options) -> Axis {
    let none_backend = backend_is_none(decl, options);

    if matches!(decl.python, Interpreters::Disabled) {
        return Axis {
            pythons: vec![None],
            suffix: false,
            no_backend: true,
            ignored: Vec::new(),
        };
    }

    if none_backend {
        let ignored = match &decl.python {
            Interpreters::List(list) => list.clone(),
            _ => Vec::new(),
        };
        return Axis {
            pythons: vec![None],
            suffix: false,
            no_backend: true,
            ignored,
        };
    }

    if let Some(forced) = &options.force_python {
        return Axis {
            pythons: vec![Some(forced.clone())],
            suffix: false,
            no_backend: false,
            ignored: Vec::new(),
        };
    }

    match &decl.python {
        Interpreters::Current => Axis {
            pythons: vec![None],
            suffix: false,
            no_backend: false,
            ignored: Vec::new(),
        },
        Interpreters::Single(spec) => {
            if options.extra_pythons.is_empty() {
                Axis {
                    pythons: vec![Some(spec.clone())],
                    suffix: false,
                    no_backend: false,
                    ignored: Vec::new(),
                }
            } else {
                let mut pythons = vec![Some(spec.clone())];
                pythons.extend(options.extra_pythons.iter().cloned().map(Some));
                Axis {
                    pythons,
                    suffix: true,
                    no_backend: false,
                    ignored: Vec::new(),
                }
            }
        }
        Interpreters::List(list) => {
            let mut pythons: Vec<Option<String>> = list.iter().cloned().map(Some).collect();
            pythons.extend(options.extra_pythons.iter().cloned().map(Some));
            Axis {
                pythons,
                suffix: true,
                no_backend: false,
                ignored: Vec::new(),
            }
        }
        Interpreters::Disabled => unreachable!("handled above"),
    }
}

/// Expand declarations into instances: interpreter axis first, then the
/// parameter matrix, with the `python` parameter lifted onto the interpreter
/// axis when present.
pub fn expand(decls: Vec<SessionDecl>, options: &Options) -> Vec<Arc<SessionInstance>> {
    let mut instances: Vec<Arc<SessionInstance>> = Vec::new();
    let mut seen_names: HashSet<String> = HashSet::new();

    for decl in decls {
        let decl = Arc::new(decl);
        let axis = interpreter_axis(&decl, options);

        let bundles = match combine_layers(&decl.parametrize) {
            Some(bundles) => bundles,
            None => {
                // An exhausted parameter matrix still lists the session, as
                // a placeholder that skips itself.
                instances.push(Arc::new(SessionInstance {
                    name: decl.name.clone(),
                    base: decl.name.clone(),
                    python: None,
                    no_backend: true,
                    call_spec: CallSpec::new(),
                    tags: decl.tags.clone(),
                    decl: Arc::clone(&decl),
                    ignored_pythons: Vec::new(),
                    placeholder_skip: Some("no parameters available".to_string()),
                }));
                continue;
            }
        };

        for python in &axis.pythons {
            for bundle in &bundles {
                let mut python = python.clone();
                let mut call_spec = bundle.spec.clone();
                if let Some(value) = call_spec.shift_remove("python") {
                    python = Some(value_to_string(&value));
                }

                let suffix = axis.suffix.then(|| python.clone()).flatten();
                let name = render_name(&decl.name, suffix.as_deref(), bundle);
                if !seen_names.insert(name.clone()) {
                    // Deprecation window: colliding canonical names warn
                    // today and will become a hard error.
                    tracing::warn!("session name {name} is produced more than once");
                }

                let mut tags = decl.tags.clone();
                tags.extend(bundle.tags.iter().cloned());

                instances.push(Arc::new(SessionInstance {
                    name,
                    base: decl.name.clone(),
                    python,
                    no_backend: axis.no_backend,
                    call_spec,
                    tags,
                    decl: Arc::clone(&decl),
                    ignored_pythons: axis.ignored.clone(),
                    placeholder_skip: None,
                }));
            }
        }
    }

    instances
}

/// One queued run of an instance, optionally with notify-supplied posargs.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub instance: Arc<SessionInstance>,
    pub posargs: Option<Vec<String>>,
}

/// Ordered, mutable execution queue over the expanded instance set.
pub struct Manifest {
    all: Vec<Arc<SessionInstance>>,
    queue: VecDeque<QueueEntry>,
    consumed: Vec<Arc<SessionInstance>>,
}

impl Manifest {
    pub fn new(all: Vec<Arc<SessionInstance>>) -> Manifest {
        let queue = all
            .iter()
            .map(|instance| QueueEntry {
                instance: Arc::clone(instance),
                posargs: None,
            })
            .collect();
        Manifest {
            all,
            queue,
            consumed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// All instances, paired with whether they are currently selected.
    pub fn list_all(&self) -> Vec<(Arc<SessionInstance>, bool)> {
        self.all
            .iter()
            .map(|instance| {
                let selected = self
                    .queue
                    .iter()
                    .any(|entry| Arc::ptr_eq(&entry.instance, instance));
                (Arc::clone(instance), selected)
            })
            .collect()
    }

    /// Keep queue entries matching the given patterns, in pattern order.
    /// Explicitly repeated patterns repeat the run.
    pub fn filter_by_names(&mut self, patterns: &[String]) -> Result<()> {
        let mut queue = VecDeque::new();
        let mut missing = Vec::new();
        for pattern in patterns {
            let matched: Vec<QueueEntry> = self
                .all
                .iter()
                .filter(|instance| instance.matches_pattern(pattern))
                .map(|instance| QueueEntry {
                    instance: Arc::clone(instance),
                    posargs: None,
                })
                .collect();
            if matched.is_empty() {
                missing.push(pattern.clone());
            } else {
                queue.extend(matched);
            }
        }
        if !missing.is_empty() {
            return Err(Error::InvalidSession(missing.join(", ")));
        }
        self.queue = queue;
        Ok(())
    }

    pub fn filter_by_pythons(&mut self, pythons: &[String]) {
        self.queue.retain(|entry| {
            entry
                .instance
                .python
                .as_ref()
                .map(|python| pythons.contains(python))
                .unwrap_or(false)
        });
    }

    pub fn filter_by_keywords(&mut self, expression: &str) -> Result<()> {
        let expr = KeywordExpr::parse(expression)?;
        self.queue
            .retain(|entry| expr.matches(&entry.instance.keywords()));
        Ok(())
    }

    pub fn filter_by_tags(&mut self, tags: &[String]) {
        self.queue.retain(|entry| {
            entry
                .instance
                .tags
                .iter()
                .any(|tag| tags.contains(tag))
        });
    }

    /// The bare-invocation fallback: keep instances whose declaration is
    /// selected by default.
    pub fn keep_defaults(&mut self) {
        self.queue
            .retain(|entry| entry.instance.decl.default_selected);
    }

    /// Resolve a requires template against the expanded set; first match in
    /// declaration order wins.
    fn resolve_requirement(
        &self,
        instance: &SessionInstance,
        template: &str,
    ) -> Result<Arc<SessionInstance>> {
        let target = template.replace("{python}", instance.python.as_deref().unwrap_or(""));
        self.all
            .iter()
            .find(|candidate| candidate.matches_pattern(&target))
            .cloned()
            .ok_or_else(|| Error::RequiresMissing {
                session: instance.name.clone(),
                requirement: target,
            })
    }

    /// Verify the requires graph is a DAG. Unresolvable templates are
    /// ignored here; they surface as `requires-missing` during emission.
    fn check_cycles(&self) -> Result<()> {
        let mut graph: DiGraph<(), ()> = DiGraph::new();
        let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
        for instance in &self.all {
            let node = graph.add_node(());
            nodes.insert(instance.name.clone(), node);
        }
        for instance in &self.all {
            for template in &instance.decl.requires {
                if let Ok(required) = self.resolve_requirement(instance, template) {
                    graph.add_edge(nodes[&required.name], nodes[&instance.name], ());
                }
            }
        }
        if let Err(cycle) = toposort(&graph, None) {
            let name = self
                .all
                .iter()
                .zip(graph.node_indices())
                .find(|(_, node)| *node == cycle.node_id())
                .map(|(instance, _)| instance.name.clone())
                .unwrap_or_default();
            return Err(Error::RequiresCycle(name));
        }
        Ok(())
    }

    /// Rebuild the queue so that every entry's transitive requirements are
    /// queued before it. Explicitly selected duplicates stay; inserted
    /// requirements are deduplicated.
    pub fn schedule(&mut self) -> Result<()> {
        self.check_cycles()?;
        let selected: Vec<QueueEntry> = self.queue.drain(..).collect();
        let mut emitted: VecDeque<QueueEntry> = VecDeque::new();
        let mut emitted_names: HashSet<String> = HashSet::new();
        for entry in selected {
            self.push_requirements(&entry.instance, &mut emitted, &mut emitted_names)?;
            emitted_names.insert(entry.instance.name.clone());
            emitted.push_back(entry);
        }
        self.queue = emitted;
        Ok(())
    }

    fn push_requirements(
        &self,
        instance: &Arc<SessionInstance>,
        emitted: &mut VecDeque<QueueEntry>,
        emitted_names: &mut HashSet<String>,
    ) -> Result<()> {
        for template in &instance.decl.requires {
            let required = self.resolve_requirement(instance, template)?;
            if emitted_names.contains(&required.name) {
                continue;
            }
            self.push_requirements(&required, emitted, emitted_names)?;
            emitted_names.insert(required.name.clone());
            emitted.push_back(QueueEntry {
                instance: required,
                posargs: None,
            });
        }
        Ok(())
    }

    /// Enqueue another session at the back of the queue. A target that is
    /// already queued or has already run is a no-op.
    pub fn notify(&mut self, target: &str, posargs: Option<Vec<String>>) -> Result<bool> {
        let queued = self
            .queue
            .iter()
            .any(|entry| entry.instance.matches_pattern(target));
        let completed = self
            .consumed
            .iter()
            .any(|instance| instance.matches_pattern(target));
        if queued || completed {
            return Ok(false);
        }
        let instance = self
            .all
            .iter()
            .find(|instance| instance.matches_pattern(target))
            .cloned()
            .ok_or_else(|| Error::InvalidSession(target.to_string()))?;

        // The notified session's own requirements must still run first,
        // unless they already did.
        let mut emitted: VecDeque<QueueEntry> = VecDeque::new();
        let mut emitted_names: HashSet<String> = self
            .queue
            .iter()
            .map(|entry| entry.instance.name.clone())
            .chain(self.consumed.iter().map(|instance| instance.name.clone()))
            .collect();
        self.push_requirements(&instance, &mut emitted, &mut emitted_names)?;
        self.queue.extend(emitted);
        self.queue.push_back(QueueEntry { instance, posargs });
        Ok(true)
    }

    /// Pop the next entry, recording it as consumed.
    pub fn next_entry(&mut self) -> Option<QueueEntry> {
        let entry = self.queue.pop_front()?;
        self.consumed.push(Arc::clone(&entry.instance));
        Some(entry)
    }

    /// Drain the remaining queue, e.g. to mark entries aborted.
    pub fn drain_remaining(&mut self) -> Vec<QueueEntry> {
        self.queue.drain(..).collect()
    }
}
