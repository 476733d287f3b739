//! Executes diagram scripts without handing them to a real interpreter.
//!
//! A script only ever sees three host objects: the `graphviz` module, the
//! `st` display surface and its `session_state` store. Graph objects are
//! built into [`crate::ir::Graph`] values and rendered natively; the only
//! filesystem effect is `render`/`save` writing plain file names inside the
//! output directory.

mod syntax;

use crate::config::{Config, ScriptLimits};
use crate::dot::to_source;
use crate::extract::DiagramScript;
use crate::ir::{Attrs, Graph, GraphKind};
use crate::render::{ImageFormat, RenderError, render_graph};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use syntax::{Expr, Import, MAX_NESTING, Stmt, StmtKind, Target, parse_program};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("line {line}: syntax error: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: unsupported: {what}")]
    Unsupported { line: usize, what: String },
    #[error("line {line}: name '{name}' is not defined")]
    UndefinedName { line: usize, name: String },
    #[error("line {line}: {message}")]
    Type { line: usize, message: String },
    #[error("line {line}: import of '{module}' is not allowed")]
    ForbiddenImport { line: usize, module: String },
    #[error("line {line}: refusing to write outside the output directory: {path}")]
    ForbiddenPath { line: usize, path: String },
    #[error("statement budget of {0} exceeded")]
    StatementBudget(usize),
    #[error("loop iteration budget of {0} exceeded")]
    LoopBudget(usize),
    #[error("node budget of {0} exceeded")]
    NodeBudget(usize),
    #[error("line {line}: value size budget of {limit} exceeded")]
    ValueBudget { line: usize, limit: usize },
    #[error("line {line}: nesting budget of {limit} levels exceeded")]
    NestingBudget { line: usize, limit: usize },
    #[error("line {line}: render failed: {source}")]
    Render {
        line: usize,
        #[source]
        source: RenderError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayItem {
    Text(String),
    Header(String),
    Chart(Graph),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Graph(Graph),
    Text(String),
}

/// Everything a script run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    pub displays: Vec<DisplayItem>,
    pub files: Vec<PathBuf>,
    pub session_state: BTreeMap<String, StateValue>,
}

impl Execution {
    pub fn state_graph(&self, key: &str) -> Option<&Graph> {
        match self.session_state.get(key) {
            Some(StateValue::Graph(graph)) => Some(graph),
            _ => None,
        }
    }

    /// The last chart shown on the display surface.
    pub fn chart(&self) -> Option<&Graph> {
        self.displays.iter().rev().find_map(|item| match item {
            DisplayItem::Chart(graph) => Some(graph),
            _ => None,
        })
    }
}

pub struct ScriptRunner {
    out_dir: PathBuf,
    config: Config,
}

impl ScriptRunner {
    pub fn new(out_dir: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            out_dir: out_dir.into(),
            config,
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn run(&self, script: &DiagramScript) -> Result<Execution, ScriptError> {
        self.run_source(script.as_str())
    }

    pub fn run_source(&self, source: &str) -> Result<Execution, ScriptError> {
        let program = parse_program(source)?;
        let mut interp = Interpreter::new(&self.out_dir, &self.config);
        interp.exec_block(&program)?;
        Ok(interp.finish())
    }
}

type GraphId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Module {
    Graphviz,
    Streamlit,
    SessionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Digraph,
    Graph,
    Str,
    Range,
    Len,
    Print,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrScope {
    Graph,
    Node,
    Edge,
}

#[derive(Debug, Clone)]
enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Graph(GraphId),
    AttrMap(GraphId, AttrScope),
    Module(Module),
    Builtin(Builtin),
}

impl Value {
    /// Size as string bytes plus one per other scalar or container, and
    /// container depth.
    fn measure(&self) -> (usize, usize) {
        let fold = |(size, depth): (usize, usize), (s, d): (usize, usize)| (size.saturating_add(s), depth.max(d));
        let (size, depth) = match self {
            Value::Str(s) => return (s.len(), 0),
            Value::List(items) | Value::Tuple(items) => items.iter().map(Value::measure).fold((0, 0), fold),
            Value::Dict(entries) => entries
                .iter()
                .flat_map(|(k, v)| [k.measure(), v.measure()])
                .fold((0, 0), fold),
            _ => return (1, 0),
        };
        (size.saturating_add(1), depth + 1)
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Graph(_) => "graph",
            Value::AttrMap(..) => "dict",
            Value::Module(_) => "module",
            Value::Builtin(_) => "builtin_function",
        }
    }
}

struct GraphObject {
    graph: Graph,
    format: String,
    filename: Option<String>,
}

enum StoredValue {
    Graph(GraphId),
    Text(String),
}

struct Interpreter<'a> {
    out_dir: &'a Path,
    config: &'a Config,
    limits: &'a ScriptLimits,
    globals: HashMap<String, Value>,
    graphs: Vec<GraphObject>,
    displays: Vec<DisplayItem>,
    files: Vec<PathBuf>,
    state: BTreeMap<String, StoredValue>,
    statements: usize,
    iterations: usize,
    line: usize,
}

impl<'a> Interpreter<'a> {
    fn new(out_dir: &'a Path, config: &'a Config) -> Self {
        let mut globals = HashMap::new();
        // The names a diagram script could rely on without importing.
        globals.insert("st".to_string(), Value::Module(Module::Streamlit));
        globals.insert("graphviz".to_string(), Value::Module(Module::Graphviz));
        globals.insert("str".to_string(), Value::Builtin(Builtin::Str));
        globals.insert("range".to_string(), Value::Builtin(Builtin::Range));
        globals.insert("len".to_string(), Value::Builtin(Builtin::Len));
        globals.insert("print".to_string(), Value::Builtin(Builtin::Print));
        Self {
            out_dir,
            config,
            limits: &config.script,
            globals,
            graphs: Vec::new(),
            displays: Vec::new(),
            files: Vec::new(),
            state: BTreeMap::new(),
            statements: 0,
            iterations: 0,
            line: 0,
        }
    }

    fn finish(self) -> Execution {
        let session_state = self
            .state
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    StoredValue::Graph(id) => StateValue::Graph(self.graphs[id].graph.clone()),
                    StoredValue::Text(text) => StateValue::Text(text),
                };
                (key, value)
            })
            .collect();
        Execution {
            displays: self.displays,
            files: self.files,
            session_state,
        }
    }

    fn type_error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Type {
            line: self.line,
            message: message.into(),
        }
    }

    fn unsupported(&self, what: impl Into<String>) -> ScriptError {
        ScriptError::Unsupported {
            line: self.line,
            what: what.into(),
        }
    }

    /// Passes `value` through if it fits the value size and nesting budgets.
    /// Its parts were checked when they were built, so the walk stays shallow.
    fn checked(&self, value: Value) -> Result<Value, ScriptError> {
        let (size, depth) = value.measure();
        if depth > MAX_NESTING {
            return Err(ScriptError::NestingBudget {
                line: self.line,
                limit: MAX_NESTING,
            });
        }
        if size > self.limits.max_value_len {
            return Err(ScriptError::ValueBudget {
                line: self.line,
                limit: self.limits.max_value_len,
            });
        }
        Ok(value)
    }

    fn exec_block(&mut self, body: &[Stmt]) -> Result<(), ScriptError> {
        for stmt in body {
            self.exec(stmt)?;
        }
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<(), ScriptError> {
        self.statements += 1;
        if self.statements > self.limits.max_statements {
            return Err(ScriptError::StatementBudget(self.limits.max_statements));
        }
        self.line = stmt.line;
        match &stmt.kind {
            StmtKind::Pass => Ok(()),
            StmtKind::Expr(expr) => self.eval(expr).map(|_| ()),
            StmtKind::Import(imports) => imports.iter().try_for_each(|import| self.import(import)),
            StmtKind::Assign(targets, value) => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
                Ok(())
            }
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval(iter)?;
                let items = self.iterate(iterable)?;
                for item in items {
                    self.iterations += 1;
                    if self.iterations > self.limits.max_loop_iterations {
                        return Err(ScriptError::LoopBudget(self.limits.max_loop_iterations));
                    }
                    self.line = stmt.line;
                    self.assign(target, item)?;
                    self.exec_block(body)?;
                }
                Ok(())
            }
            StmtKind::With {
                context,
                alias,
                body,
            } => self.exec_with(stmt.line, context, alias.as_deref(), body),
        }
    }

    fn exec_with(
        &mut self,
        line: usize,
        context: &Expr,
        alias: Option<&str>,
        body: &[Stmt],
    ) -> Result<(), ScriptError> {
        // Only `<graph>.subgraph(...)` is a context manager here.
        let Expr::Call { func, args, kwargs } = context else {
            return Err(self.unsupported("'with' on anything but a graph subgraph"));
        };
        let Expr::Attr(receiver, method) = func.as_ref() else {
            return Err(self.unsupported("'with' on anything but a graph subgraph"));
        };
        if method != "subgraph" {
            return Err(self.unsupported(format!("'with' on '{method}'")));
        }
        let Value::Graph(parent) = self.eval(receiver)? else {
            return Err(self.type_error("subgraph() must be called on a graph"));
        };
        let args = self.eval_all(args)?;
        let kwargs = self.eval_kwargs(kwargs)?;
        if !args.is_empty() || kwargs.iter().any(|(k, _)| k == "graph") {
            return Err(self.unsupported("subgraph(graph=...) as a context manager"));
        }
        let kind = self.graphs[parent].graph.kind;
        let child = self.new_graph(kind, &[], &kwargs)?;
        if let Some(alias) = alias {
            self.globals.insert(alias.to_string(), Value::Graph(child));
        }
        self.exec_block(body)?;
        self.line = line;
        let snapshot = self.graphs[child].graph.clone();
        self.graphs[parent].graph.subgraphs.push(snapshot);
        self.check_subgraphs(parent)
    }

    fn import(&mut self, import: &Import) -> Result<(), ScriptError> {
        let module = import.module.as_str();
        match (module, import.name.as_deref()) {
            ("graphviz", None) => {
                let bind = import.alias.clone().unwrap_or_else(|| "graphviz".to_string());
                self.globals.insert(bind, Value::Module(Module::Graphviz));
            }
            ("streamlit", None) => {
                let bind = import.alias.clone().unwrap_or_else(|| "streamlit".to_string());
                self.globals.insert(bind, Value::Module(Module::Streamlit));
            }
            ("graphviz", Some("*")) => {
                self.globals.insert("Digraph".to_string(), Value::Builtin(Builtin::Digraph));
                self.globals.insert("Graph".to_string(), Value::Builtin(Builtin::Graph));
            }
            ("graphviz", Some(name @ ("Digraph" | "Graph"))) => {
                let builtin = if name == "Digraph" {
                    Builtin::Digraph
                } else {
                    Builtin::Graph
                };
                let bind = import.alias.clone().unwrap_or_else(|| name.to_string());
                self.globals.insert(bind, Value::Builtin(builtin));
            }
            _ => {
                let full = match &import.name {
                    Some(name) => format!("{module}.{name}"),
                    None => module.to_string(),
                };
                return Err(ScriptError::ForbiddenImport {
                    line: self.line,
                    module: full,
                });
            }
        }
        Ok(())
    }

    fn iterate(&self, value: Value) -> Result<Vec<Value>, ScriptError> {
        match value {
            Value::List(items) | Value::Tuple(items) => Ok(items),
            Value::Dict(entries) => Ok(entries.into_iter().map(|(k, _)| k).collect()),
            Value::Str(text) => Ok(text.chars().map(|c| Value::Str(c.to_string())).collect()),
            other => Err(self.type_error(format!("'{}' object is not iterable", other.type_name()))),
        }
    }

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), ScriptError> {
        match target {
            Target::Name(name) => {
                self.globals.insert(name.clone(), value);
                Ok(())
            }
            Target::Tuple(targets) => {
                let items = self.iterate(value)?;
                if items.len() != targets.len() {
                    return Err(self.type_error(format!(
                        "cannot unpack {} values into {} targets",
                        items.len(),
                        targets.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
                Ok(())
            }
            Target::Attr(obj, attr) => {
                let obj = self.eval(obj)?;
                self.set_attr(obj, attr, value)
            }
            Target::Index(obj, key) => {
                let obj = self.eval(obj)?;
                let key = self.eval(key)?;
                match obj {
                    Value::AttrMap(id, scope) => {
                        let key = self.attr_string(&key);
                        let value = self.attr_string(&value);
                        self.attr_map(id, scope).insert(key, value);
                        Ok(())
                    }
                    Value::Module(Module::SessionState) => {
                        let Value::Str(key) = key else {
                            return Err(self.type_error("session_state keys must be strings"));
                        };
                        self.store_state(key, value);
                        Ok(())
                    }
                    other => Err(self.unsupported(format!(
                        "item assignment on '{}'",
                        other.type_name()
                    ))),
                }
            }
        }
    }

    fn set_attr(&mut self, obj: Value, attr: &str, value: Value) -> Result<(), ScriptError> {
        match (obj, attr) {
            (Value::Graph(id), "format") => {
                let Value::Str(format) = value else {
                    return Err(self.type_error("format must be a string"));
                };
                self.graphs[id].format = format;
                Ok(())
            }
            (Value::Graph(id), "filename") => {
                let Value::Str(filename) = value else {
                    return Err(self.type_error("filename must be a string"));
                };
                self.graphs[id].filename = Some(filename);
                Ok(())
            }
            (Value::Graph(id), "comment") => {
                self.graphs[id].graph.comment = Some(self.attr_string(&value));
                Ok(())
            }
            (Value::Graph(_), "engine") => Ok(()),
            (Value::Module(Module::SessionState), key) => {
                self.store_state(key.to_string(), value);
                Ok(())
            }
            (obj, attr) => Err(self.unsupported(format!(
                "setting attribute '{attr}' on '{}'",
                obj.type_name()
            ))),
        }
    }

    fn store_state(&mut self, key: String, value: Value) {
        let stored = match value {
            Value::Graph(id) => StoredValue::Graph(id),
            other => StoredValue::Text(self.display_string(&other)),
        };
        log::debug!("session_state.{key} updated");
        self.state.insert(key, stored);
    }

    fn attr_map(&mut self, id: GraphId, scope: AttrScope) -> &mut Attrs {
        let graph = &mut self.graphs[id].graph;
        match scope {
            AttrScope::Graph => &mut graph.graph_attrs,
            AttrScope::Node => &mut graph.node_attrs,
            AttrScope::Edge => &mut graph.edge_attrs,
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> Result<Vec<Value>, ScriptError> {
        exprs.iter().map(|e| self.eval(e)).collect()
    }

    fn eval_kwargs(&mut self, kwargs: &[(String, Expr)]) -> Result<Vec<(String, Value)>, ScriptError> {
        kwargs
            .iter()
            .map(|(name, expr)| Ok((name.clone(), self.eval(expr)?)))
            .collect()
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, ScriptError> {
        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Name(name) => self.globals.get(name).cloned().ok_or_else(|| ScriptError::UndefinedName {
                line: self.line,
                name: name.clone(),
            }),
            Expr::List(items) => {
                let items = self.eval_all(items)?;
                self.checked(Value::List(items))
            }
            Expr::Tuple(items) => {
                let items = self.eval_all(items)?;
                self.checked(Value::Tuple(items))
            }
            Expr::Dict(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    out.push((self.eval(key)?, self.eval(value)?));
                }
                self.checked(Value::Dict(out))
            }
            Expr::Neg(inner) => match self.eval(inner)? {
                Value::Int(i) => Ok(Value::Int(-i)),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(self.type_error(format!("bad operand type for unary -: '{}'", other.type_name()))),
            },
            Expr::Add(left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                match (left, right) {
                    (Value::Str(a), Value::Str(b)) => {
                        if a.len().saturating_add(b.len()) > self.limits.max_value_len {
                            return Err(ScriptError::ValueBudget {
                                line: self.line,
                                limit: self.limits.max_value_len,
                            });
                        }
                        Ok(Value::Str(a + &b))
                    }
                    (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.saturating_add(b))),
                    (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
                    (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                        Ok(Value::Float(a as f64 + b))
                    }
                    (Value::List(mut a), Value::List(b)) => {
                        if a.len().saturating_add(b.len()) > self.limits.max_value_len {
                            return Err(ScriptError::ValueBudget {
                                line: self.line,
                                limit: self.limits.max_value_len,
                            });
                        }
                        a.extend(b);
                        self.checked(Value::List(a))
                    }
                    (a, b) => Err(self.type_error(format!(
                        "unsupported operand types for +: '{}' and '{}'",
                        a.type_name(),
                        b.type_name()
                    ))),
                }
            }
            Expr::Sub(left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                match (left, right) {
                    (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.saturating_sub(b))),
                    (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a - b)),
                    (Value::Int(a), Value::Float(b)) => Ok(Value::Float(a as f64 - b)),
                    (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a - b as f64)),
                    (a, b) => Err(self.type_error(format!(
                        "unsupported operand types for -: '{}' and '{}'",
                        a.type_name(),
                        b.type_name()
                    ))),
                }
            }
            Expr::Attr(obj, attr) => {
                let obj = self.eval(obj)?;
                self.get_attr(obj, attr)
            }
            Expr::Index(obj, key) => {
                let obj = self.eval(obj)?;
                let key = self.eval(key)?;
                self.index(obj, key)
            }
            Expr::Call { func, args, kwargs } => {
                if let Expr::Attr(receiver, method) = func.as_ref() {
                    let receiver = self.eval(receiver)?;
                    let args = self.eval_all(args)?;
                    let kwargs = self.eval_kwargs(kwargs)?;
                    return self.call_method(receiver, method, args, kwargs);
                }
                let func = self.eval(func)?;
                let args = self.eval_all(args)?;
                let kwargs = self.eval_kwargs(kwargs)?;
                match func {
                    Value::Builtin(builtin) => self.call_builtin(builtin, args, kwargs),
                    other => Err(self.type_error(format!("'{}' object is not callable", other.type_name()))),
                }
            }
        }
    }

    fn get_attr(&mut self, obj: Value, attr: &str) -> Result<Value, ScriptError> {
        match (&obj, attr) {
            (Value::Module(Module::Graphviz), "Digraph") => Ok(Value::Builtin(Builtin::Digraph)),
            (Value::Module(Module::Graphviz), "Graph") => Ok(Value::Builtin(Builtin::Graph)),
            (Value::Module(Module::Streamlit), "session_state") => Ok(Value::Module(Module::SessionState)),
            (Value::Module(Module::SessionState), key) => self.read_state(key),
            (Value::Graph(id), "format") => Ok(Value::Str(self.graphs[*id].format.clone())),
            (Value::Graph(id), "name") => Ok(self.graphs[*id].graph.name.clone().map(Value::Str).unwrap_or(Value::None)),
            (Value::Graph(id), "source") => Ok(Value::Str(to_source(&self.graphs[*id].graph))),
            (Value::Graph(id), "graph_attr") => Ok(Value::AttrMap(*id, AttrScope::Graph)),
            (Value::Graph(id), "node_attr") => Ok(Value::AttrMap(*id, AttrScope::Node)),
            (Value::Graph(id), "edge_attr") => Ok(Value::AttrMap(*id, AttrScope::Edge)),
            _ => Err(self.unsupported(format!("attribute '{attr}' of '{}'", obj.type_name()))),
        }
    }

    fn read_state(&self, key: &str) -> Result<Value, ScriptError> {
        match self.state.get(key) {
            Some(StoredValue::Graph(id)) => Ok(Value::Graph(*id)),
            Some(StoredValue::Text(text)) => Ok(Value::Str(text.clone())),
            None => Err(self.type_error(format!("session_state has no key '{key}'"))),
        }
    }

    fn index(&self, obj: Value, key: Value) -> Result<Value, ScriptError> {
        match (obj, key) {
            (Value::List(items) | Value::Tuple(items), Value::Int(i)) => {
                let len = items.len() as i64;
                let idx = if i < 0 { len + i } else { i };
                if idx < 0 || idx >= len {
                    return Err(self.type_error("index out of range"));
                }
                Ok(items[idx as usize].clone())
            }
            (Value::Dict(entries), key) => {
                let wanted = self.display_string(&key);
                entries
                    .into_iter()
                    .find(|(k, _)| self.display_string(k) == wanted)
                    .map(|(_, v)| v)
                    .ok_or_else(|| self.type_error(format!("key '{wanted}' not found")))
            }
            (Value::AttrMap(id, scope), Value::Str(key)) => {
                let graph = &self.graphs[id].graph;
                let map = match scope {
                    AttrScope::Graph => &graph.graph_attrs,
                    AttrScope::Node => &graph.node_attrs,
                    AttrScope::Edge => &graph.edge_attrs,
                };
                map.get(&key)
                    .map(|v| Value::Str(v.clone()))
                    .ok_or_else(|| self.type_error(format!("key '{key}' not found")))
            }
            (Value::Module(Module::SessionState), Value::Str(key)) => self.read_state(&key),
            (obj, _) => Err(self.type_error(format!("'{}' object is not subscriptable", obj.type_name()))),
        }
    }

    fn call_builtin(
        &mut self,
        builtin: Builtin,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        match builtin {
            Builtin::Digraph => Ok(Value::Graph(self.new_graph(GraphKind::Directed, &args, &kwargs)?)),
            Builtin::Graph => Ok(Value::Graph(self.new_graph(GraphKind::Undirected, &args, &kwargs)?)),
            Builtin::Str => self.checked(Value::Str(
                args.first().map(|v| self.display_string(v)).unwrap_or_default(),
            )),
            Builtin::Len => match args.first() {
                Some(Value::List(items) | Value::Tuple(items)) => Ok(Value::Int(items.len() as i64)),
                Some(Value::Dict(entries)) => Ok(Value::Int(entries.len() as i64)),
                Some(Value::Str(text)) => Ok(Value::Int(text.chars().count() as i64)),
                _ => Err(self.type_error("len() needs a sized argument")),
            },
            Builtin::Range => {
                let bounds: Vec<i64> = args
                    .iter()
                    .map(|v| match v {
                        Value::Int(i) => Ok(*i),
                        _ => Err(self.type_error("range() needs integer arguments")),
                    })
                    .collect::<Result<_, _>>()?;
                let (start, end) = match bounds.as_slice() {
                    [end] => (0, *end),
                    [start, end] => (*start, *end),
                    _ => return Err(self.unsupported("range() with a step")),
                };
                let span = end.saturating_sub(start).max(0) as usize;
                if span > self.limits.max_loop_iterations {
                    return Err(ScriptError::LoopBudget(self.limits.max_loop_iterations));
                }
                Ok(Value::List((start..end).map(Value::Int).collect()))
            }
            Builtin::Print => {
                let parts: Vec<String> = args.iter().map(|v| self.display_string(v)).collect();
                log::debug!("script print: {}", parts.join(" "));
                Ok(Value::None)
            }
        }
    }

    fn new_graph(
        &mut self,
        kind: GraphKind,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> Result<GraphId, ScriptError> {
        let mut graph = Graph::new(kind);
        let mut format = "pdf".to_string();
        let mut filename = None;
        if let Some(name) = args.first() {
            graph.name = Some(self.display_string(name));
        }
        if args.len() > 1 {
            graph.comment = Some(self.display_string(&args[1]));
        }
        for (key, value) in kwargs {
            match key.as_str() {
                "name" => graph.name = Some(self.display_string(value)),
                "comment" => graph.comment = Some(self.display_string(value)),
                "format" => format = self.display_string(value),
                "filename" => filename = Some(self.display_string(value)),
                "graph_attr" => graph.graph_attrs.extend(self.attr_dict(value)?),
                "node_attr" => graph.node_attrs.extend(self.attr_dict(value)?),
                "edge_attr" => graph.edge_attrs.extend(self.attr_dict(value)?),
                "engine" | "strict" | "encoding" => {}
                "directory" => return Err(self.unsupported("the 'directory' argument")),
                other => return Err(self.type_error(format!("unexpected keyword argument '{other}'"))),
            }
        }
        self.graphs.push(GraphObject {
            graph,
            format,
            filename,
        });
        Ok(self.graphs.len() - 1)
    }

    fn call_method(
        &mut self,
        receiver: Value,
        method: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        match receiver {
            Value::Graph(id) => self.call_graph_method(id, method, args, kwargs),
            Value::Module(Module::Streamlit) => self.call_streamlit(method, args, kwargs),
            Value::Module(Module::Graphviz) => match method {
                "Digraph" => self.call_builtin(Builtin::Digraph, args, kwargs),
                "Graph" => self.call_builtin(Builtin::Graph, args, kwargs),
                other => Err(self.unsupported(format!("graphviz.{other}"))),
            },
            Value::AttrMap(id, scope) if method == "update" => {
                let mut attrs = Attrs::new();
                for arg in &args {
                    attrs.extend(self.attr_dict(arg)?);
                }
                for (key, value) in &kwargs {
                    attrs.insert(key.clone(), self.attr_string(value));
                }
                self.attr_map(id, scope).extend(attrs);
                Ok(Value::None)
            }
            Value::List(_) if method == "append" || method == "extend" => {
                Err(self.unsupported("mutating lists in place"))
            }
            other => Err(self.unsupported(format!("method '{method}' of '{}'", other.type_name()))),
        }
    }

    fn call_graph_method(
        &mut self,
        id: GraphId,
        method: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        match method {
            "node" => {
                let name = self.required_arg(&args, &kwargs, 0, "name")?;
                let mut attrs = Attrs::new();
                if let Some(label) = self.optional_arg(&args, &kwargs, 1, "label") {
                    attrs.insert("label".to_string(), self.attr_string(&label));
                }
                attrs.extend(self.keyword_attrs(&kwargs, &["name", "label"])?);
                let name = self.display_string(&name);
                self.graphs[id].graph.add_node(&name, attrs);
                self.check_nodes(id)?;
                Ok(Value::None)
            }
            "edge" => {
                let tail = self.required_arg(&args, &kwargs, 0, "tail_name")?;
                let head = self.required_arg(&args, &kwargs, 1, "head_name")?;
                let mut attrs = Attrs::new();
                if let Some(label) = self.optional_arg(&args, &kwargs, 2, "label") {
                    attrs.insert("label".to_string(), self.attr_string(&label));
                }
                attrs.extend(self.keyword_attrs(&kwargs, &["tail_name", "head_name", "label"])?);
                let (tail, head) = (self.display_string(&tail), self.display_string(&head));
                self.graphs[id].graph.add_edge(&tail, &head, attrs);
                self.check_nodes(id)?;
                Ok(Value::None)
            }
            "edges" => {
                let pairs = self.required_arg(&args, &kwargs, 0, "tail_head_iter")?;
                for pair in self.iterate(pairs)? {
                    let ends = self.iterate(pair)?;
                    let [tail, head] = ends.as_slice() else {
                        return Err(self.type_error("edges() items must be (tail, head) pairs"));
                    };
                    let (tail, head) = (self.display_string(tail), self.display_string(head));
                    self.graphs[id].graph.add_edge(&tail, &head, Attrs::new());
                }
                self.check_nodes(id)?;
                Ok(Value::None)
            }
            "attr" => {
                let scope = match self.optional_arg(&args, &kwargs, 0, "kw") {
                    None | Some(Value::None) => AttrScope::Graph,
                    Some(Value::Str(kw)) => match kw.as_str() {
                        "graph" => AttrScope::Graph,
                        "node" => AttrScope::Node,
                        "edge" => AttrScope::Edge,
                        other => return Err(self.type_error(format!("attr() kw must be graph, node or edge, not '{other}'"))),
                    },
                    Some(other) => return Err(self.type_error(format!("attr() kw must be a string, not '{}'", other.type_name()))),
                };
                let attrs = self.keyword_attrs(&kwargs, &["kw"])?;
                self.attr_map(id, scope).extend(attrs);
                Ok(Value::None)
            }
            "subgraph" => {
                let graph = self.optional_arg(&args, &kwargs, 0, "graph");
                match graph {
                    Some(Value::Graph(child)) => {
                        let snapshot = self.graphs[child].graph.clone();
                        self.graphs[id].graph.subgraphs.push(snapshot);
                        self.check_subgraphs(id)?;
                        Ok(Value::None)
                    }
                    Some(other) => Err(self.type_error(format!("subgraph() expects a graph, not '{}'", other.type_name()))),
                    None => Err(self.unsupported("subgraph() outside a 'with' block")),
                }
            }
            "render" => {
                let filename = self.optional_arg(&args, &kwargs, 0, "filename");
                let format = self.optional_arg(&[], &kwargs, 0, "format");
                if let Some(Value::Bool(true)) = self.optional_arg(&[], &kwargs, 99, "view") {
                    log::debug!("ignoring view=True in render()");
                }
                if kwargs.iter().any(|(k, _)| k == "directory") {
                    return Err(self.unsupported("the 'directory' argument"));
                }
                let format = match format {
                    Some(value) => self.display_string(&value),
                    None => self.graphs[id].format.clone(),
                };
                let stem = self.output_stem(id, filename)?;
                self.render(id, &stem, &format).map(|image| Value::Str(image.display().to_string()))
            }
            "save" => {
                let filename = self.optional_arg(&args, &kwargs, 0, "filename");
                let stem = self.output_stem(id, filename)?;
                std::fs::write(&stem, to_source(&self.graphs[id].graph)).map_err(|e| ScriptError::Render {
                    line: self.line,
                    source: RenderError::Io(e),
                })?;
                self.files.push(stem.clone());
                Ok(Value::Str(stem.display().to_string()))
            }
            "view" => {
                log::debug!("ignoring view()");
                Ok(Value::None)
            }
            other => Err(self.unsupported(format!("graph method '{other}'"))),
        }
    }

    fn output_stem(&self, id: GraphId, filename: Option<Value>) -> Result<PathBuf, ScriptError> {
        let object = &self.graphs[id];
        let name = match filename {
            Some(Value::None) | None => object.filename.clone().unwrap_or_else(|| {
                let base = object.graph.name.clone().unwrap_or_else(|| match object.graph.kind {
                    GraphKind::Directed => "Digraph".to_string(),
                    GraphKind::Undirected => "Graph".to_string(),
                });
                format!("{base}.gv")
            }),
            Some(value) => self.display_string(&value),
        };
        let path = Path::new(&name);
        let plain = !name.is_empty()
            && path
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            && path.components().count() == 1;
        if !plain {
            return Err(ScriptError::ForbiddenPath {
                line: self.line,
                path: name,
            });
        }
        Ok(self.out_dir.join(path))
    }

    fn render(&mut self, id: GraphId, stem: &Path, format: &str) -> Result<PathBuf, ScriptError> {
        let line = self.line;
        let format = ImageFormat::from_name(format).map_err(|source| ScriptError::Render { line, source })?;
        let total = self.graphs[id].graph.node_count();
        if total > self.limits.max_nodes {
            return Err(ScriptError::NodeBudget(self.limits.max_nodes));
        }
        let files = render_graph(&self.graphs[id].graph, stem, format, self.config)
            .map_err(|source| ScriptError::Render { line, source })?;
        self.files.push(files.source);
        self.files.push(files.image.clone());
        Ok(files.image)
    }

    fn check_nodes(&self, id: GraphId) -> Result<(), ScriptError> {
        if self.graphs[id].graph.node_count() > self.limits.max_nodes {
            return Err(ScriptError::NodeBudget(self.limits.max_nodes));
        }
        Ok(())
    }

    /// Subgraphs count against the node budget; a graph added to itself
    /// doubles on every call.
    fn check_subgraphs(&self, id: GraphId) -> Result<(), ScriptError> {
        let graph = &self.graphs[id].graph;
        if graph.subgraph_depth() > MAX_NESTING {
            return Err(ScriptError::NestingBudget {
                line: self.line,
                limit: MAX_NESTING,
            });
        }
        if graph.subgraph_count() > self.limits.max_nodes {
            return Err(ScriptError::NodeBudget(self.limits.max_nodes));
        }
        self.check_nodes(id)
    }

    fn call_streamlit(
        &mut self,
        method: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        match method {
            "write" | "markdown" | "text" | "caption" => {
                let parts: Vec<String> = args.iter().map(|v| self.display_string(v)).collect();
                self.displays.push(DisplayItem::Text(parts.join(" ")));
                Ok(Value::None)
            }
            "header" | "subheader" | "title" => {
                let text = self.required_arg(&args, &kwargs, 0, "body")?;
                let text = self.display_string(&text);
                self.displays.push(DisplayItem::Header(text));
                Ok(Value::None)
            }
            "graphviz_chart" => {
                let figure = self.required_arg(&args, &kwargs, 0, "figure_or_dot")?;
                let Value::Graph(graph) = figure else {
                    return Err(self.unsupported("graphviz_chart() with a DOT string"));
                };
                self.displays.push(DisplayItem::Chart(self.graphs[graph].graph.clone()));
                Ok(Value::None)
            }
            other => Err(self.unsupported(format!("st.{other}"))),
        }
    }

    fn required_arg(
        &self,
        args: &[Value],
        kwargs: &[(String, Value)],
        position: usize,
        name: &str,
    ) -> Result<Value, ScriptError> {
        self.optional_arg(args, kwargs, position, name)
            .ok_or_else(|| self.type_error(format!("missing required argument '{name}'")))
    }

    fn optional_arg(
        &self,
        args: &[Value],
        kwargs: &[(String, Value)],
        position: usize,
        name: &str,
    ) -> Option<Value> {
        args.get(position).cloned().or_else(|| {
            kwargs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        })
    }

    /// Graphviz attributes from keyword arguments; a leading underscore
    /// escapes reserved words (`_class`), and `_attributes` carries a dict.
    fn keyword_attrs(&self, kwargs: &[(String, Value)], skip: &[&str]) -> Result<Attrs, ScriptError> {
        let mut attrs = Attrs::new();
        for (key, value) in kwargs {
            if skip.contains(&key.as_str()) {
                continue;
            }
            if key == "_attributes" {
                attrs.extend(self.attr_dict(value)?);
                continue;
            }
            if matches!(value, Value::None) {
                continue;
            }
            let key = key.strip_prefix('_').unwrap_or(key.as_str());
            attrs.insert(key.to_string(), self.attr_string(value));
        }
        Ok(attrs)
    }

    fn attr_dict(&self, value: &Value) -> Result<Attrs, ScriptError> {
        match value {
            Value::Dict(entries) => Ok(entries
                .iter()
                .map(|(k, v)| (self.display_string(k), self.attr_string(v)))
                .collect()),
            Value::None => Ok(Attrs::new()),
            other => Err(self.type_error(format!("expected a dict of attributes, not '{}'", other.type_name()))),
        }
    }

    fn attr_string(&self, value: &Value) -> String {
        match value {
            Value::Bool(true) => "true".to_string(),
            Value::Bool(false) => "false".to_string(),
            other => self.display_string(other),
        }
    }

    fn display_string(&self, value: &Value) -> String {
        match value {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Value::Str(s) => s.clone(),
            Value::List(items) => format!("[{}]", self.repr_items(items)),
            Value::Tuple(items) if items.len() == 1 => format!("({},)", self.repr_items(items)),
            Value::Tuple(items) => format!("({})", self.repr_items(items)),
            Value::Dict(entries) => {
                let parts: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", self.repr(k), self.repr(v)))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Graph(id) => to_source(&self.graphs[*id].graph),
            Value::AttrMap(..) => "{...}".to_string(),
            Value::Module(module) => format!("<module {module:?}>"),
            Value::Builtin(builtin) => format!("<built-in {builtin:?}>"),
        }
    }

    fn repr(&self, value: &Value) -> String {
        match value {
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            other => self.display_string(other),
        }
    }

    fn repr_items(&self, items: &[Value]) -> String {
        items.iter().map(|v| self.repr(v)).collect::<Vec<_>>().join(", ")
    }
}
