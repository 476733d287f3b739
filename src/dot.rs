use crate::ir::{Attrs, Graph, GraphKind};
use once_cell::sync::Lazy;
use regex::Regex;

static PLAIN_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[A-Za-z_][A-Za-z0-9_]*|-?(?:\.[0-9]+|[0-9]+(?:\.[0-9]*)?))$").unwrap());

const KEYWORDS: [&str; 6] = ["node", "edge", "graph", "digraph", "subgraph", "strict"];

/// DOT source for a graph, in the layout Graphviz tooling writes it.
pub fn to_source(graph: &Graph) -> String {
    let mut out = String::new();
    if let Some(comment) = &graph.comment {
        for line in comment.lines() {
            out.push_str(&format!("// {line}\n"));
        }
    }
    out.push_str(graph.kind.keyword());
    if let Some(name) = &graph.name {
        out.push(' ');
        out.push_str(&quote(name));
    }
    out.push_str(" {\n");
    write_body(graph, graph.kind, 1, &mut out);
    out.push_str("}\n");
    out
}

fn write_body(graph: &Graph, kind: GraphKind, depth: usize, out: &mut String) {
    let indent = "\t".repeat(depth);
    if !graph.graph_attrs.is_empty() {
        out.push_str(&format!("{indent}graph{}\n", attr_list(&graph.graph_attrs)));
    }
    if !graph.node_attrs.is_empty() {
        out.push_str(&format!("{indent}node{}\n", attr_list(&graph.node_attrs)));
    }
    if !graph.edge_attrs.is_empty() {
        out.push_str(&format!("{indent}edge{}\n", attr_list(&graph.edge_attrs)));
    }
    for node in &graph.nodes {
        out.push_str(&format!("{indent}{}{}\n", quote(&node.id), attr_list(&node.attrs)));
    }
    for edge in &graph.edges {
        out.push_str(&format!(
            "{indent}{} {} {}{}\n",
            quote(&edge.from),
            kind.edge_op(),
            quote(&edge.to),
            attr_list(&edge.attrs)
        ));
    }
    for sub in &graph.subgraphs {
        match &sub.name {
            Some(name) => out.push_str(&format!("{indent}subgraph {} {{\n", quote(name))),
            None => out.push_str(&format!("{indent}{{\n")),
        }
        write_body(sub, kind, depth + 1, out);
        out.push_str(&format!("{indent}}}\n"));
    }
}

fn attr_list(attrs: &Attrs) -> String {
    if attrs.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = attrs
        .iter()
        .map(|(key, value)| format!("{}={}", quote(key), quote(value)))
        .collect();
    format!(" [{}]", parts.join(" "))
}

pub fn quote(id: &str) -> String {
    let lower = id.to_ascii_lowercase();
    if PLAIN_ID_RE.is_match(id) && !KEYWORDS.contains(&lower.as_str()) {
        return id.to_string();
    }
    if id.starts_with('<') && id.ends_with('>') && id.len() > 1 {
        return id.to_string();
    }
    let escaped = id.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n");
    format!("\"{escaped}\"")
}
