use std::collections::BTreeMap;

pub type Attrs = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    TopDown,
    LeftRight,
    BottomTop,
    RightLeft,
}

impl Direction {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "TB" | "TD" => Some(Self::TopDown),
            "LR" => Some(Self::LeftRight),
            "BT" => Some(Self::BottomTop),
            "RL" => Some(Self::RightLeft),
            _ => None,
        }
    }

    pub fn is_horizontal(self) -> bool {
        matches!(self, Self::LeftRight | Self::RightLeft)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphKind {
    Directed,
    Undirected,
}

impl GraphKind {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Directed => "digraph",
            Self::Undirected => "graph",
        }
    }

    pub fn edge_op(self) -> &'static str {
        match self {
            Self::Directed => "->",
            Self::Undirected => "--",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeShape {
    Ellipse,
    Box,
    RoundBox,
    Circle,
    DoubleCircle,
    Diamond,
    Parallelogram,
    Hexagon,
    Cylinder,
    Note,
    PlainText,
}

impl NodeShape {
    pub fn from_token(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "box" | "rect" | "rectangle" | "square" | "component" | "folder" | "tab" => Self::Box,
            "circle" | "point" => Self::Circle,
            "doublecircle" => Self::DoubleCircle,
            "diamond" | "mdiamond" => Self::Diamond,
            "parallelogram" | "trapezium" | "invtrapezium" => Self::Parallelogram,
            "hexagon" | "octagon" => Self::Hexagon,
            "cylinder" => Self::Cylinder,
            "note" => Self::Note,
            "plaintext" | "plain" | "none" | "underline" => Self::PlainText,
            _ => Self::Ellipse,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub attrs: Attrs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub attrs: Attrs,
}

/// A Graphviz-style graph description: the intermediate form diagram scripts
/// are executed into.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub kind: GraphKind,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub graph_attrs: Attrs,
    pub node_attrs: Attrs,
    pub edge_attrs: Attrs,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub subgraphs: Vec<Graph>,
}

impl Graph {
    pub fn new(kind: GraphKind) -> Self {
        Self {
            kind,
            name: None,
            comment: None,
            graph_attrs: Attrs::new(),
            node_attrs: Attrs::new(),
            edge_attrs: Attrs::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            subgraphs: Vec::new(),
        }
    }

    /// Adds a node statement, merging attributes into an existing statement
    /// for the same id.
    pub fn add_node(&mut self, id: &str, attrs: Attrs) {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.id == id) {
            existing.attrs.extend(attrs);
            return;
        }
        self.nodes.push(Node {
            id: id.to_string(),
            attrs,
        });
    }

    pub fn add_edge(&mut self, from: &str, to: &str, attrs: Attrs) {
        self.edges.push(Edge {
            from: from.to_string(),
            to: to.to_string(),
            attrs,
        });
    }

    pub fn direction(&self) -> Direction {
        self.graph_attrs
            .get("rankdir")
            .and_then(|v| Direction::from_token(v))
            .unwrap_or(Direction::TopDown)
    }

    pub fn is_cluster(&self) -> bool {
        self.name
            .as_deref()
            .map(|name| name.starts_with("cluster"))
            .unwrap_or(false)
    }

    pub fn label(&self) -> Option<&str> {
        self.graph_attrs.get("label").map(|s| s.as_str())
    }

    /// Number of distinct node ids declared or referenced anywhere in the
    /// graph, subgraphs included.
    pub fn node_count(&self) -> usize {
        let mut ids = std::collections::BTreeSet::new();
        self.collect_ids(&mut ids);
        ids.len()
    }

    /// Subgraphs at every level below this graph.
    pub fn subgraph_count(&self) -> usize {
        self.subgraphs.iter().map(|sub| 1 + sub.subgraph_count()).sum()
    }

    /// Levels of subgraph nesting; a graph without subgraphs has depth 0.
    pub fn subgraph_depth(&self) -> usize {
        self.subgraphs
            .iter()
            .map(|sub| 1 + sub.subgraph_depth())
            .max()
            .unwrap_or(0)
    }

    fn collect_ids<'a>(&'a self, ids: &mut std::collections::BTreeSet<&'a str>) {
        for node in &self.nodes {
            ids.insert(node.id.as_str());
        }
        for edge in &self.edges {
            ids.insert(edge.from.as_str());
            ids.insert(edge.to.as_str());
        }
        for sub in &self.subgraphs {
            sub.collect_ids(ids);
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new(GraphKind::Directed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_statements_merge_attributes() {
        let mut graph = Graph::default();
        graph.add_node("A", Attrs::from([("label".to_string(), "Start".to_string())]));
        graph.add_node("A", Attrs::from([("shape".to_string(), "box".to_string())]));
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].attrs.len(), 2);
    }

    #[test]
    fn counts_ids_across_subgraphs() {
        let mut graph = Graph::default();
        graph.add_edge("A", "B", Attrs::new());
        let mut sub = Graph::default();
        sub.name = Some("cluster_io".to_string());
        sub.add_node("C", Attrs::new());
        sub.add_edge("B", "C", Attrs::new());
        assert!(sub.is_cluster());
        graph.subgraphs.push(sub);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.subgraph_count(), 1);
    }

    #[test]
    fn subgraph_depth_follows_nesting() {
        let mut inner = Graph::default();
        inner.subgraphs.push(Graph::default());
        let mut graph = Graph::default();
        graph.subgraphs.push(inner);
        graph.subgraphs.push(Graph::default());
        assert_eq!(graph.subgraph_count(), 3);
        assert_eq!(graph.subgraph_depth(), 2);
    }

    #[test]
    fn rankdir_sets_direction() {
        let mut graph = Graph::default();
        assert_eq!(graph.direction(), Direction::TopDown);
        graph.graph_attrs.insert("rankdir".to_string(), "lr".to_string());
        assert_eq!(graph.direction(), Direction::LeftRight);
    }
}
