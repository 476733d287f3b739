use crate::config::LayoutConfig;
use crate::ir::{Attrs, Direction, Graph, GraphKind, NodeShape};
use crate::theme::Theme;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

static HTML_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

#[derive(Debug, Clone)]
pub struct TextBlock {
    pub lines: Vec<String>,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone)]
pub struct NodeLayout {
    pub id: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub label: TextBlock,
    pub shape: NodeShape,
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub font_color: Option<String>,
    pub dashed: bool,
}

#[derive(Debug, Clone)]
pub struct EdgeLayout {
    pub from: String,
    pub to: String,
    pub label: Option<TextBlock>,
    pub points: Vec<(f32, f32)>,
    pub directed: bool,
    pub color: Option<String>,
    pub dashed: bool,
}

#[derive(Debug, Clone)]
pub struct ClusterLayout {
    pub label: Option<TextBlock>,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub fill: Option<String>,
    pub stroke: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Layout {
    pub direction: Direction,
    pub title: Option<TextBlock>,
    pub nodes: BTreeMap<String, NodeLayout>,
    pub edges: Vec<EdgeLayout>,
    pub clusters: Vec<ClusterLayout>,
    pub width: f32,
    pub height: f32,
}

struct FlatNode {
    id: String,
    attrs: Attrs,
    cluster: Option<usize>,
}

struct FlatEdge {
    from: String,
    to: String,
    attrs: Attrs,
}

struct FlatCluster {
    attrs: Attrs,
    members: Vec<String>,
}

#[derive(Default)]
struct Flattened {
    nodes: Vec<FlatNode>,
    index: HashMap<String, usize>,
    edges: Vec<FlatEdge>,
    clusters: Vec<FlatCluster>,
}

impl Flattened {
    fn touch(&mut self, id: &str, defaults: &Attrs, attrs: Option<&Attrs>, cluster: Option<usize>) {
        let idx = match self.index.get(id) {
            Some(idx) => *idx,
            None => {
                self.nodes.push(FlatNode {
                    id: id.to_string(),
                    attrs: defaults.clone(),
                    cluster: None,
                });
                self.index.insert(id.to_string(), self.nodes.len() - 1);
                self.nodes.len() - 1
            }
        };
        let node = &mut self.nodes[idx];
        if let Some(attrs) = attrs {
            node.attrs.extend(attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if node.cluster.is_none() {
            if let Some(cluster) = cluster {
                node.cluster = Some(cluster);
                self.clusters[cluster].members.push(id.to_string());
            }
        }
    }
}

fn flatten(
    graph: &Graph,
    node_defaults: &Attrs,
    edge_defaults: &Attrs,
    cluster: Option<usize>,
    out: &mut Flattened,
) {
    let mut node_defaults = node_defaults.clone();
    node_defaults.extend(graph.node_attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
    let mut edge_defaults = edge_defaults.clone();
    edge_defaults.extend(graph.edge_attrs.iter().map(|(k, v)| (k.clone(), v.clone())));

    for node in &graph.nodes {
        out.touch(&node.id, &node_defaults, Some(&node.attrs), cluster);
    }
    for edge in &graph.edges {
        out.touch(&edge.from, &node_defaults, None, cluster);
        out.touch(&edge.to, &node_defaults, None, cluster);
        let mut attrs = edge_defaults.clone();
        attrs.extend(edge.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
        out.edges.push(FlatEdge {
            from: edge.from.clone(),
            to: edge.to.clone(),
            attrs,
        });
    }
    for sub in &graph.subgraphs {
        let sub_cluster = if sub.is_cluster() {
            out.clusters.push(FlatCluster {
                attrs: sub.graph_attrs.clone(),
                members: Vec::new(),
            });
            Some(out.clusters.len() - 1)
        } else {
            cluster
        };
        flatten(sub, &node_defaults, &edge_defaults, sub_cluster, out);
    }
}

pub fn compute_layout(graph: &Graph, theme: &Theme, config: &LayoutConfig) -> Layout {
    let direction = graph.direction();
    let mut flat = Flattened::default();
    flatten(graph, &Attrs::new(), &Attrs::new(), None, &mut flat);

    let mut nodes: BTreeMap<String, NodeLayout> = BTreeMap::new();
    for node in &flat.nodes {
        let raw_label = node.attrs.get("label").cloned().unwrap_or_else(|| node.id.clone());
        let shape = node
            .attrs
            .get("shape")
            .map(|s| NodeShape::from_token(s))
            .unwrap_or(NodeShape::Ellipse);
        let label = measure_label(&raw_label, theme, config);
        let (width, height) = node_size(shape, &label, config);
        let filled = node
            .attrs
            .get("style")
            .map(|s| s.contains("filled"))
            .unwrap_or(false);
        let fill = if filled {
            node.attrs
                .get("fillcolor")
                .or_else(|| node.attrs.get("color"))
                .cloned()
                .or_else(|| Some("lightgrey".to_string()))
        } else {
            None
        };
        nodes.insert(
            node.id.clone(),
            NodeLayout {
                id: node.id.clone(),
                x: 0.0,
                y: 0.0,
                width,
                height,
                label,
                shape,
                fill,
                stroke: node.attrs.get("color").cloned(),
                font_color: node.attrs.get("fontcolor").cloned(),
                dashed: node.attrs.get("style").map(|s| s.contains("dashed")).unwrap_or(false),
            },
        );
    }

    let node_ids: Vec<String> = flat.nodes.iter().map(|n| n.id.clone()).collect();
    let pairs: Vec<(String, String)> = flat
        .edges
        .iter()
        .map(|e| (e.from.clone(), e.to.clone()))
        .collect();
    let ranks = compute_ranks(&node_ids, &pairs);
    let max_rank = ranks.values().copied().max().unwrap_or(0);
    let mut rank_nodes: Vec<Vec<String>> = vec![Vec::new(); max_rank + 1];
    for id in &node_ids {
        let rank = *ranks.get(id).unwrap_or(&0);
        rank_nodes[rank].push(id.clone());
    }
    let node_order: HashMap<String, usize> = node_ids
        .iter()
        .enumerate()
        .map(|(idx, id)| (id.clone(), idx))
        .collect();
    order_rank_nodes(&mut rank_nodes, &pairs, &node_order);
    assign_positions(&rank_nodes, direction, config, &mut nodes);
    apply_direction_mirror(direction, &mut nodes);

    let mut clusters: Vec<ClusterLayout> = flat
        .clusters
        .iter()
        .filter(|c| !c.members.is_empty())
        .map(|c| cluster_box(c, &nodes, theme, config))
        .collect();

    let title = graph
        .label()
        .filter(|label| !label.trim().is_empty())
        .map(|label| measure_label(label, theme, config));
    let title_offset = title.as_ref().map(|t| t.height + 12.0).unwrap_or(0.0);
    normalize_layout(&mut nodes, &mut clusters, title_offset);

    let directed = graph.kind == GraphKind::Directed;
    let edges = flat
        .edges
        .iter()
        .filter_map(|edge| {
            let from = nodes.get(&edge.from)?;
            let to = nodes.get(&edge.to)?;
            let label = edge
                .attrs
                .get("label")
                .or_else(|| edge.attrs.get("xlabel"))
                .filter(|l| !l.trim().is_empty())
                .map(|l| measure_label(l, theme, config));
            let dir_none = edge.attrs.get("dir").map(|d| d == "none").unwrap_or(false);
            Some(EdgeLayout {
                from: edge.from.clone(),
                to: edge.to.clone(),
                label,
                points: route_edge(from, to),
                directed: directed && !dir_none,
                color: edge.attrs.get("color").cloned(),
                dashed: edge
                    .attrs
                    .get("style")
                    .map(|s| s.contains("dashed") || s.contains("dotted"))
                    .unwrap_or(false),
            })
        })
        .collect();

    let (mut width, height) = bounds(&nodes, &clusters);
    if let Some(title) = &title {
        width = width.max(title.width + 48.0);
    }

    Layout {
        direction,
        title,
        nodes,
        edges,
        clusters,
        width,
        height,
    }
}

fn label_lines(raw: &str) -> Vec<String> {
    let text = if raw.starts_with('<') && raw.ends_with('>') {
        let inner = &raw[1..raw.len() - 1];
        let inner = inner.replace("<br/>", "\n").replace("<BR/>", "\n").replace("<br>", "\n");
        HTML_TAG_RE.replace_all(&inner, "").into_owned()
    } else {
        raw.replace("\\n", "\n").replace("\\l", "\n").replace("\\r", "\n")
    };
    text.lines().map(|l| l.trim().to_string()).collect()
}

fn wrap_line(line: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || line.chars().count() <= max_chars {
        return vec![line.to_string()];
    }
    let mut out = Vec::new();
    let mut current = String::new();
    for word in line.split_whitespace() {
        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if needed > max_chars && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

pub fn measure_label(raw: &str, theme: &Theme, config: &LayoutConfig) -> TextBlock {
    let mut lines: Vec<String> = label_lines(raw)
        .iter()
        .flat_map(|line| wrap_line(line, config.max_label_width_chars))
        .collect();
    if lines.is_empty() {
        lines.push(String::new());
    }
    let char_width = theme.font_size * config.char_width_ratio;
    let widest = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) as f32;
    TextBlock {
        width: widest * char_width,
        height: lines.len() as f32 * theme.font_size * config.label_line_height,
        lines,
    }
}

fn node_size(shape: NodeShape, label: &TextBlock, config: &LayoutConfig) -> (f32, f32) {
    let base_w = label.width + config.node_padding_x * 2.0;
    let base_h = label.height + config.node_padding_y * 2.0;
    match shape {
        NodeShape::Circle | NodeShape::DoubleCircle => {
            let side = base_w.max(base_h);
            (side, side)
        }
        NodeShape::Diamond => (base_w * 1.5, base_h * 1.5),
        NodeShape::Ellipse => (base_w * 1.15, base_h * 1.1),
        NodeShape::Parallelogram | NodeShape::Hexagon => (base_w + base_h, base_h),
        NodeShape::PlainText => (label.width + 8.0, label.height + 8.0),
        _ => (base_w, base_h),
    }
}

fn compute_ranks(node_ids: &[String], edges: &[(String, String)]) -> HashMap<String, usize> {
    let mut indeg: HashMap<&str, usize> = node_ids.iter().map(|id| (id.as_str(), 0)).collect();
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();

    for (from, to) in edges {
        if from == to || !indeg.contains_key(from.as_str()) || !indeg.contains_key(to.as_str()) {
            continue;
        }
        adj.entry(from.as_str()).or_default().push(to.as_str());
        *indeg.entry(to.as_str()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = node_ids
        .iter()
        .map(|id| id.as_str())
        .filter(|id| indeg.get(id).copied() == Some(0))
        .collect();

    let mut order: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(node) = queue.pop_front() {
        order.push(node);
        seen.insert(node);
        if let Some(nexts) = adj.get(node) {
            for next in nexts {
                if let Some(deg) = indeg.get_mut(next) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 && !seen.contains(next) {
                        queue.push_back(*next);
                    }
                }
            }
        }
    }

    // Cycles leave nodes unvisited; append them in declaration order.
    for id in node_ids {
        if !seen.contains(id.as_str()) {
            seen.insert(id.as_str());
            order.push(id.as_str());
        }
    }

    let order_index: HashMap<&str, usize> =
        order.iter().enumerate().map(|(idx, id)| (*id, idx)).collect();

    let mut ranks: HashMap<String, usize> = HashMap::new();
    for node in &order {
        let rank = *ranks.get(*node).unwrap_or(&0);
        ranks.entry(node.to_string()).or_insert(rank);
        if let Some(nexts) = adj.get(node) {
            let from_idx = order_index[node];
            for next in nexts {
                let to_idx = order_index.get(next).copied().unwrap_or(from_idx);
                if to_idx <= from_idx {
                    continue;
                }
                let entry = ranks.entry(next.to_string()).or_insert(0);
                *entry = (*entry).max(rank + 1);
            }
        }
    }

    ranks
}

fn order_rank_nodes(
    rank_nodes: &mut [Vec<String>],
    edges: &[(String, String)],
    node_order: &HashMap<String, usize>,
) {
    if rank_nodes.len() <= 1 {
        return;
    }
    let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
    let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
    for (from, to) in edges {
        outgoing.entry(from.clone()).or_default().push(to.clone());
        incoming.entry(to.clone()).or_default().push(from.clone());
    }

    let mut positions: HashMap<String, usize> = HashMap::new();
    let update_positions = |rank_nodes: &mut [Vec<String>], positions: &mut HashMap<String, usize>| {
        positions.clear();
        for bucket in rank_nodes.iter() {
            for (idx, node_id) in bucket.iter().enumerate() {
                positions.insert(node_id.clone(), idx);
            }
        }
    };
    update_positions(rank_nodes, &mut positions);

    let sort_bucket = |bucket: &mut Vec<String>,
                       neighbors: &HashMap<String, Vec<String>>,
                       positions: &HashMap<String, usize>| {
        let current: HashMap<String, usize> = bucket
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.clone(), idx))
            .collect();
        bucket.sort_by(|a, b| {
            let a_score = barycenter(a, neighbors, positions, &current);
            let b_score = barycenter(b, neighbors, positions, &current);
            match a_score.partial_cmp(&b_score) {
                Some(std::cmp::Ordering::Equal) | None => node_order
                    .get(a)
                    .copied()
                    .unwrap_or(usize::MAX)
                    .cmp(&node_order.get(b).copied().unwrap_or(usize::MAX)),
                Some(ordering) => ordering,
            }
        });
    };

    for _ in 0..2 {
        for rank in 1..rank_nodes.len() {
            if rank_nodes[rank].len() <= 1 {
                continue;
            }
            sort_bucket(&mut rank_nodes[rank], &incoming, &positions);
            update_positions(rank_nodes, &mut positions);
        }
        for rank in (0..rank_nodes.len().saturating_sub(1)).rev() {
            if rank_nodes[rank].len() <= 1 {
                continue;
            }
            sort_bucket(&mut rank_nodes[rank], &outgoing, &positions);
            update_positions(rank_nodes, &mut positions);
        }
    }
}

fn barycenter(
    node_id: &str,
    neighbors: &HashMap<String, Vec<String>>,
    positions: &HashMap<String, usize>,
    current: &HashMap<String, usize>,
) -> f32 {
    let fallback = *current.get(node_id).unwrap_or(&0) as f32;
    let Some(list) = neighbors.get(node_id) else {
        return fallback;
    };
    let mut total = 0.0;
    let mut count = 0.0;
    for neighbor in list {
        if let Some(pos) = positions.get(neighbor) {
            total += *pos as f32;
            count += 1.0;
        }
    }
    if count == 0.0 { fallback } else { total / count }
}

fn assign_positions(
    rank_nodes: &[Vec<String>],
    direction: Direction,
    config: &LayoutConfig,
    nodes: &mut BTreeMap<String, NodeLayout>,
) {
    let horizontal = direction.is_horizontal();
    let cross_extent = |bucket: &Vec<String>, nodes: &BTreeMap<String, NodeLayout>| -> f32 {
        let sizes: Vec<f32> = bucket
            .iter()
            .filter_map(|id| nodes.get(id))
            .map(|n| if horizontal { n.height } else { n.width })
            .collect();
        let gaps = sizes.len().saturating_sub(1) as f32 * config.node_spacing;
        sizes.iter().sum::<f32>() + gaps
    };
    let widest = rank_nodes
        .iter()
        .map(|bucket| cross_extent(bucket, &*nodes))
        .fold(0.0_f32, f32::max);

    let mut main_cursor = 0.0;
    for bucket in rank_nodes {
        let mut cross_cursor = (widest - cross_extent(bucket, &*nodes)) / 2.0;
        let max_main = bucket
            .iter()
            .filter_map(|id| nodes.get(id))
            .map(|n| if horizontal { n.width } else { n.height })
            .fold(0.0_f32, f32::max);
        for node_id in bucket {
            if let Some(node) = nodes.get_mut(node_id) {
                if horizontal {
                    node.x = main_cursor + (max_main - node.width) / 2.0;
                    node.y = cross_cursor;
                    cross_cursor += node.height + config.node_spacing;
                } else {
                    node.x = cross_cursor;
                    node.y = main_cursor + (max_main - node.height) / 2.0;
                    cross_cursor += node.width + config.node_spacing;
                }
            }
        }
        main_cursor += max_main + config.rank_spacing;
    }
}

fn apply_direction_mirror(direction: Direction, nodes: &mut BTreeMap<String, NodeLayout>) {
    let max_x = nodes.values().map(|n| n.x + n.width).fold(0.0_f32, f32::max);
    let max_y = nodes.values().map(|n| n.y + n.height).fold(0.0_f32, f32::max);
    match direction {
        Direction::RightLeft => {
            for node in nodes.values_mut() {
                node.x = max_x - node.x - node.width;
            }
        }
        Direction::BottomTop => {
            for node in nodes.values_mut() {
                node.y = max_y - node.y - node.height;
            }
        }
        _ => {}
    }
}

fn cluster_box(
    cluster: &FlatCluster,
    nodes: &BTreeMap<String, NodeLayout>,
    theme: &Theme,
    config: &LayoutConfig,
) -> ClusterLayout {
    let mut min_x = f32::MAX;
    let mut min_y = f32::MAX;
    let mut max_x = f32::MIN;
    let mut max_y = f32::MIN;
    for id in &cluster.members {
        if let Some(node) = nodes.get(id) {
            min_x = min_x.min(node.x);
            min_y = min_y.min(node.y);
            max_x = max_x.max(node.x + node.width);
            max_y = max_y.max(node.y + node.height);
        }
    }
    let label = cluster
        .attrs
        .get("label")
        .filter(|l| !l.trim().is_empty())
        .map(|l| measure_label(l, theme, config));
    let label_height = if label.is_some() {
        config.cluster_label_height
    } else {
        0.0
    };
    let pad = config.cluster_padding;
    let mut width = max_x - min_x + pad * 2.0;
    if let Some(label) = &label {
        width = width.max(label.width + pad * 2.0);
    }
    let filled = cluster
        .attrs
        .get("style")
        .map(|s| s.contains("filled"))
        .unwrap_or(false);
    let fill = if filled {
        cluster
            .attrs
            .get("fillcolor")
            .or_else(|| cluster.attrs.get("color"))
            .cloned()
            .or_else(|| Some("lightgrey".to_string()))
    } else {
        cluster.attrs.get("bgcolor").cloned()
    };
    ClusterLayout {
        label,
        x: min_x - pad,
        y: min_y - pad - label_height,
        width,
        height: max_y - min_y + pad * 2.0 + label_height,
        fill,
        stroke: cluster.attrs.get("color").cloned(),
    }
}

fn normalize_layout(
    nodes: &mut BTreeMap<String, NodeLayout>,
    clusters: &mut [ClusterLayout],
    top_reserve: f32,
) {
    let mut min_x = f32::MAX;
    let mut min_y = f32::MAX;
    for node in nodes.values() {
        min_x = min_x.min(node.x);
        min_y = min_y.min(node.y);
    }
    for cluster in clusters.iter() {
        min_x = min_x.min(cluster.x);
        min_y = min_y.min(cluster.y);
    }
    if min_x == f32::MAX {
        return;
    }

    let padding = 24.0;
    let shift_x = padding - min_x;
    let shift_y = padding + top_reserve - min_y;

    for node in nodes.values_mut() {
        node.x += shift_x;
        node.y += shift_y;
    }
    for cluster in clusters.iter_mut() {
        cluster.x += shift_x;
        cluster.y += shift_y;
    }
}

fn center(node: &NodeLayout) -> (f32, f32) {
    (node.x + node.width / 2.0, node.y + node.height / 2.0)
}

/// Point where the ray from the node centre towards `target` leaves the
/// node's bounding box.
fn boundary_point(node: &NodeLayout, target: (f32, f32)) -> (f32, f32) {
    let (cx, cy) = center(node);
    let dx = target.0 - cx;
    let dy = target.1 - cy;
    if dx.abs() < f32::EPSILON && dy.abs() < f32::EPSILON {
        return (cx, cy);
    }
    let half_w = node.width / 2.0;
    let half_h = node.height / 2.0;
    let scale_x = if dx.abs() > f32::EPSILON { half_w / dx.abs() } else { f32::MAX };
    let scale_y = if dy.abs() > f32::EPSILON { half_h / dy.abs() } else { f32::MAX };
    let scale = scale_x.min(scale_y);
    (cx + dx * scale, cy + dy * scale)
}

fn route_edge(from: &NodeLayout, to: &NodeLayout) -> Vec<(f32, f32)> {
    if from.id == to.id {
        let right = from.x + from.width;
        let (_, cy) = center(from);
        let loop_w = 24.0;
        let dy = (from.height / 4.0).max(6.0);
        return vec![
            (right, cy - dy),
            (right + loop_w, cy - dy),
            (right + loop_w, cy + dy),
            (right, cy + dy),
        ];
    }
    let start = boundary_point(from, center(to));
    let end = boundary_point(to, center(from));
    vec![start, end]
}

fn bounds(nodes: &BTreeMap<String, NodeLayout>, clusters: &[ClusterLayout]) -> (f32, f32) {
    let mut max_x: f32 = 0.0;
    let mut max_y: f32 = 0.0;
    for node in nodes.values() {
        // Self loops stick out to the right.
        max_x = max_x.max(node.x + node.width + 24.0);
        max_y = max_y.max(node.y + node.height);
    }
    for cluster in clusters {
        max_x = max_x.max(cluster.x + cluster.width);
        max_y = max_y.max(cluster.y + cluster.height);
    }
    (max_x + 24.0, max_y + 24.0)
}
