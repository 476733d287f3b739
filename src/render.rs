use crate::config::{Config, LayoutConfig, RenderConfig};
use crate::dot::to_source;
use crate::ir::{Graph, NodeShape};
use crate::layout::{EdgeLayout, Layout, NodeLayout, TextBlock, compute_layout};
use crate::theme::Theme;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unsupported output format '{0}' (expected png or svg)")]
    UnsupportedFormat(String),
    #[error("PNG output requires the `png` feature")]
    PngDisabled,
    #[error("failed to rasterize diagram: {0}")]
    Raster(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Svg,
}

impl ImageFormat {
    pub fn from_name(name: &str) -> Result<Self, RenderError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "svg" => Ok(Self::Svg),
            other => Err(RenderError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Svg => "svg",
        }
    }
}

/// Files written by [`render_graph`]: the DOT source under the bare file
/// name and the image under `<name>.<format>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFiles {
    pub source: PathBuf,
    pub image: PathBuf,
}

pub fn image_path(stem: &Path, format: ImageFormat) -> PathBuf {
    let mut name = OsString::from(stem.as_os_str());
    name.push(".");
    name.push(format.extension());
    PathBuf::from(name)
}

pub fn render_graph(
    graph: &Graph,
    stem: &Path,
    format: ImageFormat,
    config: &Config,
) -> Result<RenderedFiles, RenderError> {
    std::fs::write(stem, to_source(graph))?;

    let layout = compute_layout(graph, &config.theme, &config.layout);
    let svg = render_svg(&layout, &config.theme, &config.layout);
    let image = image_path(stem, format);
    match format {
        ImageFormat::Svg => write_svg(&svg, &image)?,
        ImageFormat::Png => write_png(&svg, &image, &config.render)?,
    }
    log::info!("rendered {} and {}", stem.display(), image.display());
    Ok(RenderedFiles {
        source: stem.to_path_buf(),
        image,
    })
}

pub fn render_svg(layout: &Layout, theme: &Theme, config: &LayoutConfig) -> String {
    let mut svg = String::new();
    let width = layout.width.max(120.0);
    let height = layout.height.max(80.0);

    svg.push_str(&format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{width:.0}\" height=\"{height:.0}\" viewBox=\"0 0 {width:.2} {height:.2}\">",
    ));
    svg.push_str(&format!(
        "<rect width=\"100%\" height=\"100%\" fill=\"{}\"/>",
        escape_xml(&theme.background)
    ));
    svg.push_str("<defs>");
    svg.push_str(&format!(
        "<marker id=\"arrow\" viewBox=\"0 0 10 10\" refX=\"10\" refY=\"5\" markerWidth=\"8\" markerHeight=\"8\" orient=\"auto-start-reverse\"><path d=\"M 0 0 L 10 5 L 0 10 z\" fill=\"{}\"/></marker>",
        escape_xml(&theme.line_color)
    ));
    svg.push_str("</defs>");

    if let Some(title) = &layout.title {
        svg.push_str(&text_block_svg(width / 2.0, 12.0 + title.height / 2.0, title, &theme.node_text_color, theme, config));
    }

    for cluster in &layout.clusters {
        svg.push_str(&format!(
            "<rect x=\"{:.2}\" y=\"{:.2}\" width=\"{:.2}\" height=\"{:.2}\" fill=\"{}\" stroke=\"{}\" stroke-width=\"1\"/>",
            cluster.x,
            cluster.y,
            cluster.width,
            cluster.height,
            escape_xml(cluster.fill.as_deref().unwrap_or(&theme.cluster_background)),
            escape_xml(cluster.stroke.as_deref().unwrap_or(&theme.cluster_border)),
        ));
        if let Some(label) = &cluster.label {
            let label_y = cluster.y + 6.0 + label.height / 2.0;
            svg.push_str(&text_block_svg(
                cluster.x + cluster.width / 2.0,
                label_y,
                label,
                &theme.cluster_text_color,
                theme,
                config,
            ));
        }
    }

    let label_positions = compute_edge_label_positions(&layout.edges);
    for (idx, edge) in layout.edges.iter().enumerate() {
        let d = points_to_path(&edge.points);
        let marker = if edge.directed { " marker-end=\"url(#arrow)\"" } else { "" };
        let dash = if edge.dashed { " stroke-dasharray=\"5 4\"" } else { "" };
        svg.push_str(&format!(
            "<path d=\"{}\" fill=\"none\" stroke=\"{}\" stroke-width=\"1.2\"{}{} />",
            d,
            escape_xml(edge.color.as_deref().unwrap_or(&theme.line_color)),
            dash,
            marker
        ));
        if let Some((x, y, label)) = label_positions.get(&idx) {
            svg.push_str(&format!(
                "<rect x=\"{:.2}\" y=\"{:.2}\" width=\"{:.2}\" height=\"{:.2}\" fill=\"{}\" fill-opacity=\"0.85\"/>",
                x - label.width / 2.0 - 3.0,
                y - label.height / 2.0 - 2.0,
                label.width + 6.0,
                label.height + 4.0,
                escape_xml(&theme.background)
            ));
            svg.push_str(&text_block_svg(*x, *y, label, &theme.edge_label_color, theme, config));
        }
    }

    for node in layout.nodes.values() {
        svg.push_str(&node_shape_svg(node, theme));
        let (cx, cy) = (node.x + node.width / 2.0, node.y + node.height / 2.0);
        let color = node.font_color.as_deref().unwrap_or(&theme.node_text_color);
        svg.push_str(&text_block_svg(cx, cy, &node.label, color, theme, config));
    }

    svg.push_str("</svg>");
    svg
}

fn node_shape_svg(node: &NodeLayout, theme: &Theme) -> String {
    let fill = escape_xml(node.fill.as_deref().unwrap_or(&theme.node_fill));
    let stroke = escape_xml(node.stroke.as_deref().unwrap_or(&theme.node_border_color));
    let dash = if node.dashed { " stroke-dasharray=\"5 4\"" } else { "" };
    let paint = format!("fill=\"{fill}\" stroke=\"{stroke}\" stroke-width=\"1.2\"{dash}");
    let (x, y, w, h) = (node.x, node.y, node.width, node.height);
    let (cx, cy) = (x + w / 2.0, y + h / 2.0);
    match node.shape {
        NodeShape::Ellipse => format!(
            "<ellipse cx=\"{cx:.2}\" cy=\"{cy:.2}\" rx=\"{:.2}\" ry=\"{:.2}\" {paint}/>",
            w / 2.0,
            h / 2.0
        ),
        NodeShape::Circle => format!(
            "<circle cx=\"{cx:.2}\" cy=\"{cy:.2}\" r=\"{:.2}\" {paint}/>",
            w / 2.0
        ),
        NodeShape::DoubleCircle => format!(
            "<circle cx=\"{cx:.2}\" cy=\"{cy:.2}\" r=\"{:.2}\" {paint}/><circle cx=\"{cx:.2}\" cy=\"{cy:.2}\" r=\"{:.2}\" fill=\"none\" stroke=\"{stroke}\" stroke-width=\"1.2\"/>",
            w / 2.0,
            (w / 2.0 - 4.0).max(1.0)
        ),
        NodeShape::Diamond => polygon(&[(cx, y), (x + w, cy), (cx, y + h), (x, cy)], &paint),
        NodeShape::Parallelogram => {
            let skew = h / 2.0;
            polygon(&[(x + skew, y), (x + w, y), (x + w - skew, y + h), (x, y + h)], &paint)
        }
        NodeShape::Hexagon => {
            let inset = h / 2.0;
            polygon(
                &[(x + inset, y), (x + w - inset, y), (x + w, cy), (x + w - inset, y + h), (x + inset, y + h), (x, cy)],
                &paint,
            )
        }
        NodeShape::Cylinder => {
            let ry = (h * 0.12).max(3.0);
            format!(
                "<path d=\"M {x:.2} {:.2} A {:.2} {ry:.2} 0 0 1 {:.2} {:.2} L {:.2} {:.2} A {:.2} {ry:.2} 0 0 1 {x:.2} {:.2} Z\" {paint}/><path d=\"M {x:.2} {:.2} A {:.2} {ry:.2} 0 0 0 {:.2} {:.2}\" fill=\"none\" stroke=\"{stroke}\" stroke-width=\"1.2\"/>",
                y + ry,
                w / 2.0,
                x + w,
                y + ry,
                x + w,
                y + h - ry,
                w / 2.0,
                y + h - ry,
                y + ry,
                w / 2.0,
                x + w,
                y + ry,
            )
        }
        NodeShape::Note => {
            let fold = 10.0_f32.min(w / 4.0);
            polygon(&[(x, y), (x + w - fold, y), (x + w, y + fold), (x + w, y + h), (x, y + h)], &paint)
        }
        NodeShape::RoundBox => format!(
            "<rect x=\"{x:.2}\" y=\"{y:.2}\" width=\"{w:.2}\" height=\"{h:.2}\" rx=\"8\" ry=\"8\" {paint}/>"
        ),
        NodeShape::Box => format!(
            "<rect x=\"{x:.2}\" y=\"{y:.2}\" width=\"{w:.2}\" height=\"{h:.2}\" {paint}/>"
        ),
        NodeShape::PlainText => String::new(),
    }
}

fn polygon(points: &[(f32, f32)], paint: &str) -> String {
    let pts: Vec<String> = points.iter().map(|(x, y)| format!("{x:.2},{y:.2}")).collect();
    format!("<polygon points=\"{}\" {paint}/>", pts.join(" "))
}

fn points_to_path(points: &[(f32, f32)]) -> String {
    if points.is_empty() {
        return String::new();
    }
    let mut d = String::new();
    d.push_str(&format!("M {:.2} {:.2}", points[0].0, points[0].1));
    for point in points.iter().skip(1) {
        d.push_str(&format!(" L {:.2} {:.2}", point.0, point.1));
    }
    d
}

fn text_block_svg(x: f32, y: f32, label: &TextBlock, fill: &str, theme: &Theme, config: &LayoutConfig) -> String {
    let line_height = theme.font_size * config.label_line_height;
    let total_height = label.lines.len() as f32 * line_height;
    let start_y = y - total_height / 2.0 + theme.font_size;
    let mut text = String::new();

    text.push_str(&format!(
        "<text x=\"{x:.2}\" y=\"{start_y:.2}\" text-anchor=\"middle\" font-family=\"{}\" font-size=\"{}\" fill=\"{}\">",
        escape_xml(&theme.font_family),
        theme.font_size,
        escape_xml(fill)
    ));
    for (idx, line) in label.lines.iter().enumerate() {
        let dy = if idx == 0 { 0.0 } else { line_height };
        text.push_str(&format!("<tspan x=\"{x:.2}\" dy=\"{dy:.2}\">{}</tspan>", escape_xml(line)));
    }
    text.push_str("</text>");
    text
}

fn compute_edge_label_positions(edges: &[EdgeLayout]) -> HashMap<usize, (f32, f32, TextBlock)> {
    let mut occupied: Vec<(f32, f32, f32, f32)> = Vec::new();
    let mut positions = HashMap::new();

    for (idx, edge) in edges.iter().enumerate() {
        let Some(label) = edge.label.clone() else {
            continue;
        };
        let (mid_x, mid_y) = edge_midpoint(edge);
        let mut offset = 0.0;
        let mut placed = None;

        for _ in 0..6 {
            let x = mid_x + label.width / 2.0 + 6.0;
            let y = mid_y + offset;
            let rect = (
                x - label.width / 2.0 - 3.0,
                y - label.height / 2.0 - 2.0,
                label.width + 6.0,
                label.height + 4.0,
            );
            if !collides(&rect, &occupied) {
                occupied.push(rect);
                placed = Some((x, y, label.clone()));
                break;
            }
            offset += label.height + 4.0;
        }

        positions.insert(idx, placed.unwrap_or((mid_x, mid_y, label)));
    }

    positions
}

fn edge_midpoint(edge: &EdgeLayout) -> (f32, f32) {
    match edge.points.as_slice() {
        [] => (0.0, 0.0),
        [only] => *only,
        points => {
            let first = points[0];
            let last = points[points.len() - 1];
            ((first.0 + last.0) / 2.0, (first.1 + last.1) / 2.0)
        }
    }
}

fn collides(rect: &(f32, f32, f32, f32), occupied: &[(f32, f32, f32, f32)]) -> bool {
    occupied.iter().any(|(x, y, w, h)| {
        rect.0 < x + w && rect.0 + rect.2 > *x && rect.1 < y + h && rect.1 + rect.3 > *y
    })
}

pub fn write_svg(svg: &str, output: &Path) -> Result<(), RenderError> {
    std::fs::write(output, svg)?;
    Ok(())
}

#[cfg(feature = "png")]
pub fn write_png(svg: &str, output: &Path, render_cfg: &RenderConfig) -> Result<(), RenderError> {
    let mut opt = usvg::Options::default();
    opt.fontdb_mut().load_system_fonts();
    opt.default_size = usvg::Size::from_wh(render_cfg.width, render_cfg.height)
        .ok_or_else(|| RenderError::Raster("invalid default size".to_string()))?;

    let tree = usvg::Tree::from_str(svg, &opt).map_err(|e| RenderError::Raster(e.to_string()))?;
    let size = tree.size().to_int_size();
    let mut pixmap = resvg::tiny_skia::Pixmap::new(size.width(), size.height())
        .ok_or_else(|| RenderError::Raster("failed to allocate pixmap".to_string()))?;
    if let Some(color) = parse_hex_color(&render_cfg.background) {
        pixmap.fill(color);
    }

    let mut pixmap_mut = pixmap.as_mut();
    resvg::render(&tree, resvg::tiny_skia::Transform::default(), &mut pixmap_mut);
    pixmap
        .save_png(output)
        .map_err(|e| RenderError::Raster(e.to_string()))?;
    Ok(())
}

#[cfg(not(feature = "png"))]
pub fn write_png(_svg: &str, _output: &Path, _render_cfg: &RenderConfig) -> Result<(), RenderError> {
    Err(RenderError::PngDisabled)
}

#[cfg(feature = "png")]
fn parse_hex_color(value: &str) -> Option<resvg::tiny_skia::Color> {
    let hex = value.trim().strip_prefix('#')?;
    if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some(resvg::tiny_skia::Color::from_rgba8(r, g, b, 255))
}

fn escape_xml(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
