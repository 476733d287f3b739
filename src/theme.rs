use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Theme {
    pub font_family: String,
    pub font_size: f32,
    pub node_fill: String,
    pub node_text_color: String,
    pub node_border_color: String,
    pub line_color: String,
    pub edge_label_color: String,
    pub cluster_background: String,
    pub cluster_border: String,
    pub cluster_text_color: String,
    pub background: String,
}

impl Theme {
    /// Black-on-white, close to what the `dot` tool produces.
    pub fn graphviz_default() -> Self {
        Self {
            font_family: "Times New Roman, Times, serif".to_string(),
            font_size: 14.0,
            node_fill: "none".to_string(),
            node_text_color: "#000000".to_string(),
            node_border_color: "#000000".to_string(),
            line_color: "#000000".to_string(),
            edge_label_color: "#000000".to_string(),
            cluster_background: "none".to_string(),
            cluster_border: "#000000".to_string(),
            cluster_text_color: "#000000".to_string(),
            background: "#FFFFFF".to_string(),
        }
    }

    pub fn modern() -> Self {
        Self {
            font_family: "Inter, Segoe UI, system-ui, -apple-system, sans-serif".to_string(),
            font_size: 13.0,
            node_fill: "#F8FAFF".to_string(),
            node_text_color: "#1C2430".to_string(),
            node_border_color: "#C7D2E5".to_string(),
            line_color: "#7A8AA6".to_string(),
            edge_label_color: "#1C2430".to_string(),
            cluster_background: "#F7FAFF".to_string(),
            cluster_border: "#D7E0F0".to_string(),
            cluster_text_color: "#1C2430".to_string(),
            background: "#FFFFFF".to_string(),
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "modern" => Some(Self::modern()),
            "graphviz" | "default" | "base" => Some(Self::graphviz_default()),
            _ => None,
        }
    }
}
