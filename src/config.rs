use crate::theme::Theme;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SUPPORTED_FILE_TYPES: [&str; 12] = [
    ".py", ".js", ".html", ".css", ".c", ".cpp", ".java", ".php", ".rb", ".ts", ".txt", ".md",
];

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a software development expert who is helping write code documentation for different audiences";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub node_spacing: f32,
    pub rank_spacing: f32,
    pub node_padding_x: f32,
    pub node_padding_y: f32,
    pub label_line_height: f32,
    pub max_label_width_chars: usize,
    pub char_width_ratio: f32,
    pub cluster_padding: f32,
    pub cluster_label_height: f32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            node_spacing: 36.0,
            rank_spacing: 50.0,
            node_padding_x: 24.0,
            node_padding_y: 12.0,
            label_line_height: 1.3,
            max_label_width_chars: 24,
            char_width_ratio: 0.56,
            cluster_padding: 16.0,
            cluster_label_height: 22.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    pub width: f32,
    pub height: f32,
    pub background: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 1200.0,
            height: 800.0,
            background: "#FFFFFF".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub api_base: String,
    pub model: String,
    pub temperature: f32,
    pub system_prompt: String,
    pub context_char_budget: usize,
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            temperature: 0.0,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            context_char_budget: 120_000,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub api_base: String,
    pub file_types: Vec<String>,
    pub default_branch: String,
    pub max_file_bytes: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            file_types: vec![".py".to_string()],
            default_branch: "main".to_string(),
            max_file_bytes: 512 * 1024,
        }
    }
}

/// Execution budget for diagram scripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptLimits {
    pub max_statements: usize,
    pub max_loop_iterations: usize,
    pub max_nodes: usize,
    /// Largest value a script may build: string bytes plus container items.
    pub max_value_len: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_statements: 10_000,
            max_loop_iterations: 10_000,
            max_nodes: 500,
            max_value_len: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub wkhtmltopdf: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            wkhtmltopdf: PathBuf::from("wkhtmltopdf"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub theme: Theme,
    pub layout: LayoutConfig,
    pub render: RenderConfig,
    pub chat: ChatConfig,
    pub repository: RepositoryConfig,
    pub script: ScriptLimits,
    pub export: ExportConfig,
}

impl Default for Config {
    fn default() -> Self {
        let theme = Theme::graphviz_default();
        let render = RenderConfig {
            background: theme.background.clone(),
            ..Default::default()
        };
        Self {
            theme,
            layout: LayoutConfig::default(),
            render,
            chat: ChatConfig::default(),
            repository: RepositoryConfig::default(),
            script: ScriptLimits::default(),
            export: ExportConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThemeVariables {
    font_family: Option<String>,
    font_size: Option<f32>,
    node_fill: Option<String>,
    node_text_color: Option<String>,
    node_border_color: Option<String>,
    line_color: Option<String>,
    cluster_background: Option<String>,
    cluster_border: Option<String>,
    background: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatConfigFile {
    api_base: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    system_prompt: Option<String>,
    context_char_budget: Option<usize>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryConfigFile {
    api_base: Option<String>,
    file_types: Option<Vec<String>>,
    default_branch: Option<String>,
    max_file_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptLimitsFile {
    max_statements: Option<usize>,
    max_loop_iterations: Option<usize>,
    max_nodes: Option<usize>,
    max_value_len: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    theme: Option<String>,
    theme_variables: Option<ThemeVariables>,
    width: Option<f32>,
    height: Option<f32>,
    chat: Option<ChatConfigFile>,
    repository: Option<RepositoryConfigFile>,
    script: Option<ScriptLimitsFile>,
    wkhtmltopdf: Option<PathBuf>,
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let parsed: ConfigFile = match serde_json::from_str(contents) {
        Ok(parsed) => parsed,
        Err(json_err) => json5::from_str(contents)
            .map_err(|_| anyhow::anyhow!("invalid config file: {json_err}"))?,
    };

    let mut config = Config::default();

    if let Some(theme_name) = parsed.theme.as_deref() {
        config.theme = Theme::by_name(theme_name)
            .ok_or_else(|| anyhow::anyhow!("unknown theme '{theme_name}'"))?;
        config.render.background = config.theme.background.clone();
    }

    if let Some(vars) = parsed.theme_variables {
        if let Some(v) = vars.font_family {
            config.theme.font_family = v;
        }
        if let Some(v) = vars.font_size {
            config.theme.font_size = v;
        }
        if let Some(v) = vars.node_fill {
            config.theme.node_fill = v;
        }
        if let Some(v) = vars.node_text_color {
            config.theme.node_text_color = v;
        }
        if let Some(v) = vars.node_border_color {
            config.theme.node_border_color = v;
        }
        if let Some(v) = vars.line_color {
            config.theme.edge_label_color = v.clone();
            config.theme.line_color = v;
        }
        if let Some(v) = vars.cluster_background {
            config.theme.cluster_background = v;
        }
        if let Some(v) = vars.cluster_border {
            config.theme.cluster_border = v;
        }
        if let Some(v) = vars.background {
            config.render.background = v.clone();
            config.theme.background = v;
        }
    }

    if let Some(v) = parsed.width {
        config.render.width = v;
    }
    if let Some(v) = parsed.height {
        config.render.height = v;
    }

    if let Some(chat) = parsed.chat {
        if let Some(v) = chat.api_base {
            config.chat.api_base = v;
        }
        if let Some(v) = chat.model {
            config.chat.model = v;
        }
        if let Some(v) = chat.temperature {
            config.chat.temperature = v;
        }
        if let Some(v) = chat.system_prompt {
            config.chat.system_prompt = v;
        }
        if let Some(v) = chat.context_char_budget {
            config.chat.context_char_budget = v;
        }
        if let Some(v) = chat.timeout_secs {
            config.chat.timeout_secs = v;
        }
    }

    if let Some(repo) = parsed.repository {
        if let Some(v) = repo.api_base {
            config.repository.api_base = v;
        }
        if let Some(v) = repo.file_types {
            config.repository.file_types = validate_file_types(&v)?;
        }
        if let Some(v) = repo.default_branch {
            config.repository.default_branch = v;
        }
        if let Some(v) = repo.max_file_bytes {
            config.repository.max_file_bytes = v;
        }
    }

    if let Some(script) = parsed.script {
        if let Some(v) = script.max_statements {
            config.script.max_statements = v;
        }
        if let Some(v) = script.max_loop_iterations {
            config.script.max_loop_iterations = v;
        }
        if let Some(v) = script.max_nodes {
            config.script.max_nodes = v;
        }
        if let Some(v) = script.max_value_len {
            config.script.max_value_len = v;
        }
    }

    if let Some(v) = parsed.wkhtmltopdf {
        config.export.wkhtmltopdf = v;
    }

    Ok(config)
}

/// Normalises a file-type selection (adding a missing leading dot) and
/// rejects anything outside [`SUPPORTED_FILE_TYPES`].
pub fn validate_file_types(types: &[String]) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::with_capacity(types.len());
    for raw in types {
        let trimmed = raw.trim();
        let normalized = if trimmed.starts_with('.') {
            trimmed.to_string()
        } else {
            format!(".{trimmed}")
        };
        if !SUPPORTED_FILE_TYPES.contains(&normalized.as_str()) {
            anyhow::bail!(
                "unsupported file type '{raw}' (expected one of {})",
                SUPPORTED_FILE_TYPES.join(", ")
            );
        }
        if !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    if out.is_empty() {
        anyhow::bail!("at least one file type must be selected");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.chat.model, "gpt-4");
        assert_eq!(config.repository.file_types, vec![".py".to_string()]);
        assert_eq!(config.repository.default_branch, "main");
    }

    #[test]
    fn json_overrides_defaults() {
        let config = parse_config(
            r#"{
                "theme": "modern",
                "themeVariables": { "fontSize": 18 },
                "chat": { "model": "gpt-3.5-turbo", "temperature": 0.2 },
                "repository": { "fileTypes": ["py", ".md"] },
                "script": { "maxNodes": 40, "maxValueLen": 2048 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.theme.font_size, 18.0);
        assert_eq!(config.theme.node_fill, Theme::modern().node_fill);
        assert_eq!(config.chat.model, "gpt-3.5-turbo");
        assert_eq!(config.repository.file_types, vec![".py", ".md"]);
        assert_eq!(config.script.max_nodes, 40);
        assert_eq!(config.script.max_value_len, 2048);
        assert_eq!(config.script.max_statements, 10_000);
    }

    #[test]
    fn accepts_json5_syntax() {
        let config = parse_config("{ chat: { model: 'gpt-4-1106-preview' }, // trailing\n }").unwrap();
        assert_eq!(config.chat.model, "gpt-4-1106-preview");
    }

    #[test]
    fn rejects_unknown_file_type() {
        assert!(validate_file_types(&[".exe".to_string()]).is_err());
        assert!(validate_file_types(&[]).is_err());
    }

    #[test]
    fn rejects_unknown_theme() {
        assert!(parse_config(r#"{ "theme": "neon" }"#).is_err());
    }
}
