//! Turns a free-form model answer into a runnable diagram script.
//!
//! The rewriting here is a plain text transform, not a parser: the call
//! stripping only understands single-line `dot.save(...)`, `dot.render(...)`
//! and `dot.view(...)` calls on a receiver literally named `dot`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```(.*?)```").unwrap());
static LOCAL_RENDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"dot\.(save|render|view)\(.*?\)").unwrap());

pub const LANGUAGE_TAG: &str = "python";
pub const SETUP_MARKER: &str = "bash";
pub const HEADER_TITLE: &str = "Flowchart Diagram";
pub const IMAGE_STEM: &str = "flowchart";
pub const CHART_DISPLAY_CALL: &str = "st.graphviz_chart(dot, use_container_width=True)";
pub const CHART_STATE_KEY: &str = "dot";

/// Executable text derived from exactly one fenced block of a model answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagramScript(String);

impl DiagramScript {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for DiagramScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DiagramScript {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Returns the contents of every fenced block, in order of appearance.
pub fn code_blocks(response: &str) -> Vec<&str> {
    FENCE_RE
        .captures_iter(response)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}

/// Picks the block to turn into a script. A first block mentioning `bash`
/// anywhere is taken to be install instructions and skipped in favour of the
/// second one.
pub fn select_block<'a>(blocks: &[&'a str]) -> Option<&'a str> {
    match blocks {
        [] => None,
        [only] => Some(only),
        [first, second, ..] if first.contains(SETUP_MARKER) => Some(second),
        [first, ..] => Some(first),
    }
}

/// Extracts and rewrites the diagram script from a model answer. `None` means
/// the answer held no fenced block at all.
pub fn extract(response: &str) -> Option<DiagramScript> {
    let blocks = code_blocks(response);
    log::debug!("found {} fenced block(s) in model response", blocks.len());
    select_block(&blocks).map(process_block)
}

pub fn process_block(block: &str) -> DiagramScript {
    let block = block.replace(LANGUAGE_TAG, "");
    let block = block.trim();
    let block = LOCAL_RENDER_RE.replace_all(block, "");

    let mut script = String::with_capacity(block.len() + 256);
    script.push_str("st.write(\"\")\n");
    script.push_str(&format!("st.header(\"{HEADER_TITLE}\")\n"));
    script.push_str(&block);

    script.push_str(&format!("\nimage_filename = '{IMAGE_STEM}'"));
    script.push_str("\ndot.format = 'png'");
    script.push_str("\ndot.render(filename=image_filename, view=False)");

    DiagramScript(append_chart_display(script))
}

/// Appends the chart display and session-state store lines unless the
/// display call is already present.
pub fn append_chart_display(mut script: String) -> String {
    if !script.contains(CHART_DISPLAY_CALL) {
        script.push('\n');
        script.push_str(CHART_DISPLAY_CALL);
        script.push_str(&format!("\nst.session_state.{CHART_STATE_KEY} = dot"));
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_fence_yields_nothing() {
        assert_eq!(extract(""), None);
        assert_eq!(extract("Here is a diagram: dot = Digraph()"), None);
        assert_eq!(extract("only one ``` marker"), None);
    }

    #[test]
    fn single_block_is_rewritten() {
        let script = extract("```python\ndot = Digraph()\ndot.render('x')\n```").unwrap();
        let text = script.as_str();
        assert!(text.starts_with("st.write(\"\")\nst.header(\"Flowchart Diagram\")\n"));
        assert!(!text.contains("dot.render('x')"));
        assert!(!text.contains("python"));
        assert!(text.contains("image_filename = 'flowchart'"));
        assert!(text.contains("dot.format = 'png'"));
        assert!(text.contains("dot.render(filename=image_filename, view=False)"));
        assert!(text.contains(CHART_DISPLAY_CALL));
        assert!(text.ends_with("st.session_state.dot = dot"));
    }

    #[test]
    fn exact_output_for_single_block() {
        let script = extract("```python\ndot = Digraph()\n```").unwrap();
        assert_eq!(
            script.as_str(),
            "st.write(\"\")\n\
             st.header(\"Flowchart Diagram\")\n\
             dot = Digraph()\n\
             image_filename = 'flowchart'\n\
             dot.format = 'png'\n\
             dot.render(filename=image_filename, view=False)\n\
             st.graphviz_chart(dot, use_container_width=True)\n\
             st.session_state.dot = dot"
        );
    }

    #[test]
    fn bash_first_block_is_skipped() {
        let response = "Install:\n```bash\npip install graphviz\n```\nThen:\n```python\ndot = Digraph() # SECOND\n```";
        let text = extract(response).unwrap().into_string();
        assert!(text.contains("SECOND"));
        assert!(!text.contains("pip install"));
    }

    #[test]
    fn first_block_wins_without_bash() {
        let response = "```python\ndot = Digraph() # FIRST\n```\n```python\ndot = Digraph() # SECOND\n```";
        let text = extract(response).unwrap().into_string();
        assert!(text.contains("FIRST"));
        assert!(!text.contains("SECOND"));
    }

    #[test]
    fn bash_heuristic_is_substring_based() {
        // The word appearing in a comment is enough to skip the first block.
        let response = "```\n# not a bashful diagram\ndot = Digraph() # FIRST\n```\n```\ndot = Digraph() # SECOND\n```";
        let text = extract(response).unwrap().into_string();
        assert!(text.contains("SECOND"));
    }

    #[test]
    fn single_bash_block_is_still_used() {
        let text = extract("```bash\npip install graphviz\n```").unwrap().into_string();
        assert!(text.contains("pip install graphviz"));
    }

    #[test]
    fn python_is_removed_everywhere() {
        let text = extract("```python\ndot = Digraph(comment='python flow')\n```")
            .unwrap()
            .into_string();
        assert!(text.contains("dot = Digraph(comment=' flow')"));
    }

    #[test]
    fn strips_every_local_render_call() {
        let block = "dot = Digraph()\ndot.save('a.gv')\ndot.view()\ndot.render('out', format='png')";
        let text = process_block(block).into_string();
        assert!(!text.contains("dot.save"));
        assert!(!text.contains("dot.view"));
        assert!(!text.contains("'out'"));
        assert_eq!(text.matches("dot.render(").count(), 1);
    }

    #[test]
    fn existing_display_call_is_not_duplicated() {
        let block = "dot = Digraph()\nst.graphviz_chart(dot, use_container_width=True)";
        let text = process_block(block).into_string();
        assert_eq!(text.matches(CHART_DISPLAY_CALL).count(), 1);
        assert!(!text.contains("st.session_state.dot = dot"));
    }

    #[test]
    fn display_append_is_idempotent() {
        let once = append_chart_display("dot = Digraph()".to_string());
        let twice = append_chart_display(once.clone());
        assert_eq!(once, twice);

        let script = extract("```\ndot = Digraph()\n```").unwrap().into_string();
        assert_eq!(append_chart_display(script.clone()), script);
    }

    #[test]
    fn selection_follows_block_order() {
        assert_eq!(select_block(&[]), None);
        assert_eq!(select_block(&["a"]), Some("a"));
        assert_eq!(select_block(&["bash x", "b", "c"]), Some("b"));
        assert_eq!(select_block(&["a", "bash", "c"]), Some("a"));
    }
}
