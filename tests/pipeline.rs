use gitdoc::config::Config;
use gitdoc::export::{cleanup, report_html};
use gitdoc::script::{DisplayItem, ScriptError};
use gitdoc::{ScriptRunner, extract};

const ANSWER: &str = r#"Sure! First install the package:

```bash
pip install graphviz
```

Then build the chart:

```python
import graphviz

dot = graphviz.Digraph(comment='Request flow', graph_attr={'rankdir': 'LR'})
dot.attr('node', shape='box', style='rounded')

steps = [('url', 'Parse URL'), ('load', 'Load files'), ('chat', 'Ask model'), ('pdf', 'Export PDF')]
for key, label in steps:
    dot.node(key, label)

dot.edges([('url', 'load'), ('load', 'chat')])
dot.edge('chat', 'pdf', label='on request')

with dot.subgraph(name='cluster_model') as c:
    c.attr(label='Model', color='grey')
    c.node('chat')

dot.render('request_flow', view=True)
```

The diagram above shows the main flow."#;

#[test]
fn one_block_scenario() {
    let script = extract("```python\ndot = Digraph()\ndot.render('x')\n```").unwrap();
    let text = script.as_str();
    assert!(text.contains("st.header(\"Flowchart Diagram\")"));
    assert!(!text.contains("dot.render('x')"));
    assert!(text.contains("st.graphviz_chart(dot, use_container_width=True)"));
    assert!(text.contains("image_filename = 'flowchart'"));
    assert!(text.contains("dot.render(filename=image_filename, view=False)"));
}

#[test]
fn install_block_scenario() {
    let script = extract("```bash\npip install graphviz\n```\n```python\ndot = Digraph()\n```").unwrap();
    assert!(script.as_str().contains("dot = Digraph()"));
    assert!(!script.as_str().contains("pip install"));
}

#[test]
fn unimported_constructor_is_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let script = extract("```python\ndot = Digraph()\ndot.render('x')\n```").unwrap();
    let err = ScriptRunner::new(dir.path(), Config::default())
        .run(&script)
        .unwrap_err();
    assert!(matches!(err, ScriptError::UndefinedName { line: 3, .. }), "{err}");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn answer_renders_and_exports() {
    let dir = tempfile::tempdir().unwrap();
    let script = extract(ANSWER).unwrap();
    assert!(!script.as_str().contains("request_flow"));

    let execution = match ScriptRunner::new(dir.path(), Config::default()).run(&script) {
        Ok(execution) => execution,
        Err(ScriptError::Render { .. }) if !cfg!(feature = "png") => return,
        Err(err) => panic!("script failed: {err}"),
    };

    let graph = execution.state_graph("dot").unwrap();
    assert_eq!(graph.comment.as_deref(), Some("Request flow"));
    assert_eq!(graph.graph_attrs["rankdir"], "LR");
    assert_eq!(graph.nodes.len(), 4);
    assert_eq!(graph.edges.len(), 3);
    assert_eq!(graph.subgraphs[0].label(), Some("Model"));
    assert!(matches!(execution.displays.last(), Some(DisplayItem::Chart(chart)) if chart == graph));

    let source_path = dir.path().join("flowchart");
    let image_path = dir.path().join("flowchart.png");
    let source = std::fs::read_to_string(&source_path).unwrap();
    assert!(source.starts_with("// Request flow\ndigraph {"));
    assert!(source.contains("subgraph cluster_model {"));
    let png = std::fs::read(&image_path).unwrap();
    assert_eq!(&png[..4], &[0x89, b'P', b'N', b'G']);

    let html = report_html("# Docs\n\nGenerated.", Some(&image_path)).unwrap();
    assert!(html.starts_with("<h1>Docs</h1>"));
    assert!(html.contains("data:image/png;base64,iVBORw0KGgo"));

    cleanup(&[image_path.clone(), source_path.clone()]).unwrap();
    assert!(!image_path.exists());
    assert!(!source_path.exists());
}
