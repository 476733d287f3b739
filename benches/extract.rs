use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use gitdoc::config::Config;
use gitdoc::dot::to_source;
use gitdoc::extract::extract;
use gitdoc::ir::{Attrs, Graph, GraphKind};
use gitdoc::layout::compute_layout;
use gitdoc::render::render_svg;
use gitdoc::script::ScriptRunner;
use std::hint::black_box;

fn answer(steps: usize) -> String {
    let mut out = String::from("Install first:\n```bash\npip install graphviz\n```\nThen:\n```python\nimport graphviz\n\n");
    out.push_str("dot = graphviz.Digraph(comment='Pipeline')\ndot.attr(rankdir='LR')\n");
    out.push_str("steps = [");
    for i in 0..steps {
        out.push_str(&format!("('S{i}', 'Step {i}'), "));
    }
    out.push_str("]\nfor key, label in steps:\n    dot.node(key, label)\n");
    for i in 1..steps {
        out.push_str(&format!("dot.edge('S{}', 'S{i}')\n", i - 1));
    }
    out.push_str("dot.render('pipeline', view=True)\n```\nThat is the flow.\n");
    out
}

fn chain(nodes: usize) -> Graph {
    let mut graph = Graph::new(GraphKind::Directed);
    for i in 0..nodes {
        let mut attrs = Attrs::new();
        attrs.insert("label".to_string(), format!("Node {i} with a longer label"));
        graph.add_node(&format!("N{i}"), attrs);
    }
    for i in 1..nodes {
        graph.add_edge(&format!("N{}", i - 1), &format!("N{i}"), Attrs::new());
        if i >= 3 {
            graph.add_edge(&format!("N{}", i - 3), &format!("N{i}"), Attrs::new());
        }
    }
    graph
}

fn bench_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract");
    for steps in [10usize, 100] {
        let input = answer(steps);
        group.bench_with_input(BenchmarkId::from_parameter(steps), &input, |b, data| {
            b.iter(|| extract(black_box(data)))
        });
    }
    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute_svg");
    let dir = std::env::temp_dir().join("gitdoc-bench");
    let _ = std::fs::create_dir_all(&dir);
    let runner = ScriptRunner::new(&dir, Config::default());
    for steps in [10usize, 60] {
        let Some(script) = extract(&answer(steps)) else {
            continue;
        };
        // Swap the appended png render for svg to keep the rasterizer out of the loop.
        let source = script.as_str().replace("dot.format = 'png'", "dot.format = 'svg'");
        group.bench_with_input(BenchmarkId::from_parameter(steps), &source, |b, data| {
            b.iter(|| runner.run_source(black_box(data)))
        });
    }
    group.finish();
}

fn bench_layout(c: &mut Criterion) {
    let config = Config::default();
    let mut group = c.benchmark_group("layout_render");
    for nodes in [20usize, 100] {
        let graph = chain(nodes);
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &graph, |b, graph| {
            b.iter(|| {
                let layout = compute_layout(black_box(graph), &config.theme, &config.layout);
                render_svg(&layout, &config.theme, &config.layout)
            })
        });
        group.bench_with_input(BenchmarkId::new("dot_source", nodes), &graph, |b, graph| {
            b.iter(|| to_source(black_box(graph)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_extract, bench_execute, bench_layout);
criterion_main!(benches);
