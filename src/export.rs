use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use pulldown_cmark::{Options, Parser, html};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("PDF converter '{0}' not found; install wkhtmltopdf or set `wkhtmltopdf` in the config")]
    ToolMissing(PathBuf),
    #[error("PDF converter exited with {status}: {stderr}")]
    ToolFailed { status: String, stderr: String },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn markdown_to_html(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, Parser::new_ext(markdown, options));
    out
}

/// The documentation as HTML, with the diagram embedded as a data URI when
/// `image` exists.
pub fn report_html(markdown: &str, image: Option<&Path>) -> Result<String, ExportError> {
    let mut out = markdown_to_html(markdown);
    if let Some(image) = image.filter(|path| path.exists()) {
        let bytes = std::fs::read(image).map_err(io_error(image))?;
        out.push_str(&format!(
            "<img src=\"data:image/png;base64,{}\" alt=\"Flowchart diagram\" />",
            STANDARD.encode(bytes)
        ));
    } else {
        log::debug!("no diagram image to embed");
    }
    Ok(out)
}

pub fn write_html(html: &str, dest: &Path) -> Result<(), ExportError> {
    std::fs::write(dest, html).map_err(io_error(dest))?;
    log::info!("wrote {}", dest.display());
    Ok(())
}

/// Converts `html` to a PDF at `dest` by piping it through `tool`
/// (wkhtmltopdf's command line).
pub fn write_pdf(html: &str, dest: &Path, tool: &Path) -> Result<(), ExportError> {
    let mut child = Command::new(tool)
        .arg("--quiet")
        .arg("-")
        .arg(dest)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound => ExportError::ToolMissing(tool.to_path_buf()),
            _ => io_error(tool)(err),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        // A converter that exits early closes the pipe; its status says why.
        match stdin.write_all(html.as_bytes()) {
            Err(err) if err.kind() != ErrorKind::BrokenPipe => return Err(io_error(tool)(err)),
            _ => {}
        }
    }

    let output = child.wait_with_output().map_err(io_error(tool))?;
    if !output.status.success() {
        return Err(ExportError::ToolFailed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    log::info!("wrote {}", dest.display());
    Ok(())
}

/// Removes export artifacts. Files that are already gone are skipped.
pub fn cleanup<P: AsRef<Path>>(paths: &[P]) -> Result<(), ExportError> {
    for path in paths {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => log::debug!("removed {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(path)(err)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_markdown() {
        let html = markdown_to_html("# Title\n\nSome *text*.\n\n| a | b |\n|---|---|\n| 1 | 2 |\n");
        assert!(html.contains("<h1>Title</h1>"));
        assert!(html.contains("<em>text</em>"));
        assert!(html.contains("<table>"));
    }

    #[test]
    fn embeds_existing_image_only() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("flowchart.png");

        let html = report_html("Docs", Some(&image)).unwrap();
        assert!(!html.contains("<img"));

        std::fs::write(&image, [0x89, b'P', b'N', b'G']).unwrap();
        let html = report_html("Docs", Some(&image)).unwrap();
        assert!(html.starts_with("<p>Docs</p>"));
        assert!(html.ends_with("<img src=\"data:image/png;base64,iVBORw==\" alt=\"Flowchart diagram\" />"));
    }

    #[test]
    fn cleanup_ignores_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("flowchart");
        std::fs::write(&present, "digraph {}").unwrap();
        cleanup(&[present.clone(), dir.path().join("flowchart.png")]).unwrap();
        assert!(!present.exists());
    }

    #[test]
    fn missing_converter_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_pdf("<p>x</p>", &dir.path().join("out.pdf"), Path::new("gitdoc-no-such-tool")).unwrap_err();
        assert!(matches!(err, ExportError::ToolMissing(_)));
    }

    #[cfg(unix)]
    #[test]
    fn failing_converter_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_pdf("<p>x</p>", &dir.path().join("out.pdf"), Path::new("false")).unwrap_err();
        assert!(matches!(err, ExportError::ToolFailed { .. }));
    }

    #[test]
    fn writes_html() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("report.html");
        write_html("<p>x</p>", &dest).unwrap();
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "<p>x</p>");
    }
}
