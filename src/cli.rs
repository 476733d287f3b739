use crate::chat::OpenAiChat;
use crate::config::{Config, load_config, validate_file_types};
use crate::export::{cleanup, report_html, write_html, write_pdf};
use crate::extract::{DiagramScript, IMAGE_STEM, extract};
use crate::github::{GithubClient, RepoRef};
use crate::prompts::Audience;
use crate::script::{DisplayItem, ScriptRunner};
use crate::session::{DiagramOutcome, Session};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Parser, Debug)]
#[command(name = "gitdoc", version, about = "Generate documentation and a flowchart for a GitHub repository")]
pub struct Args {
    /// Config JSON file
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the diagram script found in a model response
    Extract {
        /// Response file or '-' for stdin
        #[arg(short = 'i', long = "input")]
        input: Option<PathBuf>,
    },
    /// Run the diagram script found in a model response and write the chart
    Render {
        /// Response file or '-' for stdin
        #[arg(short = 'i', long = "input")]
        input: Option<PathBuf>,

        /// Directory for the chart files
        #[arg(short = 'o', long = "out-dir", default_value = ".")]
        out_dir: PathBuf,
    },
    /// Document a repository and draw its flowchart
    Document(DocumentArgs),
}

#[derive(clap::Args, Debug)]
pub struct DocumentArgs {
    /// https://github.com/<owner>/<repo>[/tree/<branch>]
    pub url: String,

    #[arg(long, value_enum, default_value_t = AudienceArg::Technical)]
    pub audience: AudienceArg,

    /// Chat model (gpt-4, gpt-4-1106-preview, gpt-3.5-turbo, ...)
    #[arg(long)]
    pub model: Option<String>,

    /// File types to load, e.g. --file-type .py,.md
    #[arg(long = "file-type", value_delimiter = ',')]
    pub file_types: Vec<String>,

    /// Directory for the chart files and exports
    #[arg(long = "out-dir", default_value = ".")]
    pub out_dir: PathBuf,

    /// Also write the documentation as Markdown
    #[arg(long)]
    pub markdown: Option<PathBuf>,

    /// Export a PDF (defaults to <owner>_<repo>_<branch>.pdf in the output directory)
    #[arg(long, num_args = 0..=1, conflicts_with = "html")]
    pub pdf: Option<Option<PathBuf>>,

    /// Export HTML instead of PDF
    #[arg(long)]
    pub html: Option<PathBuf>,

    /// Keep flowchart and flowchart.png after exporting
    #[arg(long)]
    pub keep_artifacts: bool,

    /// Skip the flowchart
    #[arg(long)]
    pub no_diagram: bool,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudienceArg {
    Technical,
    NonTechnical,
}

impl From<AudienceArg> for Audience {
    fn from(arg: AudienceArg) -> Self {
        match arg {
            AudienceArg::Technical => Audience::Technical,
            AudienceArg::NonTechnical => Audience::NonTechnical,
        }
    }
}

pub fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);
    log::debug!("{args:?}");

    let config = load_config(args.config.as_deref())?;
    match args.command {
        Command::Extract { input } => {
            let script = read_script(input.as_deref())?;
            println!("{script}");
            Ok(())
        }
        Command::Render { input, out_dir } => {
            let script = read_script(input.as_deref())?;
            render(&script, &out_dir, config)
        }
        Command::Document(doc) => document(doc, config),
    }
}

fn init_logging(level: &str) {
    let level = LevelFilter::from_str(level).unwrap_or_else(|_| {
        eprintln!("Invalid log level: {level}. Using 'warn' instead.");
        LevelFilter::Warn
    });
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(level)
        .init();
}

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) if path != Path::new("-") => {
            std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
        }
        _ => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

fn read_script(path: Option<&Path>) -> Result<DiagramScript> {
    let response = read_input(path)?;
    extract(&response).ok_or_else(|| anyhow::anyhow!("No fenced code block found in input"))
}

fn render(script: &DiagramScript, out_dir: &Path, config: Config) -> Result<()> {
    std::fs::create_dir_all(out_dir)?;
    let execution = ScriptRunner::new(out_dir, config).run(script)?;
    for item in &execution.displays {
        match item {
            DisplayItem::Header(text) => eprintln!("== {text}"),
            DisplayItem::Text(text) if !text.is_empty() => eprintln!("{text}"),
            _ => {}
        }
    }
    for file in &execution.files {
        println!("{}", file.display());
    }
    Ok(())
}

fn document(args: DocumentArgs, mut config: Config) -> Result<()> {
    let repo = RepoRef::parse_with_default(&args.url, &config.repository.default_branch)?;
    if !args.file_types.is_empty() {
        config.repository.file_types = validate_file_types(&args.file_types)?;
    }

    let github = GithubClient::new(&config.repository, args.github_token.clone())?;
    let docs = github.load_documents(&repo, &config.repository.file_types)?;
    if docs.is_empty() {
        log::warn!(
            "no {} files found in {repo}",
            config.repository.file_types.join("/")
        );
    }
    let model = args.model.clone().unwrap_or_else(|| config.chat.model.clone());
    let mut session = Session::new(args.audience.into(), model);
    let chat = OpenAiChat::new(
        &session.chat_config(&config.chat),
        args.api_key.as_deref().unwrap_or_default(),
        &docs,
    )?;
    session.start(repo.clone(), Box::new(chat));

    let mut printer = StreamPrinter::default();
    let mut stdout = io::stdout();
    let text = session
        .generate_documentation(&mut |partial| {
            if let Some(fresh) = printer.feed(partial) {
                let _ = write!(stdout, "{fresh}");
                let _ = stdout.flush();
            }
        })?
        .to_string();
    println!();

    if let Some(path) = &args.markdown {
        std::fs::write(path, &text).with_context(|| format!("failed to write {}", path.display()))?;
    }

    std::fs::create_dir_all(&args.out_dir)?;
    let runner = ScriptRunner::new(&args.out_dir, config.clone());
    if !args.no_diagram {
        match session.generate_diagram(&runner)? {
            DiagramOutcome::Rendered(execution) => {
                for file in &execution.files {
                    eprintln!("wrote {}", file.display());
                }
            }
            DiagramOutcome::NoArtifact => eprintln!("The model did not return a diagram."),
            DiagramOutcome::Malformed(err) => eprintln!("Could not draw the diagram: {err}"),
        }
    }

    let image = session.report_image(&runner);
    let exported = if let Some(pdf) = &args.pdf {
        let dest = pdf
            .clone()
            .unwrap_or_else(|| args.out_dir.join(repo.pdf_file_name()));
        let html = report_html(&text, image.as_deref())?;
        write_pdf(&html, &dest, &config.export.wkhtmltopdf)?;
        eprintln!("wrote {}", dest.display());
        true
    } else if let Some(dest) = &args.html {
        let html = report_html(&text, image.as_deref())?;
        write_html(&html, dest)?;
        eprintln!("wrote {}", dest.display());
        true
    } else {
        false
    };

    if exported && !args.keep_artifacts {
        cleanup(&[Session::image_path(&runner), args.out_dir.join(IMAGE_STEM)])?;
    }
    Ok(())
}

/// Turns a sequence of growing snapshots into the newly added text.
#[derive(Debug, Default)]
struct StreamPrinter {
    printed: usize,
}

impl StreamPrinter {
    fn feed<'a>(&mut self, partial: &'a str) -> Option<&'a str> {
        if partial.len() <= self.printed || !partial.is_char_boundary(self.printed) {
            return None;
        }
        let fresh = &partial[self.printed..];
        self.printed = partial.len();
        Some(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_document_flags() {
        let args = Args::try_parse_from([
            "gitdoc",
            "document",
            "https://github.com/o/r/tree/dev",
            "--audience",
            "non-technical",
            "--file-type",
            ".py,md",
            "--pdf",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.log_level, "debug");
        let Command::Document(doc) = args.command else {
            panic!("expected document command");
        };
        assert_eq!(doc.audience, AudienceArg::NonTechnical);
        assert_eq!(doc.file_types, vec![".py", "md"]);
        assert_eq!(doc.pdf, Some(None));
        assert_eq!(Audience::from(doc.audience), Audience::NonTechnical);
    }

    #[test]
    fn pdf_and_html_conflict() {
        let result = Args::try_parse_from([
            "gitdoc",
            "document",
            "https://github.com/o/r",
            "--pdf",
            "a.pdf",
            "--html",
            "a.html",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn render_defaults_to_current_dir() {
        let args = Args::try_parse_from(["gitdoc", "render", "-i", "answer.md"]).unwrap();
        match args.command {
            Command::Render { input, out_dir } => {
                assert_eq!(input, Some(PathBuf::from("answer.md")));
                assert_eq!(out_dir, PathBuf::from("."));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn stream_printer_emits_only_new_text() {
        let mut printer = StreamPrinter::default();
        assert_eq!(printer.feed(""), None);
        assert_eq!(printer.feed("# Doc"), Some("# Doc"));
        assert_eq!(printer.feed("# Doc"), None);
        assert_eq!(printer.feed("# Doc for you"), Some(" for you"));
    }

    #[test]
    fn render_writes_chart_files() {
        let dir = tempfile::tempdir().unwrap();
        let script = extract("```\ndot = graphviz.Digraph()\ndot.edge('a', 'b')\n```").unwrap();
        let mut config = Config::default();
        config.render.width = 300.0;
        let result = render(&script, dir.path(), config);
        if cfg!(feature = "png") {
            result.unwrap();
            assert!(dir.path().join("flowchart.png").exists());
            assert!(dir.path().join("flowchart").exists());
        } else {
            assert!(result.is_err());
        }
    }
}
