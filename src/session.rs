use crate::chat::{ChatError, ChatService};
use crate::config::ChatConfig;
use crate::extract::{CHART_STATE_KEY, IMAGE_STEM, extract};
use crate::github::RepoRef;
use crate::ir::Graph;
use crate::prompts::{Audience, diagram_prompt, documentation_prompt};
use crate::script::{Execution, ScriptError, ScriptRunner};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no repository loaded; start a session first")]
    NotStarted,
    #[error(transparent)]
    Chat(#[from] ChatError),
}

/// Result of one diagram request. Only `Rendered` marks the diagram as
/// generated.
#[derive(Debug)]
pub enum DiagramOutcome {
    Rendered(Execution),
    NoArtifact,
    Malformed(ScriptError),
}

/// State for one user working on one repository.
pub struct Session {
    pub repo: Option<RepoRef>,
    pub audience: Audience,
    pub model: String,
    chat: Option<Box<dyn ChatService>>,
    pub output_text: Option<String>,
    pub generated_graph: bool,
    pub chart: Option<Graph>,
}

impl Session {
    pub fn new(audience: Audience, model: impl Into<String>) -> Self {
        Self {
            repo: None,
            audience,
            model: model.into(),
            chat: None,
            output_text: None,
            generated_graph: false,
            chart: None,
        }
    }

    /// Binds a repository and its chat engine, dropping any earlier output.
    pub fn start(&mut self, repo: RepoRef, chat: Box<dyn ChatService>) {
        log::info!("session started for {repo}");
        self.reset();
        self.repo = Some(repo);
        self.chat = Some(chat);
    }

    pub fn is_started(&self) -> bool {
        self.chat.is_some()
    }

    /// `base` with this session's model choice applied, for building the
    /// chat engine passed to [`Session::start`].
    pub fn chat_config(&self, base: &ChatConfig) -> ChatConfig {
        ChatConfig {
            model: self.model.clone(),
            ..base.clone()
        }
    }

    /// Streams the documentation answer. `on_token` receives the trimmed text
    /// accumulated so far after every fragment.
    pub fn generate_documentation(&mut self, on_token: &mut dyn FnMut(&str)) -> Result<&str, SessionError> {
        let chat = self.chat.as_mut().ok_or(SessionError::NotStarted)?;
        let prompt = documentation_prompt(self.audience);
        let mut accumulated = String::new();
        let reply = chat.stream_chat(&prompt, &mut |token| {
            accumulated.push_str(token);
            on_token(accumulated.trim());
        })?;
        log::info!("documentation generated ({} chars)", reply.len());
        let text = self.output_text.insert(reply.trim().to_string());
        Ok(text.as_str())
    }

    /// Asks for a diagram, extracts the script and runs it. Script failures
    /// are reported as [`DiagramOutcome::Malformed`]; chat failures are errors.
    pub fn generate_diagram(&mut self, runner: &ScriptRunner) -> Result<DiagramOutcome, SessionError> {
        let chat = self.chat.as_mut().ok_or(SessionError::NotStarted)?;
        let response = chat.chat(&diagram_prompt(self.audience))?;

        let Some(script) = extract(&response) else {
            log::info!("diagram response held no code block");
            return Ok(DiagramOutcome::NoArtifact);
        };

        match runner.run(&script) {
            Ok(execution) => {
                self.chart = execution
                    .state_graph(CHART_STATE_KEY)
                    .or_else(|| execution.chart())
                    .cloned();
                self.generated_graph = true;
                log::info!("diagram rendered ({} files)", execution.files.len());
                Ok(DiagramOutcome::Rendered(execution))
            }
            Err(err) => {
                log::warn!("diagram script failed: {err}");
                Ok(DiagramOutcome::Malformed(err))
            }
        }
    }

    /// Where a rendered diagram image lands for `runner`.
    pub fn image_path(runner: &ScriptRunner) -> PathBuf {
        runner.out_dir().join(format!("{IMAGE_STEM}.png"))
    }

    /// The image to embed in an exported report. Only a diagram rendered in
    /// this session counts; a file left over from an earlier run does not.
    pub fn report_image(&self, runner: &ScriptRunner) -> Option<PathBuf> {
        let image = Self::image_path(runner);
        (self.generated_graph && image.exists()).then_some(image)
    }

    /// Clears everything except the audience and model choice.
    pub fn reset(&mut self) {
        self.repo = None;
        self.chat = None;
        self.output_text = None;
        self.generated_graph = false;
        self.chart = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::collections::VecDeque;

    /// Replies from a fixed script of answers.
    struct ScriptedChat {
        replies: VecDeque<Result<String, ChatError>>,
    }

    impl ScriptedChat {
        fn boxed(replies: Vec<Result<&str, ChatError>>) -> Box<dyn ChatService> {
            Box::new(Self {
                replies: replies.into_iter().map(|r| r.map(str::to_string)).collect(),
            })
        }
    }

    impl ChatService for ScriptedChat {
        fn chat(&mut self, _message: &str) -> Result<String, ChatError> {
            self.replies
                .pop_front()
                .unwrap_or_else(|| Err(ChatError::Decode("no more replies".to_string())))
        }

        fn stream_chat(&mut self, message: &str, on_token: &mut dyn FnMut(&str)) -> Result<String, ChatError> {
            let reply = self.chat(message)?;
            for word in reply.split_inclusive(' ') {
                on_token(word);
            }
            Ok(reply)
        }
    }

    fn repo() -> RepoRef {
        RepoRef::parse("https://github.com/o/r").unwrap()
    }

    const DIAGRAM: &str = "```python\nimport graphviz\ndot = graphviz.Digraph()\ndot.edge('Load', 'Render')\n```";

    #[test]
    fn documentation_streams_accumulated_text() {
        let mut session = Session::new(Audience::Technical, "gpt-4");
        session.start(repo(), ScriptedChat::boxed(vec![Ok("  Hello big world \n")]));
        let mut seen = Vec::new();
        let text = session
            .generate_documentation(&mut |partial| seen.push(partial.to_string()))
            .unwrap();
        assert_eq!(text, "Hello big world");
        assert_eq!(seen.last().map(String::as_str), Some("Hello big world"));
        assert_eq!(seen[0], "");
        assert!(seen.iter().any(|partial| partial == "Hello big"));
        assert_eq!(session.output_text.as_deref(), Some("Hello big world"));
    }

    #[test]
    fn diagram_without_code_block_is_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new(dir.path(), Config::default());
        let mut session = Session::new(Audience::NonTechnical, "gpt-4");
        session.start(repo(), ScriptedChat::boxed(vec![Ok("I cannot draw that.")]));
        let outcome = session.generate_diagram(&runner).unwrap();
        assert!(matches!(outcome, DiagramOutcome::NoArtifact));
        assert!(!session.generated_graph);
        assert!(session.chart.is_none());
    }

    #[test]
    fn stale_image_is_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new(dir.path(), Config::default());
        std::fs::write(Session::image_path(&runner), b"old chart").unwrap();
        let mut session = Session::new(Audience::Technical, "gpt-4");
        session.start(
            repo(),
            ScriptedChat::boxed(vec![Ok("No diagram today."), Ok("```python\nimport os\n```")]),
        );
        assert!(matches!(session.generate_diagram(&runner).unwrap(), DiagramOutcome::NoArtifact));
        assert_eq!(session.report_image(&runner), None);
        assert!(matches!(session.generate_diagram(&runner).unwrap(), DiagramOutcome::Malformed(_)));
        assert_eq!(session.report_image(&runner), None);
    }

    #[test]
    fn malformed_script_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new(dir.path(), Config::default());
        let mut session = Session::new(Audience::Technical, "gpt-4");
        session.start(
            repo(),
            ScriptedChat::boxed(vec![Ok("```python\nimport os\nos.system('rm -rf /')\n```")]),
        );
        let outcome = session.generate_diagram(&runner).unwrap();
        assert!(matches!(outcome, DiagramOutcome::Malformed(ScriptError::ForbiddenImport { .. })));
        assert!(!session.generated_graph);
    }

    #[test]
    fn rendered_diagram_sets_chart() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new(dir.path(), Config::default());
        let mut session = Session::new(Audience::Technical, "gpt-4");
        session.start(repo(), ScriptedChat::boxed(vec![Ok(DIAGRAM)]));
        match session.generate_diagram(&runner).unwrap() {
            DiagramOutcome::Rendered(execution) => {
                assert!(execution.files.contains(&Session::image_path(&runner)));
                assert!(session.generated_graph);
                assert_eq!(session.report_image(&runner), Some(Session::image_path(&runner)));
                assert_eq!(session.chart.as_ref().map(|g| g.edges.len()), Some(1));
            }
            // Rasterizing needs the png feature.
            DiagramOutcome::Malformed(ScriptError::Render { .. }) if !cfg!(feature = "png") => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn chat_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new(dir.path(), Config::default());
        let mut session = Session::new(Audience::Technical, "gpt-4");
        session.start(
            repo(),
            ScriptedChat::boxed(vec![Err(ChatError::Status {
                status: 500,
                body: String::new(),
            })]),
        );
        assert!(matches!(session.generate_diagram(&runner), Err(SessionError::Chat(_))));
    }

    #[test]
    fn requires_start_and_reset_keeps_choices() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new(dir.path(), Config::default());
        let mut session = Session::new(Audience::NonTechnical, "gpt-3.5-turbo");
        assert!(matches!(session.generate_diagram(&runner), Err(SessionError::NotStarted)));

        session.start(repo(), ScriptedChat::boxed(vec![Ok("text")]));
        session.generate_documentation(&mut |_| {}).unwrap();
        session.reset();
        assert!(!session.is_started());
        assert!(session.output_text.is_none());
        assert_eq!(session.audience, Audience::NonTechnical);
        assert_eq!(session.model, "gpt-3.5-turbo");
    }

    #[test]
    fn chat_config_uses_session_model() {
        let session = Session::new(Audience::Technical, "gpt-3.5-turbo");
        let base = ChatConfig::default();
        let config = session.chat_config(&base);
        assert_eq!(config.model, "gpt-3.5-turbo");
        assert_eq!(config.api_base, base.api_base);
    }
}
