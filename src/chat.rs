//! Chat over a loaded repository.
//!
//! Every request carries the system prompt with a context block built from the
//! repository documents, then the conversation so far.

use crate::config::ChatConfig;
use crate::github::Document;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no API key provided (set OPENAI_API_KEY or pass --api-key)")]
    MissingApiKey,
    #[error("chat request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chat API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to read chat stream: {0}")]
    Stream(#[from] std::io::Error),
    #[error("malformed chat response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

pub trait ChatService {
    fn chat(&mut self, message: &str) -> Result<String, ChatError>;

    /// Like [`ChatService::chat`], calling `on_token` with each text fragment
    /// as it arrives. Returns the concatenated reply.
    fn stream_chat(&mut self, message: &str, on_token: &mut dyn FnMut(&str)) -> Result<String, ChatError>;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<&'a ChatMessage>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiChat {
    http: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    system: ChatMessage,
    history: Vec<ChatMessage>,
}

impl OpenAiChat {
    pub fn new(config: &ChatConfig, api_key: &str, docs: &[Document]) -> Result<Self, ChatError> {
        if api_key.trim().is_empty() {
            return Err(ChatError::MissingApiKey);
        }
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let context = context_block(docs, config.context_char_budget);
        let system = if context.is_empty() {
            ChatMessage::system(config.system_prompt.clone())
        } else {
            ChatMessage::system(format!("{}\n\n{context}", config.system_prompt))
        };
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            system,
            history: Vec::new(),
        })
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    fn send(&self, user: &ChatMessage, stream: bool) -> Result<reqwest::blocking::Response, ChatError> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(&self.system);
        messages.extend(self.history.iter());
        messages.push(user);
        let body = CompletionRequest {
            model: &self.model,
            temperature: self.temperature,
            messages,
            stream,
        };
        log::info!("chat request to {} ({} history messages)", self.model, self.history.len());
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::Status {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        Ok(response)
    }

    fn record(&mut self, user: ChatMessage, reply: &str) {
        self.history.push(user);
        self.history.push(ChatMessage::assistant(reply));
    }
}

impl ChatService for OpenAiChat {
    fn chat(&mut self, message: &str) -> Result<String, ChatError> {
        let user = ChatMessage::user(message);
        let response: CompletionResponse = self.send(&user, false)?.json()?;
        let reply = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .map(|message| message.content)
            .ok_or_else(|| ChatError::Decode("response has no message choice".to_string()))?;
        self.record(user, &reply);
        Ok(reply)
    }

    fn stream_chat(&mut self, message: &str, on_token: &mut dyn FnMut(&str)) -> Result<String, ChatError> {
        let user = ChatMessage::user(message);
        let response = self.send(&user, true)?;
        let mut reply = String::new();
        for line in BufReader::new(response).lines() {
            let line = line?;
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                break;
            }
            if data.is_empty() {
                continue;
            }
            let chunk: CompletionResponse =
                serde_json::from_str(data).map_err(|e| ChatError::Decode(e.to_string()))?;
            let token = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta)
                .and_then(|delta| delta.content);
            if let Some(token) = token.filter(|t| !t.is_empty()) {
                on_token(&token);
                reply.push_str(&token);
            }
        }
        self.record(user, &reply);
        Ok(reply)
    }
}

/// Renders documents into a context block, stopping before `budget`
/// characters. A file that does not fit is left out whole.
pub fn context_block(docs: &[Document], budget: usize) -> String {
    if docs.is_empty() {
        return String::new();
    }
    let mut out = String::from("Context information from the repository is below.\n--------------------\n");
    let mut used = out.chars().count();
    let mut skipped = 0usize;
    for doc in docs {
        let entry = format!("file_path: {}\n\n{}\n\n", doc.path, doc.text.trim_end());
        let len = entry.chars().count();
        if used + len > budget {
            skipped += 1;
            continue;
        }
        used += len;
        out.push_str(&entry);
    }
    if skipped > 0 {
        log::warn!("{skipped} documents did not fit in the chat context budget");
    }
    out.push_str("--------------------");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn docs() -> Vec<Document> {
        vec![
            Document {
                path: "app.py".to_string(),
                text: "def main():\n    pass\n".to_string(),
            },
            Document {
                path: "big.py".to_string(),
                text: "x".repeat(500),
            },
        ]
    }

    fn config(api_base: String) -> ChatConfig {
        ChatConfig {
            api_base,
            context_char_budget: 300,
            ..Default::default()
        }
    }

    #[test]
    fn context_respects_budget() {
        let block = context_block(&docs(), 300);
        assert!(block.contains("file_path: app.py"));
        assert!(!block.contains("big.py"));
        assert!(block.ends_with("--------------------"));
        assert!(context_block(&[], 300).is_empty());
    }

    #[test]
    fn chat_sends_context_and_records_history() {
        let mut server = Server::new();
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(serde_json::json!({
                    "model": "gpt-4",
                    "temperature": 0.0,
                })),
                Matcher::Regex("file_path: app.py".to_string()),
            ]))
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"Docs here"}}]}"#)
            .expect(2)
            .create();

        let mut chat = OpenAiChat::new(&config(server.url()), "sk-test", &docs()).unwrap();
        assert_eq!(chat.chat("Document it").unwrap(), "Docs here");
        assert_eq!(chat.history().len(), 2);
        chat.chat("And again").unwrap();
        assert_eq!(chat.history()[2], ChatMessage::user("And again"));
        mock.assert();
    }

    #[test]
    fn stream_collects_tokens() {
        let mut server = Server::new();
        let body = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"# Over\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"view\"}}]}\n\n\
                    data: [DONE]\n\n";
        let _mock = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJson(serde_json::json!({ "stream": true })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create();

        let mut chat = OpenAiChat::new(&config(server.url()), "sk-test", &docs()).unwrap();
        let mut seen = Vec::new();
        let reply = chat
            .stream_chat("Document it", &mut |token| seen.push(token.to_string()))
            .unwrap();
        assert_eq!(reply, "# Overview");
        assert_eq!(seen, vec!["# Over", "view"]);
        assert_eq!(chat.history()[1], ChatMessage::assistant("# Overview"));
    }

    #[test]
    fn api_errors_are_reported() {
        let mut server = Server::new();
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body(r#"{"error":{"message":"bad key"}}"#)
            .create();
        let mut chat = OpenAiChat::new(&config(server.url()), "sk-bad", &[]).unwrap();
        let err = chat.chat("hi").unwrap_err();
        assert!(matches!(err, ChatError::Status { status: 401, .. }));
        assert!(chat.history().is_empty());
    }

    #[test]
    fn missing_key_is_rejected() {
        assert!(matches!(
            OpenAiChat::new(&ChatConfig::default(), " ", &[]),
            Err(ChatError::MissingApiKey)
        ));
    }
}
