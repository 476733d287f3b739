use crate::config::RepositoryConfig;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

static GITHUB_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://github\.com/(?P<owner>[^/]+)/(?P<repo>[^/]+)(/tree/(?P<branch>[^/]+))?")
        .expect("github url regex compile failed")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Please enter a valid Github URL.")]
pub struct RepoUrlError {
    pub url: String,
}

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("GitHub returned {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("blob {path} is not valid base64: {source}")]
    Decode {
        path: String,
        #[source]
        source: base64::DecodeError,
    },
    #[error("blob {path} uses unsupported encoding '{encoding}'")]
    Encoding { path: String, encoding: String },
}

/// Owner, repository and branch named by a GitHub URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl RepoRef {
    /// Parses `https://github.com/<owner>/<repo>[/tree/<branch>]`. Anything
    /// after the matched prefix is ignored; a missing branch falls back to
    /// `default_branch`.
    pub fn parse_with_default(url: &str, default_branch: &str) -> Result<Self, RepoUrlError> {
        let caps = GITHUB_URL_RE.captures(url.trim()).ok_or_else(|| RepoUrlError {
            url: url.to_string(),
        })?;
        Ok(Self {
            owner: caps["owner"].to_string(),
            repo: caps["repo"].to_string(),
            branch: caps
                .name("branch")
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| default_branch.to_string()),
        })
    }

    pub fn parse(url: &str) -> Result<Self, RepoUrlError> {
        Self::parse_with_default(url, "main")
    }

    pub fn pdf_file_name(&self) -> String {
        format!("{}_{}_{}.pdf", self.owner, self.repo, self.branch)
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repo, self.branch)
    }
}

/// One source file loaded from the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub path: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

pub struct GithubClient {
    http: reqwest::blocking::Client,
    api_base: String,
    token: Option<String>,
    max_file_bytes: usize,
}

impl GithubClient {
    pub fn new(config: &RepositoryConfig, token: Option<String>) -> Result<Self, GithubError> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("gitdoc/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|source| GithubError::Transport {
                url: config.api_base.clone(),
                source,
            })?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            max_file_bytes: config.max_file_bytes,
        })
    }

    /// Loads every blob on the branch whose path ends with one of
    /// `extensions`, in tree order.
    pub fn load_documents(&self, repo: &RepoRef, extensions: &[String]) -> Result<Vec<Document>, GithubError> {
        let url = format!(
            "{}/repos/{}/{}/git/trees/{}?recursive=1",
            self.api_base, repo.owner, repo.repo, repo.branch
        );
        let tree: TreeResponse = self.get_json(&url)?;
        if tree.truncated {
            log::warn!("tree listing for {repo} was truncated by GitHub");
        }

        let mut docs = Vec::new();
        for entry in tree.tree {
            if entry.kind != "blob" || !extensions.iter().any(|ext| entry.path.ends_with(ext.as_str())) {
                continue;
            }
            if entry.size.is_some_and(|size| size > self.max_file_bytes) {
                log::debug!("skipping {} ({} bytes)", entry.path, entry.size.unwrap_or_default());
                continue;
            }
            let url = format!(
                "{}/repos/{}/{}/git/blobs/{}",
                self.api_base, repo.owner, repo.repo, entry.sha
            );
            let blob: BlobResponse = self.get_json(&url)?;
            match decode_blob(&entry.path, &blob)? {
                Some(text) => {
                    log::debug!("loaded {}", entry.path);
                    docs.push(Document {
                        path: entry.path,
                        text,
                    });
                }
                None => log::debug!("skipping non-UTF-8 file {}", entry.path),
            }
        }
        log::info!("loaded {} documents from {repo}", docs.len());
        Ok(docs)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, GithubError> {
        let mut request = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let transport = |source| GithubError::Transport {
            url: url.to_string(),
            source,
        };
        let response = request.send().map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(GithubError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        response.json().map_err(transport)
    }
}

fn decode_blob(path: &str, blob: &BlobResponse) -> Result<Option<String>, GithubError> {
    if blob.encoding != "base64" {
        return Err(GithubError::Encoding {
            path: path.to_string(),
            encoding: blob.encoding.clone(),
        });
    }
    // GitHub wraps the payload at 60 columns.
    let compact: String = blob.content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD.decode(compact).map_err(|source| GithubError::Decode {
        path: path.to_string(),
        source,
    })?;
    Ok(String::from_utf8(bytes).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    #[test]
    fn parses_repo_urls() {
        let repo = RepoRef::parse("https://github.com/openai/whisper").unwrap();
        assert_eq!(repo.owner, "openai");
        assert_eq!(repo.repo, "whisper");
        assert_eq!(repo.branch, "main");

        let repo = RepoRef::parse("http://github.com/a/b/tree/dev/src/lib.rs").unwrap();
        assert_eq!(repo.branch, "dev");
        assert_eq!(repo.pdf_file_name(), "a_b_dev.pdf");

        let repo = RepoRef::parse_with_default("https://github.com/a/b", "master").unwrap();
        assert_eq!(repo.branch, "master");
    }

    #[test]
    fn rejects_other_urls() {
        for url in ["", "github.com/a/b", "https://gitlab.com/a/b", "https://github.com/a", "see https://github.com/a/b"] {
            let err = RepoRef::parse(url).unwrap_err();
            assert_eq!(err.to_string(), "Please enter a valid Github URL.");
        }
    }

    fn blob_body(text: &str) -> String {
        let encoded = STANDARD.encode(text);
        let (head, tail) = encoded.split_at(encoded.len() / 2);
        serde_json::json!({ "content": format!("{head}\n{tail}\n"), "encoding": "base64" }).to_string()
    }

    #[test]
    fn loads_matching_blobs() {
        let mut server = Server::new();
        let tree = server
            .mock("GET", "/repos/o/r/git/trees/main")
            .match_query(Matcher::UrlEncoded("recursive".into(), "1".into()))
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "sha": "root",
                    "truncated": false,
                    "tree": [
                        { "path": "src", "type": "tree", "sha": "t1" },
                        { "path": "src/app.py", "type": "blob", "sha": "b1", "size": 12 },
                        { "path": "README.md", "type": "blob", "sha": "b2", "size": 5 },
                        { "path": "big.py", "type": "blob", "sha": "b3", "size": 10_000_000 }
                    ]
                })
                .to_string(),
            )
            .create();
        let blob = server
            .mock("GET", "/repos/o/r/git/blobs/b1")
            .with_status(200)
            .with_body(blob_body("print('hi')\n"))
            .create();

        let config = RepositoryConfig {
            api_base: server.url(),
            ..Default::default()
        };
        let client = GithubClient::new(&config, Some("secret".to_string())).unwrap();
        let repo = RepoRef::parse("https://github.com/o/r").unwrap();
        let docs = client.load_documents(&repo, &[".py".to_string()]).unwrap();

        tree.assert();
        blob.assert();
        assert_eq!(
            docs,
            vec![Document {
                path: "src/app.py".to_string(),
                text: "print('hi')\n".to_string(),
            }]
        );
    }

    #[test]
    fn surfaces_http_errors() {
        let mut server = Server::new();
        let _tree = server
            .mock("GET", "/repos/o/missing/git/trees/main")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"message":"Not Found"}"#)
            .create();
        let config = RepositoryConfig {
            api_base: server.url(),
            ..Default::default()
        };
        let client = GithubClient::new(&config, None).unwrap();
        let repo = RepoRef::parse("https://github.com/o/missing").unwrap();
        let err = client.load_documents(&repo, &[".py".to_string()]).unwrap_err();
        assert!(matches!(err, GithubError::Status { status: 404, .. }));
    }
}
