pub mod chat;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod dot;
pub mod export;
pub mod extract;
pub mod github;
pub mod ir;
pub mod layout;
pub mod prompts;
pub mod render;
pub mod script;
pub mod session;
pub mod theme;

#[cfg(feature = "cli")]
pub use cli::run;
pub use extract::{DiagramScript, extract};
pub use script::{Execution, ScriptError, ScriptRunner};
pub use session::{DiagramOutcome, Session};
