//! Runs the Codex CLI once per conversational turn and turns its terminal
//! output into a stream of [`BridgeEvent`]s.

mod classifier;
mod config;
mod error;
mod events;
mod launcher;
mod path_resolver;
mod registry;
mod session;
mod temp_resources;
mod turn;

pub use classifier::LineRules;
pub use classifier::OutputClassifier;
pub use classifier::StderrDecoder;
pub use classifier::classify_stderr;
pub use config::BridgeConfig;
pub use config::CODEX_PATH_ENV_VAR;
pub use config::DEFAULT_CODEX_COMMAND;
pub use error::BridgeError;
pub use error::ErrorKind;
pub use error::Result;
pub use events::BridgeEvent;
pub use events::EventSink;
pub use events::TurnStatus;
pub use launcher::ENV_OVERRIDES;
pub use launcher::LaunchOptions;
pub use launcher::TurnOptions;
pub use launcher::build_args;
pub use launcher::is_reasoning_model;
pub use path_resolver::ResolvedCommand;
pub use path_resolver::resolve_command;
pub use registry::KillSignal;
pub use registry::ProcessControl;
pub use registry::ProcessHandle;
pub use registry::ProcessRegistry;
pub use session::InMemorySessionStore;
pub use session::JsonSessionStore;
pub use session::MessageRole;
pub use session::SessionStore;
pub use session::StoredMessage;
pub use session::StoredSession;
pub use temp_resources::Attachment;
pub use temp_resources::TempResources;
pub use turn::Bridge;
pub use turn::TurnOutcome;
pub use turn::TurnRequest;
