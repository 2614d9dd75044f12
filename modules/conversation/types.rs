use serde::{Deserialize, Serialize};

/// Default line separating two conversation units
pub const DEFAULT_SEPARATOR: &str = "===";

/// Prefix of every directive line (`:user`, `:assistant`, ...)
pub const DIRECTIVE_CHAR: char = ':';

/// Prefix of comment lines, kept verbatim in the prompt text
pub const COMMENT_CHAR: char = '#';

/// Prefix protecting content lines that would otherwise read as syntax
pub const ESCAPE_CHAR: char = '\\';

/// Configuration for parsing and rendering conversation documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseConfig {
    /// Line separating two conversation units
    pub separator: String,
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }
}

impl ParseConfig {
    /// A separator must be non-empty and must not read as a directive,
    /// comment or escaped line
    pub fn validate(&self) -> Result<(), String> {
        let separator = self.separator.trim_end();
        if separator.is_empty() || separator != self.separator {
            return Err("separator must be non-empty without trailing whitespace".to_string());
        }
        if separator.starts_with([DIRECTIVE_CHAR, COMMENT_CHAR, ESCAPE_CHAR]) {
            return Err(format!("separator `{}` collides with document syntax", separator));
        }
        Ok(())
    }
}

/// Line ending a document is written with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LineEnding {
    #[default]
    Lf,
    CrLf,
}

impl LineEnding {
    /// The ending of the first line decides for the whole document
    pub fn detect(text: &str) -> Self {
        match text.find('\n') {
            Some(i) if text[..i].ends_with('\r') => LineEnding::CrLf,
            _ => LineEnding::Lf,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }

    /// Convert `\n`-terminated generated text to this line ending
    pub fn apply(&self, text: String) -> String {
        match self {
            LineEnding::Lf => text,
            LineEnding::CrLf => text.replace('\n', "\r\n"),
        }
    }
}

/// Role of one message within a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Per-unit overrides declared with `:model`, `:temperature` and `:max_tokens`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// The immutable prompt side of a conversation unit
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    /// Verbatim source text of the unit, without its completion or failure block
    pub text: String,
    /// Messages sent to the model, in document order
    pub messages: Vec<Message>,
    pub options: UnitOptions,
    /// Comment and option lines found after the completion or failure
    /// block, re-emitted verbatim after it
    pub trailer: String,
}

/// Lifecycle of a conversation unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Why a unit ended without a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Authentication or permanent rejection, never retried
    Fatal,
    /// Timeouts or rate limits outlasted the retry budget
    RetriesExhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Fatal => "fatal",
            FailureKind::RetriesExhausted => "retries-exhausted",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure attached to a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

/// One self-contained prompt and reply fragment of a document
#[derive(Debug, Clone)]
pub struct ConversationUnit {
    position: usize,
    prompt: Prompt,
    completion: Option<String>,
    failure: Option<UnitFailure>,
    status: UnitStatus,
    attempts: u32,
}

impl ConversationUnit {
    /// Create a unit from parsed source. A completion already present in the
    /// source makes the unit completed without any job.
    pub fn new(position: usize, prompt: Prompt, completion: Option<String>) -> Self {
        let status = if completion.is_some() {
            UnitStatus::Completed
        } else {
            UnitStatus::Pending
        };
        Self {
            position,
            prompt,
            completion,
            failure: None,
            status,
            attempts: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn prompt(&self) -> &Prompt {
        &self.prompt
    }

    pub fn completion(&self) -> Option<&str> {
        self.completion.as_deref()
    }

    pub fn failure(&self) -> Option<&UnitFailure> {
        self.failure.as_ref()
    }

    pub fn status(&self) -> UnitStatus {
        self.status
    }

    /// Attempts made by the job of this run (0 when no job ran)
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn needs_completion(&self) -> bool {
        self.status == UnitStatus::Pending
    }

    pub fn mark_in_progress(&mut self) {
        debug_assert_eq!(self.status, UnitStatus::Pending);
        self.status = UnitStatus::InProgress;
    }

    pub fn set_completed(&mut self, content: String, attempts: u32) {
        debug_assert_eq!(self.status, UnitStatus::InProgress);
        self.completion = Some(super::parser::normalize_content(&content));
        self.attempts = attempts;
        self.status = UnitStatus::Completed;
    }

    pub fn set_failed(&mut self, failure: UnitFailure) {
        debug_assert_eq!(self.status, UnitStatus::InProgress);
        self.attempts = failure.attempts;
        self.failure = Some(failure);
        self.status = UnitStatus::Failed;
    }
}

/// A parsed document: ordered units plus the separator used to join them
#[derive(Debug, Clone)]
pub struct ConversationDocument {
    pub units: Vec<ConversationUnit>,
    pub separator: String,
    pub line_ending: LineEnding,
}

impl ConversationDocument {
    pub fn pending_count(&self) -> usize {
        self.units.iter().filter(|u| u.needs_completion()).count()
    }
}
