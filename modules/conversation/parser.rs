use super::types::*;
use crate::modules::error::ParseError;

/// Splits a chat document into ordered conversation units
pub struct ConversationParser {
    config: ParseConfig,
}

/// What a directive line opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Message(Role),
    Error,
}

#[derive(Debug)]
struct Block {
    kind: BlockKind,
    /// Index of the directive line within the unit's lines
    first_line: usize,
    /// Absolute 1-based line number, for error reporting
    line_number: usize,
    content: Vec<String>,
    /// Comment, option and closed-block blank lines seen after the directive
    kept: Vec<usize>,
}

/// Accumulates the lines of one unit until its separator
#[derive(Debug, Default)]
struct UnitBuilder<'a> {
    start_line: usize,
    lines: Vec<&'a str>,
    blocks: Vec<Block>,
    options: UnitOptions,
    open_block: bool,
}

impl ConversationParser {
    pub fn new() -> Self {
        Self {
            config: ParseConfig::default(),
        }
    }

    pub fn with_config(config: ParseConfig) -> Self {
        Self { config }
    }

    /// Parse a whole document. The result renders back to the same prompt text.
    pub fn parse(&self, text: &str) -> Result<ConversationDocument, ParseError> {
        let mut segments: Vec<UnitBuilder> = vec![UnitBuilder::starting_at(1)];

        for (idx, raw_line) in text.split_inclusive('\n').enumerate() {
            let line_number = idx + 1;
            let line = strip_line_ending(raw_line);

            if line.trim_end() == self.config.separator {
                segments.push(UnitBuilder::starting_at(line_number + 1));
                continue;
            }

            let current = segments
                .last_mut()
                .ok_or_else(|| error(line_number, "internal parser state lost"))?;
            current.push_line(raw_line, line, line_number)?;
        }

        let segment_count = segments.len();
        let mut units = Vec::with_capacity(segment_count);
        for (idx, segment) in segments.into_iter().enumerate() {
            if segment.is_blank() && (segment_count == 1 || idx == segment_count - 1) {
                // Empty document, or a separator closing the last unit
                continue;
            }
            let position = units.len();
            units.push(segment.finish(position)?);
        }

        Ok(ConversationDocument {
            units,
            separator: self.config.separator.clone(),
            line_ending: LineEnding::detect(text),
        })
    }
}

impl Default for ConversationParser {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> UnitBuilder<'a> {
    fn starting_at(start_line: usize) -> Self {
        Self {
            start_line,
            ..Default::default()
        }
    }

    fn is_blank(&self) -> bool {
        self.lines.iter().all(|l| l.trim().is_empty())
    }

    fn push_line(&mut self, raw_line: &'a str, line: &str, line_number: usize) -> Result<(), ParseError> {
        let index = self.lines.len();
        self.lines.push(raw_line);

        if line.starts_with(COMMENT_CHAR) {
            self.keep(index);
            return Ok(());
        }

        if let Some(directive) = line.strip_prefix(DIRECTIVE_CHAR) {
            return self.push_directive(directive, index, line_number);
        }

        if !self.open_block {
            if line.trim().is_empty() {
                self.keep(index);
                return Ok(());
            }
            return Err(error(line_number, "text outside of a message block"));
        }

        let content = line.strip_prefix(ESCAPE_CHAR).unwrap_or(line);
        if let Some(block) = self.blocks.last_mut() {
            block.content.push(content.to_string());
        }
        Ok(())
    }

    fn keep(&mut self, index: usize) {
        if let Some(block) = self.blocks.last_mut() {
            block.kept.push(index);
        }
    }

    fn push_directive(&mut self, directive: &str, index: usize, line_number: usize) -> Result<(), ParseError> {
        let (name, rest) = match directive.find(char::is_whitespace) {
            Some(i) => (&directive[..i], directive[i..].trim()),
            None => (directive, ""),
        };

        let kind = match name.to_lowercase().as_str() {
            "system" | "sys" => BlockKind::Message(Role::System),
            "user" => BlockKind::Message(Role::User),
            "assistant" => BlockKind::Message(Role::Assistant),
            "error" => BlockKind::Error,
            "model" => {
                if rest.is_empty() {
                    return Err(error(line_number, "`:model` requires a model identifier"));
                }
                self.options.model = Some(rest.to_string());
                self.open_block = false;
                self.keep(index);
                return Ok(());
            }
            "temperature" | "temp" => {
                let value = rest
                    .parse::<f32>()
                    .map_err(|_| error(line_number, format!("invalid temperature `{}`", rest)))?;
                self.options.temperature = Some(value);
                self.open_block = false;
                self.keep(index);
                return Ok(());
            }
            "max_tokens" => {
                let value = rest
                    .parse::<u32>()
                    .map_err(|_| error(line_number, format!("invalid max_tokens `{}`", rest)))?;
                self.options.max_tokens = Some(value);
                self.open_block = false;
                self.keep(index);
                return Ok(());
            }
            other => return Err(error(line_number, format!("unknown directive `:{}`", other))),
        };

        let mut content = Vec::new();
        if !rest.is_empty() {
            content.push(rest.to_string());
        }
        self.blocks.push(Block {
            kind,
            first_line: index,
            line_number,
            content,
            kept: Vec::new(),
        });
        self.open_block = true;
        Ok(())
    }

    fn finish(mut self, position: usize) -> Result<ConversationUnit, ParseError> {
        if self.blocks.is_empty() {
            return Err(error(self.start_line, "conversation has no messages"));
        }

        // Cut the trailing failure marker: the unit becomes pending again.
        // Lines kept inside the cut block survive as the trailer.
        let mut cut = self.lines.len();
        let mut trailer_lines = Vec::new();
        if let Some(pos) = self.blocks.iter().position(|b| b.kind == BlockKind::Error) {
            if pos != self.blocks.len() - 1 {
                return Err(error(
                    self.blocks[pos].line_number,
                    "`:error` is only allowed as the last block of a conversation",
                ));
            }
            if let Some(block) = self.blocks.pop() {
                cut = block.first_line;
                trailer_lines = block.kept;
            }
        }

        let mut messages: Vec<(Message, usize)> = self
            .blocks
            .iter()
            .filter_map(|b| match b.kind {
                BlockKind::Message(role) => Some((Message::new(role, join_content(&b.content)), b.first_line)),
                BlockKind::Error => None,
            })
            .collect();

        let mut completion = None;
        if cut == self.lines.len() && messages.last().map(|(m, _)| m.role) == Some(Role::Assistant) {
            if let Some((message, first_line)) = messages.pop() {
                completion = Some(message.content);
                cut = first_line;
                if let Some(block) = self.blocks.last_mut() {
                    trailer_lines = std::mem::take(&mut block.kept);
                }
            }
        }

        if !messages.iter().any(|(m, _)| m.role == Role::User) {
            return Err(error(self.start_line, "conversation has no user message"));
        }

        let text: String = self.lines[..cut].concat();
        let trailer: String = trailer_lines.iter().map(|&i| self.lines[i]).collect();
        let prompt = Prompt {
            text,
            messages: messages.into_iter().map(|(m, _)| m).collect(),
            options: self.options,
            trailer,
        };
        Ok(ConversationUnit::new(position, prompt, completion))
    }
}

fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Join content lines, trimming blank lines at both ends
fn join_content(lines: &[String]) -> String {
    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());
    match (start, end) {
        (Some(start), Some(end)) => lines[start..=end].join("\n"),
        _ => String::new(),
    }
}

/// Normalize model output the same way parsed content is normalized, so that
/// a rendered completion parses back to the identical string
pub fn normalize_content(content: &str) -> String {
    let lines: Vec<String> = content
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
        .collect();
    join_content(&lines)
}

fn error(line: usize, message: impl Into<String>) -> ParseError {
    ParseError {
        line,
        message: message.into(),
    }
}
