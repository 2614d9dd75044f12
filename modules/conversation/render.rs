use super::types::*;

/// Reassemble a document, emitting units strictly by position
pub fn render_document(document: &ConversationDocument) -> String {
    let mut units: Vec<&ConversationUnit> = document.units.iter().collect();
    units.sort_by_key(|u| u.position());

    let newline = document.line_ending.as_str();
    let mut output = String::with_capacity(units.iter().map(|u| u.prompt().text.len() + 64).sum());
    for (i, unit) in units.into_iter().enumerate() {
        if i > 0 {
            output.push_str(&document.separator);
            output.push_str(newline);
        }
        render_unit(unit, &document.separator, document.line_ending, &mut output);
    }
    output
}

/// Render one unit: its verbatim prompt, then a completion or failure block,
/// then the lines that followed that block in the source
pub fn render_unit(unit: &ConversationUnit, separator: &str, line_ending: LineEnding, output: &mut String) {
    let prompt = unit.prompt();
    output.push_str(&prompt.text);

    let block = match unit.status() {
        UnitStatus::Completed => unit
            .completion()
            .map(|content| format!("{}assistant\n{}\n", DIRECTIVE_CHAR, escape_content(content, separator))),
        UnitStatus::Failed => unit.failure().map(|failure| format!("{}\n", failure_marker(failure))),
        UnitStatus::Pending | UnitStatus::InProgress => None,
    };

    if let Some(block) = block {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push_str(line_ending.as_str());
        }
        output.push_str(&line_ending.apply(block));
    }
    output.push_str(&prompt.trailer);
}

/// Single-line `:error` block standing in for a missing completion
pub fn failure_marker(failure: &UnitFailure) -> String {
    let plural = if failure.attempts == 1 { "" } else { "s" };
    let message = failure.message.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(
        "{}error {} after {} attempt{}: {}",
        DIRECTIVE_CHAR, failure.kind, failure.attempts, plural, message
    )
}

/// Prefix content lines that would otherwise parse as syntax
pub fn escape_content(content: &str, separator: &str) -> String {
    content
        .split('\n')
        .map(|line| {
            if needs_escape(line, separator) {
                format!("{}{}", ESCAPE_CHAR, line)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn needs_escape(line: &str, separator: &str) -> bool {
    line.starts_with(DIRECTIVE_CHAR)
        || line.starts_with(COMMENT_CHAR)
        || line.starts_with(ESCAPE_CHAR)
        || line.trim_end() == separator
}
