const OPEN_TAG: &str = "<command>";
const CLOSE_TAG: &str = "</command>";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedReply {
    /// Reply text with every command span rendered as inline code.
    pub display: String,
    /// Proposed commands in document order.
    pub commands: Vec<String>,
}

/// Extracts `<command>...</command>` spans from a backend reply.
///
/// Spans may cover several lines; their content is trimmed at the ends only.
/// An opening tag without a matching close is left in the display text.
pub fn parse_commands(text: &str) -> ParsedReply {
    let mut display = String::with_capacity(text.len());
    let mut commands = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find(OPEN_TAG) {
        let after_open = &rest[open + OPEN_TAG.len()..];
        let Some(close) = after_open.find(CLOSE_TAG) else {
            break;
        };
        let command = after_open[..close].trim();

        display.push_str(&rest[..open]);
        display.push('`');
        display.push_str(command);
        display.push('`');
        if !command.is_empty() {
            commands.push(command.to_string());
        }

        rest = &after_open[close + CLOSE_TAG.len()..];
    }
    display.push_str(rest);

    ParsedReply {
        display: display.trim().to_string(),
        commands,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_span_becomes_code() {
        let parsed = parse_commands("Run <command>ls -la</command> please");
        assert_eq!(parsed.display, "Run `ls -la` please");
        assert_eq!(parsed.commands, vec!["ls -la"]);
    }

    #[test]
    fn multiple_spans_keep_document_order() {
        let parsed = parse_commands(
            "First:\n<command>cd /tmp</command>\nthen\n<command>  ls  </command>\n",
        );
        assert_eq!(parsed.commands, vec!["cd /tmp", "ls"]);
        assert_eq!(parsed.display, "First:\n`cd /tmp`\nthen\n`ls`");
    }

    #[test]
    fn multiline_span_is_a_single_command() {
        let parsed = parse_commands("<command>\nls -la\ngrep foo\n</command>");
        assert_eq!(parsed.commands, vec!["ls -la\ngrep foo"]);
        assert_eq!(parsed.display, "`ls -la\ngrep foo`");
    }

    #[test]
    fn no_markup_passes_text_through() {
        let parsed = parse_commands("  just talking  ");
        assert!(parsed.commands.is_empty());
        assert_eq!(parsed.display, "just talking");
    }

    #[test]
    fn empty_span_is_not_a_command() {
        let parsed = parse_commands("nothing <command>   </command> here");
        assert!(parsed.commands.is_empty());
        assert_eq!(parsed.display, "nothing `` here");
    }

    #[test]
    fn unterminated_span_is_left_alone() {
        let parsed = parse_commands("use <command>ls");
        assert!(parsed.commands.is_empty());
        assert_eq!(parsed.display, "use <command>ls");
    }
}
