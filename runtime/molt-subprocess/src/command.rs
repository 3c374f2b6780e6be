//! Command-line and environment construction for `CreateProcessW`.

use crate::error::SubprocessError;
use std::borrow::Cow;

/// Quotes one argument so the Microsoft C runtime parses it back unchanged.
///
/// Arguments without whitespace or quotes pass through as they are. Otherwise
/// the argument is wrapped in quotes, every quote is escaped, and any run of
/// backslashes in front of a quote (or of the closing quote) is doubled.
pub fn quote_argument(arg: &str) -> Cow<'_, str> {
    if !arg.is_empty() && !arg.chars().any(|ch| ch.is_whitespace() || ch == '"') {
        return Cow::Borrowed(arg);
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0usize;
    for ch in arg.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                push_backslashes(&mut quoted, backslashes * 2 + 1);
                quoted.push('"');
                backslashes = 0;
            }
            _ => {
                push_backslashes(&mut quoted, backslashes);
                quoted.push(ch);
                backslashes = 0;
            }
        }
    }
    push_backslashes(&mut quoted, backslashes * 2);
    quoted.push('"');
    Cow::Owned(quoted)
}

fn push_backslashes(out: &mut String, count: usize) {
    out.extend(std::iter::repeat_n('\\', count));
}

/// `cmd.exe` gets its `/C` string verbatim inside one pair of quotes.
fn is_shell_invocation(command: &str, args: &[String]) -> bool {
    if args.len() != 3 || !ends_with_ignore_case(command, r"\cmd.exe") {
        return false;
    }
    let flag = args[1].to_ascii_lowercase();
    flag == "/c" || flag == "/s/c"
}

fn is_batch_file(command: &str) -> bool {
    ends_with_ignore_case(command, ".bat") || ends_with_ignore_case(command, ".cmd")
}

fn ends_with_ignore_case(value: &str, suffix: &str) -> bool {
    value.len() >= suffix.len()
        && value.is_char_boundary(value.len() - suffix.len())
        && value[value.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}

/// Returns the application path and command line to hand to the OS.
///
/// `args` is the full argument vector, program name included.
pub fn build_command_line(command: &str, args: &[String], comspec: &str) -> (String, String) {
    let mut words: Vec<String> = if is_shell_invocation(command, args) {
        vec![
            quote_argument(&args[0]).into_owned(),
            "/S/C".to_string(),
            format!("\"{}\"", args[2]),
        ]
    } else {
        args.iter()
            .map(|arg| quote_argument(arg).into_owned())
            .collect()
    };

    let mut application = command.to_string();
    // Batch files cannot be started directly; run them through the shell.
    if is_batch_file(command) {
        application = comspec.to_string();
        words = vec![
            "cmd.exe".to_string(),
            "/s/c".to_string(),
            format!("\"{}\"", words.join(" ")),
        ];
    }
    (application, words.join(" "))
}

/// NUL separated, double-NUL terminated UTF-16 block. Empty entries are
/// dropped since they would end the block early.
pub fn environment_block(environment: &[String]) -> Vec<u16> {
    let mut block: Vec<u16> = Vec::new();
    for entry in environment.iter().filter(|entry| !entry.is_empty()) {
        if !block.is_empty() {
            block.push(0);
        }
        block.extend(entry.encode_utf16());
    }
    block.extend([0, 0]);
    block
}

pub fn check_no_nul(what: &str, value: &str) -> Result<(), SubprocessError> {
    if value.contains('\0') {
        return Err(SubprocessError::InvalidOption(format!(
            "{what} contains a NUL character"
        )));
    }
    Ok(())
}
