//! Remote Shell Command Lines
//!
//! Builds the single string sent to a remote login shell. Every token is
//! double-quoted after backslash-escaping `$`, `` ` ``, `"`, `\` and newline;
//! environment variables are rendered as `NAME="value"` assignments in front
//! of the command.

use std::collections::BTreeMap;

use log::warn;

/// Characters escaped with a backslash inside a double-quoted token.
const ESCAPED: &[char] = &['$', '`', '"', '\\', '\n'];

/// Quotes one token for a POSIX shell.
///
/// ```
/// use batchcore::execution::shell::quote;
///
/// assert_eq!(quote("a $b"), "\"a \\$b\"");
/// ```
pub fn quote(token: &str) -> String {
    let mut quoted = String::with_capacity(token.len() + 2);
    quoted.push('"');
    for c in token.chars() {
        if ESCAPED.contains(&c) {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Returns true if `name` matches `[A-Za-z_][0-9A-Za-z_]*`.
pub fn is_valid_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Builds `NAME="value" ... "token" "token"` for a remote shell.
///
/// Variables whose names are not shell identifiers are dropped with a
/// warning. Assignments are emitted in name order.
pub fn build_command_line(command_line: &[String], environment: &BTreeMap<String, String>) -> String {
    let mut parts = Vec::with_capacity(environment.len() + command_line.len());

    for (name, value) in environment {
        if !is_valid_variable_name(name) {
            warn!(
                target: "batchcore::ssh",
                "Dropping environment variable with invalid name: {:?}", name
            );
            continue;
        }
        parts.push(format!("{}={}", name, quote(value)));
    }

    parts.extend(command_line.iter().map(|token| quote(token)));
    parts.join(" ")
}
