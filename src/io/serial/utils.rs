// src/io/serial/utils.rs
//
// Shared helpers for serial session configuration.

/// End-of-line token used when none is configured
pub const DEFAULT_EOL: &str = "\n";

/// Value separator used when none is configured
pub const DEFAULT_SEPARATOR: &str = ":";

/// Interpret an end-of-line token given in escaped form.
///
/// Settings and UI fields carry the token as typed text, so the two characters
/// `\` `n` must become a single LF. Escapes follow JSON string rules
/// (`\n`, `\r`, `\t`, `\\`, `\uXXXX`, ...). Text that is not a valid escaped
/// string is used verbatim, and an empty token means `"\n"`.
pub fn unescape_eol(eol: &str) -> String {
    if eol.is_empty() {
        return DEFAULT_EOL.to_string();
    }
    match serde_json::from_str::<String>(&format!("\"{}\"", eol)) {
        Ok(s) if !s.is_empty() => s,
        _ => eol.to_string(),
    }
}

/// Separator token, falling back to the default when blank
pub fn separator_or_default(separator: &str) -> String {
    if separator.is_empty() {
        DEFAULT_SEPARATOR.to_string()
    } else {
        separator.to_string()
    }
}
