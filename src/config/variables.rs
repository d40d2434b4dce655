//! Variable Placeholder Resolution
//!
//! Resolves `${NAME}` placeholders inside configuration values. Lookups go
//! through a caller-supplied function so tests never touch the process
//! environment.

use crate::error::ConfigError;

/// Resolves every `${NAME}` placeholder in `value`.
///
/// `key` is only used to attribute errors. A `$` that does not open a
/// placeholder is copied through unchanged.
///
/// # Example
///
/// ```
/// use batchcore::config::variables::resolve;
///
/// let value = resolve("ssh.host", "${HOST}.local", |name| {
///     (name == "HOST").then(|| "batch01".to_string())
/// }).unwrap();
/// assert_eq!(value, "batch01.local");
/// ```
pub fn resolve<F>(key: &str, value: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut resolved = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        resolved.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let Some(end) = after.find('}') else {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
                reason: "unterminated '${' placeholder".to_string(),
            });
        };

        let name = after[..end].trim();
        if name.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
                reason: "empty placeholder name".to_string(),
            });
        }

        let replacement = lookup(name).ok_or_else(|| ConfigError::UnresolvedVariable {
            key: key.to_string(),
            variable: name.to_string(),
        })?;
        resolved.push_str(&replacement);
        rest = &after[end + 1..];
    }

    resolved.push_str(rest);
    Ok(resolved)
}
