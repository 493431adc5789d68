//! Redacting `Display`-like trait for anything that might end up in a log
//! line, most importantly the effective service configuration at startup.

/// Implemented by config and model types that may carry secret-shaped
/// fields (tokens, keys). `to_safe_string` must never include the secret
/// value itself, only a placeholder such as `****`.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    /// Same as [`to_safe_string`], but with every line indented two
    /// spaces — used when nesting a sub-config's safe string inside a
    /// parent's.
    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
