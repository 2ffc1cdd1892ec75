use anyhow::Result;

const GLOB_METACHARACTERS: [char; 5] = ['*', '?', '[', ']', '\\'];

/// Namespaces prefix every key as `{namespace}:...` and end up inside
/// `SCAN MATCH` patterns. They must be non-empty and free of whitespace,
/// glob metacharacters and the `:` separator, so that one namespace's
/// pattern can never match the keys of another.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() {
        anyhow::bail!("namespace cannot be empty");
    }
    if namespace.chars().any(char::is_whitespace) {
        anyhow::bail!("namespace '{namespace}' must not contain whitespace");
    }
    if namespace.contains(':') {
        anyhow::bail!("namespace '{namespace}' must not contain the key separator ':'");
    }
    if let Some(found) = namespace.chars().find(|c| GLOB_METACHARACTERS.contains(c)) {
        anyhow::bail!("namespace '{namespace}' must not contain glob character '{found}'");
    }
    Ok(())
}
