//! Helpers over dotted parameter names.

/// Splits `blocks.0.attn.weight` into (`blocks.0.attn`, `weight`).
/// Top-level tensors belong to the root module, the empty string.
pub fn split_param_key(key: &str) -> (&str, &str) {
    match key.rfind('.') {
        Some(idx) => (&key[..idx], &key[idx + 1..]),
        None => ("", key),
    }
}

pub fn param_key(module: &str, leaf: &str) -> String {
    if module.is_empty() {
        leaf.to_string()
    } else {
        format!("{module}.{leaf}")
    }
}

/// True when `name` is `ancestor` itself or sits below it in the hierarchy.
pub fn is_within(name: &str, ancestor: &str) -> bool {
    match name.strip_prefix(ancestor) {
        Some("") => true,
        Some(rest) => !ancestor.is_empty() && rest.starts_with('.'),
        None => false,
    }
}
