//! Property name to storage column allocation.
//!
//! User-supplied property names are free-form. Storage columns are not: they
//! must be short, lowercase, and drawn from `[a-z0-9_]`. Allocated columns are
//! prefixed with [`PROPERTY_PREFIX`] so they can never shadow a base column.

use std::sync::OnceLock;

use regex::Regex;

pub const PROPERTY_PREFIX: &str = "p";
pub const MAX_COLUMN_BODY_LEN: usize = 30;

fn case_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([a-z])([A-Z])").expect("valid case boundary regex"))
}

fn separators() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.\-\s]").expect("valid separator regex"))
}

fn unsupported() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_]").expect("valid charset regex"))
}

fn repeated_underscores() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_+").expect("valid underscore regex"))
}

/// Normalizes a property name into the unprefixed column body.
pub fn normalize_property_name(name: &str) -> String {
    let trimmed = name.trim();
    let split = case_boundary().replace_all(trimmed, "${1}_${2}");
    let separated = separators().replace_all(&split, "_");
    let stripped = unsupported().replace_all(&separated, "");
    let collapsed = repeated_underscores().replace_all(&stripped, "_");
    collapsed
        .chars()
        .take(MAX_COLUMN_BODY_LEN)
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Allocates a column for `name` that does not collide with `existing`.
pub fn allocate_column_name<S: AsRef<str>>(name: &str, existing: &[S]) -> String {
    let base = format!("{PROPERTY_PREFIX}_{}", normalize_property_name(name));
    let taken = |candidate: &str| existing.iter().any(|col| col.as_ref() == candidate);
    let mut column = base.clone();
    let mut suffix = 0usize;
    while taken(&column) {
        suffix += 1;
        column = format!("{base}{suffix}");
    }
    column
}
