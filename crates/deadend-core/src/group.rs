//! Inventory group naming.
//!
//! Group names must be valid Ansible identifiers, so every character outside
//! `[A-Za-z0-9_]` is replaced with `_`. The mapping is a pure function of its
//! input and applying it twice yields the same result.

use crate::ids::DeviceKey;

/// Normalize a namespace, label key or label value into a group-safe name.
#[must_use]
pub fn normalize_group(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// The primary group of a device: its normalized namespace.
#[must_use]
pub fn namespace_group(namespace: &str) -> String {
    normalize_group(namespace)
}

/// The secondary group derived from a single label pair.
#[must_use]
pub fn label_group(key: &str, value: &str) -> String {
    normalize_group(&format!("{key}_{value}"))
}

/// The inventory hostname of a device: `<namespace group>-<device name>`.
#[must_use]
pub fn hostname_for(key: &DeviceKey) -> String {
    format!("{}-{}", namespace_group(key.namespace()), key.name())
}
