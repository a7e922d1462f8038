// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Utility functions for pipeline configuration.

/// Parses and validates the namespace of the durable slot.
///
/// The namespace doubles as a file name for the file-backed store, so a valid
/// namespace must:
/// - Start with an ASCII letter
/// - Contain only ASCII alphanumerics, hyphens, underscores, or periods
/// - Not be empty or contain only whitespace
///
/// Whitespace is automatically trimmed from the input.
///
/// # Examples
///
/// ```
/// use beacon::util::parse_storage_namespace;
///
/// assert_eq!(parse_storage_namespace("beacon-storage"), Some("beacon-storage".to_string()));
/// assert_eq!(parse_storage_namespace("1invalid"), None);
/// assert_eq!(parse_storage_namespace("../etc"), None);
/// ```
pub fn parse_storage_namespace(namespace: &str) -> Option<String> {
    let trimmed = namespace.trim();
    let mut chars = trimmed.chars();

    match chars.next() {
        Some(first_char) if first_char.is_ascii_alphabetic() => {}
        Some(_) => {
            tracing::error!(
                "BEACON_STORAGE_NAMESPACE must start with a letter, got: '{}'. Ignoring namespace.",
                trimmed
            );
            return None;
        }
        None => return None,
    }

    if let Some(invalid_char) =
        chars.find(|&ch| !ch.is_ascii_alphanumeric() && ch != '-' && ch != '_' && ch != '.')
    {
        tracing::error!(
            "BEACON_STORAGE_NAMESPACE contains invalid character '{}' in '{}'. Only ASCII alphanumerics, hyphens, underscores, and periods are allowed. Ignoring namespace.",
            invalid_char, trimmed
        );
        return None;
    }

    Some(trimmed.to_string())
}
