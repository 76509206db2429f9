//! Identifier safety rules for template parameters and resource names.

/// Strip a resource name down to a safe template identifier: alphanumerics
/// only, a leading digit gets a `p` prefix.
pub fn safe_name(name: &str) -> String {
    let mut safe: String = name.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if safe.is_empty() {
        safe.push_str("resource");
    }
    if safe.starts_with(|c: char| c.is_ascii_digit()) {
        safe.insert(0, 'p');
    }
    safe
}

/// Storage account names have their own rules: lowercase alphanumerics,
/// between 3 and 24 characters.
pub fn storage_account_name(name: &str) -> String {
    let mut safe: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    while safe.len() < 3 {
        safe.push('0');
    }
    safe.truncate(24);
    safe
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_non_alphanumerics() {
        assert_eq!(safe_name("vnet-a"), "vneta");
        assert_eq!(safe_name("my_app.prod"), "myappprod");
    }

    #[test]
    fn prefixes_leading_digit() {
        assert_eq!(safe_name("0storage"), "p0storage");
        assert_eq!(safe_name("42"), "p42");
    }

    #[test]
    fn empty_names_get_a_placeholder() {
        assert_eq!(safe_name("---"), "resource");
    }

    #[test]
    fn storage_names_are_lowercased_and_bounded() {
        assert_eq!(storage_account_name("My-Storage"), "mystorage");
        assert_eq!(storage_account_name("ab"), "ab0");
        let long = storage_account_name("a".repeat(40).as_str());
        assert_eq!(long.len(), 24);
    }
}
