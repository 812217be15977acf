use rand::Rng;

/// Base username derived from the email local part: lowercased, with
/// anything outside [a-z0-9._-] dropped. Falls back to "member" when the
/// local part sanitizes to nothing.
pub fn username_base(email: &str) -> String {
    let local = email.split('@').next().unwrap_or("");
    let base: String = local
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if base.is_empty() {
        "member".to_string()
    } else {
        base
    }
}

/// Candidate for the nth collision: the base itself first, then numeric
/// suffixes, then a random tail once the sequential space looks exhausted.
pub fn username_candidate(base: &str, attempt: u32) -> String {
    match attempt {
        0 => base.to_string(),
        1..=30 => format!("{}{}", base, attempt + 1),
        _ => {
            let tail: u32 = rand::rng().random_range(1000..10000);
            format!("{}{}", base, tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_comes_from_the_local_part() {
        assert_eq!(username_base("Ana.Souza@example.com"), "ana.souza");
        // Disallowed characters are dropped, not truncated at.
        assert_eq!(username_base("joão+tag@example.com"), "jootag");
        assert_eq!(username_base("@example.com"), "member");
    }

    #[test]
    fn candidates_start_at_the_base_then_add_suffixes() {
        assert_eq!(username_candidate("ana", 0), "ana");
        assert_eq!(username_candidate("ana", 1), "ana2");
        assert_eq!(username_candidate("ana", 5), "ana6");
        let random = username_candidate("ana", 31);
        assert!(random.starts_with("ana") && random.len() == 7);
    }
}
