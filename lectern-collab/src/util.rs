use lazy_static::lazy_static;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use regex::Regex;

lazy_static! {
    static ref NON_SLUG_REGEX: Regex = Regex::new("[^a-z0-9]+").expect("pattern compiles");
}

pub fn random_string(length: usize) -> String {
    let mut rng = thread_rng();

    std::iter::repeat(())
        .map(|_| rng.sample(Alphanumeric) as char)
        .take(length)
        .collect()
}

/// Turns a title into a url-safe slug. Returns [None] when nothing survives.
pub fn slugify(input: &str) -> Option<String> {
    let lowered = input.to_lowercase();
    let slug = NON_SLUG_REGEX
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string();

    if slug.is_empty() {
        None
    } else {
        Some(slug)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Algebra Review"), Some("algebra-review".to_string()));
        assert_eq!(slugify("  Phonics: Week 2! "), Some("phonics-week-2".to_string()));
        assert_eq!(slugify("!!!"), None);
        assert_eq!(slugify(""), None);
    }
}
