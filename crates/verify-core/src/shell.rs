//! Shell quoting for probe and launch command lines.

/// Quote a word for `sh`. Safe words, and paths starting with `~/`, pass through
/// unchanged so tilde expansion still happens on the far side.
pub fn quote(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_safe) {
        return word.to_string();
    }
    if let Some(rest) = word.strip_prefix("~/") {
        if rest.chars().all(is_safe) {
            return word.to_string();
        }
        return format!("~/{}", quote(rest));
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '=' | ':' | ',' | '+' | '@')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_words_are_unchanged() {
        assert_eq!(quote("/tmp/work/counter.py"), "/tmp/work/counter.py");
        assert_eq!(quote("~/verify"), "~/verify");
    }

    #[test]
    fn unsafe_words_are_single_quoted() {
        assert_eq!(quote("my file.txt"), "'my file.txt'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("~/my dir"), "~/'my dir'");
    }
}
