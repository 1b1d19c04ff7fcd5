/// Split a command line into words, honoring single quotes, double quotes and
/// backslash escapes. An unterminated quote runs to the end of the line.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut escape_next = false;

    for ch in input.chars() {
        if escape_next {
            current.push(ch);
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if !in_single_quote => {
                escape_next = true;
                in_word = true;
            }
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                in_word = true;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                in_word = true;
            }
            c if c.is_whitespace() && !in_single_quote && !in_double_quote => {
                if in_word {
                    tokens.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }

    // A trailing lone backslash is kept literally.
    if escape_next {
        current.push('\\');
    }
    if in_word {
        tokens.push(current);
    }
    tokens
}

/// Whitespace-normalized form of a command line: words joined by one space.
pub fn normalize(input: &str) -> String {
    tokenize(input).join(" ")
}

/// True when `prefix` matches `words` on whole-word boundaries.
pub fn is_word_prefix(prefix: &[String], words: &[String]) -> bool {
    !prefix.is_empty() && prefix.len() <= words.len() && prefix.iter().zip(words).all(|(a, b)| a == b)
}
