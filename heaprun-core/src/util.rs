//! String helpers shared by the models: shell-style splitting and quoting,
//! and environment-variable expansion in argv tokens and paths.

use std::sync::OnceLock;

use regex::Regex;

/// Split a string into tokens, honoring single and double quotes.
///
/// Quotes may appear mid-token: `-D"foo bar"` yields `-Dfoo bar`.
pub fn split_quoted(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                started = true;
                let quote = c;
                for inner in chars.by_ref() {
                    if inner == quote {
                        break;
                    }
                    current.push(inner);
                }
            }
            '\\' => {
                started = true;
                if let Some(&next) = chars.peek() {
                    current.push(next);
                    chars.next();
                }
            }
            c if c.is_whitespace() => {
                if started {
                    tokens.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                started = true;
                current.push(c);
            }
        }
    }
    if started {
        tokens.push(current);
    }
    tokens
}

/// Quote a string for display in a reproducible command line.
///
/// Strings consisting only of characters that are safe in an unquoted shell
/// word are passed through unchanged.
pub fn smart_quote(s: &str) -> String {
    if s.is_empty() {
        return "\"\"".to_string();
    }
    let safe = s
        .chars()
        .all(|c| c.is_alphanumeric() || ".:/+=-_".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("\"{}\"", s)
    }
}

fn env_var_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$(?:([A-Za-z_][A-Za-z0-9_]*)|\{([A-Za-z_][A-Za-z0-9_]*)\})")
            .unwrap_or_else(|e| panic!("invalid env var pattern: {}", e))
    })
}

/// Expand `$VAR` and `${VAR}` references against the process environment.
///
/// References to unset variables are left verbatim, so a bogus `$TYPO/bin`
/// path stays visible in warnings and dry-run output instead of silently
/// collapsing to `/bin`.
pub fn expand_env(s: &str) -> String {
    env_var_pattern()
        .replace_all(s, |caps: &regex::Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match std::env::var(name) {
                Ok(val) => val,
                Err(_) => caps
                    .get(0)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
            }
        })
        .into_owned()
}
