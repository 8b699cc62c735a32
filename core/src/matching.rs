//! IRC casemapping and wildcard mask comparison

use wildmatch::WildMatch;

/// Maximum nick length accepted in masks
pub const NICKLEN: usize = 15;
/// Maximum username length accepted in masks
pub const USERLEN: usize = 10;
/// Maximum hostname length accepted in masks
pub const HOSTLEN: usize = 63;

/// rfc1459 lowercase: `[]\~` fold onto `{}|^`
pub fn irc_lower_char(c: char) -> char {
    match c {
        'A'..='Z' => c.to_ascii_lowercase(),
        '[' => '{',
        ']' => '}',
        '\\' => '|',
        '~' => '^',
        _ => c,
    }
}

/// rfc1459 lowercase of a whole string
pub fn irc_lower(s: &str) -> String {
    s.chars().map(irc_lower_char).collect()
}

/// Case-insensitive equality under rfc1459 casemapping
pub fn irc_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.chars().zip(b.chars()).all(|(x, y)| irc_lower_char(x) == irc_lower_char(y))
}

/// Does `mask` (with `*` and `?`) match `text`, ignoring case?
pub fn match_mask(mask: &str, text: &str) -> bool {
    WildMatch::new(&irc_lower(mask)).matches(&irc_lower(text))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tok {
    Star,
    Any,
    Lit(char),
}

fn tokenize(mask: &str) -> Vec<Tok> {
    let mut out = Vec::with_capacity(mask.len());
    let mut chars = mask.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if out.last() != Some(&Tok::Star) {
                    out.push(Tok::Star);
                }
            }
            '?' => out.push(Tok::Any),
            '\\' => match chars.next() {
                Some(esc) => out.push(Tok::Lit(irc_lower_char(esc))),
                None => out.push(Tok::Lit('\\')),
            },
            _ => out.push(Tok::Lit(irc_lower_char(c))),
        }
    }
    out
}

/// Mask-versus-mask comparison: true when every string matched by `new`
/// is also matched by `old`.
pub fn mmatch(old: &str, new: &str) -> bool {
    let o = tokenize(old);
    let n = tokenize(new);

    // dp[i][j]: o[i..] covers n[j..]
    let mut dp = vec![vec![false; n.len() + 1]; o.len() + 1];
    dp[o.len()][n.len()] = true;

    for i in (0..o.len()).rev() {
        for j in (0..=n.len()).rev() {
            dp[i][j] = match o[i] {
                // '*' absorbs nothing, or one more token of new
                Tok::Star => dp[i + 1][j] || (j < n.len() && dp[i][j + 1]),
                Tok::Any => j < n.len() && n[j] != Tok::Star && dp[i + 1][j + 1],
                Tok::Lit(c) => j < n.len() && n[j] == Tok::Lit(c) && dp[i + 1][j + 1],
            };
        }
    }

    dp[0][0]
}

/// Squash runs of `*`
pub fn collapse(mask: &str) -> String {
    let mut out = String::with_capacity(mask.len());
    let mut prev_star = false;
    for c in mask.chars() {
        if c == '*' {
            if !prev_star {
                out.push(c);
            }
            prev_star = true;
        } else {
            out.push(c);
            prev_star = false;
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn or_star(s: &str) -> &str {
    if s.is_empty() {
        "*"
    } else {
        s
    }
}

/// Normalise a raw ban argument into `nick!user@host`.
///
/// `nick` becomes `nick!*@*`, `user@host` becomes `*!user@host`, `nick!user`
/// becomes `nick!user@*`, and anything containing `.` or `:` without `!`/`@`
/// is taken as a host.
pub fn pretty_mask(raw: &str) -> String {
    let mask = collapse(raw);

    let (nick, user, host) = match (mask.find('!'), mask.find('@')) {
        (Some(bang), Some(at)) if bang < at => (&mask[..bang], &mask[bang + 1..at], &mask[at + 1..]),
        (_, Some(at)) => ("*", &mask[..at], &mask[at + 1..]),
        (Some(bang), None) => (&mask[..bang], &mask[bang + 1..], "*"),
        (None, None) => {
            if mask.contains('.') || mask.contains(':') {
                ("*", "*", mask.as_str())
            } else {
                (mask.as_str(), "*", "*")
            }
        }
    };

    format!(
        "{}!{}@{}",
        or_star(truncate(nick, NICKLEN)),
        or_star(truncate(user, USERLEN)),
        or_star(truncate(host, HOSTLEN))
    )
}

/// Is this an acceptable nickname?
pub fn is_valid_nick(nick: &str) -> bool {
    let Some(first) = nick.chars().next() else {
        return false;
    };
    if nick.len() > NICKLEN || first.is_ascii_digit() || first == '-' {
        return false;
    }
    nick.chars().all(|c| c.is_ascii_alphanumeric() || "-[]\\`_^{|}".contains(c))
}

/// Is this an acceptable channel name? `&` channels only when `local` is set.
pub fn is_valid_channel(name: &str, max_len: usize, local: bool) -> bool {
    let prefix_ok = name.starts_with('#') || (local && name.starts_with('&'));
    prefix_ok
        && name.len() > 1
        && name.len() <= max_len
        && !name.chars().any(|c| c == ' ' || c == ',' || c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_casemapping() {
        assert_eq!(irc_lower("Nick[A]\\~"), "nick{a}|^");
        assert!(irc_eq("#Test[1]", "#test{1}"));
        assert!(!irc_eq("#test", "#tests"));
    }

    #[test]
    fn test_match_mask() {
        assert!(match_mask("*!*@*.example.com", "Nick!user@bad.EXAMPLE.com"));
        assert!(match_mask("n?ck!*@*", "nick!u@h"));
        assert!(!match_mask("*!*@*.example.com", "nick!user@example.org"));
    }

    #[test]
    fn test_mmatch_generalisation() {
        assert!(mmatch("*!*@*.example.com", "*!*@bad.example.com"));
        assert!(!mmatch("*!*@bad.example.com", "*!*@*.example.com"));
        assert!(mmatch("*!*@*", "foo!*@*"));
        assert!(mmatch("a?c", "abc"));
        assert!(mmatch("a?c", "a?c"));
        assert!(!mmatch("a?c", "a*c"));
        assert!(mmatch("A*", "a?*"));
        assert!(mmatch("*!*@host", "*!*@HOST"));
    }

    #[test]
    fn test_pretty_mask() {
        assert_eq!(pretty_mask("nick"), "nick!*@*");
        assert_eq!(pretty_mask("user@host"), "*!user@host");
        assert_eq!(pretty_mask("nick!user"), "nick!user@*");
        assert_eq!(pretty_mask("bad.example.com"), "*!*@bad.example.com");
        assert_eq!(pretty_mask("n!u@h"), "n!u@h");
        assert_eq!(pretty_mask("**!***@h"), "*!*@h");
        assert_eq!(pretty_mask("!@"), "*!*@*");
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_nick("alice"));
        assert!(is_valid_nick("[bot]_2"));
        assert!(!is_valid_nick("2alice"));
        assert!(!is_valid_nick(""));
        assert!(!is_valid_nick("a.b"));
        assert!(is_valid_channel("#test", 200, false));
        assert!(!is_valid_channel("&test", 200, false));
        assert!(is_valid_channel("&test", 200, true));
        assert!(!is_valid_channel("#a,b", 200, true));
        assert!(!is_valid_channel("#", 200, true));
        assert!(!is_valid_channel("#toolong", 5, true));
    }
}
