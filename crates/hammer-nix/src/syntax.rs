//! Lexical round-trip check for rendered Nix files.
//!
//! This is not a Nix parser. It walks the text once, skipping over strings,
//! indented strings (including `${...}` interpolation) and comments, and
//! verifies that `()`, `[]` and `{}` balance. That catches every class of
//! breakage the renderer can produce (bad quoting, a raw fragment with an
//! unclosed brace) before the file reaches the build tool.

use crate::error::NixError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Frame {
    Paren,
    Bracket,
    Brace,
    /// `${` inside a string; returns to the string on `}`.
    Interp(StringKind),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StringKind {
    Quoted,
    Indented,
}

impl Frame {
    const fn closer(self) -> char {
        match self {
            Self::Paren => ')',
            Self::Bracket => ']',
            Self::Brace | Self::Interp(_) => '}',
        }
    }
}

/// Check that `src` is lexically well-formed Nix.
///
/// # Errors
/// Returns [`NixError`] describing the first problem found.
pub fn check_syntax(src: &str) -> Result<(), NixError> {
    let chars: Vec<char> = src.chars().collect();
    let mut stack: Vec<(Frame, usize)> = Vec::new();
    let mut line = 1;
    let mut i = 0;
    let mut saw_code = false;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\n' => line += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if next == Some('*') => {
                let start = line;
                i += 2;
                loop {
                    match (chars.get(i), chars.get(i + 1)) {
                        (Some('*'), Some('/')) => {
                            i += 2;
                            break;
                        }
                        (Some(ch), _) => {
                            if *ch == '\n' {
                                line += 1;
                            }
                            i += 1;
                        }
                        (None, _) => {
                            return Err(NixError::Unterminated {
                                line: start,
                                what: "comment".to_owned(),
                            });
                        }
                    }
                }
                continue;
            }
            '"' => {
                saw_code = true;
                i = skip_string(&chars, i + 1, StringKind::Quoted, &mut line, &mut stack)?;
                continue;
            }
            '\'' if next == Some('\'') => {
                saw_code = true;
                i = skip_string(&chars, i + 2, StringKind::Indented, &mut line, &mut stack)?;
                continue;
            }
            '(' => stack.push((Frame::Paren, line)),
            '[' => stack.push((Frame::Bracket, line)),
            '{' => stack.push((Frame::Brace, line)),
            ')' | ']' | '}' => match stack.pop() {
                None => return Err(NixError::Unbalanced { line, found: c }),
                Some((frame, _)) if frame.closer() != c => {
                    return Err(NixError::MismatchedDelimiter {
                        line,
                        found: c,
                        expected: frame.closer(),
                    });
                }
                Some((Frame::Interp(kind), _)) => {
                    i = skip_string(&chars, i + 1, kind, &mut line, &mut stack)?;
                    continue;
                }
                Some(_) => {}
            },
            _ => {}
        }
        if !c.is_whitespace() {
            saw_code = true;
        }
        i += 1;
    }

    if let Some((frame, open_line)) = stack.pop() {
        let what = match frame {
            Frame::Paren => "`(`",
            Frame::Bracket => "`[`",
            Frame::Brace => "`{`",
            Frame::Interp(_) => "`${`",
        };
        return Err(NixError::Unterminated {
            line: open_line,
            what: what.to_owned(),
        });
    }
    if !saw_code {
        return Err(NixError::Empty);
    }
    Ok(())
}

/// Skip a string body starting at `i` (just past the opening quote).
///
/// Returns the index after the closing quote, or after the `${` that opened
/// an interpolation (in which case an `Interp` frame has been pushed).
fn skip_string(
    chars: &[char],
    mut i: usize,
    kind: StringKind,
    line: &mut usize,
    stack: &mut Vec<(Frame, usize)>,
) -> Result<usize, NixError> {
    let start = *line;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match (kind, c) {
            (_, '\n') => *line += 1,
            (StringKind::Quoted, '\\') => {
                if next == Some('\n') {
                    *line += 1;
                }
                i += 2;
                continue;
            }
            (StringKind::Quoted, '"') => return Ok(i + 1),
            (StringKind::Indented, '\'') if next == Some('\'') => {
                // `'''`, `''$` and `''\x` are escapes inside indented strings.
                match chars.get(i + 2) {
                    Some('\'' | '$') => {
                        i += 3;
                        continue;
                    }
                    Some('\\') => {
                        i += 4;
                        continue;
                    }
                    _ => return Ok(i + 2),
                }
            }
            (_, '$') if next == Some('{') => {
                stack.push((Frame::Interp(kind), *line));
                return Ok(i + 2);
            }
            _ => {}
        }
        i += 1;
    }
    Err(NixError::Unterminated {
        line: start,
        what: match kind {
            StringKind::Quoted => "string".to_owned(),
            StringKind::Indented => "indented string".to_owned(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_function() {
        check_syntax("{ pkgs, ... }: old: { buildInputs = [ pkgs.zlib ]; }").unwrap();
    }

    #[test]
    fn accepts_interpolation_in_both_string_forms() {
        check_syntax(r#"{ a = "${pkgs.x}/bin"; b = ''
          ${helpers.tomlreplace} pyproject.toml "[]"
        ''; }"#)
        .unwrap();
    }

    #[test]
    fn nested_interpolation_with_braces() {
        check_syntax(r#"{ a = "${builtins.toString { x = 1; }.x}"; }"#).unwrap();
    }

    #[test]
    fn indented_string_escapes() {
        check_syntax("{ a = '' it'''s ''${not} ''\\n ''; }").unwrap();
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        check_syntax(r#"{ a = "}"; b = '' { ''; }"#).unwrap();
    }

    #[test]
    fn comments_are_skipped() {
        check_syntax("# header {\n/* ( */ { }").unwrap();
    }

    #[test]
    fn rejects_unclosed_brace() {
        let err = check_syntax("{ a = [ 1 ];\n").unwrap_err();
        assert_eq!(
            err,
            NixError::Unterminated {
                line: 1,
                what: "`{`".to_owned()
            }
        );
    }

    #[test]
    fn rejects_mismatch() {
        let err = check_syntax("{ a = [ 1 }; }").unwrap_err();
        assert!(matches!(
            err,
            NixError::MismatchedDelimiter {
                found: '}',
                expected: ']',
                ..
            }
        ));
    }

    #[test]
    fn rejects_stray_closer() {
        assert!(matches!(
            check_syntax("x )"),
            Err(NixError::Unbalanced { found: ')', .. })
        ));
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(matches!(
            check_syntax("{ a = \"oops; }"),
            Err(NixError::Unterminated { .. })
        ));
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(check_syntax("  # nothing\n"), Err(NixError::Empty));
    }
}
