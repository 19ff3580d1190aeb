//! Deterministic Nix pretty printer.
//!
//! Rendering is a pure function of the [`NixValue`] tree: attribute keys come
//! out in sorted order, lists stay on one line, and strings pick the quoted
//! or indented form depending on whether they span lines.
//!
//! `${...}` inside strings is left alone so hook snippets can interpolate
//! build inputs (`${pkgs.cmake}/bin/cmake`).

use crate::value::NixValue;

const KEYWORDS: &[&str] = &[
    "assert", "else", "if", "in", "inherit", "let", "or", "rec", "then", "with",
];

const INDENT: &str = "  ";

/// Render a value as Nix source, starting at indentation level zero.
#[must_use]
pub fn render(value: &NixValue) -> String {
    render_at(value, 0)
}

/// Render a value that will be embedded `level` indentation steps deep.
///
/// The first line is not indented; continuation lines and closing brackets
/// are, so the result can be spliced after `key = `.
#[must_use]
pub fn render_at(value: &NixValue, level: usize) -> String {
    let mut out = String::new();
    render_into(value, level, &mut out);
    out
}

/// Render an attribute name, quoting it when it is not a plain identifier.
#[must_use]
pub fn identifier(name: &str) -> String {
    if is_plain_identifier(name) {
        name.to_owned()
    } else {
        quote(name)
    }
}

/// Render a string value in whichever form fits.
#[must_use]
pub fn render_string(s: &str, level: usize) -> String {
    if s.contains('\n') {
        indented(s, level)
    } else {
        quote(s)
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '\''))
        && !KEYWORDS.contains(&name)
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn indented(s: &str, level: usize) -> String {
    let inner = INDENT.repeat(level + 1);
    let mut out = String::from("''\n");
    for line in s.trim_matches('\n').lines() {
        if !line.trim().is_empty() {
            out.push_str(&inner);
            out.push_str(&line.replace("''", "'''"));
        }
        out.push('\n');
    }
    out.push_str(&INDENT.repeat(level));
    out.push_str("''");
    out
}

fn render_into(value: &NixValue, level: usize, out: &mut String) {
    match value {
        NixValue::Null => out.push_str("null"),
        NixValue::Bool(true) => out.push_str("true"),
        NixValue::Bool(false) => out.push_str("false"),
        NixValue::Int(i) => out.push_str(&i.to_string()),
        NixValue::Str(s) => out.push_str(&render_string(s, level)),
        NixValue::Path(p) => {
            if p.starts_with("./") || p.starts_with("../") || p.starts_with('/') {
                out.push_str(p);
            } else {
                out.push_str("./");
                out.push_str(p);
            }
        }
        NixValue::Literal(code) => out.push_str(code),
        NixValue::List(items) => {
            if items.is_empty() {
                out.push_str("[ ]");
                return;
            }
            out.push('[');
            for item in items {
                out.push(' ');
                let needs_parens = matches!(item, NixValue::Literal(code) if code.contains(' '));
                if needs_parens {
                    out.push('(');
                }
                render_into(item, level, out);
                if needs_parens {
                    out.push(')');
                }
            }
            out.push_str(" ]");
        }
        NixValue::Attrs(attrs) => {
            if attrs.is_empty() {
                out.push_str("{ }");
                return;
            }
            out.push_str("{\n");
            for (key, val) in attrs {
                out.push_str(&INDENT.repeat(level + 1));
                out.push_str(&identifier(key));
                out.push_str(" = ");
                render_into(val, level + 1, out);
                out.push_str(";\n");
            }
            out.push_str(&INDENT.repeat(level));
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn scalars() {
        assert_eq!(render(&NixValue::Null), "null");
        assert_eq!(render(&NixValue::Bool(true)), "true");
        assert_eq!(render(&NixValue::Int(-3)), "-3");
    }

    #[test]
    fn strings_escape_quotes_and_backslashes() {
        assert_eq!(render(&NixValue::string(r#"a "b" \c"#)), r#""a \"b\" \\c""#);
    }

    #[test]
    fn interpolation_is_preserved() {
        assert_eq!(
            render(&NixValue::string("${pkgs.cmake}/bin")),
            "\"${pkgs.cmake}/bin\""
        );
    }

    #[test]
    fn multiline_strings_use_indented_form() {
        let rendered = render(&NixValue::string("echo a\necho ''b''\n"));
        assert_eq!(rendered, "''\n  echo a\n  echo '''b'''\n''");
    }

    #[test]
    fn literal_and_path_bypass_quoting() {
        assert_eq!(render(&NixValue::literal("pkgs.zlib.dev")), "pkgs.zlib.dev");
        assert_eq!(render(&NixValue::Path("Cargo.lock".into())), "./Cargo.lock");
        assert_eq!(render(&NixValue::Path("./manual".into())), "./manual");
    }

    #[test]
    fn lists_are_space_separated() {
        let v = NixValue::List(vec![
            NixValue::literal("pkgs.a"),
            NixValue::string("b"),
            NixValue::literal("old.x or []"),
        ]);
        assert_eq!(render(&v), "[ pkgs.a \"b\" (old.x or []) ]");
        assert_eq!(render(&NixValue::List(vec![])), "[ ]");
    }

    #[test]
    fn attrs_are_sorted_and_keys_quoted_when_needed() {
        let mut attrs = BTreeMap::new();
        attrs.insert("zeta".to_owned(), NixValue::Int(1));
        attrs.insert("alpha".to_owned(), NixValue::Bool(false));
        attrs.insert("with".to_owned(), NixValue::Null);
        attrs.insert("1bad".to_owned(), NixValue::Null);
        let rendered = render(&NixValue::Attrs(attrs));
        assert_eq!(
            rendered,
            "{\n  \"1bad\" = null;\n  alpha = false;\n  \"with\" = null;\n  zeta = 1;\n}"
        );
    }

    #[test]
    fn nested_attrs_indent() {
        let mut inner = BTreeMap::new();
        inner.insert("CC".to_owned(), NixValue::string("gcc"));
        let mut outer = BTreeMap::new();
        outer.insert("env".to_owned(), NixValue::Attrs(inner));
        assert_eq!(
            render(&NixValue::Attrs(outer)),
            "{\n  env = {\n    CC = \"gcc\";\n  };\n}"
        );
    }

    #[test]
    fn render_at_indents_continuation_lines() {
        let mut attrs = BTreeMap::new();
        attrs.insert("a".to_owned(), NixValue::Int(1));
        assert_eq!(
            render_at(&NixValue::Attrs(attrs), 2),
            "{\n      a = 1;\n    }"
        );
    }

    #[test]
    fn identifiers() {
        assert_eq!(identifier("buildInputs"), "buildInputs");
        assert_eq!(identifier("pkg-config"), "pkg-config");
        assert_eq!(identifier("zope.interface"), "\"zope.interface\"");
        assert_eq!(identifier(""), "\"\"");
    }
}
