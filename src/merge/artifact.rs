//! Render a [`MergedOverride`] as an override file.
//!
//! The file is a uv2nix override function:
//!
//! ```nix
//! # Generated by uv2nix-hammer for foo==1.0. Edits are overwritten.
//! # rule-state: <sha256 of the rule state>
//! { final, pkgs, ... }:
//! old:
//! let
//!   isWheel = ...;
//! in
//! if isWheel then
//!   { ... }
//! else
//!   { ... }
//! ```
//!
//! When rules contributed raw function layers, the structured part becomes
//! the first layer and all layers are folded left to right, each seeing the
//! accumulated result as `old`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use hammer_nix::NixValue;

use super::engine::{AttrMerge, MergedOverride, Slot};
use super::error::MergeError;
use super::strategy::{ListCompose, MergeStrategy};
use crate::model::UnitId;

const FINGERPRINT_PREFIX: &str = "# rule-state: ";

/// Artifact written for a unit whose overrides were cleared.
pub const CLEARED: &str = "{ ... }: old: { }\n";

const IS_WHEEL: &str = r#"isWheel = builtins.match ".*\\.whl" (toString (old.src or "")) != null;"#;

const FOLD: &str = "builtins.foldl' (acc: layer: acc // layer (old // acc)) { } layers";

/// The rule-state fingerprint recorded in an artifact's header.
#[must_use]
pub fn fingerprint_of(artifact: &str) -> Option<&str> {
    artifact
        .lines()
        .take_while(|line| line.starts_with('#'))
        .find_map(|line| line.strip_prefix(FINGERPRINT_PREFIX))
        .map(str::trim)
}

/// Render the artifact, or `None` when there is nothing to override.
///
/// # Errors
/// [`MergeError::InvalidSyntax`] if the rendered text fails the syntax
/// check.
pub fn render_artifact(
    unit: &UnitId,
    fingerprint: &str,
    merged: &MergedOverride,
) -> Result<Option<String>, MergeError> {
    if merged.is_empty() {
        return Ok(None);
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Generated by uv2nix-hammer for {unit}. Edits are overwritten."
    );
    let _ = writeln!(out, "{FINGERPRINT_PREFIX}{fingerprint}");
    out.push_str(&argument_pattern(merged));
    out.push_str("\nold:\n");

    let structured = (!merged.src.is_empty() || !merged.wheel.is_empty())
        .then(|| structured_layer(&merged.src, &merged.wheel));

    if merged.fragments.is_empty() {
        if let Some(body) = structured {
            out.push_str(&body);
        }
    } else {
        out.push_str("let\n");
        let mut layers = Vec::new();
        if let Some(body) = structured {
            out.push_str("  structured = old:\n");
            out.push_str(&indent(&body, 2));
            out.push_str(";\n");
            layers.push("structured".to_owned());
        }
        for fragment in &merged.fragments {
            layers.push(format!("({})", fragment.code));
        }
        out.push_str("  layers = [\n");
        for layer in layers {
            let _ = writeln!(out, "    {layer}");
        }
        out.push_str("  ];\nin\n");
        out.push_str(FOLD);
    }
    out.push('\n');

    hammer_nix::check_syntax(&out).map_err(|source| MergeError::InvalidSyntax {
        source,
        text: out.clone(),
    })?;
    Ok(Some(out))
}

fn argument_pattern(merged: &MergedOverride) -> String {
    if merged.arguments.is_empty() {
        return "{ ... }:".to_owned();
    }
    let args: Vec<&str> = merged.arguments.iter().map(String::as_str).collect();
    format!("{{ {}, ... }}:", args.join(", "))
}

fn structured_layer(src: &AttrMerge, wheel: &AttrMerge) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "let\n  {IS_WHEEL}\nin");
    out.push_str("if isWheel then\n");
    out.push_str(&indent(&attrs(wheel), 1));
    out.push_str("\nelse\n");
    out.push_str(&indent(&attrs(src), 1));
    out
}

/// Render one destination's attribute set at indentation level zero.
fn attrs(merge: &AttrMerge) -> String {
    let set: BTreeMap<String, NixValue> = merge
        .iter()
        .map(|(key, slot)| {
            let name = key.nix_name();
            (name.to_owned(), NixValue::literal(slot_expr(name, key.strategy(), slot)))
        })
        .collect();
    hammer_nix::render(&NixValue::Attrs(set))
}

/// The expression for one key, composed with the base value `old.<name>`.
/// Continuation lines are indented for a key at level one.
fn slot_expr(name: &str, strategy: MergeStrategy, slot: &Slot) -> String {
    match (strategy, slot) {
        (MergeStrategy::Union(ListCompose::Extend), Slot::Union(items)) => {
            let list = NixValue::List(items.iter().cloned().collect());
            format!("(old.{name} or [ ]) ++ {}", hammer_nix::render(&list))
        }
        (MergeStrategy::Union(ListCompose::Remove), Slot::Union(items)) => {
            let names = NixValue::List(items.iter().cloned().collect());
            format!(
                "builtins.filter (dep: !(builtins.elem (dep.pname or \"\") {})) (old.{name} or [ ])",
                hammer_nix::render(&names)
            )
        }
        (MergeStrategy::Append, Slot::Append(fragments)) => {
            let mut expr = format!("(old.{name} or \"\")");
            for fragment in fragments {
                let rendered = hammer_nix::render_at(fragment, 1);
                let wrapped = match fragment {
                    NixValue::Literal(code) if code.contains(' ') => format!("({rendered})"),
                    _ => rendered,
                };
                let _ = write!(expr, " + \"\\n\" + {wrapped}");
            }
            expr
        }
        (_, Slot::First { value, .. }) => match value {
            NixValue::Attrs(_) => {
                format!("(old.{name} or {{ }}) // {}", hammer_nix::render_at(value, 1))
            }
            other => hammer_nix::render_at(other, 1),
        },
        // slot kinds always match their key's strategy
        (_, other) => hammer_nix::render_at(&slot_fallback(other), 1),
    }
}

fn slot_fallback(slot: &Slot) -> NixValue {
    match slot {
        Slot::Union(items) => NixValue::List(items.iter().cloned().collect()),
        Slot::Append(items) => NixValue::List(items.clone()),
        Slot::First { value, .. } => value.clone(),
    }
}

fn indent(text: &str, level: usize) -> String {
    let pad = "  ".repeat(level);
    text.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{pad}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
