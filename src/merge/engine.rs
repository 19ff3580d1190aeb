//! Combine every rule's decision for one unit into one merged override.
//!
//! Fragments are folded key by key using [`AttrKey::strategy`]:
//!
//! - union keys collect a sorted set, so rule order is irrelevant;
//! - append keys keep encounter order (rule-name order, since state is a
//!   sorted map);
//! - first-writer keys accept a repeat of the same value and reject anything
//!   else with [`MergeError::KeyConflict`].
//!
//! Constraints and the runtime downgrade are collected the same way as
//! first-writer keys, per dependency.

use std::collections::{BTreeMap, BTreeSet};

use hammer_nix::NixValue;

use super::error::{Destination, MergeError};
use super::strategy::{AttrKey, MergeStrategy};
use crate::model::RuleState;
use crate::rules::{self, CopyRequest, FunctionFragment, RuleContext, RuleEffect, RuleOutput};

/// Accumulated contributions to one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    /// Sorted, deduplicated items.
    Union(BTreeSet<NixValue>),
    /// Fragments in encounter order.
    Append(Vec<NixValue>),
    /// The single accepted value and who wrote it.
    First {
        /// Writing rule.
        rule: &'static str,
        /// Its value.
        value: NixValue,
    },
}

/// Merged attribute fragments for one destination.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttrMerge {
    slots: BTreeMap<AttrKey, Slot>,
}

impl AttrMerge {
    /// Fold one fragment in.
    ///
    /// # Errors
    /// [`MergeError::KeyConflict`] when a first-writer key receives a
    /// different value.
    pub fn add(
        &mut self,
        destination: Destination,
        rule: &'static str,
        key: AttrKey,
        value: NixValue,
    ) -> Result<(), MergeError> {
        match key.strategy() {
            MergeStrategy::Union(_) => {
                let items: Vec<NixValue> = match value {
                    NixValue::List(items) => items,
                    single => vec![single],
                };
                let slot = self
                    .slots
                    .entry(key)
                    .or_insert_with(|| Slot::Union(BTreeSet::new()));
                if let Slot::Union(set) = slot {
                    set.extend(items);
                }
            }
            MergeStrategy::Append => {
                let slot = self
                    .slots
                    .entry(key)
                    .or_insert_with(|| Slot::Append(Vec::new()));
                if let Slot::Append(fragments) = slot {
                    if !fragments.contains(&value) {
                        fragments.push(value);
                    }
                }
            }
            MergeStrategy::FirstWriter => {
                if let Some(Slot::First {
                    rule: first_rule,
                    value: first,
                }) = self.slots.get(&key)
                {
                    if *first != value {
                        return Err(MergeError::KeyConflict {
                            key,
                            destination,
                            first_rule: *first_rule,
                            first: hammer_nix::render(first),
                            second_rule: rule,
                            second: hammer_nix::render(&value),
                        });
                    }
                } else {
                    self.slots.insert(key, Slot::First { rule, value });
                }
            }
        }
        Ok(())
    }

    /// Slots in key order.
    pub fn iter(&self) -> impl Iterator<Item = (AttrKey, &Slot)> {
        self.slots.iter().map(|(k, v)| (*k, v))
    }

    /// The slot for `key`, if any rule wrote it.
    #[must_use]
    pub fn get(&self, key: AttrKey) -> Option<&Slot> {
        self.slots.get(&key)
    }

    /// `true` when no rule contributed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Everything that ends up in the generated artifact.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergedOverride {
    /// Function arguments the artifact binds.
    pub arguments: BTreeSet<String>,
    /// Source-build attributes.
    pub src: AttrMerge,
    /// Wheel attributes.
    pub wheel: AttrMerge,
    /// Raw layers, in rule-name order.
    pub fragments: Vec<FunctionFragment>,
}

impl MergedOverride {
    /// `true` when there is nothing to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.src.is_empty() && self.wheel.is_empty() && self.fragments.is_empty()
    }
}

/// Result of merging one unit's state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The merged artifact structure.
    pub merged: MergedOverride,
    /// Build-system packages requested (also present in `merged`).
    pub build_systems: BTreeSet<String>,
    /// Dependency constraints for the build project.
    pub constraints: BTreeMap<String, String>,
    /// Requested Python version, if any.
    pub python_downgrade: Option<String>,
    /// Whether any rule needs the newer package snapshot.
    pub newer_nixpkgs: bool,
    /// Files to place next to the artifact.
    pub copies: Vec<CopyRequest>,
}

/// Incremental merger. [`merge_state`] drives it from persisted state;
/// tests drive it directly with outputs in arbitrary order.
#[derive(Debug, Default)]
pub struct Merger {
    outcome: MergeOutcome,
    constraint_owner: BTreeMap<String, &'static str>,
    downgrade_owner: Option<&'static str>,
}

impl Merger {
    /// Start an empty merge.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one rule's effect in.
    ///
    /// # Errors
    /// Any conflict, or [`MergeError::Excluded`] for an exclusion.
    pub fn add(&mut self, rule: &'static str, effect: RuleEffect) -> Result<(), MergeError> {
        match effect {
            RuleEffect::Output(output) => self.add_output(rule, output),
            RuleEffect::Function(fragment) => {
                self.outcome.merged.fragments.push(fragment);
                Ok(())
            }
            RuleEffect::CopyFiles(copy) => {
                self.outcome.copies.push(copy);
                Ok(())
            }
            RuleEffect::Exclude { reason } => Err(MergeError::Excluded { rule, reason }),
        }
    }

    fn add_output(&mut self, rule: &'static str, output: RuleOutput) -> Result<(), MergeError> {
        let RuleOutput {
            build_systems,
            arguments,
            src_attrs,
            wheel_attrs,
            newer_nixpkgs,
            constraints,
            python_downgrade,
        } = output;

        let merged = &mut self.outcome.merged;
        merged.arguments.extend(arguments);
        for (key, value) in src_attrs {
            merged.src.add(Destination::Source, rule, key, value)?;
        }
        for (key, value) in wheel_attrs {
            merged.wheel.add(Destination::Wheel, rule, key, value)?;
        }
        if !build_systems.is_empty() {
            let inputs = build_systems
                .iter()
                .map(|name| NixValue::literal(format!("final.{name}")))
                .collect();
            merged.arguments.insert("final".to_owned());
            merged.src.add(
                Destination::Source,
                rule,
                AttrKey::NativeBuildInputs,
                NixValue::List(inputs),
            )?;
            self.outcome.build_systems.extend(build_systems);
        }

        self.outcome.newer_nixpkgs |= newer_nixpkgs;

        for (dependency, specifier) in constraints {
            match self.outcome.constraints.get(&dependency) {
                None => {
                    self.constraint_owner.insert(dependency.clone(), rule);
                    self.outcome.constraints.insert(dependency, specifier);
                }
                Some(existing) if *existing == specifier => {}
                Some(existing) => {
                    return Err(MergeError::ConstraintConflict {
                        first_rule: self.constraint_owner.get(&dependency).copied().unwrap_or("?"),
                        first: existing.clone(),
                        second_rule: rule,
                        second: specifier,
                        dependency,
                    });
                }
            }
        }

        if let Some(version) = python_downgrade {
            match &self.outcome.python_downgrade {
                None => {
                    self.downgrade_owner = Some(rule);
                    self.outcome.python_downgrade = Some(version);
                }
                Some(existing) if *existing == version => {}
                Some(existing) => {
                    return Err(MergeError::DowngradeConflict {
                        first_rule: self.downgrade_owner.unwrap_or("?"),
                        first: existing.clone(),
                        second_rule: rule,
                        second: version,
                    });
                }
            }
        }
        Ok(())
    }

    /// Finish the merge.
    #[must_use]
    pub fn finish(mut self) -> MergeOutcome {
        for fragment in &self.outcome.merged.fragments {
            self.outcome
                .merged
                .arguments
                .extend(fragment.arguments.iter().cloned());
        }
        self.outcome
    }
}

/// Merge every decision in `state`.
///
/// An exclusion short-circuits: the remaining decisions are not applied.
///
/// # Errors
/// [`MergeError`] for exclusions, conflicts, unknown rules, or decisions a
/// rule cannot render.
pub fn merge_state(ctx: &RuleContext<'_>, state: &RuleState) -> Result<MergeOutcome, MergeError> {
    let mut merger = Merger::new();
    for (name, value) in state.iter() {
        let rule = rules::find(name).ok_or_else(|| MergeError::UnknownRule {
            name: name.to_owned(),
        })?;
        for effect in rule.apply(ctx, value)? {
            merger.add(rule.name(), effect)?;
        }
    }
    Ok(merger.finish())
}
