//! Rule tree for one packet-filter table
//!
//! Chains live in an arena keyed by name. A chain knows its parent and its
//! children by name only, so every mutation resolves through the owning
//! [`Table`]. Each method issues the filter command first and touches the
//! in-memory record only after the command succeeded.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::executor::FilterExecutor;
use super::rule::CompleteRule;
use crate::error::FilterError;

/// Built-in chains of the well-known tables
#[must_use]
pub fn builtin_chains(table: &str) -> &'static [&'static str] {
    match table {
        "mangle" => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
        "nat" => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
        "filter" => &["INPUT", "FORWARD", "OUTPUT"],
        "raw" => &["PREROUTING", "OUTPUT"],
        _ => &[],
    }
}

/// One chain record
#[derive(Debug, Clone)]
pub struct Chain {
    name: String,
    parent: Option<String>,
    children: Vec<String>,
    rules: Vec<CompleteRule>,
    builtin: bool,
}

impl Chain {
    fn new(name: &str, parent: Option<&str>, builtin: bool) -> Self {
        Self {
            name: name.to_string(),
            parent: parent.map(str::to_string),
            children: Vec::new(),
            rules: Vec::new(),
            builtin,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    #[must_use]
    pub fn children(&self) -> &[String] {
        &self.children
    }

    /// Rules in filter order
    #[must_use]
    pub fn rules(&self) -> &[CompleteRule] {
        &self.rules
    }

    #[must_use]
    pub const fn is_builtin(&self) -> bool {
        self.builtin
    }
}

/// In-memory mirror of one filter table
#[derive(Debug)]
pub struct Table {
    name: String,
    chains: HashMap<String, Chain>,
    executor: Arc<dyn FilterExecutor>,
}

impl Table {
    /// Create a table with its built-in chains
    pub fn new(name: impl Into<String>, executor: Arc<dyn FilterExecutor>) -> Self {
        let name = name.into();
        let chains = builtin_chains(&name)
            .iter()
            .map(|c| ((*c).to_string(), Chain::new(c, None, true)))
            .collect();
        Self {
            name,
            chains,
            executor,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.chains.contains_key(name)
    }

    /// Number of child chains attached under `name` (0 if unknown)
    #[must_use]
    pub fn children_count(&self, name: &str) -> usize {
        self.chains.get(name).map_or(0, |c| c.children.len())
    }

    /// Number of rules in `name` (0 if unknown)
    #[must_use]
    pub fn rules_count(&self, name: &str) -> usize {
        self.chains.get(name).map_or(0, |c| c.rules.len())
    }

    /// Position of the rule in `parent` that jumps to `child`
    #[must_use]
    pub fn find_child_index(&self, parent: &str, child: &str) -> Option<usize> {
        self.chains
            .get(parent)?
            .rules
            .iter()
            .position(|r| r.action.jump_target() == Some(child))
    }

    fn run(
        &self,
        op: &str,
        chain: &str,
        index: Option<usize>,
        rule: Option<&CompleteRule>,
    ) -> Result<(), FilterError> {
        let mut args = vec![
            "-t".to_string(),
            self.name.clone(),
            format!("-{op}"),
            chain.to_string(),
        ];
        if let Some(index) = index {
            // the filter tool counts from 1
            args.push((index + 1).to_string());
        }
        if let Some(rule) = rule {
            args.extend(rule.args());
        }
        self.executor.run(&args)
    }

    fn chain_mut(&mut self, name: &str) -> Result<&mut Chain, FilterError> {
        let table = &self.name;
        self.chains
            .get_mut(name)
            .ok_or_else(|| FilterError::chain_not_found(table.clone(), name))
    }

    fn existing(&self, name: &str) -> Result<&Chain, FilterError> {
        self.chains
            .get(name)
            .ok_or_else(|| FilterError::chain_not_found(self.name.clone(), name))
    }

    /// Create a custom chain and attach it to `parent` at `index` via `rule`.
    ///
    /// `rule` must jump to the new chain; its target names the chain. If the
    /// chain is created but the attaching rule fails, the chain stays recorded
    /// under `parent` so that removing `parent` (or the chain) cleans it up.
    ///
    /// # Errors
    ///
    /// Returns `FilterError` if the parent is missing, the chain exists, the
    /// index is out of range or a filter command fails.
    pub fn create_child(
        &mut self,
        parent: &str,
        index: usize,
        rule: CompleteRule,
    ) -> Result<(), FilterError> {
        let child = rule
            .action
            .jump_target()
            .ok_or_else(|| FilterError::NotAJump(rule.to_string()))?
            .to_string();

        let len = self.existing(parent)?.rules.len();
        if self.contains(&child) {
            return Err(FilterError::ChainExists {
                table: self.name.clone(),
                chain: child,
            });
        }
        if index > len {
            return Err(FilterError::IndexOutOfRange {
                chain: parent.to_string(),
                index,
                len,
            });
        }

        self.run("N", &child, None, None)?;
        self.chains
            .insert(child.clone(), Chain::new(&child, Some(parent), false));
        self.chain_mut(parent)?.children.push(child.clone());

        self.run("I", parent, Some(index), Some(&rule))?;
        self.chain_mut(parent)?.rules.insert(index, rule);

        info!("Created chain {}/{} under {} at {}", self.name, child, parent, index);
        Ok(())
    }

    /// Append `rule` to `chain` unless an equal rule is already there.
    ///
    /// Returns `true` if the rule was installed.
    ///
    /// # Errors
    ///
    /// Returns `FilterError` if the chain is missing or the command fails.
    pub fn append_rule(&mut self, chain: &str, rule: CompleteRule) -> Result<bool, FilterError> {
        if self.existing(chain)?.rules.contains(&rule) {
            debug!("Rule already in {}: {}", chain, rule);
            return Ok(false);
        }

        self.run("A", chain, None, Some(&rule))?;
        self.chain_mut(chain)?.rules.push(rule);
        Ok(true)
    }

    /// Insert `rule` at `index` in `chain` unless an equal rule is already there.
    ///
    /// Returns `true` if the rule was installed.
    ///
    /// # Errors
    ///
    /// Returns `FilterError::IndexOutOfRange` if `index > rules_count(chain)`,
    /// or another `FilterError` if the chain is missing or the command fails.
    pub fn insert_rule(
        &mut self,
        chain: &str,
        index: usize,
        rule: CompleteRule,
    ) -> Result<bool, FilterError> {
        let existing = self.existing(chain)?;
        if existing.rules.contains(&rule) {
            debug!("Rule already in {}: {}", chain, rule);
            return Ok(false);
        }
        let len = existing.rules.len();
        if index > len {
            return Err(FilterError::IndexOutOfRange {
                chain: chain.to_string(),
                index,
                len,
            });
        }

        self.run("I", chain, Some(index), Some(&rule))?;
        self.chain_mut(chain)?.rules.insert(index, rule);
        Ok(true)
    }

    /// Delete `rule` from `chain` if present.
    ///
    /// Returns `true` if a rule was removed.
    ///
    /// # Errors
    ///
    /// Returns `FilterError` if the chain is missing or the command fails.
    pub fn del_rule(&mut self, chain: &str, rule: &CompleteRule) -> Result<bool, FilterError> {
        let Some(pos) = self.existing(chain)?.rules.iter().position(|r| r == rule) else {
            return Ok(false);
        };

        self.run("D", chain, None, Some(rule))?;
        self.chain_mut(chain)?.rules.remove(pos);
        Ok(true)
    }

    /// Remove a custom chain and everything below it.
    ///
    /// Order: the parent's jump rule is deleted, descendants are removed
    /// depth-first, own rules are flushed, then the chain is deleted.
    ///
    /// # Errors
    ///
    /// Returns `FilterError::BuiltinChain` for built-in chains, or the first
    /// failing command. Steps completed before the failure stay applied.
    pub fn remove_chain(&mut self, name: &str) -> Result<(), FilterError> {
        let chain = self.existing(name)?;
        if chain.builtin {
            return Err(FilterError::BuiltinChain(name.to_string()));
        }
        let parent = chain.parent.clone();
        let children = chain.children.clone();

        if let Some(parent) = parent.as_deref() {
            if let Some(pos) = self.find_child_index(parent, name) {
                let jump = self.existing(parent)?.rules[pos].clone();
                self.run("D", parent, None, Some(&jump))?;
                self.chain_mut(parent)?.rules.remove(pos);
            }
        }

        for child in &children {
            self.remove_chain(child)?;
        }

        self.run("F", name, None, None)?;
        self.chain_mut(name)?.rules.clear();

        self.run("X", name, None, None)?;
        self.chains.remove(name);
        if let Some(parent) = parent.as_deref() {
            if let Some(p) = self.chains.get_mut(parent) {
                p.children.retain(|c| c != name);
            }
        }

        info!("Removed chain {}/{}", self.name, name);
        Ok(())
    }

    /// Remove `name` only when no child chains remain under it.
    ///
    /// Returns `true` if the chain was removed.
    ///
    /// # Errors
    ///
    /// Same as [`Table::remove_chain`].
    pub fn remove_if_unused(&mut self, name: &str) -> Result<bool, FilterError> {
        let children = self.existing(name)?.children.len();
        if children > 0 {
            debug!("Keeping chain {} ({} children left)", name, children);
            return Ok(false);
        }
        self.remove_chain(name)?;
        Ok(true)
    }

    /// Best-effort removal of a chain left behind by an earlier run.
    ///
    /// Nothing is recorded in memory; failures are only logged.
    pub fn purge_leftover_chain(&self, parent: &str, name: &str) {
        let jump = CompleteRule::jump(name);
        let steps: [(&str, &str, Option<&CompleteRule>); 3] = [
            ("D", parent, Some(&jump)),
            ("F", name, None),
            ("X", name, None),
        ];
        for (op, chain, rule) in steps {
            if let Err(e) = self.run(op, chain, None, rule) {
                debug!("Leftover cleanup -{} {} skipped: {}", op, chain, e);
            }
        }
    }

    /// Best-effort deletion of a rule left behind by an earlier run
    pub fn purge_leftover_rule(&self, chain: &str, rule: &CompleteRule) {
        if let Err(e) = self.run("D", chain, None, Some(rule)) {
            debug!("Leftover cleanup -D {} skipped: {}", chain, e);
        }
    }
}
