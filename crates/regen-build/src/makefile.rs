//! Makefile subset reader
//!
//! Builds a [`TargetGraph`] from the part of the make language that asset
//! build descriptions use: variable assignments of every flavor, explicit and
//! static pattern rules with tab-indented recipes, target- and
//! pattern-specific variables, includes, conditionals, and the common text
//! functions. Pattern rules are not instantiated and nothing is executed.
//!
//! Recipes are expanded after the whole file has been read, with the
//! automatic variables of the rule in scope, exactly like make defers recipe
//! expansion until the rule runs.

use crate::env::Environment;
use crate::error::{BuildError, BuildResult};
use crate::graph::{Rule, Target, TargetGraph, TargetGraphProvider};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Include nesting beyond this depth is reported as an include loop
const MAX_INCLUDE_DEPTH: usize = 32;

/// Reads Makefiles relative to a working directory
#[derive(Debug, Clone)]
pub struct MakefileProvider {
    working_dir: PathBuf,
}

impl MakefileProvider {
    /// Relative include paths and `wildcard` patterns resolve against `working_dir`
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    /// Parse Makefile text that did not come from a file
    pub fn parse_str(&self, content: &str, env: &Environment) -> BuildResult<TargetGraph> {
        let mut parser = Parser::new(env, &self.working_dir);
        parser.parse_content(content, Path::new("<memory>"), 0)?;
        parser.finish()
    }
}

impl TargetGraphProvider for MakefileProvider {
    fn load(&self, path: &Path, env: &Environment) -> BuildResult<TargetGraph> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        };
        info!("Processing targets from {}", path.display());

        let mut parser = Parser::new(env, &self.working_dir);
        parser.parse_file(&path, 0)?;
        parser.finish()
    }
}

/// Where a statement came from
#[derive(Debug, Clone)]
struct Origin {
    path: PathBuf,
    line: usize,
}

impl Origin {
    fn error(&self, reason: impl ToString) -> BuildError {
        BuildError::description(&self.path, self.line, reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    /// `=`: expanded on every use
    Recursive,
    /// `:=`: expanded once, at assignment
    Simple,
}

#[derive(Debug, Clone)]
struct Variable {
    value: String,
    flavor: Flavor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssignOp {
    Recursive,
    Simple,
    Conditional,
    Append,
}

/// One line of the description, classified by its top-level separator
#[derive(Debug, PartialEq, Eq)]
enum Statement<'l> {
    Assign {
        name: &'l str,
        op: AssignOp,
        value: &'l str,
    },
    Rule {
        targets: &'l str,
        rest: &'l str,
    },
    Other,
}

/// Find the first top-level `=` or `:` and classify the line accordingly
///
/// Separators inside `$(…)`/`${…}` references do not count.
fn classify(line: &str) -> Statement<'_> {
    let bytes = line.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'$' => {
                match bytes.get(i + 1) {
                    Some(b'(') | Some(b'{') => depth += 1,
                    Some(_) => {}
                    None => break,
                }
                i += 2;
                continue;
            }
            b'(' | b'{' if depth > 0 => depth += 1,
            b')' | b'}' if depth > 0 => depth -= 1,
            b'=' if depth == 0 => {
                let head = &line[..i];
                let value = line[i + 1..].trim();
                let (name, op) = if let Some(name) = head.strip_suffix("::") {
                    (name, AssignOp::Simple)
                } else if let Some(name) = head.strip_suffix(':') {
                    (name, AssignOp::Simple)
                } else if let Some(name) = head.strip_suffix('?') {
                    (name, AssignOp::Conditional)
                } else if let Some(name) = head.strip_suffix('+') {
                    (name, AssignOp::Append)
                } else {
                    (head, AssignOp::Recursive)
                };
                return Statement::Assign {
                    name: name.trim(),
                    op,
                    value,
                };
            }
            b':' if depth == 0 => {
                let next = bytes.get(i + 1).copied();
                let after = bytes.get(i + 2).copied();
                match (next, after) {
                    // `:=` or `::=`, the `=` arm decides
                    (Some(b'='), _) | (Some(b':'), Some(b'=')) => {}
                    (Some(b':'), _) => {
                        return Statement::Rule {
                            targets: &line[..i],
                            rest: &line[i + 2..],
                        }
                    }
                    _ => {
                        return Statement::Rule {
                            targets: &line[..i],
                            rest: &line[i + 1..],
                        }
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    Statement::Other
}

/// Byte offset of the first top-level occurrence of `needle`
fn find_top_level(text: &str, needle: u8) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'$' if matches!(bytes.get(i + 1), Some(b'(') | Some(b'{')) => {
                depth += 1;
                i += 2;
                continue;
            }
            b'$' => {
                i += 2;
                continue;
            }
            b'(' | b'{' if depth > 0 => depth += 1,
            b')' | b'}' if depth > 0 => depth -= 1,
            c if c == needle && depth == 0 => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Split function arguments on top-level commas, at most `limit` pieces
fn split_args(text: &str, limit: usize) -> Vec<&str> {
    let mut args = Vec::new();
    let mut rest = text;
    while args.len() + 1 < limit {
        match find_top_level(rest, b',') {
            Some(pos) => {
                args.push(&rest[..pos]);
                rest = &rest[pos + 1..];
            }
            None => break,
        }
    }
    args.push(rest);
    args
}

/// Index of the bracket closing the one `text` starts with
fn find_closing(text: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in text.char_indices() {
        if c == open {
            depth += 1;
        } else if c == close {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// Join physical lines ending in a backslash into logical lines
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (index, raw) in content.lines().enumerate() {
        let trailing = raw.len() - raw.trim_end_matches('\\').len();
        let continues = trailing % 2 == 1;
        let text = if continues {
            &raw[..raw.len() - 1]
        } else {
            raw
        };

        match pending.as_mut() {
            Some((_, acc)) => {
                acc.truncate(acc.trim_end().len());
                acc.push(' ');
                acc.push_str(text.trim_start());
            }
            None => pending = Some((index + 1, text.to_string())),
        }

        if !continues {
            lines.extend(pending.take());
        }
    }
    lines.extend(pending.take());
    lines
}

/// Drop a trailing `#` comment; `\#` is a literal hash
fn strip_comment(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'#') => {
                out.push('#');
                chars.next();
            }
            '#' => break,
            c => out.push(c),
        }
    }
    out
}

fn split_first_word(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(pos) => (&line[..pos], line[pos..].trim_start()),
        None => (line, ""),
    }
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace()
}

/// Stem of `word` under a `%` pattern; a pattern without `%` must match exactly
fn pattern_stem<'w>(pattern: &str, word: &'w str) -> Option<&'w str> {
    match pattern.split_once('%') {
        Some((prefix, suffix)) => {
            let fits = word.len() >= prefix.len() + suffix.len()
                && word.starts_with(prefix)
                && word.ends_with(suffix);
            fits.then(|| &word[prefix.len()..word.len() - suffix.len()])
        }
        None => (word == pattern).then_some(""),
    }
}

fn pattern_replace(pattern: &str, replacement: &str, word: &str) -> String {
    match pattern_stem(pattern, word) {
        Some(stem) if pattern.contains('%') => replacement.replacen('%', stem, 1),
        Some(_) => replacement.to_string(),
        None => word.to_string(),
    }
}

fn patsubst(pattern: &str, replacement: &str, text: &str) -> String {
    words(text)
        .map(|word| pattern_replace(pattern, replacement, word))
        .collect::<Vec<_>>()
        .join(" ")
}

fn dir_part(word: &str) -> &str {
    match word.rfind('/') {
        Some(pos) => &word[..=pos],
        None => "./",
    }
}

fn file_part(word: &str) -> &str {
    match word.rfind('/') {
        Some(pos) => &word[pos + 1..],
        None => word,
    }
}

/// Offset of the suffix dot of `word`, if its file part has one
fn suffix_start(word: &str) -> Option<usize> {
    let file_start = word.rfind('/').map_or(0, |pos| pos + 1);
    word[file_start..].rfind('.').map(|pos| file_start + pos)
}

/// Translate a shell glob on a single path component into an anchored regex
fn glob_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

/// Automatic variables of one rule
#[derive(Debug)]
struct Automatic {
    target: String,
    first: String,
    all: String,
    stem: String,
}

impl Automatic {
    fn new(target: &str, prerequisites: &[String], stem: Option<&str>) -> Self {
        let mut seen = HashSet::new();
        let all: Vec<&str> = prerequisites
            .iter()
            .map(String::as_str)
            .filter(|p| seen.insert(*p))
            .collect();
        let stem = match stem {
            Some(stem) => stem.to_string(),
            None => suffix_start(target)
                .map_or(target, |pos| &target[..pos])
                .to_string(),
        };
        Self {
            target: target.to_string(),
            first: prerequisites.first().cloned().unwrap_or_default(),
            all: all.join(" "),
            stem,
        }
    }

    fn get(&self, name: &str) -> Option<String> {
        let dir = |word: &str| {
            let dir = dir_part(word);
            match dir.strip_suffix('/') {
                Some("") => "/".to_string(),
                Some(dir) => dir.to_string(),
                None => dir.to_string(),
            }
        };
        let value = match name {
            "@" => self.target.clone(),
            "<" => self.first.clone(),
            "^" => self.all.clone(),
            "*" => self.stem.clone(),
            "@D" => dir(&self.target),
            "@F" => file_part(&self.target).to_string(),
            "<D" => dir(&self.first),
            "<F" => file_part(&self.first).to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// Bindings visible to one expansion besides the global variables
#[derive(Debug, Clone, Default)]
struct Scope<'s> {
    automatic: Option<&'s Automatic>,
    target_vars: Option<&'s BTreeMap<String, String>>,
    locals: Vec<(String, String)>,
}

impl Scope<'_> {
    fn with_local(&self, name: &str, value: &str) -> Self {
        let mut scope = self.clone();
        scope.locals.push((name.to_string(), value.to_string()));
        scope
    }
}

#[derive(Debug, Clone)]
struct TargetAssign {
    name: String,
    op: AssignOp,
    value: String,
    origin: Origin,
}

#[derive(Debug, Clone)]
struct PendingRule {
    prerequisites: Vec<String>,
    stem: Option<String>,
    commands: Vec<String>,
    origin: Origin,
}

#[derive(Debug, Default)]
struct TargetEntry {
    dependencies: Vec<String>,
    rules: Vec<PendingRule>,
}

/// One target of a rule line with its own prerequisites
#[derive(Debug)]
struct RuleMember {
    target: String,
    prerequisites: Vec<String>,
    stem: Option<String>,
}

/// The rule whose recipe lines are being collected
#[derive(Debug)]
struct RuleContext {
    members: Vec<RuleMember>,
    commands: Vec<String>,
    has_recipe: bool,
    origin: Origin,
}

#[derive(Debug)]
struct Conditional {
    parent_active: bool,
    taken: bool,
    active: bool,
    seen_else: bool,
}

#[derive(Debug)]
struct Define {
    name: String,
    op: AssignOp,
    body: Vec<String>,
    origin: Origin,
}

struct Parser<'e> {
    env: &'e Environment,
    working_dir: &'e Path,
    vars: HashMap<String, Variable>,
    targets: BTreeMap<String, TargetEntry>,
    target_vars: HashMap<String, Vec<TargetAssign>>,
    pattern_vars: Vec<(String, TargetAssign)>,
    current: Option<RuleContext>,
    conditionals: Vec<Conditional>,
    define: Option<Define>,
}

impl<'e> Parser<'e> {
    fn new(env: &'e Environment, working_dir: &'e Path) -> Self {
        let mut vars = HashMap::new();
        vars.insert(
            "CURDIR".to_string(),
            Variable {
                value: working_dir.display().to_string(),
                flavor: Flavor::Simple,
            },
        );
        Self {
            env,
            working_dir,
            vars,
            targets: BTreeMap::new(),
            target_vars: HashMap::new(),
            pattern_vars: Vec::new(),
            current: None,
            conditionals: Vec::new(),
            define: None,
        }
    }

    fn parse_file(&mut self, path: &Path, depth: usize) -> BuildResult<()> {
        let content = fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
        self.parse_content(&content, path, depth)
    }

    fn parse_content(&mut self, content: &str, path: &Path, depth: usize) -> BuildResult<()> {
        let open_conditionals = self.conditionals.len();

        for (line, text) in logical_lines(content) {
            let origin = Origin {
                path: path.to_path_buf(),
                line,
            };
            self.process_line(&text, &origin, depth)?;
        }

        if let Some(define) = &self.define {
            let reason = format!("missing 'endef' for '{}'", define.name);
            return Err(define.origin.error(reason));
        }
        if self.conditionals.len() != open_conditionals {
            let line = content.lines().count();
            return Err(BuildError::description(path, line, "missing 'endif'"));
        }
        Ok(())
    }

    fn active(&self) -> bool {
        self.conditionals.last().map_or(true, |c| c.active)
    }

    fn process_line(&mut self, raw: &str, origin: &Origin, depth: usize) -> BuildResult<()> {
        if let Some(define) = self.define.as_mut() {
            if raw.trim() == "endef" {
                if let Some(define) = self.define.take() {
                    self.finish_define(define)?;
                }
            } else {
                define.body.push(raw.to_string());
            }
            return Ok(());
        }

        if let Some(recipe) = raw.strip_prefix('\t') {
            if self.current.is_some() {
                self.recipe_line(recipe);
                return Ok(());
            }
        }

        let line = strip_comment(raw);
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }

        let (keyword, rest) = split_first_word(line);
        match keyword {
            "ifeq" | "ifneq" | "ifdef" | "ifndef" => {
                return self.open_conditional(keyword, rest, origin);
            }
            "else" => return self.else_branch(rest, origin),
            "endif" => {
                return self
                    .conditionals
                    .pop()
                    .map(|_| ())
                    .ok_or_else(|| origin.error("'endif' without a matching conditional"))
            }
            _ => {}
        }

        if !self.active() {
            return Ok(());
        }
        self.close_rule();

        match keyword {
            "include" => self.include(rest, false, origin, depth),
            "-include" | "sinclude" => self.include(rest, true, origin, depth),
            "define" => self.open_define(rest, origin),
            "export" | "override" => {
                if matches!(classify(rest), Statement::Assign { .. }) {
                    self.statement(rest, origin)
                } else {
                    Ok(())
                }
            }
            "unexport" | "vpath" => {
                debug!(
                    "{}:{}: ignoring '{}'",
                    origin.path.display(),
                    origin.line,
                    keyword
                );
                Ok(())
            }
            _ => self.statement(line, origin),
        }
    }

    fn recipe_line(&mut self, recipe: &str) {
        if !self.active() {
            return;
        }
        let command = recipe.trim();
        if command.is_empty() || command.starts_with('#') {
            return;
        }
        if let Some(context) = self.current.as_mut() {
            context.commands.push(command.to_string());
        }
    }

    fn statement(&mut self, line: &str, origin: &Origin) -> BuildResult<()> {
        match classify(line) {
            Statement::Assign { name, op, value } => self.assign(name, op, value, origin),
            Statement::Rule { targets, rest } => self.rule(targets, rest, origin),
            Statement::Other => {
                // a bare function call such as $(info …) may expand to nothing
                let expanded = self.expand_at(line, &Scope::default(), origin)?;
                if expanded.trim().is_empty() {
                    Ok(())
                } else {
                    Err(origin.error("missing separator"))
                }
            }
        }
    }

    fn assign(
        &mut self,
        name: &str,
        op: AssignOp,
        value: &str,
        origin: &Origin,
    ) -> BuildResult<()> {
        let name = self
            .expand_at(name, &Scope::default(), origin)?
            .trim()
            .to_string();
        if name.is_empty() {
            return Err(origin.error("empty variable name"));
        }

        let variable = match op {
            AssignOp::Recursive => Variable {
                value: value.to_string(),
                flavor: Flavor::Recursive,
            },
            AssignOp::Simple => Variable {
                value: self.expand_at(value, &Scope::default(), origin)?,
                flavor: Flavor::Simple,
            },
            AssignOp::Conditional => {
                if self.is_defined(&name) {
                    return Ok(());
                }
                Variable {
                    value: value.to_string(),
                    flavor: Flavor::Recursive,
                }
            }
            AssignOp::Append => match self.vars.get(&name) {
                Some(existing) => {
                    let addition = match existing.flavor {
                        Flavor::Simple => self.expand_at(value, &Scope::default(), origin)?,
                        Flavor::Recursive => value.to_string(),
                    };
                    Variable {
                        value: join_words(&existing.value, &addition),
                        flavor: existing.flavor,
                    }
                }
                None => Variable {
                    value: join_words(self.env.get(&name).unwrap_or(""), value),
                    flavor: Flavor::Recursive,
                },
            },
        };

        self.vars.insert(name, variable);
        Ok(())
    }

    fn is_defined(&self, name: &str) -> bool {
        self.vars.contains_key(name) || self.env.get(name).is_some()
    }

    fn rule(&mut self, targets: &str, rest: &str, origin: &Origin) -> BuildResult<()> {
        let scope = Scope::default();
        let targets: Vec<String> = words(&self.expand_at(targets, &scope, origin)?)
            .map(str::to_string)
            .collect();
        if targets.is_empty() {
            return Err(origin.error("rule without targets"));
        }

        let semicolon = find_top_level(rest, b';');
        let head = semicolon.map_or(rest, |pos| &rest[..pos]);

        // `target: NAME = value`
        if let Statement::Assign { .. } = classify(head) {
            if let Statement::Assign { name, op, value } = classify(rest) {
                for target in &targets {
                    let assign = TargetAssign {
                        name: name.to_string(),
                        op,
                        value: value.to_string(),
                        origin: origin.clone(),
                    };
                    if target.contains('%') {
                        self.pattern_vars.push((target.clone(), assign));
                    } else {
                        self.target_vars
                            .entry(target.clone())
                            .or_default()
                            .push(assign);
                    }
                }
                return Ok(());
            }
        }

        let inline = semicolon.map(|pos| rest[pos + 1..].trim().to_string());
        let mut members = Vec::with_capacity(targets.len());
        match classify(head) {
            // static pattern rule `targets: target-pattern: prereq-patterns`
            Statement::Rule {
                targets: target_pattern,
                rest: prereq_patterns,
            } => {
                let target_pattern = self.expand_at(target_pattern, &scope, origin)?;
                let target_pattern = target_pattern.trim();
                let (normal, order_only) = self.prerequisites(prereq_patterns, origin)?;
                for target in &targets {
                    let stem = pattern_stem(target_pattern, target).ok_or_else(|| {
                        origin.error(format!(
                            "target '{}' doesn't match the target pattern '{}'",
                            target, target_pattern
                        ))
                    })?;
                    let substitute = |p: &String| p.replacen('%', stem, 1);
                    let member = RuleMember {
                        target: target.clone(),
                        prerequisites: normal.iter().map(&substitute).collect(),
                        stem: Some(stem.to_string()),
                    };
                    members.push((member, order_only.iter().map(&substitute).collect()));
                }
            }
            _ => {
                let (normal, order_only) = self.prerequisites(head, origin)?;
                for target in &targets {
                    if target.contains('%') {
                        debug!(
                            "{}:{}: skipping pattern rule {}",
                            origin.path.display(),
                            origin.line,
                            target
                        );
                        continue;
                    }
                    let member = RuleMember {
                        target: target.clone(),
                        prerequisites: normal.clone(),
                        stem: None,
                    };
                    members.push((member, order_only.clone()));
                }
            }
        }

        let mut context_members = Vec::with_capacity(members.len());
        for (member, order_only) in members {
            let entry = self.targets.entry(member.target.clone()).or_default();
            entry
                .dependencies
                .extend(member.prerequisites.iter().cloned());
            entry.dependencies.extend(order_only);
            context_members.push(member);
        }

        self.current = Some(RuleContext {
            members: context_members,
            has_recipe: inline.is_some(),
            commands: inline.into_iter().filter(|c| !c.is_empty()).collect(),
            origin: origin.clone(),
        });
        Ok(())
    }

    /// Expand a prerequisite list into normal and order-only names
    fn prerequisites(
        &self,
        text: &str,
        origin: &Origin,
    ) -> BuildResult<(Vec<String>, Vec<String>)> {
        let expanded = self.expand_at(text, &Scope::default(), origin)?;
        let (normal, order_only) = match expanded.split_once('|') {
            Some((normal, order_only)) => (normal, order_only),
            None => (expanded.as_str(), ""),
        };
        Ok((
            words(normal).map(str::to_string).collect(),
            words(order_only).map(str::to_string).collect(),
        ))
    }

    fn close_rule(&mut self) {
        let Some(context) = self.current.take() else {
            return;
        };
        if !context.has_recipe && context.commands.is_empty() {
            return;
        }
        for member in context.members {
            let rule = PendingRule {
                prerequisites: member.prerequisites,
                stem: member.stem,
                commands: context.commands.clone(),
                origin: context.origin.clone(),
            };
            self.targets
                .entry(member.target)
                .or_default()
                .rules
                .push(rule);
        }
    }

    fn include(
        &mut self,
        rest: &str,
        optional: bool,
        origin: &Origin,
        depth: usize,
    ) -> BuildResult<()> {
        if depth >= MAX_INCLUDE_DEPTH {
            return Err(origin.error("includes nested too deeply (include loop?)"));
        }
        let files = self.expand_at(rest, &Scope::default(), origin)?;
        for file in words(&files) {
            let path = self.working_dir.join(file);
            if !path.is_file() {
                if optional {
                    debug!("Optional include {} not found", path.display());
                    continue;
                }
                return Err(origin.error(format!("{}: No such file", file)));
            }
            self.parse_file(&path, depth + 1)?;
        }
        Ok(())
    }

    fn open_define(&mut self, rest: &str, origin: &Origin) -> BuildResult<()> {
        let (name, op) = match rest.trim().rsplit_once(char::is_whitespace) {
            Some((name, "=")) => (name, AssignOp::Recursive),
            Some((name, ":=")) | Some((name, "::=")) => (name, AssignOp::Simple),
            Some((name, "?=")) => (name, AssignOp::Conditional),
            Some((name, "+=")) => (name, AssignOp::Append),
            _ => (rest.trim(), AssignOp::Recursive),
        };
        if name.is_empty() {
            return Err(origin.error("empty variable name"));
        }
        self.define = Some(Define {
            name: name.trim().to_string(),
            op,
            body: Vec::new(),
            origin: origin.clone(),
        });
        Ok(())
    }

    fn finish_define(&mut self, define: Define) -> BuildResult<()> {
        let body = define.body.join("\n");
        self.assign(&define.name, define.op, &body, &define.origin)
    }

    fn open_conditional(&mut self, keyword: &str, rest: &str, origin: &Origin) -> BuildResult<()> {
        let parent_active = self.active();
        let active = parent_active && self.evaluate(keyword, rest, origin)?;
        self.conditionals.push(Conditional {
            parent_active,
            taken: active,
            active,
            seen_else: false,
        });
        Ok(())
    }

    fn else_branch(&mut self, rest: &str, origin: &Origin) -> BuildResult<()> {
        let (parent_active, taken, seen_else) = match self.conditionals.last() {
            Some(c) => (c.parent_active, c.taken, c.seen_else),
            None => return Err(origin.error("'else' without a matching conditional")),
        };
        if seen_else {
            return Err(origin.error("only one 'else' per conditional"));
        }

        let (keyword, condition) = split_first_word(rest);
        let (active, final_else) = if rest.is_empty() {
            (parent_active && !taken, true)
        } else if matches!(keyword, "ifeq" | "ifneq" | "ifdef" | "ifndef") {
            let active = parent_active && !taken && self.evaluate(keyword, condition, origin)?;
            (active, false)
        } else {
            let reason = format!("unexpected text after 'else': {}", rest);
            return Err(origin.error(reason));
        };

        if let Some(c) = self.conditionals.last_mut() {
            c.active = active;
            c.taken |= active;
            c.seen_else = final_else;
        }
        Ok(())
    }

    fn evaluate(&self, keyword: &str, rest: &str, origin: &Origin) -> BuildResult<bool> {
        let scope = Scope::default();
        match keyword {
            "ifdef" | "ifndef" => {
                let name = self.expand_at(rest, &scope, origin)?;
                let name = name.trim();
                let defined = match self.vars.get(name) {
                    Some(variable) => !variable.value.is_empty(),
                    None => self.env.get(name).map_or(false, |v| !v.is_empty()),
                };
                Ok(defined == (keyword == "ifdef"))
            }
            _ => {
                let (left, right) = comparison_operands(rest).ok_or_else(|| {
                    origin.error(format!("invalid {} arguments: {}", keyword, rest))
                })?;
                let left = self.expand_at(left, &scope, origin)?;
                let right = self.expand_at(right, &scope, origin)?;
                Ok((left.trim() == right.trim()) == (keyword == "ifeq"))
            }
        }
    }

    fn expand_at(&self, text: &str, scope: &Scope<'_>, origin: &Origin) -> BuildResult<String> {
        self.expand(text, scope, &mut Vec::new())
            .map_err(|reason| origin.error(reason))
    }

    /// Expand every variable reference and function call in `text`
    fn expand(
        &self,
        text: &str,
        scope: &Scope<'_>,
        stack: &mut Vec<String>,
    ) -> Result<String, String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            match after.chars().next() {
                None => rest = "",
                Some('$') => {
                    out.push('$');
                    rest = &after[1..];
                }
                Some(open @ ('(' | '{')) => {
                    let close = if open == '(' { ')' } else { '}' };
                    let end = find_closing(after, open, close)
                        .ok_or_else(|| format!("unterminated variable reference in '{}'", text))?;
                    out.push_str(&self.expand_reference(&after[1..end], scope, stack)?);
                    rest = &after[end + 1..];
                }
                Some(c) => {
                    out.push_str(&self.lookup(c.encode_utf8(&mut [0; 4]), scope, stack)?);
                    rest = &after[c.len_utf8()..];
                }
            }
        }

        out.push_str(rest);
        Ok(out)
    }

    fn expand_reference(
        &self,
        inner: &str,
        scope: &Scope<'_>,
        stack: &mut Vec<String>,
    ) -> Result<String, String> {
        if let Some(pos) = inner.find(char::is_whitespace) {
            let head = &inner[..pos];
            if !head.contains(['$', ':']) {
                return self.call_function(head, inner[pos..].trim_start(), scope, stack);
            }
        }

        // substitution reference $(VAR:from=to)
        if let Some(colon) = find_top_level(inner, b':') {
            if let Some((from, to)) = inner[colon + 1..].split_once('=') {
                let name = self.expand(&inner[..colon], scope, stack)?;
                let value = self.lookup(name.trim(), scope, stack)?;
                let from = self.expand(from, scope, stack)?;
                let to = self.expand(to, scope, stack)?;
                return Ok(if from.contains('%') {
                    patsubst(&from, &to, &value)
                } else {
                    patsubst(&format!("%{}", from), &format!("%{}", to), &value)
                });
            }
        }

        let name = self.expand(inner, scope, stack)?;
        self.lookup(name.trim(), scope, stack)
    }

    fn lookup(
        &self,
        name: &str,
        scope: &Scope<'_>,
        stack: &mut Vec<String>,
    ) -> Result<String, String> {
        if let Some((_, value)) = scope.locals.iter().rev().find(|(n, _)| n == name) {
            return Ok(value.clone());
        }
        if let Some(value) = scope.automatic.and_then(|auto| auto.get(name)) {
            return Ok(value);
        }
        if let Some(value) = scope.target_vars.and_then(|vars| vars.get(name)) {
            return Ok(value.clone());
        }

        match self.vars.get(name) {
            Some(variable) if variable.flavor == Flavor::Simple => Ok(variable.value.clone()),
            Some(variable) => self.expand_variable(name, &variable.value, scope, stack),
            None => Ok(self.env.get(name).unwrap_or_default().to_string()),
        }
    }

    fn expand_variable(
        &self,
        name: &str,
        value: &str,
        scope: &Scope<'_>,
        stack: &mut Vec<String>,
    ) -> Result<String, String> {
        if stack.iter().any(|n| n == name) {
            return Err(format!(
                "Recursive variable '{}' references itself (eventually)",
                name
            ));
        }
        stack.push(name.to_string());
        let result = self.expand(value, scope, stack);
        stack.pop();
        result
    }

    fn call_function(
        &self,
        function: &str,
        args: &str,
        scope: &Scope<'_>,
        stack: &mut Vec<String>,
    ) -> Result<String, String> {
        let mut expand = |text: &str| self.expand(text, scope, stack);

        let result = match function {
            "subst" => {
                let [from, to, text] = three(split_args(args, 3), function)?;
                let (from, to, text) = (expand(from)?, expand(to)?, expand(text)?);
                if from.is_empty() {
                    text
                } else {
                    text.replace(&from, &to)
                }
            }
            "patsubst" => {
                let [pattern, replacement, text] = three(split_args(args, 3), function)?;
                patsubst(&expand(pattern)?, &expand(replacement)?, &expand(text)?)
            }
            "addprefix" | "addsuffix" => {
                let [affix, names] = two(split_args(args, 2), function)?;
                let (affix, names) = (expand(affix)?, expand(names)?);
                words(&names)
                    .map(|name| {
                        if function == "addprefix" {
                            format!("{}{}", affix, name)
                        } else {
                            format!("{}{}", name, affix)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            }
            "notdir" => map_words(&expand(args)?, |w| Some(file_part(w).to_string())),
            "dir" => map_words(&expand(args)?, |w| Some(dir_part(w).to_string())),
            "basename" => map_words(&expand(args)?, |w| {
                Some(suffix_start(w).map_or(w, |pos| &w[..pos]).to_string())
            }),
            "suffix" => map_words(&expand(args)?, |w| {
                suffix_start(w).map(|pos| w[pos..].to_string())
            }),
            "strip" => words(&expand(args)?).collect::<Vec<_>>().join(" "),
            "sort" => {
                let text = expand(args)?;
                let mut sorted: Vec<&str> = words(&text).collect();
                sorted.sort_unstable();
                sorted.dedup();
                sorted.join(" ")
            }
            "filter" | "filter-out" => {
                let [patterns, text] = two(split_args(args, 2), function)?;
                let (patterns, text) = (expand(patterns)?, expand(text)?);
                let keep = function == "filter";
                words(&text)
                    .filter(|w| {
                        words(&patterns).any(|p| pattern_stem(p, w).is_some()) == keep
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            }
            "firstword" => words(&expand(args)?).next().unwrap_or_default().to_string(),
            "lastword" => words(&expand(args)?).last().unwrap_or_default().to_string(),
            "words" => words(&expand(args)?).count().to_string(),
            "wildcard" => self.wildcard(&expand(args)?).join(" "),
            "if" => {
                let parts = split_args(args, 3);
                let condition = expand(parts[0])?;
                match (condition.trim().is_empty(), parts.get(1).copied(), parts.get(2).copied()) {
                    (false, Some(then), _) => expand(then)?,
                    (true, _, Some(otherwise)) => expand(otherwise)?,
                    _ => String::new(),
                }
            }
            "foreach" => {
                let [var, list, body] = three(split_args(args, 3), function)?;
                let (var, list) = (expand(var)?, expand(list)?);
                let var = var.trim();
                let mut results = Vec::new();
                for word in words(&list) {
                    let inner = scope.with_local(var, word);
                    results.push(self.expand(body, &inner, stack)?);
                }
                results.join(" ")
            }
            "call" => {
                let parts = split_args(args, usize::MAX);
                let name = expand(parts[0])?;
                let name = name.trim();
                let mut inner = scope.with_local("0", name);
                for (index, arg) in parts.iter().enumerate().skip(1) {
                    inner = inner.with_local(&index.to_string(), &self.expand(arg, scope, stack)?);
                }
                match self.vars.get(name) {
                    Some(variable) if variable.flavor == Flavor::Simple => {
                        self.expand(&variable.value, &inner, stack)?
                    }
                    Some(variable) => self.expand_variable(name, &variable.value, &inner, stack)?,
                    None => String::new(),
                }
            }
            "info" => {
                info!("{}", expand(args)?);
                String::new()
            }
            "warning" => {
                warn!("{}", expand(args)?);
                String::new()
            }
            "error" => return Err(expand(args)?),
            _ => {
                warn!("Unsupported function '{}' expands to nothing", function);
                String::new()
            }
        };
        Ok(result)
    }

    /// Expand `*`/`?` globs in the last path component, relative to the working directory
    fn wildcard(&self, patterns: &str) -> Vec<String> {
        let mut matches = Vec::new();
        for pattern in words(patterns) {
            let (dir, file) = match pattern.rsplit_once('/') {
                Some((dir, file)) => (Some(dir), file),
                None => (None, pattern),
            };

            if !file.contains(['*', '?']) {
                if self.working_dir.join(pattern).exists() {
                    matches.push(pattern.to_string());
                }
                continue;
            }

            let Some(matcher) = glob_regex(file) else {
                continue;
            };
            let search = match dir {
                Some(dir) => self.working_dir.join(dir),
                None => self.working_dir.to_path_buf(),
            };
            let mut found: Vec<String> = WalkDir::new(&search)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(Result::ok)
                .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
                .filter(|name| {
                    matcher.is_match(name) && (file.starts_with('.') || !name.starts_with('.'))
                })
                .map(|name| match dir {
                    Some(dir) => format!("{}/{}", dir, name),
                    None => name,
                })
                .collect();
            found.sort();
            matches.extend(found);
        }
        matches
    }

    /// Final values of target-specific variables for `target`
    fn target_variables(&self, target: &str) -> BuildResult<BTreeMap<String, String>> {
        let assigns = self
            .pattern_vars
            .iter()
            .filter(|(pattern, _)| pattern_stem(pattern, target).is_some())
            .map(|(_, assign)| assign)
            .chain(self.target_vars.get(target).into_iter().flatten());

        let mut values = BTreeMap::new();
        for assign in assigns {
            let value = {
                let scope = Scope {
                    target_vars: Some(&values),
                    ..Scope::default()
                };
                match assign.op {
                    AssignOp::Recursive | AssignOp::Simple => {
                        self.expand_at(&assign.value, &scope, &assign.origin)?
                    }
                    AssignOp::Conditional => {
                        if values.contains_key(&assign.name) || self.is_defined(&assign.name) {
                            continue;
                        }
                        self.expand_at(&assign.value, &scope, &assign.origin)?
                    }
                    AssignOp::Append => {
                        let base = self
                            .expand(&format!("$({})", assign.name), &scope, &mut Vec::new())
                            .map_err(|reason| assign.origin.error(reason))?;
                        let addition = self.expand_at(&assign.value, &scope, &assign.origin)?;
                        join_words(&base, &addition)
                    }
                }
            };
            values.insert(assign.name.clone(), value);
        }
        Ok(values)
    }

    fn finish(mut self) -> BuildResult<TargetGraph> {
        self.close_rule();

        let missing: Vec<String> = self
            .targets
            .values()
            .flat_map(|entry| entry.dependencies.iter())
            .filter(|dep| !self.targets.contains_key(*dep))
            .cloned()
            .collect();
        for name in missing {
            self.targets.entry(name).or_default();
        }

        let mut graph = TargetGraph::new();
        for (name, entry) in &self.targets {
            let mut target = Target::new(name.as_str());
            target.variables = self.target_variables(name)?;

            let mut seen = HashSet::new();
            target.dependencies = entry
                .dependencies
                .iter()
                .filter(|dep| seen.insert(dep.as_str()))
                .cloned()
                .collect();

            for rule in &entry.rules {
                let automatic = Automatic::new(name, &rule.prerequisites, rule.stem.as_deref());
                let scope = Scope {
                    automatic: Some(&automatic),
                    target_vars: Some(&target.variables),
                    locals: Vec::new(),
                };
                let mut commands = Vec::with_capacity(rule.commands.len());
                for command in &rule.commands {
                    let expanded = self.expand_at(command, &scope, &rule.origin)?;
                    let command = expanded
                        .trim_start_matches(|c: char| {
                            matches!(c, '@' | '-' | '+') || c.is_whitespace()
                        })
                        .trim_end();
                    if !command.is_empty() {
                        commands.push(command.to_string());
                    }
                }
                target.rules.push(Rule::new(commands));
            }

            graph.add_target(target);
        }

        debug!("Parsed {} targets", graph.len());
        Ok(graph)
    }
}

fn join_words(base: &str, addition: &str) -> String {
    match (base.is_empty(), addition.is_empty()) {
        (true, _) => addition.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{} {}", base, addition),
    }
}

fn map_words(text: &str, f: impl Fn(&str) -> Option<String>) -> String {
    words(text).filter_map(f).collect::<Vec<_>>().join(" ")
}

fn two<'a>(args: Vec<&'a str>, function: &str) -> Result<[&'a str; 2], String> {
    <[&str; 2]>::try_from(args).map_err(|args| arity_error(function, 2, args.len()))
}

fn three<'a>(args: Vec<&'a str>, function: &str) -> Result<[&'a str; 3], String> {
    <[&str; 3]>::try_from(args).map_err(|args| arity_error(function, 3, args.len()))
}

fn arity_error(function: &str, expected: usize, got: usize) -> String {
    format!(
        "function '{}' expects {} arguments (got {})",
        function, expected, got
    )
}

/// Operands of `ifeq`/`ifneq`, in `(a,b)` or quoted `"a" "b"` form
fn comparison_operands(text: &str) -> Option<(&str, &str)> {
    let text = text.trim();
    if let Some(inner) = text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        let comma = find_top_level(inner, b',')?;
        return Some((&inner[..comma], &inner[comma + 1..]));
    }

    let quoted = |s: &'_ str| -> Option<(usize, usize)> {
        let quote = s.chars().next().filter(|c| *c == '"' || *c == '\'')?;
        let end = s[1..].find(quote)? + 1;
        Some((1, end))
    };
    let (start, end) = quoted(text)?;
    let left = &text[start..end];
    let rest = text[end + 1..].trim_start();
    let (start, end) = quoted(rest)?;
    rest[end + 1..]
        .trim()
        .is_empty()
        .then(|| (left, &rest[start..end]))
}
