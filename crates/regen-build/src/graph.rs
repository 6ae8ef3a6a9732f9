//! Target graph and its topological layering
use crate::asset::AssetKind;
use crate::env::Environment;
use crate::error::{BuildError, BuildResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// A production rule: the command lines that produce a target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rule {
    /// Command lines, in order
    pub commands: Vec<String>,
}

impl Rule {
    /// Create a rule from its command lines
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }
}

/// A named artifact in the graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    /// Logical output name (relative path)
    pub name: String,
    /// Production rules; more than one is a configuration error
    pub rules: Vec<Rule>,
    /// Target-scoped variables (e.g. GFX_OPTS)
    pub variables: BTreeMap<String, String>,
    /// Names of the targets this one depends on
    pub dependencies: Vec<String>,
}

impl Target {
    /// Create a rule-less target
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a rule
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Add a rule made of a single command line
    pub fn with_command(self, command: impl Into<String>) -> Self {
        self.with_rule(Rule::new(vec![command.into()]))
    }

    /// Add dependencies
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Set a target-scoped variable
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Whether the target has any rule at all
    pub fn has_rule(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Derivable asset kind of this target, if any
    pub fn kind(&self) -> Option<AssetKind> {
        AssetKind::of(&self.name).map(|(_, kind)| kind)
    }

    /// Look up a target-scoped variable
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// The single command line of this target
    ///
    /// Returns `None` for a pure leaf or a dependency-only rule. More than one
    /// rule, or more than one command line, is a `MalformedRule`.
    pub fn command_line(&self) -> BuildResult<Option<&str>> {
        match self.rules.as_slice() {
            [] => Ok(None),
            [rule] => match rule.commands.as_slice() {
                [] => Ok(None),
                [command] => Ok(Some(command.as_str())),
                commands => Err(BuildError::malformed(
                    &self.name,
                    format!("expected 1 command (got {})", commands.len()),
                )),
            },
            rules => Err(BuildError::malformed(
                &self.name,
                format!("expected only one rule (got {})", rules.len()),
            )),
        }
    }
}

/// Parses a build description into a target graph
pub trait TargetGraphProvider {
    /// Load the graph described by the file at `path`
    fn load(&self, path: &Path, env: &Environment) -> BuildResult<TargetGraph>;
}

impl<F> TargetGraphProvider for F
where
    F: Fn(&Path, &Environment) -> BuildResult<TargetGraph>,
{
    fn load(&self, path: &Path, env: &Environment) -> BuildResult<TargetGraph> {
        self(path, env)
    }
}

/// Dependency graph of targets
#[derive(Debug, Clone, Default)]
pub struct TargetGraph {
    /// Targets by name
    targets: HashMap<String, Target>,
}

impl TargetGraph {
    /// Create a new empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a target, replacing any previous target of the same name
    pub fn add_target(&mut self, target: Target) {
        self.targets.insert(target.name.clone(), target);
    }

    /// Get a target by name
    pub fn get(&self, name: &str) -> Option<&Target> {
        self.targets.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    /// Iterate over all targets in unspecified order
    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Check that every dependency names a target in the graph
    pub fn validate(&self) -> BuildResult<()> {
        for (name, target) in &self.targets {
            for dep in &target.dependencies {
                if !self.targets.contains_key(dep) {
                    return Err(BuildError::UnknownTarget {
                        target: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Partition the graph into layers that can each be built concurrently
    ///
    /// Every dependency of a target in layer `i` lies in a layer `< i`. Layers
    /// are sorted by name for deterministic output. Dependencies outside the
    /// graph are ignored here; `validate` reports them.
    pub fn layers(&self) -> BuildResult<Vec<Vec<String>>> {
        if self.targets.is_empty() {
            return Ok(Vec::new());
        }

        let mut pending: HashMap<&str, usize> = HashMap::with_capacity(self.targets.len());
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, target) in &self.targets {
            let mut count = 0;
            for dep in &target.dependencies {
                if let Some((dep_name, _)) = self.targets.get_key_value(dep) {
                    dependents
                        .entry(dep_name.as_str())
                        .or_default()
                        .push(name.as_str());
                    count += 1;
                }
            }
            pending.insert(name.as_str(), count);
        }

        let mut current: Vec<&str> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        current.sort_unstable();

        let mut layers = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            let mut next = Vec::new();
            for name in &current {
                for dependent in dependents.get(name).into_iter().flatten() {
                    if let Some(count) = pending.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }

            placed += current.len();
            layers.push(current.iter().map(|name| name.to_string()).collect());
            next.sort_unstable();
            current = next;
        }

        if placed != self.targets.len() {
            return Err(BuildError::CircularDependency(self.find_cycle()));
        }

        Ok(layers)
    }

    /// Find a cycle in the graph (for error reporting)
    fn find_cycle(&self) -> String {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        let mut names: Vec<&String> = self.targets.keys().collect();
        names.sort();

        for name in names {
            if let Some(cycle) =
                self.dfs_find_cycle(name, &mut visited, &mut rec_stack, &mut path)
            {
                return cycle;
            }
        }

        "unknown cycle".to_string()
    }

    /// DFS to find a cycle
    fn dfs_find_cycle(
        &self,
        name: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<String> {
        if rec_stack.contains(name) {
            path.push(name.to_string());
            if let Some(start) = path.iter().position(|t| t == name) {
                return Some(path[start..].join(" -> "));
            }
            return Some(path.join(" -> "));
        }

        if visited.contains(name) {
            return None;
        }

        visited.insert(name.to_string());
        rec_stack.insert(name.to_string());
        path.push(name.to_string());

        if let Some(target) = self.targets.get(name) {
            for dep in &target.dependencies {
                if let Some(cycle) = self.dfs_find_cycle(dep, visited, rec_stack, path) {
                    return Some(cycle);
                }
            }
        }

        rec_stack.remove(name);
        path.pop();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_of(targets: Vec<Target>) -> TargetGraph {
        let mut graph = TargetGraph::new();
        for target in targets {
            graph.add_target(target);
        }
        graph
    }

    #[test]
    fn test_empty_graph() {
        let graph = TargetGraph::new();
        assert!(graph.is_empty());
        assert!(graph.layers().unwrap().is_empty());
    }

    #[test]
    fn test_layers_independent() {
        let graph = graph_of(vec![Target::new("c"), Target::new("a"), Target::new("b")]);
        assert_eq!(graph.layers().unwrap(), vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn test_layers_diamond() {
        let graph = graph_of(vec![
            Target::new("a").with_dependencies(["b", "c"]),
            Target::new("b").with_dependencies(["d"]),
            Target::new("c").with_dependencies(["d"]),
            Target::new("d"),
        ]);

        let layers = graph.layers().unwrap();
        assert_eq!(layers, vec![vec!["d"], vec!["b", "c"], vec!["a"]]);
    }

    #[test]
    fn test_layers_longest_path_decides() {
        // a depends on d directly and through b; a must come after b
        let graph = graph_of(vec![
            Target::new("a").with_dependencies(["b", "d"]),
            Target::new("b").with_dependencies(["d"]),
            Target::new("d"),
        ]);
        assert_eq!(
            graph.layers().unwrap(),
            vec![vec!["d"], vec!["b"], vec!["a"]]
        );
    }

    #[test]
    fn test_layers_duplicate_dependency() {
        let graph = graph_of(vec![
            Target::new("a").with_dependencies(["b", "b"]),
            Target::new("b"),
        ]);
        assert_eq!(graph.layers().unwrap(), vec![vec!["b"], vec!["a"]]);
    }

    #[test]
    fn test_circular_dependency_detection() {
        let graph = graph_of(vec![
            Target::new("a").with_dependencies(["b"]),
            Target::new("b").with_dependencies(["a"]),
            Target::new("c"),
        ]);

        match graph.layers() {
            Err(BuildError::CircularDependency(msg)) => {
                assert!(msg.contains("a -> b -> a") || msg.contains("b -> a -> b"));
            }
            other => panic!("Expected CircularDependency error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let graph = graph_of(vec![Target::new("a").with_dependencies(["ghost"])]);
        match graph.validate() {
            Err(BuildError::UnknownTarget { target, dependency }) => {
                assert_eq!(target, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("Expected UnknownTarget error, got {:?}", other),
        }
    }

    #[test]
    fn test_command_line_rules() {
        assert_eq!(Target::new("a").command_line().unwrap(), None);
        assert_eq!(
            Target::new("a")
                .with_rule(Rule::default())
                .command_line()
                .unwrap(),
            None
        );
        assert_eq!(
            Target::new("a")
                .with_command("cat b > a")
                .command_line()
                .unwrap(),
            Some("cat b > a")
        );
    }

    #[test]
    fn test_command_line_rejects_two_rules() {
        let target = Target::new("a").with_command("x").with_command("y");
        assert!(matches!(
            target.command_line(),
            Err(BuildError::MalformedRule { .. })
        ));
    }

    #[test]
    fn test_command_line_rejects_two_commands() {
        let target =
            Target::new("a").with_rule(Rule::new(vec!["x".to_string(), "y".to_string()]));
        assert!(matches!(
            target.command_line(),
            Err(BuildError::MalformedRule { .. })
        ));
    }

    #[test]
    fn test_target_kind_and_variables() {
        let target = Target::new("gfx/a.4bpp").with_variable("GFX_OPTS", "-mwidth 2");
        assert_eq!(target.kind(), Some(AssetKind::FourBpp));
        assert_eq!(target.variable("GFX_OPTS"), Some("-mwidth 2"));
        assert!(!target.has_rule());
    }
}

#[cfg(test)]
mod layering_proptest {
    use super::*;
    use proptest::prelude::*;
    use proptest::sample::Index;

    /// Random DAG: target `i` may only depend on targets `< i`
    fn dag() -> impl Strategy<Value = TargetGraph> {
        prop::collection::vec(prop::collection::vec(any::<Index>(), 0..4), 1..32).prop_map(
            |picks| {
                let count = picks.len();
                // reverse numbering so name order is not a topological order
                let name = |i: usize| format!("t{:02}", count - i);
                let mut graph = TargetGraph::new();
                for (i, deps) in picks.iter().enumerate() {
                    let mut target = Target::new(name(i));
                    if i > 0 {
                        target = target.with_dependencies(deps.iter().map(|d| name(d.index(i))));
                    }
                    graph.add_target(target);
                }
                graph
            },
        )
    }

    proptest! {
        #[test]
        fn layers_respect_every_edge(graph in dag()) {
            let layers = graph.layers().unwrap();

            let mut layer_of = HashMap::new();
            for (index, layer) in layers.iter().enumerate() {
                let mut sorted = layer.clone();
                sorted.sort();
                prop_assert_eq!(&sorted, layer);
                for name in layer {
                    prop_assert!(layer_of.insert(name.clone(), index).is_none());
                }
            }
            prop_assert_eq!(layer_of.len(), graph.len());

            for target in graph.targets() {
                let own = layer_of[&target.name];
                for dep in &target.dependencies {
                    prop_assert!(layer_of[dep] < own);
                }
                if own > 0 {
                    let prev = own - 1;
                    prop_assert!(target.dependencies.iter().any(|dep| layer_of[dep] == prev));
                }
            }
        }

        #[test]
        fn self_dependency_is_circular(graph in dag(), pick in any::<Index>()) {
            let mut names: Vec<String> = graph.targets().map(|t| t.name.clone()).collect();
            names.sort();
            let name = names[pick.index(names.len())].clone();

            let mut graph = graph;
            let target = graph.get(&name).cloned().unwrap();
            graph.add_target(target.with_dependencies([name.clone()]));

            prop_assert!(matches!(
                graph.layers(),
                Err(BuildError::CircularDependency(_))
            ));
        }
    }
}
