//! Wave scheduling of graph layers on a bounded worker pool
use crate::asset::{is_derivable, IgnoreList};
use crate::dispatch::{Dispatcher, Outcome, ResolveChain};
use crate::error::{BuildError, BuildResult};
use crate::graph::{Target, TargetGraph};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Names produced (or found as sources) during the current run
///
/// Insert-only and safe for concurrent insertion.
#[derive(Debug, Default)]
pub struct FixedTargets {
    names: Mutex<BTreeSet<String>>,
}

impl FixedTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Sorted copy of the set
    pub fn snapshot(&self) -> Vec<String> {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Counters for one scheduler run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WaveStats {
    /// Layers fully processed
    pub layers: usize,
    /// Targets seen across those layers
    pub targets: usize,
    pub built: usize,
    pub up_to_date: usize,
    pub delegated: usize,
    pub no_command: usize,
    /// Targets that already exist at the source root
    pub fixed_from_source: usize,
    pub ignored: usize,
    /// Rule-less targets that are not derivable
    pub skipped: usize,
}

impl WaveStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Built => self.built += 1,
            Outcome::UpToDate => self.up_to_date += 1,
            Outcome::Delegated => self.delegated += 1,
            Outcome::NoCommand => self.no_command += 1,
        }
    }
}

/// Work submitted to the pool for one target
#[derive(Debug, Clone, Copy)]
enum Job<'g> {
    /// Run the target's rule
    Rule(&'g Target),
    /// Derive the target with the graphics converter
    Derive(&'g Target),
}

impl<'g> Job<'g> {
    fn target(&self) -> &'g Target {
        match self {
            Self::Rule(target) | Self::Derive(target) => target,
        }
    }
}

/// Drives layers through the dispatcher, one barrier per layer
pub struct WaveScheduler<'a> {
    dispatcher: &'a Dispatcher,
    pool: &'a ThreadPool,
    ignore: &'a IgnoreList,
}

impl<'a> WaveScheduler<'a> {
    /// Create a scheduler over a dispatcher and a worker pool
    pub fn new(dispatcher: &'a Dispatcher, pool: &'a ThreadPool, ignore: &'a IgnoreList) -> Self {
        Self {
            dispatcher,
            pool,
            ignore,
        }
    }

    /// Process `layers` in order
    ///
    /// Every job of a layer runs to completion before the next layer starts.
    /// If any job fails, the first failure in layer order is returned once
    /// its siblings have finished, and no further layer is started.
    /// Successfully processed targets are added to `fixed`.
    pub fn run(
        &self,
        graph: &TargetGraph,
        layers: &[Vec<String>],
        fixed: &FixedTargets,
    ) -> BuildResult<WaveStats> {
        let mut stats = WaveStats::default();

        for (index, layer) in layers.iter().enumerate() {
            let mut jobs = Vec::new();

            for name in layer {
                stats.targets += 1;
                let Some(target) = graph.get(name) else {
                    return Err(BuildError::InvalidConfig(format!(
                        "layer {} names '{}', which is not in the graph",
                        index, name
                    )));
                };

                if self.ignore.matches(name) {
                    debug!("Ignoring target {}", name);
                    stats.ignored += 1;
                } else if self.dispatcher.resolver().exists_in_source(name) {
                    debug!("Target {} already exists as a source", name);
                    fixed.insert(name.as_str());
                    stats.fixed_from_source += 1;
                } else if target.has_rule() {
                    jobs.push(Job::Rule(target));
                } else if is_derivable(name) {
                    jobs.push(Job::Derive(target));
                } else {
                    debug!("Target has no rules and is not a graphics file: {}", name);
                    stats.skipped += 1;
                }
            }

            debug!("Layer {}: {} jobs", index, jobs.len());
            let results: Vec<(&str, BuildResult<Outcome>)> = self.pool.install(|| {
                jobs.par_iter()
                    .map(|job| (job.target().name.as_str(), self.run_job(*job)))
                    .collect()
            });

            let mut first_error = None;
            for (name, result) in results {
                match result {
                    Ok(outcome) => {
                        fixed.insert(name);
                        stats.record(outcome);
                    }
                    Err(error) => {
                        first_error.get_or_insert(error);
                    }
                }
            }
            if let Some(error) = first_error {
                return Err(error);
            }

            stats.layers += 1;
        }

        Ok(stats)
    }

    fn run_job(&self, job: Job<'_>) -> BuildResult<Outcome> {
        let target = job.target();
        info!("Processing target {}", target.name);
        match job {
            Job::Rule(target) => self.dispatcher.dispatch_target(target),
            Job::Derive(target) => {
                self.dispatcher
                    .materialize(&target.name, &target.variables, &ResolveChain::new())
            }
        }
    }
}
