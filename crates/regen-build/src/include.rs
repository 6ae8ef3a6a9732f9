//! Materialization of directly included artifacts
//!
//! Some artifacts are referenced straight from assembly or C sources rather
//! than through a description-file target. After the waves finish, each such
//! name not already produced is copied from the source root, derived with the
//! graphics converter, or converted from its audio sample.

use crate::asset::{audio_source_name, is_derivable, is_raw_binary, AudioRules};
use crate::dispatch::{Dispatcher, Outcome, ResolveChain};
use crate::error::{BuildError, BuildResult};
use crate::scheduler::FixedTargets;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Read a direct-include list: one name per line, `#` lines and blanks ignored
pub fn read_include_list(path: &Path) -> BuildResult<Vec<String>> {
    let content = fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
    Ok(parse_include_list(&content))
}

/// Parse the contents of a direct-include list
pub fn parse_include_list(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Counters for one include pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IncludeStats {
    /// Names already produced by the waves
    pub already_fixed: usize,
    /// Verbatim copies written
    pub copied: usize,
    /// Derived or converted outputs written
    pub built: usize,
    pub up_to_date: usize,
    /// Raw binaries nothing can produce
    pub missing_binaries: usize,
    /// Other names nothing can produce
    pub unresolved: usize,
}

#[derive(Debug)]
enum IncludeJob<'n> {
    Copy(&'n str),
    Derive(&'n str),
    Audio {
        name: &'n str,
        source: PathBuf,
        compress: bool,
    },
}

impl IncludeJob<'_> {
    fn run(&self, dispatcher: &Dispatcher) -> BuildResult<Outcome> {
        match self {
            Self::Copy(name) => dispatcher.copy_source(name),
            Self::Derive(name) => {
                info!("Incbin gfx target {}", name);
                dispatcher.materialize(name, &BTreeMap::new(), &ResolveChain::new())
            }
            Self::Audio {
                name,
                source,
                compress,
            } => {
                info!("Incbin aif2pcm target {} (compress: {})", name, compress);
                dispatcher.build_audio(name, source, *compress)
            }
        }
    }
}

/// Produces direct includes on the shared worker pool
pub struct IncludeMaterializer<'a> {
    dispatcher: &'a Dispatcher,
    pool: &'a ThreadPool,
    audio: &'a AudioRules,
}

impl<'a> IncludeMaterializer<'a> {
    pub fn new(dispatcher: &'a Dispatcher, pool: &'a ThreadPool, audio: &'a AudioRules) -> Self {
        Self {
            dispatcher,
            pool,
            audio,
        }
    }

    /// Materialize every name not in `fixed`
    ///
    /// All jobs run to completion; the first failure in list order is returned.
    pub fn run(&self, names: &[String], fixed: &FixedTargets) -> BuildResult<IncludeStats> {
        let mut stats = IncludeStats::default();
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();

        for name in names {
            if !seen.insert(name.as_str()) {
                continue;
            }
            if fixed.contains(name) {
                stats.already_fixed += 1;
                continue;
            }
            match self.classify(name) {
                Some(job) => jobs.push(job),
                None if is_raw_binary(name) => {
                    warn!("Missing include .bin file: {}", name);
                    stats.missing_binaries += 1;
                }
                None => {
                    debug!("Include {} has no producer", name);
                    stats.unresolved += 1;
                }
            }
        }

        let results: Vec<(bool, BuildResult<Outcome>)> = self.pool.install(|| {
            jobs.par_iter()
                .map(|job| {
                    let is_copy = matches!(job, IncludeJob::Copy(_));
                    (is_copy, job.run(self.dispatcher))
                })
                .collect()
        });

        let mut first_error = None;
        for (is_copy, result) in results {
            match result {
                Ok(Outcome::Built) if is_copy => stats.copied += 1,
                Ok(Outcome::Built) => stats.built += 1,
                Ok(_) => stats.up_to_date += 1,
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(stats),
        }
    }

    fn classify<'n>(&self, name: &'n str) -> Option<IncludeJob<'n>> {
        let resolver = self.dispatcher.resolver();
        if resolver.exists_in_source(name) {
            return Some(IncludeJob::Copy(name));
        }
        if is_derivable(name) {
            return Some(IncludeJob::Derive(name));
        }

        let compress = self.audio.find(name)?;
        let sample = audio_source_name(name);
        resolver
            .exists_in_source(&sample)
            .then(|| IncludeJob::Audio {
                name,
                source: resolver.source_root().join(&sample),
                compress,
            })
    }
}
