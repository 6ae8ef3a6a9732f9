//! Timestamp staleness checks
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Decide whether `output` has to be (re)built from `inputs`
///
/// An output without inputs, a missing output, or any input whose timestamp
/// cannot be read is always stale. Otherwise the output is stale when the
/// newest input is strictly newer than it. Never touches the filesystem
/// beyond reading metadata.
pub fn is_stale(output: &Path, inputs: &[PathBuf]) -> bool {
    if inputs.is_empty() {
        return true;
    }

    let Some(output_time) = modified(output) else {
        return true;
    };

    let mut newest = None;
    for input in inputs {
        match modified(input) {
            Some(time) => newest = newest.max(Some(time)),
            None => return true,
        }
    }

    newest.map_or(true, |newest| newest > output_time)
}
