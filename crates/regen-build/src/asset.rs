//! Asset naming conventions: derivable graphics kinds, ignored targets, audio includes
use crate::error::{BuildError, BuildResult};
use regex::Regex;
use std::fmt;

/// Extension of raw binary blobs that are expected to come from somewhere
pub const RAW_BINARY_EXTENSION: &str = "bin";

/// Extension of the audio sources the sample converter reads
pub const AUDIO_SOURCE_EXTENSION: &str = "aif";

/// Target names that never carry artifact semantics
const IGNORED_NAMES: [&str; 5] = ["tidy", "tools", "mostlyclean", "clean", ".PHONY"];

/// Link stage outputs, never produced by this tool
const IGNORED_EXTENSIONS: &str = "o|ld|elf|gba|sym";

/// A graphics artifact kind the graphics converter can derive from a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    /// 1 bit per pixel tiles
    OneBpp,
    /// 4 bits per pixel tiles
    FourBpp,
    /// 8 bits per pixel tiles
    EightBpp,
    /// Hardware palette
    Gbapal,
    /// LZ77 compressed blob
    Lz,
    /// Run-length compressed blob
    Rl,
}

impl AssetKind {
    /// All kinds, in matching order
    pub const ALL: [AssetKind; 6] = [
        Self::OneBpp,
        Self::FourBpp,
        Self::EightBpp,
        Self::Gbapal,
        Self::Lz,
        Self::Rl,
    ];

    /// File extension of this kind
    pub fn extension(&self) -> &'static str {
        match self {
            Self::OneBpp => "1bpp",
            Self::FourBpp => "4bpp",
            Self::EightBpp => "8bpp",
            Self::Gbapal => "gbapal",
            Self::Lz => "lz",
            Self::Rl => "rl",
        }
    }

    /// Parse an extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.extension() == ext)
    }

    /// Split a logical name into its base and derivable kind
    pub fn of(name: &str) -> Option<(&str, AssetKind)> {
        let (base, ext) = name.rsplit_once('.')?;
        Self::from_extension(ext).map(|kind| (base, kind))
    }

    /// Source extensions in priority order; the empty string means the bare
    /// base name (compression wraps another artifact)
    pub fn source_extensions(&self) -> &'static [&'static str] {
        match self {
            Self::OneBpp | Self::FourBpp | Self::EightBpp => &["png"],
            Self::Gbapal => &["pal", "png"],
            Self::Lz | Self::Rl => &[""],
        }
    }

    /// Candidate source names for `base`, in priority order
    pub fn source_candidates(&self, base: &str) -> Vec<String> {
        self.source_extensions()
            .iter()
            .map(|ext| {
                if ext.is_empty() {
                    base.to_string()
                } else {
                    format!("{}.{}", base, ext)
                }
            })
            .collect()
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Whether a name can be produced by the graphics converter without a rule
pub fn is_derivable(name: &str) -> bool {
    AssetKind::of(name).is_some()
}

/// Whether a name is a raw binary blob
pub fn is_raw_binary(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.eq_ignore_ascii_case(RAW_BINARY_EXTENSION))
        .unwrap_or(false)
}

/// Matcher for auxiliary targets that carry no artifact semantics
#[derive(Debug, Clone)]
pub struct IgnoreList {
    pattern: Regex,
}

impl IgnoreList {
    /// Build the matcher from the built-in names plus `extra` exact names
    pub fn new(extra: &[String]) -> BuildResult<Self> {
        let names = IGNORED_NAMES
            .iter()
            .map(|name| regex::escape(name))
            .chain(extra.iter().map(|name| regex::escape(name)))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(r"^((.*)\.({})|{})$", IGNORED_EXTENSIONS, names))
            .map_err(|e| BuildError::InvalidConfig(format!("ignore list: {}", e)))?;
        Ok(Self { pattern })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }
}

/// A direct-include name pattern produced by the audio sample converter
#[derive(Debug, Clone)]
struct AudioRule {
    pattern: Regex,
    compress: bool,
}

/// Ordered audio include rules; the first match wins
#[derive(Debug, Clone)]
pub struct AudioRules {
    rules: Vec<AudioRule>,
}

impl AudioRules {
    /// Cry samples are stored compressed, every other sound blob raw
    pub fn standard() -> BuildResult<Self> {
        let rule = |pattern: &str, compress| -> BuildResult<AudioRule> {
            Ok(AudioRule {
                pattern: Regex::new(pattern)
                    .map_err(|e| BuildError::InvalidConfig(format!("audio rule: {}", e)))?,
                compress,
            })
        };
        Ok(Self {
            rules: vec![
                rule(r"^sound/direct_sound_samples/cries/cry_(.*)\.bin$", true)?,
                rule(r"^sound/(.*)\.bin$", false)?,
            ],
        })
    }

    /// Returns the compression flag of the first rule matching `name`
    pub fn find(&self, name: &str) -> Option<bool> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(name))
            .map(|rule| rule.compress)
    }
}

/// Name of the audio source sitting next to `name`
pub fn audio_source_name(name: &str) -> String {
    let base = name.rsplit_once('.').map(|(base, _)| base).unwrap_or(name);
    format!("{}.{}", base, AUDIO_SOURCE_EXTENSION)
}
