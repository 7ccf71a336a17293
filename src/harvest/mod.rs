//! Line harvesters
//!
//! A harvester inspects a single line of subprocess output and, when the line
//! carries a self-reported metric, extracts its value. Harvesters are plain
//! values: stateless, cloneable and reusable across lines and invocations.
//!
//! A line matches a tag when its
//! first whitespace-delimited token is the tag itself or the tag followed by
//! a colon, so `SELFTIMED 3.14` and `SELFTIMED: 3.14` are equivalent. Numeric
//! harvesters demand exactly one value token; anything else on a tagged line
//! is a protocol violation and surfaces as a [`HarvestError`].
//!
//! The runtime statistics printed by GHC's `+RTS -s` are also understood:
//! `Productivity  97.8% of total user, ...`, `Alloc rate  1,234 bytes per MUT
//! second` and `2,152 bytes maximum residency (1 sample(s))`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;


pub const SELFTIMED_TAG: &str = "SELFTIMED";
pub const PRODUCTIVITY_TAG: &str = "PRODUCTIVITY";
pub const JITTIME_TAG: &str = "JITTIME";
pub const ALLOC_RATE_TAG: &str = "ALLOC_RATE";
pub const MEM_FOOTPRINT_TAG: &str = "MEM_FOOTPRINT";

/// How the payload of a tagged line is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Int,
    Double,
    #[serde(rename = "string", alias = "text")]
    Text,
}

impl ValueKind {
    fn is_numeric(self) -> bool {
        !matches!(self, ValueKind::Text)
    }
}

impl FromStr for ValueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "int" | "integer" => Ok(ValueKind::Int),
            "double" | "float" => Ok(ValueKind::Double),
            "string" | "text" => Ok(ValueKind::Text),
            other => Err(format!(
                "invalid value kind: {other} (expected \"int\", \"double\" or \"string\")"
            )),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Int => write!(f, "int"),
            ValueKind::Double => write!(f, "double"),
            ValueKind::Text => write!(f, "string"),
        }
    }
}

/// A value extracted from a line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HarvestValue {
    Int(i64),
    Double(f64),
    Text(String),
}

impl HarvestValue {
    /// Numeric view of the value; `None` for text payloads.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HarvestValue::Int(v) => Some(*v as f64),
            HarvestValue::Double(v) => Some(*v),
            HarvestValue::Text(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            HarvestValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for HarvestValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarvestValue::Int(v) => write!(f, "{v}"),
            HarvestValue::Double(v) => write!(f, "{v}"),
            HarvestValue::Text(v) => write!(f, "{v}"),
        }
    }
}

/// A successful match: the tag that matched and the value it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct Harvest {
    pub tag: String,
    pub value: HarvestValue,
}

impl Harvest {
    fn new(tag: &str, value: HarvestValue) -> Self {
        Self {
            tag: tag.to_string(),
            value,
        }
    }
}

/// A line claimed to carry a metric but its payload was malformed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HarvestError {
    #[error("tag {tag} has no value in line {line:?}")]
    MissingValue { tag: String, line: String },

    #[error("tag {tag} expects a single value but found extra tokens in line {line:?}")]
    TrailingTokens { tag: String, line: String },

    #[error("tag {tag} has non-numeric value {token:?} in line {line:?}")]
    InvalidNumber {
        tag: String,
        token: String,
        line: String,
    },

    #[error("tag {tag} value {value} is outside {min}..={max} in line {line:?}")]
    OutOfRange {
        tag: String,
        value: f64,
        min: f64,
        max: f64,
        line: String,
    },
}

/// A rule mapping one line of output to an optional metric.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LineHarvester {
    /// Never matches.
    #[default]
    Null,
    /// `TAG VALUE` / `TAG: VALUE`.
    Tagged { tag: String, kind: ValueKind },
    /// `Productivity <PCT>% of total user, ...`
    RtsProductivity,
    /// `Alloc rate <N> bytes per MUT second`
    RtsAllocRate,
    /// `<N> bytes maximum residency ...`
    RtsMemFootprint,
    /// Rejects numeric matches outside `min..=max`.
    Bounded {
        inner: Box<LineHarvester>,
        min: f64,
        max: f64,
    },
    /// First harvester that matches wins.
    OrElse(Box<LineHarvester>, Box<LineHarvester>),
}

impl LineHarvester {
    pub fn null() -> Self {
        LineHarvester::Null
    }

    pub fn tagged(tag: impl Into<String>, kind: ValueKind) -> Self {
        LineHarvester::Tagged {
            tag: tag.into(),
            kind,
        }
    }

    /// Self-reported elapsed seconds, overriding wall-clock measurement.
    pub fn selftimed() -> Self {
        Self::tagged(SELFTIMED_TAG, ValueKind::Double)
    }

    /// Self-reported JIT / compile time in seconds.
    pub fn jit_time() -> Self {
        Self::tagged(JITTIME_TAG, ValueKind::Double)
    }

    /// Percentage of time not spent in garbage collection, either tagged or
    /// as printed by the GHC runtime.
    pub fn productivity() -> Self {
        Self::tagged(PRODUCTIVITY_TAG, ValueKind::Double)
            .or_else(LineHarvester::RtsProductivity)
            .bounded(0.0, 100.0)
    }

    pub fn alloc_rate() -> Self {
        LineHarvester::RtsAllocRate
    }

    pub fn mem_footprint() -> Self {
        LineHarvester::RtsMemFootprint
    }

    pub fn custom_int(tag: impl Into<String>) -> Self {
        Self::tagged(tag, ValueKind::Int)
    }

    pub fn custom_double(tag: impl Into<String>) -> Self {
        Self::tagged(tag, ValueKind::Double)
    }

    pub fn custom_string(tag: impl Into<String>) -> Self {
        Self::tagged(tag, ValueKind::Text)
    }

    pub fn or_else(self, other: LineHarvester) -> Self {
        or_else(self, other)
    }

    pub fn bounded(self, min: f64, max: f64) -> Self {
        LineHarvester::Bounded {
            inner: Box::new(self),
            min,
            max,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, LineHarvester::Null)
    }

    /// Apply the rule to one line.
    ///
    /// Returns `Ok(None)` when the line is unrelated, `Ok(Some(_))` on a
    /// match and `Err(_)` when the line names the tag but violates the
    /// protocol.
    pub fn harvest(&self, line: &str) -> Result<Option<Harvest>, HarvestError> {
        match self {
            LineHarvester::Null => Ok(None),
            LineHarvester::Tagged { tag, kind } => harvest_tagged(tag, *kind, line),
            LineHarvester::RtsProductivity => harvest_rts_productivity(line),
            LineHarvester::RtsAllocRate => harvest_rts_alloc_rate(line),
            LineHarvester::RtsMemFootprint => harvest_rts_mem_footprint(line),
            LineHarvester::Bounded { inner, min, max } => {
                let Some(found) = inner.harvest(line)? else {
                    return Ok(None);
                };
                match found.value.as_f64() {
                    Some(value) if value < *min || value > *max => Err(HarvestError::OutOfRange {
                        tag: found.tag,
                        value,
                        min: *min,
                        max: *max,
                        line: line.to_string(),
                    }),
                    _ => Ok(Some(found)),
                }
            }
            LineHarvester::OrElse(first, second) => match first.harvest(line)? {
                Some(found) => Ok(Some(found)),
                None => second.harvest(line),
            },
        }
    }
}

impl fmt::Display for LineHarvester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineHarvester::Null => write!(f, "null"),
            LineHarvester::Tagged { tag, kind } => write!(f, "{tag}:{kind}"),
            LineHarvester::RtsProductivity => write!(f, "rts-productivity"),
            LineHarvester::RtsAllocRate => write!(f, "rts-alloc-rate"),
            LineHarvester::RtsMemFootprint => write!(f, "rts-mem-footprint"),
            LineHarvester::Bounded { inner, min, max } => write!(f, "{inner}[{min}..={max}]"),
            LineHarvester::OrElse(a, b) => write!(f, "{a} | {b}"),
        }
    }
}

/// Try `first`; fall back to `second` when `first` does not match.
pub fn or_else(first: LineHarvester, second: LineHarvester) -> LineHarvester {
    match (first, second) {
        (LineHarvester::Null, other) | (other, LineHarvester::Null) => other,
        (a, b) => LineHarvester::OrElse(Box::new(a), Box::new(b)),
    }
}

/// The harvesters a run applies, by role.
///
/// Timing, JIT time and custom harvesters read stdout only. Productivity,
/// allocation rate and memory footprint read both streams because the GHC
/// runtime prints its statistics on stderr.
#[derive(Debug, Clone, PartialEq)]
pub struct Harvesters {
    pub timing: LineHarvester,
    pub productivity: LineHarvester,
    pub alloc_rate: LineHarvester,
    pub mem_footprint: LineHarvester,
    pub jit_time: LineHarvester,
    pub custom: Vec<LineHarvester>,
}

impl Default for Harvesters {
    fn default() -> Self {
        Self {
            timing: LineHarvester::selftimed(),
            productivity: LineHarvester::productivity(),
            alloc_rate: LineHarvester::alloc_rate(),
            mem_footprint: LineHarvester::mem_footprint(),
            jit_time: LineHarvester::jit_time(),
            custom: Vec::new(),
        }
    }
}

impl Harvesters {
    /// Harvest nothing; every run reports wall-clock time only.
    pub fn none() -> Self {
        Self {
            timing: LineHarvester::Null,
            productivity: LineHarvester::Null,
            alloc_rate: LineHarvester::Null,
            mem_footprint: LineHarvester::Null,
            jit_time: LineHarvester::Null,
            custom: Vec::new(),
        }
    }

    pub fn with_timing(mut self, harvester: LineHarvester) -> Self {
        self.timing = harvester;
        self
    }

    pub fn with_productivity(mut self, harvester: LineHarvester) -> Self {
        self.productivity = harvester;
        self
    }

    pub fn with_custom(mut self, harvester: LineHarvester) -> Self {
        self.custom.push(harvester);
        self
    }
}

fn matches_tag(token: &str, tag: &str) -> bool {
    token == tag || token.strip_suffix(':') == Some(tag)
}

fn harvest_tagged(
    tag: &str,
    kind: ValueKind,
    line: &str,
) -> Result<Option<Harvest>, HarvestError> {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some(first) if matches_tag(first, tag) => {}
        _ => return Ok(None),
    }

    if !kind.is_numeric() {
        let payload = tokens.collect::<Vec<_>>().join(" ");
        return Ok(Some(Harvest::new(tag, HarvestValue::Text(payload))));
    }

    let token = tokens.next().ok_or_else(|| HarvestError::MissingValue {
        tag: tag.to_string(),
        line: line.to_string(),
    })?;
    if tokens.next().is_some() {
        return Err(HarvestError::TrailingTokens {
            tag: tag.to_string(),
            line: line.to_string(),
        });
    }

    let value = parse_number(tag, kind, token, line)?;
    Ok(Some(Harvest::new(tag, value)))
}

fn parse_number(
    tag: &str,
    kind: ValueKind,
    token: &str,
    line: &str,
) -> Result<HarvestValue, HarvestError> {
    let invalid = || HarvestError::InvalidNumber {
        tag: tag.to_string(),
        token: token.to_string(),
        line: line.to_string(),
    };

    match kind {
        ValueKind::Int => token.parse::<i64>().map(HarvestValue::Int).map_err(|_| invalid()),
        ValueKind::Double => match token.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(HarvestValue::Double(v)),
            _ => Err(invalid()),
        },
        ValueKind::Text => Ok(HarvestValue::Text(token.to_string())),
    }
}

fn parse_grouped_int(tag: &str, token: &str, line: &str) -> Result<HarvestValue, HarvestError> {
    let digits: String = token.chars().filter(|c| *c != ',').collect();
    parse_number(tag, ValueKind::Int, &digits, line).map_err(|_| HarvestError::InvalidNumber {
        tag: tag.to_string(),
        token: token.to_string(),
        line: line.to_string(),
    })
}

fn harvest_rts_productivity(line: &str) -> Result<Option<Harvest>, HarvestError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 5
        || tokens[0] != "Productivity"
        || tokens[2..5] != ["of", "total", "user,"]
    {
        return Ok(None);
    }

    let pct = tokens[1].trim_end_matches('%');
    parse_number(PRODUCTIVITY_TAG, ValueKind::Double, pct, line)
        .map(|value| Some(Harvest::new(PRODUCTIVITY_TAG, value)))
}

fn harvest_rts_alloc_rate(line: &str) -> Result<Option<Harvest>, HarvestError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 7
        || tokens[0..2] != ["Alloc", "rate"]
        || tokens[3..7] != ["bytes", "per", "MUT", "second"]
    {
        return Ok(None);
    }

    parse_grouped_int(ALLOC_RATE_TAG, tokens[2], line)
        .map(|value| Some(Harvest::new(ALLOC_RATE_TAG, value)))
}

fn harvest_rts_mem_footprint(line: &str) -> Result<Option<Harvest>, HarvestError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 || tokens[1..4] != ["bytes", "maximum", "residency"] {
        return Ok(None);
    }

    parse_grouped_int(MEM_FOOTPRINT_TAG, tokens[0], line)
        .map(|value| Some(Harvest::new(MEM_FOOTPRINT_TAG, value)))
}
