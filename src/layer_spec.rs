//! Layer Spec Module
//!
//! Parses the textual description of a layer stack. The grammar is a
//! comma-separated list of layer tokens, outermost first, each optionally
//! followed by colon-delimited parameters:
//!
//! ```text
//! spec       := token ("," token)*
//! token      := name (":" param)*
//! name       := "base" | "crc" | "replication"
//! ```
//!
//! The last token must be the single terminal layer (`base`).
//!
//! `replication` takes `factor[:quorum[:read-policy]]`, where the quorum
//! defaults to the factor and the read policy is `first` or `round-robin`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest replication factor a spec may request
pub const MAX_REPLICATION_FACTOR: u32 = 7;

/// Deepest layer stack a spec may describe
pub const MAX_LAYERS: usize = 32;

/// Errors raised while parsing a layer spec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("Layer spec is empty")]
    Empty,

    #[error("Empty layer token at position {position}")]
    EmptyToken { position: usize },

    #[error("Unknown layer '{name}' at position {position}")]
    UnknownLayer { position: usize, name: String },

    #[error("Invalid parameter '{value}' for layer '{layer}': {reason}")]
    InvalidParameter {
        layer: String,
        value: String,
        reason: String,
    },

    #[error("Layer '{layer}' takes at most {max} parameters, found {found}")]
    TooManyParameters {
        layer: String,
        max: usize,
        found: usize,
    },

    #[error("Layer spec must end in a terminal layer, found '{last}'")]
    MissingTerminal { last: String },

    #[error("Terminal layer at position {position} is not the last layer")]
    MultipleTerminals { position: usize },

    #[error("Layer spec has {count} layers, at most {max} are allowed")]
    TooManyLayers { count: usize, max: usize },
}

/// Result type for spec parsing
pub type SpecResult<T> = Result<T, SpecError>;

/// Type tag of a layer, as used in the wire encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LayerKind {
    Base = 1,
    Crc = 2,
    Replication = 3,
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Base => "base",
            LayerKind::Crc => "crc",
            LayerKind::Replication => "replication",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LayerKind::Base)
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(LayerKind::Base),
            2 => Some(LayerKind::Crc),
            3 => Some(LayerKind::Replication),
            _ => None,
        }
    }

    pub fn tag(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which replica the replication layer tries first on a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadPolicy {
    /// Always start from placement 0 and fall back in order
    #[default]
    FirstHealthy,
    /// Rotate the starting placement on every read
    RoundRobin,
}

impl ReadPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPolicy::FirstHealthy => "first",
            ReadPolicy::RoundRobin => "round-robin",
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            ReadPolicy::FirstHealthy => 0,
            ReadPolicy::RoundRobin => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ReadPolicy::FirstHealthy),
            1 => Some(ReadPolicy::RoundRobin),
            _ => None,
        }
    }
}

impl FromStr for ReadPolicy {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(ReadPolicy::FirstHealthy),
            "round-robin" | "rr" => Ok(ReadPolicy::RoundRobin),
            other => Err(SpecError::InvalidParameter {
                layer: LayerKind::Replication.name().to_string(),
                value: other.to_string(),
                reason: "read policy must be 'first' or 'round-robin'".to_string(),
            }),
        }
    }
}

/// One parsed layer: its kind plus parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerDescriptor {
    Base,
    Crc,
    Replication {
        factor: u32,
        quorum: u32,
        read_policy: ReadPolicy,
    },
}

impl LayerDescriptor {
    /// Replication with quorum equal to the factor and first-healthy reads
    pub fn replication(factor: u32) -> Self {
        LayerDescriptor::Replication {
            factor,
            quorum: factor,
            read_policy: ReadPolicy::FirstHealthy,
        }
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            LayerDescriptor::Base => LayerKind::Base,
            LayerDescriptor::Crc => LayerKind::Crc,
            LayerDescriptor::Replication { .. } => LayerKind::Replication,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// Check parameter ranges
    pub fn validate(&self) -> SpecResult<()> {
        if let LayerDescriptor::Replication { factor, quorum, .. } = *self {
            validate_replication(factor, quorum)?;
        }
        Ok(())
    }

    fn parse_token(position: usize, token: &str) -> SpecResult<Self> {
        let mut parts = token.split(':').map(str::trim);
        let name = parts.next().unwrap_or_default();
        let params: Vec<&str> = parts.collect();

        let descriptor = match name {
            "base" => {
                no_parameters(LayerKind::Base, &params)?;
                LayerDescriptor::Base
            }
            "crc" => {
                no_parameters(LayerKind::Crc, &params)?;
                LayerDescriptor::Crc
            }
            "replication" => parse_replication(&params)?,
            other => {
                return Err(SpecError::UnknownLayer {
                    position,
                    name: other.to_string(),
                })
            }
        };

        descriptor.validate()?;
        Ok(descriptor)
    }
}

impl fmt::Display for LayerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerDescriptor::Base | LayerDescriptor::Crc => f.write_str(self.kind().name()),
            LayerDescriptor::Replication {
                factor,
                quorum,
                read_policy,
            } => {
                write!(f, "replication:{}", factor)?;
                if *read_policy != ReadPolicy::FirstHealthy {
                    write!(f, ":{}:{}", quorum, read_policy.as_str())
                } else if quorum != factor {
                    write!(f, ":{}", quorum)
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn no_parameters(kind: LayerKind, params: &[&str]) -> SpecResult<()> {
    if params.is_empty() {
        Ok(())
    } else {
        Err(SpecError::TooManyParameters {
            layer: kind.name().to_string(),
            max: 0,
            found: params.len(),
        })
    }
}

fn parse_count(value: &str, what: &str) -> SpecResult<u32> {
    value.parse::<u32>().map_err(|_| SpecError::InvalidParameter {
        layer: LayerKind::Replication.name().to_string(),
        value: value.to_string(),
        reason: format!("{} must be a positive integer", what),
    })
}

fn parse_replication(params: &[&str]) -> SpecResult<LayerDescriptor> {
    let layer = LayerKind::Replication.name().to_string();

    if params.len() > 3 {
        return Err(SpecError::TooManyParameters {
            layer,
            max: 3,
            found: params.len(),
        });
    }

    let factor = match params.first() {
        Some(value) => parse_count(value, "replication factor")?,
        None => {
            return Err(SpecError::InvalidParameter {
                layer,
                value: String::new(),
                reason: "replication factor is required".to_string(),
            })
        }
    };

    let quorum = match params.get(1) {
        Some(value) => parse_count(value, "quorum")?,
        None => factor,
    };

    let read_policy = match params.get(2) {
        Some(value) => value.parse()?,
        None => ReadPolicy::default(),
    };

    Ok(LayerDescriptor::Replication {
        factor,
        quorum,
        read_policy,
    })
}

fn validate_replication(factor: u32, quorum: u32) -> SpecResult<()> {
    let layer = LayerKind::Replication.name().to_string();

    if factor == 0 || factor > MAX_REPLICATION_FACTOR {
        return Err(SpecError::InvalidParameter {
            layer,
            value: factor.to_string(),
            reason: format!(
                "replication factor must be between 1 and {}",
                MAX_REPLICATION_FACTOR
            ),
        });
    }

    if quorum == 0 || quorum > factor {
        return Err(SpecError::InvalidParameter {
            layer,
            value: quorum.to_string(),
            reason: format!("quorum must be between 1 and the factor ({})", factor),
        });
    }

    Ok(())
}

/// Ordered layer descriptors, outermost first, ending in one terminal layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayerSpec {
    layers: Vec<LayerDescriptor>,
}

impl BlockLayerSpec {
    /// Build a spec from descriptors, enforcing the single-terminal invariant
    pub fn new(layers: Vec<LayerDescriptor>) -> SpecResult<Self> {
        let last = match layers.last() {
            Some(last) => last,
            None => return Err(SpecError::Empty),
        };

        if layers.len() > MAX_LAYERS {
            return Err(SpecError::TooManyLayers {
                count: layers.len(),
                max: MAX_LAYERS,
            });
        }

        for (position, layer) in layers.iter().enumerate() {
            layer.validate()?;
            if layer.is_terminal() && position + 1 != layers.len() {
                return Err(SpecError::MultipleTerminals { position });
            }
        }

        if !last.is_terminal() {
            return Err(SpecError::MissingTerminal {
                last: last.to_string(),
            });
        }

        Ok(Self { layers })
    }

    /// Parse a textual spec such as `replication:3,crc,base`
    pub fn parse(spec: &str) -> SpecResult<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(SpecError::Empty);
        }

        let layers = spec
            .split(',')
            .map(str::trim)
            .enumerate()
            .map(|(position, token)| {
                if token.is_empty() {
                    Err(SpecError::EmptyToken { position })
                } else {
                    LayerDescriptor::parse_token(position, token)
                }
            })
            .collect::<SpecResult<Vec<_>>>()?;

        Self::new(layers)
    }

    /// Wrap descriptors read back from a live stack, which already satisfies
    /// the single-terminal invariant.
    pub(crate) fn from_live_stack(layers: Vec<LayerDescriptor>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    /// Number of layers in the stack
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn outermost(&self) -> &LayerDescriptor {
        &self.layers[0]
    }
}

impl FromStr for BlockLayerSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BlockLayerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, layer) in self.layers.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", layer)?;
        }
        Ok(())
    }
}
