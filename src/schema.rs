//! Channel schemas and the `meta.json` document of a file tub.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TubError};
use crate::value::Kind;

/// One named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: Kind,
}

impl Channel {
    pub fn new(name: impl Into<String>, kind: Kind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered channel list with unique names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Channel>", into = "Vec<Channel>")]
pub struct Schema {
    channels: Vec<Channel>,
}

impl Schema {
    pub fn new(channels: Vec<Channel>) -> Result<Self> {
        let mut seen = HashSet::new();
        for ch in &channels {
            if ch.name.is_empty() {
                return Err(TubError::InvalidConfiguration(
                    "channel names must not be empty".into(),
                ));
            }
            if !seen.insert(ch.name.as_str()) {
                return Err(TubError::InvalidConfiguration(format!(
                    "duplicate channel '{}'",
                    ch.name
                )));
            }
        }
        Ok(Self { channels })
    }

    /// Build from the index-aligned `inputs`/`types` pair.
    pub fn from_parts<S: AsRef<str>, K: AsRef<str>>(inputs: &[S], types: &[K]) -> Result<Self> {
        if inputs.len() != types.len() {
            return Err(TubError::InvalidConfiguration(format!(
                "{} inputs but {} types",
                inputs.len(),
                types.len()
            )));
        }
        Self::new(
            inputs
                .iter()
                .zip(types)
                .map(|(name, kind)| Channel::new(name.as_ref(), Kind::parse(kind.as_ref())))
                .collect(),
        )
    }

    /// Parse the `[{"name": ..., "type": ...}]` form.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    pub fn types(&self) -> Vec<Kind> {
        self.channels.iter().map(|c| c.kind.clone()).collect()
    }

    pub fn kind_of(&self, name: &str) -> Option<&Kind> {
        self.channels
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.kind)
    }
}

impl TryFrom<Vec<Channel>> for Schema {
    type Error = TubError;

    fn try_from(channels: Vec<Channel>) -> Result<Self> {
        Self::new(channels)
    }
}

impl From<Schema> for Vec<Channel> {
    fn from(schema: Schema) -> Self {
        schema.channels
    }
}

/// `meta.json`: `{"inputs": [...], "types": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TubMeta {
    pub inputs: Vec<String>,
    pub types: Vec<String>,
}

impl TubMeta {
    pub fn from_schema(schema: &Schema) -> Self {
        Self {
            inputs: schema.inputs(),
            types: schema.types().iter().map(|k| k.name().to_string()).collect(),
        }
    }

    pub fn schema(&self) -> Result<Schema> {
        Schema::from_parts(self.inputs.as_slice(), self.types.as_slice())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TubError::NotFound(path.display().to_string()));
        }
        let meta: Self = serde_json::from_slice(&fs::read(path)?)?;
        // Validates alignment and uniqueness.
        meta.schema()?;
        Ok(meta)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }
}
