use std::{fmt, path::Path};

use figment::{
    providers::{Data, Json, Yaml},
    value::{Dict, Map},
    Error, Metadata, Profile, Provider,
};

/// Document formats a configuration source can be written in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceFormat {
    Yaml,
    Json,
}

impl SourceFormat {
    fn parse(self, contents: &str) -> Result<Map<Profile, Dict>, Error> {
        match self {
            SourceFormat::Yaml => Data::<Yaml>::string(contents).data(),
            SourceFormat::Json => Data::<Json>::string(contents).data(),
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFormat::Yaml => f.write_str("YAML"),
            SourceFormat::Json => f.write_str("JSON"),
        }
    }
}

/// A configuration source that was read and parsed when it was added to the loader.
///
/// Bad files surface as errors at the point they are added, rather than on the first query.
pub struct ResolvedProvider {
    data: Map<Profile, Dict>,
    metadata: Metadata,
}

impl ResolvedProvider {
    pub fn from_file(path: &Path, format: SourceFormat) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        Ok(Self {
            data: format.parse(&contents)?,
            metadata: Metadata::from(format!("{} file", format), path),
        })
    }

    pub fn from_document(contents: &str, format: SourceFormat) -> Result<Self, Error> {
        Ok(Self {
            data: format.parse(contents)?,
            metadata: Metadata::named(format!("inline {} document", format)),
        })
    }
}

impl Provider for ResolvedProvider {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        Ok(self.data.clone())
    }
}
