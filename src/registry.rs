use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::normalize::SourceMapping;
use crate::schema::SchemaDef;
use crate::types::Source;
use crate::verify::VerificationScheme;

/// Everything the pipeline needs to know about one source platform:
/// how to authenticate it, what its payloads look like, and how to
/// map them into canonical events.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub source: Source,
    pub scheme: VerificationScheme,
    pub schema: SchemaDef,
    pub mapping: SourceMapping,
    /// Overrides the pipeline-wide freshness tolerance for this source.
    pub freshness_tolerance: Option<Duration>,
}

impl SourceConfig {
    pub fn new(
        source: impl Into<String>,
        scheme: VerificationScheme,
        schema: SchemaDef,
        mapping: SourceMapping,
    ) -> Self {
        Self {
            source: Source::new(source),
            scheme,
            schema,
            mapping,
            freshness_tolerance: None,
        }
    }

    pub fn with_freshness_tolerance(mut self, tolerance: Duration) -> Self {
        self.freshness_tolerance = Some(tolerance);
        self
    }
}

/// `source -> configuration` capability map, resolved once at startup.
///
/// Immutable after construction: source-specific strategy lookup never
/// races with inbound deliveries, and the router never has to reach
/// back into source-specific logic.
#[derive(Default)]
pub struct SourceRegistry {
    sources: HashMap<Source, Arc<SourceConfig>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, config: SourceConfig) -> Self {
        self.sources.insert(config.source.clone(), Arc::new(config));
        self
    }

    pub fn get(&self, source: &Source) -> Option<Arc<SourceConfig>> {
        self.sources.get(source).cloned()
    }

    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.keys()
    }
}
