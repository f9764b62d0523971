//! Library operations and CQL library resolution.
//!
//! [`LibraryResolver`] turns `Library` resources into decoded
//! [`LibrarySource`]s (cached) and collects the transitive `include`s a
//! library needs. It is shared by CQL execution and measure evaluation.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use octofhir_core::ResourceType;
use octofhir_cql_service::{
    CqlConfig, CqlError, LibraryHeader, LibraryInclude, LibrarySource, LibrarySourceCache,
};
use serde_json::{Value, json};

use super::ResourceProvider;
use super::narrative::NarrativeGenerator;
use crate::operations::{
    OperationDefinition, OperationError, OperationProvider, OperationTarget, Parameters,
};

pub const REFRESH_GENERATED_CONTENT: &str = "refresh-generated-content";
pub const GET_NARRATIVE: &str = "get-narrative";

/// Resolves CQL libraries stored on this server.
#[derive(Clone)]
pub struct LibraryResolver {
    provider: Arc<ResourceProvider>,
    cache: Arc<LibrarySourceCache>,
}

impl LibraryResolver {
    pub fn new(provider: Arc<ResourceProvider>, cache: Arc<LibrarySourceCache>) -> Self {
        Self { provider, cache }
    }

    pub fn provider(&self) -> &Arc<ResourceProvider> {
        &self.provider
    }

    pub fn cache(&self) -> &Arc<LibrarySourceCache> {
        &self.cache
    }

    /// Library by CQL name, optionally pinned to a version.
    pub async fn by_name(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Arc<LibrarySource>, OperationError> {
        let dao = self.provider.dao();
        Ok(self.cache.get_or_load(name, version, dao.as_ref()).await?)
    }

    /// Library by canonical url (`url|version`) or `Library/{id}` reference.
    pub async fn by_canonical(&self, canonical: &str) -> Result<Arc<LibrarySource>, OperationError> {
        let stored = self
            .provider
            .resolve_canonical(canonical)
            .await
            .map_err(|_| CqlError::LibraryNotFound(canonical.to_string()))?;
        Ok(self.cache.load(&stored)?)
    }

    /// Every library reachable through `include` declarations, each once.
    pub async fn dependencies(
        &self,
        library: &LibrarySource,
    ) -> Result<Vec<LibrarySource>, OperationError> {
        self.resolve_includes(&LibraryHeader::parse(&library.cql).includes, &library.name)
            .await
    }

    /// Resolves `includes` and their transitive includes. `root` is never
    /// resolved again, which cuts include cycles back to the caller.
    pub async fn resolve_includes(
        &self,
        includes: &[LibraryInclude],
        root: &str,
    ) -> Result<Vec<LibrarySource>, OperationError> {
        let mut seen: HashSet<String> = HashSet::from([root.to_string()]);
        let mut queue: VecDeque<LibraryInclude> = includes.iter().cloned().collect();
        let mut resolved = Vec::new();
        while let Some(include) = queue.pop_front() {
            if !seen.insert(include.name.clone()) {
                continue;
            }
            let source = self
                .by_name(&include.name, include.version.as_deref())
                .await?;
            queue.extend(LibraryHeader::parse(&source.cql).includes);
            resolved.push(source.as_ref().clone());
        }
        Ok(resolved)
    }
}

/// `depends-on` related artifacts for a set of includes.
pub(crate) fn depends_on(includes: &[LibraryInclude]) -> Vec<Value> {
    includes
        .iter()
        .map(|include| {
            let resource = match &include.version {
                Some(v) => format!("Library/{}|{v}", include.name),
                None => format!("Library/{}", include.name),
            };
            json!({"type": "depends-on", "resource": resource})
        })
        .collect()
}

/// Replaces the `depends-on` entries of `relatedArtifact`, keeping the rest.
pub(crate) fn replace_dependencies(resource: &mut Value, dependencies: Vec<Value>) {
    let mut related: Vec<Value> = resource
        .get("relatedArtifact")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|a| a.get("type").and_then(Value::as_str) != Some("depends-on"))
        .cloned()
        .collect();
    related.extend(dependencies);
    if let Some(obj) = resource.as_object_mut() {
        if related.is_empty() {
            obj.remove("relatedArtifact");
        } else {
            obj.insert("relatedArtifact".into(), Value::Array(related));
        }
    }
}

pub struct LibraryOperationsProvider {
    resolver: LibraryResolver,
    narrative: NarrativeGenerator,
}

impl LibraryOperationsProvider {
    pub fn new(library_provider: Arc<ResourceProvider>, narrative: NarrativeGenerator) -> Self {
        let cache = Arc::new(LibrarySourceCache::new(CqlConfig::default().cache_capacity));
        Self {
            resolver: LibraryResolver::new(library_provider, cache),
            narrative,
        }
    }

    /// Replaces the decoded-source cache (to apply a configured capacity).
    pub fn with_cache(mut self, cache: Arc<LibrarySourceCache>) -> Self {
        self.resolver.cache = cache;
        self
    }

    pub fn resolver(&self) -> &LibraryResolver {
        &self.resolver
    }

    /// Re-derives `relatedArtifact` and the narrative from the CQL content
    /// and stores the result.
    pub async fn refresh_generated_content(&self, id: &str) -> Result<Value, OperationError> {
        let provider = self.resolver.provider();
        let mut library = provider.read(id).await?.resource;
        let source = LibrarySource::from_library_resource(&library)?;
        let header = LibraryHeader::parse(&source.cql);

        replace_dependencies(&mut library, depends_on(&header.includes));
        if library.get("name").is_none() {
            library["name"] = json!(source.name);
        }
        if library.get("version").is_none() {
            if let Some(v) = &source.version {
                library["version"] = json!(v);
            }
        }
        let library = self.narrative.apply(library);
        let stored = provider.update(id, library).await?;
        self.resolver.cache().invalidate(&source.name);

        tracing::info!(
            library = %source.identifier(),
            dependencies = header.includes.len(),
            "Refreshed generated content"
        );
        Ok(stored.resource)
    }

    pub async fn narrative_of(&self, id: &str) -> Result<Value, OperationError> {
        let library = self.resolver.provider().read(id).await?.resource;
        Ok(Parameters::new()
            .with_string("narrative", self.narrative.render(&library))
            .into_value())
    }
}

#[async_trait]
impl OperationProvider for LibraryOperationsProvider {
    fn name(&self) -> &'static str {
        "library-operations"
    }

    fn resource_type(&self) -> Option<ResourceType> {
        Some(ResourceType::Library)
    }

    fn operations(&self) -> Vec<OperationDefinition> {
        vec![
            OperationDefinition::on(ResourceType::Library, REFRESH_GENERATED_CONTENT)
                .at_instance()
                .affecting_state(),
            OperationDefinition::on(ResourceType::Library, GET_NARRATIVE).at_instance(),
        ]
    }

    async fn invoke(
        &self,
        code: &str,
        target: &OperationTarget,
        _params: &Parameters,
    ) -> Result<Value, OperationError> {
        match (code, target) {
            (REFRESH_GENERATED_CONTENT, OperationTarget::Instance(ResourceType::Library, id)) => {
                self.refresh_generated_content(id).await
            }
            (GET_NARRATIVE, OperationTarget::Instance(ResourceType::Library, id)) => {
                self.narrative_of(id).await
            }
            _ => Err(OperationError::unsupported(code, target)),
        }
    }
}
