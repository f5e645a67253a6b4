//! Dependency-ordered reference resolution.
//!
//! A pass sorts every materialisable resource so each comes after the
//! resources it references, then runs their `resolve_upstreams` in that order
//! inside one transaction. Readers see either none or all of a pass.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{error, info};

use fhirmat_core::{Capability, UpstreamId};

use crate::context::FhirContext;
use crate::resources::{MaterialiseError, ResourceDefinition, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    /// Never recovered from: the listed resources can not be ordered.
    #[error("dependency cycle between resources: {}", .0.join(", "))]
    Cycle(Vec<String>),
    /// The pass committed but these rows kept losing version races.
    #[error("{0} rows deferred after repeated stale writes")]
    Deferred(usize),
    #[error(transparent)]
    Materialise(#[from] MaterialiseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolverState {
    #[default]
    Idle,
    Sorting,
    /// Running the resolve step of the i-th resource in sorted order.
    Resolving(usize),
}

/// Outcome of one resolver pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverPass {
    /// Sorted order of the pass.
    pub order: Vec<String>,
    /// Rows each resource looked at, in the order they ran.
    pub resolved: Vec<(String, usize)>,
    /// Rows left unresolved for the next pass.
    pub deferred: Vec<(String, UpstreamId)>,
}

/// Orders definitions so every resource follows the resources it references.
///
/// References to resources outside `resources` count as satisfied, as do
/// self-references. When a full scan moves nothing, the leftovers form a
/// cycle and are reported together.
pub fn sort_by_dependency(
    resources: Vec<Arc<dyn ResourceDefinition>>,
) -> Result<Vec<Arc<dyn ResourceDefinition>>, ResolverError> {
    let in_set: HashSet<String> = resources.iter().map(|d| d.fhir_name().to_string()).collect();
    let mut sorted_names: HashSet<String> = HashSet::with_capacity(resources.len());
    let mut sorted = Vec::with_capacity(resources.len());
    let mut unsorted = resources;

    while !unsorted.is_empty() {
        let before = unsorted.len();
        let mut remaining = Vec::with_capacity(before);

        for def in unsorted {
            let ready = def.referenced_resources().iter().all(|dep| {
                dep == def.fhir_name() || !in_set.contains(dep) || sorted_names.contains(dep)
            });
            if ready {
                sorted_names.insert(def.fhir_name().to_string());
                sorted.push(def);
            } else {
                remaining.push(def);
            }
        }

        if remaining.len() == before {
            return Err(ResolverError::Cycle(
                remaining.iter().map(|d| d.fhir_name().to_string()).collect(),
            ));
        }
        unsorted = remaining;
    }

    Ok(sorted)
}

/// Runs resolver passes. Holds only the state of the current pass.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    state: Mutex<ResolverState>,
}

struct IdleOnDrop<'a>(&'a DependencyResolver);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set_state(ResolverState::Idle);
    }
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ResolverState {
        self.state.lock().map(|s| *s).unwrap_or_default()
    }

    fn set_state(&self, state: ResolverState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    /// Sort, then resolve every resource in one transaction.
    pub async fn run(&self, ctx: &FhirContext) -> Result<ResolverPass, ResolverError> {
        let _idle = IdleOnDrop(self);
        self.set_state(ResolverState::Sorting);

        let order = sort_by_dependency(ctx.catalog.resources_that_can_do(Capability::Materialise))
            .inspect_err(|e| error!(error = %e, "resolver cannot order resources"))?;

        let mut pass = ResolverPass {
            order: order.iter().map(|d| d.fhir_name().to_string()).collect(),
            resolved: Vec::with_capacity(order.len()),
            deferred: Vec::new(),
        };
        info!(order = ?pass.order, "resolver pass starting");

        let mut tx = ctx.resources.begin().await?;
        for (i, def) in order.iter().enumerate() {
            if !def.can_do(Capability::Resolve) {
                continue;
            }
            self.set_state(ResolverState::Resolving(i));

            match def.resolve_upstreams(tx.as_mut(), ctx).await {
                Ok(summary) => {
                    let name = def.fhir_name().to_string();
                    pass.deferred
                        .extend(summary.deferred.into_iter().map(|id| (name.clone(), id)));
                    pass.resolved.push((name, summary.rows));
                }
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        error!(error = %rollback, "failed to roll back resolver pass");
                    }
                    return Err(e.into());
                }
            }
        }
        tx.commit().await?;

        info!(
            resources = pass.resolved.len(),
            rows = pass.resolved.iter().map(|(_, n)| n).sum::<usize>(),
            deferred = pass.deferred.len(),
            "resolver pass committed"
        );
        Ok(pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FhirSettings;
    use crate::resources::{
        DeclaredResource, InMemoryFhirStore, MaterialiseScope, ResolveSummary, ResourceCatalog,
        ResourceTx, UpstreamModel, UpstreamRow,
    };
    use serde_json::{Value as JsonValue, json};

    fn def(name: &str, deps: &[&str]) -> Arc<dyn ResourceDefinition> {
        let mut builder = DeclaredResource::builder(name).upstream(name.to_lowercase());
        for (i, dep) in deps.iter().enumerate() {
            builder = builder.reference(format!("ref{i}"), format!("ref{i}_id"), *dep);
        }
        Arc::new(builder.build())
    }

    fn names(defs: &[Arc<dyn ResourceDefinition>]) -> Vec<&str> {
        defs.iter().map(|d| d.fhir_name()).collect()
    }

    #[test]
    fn dependencies_come_first() {
        let sorted =
            sort_by_dependency(vec![def("A", &["B"]), def("B", &["C"]), def("C", &[])]).unwrap();
        assert_eq!(names(&sorted), ["C", "B", "A"]);
    }

    #[test]
    fn independent_resources_keep_catalogue_order() {
        let sorted =
            sort_by_dependency(vec![def("Z", &[]), def("Y", &["Z"]), def("X", &[])]).unwrap();
        assert_eq!(names(&sorted), ["Z", "Y", "X"]);
    }

    #[test]
    fn outside_and_self_references_are_satisfied() {
        let sorted =
            sort_by_dependency(vec![def("Patient", &["Patient", "Organization"])]).unwrap();
        assert_eq!(names(&sorted), ["Patient"]);
    }

    #[test]
    fn cycles_name_every_stuck_resource() {
        let err = sort_by_dependency(vec![
            def("Root", &[]),
            def("X", &["Y"]),
            def("Y", &["X"]),
            def("Leaf", &["X"]),
        ])
        .err()
        .unwrap();

        match err {
            ResolverError::Cycle(stuck) => assert_eq!(stuck, ["X", "Y", "Leaf"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn cycle_error_message_lists_resources() {
        let err = sort_by_dependency(vec![def("X", &["Y"]), def("Y", &["X"])]).err().unwrap();
        assert_eq!(err.to_string(), "dependency cycle between resources: X, Y");
    }

    /// Records the resolver state whenever the pass calls into it.
    struct Watched {
        name: String,
        upstreams: Vec<UpstreamModel>,
        references: Vec<String>,
        resolver: Arc<DependencyResolver>,
        fail_resolve: bool,
        sorting: Mutex<Vec<ResolverState>>,
        resolving: Mutex<Vec<ResolverState>>,
    }

    impl Watched {
        fn new(name: &str, references: &[&str], resolver: &Arc<DependencyResolver>) -> Self {
            Self {
                name: name.to_string(),
                upstreams: vec![UpstreamModel::new(name.to_lowercase())],
                references: references.iter().map(|r| r.to_string()).collect(),
                resolver: resolver.clone(),
                fail_resolve: false,
                sorting: Mutex::new(Vec::new()),
                resolving: Mutex::new(Vec::new()),
            }
        }

        fn failing(mut self) -> Self {
            self.fail_resolve = true;
            self
        }

        fn sorting(&self) -> Vec<ResolverState> {
            self.sorting.lock().unwrap().clone()
        }

        fn resolving(&self) -> Vec<ResolverState> {
            self.resolving.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ResourceDefinition for Watched {
        fn fhir_name(&self) -> &str {
            &self.name
        }

        fn resource_table(&self) -> &str {
            &self.name
        }

        fn upstream_models(&self) -> &[UpstreamModel] {
            &self.upstreams
        }

        fn referenced_resources(&self) -> &[String] {
            self.sorting.lock().unwrap().push(self.resolver.state());
            &self.references
        }

        async fn transform(
            &self,
            _upstream: &UpstreamRow,
            _scope: &mut MaterialiseScope<'_>,
        ) -> Result<JsonValue, MaterialiseError> {
            Ok(json!({}))
        }

        async fn resolve_upstreams(
            &self,
            _tx: &mut dyn ResourceTx,
            _ctx: &FhirContext,
        ) -> Result<ResolveSummary, MaterialiseError> {
            self.resolving.lock().unwrap().push(self.resolver.state());
            if self.fail_resolve {
                return Err(StoreError::Storage("connection reset".into()).into());
            }
            Ok(ResolveSummary::default())
        }
    }

    fn context(defs: &[&Arc<Watched>]) -> FhirContext {
        let defs = defs
            .iter()
            .map(|d| Arc::clone(d) as Arc<dyn ResourceDefinition>)
            .collect();
        let catalog = ResourceCatalog::new(defs).unwrap();
        FhirContext::in_memory(catalog, &InMemoryFhirStore::new(), FhirSettings::default())
    }

    #[tokio::test]
    async fn state_tracks_the_pass_and_returns_to_idle() {
        let resolver = Arc::new(DependencyResolver::new());
        let leaf = Arc::new(Watched::new("Leaf", &["Root"], &resolver));
        let root = Arc::new(Watched::new("Root", &[], &resolver));
        let ctx = context(&[&leaf, &root]);
        assert_eq!(resolver.state(), ResolverState::Idle);

        let pass = resolver.run(&ctx).await.unwrap();

        assert_eq!(pass.order, ["Root", "Leaf"]);
        assert!(leaf.sorting().contains(&ResolverState::Sorting));
        assert!(root.sorting().contains(&ResolverState::Sorting));
        assert_eq!(root.resolving(), [ResolverState::Resolving(0)]);
        assert_eq!(leaf.resolving(), [ResolverState::Resolving(1)]);
        assert_eq!(resolver.state(), ResolverState::Idle);
    }

    #[tokio::test]
    async fn cycle_leaves_the_resolver_idle() {
        let resolver = Arc::new(DependencyResolver::new());
        let x = Arc::new(Watched::new("X", &["Y"], &resolver));
        let y = Arc::new(Watched::new("Y", &["X"], &resolver));
        let ctx = context(&[&x, &y]);

        let err = resolver.run(&ctx).await.err().unwrap();

        assert!(matches!(err, ResolverError::Cycle(_)));
        assert!(x.sorting().contains(&ResolverState::Sorting));
        assert!(x.resolving().is_empty());
        assert_eq!(resolver.state(), ResolverState::Idle);
    }

    #[tokio::test]
    async fn store_error_rolls_back_and_leaves_the_resolver_idle() {
        let resolver = Arc::new(DependencyResolver::new());
        let root = Arc::new(Watched::new("Root", &[], &resolver).failing());
        let leaf = Arc::new(Watched::new("Leaf", &["Root"], &resolver));
        let ctx = context(&[&root, &leaf]);

        let err = resolver.run(&ctx).await.err().unwrap();

        assert!(matches!(err, ResolverError::Materialise(MaterialiseError::Store(_))));
        assert_eq!(root.resolving(), [ResolverState::Resolving(0)]);
        assert!(leaf.resolving().is_empty());
        assert_eq!(resolver.state(), ResolverState::Idle);
    }
}
