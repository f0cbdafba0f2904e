//! Partition key range resolution.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ErrorCode, QueryError, QueryResult};
use crate::executor::RequestPipeline;
use crate::models::{
    overlapping_ranges, sort_ranges, CollectionLink, PartitionKey, PartitionKeyRange, QueryRange,
};

/// The part of the key space a read targets.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingScope {
    /// Every range of the collection.
    All,
    /// Ranges overlapping any of these intervals.
    QueryRanges(Vec<QueryRange>),
    /// The range owning this partition key.
    PartitionKey(PartitionKey),
    /// The range with this id.
    RangeId(String),
}

impl RoutingScope {
    fn query_ranges(&self) -> Vec<QueryRange> {
        match self {
            RoutingScope::All | RoutingScope::RangeId(_) => Vec::new(),
            RoutingScope::QueryRanges(ranges) => ranges.clone(),
            RoutingScope::PartitionKey(pk) => vec![QueryRange::point(pk.effective_partition_key())],
        }
    }

    /// Returns whether a range lies inside this scope. A range id scope also
    /// covers the ranges split from it.
    pub fn covers(&self, range: &PartitionKeyRange) -> bool {
        match self {
            RoutingScope::RangeId(id) => &range.id == id || range.parents.contains(id),
            scope => !overlapping_ranges(std::slice::from_ref(range), &scope.query_ranges()).is_empty(),
        }
    }
}

/// Resolves the partition key ranges a read must visit.
///
/// Topology is fetched once per collection and cached until a split forces a refresh.
#[derive(Default)]
pub struct PartitionKeyRangeResolver {
    cache: DashMap<CollectionLink, Arc<Vec<PartitionKeyRange>>>,
}

impl PartitionKeyRangeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached topology of a collection, if any.
    pub fn cached_ranges(&self, collection: &CollectionLink) -> Option<Arc<Vec<PartitionKeyRange>>> {
        self.cache.get(collection).map(|entry| entry.value().clone())
    }

    /// Drops the cached topology of a collection.
    pub fn invalidate(&self, collection: &CollectionLink) {
        self.cache.remove(collection);
    }

    /// Returns the collection's ranges, sorted by lower bound, fetching them on first use.
    pub(crate) async fn topology(
        &self,
        pipeline: &RequestPipeline,
        collection: &CollectionLink,
    ) -> QueryResult<Arc<Vec<PartitionKeyRange>>> {
        if let Some(ranges) = self.cached_ranges(collection) {
            return Ok(ranges);
        }
        self.refresh(pipeline, collection).await
    }

    /// Re-reads the collection's ranges and replaces the cached copy.
    pub(crate) async fn refresh(
        &self,
        pipeline: &RequestPipeline,
        collection: &CollectionLink,
    ) -> QueryResult<Arc<Vec<PartitionKeyRange>>> {
        let mut ranges = pipeline.partition_key_ranges(collection).await?;
        sort_ranges(&mut ranges);
        debug!(%collection, count = ranges.len(), "resolved partition key ranges");
        let ranges = Arc::new(ranges);
        self.cache.insert(collection.clone(), ranges.clone());
        Ok(ranges)
    }

    /// Returns the ordered ranges covered by `scope`.
    pub(crate) async fn resolve(
        &self,
        pipeline: &RequestPipeline,
        collection: &CollectionLink,
        scope: &RoutingScope,
    ) -> QueryResult<Vec<PartitionKeyRange>> {
        let topology = self.topology(pipeline, collection).await?;

        if let RoutingScope::RangeId(id) = scope {
            if let Some(range) = topology.iter().find(|r| &r.id == id) {
                return Ok(vec![range.clone()]);
            }
            // The caller may know about a range newer than our cached view.
            let topology = self.refresh(pipeline, collection).await?;
            return topology
                .iter()
                .find(|r| &r.id == id)
                .map(|range| vec![range.clone()])
                .ok_or_else(|| {
                    QueryError::with_message(
                        ErrorCode::PartitionKeyRangeNotFound,
                        format!("partition key range '{}' does not exist in {}", id, collection),
                    )
                });
        }

        Ok(overlapping_ranges(&topology, &scope.query_ranges()))
    }

    /// Returns the ranges that replaced `gone` after a split, restricted to `scope`.
    pub(crate) async fn successors(
        &self,
        pipeline: &RequestPipeline,
        collection: &CollectionLink,
        gone: &PartitionKeyRange,
        scope: &RoutingScope,
    ) -> QueryResult<Vec<PartitionKeyRange>> {
        let topology = self.refresh(pipeline, collection).await?;

        if topology.iter().any(|r| r.id == gone.id) {
            return Err(QueryError::with_message(
                ErrorCode::PartitionKeyRangeGone,
                format!("range '{}' reported gone but is still listed", gone.id),
            ));
        }

        let children: Vec<PartitionKeyRange> = topology
            .iter()
            .filter(|r| r.intersects(gone))
            .cloned()
            .collect();
        let children = overlapping_ranges(&children, &scope.query_ranges());

        if children.is_empty() {
            return Err(QueryError::with_message(
                ErrorCode::PartitionKeyRangeNotFound,
                format!("no successors found for gone range '{}'", gone.id),
            ));
        }

        info!(
            %collection,
            gone = %gone.id,
            successors = ?children.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            "partition key range split"
        );
        Ok(children)
    }
}
