//! Storage-side execution of a query over the shards of one leaf.
//!
//! Filtering runs per shard, grouping per matching family and scanning per
//! batch of series of one group. Each scanner task loads its series from
//! every result set of the family (file data first, then memory), merges
//! them slot by slot and folds the slots into down-sampling windows.

use super::flow::StorageQueryFlow;
use crate::filter::{FilterContext, FilterResultSet, SeriesData};
use crate::index::MetadataIndex;
use crate::tsdb::{Database, Shard};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Series per scanner task.
const SCAN_BATCH_SIZE: usize = 256;

type ResultSets = Arc<Vec<Box<dyn FilterResultSet>>>;

pub struct StorageExecutor {
    database: Arc<Database>,
    shard_ids: Vec<u32>,
    flow: Arc<StorageQueryFlow>,
}

impl StorageExecutor {
    pub fn new(database: Arc<Database>, shard_ids: Vec<u32>, flow: Arc<StorageQueryFlow>) -> Self {
        Self {
            database,
            shard_ids,
            flow,
        }
    }

    /// Resolves the query's series and starts one filtering task per shard.
    /// The outcome is delivered through the flow's callback.
    pub fn execute(&self) {
        let flow = &self.flow;
        flow.dispatch(|| {
            let query = flow.query();
            let index = Arc::clone(self.database.index());
            let metric_id = match index.get_metric_id(&query.metric) {
                Ok(id) => id,
                Err(e) => {
                    flow.complete(Some(e));
                    return;
                }
            };
            let series_ids = index.find_series_ids(metric_id, |tags| query.matches(tags));
            if series_ids.is_empty() {
                debug!(flow = %flow.id(), metric = %query.metric, "No series matched");
                return;
            }

            let mut fields: Vec<String> = query.fields.iter().map(|f| f.name.clone()).collect();
            fields.sort();
            fields.dedup();
            let ctx = Arc::new(FilterContext::new(
                metric_id,
                series_ids,
                fields,
                flow.down_sampling().time_range,
            ));

            for shard_id in &self.shard_ids {
                let shard = match self.database.get_shard(*shard_id) {
                    Ok(shard) => shard,
                    Err(e) => {
                        flow.complete(Some(e));
                        return;
                    }
                };
                let task_flow = Arc::clone(flow);
                let ctx = Arc::clone(&ctx);
                let index = Arc::clone(&index);
                flow.filtering(move || filter_shard(&task_flow, &shard, &ctx, &index));
            }
        });
    }
}

fn filter_shard(
    flow: &Arc<StorageQueryFlow>,
    shard: &Shard,
    ctx: &Arc<FilterContext>,
    index: &Arc<MetadataIndex>,
) {
    let families = match shard.get_data_families(&ctx.time_range) {
        Ok(families) => families,
        Err(e) => {
            flow.complete(Some(e));
            return;
        }
    };
    for family in families {
        let result_sets = match family.filter(ctx) {
            Ok(r) if r.is_empty() => continue,
            Ok(r) => Arc::new(r),
            Err(e) => {
                flow.complete(Some(e));
                return;
            }
        };
        let task_flow = Arc::clone(flow);
        let ctx = Arc::clone(ctx);
        let index = Arc::clone(index);
        flow.grouping(move || group_series(&task_flow, result_sets, &ctx, &index));
    }
}

fn group_series(
    flow: &Arc<StorageQueryFlow>,
    result_sets: ResultSets,
    ctx: &FilterContext,
    index: &MetadataIndex,
) {
    let series_ids: BTreeSet<u32> = result_sets
        .iter()
        .flat_map(|rs| rs.series_ids().iter().copied())
        .collect();

    let mut groups: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for series_id in series_ids {
        let tags = index.series_tags(ctx.metric_id, series_id).unwrap_or_default();
        groups
            .entry(flow.query().group_key(&tags))
            .or_default()
            .push(series_id);
    }

    for (group, ids) in groups {
        for batch in ids.chunks(SCAN_BATCH_SIZE) {
            let task_flow = Arc::clone(flow);
            let result_sets = Arc::clone(&result_sets);
            let group = group.clone();
            let batch = batch.to_vec();
            let fields = ctx.fields.clone();
            flow.scanner(move || scan(&task_flow, &result_sets, &group, &batch, &fields));
        }
    }
}

fn scan(
    flow: &StorageQueryFlow,
    result_sets: &[Box<dyn FilterResultSet>],
    group: &str,
    series_ids: &[u32],
    fields: &[String],
) {
    let mut merged: BTreeMap<u32, SeriesData> = BTreeMap::new();
    for rs in result_sets {
        let loaded = match rs.load(series_ids) {
            Ok(loaded) => loaded,
            Err(e) => {
                flow.complete(Some(e));
                return;
            }
        };
        for data in loaded {
            match merged.entry(data.series_id) {
                Entry::Occupied(mut e) => e.get_mut().block.merge_newer(&data.block),
                Entry::Vacant(e) => {
                    e.insert(data);
                }
            }
        }
    }

    let ds = flow.down_sampling();
    for field in fields {
        let mut aggregator = flow.get_aggregator();
        for data in merged.values() {
            if let Some(block) = data.block.fields.get(field) {
                aggregator.aggregate(ds, data.family_time, data.interval, block);
            }
        }
        if !aggregator.is_empty() {
            flow.reduce(group, field, &aggregator);
        }
        flow.release_aggregator(aggregator);
    }
}
