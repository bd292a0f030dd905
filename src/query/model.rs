//! Query, partial result and result set types exchanged by the task tree.

use crate::interval::{Interval, TimeRange};
use crate::tag::{self, Tag};
use crate::{LinDbError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregation applied to a field inside each down-sampling window and
/// across the series of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFunc {
    Sum,
    Min,
    Max,
    Count,
    Avg,
}

impl AggFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Sum => "sum",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Count => "count",
            AggFunc::Avg => "avg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub func: AggFunc,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, func: AggFunc) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

/// Tag condition; all conditions of a query must match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TagFilter {
    Equal { key: String, value: String },
    In { key: String, values: Vec<String> },
    Prefix { key: String, prefix: String },
}

impl TagFilter {
    pub fn matches(&self, tags: &[Tag]) -> bool {
        let value_of = |key: &str| tags.iter().find(|t| t.key == key).map(|t| t.value.as_str());
        match self {
            TagFilter::Equal { key, value } => value_of(key) == Some(value.as_str()),
            TagFilter::In { key, values } => {
                value_of(key).is_some_and(|v| values.iter().any(|candidate| candidate == v))
            }
            TagFilter::Prefix { key, prefix } => {
                value_of(key).is_some_and(|v| v.starts_with(prefix.as_str()))
            }
        }
    }
}

/// A metric query executed by the storage nodes of a physical plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub metric: String,
    pub fields: Vec<FieldSpec>,
    pub condition: Vec<TagFilter>,
    pub group_by: Vec<String>,
    pub time_range: TimeRange,
    /// Requested window; the storage interval when absent.
    pub interval: Option<Interval>,
}

impl Query {
    pub fn new(metric: impl Into<String>, time_range: TimeRange) -> Self {
        Self {
            metric: metric.into(),
            fields: Vec::new(),
            condition: Vec::new(),
            group_by: Vec::new(),
            time_range,
            interval: None,
        }
    }

    pub fn field(mut self, name: impl Into<String>, func: AggFunc) -> Self {
        self.fields.push(FieldSpec::new(name, func));
        self
    }

    pub fn filter(mut self, filter: TagFilter) -> Self {
        self.condition.push(filter);
        self
    }

    pub fn group_by(mut self, key: impl Into<String>) -> Self {
        self.group_by.push(key.into());
        self
    }

    pub fn interval(mut self, interval: Interval) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn validate(&self) -> Result<()> {
        tag::validate_metric_name(&self.metric)?;
        self.time_range.validate()?;
        if self.fields.is_empty() {
            return Err(LinDbError::Query("query selects no field".to_string()));
        }
        for (i, spec) in self.fields.iter().enumerate() {
            if self.fields[..i].contains(spec) {
                return Err(LinDbError::Query(format!(
                    "field '{}' is selected twice with {}",
                    spec.name,
                    spec.func.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Name a selected field is reported under: the field name, or
    /// `func(name)` when the query aggregates that field more than once.
    pub fn output_name(&self, spec: &FieldSpec) -> String {
        if self.fields.iter().filter(|f| f.name == spec.name).count() > 1 {
            format!("{}({})", spec.func.as_str(), spec.name)
        } else {
            spec.name.clone()
        }
    }

    pub fn matches(&self, tags: &[Tag]) -> bool {
        self.condition.iter().all(|f| f.matches(tags))
    }

    /// The group a series belongs to, rendered as a series key.
    pub fn group_key(&self, tags: &[Tag]) -> String {
        if self.group_by.is_empty() {
            return String::new();
        }
        let grouped: Vec<Tag> = tags
            .iter()
            .filter(|t| self.group_by.contains(&t.key))
            .cloned()
            .collect();
        tag::series_key(&grouped)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| LinDbError::Query(format!("bad query payload: {e}")))
    }
}

/// Partial aggregate of one window. Merging is associative and commutative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggPoint {
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

impl Default for AggPoint {
    fn default() -> Self {
        Self {
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            count: 0,
        }
    }
}

impl AggPoint {
    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += 1;
    }

    pub fn merge(&mut self, other: &AggPoint) {
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
    }

    pub fn value(&self, func: AggFunc) -> f64 {
        match func {
            AggFunc::Sum => self.sum,
            AggFunc::Min => self.min,
            AggFunc::Max => self.max,
            AggFunc::Count => self.count as f64,
            AggFunc::Avg if self.count == 0 => 0.0,
            AggFunc::Avg => self.sum / self.count as f64,
        }
    }
}

/// Window start time to partial aggregate.
pub type FieldPoints = BTreeMap<i64, AggPoint>;

/// Group key to field name to points: what leaves and intermediates send up.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PartialResult {
    pub groups: BTreeMap<String, BTreeMap<String, FieldPoints>>,
}

impl PartialResult {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn merge_points(&mut self, group: &str, field: &str, points: &FieldPoints) {
        if points.is_empty() {
            return;
        }
        let target = self
            .groups
            .entry(group.to_string())
            .or_default()
            .entry(field.to_string())
            .or_default();
        for (time, point) in points {
            target.entry(*time).or_default().merge(point);
        }
    }

    pub fn merge(&mut self, other: &PartialResult) {
        for (group, fields) in &other.groups {
            for (field, points) in fields {
                self.merge_points(group, field, points);
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        Ok(bincode::deserialize(data)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesResult {
    /// Group-by tags; empty without grouping.
    pub tags: Vec<Tag>,
    pub fields: BTreeMap<String, Vec<(i64, f64)>>,
}

/// Final result of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub metric: String,
    pub time_range: TimeRange,
    pub interval: Option<Interval>,
    pub series: Vec<SeriesResult>,
}

impl ResultSet {
    /// Applies each field's function to the reduced partial aggregates.
    pub fn from_partial(query: &Query, partial: &PartialResult) -> Result<Self> {
        let mut series = Vec::with_capacity(partial.groups.len());
        for (group, fields) in &partial.groups {
            let mut values = BTreeMap::new();
            for spec in &query.fields {
                let Some(points) = fields.get(&spec.name) else {
                    continue;
                };
                values.insert(
                    query.output_name(spec),
                    points.iter().map(|(t, p)| (*t, p.value(spec.func))).collect(),
                );
            }
            series.push(SeriesResult {
                tags: tag::parse_series_key(group)?,
                fields: values,
            });
        }
        Ok(Self {
            metric: query.metric.clone(),
            time_range: query.time_range,
            interval: query.interval,
            series,
        })
    }
}
