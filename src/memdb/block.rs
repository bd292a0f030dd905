//! Encoded metric data: the value stored per metric id in a kv family.

use crate::kv::Merger;
use crate::{FieldType, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Slot values of one field of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldBlock {
    pub field_type: FieldType,
    pub slots: BTreeMap<u16, f64>,
}

impl FieldBlock {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            slots: BTreeMap::new(),
        }
    }

    /// Writes a value into a slot, merging with what is already there.
    /// Returns true when the slot is new.
    pub fn put(&mut self, slot: u16, value: f64) -> bool {
        match self.slots.get_mut(&slot) {
            Some(current) => {
                *current = self.field_type.merge(*current, value);
                false
            }
            None => {
                self.slots.insert(slot, value);
                true
            }
        }
    }

    /// Merges a newer block into this one.
    pub fn merge_newer(&mut self, newer: &FieldBlock) {
        for (slot, value) in &newer.slots {
            self.put(*slot, *value);
        }
    }
}

/// All fields of one series.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SeriesBlock {
    pub fields: BTreeMap<String, FieldBlock>,
}

impl SeriesBlock {
    /// Keeps the wanted fields and slots within `[low, high]`.
    pub fn select(&self, wants_field: impl Fn(&str) -> bool, low: u16, high: u16) -> SeriesBlock {
        let fields = self
            .fields
            .iter()
            .filter(|(name, _)| wants_field(name))
            .filter_map(|(name, field)| {
                let slots: BTreeMap<u16, f64> = field
                    .slots
                    .range(low..=high)
                    .map(|(s, v)| (*s, *v))
                    .collect();
                (!slots.is_empty()).then(|| {
                    (
                        name.clone(),
                        FieldBlock {
                            field_type: field.field_type,
                            slots,
                        },
                    )
                })
            })
            .collect();
        SeriesBlock { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn merge_newer(&mut self, newer: &SeriesBlock) {
        for (name, field) in &newer.fields {
            match self.fields.get_mut(name) {
                Some(current) => current.merge_newer(field),
                None => {
                    self.fields.insert(name.clone(), field.clone());
                }
            }
        }
    }
}

/// One metric of one family, as flushed to the kv store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricBlock {
    pub family_time: i64,
    pub series: BTreeMap<u32, SeriesBlock>,
}

impl MetricBlock {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn merge_newer(&mut self, newer: &MetricBlock) {
        for (series_id, block) in &newer.series {
            self.series.entry(*series_id).or_default().merge_newer(block);
        }
    }
}

/// Merges metric blocks of the same metric written by several flushes.
#[derive(Debug, Default)]
pub struct MetricBlockMerger;

impl Merger for MetricBlockMerger {
    fn merge(&self, _key: u32, values: &[&[u8]]) -> Result<Vec<u8>> {
        let mut merged: Option<MetricBlock> = None;
        for value in values {
            let block = MetricBlock::decode(value)?;
            match merged.as_mut() {
                Some(m) => m.merge_newer(&block),
                None => merged = Some(block),
            }
        }
        merged.unwrap_or_default().encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(field_type: FieldType, slots: &[(u16, f64)]) -> MetricBlock {
        let mut field = FieldBlock::new(field_type);
        for (s, v) in slots {
            field.put(*s, *v);
        }
        let mut series = SeriesBlock::default();
        series.fields.insert("f".to_string(), field);
        let mut metric = MetricBlock {
            family_time: 0,
            ..Default::default()
        };
        metric.series.insert(1, series);
        metric
    }

    #[test]
    fn merger_applies_field_type() {
        let older = block(FieldType::Sum, &[(1, 1.0), (2, 2.0)]).encode().unwrap();
        let newer = block(FieldType::Sum, &[(2, 3.0)]).encode().unwrap();
        let merged = MetricBlock::decode(
            &MetricBlockMerger
                .merge(1, &[older.as_slice(), newer.as_slice()])
                .unwrap(),
        )
        .unwrap();
        let slots = &merged.series[&1].fields["f"].slots;
        assert_eq!(slots[&1], 1.0);
        assert_eq!(slots[&2], 5.0);
    }

    #[test]
    fn last_keeps_newest_value() {
        let mut older = block(FieldType::Last, &[(4, 1.0)]);
        older.merge_newer(&block(FieldType::Last, &[(4, 9.0)]));
        assert_eq!(older.series[&1].fields["f"].slots[&4], 9.0);
    }

    #[test]
    fn select_clips_slots_and_fields() {
        let metric = block(FieldType::Max, &[(1, 1.0), (5, 5.0), (9, 9.0)]);
        let series = &metric.series[&1];
        let selected = series.select(|name| name == "f", 2, 9);
        assert_eq!(selected.fields["f"].slots.len(), 2);
        assert!(series.select(|name| name == "g", 0, 9).is_empty());
        assert!(series.select(|_| true, 6, 8).is_empty());
    }
}
