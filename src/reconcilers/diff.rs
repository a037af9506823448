//! Desired versus existing BackendRecords

use std::collections::{BTreeMap, HashMap, HashSet};

use kube::ResourceExt;

use crate::crd::{BackendRecord, BackendSource};

/// Changes needed to turn the existing records into the desired ones
#[derive(Debug, Default)]
pub struct BackendDiff {
    /// Desired records that do not exist yet
    pub add: Vec<BackendRecord>,
    /// Existing records carrying the desired spec
    pub update: Vec<BackendRecord>,
    /// Existing records no longer desired
    pub delete: Vec<BackendRecord>,
}

impl BackendDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Fields that identify which backend on which load balancer a record is about
#[derive(PartialEq, Eq, Hash)]
struct RecordIdentity<'a> {
    lb_name: &'a str,
    lb_driver: &'a str,
    lb_info: &'a BTreeMap<String, String>,
    backend: &'a BackendSource,
}

impl<'a> RecordIdentity<'a> {
    fn of(record: &'a BackendRecord) -> Self {
        Self {
            lb_name: &record.spec.lb_name,
            lb_driver: &record.spec.lb_driver,
            lb_info: &record.spec.lb_info,
            backend: &record.spec.backend,
        }
    }
}

/// Whether two records with the same identity need an update
fn mutable_fields_differ(a: &BackendRecord, b: &BackendRecord) -> bool {
    a.spec.lb_attributes != b.spec.lb_attributes
        || a.spec.parameters != b.spec.parameters
        || a.spec.ensure_policy != b.spec.ensure_policy
        || a.spec.deregister_policy != b.spec.deregister_policy
        || a.spec.deregister_webhook != b.spec.deregister_webhook
}

/// Classify records into add, update and delete.
///
/// Records are matched by identity. A matched pair whose mutable fields
/// differ becomes an update carrying the existing metadata and the desired
/// spec. Unmatched existing records are deleted unless their name is in
/// `protected`.
pub fn compare_backend_records(
    expect: Vec<BackendRecord>,
    have: &[BackendRecord],
    protected: &HashSet<String>,
) -> BackendDiff {
    let mut index: HashMap<RecordIdentity<'_>, usize> = HashMap::with_capacity(have.len());
    for (i, record) in have.iter().enumerate() {
        index.entry(RecordIdentity::of(record)).or_insert(i);
    }

    let mut matched = vec![false; have.len()];
    let mut diff = BackendDiff::default();
    for desired in expect {
        match index.get(&RecordIdentity::of(&desired)).copied() {
            Some(i) if !matched[i] => {
                matched[i] = true;
                let existing = &have[i];
                if mutable_fields_differ(existing, &desired) {
                    let mut updated = existing.clone();
                    updated.spec = desired.spec;
                    diff.update.push(updated);
                }
            }
            _ => diff.add.push(desired),
        }
    }

    diff.delete = have
        .iter()
        .zip(matched)
        .filter(|(record, matched)| !matched && !protected.contains(&record.name_any()))
        .map(|(record, _)| record.clone())
        .collect();
    diff
}
