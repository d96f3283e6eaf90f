//! In-memory doubles of the collaborators of the control loop and the
//! inbound message handler

use crate::oblique::ContentSource;
use crate::prelude::*;
use crate::recipient::{Recipient, RecipientId, RecipientStore};
use crate::schedule::trigger::{
    PermissionGrant, PutRule, PutTargetsOutput, RuleArn, Target, TriggerError, TriggerFacility,
};
use crate::schedule::Clock;
use crate::tg::Notifier;
use crate::Result;
use async_trait::async_trait;
use chrono::prelude::*;
use parking_lot::Mutex;
use std::collections::HashSet;

/// Keeps the records in the insertion order
#[derive(Default)]
pub(crate) struct MemoryRecipientStore {
    records: Mutex<Vec<Recipient>>,
    failing_updates: Mutex<HashSet<RecipientId>>,
    failing_reads: Mutex<bool>,
}

impl MemoryRecipientStore {
    pub(crate) fn with_records(records: &[(&str, i64)]) -> Self {
        let records = records
            .iter()
            .map(|&(id, last_notified_at)| Recipient {
                id: id.into(),
                last_notified_at,
            })
            .collect();

        Self {
            records: Mutex::new(records),
            ..Default::default()
        }
    }

    pub(crate) fn timestamps(&self) -> Vec<(RecipientId, i64)> {
        self.records
            .lock()
            .iter()
            .map(|record| (record.id.clone(), record.last_notified_at))
            .collect()
    }

    pub(crate) fn fail_updates_for(&self, id: &str) {
        self.failing_updates.lock().insert(id.into());
    }

    pub(crate) fn fail_reads(&self) {
        *self.failing_reads.lock() = true;
    }
}

#[async_trait]
impl RecipientStore for MemoryRecipientStore {
    async fn get_all(&self) -> Result<Vec<Recipient>> {
        if *self.failing_reads.lock() {
            return Err(fatal!("Store is unavailable"));
        }
        Ok(self.records.lock().clone())
    }

    async fn upsert_new(&self, id: &RecipientId) -> Result {
        let mut records = self.records.lock();
        if records.iter().all(|record| record.id != *id) {
            records.push(Recipient {
                id: id.clone(),
                last_notified_at: 0,
            });
        }
        Ok(())
    }

    async fn update_last_notified(&self, id: &RecipientId, timestamp: i64) -> Result {
        if self.failing_updates.lock().contains(id) {
            return Err(fatal!("Can't update the recipient {id}"));
        }

        let mut records = self.records.lock();
        if let Some(record) = records.iter_mut().find(|record| record.id == *id) {
            record.last_notified_at = timestamp;
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<(RecipientId, String)>>,
    failing: Mutex<HashSet<RecipientId>>,
}

impl RecordingNotifier {
    pub(crate) fn sent(&self) -> Vec<(RecipientId, String)> {
        self.sent.lock().clone()
    }

    pub(crate) fn fail_for(&self, id: &str) {
        self.failing.lock().insert(id.into());
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str, recipient: &RecipientId) -> Result {
        if self.failing.lock().contains(recipient) {
            return Err(fatal!("Recipient {recipient} is unreachable"));
        }
        self.sent.lock().push((recipient.clone(), text.to_owned()));
        Ok(())
    }
}

pub(crate) struct FixedContent(pub(crate) &'static str);

impl ContentSource for FixedContent {
    fn random(&self) -> String {
        self.0.to_owned()
    }
}

pub(crate) struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub(crate) fn at(timestamp: i64) -> Self {
        let now = Utc.timestamp_opt(timestamp, 0).unwrap();
        Self(Mutex::new(now))
    }

    pub(crate) fn advance(&self, secs: i64) {
        *self.0.lock() += chrono::Duration::seconds(secs);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TriggerCall {
    PutRule(PutRule),
    PutTargets {
        rule_name: String,
        targets: Vec<Target>,
    },
    AddPermission(PermissionGrant),
}

#[derive(Debug, Default)]
pub(crate) struct FakeTriggerBehavior {
    pub(crate) fail_put_rule: bool,
    pub(crate) failed_target_entries: usize,
    pub(crate) fail_add_permission: bool,
}

/// Records the calls and keeps the permission grants to report conflicts
/// on repeated statements
#[derive(Default)]
pub(crate) struct FakeTrigger {
    behavior: FakeTriggerBehavior,
    calls: Mutex<Vec<TriggerCall>>,
    grants: Mutex<Vec<PermissionGrant>>,
}

impl FakeTrigger {
    pub(crate) fn new(behavior: FakeTriggerBehavior) -> Self {
        Self {
            behavior,
            ..Default::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<TriggerCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn grants(&self) -> Vec<PermissionGrant> {
        self.grants.lock().clone()
    }
}

#[async_trait]
impl TriggerFacility for FakeTrigger {
    async fn put_rule(&self, rule: PutRule) -> Result<RuleArn, TriggerError> {
        let name = rule.name.clone();
        self.calls.lock().push(TriggerCall::PutRule(rule));

        if self.behavior.fail_put_rule {
            return Err(TriggerError::RuleNotFound { rule: name });
        }

        Ok(RuleArn(format!("fake:rule/{name}")))
    }

    async fn put_targets(
        &self,
        rule_name: &str,
        targets: Vec<Target>,
    ) -> Result<PutTargetsOutput, TriggerError> {
        self.calls.lock().push(TriggerCall::PutTargets {
            rule_name: rule_name.to_owned(),
            targets,
        });

        Ok(PutTargetsOutput {
            failed_entry_count: self.behavior.failed_target_entries,
        })
    }

    async fn add_permission(&self, grant: PermissionGrant) -> Result<(), TriggerError> {
        self.calls.lock().push(TriggerCall::AddPermission(grant.clone()));

        if self.behavior.fail_add_permission {
            return Err(TriggerError::UnknownFunction {
                function: grant.function,
            });
        }

        let mut grants = self.grants.lock();

        let conflict = grants.iter().any(|existing| {
            existing.function == grant.function && existing.statement_id == grant.statement_id
        });

        if conflict {
            debug!(statement_id = %grant.statement_id, "Rejecting a repeated grant");
            return Err(TriggerError::ResourceConflict {
                function: grant.function,
                statement_id: grant.statement_id,
            });
        }

        grants.push(grant);
        Ok(())
    }
}
