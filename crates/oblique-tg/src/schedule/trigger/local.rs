use super::{
    FunctionRef, Invocation, PermissionGrant, PutRule, PutTargetsOutput, RuleArn, RuleState,
    ScheduleExpression, Target, TriggerError, TriggerFacility, INVOKE_ACTION,
};
use crate::prelude::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// In-process trigger facility. Every enabled rule has a ticker task that
/// fires once per period. Invocations are delivered to the returned channel
/// only for the targets that have a permission grant scoped to the rule.
pub(crate) struct LocalTriggerFacility {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    invocations: mpsc::UnboundedSender<Invocation>,
}

struct State {
    functions: Vec<FunctionRef>,
    rules: HashMap<String, Rule>,
    grants: Vec<PermissionGrant>,
}

struct Rule {
    arn: RuleArn,
    targets: Vec<Target>,
    ticker: Option<JoinHandle<()>>,
}

impl Drop for Rule {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

impl LocalTriggerFacility {
    pub(crate) fn new(
        functions: impl IntoIterator<Item = FunctionRef>,
    ) -> (Self, mpsc::UnboundedReceiver<Invocation>) {
        let (invocations, receiver) = mpsc::unbounded_channel();

        let state = State {
            functions: functions.into_iter().collect(),
            rules: HashMap::new(),
            grants: vec![],
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            invocations,
        });

        (Self { shared }, receiver)
    }
}

#[async_trait]
impl TriggerFacility for LocalTriggerFacility {
    async fn put_rule(&self, rule: PutRule) -> Result<RuleArn, TriggerError> {
        let expression: ScheduleExpression = rule.schedule_expression.parse()?;

        let ticker = match rule.state {
            RuleState::Enabled => Some(spawn_ticker(
                Arc::downgrade(&self.shared),
                rule.name.clone(),
                expression.period(),
            )),
            RuleState::Disabled => None,
        };

        let mut state = self.shared.state.lock();

        let entry = state.rules.entry(rule.name).or_insert_with_key(|name| Rule {
            arn: RuleArn(format!("local:rule/{name}")),
            targets: vec![],
            ticker: None,
        });

        if let Some(old_ticker) = std::mem::replace(&mut entry.ticker, ticker) {
            old_ticker.abort();
        }

        debug!(rule = %entry.arn, %expression, state = ?rule.state, "Put rule");

        Ok(entry.arn.clone())
    }

    async fn put_targets(
        &self,
        rule_name: &str,
        targets: Vec<Target>,
    ) -> Result<PutTargetsOutput, TriggerError> {
        let mut state = self.shared.state.lock();
        let state = &mut *state;

        let rule = state
            .rules
            .get_mut(rule_name)
            .ok_or_else(|| TriggerError::RuleNotFound {
                rule: rule_name.to_owned(),
            })?;

        let mut failed_entry_count = 0;

        for target in targets {
            if !state.functions.iter().any(|func| func.arn == target.arn) {
                warn!(
                    target_id = %target.id,
                    target_arn = %target.arn,
                    "Target references an unknown function"
                );
                failed_entry_count += 1;
                continue;
            }
            rule.targets.retain(|existing| existing.id != target.id);
            rule.targets.push(target);
        }

        Ok(PutTargetsOutput { failed_entry_count })
    }

    async fn add_permission(&self, grant: PermissionGrant) -> Result<(), TriggerError> {
        let mut state = self.shared.state.lock();

        if !state.functions.iter().any(|func| func.name == grant.function) {
            return Err(TriggerError::UnknownFunction {
                function: grant.function,
            });
        }

        let exists = state.grants.iter().any(|existing| {
            existing.function == grant.function && existing.statement_id == grant.statement_id
        });

        if exists {
            return Err(TriggerError::ResourceConflict {
                function: grant.function,
                statement_id: grant.statement_id,
            });
        }

        state.grants.push(grant);

        Ok(())
    }
}

impl Shared {
    /// Returns `false` if nobody listens to the invocations anymore
    fn fire(&self, rule_name: &str) -> bool {
        let invocations = self.state.lock().invocations(rule_name);

        invocations
            .into_iter()
            .all(|invocation| self.invocations.send(invocation).is_ok())
    }
}

impl State {
    fn invocations(&self, rule_name: &str) -> Vec<Invocation> {
        let Some(rule) = self.rules.get(rule_name) else {
            return vec![];
        };

        rule.targets
            .iter()
            .filter_map(|target| {
                let func = self.functions.iter().find(|func| func.arn == target.arn)?;

                let permitted = self.grants.iter().any(|grant| {
                    grant.function == func.name
                        && grant.action == INVOKE_ACTION
                        && grant.source_arn == rule.arn
                });

                if !permitted {
                    warn!(
                        rule = %rule.arn,
                        function = func.name,
                        "The rule has no permission to invoke the function"
                    );
                    return None;
                }

                Some(Invocation {
                    function: func.name.to_owned(),
                    target_id: target.id.clone(),
                    source_rule: rule.arn.clone(),
                })
            })
            .collect()
    }
}

fn spawn_ticker(shared: Weak<Shared>, rule_name: String, period: Duration) -> JoinHandle<()> {
    let span = debug_span!("rule_ticker", rule = %rule_name);
    let ticker = async move {
        loop {
            tokio::time::sleep(period).await;

            let Some(shared) = shared.upgrade() else {
                return;
            };

            debug!("Rule fired");

            if !shared.fire(&rule_name) {
                return;
            }
        }
    };
    tokio::spawn(ticker.instrument(span))
}
