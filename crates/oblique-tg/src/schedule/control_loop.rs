use super::trigger::{
    PermissionGrant, PutRule, RuleState, ScheduleExpression, Target, TriggerError,
    TriggerFacility, INVOKE_ACTION, OBLIQUER, TRIGGER_PRINCIPAL,
};
use super::{Clock, Config, DelayPolicy};
use crate::oblique::ContentSource;
use crate::prelude::*;
use crate::recipient::{Recipient, RecipientId, RecipientStore};
use crate::tg::Notifier;
use crate::{Error, Result};
use std::sync::Arc;

const TARGET_ID: &str = "obliquerTriggerTarget";
const STATEMENT_ID: &str = "obliquerTriggerStatement";

pub(crate) struct ControlLoopDeps {
    pub(crate) store: Arc<dyn RecipientStore>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) content: Arc<dyn ContentSource>,
    pub(crate) trigger: Arc<dyn TriggerFacility>,
    pub(crate) clock: Arc<dyn Clock>,
}

/// Sends a message to every known recipient once per tick of the periodic
/// trigger, and registers the next tick after a random delay.
pub(crate) struct ControlLoop {
    deps: ControlLoopDeps,
    policy: DelayPolicy,
}

#[derive(Debug)]
pub(crate) enum RunOutcome {
    Sent {
        notified: usize,
        next_run_in_minutes: Option<u32>,
    },
    SkippedDuplicate {
        secs_since_last_run: i64,
    },
    PartialFailure {
        notified: usize,
        failures: Vec<RecipientFailure>,
        next_run_in_minutes: Option<u32>,
    },
}

#[derive(Debug)]
pub(crate) struct RecipientFailure {
    pub(crate) recipient: RecipientId,
    pub(crate) error: Error,
}

impl RunOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::SkippedDuplicate { .. } => "skipped_duplicate",
            Self::PartialFailure { .. } => "partial_failure",
        }
    }

    /// Reports the outcome of a single invocation of the loop
    pub(crate) fn log(&self) {
        match self {
            Self::Sent {
                notified,
                next_run_in_minutes,
            } => {
                info!(notified, ?next_run_in_minutes, "Notified all recipients");
            }
            Self::SkippedDuplicate {
                secs_since_last_run,
            } => {
                info!(secs_since_last_run, "Invocation was a duplicate, nothing was sent");
            }
            Self::PartialFailure {
                notified,
                failures,
                next_run_in_minutes,
            } => {
                for RecipientFailure { recipient, error } in failures {
                    warn!(
                        %recipient,
                        err = tracing_err(error),
                        "Recipient was not notified"
                    );
                }
                warn!(
                    notified,
                    failed = failures.len(),
                    ?next_run_in_minutes,
                    "Some recipients were not notified"
                );
            }
        }
    }
}

impl ControlLoop {
    pub(crate) fn new(deps: ControlLoopDeps, cfg: Config) -> Result<Self> {
        Ok(Self {
            deps,
            policy: DelayPolicy::new(cfg)?,
        })
    }

    #[instrument(skip(self))]
    pub(crate) async fn run_once(&self) -> Result<RunOutcome> {
        let result = self.try_run_once().await;

        let outcome = result.as_ref().map(RunOutcome::label).unwrap_or("error");
        metrics::counter!("oblique_runs_total", 1, "outcome" => outcome);

        result
    }

    async fn try_run_once(&self) -> Result<RunOutcome> {
        let recipients = self.deps.store.get_all().await?;

        let latest = recipients
            .iter()
            .map(|recipient| recipient.last_notified_at)
            .max()
            .unwrap_or(0);

        let secs_since_last_run = self.deps.clock.now().timestamp() - latest;

        if self.policy.is_duplicate(secs_since_last_run) {
            debug!(
                secs_since_last_run,
                "Skipping the run, because it duplicates a very recent one"
            );
            return Ok(RunOutcome::SkippedDuplicate {
                secs_since_last_run,
            });
        }

        let failures = self.fan_out(&recipients).await;
        let notified = recipients.len() - failures.len();

        let next_run_in_minutes = self.reschedule().await?;

        if failures.is_empty() {
            return Ok(RunOutcome::Sent {
                notified,
                next_run_in_minutes,
            });
        }

        Ok(RunOutcome::PartialFailure {
            notified,
            failures,
            next_run_in_minutes,
        })
    }

    /// A failure for one recipient doesn't stop the rest from being notified
    async fn fan_out(&self, recipients: &[Recipient]) -> Vec<RecipientFailure> {
        let mut failures = vec![];

        for recipient in recipients {
            let span = info_span!("notify", recipient = %recipient.id);
            let result = self.notify(&recipient.id).instrument(span).await;

            let label = if result.is_ok() { "ok" } else { "err" };
            metrics::counter!("oblique_notifications_total", 1, "result" => label);

            if let Err(error) = result {
                debug!(
                    err = tracing_err(&error),
                    "Failed to notify the recipient, continuing with the rest",
                );
                failures.push(RecipientFailure {
                    recipient: recipient.id.clone(),
                    error,
                });
            }
        }

        failures
    }

    async fn notify(&self, recipient: &RecipientId) -> Result {
        let text = self.deps.content.random();

        self.deps.notifier.send(&text, recipient).await?;

        let sent_at = self.deps.clock.now().timestamp();

        self.deps
            .store
            .update_last_notified(recipient, sent_at)
            .await
    }

    /// Registers the next run of the loop with the trigger facility.
    ///
    /// Returns `None` if the rule or its target couldn't be registered. These
    /// failures are only logged, so the loop may stop firing until somebody
    /// triggers it again. Permission grant errors other than "already exists"
    /// are propagated.
    pub(crate) async fn reschedule(&self) -> Result<Option<u32>> {
        let minutes = self
            .policy
            .next_delay_minutes(self.deps.clock.now(), &mut rand::thread_rng());

        let expression = ScheduleExpression::Rate { minutes };

        info!(%expression, "Scheduling the next run");

        let rule_name = OBLIQUER.rule_name();

        let put_rule = PutRule {
            name: rule_name.clone(),
            schedule_expression: expression.to_string(),
            state: RuleState::Enabled,
        };

        let rule_arn = match self.deps.trigger.put_rule(put_rule).await {
            Ok(rule_arn) => rule_arn,
            Err(err) => {
                error!(err = tracing_err(&err), "Failed to put rule for self-scheduling");
                return Ok(None);
            }
        };

        let target = Target {
            id: TARGET_ID.to_owned(),
            arn: OBLIQUER.arn.to_owned(),
        };

        match self.deps.trigger.put_targets(&rule_name, vec![target]).await {
            Ok(output) if output.failed_entry_count == 0 => {}
            Ok(output) => {
                error!(
                    failed_entry_count = output.failed_entry_count,
                    "Failed to add the rule target"
                );
                return Ok(None);
            }
            Err(err) => {
                error!(err = tracing_err(&err), "Failed to add the rule target");
                return Ok(None);
            }
        }

        let grant = PermissionGrant {
            function: OBLIQUER.name.to_owned(),
            statement_id: STATEMENT_ID.to_owned(),
            action: INVOKE_ACTION.to_owned(),
            principal: TRIGGER_PRINCIPAL.to_owned(),
            source_arn: rule_arn,
        };

        match self.deps.trigger.add_permission(grant).await {
            Ok(()) => {}
            // Consecutive runs grant the same permission over and over
            Err(TriggerError::ResourceConflict { .. }) => {
                debug!("Permission to invoke the loop already exists");
            }
            Err(err) => return Err(err.into()),
        }

        Ok(Some(minutes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FakeTrigger, FakeTriggerBehavior, FixedClock, FixedContent, MemoryRecipientStore,
        RecordingNotifier, TriggerCall,
    };
    use assert_matches::assert_matches;
    use expect_test::expect;

    fn id(id: &str) -> RecipientId {
        RecipientId::from(id)
    }

    struct Harness {
        store: Arc<MemoryRecipientStore>,
        notifier: Arc<RecordingNotifier>,
        trigger: Arc<FakeTrigger>,
        clock: Arc<FixedClock>,
        control_loop: ControlLoop,
    }

    fn harness(records: &[(&str, i64)], now: i64, behavior: FakeTriggerBehavior) -> Harness {
        let store = Arc::new(MemoryRecipientStore::with_records(records));
        let notifier = Arc::new(RecordingNotifier::default());
        let trigger = Arc::new(FakeTrigger::new(behavior));
        let clock = Arc::new(FixedClock::at(now));

        let deps = ControlLoopDeps {
            store: store.clone(),
            notifier: notifier.clone(),
            content: Arc::new(FixedContent("Use an old idea")),
            trigger: trigger.clone(),
            clock: clock.clone(),
        };

        Harness {
            store,
            notifier,
            trigger,
            clock,
            control_loop: ControlLoop::new(deps, Config::default()).unwrap(),
        }
    }

    #[test_log::test(tokio::test)]
    async fn fans_out_to_every_recipient() {
        let h = harness(&[("A", 0), ("B", 0)], 1000, <_>::default());

        let outcome = h.control_loop.run_once().await.unwrap();

        let minutes = assert_matches!(
            outcome,
            RunOutcome::Sent { notified: 2, next_run_in_minutes: Some(minutes) } => minutes
        );
        // 1000 seconds after the epoch is 16:16 in US/Pacific, so no postpone
        assert!((240..=360).contains(&minutes), "{minutes}");

        expect![[r#"
            [
                (
                    RecipientId(
                        "A",
                    ),
                    "Use an old idea",
                ),
                (
                    RecipientId(
                        "B",
                    ),
                    "Use an old idea",
                ),
            ]
        "#]]
        .assert_debug_eq(&h.notifier.sent());

        assert_eq!(h.store.timestamps(), [(id("A"), 1000), (id("B"), 1000)]);
    }

    #[test_log::test(tokio::test)]
    async fn registers_the_next_run() {
        let h = harness(&[("A", 0)], 1000, <_>::default());

        h.control_loop.run_once().await.unwrap();

        let calls = h.trigger.calls();
        assert_eq!(calls.len(), 3, "{calls:#?}");

        let rule = assert_matches!(&calls[0], TriggerCall::PutRule(rule) => rule);
        assert_eq!(rule.name, "oblique-tg-obliquer-Trigger");
        assert_eq!(rule.state, RuleState::Enabled);

        let expression: ScheduleExpression = rule.schedule_expression.parse().unwrap();
        let ScheduleExpression::Rate { minutes } = expression;
        assert!((240..=360).contains(&minutes), "{minutes}");

        expect![[r#"
            PutTargets {
                rule_name: "oblique-tg-obliquer-Trigger",
                targets: [
                    Target {
                        id: "obliquerTriggerTarget",
                        arn: "local:function:oblique-tg-obliquer",
                    },
                ],
            }
        "#]]
        .assert_debug_eq(&calls[1]);

        expect![[r#"
            AddPermission(
                PermissionGrant {
                    function: "oblique-tg-obliquer",
                    statement_id: "obliquerTriggerStatement",
                    action: "function:Invoke",
                    principal: "events.local",
                    source_arn: RuleArn(
                        "fake:rule/oblique-tg-obliquer-Trigger",
                    ),
                },
            )
        "#]]
        .assert_debug_eq(&calls[2]);
    }

    #[test_log::test(tokio::test)]
    async fn duplicate_suppression_window() {
        let last_run = 10_000;

        for (offset, expect_skip) in [(0, true), (179, true), (180, true), (181, false)] {
            let h = harness(&[("A", last_run), ("B", 0)], last_run + offset, <_>::default());

            let outcome = h.control_loop.run_once().await.unwrap();

            if expect_skip {
                assert_matches!(
                    outcome,
                    RunOutcome::SkippedDuplicate { secs_since_last_run } if secs_since_last_run == offset
                );
                assert!(h.notifier.sent().is_empty());
                assert!(h.trigger.calls().is_empty());
            } else {
                assert_matches!(outcome, RunOutcome::Sent { notified: 2, .. });
                assert_eq!(h.notifier.sent().len(), 2);
            }
        }
    }

    #[test_log::test(tokio::test)]
    async fn second_invocation_of_the_same_tick_is_skipped() {
        let h = harness(&[("A", 0)], 50_000, <_>::default());

        assert_matches!(
            h.control_loop.run_once().await.unwrap(),
            RunOutcome::Sent { notified: 1, .. }
        );

        h.clock.advance(30);

        assert_matches!(
            h.control_loop.run_once().await.unwrap(),
            RunOutcome::SkippedDuplicate {
                secs_since_last_run: 30
            }
        );

        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn empty_store_still_reschedules() {
        let h = harness(&[], 1000, <_>::default());

        let outcome = h.control_loop.run_once().await.unwrap();

        assert_matches!(
            outcome,
            RunOutcome::Sent {
                notified: 0,
                next_run_in_minutes: Some(_)
            }
        );
        assert!(h.notifier.sent().is_empty());
        assert_eq!(h.trigger.calls().len(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn recipient_failures_are_isolated() {
        let h = harness(&[("A", 0), ("B", 0), ("C", 0)], 1000, <_>::default());
        h.notifier.fail_for("A");
        h.store.fail_updates_for("C");

        let outcome = h.control_loop.run_once().await.unwrap();

        let failures = assert_matches!(
            outcome,
            RunOutcome::PartialFailure { notified: 1, failures, next_run_in_minutes: Some(_) } => failures
        );

        let failed: Vec<_> = failures.iter().map(|f| f.recipient.0.as_str()).collect();
        assert_eq!(failed, ["A", "C"]);

        // "C" has received the message, but its timestamp couldn't be saved
        let sent: Vec<_> = h.notifier.sent().into_iter().map(|(id, _)| id.0).collect();
        assert_eq!(sent, ["B", "C"]);

        assert_eq!(
            h.store.timestamps(),
            [(id("A"), 0), (id("B"), 1000), (id("C"), 0)]
        );
    }

    #[test_log::test(tokio::test)]
    async fn partial_failure_reports_each_recipient() {
        let h = harness(&[("A", 0), ("B", 0)], 1000, <_>::default());
        h.notifier.fail_for("B");

        let outcome = h.control_loop.run_once().await.unwrap();
        outcome.log();

        let failures = assert_matches!(
            &outcome,
            RunOutcome::PartialFailure { notified: 1, failures, .. } => failures
        );
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].recipient, id("B"));
        assert_matches!(
            failures[0].error.kind(),
            crate::error::ErrorKind::Fatal { message, .. } if message.contains("B")
        );
    }

    #[test_log::test(tokio::test)]
    async fn rule_failure_is_swallowed() {
        let behavior = FakeTriggerBehavior {
            fail_put_rule: true,
            ..<_>::default()
        };
        let h = harness(&[("A", 0)], 1000, behavior);

        let outcome = h.control_loop.run_once().await.unwrap();

        assert_matches!(
            outcome,
            RunOutcome::Sent {
                notified: 1,
                next_run_in_minutes: None
            }
        );
        assert_matches!(h.trigger.calls().as_slice(), [TriggerCall::PutRule(_)]);
    }

    #[test_log::test(tokio::test)]
    async fn target_failure_is_swallowed() {
        let behavior = FakeTriggerBehavior {
            failed_target_entries: 1,
            ..<_>::default()
        };
        let h = harness(&[("A", 0)], 1000, behavior);

        let outcome = h.control_loop.run_once().await.unwrap();

        assert_matches!(
            outcome,
            RunOutcome::Sent {
                next_run_in_minutes: None,
                ..
            }
        );
        assert_matches!(
            h.trigger.calls().as_slice(),
            [TriggerCall::PutRule(_), TriggerCall::PutTargets { .. }]
        );
    }

    #[test_log::test(tokio::test)]
    async fn existing_permission_is_not_an_error() {
        let h = harness(&[("A", 0)], 1000, <_>::default());

        h.control_loop.run_once().await.unwrap();

        h.clock.advance(4 * 60 * 60);

        let outcome = h.control_loop.run_once().await.unwrap();

        assert_matches!(
            outcome,
            RunOutcome::Sent {
                notified: 1,
                next_run_in_minutes: Some(_)
            }
        );
        assert_eq!(h.trigger.grants().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn other_permission_errors_propagate() {
        let behavior = FakeTriggerBehavior {
            fail_add_permission: true,
            ..<_>::default()
        };
        let h = harness(&[("A", 0)], 1000, behavior);

        let err = h.control_loop.run_once().await.unwrap_err();

        assert_matches!(
            err.kind(),
            crate::error::ErrorKind::Trigger {
                source: TriggerError::UnknownFunction { .. }
            }
        );

        // The messages were sent before the reschedule step
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn store_read_failure_fails_the_run() {
        let h = harness(&[("A", 0)], 1000, <_>::default());
        h.store.fail_reads();

        h.control_loop.run_once().await.unwrap_err();

        assert!(h.notifier.sent().is_empty());
        assert!(h.trigger.calls().is_empty());
    }
}
