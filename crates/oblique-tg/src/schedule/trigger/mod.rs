//! Periodic trigger facility that invokes the control loop.
//!
//! The model is a named rule with a schedule expression, a list of targets
//! the rule invokes, and permission grants that allow the rule to invoke a
//! target function. All the operations are upserts, so they can be repeated
//! on every run of the control loop.

mod local;

use async_trait::async_trait;
use derive_more::Display;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub(crate) use local::LocalTriggerFacility;

/// Action name that allows the rule to invoke the function
pub(crate) const INVOKE_ACTION: &str = "function:Invoke";

/// Principal of the permission grants, the trigger facility itself
pub(crate) const TRIGGER_PRINCIPAL: &str = "events.local";

/// Fixed identity of a function the trigger facility can invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FunctionRef {
    pub(crate) name: &'static str,
    pub(crate) arn: &'static str,
}

/// The control loop of this bot
pub(crate) const OBLIQUER: FunctionRef = FunctionRef {
    name: "oblique-tg-obliquer",
    arn: "local:function:oblique-tg-obliquer",
};

impl FunctionRef {
    pub(crate) fn rule_name(&self) -> String {
        format!("{}-Trigger", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub(crate) struct RuleArn(pub(crate) String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RuleState {
    Enabled,
    #[allow(dead_code)]
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PutRule {
    pub(crate) name: String,

    /// Human-readable rate expression, e.g. `rate(240 minutes)`
    pub(crate) schedule_expression: String,
    pub(crate) state: RuleState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub(crate) id: String,
    pub(crate) arn: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PutTargetsOutput {
    pub(crate) failed_entry_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PermissionGrant {
    pub(crate) function: String,
    pub(crate) statement_id: String,
    pub(crate) action: String,
    pub(crate) principal: String,
    pub(crate) source_arn: RuleArn,
}

/// A single firing of a rule for one of its targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Invocation {
    pub(crate) function: String,
    pub(crate) target_id: String,
    pub(crate) source_rule: RuleArn,
}

#[async_trait]
pub(crate) trait TriggerFacility: Send + Sync {
    /// Creates or replaces the rule with the given name
    async fn put_rule(&self, rule: PutRule) -> Result<RuleArn, TriggerError>;

    /// Adds or replaces (by [`Target::id`]) the targets of the rule.
    /// Targets that can't be attached are counted in the output, they
    /// don't fail the whole operation.
    async fn put_targets(
        &self,
        rule_name: &str,
        targets: Vec<Target>,
    ) -> Result<PutTargetsOutput, TriggerError>;

    /// Fails with [`TriggerError::ResourceConflict`] if the statement
    /// already exists for the function.
    async fn add_permission(&self, grant: PermissionGrant) -> Result<(), TriggerError>;
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TriggerError {
    #[error("Permission statement `{statement_id}` already exists for function `{function}`")]
    ResourceConflict {
        function: String,
        statement_id: String,
    },

    #[error("Rule `{rule}` was not found")]
    RuleNotFound { rule: String },

    #[error("Function `{function}` is not known to the trigger facility")]
    UnknownFunction { function: String },

    #[error("Invalid schedule expression")]
    InvalidScheduleExpression {
        #[from]
        source: ParseScheduleExpressionError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduleExpression {
    Rate { minutes: u32 },
}

impl ScheduleExpression {
    pub(crate) fn period(self) -> Duration {
        match self {
            Self::Rate { minutes } => Duration::from_secs(u64::from(minutes) * 60),
        }
    }
}

impl fmt::Display for ScheduleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Rate { minutes: 1 } => f.write_str("rate(1 minute)"),
            Self::Rate { minutes } => write!(f, "rate({minutes} minutes)"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Can't parse schedule expression `{input}`: {reason}")]
pub(crate) struct ParseScheduleExpressionError {
    input: String,
    reason: &'static str,
}

impl FromStr for ScheduleExpression {
    type Err = ParseScheduleExpressionError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseScheduleExpressionError {
            input: input.to_owned(),
            reason,
        };

        let body = input
            .strip_prefix("rate(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| err("only `rate(<value> <unit>)` expressions are supported"))?;

        let (value, unit) = body
            .split_once(' ')
            .ok_or_else(|| err("expected a value and a unit separated by a space"))?;

        let value: u32 = value
            .parse()
            .map_err(|_| err("the value must be a positive integer"))?;

        if value == 0 {
            return Err(err("the value must be a positive integer"));
        }

        let (is_singular, unit_minutes) = match unit {
            "minute" => (true, 1),
            "minutes" => (false, 1),
            "hour" => (true, 60),
            "hours" => (false, 60),
            "day" => (true, 24 * 60),
            "days" => (false, 24 * 60),
            _ => return Err(err("the unit must be `minute(s)`, `hour(s)` or `day(s)`")),
        };

        if is_singular != (value == 1) {
            return Err(err("the unit must be singular only for the value of 1"));
        }

        let minutes = value
            .checked_mul(unit_minutes)
            .ok_or_else(|| err("the rate is too large"))?;

        Ok(Self::Rate { minutes })
    }
}
