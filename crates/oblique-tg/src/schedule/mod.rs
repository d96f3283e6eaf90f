//! Self-rescheduling notification loop

mod clock;
mod control_loop;
mod policy;

pub(crate) mod trigger;

use crate::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use trigger::Invocation;

pub(crate) use clock::*;
pub(crate) use control_loop::*;
pub(crate) use policy::*;

/// Runs every invocation delivered by the trigger facility as an independent
/// unit of work. Several invocations may overlap if the facility fires more
/// than once for the same tick.
pub(crate) async fn dispatch_invocations(
    mut invocations: mpsc::UnboundedReceiver<Invocation>,
    control_loop: Arc<ControlLoop>,
) {
    while let Some(invocation) = invocations.recv().await {
        if invocation.function != trigger::OBLIQUER.name {
            warn!(?invocation, "Received an invocation for an unknown function");
            continue;
        }

        let span = info_span!(
            "invocation",
            rule = %invocation.source_rule,
            target_id = %invocation.target_id,
        );

        let control_loop = control_loop.clone();

        tokio::spawn(
            async move {
                match control_loop.run_once().await {
                    Ok(outcome) => outcome.log(),
                    Err(err) => {
                        error!(err = tracing_err(&err), "Control loop invocation failed");
                    }
                }
            }
            .instrument(span),
        );
    }

    info!("Trigger facility stopped delivering invocations");
}
