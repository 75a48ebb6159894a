//! Collapses the original's `POLICY`/`HISTORY`/`DISABLED`/`ARGS` globals into
//! one value constructed at startup and shared via `Arc` (DESIGN NOTES §9).

use crate::cli::Args;
use crate::error::XtalkError;
use crate::history::{Index, MessageHistory};
use crate::policy::{CliDefaults, FilterPolicy};
use crate::scheduler::Scheduler;

pub struct PipelineContext {
    pub policy: FilterPolicy,
    pub history: MessageHistory,
    pub disabled: MessageHistory,
    pub args: Args,
    pub scheduler: Scheduler,
}

impl PipelineContext {
    pub fn new(args: Args) -> Result<Self, XtalkError> {
        let defaults = CliDefaults {
            threshold: args.threshold as u8,
            minimum: args.minimum as u8,
        };
        let policy = FilterPolicy::load(args.policy.as_deref(), defaults)?;

        Ok(Self {
            policy,
            history: MessageHistory::new(Index::Data1),
            disabled: MessageHistory::new(Index::Data1),
            args,
            scheduler: Scheduler::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn new_builds_a_context_from_default_args() {
        let args = Args::try_parse_from(["xtalk"]).unwrap();
        let ctx = PipelineContext::new(args).unwrap();
        assert_eq!(ctx.args.delay, 5);
    }
}
