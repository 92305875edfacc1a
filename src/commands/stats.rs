use crate::auth::Permissions;
use crate::commands::{Command, Context, Origin, Reply};
use crate::error::Result;
use crate::protocol::{verbs, Field, FieldNumber, Item, Request, Response};
use crate::scheduler::JobState;

/// STATS: live job counts per state and lifetime totals.
#[derive(Debug)]
pub struct GetStats;

impl Command for GetStats {
    const VERB: &'static str = verbs::STATS;
    const PERMISSION: Permissions = Permissions::READ;
    const REPLAY: bool = false;
    const ORIGIN: Origin = Origin::Client;

    fn decode(_request: &Request) -> Result<Self> {
        Ok(GetStats)
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let scheduler = &ctx.state.scheduler;
        let count = |state: JobState| scheduler.jobs.count_in_state(state) as i64;
        let totals = scheduler.stats;

        let item = Item::new()
            .with(Field::int(FieldNumber::StatsRunning, count(JobState::Running)))
            .with(Field::int(FieldNumber::StatsPending, count(JobState::Pending)))
            .with(Field::int(FieldNumber::StatsDeferred, count(JobState::Deferred)))
            .with(Field::int(FieldNumber::StatsHolding, count(JobState::Holding)))
            .with(Field::int(FieldNumber::StatsCompleted, count(JobState::Completed)))
            .with(Field::int(FieldNumber::StatsExited, count(JobState::Exited)))
            .with(Field::int(FieldNumber::StatsTotalSubmitted, totals.submitted as i64))
            .with(Field::int(FieldNumber::StatsTotalStarted, totals.started as i64))
            .with(Field::int(FieldNumber::StatsTotalCompleted, totals.completed as i64))
            .with(Field::int(FieldNumber::StatsTotalExited, totals.exited as i64))
            .with(Field::int(FieldNumber::StatsTotalDeleted, totals.deleted as i64));

        Ok(Reply::respond(Response::map(item)))
    }
}
