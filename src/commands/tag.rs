use crate::auth::Permissions;
use crate::commands::{job_id_from, Command, Context, Origin, Reply};
use crate::error::{JobdError, Result};
use crate::protocol::{first_item, verbs, visit_fields, FieldNumber, Request};
use crate::scheduler::JobId;

#[derive(Debug)]
pub struct SetTag {
    pub id: JobId,
    pub key: String,
    pub value: String,
}

impl Command for SetTag {
    const VERB: &'static str = verbs::TAG_SET;
    const PERMISSION: Permissions = Permissions::WRITE;
    const REPLAY: bool = true;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let mut id = None;
        let mut key = None;
        let mut value = String::new();
        visit_fields(Self::VERB, first_item(request), |number, field| {
            match number {
                FieldNumber::JobId => id = Some(field.as_u64()?),
                FieldNumber::TagKey => key = Some(field.as_string()?),
                FieldNumber::TagValue => value = field.as_string()?,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        let key = key.ok_or_else(|| JobdError::Decode("TAG_SET without a key".into()))?;
        Ok(SetTag {
            id: job_id_from(request, id),
            key,
            value,
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let revision = ctx.state.scheduler.set_tag(self.id, &self.key, &self.value)?;
        Ok(Reply::ok().for_job(self.id, revision))
    }
}

#[derive(Debug)]
pub struct DeleteTag {
    pub id: JobId,
    pub key: String,
}

impl Command for DeleteTag {
    const VERB: &'static str = verbs::TAG_DEL;
    const PERMISSION: Permissions = Permissions::WRITE;
    const REPLAY: bool = true;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let mut id = None;
        let mut key = None;
        visit_fields(Self::VERB, first_item(request), |number, field| {
            match number {
                FieldNumber::JobId => id = Some(field.as_u64()?),
                FieldNumber::TagKey => key = Some(field.as_string()?),
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        let key = key.ok_or_else(|| JobdError::Decode("TAG_DEL without a key".into()))?;
        Ok(DeleteTag {
            id: job_id_from(request, id),
            key,
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let revision = ctx.state.scheduler.delete_tag(self.id, &self.key)?;
        Ok(Reply::ok().for_job(self.id, revision))
    }
}
