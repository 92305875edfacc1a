use crate::auth::Permissions;
use crate::commands::{Command, Context, Origin, Reply};
use crate::error::{JobdError, Result};
use crate::protocol::{first_item, verbs, visit_fields, Field, FieldNumber, Item, Request, Response};
use crate::scheduler::query::compile;

fn decode_fields(verb: &str, request: &Request) -> Result<(Option<String>, Option<u32>)> {
    let mut name = None;
    let mut count = None;
    visit_fields(verb, first_item(request), |number, field| {
        match number {
            FieldNumber::ResName => name = Some(field.as_string()?),
            FieldNumber::ResCount => count = Some(field.as_u32()?),
            _ => return Ok(false),
        }
        Ok(true)
    })?;
    Ok((name, count))
}

fn require_name(verb: &str, name: Option<String>) -> Result<String> {
    name.ok_or_else(|| JobdError::Decode(format!("{} without a resource name", verb)))
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(':') || name.contains(char::is_whitespace) {
        return Err(JobdError::invalid(format!("Invalid resource name '{}'", name)));
    }
    Ok(())
}

/// RESOURCE_ADD
#[derive(Debug)]
pub struct AddResource {
    name: String,
    count: u32,
}

impl Command for AddResource {
    const VERB: &'static str = verbs::RESOURCE_ADD;
    const PERMISSION: Permissions = Permissions::WRITE;
    const REPLAY: bool = true;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let (name, count) = decode_fields(Self::VERB, request)?;
        Ok(AddResource {
            name: require_name(Self::VERB, name)?,
            count: count.unwrap_or(1),
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        validate_name(&self.name)?;
        ctx.state.scheduler.resources.add(&self.name, self.count)?;
        tracing::info!(resource = %self.name, count = self.count, "Resource added");
        Ok(Reply::ok())
    }
}

/// RESOURCE_GET: resources matching an optional glob, with units in use.
#[derive(Debug)]
pub struct GetResource {
    pattern: Option<String>,
}

impl Command for GetResource {
    const VERB: &'static str = verbs::RESOURCE_GET;
    const PERMISSION: Permissions = Permissions::READ;
    const REPLAY: bool = false;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let (pattern, _) = decode_fields(Self::VERB, request)?;
        Ok(GetResource { pattern })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let pattern = self.pattern.as_deref().map(compile).transpose()?;
        let scheduler = &ctx.state.scheduler;

        let items = scheduler
            .resources
            .iter()
            .filter(|r| pattern.as_ref().map_or(true, |p| p.matches(&r.name)))
            .map(|r| {
                Item::new()
                    .with(Field::string(FieldNumber::ResName, &r.name))
                    .with(Field::int(FieldNumber::ResCount, i64::from(r.count)))
                    .with(Field::int(
                        FieldNumber::ResInUse,
                        scheduler.resource_in_use(&r.name) as i64,
                    ))
            })
            .collect();

        Ok(Reply::respond(Response::array(items)))
    }
}

/// RESOURCE_MOD: change a resource's total count.
#[derive(Debug)]
pub struct ModifyResource {
    name: String,
    count: Option<u32>,
}

impl Command for ModifyResource {
    const VERB: &'static str = verbs::RESOURCE_MOD;
    const PERMISSION: Permissions = Permissions::WRITE;
    const REPLAY: bool = true;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let (name, count) = decode_fields(Self::VERB, request)?;
        Ok(ModifyResource {
            name: require_name(Self::VERB, name)?,
            count,
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let resource = ctx
            .state
            .scheduler
            .resources
            .get_mut(&self.name)
            .ok_or_else(|| JobdError::ResourceNotFound(self.name.clone()))?;

        if let Some(count) = self.count {
            resource.count = count;
            resource.revision += 1;
        }
        Ok(Reply::ok())
    }
}

/// RESOURCE_DEL: refused while any live job binds the resource.
#[derive(Debug)]
pub struct DeleteResource {
    name: String,
}

impl Command for DeleteResource {
    const VERB: &'static str = verbs::RESOURCE_DEL;
    const PERMISSION: Permissions = Permissions::WRITE;
    const REPLAY: bool = true;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let (name, _) = decode_fields(Self::VERB, request)?;
        Ok(DeleteResource {
            name: require_name(Self::VERB, name)?,
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let scheduler = &mut ctx.state.scheduler;
        if !scheduler.resources.contains(&self.name) {
            return Err(JobdError::ResourceNotFound(self.name));
        }
        if scheduler.resource_bound(&self.name) {
            return Err(JobdError::invalid(format!(
                "Resource '{}' is in use by jobs",
                self.name
            )));
        }
        scheduler.resources.remove(&self.name);
        tracing::info!(resource = %self.name, "Resource deleted");
        Ok(Reply::ok())
    }
}
