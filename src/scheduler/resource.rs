//! Resource catalog and binding of job resource requirements.
//!
//! Jobs request resources as `name` or `name:count` strings. Binding resolves
//! every name against the catalog and either succeeds for the whole list or
//! fails without binding anything.

use std::collections::BTreeMap;

use crate::error::{JobdError, Result};
use crate::scheduler::job::BoundResource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    /// Total units available. Accounting against it happens outside this crate.
    pub count: u32,
    pub revision: u64,
}

#[derive(Debug, Default)]
pub struct ResourceCatalog {
    resources: BTreeMap<String, Resource>,
}

impl ResourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, count: u32) -> Result<&Resource> {
        let name = name.into();
        if self.resources.contains_key(&name) {
            return Err(JobdError::AlreadyExists(name));
        }
        let resource = Resource {
            name: name.clone(),
            count,
            revision: 1,
        };
        Ok(self.resources.entry(name).or_insert(resource))
    }

    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Resource> {
        self.resources.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Resource> {
        self.resources.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resolve every spec. The first unknown name fails the whole call.
    pub fn bind(&self, specs: &[String]) -> Result<Vec<BoundResource>> {
        specs
            .iter()
            .map(|spec| {
                let (name, needed) = parse_spec(spec)?;
                if !self.contains(name) {
                    return Err(JobdError::ResourceNotFound(name.to_string()));
                }
                Ok(BoundResource {
                    name: name.to_string(),
                    needed,
                })
            })
            .collect()
    }
}

/// Split `name[:count]`. A missing count means 1.
pub fn parse_spec(spec: &str) -> Result<(&str, u32)> {
    let (name, needed) = match spec.split_once(':') {
        Some((name, count)) => {
            let needed: u32 = count.trim().parse().map_err(|_| {
                JobdError::invalid(format!("Invalid resource count in '{}'", spec))
            })?;
            (name, needed)
        }
        None => (spec, 1),
    };

    if name.is_empty() {
        return Err(JobdError::invalid(format!(
            "Missing resource name in '{}'",
            spec
        )));
    }
    if needed == 0 {
        return Err(JobdError::invalid(format!(
            "Resource count must be positive in '{}'",
            spec
        )));
    }
    Ok((name, needed))
}

/// Inverse of [`ResourceCatalog::bind`], used when serializing jobs.
pub fn to_specs(bound: &[BoundResource]) -> Vec<String> {
    bound
        .iter()
        .map(|r| format!("{}:{}", r.name, r.needed))
        .collect()
}
