//! Selection for `catguard next-issue` and `catguard prepare`.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::resolver::{Resolution, ResolveOptions, Scope, resolve};
use crate::io::issue_tree::load_issue_tree;
use crate::io::paths::ProjectPaths;

/// Resolution request as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct SelectRequest {
    pub scope: Option<String>,
    pub exclude: Option<String>,
    pub override_postconditions: bool,
}

impl SelectRequest {
    pub fn scope(&self) -> Scope {
        Scope::parse(self.scope.as_deref())
    }

    pub fn options(&self) -> Result<ResolveOptions> {
        let options = ResolveOptions {
            override_postconditions: self.override_postconditions,
            ..ResolveOptions::default()
        };
        match &self.exclude {
            Some(pattern) => options.with_exclude(pattern),
            None => Ok(options),
        }
    }
}

/// Load the issue tree under `root` and resolve the request.
pub fn select_from_root(root: &Path, request: &SelectRequest) -> Result<Resolution> {
    let paths = ProjectPaths::require(root)?;
    let tree = load_issue_tree(&paths).context("load issue tree for selection")?;
    Ok(resolve(&tree, &request.scope(), &request.options()?))
}
