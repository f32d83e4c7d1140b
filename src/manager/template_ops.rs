//! The `create` and `template info` verbs.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::core::ZkgError;
use crate::meta::uservar;
use crate::template::{Template, TemplateInfo};

use super::Manager;

impl Manager {
    /// Instantiate a new package from a template.
    ///
    /// `template` defaults to the configured (or stock) template URL.
    /// Variable values resolve in priority order: command-line override,
    /// environment variable, persisted config answer, template default.
    /// The engine never prompts; a variable that stays unresolved fails
    /// the operation naming the variable.
    pub async fn create(
        &mut self,
        packagedir: &Path,
        template_source: Option<&str>,
        template_version: Option<&str>,
        features: &[String],
        force: bool,
    ) -> Result<()> {
        let source = template_source
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_template());

        let template = Template::load(
            self.vcs.as_ref(),
            &self.layout.template_clonedir(),
            &source,
            template_version,
        )
        .await?;

        let needed: Vec<_> = template
            .needed_user_vars(features)
            .into_iter()
            .cloned()
            .collect();
        let vars = uservar::resolve_all(&needed, &self.user_var_overrides, &self.config.user_vars)
            .map_err(|name| ZkgError::Template {
                reason: format!(
                    "no value for required template variable \"{name}\" (supply it with --user-var {name}=...)"
                ),
            })?;

        template
            .instantiate(self.vcs.as_ref(), packagedir, features, &vars, force)
            .await?;

        info!(
            dir = %packagedir.display(),
            template = %template.name(),
            version = template.version().unwrap_or("unversioned"),
            "created package"
        );
        Ok(())
    }

    /// Summarize a template's parameters, features, and versions.
    pub async fn template_info(
        &self,
        template_source: Option<&str>,
        template_version: Option<&str>,
    ) -> Result<TemplateInfo> {
        let source = template_source
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_template());
        let template = Template::load(
            self.vcs.as_ref(),
            &self.layout.template_clonedir(),
            &source,
            template_version,
        )
        .await?;
        Ok(template.info())
    }

    /// Resolve user vars for a package the way `create` does; exposed so
    /// front-ends can persist interactive answers.
    pub fn resolve_user_vars(
        &self,
        vars: &[crate::meta::uservar::UserVar],
    ) -> Result<BTreeMap<String, String>> {
        uservar::resolve_all(vars, &self.user_var_overrides, &self.config.user_vars).map_err(
            |name| {
                ZkgError::Config {
                    reason: format!("no value for required variable \"{name}\""),
                }
                .into()
            },
        )
    }
}
