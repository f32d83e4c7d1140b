//! The template engine: instantiating new packages from template
//! repositories.
//!
//! A template is a git repository carrying a declarative control file,
//! `zkg.template`, at its root:
//!
//! ```ini
//! [template]
//! api_version = 1.0.0
//! user_vars =
//!     name [] "The name of the package"
//!     author [] "Author name and email"
//!
//! [package]
//! directory = package
//! requires = name author
//!
//! [feature:readme]
//! directory = features/readme
//! requires = name
//!
//! [validators]
//! name = ^[A-Za-z_][A-Za-z0-9_.-]*$
//! ```
//!
//! The `[package]` content directory holds the files every instantiation
//! gets; each selected feature overlays its own directory on top. File and
//! directory *names* may carry `@param@` tokens; file *contents* are tera
//! templates rendered with the resolved variables (non-UTF-8 files copy
//! through verbatim, and variable values, including any Unicode, pass
//! through untouched).
//!
//! Instantiation records a `[template]`/`[template_vars]` section pair in
//! the created package's metadata so the identical tree can be reproduced
//! later, then initializes a git repository and makes the initial commit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::fsutil;
use crate::core::ZkgError;
use crate::git::{ensure_clone, Vcs};
use crate::meta::ini::Ini;
use crate::meta::uservar::UserVar;
use crate::meta::{TemplateRecord, METADATA_FILENAME};
use crate::package::name_from_path;
use crate::version::sorted_version_tags;

/// The template API version this engine implements.
pub const TEMPLATE_API_VERSION: &str = "1.0.0";
/// Name of the control file at a template repository's root.
pub const TEMPLATE_CONTROL_FILE: &str = "zkg.template";

fn template_error(reason: impl Into<String>) -> anyhow::Error {
    ZkgError::Template {
        reason: reason.into(),
    }
    .into()
}

/// One feature a template offers: an additive content overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSpec {
    pub name: String,
    pub directory: String,
    /// User vars this feature requires.
    pub requires: Vec<String>,
}

/// The parsed control file.
#[derive(Debug, Clone, Default)]
pub struct TemplateSpec {
    pub api_version: String,
    pub user_vars: Vec<UserVar>,
    pub package_dir: Option<String>,
    pub package_requires: Vec<String>,
    pub features: Vec<FeatureSpec>,
    pub validators: BTreeMap<String, String>,
}

impl TemplateSpec {
    pub fn parse(ini: &Ini) -> Result<Self> {
        let template = ini
            .section("template")
            .ok_or_else(|| template_error("control file lacks a [template] section"))?;
        let api_version = template
            .get("api_version")
            .ok_or_else(|| template_error("template does not indicate its API version"))?
            .to_string();

        let user_vars = match template.get("user_vars") {
            None => Vec::new(),
            Some(text) => UserVar::parse_field(text)
                .ok_or_else(|| template_error("template has malformed 'user_vars'"))?,
        };

        let mut spec = Self {
            api_version,
            user_vars,
            ..Default::default()
        };

        if let Some(package) = ini.section("package") {
            spec.package_dir = package.get("directory").map(str::to_string);
            spec.package_requires = split_names(package.get("requires").unwrap_or_default());
        }

        for (name, section) in ini.sections() {
            if let Some(feature_name) = name.strip_prefix("feature:") {
                let directory = section
                    .get("directory")
                    .ok_or_else(|| {
                        template_error(format!("feature \"{feature_name}\" lacks a directory"))
                    })?
                    .to_string();
                spec.features.push(FeatureSpec {
                    name: feature_name.to_string(),
                    directory,
                    requires: split_names(section.get("requires").unwrap_or_default()),
                });
            }
        }

        if let Some(validators) = ini.section("validators") {
            for (name, pattern) in validators.iter() {
                Regex::new(pattern).map_err(|e| {
                    template_error(format!("validator for \"{name}\" is not a valid regex: {e}"))
                })?;
                spec.validators.insert(name.to_string(), pattern.to_string());
            }
        }

        Ok(spec)
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureSpec> {
        self.features.iter().find(|f| f.name == name)
    }
}

fn split_names(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

/// Summary of a template, rendered by `template info`.
#[derive(Debug, Serialize)]
pub struct TemplateInfo {
    pub api_version: String,
    pub origin: String,
    pub provides_package: bool,
    pub versions: Vec<String>,
    pub features: Vec<String>,
    pub user_vars: BTreeMap<String, TemplateInfoVar>,
}

#[derive(Debug, Serialize)]
pub struct TemplateInfoVar {
    pub description: String,
    pub default: Option<String>,
    pub used_by: Vec<String>,
}

/// A loaded template: a local working tree plus its parsed control file.
#[derive(Debug)]
pub struct Template {
    dir: PathBuf,
    origin: String,
    version: Option<String>,
    versions: Vec<String>,
    spec: TemplateSpec,
}

impl Template {
    /// Load a template from a local directory or git URL.
    ///
    /// URLs are maintained under `clones/template/` in the state directory
    /// and honor version requests the same way packages do: the requested
    /// ref, else the most recent version tag, else the default branch.
    /// Local directories ignore version requests.
    pub async fn load(
        vcs: &dyn Vcs,
        template_clonedir: &Path,
        source: &str,
        version: Option<&str>,
    ) -> Result<Self> {
        let (dir, resolved_version, versions) = if Path::new(source).is_dir() {
            if version.is_some() {
                warn!(%source, "ignoring version request on local template");
            }
            let dir = PathBuf::from(source);
            // A clean local checkout is identified by its commit so the
            // recorded provenance stays reproducible.
            let resolved = if vcs.is_valid_repo(&dir) && !vcs.is_dirty(&dir).await.unwrap_or(true) {
                vcs.current_commit(&dir)
                    .await
                    .ok()
                    .map(|c| c.chars().take(8).collect::<String>())
            } else {
                None
            };
            (dir, resolved, Vec::new())
        } else {
            let dir = template_clonedir.join(name_from_path(source));
            fsutil::make_dir(template_clonedir)?;
            ensure_clone(vcs, source, &dir, false).await?;
            vcs.fetch(&dir).await?;

            let tags = sorted_version_tags(vcs.list_tags(&dir).await?);
            let resolved = match version {
                Some(v) => v.to_string(),
                None => match tags.last() {
                    Some(tag) => tag.clone(),
                    None => vcs.default_branch(&dir).await?,
                },
            };
            vcs.checkout(&dir, &resolved).await?;
            // When on a branch, move to its tip; checkout of a tag or
            // commit leaves nothing to pull.
            if !tags.contains(&resolved) {
                let _ = vcs.pull(&dir).await;
            }
            (dir, Some(resolved), tags)
        };

        let control = dir.join(TEMPLATE_CONTROL_FILE);
        if !control.is_file() {
            return Err(template_error(format!(
                "not a package template: no {TEMPLATE_CONTROL_FILE} in {}",
                dir.display()
            )));
        }
        // Key case is preserved so validators and `requires` lists can name
        // upper-case user variables.
        let ini = Ini::parse_file(&control, true).map_err(template_error)?;
        let spec = TemplateSpec::parse(&ini)?;

        if !is_api_compatible(&spec.api_version)? {
            return Err(template_error(format!(
                "template API version is incompatible with this engine ({} vs {TEMPLATE_API_VERSION})",
                spec.api_version
            )));
        }

        Ok(Self {
            dir,
            origin: source.to_string(),
            version: resolved_version,
            versions,
            spec,
        })
    }

    pub fn spec(&self) -> &TemplateSpec {
        &self.spec
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn name(&self) -> String {
        name_from_path(&self.origin)
    }

    /// The user vars the package content plus `features` actually need.
    pub fn needed_user_vars(&self, features: &[String]) -> Vec<&UserVar> {
        let mut needed: Vec<&str> = self.spec.package_requires.iter().map(String::as_str).collect();
        for feature in features {
            if let Some(spec) = self.spec.feature(feature) {
                needed.extend(spec.requires.iter().map(String::as_str));
            }
        }
        self.spec
            .user_vars
            .iter()
            .filter(|v| needed.is_empty() || needed.contains(&v.name()))
            .collect()
    }

    /// Information summary for `template info`.
    pub fn info(&self) -> TemplateInfo {
        let mut user_vars = BTreeMap::new();
        for var in &self.spec.user_vars {
            let mut used_by = Vec::new();
            if self.spec.package_requires.iter().any(|r| r == var.name()) {
                used_by.push("package".to_string());
            }
            for feature in &self.spec.features {
                if feature.requires.iter().any(|r| r == var.name()) {
                    used_by.push(feature.name.clone());
                }
            }
            user_vars.insert(
                var.name().to_string(),
                TemplateInfoVar {
                    description: var.description().to_string(),
                    default: var.default().map(str::to_string),
                    used_by,
                },
            );
        }
        let mut features: Vec<String> = self.spec.features.iter().map(|f| f.name.clone()).collect();
        features.sort();
        TemplateInfo {
            api_version: self.spec.api_version.clone(),
            origin: self.origin.clone(),
            provides_package: self.spec.package_dir.is_some(),
            versions: self.versions.clone(),
            features,
            user_vars,
        }
    }

    /// Instantiate the template into `packagedir`.
    ///
    /// `vars` must already be resolved (the caller applies the CLI > env >
    /// default cascade and fails on gaps). Refuses an existing output
    /// directory unless `force` is set.
    pub async fn instantiate(
        &self,
        vcs: &dyn Vcs,
        packagedir: &Path,
        features: &[String],
        vars: &BTreeMap<String, String>,
        force: bool,
    ) -> Result<()> {
        let package_dir = self
            .spec
            .package_dir
            .as_ref()
            .ok_or_else(|| template_error("template does not provide a package"))?;

        if packagedir.exists() && packagedir.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false)
            && !force
        {
            return Err(template_error(format!(
                "output directory {} already exists (use --force to overwrite)",
                packagedir.display()
            )));
        }

        for feature in features {
            if self.spec.feature(feature).is_none() {
                return Err(template_error(format!(
                    "template has no feature named \"{feature}\""
                )));
            }
        }

        self.validate_vars(vars)?;

        fsutil::make_dir(packagedir)?;
        self.render_tree(&self.dir.join(package_dir), packagedir, vars)?;
        for feature in features {
            let spec = self.spec.feature(feature).expect("validated above");
            self.render_tree(&self.dir.join(&spec.directory), packagedir, vars)?;
        }

        self.update_metadata(packagedir, features, vars)?;
        self.git_init(vcs, packagedir, features).await?;
        Ok(())
    }

    /// Check resolved values against the template's declared validators.
    fn validate_vars(&self, vars: &BTreeMap<String, String>) -> Result<()> {
        for (name, pattern) in &self.spec.validators {
            if let Some(value) = vars.get(name) {
                let re = Regex::new(pattern).expect("validated at parse time");
                if !re.is_match(value) {
                    return Err(template_error(format!(
                        "value \"{value}\" for \"{name}\" does not match {pattern}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Render one content directory into the output tree. Path components
    /// substitute `@param@` tokens; UTF-8 file contents render as tera
    /// templates; other files and symlink targets copy through with token
    /// substitution only.
    fn render_tree(
        &self,
        content_root: &Path,
        packagedir: &Path,
        vars: &BTreeMap<String, String>,
    ) -> Result<()> {
        if !content_root.is_dir() {
            return Err(template_error(format!(
                "template content directory missing: {}",
                content_root.display()
            )));
        }

        let mut context = tera::Context::new();
        for (name, value) in vars {
            context.insert(name, value);
        }

        for entry in WalkDir::new(content_root).follow_links(false) {
            let entry = entry
                .with_context(|| format!("failed to walk {}", content_root.display()))?;
            let rel = entry
                .path()
                .strip_prefix(content_root)
                .expect("walkdir yields children of root");
            if rel.as_os_str().is_empty() {
                continue;
            }

            let out_rel = substitute_tokens(&rel.to_string_lossy(), vars);
            let out_path = packagedir.join(&out_rel);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                fsutil::make_dir(&out_path)?;
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                let target = substitute_tokens(&target.to_string_lossy(), vars);
                if let Some(parent) = out_path.parent() {
                    fsutil::make_dir(parent)?;
                }
                fsutil::make_symlink(Path::new(&target), &out_path)?;
            } else {
                if let Some(parent) = out_path.parent() {
                    fsutil::make_dir(parent)?;
                }
                let raw = std::fs::read(entry.path())?;
                match String::from_utf8(raw) {
                    Ok(text) => {
                        let rendered = tera::Tera::one_off(&text, &context, false)
                            .map_err(|e| {
                                template_error(format!(
                                    "failed to render {}: {e}",
                                    entry.path().display()
                                ))
                            })?;
                        std::fs::write(&out_path, rendered)?;
                    }
                    Err(raw) => {
                        std::fs::write(&out_path, raw.into_bytes())?;
                    }
                }
                copy_permissions(entry.path(), &out_path)?;
            }
        }
        Ok(())
    }

    /// Record the instantiation in the created package's metadata so it
    /// can be reproduced.
    fn update_metadata(
        &self,
        packagedir: &Path,
        features: &[String],
        vars: &BTreeMap<String, String>,
    ) -> Result<()> {
        let manifest_file = packagedir.join(METADATA_FILENAME);
        let mut ini = if manifest_file.is_file() {
            Ini::parse_file(&manifest_file, false).map_err(template_error)?
        } else {
            let mut ini = Ini::new();
            ini.section_mut("package");
            ini
        };

        // Point out fields the engine will not understand; templates are
        // free to carry them, but a typo is worth hearing about.
        if let Some(section) = ini.section("package") {
            let meta = crate::meta::PackageMetadata::from_fields(section.to_map());
            for field in meta.unknown_fields() {
                warn!(%field, "template produced metadata with unknown field");
            }
        }

        ini.remove_section("template");
        let record = TemplateRecord {
            source: self.origin.clone(),
            version: self
                .version
                .clone()
                .unwrap_or_else(|| "unversioned".to_string()),
            zkg_version: crate::VERSION.to_string(),
            features: {
                let mut sorted: Vec<String> = features.to_vec();
                sorted.sort();
                sorted
            },
            vars: vars.clone(),
        };
        let section = ini.section_mut("template");
        section.set("source", record.source.clone());
        section.set("version", record.version.clone());
        section.set("zkg_version", record.zkg_version.clone());
        if !record.features.is_empty() {
            section.set("features", record.features.join(","));
        }

        ini.remove_section("template_vars");
        let section = ini.section_mut("template_vars");
        for (name, value) in vars {
            section.set(name.clone(), value.clone());
        }

        fsutil::atomic_write(&manifest_file, ini.to_string().as_bytes())
    }

    async fn git_init(&self, vcs: &dyn Vcs, packagedir: &Path, features: &[String]) -> Result<()> {
        vcs.init(packagedir).await?;

        let mut feature_info = String::new();
        if !features.is_empty() {
            let mut names: Vec<String> = features.iter().map(|f| format!("\"{f}\"")).collect();
            names.sort();
            feature_info = format!(", with features {}", names.join(", "));
        }
        let version_info = match &self.version {
            Some(v) => format!("version {v}"),
            None => "no versioning".to_string(),
        };
        let message = format!(
            "Initial commit.\n\nzkg {} created this package from template \"{}\"\nusing {version_info}{feature_info}.",
            crate::VERSION,
            self.name()
        );
        let commit = vcs.commit_all(packagedir, &message).await?;
        debug!(%commit, dir = %packagedir.display(), "created package from template");
        Ok(())
    }
}

/// Substitute `@name@` tokens (case-insensitive) in a path or symlink
/// target.
fn substitute_tokens(input: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = input.to_string();
    for (name, value) in vars {
        let pattern = format!("(?i)@{}@", regex::escape(name));
        if let Ok(re) = Regex::new(&pattern) {
            out = re.replace_all(&out, value.as_str()).into_owned();
        }
    }
    out
}

#[cfg(unix)]
fn copy_permissions(src: &Path, dst: &Path) -> Result<()> {
    let perm = std::fs::metadata(src)?.permissions();
    std::fs::set_permissions(dst, perm)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_permissions(_src: &Path, _dst: &Path) -> Result<()> {
    Ok(())
}

/// Semantic API compatibility: same major, template minor no newer than
/// ours.
pub fn is_api_compatible(template_version: &str) -> Result<bool> {
    let template: semver::Version = template_version
        .parse()
        .map_err(|e| template_error(format!("API version string \"{template_version}\" is invalid: {e}")))?;
    let ours: semver::Version = TEMPLATE_API_VERSION.parse().expect("static version");
    Ok(template.major == ours.major && template.minor <= ours.minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTROL: &str = "\
[template]
api_version = 1.0.0
user_vars =
\tname [] \"The name of the package\"
\tauthor [me] \"Author\"

[package]
directory = package
requires = name author

[feature:readme]
directory = features/readme
requires = name

[validators]
name = ^[A-Za-z_][A-Za-z0-9_.-]*$
";

    fn parse_spec() -> TemplateSpec {
        TemplateSpec::parse(&Ini::parse(CONTROL, true).unwrap()).unwrap()
    }

    #[test]
    fn parses_control_file() {
        let spec = parse_spec();
        assert_eq!(spec.api_version, "1.0.0");
        assert_eq!(spec.package_dir.as_deref(), Some("package"));
        assert_eq!(spec.user_vars.len(), 2);
        assert_eq!(spec.features.len(), 1);
        assert_eq!(spec.features[0].name, "readme");
        assert!(spec.validators.contains_key("name"));
    }

    #[test]
    fn api_compatibility_rules() {
        assert!(is_api_compatible("1.0.0").unwrap());
        assert!(is_api_compatible("1.0.9").unwrap());
        assert!(!is_api_compatible("2.0.0").unwrap());
        assert!(!is_api_compatible("1.1.0").unwrap());
        assert!(is_api_compatible("nonsense").is_err());
    }

    #[test]
    fn token_substitution_in_paths() {
        let mut vars = BTreeMap::new();
        vars.insert("name".to_string(), "test3".to_string());
        assert_eq!(substitute_tokens("scripts/@name@.zeek", &vars), "scripts/test3.zeek");
        assert_eq!(substitute_tokens("scripts/@NAME@.zeek", &vars), "scripts/test3.zeek");
        assert_eq!(substitute_tokens("plain.zeek", &vars), "plain.zeek");
    }

    #[test]
    fn unicode_values_pass_through() {
        let mut vars = BTreeMap::new();
        vars.insert("author".to_string(), "Bjørn Δοκιμή 测试".to_string());
        assert_eq!(substitute_tokens("by-@author@", &vars), "by-Bjørn Δοκιμή 测试");
    }

    #[test]
    fn needed_user_vars_follow_feature_selection() {
        let template = Template {
            dir: PathBuf::from("/nonexistent"),
            origin: "https://example.com/package-template".into(),
            version: Some("v1.0.0".into()),
            versions: vec!["v1.0.0".into()],
            spec: parse_spec(),
        };
        let needed = template.needed_user_vars(&[]);
        let names: Vec<&str> = needed.iter().map(|v| v.name()).collect();
        assert_eq!(names, vec!["name", "author"]);
    }
}
