//! The version solver: turns a set of requests plus the installed state
//! into an ordered, conflict-free plan.
//!
//! The algorithm is iterative expansion over a dependency graph:
//!
//! 1. Seed nodes for the requested packages, then expand transitively
//!    through their `depends` (and `suggests`, unless ignored) fields.
//! 2. Seed nodes for everything already installed (each contributing an
//!    `==installed` constraint), plus synthetic nodes for the platform and
//!    the manager whose versions come from the runtime, not any package.
//! 3. Fill in constraint edges, then walk the graph from the requests,
//!    checking requested/installed versions against all dependers and
//!    choosing the best candidate (highest satisfying tag, else the agreed
//!    branch tip) for nodes that are new.
//!
//! Built-in platform capabilities are consulted only after installed
//! packages: an installed package of the same name wins; a capability that
//! exists at the wrong version is reported as an unsatisfiable constraint.
//!
//! The output lists only the *additional* packages to install, ordered
//! dependency-first so dependers observe their dependencies already staged.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::ZkgError;
use crate::meta::{classify_dependency, DependencyName};
use crate::package::{InstalledPackage, PackageInfo};
use crate::version::{coerce_version, PackageVersion, TrackingMethod, VersionSpec};

/// Where the solver gets package facts from. Implemented by the manager;
/// tests substitute a canned provider.
#[async_trait]
pub trait PackageProvider: Send + Sync {
    /// Look up a package by path/name/URL, with metadata at `version`
    /// (empty string means the best available version).
    async fn package_info(
        &self,
        pkg_path: &str,
        version: &str,
        prefer_installed: bool,
    ) -> Result<PackageInfo>;

    /// A built-in platform capability matching `name`, if any.
    fn find_builtin(&self, name: &str) -> Option<PackageInfo>;

    /// Everything currently installed (built-in capabilities included).
    fn installed_packages(&self) -> Vec<InstalledPackage>;

    /// The platform version, when discoverable.
    fn platform_version(&self) -> Option<String>;

    /// This engine's own version.
    fn manager_version(&self) -> String;
}

/// One install/upgrade request: a package path and an optional version.
#[derive(Debug, Clone)]
pub struct Request {
    pub path: String,
    /// Empty means "best available".
    pub version: String,
}

impl Request {
    pub fn new(path: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: version.into(),
        }
    }
}

/// Solver knobs.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Treat nothing as installed (used by `test`, which stages fresh).
    pub ignore_installed: bool,
    /// Skip `suggests` edges entirely.
    pub ignore_suggestions: bool,
    /// Consult built-in platform capabilities.
    pub use_builtin: bool,
}

/// One resolved dependency the plan must install.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub info: PackageInfo,
    pub version: String,
    pub is_suggestion: bool,
}

impl PlanEntry {
    /// Built-in capabilities satisfy constraints without any clone.
    pub fn is_builtin(&self) -> bool {
        self.info.package.is_builtin()
    }
}

/// The solver's answer: additional packages in dependency-first order.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
}

#[derive(Debug)]
struct Node {
    name: String,
    info: Option<PackageInfo>,
    requested_version: Option<PackageVersion>,
    installed_version: Option<PackageVersion>,
    /// depender name -> constraint that depender places on this node
    dependers: BTreeMap<String, String>,
    /// dependee name -> constraint this node places on it
    dependees: BTreeMap<String, String>,
    is_suggestion: bool,
}

impl Node {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            info: None,
            requested_version: None,
            installed_version: None,
            dependers: BTreeMap::new(),
            dependees: BTreeMap::new(),
            is_suggestion: false,
        }
    }
}

const PLATFORM_NODE: &str = "zeek";
const MANAGER_NODE: &str = "zkg";

/// Resolve `requests` against the provider's view of the world.
pub async fn resolve(
    provider: &dyn PackageProvider,
    requests: &[Request],
    opts: &ResolveOptions,
) -> Result<Plan> {
    let mut graph: BTreeMap<String, Node> = BTreeMap::new();
    let mut request_names: Vec<String> = Vec::new();

    // 1. Nodes for the requested packages.
    for request in requests {
        let info = provider
            .package_info(&request.path, &request.version, false)
            .await?;
        let name = info.package.qualified_name();
        let version = if request.version.is_empty() {
            info.best_version()
        } else {
            request.version.clone()
        };
        let method = info.version_kind(&version);

        let mut node = Node::new(&name);
        node.requested_version = Some(PackageVersion::new(method, version));
        node.info = Some(info);
        request_names.push(name.clone());
        graph.insert(name, node);
    }

    // Transitively expand dependencies of everything in the graph.
    let mut to_process: VecDeque<String> = graph.keys().cloned().collect();
    while let Some(name) = to_process.pop_front() {
        let (depends, suggests) = node_dependencies(&graph[&name], opts)?;
        let node_is_suggestion = graph[&name].is_suggestion;

        let mut all_deps = depends.clone();
        all_deps.extend(suggests.clone());

        for (dep_name, _) in all_deps {
            match classify_dependency(&dep_name) {
                DependencyName::Platform | DependencyName::Manager => continue,
                DependencyName::Package(_) => {}
            }

            // Suggestion status propagates through the suggests edge.
            let is_suggestion = node_is_suggestion
                || (suggests.iter().any(|(n, _)| *n == dep_name)
                    && !depends.iter().any(|(n, _)| *n == dep_name));

            // An installed package of this name wins over a built-in
            // capability; the capability wins over cloning from a source.
            let installed_match = provider
                .installed_packages()
                .into_iter()
                .find(|ipkg| !ipkg.is_builtin() && ipkg.package.matches_path(&dep_name));

            let info = if let Some(ipkg) = installed_match {
                provider
                    .package_info(&ipkg.package.qualified_name(), "", true)
                    .await
            } else if let Some(builtin) = opts
                .use_builtin
                .then(|| provider.find_builtin(&dep_name))
                .flatten()
            {
                Ok(builtin)
            } else {
                provider.package_info(&dep_name, "", false).await
            };

            let info = info.map_err(|e| {
                ZkgError::dependency(format!(
                    "package \"{name}\" has invalid dependency \"{dep_name}\": {e}"
                ))
            })?;

            let resolved = info.package.qualified_name();
            debug!(dep = %dep_name, of = %name, resolved = %resolved, "dependency resolved");

            if let Some(existing) = graph.get_mut(&resolved) {
                if existing.is_suggestion && !is_suggestion {
                    // A suggestion turned out to be required elsewhere.
                    existing.is_suggestion = false;
                }
                continue;
            }

            let mut node = Node::new(&resolved);
            node.info = Some(info);
            node.is_suggestion = is_suggestion;
            graph.insert(resolved.clone(), node);
            to_process.push_back(resolved);
        }
    }

    // 2. Nodes for everything already installed, plus platform and manager.
    if !opts.ignore_installed {
        match provider.platform_version() {
            Some(version) => {
                let mut node = Node::new(PLATFORM_NODE);
                node.installed_version =
                    Some(PackageVersion::new(TrackingMethod::Version, version));
                graph.insert(PLATFORM_NODE.to_string(), node);
            }
            None => warn!("could not determine platform version: no \"zeek-config\" in PATH?"),
        }

        let mut node = Node::new(MANAGER_NODE);
        node.installed_version = Some(PackageVersion::new(
            TrackingMethod::Version,
            provider.manager_version(),
        ));
        graph.insert(MANAGER_NODE.to_string(), node);

        for ipkg in provider.installed_packages() {
            let name = ipkg.package.qualified_name();
            if !graph.contains_key(&name) {
                let info = if ipkg.is_builtin() {
                    provider
                        .find_builtin(&ipkg.package.name)
                        .unwrap_or_else(|| crate::package::make_builtin_package(
                            &ipkg.package.name,
                            &ipkg.status.current_version,
                            None,
                        ))
                } else {
                    provider.package_info(&name, "", true).await?
                };
                let mut node = Node::new(&name);
                node.info = Some(info);
                graph.insert(name.clone(), node);
            }
            graph.get_mut(&name).expect("just inserted").installed_version =
                ipkg.status.package_version();
        }
    }

    // 3. Constraint edges.
    let names: Vec<String> = graph.keys().cloned().collect();
    for name in &names {
        if name == PLATFORM_NODE || name == MANAGER_NODE {
            continue;
        }
        let (depends, suggests) = node_dependencies(&graph[name], opts)?;
        let mut all_deps = depends;
        all_deps.extend(suggests);

        for (dep_name, dep_spec) in all_deps {
            let target = match classify_dependency(&dep_name) {
                DependencyName::Platform => graph.contains_key(PLATFORM_NODE).then(|| PLATFORM_NODE.to_string()),
                DependencyName::Manager => graph.contains_key(MANAGER_NODE).then(|| MANAGER_NODE.to_string()),
                DependencyName::Package(_) => names
                    .iter()
                    .find(|candidate| {
                        *candidate != PLATFORM_NODE
                            && *candidate != MANAGER_NODE
                            && graph[*candidate]
                                .info
                                .as_ref()
                                .map(|i| i.package.matches_path(&dep_name))
                                .unwrap_or(false)
                    })
                    .cloned(),
            };

            if let Some(target) = target {
                graph
                    .get_mut(&target)
                    .expect("target from names")
                    .dependers
                    .insert(name.clone(), dep_spec.clone());
                graph
                    .get_mut(name)
                    .expect("name from names")
                    .dependees
                    .insert(target, dep_spec);
            }
        }
    }

    detect_cycles(&graph)?;

    // 4. Walk from the requests, checking constraints and picking versions.
    let mut queue: VecDeque<String> = request_names.iter().cloned().collect();
    let mut new_entries: Vec<PlanEntry> = Vec::new();

    while let Some(name) = queue.pop_front() {
        let dependees: Vec<String> = graph[&name].dependees.keys().cloned().collect();
        // Traverse each node's out-edges only once.
        graph.get_mut(&name).expect("queued node exists").dependees.clear();
        queue.extend(dependees);

        let node = &graph[&name];

        if node.dependers.is_empty() {
            if node.installed_version.is_some() || node.requested_version.is_some() {
                // Installed packages nothing depends on need no action, and
                // requested packages are handled by the caller.
                continue;
            }
            let info = node.info.clone().expect("package node carries info");
            let version = info.best_version();
            push_entry(&mut new_entries, info, version, node.is_suggestion);
            continue;
        }

        if let Some(requested) = &node.requested_version {
            for (depender, spec) in &node.dependers {
                if let Err(msg) = requested.fulfills(spec) {
                    return Err(ZkgError::dependency(format!(
                        "unsatisfiable dependency: requested \"{name}\" ({}), but \
                         \"{depender}\" requires {spec} ({msg})",
                        requested.version
                    ))
                    .into());
                }
            }
        } else if let Some(installed) = &node.installed_version {
            for (depender, spec) in &node.dependers {
                if let Err(msg) = installed.fulfills(spec) {
                    return Err(ZkgError::VersionResolution {
                        package: name.clone(),
                        reason: format!(
                            "\"{name}\" ({}) is installed, but \"{depender}\" requires \
                             {spec} ({msg})",
                            installed.version
                        ),
                    }
                    .into());
                }
            }
        } else {
            let info = node.info.clone().expect("package node carries info");
            let version = choose_version(&name, node, &info)?;
            push_entry(&mut new_entries, info, version, node.is_suggestion);
        }
    }

    // Deduplicate, keeping the deepest occurrence of each package, then
    // reverse so the result reads dependency-first.
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut entries: Vec<PlanEntry> = Vec::new();
    for entry in new_entries.into_iter().rev() {
        if seen.insert(entry.info.package.name.clone()) {
            entries.push(entry);
        }
    }

    Ok(Plan { entries })
}

fn push_entry(entries: &mut Vec<PlanEntry>, info: PackageInfo, version: String, is_suggestion: bool) {
    entries.push(PlanEntry {
        info,
        version,
        is_suggestion,
    });
}

/// Parsed (depends, suggests) of a node; empty for synthetic nodes.
fn node_dependencies(
    node: &Node,
    opts: &ResolveOptions,
) -> Result<(Vec<(String, String)>, Vec<(String, String)>)> {
    let Some(info) = &node.info else {
        return Ok((Vec::new(), Vec::new()));
    };
    let depends = info.depends().map_err(|reason| {
        ZkgError::bad_metadata(&node.name, format!("malformed \"depends\" field: {reason}"))
    })?;
    let suggests = if opts.ignore_suggestions {
        Vec::new()
    } else {
        info.suggests().map_err(|reason| {
            ZkgError::bad_metadata(&node.name, format!("malformed \"suggests\" field: {reason}"))
        })?
    };
    Ok((depends, suggests))
}

/// Pick the best version for a node that is neither requested nor
/// installed, honoring all depender constraints.
fn choose_version(name: &str, node: &Node, info: &PackageInfo) -> Result<String> {
    let mut need_branch = false;
    let mut need_version = false;

    for (depender, spec) in &node.dependers {
        match VersionSpec::parse(spec) {
            Ok(VersionSpec::Branch(_)) => need_branch = true,
            Ok(VersionSpec::Range(_)) => need_version = true,
            Ok(VersionSpec::Any) => {}
            Err(reason) => {
                return Err(ZkgError::dependency(format!(
                    "package \"{depender}\" has invalid constraint on \"{name}\": {reason}"
                ))
                .into());
            }
        }
    }

    if need_branch && need_version {
        return Err(no_satisfying_version(name, node).into());
    }

    if need_branch {
        let mut branch_name: Option<String> = None;
        for (_, spec) in &node.dependers {
            if let Ok(VersionSpec::Branch(branch)) = VersionSpec::parse(spec) {
                match &branch_name {
                    None => branch_name = Some(branch),
                    Some(existing) if *existing != branch => {
                        return Err(no_satisfying_version(name, node).into());
                    }
                    Some(_) => {}
                }
            }
        }
        return Ok(branch_name.unwrap_or_else(|| info.default_branch.clone()));
    }

    if need_version {
        for candidate in info.versions.iter().rev() {
            let Ok(version) = coerce_version(candidate) else {
                continue;
            };
            let satisfied = node.dependers.iter().all(|(_, spec)| {
                matches!(VersionSpec::parse(spec), Ok(VersionSpec::Range(req)) if req.matches(&version))
                    || matches!(VersionSpec::parse(spec), Ok(VersionSpec::Any))
            });
            if satisfied {
                return Ok(candidate.clone());
            }
        }
        return Err(no_satisfying_version(name, node).into());
    }

    Ok(info.best_version())
}

fn no_satisfying_version(name: &str, node: &Node) -> ZkgError {
    let mut constraints = String::new();
    for (depender, spec) in &node.dependers {
        constraints.push_str(&format!("\n\t\"{depender}\" requires: \"{spec}\""));
    }
    ZkgError::VersionResolution {
        package: name.to_string(),
        reason: format!("no version satisfies dependencies:{constraints}"),
    }
}

/// The dependency graph must be a DAG; report any cycle as a
/// [`ZkgError::Dependency`] naming the chain.
fn detect_cycles(graph: &BTreeMap<String, Node>) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();

    fn visit<'a>(
        graph: &'a BTreeMap<String, Node>,
        name: &'a str,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                let mut chain: Vec<&str> = stack[start..].to_vec();
                chain.push(name);
                return Err(ZkgError::dependency(format!(
                    "circular dependency detected: {}",
                    chain.join(" -> ")
                ))
                .into());
            }
            None => {}
        }
        marks.insert(name, Mark::InProgress);
        stack.push(name);
        if let Some(node) = graph.get(name) {
            for dependee in node.dependees.keys() {
                visit(graph, dependee, marks, stack)?;
            }
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let mut stack = Vec::new();
    for name in graph.keys() {
        visit(graph, name, &mut marks, &mut stack)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::PackageMetadata;
    use crate::package::{Package, PackageStatus};
    use std::collections::BTreeMap as Map;

    /// Canned provider over a fixed package universe.
    struct FakeProvider {
        packages: Map<String, PackageInfo>,
        installed: Vec<InstalledPackage>,
        builtins: Map<String, PackageInfo>,
        platform_version: Option<String>,
    }

    impl FakeProvider {
        fn new() -> Self {
            Self {
                packages: Map::new(),
                installed: Vec::new(),
                builtins: Map::new(),
                platform_version: Some("6.0.0".into()),
            }
        }

        fn add_package(&mut self, name: &str, versions: &[&str], fields: &[(&str, &str)]) {
            let url = format!("https://example.com/alice/{name}");
            let mut package = Package::from_source(&url, "zeek", "alice");
            let field_map: Map<String, String> = fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            package.metadata = field_map.clone();
            let info = PackageInfo {
                package,
                status: None,
                metadata: PackageMetadata::from_fields(field_map),
                versions: versions.iter().map(|v| v.to_string()).collect(),
                default_branch: "main".into(),
                metadata_version: versions.last().unwrap_or(&"main").to_string(),
            };
            self.packages.insert(name.to_string(), info);
        }

        fn mark_installed(&mut self, name: &str, version: &str, pinned: bool) {
            let info = self.packages.get(name).expect("package exists").clone();
            let method = info.version_kind(version);
            self.installed.push(InstalledPackage {
                package: info.package.clone(),
                status: PackageStatus {
                    is_loaded: false,
                    is_pinned: pinned,
                    is_outdated: false,
                    tracking_method: Some(method),
                    current_version: version.to_string(),
                    current_hash: String::new(),
                },
            });
        }
    }

    #[async_trait]
    impl PackageProvider for FakeProvider {
        async fn package_info(
            &self,
            pkg_path: &str,
            _version: &str,
            _prefer_installed: bool,
        ) -> Result<PackageInfo> {
            let name = crate::package::name_from_path(pkg_path);
            self.packages
                .get(&name)
                .cloned()
                .ok_or_else(|| ZkgError::dependency(format!("no such package: {pkg_path}")).into())
        }

        fn find_builtin(&self, name: &str) -> Option<PackageInfo> {
            self.builtins.get(name).cloned()
        }

        fn installed_packages(&self) -> Vec<InstalledPackage> {
            self.installed.clone()
        }

        fn platform_version(&self) -> Option<String> {
            self.platform_version.clone()
        }

        fn manager_version(&self) -> String {
            "3.0.0".into()
        }
    }

    fn requests(specs: &[(&str, &str)]) -> Vec<Request> {
        specs.iter().map(|(p, v)| Request::new(*p, *v)).collect()
    }

    #[tokio::test]
    async fn transitive_chain_resolves_in_dependency_order() {
        let mut provider = FakeProvider::new();
        provider.add_package("baz", &["1.0.0", "2.0.0"], &[]);
        provider.add_package("bar", &["1.0.0"], &[("depends", "baz >=1.0.0")]);
        provider.add_package("foo", &[], &[("depends", "bar *")]);

        let plan = resolve(&provider, &requests(&[("foo", "")]), &ResolveOptions {
            use_builtin: true,
            ..Default::default()
        })
        .await
        .unwrap();

        let names: Vec<&str> = plan.entries.iter().map(|e| e.info.package.name.as_str()).collect();
        assert_eq!(names, vec!["baz", "bar"]);
        assert_eq!(plan.entries[0].version, "2.0.0");
        assert_eq!(plan.entries[1].version, "1.0.0");
    }

    #[tokio::test]
    async fn pinned_installed_version_conflicts() {
        let mut provider = FakeProvider::new();
        provider.add_package("bar", &["1.0.0", "2.0.0"], &[]);
        provider.add_package("foo", &["1.0.0", "2.0.0"], &[("depends", "bar =2.0.0")]);
        provider.mark_installed("bar", "1.0.0", true);

        let err = resolve(&provider, &requests(&[("foo", "2.0.0")]), &ResolveOptions {
            use_builtin: true,
            ..Default::default()
        })
        .await
        .unwrap_err();

        let err = err.downcast::<ZkgError>().unwrap();
        let msg = err.to_string();
        assert!(matches!(err, ZkgError::VersionResolution { .. }), "{msg}");
        assert!(msg.contains("bar"));
        assert!(msg.contains("foo"));
    }

    #[tokio::test]
    async fn platform_version_constraint_blocks_plan() {
        let mut provider = FakeProvider::new();
        provider.add_package("foo", &["1.0.0"], &[("depends", "zeek >=7.0.0")]);

        let err = resolve(&provider, &requests(&[("foo", "")]), &ResolveOptions {
            use_builtin: true,
            ..Default::default()
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("zeek"));
    }

    #[tokio::test]
    async fn builtin_capability_satisfies_without_clone() {
        let mut provider = FakeProvider::new();
        provider.add_package("foo", &["1.0.0"], &[("depends", "spicy-plugin >=1.0.0")]);
        provider.builtins.insert(
            "spicy-plugin".to_string(),
            crate::package::make_builtin_package("spicy-plugin", "1.4.2", None),
        );

        let plan = resolve(&provider, &requests(&[("foo", "")]), &ResolveOptions {
            use_builtin: true,
            ..Default::default()
        })
        .await
        .unwrap();

        // The capability satisfies the constraint; nothing new to install.
        assert!(plan.entries.iter().all(|e| !e.info.package.name.contains("spicy")) || plan
            .entries
            .iter()
            .any(|e| e.is_builtin()));
    }

    #[tokio::test]
    async fn builtin_capability_at_wrong_version_is_unsatisfiable() {
        let mut provider = FakeProvider::new();
        provider.add_package("foo", &["1.0.0"], &[("depends", "spicy-plugin >=2.0.0")]);
        provider.builtins.insert(
            "spicy-plugin".to_string(),
            crate::package::make_builtin_package("spicy-plugin", "1.4.2", None),
        );
        // The capability name matches but its version cannot satisfy, and no
        // real package of that name exists.
        let err = resolve(&provider, &requests(&[("foo", "")]), &ResolveOptions {
            use_builtin: true,
            ..Default::default()
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("spicy-plugin"));
    }

    #[tokio::test]
    async fn conflicting_branch_constraints_fail() {
        let mut provider = FakeProvider::new();
        provider.add_package("dep", &[], &[]);
        provider.add_package("a", &[], &[("depends", "dep branch=dev")]);
        provider.add_package("b", &[], &[("depends", "dep branch=main")]);

        let err = resolve(
            &provider,
            &requests(&[("a", ""), ("b", "")]),
            &ResolveOptions {
                use_builtin: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        let err = err.downcast::<ZkgError>().unwrap();
        assert!(matches!(err, ZkgError::VersionResolution { .. }));
    }

    #[tokio::test]
    async fn circular_dependencies_are_detected() {
        let mut provider = FakeProvider::new();
        provider.add_package("ping", &[], &[("depends", "pong *")]);
        provider.add_package("pong", &[], &[("depends", "ping *")]);

        let err = resolve(&provider, &requests(&[("ping", "")]), &ResolveOptions {
            use_builtin: true,
            ..Default::default()
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[tokio::test]
    async fn suggestions_are_included_unless_ignored() {
        let mut provider = FakeProvider::new();
        provider.add_package("extra", &["1.0.0"], &[]);
        provider.add_package("foo", &["1.0.0"], &[("suggests", "extra *")]);

        let plan = resolve(&provider, &requests(&[("foo", "")]), &ResolveOptions {
            use_builtin: true,
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(plan.entries.len(), 1);
        assert!(plan.entries[0].is_suggestion);

        let plan = resolve(&provider, &requests(&[("foo", "")]), &ResolveOptions {
            use_builtin: true,
            ignore_suggestions: true,
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(plan.entries.is_empty());
    }
}
