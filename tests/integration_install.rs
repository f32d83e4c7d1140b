//! End-to-end install behavior against local git fixtures: dependency
//! ordering, alias conflicts, loader-index maintenance, and removal.

use zkg::core::ZkgError;
use zkg::manager::InstallOptions;
use zkg::resolver::Request;
use zkg::test_utils::{script_package_meta, TestEnvironment};

fn install_opts() -> InstallOptions {
    InstallOptions {
        force: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn install_stages_scripts_and_updates_loader_index() {
    let env = TestEnvironment::new();
    let repo = env.package_repo("foo", &script_package_meta());
    repo.tag("1.0.0");

    let mut manager = env.manager();
    manager
        .install(&[Request::new(repo.url(), "")], &install_opts())
        .await
        .unwrap();

    let layout = manager.layout().clone();
    assert!(layout.script_packages_dir().join("foo/main.zeek").is_file());
    assert!(layout.script_packages_dir().join("foo/__load__.zeek").is_file());

    let ipkg = manager.find_installed_package("foo").unwrap();
    assert_eq!(ipkg.status.current_version, "1.0.0");
    assert!(ipkg.status.is_loaded);

    let loader = std::fs::read_to_string(layout.autoload_script()).unwrap();
    assert_eq!(loader.matches("@load ./foo").count(), 1);
}

#[tokio::test]
async fn dependencies_build_before_dependers() {
    let env = TestEnvironment::new();
    let order_file = env.path().join("build-order");

    let baz = env.package_repo(
        "baz",
        &format!(
            "[package]\nscript_dir = scripts\nbuild_command = echo baz >> {}\n",
            order_file.display()
        ),
    );
    baz.tag("1.0.0");
    baz.write("scripts/extra.zeek", "# more\n");
    baz.commit("Second release");
    baz.tag("2.0.0");

    let bar = env.package_repo(
        "bar",
        &format!(
            "[package]\nscript_dir = scripts\nbuild_command = echo bar >> {}\ndepends =\n\tbaz >=1.0.0\n",
            order_file.display()
        ),
    );
    bar.tag("1.0.0");

    let foo = env.package_repo(
        "foo",
        &format!(
            "[package]\nscript_dir = scripts\nbuild_command = echo foo >> {}\ndepends =\n\tbar *\n",
            order_file.display()
        ),
    );

    let env_source = env.source_repo(
        "zeek",
        &[&baz.url(), &bar.url(), &foo.url()],
    );

    let mut manager = env.manager();
    manager.add_source("zeek", &env_source.url()).await.unwrap();
    manager
        .install(&[Request::new(foo.url(), "")], &install_opts())
        .await
        .unwrap();

    let order = std::fs::read_to_string(&order_file).unwrap();
    let lines: Vec<&str> = order.lines().collect();
    assert_eq!(lines, vec!["baz", "bar", "foo"]);

    // The highest satisfying tag wins for the transitive dependency.
    assert_eq!(
        manager.find_installed_package("baz").unwrap().status.current_version,
        "2.0.0"
    );
    assert_eq!(
        manager.find_installed_package("bar").unwrap().status.current_version,
        "1.0.0"
    );
    // The requested package had no tags, so it tracks the default branch.
    assert_eq!(
        manager.find_installed_package("foo").unwrap().status.current_version,
        "main"
    );
}

#[tokio::test]
async fn alias_conflicts_follow_install_order() {
    let env = TestEnvironment::new();
    let foo = env.package_repo("foo", "[package]\nscript_dir = scripts\naliases = bar\n");
    let baz = env.package_repo("baz", "[package]\nscript_dir = scripts\naliases = foo\n");
    let corge = env.package_repo("corge", "[package]\nscript_dir = scripts\naliases = bar\n");

    let mut manager = env.manager();
    let opts = install_opts();

    manager
        .install(&[Request::new(foo.url(), "")], &opts)
        .await
        .unwrap();

    for repo in [&baz, &corge] {
        let err = manager
            .install(&[Request::new(repo.url(), "")], &opts)
            .await
            .unwrap_err();
        let err = err.downcast::<ZkgError>().unwrap();
        assert!(matches!(err, ZkgError::AliasConflict { .. }), "{err}");
    }

    assert!(manager.remove("foo").await.unwrap());

    manager
        .install(&[Request::new(baz.url(), "")], &opts)
        .await
        .unwrap();
    manager
        .install(&[Request::new(corge.url(), "")], &opts)
        .await
        .unwrap();

    // foo's name now collides with baz's alias, and its alias with corge's.
    let err = manager
        .install(&[Request::new(foo.url(), "")], &opts)
        .await
        .unwrap_err();
    let err = err.downcast::<ZkgError>().unwrap();
    assert!(matches!(err, ZkgError::AliasConflict { .. }));
}

#[tokio::test]
async fn load_and_unload_are_idempotent() {
    let env = TestEnvironment::new();
    let repo = env.package_repo("foo", &script_package_meta());

    let mut manager = env.manager();
    manager
        .install(
            &[Request::new(repo.url(), "")],
            &InstallOptions {
                force: true,
                load: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let loader_path = manager.layout().autoload_script();
    assert!(!std::fs::read_to_string(&loader_path).unwrap().contains("@load ./foo"));

    manager.load("foo").unwrap();
    manager.load("foo").unwrap();
    let loader = std::fs::read_to_string(&loader_path).unwrap();
    assert_eq!(loader.matches("@load ./foo").count(), 1);

    assert!(manager.unload("foo").unwrap());
    assert!(manager.unload("foo").unwrap());
    let loader = std::fs::read_to_string(&loader_path).unwrap();
    assert_eq!(loader.matches("@load ./foo").count(), 0);
}

#[tokio::test]
async fn remove_deletes_artifacts_clone_and_manifest_entry() {
    let env = TestEnvironment::new();
    let repo = env.package_repo("foo", "[package]\nscript_dir = scripts\naliases = frob\n");

    let mut manager = env.manager();
    manager
        .install(&[Request::new(repo.url(), "")], &install_opts())
        .await
        .unwrap();

    let layout = manager.layout().clone();
    assert!(layout.script_packages_dir().join("foo").is_dir());
    assert!(layout.package_clonedir().join("foo").is_dir());

    assert!(manager.remove("foo").await.unwrap());

    assert!(!layout.script_packages_dir().join("foo").exists());
    assert!(!layout.package_clonedir().join("foo").exists());
    assert!(std::fs::symlink_metadata(layout.script_dir.join("frob")).is_err());
    assert!(manager.find_installed_package("foo").is_none());
    assert!(!std::fs::read_to_string(layout.autoload_script())
        .unwrap()
        .contains("foo"));

    // Removing again reports nothing to do.
    assert!(!manager.remove("foo").await.unwrap());
}

#[tokio::test]
async fn failed_plan_leaves_manifest_and_stage_untouched() {
    let env = TestEnvironment::new();
    let good = env.package_repo("good", &script_package_meta());
    let bad = env.package_repo(
        "bad",
        "[package]\nscript_dir = scripts\nbuild_command = false\n",
    );

    let mut manager = env.manager();
    manager
        .install(&[Request::new(good.url(), "")], &install_opts())
        .await
        .unwrap();

    let layout = manager.layout().clone();
    let manifest_before = std::fs::read(layout.manifest_path()).unwrap();
    let loader_before = std::fs::read(layout.autoload_script()).unwrap();

    let err = manager
        .install(&[Request::new(bad.url(), "")], &install_opts())
        .await
        .unwrap_err();
    let err = err.downcast::<ZkgError>().unwrap();
    assert!(matches!(err, ZkgError::BuildFailed { .. }));

    assert_eq!(std::fs::read(layout.manifest_path()).unwrap(), manifest_before);
    assert_eq!(std::fs::read(layout.autoload_script()).unwrap(), loader_before);
    assert!(!layout.script_packages_dir().join("bad").exists());
    assert!(layout.script_packages_dir().join("good").is_dir());
}
