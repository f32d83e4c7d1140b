//! Upgrade behavior: pin safety, version-constraint conflicts against
//! installed packages, and the test-failure asymmetry between `--force`
//! and `--skiptests`.

use zkg::core::ZkgError;
use zkg::manager::InstallOptions;
use zkg::resolver::Request;
use zkg::test_utils::{script_package_meta, TestEnvironment};

fn opts(skiptests: bool, force: bool) -> InstallOptions {
    InstallOptions {
        skiptests,
        force,
        ..Default::default()
    }
}

#[tokio::test]
async fn pinned_packages_are_never_upgraded() {
    let env = TestEnvironment::new();
    let repo = env.package_repo("foo", &script_package_meta());
    repo.tag("1.0.0");

    let mut manager = env.manager();
    manager
        .install(&[Request::new(repo.url(), "1.0.0")], &opts(true, true))
        .await
        .unwrap();
    manager.pin("foo").unwrap();

    repo.write("scripts/new.zeek", "# v2\n");
    repo.commit("Second release");
    repo.tag("2.0.0");

    let err = manager.upgrade("foo", &opts(true, true)).await.unwrap_err();
    assert!(err.to_string().contains("pinned"));
    assert_eq!(
        manager.find_installed_package("foo").unwrap().status.current_version,
        "1.0.0"
    );

    manager.unpin("foo").unwrap();
    manager.upgrade("foo", &opts(true, true)).await.unwrap();
    assert_eq!(
        manager.find_installed_package("foo").unwrap().status.current_version,
        "2.0.0"
    );
}

#[tokio::test]
async fn installed_pinned_dependency_blocks_conflicting_request() {
    let env = TestEnvironment::new();

    let bar = env.package_repo("bar", &script_package_meta());
    bar.tag("1.0.0");
    bar.write("scripts/two.zeek", "# v2\n");
    bar.commit("Second release");
    bar.tag("2.0.0");

    let foo = env.package_repo(
        "foo",
        &format!("[package]\nscript_dir = scripts\ndepends =\n\t{} =2.0.0\n", bar.url()),
    );
    foo.tag("2.0.0");

    let mut manager = env.manager();
    manager
        .install(&[Request::new(bar.url(), "1.0.0")], &opts(true, true))
        .await
        .unwrap();
    manager.pin("bar").unwrap();

    let err = manager
        .install(&[Request::new(foo.url(), "2.0.0")], &opts(true, true))
        .await
        .unwrap_err();
    let err = err.downcast::<ZkgError>().unwrap();
    assert!(matches!(err, ZkgError::VersionResolution { .. }), "{err}");

    // Installed set unchanged.
    assert!(manager.find_installed_package("foo").is_none());
    assert_eq!(
        manager.find_installed_package("bar").unwrap().status.current_version,
        "1.0.0"
    );
}

#[tokio::test]
async fn failing_tests_block_upgrade_unless_skipped() {
    let env = TestEnvironment::new();
    let repo = env.package_repo("foo", &script_package_meta());
    repo.tag("1.0.0");

    let mut manager = env.manager();
    manager
        .install(&[Request::new(repo.url(), "1.0.0")], &opts(true, true))
        .await
        .unwrap();

    // The new version ships a failing test suite.
    repo.write(
        "zkg.meta",
        "[package]\nscript_dir = scripts\ntest_command = false\n",
    );
    repo.write("scripts/new.zeek", "# v2\n");
    repo.commit("Second release, tests fail");
    repo.tag("2.0.0");

    // --force alone refuses; the old version stays.
    let err = manager.upgrade("foo", &opts(false, true)).await.unwrap_err();
    let err = err.downcast::<ZkgError>().unwrap();
    assert!(matches!(err, ZkgError::TestFailed { .. }), "{err}");
    assert_eq!(
        manager.find_installed_package("foo").unwrap().status.current_version,
        "1.0.0"
    );

    // --force --skiptests applies the upgrade.
    manager.upgrade("foo", &opts(true, true)).await.unwrap();
    let ipkg = manager.find_installed_package("foo").unwrap();
    assert_eq!(ipkg.status.current_version, "2.0.0");

    // The loader index reflects the still-loaded, upgraded package.
    let loader = std::fs::read_to_string(manager.layout().autoload_script()).unwrap();
    assert_eq!(loader.matches("@load ./foo").count(), 1);
    assert!(manager
        .layout()
        .script_packages_dir()
        .join("foo/new.zeek")
        .is_file());
}

#[tokio::test]
async fn upgrade_is_a_noop_when_current() {
    let env = TestEnvironment::new();
    let repo = env.package_repo("foo", &script_package_meta());
    repo.tag("1.0.0");

    let mut manager = env.manager();
    manager
        .install(&[Request::new(repo.url(), "")], &opts(true, true))
        .await
        .unwrap();

    manager.upgrade("foo", &opts(true, true)).await.unwrap();
    assert_eq!(
        manager.find_installed_package("foo").unwrap().status.current_version,
        "1.0.0"
    );
}
