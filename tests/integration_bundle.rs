//! Bundle round-trip: packing installed packages and reconstructing them
//! in a clean state directory without touching the network.

use zkg::manager::InstallOptions;
use zkg::platform::BuiltinCapability;
use zkg::resolver::Request;
use zkg::test_utils::{script_package_meta, TestEnvironment};

#[tokio::test]
async fn bundle_then_unbundle_reconstructs_the_package_set() {
    let env = TestEnvironment::new();
    let foo = env.package_repo("foo", &script_package_meta());
    foo.tag("1.0.0");
    let bar = env.package_repo("bar", &script_package_meta());

    let mut manager = env.manager();
    let opts = InstallOptions {
        force: true,
        ..Default::default()
    };
    manager
        .install(
            &[Request::new(foo.url(), "1.0.0"), Request::new(bar.url(), "")],
            &opts,
        )
        .await
        .unwrap();

    let bundle_file = env.path().join("packages.bundle");
    let digest = manager.bundle(&bundle_file, None, true).await.unwrap();
    assert_eq!(digest.len(), 64);

    let (manifest, info_digest) = manager.bundle_info(&bundle_file).unwrap();
    assert_eq!(info_digest, digest);
    assert_eq!(manifest.packages.len(), 2);

    // Unbundle into a fresh environment.
    let env2 = TestEnvironment::new();
    let mut manager2 = env2.manager();
    manager2.unbundle(&bundle_file).await.unwrap();

    let foo2 = manager2.find_installed_package("foo").unwrap();
    assert_eq!(foo2.status.current_version, "1.0.0");
    let bar2 = manager2.find_installed_package("bar").unwrap();
    assert_eq!(bar2.status.current_version, "main");

    assert!(manager2
        .layout()
        .script_packages_dir()
        .join("foo/main.zeek")
        .is_file());
    let loader = std::fs::read_to_string(manager2.layout().autoload_script()).unwrap();
    assert!(loader.contains("@load ./foo"));
    assert!(loader.contains("@load ./bar"));
}

#[tokio::test]
async fn bundle_records_builtin_capabilities_for_the_destination() {
    let env = TestEnvironment::new();
    let foo = env.package_repo("foo", &script_package_meta());

    let mut manager = env.manager_with_capabilities(vec![BuiltinCapability {
        name: "spicy-plugin".into(),
        version: "1.4.2".into(),
        commit: None,
    }]);
    manager
        .install(
            &[Request::new(foo.url(), "")],
            &InstallOptions {
                force: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let bundle_file = env.path().join("packages.bundle");
    manager.bundle(&bundle_file, None, true).await.unwrap();

    let (manifest, _) = manager.bundle_info(&bundle_file).unwrap();
    assert_eq!(manifest.packages.len(), 1);
    assert_eq!(
        manifest.builtin_packages,
        vec![("spicy-plugin".to_string(), "1.4.2".to_string())]
    );

    // A host without the capability still unbundles; the gap is a warning,
    // not a failure.
    let env2 = TestEnvironment::new();
    let mut manager2 = env2.manager();
    manager2.unbundle(&bundle_file).await.unwrap();
    assert!(manager2.find_installed_package("foo").is_some());
}

#[tokio::test]
async fn bundle_subset_via_manifest_list() {
    let env = TestEnvironment::new();
    let foo = env.package_repo("foo", &script_package_meta());
    foo.tag("1.0.0");
    let bar = env.package_repo("bar", &script_package_meta());

    let mut manager = env.manager();
    let opts = InstallOptions {
        force: true,
        ..Default::default()
    };
    manager
        .install(
            &[Request::new(foo.url(), ""), Request::new(bar.url(), "")],
            &opts,
        )
        .await
        .unwrap();

    let bundle_file = env.path().join("subset.bundle");
    manager
        .bundle(&bundle_file, Some(vec![(foo.url(), "1.0.0".to_string())]), true)
        .await
        .unwrap();

    let (manifest, _) = manager.bundle_info(&bundle_file).unwrap();
    assert_eq!(manifest.packages.len(), 1);
    assert!(manifest.packages[0].0.ends_with("foo"));
}
