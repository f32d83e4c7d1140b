//! User-variable resolution through the build pipeline: environment
//! variables feed `%(name)s` interpolation, and command-line overrides
//! beat the environment.

use zkg::manager::InstallOptions;
use zkg::resolver::Request;
use zkg::test_utils::TestEnvironment;

fn opts() -> InstallOptions {
    InstallOptions {
        force: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn environment_supplies_declared_user_vars() {
    std::env::set_var("LAST_VAR", "/home/x/sandbox");

    let env = TestEnvironment::new();
    let repo = env.package_repo(
        "frob",
        "[package]\nscript_dir = scripts\nuser_vars =\n\tLAST_VAR [] \"sandbox path\"\nbuild_command = echo sandbox at %(LAST_VAR)s\n",
    );

    let mut manager = env.manager();
    manager
        .install(&[Request::new(repo.url(), "")], &opts())
        .await
        .unwrap();

    let log = std::fs::read_to_string(manager.layout().build_log("frob")).unwrap();
    assert!(log.contains("/home/x/sandbox"), "log was: {log}");
}

#[tokio::test]
async fn cli_overrides_beat_the_environment() {
    std::env::set_var("OVERRIDE_VAR", "/from-env");

    let env = TestEnvironment::new();
    let repo = env.package_repo(
        "frob2",
        "[package]\nscript_dir = scripts\nuser_vars =\n\tOVERRIDE_VAR [] \"a path\"\n\tTEST_VAR [fallback] \"another\"\nbuild_command = echo %(OVERRIDE_VAR)s and %(TEST_VAR)s\n",
    );

    let mut manager = env.manager();
    manager.set_user_var_overrides(
        [("OVERRIDE_VAR".to_string(), "/home/x/sandbox2".to_string())]
            .into_iter()
            .collect(),
    );
    manager
        .install(&[Request::new(repo.url(), "")], &opts())
        .await
        .unwrap();

    let log = std::fs::read_to_string(manager.layout().build_log("frob2")).unwrap();
    assert!(log.contains("/home/x/sandbox2"), "log was: {log}");
    assert!(!log.contains("/from-env"), "log was: {log}");
    // The declared default filled the variable nothing else supplied.
    assert!(log.contains("fallback"), "log was: {log}");
}

#[tokio::test]
async fn unresolved_interpolation_is_a_metadata_error() {
    let env = TestEnvironment::new();
    let repo = env.package_repo(
        "frob3",
        "[package]\nscript_dir = scripts\nbuild_command = echo %(NEVER_DECLARED_ANYWHERE)s\n",
    );

    let mut manager = env.manager();
    let err = manager
        .install(&[Request::new(repo.url(), "")], &opts())
        .await
        .unwrap_err();
    let err = err.downcast::<zkg::core::ZkgError>().unwrap();
    assert!(matches!(err, zkg::core::ZkgError::BadMetadata { .. }), "{err}");
    assert!(err.to_string().contains("NEVER_DECLARED_ANYWHERE"));
}
