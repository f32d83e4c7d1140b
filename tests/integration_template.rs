//! Package creation from a template repository: rendering, feature
//! overlays, metadata stamping, and installability of the result.

use zkg::manager::InstallOptions;
use zkg::resolver::Request;
use zkg::test_utils::{GitRepoFixture, TestEnvironment};

fn make_template(env: &TestEnvironment) -> GitRepoFixture {
    let repo = GitRepoFixture::init(env.path().join("templates").join("package-template"));
    repo.write(
        "zkg.template",
        "[template]\napi_version = 1.0.0\nuser_vars =\n\tname [] \"The name of the package\"\n\tauthor [anonymous] \"Author\"\n\n[package]\ndirectory = package\nrequires = name author\n\n[feature:readme]\ndirectory = features/readme\nrequires = name\n\n[validators]\nname = ^[A-Za-z_][A-Za-z0-9_.-]*$\n",
    );
    repo.write(
        "package/zkg.meta",
        "[package]\ndescription = The {{ name }} package\nscript_dir = scripts\n",
    );
    repo.write("package/scripts/__load__.zeek", "@load ./main\n");
    repo.write(
        "package/scripts/main.zeek",
        "module {{ name }};\n\nevent zeek_init()\n\t{\n\t}\n",
    );
    repo.write("features/readme/README", "# {{ name }}\n\nBy {{ author }}.\n");
    repo.commit("Template skeleton");
    repo.tag("v1.0.0");
    repo
}

fn template_url(repo: &GitRepoFixture) -> String {
    format!("file://{}", repo.dir.display())
}

fn ensure_git_identity() {
    std::env::set_var("GIT_AUTHOR_NAME", "Tester");
    std::env::set_var("GIT_AUTHOR_EMAIL", "tester@example.com");
    std::env::set_var("GIT_COMMITTER_NAME", "Tester");
    std::env::set_var("GIT_COMMITTER_EMAIL", "tester@example.com");
}

#[tokio::test]
async fn create_renders_features_and_records_provenance() {
    ensure_git_identity();
    let env = TestEnvironment::new();
    let template = make_template(&env);

    let mut manager = env.manager();
    manager.set_user_var_overrides(
        [("name".to_string(), "test3".to_string())].into_iter().collect(),
    );

    let packagedir = env.path().join("out").join("test3");
    manager
        .create(
            &packagedir,
            Some(&template_url(&template)),
            None,
            &["readme".to_string()],
            false,
        )
        .await
        .unwrap();

    assert!(packagedir.join("README").is_file());
    let readme = std::fs::read_to_string(packagedir.join("README")).unwrap();
    assert!(readme.contains("# test3"));
    assert!(readme.contains("By anonymous."));

    let main = std::fs::read_to_string(packagedir.join("scripts/main.zeek")).unwrap();
    assert!(main.contains("module test3;"));

    let meta = std::fs::read_to_string(packagedir.join("zkg.meta")).unwrap();
    assert!(meta.contains("[template]"));
    assert!(meta.contains("source = "));
    assert!(meta.contains("version = v1.0.0"));
    assert!(meta.contains(&format!("zkg_version = {}", zkg::VERSION)));
    assert!(meta.contains("features = readme"));
    assert!(meta.contains("[template_vars]"));
    assert!(meta.contains("name = test3"));

    // The created directory is a git repository with an initial commit.
    assert!(packagedir.join(".git").is_dir());

    // The created package installs cleanly.
    manager
        .install(
            &[Request::new(packagedir.display().to_string(), "")],
            &InstallOptions {
                force: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(manager.find_installed_package("test3").is_some());
}

#[tokio::test]
async fn create_refuses_existing_directory_without_force() {
    ensure_git_identity();
    let env = TestEnvironment::new();
    let template = make_template(&env);

    let mut manager = env.manager();
    manager.set_user_var_overrides(
        [("name".to_string(), "taken".to_string())].into_iter().collect(),
    );

    let packagedir = env.path().join("out").join("taken");
    std::fs::create_dir_all(&packagedir).unwrap();
    std::fs::write(packagedir.join("existing"), "do not clobber").unwrap();

    let err = manager
        .create(&packagedir, Some(&template_url(&template)), None, &[], false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("--force"), "{err}");

    manager
        .create(&packagedir, Some(&template_url(&template)), None, &[], true)
        .await
        .unwrap();
    assert!(packagedir.join("scripts/main.zeek").is_file());
}

#[tokio::test]
async fn create_fails_on_unresolved_required_variable() {
    ensure_git_identity();
    let env = TestEnvironment::new();
    let template = make_template(&env);

    let mut manager = env.manager();
    // No override, no env, no persisted answer, and "name" has no default.
    let packagedir = env.path().join("out").join("unnamed");
    let err = manager
        .create(&packagedir, Some(&template_url(&template)), None, &[], false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("name"), "{err}");
    assert!(!packagedir.exists());
}

#[tokio::test]
async fn unicode_variable_values_pass_through_verbatim() {
    ensure_git_identity();
    let env = TestEnvironment::new();
    let template = make_template(&env);

    let mut manager = env.manager();
    manager.set_user_var_overrides(
        [
            ("name".to_string(), "unicode_pkg".to_string()),
            ("author".to_string(), "Bjørn Δοκιμή 测试".to_string()),
        ]
        .into_iter()
        .collect(),
    );

    let packagedir = env.path().join("out").join("unicode_pkg");
    manager
        .create(
            &packagedir,
            Some(&template_url(&template)),
            None,
            &["readme".to_string()],
            false,
        )
        .await
        .unwrap();

    let readme = std::fs::read_to_string(packagedir.join("README")).unwrap();
    assert!(readme.contains("Bjørn Δοκιμή 测试"));
}
