//! Integration tests for building testset trees from definition files.

use std::fs;
use std::path::{Path, PathBuf};

use simtest_core::{
    BuildEnv, Command, ConfigResolver, DefinitionLoader, HandlerOutcome, Invocation,
    ModuleResolver, ResolveError, SpawnedProcesses, Target, CONFIG_FILENAME,
    DEFINITION_FILENAME,
};

fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, content).expect("write file");
}

/// Workspace with a config file adding `checks/` to the search order and a
/// handler module living there.
fn workspace() -> (tempfile::TempDir, PathBuf) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().canonicalize().expect("canonicalize");
    write(&root.join(CONFIG_FILENAME), "python_paths: [checks]\n");
    write(
        &root.join("checks/mychecks.yaml"),
        "handlers:\n  has_ok: { builtin: output_contains, params: { text: \"OK\" } }\n",
    );
    (tmp, root)
}

fn loader() -> DefinitionLoader {
    DefinitionLoader::new(ConfigResolver::new(), BuildEnv::default())
}

fn invoke(command: &Command, output: &str) -> HandlerOutcome {
    let Command::Checker {
        handler,
        args,
        kwargs,
        ..
    } = command
    else {
        panic!("expected a checker command");
    };
    let target = Target::default();
    handler
        .handler
        .invoke(&Invocation {
            output,
            workdir: Path::new("/"),
            target: &target,
            args,
            kwargs,
            spawned: &SpawnedProcesses::new(),
        })
        .expect("handler runs")
}

/// Test: a full tree with targets, nested testsets and imports.
#[test]
fn test_load_nested_tree_with_import() {
    let (_tmp, root) = workspace();
    write(
        &root.join(DEFINITION_FILENAME),
        r#"
name: soc
targets:
  - name: rv32
    properties: { chip: pulp }
  - name: rv64
    skip: "not ready"
testsets:
  - name: cluster
    tests:
      - name: dma
        commands:
          - { kind: shell, name: run, cmd: "echo OK" }
imports: [drivers/testset.yaml]
tests:
  - name: boot
    commands:
      - { kind: shell, cmd: "make run chip={chip}" }
      - { kind: check, name: verify, handler: "mychecks::has_ok" }
    benchmarks:
      - { pattern: 'Cycles: (\d+)', metric: cycles, description: "total cycles" }
"#,
    );
    write(
        &root.join("drivers").join(DEFINITION_FILENAME),
        "name: drivers\ntests:\n  - name: uart\n    commands:\n      - { kind: shell, cmd: \"true\", retval: 0 }\n",
    );

    let mut resolver = ModuleResolver::new();
    let soc = loader().load(&mut resolver, &root.join(DEFINITION_FILENAME));

    assert!(soc.load_error().is_none(), "unexpected load error: {:?}", soc.load_error());
    assert_eq!(soc.name(), Some("soc"));
    assert_eq!(soc.targets().len(), 2);
    assert_eq!(soc.testsets().len(), 2);
    assert_eq!(soc.testsets()[0].tests()[0].full_name(), "soc:cluster:dma");

    let drivers = &soc.testsets()[1];
    assert_eq!(drivers.tests()[0].full_name(), "soc:drivers:uart");
    assert_eq!(drivers.path(), root.join("drivers"));

    let boot = &soc.tests()[0];
    assert_eq!(boot.full_name(), "soc:boot");
    assert_eq!(boot.commands()[0].name(), "shell");
    assert_eq!(boot.commands()[1].name(), "verify");
    assert_eq!(boot.benchmarks().len(), 1);
    assert!(invoke(&boot.commands()[1], "all OK").passed);
    assert!(!invoke(&boot.commands()[1], "all KO").passed);
}

/// Test: the window is closed after loading; handlers that only exist in
/// window paths no longer resolve.
#[test]
fn test_search_order_restored_after_load() {
    let (_tmp, root) = workspace();
    write(
        &root.join(DEFINITION_FILENAME),
        "tests:\n  - name: t\n    commands:\n      - { kind: call, handler: \"mychecks::has_ok\" }\n",
    );

    let base = vec![PathBuf::from("/opt/simtest/modules")];
    let mut resolver = ModuleResolver::with_base(base.clone());
    let testset = loader().load(&mut resolver, &root.join(DEFINITION_FILENAME));

    assert!(testset.load_error().is_none());
    assert_eq!(resolver.search_order(), base.as_slice());
    assert!(matches!(
        resolver.resolve("mychecks::has_ok"),
        Err(ResolveError::ModuleNotFound { .. })
    ));
}

/// Test: the search order is restored even when the build fails.
#[test]
fn test_search_order_restored_after_failure() {
    let (_tmp, root) = workspace();
    write(
        &root.join(DEFINITION_FILENAME),
        "tests:\n  - name: t\n    commands:\n      - { kind: call, handler: \"missing::nope\" }\n",
    );

    let mut resolver = ModuleResolver::new();
    let testset = loader().load(&mut resolver, &root.join(DEFINITION_FILENAME));

    assert!(testset.load_error().is_some());
    assert!(resolver.search_order().is_empty());
}

/// Test: a failing build keeps what was declared before the error.
#[test]
fn test_partial_build_is_kept() {
    let (_tmp, root) = workspace();
    write(
        &root.join(DEFINITION_FILENAME),
        r#"
name: partial
tests:
  - name: first
    commands: [{ kind: shell, cmd: "true" }]
  - name: second
    commands: [{ kind: check, handler: "mychecks::unknown" }]
  - name: third
    commands: [{ kind: shell, cmd: "true" }]
"#,
    );

    let mut resolver = ModuleResolver::new();
    let testset = loader().load(&mut resolver, &root.join(DEFINITION_FILENAME));

    let error = testset.load_error().expect("load error recorded");
    assert!(error.contains("unknown"), "error was: {error}");
    assert_eq!(testset.name(), Some("partial"));
    assert_eq!(testset.test_count(), 1);
}

/// Test: a missing import only breaks the imported child.
#[test]
fn test_missing_import_is_isolated() {
    let (_tmp, root) = workspace();
    write(
        &root.join(DEFINITION_FILENAME),
        "name: top\nimports: [gone/testset.yaml]\ntests:\n  - name: ok\n    commands: [{ kind: shell, cmd: \"true\" }]\n",
    );

    let mut resolver = ModuleResolver::new();
    let top = loader().load(&mut resolver, &root.join(DEFINITION_FILENAME));

    assert!(top.load_error().is_none());
    assert_eq!(top.tests().len(), 1);
    assert_eq!(top.testsets().len(), 1);
    let child = &top.testsets()[0];
    assert!(child.load_error().is_some());
    assert_eq!(child.display_name(), "top");
}

/// Test: `when` guards see the platform and command-line properties.
#[test]
fn test_when_guards() {
    let (_tmp, root) = workspace();
    write(
        &root.join(DEFINITION_FILENAME),
        r#"
tests:
  - name: everywhere
    commands: [{ kind: shell, cmd: "true" }]
  - name: rtl_only
    when: { platforms: [rtl] }
  - name: big_only
    when: { properties: { size: big } }
"#,
    );

    let mut env = BuildEnv::default();
    env.properties.insert("size".to_string(), "big".to_string());
    let loader = DefinitionLoader::new(ConfigResolver::new(), env);
    let mut resolver = ModuleResolver::new();
    let testset = loader.load(&mut resolver, &root.join(DEFINITION_FILENAME));

    let names: Vec<&str> = testset.tests().iter().map(|t| t.name()).collect();
    assert_eq!(names, vec!["everywhere", "big_only"]);
}

/// Test: syntax errors carry the line number.
#[test]
fn test_syntax_error_is_recorded() {
    let (_tmp, root) = workspace();
    write(&root.join(DEFINITION_FILENAME), "name: [unterminated\n");

    let mut resolver = ModuleResolver::new();
    let testset = loader().load(&mut resolver, &root.join(DEFINITION_FILENAME));
    let error = testset.load_error().expect("load error");
    assert!(error.contains(DEFINITION_FILENAME));
}

/// Test: native handlers registered by the embedder are resolvable.
#[test]
fn test_native_handler_from_definition() {
    let (_tmp, root) = workspace();
    write(
        &root.join(DEFINITION_FILENAME),
        "tests:\n  - name: t\n    commands: [{ kind: check, handler: \"native::always\", args: [1] }]\n",
    );

    let mut resolver = ModuleResolver::new();
    resolver.register_native(
        "native",
        "always",
        std::sync::Arc::new(|inv: &Invocation<'_>| -> anyhow::Result<HandlerOutcome> {
            Ok(if inv.args.len() == 1 {
                HandlerOutcome::pass()
            } else {
                HandlerOutcome::fail("wrong arity")
            })
        }),
    );
    let testset = loader().load(&mut resolver, &root.join(DEFINITION_FILENAME));
    assert!(testset.load_error().is_none());
    assert!(invoke(&testset.tests()[0].commands()[0], "").passed);
}

fn shell_lines(commands: &[Command]) -> Vec<(String, String, i32)> {
    commands
        .iter()
        .filter_map(|c| match c {
            Command::Shell { name, cmd, retval } => Some((name.clone(), cmd.clone(), *retval)),
            _ => None,
        })
        .collect()
}

/// Test: preset kinds expand into clean/build/run commands around a
/// per-test build directory, followed by the checker.
#[test]
fn test_preset_kinds_generate_commands() {
    let (_tmp, root) = workspace();
    write(
        &root.join(DEFINITION_FILENAME),
        r#"
name: soc
tests:
  - name: fft
    kind: make
    flags: "CHIP=pulp"
    retval: 2
    checker: "builtin::output_contains"
  - name: hello
    kind: gvrun
  - name: power
    kind: sdk_netlist_power
"#,
    );

    let soc = loader().load(&mut ModuleResolver::new(), &root.join(DEFINITION_FILENAME));
    assert!(soc.load_error().is_none(), "unexpected load error: {:?}", soc.load_error());

    let fft = soc.tests()[0].commands();
    let shells = shell_lines(fft);
    let build = format!("build={}/build/{{config}}/fft", root.display());
    assert_eq!(shells.len(), 3);
    assert_eq!(
        shells[0],
        ("clean".to_string(), format!("make clean CHIP=pulp {{flags}} platform={{platform}} {build}"), 0)
    );
    assert_eq!(shells[1].0, "build");
    assert_eq!(shells[2].0, "run");
    assert!(shells[2].1.starts_with("make run CHIP=pulp"));
    assert_eq!(shells[2].2, 2);
    assert_eq!(fft.len(), 4);
    assert_eq!(fft[3].name(), "check");

    let hello = shell_lines(soc.tests()[1].commands());
    assert_eq!(
        hello[2].1,
        "gvrun --target {target} {flags} --platform={platform} --build-dir=build/{target}/hello run"
    );

    let power: Vec<String> = soc.tests()[2].commands().iter().map(|c| c.name().to_string()).collect();
    assert_eq!(power, vec!["clean", "build", "run", "power_gen", "power_copy"]);
    let power_shells = shell_lines(soc.tests()[2].commands());
    assert!(power_shells[0].1.starts_with("posbuild clean {flags} --platform={platform} --build=build/{config}/power"));
}

/// Test: with a shared build root, make tests build under its `tests/`
/// tree at the test's hierarchical path.
#[test]
fn test_preset_build_root() {
    let (_tmp, root) = workspace();
    write(
        &root.join(DEFINITION_FILENAME),
        "name: soc\ntestsets:\n  - name: cluster\n    tests:\n      - { name: dma, kind: make }\n",
    );
    let env = BuildEnv {
        build_root: Some(PathBuf::from("/work")),
        ..BuildEnv::default()
    };
    let loader = DefinitionLoader::new(ConfigResolver::new(), env);
    let soc = loader.load(&mut ModuleResolver::new(), &root.join(DEFINITION_FILENAME));

    let dma = shell_lines(soc.testsets()[0].tests()[0].commands());
    assert!(dma[0].1.ends_with("build=/work/tests/soc/cluster/dma"), "{}", dma[0].1);
}

/// Test: `flags` without a preset kind is a load error.
#[test]
fn test_flags_without_kind_rejected() {
    let (_tmp, root) = workspace();
    write(
        &root.join(DEFINITION_FILENAME),
        "name: soc\ntests:\n  - { name: t, flags: \"-O2\", commands: [{ kind: shell, cmd: \"true\" }] }\n",
    );
    let soc = loader().load(&mut ModuleResolver::new(), &root.join(DEFINITION_FILENAME));
    let error = soc.load_error().expect("load error recorded");
    assert!(error.contains("preset"), "{error}");
}
