//! End-to-end bootstrap tests against a stub compiler driver.
//!
//! The stub records every invocation into `rustc.log`, dumps the `DEP_*`
//! and `CARGO_FEATURE_*` environment it received, and fabricates the
//! outputs a real rustc would produce: an `.rlib` for lib targets and an
//! executable for bin targets. Build-script binaries it fabricates emit a
//! fixed set of `cargo:` directives, which lets the tests observe the whole
//! directive propagation chain without a real compiler.

use std::fs;
use std::path::{Path, PathBuf};

use boot_core::builder::BuildError;
use boot_core::{BootstrapOptions, bootstrap};
use tempfile::{TempDir, tempdir};

const TRIPLE: &str = "x86_64-unknown-linux-gnu";

const STUB_RUSTC: &str = r#"#!/bin/sh
# fake rustc: log the invocation, fabricate the expected outputs
out=""; name=""; ctype=""; extra=""
prev=""
for a in "$@"; do
  case "$prev" in
    --out-dir) out="$a" ;;
    --crate-name) name="$a" ;;
    --crate-type) ctype="$a" ;;
    -C) case "$a" in extra-filename=*) extra="${a#extra-filename=}" ;; esac ;;
  esac
  prev="$a"
done
echo "$name $*" >> "$out/rustc.log"
env | grep -E '^(DEP_|CARGO_FEATURE_)' | sed "s/^/$name /" >> "$out/rustc-env.log" || true
if [ "$ctype" = "lib" ]; then
  : > "$out/lib${name}${extra}.rlib"
else
  bin="$out/${name}${extra}"
  if [ "${name#build_script_}" != "$name" ]; then
    cat > "$bin" <<'EOF'
#!/bin/sh
echo "cargo:rustc-link-lib=foo"
echo "cargo:rustc-cfg=has_bar"
echo "cargo:include=/usr/include/x"
EOF
  else
    printf '#!/bin/sh\nexit 0\n' > "$bin"
  fi
  chmod +x "$bin"
fi
exit 0
"#;

struct Fixture {
    _tmp: TempDir,
    root_dir: PathBuf,
    cache_dir: PathBuf,
    out_dir: PathBuf,
    rustc: PathBuf,
}

fn write_stub(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

fn write_crate(dir: &Path, manifest: &str, files: &[(&str, &str)]) {
    fs::create_dir_all(dir.join("src")).unwrap();
    fs::write(dir.join("Cargo.toml"), manifest).unwrap();
    for (name, content) in files {
        fs::write(dir.join(name), content).unwrap();
    }
}

/// A three-crate graph: top -> demo-dep (with build script) -> base.
fn fixture() -> Fixture {
    let tmp = tempdir().unwrap();
    let root_dir = tmp.path().join("top");
    let cache_dir = tmp.path().join("cache");
    let out_dir = tmp.path().join("out");
    fs::create_dir_all(&out_dir).unwrap();

    write_crate(
        &root_dir,
        "[package]\nname = \"top\"\nversion = \"0.1.0\"\n\n[dependencies]\ndemo-dep = \"^1.0\"\n",
        &[("src/lib.rs", "")],
    );
    fs::write(
        root_dir.join("Cargo.lock"),
        r#"
[root]
name = "top"
version = "0.1.0"
dependencies = ["demo-dep 1.2.3"]

[[package]]
name = "demo-dep"
version = "1.2.3"
dependencies = ["base 0.3.0"]

[[package]]
name = "base"
version = "0.3.0"
"#,
    )
    .unwrap();

    write_crate(
        &cache_dir.join("demo-dep-1.2.3"),
        "[package]\nname = \"demo-dep\"\nversion = \"1.2.3\"\nbuild = \"build.rs\"\n\n[dependencies]\nbase = \"0.3\"\n",
        &[("src/lib.rs", ""), ("build.rs", "")],
    );
    write_crate(
        &cache_dir.join("base-0.3.0"),
        "[package]\nname = \"base\"\nversion = \"0.3.0\"\n",
        &[("src/lib.rs", "")],
    );

    let rustc = tmp.path().join("rustc");
    write_stub(&rustc, STUB_RUSTC);

    Fixture {
        _tmp: tmp,
        root_dir,
        cache_dir,
        out_dir,
        rustc,
    }
}

fn options(fixture: &Fixture) -> BootstrapOptions {
    BootstrapOptions {
        root_dir: fixture.root_dir.clone(),
        cache_dir: fixture.cache_dir.clone(),
        out_dir: fixture.out_dir.clone(),
        target: TRIPLE.to_string(),
        rustc: Some(fixture.rustc.clone()),
        blacklist: Vec::new(),
        optionals: Vec::new(),
    }
}

fn logged_compiles(out_dir: &Path) -> Vec<String> {
    fs::read_to_string(out_dir.join("rustc.log"))
        .unwrap_or_default()
        .lines()
        .map(ToString::to_string)
        .collect()
}

#[test]
fn test_full_bootstrap_produces_artifacts() {
    let fixture = fixture();
    let outcome = bootstrap(options(&fixture)).unwrap();

    assert_eq!(outcome.name, "top");
    assert!(fixture.out_dir.join("libtop-0_1_0.rlib").is_file());
    assert!(fixture.out_dir.join("libdemo_dep-1_2_3.rlib").is_file());
    assert!(fixture.out_dir.join("libbase-0_3_0.rlib").is_file());
    assert!(
        fixture
            .out_dir
            .join("build_script_demo_dep-1_2_3")
            .is_file()
    );
}

#[test]
fn test_topological_compile_order() {
    let fixture = fixture();
    bootstrap(options(&fixture)).unwrap();

    let log = logged_compiles(&fixture.out_dir);
    let position = |name: &str| {
        log.iter()
            .position(|line| line.starts_with(&format!("{name} ")))
            .unwrap_or_else(|| panic!("no compile logged for {name}"))
    };

    // every dependency compiles before its dependent
    assert!(position("base") < position("build_script_demo_dep"));
    assert!(position("build_script_demo_dep") < position("demo_dep"));
    assert!(position("demo_dep") < position("top"));
}

#[test]
fn test_second_run_spawns_nothing() {
    let fixture = fixture();
    bootstrap(options(&fixture)).unwrap();
    let first = logged_compiles(&fixture.out_dir).len();
    assert!(first > 0);

    bootstrap(options(&fixture)).unwrap();
    assert_eq!(
        logged_compiles(&fixture.out_dir).len(),
        first,
        "a populated target dir must not trigger any subprocess"
    );
}

#[test]
fn test_build_script_directives_reach_dependents() {
    let fixture = fixture();
    bootstrap(options(&fixture)).unwrap();

    let log = logged_compiles(&fixture.out_dir);
    let line_for = |name: &str| {
        log.iter()
            .find(|line| line.starts_with(&format!("{name} ")))
            .unwrap_or_else(|| panic!("no compile logged for {name}"))
            .clone()
    };

    // the crate's own lib compile picks up the link and cfg flags
    let demo = line_for("demo_dep");
    assert!(demo.contains("-l foo"), "{demo}");
    assert!(demo.contains("--cfg has_bar"), "{demo}");

    // flags propagate upward to the dependent compile, which also binds
    // the dependency by its flattened lib name
    let top = line_for("top");
    assert!(top.contains("-l foo"), "{top}");
    let out_dir = fixture.out_dir.canonicalize().unwrap();
    assert!(
        top.contains(&format!(
            "--extern demo_dep={}",
            out_dir.join("libdemo_dep-1_2_3.rlib").display()
        )),
        "{top}"
    );

    // metadata directives become DEP_<PKG>_<KEY> in the dependent's env,
    // and rustc-cfg sets CARGO_FEATURE_* for the crate's own compiles
    let env_log = fs::read_to_string(fixture.out_dir.join("rustc-env.log")).unwrap();
    assert!(
        env_log.contains("top DEP_DEMO_INCLUDE=/usr/include/x"),
        "{env_log}"
    );
    assert!(
        env_log.contains("demo_dep CARGO_FEATURE_HAS_BAR=1"),
        "{env_log}"
    );
}

#[test]
fn test_compile_failure_aborts() {
    let fixture = fixture();
    write_stub(&fixture.rustc, "#!/bin/sh\nexit 1\n");

    let err = bootstrap(options(&fixture)).unwrap_err();
    let build_err = err
        .downcast_ref::<BuildError>()
        .unwrap_or_else(|| panic!("expected a build error, got {err:?}"));
    match build_err {
        BuildError::BuildFailed { krate, code, .. } => {
            // the deepest dependency builds first and fails first
            assert_eq!(krate, "base-0.3.0");
            assert_eq!(*code, Some(1));
        }
        other => panic!("expected BuildFailed, got {other}"),
    }
}
