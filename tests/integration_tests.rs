//! Integration tests for Anvil.
//!
//! The incremental scenarios drive the real binary against a scripted fake
//! compiler that journals every invocation, so the tests can assert exactly
//! which subprocesses ran.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A clang-shaped shell script: `--preprocess` expands `#include "..."`
/// against the declared include directories and records line markers,
/// `--compile` copies its input, linking concatenates the objects. Every
/// invocation appends a line to `$ANVIL_FAKE_LOG`.
const FAKE_COMPILER: &str = r##"#!/bin/sh
log="${ANVIL_FAKE_LOG:?}"
mode=link
out=""
inputs=""
includes=""
prev=""
for a in "$@"; do
  case "$prev" in
    -o) out="$a"; prev=""; continue;;
    --include-directory) includes="$includes $a"; prev=""; continue;;
    --for-linker) inputs="$inputs $a"; prev=""; continue;;
  esac
  case "$a" in
    --preprocess) mode=preprocess;;
    --compile|--assemble) mode=compile;;
    -o|--include-directory|--for-linker) prev="$a";;
    -*) ;;
    *) inputs="$inputs $a";;
  esac
done
src=$(echo $inputs | awk '{print $1}')
echo "$mode $(basename "$src")" >> "$log"
case "$mode" in
  preprocess)
    {
      echo "# 1 \"$src\""
      while IFS= read -r line; do
        case "$line" in
          '#include "'*'"')
            name=${line#\#include \"}
            name=${name%\"}
            found=""
            for d in $includes; do
              if [ -f "$d/$name" ]; then found="$d/$name"; break; fi
            done
            if [ -n "$found" ]; then
              echo "# 1 \"$found\" 1"
              cat "$found"
              echo "# 2 \"$src\" 2"
            else
              echo "$line"
            fi
            ;;
          *) echo "$line";;
        esac
      done < "$src"
    } > "$out"
    ;;
  compile)
    cat "$src" > "$out"
    ;;
  link)
    cat $inputs > "$out"
    ;;
esac
exit 0
"##;

struct Sandbox {
    dir: TempDir,
    compiler: PathBuf,
    log: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let compiler = dir.path().join("fake-compiler.sh");
        write_script(&compiler, FAKE_COMPILER);
        let log = dir.path().join("invocations.log");
        Self { dir, compiler, log }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, rel: &str, content: &str) {
        let full = self.dir.path().join(rel);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    fn anvil(&self, goals: &[&str]) -> Command {
        self.anvil_with(&self.compiler, goals)
    }

    fn anvil_with(&self, compiler: &Path, goals: &[&str]) -> Command {
        let mut cmd = Command::cargo_bin("anvil").unwrap();
        cmd.current_dir(self.dir.path())
            .env("ANVIL_FAKE_LOG", &self.log)
            .arg("proj")
            .args(goals)
            .arg("--no-lld")
            .arg("--compiler")
            .arg(compiler);
        cmd
    }

    /// Invocation journal since the last `reset_log`, one line per
    /// subprocess.
    fn log_lines(&self) -> Vec<String> {
        match fs::read_to_string(&self.log) {
            Ok(text) => text.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn reset_log(&self) {
        let _ = fs::remove_file(&self.log);
    }
}

/// Step past coarse filesystem timestamp granularity before modifying
/// sources between runs.
fn settle() {
    std::thread::sleep(std::time::Duration::from_millis(30));
}

fn write_script(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }
}

fn simple_project(sandbox: &Sandbox) {
    sandbox.write(
        "proj/project.toml",
        r#"
name = "app"

[[sources]]
path = "src"
mains = ["main.cpp"]
"#,
    );
    sandbox.write(
        "proj/src/main.cpp",
        "#include \"util.h\"\nint main() { return util(); }\n",
    );
    sandbox.write("proj/src/aside.cpp", "int aside() { return 2; }\n");
    sandbox.write("proj/src/util.h", "int util();\n");
}

mod cli_basics {
    use super::*;

    #[test]
    fn help_and_version() {
        Command::cargo_bin("anvil")
            .unwrap()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Incremental content-addressed"));
        Command::cargo_bin("anvil")
            .unwrap()
            .arg("--version")
            .assert()
            .success();
    }

    #[test]
    fn missing_project_is_a_clean_error() {
        let sandbox = Sandbox::new();
        sandbox
            .anvil(&["main.exe"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("project manifest"));
    }

    #[test]
    fn malformed_manifest_is_reported() {
        let sandbox = Sandbox::new();
        sandbox.write("proj/project.toml", "sources = \"oops\"\n");
        sandbox
            .anvil(&[])
            .assert()
            .failure()
            .stderr(predicate::str::contains("parse"));
    }
}

mod incremental_scenarios {
    use super::*;

    #[test]
    fn first_build_runs_the_whole_pipeline() {
        let sandbox = Sandbox::new();
        simple_project(&sandbox);

        sandbox.anvil(&["main.exe"]).assert().success();

        let lines = sandbox.log_lines();
        let preprocess = lines.iter().filter(|l| l.starts_with("preprocess")).count();
        let compile = lines.iter().filter(|l| l.starts_with("compile")).count();
        let link = lines.iter().filter(|l| l.starts_with("link")).count();
        assert_eq!(preprocess, 2, "log: {lines:?}");
        assert_eq!(compile, 2, "log: {lines:?}");
        assert_eq!(link, 1, "log: {lines:?}");

        let exe = sandbox.path().join("bin/main.exe");
        assert!(exe.exists());
        let linked = fs::read_to_string(exe).unwrap();
        assert!(linked.contains("int main()"));
        assert!(linked.contains("int aside()"));
        // The preprocessed main unit carries the expanded header.
        assert!(linked.contains("int util();"));
    }

    #[test]
    fn unchanged_rebuild_spawns_nothing() {
        let sandbox = Sandbox::new();
        simple_project(&sandbox);

        sandbox.anvil(&["main.exe"]).assert().success();
        sandbox.reset_log();

        sandbox.anvil(&["main.exe"]).assert().success();
        assert_eq!(sandbox.log_lines(), Vec::<String>::new());
        assert!(sandbox.path().join("bin/main.exe").exists());
    }

    #[test]
    fn touching_an_included_header_rebuilds_the_pipeline() {
        let sandbox = Sandbox::new();
        simple_project(&sandbox);

        sandbox.anvil(&["main.exe"]).assert().success();
        sandbox.reset_log();
        settle();

        sandbox.write("proj/src/util.h", "int util();\nint util2();\n");
        sandbox.anvil(&["main.exe"]).assert().success();

        let lines = sandbox.log_lines();
        // Both preprocesses rerun (the include tree changed), but only the
        // unit that actually includes the header recompiles, and the link
        // follows it.
        assert!(
            lines.contains(&"preprocess main.cpp".to_string()),
            "log: {lines:?}"
        );
        assert!(
            lines.contains(&"compile main.cpp".to_string()),
            "log: {lines:?}"
        );
        assert!(lines.iter().any(|l| l.starts_with("link")), "log: {lines:?}");
        assert!(
            !lines.contains(&"compile aside.cpp".to_string()),
            "log: {lines:?}"
        );

        let linked = fs::read_to_string(sandbox.path().join("bin/main.exe")).unwrap();
        assert!(linked.contains("int util2();"));
    }

    #[test]
    fn adding_an_unused_header_stops_after_preprocess() {
        let sandbox = Sandbox::new();
        simple_project(&sandbox);

        sandbox.anvil(&["main.exe"]).assert().success();
        sandbox.reset_log();
        settle();

        sandbox.write("proj/src/unused.h", "int unused();\n");
        sandbox.anvil(&["main.exe"]).assert().success();

        let lines = sandbox.log_lines();
        // The include directory's set hash changed, so preprocess reruns;
        // its output is byte-identical, so nothing downstream does.
        assert!(!lines.is_empty(), "expected preprocess to rerun");
        assert!(
            lines.iter().all(|l| l.starts_with("preprocess")),
            "log: {lines:?}"
        );
    }

    #[test]
    fn editing_a_source_rebuilds_only_its_unit() {
        let sandbox = Sandbox::new();
        simple_project(&sandbox);

        sandbox.anvil(&["main.exe"]).assert().success();
        sandbox.reset_log();
        settle();

        sandbox.write("proj/src/aside.cpp", "int aside() { return 3; }\n");
        sandbox.anvil(&["main.exe"]).assert().success();

        let lines = sandbox.log_lines();
        assert!(
            lines.contains(&"preprocess aside.cpp".to_string()),
            "log: {lines:?}"
        );
        assert!(
            lines.contains(&"compile aside.cpp".to_string()),
            "log: {lines:?}"
        );
        assert!(
            !lines.contains(&"compile main.cpp".to_string()),
            "log: {lines:?}"
        );
        assert!(lines.iter().any(|l| l.starts_with("link")), "log: {lines:?}");
    }

    #[test]
    fn no_activated_goal_builds_nothing_and_lists_goals() {
        let sandbox = Sandbox::new();
        simple_project(&sandbox);

        sandbox
            .anvil(&[])
            .assert()
            .success()
            .stderr(predicate::str::contains("main.exe"));
        assert_eq!(sandbox.log_lines(), Vec::<String>::new());
        assert!(!sandbox.path().join("bin/main.exe").exists());
    }

    #[test]
    fn unknown_goal_warns_but_succeeds() {
        let sandbox = Sandbox::new();
        simple_project(&sandbox);

        sandbox
            .anvil(&["ghost.exe"])
            .assert()
            .success()
            .stderr(predicate::str::contains("unused goal"));
        assert_eq!(sandbox.log_lines(), Vec::<String>::new());
    }

    #[test]
    fn journal_is_written_next_to_the_objects() {
        let sandbox = Sandbox::new();
        simple_project(&sandbox);
        sandbox.anvil(&["main.exe"]).assert().success();

        let journal = sandbox.path().join("obj/anvil.json");
        let text = fs::read_to_string(journal).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value.get("persistence").is_some());
        assert!(value.get("delta").is_some());
        // Witness records sit under the lock registry, keyed by owner.
        assert!(value["files"].get("cxx").is_some());
        assert!(value["delta"]["counter"].as_u64().unwrap() > 0);
    }

    #[test]
    fn sequential_mode_produces_the_same_result() {
        let sandbox = Sandbox::new();
        simple_project(&sandbox);
        sandbox
            .anvil(&["main.exe"])
            .arg("--sequential")
            .assert()
            .success();
        assert!(sandbox.path().join("bin/main.exe").exists());
    }
}

mod dependent_projects {
    use super::*;

    fn two_projects(sandbox: &Sandbox) {
        sandbox.write(
            "lib/project.toml",
            r#"
name = "lib"

[[sources]]
path = "src"
mains = []
"#,
        );
        sandbox.write("lib/src/util.cpp", "int util() { return 1; }\n");
        sandbox.write("lib/src/util.h", "int util();\n");

        sandbox.write(
            "proj/project.toml",
            r#"
name = "app"
dependencies = ["../lib"]

[[sources]]
path = "src"
"#,
        );
        sandbox.write(
            "proj/src/main.cpp",
            "#include \"util.h\"\nint main() { return util(); }\n",
        );
    }

    #[test]
    fn dependency_objects_and_includes_flow_into_the_link() {
        let sandbox = Sandbox::new();
        two_projects(&sandbox);

        sandbox.anvil(&["main.exe"]).assert().success();

        let linked = fs::read_to_string(sandbox.path().join("bin/main.exe")).unwrap();
        // The dependency's include resolved, and its object was linked in.
        assert!(linked.contains("int util();"));
        assert!(linked.contains("int util() { return 1; }"));
    }

    #[test]
    fn touching_the_dependency_rebuilds_the_dependent_link() {
        let sandbox = Sandbox::new();
        two_projects(&sandbox);

        sandbox.anvil(&["main.exe"]).assert().success();
        sandbox.reset_log();
        settle();

        sandbox.write("lib/src/util.cpp", "int util() { return 9; }\n");
        sandbox.anvil(&["main.exe"]).assert().success();

        let lines = sandbox.log_lines();
        assert!(
            lines.contains(&"compile util.cpp".to_string()),
            "log: {lines:?}"
        );
        assert!(lines.iter().any(|l| l.starts_with("link")), "log: {lines:?}");
    }
}

mod failures {
    use super::*;

    #[test]
    fn a_failing_command_fails_the_build_with_its_stderr() {
        let sandbox = Sandbox::new();
        simple_project(&sandbox);
        write_script(
            &sandbox.compiler,
            "#!/bin/sh\necho 'boom: bad source' >&2\nexit 2\n",
        );

        sandbox
            .anvil(&["main.exe"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("boom: bad source"));
    }

    #[test]
    fn a_noisy_but_successful_command_reruns_next_time() {
        let sandbox = Sandbox::new();
        simple_project(&sandbox);
        // Wrap the compiler so every invocation also warns on stderr.
        let noisy = sandbox.path().join("noisy.sh");
        write_script(
            &noisy,
            &format!(
                "#!/bin/sh\necho 'warning: noisy' >&2\nexec {} \"$@\"\n",
                sandbox.compiler.display()
            ),
        );

        sandbox.anvil_with(&noisy, &["main.exe"]).assert().success();
        sandbox.reset_log();

        // Nothing changed, but every step was unstable and runs again.
        sandbox.anvil_with(&noisy, &["main.exe"]).assert().success();
        assert!(!sandbox.log_lines().is_empty());
    }
}
