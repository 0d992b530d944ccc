use chrono::Utc;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn scratch_root(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "exdir_cli_{}_{}_{}",
        label,
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}

fn exdir(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_exdir"))
        .arg("--root")
        .arg(root)
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("EXDIR_ZFILL")
        .env_remove("EXDIR_AUTOMARK")
        .env_remove("EXDIR_INTERACTIVE")
        .output()
        .expect("spawn exdir")
}

fn run_dirs(dir: PathBuf) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn init_then_check_reports_an_empty_root() {
    let root = scratch_root("init");
    let out = exdir(&root, &["init"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    for dir in ["runs", "tmp", "fails", "index", "marked"] {
        assert!(root.join(dir).is_dir(), "missing {}", dir);
    }

    let out = exdir(&root, &["check", "--json"]);
    assert!(out.status.success());
    let payload: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(payload["runs"], 0);
    assert_eq!(payload["next_id"], 1);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn check_fails_on_a_missing_root() {
    let root = scratch_root("missing");
    let out = exdir(&root, &["check", "--json"]);
    assert!(!out.status.success());
    let payload: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(payload["error"]["code"], "invalid_root");
    assert!(!root.exists());
}

#[cfg(unix)]
#[test]
fn run_records_params_and_exports_the_run_dir() {
    let root = scratch_root("run");
    let out = exdir(
        &root,
        &[
            "run", "--set", "lr=0.1", "--set", "model=mlp", "--tag", "smoke", "--", "sh", "-c",
            "echo done > \"$EXDIR_RUN_DIR/out.txt\"",
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let names = run_dirs(root.join("runs"));
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("000001-") && names[0].ends_with("-smoke"));
    let run_dir = root.join("runs").join(&names[0]);
    assert_eq!(fs::read_to_string(run_dir.join("out.txt")).expect("out"), "done\n");
    let record = fs::read_to_string(run_dir.join("params.yaml")).expect("record");
    assert!(record.contains("lr: 0.1"), "{}", record);
    assert!(record.contains("model: mlp"), "{}", record);
    assert!(root.join("index").join(format!("{}.yaml", names[0])).exists());
    let _ = fs::remove_dir_all(root);
}

#[cfg(unix)]
#[test]
fn failing_command_is_quarantined() {
    let root = scratch_root("fail");
    let out = exdir(&root, &["run", "--json", "--", "sh", "-c", "exit 3"]);
    assert!(!out.status.success());
    let payload: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(payload["error"]["code"], "run_failed");

    assert!(run_dirs(root.join("runs")).is_empty());
    assert!(run_dirs(root.join("index")).is_empty());
    let failed = run_dirs(root.join("fails"));
    assert_eq!(failed.len(), 1);
    let trace = fs::read_to_string(root.join("fails").join(&failed[0]).join("traceback.txt"))
        .expect("trace");
    assert!(trace.contains("exit status: 3"), "{}", trace);

    let out = exdir(&root, &["next-id"]);
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "2");
    let _ = fs::remove_dir_all(root);
}

#[cfg(unix)]
#[test]
fn concurrent_processes_get_distinct_ids() {
    const PROCESSES: usize = 8;
    let root = scratch_root("concurrent");
    assert!(exdir(&root, &["init"]).status.success());

    let handles: Vec<_> = (0..PROCESSES)
        .map(|_| {
            let root = root.clone();
            std::thread::spawn(move || exdir(&root, &["run", "--json", "--", "true"]))
        })
        .collect();
    let mut ids = BTreeSet::new();
    for handle in handles {
        let out = handle.join().expect("thread");
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        let payload: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
        ids.insert(payload["run"]["run_id"].as_u64().expect("run id"));
    }
    let expected: BTreeSet<u64> = (1..=PROCESSES as u64).collect();
    assert_eq!(ids, expected);
    assert_eq!(run_dirs(root.join("runs")).len(), PROCESSES);
    let _ = fs::remove_dir_all(root);
}

#[cfg(unix)]
#[test]
fn mark_warns_about_missing_runs_but_succeeds() {
    let root = scratch_root("mark");
    assert!(exdir(&root, &["run", "--", "true"]).status.success());

    let out = exdir(&root, &["mark", "best", "1", "2"]);
    assert!(out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("runs {2} were not found"), "{}", stderr);
    let links = run_dirs(root.join("marked").join("best"));
    assert_eq!(links.len(), 1);

    let out = exdir(&root, &["mark", "runs", "1"]);
    assert!(!out.status.success());
    assert!(!root.join("marked").join("runs").exists());

    let out = exdir(&root, &["info", "--source", "best", "--json"]);
    let payload: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(payload["records"][0]["record"]["id"], 1);

    let out = exdir(&root, &["delete", "1", "--all"]);
    assert!(out.status.success());
    assert!(run_dirs(root.join("runs")).is_empty());
    assert!(run_dirs(root.join("marked").join("best")).is_empty());
    let _ = fs::remove_dir_all(root);
}
