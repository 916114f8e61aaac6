use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use tempfile::TempDir;
use tlog_core::storage::{queue_key, SqliteArea, StorageKind, StorageManager};
use tlog_core::{Event, EventBatch, EventData, PersistedPayload};

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn storage_path(&self) -> PathBuf {
        self.xdg_data.join("tlog/storage.db")
    }

    fn write_config(&self, contents: &str) {
        let path = self.xdg_config.join("tlog/config.toml");
        fs::create_dir_all(path.parent().expect("config has a parent"))
            .expect("failed to create config dir");
        fs::write(path, contents).expect("failed to write config");
    }

    fn seed_persisted_payload(&self, project: &str, timestamp: i64) {
        let area = SqliteArea::open(&self.storage_path()).expect("failed to open storage");
        let storage = StorageManager::new(Some(Box::new(area)), None);
        let payload = PersistedPayload {
            batch: EventBatch {
                user_id: "u-1".to_string(),
                session_id: "1-abcdefghi".to_string(),
                device: Default::default(),
                events: vec![Event {
                    id: "e-1".to_string(),
                    timestamp,
                    page_url: "https://shop.example/".to_string(),
                    from_page_url: None,
                    data: EventData::SessionStart,
                }],
                global_metadata: None,
            },
            timestamp,
        };
        assert!(storage.set_json(StorageKind::Durable, &queue_key(project), &payload));
    }
}

fn run_tlog(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("tlog"));
    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute tlog: {e}"))
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn status_with_defaults() {
    let env = CliTestEnv::new();
    let output = run_tlog(&env, &["status"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let out = stdout(&output);
    assert!(out.contains("Project:  default"));
    assert!(out.contains("(not configured)"));
    assert!(out.contains("Pending:  (nothing persisted)"));
}

#[test]
fn verbose_mirrors_logs_to_stderr() {
    let env = CliTestEnv::new();
    let quiet = run_tlog(&env, &["status"]);
    assert!(!String::from_utf8_lossy(&quiet.stderr).contains("tlog starting"));

    let verbose = run_tlog(&env, &["--verbose", "status"]);
    assert!(verbose.status.success());
    assert!(String::from_utf8_lossy(&verbose.stderr).contains("tlog starting"));
}

#[test]
fn status_reports_persisted_payload() {
    let env = CliTestEnv::new();
    env.write_config("[project]\nid = \"shop\"\n");
    env.seed_persisted_payload("shop", now_ms() - 5_000);

    let output = run_tlog(&env, &["status"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("1 event(s) persisted"));
}

#[test]
fn send_requires_endpoint() {
    let env = CliTestEnv::new();
    let output = run_tlog(&env, &["send", "signup"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("collector.endpoint"));
}

#[test]
fn recover_discards_stale_payload_without_sending() {
    let env = CliTestEnv::new();
    // Nothing listens on the discard port; a send attempt would be retained, not discarded
    env.write_config(
        "[project]\nid = \"shop\"\n\n[collector]\nendpoint = \"http://127.0.0.1:9/events\"\ntimeout_secs = 1\n",
    );
    env.seed_persisted_payload("shop", now_ms() - 3 * 60 * 60 * 1000);

    let output = run_tlog(&env, &["recover"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("stale"));

    let output = run_tlog(&env, &["status"]);
    assert!(stdout(&output).contains("Pending:  (nothing persisted)"));
}

#[test]
fn invalid_config_is_reported() {
    let env = CliTestEnv::new();
    env.write_config("[tracking]\nsampling_rate = 0.0\n");
    let output = run_tlog(&env, &["status"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("sampling_rate"));
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
